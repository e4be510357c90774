//! This crate provides the building blocks to report row changes of GeoPackage feature tables
//! from sqlite triggers to native code, which is where a spatial (rtree) index would be kept
//! up to date.
//!
//! The crate is agnostic over the implementation of the sqlite connection. An implementation
//! is provided for `rusqlite` which is enabled by default.
//!
//! # Basic example
//!
//! ```rust
//! use gpkg_notifier::connection::Connection;
//! use gpkg_notifier::notifier::{ChangeAction, Notifier, NotifierConfig};
//! use gpkg_notifier::schema::ContentsEntry;
//!
//! let notifier = Notifier::new(NotifierConfig::default());
//! let sql_connection = rusqlite::Connection::open_in_memory().unwrap();
//! let mut connection = Connection::new(sql_connection, notifier).unwrap();
//! // Create the contents table and describe the feature table.
//! connection.create_contents_table().unwrap();
//! connection.add_contents(&ContentsEntry {
//!     table_name: "roads",
//!     data_type: "features",
//!     identifier: "roads",
//!     description: "",
//!     bounds: [0.0, 0.0, 1.0, 1.0],
//!     srs_id: 4326,
//!     gpkg_version: 2,
//! }).unwrap();
//! // Create the feature table and report inserts.
//! connection.create_feature_table("roads").unwrap();
//! connection.install_change_triggers("roads", &[ChangeAction::Insert]).unwrap();
//! connection.execute("INSERT INTO roads (feature_id, envelope) VALUES (1, x'00')", ()).unwrap();
//! connection.execute("INSERT INTO roads (feature_id, envelope) VALUES (2, x'01')", ()).unwrap();
//! // The metadata of 'roads' was queried once and is now cached.
//! let stats = connection.notifier().stats();
//! assert_eq!(stats.invocations, 2);
//! assert_eq!(stats.lookups, 1);
//! ```
//!
//! # How it works
//!
//! Creating a [`connection::Connection`] registers the scalar function
//! [`schema::CHANGE_FUNCTION_NAME`] on the sqlite connection. The triggers installed with
//! [`connection::Connection::install_change_triggers`] call it with the table name, the action
//! and the envelope of the affected row.
//!
//! The function hands the change to the [`notifier::Notifier`], which resolves the `srs_id` and
//! `gpkg_version` of the table from `gpkg_contents`. The result is cached for the lifetime of
//! the notifier, so every table is looked up at most once per connection.
//!
//! # Errors
//!
//! A change with a missing table name or action, or for a table without a contents entry, is an
//! error. Depending on [`notifier::ErrorPolicy`] it either aborts the statement that fired the
//! trigger or is logged and returned as a status code.
//!
//! # Custom Integrations
//!
//! [`connection::GeoPackageConnection`] and [`notifier::ContentInfoSource`] are everything that
//! is required to hook another connection type up to a [`notifier::Notifier`].

pub mod connection;
pub mod notifier;
pub mod schema;
