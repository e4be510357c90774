use crate::notifier::{ChangeAction, Notifier};
use crate::schema::{
    create_contents_table_query, create_feature_table_query, create_rtree_index_query,
    create_trigger_query, drop_trigger_query, ContentsEntry,
};
use std::error::Error;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::debug;

#[cfg(feature = "rusqlite")]
pub mod rusqlite;

/// Defines an implementation capable of executing SQL statement on a sqlite connection.
///
/// This is required so we can set up the GeoPackage tables and the change triggers.
pub trait SqlExecutor {
    type Error: Error;

    /// Execute an sql statement which does not return any rows.
    ///
    /// # Errors
    ///
    /// Should return error if the query failed.
    fn sql_execute(&mut self, query: &str) -> Result<(), Self::Error>;
}

/// Defines a transaction on a sqlite connection.
pub trait SqlTransaction: SqlExecutor {
    /// Commit the current transaction.
    ///
    /// # Errors
    ///
    /// Should return an error if a transaction can't be committed.
    fn sql_commit_transaction(self) -> Result<(), Self::Error>;
}

/// Defines a sqlite connection on which feature changes can be reported to a [`Notifier`].
#[allow(clippy::module_name_repetitions)]
pub trait GeoPackageConnection: SqlExecutor {
    /// Create a new transaction for the connection.
    ///
    /// # Errors
    ///
    /// Should return an error if the transaction can't be created.
    fn sql_transaction(
        &mut self,
    ) -> Result<impl SqlTransaction<Error = Self::Error> + '_, Self::Error>;

    /// Register the change function invoked by the triggers so that it reports to `notifier`.
    ///
    /// The function looks up table metadata on this connection.
    ///
    /// # Errors
    ///
    /// Should return an error if the function could not be registered.
    fn register_change_function(&self, notifier: Arc<Notifier>) -> Result<(), Self::Error>;

    /// Insert `entry` into the contents table.
    ///
    /// # Errors
    ///
    /// Should return an error if the row could not be inserted.
    fn insert_contents(&mut self, entry: &ContentsEntry<'_>) -> Result<(), Self::Error>;
}

/// Ties a sqlite connection to the [`Notifier`] receiving the changes of its feature tables.
///
/// Creating the connection registers the change function. Triggers installed with
/// [`Connection::install_change_triggers()`] call that function whenever a row of the
/// feature table changes. The original type can still be accessed as [`Connection`]
/// implements both [`Deref`] and [`DerefMut`].
///
/// The metadata cache lives in the notifier and is therefore scoped to this connection.
///
/// # Example
///
/// ```rust
/// use gpkg_notifier::connection::{Connection, GeoPackageConnection};
/// use gpkg_notifier::notifier::{ChangeAction, Notifier, NotifierConfig};
///
/// pub fn notify_changes<C: GeoPackageConnection>(connection: C) {
///     let notifier = Notifier::new(NotifierConfig::default());
///     let mut connection = Connection::new(connection, notifier).unwrap();
///
///     connection.create_feature_table("roads").unwrap();
///     connection
///         .install_change_triggers("roads", &[ChangeAction::Insert])
///         .unwrap();
/// }
/// ```
pub struct Connection<C: GeoPackageConnection> {
    notifier: Arc<Notifier>,
    connection: C,
}

impl<C: GeoPackageConnection> Connection<C> {
    /// Create a new connection with `connection` and `notifier`.
    ///
    /// # Errors
    ///
    /// Returns error if the change function could not be registered.
    pub fn new(connection: C, notifier: Arc<Notifier>) -> Result<Self, C::Error> {
        connection.register_change_function(Arc::clone(&notifier))?;
        Ok(Self {
            notifier,
            connection,
        })
    }

    /// Create the contents table.
    ///
    /// # Errors
    ///
    /// Returns error if the table could not be created, e.g. because it already exists.
    pub fn create_contents_table(&mut self) -> Result<(), C::Error> {
        self.connection.sql_execute(&create_contents_table_query())
    }

    /// Register a feature table in the contents table.
    ///
    /// # Errors
    ///
    /// Returns error if the row could not be inserted.
    pub fn add_contents(&mut self, entry: &ContentsEntry<'_>) -> Result<(), C::Error> {
        self.connection.insert_contents(entry)
    }

    /// Create a feature table named `table` with the sample feature layout.
    ///
    /// # Errors
    ///
    /// Returns error if the table could not be created.
    pub fn create_feature_table(&mut self, table: &str) -> Result<(), C::Error> {
        self.connection.sql_execute(&create_feature_table_query(table))
    }

    /// Create an rtree virtual table named `index`.
    ///
    /// # Errors
    ///
    /// Returns error if the virtual table could not be created.
    pub fn create_spatial_index(&mut self, index: &str) -> Result<(), C::Error> {
        self.connection.sql_execute(&create_rtree_index_query(index))
    }

    /// Create the change triggers of `table` for each of `actions`.
    ///
    /// # Errors
    ///
    /// Returns error if any of the triggers could not be created, in which case none are.
    #[tracing::instrument(level=tracing::Level::DEBUG, skip(self))]
    pub fn install_change_triggers(
        &mut self,
        table: &str,
        actions: &[ChangeAction],
    ) -> Result<(), C::Error> {
        let mut tx = self.connection.sql_transaction()?;
        create_triggers(&mut tx, table, actions)?;
        tx.sql_commit_transaction()
    }

    /// Remove the change triggers of `table` for each of `actions`.
    ///
    /// # Errors
    ///
    /// Returns error if any of the triggers could not be removed.
    #[tracing::instrument(level=tracing::Level::DEBUG, skip(self))]
    pub fn remove_change_triggers(
        &mut self,
        table: &str,
        actions: &[ChangeAction],
    ) -> Result<(), C::Error> {
        let mut tx = self.connection.sql_transaction()?;
        drop_triggers(&mut tx, table, actions)?;
        tx.sql_commit_transaction()
    }

    /// The notifier receiving the changes of this connection.
    #[must_use]
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Consume the current connection and take ownership of the real sql connection.
    ///
    /// # Remarks
    ///
    /// The change function stays registered and the triggers stay installed.
    #[must_use]
    pub fn take(self) -> C {
        self.connection
    }
}

impl<C: GeoPackageConnection> Deref for Connection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<C: GeoPackageConnection> DerefMut for Connection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl<C: GeoPackageConnection> AsRef<C> for Connection<C> {
    fn as_ref(&self) -> &C {
        &self.connection
    }
}

impl<C: GeoPackageConnection> AsMut<C> for Connection<C> {
    fn as_mut(&mut self) -> &mut C {
        &mut self.connection
    }
}

/// Create change triggers for `table`.
///
/// # Errors
///
/// Return error if the query failed.
fn create_triggers<Ex: SqlExecutor>(
    executor: &mut Ex,
    table: &str,
    actions: &[ChangeAction],
) -> Result<(), Ex::Error> {
    let mut query = String::with_capacity(256);
    for action in actions {
        debug!("Add {} trigger for table {table}", action.keyword());
        query.clear();
        create_trigger_query(&mut query, table, *action);
        executor.sql_execute(&query)?;
    }
    Ok(())
}

/// Remove change triggers for `table`.
///
/// # Errors
///
/// Return error if the query failed.
fn drop_triggers<Ex: SqlExecutor>(
    executor: &mut Ex,
    table: &str,
    actions: &[ChangeAction],
) -> Result<(), Ex::Error> {
    let mut query = String::with_capacity(64);
    for action in actions {
        debug!("Remove {} trigger for table {table}", action.keyword());
        query.clear();
        drop_trigger_query(&mut query, table, *action);
        executor.sql_execute(&query)?;
    }
    Ok(())
}
