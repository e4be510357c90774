//! SQL statements for the GeoPackage tables, the spatial index and the change triggers.
use crate::notifier::ChangeAction;
use std::fmt::Write;

/// Name of the table holding the metadata of every feature table.
pub const CONTENTS_TABLE_NAME: &str = "gpkg_contents";

/// Name of the scalar function invoked by the change triggers.
pub const CHANGE_FUNCTION_NAME: &str = "gpkg_feature_changed";

/// Number of arguments taken by [`CHANGE_FUNCTION_NAME`]: table, action and envelope.
pub const CHANGE_FUNCTION_ARGS: i32 = 3;

/// Column of the feature tables holding the envelope handed to the change function.
pub const ENVELOPE_COLUMN: &str = "envelope";

/// A row of the contents table.
#[derive(Debug, Clone)]
pub struct ContentsEntry<'a> {
    pub table_name: &'a str,
    pub data_type: &'a str,
    pub identifier: &'a str,
    pub description: &'a str,
    /// `[min_x, min_y, max_x, max_y]`
    pub bounds: [f64; 4],
    pub srs_id: i64,
    pub gpkg_version: i64,
}

/// Quote `name` for use as an SQL identifier.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote `value` for use as an SQL string literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[inline]
#[must_use]
pub fn create_contents_table_query() -> String {
    format!(
        r"CREATE TABLE `{CONTENTS_TABLE_NAME}` (
    table_name TEXT NOT NULL PRIMARY KEY,
    data_type TEXT NOT NULL,
    identifier TEXT UNIQUE,
    description TEXT DEFAULT '',
    last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    min_x DOUBLE,
    min_y DOUBLE,
    max_x DOUBLE,
    max_y DOUBLE,
    srs_id INTEGER,
    gpkg_version
)"
    )
}

/// Insert into the contents table. Parameters follow the field order of [`ContentsEntry`].
#[inline]
#[must_use]
pub fn insert_contents_query() -> String {
    format!(
        "INSERT INTO `{CONTENTS_TABLE_NAME}` \
(table_name,data_type,identifier,description,last_change,min_x,min_y,max_x,max_y,srs_id,gpkg_version) \
VALUES (?1,?2,?3,?4,date('now'),?5,?6,?7,?8,?9,?10)"
    )
}

#[inline]
#[must_use]
pub fn select_content_table_info_query() -> String {
    format!("SELECT srs_id, gpkg_version FROM `{CONTENTS_TABLE_NAME}` WHERE table_name = ?1")
}

#[inline]
#[must_use]
pub fn create_feature_table_query(table: &str) -> String {
    format!(
        "CREATE TABLE {} (feature_id INTEGER PRIMARY KEY NOT NULL, {ENVELOPE_COLUMN} BLOB, geom BLOB, feature_name TEXT)",
        quote_identifier(table)
    )
}

#[inline]
#[must_use]
pub fn create_rtree_index_query(index: &str) -> String {
    format!(
        "CREATE VIRTUAL TABLE {} USING rtree(id, minX, maxX, minY, maxY)",
        quote_identifier(index)
    )
}

#[inline]
fn trigger_name(table: &str, action: ChangeAction) -> String {
    quote_identifier(&format!("rtree_{table}_{}", action.trigger_suffix()))
}

#[inline]
pub fn create_trigger_query(writer: &mut impl Write, table: &str, action: ChangeAction) {
    write!(
        writer,
        r"CREATE TRIGGER IF NOT EXISTS {name} AFTER {keyword} ON {table_ident}
BEGIN
    SELECT {CHANGE_FUNCTION_NAME}({table_literal}, '{keyword}', {row}.{ENVELOPE_COLUMN});
END",
        name = trigger_name(table, action),
        keyword = action.keyword(),
        table_ident = quote_identifier(table),
        table_literal = quote_literal(table),
        row = action.row_reference(),
    )
    .expect("should not fail");
}

#[inline]
pub fn drop_trigger_query(writer: &mut impl Write, table: &str, action: ChangeAction) {
    write!(
        writer,
        "DROP TRIGGER IF EXISTS {}",
        trigger_name(table, action)
    )
    .expect("should not fail");
}
