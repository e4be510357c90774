//! Sql trait implementations for `rusqlite`.
//!
//! Requires the `rusqlite` feature to be enabled.
use crate::connection::{GeoPackageConnection, SqlExecutor, SqlTransaction};
use crate::notifier::{self, ContentInfoSource, ContentTableInfo, FeatureChange, Notifier};
use crate::schema::{
    insert_contents_query, select_content_table_info_query, ContentsEntry, CHANGE_FUNCTION_ARGS,
    CHANGE_FUNCTION_NAME,
};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::borrow::Cow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

impl SqlExecutor for Connection {
    type Error = rusqlite::Error;

    fn sql_execute(&mut self, query: &str) -> Result<(), rusqlite::Error> {
        Connection::execute(self, query, ())?;
        Ok(())
    }
}

impl GeoPackageConnection for Connection {
    fn sql_transaction(&mut self) -> Result<impl SqlTransaction<Error = rusqlite::Error>, rusqlite::Error> {
        self.transaction()
    }

    fn register_change_function(&self, notifier: Arc<Notifier>) -> Result<(), rusqlite::Error> {
        // parking_lot locks do not poison, a panic inside the callback leaves the cache usable.
        let notifier = AssertUnwindSafe(notifier);
        self.create_scalar_function(
            CHANGE_FUNCTION_NAME,
            CHANGE_FUNCTION_ARGS,
            FunctionFlags::SQLITE_UTF8,
            move |ctx| {
                // SAFETY: the connection is neither closed nor used to change the schema while
                // the callback runs, it only serves the contents table lookup.
                let connection = unsafe { ctx.get_connection()? };
                let outcome = match change_args(ctx) {
                    Ok(change) => notifier.on_change(&*connection, &change),
                    Err(e) => notifier.reject(e),
                };
                notifier
                    .status(outcome)
                    .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
            },
        )
    }

    fn insert_contents(&mut self, entry: &ContentsEntry<'_>) -> Result<(), rusqlite::Error> {
        let [min_x, min_y, max_x, max_y] = entry.bounds;
        self.execute(
            &insert_contents_query(),
            params![
                entry.table_name,
                entry.data_type,
                entry.identifier,
                entry.description,
                min_x,
                min_y,
                max_x,
                max_y,
                entry.srs_id,
                entry.gpkg_version,
            ],
        )?;
        Ok(())
    }
}

impl ContentInfoSource for Connection {
    type Error = rusqlite::Error;

    fn content_table_info(&self, table: &str) -> Result<Option<ContentTableInfo>, rusqlite::Error> {
        let mut stmt = self.prepare(&select_content_table_info_query())?;
        stmt.query_row([table], |row| {
            Ok(ContentTableInfo {
                srs_id: row.get::<_, Option<i64>>(0)?.unwrap_or_default(),
                gpkg_version: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
            })
        })
        .optional()
    }
}

impl<'c> SqlExecutor for Transaction<'c> {
    type Error = rusqlite::Error;

    fn sql_execute(&mut self, query: &str) -> Result<(), rusqlite::Error> {
        self.execute(query, ())?;
        Ok(())
    }
}

impl<'c> SqlTransaction for Transaction<'c> {
    fn sql_commit_transaction(self) -> Result<(), rusqlite::Error> {
        Transaction::commit(self)
    }
}

/// Arguments of the change function. Numbers are read as text, as `sqlite3_value_text` does.
fn change_args<'a>(ctx: &'a Context<'_>) -> Result<FeatureChange<'a>, notifier::Error> {
    Ok(FeatureChange {
        table: text_arg(ctx.get_raw(0), "table")?,
        action: text_arg(ctx.get_raw(1), "action")?,
        envelope: bytes_arg(ctx.get_raw(2)),
    })
}

fn text_arg<'a>(
    value: ValueRef<'a>,
    argument: &'static str,
) -> Result<Option<Cow<'a, str>>, notifier::Error> {
    let invalid = |problem| notifier::Error::InvalidArgument { argument, problem };
    match value {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(i) => Ok(Some(Cow::Owned(i.to_string()))),
        ValueRef::Real(r) => Ok(Some(Cow::Owned(format!("{r:?}")))),
        ValueRef::Text(text) => std::str::from_utf8(text)
            .map(|text| Some(Cow::Borrowed(text)))
            .map_err(|_| invalid("is not valid UTF-8")),
        ValueRef::Blob(_) => Err(invalid("is a blob")),
    }
}

/// Envelope bytes, numbers in their text form.
fn bytes_arg(value: ValueRef<'_>) -> Option<Cow<'_, [u8]>> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(Cow::Owned(i.to_string().into_bytes())),
        ValueRef::Real(r) => Some(Cow::Owned(format!("{r:?}").into_bytes())),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Some(Cow::Borrowed(bytes)),
    }
}

#[cfg(test)]
mod test {
    use crate::connection::Connection as NotifyingConnection;
    use crate::notifier::{
        ChangeAction, ContentTableInfo, ErrorPolicy, Notifier, NotifierConfig, NotifierStats,
        STATUS_INVALID_ARGUMENT, STATUS_NOT_FOUND, STATUS_OK,
    };
    use crate::schema::{ContentsEntry, CHANGE_FUNCTION_NAME};
    use rusqlite::{params, Connection};
    use tempdir::TempDir;

    const SAMPLE_TABLE: &str = "sample_features";
    const SAMPLE_INFO: ContentTableInfo = ContentTableInfo {
        srs_id: 4711,
        gpkg_version: 2,
    };

    fn sample_entry(table_name: &str) -> ContentsEntry<'_> {
        ContentsEntry {
            table_name,
            data_type: "WKB",
            identifier: table_name,
            description: "sample feature table",
            bounds: [0.0, 0.0, 1.0, 1.0],
            srs_id: SAMPLE_INFO.srs_id,
            gpkg_version: SAMPLE_INFO.gpkg_version,
        }
    }

    fn open(connection: Connection, on_error: ErrorPolicy) -> NotifyingConnection<Connection> {
        let notifier = Notifier::new(NotifierConfig { on_error });
        NotifyingConnection::new(connection, notifier).unwrap()
    }

    fn setup(connection: &mut NotifyingConnection<Connection>) {
        connection.create_contents_table().unwrap();
        connection.add_contents(&sample_entry(SAMPLE_TABLE)).unwrap();
        connection.create_feature_table(SAMPLE_TABLE).unwrap();
        connection.create_spatial_index("demo_index").unwrap();
        connection
            .install_change_triggers(SAMPLE_TABLE, &[ChangeAction::Insert])
            .unwrap();
    }

    fn insert_feature(
        connection: &Connection,
        table: &str,
        id: i64,
        envelope: &[u8],
    ) -> rusqlite::Result<usize> {
        connection.execute(
            &format!(
                "INSERT INTO \"{table}\" (feature_id, envelope, geom, feature_name) VALUES (?, ?, 'geomBinary', 'someName')"
            ),
            params![id, envelope],
        )
    }

    #[test]
    fn inserts_resolve_metadata_once() {
        let mut connection = open(Connection::open_in_memory().unwrap(), ErrorPolicy::Abort);
        setup(&mut connection);
        let notifier = std::sync::Arc::clone(connection.notifier());

        assert_eq!(
            insert_feature(&connection, SAMPLE_TABLE, 1, b"envelopeBinary1").unwrap(),
            1
        );
        assert_eq!(notifier.cache().get(SAMPLE_TABLE), Some(SAMPLE_INFO));
        assert_eq!(
            notifier.stats(),
            NotifierStats {
                invocations: 1,
                lookups: 1,
                cache_hits: 0,
            }
        );

        assert_eq!(
            insert_feature(&connection, SAMPLE_TABLE, 2, b"envelopeBinary2").unwrap(),
            1
        );
        assert_eq!(
            notifier.stats(),
            NotifierStats {
                invocations: 2,
                lookups: 1,
                cache_hits: 1,
            }
        );
        assert_eq!(notifier.cache().tables(), vec![SAMPLE_TABLE.to_string()]);

        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM sample_features", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn missing_contents_aborts_insert() {
        let mut connection = open(Connection::open_in_memory().unwrap(), ErrorPolicy::Abort);
        setup(&mut connection);
        connection.create_feature_table("unregistered").unwrap();
        connection
            .install_change_triggers("unregistered", &[ChangeAction::Insert])
            .unwrap();

        let err = insert_feature(&connection, "unregistered", 1, b"envelope").unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
        assert!(connection.notifier().cache().is_empty());

        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM unregistered", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn missing_contents_is_reported_without_failing_insert() {
        let mut connection = open(Connection::open_in_memory().unwrap(), ErrorPolicy::Report);
        setup(&mut connection);
        connection.create_feature_table("unregistered").unwrap();
        connection
            .install_change_triggers("unregistered", &[ChangeAction::Insert])
            .unwrap();

        for id in 1..=2 {
            assert_eq!(
                insert_feature(&connection, "unregistered", id, b"envelope").unwrap(),
                1
            );
        }
        let notifier = connection.notifier();
        assert!(notifier.cache().is_empty());
        assert_eq!(notifier.stats().invocations, 2);
        assert_eq!(notifier.stats().lookups, 2);
    }

    #[test]
    fn direct_calls_return_status() {
        let mut connection = open(Connection::open_in_memory().unwrap(), ErrorPolicy::Report);
        setup(&mut connection);

        let status: i32 = connection
            .query_row(
                &format!("SELECT {CHANGE_FUNCTION_NAME}(?, 'INSERT', NULL)"),
                [SAMPLE_TABLE],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, STATUS_OK);

        let status: i32 = connection
            .query_row(
                &format!("SELECT {CHANGE_FUNCTION_NAME}('nope', 'INSERT', NULL)"),
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, STATUS_NOT_FOUND);
    }

    fn call_status(connection: &Connection, args: &str) -> rusqlite::Result<i32> {
        connection.query_row(&format!("SELECT {CHANGE_FUNCTION_NAME}({args})"), [], |r| {
            r.get(0)
        })
    }

    #[test]
    fn numeric_arguments_are_read_as_text() {
        let mut connection = open(Connection::open_in_memory().unwrap(), ErrorPolicy::Report);
        setup(&mut connection);
        connection.add_contents(&sample_entry("42")).unwrap();

        assert_eq!(call_status(&connection, "42, 'INSERT', 1.5").unwrap(), STATUS_OK);
        assert_eq!(connection.notifier().cache().get("42"), Some(SAMPLE_INFO));
        assert_eq!(call_status(&connection, "7, 'INSERT', 3").unwrap(), STATUS_NOT_FOUND);
    }

    #[test]
    fn undecodable_arguments_follow_error_policy() {
        let mut connection = open(Connection::open_in_memory().unwrap(), ErrorPolicy::Report);
        setup(&mut connection);

        for args in [
            "CAST(x'ff' AS TEXT), 'INSERT', NULL",
            "x'00', 'INSERT', NULL",
            "'sample_features', x'00', NULL",
        ] {
            assert_eq!(
                call_status(&connection, args).unwrap(),
                STATUS_INVALID_ARGUMENT,
                "{args}"
            );
        }
        let notifier = connection.notifier();
        assert_eq!(notifier.stats().invocations, 3);
        assert_eq!(notifier.stats().lookups, 0);
        assert!(notifier.cache().is_empty());

        let connection = open(Connection::open_in_memory().unwrap(), ErrorPolicy::Abort);
        let err = call_status(&connection, "CAST(x'ff' AS TEXT), 'INSERT', NULL").unwrap_err();
        assert!(err.to_string().contains("table is not valid UTF-8"), "{err}");
        let err = call_status(&connection, "x'00', 'INSERT', NULL").unwrap_err();
        assert!(err.to_string().contains("table is a blob"), "{err}");
    }

    #[test]
    fn missing_arguments_abort_without_caching() {
        let mut connection = open(Connection::open_in_memory().unwrap(), ErrorPolicy::Abort);
        setup(&mut connection);

        let err = connection
            .query_row::<i32, _, _>(
                &format!("SELECT {CHANGE_FUNCTION_NAME}(?, NULL, NULL)"),
                [SAMPLE_TABLE],
                |r| r.get(0),
            )
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("Wrong params provided: action is missing"),
            "{err}"
        );
        assert!(connection.notifier().cache().is_empty());
        assert_eq!(connection.notifier().stats().lookups, 0);
    }

    #[test]
    fn update_and_delete_triggers() {
        let mut connection = open(Connection::open_in_memory().unwrap(), ErrorPolicy::Abort);
        setup(&mut connection);
        connection
            .install_change_triggers(SAMPLE_TABLE, &ChangeAction::ALL)
            .unwrap();
        let notifier = std::sync::Arc::clone(connection.notifier());

        insert_feature(&connection, SAMPLE_TABLE, 1, b"a").unwrap();
        connection
            .execute(
                "UPDATE sample_features SET envelope = ?1 WHERE feature_id = 1",
                [b"b".as_slice()],
            )
            .unwrap();
        connection
            .execute("DELETE FROM sample_features WHERE feature_id = 1", [])
            .unwrap();
        assert_eq!(notifier.stats().invocations, 3);
        assert_eq!(notifier.stats().lookups, 1);

        connection
            .remove_change_triggers(SAMPLE_TABLE, &ChangeAction::ALL)
            .unwrap();
        insert_feature(&connection, SAMPLE_TABLE, 2, b"c").unwrap();
        assert_eq!(notifier.stats().invocations, 3);
    }

    #[test]
    fn cache_is_scoped_to_connection() {
        let tmp_dir = TempDir::new("gpkg-notifier").unwrap();
        let db_file = tmp_dir.path().join("db.sqlite3");

        let mut connection = open(Connection::open(&db_file).unwrap(), ErrorPolicy::Abort);
        setup(&mut connection);
        insert_feature(&connection, SAMPLE_TABLE, 1, b"envelopeBinary1").unwrap();
        assert_eq!(connection.notifier().stats().lookups, 1);
        drop(connection.take());

        // Triggers are persistent, the function has to be registered again.
        let connection = open(Connection::open(&db_file).unwrap(), ErrorPolicy::Abort);
        assert!(connection.notifier().cache().is_empty());
        insert_feature(&connection, SAMPLE_TABLE, 2, b"envelopeBinary2").unwrap();
        assert_eq!(connection.notifier().stats().lookups, 1);
        assert_eq!(
            connection.notifier().cache().get(SAMPLE_TABLE),
            Some(SAMPLE_INFO)
        );
    }

    #[test]
    fn duplicate_setup_fails() {
        let mut connection = open(Connection::open_in_memory().unwrap(), ErrorPolicy::Abort);
        setup(&mut connection);
        assert!(connection.create_contents_table().is_err());
        assert!(connection.add_contents(&sample_entry(SAMPLE_TABLE)).is_err());
    }
}
