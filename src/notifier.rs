use parking_lot::RwLock;
use std::borrow::Cow;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Status returned to sqlite when a change was processed (`SQLITE_OK`).
pub const STATUS_OK: i32 = 0;
/// Status for missing or malformed arguments (`SQLITE_MISUSE`).
pub const STATUS_INVALID_ARGUMENT: i32 = 21;
/// Status for tables without a `gpkg_contents` entry (`SQLITE_NOTFOUND`).
pub const STATUS_NOT_FOUND: i32 = 12;

/// Metadata of a feature table as recorded in `gpkg_contents`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ContentTableInfo {
    pub srs_id: i64,
    pub gpkg_version: i64,
}

/// Source of [`ContentTableInfo`] records, usually the connection on which the trigger fired.
pub trait ContentInfoSource {
    type Error: std::error::Error;

    /// Fetch the metadata for `table` from the contents table.
    ///
    /// Returns `Ok(None)` when no row matches.
    ///
    /// # Errors
    ///
    /// Should return error if the query could not be prepared or executed.
    fn content_table_info(&self, table: &str) -> Result<Option<ContentTableInfo>, Self::Error>;
}

/// Row operations for which change triggers can be installed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    pub const ALL: [ChangeAction; 3] = [ChangeAction::Insert, ChangeAction::Update, ChangeAction::Delete];

    /// SQL keyword of the trigger event, also passed to the callback as `action`.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            ChangeAction::Insert => "INSERT",
            ChangeAction::Update => "UPDATE",
            ChangeAction::Delete => "DELETE",
        }
    }

    /// Suffix used when naming the trigger.
    #[must_use]
    pub fn trigger_suffix(self) -> &'static str {
        match self {
            ChangeAction::Insert => "insert",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }

    /// Row reference holding the envelope inside the trigger body.
    #[must_use]
    pub fn row_reference(self) -> &'static str {
        match self {
            ChangeAction::Insert | ChangeAction::Update => "NEW",
            ChangeAction::Delete => "OLD",
        }
    }
}

/// Arguments handed to the change function by a trigger.
///
/// Values are borrowed from sqlite unless they had to be converted, e.g. a numeric table name.
#[derive(Debug, Clone)]
pub struct FeatureChange<'a> {
    pub table: Option<Cow<'a, str>>,
    pub action: Option<Cow<'a, str>>,
    pub envelope: Option<Cow<'a, [u8]>>,
}

/// What to report to sqlite when a change could not be processed.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum ErrorPolicy {
    /// Raise the error, which aborts the statement that fired the trigger.
    #[default]
    Abort,
    /// Log the error and return its status code. The triggering statement completes.
    Report,
}

#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    pub on_error: ErrorPolicy,
}

/// Snapshot of the [`Notifier`] counters.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct NotifierStats {
    /// Number of times the change function was called.
    pub invocations: u64,
    /// Number of queries issued against the contents table.
    pub lookups: u64,
    /// Number of calls answered from the cache.
    pub cache_hits: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Wrong params provided: {argument} {problem}")]
    InvalidArgument {
        argument: &'static str,
        problem: &'static str,
    },
    #[error("Content table info for table '{0}' not found")]
    NotFound(String),
}

impl Error {
    #[must_use]
    pub fn missing(argument: &'static str) -> Self {
        Error::InvalidArgument {
            argument,
            problem: "is missing",
        }
    }

    /// Sqlite result code matching this error.
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            Error::InvalidArgument { .. } => STATUS_INVALID_ARGUMENT,
            Error::NotFound(_) => STATUS_NOT_FOUND,
        }
    }
}

/// Table name to [`ContentTableInfo`] map.
///
/// Entries are never replaced or evicted. The first record stored for a table wins.
#[derive(Default)]
pub struct ContentInfoCache {
    entries: RwLock<BTreeMap<String, ContentTableInfo>>,
}

impl ContentInfoCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, table: &str) -> Option<ContentTableInfo> {
        self.entries.read().get(table).copied()
    }

    /// Store `info` for `table` unless an entry exists. Returns the cached value.
    pub fn insert(&self, table: &str, info: ContentTableInfo) -> ContentTableInfo {
        match self.entries.write().entry(table.to_owned()) {
            Entry::Vacant(v) => *v.insert(info),
            Entry::Occupied(o) => *o.get(),
        }
    }

    #[must_use]
    pub fn tables(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Receives the feature changes reported by the triggers of one connection.
///
/// Each notifier owns the metadata cache for the connection it is registered on. The cache is
/// filled lazily from the contents table the first time a table reports a change.
///
/// Updating the spatial index is not implemented yet. The notifier only resolves the
/// metadata and logs the change.
pub struct Notifier {
    config: NotifierConfig,
    cache: ContentInfoCache,
    invocations: AtomicU64,
    lookups: AtomicU64,
    cache_hits: AtomicU64,
}

impl Notifier {
    #[must_use]
    pub fn new(config: NotifierConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            cache: ContentInfoCache::new(),
            invocations: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &ContentInfoCache {
        &self.cache
    }

    #[must_use]
    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            invocations: self.invocations.load(Ordering::Acquire),
            lookups: self.lookups.load(Ordering::Acquire),
            cache_hits: self.cache_hits.load(Ordering::Acquire),
        }
    }

    /// Handle a change reported by a trigger.
    ///
    /// Metadata for the table is taken from the cache or, on the first change of a table,
    /// fetched from `source` and cached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the table or action is missing and
    /// [`Error::NotFound`] if the table has no readable entry in the contents table.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip_all, fields(table = change.table.as_deref()))]
    pub fn on_change<S: ContentInfoSource>(
        &self,
        source: &S,
        change: &FeatureChange<'_>,
    ) -> Result<ContentTableInfo, Error> {
        self.invocations.fetch_add(1, Ordering::AcqRel);

        let Some(table) = change.table.as_deref() else {
            return Err(Error::missing("table"));
        };
        let Some(action) = change.action.as_deref() else {
            return Err(Error::missing("action"));
        };

        let info = if let Some(info) = self.cache.get(table) {
            debug!("Reusing cached content info");
            self.cache_hits.fetch_add(1, Ordering::AcqRel);
            info
        } else {
            debug!("Content info not yet cached, fetching info from gpkg_contents");
            self.lookups.fetch_add(1, Ordering::AcqRel);
            match source.content_table_info(table) {
                Ok(Some(info)) => self.cache.insert(table, info),
                Ok(None) => return Err(Error::NotFound(table.to_owned())),
                Err(e) => {
                    error!("Failed to fetch info from content table: {e}");
                    return Err(Error::NotFound(table.to_owned()));
                }
            }
        };

        let envelope = change.envelope.as_deref().map(String::from_utf8_lossy);
        info!(
            table,
            action,
            envelope = envelope.as_deref(),
            srs_id = info.srs_id,
            gpkg_version = info.gpkg_version,
            "Feature table changed"
        );
        debug!("Spatial index update for {table} not implemented, change ignored");

        Ok(info)
    }

    /// Count a change whose arguments could not be decoded and hand back `error` as its outcome.
    ///
    /// # Errors
    ///
    /// Always returns `error`.
    pub fn reject(&self, error: Error) -> Result<ContentTableInfo, Error> {
        self.invocations.fetch_add(1, Ordering::AcqRel);
        Err(error)
    }

    /// Turn the outcome of [`Self::on_change`] into the status returned to sqlite.
    ///
    /// # Errors
    ///
    /// Returns the original error when the policy is [`ErrorPolicy::Abort`].
    pub fn status(&self, outcome: Result<ContentTableInfo, Error>) -> Result<i32, Error> {
        match outcome {
            Ok(_) => Ok(STATUS_OK),
            Err(e) => match self.config.on_error {
                ErrorPolicy::Abort => Err(e),
                ErrorPolicy::Report => {
                    warn!("Feature change not processed: {e}");
                    Ok(e.status_code())
                }
            },
        }
    }
}
