use anyhow::Context;
use clap::{Parser, ValueEnum};
use gpkg_notifier::connection::Connection;
use gpkg_notifier::notifier::{ChangeAction, ErrorPolicy, Notifier, NotifierConfig};
use gpkg_notifier::schema::ContentsEntry;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SAMPLE_TABLE: &str = "sample_features";
const SAMPLE_INDEX: &str = "demo_index";

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Database file to create, `:memory:` for an in memory database.
    #[arg(long, env = "GPKG_NOTIFIER_DATABASE", default_value = "tmp.sqlite3")]
    database: PathBuf,

    /// What happens to an insert whose change could not be processed.
    #[arg(long, env = "GPKG_NOTIFIER_ON_ERROR", value_enum, default_value_t = OnError::Abort)]
    on_error: OnError,

    /// Log filter, overridden by `RUST_LOG`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnError {
    Abort,
    Report,
}

impl From<OnError> for ErrorPolicy {
    fn from(value: OnError) -> Self {
        match value {
            OnError::Abort => ErrorPolicy::Abort,
            OnError::Report => ErrorPolicy::Report,
        }
    }
}

// Creates a GeoPackage style database with one feature table and inserts two features.
// Each insert fires the change trigger, the second one is served from the metadata cache:
// ```
// INFO Feature table changed table="sample_features" action="INSERT" envelope="envelopeBinary1" srs_id=4711 gpkg_version=2
// INFO Feature table changed table="sample_features" action="INSERT" envelope="envelopeBinary2" srs_id=4711 gpkg_version=2
// ```
fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let sql_connection = rusqlite::Connection::open(&args.database)
        .with_context(|| format!("Can't open database {}", args.database.display()))?;

    let notifier = Notifier::new(NotifierConfig {
        on_error: args.on_error.into(),
    });
    let mut connection =
        Connection::new(sql_connection, notifier).context("Failed to register change function")?;

    connection
        .create_contents_table()
        .context("Failed to create contents table")?;
    connection
        .add_contents(&ContentsEntry {
            table_name: SAMPLE_TABLE,
            data_type: "WKB",
            identifier: "",
            description: "sample feature table",
            bounds: [0.0, 0.0, 1.0, 1.0],
            srs_id: 4711,
            gpkg_version: 2,
        })
        .context("Failed to register feature table in contents table")?;
    connection
        .create_feature_table(SAMPLE_TABLE)
        .context("Failed to create feature table")?;
    connection
        .create_spatial_index(SAMPLE_INDEX)
        .context("Failed to create spatial index")?;
    connection
        .install_change_triggers(SAMPLE_TABLE, &[ChangeAction::Insert])
        .context("Failed to create insert trigger")?;

    // Insert features and watch the trigger fire.
    {
        let mut stmt = connection
            .prepare(&format!(
                "INSERT INTO {SAMPLE_TABLE} (feature_id, envelope, geom, feature_name) VALUES (?, ?, 'geomBinary', 'someName')"
            ))
            .context("Failed to prepare insert statement for feature table")?;

        // The second insert validates the contents cache.
        for (id, envelope) in [(1, "envelopeBinary1"), (2, "envelopeBinary2")] {
            if let Err(e) = stmt.execute(rusqlite::params![id, envelope]) {
                error!("Failed to insert row {id} into feature table: {e}");
            }
        }
    }

    let stats = connection.notifier().stats();
    info!(
        invocations = stats.invocations,
        lookups = stats.lookups,
        cache_hits = stats.cache_hits,
        "Done"
    );
    Ok(())
}
