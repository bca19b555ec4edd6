//! cubesync CLI - inspect and reconcile cube metadata
//!
//! Usage:
//!   cubesync expand <rule.json>
//!   cubesync reload --project <project> --table <table.json>
//!   cubesync check-cc --project <project> --model <alias> [--auto-adjust]
//!   cubesync status --project <project> --model-id <id>
//!
//! Every command except `expand` works on the SQLite store named by
//! `store.path` in the settings, or by `--store`.

use clap::{Parser, Subcommand};
use cubesync::computed_column::ComputedColumnResolver;
use cubesync::config::Settings;
use cubesync::dataflow::status::{dataflow_status, segment_status};
use cubesync::error::CubeResult;
use cubesync::index::{expand, ExpandOptions, RuleBasedIndex};
use cubesync::manager::ModelManager;
use cubesync::model::{catalog, Model, TableDesc};
use cubesync::reload::Reconciler;
use cubesync::sql::SqlParserCanonicalizer;
use cubesync::store::{MetadataStoreExt, SqliteStore};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cubesync")]
#[command(about = "cubesync - keeps cube models and layouts consistent with source schemas")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the usual lookup)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Metadata store path, overriding `store.path`
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand an aggregation rule (JSON) into its layouts
    Expand {
        /// Path to the rule JSON file
        rule: PathBuf,
    },

    /// Apply a new version of a table (JSON) to the stored metadata
    Reload {
        #[arg(short, long)]
        project: String,

        /// Path to the table JSON file
        #[arg(short, long)]
        table: PathBuf,
    },

    /// Check a model's computed columns against its project
    CheckCc {
        #[arg(short, long)]
        project: String,

        /// Model alias
        #[arg(short, long)]
        model: String,

        /// Rename adjustable conflicts instead of failing
        #[arg(long)]
        auto_adjust: bool,
    },

    /// Show dataflow and segment status of a model
    Status {
        #[arg(short, long)]
        project: String,

        #[arg(long)]
        model_id: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Expand { rule } => cmd_expand(&rule, &settings),
        Commands::Reload { project, table } => {
            with_store(cli.store, &settings, |store| cmd_reload(store, settings.clone(), &project, &table))
        }
        Commands::CheckCc {
            project,
            model,
            auto_adjust,
        } => with_store(cli.store, &settings, |store| {
            cmd_check_cc(store, &settings, &project, &model, auto_adjust)
        }),
        Commands::Status { project, model_id } => with_store(cli.store, &settings, |store| {
            cmd_status(store, settings.clone(), &project, &model_id)
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn load_settings(path: Option<&Path>) -> Result<Settings, cubesync::config::SettingsError> {
    match path {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    }
}

fn with_store(
    path: Option<PathBuf>,
    settings: &Settings,
    run: impl FnOnce(Arc<SqliteStore>) -> CliResult,
) -> CliResult {
    let path = match path {
        Some(path) => path,
        None => settings.store.resolved_path()?,
    };
    let store = SqliteStore::open(&path)?;
    run(Arc::new(store))
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_expand(path: &Path, settings: &Settings) -> CliResult {
    let rule: RuleBasedIndex = serde_json::from_str(&fs::read_to_string(path)?)?;
    let layouts = expand(&rule, ExpandOptions::from(&settings.layout))?;
    for layout in &layouts {
        let columns: Vec<String> = layout.col_order().iter().map(u32::to_string).collect();
        let marker = if layout.base { " (base)" } else { "" };
        println!("[{}]{}", columns.join(", "), marker);
    }
    eprintln!("{} layouts", layouts.len());
    Ok(())
}

fn cmd_reload(store: Arc<SqliteStore>, settings: Settings, project: &str, path: &Path) -> CliResult {
    let table: TableDesc = serde_json::from_str(&fs::read_to_string(path)?)?;
    let reconciler = Reconciler::new(store.clone(), settings);
    let stored: Option<TableDesc> = store.get(project, &table.identity())?;
    let report = match stored {
        Some(old) => reconciler.reload(project, &old, table)?,
        None => {
            // first sight of the table: nothing can be bound to it yet
            let manager = ModelManager::new(store, reconciler.settings().clone());
            manager.save_tables(project, &[table])?;
            println!("table stored");
            return Ok(());
        }
    };
    print_json(&report)
}

fn cmd_check_cc(
    store: Arc<SqliteStore>,
    settings: &Settings,
    project: &str,
    alias: &str,
    auto_adjust: bool,
) -> CliResult {
    let manager = ModelManager::new(store.clone(), settings.clone());
    let model = manager.find_model(project, alias)?;
    let models: Vec<Model> = store.list(project)?;
    let tables = catalog(store.list::<TableDesc>(project)?);
    let resolver = ComputedColumnResolver::new(
        Arc::new(SqlParserCanonicalizer::new()),
        settings.computed_column.clone(),
    );
    let checked = resolver.check_model(&model, &models, &tables, auto_adjust)?;
    if checked.adjustments.is_empty() {
        println!("no conflicts");
    }
    for detail in &checked.adjustments {
        println!("{} -> {}", detail.conflict, detail.renamed_to);
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusView {
    model: String,
    broken: bool,
    status: cubesync::dataflow::status::DataflowDisplayStatus,
    segments: Vec<SegmentView>,
}

#[derive(Serialize)]
struct SegmentView {
    id: String,
    start: i64,
    end: i64,
    status: cubesync::dataflow::status::SegmentDisplayStatus,
}

fn cmd_status(store: Arc<SqliteStore>, settings: Settings, project: &str, model_id: &str) -> CliResult {
    let manager = ModelManager::new(store, settings);
    let view = status_view(&manager, project, model_id)?;
    print_json(&view)
}

fn status_view(manager: &ModelManager<SqliteStore>, project: &str, model_id: &str) -> CubeResult<StatusView> {
    let model = manager.get_model(project, model_id)?;
    let dataflow = manager.get_dataflow(project, model_id)?;
    Ok(StatusView {
        model: model.alias,
        broken: model.broken,
        status: dataflow_status(&dataflow),
        segments: dataflow
            .segments
            .iter()
            .map(|s| SegmentView {
                id: s.id.clone(),
                start: s.range.start,
                end: s.range.end,
                status: segment_status(s, &dataflow.segments),
            })
            .collect(),
    })
}
