//! Catalog CSV CLI - import and export library catalog records
//!
//! # Main Commands
//!
//! ```bash
//! catalog-csv import catalog.csv --mode upsert   # Import into the catalog snapshot
//! catalog-csv export -o catalog.csv              # Export the catalog (all columns)
//! catalog-csv serve                              # Start HTTP server (port 3000)
//! ```
//!
//! # Helper Commands
//!
//! ```bash
//! catalog-csv validate catalog.csv    # Pre-check a file without writing
//! catalog-csv template --annotation   # Empty file with every column
//! catalog-csv mapping                 # Print the default field map
//! catalog-csv sessions list           # Archived import sessions
//! ```

use catalog_csv::{
    api::AppState, AccessLevel, BatchOrchestrator, ConflictMode, ExportFilter, ExportOptions, Exporter,
    FieldMap, ImportConfig, ImportQueue, ImportSession, ImportSource, InMemoryStore, SessionArchive,
    SessionStatus, Validator,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "catalog-csv")]
#[command(about = "Import and export library catalog records as CSV", long_about = None)]
#[command(version)]
struct Cli {
    /// Catalog snapshot file (created on first import)
    #[arg(short, long, global = true, default_value = "catalog-store.json")]
    store: PathBuf,

    /// Engine configuration JSON
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Field map JSON replacing the built-in one
    #[arg(long, global = true)]
    field_map: Option<PathBuf>,

    /// Session archive directory
    #[arg(long, global = true, default_value = catalog_csv::cache::DEFAULT_ARCHIVE_DIR)]
    archive_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a CSV file into the catalog
    Import {
        /// Input CSV file
        input: PathBuf,

        /// How rows matching existing items are handled
        #[arg(short, long, value_enum, default_value_t = ConflictMode::Upsert)]
        mode: ConflictMode,

        /// CSV delimiter (auto-detect if not specified)
        #[arg(short, long)]
        delimiter: Option<char>,

        /// Input encoding label (auto-detect if not specified)
        #[arg(short, long)]
        encoding: Option<String>,

        /// Rows per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Create missing languages too
        #[arg(long)]
        create_all: bool,
    },

    /// Export catalog items as CSV
    Export {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        format: FormatArgs,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Check a CSV file without writing anything
    Validate {
        /// Input CSV file
        input: PathBuf,

        /// Data rows to inspect
        #[arg(short, long)]
        limit: Option<usize>,

        /// CSV delimiter (auto-detect if not specified)
        #[arg(short, long)]
        delimiter: Option<char>,
    },

    /// Write an empty import file (header only)
    Template {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        format: FormatArgs,
    },

    /// Print the field map as JSON
    Mapping {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inspect archived import sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Start HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List archived sessions, newest first
    List,

    /// Show one session with its errors and warnings
    Show {
        /// Session id or unique id prefix
        id: String,
    },
}

#[derive(clap::Args)]
struct FormatArgs {
    /// Comma-separated column subset
    #[arg(long, value_delimiter = ',')]
    columns: Option<Vec<String>>,

    /// Add the table.column annotation row
    #[arg(long)]
    annotation: bool,

    /// Prefix a UTF-8 byte-order mark
    #[arg(long)]
    bom: bool,
}

impl FormatArgs {
    fn options(self) -> ExportOptions {
        ExportOptions {
            columns: self.columns,
            include_annotation: self.annotation,
            bom: self.bom,
        }
    }
}

#[derive(clap::Args)]
struct FilterArgs {
    #[arg(long)]
    created_from: Option<NaiveDate>,
    #[arg(long)]
    created_to: Option<NaiveDate>,
    #[arg(long)]
    updated_from: Option<NaiveDate>,
    #[arg(long)]
    updated_to: Option<NaiveDate>,
    /// full, limited or unavailable
    #[arg(long, value_parser = parse_access_level)]
    access: Option<AccessLevel>,
    #[arg(long)]
    collection: Option<String>,
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    active: Option<bool>,
    #[arg(long)]
    featured: Option<bool>,
    #[arg(long)]
    year_from: Option<i32>,
    #[arg(long)]
    year_to: Option<i32>,
}

impl FilterArgs {
    fn filter(self) -> ExportFilter {
        ExportFilter {
            created_from: self.created_from,
            created_to: self.created_to,
            updated_from: self.updated_from,
            updated_to: self.updated_to,
            access_level: self.access,
            collection: self.collection,
            language: self.language,
            is_active: self.active,
            is_featured: self.featured,
            year_from: self.year_from,
            year_to: self.year_to,
        }
    }
}

fn parse_access_level(s: &str) -> Result<AccessLevel, String> {
    AccessLevel::from_str(s).ok_or_else(|| format!("unknown access level '{}'", s))
}

#[tokio::main]
async fn main() {
    // Load .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "catalog_csv=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match load_config(&cli) {
        Ok(config) => run(cli, config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> CliResult<ImportConfig> {
    let mut config = match &cli.config {
        Some(path) => ImportConfig::from_json_file(path)?.apply_env()?,
        None => ImportConfig::from_env()?,
    };
    if let Some(path) = &cli.field_map {
        config = config.with_field_map_file(path)?;
        config.validate()?;
    }
    Ok(config)
}

async fn run(cli: Cli, config: ImportConfig) -> CliResult<()> {
    let store_path = cli.store;
    let archive_dir = cli.archive_dir;

    match cli.command {
        Commands::Import {
            input,
            mode,
            delimiter,
            encoding,
            chunk_size,
            create_all,
        } => {
            let mut config = config;
            config.delimiter = delimiter.or(config.delimiter);
            config.encoding = encoding.or(config.encoding);
            if let Some(n) = chunk_size {
                config = config.with_chunk_size(n);
            }
            if create_all {
                config = config.with_create_missing(catalog_csv::CreateMissing::all());
            }
            config.validate()?;
            cmd_import(&input, mode, config, &store_path, &archive_dir)
        }

        Commands::Export { output, format, filter } => {
            cmd_export(&config, &store_path, filter.filter(), format.options(), output.as_deref())
        }

        Commands::Validate { input, limit, delimiter } => {
            let mut config = config;
            config.delimiter = delimiter.or(config.delimiter);
            cmd_validate(&input, &config, limit)
        }

        Commands::Template { output, format } => cmd_template(&config, format.options(), output.as_deref()),

        Commands::Mapping { output } => cmd_mapping(&config.field_map, output.as_deref()),

        Commands::Sessions { action } => cmd_sessions(action, &archive_dir),

        Commands::Serve { port } => cmd_serve(port, config, store_path, archive_dir).await,
    }
}

fn cmd_import(
    input: &Path,
    mode: ConflictMode,
    config: ImportConfig,
    store_path: &Path,
    archive_dir: &Path,
) -> CliResult<()> {
    eprintln!("Importing {} (mode: {})", input.display(), mode);

    let mut store = InMemoryStore::load(store_path)?;
    let orchestrator = BatchOrchestrator::new(config).with_progress(Box::new(|p: &catalog_csv::Progress| {
        if !p.status.is_terminal() {
            eprintln!(
                "   {}/{} rows ({:.0}%)",
                p.totals.processed_rows, p.totals.total_rows, p.percentage
            );
        }
    }));
    let session = orchestrator.import(&mut store, &ImportSource::file(input), mode);

    store.save(store_path)?;
    let mut archive = SessionArchive::with_dir(archive_dir);
    match archive.save(&session) {
        Ok(path) => info!(path = %path.display(), "Session archived"),
        Err(e) => warn!(error = %e, "Could not archive session"),
    }

    print_session(&session, 5);

    if session.status == SessionStatus::Failed {
        return Err(format!("import session {} failed", session.id).into());
    }
    Ok(())
}

fn cmd_export(
    config: &ImportConfig,
    store_path: &Path,
    filter: ExportFilter,
    options: ExportOptions,
    output: Option<&Path>,
) -> CliResult<()> {
    let store = InMemoryStore::load(store_path)?;
    let exporter = Exporter::new(config);

    let summary = match output {
        Some(path) => {
            let summary = exporter.export(&store, &filter, &options, BufWriter::new(File::create(path)?))?;
            eprintln!("Exported {} rows to {}", summary.rows, path.display());
            summary
        }
        None => exporter.export(&store, &filter, &options, io::stdout().lock())?,
    };
    info!(rows = summary.rows, columns = summary.columns.len(), "Export written");
    Ok(())
}

fn cmd_validate(input: &Path, config: &ImportConfig, limit: Option<usize>) -> CliResult<()> {
    eprintln!("Validating: {}", input.display());

    let limit = limit.unwrap_or(config.validation_sample_limit);
    let result = Validator::new(config).validate_file(&ImportSource::file(input), config, limit)?;

    eprintln!("   Encoding: {}", result.encoding);
    eprintln!("   Delimiter: '{}'", format_delimiter(result.delimiter));
    eprintln!("   Columns: {}", result.headers.join(", "));
    if result.has_annotation_row {
        eprintln!("   Annotation row: yes");
    }
    eprintln!(
        "   Rows checked: {}{}",
        result.rows_checked,
        if result.truncated { " (sample limit reached)" } else { "" }
    );

    for warning in &result.report.warnings {
        eprintln!("   warning {}", describe(warning.row, &warning.message));
    }
    for error in &result.report.errors {
        eprintln!("   error   {}", describe(error.row, &error.message));
    }

    eprintln!(
        "\nResults: {} errors, {} warnings",
        result.report.errors.len(),
        result.report.warnings.len()
    );

    if !result.report.is_valid() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_template(config: &ImportConfig, options: ExportOptions, output: Option<&Path>) -> CliResult<()> {
    let exporter = Exporter::new(config);
    let headers = match output {
        Some(path) => {
            let headers = exporter.write_template(&options, BufWriter::new(File::create(path)?))?;
            eprintln!("Template written to: {}", path.display());
            headers
        }
        None => exporter.write_template(&options, io::stdout().lock())?,
    };
    info!(columns = headers.len(), "Template written");
    Ok(())
}

fn cmd_mapping(map: &FieldMap, output: Option<&Path>) -> CliResult<()> {
    write_output(&map.to_json()?, output)
}

fn cmd_sessions(action: SessionAction, archive_dir: &Path) -> CliResult<()> {
    let archive = SessionArchive::with_dir(archive_dir);

    match action {
        SessionAction::List => {
            let sessions = archive.list();
            if sessions.is_empty() {
                eprintln!("No import sessions archived yet.");
                return Ok(());
            }

            eprintln!("Import sessions ({}):\n", sessions.len());
            for s in sessions {
                println!("  {} {}", s.id, s.source_filename);
                println!("     Status: {} ({})", s.status, s.mode);
                println!(
                    "     Rows: {} total, {} created, {} updated, {} skipped, {} failed",
                    s.total_rows, s.created_count, s.updated_count, s.skipped, s.failed
                );
                println!("     Started: {}", s.created_at);
                println!();
            }
        }

        SessionAction::Show { id } => match archive.find(&id) {
            Some(session) => {
                print_session(session, usize::MAX);
                println!("\n{}", serde_json::to_string_pretty(session)?);
            }
            None => return Err(format!("Session not found: {}", id).into()),
        },
    }

    Ok(())
}

async fn cmd_serve(port: u16, config: ImportConfig, store_path: PathBuf, archive_dir: PathBuf) -> CliResult<()> {
    let store = InMemoryStore::load(&store_path)?;
    info!(items = store.item_count(), path = %store_path.display(), "Catalog loaded");

    let snapshot_path = store_path.clone();
    let queue = ImportQueue::new(Arc::new(Mutex::new(store)), config)
        .with_archive(SessionArchive::with_dir(archive_dir))
        .with_finish_hook(Arc::new(move |store: &mut InMemoryStore, session: &ImportSession| {
            if let Err(e) = store.save(&snapshot_path) {
                warn!(session_id = %session.id, error = %e, "Could not save catalog snapshot");
            }
        }));

    catalog_csv::server::start_server(port, AppState::new(queue)).await
}

fn print_session(session: &ImportSession, max_issues: usize) {
    eprintln!("\nSession {} {}", session.id, session.status);
    eprintln!("   Rows:     {}", session.total_rows);
    eprintln!("   Created:  {}", session.created_count);
    eprintln!("   Updated:  {}", session.updated_count);
    eprintln!("   Skipped:  {}", session.skipped);
    eprintln!("   Failed:   {}", session.failed);

    if !session.errors.is_empty() {
        eprintln!("\n   Errors ({}):", session.errors.len());
        for issue in session.errors.iter().take(max_issues) {
            eprintln!("     - {}", describe(issue.row, &issue.message));
        }
    }
    if !session.warnings.is_empty() {
        eprintln!("\n   Warnings ({}):", session.warnings.len());
        for issue in session.warnings.iter().take(max_issues) {
            eprintln!("     - {}", describe(issue.row, &issue.message));
        }
    }
}

fn describe(row: Option<u64>, message: &str) -> String {
    match row {
        Some(line) => format!("line {}: {}", line, message),
        None => message.to_string(),
    }
}

fn format_delimiter(d: char) -> String {
    match d {
        '\t' => "\\t".to_string(),
        c => c.to_string(),
    }
}

fn write_output(content: &str, path: Option<&Path>) -> CliResult<()> {
    match path {
        Some(p) => {
            fs::write(p, content)?;
            eprintln!("Output written to: {}", p.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", content)?;
        }
    }
    Ok(())
}
