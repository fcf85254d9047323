// casesync CLI - sync test-management projects through git
use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

// Macro for conditional printing based on quiet flag
macro_rules! qprintln {
    ($quiet:expr, $($arg:tt)*) => {
        if !$quiet {
            println!($($arg)*);
        }
    };
}

use casesync::sync::importer::preview_import;
use casesync::{
    init_logging_with_level, start_server, with_trace_id, AppConfig, GitSettingsUpdate,
    ImportOptions, PgProjectStore, ProjectStore, SyncService, SyncTree,
};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "casesync - keep test-management projects in a git repository",
    long_about = None,
    after_help = "QUICK START:
  1. Point a project at a remote:  casesync configure 1 --remote-url https://github.com/acme/qa-data.git --token $TOKEN
  2. Publish the project:          casesync push 1
  3. On another installation:      casesync pull 1
  4. Keep both in step:            casesync sync 1

EXAMPLES:
  # Inspect what an import would do without touching the database
  casesync import 1 --memory

  # Serve the HTTP API
  casesync serve --port 8080"
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "CASESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (DEBUG level). Default is WARN level.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// PostgreSQL connection URL, overrides the config file and DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start HTTP REST API server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Create the tables casesync uses if they are missing
        #[arg(long)]
        bootstrap_schema: bool,
    },

    /// Create the project's working directory, cloning the remote if one is set
    Init { project_id: i64 },

    /// Write the project's rows into its working directory
    Export { project_id: i64 },

    /// Load the working directory into the database
    Import {
        project_id: i64,
        /// Keep rows that are absent from the working directory
        #[arg(long)]
        keep_missing: bool,
        /// Import into a throwaway in-memory store and report what would change
        #[arg(long)]
        memory: bool,
    },

    /// Export, commit, reconcile with the remote and push
    Push { project_id: i64 },

    /// Reconcile with the remote and import
    Pull { project_id: i64 },

    /// Export, commit, reconcile, import and push
    Sync { project_id: i64 },

    /// Show settings and repository state
    Status { project_id: i64 },

    /// Update the project's git settings; pass an empty value to clear one
    Configure {
        project_id: i64,
        #[arg(long)]
        remote_url: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Personal access token for HTTPS remotes
        #[arg(long, env = "CASESYNC_ACCESS_TOKEN", hide_env_values = true)]
        token: Option<String>,
        #[arg(long)]
        author_name: Option<String>,
        #[arg(long)]
        author_email: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI args first to get verbose flag
    let cli = Cli::parse();

    // Ignore error if already initialized
    let _ = init_logging_with_level(cli.verbose, cli.quiet);

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.database_url.clone() {
        config.database.url = url;
    }

    let quiet = cli.quiet;
    with_trace_id("casesync-cli", run(cli.command, config, quiet)).await
}

async fn run(command: Commands, config: AppConfig, quiet: bool) -> Result<()> {
    // Dry-run imports never touch the database
    if let Commands::Import {
        project_id,
        keep_missing,
        memory: true,
    } = command
    {
        return dry_run_import(&config, project_id, keep_missing, quiet).await;
    }

    let store = PgProjectStore::connect(
        &config.database.url,
        config.database.max_connections,
        config.database.connect_timeout,
    )
    .await?;

    match command {
        Commands::Serve {
            host,
            port,
            bootstrap_schema,
        } => {
            if bootstrap_schema {
                store.bootstrap_schema().await?;
            }
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let service = service(store, &config);

            qprintln!(quiet, "Starting casesync HTTP server on {host}:{port}");
            qprintln!(quiet, "API endpoints:");
            qprintln!(quiet, "   GET    /health");
            qprintln!(quiet, "   GET    /api/projects/:id/git/settings");
            qprintln!(quiet, "   PUT    /api/projects/:id/git/settings");
            qprintln!(
                quiet,
                "   POST   /api/projects/:id/git/{{init,export,import,push,pull,sync}}"
            );
            qprintln!(quiet, "   GET    /api/projects/:id/git/status");

            start_server(service, &host, port).await?;
        }

        Commands::Init { project_id } => {
            let status = service(store, &config).init(project_id).await?;
            print_json(quiet, &status)?;
        }

        Commands::Export { project_id } => {
            let summary = service(store, &config).export(project_id).await?;
            print_json(quiet, &summary)?;
        }

        Commands::Import {
            project_id,
            keep_missing,
            ..
        } => {
            let options = ImportOptions {
                delete_missing: config.sync.delete_missing && !keep_missing,
            };
            let summary = service(store, &config).import(project_id, options).await?;
            print_json(quiet, &summary)?;
        }

        Commands::Push { project_id } => {
            let report = service(store, &config).push(project_id).await?;
            print_json(quiet, &report)?;
        }

        Commands::Pull { project_id } => {
            let report = service(store, &config).pull(project_id).await?;
            print_json(quiet, &report)?;
        }

        Commands::Sync { project_id } => {
            let report = service(store, &config).sync(project_id).await?;
            print_json(quiet, &report)?;
        }

        Commands::Status { project_id } => {
            let status = service(store, &config).status(project_id).await?;
            print_json(quiet, &status)?;
        }

        Commands::Configure {
            project_id,
            remote_url,
            branch,
            token,
            author_name,
            author_email,
        } => {
            let update = GitSettingsUpdate {
                remote_url,
                branch,
                access_token: token,
                author_name,
                author_email,
            };
            let view = service(store, &config).configure(project_id, update).await?;
            print_json(quiet, &view)?;
        }
    }

    Ok(())
}

fn service(store: PgProjectStore, config: &AppConfig) -> Arc<SyncService<dyn ProjectStore>> {
    let store: Arc<dyn ProjectStore> = Arc::new(store);
    Arc::new(SyncService::new(store, config.sync.clone()))
}

async fn dry_run_import(
    config: &AppConfig,
    project_id: i64,
    keep_missing: bool,
    quiet: bool,
) -> Result<()> {
    let tree = SyncTree::for_project(&config.sync.work_dir, project_id);
    let options = ImportOptions {
        delete_missing: !keep_missing,
    };
    let summary = preview_import(&tree, project_id, options).await?;
    print_json(quiet, &summary)
}

fn print_json<T: Serialize>(quiet: bool, value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    qprintln!(quiet, "{rendered}");
    Ok(())
}
