//! Operator entry point for the heart-rate relay.
//!
//! # Responsibility
//! - Wire a JSON-lines sample file into a `MonitorSession` backed by a local
//!   SQLite file.
//! - Inspect the identity and the published document tree.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use heartbeat_core::db::open_shared;
use heartbeat_core::pipeline::sink::{
    private_history_parent, public_history_parent, public_latest_path,
};
use heartbeat_core::{
    init_logging_with, Advisory, ChildListQuery, CursorStore, IdentityProvider, JsonLinesSource,
    LogSettings, MonitorSession, PipelineConfig, SampleSource, SessionOptions, SinkSet,
    SqliteDocumentRepo, SqliteStateRepo,
};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Relay heart-rate samples to a private log and a public share stream.
#[derive(Parser)]
#[command(name = "heartbeat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// SQLite file with cursor, identity and documents
    #[arg(long, global = true, env = "HEARTBEAT_DB_PATH")]
    db: Option<PathBuf>,

    /// Absolute directory for rolling log files; logging is off when unset
    #[arg(long, global = true, env = "HEARTBEAT_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "HEARTBEAT_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Observe a sample file and relay new samples until interrupted
    Run(RunArgs),

    /// Print the public share id, creating it on first use
    ShareId,

    /// Print the latest published record
    Latest,

    /// Print published history
    History(HistoryArgs),

    /// Manage the owner identity used for the private log
    Owner(OwnerArgs),

    /// Inspect or reset stored observer cursors
    Cursor(CursorArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON-lines file with one sample object per line
    #[arg(long)]
    samples: PathBuf,

    /// Poll interval in milliseconds
    #[arg(long, env = "HEARTBEAT_POLL_MS")]
    poll_ms: Option<u64>,

    /// Display locally without writing any document
    #[arg(long)]
    local_only: bool,

    /// Owner id to record before starting
    #[arg(long, env = "HEARTBEAT_OWNER_ID")]
    owner_id: Option<String>,

    /// Run one wake cycle, drain writes and exit
    #[arg(long)]
    once: bool,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    /// Maximum number of records to print
    #[arg(long)]
    limit: Option<u32>,

    /// Start from the newest record
    #[arg(long)]
    newest_first: bool,

    /// Read the private owner log instead of the public stream
    #[arg(long)]
    private: bool,
}

#[derive(Args, Debug)]
struct OwnerArgs {
    #[command(subcommand)]
    command: OwnerCommand,
}

#[derive(Subcommand, Debug)]
enum OwnerCommand {
    /// Record the owner id
    Set { owner_id: String },
    /// Forget the owner id; private writes stop until it is set again
    Clear,
    /// Print the owner id
    Show,
}

#[derive(Args, Debug)]
struct CursorArgs {
    #[command(subcommand)]
    command: CursorCommand,
}

#[derive(Subcommand, Debug)]
enum CursorCommand {
    /// Print every stored cursor with its source id
    Show,
    /// Forget cursors so the next run replays full history
    Reset {
        /// Only reset the cursor of this sample file
        #[arg(long)]
        samples: Option<PathBuf>,
    },
}

struct Stores {
    state: Arc<SqliteStateRepo>,
    documents: SqliteDocumentRepo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    config.validate()?;

    if let Some(log_dir) = &config.log_dir {
        init_logging_with(&LogSettings {
            level: config.log_level.clone(),
            log_dir: log_dir.clone(),
            mirror_to_stderr: true,
        })
        .map_err(anyhow::Error::msg)
        .context("logging init failed")?;
    }

    let stores = open_stores(&config)?;
    match cli.command {
        Commands::Run(args) => run(&config, &stores, args).await,
        Commands::ShareId => {
            println!("{}", stores.state.get_or_create_share_id()?);
            Ok(())
        }
        Commands::Latest => latest(&stores),
        Commands::History(args) => history(&stores, &args),
        Commands::Owner(args) => owner(&stores, args.command),
        Commands::Cursor(args) => cursor(&stores, args.command),
    }
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::default();
    if let Some(db) = &cli.global.db {
        config.db_path = db.clone();
    }
    config.log_dir = cli.global.log_dir.clone();
    if let Some(level) = &cli.global.log_level {
        config.log_level = level.clone();
    }
    if let Commands::Run(args) = &cli.command {
        if let Some(poll_ms) = args.poll_ms {
            config.poll_interval = Some(Duration::from_millis(poll_ms));
        }
        config.publish = !args.local_only;
    }
    Ok(config)
}

fn open_stores(config: &PipelineConfig) -> Result<Stores> {
    let conn = open_shared(&config.db_path)
        .with_context(|| format!("cannot open {}", config.db_path.display()))?;
    Ok(Stores {
        state: Arc::new(SqliteStateRepo::new(conn.clone())),
        documents: SqliteDocumentRepo::new(conn),
    })
}

async fn run(config: &PipelineConfig, stores: &Stores, args: RunArgs) -> Result<()> {
    if let Some(owner_id) = &args.owner_id {
        stores.state.set_owner_id(owner_id)?;
    }

    let sinks = if config.publish {
        SinkSet::published(Arc::new(stores.documents.clone()))
    } else {
        SinkSet::local_only()
    };
    let source = Arc::new(sample_source(&args.samples)?);
    let session = MonitorSession::new(source, stores.state.clone(), stores.state.clone(), sinks)
        .with_options(SessionOptions {
            periodic_wake: config.poll_interval,
        });

    let mut observed = session.subscribe_observed();
    let mut advisories = session.subscribe_advisories();
    let printer = tokio::spawn(async move {
        while observed.changed().await.is_ok() {
            let record = observed.borrow_and_update().clone();
            if let Some(record) = record {
                println!(
                    "{} bpm={} source={}",
                    record.at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    record.bpm,
                    record.source
                );
            }
        }
    });
    let reporter = tokio::spawn(async move {
        loop {
            match advisories.recv().await {
                Ok(advisory) => report_advisory(&advisory),
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("warning: {skipped} advisories dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    session
        .start()
        .await
        .with_context(|| format!("cannot observe {}", args.samples.display()))?;

    if args.once {
        session.wake_now().await?;
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("cannot listen for ctrl-c")?;
        info!("event=cli_shutdown module=cli status=start reason=ctrl_c");
    }
    session.stop().await;

    drop(session);
    let _ = printer.await;
    let _ = reporter.await;
    Ok(())
}

fn report_advisory(advisory: &Advisory) {
    match advisory {
        Advisory::SinkFailed { sink, key, message } => {
            eprintln!("warning: sink {sink} failed for {key}: {message}");
        }
        other => eprintln!("warning: {}", other.message()),
    }
}

fn latest(stores: &Stores) -> Result<()> {
    let share_id = stores.state.get_or_create_share_id()?;
    match stores.documents.get(&public_latest_path(&share_id)?)? {
        Some(body) => println!("{body}"),
        None => println!("no record published for share id {share_id}"),
    }
    Ok(())
}

fn history(stores: &Stores, args: &HistoryArgs) -> Result<()> {
    let parent = if args.private {
        let Some(owner_id) = stores.state.owner_id() else {
            bail!("no owner id set; run `heartbeat owner set <id>` first");
        };
        private_history_parent(&owner_id)?
    } else {
        public_history_parent(&stores.state.get_or_create_share_id()?)?
    };

    let query = ChildListQuery {
        limit: args.limit,
        newest_first: args.newest_first,
    };
    for (key, body) in stores.documents.list_children(&parent, &query)? {
        println!("{key} {body}");
    }
    Ok(())
}

fn owner(stores: &Stores, command: OwnerCommand) -> Result<()> {
    match command {
        OwnerCommand::Set { owner_id } => stores.state.set_owner_id(&owner_id)?,
        OwnerCommand::Clear => stores.state.clear_owner_id()?,
        OwnerCommand::Show => match stores.state.owner_id() {
            Some(owner_id) => println!("{owner_id}"),
            None => println!("no owner id set"),
        },
    }
    Ok(())
}

/// Cursors are keyed by source id, which embeds the path; an absolute path
/// keeps the id stable across working directories.
fn sample_source(path: &Path) -> Result<JsonLinesSource> {
    let path = std::path::absolute(path)
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    Ok(JsonLinesSource::new(path))
}

fn cursor(stores: &Stores, command: CursorCommand) -> Result<()> {
    match command {
        CursorCommand::Show => {
            for (source_id, cursor) in stores.state.list_cursors()? {
                println!("{source_id} {cursor}");
            }
        }
        CursorCommand::Reset { samples: Some(path) } => {
            let source = sample_source(&path)?;
            stores.state.clear_cursor(source.source_id())?;
            println!("cursor reset for {}", source.source_id());
        }
        CursorCommand::Reset { samples: None } => {
            let removed = stores.state.clear_all_cursors()?;
            println!("{removed} cursor(s) reset");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{build_config, Cli, Commands, CursorCommand, OwnerCommand};
    use clap::Parser;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    #[test]
    fn run_flags_override_config_defaults() {
        let cli = Cli::try_parse_from([
            "heartbeat",
            "--db",
            "/tmp/hb.sqlite3",
            "run",
            "--samples",
            "samples.jsonl",
            "--poll-ms",
            "250",
            "--local-only",
        ])
        .unwrap();

        let config = build_config(&cli).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/hb.sqlite3"));
        assert_eq!(config.poll_interval, Some(Duration::from_millis(250)));
        assert!(!config.publish);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inspection_commands_keep_publishing_default() {
        let cli = Cli::try_parse_from(["heartbeat", "owner", "set", "uid-1"]).unwrap();
        assert!(matches!(
            &cli.command,
            Commands::Owner(args) if matches!(&args.command, OwnerCommand::Set { owner_id } if owner_id == "uid-1")
        ));
        assert!(build_config(&cli).unwrap().publish);
    }

    #[test]
    fn cursor_reset_accepts_optional_samples_path() {
        let all = Cli::try_parse_from(["heartbeat", "cursor", "reset"]).unwrap();
        assert!(matches!(
            &all.command,
            Commands::Cursor(args) if matches!(args.command, CursorCommand::Reset { samples: None })
        ));

        let one =
            Cli::try_parse_from(["heartbeat", "cursor", "reset", "--samples", "a.jsonl"]).unwrap();
        assert!(matches!(
            &one.command,
            Commands::Cursor(args)
                if matches!(&args.command, CursorCommand::Reset { samples: Some(path) } if path.ends_with("a.jsonl"))
        ));
    }

    #[test]
    fn run_requires_samples_path() {
        assert!(Cli::try_parse_from(["heartbeat", "run"]).is_err());
    }
}
