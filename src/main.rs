use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use dimse::{DimseScu, MoveRequest, PersistenceAdapter, StorageOptions, StoreScp};
use futures_util::{pin_mut, StreamExt};
use pacsflow::collect;
use pacsflow::io::{parse_dir_to_csv, parse_dir_to_json, parse_dir_to_store};
use pacsflow::{init_logging, Config, RedbStore};

#[derive(Parser, Debug)]
#[command(
    name = "pacsflow",
    about = "Query, retrieve, send and index DICOM studies"
)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = "pacsflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Csv,
    Json,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// C-ECHO the called node
    Echo {
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Run the configured C-FIND
    Find {
        /// CSV output; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Record found studies in the database instead of writing CSV
        #[arg(long)]
        store: bool,
    },
    /// C-MOVE pending studies, or the resources CSV when no database is configured
    Move {
        /// Report pending sub-operation updates
        #[arg(long)]
        progress: bool,
    },
    /// C-STORE a file or directory to the called node
    Send { path: PathBuf },
    /// Run the storage SCP until interrupted
    Server,
    /// Extract the configured tags from every file under a directory
    Parse {
        src: PathBuf,
        /// Defaults to the storage resources_meta file
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = Format::Csv)]
        format: Format,
        #[arg(short, long, default_value_t = 4)]
        threads: usize,
        /// Add the file path as a column
        #[arg(long)]
        include_path: bool,
    },
    /// Record every file under a directory as an image in the database
    Ingest {
        src: PathBuf,
        #[arg(long)]
        institution: Option<String>,
        #[arg(short, long, default_value_t = 4)]
        threads: usize,
    },
    /// List studies found but not yet retrieved
    Pending,
}

fn open_store(config: &Config) -> anyhow::Result<Option<RedbStore>> {
    match &config.database {
        Some(db) => Ok(Some(RedbStore::open(&db.path).with_context(|| {
            format!("opening database {}", db.path.display())
        })?)),
        None => Ok(None),
    }
}

fn require_store(config: &Config) -> anyhow::Result<RedbStore> {
    open_store(config)?.context("this command needs a [database] section")
}

fn storage_options(config: &Config) -> StorageOptions {
    StorageOptions::new(&config.storage.directory).with_sort_by(config.storage.sort_by)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(&config.logging)?;

    let scu = DimseScu::new(config.dimse_config());
    let called = &config.net.called_node;

    match cli.cmd {
        Cmd::Echo { retries } => {
            if scu.test_connection(called, retries).await? {
                println!("{} answered C-ECHO", called);
            } else {
                anyhow::bail!("{} did not answer C-ECHO with success", called);
            }
        }
        Cmd::Find { output, store } => {
            let query = config.find_query()?;
            let summary = if store {
                let db = require_store(&config)?;
                collect::find_to_store(&scu, called, query, &db).await?
            } else if let Some(path) = output {
                let file = BufWriter::new(File::create(&path)?);
                collect::find_to_csv(&scu, called, query, file).await?
            } else {
                collect::find_to_csv(&scu, called, query, std::io::stdout().lock()).await?
            };
            eprintln!("{}", serde_json::to_string(&summary)?);
        }
        Cmd::Move { progress } => {
            let window = config.move_config.window()?;
            let destination = config.net.dest_node().clone();
            let summary = match open_store(&config)? {
                Some(db) => {
                    let db: Arc<dyn PersistenceAdapter> = Arc::new(db);
                    collect::move_pending_studies(
                        &scu,
                        called,
                        db,
                        storage_options(&config),
                        window,
                        Some(destination),
                    )
                    .await?
                }
                None => {
                    let resources = config
                        .storage
                        .resources
                        .as_ref()
                        .context("set storage.resources or a [database] section")?;
                    let level = config.move_config.query_level;
                    let ids = collect::read_resources(resources, level)?;
                    let request = MoveRequest::new(level, ids, storage_options(&config))
                        .with_destination(destination)
                        .with_window(window)
                        .with_progress(progress);
                    collect::move_identifiers(&scu, called, request).await?
                }
            };
            eprintln!("{}", serde_json::to_string(&summary)?);
        }
        Cmd::Send { path } => {
            let stream = scu.send_path(called, &path).await?;
            pin_mut!(stream);
            let (mut sent, mut failed) = (0usize, 0usize);
            while let Some((file, status)) = stream.next().await {
                if status.is_success() {
                    sent += 1;
                } else {
                    failed += 1;
                    eprintln!("{}: status 0x{:04X}", file.display(), status.status);
                }
            }
            println!("sent {} file(s), {} failed", sent, failed);
        }
        Cmd::Server => {
            let mut storage = storage_options(&config);
            if let Some(db) = open_store(&config)? {
                storage = storage.with_persistence(Arc::new(db));
            }
            let mut scp = StoreScp::new(config.net.dest_node().clone(), config.dimse_config(), storage);
            scp.serve(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }
        Cmd::Parse {
            src,
            output,
            format,
            threads,
            include_path,
        } => {
            let group = config.tag_group();
            let path = output.unwrap_or_else(|| config.storage.resources_meta.clone());
            let file = BufWriter::new(File::create(&path)?);
            let summary = tokio::task::spawn_blocking(move || match format {
                Format::Csv => parse_dir_to_csv(&src, &group, file, threads, include_path),
                Format::Json => parse_dir_to_json(&src, &group, file, threads, include_path),
            })
            .await??;
            eprintln!("{}", serde_json::to_string(&summary)?);
        }
        Cmd::Ingest {
            src,
            institution,
            threads,
        } => {
            let db = require_store(&config)?;
            let summary = tokio::task::spawn_blocking(move || {
                parse_dir_to_store(&src, &db, institution.as_deref(), threads)
            })
            .await??;
            eprintln!("{}", serde_json::to_string(&summary)?);
        }
        Cmd::Pending => {
            let db = require_store(&config)?;
            for study_uid in db.studies_pending_move()? {
                println!("{}", study_uid);
            }
        }
    }
    Ok(())
}
