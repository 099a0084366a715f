//! activestore -- command-line client for a storage target and its ACTIVE
//! pointer.
//!
//! Every subcommand runs against the single target named in the YAML
//! configuration.  Ctrl+C cancels the in-flight operation, including any
//! pending retry backoff.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::info;

use activestore::config::{Config, LoggingConfig};
use activestore::{
    ActivePointer, CancelToken, ClaimOutcome, ObjectMeta, PointerState, PutOptions, Target,
};

/// Command-line arguments for activestore.
#[derive(Parser, Debug)]
#[command(
    name = "activestore",
    version,
    about = "Conditional-write object store and ACTIVE pointer client"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "activestore.example.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the ACTIVE pointer's payload and version.
    Read,
    /// Print the ACTIVE pointer's version.
    Head,
    /// Create the ACTIVE pointer if it does not exist.
    Claim { payload: String },
    /// Move the ACTIVE pointer, provided it is still at the given version.
    Update {
        payload: String,
        /// ETag the pointer must still have (S3, Azure).
        #[arg(long, required_unless_present = "generation")]
        etag: Option<String>,
        /// Generation the pointer must still have (GCS, memory).
        #[arg(long)]
        generation: Option<i64>,
    },
    /// Delete the ACTIVE pointer.
    Delete,
    /// List objects under a prefix.
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Unconditionally write an object.
    Put { key: String, payload: String },
    /// Print an object's contents.
    Get { key: String },
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn describe(meta: &ObjectMeta) -> String {
    format!(
        "etag={} generation={} size={}",
        meta.etag, meta.generation, meta.size
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config: Config = activestore::config::load_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    init_logging(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    if config.observability.metrics {
        let addr: SocketAddr = config
            .observability
            .metrics_listen
            .parse()
            .with_context(|| {
                format!("invalid metrics_listen '{}'", config.observability.metrics_listen)
            })?;
        activestore::metrics::init_metrics(Some(addr))?;
        info!("Prometheus metrics exporter listening on {}", addr);
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received SIGINT, cancelling");
                cancel.cancel();
            }
        });
    }

    let target = Arc::new(Target::new(config.target.clone()).await?);
    let pointer = ActivePointer::new(Arc::clone(&target), &config.pointer);

    match cli.command {
        Command::Read => match pointer.read(&cancel).await? {
            PointerState::Present(p) => {
                println!("{}", describe(&p.meta));
                println!("{}", String::from_utf8_lossy(&p.payload));
            }
            PointerState::Absent => println!("absent"),
        },
        Command::Head => match pointer.head(&cancel).await? {
            Some(meta) => println!("{}", describe(&meta)),
            None => println!("absent"),
        },
        Command::Claim { payload } => match pointer.claim(Bytes::from(payload), &cancel).await? {
            ClaimOutcome::Claimed(meta) => println!("claimed {}", describe(&meta)),
            ClaimOutcome::Adopted(p) => {
                println!("adopted {}", describe(&p.meta));
                println!("{}", String::from_utf8_lossy(&p.payload));
            }
        },
        Command::Update {
            payload,
            etag,
            generation,
        } => {
            let expected = ObjectMeta {
                etag: etag.unwrap_or_default(),
                generation: generation.unwrap_or_default(),
                ..ObjectMeta::default()
            };
            let meta = pointer.update(Bytes::from(payload), &expected, &cancel).await?;
            println!("updated {}", describe(&meta));
        }
        Command::Delete => {
            pointer.delete(&cancel).await?;
            println!("deleted {}", pointer.key());
        }
        Command::List { prefix } => {
            for entry in target.list(&prefix, &cancel).await? {
                println!("{}\t{}\t{}", entry.key, entry.size, entry.etag);
            }
        }
        Command::Put { key, payload } => {
            let meta = target
                .put(&key, Bytes::from(payload), &PutOptions::default(), &cancel)
                .await?;
            println!("{}", describe(&meta));
        }
        Command::Get { key } => {
            let obj = target.get(&key, &cancel).await?;
            println!("{}", describe(&obj.meta));
            println!("{}", String::from_utf8_lossy(&obj.data));
        }
    }

    Ok(())
}
