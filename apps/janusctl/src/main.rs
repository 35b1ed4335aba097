//! janusctl - submit door and image requests
//!
//! Writes requests into the same local queue the server watches and reads
//! their status back. `image` waits for the fresh picture and downloads it
//! from the artifact store the server publishes to (`JANUS_STORE`,
//! `JANUS_BUCKET`, `JANUS_S3_ENDPOINT`, `JANUS_S3_REGION`, `JANUS_STORE_DIR`).
//!
//! ```bash
//! janusctl door 1
//! janusctl image --dest /tmp/garage.jpg
//! janusctl image --no-wait
//! janusctl status image 7f3c...
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::time::Instant;
use tracing::debug;

use janus::queue::{LocalQueue, LocalQueueConfig, RequestQueue};
use janus::store::{ArtifactStore, LocalStore, S3Store, S3StoreConfig};
use janus::{NewRequest, RequestId, RequestKind, RequestStatus};

#[derive(Parser)]
#[command(name = "janusctl", about = "Submit door and image requests to janus")]
struct Cli {
    /// Queue root (defaults to JANUS_QUEUE_DIR or /var/lib/janus/queue)
    #[arg(long, global = true)]
    queue_dir: Option<PathBuf>,
    /// Requester name stored with new requests
    #[arg(long, global = true)]
    user: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Press a door button
    Door {
        /// Door index
        #[arg(default_value_t = 0, value_parser = clap::value_parser!(i64).range(0..=1))]
        index: i64,
    },
    /// Ask for a fresh picture and download it once published
    Image {
        /// Only enqueue the request; print its id and exit
        #[arg(long)]
        no_wait: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 90)]
        wait_secs: u64,
        /// Where to save the picture (defaults to ~/Downloads/<basename>.jpg)
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// Show the status of a request
    Status {
        #[arg(value_enum)]
        kind: KindArg,
        id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Door,
    Image,
}

impl From<KindArg> for RequestKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Door => RequestKind::Door,
            KindArg::Image => RequestKind::Image,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = cli
        .queue_dir
        .or_else(|| std::env::var("JANUS_QUEUE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| LocalQueueConfig::default().root);
    debug!("queue at {:?}", root);

    let queue = LocalQueue::open(LocalQueueConfig {
        root,
        ..Default::default()
    })
    .await?;

    match cli.command {
        Command::Door { index } => {
            let id = queue.submit(with_user(NewRequest::door(index), &cli.user)).await?;
            println!("{}", id);
        }
        Command::Image {
            no_wait,
            wait_secs,
            dest,
        } => {
            let id = queue.submit(with_user(NewRequest::image(), &cli.user)).await?;
            println!("{}", id);
            if no_wait {
                return Ok(());
            }

            let status = wait_for_terminal(&queue, &id, Duration::from_secs(wait_secs)).await?;
            if status != RequestStatus::Completed {
                bail!("image request {} ended as {}, nothing to download", id, status);
            }

            let key = format!("{}.jpg", image_basename());
            let dest = match dest {
                Some(dest) => dest,
                None => default_destination(&key)?,
            };
            download(store_from_env()?.as_ref(), &key, &dest).await?;
            println!("{}", dest.display());
        }
        Command::Status { kind, id } => {
            let kind = RequestKind::from(kind);
            match queue.get(kind, &RequestId::from(id.as_str())).await? {
                Some(request) => println!("{}", request.status),
                None => bail!("no {} request {}", kind, id),
            }
        }
    }
    Ok(())
}

fn with_user(request: NewRequest, user: &Option<String>) -> NewRequest {
    match user {
        Some(user) => request.user(user.as_str()),
        None => request,
    }
}

async fn wait_for_terminal(
    queue: &LocalQueue,
    id: &RequestId,
    limit: Duration,
) -> Result<RequestStatus> {
    let deadline = Instant::now() + limit;
    loop {
        let Some(request) = queue.get(RequestKind::Image, id).await? else {
            bail!("image request {} disappeared", id);
        };
        if request.status.is_terminal() {
            println!("{}", request.status);
            return Ok(request.status);
        }
        if Instant::now() >= deadline {
            bail!("image request {} still pending after {}s", id, limit.as_secs());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn image_basename() -> String {
    env_string("JANUS_IMAGE_BASENAME", "garage-image")
}

fn default_destination(file_name: &str) -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set; pass --dest")?;
    Ok(PathBuf::from(home).join("Downloads").join(file_name))
}

/// The store the server publishes to, from the same environment variables
fn store_from_env() -> Result<Arc<dyn ArtifactStore>> {
    Ok(match env_string("JANUS_STORE", "s3").to_lowercase().as_str() {
        "s3" => Arc::new(S3Store::new(S3StoreConfig {
            endpoint_url: std::env::var("JANUS_S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
            ..S3StoreConfig::s3(
                &env_string("JANUS_BUCKET", "janus-images"),
                &env_string("JANUS_S3_REGION", "us-east-1"),
            )
        })),
        "local" => Arc::new(LocalStore::new(env_string(
            "JANUS_STORE_DIR",
            "/var/lib/janus/artifacts",
        ))),
        other => bail!("Unknown JANUS_STORE {:?} (s3 or local)", other),
    })
}

async fn download(store: &dyn ArtifactStore, key: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    debug!("downloading {} to {:?}", key, dest);
    store
        .fetch(key, dest)
        .await
        .with_context(|| format!("Failed to download {}", key))
}
