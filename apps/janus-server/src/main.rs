//! Janus Server - device-side coordinator
//!
//! Drains pending door and image requests from the queue, pulses the door
//! relays and keeps the published camera image fresh.
//!
//! ## Usage
//!
//! ```bash
//! # Raspberry Pi with relays on BCM 23/24, publishing to S3
//! JANUS_BUCKET=my-garage janus-server
//!
//! # Development host: log-only GPIO, webcam, local artifact directory
//! JANUS_GPIO=log JANUS_CAPTURE_MODE=on-demand JANUS_STORE=local janus-server
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use janus::actuation::ActuationConfig;
use janus::capture::CaptureConfig;
use janus::gpio::{GpioDriver, LogGpio, SysfsGpio};
use janus::publish::PublishConfig;
use janus::queue::{LocalQueue, LocalQueueConfig, RequestQueue};
use janus::scheduler::SchedulerConfig;
use janus::store::{ArtifactStore, LocalStore, S3Store, S3StoreConfig};
use janus::watcher::WatcherConfig;
use janus::{Coordinator, CoordinatorConfig};

/// Server configuration from environment
struct Config {
    queue_dir: PathBuf,
    queue_poll_ms: u64,
    store: String,
    bucket: String,
    s3_endpoint: Option<String>,
    s3_region: String,
    store_dir: PathBuf,
    gpio: String,
    door_pins: [u32; 2],
    pulse_ms: u64,
    capture_mode: String,
    capture_cmd: Option<String>,
    image_path: PathBuf,
    image_basename: String,
    refresh_secs: u64,
    archive_secs: u64,
    door_timeout_secs: u64,
    image_timeout_secs: u64,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    fn from_env() -> Self {
        Self {
            queue_dir: PathBuf::from(env_string("JANUS_QUEUE_DIR", "/var/lib/janus/queue")),
            queue_poll_ms: env_or("JANUS_QUEUE_POLL_MS", 500),
            store: env_string("JANUS_STORE", "s3").to_lowercase(),
            bucket: env_string("JANUS_BUCKET", "janus-images"),
            s3_endpoint: std::env::var("JANUS_S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
            s3_region: env_string("JANUS_S3_REGION", "us-east-1"),
            store_dir: PathBuf::from(env_string("JANUS_STORE_DIR", "/var/lib/janus/artifacts")),
            gpio: env_string("JANUS_GPIO", "sysfs").to_lowercase(),
            door_pins: [env_or("JANUS_DOOR0_PIN", 23), env_or("JANUS_DOOR1_PIN", 24)],
            pulse_ms: env_or("JANUS_PULSE_MS", 1000),
            capture_mode: env_string("JANUS_CAPTURE_MODE", "timelapse").to_lowercase(),
            capture_cmd: std::env::var("JANUS_CAPTURE_CMD").ok().filter(|s| !s.trim().is_empty()),
            image_path: PathBuf::from(env_string("JANUS_IMAGE_PATH", "/tmp/garage-image.jpg")),
            image_basename: env_string("JANUS_IMAGE_BASENAME", "garage-image"),
            refresh_secs: env_or("JANUS_REFRESH_SECS", 30),
            archive_secs: env_or("JANUS_ARCHIVE_SECS", 1800),
            door_timeout_secs: env_or("JANUS_DOOR_TIMEOUT_SECS", 10),
            image_timeout_secs: env_or("JANUS_IMAGE_TIMEOUT_SECS", 60),
        }
    }

    fn coordinator(&self) -> Result<CoordinatorConfig> {
        let mut capture = match self.capture_mode.as_str() {
            "timelapse" => CaptureConfig::timelapse(&self.image_path),
            "on-demand" | "ondemand" => CaptureConfig::on_demand(&self.image_path),
            other => bail!("Unknown JANUS_CAPTURE_MODE {:?} (timelapse or on-demand)", other),
        };
        if let Some(ref cmd) = self.capture_cmd {
            capture = capture.with_command_line(cmd)?;
        }

        Ok(CoordinatorConfig {
            actuation: ActuationConfig {
                lines: self.door_pins,
                pulse: Duration::from_millis(self.pulse_ms),
                ..Default::default()
            },
            capture,
            publish: PublishConfig {
                basename: self.image_basename.clone(),
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                refresh_interval: Duration::from_secs(self.refresh_secs),
                archive_interval: Duration::from_secs(self.archive_secs),
                ..Default::default()
            },
            watcher: WatcherConfig {
                door_timeout: Duration::from_secs(self.door_timeout_secs),
                image_timeout: (self.image_timeout_secs > 0)
                    .then(|| Duration::from_secs(self.image_timeout_secs)),
                ..Default::default()
            },
        })
    }

    fn store(&self) -> Result<Arc<dyn ArtifactStore>> {
        Ok(match self.store.as_str() {
            "s3" => Arc::new(S3Store::new(S3StoreConfig {
                endpoint_url: self.s3_endpoint.clone(),
                ..S3StoreConfig::s3(&self.bucket, &self.s3_region)
            })),
            "local" => Arc::new(LocalStore::new(&self.store_dir)),
            other => bail!("Unknown JANUS_STORE {:?} (s3 or local)", other),
        })
    }

    fn gpio(&self) -> Result<Arc<dyn GpioDriver>> {
        Ok(match self.gpio.as_str() {
            "sysfs" => Arc::new(SysfsGpio::default()),
            "log" | "none" => Arc::new(LogGpio),
            other => bail!("Unknown JANUS_GPIO {:?} (sysfs or log)", other),
        })
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_logging();

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env();

    info!("Janus Server starting");
    info!("  Queue: {:?}", config.queue_dir);
    info!("  Store: {}", config.store);
    info!("  GPIO: {} (doors on {:?})", config.gpio, config.door_pins);
    info!("  Capture: {} -> {:?}", config.capture_mode, config.image_path);
    info!(
        "  Refresh every {}s, archive every {}s",
        config.refresh_secs, config.archive_secs
    );

    let queue: Arc<dyn RequestQueue> = Arc::new(
        LocalQueue::open(LocalQueueConfig {
            root: config.queue_dir.clone(),
            poll_interval: Duration::from_millis(config.queue_poll_ms),
        })
        .await?,
    );
    let coordinator = Coordinator::new(config.coordinator()?, queue, config.store()?, config.gpio()?);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal.cancel();
        }
    });

    coordinator.run(shutdown).await
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "janus=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
