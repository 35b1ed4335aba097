//! Door relay actuation
//!
//! A door "button press" is a fixed-length pulse on one of two relay lines.
//! The relays are wired active-low by default: idle is high, pressing drives
//! the line low for the pulse duration.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::gpio::{GpioDriver, Level};
use crate::request::DoorIndex;

/// Relay wiring and pulse shape
#[derive(Debug, Clone)]
pub struct ActuationConfig {
    /// GPIO line per door, indexed by [`DoorIndex`]
    pub lines: [u32; 2],
    /// How long the relay is held active
    pub pulse: Duration,
    /// Level that closes the relay
    pub active_level: Level,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            lines: [23, 24],
            pulse: Duration::from_millis(1000),
            active_level: Level::Low,
        }
    }
}

/// Pulses the door relays
pub struct ActuationController {
    driver: Arc<dyn GpioDriver>,
    config: ActuationConfig,
    /// One pulse per output at a time
    outputs: [Mutex<()>; 2],
}

impl ActuationController {
    pub fn new(driver: Arc<dyn GpioDriver>, config: ActuationConfig) -> Self {
        Self {
            driver,
            config,
            outputs: [Mutex::new(()), Mutex::new(())],
        }
    }

    pub fn config(&self) -> &ActuationConfig {
        &self.config
    }

    /// Pulse the relay for `door` and wait for the pulse to finish.
    ///
    /// Driver failures are returned, never retried: repeating a half-done
    /// pulse could press the button twice.
    pub async fn actuate(&self, door: DoorIndex) -> Result<()> {
        let line = self.config.lines[door.as_usize()];
        let active = self.config.active_level;
        let idle = active.inverted();

        let _output = self.outputs[door.as_usize()].lock().await;
        info!(%door, line, "toggle door");

        let mut pin = self.driver.open(line, idle).await?;

        let pressed = pin.write(active).await;
        if pressed.is_ok() {
            tokio::time::sleep(self.config.pulse).await;
        }
        let released = pin.write(idle).await;
        let closed = pin.close().await;

        pressed?;
        released?;
        closed?;
        info!(%door, line, "door pulse finished");
        Ok(())
    }

    /// Start a pulse in the background; failures are logged
    pub fn trigger(self: &Arc<Self>, door: DoorIndex) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = controller.actuate(door).await {
                warn!(%door, "door actuation failed: {:#}", e);
            }
        })
    }
}
