//! GPIO output drivers
//!
//! The relay board is driven through a narrow open/write/close surface so
//! the actuation logic does not care whether it runs on real hardware:
//! - [`SysfsGpio`]: Linux `/sys/class/gpio` interface
//! - [`LogGpio`]: logs every call, for development hosts without relays

use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Logic level of an output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn inverted(&self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "low"),
            Level::High => write!(f, "high"),
        }
    }
}

/// Opens output lines
#[async_trait::async_trait]
pub trait GpioDriver: Send + Sync {
    /// Claim `line` as an output, starting at `initial`
    async fn open(&self, line: u32, initial: Level) -> Result<Box<dyn OutputPin>>;
}

/// A claimed output line
#[async_trait::async_trait]
pub trait OutputPin: Send {
    async fn write(&mut self, level: Level) -> Result<()>;

    /// Release the line
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Linux sysfs GPIO driver
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    base: PathBuf,
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new("/sys/class/gpio")
    }
}

impl SysfsGpio {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn line_dir(&self, line: u32) -> PathBuf {
        self.base.join(format!("gpio{}", line))
    }
}

#[async_trait::async_trait]
impl GpioDriver for SysfsGpio {
    async fn open(&self, line: u32, initial: Level) -> Result<Box<dyn OutputPin>> {
        let dir = self.line_dir(line);

        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::write(self.base.join("export"), line.to_string())
                .await
                .with_context(|| format!("Failed to export GPIO {}", line))?;
        }

        // udev may take a moment to hand the new line's files over
        let direction = dir.join("direction");
        let mut attempts = 0;
        while !tokio::fs::try_exists(&direction).await.unwrap_or(false) {
            attempts += 1;
            if attempts > 20 {
                anyhow::bail!("GPIO {} did not appear under {:?}", line, dir);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // "high"/"low" sets the direction and the initial level in one write
        tokio::fs::write(&direction, initial.to_string())
            .await
            .with_context(|| format!("Failed to set GPIO {} as output", line))?;

        debug!("GPIO {} opened as output ({})", line, initial);
        Ok(Box::new(SysfsPin {
            line,
            value: dir.join("value"),
            unexport: self.base.join("unexport"),
        }))
    }
}

struct SysfsPin {
    line: u32,
    value: PathBuf,
    unexport: PathBuf,
}

#[async_trait::async_trait]
impl OutputPin for SysfsPin {
    async fn write(&mut self, level: Level) -> Result<()> {
        let raw = match level {
            Level::Low => "0",
            Level::High => "1",
        };
        tokio::fs::write(&self.value, raw)
            .await
            .with_context(|| format!("Failed to write GPIO {}", self.line))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        tokio::fs::write(&self.unexport, self.line.to_string())
            .await
            .with_context(|| format!("Failed to unexport GPIO {}", self.line))
    }
}

/// Driver that only logs; nothing is switched
#[derive(Debug, Clone, Default)]
pub struct LogGpio;

#[async_trait::async_trait]
impl GpioDriver for LogGpio {
    async fn open(&self, line: u32, initial: Level) -> Result<Box<dyn OutputPin>> {
        info!("[no gpio] open line {} ({})", line, initial);
        Ok(Box::new(LogPin { line }))
    }
}

struct LogPin {
    line: u32,
}

#[async_trait::async_trait]
impl OutputPin for LogPin {
    async fn write(&mut self, level: Level) -> Result<()> {
        info!("[no gpio] line {} -> {}", self.line, level);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        info!("[no gpio] close line {}", self.line);
        Ok(())
    }
}
