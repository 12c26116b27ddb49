//! DS18x20 temperature probe on the one-wire bus
//!
//! The kernel `w1-therm` driver exposes each probe as
//! `/sys/bus/w1/devices/28-xxxxxxxxxxxx/w1_slave`:
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```
//!
//! The first line ends in `YES` once the CRC of the conversion is valid; the
//! second carries the temperature in millidegrees Celsius.

use futures::future::BoxFuture;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::{ReadingValue, SensorAdapter, SensorError, SensorKind, TemperatureUnit};

const FAMILY_PREFIX: &str = "28";
const SLAVE_FILE: &str = "w1_slave";

#[derive(Debug, Clone, PartialEq)]
enum Frame {
    /// CRC not confirmed yet, read again
    Pending,
    Millidegrees(i64),
    Malformed(String),
}

pub struct OneWireThermometer {
    device_file: PathBuf,
    attempts: u32,
    retry_delay: Duration,
}

impl OneWireThermometer {
    /// Locates the first DS18x20 below `base_dir`
    pub fn discover(
        base_dir: &Path,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self, SensorError> {
        let unavailable = |reason: String| SensorError::Unavailable {
            kind: SensorKind::Temperature,
            reason,
        };

        let entries = std::fs::read_dir(base_dir)
            .map_err(|e| unavailable(format!("cannot list {}: {}", base_dir.display(), e)))?;

        let device_dir = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(FAMILY_PREFIX))
            })
            .min()
            .ok_or_else(|| {
                unavailable(format!("no one-wire probe found in {}", base_dir.display()))
            })?;

        Ok(Self::new(device_dir.join(SLAVE_FILE), attempts, retry_delay))
    }

    pub fn new(device_file: PathBuf, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            device_file,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    pub fn device_file(&self) -> &Path {
        &self.device_file
    }

    async fn read_fahrenheit(&self) -> Result<f64, SensorError> {
        for attempt in 1..=self.attempts {
            let content = tokio::fs::read_to_string(&self.device_file)
                .await
                .map_err(|e| match e.kind() {
                    ErrorKind::NotFound => SensorError::Unavailable {
                        kind: SensorKind::Temperature,
                        reason: format!("{} disappeared", self.device_file.display()),
                    },
                    _ => transient(format!("cannot read {}: {}", self.device_file.display(), e)),
                })?;

            match parse_frame(&content) {
                Frame::Millidegrees(milli) => return Ok(to_fahrenheit(milli)),
                Frame::Malformed(reason) => return Err(transient(reason)),
                Frame::Pending => {
                    debug!(
                        "One-wire CRC not valid yet (attempt {}/{})",
                        attempt, self.attempts
                    );
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(transient(format!(
            "CRC still invalid after {} attempts",
            self.attempts
        )))
    }
}

impl SensorAdapter for OneWireThermometer {
    fn kind(&self) -> SensorKind {
        SensorKind::Temperature
    }

    fn sample(&self) -> BoxFuture<'_, Result<ReadingValue, SensorError>> {
        Box::pin(async move {
            let degrees = self.read_fahrenheit().await?;
            Ok(ReadingValue::Temperature {
                degrees,
                unit: TemperatureUnit::Fahrenheit,
            })
        })
    }
}

fn transient(reason: String) -> SensorError {
    SensorError::Transient {
        kind: SensorKind::Temperature,
        reason,
    }
}

fn parse_frame(content: &str) -> Frame {
    let mut lines = content.lines();
    let Some(status) = lines.next() else {
        return Frame::Pending;
    };
    if !status.trim_end().ends_with("YES") {
        return Frame::Pending;
    }

    let Some(data) = lines.next() else {
        return Frame::Malformed("missing data line".to_string());
    };
    match data.find("t=") {
        Some(pos) => data[pos + 2..]
            .trim()
            .parse::<i64>()
            .map(Frame::Millidegrees)
            .unwrap_or_else(|e| Frame::Malformed(format!("bad temperature field: {}", e))),
        None => Frame::Malformed("no t= field".to_string()),
    }
}

/// Fahrenheit rounded to the probe's published 0.1° precision
fn to_fahrenheit(millidegrees: i64) -> f64 {
    let celsius = millidegrees as f64 / 1000.0;
    let fahrenheit = celsius * 9.0 / 5.0 + 32.0;
    (fahrenheit * 10.0).round() / 10.0
}
