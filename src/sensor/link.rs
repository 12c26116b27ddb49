//! Wireless link quality
//!
//! The signal level and association time come from `iw dev <iface> station
//! dump`. The command is hidden behind [`LinkQualityProbe`] so nothing else
//! depends on an external process.

use futures::future::BoxFuture;
use std::io::ErrorKind;
use tokio::process::Command;
use tracing::debug;

use super::{ReadingValue, SensorAdapter, SensorError, SensorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSample {
    pub signal_dbm: i32,
    pub connected_secs: u64,
}

pub trait LinkQualityProbe: Send + Sync {
    fn sample(&self) -> BoxFuture<'_, Result<LinkSample, SensorError>>;
}

pub struct IwProbe {
    interface: String,
}

impl IwProbe {
    pub fn new(interface: String) -> Self {
        Self { interface }
    }
}

impl LinkQualityProbe for IwProbe {
    fn sample(&self) -> BoxFuture<'_, Result<LinkSample, SensorError>> {
        Box::pin(async move {
            let output = Command::new("iw")
                .args(["dev", &self.interface, "station", "dump"])
                .output()
                .await
                .map_err(|e| match e.kind() {
                    ErrorKind::NotFound => SensorError::Unavailable {
                        kind: SensorKind::LinkQuality,
                        reason: "iw is not installed".to_string(),
                    },
                    _ => transient(format!("failed to run iw: {}", e)),
                })?;

            if !output.status.success() {
                return Err(transient(format!(
                    "iw exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            debug!("iw station dump for {}: {} bytes", self.interface, stdout.len());
            parse_station_dump(&stdout).ok_or_else(|| {
                transient(format!(
                    "no associated station on {} (signal or connected time missing)",
                    self.interface
                ))
            })
        })
    }
}

/// Adapts any [`LinkQualityProbe`] to the common sensor interface
pub struct LinkQualityAdapter {
    probe: Box<dyn LinkQualityProbe>,
}

impl LinkQualityAdapter {
    pub fn new(probe: Box<dyn LinkQualityProbe>) -> Self {
        Self { probe }
    }
}

impl SensorAdapter for LinkQualityAdapter {
    fn kind(&self) -> SensorKind {
        SensorKind::LinkQuality
    }

    fn sample(&self) -> BoxFuture<'_, Result<ReadingValue, SensorError>> {
        Box::pin(async move {
            let sample = self.probe.sample().await?;
            Ok(ReadingValue::LinkQuality {
                signal_dbm: sample.signal_dbm,
                connected_secs: sample.connected_secs,
            })
        })
    }
}

fn transient(reason: String) -> SensorError {
    SensorError::Transient {
        kind: SensorKind::LinkQuality,
        reason,
    }
}

/// Extracts `signal:` and `connected time:` from the first station
pub fn parse_station_dump(text: &str) -> Option<LinkSample> {
    let mut signal_dbm = None;
    let mut connected_secs = None;

    for line in text.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("signal:") {
            signal_dbm = signal_dbm.or_else(|| first_token(rest)?.parse().ok());
        } else if let Some(rest) = line.strip_prefix("connected time:") {
            connected_secs = connected_secs.or_else(|| first_token(rest)?.parse().ok());
        }
    }

    Some(LinkSample {
        signal_dbm: signal_dbm?,
        connected_secs: connected_secs?,
    })
}

fn first_token(text: &str) -> Option<&str> {
    text.split_whitespace().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "Station 64:66:b3:12:34:56 (on wlan0)
\tinactive time:\t210 ms
\trx bytes:\t123456
\tsignal:  \t-58 [-58] dBm
\tsignal avg:\t-57 [-57] dBm
\ttx bitrate:\t65.0 MBit/s
\tconnected time:\t8412 seconds
";

    struct FixedProbe(Result<LinkSample, SensorError>);

    impl LinkQualityProbe for FixedProbe {
        fn sample(&self) -> BoxFuture<'_, Result<LinkSample, SensorError>> {
            let result = self.0.clone();
            Box::pin(async move { result })
        }
    }

    #[test]
    fn should_parse_signal_and_connected_time() {
        let sample = parse_station_dump(DUMP).unwrap();
        assert_eq!(
            sample,
            LinkSample {
                signal_dbm: -58,
                connected_secs: 8412
            }
        );
    }

    #[test]
    fn should_ignore_signal_average_line() {
        let dump = "\tsignal avg:\t-40 [-40] dBm\n\tsignal:  \t-70 dBm\n\tconnected time:\t5 seconds\n";
        assert_eq!(parse_station_dump(dump).unwrap().signal_dbm, -70);
    }

    #[test]
    fn should_return_none_when_not_associated() {
        assert_eq!(parse_station_dump(""), None);
        assert_eq!(parse_station_dump("\tsignal:  \t-58 dBm\n"), None);
    }

    #[tokio::test]
    async fn should_adapt_probe_sample_to_reading_value() {
        let adapter = LinkQualityAdapter::new(Box::new(FixedProbe(Ok(LinkSample {
            signal_dbm: -61,
            connected_secs: 30,
        }))));
        assert_eq!(
            adapter.sample().await.unwrap(),
            ReadingValue::LinkQuality {
                signal_dbm: -61,
                connected_secs: 30
            }
        );
    }

    #[tokio::test]
    async fn should_pass_probe_errors_through() {
        let adapter = LinkQualityAdapter::new(Box::new(FixedProbe(Err(transient(
            "down".to_string(),
        )))));
        assert!(!adapter.sample().await.unwrap_err().is_permanent());
    }
}
