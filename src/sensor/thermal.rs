//! CPU temperature from the kernel thermal zone

use futures::future::BoxFuture;
use std::io::ErrorKind;
use std::path::PathBuf;

use super::{ReadingValue, SensorAdapter, SensorError, SensorKind};

pub struct CpuThermometer {
    sensor_file: PathBuf,
    threshold_c: f64,
}

impl CpuThermometer {
    pub fn new(sensor_file: PathBuf, threshold_c: f64) -> Self {
        Self {
            sensor_file,
            threshold_c,
        }
    }

    async fn read_celsius(&self) -> Result<f64, SensorError> {
        let content = tokio::fs::read_to_string(&self.sensor_file)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SensorError::Unavailable {
                    kind: SensorKind::CpuTemperature,
                    reason: format!("{} not found", self.sensor_file.display()),
                },
                _ => SensorError::Transient {
                    kind: SensorKind::CpuTemperature,
                    reason: e.to_string(),
                },
            })?;

        content
            .trim()
            .parse::<f64>()
            .map(|milli| milli / 1000.0)
            .map_err(|e| SensorError::Transient {
                kind: SensorKind::CpuTemperature,
                reason: format!("unexpected thermal zone content {:?}: {}", content.trim(), e),
            })
    }
}

impl SensorAdapter for CpuThermometer {
    fn kind(&self) -> SensorKind {
        SensorKind::CpuTemperature
    }

    fn sample(&self) -> BoxFuture<'_, Result<ReadingValue, SensorError>> {
        Box::pin(async move {
            let celsius = self.read_celsius().await?;
            Ok(ReadingValue::CpuTemperature {
                celsius,
                hot: celsius > self.threshold_c,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sample_with(content: &str) -> Result<ReadingValue, SensorError> {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("temp");
        std::fs::write(&file, content).unwrap();
        CpuThermometer::new(file, 80.0).sample().await
    }

    #[tokio::test]
    async fn should_read_millidegrees() {
        let value = sample_with("48312\n").await.unwrap();
        assert_eq!(
            value,
            ReadingValue::CpuTemperature {
                celsius: 48.312,
                hot: false
            }
        );
    }

    #[tokio::test]
    async fn should_flag_hot_above_threshold() {
        let value = sample_with("80500\n").await.unwrap();
        assert!(matches!(value, ReadingValue::CpuTemperature { hot: true, .. }));
    }

    #[tokio::test]
    async fn should_not_flag_hot_at_threshold() {
        let value = sample_with("80000").await.unwrap();
        assert!(matches!(value, ReadingValue::CpuTemperature { hot: false, .. }));
    }

    #[tokio::test]
    async fn should_fail_transiently_on_garbage() {
        let err = sample_with("n/a").await.unwrap_err();
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn should_report_missing_zone_as_unavailable() {
        let sensor = CpuThermometer::new(PathBuf::from("/nonexistent/thermal_zone9/temp"), 80.0);
        assert!(sensor.sample().await.unwrap_err().is_permanent());
    }
}
