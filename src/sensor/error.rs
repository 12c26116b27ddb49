//! Error definitions for the sensor layer

use super::SensorKind;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SensorError {
    /// The backing device is gone for good; the sensor never produces readings
    #[error("{kind} sensor unavailable: {reason}")]
    Unavailable { kind: SensorKind, reason: String },

    /// A single sample failed; the next interval or edge may succeed
    #[error("{kind} read failed: {reason}")]
    Transient { kind: SensorKind, reason: String },
}

impl SensorError {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorError::Unavailable { kind, .. } | SensorError::Transient { kind, .. } => *kind,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SensorError::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_display_kind_and_reason() {
        let err = SensorError::Transient {
            kind: SensorKind::CpuTemperature,
            reason: "empty file".to_string(),
        };
        assert_eq!(err.to_string(), "cpu-temperature read failed: empty file");
        assert!(!err.is_permanent());
    }
}
