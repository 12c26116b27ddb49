//! Sensor capability layer
//!
//! Every physical sensor sits behind [`SensorAdapter`], which produces one
//! [`ReadingValue`] per sample. Edge-triggered sensors additionally implement
//! [`TransitionSource`] and push [`Transition`]s into a channel owned by the
//! event dispatcher.
//!
//! ```text
//! sysfs / GPIO / iw ──► SensorAdapter::sample ──► ReadingValue
//!        GPIO edge  ──► TransitionSource ──► mpsc<Transition> ──► EventDispatcher
//! ```
//!
//! Hardware adapters live in the submodules:
//!
//! 1. [`one_wire`] - DS18x20 probe on the one-wire bus
//! 2. [`thermal`] - CPU thermal zone
//! 3. [`gpio`] - door reed switch, PIR motion and LDR light sensors (rppal)
//! 4. [`link`] - wireless link quality via `iw`

pub mod error;
pub mod gpio;
pub mod link;
pub mod one_wire;
pub mod smoothing;
pub mod thermal;

use chrono::{DateTime, Local};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::SensorsConfig;

pub use error::SensorError;

/// The two PIR detectors wired to the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PirChannel {
    A,
    B,
}

/// Every kind of sensor the agent knows how to publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Temperature,
    DoorContact,
    Motion(PirChannel),
    Light,
    CpuTemperature,
    LinkQuality,
}

impl SensorKind {
    pub const ALL: [SensorKind; 7] = [
        SensorKind::Temperature,
        SensorKind::DoorContact,
        SensorKind::Motion(PirChannel::A),
        SensorKind::Motion(PirChannel::B),
        SensorKind::Light,
        SensorKind::CpuTemperature,
        SensorKind::LinkQuality,
    ];

    /// Stable suffix appended to the device topic root
    pub fn topic_suffix(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::DoorContact => "garage_dr",
            SensorKind::Motion(PirChannel::A) => "pir_a_activity",
            SensorKind::Motion(PirChannel::B) => "pir_b_activity",
            SensorKind::Light => "lightsensed",
            SensorKind::CpuTemperature => "cpu_temperature",
            SensorKind::LinkQuality => "wifi",
        }
    }

    /// Motion detections are events, everything else is state the broker keeps
    pub fn retained(&self) -> bool {
        !matches!(self, SensorKind::Motion(_))
    }

    /// Kinds sampled once right after connecting, in publish order
    ///
    /// Motion sensors are left out so a PIR that has not warmed up yet never
    /// reports a detection at boot.
    pub const STARTUP_BURST: [SensorKind; 5] = [
        SensorKind::Temperature,
        SensorKind::DoorContact,
        SensorKind::CpuTemperature,
        SensorKind::Light,
        SensorKind::LinkQuality,
    ];

    pub fn in_startup_burst(&self) -> bool {
        Self::STARTUP_BURST.contains(self)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SensorKind::Temperature => "temperature",
            SensorKind::DoorContact => "door",
            SensorKind::Motion(PirChannel::A) => "motion-a",
            SensorKind::Motion(PirChannel::B) => "motion-b",
            SensorKind::Light => "light",
            SensorKind::CpuTemperature => "cpu-temperature",
            SensorKind::LinkQuality => "link-quality",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorState {
    Open,
    Closed,
}

impl From<BinaryState> for DoorState {
    // The reed switch pulls the line low while the magnet is near
    fn from(state: BinaryState) -> Self {
        match state {
            BinaryState::Active => DoorState::Closed,
            BinaryState::Inactive => DoorState::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureUnit {
    #[serde(rename = "F")]
    Fahrenheit,
}

/// Normalized value of one sample
///
/// Field names are the wire names of the published payload; the codec
/// flattens the variant next to `time` and `client_id`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Temperature {
        #[serde(rename = "temperature")]
        degrees: f64,
        #[serde(rename = "temp_unit")]
        unit: TemperatureUnit,
    },
    Door {
        #[serde(rename = "garage_dr")]
        state: DoorState,
    },
    Motion {
        #[serde(rename = "motion")]
        level: f64,
        detected: bool,
    },
    Light {
        #[serde(rename = "light_sensed_state")]
        detected: bool,
        #[serde(rename = "light_sensed_value")]
        level: f64,
    },
    CpuTemperature {
        #[serde(rename = "cpu_temp_c")]
        celsius: f64,
        #[serde(rename = "cpu_hot")]
        hot: bool,
    },
    LinkQuality {
        #[serde(rename = "iw_dbm")]
        signal_dbm: i32,
        #[serde(rename = "iw_ctm")]
        connected_secs: u64,
    },
}

impl ReadingValue {
    /// Whether this value is the shape produced by `kind`
    pub fn matches_kind(&self, kind: SensorKind) -> bool {
        matches!(
            (self, kind),
            (ReadingValue::Temperature { .. }, SensorKind::Temperature)
                | (ReadingValue::Door { .. }, SensorKind::DoorContact)
                | (ReadingValue::Motion { .. }, SensorKind::Motion(_))
                | (ReadingValue::Light { .. }, SensorKind::Light)
                | (ReadingValue::CpuTemperature { .. }, SensorKind::CpuTemperature)
                | (ReadingValue::LinkQuality { .. }, SensorKind::LinkQuality)
        )
    }

    /// Human readable state derived from the value
    pub fn state_label(&self) -> &'static str {
        match self {
            ReadingValue::Temperature { .. } | ReadingValue::LinkQuality { .. } => "measured",
            ReadingValue::Door { state: DoorState::Open } => "open",
            ReadingValue::Door { state: DoorState::Closed } => "closed",
            ReadingValue::Motion { detected: true, .. } => "detected",
            ReadingValue::Motion { detected: false, .. } => "clear",
            ReadingValue::Light { detected: true, .. } => "light",
            ReadingValue::Light { detected: false, .. } => "dark",
            ReadingValue::CpuTemperature { hot: true, .. } => "hot",
            ReadingValue::CpuTemperature { hot: false, .. } => "normal",
        }
    }
}

/// Immutable, timestamped sample ready for encoding
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    kind: SensorKind,
    uptime: Duration,
    time: DateTime<Local>,
    value: ReadingValue,
}

impl Reading {
    pub fn new(
        kind: SensorKind,
        value: ReadingValue,
        uptime: Duration,
        time: DateTime<Local>,
    ) -> Self {
        Self {
            kind,
            uptime,
            time,
            value,
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Monotonic time since process start when the sample was taken
    pub fn uptime(&self) -> Duration {
        self.uptime
    }

    pub fn time(&self) -> DateTime<Local> {
        self.time
    }

    pub fn value(&self) -> &ReadingValue {
        &self.value
    }

    pub fn state_label(&self) -> &'static str {
        self.value.state_label()
    }
}

/// Debounced level of an edge-triggered sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryState {
    Active,
    Inactive,
}

impl BinaryState {
    pub fn is_active(&self) -> bool {
        matches!(self, BinaryState::Active)
    }
}

impl From<bool> for BinaryState {
    fn from(active: bool) -> Self {
        if active {
            BinaryState::Active
        } else {
            BinaryState::Inactive
        }
    }
}

/// One activation or deactivation observed on a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub kind: SensorKind,
    pub state: BinaryState,
}

impl Transition {
    pub fn new(kind: SensorKind, state: BinaryState) -> Self {
        Self { kind, state }
    }
}

pub type TransitionSink = mpsc::Sender<Transition>;

/// Uniform read interface over one physical sensor
pub trait SensorAdapter: Send + Sync {
    fn kind(&self) -> SensorKind;

    /// Take one sample. Only the one-wire probe may wait here, and only for
    /// its bounded CRC retry loop.
    fn sample(&self) -> BoxFuture<'_, Result<ReadingValue, SensorError>>;
}

/// Edge notifications of a boolean sensor
///
/// Implementations deliver transitions with `try_send` from their own
/// notification context and must never block it.
pub trait TransitionSource: Send + Sync {
    fn current_state(&self) -> BinaryState;

    fn on_transition(&self, sink: TransitionSink) -> Result<(), SensorError>;
}

/// Stand-in for a sensor whose hardware could not be opened
pub struct MissingSensor {
    kind: SensorKind,
    reason: String,
}

impl MissingSensor {
    pub fn new(kind: SensorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl SensorAdapter for MissingSensor {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn sample(&self) -> BoxFuture<'_, Result<ReadingValue, SensorError>> {
        Box::pin(async move {
            Err(SensorError::Unavailable {
                kind: self.kind,
                reason: self.reason.clone(),
            })
        })
    }
}

/// A sensor together with how the orchestrator should drive it
#[derive(Clone)]
pub struct SensorEntry {
    pub adapter: Arc<dyn SensorAdapter>,
    pub events: Option<Arc<dyn TransitionSource>>,
    pub poll_interval: Duration,
    pub settle: Option<Duration>,
}

impl SensorEntry {
    pub fn polled(adapter: Arc<dyn SensorAdapter>, poll_interval: Duration) -> Self {
        Self {
            adapter,
            events: None,
            poll_interval,
            settle: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn TransitionSource>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = Some(settle);
        self
    }

    pub fn kind(&self) -> SensorKind {
        self.adapter.kind()
    }
}

/// Opens every enabled sensor of the node
///
/// Hardware that cannot be opened is registered as a [`MissingSensor`] so
/// its jobs degrade to no-ops instead of aborting startup.
pub fn open_all(config: &SensorsConfig) -> Vec<SensorEntry> {
    let mut entries = Vec::new();

    if config.temperature.enabled {
        let kind = SensorKind::Temperature;
        let adapter: Arc<dyn SensorAdapter> = match one_wire::OneWireThermometer::discover(
            &config.temperature.device_dir,
            config.temperature.read_attempts,
            Duration::from_millis(config.temperature.retry_delay_ms),
        ) {
            Ok(probe) => {
                info!("Found one-wire probe at {}", probe.device_file().display());
                Arc::new(probe)
            }
            Err(e) => missing(kind, e),
        };
        entries.push(SensorEntry::polled(
            adapter,
            Duration::from_secs(config.temperature.poll_secs),
        ));
    }

    let controller = rppal::gpio::Gpio::new();

    if config.door.enabled {
        let kind = SensorKind::DoorContact;
        let interval = Duration::from_secs(config.door.poll_secs);
        let entry = match &controller {
            Ok(controller) => match gpio::DoorContact::open(controller, &config.door) {
                Ok(door) => {
                    let door = Arc::new(door);
                    SensorEntry::polled(door.clone(), interval).with_events(door)
                }
                Err(e) => SensorEntry::polled(missing(kind, e), interval),
            },
            Err(e) => SensorEntry::polled(missing(kind, gpio_error(kind, e)), interval),
        };
        entries.push(entry);
    }

    for (channel, motion) in [
        (PirChannel::A, &config.motion_a),
        (PirChannel::B, &config.motion_b),
    ] {
        if !motion.enabled {
            continue;
        }
        let kind = SensorKind::Motion(channel);
        let interval = Duration::from_secs(motion.poll_secs);
        let entry = match &controller {
            Ok(controller) => match gpio::MotionDetector::open(controller, channel, motion) {
                Ok(pir) => {
                    let pir = Arc::new(pir);
                    SensorEntry::polled(pir.clone(), interval).with_events(pir)
                }
                Err(e) => SensorEntry::polled(missing(kind, e), interval),
            },
            Err(e) => SensorEntry::polled(missing(kind, gpio_error(kind, e)), interval),
        };
        entries.push(entry.with_settle(Duration::from_secs(motion.settle_secs)));
    }

    if config.light.enabled {
        let kind = SensorKind::Light;
        let interval = Duration::from_secs(config.light.poll_secs);
        let entry = match &controller {
            Ok(controller) => match gpio::LightSensor::open(controller, &config.light) {
                Ok(ldr) => {
                    let ldr = Arc::new(ldr);
                    SensorEntry::polled(ldr.clone(), interval).with_events(ldr)
                }
                Err(e) => SensorEntry::polled(missing(kind, e), interval),
            },
            Err(e) => SensorEntry::polled(missing(kind, gpio_error(kind, e)), interval),
        };
        entries.push(entry);
    }

    if config.cpu.enabled {
        entries.push(SensorEntry::polled(
            Arc::new(thermal::CpuThermometer::new(
                config.cpu.sensor_file.clone(),
                config.cpu.threshold_c,
            )),
            Duration::from_secs(config.cpu.poll_secs),
        ));
    }

    if config.link.enabled {
        let probe = link::IwProbe::new(config.link.interface.clone());
        entries.push(SensorEntry::polled(
            Arc::new(link::LinkQualityAdapter::new(Box::new(probe))),
            Duration::from_secs(config.link.poll_secs),
        ));
    }

    entries
}

fn missing(kind: SensorKind, error: SensorError) -> Arc<dyn SensorAdapter> {
    warn!("{}; publishing for it is disabled", error);
    Arc::new(MissingSensor::new(kind, error.to_string()))
}

fn gpio_error(kind: SensorKind, error: &rppal::gpio::Error) -> SensorError {
    SensorError::Unavailable {
        kind,
        reason: format!("GPIO controller not accessible: {}", error),
    }
}
