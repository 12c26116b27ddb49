//! GPIO sensors driven through rppal
//!
//! - [`DoorContact`]: reed switch, active low, debounced by the interrupt
//!   thread rppal spawns for async interrupts.
//! - [`MotionDetector`]: PIR output sampled at a fixed rate and smoothed.
//! - [`LightSensor`]: LDR + capacitor, light level derived from the time the
//!   capacitor takes to charge past the input threshold.
//!
//! Sampling loops run on their own `std::thread` and hand transitions to the
//! dispatcher with `try_send`, so a full queue drops an edge instead of
//! stalling the hardware loop.

use futures::future::BoxFuture;
use rppal::gpio::{Event, Gpio, InputPin, IoPin, Mode, Trigger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::smoothing::SmoothedInput;
use super::{
    BinaryState, DoorState, PirChannel, ReadingValue, SensorAdapter, SensorError, SensorKind,
    Transition, TransitionSink, TransitionSource,
};
use crate::config::{DoorConfig, LightConfig, MotionConfig};

/// Time the LDR capacitor is shorted to ground before each measurement
const DISCHARGE_TIME: Duration = Duration::from_millis(100);
/// Longest a sample waits for the first full smoothing window after open
const FIRST_WINDOW_WAIT: Duration = Duration::from_secs(2);
const FIRST_WINDOW_POLL: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_error(kind: SensorKind, pin: u8, error: rppal::gpio::Error) -> SensorError {
    SensorError::Unavailable {
        kind,
        reason: format!("cannot claim GPIO {}: {}", pin, error),
    }
}

fn forward(sink: &TransitionSink, transition: Transition) {
    if let Err(e) = sink.try_send(transition) {
        warn!("Dropping {} transition: {}", transition.kind, e);
    }
}

/// Reed switch on the garage door
pub struct DoorContact {
    pin: Mutex<InputPin>,
    pin_number: u8,
    bounce: Duration,
}

impl DoorContact {
    pub fn open(gpio: &Gpio, config: &DoorConfig) -> Result<Self, SensorError> {
        // Pulled up externally; the magnet pulls the line to ground
        let pin = gpio
            .get(config.pin)
            .map_err(|e| open_error(SensorKind::DoorContact, config.pin, e))?
            .into_input();

        info!(
            "Door contact on GPIO {} (bounce {} ms)",
            config.pin, config.bounce_ms
        );
        Ok(Self {
            pin: Mutex::new(pin),
            pin_number: config.pin,
            bounce: Duration::from_millis(config.bounce_ms),
        })
    }
}

impl SensorAdapter for DoorContact {
    fn kind(&self) -> SensorKind {
        SensorKind::DoorContact
    }

    fn sample(&self) -> BoxFuture<'_, Result<ReadingValue, SensorError>> {
        let state = DoorState::from(self.current_state());
        Box::pin(async move { Ok(ReadingValue::Door { state }) })
    }
}

impl TransitionSource for DoorContact {
    fn current_state(&self) -> BinaryState {
        BinaryState::from(lock(&self.pin).is_low())
    }

    fn on_transition(&self, sink: TransitionSink) -> Result<(), SensorError> {
        let kind = SensorKind::DoorContact;
        lock(&self.pin)
            .set_async_interrupt(Trigger::Both, Some(self.bounce), move |event: Event| {
                forward(&sink, door_edge(&event));
            })
            .map_err(|e| SensorError::Unavailable {
                kind,
                reason: format!("cannot watch GPIO {}: {}", self.pin_number, e),
            })
    }
}

/// Falling edge: magnet arrived, door closed
fn door_edge(event: &Event) -> Transition {
    debug!("Door edge {:?} (seq {})", event.trigger, event.seqno);
    let state = BinaryState::from(event.trigger == Trigger::FallingEdge);
    Transition::new(SensorKind::DoorContact, state)
}

/// Shared between a sampling thread and the adapter handle
struct SampledInput {
    kind: SensorKind,
    smoothing: Mutex<SmoothedInput>,
    sink: Mutex<Option<TransitionSink>>,
    stop: AtomicBool,
}

impl SampledInput {
    fn new(kind: SensorKind, smoothing: SmoothedInput) -> Arc<Self> {
        Arc::new(Self {
            kind,
            smoothing: Mutex::new(smoothing),
            sink: Mutex::new(None),
            stop: AtomicBool::new(false),
        })
    }

    fn push(&self, sample: f64) {
        let changed = lock(&self.smoothing).push(sample);
        if let Some(state) = changed {
            if let Some(sink) = lock(&self.sink).as_ref() {
                forward(sink, Transition::new(self.kind, state));
            }
        }
    }

    fn level(&self) -> Result<(f64, bool), SensorError> {
        let smoothing = lock(&self.smoothing);
        match (smoothing.value(), smoothing.state()) {
            (Some(value), Some(state)) => Ok((value, state.is_active())),
            _ => Err(SensorError::Transient {
                kind: self.kind,
                reason: "sample window not filled yet".to_string(),
            }),
        }
    }

    /// Like [`Self::level`], but gives a freshly opened sensor up to
    /// [`FIRST_WINDOW_WAIT`] to fill its window
    async fn filled_level(&self) -> Result<(f64, bool), SensorError> {
        let deadline = tokio::time::Instant::now() + FIRST_WINDOW_WAIT;
        loop {
            let level = self.level();
            if level.is_ok() || tokio::time::Instant::now() >= deadline {
                return level;
            }
            tokio::time::sleep(FIRST_WINDOW_POLL).await;
        }
    }

    fn state(&self) -> BinaryState {
        lock(&self.smoothing)
            .state()
            .unwrap_or(BinaryState::Inactive)
    }

    fn spawn<F>(self: &Arc<Self>, name: String, mut measure: F) -> Result<(), SensorError>
    where
        F: FnMut() -> f64 + Send + 'static,
    {
        let input = self.clone();
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                while !input.stop.load(Ordering::Relaxed) {
                    input.push(measure());
                }
                debug!("{} sampler stopped", input.kind);
            })
            .map(|_| ())
            .map_err(|e| SensorError::Unavailable {
                kind: self.kind,
                reason: format!("cannot start sampling thread: {}", e),
            })
    }
}

/// Passive infrared motion detector
pub struct MotionDetector {
    input: Arc<SampledInput>,
}

impl MotionDetector {
    pub fn open(gpio: &Gpio, channel: PirChannel, config: &MotionConfig) -> Result<Self, SensorError> {
        let kind = SensorKind::Motion(channel);
        let pin = gpio
            .get(config.pin)
            .map_err(|e| open_error(kind, config.pin, e))?
            .into_input();

        let input = SampledInput::new(
            kind,
            SmoothedInput::new(config.queue_len, config.threshold, false),
        );
        let period = sample_period(config.sample_rate_hz).ok_or_else(|| SensorError::Unavailable {
            kind,
            reason: format!("no usable sample period at {} Hz", config.sample_rate_hz),
        })?;
        input.spawn(format!("pir-{:?}", channel).to_lowercase(), move || {
            thread::sleep(period);
            if pin.is_high() {
                1.0
            } else {
                0.0
            }
        })?;

        info!(
            "Motion detector {:?} on GPIO {} ({} Hz, window {}, threshold {})",
            channel, config.pin, config.sample_rate_hz, config.queue_len, config.threshold
        );
        Ok(Self { input })
    }
}

impl Drop for MotionDetector {
    fn drop(&mut self) {
        self.input.stop.store(true, Ordering::Relaxed);
    }
}

impl SensorAdapter for MotionDetector {
    fn kind(&self) -> SensorKind {
        self.input.kind
    }

    fn sample(&self) -> BoxFuture<'_, Result<ReadingValue, SensorError>> {
        Box::pin(async move {
            let (level, detected) = self.input.filled_level().await?;
            Ok(ReadingValue::Motion { level, detected })
        })
    }
}

impl TransitionSource for MotionDetector {
    fn current_state(&self) -> BinaryState {
        self.input.state()
    }

    fn on_transition(&self, sink: TransitionSink) -> Result<(), SensorError> {
        *lock(&self.input.sink) = Some(sink);
        Ok(())
    }
}

/// Light dependent resistor charging a capacitor
pub struct LightSensor {
    input: Arc<SampledInput>,
}

impl LightSensor {
    pub fn open(gpio: &Gpio, config: &LightConfig) -> Result<Self, SensorError> {
        let kind = SensorKind::Light;
        let mut pin = gpio
            .get(config.pin)
            .map_err(|e| open_error(kind, config.pin, e))?
            .into_io(Mode::Input);

        let input = SampledInput::new(
            kind,
            SmoothedInput::new(config.queue_len, config.threshold, false),
        );
        let limit = Duration::from_millis(config.charge_time_limit_ms.max(1));
        input.spawn("ldr".to_string(), move || measure_light(&mut pin, limit))?;

        info!(
            "Light sensor on GPIO {} (charge limit {:?}, window {}, threshold {})",
            config.pin, limit, config.queue_len, config.threshold
        );
        Ok(Self { input })
    }
}

impl Drop for LightSensor {
    fn drop(&mut self) {
        self.input.stop.store(true, Ordering::Relaxed);
    }
}

impl SensorAdapter for LightSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::Light
    }

    fn sample(&self) -> BoxFuture<'_, Result<ReadingValue, SensorError>> {
        Box::pin(async move {
            let (level, detected) = self.input.filled_level().await?;
            Ok(ReadingValue::Light { detected, level })
        })
    }
}

impl TransitionSource for LightSensor {
    fn current_state(&self) -> BinaryState {
        self.input.state()
    }

    fn on_transition(&self, sink: TransitionSink) -> Result<(), SensorError> {
        *lock(&self.input.sink) = Some(sink);
        Ok(())
    }
}

/// One charge-time measurement mapped to 0.0 (dark) ..= 1.0 (bright)
fn measure_light(pin: &mut IoPin, limit: Duration) -> f64 {
    pin.set_mode(Mode::Output);
    pin.set_low();
    thread::sleep(DISCHARGE_TIME);
    pin.set_mode(Mode::Input);

    let started = Instant::now();
    while pin.is_low() && started.elapsed() < limit {
        std::hint::spin_loop();
    }
    charge_level(started.elapsed(), limit)
}

fn sample_period(rate_hz: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(1.0 / rate_hz)
        .ok()
        .filter(|period| !period.is_zero())
}

fn charge_level(charge_time: Duration, limit: Duration) -> f64 {
    let ratio = charge_time.as_secs_f64() / limit.as_secs_f64();
    (1.0 - ratio).clamp(0.0, 1.0)
}
