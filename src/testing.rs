//! Fakes shared by the unit tests

use chrono::{DateTime, Local, TimeZone};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::mqtt::session::SessionStartup;
use crate::mqtt::{
    BrokerSession, BrokerTransport, Endpoint, LinkEvent, Outbound, Reachability, RetryPolicy,
    SessionError, Topics,
};
use crate::sensor::{
    BinaryState, DoorState, ReadingValue, SensorAdapter, SensorError, SensorKind, Transition,
    TransitionSink, TransitionSource,
};

/// Clock whose uptime only moves when told to
pub struct ManualClock {
    uptime: Mutex<Duration>,
    base: DateTime<Local>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            uptime: Mutex::new(Duration::ZERO),
            base: Local.with_ymd_and_hms(2024, 1, 27, 6, 0, 0).unwrap(),
        }
    }

    pub fn set_uptime(&self, uptime: Duration) {
        *self.uptime.lock().unwrap() = uptime;
    }
}

impl Clock for ManualClock {
    fn uptime(&self) -> Duration {
        *self.uptime.lock().unwrap()
    }

    fn wall(&self) -> DateTime<Local> {
        self.base + chrono::Duration::from_std(self.uptime()).unwrap()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    SetLastWill(Outbound),
    Connect(Endpoint),
    StartLoop,
    Publish(Outbound),
    Disconnect,
}

/// Broker transport that records every call
pub struct RecordingTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    link_events: Option<mpsc::Receiver<LinkEvent>>,
    connect_error: Option<String>,
}

/// Test-side view of a [`RecordingTransport`] after it moved into a session
#[derive(Clone)]
pub struct TransportHandle {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    link: mpsc::Sender<LinkEvent>,
}

impl RecordingTransport {
    pub fn new() -> (Self, TransportHandle) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (link, link_events) = mpsc::channel(16);
        (
            Self {
                calls: calls.clone(),
                link_events: Some(link_events),
                connect_error: None,
            },
            TransportHandle { calls, link },
        )
    }

    pub fn failing_connect(reason: &str) -> (Self, TransportHandle) {
        let (mut transport, handle) = Self::new();
        transport.connect_error = Some(reason.to_string());
        (transport, handle)
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BrokerTransport for RecordingTransport {
    fn set_last_will(&mut self, will: Outbound) {
        self.record(TransportCall::SetLastWill(will));
    }

    fn connect(&mut self, endpoint: Endpoint) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            self.record(TransportCall::Connect(endpoint));
            match &self.connect_error {
                Some(reason) => Err(SessionError::Connect(reason.clone())),
                None => Ok(()),
            }
        })
    }

    fn start_loop(&mut self) -> Result<mpsc::Receiver<LinkEvent>, SessionError> {
        self.record(TransportCall::StartLoop);
        self.link_events
            .take()
            .ok_or_else(|| SessionError::Transport("loop already started".to_string()))
    }

    fn publish(&self, message: Outbound) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            self.record(TransportCall::Publish(message));
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            self.record(TransportCall::Disconnect);
            Ok(())
        })
    }
}

impl TransportHandle {
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::Connect(_)))
            .count()
    }

    pub fn published(&self) -> Vec<Outbound> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::Publish(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Outbound> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    pub fn payloads_on(&self, topic: &str) -> Vec<String> {
        self.published_on(topic)
            .into_iter()
            .map(|m| String::from_utf8(m.payload).unwrap())
            .collect()
    }

    pub async fn send_link(&self, event: LinkEvent) {
        self.link.send(event).await.unwrap();
    }
}

/// Reachability answers taken from a script; the last answer repeats
pub struct ScriptedProbe {
    answers: Mutex<VecDeque<bool>>,
    last: Mutex<bool>,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(answers: Vec<bool>) -> Self {
        let last = answers.last().copied().unwrap_or(true);
        Self {
            answers: Mutex::new(answers.into()),
            last: Mutex::new(last),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Reachability for ScriptedProbe {
    fn is_host_reachable<'a>(&'a self, _host: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.lock().unwrap().pop_front() {
                Some(answer) => answer,
                None => *self.last.lock().unwrap(),
            }
        })
    }
}

/// Adapter returning the same outcome on every sample
pub struct StaticSensor {
    kind: SensorKind,
    outcome: Result<ReadingValue, SensorError>,
    samples: AtomicU32,
}

impl StaticSensor {
    pub fn new(kind: SensorKind, value: ReadingValue) -> Self {
        Self {
            kind,
            outcome: Ok(value),
            samples: AtomicU32::new(0),
        }
    }

    pub fn failing(kind: SensorKind, error: SensorError) -> Self {
        Self {
            kind,
            outcome: Err(error),
            samples: AtomicU32::new(0),
        }
    }

    pub fn samples(&self) -> u32 {
        self.samples.load(Ordering::SeqCst)
    }
}

impl SensorAdapter for StaticSensor {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn sample(&self) -> BoxFuture<'_, Result<ReadingValue, SensorError>> {
        Box::pin(async move {
            self.samples.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        })
    }
}

/// Door contact flipped by the test
pub struct SwitchableDoor {
    state: Mutex<BinaryState>,
    sink: Mutex<Option<TransitionSink>>,
}

impl SwitchableDoor {
    pub fn new(initial: BinaryState) -> Self {
        Self {
            state: Mutex::new(initial),
            sink: Mutex::new(None),
        }
    }

    /// Changes the level and notifies the registered sink
    pub fn flip(&self, state: BinaryState) {
        *self.state.lock().unwrap() = state;
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.try_send(Transition::new(SensorKind::DoorContact, state))
                .unwrap();
        }
    }
}

impl SensorAdapter for SwitchableDoor {
    fn kind(&self) -> SensorKind {
        SensorKind::DoorContact
    }

    fn sample(&self) -> BoxFuture<'_, Result<ReadingValue, SensorError>> {
        Box::pin(async move {
            Ok(ReadingValue::Door {
                state: DoorState::from(self.current_state()),
            })
        })
    }
}

impl TransitionSource for SwitchableDoor {
    fn current_state(&self) -> BinaryState {
        *self.state.lock().unwrap()
    }

    fn on_transition(&self, sink: TransitionSink) -> Result<(), SensorError> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }
}

/// Session that went through the full startup against a [`RecordingTransport`]
pub async fn connected_session(root: &str) -> (Arc<BrokerSession>, TransportHandle) {
    let (transport, handle) = RecordingTransport::new();
    let endpoint = Endpoint {
        host: "broker".to_string(),
        port: 1883,
        keepalive: Duration::from_secs(90),
        connect_timeout: Duration::from_secs(5),
    };
    let policy = RetryPolicy {
        interval: Duration::from_secs(2),
        max_attempts: None,
    };
    let session = SessionStartup::create(Box::new(transport), endpoint, Topics::new(root))
        .wait_until_reachable(&ScriptedProbe::new(vec![true]), policy)
        .await
        .unwrap()
        .connect()
        .await
        .unwrap()
        .start()
        .await
        .unwrap();
    (session, handle)
}
