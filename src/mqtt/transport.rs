//! rumqttc implementation of [`BrokerTransport`]
//!
//! `connect` drives the event loop inline until the first CONNACK so a bad
//! handshake surfaces as a startup error. Afterwards the event loop moves into
//! its own task which keeps polling (rumqttc reconnects on the next poll) and
//! reports outages as [`LinkEvent`]s.

use futures::future::BoxFuture;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BrokerTransport, Endpoint, LinkEvent, Outbound, SessionError};

const LINK_EVENT_CAPACITY: usize = 16;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

pub struct RumqttTransport {
    client_id: String,
    request_capacity: usize,
    reconnect_delay: Duration,
    will: Option<LastWill>,
    client: Option<AsyncClient>,
    // Parked between `connect` and `start_loop`; `EventLoop` itself is not `Sync`
    event_loop: Mutex<Option<EventLoop>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttTransport {
    pub fn new(client_id: impl Into<String>, request_capacity: usize, reconnect_delay: Duration) -> Self {
        Self {
            client_id: client_id.into(),
            request_capacity,
            reconnect_delay,
            will: None,
            client: None,
            event_loop: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    fn options(&self, endpoint: &Endpoint) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options
            .set_keep_alive(endpoint.keepalive)
            .set_clean_session(true);
        if let Some(will) = &self.will {
            options.set_last_will(will.clone());
        }
        options
    }
}

impl BrokerTransport for RumqttTransport {
    fn set_last_will(&mut self, will: Outbound) {
        self.will = Some(LastWill::new(will.topic, will.payload, will.qos, will.retain));
    }

    fn connect(&mut self, endpoint: Endpoint) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            let (client, mut event_loop) =
                AsyncClient::new(self.options(&endpoint), self.request_capacity);

            let handshake = tokio::time::timeout(endpoint.connect_timeout, wait_for_connack(&mut event_loop));
            match handshake.await {
                Ok(Ok(())) => {
                    self.client = Some(client);
                    self.event_loop = Mutex::new(Some(event_loop));
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SessionError::Connect(format!(
                    "no CONNACK from {}:{} within {:?}",
                    endpoint.host, endpoint.port, endpoint.connect_timeout
                ))),
            }
        })
    }

    fn start_loop(&mut self) -> Result<mpsc::Receiver<LinkEvent>, SessionError> {
        let event_loop = self
            .event_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SessionError::Transport("network loop already started or never connected".to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let handle = tokio::spawn(run_event_loop(event_loop, events_tx, self.reconnect_delay));

        match self.loop_handle.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(e) => {
                handle.abort();
                return Err(SessionError::Transport(format!("loop handle poisoned: {}", e)));
            }
        }
        Ok(events_rx)
    }

    fn publish(&self, message: Outbound) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            let client = self
                .client
                .as_ref()
                .ok_or_else(|| SessionError::Transport("publish before connect".to_string()))?;

            let topic = message.topic;
            client
                .publish(topic.clone(), message.qos, message.retain, message.payload)
                .await
                .map_err(|e| SessionError::Publish {
                    topic,
                    reason: e.to_string(),
                })
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            if let Some(client) = &self.client {
                client
                    .disconnect()
                    .await
                    .map_err(|e| SessionError::Transport(e.to_string()))?;
            }

            let handle = match self.loop_handle.lock() {
                Ok(mut slot) => slot.take(),
                Err(e) => {
                    warn!("Loop handle poisoned: {}", e);
                    None
                }
            };

            if let Some(mut handle) = handle {
                if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                    warn!("Network loop did not stop within {:?}, aborting", DISCONNECT_GRACE);
                    handle.abort();
                }
            }
            Ok(())
        })
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), SessionError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(SessionError::Connect(format!("broker refused: {:?}", ack.code)));
            }
            Ok(event) => debug!("Handshake event: {:?}", event),
            Err(e) => return Err(SessionError::Connect(e.to_string())),
        }
    }
}

/// Polls until a clean disconnect went out; reports one `Lost` per outage
async fn run_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::Sender<LinkEvent>,
    reconnect_delay: Duration,
) {
    info!("MQTT network loop started");
    let mut connected = true;
    let mut closing = false;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success && !connected {
                    connected = true;
                    let _ = events.send(LinkEvent::Reconnected).await;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent");
                closing = true;
            }
            Ok(_) => {}
            Err(e) => {
                if closing {
                    break;
                }
                if connected {
                    connected = false;
                    error!("MQTT connection error: {}", e);
                    let _ = events.send(LinkEvent::Lost(e.to_string())).await;
                } else {
                    debug!("Reconnect attempt failed: {}", e);
                }
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
    info!("MQTT network loop stopped");
}
