//! Broker session lifecycle
//!
//! Startup is a statum typestate machine so the ordering rules cannot be
//! broken at compile time: the last will is set in [`SessionStartup::create`],
//! `connect` only exists once the host answered the probe and the shared
//! [`BrokerSession`] only exists after a successful connect.
//!
//! ```text
//! SessionStartup<Disconnected> ──wait_until_reachable──► SessionStartup<Reachable>
//!                                                              │ connect
//!                                                              ▼
//!              Arc<BrokerSession> ◄──start── SessionStartup<Connected>
//! ```

use statum::{machine, state};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{
    BrokerTransport, ConnectionState, Endpoint, LinkEvent, Outbound, Reachability, RetryPolicy,
    SessionError, Topics, OFFLINE, ONLINE,
};

#[state]
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Disconnected,
    Reachable,
    Connected,
}

#[machine]
pub struct SessionStartup<S: SessionPhase> {
    transport: Box<dyn BrokerTransport>,
    endpoint: Endpoint,
    topics: Topics,
    probe_retries: u32,
}

impl<S: SessionPhase> SessionStartup<S> {
    /// Failed probes before the host answered
    pub fn probe_retries(&self) -> u32 {
        self.probe_retries
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl SessionStartup<Disconnected> {
    /// Registers "offline" as last will on the availability topic
    pub fn create(
        mut transport: Box<dyn BrokerTransport>,
        endpoint: Endpoint,
        topics: Topics,
    ) -> Self {
        let will = Outbound::new(topics.availability(), OFFLINE);
        debug!("Registering last will {}", will);
        transport.set_last_will(will);

        Self::new(transport, endpoint, topics, 0)
    }

    /// Probes the broker host until it answers or the policy gives up
    pub async fn wait_until_reachable(
        mut self,
        probe: &dyn Reachability,
        policy: RetryPolicy,
    ) -> Result<SessionStartup<Reachable>, SessionError> {
        info!("Waiting for broker host {}", self.endpoint.host);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if probe.is_host_reachable(&self.endpoint.host).await {
                info!(
                    "Broker host {} reachable after {} attempt(s)",
                    self.endpoint.host, attempts
                );
                return Ok(self.transition());
            }

            if let Some(max) = policy.max_attempts {
                if attempts >= max {
                    error!(
                        "Broker host {} still unreachable after {} attempts",
                        self.endpoint.host, attempts
                    );
                    return Err(SessionError::Unreachable {
                        host: self.endpoint.host.clone(),
                        attempts,
                    });
                }
            }

            self.probe_retries += 1;
            debug!(
                "Broker host {} not reachable, retry {} in {:?}",
                self.endpoint.host, self.probe_retries, policy.interval
            );
            tokio::time::sleep(policy.interval).await;
        }
    }
}

impl SessionStartup<Reachable> {
    pub async fn connect(mut self) -> Result<SessionStartup<Connected>, SessionError> {
        info!(
            "Connecting to broker {}:{} (keepalive {:?})",
            self.endpoint.host, self.endpoint.port, self.endpoint.keepalive
        );
        let endpoint = self.endpoint.clone();
        match self.transport.connect(endpoint).await {
            Ok(()) => {
                info!("Connected to broker {}", self.endpoint.host);
                Ok(self.transition())
            }
            Err(e) => {
                error!("Broker connect failed: {}", e);
                Err(e)
            }
        }
    }
}

impl SessionStartup<Connected> {
    /// Starts the network loop, announces "online" and hands out the shared session
    pub async fn start(self) -> Result<Arc<BrokerSession>, SessionError> {
        let mut transport = self.transport;
        let link_events = transport.start_loop()?;

        let (state, _) = watch::channel(ConnectionState::Connected);
        let session = Arc::new(BrokerSession {
            transport,
            topics: self.topics,
            state,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        tokio::spawn(monitor_link(session.clone(), link_events));

        if let Err(e) = session.announce_online().await {
            warn!("Initial availability announce failed: {}", e);
        }
        Ok(session)
    }
}

async fn monitor_link(session: Arc<BrokerSession>, mut events: mpsc::Receiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        session.handle_link_event(event).await;
    }
    debug!("Broker link monitor finished");
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub published: u64,
    pub dropped: u64,
}

/// The connected broker session shared by scheduler jobs and the dispatcher
///
/// [`publish`](Self::publish) is the only entry point into the connection.
pub struct BrokerSession {
    transport: Box<dyn BrokerTransport>,
    topics: Topics,
    state: watch::Sender<ConnectionState>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl BrokerSession {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Publishes one message if the session is connected
    ///
    /// Outside `Connected` the message is dropped and counted; nothing is
    /// queued for later delivery.
    pub async fn publish(&self, message: Outbound) -> Result<(), SessionError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(SessionError::NotConnected {
                state,
                topic: message.topic,
            });
        }

        debug!("Publishing {}", message);
        match self.transport.publish(message).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Non-retained "online" on the availability topic
    pub async fn announce_online(&self) -> Result<(), SessionError> {
        self.publish(Outbound::new(self.topics.availability(), ONLINE))
            .await
    }

    /// Applies a connectivity change reported by the network loop
    pub async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Lost(reason) => {
                let changed = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connected {
                        *state = ConnectionState::Lost;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    warn!("Broker connection lost: {}", reason);
                }
            }
            LinkEvent::Reconnected => {
                let changed = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Lost {
                        *state = ConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    info!("Broker connection restored");
                    if let Err(e) = self.announce_online().await {
                        warn!("Availability announce after reconnect failed: {}", e);
                    }
                }
            }
        }
    }

    /// Publishes "offline" and disconnects cleanly
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        if self.state() == ConnectionState::Connected {
            let offline = Outbound::new(self.topics.availability(), OFFLINE);
            if let Err(e) = self.publish(offline).await {
                warn!("Could not announce offline: {}", e);
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);

        info!("Disconnecting from broker");
        self.transport.disconnect().await
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_session, RecordingTransport, ScriptedProbe, TransportCall};
    use std::time::Duration;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "broker".to_string(),
            port: 1883,
            keepalive: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_secs(2),
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_retry_twice_before_connecting() {
        let (transport, handle) = RecordingTransport::new();
        let startup = SessionStartup::create(Box::new(transport), endpoint(), Topics::new("n/"));
        let probe = ScriptedProbe::new(vec![false, false, true]);

        let reachable = startup
            .wait_until_reachable(&probe, policy(Some(300)))
            .await
            .unwrap();

        assert_eq!(reachable.probe_retries(), 2);
        assert_eq!(probe.calls(), 3);
        assert_eq!(handle.connect_count(), 0);

        reachable.connect().await.unwrap();
        assert_eq!(handle.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_give_up_after_max_attempts() {
        let (transport, handle) = RecordingTransport::new();
        let startup = SessionStartup::create(Box::new(transport), endpoint(), Topics::new("n/"));
        let probe = ScriptedProbe::new(vec![false]);

        let err = startup
            .wait_until_reachable(&probe, policy(Some(3)))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, SessionError::Unreachable { attempts: 3, .. }));
        assert_eq!(probe.calls(), 3);
        assert_eq!(handle.connect_count(), 0);
    }

    #[tokio::test]
    async fn should_register_last_will_before_connect() {
        let (_session, handle) = connected_session("n/").await;
        let calls = handle.calls();

        match &calls[0] {
            TransportCall::SetLastWill(will) => {
                assert_eq!(will.topic, "n/LWT");
                assert_eq!(will.payload, b"offline");
            }
            other => panic!("first call was {:?}", other),
        }
        assert!(matches!(calls[1], TransportCall::Connect(_)));
        assert!(matches!(calls[2], TransportCall::StartLoop));
        assert_eq!(handle.payloads_on("n/LWT"), vec!["online".to_string()]);
    }

    #[tokio::test]
    async fn should_surface_connect_failure() {
        let (transport, handle) = RecordingTransport::failing_connect("bad credentials");
        let startup = SessionStartup::create(Box::new(transport), endpoint(), Topics::new("n/"));
        let probe = ScriptedProbe::new(vec![true]);

        let err = startup
            .wait_until_reachable(&probe, policy(None))
            .await
            .unwrap()
            .connect()
            .await
            .err()
            .unwrap();

        assert!(matches!(err, SessionError::Connect(_)));
        assert!(handle.published().is_empty());
    }

    #[tokio::test]
    async fn should_announce_online_twice_independently() {
        let (session, handle) = connected_session("n/").await;

        session.announce_online().await.unwrap();
        session.announce_online().await.unwrap();

        let online = handle.published_on("n/LWT");
        assert_eq!(online.len(), 3);
        assert!(online.iter().all(|m| !m.retain));
    }

    #[tokio::test]
    async fn should_announce_once_after_reconnect() {
        let (session, handle) = connected_session("n/").await;
        assert_eq!(handle.published_on("n/LWT").len(), 1);

        session
            .handle_link_event(LinkEvent::Lost("io error".to_string()))
            .await;
        assert_eq!(session.state(), ConnectionState::Lost);
        assert!(session.announce_online().await.is_err());
        session
            .handle_link_event(LinkEvent::Lost("still down".to_string()))
            .await;
        assert_eq!(handle.published_on("n/LWT").len(), 1);

        session.handle_link_event(LinkEvent::Reconnected).await;
        session.handle_link_event(LinkEvent::Reconnected).await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(handle.published_on("n/LWT").len(), 2);
    }

    #[tokio::test]
    async fn should_follow_events_from_network_loop() {
        let (session, handle) = connected_session("n/").await;
        let mut state = session.subscribe_state();

        handle.send_link(LinkEvent::Lost("reset".to_string())).await;
        state
            .wait_for(|s| *s == ConnectionState::Lost)
            .await
            .unwrap();

        handle.send_link(LinkEvent::Reconnected).await;
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        while handle.published_on("n/LWT").len() < 2 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn should_drop_publish_while_lost() {
        let (session, handle) = connected_session("n/").await;
        session
            .handle_link_event(LinkEvent::Lost("gone".to_string()))
            .await;

        let err = session
            .publish(Outbound::new("n/garage_dr", "{}").retained(true))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::NotConnected { .. }));
        assert!(handle.published_on("n/garage_dr").is_empty());
        assert_eq!(session.stats().dropped, 1);
    }

    #[tokio::test]
    async fn should_publish_offline_then_disconnect_on_shutdown() {
        let (session, handle) = connected_session("n/").await;

        session.shutdown().await.unwrap();

        let calls = handle.calls();
        let last_two = &calls[calls.len() - 2..];
        match &last_two[0] {
            TransportCall::Publish(msg) => assert_eq!(msg.payload, b"offline"),
            other => panic!("expected offline publish, got {:?}", other),
        }
        assert!(matches!(last_two[1], TransportCall::Disconnect));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
