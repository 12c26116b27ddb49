//! Broker reachability probe
//!
//! One ICMP echo through the system `ping`. Hosts without a usable `ping`
//! fall back to a TCP connect on the broker port.

use futures::future::BoxFuture;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

use super::Reachability;

const TCP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct PingProbe {
    fallback_port: u16,
}

impl PingProbe {
    pub fn new(fallback_port: u16) -> Self {
        Self { fallback_port }
    }

    async fn tcp_reachable(&self, host: &str) -> bool {
        matches!(
            tokio::time::timeout(TCP_TIMEOUT, TcpStream::connect((host, self.fallback_port))).await,
            Ok(Ok(_))
        )
    }
}

impl Reachability for PingProbe {
    fn is_host_reachable<'a>(&'a self, host: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let status = Command::new("ping")
                .args(["-c", "1", "-W", "1", host])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;

            match status {
                Ok(status) => {
                    debug!("ping {} exited with {}", host, status);
                    status.success()
                }
                Err(e) => {
                    warn!("Cannot run ping ({}), trying TCP port {}", e, self.fallback_port);
                    self.tcp_reachable(host).await
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn should_reach_listening_port_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = PingProbe::new(port);
        assert!(probe.tcp_reachable("127.0.0.1").await);
    }
}
