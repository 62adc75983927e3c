//! Periodic `LOOK.in:Discover!` broadcast.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, info, info_span};

use super::LOOKIN_PORT;
use super::endpoint::{Endpoint, EndpointConfig};
use super::error::{Error, Result};
use super::message::DISCOVER_FRAME;

pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Port devices listen on; beacons go to the broadcast address on it.
    pub port: u16,
    pub interval: Duration,
    /// Capacity for replies sent straight back to the beacon's source port.
    pub queue_size: usize,
    pub span: Span,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: LOOKIN_PORT,
            interval: DEFAULT_DISCOVERY_INTERVAL,
            queue_size: 16,
            span: info_span!("lookin_discovery"),
        }
    }
}

/// Owns the broadcast endpoint and the task sending beacons through it.
pub struct Discovery {
    endpoint: Arc<Endpoint>,
    task: JoinHandle<()>,
}

impl Discovery {
    /// Open an endpoint on an OS-selected port and start broadcasting.
    pub async fn start(config: DiscoveryConfig) -> Result<Self> {
        let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let remote = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, config.port));
        let endpoint = Endpoint::open(
            EndpointConfig::new(local, remote)
                .with_queue_size(config.queue_size)
                .with_span(config.span.clone()),
        )
        .await?;
        Ok(Self::spawn(Arc::new(endpoint), config.interval, config.span))
    }

    /// Broadcast over an already open endpoint.
    pub fn spawn(endpoint: Arc<Endpoint>, interval: Duration, span: Span) -> Self {
        let task = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                match run(&endpoint, interval).await {
                    Err(Error::EndpointClosed) => debug!("Discovery endpoint closed"),
                    Err(e) => debug!(error = %e, "Discovery stopped"),
                    Ok(()) => {}
                }
            }
            .instrument(span)
        });
        Self { endpoint, task }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Close the endpoint and wait for the loop to exit.
    pub async fn stop(self) {
        self.endpoint.close();
        let _ = self.task.await;
    }
}

/// Send a beacon, sleep, repeat until the endpoint closes.
pub async fn run(endpoint: &Endpoint, interval: Duration) -> Result<()> {
    info!(
        remote = %endpoint.remote_addr(),
        interval_secs = interval.as_secs(),
        "Starting LOOKin discovery"
    );
    loop {
        endpoint.send_text(DISCOVER_FRAME)?;
        debug!("Discovery beacon sent");
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = endpoint.closed() => return Err(Error::EndpointClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_beacons_repeat_until_closed() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::open(EndpointConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            listener.local_addr().unwrap(),
        ))
        .await
        .unwrap();

        let discovery = Discovery::spawn(
            Arc::new(endpoint),
            Duration::from_millis(20),
            Span::none(),
        );

        let mut buf = [0u8; 64];
        for _ in 0..2 {
            let len = tokio::time::timeout(Duration::from_secs(2), listener.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..len], DISCOVER_FRAME.as_bytes());
        }

        tokio::time::timeout(Duration::from_secs(2), discovery.stop())
            .await
            .expect("discovery did not stop");
    }

    #[tokio::test]
    async fn test_run_fails_on_closed_endpoint() {
        let endpoint = Endpoint::open(EndpointConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        ))
        .await
        .unwrap();
        endpoint.close();

        let result = run(&endpoint, Duration::from_secs(60)).await;
        assert!(matches!(result, Err(Error::EndpointClosed)));
    }
}
