//! Network quality monitoring.
//!
//! A lightweight probe is run on an interval and its round-trip latency is
//! classified into a coarse quality level. `Offline` gates the scheduler
//! entirely; degraded levels scale retry delays so a poor link sheds load
//! instead of amplifying congestion.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{EventPublisher, SyncEvent};

/// Coarse classification of current connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Poor,
    Offline,
}

impl NetworkQuality {
    /// Multiplier applied to retry-delay estimation on degraded links.
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            Self::Excellent | Self::Good => 1.0,
            Self::Poor => 2.0,
            Self::Offline => 10.0,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline)
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent"),
            Self::Good => write!(f, "good"),
            Self::Poor => write!(f, "poor"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Connectivity probe abstraction.
///
/// Production implementations measure a real round trip; tests inject a
/// controllable fake.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Measure one round trip. `Err` means the endpoint is unreachable.
    async fn probe(&self) -> io::Result<Duration>;
}

/// Production probe: round-trip latency of a TCP handshake against a
/// configured health endpoint.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: SocketAddr,
}

impl TcpProbe {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl NetworkProbe for TcpProbe {
    async fn probe(&self) -> io::Result<Duration> {
        let start = Instant::now();
        let stream = TcpStream::connect(self.addr).await?;
        drop(stream);
        Ok(start.elapsed())
    }
}

/// Test probe with a settable latency; `None` simulates an unreachable
/// endpoint and a hang simulates a request that never resolves.
#[derive(Debug, Default)]
pub struct StaticProbe {
    latency: RwLock<Option<Duration>>,
    hang: std::sync::atomic::AtomicBool,
}

impl StaticProbe {
    pub fn new(latency: Option<Duration>) -> Self {
        Self {
            latency: RwLock::new(latency),
            hang: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkProbe for StaticProbe {
    async fn probe(&self) -> io::Result<Duration> {
        if self.hang.load(std::sync::atomic::Ordering::SeqCst) {
            // Never resolves; the monitor's timeout classifies this as poor.
            std::future::pending::<()>().await;
        }
        match *self.latency.read() {
            Some(latency) => Ok(latency),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "endpoint unreachable",
            )),
        }
    }
}

/// Periodically probes connectivity and publishes quality changes.
pub struct NetworkMonitor {
    probe: Arc<dyn NetworkProbe>,
    quality: RwLock<NetworkQuality>,
    publisher: EventPublisher,
    probe_interval: Duration,
    probe_timeout: Duration,
}

impl NetworkMonitor {
    pub fn new(
        probe: Arc<dyn NetworkProbe>,
        publisher: EventPublisher,
        probe_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            // Optimistic until the first probe completes.
            quality: RwLock::new(NetworkQuality::Good),
            publisher,
            probe_interval,
            probe_timeout,
        }
    }

    /// Last observed quality.
    pub fn quality(&self) -> NetworkQuality {
        *self.quality.read()
    }

    pub fn is_offline(&self) -> bool {
        self.quality().is_offline()
    }

    /// Run one probe now and record the classification.
    pub async fn check_now(&self) -> NetworkQuality {
        let observed = match tokio::time::timeout(self.probe_timeout, self.probe.probe()).await {
            Ok(Ok(rtt)) => Self::classify(rtt),
            Ok(Err(error)) => {
                debug!(%error, "Network probe failed");
                NetworkQuality::Offline
            }
            // A hung probe degrades to poor rather than blocking scheduling.
            Err(_) => NetworkQuality::Poor,
        };
        self.record(observed);
        observed
    }

    fn classify(rtt: Duration) -> NetworkQuality {
        if rtt < Duration::from_millis(150) {
            NetworkQuality::Excellent
        } else if rtt < Duration::from_millis(500) {
            NetworkQuality::Good
        } else {
            NetworkQuality::Poor
        }
    }

    fn record(&self, observed: NetworkQuality) {
        let previous = {
            let mut current = self.quality.write();
            let previous = *current;
            *current = observed;
            previous
        };

        if previous != observed {
            if observed.is_offline() {
                warn!(previous = %previous, "Network went offline, scheduling suspended");
            } else {
                info!(previous = %previous, current = %observed, "Network quality changed");
            }
            self.publisher.publish(SyncEvent::NetworkStatusChanged {
                previous,
                current: observed,
            });
        }
    }

    /// Probe loop; exits when the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_now().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Network monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}
