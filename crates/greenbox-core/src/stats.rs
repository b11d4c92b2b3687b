//! Container stats sampling — poll the engine while a run is in flight

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sandbox::{ContainerEngine, StatsProbe};

/// How long `Monitor::finish` waits for the polling task to exit
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// One point-in-time reading of a container's usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub at: DateTime<Utc>,
    /// CPU column as reported by the engine, e.g. `"12.5%"`
    pub cpu_perc: String,
    pub mem_usage_mib: f64,
}

/// Parse a memory figure such as `10.5MiB` or `1.2GB` into MiB.
///
/// Unparsable input yields `0.0`.
pub fn parse_mem_string(raw: &str) -> f64 {
    let s = raw.trim().to_lowercase();

    let (number, factor) = if let Some(n) = s.strip_suffix("kib") {
        (n, 1.0 / 1024.0)
    } else if let Some(n) = s.strip_suffix("mib") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix("gib") {
        (n, 1024.0)
    } else if let Some(n) = s.strip_suffix("tib") {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = s.strip_suffix("kb") {
        (n, 1e3 / BYTES_PER_MIB)
    } else if let Some(n) = s.strip_suffix("mb") {
        (n, 1e6 / BYTES_PER_MIB)
    } else if let Some(n) = s.strip_suffix("gb") {
        (n, 1e9 / BYTES_PER_MIB)
    } else if let Some(n) = s.strip_suffix('b') {
        (n, 1.0 / BYTES_PER_MIB)
    } else {
        (s.as_str(), 1.0 / BYTES_PER_MIB)
    };

    number
        .trim()
        .parse::<f64>()
        .map(|v| v * factor)
        .unwrap_or(0.0)
}

/// Parse a CPU column such as `12.5%`
pub fn parse_cpu_percent(raw: &str) -> Option<f64> {
    let s = raw.trim();
    let s = s.strip_suffix('%').unwrap_or(s).trim();
    s.parse::<f64>().ok()
}

/// Background stats poller for one container
pub struct Monitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl Monitor {
    /// Start polling `container` every `interval` until finished or the
    /// container disappears.
    pub fn spawn(engine: Arc<dyn ContainerEngine>, container: String, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let samples = Arc::new(Mutex::new(Vec::new()));

        let handle = tokio::spawn(poll_stats(
            engine,
            container,
            interval,
            cancel.clone(),
            samples.clone(),
        ));

        Self {
            cancel,
            handle,
            samples,
        }
    }

    /// Stop polling and return everything collected so far
    pub async fn finish(mut self) -> Vec<Sample> {
        self.cancel.cancel();

        match tokio::time::timeout(JOIN_TIMEOUT, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Monitor: polling task failed: {}", e),
            Err(_) => {
                warn!("Monitor: polling task did not stop gracefully, aborting");
                self.handle.abort();
            }
        }

        std::mem::take(&mut *self.samples.lock().await)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_stats(
    engine: Arc<dyn ContainerEngine>,
    container: String,
    interval: Duration,
    cancel: CancellationToken,
    samples: Arc<Mutex<Vec<Sample>>>,
) {
    info!("Monitor: starting for {}", container);

    while !cancel.is_cancelled() {
        let mut delay = interval;

        match engine.stats(&container).await {
            Ok(StatsProbe::Sample { cpu, mem }) => {
                let sample = Sample {
                    at: Utc::now(),
                    mem_usage_mib: parse_mem_string(&mem),
                    cpu_perc: cpu,
                };
                debug!("Monitor: {} {:?}", container, sample);
                samples.lock().await.push(sample);
            }
            // Container may still be starting
            Ok(StatsProbe::NotReady) => {}
            Ok(StatsProbe::Gone) => {
                debug!("Monitor: {} is gone", container);
                break;
            }
            Err(e) => {
                warn!("Monitor: error getting stats for {}: {}", container, e);
                delay += interval / 2;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Monitor: stopping for {}", container);
}
