//! ICMP reachability probing
//!
//! The only health signal the orchestrator consults is ping reachability of
//! a proxy's public address (SSH verification is out of scope). Probing
//! shells out to the system `ping`, one echo request per attempt, with a
//! bounded retry/backoff between attempts.

use crate::error::Result;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Attempts per address before declaring it unreachable
const DEFAULT_TRIALS: u32 = 3;

/// Backoff between attempts
const DEFAULT_BACKOFF_SECS: u64 = 10;

/// Per-echo reply timeout passed to ping (seconds)
const ECHO_TIMEOUT_SECS: u64 = 2;

/// Reachability check seam. Production pings; tests script answers.
#[async_trait]
pub trait Reachability: Send + Sync {
    /// Whether the address answered within the bounded retry budget
    async fn check(&self, ip: &str) -> bool;
}

/// System-ping prober with bounded retry
#[derive(Debug, Clone)]
pub struct PingProber {
    /// Attempts per address
    pub trials: u32,

    /// Sleep between failed attempts
    pub backoff: Duration,
}

impl PingProber {
    /// Prober with the default 3-trial, 10-second-backoff budget
    pub fn new() -> Self {
        Self {
            trials: DEFAULT_TRIALS,
            backoff: Duration::from_secs(DEFAULT_BACKOFF_SECS),
        }
    }

    /// Override the retry budget
    pub fn with_budget(trials: u32, backoff: Duration) -> Self {
        Self { trials, backoff }
    }

    async fn ping_once(&self, ip: &str) -> bool {
        let status = Command::new("ping")
            .args(["-c", "1", "-W", &ECHO_TIMEOUT_SECS.to_string(), ip])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) => status.success(),
            Err(err) => {
                warn!(error = %err, "failed to spawn ping");
                false
            }
        }
    }
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reachability for PingProber {
    async fn check(&self, ip: &str) -> bool {
        for attempt in 1..=self.trials {
            if self.ping_once(ip).await {
                debug!(ip, attempt, "address is up");
                return true;
            }
            if attempt < self.trials {
                tokio::time::sleep(self.backoff).await;
            }
        }
        warn!(ip, trials = self.trials, "address is down");
        false
    }
}

/// Probe a set of addresses sequentially, returning the ones that failed.
///
/// Sequential on purpose: within one tick no two provider-side mutations or
/// checks overlap, so a rotation in progress on one instance can never race
/// the liveness check of another.
pub async fn probe_all<'a, I>(prober: &dyn Reachability, ips: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut failed = Vec::new();
    for ip in ips {
        if ip.is_empty() || !prober.check(ip).await {
            failed.push(ip.to_string());
        }
    }
    Ok(failed)
}


#[cfg(test)]
mod tests {
    use super::testing::StaticProber;
    use super::*;

    #[tokio::test]
    async fn test_probe_all_reports_only_failures() {
        let prober = StaticProber::new();
        prober.mark_down("198.51.100.7");

        let failed = probe_all(
            &prober,
            ["198.51.100.5", "198.51.100.7", "198.51.100.9"],
        )
        .await
        .unwrap();

        assert_eq!(failed, vec!["198.51.100.7".to_string()]);
        assert_eq!(prober.checked.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_address_counts_as_failed() {
        let prober = StaticProber::new();
        let failed = probe_all(&prober, [""]).await.unwrap();
        assert_eq!(failed, vec![String::new()]);
        // Never handed to ping
        assert!(prober.checked.lock().unwrap().is_empty());
    }
}
