//! Connectivity-state derivation.
//!
//! The readiness probe against the daemon's local metrics endpoint is the
//! only ground truth for "traffic can actually flow"; provider and broker
//! state only prove that configuration exists. The precedence below encodes
//! exactly that.

use serde::Serialize;
use std::time::Duration;

/// Outcome of probing the daemon's `/ready` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Probe {
    /// 200 — at least one edge connection is up.
    Healthy,
    /// Reachable but not ready.
    Unhealthy,
    /// Endpoint unreachable (daemon absent or metrics not yet bound).
    Unknown,
}

/// Externally observable connectivity state for either tunnel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveStatus {
    Unconfigured,
    Offline,
    Connecting,
    Online,
}

impl EffectiveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectiveStatus::Unconfigured => "unconfigured",
            EffectiveStatus::Offline => "offline",
            EffectiveStatus::Connecting => "connecting",
            EffectiveStatus::Online => "online",
        }
    }
}

/// GET `http://127.0.0.1:{metrics_port}/ready`. 200 means connected,
/// any other status means not ready, transport error means unknown.
pub async fn probe_ready(metrics_port: u16) -> Probe {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(_) => return Probe::Unknown,
    };

    match client
        .get(format!("http://127.0.0.1:{metrics_port}/ready"))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => Probe::Healthy,
        Ok(_) => Probe::Unhealthy,
        Err(_) => Probe::Unknown,
    }
}

/// Fixed precedence: probe healthy beats everything; a running daemon that
/// is not ready yet is `connecting`; a configured mode without a daemon is
/// `offline`; otherwise nothing is configured.
pub fn effective_status(probe: Probe, daemon_running: bool, mode_configured: bool) -> EffectiveStatus {
    if probe == Probe::Healthy {
        EffectiveStatus::Online
    } else if daemon_running {
        EffectiveStatus::Connecting
    } else if mode_configured {
        EffectiveStatus::Offline
    } else {
        EffectiveStatus::Unconfigured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_probe_wins_regardless_of_other_state() {
        assert_eq!(
            effective_status(Probe::Healthy, false, false),
            EffectiveStatus::Online
        );
        assert_eq!(
            effective_status(Probe::Healthy, true, true),
            EffectiveStatus::Online
        );
    }

    #[test]
    fn running_daemon_without_readiness_is_connecting() {
        assert_eq!(
            effective_status(Probe::Unhealthy, true, true),
            EffectiveStatus::Connecting
        );
        assert_eq!(
            effective_status(Probe::Unknown, true, false),
            EffectiveStatus::Connecting
        );
    }

    #[test]
    fn configured_mode_without_daemon_is_offline() {
        assert_eq!(
            effective_status(Probe::Unknown, false, true),
            EffectiveStatus::Offline
        );
    }

    #[test]
    fn nothing_configured_is_unconfigured() {
        assert_eq!(
            effective_status(Probe::Unknown, false, false),
            EffectiveStatus::Unconfigured
        );
    }

    #[tokio::test]
    async fn probe_unreachable_port_is_unknown() {
        // Nothing listens on this port in the test environment.
        assert_eq!(probe_ready(1).await, Probe::Unknown);
    }
}
