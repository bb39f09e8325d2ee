//! Public-mode broker client.
//!
//! Registers this instance with the operator-run broker for a slot on a
//! shared tunnel, keeps the registration alive with signed heartbeats, and
//! restores itself after process restarts. Exactly one registration may be
//! active per process, so the client lives behind a handle that serializes
//! every mutating operation through one `tokio::sync::Mutex` — an explicit
//! context-owned instance, not a module-level global.

use crate::error::{BrokerError, CarryError};
use crate::services::ServiceSpec;
use crate::store::{StateStore, keys};
use crate::supervisor::{CLOUDFLARED, ProcessSupervisor, cloudflared_args};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, watch};

/// Fixed heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(600);
/// Consecutive failures before the registration is flagged degraded.
pub const DEGRADED_THRESHOLD: u32 = 3;

/// Result of a successful broker registration, persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicRegistration {
    pub random_id: String,
    pub tunnel_token: String,
    pub urls: HashMap<String, String>,
    pub instance_id: String,
}

/// In-memory only; reset by any successful heartbeat. `degraded` is
/// advisory — it is surfaced to the operator but never triggers release.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatState {
    pub consecutive_failures: u32,
    pub degraded: bool,
}

impl HeartbeatState {
    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.degraded = false;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= DEGRADED_THRESHOLD {
            self.degraded = true;
        }
    }
}

/// Stable identity for this host: cloud container/pod identifier when one
/// is present, local hostname otherwise. Repeated registrations from the
/// same host are thus distinguishable on the broker side.
pub fn instance_id() -> String {
    for var in ["RUNPOD_POD_ID", "VAST_CONTAINERLABEL", "CONTAINER_ID"] {
        if let Ok(id) = std::env::var(var) {
            if !id.is_empty() {
                return id;
            }
        }
    }
    hostname::get().map_or_else(|_| "unknown".into(), |h| h.to_string_lossy().into_owned())
}

/// `hex(HMAC-SHA256(secret, "{instance_id}:{timestamp}"))`.
pub fn sign_request(secret: &str, instance_id: &str, timestamp: u64) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(format!("{instance_id}:{timestamp}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RegisterRequest<'a> {
    instance_id: &'a str,
    services: &'a [ServiceSpec],
}

#[derive(Deserialize)]
struct RegisterResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    random_id: Option<String>,
    #[serde(default)]
    tunnel_token: Option<String>,
    #[serde(default)]
    urls: Option<HashMap<String, String>>,
}

#[derive(Serialize)]
struct LivenessRequest<'a> {
    instance_id: &'a str,
    random_id: &'a str,
}

#[derive(Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    active: bool,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BrokerCapacity {
    pub active_tunnels: u32,
    pub max_tunnels: u32,
    pub available: bool,
}

// ── Client ──────────────────────────────────────────────────────────────────

pub struct BrokerClient {
    http: Client,
    base: String,
    secret: String,
    instance_id: String,
    store: Arc<StateStore>,
    supervisor: Arc<dyn ProcessSupervisor>,
    cloudflared_binary: String,
    metrics_port: u16,
    registration: Option<PublicRegistration>,
    heartbeat: HeartbeatState,
    loop_stop: Option<watch::Sender<bool>>,
}

impl BrokerClient {
    pub fn new(
        base: impl Into<String>,
        secret: impl Into<String>,
        store: Arc<StateStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
        cloudflared_binary: impl Into<String>,
        metrics_port: u16,
    ) -> Self {
        let registration = store.get_as(keys::PUBLIC_REGISTRATION);
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(15))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base: base.into().trim_end_matches('/').to_owned(),
            secret: secret.into(),
            instance_id: instance_id(),
            store,
            supervisor,
            cloudflared_binary: cloudflared_binary.into(),
            metrics_port,
            registration,
            heartbeat: HeartbeatState::default(),
            loop_stop: None,
        }
    }

    pub fn registration(&self) -> Option<&PublicRegistration> {
        self.registration.as_ref()
    }

    pub fn heartbeat_state(&self) -> HeartbeatState {
        self.heartbeat
    }

    fn signed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        req.header("X-Instance-Id", &self.instance_id)
            .header("X-Timestamp", timestamp.to_string())
            .header(
                "X-Signature",
                sign_request(&self.secret, &self.instance_id, timestamp),
            )
    }

    async fn do_register(&mut self, services: &[ServiceSpec]) -> Result<PublicRegistration, CarryError> {
        let resp = self
            .signed(self.http.post(format!("{}/api/register", self.base)))
            .json(&RegisterRequest {
                instance_id: &self.instance_id,
                services,
            })
            .send()
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        let body: RegisterResponse = resp
            .json()
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;
        if !body.ok {
            return Err(BrokerError::Rejected {
                message: body.error.unwrap_or_else(|| "registration refused".into()),
            }
            .into());
        }

        let registration = PublicRegistration {
            random_id: body.random_id.ok_or_else(|| BrokerError::Rejected {
                message: "broker response missing random_id".into(),
            })?,
            tunnel_token: body.tunnel_token.ok_or_else(|| BrokerError::Rejected {
                message: "broker response missing tunnel_token".into(),
            })?,
            urls: body.urls.unwrap_or_default(),
            instance_id: self.instance_id.clone(),
        };

        self.store
            .set(keys::PUBLIC_REGISTRATION, &registration)?;
        self.supervisor
            .start(
                CLOUDFLARED,
                &self.cloudflared_binary,
                &cloudflared_args(&registration.tunnel_token, self.metrics_port),
            )
            .await?;

        self.heartbeat = HeartbeatState::default();
        self.registration = Some(registration.clone());
        tracing::info!("registered with broker as {}", registration.random_id);
        Ok(registration)
    }

    /// Best-effort broker notification; local state is cleared regardless,
    /// since the operator's intent to stop is authoritative over network
    /// partitions.
    async fn do_release(&mut self) -> Result<(), CarryError> {
        self.supervisor.stop(CLOUDFLARED).await?;

        if let Some(registration) = self.registration.take() {
            let result = self
                .signed(self.http.post(format!("{}/api/release", self.base)))
                .json(&LivenessRequest {
                    instance_id: &self.instance_id,
                    random_id: &registration.random_id,
                })
                .send()
                .await;
            if let Err(e) = result {
                tracing::warn!("broker release notification failed: {e}");
            }
        }

        self.store.remove(keys::PUBLIC_REGISTRATION)?;
        self.heartbeat = HeartbeatState::default();
        Ok(())
    }

    /// One signed liveness report. Returns whether the broker still honors
    /// the registration; only a 2xx body decides that. Transport failures
    /// and non-2xx statuses update the degraded counter and propagate as
    /// [`BrokerError::Unreachable`].
    pub async fn send_heartbeat(&mut self) -> Result<bool, CarryError> {
        let Some(registration) = self.registration.clone() else {
            return Err(BrokerError::NotRegistered.into());
        };

        let result = self
            .signed(self.http.post(format!("{}/api/heartbeat", self.base)))
            .json(&LivenessRequest {
                instance_id: &self.instance_id,
                random_id: &registration.random_id,
            })
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<HeartbeatResponse>().await {
                    Ok(body) => {
                        self.heartbeat.record_success();
                        Ok(body.active)
                    }
                    Err(e) => {
                        self.heartbeat.record_failure();
                        Err(BrokerError::Unreachable(e.to_string()).into())
                    }
                }
            }
            Ok(resp) => {
                self.heartbeat.record_failure();
                Err(BrokerError::Unreachable(format!("broker returned {}", resp.status())).into())
            }
            Err(e) => {
                self.heartbeat.record_failure();
                Err(BrokerError::Unreachable(e.to_string()).into())
            }
        }
    }

    fn stop_loop(&mut self) {
        if let Some(stop) = self.loop_stop.take() {
            let _ = stop.send(true);
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────────────

/// Cloneable handle owning the singleton guard. All mutating operations run
/// under the inner mutex.
#[derive(Clone)]
pub struct BrokerHandle {
    inner: Arc<Mutex<BrokerClient>>,
}

impl BrokerHandle {
    pub fn new(client: BrokerClient) -> Self {
        Self {
            inner: Arc::new(Mutex::new(client)),
        }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, BrokerClient> {
        self.inner.lock().await
    }

    /// Register with the broker. An existing registration is released first
    /// so no double registration can exist.
    pub async fn register(&self, services: &[ServiceSpec]) -> Result<PublicRegistration, CarryError> {
        let mut client = self.inner.lock().await;
        if client.registration.is_some() {
            tracing::info!("already registered — releasing before re-registering");
            client.stop_loop();
            client.do_release().await?;
        }
        let registration = client.do_register(services).await?;
        let stop = spawn_heartbeat_loop(self.clone(), HEARTBEAT_INTERVAL);
        client.loop_stop = Some(stop);
        Ok(registration)
    }

    /// Stop the heartbeat loop and the daemon, notify the broker (best
    /// effort), clear local state.
    pub async fn release(&self) -> Result<(), CarryError> {
        let mut client = self.inner.lock().await;
        client.stop_loop();
        client.do_release().await
    }

    /// Broker-wide capacity; read-only and unauthenticated. The request
    /// runs outside the client mutex so a slow broker never blocks
    /// register/release or the heartbeat loop.
    pub async fn capacity(&self) -> Result<BrokerCapacity, CarryError> {
        let (http, base) = {
            let client = self.inner.lock().await;
            (client.http.clone(), client.base.clone())
        };
        let resp = http
            .get(format!("{base}/api/capacity"))
            .send()
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| CarryError::from(BrokerError::Unreachable(e.to_string())))
    }

    /// Called once at process start when persisted registration state
    /// exists. Validates the registration with one immediate heartbeat; if
    /// the broker no longer honors it, attempts exactly one fresh
    /// registration and surfaces any error rather than retrying forever.
    pub async fn restore(&self, services: &[ServiceSpec]) -> Result<PublicRegistration, CarryError> {
        let mut client = self.inner.lock().await;
        let Some(registration) = client.registration.clone() else {
            return Err(BrokerError::NotRegistered.into());
        };

        if !client.supervisor.is_running(CLOUDFLARED).await {
            let args = cloudflared_args(&registration.tunnel_token, client.metrics_port);
            let binary = client.cloudflared_binary.clone();
            client.supervisor.start(CLOUDFLARED, &binary, &args).await?;
        }

        let still_active = matches!(client.send_heartbeat().await, Ok(true));
        if still_active {
            let stop = spawn_heartbeat_loop(self.clone(), HEARTBEAT_INTERVAL);
            client.loop_stop = Some(stop);
            tracing::info!("restored registration {}", registration.random_id);
            return Ok(registration);
        }

        tracing::warn!("persisted registration no longer honored — re-registering once");
        let fresh = client
            .do_register(services)
            .await
            .map_err(|e| BrokerError::ReregistrationFailed(e.to_string()))?;
        let stop = spawn_heartbeat_loop(self.clone(), HEARTBEAT_INTERVAL);
        client.loop_stop = Some(stop);
        Ok(fresh)
    }
}

/// Cancellable periodic heartbeat task: interval timer + watch stop signal,
/// so shutdown is deterministic. Broker-reported loss of the registration
/// triggers one automatic re-registration before the loop gives up.
fn spawn_heartbeat_loop(handle: BrokerHandle, interval: Duration) -> watch::Sender<bool> {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; registration already validated.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_rx.changed() => {
                    tracing::debug!("heartbeat loop stopped");
                    return;
                }
            }

            let mut client = handle.inner.lock().await;
            match client.send_heartbeat().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!("broker dropped our registration — re-registering once");
                    let services: Vec<ServiceSpec> = crate::services::specs(&client.store);
                    if let Err(e) = client.do_register(&services).await {
                        tracing::error!("re-registration failed, giving up: {e}");
                        let _ = client.do_release().await;
                        return;
                    }
                }
                Err(e) => {
                    let state = client.heartbeat;
                    tracing::warn!(
                        "heartbeat failed ({} consecutive, degraded={}): {e}",
                        state.consecutive_failures,
                        state.degraded
                    );
                }
            }
        }
    });
    stop_tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_after_threshold_failures() {
        let mut state = HeartbeatState::default();
        state.record_failure();
        state.record_failure();
        assert!(!state.degraded);
        state.record_failure();
        assert!(state.degraded);
        assert_eq!(state.consecutive_failures, 3);
    }

    #[test]
    fn success_resets_failures_and_degraded() {
        let mut state = HeartbeatState::default();
        for _ in 0..5 {
            state.record_failure();
        }
        assert!(state.degraded);
        state.record_success();
        assert!(!state.degraded);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn signature_is_stable_and_keyed() {
        let a = sign_request("secret", "host-1", 1_700_000_000);
        let b = sign_request("secret", "host-1", 1_700_000_000);
        let c = sign_request("other", "host-1", 1_700_000_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn signature_covers_instance_and_timestamp() {
        let base = sign_request("s", "host-1", 100);
        assert_ne!(base, sign_request("s", "host-2", 100));
        assert_ne!(base, sign_request("s", "host-1", 101));
    }

    #[test]
    fn instance_id_prefers_pod_env() {
        // Serialize env mutation against other tests in this module.
        unsafe { std::env::set_var("RUNPOD_POD_ID", "pod-abc") };
        assert_eq!(instance_id(), "pod-abc");
        unsafe { std::env::remove_var("RUNPOD_POD_ID") };
        assert!(!instance_id().is_empty());
    }
}
