//! Process supervision for long-running daemons.
//!
//! The tunnel core never links the tunnel client protocol; it starts and
//! stops an external cloudflared process and asks whether it is still
//! alive. The trait keeps that seam mockable in tests.

use crate::error::{CarryError, SupervisorError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Name the tunnel daemon is registered under.
pub const CLOUDFLARED: &str = "cloudflared";

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start `program args..` under `name`. Starting a name that is already
    /// running restarts it.
    async fn start(&self, name: &str, program: &str, args: &[String]) -> Result<(), CarryError>;

    /// Stop the named process. Stopping an unknown name is not an error;
    /// the operator's intent is already satisfied.
    async fn stop(&self, name: &str) -> Result<(), CarryError>;

    async fn is_running(&self, name: &str) -> bool;
}

/// Supervisor backed by `tokio::process` with an in-memory child registry.
pub struct LocalSupervisor {
    children: Mutex<HashMap<String, Child>>,
}

impl LocalSupervisor {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSupervisor for LocalSupervisor {
    async fn start(&self, name: &str, program: &str, args: &[String]) -> Result<(), CarryError> {
        let mut children = self.children.lock().await;
        if let Some(mut old) = children.remove(name) {
            if old.try_wait().ok().flatten().is_none() {
                tracing::info!("restarting {name}");
                let _ = old.kill().await;
            }
        }

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                name: name.to_owned(),
                message: e.to_string(),
            })?;

        tracing::info!("started {name} (pid {:?})", child.id());
        children.insert(name.to_owned(), child);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), CarryError> {
        let mut children = self.children.lock().await;
        if let Some(mut child) = children.remove(name) {
            if child.try_wait().ok().flatten().is_none() {
                let _ = child.kill().await;
            }
            tracing::info!("stopped {name}");
        }
        Ok(())
    }

    async fn is_running(&self, name: &str) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(name) {
            // try_wait returning None means the child has not exited.
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }
}

/// Arguments cloudflared is launched with for a given token + metrics port.
pub fn cloudflared_args(token: &str, metrics_port: u16) -> Vec<String> {
    vec![
        "tunnel".into(),
        "run".into(),
        "--token".into(),
        token.into(),
        "--metrics".into(),
        format!("127.0.0.1:{metrics_port}"),
    ]
}
