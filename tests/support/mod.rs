//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use comfycarry::config::Config;
use comfycarry::error::CarryError;
use comfycarry::supervisor::ProcessSupervisor;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Mutex;

/// Recording supervisor: tracks starts/stops without spawning anything.
#[derive(Default)]
pub struct MockSupervisor {
    pub running: Mutex<HashSet<String>>,
    pub starts: Mutex<Vec<(String, String, Vec<String>)>>,
    pub stops: Mutex<Vec<String>>,
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn last_start_args(&self) -> Option<Vec<String>> {
        self.starts.lock().unwrap().last().map(|(_, _, a)| a.clone())
    }
}

#[async_trait]
impl ProcessSupervisor for MockSupervisor {
    async fn start(&self, name: &str, program: &str, args: &[String]) -> Result<(), CarryError> {
        self.starts
            .lock()
            .unwrap()
            .push((name.to_owned(), program.to_owned(), args.to_vec()));
        self.running.lock().unwrap().insert(name.to_owned());
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), CarryError> {
        self.stops.lock().unwrap().push(name.to_owned());
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    async fn is_running(&self, name: &str) -> bool {
        self.running.lock().unwrap().contains(name)
    }
}

/// Provider `{success, errors, result}` envelope around `result`.
pub fn ok_envelope(result: Value) -> Value {
    json!({"success": true, "errors": [], "result": result})
}

pub fn err_envelope(code: i64, message: &str) -> Value {
    json!({
        "success": false,
        "errors": [{"code": code, "message": message}],
        "result": null,
    })
}

/// Config pointing at test servers, with state under a temp dir.
pub fn test_config(dir: &std::path::Path, api_base: &str, broker_url: &str) -> Config {
    let mut config = Config::default();
    config.api_base = api_base.trim_end_matches('/').to_owned();
    config.broker.url = broker_url.trim_end_matches('/').to_owned();
    config.broker.secret = "test-secret".into();
    // Nothing listens here; the readiness probe reports unknown.
    config.cloudflared.metrics_port = 1;
    config.state_path = dir.join("state.json");
    config.config_path = dir.join("config.toml");
    config
}
