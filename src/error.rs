use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `comfycarry`.
///
/// Each subsystem defines its own error variant. Callers (the gateway, the
/// CLI) match on these to decide what to surface to the operator; internal
/// code continues to use `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum CarryError {
    // ── Config / state store ────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Provider control plane ──────────────────────────────────────────
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    // ── Broker (public mode) ────────────────────────────────────────────
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    // ── Daemon supervision ──────────────────────────────────────────────
    #[error("supervisor: {0}")]
    Supervisor(#[from] SupervisorError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Not retryable; surfaced verbatim with a remediation hint.
    #[error("missing {field} — run provisioning first or set it in the dashboard")]
    Missing { field: &'static str },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("state store: {0}")]
    Store(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Provider control-plane errors ──────────────────────────────────────────

/// The provider rejecting a call and the provider being unreachable propagate
/// distinctly: the remediation differs (fix credentials vs. wait/check
/// connectivity), and blind retry against a control plane risks duplicate
/// side effects, so neither is retried automatically.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rejected the request (code {code}): {message}")]
    Api { code: i64, message: String },

    #[error("provider unreachable: {0}")]
    Network(String),

    #[error("unexpected provider response: {0}")]
    Decode(String),

    #[error("domain {domain} is not a zone in this account")]
    ZoneNotFound { domain: String },

    #[error("no account is accessible with this credential")]
    NoAccount,
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

// ─── Broker errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker rejected the request: {message}")]
    Rejected { message: String },

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("no active registration")]
    NotRegistered,

    #[error("registration expired and re-registration failed: {0}")]
    ReregistrationFailed(String),
}

// ─── Supervisor errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {name}: {message}")]
    Spawn { name: String, message: String },

    #[error("no process registered under name {0}")]
    UnknownProcess(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, CarryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_carries_remediation_hint() {
        let err = CarryError::Config(ConfigError::Missing { field: "api_token" });
        assert!(err.to_string().contains("api_token"));
        assert!(err.to_string().contains("provisioning"));
    }

    #[test]
    fn provider_api_error_displays_code_and_message() {
        let err = CarryError::Provider(ProviderError::Api {
            code: 10000,
            message: "Authentication error".into(),
        });
        let text = err.to_string();
        assert!(text.contains("10000"));
        assert!(text.contains("Authentication error"));
    }

    #[test]
    fn network_and_api_errors_are_distinct() {
        let api = ProviderError::Api {
            code: 81057,
            message: "record exists".into(),
        };
        let net = ProviderError::Network("connection refused".into());
        assert!(!api.to_string().contains("unreachable"));
        assert!(net.to_string().contains("unreachable"));
    }

    #[test]
    fn broker_rejected_displays_message() {
        let err = CarryError::Broker(BrokerError::Rejected {
            message: "capacity exhausted".into(),
        });
        assert!(err.to_string().contains("capacity exhausted"));
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let carry_err: CarryError = anyhow_err.into();
        assert!(carry_err.to_string().contains("something went wrong"));
    }
}
