//! Wire types for the Cloudflare v4 control plane.
//!
//! Only the fields this system reads are modeled; the provider is free to
//! send more.

use serde::{Deserialize, Serialize};

/// Standard `{success, errors, result}` response envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
    pub result: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMessage {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tunnel {
    pub id: String,
    pub name: String,
    /// `inactive`, `healthy`, `degraded`, or `down`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub connections: Vec<TunnelConnection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConnection {
    #[serde(default)]
    pub colo_name: Option<String>,
    #[serde(default)]
    pub is_pending_reconnect: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct CreateTunnelRequest<'a> {
    pub name: &'a str,
    pub tunnel_secret: &'a str,
    pub config_src: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

impl IngressRule {
    /// Terminal rule every ingress list must end with.
    pub fn catch_all() -> Self {
        Self {
            hostname: None,
            service: "http_status:404".into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TunnelConfigRequest<'a> {
    pub config: TunnelConfigBody<'a>,
}

#[derive(Debug, Serialize)]
pub struct TunnelConfigBody<'a> {
    pub ingress: &'a [IngressRule],
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub content: String,
    #[serde(default)]
    pub proxied: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct DnsRecordRequest<'a> {
    #[serde(rename = "type")]
    pub record_type: &'a str,
    pub name: &'a str,
    pub content: &'a str,
    pub proxied: bool,
    /// 1 means "automatic" on the provider side.
    pub ttl: u32,
}
