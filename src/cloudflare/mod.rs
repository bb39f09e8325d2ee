//! Minimal Cloudflare control-plane client.
//!
//! One bearer credential bound to one base URL. Every call unwraps the
//! `{success, errors, result}` envelope and returns the `result` payload;
//! a `success: false` response becomes [`ProviderError::Api`] carrying the
//! first reported message and code. No retries happen here — callers decide,
//! which keeps the error surface precise per call (auth failure, not-found,
//! and rate-limit all propagate distinctly).

pub mod types;

use crate::error::ProviderError;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use types::{
    Account, CreateTunnelRequest, DnsRecord, DnsRecordRequest, Envelope, IngressRule, Tunnel,
    TunnelConfigRequest,
};

/// Suffix of every tunnel CNAME target.
pub const TUNNEL_DOMAIN: &str = "cfargotunnel.com";

pub fn build_api_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub struct CloudflareApi {
    client: Client,
    base: String,
    token: String,
}

impl CloudflareApi {
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: build_api_client(),
            base: base.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::unwrap_envelope(resp.json().await?)
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let resp = self
            .client
            .request(method, format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::unwrap_envelope(resp.json().await?)
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let resp = self
            .client
            .delete(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::unwrap_envelope(resp.json().await?)
    }

    fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, ProviderError> {
        if envelope.success {
            envelope
                .result
                .ok_or_else(|| ProviderError::Decode("success response without result".into()))
        } else {
            let first = envelope.errors.first();
            Err(ProviderError::Api {
                code: first.map_or(0, |e| e.code),
                message: first.map_or_else(
                    || "provider reported failure without detail".to_owned(),
                    |e| e.message.clone(),
                ),
            })
        }
    }

    // ── Accounts & zones ────────────────────────────────────────────────

    pub async fn list_accounts(&self) -> Result<Vec<Account>, ProviderError> {
        self.get("/accounts").await
    }

    pub async fn find_zone(&self, domain: &str) -> Result<Option<types::Zone>, ProviderError> {
        let zones: Vec<types::Zone> = self.get(&format!("/zones?name={domain}")).await?;
        Ok(zones.into_iter().find(|z| z.name == domain))
    }

    // ── Tunnels ─────────────────────────────────────────────────────────

    pub async fn list_tunnels(&self, account: &str) -> Result<Vec<Tunnel>, ProviderError> {
        self.get(&format!("/accounts/{account}/cfd_tunnel?is_deleted=false"))
            .await
    }

    pub async fn find_tunnel(
        &self,
        account: &str,
        name: &str,
    ) -> Result<Option<Tunnel>, ProviderError> {
        let tunnels: Vec<Tunnel> = self
            .get(&format!(
                "/accounts/{account}/cfd_tunnel?name={name}&is_deleted=false"
            ))
            .await?;
        Ok(tunnels.into_iter().find(|t| t.name == name))
    }

    pub async fn create_tunnel(
        &self,
        account: &str,
        name: &str,
        secret_b64: &str,
    ) -> Result<Tunnel, ProviderError> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/accounts/{account}/cfd_tunnel"),
            &CreateTunnelRequest {
                name,
                tunnel_secret: secret_b64,
                config_src: "cloudflare",
            },
        )
        .await
    }

    /// Tokens are never persisted locally; the provider is the only source.
    pub async fn get_tunnel_token(&self, account: &str, id: &str) -> Result<String, ProviderError> {
        self.get(&format!("/accounts/{account}/cfd_tunnel/{id}/token"))
            .await
    }

    /// Full overwrite of the remote ingress rule list.
    pub async fn put_tunnel_config(
        &self,
        account: &str,
        id: &str,
        ingress: &[IngressRule],
    ) -> Result<serde_json::Value, ProviderError> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/accounts/{account}/cfd_tunnel/{id}/configurations"),
            &TunnelConfigRequest {
                config: types::TunnelConfigBody { ingress },
            },
        )
        .await
    }

    pub async fn delete_tunnel_connections(
        &self,
        account: &str,
        id: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        self.delete(&format!("/accounts/{account}/cfd_tunnel/{id}/connections"))
            .await
    }

    pub async fn delete_tunnel(
        &self,
        account: &str,
        id: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        self.delete(&format!("/accounts/{account}/cfd_tunnel/{id}"))
            .await
    }

    // ── DNS records ─────────────────────────────────────────────────────

    pub async fn find_dns_record(
        &self,
        zone: &str,
        name: &str,
    ) -> Result<Option<DnsRecord>, ProviderError> {
        let records: Vec<DnsRecord> = self
            .get(&format!("/zones/{zone}/dns_records?type=CNAME&name={name}"))
            .await?;
        Ok(records.into_iter().find(|r| r.name == name))
    }

    pub async fn list_dns_records_by_content(
        &self,
        zone: &str,
        content: &str,
    ) -> Result<Vec<DnsRecord>, ProviderError> {
        self.get(&format!("/zones/{zone}/dns_records?type=CNAME&content={content}"))
            .await
    }

    pub async fn create_dns_record(
        &self,
        zone: &str,
        name: &str,
        content: &str,
    ) -> Result<DnsRecord, ProviderError> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/zones/{zone}/dns_records"),
            &DnsRecordRequest {
                record_type: "CNAME",
                name,
                content,
                proxied: true,
                ttl: 1,
            },
        )
        .await
    }

    pub async fn update_dns_record(
        &self,
        zone: &str,
        record_id: &str,
        name: &str,
        content: &str,
    ) -> Result<DnsRecord, ProviderError> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/zones/{zone}/dns_records/{record_id}"),
            &DnsRecordRequest {
                record_type: "CNAME",
                name,
                content,
                proxied: true,
                ttl: 1,
            },
        )
        .await
    }

    pub async fn delete_dns_record(
        &self,
        zone: &str,
        record_id: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        self.delete(&format!("/zones/{zone}/dns_records/{record_id}"))
            .await
    }
}
