//! Custom-mode tunnel reconciliation.
//!
//! The reconciler converges provider state to the current service catalog.
//! It is deliberately stateless: constructed fresh from configuration for
//! every call, it re-fetches the tunnel and its token from the provider each
//! time and overwrites the ingress rule list wholesale instead of diffing.
//! There is nothing to drift because nothing about "what we set last time"
//! is ever tracked.

use crate::cloudflare::{CloudflareApi, TUNNEL_DOMAIN, types};
use crate::error::{CarryError, ProviderError};
use crate::services::ServiceSpec;
use crate::supervisor::{CLOUDFLARED, ProcessSupervisor};
use base64::Engine;
use serde::Serialize;
use std::collections::HashMap;

/// Generate a collision-safe subdomain: `cc-` plus 8 hex chars.
pub fn generate_subdomain() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 4];
    rand::rng().fill_bytes(&mut buf);
    format!("cc-{}", hex::encode(buf))
}

fn generate_tunnel_secret() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 32];
    rand::rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::STANDARD.encode(buf)
}

#[derive(Debug, Serialize)]
pub struct Validation {
    pub ok: bool,
    pub message: String,
    pub account_name: Option<String>,
    pub zone_status: Option<String>,
}

#[derive(Debug)]
pub struct Provisioned {
    pub tunnel_id: String,
    pub tunnel_token: String,
    pub urls: HashMap<String, String>,
}

#[derive(Debug, Default, Serialize)]
pub struct TunnelStatus {
    pub exists: bool,
    pub tunnel_id: Option<String>,
    pub status: Option<String>,
    pub connections: Vec<types::TunnelConnection>,
}

pub struct Reconciler {
    api: CloudflareApi,
    domain: String,
    subdomain: String,
}

impl Reconciler {
    pub fn new(api: CloudflareApi, domain: impl Into<String>, subdomain: impl Into<String>) -> Self {
        Self {
            api,
            domain: domain.into(),
            subdomain: subdomain.into(),
        }
    }

    pub fn tunnel_name(&self) -> String {
        format!("comfycarry-{}", self.subdomain)
    }

    fn cname_target(tunnel_id: &str) -> String {
        format!("{tunnel_id}.{TUNNEL_DOMAIN}")
    }

    /// Prove the credential has the scopes the reconciler needs with three
    /// read-only calls. Never mutates provider state.
    pub async fn validate(&self) -> Validation {
        let account = match self.api.list_accounts().await {
            Ok(accounts) => match accounts.into_iter().next() {
                Some(a) => a,
                None => {
                    return Validation {
                        ok: false,
                        message: "token is valid but grants access to no account".into(),
                        account_name: None,
                        zone_status: None,
                    };
                }
            },
            Err(e) => {
                return Validation {
                    ok: false,
                    message: format!("account lookup failed: {e}"),
                    account_name: None,
                    zone_status: None,
                };
            }
        };

        let zone = match self.api.find_zone(&self.domain).await {
            Ok(Some(zone)) => zone,
            Ok(None) => {
                return Validation {
                    ok: false,
                    message: format!("domain {} is not a zone in this account", self.domain),
                    account_name: Some(account.name),
                    zone_status: None,
                };
            }
            Err(e) => {
                return Validation {
                    ok: false,
                    message: format!("zone lookup failed: {e}"),
                    account_name: Some(account.name),
                    zone_status: None,
                };
            }
        };

        // Proves the Tunnel:Edit-adjacent read scope without touching state.
        if let Err(e) = self.api.list_tunnels(&account.id).await {
            return Validation {
                ok: false,
                message: format!("tunnel list failed: {e}"),
                account_name: Some(account.name),
                zone_status: Some(zone.status),
            };
        }

        Validation {
            ok: true,
            message: "token verified".into(),
            account_name: Some(account.name),
            zone_status: Some(zone.status),
        }
    }

    async fn resolve_ids(&self) -> Result<(String, String), ProviderError> {
        let account = self
            .api
            .list_accounts()
            .await?
            .into_iter()
            .next()
            .ok_or(ProviderError::NoAccount)?;
        let zone = self
            .api
            .find_zone(&self.domain)
            .await?
            .ok_or_else(|| ProviderError::ZoneNotFound {
                domain: self.domain.clone(),
            })?;
        Ok((account.id, zone.id))
    }

    /// Idempotent convergence: find-or-create the tunnel, overwrite ingress,
    /// converge one CNAME per service. Safe to repeat; a second pass with an
    /// unchanged catalog performs zero DNS mutations.
    pub async fn ensure(&self, services: &[ServiceSpec]) -> Result<Provisioned, CarryError> {
        let (account_id, zone_id) = self.resolve_ids().await.map_err(CarryError::from)?;

        let name = self.tunnel_name();
        let tunnel = match self.api.find_tunnel(&account_id, &name).await? {
            Some(tunnel) => tunnel,
            None => {
                tracing::info!("creating tunnel {name}");
                self.api
                    .create_tunnel(&account_id, &name, &generate_tunnel_secret())
                    .await?
            }
        };
        let token = self.api.get_tunnel_token(&account_id, &tunnel.id).await?;

        // Wholesale ingress rebuild from the catalog, terminated by the
        // mandatory catch-all.
        let mut ingress: Vec<types::IngressRule> = services
            .iter()
            .map(|s| types::IngressRule {
                hostname: Some(s.hostname(&self.subdomain, &self.domain)),
                service: s.origin_url(),
            })
            .collect();
        ingress.push(types::IngressRule::catch_all());
        self.api
            .put_tunnel_config(&account_id, &tunnel.id, &ingress)
            .await?;

        let target = Self::cname_target(&tunnel.id);
        let mut urls = HashMap::new();
        for service in services {
            let hostname = service.hostname(&self.subdomain, &self.domain);
            match self.api.find_dns_record(&zone_id, &hostname).await? {
                Some(record) if record.content == target => {
                    tracing::debug!("dns record {hostname} already correct");
                }
                Some(record) => {
                    tracing::info!("updating dns record {hostname} -> {target}");
                    self.api
                        .update_dns_record(&zone_id, &record.id, &hostname, &target)
                        .await?;
                }
                None => {
                    tracing::info!("creating dns record {hostname} -> {target}");
                    self.api
                        .create_dns_record(&zone_id, &hostname, &target)
                        .await?;
                }
            }
            urls.insert(
                service.name.clone(),
                service.public_url(&self.subdomain, &self.domain),
            );
        }

        Ok(Provisioned {
            tunnel_id: tunnel.id,
            tunnel_token: token,
            urls,
        })
    }

    /// Remove everything `ensure` created. DNS goes first: a crash mid-way
    /// must never leave records pointing at a deleted tunnel.
    pub async fn teardown(&self, supervisor: &dyn ProcessSupervisor) -> Result<(), CarryError> {
        supervisor.stop(CLOUDFLARED).await?;

        let (account_id, zone_id) = self.resolve_ids().await.map_err(CarryError::from)?;
        let Some(tunnel) = self.api.find_tunnel(&account_id, &self.tunnel_name()).await? else {
            tracing::info!("teardown: no tunnel to remove");
            return Ok(());
        };

        let target = Self::cname_target(&tunnel.id);
        for record in self
            .api
            .list_dns_records_by_content(&zone_id, &target)
            .await?
        {
            tracing::info!("deleting dns record {}", record.name);
            self.api.delete_dns_record(&zone_id, &record.id).await?;
        }

        self.api
            .delete_tunnel_connections(&account_id, &tunnel.id)
            .await?;
        self.api.delete_tunnel(&account_id, &tunnel.id).await?;
        tracing::info!("tunnel {} removed", tunnel.id);
        Ok(())
    }

    /// Read-only. An absent tunnel is the valid "nothing provisioned" state,
    /// not an error.
    pub async fn tunnel_status(&self) -> Result<TunnelStatus, CarryError> {
        let account = self
            .api
            .list_accounts()
            .await
            .map_err(CarryError::from)?
            .into_iter()
            .next()
            .ok_or(ProviderError::NoAccount)?;

        match self.api.find_tunnel(&account.id, &self.tunnel_name()).await? {
            Some(tunnel) => Ok(TunnelStatus {
                exists: true,
                tunnel_id: Some(tunnel.id),
                status: tunnel.status,
                connections: tunnel.connections,
            }),
            None => Ok(TunnelStatus::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_subdomain_shape() {
        let sub = generate_subdomain();
        assert!(sub.starts_with("cc-"));
        assert_eq!(sub.len(), 3 + 8);
        assert!(sub[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_subdomains_differ() {
        assert_ne!(generate_subdomain(), generate_subdomain());
    }

    #[test]
    fn tunnel_secret_is_base64_of_32_bytes() {
        let secret = generate_tunnel_secret();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&secret)
            .unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn tunnel_name_embeds_subdomain() {
        let api = CloudflareApi::new("http://localhost", "t");
        let rec = Reconciler::new(api, "example.com", "cc-ab12cd34");
        assert_eq!(rec.tunnel_name(), "comfycarry-cc-ab12cd34");
    }

    #[test]
    fn cname_target_uses_tunnel_domain() {
        assert_eq!(
            Reconciler::cname_target("t-123"),
            "t-123.cfargotunnel.com"
        );
    }
}
