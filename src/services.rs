//! Service catalog.
//!
//! A service is anything on this host worth a hostname: the ComfyUI web UI,
//! Jupyter, SSH. Defaults ship with the binary; operators may add their own
//! entries or re-suffix the defaults. The catalog is the single input to
//! both reconciliation (custom mode) and broker registration (public mode).

use crate::error::{CarryError, ConfigError};
use crate::store::{StateStore, keys};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
    Ssh,
}

impl Protocol {
    /// Scheme used in the tunnel's ingress origin URL.
    fn origin_scheme(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Ssh => "ssh",
        }
    }

    /// Scheme used in the operator-facing URL map. HTTP services are reached
    /// through the provider edge over TLS; tcp/ssh keep their own scheme.
    fn public_scheme(self) -> &'static str {
        match self {
            Protocol::Http => "https",
            Protocol::Tcp => "tcp",
            Protocol::Ssh => "ssh",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub port: u16,
    /// Hostname suffix. Empty means the service owns the bare subdomain.
    pub suffix: String,
    pub protocol: Protocol,
}

impl ServiceSpec {
    pub fn hostname(&self, subdomain: &str, domain: &str) -> String {
        if self.suffix.is_empty() {
            format!("{subdomain}.{domain}")
        } else {
            format!("{subdomain}-{}.{domain}", self.suffix)
        }
    }

    pub fn public_url(&self, subdomain: &str, domain: &str) -> String {
        format!(
            "{}://{}",
            self.protocol.public_scheme(),
            self.hostname(subdomain, domain)
        )
    }

    pub fn origin_url(&self) -> String {
        format!("{}://localhost:{}", self.protocol.origin_scheme(), self.port)
    }
}

/// A catalog entry plus whether it came from the operator or the defaults.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub spec: ServiceSpec,
    pub custom: bool,
}

pub fn default_services() -> Vec<ServiceSpec> {
    vec![
        ServiceSpec {
            name: "ComfyUI".into(),
            port: 8188,
            suffix: String::new(),
            protocol: Protocol::Http,
        },
        ServiceSpec {
            name: "Jupyter".into(),
            port: 8888,
            suffix: "jupyter".into(),
            protocol: Protocol::Http,
        },
        ServiceSpec {
            name: "SSH".into(),
            port: 22,
            suffix: "ssh".into(),
            protocol: Protocol::Ssh,
        },
    ]
}

/// Defaults (with persisted suffix overrides applied) plus custom services.
pub fn catalog(store: &StateStore) -> Vec<CatalogEntry> {
    let overrides: HashMap<String, String> =
        store.get_as(keys::SUFFIX_OVERRIDES).unwrap_or_default();
    let mut entries: Vec<CatalogEntry> = default_services()
        .into_iter()
        .map(|mut spec| {
            if let Some(suffix) = overrides.get(&spec.name) {
                spec.suffix = suffix.clone();
            }
            CatalogEntry { spec, custom: false }
        })
        .collect();

    let custom: Vec<ServiceSpec> = store.get_as(keys::CUSTOM_SERVICES).unwrap_or_default();
    entries.extend(custom.into_iter().map(|spec| CatalogEntry { spec, custom: true }));
    entries
}

pub fn specs(store: &StateStore) -> Vec<ServiceSpec> {
    catalog(store).into_iter().map(|e| e.spec).collect()
}

/// Add a user-defined service. The suffix must be unique across the whole
/// catalog; a duplicate name replaces the previous custom entry.
pub fn add_custom(store: &StateStore, spec: ServiceSpec) -> Result<(), CarryError> {
    if spec.name.trim().is_empty() {
        return Err(ConfigError::Validation("service name must not be empty".into()).into());
    }
    for entry in catalog(store) {
        if entry.spec.name != spec.name && entry.spec.suffix == spec.suffix {
            return Err(ConfigError::Validation(format!(
                "suffix \"{}\" is already used by service \"{}\"",
                spec.suffix, entry.spec.name
            ))
            .into());
        }
    }
    let mut custom: Vec<ServiceSpec> = store.get_as(keys::CUSTOM_SERVICES).unwrap_or_default();
    custom.retain(|s| s.name != spec.name);
    custom.push(spec);
    store.set(keys::CUSTOM_SERVICES, custom)
}

pub fn remove_custom(store: &StateStore, name: &str) -> Result<(), CarryError> {
    let mut custom: Vec<ServiceSpec> = store.get_as(keys::CUSTOM_SERVICES).unwrap_or_default();
    let before = custom.len();
    custom.retain(|s| s.name != name);
    if custom.len() == before {
        return Err(ConfigError::Validation(format!("no custom service named \"{name}\"")).into());
    }
    store.set(keys::CUSTOM_SERVICES, custom)
}

/// Re-suffix a service. Custom entries are edited in place; default entries
/// get a row in the persisted override map so upgrades keep the rename.
pub fn rename(store: &StateStore, name: &str, suffix: &str) -> Result<(), CarryError> {
    for entry in catalog(store) {
        if entry.spec.name != name && entry.spec.suffix == suffix {
            return Err(ConfigError::Validation(format!(
                "suffix \"{suffix}\" is already used by service \"{}\"",
                entry.spec.name
            ))
            .into());
        }
    }

    let mut custom: Vec<ServiceSpec> = store.get_as(keys::CUSTOM_SERVICES).unwrap_or_default();
    if let Some(spec) = custom.iter_mut().find(|s| s.name == name) {
        spec.suffix = suffix.to_owned();
        return store.set(keys::CUSTOM_SERVICES, custom);
    }

    if default_services().iter().any(|s| s.name == name) {
        let mut overrides: HashMap<String, String> =
            store.get_as(keys::SUFFIX_OVERRIDES).unwrap_or_default();
        overrides.insert(name.to_owned(), suffix.to_owned());
        return store.set(keys::SUFFIX_OVERRIDES, overrides);
    }

    Err(ConfigError::Validation(format!("no service named \"{name}\"")).into())
}
