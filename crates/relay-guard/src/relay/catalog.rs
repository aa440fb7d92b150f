//! Relay directory: fetch over HTTP, decode, and filter.
//!
//! The upstream order carries no meaning. Callers must not assume the
//! returned relays are sorted in any way.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::Deserialize;

use super::RelayDescriptor;
use crate::error::CatalogError;

/// Source of relay descriptors.
#[async_trait]
pub trait RelayCatalog: Send + Sync {
    /// Relays offering `capability`, optionally restricted to one region.
    /// Fails with [`CatalogError::NoMatch`] rather than returning an empty list.
    async fn fetch(
        &self,
        capability: &str,
        region: Option<&str>,
    ) -> Result<Vec<RelayDescriptor>, CatalogError>;
}

/// Directory entry as served. Every field is optional here so that
/// validation can name exactly what is missing.
#[derive(Debug, Deserialize)]
struct RawRelay {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    ipv4_addr_in: Option<String>,
    #[serde(default)]
    country_name: Option<String>,
    #[serde(default)]
    pubkey: Option<String>,
    #[serde(rename = "type", default)]
    relay_type: Option<String>,
}

/// Catalog backed by the relay-listing HTTP endpoint.
#[derive(Clone)]
pub struct HttpRelayCatalog {
    client: reqwest::Client,
    url: String,
}

impl HttpRelayCatalog {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl RelayCatalog for HttpRelayCatalog {
    async fn fetch(
        &self,
        capability: &str,
        region: Option<&str>,
    ) -> Result<Vec<RelayDescriptor>, CatalogError> {
        tracing::debug!(url = %self.url, capability, region = ?region, "Fetching relay directory");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Unavailable(format!("HTTP {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CatalogError::Unavailable(format!("reading body: {e}")))?;

        let relays = decode_relays(&body, capability, region)?;
        tracing::info!(
            capability,
            region = ?region,
            matched = relays.len(),
            "Relay directory fetched"
        );
        Ok(relays)
    }
}

/// Decode a directory document and keep the entries matching `capability`
/// and, when given, `region`. Both comparisons ignore ASCII case.
pub fn decode_relays(
    body: &[u8],
    capability: &str,
    region: Option<&str>,
) -> Result<Vec<RelayDescriptor>, CatalogError> {
    let raw: Vec<RawRelay> = serde_json::from_slice(body)
        .map_err(|e| CatalogError::Malformed(format!("expected an array of relays: {e}")))?;

    let mut relays = Vec::new();
    for (index, entry) in raw.into_iter().enumerate() {
        let relay_type = entry
            .relay_type
            .ok_or_else(|| CatalogError::Malformed(format!("entry {index}: missing type")))?;
        if !relay_type.eq_ignore_ascii_case(capability) {
            continue;
        }

        let country = entry.country_name.unwrap_or_default();
        if let Some(region) = region {
            if !country.eq_ignore_ascii_case(region) {
                continue;
            }
        }

        let hostname = entry
            .hostname
            .filter(|h| !h.is_empty())
            .ok_or_else(|| CatalogError::Malformed(format!("entry {index}: missing hostname")))?;

        let endpoint = entry
            .ipv4_addr_in
            .as_deref()
            .ok_or_else(|| {
                CatalogError::Malformed(format!("entry {index} ({hostname}): missing ipv4_addr_in"))
            })?
            .parse::<Ipv4Addr>()
            .map_err(|e| {
                CatalogError::Malformed(format!("entry {index} ({hostname}): ipv4_addr_in: {e}"))
            })?;

        relays.push(RelayDescriptor {
            hostname,
            endpoint,
            country,
            public_key: entry.pubkey.unwrap_or_default(),
            capability: relay_type,
        });
    }

    if relays.is_empty() {
        return Err(CatalogError::NoMatch {
            capability: capability.to_string(),
            region: region.map(str::to_string),
        });
    }

    Ok(relays)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory catalog that filters like the HTTP one and records each
    /// requested region.
    #[derive(Default)]
    pub struct StaticCatalog {
        relays: Vec<RelayDescriptor>,
        unavailable: AtomicBool,
        requests: Mutex<Vec<Option<String>>>,
    }

    impl StaticCatalog {
        pub fn new(relays: Vec<RelayDescriptor>) -> Self {
            Self {
                relays,
                ..Self::default()
            }
        }

        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        pub fn requests(&self) -> Vec<Option<String>> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RelayCatalog for StaticCatalog {
        async fn fetch(
            &self,
            capability: &str,
            region: Option<&str>,
        ) -> Result<Vec<RelayDescriptor>, CatalogError> {
            self.requests
                .lock()
                .unwrap()
                .push(region.map(str::to_string));

            if self.unavailable.load(Ordering::SeqCst) {
                return Err(CatalogError::Unavailable("HTTP 503 Service Unavailable".to_string()));
            }

            let relays: Vec<RelayDescriptor> = self
                .relays
                .iter()
                .filter(|r| r.capability.eq_ignore_ascii_case(capability))
                .filter(|r| region.map_or(true, |region| r.country.eq_ignore_ascii_case(region)))
                .cloned()
                .collect();

            if relays.is_empty() {
                return Err(CatalogError::NoMatch {
                    capability: capability.to_string(),
                    region: region.map(str::to_string),
                });
            }
            Ok(relays)
        }
    }
}
