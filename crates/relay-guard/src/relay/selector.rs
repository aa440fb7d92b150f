//! Selection policy on top of the catalog and the prober.
//!
//! Stateless: every round fetches a fresh directory and, for the ranked
//! branches, probes it again. Nothing outside the returned [`Selection`]
//! is touched.

use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use super::catalog::RelayCatalog;
use super::probe::LatencyProber;
use super::{RelayDescriptor, Selection, SelectionPolicy};
use crate::error::{ProbeError, SelectionError};

/// Picks relays according to a [`SelectionPolicy`].
#[derive(Clone)]
pub struct ServerSelector {
    catalog: Arc<dyn RelayCatalog>,
    prober: LatencyProber,
    capability: String,
}

impl ServerSelector {
    /// `capability` is the relay type every candidate must offer.
    pub fn new(catalog: Arc<dyn RelayCatalog>, prober: LatencyProber, capability: String) -> Self {
        Self {
            catalog,
            prober,
            capability,
        }
    }

    /// Run one selection round.
    ///
    /// With multi-hop on, the same branch runs a second time over the same
    /// pool. The first hop is not excluded, so both hops may be the same relay.
    pub async fn select(&self, policy: &SelectionPolicy) -> Result<Selection, SelectionError> {
        let round_id = Uuid::new_v4();
        let span = guard_tracing::selection_round_span!(round_id, policy.branch());

        async {
            let pool = self.pool(policy).await?;

            let entry = self.pick(policy, &pool).await?;
            tracing::Span::current().record("entry", entry.hostname.as_str());

            let exit = if policy.multi_hop {
                let exit = self.pick(policy, &pool).await?;
                tracing::Span::current().record("exit", exit.hostname.as_str());
                Some(exit)
            } else {
                None
            };

            let selection = Selection { entry, exit };
            tracing::info!(
                relay = %selection.describe(),
                country = %selection.entry.country,
                endpoint = %selection.entry.endpoint,
                "Relay selected"
            );
            Ok(selection)
        }
        .instrument(span)
        .await
    }

    /// Candidate pool for the branch `policy` takes.
    async fn pool(&self, policy: &SelectionPolicy) -> Result<Vec<RelayDescriptor>, SelectionError> {
        let region = if policy.explicit_hostname.is_some() {
            None
        } else if let Some(region) = policy.region.as_deref() {
            Some(region)
        } else if policy.use_latency_ranking {
            None
        } else {
            return Err(SelectionError::NoPolicy);
        };

        Ok(self.catalog.fetch(&self.capability, region).await?)
    }

    async fn pick(
        &self,
        policy: &SelectionPolicy,
        pool: &[RelayDescriptor],
    ) -> Result<RelayDescriptor, SelectionError> {
        if let Some(hostname) = policy.explicit_hostname.as_deref() {
            return pool
                .iter()
                .find(|relay| relay.hostname == hostname)
                .cloned()
                .ok_or_else(|| SelectionError::RelayNotFound(hostname.to_string()));
        }

        let ranked = self.prober.probe(pool).await?;
        ranked
            .into_iter()
            .next()
            .map(|m| m.relay)
            .ok_or(SelectionError::Probe(ProbeError::NoReachableRelay {
                attempted: pool.len(),
            }))
    }
}
