//! Relay selection: directory fetch, latency probing, and policy.

pub mod catalog;
pub mod probe;
pub mod selector;

use std::net::Ipv4Addr;
use std::time::Duration;

/// One relay from the directory. Never mutated after decode and never
/// carried across selection rounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDescriptor {
    pub hostname: String,
    pub endpoint: Ipv4Addr,
    pub country: String,
    pub public_key: String,
    pub capability: String,
}

/// Latency observed for a relay that answered. Unreachable relays have no
/// measurement at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyMeasurement {
    pub relay: RelayDescriptor,
    pub latency: Duration,
}

/// How a selection round picks its relay. Precedence is fixed:
/// explicit hostname, then region, then global latency ranking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub explicit_hostname: Option<String>,
    pub region: Option<String>,
    pub use_latency_ranking: bool,
    pub multi_hop: bool,
}

impl SelectionPolicy {
    /// Short label of the branch this policy takes, for logs and spans.
    pub fn branch(&self) -> &'static str {
        if self.explicit_hostname.is_some() {
            "explicit"
        } else if self.region.is_some() {
            "region"
        } else if self.use_latency_ranking {
            "latency"
        } else {
            "none"
        }
    }
}

/// Outcome of a selection round: one hop, or two when multi-hop is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub entry: RelayDescriptor,
    pub exit: Option<RelayDescriptor>,
}

impl Selection {
    /// Hops in traffic order.
    pub fn hops(&self) -> impl Iterator<Item = &RelayDescriptor> {
        std::iter::once(&self.entry).chain(self.exit.iter())
    }

    /// `entry` or `entry -> exit`.
    pub fn describe(&self) -> String {
        match &self.exit {
            Some(exit) => format!("{} -> {}", self.entry.hostname, exit.hostname),
            None => self.entry.hostname.clone(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::relay;
    use super::*;

    #[test]
    fn test_policy_branch_precedence() {
        let mut policy = SelectionPolicy {
            explicit_hostname: Some("se-got-wg-001".to_string()),
            region: Some("Sweden".to_string()),
            use_latency_ranking: true,
            multi_hop: false,
        };
        assert_eq!(policy.branch(), "explicit");

        policy.explicit_hostname = None;
        assert_eq!(policy.branch(), "region");

        policy.region = None;
        assert_eq!(policy.branch(), "latency");

        policy.use_latency_ranking = false;
        assert_eq!(policy.branch(), "none");
    }

    #[test]
    fn test_selection_hops_in_order() {
        let single = Selection {
            entry: relay("a", 1, "Sweden"),
            exit: None,
        };
        assert_eq!(single.hops().count(), 1);
        assert_eq!(single.describe(), "a");

        let double = Selection {
            entry: relay("a", 1, "Sweden"),
            exit: Some(relay("b", 2, "Norway")),
        };
        let names: Vec<&str> = double.hops().map(|r| r.hostname.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(double.describe(), "a -> b");
    }
}
