//! Error types for each stage of selection and supervision.

use thiserror::Error;

/// Failures fetching or decoding the relay directory.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("relay directory unavailable: {0}")]
    Unavailable(String),

    #[error("relay directory malformed: {0}")]
    Malformed(String),

    #[error("no {capability} relays match{}", region_suffix(.region))]
    NoMatch {
        capability: String,
        region: Option<String>,
    },
}

fn region_suffix(region: &Option<String>) -> String {
    match region {
        Some(r) => format!(" in region {r}"),
        None => String::new(),
    }
}

/// Aggregate probe failures. Individual unreachable relays are never errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("none of {attempted} candidate relays answered the coarse probe")]
    NoReachableRelay { attempted: usize },

    #[error("none of {refined} refinement candidates answered a refined probe")]
    NoneSurvivedRefinement { refined: usize },
}

/// Failures of a single selection round.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("relay {0} not found in directory")]
    RelayNotFound(String),

    #[error("selection policy names no server, region, or latency ranking")]
    NoPolicy,
}

/// Failures querying the status oracle. The supervisor treats every variant
/// as an insecure path.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("status endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("status response malformed: {0}")]
    Malformed(String),
}

/// Failures at the tunnel lifecycle boundary. Output is kept opaque.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {}: {output}", exit_code_text(.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

fn exit_code_text(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "no status (killed by signal)".to_string(),
    }
}

/// Failures changing or restoring routing and resolver state.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("resolver file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Command(#[from] TunnelError),
}

/// Failures that end supervision, either at establishment or on fail-stop.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("relay selection failed: {0}")]
    Selection(#[from] SelectionError),

    #[error("tunnel lifecycle failed: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("network configuration failed: {0}")]
    Network(#[from] NetworkError),

    #[error("shutdown requested before the tunnel was established")]
    Cancelled,
}
