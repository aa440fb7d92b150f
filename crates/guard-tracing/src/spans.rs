//! Span builder helpers for relay-guard instrumentation.

/// Span covering one relay selection round.
///
/// Usage: `async { ... }.instrument(selection_round_span!(round_id, "latency")).await`
///
/// Recorded later:
/// - `entry`: hostname of the chosen first hop
/// - `exit`: hostname of the chosen second hop, for multi-hop rounds
#[macro_export]
macro_rules! selection_round_span {
    ($round_id:expr, $branch:expr) => {
        tracing::info_span!(
            "selection_round",
            round_id = %$round_id,
            branch = %$branch,
            entry = tracing::field::Empty,
            exit = tracing::field::Empty,
        )
    };
}

/// Span covering one probe phase (`coarse` or `refined`).
#[macro_export]
macro_rules! probe_phase_span {
    ($phase:expr, $candidates:expr) => {
        tracing::info_span!(
            "probe_phase",
            phase = %$phase,
            candidates = $candidates,
            survivors = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        )
    };
}

/// Span covering one supervisor failover.
#[macro_export]
macro_rules! failover_span {
    ($round_id:expr) => {
        tracing::info_span!(
            "failover",
            round_id = %$round_id,
            previous = tracing::field::Empty,
            replacement = tracing::field::Empty,
            outcome = tracing::field::Empty,
        )
    };
}
