//! The startup probe shared by the TCP and TCP-over-datagram clients
//! (§4.3.1, §4.3.3): a speculative overlay connect performed once, so DHT
//! discovery latency is paid up front and an unreachable peer is reported as
//! a clean startup failure rather than a silent per-connection hang.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::ProbeError;
use crate::keys::SubPublicKey;
use crate::overlay::{EndpointKind, OverlayNode};

pub const PROBE_RETRIES: u32 = 3;
pub const PROBE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Attempt an overlay connect to `peer`, waiting for `open` and then closing
/// it immediately. Retries up to [`PROBE_RETRIES`] times with
/// [`PROBE_RETRY_DELAY`] between attempts, but the whole sequence, every
/// attempt plus every delay, is bounded by `total_budget` (spec.md §8
/// scenario 4: an unreachable peer must fail within that one bound, not
/// `per-attempt timeout * PROBE_RETRIES`).
pub async fn probe(
    node: &OverlayNode,
    peer: SubPublicKey,
    kind: EndpointKind,
    total_budget: Duration,
) -> Result<(), ProbeError> {
    match tokio::time::timeout(total_budget, probe_attempts(node, peer, kind)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError {
            attempts: PROBE_RETRIES,
            reason: format!("exceeded {:?} total probe budget", total_budget),
        }),
    }
}

async fn probe_attempts(
    node: &OverlayNode,
    peer: SubPublicKey,
    kind: EndpointKind,
) -> Result<(), ProbeError> {
    let mut last_reason = String::new();
    for attempt in 1..=PROBE_RETRIES {
        match node.connect(peer, kind).await {
            Ok(mut endpoint) => {
                info!(attempt, "probe succeeded");
                if kind == EndpointKind::Stream {
                    let _ = endpoint.end().await;
                }
                return Ok(());
            }
            Err(e) => {
                last_reason = e.to_string();
                warn!(attempt, reason = %last_reason, "probe attempt failed");
            }
        }
        if attempt < PROBE_RETRIES {
            tokio::time::sleep(PROBE_RETRY_DELAY).await;
        }
    }
    Err(ProbeError {
        attempts: PROBE_RETRIES,
        reason: last_reason,
    })
}
