//! Graceful leadership handoff.

use crate::consensus::Consensus;
use crate::error::Result;
use crate::forward::ForwardRequest;
use crate::router::{Hop, Routed, WriteRouter};

/// Transfers leadership away from the leader, wherever this is called.
///
/// On the leader the substrate's transfer runs locally; elsewhere the request
/// is forwarded to the recorded leader and its answer is returned verbatim.
pub async fn pass_leadership<C: Consensus>(
    router: &WriteRouter<C>,
    hop: Hop,
) -> Result<Routed<()>> {
    let request = ForwardRequest::get(&["raft", "pass_leadership"]);
    router
        .execute_or_forward(request, hop, || router.consensus().leadership_transfer())
        .await
}
