//! Whole-group abort

use crate::group::ProcessGroup;
use batchdispatch_common::error::DispatchError;
use std::convert::Infallible;
use tracing::error;

/// Log `error`, tell the rest of the group, and exit with its exit code
///
/// A worker that was itself aborted by another rank does not re-signal. Rank 0
/// always does, which is how an abort raised by one worker reaches the others.
pub async fn abort_and_exit<G: ProcessGroup>(group: &G, error: &DispatchError) -> Infallible {
    let code = error.exit_code();
    error!(
        rank = group.rank(),
        "Aborting job with exit code {}: {:?}", code, error
    );

    if should_signal(group.rank(), error) {
        group.abort(code, &error.to_string()).await;
    }
    std::process::exit(code)
}

fn should_signal(rank: u32, error: &DispatchError) -> bool {
    rank == 0 || !matches!(error, DispatchError::Aborted { .. })
}
