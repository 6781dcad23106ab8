use crate::router::MediaKind;
use thiserror::Error;

/// Failure taxonomy for the bridge seams.
///
/// None of these are fatal: the controller catches them at its start/stop
/// boundary, logs them with context and keeps the process alive.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The router refused endpoint or consumer creation
    #[error("endpoint provisioning failed for {kind} producer {producer_id}: {reason}")]
    EndpointProvision {
        producer_id: String,
        kind: MediaKind,
        reason: String,
    },

    /// The transcoder binary could not be launched
    #[error("failed to launch transcoder '{binary}': {reason}")]
    Spawn { binary: String, reason: String },

    /// A stop path failed to fully release a resource; best-effort only
    #[error("teardown incomplete: {0}")]
    Teardown(String),
}
