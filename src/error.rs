use thiserror::Error;

/// Recoverable failures surfaced by the binding layer.
///
/// Structural invariant violations (double rundown, occupied mode slot,
/// dereferencing an unreferenced provider) are programming-contract bugs and
/// panic instead of appearing here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindError {
    /// The provider-supplied capability descriptor is malformed, truncated,
    /// or its array bounds overflow. Rejected before any other effect.
    #[error("invalid capability descriptor: {0}")]
    InvalidCapability(&'static str),

    /// An interface set already exists for this interface index, or a client
    /// with the same (client id, key) is already registered on this binding.
    #[error("duplicate object id")]
    DuplicateObjectId,

    /// The binding is already undergoing rundown; no new activity is
    /// accepted.
    #[error("binding delete pending")]
    DeletePending,

    /// No mutually acceptable protocol version, or the provider rejected the
    /// dispatch request for every acceptable version.
    #[error("no compatible provider protocol version")]
    NotSupported,

    /// Resource allocation failed (e.g. the per-binding worker thread could
    /// not be spawned). Partially completed multi-step operations unwind
    /// fully before this is returned.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Opaque failure code returned by the provider's own dispatch call,
    /// propagated unchanged to the consumer.
    #[error("provider failure code {0}")]
    Provider(u32),
}
