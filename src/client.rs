//! Consumer client registration types.
//!
//! Components that attach to a binding (filter programs, raw-socket
//! bindings) register as clients so rundown can notify them when the
//! binding goes away. A client is identified by its component id plus an
//! opaque key; uniqueness is enforced per binding.

use std::{fmt, sync::Arc};

/// Identifies the kind of component attached to a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consumer component attached to a binding.
pub trait BindingClient: Send + Sync {
    fn client_id(&self) -> ClientId;

    /// Detach notification, invoked exactly once per linked entry during
    /// binding rundown. The client may re-register on other bindings from
    /// here, but registration on the binding being torn down fails with
    /// `DeletePending`.
    fn detached(&self, key: &[u8]);
}

/// One linked registration: a client plus the opaque key distinguishing
/// multiple registrations of the same component.
pub struct ClientEntry {
    client: Arc<dyn BindingClient>,
    key: Vec<u8>,
}

impl ClientEntry {
    pub fn new(client: Arc<dyn BindingClient>, key: Vec<u8>) -> Self {
        Self { client, key }
    }

    pub fn client(&self) -> &Arc<dyn BindingClient> {
        &self.client
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn matches(&self, client_id: ClientId, key: &[u8]) -> bool {
        self.client.client_id() == client_id && self.key == key
    }

    pub(crate) fn notify_detached(&self) {
        self.client.detached(&self.key);
    }
}

impl fmt::Debug for ClientEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEntry")
            .field("client_id", &self.client.client_id())
            .field("key", &self.key)
            .finish()
    }
}
