//! Binding lifecycle layer between network interface providers and the
//! components that consume them.
//!
//! A provider announces attachment points on an interface by registering an
//! interface set and adding one capability descriptor per operating mode
//! ([`InterfaceMode::Generic`] or [`InterfaceMode::Native`]). Each accepted
//! descriptor becomes a binding: a reference-counted object carrying the
//! parsed [`CapabilitySet`], a lazily opened provider attachment, the set of
//! registered clients, and a serialized work queue on which all lifecycle
//! transitions run.
//!
//! Consumers locate bindings through [`BindingRegistry::find_and_reference`]
//! and interact via the returned [`BindingHandle`]: registering
//! [`BindingClient`]s for detach notification and delegating packet queue
//! creation to the provider. Teardown is two-party and asynchronous —
//! either the registry removes the binding or the provider detaches through
//! its [`DetachSignal`] — and both paths converge on the same rundown
//! sequence on the binding's work queue.

mod attachment;
mod binding;
mod caps;
mod client;
mod error;
mod provider;
mod registry;
mod workqueue;

pub use attachment::DetachSignal;
pub use binding::BindingHandle;
pub use caps::{
    ApiVersion, CapabilityBlobBuilder, CapabilitySet, HookDirection, HookId, HookLayer,
    HookSublayer, InterfaceMode, DRIVER_API_CURRENT,
};
pub use client::{BindingClient, ClientEntry, ClientId};
pub use error::BindError;
pub use provider::{
    ProviderChannel, ProviderDispatch, ProviderFactory, RxQueue, RxQueueActivateConfig,
    RxQueueConfig, TxQueue, TxQueueActivateConfig, TxQueueConfig,
};
pub use registry::{BindingRegistry, InterfaceDescriptor};
