//! Provider-side traits.
//!
//! An interface provider is the driver-facing half of a binding: it owns the
//! actual hook points and queue rings. The binding layer reaches it through
//! a lazily opened, version-negotiated channel. Providers implement
//! [`ProviderFactory`] (channel open), [`ProviderChannel`] (version-keyed
//! dispatch lookup and consumer-side close) and [`ProviderDispatch`] (the
//! negotiated operation surface).

use crate::{
    caps::ApiVersion,
    error::BindError,
};

/// Creation-time configuration for an RX queue, forwarded verbatim to the
/// provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxQueueConfig {
    pub queue_id: u32,
}

/// Creation-time configuration for a TX queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxQueueConfig {
    pub queue_id: u32,
}

/// Activation-time configuration for an RX queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxQueueActivateConfig {
    pub fill_in_headroom: bool,
}

/// Activation-time configuration for a TX queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxQueueActivateConfig {
    pub out_of_order_completion: bool,
}

/// A provider-owned RX queue. Created through the binding, activated and
/// deleted through it as well so the binding can account provider usage.
pub trait RxQueue: Send {
    fn activate(&mut self, config: &RxQueueActivateConfig);
}

/// A provider-owned TX queue.
pub trait TxQueue: Send {
    fn activate(&mut self, config: &TxQueueActivateConfig);
}

/// The negotiated operation surface of a provider, selected per protocol
/// version during attachment. One implementation per supported version.
pub trait ProviderDispatch: Send + Sync {
    /// Invoked once after negotiation with the version that was agreed on.
    /// Providers that need no per-binding setup keep the default.
    fn open(&self, _negotiated: ApiVersion) -> Result<(), BindError> {
        Ok(())
    }

    /// Invoked once when the binding releases the provider, before the
    /// attachment channel is closed.
    fn close(&self) {}

    fn create_rx_queue(&self, config: &RxQueueConfig) -> Result<Box<dyn RxQueue>, BindError>;

    fn create_tx_queue(&self, config: &TxQueueConfig) -> Result<Box<dyn TxQueue>, BindError>;
}

/// An open channel to a provider for one binding.
pub trait ProviderChannel: Send {
    /// Request the dispatch table for one negotiated version. The binding
    /// layer walks the provider's advertised versions and calls this for the
    /// first acceptable candidate; a failure moves negotiation to the next
    /// candidate rather than aborting.
    fn dispatch_for(
        &mut self,
        version: &ApiVersion,
    ) -> Result<std::sync::Arc<dyn ProviderDispatch>, BindError>;

    /// Consumer-side close. The provider must fire the [`DetachSignal`] it
    /// received at open (if it has not already) once it has fully released
    /// the binding; the binding layer blocks on that notification before
    /// freeing the attachment.
    ///
    /// [`DetachSignal`]: crate::DetachSignal
    fn close(&mut self);
}

/// Opens provider channels. The stand-in for a platform module registry:
/// given an interface index and the provider-chosen instance id from the
/// capability descriptor, produce a live channel.
pub trait ProviderFactory: Send + Sync {
    fn open(
        &self,
        if_index: u32,
        instance_id: u64,
        detach: crate::DetachSignal,
    ) -> Result<Box<dyn ProviderChannel>, BindError>;
}
