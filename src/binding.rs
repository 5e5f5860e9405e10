//! The per-(interface, mode) binding object.
//!
//! A binding mediates between one provider attachment and the consumers
//! bound to it. It carries two independent reference counts:
//!
//! - *existence*: the `Arc<Binding>` strong count. Every holder of the
//!   binding (registry slot, lookup caller, queued work item, pending
//!   delete) owns one unit; the binding is freed exactly once, when the
//!   count reaches zero, which also disconnects its work queue. A reference
//!   is only ever taken while already holding a valid one, so the count can
//!   never be revived from zero.
//! - *provider usage*: one unit per live provider queue. The attachment is
//!   opened lazily on the 0→1 transition and closed on the return to zero.
//!
//! Rundown is triggered from two independent origins — registry-side
//! interface removal and provider-initiated detach — and both funnel
//! through the binding's work queue, so they serialize against each other
//! and against every other mutating operation.

use std::{fmt, sync::Arc};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace};

use crate::{
    attachment::{self, Attachment},
    caps::{ApiVersion, CapabilitySet, InterfaceMode},
    client::{BindingClient, ClientEntry, ClientId},
    error::BindError,
    provider::{
        ProviderDispatch, ProviderFactory, RxQueue, RxQueueActivateConfig, RxQueueConfig, TxQueue,
        TxQueueActivateConfig, TxQueueConfig,
    },
    workqueue::WorkQueue,
};

pub(crate) struct Binding {
    if_index: u32,
    caps: CapabilitySet,
    factory: Arc<dyn ProviderFactory>,
    queue: WorkQueue,
    state: Mutex<BindingState>,
    /// Signalled when an in-flight provider open settles, so concurrent
    /// queue creators can re-check the state.
    opened: Condvar,
}

/// Mutable interior, guarded by one mutex. Mutating control operations are
/// serialized either by the work queue (rundown paths) or by this lock
/// (queue create/delete from consumer threads); the lock is never taken
/// from a provider detach callback, and never held across a provider call —
/// blocking open/close work happens with the state extracted and the lock
/// released.
struct BindingState {
    provider_usage: u32,
    /// A provider open is in flight with the lock released.
    provider_opening: bool,
    dispatch: Option<Arc<dyn ProviderDispatch>>,
    negotiated: Option<ApiVersion>,
    attachment: Option<Arc<Attachment>>,
    clients: Vec<ClientEntry>,
    /// Registry-side removal has begun. Monotonic.
    binding_deleting: bool,
    /// Provider-side detach has begun. Monotonic.
    provider_deleting: bool,
    remove_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl BindingState {
    fn rundown(&self) -> bool {
        self.binding_deleting || self.provider_deleting
    }
}

impl Binding {
    pub(crate) fn new(
        if_index: u32,
        caps: CapabilitySet,
        factory: Arc<dyn ProviderFactory>,
        remove_complete: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<Arc<Self>, BindError> {
        let queue = WorkQueue::start(format!("{if_index}-{}", caps.mode()))?;
        Ok(Arc::new(Self {
            if_index,
            caps,
            factory,
            queue,
            state: Mutex::new(BindingState {
                provider_usage: 0,
                provider_opening: false,
                dispatch: None,
                negotiated: None,
                attachment: None,
                clients: Vec::new(),
                binding_deleting: false,
                provider_deleting: false,
                remove_complete,
            }),
            opened: Condvar::new(),
        }))
    }

    pub(crate) fn if_index(&self) -> u32 {
        self.if_index
    }

    pub(crate) fn mode(&self) -> InterfaceMode {
        self.caps.mode()
    }

    pub(crate) fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    pub(crate) fn provider_factory(&self) -> &Arc<dyn ProviderFactory> {
        &self.factory
    }

    pub(crate) fn supports_hooks(&self, hooks: &[crate::caps::HookId]) -> bool {
        self.caps.supports_hooks(hooks)
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug_assert_eq!(state.provider_usage, 0);
        trace!(
            event.name = "binding.freed",
            network.interface.index = self.if_index,
            mode = %self.caps.mode(),
            "binding released, work queue shutting down"
        );
        // Dropping `queue` disconnects the channel; the worker drains any
        // remaining items and exits.
    }
}

/// Submit a routine to the binding's serialized queue. The item itself
/// holds one existence reference, released after the routine returns.
pub(crate) fn queue_work(
    binding: &Arc<Binding>,
    routine: impl FnOnce(&Arc<Binding>) + Send + 'static,
) {
    let item_ref = Arc::clone(binding);
    binding.queue.submit(Box::new(move || routine(&item_ref)));
}

/// Schedule the provider-initiated rundown work item. Invoked from
/// [`DetachSignal::notify`]; must stay nonblocking.
///
/// [`DetachSignal::notify`]: crate::DetachSignal::notify
pub(crate) fn queue_detach_delete(binding: &Arc<Binding>, attachment: Arc<Attachment>) {
    queue_work(binding, move |binding| {
        provider_delete(binding, &attachment);
        // Second joint-owner reference to the attachment drops here.
    });
}

/// Work-queue routine for provider-initiated detach. If the consumer side
/// already closed the channel there is nothing left to run down.
fn provider_delete(binding: &Arc<Binding>, attachment: &Attachment) {
    if !attachment.channel_open() {
        return;
    }

    {
        let mut state = binding.state.lock();
        assert!(!state.provider_deleting, "provider rundown ran twice");
        state.provider_deleting = true;
    }

    info!(
        event.name = "binding.provider_rundown",
        network.interface.index = binding.if_index(),
        mode = %binding.mode(),
        "provider detached, starting rundown"
    );
    start_rundown(binding);
}

/// Work-queue routine for registry-initiated removal. The caller passes
/// ownership of the registry slot's existence reference, released when the
/// routine returns.
pub(crate) fn interface_delete(binding: &Arc<Binding>) {
    {
        let mut state = binding.state.lock();
        state.binding_deleting = true;
    }

    info!(
        event.name = "binding.deleting",
        network.interface.index = binding.if_index(),
        mode = %binding.mode(),
        "interface removed, starting rundown"
    );
    start_rundown(binding);
}

/// Disable new activity and release everything the binding holds. Safe to
/// run from both rundown origins in either order; each step is idempotent.
fn start_rundown(binding: &Arc<Binding>) {
    let close = {
        let mut state = binding.state.lock();
        if state.provider_usage == 0 {
            take_provider_close(&mut state)
        } else {
            // The attachment closes when the usage count naturally returns
            // to zero.
            None
        }
    };
    if let Some(close) = close {
        finish_provider_close(binding, close);
    }

    // Detach clients outside the state lock: the notification may
    // re-register the client on another binding (never this one —
    // registration now fails with DeletePending).
    loop {
        let entry = {
            let mut state = binding.state.lock();
            if state.clients.is_empty() {
                break;
            }
            state.clients.remove(0)
        };
        debug!(
            event.name = "binding.client_detached",
            network.interface.index = binding.if_index(),
            mode = %binding.mode(),
            client.id = %entry.client().client_id(),
            "notifying client of binding teardown"
        );
        entry.notify_detached();
    }
}

/// Provider pieces extracted from the state so the blocking close runs with
/// the lock released.
struct ProviderClose {
    dispatch: Option<Arc<dyn ProviderDispatch>>,
    attachment: Option<Arc<Attachment>>,
    remove_complete: Option<Box<dyn FnOnce() + Send>>,
}

/// Detach the open dispatch/attachment (and, for a registry-side removal,
/// the completion callback) from the state. Runs at most once per open;
/// every step is guarded by `Option::take`. Must be called under the state
/// lock; the returned pieces are closed after it is released.
fn take_provider_close(state: &mut BindingState) -> Option<ProviderClose> {
    let close = ProviderClose {
        dispatch: state.dispatch.take(),
        attachment: state.attachment.take(),
        remove_complete: if state.binding_deleting {
            state.remove_complete.take()
        } else {
            None
        },
    };
    state.negotiated = None;

    if close.dispatch.is_none() && close.attachment.is_none() && close.remove_complete.is_none() {
        None
    } else {
        Some(close)
    }
}

/// Close the dispatch surface and the attachment, and complete a pending
/// registry-side removal. The state lock must not be held: the attachment
/// close blocks until the provider's detach notification is observed, and
/// consumer operations keep running meanwhile.
fn finish_provider_close(binding: &Binding, close: ProviderClose) {
    if let Some(dispatch) = close.dispatch {
        dispatch.close();
        debug!(
            event.name = "binding.provider_closed",
            network.interface.index = binding.if_index(),
            mode = %binding.mode(),
            "provider dispatch closed"
        );
    }

    if let Some(attachment) = close.attachment {
        // Blocks until the provider's detach notification is observed.
        attachment.close();
    }

    if let Some(complete) = close.remove_complete {
        complete();
        info!(
            event.name = "binding.remove_complete",
            network.interface.index = binding.if_index(),
            mode = %binding.mode(),
            "interface removal completed"
        );
    }
}

/// Take one provider-usage reference, opening the attachment on the first
/// use, and return the dispatch surface to delegate to. Fails with
/// `DeletePending` once rundown has begun.
///
/// The lazy open runs with the lock released; `provider_opening` keeps it
/// exclusive, and concurrent creators wait on the condvar and re-check.
fn reference_provider(binding: &Arc<Binding>) -> Result<Arc<dyn ProviderDispatch>, BindError> {
    let mut state = binding.state.lock();
    loop {
        if state.rundown() {
            debug!(
                event.name = "binding.reference_denied",
                network.interface.index = binding.if_index(),
                mode = %binding.mode(),
                "provider reference denied: rundown in progress"
            );
            return Err(BindError::DeletePending);
        }

        if let Some(dispatch) = state.dispatch.as_ref() {
            let dispatch = Arc::clone(dispatch);
            state.provider_usage += 1;
            return Ok(dispatch);
        }

        if !state.provider_opening {
            break;
        }
        binding.opened.wait(&mut state);
    }

    assert_eq!(state.provider_usage, 0);
    state.provider_opening = true;
    drop(state);

    let opened = open_provider(binding);

    let mut state = binding.state.lock();
    state.provider_opening = false;
    binding.opened.notify_all();

    let (attachment, dispatch, version) = opened?;

    if state.rundown() {
        // Rundown began while the open was in flight; it found nothing to
        // close, so close what was just opened before reporting the denial.
        drop(state);
        dispatch.close();
        attachment.close();
        return Err(BindError::DeletePending);
    }

    state.dispatch = Some(Arc::clone(&dispatch));
    state.negotiated = Some(version);
    state.attachment = Some(attachment);
    state.provider_usage += 1;
    Ok(dispatch)
}

/// Release one provider-usage reference. On the return to zero the caller
/// receives the close work to perform once the lock is released.
#[must_use]
fn dereference_provider(state: &mut BindingState) -> Option<ProviderClose> {
    assert!(state.provider_usage > 0, "provider usage underflow");
    state.provider_usage -= 1;
    if state.provider_usage == 0 {
        take_provider_close(state)
    } else {
        None
    }
}

/// Open the provider channel and dispatch surface. Blocking; runs with no
/// lock held, guarded by `provider_opening`.
fn open_provider(
    binding: &Arc<Binding>,
) -> Result<(Arc<Attachment>, Arc<dyn ProviderDispatch>, ApiVersion), BindError> {
    let (attachment, dispatch, version) = attachment::open(binding)?;

    if let Err(e) = dispatch.open(version) {
        dispatch.close();
        attachment.close();
        return Err(e);
    }

    info!(
        event.name = "binding.provider_opened",
        network.interface.index = binding.if_index(),
        mode = %binding.mode(),
        version = %version,
        "provider attachment opened"
    );

    Ok((attachment, dispatch, version))
}

/// Reference to a binding. Cloning takes an existence reference; dropping
/// releases it. The binding is freed exactly once, when the last reference
/// anywhere (registry slot, handles, queued work items) is gone.
#[derive(Clone)]
pub struct BindingHandle(pub(crate) Arc<Binding>);

impl BindingHandle {
    /// Interface index this binding is attached to.
    pub fn if_index(&self) -> u32 {
        self.0.if_index()
    }

    pub fn mode(&self) -> InterfaceMode {
        self.0.mode()
    }

    /// The validated capability descriptor, immutable for the binding's
    /// lifetime.
    pub fn capabilities(&self) -> &CapabilitySet {
        self.0.capabilities()
    }

    /// The protocol version negotiated with the provider, if the attachment
    /// is currently open.
    pub fn negotiated_version(&self) -> Option<ApiVersion> {
        self.0.state.lock().negotiated
    }

    /// Link a client registration. Fails with `DeletePending` once the
    /// binding is marked for deletion and with `DuplicateObjectId` when an
    /// entry with the same (client id, key) is already linked.
    pub fn register_client(&self, entry: ClientEntry) -> Result<(), BindError> {
        let binding = &self.0;
        let mut state = binding.state.lock();

        if state.rundown() {
            debug!(
                event.name = "binding.client_registration_denied",
                network.interface.index = binding.if_index(),
                mode = %binding.mode(),
                "client registration denied: binding deleting"
            );
            return Err(BindError::DeletePending);
        }

        let client_id = entry.client().client_id();
        if state
            .clients
            .iter()
            .any(|existing| existing.matches(client_id, entry.key()))
        {
            debug!(
                event.name = "binding.client_registration_denied",
                network.interface.index = binding.if_index(),
                mode = %binding.mode(),
                client.id = %client_id,
                "client registration denied: duplicate"
            );
            return Err(BindError::DuplicateObjectId);
        }

        trace!(
            event.name = "binding.client_registered",
            network.interface.index = binding.if_index(),
            mode = %binding.mode(),
            client.id = %client_id,
            "client registered"
        );
        state.clients.push(entry);
        Ok(())
    }

    /// Unlink a client registration. A no-op when the entry is no longer
    /// linked (e.g. rundown already detached it).
    pub fn deregister_client(&self, client_id: ClientId, key: &[u8]) {
        let mut state = self.0.state.lock();
        if let Some(position) = state
            .clients
            .iter()
            .position(|entry| entry.matches(client_id, key))
        {
            state.clients.remove(position);
            trace!(
                event.name = "binding.client_deregistered",
                network.interface.index = self.0.if_index(),
                client.id = %client_id,
                "client deregistered"
            );
        }
    }

    /// Linear scan for a linked registration by exact (client id, key).
    pub fn find_client(&self, client_id: ClientId, key: &[u8]) -> Option<Arc<dyn BindingClient>> {
        let state = self.0.state.lock();
        state
            .clients
            .iter()
            .find(|entry| entry.matches(client_id, key))
            .map(|entry| Arc::clone(entry.client()))
    }

    /// Create an RX queue through the provider, taking one provider-usage
    /// reference (which opens the attachment on first use). A provider
    /// failure releases the just-taken reference and is propagated
    /// unchanged.
    pub fn create_rx_queue(&self, config: &RxQueueConfig) -> Result<Box<dyn RxQueue>, BindError> {
        let binding = &self.0;
        let dispatch = reference_provider(binding)?;

        match dispatch.create_rx_queue(config) {
            Ok(queue) => {
                trace!(
                    event.name = "binding.rx_queue_created",
                    network.interface.index = binding.if_index(),
                    mode = %binding.mode(),
                    queue.id = config.queue_id,
                    "rx queue created"
                );
                Ok(queue)
            }
            Err(e) => {
                let close = dereference_provider(&mut binding.state.lock());
                if let Some(close) = close {
                    finish_provider_close(binding, close);
                }
                Err(e)
            }
        }
    }

    /// Delegate RX queue activation. No reference-count effect.
    pub fn activate_rx_queue(&self, queue: &mut dyn RxQueue, config: &RxQueueActivateConfig) {
        queue.activate(config);
    }

    /// Delete an RX queue and release one provider-usage reference,
    /// closing the attachment when this was the last queue.
    pub fn delete_rx_queue(&self, queue: Box<dyn RxQueue>) {
        drop(queue);
        let binding = &self.0;
        let close = dereference_provider(&mut binding.state.lock());
        if let Some(close) = close {
            finish_provider_close(binding, close);
        }
        trace!(
            event.name = "binding.rx_queue_deleted",
            network.interface.index = binding.if_index(),
            mode = %binding.mode(),
            "rx queue deleted"
        );
    }

    /// TX counterpart of [`create_rx_queue`](Self::create_rx_queue).
    pub fn create_tx_queue(&self, config: &TxQueueConfig) -> Result<Box<dyn TxQueue>, BindError> {
        let binding = &self.0;
        let dispatch = reference_provider(binding)?;

        match dispatch.create_tx_queue(config) {
            Ok(queue) => {
                trace!(
                    event.name = "binding.tx_queue_created",
                    network.interface.index = binding.if_index(),
                    mode = %binding.mode(),
                    queue.id = config.queue_id,
                    "tx queue created"
                );
                Ok(queue)
            }
            Err(e) => {
                let close = dereference_provider(&mut binding.state.lock());
                if let Some(close) = close {
                    finish_provider_close(binding, close);
                }
                Err(e)
            }
        }
    }

    /// Delegate TX queue activation. No reference-count effect.
    pub fn activate_tx_queue(&self, queue: &mut dyn TxQueue, config: &TxQueueActivateConfig) {
        queue.activate(config);
    }

    /// TX counterpart of [`delete_rx_queue`](Self::delete_rx_queue).
    pub fn delete_tx_queue(&self, queue: Box<dyn TxQueue>) {
        drop(queue);
        let binding = &self.0;
        let close = dereference_provider(&mut binding.state.lock());
        if let Some(close) = close {
            finish_provider_close(binding, close);
        }
        trace!(
            event.name = "binding.tx_queue_deleted",
            network.interface.index = binding.if_index(),
            mode = %binding.mode(),
            "tx queue deleted"
        );
    }

    /// Schedule a routine on this binding's serialized work queue. The
    /// generic hook for components that need their own actions ordered
    /// against binding teardown.
    pub fn queue_work(&self, routine: impl FnOnce() + Send + 'static) {
        queue_work(&self.0, move |_| routine());
    }
}

impl fmt::Debug for BindingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingHandle")
            .field("if_index", &self.0.if_index())
            .field("mode", &self.0.mode())
            .finish()
    }
}
