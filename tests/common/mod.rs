//! Shared test doubles: a scriptable in-process provider plus a recording
//! client, and helpers to stand up a registry with one populated interface.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Once,
};

use crossbeam::channel::bounded;
use ifbind::{
    ApiVersion, BindError, BindingClient, BindingHandle, BindingRegistry, CapabilityBlobBuilder,
    ClientId, DetachSignal, HookDirection, HookId, HookLayer, HookSublayer, InterfaceDescriptor,
    InterfaceMode, ProviderChannel, ProviderDispatch, ProviderFactory, RxQueue,
    RxQueueActivateConfig, RxQueueConfig, TxQueue, TxQueueActivateConfig, TxQueueConfig,
};
use parking_lot::Mutex;

pub const RX_INSPECT: HookId = HookId::new(HookLayer::L2, HookDirection::Rx, HookSublayer::Inspect);
pub const TX_INSPECT: HookId = HookId::new(HookLayer::L2, HookDirection::Tx, HookSublayer::Inspect);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Observable state shared between a [`MockProvider`] and the test body.
/// Knobs are plain atomics/mutexes so tests can reconfigure mid-flight.
#[derive(Default)]
pub struct MockState {
    /// `ProviderFactory::open` fails with `Provider(7)` while set.
    pub fail_open: AtomicBool,
    /// `ProviderDispatch::open` fails with `Provider(8)` while set.
    pub fail_dispatch_open: AtomicBool,
    /// Versions for which `dispatch_for` refuses to hand out a table.
    pub rejected_versions: Mutex<Vec<ApiVersion>>,
    /// Error every queue-creation call returns while set.
    pub queue_failure: Mutex<Option<BindError>>,
    /// On consumer-side close, fire the detach notification from a separate
    /// thread after this many milliseconds instead of inline. Models a
    /// provider with slow teardown.
    pub detach_delay_ms: AtomicUsize,
    /// Detach signal captured at channel open, consumed by whichever side
    /// detaches first.
    detach: Mutex<Option<DetachSignal>>,
    /// Ordered log of provider entry points hit.
    events: Mutex<Vec<String>>,
    /// Queues created and not yet dropped.
    pub live_queues: AtomicUsize,
}

impl MockState {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn take_events(&self) -> Vec<String> {
        std::mem::take(&mut self.events.lock())
    }

    /// Fire the provider-initiated detach path. Panics when no channel is
    /// open or the signal was already consumed.
    pub fn fire_detach(&self) {
        let signal = self
            .detach
            .lock()
            .take()
            .expect("no pending detach signal");
        signal.notify();
    }
}

/// `ProviderFactory` test double. All behavior is scripted through the
/// shared [`MockState`].
pub struct MockProvider {
    pub state: Arc<MockState>,
}

impl MockProvider {
    pub fn new() -> (Arc<Self>, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            Arc::new(Self {
                state: Arc::clone(&state),
            }),
            state,
        )
    }
}

impl ProviderFactory for MockProvider {
    fn open(
        &self,
        if_index: u32,
        instance_id: u64,
        detach: DetachSignal,
    ) -> Result<Box<dyn ProviderChannel>, BindError> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            self.state.record("factory_open_failed");
            return Err(BindError::Provider(7));
        }
        self.state
            .record(format!("factory_open {if_index}/{instance_id}"));
        *self.state.detach.lock() = Some(detach);
        Ok(Box::new(MockChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockChannel {
    state: Arc<MockState>,
}

impl ProviderChannel for MockChannel {
    fn dispatch_for(&mut self, version: &ApiVersion) -> Result<Arc<dyn ProviderDispatch>, BindError> {
        self.state.record(format!("dispatch_for {version}"));
        if self.state.rejected_versions.lock().contains(version) {
            return Err(BindError::Provider(100));
        }
        Ok(Arc::new(MockDispatch {
            state: Arc::clone(&self.state),
        }))
    }

    fn close(&mut self) {
        self.state.record("channel_close");
        // The provider acknowledges a consumer-side close by firing the
        // detach signal it captured at open, unless it already detached.
        if let Some(signal) = self.state.detach.lock().take() {
            let delay = self.state.detach_delay_ms.load(Ordering::SeqCst);
            if delay == 0 {
                signal.notify();
            } else {
                std::thread::spawn(move || {
                    std::thread::sleep(std::time::Duration::from_millis(delay as u64));
                    signal.notify();
                });
            }
        }
    }
}

struct MockDispatch {
    state: Arc<MockState>,
}

impl ProviderDispatch for MockDispatch {
    fn open(&self, negotiated: ApiVersion) -> Result<(), BindError> {
        self.state.record(format!("dispatch_open {negotiated}"));
        if self.state.fail_dispatch_open.load(Ordering::SeqCst) {
            return Err(BindError::Provider(8));
        }
        Ok(())
    }

    fn close(&self) {
        self.state.record("dispatch_close");
    }

    fn create_rx_queue(&self, config: &RxQueueConfig) -> Result<Box<dyn RxQueue>, BindError> {
        if let Some(e) = self.state.queue_failure.lock().clone() {
            self.state.record(format!("rx_queue_refused {}", config.queue_id));
            return Err(e);
        }
        self.state.record(format!("rx_queue_created {}", config.queue_id));
        self.state.live_queues.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockQueue {
            state: Arc::clone(&self.state),
            queue_id: config.queue_id,
        }))
    }

    fn create_tx_queue(&self, config: &TxQueueConfig) -> Result<Box<dyn TxQueue>, BindError> {
        if let Some(e) = self.state.queue_failure.lock().clone() {
            self.state.record(format!("tx_queue_refused {}", config.queue_id));
            return Err(e);
        }
        self.state.record(format!("tx_queue_created {}", config.queue_id));
        self.state.live_queues.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockQueue {
            state: Arc::clone(&self.state),
            queue_id: config.queue_id,
        }))
    }
}

struct MockQueue {
    state: Arc<MockState>,
    queue_id: u32,
}

impl RxQueue for MockQueue {
    fn activate(&mut self, config: &RxQueueActivateConfig) {
        self.state.record(format!(
            "rx_queue_activated {} headroom={}",
            self.queue_id, config.fill_in_headroom
        ));
    }
}

impl TxQueue for MockQueue {
    fn activate(&mut self, config: &TxQueueActivateConfig) {
        self.state.record(format!(
            "tx_queue_activated {} ooo={}",
            self.queue_id, config.out_of_order_completion
        ));
    }
}

impl Drop for MockQueue {
    fn drop(&mut self) {
        self.state.record(format!("queue_dropped {}", self.queue_id));
        self.state.live_queues.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A client that records detach notifications.
pub struct RecordingClient {
    id: ClientId,
    pub detached_keys: Mutex<Vec<Vec<u8>>>,
}

impl RecordingClient {
    pub fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id: ClientId(id),
            detached_keys: Mutex::new(Vec::new()),
        })
    }

    pub fn detach_count(&self) -> usize {
        self.detached_keys.lock().len()
    }
}

impl BindingClient for RecordingClient {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn detached(&self, key: &[u8]) {
        self.detached_keys.lock().push(key.to_vec());
    }
}

/// Standard capability blob: the given mode and hooks, advertising minimum
/// version 1.0.0.
pub fn blob(mode: InterfaceMode, hooks: &[HookId]) -> Vec<u8> {
    blob_with_versions(mode, hooks, &[ApiVersion::new(1, 0, 0)])
}

pub fn blob_with_versions(
    mode: InterfaceMode,
    hooks: &[HookId],
    versions: &[ApiVersion],
) -> Vec<u8> {
    let mut builder = CapabilityBlobBuilder::new(mode, 0xAB);
    for hook in hooks {
        builder = builder.hook(*hook);
    }
    for version in versions {
        builder = builder.version(*version);
    }
    builder.build()
}

/// Registry with one interface set and one generic binding supporting rx/tx
/// inspect hooks, plus the mock state scripting its provider.
pub fn registry_with_binding(if_index: u32) -> (BindingRegistry, BindingHandle, Arc<MockState>) {
    init_tracing();
    let registry = BindingRegistry::new();
    registry
        .create_interface_set(if_index, Arc::new(()))
        .unwrap();
    let (provider, state) = MockProvider::new();
    let mut handles = registry
        .add_interfaces(
            if_index,
            vec![InterfaceDescriptor::new(
                blob(InterfaceMode::Generic, &[RX_INSPECT, TX_INSPECT]),
                provider,
            )],
        )
        .unwrap();
    assert_eq!(handles.len(), 1);
    (registry, handles.remove(0), state)
}

/// Wait until every work item queued on `handle` so far has completed, by
/// running a probe item behind them.
pub fn drain_queue(handle: &BindingHandle) {
    let (tx, rx) = bounded(1);
    handle.queue_work(move || {
        let _ = tx.send(());
    });
    rx.recv().expect("work queue stopped before probe ran");
}
