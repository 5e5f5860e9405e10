//! Interface set registry.
//!
//! Global (per-instance) mapping from interface index to an interface set —
//! the container holding up to two bindings, one generic and one native.
//! The registry lock protects only this mapping and the mode-slot
//! assignment; it is held briefly and never across a provider call. All
//! heavier lifecycle work is pushed onto the affected binding's work queue.

use std::{any::Any, collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    binding::{self, Binding, BindingHandle},
    caps::{CapabilitySet, HookId, InterfaceMode, MODE_COUNT},
    error::BindError,
    provider::ProviderFactory,
};

/// Everything a provider supplies when announcing one (interface, mode)
/// attachment point.
pub struct InterfaceDescriptor {
    capabilities: Vec<u8>,
    provider: Arc<dyn ProviderFactory>,
    remove_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl InterfaceDescriptor {
    /// `capabilities` is the provider's wire-format capability blob; the
    /// mode is taken from it after validation.
    pub fn new(capabilities: Vec<u8>, provider: Arc<dyn ProviderFactory>) -> Self {
        Self {
            capabilities,
            provider,
            remove_complete: None,
        }
    }

    /// Callback fired once registry-initiated removal of this binding has
    /// fully completed (clients detached, provider context closed). The
    /// closure captures whatever per-interface context the provider needs.
    pub fn on_remove_complete(mut self, complete: impl FnOnce() + Send + 'static) -> Self {
        self.remove_complete = Some(Box::new(complete));
        self
    }
}

struct InterfaceSet {
    context: Arc<dyn Any + Send + Sync>,
    slots: [Option<Arc<Binding>>; MODE_COUNT],
}

/// Registry instance. Owns the interface-index → interface-set mapping.
///
/// An explicit instance rather than process-global state, so isolated
/// registries can coexist (one per owning service, one per test).
#[derive(Default)]
pub struct BindingRegistry {
    sets: RwLock<HashMap<u32, InterfaceSet>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface set for `if_index`. Fails with
    /// `DuplicateObjectId` when one already exists.
    pub fn create_interface_set(
        &self,
        if_index: u32,
        context: Arc<dyn Any + Send + Sync>,
    ) -> Result<(), BindError> {
        let mut sets = self.sets.write();
        if sets.contains_key(&if_index) {
            warn!(
                event.name = "registry.interface_set_duplicate",
                network.interface.index = if_index,
                "interface set already registered"
            );
            return Err(BindError::DuplicateObjectId);
        }

        sets.insert(
            if_index,
            InterfaceSet {
                context,
                slots: [None, None],
            },
        );
        info!(
            event.name = "registry.interface_set_registered",
            network.interface.index = if_index,
            "interface set registered"
        );
        Ok(())
    }

    /// Opaque context supplied at interface-set creation.
    pub fn interface_set_context(&self, if_index: u32) -> Option<Arc<dyn Any + Send + Sync>> {
        self.sets
            .read()
            .get(&if_index)
            .map(|set| Arc::clone(&set.context))
    }

    /// Remove an interface set. Both mode slots must already be empty;
    /// removing a set with live bindings is a contract violation.
    pub fn delete_interface_set(&self, if_index: u32) {
        let mut sets = self.sets.write();
        let set = sets
            .remove(&if_index)
            .expect("deleting unknown interface set");
        assert!(
            set.slots.iter().all(Option::is_none),
            "interface set deleted with live bindings"
        );
        info!(
            event.name = "registry.interface_set_removed",
            network.interface.index = if_index,
            "interface set removed"
        );
    }

    /// Add one binding per descriptor to the set for `if_index`.
    ///
    /// The batch is atomic: on any failure every binding created earlier in
    /// the same batch is torn back out and the first error is returned, so
    /// no partial state is ever visible to lookups.
    pub fn add_interfaces(
        &self,
        if_index: u32,
        descriptors: Vec<InterfaceDescriptor>,
    ) -> Result<Vec<BindingHandle>, BindError> {
        let mut sets = self.sets.write();
        let set = sets
            .get_mut(&if_index)
            .expect("adding interfaces to unknown interface set");

        let mut handles: Vec<BindingHandle> = Vec::with_capacity(descriptors.len());
        let mut result = Ok(());

        for descriptor in descriptors {
            let caps = match CapabilitySet::parse(&descriptor.capabilities) {
                Ok(caps) => caps,
                Err(e) => {
                    warn!(
                        event.name = "registry.capabilities_rejected",
                        network.interface.index = if_index,
                        error = %e,
                        "capability descriptor rejected"
                    );
                    result = Err(e);
                    break;
                }
            };
            let mode = caps.mode();

            let bind = match Binding::new(
                if_index,
                caps,
                descriptor.provider,
                descriptor.remove_complete,
            ) {
                Ok(bind) => bind,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };

            let slot = &mut set.slots[mode.slot()];
            assert!(slot.is_none(), "mode slot already occupied");
            *slot = Some(Arc::clone(&bind));
            info!(
                event.name = "registry.binding_registered",
                network.interface.index = if_index,
                mode = %mode,
                "binding registered"
            );
            handles.push(BindingHandle(bind));
        }

        if let Err(e) = result {
            // Unwind the batch: pull every binding added above back out of
            // its slot before anything observed it.
            for handle in handles {
                set.slots[handle.mode().slot()] = None;
                debug!(
                    event.name = "registry.binding_unwound",
                    network.interface.index = if_index,
                    mode = %handle.mode(),
                    "binding removed during batch unwind"
                );
            }
            return Err(e);
        }

        Ok(handles)
    }

    /// Detach each binding from its set and schedule asynchronous deletion.
    /// Returns immediately; rundown (client detach, provider close, removal
    /// completion) happens on each binding's work queue.
    pub fn remove_interfaces(&self, handles: Vec<BindingHandle>) {
        let mut sets = self.sets.write();

        for handle in handles {
            let set = sets
                .get_mut(&handle.if_index())
                .expect("removing binding with unknown interface set");
            let initial = set.slots[handle.mode().slot()]
                .take()
                .expect("binding already removed from its slot");
            assert!(
                Arc::ptr_eq(&initial, &handle.0),
                "foreign binding in mode slot"
            );

            info!(
                event.name = "registry.binding_deregistering",
                network.interface.index = handle.if_index(),
                mode = %handle.mode(),
                "binding deregistering"
            );

            binding::queue_work(&handle.0, move |bind| {
                binding::interface_delete(bind);
                // `initial` — the registry slot's existence reference —
                // is released when this item completes.
                drop(initial);
            });
        }
    }

    /// Locate a binding on `if_index` supporting every required hook, under
    /// the shared lock, and take an existence reference before returning.
    ///
    /// Candidates are scanned generic first, native second, keeping the
    /// last match: with no mode filter a qualifying native binding is
    /// preferred over a generic one.
    pub fn find_and_reference(
        &self,
        if_index: u32,
        required_hooks: &[HookId],
        required_mode: Option<InterfaceMode>,
    ) -> Option<BindingHandle> {
        let sets = self.sets.read();
        let set = sets.get(&if_index)?;

        let mut found: Option<&Arc<Binding>> = None;
        for mode in [InterfaceMode::Generic, InterfaceMode::Native] {
            let Some(candidate) = set.slots[mode.slot()].as_ref() else {
                continue;
            };
            if required_mode.is_some_and(|required| required != mode) {
                continue;
            }
            if !candidate.supports_hooks(required_hooks) {
                continue;
            }
            found = Some(candidate);
        }

        found.map(|bind| BindingHandle(Arc::clone(bind)))
    }

    /// Stop the registry. Every interface set must already have been
    /// deleted; a non-empty registry at shutdown is a contract violation.
    pub fn shutdown(&self) {
        let sets = self.sets.read();
        assert!(sets.is_empty(), "registry shut down with live interface sets");
        info!(event.name = "registry.stopped", "binding registry stopped");
    }
}
