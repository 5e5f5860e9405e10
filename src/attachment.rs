//! Provider attachment negotiation and teardown.
//!
//! The attachment is the live negotiated handle to a provider's dispatch
//! surface. It is opened lazily, on the first queue-creation request against
//! a binding, and torn down by whichever side moves first:
//!
//! - the consumer path closes the channel and then blocks until the
//!   provider's detach notification has been observed, so the provider has
//!   fully released the binding before the attachment is dropped;
//! - the provider fires [`DetachSignal::notify`] at an arbitrary time, which
//!   only signals the one-shot event and schedules a work item — rundown is
//!   never run inline because the provider callback may hold provider
//!   locks.
//!
//! The attachment is jointly owned by the binding slot and the in-flight
//! detach work item (an `Arc` with exactly two clones); it is freed once
//! both paths have released theirs.

use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{info, trace, warn};

use crate::{
    binding::Binding,
    caps::{ApiVersion, CapabilitySet, DRIVER_API_CURRENT},
    error::BindError,
    provider::{ProviderChannel, ProviderDispatch},
};

/// Live negotiated handle to a provider for one binding.
pub(crate) struct Attachment {
    if_index: u32,
    detach_rx: Receiver<()>,
    channel: Mutex<Option<Box<dyn ProviderChannel>>>,
}

/// Handed to the provider at channel open. Consumed by [`notify`], which the
/// provider must invoke exactly once when it detaches — including in
/// response to a consumer-side close. The call must not block and must not
/// mutate binding state: it sends the one-shot event, schedules the detach
/// work item, and returns.
///
/// [`notify`]: DetachSignal::notify
pub struct DetachSignal {
    tx: Sender<()>,
    binding: Arc<Binding>,
    attachment: Arc<Attachment>,
}

impl DetachSignal {
    pub fn notify(self) {
        let DetachSignal {
            tx,
            binding,
            attachment,
        } = self;

        trace!(
            event.name = "attachment.detach_notified",
            network.interface.index = binding.if_index(),
            mode = %binding.mode(),
            "provider detach notification received"
        );

        let _ = tx.send(());
        crate::binding::queue_detach_delete(&binding, attachment);
        // The binding reference taken at open is released here.
    }
}

/// Open the provider channel for `binding` and negotiate a dispatch table.
///
/// Walks the provider-advertised minimum versions in provider order and
/// requests dispatch for the first candidate the current version accepts; a
/// failed dispatch request moves on to the next candidate. With no workable
/// candidate the already-opened channel is closed (including the blocking
/// detach wait) and `NotSupported` is returned.
pub(crate) fn open(
    binding: &Arc<Binding>,
) -> Result<(Arc<Attachment>, Arc<dyn ProviderDispatch>, ApiVersion), BindError> {
    let caps = binding.capabilities();
    let (tx, rx) = bounded(1);
    let attachment = Arc::new(Attachment {
        if_index: binding.if_index(),
        detach_rx: rx,
        channel: Mutex::new(None),
    });

    let signal = DetachSignal {
        tx,
        binding: Arc::clone(binding),
        attachment: Arc::clone(&attachment),
    };

    let channel = binding
        .provider_factory()
        .open(binding.if_index(), caps.instance_id(), signal)
        .map_err(|e| {
            warn!(
                event.name = "attachment.open_failed",
                network.interface.index = binding.if_index(),
                mode = %binding.mode(),
                error = %e,
                "failed to open provider channel"
            );
            e
        })?;
    *attachment.channel.lock() = Some(channel);

    match negotiate(&attachment, binding, caps) {
        Ok((dispatch, version)) => Ok((attachment, dispatch, version)),
        Err(e) => {
            attachment.close();
            Err(e)
        }
    }
}

fn negotiate(
    attachment: &Attachment,
    binding: &Binding,
    caps: &CapabilitySet,
) -> Result<(Arc<dyn ProviderDispatch>, ApiVersion), BindError> {
    let mut channel = attachment.channel.lock();
    let channel = channel.as_mut().expect("channel open during negotiation");
    negotiate_dispatch(channel.as_mut(), caps.versions()).map(|(dispatch, version)| {
        info!(
            event.name = "attachment.negotiated",
            network.interface.index = binding.if_index(),
            mode = %binding.mode(),
            version = %version,
            "received provider dispatch table"
        );
        (dispatch, version)
    })
}

/// Version-walk core, split out so acceptance/fallback policy is testable
/// without a binding.
fn negotiate_dispatch(
    channel: &mut dyn ProviderChannel,
    advertised: &[ApiVersion],
) -> Result<(Arc<dyn ProviderDispatch>, ApiVersion), BindError> {
    for candidate in advertised {
        if !DRIVER_API_CURRENT.accepts(candidate) {
            continue;
        }
        match channel.dispatch_for(candidate) {
            Ok(dispatch) => return Ok((dispatch, *candidate)),
            Err(e) => {
                warn!(
                    event.name = "attachment.dispatch_request_failed",
                    version = %candidate,
                    error = %e,
                    "provider rejected dispatch request, trying next version"
                );
            }
        }
    }
    Err(BindError::NotSupported)
}

impl Attachment {
    /// Whether the provider channel has not yet been closed from the
    /// consumer side. The detach work item uses this to tell a
    /// provider-initiated detach from the tail end of a consumer close.
    pub(crate) fn channel_open(&self) -> bool {
        self.channel.lock().is_some()
    }

    /// Consumer-side close: close the channel, then block until the
    /// provider's detach notification has been observed.
    pub(crate) fn close(&self) {
        let mut channel = self
            .channel
            .lock()
            .take()
            .expect("attachment closed twice");
        channel.close();

        trace!(
            event.name = "attachment.awaiting_detach",
            network.interface.index = self.if_index,
            "waiting for provider detach notification"
        );
        if self.detach_rx.recv().is_err() {
            // Provider dropped its signal without notifying; there is
            // nothing left to wait for.
            warn!(
                event.name = "attachment.detach_signal_lost",
                network.interface.index = self.if_index,
                "provider released detach signal without notifying"
            );
        }
    }
}
