//! Registry of the channels a run has open.
//!
//! Every stream registers its channel while the channel is open. The
//! returned [`ChannelGuard`] deregisters on drop, so a stream that ends for
//! any reason leaves nothing behind. Abort closes everything at once.

use crate::status::Step;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Channels {
    next_id: u64,
    open: HashMap<u64, (Step, CancellationToken)>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<Mutex<Channels>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a channel of `step`. Its token is a child of `parent`.
    pub fn register(
        &self,
        step: Step,
        parent: &CancellationToken,
    ) -> ChannelGuard {
        let token = parent.child_token();
        let mut channels = self.lock();
        let id = channels.next_id;
        channels.next_id += 1;
        channels.open.insert(id, (step, token.clone()));

        ChannelGuard { id, token, registry: self.clone() }
    }

    pub fn len(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().open.is_empty()
    }

    /// Cancel every registered channel and empty the registry.
    ///
    /// Returns how many channels were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.lock().open.drain().collect();
        for (id, (step, token)) in &drained {
            debug!("Closing {} channel {}", step, id);
            token.cancel();
        }

        drained.len()
    }
}

/// Registration of one open channel.
#[derive(Debug)]
pub struct ChannelGuard {
    id: u64,
    token: CancellationToken,
    registry: ChannelRegistry,
}

impl ChannelGuard {
    /// Cancelled when the channel must be released.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.registry.lock().open.remove(&self.id);
    }
}
