//! Channel registry: live channels for one relay endpoint.
//!
//! The [`ChannelRegistry`] maps channel ids to [`LogicalChannel`] handles.
//! Entries remove themselves through a close hook once the channel reaches
//! `Closed`. Recently closed ids are remembered for a while so a duplicated
//! `OPEN` that trails its own close cannot resurrect the channel.

use crate::channel::LogicalChannel;
use crate::message::ChannelId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// How many closed channel ids are remembered.
pub const RECENTLY_CLOSED_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tombstones {
    order: VecDeque<ChannelId>,
    ids: HashSet<ChannelId>,
}

impl Tombstones {
    fn bury(&mut self, id: ChannelId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > RECENTLY_CLOSED_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

/// Concurrent map of live channels.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, LogicalChannel>,
    closed: Mutex<Tombstones>,
}

impl ChannelRegistry {
    /// Create a new empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a channel. Returns `false` (and leaves the registry alone)
    /// when the id is already taken.
    pub fn insert(self: &Arc<Self>, channel: LogicalChannel) -> bool {
        let id = channel.id();
        match self.channels.entry(id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(channel.clone());
            }
        }
        let registry = Arc::downgrade(self);
        channel.on_closed(move |id| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&id);
            }
        });
        true
    }

    /// Look up a channel, cloning the handle out of the map.
    pub fn get(&self, id: &ChannelId) -> Option<LogicalChannel> {
        self.channels.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.contains_key(id)
    }

    /// Drop a channel from the registry and remember its id as closed.
    pub fn remove(&self, id: &ChannelId) -> Option<LogicalChannel> {
        let removed = self.channels.remove(id).map(|(_, channel)| channel);
        self.closed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bury(*id);
        if removed.is_some() {
            debug!(channel = %id, remaining = self.channels.len(), "Channel unregistered");
        }
        removed
    }

    /// Whether `id` belonged to a channel that closed recently.
    pub fn was_closed(&self, id: &ChannelId) -> bool {
        self.closed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ids
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Force every channel closed with a medium break. Close hooks drain the
    /// map; returns how many channels were broken.
    pub fn medium_break_all(&self) -> usize {
        // Collect first: close hooks re-enter the map.
        let channels: Vec<LogicalChannel> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in &channels {
            channel.medium_break();
        }
        channels.len()
    }
}
