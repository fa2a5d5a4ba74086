//! Event bus shared by the Burrow server and client.
//!
//! A bus holds two ordered subscriber tables per event name: persistent
//! entries registered with [`EventBus::on`] and one-shot entries registered
//! with [`EventBus::once`]. Dispatch runs persistent subscribers first, then
//! one-shots; one-shot entries are removed from the table *before* any of
//! them is invoked, so a handler re-subscribing from inside dispatch cannot
//! fire twice for the same emission.
//!
//! Listener failures never propagate to the emitter: they are logged and
//! reported on the internal [`HANDLER_ERROR_EVENT`] meta-channel.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use burrow_protocol::HubError;
use serde_json::{json, Value};

/// Handle returned by [`EventBus::on`] / [`EventBus::once`], usable with
/// [`EventBus::off`] to remove a single subscription.
pub type SubscriptionId = u64;

/// A subscriber callback. Receives the event payload and, for events that
/// originated from a client, the originating client name.
pub type Listener = Arc<dyn Fn(&Value, Option<&str>) -> Result<(), HubError> + Send + Sync>;

/// Meta-event fired when a subscriber returns an error. The payload carries
/// `eventName` and `error`.
pub const HANDLER_ERROR_EVENT: &str = "handlerError";

/// Soft subscriber limit per event name before warnings are logged.
const DEFAULT_MAX_LISTENERS: usize = 10;

struct BusState {
    persistent: HashMap<String, Vec<(SubscriptionId, Listener)>>,
    once: HashMap<String, Vec<(SubscriptionId, Listener)>>,
    next_id: SubscriptionId,
    max_listeners: usize,
}

impl BusState {
    fn listener_count(&self, event: &str) -> usize {
        self.persistent.get(event).map_or(0, Vec::len)
            + self.once.get(event).map_or(0, Vec::len)
    }
}

/// Subscriber registry with persistent and one-shot entries.
///
/// Cheap to clone; clones share the same subscriber tables.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<RwLock<BusState>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState {
                persistent: HashMap::new(),
                once: HashMap::new(),
                next_id: 1,
                max_listeners: DEFAULT_MAX_LISTENERS,
            })),
        }
    }

    /// Registers a persistent subscriber for `event`.
    pub fn on(&self, event: &str, listener: Listener) -> SubscriptionId {
        self.subscribe(event, listener, false)
    }

    /// Registers a subscriber that fires on the first matching event and
    /// never again.
    pub fn once(&self, event: &str, listener: Listener) -> SubscriptionId {
        self.subscribe(event, listener, true)
    }

    fn subscribe(&self, event: &str, listener: Listener, one_shot: bool) -> SubscriptionId {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;
        let max = state.max_listeners;
        let table = if one_shot {
            &mut state.once
        } else {
            &mut state.persistent
        };
        table
            .entry(event.to_string())
            .or_default()
            .push((id, listener));

        let count = state.listener_count(event);
        if count > max {
            log::warn!("Event '{event}' has {count} subscribers (soft limit {max})");
        }
        id
    }

    /// Removes one subscription by id, or every subscription for `event`
    /// when `id` is `None`. Returns whether anything was removed.
    pub fn off(&self, event: &str, id: Option<SubscriptionId>) -> bool {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let state = &mut *state;
        match id {
            Some(id) => {
                let mut removed = false;
                for table in [&mut state.persistent, &mut state.once] {
                    if let Some(entries) = table.get_mut(event) {
                        let before = entries.len();
                        entries.retain(|(entry_id, _)| *entry_id != id);
                        removed |= entries.len() != before;
                        if entries.is_empty() {
                            table.remove(event);
                        }
                    }
                }
                removed
            }
            None => {
                let removed_persistent = state.persistent.remove(event).is_some();
                state.once.remove(event).is_some() || removed_persistent
            }
        }
    }

    /// Clears subscriptions for `event`, or the entire bus when `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match event {
            Some(event) => {
                state.persistent.remove(event);
                state.once.remove(event);
            }
            None => {
                state.persistent.clear();
                state.once.clear();
            }
        }
    }

    #[must_use]
    pub fn has_listeners(&self, event: &str) -> bool {
        self.listener_count(event) > 0
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listener_count(event)
    }

    /// Event names with at least one subscriber, in unspecified order.
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = state.persistent.keys().cloned().collect();
        for name in state.once.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Adjusts the soft per-event subscriber limit. Exceeding it logs a
    /// warning but never blocks registration.
    pub fn set_max_listeners(&self, max: usize) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .max_listeners = max;
    }

    /// Dispatches `event` to every subscriber.
    ///
    /// Persistent subscribers run first in insertion order, then one-shots.
    /// A failing subscriber is logged and reported via
    /// [`HANDLER_ERROR_EVENT`]; remaining subscribers still run.
    pub fn emit(&self, event: &str, data: &Value, from: Option<&str>) {
        let (persistent, one_shots) = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let persistent: Vec<Listener> = state
                .persistent
                .get(event)
                .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default();
            // cleared before invocation so re-subscribing mid-dispatch is safe
            let one_shots: Vec<Listener> = state
                .once
                .remove(event)
                .map(|entries| entries.into_iter().map(|(_, l)| l).collect())
                .unwrap_or_default();
            (persistent, one_shots)
        };

        for listener in persistent.iter().chain(one_shots.iter()) {
            if let Err(e) = listener(data, from) {
                log::error!("Subscriber for '{event}' failed: {e:?}");
                if event != HANDLER_ERROR_EVENT {
                    self.emit(
                        HANDLER_ERROR_EVENT,
                        &json!({"eventName": event, "error": e.to_string()}),
                        from,
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field("persistent", &state.persistent.len())
            .field("once", &state.once.len())
            .finish_non_exhaustive()
    }
}
