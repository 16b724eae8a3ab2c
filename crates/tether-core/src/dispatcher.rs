//! Synchronous, priority-ordered publish/subscribe for one owning thread.
//!
//! [`EventDispatcher`] keeps one callback list per event kind. Lists are kept
//! sorted by [`Priority`] at insertion time, so [`post`](EventDispatcher::post)
//! is a straight walk. Callbacks receive a mutable context `C` alongside the
//! event; the enclosing actor stores its state there, which lets a callback
//! send messages or request links while the dispatcher is borrowed.
//!
//! The dispatcher is not `Sync`. Every call must happen on the thread that
//! owns the enclosing actor.

use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;

use crate::error::NotSubscribedError;
use crate::event::Dispatch;

/// Inline capacity of the deferred-event queue before it spills to the heap.
const QUEUE_INLINE: usize = 8;

/// Ordering key for subscribers. Higher values run first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Runs after everything else.
    pub const LOWEST: Priority = Priority(-200);
    /// Runs after normal subscribers.
    pub const LOW: Priority = Priority(-100);
    /// Default tier.
    pub const NORMAL: Priority = Priority(0);
    /// Runs before normal subscribers.
    pub const HIGH: Priority = Priority(100);
    /// Runs before everything else.
    pub const HIGHEST: Priority = Priority(200);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Handle returned by [`subscribe`](EventDispatcher::subscribe).
///
/// Stands in for callback identity: closures cannot be compared, so the
/// handle is what `unsubscribe` matches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Boxed subscriber callback.
pub type Callback<E, C> = Box<dyn FnMut(&mut C, &E) + Send>;

struct CallbackEntry<E, C> {
    id: SubscriptionId,
    priority: Priority,
    callback: Callback<E, C>,
}

/// Per-kind, priority-ordered callback lists plus a deferred-event queue.
pub struct EventDispatcher<E: Dispatch, C> {
    lists: HashMap<E::Kind, Vec<CallbackEntry<E, C>>>,
    queue: SmallVec<[E; QUEUE_INLINE]>,
    next_id: u64,
}

impl<E: Dispatch, C> Default for EventDispatcher<E, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Dispatch, C> EventDispatcher<E, C> {
    /// An empty dispatcher.
    pub fn new() -> Self {
        Self {
            lists: HashMap::new(),
            queue: SmallVec::new(),
            next_id: 0,
        }
    }

    /// Subscribe `callback` to events of `kind`.
    ///
    /// The entry goes immediately before the first existing entry of
    /// strictly lower priority: equal priorities keep insertion order.
    pub fn subscribe<F>(
        &mut self,
        kind: E::Kind,
        priority: Priority,
        callback: F,
    ) -> SubscriptionId
    where
        F: FnMut(&mut C, &E) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let list = self.lists.entry(kind).or_default();
        let pos = list
            .iter()
            .position(|other| other.priority < priority)
            .unwrap_or(list.len());
        list.insert(
            pos,
            CallbackEntry {
                id,
                priority,
                callback: Box::new(callback),
            },
        );
        id
    }

    /// Remove the subscription `id` from the `kind` list.
    pub fn unsubscribe(
        &mut self,
        kind: E::Kind,
        id: SubscriptionId,
    ) -> Result<(), NotSubscribedError> {
        let list = self.lists.get_mut(&kind).ok_or(NotSubscribedError)?;
        let pos = list
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(NotSubscribedError)?;
        list.remove(pos);
        if list.is_empty() {
            self.lists.remove(&kind);
        }
        Ok(())
    }

    /// Invoke every subscriber of `event.kind()` in priority order.
    ///
    /// A panicking callback aborts dispatch for the remaining subscribers.
    pub fn post(&mut self, ctx: &mut C, event: &E) {
        if let Some(list) = self.lists.get_mut(&event.kind()) {
            for entry in list.iter_mut() {
                (entry.callback)(ctx, event);
            }
        }
    }

    /// Store `event` for a later [`process_queue`](Self::process_queue).
    pub fn post_queued(&mut self, event: E) {
        self.queue.push(event);
    }

    /// Dispatch every queued event in insertion order, leaving the queue empty.
    pub fn process_queue(&mut self, ctx: &mut C) {
        if self.queue.is_empty() {
            return;
        }
        let queued = std::mem::take(&mut self.queue);
        for event in &queued {
            self.post(ctx, event);
        }
    }

    /// Number of deferred events waiting.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of subscribers for `kind`.
    pub fn subscriber_count(&self, kind: E::Kind) -> usize {
        self.lists.get(&kind).map_or(0, Vec::len)
    }

    /// Whether no subscriptions exist at all.
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Release spare capacity in every list and the queue.
    pub fn shrink_to_fit(&mut self) {
        for list in self.lists.values_mut() {
            list.shrink_to_fit();
        }
        self.lists.shrink_to_fit();
        self.queue.shrink_to_fit();
    }
}

impl<E: Dispatch, C> Drop for EventDispatcher<E, C> {
    fn drop(&mut self) {
        for (kind, list) in &self.lists {
            log::debug!(
                "dispatcher dropped with {} subscriber(s) on {:?}",
                list.len(),
                kind
            );
        }
    }
}
