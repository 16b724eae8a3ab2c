//! Per-actor mailbox: the only structure in Tether with genuine
//! multi-writer access.
//!
//! Any thread may append a [`ThreadMessage`] to an [`Inbox`] under its
//! lock. The owning actor swaps the whole queue out once per tick, so the
//! lock is held for one `Vec` swap on the read side and one append on the
//! write side.
//!
//! A closed inbox (before the first start, or after `messager_stop`)
//! refuses posts and reports it to the sender, which resolves any pending
//! handshake locally instead of waiting for a reply that cannot come.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tether_core::{Identity, Message, ThreadOwnable};

// ── Envelopes ─────────────────────────────────────────────────────

/// Lifecycle requests posted into an actor's own mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Control {
    /// Begin the stop drain on the owning thread.
    RequestStop,
    /// An external thread asked to take over ticking.
    AcquireRequested,
    /// Shrink queues and notify subscribers to release memory.
    AttemptFreeMemory,
}

/// One envelope in a mailbox.
///
/// Handshake variants carry the sender as a [`PeerRef`] so the receiver
/// can reply without consulting any registry.
pub enum ThreadMessage<M> {
    /// "Link to me." First leg of the link handshake.
    RequestLink(PeerRef<M>),
    /// "I linked you." Second leg of the link handshake.
    ConfirmLink(PeerRef<M>),
    /// "Unlink me." First leg of the unlink handshake.
    RequestUnlink(PeerRef<M>),
    /// "I unlinked you." Second leg of the unlink handshake.
    ConfirmUnlink(PeerRef<M>),
    /// A user message.
    Deliver(Message<M>),
    /// A lifecycle request.
    Control(Control),
}

impl<M> ThreadMessage<M> {
    /// Whether this is one of the four handshake envelopes.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::RequestLink(_)
                | Self::ConfirmLink(_)
                | Self::RequestUnlink(_)
                | Self::ConfirmUnlink(_)
        )
    }
}

impl<M: fmt::Debug> fmt::Debug for ThreadMessage<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestLink(p) => f.debug_tuple("RequestLink").field(&p.id).finish(),
            Self::ConfirmLink(p) => f.debug_tuple("ConfirmLink").field(&p.id).finish(),
            Self::RequestUnlink(p) => f.debug_tuple("RequestUnlink").field(&p.id).finish(),
            Self::ConfirmUnlink(p) => f.debug_tuple("ConfirmUnlink").field(&p.id).finish(),
            Self::Deliver(m) => f.debug_tuple("Deliver").field(m).finish(),
            Self::Control(c) => f.debug_tuple("Control").field(c).finish(),
        }
    }
}

// ── PeerRef ───────────────────────────────────────────────────────

/// A generation-checked reference to another actor's mailbox.
///
/// Holds only a [`Weak`] pointer: once the peer's inbox is freed,
/// [`resolve`](Self::resolve) fails and the reference cannot dangle.
pub struct PeerRef<M> {
    id: Identity,
    inbox: Weak<Inbox<M>>,
}

impl<M> PeerRef<M> {
    /// Identity of the referenced actor.
    pub fn id(&self) -> Identity {
        self.id
    }

    /// Upgrade to the live inbox, if it still exists.
    pub fn resolve(&self) -> Option<Arc<Inbox<M>>> {
        self.inbox.upgrade()
    }

    /// Whether the referenced inbox still exists.
    pub fn is_alive(&self) -> bool {
        self.inbox.strong_count() > 0
    }

    /// Whether both references name the same inbox allocation.
    pub fn same_inbox(&self, other: &PeerRef<M>) -> bool {
        Weak::ptr_eq(&self.inbox, &other.inbox)
    }
}

impl<M> Clone for PeerRef<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inbox: Weak::clone(&self.inbox),
        }
    }
}

impl<M> fmt::Debug for PeerRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRef")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ── Inbox ─────────────────────────────────────────────────────────

struct InboxState<M> {
    queue: Vec<ThreadMessage<M>>,
    open: bool,
}

/// Many-writer, one-reader mailbox of one actor.
///
/// Also carries the actor's [`ThreadOwnable`] token and its `stopping`
/// flag, so other threads can query both without touching actor state.
pub struct Inbox<M> {
    id: Identity,
    state: Mutex<InboxState<M>>,
    stopping: AtomicBool,
    owner: ThreadOwnable,
}

// Compile-time assertion: Inbox must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Inbox<u32>>();
};

impl<M> Inbox<M> {
    /// A new, open, empty inbox for actor `id`.
    pub fn new(id: Identity) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(InboxState {
                queue: Vec::new(),
                open: true,
            }),
            stopping: AtomicBool::new(false),
            owner: ThreadOwnable::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, InboxState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identity of the owning actor.
    pub fn id(&self) -> Identity {
        self.id
    }

    /// A weak reply address for this inbox.
    pub fn peer_ref(self: &Arc<Self>) -> PeerRef<M> {
        PeerRef {
            id: self.id,
            inbox: Arc::downgrade(self),
        }
    }

    /// Append a message from a sender that holds no link. Any thread.
    ///
    /// Returns `false` if the inbox is closed.
    pub fn post_unattested(&self, message: Message<M>) -> bool {
        self.push(ThreadMessage::Deliver(message)).is_ok()
    }

    /// Append a batch of unlinked messages under a single lock.
    pub fn post_many_unattested<I>(&self, messages: I) -> bool
    where
        I: IntoIterator<Item = Message<M>>,
    {
        let mut state = self.state();
        if !state.open {
            return false;
        }
        state
            .queue
            .extend(messages.into_iter().map(ThreadMessage::Deliver));
        true
    }

    /// Append a lifecycle request.
    pub fn post_control(&self, control: Control) -> bool {
        self.push(ThreadMessage::Control(control)).is_ok()
    }

    /// Append one envelope from a peer. On a closed inbox the envelope is
    /// handed back so the sender can resolve it locally.
    pub fn post_from_other(&self, message: ThreadMessage<M>) -> Result<(), ThreadMessage<M>> {
        self.push(message)
    }

    /// Move every envelope in `batch` into this inbox, leaving `batch`
    /// empty with its capacity intact. On a closed inbox `batch` is left
    /// untouched and `false` is returned.
    pub fn post_batch_from_other(&self, batch: &mut Vec<ThreadMessage<M>>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let mut state = self.state();
        if !state.open {
            return false;
        }
        state.queue.append(batch);
        true
    }

    fn push(&self, message: ThreadMessage<M>) -> Result<(), ThreadMessage<M>> {
        let mut state = self.state();
        if !state.open {
            return Err(message);
        }
        state.queue.push(message);
        Ok(())
    }

    /// Swap the queue with `into`, which must be empty. Owner only.
    pub(crate) fn take_all(&self, into: &mut Vec<ThreadMessage<M>>) {
        debug_assert!(into.is_empty(), "take_all target must be empty");
        let mut state = self.state();
        std::mem::swap(&mut state.queue, into);
    }

    /// Accept posts again.
    pub(crate) fn open(&self) {
        self.state().open = true;
    }

    /// Refuse further posts and return whatever was still queued.
    pub(crate) fn close(&self) -> Vec<ThreadMessage<M>> {
        let mut state = self.state();
        state.open = false;
        std::mem::take(&mut state.queue)
    }

    /// Whether the inbox currently accepts posts.
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the owning actor is draining its links.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn set_stopping(&self, stopping: bool) {
        self.stopping.store(stopping, Ordering::Release);
    }

    /// The owning actor's thread token.
    pub fn owner(&self) -> &ThreadOwnable {
        &self.owner
    }

    /// Release spare queue capacity.
    pub(crate) fn shrink_to_fit(&self) {
        self.state().queue.shrink_to_fit();
    }
}

impl<M> fmt::Debug for Inbox<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Inbox")
            .field("id", &self.id)
            .field("queued", &state.queue.len())
            .field("open", &state.open)
            .field("stopping", &self.is_stopping())
            .field("owner", &self.owner.owner())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn msg(n: u32) -> Message<u32> {
        Message::new(Identity::from_parts(0, 1), n)
    }

    fn drain(inbox: &Inbox<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        inbox.take_all(&mut out);
        out.into_iter()
            .filter_map(|m| match m {
                ThreadMessage::Deliver(m) => Some(*m.payload()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn posts_are_fifo_and_swap_clears() {
        let inbox = Inbox::new(Identity::from_parts(0, 9));
        for n in 0..5 {
            assert!(inbox.post_unattested(msg(n)));
        }
        assert_eq!(inbox.len(), 5);
        assert_eq!(drain(&inbox), vec![0, 1, 2, 3, 4]);
        assert!(inbox.is_empty());
    }

    #[test]
    fn closed_inbox_refuses_and_returns_envelope() {
        let inbox = Inbox::new(Identity::from_parts(0, 9));
        inbox.post_unattested(msg(1));
        let leftovers = inbox.close();
        assert_eq!(leftovers.len(), 1);
        assert!(!inbox.post_unattested(msg(2)));
        assert!(!inbox.post_control(Control::RequestStop));

        let other = Inbox::<u32>::new(Identity::from_parts(0, 10));
        let back = inbox
            .post_from_other(ThreadMessage::RequestLink(other.peer_ref()))
            .unwrap_err();
        assert!(back.is_handshake());

        inbox.open();
        assert!(inbox.post_unattested(msg(3)));
        assert_eq!(drain(&inbox), vec![3]);
    }

    #[test]
    fn batch_post_keeps_sender_capacity() {
        let inbox = Inbox::new(Identity::from_parts(0, 9));
        let mut batch: Vec<ThreadMessage<u32>> = Vec::with_capacity(16);
        batch.extend((0..4).map(|n| ThreadMessage::Deliver(msg(n))));
        assert!(inbox.post_batch_from_other(&mut batch));
        assert!(batch.is_empty());
        assert!(batch.capacity() >= 16);
        assert_eq!(drain(&inbox), vec![0, 1, 2, 3]);
    }

    #[test]
    fn batch_post_to_closed_inbox_leaves_batch() {
        let inbox = Inbox::new(Identity::from_parts(0, 9));
        inbox.close();
        let mut batch = vec![ThreadMessage::Deliver(msg(7))];
        assert!(!inbox.post_batch_from_other(&mut batch));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn peer_ref_stops_resolving_after_free() {
        let inbox = Inbox::<u32>::new(Identity::from_parts(1, 1));
        let peer = inbox.peer_ref();
        assert!(peer.is_alive());
        assert_eq!(peer.id(), Identity::from_parts(1, 1));
        assert!(peer.resolve().is_some());
        drop(inbox);
        assert!(!peer.is_alive());
        assert!(peer.resolve().is_none());
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let inbox = Inbox::new(Identity::from_parts(0, 9));
        let handles: Vec<_> = (0..4u32)
            .map(|w| {
                let inbox = Arc::clone(&inbox);
                thread::spawn(move || {
                    for n in 0..250 {
                        inbox.post_unattested(msg(w * 1000 + n));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let seen = drain(&inbox);
        assert_eq!(seen.len(), 1000);
        // Per-writer order survives interleaving.
        for w in 0..4u32 {
            let mine: Vec<_> = seen.iter().filter(|n| **n / 1000 == w).collect();
            assert!(mine.windows(2).all(|p| p[0] < p[1]));
        }
    }
}
