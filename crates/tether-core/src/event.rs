//! Events, messages, and the payload contract.
//!
//! An [`Event`] is a same-thread notification raised by an actor to its own
//! subscribers. A [`Message`] is the one kind of event that may cross
//! threads: it is reference-counted, immutable after construction, and
//! carries the sender's [`Identity`]. User code supplies the message family
//! as a closed enum implementing [`Payload`]; dispatch matches on
//! [`EventKind`], so subscribing "by kind" is an exhaustive match rather than
//! a runtime type comparison.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::id::Identity;

/// A user-defined message family.
///
/// Implemented by a closed enum whose variants are the message kinds a
/// simulation understands. `Kind` is its field-less discriminant, used as
/// the subscription key.
pub trait Payload: Send + Sync + 'static {
    /// Field-less discriminant of the payload.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// The kind of this payload value.
    fn kind(&self) -> Self::Kind;
}

/// Anything the [`EventDispatcher`](crate::EventDispatcher) can route.
pub trait Dispatch {
    /// Subscription key.
    type Kind: Copy + Eq + Hash + fmt::Debug;

    /// The key under which this event is dispatched.
    fn kind(&self) -> Self::Kind;
}

struct MessageInner<M> {
    sender: Identity,
    payload: M,
}

/// A shared, immutable message.
///
/// Cloning bumps a reference count, so one message may sit in several
/// outgoing queues at once (fan-out); it lives as long as its longest holder.
pub struct Message<M> {
    inner: Arc<MessageInner<M>>,
}

impl<M> Message<M> {
    /// Wrap a payload sent by `sender`.
    pub fn new(sender: Identity, payload: M) -> Self {
        Self {
            inner: Arc::new(MessageInner { sender, payload }),
        }
    }

    /// The identity that sent this message.
    pub fn sender(&self) -> Identity {
        self.inner.sender
    }

    /// The payload.
    pub fn payload(&self) -> &M {
        &self.inner.payload
    }

    /// Number of live handles to this message (diagnostics).
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<M: Payload> Message<M> {
    /// Kind of the payload.
    pub fn kind(&self) -> M::Kind {
        self.inner.payload.kind()
    }
}

impl<M> Clone for Message<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for Message<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("sender", &self.inner.sender)
            .field("payload", &self.inner.payload)
            .finish()
    }
}

/// Same-thread notifications raised by an actor.
pub enum Event<M> {
    /// Raised once per tick between incoming and outgoing processing.
    Tick {
        /// When this tick began.
        tick_start: Instant,
        /// Time since the previous tick began.
        timestep: Duration,
    },
    /// The simulation loop started on its owning thread.
    SimulationStart,
    /// The simulation loop is about to exit.
    SimulationStop,
    /// A peer was added to the local link table.
    PeerLinked(Identity),
    /// A peer was removed from the local link table.
    PeerUnlinked(Identity),
    /// The actor finished draining links while stopping.
    MessagerStopped,
    /// A stop was requested through the mailbox.
    StopRequested,
    /// An external thread asked to take over ticking.
    AcquireRequested,
    /// Subscribers should release long-unused memory.
    AttemptFreeMemory,
    /// A message delivered from a peer or an unattested sender.
    Message(Message<M>),
}

impl<M> Clone for Event<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Tick {
                tick_start,
                timestep,
            } => Self::Tick {
                tick_start: *tick_start,
                timestep: *timestep,
            },
            Self::SimulationStart => Self::SimulationStart,
            Self::SimulationStop => Self::SimulationStop,
            Self::PeerLinked(id) => Self::PeerLinked(*id),
            Self::PeerUnlinked(id) => Self::PeerUnlinked(*id),
            Self::MessagerStopped => Self::MessagerStopped,
            Self::StopRequested => Self::StopRequested,
            Self::AcquireRequested => Self::AcquireRequested,
            Self::AttemptFreeMemory => Self::AttemptFreeMemory,
            Self::Message(m) => Self::Message(m.clone()),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for Event<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tick {
                tick_start,
                timestep,
            } => f
                .debug_struct("Tick")
                .field("tick_start", tick_start)
                .field("timestep", timestep)
                .finish(),
            Self::SimulationStart => write!(f, "SimulationStart"),
            Self::SimulationStop => write!(f, "SimulationStop"),
            Self::PeerLinked(id) => f.debug_tuple("PeerLinked").field(id).finish(),
            Self::PeerUnlinked(id) => f.debug_tuple("PeerUnlinked").field(id).finish(),
            Self::MessagerStopped => write!(f, "MessagerStopped"),
            Self::StopRequested => write!(f, "StopRequested"),
            Self::AcquireRequested => write!(f, "AcquireRequested"),
            Self::AttemptFreeMemory => write!(f, "AttemptFreeMemory"),
            Self::Message(m) => f.debug_tuple("Message").field(m).finish(),
        }
    }
}

/// Field-less discriminant of [`Event`]. `Message` carries the payload kind
/// so that subscribers can listen to a single message kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind<K> {
    /// [`Event::Tick`].
    Tick,
    /// [`Event::SimulationStart`].
    SimulationStart,
    /// [`Event::SimulationStop`].
    SimulationStop,
    /// [`Event::PeerLinked`].
    PeerLinked,
    /// [`Event::PeerUnlinked`].
    PeerUnlinked,
    /// [`Event::MessagerStopped`].
    MessagerStopped,
    /// [`Event::StopRequested`].
    StopRequested,
    /// [`Event::AcquireRequested`].
    AcquireRequested,
    /// [`Event::AttemptFreeMemory`].
    AttemptFreeMemory,
    /// [`Event::Message`] with a payload of this kind.
    Message(K),
}

impl<M: Payload> Dispatch for Event<M> {
    type Kind = EventKind<M::Kind>;

    fn kind(&self) -> Self::Kind {
        match self {
            Self::Tick { .. } => EventKind::Tick,
            Self::SimulationStart => EventKind::SimulationStart,
            Self::SimulationStop => EventKind::SimulationStop,
            Self::PeerLinked(_) => EventKind::PeerLinked,
            Self::PeerUnlinked(_) => EventKind::PeerUnlinked,
            Self::MessagerStopped => EventKind::MessagerStopped,
            Self::StopRequested => EventKind::StopRequested,
            Self::AcquireRequested => EventKind::AcquireRequested,
            Self::AttemptFreeMemory => EventKind::AttemptFreeMemory,
            Self::Message(m) => EventKind::Message(m.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Chat {
        Say(String),
        Ping,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum ChatKind {
        Say,
        Ping,
    }

    impl Payload for Chat {
        type Kind = ChatKind;
        fn kind(&self) -> ChatKind {
            match self {
                Chat::Say(_) => ChatKind::Say,
                Chat::Ping => ChatKind::Ping,
            }
        }
    }

    #[test]
    fn message_clone_shares_payload() {
        let sender = Identity::from_parts(1, 2);
        let a = Message::new(sender, Chat::Say("hi".into()));
        let b = a.clone();
        assert_eq!(a.holders(), 2);
        assert!(std::ptr::eq(a.payload(), b.payload()));
        assert_eq!(b.sender(), sender);
        drop(a);
        assert_eq!(b.holders(), 1);
    }

    #[test]
    fn message_event_kind_carries_payload_kind() {
        let ev = Event::Message(Message::new(Identity::EMPTY, Chat::Ping));
        assert_eq!(ev.kind(), EventKind::Message(ChatKind::Ping));
        let ev: Event<Chat> = Event::PeerLinked(Identity::from_parts(0, 1));
        assert_eq!(ev.kind(), EventKind::PeerLinked);
    }

    #[test]
    fn event_clone_preserves_variant() {
        let ev: Event<Chat> = Event::Tick {
            tick_start: Instant::now(),
            timestep: Duration::from_millis(16),
        };
        assert_eq!(ev.clone().kind(), EventKind::Tick);
    }
}
