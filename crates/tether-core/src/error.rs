//! Error types for the Tether actor substrate.
//!
//! Organized by the contract they guard: thread ownership, event
//! subscription, linking, and the simulation lifecycle. Most of these
//! describe programmer misuse of a protocol rather than recoverable runtime
//! states; callers typically `debug_assert!` on them and log in release.

use std::error::Error;
use std::fmt;

use crate::id::{Identity, ThreadToken};

/// Errors from [`ThreadOwnable`](crate::ThreadOwnable) transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipError {
    /// `claim()` on an object that already has an owner.
    AlreadyOwned {
        /// The thread that currently owns the object.
        owner: ThreadToken,
    },
    /// The calling thread is not the current owner.
    NotOwner {
        /// The thread that currently owns the object.
        owner: ThreadToken,
        /// The thread that attempted the transition.
        caller: ThreadToken,
    },
    /// `transfer()` or `release()` on an object nobody owns.
    Unowned,
}

impl fmt::Display for OwnershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyOwned { owner } => write!(f, "object is already owned by {owner}"),
            Self::NotOwner { owner, caller } => {
                write!(f, "{caller} does not own object (owner is {owner})")
            }
            Self::Unowned => write!(f, "object has no owner"),
        }
    }
}

impl Error for OwnershipError {}

/// `unsubscribe()` found no entry with the given subscription id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotSubscribedError;

impl fmt::Display for NotSubscribedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback is not subscribed to this event kind")
    }
}

impl Error for NotSubscribedError {}

/// `post_to_other()` named a target missing from the local link table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotLinkedError {
    /// The target that was not linked.
    pub target: Identity,
}

impl fmt::Display for NotLinkedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target {} is not linked", self.target)
    }
}

impl Error for NotLinkedError {}

/// Errors from `link()` / `unlink()` requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkError {
    /// An actor cannot link to or unlink from itself.
    SelfLink,
    /// The actor is stopping and accepts no new links.
    Stopping,
    /// The target is already in the link table.
    AlreadyLinked {
        /// The peer that was already linked.
        peer: Identity,
    },
    /// The target is not in the link table (unlink only).
    NotLinked {
        /// The peer that was not linked.
        peer: Identity,
    },
    /// The peer's mailbox no longer exists or is closed.
    PeerGone {
        /// The unreachable peer.
        peer: Identity,
    },
    /// No simulation with this identity is registered.
    UnknownPeer {
        /// The identity that failed to resolve.
        peer: Identity,
    },
    /// The calling thread does not own the actor.
    NotOwner,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfLink => write!(f, "cannot link an actor to itself"),
            Self::Stopping => write!(f, "actor is stopping and accepts no new links"),
            Self::AlreadyLinked { peer } => write!(f, "peer {peer} is already linked"),
            Self::NotLinked { peer } => write!(f, "peer {peer} is not linked"),
            Self::PeerGone { peer } => write!(f, "peer {peer} is no longer reachable"),
            Self::UnknownPeer { peer } => write!(f, "no simulation registered as {peer}"),
            Self::NotOwner => write!(f, "calling thread does not own the actor"),
        }
    }
}

impl Error for LinkError {}

/// Errors from starting a simulation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartError {
    /// The simulation is already starting or running.
    AlreadyRunning,
    /// The simulation's state is currently lent to another thread.
    Unavailable,
    /// The worker thread could not be spawned.
    Spawn {
        /// OS error description.
        reason: String,
    },
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "simulation is already starting or running"),
            Self::Unavailable => write!(f, "simulation state is not parked"),
            Self::Spawn { reason } => write!(f, "failed to spawn simulation thread: {reason}"),
        }
    }
}

impl Error for StartError {}

/// Errors from the acquire/release hand-off protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireError {
    /// The simulation is not running on its internal thread.
    NotRunning,
    /// The simulation is draining links and will not be acquired.
    Stopping,
    /// Another (or the same) external thread already acquired it.
    AlreadyAcquired,
    /// The simulation is not owned by its internal thread.
    NotInternallyOwned,
    /// The caller is not the external thread that holds the acquisition.
    NotAcquirer,
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => write!(f, "simulation is not running"),
            Self::Stopping => write!(f, "simulation is stopping"),
            Self::AlreadyAcquired => write!(f, "simulation is already externally acquired"),
            Self::NotInternallyOwned => {
                write!(f, "simulation is not owned by its internal thread")
            }
            Self::NotAcquirer => write!(f, "calling thread did not acquire this simulation"),
        }
    }
}

impl Error for AcquireError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_error_names_both_threads() {
        let a = ThreadToken::from_raw(3).unwrap();
        let b = ThreadToken::from_raw(4).unwrap();
        let msg = OwnershipError::NotOwner {
            owner: a,
            caller: b,
        }
        .to_string();
        assert!(msg.contains("thread#3"));
        assert!(msg.contains("thread#4"));
    }

    #[test]
    fn not_linked_error_names_target() {
        let target = Identity::from_parts(0, 7);
        let msg = NotLinkedError { target }.to_string();
        assert!(msg.contains(&target.to_string()));
    }
}
