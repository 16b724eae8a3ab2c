//! Single-writer ownership token checked against the calling thread.
//!
//! [`ThreadOwnable`] records which thread is currently allowed to mutate an
//! object. It does not lock anything: it exists so that every entry point
//! requiring exclusive access can assert the caller is the owner, and so that
//! other threads can ask who the owner is. The actual exclusivity of actor
//! state is carried by moving the state value itself between threads; the
//! token mirrors that hand-off for queries and assertions.
//!
//! Each transition is a single compare-exchange on one `AtomicU64`, so at most
//! one thread can observe itself as the owner of a claimed token at any
//! instant.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::OwnershipError;
use crate::id::ThreadToken;

/// Raw value meaning "no owner".
const UNOWNED: u64 = 0;

/// An atomic "owner thread" field.
///
/// States: *unowned* (any thread may act, used before start and after stop)
/// and *claimed* by exactly one [`ThreadToken`].
#[derive(Debug, Default)]
pub struct ThreadOwnable {
    owner: AtomicU64,
}

// Compile-time assertion: ThreadOwnable must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<ThreadOwnable>();
};

impl ThreadOwnable {
    /// A fresh, unowned token.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(UNOWNED),
        }
    }

    /// Claim ownership for the calling thread.
    pub fn claim(&self) -> Result<(), OwnershipError> {
        let me = ThreadToken::current();
        self.owner
            .compare_exchange(UNOWNED, me.get(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| match ThreadToken::from_raw(current) {
                Some(owner) => OwnershipError::AlreadyOwned { owner },
                None => OwnershipError::Unowned,
            })
    }

    /// Release ownership held by the calling thread.
    pub fn release(&self) -> Result<(), OwnershipError> {
        self.swap_from_caller(UNOWNED)
    }

    /// Hand ownership from the calling thread to `target`.
    pub fn transfer(&self, target: ThreadToken) -> Result<(), OwnershipError> {
        self.swap_from_caller(target.get())
    }

    fn swap_from_caller(&self, next: u64) -> Result<(), OwnershipError> {
        let me = ThreadToken::current();
        self.owner
            .compare_exchange(me.get(), next, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| match ThreadToken::from_raw(current) {
                Some(owner) => OwnershipError::NotOwner { owner, caller: me },
                None => OwnershipError::Unowned,
            })
    }

    /// Whether some thread currently holds the token.
    pub fn is_owned(&self) -> bool {
        self.owner.load(Ordering::Acquire) != UNOWNED
    }

    /// Whether the calling thread may act on the object.
    ///
    /// True when claimed by the caller, and also when unowned.
    pub fn owned_by_caller(&self) -> bool {
        match self.owner() {
            Some(owner) => owner == ThreadToken::current(),
            None => true,
        }
    }

    /// The current owner, if any.
    pub fn owner(&self) -> Option<ThreadToken> {
        ThreadToken::from_raw(self.owner.load(Ordering::Acquire))
    }
}
