//! Strongly-typed identifiers: [`Identity`] for actors and [`ThreadToken`]
//! for the threads that own them.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// A 128-bit identity naming a simulation or message sender.
///
/// Stored as two 64-bit words. Identities are generated once, when the
/// actor is created, and never change afterwards. The all-zero value is
/// reserved as [`Identity::EMPTY`] and is never returned by
/// [`Identity::generate`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    first: u64,
    second: u64,
}

impl Identity {
    /// The reserved empty identity (both words zero).
    pub const EMPTY: Identity = Identity {
        first: 0,
        second: 0,
    };

    /// Build an identity from its two words.
    pub const fn from_parts(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Generate a random, non-empty identity from the thread-local RNG.
    pub fn generate() -> Self {
        loop {
            let id = Self::from_parts(rand::random::<u64>(), rand::random::<u64>());
            if !id.is_empty() {
                return id;
            }
        }
    }

    /// Whether this is [`Identity::EMPTY`].
    pub const fn is_empty(&self) -> bool {
        self.first == 0 && self.second == 0
    }

    /// The high word.
    pub const fn first(&self) -> u64 {
        self.first
    }

    /// The low word.
    pub const fn second(&self) -> u64 {
        self.second
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

impl From<(u64, u64)> for Identity {
    fn from((first, second): (u64, u64)) -> Self {
        Self::from_parts(first, second)
    }
}

/// Counter for [`ThreadToken`] allocation. Starts at 1 so that 0 can
/// mean "no thread" inside atomics.
static THREAD_TOKEN_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TOKEN: ThreadToken = ThreadToken::allocate();
}

/// Process-unique, non-zero name for an OS thread.
///
/// `std::thread::ThreadId` cannot be stored in an atomic, so each thread
/// lazily allocates a token from a monotonic counter the first time it
/// asks for [`ThreadToken::current`]. Tokens are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadToken(NonZeroU64);

impl ThreadToken {
    fn allocate() -> Self {
        let raw = THREAD_TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
        match NonZeroU64::new(raw) {
            Some(n) => Self(n),
            // The counter starts at 1 and would need 2^64 threads to wrap.
            None => unreachable!("thread token counter wrapped"),
        }
    }

    /// The token of the calling thread.
    pub fn current() -> Self {
        CURRENT_TOKEN.with(|t| *t)
    }

    /// Raw value, suitable for storage in an `AtomicU64`.
    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Rebuild a token from a raw value. `0` yields `None`.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }
}

impl fmt::Display for ThreadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_identities_are_non_empty_and_distinct() {
        let ids: HashSet<Identity> = (0..256).map(|_| Identity::generate()).collect();
        assert_eq!(ids.len(), 256);
        assert!(ids.iter().all(|id| !id.is_empty()));
    }

    #[test]
    fn identity_display_is_32_hex_digits() {
        let id = Identity::from_parts(0xab, 0x1);
        assert_eq!(id.to_string(), "00000000000000ab0000000000000001");
    }

    #[test]
    fn empty_identity_is_default() {
        assert_eq!(Identity::default(), Identity::EMPTY);
        assert!(Identity::EMPTY.is_empty());
    }

    #[test]
    fn thread_tokens_differ_between_threads() {
        let here = ThreadToken::current();
        let there = std::thread::spawn(ThreadToken::current).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(here, ThreadToken::current());
    }

    #[test]
    fn thread_token_raw_round_trip() {
        let t = ThreadToken::current();
        assert_eq!(ThreadToken::from_raw(t.get()), Some(t));
        assert_eq!(ThreadToken::from_raw(0), None);
    }
}
