//! Tether: thread-owned actors with symmetric links and fixed-rate
//! simulation loops.
//!
//! This is the facade crate that re-exports the public API of the Tether
//! sub-crates. For most users, adding `tether` as a single dependency is
//! sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use tether::prelude::*;
//!
//! #[derive(Debug)]
//! enum Chat {
//!     Say(String),
//! }
//!
//! #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
//! enum ChatKind {
//!     Say,
//! }
//!
//! impl Payload for Chat {
//!     type Kind = ChatKind;
//!     fn kind(&self) -> ChatKind {
//!         match self {
//!             Chat::Say(_) => ChatKind::Say,
//!         }
//!     }
//! }
//!
//! let mut alice: ThreadMessager<Chat, Vec<String>> = ThreadMessager::new(Vec::new());
//! let mut bob: ThreadMessager<Chat, Vec<String>> = ThreadMessager::new(Vec::new());
//!
//! bob.subscribe(EventKind::Message(ChatKind::Say), Priority::NORMAL, |ctx, ev| {
//!     if let Event::Message(m) = ev {
//!         let Chat::Say(text) = m.payload();
//!         ctx.world_mut().push(text.clone());
//!     }
//! });
//!
//! // Two-phase handshake: bob confirms, then alice records the link.
//! alice.link(&bob.peer_ref()).unwrap();
//! bob.process_incoming();
//! alice.process_incoming();
//! assert!(alice.is_linked(bob.identity()));
//! assert!(bob.is_linked(alice.identity()));
//!
//! alice.post_to_other(bob.identity(), Chat::Say("hello".into())).unwrap();
//! alice.process_outgoing();
//! bob.process_incoming();
//! assert_eq!(bob.world(), &["hello".to_string()]);
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `tether-core` | Identities, ownership tokens, events, dispatch, errors |
//! | [`engine`] | `tether-engine` | Actors, simulations, hand-off and the server |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Identities, ownership tokens, events and dispatch (`tether-core`).
///
/// The [`types::Payload`] trait is the main extension point: implement it
/// for the message enum your simulations exchange.
pub use tether_core as types;

/// Actors, tick-loop simulations and the registry (`tether-engine`).
///
/// [`engine::ThreadMessager`] for same-thread actors,
/// [`engine::SimulationMessager`] for a dedicated tick thread, and
/// [`engine::SimulationServer`] for managing many of them by identity.
pub use tether_engine as engine;

/// Common imports for typical Tether usage.
///
/// ```rust
/// use tether::prelude::*;
/// ```
pub mod prelude {
    // Core types and traits
    pub use tether_core::{
        Event, EventKind, Identity, Message, Payload, Priority, SubscriptionId, ThreadToken,
    };

    // Errors
    pub use tether_core::{AcquireError, LinkError, NotLinkedError, StartError};

    // Engine
    pub use tether_engine::{
        AcquiredSimulation, ConfigError, MessagerContext, Query, ServerConfig, SimulationConfig,
        SimulationMessager, SimulationServer, ThreadMessager, ThreadMode,
    };
}
