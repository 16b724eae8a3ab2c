//! Threaded actors, simulations and the simulation registry.
//!
//! A [`ThreadMessager`] is an actor: an [`EventDispatcher`](tether_core::EventDispatcher)
//! plus a mailbox and a table of symmetric links to peers. A
//! [`SimulationMessager`] drives one actor in a fixed-rate tick loop on its
//! own thread, and can lend it to another thread through
//! [`AcquiredSimulation`]. [`SimulationServer`] owns simulations by
//! identity and reclaims their threads after deletion.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod config;
pub mod handoff;
pub mod mailbox;
pub mod messager;
pub mod server;
pub mod simulation;

pub use config::{ConfigError, ServerConfig, SimulationConfig, ThreadMode};
pub use handoff::AcquiredSimulation;
pub use mailbox::{Control, Inbox, PeerRef, ThreadMessage};
pub use messager::{MessagerContext, PeerDirectory, ThreadMessager};
pub use server::{Query, SimulationServer};
pub use simulation::{Builder, SimulationCore, SimulationMessager};
