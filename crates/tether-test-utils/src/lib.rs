//! Test payloads and helpers for Tether development.
//!
//! Provides a ready-made [`TestMessage`] family, [`init_logging`] for
//! `RUST_LOG`-controlled output under `cargo test`, and [`pump`] for
//! driving same-thread actors to quiescence without a tick loop.
//! Reusable builders that record what an actor sees live in [`fixtures`].

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

pub use fixtures::{echo_builder, record_into, recording_builder, Record, Recorder};

use tether_core::Payload;
use tether_engine::{SimulationConfig, ThreadMessager};

/// Message family used across the workspace's tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestMessage {
    Text(String),
    Number(u64),
    Ping,
    Pong,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TestKind {
    Text,
    Number,
    Ping,
    Pong,
}

impl Payload for TestMessage {
    type Kind = TestKind;

    fn kind(&self) -> TestKind {
        match self {
            Self::Text(_) => TestKind::Text,
            Self::Number(_) => TestKind::Number,
            Self::Ping => TestKind::Ping,
            Self::Pong => TestKind::Pong,
        }
    }
}

/// Actor type most tests use.
pub type TestActor = ThreadMessager<TestMessage, ()>;

/// Install `env_logger` for the test binary. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Simulation config that ticks as fast as possible.
pub fn fast_config() -> SimulationConfig {
    SimulationConfig::unthrottled()
}

/// Run `rounds` of incoming-then-outgoing processing over `actors`.
///
/// All actors must be owned by (or unowned and used from) the calling thread.
pub fn pump<W>(actors: &mut [&mut ThreadMessager<TestMessage, W>], rounds: usize) {
    for _ in 0..rounds {
        for actor in actors.iter_mut() {
            actor.process_incoming();
        }
        for actor in actors.iter_mut() {
            actor.process_outgoing();
        }
    }
}

/// Pump until every mailbox is empty after a round, or `max_rounds` pass.
/// Returns the number of rounds run.
pub fn pump_until_quiet<W>(
    actors: &mut [&mut ThreadMessager<TestMessage, W>],
    max_rounds: usize,
) -> usize {
    for round in 1..=max_rounds {
        pump(actors, 1);
        if actors.iter().all(|a| a.inbox().is_empty()) {
            return round;
        }
    }
    log::warn!("actors still busy after {max_rounds} rounds");
    max_rounds
}
