//! Reusable builders and a thread-safe event recorder.
//!
//! - [`Recorder`] collects [`Record`]s from any thread and lets the test
//!   thread wait for a condition.
//! - [`recording_builder`] subscribes an actor's lifecycle, link and
//!   message events into a recorder.
//! - [`echo_builder`] answers every `Ping` with a `Pong` to the sender.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tether_core::{Event, EventKind, Identity, Priority};
use tether_engine::ThreadMessager;

use crate::{TestKind, TestMessage};

/// One observation made by a recording actor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Started(Identity),
    Stopped(Identity),
    Linked { at: Identity, peer: Identity },
    Unlinked { at: Identity, peer: Identity },
    Received { at: Identity, from: Identity, message: TestMessage },
}

/// Shared, append-only log of [`Record`]s.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<Record>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: Record) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Vec<Record> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, record: &Record) -> bool {
        self.snapshot().contains(record)
    }

    /// Index of the first entry equal to `record`.
    pub fn position(&self, record: &Record) -> Option<usize> {
        self.snapshot().iter().position(|r| r == record)
    }

    /// Messages received by `at`, in arrival order.
    pub fn received_by(&self, at: Identity) -> Vec<(Identity, TestMessage)> {
        self.snapshot()
            .into_iter()
            .filter_map(|r| match r {
                Record::Received { at: a, from, message } if a == at => Some((from, message)),
                _ => None,
            })
            .collect()
    }

    /// Poll until `pred` holds over the entries or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&[Record]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.snapshot()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Subscribe `actor` so that its start, stop, link, unlink and message
/// events are pushed into `recorder`.
pub fn record_into<W>(actor: &mut ThreadMessager<TestMessage, W>, recorder: &Recorder) {
    let at = actor.identity();

    let r = recorder.clone();
    actor.subscribe(EventKind::SimulationStart, Priority::NORMAL, move |_, _| {
        r.push(Record::Started(at));
    });
    let r = recorder.clone();
    actor.subscribe(EventKind::SimulationStop, Priority::NORMAL, move |_, _| {
        r.push(Record::Stopped(at));
    });
    let r = recorder.clone();
    actor.subscribe(EventKind::PeerLinked, Priority::NORMAL, move |_, ev| {
        if let Event::PeerLinked(peer) = ev {
            r.push(Record::Linked { at, peer: *peer });
        }
    });
    let r = recorder.clone();
    actor.subscribe(EventKind::PeerUnlinked, Priority::NORMAL, move |_, ev| {
        if let Event::PeerUnlinked(peer) = ev {
            r.push(Record::Unlinked { at, peer: *peer });
        }
    });
    for kind in [TestKind::Text, TestKind::Number, TestKind::Ping, TestKind::Pong] {
        let r = recorder.clone();
        actor.subscribe(EventKind::Message(kind), Priority::NORMAL, move |_, ev| {
            if let Event::Message(m) = ev {
                r.push(Record::Received {
                    at,
                    from: m.sender(),
                    message: m.payload().clone(),
                });
            }
        });
    }
}

/// Builder closure for a simulation that records into `recorder`.
pub fn recording_builder<W: 'static>(
    recorder: &Recorder,
) -> impl FnOnce(&mut ThreadMessager<TestMessage, W>) + Send + 'static {
    let recorder = recorder.clone();
    move |actor| record_into(actor, &recorder)
}

/// Builder closure for a simulation that answers `Ping` with `Pong`.
pub fn echo_builder<W: 'static>() -> impl FnOnce(&mut ThreadMessager<TestMessage, W>) + Send + 'static {
    |actor| {
        actor.subscribe(
            EventKind::Message(TestKind::Ping),
            Priority::NORMAL,
            |ctx, ev| {
                if let Event::Message(m) = ev {
                    if ctx.post_to_other(m.sender(), TestMessage::Pong).is_err() {
                        log::debug!("ping from unlinked {}", m.sender());
                    }
                }
            },
        );
    }
}
