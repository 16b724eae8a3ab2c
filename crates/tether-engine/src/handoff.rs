//! Cooperative hand-off of a running simulation to an external thread.
//!
//! The simulation's mutable state ([`SimulationCore`]) is a single owned
//! value. Whoever holds it may tick it; the [`Slot`] is where it rests
//! while no thread holds it:
//!
//! ```text
//!  Parked ──start──► Running ──offer──► Offered ──lend──► Lent
//!    ▲                 ▲                   │               │
//!    └──────stop───────┴────reclaim─── Returned ◄──release─┘
//! ```
//!
//! `Offered` can also go straight to `Returned` when the acquirer cancels
//! before picking the state up.

use std::marker::PhantomData;
use std::sync::Arc;

use tether_core::{AcquireError, Identity, Payload, ThreadToken};

use crate::messager::ThreadMessager;
use crate::simulation::{SimulationCore, SimulationShared};

// ── Slot ──────────────────────────────────────────────────────────

/// Resting place of a simulation's state between owners.
pub(crate) enum Slot<M: Payload, W> {
    /// Not running; any thread may configure it.
    Parked(Box<SimulationCore<M, W>>),
    /// Held by the internal worker thread.
    Running,
    /// Handed over by the worker, waiting for the acquirer.
    Offered(Box<SimulationCore<M, W>>),
    /// Held by the external acquirer.
    Lent,
    /// Given back by the acquirer, waiting for the worker.
    Returned(Box<SimulationCore<M, W>>),
}

impl<M: Payload, W> Slot<M, W> {
    pub(crate) fn parked(core: SimulationCore<M, W>) -> Self {
        Self::Parked(Box::new(core))
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Parked(_) => "parked",
            Self::Running => "running",
            Self::Offered(_) => "offered",
            Self::Lent => "lent",
            Self::Returned(_) => "returned",
        }
    }

    pub(crate) fn is_parked(&self) -> bool {
        matches!(self, Self::Parked(_))
    }

    pub(crate) fn is_offered(&self) -> bool {
        matches!(self, Self::Offered(_))
    }

    /// Run `f` against the parked state.
    pub(crate) fn with_parked<R>(
        &mut self,
        f: impl FnOnce(&mut SimulationCore<M, W>) -> R,
    ) -> Option<R> {
        match self {
            Self::Parked(core) => Some(f(core)),
            _ => None,
        }
    }

    /// Parked → Running.
    pub(crate) fn take_parked(&mut self) -> Option<Box<SimulationCore<M, W>>> {
        match std::mem::replace(self, Self::Running) {
            Self::Parked(core) => Some(core),
            other => {
                *self = other;
                None
            }
        }
    }

    /// Running → Parked.
    pub(crate) fn park(&mut self, core: Box<SimulationCore<M, W>>) {
        debug_assert!(matches!(self, Self::Running), "park from {}", self.name());
        *self = Self::Parked(core);
    }

    /// Running → Offered.
    pub(crate) fn offer(&mut self, core: Box<SimulationCore<M, W>>) {
        debug_assert!(matches!(self, Self::Running), "offer from {}", self.name());
        *self = Self::Offered(core);
    }

    /// Offered → Lent.
    pub(crate) fn lend(&mut self) -> Option<Box<SimulationCore<M, W>>> {
        match std::mem::replace(self, Self::Lent) {
            Self::Offered(core) => Some(core),
            other => {
                *self = other;
                None
            }
        }
    }

    /// Offered → Returned, without the acquirer ever holding the state.
    pub(crate) fn withdraw_offer(&mut self) -> bool {
        match std::mem::replace(self, Self::Running) {
            Self::Offered(core) => {
                *self = Self::Returned(core);
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }

    /// Lent → Returned.
    pub(crate) fn give_back(&mut self, core: Box<SimulationCore<M, W>>) {
        debug_assert!(matches!(self, Self::Lent), "give_back from {}", self.name());
        *self = Self::Returned(core);
    }

    /// Returned → Running.
    pub(crate) fn reclaim(&mut self) -> Option<Box<SimulationCore<M, W>>> {
        match std::mem::replace(self, Self::Running) {
            Self::Returned(core) => Some(core),
            other => {
                *self = other;
                None
            }
        }
    }
}

// ── AcquiredSimulation ────────────────────────────────────────────

/// A simulation lent to the external thread that acquired it.
///
/// While this handle lives, the simulation's internal worker idles at its
/// tick cadence and the holder drives it with [`manual_tick`]. Dropping
/// the handle (or calling [`release`]) returns ownership to the worker,
/// which resumes ticking.
///
/// The handle is `!Send`: it stays on the thread the ownership token was
/// transferred to.
///
/// [`manual_tick`]: AcquiredSimulation::manual_tick
/// [`release`]: AcquiredSimulation::release
pub struct AcquiredSimulation<M: Payload, W: Send + 'static = ()> {
    core: Option<Box<SimulationCore<M, W>>>,
    shared: Arc<SimulationShared<M, W>>,
    _not_send: PhantomData<*const ()>,
}

impl<M: Payload, W: Send + 'static> AcquiredSimulation<M, W> {
    pub(crate) fn new(core: Box<SimulationCore<M, W>>, shared: Arc<SimulationShared<M, W>>) -> Self {
        Self {
            core: Some(core),
            shared,
            _not_send: PhantomData,
        }
    }

    fn held(&self) -> &SimulationCore<M, W> {
        match &self.core {
            Some(core) => core,
            None => unreachable!("acquired state is present until drop"),
        }
    }

    fn held_mut(&mut self) -> &mut SimulationCore<M, W> {
        match &mut self.core {
            Some(core) => core,
            None => unreachable!("acquired state is present until drop"),
        }
    }

    /// Identity of the acquired simulation.
    pub fn identity(&self) -> Identity {
        self.shared.identity
    }

    /// Run one tick body: incoming, `Tick`, outgoing. Never sleeps.
    pub fn manual_tick(&mut self) -> Result<(), AcquireError> {
        if self.shared.inbox.owner().owner() != Some(ThreadToken::current()) {
            log::error!("manual_tick on {} from a thread that did not acquire it", self.identity());
            return Err(AcquireError::NotAcquirer);
        }
        self.held_mut().tick();
        Ok(())
    }

    /// The simulation's state.
    pub fn core(&self) -> &SimulationCore<M, W> {
        self.held()
    }

    /// Mutable access to the simulation's state.
    pub fn core_mut(&mut self) -> &mut SimulationCore<M, W> {
        self.held_mut()
    }

    /// The simulation's actor.
    pub fn messager(&self) -> &ThreadMessager<M, W> {
        self.held().messager()
    }

    /// Mutable access to the simulation's actor.
    pub fn messager_mut(&mut self) -> &mut ThreadMessager<M, W> {
        self.held_mut().messager_mut()
    }

    /// Give the simulation back to its internal thread.
    pub fn release(self) {
        drop(self);
    }
}

impl<M: Payload, W: Send + 'static> Drop for AcquiredSimulation<M, W> {
    fn drop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        let shared = &self.shared;
        match shared.flags.internal() {
            Some(internal) => {
                if let Err(e) = shared.inbox.owner().transfer(internal) {
                    log::error!("simulation {} release failed: {e}", shared.identity);
                }
            }
            None => log::error!("simulation {} has no internal thread to return to", shared.identity),
        }
        let mut slot = shared.slot();
        shared.flags.clear_acquisition();
        slot.give_back(core);
        drop(slot);
        shared.wake_worker();
        log::debug!("simulation {} released", shared.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::AcquireFlags;

    #[derive(Debug)]
    struct Nop;

    impl Payload for Nop {
        type Kind = ();
        fn kind(&self) {}
    }

    fn core() -> Box<SimulationCore<Nop, u32>> {
        Box::new(SimulationCore::new(0.0, 7, Arc::new(AcquireFlags::default())))
    }

    #[test]
    fn full_lend_cycle() {
        let mut slot = Slot::Parked(core());
        let held = slot.take_parked().unwrap();
        assert_eq!(slot.name(), "running");

        slot.offer(held);
        assert!(slot.is_offered());
        assert!(slot.reclaim().is_none(), "nothing to reclaim while offered");
        assert!(slot.is_offered());

        let lent = slot.lend().unwrap();
        assert_eq!(slot.name(), "lent");
        assert!(slot.lend().is_none());

        slot.give_back(lent);
        assert_eq!(slot.name(), "returned");
        let back = slot.reclaim().unwrap();
        assert_eq!(*back.messager().world(), 7);

        slot.park(back);
        assert!(slot.is_parked());
        assert_eq!(slot.with_parked(|c| c.total_ticks()), Some(0));
    }

    #[test]
    fn withdrawn_offer_returns_to_worker() {
        let mut slot = Slot::Parked(core());
        let held = slot.take_parked().unwrap();
        slot.offer(held);
        assert!(slot.withdraw_offer());
        assert_eq!(slot.name(), "returned");
        assert!(!slot.withdraw_offer());
        assert_eq!(slot.name(), "returned");
        assert!(slot.reclaim().is_some());
    }

    #[test]
    fn take_parked_only_from_parked() {
        let mut slot = Slot::<Nop, u32>::Running;
        assert!(slot.take_parked().is_none());
        assert_eq!(slot.name(), "running");
        assert!(slot.with_parked(|_| ()).is_none());
    }
}
