//! A [`ThreadMessager`] driven by a periodic tick loop on its own thread.
//!
//! [`SimulationMessager`] is the thread-safe handle. The mutable state
//! lives in a [`SimulationCore`] that is moved, never shared: the worker
//! thread holds it while running, an external thread holds it while the
//! simulation is acquired, and it rests in the hand-off slot otherwise.
//!
//! Worker sequence:
//!
//! ```text
//! messager_start → builder → SimulationStart →
//!   loop { pace → (offer | tick | reclaim) } →
//! SimulationStop → messager_stop → park
//! ```
//!
//! Tick body: `process_incoming` → `Tick` → `process_outgoing`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use tether_core::{
    AcquireError, Event, EventKind, Identity, Message, Payload, Priority, StartError, ThreadToken,
};

use crate::config::{ConfigError, SimulationConfig};
use crate::handoff::{AcquiredSimulation, Slot};
use crate::mailbox::{Control, Inbox, PeerRef};
use crate::messager::{PeerDirectory, ThreadMessager};

/// Poll interval of an unthrottled worker while its state is lent out.
const LENT_POLL: Duration = Duration::from_millis(1);

/// Raw token value meaning "no thread".
const NO_THREAD: u64 = 0;

/// Setup run against a simulation's actor before its first tick.
pub type Builder<M, W> = Box<dyn FnOnce(&mut ThreadMessager<M, W>) + Send>;

// ── AcquireFlags ──────────────────────────────────────────────────

/// Acquisition state shared by the handle, the worker and the
/// subscribers installed inside the core.
#[derive(Debug, Default)]
pub(crate) struct AcquireFlags {
    pub(crate) paused: AtomicBool,
    internal: AtomicU64,
    external: AtomicU64,
}

impl AcquireFlags {
    pub(crate) fn internal(&self) -> Option<ThreadToken> {
        ThreadToken::from_raw(self.internal.load(Ordering::Acquire))
    }

    pub(crate) fn external(&self) -> Option<ThreadToken> {
        ThreadToken::from_raw(self.external.load(Ordering::Acquire))
    }

    pub(crate) fn clear_acquisition(&self) {
        self.paused.store(false, Ordering::Release);
        self.external.store(NO_THREAD, Ordering::Release);
    }
}

// ── SimulationCore ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default)]
struct TickStats {
    total_ticks: u64,
    current_ticks: u64,
    total_run_time: Duration,
    current_run_time: Duration,
    current_start_time: Option<Instant>,
    last_tick_time: Option<Instant>,
}

/// The movable state of a simulation: its actor plus timing counters.
///
/// Only the thread currently holding the value can reach it, so none of
/// its accessors lock.
pub struct SimulationCore<M: Payload, W> {
    messager: ThreadMessager<M, W>,
    stats: TickStats,
    tick_rate_hz: f64,
    flags: Arc<AcquireFlags>,
}

impl<M: Payload, W> SimulationCore<M, W> {
    pub(crate) fn new(tick_rate_hz: f64, world: W, flags: Arc<AcquireFlags>) -> Self {
        let mut messager = ThreadMessager::new(world);
        messager.subscribe(EventKind::MessagerStopped, Priority::HIGHEST, |ctx, _| {
            ctx.stop_looping();
        });
        let on_acquire = Arc::clone(&flags);
        messager.subscribe(EventKind::AcquireRequested, Priority::HIGHEST, move |ctx, _| {
            if ctx.is_stopping() {
                log::debug!("{} declined acquisition while stopping", ctx.identity());
                on_acquire.clear_acquisition();
            } else if on_acquire.external().is_some() {
                on_acquire.paused.store(true, Ordering::Release);
            }
        });
        Self {
            messager,
            stats: TickStats::default(),
            tick_rate_hz,
            flags,
        }
    }

    /// The simulation's actor.
    pub fn messager(&self) -> &ThreadMessager<M, W> {
        &self.messager
    }

    /// Mutable access to the simulation's actor.
    pub fn messager_mut(&mut self) -> &mut ThreadMessager<M, W> {
        &mut self.messager
    }

    /// Configured tick rate. `0.0` is unthrottled.
    pub fn tick_rate_hz(&self) -> f64 {
        self.tick_rate_hz
    }

    /// Ticks since the simulation was created.
    pub fn total_ticks(&self) -> u64 {
        self.stats.total_ticks
    }

    /// Ticks since the current run started.
    pub fn current_ticks(&self) -> u64 {
        self.stats.current_ticks
    }

    /// Time spent ticking since creation.
    pub fn total_run_time(&self) -> Duration {
        self.stats.total_run_time
    }

    /// Time spent ticking in the current run.
    pub fn current_run_time(&self) -> Duration {
        self.stats.current_run_time
    }

    /// When the current run started, if running.
    pub fn current_start_time(&self) -> Option<Instant> {
        self.stats.current_start_time
    }

    /// When the last tick began.
    pub fn last_tick_time(&self) -> Option<Instant> {
        self.stats.last_tick_time
    }

    /// Target tick rate. Zero while externally ticked, since the acquirer
    /// sets the pace.
    pub fn ticks_per_second(&self) -> f64 {
        if self.flags.external().is_some() {
            0.0
        } else {
            self.tick_rate_hz
        }
    }

    /// Observed tick rate of the current run. Zero while externally
    /// ticked.
    pub fn measured_ticks_per_second(&self) -> f64 {
        if self.flags.external().is_some() {
            return 0.0;
        }
        let secs = self.stats.current_run_time.as_secs_f64();
        if secs > 0.0 {
            self.stats.current_ticks as f64 / secs
        } else {
            0.0
        }
    }

    pub(crate) fn tick(&mut self) {
        let now = Instant::now();
        let timestep = self
            .stats
            .last_tick_time
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        self.stats.last_tick_time = Some(now);
        self.stats.total_ticks += 1;
        self.stats.current_ticks += 1;
        self.stats.total_run_time += timestep;
        self.stats.current_run_time += timestep;

        self.messager.process_incoming();
        self.messager.post_event(Event::Tick {
            tick_start: now,
            timestep,
        });
        self.messager.process_outgoing();
    }

    fn internal_start(&mut self) {
        let now = Instant::now();
        self.stats.current_ticks = 0;
        self.stats.current_run_time = Duration::ZERO;
        self.stats.current_start_time = Some(now);
        self.stats.last_tick_time = Some(now);
        self.messager.post_event(Event::SimulationStart);
    }

    fn internal_stop(&mut self) {
        self.messager.post_event(Event::SimulationStop);
        self.stats.current_ticks = 0;
        self.stats.current_run_time = Duration::ZERO;
        self.stats.current_start_time = None;
        self.stats.last_tick_time = None;
        self.messager.messager_stop();
    }
}

// ── SimulationShared ──────────────────────────────────────────────

pub(crate) struct SimulationShared<M: Payload, W> {
    pub(crate) identity: Identity,
    pub(crate) inbox: Arc<Inbox<M>>,
    config: SimulationConfig,
    starting: AtomicBool,
    running: AtomicBool,
    pub(crate) flags: Arc<AcquireFlags>,
    slot: Mutex<Slot<M, W>>,
    worker: Mutex<Option<Thread>>,
}

impl<M: Payload, W> SimulationShared<M, W> {
    pub(crate) fn slot(&self) -> MutexGuard<'_, Slot<M, W>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker(&self) -> MutexGuard<'_, Option<Thread>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake_worker(&self) {
        if let Some(worker) = self.worker().as_ref() {
            worker.unpark();
        }
    }

    /// Hand the state to the pending acquirer. Gives it back if the
    /// acquisition was withdrawn in the meantime.
    fn offer(
        &self,
        core: Box<SimulationCore<M, W>>,
    ) -> Option<Box<SimulationCore<M, W>>> {
        let mut slot = self.slot();
        let external = match self.flags.external() {
            Some(external) if self.flags.paused.load(Ordering::Acquire) => external,
            _ => {
                self.flags.paused.store(false, Ordering::Release);
                return Some(core);
            }
        };
        if let Err(e) = self.inbox.owner().transfer(external) {
            log::error!("simulation {} could not hand off to {external}: {e}", self.identity);
            self.flags.clear_acquisition();
            return Some(core);
        }
        slot.offer(core);
        log::debug!("simulation {} offered to {external}", self.identity);
        None
    }
}

// ── Pacer ─────────────────────────────────────────────────────────

/// Sleeps the worker to the next tick boundary.
struct Pacer {
    budget: Option<Duration>,
    next: Instant,
}

impl Pacer {
    fn new(budget: Option<Duration>) -> Self {
        Self {
            budget,
            next: Instant::now(),
        }
    }

    fn is_unthrottled(&self) -> bool {
        self.budget.is_none()
    }

    fn wait(&mut self) {
        let Some(budget) = self.budget else {
            return;
        };
        self.next += budget;
        let now = Instant::now();
        if self.next <= now {
            // Overran: restart the schedule rather than bursting to catch up.
            self.next = now;
        } else {
            // park_timeout so a release can wake the worker early.
            thread::park_timeout(self.next - now);
        }
    }
}

// ── WorkerGuard ───────────────────────────────────────────────────

/// Marks the simulation stopped if its worker unwinds.
///
/// The state is lost with the unwinding stack, so the slot stays
/// `Running` and the simulation cannot be restarted. Its mailbox is
/// closed so peers resolve pending sends locally.
struct WorkerGuard<'a, M: Payload, W> {
    shared: &'a SimulationShared<M, W>,
}

impl<M: Payload, W> Drop for WorkerGuard<'_, M, W> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        let shared = self.shared;
        let dropped = shared.inbox.close().len();
        log::error!(
            "simulation {} worker panicked; {dropped} queued envelope(s) discarded",
            shared.identity
        );
        shared.inbox.set_stopping(false);
        if shared.inbox.owner().owner() == Some(ThreadToken::current()) {
            if let Err(e) = shared.inbox.owner().release() {
                log::error!("simulation {} could not release ownership: {e}", shared.identity);
            }
        }
        shared.flags.internal.store(NO_THREAD, Ordering::Release);
        shared.flags.clear_acquisition();
        *shared.worker() = None;
        shared.running.store(false, Ordering::Release);
        shared.starting.store(false, Ordering::Release);
    }
}

fn run_worker<M: Payload, W: Send + 'static>(
    shared: Arc<SimulationShared<M, W>>,
    builder: Option<Builder<M, W>>,
) {
    let id = shared.identity;
    let _guard = WorkerGuard { shared: &shared };
    let Some(mut core) = shared.slot().take_parked() else {
        log::error!("simulation {id} worker found no parked state");
        shared.starting.store(false, Ordering::Release);
        return;
    };
    if let Err(e) = core.messager.messager_start() {
        log::error!("simulation {id} could not claim ownership: {e}");
        shared.slot().park(core);
        shared.starting.store(false, Ordering::Release);
        return;
    }
    *shared.worker() = Some(thread::current());
    shared
        .flags
        .internal
        .store(ThreadToken::current().get(), Ordering::Release);

    if let Some(build) = builder {
        build(&mut core.messager);
    }
    core.internal_start();
    shared.running.store(true, Ordering::Release);
    shared.starting.store(false, Ordering::Release);
    log::info!(
        "simulation {id} started at {} Hz on {}",
        shared.config.tick_rate_hz,
        ThreadToken::current()
    );

    let mut pacer = Pacer::new(shared.config.tick_budget());
    let mut held = Some(core);
    let mut core = loop {
        if let Some(done) = held.take_if(|core| !core.messager.keep_looping()) {
            break done;
        }
        pacer.wait();
        held = match held.take() {
            Some(core) if shared.flags.paused.load(Ordering::Acquire) => shared.offer(core),
            Some(mut core) => {
                core.tick();
                Some(core)
            }
            None => {
                let back = shared.slot().reclaim();
                if back.is_none() && pacer.is_unthrottled() {
                    thread::park_timeout(LENT_POLL);
                }
                back
            }
        };
    };

    core.internal_stop();
    let ticks = core.total_ticks();
    shared.slot().park(core);
    shared.flags.internal.store(NO_THREAD, Ordering::Release);
    shared.flags.clear_acquisition();
    *shared.worker() = None;
    shared.running.store(false, Ordering::Release);
    log::info!("simulation {id} stopped after {ticks} total tick(s)");
}

// ── SimulationMessager ────────────────────────────────────────────

/// Thread-safe handle to a simulation with its own tick loop.
///
/// Every method may be called from any thread. Owner-only operations on
/// the actor itself are reached through a [`Builder`], the
/// [`AcquiredSimulation`] handle, or [`with_core`](Self::with_core) while
/// stopped.
///
/// Dropping the handle stops the simulation and joins its worker.
pub struct SimulationMessager<M: Payload, W: Send + 'static = ()> {
    shared: Arc<SimulationShared<M, W>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

// Compile-time assertion: the handle is shareable across threads.
const _: fn() = || {
    struct Marker;
    impl Payload for Marker {
        type Kind = ();
        fn kind(&self) {}
    }
    fn assert<T: Send + Sync>() {}
    assert::<SimulationMessager<Marker>>();
};

impl<M: Payload, W: Send + 'static> SimulationMessager<M, W> {
    /// A stopped simulation with a fresh identity.
    pub fn new(config: SimulationConfig, world: W) -> Result<Self, ConfigError> {
        config.validate()?;
        let flags = Arc::new(AcquireFlags::default());
        let core = SimulationCore::new(config.tick_rate_hz, world, Arc::clone(&flags));
        let identity = core.messager.identity();
        let inbox = Arc::clone(core.messager.inbox());
        Ok(Self {
            shared: Arc::new(SimulationShared {
                identity,
                inbox,
                config,
                starting: AtomicBool::new(false),
                running: AtomicBool::new(false),
                flags,
                slot: Mutex::new(Slot::parked(core)),
                worker: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        })
    }

    fn thread(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This simulation's identity.
    pub fn identity(&self) -> Identity {
        self.shared.identity
    }

    /// The configuration it was created with.
    pub fn config(&self) -> &SimulationConfig {
        &self.shared.config
    }

    /// The simulation's mailbox.
    pub fn inbox(&self) -> &Arc<Inbox<M>> {
        &self.shared.inbox
    }

    /// A reply address for linking.
    pub fn peer_ref(&self) -> PeerRef<M> {
        self.shared.inbox.peer_ref()
    }

    /// Inject a message from `sender` without a link.
    pub fn send(&self, sender: Identity, payload: M) -> bool {
        self.shared
            .inbox
            .post_unattested(Message::new(sender, payload))
    }

    /// Inject a batch of messages from `sender` under one lock.
    pub fn send_many<I>(&self, sender: Identity, payloads: I) -> bool
    where
        I: IntoIterator<Item = M>,
    {
        self.shared
            .inbox
            .post_many_unattested(payloads.into_iter().map(|p| Message::new(sender, p)))
    }

    /// Run `f` against the state while the simulation is stopped.
    /// Returns `None` if it is running or lent out.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut SimulationCore<M, W>) -> R) -> Option<R> {
        self.shared.slot().with_parked(f)
    }

    /// Install the directory used for linking by identity.
    pub fn set_directory(&self, directory: Arc<dyn PeerDirectory<M>>) -> bool {
        self.with_core(|core| core.messager.set_directory(directory))
            .is_some()
    }

    /// Start the tick loop on a new thread.
    pub fn start(&self) -> Result<(), StartError> {
        self.spawn(None)
    }

    /// Start the tick loop and run `builder` on the new thread before the
    /// first tick.
    pub fn start_with<B>(&self, builder: B) -> Result<(), StartError>
    where
        B: FnOnce(&mut ThreadMessager<M, W>) + Send + 'static,
    {
        self.spawn(Some(Box::new(builder)))
    }

    fn spawn(&self, builder: Option<Builder<M, W>>) -> Result<(), StartError> {
        let shared = &self.shared;
        // Held across the start so `is_finished` never pairs a stale handle
        // with a start in progress.
        let mut thread = self.thread();
        if shared.running.load(Ordering::Acquire) {
            return Err(StartError::AlreadyRunning);
        }
        if shared
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StartError::AlreadyRunning);
        }
        if !shared.slot().is_parked() {
            shared.starting.store(false, Ordering::Release);
            return Err(if shared.running.load(Ordering::Acquire) {
                StartError::AlreadyRunning
            } else {
                StartError::Unavailable
            });
        }

        if let Some(previous) = thread.take() {
            if previous.join().is_err() {
                log::error!("simulation {} previous worker panicked", shared.identity);
            }
        }
        // Accept posts between spawn and the worker's first tick.
        shared.inbox.open();

        let name = shared.config.thread_name.clone().unwrap_or_else(|| {
            let id = shared.identity.to_string();
            format!("tether-sim-{}", &id[..8])
        });
        let worker_shared = Arc::clone(shared);
        match thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(worker_shared, builder))
        {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                shared.starting.store(false, Ordering::Release);
                Err(StartError::Spawn {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Ask the simulation to stop. Asynchronous: the owning thread drains
    /// its links and then exits the loop.
    ///
    /// While the state is lent to an external thread, the request is only
    /// processed by that thread's next `manual_tick` or after release.
    pub fn stop(&self) -> bool {
        if !self.is_running() && !self.is_starting() {
            return false;
        }
        let posted = self.shared.inbox.post_control(Control::RequestStop);
        if posted {
            log::info!("simulation {} stop requested", self.shared.identity);
        }
        posted
    }

    /// Block until the worker thread exits. Returns `false` if there was
    /// no worker to wait for.
    pub fn join(&self) -> bool {
        let Some(handle) = self.thread().take() else {
            return false;
        };
        if handle.join().is_err() {
            log::error!("simulation {} worker panicked", self.shared.identity);
        }
        true
    }

    /// Ask to take over ticking from the calling thread.
    ///
    /// Poll [`try_get_acquired`](Self::try_get_acquired) afterwards.
    pub fn thread_acquire(&self) -> Result<(), AcquireError> {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) {
            return Err(AcquireError::NotRunning);
        }
        if shared.inbox.is_stopping() {
            return Err(AcquireError::Stopping);
        }
        if shared.flags.external().is_some() {
            return Err(AcquireError::AlreadyAcquired);
        }
        let internal = shared
            .flags
            .internal()
            .ok_or(AcquireError::NotInternallyOwned)?;
        if shared.inbox.owner().owner() != Some(internal) {
            return Err(AcquireError::NotInternallyOwned);
        }
        let me = ThreadToken::current();
        shared
            .flags
            .external
            .compare_exchange(NO_THREAD, me.get(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AcquireError::AlreadyAcquired)?;
        if !shared.inbox.post_control(Control::AcquireRequested) {
            shared.flags.external.store(NO_THREAD, Ordering::Release);
            return Err(AcquireError::NotRunning);
        }
        log::debug!("simulation {} acquisition requested by {me}", shared.identity);
        Ok(())
    }

    /// The simulation's state, once the worker has handed it over.
    pub fn try_get_acquired(&self) -> Option<AcquiredSimulation<M, W>> {
        if self.shared.flags.external() != Some(ThreadToken::current()) {
            return None;
        }
        let core = self.shared.slot().lend()?;
        Some(AcquiredSimulation::new(core, Arc::clone(&self.shared)))
    }

    /// Withdraw a pending acquisition that has not been picked up.
    /// Returns `false` if the calling thread had none.
    pub fn cancel_acquire(&self) -> bool {
        let shared = &self.shared;
        if shared.flags.external() != Some(ThreadToken::current()) {
            return false;
        }
        let mut slot = shared.slot();
        if slot.is_offered() {
            if let Some(internal) = shared.flags.internal() {
                if let Err(e) = shared.inbox.owner().transfer(internal) {
                    log::error!("simulation {} cancel failed: {e}", shared.identity);
                }
            }
            slot.withdraw_offer();
        }
        shared.flags.clear_acquisition();
        drop(slot);
        shared.wake_worker();
        log::debug!("simulation {} acquisition cancelled", shared.identity);
        true
    }

    /// Whether the tick loop is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether a start is in progress.
    pub fn is_starting(&self) -> bool {
        self.shared.starting.load(Ordering::Acquire)
    }

    /// Whether the stop drain is in progress.
    pub fn is_stopping(&self) -> bool {
        self.shared.inbox.is_stopping()
    }

    /// Whether an external thread holds or is about to hold the state.
    pub fn is_externally_ticked(&self) -> bool {
        self.shared.flags.external().is_some() && self.shared.flags.paused.load(Ordering::Acquire)
    }

    /// Whether the worker has fully exited (or never started).
    ///
    /// An exited worker thread counts as finished even if it unwound
    /// before resetting the flags.
    pub fn is_finished(&self) -> bool {
        match self.thread().as_ref() {
            Some(handle) => handle.is_finished(),
            None => !self.is_starting() && !self.is_running(),
        }
    }

    /// The worker thread's token while running.
    pub fn internal_thread(&self) -> Option<ThreadToken> {
        self.shared.flags.internal()
    }

    /// The acquiring thread's token, if any.
    pub fn external_thread(&self) -> Option<ThreadToken> {
        self.shared.flags.external()
    }
}

impl<M: Payload, W: Send + 'static> fmt::Debug for SimulationMessager<M, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationMessager")
            .field("identity", &self.shared.identity)
            .field("running", &self.is_running())
            .field("stopping", &self.is_stopping())
            .field("slot", &self.shared.slot().name())
            .finish()
    }
}

impl<M: Payload, W: Send + 'static> Drop for SimulationMessager<M, W> {
    fn drop(&mut self) {
        let handle = self
            .thread
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if !handle.is_finished() {
            self.stop();
            log::debug!("waiting for simulation {} to stop", self.shared.identity);
        }
        if handle.join().is_err() {
            log::error!("simulation {} worker panicked", self.shared.identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Bump(u32);

    impl Payload for Bump {
        type Kind = ();
        fn kind(&self) {}
    }

    type Sim = SimulationMessager<Bump, Arc<AtomicUsize>>;

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn counting_sim(rate: f64) -> (Sim, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let config = SimulationConfig {
            tick_rate_hz: rate,
            thread_name: None,
        };
        let sim = Sim::new(config, Arc::clone(&ticks)).unwrap();
        sim.with_core(|core| {
            core.messager_mut()
                .subscribe(EventKind::Tick, Priority::NORMAL, |ctx, _| {
                    ctx.world().fetch_add(1, Ordering::SeqCst);
                });
        })
        .unwrap();
        (sim, ticks)
    }

    #[test]
    fn rejects_invalid_config() {
        let config = SimulationConfig {
            tick_rate_hz: -5.0,
            thread_name: None,
        };
        assert!(SimulationMessager::<Bump>::new(config, ()).is_err());
    }

    #[test]
    fn start_tick_stop() {
        let (sim, ticks) = counting_sim(0.0);
        assert!(sim.is_finished());
        sim.start().unwrap();
        wait_until("ticks", || ticks.load(Ordering::SeqCst) >= 10);
        assert!(sim.is_running());
        assert_eq!(sim.start(), Err(StartError::AlreadyRunning));

        assert!(sim.stop());
        sim.join();
        assert!(!sim.is_running());
        assert!(sim.is_finished());
        assert!(!sim.stop());
        let total = sim.with_core(|core| core.total_ticks()).unwrap();
        assert_eq!(total as usize, ticks.load(Ordering::SeqCst));
    }

    #[test]
    fn builder_runs_on_worker_thread() {
        let sim = SimulationMessager::<Bump, Option<ThreadToken>>::new(
            SimulationConfig::unthrottled(),
            None,
        )
        .unwrap();
        sim.start_with(|m| *m.world_mut() = Some(ThreadToken::current()))
            .unwrap();
        wait_until("running", || sim.is_running());
        let internal = sim.internal_thread().unwrap();
        sim.stop();
        sim.join();
        let built_on = sim.with_core(|core| *core.messager().world()).unwrap();
        assert_eq!(built_on, Some(internal));
        assert_ne!(internal, ThreadToken::current());
    }

    #[test]
    fn restart_after_stop() {
        let (sim, ticks) = counting_sim(0.0);
        sim.start().unwrap();
        wait_until("first run", || ticks.load(Ordering::SeqCst) > 0);
        sim.stop();
        sim.join();
        let after_first = ticks.load(Ordering::SeqCst);
        sim.start().unwrap();
        wait_until("second run", || ticks.load(Ordering::SeqCst) > after_first);
        sim.stop();
        sim.join();
    }

    #[test]
    fn unattested_messages_reach_subscribers() {
        let sim = SimulationMessager::<Bump, Arc<AtomicUsize>>::new(
            SimulationConfig::unthrottled(),
            Arc::new(AtomicUsize::new(0)),
        )
        .unwrap();
        let sum = sim
            .with_core(|core| {
                let sum = Arc::clone(core.messager().world());
                core.messager_mut()
                    .subscribe(EventKind::Message(()), Priority::NORMAL, |ctx, ev| {
                        if let Event::Message(m) = ev {
                            ctx.world().fetch_add(m.payload().0 as usize, Ordering::SeqCst);
                        }
                    });
                sum
            })
            .unwrap();
        sim.start().unwrap();
        assert!(sim.send(Identity::EMPTY, Bump(2)));
        assert!(sim.send_many(Identity::EMPTY, [Bump(3), Bump(5)]));
        wait_until("delivery", || sum.load(Ordering::SeqCst) == 10);
        sim.stop();
        sim.join();
    }

    #[test]
    fn acquire_manual_tick_release() {
        let (sim, ticks) = counting_sim(0.0);
        assert_eq!(sim.thread_acquire(), Err(AcquireError::NotRunning));
        sim.start().unwrap();
        wait_until("running", || sim.is_running());
        let internal = sim.internal_thread().unwrap();

        sim.thread_acquire().unwrap();
        assert_eq!(sim.thread_acquire(), Err(AcquireError::AlreadyAcquired));
        let mut acquired = loop {
            if let Some(a) = sim.try_get_acquired() {
                break a;
            }
            thread::yield_now();
        };
        assert!(sim.is_externally_ticked());
        assert_eq!(sim.inbox().owner().owner(), Some(ThreadToken::current()));

        let before = ticks.load(Ordering::SeqCst);
        for _ in 0..5 {
            acquired.manual_tick().unwrap();
        }
        assert_eq!(ticks.load(Ordering::SeqCst), before + 5);
        assert_eq!(acquired.core().ticks_per_second(), 0.0);
        acquired.release();

        assert_eq!(sim.inbox().owner().owner(), Some(internal));
        assert!(!sim.is_externally_ticked());
        let after = ticks.load(Ordering::SeqCst);
        wait_until("resumed", || ticks.load(Ordering::SeqCst) > after);
        sim.stop();
        sim.join();
    }

    #[test]
    fn cancel_pending_acquire() {
        let (sim, ticks) = counting_sim(0.0);
        sim.start().unwrap();
        wait_until("running", || sim.is_running());
        let internal = sim.internal_thread().unwrap();
        assert!(!sim.cancel_acquire());

        sim.thread_acquire().unwrap();
        // Let the worker reach the offer before withdrawing.
        wait_until("offer", || sim.inbox().owner().owner() != Some(internal));
        assert!(sim.cancel_acquire());
        assert!(sim.try_get_acquired().is_none());
        assert_eq!(sim.external_thread(), None);

        let after = ticks.load(Ordering::SeqCst);
        wait_until("resumed", || ticks.load(Ordering::SeqCst) > after);
        assert_eq!(sim.inbox().owner().owner(), Some(internal));
        sim.stop();
        sim.join();
    }

    #[test]
    fn acquire_refused_from_other_thread_handle() {
        let (sim, _ticks) = counting_sim(0.0);
        let sim = Arc::new(sim);
        sim.start().unwrap();
        wait_until("running", || sim.is_running());
        sim.thread_acquire().unwrap();
        let other = Arc::clone(&sim);
        let stolen = thread::spawn(move || other.try_get_acquired().is_none())
            .join()
            .unwrap();
        assert!(stolen);
        assert!(sim.cancel_acquire());
        sim.stop();
        sim.join();
    }

    #[test]
    fn stop_while_lent_completes_after_release() {
        let (sim, _ticks) = counting_sim(0.0);
        sim.start().unwrap();
        wait_until("running", || sim.is_running());
        sim.thread_acquire().unwrap();
        let mut acquired = loop {
            if let Some(a) = sim.try_get_acquired() {
                break a;
            }
            thread::yield_now();
        };
        assert!(sim.stop());
        acquired.manual_tick().unwrap();
        assert!(acquired.messager().is_stopping() || !acquired.messager().keep_looping());
        drop(acquired);
        sim.join();
        assert!(!sim.is_running());
        assert!(sim.inbox().owner().owner().is_none());
    }

    #[test]
    fn worker_panic_marks_simulation_finished() {
        let sim = SimulationMessager::<Bump>::new(SimulationConfig::unthrottled(), ()).unwrap();
        sim.with_core(|core| {
            core.messager_mut()
                .subscribe(EventKind::Tick, Priority::NORMAL, |_, _| panic!("tick failed"));
        })
        .unwrap();
        sim.start().unwrap();
        wait_until("worker exit", || sim.is_finished());

        assert!(!sim.is_running());
        assert!(!sim.is_starting());
        assert_eq!(sim.internal_thread(), None);
        assert!(!sim.inbox().is_open());
        assert!(sim.inbox().owner().owner().is_none());
        assert!(!sim.stop());
        // The state unwound with the worker, so there is nothing to restart.
        assert_eq!(sim.start(), Err(StartError::Unavailable));
        assert!(sim.join());
    }

    #[test]
    fn builder_panic_clears_starting() {
        let sim = SimulationMessager::<Bump>::new(SimulationConfig::unthrottled(), ()).unwrap();
        sim.start_with(|_| panic!("builder failed")).unwrap();
        wait_until("worker exit", || sim.is_finished());
        assert!(!sim.is_starting());
        assert!(!sim.is_running());
        assert!(!sim.send(Identity::EMPTY, Bump(1)));
    }

    #[test]
    fn configured_and_measured_rates() {
        let (sim, ticks) = counting_sim(200.0);
        assert_eq!(sim.with_core(|core| core.ticks_per_second()), Some(200.0));
        sim.start().unwrap();
        wait_until("ticks", || ticks.load(Ordering::SeqCst) >= 5);
        sim.stop();
        sim.join();
        let (configured, measured) = sim
            .with_core(|core| (core.ticks_per_second(), core.measured_ticks_per_second()))
            .unwrap();
        assert_eq!(configured, 200.0);
        // Stopping resets the current run.
        assert_eq!(measured, 0.0);
    }

    #[test]
    fn throttled_sim_respects_rate() {
        let (sim, ticks) = counting_sim(100.0);
        sim.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        sim.stop();
        sim.join();
        let n = ticks.load(Ordering::SeqCst);
        assert!(n > 0 && n < 60, "expected roughly 20 ticks, got {n}");
    }
}
