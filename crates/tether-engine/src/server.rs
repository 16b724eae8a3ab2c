//! Registry of simulations keyed by [`Identity`], with a background reaper.
//!
//! [`SimulationServer`] is an explicit handle constructed by the host; there
//! is no process-wide instance. Simulations created through it receive a
//! [`PeerDirectory`] backed by a weak reference to the registry, so they can
//! link to each other by identity without keeping the registry alive.
//!
//! Deleting a simulation stops it and moves it to a delete queue. The
//! reaper thread frees queued entries once their worker threads have
//! exited. Dropping the server stops every live simulation and blocks until
//! the queue is empty.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use tether_core::{Identity, Payload};

use crate::config::{ConfigError, ServerConfig, SimulationConfig, ThreadMode};
use crate::handoff::AcquiredSimulation;
use crate::mailbox::{Control, PeerRef};
use crate::messager::{PeerDirectory, ThreadMessager};
use crate::simulation::SimulationMessager;

/// Reaper poll interval while the server is shutting down.
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Tri-state answer for queries about a simulation that may not exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Query {
    /// The simulation exists and the condition holds.
    True,
    /// The simulation exists and the condition does not hold.
    False,
    /// No simulation is registered under that identity.
    Invalid,
}

impl From<bool> for Query {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl Query {
    /// `Some(bool)` for a registered simulation, `None` for `Invalid`.
    pub fn to_option(self) -> Option<bool> {
        match self {
            Self::True => Some(true),
            Self::False => Some(false),
            Self::Invalid => None,
        }
    }
}

enum ReaperSignal {
    Wake,
    Shutdown,
}

// ── ServerInner ───────────────────────────────────────────────────

struct ServerInner<M: Payload, W: Send + 'static> {
    identity: Identity,
    config: ServerConfig,
    simulations: RwLock<HashMap<Identity, SimulationMessager<M, W>>>,
    delete_queue: Mutex<Vec<SimulationMessager<M, W>>>,
    shutting_down: AtomicBool,
}

impl<M: Payload, W: Send + 'static> ServerInner<M, W> {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Identity, SimulationMessager<M, W>>> {
        self.simulations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Identity, SimulationMessager<M, W>>> {
        self.simulations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn delete_queue(&self) -> MutexGuard<'_, Vec<SimulationMessager<M, W>>> {
        self.delete_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Free every queued simulation whose worker has exited. Returns how
    /// many are still waiting.
    fn reap(&self) -> usize {
        let finished: Vec<_> = {
            let mut queue = self.delete_queue();
            let (finished, waiting) = std::mem::take(&mut *queue)
                .into_iter()
                .partition(SimulationMessager::is_finished);
            *queue = waiting;
            finished
        };
        for sim in &finished {
            log::info!("reaped simulation {}", sim.identity());
        }
        // Dropping joins the already-exited workers outside the queue lock.
        drop(finished);
        self.delete_queue().len()
    }
}

/// [`PeerDirectory`] view of the registry handed to every simulation.
struct RegistryHandle<M: Payload, W: Send + 'static> {
    inner: Weak<ServerInner<M, W>>,
}

impl<M: Payload, W: Send + 'static> PeerDirectory<M> for RegistryHandle<M, W> {
    fn resolve(&self, id: Identity) -> Option<PeerRef<M>> {
        let inner = self.inner.upgrade()?;
        let peer = inner.read().get(&id).map(SimulationMessager::peer_ref);
        peer
    }
}

fn reaper_loop<M: Payload, W: Send + 'static>(
    inner: Arc<ServerInner<M, W>>,
    signals: Receiver<ReaperSignal>,
) {
    let interval = inner.config.reaper_interval;
    let mut draining = false;
    loop {
        let timeout = if draining {
            DRAIN_POLL.min(interval)
        } else {
            interval
        };
        match signals.recv_timeout(timeout) {
            Ok(ReaperSignal::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(ReaperSignal::Shutdown) => draining = true,
            Err(RecvTimeoutError::Disconnected) => {
                draining = true;
                thread::sleep(DRAIN_POLL.min(interval));
            }
        }
        let waiting = inner.reap();
        if draining && waiting == 0 {
            break;
        }
    }
    log::debug!("reaper for server {} exiting", inner.identity);
}

// ── SimulationServer ──────────────────────────────────────────────

/// Creates, starts, stops and deletes simulations by identity.
///
/// Every method takes `&self` and may be called from any thread.
pub struct SimulationServer<M: Payload, W: Send + 'static = ()> {
    inner: Arc<ServerInner<M, W>>,
    signals: Sender<ReaperSignal>,
    reaper: Option<JoinHandle<()>>,
}

impl<M: Payload, W: Send + 'static> SimulationServer<M, W> {
    /// Validate `config` and spawn the reaper thread.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let inner = Arc::new(ServerInner {
            identity: Identity::generate(),
            config,
            simulations: RwLock::new(HashMap::new()),
            delete_queue: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });
        let (signals, rx) = crossbeam_channel::unbounded();
        let reaper_inner = Arc::clone(&inner);
        let reaper = thread::Builder::new()
            .name("tether-reaper".into())
            .spawn(move || reaper_loop(reaper_inner, rx))
            .map_err(|e| ConfigError::ThreadSpawnFailed {
                reason: format!("reaper thread: {e}"),
            })?;
        log::info!("simulation server {} up", inner.identity);
        Ok(Self {
            inner,
            signals,
            reaper: Some(reaper),
        })
    }

    /// The server's own identity, used as the sender of injected messages.
    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    /// The configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    fn directory(&self) -> Arc<dyn PeerDirectory<M>> {
        Arc::new(RegistryHandle {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Create a simulation with the default configuration and world.
    pub fn create_simulation<B>(&self, builder: B, mode: ThreadMode) -> Result<Identity, ConfigError>
    where
        W: Default,
        B: FnOnce(&mut ThreadMessager<M, W>) + Send + 'static,
    {
        let config = self.inner.config.default_simulation.clone();
        self.create_simulation_with(config, W::default(), builder, mode)
    }

    /// Create a simulation.
    ///
    /// In [`ThreadMode::Thread`] the loop starts immediately and `builder`
    /// runs on the simulation's thread before its first tick. In
    /// [`ThreadMode::Local`] `builder` runs on the calling thread and the
    /// simulation stays stopped until [`start_simulation`].
    ///
    /// [`start_simulation`]: Self::start_simulation
    pub fn create_simulation_with<B>(
        &self,
        config: SimulationConfig,
        world: W,
        builder: B,
        mode: ThreadMode,
    ) -> Result<Identity, ConfigError>
    where
        B: FnOnce(&mut ThreadMessager<M, W>) + Send + 'static,
    {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(ConfigError::ShuttingDown);
        }
        let sim = SimulationMessager::new(config, world)?;
        sim.set_directory(self.directory());
        let id = sim.identity();

        match mode {
            ThreadMode::Local => {
                sim.with_core(|core| builder(core.messager_mut()));
                self.inner.write().insert(id, sim);
            }
            ThreadMode::Thread => {
                // Registered before starting so the builder can link by id.
                self.inner.write().insert(id, sim);
                let started = self.inner.read().get(&id).map(|sim| sim.start_with(builder));
                if let Some(Err(e)) = started {
                    let failed = self.inner.write().remove(&id);
                    drop(failed);
                    return Err(e.into());
                }
            }
        }
        log::info!("created simulation {id} ({mode:?})");
        Ok(id)
    }

    /// Start a stopped simulation.
    pub fn start_simulation(&self, id: Identity) -> bool {
        self.apply_to_simulation(id, |sim| match sim.start() {
            Ok(()) => true,
            Err(e) => {
                log::debug!("start of {id} refused: {e}");
                false
            }
        })
        .unwrap_or(false)
    }

    /// Ask a simulation to stop. Asynchronous.
    pub fn stop_simulation(&self, id: Identity) -> bool {
        self.apply_to_simulation(id, SimulationMessager::stop)
            .unwrap_or(false)
    }

    /// Stop a simulation and hand it to the reaper.
    pub fn delete_simulation(&self, id: Identity) -> bool {
        let Some(sim) = self.inner.write().remove(&id) else {
            return false;
        };
        sim.stop();
        self.inner.delete_queue().push(sim);
        let _ = self.signals.send(ReaperSignal::Wake);
        log::info!("deleted simulation {id}");
        true
    }

    /// Whether a simulation is registered under `id`.
    pub fn is_simulation(&self, id: Identity) -> bool {
        self.inner.read().contains_key(&id)
    }

    /// Number of registered simulations.
    pub fn simulation_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Number of deleted simulations still waiting for their threads.
    pub fn pending_delete_count(&self) -> usize {
        self.inner.delete_queue().len()
    }

    /// Ask to take over ticking `id` from the calling thread.
    pub fn thread_acquire_simulation(&self, id: Identity) -> bool {
        self.apply_to_simulation(id, |sim| match sim.thread_acquire() {
            Ok(()) => true,
            Err(e) => {
                log::debug!("acquire of {id} refused: {e}");
                false
            }
        })
        .unwrap_or(false)
    }

    /// The acquired simulation, once its worker has handed it over.
    pub fn try_get_acquired_simulation(&self, id: Identity) -> Option<AcquiredSimulation<M, W>> {
        self.apply_to_simulation(id, SimulationMessager::try_get_acquired)
            .flatten()
    }

    /// Give an acquired simulation back, or withdraw a pending
    /// acquisition when `acquired` is `None`.
    pub fn thread_release_simulation(
        &self,
        id: Identity,
        acquired: Option<AcquiredSimulation<M, W>>,
    ) -> bool {
        match acquired {
            Some(acquired) => {
                let matches = acquired.identity() == id;
                if !matches {
                    log::warn!("released {} under mismatched id {id}", acquired.identity());
                }
                acquired.release();
                matches
            }
            None => self
                .apply_to_simulation(id, SimulationMessager::cancel_acquire)
                .unwrap_or(false),
        }
    }

    /// Inject one message into `id`'s mailbox, sent as the server.
    pub fn send_message(&self, id: Identity, payload: M) -> bool {
        let sender = self.inner.identity;
        self.apply_to_simulation(id, |sim| sim.send(sender, payload))
            .unwrap_or(false)
    }

    /// Inject a batch of messages under one mailbox lock.
    pub fn send_messages<I>(&self, id: Identity, payloads: I) -> bool
    where
        I: IntoIterator<Item = M>,
    {
        let sender = self.inner.identity;
        self.apply_to_simulation(id, |sim| sim.send_many(sender, payloads))
            .unwrap_or(false)
    }

    /// Whether `id` is running.
    pub fn is_simulation_running(&self, id: Identity) -> Query {
        self.query(id, SimulationMessager::is_running)
    }

    /// Whether `id` is draining its links.
    pub fn is_simulation_stopping(&self, id: Identity) -> Query {
        self.query(id, SimulationMessager::is_stopping)
    }

    /// Whether `id` is ticked by an external thread.
    pub fn is_simulation_externally_ticked(&self, id: Identity) -> Query {
        self.query(id, SimulationMessager::is_externally_ticked)
    }

    fn query(&self, id: Identity, f: impl FnOnce(&SimulationMessager<M, W>) -> bool) -> Query {
        self.apply_to_simulation(id, f)
            .map_or(Query::Invalid, Query::from)
    }

    /// Run `f` against a registered simulation under a shared lock of the
    /// registry. `f` must only use the simulation's thread-safe methods and
    /// must not call back into this server's mutating methods.
    pub fn apply_to_simulation<R>(
        &self,
        id: Identity,
        f: impl FnOnce(&SimulationMessager<M, W>) -> R,
    ) -> Option<R> {
        self.inner.read().get(&id).map(f)
    }

    /// Ask every live simulation to release unused memory.
    pub fn attempt_free_memory(&self) {
        let map = self.inner.read();
        for sim in map.values() {
            sim.inbox().post_control(Control::AttemptFreeMemory);
        }
        drop(map);
        self.inner.delete_queue().shrink_to_fit();
    }

    /// Block until the delete queue is empty or `timeout` passes. Returns
    /// whether it emptied.
    pub fn wait_for_reaper(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending_delete_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            let _ = self.signals.send(ReaperSignal::Wake);
            thread::sleep(DRAIN_POLL);
        }
    }
}

impl<M: Payload, W: Send + 'static> Drop for SimulationServer<M, W> {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let live: Vec<_> = self.inner.write().drain().map(|(_, sim)| sim).collect();
        log::info!(
            "simulation server {} shutting down {} simulation(s)",
            self.inner.identity,
            live.len()
        );
        for sim in &live {
            sim.stop();
        }
        self.inner.delete_queue().extend(live);
        let _ = self.signals.send(ReaperSignal::Shutdown);
        if let Some(reaper) = self.reaper.take() {
            if reaper.join().is_err() {
                log::error!("reaper thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping;

    impl Payload for Ping {
        type Kind = ();
        fn kind(&self) {}
    }

    fn server() -> SimulationServer<Ping> {
        SimulationServer::new(ServerConfig {
            reaper_interval: Duration::from_millis(10),
            default_simulation: SimulationConfig::unthrottled(),
        })
        .unwrap()
    }

    #[test]
    fn query_maps_bools() {
        assert_eq!(Query::from(true), Query::True);
        assert_eq!(Query::False.to_option(), Some(false));
        assert_eq!(Query::Invalid.to_option(), None);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ServerConfig {
            reaper_interval: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert_eq!(
            SimulationServer::<Ping>::new(config).err(),
            Some(ConfigError::ReaperIntervalZero)
        );
    }

    #[test]
    fn unknown_ids_are_invalid() {
        let server = server();
        let id = Identity::from_parts(1, 2);
        assert_eq!(server.is_simulation_running(id), Query::Invalid);
        assert!(!server.start_simulation(id));
        assert!(!server.delete_simulation(id));
        assert!(!server.send_message(id, Ping));
        assert!(server.try_get_acquired_simulation(id).is_none());
    }

    #[test]
    fn local_mode_stays_stopped_until_started() {
        let server = server();
        let id = server
            .create_simulation(|_| {}, ThreadMode::Local)
            .unwrap();
        assert!(server.is_simulation(id));
        assert_eq!(server.is_simulation_running(id), Query::False);
        assert!(server.start_simulation(id));
        assert!(server.stop_simulation(id));
        assert!(server.delete_simulation(id));
        assert!(!server.is_simulation(id));
        assert!(server.wait_for_reaper(Duration::from_secs(5)));
    }

    #[test]
    fn registry_resolves_peers_by_id() {
        let server = server();
        let a = server.create_simulation(|_| {}, ThreadMode::Local).unwrap();
        let directory = server.directory();
        assert_eq!(directory.resolve(a).map(|p| p.id()), Some(a));
        assert!(directory.resolve(Identity::from_parts(3, 3)).is_none());
        drop(server);
        assert!(directory.resolve(a).is_none());
    }

    #[test]
    fn shutdown_refuses_new_simulations() {
        let server = server();
        server.inner.shutting_down.store(true, Ordering::Release);
        assert_eq!(
            server.create_simulation(|_| {}, ThreadMode::Local),
            Err(ConfigError::ShuttingDown)
        );
    }
}
