//! Two simulations on their own threads trade pings until one is deleted.
//!
//! Run with `RUST_LOG=debug cargo run --example ping_pong` to see the
//! handshake and the stop drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tether_core::{Event, EventKind, Payload, Priority};
use tether_engine::{ServerConfig, SimulationConfig, SimulationServer, ThreadMode};

#[derive(Debug)]
enum Rally {
    Ball(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum RallyKind {
    Ball,
}

impl Payload for Rally {
    type Kind = RallyKind;

    fn kind(&self) -> RallyKind {
        match self {
            Rally::Ball(_) => RallyKind::Ball,
        }
    }
}

fn main() {
    env_logger::init();

    let server: SimulationServer<Rally> = SimulationServer::new(ServerConfig {
        reaper_interval: Duration::from_millis(50),
        default_simulation: SimulationConfig {
            tick_rate_hz: 120.0,
            thread_name: None,
        },
    })
    .expect("valid server config");

    let returned = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&returned);

    // Sends every ball straight back, one higher.
    let wall = server
        .create_simulation(
            |actor| {
                actor.subscribe(EventKind::Message(RallyKind::Ball), Priority::NORMAL, |ctx, ev| {
                    if let Event::Message(m) = ev {
                        let Rally::Ball(n) = m.payload();
                        let _ = ctx.post_to_other(m.sender(), Rally::Ball(n + 1));
                    }
                });
            },
            ThreadMode::Thread,
        )
        .expect("wall simulation");

    let player = server
        .create_simulation(
            move |actor| {
                actor.subscribe(EventKind::PeerLinked, Priority::NORMAL, |ctx, ev| {
                    if let Event::PeerLinked(peer) = ev {
                        let _ = ctx.post_to_other(*peer, Rally::Ball(0));
                    }
                });
                actor.subscribe(EventKind::Message(RallyKind::Ball), Priority::NORMAL, move |ctx, ev| {
                    if let Event::Message(m) = ev {
                        let Rally::Ball(n) = m.payload();
                        counter.store(*n, Ordering::Relaxed);
                        let _ = ctx.post_to_other(m.sender(), Rally::Ball(n + 1));
                    }
                });
                if let Err(e) = actor.link_id(wall) {
                    eprintln!("link failed: {e}");
                }
            },
            ThreadMode::Thread,
        )
        .expect("player simulation");

    thread::sleep(Duration::from_millis(500));
    println!("rally reached {}", returned.load(Ordering::Relaxed));

    server.delete_simulation(player);
    server.wait_for_reaper(Duration::from_secs(5));
    println!(
        "player deleted; wall still running: {:?}",
        server.is_simulation_running(wall)
    );
}
