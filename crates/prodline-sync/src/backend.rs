//! In-process backend over the local engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use prodline_model::{
    now_millis, ApiResponse, Connection, ConnectionRequest, EntityRef, Machine, Queue,
    SimulationState, Snapshot,
};
use tracing::{info, warn};

use crate::api::SimulationApi;
use crate::error::Error;
use crate::events::StreamEvent;
use crate::simulation::LocalEngine;
use crate::store::StateStore;

#[derive(Default)]
struct Replay {
    snapshots: Vec<Snapshot>,
    next_snapshot: u64,
    live_backup: Option<SimulationState>,
    replaying: bool,
}

/// Serves [`SimulationApi`] from the local store and engine.
///
/// Every structural change is broadcast as a `STATE_UPDATE` on the engine's
/// wire channel, so push clients see the same stream a remote backend sends.
pub struct LocalBackend {
    store: StateStore,
    engine: LocalEngine,
    next_machine: AtomicU64,
    next_connection: AtomicU64,
    replay: Mutex<Replay>,
}

/// Lowest `Q<n>` not taken, starting at `Q0`.
fn free_queue_id(state: &SimulationState) -> String {
    let mut taken: Vec<u64> = state
        .queues
        .iter()
        .filter_map(|q| q.id.strip_prefix('Q')?.parse().ok())
        .collect();
    taken.sort_unstable();
    let mut n = 0;
    for t in taken {
        if t == n {
            n += 1;
        } else if t > n {
            break;
        }
    }
    format!("Q{n}")
}

fn refused<T>(e: Error) -> ApiResponse<T> {
    warn!(error = %e, "request refused");
    ApiResponse::err(e.to_string())
}

impl LocalBackend {
    pub fn new(store: StateStore, engine: LocalEngine) -> Self {
        Self {
            store,
            engine,
            next_machine: AtomicU64::new(1),
            next_connection: AtomicU64::new(1),
            replay: Mutex::new(Replay {
                next_snapshot: 1,
                ..Replay::default()
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn engine(&self) -> &LocalEngine {
        &self.engine
    }

    pub fn is_replaying(&self) -> bool {
        self.replay().replaying
    }

    fn replay(&self) -> MutexGuard<'_, Replay> {
        self.replay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a structural edit and broadcast the resulting state. `None`
    /// leaves the store untouched.
    fn edit<R>(&self, f: impl FnOnce(&mut SimulationState) -> Option<R>) -> Option<R> {
        self.store.try_patch(|state| {
            let out = f(state)?;
            self.engine.emit(&StreamEvent::StateUpdate(state.clone()));
            Some(out)
        })
    }

    fn install(&self, state: SimulationState) -> SimulationState {
        self.store.patch(|current| {
            *current = state;
            current.prune_stale_connections();
            self.engine.emit(&StreamEvent::StateUpdate(current.clone()));
            current.clone()
        })
    }
}

#[async_trait]
impl SimulationApi for LocalBackend {
    async fn get_state(&self) -> ApiResponse<SimulationState> {
        ApiResponse::ok(SimulationState::clone(&self.store.current()))
    }

    async fn create_queue(&self, x: f64, y: f64) -> ApiResponse<Queue> {
        let queue = self.edit(|state| {
            let queue = Queue::new(free_queue_id(state), x, y);
            state.queues.push(queue.clone());
            Some(queue)
        });
        match queue {
            Some(queue) => {
                info!(queue = %queue.id, "added queue");
                ApiResponse::ok(queue)
            }
            None => ApiResponse::err("queue not created"),
        }
    }

    async fn create_machine(&self, x: f64, y: f64) -> ApiResponse<Machine> {
        // Drawn before the patch: the engine's rng is never locked under the store.
        let processing_time = self.engine.random_processing_time();
        let machine = self.edit(|state| {
            let n = self.next_machine.fetch_add(1, Ordering::Relaxed);
            let machine = Machine::new(format!("M{n}"), x, y, processing_time);
            state.machines.push(machine.clone());
            Some(machine)
        });
        match machine {
            Some(machine) => {
                info!(machine = %machine.id, processing_time, "added machine");
                ApiResponse::ok(machine)
            }
            None => ApiResponse::err("machine not created"),
        }
    }

    async fn create_connection(&self, request: ConnectionRequest) -> ApiResponse<Connection> {
        let source = EntityRef::new(request.source_type, request.source_id);
        let target = EntityRef::new(request.target_type, request.target_id);
        if source.id == target.id {
            return refused(Error::Rejected(format!("cannot connect {source} to itself")));
        }

        let mut missing = None;
        let created = self.edit(|state| {
            for end in [&source, &target] {
                if !state.contains(end) {
                    missing = Some(end.clone());
                    return None;
                }
            }
            let n = self.next_connection.fetch_add(1, Ordering::Relaxed);
            let conn = Connection::new(format!("C{n}"), source.clone(), target.clone());
            state.connections.push(conn.clone());
            Some(conn)
        });
        match created {
            Some(conn) => {
                info!(connection = %conn.id, %source, %target, "added connection");
                ApiResponse::ok(conn)
            }
            None => refused(Error::NotFound(
                missing.map(|e| e.to_string()).unwrap_or_default(),
            )),
        }
    }

    async fn delete_element(&self, entity: &EntityRef) -> ApiResponse<()> {
        match self.edit(|state| state.remove_entity(entity).then_some(())) {
            Some(()) => {
                info!(%entity, "deleted");
                ApiResponse::ok_empty()
            }
            None => refused(Error::NotFound(entity.to_string())),
        }
    }

    async fn delete_connection(&self, id: &str) -> ApiResponse<()> {
        let removed = self.edit(|state| {
            let before = state.connections.len();
            state.connections.retain(|c| c.id != id);
            (state.connections.len() != before).then_some(())
        });
        match removed {
            Some(()) => {
                info!(connection = id, "deleted connection");
                ApiResponse::ok_empty()
            }
            None => refused(Error::NotFound(format!("connection:{id}"))),
        }
    }

    async fn update_position(&self, entity: &EntityRef, x: f64, y: f64) -> ApiResponse<()> {
        match self.edit(|state| state.set_position(entity, x, y).then_some(())) {
            Some(()) => ApiResponse::ok_empty(),
            None => refused(Error::NotFound(entity.to_string())),
        }
    }

    async fn start(&self) -> ApiResponse<()> {
        self.engine.start();
        ApiResponse::ok_empty()
    }

    async fn stop(&self) -> ApiResponse<()> {
        self.engine.stop();
        ApiResponse::ok_empty()
    }

    async fn restart(&self) -> ApiResponse<SimulationState> {
        info!("restarting simulation");
        self.engine.stop();
        self.edit(|state| {
            state.clear_counts();
            Some(())
        });
        self.engine.start();
        ApiResponse::ok(SimulationState::clone(&self.store.current()))
    }

    async fn new_simulation(&self) -> ApiResponse<SimulationState> {
        self.engine.stop();
        self.next_machine.store(1, Ordering::Relaxed);
        self.next_connection.store(1, Ordering::Relaxed);
        *self.replay() = Replay {
            next_snapshot: 1,
            ..Replay::default()
        };
        info!("new simulation");
        ApiResponse::ok(self.install(SimulationState::default()))
    }

    async fn list_snapshots(&self) -> ApiResponse<Vec<Snapshot>> {
        ApiResponse::ok(self.replay().snapshots.clone())
    }

    async fn create_snapshot(&self, label: Option<String>) -> ApiResponse<Snapshot> {
        let state = SimulationState::clone(&self.store.current());
        let snapshot = {
            let mut replay = self.replay();
            let n = replay.next_snapshot;
            replay.next_snapshot += 1;
            let snapshot = Snapshot {
                id: format!("SNAP{n}"),
                timestamp: now_millis(),
                label: Some(label.unwrap_or_else(|| format!("Snapshot {n}"))),
                state,
            };
            replay.snapshots.push(snapshot.clone());
            snapshot
        };
        info!(snapshot = %snapshot.id, "snapshot created");
        self.engine.emit(&StreamEvent::SnapshotCreated);
        ApiResponse::ok(snapshot)
    }

    async fn replay_snapshot(&self, id: &str) -> ApiResponse<SimulationState> {
        let found = self
            .replay()
            .snapshots
            .iter()
            .find(|s| s.id == id || s.label.as_deref() == Some(id))
            .map(|s| s.state.clone());
        let Some(mut state) = found else {
            return refused(Error::NotFound(format!("snapshot {id}")));
        };

        // Captured before stopping so the backup remembers whether it ran.
        let live = SimulationState::clone(&self.store.current());
        self.engine.stop();
        {
            let mut replay = self.replay();
            if !replay.replaying {
                replay.live_backup = Some(live);
                replay.replaying = true;
                info!("live session backed up");
            }
        }
        state.is_running = false;
        info!(snapshot = id, "replaying snapshot");
        ApiResponse::ok(self.install(state))
    }

    async fn return_to_live(&self) -> ApiResponse<SimulationState> {
        let backup = {
            let mut replay = self.replay();
            replay.replaying = false;
            replay.live_backup.take()
        };
        let Some(mut backup) = backup else {
            warn!("no live session backup to restore");
            return ApiResponse::ok(SimulationState::clone(&self.store.current()));
        };

        let was_running = backup.is_running;
        self.engine.stop();
        backup.is_running = false;
        self.install(backup);
        if was_running {
            info!("resuming live simulation");
            self.engine.start();
        }
        ApiResponse::ok(SimulationState::clone(&self.store.current()))
    }
}
