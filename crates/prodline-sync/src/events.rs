//! Push-event vocabulary and its normalization into store mutations.
//!
//! Every producer of state changes, remote or local, speaks [`StreamEvent`].
//! The [`Normalizer`] is the single place that turns an event into a store
//! mutation or a side-channel [`Effect`].

use prodline_model::{
    FlashPayload, Machine, Product, Queue, QueueEventKind, QueueEventPayload, SimulationState,
    StreamMessage,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::store::StateStore;

/// Wire names of the event kinds.
pub mod kind {
    pub const STATE_UPDATE: &str = "STATE_UPDATE";
    pub const QUEUE_UPDATE: &str = "QUEUE_UPDATE";
    pub const QUEUE_EVENT: &str = "QUEUE_EVENT";
    pub const MACHINE_UPDATE: &str = "MACHINE_UPDATE";
    pub const MACHINE_FLASH: &str = "MACHINE_FLASH";
    pub const PRODUCT_ADDED: &str = "PRODUCT_ADDED";
    pub const PRODUCT_PROCESSED: &str = "PRODUCT_PROCESSED";
    pub const SIMULATION_STARTED: &str = "SIMULATION_STARTED";
    pub const SIMULATION_STOPPED: &str = "SIMULATION_STOPPED";
    pub const SNAPSHOT_CREATED: &str = "SNAPSHOT_CREATED";
}

/// Color given to products whose color was not announced.
const UNKNOWN_PRODUCT_COLOR: &str = "#9ca3af";

/// A decoded push-event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Full-state replace
    StateUpdate(SimulationState),
    /// Full record for one queue
    QueueUpdate(Queue),
    /// Count delta for one queue
    QueueEvent(QueueEventPayload),
    /// Full record for one machine
    MachineUpdate(Machine),
    /// Transient highlight; never touches canonical state
    MachineFlash { machine_id: String },
    /// Informational
    ProductAdded(serde_json::Value),
    /// Informational
    ProductProcessed(serde_json::Value),
    SimulationStarted,
    SimulationStopped,
    /// The remote snapshot list changed
    SnapshotCreated,
}

impl StreamEvent {
    /// Wire name of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::StateUpdate(_) => kind::STATE_UPDATE,
            StreamEvent::QueueUpdate(_) => kind::QUEUE_UPDATE,
            StreamEvent::QueueEvent(_) => kind::QUEUE_EVENT,
            StreamEvent::MachineUpdate(_) => kind::MACHINE_UPDATE,
            StreamEvent::MachineFlash { .. } => kind::MACHINE_FLASH,
            StreamEvent::ProductAdded(_) => kind::PRODUCT_ADDED,
            StreamEvent::ProductProcessed(_) => kind::PRODUCT_PROCESSED,
            StreamEvent::SimulationStarted => kind::SIMULATION_STARTED,
            StreamEvent::SimulationStopped => kind::SIMULATION_STOPPED,
            StreamEvent::SnapshotCreated => kind::SNAPSHOT_CREATED,
        }
    }

    /// Decode the payload of an envelope according to its kind.
    pub fn decode(msg: &StreamMessage) -> Result<Self> {
        fn data<T: DeserializeOwned>(msg: &StreamMessage) -> Result<T> {
            Ok(serde_json::from_value(msg.data.clone())?)
        }

        let event = match msg.kind.as_str() {
            kind::STATE_UPDATE => StreamEvent::StateUpdate(data(msg)?),
            kind::QUEUE_UPDATE => StreamEvent::QueueUpdate(data(msg)?),
            kind::QUEUE_EVENT => StreamEvent::QueueEvent(data(msg)?),
            kind::MACHINE_UPDATE => StreamEvent::MachineUpdate(data(msg)?),
            kind::MACHINE_FLASH => {
                let payload: FlashPayload = data(msg)?;
                StreamEvent::MachineFlash {
                    machine_id: payload.machine_id().to_string(),
                }
            }
            kind::PRODUCT_ADDED => StreamEvent::ProductAdded(msg.data.clone()),
            kind::PRODUCT_PROCESSED => StreamEvent::ProductProcessed(msg.data.clone()),
            kind::SIMULATION_STARTED => StreamEvent::SimulationStarted,
            kind::SIMULATION_STOPPED => StreamEvent::SimulationStopped,
            kind::SNAPSHOT_CREATED => StreamEvent::SnapshotCreated,
            other => return Err(Error::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }

    /// Parse a raw text frame into an event.
    pub fn from_json(text: &str) -> Result<Self> {
        let msg: StreamMessage = serde_json::from_str(text)?;
        Self::decode(&msg)
    }

    /// Wrap this event in a timestamped envelope.
    pub fn to_message(&self) -> StreamMessage {
        let data = match self {
            StreamEvent::StateUpdate(state) => serde_json::to_value(state),
            StreamEvent::QueueUpdate(queue) => serde_json::to_value(queue),
            StreamEvent::QueueEvent(payload) => serde_json::to_value(payload),
            StreamEvent::MachineUpdate(machine) => serde_json::to_value(machine),
            StreamEvent::MachineFlash { machine_id } => serde_json::to_value(FlashPayload::Object {
                machine_id: machine_id.clone(),
            }),
            StreamEvent::ProductAdded(v) | StreamEvent::ProductProcessed(v) => Ok(v.clone()),
            StreamEvent::SimulationStarted
            | StreamEvent::SimulationStopped
            | StreamEvent::SnapshotCreated => Ok(serde_json::Value::Null),
        };
        // Model types serialize infallibly; a failure would mean a map with
        // non-string keys, which none of them have.
        StreamMessage::new(self.kind(), data.unwrap_or(serde_json::Value::Null))
    }
}

/// Side effects that do not belong in canonical state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Pulse the machine's shape in the scene
    Flash(String),
    /// Ask the snapshot collaborator for a fresh listing
    RefreshSnapshots,
}

/// What reducing one event against a state did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reduction {
    /// The state was changed
    Mutated,
    /// The event referred to something that no longer exists, or was
    /// informational; the state is untouched
    Unchanged,
    /// The event is a side effect only
    Effect(Effect),
}

/// Result of handing an event to the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Canonical state was replaced or patched
    Mutated,
    /// Forwarded on the effect channel
    Forwarded(Effect),
    /// Nothing happened (stale reference, informational or undecodable event)
    Ignored,
}

/// Turns events into store mutations and effects.
#[derive(Clone)]
pub struct Normalizer {
    store: StateStore,
    effects: mpsc::UnboundedSender<Effect>,
}

impl Normalizer {
    pub fn new(store: StateStore, effects: mpsc::UnboundedSender<Effect>) -> Self {
        Self { store, effects }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Apply one event to `state` in place.
    ///
    /// This is the whole mutation vocabulary. It is pure with respect to
    /// anything but `state`, so it can run inside a store patch.
    pub fn reduce(state: &mut SimulationState, event: &StreamEvent) -> Reduction {
        match event {
            StreamEvent::StateUpdate(next) => {
                *state = next.clone();
                prune(state);
                Reduction::Mutated
            }
            StreamEvent::QueueUpdate(queue) => {
                match state.queue_mut(&queue.id) {
                    Some(existing) => *existing = queue.clone(),
                    None => state.queues.push(queue.clone()),
                }
                Reduction::Mutated
            }
            StreamEvent::QueueEvent(payload) => match state.queue_mut(&payload.queue_id) {
                Some(queue) => {
                    apply_count_delta(queue, payload);
                    Reduction::Mutated
                }
                None => Reduction::Unchanged,
            },
            StreamEvent::MachineUpdate(machine) => {
                match state.machine_mut(&machine.id) {
                    Some(existing) => *existing = machine.clone(),
                    None => state.machines.push(machine.clone()),
                }
                Reduction::Mutated
            }
            StreamEvent::SimulationStarted => {
                state.is_running = true;
                Reduction::Mutated
            }
            StreamEvent::SimulationStopped => {
                state.is_running = false;
                Reduction::Mutated
            }
            StreamEvent::MachineFlash { machine_id } => {
                Reduction::Effect(Effect::Flash(machine_id.clone()))
            }
            StreamEvent::SnapshotCreated => Reduction::Effect(Effect::RefreshSnapshots),
            StreamEvent::ProductAdded(_) | StreamEvent::ProductProcessed(_) => Reduction::Unchanged,
        }
    }

    /// Apply one event to the canonical state.
    pub fn apply(&self, event: StreamEvent) -> Applied {
        trace!(kind = event.kind(), "applying event");
        match event {
            StreamEvent::StateUpdate(mut state) => {
                prune(&mut state);
                self.store.replace(state);
                Applied::Mutated
            }
            StreamEvent::MachineFlash { machine_id } => self.forward(Effect::Flash(machine_id)),
            StreamEvent::SnapshotCreated => self.forward(Effect::RefreshSnapshots),
            StreamEvent::ProductAdded(_) | StreamEvent::ProductProcessed(_) => {
                debug!(kind = event.kind(), "informational event");
                Applied::Ignored
            }
            event => {
                let mutated = self.store.try_patch(|state| match Self::reduce(state, &event) {
                    Reduction::Mutated => Some(()),
                    _ => None,
                });
                match mutated {
                    Some(()) => Applied::Mutated,
                    None => {
                        debug!(kind = event.kind(), "event refers to unknown entity; ignored");
                        Applied::Ignored
                    }
                }
            }
        }
    }

    /// Decode and apply an envelope. Undecodable or unknown events are logged
    /// and dropped.
    pub fn ingest(&self, msg: &StreamMessage) -> Applied {
        match StreamEvent::decode(msg) {
            Ok(event) => self.apply(event),
            Err(e) => {
                warn!(kind = %msg.kind, error = %e, "dropping event");
                Applied::Ignored
            }
        }
    }

    /// Decode and apply a raw text frame.
    pub fn ingest_text(&self, text: &str) -> Applied {
        match serde_json::from_str::<StreamMessage>(text) {
            Ok(msg) => self.ingest(&msg),
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                Applied::Ignored
            }
        }
    }

    /// Send an effect downstream. A missing listener is not an error.
    pub fn forward(&self, effect: Effect) -> Applied {
        if self.effects.send(effect.clone()).is_err() {
            trace!(?effect, "no effect listener");
        }
        Applied::Forwarded(effect)
    }
}

/// Connections whose endpoints are gone never reach the canonical state.
fn prune(state: &mut SimulationState) {
    let dropped = state.prune_stale_connections();
    if dropped > 0 {
        debug!(dropped, "pruned connections with missing endpoints");
    }
}

/// Set a queue's count from a delta notification without mixing the tracked
/// and summarized forms.
fn apply_count_delta(queue: &mut Queue, payload: &QueueEventPayload) {
    if queue.is_tracked() {
        match (payload.event_type, &payload.product_id) {
            (QueueEventKind::ProductAdded, Some(id)) => queue.products.push(Product {
                id: id.clone(),
                color: payload
                    .product_color
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_PRODUCT_COLOR.to_string()),
            }),
            (QueueEventKind::ProductRemoved, Some(id)) => {
                if let Some(pos) = queue.products.iter().position(|p| &p.id == id) {
                    queue.products.remove(pos);
                }
            }
            (QueueEventKind::QueueEmpty, _) => queue.products.clear(),
            _ => {}
        }
    }
    queue.set_count(payload.new_queue_size);
}
