//! The simulation aggregate and its immutable snapshots.

use serde::{Deserialize, Serialize};

use crate::entity::{natural_cmp, Connection, EntityKind, EntityRef, Machine, Queue};

/// Everything the diagram shows: queues, machines, connections, and whether
/// the simulation is running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationState {
    #[serde(default)]
    pub queues: Vec<Queue>,
    #[serde(default)]
    pub machines: Vec<Machine>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation_id: Option<String>,
}

impl SimulationState {
    pub fn queue(&self, id: &str) -> Option<&Queue> {
        self.queues.iter().find(|q| q.id == id)
    }

    pub fn queue_mut(&mut self, id: &str) -> Option<&mut Queue> {
        self.queues.iter_mut().find(|q| q.id == id)
    }

    pub fn machine(&self, id: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.id == id)
    }

    pub fn machine_mut(&mut self, id: &str) -> Option<&mut Machine> {
        self.machines.iter_mut().find(|m| m.id == id)
    }

    /// Whether the referenced queue or machine exists.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.position_of(entity).is_some()
    }

    /// Current position of the referenced queue or machine.
    pub fn position_of(&self, entity: &EntityRef) -> Option<(f64, f64)> {
        match entity.kind {
            EntityKind::Queue => self.queue(&entity.id).map(|q| (q.x, q.y)),
            EntityKind::Machine => self.machine(&entity.id).map(|m| (m.x, m.y)),
        }
    }

    /// Move an entity. Returns false if it does not exist.
    pub fn set_position(&mut self, entity: &EntityRef, x: f64, y: f64) -> bool {
        match entity.kind {
            EntityKind::Queue => self.queue_mut(&entity.id).map(|q| {
                q.x = x;
                q.y = y;
            }),
            EntityKind::Machine => self.machine_mut(&entity.id).map(|m| {
                m.x = x;
                m.y = y;
            }),
        }
        .is_some()
    }

    /// Remove an entity together with every connection that references it.
    pub fn remove_entity(&mut self, entity: &EntityRef) -> bool {
        let before = self.queues.len() + self.machines.len();
        match entity.kind {
            EntityKind::Queue => self.queues.retain(|q| q.id != entity.id),
            EntityKind::Machine => self.machines.retain(|m| m.id != entity.id),
        }
        let removed = before != self.queues.len() + self.machines.len();
        self.connections.retain(|c| !c.touches(entity));
        removed
    }

    /// Drop connections whose endpoints are missing from this state.
    ///
    /// Returns the number of connections removed.
    pub fn prune_stale_connections(&mut self) -> usize {
        let before = self.connections.len();
        let live: Vec<bool> = self
            .connections
            .iter()
            .map(|c| self.contains(&c.source()) && self.contains(&c.target()))
            .collect();
        let mut live = live.into_iter();
        self.connections.retain(|_| live.next().unwrap_or(false));
        before - self.connections.len()
    }

    /// Connections feeding the machine from an existing queue, lowest id first.
    pub fn input_connections(&self, machine_id: &str) -> Vec<&Connection> {
        let mut inputs: Vec<&Connection> = self
            .connections
            .iter()
            .filter(|c| {
                c.target_type == EntityKind::Machine
                    && c.target_id == machine_id
                    && c.source_type == EntityKind::Queue
                    && self.queue(&c.source_id).is_some()
            })
            .collect();
        inputs.sort_by(|a, b| natural_cmp(&a.id, &b.id));
        inputs
    }

    /// The machine's output route: the lowest-id connection to a queue that exists.
    pub fn output_connection(&self, machine_id: &str) -> Option<&Connection> {
        self.connections
            .iter()
            .filter(|c| {
                c.source_type == EntityKind::Machine
                    && c.source_id == machine_id
                    && c.target_type == EntityKind::Queue
                    && self.queue(&c.target_id).is_some()
            })
            .min_by(|a, b| natural_cmp(&a.id, &b.id))
    }

    /// Products in queues plus products processed by machines.
    pub fn total_products(&self) -> u64 {
        let queued: u64 = self.queues.iter().map(|q| q.product_count as u64).sum();
        let processed: u64 = self.machines.iter().map(|m| m.product_count as u64).sum();
        queued + processed
    }

    /// Zero every count and return machines to idle. Layout is kept.
    pub fn clear_counts(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        for machine in &mut self.machines {
            machine.product_count = 0;
            machine.finish_processing();
        }
    }
}

/// Immutable capture of a [`SimulationState`] for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub state: SimulationState,
}
