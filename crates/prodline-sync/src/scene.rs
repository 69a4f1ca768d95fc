//! Scene graph projection of the canonical state.
//!
//! The [`SceneGraph`] keeps one visual object per queue, machine and
//! resolvable connection, keyed by kind and id. [`SceneGraph::reconcile`]
//! brings it in line with a state by adding, updating in place, or removing
//! objects; an object that did not change is not touched and keeps its
//! [`ObjectHandle`].
//!
//! Machine flashes are purely visual. They override the fill until a
//! deadline, and fill changes arriving meanwhile become the color restored
//! when the flash ends.

use std::collections::{HashMap, HashSet};

use prodline_model::{EntityKind, EntityRef, Machine, Queue, SimulationState};
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::geometry::{connection_curve, node_contains, Arrowhead, CubicBezier, Point};

pub const QUEUE_COLOR: &str = "#22c55e";
pub const MACHINE_COLOR: &str = "#3b82f6";
pub const CONNECTION_COLOR: &str = "#374151";
pub const HIGHLIGHT_COLOR: &str = "#22c55e";

/// What a scene object depicts. Declaration order is paint order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneKind {
    Connection,
    Queue,
    Machine,
}

/// Composite key of a scene object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SceneKey {
    pub kind: SceneKind,
    pub id: String,
}

impl SceneKey {
    pub fn queue(id: impl Into<String>) -> Self {
        Self {
            kind: SceneKind::Queue,
            id: id.into(),
        }
    }

    pub fn machine(id: impl Into<String>) -> Self {
        Self {
            kind: SceneKind::Machine,
            id: id.into(),
        }
    }

    pub fn connection(id: impl Into<String>) -> Self {
        Self {
            kind: SceneKind::Connection,
            id: id.into(),
        }
    }

    pub fn entity(entity: &EntityRef) -> Self {
        match entity.kind {
            EntityKind::Queue => Self::queue(entity.id.clone()),
            EntityKind::Machine => Self::machine(entity.id.clone()),
        }
    }

    /// The entity behind a primary shape; `None` for connections.
    pub fn as_entity(&self) -> Option<EntityRef> {
        match self.kind {
            SceneKind::Queue => Some(EntityRef::queue(self.id.clone())),
            SceneKind::Machine => Some(EntityRef::machine(self.id.clone())),
            SceneKind::Connection => None,
        }
    }
}

/// Identity of a constructed visual object. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ObjectHandle(u64);

/// Rounded box with a title and a detail line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeShape {
    pub center: Point,
    pub fill: String,
    pub label: String,
    pub detail: String,
}

/// Curved directed edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeShape {
    pub curve: CubicBezier,
    /// The curve as SVG path data
    pub path: String,
    pub arrowhead: Arrowhead,
    pub stroke: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum Shape {
    Node(NodeShape),
    Edge(EdgeShape),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneObject {
    pub handle: ObjectHandle,
    pub key: SceneKey,
    #[serde(flatten)]
    pub shape: Shape,
}

impl SceneObject {
    pub fn node(&self) -> Option<&NodeShape> {
        match &self.shape {
            Shape::Node(node) => Some(node),
            Shape::Edge(_) => None,
        }
    }

    pub fn edge(&self) -> Option<&EdgeShape> {
        match &self.shape {
            Shape::Edge(edge) => Some(edge),
            Shape::Node(_) => None,
        }
    }
}

/// Keys touched by one reconciliation, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<SceneKey>,
    pub updated: Vec<SceneKey>,
    pub removed: Vec<SceneKey>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

struct Flash {
    deadline: Instant,
    restore_fill: String,
}

/// The visual projection. Owned by one caller; never shared.
pub struct SceneGraph {
    objects: HashMap<SceneKey, SceneObject>,
    flashes: HashMap<String, Flash>,
    preview: Option<(SceneKey, Point)>,
    next_handle: u64,
    flash_duration: Duration,
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl SceneGraph {
    pub fn new(flash_duration: Duration) -> Self {
        Self {
            objects: HashMap::new(),
            flashes: HashMap::new(),
            preview: None,
            next_handle: 1,
            flash_duration,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, key: &SceneKey) -> Option<&SceneObject> {
        self.objects.get(key)
    }

    /// All objects in paint order: connections first, then creation order.
    pub fn objects(&self) -> Vec<&SceneObject> {
        let mut all: Vec<&SceneObject> = self.objects.values().collect();
        all.sort_by_key(|o| (o.key.kind != SceneKind::Connection, o.handle));
        all
    }

    /// Bring the scene in line with `state`.
    pub fn reconcile(&mut self, state: &SimulationState) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut desired = HashSet::new();

        // A preview the state has caught up with is no longer needed.
        let settled = self.preview.as_ref().is_some_and(|(key, p)| {
            key.as_entity()
                .and_then(|e| state.position_of(&e))
                .is_some_and(|(x, y)| x == p.x && y == p.y)
        });
        if settled {
            self.preview = None;
        }

        for queue in &state.queues {
            let key = SceneKey::queue(queue.id.clone());
            let shape = self.queue_shape(queue);
            desired.insert(key.clone());
            self.upsert(key, Shape::Node(shape), &mut report);
        }

        for machine in &state.machines {
            let key = SceneKey::machine(machine.id.clone());
            let mut shape = self.machine_shape(machine);
            if let Some(flash) = self.flashes.get_mut(&machine.id) {
                flash.restore_fill = std::mem::replace(&mut shape.fill, HIGHLIGHT_COLOR.to_string());
            }
            desired.insert(key.clone());
            self.upsert(key, Shape::Node(shape), &mut report);
        }

        for conn in &state.connections {
            let ends = self
                .resolve(state, &conn.source())
                .zip(self.resolve(state, &conn.target()));
            let Some((source, target)) = ends else {
                trace!(connection = %conn.id, "endpoint missing; skipped");
                continue;
            };
            let (curve, arrowhead) = connection_curve(source, target);
            let key = SceneKey::connection(conn.id.clone());
            desired.insert(key.clone());
            self.upsert(
                key,
                Shape::Edge(EdgeShape {
                    path: curve.path_data(),
                    curve,
                    arrowhead,
                    stroke: CONNECTION_COLOR.to_string(),
                }),
                &mut report,
            );
        }

        let stale: Vec<SceneKey> = self
            .objects
            .keys()
            .filter(|k| !desired.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            self.objects.remove(&key);
            if key.kind == SceneKind::Machine {
                self.flashes.remove(&key.id);
            }
            if self.preview.as_ref().is_some_and(|(k, _)| *k == key) {
                self.preview = None;
            }
            report.removed.push(key);
        }

        report.added.sort();
        report.updated.sort();
        report.removed.sort();
        trace!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            "reconciled scene"
        );
        report
    }

    fn upsert(&mut self, key: SceneKey, shape: Shape, report: &mut ReconcileReport) {
        match self.objects.get_mut(&key) {
            Some(object) => {
                if object.shape != shape {
                    object.shape = shape;
                    report.updated.push(key);
                }
            }
            None => {
                let handle = ObjectHandle(self.next_handle);
                self.next_handle += 1;
                self.objects.insert(
                    key.clone(),
                    SceneObject {
                        handle,
                        key: key.clone(),
                        shape,
                    },
                );
                report.added.push(key);
            }
        }
    }

    fn center_for(&self, key: &SceneKey, x: f64, y: f64) -> Point {
        match &self.preview {
            Some((k, p)) if k == key => *p,
            _ => Point::new(x, y),
        }
    }

    fn resolve(&self, state: &SimulationState, entity: &EntityRef) -> Option<Point> {
        let (x, y) = state.position_of(entity)?;
        Some(self.center_for(&SceneKey::entity(entity), x, y))
    }

    fn queue_shape(&self, queue: &Queue) -> NodeShape {
        NodeShape {
            center: self.center_for(&SceneKey::queue(queue.id.clone()), queue.x, queue.y),
            fill: QUEUE_COLOR.to_string(),
            label: queue.id.clone(),
            detail: format!("Products: {}", queue.product_count),
        }
    }

    fn machine_shape(&self, machine: &Machine) -> NodeShape {
        NodeShape {
            center: self.center_for(&SceneKey::machine(machine.id.clone()), machine.x, machine.y),
            fill: machine
                .current_product_color
                .clone()
                .unwrap_or_else(|| MACHINE_COLOR.to_string()),
            label: "Machine".to_string(),
            detail: format!("{:.1}s", machine.processing_time as f64 / 1000.0),
        }
    }

    /// Pulse a machine. A flash already running on it is restarted.
    ///
    /// Returns false if the machine is not in the scene.
    pub fn flash(&mut self, machine_id: &str, now: Instant) -> bool {
        let key = SceneKey::machine(machine_id);
        let Some(Shape::Node(node)) = self.objects.get_mut(&key).map(|o| &mut o.shape) else {
            trace!(machine_id, "flash for unknown machine");
            return false;
        };
        let deadline = now + self.flash_duration;
        match self.flashes.get_mut(machine_id) {
            Some(flash) => flash.deadline = deadline,
            None => {
                let restore_fill = std::mem::replace(&mut node.fill, HIGHLIGHT_COLOR.to_string());
                self.flashes.insert(
                    machine_id.to_string(),
                    Flash {
                        deadline,
                        restore_fill,
                    },
                );
            }
        }
        true
    }

    pub fn is_flashing(&self, machine_id: &str) -> bool {
        self.flashes.contains_key(machine_id)
    }

    /// Earliest pending flash deadline.
    pub fn next_flash_deadline(&self) -> Option<Instant> {
        self.flashes.values().map(|f| f.deadline).min()
    }

    /// End every flash whose deadline has passed. Returns the machines restored.
    pub fn expire_flashes(&mut self, now: Instant) -> Vec<String> {
        let due: Vec<String> = self
            .flashes
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            let Some(flash) = self.flashes.remove(id) else {
                continue;
            };
            if let Some(Shape::Node(node)) = self
                .objects
                .get_mut(&SceneKey::machine(id.clone()))
                .map(|o| &mut o.shape)
            {
                node.fill = flash.restore_fill;
            }
        }
        due
    }

    /// Topmost queue or machine under the point.
    pub fn hit_test(&self, x: f64, y: f64) -> Option<EntityRef> {
        let p = Point::new(x, y);
        self.objects
            .values()
            .filter(|o| {
                o.node()
                    .is_some_and(|n| o.key.kind != SceneKind::Connection && node_contains(n.center, p))
            })
            .max_by_key(|o| o.handle)
            .and_then(|o| o.key.as_entity())
    }

    /// Show `entity` at a provisional position while it is being dragged.
    pub fn set_preview(&mut self, entity: &EntityRef, x: f64, y: f64) -> bool {
        let key = SceneKey::entity(entity);
        let Some(Shape::Node(node)) = self.objects.get_mut(&key).map(|o| &mut o.shape) else {
            return false;
        };
        let p = Point::new(x, y);
        node.center = p;
        self.preview = Some((key, p));
        true
    }

    /// Drop the provisional position; the next reconcile shows the state's.
    pub fn clear_preview(&mut self) {
        self.preview = None;
    }

    pub fn has_preview(&self) -> bool {
        self.preview.is_some()
    }
}
