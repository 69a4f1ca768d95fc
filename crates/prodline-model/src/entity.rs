//! Queues, machines, connections and the references between them.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Kind of a connectable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Queue,
    Machine,
}

impl EntityKind {
    /// Lowercase name as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Queue => "queue",
            EntityKind::Machine => "machine",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ModelError;

    /// Accepts both the singular and the plural (`queues`) spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" | "queues" => Ok(EntityKind::Queue),
            "machine" | "machines" => Ok(EntityKind::Machine),
            other => Err(ModelError::UnknownKind(other.to_string())),
        }
    }
}

/// Reference to a queue or machine by kind and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { id: id.into(), kind }
    }

    pub fn queue(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Queue, id)
    }

    pub fn machine(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Machine, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A single product held by a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub color: String,
}

/// A buffer of products.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub product_count: u32,
    #[serde(default)]
    pub products: Vec<Product>,
}

impl Queue {
    /// Create an empty (and therefore tracked) queue.
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            product_count: 0,
            products: Vec::new(),
        }
    }

    /// Whether individual products are known for every counted product.
    pub fn is_tracked(&self) -> bool {
        self.products.len() == self.product_count as usize
    }

    /// Append a product. Keeps the list only if it was tracked before.
    pub fn push_product(&mut self, product: Product) {
        let tracked = self.is_tracked();
        self.product_count += 1;
        if tracked {
            self.products.push(product);
        } else {
            self.products.clear();
        }
    }

    /// Remove one product, FIFO. Returns the product if it was tracked.
    ///
    /// Returns `None` and leaves the queue untouched when the count is zero.
    pub fn take_product(&mut self) -> Option<Product> {
        if self.product_count == 0 {
            return None;
        }
        let tracked = self.is_tracked();
        self.product_count -= 1;
        if tracked {
            Some(self.products.remove(0))
        } else {
            self.products.clear();
            None
        }
    }

    /// Overwrite the count. Drops the product list unless it still matches.
    pub fn set_count(&mut self, count: u32) {
        self.product_count = count;
        if !self.is_tracked() {
            self.products.clear();
        }
    }

    /// Empty the queue of both count and products.
    pub fn clear(&mut self) {
        self.product_count = 0;
        self.products.clear();
    }
}

/// Processing state of a machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    #[default]
    Idle,
    Processing,
}

/// A consumer/producer that takes a product, holds it for `processing_time`
/// milliseconds, then emits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub state: MachineState,
    #[serde(default)]
    pub product_count: u32,
    pub processing_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_product_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_queue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_queue_id: Option<String>,
}

impl Machine {
    pub fn new(id: impl Into<String>, x: f64, y: f64, processing_time: u64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            state: MachineState::Idle,
            product_count: 0,
            processing_time: processing_time.max(1),
            current_product_color: None,
            input_queue_id: None,
            output_queue_id: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == MachineState::Idle
    }

    /// Enter `processing` with the given display color.
    pub fn begin_processing(&mut self, color: impl Into<String>) {
        self.state = MachineState::Processing;
        self.current_product_color = Some(color.into());
        self.product_count += 1;
    }

    /// Return to `idle`; the color is present only while processing.
    pub fn finish_processing(&mut self) {
        self.state = MachineState::Idle;
        self.current_product_color = None;
    }
}

/// A directed edge between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source_id: String,
    pub source_type: EntityKind,
    pub target_id: String,
    pub target_type: EntityKind,
}

impl Connection {
    pub fn new(id: impl Into<String>, source: EntityRef, target: EntityRef) -> Self {
        Self {
            id: id.into(),
            source_id: source.id,
            source_type: source.kind,
            target_id: target.id,
            target_type: target.kind,
        }
    }

    pub fn source(&self) -> EntityRef {
        EntityRef::new(self.source_type, self.source_id.clone())
    }

    pub fn target(&self) -> EntityRef {
        EntityRef::new(self.target_type, self.target_id.clone())
    }

    /// Whether either endpoint is the given entity.
    pub fn touches(&self, entity: &EntityRef) -> bool {
        (self.source_type == entity.kind && self.source_id == entity.id)
            || (self.target_type == entity.kind && self.target_id == entity.id)
    }
}

/// Orders ids like `C2` before `C10`: by alphabetic prefix, then by the
/// numeric suffix, then lexically.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    fn split(s: &str) -> (&str, Option<u64>) {
        let idx = s
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        let (prefix, digits) = s.split_at(idx);
        (prefix, digits.parse().ok())
    }

    let (pa, na) = split(a);
    let (pb, nb) = split(b);
    pa.cmp(pb)
        .then_with(|| match (na, nb) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => Ordering::Equal,
        })
        .then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn product(id: &str) -> Product {
        Product {
            id: id.to_string(),
            color: "#ef4444".to_string(),
        }
    }

    #[test]
    fn tracked_queue_keeps_products_fifo() {
        let mut q = Queue::new("Q0", 0.0, 0.0);
        q.push_product(product("P1"));
        q.push_product(product("P2"));
        assert!(q.is_tracked());

        let taken = q.take_product().unwrap();
        assert_eq!(taken.id, "P1");
        assert_eq!(q.product_count, 1);
        assert!(q.is_tracked());
    }

    #[test]
    fn summarized_queue_stays_summarized() {
        let mut q = Queue::new("Q0", 0.0, 0.0);
        q.set_count(4);
        assert!(!q.is_tracked());

        q.push_product(product("P1"));
        assert_eq!(q.product_count, 5);
        assert!(q.products.is_empty());

        assert!(q.take_product().is_none());
        assert_eq!(q.product_count, 4);
    }

    #[test]
    fn take_from_empty_queue_is_noop() {
        let mut q = Queue::new("Q0", 0.0, 0.0);
        assert!(q.take_product().is_none());
        assert_eq!(q.product_count, 0);
    }

    #[test]
    fn machine_color_only_while_processing() {
        let mut m = Machine::new("M1", 0.0, 0.0, 1000);
        m.begin_processing("#22c55e");
        assert_eq!(m.state, MachineState::Processing);
        assert!(m.current_product_color.is_some());
        assert_eq!(m.product_count, 1);

        m.finish_processing();
        assert!(m.is_idle());
        assert!(m.current_product_color.is_none());
    }

    #[test]
    fn kind_parses_plural_path_segments() {
        assert_eq!("queues".parse::<EntityKind>(), Ok(EntityKind::Queue));
        assert_eq!("machine".parse::<EntityKind>(), Ok(EntityKind::Machine));
        assert!("belts".parse::<EntityKind>().is_err());
    }

    #[test]
    fn natural_ordering_of_ids() {
        assert_eq!(natural_cmp("C2", "C10"), Ordering::Less);
        assert_eq!(natural_cmp("C10", "C10"), Ordering::Equal);
        assert_eq!(natural_cmp("M1", "Q0"), Ordering::Less);
        assert_eq!(natural_cmp("C", "C1"), Ordering::Less);
    }

    proptest! {
        #[test]
        fn queue_forms_never_mix(ops in proptest::collection::vec(0u8..3, 0..40), start in 0u32..4) {
            let mut q = Queue::new("Q0", 0.0, 0.0);
            q.set_count(start);
            let mut expected = start;
            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    0 => {
                        q.push_product(product(&format!("P{i}")));
                        expected += 1;
                    }
                    1 => {
                        q.take_product();
                        expected = expected.saturating_sub(1);
                    }
                    _ => {
                        q.set_count(expected);
                    }
                }
                prop_assert_eq!(q.product_count, expected);
                prop_assert!(q.is_tracked() || q.products.is_empty());
            }
        }

        #[test]
        fn natural_cmp_is_antisymmetric(a in 0u64..200, b in 0u64..200) {
            let (x, y) = (format!("C{a}"), format!("C{b}"));
            prop_assert_eq!(natural_cmp(&x, &y), a.cmp(&b));
            prop_assert_eq!(natural_cmp(&x, &y), natural_cmp(&y, &x).reverse());
        }
    }
}
