//! Producer/Consumer Network Model
//!
//! The data model shared by every part of the diagram pipeline: queues that
//! hold products, machines that consume from queues and produce into queues,
//! and directed connections between them.
//!
//! # Representation
//!
//! A [`SimulationState`] is the whole aggregate. It is always replaced or
//! patched as a unit; nothing in this crate mutates shared state on its own.
//!
//! Queues carry two views of their contents:
//! - `productCount`, always present
//! - `products`, the individual products, present only while *tracked*
//!
//! A queue is tracked when `products.len() == productCount`. Updates that only
//! know the count drop the product list instead of letting the two disagree.
//!
//! # Wire format
//!
//! All types serialize with camelCase field names so that a remote backend
//! and the local engine speak the same JSON.

mod entity;
mod error;
mod state;
mod wire;

pub use entity::{
    natural_cmp, Connection, EntityKind, EntityRef, Machine, MachineState, Product, Queue,
};
pub use error::{ModelError, Result};
pub use state::{SimulationState, Snapshot};
pub use wire::{
    ApiResponse, ConnectionRequest, FlashPayload, PositionRequest, QueueEventKind,
    QueueEventPayload, SnapshotRequest, StreamMessage,
};

/// Milliseconds since the Unix epoch, used for snapshot and message timestamps.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
