//! Request/response operations against a simulation backend.
//!
//! Every call answers with an [`ApiResponse`]; a refusal is `success: false`
//! with a message, never an `Err` or a panic. Implementations: the in-process
//! [`LocalBackend`](crate::backend::LocalBackend), or any network client
//! that speaks the same envelope.

use async_trait::async_trait;
use prodline_model::{
    ApiResponse, Connection, ConnectionRequest, EntityRef, Machine, Queue, SimulationState,
    Snapshot,
};

#[async_trait]
pub trait SimulationApi: Send + Sync {
    async fn get_state(&self) -> ApiResponse<SimulationState>;

    async fn create_queue(&self, x: f64, y: f64) -> ApiResponse<Queue>;

    async fn create_machine(&self, x: f64, y: f64) -> ApiResponse<Machine>;

    async fn create_connection(&self, request: ConnectionRequest) -> ApiResponse<Connection>;

    /// Remove a queue or machine and every connection touching it.
    async fn delete_element(&self, entity: &EntityRef) -> ApiResponse<()>;

    async fn delete_connection(&self, id: &str) -> ApiResponse<()>;

    async fn update_position(&self, entity: &EntityRef, x: f64, y: f64) -> ApiResponse<()>;

    async fn start(&self) -> ApiResponse<()>;

    async fn stop(&self) -> ApiResponse<()>;

    /// Stop, zero every count, start again.
    async fn restart(&self) -> ApiResponse<SimulationState>;

    /// Stop and discard everything.
    async fn new_simulation(&self) -> ApiResponse<SimulationState>;

    async fn list_snapshots(&self) -> ApiResponse<Vec<Snapshot>>;

    async fn create_snapshot(&self, label: Option<String>) -> ApiResponse<Snapshot>;

    /// Load a snapshot by id or label, backing up the live session first.
    async fn replay_snapshot(&self, id: &str) -> ApiResponse<SimulationState>;

    /// Leave replay and restore the backed-up live session.
    async fn return_to_live(&self) -> ApiResponse<SimulationState>;
}
