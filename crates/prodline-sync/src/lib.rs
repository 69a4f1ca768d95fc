//! Diagram Synchronization Engine
//!
//! Keeps a visual diagram of a producer/consumer network in step with an
//! authoritative simulation state.
//!
//! # Architecture
//!
//! - **Store**: the single canonical `SimulationState`, patched atomically
//! - **Normalizer**: turns push-events into store mutations and effects
//! - **Stream**: reflects a remote push subscription into the normalizer
//! - **Simulation**: local fallback engine speaking the same event vocabulary
//! - **Scene**: reconciles the state into a persistent scene graph
//! - **Interaction**: turns pointer gestures into intents
//! - **Session**: wires one source, the scene and the intents together
//!
//! # Usage
//!
//! ```ignore
//! let mut session = Session::local(SyncConfig::from_env()?)?;
//! session.set_mode(PlacementMode::Queue);
//! session.pointer_down(120.0, 80.0).await;
//! session.start().await;
//! loop {
//!     let report = session.wait().await;
//!     redraw(session.scene(), &report);
//! }
//! ```

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod geometry;
pub mod interaction;
pub mod scene;
pub mod session;
pub mod simulation;
pub mod store;
pub mod stream;

pub use api::SimulationApi;
pub use backend::LocalBackend;
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use events::{Applied, Effect, Normalizer, Reduction, StreamEvent};
pub use interaction::{Intent, InteractionController, PlacementMode};
pub use scene::{ObjectHandle, ReconcileReport, SceneGraph, SceneKey, SceneKind, SceneObject, Shape};
pub use session::{Session, UiStatus};
pub use simulation::{LocalEngine, TickReport, PALETTE};
pub use store::{StateChange, StateStore};
pub use stream::{Connectivity, RemoteStream, TransportSignal, RECONNECT_PENDING};
