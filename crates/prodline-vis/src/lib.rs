//! Prodline Visualization Server
//!
//! Hosts a local producer/consumer simulation and serves it the way a remote
//! backend would.
//!
//! # Architecture
//!
//! - **REST API**: placement, wiring, lifecycle and snapshot operations, each
//!   answering with an `ApiResponse` envelope
//! - **WebSocket**: a `STATE_UPDATE` on connect, then every engine event
//! - **Scene**: `/api/scene` projects the reconciled scene graph as JSON
//!
//! # Usage
//!
//! ```ignore
//! let config = VisConfig::from_env()?;
//! let server = VisServer::new(&config)?;
//! server.serve(config.bind_addr).await?;
//! ```

mod config;
mod error;
mod server;

pub use config::{VisConfig, DEFAULT_BIND_ADDR};
pub use error::{Error, Result};
pub use server::{AppState, VisServer};
