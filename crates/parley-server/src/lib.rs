//! # parley-server
//!
//! Connection hub, session pumps and the cache-aside delivery pipeline.
//!
//! - Hub: a single task owns the session registry and performs fan-out
//! - Pumps: per-session send and receive loops with deadlines and keepalive
//! - Pipeline: store-then-cache writes, cache-then-store reads with backfill
//! - Axum surface: `/ws`, `/health`, `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod backfill;
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod health;
pub mod hub;
pub mod janitor;
pub mod metrics;
pub mod pipeline;
pub mod pump;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod telemetry;
pub mod transport;

pub use connection::{ConnectionService, SessionHandle};
pub use dispatch::{ChatDispatcher, RoomDirectory, StaticRooms};
pub use errors::{HubError, PipelineError, ServerError, TransportError};
pub use hub::{FanoutReport, Hub, HubHandle};
pub use pipeline::DeliveryPipeline;
pub use pump::{InboundHandler, PumpConfig};
pub use server::{ParleyServer, ServerDeps};
pub use session::Session;
pub use transport::Frame;
