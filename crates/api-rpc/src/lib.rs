//! JSON-RPC API Layer
//!
//! Administrative surface of the Scanfleet daemon: ad-hoc scans, schedules,
//! job and batch inspection, catalog maintenance.

pub mod error;
pub mod handler;
pub mod server;
pub mod types;

pub use handler::{RpcDeps, RpcHandler};
pub use server::{build_module, RpcServer, RpcServerConfig, DEFAULT_RPC_BIND};
