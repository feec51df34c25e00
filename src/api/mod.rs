//! JSON-RPC-over-WebSocket API.
//!
//! - [`rpc`] - envelope types and wire error codes
//! - [`handler`] - method dispatch and generated-snapshot lifecycle
//! - [`server`] - the axum WebSocket endpoint

pub mod handler;
pub mod rpc;
pub mod server;

pub use handler::RequestHandler;
pub use rpc::{RpcError, RpcRequest, RpcResponse, codes};
pub use server::serve;
