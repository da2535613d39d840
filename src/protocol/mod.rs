//! MCP protocol layer
//!
//! - `dispatcher`: JSON-RPC routing and per-session state
//! - `tools`: the static tool registry and its handlers

pub mod dispatcher;
pub mod tools;

pub use dispatcher::{Dispatcher, Session, SessionState};
pub use tools::{ToolError, ToolRegistry, TOOLS};
