//! The external surface of axiom: a stdio JSON-lines tool transport plus
//! read-only resource documents.

pub mod handler;
pub mod protocol;
pub mod resources;
pub mod transport;

pub use handler::ToolHandler;
pub use protocol::{ToolRequest, ToolResponse};
pub use transport::StdioTransport;
