//! Bidirectional, message-framed JSON-RPC 2.0 transport over a process's
//! standard input and output.
//!
//! Frames are `Content-Length: N\r\n\r\n<body>`. The engine runs three
//! worker threads per transport: a reader (readiness wait on stdin plus a
//! wakeup primitive, frame reassembly, dispatch), a writer (draining a
//! byte-bounded queue with non-blocking writes), and a deadline timer for
//! the request correlation table. Requests return futures that always
//! resolve: with the peer's response, a timeout error, or a
//! transport-closed error.
//!
//! ```no_run
//! use mcp_stdio_transport::StdioTransport;
//! use mcp_stdio_transport::protocol::{JsonRpcRequest, JsonRpcResponse};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let transport = StdioTransport::new();
//! transport.set_request_handler(|req| {
//!     let id = req.id.clone().ok_or_else(|| anyhow::anyhow!("request without id"))?;
//!     Ok(JsonRpcResponse::success(id, serde_json::json!("pong")))
//! });
//! transport.start()?;
//! let response = transport
//!     .send_request(JsonRpcRequest::new("ping", None))
//!     .await;
//! transport.close();
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod framing;
mod pending;
mod queue;
mod reader;
mod sys;
mod transport;
mod wakeup;
mod writer;

pub use mcp_stdio_protocol as protocol;

pub use config::{
    Settings, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_WRITE_QUEUE_MAX_BYTES, ENV_REQUEST_TIMEOUT_MS,
};
pub use error::{Result, TransportError};
pub use framing::{encode, extract, Extracted, FrameError, MAX_CONTENT_LENGTH};
pub use transport::{
    ErrorHandler, NotificationHandler, RequestHandler, ResponseFuture, StdioTransport,
};
