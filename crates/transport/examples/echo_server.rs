//! Minimal embedding: a JSON-RPC echo server on stdio.
//!
//! Every request is answered with its own params; notifications and
//! transport errors are logged to stderr (stdout belongs to the protocol).
//!
//! Try it:
//! ```text
//! printf 'Content-Length: 54\r\n\r\n{"jsonrpc":"2.0","id":1,"method":"echo","params":"hi"}' \
//!   | cargo run --example echo_server
//! ```

use std::time::Duration;

use anyhow::Result;
use mcp_stdio_transport::protocol::JsonRpcResponse;
use mcp_stdio_transport::StdioTransport;

fn main() -> Result<()> {
    // Logging to stderr only; stdout carries frames.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let transport = StdioTransport::new();
    transport.set_request_handler(|req| {
        let id = req
            .id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("request without id"))?;
        let params = req.params.unwrap_or(serde_json::Value::Null);
        Ok(JsonRpcResponse::success(id, params))
    });
    transport.set_notification_handler(|note| {
        log::info!("notification: {}", note.method);
    });
    transport.set_error_handler(|message| {
        log::warn!("transport error: {message}");
    });

    transport.start()?;
    log::info!("echo server up, session {}", transport.session_id());

    // Run until the peer goes away (EOF on stdin flips `connected`).
    while transport.is_connected() {
        std::thread::sleep(Duration::from_millis(200));
    }
    transport.close();
    log::info!("echo server stopped");
    Ok(())
}
