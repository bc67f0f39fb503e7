//! Chat transport seam.
//!
//! The orchestrator only knows how to receive inbound events and send reply
//! chunks. Production wires a real chat platform behind this trait; the
//! bundled stdio transport is enough for local operation and demos.

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// One inbound chat message, already attributed to a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Stable thread key, e.g. "channel:root-timestamp".
    pub thread_id: String,
    pub text: String,
    /// Whether the bot was addressed directly. Channel messages that do not
    /// mention the bot are ignored; thread replies in a live session are not.
    pub is_mention: bool,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Deliver one already-chunked reply to a thread.
    async fn send_reply(&self, thread_id: &str, text: &str) -> Result<()>;
}

/// Writes replies to stdout, prefixed with the thread id.
pub struct StdioTransport;

#[async_trait]
impl ChatTransport for StdioTransport {
    async fn send_reply(&self, thread_id: &str, text: &str) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        let framed = format!("[{}]\n{}\n", thread_id, text);
        stdout.write_all(framed.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}
