//! Line protocol decoder
//!
//! Turns raw lines of agent stdout into JSON payloads. Agents occasionally
//! prefix protocol lines with log noise (`"[agent] {...}"`), so a failed
//! parse is retried from the first `{`.

use crate::agent::runtime::AgentRuntime;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Longest accepted protocol line; agent_end events carry full transcripts
const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;

/// A successfully decoded line
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLine {
    pub payload: Value,
    /// The substring that was actually parsed
    pub line: String,
}

/// Stateless decoder for agent output lines
#[derive(Debug, Clone, Copy, Default)]
pub struct LineDecoder {
    log_errors: bool,
}

impl LineDecoder {
    pub fn new(log_errors: bool) -> Self {
        Self { log_errors }
    }

    /// Decode one raw line; `None` for blank or undecodable lines
    pub fn decode(&self, raw: &str) -> Option<DecodedLine> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let first_err = match serde_json::from_str::<Value>(trimmed) {
            Ok(payload) => {
                return Some(DecodedLine {
                    payload,
                    line: trimmed.to_string(),
                })
            }
            Err(e) => e,
        };

        if let Some(offset) = trimmed.find('{').filter(|&i| i > 0) {
            let candidate = &trimmed[offset..];
            if let Ok(payload) = serde_json::from_str::<Value>(candidate) {
                return Some(DecodedLine {
                    payload,
                    line: candidate.to_string(),
                });
            }
        }

        if self.log_errors {
            let preview: String = trimmed.chars().take(200).collect();
            tracing::debug!("Undecodable agent line: {} (raw: {})", first_err, preview);
        }
        None
    }
}

/// Receives raw lines read from an agent's stdout
#[async_trait]
pub trait LineHandler: Send + Sync {
    async fn handle_line(&self, agent: &Arc<AgentRuntime>, raw: &str);
}

/// Read lines from an agent's stdout until EOF, in order.
///
/// Each line is fully handled before the next one is read, which keeps
/// per-agent event ordering FIFO.
pub async fn pump_lines<R, H>(reader: R, agent: Arc<AgentRuntime>, handler: Arc<H>)
where
    R: AsyncRead + Unpin,
    H: LineHandler + ?Sized,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    while let Some(next) = lines.next().await {
        match next {
            Ok(line) => handler.handle_line(&agent, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(agent_id = %agent.id(), "Discarded oversized agent output line");
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::warn!(agent_id = %agent.id(), "Agent stdout read error: {}", e);
                break;
            }
        }
    }

    tracing::debug!(agent_id = %agent.id(), "Agent stdout closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ReplyPrefixMode};
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_decode_plain_json() {
        let decoded = LineDecoder::default()
            .decode("  {\"type\":\"agent_start\"}  \n")
            .unwrap();
        assert_eq!(decoded.payload, json!({"type": "agent_start"}));
        assert_eq!(decoded.line, "{\"type\":\"agent_start\"}");
    }

    #[test]
    fn test_decode_recovers_prefixed_line() {
        let raw = "[agent] {\"type\":\"response\",\"id\":\"a-1\"}";
        let decoded = LineDecoder::default().decode(raw).unwrap();
        assert_eq!(decoded.payload, json!({"type": "response", "id": "a-1"}));
        assert_eq!(decoded.line, "{\"type\":\"response\",\"id\":\"a-1\"}");
    }

    #[test]
    fn test_decode_ignores_blank_and_garbage() {
        let decoder = LineDecoder::new(true);
        assert!(decoder.decode("").is_none());
        assert!(decoder.decode("   \t").is_none());
        assert!(decoder.decode("loading extensions...").is_none());
        assert!(decoder.decode("[agent] {\"type\":").is_none());
        assert!(decoder.decode("{\"type\":").is_none());
    }

    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl LineHandler for Collect {
        async fn handle_line(&self, _agent: &Arc<AgentRuntime>, raw: &str) {
            self.0.lock().unwrap().push(raw.to_string());
        }
    }

    #[tokio::test]
    async fn test_pump_lines_preserves_order() {
        let agent = Arc::new(AgentRuntime::new(
            AgentConfig::new("nova"),
            ReplyPrefixMode::Always,
        ));
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        let input: &[u8] = b"{\"n\":1}\nnoise\n{\"n\":2}\r\n";

        pump_lines(input, agent, handler.clone()).await;

        let lines = handler.0.lock().unwrap().clone();
        assert_eq!(lines, vec!["{\"n\":1}", "noise", "{\"n\":2}"]);
    }
}
