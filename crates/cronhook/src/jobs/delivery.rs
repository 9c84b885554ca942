//! Outbound webhook delivery.

use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Upper bound for a single delivery attempt.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Response bodies longer than this are cut before landing in `last_error`.
const MAX_ERROR_BODY_CHARS: usize = 2048;

/// At most this much of an error response is read off the wire.
const MAX_ERROR_BODY_BYTES: usize = MAX_ERROR_BODY_CHARS * 4;

const USER_AGENT: &str = concat!("cronhook/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("request timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Request failed with status code {status}")]
    Status { status: u16, body: Option<String> },

    #[error("{0}")]
    Transport(String),
}

impl DeliveryError {
    /// Text stored in `last_error`: the target's response body when it sent
    /// one, the transport-level message otherwise.
    pub fn summary(&self) -> String {
        match self {
            DeliveryError::Status {
                body: Some(body), ..
            } => body.clone(),
            other => other.to_string(),
        }
    }
}

/// Issues one webhook call. Implementations must bound the call in time.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, url: &str, payload: &Value) -> Result<(), DeliveryError>;
}

/// `reqwest`-backed sender: POST with a JSON body and a fixed timeout.
#[derive(Clone)]
pub struct HttpWebhookSender {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpWebhookSender {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_timeout(DELIVERY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, url: &str, payload: &Value) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = match read_capped(response).await {
            Ok((bytes, cut_short)) => error_body(&String::from_utf8_lossy(&bytes), cut_short),
            Err(e) if e.is_timeout() => return Err(DeliveryError::Timeout(self.timeout)),
            Err(_) => None,
        };

        Err(DeliveryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl HttpWebhookSender {
    fn classify(&self, err: reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            return DeliveryError::Timeout(self.timeout);
        }

        // reqwest's top-level message is generic; the cause chain names the
        // actual problem (refused connection, DNS, TLS, ...).
        let mut msg = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            msg.push_str(": ");
            msg.push_str(&cause.to_string());
            source = cause.source();
        }
        DeliveryError::Transport(msg)
    }
}

/// Reads the body chunk by chunk, stopping at [`MAX_ERROR_BODY_BYTES`].
/// The flag is set when the body was longer than that.
async fn read_capped(mut response: reqwest::Response) -> Result<(Vec<u8>, bool), reqwest::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = MAX_ERROR_BODY_BYTES - buf.len();
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            return Ok((buf, true));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok((buf, false))
}

fn error_body(text: &str, cut_short: bool) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Structured bodies are re-serialized compactly.
    if !cut_short {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            return Some(truncate(json.to_string(), false));
        }
    }
    Some(truncate(trimmed.to_string(), cut_short))
}

fn truncate(mut s: String, cut_short: bool) -> String {
    let cut = match s.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => {
            s.truncate(idx);
            true
        }
        None => cut_short,
    };
    if cut {
        s.push('…');
    }
    s
}
