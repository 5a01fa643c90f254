//! Loop-detection sidecar client. The sidecar is an out-of-process
//! embedding service reachable only over a Unix-domain socket; each check is
//! a single unary exchange bounded by a per-call deadline. Callers fail open
//! on any error.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Result, SentinelError};

pub const DEFAULT_SIDECAR_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Serialize)]
struct CheckLoopRequest<'a> {
    tenant_id: &'a str,
    prompt: &'a str,
}

/// Sidecar verdict. Only `loop_detected` drives request mutation; the rest
/// is diagnostic.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LoopCheck {
    #[serde(default)]
    pub loop_detected: bool,
    #[serde(default)]
    pub max_similarity: f64,
    #[serde(default)]
    pub similar_prompt: String,
}

#[async_trait]
pub trait LoopDetector: Send + Sync {
    async fn check_loop(&self, tenant: &str, prompt: &str) -> Result<LoopCheck>;
}

/// Unary JSON-over-UDS client: one request line out, one response line back.
#[cfg(unix)]
#[derive(Clone, Debug)]
pub struct UdsLoopClient {
    socket_path: PathBuf,
    deadline: Duration,
}

#[cfg(unix)]
impl UdsLoopClient {
    pub fn new(socket_path: impl Into<PathBuf>, deadline: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            deadline,
        }
    }

    async fn exchange(&self, tenant: &str, prompt: &str) -> Result<LoopCheck> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let mut stream = tokio::net::UnixStream::connect(&self.socket_path).await?;
        let mut request = serde_json::to_vec(&CheckLoopRequest {
            tenant_id: tenant,
            prompt,
        })?;
        request.push(b'\n');
        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(SentinelError::Sidecar(
                "sidecar closed connection without a response".to_string(),
            ));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

#[cfg(unix)]
#[async_trait]
impl LoopDetector for UdsLoopClient {
    async fn check_loop(&self, tenant: &str, prompt: &str) -> Result<LoopCheck> {
        if tenant.is_empty() || prompt.is_empty() {
            return Ok(LoopCheck::default());
        }
        tokio::time::timeout(self.deadline, self.exchange(tenant, prompt))
            .await
            .map_err(|_| {
                SentinelError::Sidecar(format!(
                    "loop check deadline exceeded after {}ms",
                    self.deadline.as_millis()
                ))
            })?
    }
}
