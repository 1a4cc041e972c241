//! Local transport-signing IPC.
//!
//! Newline-delimited JSON over a Unix domain socket readable only by the
//! owning user. One request line yields one response line.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use sovereign_core::{Error, Result};

use crate::gateway::{HardwareKeyGateway, SignRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignResponse {
    Signed {
        /// Base64 DER signature
        signature: String,
    },
    Failed {
        error: String,
        code: String,
        retryable: bool,
    },
}

impl SignResponse {
    fn from_result(result: Result<Vec<u8>>) -> Self {
        match result {
            Ok(signature) => SignResponse::Signed {
                signature: STANDARD.encode(signature),
            },
            Err(e) => SignResponse::Failed {
                error: e.to_string(),
                code: e.code().to_string(),
                retryable: e.is_transient(),
            },
        }
    }
}

pub struct IpcServer {
    gateway: Arc<HardwareKeyGateway>,
    path: PathBuf,
}

impl IpcServer {
    pub fn new(gateway: Arc<HardwareKeyGateway>, path: impl Into<PathBuf>) -> Self {
        Self {
            gateway,
            path: path.into(),
        }
    }

    /// Bind the socket, replacing a stale one.
    pub fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let listener = UnixListener::bind(&self.path)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        info!(path = %self.path.display(), "STATUS: Gateway IPC :: LISTENING");
        Ok(listener)
    }

    /// Serve until `shutdown` resolves, then remove the socket.
    pub async fn serve(self, listener: UnixListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let gateway = self.gateway.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(gateway, stream).await {
                            warn!(error = %e, "Gateway IPC :: Connection error");
                        }
                    });
                }
            }
        }
        let _ = std::fs::remove_file(&self.path);
        info!("Gateway IPC :: Stopped");
        Ok(())
    }
}

async fn handle_connection(gateway: Arc<HardwareKeyGateway>, stream: UnixStream) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<SignRequest>(&line) {
            Ok(request) => {
                debug!(hash_alg = ?request.hash_alg, is_digest = request.is_digest, "Gateway IPC :: Sign request");
                SignResponse::from_result(gateway.sign(&request).await)
            }
            Err(e) => SignResponse::from_result(Err(Error::InvalidRequest(e.to_string()))),
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }
    Ok(())
}

/// Client side of the signing socket.
#[derive(Debug, Clone)]
pub struct IpcSignerClient {
    path: PathBuf,
}

impl IpcSignerClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub async fn sign(&self, request: &SignRequest) -> Result<Vec<u8>> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| Error::HardwareUnavailable(format!("gateway socket: {}", e)))?;
        let (read, mut write) = stream.into_split();
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        write.write_all(&line).await?;

        let reply = BufReader::new(read)
            .lines()
            .next_line()
            .await?
            .ok_or_else(|| Error::HardwareUnavailable("gateway closed the connection".to_string()))?;
        match serde_json::from_str::<SignResponse>(&reply)? {
            SignResponse::Signed { signature } => STANDARD
                .decode(signature)
                .map_err(|e| Error::Crypto(format!("signature not base64: {}", e))),
            SignResponse::Failed { error, retryable: true, .. } => {
                Err(Error::HardwareUnavailable(error))
            }
            SignResponse::Failed { error, code, .. } if code == "Unsupported" => {
                Err(Error::Unsupported(error))
            }
            SignResponse::Failed { error, code, .. } if code == "InvalidRequest" => {
                Err(Error::InvalidRequest(error))
            }
            SignResponse::Failed { error, .. } => Err(Error::HardwareFault(error)),
        }
    }
}
