//! Async STEP upload client.
//!
//! One client drives one session: connect, login, request an upload plan,
//! stream blocks at the server-assigned block size, and read the final
//! response carrying the server-side content hash.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use serde_json::json;
use steprig_common::ProbeError;
use tokio::net::TcpStream;
use tracing::debug;

use crate::fixtures::md5_hex;
use crate::wire::{
    read_response, request, write_frame, Response, OP_BYE, OP_LOGIN, OP_SAVE, OP_UPLOAD,
    TYPE_AUTH, TYPE_FILE,
};

/// How long to wait for any single server response before giving up.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// Where the protocol service lives and who we claim to be.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub username: String,
}

impl Endpoint {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Result of one upload attempt.
#[derive(Debug, Clone, Default)]
pub struct UploadOutcome {
    /// False when the service rejected the upload with a 4xx status.
    pub accepted: bool,
    pub status: Option<u32>,
    pub status_msg: Option<String>,
    pub server_md5: Option<String>,
    pub bytes_sent: u64,
    pub blocks_sent: u64,
    pub block_size: u64,
}

pub struct StepClient {
    stream: TcpStream,
    token: Option<String>,
}

impl StepClient {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, ProbeError> {
        let stream = TcpStream::connect(endpoint.authority())
            .await
            .map_err(|e| ProbeError::Connect(format!("{}: {e}", endpoint.authority())))?;
        debug!(authority = %endpoint.authority(), "connected to service");
        Ok(Self {
            stream,
            token: None,
        })
    }

    /// Log in. The password is the lowercase hex MD5 of the username, as the
    /// protocol fixes it. Returns the raw response so callers can assert on
    /// the rejection class; the session token is retained on acceptance.
    pub async fn login(&mut self, username: &str) -> Result<Response, ProbeError> {
        let password = md5_hex(username.as_bytes());
        let msg = request(
            OP_LOGIN,
            TYPE_AUTH,
            None,
            json!({ "username": username, "password": password }),
        );
        self.send(&msg, &[]).await?;
        let response = self.recv().await?;
        if !response.is_rejection() {
            self.token = response.token.clone();
        }
        Ok(response)
    }

    /// Upload `path` under `key`. `corrupt_block` flips one byte of that
    /// block's payload in flight (tamper-detection probes).
    pub async fn upload(
        &mut self,
        path: &Path,
        key: &str,
        corrupt_block: Option<u64>,
    ) -> Result<UploadOutcome, ProbeError> {
        let file_size = std::fs::metadata(path)
            .map_err(|e| ProbeError::Transfer(format!("stat {}: {e}", path.display())))?
            .len();

        // Ask for an upload plan.
        let msg = request(
            OP_SAVE,
            TYPE_FILE,
            self.token.as_deref(),
            json!({ "key": key, "size": file_size }),
        );
        self.send(&msg, &[]).await?;
        let plan = self.recv().await?;
        if plan.is_rejection() {
            return Ok(UploadOutcome {
                accepted: false,
                status: plan.status,
                status_msg: plan.status_msg,
                ..Default::default()
            });
        }

        let block_size = plan
            .block_size
            .filter(|&b| b > 0)
            .ok_or_else(|| ProbeError::Transfer("upload plan missing block_size".into()))?;
        let total_blocks = plan
            .total_block
            .ok_or_else(|| ProbeError::Transfer("upload plan missing total_block".into()))?;
        let key = plan.key.unwrap_or_else(|| key.to_string());

        debug!(key, file_size, block_size, total_blocks, "upload plan received");

        let mut file = std::fs::File::open(path)
            .map_err(|e| ProbeError::Transfer(format!("open {}: {e}", path.display())))?;

        let mut outcome = UploadOutcome {
            accepted: true,
            block_size,
            ..Default::default()
        };

        // A zero-byte file has a zero-block plan; a single empty block
        // elicits the completion response carrying the hash.
        let send_blocks = total_blocks.max(1);

        for block_idx in 0..send_blocks {
            let mut data = read_block(&mut file, file_size, block_size, block_idx)
                .map_err(|e| ProbeError::Transfer(format!("read block {block_idx}: {e}")))?;

            if corrupt_block == Some(block_idx) {
                if let Some(byte) = data.first_mut() {
                    *byte ^= 0xff;
                }
            }

            let msg = request(
                OP_UPLOAD,
                TYPE_FILE,
                self.token.as_deref(),
                json!({ "key": key, "block_index": block_idx }),
            );
            self.send(&msg, &data).await?;
            let response = self.recv().await?;

            if response.is_rejection() {
                return Err(ProbeError::Transfer(format!(
                    "block {block_idx} rejected: {} (status {:?})",
                    response.status_msg.unwrap_or_default(),
                    response.status
                )));
            }

            outcome.bytes_sent += data.len() as u64;
            outcome.blocks_sent += 1;
            outcome.status = response.status;
            outcome.status_msg = response.status_msg.clone();

            if response.md5.is_some() {
                outcome.server_md5 = response.md5;
                break;
            }
        }

        if outcome.server_md5.is_none() {
            return Err(ProbeError::Transfer(
                "transfer finished without a server hash".into(),
            ));
        }
        Ok(outcome)
    }

    /// Best-effort session teardown; the server sees an orderly goodbye.
    pub async fn bye(&mut self) {
        let msg = request(OP_BYE, TYPE_AUTH, self.token.as_deref(), json!({}));
        let _ = write_frame(&mut self.stream, &msg, &[]).await;
    }

    async fn send(&mut self, msg: &serde_json::Value, bin: &[u8]) -> Result<(), ProbeError> {
        write_frame(&mut self.stream, msg, bin)
            .await
            .map_err(|e| ProbeError::Transfer(format!("send: {e}")))
    }

    async fn recv(&mut self) -> Result<Response, ProbeError> {
        match tokio::time::timeout(RESPONSE_TIMEOUT, read_response(&mut self.stream)).await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => Err(ProbeError::Transfer(format!("recv: {e}"))),
            Err(_) => Err(ProbeError::Transfer(format!(
                "no response within {}s",
                RESPONSE_TIMEOUT.as_secs()
            ))),
        }
    }
}

/// Read block `idx` of `file`, honoring the final partial tail.
fn read_block(
    file: &mut std::fs::File,
    file_size: u64,
    block_size: u64,
    idx: u64,
) -> std::io::Result<Vec<u8>> {
    let offset = idx * block_size;
    let remaining = file_size.saturating_sub(offset);
    let len = remaining.min(block_size) as usize;

    let mut data = vec![0u8; len];
    if len > 0 {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data)?;
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_block_handles_partial_tail() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&vec![7u8; 2500]).unwrap();

        let b0 = read_block(&mut f, 2500, 1024, 0).unwrap();
        let b2 = read_block(&mut f, 2500, 1024, 2).unwrap();
        assert_eq!(b0.len(), 1024);
        assert_eq!(b2.len(), 452);
    }

    #[test]
    fn read_block_of_empty_file_is_empty() {
        let mut f = tempfile::tempfile().unwrap();
        let b = read_block(&mut f, 0, 1024, 0).unwrap();
        assert!(b.is_empty());
    }
}
