//! In-process mock STEP service for integration tests.
//!
//! Implements just enough of the protocol for the probe suite: login with
//! MD5-of-username passwords, upload plans, block reassembly with a final
//! content hash, and a configurable repeat-upload policy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::fixtures::md5_hex;
use crate::wire::{pack, read_frame};

/// What the mock does when a key is uploaded a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatPolicy {
    Overwrite,
    Reject,
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Server-assigned block size for every upload plan.
    pub block_size: u64,
    /// Usernames the mock refuses regardless of password.
    pub deny_users: Vec<String>,
    pub repeat_policy: RepeatPolicy,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            block_size: 20480,
            deny_users: vec![],
            repeat_policy: RepeatPolicy::Overwrite,
        }
    }
}

#[derive(Default)]
struct Store {
    /// Completed uploads by key.
    files: HashMap<String, Vec<u8>>,
}

/// A mock STEP server bound to an ephemeral localhost port.
pub struct MockStepServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
    store: Arc<Mutex<Store>>,
}

impl MockStepServer {
    pub async fn start(config: MockConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let store = Arc::new(Mutex::new(Store::default()));

        let accept_store = store.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let config = config.clone();
                let store = accept_store.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, config, store).await;
                });
            }
        });

        Ok(Self {
            addr,
            handle,
            store,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The reassembled bytes stored under `key`, if the upload completed.
    pub fn stored(&self, key: &str) -> Option<Vec<u8>> {
        self.store.lock().unwrap().files.get(key).cloned()
    }
}

impl Drop for MockStepServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Upload {
    expected_size: u64,
    buf: Vec<u8>,
}

async fn serve_connection(
    mut stream: TcpStream,
    config: MockConfig,
    store: Arc<Mutex<Store>>,
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut authed = false;
    let mut uploads: HashMap<String, Upload> = HashMap::new();

    loop {
        let (msg, bin) = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return Ok(()), // peer went away
        };

        let op = msg["operation"].as_str().unwrap_or_default().to_string();
        let reply: Value = match op.as_str() {
            "LOGIN" => {
                let user = msg["username"].as_str().unwrap_or_default();
                let pass = msg["password"].as_str().unwrap_or_default();
                let denied = config.deny_users.iter().any(|u| u == user);
                if !denied && pass == md5_hex(user.as_bytes()) {
                    authed = true;
                    json!({
                        "status": 200,
                        "status_msg": "login ok",
                        "token": format!("tok-{user}"),
                    })
                } else {
                    json!({ "status": 401, "status_msg": "authentication failed" })
                }
            }
            "SAVE" => {
                let key = msg["key"].as_str().unwrap_or_default().to_string();
                let size = msg["size"].as_u64().unwrap_or(0);
                if !authed {
                    json!({ "status": 403, "status_msg": "not logged in" })
                } else if config.repeat_policy == RepeatPolicy::Reject
                    && store.lock().unwrap().files.contains_key(&key)
                {
                    json!({ "status": 409, "status_msg": "key already exists" })
                } else {
                    let total_block = size.div_ceil(config.block_size);
                    uploads.insert(
                        key.clone(),
                        Upload {
                            expected_size: size,
                            buf: Vec::with_capacity(size as usize),
                        },
                    );
                    json!({
                        "status": 200,
                        "status_msg": "upload plan",
                        "key": key,
                        "size": size,
                        "total_block": total_block,
                        "block_size": config.block_size,
                    })
                }
            }
            "UPLOAD" => {
                let key = msg["key"].as_str().unwrap_or_default().to_string();
                match uploads.get_mut(&key) {
                    None => json!({ "status": 404, "status_msg": "no upload plan for key" }),
                    Some(upload) => {
                        upload.buf.extend_from_slice(&bin);
                        if upload.buf.len() as u64 >= upload.expected_size {
                            let done = uploads.remove(&key).unwrap();
                            let md5 = md5_hex(&done.buf);
                            store.lock().unwrap().files.insert(key, done.buf);
                            json!({
                                "status": 200,
                                "status_msg": "upload complete",
                                "md5": md5,
                            })
                        } else {
                            json!({ "status": 200, "status_msg": "block received" })
                        }
                    }
                }
            }
            "BYE" => {
                let frame = pack(&json!({ "status": 200, "status_msg": "bye" }), &[])?;
                let _ = stream.write_all(&frame).await;
                return Ok(());
            }
            _ => json!({ "status": 400, "status_msg": "unknown operation" }),
        };

        stream.write_all(&pack(&reply, &[])?).await?;
    }
}
