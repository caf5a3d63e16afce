use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use tokio::fs;
use tracing::info;

/// Where image bytes go before their URL is sent as a message.
///
/// Upload happens outside the send queue: the caller stores the blob,
/// gets a URL back, and only then enqueues a message carrying that URL.
/// No resizing or re-encoding happens here.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `name`, return the URL to reference it by.
    async fn put(&self, name: &str, data: Bytes) -> Result<String>;
}

/// Flat-directory store: one file per blob, `file://` URLs.
pub struct DirBlobStore {
    dir: PathBuf,
}

impl DirBlobStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Blob directory: {}", dir.display());
        Ok(Self { dir })
    }
}

#[async_trait]
impl BlobStore for DirBlobStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<String> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            bail!("Invalid blob name: {}", name);
        }

        let path = self.dir.join(name);
        fs::write(&path, &data).await?;
        Ok(format!("file://{}", path.display()))
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.blobs
            .lock()
            .expect("blob lock poisoned")
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<String> {
        self.blobs
            .lock()
            .map_err(|e| anyhow::anyhow!("Blob lock poisoned: {}", e))?
            .insert(name.to_string(), data);
        Ok(format!("mem://{}", name))
    }
}

/// Encode raw image bytes to the base64 body of an inline payload.
pub fn encode_image(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode an inline payload body back to raw bytes.
pub fn decode_image(encoded: &str) -> Result<Vec<u8>> {
    Ok(BASE64.decode(encoded)?)
}
