//! Remote buffer tiers: read folders, read servers and one write server
//!
//! Protocol per server:
//! - `GET <server>/<hex>` returns the raw buffer
//! - `GET <server>/has` with a JSON list of hex checksums as body returns a JSON list of booleans
//! - `PUT <server>/<hex>` stores the raw buffer

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use tracing::{debug, warn};

use crate::checksum::{calculate_checksum, Buffer, Checksum};
use crate::error::{Result, SeamlessError};
use crate::logging::{operations, services, status};
use crate::storage::{BufferStore, FolderStore};

/// What one read server made of a download
enum Download {
    Found(Buffer),
    /// The server answered but does not hold the buffer
    Absent,
    Unavailable,
}

pub struct BufferRemote {
    client: Client,
    read_folders: Vec<FolderStore>,
    read_servers: Vec<String>,
    write_server: Option<String>,
    /// Buffers that some remote tier is known to hold
    known: Mutex<HashSet<Checksum>>,
    /// Buffers already sent to the write server
    written: Mutex<HashSet<Checksum>>,
}

impl BufferRemote {
    pub fn new(
        read_servers: Vec<String>,
        read_folders: Vec<PathBuf>,
        write_server: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            read_folders: read_folders.into_iter().map(FolderStore::read_only).collect(),
            read_servers: read_servers
                .into_iter()
                .map(|s| s.trim_end_matches('/').to_string())
                .collect(),
            write_server: write_server.map(|s| s.trim_end_matches('/').to_string()),
            known: Mutex::new(HashSet::new()),
            written: Mutex::new(HashSet::new()),
        })
    }

    /// A remote with no tiers configured
    pub fn disabled() -> Self {
        Self {
            client: Client::new(),
            read_folders: Vec::new(),
            read_servers: Vec::new(),
            write_server: None,
            known: Mutex::new(HashSet::new()),
            written: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.read_folders.is_empty() || !self.read_servers.is_empty() || self.write_server.is_some()
    }

    pub fn can_write(&self) -> bool {
        self.write_server.is_some()
    }

    /// Retrieve a buffer: read folders first, then read servers, in order
    ///
    /// A miss is `Ok(None)` as long as one server answered. When every read
    /// server was unreachable or failing, the lookup is a connection error.
    pub async fn get_buffer(&self, checksum: &Checksum) -> Result<Option<Buffer>> {
        for folder in &self.read_folders {
            match folder.get(checksum) {
                Ok(Some(buffer)) => {
                    self.mark_known(checksum);
                    return Ok(Some(buffer));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(folder = %folder.root().display(), error = %e, "Buffer folder read failed");
                }
            }
        }

        let mut answered = false;
        for server in &self.read_servers {
            match self.download(server, checksum).await {
                Download::Found(buffer) => {
                    self.mark_known(checksum);
                    return Ok(Some(buffer));
                }
                Download::Absent => answered = true,
                Download::Unavailable => {}
            }
        }
        if self.read_servers.is_empty() || answered {
            return Ok(None);
        }
        Err(SeamlessError::Connection {
            service: services::BUFFER_SERVER.to_string(),
        })
    }

    async fn download(&self, server: &str, checksum: &Checksum) -> Download {
        let url = format!("{}/{}", server, checksum.to_hex());
        let mut previous: Option<Checksum> = None;
        // A server may be mid-write; one changed retry is allowed before giving up
        loop {
            let response = match self.client.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(service = services::BUFFER_SERVER, server, error = %e, "Buffer server unreachable");
                    return Download::Unavailable;
                }
            };
            if response.status().is_server_error() {
                return Download::Unavailable;
            }
            if response.status().is_client_error() {
                return Download::Absent;
            }
            let buffer = match response.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    debug!(service = services::BUFFER_SERVER, server, error = %e, "Buffer download failed");
                    return Download::Unavailable;
                }
            };
            let actual = calculate_checksum(&buffer);
            if actual == *checksum {
                debug!(
                    service = services::BUFFER_SERVER,
                    operation = operations::GET,
                    checksum = %checksum.short(),
                    size_bytes = buffer.len(),
                    "Downloaded buffer"
                );
                return Download::Found(buffer);
            }
            if previous != Some(actual) {
                previous = Some(actual);
                continue;
            }
            warn!(server, checksum = %checksum, "Buffer server returned wrong content");
            return Download::Absent;
        }
    }

    /// Ask one server whether it holds a buffer; `None` if the server cannot answer
    pub async fn has(&self, server: &str, checksum: &Checksum) -> Option<bool> {
        let body = serde_json::to_string(&vec![checksum.to_hex()]).ok()?;
        let response = self
            .client
            .get(format!("{server}/has"))
            .body(body)
            .send()
            .await
            .ok()?;
        if response.status().is_client_error() || response.status().is_server_error() {
            return None;
        }
        let answer: Vec<bool> = response.json().await.ok()?;
        match answer.as_slice() {
            [present] => Some(*present),
            _ => None,
        }
    }

    /// Query folders and servers directly
    pub async fn remote_has_checksum(&self, checksum: &Checksum) -> bool {
        for folder in &self.read_folders {
            if folder.exists(checksum).unwrap_or(false) {
                self.mark_known(checksum);
                return true;
            }
        }
        for server in &self.read_servers {
            if self.has(server, checksum).await == Some(true) {
                self.mark_known(checksum);
                return true;
            }
        }
        false
    }

    /// Known locally to be held remotely, without asking
    pub fn is_known(&self, checksum: &Checksum) -> bool {
        let known = self.known.lock().map(|k| k.contains(checksum)).unwrap_or(false);
        known || self.written.lock().map(|w| w.contains(checksum)).unwrap_or(false)
    }

    pub async fn can_read_buffer(&self, checksum: &Checksum) -> bool {
        self.is_known(checksum) || self.remote_has_checksum(checksum).await
    }

    fn mark_known(&self, checksum: &Checksum) {
        if let Ok(mut known) = self.known.lock() {
            known.insert(*checksum);
        }
    }

    /// Upload a buffer to the write server, once per checksum
    ///
    /// Callers treat failures as non-fatal.
    pub async fn write_buffer(&self, checksum: &Checksum, buffer: &[u8]) -> Result<()> {
        let Some(server) = self.write_server.as_deref() else {
            return Ok(());
        };
        {
            let mut written = self
                .written
                .lock()
                .map_err(|_| anyhow::anyhow!("written-buffer set poisoned"))?;
            if !written.insert(*checksum) {
                return Ok(());
            }
        }
        if self.has(server, checksum).await == Some(true) {
            return Ok(());
        }

        let url = format!("{}/{}", server, checksum.to_hex());
        let response = self
            .client
            .put(&url)
            .body(buffer.to_vec())
            .send()
            .await
            .map_err(|e| {
                self.unmark_written(checksum);
                debug!(service = services::BUFFER_SERVER, error = %e, "Buffer upload failed");
                SeamlessError::Connection {
                    service: services::BUFFER_SERVER.to_string(),
                }
            })?;

        if !response.status().is_success() {
            self.unmark_written(checksum);
            let code = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("buffer server refused {checksum}: {code} {text}").into());
        }
        debug!(
            service = services::BUFFER_SERVER,
            operation = operations::PUT,
            status = status::SUCCESS,
            checksum = %checksum.short(),
            size_bytes = buffer.len(),
            "Uploaded buffer"
        );
        Ok(())
    }

    fn unmark_written(&self, checksum: &Checksum) {
        if let Ok(mut written) = self.written.lock() {
            written.remove(checksum);
        }
    }
}
