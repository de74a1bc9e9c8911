//! Checksum database: transformation results, semantic-to-syntactic mappings, metadata
//!
//! The HTTP protocol sends a JSON request body with both GET and PUT:
//! `{"type": ..., "checksum": <hex>, ...}`. A GET answered with 404 means
//! the database does not know the entry.

use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::checksum::Checksum;
use crate::codec::json_dumps;
use crate::error::{Result, SeamlessError};
use crate::logging::{operations, services};
use crate::storage::ResultStore;

const PROTOCOL: [&str; 3] = ["seamless", "database", "0.3"];
const CONNECT_TRIALS: usize = 5;

/// HTTP client for a remote checksum database
pub struct DatabaseClient {
    client: Client,
    url: String,
}

impl DatabaseClient {
    /// Connect and verify the protocol handshake
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let db = Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        };

        let mut last_error = None;
        for trial in 0..CONNECT_TRIALS {
            match db.send(reqwest::Method::GET, &json!({"type": "protocol"})).await {
                Ok((StatusCode::OK, body)) => {
                    let protocol: Json = serde_json::from_slice(&body).unwrap_or(Json::Null);
                    if protocol != json!(PROTOCOL) {
                        return Err(anyhow::anyhow!(
                            "Incorrect Seamless database protocol at {}: {}",
                            db.url,
                            protocol
                        )
                        .into());
                    }
                    info!(service = services::DATABASE, url = %db.url, "Connected to database");
                    return Ok(db);
                }
                Ok((status, body)) => {
                    return Err(SeamlessError::DatabaseRefused {
                        status: status.as_u16(),
                        text: String::from_utf8_lossy(&body).into_owned(),
                    });
                }
                Err(e) => {
                    debug!(service = services::DATABASE, trial, error = %e, "Database connection attempt failed");
                    last_error = Some(e);
                }
            }
        }
        warn!(service = services::DATABASE, url = %db.url, error = ?last_error, "Cannot connect to database");
        Err(SeamlessError::Connection {
            service: services::DATABASE.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, method: reqwest::Method, request: &Json) -> Result<(StatusCode, bytes::Bytes)> {
        let response = self
            .client
            .request(method, &self.url)
            .body(request.to_string())
            .send()
            .await
            .map_err(|_| SeamlessError::Connection {
                service: services::DATABASE.to_string(),
            })?;
        let status = response.status();
        let body = response.bytes().await.context("Failed to read database response")?;
        Ok((status, body))
    }

    /// GET; `None` on 404, error on any other failure status
    async fn get(&self, request: Json) -> Result<Option<bytes::Bytes>> {
        let (status, body) = self.send(reqwest::Method::GET, &request).await?;
        debug!(
            service = services::DATABASE,
            operation = operations::GET,
            kind = request["type"].as_str().unwrap_or(""),
            http_status = status.as_u16(),
            "Database request"
        );
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_client_error() || status.is_server_error() {
            return Err(SeamlessError::DatabaseRefused {
                status: status.as_u16(),
                text: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(Some(body))
    }

    async fn put(&self, request: Json) -> Result<(u16, String)> {
        let (status, body) = self.send(reqwest::Method::PUT, &request).await?;
        Ok((status.as_u16(), String::from_utf8_lossy(&body).into_owned()))
    }

    async fn put_checked(&self, request: Json) -> Result<()> {
        let (status, text) = self.put(request).await?;
        if status != 200 {
            return Err(SeamlessError::DatabaseRefused { status, text });
        }
        Ok(())
    }

    fn parse_checksum(body: &[u8]) -> Result<Checksum> {
        Checksum::from_hex(String::from_utf8_lossy(body).trim())
    }

    fn parse_checksum_list(body: &[u8]) -> Result<Vec<Checksum>> {
        let hexes: Vec<String> = serde_json::from_slice(body)?;
        hexes.iter().map(|h| Checksum::from_hex(h.trim())).collect()
    }
}

/// Database backend: remote HTTP service or local result store
pub enum Database {
    Remote(DatabaseClient),
    Local(ResultStore),
}

impl Database {
    pub fn is_remote(&self) -> bool {
        matches!(self, Database::Remote(_))
    }

    pub async fn get_transformation_result(&self, tf_checksum: &Checksum) -> Result<Option<Checksum>> {
        match self {
            Database::Local(store) => store.get_transformation_result(tf_checksum),
            Database::Remote(client) => {
                let body = client
                    .get(json!({"type": "transformation", "checksum": tf_checksum}))
                    .await?;
                body.map(|b| DatabaseClient::parse_checksum(&b)).transpose()
            }
        }
    }

    pub async fn set_transformation_result(&self, tf_checksum: &Checksum, result: &Checksum) -> Result<()> {
        match self {
            Database::Local(store) => store.set_transformation_result(tf_checksum, result),
            Database::Remote(client) => {
                client
                    .put_checked(json!({
                        "type": "transformation",
                        "checksum": tf_checksum,
                        "value": result,
                    }))
                    .await
            }
        }
    }

    pub async fn get_sem2syn(
        &self,
        semantic: &Checksum,
        celltype: &str,
        subcelltype: Option<&str>,
    ) -> Result<Option<Vec<Checksum>>> {
        match self {
            Database::Local(store) => store.get_sem2syn(semantic, celltype, subcelltype),
            Database::Remote(client) => {
                let body = client
                    .get(json!({
                        "type": "semantic_to_syntactic",
                        "checksum": semantic,
                        "celltype": celltype,
                        "subcelltype": subcelltype,
                    }))
                    .await?;
                body.map(|b| DatabaseClient::parse_checksum_list(&b)).transpose()
            }
        }
    }

    pub async fn set_sem2syn(
        &self,
        semantic: &Checksum,
        celltype: &str,
        subcelltype: Option<&str>,
        syntactic: &[Checksum],
    ) -> Result<()> {
        match self {
            Database::Local(store) => store.set_sem2syn(semantic, celltype, subcelltype, syntactic),
            Database::Remote(client) => {
                let mut hexes: Vec<String> = syntactic.iter().map(Checksum::to_hex).collect();
                hexes.sort();
                hexes.dedup();
                client
                    .put_checked(json!({
                        "type": "semantic_to_syntactic",
                        "checksum": semantic,
                        "celltype": celltype,
                        "subcelltype": subcelltype,
                        "value": hexes,
                    }))
                    .await
            }
        }
    }

    pub async fn get_metadata(&self, tf_checksum: &Checksum) -> Result<Option<Json>> {
        match self {
            Database::Local(store) => store.get_metadata(tf_checksum),
            Database::Remote(client) => {
                let body = client
                    .get(json!({"type": "metadata", "checksum": tf_checksum}))
                    .await?;
                Ok(match body {
                    Some(b) => Some(serde_json::from_slice(&b)?),
                    None => None,
                })
            }
        }
    }

    pub async fn set_metadata(&self, tf_checksum: &Checksum, metadata: &Json) -> Result<()> {
        match self {
            Database::Local(store) => store.set_metadata(tf_checksum, metadata),
            Database::Remote(client) => {
                client
                    .put_checked(json!({
                        "type": "metadata",
                        "checksum": tf_checksum,
                        "value": json_dumps(metadata) + "\n",
                    }))
                    .await
            }
        }
    }

    /// Contest a stored result; returns the status code and response text
    pub async fn contest(&self, tf_checksum: &Checksum, result: &Checksum) -> Result<(u16, String)> {
        match self {
            Database::Local(store) => store.contest(tf_checksum, result),
            Database::Remote(client) => {
                client
                    .put(json!({
                        "type": "contest",
                        "checksum": tf_checksum,
                        "result": result,
                    }))
                    .await
            }
        }
    }

    /// Transformations known to evaluate to `result`
    pub async fn get_rev_transformations(&self, result: &Checksum) -> Result<Vec<Checksum>> {
        match self {
            Database::Local(store) => store.get_rev_transformations(result),
            Database::Remote(client) => {
                let body = client
                    .get(json!({"type": "rev_transformations", "checksum": result}))
                    .await?;
                match body {
                    Some(b) => DatabaseClient::parse_checksum_list(&b),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    /// Persist a failure; only the local store keeps exception and log blobs
    pub async fn set_exception(&self, tf_checksum: &Checksum, exception: &str, logs: &str) -> Result<()> {
        if let Database::Local(store) = self {
            store.set_exception(tf_checksum, exception)?;
            if !logs.is_empty() {
                store.set_logs(tf_checksum, logs)?;
            }
        }
        Ok(())
    }

    pub async fn get_exception(&self, tf_checksum: &Checksum) -> Result<Option<String>> {
        match self {
            Database::Local(store) => store.get_exception(tf_checksum),
            Database::Remote(_) => Ok(None),
        }
    }

    pub async fn set_logs(&self, tf_checksum: &Checksum, logs: &str) -> Result<()> {
        match self {
            Database::Local(store) => store.set_logs(tf_checksum, logs),
            Database::Remote(_) => Ok(()),
        }
    }

    pub async fn get_logs(&self, tf_checksum: &Checksum) -> Result<Option<String>> {
        match self {
            Database::Local(store) => store.get_logs(tf_checksum),
            Database::Remote(_) => Ok(None),
        }
    }

    pub async fn clear_exception(&self, tf_checksum: &Checksum) -> Result<()> {
        match self {
            Database::Local(store) => store.clear_exception(tf_checksum),
            Database::Remote(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::calculate_checksum;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_database_operations() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::Local(ResultStore::open(temp_dir.path()).unwrap());
        assert!(!db.is_remote());

        let tf = calculate_checksum(b"tf");
        let result = calculate_checksum(b"5\n");
        db.set_transformation_result(&tf, &result).await.unwrap();
        assert_eq!(db.get_transformation_result(&tf).await.unwrap(), Some(result));
        assert_eq!(db.get_rev_transformations(&result).await.unwrap(), vec![tf]);

        let (status, _) = db.contest(&tf, &result).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(db.get_transformation_result(&tf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_connection_error() {
        let err = DatabaseClient::connect("http://127.0.0.1:9", Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SeamlessError::Connection { .. }));
    }

    #[test]
    fn test_parse_checksum_list() {
        let a = calculate_checksum(b"a");
        let body = serde_json::to_vec(&vec![format!("{a}\n")]).unwrap();
        assert_eq!(DatabaseClient::parse_checksum_list(&body).unwrap(), vec![a]);
    }
}
