//! Client for FAIR (findable, accessible, interoperable, reusable) data servers

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::checksum::{calculate_checksum, Buffer, Checksum};
use crate::error::{Result, SeamlessError};
use crate::logging::services;

const FAIR_TIMEOUT: Duration = Duration::from_secs(3);

/// A location from which a buffer can be downloaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlInfo {
    Url(String),
    Detailed {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        celltype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compression: Option<String>,
    },
}

impl UrlInfo {
    pub fn url(&self) -> &str {
        match self {
            UrlInfo::Url(url) => url,
            UrlInfo::Detailed { url, .. } => url,
        }
    }

    fn compression(&self) -> Option<&str> {
        match self {
            UrlInfo::Detailed { compression, .. } => compression.as_deref(),
            UrlInfo::Url(_) => None,
        }
    }
}

/// Selection of a dataset distribution
#[derive(Debug, Clone, Default)]
pub struct DistributionQuery {
    pub kind: Option<String>,
    pub version: Option<String>,
    pub date: Option<String>,
    pub format: Option<String>,
    pub compression: Option<String>,
}

impl DistributionQuery {
    fn params(&self, dataset: &str) -> Result<Vec<(&'static str, String)>> {
        if let Some(kind) = &self.kind {
            if kind != "deepcell" && kind != "deepfolder" {
                return Err(anyhow::anyhow!("invalid distribution type '{kind}'").into());
            }
        }
        if let Some(compression) = &self.compression {
            if !matches!(compression.as_str(), "gzip" | "bzip2" | "none") {
                return Err(anyhow::anyhow!("invalid compression '{compression}'").into());
            }
        }
        let mut params = vec![("dataset", dataset.to_string())];
        let optional = [
            ("type", &self.kind),
            ("version", &self.version),
            ("date", &self.date),
            ("format", &self.format),
            ("compression", &self.compression),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                params.push((name, value.clone()));
            }
        }
        Ok(params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Classification {
    BytesItem,
    MixedItem,
    Keyorder,
}

pub struct FairClient {
    client: Client,
    servers: Vec<String>,
    direct_urls: Mutex<HashMap<Checksum, Vec<UrlInfo>>>,
    classification: Mutex<HashMap<Checksum, Classification>>,
}

impl FairClient {
    pub fn new(servers: Vec<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(FAIR_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            servers: servers
                .into_iter()
                .map(|s| s.trim_end_matches('/').to_string())
                .collect(),
            direct_urls: Mutex::new(HashMap::new()),
            classification: Mutex::new(HashMap::new()),
        })
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Register known download locations per checksum
    pub fn add_direct_urls(&self, urls: HashMap<Checksum, Vec<UrlInfo>>) {
        if let Ok(mut direct) = self.direct_urls.lock() {
            for (checksum, infos) in urls {
                direct.entry(checksum).or_default().extend(infos);
            }
        }
    }

    fn classify(&self, checksum: Checksum, class: Classification) {
        if let Ok(mut classes) = self.classification.lock() {
            classes.insert(checksum, class);
        }
    }

    /// Query each server in turn; 4xx/5xx and connection errors move on, 3xx is fatal
    async fn query(&self, path: &str, params: &[(&'static str, String)]) -> Result<Response> {
        for server in &self.servers {
            let url = format!("{server}{path}");
            let response = match self.client.get(&url).query(params).send().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(service = services::FAIR, url = %url, error = %e, "FAIR server unreachable");
                    continue;
                }
            };
            let status = response.status();
            if status.is_redirection() {
                let text = response.text().await.unwrap_or_default();
                return Err(anyhow::anyhow!("FAIR server {server} answered {status}: {text}").into());
            }
            if status.is_client_error() || status.is_server_error() {
                continue;
            }
            return Ok(response);
        }
        Err(SeamlessError::Connection {
            service: services::FAIR.to_string(),
        })
    }

    /// Find a distribution (and its dataset) by its checksum
    pub async fn find(&self, checksum: &Checksum) -> Result<Json> {
        let response = self
            .query(&format!("/machine/find/{}", checksum.to_hex()), &[])
            .await?;
        Ok(response.json().await.context("Invalid FAIR find response")?)
    }

    pub async fn find_distribution(&self, dataset: &str, query: &DistributionQuery) -> Result<Json> {
        let params = query.params(dataset)?;
        let response = self.query("/machine/find_distribution", &params).await?;
        let distribution: Json = response
            .json()
            .await
            .context("Invalid FAIR distribution response")?;
        if let Some(keyorder) = distribution.get("keyorder").and_then(Json::as_str) {
            if let Ok(checksum) = Checksum::from_hex(keyorder) {
                self.classify(checksum, Classification::Keyorder);
            }
        }
        Ok(distribution)
    }

    pub async fn find_distribution_checksum(
        &self,
        dataset: &str,
        query: &DistributionQuery,
    ) -> Result<Checksum> {
        let params = query.params(dataset)?;
        let response = self.query("/machine/find_checksum", &params).await?;
        let text = response.text().await.context("Invalid FAIR checksum response")?;
        Checksum::from_hex(text.trim())
    }

    /// Download raw content from the first server that has it
    async fn download_from_servers(&self, path: &str) -> Option<Buffer> {
        match self.query(path, &[]).await {
            Ok(response) => response.bytes().await.ok(),
            Err(_) => None,
        }
    }

    pub async fn get_dataset(&self, dataset: &str) -> Option<Json> {
        let buffer = self
            .download_from_servers(&format!("/machine/dataset/{dataset}"))
            .await?;
        serde_json::from_slice(&buffer).ok()
    }

    /// Keyorder buffer of a deep distribution
    pub async fn keyorder(&self, checksum: &Checksum) -> Option<Buffer> {
        self.download_from_servers(&format!("/machine/keyorder/{}", checksum.to_hex()))
            .await
    }

    /// Known download locations of a checksum, without downloading
    pub async fn find_url_info(&self, checksum: &Checksum) -> Vec<UrlInfo> {
        let mut infos = self
            .direct_urls
            .lock()
            .ok()
            .and_then(|d| d.get(checksum).cloned())
            .unwrap_or_default();
        if let Some(buffer) = self
            .download_from_servers(&format!("/machine/access/{}", checksum.to_hex()))
            .await
        {
            match serde_json::from_slice::<Vec<UrlInfo>>(&buffer) {
                Ok(found) => infos.extend(found),
                Err(e) => warn!(checksum = %checksum, error = %e, "Malformed FAIR access response"),
            }
        }
        infos
    }

    /// Resolve URL infos through the access API, then download and verify
    pub async fn access(&self, checksum: &Checksum) -> Option<Buffer> {
        let buffer = self
            .download_from_servers(&format!("/machine/access/{}", checksum.to_hex()))
            .await?;
        let infos: Vec<UrlInfo> = serde_json::from_slice(&buffer).ok()?;
        self.download_verified(checksum, &infos).await
    }

    async fn download_verified(&self, checksum: &Checksum, infos: &[UrlInfo]) -> Option<Buffer> {
        let mut tried = HashSet::new();
        for info in infos {
            if !tried.insert(info.url().to_string()) {
                continue;
            }
            if let Some(compression) = info.compression() {
                if compression != "none" {
                    debug!(url = info.url(), compression, "Skipping compressed distribution");
                    continue;
                }
            }
            let Ok(response) = self.client.get(info.url()).send().await else {
                continue;
            };
            if !response.status().is_success() {
                continue;
            }
            let Ok(buffer) = response.bytes().await else {
                continue;
            };
            if calculate_checksum(&buffer) == *checksum {
                return Some(buffer);
            }
            warn!(url = info.url(), checksum = %checksum, "Downloaded content has the wrong checksum");
        }
        None
    }

    /// Last-resort buffer tier
    pub async fn get_buffer(&self, checksum: &Checksum) -> Option<Buffer> {
        let direct = self
            .direct_urls
            .lock()
            .ok()
            .and_then(|d| d.get(checksum).cloned());
        if let Some(infos) = direct {
            if let Some(buffer) = self.download_verified(checksum, &infos).await {
                return Some(buffer);
            }
        }
        if self.servers.is_empty() {
            return None;
        }
        let class = self
            .classification
            .lock()
            .ok()
            .and_then(|c| c.get(checksum).copied());
        match class {
            Some(Classification::BytesItem) | Some(Classification::MixedItem) => {
                self.access(checksum).await
            }
            Some(Classification::Keyorder) => self.keyorder(checksum).await,
            None => None,
        }
    }

    /// Mark a checksum as an item of a deep distribution, so `get_buffer` resolves it via `access`
    pub fn classify_item(&self, checksum: Checksum, celltype: &str) {
        let class = if celltype == "bytes" {
            Classification::BytesItem
        } else {
            Classification::MixedItem
        };
        self.classify(checksum, class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::serve;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    #[test]
    fn test_url_info_forms() {
        let infos: Vec<UrlInfo> = serde_json::from_str(
            r#"["https://a.example/x", {"url": "https://b.example/y", "compression": "gzip"}]"#,
        )
        .unwrap();
        assert_eq!(infos[0].url(), "https://a.example/x");
        assert_eq!(infos[1].url(), "https://b.example/y");
        assert_eq!(infos[1].compression(), Some("gzip"));
    }

    #[test]
    fn test_distribution_query_validation() {
        let bad = DistributionQuery {
            kind: Some("table".into()),
            ..Default::default()
        };
        assert!(bad.params("pdb").is_err());

        let good = DistributionQuery {
            version: Some("3".into()),
            format: Some("mmcif".into()),
            ..Default::default()
        };
        let params = good.params("pdb").unwrap();
        assert_eq!(params[0], ("dataset", "pdb".to_string()));
        assert!(params.contains(&("version", "3".to_string())));
    }

    fn answering(status: StatusCode, body: impl Into<String>) -> Router {
        let body = body.into();
        Router::new().route("/machine/find_checksum", get(move || async move { (status, body) }))
    }

    #[tokio::test]
    async fn test_failing_server_falls_through_to_the_next() {
        let expected = calculate_checksum(b"distribution");
        let broken = serve(answering(StatusCode::INTERNAL_SERVER_ERROR, "down")).await;
        let unknown = serve(answering(StatusCode::NOT_FOUND, "no such dataset")).await;
        let good = serve(answering(StatusCode::OK, expected.to_hex())).await;

        let fair = FairClient::new(vec![broken, unknown, good]).unwrap();
        let found = fair
            .find_distribution_checksum("pdb", &DistributionQuery::default())
            .await
            .unwrap();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_redirect_is_fatal() {
        let redirecting = serve(answering(StatusCode::SEE_OTHER, "moved")).await;
        let good = serve(answering(StatusCode::OK, "unused")).await;

        let fair = FairClient::new(vec![redirecting, good]).unwrap();
        let err = fair
            .find_distribution_checksum("pdb", &DistributionQuery::default())
            .await
            .unwrap_err();
        assert!(!matches!(err, SeamlessError::Connection { .. }), "{err}");
        assert!(err.to_string().contains("303"), "{err}");
    }

    #[tokio::test]
    async fn test_all_servers_failing_is_connection_error() {
        let first = serve(answering(StatusCode::BAD_GATEWAY, "")).await;
        let second = serve(answering(StatusCode::SERVICE_UNAVAILABLE, "")).await;

        let fair = FairClient::new(vec![first, second, "http://127.0.0.1:1".into()]).unwrap();
        let err = fair
            .find_distribution_checksum("pdb", &DistributionQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SeamlessError::Connection { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_no_servers_is_connection_error() {
        let fair = FairClient::new(vec![]).unwrap();
        let err = fair.find(&calculate_checksum(b"x")).await.unwrap_err();
        assert!(matches!(err, SeamlessError::Connection { .. }));
        assert_eq!(fair.get_buffer(&calculate_checksum(b"x")).await, None);
    }
}
