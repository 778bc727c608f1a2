//! OpenSearch k-NN client.
//!
//! Each modality lives in its own index with a `knn_vector` field named
//! `embedding`. Documents look like:
//!
//! ```json
//! {
//!   "content": "| Region | Sales |\n| --- | --- |\n| US | 5000 |",
//!   "embedding": [0.12, -0.98, ...],
//!   "modality": "table",
//!   "metadata": {"source": "s3://.../file.pdf", "page": 2, "caption": "Quarterly sales"}
//! }
//! ```
//!
//! All three indices share one `reqwest::Client`, and therefore one
//! connection pool, which is safe for concurrent use by in-flight requests.

use super::{IndexHit, IndexSet, VectorIndex};
use crate::error::{CollaboratorError, DocQaError};
use crate::model::{Modality, Record, SourceRef};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Connection settings for the OpenSearch collection.
#[derive(Clone, Serialize, Deserialize)]
pub struct OpenSearchConfig {
    /// Host name, without scheme. Default: `localhost`.
    pub host: String,
    /// Default: 443.
    pub port: u16,
    /// Use HTTPS. Default: true.
    pub use_tls: bool,
    /// Skip certificate verification (self-managed clusters only). Default: false.
    pub accept_invalid_certs: bool,
    /// Index name per modality. Defaults: `text-index`, `table-index`, `image-index`.
    pub index_names: BTreeMap<Modality, String>,
    pub basic_user: Option<String>,
    pub basic_password: Option<String>,
    /// AWS SigV4 signing (OpenSearch Serverless). Not implemented; see [`OpenSearchIndex::connect`].
    pub sigv4: bool,
    /// AWS region, used with `sigv4`. Default: `us-east-1`.
    pub region: String,
    /// `knn_vector` dimension used when creating a missing index. Default: 1536.
    pub dimension: usize,
    /// Per-request timeout in seconds. Default: 30.
    pub timeout_secs: u64,
}

impl Default for OpenSearchConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 443,
            use_tls: true,
            accept_invalid_certs: false,
            index_names: BTreeMap::from([
                (Modality::Text, "text-index".to_string()),
                (Modality::Table, "table-index".to_string()),
                (Modality::Image, "image-index".to_string()),
            ]),
            basic_user: None,
            basic_password: None,
            sigv4: false,
            region: "us-east-1".into(),
            dimension: 1536,
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for OpenSearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenSearchConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_tls", &self.use_tls)
            .field("index_names", &self.index_names)
            .field("basic_user", &self.basic_user)
            .field("basic_password", &self.basic_password.as_ref().map(|_| "<redacted>"))
            .field("sigv4", &self.sigv4)
            .field("region", &self.region)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl OpenSearchConfig {
    fn base_url(&self) -> Result<Url, DocQaError> {
        let scheme = if self.use_tls { "https" } else { "http" };
        Url::parse(&format!("{scheme}://{}:{}/", self.host.trim(), self.port)).map_err(|e| {
            DocQaError::InvalidConfig(format!("invalid OpenSearch host '{}': {e}", self.host))
        })
    }
}

/// One modality's OpenSearch index.
#[derive(Clone)]
pub struct OpenSearchIndex {
    client: reqwest::Client,
    base: Url,
    index: String,
    modality: Modality,
    auth: Option<(String, Option<String>)>,
    dimension: usize,
}

impl OpenSearchIndex {
    /// Build one index client per configured modality, sharing a connection pool.
    ///
    /// SigV4 signing is not implemented: enabling it is rejected so requests
    /// are never sent unsigned to a collection that expects signatures.
    pub fn connect(config: &OpenSearchConfig) -> Result<IndexSet, DocQaError> {
        if config.sigv4 {
            return Err(DocQaError::InvalidConfig(format!(
                "SigV4 signing (region {}) is not supported by this client.\n\
                 Route requests through a signing proxy and set OPENSEARCH_SIGV4=false.",
                config.region
            )));
        }
        if config.index_names.is_empty() {
            return Err(DocQaError::InvalidConfig(
                "no OpenSearch index names configured".into(),
            ));
        }

        let base = config.base_url()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| DocQaError::Internal(format!("failed to build OpenSearch client: {e}")))?;
        let auth = config
            .basic_user
            .as_ref()
            .filter(|u| !u.is_empty())
            .map(|u| (u.clone(), config.basic_password.clone()));

        let mut set = IndexSet::new();
        for (modality, name) in &config.index_names {
            set = set.with(Arc::new(Self {
                client: client.clone(),
                base: base.clone(),
                index: name.clone(),
                modality: *modality,
                auth: auth.clone(),
                dimension: config.dimension,
            }));
        }
        info!(
            "OpenSearch at {} with {} indices",
            base,
            config.index_names.len()
        );
        Ok(set)
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn url(&self, segments: &[&str]) -> Result<Url, CollaboratorError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CollaboratorError::InvalidRequest("base URL cannot carry a path".into()))?
            .pop_if_empty()
            .push(&self.index)
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match self.auth {
            Some((ref user, ref pass)) => req.basic_auth(user, pass.as_ref()),
            None => req,
        }
    }

    /// Create the index with a `knn_vector` mapping if it does not exist yet.
    pub async fn ensure_index(&self) -> Result<(), CollaboratorError> {
        let url = self.url(&[])?;
        let resp = self.request(reqwest::Method::HEAD, url.clone()).send().await?;
        match resp.status() {
            s if s.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            s => {
                return Err(CollaboratorError::Status {
                    status: s.as_u16(),
                    body: String::new(),
                })
            }
        }

        info!("Creating OpenSearch index '{}' ({} dims)", self.index, self.dimension);
        let resp = self
            .request(reqwest::Method::PUT, url)
            .json(&index_mapping(self.dimension))
            .send()
            .await?;
        check_status(resp).await.map(|_| ())
    }
}

#[async_trait]
impl VectorIndex for OpenSearchIndex {
    fn modality(&self) -> Modality {
        self.modality
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, CollaboratorError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let url = self.url(&["_search"])?;
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&knn_query(vector, k))
            .send()
            .await?;
        let body = check_status(resp).await?;
        let parsed: SearchResponse =
            serde_json::from_str(&body).map_err(|e| CollaboratorError::Decode(e.to_string()))?;
        debug!(
            "OpenSearch '{}' returned {} hits",
            self.index,
            parsed.hits.hits.len()
        );
        Ok(parsed
            .hits
            .hits
            .into_iter()
            .map(|hit| hit.into_index_hit(self.modality))
            .collect())
    }

    async fn upsert(&self, record: &Record) -> Result<(), CollaboratorError> {
        let mut url = self.url(&["_doc", record.id.as_str()])?;
        url.query_pairs_mut().append_pair("refresh", "true");
        let body = json!({
            "content": record.content,
            "embedding": record.embedding,
            "modality": record.modality,
            "metadata": record.metadata,
            "source_ref": record.source_ref,
        });
        let resp = self
            .request(reqwest::Method::PUT, url)
            .json(&body)
            .send()
            .await?;
        check_status(resp).await.map(|_| ())
    }

    async fn ensure_ready(&self) -> Result<(), CollaboratorError> {
        self.ensure_index().await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<String, CollaboratorError> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    if status.is_success() {
        Ok(body)
    } else {
        Err(CollaboratorError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// k-NN query body. The stored vector is excluded from `_source`: it is large
/// and the retriever never needs it.
fn knn_query(vector: &[f32], k: usize) -> Value {
    json!({
        "size": k,
        "_source": { "excludes": ["embedding"] },
        "query": { "knn": { "embedding": { "vector": vector, "k": k } } }
    })
}

fn index_mapping(dimension: usize) -> Value {
    json!({
        "settings": { "index": { "knn": true, "number_of_shards": 1, "number_of_replicas": 0 } },
        "mappings": {
            "properties": {
                "content":    { "type": "text" },
                "modality":   { "type": "keyword" },
                "metadata":   { "type": "object", "enabled": true },
                "source_ref": { "type": "object", "enabled": true },
                "embedding":  { "type": "knn_vector", "dimension": dimension }
            }
        }
    })
}

// ── Response payloads ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: Option<f32>,
    #[serde(rename = "_source", default)]
    source: HitSource,
}

#[derive(Debug, Default, Deserialize)]
struct HitSource {
    #[serde(default)]
    content: String,
    #[serde(default)]
    modality: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    source_ref: Option<SourceRef>,
}

impl Hit {
    fn into_index_hit(self, index_modality: Modality) -> IndexHit {
        let src = self.source;
        let modality = src
            .modality
            .as_deref()
            .and_then(|m| m.parse().ok())
            .unwrap_or(index_modality);
        let metadata = stringify_metadata(src.metadata);
        let source_ref = src
            .source_ref
            .unwrap_or_else(|| source_ref_from_metadata(&metadata));

        IndexHit {
            record: Record {
                id: self.id,
                modality,
                content: src.content,
                source_ref,
                embedding: src.embedding,
                metadata,
            },
            score: self.score.unwrap_or(0.0),
        }
    }
}

/// Flatten JSON metadata into strings; integer page numbers become `"2"`.
fn stringify_metadata(map: Map<String, Value>) -> BTreeMap<String, String> {
    map.into_iter()
        .filter_map(|(k, v)| match v {
            Value::Null => None,
            Value::String(s) => Some((k, s)),
            other => Some((k, other.to_string())),
        })
        .collect()
}

/// Documents written without `source_ref` keep it in `metadata.source/page`.
fn source_ref_from_metadata(metadata: &BTreeMap<String, String>) -> SourceRef {
    SourceRef {
        document: metadata.get("source").cloned().unwrap_or_default(),
        page: metadata.get("page").and_then(|p| p.parse().ok()),
        location: None,
    }
}
