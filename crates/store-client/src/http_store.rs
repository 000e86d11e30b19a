//! HTTP-backed `DocumentStore`, mirroring the reference engine's `fetch_work`/`submit_job` shape.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tracing::warn;

use bookforge_scheduler_core::store::{DocumentStore, StoreOp, StoreOpResult};
use bookforge_scheduler_core::error::StoreError as CoreStoreError;

/// Errors specific to the HTTP transport, before being folded into [`CoreStoreError`].
#[derive(Debug, Error)]
pub(crate) enum HttpStoreError {
    /// The store responded with a structured error body.
    #[error("store rejected request: {0}")]
    Rejected(String),
    /// Any other transport-level failure (DNS, connect, decode, ...).
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<HttpStoreError> for CoreStoreError {
    fn from(err: HttpStoreError) -> Self {
        match err {
            HttpStoreError::Rejected(msg) => CoreStoreError::Invalid(msg),
            HttpStoreError::Transport(msg) => CoreStoreError::Transport(msg),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    collection: &'a str,
    document: &'a Value,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    doc_id: String,
}

#[derive(Debug, Serialize)]
struct ApplyRequest<'a> {
    ops: Vec<ApplyOpDto<'a>>,
}

#[derive(Debug, Serialize)]
struct ApplyOpDto<'a> {
    op_kind: &'a str,
    collection: &'a str,
    doc_id: Option<&'a str>,
    document: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ApplyResultDto {
    doc_id: Option<String>,
    error: Option<String>,
}

/// A [`DocumentStore`] backed by an HTTP document-store service.
pub struct HttpDocumentStore {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpDocumentStore {
    /// Build a store client against `base_url`, using `http` for requests.
    pub fn new(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    async fn check_response(res: reqwest::Response) -> Result<reqwest::Response, HttpStoreError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST {
            if let Ok(err) = serde_json::from_str::<ApiErrorBody>(&body) {
                return Err(HttpStoreError::Rejected(format!("{}: {}", err.code, err.message)));
            }
        }
        Err(HttpStoreError::Transport(format!("http {status}: {body}")))
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn execute(&self, query_doc: &Value, vars: &Value) -> Result<Value, CoreStoreError> {
        let url = self
            .base_url
            .join("api/store/execute")
            .map_err(|e| CoreStoreError::Transport(e.to_string()))?;
        let res = self
            .http
            .post(url)
            .json(&serde_json::json!({ "query": query_doc, "vars": vars }))
            .send()
            .await
            .map_err(|e| HttpStoreError::Transport(e.to_string()))?;
        let res = Self::check_response(res).await?;
        res.json().await.map_err(|e| HttpStoreError::Transport(e.to_string()).into())
    }

    async fn create(&self, collection: &str, doc: &Value) -> Result<String, CoreStoreError> {
        let url = self
            .base_url
            .join("api/store/create")
            .map_err(|e| CoreStoreError::Transport(e.to_string()))?;
        let res = self
            .http
            .post(url)
            .json(&CreateRequest { collection, document: doc })
            .send()
            .await
            .map_err(|e| HttpStoreError::Transport(e.to_string()))?;
        let res = Self::check_response(res).await?;
        let parsed: CreateResponse =
            res.json().await.map_err(|e| HttpStoreError::Transport(e.to_string()))?;
        Ok(parsed.doc_id)
    }

    async fn apply(&self, ops: &[StoreOp]) -> Vec<StoreOpResult> {
        let dtos: Vec<ApplyOpDto> = ops
            .iter()
            .map(|op| ApplyOpDto {
                op_kind: match op.op_kind {
                    bookforge_scheduler_core::store::OpKind::Create => "create",
                    bookforge_scheduler_core::store::OpKind::Update => "update",
                    bookforge_scheduler_core::store::OpKind::Delete => "delete",
                },
                collection: &op.collection,
                doc_id: op.doc_id.as_deref(),
                document: &op.document,
            })
            .collect();

        let url = match self.base_url.join("api/store/apply") {
            Ok(url) => url,
            Err(e) => {
                let err = CoreStoreError::Transport(e.to_string());
                warn!(error = %err, "failed to build apply url, failing whole batch");
                return ops.iter().map(|_| StoreOpResult { doc_id: None, err: Some(err.clone()) }).collect();
            }
        };

        let response = self.http.post(url).json(&ApplyRequest { ops: dtos }).send().await;
        let response = match response {
            Ok(res) => Self::check_response(res).await,
            Err(e) => Err(HttpStoreError::Transport(e.to_string())),
        };

        match response {
            Ok(res) => match res.json::<Vec<ApplyResultDto>>().await {
                Ok(results) => results
                    .into_iter()
                    .map(|r| StoreOpResult { doc_id: r.doc_id, err: r.error.map(CoreStoreError::Invalid) })
                    .collect(),
                Err(e) => {
                    let err = CoreStoreError::Transport(e.to_string());
                    warn!(error = %err, batch_size = ops.len(), "failed to decode apply response, failing whole batch");
                    ops.iter().map(|_| StoreOpResult { doc_id: None, err: Some(err.clone()) }).collect()
                }
            },
            Err(e) => {
                let err: CoreStoreError = e.into();
                warn!(error = %err, batch_size = ops.len(), "apply request failed, failing whole batch");
                ops.iter().map(|_| StoreOpResult { doc_id: None, err: Some(err.clone()) }).collect()
            }
        }
    }
}
