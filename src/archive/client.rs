//! HTTP client for the Geodoc records archive.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::ArchiveClient;
use super::types::{
    ArchiveError, ByteStream, DocumentKey, DocumentRef, ExportStatus, ExportStatusReport,
    ExportTicket,
};
use crate::config::Config;

/// Connection settings for [`GeodocClient`].
#[derive(Debug, Clone)]
pub struct GeodocSettings {
    /// API base URL.
    pub base_url: String,
    /// Tenant owning the records.
    pub tenant: String,
    /// Series the case records are filed under.
    pub series_id: String,
    /// Category a record must carry to be returned from search.
    pub category: String,
    /// OAuth2 token endpoint.
    pub token_url: String,
    /// OAuth2 client identifier.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// OAuth2 scope.
    pub scope: String,
}

impl From<&Config> for GeodocSettings {
    fn from(config: &Config) -> Self {
        Self {
            base_url: config.archive_base_url.clone(),
            tenant: config.archive_tenant.clone(),
            series_id: config.archive_series_id.clone(),
            category: config.archive_category.clone(),
            token_url: config.archive_token_url.clone(),
            client_id: config.archive_client_id.clone(),
            client_secret: config.archive_client_secret.clone(),
            scope: config.archive_scope.clone(),
        }
    }
}

/// Archive client speaking the Geodoc records API with client-credentials authentication.
pub struct GeodocClient {
    client: Client,
    base_url: String,
    settings: GeodocSettings,
    token: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    #[serde(default)]
    value: Vec<Record>,
}

#[derive(Debug, Deserialize)]
struct Record {
    id: Value,
    #[serde(default)]
    metadata: Option<RecordMetadata>,
}

#[derive(Debug, Deserialize)]
struct RecordMetadata {
    #[serde(default)]
    dokumentkategori: Option<Vec<CategoryValue>>,
}

#[derive(Debug, Deserialize)]
struct CategoryValue {
    value: Value,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    uri: Option<String>,
}

impl GeodocClient {
    /// Construct a client for the given settings.
    pub fn new(settings: GeodocSettings) -> Result<Self, ArchiveError> {
        let client = Client::builder().user_agent("arkivgist/0.1").build()?;
        let base_url = normalize_base_url(&settings.base_url).map_err(ArchiveError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            tenant = %settings.tenant,
            series = %settings.series_id,
            "Initialized archive HTTP client"
        );
        Ok(Self {
            client,
            base_url,
            settings,
            token: RwLock::new(None),
        })
    }

    /// Exchange client credentials for a fresh bearer token.
    pub async fn authenticate(&self) -> Result<String, ArchiveError> {
        let form = [
            ("client_id", self.settings.client_id.as_str()),
            ("scope", self.settings.scope.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let response = self
            .client
            .post(&self.settings.token_url)
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, "Archive token exchange failed");
            return Err(ArchiveError::Authentication(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|error| ArchiveError::Authentication(error.to_string()))?
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| ArchiveError::Authentication("no access_token in response".into()))?;

        *self.token.write().await = Some(token.clone());
        tracing::debug!("Archive bearer token refreshed");
        Ok(token)
    }

    async fn bearer(&self) -> Result<String, ArchiveError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        self.authenticate().await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, ArchiveError> {
        let url = format_endpoint(
            &self.base_url,
            &format!("v1/tenants/{}/{}", self.settings.tenant, path),
        );
        let token = self.bearer().await?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    fn search_filter(&self, key: &DocumentKey) -> String {
        format!(
            "seriesId in ('{}') and gid/any(x:x/gardsnummer eq {} and x/bruksnummer eq {} and x/seksjonsnummer eq {})",
            self.settings.series_id, key.group, key.subgroup, key.section
        )
    }
}

#[async_trait]
impl ArchiveClient for GeodocClient {
    async fn search(&self, key: &DocumentKey) -> Result<Vec<DocumentRef>, ArchiveError> {
        self.authenticate().await?;

        let response = self
            .request(Method::GET, "records")
            .await?
            .query(&[("$filter", self.search_filter(key))])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = ArchiveError::UnexpectedStatus { status, body };
            tracing::error!(batch = %key, error = %error, "Archive search failed");
            return Err(error);
        }

        let records: RecordsResponse = response
            .json()
            .await
            .map_err(|error| ArchiveError::Malformed(error.to_string()))?;

        if records.value.is_empty() {
            tracing::debug!(batch = %key, "No records found");
            return Ok(Vec::new());
        }

        let documents = select_category(records.value, &self.settings.category);
        tracing::info!(
            batch = %key,
            category = %self.settings.category,
            found = documents.len(),
            "Archive search completed"
        );
        Ok(documents)
    }

    async fn request_export(&self, document_id: &str) -> Result<ExportTicket, ArchiveError> {
        let response = self
            .request(Method::GET, &format!("records/{document_id}/download"))
            .await?
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ArchiveError::NotFound(document_id.to_string())),
            status if status.is_success() => response
                .json::<ExportTicket>()
                .await
                .map_err(|error| ArchiveError::Malformed(error.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ArchiveError::UnexpectedStatus { status, body })
            }
        }
    }

    async fn poll_export_status(
        &self,
        ticket: &ExportTicket,
    ) -> Result<ExportStatusReport, ArchiveError> {
        let response = self
            .request(
                Method::GET,
                &format!("records/download/status/{}/{}", ticket.container, ticket.blob),
            )
            .await?
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ArchiveError::UnexpectedStatus { status, body });
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|error| ArchiveError::Malformed(error.to_string()))?;

        Ok(ExportStatusReport {
            status: ExportStatus::from_wire(&body.status),
            uri: body.uri.filter(|uri| !uri.trim().is_empty()),
        })
    }

    async fn fetch_bytes(&self, uri: &str) -> Result<ByteStream, ArchiveError> {
        let response = self.client.get(uri).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ArchiveError::UnexpectedStatus { status, body });
        }
        Ok(Box::pin(response.bytes_stream().map_err(ArchiveError::from)))
    }
}

/// Keep only records tagged with `category`.
fn select_category(records: Vec<Record>, category: &str) -> Vec<DocumentRef> {
    records
        .into_iter()
        .filter_map(|record| {
            let id = stringify_id(record.id);
            let matched = record
                .metadata
                .and_then(|metadata| metadata.dokumentkategori)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|entry| match entry.value {
                    Value::String(text) => Some(text),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .find(|value| value.eq_ignore_ascii_case(category));
            match matched {
                Some(value) => {
                    tracing::debug!(document_id = %id, "Record matches category");
                    Some(DocumentRef {
                        id,
                        category: value,
                    })
                }
                None => {
                    tracing::debug!(document_id = %id, "Record lacks category; skipping");
                    None
                }
            }
        })
        .collect()
}

fn stringify_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use httpmock::{
        Method::{GET, POST},
        MockServer,
    };
    use serde_json::json;

    fn settings(server: &MockServer) -> GeodocSettings {
        GeodocSettings {
            base_url: server.base_url(),
            tenant: "DemoProd6".into(),
            series_id: "1099".into(),
            category: "Vedtak".into(),
            token_url: server.url("/oauth2/token"),
            client_id: "client".into(),
            client_secret: "secret".into(),
            scope: "scope/.default".into(),
        }
    }

    async fn mock_token(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/oauth2/token")
                    .body_contains("grant_type=client_credentials");
                then.status(200)
                    .json_body(json!({ "access_token": "token-1", "token_type": "Bearer" }));
            })
            .await
    }

    #[tokio::test]
    async fn search_keeps_only_matching_category() {
        let server = MockServer::start_async().await;
        let token = mock_token(&server).await;
        let search = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/tenants/DemoProd6/records")
                    .query_param_exists("$filter")
                    .header("authorization", "Bearer token-1");
                then.status(200).json_body(json!({
                    "value": [
                        { "id": 101, "metadata": { "dokumentkategori": [ { "value": "vedtak" } ] } },
                        { "id": "102", "metadata": { "dokumentkategori": [ { "value": "Brev" } ] } },
                        { "id": "103", "metadata": {} }
                    ]
                }));
            })
            .await;

        let client = GeodocClient::new(settings(&server)).expect("client");
        let documents = client
            .search(&DocumentKey::new(1, 2, 0))
            .await
            .expect("search");

        token.assert_async().await;
        search.assert_async().await;
        assert_eq!(
            documents,
            vec![DocumentRef {
                id: "101".into(),
                category: "vedtak".into()
            }]
        );
    }

    #[tokio::test]
    async fn search_surfaces_failed_status() {
        let server = MockServer::start_async().await;
        mock_token(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/tenants/DemoProd6/records");
                then.status(503).body("maintenance");
            })
            .await;

        let client = GeodocClient::new(settings(&server)).expect("client");
        let error = client
            .search(&DocumentKey::new(1, 2, 0))
            .await
            .expect_err("search should fail");
        assert!(matches!(
            error,
            ArchiveError::UnexpectedStatus { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE
        ));
    }

    #[tokio::test]
    async fn missing_access_token_is_an_authentication_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(200).json_body(json!({ "error": "nope" }));
            })
            .await;

        let client = GeodocClient::new(settings(&server)).expect("client");
        let error = client.authenticate().await.expect_err("no token");
        assert!(matches!(error, ArchiveError::Authentication(_)));
    }

    #[tokio::test]
    async fn export_request_maps_not_found() {
        let server = MockServer::start_async().await;
        mock_token(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/tenants/DemoProd6/records/404/download");
                then.status(404);
            })
            .await;

        let client = GeodocClient::new(settings(&server)).expect("client");
        let error = client.request_export("404").await.expect_err("not found");
        assert!(matches!(error, ArchiveError::NotFound(id) if id == "404"));
    }

    #[tokio::test]
    async fn export_flow_reads_ticket_status_and_bytes() {
        let server = MockServer::start_async().await;
        mock_token(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/tenants/DemoProd6/records/7/download");
                then.status(200)
                    .json_body(json!({ "containerName": "exports", "blobName": "7.pdf" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/tenants/DemoProd6/records/download/status/exports/7.pdf");
                then.status(200).json_body(json!({
                    "status": "Success",
                    "uri": "placeholder"
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/blobs/7.pdf");
                then.status(200).body("%PDF-1.7 body");
            })
            .await;

        let client = GeodocClient::new(settings(&server)).expect("client");
        let ticket = client.request_export("7").await.expect("ticket");
        assert_eq!(ticket.container, "exports");
        assert_eq!(ticket.blob, "7.pdf");

        let report = client.poll_export_status(&ticket).await.expect("status");
        assert_eq!(report.status, ExportStatus::Ready);
        assert_eq!(report.uri.as_deref(), Some("placeholder"));

        let mut stream = client
            .fetch_bytes(&server.url("/blobs/7.pdf"))
            .await
            .expect("stream");
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.expect("chunk"));
        }
        assert_eq!(body, b"%PDF-1.7 body");
    }

    #[tokio::test]
    async fn fetch_bytes_rejects_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/blobs/gone.pdf");
                then.status(410);
            })
            .await;

        let client = GeodocClient::new(settings(&server)).expect("client");
        let result = client.fetch_bytes(&server.url("/blobs/gone.pdf")).await;
        assert!(matches!(
            result,
            Err(ArchiveError::UnexpectedStatus { status, .. }) if status == StatusCode::GONE
        ));
    }
}
