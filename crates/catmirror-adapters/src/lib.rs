//! Catalog source contracts, the discovery-API and generic JSON adapters, and
//! fixture-backed transport for offline runs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use catmirror_core::{PageCursor, RawRecord};
use catmirror_storage::{
    CatalogRequest, HttpTransport, RegionEndpoint, TransportError, TransportResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod paging;

pub use paging::{FetchError, FetchOptions, FetchedPage, PaginatedFetcher, StopReason};

pub const CRATE_NAME: &str = "catmirror-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStyle {
    Offset,
    Continuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Discovery API (`/api/catalog/v1`) shared by every portal in a region.
    Socrata,
    /// Any JSON endpoint returning an array, or an object wrapping one.
    Json,
}

/// Records of one page plus whatever the page says about the next one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPage {
    pub records: Vec<RawRecord>,
    pub next_token: Option<String>,
    pub result_set_size: Option<u64>,
    pub malformed: usize,
}

#[derive(Debug, Error)]
pub enum PageDecodeError {
    #[error("page body is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("page body has no record array (expected a JSON array or an object with '{field}')")]
    MissingRecords { field: String },
}

pub trait CatalogSource: Send + Sync {
    fn host(&self) -> &str;
    fn kind(&self) -> SourceKind;
    fn pagination(&self) -> PaginationStyle;

    fn build_request(
        &self,
        endpoint: &RegionEndpoint,
        cursor: &PageCursor,
        page_size: usize,
    ) -> CatalogRequest;

    fn decode_page(&self, body: &[u8], page_size: usize) -> Result<DecodedPage, PageDecodeError>;

    fn initial_cursor(&self) -> PageCursor {
        match self.pagination() {
            PaginationStyle::Offset => PageCursor::Offset { offset: 0 },
            PaginationStyle::Continuation => PageCursor::Continuation { token: None },
        }
    }

    /// Whether a stored cursor can drive this source.
    fn accepts_cursor(&self, cursor: &PageCursor) -> bool {
        matches!(
            (self.pagination(), cursor),
            (PaginationStyle::Offset, PageCursor::Offset { .. })
                | (PaginationStyle::Continuation, PageCursor::Continuation { .. })
        )
    }
}

/// Regional base URLs may be templates over the catalog host.
pub fn endpoint_base(endpoint: &RegionEndpoint, host: &str) -> String {
    endpoint.base_url.replace("{host}", host)
}

fn decode_records(items: Vec<JsonValue>) -> (Vec<RawRecord>, usize) {
    let mut records = Vec::with_capacity(items.len());
    let mut malformed = 0;
    for item in items {
        if !item.is_object() {
            malformed += 1;
            continue;
        }
        match serde_json::from_value::<RawRecord>(item) {
            Ok(record) => records.push(record),
            Err(_) => malformed += 1,
        }
    }
    (records, malformed)
}

fn scalar_field(object: &serde_json::Map<String, JsonValue>, field: &str) -> Option<String> {
    match object.get(field)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Discovery-API adapter. Continuation uses `scroll_id`, seeded with the last id of
/// each full page.
#[derive(Debug, Clone)]
pub struct SocrataCatalogSource {
    host: String,
    pagination: PaginationStyle,
    headers: Vec<(String, String)>,
}

impl SocrataCatalogSource {
    pub const CATALOG_PATH: &'static str = "/api/catalog/v1";

    pub fn new(host: impl Into<String>, pagination: PaginationStyle) -> Self {
        Self {
            host: host.into(),
            pagination,
            headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}

impl CatalogSource for SocrataCatalogSource {
    fn host(&self) -> &str {
        &self.host
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Socrata
    }

    fn pagination(&self) -> PaginationStyle {
        self.pagination
    }

    fn build_request(
        &self,
        endpoint: &RegionEndpoint,
        cursor: &PageCursor,
        page_size: usize,
    ) -> CatalogRequest {
        let url = format!("{}{}", endpoint_base(endpoint, &self.host), Self::CATALOG_PATH);
        let mut request = CatalogRequest::get(url)
            .with_query("domains", self.host.as_str())
            .with_query("search_context", self.host.as_str())
            .with_query("limit", page_size.to_string());
        request = match cursor {
            PageCursor::Offset { offset } => request
                .with_query("order", "id")
                .with_query("offset", offset.to_string()),
            PageCursor::Continuation { token: Some(token) } => {
                request.with_query("scroll_id", token.as_str())
            }
            PageCursor::Continuation { token: None } => request.with_query("scroll_id", ""),
        };
        for (name, value) in &self.headers {
            request = request.with_header(name.as_str(), value.as_str());
        }
        request
    }

    fn decode_page(&self, body: &[u8], page_size: usize) -> Result<DecodedPage, PageDecodeError> {
        let value: JsonValue = serde_json::from_slice(body)?;
        let (items, result_set_size) = match value {
            JsonValue::Object(mut object) => {
                let size = object.get("resultSetSize").and_then(JsonValue::as_u64);
                match object.remove("results") {
                    Some(JsonValue::Array(items)) => (items, size),
                    _ => {
                        return Err(PageDecodeError::MissingRecords {
                            field: "results".to_string(),
                        })
                    }
                }
            }
            JsonValue::Array(items) => (items, None),
            _ => {
                return Err(PageDecodeError::MissingRecords {
                    field: "results".to_string(),
                })
            }
        };

        let (records, malformed) = decode_records(items);
        let next_token = if records.len() + malformed >= page_size {
            records
                .iter()
                .rev()
                .find_map(|r| r.identifier())
                .map(str::to_string)
        } else {
            None
        };
        Ok(DecodedPage {
            records,
            next_token,
            result_set_size,
            malformed,
        })
    }
}

fn default_path() -> String {
    "/api/catalog".to_string()
}

fn default_records_field() -> String {
    "results".to_string()
}

fn default_token_field() -> String {
    "next_page_token".to_string()
}

fn default_offset_param() -> String {
    "offset".to_string()
}

fn default_limit_param() -> String {
    "limit".to_string()
}

fn default_token_param() -> String {
    "page_token".to_string()
}

/// Wire layout of a generic JSON catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonLayout {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_records_field")]
    pub records_field: String,
    #[serde(default = "default_token_field")]
    pub token_field: String,
    #[serde(default = "default_offset_param")]
    pub offset_param: String,
    #[serde(default = "default_limit_param")]
    pub limit_param: String,
    #[serde(default = "default_token_param")]
    pub token_param: String,
}

impl Default for JsonLayout {
    fn default() -> Self {
        Self {
            path: default_path(),
            records_field: default_records_field(),
            token_field: default_token_field(),
            offset_param: default_offset_param(),
            limit_param: default_limit_param(),
            token_param: default_token_param(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonCatalogSource {
    host: String,
    pagination: PaginationStyle,
    layout: JsonLayout,
    headers: Vec<(String, String)>,
}

impl JsonCatalogSource {
    pub fn new(host: impl Into<String>, pagination: PaginationStyle, layout: JsonLayout) -> Self {
        Self {
            host: host.into(),
            pagination,
            layout,
            headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}

impl CatalogSource for JsonCatalogSource {
    fn host(&self) -> &str {
        &self.host
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Json
    }

    fn pagination(&self) -> PaginationStyle {
        self.pagination
    }

    fn build_request(
        &self,
        endpoint: &RegionEndpoint,
        cursor: &PageCursor,
        page_size: usize,
    ) -> CatalogRequest {
        let url = format!("{}{}", endpoint_base(endpoint, &self.host), self.layout.path);
        let mut request =
            CatalogRequest::get(url).with_query(self.layout.limit_param.as_str(), page_size.to_string());
        match cursor {
            PageCursor::Offset { offset } => {
                request = request.with_query(self.layout.offset_param.as_str(), offset.to_string());
            }
            PageCursor::Continuation { token: Some(token) } => {
                request = request.with_query(self.layout.token_param.as_str(), token.as_str());
            }
            PageCursor::Continuation { token: None } => {}
        }
        for (name, value) in &self.headers {
            request = request.with_header(name.as_str(), value.as_str());
        }
        request
    }

    fn decode_page(&self, body: &[u8], _page_size: usize) -> Result<DecodedPage, PageDecodeError> {
        let value: JsonValue = serde_json::from_slice(body)?;
        let missing = || PageDecodeError::MissingRecords {
            field: self.layout.records_field.clone(),
        };
        match value {
            JsonValue::Array(items) => {
                let (records, malformed) = decode_records(items);
                Ok(DecodedPage {
                    records,
                    malformed,
                    ..DecodedPage::default()
                })
            }
            JsonValue::Object(mut object) => {
                let next_token = scalar_field(&object, &self.layout.token_field);
                let result_set_size = object.get("resultSetSize").and_then(JsonValue::as_u64);
                let Some(JsonValue::Array(items)) = object.remove(&self.layout.records_field) else {
                    return Err(missing());
                };
                let (records, malformed) = decode_records(items);
                Ok(DecodedPage {
                    records,
                    next_token,
                    result_set_size,
                    malformed,
                })
            }
            _ => Err(missing()),
        }
    }
}

/// Settings needed to build any adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub host: String,
    pub kind: SourceKind,
    pub pagination: PaginationStyle,
    #[serde(default)]
    pub json: Option<JsonLayout>,
}

pub fn source_for(
    settings: &SourceSettings,
    headers: Vec<(String, String)>,
) -> Box<dyn CatalogSource> {
    match settings.kind {
        SourceKind::Socrata => Box::new(
            SocrataCatalogSource::new(settings.host.clone(), settings.pagination).with_headers(headers),
        ),
        SourceKind::Json => Box::new(
            JsonCatalogSource::new(
                settings.host.clone(),
                settings.pagination,
                settings.json.clone().unwrap_or_default(),
            )
            .with_headers(headers),
        ),
    }
}

/// Serves catalog pages from disk instead of the network.
///
/// Layout: `<root>/<host>/offset-<n>.json` for offset requests,
/// `<root>/<host>/start.json` and `<root>/<host>/token-<token>.json` for continuation.
/// Missing pages answer with an empty array.
#[derive(Debug, Clone)]
pub struct FixtureTransport {
    root: PathBuf,
}

impl FixtureTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn page_path(&self, request: &CatalogRequest) -> anyhow::Result<PathBuf> {
        let host = request
            .query_value("domains")
            .map(str::to_string)
            .or_else(|| host_of(&request.url))
            .context("fixture request carries no catalog host")?;
        let file = if let Some(offset) = request.query_value("offset") {
            format!("offset-{offset}.json")
        } else {
            match request
                .query_value("scroll_id")
                .or_else(|| request.query_value("page_token"))
            {
                Some(token) if !token.is_empty() => format!("token-{token}.json"),
                _ => "start.json".to_string(),
            }
        };
        Ok(self.root.join(host).join(file))
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.split('/').next().filter(|h| !h.is_empty()).map(str::to_string)
}

#[async_trait]
impl HttpTransport for FixtureTransport {
    async fn send(&self, request: &CatalogRequest) -> Result<TransportResponse, TransportError> {
        let path = self.page_path(request).map_err(|err| {
            TransportError::new(catmirror_storage::http::NetworkErrorKind::Other, err.to_string())
        })?;
        let body = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => b"[]".to_vec(),
            Err(err) => {
                return Err(TransportError::new(
                    catmirror_storage::http::NetworkErrorKind::Other,
                    format!("reading fixture page {}: {err}", path.display()),
                ))
            }
        };
        Ok(TransportResponse {
            status: 200,
            retry_after: None,
            final_url: format!("file://{}", path.display()),
            body,
        })
    }
}
