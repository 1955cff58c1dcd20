//! Source adapter contracts and the paged open-data / CSV adapters.
//!
//! Adapters only fetch and parse; identifier normalization and everything after
//! it happen in the pipeline. A fetch either returns every page up to the first
//! empty one or fails. The one exception is a configured page cap, and a capped
//! fetch is reported as truncated.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bis_core::frame_from_records;
use bis_storage::{frame_from_csv_bytes, FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use polars::prelude::{DataFrame, PolarsError};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bis-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// SODA endpoint (`/resource/<id>.json`), JSON array pages.
    Socrata,
    /// OData v4 endpoint, `{"value": [...]}` pages.
    Odata,
    /// ArcGIS FeatureServer `query`, `{"features": [{"attributes": ...}]}` pages.
    Arcgis,
    /// Local CSV file.
    Csv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    /// File extension used when the page body is stored as a raw artifact.
    pub fn extension(&self) -> &'static str {
        match self.content_type.as_str() {
            "text/csv" => "csv",
            _ => "json",
        }
    }
}

/// Everything one fetch produced. `truncated` is set when a page cap stopped
/// the fetch before the endpoint ran out of records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPages {
    pub pages: Vec<FetchedPage>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

/// Query settings for a paged JSON endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedEndpoint {
    pub url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Stop after this many non-empty pages (sampling / test runs).
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default, rename = "where")]
    pub filter: Option<String>,
    #[serde(default)]
    pub select: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
}

fn default_page_size() -> usize {
    50_000
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_id}: {source}")]
    Fetch {
        source_id: String,
        #[source]
        source: FetchError,
    },
    #[error("{source_id}: upstream returned an error payload: {message}")]
    Upstream { source_id: String, message: String },
    #[error("{source_id}: malformed page {url}: {message}")]
    Malformed {
        source_id: String,
        url: String,
        message: String,
    },
    #[error("{source_id}: {message}")]
    Config { source_id: String, message: String },
    #[error("{source_id}: building frame: {source}")]
    Frame {
        source_id: String,
        #[source]
        source: PolarsError,
    },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPages, AdapterError>;

    fn parse(&self, pages: &[FetchedPage]) -> Result<DataFrame, AdapterError>;
}

#[derive(Debug, Clone)]
struct PagedJsonAdapter {
    source_id: String,
    kind: SourceKind,
    endpoint: PagedEndpoint,
}

#[derive(Debug, Clone)]
struct CsvFileAdapter {
    source_id: String,
    path: PathBuf,
}

enum PageRecords {
    Records(Vec<JsonMap<String, JsonValue>>),
    UpstreamError(String),
}

impl PagedJsonAdapter {
    fn page_url(&self, offset: usize) -> Result<String, AdapterError> {
        let ep = &self.endpoint;
        let limit = ep.page_size.to_string();
        let offset = offset.to_string();
        let mut params: Vec<(&str, String)> = Vec::new();
        match self.kind {
            SourceKind::Socrata => {
                params.push(("$limit", limit));
                params.push(("$offset", offset));
                params.push(("$order", ep.order.clone().unwrap_or_else(|| ":id".to_string())));
                if let Some(filter) = &ep.filter {
                    params.push(("$where", filter.clone()));
                }
                if let Some(select) = &ep.select {
                    params.push(("$select", select.clone()));
                }
            }
            SourceKind::Odata => {
                params.push(("$top", limit));
                params.push(("$skip", offset));
                if let Some(order) = &ep.order {
                    params.push(("$orderby", order.clone()));
                }
                if let Some(filter) = &ep.filter {
                    params.push(("$filter", filter.clone()));
                }
                if let Some(select) = &ep.select {
                    params.push(("$select", select.clone()));
                }
            }
            SourceKind::Arcgis => {
                params.push(("where", ep.filter.clone().unwrap_or_else(|| "1=1".to_string())));
                params.push(("outFields", ep.select.clone().unwrap_or_else(|| "*".to_string())));
                params.push(("returnGeometry", "false".to_string()));
                params.push(("f", "json".to_string()));
                params.push(("resultOffset", offset));
                params.push(("resultRecordCount", limit));
                if let Some(order) = &ep.order {
                    params.push(("orderByFields", order.clone()));
                }
            }
            SourceKind::Csv => {
                return Err(self.config_error("csv sources have no page url"));
            }
        }
        Url::parse_with_params(&ep.url, &params)
            .map(|url| url.to_string())
            .map_err(|err| self.config_error(format!("invalid endpoint {}: {err}", ep.url)))
    }

    fn config_error(&self, message: impl Into<String>) -> AdapterError {
        AdapterError::Config {
            source_id: self.source_id.clone(),
            message: message.into(),
        }
    }

    fn records_from_page(&self, url: &str, body: &[u8]) -> Result<Vec<JsonMap<String, JsonValue>>, AdapterError> {
        let malformed = |message: String| AdapterError::Malformed {
            source_id: self.source_id.clone(),
            url: url.to_string(),
            message,
        };
        let value: JsonValue =
            serde_json::from_slice(body).map_err(|err| malformed(err.to_string()))?;
        match extract_records(self.kind, value).map_err(malformed)? {
            PageRecords::Records(records) => Ok(records),
            PageRecords::UpstreamError(message) => Err(AdapterError::Upstream {
                source_id: self.source_id.clone(),
                message,
            }),
        }
    }
}

fn extract_records(kind: SourceKind, value: JsonValue) -> Result<PageRecords, String> {
    if let Some(message) = upstream_error_message(&value) {
        return Ok(PageRecords::UpstreamError(message));
    }
    let rows = match (kind, value) {
        (SourceKind::Socrata, JsonValue::Array(rows)) => rows,
        (SourceKind::Odata, JsonValue::Object(mut obj)) => match obj.remove("value") {
            Some(JsonValue::Array(rows)) => rows,
            _ => return Err("missing `value` array".to_string()),
        },
        (SourceKind::Arcgis, JsonValue::Object(mut obj)) => match obj.remove("features") {
            Some(JsonValue::Array(features)) => features
                .into_iter()
                .map(arcgis_feature_to_record)
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err("missing `features` array".to_string()),
        },
        (kind, _) => return Err(format!("unexpected page shape for {kind:?}")),
    };
    rows.into_iter()
        .map(|row| match row {
            JsonValue::Object(map) => Ok(map),
            other => Err(format!("expected an object record, got {other}")),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(PageRecords::Records)
}

fn upstream_error_message(value: &JsonValue) -> Option<String> {
    let obj = value.as_object()?;
    let error = obj.get("error")?;
    if error.is_null() || error == &JsonValue::Bool(false) {
        return None;
    }
    let message = error
        .get("message")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .or_else(|| obj.get("message").and_then(JsonValue::as_str).map(str::to_string))
        .unwrap_or_else(|| error.to_string());
    Some(message)
}

fn arcgis_feature_to_record(feature: JsonValue) -> Result<JsonValue, String> {
    let JsonValue::Object(mut feature) = feature else {
        return Err("feature is not an object".to_string());
    };
    let mut attributes = match feature.remove("attributes") {
        Some(JsonValue::Object(attributes)) => attributes,
        _ => return Err("feature without attributes".to_string()),
    };
    if let Some(geometry) = feature.remove("geometry").filter(|g| !g.is_null()) {
        attributes.insert("geometry".to_string(), geometry);
    }
    Ok(JsonValue::Object(attributes))
}

fn json_cell(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        nested => Some(nested.to_string()),
    }
}

fn records_to_frame(records: Vec<JsonMap<String, JsonValue>>) -> Result<DataFrame, PolarsError> {
    frame_from_records(
        records
            .into_iter()
            .map(|map| map.into_iter().map(|(k, v)| (k, json_cell(v))).collect()),
    )
}

#[async_trait]
impl SourceAdapter for PagedJsonAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPages, AdapterError> {
        let mut fetched = FetchedPages::default();
        let mut offset = 0usize;
        loop {
            if let Some(max_pages) = self.endpoint.max_pages {
                if fetched.pages.len() >= max_pages {
                    warn!(source_id = %self.source_id, max_pages, offset, "page cap reached; data is truncated");
                    fetched.truncated = true;
                    break;
                }
            }

            let url = self.page_url(offset)?;
            let resp = http
                .get_page(ctx.run_id, &self.source_id, &url)
                .await
                .map_err(|source| AdapterError::Fetch {
                    source_id: self.source_id.clone(),
                    source,
                })?;
            let record_count = self.records_from_page(&url, &resp.body)?.len();
            if record_count == 0 {
                break;
            }

            // Servers may cap the page below page_size, so advance by what arrived.
            offset += record_count;
            fetched.pages.push(FetchedPage {
                url,
                content_type: "application/json".to_string(),
                body: resp.body,
                fetched_at: Utc::now(),
            });
            info!(source_id = %self.source_id, page = fetched.pages.len(), records = record_count, offset, "fetched page");
        }
        Ok(fetched)
    }

    fn parse(&self, pages: &[FetchedPage]) -> Result<DataFrame, AdapterError> {
        let mut records = Vec::new();
        for page in pages {
            records.extend(self.records_from_page(&page.url, &page.body)?);
        }
        records_to_frame(records).map_err(|source| AdapterError::Frame {
            source_id: self.source_id.clone(),
            source,
        })
    }
}

#[async_trait]
impl SourceAdapter for CsvFileAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Csv
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPages, AdapterError> {
        let body = tokio::fs::read(&self.path).await.map_err(|err| AdapterError::Config {
            source_id: self.source_id.clone(),
            message: format!("reading {}: {err}", self.path.display()),
        })?;
        Ok(FetchedPages {
            pages: vec![FetchedPage {
                url: format!("file://{}", self.path.display()),
                content_type: "text/csv".to_string(),
                body,
                fetched_at: ctx.fetched_at,
            }],
            truncated: false,
        })
    }

    fn parse(&self, pages: &[FetchedPage]) -> Result<DataFrame, AdapterError> {
        let Some(page) = pages.first() else {
            return Err(AdapterError::Config {
                source_id: self.source_id.clone(),
                message: "csv source produced no content".to_string(),
            });
        };
        frame_from_csv_bytes(&page.body).map_err(|err| AdapterError::Malformed {
            source_id: self.source_id.clone(),
            url: page.url.clone(),
            message: format!("{err:#}"),
        })
    }
}

pub fn paged_json_adapter(
    source_id: &str,
    kind: SourceKind,
    endpoint: PagedEndpoint,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    let config_error = |message: &str| AdapterError::Config {
        source_id: source_id.to_string(),
        message: message.to_string(),
    };
    if kind == SourceKind::Csv {
        return Err(config_error("csv sources are read with csv_file_adapter"));
    }
    if endpoint.page_size == 0 {
        return Err(config_error("page_size must be greater than zero"));
    }
    Ok(Box::new(PagedJsonAdapter {
        source_id: source_id.to_string(),
        kind,
        endpoint,
    }))
}

pub fn csv_file_adapter(source_id: &str, path: impl AsRef<Path>) -> Box<dyn SourceAdapter> {
    Box::new(CsvFileAdapter {
        source_id: source_id.to_string(),
        path: path.as_ref().to_path_buf(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use bis_core::text_cells;
    use bis_storage::{HttpClientConfig, RetryPolicy};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn endpoint(url: &str) -> PagedEndpoint {
        PagedEndpoint {
            url: url.to_string(),
            page_size: 2,
            max_pages: None,
            filter: None,
            select: None,
            order: None,
        }
    }

    fn page(body: &str) -> FetchedPage {
        FetchedPage {
            url: "https://example.test/page".to_string(),
            content_type: "application/json".to_string(),
            body: body.as_bytes().to_vec(),
            fetched_at: Utc::now(),
        }
    }

    fn adapter(kind: SourceKind) -> Box<dyn SourceAdapter> {
        paged_json_adapter("test-source", kind, endpoint("https://example.test/q")).unwrap()
    }

    fn cell(frame: &DataFrame, column: &str, row: usize) -> Option<String> {
        text_cells(frame, column).unwrap()[row].clone()
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            retry: RetryPolicy {
                retries: 0,
                ..RetryPolicy::default()
            },
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    /// Serves one canned `(status, body)` response per connection, in order,
    /// and records each request target.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/resource/test.json", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                let head = String::from_utf8_lossy(&request);
                let target = head.split_whitespace().nth(1).unwrap_or_default().to_string();
                log.lock().unwrap().push(target);

                let reason = if status == 200 { "OK" } else { "Not Found" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        (base, seen)
    }

    fn offsets(targets: &[String]) -> Vec<String> {
        targets
            .iter()
            .map(|target| {
                let url = Url::parse(&format!("http://stub{target}")).unwrap();
                url.query_pairs()
                    .find(|(k, _)| k == "$offset")
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default()
            })
            .collect()
    }

    #[test]
    fn socrata_pages_concatenate_into_one_frame() {
        let a = adapter(SourceKind::Socrata);
        let frame = a
            .parse(&[
                page(r#"[{"bin__":"1000001","job__":"J1"},{"bin__":"1000002","job__":"J2"}]"#),
                page(r#"[{"bin__":1000003,"job__":"J3","issuance_date":"2023-06-01T00:00:00.000"}]"#),
            ])
            .unwrap();
        assert_eq!(frame.height(), 3);
        assert_eq!(frame.get_column_names(), &["bin__", "job__", "issuance_date"]);
        assert_eq!(cell(&frame, "bin__", 2).as_deref(), Some("1000003"));
        assert_eq!(cell(&frame, "issuance_date", 0), None);
    }

    #[test]
    fn odata_pages_read_value_array_and_keep_geometry_as_json() {
        let a = adapter(SourceKind::Odata);
        let frame = a
            .parse(&[page(
                r#"{"@odata.context":"x","value":[{"bin":1000001.0,"base_bbl":"1000010001","the_geom":{"type":"Point","coordinates":[1,2]}}]}"#,
            )])
            .unwrap();
        assert_eq!(cell(&frame, "bin", 0).as_deref(), Some("1000001.0"));
        assert!(cell(&frame, "the_geom", 0).unwrap().contains("\"Point\""));
    }

    #[test]
    fn arcgis_features_flatten_attributes() {
        let a = adapter(SourceKind::Arcgis);
        let frame = a
            .parse(&[page(
                r#"{"features":[{"attributes":{"BBL":1000010001,"ZoneDist1":"R6","LandUse":null}}],"exceededTransferLimit":true}"#,
            )])
            .unwrap();
        assert_eq!(cell(&frame, "BBL", 0).as_deref(), Some("1000010001"));
        assert_eq!(cell(&frame, "ZoneDist1", 0).as_deref(), Some("R6"));
        assert_eq!(cell(&frame, "LandUse", 0), None);
    }

    #[test]
    fn arcgis_error_payload_fails_loudly() {
        let a = adapter(SourceKind::Arcgis);
        let err = a
            .parse(&[page(r#"{"error":{"code":400,"message":"Invalid query parameters"}}"#)])
            .unwrap_err();
        assert!(matches!(err, AdapterError::Upstream { ref message, .. } if message == "Invalid query parameters"));
    }

    #[test]
    fn wrong_page_shape_is_malformed() {
        let a = adapter(SourceKind::Odata);
        assert!(matches!(
            a.parse(&[page("[1,2,3]")]).unwrap_err(),
            AdapterError::Malformed { .. }
        ));
        let s = adapter(SourceKind::Socrata);
        assert!(matches!(
            s.parse(&[page("[1]")]).unwrap_err(),
            AdapterError::Malformed { .. }
        ));
    }

    #[test]
    fn page_urls_carry_kind_specific_paging_params() {
        let socrata = PagedJsonAdapter {
            source_id: "sales".into(),
            kind: SourceKind::Socrata,
            endpoint: PagedEndpoint {
                filter: Some("sale_date >= '2020-01-01'".into()),
                ..endpoint("https://data.cityofnewyork.us/resource/usep-8jbt.json")
            },
        };
        let url = Url::parse(&socrata.page_url(4).unwrap()).unwrap();
        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(params.contains(&("$limit".into(), "2".into())));
        assert!(params.contains(&("$offset".into(), "4".into())));
        assert!(params.contains(&("$order".into(), ":id".into())));
        assert!(params.contains(&("$where".into(), "sale_date >= '2020-01-01'".into())));

        let arcgis = PagedJsonAdapter {
            source_id: "pluto".into(),
            kind: SourceKind::Arcgis,
            endpoint: endpoint("https://services.example/FeatureServer/0/query"),
        };
        let url = Url::parse(&arcgis.page_url(0).unwrap()).unwrap();
        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(params.contains(&("where".into(), "1=1".into())));
        assert!(params.contains(&("resultOffset".into(), "0".into())));
        assert!(params.contains(&("f".into(), "json".into())));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(paged_json_adapter("x", SourceKind::Csv, endpoint("https://a.test")).is_err());
        let mut ep = endpoint("https://a.test");
        ep.page_size = 0;
        assert!(paged_json_adapter("x", SourceKind::Socrata, ep).is_err());
    }

    #[tokio::test]
    async fn socrata_fetch_pages_until_an_empty_page() {
        let (base, seen) = serve(vec![
            (200, r#"[{"bin__":"1000001"},{"bin__":"1000002"}]"#),
            (200, r#"[{"bin__":"1000003"}]"#),
            (200, "[]"),
        ])
        .await;
        let adapter = paged_json_adapter("permits", SourceKind::Socrata, endpoint(&base)).unwrap();
        let ctx = AdapterContext::new(Uuid::new_v4());

        let fetched = adapter.fetch(&fetcher(), &ctx).await.unwrap();
        assert_eq!(fetched.pages.len(), 2);
        assert!(!fetched.truncated);
        assert_eq!(offsets(&seen.lock().unwrap()), vec!["0", "2", "3"]);

        let frame = adapter.parse(&fetched.pages).unwrap();
        assert_eq!(frame.height(), 3);
        assert_eq!(fetched.pages[0].extension(), "json");
    }

    #[tokio::test]
    async fn failed_page_fails_the_whole_fetch() {
        let (base, seen) = serve(vec![
            (200, r#"[{"bin__":"1000001"},{"bin__":"1000002"}]"#),
            (404, r#"{"message":"not found"}"#),
        ])
        .await;
        let adapter = paged_json_adapter("permits", SourceKind::Socrata, endpoint(&base)).unwrap();
        let ctx = AdapterContext::new(Uuid::new_v4());

        let err = adapter.fetch(&fetcher(), &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Fetch { source: FetchError::Status { status: 404, .. }, .. }
        ));
        assert_eq!(offsets(&seen.lock().unwrap()), vec!["0", "2"]);
    }

    #[tokio::test]
    async fn page_cap_marks_the_fetch_truncated() {
        let (base, seen) = serve(vec![(200, r#"[{"bin__":"1000001"},{"bin__":"1000002"}]"#)]).await;
        let ep = PagedEndpoint {
            max_pages: Some(1),
            ..endpoint(&base)
        };
        let adapter = paged_json_adapter("permits", SourceKind::Socrata, ep).unwrap();
        let ctx = AdapterContext::new(Uuid::new_v4());

        let fetched = adapter.fetch(&fetcher(), &ctx).await.unwrap();
        assert_eq!(fetched.pages.len(), 1);
        assert!(fetched.truncated);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn csv_adapter_reads_backup_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.csv");
        std::fs::write(&path, "BBL,sale_date,sale_price\n1000010001,2023-01-01,500000\n").unwrap();

        let ctx = AdapterContext::new(Uuid::new_v4());
        let adapter = csv_file_adapter("sales", &path);
        let fetched = adapter.fetch(&fetcher(), &ctx).await.unwrap();
        assert_eq!(fetched.pages.len(), 1);
        assert_eq!(fetched.pages[0].extension(), "csv");
        let frame = adapter.parse(&fetched.pages).unwrap();
        assert_eq!(frame.height(), 1);
        assert_eq!(cell(&frame, "sale_price", 0).as_deref(), Some("500000"));
    }

    #[tokio::test]
    async fn csv_adapter_missing_file_is_an_error() {
        let ctx = AdapterContext::new(Uuid::new_v4());
        let adapter = csv_file_adapter("sales", "/nonexistent/sales.csv");
        assert!(adapter.fetch(&fetcher(), &ctx).await.is_err());
    }
}
