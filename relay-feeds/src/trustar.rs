//! TruSTAR 1.3 API feed
//!
//! Indicators are found with a bounded search, then each page is enriched
//! with a metadata lookup (tags, first seen, scoring fields).

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use relay_core::{RawIndicator, TagEntry, VETTED_ENCLAVE_ID};

use crate::reports::{absorb_report_page, ItemPage};
use crate::{
    client_credentials_token, create_http_client, expect_success, inaccessible, Enclave,
    EnclaveDirectory, FeedError, FeedQuery, HttpConfig, IndicatorFeed, PageRequest, PageSource,
    Pager, Report, ReportIndicator, ReportSource,
};

/// Largest page the 1.3 metadata endpoint accepts
pub const V1_MAX_PAGE_SIZE: usize = 1000;

/// TruSTAR credentials and defaults (shared by both API generations)
#[derive(Debug, Clone, Deserialize)]
pub struct TruStarConfig {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub client_metatag: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Enclaves queried when the caller names none
    #[serde(default)]
    pub enclave_ids: Vec<String>,
}

fn default_base_url() -> String {
    "https://api.trustar.co".to_string()
}

impl TruStarConfig {
    pub(crate) fn token_request(&self, client: &Client) -> RequestBuilder {
        client
            .post(format!("{}/oauth/token", self.base_url))
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .form(&[("grant_type", "client_credentials")])
    }

    pub(crate) fn authorize(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        let request = request.bearer_auth(token).header("Client-Type", "API");
        match &self.client_metatag {
            Some(tag) => request.header("Client-Metatag", tag),
            None => request,
        }
    }

    /// Enclaves to query: explicit list, configured list, or the vetted enclave
    pub fn resolve_enclaves(&self, requested: &[String]) -> Vec<String> {
        if !requested.is_empty() {
            requested.to_vec()
        } else if !self.enclave_ids.is_empty() {
            self.enclave_ids.clone()
        } else {
            vec![VETTED_ENCLAVE_ID.to_string()]
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItem {
    value: String,
    indicator_type: String,
    #[serde(default)]
    first_seen: Option<i64>,
    #[serde(default)]
    last_seen: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataKey<'a> {
    value: &'a str,
    indicator_type: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndicatorMetadata {
    value: String,
    indicator_type: String,
    #[serde(default)]
    tags: Vec<TagEntry>,
    #[serde(default)]
    first_seen: Option<i64>,
    #[serde(default)]
    enclave_ids: Vec<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Combine a search page with its metadata lookup.
///
/// The search item's `last_seen` is kept: it is the pagination watermark.
fn merge_metadata(items: Vec<SearchItem>, metadata: Vec<IndicatorMetadata>) -> Vec<RawIndicator> {
    let mut by_key: HashMap<(String, String), IndicatorMetadata> = metadata
        .into_iter()
        .map(|m| ((m.value.clone(), m.indicator_type.clone()), m))
        .collect();

    items
        .into_iter()
        .map(|item| {
            let mut raw = RawIndicator::new(&item.value, &item.indicator_type);
            raw.first_seen = item.first_seen;
            raw.last_seen = item.last_seen;
            if let Some(meta) = by_key.remove(&(item.value, item.indicator_type)) {
                raw.tags = meta.tags;
                raw.first_seen = meta.first_seen.or(raw.first_seen);
                if !meta.enclave_ids.is_empty() {
                    raw.origin = Some(meta.enclave_ids.join(","));
                }
                raw.extra = meta.extra;
                raw.extra.remove("lastSeen");
            }
            raw
        })
        .collect()
}

/// TruSTAR 1.3 client
pub struct TruStarV1 {
    config: TruStarConfig,
    client: Client,
    token: Option<String>,
    /// Skip the ping and enclave-access checks
    min_calls: bool,
}

impl TruStarV1 {
    pub fn new(config: TruStarConfig, http: &HttpConfig) -> Result<Self, FeedError> {
        Ok(Self {
            config,
            client: create_http_client(http)?,
            token: None,
            min_calls: false,
        })
    }

    pub fn with_min_calls(mut self, min_calls: bool) -> Self {
        self.min_calls = min_calls;
        self
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/1.3/{}", self.config.base_url, path)
    }

    fn token(&self) -> Result<&str, FeedError> {
        self.token.as_deref().ok_or(FeedError::NotAuthenticated)
    }

    /// Verify the credentials work
    pub async fn ping(&self) -> Result<(), FeedError> {
        let request = self.config.authorize(self.client.get(self.api("ping")), self.token()?);
        expect_success(request.send().await?).await?;
        Ok(())
    }

    /// Ping and report enclaves the user cannot read, unless `min_calls`
    async fn check_access(&self, enclaves: &[String]) -> Result<(), FeedError> {
        if self.min_calls {
            return Ok(());
        }
        self.ping().await?;
        let available = self.list_enclaves().await?;
        for id in inaccessible(enclaves, &available) {
            warn!("User does not have access to enclave with ID {}", id);
        }
        for enclave in available.iter().filter(|e| enclaves.contains(&e.id)) {
            info!("Retrieving from enclave {}: {}", enclave.id, enclave.name);
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, FeedError> {
        let request = self.client.get(self.api(path)).query(params);
        let response = expect_success(self.config.authorize(request, self.token()?).send().await?).await?;
        response.json().await.map_err(|e| FeedError::Decode(e.to_string()))
    }

    async fn indicator_metadata(
        &self,
        items: &[SearchItem],
        enclaves: &[String],
    ) -> Result<Vec<IndicatorMetadata>, FeedError> {
        let keys: Vec<MetadataKey> = items
            .iter()
            .map(|item| MetadataKey {
                value: &item.value,
                indicator_type: &item.indicator_type,
            })
            .collect();

        let request = self
            .client
            .post(self.api("indicators/metadata"))
            .query(&[("enclaveIds", enclaves.join(","))])
            .json(&keys);
        let response = expect_success(self.config.authorize(request, self.token()?).send().await?).await?;
        response.json().await.map_err(|e| FeedError::Decode(e.to_string()))
    }
}

/// One search configuration bound to a client
struct V1Search<'a> {
    feed: &'a TruStarV1,
    enclaves: Vec<String>,
    types: Vec<String>,
}

#[async_trait]
impl PageSource for V1Search<'_> {
    async fn search_page(&self, request: &PageRequest) -> Result<Vec<RawIndicator>, FeedError> {
        let mut params = vec![
            ("from", request.from_ms.to_string()),
            ("to", request.to_ms.to_string()),
            ("pageSize", request.page_size.to_string()),
            ("pageNumber", "0".to_string()),
            ("enclaveIds", self.enclaves.join(",")),
        ];
        if !self.types.is_empty() {
            params.push(("entityTypes", self.types.join(",")));
        }

        let http = self.feed.client.get(self.feed.api("indicators/search")).query(&params);
        let response = expect_success(
            self.feed.config.authorize(http, self.feed.token()?).send().await?,
        )
        .await?;
        let page: SearchPage = response
            .json()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))?;

        if page.items.is_empty() {
            return Ok(Vec::new());
        }

        let metadata = self.feed.indicator_metadata(&page.items, &self.enclaves).await?;
        Ok(merge_metadata(page.items, metadata))
    }
}

#[async_trait]
impl IndicatorFeed for TruStarV1 {
    fn name(&self) -> &str {
        "trustar"
    }

    async fn authenticate(&mut self) -> Result<(), FeedError> {
        let token = client_credentials_token(self.config.token_request(&self.client)).await?;
        self.token = Some(token);
        info!("Authenticated to TruSTAR 1.3");
        Ok(())
    }

    async fn fetch(&self, query: &FeedQuery) -> Result<Vec<RawIndicator>, FeedError> {
        let enclaves = self.config.resolve_enclaves(&query.enclaves);
        self.check_access(&enclaves).await?;

        let search = V1Search {
            feed: self,
            enclaves,
            types: query.types.clone(),
        };
        let page_size = query.page_size.min(V1_MAX_PAGE_SIZE);
        let mut pager = Pager::new(&search, query.window, page_size);

        let mut records = Vec::new();
        while let Some(page) = pager.next_page().await? {
            records.extend(page);
            debug!("IOCs retrieved: {}", records.len());
        }

        info!("Retrieved {} indicators from TruSTAR in {} queries", records.len(), pager.queries());
        Ok(records)
    }
}

#[async_trait]
impl EnclaveDirectory for TruStarV1 {
    async fn list_enclaves(&self) -> Result<Vec<Enclave>, FeedError> {
        let request = self.config.authorize(self.client.get(self.api("enclaves")), self.token()?);
        let response = expect_success(request.send().await?).await?;
        response.json().await.map_err(|e| FeedError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ReportSource for TruStarV1 {
    /// Enclave reports, newest first, paged by moving `to` back to the oldest
    /// report of each page
    async fn reports(&self, query: &FeedQuery) -> Result<Vec<Report>, FeedError> {
        let enclaves = self.config.resolve_enclaves(&query.enclaves);
        self.check_access(&enclaves).await?;

        let mut seen = HashSet::new();
        let mut reports = Vec::new();
        let mut to_ms = query.window.to_ms;
        loop {
            let params = [
                ("from", query.window.from_ms.to_string()),
                ("to", to_ms.to_string()),
                ("distributionType", "ENCLAVE".to_string()),
                ("enclaveIds", enclaves.join(",")),
            ];
            let page: ItemPage<Report> = self.get_json("reports", &params).await?;
            match absorb_report_page(page, &mut seen, &mut reports, query.window.from_ms) {
                Some(next) => to_ms = next,
                None => break,
            }
        }

        info!("Found {} reports in TruSTAR", reports.len());
        Ok(reports)
    }

    async fn report_tags(&self, report_id: &str) -> Result<Vec<TagEntry>, FeedError> {
        let params = [("idType", "internal".to_string())];
        self.get_json(&format!("reports/{}/tags", report_id), &params).await
    }

    async fn report_indicators(
        &self,
        report_id: &str,
        page_size: usize,
    ) -> Result<Vec<ReportIndicator>, FeedError> {
        let path = format!("reports/{}/indicators", report_id);
        let mut indicators = Vec::new();
        let mut page_number = 0;
        loop {
            let params = [
                ("pageNumber", page_number.to_string()),
                ("pageSize", page_size.min(V1_MAX_PAGE_SIZE).to_string()),
            ];
            let page: ItemPage<ReportIndicator> = self.get_json(&path, &params).await?;
            let more = page.has_next && !page.items.is_empty();
            indicators.extend(page.items);
            if !more {
                break;
            }
            page_number += 1;
        }
        debug!("Report {} has {} indicators", report_id, indicators.len());
        Ok(indicators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TruStarConfig {
        serde_json::from_str(r#"{"api_key": "k", "api_secret": "s"}"#).unwrap()
    }

    #[test]
    fn test_enclave_resolution_order() {
        let mut config = config();
        assert_eq!(config.resolve_enclaves(&[]), vec![VETTED_ENCLAVE_ID.to_string()]);

        config.enclave_ids = vec!["configured".to_string()];
        assert_eq!(config.resolve_enclaves(&[]), vec!["configured".to_string()]);
        assert_eq!(
            config.resolve_enclaves(&["explicit".to_string()]),
            vec!["explicit".to_string()]
        );
    }

    #[test]
    fn test_merge_keeps_search_watermark() {
        let page: SearchPage = serde_json::from_str(
            r#"{"items": [
                {"value": "evil.com", "indicatorType": "URL", "lastSeen": 2000},
                {"value": "1.2.3.4", "indicatorType": "IP", "lastSeen": 1500}
            ], "hasNext": false}"#,
        )
        .unwrap();
        let metadata: Vec<IndicatorMetadata> = serde_json::from_str(
            r#"[{"value": "evil.com", "indicatorType": "URL", "lastSeen": 9999,
                 "firstSeen": 100, "tags": [{"name": "phish", "enclaveId": "e1"}],
                 "enclaveIds": ["e1"], "priorityLevel": "HIGH", "weight": 1}]"#,
        )
        .unwrap();

        let merged = merge_metadata(page.items, metadata);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].last_seen, Some(2000));
        assert_eq!(merged[0].first_seen, Some(100));
        assert_eq!(merged[0].tags[0].name(), Some("phish"));
        assert_eq!(merged[0].origin.as_deref(), Some("e1"));
        assert_eq!(merged[0].extra.get("priorityLevel"), Some(&Value::from("HIGH")));
        assert!(!merged[0].extra.contains_key("lastSeen"));
        assert!(merged[1].tags.is_empty());
    }

    #[test]
    fn test_unauthenticated_client_refuses_requests() {
        let feed = TruStarV1::new(config(), &HttpConfig::default()).unwrap();
        assert!(matches!(feed.token(), Err(FeedError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_report_calls_need_a_session() {
        let feed = TruStarV1::new(config(), &HttpConfig::default())
            .unwrap()
            .with_min_calls(true);
        let err = feed.report_tags("r-1").await.unwrap_err();
        assert!(matches!(err, FeedError::NotAuthenticated));

        let window = relay_core::TimeWindow::new(0, 1_000).unwrap();
        let err = feed.reports(&FeedQuery::new(window)).await.unwrap_err();
        assert!(matches!(err, FeedError::NotAuthenticated));
    }

    #[test]
    fn test_report_tags_decode() {
        let tags: Vec<TagEntry> = serde_json::from_str(
            r#"[{"name": "phishing", "id": "t1", "enclaveId": "e1"}, {"name": "retail"}]"#,
        )
        .unwrap();
        let names: Vec<_> = tags.iter().filter_map(TagEntry::name).collect();
        assert_eq!(names, vec!["phishing", "retail"]);
    }
}
