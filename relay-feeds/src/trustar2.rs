//! TruSTAR 2.0 API feed (observables)

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use relay_core::{RawIndicator, TagEntry, DEFAULT_SEARCH_TYPES, VETTED_ENCLAVE_ID};

use crate::{
    client_credentials_token, create_http_client, expect_success, Enclave, EnclaveDirectory,
    FeedError, FeedQuery, HttpConfig, IndicatorFeed, PageRequest, PageSource, Pager,
    TruStarConfig,
};

/// Page size used for file exports
pub const V2_EXPORT_PAGE_SIZE: usize = 500;

/// Page size used when pushing to a destination
pub const V2_PUSH_PAGE_SIZE: usize = 1000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody<'a> {
    enclave_guids: &'a [String],
    from: i64,
    to: i64,
    types: &'a [String],
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Observable {
    value: String,
    #[serde(rename = "type")]
    observable_type: String,
    #[serde(default)]
    first_seen: Option<i64>,
    #[serde(default)]
    last_seen: Option<i64>,
    #[serde(default)]
    tags: Vec<TagEntry>,
    #[serde(default)]
    enclave_guids: Vec<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl From<Observable> for RawIndicator {
    fn from(obl: Observable) -> Self {
        let mut raw = RawIndicator::new(&obl.value, &obl.observable_type);
        raw.tags = obl.tags;
        raw.first_seen = obl.first_seen;
        raw.last_seen = obl.last_seen;
        if !obl.enclave_guids.is_empty() {
            raw.origin = Some(obl.enclave_guids.join(","));
        }
        raw.extra = obl.extra;
        raw
    }
}

/// Types to search: the caller's filter or every commonly used type
pub fn resolve_types(requested: &[String]) -> Vec<String> {
    if requested.is_empty() {
        DEFAULT_SEARCH_TYPES.iter().map(|t| t.to_string()).collect()
    } else {
        requested.to_vec()
    }
}

/// TruSTAR 2.0 client
pub struct TruStarV2 {
    config: TruStarConfig,
    client: Client,
    token: Option<String>,
}

impl TruStarV2 {
    pub fn new(config: TruStarConfig, http: &HttpConfig) -> Result<Self, FeedError> {
        Ok(Self {
            config,
            client: create_http_client(http)?,
            token: None,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/2.0/{}", self.config.base_url, path)
    }

    fn token(&self) -> Result<&str, FeedError> {
        self.token.as_deref().ok_or(FeedError::NotAuthenticated)
    }

    /// Enclaves to query when the caller names none: configured, then every
    /// enclave on the account, then the vetted enclave
    async fn default_enclaves(&self) -> Result<Vec<String>, FeedError> {
        if !self.config.enclave_ids.is_empty() {
            return Ok(self.config.enclave_ids.clone());
        }
        let ids: Vec<String> = self.list_enclaves().await?.into_iter().map(|e| e.id).collect();
        if ids.is_empty() {
            warn!("No enclaves found on account; using the vetted enclave");
            return Ok(vec![VETTED_ENCLAVE_ID.to_string()]);
        }
        Ok(ids)
    }
}

struct V2Search<'a> {
    feed: &'a TruStarV2,
    enclaves: Vec<String>,
    types: Vec<String>,
}

#[async_trait]
impl PageSource for V2Search<'_> {
    async fn search_page(&self, request: &PageRequest) -> Result<Vec<RawIndicator>, FeedError> {
        let body = SearchBody {
            enclave_guids: &self.enclaves,
            from: request.from_ms,
            to: request.to_ms,
            types: &self.types,
        };
        let http = self
            .feed
            .client
            .post(self.feed.api("observables/search"))
            .query(&[("pageSize", request.page_size)])
            .json(&body);
        let response = expect_success(
            self.feed.config.authorize(http, self.feed.token()?).send().await?,
        )
        .await?;
        let page: Envelope<Observable> = response
            .json()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))?;

        Ok(page.data.into_iter().map(RawIndicator::from).collect())
    }
}

#[async_trait]
impl IndicatorFeed for TruStarV2 {
    fn name(&self) -> &str {
        "trustar2"
    }

    async fn authenticate(&mut self) -> Result<(), FeedError> {
        let token = client_credentials_token(self.config.token_request(&self.client)).await?;
        self.token = Some(token);
        info!("Authenticated to TruSTAR 2.0");
        Ok(())
    }

    async fn fetch(&self, query: &FeedQuery) -> Result<Vec<RawIndicator>, FeedError> {
        let enclaves = if query.enclaves.is_empty() {
            self.default_enclaves().await?
        } else {
            query.enclaves.clone()
        };
        debug!("Searching {} enclave(s)", enclaves.len());

        let search = V2Search {
            feed: self,
            enclaves,
            types: resolve_types(&query.types),
        };
        let mut pager = Pager::new(&search, query.window, query.page_size);

        let mut records = Vec::new();
        while let Some(page) = pager.next_page().await? {
            records.extend(page);
            debug!("Observables retrieved: {}", records.len());
        }

        info!("Retrieved {} observables from TruSTAR in {} queries", records.len(), pager.queries());
        Ok(records)
    }
}

#[async_trait]
impl EnclaveDirectory for TruStarV2 {
    async fn list_enclaves(&self) -> Result<Vec<Enclave>, FeedError> {
        let request = self
            .config
            .authorize(self.client.get(self.api("accounts/enclaves")), self.token()?);
        let response = expect_success(request.send().await?).await?;
        let envelope: Envelope<Enclave> = response
            .json()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observable_to_raw() {
        let page: Envelope<Observable> = serde_json::from_str(
            r#"{"data": [{
                "value": "http://evil.com/a", "type": "URL",
                "firstSeen": 10, "lastSeen": 20,
                "tags": ["phish", "campaign-x"],
                "enclaveGuids": ["e1", "e2"],
                "priorityScore": "HIGH"
            }], "nextCursor": "abc"}"#,
        )
        .unwrap();

        let raw: Vec<RawIndicator> = page.data.into_iter().map(RawIndicator::from).collect();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].kind, "URL");
        assert_eq!(raw[0].last_seen, Some(20));
        assert_eq!(raw[0].tags, vec![TagEntry::from("phish"), TagEntry::from("campaign-x")]);
        assert_eq!(raw[0].origin.as_deref(), Some("e1,e2"));
        assert!(raw[0].extra.contains_key("priorityScore"));
    }

    #[test]
    fn test_empty_envelope() {
        let page: Envelope<Observable> = serde_json::from_str("{}").unwrap();
        assert!(page.data.is_empty());
    }

    #[test]
    fn test_default_types() {
        assert_eq!(resolve_types(&[]).len(), DEFAULT_SEARCH_TYPES.len());
        assert_eq!(resolve_types(&["URL".to_string()]), vec!["URL".to_string()]);
    }

    #[test]
    fn test_search_body_shape() {
        let enclaves = vec!["e1".to_string()];
        let types = vec!["IP4".to_string()];
        let body = SearchBody {
            enclave_guids: &enclaves,
            from: 1,
            to: 2,
            types: &types,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["enclaveGuids"][0], "e1");
        assert_eq!(json["types"][0], "IP4");
    }
}
