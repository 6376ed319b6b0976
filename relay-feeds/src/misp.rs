//! MISP attribute feed
//!
//! Pulls attributes carrying the vetted tag whose timestamp falls in the
//! query window. Pages are numbered; a short page ends the search.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use relay_core::{NormalizeOptions, RawIndicator, TagEntry, VETTED_TAG};

use crate::{create_http_client, expect_success, FeedError, FeedQuery, HttpConfig, IndicatorFeed};

/// MISP connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct MispConfig {
    #[serde(default = "default_url")]
    pub url: String,
    pub key: String,
    /// Tag selecting attributes for distribution
    #[serde(default = "default_vetted_tag")]
    pub vetted_tag: String,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

fn default_url() -> String {
    "https://misp.rhisac.org".to_string()
}

fn default_vetted_tag() -> String {
    VETTED_TAG.to_string()
}

fn default_page_limit() -> usize {
    1000
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RestSearch<'a> {
    return_format: &'static str,
    tags: [&'a str; 1],
    timestamp: [i64; 2],
    page: usize,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    response: AttributeList,
}

#[derive(Debug, Default, Deserialize)]
struct AttributeList {
    #[serde(rename = "Attribute", default)]
    attributes: Vec<Attribute>,
}

#[derive(Debug, Deserialize)]
struct EventSummary {
    #[serde(default)]
    info: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Attribute {
    #[serde(default)]
    id: Option<String>,
    /// Checked per record in `external_id`
    #[serde(default)]
    uuid: Option<String>,
    #[serde(rename = "type")]
    attribute_type: String,
    value: String,
    /// Epoch seconds; MISP sends it as a string
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(rename = "Tag", default)]
    tags: Vec<TagEntry>,
    #[serde(rename = "Event", default)]
    event: Option<EventSummary>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

fn epoch_secs(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

impl Attribute {
    /// Attribute uuid when well formed, otherwise the numeric id
    fn external_id(&self) -> Option<String> {
        let uuid = self.uuid.as_deref().and_then(|raw| match Uuid::parse_str(raw) {
            Ok(uuid) => Some(uuid.to_string()),
            Err(e) => {
                debug!("Ignoring malformed uuid {:?} on attribute {}: {}", raw, self.value, e);
                None
            }
        });
        uuid.or_else(|| self.id.clone())
    }
}

impl From<Attribute> for RawIndicator {
    fn from(attr: Attribute) -> Self {
        let mut raw = RawIndicator::new(&attr.value, &attr.attribute_type);
        raw.external_id = attr.external_id();
        raw.tags = attr.tags;
        raw.last_seen = attr.timestamp.as_ref().and_then(epoch_secs).map(|s| s * 1000);
        raw.origin = attr.event.and_then(|e| e.info);
        raw.extra = attr.extra;
        raw
    }
}

/// MISP client
pub struct Misp {
    config: MispConfig,
    client: Client,
    authenticated: bool,
}

impl Misp {
    pub fn new(config: MispConfig, http: &HttpConfig) -> Result<Self, FeedError> {
        Ok(Self {
            config,
            client: create_http_client(http)?,
            authenticated: false,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", &self.config.key)
            .header("Accept", "application/json")
    }

    async fn search_page(&self, body: &RestSearch<'_>) -> Result<Vec<Attribute>, FeedError> {
        let request = self
            .client
            .post(format!("{}/attributes/restSearch", self.config.url))
            .json(body);
        let response = expect_success(self.authorize(request).send().await?).await?;
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))?;
        Ok(parsed.response.attributes)
    }
}

#[async_trait]
impl IndicatorFeed for Misp {
    fn name(&self) -> &str {
        "misp"
    }

    fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions::excluding(&self.config.vetted_tag)
    }

    async fn authenticate(&mut self) -> Result<(), FeedError> {
        let request = self.client.get(format!("{}/servers/getVersion", self.config.url));
        expect_success(self.authorize(request).send().await?).await?;
        self.authenticated = true;
        info!("Connected to MISP at {}", self.config.url);
        Ok(())
    }

    async fn fetch(&self, query: &FeedQuery) -> Result<Vec<RawIndicator>, FeedError> {
        if !self.authenticated {
            return Err(FeedError::NotAuthenticated);
        }

        let limit = self.config.page_limit.max(1);
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let body = RestSearch {
                return_format: "json",
                tags: [self.config.vetted_tag.as_str()],
                timestamp: [query.window.from_secs(), query.window.to_secs()],
                page,
                limit,
            };
            let attributes = self.search_page(&body).await?;
            let count = attributes.len();
            records.extend(attributes.into_iter().map(RawIndicator::from));
            debug!("MISP page {}: {} attributes", page, count);

            if count < limit {
                break;
            }
            page += 1;
        }

        info!("Got {} IOCs from MISP", records.len());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_to_raw() {
        let json = r#"{"response": {"Attribute": [{
            "id": "42",
            "uuid": "5f1c2a4e-1c2b-4b7a-9d3e-0a1b2c3d4e5f",
            "type": "ip-dst",
            "value": "203.0.113.9",
            "timestamp": "1700000000",
            "category": "Network activity",
            "to_ids": true,
            "Tag": [{"name": "rhisac: vetted"}, {"name": "tlp:green"}],
            "Event": {"info": "Phishing wave", "id": "7"}
        }]}}"#;
        let parsed: SearchResponse = serde_json::from_str(json).unwrap();
        let raw: Vec<RawIndicator> = parsed.response.attributes.into_iter().map(RawIndicator::from).collect();

        assert_eq!(raw[0].kind, "ip-dst");
        assert_eq!(raw[0].last_seen, Some(1_700_000_000_000));
        assert_eq!(raw[0].origin.as_deref(), Some("Phishing wave"));
        assert_eq!(raw[0].external_id.as_deref(), Some("5f1c2a4e-1c2b-4b7a-9d3e-0a1b2c3d4e5f"));
        assert_eq!(raw[0].tags.len(), 2);
        assert_eq!(raw[0].extra.get("category"), Some(&Value::from("Network activity")));
    }

    #[test]
    fn test_numeric_timestamp_and_missing_uuid() {
        let attr: Attribute = serde_json::from_str(
            r#"{"id": "9", "type": "md5", "value": "d41d8cd98f00b204e9800998ecf8427e", "timestamp": 5}"#,
        )
        .unwrap();
        let raw = RawIndicator::from(attr);
        assert_eq!(raw.last_seen, Some(5000));
        assert_eq!(raw.external_id.as_deref(), Some("9"));
    }

    #[test]
    fn test_malformed_uuid_stays_on_its_record() {
        let json = r#"{"response": {"Attribute": [
            {"id": "1", "uuid": "not-a-uuid", "type": "domain", "value": "evil.com"},
            {"id": "2", "uuid": "5f1c2a4e-1c2b-4b7a-9d3e-0a1b2c3d4e5f", "type": "domain", "value": "bad.com"}
        ]}}"#;
        let parsed: SearchResponse = serde_json::from_str(json).unwrap();
        let raw: Vec<RawIndicator> = parsed.response.attributes.into_iter().map(RawIndicator::from).collect();

        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].external_id.as_deref(), Some("1"));
        assert_eq!(raw[1].external_id.as_deref(), Some("5f1c2a4e-1c2b-4b7a-9d3e-0a1b2c3d4e5f"));
    }

    #[test]
    fn test_empty_response() {
        let parsed: SearchResponse = serde_json::from_str(r#"{"response": {}}"#).unwrap();
        assert!(parsed.response.attributes.is_empty());
    }

    #[test]
    fn test_rest_search_body() {
        let body = RestSearch {
            return_format: "json",
            tags: [VETTED_TAG],
            timestamp: [10, 20],
            page: 1,
            limit: 1000,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["returnFormat"], "json");
        assert_eq!(json["tags"][0], VETTED_TAG);
        assert_eq!(json["timestamp"][1], 20);
    }

    #[test]
    fn test_vetted_tag_excluded() {
        let config: MispConfig = serde_json::from_str(r#"{"key": "abc"}"#).unwrap();
        let misp = Misp::new(config, &HttpConfig::default()).unwrap();
        assert_eq!(misp.normalize_options().exclude_tags, vec![VETTED_TAG.to_string()]);
    }
}
