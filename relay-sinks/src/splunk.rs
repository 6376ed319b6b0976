//! Splunk destination
//!
//! Two delivery modes:
//! - `kvstore`: rows saved to a KV store collection (session login)
//! - `threat_intel`: Enterprise Security threat intel lookups (bearer token),
//!   followed by the "Lookup Gen" saved searches that rebuild them

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use relay_core::{classify, Indicator, IocKind, DEFAULT_SOURCE_LABEL};
use relay_feeds::{create_http_client, expect_success, HttpConfig};

use crate::{batch_outcome, batches, transport_failure, DeliveryReport, Destination, SinkError};

/// KV store rows per `batch_save` request
pub const KVSTORE_BATCH_SIZE: usize = 1000;

/// Saved searches that rebuild the threat intel lookups
pub const LOOKUP_GEN_SEARCHES: [&str; 10] = [
    "Threat - Threat Intelligence By CIDR - Lookup Gen",
    "Threat - Threat Intelligence By Domain - Lookup Gen",
    "Threat - Threat Intelligence By Email - Lookup Gen",
    "Threat - Threat Intelligence By Email Wildcard - Lookup Gen",
    "Threat - Threat Intelligence By File Hash - Lookup Gen",
    "Threat - Threat Intelligence By File Name - Lookup Gen",
    "Threat - Threat Intelligence By File Name Wildcard - Lookup Gen",
    "Threat - Threat Intelligence By System - Lookup Gen",
    "Threat - Threat Intelligence By URL - Lookup Gen",
    "Threat - Threat Intelligence By URL Wildcard - Lookup Gen",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplunkMode {
    #[default]
    Kvstore,
    ThreatIntel,
}

/// Splunk connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct SplunkConfig {
    /// Management API base, e.g. `https://splunk.example.com:8089`
    pub base_url: String,
    #[serde(default)]
    pub mode: SplunkMode,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Bearer token for `threat_intel` mode
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Verify the management port certificate
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_collection() -> String {
    "threat_intel".to_string()
}

fn default_verify_tls() -> bool {
    true
}

fn default_source() -> String {
    DEFAULT_SOURCE_LABEL.to_string()
}

/// One KV store row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KvRow {
    pub value: String,
    pub ioc_type: String,
    /// Epoch seconds
    pub updated: i64,
    pub source: String,
    pub tags: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wildcard: Option<String>,
    /// Network form of IP and CIDR rows, matched by CIDR lookups
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
}

fn epoch_secs(indicator: &Indicator, now: DateTime<Utc>) -> i64 {
    indicator.last_seen.map(|ms| ms / 1000).unwrap_or_else(|| now.timestamp())
}

/// Keep an in-range prefix, otherwise treat the address as a single host
fn cidr_column(value: &str, v6: bool) -> String {
    let host_bits = if v6 { 128 } else { 32 };
    let (address, prefix) = match value.split_once('/') {
        Some((address, prefix)) => (address, prefix.parse::<u32>().ok()),
        None => (value, None),
    };
    match prefix {
        Some(bits) if bits <= host_bits => value.to_string(),
        _ => format!("{}/{}", address, host_bits),
    }
}

/// Encode a KV store row; `None` for kinds Splunk has no use for
pub fn kv_row(indicator: &Indicator, source: &str, now: DateTime<Utc>) -> Option<KvRow> {
    let kind = classify(indicator);
    let (value, ioc_type) = match &kind {
        IocKind::Other(_) => return None,
        IocKind::Domain(domain) => (domain.clone(), "domain".to_string()),
        _ => (
            indicator.value.clone(),
            indicator.indicator_type.as_str().to_lowercase(),
        ),
    };

    Some(KvRow {
        value,
        ioc_type,
        updated: epoch_secs(indicator, now),
        source: source.to_string(),
        tags: indicator.joined_tags(" | "),
        wildcard: kind.wildcard(),
        cidr: match &kind {
            IocKind::Ip { value, v6 } => Some(cidr_column(value, *v6)),
            IocKind::Cidr(value) => Some(cidr_column(value, value.contains(':'))),
            _ => None,
        },
    })
}

/// Observable column of a threat intel entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntelField {
    Ip(String),
    SrcUser(String),
    FileHash(String),
    FileName(String),
    Domain(String),
    Url(String),
}

/// One threat intel lookup entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntelEntry {
    pub description: String,
    pub threat_key: String,
    /// Epoch seconds
    pub time: i64,
    #[serde(flatten)]
    pub field: IntelField,
}

/// Entries grouped by threat intel lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntelBuckets {
    pub email_intel: Vec<IntelEntry>,
    pub file_intel: Vec<IntelEntry>,
    pub http_intel: Vec<IntelEntry>,
    pub ip_intel: Vec<IntelEntry>,
}

impl IntelBuckets {
    /// Lookups in submission order
    pub fn lookups(&self) -> [(&'static str, &[IntelEntry]); 4] {
        [
            ("email_intel", self.email_intel.as_slice()),
            ("file_intel", self.file_intel.as_slice()),
            ("http_intel", self.http_intel.as_slice()),
            ("ip_intel", self.ip_intel.as_slice()),
        ]
    }

    pub fn len(&self) -> usize {
        self.lookups().iter().map(|(_, entries)| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sort indicators into the four lookups. Returns the buckets and the kinds
/// that had no lookup.
pub fn categorize(
    indicators: &[Indicator],
    threat_key: &str,
    now: DateTime<Utc>,
) -> (IntelBuckets, Vec<String>) {
    let mut buckets = IntelBuckets::default();
    let mut unsupported = Vec::new();

    for indicator in indicators {
        let kind = classify(indicator);
        let entry = |field| IntelEntry {
            description: indicator.joined_tags(" | "),
            threat_key: threat_key.to_string(),
            time: epoch_secs(indicator, now),
            field,
        };
        match kind {
            IocKind::Ip { value, .. } | IocKind::Cidr(value) => {
                buckets.ip_intel.push(entry(IntelField::Ip(value)))
            }
            IocKind::Email(value) => buckets.email_intel.push(entry(IntelField::SrcUser(value))),
            IocKind::Hash { value, .. } => buckets.file_intel.push(entry(IntelField::FileHash(value))),
            IocKind::FileName(value) => buckets.file_intel.push(entry(IntelField::FileName(value))),
            IocKind::Domain(value) => buckets.http_intel.push(entry(IntelField::Domain(value))),
            url @ IocKind::Url { .. } => {
                let wildcard = url.wildcard().unwrap_or_default();
                buckets.http_intel.push(entry(IntelField::Url(wildcard)))
            }
            other @ IocKind::Other(_) => unsupported.push(other.label()),
        }
    }

    (buckets, unsupported)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    session_key: String,
}

/// Splunk client
pub struct Splunk {
    config: SplunkConfig,
    client: Client,
    /// `Authorization` header value once authenticated
    auth_header: Option<String>,
}

impl Splunk {
    pub fn new(config: SplunkConfig, http: &HttpConfig) -> Result<Self, SinkError> {
        let http = http.clone().insecure(!config.verify_tls);
        Ok(Self {
            client: create_http_client(&http)?,
            config,
            auth_header: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, SinkError> {
        let header = self.auth_header.as_ref().ok_or(SinkError::NotAuthenticated)?;
        Ok(request.header("Authorization", header))
    }

    async fn login(&self) -> Result<String, SinkError> {
        let (username, password) = match (&self.config.username, &self.config.password) {
            (Some(u), Some(p)) => (u, p),
            _ => {
                return Err(SinkError::Config(
                    "kvstore mode needs username and password".to_string(),
                ))
            }
        };

        let response = self
            .client
            .post(self.url("services/auth/login"))
            .form(&[
                ("username", username.as_str()),
                ("password", password.as_str()),
                ("output_mode", "json"),
            ])
            .send()
            .await?;
        let response = expect_success(response).await?;
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Auth(format!("unexpected login response: {}", e)))?;
        Ok(format!("Splunk {}", login.session_key))
    }

    async fn check_token(&self) -> Result<String, SinkError> {
        let token = self
            .config
            .token
            .as_ref()
            .ok_or_else(|| SinkError::Config("threat_intel mode needs a token".to_string()))?;
        let header = format!("Bearer {}", token);
        let response = self
            .client
            .get(self.url("services/authentication/current-context"))
            .header("Authorization", &header)
            .send()
            .await?;
        expect_success(response).await?;
        Ok(header)
    }

    /// Create the KV store collection if it does not exist yet
    async fn ensure_collection(&self) -> Result<(), SinkError> {
        let config_url = self.url("servicesNS/nobody/search/storage/collections/config");
        let response = self
            .authorized(self.client.get(format!("{}/{}", config_url, self.config.collection)))?
            .send()
            .await?;

        if response.status().as_u16() != 404 {
            expect_success(response).await?;
            return Ok(());
        }

        info!("Creating new kvstore collection \"{}\"", self.config.collection);
        let response = self
            .authorized(self.client.post(&config_url))?
            .form(&[("name", self.config.collection.as_str())])
            .send()
            .await?;
        if response.status().as_u16() != 201 {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status { status, body });
        }
        Ok(())
    }

    async fn deliver_kvstore(&self, indicators: &[Indicator]) -> Result<DeliveryReport, SinkError> {
        let mut report = DeliveryReport::new(self.name());
        let now = Utc::now();

        let mut rows = Vec::with_capacity(indicators.len());
        for indicator in indicators {
            match kv_row(indicator, &self.config.source, now) {
                Some(row) => rows.push(row),
                None => {
                    warn!("Unsupported IOC type for Splunk: {}", indicator.indicator_type);
                    report.skip(&classify(indicator).label());
                }
            }
        }
        if rows.is_empty() {
            return Ok(report);
        }

        self.ensure_collection().await?;

        let url = self.url(&format!(
            "servicesNS/nobody/search/storage/collections/data/{}/batch_save",
            self.config.collection
        ));
        for batch in batches(&rows, KVSTORE_BATCH_SIZE) {
            let outcome = match self.authorized(self.client.post(&url))?.json(batch).send().await {
                Ok(response) => batch_outcome(response, &[200], batch.len()).await,
                Err(e) => transport_failure(&e, batch.len()),
            };
            debug!("kvstore batch: {:?}", outcome);
            report.record(outcome);
        }
        Ok(report)
    }

    async fn deliver_threat_intel(
        &self,
        indicators: &[Indicator],
    ) -> Result<DeliveryReport, SinkError> {
        let mut report = DeliveryReport::new(self.name());
        let (buckets, unsupported) = categorize(indicators, &self.config.source, Utc::now());
        for label in unsupported {
            report.skip(&label);
        }

        for (lookup, entries) in buckets.lookups() {
            if entries.is_empty() {
                info!("No IOCs for lookup {}. Skipping.", lookup);
                continue;
            }
            let item = serde_json::to_string(entries).map_err(|e| SinkError::Decode(e.to_string()))?;
            let request = self
                .authorized(self.client.post(self.url(&format!("services/data/threat_intel/item/{}", lookup))))?
                .form(&[("item", item)]);
            let outcome = match request.send().await {
                Ok(response) => batch_outcome(response, &[201], entries.len()).await,
                Err(e) => transport_failure(&e, entries.len()),
            };
            info!("Lookup {}: {:?}", lookup, outcome);
            report.record(outcome);
        }

        if !buckets.is_empty() {
            self.dispatch_lookup_gen().await?;
        }
        Ok(report)
    }

    /// Kick off the saved searches; failures are logged, not fatal
    async fn dispatch_lookup_gen(&self) -> Result<(), SinkError> {
        let mut failures = 0;
        for name in LOOKUP_GEN_SEARCHES {
            let url = self.url(&format!(
                "services/saved/searches/{}/dispatch",
                urlencoding::encode(name)
            ));
            match self.authorized(self.client.post(url))?.send().await {
                Ok(response) if response.status().as_u16() == 201 => {}
                Ok(response) => {
                    warn!(
                        "Unexpected response to dispatch of {} saved search: {}",
                        name,
                        response.status()
                    );
                    failures += 1;
                }
                Err(e) => {
                    warn!("Dispatch of {} saved search failed: {}", name, e);
                    failures += 1;
                }
            }
        }
        if failures == 0 {
            info!("All Lookup Gen saved searches dispatched successfully");
        } else {
            warn!("{} Lookup Gen saved searches were not dispatched", failures);
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for Splunk {
    fn name(&self) -> &str {
        "splunk"
    }

    async fn authenticate(&mut self) -> Result<(), SinkError> {
        let header = match self.config.mode {
            SplunkMode::Kvstore => self.login().await?,
            SplunkMode::ThreatIntel => self.check_token().await?,
        };
        self.auth_header = Some(header);
        info!("Authenticated to Splunk ({:?} mode)", self.config.mode);
        Ok(())
    }

    async fn deliver(&mut self, indicators: &[Indicator]) -> Result<DeliveryReport, SinkError> {
        match self.config.mode {
            SplunkMode::Kvstore => self.deliver_kvstore(indicators).await,
            SplunkMode::ThreatIntel => self.deliver_threat_intel(indicators).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use relay_core::IndicatorType;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn test_kv_row_for_domain_like_url() {
        let ind = Indicator::new(IndicatorType::Url, "http://example.com/")
            .with_tags(&["phish", "kit"])
            .with_last_seen(1_700_000_000_500);
        let row = kv_row(&ind, "RH-ISAC Vetted", now()).unwrap();

        assert_eq!(row.value, "example.com");
        assert_eq!(row.ioc_type, "domain");
        assert_eq!(row.updated, 1_700_000_000);
        assert_eq!(row.tags, "phish | kit");
        assert_eq!(row.wildcard, None);
    }

    #[test]
    fn test_kv_row_for_real_url() {
        let ind = Indicator::new(IndicatorType::Url, "https://evil.com/login");
        let row = kv_row(&ind, "src", now()).unwrap();
        assert_eq!(row.ioc_type, "url");
        assert_eq!(row.value, "https://evil.com/login");
        assert_eq!(row.wildcard.as_deref(), Some("*evil.com/login"));
        assert_eq!(row.updated, now().timestamp());

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["wildcard"], "*evil.com/login");
    }

    #[test]
    fn test_kv_row_cidr_column() {
        let host = kv_row(&Indicator::new(IndicatorType::Ip4, "203.0.113.7"), "src", now()).unwrap();
        assert_eq!(host.cidr.as_deref(), Some("203.0.113.7/32"));
        assert_eq!(host.ioc_type, "ip4");

        let block = kv_row(&Indicator::new(IndicatorType::CidrBlock, "10.0.0.0/8"), "src", now()).unwrap();
        assert_eq!(block.cidr.as_deref(), Some("10.0.0.0/8"));
        assert_eq!(block.ioc_type, "cidr_block");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["cidr"], "10.0.0.0/8");

        let v6 = kv_row(&Indicator::new(IndicatorType::Ip6, "2001:db8::1"), "src", now()).unwrap();
        assert_eq!(v6.cidr.as_deref(), Some("2001:db8::1/128"));
        assert_eq!(v6.ioc_type, "ip6");

        let domain = kv_row(&Indicator::new(IndicatorType::Domain, "evil.com"), "src", now()).unwrap();
        assert_eq!(domain.cidr, None);
        assert!(serde_json::to_value(&domain).unwrap().get("cidr").is_none());
    }

    #[test]
    fn test_cidr_column_out_of_range_prefix() {
        assert_eq!(cidr_column("198.51.100.0/40", false), "198.51.100.0/32");
        assert_eq!(cidr_column("198.51.100.0/24", false), "198.51.100.0/24");
        assert_eq!(cidr_column("2001:db8::/48", true), "2001:db8::/48");
    }

    #[test]
    fn test_kv_row_skips_unsupported() {
        let ind = Indicator::new(IndicatorType::PhoneNumber, "555-0100");
        assert!(kv_row(&ind, "src", now()).is_none());
    }

    #[test]
    fn test_end_to_end_buckets() {
        let indicators = vec![
            Indicator::new(IndicatorType::Ip4, "203.0.113.7"),
            Indicator::new(IndicatorType::Url, "http://example.com"),
            Indicator::new(IndicatorType::Url, "http://example.com/path"),
        ];
        let (buckets, unsupported) = categorize(&indicators, "RH-ISAC Vetted", now());

        assert!(unsupported.is_empty());
        assert_eq!(buckets.ip_intel.len(), 1);
        assert_eq!(buckets.http_intel.len(), 2);
        assert_eq!(buckets.http_intel[0].field, IntelField::Domain("example.com".to_string()));
        assert_eq!(buckets.http_intel[1].field, IntelField::Url("*example.com/path".to_string()));
        assert!(buckets.email_intel.is_empty());
        assert!(buckets.file_intel.is_empty());
        assert_eq!(buckets.len(), 3);
    }

    #[test]
    fn test_intel_entry_json_shape() {
        let ind = Indicator::new(IndicatorType::Md5, "d41d8cd98f00b204e9800998ecf8427e")
            .with_tags(&["a", "b"])
            .with_last_seen(2_000);
        let (buckets, _) = categorize(&[ind], "key", now());
        let json = serde_json::to_value(&buckets.file_intel[0]).unwrap();

        assert_eq!(json["file_hash"], "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(json["description"], "a | b");
        assert_eq!(json["threat_key"], "key");
        assert_eq!(json["time"], 2);
    }

    #[test]
    fn test_categorize_other_kinds() {
        let indicators = vec![
            Indicator::new(IndicatorType::EmailAddress, "bad@evil.com"),
            Indicator::new(IndicatorType::Software, "dropper.exe"),
            Indicator::new(IndicatorType::CidrBlock, "10.0.0.0/8"),
            Indicator::new(IndicatorType::RegistryKey, "HKLM\\Run"),
        ];
        let (buckets, unsupported) = categorize(&indicators, "key", now());
        assert_eq!(buckets.email_intel[0].field, IntelField::SrcUser("bad@evil.com".to_string()));
        assert_eq!(buckets.file_intel[0].field, IntelField::FileName("dropper.exe".to_string()));
        assert_eq!(buckets.ip_intel[0].field, IntelField::Ip("10.0.0.0/8".to_string()));
        assert_eq!(unsupported, vec!["registry_key".to_string()]);
    }

    #[test]
    fn test_config_defaults() {
        let config: SplunkConfig =
            serde_json::from_str(r#"{"base_url": "https://splunk:8089", "mode": "threat_intel", "token": "t"}"#)
                .unwrap();
        assert_eq!(config.mode, SplunkMode::ThreatIntel);
        assert_eq!(config.collection, "threat_intel");
        assert!(config.verify_tls);
        assert_eq!(config.source, DEFAULT_SOURCE_LABEL);
    }

    #[tokio::test]
    async fn test_deliver_requires_session() {
        let config: SplunkConfig = serde_json::from_str(r#"{"base_url": "https://splunk:8089"}"#).unwrap();
        let mut splunk = Splunk::new(config, &HttpConfig::default()).unwrap();
        let err = splunk
            .deliver(&[Indicator::new(IndicatorType::Ip4, "203.0.113.7")])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::NotAuthenticated));
    }
}
