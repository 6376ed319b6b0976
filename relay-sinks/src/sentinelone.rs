//! SentinelOne threat intelligence IOC destination

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use relay_core::{classify, HashAlgo, Indicator, IocKind, DEFAULT_SOURCE_LABEL};
use relay_feeds::{create_http_client, HttpConfig};

use crate::{batch_outcome, transport_failure, DeliveryReport, Destination, SinkError};

#[derive(Debug, Clone, Deserialize)]
pub struct SentinelOneConfig {
    /// Console URL, e.g. `https://usea1.sentinelone.net`
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    DEFAULT_SOURCE_LABEL.to_string()
}

/// SentinelOne IOC type for a classified IOC
pub fn s1_type(kind: &IocKind) -> Option<&'static str> {
    match kind {
        IocKind::Domain(_) => Some("DNS"),
        IocKind::Url { .. } => Some("URL"),
        IocKind::Ip { v6: false, .. } => Some("IPV4"),
        IocKind::Ip { v6: true, .. } => Some("IPV6"),
        IocKind::Hash { algo: HashAlgo::Md5, .. } => Some("MD5"),
        IocKind::Hash { algo: HashAlgo::Sha1, .. } => Some("SHA1"),
        IocKind::Hash { algo: HashAlgo::Sha256, .. } => Some("SHA256"),
        _ => None,
    }
}

/// Days until an IOC of this SentinelOne type expires
pub fn expiration_days(s1_type: &str) -> i64 {
    match s1_type {
        "IPV4" | "IPV6" => 14,
        "MD5" | "SHA1" | "SHA256" => 180,
        _ => 90,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct S1Ioc {
    pub source: String,
    #[serde(rename = "type")]
    pub ioc_type: &'static str,
    pub external_id: String,
    pub value: String,
    pub method: &'static str,
    pub name: String,
    pub valid_until: String,
}

/// Encode an indicator; `Err` carries the kind label when SentinelOne has no type for it
pub fn encode(indicator: &Indicator, source: &str, now: DateTime<Utc>) -> Result<S1Ioc, String> {
    let kind = classify(indicator);
    let ioc_type = s1_type(&kind).ok_or_else(|| kind.label())?;
    let value = match kind {
        IocKind::Domain(domain) => domain,
        _ => indicator.value.clone(),
    };
    let origin = indicator.origin.as_deref().unwrap_or(source);

    Ok(S1Ioc {
        source: source.to_string(),
        ioc_type,
        external_id: indicator
            .external_id
            .clone()
            .unwrap_or_else(|| value.clone()),
        value,
        method: "EQUALS",
        name: format!("RH-ISAC: {} - {}", origin, indicator.indicator_type),
        valid_until: (now + Duration::days(expiration_days(ioc_type)))
            .to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

/// SentinelOne client
pub struct SentinelOne {
    config: SentinelOneConfig,
    client: Client,
    authenticated: bool,
}

impl SentinelOne {
    pub fn new(config: SentinelOneConfig, http: &HttpConfig) -> Result<Self, SinkError> {
        Ok(Self {
            config,
            client: create_http_client(http)?,
            authenticated: false,
        })
    }
}

#[async_trait]
impl Destination for SentinelOne {
    fn name(&self) -> &str {
        "sentinelone"
    }

    /// Static API token; nothing to exchange
    async fn authenticate(&mut self) -> Result<(), SinkError> {
        if self.config.api_key.is_empty() {
            return Err(SinkError::Config("sentinelone api_key is empty".to_string()));
        }
        self.authenticated = true;
        Ok(())
    }

    async fn deliver(&mut self, indicators: &[Indicator]) -> Result<DeliveryReport, SinkError> {
        if !self.authenticated {
            return Err(SinkError::NotAuthenticated);
        }

        let mut report = DeliveryReport::new(self.name());
        let now = Utc::now();
        let mut data = Vec::with_capacity(indicators.len());
        for indicator in indicators {
            match encode(indicator, &self.config.source, now) {
                Ok(ioc) => data.push(ioc),
                Err(label) => {
                    debug!("No SentinelOne IOC type for {}: {}", label, indicator.value);
                    report.skip(&label);
                }
            }
        }
        if data.is_empty() {
            return Ok(report);
        }

        info!("About to submit {} IOCs to SentinelOne", data.len());
        let response = self
            .client
            .post(format!(
                "{}/web/api/v2.1/threat-intelligence/iocs",
                self.config.base_url
            ))
            .header("Authorization", format!("APIToken {}", self.config.api_key))
            .json(&json!({ "filter": {}, "data": data }))
            .send()
            .await;
        let outcome = match response {
            Ok(response) => batch_outcome(response, &[200], data.len()).await,
            Err(e) => transport_failure(&e, data.len()),
        };
        report.record(outcome);
        Ok(report)
    }
}
