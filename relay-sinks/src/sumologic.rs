//! Sumo Logic threat intel datastore destination

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use relay_core::{classify, HashAlgo, Indicator, IocKind, DEFAULT_SOURCE_LABEL};
use relay_feeds::{create_http_client, HttpConfig};

use crate::{
    batches, describe_status, transport_failure, BatchOutcome, DeliveryReport, Destination,
    SinkError,
};

/// Indicators per upload request
pub const SUMO_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct SumoLogicConfig {
    /// API endpoint for the deployment, e.g. `https://api.us2.sumologic.com/api`
    pub endpoint: String,
    pub access_id: String,
    pub access_key: String,
    #[serde(default = "default_expiration_days")]
    pub expiration_days: i64,
    #[serde(default = "default_confidence")]
    pub confidence: u8,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_expiration_days() -> i64 {
    90
}

fn default_confidence() -> u8 {
    100
}

fn default_source() -> String {
    DEFAULT_SOURCE_LABEL.to_string()
}

/// Sumo normalized indicator type for a classified IOC
pub fn sumo_type(kind: &IocKind) -> Option<&'static str> {
    match kind {
        IocKind::Ip { v6: false, .. } => Some("ipv4-addr"),
        IocKind::Ip { v6: true, .. } => Some("ipv6-addr"),
        IocKind::Domain(_) => Some("domain-name"),
        IocKind::Url { .. } => Some("url"),
        IocKind::Email(_) => Some("email-addr"),
        IocKind::Hash { algo: HashAlgo::Md5, .. } => Some("file:hashes.MD5"),
        IocKind::Hash { algo: HashAlgo::Sha1, .. } => Some("file:hashes.SHA-1"),
        IocKind::Hash { algo: HashAlgo::Sha256, .. } => Some("file:hashes.SHA-256"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SumoIndicator {
    pub id: String,
    pub indicator: String,
    #[serde(rename = "type")]
    pub indicator_type: &'static str,
    pub source: String,
    pub valid_from: String,
    pub valid_until: String,
    pub confidence: u8,
    pub threat_type: &'static str,
    pub fields: BTreeMap<String, String>,
}

/// Encode an indicator; `Err` carries the kind label when Sumo has no type for it
pub fn encode(
    indicator: &Indicator,
    config: &SumoLogicConfig,
    now: DateTime<Utc>,
) -> Result<SumoIndicator, String> {
    let kind = classify(indicator);
    let indicator_type = sumo_type(&kind).ok_or_else(|| kind.label())?;
    let value = match kind {
        IocKind::Domain(domain) => domain,
        _ => indicator.value.clone(),
    };
    let id = indicator.external_id.as_deref().unwrap_or(&value);

    Ok(SumoIndicator {
        id: format!("RHISAC-VETTED-{}", id),
        indicator: value.clone(),
        indicator_type,
        source: config.source.clone(),
        valid_from: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        valid_until: (now + Duration::days(config.expiration_days))
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        confidence: config.confidence,
        threat_type: "malicious-activity",
        fields: BTreeMap::from([("threatLevel".to_string(), "medium".to_string())]),
    })
}

/// Sumo Logic client
pub struct SumoLogic {
    config: SumoLogicConfig,
    client: Client,
    authenticated: bool,
}

impl SumoLogic {
    pub fn new(config: SumoLogicConfig, http: &HttpConfig) -> Result<Self, SinkError> {
        Ok(Self {
            config,
            client: create_http_client(http)?,
            authenticated: false,
        })
    }

    async fn upload(&self, batch: &[SumoIndicator]) -> BatchOutcome {
        let response = self
            .client
            .post(format!(
                "{}/sec/v1/threatInteldatastoreindicators/normalized/",
                self.config.endpoint.trim_end_matches('/')
            ))
            .basic_auth(&self.config.access_id, Some(&self.config.access_key))
            .json(&json!({ "indicators": batch }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return transport_failure(&e, batch.len()),
        };
        let status = response.status().as_u16();
        if status == 200 {
            info!("Successfully submitted {} IOCs to Sumo Logic", batch.len());
            return BatchOutcome::Accepted { count: batch.len() };
        }

        let body = response.text().await.unwrap_or_default();
        warn!("{} (HTTP {})", describe_status(status), status);
        if status == 403 {
            warn!("See https://help.sumologic.com/docs/api/troubleshooting/ for details");
        }
        warn!("Request error content: {}", body);
        BatchOutcome::Rejected {
            count: batch.len(),
            status: Some(status),
            reason: body,
        }
    }
}

#[async_trait]
impl Destination for SumoLogic {
    fn name(&self) -> &str {
        "sumologic"
    }

    /// Basic auth on every request; only the credentials are checked here
    async fn authenticate(&mut self) -> Result<(), SinkError> {
        if self.config.access_id.is_empty() || self.config.access_key.is_empty() {
            return Err(SinkError::Config("sumologic access_id/access_key are empty".to_string()));
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
        let mut encoded = Vec::with_capacity(indicators.len());
        for indicator in indicators {
            match encode(indicator, &self.config, now) {
                Ok(record) => encoded.push(record),
                Err(label) => {
                    debug!("No Sumo Logic type for {}: {}", label, indicator.value);
                    report.skip(&label);
                }
            }
        }

        for batch in batches(&encoded, SUMO_BATCH_SIZE) {
            let outcome = self.upload(batch).await;
            report.record(outcome);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use relay_core::IndicatorType;

    fn config() -> SumoLogicConfig {
        serde_json::from_str(
            r#"{"endpoint": "https://api.us2.sumologic.com/api", "access_id": "id", "access_key": "key"}"#,
        )
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_encode_record() {
        let ind = Indicator::new(IndicatorType::Sha256, &"a".repeat(64))
            .with_external_id("5f1c2a4e-1c2b-4b7a-9d3e-0a1b2c3d4e5f");
        let rec = encode(&ind, &config(), now()).unwrap();

        assert_eq!(rec.id, "RHISAC-VETTED-5f1c2a4e-1c2b-4b7a-9d3e-0a1b2c3d4e5f");
        assert_eq!(rec.indicator_type, "file:hashes.SHA-256");
        assert_eq!(rec.valid_from, "2024-06-01T12:00:00Z");
        assert_eq!(rec.valid_until, "2024-08-30T12:00:00Z");
        assert_eq!(rec.confidence, 100);

        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["threatType"], "malicious-activity");
        assert_eq!(json["fields"]["threatLevel"], "medium");
        assert_eq!(json["type"], "file:hashes.SHA-256");
    }

    #[test]
    fn test_type_map() {
        let cfg = config();
        let ty = |t, v| encode(&Indicator::new(t, v), &cfg, now()).map(|r| r.indicator_type);
        assert_eq!(ty(IndicatorType::Ip4, "203.0.113.1"), Ok("ipv4-addr"));
        assert_eq!(ty(IndicatorType::Url, "https://evil.com/"), Ok("domain-name"));
        assert_eq!(ty(IndicatorType::Url, "https://evil.com/x"), Ok("url"));
        assert_eq!(ty(IndicatorType::EmailAddress, "a@b.c"), Ok("email-addr"));
        assert_eq!(ty(IndicatorType::Software, "x.exe"), Err("filename".to_string()));
    }

    #[test]
    fn test_id_falls_back_to_value() {
        let rec = encode(&Indicator::new(IndicatorType::Domain, "evil.com"), &config(), now()).unwrap();
        assert_eq!(rec.id, "RHISAC-VETTED-evil.com");
    }
}
