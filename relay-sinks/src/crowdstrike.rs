//! CrowdStrike Falcon custom IOC destination

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use relay_core::{classify, HashAlgo, Indicator, IocKind, DEFAULT_SOURCE_LABEL};
use relay_feeds::{client_credentials_token, create_http_client, HttpConfig};

use crate::{
    batch_outcome, batches, describe_status, transport_failure, BatchOutcome, DeliveryReport,
    Destination, SinkError,
};

/// Indicators per create request
pub const FALCON_BATCH_SIZE: usize = 200;

/// Error message fragment marking an indicator Falcon already has
const DUPLICATE_MARKER: &str = "Duplicate type";

/// Falcon API settings
#[derive(Debug, Clone, Deserialize)]
pub struct CrowdStrikeConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_expiration_days")]
    pub expiration_days: i64,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default = "default_action")]
    pub action: String,
    /// Target platforms; omitted from records when empty
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_base_url() -> String {
    "https://api.crowdstrike.com".to_string()
}

fn default_expiration_days() -> i64 {
    90
}

fn default_severity() -> String {
    "HIGH".to_string()
}

fn default_action() -> String {
    "detect".to_string()
}

fn default_source() -> String {
    DEFAULT_SOURCE_LABEL.to_string()
}

/// Falcon indicator type for a classified IOC
pub fn falcon_type(kind: &IocKind) -> Option<&'static str> {
    match kind {
        IocKind::Domain(_) => Some("domain"),
        IocKind::Ip { v6: false, .. } => Some("ipv4"),
        IocKind::Ip { v6: true, .. } => Some("ipv6"),
        IocKind::Hash { algo: HashAlgo::Md5, .. } => Some("md5"),
        IocKind::Hash { algo: HashAlgo::Sha256, .. } => Some("sha256"),
        _ => None,
    }
}

/// One Falcon custom indicator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FalconIndicator {
    pub source: String,
    pub action: String,
    pub expiration: String,
    pub description: String,
    #[serde(rename = "type")]
    pub indicator_type: String,
    pub value: String,
    pub severity: String,
    pub applied_globally: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
}

/// Encode an indicator; `Err` carries the kind label when Falcon has no type for it
pub fn encode(
    indicator: &Indicator,
    config: &CrowdStrikeConfig,
    now: DateTime<Utc>,
) -> Result<FalconIndicator, String> {
    let kind = classify(indicator);
    let indicator_type = falcon_type(&kind).ok_or_else(|| kind.label())?;
    let value = match kind {
        IocKind::Domain(domain) => domain,
        _ => indicator.value.clone(),
    };
    let expiration = (now + Duration::days(config.expiration_days))
        .to_rfc3339_opts(SecondsFormat::Millis, true);

    Ok(FalconIndicator {
        source: config.source.clone(),
        action: config.action.clone(),
        expiration,
        description: indicator.joined_tags("|"),
        indicator_type: indicator_type.to_string(),
        value,
        severity: config.severity.clone(),
        applied_globally: true,
        platforms: config.platforms.clone(),
    })
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    comment: String,
    indicators: &'a [FalconIndicator],
}

impl<'a> CreateBody<'a> {
    fn new(indicators: &'a [FalconIndicator], source: &str) -> Self {
        Self {
            comment: format!("Uploading {} {} IOCs", indicators.len(), source),
            indicators,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    resources: Vec<ResourceError>,
}

#[derive(Debug, Deserialize)]
struct ResourceError {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Drop indicators a 400 response flagged as duplicates.
///
/// Returns the remaining indicators and how many were removed. Errors that
/// are not duplicates are logged and left in place.
pub fn prune_duplicates(batch: &[FalconIndicator], body: &str) -> (Vec<FalconIndicator>, usize) {
    let errors: ErrorBody = serde_json::from_str(body).unwrap_or_default();

    let mut duplicates = Vec::new();
    for error in errors.resources {
        let message = error.message.unwrap_or_default();
        match error.value {
            Some(value) if message.contains(DUPLICATE_MARKER) => {
                debug!("Removing duplicate IOC: {}", value);
                duplicates.push(value);
            }
            value => warn!(
                "Unknown error with value {}: {}",
                value.unwrap_or_default(),
                message
            ),
        }
    }

    let kept: Vec<FalconIndicator> = batch
        .iter()
        .filter(|ind| !duplicates.contains(&ind.value))
        .cloned()
        .collect();
    let removed = batch.len() - kept.len();
    (kept, removed)
}

/// Next step for a batch Falcon answered with a 400
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// No resubmission; the batch is done
    Settled(BatchOutcome),
    /// Submit the remaining indicators once more
    Resubmit {
        kept: Vec<FalconIndicator>,
        removed: usize,
    },
}

/// Decide what follows a 400. Only duplicate errors are worth a resubmit;
/// anything else fails the whole batch.
pub fn after_rejection(batch: &[FalconIndicator], body: &str) -> Rejection {
    let (kept, removed) = prune_duplicates(batch, body);
    if removed == 0 {
        warn!("Falcon rejected batch: {}", body);
        return Rejection::Settled(BatchOutcome::Rejected {
            count: batch.len(),
            status: Some(400),
            reason: body.to_string(),
        });
    }
    if kept.is_empty() {
        return Rejection::Settled(BatchOutcome::Resubmitted { removed, count: 0 });
    }
    Rejection::Resubmit { kept, removed }
}

/// Fold the resubmission result into the outcome of the original batch
pub fn resubmission_outcome(removed: usize, original: usize, retry: BatchOutcome) -> BatchOutcome {
    match retry {
        BatchOutcome::Accepted { count } => BatchOutcome::Resubmitted { removed, count },
        BatchOutcome::Rejected { status, reason, .. } => BatchOutcome::Rejected {
            count: original,
            status,
            reason,
        },
        other => other,
    }
}

/// Falcon client
pub struct CrowdStrike {
    config: CrowdStrikeConfig,
    client: Client,
    token: Option<String>,
}

impl CrowdStrike {
    pub fn new(config: CrowdStrikeConfig, http: &HttpConfig) -> Result<Self, SinkError> {
        Ok(Self {
            config,
            client: create_http_client(http)?,
            token: None,
        })
    }

    async fn create(&self, batch: &[FalconIndicator]) -> Result<reqwest::Response, reqwest::Error> {
        let token = self.token.as_deref().unwrap_or_default();
        self.client
            .post(format!("{}/iocs/entities/indicators/v1", self.config.base_url))
            .bearer_auth(token)
            .json(&CreateBody::new(batch, &self.config.source))
            .send()
            .await
    }

    /// Submit one batch, resubmitting once without duplicates on a 400
    async fn submit(&self, batch: &[FalconIndicator]) -> BatchOutcome {
        let response = match self.create(batch).await {
            Ok(response) => response,
            Err(e) => return transport_failure(&e, batch.len()),
        };

        match response.status().as_u16() {
            200 | 201 => BatchOutcome::Accepted { count: batch.len() },
            400 => {
                let body = response.text().await.unwrap_or_default();
                let (kept, removed) = match after_rejection(batch, &body) {
                    Rejection::Settled(outcome) => return outcome,
                    Rejection::Resubmit { kept, removed } => (kept, removed),
                };

                info!("Resubmitting {} IOCs after removing {} duplicates", kept.len(), removed);
                let retry = match self.create(&kept).await {
                    Ok(retry) => batch_outcome(retry, &[200, 201], kept.len()).await,
                    Err(e) => transport_failure(&e, kept.len()),
                };
                resubmission_outcome(removed, batch.len(), retry)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!("Falcon: {} (HTTP {})", describe_status(status), status);
                BatchOutcome::Rejected {
                    count: batch.len(),
                    status: Some(status),
                    reason: body,
                }
            }
        }
    }
}

#[async_trait]
impl Destination for CrowdStrike {
    fn name(&self) -> &str {
        "crowdstrike"
    }

    async fn authenticate(&mut self) -> Result<(), SinkError> {
        let request = self
            .client
            .post(format!("{}/oauth2/token", self.config.base_url))
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ]);
        self.token = Some(client_credentials_token(request).await?);
        info!("Authenticated to CrowdStrike Falcon");
        Ok(())
    }

    async fn deliver(&mut self, indicators: &[Indicator]) -> Result<DeliveryReport, SinkError> {
        if self.token.is_none() {
            return Err(SinkError::NotAuthenticated);
        }

        let mut report = DeliveryReport::new(self.name());
        let now = Utc::now();
        let mut encoded = Vec::with_capacity(indicators.len());
        for indicator in indicators {
            match encode(indicator, &self.config, now) {
                Ok(record) => encoded.push(record),
                Err(label) => {
                    debug!("No Falcon IOC type for {}: {}", label, indicator.value);
                    report.skip(&label);
                }
            }
        }

        let total = encoded.len().div_ceil(FALCON_BATCH_SIZE);
        info!("About to submit {} IOCs in blocks of {} or less", encoded.len(), FALCON_BATCH_SIZE);
        for (i, batch) in batches(&encoded, FALCON_BATCH_SIZE).enumerate() {
            info!("Submitting block {} of {} to CrowdStrike", i + 1, total);
            let outcome = self.submit(batch).await;
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

    fn config() -> CrowdStrikeConfig {
        serde_json::from_str(r#"{"client_id": "id", "client_secret": "secret"}"#).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn record(value: &str) -> FalconIndicator {
        encode(&Indicator::new(IndicatorType::Domain, value), &config(), now()).unwrap()
    }

    #[test]
    fn test_type_map() {
        let cfg = config();
        let ok = |t, v| encode(&Indicator::new(t, v), &cfg, now()).map(|r| r.indicator_type);

        assert_eq!(ok(IndicatorType::Ip4, "203.0.113.1").unwrap(), "ipv4");
        assert_eq!(ok(IndicatorType::Ip6, "2001:db8::1").unwrap(), "ipv6");
        assert_eq!(ok(IndicatorType::Url, "http://example.com/").unwrap(), "domain");
        assert_eq!(ok(IndicatorType::Url, "http://example.com/x").unwrap_err(), "url");
        assert_eq!(
            ok(IndicatorType::Sha1, "da39a3ee5e6b4b0d3255bfef95601890afd80709").unwrap_err(),
            "sha1"
        );
    }

    #[test]
    fn test_record_fields() {
        let ind = Indicator::new(IndicatorType::Url, "https://evil.com")
            .with_tags(&["a", "b"]);
        let rec = encode(&ind, &config(), now()).unwrap();

        assert_eq!(rec.value, "evil.com");
        assert_eq!(rec.description, "a|b");
        assert_eq!(rec.expiration, "2024-03-31T00:00:00.000Z");
        assert_eq!(rec.severity, "HIGH");
        assert_eq!(rec.action, "detect");
        assert!(rec.applied_globally);

        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["type"], "domain");
        assert!(json.get("platforms").is_none());
    }

    #[test]
    fn test_prune_duplicates() {
        let batch = vec![record("a.com"), record("b.com"), record("c.com")];
        let body = r#"{"errors": [], "resources": [
            {"value": "b.com", "message": "Warning: Duplicate type: 'domain' and value: 'b.com'"},
            {"value": "c.com", "message": "Invalid value"}
        ]}"#;
        let (kept, removed) = prune_duplicates(&batch, body);
        assert_eq!(removed, 1);
        let values: Vec<_> = kept.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["a.com", "c.com"]);
    }

    #[test]
    fn test_prune_unparseable_body() {
        let batch = vec![record("a.com")];
        let (kept, removed) = prune_duplicates(&batch, "<html>oops</html>");
        assert_eq!(removed, 0);
        assert_eq!(kept.len(), 1);
    }

    const DUPLICATE_B: &str = r#"{"resources": [
        {"value": "b.com", "message": "Warning: Duplicate type: 'domain' and value: 'b.com'"}
    ]}"#;

    #[test]
    fn test_rejection_resubmit_then_accepted() {
        let batch = vec![record("a.com"), record("b.com"), record("c.com")];
        let (kept, removed) = match after_rejection(&batch, DUPLICATE_B) {
            Rejection::Resubmit { kept, removed } => (kept, removed),
            other => panic!("expected a resubmit, got {:?}", other),
        };
        assert_eq!(removed, 1);
        assert_eq!(kept, vec![record("a.com"), record("c.com")]);

        let outcome = resubmission_outcome(removed, batch.len(), BatchOutcome::Accepted { count: kept.len() });
        assert_eq!(outcome, BatchOutcome::Resubmitted { removed: 1, count: 2 });

        let mut report = DeliveryReport::new("crowdstrike");
        report.record(outcome);
        assert_eq!((report.submitted, report.accepted, report.failed), (3, 2, 0));
        assert_eq!(report.skipped["duplicate"], 1);
    }

    #[test]
    fn test_rejection_resubmit_then_rejected() {
        let batch = vec![record("a.com"), record("b.com")];
        let removed = match after_rejection(&batch, DUPLICATE_B) {
            Rejection::Resubmit { removed, .. } => removed,
            other => panic!("expected a resubmit, got {:?}", other),
        };
        let retry = BatchOutcome::Rejected {
            count: 1,
            status: Some(500),
            reason: "boom".to_string(),
        };
        let outcome = resubmission_outcome(removed, batch.len(), retry);
        assert_eq!(
            outcome,
            BatchOutcome::Rejected {
                count: 2,
                status: Some(500),
                reason: "boom".to_string()
            }
        );

        let mut report = DeliveryReport::new("crowdstrike");
        report.record(outcome);
        assert_eq!(report.failed, 2);
        assert!(!report.is_success());
    }

    #[test]
    fn test_rejection_all_duplicates() {
        let batch = vec![record("b.com")];
        assert_eq!(
            after_rejection(&batch, DUPLICATE_B),
            Rejection::Settled(BatchOutcome::Resubmitted { removed: 1, count: 0 })
        );
    }

    #[test]
    fn test_rejection_without_duplicates_is_final() {
        let batch = vec![record("a.com"), record("c.com")];
        let body = r#"{"resources": [{"value": "c.com", "message": "Invalid value"}]}"#;
        match after_rejection(&batch, body) {
            Rejection::Settled(BatchOutcome::Rejected { count, status, reason }) => {
                assert_eq!(count, 2);
                assert_eq!(status, Some(400));
                assert_eq!(reason, body);
            }
            other => panic!("expected a settled rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_create_body() {
        let batch = vec![record("a.com"), record("b.com")];
        let json = serde_json::to_value(CreateBody::new(&batch, "RH-ISAC Vetted")).unwrap();
        assert_eq!(json["comment"], "Uploading 2 RH-ISAC Vetted IOCs");
        assert_eq!(json["indicators"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deliver_requires_session() {
        let mut falcon = CrowdStrike::new(config(), &HttpConfig::default()).unwrap();
        assert!(matches!(
            falcon.deliver(&[]).await.unwrap_err(),
            SinkError::NotAuthenticated
        ));
    }
}
