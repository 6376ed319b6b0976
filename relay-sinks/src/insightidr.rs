//! Rapid7 InsightIDR community threat destination

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use relay_core::{classify, Indicator, IocKind};
use relay_feeds::{create_http_client, HttpConfig};

use crate::{describe_status, transport_failure, BatchOutcome, DeliveryReport, Destination, SinkError};

#[derive(Debug, Clone, Deserialize)]
pub struct InsightIdrConfig {
    /// Region prefix, e.g. `us` or `eu`
    pub region: String,
    pub api_key: String,
    /// Key of the custom threat receiving the indicators
    pub threat_key: String,
}

/// Indicator values grouped the way the threat API expects
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThreatBundle {
    pub ips: Vec<String>,
    pub hashes: Vec<String>,
    pub domain_names: Vec<String>,
    pub urls: Vec<String>,
}

impl ThreatBundle {
    pub fn len(&self) -> usize {
        self.ips.len() + self.hashes.len() + self.domain_names.len() + self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bucket indicators by threat type; returns the labels of kinds with no bucket
pub fn bundle(indicators: &[Indicator]) -> (ThreatBundle, Vec<String>) {
    let mut bundle = ThreatBundle::default();
    let mut unsupported = Vec::new();

    for indicator in indicators {
        match classify(indicator) {
            IocKind::Ip { value, .. } => bundle.ips.push(value),
            IocKind::Hash { value, .. } => bundle.hashes.push(value),
            IocKind::Domain(value) => bundle.domain_names.push(value),
            IocKind::Url { original, .. } => bundle.urls.push(original),
            other => {
                info!("Skipped IOC of type {} (not an IDR threat type)", other.label());
                unsupported.push(other.label());
            }
        }
    }
    (bundle, unsupported)
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(default)]
    rejected_indicators: Vec<String>,
    #[serde(default)]
    threat: Option<ThreatSummary>,
}

#[derive(Debug, Deserialize)]
struct ThreatSummary {
    name: String,
}

/// Split a 2xx add response into rejected and accepted batches.
///
/// A body that does not decode counts as accepted with the rejected list
/// unknown.
fn add_outcomes(body: &str, status: u16, count: usize) -> Vec<BatchOutcome> {
    let added: AddResponse = match serde_json::from_str(body) {
        Ok(added) => added,
        Err(e) => {
            warn!(
                "Could not read InsightIDR response ({}); rejected IOCs unknown: {}",
                e, body
            );
            return vec![BatchOutcome::Accepted { count }];
        }
    };

    let mut outcomes = Vec::with_capacity(2);
    let rejected = added.rejected_indicators.len().min(count);
    if rejected > 0 {
        warn!(
            "The following were rejected as IOCs: {}",
            added.rejected_indicators.join(", ")
        );
        outcomes.push(BatchOutcome::Rejected {
            count: rejected,
            status: Some(status),
            reason: "rejected by InsightIDR".to_string(),
        });
    }
    outcomes.push(BatchOutcome::Accepted { count: count - rejected });
    if let Some(threat) = added.threat {
        info!("IOCs added to {}", threat.name);
    }
    outcomes
}

/// InsightIDR client
pub struct InsightIdr {
    config: InsightIdrConfig,
    client: Client,
    authenticated: bool,
}

impl InsightIdr {
    pub fn new(config: InsightIdrConfig, http: &HttpConfig) -> Result<Self, SinkError> {
        Ok(Self {
            config,
            client: create_http_client(http)?,
            authenticated: false,
        })
    }

    fn add_url(&self) -> String {
        format!(
            "https://{}.api.insight.rapid7.com/idr/v1/customthreats/key/{}/indicators/add",
            self.config.region, self.config.threat_key
        )
    }
}

#[async_trait]
impl Destination for InsightIdr {
    fn name(&self) -> &str {
        "insightidr"
    }

    async fn authenticate(&mut self) -> Result<(), SinkError> {
        if self.config.api_key.is_empty() {
            return Err(SinkError::Config("insightidr api_key is empty".to_string()));
        }
        self.authenticated = true;
        Ok(())
    }

    async fn deliver(&mut self, indicators: &[Indicator]) -> Result<DeliveryReport, SinkError> {
        if !self.authenticated {
            return Err(SinkError::NotAuthenticated);
        }

        let mut report = DeliveryReport::new(self.name());
        let (bundle, unsupported) = bundle(indicators);
        for label in unsupported {
            report.skip(&label);
        }
        if bundle.is_empty() {
            return Ok(report);
        }
        let count = bundle.len();
        info!(
            "IOC type metrics: ips {}, hashes {}, domain_names {}, urls {}",
            bundle.ips.len(),
            bundle.hashes.len(),
            bundle.domain_names.len(),
            bundle.urls.len()
        );

        let response = match self
            .client
            .post(self.add_url())
            .header("X-Api-Key", &self.config.api_key)
            .query(&[("format", "json")])
            .json(&bundle)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                report.record(transport_failure(&e, count));
                return Ok(report);
            }
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Response from IDR was {} ({}): {}", status, describe_status(status), body);
            report.record(BatchOutcome::Rejected {
                count,
                status: Some(status),
                reason: body,
            });
            return Ok(report);
        }

        let body = response.text().await.unwrap_or_default();
        for outcome in add_outcomes(&body, status, count) {
            report.record(outcome);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::IndicatorType;

    #[test]
    fn test_bundle_buckets() {
        let indicators = vec![
            Indicator::new(IndicatorType::Ip4, "203.0.113.9"),
            Indicator::new(IndicatorType::Ip6, "2001:db8::9"),
            Indicator::new(IndicatorType::Md5, "d41d8cd98f00b204e9800998ecf8427e"),
            Indicator::new(IndicatorType::Sha1, "da39a3ee5e6b4b0d3255bfef95601890afd80709"),
            Indicator::new(IndicatorType::Url, "http://evil.com/"),
            Indicator::new(IndicatorType::Url, "http://evil.com/payload"),
            Indicator::new(IndicatorType::EmailAddress, "bad@evil.com"),
        ];
        let (bundle, unsupported) = bundle(&indicators);

        assert_eq!(bundle.ips.len(), 2);
        assert_eq!(bundle.hashes.len(), 2);
        assert_eq!(bundle.domain_names, vec!["evil.com".to_string()]);
        assert_eq!(bundle.urls, vec!["http://evil.com/payload".to_string()]);
        assert_eq!(unsupported, vec!["email".to_string()]);
        assert_eq!(bundle.len(), 6);
    }

    #[test]
    fn test_bundle_json_shape() {
        let (bundle, _) = bundle(&[Indicator::new(IndicatorType::Domain, "evil.com")]);
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["domain_names"][0], "evil.com");
        assert!(json["ips"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_add_response() {
        let parsed: AddResponse = serde_json::from_str(
            r#"{"threat": {"name": "RH-ISAC Vetted"}, "rejected_indicators": ["bad value"]}"#,
        )
        .unwrap();
        assert_eq!(parsed.rejected_indicators.len(), 1);
        assert_eq!(parsed.threat.unwrap().name, "RH-ISAC Vetted");
    }

    #[test]
    fn test_add_outcomes_split() {
        let body = r#"{"threat": {"name": "RH-ISAC Vetted"}, "rejected_indicators": ["x", "y"]}"#;
        assert_eq!(
            add_outcomes(body, 200, 5),
            vec![
                BatchOutcome::Rejected {
                    count: 2,
                    status: Some(200),
                    reason: "rejected by InsightIDR".to_string()
                },
                BatchOutcome::Accepted { count: 3 },
            ]
        );
    }

    #[test]
    fn test_add_outcomes_undecodable_body() {
        let outcomes = add_outcomes("<html>gateway</html>", 200, 4);
        assert_eq!(outcomes, vec![BatchOutcome::Accepted { count: 4 }]);

        let mut report = DeliveryReport::new("insightidr");
        for outcome in outcomes {
            report.record(outcome);
        }
        assert_eq!((report.submitted, report.accepted, report.failed), (4, 4, 0));
    }

    #[test]
    fn test_add_url() {
        let config = InsightIdrConfig {
            region: "us".to_string(),
            api_key: "k".to_string(),
            threat_key: "abc".to_string(),
        };
        let idr = InsightIdr::new(config, &HttpConfig::default()).unwrap();
        assert_eq!(
            idr.add_url(),
            "https://us.api.insight.rapid7.com/idr/v1/customthreats/key/abc/indicators/add"
        );
    }
}
