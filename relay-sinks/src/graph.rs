//! Microsoft Graph threat indicator destination (security/tiIndicators)

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use relay_core::{classify, Indicator, IocKind};
use relay_feeds::{client_credentials_token, create_http_client, HttpConfig};

use crate::{batch_outcome, transport_failure, DeliveryReport, Destination, SinkError};

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Graph description field limit
const MAX_DESCRIPTION: usize = 100;

/// Azure AD app registration and indicator defaults
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub app_id: String,
    pub app_secret: String,
    /// e.g. "Azure Sentinel" or "Microsoft Defender ATP"
    pub target_product: String,
    #[serde(default = "default_expiration_days")]
    pub expiration_days: i64,
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_description")]
    pub description: String,
}

fn default_expiration_days() -> i64 {
    120
}

fn default_login_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_api_url() -> String {
    "https://graph.microsoft.com/beta".to_string()
}

fn default_description() -> String {
    "RHISAC Vetted IOC".to_string()
}

/// Observable part of a tiIndicator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GraphObservable {
    Domain {
        #[serde(rename = "domainName")]
        domain_name: String,
    },
    FileHash {
        #[serde(rename = "fileHashType")]
        file_hash_type: String,
        #[serde(rename = "fileHashValue")]
        file_hash_value: String,
    },
    Ipv4 {
        #[serde(rename = "networkIPv4")]
        network_ipv4: String,
    },
    Ipv6 {
        #[serde(rename = "networkIPv6")]
        network_ipv6: String,
    },
    Url {
        url: String,
    },
    Email {
        #[serde(rename = "emailSenderAddress")]
        email_sender_address: String,
    },
}

impl GraphObservable {
    fn from_kind(kind: IocKind, original: &str) -> Result<Self, String> {
        match kind {
            IocKind::Domain(domain_name) => Ok(Self::Domain { domain_name }),
            IocKind::Hash { algo, value } => Ok(Self::FileHash {
                file_hash_type: algo.as_str().to_string(),
                file_hash_value: value,
            }),
            IocKind::Ip { value, v6: false } => Ok(Self::Ipv4 { network_ipv4: value }),
            IocKind::Ip { value, v6: true } => Ok(Self::Ipv6 { network_ipv6: value }),
            IocKind::Url { .. } => Ok(Self::Url { url: original.to_string() }),
            IocKind::Email(email_sender_address) => Ok(Self::Email { email_sender_address }),
            other => Err(other.label()),
        }
    }
}

/// One tiIndicator request body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TiIndicator {
    pub action: &'static str,
    pub azure_tenant_id: String,
    pub description: String,
    pub expiration_date_time: String,
    pub target_product: String,
    pub threat_type: &'static str,
    pub tlp_level: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub observable: GraphObservable,
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Encode an indicator; `Err` carries the kind label when Graph has no field for it
pub fn encode(
    indicator: &Indicator,
    config: &GraphConfig,
    now: DateTime<Utc>,
) -> Result<TiIndicator, String> {
    let observable = GraphObservable::from_kind(classify(indicator), &indicator.value)?;
    let description = match &indicator.origin {
        Some(origin) => format!("{}: {}", config.description, origin),
        None => config.description.clone(),
    };

    Ok(TiIndicator {
        action: "alert",
        azure_tenant_id: config.tenant_id.clone(),
        description: truncate(&description, MAX_DESCRIPTION),
        expiration_date_time: (now + Duration::days(config.expiration_days))
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        target_product: config.target_product.clone(),
        threat_type: "WatchList",
        tlp_level: "amber",
        tags: indicator.tags.clone(),
        observable,
    })
}

/// Microsoft Graph client
pub struct MicrosoftGraph {
    config: GraphConfig,
    client: Client,
    token: Option<String>,
}

impl MicrosoftGraph {
    pub fn new(config: GraphConfig, http: &HttpConfig) -> Result<Self, SinkError> {
        Ok(Self {
            config,
            client: create_http_client(http)?,
            token: None,
        })
    }
}

#[async_trait]
impl Destination for MicrosoftGraph {
    fn name(&self) -> &str {
        "microsoft"
    }

    async fn authenticate(&mut self) -> Result<(), SinkError> {
        let request = self
            .client
            .post(format!(
                "{}/{}/oauth2/v2.0/token",
                self.config.login_url, self.config.tenant_id
            ))
            .form(&[
                ("client_id", self.config.app_id.as_str()),
                ("client_secret", self.config.app_secret.as_str()),
                ("grant_type", "client_credentials"),
                ("scope", GRAPH_SCOPE),
            ]);
        self.token = Some(client_credentials_token(request).await?);
        info!("Access token acquired for Microsoft Graph");
        Ok(())
    }

    /// One request per indicator; Graph answers 201 for each accepted one
    async fn deliver(&mut self, indicators: &[Indicator]) -> Result<DeliveryReport, SinkError> {
        let token = self.token.as_deref().ok_or(SinkError::NotAuthenticated)?;
        let mut report = DeliveryReport::new(self.name());
        let url = format!("{}/security/tiIndicators", self.config.api_url);
        let now = Utc::now();

        for indicator in indicators {
            let body = match encode(indicator, &self.config, now) {
                Ok(body) => body,
                Err(label) => {
                    debug!("No Graph observable for {}: {}", label, indicator.value);
                    report.skip(&label);
                    continue;
                }
            };
            let outcome = match self.client.post(&url).bearer_auth(token).json(&body).send().await {
                Ok(response) => batch_outcome(response, &[201], 1).await,
                Err(e) => transport_failure(&e, 1),
            };
            report.record(outcome);
        }

        info!("Submitted {} IOCs to Microsoft Graph", report.accepted);
        Ok(report)
    }
}
