//! Indicator records as they move from a feed to a destination
//!
//! Feeds produce [`RawIndicator`]s in their own vocabulary; the field mapper
//! turns them into immutable [`Indicator`]s.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// Indicator categories, named in the TruSTAR vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndicatorType {
    /// IPv4 address
    Ip4,
    /// IPv6 address
    Ip6,
    /// Domain name
    Domain,
    /// URL
    Url,
    /// Email address
    EmailAddress,
    /// MD5 hash
    Md5,
    /// SHA1 hash
    Sha1,
    /// SHA256 hash
    Sha256,
    /// CIDR network block
    CidrBlock,
    /// File or software name
    Software,
    /// Phone number
    PhoneNumber,
    /// Windows registry key
    RegistryKey,
    /// Bitcoin address
    BitcoinAddress,
    /// Anything the relay has no mapping for
    Other(String),
}

impl IndicatorType {
    /// Map a vendor type string (TruSTAR or MISP vocabulary) to a type
    pub fn from_vendor(raw: &str) -> Self {
        match raw.trim() {
            "IP4" | "IP" | "ip-dst" | "ip-src" => Self::Ip4,
            "IP6" => Self::Ip6,
            "DOMAIN" | "domain" | "hostname" => Self::Domain,
            "URL" | "url" => Self::Url,
            "EMAIL_ADDRESS" | "email-src" | "email-dst" | "email" => Self::EmailAddress,
            "MD5" | "md5" => Self::Md5,
            "SHA1" | "sha1" => Self::Sha1,
            "SHA256" | "sha256" => Self::Sha256,
            "CIDR_BLOCK" => Self::CidrBlock,
            "SOFTWARE" | "filename" => Self::Software,
            "PHONE_NUMBER" | "phone-number" => Self::PhoneNumber,
            "REGISTRY_KEY" | "regkey" => Self::RegistryKey,
            "BITCOIN_ADDRESS" | "btc" => Self::BitcoinAddress,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ip4 => "IP4",
            Self::Ip6 => "IP6",
            Self::Domain => "DOMAIN",
            Self::Url => "URL",
            Self::EmailAddress => "EMAIL_ADDRESS",
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::CidrBlock => "CIDR_BLOCK",
            Self::Software => "SOFTWARE",
            Self::PhoneNumber => "PHONE_NUMBER",
            Self::RegistryKey => "REGISTRY_KEY",
            Self::BitcoinAddress => "BITCOIN_ADDRESS",
            Self::Other(raw) => raw,
        }
    }

    /// Whether values of this type are hex digests
    pub fn is_hash(&self) -> bool {
        matches!(self, Self::Md5 | Self::Sha1 | Self::Sha256)
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for IndicatorType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for IndicatorType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_vendor(&raw))
    }
}

/// A tag as delivered by a feed: a bare string or a `{ "name": ... }` object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagEntry {
    Name(String),
    Object { name: Option<String> },
}

impl TagEntry {
    pub fn name(&self) -> Option<&str> {
        match self {
            TagEntry::Name(name) => Some(name),
            TagEntry::Object { name } => name.as_deref(),
        }
    }
}

impl From<&str> for TagEntry {
    fn from(name: &str) -> Self {
        TagEntry::Name(name.to_string())
    }
}

/// A feed record before normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawIndicator {
    /// Indicator value as the feed reported it
    pub value: String,
    /// Vendor type string (e.g. `URL`, `ip-dst`)
    pub kind: String,
    /// Tags in whatever shape the feed uses
    #[serde(default)]
    pub tags: Vec<TagEntry>,
    /// First seen, epoch milliseconds
    pub first_seen: Option<i64>,
    /// Last seen, epoch milliseconds (the pagination watermark)
    pub last_seen: Option<i64>,
    /// Enclave id(s) or event title the record came from
    pub origin: Option<String>,
    /// Feed-side identifier (MISP attribute id/uuid)
    pub external_id: Option<String>,
    /// Remaining metadata kept for full exports
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RawIndicator {
    pub fn new(value: &str, kind: &str) -> Self {
        Self {
            value: value.to_string(),
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    pub fn with_tags<T: Into<TagEntry>>(mut self, tags: impl IntoIterator<Item = T>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_seen(mut self, first_seen: i64, last_seen: i64) -> Self {
        self.first_seen = Some(first_seen);
        self.last_seen = Some(last_seen);
        self
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    pub fn with_external_id(mut self, id: &str) -> Self {
        self.external_id = Some(id.to_string());
        self
    }
}

/// A normalized indicator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub value: String,
    pub indicator_type: IndicatorType,
    pub tags: Vec<String>,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
    pub origin: Option<String>,
    pub external_id: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Indicator {
    pub fn new(indicator_type: IndicatorType, value: &str) -> Self {
        Self {
            value: value.to_string(),
            indicator_type,
            tags: Vec::new(),
            first_seen: None,
            last_seen: None,
            origin: None,
            external_id: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_last_seen(mut self, last_seen: i64) -> Self {
        self.last_seen = Some(last_seen);
        self
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    pub fn with_external_id(mut self, id: &str) -> Self {
        self.external_id = Some(id.to_string());
        self
    }

    /// Tags joined with `sep`
    pub fn joined_tags(&self, sep: &str) -> String {
        self.tags.join(sep)
    }
}

static MD5_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-fA-F0-9]{32}$").unwrap());

static SHA1_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-fA-F0-9]{40}$").unwrap());

static SHA256_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-fA-F0-9]{64}$").unwrap());

/// Check a hash value against the digest length of its type.
/// Non-hash types always pass.
pub fn is_well_formed(indicator_type: &IndicatorType, value: &str) -> bool {
    match indicator_type {
        IndicatorType::Md5 => MD5_REGEX.is_match(value),
        IndicatorType::Sha1 => SHA1_REGEX.is_match(value),
        IndicatorType::Sha256 => SHA256_REGEX.is_match(value),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_vocabularies_agree() {
        assert_eq!(IndicatorType::from_vendor("IP4"), IndicatorType::Ip4);
        assert_eq!(IndicatorType::from_vendor("ip-dst"), IndicatorType::Ip4);
        assert_eq!(IndicatorType::from_vendor("hostname"), IndicatorType::Domain);
        assert_eq!(IndicatorType::from_vendor("email-src"), IndicatorType::EmailAddress);
        assert_eq!(
            IndicatorType::from_vendor("ip-dst|port"),
            IndicatorType::Other("ip-dst|port".to_string())
        );
    }

    #[test]
    fn test_type_serializes_as_vendor_string() {
        let json = serde_json::to_string(&IndicatorType::EmailAddress).unwrap();
        assert_eq!(json, "\"EMAIL_ADDRESS\"");
        let back: IndicatorType = serde_json::from_str("\"sha256\"").unwrap();
        assert_eq!(back, IndicatorType::Sha256);
    }

    #[test]
    fn test_tag_entry_shapes() {
        let tags: Vec<TagEntry> =
            serde_json::from_str(r#"["a", {"name": "b", "enclaveId": "x"}, {"id": 3}]"#).unwrap();
        assert_eq!(tags[0].name(), Some("a"));
        assert_eq!(tags[1].name(), Some("b"));
        assert_eq!(tags[2].name(), None);
    }

    #[test]
    fn test_hash_validation() {
        assert!(is_well_formed(&IndicatorType::Md5, "d41d8cd98f00b204e9800998ecf8427e"));
        assert!(!is_well_formed(&IndicatorType::Md5, "d41d8cd98f00b204"));
        assert!(!is_well_formed(
            &IndicatorType::Sha1,
            "d41d8cd98f00b204e9800998ecf8427e"
        ));
        assert!(is_well_formed(&IndicatorType::Domain, "anything"));
    }
}
