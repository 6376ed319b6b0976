//! Indicator classification for destination encoders
//!
//! Feeds frequently type bare domains as URLs. [`classify`] decides once what
//! an indicator really is, so encoders only match on [`IocKind`].

use crate::{Indicator, IndicatorType};

/// Digest algorithm of a hash indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
        }
    }
}

/// What an indicator is, after URL/domain reclassification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IocKind {
    /// IP address (`v6` for IPv6)
    Ip { value: String, v6: bool },
    /// CIDR network block
    Cidr(String),
    /// Bare domain (including URL-typed values with no path)
    Domain(String),
    /// Real URL; `stripped` has the scheme removed
    Url { original: String, stripped: String },
    /// File hash
    Hash { algo: HashAlgo, value: String },
    /// Email address
    Email(String),
    /// File or software name
    FileName(String),
    /// No destination-relevant category
    Other(IndicatorType),
}

impl IocKind {
    /// Downstream wildcard form of a URL (`*` + scheme-less value)
    pub fn wildcard(&self) -> Option<String> {
        match self {
            IocKind::Url { stripped, .. } => Some(format!("*{}", stripped)),
            _ => None,
        }
    }

    /// Short label used in logs and skip counts
    pub fn label(&self) -> String {
        match self {
            IocKind::Ip { v6: false, .. } => "ipv4".to_string(),
            IocKind::Ip { v6: true, .. } => "ipv6".to_string(),
            IocKind::Cidr(_) => "cidr".to_string(),
            IocKind::Domain(_) => "domain".to_string(),
            IocKind::Url { .. } => "url".to_string(),
            IocKind::Hash { algo, .. } => algo.as_str().to_string(),
            IocKind::Email(_) => "email".to_string(),
            IocKind::FileName(_) => "filename".to_string(),
            IocKind::Other(kind) => kind.as_str().to_lowercase(),
        }
    }
}

/// Outcome of inspecting a URL-typed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlShape {
    /// Only a host; carries the host without any trailing slash
    Domain(String),
    /// A real URL; carries the scheme-less value
    Url(String),
}

/// Decide whether a URL-typed value is really a bare domain.
///
/// After dropping any scheme: no `/` means a domain unless the value has `@`
/// or `:`; otherwise the part before the first `/` is the network location,
/// and an empty remainder with no `@`/`:` in the network location is a domain
/// with a trailing slash.
pub fn url_shape(value: &str) -> UrlShape {
    let rest = match value.split_once("://") {
        Some((_, rest)) => rest,
        None => value,
    };

    match rest.split_once('/') {
        Some((netloc, remainder)) => {
            if !remainder.is_empty() || netloc.contains('@') || netloc.contains(':') {
                UrlShape::Url(rest.to_string())
            } else {
                UrlShape::Domain(netloc.to_string())
            }
        }
        None => {
            if rest.contains('@') || rest.contains(':') {
                UrlShape::Url(rest.to_string())
            } else {
                UrlShape::Domain(rest.to_string())
            }
        }
    }
}

/// Classify a normalized indicator
pub fn classify(indicator: &Indicator) -> IocKind {
    let value = indicator.value.clone();
    match &indicator.indicator_type {
        IndicatorType::Ip4 => IocKind::Ip { value, v6: false },
        IndicatorType::Ip6 => IocKind::Ip { value, v6: true },
        IndicatorType::CidrBlock => IocKind::Cidr(value),
        IndicatorType::Domain => IocKind::Domain(value),
        IndicatorType::Url => match url_shape(&value) {
            UrlShape::Domain(domain) => IocKind::Domain(domain),
            UrlShape::Url(stripped) => IocKind::Url {
                original: value,
                stripped,
            },
        },
        IndicatorType::Md5 => IocKind::Hash { algo: HashAlgo::Md5, value },
        IndicatorType::Sha1 => IocKind::Hash { algo: HashAlgo::Sha1, value },
        IndicatorType::Sha256 => IocKind::Hash { algo: HashAlgo::Sha256, value },
        IndicatorType::EmailAddress => IocKind::Email(value),
        IndicatorType::Software => IocKind::FileName(value),
        other => IocKind::Other(other.clone()),
    }
}

/// Apply reclassification to the indicator itself: URL-typed values that are
/// bare domains become `DOMAIN` indicators holding the host.
pub fn reclassify(indicator: &Indicator) -> Indicator {
    let mut out = indicator.clone();
    if let IocKind::Domain(domain) = classify(indicator) {
        if indicator.indicator_type == IndicatorType::Url {
            out.indicator_type = IndicatorType::Domain;
            out.value = domain;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(value: &str) -> IocKind {
        classify(&Indicator::new(IndicatorType::Url, value))
    }

    #[test]
    fn test_bare_domain_urls() {
        assert_eq!(url("http://example.com"), IocKind::Domain("example.com".to_string()));
        assert_eq!(url("http://example.com/"), IocKind::Domain("example.com".to_string()));
        assert_eq!(url("example.com"), IocKind::Domain("example.com".to_string()));
    }

    #[test]
    fn test_path_url_gets_wildcard() {
        let kind = url("http://example.com/path");
        assert_eq!(
            kind,
            IocKind::Url {
                original: "http://example.com/path".to_string(),
                stripped: "example.com/path".to_string(),
            }
        );
        assert_eq!(kind.wildcard().as_deref(), Some("*example.com/path"));
    }

    #[test]
    fn test_userinfo_and_port_stay_urls() {
        assert!(matches!(url("http://user@example.com"), IocKind::Url { .. }));
        assert!(matches!(url("http://example.com:8080"), IocKind::Url { .. }));
        assert!(matches!(url("http://example.com:8080/"), IocKind::Url { .. }));
        assert!(matches!(url("user@example.com/"), IocKind::Url { .. }));
    }

    #[test]
    fn test_only_first_scheme_separator_is_stripped() {
        assert_eq!(
            url_shape("http://example.com/redirect?to=https://evil.com"),
            UrlShape::Url("example.com/redirect?to=https://evil.com".to_string())
        );
    }

    #[test]
    fn test_non_url_types() {
        let hash = Indicator::new(IndicatorType::Sha1, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert!(matches!(classify(&hash), IocKind::Hash { algo: HashAlgo::Sha1, .. }));
        let phone = Indicator::new(IndicatorType::PhoneNumber, "+15555550100");
        assert_eq!(classify(&phone), IocKind::Other(IndicatorType::PhoneNumber));
        assert_eq!(classify(&phone).label(), "phone_number");
    }

    #[test]
    fn test_reclassify_rewrites_domain_urls_only() {
        let bare = reclassify(&Indicator::new(IndicatorType::Url, "https://evil.com/"));
        assert_eq!(bare.indicator_type, IndicatorType::Domain);
        assert_eq!(bare.value, "evil.com");

        let real = reclassify(&Indicator::new(IndicatorType::Url, "https://evil.com/a"));
        assert_eq!(real.indicator_type, IndicatorType::Url);
        assert_eq!(real.value, "https://evil.com/a");
    }
}
