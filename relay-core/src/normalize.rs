//! Field mapper: raw feed records to normalized indicators
//!
//! Every input record yields either an [`Indicator`] or a [`SkipReason`];
//! nothing is dropped silently.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{is_well_formed, Indicator, IndicatorType, RawIndicator, TagEntry};

/// Why a record was not normalized
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SkipReason {
    #[error("empty indicator value")]
    EmptyValue,

    #[error("tag without a name on {value}")]
    MalformedTag { value: String },

    #[error("{value} is not a valid {kind} digest")]
    MalformedHash { kind: IndicatorType, value: String },
}

impl SkipReason {
    /// Stable label used to count skips
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::EmptyValue => "empty_value",
            SkipReason::MalformedTag { .. } => "malformed_tag",
            SkipReason::MalformedHash { .. } => "malformed_hash",
        }
    }
}

/// Knobs for the field mapper
#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Tags removed from every record (e.g. the feed's own selection tag)
    pub exclude_tags: Vec<String>,
}

impl NormalizeOptions {
    pub fn excluding(tag: &str) -> Self {
        Self {
            exclude_tags: vec![tag.to_string()],
        }
    }
}

/// Outcome of normalizing a batch
#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    pub indicators: Vec<Indicator>,
    pub skipped: Vec<SkipReason>,
}

impl NormalizeReport {
    /// Number of input records this report accounts for
    pub fn total(&self) -> usize {
        self.indicators.len() + self.skipped.len()
    }

    /// Skip counts by reason label
    pub fn skip_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for reason in &self.skipped {
            *counts.entry(reason.label()).or_insert(0) += 1;
        }
        counts
    }
}

/// Flatten tag entries into names, failing on an unnamed tag object
pub fn flatten_tags(tags: &[TagEntry]) -> Option<Vec<String>> {
    tags.iter()
        .map(|tag| tag.name().map(str::to_string))
        .collect()
}

/// Flatten and join tags with `sep`
pub fn join_tags(tags: &[TagEntry], sep: &str) -> Option<String> {
    flatten_tags(tags).map(|names| names.join(sep))
}

/// Normalize one record
pub fn normalize(raw: &RawIndicator, opts: &NormalizeOptions) -> Result<Indicator, SkipReason> {
    let value = raw.value.trim();
    if value.is_empty() {
        return Err(SkipReason::EmptyValue);
    }

    let indicator_type = IndicatorType::from_vendor(&raw.kind);
    if !is_well_formed(&indicator_type, value) {
        return Err(SkipReason::MalformedHash {
            kind: indicator_type,
            value: value.to_string(),
        });
    }

    let tags = flatten_tags(&raw.tags).ok_or_else(|| SkipReason::MalformedTag {
        value: value.to_string(),
    })?;
    let tags = tags
        .into_iter()
        .filter(|tag| !opts.exclude_tags.iter().any(|excluded| excluded == tag))
        .collect();

    Ok(Indicator {
        value: value.to_string(),
        indicator_type,
        tags,
        first_seen: raw.first_seen,
        last_seen: raw.last_seen,
        origin: raw.origin.clone(),
        external_id: raw.external_id.clone(),
        extra: raw.extra.clone(),
    })
}

/// Normalize a batch, collecting skips instead of failing
pub fn normalize_all(raws: &[RawIndicator], opts: &NormalizeOptions) -> NormalizeReport {
    let mut report = NormalizeReport::default();

    for raw in raws {
        match normalize(raw, opts) {
            Ok(indicator) => report.indicators.push(indicator),
            Err(reason) => {
                warn!("Skipping indicator: {}", reason);
                report.skipped.push(reason);
            }
        }
    }

    debug!(
        "Normalized {} of {} records ({} skipped)",
        report.indicators.len(),
        raws.len(),
        report.skipped.len()
    );
    report
}
