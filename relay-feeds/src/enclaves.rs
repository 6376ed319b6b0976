//! TruSTAR enclaves and permission filtering

use serde::{Deserialize, Serialize};

/// An enclave visible to the API user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enclave {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub enclave_type: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub workflow_supported: Option<bool>,
}

/// Permission filter; `None` ignores that permission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnclaveFilter {
    pub create: Option<bool>,
    pub update: Option<bool>,
}

impl EnclaveFilter {
    pub fn matches(&self, enclave: &Enclave) -> bool {
        self.create.map_or(true, |create| enclave.create == create)
            && self.update.map_or(true, |update| enclave.update == update)
    }

    /// Filtered enclaves sorted by name
    pub fn apply(&self, enclaves: Vec<Enclave>) -> Vec<Enclave> {
        let mut kept: Vec<Enclave> = enclaves.into_iter().filter(|e| self.matches(e)).collect();
        kept.sort_by(|a, b| a.name.cmp(&b.name));
        kept
    }
}

/// Ids from `wanted` the user has no access to
pub fn inaccessible<'a>(wanted: &'a [String], available: &[Enclave]) -> Vec<&'a str> {
    wanted
        .iter()
        .filter(|id| !available.iter().any(|e| &e.id == *id))
        .map(String::as_str)
        .collect()
}
