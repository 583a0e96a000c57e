//! Label selector compilation
//!
//! The same query is rendered as a Kubernetes selector string for live
//! listings and evaluated in memory for cache reads.

use super::DirectoryError;
use crate::models::LabelSelector;
use std::collections::BTreeMap;
use std::fmt;

/// Longest label name or value the API server accepts
const MAX_NAME_LEN: usize = 63;
/// Longest key prefix (a DNS subdomain)
const MAX_PREFIX_LEN: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Exists(String),
    Equals(String, String),
}

/// ANDed set of label requirements; empty matches everything
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelQuery {
    requirements: Vec<Requirement>,
}

impl LabelQuery {
    /// Compile selectors, rejecting keys and values outside Kubernetes
    /// label syntax. Selectors with an empty key are dropped.
    pub fn new(selectors: &[LabelSelector]) -> Result<Self, DirectoryError> {
        let mut requirements = Vec::with_capacity(selectors.len());
        for selector in selectors.iter().filter(|s| !s.key.is_empty()) {
            validate(selector).map_err(|reason| DirectoryError::InvalidSelector {
                key: selector.key.clone(),
                value: selector.value.clone(),
                reason,
            })?;
            requirements.push(if selector.value.is_empty() {
                Requirement::Exists(selector.key.clone())
            } else {
                Requirement::Equals(selector.key.clone(), selector.value.clone())
            });
        }

        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::Equals(key, value) => labels.get(key) == Some(value),
        })
    }
}

impl fmt::Display for LabelQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, req) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match req {
                Requirement::Exists(key) => f.write_str(key)?,
                Requirement::Equals(key, value) => write!(f, "{}={}", key, value)?,
            }
        }
        Ok(())
    }
}

fn validate(selector: &LabelSelector) -> Result<(), &'static str> {
    let name = match selector.key.split_once('/') {
        Some((prefix, name)) => {
            if !is_dns_subdomain(prefix) {
                return Err("key prefix must be a lowercase DNS subdomain");
            }
            name
        }
        None => selector.key.as_str(),
    };
    if !is_label_name(name) {
        return Err("key name must be 1-63 alphanumerics, '-', '_' or '.' with alphanumeric ends");
    }
    if !selector.value.is_empty() && !is_label_name(&selector.value) {
        return Err("value must be at most 63 alphanumerics, '-', '_' or '.' with alphanumeric ends");
    }
    Ok(())
}

fn is_label_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_NAME_LEN
        && s.starts_with(|c: char| c.is_ascii_alphanumeric())
        && s.ends_with(|c: char| c.is_ascii_alphanumeric())
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_dns_subdomain(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_PREFIX_LEN
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= MAX_NAME_LEN
                && label.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
                && label.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}
