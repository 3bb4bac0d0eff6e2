use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

/// A single visit as reported by the WAF
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    #[serde(rename = "clientIPs", default)]
    pub client_ips: Vec<String>,
    #[serde(default)]
    pub entry_page: String,
    /// Milliseconds since the Unix epoch
    pub start_time: i64,
    /// Rule code → number of events raised for this visit
    #[serde(default)]
    pub security_summary: BTreeMap<String, u64>,
}

impl Visit {
    /// True when any rule code on the visit starts with one of `prefixes`.
    /// An empty prefix list matches everything.
    pub fn matches_codes(&self, prefixes: &[String]) -> bool {
        prefixes.is_empty()
            || self
                .security_summary
                .keys()
                .any(|code| prefixes.iter().any(|p| code.starts_with(p.as_str())))
    }
}

/// What to fetch from the visit source
#[derive(Debug, Clone)]
pub struct VisitQuery {
    pub site_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub max_pages: usize,
    pub codes: Vec<String>,
}

/// Visits matching a query plus a tally of every rule code seen while fetching
#[derive(Debug, Default, Clone)]
pub struct VisitBatch {
    pub visits: Vec<Visit>,
    pub codes: BTreeMap<String, u64>,
}

impl VisitBatch {
    /// Tally the visit's codes, then keep it if it passes the filter.
    pub fn push(&mut self, visit: Visit, prefixes: &[String]) {
        for (code, count) in &visit.security_summary {
            *self.codes.entry(code.clone()).or_insert(0) += count;
        }
        if visit.matches_codes(prefixes) {
            self.visits.push(visit);
        }
    }
}

/// Anything that can list visits for a site over a time window
pub trait VisitSource {
    fn get_visits(&self, query: &VisitQuery) -> Result<VisitBatch, Error>;
}

pub const DEFAULT_SCAN_MAX_PAGES: usize = 10;
pub const DEFAULT_UPDATE_MAX_PAGES: usize = 1000;

/// Resolve a `--max-pages` value, falling back when absent or below 1.
pub fn max_pages_or(requested: Option<i64>, default: usize) -> usize {
    match requested {
        Some(n) if n >= 1 => usize::try_from(n).unwrap_or(default),
        _ => default,
    }
}

/// Trim the `--code` values and drop blank ones, which would match every code.
/// An empty result is rejected before any network traffic happens.
pub fn require_codes(codes: &[String]) -> Result<Vec<String>, Error> {
    let codes: Vec<String> = codes
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    if codes.is_empty() {
        return Err(Error::NoCodesSpecified);
    }
    Ok(codes)
}
