use crate::error::Error;
use crate::visits::{Visit, VisitBatch, VisitQuery, VisitSource};
use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://my.imperva.com/api/visits/v1";
const PAGE_SIZE: usize = 100;
const TIMEOUT: Duration = Duration::from_secs(60);

/// Blocking client for the vendor's visits API
pub struct ImpervaClient {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct VisitsResponse {
    #[serde(default)]
    res: i64,
    #[serde(default)]
    res_message: String,
    #[serde(default)]
    visits: Option<Vec<Visit>>,
}

impl ImpervaClient {
    pub fn new(api_id: &str, api_key: &str, endpoint: impl Into<String>) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-id",
            HeaderValue::from_str(api_id.trim())
                .map_err(|_| Error::Upstream("invalid characters in API id".into()))?,
        );
        let mut key = HeaderValue::from_str(api_key.trim())
            .map_err(|_| Error::Upstream("invalid characters in API key".into()))?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);

        let client = Client::builder()
            .timeout(TIMEOUT)
            .default_headers(headers)
            .build()?;
        Ok(ImpervaClient {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Build from `IMPERVA_API_ID`, `IMPERVA_API_KEY` and the optional `IMPERVA_API_URL`.
    pub fn from_env() -> Result<Self, Error> {
        let api_id = required_env("IMPERVA_API_ID")?;
        let api_key = required_env("IMPERVA_API_KEY")?;
        let endpoint = std::env::var("IMPERVA_API_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Self::new(&api_id, &api_key, endpoint)
    }

    fn fetch_page(&self, query: &VisitQuery, page_num: usize) -> Result<Vec<Visit>, Error> {
        let params = [
            ("site_id", query.site_id.clone()),
            ("time_range", "custom".to_string()),
            ("start", query.start.timestamp_millis().to_string()),
            ("end", query.end.timestamp_millis().to_string()),
            ("page_size", PAGE_SIZE.to_string()),
            ("page_num", page_num.to_string()),
        ];

        let resp = self.client.post(&self.endpoint).form(&params).send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(Error::Upstream(format!(
                "visits request failed ({}): {}",
                status, body
            )));
        }

        let parsed: VisitsResponse = resp
            .json()
            .map_err(|e| Error::Upstream(format!("could not parse visits response: {}", e)))?;
        check_response(parsed)
    }
}

fn check_response(parsed: VisitsResponse) -> Result<Vec<Visit>, Error> {
    if parsed.res != 0 {
        return Err(Error::Upstream(format!(
            "API error {}: {}",
            parsed.res, parsed.res_message
        )));
    }
    match parsed.visits {
        Some(visits) => Ok(visits),
        None => {
            warn!("visits response carried no visits list");
            Ok(Vec::new())
        }
    }
}

impl VisitSource for ImpervaClient {
    fn get_visits(&self, query: &VisitQuery) -> Result<VisitBatch, Error> {
        collect_pages(query.max_pages, &query.codes, |page_num| {
            self.fetch_page(query, page_num)
        })
    }
}

/// Pull up to `max_pages` pages through `fetch`, stopping after the first
/// short page. Any failed page fails the whole batch.
fn collect_pages<F>(max_pages: usize, codes: &[String], mut fetch: F) -> Result<VisitBatch, Error>
where
    F: FnMut(usize) -> Result<Vec<Visit>, Error>,
{
    let mut batch = VisitBatch::default();

    for page_num in 0..max_pages {
        let page = fetch(page_num)?;
        let count = page.len();
        debug!("page {}: {} visits", page_num, count);

        for visit in page {
            batch.push(visit, codes);
        }
        if count < PAGE_SIZE {
            break;
        }
    }

    Ok(batch)
}

fn required_env(name: &'static str) -> Result<String, Error> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::MissingCredentials(name)),
    }
}
