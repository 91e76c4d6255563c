//! HTTP gateway over the external vacancy search API.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{SalaryRange, SearchQuery, VacancyRecord};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "jobwatch-client";

pub const DEFAULT_BASE_URL: &str = "https://api.hh.ru";
pub const DEFAULT_USER_AGENT: &str = "JobWatchBot/1.0";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SearchClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for SearchClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Search seam the engine depends on, so tests can substitute a double.
#[async_trait]
pub trait VacancyProvider: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Vec<VacancyRecord>;
}

/// Client for the vacancies endpoint. One reqwest client, built once, with
/// the overall timeout and the identifying User-Agent on the builder.
#[derive(Debug)]
pub struct SearchClient {
    client: reqwest::Client,
    base_url: String,
}

impl SearchClient {
    pub fn new(config: SearchClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Run one search. Never raises to the caller: any transport, status, or
    /// body failure is logged and degraded to an empty result.
    pub async fn search(&self, query: &SearchQuery) -> Vec<VacancyRecord> {
        match self.try_search(query).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "vacancy search failed, returning empty result");
                Vec::new()
            }
        }
    }

    pub async fn try_search(&self, query: &SearchQuery) -> Result<Vec<VacancyRecord>, SearchError> {
        let url = format!("{}/vacancies", self.base_url);
        let params = query_params(query);

        let response = self.client.get(&url).query(&params).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(SearchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = response.bytes().await?;
        let parsed: SearchResponse = serde_json::from_slice(&body)?;
        debug!(found = parsed.found, pages = parsed.pages, "search page fetched");

        Ok(parsed.items.into_iter().map(record_from_item).collect())
    }
}

#[async_trait]
impl VacancyProvider for SearchClient {
    async fn search(&self, query: &SearchQuery) -> Vec<VacancyRecord> {
        SearchClient::search(self, query).await
    }
}

/// Canonical query-string serialization: numbers and booleans as their
/// string forms, the area id as a string, and the text parameter omitted
/// entirely when there is no term (the API rejects an empty one).
pub fn query_params(query: &SearchQuery) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();

    match query.text.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => {
            params.push(("text", text.to_string()));
            params.push(("search_field", "name".to_string()));
        }
        _ => {}
    }
    if let Some(experience) = query.experience {
        params.push(("experience", experience.as_param().to_string()));
    }
    if let Some(salary) = query.salary {
        params.push(("salary", salary.to_string()));
    }
    if query.only_with_salary {
        params.push(("only_with_salary", "true".to_string()));
    }
    if let Some(schedule) = query.schedule {
        params.push(("schedule", schedule.as_param().to_string()));
    }
    if let Some(employment) = query.employment {
        params.push(("employment", employment.as_param().to_string()));
    }
    if let Some(area) = query.area {
        params.push(("area", area.to_string()));
    }
    params.push(("per_page", query.per_page.to_string()));
    params.push(("page", query.page.to_string()));
    if let Some(order_by) = query.order_by.as_deref() {
        params.push(("order_by", order_by.to_string()));
    }
    if let Some(date_from) = query.date_from {
        params.push(("date_from", date_from.format("%Y-%m-%d").to_string()));
    }

    params
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<VacancyItem>,
    #[serde(default)]
    found: u64,
    #[serde(default)]
    pages: u32,
}

#[derive(Debug, Deserialize)]
struct VacancyItem {
    id: String,
    name: String,
    employer: Option<NamedRef>,
    salary: Option<SalaryDto>,
    area: Option<NamedRef>,
    experience: Option<NamedRef>,
    alternate_url: Option<String>,
    published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SalaryDto {
    from: Option<i64>,
    to: Option<i64>,
    currency: Option<String>,
}

fn record_from_item(item: VacancyItem) -> VacancyRecord {
    let published_at = item
        .published_at
        .as_deref()
        .and_then(|raw| parse_published_at(raw, &item.id));

    VacancyRecord {
        id: item.id,
        title: item.name,
        employer: item.employer.and_then(|e| e.name),
        area: item.area.and_then(|a| a.name),
        experience: item.experience.and_then(|e| e.name),
        salary: item.salary.map(|s| SalaryRange {
            from: s.from,
            to: s.to,
            currency: s.currency.unwrap_or_else(|| "RUR".to_string()),
        }),
        published_at,
        url: item.alternate_url.unwrap_or_default(),
    }
}

/// The API sends ISO-8601 with a numeric offset and no colon
/// (`2026-03-01T10:00:00+0300`); rfc3339 is accepted as a fallback.
/// Malformed values degrade to `None` rather than failing the item.
fn parse_published_at(raw: &str, vacancy_id: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            warn!(vacancy_id, raw, error = %err, "unparsable publication timestamp");
            err
        })
        .ok()
}
