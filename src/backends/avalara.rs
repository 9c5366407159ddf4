//! Avalara AvaTax REST API (v2)

use async_trait::async_trait;
use chrono::{NaiveDate, TimeDelta, Utc};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::http::{build_client, read_json};
use super::pagination::{collect_pages, Page};
use super::{
    find_filter, into_records, ApiError, BackendClient, BackendId, DataSourceDescriptor,
    DataSourceKind, Filter, FilterOperator, Table,
};
use crate::config::AvalaraConfig;
use crate::credential_store::{unix_now, Credential};

const CLIENT_HEADER: &str = concat!("ReportPull; ", env!("CARGO_PKG_VERSION"), "; REST; v2");
/// AvaTax never returns more than this per request
const PAGE_SIZE: usize = 1000;
const MAX_PAGES: u32 = 100;
const DEFAULT_WINDOW_DAYS: i64 = 30;
const RATE_LIMIT_FLOOR: u32 = 10;
const RATE_WINDOW: Duration = Duration::from_secs(60);

const SOURCES: [(&str, &str); 4] = [
    ("companies", "Companies"),
    ("transactions", "Transactions"),
    ("tax_codes", "Tax Codes"),
    ("jurisdictions", "Jurisdictions"),
];

/// Requests left in the current rate-limit window, as last reported
#[derive(Debug)]
struct RateWindow {
    remaining: u32,
    resets_at: Instant,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            remaining: 1000,
            resets_at: now + RATE_WINDOW,
        }
    }

    /// How long to hold off before the next request
    fn delay(&mut self, now: Instant) -> Option<Duration> {
        if now >= self.resets_at {
            *self = Self::new(now);
        }
        (self.remaining <= RATE_LIMIT_FLOOR).then(|| self.resets_at - now)
    }

    fn observe(&mut self, headers: &HeaderMap, now: Instant) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };

        if let Some(remaining) = header("X-Rate-Limit-Remaining") {
            self.remaining = u32::try_from(remaining).unwrap_or(u32::MAX);
        }
        if let Some(reset) = header("X-Rate-Limit-Reset") {
            let wait = Duration::from_secs(reset.saturating_sub(unix_now())).min(RATE_WINDOW);
            self.resets_at = now + wait;
        }
    }
}

#[derive(Debug, Deserialize)]
struct Ping {
    #[serde(default)]
    authenticated: bool,
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(default)]
    value: Vec<Value>,
}

/// `date between 'start' and 'end'` from `date` filters, defaulting to the
/// last thirty days
pub fn transaction_date_filter(filters: &[Filter], today: NaiveDate) -> Result<String, ApiError> {
    let parse = |value: &str| {
        NaiveDate::parse_from_str(value.get(..10).unwrap_or(value), "%Y-%m-%d")
            .map_err(|e| ApiError::Data(format!("Invalid date {:?}: {}", value, e)))
    };

    let mut end = today;
    let mut start = None;
    for filter in filters.iter().filter(|f| f.column.eq_ignore_ascii_case("date")) {
        match filter.operator {
            FilterOperator::GreaterThan | FilterOperator::GreaterOrEqual => {
                start = Some(parse(&filter.value)?)
            }
            FilterOperator::LessThan | FilterOperator::LessOrEqual => end = parse(&filter.value)?,
            FilterOperator::Equals => {
                let day = parse(&filter.value)?;
                start = Some(day);
                end = day;
            }
            _ => {}
        }
    }
    let start = start.unwrap_or(end - TimeDelta::days(DEFAULT_WINDOW_DAYS));

    if start > end {
        return Err(ApiError::Data(format!(
            "Date range starts after it ends ({} > {})",
            start, end
        )));
    }
    Ok(format!(
        "date between '{}' and '{}'",
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d")
    ))
}

fn is_server_side(filter: &Filter) -> bool {
    filter.column.eq_ignore_ascii_case("date")
        || filter.column.eq_ignore_ascii_case("companyCode")
        || filter.column.eq_ignore_ascii_case("country")
}

pub struct AvalaraClient {
    http: Client,
    max_records: usize,
    rate: Mutex<RateWindow>,
}

impl AvalaraClient {
    pub fn new(config: &AvalaraConfig) -> Result<Self, ApiError> {
        Ok(Self {
            http: build_client(Duration::from_secs(config.timeout_secs))?,
            max_records: config.max_records,
            rate: Mutex::new(RateWindow::new(Instant::now())),
        })
    }

    async fn throttle(&self) {
        let delay = self
            .rate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .delay(Instant::now());
        if let Some(delay) = delay {
            tracing::warn!("Avalara rate limit nearly exhausted, pausing {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn get(
        &self,
        credential: &Credential,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ApiError> {
        let base = credential
            .instance_url
            .as_deref()
            .ok_or_else(|| ApiError::Data("Avalara base URL is not configured".to_string()))?;
        let (account, license) = credential
            .access_token
            .split_once(':')
            .ok_or_else(|| ApiError::Auth("Avalara credential is not account:license".to_string()))?;
        let url = format!("{}/api/v2/{}", base.trim_end_matches('/'), path);

        self.throttle().await;
        tracing::debug!("GET {}", url);
        let response = self
            .http
            .get(&url)
            .basic_auth(account, Some(license))
            .header("X-Avalara-Client", CLIENT_HEADER)
            .query(params)
            .send()
            .await?;

        self.rate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(response.headers(), Instant::now());
        read_json(response).await
    }

    async fn list(
        &self,
        credential: &Credential,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Map<String, Value>>, ApiError> {
        let items = collect_pages(0usize, MAX_PAGES, self.max_records, move |skip| async move {
            let mut query = params.to_vec();
            query.push(("$top", PAGE_SIZE.to_string()));
            query.push(("$skip", skip.to_string()));

            let listing: Listing = serde_json::from_value(self.get(credential, path, &query).await?)
                .map_err(|e| ApiError::Data(format!("Malformed Avalara listing: {}", e)))?;
            Ok(Page::offset(listing.value, skip, PAGE_SIZE))
        })
        .await?;
        Ok(into_records(items))
    }

    async fn default_company_code(&self, credential: &Credential) -> Result<String, ApiError> {
        let listing: Listing =
            serde_json::from_value(self.get(credential, "companies", &[("$top", "1".to_string())]).await?)
                .map_err(|e| ApiError::Data(format!("Malformed Avalara listing: {}", e)))?;

        listing
            .value
            .first()
            .and_then(|company| company.get("companyCode"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Data("Avalara account has no companies".to_string()))
    }

    /// Transactions of one company; the company defaults to the account's first
    pub async fn transactions(
        &self,
        credential: &Credential,
        filters: &[Filter],
    ) -> Result<Vec<Map<String, Value>>, ApiError> {
        let company = match find_filter(filters, "companyCode", FilterOperator::Equals) {
            Some(filter) => filter.value.clone(),
            None => self.default_company_code(credential).await?,
        };
        if company.is_empty() || company.contains('/') {
            return Err(ApiError::Data(format!("Invalid company code: {:?}", company)));
        }

        let date_filter = transaction_date_filter(filters, Utc::now().date_naive())?;
        tracing::info!("Loading Avalara transactions for {} ({})", company, date_filter);

        let path = format!("companies/{}/transactions", urlencoding::encode(&company));
        self.list(credential, &path, &[("$filter", date_filter)]).await
    }
}

#[async_trait]
impl BackendClient for AvalaraClient {
    fn backend(&self) -> BackendId {
        BackendId::Avalara
    }

    async fn confirm(&self, credential: &Credential) -> Result<(), ApiError> {
        let ping: Ping = serde_json::from_value(self.get(credential, "utilities/ping", &[]).await?)
            .map_err(|e| ApiError::Data(format!("Malformed ping response: {}", e)))?;
        if ping.authenticated {
            Ok(())
        } else {
            Err(ApiError::Auth(
                "Avalara did not accept the account id and license key".to_string(),
            ))
        }
    }

    async fn list_data_sources(
        &self,
        _credential: &Credential,
    ) -> Result<Vec<DataSourceDescriptor>, ApiError> {
        Ok(SOURCES
            .iter()
            .map(|(id, name)| {
                DataSourceDescriptor::new(BackendId::Avalara, DataSourceKind::Collection, *id, *name)
            })
            .collect())
    }

    async fn fetch_data(
        &self,
        credential: &Credential,
        source: &DataSourceDescriptor,
        filters: &[Filter],
    ) -> Result<Table, ApiError> {
        let mut records = match source.id.as_str() {
            "companies" => self.list(credential, "companies", &[]).await?,
            "transactions" => self.transactions(credential, filters).await?,
            "tax_codes" => self.list(credential, "definitions/taxcodes", &[]).await?,
            "jurisdictions" => {
                let country = find_filter(filters, "country", FilterOperator::Equals)
                    .map(|f| f.value.clone())
                    .unwrap_or_else(|| "US".to_string());
                self.list(credential, "definitions/jurisdictions", &[("country", country)])
                    .await?
            }
            other => return Err(ApiError::Data(format!("Unknown Avalara source: {}", other))),
        };

        records.retain(|record| {
            filters
                .iter()
                .filter(|f| !is_server_side(f))
                .all(|f| f.matches(record))
        });
        Ok(Table::from_records(records))
    }
}
