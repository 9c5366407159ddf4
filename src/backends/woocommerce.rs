//! WooCommerce REST API (v3) and WooPayments transaction reports

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::ControlFlow;
use std::time::Duration;

use super::http::{build_client, read_json};
use super::pagination::{collect_pages, scan_pages, Page};
use super::{
    find_filter, into_records, ApiError, BackendClient, BackendId, DataSourceDescriptor,
    DataSourceKind, Filter, FilterOperator, Table,
};
use crate::config::WooCommerceConfig;
use crate::credential_store::Credential;

const API_PATH: &str = "/wp-json/wc/v3";
const TRANSACTIONS_PATH: &str = "payments/reports/transactions";
/// WooCommerce refuses larger pages
const MAX_PER_PAGE: usize = 100;

const COLLECTIONS: [(&str, &str); 5] = [
    ("products", "Products"),
    ("orders", "Orders"),
    ("customers", "Customers"),
    ("payments", "Payment Transactions"),
    ("fee_summary", "Transaction Fees Summary"),
];

/// Processing fee charged on one payment
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentFee {
    pub payment_id: String,
    /// In currency units, rounded to cents
    pub fees: f64,
}

/// WooPayments reports amounts in cents
pub fn cents_to_units(value: &Value) -> f64 {
    let cents = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    cents.round() / 100.0
}

/// Date filters arrive as `YYYY-MM-DD`; the API wants ISO 8601 timestamps
fn iso_timestamp(value: &str) -> String {
    if value.len() == 10 {
        format!("{}T00:00:00", value)
    } else {
        value.to_string()
    }
}

fn date_range(filters: &[Filter], column: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    for filter in filters.iter().filter(|f| f.column.eq_ignore_ascii_case(column)) {
        match filter.operator {
            FilterOperator::GreaterThan | FilterOperator::GreaterOrEqual => {
                params.push(("after".to_string(), iso_timestamp(&filter.value)))
            }
            FilterOperator::LessThan | FilterOperator::LessOrEqual => {
                params.push(("before".to_string(), iso_timestamp(&filter.value)))
            }
            _ => {}
        }
    }
    params
}

/// Whether `date_range` turned this filter into an `after`/`before` parameter
fn is_date_bound(filter: &Filter, date_column: &str) -> bool {
    filter.column.eq_ignore_ascii_case(date_column)
        && matches!(
            filter.operator,
            FilterOperator::GreaterThan
                | FilterOperator::GreaterOrEqual
                | FilterOperator::LessThan
                | FilterOperator::LessOrEqual
        )
}

fn is_status_param(filter: &Filter) -> bool {
    filter.column.eq_ignore_ascii_case("status") && filter.operator == FilterOperator::Equals
}

fn retain_matching(records: &mut Vec<Map<String, Value>>, filters: &[Filter]) {
    records.retain(|record| filters.iter().all(|f| f.matches(record)));
}

pub struct WooCommerceClient {
    http: Client,
    per_page: usize,
    max_pages: u32,
    max_records: usize,
}

impl WooCommerceClient {
    pub fn new(config: &WooCommerceConfig) -> Result<Self, ApiError> {
        Ok(Self {
            http: build_client(Duration::from_secs(config.timeout_secs))?,
            per_page: config.per_page.clamp(1, MAX_PER_PAGE),
            max_pages: config.max_pages,
            max_records: config.max_records,
        })
    }

    fn endpoint(&self, credential: &Credential, path: &str) -> Result<String, ApiError> {
        let store = credential
            .instance_url
            .as_deref()
            .ok_or_else(|| ApiError::Data("WooCommerce store URL is not configured".to_string()))?;
        Ok(format!("{}{}/{}", store.trim_end_matches('/'), API_PATH, path))
    }

    fn key_pair(credential: &Credential) -> Result<(&str, &str), ApiError> {
        credential
            .access_token
            .split_once(':')
            .ok_or_else(|| ApiError::Auth("WooCommerce credential is not key:secret".to_string()))
    }

    async fn get_page(
        &self,
        credential: &Credential,
        path: &str,
        page: u32,
        per_page: usize,
        params: &[(String, String)],
    ) -> Result<Page<Value, u32>, ApiError> {
        let url = self.endpoint(credential, path)?;
        let (key, secret) = Self::key_pair(credential)?;

        tracing::debug!("GET {} page {}", url, page);
        let response = self
            .http
            .get(&url)
            .basic_auth(key, Some(secret))
            .query(&[("per_page", per_page.to_string()), ("page", page.to_string())])
            .query(params)
            .send()
            .await?;

        // transaction reports wrap their rows in `data`
        let items = match read_json::<Value>(response).await? {
            Value::Array(items) => items,
            Value::Object(mut body) => match body.remove("data") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            other => {
                return Err(ApiError::Data(format!(
                    "Unexpected WooCommerce response: {}",
                    other
                )))
            }
        };
        Ok(Page::numbered(items, page, per_page))
    }

    async fn collect(
        &self,
        credential: &Credential,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Map<String, Value>>, ApiError> {
        let per_page = self.per_page;
        let items = collect_pages(1, self.max_pages, self.max_records, move |page| {
            self.get_page(credential, path, page, per_page, params)
        })
        .await?;
        Ok(into_records(items))
    }

    /// Look up processing fees for Stripe payment intents (`pi_...`).
    ///
    /// Pages are scanned newest first and the scan stops as soon as every
    /// requested id has been seen. Duplicate rows keep the highest fee.
    pub async fn find_payment_fees(
        &self,
        credential: &Credential,
        payment_ids: &[String],
    ) -> Result<Vec<PaymentFee>, ApiError> {
        let mut pending: HashSet<&str> = payment_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| id.starts_with("pi_"))
            .collect();
        if pending.is_empty() {
            tracing::debug!("No payment intent ids to look up");
            return Ok(Vec::new());
        }

        let wanted: HashSet<String> = pending.iter().map(|id| id.to_string()).collect();
        let mut fees: BTreeMap<String, f64> = BTreeMap::new();
        let per_page = MAX_PER_PAGE;
        let params: Vec<(String, String)> = Vec::new();
        let params = &params;

        let summary = scan_pages(
            1,
            self.max_pages,
            move |page| self.get_page(credential, TRANSACTIONS_PATH, page, per_page, params),
            |items| {
                for item in &items {
                    let Some(id) = item.get("payment_id").and_then(Value::as_str) else {
                        continue;
                    };
                    if !wanted.contains(id) {
                        continue;
                    }
                    pending.remove(id);

                    let fee = item.get("fees").map(cents_to_units).unwrap_or(0.0);
                    if fee > 0.0 {
                        let entry = fees.entry(id.to_string()).or_insert(fee);
                        *entry = entry.max(fee);
                    }
                }
                if pending.is_empty() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )
        .await?;

        tracing::info!(
            "Found fees for {}/{} payments after {} pages",
            fees.len(),
            wanted.len(),
            summary.pages_fetched
        );

        Ok(fees
            .into_iter()
            .map(|(payment_id, fees)| PaymentFee { payment_id, fees })
            .collect())
    }

    async fn payments(&self, credential: &Credential, filters: &[Filter]) -> Result<Table, ApiError> {
        if let Some(lookup) = find_filter(filters, "payment_id", FilterOperator::Includes) {
            let ids: Vec<String> = lookup.value.split(',').map(str::to_string).collect();
            let fees = self.find_payment_fees(credential, &ids).await?;
            let mut table = Table::new(vec!["payment_id".to_string(), "fees".to_string()]);
            table.rows = fees
                .into_iter()
                .map(|fee| vec![json!(fee.payment_id), json!(fee.fees)])
                .collect();
            return Ok(table);
        }

        let params = date_range(filters, "date");
        let mut records = self.collect(credential, TRANSACTIONS_PATH, &params).await?;
        let rest: Vec<Filter> = filters
            .iter()
            .filter(|f| !is_date_bound(f, "date"))
            .cloned()
            .collect();
        retain_matching(&mut records, &rest);
        Ok(Table::from_records(records))
    }

    /// Totals per transaction type, in currency units
    async fn fee_summary(&self, credential: &Credential, filters: &[Filter]) -> Result<Table, ApiError> {
        let params = date_range(filters, "date");
        let mut records = self.collect(credential, TRANSACTIONS_PATH, &params).await?;
        let rest: Vec<Filter> = filters
            .iter()
            .filter(|f| !is_date_bound(f, "date"))
            .cloned()
            .collect();
        retain_matching(&mut records, &rest);

        #[derive(Default)]
        struct Totals {
            count: u64,
            amount: f64,
            fees: f64,
            net: f64,
        }

        let mut groups: HashMap<String, Totals> = HashMap::new();
        for record in &records {
            let kind = record
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("All Transactions")
                .to_string();
            let totals = groups.entry(kind).or_default();
            let amount = record.get("amount").map(cents_to_units).unwrap_or(0.0);
            let fees = record.get("fees").map(cents_to_units).unwrap_or(0.0);
            totals.count += 1;
            totals.amount += amount;
            totals.fees += fees;
            totals.net += record
                .get("net")
                .map(cents_to_units)
                .unwrap_or(amount - fees);
        }

        let mut kinds: Vec<_> = groups.into_iter().collect();
        kinds.sort_by(|a, b| a.0.cmp(&b.0));

        let round = |v: f64| (v * 100.0).round() / 100.0;
        let mut table = Table::new(
            ["type", "transaction_count", "total_amount", "total_fees", "total_net"]
                .map(String::from)
                .to_vec(),
        );
        table.rows = kinds
            .into_iter()
            .map(|(kind, t)| {
                vec![
                    json!(kind),
                    json!(t.count),
                    json!(round(t.amount)),
                    json!(round(t.fees)),
                    json!(round(t.net)),
                ]
            })
            .collect();
        Ok(table)
    }

    async fn listing(
        &self,
        credential: &Credential,
        path: &str,
        filters: &[Filter],
    ) -> Result<Table, ApiError> {
        let mut params = date_range(filters, "date_created");
        if path == "orders" {
            if let Some(status) = find_filter(filters, "status", FilterOperator::Equals) {
                params.push(("status".to_string(), status.value.clone()));
            }
        }

        let mut records = self.collect(credential, path, &params).await?;
        let rest: Vec<Filter> = filters
            .iter()
            .filter(|f| {
                !(path == "orders" && (is_date_bound(f, "date_created") || is_status_param(f)))
            })
            .cloned()
            .collect();
        retain_matching(&mut records, &rest);
        Ok(Table::from_records(records))
    }
}

#[async_trait]
impl BackendClient for WooCommerceClient {
    fn backend(&self) -> BackendId {
        BackendId::WooCommerce
    }

    async fn confirm(&self, credential: &Credential) -> Result<(), ApiError> {
        self.get_page(credential, "products", 1, 1, &[]).await.map(|_| ())
    }

    async fn list_data_sources(
        &self,
        _credential: &Credential,
    ) -> Result<Vec<DataSourceDescriptor>, ApiError> {
        Ok(COLLECTIONS
            .iter()
            .map(|(id, name)| {
                DataSourceDescriptor::new(BackendId::WooCommerce, DataSourceKind::Collection, *id, *name)
            })
            .collect())
    }

    async fn fetch_data(
        &self,
        credential: &Credential,
        source: &DataSourceDescriptor,
        filters: &[Filter],
    ) -> Result<Table, ApiError> {
        match source.id.as_str() {
            "payments" => self.payments(credential, filters).await,
            "fee_summary" => self.fee_summary(credential, filters).await,
            "products" | "orders" | "customers" => self.listing(credential, &source.id, filters).await,
            other => Err(ApiError::Data(format!("Unknown WooCommerce source: {}", other))),
        }
    }
}
