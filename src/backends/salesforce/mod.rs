//! Salesforce REST and Analytics API client

pub mod auth;

pub use auth::{BrowserLauncher, SalesforceJwtFlow, SalesforceWebFlow};

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::http::{build_client, read_json};
use super::pagination::{collect_pages, Page};
use super::{
    into_records, ApiError, BackendClient, BackendId, DataSourceDescriptor, DataSourceKind, Filter,
    FilterOperator, Table,
};
use crate::config::SalesforceConfig;
use crate::credential_store::Credential;

const REPORTS_QUERY: &str = "SELECT Id, Name, FolderName FROM Report ORDER BY FolderName, Name";
const CONFIRM_QUERY: &str = "SELECT Id, Name FROM Organization LIMIT 1";
const MAX_QUERY_PAGES: u32 = 200;

/// Reject statements that are not plain SELECTs
pub fn validate_soql(query: &str) -> Result<(), ApiError> {
    let dangerous = Regex::new(r"(?i);\s*(drop|delete|update|insert)\s+|--|/\*|\*/")
        .map_err(|e| ApiError::Data(e.to_string()))?;

    let trimmed = query.trim();
    if trimmed.is_empty() || !trimmed.to_ascii_lowercase().starts_with("select") {
        return Err(ApiError::Data("SOQL query must start with SELECT".to_string()));
    }
    if dangerous.is_match(trimmed) {
        return Err(ApiError::Data("SOQL query contains a disallowed pattern".to_string()));
    }
    Ok(())
}

/// Record and report ids are 15 or 18 alphanumeric characters
pub fn validate_record_id(id: &str) -> Result<(), ApiError> {
    if matches!(id.len(), 15 | 18) && id.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(ApiError::Data(format!("Invalid Salesforce id: {:?}", id)))
    }
}

fn validate_field_name(name: &str) -> Result<(), ApiError> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
    {
        Ok(())
    } else {
        Err(ApiError::Data(format!("Invalid field name: {:?}", name)))
    }
}

fn validate_filter(filter: &Filter) -> Result<(), ApiError> {
    validate_field_name(&filter.column)?;
    if filter.value.chars().any(|c| c.is_ascii_control()) {
        return Err(ApiError::Data(format!(
            "Filter value for {} contains control characters",
            filter.column
        )));
    }
    Ok(())
}

fn soql_literal(value: &str) -> String {
    let bare = value.parse::<f64>().is_ok()
        || matches!(value.to_ascii_lowercase().as_str(), "true" | "false" | "null")
        || is_soql_date(value);
    if bare {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

fn is_soql_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

fn like_pattern(value: &str, prefix: &str, suffix: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("'{}{}{}'", prefix, escaped, suffix)
}

fn soql_condition(filter: &Filter) -> String {
    let column = &filter.column;
    let value = filter.value.as_str();
    let list = || {
        value
            .split(',')
            .map(|v| soql_literal(v.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    };

    match filter.operator {
        FilterOperator::Equals => format!("{} = {}", column, soql_literal(value)),
        FilterOperator::NotEqual => format!("{} != {}", column, soql_literal(value)),
        FilterOperator::LessThan => format!("{} < {}", column, soql_literal(value)),
        FilterOperator::GreaterThan => format!("{} > {}", column, soql_literal(value)),
        FilterOperator::LessOrEqual => format!("{} <= {}", column, soql_literal(value)),
        FilterOperator::GreaterOrEqual => format!("{} >= {}", column, soql_literal(value)),
        FilterOperator::Contains => format!("{} LIKE {}", column, like_pattern(value, "%", "%")),
        FilterOperator::NotContain => {
            format!("(NOT {} LIKE {})", column, like_pattern(value, "%", "%"))
        }
        FilterOperator::StartsWith => format!("{} LIKE {}", column, like_pattern(value, "", "%")),
        FilterOperator::Includes => format!("{} IN ({})", column, list()),
        FilterOperator::Excludes => format!("{} NOT IN ({})", column, list()),
    }
}

/// Build a bounded query over an object's standard fields
pub fn object_query(object: &str, filters: &[Filter]) -> Result<String, ApiError> {
    if object.is_empty() || !object.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ApiError::Data(format!("Invalid object name: {:?}", object)));
    }
    for filter in filters {
        validate_filter(filter)?;
    }

    let mut query = format!("SELECT FIELDS(STANDARD) FROM {}", object);
    if !filters.is_empty() {
        let conditions: Vec<String> = filters.iter().map(soql_condition).collect();
        query.push_str(" WHERE ");
        query.push_str(&conditions.join(" AND "));
    }
    Ok(query)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default)]
    next_records_url: Option<String>,
}

#[derive(Debug, Clone)]
enum QueryCursor {
    Start(String),
    Next(String),
}

#[derive(Debug, Deserialize)]
struct GlobalDescribe {
    #[serde(default)]
    sobjects: Vec<ObjectSummary>,
}

#[derive(Debug, Deserialize)]
struct ObjectSummary {
    name: String,
    label: String,
    #[serde(default)]
    queryable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRun {
    report_metadata: ReportMetadata,
    #[serde(default)]
    fact_map: HashMap<String, FactMapEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportMetadata {
    #[serde(default)]
    detail_columns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FactMapEntry {
    #[serde(default)]
    rows: Vec<ReportRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRow {
    #[serde(default)]
    data_cells: Vec<DataCell>,
}

#[derive(Debug, Deserialize)]
struct DataCell {
    #[serde(default)]
    label: Option<Value>,
    #[serde(default)]
    value: Option<Value>,
}

impl DataCell {
    fn into_value(self) -> Value {
        match (self.label, self.value) {
            (Some(label), _) if !label.is_null() => label,
            (_, Some(value)) => value,
            _ => Value::String(String::new()),
        }
    }
}

impl ReportRun {
    /// Detail rows live under the grand-total key of the fact map
    fn into_table(mut self) -> Table {
        let columns = self.report_metadata.detail_columns;
        let mut table = Table::new(columns);
        let width = table.columns.len();

        if let Some(entry) = self.fact_map.remove("T!T") {
            for row in entry.rows.into_iter().filter(|r| !r.data_cells.is_empty()) {
                let mut cells: Vec<Value> = row
                    .data_cells
                    .into_iter()
                    .take(width)
                    .map(DataCell::into_value)
                    .collect();
                cells.resize(width, Value::Null);
                table.rows.push(cells);
            }
        }
        table
    }
}

/// Drop the `attributes` envelope and nested relationship objects
fn flatten_record(mut record: Map<String, Value>) -> Map<String, Value> {
    record.remove("attributes");
    record.retain(|_, v| !v.is_object());
    record
}

pub struct SalesforceClient {
    http: Client,
    api_version: String,
    max_records: usize,
}

impl SalesforceClient {
    pub fn new(config: &SalesforceConfig) -> Result<Self, ApiError> {
        Ok(Self {
            http: build_client(Duration::from_secs(config.timeout_secs))?,
            api_version: config.api_version.clone(),
            max_records: config.max_records,
        })
    }

    fn instance<'a>(&self, credential: &'a Credential) -> Result<&'a str, ApiError> {
        credential
            .instance_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .ok_or_else(|| ApiError::Auth("Salesforce credential has no instance URL".to_string()))
    }

    fn data_url(&self, credential: &Credential, path: &str) -> Result<String, ApiError> {
        Ok(format!(
            "{}/services/data/v{}/{}",
            self.instance(credential)?,
            self.api_version,
            path
        ))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        tracing::debug!("GET {}", url);
        let response = self
            .http
            .get(url)
            .bearer_auth(&credential.access_token)
            .query(query)
            .send()
            .await?;
        read_json(response).await
    }

    async fn query_page(
        &self,
        credential: &Credential,
        cursor: QueryCursor,
    ) -> Result<Page<Value, QueryCursor>, ApiError> {
        let response: QueryResponse = match cursor {
            QueryCursor::Start(soql) => {
                let url = self.data_url(credential, "query")?;
                self.get_json(credential, &url, &[("q", soql.as_str())]).await?
            }
            QueryCursor::Next(path) => {
                let url = format!("{}{}", self.instance(credential)?, path);
                self.get_json(credential, &url, &[]).await?
            }
        };

        Ok(Page {
            items: response.records,
            next: response.next_records_url.map(QueryCursor::Next),
        })
    }

    /// Run a validated SOQL query, following `nextRecordsUrl` up to `max_records`
    pub async fn execute_soql(
        &self,
        credential: &Credential,
        query: &str,
        max_records: usize,
    ) -> Result<Vec<Map<String, Value>>, ApiError> {
        validate_soql(query)?;
        let records = collect_pages(
            QueryCursor::Start(query.to_string()),
            MAX_QUERY_PAGES,
            max_records,
            |cursor| self.query_page(credential, cursor),
        )
        .await?;

        Ok(into_records(records).into_iter().map(flatten_record).collect())
    }

    async fn list_reports(&self, credential: &Credential) -> Result<Vec<DataSourceDescriptor>, ApiError> {
        let records = self
            .execute_soql(credential, REPORTS_QUERY, self.max_records)
            .await?;

        Ok(records
            .into_iter()
            .filter_map(|record| {
                let id = record.get("Id")?.as_str()?.to_string();
                let name = record.get("Name")?.as_str()?.to_string();
                let folder = record
                    .get("FolderName")
                    .and_then(Value::as_str)
                    .unwrap_or("Unfiled Public Reports");
                Some(
                    DataSourceDescriptor::new(BackendId::Salesforce, DataSourceKind::Report, id, name)
                        .in_folder(folder),
                )
            })
            .collect())
    }

    async fn list_objects(&self, credential: &Credential) -> Result<Vec<DataSourceDescriptor>, ApiError> {
        let url = self.data_url(credential, "sobjects")?;
        let describe: GlobalDescribe = self.get_json(credential, &url, &[]).await?;

        Ok(describe
            .sobjects
            .into_iter()
            .filter(|object| object.queryable)
            .map(|object| {
                DataSourceDescriptor::new(
                    BackendId::Salesforce,
                    DataSourceKind::Table,
                    object.name,
                    object.label,
                )
            })
            .collect())
    }

    /// Run a report through the Analytics API, applying filters when given
    pub async fn run_report(
        &self,
        credential: &Credential,
        report_id: &str,
        filters: &[Filter],
    ) -> Result<Table, ApiError> {
        validate_record_id(report_id)?;
        for filter in filters {
            validate_filter(filter)?;
        }

        let url = self.data_url(credential, &format!("analytics/reports/{}", report_id))?;
        let request = if filters.is_empty() {
            self.http.get(&url)
        } else {
            let report_filters: Vec<Value> = filters
                .iter()
                .map(|f| {
                    json!({
                        "column": f.column,
                        "operator": f.operator.as_str(),
                        "value": f.value,
                    })
                })
                .collect();
            self.http
                .post(&url)
                .json(&json!({ "reportMetadata": { "reportFilters": report_filters } }))
        };

        tracing::debug!("Running Salesforce report {} with {} filters", report_id, filters.len());
        let response = request
            .bearer_auth(&credential.access_token)
            .query(&[("includeDetails", "true")])
            .send()
            .await?;
        let run: ReportRun = read_json(response).await?;
        Ok(run.into_table())
    }

    async fn query_object(
        &self,
        credential: &Credential,
        object: &str,
        filters: &[Filter],
    ) -> Result<Table, ApiError> {
        let query = object_query(object, filters)?;
        let records = self.execute_soql(credential, &query, self.max_records).await?;
        Ok(Table::from_records(records))
    }
}

#[async_trait]
impl BackendClient for SalesforceClient {
    fn backend(&self) -> BackendId {
        BackendId::Salesforce
    }

    async fn confirm(&self, credential: &Credential) -> Result<(), ApiError> {
        self.query_page(credential, QueryCursor::Start(CONFIRM_QUERY.to_string()))
            .await
            .map(|_| ())
    }

    async fn list_data_sources(
        &self,
        credential: &Credential,
    ) -> Result<Vec<DataSourceDescriptor>, ApiError> {
        let mut sources = self.list_reports(credential).await?;
        sources.extend(self.list_objects(credential).await?);
        tracing::info!("Salesforce exposes {} data sources", sources.len());
        Ok(sources)
    }

    async fn fetch_data(
        &self,
        credential: &Credential,
        source: &DataSourceDescriptor,
        filters: &[Filter],
    ) -> Result<Table, ApiError> {
        match source.kind {
            DataSourceKind::Report => self.run_report(credential, &source.id, filters).await,
            DataSourceKind::Table => self.query_object(credential, &source.id, filters).await,
            DataSourceKind::Collection => Err(ApiError::Data(format!(
                "Salesforce has no collection named {}",
                source.id
            ))),
        }
    }
}
