//! QuickBase JSON API (v1)

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::http::{build_client, read_json};
use super::pagination::{collect_pages, Page};
use super::{
    ApiError, BackendClient, BackendId, DataSourceDescriptor, DataSourceKind, Filter,
    FilterOperator, Table,
};
use crate::config::QuickBaseConfig;
use crate::credential_store::Credential;

const MAX_PAGES: u32 = 200;
/// Only the first few tables get their reports listed
const REPORT_TABLES: usize = 3;

#[derive(Debug, Deserialize)]
struct TableInfo {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ReportInfo {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct FieldInfo {
    id: u64,
    label: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryMetadata {
    #[serde(default)]
    total_records: usize,
    #[serde(default)]
    num_records: usize,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    data: Vec<Map<String, Value>>,
    #[serde(default)]
    fields: Vec<FieldInfo>,
    #[serde(default)]
    metadata: QueryMetadata,
}

impl QueryResponse {
    /// Records keyed by field label, in the order the fields were returned
    fn into_page(self, skip: usize) -> Page<Map<String, Value>, usize> {
        let fields = self.fields;
        let items: Vec<Map<String, Value>> = self
            .data
            .into_iter()
            .map(|mut record| {
                fields
                    .iter()
                    .map(|field| {
                        let cell = record
                            .remove(&field.id.to_string())
                            .and_then(|mut cell| cell.get_mut("value").map(Value::take))
                            .unwrap_or(Value::Null);
                        (field.label.clone(), cell)
                    })
                    .collect()
            })
            .collect();

        let fetched = skip + self.metadata.num_records.max(items.len());
        let next = (!items.is_empty() && fetched < self.metadata.total_records).then_some(fetched);
        Page { items, next }
    }
}

/// QuickBase string literal inside a query clause
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// One `{fid.OP.'value'}` clause, or a grouped OR/AND for list operators
pub fn where_clause(field_id: u64, filter: &Filter) -> String {
    let clause = |op: &str, value: &str| format!("{{{}.{}.{}}}", field_id, op, quote(value));
    let list = |op: &str, joiner: &str| {
        let parts: Vec<String> = filter
            .value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| clause(op, v))
            .collect();
        format!("({})", parts.join(joiner))
    };

    match filter.operator {
        FilterOperator::Equals => clause("EX", &filter.value),
        FilterOperator::NotEqual => clause("XEX", &filter.value),
        FilterOperator::LessThan => clause("LT", &filter.value),
        FilterOperator::GreaterThan => clause("GT", &filter.value),
        FilterOperator::LessOrEqual => clause("LTE", &filter.value),
        FilterOperator::GreaterOrEqual => clause("GTE", &filter.value),
        FilterOperator::Contains => clause("CT", &filter.value),
        FilterOperator::NotContain => clause("XCT", &filter.value),
        FilterOperator::StartsWith => clause("SW", &filter.value),
        FilterOperator::Includes => list("EX", "OR"),
        FilterOperator::Excludes => list("XEX", "AND"),
    }
}

pub struct QuickBaseClient {
    http: Client,
    api_url: String,
    app_id: Option<String>,
    page_size: usize,
    max_records: usize,
}

impl QuickBaseClient {
    pub fn new(config: &QuickBaseConfig) -> Result<Self, ApiError> {
        Ok(Self {
            http: build_client(Duration::from_secs(config.timeout_secs))?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            page_size: config.page_size,
            max_records: config.max_records,
        })
    }

    fn app_id(&self) -> Result<&str, ApiError> {
        self.app_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::Data("QuickBase app id is not configured".to_string()))
    }

    fn request(
        &self,
        credential: &Credential,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, ApiError> {
        let realm = credential
            .instance_url
            .as_deref()
            .ok_or_else(|| ApiError::Data("QuickBase realm hostname is not configured".to_string()))?;
        let url = format!("{}/{}", self.api_url, path);
        tracing::debug!("{} {}", method, url);

        Ok(self
            .http
            .request(method, url)
            .header("QB-Realm-Hostname", realm)
            .header("Authorization", format!("QB-USER-TOKEN {}", credential.access_token)))
    }

    async fn tables(&self, credential: &Credential) -> Result<Vec<TableInfo>, ApiError> {
        let response = self
            .request(credential, Method::GET, "tables")?
            .query(&[("appId", self.app_id()?)])
            .send()
            .await?;
        read_json(response).await
    }

    async fn reports(&self, credential: &Credential, table_id: &str) -> Result<Vec<ReportInfo>, ApiError> {
        let response = self
            .request(credential, Method::GET, "reports")?
            .query(&[("tableId", table_id)])
            .send()
            .await?;
        read_json(response).await
    }

    async fn field_ids(
        &self,
        credential: &Credential,
        table_id: &str,
    ) -> Result<HashMap<String, u64>, ApiError> {
        let response = self
            .request(credential, Method::GET, "fields")?
            .query(&[("tableId", table_id)])
            .send()
            .await?;
        let fields: Vec<FieldInfo> = read_json(response).await?;
        Ok(fields
            .into_iter()
            .map(|f| (f.label.to_lowercase(), f.id))
            .collect())
    }

    /// Combined where clause; columns may be field ids or labels
    async fn query_filter(
        &self,
        credential: &Credential,
        table_id: &str,
        filters: &[Filter],
    ) -> Result<Option<String>, ApiError> {
        if filters.is_empty() {
            return Ok(None);
        }

        let labels = if filters.iter().all(|f| f.column.parse::<u64>().is_ok()) {
            HashMap::new()
        } else {
            self.field_ids(credential, table_id).await?
        };

        let mut clauses = Vec::with_capacity(filters.len());
        for filter in filters {
            let field_id = match filter.column.parse::<u64>() {
                Ok(id) => id,
                Err(_) => *labels.get(&filter.column.to_lowercase()).ok_or_else(|| {
                    ApiError::Data(format!("Unknown QuickBase field: {}", filter.column))
                })?,
            };
            clauses.push(where_clause(field_id, filter));
        }
        Ok(Some(clauses.join("AND")))
    }

    async fn query_records(
        &self,
        credential: &Credential,
        table_id: &str,
        filters: &[Filter],
    ) -> Result<Vec<Map<String, Value>>, ApiError> {
        let where_clause = self.query_filter(credential, table_id, filters).await?;
        let where_clause = where_clause.as_deref();
        let top = self.page_size;

        collect_pages(0usize, MAX_PAGES, self.max_records, move |skip| async move {
            let mut body = json!({
                "from": table_id,
                "options": { "skip": skip, "top": top },
            });
            if let Some(clause) = where_clause {
                body["where"] = Value::String(clause.to_string());
            }

            let response = self
                .request(credential, Method::POST, "records/query")?
                .json(&body)
                .send()
                .await?;
            let page: QueryResponse = read_json(response).await?;
            Ok(page.into_page(skip))
        })
        .await
    }

    async fn run_report(
        &self,
        credential: &Credential,
        table_id: &str,
        report_id: &str,
    ) -> Result<Vec<Map<String, Value>>, ApiError> {
        let path = format!("reports/{}/run", urlencoding::encode(report_id));
        let path = path.as_str();
        let top = self.page_size;

        collect_pages(0usize, MAX_PAGES, self.max_records, move |skip| async move {
            let response = self
                .request(credential, Method::POST, path)?
                .query(&[
                    ("tableId", table_id.to_string()),
                    ("skip", skip.to_string()),
                    ("top", top.to_string()),
                ])
                .send()
                .await?;
            let page: QueryResponse = read_json(response).await?;
            Ok(page.into_page(skip))
        })
        .await
    }
}

#[async_trait]
impl BackendClient for QuickBaseClient {
    fn backend(&self) -> BackendId {
        BackendId::QuickBase
    }

    async fn confirm(&self, credential: &Credential) -> Result<(), ApiError> {
        let tables = self.tables(credential).await?;
        tracing::debug!("QuickBase app has {} tables", tables.len());
        Ok(())
    }

    async fn list_data_sources(
        &self,
        credential: &Credential,
    ) -> Result<Vec<DataSourceDescriptor>, ApiError> {
        let tables = self.tables(credential).await?;
        let mut sources: Vec<DataSourceDescriptor> = tables
            .iter()
            .map(|t| {
                DataSourceDescriptor::new(BackendId::QuickBase, DataSourceKind::Table, &t.id, &t.name)
            })
            .collect();

        for table in tables.iter().take(REPORT_TABLES) {
            let reports = match self.reports(credential, &table.id).await {
                Ok(reports) => reports,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    tracing::warn!("Skipping reports of QuickBase table {}: {}", table.name, e);
                    continue;
                }
            };
            sources.extend(reports.into_iter().map(|report| {
                DataSourceDescriptor::new(
                    BackendId::QuickBase,
                    DataSourceKind::Report,
                    format!("{}.{}", table.id, report.id),
                    report.name,
                )
                .in_folder(&table.name)
            }));
        }
        Ok(sources)
    }

    async fn fetch_data(
        &self,
        credential: &Credential,
        source: &DataSourceDescriptor,
        filters: &[Filter],
    ) -> Result<Table, ApiError> {
        let records = match source.kind {
            DataSourceKind::Report => {
                let (table_id, report_id) = source.id.split_once('.').ok_or_else(|| {
                    ApiError::Data(format!("QuickBase report id must be table.report: {}", source.id))
                })?;
                let mut records = self.run_report(credential, table_id, report_id).await?;
                records.retain(|record| filters.iter().all(|f| f.matches(record)));
                records
            }
            _ => self.query_records(credential, &source.id, filters).await?,
        };
        tracing::info!("Loaded {} QuickBase records from {}", records.len(), source.id);
        Ok(Table::from_records(records))
    }
}
