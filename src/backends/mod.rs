//! Vendor API clients and the types they share with the coordinator.

pub mod avalara;
pub mod http;
pub mod pagination;
pub mod quickbase;
pub mod salesforce;
pub mod woocommerce;

pub use avalara::AvalaraClient;
pub use quickbase::QuickBaseClient;
pub use salesforce::SalesforceClient;
pub use woocommerce::WooCommerceClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::credential_store::Credential;

/// The SaaS systems a connection can be made to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    Salesforce,
    WooCommerce,
    Avalara,
    QuickBase,
}

impl BackendId {
    pub const ALL: [BackendId; 4] = [
        BackendId::Salesforce,
        BackendId::WooCommerce,
        BackendId::Avalara,
        BackendId::QuickBase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendId::Salesforce => "salesforce",
            BackendId::WooCommerce => "woocommerce",
            BackendId::Avalara => "avalara",
            BackendId::QuickBase => "quickbase",
        }
    }

    /// Name shown to users in progress messages
    pub fn display_name(&self) -> &'static str {
        match self {
            BackendId::Salesforce => "Salesforce",
            BackendId::WooCommerce => "WooCommerce",
            BackendId::Avalara => "Avalara",
            BackendId::QuickBase => "QuickBase",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("Unknown backend: {0}")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendId {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "salesforce" | "sf" => Ok(BackendId::Salesforce),
            "woocommerce" | "woo" => Ok(BackendId::WooCommerce),
            "avalara" | "avatax" => Ok(BackendId::Avalara),
            "quickbase" | "qb" => Ok(BackendId::QuickBase),
            other => Err(UnknownBackend(other.to_string())),
        }
    }
}

/// Failure of a backend call, classified by what the caller should do next
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The credential was rejected; refresh or reauthorize before retrying
    #[error("Authentication rejected: {0}")]
    Auth(String),
    /// Network trouble, throttling or a server-side fault; retry with backoff
    #[error("Temporary failure: {0}")]
    Transient(String),
    /// Bad input or an unexpected payload; retrying will not help
    #[error("Data error: {0}")]
    Data(String),
    #[error("Cancelled by user")]
    UserCancelled,
}

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return http::classify_status(status, &e.to_string());
        }
        if e.is_decode() || e.is_builder() {
            ApiError::Data(e.to_string())
        } else {
            ApiError::Transient(e.to_string())
        }
    }
}

/// What shape of data a source yields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceKind {
    Report,
    Table,
    Collection,
}

/// A loadable report, table or collection exposed by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceDescriptor {
    pub id: String,
    pub display_name: String,
    pub kind: DataSourceKind,
    pub backend: BackendId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

impl DataSourceDescriptor {
    pub fn new(
        backend: BackendId,
        kind: DataSourceKind,
        id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            kind,
            backend,
            folder: None,
        }
    }

    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }
}

/// Comparison applied by a [`Filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEqual,
    LessThan,
    GreaterThan,
    LessOrEqual,
    GreaterOrEqual,
    Contains,
    NotContain,
    StartsWith,
    Includes,
    Excludes,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equals => "equals",
            FilterOperator::NotEqual => "notEqual",
            FilterOperator::LessThan => "lessThan",
            FilterOperator::GreaterThan => "greaterThan",
            FilterOperator::LessOrEqual => "lessOrEqual",
            FilterOperator::GreaterOrEqual => "greaterOrEqual",
            FilterOperator::Contains => "contains",
            FilterOperator::NotContain => "notContain",
            FilterOperator::StartsWith => "startsWith",
            FilterOperator::Includes => "includes",
            FilterOperator::Excludes => "excludes",
        }
    }
}

impl FromStr for FilterOperator {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "equals" | "eq" | "=" => FilterOperator::Equals,
            "notEqual" | "ne" | "!=" => FilterOperator::NotEqual,
            "lessThan" | "lt" | "<" => FilterOperator::LessThan,
            "greaterThan" | "gt" | ">" => FilterOperator::GreaterThan,
            "lessOrEqual" | "le" | "<=" => FilterOperator::LessOrEqual,
            "greaterOrEqual" | "ge" | ">=" => FilterOperator::GreaterOrEqual,
            "contains" => FilterOperator::Contains,
            "notContain" => FilterOperator::NotContain,
            "startsWith" => FilterOperator::StartsWith,
            "includes" => FilterOperator::Includes,
            "excludes" => FilterOperator::Excludes,
            other => return Err(ApiError::Data(format!("Unknown filter operator: {}", other))),
        };
        Ok(op)
    }
}

/// A column predicate passed through to the backend query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub operator: FilterOperator,
    pub value: String,
}

impl Filter {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
        }
    }

    /// Parse the `column:operator:value` form used on the command line.
    /// The value may itself contain colons.
    pub fn parse(input: &str) -> Result<Self, ApiError> {
        let mut parts = input.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(column), Some(op), Some(value)) if !column.is_empty() => {
                Ok(Self::new(column, op.parse()?, value))
            }
            _ => Err(ApiError::Data(format!(
                "Filter must look like column:operator:value, got '{}'",
                input
            ))),
        }
    }

    /// Evaluate against one record, for sources whose API cannot filter.
    /// Numbers compare numerically, everything else case-insensitively.
    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        let cell = record
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(&self.column))
            .map(|(_, value)| value);
        let text = match cell {
            Some(Value::String(s)) => s.to_lowercase(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string().to_lowercase(),
        };
        let needle = self.value.to_lowercase();

        let ordering = match (text.parse::<f64>(), needle.parse::<f64>()) {
            (Ok(a), Ok(b)) => a.partial_cmp(&b),
            _ => Some(text.as_str().cmp(needle.as_str())),
        };
        let listed = || needle.split(',').any(|v| v.trim() == text);

        match self.operator {
            FilterOperator::Equals => ordering == Some(Ordering::Equal),
            FilterOperator::NotEqual => ordering != Some(Ordering::Equal),
            FilterOperator::LessThan => ordering == Some(Ordering::Less),
            FilterOperator::GreaterThan => ordering == Some(Ordering::Greater),
            FilterOperator::LessOrEqual => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            FilterOperator::GreaterOrEqual => {
                matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
            }
            FilterOperator::Contains => text.contains(&needle),
            FilterOperator::NotContain => !text.contains(&needle),
            FilterOperator::StartsWith => text.starts_with(&needle),
            FilterOperator::Includes => listed(),
            FilterOperator::Excludes => !listed(),
        }
    }
}

/// Find the first filter on `column` using `operator`.
pub(crate) fn find_filter<'a>(
    filters: &'a [Filter],
    column: &str,
    operator: FilterOperator,
) -> Option<&'a Filter> {
    filters
        .iter()
        .find(|f| f.column.eq_ignore_ascii_case(column) && f.operator == operator)
}

/// Tabular result handed to the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from JSON objects. Columns keep first-appearance order
    /// and missing cells become null.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Map<String, Value>>,
    {
        let records: Vec<Map<String, Value>> = records.into_iter().collect();
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .into_iter()
            .map(|mut record| {
                columns
                    .iter()
                    .map(|c| record.remove(c).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Rows as JSON objects keyed by column name
    pub fn records(&self) -> impl Iterator<Item = Map<String, Value>> + '_ {
        self.rows.iter().map(move |row| {
            self.columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect()
        })
    }
}

/// Keep only JSON objects from a list of values
pub(crate) fn into_records(values: Vec<Value>) -> Vec<Map<String, Value>> {
    values
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

/// A vendor API wrapper. Credentials are handed in by the caller so the
/// client never holds session state of its own.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Which backend this client talks to
    fn backend(&self) -> BackendId;

    /// Cheap authenticated call proving the credential is accepted
    async fn confirm(&self, credential: &Credential) -> Result<(), ApiError>;

    /// Enumerate the reports, tables and collections available
    async fn list_data_sources(
        &self,
        credential: &Credential,
    ) -> Result<Vec<DataSourceDescriptor>, ApiError>;

    /// Load the rows of one data source
    async fn fetch_data(
        &self,
        credential: &Credential,
        source: &DataSourceDescriptor,
        filters: &[Filter],
    ) -> Result<Table, ApiError>;
}
