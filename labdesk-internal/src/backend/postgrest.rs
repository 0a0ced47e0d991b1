//! Reads against the hosted database through its PostgREST interface.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_RANGE};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use super::{CountWindow, SubscriptionSource, UsageSource};
use crate::error::{Error, ErrorDetails};
use crate::usage_limit::{ResourceKind, SubscriptionRecord, TenantId};

const REST_PATH: &str = "rest/v1/";

/// How a metered resource is stored
struct ResourceTable {
    table: &'static str,
    tenant_column: &'static str,
    month_filter: MonthFilter,
}

enum MonthFilter {
    /// Range over a creation timestamp column
    CreatedAt(&'static str),
    /// Explicit `month` / `year` integer columns
    MonthYear {
        month_column: &'static str,
        year_column: &'static str,
    },
}

fn resource_table(resource: ResourceKind) -> ResourceTable {
    let created_at = MonthFilter::CreatedAt("created_at");
    match resource {
        ResourceKind::Orders => ResourceTable {
            table: "orders",
            tenant_column: "laboratory_id",
            month_filter: created_at,
        },
        ResourceKind::Patients => ResourceTable {
            table: "patients",
            tenant_column: "user_id",
            month_filter: created_at,
        },
        ResourceKind::ImageGenerations => ResourceTable {
            table: "image_generations",
            tenant_column: "user_id",
            month_filter: created_at,
        },
        ResourceKind::PdfGenerations => ResourceTable {
            table: "pdf_generations",
            tenant_column: "user_id",
            month_filter: created_at,
        },
        ResourceKind::PriceTables => ResourceTable {
            table: "price_tables",
            tenant_column: "user_id",
            month_filter: created_at,
        },
        ResourceKind::MonthlyReports => ResourceTable {
            table: "monthly_reports",
            tenant_column: "user_id",
            month_filter: MonthFilter::MonthYear {
                month_column: "month",
                year_column: "year",
            },
        },
    }
}

pub struct PostgrestBackend {
    client: Client,
    base_url: Url,
    api_key: SecretString,
}

impl PostgrestBackend {
    pub fn new(base_url: &Url, api_key: SecretString, timeout: Duration) -> Result<Self, Error> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            Error::new(ErrorDetails::BackendConnection {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })?;
        let base_url = base_url.join(REST_PATH).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid backend URL `{base_url}`: {e}"),
            })
        })?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> Result<Url, Error> {
        self.base_url.join(table).map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("Failed to build URL for table `{table}`: {e}"),
            })
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let key = self.api_key.expose_secret();
        request
            .header("apikey", key)
            .bearer_auth(key)
    }

    async fn send(&self, target: &str, request: RequestBuilder) -> Result<Response, Error> {
        let response = self.authorized(request).send().await.map_err(|e| {
            Error::new(ErrorDetails::BackendQuery {
                target: target.to_string(),
                status_code: None,
                message: e.to_string(),
            })
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::new(ErrorDetails::BackendQuery {
                target: target.to_string(),
                status_code: Some(status),
                message: body,
            }));
        }
        Ok(response)
    }

    /// First row of a filtered select, or `None` for an empty result
    async fn first_row<T: DeserializeOwned + Send>(
        &self,
        table: &str,
        select: &str,
        filters: &[(&str, String)],
    ) -> Result<Option<T>, Error> {
        let mut query: Vec<(&str, String)> = vec![
            ("select", select.to_string()),
            ("limit", "1".to_string()),
        ];
        query.extend(filters.iter().cloned());
        let request = self.client.get(self.table_url(table)?).query(&query);
        let response = self.send(table, request).await?;
        let rows: Vec<T> = response.json().await.map_err(|e| {
            Error::new(ErrorDetails::BackendQuery {
                target: table.to_string(),
                status_code: None,
                message: format!("Failed to parse rows: {e}"),
            })
        })?;
        Ok(rows.into_iter().next())
    }
}

#[derive(Deserialize)]
struct ProfileRow {
    role: Option<String>,
}

#[derive(Deserialize)]
struct SubscriptionRow {
    status: Option<String>,
    plan_name: Option<String>,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        SubscriptionRecord {
            status: row.status.unwrap_or_default().into(),
            plan_name: row.plan_name.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl SubscriptionSource for PostgrestBackend {
    async fn fetch_role(&self, tenant_id: TenantId) -> Result<Option<String>, Error> {
        let row: Option<ProfileRow> = self
            .first_row("profiles", "role", &[("id", format!("eq.{tenant_id}"))])
            .await?;
        Ok(row.and_then(|row| row.role))
    }

    async fn fetch_subscription(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<SubscriptionRecord>, Error> {
        let row: Option<SubscriptionRow> = self
            .first_row(
                "subscriptions",
                "status,plan_name",
                &[("user_id", format!("eq.{tenant_id}"))],
            )
            .await?;
        Ok(row.map(SubscriptionRecord::from))
    }
}

#[async_trait]
impl UsageSource for PostgrestBackend {
    async fn count(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
        window: CountWindow,
    ) -> Result<u64, Error> {
        let table = resource_table(resource);
        let mut query: Vec<(&str, String)> = vec![
            ("select", "id".to_string()),
            (table.tenant_column, format!("eq.{tenant_id}")),
        ];
        if let CountWindow::Month(period) = window {
            match table.month_filter {
                MonthFilter::CreatedAt(column) => {
                    let start = period.start().to_rfc3339_opts(SecondsFormat::Secs, true);
                    let end = period.end().to_rfc3339_opts(SecondsFormat::Secs, true);
                    query.push((column, format!("gte.{start}")));
                    query.push((column, format!("lt.{end}")));
                }
                MonthFilter::MonthYear {
                    month_column,
                    year_column,
                } => {
                    query.push((month_column, format!("eq.{}", period.month)));
                    query.push((year_column, format!("eq.{}", period.year)));
                }
            }
        }

        let request = self
            .client
            .head(self.table_url(table.table)?)
            .query(&query)
            .header("Prefer", "count=exact");
        let response = self.send(table.table, request).await?;
        parse_total_count(response.headers()).ok_or_else(|| {
            Error::new(ErrorDetails::BackendQuery {
                target: table.table.to_string(),
                status_code: None,
                message: "Response is missing a usable `Content-Range` header".to_string(),
            })
        })
    }
}

/// Reads the total from a `Content-Range` header such as `0-24/573` or `*/0`
fn parse_total_count(headers: &HeaderMap) -> Option<u64> {
    let value: &HeaderValue = headers.get(CONTENT_RANGE)?;
    let (_, total) = value.to_str().ok()?.rsplit_once('/')?;
    total.trim().parse().ok()
}
