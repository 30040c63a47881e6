//! PostgREST gateway over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use url::Url;

use concierge_core::gateway::{
    gateway_error_from_status, Filter, Gateway, GatewayError, Result, Row, SelectQuery, Table,
};

/// Path of the REST endpoint below the project URL.
const REST_PATH: &str = "rest/v1/";

/// Maps a transport-level failure to a gateway error.
fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(err.to_string())
    } else if err.is_decode() {
        GatewayError::Serialization(err.to_string())
    } else {
        GatewayError::Connection(err.to_string())
    }
}

/// Parses a base URL, making sure joins append to its path.
pub(crate) fn parse_base_url(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| GatewayError::Connection(format!("invalid URL {}: {}", base_url, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Query string of a select: columns, filter conditions, then ordering.
fn select_params(query: &SelectQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), query.select_clause())];
    params.extend(query.filter.query_pairs());
    if !query.order.is_empty() {
        let order: Vec<String> = query.order.iter().map(|o| o.render()).collect();
        params.push(("order".to_string(), order.join(",")));
    }
    params
}

/// Gateway talking to a hosted PostgREST endpoint.
#[derive(Debug, Clone)]
pub struct RestGateway {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl RestGateway {
    /// Creates a gateway for the project at `base_url`.
    ///
    /// Every request is bounded by `timeout`.
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport_error)?;
        Ok(Self {
            client,
            base_url: parse_base_url(base_url)?,
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn table_url(&self, table: Table) -> Result<Url> {
        self.base_url
            .join(REST_PATH)
            .and_then(|rest| rest.join(table.as_str()))
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }

    fn request(&self, method: Method, table: Table) -> Result<RequestBuilder> {
        Ok(self
            .client
            .request(method, self.table_url(table)?)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json"))
    }

    /// Sends a request and decodes the returned rows.
    async fn rows(&self, table: Table, request: RequestBuilder) -> Result<Vec<Row>> {
        let response = request.send().await.map_err(transport_error)?;
        let response = Self::check(table, response).await?;
        let body = response.bytes().await.map_err(transport_error)?;
        if body.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&body).map_err(|e| GatewayError::Serialization(e.to_string()))
    }

    async fn check(table: Table, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        tracing::debug!(%table, status = status.as_u16(), "Gateway request failed");
        Err(gateway_error_from_status(status.as_u16(), table.as_str(), &body))
    }
}

#[async_trait]
impl Gateway for RestGateway {
    async fn select(&self, table: Table, query: &SelectQuery) -> Result<Vec<Row>> {
        let request = self.request(Method::GET, table)?.query(&select_params(query));
        self.rows(table, request).await
    }

    async fn insert(&self, table: Table, rows: &[Row]) -> Result<Vec<Row>> {
        let request = self
            .request(Method::POST, table)?
            .header("Prefer", "return=representation")
            .json(rows);
        self.rows(table, request).await
    }

    async fn update(&self, table: Table, patch: &Row, filter: &Filter) -> Result<Vec<Row>> {
        let request = self
            .request(Method::PATCH, table)?
            .header("Prefer", "return=representation")
            .query(&filter.query_pairs())
            .json(patch);
        self.rows(table, request).await
    }

    async fn delete(&self, table: Table, filter: &Filter) -> Result<()> {
        let request = self
            .request(Method::DELETE, table)?
            .query(&filter.query_pairs());
        let response = request.send().await.map_err(transport_error)?;
        Self::check(table, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_core::gateway::OrderBy;

    #[test]
    fn test_table_url() {
        let gateway =
            RestGateway::new("https://demo.example.com", "key", Duration::from_secs(10)).unwrap();
        assert_eq!(
            gateway.table_url(Table::PropertyAmenities).unwrap().as_str(),
            "https://demo.example.com/rest/v1/property_amenities"
        );
    }

    #[test]
    fn test_base_url_path_is_kept() {
        let url = parse_base_url("http://localhost:54321/project").unwrap();
        assert_eq!(url.as_str(), "http://localhost:54321/project/");
        assert!(parse_base_url("not a url").is_err());
    }

    #[test]
    fn test_select_params() {
        let query = SelectQuery::new(Filter::new().eq("status", "paid").gte("paid_date", "2024-01-01"))
            .columns(["invoice_id", "total_amount"])
            .order_by(OrderBy::desc("paid_date"));

        assert_eq!(
            select_params(&query),
            vec![
                ("select".to_string(), "invoice_id,total_amount".to_string()),
                ("paid_date".to_string(), "gte.2024-01-01".to_string()),
                ("status".to_string(), "eq.paid".to_string()),
                ("order".to_string(), "paid_date.desc".to_string()),
            ]
        );
    }

    #[test]
    fn test_select_all_columns() {
        assert_eq!(
            select_params(&SelectQuery::default()),
            vec![("select".to_string(), "*".to_string())]
        );
    }
}
