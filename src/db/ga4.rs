//! Google Analytics 4 adapter.
//!
//! Reports are `{dimensions, metrics, date_ranges, order_bys, limit}`.
//! Relative date expressions are resolved to absolute dates at
//! translation time with the server clock; unknown expressions default
//! to "last 7 days" with a warning. Auth uses the service-account JWT
//! bearer flow.

use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::db::{wrong_variant, Adapter, BackendKind, Query, QueryOptions, Row};
use crate::error::{GatewayError, Result};
use crate::llm::LlmService;
use crate::schema::SchemaDocument;

/// GA4 Data API base.
const ANALYTICS_DATA_API: &str = "https://analyticsdata.googleapis.com/v1beta";

/// OAuth scope for read-only report access.
const ANALYTICS_SCOPE: &str = "https://www.googleapis.com/auth/analytics.readonly";

/// Timeout for API calls.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// An absolute date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

/// Ordering on a dimension or a metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default)]
    pub desc: bool,
}

/// A GA4 report request with resolved dates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ga4Report {
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub date_ranges: Vec<DateRange>,
    #[serde(default)]
    pub order_bys: Vec<OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Resolves one date-range value: absolute `{start, end}` passes through,
/// `{relative: "..."}` is resolved against `today`.
pub fn resolve_date_range(value: &serde_json::Value, today: NaiveDate) -> DateRange {
    if let (Some(start), Some(end)) = (
        value.get("start").and_then(|s| s.as_str()),
        value.get("end").and_then(|e| e.as_str()),
    ) {
        return DateRange {
            start: start.to_string(),
            end: end.to_string(),
        };
    }

    let relative = value
        .get("relative")
        .and_then(|r| r.as_str())
        .unwrap_or("")
        .to_lowercase();

    let (start, end) = match relative.as_str() {
        "yesterday" => {
            let d = today - ChronoDuration::days(1);
            (d, d)
        }
        "last 7 days" => (today - ChronoDuration::days(7), today),
        "last 30 days" => (today - ChronoDuration::days(30), today),
        "this month" => (
            NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today),
            today,
        ),
        "last month" => {
            let first_of_this = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
                .unwrap_or(today);
            let last_of_prev = first_of_this - ChronoDuration::days(1);
            let first_of_prev =
                NaiveDate::from_ymd_opt(last_of_prev.year(), last_of_prev.month(), 1)
                    .unwrap_or(last_of_prev);
            (first_of_prev, last_of_prev)
        }
        other => {
            warn!(
                "unknown relative date expression '{}', defaulting to last 7 days",
                other
            );
            (today - ChronoDuration::days(7), today)
        }
    };

    DateRange {
        start: start.format("%Y-%m-%d").to_string(),
        end: end.format("%Y-%m-%d").to_string(),
    }
}

/// Parses the LLM's JSON answer into a report with resolved dates.
pub fn parse_report_json(value: &serde_json::Value, today: NaiveDate) -> Result<Ga4Report> {
    let display = value.to_string();
    let string_list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    };

    let metrics = string_list("metrics");
    if metrics.is_empty() {
        return Err(GatewayError::query_invalid(
            "GA4 report requires at least one metric",
            display,
        ));
    }

    let date_ranges: Vec<DateRange> = value
        .get("date_ranges")
        .and_then(|v| v.as_array())
        .map(|ranges| ranges.iter().map(|r| resolve_date_range(r, today)).collect())
        .unwrap_or_else(|| {
            vec![resolve_date_range(&json!({"relative": "last 7 days"}), today)]
        });

    let order_bys = value
        .get("order_bys")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|item| OrderBy {
                    dimension: item
                        .get("dimension")
                        .and_then(|d| d.as_str())
                        .map(String::from),
                    metric: item.get("metric").and_then(|m| m.as_str()).map(String::from),
                    desc: item.get("desc").and_then(|d| d.as_bool()).unwrap_or(false),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Ga4Report {
        dimensions: string_list("dimensions"),
        metrics,
        date_ranges,
        order_bys,
        limit: value.get("limit").and_then(|l| l.as_u64()),
    })
}

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Serialize)]
struct BearerClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Caches a short-lived access token from the JWT bearer flow.
struct TokenProvider {
    key_file: PathBuf,
    cached: Mutex<Option<(String, i64)>>,
    client: reqwest::Client,
}

impl TokenProvider {
    fn new(key_file: PathBuf, client: reqwest::Client) -> Self {
        Self {
            key_file,
            cached: Mutex::new(None),
            client,
        }
    }

    async fn access_token(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        {
            let cached = self.cached.lock().await;
            if let Some((token, expires_at)) = cached.as_ref() {
                if *expires_at - 60 > now {
                    return Ok(token.clone());
                }
            }
        }

        let key = self.load_key()?;
        let claims = BearerClaims {
            iss: key.client_email.clone(),
            scope: ANALYTICS_SCOPE.to_string(),
            aud: key.token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| GatewayError::config(format!("bad GA4 private key: {e}")))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|e| GatewayError::internal(format!("JWT signing failed: {e}")))?;

        let response = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::backend(format!("GA4 token exchange failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(GatewayError::auth(format!(
                "GA4 token exchange rejected ({status})"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::backend(format!("GA4 token response unreadable: {e}")))?;
        let token = body
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| GatewayError::auth("GA4 token response missing access_token"))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(|e| e.as_i64()).unwrap_or(3600);

        *self.cached.lock().await = Some((token.clone(), now + expires_in));
        Ok(token)
    }

    fn load_key(&self) -> Result<ServiceAccountKey> {
        let content = std::fs::read_to_string(&self.key_file).map_err(|e| {
            GatewayError::config(format!(
                "cannot read GA4 key file {}: {e}",
                self.key_file.display()
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| GatewayError::config(format!("bad GA4 key file: {e}")))
    }
}

/// GA4 adapter.
pub struct Ga4Adapter {
    uri: String,
    property_id: String,
    tokens: TokenProvider,
    llm: LlmService,
    client: reqwest::Client,
}

impl Ga4Adapter {
    /// Creates an adapter from a `ga4://<propertyID>` URI and key file.
    pub fn new(uri: &str, key_file: &Path, llm: LlmService) -> Result<Self> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| GatewayError::config(format!("invalid ga4 URI: {e}")))?;
        let property_id = parsed
            .host_str()
            .ok_or_else(|| GatewayError::config("ga4 URI missing property id"))?
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::backend(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            uri: uri.to_string(),
            property_id,
            tokens: TokenProvider::new(key_file.to_path_buf(), client.clone()),
            llm,
            client,
        })
    }

    async fn api_post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .post(format!("{ANALYTICS_DATA_API}{path}"))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::backend(format!("GA4 unreachable: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::backend(format!("GA4 response unreadable: {e}")))?;

        match status.as_u16() {
            200 => Ok(body),
            401 | 403 => Err(GatewayError::auth("GA4 rejected the access token")),
            429 => Err(GatewayError::quota("GA4 rate limit exhausted")),
            _ => Err(GatewayError::backend(format!("GA4 error ({status}): {body}"))),
        }
    }

    async fn api_get(&self, path: &str) -> Result<serde_json::Value> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .get(format!("{ANALYTICS_DATA_API}{path}"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| GatewayError::backend(format!("GA4 unreachable: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::backend(format!("GA4 response unreadable: {e}")))?;

        match status.as_u16() {
            200 => Ok(body),
            401 | 403 => Err(GatewayError::auth("GA4 rejected the access token")),
            _ => Err(GatewayError::backend(format!("GA4 error ({status}): {body}"))),
        }
    }

    /// Builds the runReport request body.
    fn report_body(report: &Ga4Report) -> serde_json::Value {
        let mut body = json!({
            "dimensions": report.dimensions.iter().map(|d| json!({"name": d})).collect::<Vec<_>>(),
            "metrics": report.metrics.iter().map(|m| json!({"name": m})).collect::<Vec<_>>(),
            "dateRanges": report
                .date_ranges
                .iter()
                .map(|r| json!({"startDate": r.start, "endDate": r.end}))
                .collect::<Vec<_>>(),
        });
        if !report.order_bys.is_empty() {
            body["orderBys"] = report
                .order_bys
                .iter()
                .map(|o| {
                    if let Some(dimension) = &o.dimension {
                        json!({"desc": o.desc, "dimension": {"dimensionName": dimension}})
                    } else {
                        json!({"desc": o.desc, "metric": {"metricName": o.metric}})
                    }
                })
                .collect::<Vec<_>>()
                .into();
        }
        if let Some(limit) = report.limit {
            body["limit"] = json!(limit.to_string());
        }
        body
    }

    /// Flattens the runReport response into rows.
    fn response_to_rows(response: &serde_json::Value) -> Vec<Row> {
        let header_names = |key: &str, name_key: &str| -> Vec<String> {
            response
                .get(key)
                .and_then(|h| h.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.get(name_key).and_then(|n| n.as_str()).map(String::from))
                        .collect()
                })
                .unwrap_or_default()
        };
        let dimension_headers = header_names("dimensionHeaders", "name");
        let metric_headers = header_names("metricHeaders", "name");

        response
            .get("rows")
            .and_then(|r| r.as_array())
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        let mut out = Row::new();
                        let values = |key: &str| -> Vec<String> {
                            row.get(key)
                                .and_then(|v| v.as_array())
                                .map(|items| {
                                    items
                                        .iter()
                                        .filter_map(|i| {
                                            i.get("value").and_then(|v| v.as_str()).map(String::from)
                                        })
                                        .collect()
                                })
                                .unwrap_or_default()
                        };
                        for (name, value) in dimension_headers.iter().zip(values("dimensionValues"))
                        {
                            out.insert(name.clone(), json!(value));
                        }
                        for (name, value) in metric_headers.iter().zip(values("metricValues")) {
                            // Metric values arrive as strings; surface numbers.
                            let parsed = value
                                .parse::<f64>()
                                .ok()
                                .and_then(serde_json::Number::from_f64)
                                .map(serde_json::Value::Number)
                                .unwrap_or(json!(value));
                            out.insert(name.clone(), parsed);
                        }
                        out
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Adapter for Ga4Adapter {
    fn db_type(&self) -> BackendKind {
        BackendKind::Ga4
    }

    fn connection_uri(&self) -> &str {
        &self.uri
    }

    async fn llm_to_query(&self, nl_prompt: &str, opts: &QueryOptions) -> Result<Query> {
        let schema_context = opts
            .schema_chunks
            .clone()
            .unwrap_or_else(|| "activeUsers, sessions, country, date".to_string());
        let value = self.llm.generate_ga4_query(nl_prompt, &schema_context).await?;
        let report = parse_report_json(&value, Utc::now().date_naive())?;
        Ok(Query::Ga4Report(report))
    }

    async fn execute(&self, query: &Query) -> Result<Vec<Row>> {
        let Query::Ga4Report(report) = query else {
            return Err(wrong_variant(BackendKind::Ga4, query));
        };

        let body = Self::report_body(report);
        let response = self
            .api_post(&format!("/properties/{}:runReport", self.property_id), &body)
            .await?;
        Ok(Self::response_to_rows(&response))
    }

    async fn introspect_schema(&self) -> Result<Vec<SchemaDocument>> {
        let metadata = self
            .api_get(&format!("/properties/{}/metadata", self.property_id))
            .await?;

        let mut documents = Vec::new();
        let mut dimension_names = Vec::new();
        let mut metric_names = Vec::new();

        for (key, prefix, names) in [
            ("dimensions", "dimension", &mut dimension_names),
            ("metrics", "metric", &mut metric_names),
        ] {
            if let Some(items) = metadata.get(key).and_then(|d| d.as_array()) {
                for item in items {
                    let api_name = item.get("apiName").and_then(|n| n.as_str()).unwrap_or("?");
                    let ui_name = item.get("uiName").and_then(|n| n.as_str()).unwrap_or(api_name);
                    let description = item
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or("");
                    names.push(api_name.to_string());
                    documents.push(SchemaDocument::new(
                        format!("{prefix}:{api_name}"),
                        format!("{ui_name} ({prefix} {api_name}): {description}"),
                        "ga4",
                    ));
                }
            }
        }

        if documents.is_empty() {
            return Err(GatewayError::PartialIntrospection(
                "GA4 metadata returned no dimensions or metrics".to_string(),
            ));
        }

        documents.push(SchemaDocument::new(
            "property:overview",
            format!(
                "GA4 property {} with {} dimensions ({}) and {} metrics ({}).",
                self.property_id,
                dimension_names.len(),
                dimension_names.join(", "),
                metric_names.len(),
                metric_names.join(", ")
            ),
            "ga4",
        ));
        Ok(documents)
    }

    async fn test_connection(&self) -> bool {
        self.api_get(&format!("/properties/{}/metadata", self.property_id))
            .await
            .is_ok()
    }
}
