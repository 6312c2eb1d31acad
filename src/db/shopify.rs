//! Shopify adapter.
//!
//! Queries name a REST resource plus parameters. Input normalization is
//! tolerant of the documented subset only: a SQL-looking SELECT over a
//! known resource, a legacy full API path, or the native adapter shape.
//! Anything else is rejected as untrusted. Webhook intake verifies an
//! HMAC-SHA256 signature in constant time before any processing.

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::db::{wrong_variant, Adapter, BackendKind, HttpMethod, Query, QueryOptions, Row};
use crate::error::{GatewayError, Result};
use crate::llm::LlmService;
use crate::schema::SchemaDocument;

type HmacSha256 = Hmac<Sha256>;

/// Timeout for API calls.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Resources the adapter will address.
const KNOWN_RESOURCES: &[&str] = &[
    "products",
    "orders",
    "customers",
    "inventory_levels",
    "custom_collections",
    "shop",
];

/// Scopes the app manifest requests.
const REQUESTED_SCOPES: &[&str] = &[
    "read_products",
    "read_orders",
    "read_customers",
    "read_inventory",
];

/// Scope diff between the manifest and what the shop granted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeStatus {
    pub granted: Vec<String>,
    pub requested: Vec<String>,
    pub missing: Vec<String>,
}

/// Normalized webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: Option<serde_json::Value>,
    pub data: serde_json::Value,
    pub shop_domain: Option<String>,
    pub updated_at: Option<String>,
}

/// Shopify adapter.
pub struct ShopifyAdapter {
    uri: String,
    shop_domain: String,
    api_version: String,
    access_token: Option<String>,
    webhook_secret: Option<String>,
    granted_scopes: Vec<String>,
    #[allow(dead_code)]
    llm: LlmService,
    client: reqwest::Client,
}

impl ShopifyAdapter {
    /// Creates an adapter for the shop named by the app URL.
    pub fn new(uri: &str, api_version: impl Into<String>, llm: LlmService) -> Result<Self> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| GatewayError::config(format!("invalid shopify URL: {e}")))?;
        let shop_domain = parsed
            .host_str()
            .ok_or_else(|| GatewayError::config("shopify URL missing host"))?
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::backend(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            uri: uri.to_string(),
            shop_domain,
            api_version: api_version.into(),
            access_token: None,
            webhook_secret: None,
            granted_scopes: Vec::new(),
            llm,
            client,
        })
    }

    /// Attaches the decrypted access token for API calls.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Attaches the shared webhook secret.
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    /// Records the scopes the shop actually granted.
    pub fn with_granted_scopes(mut self, scopes: Vec<String>) -> Self {
        self.granted_scopes = scopes;
        self
    }

    /// Diffs the manifest's requested scopes against the granted set.
    pub fn available_scopes(&self) -> ScopeStatus {
        let requested: Vec<String> = REQUESTED_SCOPES.iter().map(|s| s.to_string()).collect();
        let missing = requested
            .iter()
            .filter(|scope| !self.granted_scopes.contains(scope))
            .cloned()
            .collect();
        ScopeStatus {
            granted: self.granted_scopes.clone(),
            requested,
            missing,
        }
    }

    /// Normalizes any accepted input shape into the adapter query.
    ///
    /// Accepted: the native `{endpoint, method?, params?}` object, a
    /// legacy full API path as the endpoint, or a SQL-looking SELECT over
    /// a known resource. Everything else is rejected.
    pub fn normalize_input(input: &serde_json::Value) -> Result<Query> {
        match input {
            serde_json::Value::String(text) => parse_sql_like(text),
            serde_json::Value::Object(map) => {
                let raw_endpoint = map
                    .get("endpoint")
                    .and_then(|e| e.as_str())
                    .ok_or_else(|| {
                        GatewayError::query_invalid("missing 'endpoint'", input.to_string())
                    })?;
                let endpoint = normalize_endpoint(raw_endpoint)?;
                let method = match map.get("method").and_then(|m| m.as_str()) {
                    Some("POST") | Some("post") => HttpMethod::Post,
                    _ => HttpMethod::Get,
                };
                let params = map
                    .get("params")
                    .and_then(|p| p.as_object())
                    .cloned()
                    .unwrap_or_default();
                Ok(Query::ShopifyApi {
                    endpoint,
                    method,
                    params,
                })
            }
            other => Err(GatewayError::query_invalid(
                "unsupported shopify query shape",
                other.to_string(),
            )),
        }
    }

    /// Builds the full API URL for a resource at request time.
    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "https://{}/admin/api/{}/{}.json",
            self.shop_domain, self.api_version, endpoint
        )
    }

    async fn call_api(
        &self,
        endpoint: &str,
        method: HttpMethod,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let token = self.access_token.as_deref().ok_or_else(|| {
            GatewayError::auth(format!("no access token for shop {}", self.shop_domain))
        })?;

        let mut attempt = 0;
        loop {
            let url = self.api_url(endpoint);
            let mut request = match method {
                HttpMethod::Get => {
                    let query: Vec<(String, String)> = params
                        .iter()
                        .map(|(k, v)| (k.clone(), value_to_param(v)))
                        .collect();
                    self.client.get(&url).query(&query)
                }
                HttpMethod::Post => self.client.post(&url).json(&params),
            };
            request = request.header("X-Shopify-Access-Token", token);

            let response = request
                .send()
                .await
                .map_err(|e| GatewayError::backend(format!("shopify unreachable: {e}")))?;

            let status = response.status();
            if status.as_u16() == 429 && attempt == 0 {
                // One retry after Retry-After, then surface.
                let delay = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(2);
                warn!("shopify rate limited, retrying after {}s", delay);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                attempt += 1;
                continue;
            }

            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| GatewayError::backend(format!("shopify response unreadable: {e}")))?;

            return match status.as_u16() {
                200 | 201 => Ok(body),
                401 | 403 => Err(GatewayError::auth(format!(
                    "shopify rejected the token for {}",
                    self.shop_domain
                ))),
                429 => Err(GatewayError::quota("shopify rate limit exhausted")),
                404 => Err(GatewayError::query_invalid(
                    format!("unknown resource '{endpoint}'"),
                    endpoint,
                )),
                _ => Err(GatewayError::backend(format!(
                    "shopify error ({status}): {body}"
                ))),
            };
        }
    }

    /// Verifies a webhook signature (HMAC-SHA256, constant-time compare).
    pub fn verify_webhook(&self, payload: &[u8], signature_base64: &str) -> Result<bool> {
        let secret = self
            .webhook_secret
            .as_deref()
            .ok_or_else(|| GatewayError::config("webhook secret not configured"))?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::internal(format!("hmac init failed: {e}")))?;
        mac.update(payload);
        let computed = mac.finalize().into_bytes();

        let provided = base64::engine::general_purpose::STANDARD
            .decode(signature_base64)
            .map_err(|_| GatewayError::query_invalid("signature is not base64", signature_base64))?;

        if provided.len() != computed.len() {
            return Ok(false);
        }
        Ok(computed.ct_eq(provided.as_slice()).into())
    }

    /// Normalizes a verified webhook body.
    pub fn process_webhook(&self, topic: &str, body: &serde_json::Value) -> WebhookEvent {
        WebhookEvent {
            event_type: topic.to_string(),
            id: body.get("id").cloned(),
            data: body.clone(),
            shop_domain: Some(self.shop_domain.clone()),
            updated_at: body
                .get("updated_at")
                .and_then(|u| u.as_str())
                .map(String::from),
        }
    }
}

/// Accepts only `SELECT ... FROM <resource> [WHERE ...] [LIMIT n]`.
fn parse_sql_like(text: &str) -> Result<Query> {
    let pattern = Regex::new(
        r"(?is)^\s*SELECT\s+.+?\s+FROM\s+([a-z_]+)(?:\s+WHERE\s+(.+?))?(?:\s+LIMIT\s+(\d+))?\s*;?\s*$",
    )
    .expect("static regex");

    let captures = pattern.captures(text).ok_or_else(|| {
        GatewayError::query_invalid("input does not match the documented SELECT subset", text)
    })?;

    let resource = captures[1].to_lowercase();
    if !KNOWN_RESOURCES.contains(&resource.as_str()) {
        return Err(GatewayError::query_invalid(
            format!("unknown resource '{resource}'"),
            text,
        ));
    }

    let mut params = serde_json::Map::new();
    if let Some(where_clause) = captures.get(2) {
        let condition = Regex::new(r"(?i)^\s*([a-z_]+)\s*=\s*'?([^']*?)'?\s*$").expect("static regex");
        for clause in where_clause.as_str().split_terminator([';']) {
            for part in Regex::new(r"(?i)\s+AND\s+")
                .expect("static regex")
                .split(clause)
            {
                let Some(c) = condition.captures(part) else {
                    return Err(GatewayError::query_invalid(
                        format!("unsupported WHERE clause '{part}'"),
                        text,
                    ));
                };
                let value = c[2].to_string();
                let parsed: serde_json::Value = value
                    .parse::<i64>()
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::String(value));
                params.insert(c[1].to_lowercase(), parsed);
            }
        }
    }
    if let Some(limit) = captures.get(3) {
        let n: i64 = limit.as_str().parse().unwrap_or(50);
        params.insert("limit".to_string(), json!(n));
    }

    Ok(Query::ShopifyApi {
        endpoint: resource,
        method: HttpMethod::Get,
        params,
    })
}

/// Strips legacy full API paths down to the bare resource name.
fn normalize_endpoint(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_start_matches('/');
    let name = if trimmed.starts_with("admin/api/") {
        trimmed
            .rsplit('/')
            .next()
            .unwrap_or(trimmed)
            .trim_end_matches(".json")
    } else {
        trimmed.trim_end_matches(".json")
    };
    let name = name.to_lowercase();

    if KNOWN_RESOURCES.contains(&name.as_str()) {
        Ok(name)
    } else {
        Err(GatewayError::query_invalid(
            format!("unknown resource '{name}'"),
            raw,
        ))
    }
}

fn value_to_param(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Adapter for ShopifyAdapter {
    fn db_type(&self) -> BackendKind {
        BackendKind::Shopify
    }

    fn connection_uri(&self) -> &str {
        &self.uri
    }

    async fn llm_to_query(&self, nl_prompt: &str, _opts: &QueryOptions) -> Result<Query> {
        // Keyword routing: the REST surface is small enough that resource
        // selection does not need a model round-trip.
        let lowered = nl_prompt.to_lowercase();
        let endpoint = if lowered.contains("order") {
            "orders"
        } else if lowered.contains("customer") {
            "customers"
        } else if lowered.contains("inventory") || lowered.contains("stock") {
            "inventory_levels"
        } else {
            "products"
        };

        let mut params = serde_json::Map::new();
        if lowered.contains("active") {
            params.insert("status".to_string(), json!("active"));
        }
        params.insert("limit".to_string(), json!(50));

        Ok(Query::ShopifyApi {
            endpoint: endpoint.to_string(),
            method: HttpMethod::Get,
            params,
        })
    }

    async fn execute(&self, query: &Query) -> Result<Vec<Row>> {
        let Query::ShopifyApi {
            endpoint,
            method,
            params,
        } = query
        else {
            return Err(wrong_variant(BackendKind::Shopify, query));
        };

        let body = self.call_api(endpoint, *method, params).await?;

        // The API nests the collection under the resource name.
        if let Some(items) = body.get(endpoint.as_str()).and_then(|v| v.as_array()) {
            return Ok(items
                .iter()
                .filter_map(|item| item.as_object().cloned())
                .collect());
        }
        if let Some(object) = body.get(endpoint.trim_end_matches('s')).and_then(|v| v.as_object()) {
            return Ok(vec![object.clone()]);
        }
        match body {
            serde_json::Value::Object(map) => Ok(vec![map]),
            other => {
                let mut row = Row::new();
                row.insert("result".to_string(), other);
                Ok(vec![row])
            }
        }
    }

    async fn introspect_schema(&self) -> Result<Vec<SchemaDocument>> {
        let descriptions = [
            ("products", "Products with id, title, status, vendor, variants, and inventory linkage."),
            ("orders", "Orders with id, created_at, financial_status, total_price, and line items."),
            ("customers", "Customers with id, email, orders_count, and total_spent."),
            ("inventory_levels", "Inventory levels keyed by inventory_item_id and location_id."),
        ];

        let mut documents = Vec::with_capacity(descriptions.len());
        for (resource, description) in descriptions {
            let mut content = format!("Resource: {resource}\n{description}\n");
            // Best effort count; introspection succeeds without it.
            if self.access_token.is_some() {
                if let Ok(body) = self
                    .call_api(&format!("{resource}/count"), HttpMethod::Get, &Default::default())
                    .await
                {
                    if let Some(count) = body.get("count") {
                        content.push_str(&format!("Count: {count}\n"));
                    }
                }
            }
            documents.push(SchemaDocument::new(
                format!("resource:{resource}"),
                content,
                "shopify",
            ));
        }
        Ok(documents)
    }

    async fn test_connection(&self) -> bool {
        self.call_api("shop", HttpMethod::Get, &Default::default())
            .await
            .is_ok()
    }
}
