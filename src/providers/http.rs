//! Generic JSON-over-HTTP tier provider.
//!
//! POSTs `{subject, key, hint}` to an endpoint and expects
//! `{found, confidence?, fields?, cost?}` back. 404 means not found; other
//! non-success statuses and transport failures are returned as errors.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::ledger::Cost;
use crate::subject::Subject;
use crate::tier::{Fields, PartialHint, TierProvider, TierRequest, TierResult};

#[derive(Clone)]
pub struct JsonHttpProvider {
    name: String,
    endpoint: String,
    client: Client,
    api_key: Option<String>,
    timeout: Duration,
    /// Charged when the response does not report its own cost.
    default_cost: Cost,
}

#[derive(Serialize)]
struct LookupRequest<'a> {
    subject: &'a Subject,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a PartialHint>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    found: bool,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    cost: Option<f64>,
}

impl JsonHttpProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client: Client::new(),
            api_key: None,
            timeout: Duration::from_secs(10),
            default_cost: Cost::ZERO,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_default_cost(mut self, cost: Cost) -> Self {
        self.default_cost = cost;
        self
    }
}

#[async_trait]
impl TierProvider for JsonHttpProvider {
    async fn invoke(&self, req: TierRequest<'_>) -> Result<TierResult> {
        let body = LookupRequest {
            subject: req.subject,
            key: req.key.to_string(),
            hint: req.hint,
        };
        let mut call = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body);
        if let Some(k) = &self.api_key {
            call = call.bearer_auth(k);
        }

        let resp = call
            .send()
            .await
            .with_context(|| format!("{} POST {}", self.name, self.endpoint))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(TierResult::NotFound {
                cost: self.default_cost,
            });
        }
        if !status.is_success() {
            bail!("{} returned HTTP {}", self.name, status);
        }
        let text = resp.text().await.context("reading provider body")?;
        parse_response(&text, self.default_cost)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Map a provider JSON body into a tier result.
pub fn parse_response(body: &str, default_cost: Cost) -> Result<TierResult> {
    let r: LookupResponse = serde_json::from_str(body).context("parsing provider json")?;
    let cost = r.cost.map(Cost::from_units).unwrap_or(default_cost);
    if !r.found {
        return Ok(TierResult::NotFound { cost });
    }
    let fields: Fields = r
        .fields
        .into_iter()
        .filter_map(|(k, v)| flatten_value(v).map(|s| (k, s)))
        .collect();
    Ok(TierResult::Found {
        fields,
        confidence: r.confidence,
        cost,
        page: None,
    })
}

fn flatten_value(v: serde_json::Value) -> Option<String> {
    use serde_json::Value;
    match v {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
