//! Lightweight HTTP scraper tier.
//!
//! Follows redirects by hand so every hop is recorded; the content-quality
//! validator needs the chain to spot registrar/parking redirects.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header, redirect, Client, StatusCode, Url};

use crate::ledger::Cost;
use crate::subject::{normalize_domain, normalize_email, Subject};
use crate::tier::{ScrapedPage, TierProvider, TierRequest, TierResult};

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub struct HttpScrapeProvider {
    name: String,
    client: Client,
    max_redirects: usize,
    cost: Cost,
}

impl HttpScrapeProvider {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent("enrichment-waterfall/0.1")
            .redirect(redirect::Policy::none())
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(15))
            .build()
            .context("building scrape http client")?;
        Ok(Self {
            name: name.into(),
            client,
            max_redirects: 8,
            cost: Cost::ZERO,
        })
    }

    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_max_redirects(mut self, n: usize) -> Self {
        self.max_redirects = n;
        self
    }

    async fn fetch(&self, start: Url) -> Result<Option<ScrapedPage>> {
        let mut url = start;
        let mut chain = Vec::new();

        for _ in 0..=self.max_redirects {
            let mut resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .with_context(|| format!("{} GET {}", self.name, url))?;
            let status = resp.status();

            if status.is_redirection() {
                let next = resp
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|loc| resolve_location(&url, loc));
                let Some(next) = next else {
                    bail!("{} redirect without usable Location from {}", self.name, url);
                };
                chain.push(url.to_string());
                url = next;
                continue;
            }

            if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
                return Ok(None);
            }
            if status.is_server_error() {
                bail!("{} returned HTTP {} for {}", self.name, status, url);
            }

            // 4xx challenge pages still go to the content checks
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = resp.chunk().await.context("reading scraped body")? {
                let room = MAX_BODY_BYTES - buf.len();
                buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if buf.len() >= MAX_BODY_BYTES {
                    break;
                }
            }
            let body = String::from_utf8_lossy(&buf).into_owned();
            return Ok(Some(ScrapedPage {
                body,
                final_url: Some(url.to_string()),
                redirect_chain: chain,
            }));
        }
        bail!("{} exceeded {} redirects", self.name, self.max_redirects)
    }
}

#[async_trait]
impl TierProvider for HttpScrapeProvider {
    async fn invoke(&self, req: TierRequest<'_>) -> Result<TierResult> {
        let Some(host) = start_host(req.subject) else {
            return Ok(TierResult::NotFound { cost: Cost::ZERO });
        };
        let start = Url::parse(&format!("https://{host}/")).context("building start url")?;
        Ok(match self.fetch(start).await? {
            Some(page) => TierResult::scraped(page, self.cost),
            None => TierResult::NotFound { cost: self.cost },
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Site to scrape for a subject: its website, else the company domain,
/// else the domain of its email address.
pub fn start_host(subject: &Subject) -> Option<String> {
    subject
        .url
        .as_deref()
        .and_then(normalize_domain)
        .or_else(|| subject.company_domain.as_deref().and_then(normalize_domain))
        .or_else(|| {
            let email = normalize_email(subject.email.as_deref()?)?;
            email.split_once('@').map(|(_, d)| d.to_string())
        })
}

/// Resolve a `Location` header against the current URL (relative allowed).
pub fn resolve_location(current: &Url, location: &str) -> Option<Url> {
    let loc = location.trim();
    if loc.is_empty() {
        return None;
    }
    current.join(loc).ok()
}
