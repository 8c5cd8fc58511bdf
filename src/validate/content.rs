//! Content-quality checks for scrape-style tiers.
//!
//! Order matters: redirect-chain hosts are inspected first and short-circuit
//! as parked, before length or marker checks run.

use serde::{Deserialize, Serialize};

use crate::tier::ScrapedPage;
use crate::validate::RejectReason;

pub const DEFAULT_MIN_CONTENT_BYTES: usize = 500;
/// A page is flagged once this many distinct markers of one kind appear.
pub const DEFAULT_MARKER_LIMIT: usize = 2;

const BLOCKED_MARKERS: &[&str] = &[
    "access denied",
    "attention required",
    "checking your browser",
    "verify you are human",
    "are you a robot",
    "captcha",
    "cf-browser-verification",
    "cloudflare ray id",
    "ddos protection",
    "enable javascript and cookies",
    "just a moment",
    "request blocked",
    "unusual traffic",
    "403 forbidden",
    "bot detection",
];

const PARKED_MARKERS: &[&str] = &[
    "this domain is for sale",
    "domain is for sale",
    "buy this domain",
    "this domain may be for sale",
    "make an offer on this domain",
    "domain parking",
    "parked free",
    "parked domain",
    "related searches",
    "inquire about this domain",
    "the domain name is available",
    "hugedomains",
    "sedo domain",
];

const PARKED_HOSTS: &[&str] = &[
    "sedoparking.com",
    "sedo.com",
    "hugedomains.com",
    "afternic.com",
    "dan.com",
    "bodis.com",
    "parkingcrew.net",
    "above.com",
    "undeveloped.com",
    "domainmarket.com",
    "parklogic.com",
];

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn default_min_bytes() -> usize {
    DEFAULT_MIN_CONTENT_BYTES
}
fn default_marker_limit() -> usize {
    DEFAULT_MARKER_LIMIT
}
fn default_blocked() -> Vec<String> {
    owned(BLOCKED_MARKERS)
}
fn default_parked() -> Vec<String> {
    owned(PARKED_MARKERS)
}
fn default_parked_hosts() -> Vec<String> {
    owned(PARKED_HOSTS)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRules {
    /// Body must be strictly longer than this many bytes.
    #[serde(default = "default_min_bytes")]
    pub min_bytes: usize,
    #[serde(default = "default_marker_limit")]
    pub marker_limit: usize,
    #[serde(default = "default_blocked")]
    pub blocked_markers: Vec<String>,
    #[serde(default = "default_parked")]
    pub parked_markers: Vec<String>,
    /// Registrar / parking hosts; matches the host itself or any subdomain.
    #[serde(default = "default_parked_hosts")]
    pub parked_hosts: Vec<String>,
}

impl Default for ContentRules {
    fn default() -> Self {
        Self {
            min_bytes: default_min_bytes(),
            marker_limit: default_marker_limit(),
            blocked_markers: default_blocked(),
            parked_markers: default_parked(),
            parked_hosts: default_parked_hosts(),
        }
    }
}

impl ContentRules {
    pub fn with_min_bytes(mut self, n: usize) -> Self {
        self.min_bytes = n;
        self
    }

    pub fn check(&self, page: &ScrapedPage) -> Result<(), RejectReason> {
        let hops = page.redirect_chain.iter().chain(page.final_url.iter());
        for hop in hops {
            if let Some(host) = self.parked_host_match(hop) {
                return Err(RejectReason::ParkedDomainDetected {
                    evidence: format!("redirect via {host}"),
                });
            }
        }

        let len = page.body.len();
        if len <= self.min_bytes {
            return Err(RejectReason::ContentTooShort {
                len,
                min: self.min_bytes,
            });
        }

        let text = normalize_for_markers(&page.body);
        let limit = self.marker_limit.max(1);

        let blocked = markers_present(&text, &self.blocked_markers);
        if blocked.len() >= limit {
            return Err(RejectReason::BlockedContentDetected { markers: blocked });
        }

        let parked = markers_present(&text, &self.parked_markers);
        if parked.len() >= limit {
            return Err(RejectReason::ParkedDomainDetected {
                evidence: parked.join(", "),
            });
        }

        Ok(())
    }

    /// Returns the configured pattern that `url`'s host matches, if any.
    fn parked_host_match(&self, url: &str) -> Option<&str> {
        let host = host_of(url)?;
        self.parked_hosts
            .iter()
            .map(|p| p.trim().trim_start_matches("*.").to_ascii_lowercase())
            .zip(self.parked_hosts.iter())
            .find(|(p, _)| !p.is_empty() && (host == *p || host.ends_with(&format!(".{p}"))))
            .map(|(_, original)| original.as_str())
    }
}

/// Host part of a URL or bare host, lower-cased, without `www.` or port.
fn host_of(url: &str) -> Option<String> {
    let s = url.trim().to_ascii_lowercase();
    let rest = match s.find("://") {
        Some(i) => &s[i + 3..],
        None => s.as_str(),
    };
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host).trim_end_matches('.');
    let host = host.strip_prefix("www.").unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Decode entities and lower-case so markers match regardless of markup.
fn normalize_for_markers(body: &str) -> String {
    let decoded = html_escape::decode_html_entities(body);
    decoded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn markers_present(text: &str, markers: &[String]) -> Vec<String> {
    let mut hits: Vec<String> = markers
        .iter()
        .map(|m| m.trim().to_lowercase())
        .filter(|m| !m.is_empty() && text.contains(m.as_str()))
        .collect();
    hits.sort();
    hits.dedup();
    hits
}
