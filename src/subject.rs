//! # Subject
//! The partial identity/company record being enriched, and its normalization
//! into a single lookup key.
//!
//! Key precedence when several identifiers are present:
//! email → LinkedIn → domain/URL → (name, company domain).

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EnrichError;

/// Value of a context attribute used by eligibility predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttrValue::Number(n) => Some(*n),
            AttrValue::Text(s) => s.trim().parse::<f64>().ok(),
            AttrValue::Bool(_) => None,
        }
    }

    /// Case-insensitive comparison against a configured text value.
    pub fn matches_text(&self, expected: &str) -> bool {
        match self {
            AttrValue::Text(s) => s.trim().eq_ignore_ascii_case(expected.trim()),
            AttrValue::Bool(b) => expected.trim().eq_ignore_ascii_case(&b.to_string()),
            AttrValue::Number(n) => expected
                .trim()
                .parse::<f64>()
                .map(|e| (e - n).abs() < f64::EPSILON)
                .unwrap_or(false),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}
impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}
impl From<f64> for AttrValue {
    fn from(n: f64) -> Self {
        AttrValue::Number(n)
    }
}
impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::Number(n as f64)
    }
}
impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

/// Raw identifying fields as supplied by the surrounding application.
/// Immutable once built; normalization happens in [`Subject::key`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub email: Option<String>,
    /// Website URL or bare domain.
    #[serde(default)]
    pub url: Option<String>,
    /// LinkedIn profile URL or bare profile id.
    #[serde(default)]
    pub linkedin: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company_domain: Option<String>,
    /// Gating attributes (jurisdiction, lead score, ...).
    #[serde(default)]
    pub context: BTreeMap<String, AttrValue>,
}

impl Subject {
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Self::default()
        }
    }

    pub fn with_domain(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_linkedin(profile: impl Into<String>) -> Self {
        Self {
            linkedin: Some(profile.into()),
            ..Self::default()
        }
    }

    pub fn with_name_at(name: impl Into<String>, company_domain: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            company_domain: Some(company_domain.into()),
            ..Self::default()
        }
    }

    /// Builder-style context attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }

    pub fn context_attr(&self, name: &str) -> Option<&AttrValue> {
        self.context.get(name)
    }

    /// Normalize the identifying fields into one lookup key.
    pub fn key(&self) -> Result<SubjectKey, EnrichError> {
        if let Some(email) = self.email.as_deref().and_then(normalize_email) {
            return Ok(SubjectKey::new(IdKind::Email, email));
        }
        if let Some(id) = self.linkedin.as_deref().and_then(normalize_linkedin) {
            return Ok(SubjectKey::new(IdKind::LinkedIn, id));
        }
        if let Some(domain) = self.url.as_deref().and_then(normalize_domain) {
            return Ok(SubjectKey::new(IdKind::Domain, domain));
        }
        let name = self.name.as_deref().map(normalize_name).unwrap_or_default();
        let company = self.company_domain.as_deref().and_then(normalize_domain);
        if let (false, Some(domain)) = (name.is_empty(), company) {
            return Ok(SubjectKey::new(IdKind::Name, format!("{name}@{domain}")));
        }

        Err(EnrichError::SubjectInvalid {
            reason: self.invalid_reason(),
        })
    }

    fn invalid_reason(&self) -> String {
        let supplied = [
            ("email", self.email.is_some()),
            ("url", self.url.is_some()),
            ("linkedin", self.linkedin.is_some()),
            ("name", self.name.is_some()),
            ("company_domain", self.company_domain.is_some()),
        ]
        .iter()
        .filter(|(_, present)| *present)
        .map(|(f, _)| *f)
        .collect::<Vec<_>>();

        if supplied.is_empty() {
            "no identifying field present".to_string()
        } else {
            format!("could not normalize any of: {}", supplied.join(", "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    Email,
    LinkedIn,
    Domain,
    Name,
}

impl IdKind {
    fn prefix(self) -> &'static str {
        match self {
            IdKind::Email => "email",
            IdKind::LinkedIn => "linkedin",
            IdKind::Domain => "domain",
            IdKind::Name => "name",
        }
    }
}

/// Normalized lookup key, e.g. `domain:acme.com.au` or `email:jo@acme.com`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey {
    kind: IdKind,
    value: String,
}

impl SubjectKey {
    fn new(kind: IdKind, value: String) -> Self {
        Self { kind, value }
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Short anonymized id for logs; raw emails never reach log output.
    pub fn anon(&self) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(self.to_string().as_bytes());
        let mut out = String::with_capacity(12);
        for b in digest.iter().take(6) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.value)
    }
}

static RE_LINKEDIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)linkedin\.com/(in|company|pub)/([^/?#\s]+)").expect("linkedin regex")
});
static RE_LINKEDIN_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_\-%.]{1,99}$").expect("linkedin id regex"));
static RE_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9\-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9\-]*[a-z0-9])?)+$").expect("host regex"));

/// Lower-case, trim, require `local@domain.tld`.
pub fn normalize_email(raw: &str) -> Option<String> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_prefix("mailto:").unwrap_or(&s);
    let (local, domain) = s.split_once('@')?;
    if local.is_empty() || domain.contains('@') || local.chars().any(char::is_whitespace) {
        return None;
    }
    let domain = normalize_domain(domain)?;
    Some(format!("{local}@{domain}"))
}

/// Strip scheme, `www.`, credentials, port, path, query and fragment.
/// `HTTPS://www.Acme.com.au/about?x=1` → `acme.com.au`.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut s = raw.trim().to_ascii_lowercase();
    if let Some(idx) = s.find("://") {
        s = s[idx + 3..].to_string();
    }
    let end = s.find(['/', '?', '#']).unwrap_or(s.len());
    s.truncate(end);
    if let Some(idx) = s.rfind('@') {
        s = s[idx + 1..].to_string();
    }
    if let Some(idx) = s.find(':') {
        s.truncate(idx);
    }
    let s = s.trim_end_matches('.');
    let s = s.strip_prefix("www.").unwrap_or(s);
    if RE_HOST.is_match(s) {
        Some(s.to_string())
    } else {
        None
    }
}

/// Full profile URL → `in/<id>` / `company/<id>`; bare id → `in/<id>`.
pub fn normalize_linkedin(raw: &str) -> Option<String> {
    let s = raw.trim();
    if let Some(caps) = RE_LINKEDIN.captures(s) {
        let kind = caps.get(1)?.as_str().to_ascii_lowercase();
        let id = caps.get(2)?.as_str().to_ascii_lowercase();
        let kind = if kind == "pub" { "in".to_string() } else { kind };
        return Some(format!("{kind}/{id}"));
    }
    let bare = s.trim_matches('/').to_ascii_lowercase();
    if RE_LINKEDIN_ID.is_match(&bare) {
        Some(format!("in/{bare}"))
    } else {
        None
    }
}

/// Collapse whitespace, lower-case.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
