//! Launch deep links
//!
//! Decides whether an incoming URL may start a verification flow.
//! Pure and stateless.
//!
//! Format: `https://<host><path-prefix>[/...]?sessionId=...&nonce=...`

use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Issuer host for the passport flow
pub const ISSUER_HOST: &str = "passport-issuer.staging.yivi.app";

/// Path the issuer links to
pub const ISSUER_PATH: &str = "/start-app";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeepLinkError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported scheme: {0}")]
    Scheme(String),

    #[error("Unexpected host: {0}")]
    Host(String),

    #[error("Unexpected path: {0}")]
    Path(String),

    #[error("Missing parameter: {0}")]
    MissingParam(String),

    #[error("Malformed parameter: {0}")]
    MalformedParam(String),
}

/// Syntax a query parameter must follow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamFormat {
    /// Exactly n ASCII letters or digits
    Alphanumeric(usize),
    /// Exactly n hex digits, either case
    Hex(usize),
    /// Lowercase hyphenated UUID
    Uuid,
    Base64,
    Digits,
    NonEmpty,
}

impl ParamFormat {
    fn pattern(&self) -> String {
        match self {
            ParamFormat::Alphanumeric(n) => format!("^[A-Za-z0-9]{{{}}}$", n),
            ParamFormat::Hex(n) => format!("^[0-9A-Fa-f]{{{}}}$", n),
            ParamFormat::Uuid => {
                "^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$".to_string()
            }
            ParamFormat::Base64 => "^[A-Za-z0-9+/]+=*$".to_string(),
            ParamFormat::Digits => "^[0-9]+$".to_string(),
            ParamFormat::NonEmpty => "^.+$".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ParamRule {
    name: String,
    format: ParamFormat,
    regex: Regex,
}

/// Which URLs may launch a verification flow
#[derive(Debug, Clone)]
pub struct DeepLinkPolicy {
    scheme: String,
    host: String,
    path_prefix: String,
    params: Vec<ParamRule>,
}

/// A launch URL that passed the policy
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct LaunchRequest {
    pub url: String,
    pub session_id: String,
    pub nonce: String,
    /// Every required parameter, by name
    pub params: HashMap<String, String>,
}

impl Default for DeepLinkPolicy {
    fn default() -> Self {
        Self::issuer_start_app()
    }
}

impl DeepLinkPolicy {
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        path_prefix: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            path_prefix: path_prefix.into(),
            params: Vec::new(),
        }
    }

    /// Passport issuer links: `https://passport-issuer.staging.yivi.app/start-app`
    pub fn issuer_start_app() -> Self {
        Self::new("https", ISSUER_HOST, ISSUER_PATH)
            .require("sessionId", ParamFormat::Alphanumeric(32))
            .require("nonce", ParamFormat::Hex(32))
    }

    /// Signed validation links: `https://mrtd.app/validate`
    pub fn mrtd_validate() -> Self {
        Self::new("https", "mrtd.app", "/validate")
            .require("sessionId", ParamFormat::Uuid)
            .require("nonce", ParamFormat::Base64)
            .require("timestamp", ParamFormat::Digits)
            .require("signature", ParamFormat::NonEmpty)
    }

    /// Add a required query parameter
    pub fn require(mut self, name: impl Into<String>, format: ParamFormat) -> Self {
        let regex = Regex::new(&format.pattern()).expect("parameter patterns are valid");
        self.params.push(ParamRule {
            name: name.into(),
            format,
            regex,
        });
        self
    }

    pub fn accepts(&self, url: &str) -> bool {
        match self.parse(url) {
            Ok(_) => true,
            Err(e) => {
                debug!("Rejected launch URL: {}", e);
                false
            }
        }
    }

    pub fn parse(&self, raw: &str) -> Result<LaunchRequest, DeepLinkError> {
        let url = Url::parse(raw).map_err(|e| DeepLinkError::InvalidUrl(e.to_string()))?;

        if url.scheme() != self.scheme {
            return Err(DeepLinkError::Scheme(url.scheme().to_string()));
        }

        let host = url.host_str().unwrap_or_default();
        if host != self.host {
            return Err(DeepLinkError::Host(host.to_string()));
        }

        if !self.path_matches(url.path()) {
            return Err(DeepLinkError::Path(url.path().to_string()));
        }

        // First occurrence wins
        let mut query: HashMap<String, String> = HashMap::new();
        for (key, value) in url.query_pairs() {
            query.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }

        let mut params = HashMap::new();
        for rule in &self.params {
            let value = query
                .get(&rule.name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| DeepLinkError::MissingParam(rule.name.clone()))?;
            if !rule.regex.is_match(value) {
                debug!("Parameter {} does not match {:?}", rule.name, rule.format);
                return Err(DeepLinkError::MalformedParam(rule.name.clone()));
            }
            params.insert(rule.name.clone(), value.clone());
        }

        Ok(LaunchRequest {
            url: raw.to_string(),
            session_id: params.get("sessionId").cloned().unwrap_or_default(),
            nonce: params.get("nonce").cloned().unwrap_or_default(),
            params,
        })
    }

    /// Exact match or a sub-path: `/start-app` and `/start-app/x`, not `/start-apps`
    fn path_matches(&self, path: &str) -> bool {
        let prefix = self.path_prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}
