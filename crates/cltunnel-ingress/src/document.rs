//! cloudflared configuration document codec
//!
//! The document is parsed in two steps: YAML syntax first ([`parse_value`]),
//! then the schema gate ([`crate::schema::validate`]). Keys the engine does not
//! understand are kept verbatim so that a parse/serialize round trip only
//! touches `tunnel`, `credentials-file` and `ingress`.

use serde_yaml::{Mapping, Value};
use std::fmt;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::error::{DocumentError, IngressError};
use crate::rules::RuleSet;

pub(crate) const TUNNEL_KEY: &str = "tunnel";
pub(crate) const CREDENTIALS_KEY: &str = "credentials-file";
pub(crate) const INGRESS_KEY: &str = "ingress";
pub(crate) const HOSTNAME_KEY: &str = "hostname";
pub(crate) const SERVICE_KEY: &str = "service";

/// Where an ingress rule sends matching traffic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceTarget {
    /// A local service URL, kept exactly as written (e.g. `http://localhost:3000`)
    Url(String),
    /// A synthetic response such as `http_status:404`
    HttpStatus(String),
}

impl ServiceTarget {
    pub const HTTP_STATUS_PREFIX: &'static str = "http_status:";

    /// Parse a `service` value
    ///
    /// Returns the human readable reason on failure.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if let Some(token) = raw.strip_prefix(Self::HTTP_STATUS_PREFIX) {
            if token.is_empty() || token.chars().any(char::is_whitespace) {
                return Err(format!(
                    "HTTP status response must look like \"{}404\"",
                    Self::HTTP_STATUS_PREFIX
                ));
            }
            return Ok(Self::HttpStatus(raw.to_string()));
        }

        match url::Url::parse(raw) {
            Ok(_) => Ok(Self::Url(raw.to_string())),
            Err(_) => Err(
                "Service must be a valid URL or a valid HTTP status code response like \"http_status:404\""
                    .to_string(),
            ),
        }
    }

    /// Target for a service listening on a local port
    pub fn local_port(port: u16) -> Self {
        Self::Url(format!("http://localhost:{}", port))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Url(s) | Self::HttpStatus(s) => s,
        }
    }
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingress rule: hostname (or catch-all) to service
#[derive(Debug, Clone, PartialEq)]
pub struct IngressRule {
    pub hostname: Option<String>,
    pub service: ServiceTarget,
    /// Keys other than `hostname`/`service` (`path`, `originRequest`, ...)
    extra: Mapping,
}

impl IngressRule {
    pub fn new(hostname: Option<String>, service: ServiceTarget) -> Self {
        Self {
            hostname,
            service,
            extra: Mapping::new(),
        }
    }

    /// Rule for a specific hostname
    pub fn for_host(hostname: impl Into<String>, service: ServiceTarget) -> Self {
        Self::new(Some(hostname.into()), service)
    }

    /// Catch-all rule (no hostname)
    pub fn catch_all(service: ServiceTarget) -> Self {
        Self::new(None, service)
    }

    pub(crate) fn with_extra(mut self, extra: Mapping) -> Self {
        self.extra = extra;
        self
    }

    /// Preserved keys the engine does not interpret
    pub fn extra(&self) -> &Mapping {
        &self.extra
    }

    /// Identity key used for conflicts and dedup
    pub fn key(&self) -> Option<String> {
        self.hostname.as_deref().map(hostname_key)
    }

    /// Whether this rule answers for `hostname`
    pub fn matches_host(&self, hostname: &str) -> bool {
        self.key().as_deref() == Some(hostname_key(hostname).as_str())
    }

    fn to_value(&self) -> Value {
        let mut map = Mapping::new();
        if let Some(hostname) = &self.hostname {
            map.insert(Value::from(HOSTNAME_KEY), Value::from(hostname.as_str()));
        }
        map.insert(Value::from(SERVICE_KEY), Value::from(self.service.as_str()));
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        Value::Mapping(map)
    }
}

pub(crate) fn hostname_key(hostname: &str) -> String {
    hostname.to_ascii_lowercase()
}

/// A schema-valid cloudflared configuration
#[derive(Debug, Clone, PartialEq)]
pub struct IngressDocument {
    pub tunnel: Uuid,
    pub credentials_file: String,
    pub ingress: Vec<IngressRule>,
    /// The original top-level mapping, including keys we do not interpret
    fields: Mapping,
}

impl IngressDocument {
    pub fn new(
        tunnel: Uuid,
        credentials_file: impl Into<String>,
        ingress: Vec<IngressRule>,
    ) -> Self {
        Self {
            tunnel,
            credentials_file: credentials_file.into(),
            ingress,
            fields: Mapping::new(),
        }
    }

    pub(crate) fn with_fields(mut self, fields: Mapping) -> Self {
        self.fields = fields;
        self
    }

    /// Top-level keys other than the ones the engine manages
    pub fn unknown_fields(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.fields.iter().filter(|(k, _)| {
            !matches!(k.as_str(), Some(TUNNEL_KEY | CREDENTIALS_KEY | INGRESS_KEY))
        })
    }

    pub fn rules(&self) -> RuleSet {
        RuleSet::from(self.ingress.clone())
    }

    /// Same document with a different rule collection
    pub fn with_rules(&self, rules: RuleSet) -> Self {
        Self {
            ingress: rules.into_vec(),
            ..self.clone()
        }
    }

    /// Rules that carry a hostname, in document order
    pub fn hostname_rules(&self) -> impl Iterator<Item = &IngressRule> {
        self.ingress.iter().filter(|r| r.hostname.is_some())
    }

    pub fn to_value(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert(
            Value::from(TUNNEL_KEY),
            Value::from(self.tunnel.hyphenated().to_string()),
        );
        fields.insert(
            Value::from(CREDENTIALS_KEY),
            Value::from(self.credentials_file.as_str()),
        );
        fields.insert(
            Value::from(INGRESS_KEY),
            Value::Sequence(self.ingress.iter().map(IngressRule::to_value).collect()),
        );
        Value::Mapping(fields)
    }

    /// Serialize to the on-disk YAML form
    pub fn to_yaml(&self) -> Result<String, DocumentError> {
        serde_yaml::to_string(&self.to_value()).map_err(DocumentError::Serialize)
    }
}

/// The verbatim pre-transaction file contents
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    text: String,
}

impl Snapshot {
    pub fn capture(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Write the captured text back over `path`
    pub fn restore(&self, path: &Path) -> std::io::Result<()> {
        write(path, &self.text)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("len", &self.text.len())
            .finish()
    }
}

/// Parse YAML syntax only
pub fn parse_value(text: &str) -> Result<Value, DocumentError> {
    serde_yaml::from_str(text).map_err(DocumentError::Malformed)
}

/// Parse and schema-validate a document
pub fn parse(text: &str) -> Result<IngressDocument, DocumentError> {
    let value = parse_value(text)?;
    crate::schema::validate(&value).map_err(DocumentError::Schema)
}

/// Read the whole file as a snapshot
pub fn read(path: &Path) -> Result<Snapshot, IngressError> {
    let text = fs::read_to_string(path).map_err(|source| IngressError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Snapshot::capture(text))
}

/// Read, snapshot and validate the document at `path`
pub fn load(path: &Path) -> Result<(Snapshot, IngressDocument), IngressError> {
    let snapshot = read(path)?;
    let document = parse(snapshot.as_str())?;
    Ok((snapshot, document))
}

/// Overwrite the file wholesale
pub fn write(path: &Path, text: &str) -> std::io::Result<()> {
    fs::write(path, text)
}
