//! Structural contract for the cloudflared configuration document
//!
//! Checks field presence and format only; whether cloudflared actually accepts
//! the configuration is decided by the external semantic validator. Every
//! violated field is reported, validation never stops at the first error.

use serde_yaml::{Mapping, Value};
use std::fmt;
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

use crate::document::{
    IngressDocument, IngressRule, ServiceTarget, CREDENTIALS_KEY, HOSTNAME_KEY, INGRESS_KEY,
    SERVICE_KEY, TUNNEL_KEY,
};

/// One violated field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Field path, e.g. `ingress[2].service`
    pub path: String,
    pub reason: String,
}

impl SchemaViolation {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// All violations found in one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolations(pub Vec<SchemaViolation>);

impl SchemaViolations {
    pub fn iter(&self) -> impl Iterator<Item = &SchemaViolation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.0.iter().map(|v| v.path.as_str()).collect()
    }
}

impl fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", violation)?;
        }
        Ok(())
    }
}

/// Validate a parsed YAML value and build the typed document
pub fn validate(value: &Value) -> Result<IngressDocument, SchemaViolations> {
    let Some(root) = value.as_mapping() else {
        return Err(SchemaViolations(vec![SchemaViolation::new(
            "$",
            "Document must be a mapping",
        )]));
    };

    let mut violations = Vec::new();

    let tunnel = validate_tunnel(root.get(TUNNEL_KEY), &mut violations);
    let credentials_file = validate_credentials(root.get(CREDENTIALS_KEY), &mut violations);
    let ingress = validate_ingress(root.get(INGRESS_KEY), &mut violations);

    if !violations.is_empty() {
        return Err(SchemaViolations(violations));
    }

    match (tunnel, credentials_file, ingress) {
        (Some(tunnel), Some(credentials_file), Some(ingress)) => {
            Ok(IngressDocument::new(tunnel, credentials_file, ingress)
                .with_fields(placeholders(root)))
        }
        // every None above pushed a violation
        _ => Err(SchemaViolations(violations)),
    }
}

/// Keep key positions of the managed fields but not their stale values
fn placeholders(root: &Mapping) -> Mapping {
    root.iter()
        .map(|(k, v)| match k.as_str() {
            Some(TUNNEL_KEY | CREDENTIALS_KEY | INGRESS_KEY) => (k.clone(), Value::Null),
            _ => (k.clone(), v.clone()),
        })
        .collect()
}

fn validate_tunnel(value: Option<&Value>, violations: &mut Vec<SchemaViolation>) -> Option<Uuid> {
    match value {
        None => {
            violations.push(SchemaViolation::new(TUNNEL_KEY, "Required"));
            None
        }
        Some(Value::String(raw)) => match Uuid::parse_str(raw) {
            Ok(id) => Some(id),
            Err(_) => {
                violations.push(SchemaViolation::new(TUNNEL_KEY, "Invalid UUID"));
                None
            }
        },
        Some(_) => {
            violations.push(SchemaViolation::new(TUNNEL_KEY, "Expected a UUID string"));
            None
        }
    }
}

fn validate_credentials(
    value: Option<&Value>,
    violations: &mut Vec<SchemaViolation>,
) -> Option<String> {
    match value {
        None => {
            violations.push(SchemaViolation::new(CREDENTIALS_KEY, "Required"));
            None
        }
        Some(Value::String(path)) if path.trim().is_empty() => {
            violations.push(SchemaViolation::new(
                CREDENTIALS_KEY,
                "Credentials file path must not be empty",
            ));
            None
        }
        Some(Value::String(path)) => {
            check_credentials_exist(path);
            Some(path.clone())
        }
        Some(_) => {
            violations.push(SchemaViolation::new(
                CREDENTIALS_KEY,
                "Expected a file path string",
            ));
            None
        }
    }
}

/// Advisory only: the file may be created or moved independently of us
fn check_credentials_exist(path: &str) {
    match Path::new(path).try_exists() {
        Ok(true) => {}
        Ok(false) => warn!(path = %path, "Credentials file does not exist"),
        Err(e) => warn!(path = %path, error = %e, "Could not check credentials file"),
    }
}

fn validate_ingress(
    value: Option<&Value>,
    violations: &mut Vec<SchemaViolation>,
) -> Option<Vec<IngressRule>> {
    let items = match value {
        None => {
            violations.push(SchemaViolation::new(INGRESS_KEY, "Required"));
            return None;
        }
        Some(Value::Sequence(items)) => items,
        Some(_) => {
            violations.push(SchemaViolation::new(INGRESS_KEY, "Expected a list of rules"));
            return None;
        }
    };

    let before = violations.len();
    let rules: Vec<_> = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| validate_rule(i, item, violations))
        .collect();

    (violations.len() == before).then_some(rules)
}

fn validate_rule(
    index: usize,
    value: &Value,
    violations: &mut Vec<SchemaViolation>,
) -> Option<IngressRule> {
    let path = format!("{}[{}]", INGRESS_KEY, index);
    let Some(map) = value.as_mapping() else {
        violations.push(SchemaViolation::new(path, "Expected a rule mapping"));
        return None;
    };

    let hostname = match map.get(HOSTNAME_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(h)) if h.is_empty() => Err("Hostname must not be empty"),
        Some(Value::String(h)) => Ok(Some(h.clone())),
        Some(_) => Err("Expected a hostname string"),
    };
    let hostname = hostname
        .map_err(|reason| {
            violations.push(SchemaViolation::new(
                format!("{}.{}", path, HOSTNAME_KEY),
                reason,
            ))
        })
        .ok();

    let service = match map.get(SERVICE_KEY) {
        None => Err("Required".to_string()),
        Some(Value::String(raw)) => ServiceTarget::parse(raw),
        Some(_) => Err("Expected a service string".to_string()),
    };
    let service = service
        .map_err(|reason| {
            violations.push(SchemaViolation::new(
                format!("{}.{}", path, SERVICE_KEY),
                reason,
            ))
        })
        .ok();

    let extra: Mapping = map
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), Some(HOSTNAME_KEY | SERVICE_KEY)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Some(IngressRule::new(hostname?, service?).with_extra(extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_value;

    fn check(yaml: &str) -> Result<IngressDocument, SchemaViolations> {
        validate(&parse_value(yaml).unwrap())
    }

    #[test]
    fn test_valid_document() {
        let doc = check(
            r#"
tunnel: 6ff42ae2-765d-4adf-8112-31c55c1551ef
credentials-file: /tmp/creds.json
ingress:
  - hostname: a.example.com
    service: http://localhost:3000
  - service: http_status:404
"#,
        )
        .unwrap();
        assert_eq!(doc.ingress.len(), 2);
    }

    #[test]
    fn test_root_must_be_mapping() {
        let err = check("- just\n- a list\n").unwrap_err();
        assert_eq!(err.paths(), vec!["$"]);

        let err = check("").unwrap_err();
        assert_eq!(err.paths(), vec!["$"]);
    }

    #[test]
    fn test_reports_every_violation() {
        let err = check(
            r#"
tunnel: nope
credentials-file: ""
ingress:
  - hostname: a.example.com
    service: "not a url"
  - hostname: 42
  - "plain string"
"#,
        )
        .unwrap_err();

        assert_eq!(
            err.paths(),
            vec![
                "tunnel",
                "credentials-file",
                "ingress[0].service",
                "ingress[1].hostname",
                "ingress[1].service",
                "ingress[2]",
            ]
        );
    }

    #[test]
    fn test_missing_required_fields() {
        let err = check("loglevel: debug\n").unwrap_err();
        assert_eq!(err.paths(), vec!["tunnel", "credentials-file", "ingress"]);
        assert!(err.iter().all(|v| v.reason == "Required"));
    }

    #[test]
    fn test_missing_credentials_file_is_advisory() {
        let doc = check(
            r#"
tunnel: 6ff42ae2-765d-4adf-8112-31c55c1551ef
credentials-file: /definitely/not/here.json
ingress: []
"#,
        );
        assert!(doc.is_ok());
    }

    #[test]
    fn test_http_status_needs_token() {
        let err = check(
            r#"
tunnel: 6ff42ae2-765d-4adf-8112-31c55c1551ef
credentials-file: /tmp/creds.json
ingress:
  - service: "http_status:"
"#,
        )
        .unwrap_err();
        assert_eq!(err.paths(), vec!["ingress[0].service"]);
    }

    #[test]
    fn test_display_lists_all() {
        let err = check("tunnel: nope\n").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("tunnel: Invalid UUID"));
        assert!(text.contains("credentials-file: Required"));
        assert!(text.contains("ingress: Required"));
    }
}
