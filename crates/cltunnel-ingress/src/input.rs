//! Validation of user-supplied subdomains, ports and base domains
//!
//! Runs before any rule set operation so that nothing is touched when the
//! input is bad. All offending fields are reported together.

use regex_lite::Regex;
use std::sync::OnceLock;

use crate::error::{InputError, InputErrors};

const SUBDOMAIN_REASON: &str = "Subdomains must contain only alphanumeric characters and hyphens, \
cannot start or end with a hyphen, and must be 1-63 characters long. \
Cloudflare only supports automatic SSL termination for subdomains 1 level deep.";

const PORT_REASON: &str = "Port must be a number between 1 and 65535.";

const DOMAIN_REASON: &str = "Domain must be a valid hostname made of labels of 1-63 \
alphanumeric characters or hyphens, at most 253 characters in total.";

const MAX_DOMAIN_LEN: usize = 253;

fn label_regex() -> &'static Regex {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    LABEL.get_or_init(|| {
        Regex::new(r"(?i)^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("label pattern is valid")
    })
}

/// A validated `add` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub subdomain: String,
    pub port: u16,
}

impl NewEntry {
    /// Fully-qualified hostname under `domain`
    pub fn hostname(&self, domain: &str) -> String {
        format!("{}.{}", self.subdomain, domain)
    }
}

fn is_valid_label(label: &str) -> bool {
    label_regex().is_match(label)
}

fn check_subdomain(subdomain: &str) -> Result<(), InputError> {
    if is_valid_label(subdomain) {
        Ok(())
    } else {
        Err(InputError {
            field: "subdomain",
            value: subdomain.to_string(),
            reason: SUBDOMAIN_REASON.to_string(),
        })
    }
}

fn parse_port(port: &str) -> Result<u16, InputError> {
    port.trim()
        .parse::<u32>()
        .ok()
        .filter(|p| (1..=65535).contains(p))
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| InputError {
            field: "port",
            value: port.to_string(),
            reason: PORT_REASON.to_string(),
        })
}

/// Validate the arguments of an `add` command
pub fn validate_new_entry(subdomain: &str, port: &str) -> Result<NewEntry, InputErrors> {
    let subdomain_check = check_subdomain(subdomain);
    let port_check = parse_port(port);

    match (subdomain_check, port_check) {
        (Ok(()), Ok(port)) => Ok(NewEntry {
            subdomain: subdomain.to_string(),
            port,
        }),
        (subdomain_check, port_check) => Err(InputErrors(
            subdomain_check
                .err()
                .into_iter()
                .chain(port_check.err())
                .collect(),
        )),
    }
}

/// Validate the argument of a `remove` command
pub fn validate_subdomain(subdomain: &str) -> Result<(), InputErrors> {
    check_subdomain(subdomain).map_err(|e| InputErrors(vec![e]))
}

/// Validate the base domain given to `init`
pub fn validate_domain(domain: &str) -> Result<(), InputErrors> {
    let valid = !domain.is_empty()
        && domain.len() <= MAX_DOMAIN_LEN
        && domain.split('.').all(is_valid_label);

    if valid {
        Ok(())
    } else {
        Err(InputErrors(vec![InputError {
            field: "domain",
            value: domain.to_string(),
            reason: DOMAIN_REASON.to_string(),
        }]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_entry() {
        let entry = validate_new_entry("api", "3000").unwrap();
        assert_eq!(entry.subdomain, "api");
        assert_eq!(entry.port, 3000);
        assert_eq!(entry.hostname("example.com"), "api.example.com");
    }

    #[test]
    fn test_subdomain_rules() {
        assert!(validate_subdomain("a").is_ok());
        assert!(validate_subdomain("API-v2").is_ok());
        assert!(validate_subdomain(&"a".repeat(63)).is_ok());

        assert!(validate_subdomain("").is_err());
        assert!(validate_subdomain("-api").is_err());
        assert!(validate_subdomain("api-").is_err());
        assert!(validate_subdomain("api.v2").is_err());
        assert!(validate_subdomain("api_v2").is_err());
        assert!(validate_subdomain(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_port_range() {
        assert_eq!(parse_port("1").unwrap(), 1);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        assert_eq!(parse_port(" 8080 ").unwrap(), 8080);

        assert!(parse_port("0").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("-1").is_err());
        assert!(parse_port("80abc").is_err());
        assert!(parse_port("").is_err());
    }

    #[test]
    fn test_errors_are_batched() {
        let errors = validate_new_entry("-bad-", "99999").unwrap_err();

        assert_eq!(errors.len(), 2);
        assert!(errors.has_field("subdomain"));
        assert!(errors.has_field("port"));

        let text = errors.to_string();
        assert!(text.contains("Invalid subdomain: \"-bad-\""));
        assert!(text.contains("Invalid port: \"99999\""));
    }

    #[test]
    fn test_single_error() {
        let errors = validate_new_entry("ok", "nope").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors.has_field("port"));
    }

    #[test]
    fn test_domain() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("dev.example.co.uk").is_ok());
        assert!(validate_domain("localhost").is_ok());

        assert!(validate_domain("").is_err());
        assert!(validate_domain("example..com").is_err());
        assert!(validate_domain("-example.com").is_err());
        assert!(validate_domain("exa mple.com").is_err());
        assert!(validate_domain(&format!("{}.com", "a.".repeat(130))).is_err());
    }
}
