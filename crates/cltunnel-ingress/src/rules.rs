//! Ordered ingress rule collection
//!
//! cloudflared evaluates ingress rules top to bottom and requires the
//! catch-all rule(s) to come last. Every mutation here goes through
//! [`RuleSet::normalize`], which sorts hostname rules case-insensitively ahead
//! of catch-all rules and collapses duplicate hostnames to the most recently
//! inserted rule.

use std::cmp::Ordering;
use tracing::debug;

use crate::document::{hostname_key, IngressRule};
use crate::error::RuleSetError;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleSet {
    rules: Vec<IngressRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IngressRule> {
        self.rules.iter()
    }

    pub fn as_slice(&self) -> &[IngressRule] {
        &self.rules
    }

    pub fn into_vec(self) -> Vec<IngressRule> {
        self.rules
    }

    pub fn contains_host(&self, hostname: &str) -> bool {
        self.find(hostname).is_some()
    }

    pub fn find(&self, hostname: &str) -> Option<&IngressRule> {
        self.rules.iter().find(|r| r.matches_host(hostname))
    }

    /// Add a rule, refusing to replace an existing hostname unless `allow_overwrite`
    pub fn add(&self, rule: IngressRule, allow_overwrite: bool) -> Result<Self, RuleSetError> {
        if let Some(hostname) = rule.hostname.as_deref() {
            if self.contains_host(hostname) {
                if !allow_overwrite {
                    return Err(RuleSetError::Conflict {
                        hostname: hostname.to_string(),
                    });
                }
                debug!(hostname = %hostname, "Overwriting existing ingress rule");
            }
        }

        let mut rules = self.rules.clone();
        rules.push(rule);
        Ok(Self { rules }.normalize())
    }

    /// Remove every rule for `hostname`
    pub fn remove(&self, hostname: &str) -> Result<Self, RuleSetError> {
        let rules: Vec<_> = self
            .rules
            .iter()
            .filter(|r| !r.matches_host(hostname))
            .cloned()
            .collect();

        if rules.len() == self.rules.len() {
            return Err(RuleSetError::NotFound {
                hostname: hostname.to_string(),
            });
        }

        Ok(Self { rules }.normalize())
    }

    /// Sort and dedup
    ///
    /// Hostname rules first, by case-insensitive hostname; catch-all rules
    /// last in their original relative order. For duplicate hostnames the
    /// last one in insertion order survives. Catch-all rules are never
    /// deduplicated.
    pub fn normalize(&self) -> Self {
        let mut sorted = self.rules.clone();
        // stable: equal hostnames stay in insertion order
        sorted.sort_by(compare_rules);

        let mut rules: Vec<IngressRule> = Vec::with_capacity(sorted.len());
        for rule in sorted {
            let duplicate = match (rules.last().and_then(IngressRule::key), rule.key()) {
                (Some(prev), Some(key)) => prev == key,
                _ => false,
            };
            if duplicate {
                // later insertion wins
                rules.pop();
            }
            rules.push(rule);
        }

        Self { rules }
    }
}

fn compare_rules(a: &IngressRule, b: &IngressRule) -> Ordering {
    match (&a.hostname, &b.hostname) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => hostname_key(a).cmp(&hostname_key(b)),
    }
}

impl From<Vec<IngressRule>> for RuleSet {
    fn from(rules: Vec<IngressRule>) -> Self {
        Self { rules }
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a IngressRule;
    type IntoIter = std::slice::Iter<'a, IngressRule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ServiceTarget;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn host(name: &str, port: u16) -> IngressRule {
        IngressRule::for_host(name, ServiceTarget::local_port(port))
    }

    fn catch_all(status: &str) -> IngressRule {
        IngressRule::catch_all(ServiceTarget::HttpStatus(format!("http_status:{}", status)))
    }

    fn hostnames(set: &RuleSet) -> Vec<Option<&str>> {
        set.iter().map(|r| r.hostname.as_deref()).collect()
    }

    #[test]
    fn test_add_sorts_before_catch_all() {
        let set = RuleSet::from(vec![host("b.example.com", 2), catch_all("404")]);
        let set = set.add(host("a.example.com", 1), false).unwrap();

        assert_eq!(
            hostnames(&set),
            vec![Some("a.example.com"), Some("b.example.com"), None]
        );
    }

    #[test]
    fn test_add_conflict_without_overwrite() {
        let set = RuleSet::from(vec![host("api.example.com", 3000)]);
        let err = set.add(host("api.example.com", 4000), false).unwrap_err();
        assert_eq!(
            err,
            RuleSetError::Conflict {
                hostname: "api.example.com".to_string()
            }
        );
    }

    #[test]
    fn test_add_conflict_is_case_insensitive() {
        let set = RuleSet::from(vec![host("API.example.com", 3000)]);
        assert!(set.add(host("api.example.com", 4000), false).is_err());
    }

    #[test]
    fn test_add_overwrite_keeps_new_target() {
        let set = RuleSet::from(vec![host("api.example.com", 3000), catch_all("404")]);
        let set = set.add(host("api.example.com", 4000), true).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(
            set.find("api.example.com").unwrap().service,
            ServiceTarget::local_port(4000)
        );
    }

    #[test]
    fn test_catch_all_can_be_added_repeatedly() {
        let set = RuleSet::new()
            .add(catch_all("404"), false)
            .unwrap()
            .add(catch_all("503"), false)
            .unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_remove() {
        let set = RuleSet::from(vec![
            host("a.example.com", 1),
            host("b.example.com", 2),
            catch_all("404"),
        ]);
        let set = set.remove("a.example.com").unwrap();
        assert_eq!(hostnames(&set), vec![Some("b.example.com"), None]);
    }

    #[test]
    fn test_remove_not_found() {
        let set = RuleSet::from(vec![host("a.example.com", 1)]);
        let err = set.remove("ghost.example.com").unwrap_err();
        assert_eq!(
            err,
            RuleSetError::NotFound {
                hostname: "ghost.example.com".to_string()
            }
        );
    }

    #[test]
    fn test_normalize_keeps_last_duplicate() {
        let set = RuleSet::from(vec![
            host("dup.example.com", 1),
            catch_all("404"),
            host("dup.example.com", 2),
            host("DUP.example.com", 3),
        ]);
        let set = set.normalize();

        assert_eq!(set.len(), 2);
        assert_eq!(set.as_slice()[0].service, ServiceTarget::local_port(3));
        assert!(set.as_slice()[1].hostname.is_none());
    }

    #[test]
    fn test_normalize_catch_all_order_preserved() {
        let set = RuleSet::from(vec![
            catch_all("404"),
            host("z.example.com", 1),
            catch_all("503"),
        ])
        .normalize();

        let services: Vec<_> = set.iter().map(|r| r.service.as_str()).collect();
        assert_eq!(
            services,
            vec!["http://localhost:1", "http_status:404", "http_status:503"]
        );
    }

    fn arb_rule() -> impl Strategy<Value = IngressRule> {
        let hostname = prop::option::weighted(
            0.8,
            prop::sample::select(vec![
                "a.example.com",
                "A.example.com",
                "b.example.com",
                "api.example.com",
                "z.example.com",
            ]),
        );
        (hostname, 1u16..100).prop_map(|(h, port)| {
            IngressRule::new(h.map(str::to_string), ServiceTarget::local_port(port))
        })
    }

    proptest! {
        #[test]
        fn prop_normalize_idempotent(rules in prop::collection::vec(arb_rule(), 0..20)) {
            let once = RuleSet::from(rules).normalize();
            prop_assert_eq!(once.normalize(), once);
        }

        #[test]
        fn prop_catch_all_never_precedes_hostname(rules in prop::collection::vec(arb_rule(), 0..20)) {
            let set = RuleSet::from(rules).normalize();
            let first_catch_all = set.iter().position(|r| r.hostname.is_none());
            if let Some(idx) = first_catch_all {
                prop_assert!(set.as_slice()[idx..].iter().all(|r| r.hostname.is_none()));
            }
        }

        #[test]
        fn prop_one_rule_per_hostname_last_wins(rules in prop::collection::vec(arb_rule(), 0..20)) {
            let set = RuleSet::from(rules.clone()).normalize();

            let keys: Vec<_> = set.iter().filter_map(IngressRule::key).collect();
            let distinct: HashSet<_> = rules.iter().filter_map(IngressRule::key).collect();
            prop_assert_eq!(keys.len(), distinct.len());

            for rule in set.iter().filter(|r| r.hostname.is_some()) {
                let last = rules.iter().rev().find(|r| r.key() == rule.key()).unwrap();
                prop_assert_eq!(&rule.service, &last.service);
            }

            let catch_alls = rules.iter().filter(|r| r.hostname.is_none()).count();
            prop_assert_eq!(set.len(), distinct.len() + catch_alls);
        }
    }
}
