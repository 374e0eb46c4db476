//! Domain-blocking rules.
//!
//! A [`Rule`] is the unit of policy: block outbound traffic to the IP
//! addresses currently associated with a domain, until some instant (or
//! forever). Rules live in the [`RuleStore`], which indexes them by id and
//! case-folded domain and keeps the non-permanent ones in an expiry-ordered
//! heap.

mod store;

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::RuleStore;

/// A single domain-blocking rule.
///
/// `permanent` and `expires` are two views of one fact: a rule is permanent
/// exactly when it has no expiry. [`Rule::new`] derives the flag so the two
/// can never disagree; the store normalizes again on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier, assigned at creation and stable across DNS refresh.
    pub id: String,
    /// Domain name to block. Uniqueness is case-insensitive.
    pub domain: String,
    /// Resolved addresses, v4 and v6 mixed. Order carries no meaning.
    pub ips: Vec<IpAddr>,
    /// When the rule expires. `None` means permanent.
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    /// Whether the rule is permanent.
    pub permanent: bool,
    /// When the domain was last resolved. `None` means never.
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Rule {
    /// Builds a rule, deriving `permanent` from the absence of `expires`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        domain: impl Into<String>,
        ips: Vec<IpAddr>,
        expires: Option<DateTime<Utc>>,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            ips,
            expires,
            permanent: expires.is_none(),
            resolved_at,
        }
    }

    /// Compares the rule's address set against `other`, ignoring order and
    /// duplicates.
    #[must_use]
    pub fn same_ips(&self, other: &[IpAddr]) -> bool {
        let ours: HashSet<&IpAddr> = self.ips.iter().collect();
        let theirs: HashSet<&IpAddr> = other.iter().collect();
        ours == theirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn new_derives_permanent_from_expiry() {
        let permanent = Rule::new("a", "example.com", vec![], None, None);
        assert!(permanent.permanent);

        let temporary = Rule::new("b", "example.com", vec![], Some(Utc::now()), None);
        assert!(!temporary.permanent);
    }

    #[test]
    fn same_ips_ignores_order() {
        let rule = Rule::new(
            "a",
            "example.com",
            vec![ip("1.2.3.4"), ip("2001:db8::1")],
            None,
            None,
        );
        assert!(rule.same_ips(&[ip("2001:db8::1"), ip("1.2.3.4")]));
        assert!(!rule.same_ips(&[ip("1.2.3.4")]));
        assert!(!rule.same_ips(&[ip("1.2.3.4"), ip("5.6.7.8")]));
    }

    #[test]
    fn wire_format_round_trips() {
        let rule = Rule::new(
            "ecceadd1-d9ca-4ec9-a906-0e3e4736a45e",
            "example.com",
            vec![ip("23.192.228.84"), ip("2600:1406:bc00:53::b81e:94ce")],
            None,
            Some(Utc::now()),
        );

        let json = serde_json::to_string(&rule).unwrap();
        let back: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);

        // Unset timestamps appear as nulls on the wire.
        assert!(json.contains("\"expires\":null"));
    }
}
