//! In-memory rule store with expiry-ordered retrieval.
//!
//! The store keeps three views of the same rule set:
//!
//! - `by_id`: id → rule, the owning map
//! - `by_domain`: case-folded domain → id, the uniqueness authority
//! - an expiry min-heap over (expires, id) with a position index, so that
//!   removing or re-keying an arbitrary entry is O(log n)
//!
//! Permanent rules are deliberately absent from the heap rather than encoded
//! with a sentinel timestamp. After every mutating operation the heap holds
//! exactly the non-permanent rules, ordered by expiry.
//!
//! All operations take a single readers-writer lock; snapshots are value
//! copies so callers can never alias internal storage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::Rule;

/// Thread-safe rule index. See the module docs for the internal layout.
#[derive(Debug, Default)]
pub struct RuleStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<String, Rule>,
    /// Lowercased FQDN → rule id.
    by_domain: HashMap<String, String>,
    heap: Vec<HeapSlot>,
    /// Rule id → index into `heap`.
    heap_pos: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
struct HeapSlot {
    expires: DateTime<Utc>,
    id: String,
}

impl RuleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates a rule. Returns whether observable state changed
    /// (currently always true for accepted rules).
    ///
    /// A rule for a known domain never allocates a new record: the existing
    /// record keeps its id. A permanent incoming rule upgrades a temporary
    /// record in place (expiry cleared, heap entry dropped). A permanent
    /// record never downgrades; an incoming expiry on one is ignored.
    pub fn upsert(&self, rule: Rule) -> bool {
        let rule = normalize(rule);
        let mut inner = self.inner.write();
        let domain_key = rule.domain.to_lowercase();

        if let Some(id) = inner.by_domain.get(&domain_key).cloned() {
            let (drop_heap_entry, refreshed_expiry) = {
                let Some(current) = inner.by_id.get_mut(&id) else {
                    return false;
                };
                if !current.permanent && rule.permanent {
                    current.permanent = true;
                    current.expires = None;
                    (true, None)
                } else {
                    current.ips = rule.ips;
                    current.resolved_at = rule.resolved_at;
                    if current.permanent {
                        (false, None)
                    } else {
                        current.expires = rule.expires;
                        (false, current.expires)
                    }
                }
            };
            if drop_heap_entry {
                inner.heap_remove(&id);
            } else if let Some(expires) = refreshed_expiry {
                inner.heap_fix(&id, expires);
            }
            return true;
        }

        let id = rule.id.clone();
        inner.by_domain.insert(domain_key, id.clone());
        if let Some(expires) = rule.expires {
            inner.heap_push(id.clone(), expires);
        }
        inner.by_id.insert(id, rule);
        true
    }

    /// Updates the last-resolution timestamp for `id`. The expiry key is
    /// untouched, so the heap needs no fix.
    pub fn update_resolved_at(&self, id: &str, ts: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write();
        let Some(current) = inner.by_id.get_mut(id) else {
            return false;
        };
        current.resolved_at = Some(ts);
        true
    }

    /// Removes a rule by id, returning it for logging and the PF diff.
    pub fn remove(&self, id: &str) -> Option<Rule> {
        let mut inner = self.inner.write();
        let rule = inner.by_id.remove(id)?;
        inner.by_domain.remove(&rule.domain.to_lowercase());
        if !rule.permanent {
            inner.heap_remove(id);
        }
        Some(rule)
    }

    /// Pops every rule whose expiry is at or before `now`, in ascending
    /// expiry order. Popped rules are gone from all indexes.
    pub fn expire_now(&self, now: DateTime<Utc>) -> Vec<Rule> {
        let mut inner = self.inner.write();
        let mut expired = Vec::new();
        while let Some(root) = inner.heap.first() {
            if root.expires > now {
                break;
            }
            let id = root.id.clone();
            inner.heap_remove(&id);
            if let Some(rule) = inner.by_id.remove(&id) {
                inner.by_domain.remove(&rule.domain.to_lowercase());
                expired.push(rule);
            }
        }
        expired
    }

    /// The soonest expiry across all temporary rules, if any.
    #[must_use]
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.inner.read().heap.first().map(|slot| slot.expires)
    }

    /// A value copy of the current rule set. Order is unspecified.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Rule> {
        self.inner.read().by_id.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    /// Asserts the structural invariants the store maintains after every
    /// mutation. Test-only; used by the property harness after each step.
    #[cfg(test)]
    fn assert_invariants(&self) {
        let inner = self.inner.read();

        let temporary = inner.by_id.values().filter(|r| !r.permanent).count();
        assert_eq!(inner.heap.len(), temporary, "heap size vs temporary rules");
        assert_eq!(inner.heap.len(), inner.heap_pos.len());
        assert_eq!(inner.by_id.len(), inner.by_domain.len());

        for (idx, slot) in inner.heap.iter().enumerate() {
            assert_eq!(inner.heap_pos.get(&slot.id), Some(&idx), "position index");
            let rule = inner.by_id.get(&slot.id).expect("heap entry has a rule");
            assert_eq!(rule.expires, Some(slot.expires));
            if idx > 0 {
                let parent = &inner.heap[(idx - 1) / 2];
                assert!(parent.expires <= slot.expires, "min-heap order");
            }
        }

        for (domain, id) in &inner.by_domain {
            let rule = inner.by_id.get(id).expect("domain entry has a rule");
            assert_eq!(&rule.domain.to_lowercase(), domain);
        }
    }
}

/// Converges a rule onto the permanent ⇔ no-expiry invariant before it
/// enters the indexes. The permanent flag wins over a stray expiry.
fn normalize(mut rule: Rule) -> Rule {
    if rule.permanent {
        rule.expires = None;
    } else if rule.expires.is_none() {
        rule.permanent = true;
    }
    rule
}

impl Inner {
    fn heap_push(&mut self, id: String, expires: DateTime<Utc>) {
        let idx = self.heap.len();
        self.heap.push(HeapSlot {
            expires,
            id: id.clone(),
        });
        self.heap_pos.insert(id, idx);
        self.sift_up(idx);
    }

    fn heap_remove(&mut self, id: &str) {
        let Some(idx) = self.heap_pos.remove(id) else {
            return;
        };
        let last = self.heap.len() - 1;
        self.heap.swap(idx, last);
        self.heap.pop();
        if idx < self.heap.len() {
            self.heap_pos.insert(self.heap[idx].id.clone(), idx);
            self.heap_fix_at(idx);
        }
    }

    fn heap_fix(&mut self, id: &str, expires: DateTime<Utc>) {
        if let Some(&idx) = self.heap_pos.get(id) {
            self.heap[idx].expires = expires;
            self.heap_fix_at(idx);
        }
    }

    fn heap_fix_at(&mut self, idx: usize) {
        if !self.sift_up(idx) {
            self.sift_down(idx);
        }
    }

    fn sift_up(&mut self, mut idx: usize) -> bool {
        let mut moved = false;
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[idx].expires >= self.heap[parent].expires {
                break;
            }
            self.swap_slots(idx, parent);
            idx = parent;
            moved = true;
        }
        moved
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < self.heap.len() && self.heap[left].expires < self.heap[smallest].expires {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].expires < self.heap[smallest].expires {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap_slots(idx, smallest);
            idx = smallest;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.heap_pos.insert(self.heap[a].id.clone(), a);
        self.heap_pos.insert(self.heap[b].id.clone(), b);
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use chrono::Duration;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn temp_rule(id: &str, domain: &str, expires_in_secs: i64) -> Rule {
        Rule::new(
            id,
            domain,
            vec![ip("1.2.3.4")],
            Some(Utc::now() + Duration::seconds(expires_in_secs)),
            Some(Utc::now()),
        )
    }

    fn perm_rule(id: &str, domain: &str) -> Rule {
        Rule::new(id, domain, vec![ip("1.2.3.4")], None, Some(Utc::now()))
    }

    #[test]
    fn upsert_inserts_new_rule() {
        let store = RuleStore::new();
        assert!(store.upsert(temp_rule("a", "example.com", 60)));
        assert_eq!(store.len(), 1);
        store.assert_invariants();
    }

    #[test]
    fn upsert_same_domain_keeps_existing_id() {
        let store = RuleStore::new();
        store.upsert(temp_rule("a", "example.com", 60));
        store.upsert(temp_rule("b", "example.com", 120));

        assert_eq!(store.len(), 1);
        let rules = store.snapshot();
        assert_eq!(rules[0].id, "a");
        store.assert_invariants();
    }

    #[test]
    fn upsert_domain_uniqueness_is_case_insensitive() {
        let store = RuleStore::new();
        store.upsert(temp_rule("a", "Example.COM", 60));
        store.upsert(temp_rule("b", "example.com", 60));
        assert_eq!(store.len(), 1);
        store.assert_invariants();
    }

    #[test]
    fn upsert_upgrades_temporary_to_permanent() {
        let store = RuleStore::new();
        store.upsert(temp_rule("a", "example.com", 60));
        store.upsert(perm_rule("b", "example.com"));

        let rules = store.snapshot();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "a");
        assert!(rules[0].permanent);
        assert!(rules[0].expires.is_none());
        assert_eq!(store.next_expiry(), None);
        store.assert_invariants();
    }

    #[test]
    fn upsert_never_downgrades_permanent() {
        let store = RuleStore::new();
        store.upsert(perm_rule("a", "example.com"));
        store.upsert(temp_rule("b", "example.com", 60));

        let rules = store.snapshot();
        assert!(rules[0].permanent);
        assert!(rules[0].expires.is_none());
        assert_eq!(store.next_expiry(), None);
        store.assert_invariants();
    }

    #[test]
    fn upsert_permanent_over_permanent_only_refreshes_addresses() {
        let store = RuleStore::new();
        store.upsert(perm_rule("a", "example.com"));

        let refreshed_at = Utc::now() + Duration::seconds(5);
        store.upsert(Rule::new(
            "b",
            "example.com",
            vec![ip("9.9.9.9")],
            None,
            Some(refreshed_at),
        ));

        let rules = store.snapshot();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "a");
        assert!(rules[0].permanent);
        assert_eq!(rules[0].ips, vec![ip("9.9.9.9")]);
        assert_eq!(rules[0].resolved_at, Some(refreshed_at));
        store.assert_invariants();
    }

    #[test]
    fn upsert_updates_expiry_and_reorders_heap() {
        let store = RuleStore::new();
        store.upsert(temp_rule("a", "a.com", 60));
        store.upsert(temp_rule("b", "b.com", 120));

        // Push a.com far into the future; b.com becomes the next expiry.
        store.upsert(temp_rule("x", "a.com", 600));
        let next = store.next_expiry().unwrap();
        let b_expiry = store
            .snapshot()
            .into_iter()
            .find(|r| r.domain == "b.com")
            .unwrap()
            .expires
            .unwrap();
        assert_eq!(next, b_expiry);
        store.assert_invariants();
    }

    #[test]
    fn remove_deletes_from_all_indexes() {
        let store = RuleStore::new();
        store.upsert(temp_rule("a", "example.com", 60));

        let removed = store.remove("a").unwrap();
        assert_eq!(removed.domain, "example.com");
        assert!(store.is_empty());
        assert_eq!(store.next_expiry(), None);
        assert!(store.remove("a").is_none());
        store.assert_invariants();
    }

    #[test]
    fn expire_now_pops_in_ascending_order() {
        let store = RuleStore::new();
        store.upsert(temp_rule("c", "c.com", -10));
        store.upsert(temp_rule("a", "a.com", -30));
        store.upsert(temp_rule("b", "b.com", -20));
        store.upsert(temp_rule("d", "d.com", 600));
        store.upsert(perm_rule("e", "e.com"));

        let expired = store.expire_now(Utc::now());
        let ids: Vec<_> = expired.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(store.len(), 2);
        store.assert_invariants();
    }

    #[test]
    fn expire_now_is_monotonic() {
        let store = RuleStore::new();
        store.upsert(temp_rule("a", "a.com", -10));

        let t1 = Utc::now();
        let first = store.expire_now(t1);
        assert_eq!(first.len(), 1);

        let second = store.expire_now(t1 + Duration::seconds(60));
        assert!(second.is_empty());
        store.assert_invariants();
    }

    #[test]
    fn snapshot_is_a_value_copy() {
        let store = RuleStore::new();
        store.upsert(temp_rule("a", "example.com", 60));

        let mut snap = store.snapshot();
        snap[0].domain = "mutated.example".to_string();

        assert_eq!(store.snapshot()[0].domain, "example.com");
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        /// `key` stands for one domain and its stable rule id together, the
        /// way the engine pairs them (ids are never reused across domains).
        #[derive(Debug, Clone)]
        enum Op {
            Upsert {
                key: u8,
                expires_in: Option<i64>,
            },
            Remove {
                key: u8,
            },
            Expire {
                advance: i64,
            },
            UpdateResolved {
                key: u8,
            },
        }

        fn arb_op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..8, proptest::option::of(-100i64..100))
                    .prop_map(|(key, expires_in)| Op::Upsert { key, expires_in }),
                (0u8..8).prop_map(|key| Op::Remove { key }),
                (0i64..200).prop_map(|advance| Op::Expire { advance }),
                (0u8..8).prop_map(|key| Op::UpdateResolved { key }),
            ]
        }

        proptest! {
            #[test]
            fn store_invariants_hold_under_any_op_sequence(ops in proptest::collection::vec(arb_op(), 1..60)) {
                let store = RuleStore::new();
                let base = Utc::now();

                for op in ops {
                    match op {
                        Op::Upsert { key, expires_in } => {
                            let expires = expires_in.map(|s| base + Duration::seconds(s));
                            store.upsert(Rule::new(
                                format!("id-{key}"),
                                format!("domain-{key}.example"),
                                vec!["1.2.3.4".parse().unwrap()],
                                expires,
                                None,
                            ));
                        }
                        Op::Remove { key } => {
                            store.remove(&format!("id-{key}"));
                        }
                        Op::Expire { advance } => {
                            let expired = store.expire_now(base + Duration::seconds(advance));
                            let mut last = None;
                            for rule in &expired {
                                let expiry = rule.expires.unwrap();
                                if let Some(prev) = last {
                                    prop_assert!(expiry >= prev, "ascending expiry order");
                                }
                                last = Some(expiry);
                            }
                        }
                        Op::UpdateResolved { key } => {
                            store.update_resolved_at(&format!("id-{key}"), base);
                        }
                    }
                    store.assert_invariants();
                }
            }
        }
    }
}
