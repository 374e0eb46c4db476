//! PF anchor file codec.
//!
//! The anchor file is plain PF rule text. Every block managed by the daemon
//! is wrapped in a pair of delimiter comments so it can be recovered after a
//! restart:
//!
//! ```text
//! # === VOID-RULE <id> BEGIN ===
//! # Domain: example.com
//! # Expires: 2025-04-28T14:10:36-05:00
//! block return out proto tcp from any to 23.192.228.84
//! block return out proto udp from any to 23.192.228.84
//! # === VOID-RULE <id> END ===
//! ```
//!
//! The `Expires` line is present only for temporary rules. Text outside
//! delimiters is ignored on read; [`render`] always emits its own canonical
//! header. A block missing its closing `END` at end of input is dropped
//! silently so hand-edited files keep loading; structurally impossible
//! delimiter sequences (orphan END, nested BEGIN, mismatched or duplicate
//! ids) fail the whole parse.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::rules::Rule;

/// Canonical preamble written before the managed blocks.
const ANCHOR_HEADER: &str = "# void-anchor\n\
# Options\n\
set block-policy drop\n\
set fingerprints \"/etc/pf.os\"\n\
set ruleset-optimization basic\n\
set skip on lo0\n\
\n\
# void ruleset for blocking sites\n";

const RULE_MARKER: &str = "# === VOID-RULE ";
const BEGIN_SUFFIX: &str = " BEGIN ===";
const END_SUFFIX: &str = " END ===";
const DOMAIN_PREFIX: &str = "# Domain: ";
const EXPIRES_PREFIX: &str = "# Expires: ";
const BLOCK_TCP_PREFIX: &str = "block return out proto tcp from any to ";
const BLOCK_UDP_PREFIX: &str = "block return out proto udp from any to ";

/// Structural errors raised while parsing an anchor file. Each one is fatal
/// for the parse; no partial rule list is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnchorError {
    #[error("line {line}: rule terminator without a matching begin")]
    OrphanEnd { line: usize },

    #[error("line {line}: rule {open} is still open when a new block begins")]
    NestedBegin { line: usize, open: String },

    #[error("line {line}: block {begin} terminated as {end}")]
    MismatchedId {
        line: usize,
        begin: String,
        end: String,
    },

    #[error("line {line}: rule id {id} appears more than once")]
    DuplicateId { line: usize, id: String },
}

/// Parses anchor text into rules, in file order.
///
/// Tolerates CRLF line endings. Unknown lines, unparseable addresses, and an
/// unterminated trailing block are skipped; see [`AnchorError`] for what is
/// not.
pub fn parse(input: &str) -> Result<Vec<Rule>, AnchorError> {
    let mut rules = Vec::new();
    let mut completed: HashSet<String> = HashSet::new();
    let mut open: Option<OpenBlock> = None;

    for (idx, raw) in input.lines().enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        let lineno = idx + 1;

        if let Some(id) = delimiter_id(line, BEGIN_SUFFIX) {
            if let Some(block) = &open {
                return Err(AnchorError::NestedBegin {
                    line: lineno,
                    open: block.id.clone(),
                });
            }
            open = Some(OpenBlock::new(id));
            continue;
        }

        if let Some(id) = delimiter_id(line, END_SUFFIX) {
            let Some(block) = open.take() else {
                return Err(AnchorError::OrphanEnd { line: lineno });
            };
            if block.id != id {
                return Err(AnchorError::MismatchedId {
                    line: lineno,
                    begin: block.id,
                    end: id.to_string(),
                });
            }
            if !completed.insert(block.id.clone()) {
                return Err(AnchorError::DuplicateId {
                    line: lineno,
                    id: block.id,
                });
            }
            rules.push(block.into_rule());
            continue;
        }

        if let Some(block) = open.as_mut() {
            block.feed(line);
        }
    }

    // A block left open at EOF is dropped, not an error.
    Ok(rules)
}

/// Renders rules into canonical anchor text: fixed header, then one managed
/// block per rule in the given order. Rules with no addresses are skipped.
///
/// Feeding the output back through [`parse`] yields an equal rule list,
/// address order aside.
#[must_use]
pub fn render(rules: &[Rule]) -> String {
    let mut out = String::from(ANCHOR_HEADER);
    for rule in rules {
        if rule.ips.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{RULE_MARKER}{}{BEGIN_SUFFIX}", rule.id);
        let _ = writeln!(out, "{DOMAIN_PREFIX}{}", rule.domain);
        if !rule.permanent {
            if let Some(expires) = rule.expires {
                let _ = writeln!(out, "{EXPIRES_PREFIX}{}", expires.to_rfc3339());
            }
        }
        for ip in &rule.ips {
            let _ = writeln!(out, "{BLOCK_TCP_PREFIX}{ip}");
            let _ = writeln!(out, "{BLOCK_UDP_PREFIX}{ip}");
        }
        let _ = writeln!(out, "{RULE_MARKER}{}{END_SUFFIX}", rule.id);
    }
    out
}

/// Extracts the id token from a delimiter line, or `None` when the line is
/// not a well-formed delimiter of the given kind.
fn delimiter_id<'a>(line: &'a str, suffix: &str) -> Option<&'a str> {
    let id = line.strip_prefix(RULE_MARKER)?.strip_suffix(suffix)?;
    if id.is_empty() || id.contains(char::is_whitespace) {
        return None;
    }
    Some(id)
}

/// Accumulator for the block currently being parsed.
struct OpenBlock {
    id: String,
    domain: String,
    expires: Option<DateTime<Utc>>,
    ips: Vec<IpAddr>,
}

impl OpenBlock {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            domain: String::new(),
            expires: None,
            ips: Vec::new(),
        }
    }

    fn feed(&mut self, line: &str) {
        if let Some(domain) = line.strip_prefix(DOMAIN_PREFIX) {
            self.domain = domain.trim().to_string();
        } else if let Some(ts) = line.strip_prefix(EXPIRES_PREFIX) {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(ts.trim()) {
                self.expires = Some(parsed.with_timezone(&Utc));
            }
        } else if let Some(addr) = line
            .strip_prefix(BLOCK_TCP_PREFIX)
            .or_else(|| line.strip_prefix(BLOCK_UDP_PREFIX))
        {
            if let Ok(ip) = addr.trim().parse::<IpAddr>() {
                if !self.ips.contains(&ip) {
                    self.ips.push(ip);
                }
            }
        }
        // Anything else inside a block is preserved PF text we don't model.
    }

    fn into_rule(self) -> Rule {
        Rule::new(self.id, self.domain, self.ips, self.expires, None)
    }
}
