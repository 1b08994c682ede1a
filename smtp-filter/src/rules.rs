//! Compiled rule lists and the classifier.
//!
//! A [`RuleGroup`] matches when every one of its patterns is found in the
//! haystack. A [`RuleSet`] matches on its first matching group. A [`Snapshot`]
//! bundles the four rule sets with the settings that travel with them, and is
//! never modified once built.

use std::borrow::Cow;
use std::fmt;

use regex::bytes::{Regex, RegexBuilder};
use smtp::DecodedMessage;

use crate::config::{Cfg, PatternGroups};
use crate::error::FilterError;

pub const SNIPPET_LEN: usize = 64;
pub const VERBOSE_SNIPPET_LEN: usize = 1024;

#[derive(Debug)]
pub struct RuleGroup {
    patterns: Vec<Regex>,
    sources: Vec<String>,
}

impl RuleGroup {
    /// Returns the text matched by the first pattern when all patterns match.
    fn find<'h>(&self, haystack: &'h [u8]) -> Option<&'h [u8]> {
        let mut first = None;
        for pattern in &self.patterns {
            let found = pattern.find(haystack)?;
            first.get_or_insert(found.as_bytes());
        }
        first
    }

    /// The patterns as written in the configuration.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(String::as_str)
    }
}

#[derive(Debug)]
pub struct RuleSet {
    name: &'static str,
    groups: Vec<RuleGroup>,
}

impl RuleSet {
    pub fn compile(name: &'static str, groups: &PatternGroups) -> Result<Self, FilterError> {
        let groups = groups
            .iter()
            .enumerate()
            .map(|(group, patterns)| {
                if patterns.is_empty() {
                    return Err(FilterError::EmptyGroup { list: name, group });
                }
                let compiled = patterns
                    .iter()
                    .map(|pattern| {
                        RegexBuilder::new(&byte_pattern(pattern))
                            .case_insensitive(true)
                            .unicode(false)
                            .build()
                            .map_err(|source| FilterError::InvalidPattern {
                                list: name,
                                group,
                                pattern: pattern.clone(),
                                source,
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(RuleGroup {
                    patterns: compiled,
                    sources: patterns.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RuleSet { name, groups })
    }

    pub fn pattern_groups(&self) -> Vec<Vec<String>> {
        self.groups
            .iter()
            .map(|group| group.patterns().map(str::to_owned).collect())
            .collect()
    }

    fn find(&self, haystack: &[u8], snippet_len: usize) -> Option<RuleHit> {
        self.groups
            .iter()
            .enumerate()
            .find_map(|(index, group)| {
                group.find(haystack).map(|fragment| RuleHit {
                    list: self.name,
                    group: index,
                    patterns: group.patterns().map(str::to_owned).collect(),
                    fragment: snippet(fragment, snippet_len),
                })
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Pass,
    Whitelisted,
    Spam,
}

/// The rule group that decided a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    pub list: &'static str,
    pub group: usize,
    pub patterns: Vec<String>,
    pub fragment: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub classification: Classification,
    pub hit: Option<RuleHit>,
    pub message_id: Vec<u8>,
}

impl Verdict {
    pub fn is_spam(&self) -> bool {
        self.classification == Classification::Spam
    }

    pub fn log(&self, session: &str) {
        let msg_id = String::from_utf8_lossy(&self.message_id);
        match (&self.classification, &self.hit) {
            (Classification::Spam, Some(hit)) => tracing::warn!(
                session,
                %msg_id,
                list = hit.list,
                group = hit.group,
                patterns = ?hit.patterns,
                fragment = %String::from_utf8_lossy(&hit.fragment),
                "SPAM is detected"
            ),
            (Classification::Whitelisted, Some(hit)) => tracing::info!(
                session,
                %msg_id,
                list = hit.list,
                group = hit.group,
                patterns = ?hit.patterns,
                fragment = %String::from_utf8_lossy(&hit.fragment),
                "pass-white"
            ),
            _ => tracing::info!(session, %msg_id, "pass"),
        }
    }
}

/// One line summary, also written next to spam evidence.
impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg_id = String::from_utf8_lossy(&self.message_id);
        let label = match self.classification {
            Classification::Pass => "pass",
            Classification::Whitelisted => "pass-white",
            Classification::Spam => "SPAM is detected.",
        };
        write!(f, "{} msg_id={}", label, msg_id)?;
        if let Some(hit) = &self.hit {
            write!(
                f,
                " {}({}) = [ {} ] fragment={:?}",
                hit.list,
                hit.group,
                hit.patterns.join(", "),
                String::from_utf8_lossy(&hit.fragment)
            )?;
        }
        Ok(())
    }
}

/// Everything the proxy needs from one configuration load.
#[derive(Debug)]
pub struct Snapshot {
    pub version: u64,
    pub whitelist_header: RuleSet,
    pub whitelist_body: RuleSet,
    pub blacklist_header: RuleSet,
    pub blacklist_body: RuleSet,
    pub reject_code: u16,
    pub debug_level: i8,
}

impl Snapshot {
    pub fn compile(cfg: &Cfg, version: u64) -> Result<Self, FilterError> {
        let rules = &cfg.rules;
        if !(400..600).contains(&rules.reject_code) {
            return Err(FilterError::InvalidRejectCode(rules.reject_code));
        }

        Ok(Snapshot {
            version,
            whitelist_header: RuleSet::compile("whitelist_header", &rules.whitelist_header)?,
            whitelist_body: RuleSet::compile("whitelist_body", &rules.whitelist_body)?,
            blacklist_header: RuleSet::compile("blacklist_header", &rules.blacklist_header)?,
            blacklist_body: RuleSet::compile("blacklist_body", &rules.blacklist_body)?,
            reject_code: rules.reject_code,
            debug_level: rules.debug_level,
        })
    }

    /// Header rules see the block before the first empty line, body rules see
    /// the whole decoded message. Whitelists are consulted first.
    pub fn classify(&self, message: &DecodedMessage, snippet_len: usize) -> Verdict {
        let header = message.header();
        let body = &message.body[..];

        let checks = [
            (&self.whitelist_header, header, Classification::Whitelisted),
            (&self.whitelist_body, body, Classification::Whitelisted),
            (&self.blacklist_header, header, Classification::Spam),
            (&self.blacklist_body, body, Classification::Spam),
        ];

        for (set, haystack, classification) in checks {
            if let Some(hit) = set.find(haystack, snippet_len) {
                return Verdict {
                    classification,
                    hit: Some(hit),
                    message_id: message.message_id.clone(),
                };
            }
        }

        Verdict {
            classification: Classification::Pass,
            hit: None,
            message_id: message.message_id.clone(),
        }
    }

    pub fn audit_enabled(&self) -> bool {
        self.debug_level >= 0
    }
}

/// Patterns match raw bytes with ASCII-only case folding. Non-ASCII
/// characters written literally in a pattern stand for their UTF-8 bytes.
fn byte_pattern(pattern: &str) -> Cow<'_, str> {
    if pattern.is_ascii() {
        return Cow::Borrowed(pattern);
    }
    let mut escaped = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            let mut utf8 = [0u8; 4];
            for b in c.encode_utf8(&mut utf8).bytes() {
                escaped.push_str(&format!("\\x{:02X}", b));
            }
        }
    }
    Cow::Owned(escaped)
}

fn snippet(fragment: &[u8], len: usize) -> Vec<u8> {
    fragment
        .iter()
        .copied()
        .filter(|b| !matches!(b, b'\r' | b'\n'))
        .take(len)
        .collect()
}
