//! Routing of normalized alerts to channel ids.
//!
//! Rules are evaluated in declaration order; every matching rule contributes
//! its `send_to` channels to an order-preserving, deduplicated union. A rule
//! pattern is a regex iff it contains a regex metacharacter, otherwise it
//! must equal the label value exactly. All patterns compile at configuration
//! load, so an invalid pattern fails startup instead of a request.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

/// One entry of the `routing` configuration sequence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Rule {
    /// label key => pattern; all entries must match
    #[serde(default, rename = "match")]
    pub matches: BTreeMap<String, String>,
    /// an unconditional match
    #[serde(default)]
    pub default: bool,
    pub send_to: Vec<String>,
}

const REGEX_METACHARS: &[char] = &[
    '.', '*', '+', '?', '^', '$', '(', ')', '[', ']', '{', '}', '|', '\\',
];

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    fn compile(pattern: &str) -> Result<Self> {
        if pattern.contains(REGEX_METACHARS) {
            let regex = Regex::new(pattern)
                .with_context(|| format!("invalid routing pattern {pattern:?}"))?;
            Ok(Matcher::Pattern(regex))
        } else {
            Ok(Matcher::Exact(pattern.to_owned()))
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(expected) => expected == value,
            // search semantics; anchors only where the pattern carries them
            Matcher::Pattern(regex) => regex.is_match(value),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    default: bool,
    matchers: Vec<(String, Matcher)>,
    send_to: Vec<String>,
}

impl CompiledRule {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if self.default {
            return true;
        }
        self.matchers.iter().all(|(key, matcher)| {
            labels
                .get(key)
                .map_or(false, |value| matcher.matches(value))
        })
    }
}

/// The compiled, ordered rule table.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(rules: &[Rule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());

        for (position, rule) in rules.iter().enumerate() {
            if rule.send_to.is_empty() {
                bail!("routing rule #{} has an empty send_to list", position + 1);
            }
            let matchers = rule
                .matches
                .iter()
                .map(|(key, pattern)| Ok((key.clone(), Matcher::compile(pattern)?)))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("routing rule #{}", position + 1))?;

            compiled.push(CompiledRule {
                default: rule.default,
                matchers,
                send_to: rule.send_to.clone(),
            });
        }

        Ok(RuleSet { rules: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Channel ids for an alert's labels: union over all matching rules,
    /// declaration order preserved, duplicates dropped. Empty when nothing
    /// matched (the caller logs "unrouted").
    pub fn route(&self, labels: &BTreeMap<String, String>) -> Vec<String> {
        let mut channels: Vec<String> = Vec::new();

        for (position, rule) in self.rules.iter().enumerate() {
            if !rule.matches(labels) {
                continue;
            }
            debug!(rule = position + 1, "routing rule matched");
            for channel in &rule.send_to {
                if !channels.contains(channel) {
                    channels.push(channel.clone());
                }
            }
        }

        channels
    }
}
