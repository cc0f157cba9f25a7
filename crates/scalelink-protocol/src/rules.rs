//! [`RuleSet`] – ordered pattern rules over free-text device replies.
//!
//! Indicator firmware is loose about reply formats.  Instead of a chain of
//! `if line.contains(..)` checks, each recognised shape is a named [`Rule`]
//! and the first rule that matches wins.  Supporting a new firmware quirk
//! means inserting one rule at the right position.

use std::fmt;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// One recognised reply shape.
pub trait Rule<T>: Send + Sync {
    /// Short name, used in logs and for positional inserts.
    fn name(&self) -> &str;

    /// `Some` when `input` has this rule's shape.
    fn apply(&self, input: &str) -> Option<T>;
}

/// A [`Rule`] backed by a closure.
pub struct FnRule<F> {
    name: &'static str,
    matcher: F,
}

impl<F> FnRule<F> {
    pub fn new(name: &'static str, matcher: F) -> Self {
        Self { name, matcher }
    }
}

impl<T, F> Rule<T> for FnRule<F>
where
    F: Fn(&str) -> Option<T> + Send + Sync,
{
    fn name(&self) -> &str {
        self.name
    }

    fn apply(&self, input: &str) -> Option<T> {
        (self.matcher)(input)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RuleSet
// ────────────────────────────────────────────────────────────────────────────

/// Result of [`RuleSet::evaluate`]: the winning rule's name and output.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch<T> {
    pub rule: String,
    pub value: T,
}

/// Ordered collection of [`Rule`]s; evaluation stops at the first match.
///
/// # Example
///
/// ```
/// use scalelink_protocol::rules::RuleSet;
///
/// let rules = RuleSet::new()
///     .with("ack", |s: &str| (s == "^").then_some("ack"))
///     .with("any", |_: &str| Some("other"));
///
/// assert_eq!(rules.evaluate("^").map(|m| m.value), Some("ack"));
/// assert_eq!(rules.evaluate("[1]").map(|m| m.rule), Some("any".to_string()));
/// ```
pub struct RuleSet<T> {
    rules: Vec<Box<dyn Rule<T>>>,
}

impl<T> Default for RuleSet<T> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<T: 'static> RuleSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`RuleSet::add_rule`] for closure rules.
    pub fn with<F>(mut self, name: &'static str, matcher: F) -> Self
    where
        F: Fn(&str) -> Option<T> + Send + Sync + 'static,
    {
        self.add_rule(Box::new(FnRule::new(name, matcher)));
        self
    }

    /// Append a rule; it is tried after every existing rule.
    pub fn add_rule(&mut self, rule: Box<dyn Rule<T>>) {
        self.rules.push(rule);
    }

    /// Insert `rule` right before the rule named `before`.
    ///
    /// Falls back to appending when no such rule exists; returns whether the
    /// named rule was found.
    pub fn insert_before(&mut self, before: &str, rule: Box<dyn Rule<T>>) -> bool {
        match self.rules.iter().position(|r| r.name() == before) {
            Some(idx) => {
                self.rules.insert(idx, rule);
                true
            }
            None => {
                self.rules.push(rule);
                false
            }
        }
    }

    /// Run the rules in order and return the first match.
    pub fn evaluate(&self, input: &str) -> Option<RuleMatch<T>> {
        self.rules.iter().find_map(|rule| {
            rule.apply(input).map(|value| RuleMatch {
                rule: rule.name().to_string(),
                value,
            })
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<T> fmt::Debug for RuleSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| r.name()))
            .finish()
    }
}
