//! Rule-driven task classification.
//!
//! Rules are data, not branches: each [`CategoryRule`] is a predicate over
//! [`TaskSpec`] fields. Evaluation order is by descending specificity (the
//! number of fields a rule constrains), with ties kept in configuration
//! order. The first matching rule wins; if none match, the configured default
//! category is returned. Classification never fails.

use crate::config::store::ConfigStore;
use crate::config::CategoryRule;

use super::task::{Category, TaskSpec};

#[derive(Debug, Clone)]
struct CompiledRule {
    /// Index of the rule in configuration order.
    index: usize,
    category: Category,
    rule: CategoryRule,
}

/// Maps a [`TaskSpec`] to a [`Category`].
///
/// Immutable after construction and therefore safe to share across threads.
#[derive(Debug, Clone)]
pub struct TaskClassifier {
    rules: Vec<CompiledRule>,
    default_category: Category,
}

impl TaskClassifier {
    /// Build a classifier from the store's rules and default category.
    pub fn new(store: &ConfigStore) -> Self {
        Self::from_rules(store.rules(), store.default_category())
    }

    /// Build a classifier from an explicit rule list.
    pub fn from_rules(rules: &[CategoryRule], default_category: Category) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| CompiledRule {
                index,
                category: Category::new(rule.category.clone()),
                rule: rule.clone(),
            })
            .collect();
        // Stable: equal specificity keeps declaration order.
        compiled.sort_by(|a, b| specificity(&b.rule).cmp(&specificity(&a.rule)));

        Self {
            rules: compiled,
            default_category,
        }
    }

    /// Classify a task. Pure and infallible.
    pub fn classify(&self, task: &TaskSpec) -> Category {
        self.rules
            .iter()
            .find(|r| matches(&r.rule, task))
            .map(|r| r.category.clone())
            .unwrap_or_else(|| self.default_category.clone())
    }

    /// Configuration index of the rule that classifies `task`, or `None`
    /// when the default category applies.
    pub fn explain(&self, task: &TaskSpec) -> Option<usize> {
        self.rules
            .iter()
            .find(|r| matches(&r.rule, task))
            .map(|r| r.index)
    }

    /// The fallback category for unmatched tasks.
    pub fn default_category(&self) -> &Category {
        &self.default_category
    }
}

/// Number of predicate fields a rule constrains.
fn specificity(rule: &CategoryRule) -> usize {
    usize::from(!rule.kinds.is_empty())
        + usize::from(rule.max_latency_ms.is_some())
        + usize::from(rule.min_context_tokens.is_some())
        + usize::from(rule.max_context_tokens.is_some())
        + usize::from(rule.creative.is_some())
        + usize::from(rule.strict_quality.is_some())
}

fn matches(rule: &CategoryRule, task: &TaskSpec) -> bool {
    (rule.kinds.is_empty() || rule.kinds.contains(&task.kind))
        && rule.max_latency_ms.map_or(true, |max| task.max_latency_ms <= max)
        && rule.min_context_tokens.map_or(true, |min| task.context_tokens >= min)
        && rule.max_context_tokens.map_or(true, |max| task.context_tokens <= max)
        && rule.creative.map_or(true, |c| task.creative == c)
        && rule.strict_quality.map_or(true, |s| task.strict_quality == s)
}
