//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RouterConfig`] that cannot
//! be expressed through the type system alone (cap ordering, dangling
//! channel references, duplicate ids).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;

use super::{CategoryRule, RouterConfig};
use crate::telemetry::MAX_CAPACITY;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "channels[0].hard_cap_usd").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// A task was classified into a category with no configured chain.
    #[error("Unknown category '{0}'")]
    UnknownCategory(String),

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: String, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Validate all semantic constraints on a [`RouterConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &RouterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Router section ───────────────────────────────────────────────
    if config.router.name.trim().is_empty() {
        errors.push(invalid(
            "router.name".into(),
            "",
            "router name must not be empty",
        ));
    }

    if config.router.telemetry_capacity == 0 {
        errors.push(invalid(
            "router.telemetry_capacity".into(),
            0,
            "must be at least 1",
        ));
    } else if config.router.telemetry_capacity > MAX_CAPACITY {
        errors.push(invalid(
            "router.telemetry_capacity".into(),
            config.router.telemetry_capacity,
            "must be at most 1048576",
        ));
    }

    // ── Breaker defaults ─────────────────────────────────────────────
    if config.breaker.failure_threshold == 0 {
        errors.push(invalid(
            "breaker.failure_threshold".into(),
            0,
            "must be at least 1",
        ));
    }

    if config.breaker.cooldown_s == 0 {
        errors.push(invalid(
            "breaker.cooldown_s".into(),
            0,
            "must be at least 1 second",
        ));
    }

    // ── Channels ─────────────────────────────────────────────────────
    if config.channels.is_empty() {
        errors.push(invalid(
            "channels".into(),
            "[]",
            "at least one channel is required",
        ));
    }

    let mut channel_ids = HashSet::new();
    for (i, ch) in config.channels.iter().enumerate() {
        if ch.id.trim().is_empty() {
            errors.push(invalid(
                format!("channels[{i}].id"),
                "",
                "channel id must not be empty",
            ));
        } else if !channel_ids.insert(ch.id.as_str()) {
            errors.push(invalid(
                format!("channels[{i}].id"),
                &ch.id,
                "duplicate channel id",
            ));
        }

        if !(ch.cost_per_1k_tokens >= 0.0) {
            errors.push(invalid(
                format!("channels[{i}].cost_per_1k_tokens"),
                ch.cost_per_1k_tokens,
                "must be >= 0",
            ));
        }

        if !(ch.soft_cap_usd >= 0.0) {
            errors.push(invalid(
                format!("channels[{i}].soft_cap_usd"),
                ch.soft_cap_usd,
                "must be >= 0",
            ));
        }

        if !(ch.hard_cap_usd >= 0.0) {
            errors.push(invalid(
                format!("channels[{i}].hard_cap_usd"),
                ch.hard_cap_usd,
                "must be >= 0",
            ));
        }

        if ch.soft_cap_usd > ch.hard_cap_usd {
            errors.push(invalid(
                format!("channels[{i}].soft_cap_usd"),
                ch.soft_cap_usd,
                "must be \u{2264} hard_cap_usd",
            ));
        }

        if ch.failure_threshold == Some(0) {
            errors.push(invalid(
                format!("channels[{i}].failure_threshold"),
                0,
                "must be at least 1",
            ));
        }

        if ch.cooldown_s == Some(0) {
            errors.push(invalid(
                format!("channels[{i}].cooldown_s"),
                0,
                "must be at least 1 second",
            ));
        }
    }

    // ── Categories ───────────────────────────────────────────────────
    let mut category_names = HashSet::new();
    for (i, cat) in config.categories.iter().enumerate() {
        if cat.name.trim().is_empty() {
            errors.push(invalid(
                format!("categories[{i}].name"),
                "",
                "category name must not be empty",
            ));
        } else if !category_names.insert(cat.name.as_str()) {
            errors.push(invalid(
                format!("categories[{i}].name"),
                &cat.name,
                "duplicate category name",
            ));
        }

        if cat.chain.is_empty() {
            errors.push(invalid(
                format!("categories[{i}].chain"),
                "[]",
                "chain must name at least one channel",
            ));
        }

        let mut seen = HashSet::new();
        for (j, id) in cat.chain.iter().enumerate() {
            if !channel_ids.contains(id.as_str()) {
                errors.push(invalid(
                    format!("categories[{i}].chain[{j}]"),
                    id,
                    "unknown channel id",
                ));
            }
            if !seen.insert(id.as_str()) {
                errors.push(invalid(
                    format!("categories[{i}].chain[{j}]"),
                    id,
                    "channel appears twice in the same chain",
                ));
            }
        }
    }

    if !category_names.contains(config.router.default_category.as_str()) {
        errors.push(invalid(
            "router.default_category".into(),
            &config.router.default_category,
            "must name a configured category",
        ));
    }

    // ── Rules ────────────────────────────────────────────────────────
    for (i, rule) in config.rules.iter().enumerate() {
        validate_rule(i, rule, &category_names, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Run [`validate`] and fold every violation into one
/// [`ConfigError::Validation`], one violation per line.
pub fn validate_all(config: &RouterConfig) -> Result<(), ConfigError> {
    validate(config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })
}

fn validate_rule(
    index: usize,
    rule: &CategoryRule,
    categories: &HashSet<&str>,
    errors: &mut Vec<ConfigError>,
) {
    if !categories.contains(rule.category.as_str()) {
        errors.push(invalid(
            format!("rules[{index}].category"),
            &rule.category,
            "must name a configured category",
        ));
    }

    if let (Some(min), Some(max)) = (rule.min_context_tokens, rule.max_context_tokens) {
        if min > max {
            errors.push(invalid(
                format!("rules[{index}].min_context_tokens"),
                min,
                "must be \u{2264} max_context_tokens",
            ));
        }
    }
}
