//! Row validation.
//!
//! Declarative rules cover the common field checks and run on every write
//! path. Callback validators carry arbitrary logic (and possible side
//! effects); they run only on the per-row lifecycle path, which is the path
//! callers pick when validation side effects matter.

use crate::error::{ValidationError, ValidationErrorKind};
use crate::value::Value;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

/// Thread-safe cache of compiled regex patterns.
///
/// Patterns are compiled lazily on first use and kept for the lifetime of
/// the program.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }
        let regex = Regex::new(pattern)?;
        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.insert(pattern.to_string(), regex.clone());
        }
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check if a string matches a regex pattern.
///
/// Returns `false` for an invalid pattern (logged), so validation stays
/// resilient.
#[must_use]
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}

/// A declarative field rule.
#[derive(Debug, Clone)]
pub enum Rule {
    /// The field must be present and non-NULL.
    Required { field: String },
    /// Text values must match the pattern. Non-text values are skipped.
    Pattern { field: String, pattern: String },
    /// Text length bounds.
    Length {
        field: String,
        min: Option<usize>,
        max: Option<usize>,
    },
    /// Numeric bounds.
    Range {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
}

impl Rule {
    #[must_use]
    pub fn required(field: impl Into<String>) -> Self {
        Rule::Required {
            field: field.into(),
        }
    }

    #[must_use]
    pub fn pattern(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Rule::Pattern {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    #[must_use]
    pub fn length(field: impl Into<String>, min: Option<usize>, max: Option<usize>) -> Self {
        Rule::Length {
            field: field.into(),
            min,
            max,
        }
    }

    #[must_use]
    pub fn range(field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Rule::Range {
            field: field.into(),
            min,
            max,
        }
    }

    fn check(&self, attrs: &BTreeMap<String, Value>, errors: &mut ValidationError) {
        match self {
            Rule::Required { field } => {
                let missing = attrs.get(field).is_none_or(Value::is_null);
                if missing {
                    errors.add(
                        field.clone(),
                        ValidationErrorKind::Required,
                        format!("{field} is required"),
                    );
                }
            }
            Rule::Pattern { field, pattern } => {
                if let Some(text) = attrs.get(field).and_then(Value::as_str) {
                    if !matches_pattern(text, pattern) {
                        errors.add(
                            field.clone(),
                            ValidationErrorKind::Pattern,
                            format!("{field} does not match the expected pattern"),
                        );
                    }
                }
            }
            Rule::Length { field, min, max } => {
                if let Some(text) = attrs.get(field).and_then(Value::as_str) {
                    let len = text.chars().count();
                    if let Some(min) = min {
                        if len < *min {
                            errors.add(
                                field.clone(),
                                ValidationErrorKind::MinLength,
                                format!("{field} must be at least {min} characters"),
                            );
                        }
                    }
                    if let Some(max) = max {
                        if len > *max {
                            errors.add(
                                field.clone(),
                                ValidationErrorKind::MaxLength,
                                format!("{field} must be at most {max} characters"),
                            );
                        }
                    }
                }
            }
            Rule::Range { field, min, max } => {
                if let Some(n) = attrs.get(field).and_then(Value::as_f64) {
                    if let Some(min) = min {
                        if n < *min {
                            errors.add(
                                field.clone(),
                                ValidationErrorKind::Min,
                                format!("{field} must be at least {min}"),
                            );
                        }
                    }
                    if let Some(max) = max {
                        if n > *max {
                            errors.add(
                                field.clone(),
                                ValidationErrorKind::Max,
                                format!("{field} must be at most {max}"),
                            );
                        }
                    }
                }
            }
        }
    }
}

/// A callback validator over a full attribute map.
pub type CheckFn =
    Arc<dyn Fn(&BTreeMap<String, Value>) -> Result<(), ValidationError> + Send + Sync>;

/// Declared rules plus callback validators for one table.
#[derive(Clone, Default)]
pub struct Validator {
    rules: Vec<Rule>,
    checks: Vec<CheckFn>,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("rules", &self.rules)
            .field("checks", &self.checks.len())
            .finish()
    }
}

impl Validator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn check(mut self, check: CheckFn) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.checks.is_empty()
    }

    /// Run only the declarative rules, aggregating the first error per
    /// failing field.
    pub fn validate_rules(&self, attrs: &BTreeMap<String, Value>) -> Result<(), ValidationError> {
        let mut errors = ValidationError::new();
        for rule in &self.rules {
            rule.check(attrs, &mut errors);
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Run rules and callback validators.
    pub fn validate_full(&self, attrs: &BTreeMap<String, Value>) -> Result<(), ValidationError> {
        let mut errors = ValidationError::new();
        for rule in &self.rules {
            rule.check(attrs, &mut errors);
        }
        for check in &self.checks {
            if let Err(more) = check(attrs) {
                errors.merge(more);
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
