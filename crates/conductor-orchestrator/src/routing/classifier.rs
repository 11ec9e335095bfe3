//! Rule-based intent classification.
//!
//! Each rule scores an input by keyword hits plus extracted parameters. The
//! score maps to a confidence in `[0, 1)` via `1 - e^(-score)`. Rules are
//! evaluated in declaration order and the earlier rule wins a tie, so the
//! same input always yields the same intent.

use crate::error::{OrchestrationError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::debug;

/// Reserved category for inputs no rule is confident about.
pub const UNKNOWN_CATEGORY: &str = "unknown";

/// Default minimum confidence for a non-`unknown` intent.
pub const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.6;

/// Weight of an extracted parameter relative to one keyword hit.
const PARAM_WEIGHT: f64 = 0.5;

/// Classified intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Category, or [`UNKNOWN_CATEGORY`].
    pub category: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Parameters pulled out of the input.
    pub params: BTreeMap<String, String>,
}

impl Intent {
    /// `true` for the reserved `unknown` category.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.category == UNKNOWN_CATEGORY
    }
}

/// One classification rule as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRule {
    /// Category this rule assigns.
    pub category: String,
    /// Words or phrases that count as hits, matched case-insensitively on word boundaries.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Parameter name to regex. The first capture group is extracted, or the
    /// whole match when the pattern has none.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl IntentRule {
    /// Creates a rule with no keywords or parameters.
    #[must_use]
    pub fn new(category: impl Into<String>) -> Self {
        Self { category: category.into(), keywords: Vec::new(), params: BTreeMap::new() }
    }

    /// Adds keywords.
    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    /// Adds a parameter pattern.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.params.insert(name.into(), pattern.into());
        self
    }
}

/// Classifier settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Minimum confidence for a non-`unknown` intent.
    #[serde(default = "default_floor")]
    pub confidence_floor: f64,
    /// Rules in evaluation order.
    #[serde(default)]
    pub intents: Vec<IntentRule>,
}

fn default_floor() -> f64 {
    DEFAULT_CONFIDENCE_FLOOR
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { confidence_floor: DEFAULT_CONFIDENCE_FLOOR, intents: default_intents() }
    }
}

/// The built-in intent set.
#[must_use]
pub fn default_intents() -> Vec<IntentRule> {
    vec![
        IntentRule::new("inventory_query")
            .with_keywords(["inventory", "stock", "sku", "warehouse", "on hand"])
            .with_param("sku", r"(?i)\b(SKU-\d+)\b"),
        IntentRule::new("order_status")
            .with_keywords(["order", "shipment", "shipped", "tracking", "delivery"])
            .with_param("order_id", r"(?i)\b(ORD-\d+)\b"),
        IntentRule::new("month_end_close")
            .with_keywords(["month end", "close", "closing", "reconcile", "reconciliation", "ledger"])
            .with_param("period", r"\b(\d{4}-\d{2})\b"),
        IntentRule::new("escalation")
            .with_keywords(["urgent", "escalate", "emergency", "outage", "complaint"]),
    ]
}

struct CompiledRule {
    category: String,
    keywords: Vec<String>,
    params: Vec<(String, Regex)>,
}

impl CompiledRule {
    fn compile(rule: &IntentRule) -> Result<Self> {
        let params = rule
            .params
            .iter()
            .map(|(name, pattern)| {
                Regex::new(pattern).map(|re| (name.clone(), re)).map_err(|e| {
                    OrchestrationError::Configuration(format!(
                        "intent '{}' parameter '{}' has an invalid pattern: {}",
                        rule.category, name, e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let keywords = rule
            .keywords
            .iter()
            .map(|k| normalize(k))
            .filter(|k| !k.is_empty())
            .collect::<Vec<_>>();
        Ok(Self { category: rule.category.clone(), keywords, params })
    }

    fn extract(&self, raw: &str) -> BTreeMap<String, String> {
        self.params
            .iter()
            .filter_map(|(name, re)| {
                let captures = re.captures(raw)?;
                let value = captures.get(1).or_else(|| captures.get(0))?;
                Some((name.clone(), value.as_str().to_string()))
            })
            .collect()
    }

    fn keyword_hits(&self, padded: &str) -> usize {
        let unique: HashSet<&str> = self.keywords.iter().map(String::as_str).collect();
        unique.into_iter().filter(|k| padded.contains(&format!(" {} ", k))).count()
    }
}

/// Lowercases and collapses every run of non-alphanumerics into one space.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic intent classifier.
pub struct IntentClassifier {
    rules: Vec<CompiledRule>,
    floor: f64,
}

impl fmt::Debug for IntentClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntentClassifier")
            .field("categories", &self.categories())
            .field("floor", &self.floor)
            .finish()
    }
}

impl IntentClassifier {
    /// Compiles the given rules.
    ///
    /// # Errors
    /// `ConfigurationError` for a floor outside `[0, 1]`, a rule claiming the
    /// reserved category, a duplicate category, or an invalid regex.
    pub fn new(rules: &[IntentRule], floor: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&floor) {
            return Err(OrchestrationError::Configuration(format!(
                "confidence floor {} is outside [0, 1]",
                floor
            )));
        }
        let mut seen = HashSet::new();
        for rule in rules {
            if rule.category == UNKNOWN_CATEGORY {
                return Err(OrchestrationError::Configuration(format!(
                    "intent category '{}' is reserved",
                    UNKNOWN_CATEGORY
                )));
            }
            if !seen.insert(rule.category.as_str()) {
                return Err(OrchestrationError::Configuration(format!(
                    "intent category '{}' is declared twice",
                    rule.category
                )));
            }
        }
        let rules = rules.iter().map(CompiledRule::compile).collect::<Result<Vec<_>>>()?;
        Ok(Self { rules, floor })
    }

    /// Builds a classifier from configuration.
    ///
    /// # Errors
    /// See [`IntentClassifier::new`].
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        Self::new(&config.intents, config.confidence_floor)
    }

    /// Minimum confidence for a non-`unknown` intent.
    pub fn floor(&self) -> f64 {
        self.floor
    }

    /// Declared categories, in evaluation order.
    pub fn categories(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.category.as_str()).collect()
    }

    /// Classifies free-form input.
    pub fn classify(&self, raw: &str) -> Intent {
        let padded = format!(" {} ", normalize(raw));

        let mut best: Option<(f64, &CompiledRule, BTreeMap<String, String>)> = None;
        for rule in &self.rules {
            let params = rule.extract(raw);
            #[allow(clippy::cast_precision_loss)]
            let score = rule.keyword_hits(&padded) as f64 + PARAM_WEIGHT * params.len() as f64;
            if score > 0.0 && best.as_ref().is_none_or(|(top, _, _)| score > *top) {
                best = Some((score, rule, params));
            }
        }

        let intent = match best {
            Some((score, rule, params)) => {
                let confidence = 1.0 - (-score).exp();
                if confidence >= self.floor {
                    Intent { category: rule.category.clone(), confidence, params }
                } else {
                    Intent { category: UNKNOWN_CATEGORY.to_string(), confidence, params }
                }
            }
            None => Intent {
                category: UNKNOWN_CATEGORY.to_string(),
                confidence: 0.0,
                params: BTreeMap::new(),
            },
        };

        debug!(
            category = %intent.category,
            confidence = intent.confidence,
            params = ?intent.params,
            "Classified input"
        );
        intent
    }
}
