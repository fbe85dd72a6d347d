//! Path based rule matching
//!
//! Rules are evaluated in declaration order and the first rule whose pattern
//! matches anywhere in the path wins. Patterns are not anchored, so `^`/`$`
//! must be written into the configured pattern when needed.

use crate::config::RuleConfig;
use regex::Regex;

/// A rule with its compiled path pattern
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pattern: Regex,
    rule: RuleConfig,
}

impl CompiledRule {
    pub fn rule(&self) -> &RuleConfig {
        &self.rule
    }
}

/// Immutable, first-match routing table
#[derive(Debug, Clone, Default)]
pub struct Router {
    rules: Vec<CompiledRule>,
}

impl Router {
    /// Compile every rule pattern, failing on the first invalid one
    pub fn new(rules: &[RuleConfig]) -> anyhow::Result<Self> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                let pattern = Regex::new(&rule.path).map_err(|e| {
                    anyhow::anyhow!("Invalid pattern '{}' in rule {}: {}", rule.path, index, e)
                })?;
                Ok(CompiledRule {
                    pattern,
                    rule: rule.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// Return the first rule whose pattern matches `path`
    pub fn find(&self, path: &str) -> Option<&RuleConfig> {
        self.rules
            .iter()
            .find(|r| r.pattern.is_match(path))
            .map(CompiledRule::rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
