//! Per-domain URL filters and field-extraction rules.
//!
//! User patterns compile once at crawl start into anchored regexes run
//! against normalized URL strings. Field rules only ever touch HTML
//! results and have no influence on discovery.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;

use crate::config::{DomainRulesConfig, FieldRuleConfig, UrlFilterKind};
use crate::urls::{Authority, NormalizedUrl, UrlError};

#[derive(Debug, Error)]
pub enum RulesetError {
    #[error("invalid domain key: {0}")]
    Domain(#[from] UrlError),

    #[error("invalid pattern for {domain}: {message}")]
    Pattern { domain: String, message: String },

    #[error("invalid selector for rule {name}: {selector}")]
    Selector { name: String, selector: String },

    #[error("rule {0} needs either a selector or a pattern")]
    EmptyRule(String),
}

enum FieldExtractor {
    Css(Selector),
    Pattern(Regex),
}

struct CompiledField {
    name: String,
    extractor: FieldExtractor,
}

struct CompiledRules {
    filters: Vec<Regex>,
    fields: Vec<CompiledField>,
}

/// Compiled rules for every configured domain
#[derive(Default)]
pub struct Ruleset {
    by_domain: HashMap<Authority, CompiledRules>,
}

impl Ruleset {
    pub fn compile(
        rules: &HashMap<String, DomainRulesConfig>,
    ) -> Result<Self, RulesetError> {
        let mut by_domain = HashMap::new();
        for (domain, config) in rules {
            let authority = Authority::parse_domain(domain)?;
            let domain_prefix = authority.to_string();

            let mut filters = Vec::new();
            for filter in &config.url_filters {
                let pattern = compile_filter(&domain_prefix, filter.kind, &filter.pattern);
                let regex = Regex::new(&pattern).map_err(|e| RulesetError::Pattern {
                    domain: domain.clone(),
                    message: e.to_string(),
                })?;
                filters.push(regex);
            }

            let mut fields = Vec::new();
            for rule in &config.rules {
                fields.push(compile_field(rule)?);
            }

            by_domain.insert(authority, CompiledRules { filters, fields });
        }
        Ok(Self { by_domain })
    }

    /// A URL survives filtering when its domain has no filters, or when at
    /// least one filter matches.
    pub fn allows(&self, url: &NormalizedUrl) -> bool {
        match self.by_domain.get(&url.authority()) {
            None => true,
            Some(rules) if rules.filters.is_empty() => true,
            Some(rules) => rules.filters.iter().any(|f| f.is_match(url.as_str())),
        }
    }

    /// Run this domain's field rules over a parsed document.
    pub fn extract_fields(
        &self,
        url: &NormalizedUrl,
        document: &Html,
        body_text: &str,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let Some(rules) = self.by_domain.get(&url.authority()) else {
            return out;
        };
        for field in &rules.fields {
            let value = match &field.extractor {
                FieldExtractor::Css(selector) => document.select(selector).next().map(|el| {
                    el.value()
                        .attr("content")
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| el.text().collect::<String>().trim().to_string())
                }),
                FieldExtractor::Pattern(regex) => regex
                    .captures(body_text)
                    .and_then(|c| c.get(1).or_else(|| c.get(0)))
                    .map(|m| m.as_str().to_string()),
            };
            if let Some(value) = value {
                if !value.is_empty() {
                    out.insert(field.name.clone(), value);
                }
            }
        }
        out
    }
}

/// Anchor a user pattern to its domain. Asterisks in non-regex patterns
/// become ".*" after everything else is escaped.
fn compile_filter(domain: &str, kind: UrlFilterKind, pattern: &str) -> String {
    let escaped = || {
        regex::escape(pattern)
            .replace(r"\*", ".*")
    };
    let domain = regex::escape(domain);
    match kind {
        UrlFilterKind::Begins => format!(r"\A{domain}{}", escaped()),
        UrlFilterKind::Ends => format!(r"\A{domain}.*{}\z", escaped()),
        UrlFilterKind::Contains => format!(r"\A{domain}.*{}", escaped()),
        UrlFilterKind::Regex => format!(r"\A{domain}{pattern}"),
    }
}

fn compile_field(rule: &FieldRuleConfig) -> Result<CompiledField, RulesetError> {
    if let Some(selector) = &rule.selector {
        let selector = Selector::parse(selector).map_err(|_| RulesetError::Selector {
            name: rule.name.clone(),
            selector: selector.clone(),
        })?;
        return Ok(CompiledField {
            name: rule.name.clone(),
            extractor: FieldExtractor::Css(selector),
        });
    }
    if let Some(pattern) = &rule.pattern {
        let regex = Regex::new(pattern).map_err(|e| RulesetError::Pattern {
            domain: rule.name.clone(),
            message: e.to_string(),
        })?;
        return Ok(CompiledField {
            name: rule.name.clone(),
            extractor: FieldExtractor::Pattern(regex),
        });
    }
    Err(RulesetError::EmptyRule(rule.name.clone()))
}
