use ledgerlabel_core::normalize_description;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryRule {
    #[serde(default)]
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub match_type: MatchType,
    pub category: String,
    #[serde(default)]
    pub vendor: Option<String>,
}

impl CategoryRule {
    pub fn contains(pattern: &str, category: &str) -> Self {
        CategoryRule {
            name: pattern.to_string(),
            pattern: pattern.to_string(),
            match_type: MatchType::Contains,
            category: category.to_string(),
            vendor: None,
        }
    }

    pub fn with_vendor(mut self, vendor: &str) -> Self {
        self.vendor = Some(vendor.to_string());
        self
    }

    fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.pattern
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Pattern appears anywhere in the normalized description.
    #[default]
    Contains,
    /// Pattern appears as a run of whole tokens.
    Token,
    Exact,
    Regex,
}

impl std::str::FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "contains" => Ok(MatchType::Contains),
            "token" => Ok(MatchType::Token),
            "exact" => Ok(MatchType::Exact),
            "regex" => Ok(MatchType::Regex),
            other => Err(format!("Unknown match type: '{other}'")),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("Rule '{0}' has an empty pattern")]
    EmptyPattern(String),
    #[error("Rule '{0}' has no category")]
    EmptyCategory(String),
    #[error("Rule '{name}' has an invalid regex: {message}")]
    InvalidRegex { name: String, message: String },
    #[error("Failed to parse rules: {0}")]
    Parse(String),
}

/// Rule paired with its load-time normalized pattern or compiled regex.
#[derive(Debug)]
struct CompiledRule {
    rule: CategoryRule,
    needle: String,
    compiled_regex: Option<Regex>,
}

/// Ordered rule set; the first matching rule wins.
#[derive(Debug, Default)]
pub struct CategoryRuleEngine {
    rules: Vec<CompiledRule>,
}

#[derive(Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<CategoryRule>,
}

impl CategoryRuleEngine {
    /// Compiles `rules` in order, rejecting malformed definitions up front.
    pub fn new(rules: Vec<CategoryRule>) -> Result<Self, RuleError> {
        let compiled = rules
            .into_iter()
            .map(compile)
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(rules = compiled.len(), "rule set loaded");
        Ok(Self { rules: compiled })
    }

    /// Parses a TOML document with a `[[rules]]` array.
    pub fn from_toml(toml_content: &str) -> Result<Self, RuleError> {
        let file: RuleFile =
            toml::from_str(toml_content).map_err(|e| RuleError::Parse(e.to_string()))?;
        Self::new(file.rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching an already-normalized description.
    pub fn find_match(&self, normalized: &str) -> Option<&CategoryRule> {
        self.rules
            .iter()
            .find(|cr| rule_matches(cr, normalized))
            .map(|cr| &cr.rule)
    }
}

fn compile(rule: CategoryRule) -> Result<CompiledRule, RuleError> {
    if rule.category.trim().is_empty() {
        return Err(RuleError::EmptyCategory(rule.label().to_string()));
    }

    let (needle, compiled_regex) = if rule.match_type == MatchType::Regex {
        if rule.pattern.trim().is_empty() {
            return Err(RuleError::EmptyPattern(rule.label().to_string()));
        }
        let re = RegexBuilder::new(&rule.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| RuleError::InvalidRegex {
                name: rule.label().to_string(),
                message: e.to_string(),
            })?;
        (String::new(), Some(re))
    } else {
        let needle = normalize_description(&rule.pattern);
        if needle.is_empty() {
            return Err(RuleError::EmptyPattern(rule.label().to_string()));
        }
        (needle, None)
    };

    Ok(CompiledRule {
        rule,
        needle,
        compiled_regex,
    })
}

fn rule_matches(cr: &CompiledRule, text: &str) -> bool {
    match cr.rule.match_type {
        MatchType::Contains => text.contains(&cr.needle),
        MatchType::Token => format!(" {text} ").contains(&format!(" {} ", cr.needle)),
        MatchType::Exact => text == cr.needle,
        MatchType::Regex => cr
            .compiled_regex
            .as_ref()
            .is_some_and(|re| re.is_match(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rule(pattern: &str, match_type: MatchType, category: &str) -> CategoryRule {
        CategoryRule {
            name: "test".to_string(),
            pattern: pattern.to_string(),
            match_type,
            category: category.to_string(),
            vendor: None,
        }
    }

    fn engine(rules: Vec<CategoryRule>) -> CategoryRuleEngine {
        CategoryRuleEngine::new(rules).unwrap()
    }

    #[test]
    fn contains_match_case_insensitive() {
        let e = engine(vec![make_rule("WHOLE FOODS", MatchType::Contains, "Groceries")]);
        assert!(e.find_match("whole foods market 123").is_some());
        assert!(e.find_match("starbucks").is_none());
    }

    #[test]
    fn pattern_punctuation_is_normalized() {
        let e = engine(vec![make_rule("AMAZON.COM", MatchType::Contains, "Shopping")]);
        assert!(e.find_match("amazon com amzn us").is_some());
    }

    #[test]
    fn token_match_requires_whole_words() {
        let e = engine(vec![make_rule("rent", MatchType::Token, "Rent")]);
        assert!(e.find_match("zelle rent payment").is_some());
        assert!(e.find_match("rent").is_some());
        assert!(e.find_match("parenting magazine").is_none());
    }

    #[test]
    fn exact_match() {
        let e = engine(vec![make_rule("starbucks", MatchType::Exact, "Dining")]);
        assert!(e.find_match("starbucks").is_some());
        assert!(e.find_match("starbucks reserve").is_none());
    }

    #[test]
    fn regex_match() {
        let e = engine(vec![make_rule(r"^amzn|amazon", MatchType::Regex, "Shopping")]);
        assert!(e.find_match("amazon marketplace").is_some());
        assert!(e.find_match("amzn prime").is_some());
        assert!(e.find_match("whole foods").is_none());
    }

    #[test]
    fn first_match_wins() {
        let e = engine(vec![
            make_rule("amazon", MatchType::Contains, "Shopping"),
            make_rule("amazon prime", MatchType::Contains, "Subscriptions"),
        ]);
        assert_eq!(e.find_match("amazon prime video").unwrap().category, "Shopping");
    }

    #[test]
    fn rejects_empty_pattern() {
        let err = CategoryRuleEngine::new(vec![make_rule(" ** ", MatchType::Contains, "Dining")])
            .unwrap_err();
        assert_eq!(err, RuleError::EmptyPattern("test".to_string()));
    }

    #[test]
    fn rejects_empty_category() {
        let err =
            CategoryRuleEngine::new(vec![make_rule("uber", MatchType::Contains, "")]).unwrap_err();
        assert_eq!(err, RuleError::EmptyCategory("test".to_string()));
    }

    #[test]
    fn rejects_invalid_regex() {
        let err = CategoryRuleEngine::new(vec![make_rule("(unclosed", MatchType::Regex, "Dining")])
            .unwrap_err();
        assert!(matches!(err, RuleError::InvalidRegex { .. }));
    }

    #[test]
    fn from_toml_preserves_order_and_vendor() {
        let e = CategoryRuleEngine::from_toml(
            r#"
            [[rules]]
            pattern = "starbucks"
            category = "Dining"
            vendor = "STARBUCKS"

            [[rules]]
            name = "rideshare"
            pattern = "uber|lyft"
            match_type = "regex"
            category = "Transportation"
            "#,
        )
        .unwrap();
        assert_eq!(e.len(), 2);
        let hit = e.find_match("starbucks 123").unwrap();
        assert_eq!(hit.vendor.as_deref(), Some("STARBUCKS"));
        assert_eq!(e.find_match("lyft ride").unwrap().category, "Transportation");
    }

    #[test]
    fn match_type_from_str() {
        use std::str::FromStr;
        assert_eq!(MatchType::from_str("TOKEN").unwrap(), MatchType::Token);
        assert!(MatchType::from_str("fuzzy").is_err());
    }
}
