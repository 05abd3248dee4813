pub mod fuzzy;
pub mod rules;
pub(crate) mod util;

pub use fuzzy::{Exemplar, ExemplarSet, FuzzyMatch, FuzzyMatcher};
pub use rules::{CategoryRule, CategoryRuleEngine, MatchType, RuleError};
