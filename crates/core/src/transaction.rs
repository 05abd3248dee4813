use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::money::Money;
use crate::normalize::{normalize_description, Fingerprint};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Transaction has no date")]
    MissingDate,
    #[error("Invalid date: {0}")]
    InvalidDate(String),
    #[error("Transaction has no amount")]
    MissingAmount,
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Transaction description is empty")]
    EmptyDescription,
}

/// A record as handed over by the ingestion side, before any checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTransaction {
    pub account_id: String,
    pub date: Option<String>,
    pub description: String,
    pub amount: Option<String>,
}

/// Identity of a transaction: (account, date, raw description, amount).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionKey {
    pub account_id: String,
    pub date: NaiveDate,
    pub description: String,
    pub amount: Money,
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} \"{}\" {}",
            self.account_id, self.date, self.description, self.amount
        )
    }
}

/// A validated transaction carrying its normalized description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub account_id: String,
    pub date: NaiveDate,
    pub description: String,
    pub amount: Money,
    pub normalized: String,
}

impl Transaction {
    pub fn new(account_id: &str, date: NaiveDate, description: &str, amount: Money) -> Self {
        Transaction {
            account_id: account_id.to_string(),
            date,
            description: description.to_string(),
            amount,
            normalized: normalize_description(description),
        }
    }

    pub fn validate(raw: RawTransaction) -> Result<Transaction, ValidationError> {
        let date_str = raw
            .date
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingDate)?;
        let date = parse_date(date_str)?;

        let amount_str = raw
            .amount
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingAmount)?;
        let amount = Money::parse(amount_str)
            .ok_or_else(|| ValidationError::InvalidAmount(amount_str.to_string()))?;

        let description = raw.description.trim();
        if description.is_empty() {
            return Err(ValidationError::EmptyDescription);
        }

        Ok(Transaction::new(raw.account_id.trim(), date, description, amount))
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.normalized)
    }

    pub fn key(&self) -> TransactionKey {
        TransactionKey {
            account_id: self.account_id.clone(),
            date: self.date,
            description: self.description.clone(),
            amount: self.amount,
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, ValidationError> {
    for fmt in &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%m-%d-%Y", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(date);
        }
    }
    Err(ValidationError::InvalidDate(s.to_string()))
}

/// Which pipeline stage produced a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Rule,
    Fuzzy,
    Cache,
    Remote,
    Unresolved,
}

impl fmt::Display for MatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchSource::Rule => write!(f, "rule"),
            MatchSource::Fuzzy => write!(f, "fuzzy"),
            MatchSource::Cache => write!(f, "cache"),
            MatchSource::Remote => write!(f, "remote"),
            MatchSource::Unresolved => write!(f, "unresolved"),
        }
    }
}

impl std::str::FromStr for MatchSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rule" => Ok(MatchSource::Rule),
            "fuzzy" => Ok(MatchSource::Fuzzy),
            "cache" => Ok(MatchSource::Cache),
            "remote" => Ok(MatchSource::Remote),
            "unresolved" => Ok(MatchSource::Unresolved),
            other => Err(format!("Unknown match source: '{other}'")),
        }
    }
}

/// The (category, vendor, confidence) triple a stage resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub category: String,
    pub vendor: Option<String>,
    pub confidence: Option<f32>,
}

/// A transaction after it has left the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledTransaction {
    pub transaction: Transaction,
    pub category: Option<String>,
    pub vendor: Option<String>,
    pub source: MatchSource,
    pub confidence: Option<f32>,
}

impl LabeledTransaction {
    pub fn resolved(transaction: Transaction, label: Label, source: MatchSource) -> Self {
        LabeledTransaction {
            transaction,
            category: Some(label.category),
            vendor: label.vendor,
            source,
            confidence: label.confidence,
        }
    }

    pub fn unresolved(transaction: Transaction) -> Self {
        LabeledTransaction {
            transaction,
            category: None,
            vendor: None,
            source: MatchSource::Unresolved,
            confidence: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.source != MatchSource::Unresolved && self.category.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(date: Option<&str>, desc: &str, amount: Option<&str>) -> RawTransaction {
        RawTransaction {
            account_id: "8592".to_string(),
            date: date.map(str::to_string),
            description: desc.to_string(),
            amount: amount.map(str::to_string),
        }
    }

    #[test]
    fn validate_normalizes_description() {
        let tx = Transaction::validate(raw(Some("2025-01-03"), "STARBUCKS #123", Some("-4.50")))
            .unwrap();
        assert_eq!(tx.normalized, "starbucks 123");
        assert_eq!(tx.amount.to_cents(), -450);
        assert_eq!(tx.date, NaiveDate::from_ymd_opt(2025, 1, 3).unwrap());
    }

    #[test]
    fn validate_accepts_us_dates() {
        let tx = Transaction::validate(raw(Some("01/15/2024"), "UBER", Some("12"))).unwrap();
        assert_eq!(tx.date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert_eq!(
            Transaction::validate(raw(None, "UBER", Some("1.00"))),
            Err(ValidationError::MissingDate)
        );
        assert_eq!(
            Transaction::validate(raw(Some("2024-01-15"), "UBER", Some("  "))),
            Err(ValidationError::MissingAmount)
        );
        assert_eq!(
            Transaction::validate(raw(Some("2024-01-15"), "   ", Some("1.00"))),
            Err(ValidationError::EmptyDescription)
        );
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(matches!(
            Transaction::validate(raw(Some("yesterday"), "UBER", Some("1.00"))),
            Err(ValidationError::InvalidDate(_))
        ));
        assert!(matches!(
            Transaction::validate(raw(Some("2024-01-15"), "UBER", Some("lots"))),
            Err(ValidationError::InvalidAmount(_))
        ));
    }

    #[test]
    fn same_normalized_description_shares_fingerprint() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let a = Transaction::new("1", d, "NETFLIX.COM", Money::from_cents(-1599));
        let b = Transaction::new("2", d, "netflix com", Money::from_cents(-999));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn match_source_roundtrip() {
        use std::str::FromStr;
        for s in [
            MatchSource::Rule,
            MatchSource::Fuzzy,
            MatchSource::Cache,
            MatchSource::Remote,
            MatchSource::Unresolved,
        ] {
            assert_eq!(MatchSource::from_str(&s.to_string()).unwrap(), s);
        }
    }

    #[test]
    fn unresolved_is_not_resolved() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let tx = Transaction::new("1", d, "X", Money::zero());
        assert!(!LabeledTransaction::unresolved(tx.clone()).is_resolved());
        let label = Label {
            category: "Dining".into(),
            vendor: None,
            confidence: None,
        };
        assert!(LabeledTransaction::resolved(tx, label, MatchSource::Rule).is_resolved());
    }
}
