//! Common value types for ledger entries

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Amount with currency
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    pub number: Decimal,
    pub currency: String,
}

impl Amount {
    pub fn new(number: Decimal, currency: impl Into<String>) -> Self {
        Self {
            number,
            currency: currency.into(),
        }
    }

    /// Amount with the same currency and negated number
    pub fn negated(&self) -> Self {
        Self {
            number: -self.number,
            currency: self.currency.clone(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.number.is_zero()
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.number, self.currency)
    }
}

/// Cost basis specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    pub number: Decimal,
    pub currency: String,
    pub date: Option<NaiveDate>,
    pub label: Option<String>,
}

impl Cost {
    pub fn new(number: Decimal, currency: impl Into<String>) -> Self {
        Self {
            number,
            currency: currency.into(),
            date: None,
            label: None,
        }
    }
}

/// Price specification (per-unit or total)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Price {
    Unit(Amount),
    Total(Amount),
}

/// Account type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    Assets,
    Liabilities,
    Equity,
    Income,
    Expenses,
}

impl AccountType {
    pub fn as_str(&self) -> &str {
        match self {
            AccountType::Assets => "Assets",
            AccountType::Liabilities => "Liabilities",
            AccountType::Equity => "Equity",
            AccountType::Income => "Income",
            AccountType::Expenses => "Expenses",
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = ModelError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Assets" => Ok(AccountType::Assets),
            "Liabilities" => Ok(AccountType::Liabilities),
            "Equity" => Ok(AccountType::Equity),
            "Income" => Ok(AccountType::Income),
            "Expenses" => Ok(AccountType::Expenses),
            _ => Err(ModelError::InvalidAccountType {
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Account type of a full account name, from its first component
pub fn account_type(account: &str) -> Option<AccountType> {
    let root = account.split(':').next().unwrap_or(account);
    root.parse().ok()
}

/// Parent account name, if the account is not a root
pub fn parent_account(account: &str) -> Option<&str> {
    account.rfind(':').map(|pos| &account[..pos])
}

/// Proper ancestors of an account, nearest first
pub fn account_ancestors(account: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut cur = account;
    while let Some(parent) = parent_account(cur) {
        out.push(parent);
        cur = parent;
    }
    out
}

// ==================== Metadata ====================

/// Well-known metadata key: per-posting date override
pub const DATE_KEY: &str = "date";
/// Well-known metadata key: date of the other side of a transfer
pub const TRANSACTION_DATE_KEY: &str = "transaction_date";
/// Well-known metadata key: posting manually marked cleared
pub const CLEARED_KEY: &str = "cleared";
/// Well-known metadata key: account-level uncleared-report cutoff
pub const CLEARED_BEFORE_KEY: &str = "cleared_before";

/// Typed metadata value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaValue {
    Text(String),
    Date(NaiveDate),
    Bool(bool),
    Number(Decimal),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Date value, accepting `YYYY-MM-DD` text as well
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            MetaValue::Date(d) => Some(*d),
            MetaValue::Text(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetaValue::Text(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            MetaValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            MetaValue::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            MetaValue::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Ordered metadata key-value store.
///
/// Insertion order is preserved; the well-known keys above have typed
/// accessors, all other keys are the open extension area used for
/// source-specific identity fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta(Vec<(String, MetaValue)>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or replace in place, preserving the position of existing keys
    pub fn insert(&mut self, key: impl Into<String>, value: MetaValue) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        let pos = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add every key of `other` that is not already present
    pub fn merge_missing(&mut self, other: &Meta) {
        for (k, v) in other.iter() {
            if self.get(k).is_none() {
                self.0.push((k.to_string(), v.clone()));
            }
        }
    }

    /// Per-posting date override
    pub fn date(&self) -> Option<NaiveDate> {
        self.get(DATE_KEY).and_then(|v| v.as_date())
    }

    /// Transfer counterpart transaction date
    pub fn transaction_date(&self) -> Option<NaiveDate> {
        self.get(TRANSACTION_DATE_KEY).and_then(|v| v.as_date())
    }

    /// Posting explicitly marked cleared
    pub fn cleared(&self) -> bool {
        self.get(CLEARED_KEY).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Uncleared-report cutoff date declared on an open directive
    pub fn cleared_before(&self) -> Option<NaiveDate> {
        self.get(CLEARED_BEFORE_KEY).and_then(|v| v.as_date())
    }
}

impl From<Vec<(String, MetaValue)>> for Meta {
    fn from(v: Vec<(String, MetaValue)>) -> Self {
        Meta(v)
    }
}

impl FromIterator<(String, MetaValue)> for Meta {
    fn from_iter<T: IntoIterator<Item = (String, MetaValue)>>(iter: T) -> Self {
        Meta(iter.into_iter().collect())
    }
}
