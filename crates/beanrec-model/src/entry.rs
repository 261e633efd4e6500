//! Ledger entry types

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{Amount, Cost, Meta, Price};

/// Half-open line range within a ledger file (0-based, end exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Entry with positional identity in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpannedEntry {
    pub entry: Entry,
    /// Source file path (relative to the ledger root)
    pub file: String,
    pub span: LineRange,
}

/// Main entry union
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entry {
    Transaction(Transaction),
    Open(Open),
    Close(Close),
    Balance(Balance),
    Price(PriceEntry),
}

impl Entry {
    pub fn date(&self) -> NaiveDate {
        match self {
            Entry::Transaction(t) => t.date,
            Entry::Open(o) => o.date,
            Entry::Close(c) => c.date,
            Entry::Balance(b) => b.date,
            Entry::Price(p) => p.date,
        }
    }

    pub fn as_transaction(&self) -> Option<&Transaction> {
        match self {
            Entry::Transaction(t) => Some(t),
            _ => None,
        }
    }
}

/// Transaction entry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub date: NaiveDate,
    pub flag: Option<String>,
    pub payee: Option<String>,
    pub narration: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub postings: Vec<Posting>,
    #[serde(default)]
    pub meta: Meta,
}

impl Transaction {
    /// Date associated with a posting: the posting `date` metadata override,
    /// then `transaction_date`, then the transaction's own date.
    pub fn posting_date(&self, posting: &Posting) -> NaiveDate {
        posting
            .meta
            .date()
            .or_else(|| posting.meta.transaction_date())
            .unwrap_or(self.date)
    }

    pub fn involves_account(&self, account: &str) -> bool {
        self.postings.iter().any(|p| p.account == account)
    }

    pub fn has_unknown_postings(&self) -> bool {
        self.postings
            .iter()
            .any(|p| crate::is_unknown_account(&p.account))
    }
}

/// Posting within a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub flag: Option<String>,
    pub account: String,
    /// Units; `None` for the elided plug posting
    pub amount: Option<Amount>,
    pub cost: Option<Cost>,
    pub price: Option<Price>,
    #[serde(default)]
    pub meta: Meta,
}

impl Posting {
    pub fn new(account: impl Into<String>, amount: Option<Amount>) -> Self {
        Self {
            flag: None,
            account: account.into(),
            amount,
            cost: None,
            price: None,
            meta: Meta::new(),
        }
    }

    /// Weight of the posting for balancing and matching purposes.
    ///
    /// Cost-basis postings weigh `units × cost` in the cost currency, priced
    /// postings weigh `units × price` (a total price keeps the units' sign),
    /// all others weigh their units. An elided amount has no weight.
    pub fn weight(&self) -> Option<Amount> {
        let units = self.amount.as_ref()?;
        if let Some(cost) = &self.cost {
            return Some(Amount::new(units.number * cost.number, cost.currency.clone()));
        }
        if let Some(price) = &self.price {
            return Some(match price {
                Price::Unit(p) => Amount::new(units.number * p.number, p.currency.clone()),
                Price::Total(p) => {
                    let number = if units.number.is_sign_negative() {
                        -p.number
                    } else {
                        p.number
                    };
                    Amount::new(number, p.currency.clone())
                }
            });
        }
        Some(units.clone())
    }
}

/// Open directive (account declaration)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Open {
    pub date: NaiveDate,
    pub account: String,
    #[serde(default)]
    pub currencies: Vec<String>,
    #[serde(default)]
    pub meta: Meta,
}

/// Close directive (account closure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Close {
    pub date: NaiveDate,
    pub account: String,
}

/// Balance assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub date: NaiveDate,
    pub account: String,
    pub amount: Amount,
}

/// Price declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub date: NaiveDate,
    pub currency: String,
    pub amount: Amount,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetaValue;
    use rust_decimal::Decimal;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn amount(s: &str, cur: &str) -> Amount {
        Amount::new(s.parse::<Decimal>().unwrap(), cur)
    }

    #[test]
    fn posting_weight_plain_units() {
        let p = Posting::new("Assets:Checking", Some(amount("-66.88", "USD")));
        assert_eq!(p.weight(), Some(amount("-66.88", "USD")));
    }

    #[test]
    fn posting_weight_with_cost() {
        let mut p = Posting::new("Assets:Brokerage", Some(amount("3", "HOOL")));
        p.cost = Some(Cost::new("500.00".parse().unwrap(), "USD"));
        assert_eq!(p.weight(), Some(amount("1500.00", "USD")));
    }

    #[test]
    fn posting_weight_with_total_price() {
        let mut p = Posting::new("Assets:Cash", Some(amount("-100", "EUR")));
        p.price = Some(Price::Total(amount("108.70", "USD")));
        assert_eq!(p.weight(), Some(amount("-108.70", "USD")));
    }

    #[test]
    fn posting_weight_elided_amount() {
        let p = Posting::new("Expenses:FIXME", None);
        assert_eq!(p.weight(), None);
    }

    #[test]
    fn posting_date_override() {
        let mut txn = Transaction {
            date: date(2016, 8, 9),
            ..Default::default()
        };
        let mut p = Posting::new("Liabilities:Credit-Card", Some(amount("-2.45", "USD")));
        p.meta
            .insert(crate::types::DATE_KEY, MetaValue::Date(date(2016, 8, 10)));
        txn.postings.push(p);
        assert_eq!(txn.posting_date(&txn.postings[0]), date(2016, 8, 10));

        let plain = Posting::new("Expenses:FIXME", None);
        assert_eq!(txn.posting_date(&plain), date(2016, 8, 9));
    }

    #[test]
    fn line_range_len() {
        assert_eq!(LineRange::new(3, 7).len(), 4);
        assert!(LineRange::new(5, 5).is_empty());
    }
}
