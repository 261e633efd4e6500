//! External data-source interface
//!
//! Sources hand the engine already-parsed pending entries; per-format
//! extraction (CSV/OFX/PDF) lives outside this crate. The engine depends
//! only on the `Source` capability interface, never on concrete source
//! kinds.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use beanrec_config::SourceConfig;
use beanrec_model::{render_entries, short_hash, Balance, Entry, Posting, PriceEntry};

use crate::error::{CoreError, JournalError};

/// An externally-sourced, not-yet-reconciled entry.
///
/// One external record may expand to multiple ledger entries (e.g. a
/// transfer pair). The id is a stable content hash so a previously seen
/// but not yet accepted pending entry is not duplicated across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: String,
    pub date: NaiveDate,
    pub source: String,
    pub entries: Vec<Entry>,
    pub formatted: String,
    /// Snapshot entry index when this pending entry is a re-imported
    /// ledger transaction that still has unknown legs
    #[serde(default)]
    pub journal_entry: Option<usize>,
}

/// Build a pending entry from its parsed entries
pub fn make_pending_entry(source: &str, entries: Vec<Entry>) -> PendingEntry {
    let formatted = render_entries(&entries);
    let date = entries
        .iter()
        .map(|e| e.date())
        .min()
        .unwrap_or(NaiveDate::MIN);
    PendingEntry {
        id: short_hash(&formatted),
        date,
        source: source.to_string(),
        entries,
        formatted,
        journal_entry: None,
    }
}

/// Everything one source run yields
#[derive(Debug, Default, Clone)]
pub struct SourceOutput {
    pub pending: Vec<PendingEntry>,
    pub balances: Vec<Balance>,
    pub prices: Vec<PriceEntry>,
    pub messages: Vec<JournalError>,
}

/// Capability interface implemented by each data-source kind
pub trait Source: Send + Sync {
    /// Source name, for reporting
    fn name(&self) -> &str;

    /// Whether this source is authoritative for an account
    fn is_mine(&self, account: &str) -> bool;

    /// Metadata keys carrying this source's external record identity
    fn identity_keys(&self) -> &[String];

    /// Produce pending entries plus any balance/price directives
    fn pending(&self) -> Result<SourceOutput, CoreError>;

    /// Whether a posting is confirmed by this source's records.
    ///
    /// A posting is cleared when it carries a posting date and at least one
    /// of the source's identity keys.
    fn is_cleared(&self, posting: &Posting) -> bool {
        posting.meta.date().is_some()
            && self
                .identity_keys()
                .iter()
                .any(|key| posting.meta.get(key).is_some())
    }
}

/// Source reference type
pub type SourceRef = Arc<dyn Source>;

/// First source authoritative for an account, if any
pub fn source_for<'a>(sources: &'a [SourceRef], account: &str) -> Option<&'a dyn Source> {
    sources
        .iter()
        .find(|source| source.is_mine(account))
        .map(|source| source.as_ref())
}

/// Whether a posting is cleared: marked `cleared: TRUE` explicitly, or
/// confirmed by the source authoritative for its account.
pub fn is_posting_cleared(sources: &[SourceRef], posting: &Posting) -> bool {
    if posting.meta.cleared() {
        return true;
    }
    source_for(sources, &posting.account)
        .map(|source| source.is_cleared(posting))
        .unwrap_or(false)
}

// ==================== JSON source ====================

/// One record of a JSON pending file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonPendingRecord {
    entries: Vec<Entry>,
}

/// Source reading already-parsed entries from a JSON file.
///
/// This is the reference implementation used by the CLI driver; real
/// format adapters implement `Source` outside this crate.
pub struct JsonSource {
    name: String,
    accounts: Vec<String>,
    identity_keys: Vec<String>,
    pending_file: Option<PathBuf>,
}

impl JsonSource {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            accounts: config.accounts.clone(),
            identity_keys: config.identity_keys.clone(),
            pending_file: config.pending_file.clone(),
        }
    }
}

impl Source for JsonSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_mine(&self, account: &str) -> bool {
        self.accounts.iter().any(|a| a == account)
    }

    fn identity_keys(&self) -> &[String] {
        &self.identity_keys
    }

    fn pending(&self) -> Result<SourceOutput, CoreError> {
        let mut output = SourceOutput::default();
        let path = match &self.pending_file {
            Some(path) => path,
            None => return Ok(output),
        };
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::SourceError {
            source_name: self.name.clone(),
            message: format!("{}: {}", path.to_string_lossy(), e),
        })?;
        let records: Vec<JsonPendingRecord> =
            serde_json::from_str(&content).map_err(|e| CoreError::SourceError {
                source_name: self.name.clone(),
                message: format!("{}: {}", path.to_string_lossy(), e),
            })?;

        for record in records {
            let mut entries = Vec::new();
            for entry in record.entries {
                match entry {
                    Entry::Balance(balance) => output.balances.push(balance),
                    Entry::Price(price) => output.prices.push(price),
                    other => entries.push(other),
                }
            }
            if !entries.is_empty() {
                output.pending.push(make_pending_entry(&self.name, entries));
            }
        }
        log::debug!(
            target: "beanrec::source",
            "source {} yielded {} pending entries",
            self.name,
            output.pending.len()
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanrec_model::{Amount, MetaValue, Transaction, DATE_KEY};
    use rust_decimal::Decimal;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn amount(s: &str, cur: &str) -> Amount {
        Amount::new(s.parse::<Decimal>().unwrap(), cur)
    }

    fn sample_transaction() -> Transaction {
        let mut txn = Transaction {
            date: date(2016, 8, 10),
            narration: Some("STARBUCKS".to_string()),
            ..Default::default()
        };
        let mut cleared = Posting::new("Liabilities:Credit-Card", Some(amount("-2.45", "USD")));
        cleared
            .meta
            .insert(DATE_KEY, MetaValue::Date(date(2016, 8, 10)));
        cleared
            .meta
            .insert("source_desc", MetaValue::Text("STARBUCKS".into()));
        txn.postings.push(cleared);
        txn.postings
            .push(Posting::new("Expenses:FIXME", Some(amount("2.45", "USD"))));
        txn
    }

    #[test]
    fn pending_id_is_stable() {
        let a = make_pending_entry("mint", vec![Entry::Transaction(sample_transaction())]);
        let b = make_pending_entry("mint", vec![Entry::Transaction(sample_transaction())]);
        assert_eq!(a.id, b.id);
        assert_eq!(a.date, date(2016, 8, 10));
        assert!(a.formatted.contains("STARBUCKS"));
    }

    #[test]
    fn default_is_cleared_needs_date_and_identity_key() {
        let source = JsonSource {
            name: "mint".to_string(),
            accounts: vec!["Liabilities:Credit-Card".to_string()],
            identity_keys: vec!["source_desc".to_string()],
            pending_file: None,
        };
        let txn = sample_transaction();
        assert!(source.is_cleared(&txn.postings[0]));
        assert!(!source.is_cleared(&txn.postings[1]));
        assert!(source.is_mine("Liabilities:Credit-Card"));
        assert!(!source.is_mine("Assets:Checking"));
    }

    #[test]
    fn json_source_splits_balances_from_transactions() {
        let records = vec![
            JsonPendingRecord {
                entries: vec![Entry::Transaction(sample_transaction())],
            },
            JsonPendingRecord {
                entries: vec![Entry::Balance(Balance {
                    date: date(2016, 8, 11),
                    account: "Liabilities:Credit-Card".to_string(),
                    amount: amount("-2.45", "USD"),
                })],
            },
        ];
        let path = std::env::temp_dir().join("beanrec-json-source-test.json");
        std::fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();

        let source = JsonSource {
            name: "mint".to_string(),
            accounts: vec![],
            identity_keys: vec!["source_desc".to_string()],
            pending_file: Some(path.clone()),
        };
        let output = source.pending().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(output.pending.len(), 1);
        assert_eq!(output.balances.len(), 1);
        assert!(output.prices.is_empty());
    }
}
