//! Ledger store interface
//!
//! The engine never reads or writes ledger files itself: a `LedgerStore`
//! collaborator supplies the parsed entries plus the raw text lines needed
//! for diffing, and accepts change sets to apply. `MemoryLedger` is the
//! in-memory reference implementation used by the CLI driver and tests;
//! the file-backed store (with watch/reload) lives outside this crate.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use beanrec_model::{render_entry_lines, Entry, LineRange, Open, SpannedEntry, Transaction};

use crate::changeset::{apply_to_snapshot, ChangeSet};
use crate::error::{CoreError, JournalError};

/// Parsed ledger state plus raw text, as of one generation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// All entries, sorted by file then position
    pub entries: Vec<SpannedEntry>,
    /// Raw text lines per file
    pub files: BTreeMap<String, Vec<String>>,
    /// Non-fatal diagnostics from parsing
    pub errors: Vec<JournalError>,
}

impl LedgerSnapshot {
    pub fn file_lines(&self, file: &str) -> Option<&Vec<String>> {
        self.files.get(file)
    }

    /// Transactions with their entry indexes
    pub fn transactions(&self) -> impl Iterator<Item = (usize, &Transaction)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, spanned)| spanned.entry.as_transaction().map(|t| (i, t)))
    }

    /// Open directives keyed by account
    pub fn opens(&self) -> impl Iterator<Item = &Open> {
        self.entries.iter().filter_map(|spanned| match &spanned.entry {
            Entry::Open(open) => Some(open),
            _ => None,
        })
    }

    pub fn has_open(&self, account: &str) -> bool {
        self.opens().any(|open| open.account == account)
    }

    /// Chronological insertion line for a new entry of the given date,
    /// found by binary search over the file's entries.
    pub fn insertion_line(&self, file: &str, date: NaiveDate) -> usize {
        let file_entries: Vec<&SpannedEntry> = self
            .entries
            .iter()
            .filter(|spanned| spanned.file == file)
            .collect();
        let idx = file_entries.partition_point(|spanned| spanned.entry.date() <= date);
        if idx == 0 {
            file_entries.first().map(|e| e.span.start).unwrap_or(0)
        } else {
            file_entries[idx - 1].span.end
        }
    }
}

/// Store contract: supplies snapshots, accepts change sets
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Current parsed state plus raw text
    async fn snapshot(&self) -> Result<LedgerSnapshot, CoreError>;

    /// Apply a change set atomically
    async fn apply(&self, changes: &ChangeSet) -> Result<(), CoreError>;
}

/// Store reference type
pub type StoreRef = Arc<dyn LedgerStore>;

/// In-memory ledger store
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerSnapshot>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a single-file ledger from entries, rendered in order and
    /// separated by blank lines.
    pub fn from_entries(file: &str, entries: Vec<Entry>) -> Self {
        let ledger = Self::new();
        ledger.set_file(file, entries);
        ledger
    }

    /// Replace one file's content with rendered entries
    pub fn set_file(&self, file: &str, entries: Vec<Entry>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.entries.retain(|spanned| spanned.file != file);
        let mut lines: Vec<String> = Vec::new();
        for (pos, entry) in entries.iter().enumerate() {
            if pos > 0 {
                lines.push(String::new());
            }
            let entry_lines = render_entry_lines(entry);
            let start = lines.len();
            let end = start + entry_lines.len();
            lines.extend(entry_lines);
            state.entries.push(SpannedEntry {
                entry: entry.clone(),
                file: file.to_string(),
                span: LineRange::new(start, end),
            });
        }
        state.files.insert(file.to_string(), lines);
        state
            .entries
            .sort_by(|a, b| (&a.file, a.span.start).cmp(&(&b.file, b.span.start)));
    }

    /// Consume the store, yielding its snapshot
    pub fn into_snapshot(self) -> LedgerSnapshot {
        self.state.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn snapshot(&self) -> Result<LedgerSnapshot, CoreError> {
        Ok(self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn apply(&self, changes: &ChangeSet) -> Result<(), CoreError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        apply_to_snapshot(&mut state, changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanrec_model::{Amount, Posting};
    use rust_decimal::Decimal;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn txn(d: NaiveDate, narration: &str) -> Entry {
        let mut t = Transaction {
            date: d,
            narration: Some(narration.to_string()),
            ..Default::default()
        };
        t.postings.push(Posting::new(
            "Assets:Cash",
            Some(Amount::new(Decimal::new(-100, 2), "USD")),
        ));
        t.postings.push(Posting::new("Expenses:Misc", None));
        Entry::Transaction(t)
    }

    #[test]
    fn from_entries_assigns_spans() {
        let snapshot =
            MemoryLedger::from_entries("main.bean", vec![txn(date(2016, 1, 1), "a"), txn(date(2016, 1, 2), "b")])
                .into_snapshot();
        assert_eq!(snapshot.entries.len(), 2);
        let lines = snapshot.file_lines("main.bean").unwrap();
        for spanned in &snapshot.entries {
            assert_eq!(
                lines[spanned.span.start..spanned.span.end].to_vec(),
                render_entry_lines(&spanned.entry)
            );
        }
        // Blank separator between the two entries.
        assert!(lines[snapshot.entries[0].span.end].is_empty());
    }

    #[test]
    fn insertion_line_binary_search() {
        let snapshot = MemoryLedger::from_entries(
            "main.bean",
            vec![
                txn(date(2016, 1, 1), "a"),
                txn(date(2016, 1, 10), "b"),
                txn(date(2016, 1, 20), "c"),
            ],
        )
        .into_snapshot();
        // Before everything.
        assert_eq!(snapshot.insertion_line("main.bean", date(2015, 12, 1)), 0);
        // Between b and c.
        assert_eq!(
            snapshot.insertion_line("main.bean", date(2016, 1, 15)),
            snapshot.entries[1].span.end
        );
        // After everything.
        assert_eq!(
            snapshot.insertion_line("main.bean", date(2016, 2, 1)),
            snapshot.entries[2].span.end
        );
        // Unknown file.
        assert_eq!(snapshot.insertion_line("other.bean", date(2016, 1, 1)), 0);
    }

    #[test]
    fn has_open_checks_account() {
        let snapshot = MemoryLedger::from_entries(
            "main.bean",
            vec![Entry::Open(Open {
                date: date(2015, 1, 1),
                account: "Assets:Cash".to_string(),
                currencies: vec![],
                meta: Default::default(),
            })],
        )
        .into_snapshot();
        assert!(snapshot.has_open("Assets:Cash"));
        assert!(!snapshot.has_open("Assets:Checking"));
    }
}
