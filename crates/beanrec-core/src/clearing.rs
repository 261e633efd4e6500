//! Clearing index over ledger postings
//!
//! Answers two questions fast: "is external identity key K already present
//! in the ledger" and "which postings to account A around date D are still
//! uncleared". Built by scanning all ledger postings once; rebuilt whenever
//! the ledger changes.

use std::collections::{HashMap, HashSet};

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use beanrec_model::{
    account_ancestors, is_unknown_account, Amount, Entry, MetaValue, CLEARED_BEFORE_KEY,
};

use crate::error::JournalError;
use crate::ledger::LedgerSnapshot;
use crate::source::{is_posting_cleared, SourceRef};

/// Transaction flag marking padding entries, which are never reported
const FLAG_PADDING: &str = "P";

/// Position of a posting within a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingKey {
    pub entry_index: usize,
    pub posting_index: usize,
}

/// Posting facts the index keeps hot
#[derive(Debug, Clone)]
pub struct IndexedPosting {
    pub key: PostingKey,
    pub account: String,
    /// Posting date (metadata override resolved)
    pub date: NaiveDate,
    pub weight: Option<Amount>,
    pub cleared: bool,
    pub has_cost: bool,
}

/// A posting to an authoritative account with no confirmed external record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnclearedPosting {
    pub key: PostingKey,
    pub account: String,
    pub date: NaiveDate,
    pub amount: Option<Amount>,
    pub file: String,
    pub line: usize,
}

/// Index of ledger postings by account, weight, and identity metadata
pub struct ClearingIndex {
    postings: Vec<IndexedPosting>,
    /// Posting indexes per account, ordered by date then file position
    by_account: HashMap<String, Vec<usize>>,
    /// Posting indexes per weight currency, ordered by weight number
    by_currency: HashMap<String, Vec<usize>>,
    identities: HashSet<(String, MetaValue)>,
    /// Explicit cleared_before declarations from open directives
    cleared_before: HashMap<String, NaiveDate>,
    errors: Vec<JournalError>,
}

impl ClearingIndex {
    /// Scan the snapshot once. Entries in `skip_file` (the ignore store)
    /// are not indexed: they must not match, train, or be reported.
    pub fn build(
        snapshot: &LedgerSnapshot,
        sources: &[SourceRef],
        identity_keys: &[String],
        skip_file: Option<&str>,
    ) -> Self {
        let mut index = Self {
            postings: Vec::new(),
            by_account: HashMap::new(),
            by_currency: HashMap::new(),
            identities: HashSet::new(),
            cleared_before: HashMap::new(),
            errors: Vec::new(),
        };

        for (entry_index, spanned) in snapshot.entries.iter().enumerate() {
            if skip_file == Some(spanned.file.as_str()) {
                continue;
            }
            match &spanned.entry {
                Entry::Open(open) => {
                    if open.meta.get(CLEARED_BEFORE_KEY).is_some() {
                        match open.meta.cleared_before() {
                            Some(date) => {
                                index.cleared_before.insert(open.account.clone(), date);
                            }
                            None => index.errors.push(
                                JournalError::error(format!(
                                    "{}: expected cleared_before value to be a date",
                                    open.account
                                ))
                                .with_location(spanned.file.clone(), spanned.span.start),
                            ),
                        }
                    }
                }
                Entry::Transaction(txn) => {
                    for (posting_index, posting) in txn.postings.iter().enumerate() {
                        let slot = index.postings.len();
                        let cleared = is_posting_cleared(sources, posting);
                        index.postings.push(IndexedPosting {
                            key: PostingKey {
                                entry_index,
                                posting_index,
                            },
                            account: posting.account.clone(),
                            date: txn.posting_date(posting),
                            weight: posting.weight(),
                            cleared,
                            has_cost: posting.cost.is_some(),
                        });
                        index
                            .by_account
                            .entry(posting.account.clone())
                            .or_default()
                            .push(slot);
                        if let Some(weight) = &index.postings[slot].weight {
                            index
                                .by_currency
                                .entry(weight.currency.clone())
                                .or_default()
                                .push(slot);
                        }
                        if !is_unknown_account(&posting.account) {
                            for key in identity_keys {
                                if let Some(value) = posting.meta.get(key) {
                                    index.identities.insert((key.clone(), value.clone()));
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        for slots in index.by_account.values_mut() {
            slots.sort_by_key(|&slot| (index.postings[slot].date, index.postings[slot].key.entry_index));
        }
        for slots in index.by_currency.values_mut() {
            slots.sort_by(|&a, &b| {
                let pa = &index.postings[a];
                let pb = &index.postings[b];
                let na = pa.weight.as_ref().map(|w| w.number).unwrap_or(Decimal::ZERO);
                let nb = pb.weight.as_ref().map(|w| w.number).unwrap_or(Decimal::ZERO);
                (na, pa.date, pa.key.entry_index).cmp(&(nb, pb.date, pb.key.entry_index))
            });
        }

        log::debug!(
            target: "beanrec::clearing",
            "indexed {} postings, {} identity pairs",
            index.postings.len(),
            index.identities.len()
        );
        index
    }

    pub fn posting(&self, slot: usize) -> &IndexedPosting {
        &self.postings[slot]
    }

    /// O(1) membership test on observed identity metadata
    pub fn has_identity(&self, key: &str, value: &MetaValue) -> bool {
        self.identities.contains(&(key.to_string(), value.clone()))
    }

    /// Uncleared postings to an account within the date window, ordered by
    /// date then file position
    pub fn lookup_uncleared(
        &self,
        account: &str,
        date: NaiveDate,
        window_days: i64,
    ) -> Vec<&IndexedPosting> {
        let slots = match self.by_account.get(account) {
            Some(slots) => slots,
            None => return Vec::new(),
        };
        let lower = date - Duration::days(window_days);
        let upper = date + Duration::days(window_days);
        let start = slots.partition_point(|&slot| self.postings[slot].date < lower);
        slots[start..]
            .iter()
            .map(|&slot| &self.postings[slot])
            .take_while(|posting| posting.date <= upper)
            .filter(|posting| !posting.cleared)
            .collect()
    }

    /// Postings whose weight equals `weight` (within `tolerance` when a cost
    /// basis is involved on either side) and whose date is within the window.
    pub fn find_weight_matches(
        &self,
        weight: &Amount,
        date: NaiveDate,
        window_days: i64,
        tolerance: Decimal,
        query_has_cost: bool,
    ) -> Vec<&IndexedPosting> {
        let slots = match self.by_currency.get(&weight.currency) {
            Some(slots) => slots,
            None => return Vec::new(),
        };
        let lower_bound = weight.number - tolerance;
        let upper_bound = weight.number + tolerance;
        let number_of = |slot: usize| {
            self.postings[slot]
                .weight
                .as_ref()
                .map(|w| w.number)
                .unwrap_or(Decimal::ZERO)
        };
        let start = slots.partition_point(|&slot| number_of(slot) < lower_bound);
        let min_date = date - Duration::days(window_days);
        let max_date = date + Duration::days(window_days);
        slots[start..]
            .iter()
            .take_while(|&&slot| number_of(slot) <= upper_bound)
            .map(|&slot| &self.postings[slot])
            .filter(|posting| posting.date >= min_date && posting.date <= max_date)
            .filter(|posting| {
                // Exact equality unless a lot with a cost basis is involved.
                posting.has_cost
                    || query_has_cost
                    || posting
                        .weight
                        .as_ref()
                        .map(|w| w.number == weight.number)
                        .unwrap_or(false)
            })
            .collect()
    }

    /// Effective cleared_before bound, inherited from ancestor accounts
    pub fn effective_cleared_before(&self, account: &str) -> Option<NaiveDate> {
        let mut bound = self.cleared_before.get(account).copied();
        for ancestor in account_ancestors(account) {
            if let Some(date) = self.cleared_before.get(ancestor) {
                bound = Some(bound.map_or(*date, |b| b.max(*date)));
            }
        }
        bound
    }

    /// Postings to authoritative accounts that no source recognizes as
    /// cleared. This is a primary data-quality signal for the user.
    pub fn uncleared_report(
        &self,
        snapshot: &LedgerSnapshot,
        sources: &[SourceRef],
    ) -> Vec<UnclearedPosting> {
        let mut report = Vec::new();
        for posting in &self.postings {
            if posting.cleared {
                continue;
            }
            if !sources.iter().any(|s| s.is_mine(&posting.account)) {
                continue;
            }
            if posting
                .weight
                .as_ref()
                .map(|w| w.is_zero())
                .unwrap_or(false)
            {
                continue;
            }
            let spanned = &snapshot.entries[posting.key.entry_index];
            if let Entry::Transaction(txn) = &spanned.entry {
                if txn.flag.as_deref() == Some(FLAG_PADDING) {
                    continue;
                }
            }
            if let Some(bound) = self.effective_cleared_before(&posting.account) {
                if posting.date < bound {
                    continue;
                }
            }
            report.push(UnclearedPosting {
                key: posting.key,
                account: posting.account.clone(),
                date: posting.date,
                amount: posting.weight.clone(),
                file: spanned.file.clone(),
                line: spanned.span.start,
            });
        }
        report.sort_by_key(|p| (p.date, p.key.entry_index, p.key.posting_index));
        report
    }

    pub fn errors(&self) -> &[JournalError] {
        &self.errors
    }
}
