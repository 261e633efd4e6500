//! Candidate construction
//!
//! Turns matcher hypotheses into concrete candidates: fully specified
//! entry sets with unknown legs substituted, auto-opened accounts, and a
//! minimal textual change set against the affected ledger regions.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use beanrec_config::{AccountFileMap, MatchingConfig, OutputConfig};
use beanrec_model::{is_unknown_account, short_hash, Entry, Open, Transaction, FIXME_ACCOUNT};

use crate::changeset::{ChangeSet, ChangeSetBuilder};
use crate::error::CoreError;
use crate::ledger::LedgerSnapshot;
use crate::matcher::Hypothesis;
use crate::predict::unknown_account_group_numbers;
use crate::source::PendingEntry;

/// Directly user-editable descriptive fields of a candidate transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionProperties {
    pub payee: Option<String>,
    pub narration: Option<String>,
    pub tags: Vec<String>,
    pub links: Vec<String>,
}

/// Revisions applied through `change_candidate`; `None` keeps a field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateEdit {
    /// Resolved account per substitution site, in substitution order
    pub accounts: Option<Vec<String>>,
    pub payee: Option<String>,
    pub narration: Option<String>,
    pub tags: Option<Vec<String>>,
    pub links: Option<Vec<String>>,
}

impl CandidateEdit {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One unknown-account substitution site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSubstitution {
    /// Opaque placeholder token, unique within the candidate
    pub unique_name: String,
    /// Currently resolved account (chosen by the user or predicted)
    pub account_name: String,
    /// Sites sharing a group are resolved together
    pub group_number: usize,
    /// Unknown account name as it appeared in the entry
    pub original_name: String,
    /// Predictor output, sentinel on cold start
    pub predicted_name: String,
}

/// One proposed way of resolving a pending entry into the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub change_set: ChangeSet,
    pub new_entries: Vec<Entry>,
    pub substituted_accounts: Vec<AccountSubstitution>,
    /// Pending ids consumed when this candidate is accepted
    pub used_pending_ids: Vec<String>,
    /// Snapshot entry indexes of merged existing transactions
    pub used_existing: Vec<usize>,
    /// Pre-edit descriptive fields, exposed for editing
    pub original_properties: Option<TransactionProperties>,
    pub matched_postings: usize,
    pub date_distance: i64,
}

/// Generation-stamped ranked candidate set for one pending entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidates {
    pub generation: u64,
    pub pending_index: usize,
    pub pending_id: String,
    pub date: NaiveDate,
    pub candidates: Vec<Candidate>,
}

// ==================== Output file selection ====================

/// Decides which ledger file receives each kind of new entry
pub struct EntryFileSelector {
    default_file: String,
    price_file: Option<String>,
    transaction_map: Vec<(Regex, String)>,
    open_map: Vec<(Regex, String)>,
    balance_map: Vec<(Regex, String)>,
}

fn compile_map(maps: &[AccountFileMap], field: &str) -> Result<Vec<(Regex, String)>, CoreError> {
    maps.iter()
        .map(|map| {
            Regex::new(&map.pattern)
                .map(|re| (re, map.file.clone()))
                .map_err(|_| {
                    CoreError::ConfigError(beanrec_config::ConfigError::InvalidPattern {
                        field: field.to_string(),
                        pattern: map.pattern.clone(),
                    })
                })
        })
        .collect()
}

impl EntryFileSelector {
    pub fn from_config(output: &OutputConfig) -> Result<Self, CoreError> {
        Ok(Self {
            default_file: output.default_file.clone(),
            price_file: output.price_file.clone(),
            transaction_map: compile_map(&output.transaction_map, "output.transaction_map")?,
            open_map: compile_map(&output.open_map, "output.open_map")?,
            balance_map: compile_map(&output.balance_map, "output.balance_map")?,
        })
    }

    fn lookup<'s>(maps: &'s [(Regex, String)], account: &str) -> Option<&'s str> {
        maps.iter()
            .find(|(re, _)| re.is_match(account))
            .map(|(_, file)| file.as_str())
    }

    pub fn select(&self, entry: &Entry) -> &str {
        match entry {
            Entry::Open(open) => {
                Self::lookup(&self.open_map, &open.account).unwrap_or(&self.default_file)
            }
            Entry::Close(close) => {
                Self::lookup(&self.open_map, &close.account).unwrap_or(&self.default_file)
            }
            Entry::Transaction(txn) => txn
                .postings
                .iter()
                .find_map(|posting| Self::lookup(&self.transaction_map, &posting.account))
                .unwrap_or(&self.default_file),
            Entry::Balance(balance) => {
                Self::lookup(&self.balance_map, &balance.account).unwrap_or(&self.default_file)
            }
            Entry::Price(_) => self.price_file.as_deref().unwrap_or(&self.default_file),
        }
    }
}

// ==================== Builder ====================

/// Builds candidates from hypotheses against one snapshot
pub struct CandidateBuilder<'a> {
    snapshot: &'a LedgerSnapshot,
    matching: &'a MatchingConfig,
    selector: &'a EntryFileSelector,
}

impl<'a> CandidateBuilder<'a> {
    pub fn new(
        snapshot: &'a LedgerSnapshot,
        matching: &'a MatchingConfig,
        selector: &'a EntryFileSelector,
    ) -> Self {
        Self {
            snapshot,
            matching,
            selector,
        }
    }

    /// Build a candidate for a transaction hypothesis.
    ///
    /// `predictions` holds the predicted account per unknown group. Merged
    /// hypotheses whose postings fail to balance are rejected here and
    /// excluded from the ranked list; the standalone hypothesis is always
    /// retained as the fallback.
    pub fn build_transaction_candidate(
        &self,
        hypothesis: &Hypothesis,
        pending: &PendingEntry,
        pool: &[PendingEntry],
        predictions: &[String],
        edit: Option<&CandidateEdit>,
    ) -> Option<Candidate> {
        if !hypothesis.is_standalone() && !transaction_balances(&hypothesis.merged, self.matching.balance_epsilon) {
            log::debug!(
                target: "beanrec::candidate",
                "dropping unbalanced hypothesis for {}",
                pending.id
            );
            return None;
        }

        let original_properties = TransactionProperties {
            payee: hypothesis.merged.payee.clone(),
            narration: hypothesis.merged.narration.clone(),
            tags: hypothesis.merged.tags.clone(),
            links: hypothesis.merged.links.clone(),
        };

        let mut txn = hypothesis.merged.clone();
        if let Some(edit) = edit {
            if let Some(payee) = &edit.payee {
                txn.payee = Some(payee.clone());
            }
            if let Some(narration) = &edit.narration {
                txn.narration = Some(narration.clone());
            }
            if let Some(tags) = &edit.tags {
                txn.tags = tags.clone();
            }
            if let Some(links) = &edit.links {
                txn.links = links.clone();
            }
        }

        let group_numbers = unknown_account_group_numbers(&txn);
        let original_names: Vec<String> = txn
            .postings
            .iter()
            .filter(|posting| is_unknown_account(&posting.account))
            .map(|posting| posting.account.clone())
            .collect();
        let predicted_names: Vec<String> = group_numbers
            .iter()
            .map(|&group| {
                predictions
                    .get(group)
                    .cloned()
                    .unwrap_or_else(|| FIXME_ACCOUNT.to_string())
            })
            .collect();
        let resolved_names: Vec<String> = match edit.and_then(|e| e.accounts.as_ref()) {
            Some(accounts) => accounts.clone(),
            None => predicted_names.clone(),
        };
        if resolved_names.len() != group_numbers.len() {
            return None;
        }

        // Placeholder tokens are content-derived, so reruns are identical.
        let token_base = short_hash(&format!("{}\n{}", pending.id, pending.formatted));
        let substituted_accounts: Vec<AccountSubstitution> = resolved_names
            .iter()
            .enumerate()
            .map(|(i, account_name)| AccountSubstitution {
                unique_name: format!("Unknown-{}-{}", token_base, i),
                account_name: account_name.clone(),
                group_number: group_numbers[i],
                original_name: original_names[i].clone(),
                predicted_name: predicted_names[i].clone(),
            })
            .collect();

        let real_txn = substitute_unknown_accounts(&txn, &resolved_names);

        let mut builder = ChangeSetBuilder::new(self.snapshot);
        if hypothesis.used_existing.is_empty() {
            let entry = Entry::Transaction(real_txn);
            let file = self.selector.select(&entry).to_string();
            builder.add_entry(&file, entry);
        } else {
            let first = self.snapshot.entries[hypothesis.used_existing[0]].clone();
            builder.change_entry(first, Entry::Transaction(real_txn));
            for &entry_index in &hypothesis.used_existing[1..] {
                builder.remove_entry(self.snapshot.entries[entry_index].clone());
            }
        }
        self.stage_missing_opens(&mut builder);
        let change_set = builder.build();

        let mut used_pending_ids = vec![pending.id.clone()];
        used_pending_ids.extend(
            hypothesis
                .used_pending
                .iter()
                .filter_map(|&pool_index| pool.get(pool_index))
                .map(|other| other.id.clone()),
        );

        Some(Candidate {
            new_entries: change_set
                .new_entries
                .iter()
                .map(|spanned| spanned.entry.clone())
                .collect(),
            change_set,
            substituted_accounts,
            used_pending_ids,
            used_existing: hypothesis.used_existing.clone(),
            original_properties: Some(original_properties),
            matched_postings: hypothesis.matched_postings,
            date_distance: hypothesis.date_distance,
        })
    }

    /// Candidate for a pending entry that does not go through matching:
    /// balance/price groups and multi-entry imports are staged as-is.
    pub fn build_generic_candidate(&self, pending: &PendingEntry) -> Candidate {
        let mut builder = ChangeSetBuilder::new(self.snapshot);
        for entry in &pending.entries {
            let file = self.selector.select(entry).to_string();
            builder.add_entry(&file, entry.clone());
        }
        self.stage_missing_opens(&mut builder);
        let change_set = builder.build();

        Candidate {
            new_entries: change_set
                .new_entries
                .iter()
                .map(|spanned| spanned.entry.clone())
                .collect(),
            change_set,
            substituted_accounts: Vec::new(),
            used_pending_ids: vec![pending.id.clone()],
            used_existing: Vec::new(),
            original_properties: None,
            matched_postings: 0,
            date_distance: 0,
        }
    }

    /// Stage an open directive, dated at the earliest referencing entry,
    /// for every account the staged entries use that has none.
    fn stage_missing_opens(&self, builder: &mut ChangeSetBuilder) {
        let mut referenced: BTreeMap<String, (NaiveDate, Vec<String>)> = BTreeMap::new();
        for entry in builder.staged_new_entries() {
            match entry {
                Entry::Transaction(txn) => {
                    for posting in &txn.postings {
                        let slot = referenced
                            .entry(posting.account.clone())
                            .or_insert((txn.date, Vec::new()));
                        slot.0 = slot.0.min(txn.date);
                        if let Some(amount) = &posting.amount {
                            if !slot.1.contains(&amount.currency) {
                                slot.1.push(amount.currency.clone());
                            }
                        }
                    }
                }
                Entry::Balance(balance) => {
                    let slot = referenced
                        .entry(balance.account.clone())
                        .or_insert((balance.date, Vec::new()));
                    slot.0 = slot.0.min(balance.date);
                    if !slot.1.contains(&balance.amount.currency) {
                        slot.1.push(balance.amount.currency.clone());
                    }
                }
                _ => {}
            }
        }

        for (account, (date, mut currencies)) in referenced {
            if self.snapshot.has_open(&account) {
                continue;
            }
            currencies.sort();
            let open = Entry::Open(Open {
                date,
                account,
                currencies,
                meta: Default::default(),
            });
            let file = self.selector.select(&open).to_string();
            builder.add_entry(&file, open);
        }
    }
}

/// Replace unknown accounts in posting order with the resolved names
fn substitute_unknown_accounts(txn: &Transaction, accounts: &[String]) -> Transaction {
    let mut result = txn.clone();
    let mut next = 0usize;
    for posting in result.postings.iter_mut() {
        if is_unknown_account(&posting.account) {
            if let Some(account) = accounts.get(next) {
                posting.account = account.clone();
            }
            next += 1;
        }
    }
    result
}

/// Balance invariant: per currency, posting weights must sum to zero
/// within epsilon; a posting with elided units is the plug and absorbs
/// any residual.
pub fn transaction_balances(txn: &Transaction, epsilon: Decimal) -> bool {
    if txn.postings.iter().any(|posting| posting.amount.is_none()) {
        return true;
    }
    let mut residuals: HashMap<String, Decimal> = HashMap::new();
    for posting in &txn.postings {
        if let Some(weight) = posting.weight() {
            *residuals.entry(weight.currency).or_default() += weight.number;
        }
    }
    residuals.values().all(|residual| residual.abs() <= epsilon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangeOp;
    use crate::clearing::ClearingIndex;
    use crate::ledger::MemoryLedger;
    use crate::matcher::Matcher;
    use crate::source::{make_pending_entry, JsonSource, SourceRef};
    use beanrec_model::{Amount, Balance, MetaValue, Posting, DATE_KEY};
    use std::sync::Arc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn amount(s: &str, cur: &str) -> Amount {
        Amount::new(s.parse::<Decimal>().unwrap(), cur)
    }

    fn selector() -> EntryFileSelector {
        EntryFileSelector::from_config(&OutputConfig::default()).unwrap()
    }

    fn sources_for(accounts: &[&str]) -> Vec<SourceRef> {
        vec![Arc::new(JsonSource::from_config(
            &beanrec_config::SourceConfig {
                name: "mint".to_string(),
                accounts: accounts.iter().map(|s| s.to_string()).collect(),
                identity_keys: vec!["source_desc".to_string()],
                pending_file: None,
            },
        ))]
    }

    fn starbucks_pending() -> PendingEntry {
        let mut cleared = Posting::new("Liabilities:Credit-Card", Some(amount("-2.45", "USD")));
        cleared
            .meta
            .insert(DATE_KEY, MetaValue::Date(date(2016, 8, 10)));
        cleared
            .meta
            .insert("source_desc", MetaValue::Text("STARBUCKS".into()));
        make_pending_entry(
            "mint",
            vec![Entry::Transaction(Transaction {
                date: date(2016, 8, 10),
                narration: Some("STARBUCKS".to_string()),
                postings: vec![
                    cleared,
                    Posting::new(FIXME_ACCOUNT, Some(amount("2.45", "USD"))),
                ],
                ..Default::default()
            })],
        )
    }

    fn standalone_hypothesis(pending: &PendingEntry) -> Hypothesis {
        Hypothesis {
            merged: pending.entries[0].as_transaction().unwrap().clone(),
            used_existing: Vec::new(),
            used_pending: Vec::new(),
            matched_postings: 0,
            date_distance: 0,
        }
    }

    #[test]
    fn standalone_candidate_with_prediction_and_auto_open() {
        let snapshot = MemoryLedger::from_entries("main.bean", vec![]).into_snapshot();
        let matching = MatchingConfig::default();
        let selector = selector();
        let builder = CandidateBuilder::new(&snapshot, &matching, &selector);
        let pending = starbucks_pending();

        let candidate = builder
            .build_transaction_candidate(
                &standalone_hypothesis(&pending),
                &pending,
                &[],
                &["Expenses:Coffee".to_string()],
                None,
            )
            .unwrap();

        assert_eq!(candidate.used_pending_ids, vec![pending.id.clone()]);
        assert_eq!(candidate.substituted_accounts.len(), 1);
        let substitution = &candidate.substituted_accounts[0];
        assert_eq!(substitution.group_number, 0);
        assert_eq!(substitution.original_name, FIXME_ACCOUNT);
        assert_eq!(substitution.predicted_name, "Expenses:Coffee");
        assert_eq!(substitution.account_name, "Expenses:Coffee");

        // The transaction plus auto-opens for both referenced accounts.
        let opened: Vec<&str> = candidate
            .new_entries
            .iter()
            .filter_map(|entry| match entry {
                Entry::Open(open) => Some(open.account.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(opened, vec!["Expenses:Coffee", "Liabilities:Credit-Card"]);
        assert!(candidate
            .new_entries
            .iter()
            .any(|entry| matches!(entry, Entry::Transaction(t)
                if t.involves_account("Expenses:Coffee"))));
    }

    #[test]
    fn cold_start_falls_back_to_sentinel() {
        let snapshot = MemoryLedger::from_entries("main.bean", vec![]).into_snapshot();
        let matching = MatchingConfig::default();
        let selector = selector();
        let builder = CandidateBuilder::new(&snapshot, &matching, &selector);
        let pending = starbucks_pending();

        let candidate = builder
            .build_transaction_candidate(
                &standalone_hypothesis(&pending),
                &pending,
                &[],
                &[FIXME_ACCOUNT.to_string()],
                None,
            )
            .unwrap();
        assert_eq!(
            candidate.substituted_accounts[0].account_name,
            FIXME_ACCOUNT
        );
        // The sentinel itself gets an auto-open so the result still parses.
        assert!(candidate.new_entries.iter().any(|entry| matches!(
            entry,
            Entry::Open(open) if open.account == FIXME_ACCOUNT
        )));
    }

    #[test]
    fn merge_candidate_adds_metadata_to_existing_region() {
        let existing = Entry::Transaction(Transaction {
            date: date(2016, 8, 9),
            narration: Some("coffee with friends".to_string()),
            postings: vec![
                Posting::new("Liabilities:Credit-Card", Some(amount("-2.45", "USD"))),
                Posting::new("Expenses:Coffee", Some(amount("2.45", "USD"))),
            ],
            ..Default::default()
        });
        let snapshot = MemoryLedger::from_entries(
            "main.bean",
            vec![
                Entry::Open(Open {
                    date: date(2015, 1, 1),
                    account: "Liabilities:Credit-Card".to_string(),
                    currencies: vec![],
                    meta: Default::default(),
                }),
                Entry::Open(Open {
                    date: date(2015, 1, 1),
                    account: "Expenses:Coffee".to_string(),
                    currencies: vec![],
                    meta: Default::default(),
                }),
                existing,
            ],
        )
        .into_snapshot();
        let sources = sources_for(&["Liabilities:Credit-Card"]);
        let pool = vec![starbucks_pending()];
        let index = ClearingIndex::build(&snapshot, &sources, &["source_desc".to_string()], None);
        let matching = MatchingConfig::default();
        let matcher = Matcher::new(&matching, &snapshot, &index, &sources, &pool);
        let hypotheses = matcher.hypotheses(0);
        assert!(!hypotheses[0].is_standalone());

        let selector = selector();
        let builder = CandidateBuilder::new(&snapshot, &matching, &selector);
        let candidate = builder
            .build_transaction_candidate(&hypotheses[0], &pool[0], &pool, &[], None)
            .unwrap();

        // No unknown legs, so no substitutions; the change set touches the
        // existing transaction's region only, adding the metadata lines.
        assert!(candidate.substituted_accounts.is_empty());
        assert_eq!(candidate.change_set.files.len(), 1);
        assert_eq!(candidate.change_set.old_entries.len(), 1);
        let inserted: Vec<&str> = candidate.change_set.files[0]
            .regions
            .iter()
            .flat_map(|region| &region.changes)
            .filter(|(op, _)| *op == ChangeOp::Insert)
            .map(|(_, line)| line.as_str())
            .collect();
        assert_eq!(inserted, vec!["    date: 2016-08-10", "    source_desc: \"STARBUCKS\""]);
    }

    #[test]
    fn unbalanced_hypothesis_is_rejected() {
        let snapshot = MemoryLedger::from_entries("main.bean", vec![]).into_snapshot();
        let matching = MatchingConfig::default();
        let selector = selector();
        let builder = CandidateBuilder::new(&snapshot, &matching, &selector);
        let pending = starbucks_pending();

        let mut broken = standalone_hypothesis(&pending);
        broken.merged.postings[1].amount = Some(amount("2.46", "USD"));
        broken.used_existing = vec![0]; // not standalone any more
        broken.matched_postings = 1;
        // No entry 0 exists, but balance is checked first.
        assert!(builder
            .build_transaction_candidate(&broken, &pending, &[], &["Expenses:Coffee".to_string()], None)
            .is_none());
    }

    #[test]
    fn edit_overrides_accounts_and_narration() {
        let snapshot = MemoryLedger::from_entries("main.bean", vec![]).into_snapshot();
        let matching = MatchingConfig::default();
        let selector = selector();
        let builder = CandidateBuilder::new(&snapshot, &matching, &selector);
        let pending = starbucks_pending();

        let edit = CandidateEdit {
            accounts: Some(vec!["Expenses:Coffee:Treats".to_string()]),
            narration: Some("morning latte".to_string()),
            ..Default::default()
        };
        let candidate = builder
            .build_transaction_candidate(
                &standalone_hypothesis(&pending),
                &pending,
                &[],
                &["Expenses:Coffee".to_string()],
                Some(&edit),
            )
            .unwrap();
        assert_eq!(
            candidate.substituted_accounts[0].account_name,
            "Expenses:Coffee:Treats"
        );
        // The prediction is still reported for the UI.
        assert_eq!(
            candidate.substituted_accounts[0].predicted_name,
            "Expenses:Coffee"
        );
        assert!(candidate.new_entries.iter().any(|entry| matches!(
            entry,
            Entry::Transaction(t) if t.narration.as_deref() == Some("morning latte")
        )));
        // Original properties keep the pre-edit values.
        assert_eq!(
            candidate
                .original_properties
                .as_ref()
                .unwrap()
                .narration
                .as_deref(),
            Some("STARBUCKS")
        );
    }

    #[test]
    fn generic_candidate_stages_balances() {
        let snapshot = MemoryLedger::from_entries("main.bean", vec![]).into_snapshot();
        let matching = MatchingConfig::default();
        let selector = selector();
        let builder = CandidateBuilder::new(&snapshot, &matching, &selector);

        let pending = make_pending_entry(
            "mint",
            vec![Entry::Balance(Balance {
                date: date(2016, 8, 11),
                account: "Liabilities:Credit-Card".to_string(),
                amount: amount("-2.45", "USD"),
            })],
        );
        let candidate = builder.build_generic_candidate(&pending);
        assert!(candidate.substituted_accounts.is_empty());
        assert_eq!(candidate.used_pending_ids, vec![pending.id.clone()]);
        // Balance plus the auto-open.
        assert_eq!(candidate.new_entries.len(), 2);
    }

    #[test]
    fn placeholder_tokens_are_deterministic() {
        let snapshot = MemoryLedger::from_entries("main.bean", vec![]).into_snapshot();
        let matching = MatchingConfig::default();
        let selector = selector();
        let builder = CandidateBuilder::new(&snapshot, &matching, &selector);
        let pending = starbucks_pending();

        let build = || {
            builder
                .build_transaction_candidate(
                    &standalone_hypothesis(&pending),
                    &pending,
                    &[],
                    &["Expenses:Coffee".to_string()],
                    None,
                )
                .unwrap()
        };
        assert_eq!(
            build().substituted_accounts[0].unique_name,
            build().substituted_accounts[0].unique_name
        );
    }

    #[test]
    fn balance_invariant_with_plug() {
        let txn = Transaction {
            date: date(2016, 8, 1),
            postings: vec![
                Posting::new("Assets:Cash", Some(amount("-5.00", "USD"))),
                Posting::new("Expenses:Misc", None),
            ],
            ..Default::default()
        };
        assert!(transaction_balances(&txn, Decimal::new(5, 3)));

        let unbalanced = Transaction {
            date: date(2016, 8, 1),
            postings: vec![
                Posting::new("Assets:Cash", Some(amount("-5.00", "USD"))),
                Posting::new("Expenses:Misc", Some(amount("5.01", "USD"))),
            ],
            ..Default::default()
        };
        assert!(!transaction_balances(&unbalanced, Decimal::new(5, 3)));
    }
}
