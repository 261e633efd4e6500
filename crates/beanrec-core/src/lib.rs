//! Core reconciliation and candidate-generation logic
//!
//! The `Reconciler` owns the in-memory ledger snapshot and pending pool
//! for the lifetime of a session. Candidate computation is read-only
//! against a generation-stamped snapshot and may run on a background
//! worker; results computed against a superseded generation are discarded
//! and recomputed, never merged with newer data.

pub mod candidate;
pub mod changeset;
pub mod clearing;
pub mod error;
pub mod ledger;
pub mod matcher;
pub mod predict;
pub mod session;
pub mod source;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use regex::Regex;
use tokio::sync::RwLock;

use beanrec_config::Config;
use beanrec_model::{
    is_unknown_account, render_entry, short_hash, Amount, Entry, FIXME_ACCOUNT,
};

pub use candidate::{
    AccountSubstitution, Candidate, CandidateBuilder, CandidateEdit, Candidates,
    EntryFileSelector, TransactionProperties,
};
pub use changeset::{ChangeOp, ChangeSet, FileChange, RegionChange};
pub use clearing::{ClearingIndex, PostingKey, UnclearedPosting};
pub use error::{CoreError, CoreResult, ErrorCode, JournalError, Severity};
pub use ledger::{LedgerSnapshot, LedgerStore, MemoryLedger, StoreRef};
pub use matcher::{Hypothesis, Matcher};
pub use predict::{Classifier, DecisionTreeClassifier, Example, FeatureExtractor};
pub use session::{Session, SessionPhase};
pub use source::{
    is_posting_cleared, make_pending_entry, JsonSource, PendingEntry, Source, SourceOutput,
    SourceRef,
};

use crate::matcher::single_transaction;
use crate::predict::features;

/// Source name attached to re-imported journal transactions
const JOURNAL_SOURCE: &str = "journal";

/// Result of accepting (or ignoring) a candidate
#[derive(Debug, Clone)]
pub struct AcceptResult {
    pub new_entries: Vec<Entry>,
    pub modified_files: Vec<String>,
}

struct EngineState {
    loaded: bool,
    snapshot: Arc<LedgerSnapshot>,
    index: Arc<ClearingIndex>,
    pending: Arc<Vec<PendingEntry>>,
    classifier: Arc<dyn Classifier>,
    uncleared: Arc<Vec<UnclearedPosting>>,
    errors: Arc<Vec<JournalError>>,
    ignored_entry_ids: HashSet<String>,
    session: Session,
}

/// Cheap generation-stamped view for read-only candidate computation
#[derive(Clone)]
pub struct EngineSnapshot {
    pub generation: u64,
    pub pending_index: usize,
    snapshot: Arc<LedgerSnapshot>,
    index: Arc<ClearingIndex>,
    pending: Arc<Vec<PendingEntry>>,
    classifier: Arc<dyn Classifier>,
    config: Arc<Config>,
    sources: Arc<Vec<SourceRef>>,
    selector: Arc<EntryFileSelector>,
    extractor: Arc<FeatureExtractor>,
}

impl EngineSnapshot {
    pub fn pending(&self) -> &[PendingEntry] {
        &self.pending
    }

    pub fn ledger(&self) -> &LedgerSnapshot {
        &self.snapshot
    }

    /// Predicted account per unknown group of a transaction; the sentinel
    /// stands in wherever the classifier has nothing to say.
    fn predictions_for(&self, txn: &beanrec_model::Transaction) -> Vec<String> {
        self.extractor
            .group_prediction_inputs(txn, &self.sources)
            .into_iter()
            .map(|input| {
                input
                    .and_then(|input| self.classifier.predict(&features(&input)))
                    .unwrap_or_else(|| FIXME_ACCOUNT.to_string())
            })
            .collect()
    }

    /// Ranked candidates for the current pending entry
    pub fn compute_candidates(&self) -> CoreResult<Candidates> {
        self.compute_candidates_for(self.pending_index, None)
    }

    /// Ranked candidates for a pending entry, optionally rebuilding one
    /// candidate with user edits applied
    pub fn compute_candidates_for(
        &self,
        pending_index: usize,
        edit: Option<(usize, &CandidateEdit)>,
    ) -> CoreResult<Candidates> {
        let pending = self
            .pending
            .get(pending_index)
            .ok_or(CoreError::PendingNotFound {
                index: pending_index,
            })?;

        let builder = CandidateBuilder::new(&self.snapshot, &self.config.matching, &self.selector);
        let mut candidates = Vec::new();

        if single_transaction(pending).is_some() {
            let matcher = Matcher::new(
                &self.config.matching,
                &self.snapshot,
                &self.index,
                &self.sources,
                &self.pending,
            );
            let hypotheses = matcher.hypotheses(pending_index);
            for (i, hypothesis) in hypotheses.iter().enumerate() {
                let predictions = self.predictions_for(&hypothesis.merged);
                let candidate_edit = match &edit {
                    Some((edit_index, edit)) if *edit_index == i => Some(*edit),
                    _ => None,
                };
                let had_edit = candidate_edit.is_some();
                match builder.build_transaction_candidate(
                    hypothesis,
                    pending,
                    &self.pending,
                    &predictions,
                    candidate_edit,
                ) {
                    Some(candidate) => candidates.push(candidate),
                    None if had_edit => {
                        return Err(CoreError::InvalidCommand {
                            message: "substituted account list does not match the candidate"
                                .to_string(),
                        })
                    }
                    None => {}
                }
            }
        } else {
            candidates.push(builder.build_generic_candidate(pending));
        }

        Ok(Candidates {
            generation: self.generation,
            pending_index,
            pending_id: pending.id.clone(),
            date: pending.date,
            candidates,
        })
    }
}

/// The reconciliation engine: single logical owner of ledger and
/// pending-pool state, coordinating index, matcher, builder, predictor,
/// and session.
pub struct Reconciler {
    config: Arc<Config>,
    store: StoreRef,
    sources: Arc<Vec<SourceRef>>,
    selector: Arc<EntryFileSelector>,
    extractor: Arc<FeatureExtractor>,
    state: RwLock<EngineState>,
}

impl Reconciler {
    pub fn new(config: Config, store: StoreRef, sources: Vec<SourceRef>) -> CoreResult<Self> {
        let selector = EntryFileSelector::from_config(&config.output)?;
        let extractor = FeatureExtractor::new(&config.classifier)?;
        Ok(Self {
            config: Arc::new(config),
            store,
            sources: Arc::new(sources),
            selector: Arc::new(selector),
            extractor: Arc::new(extractor),
            state: RwLock::new(EngineState {
                loaded: false,
                snapshot: Arc::new(LedgerSnapshot::default()),
                index: Arc::new(ClearingIndex::build(
                    &LedgerSnapshot::default(),
                    &[],
                    &[],
                    None,
                )),
                pending: Arc::new(Vec::new()),
                classifier: Arc::new(DecisionTreeClassifier::default()),
                uncleared: Arc::new(Vec::new()),
                errors: Arc::new(Vec::new()),
                ignored_entry_ids: HashSet::new(),
                session: Session::new(),
            }),
        })
    }

    /// Engine with one `JsonSource` per configured source
    pub fn with_json_sources(config: Config, store: StoreRef) -> CoreResult<Self> {
        let sources: Vec<SourceRef> = config
            .sources
            .iter()
            .map(|source| Arc::new(JsonSource::from_config(source)) as SourceRef)
            .collect();
        Self::new(config, store, sources)
    }

    /// Load (or reload) the ledger and assemble the pending pool
    pub async fn load(&self) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let first_load = !state.loaded;
        self.refresh(&mut state).await?;
        state.loaded = true;
        if !first_load {
            state.session.record_mutation();
        }
        Ok(())
    }

    /// Current generation-stamped view
    pub async fn snapshot(&self) -> CoreResult<EngineSnapshot> {
        let state = self.state.read().await;
        if !state.loaded {
            return Err(CoreError::NotLoaded);
        }
        Ok(self.make_snapshot(&state))
    }

    fn make_snapshot(&self, state: &EngineState) -> EngineSnapshot {
        EngineSnapshot {
            generation: state.session.generation(),
            pending_index: state.session.pending_index(),
            snapshot: state.snapshot.clone(),
            index: state.index.clone(),
            pending: state.pending.clone(),
            classifier: state.classifier.clone(),
            config: self.config.clone(),
            sources: self.sources.clone(),
            selector: self.selector.clone(),
            extractor: self.extractor.clone(),
        }
    }

    /// Candidates for the current pending entry, computed off the async
    /// runtime. A computation overtaken by a newer generation is thrown
    /// away and restarted against the fresh snapshot.
    pub async fn candidates(&self) -> CoreResult<Candidates> {
        loop {
            let view = self.snapshot().await?;
            let generation = view.generation;
            let result =
                tokio::task::spawn_blocking(move || view.compute_candidates())
                    .await
                    .map_err(|e| CoreError::StoreError {
                        message: format!("candidate worker failed: {}", e),
                    })??;
            let mut state = self.state.write().await;
            if state.session.generation() != generation {
                log::debug!(
                    target: "beanrec::engine",
                    "discarding candidates for stale generation {}",
                    generation
                );
                continue;
            }
            state.session.mark_ready();
            return Ok(result);
        }
    }

    /// Rebuild one candidate with user-edited fields or accounts
    pub async fn change_candidate(
        &self,
        candidates: &Candidates,
        candidate_index: usize,
        edit: &CandidateEdit,
    ) -> CoreResult<Candidates> {
        let state = self.state.read().await;
        state.session.check_generation(candidates.generation)?;
        if candidate_index >= candidates.candidates.len() {
            return Err(CoreError::CandidateNotFound {
                index: candidate_index,
            });
        }
        self.make_snapshot(&state)
            .compute_candidates_for(candidates.pending_index, Some((candidate_index, edit)))
    }

    /// Apply a candidate's change set to the ledger, retire the consumed
    /// pending entries, and retrain incrementally.
    pub async fn accept(
        &self,
        candidates: &Candidates,
        candidate_index: usize,
    ) -> CoreResult<AcceptResult> {
        let mut state = self.state.write().await;
        state.session.check_generation(candidates.generation)?;
        let candidate =
            candidates
                .candidates
                .get(candidate_index)
                .ok_or(CoreError::CandidateNotFound {
                    index: candidate_index,
                })?;

        self.store.apply(&candidate.change_set).await?;

        let used: HashSet<&String> = candidate.used_pending_ids.iter().collect();
        let remaining: Vec<PendingEntry> = state
            .pending
            .iter()
            .filter(|pending| !used.contains(&pending.id))
            .cloned()
            .collect();
        log::info!(
            target: "beanrec::engine",
            "accepted candidate for {} ({} pending remain)",
            candidates.pending_id,
            remaining.len()
        );

        state.session.record_accept(remaining.len());
        self.refresh(&mut state).await?;

        Ok(AcceptResult {
            new_entries: candidate.new_entries.clone(),
            modified_files: candidate
                .change_set
                .files
                .iter()
                .map(|file| file.file.clone())
                .collect(),
        })
    }

    /// Write the minimized (FIXME'd) form of the consumed pending entries
    /// into the ignore store instead of the main ledger. Future runs
    /// re-derive the identical pending entry and suppress it.
    pub async fn ignore(
        &self,
        candidates: &Candidates,
        candidate_index: usize,
    ) -> CoreResult<AcceptResult> {
        let mut state = self.state.write().await;
        state.session.check_generation(candidates.generation)?;
        let candidate =
            candidates
                .candidates
                .get(candidate_index)
                .ok_or(CoreError::CandidateNotFound {
                    index: candidate_index,
                })?;

        let used: HashSet<&String> = candidate.used_pending_ids.iter().collect();
        let ignore_file = self.config.output.ignore_file.clone();
        let mut builder = changeset::ChangeSetBuilder::new(&state.snapshot);
        for pending in state.pending.iter().filter(|p| used.contains(&p.id)) {
            for entry in &pending.entries {
                builder.add_entry(&ignore_file, entry.clone());
            }
            // A re-imported journal transaction moves out of the ledger.
            if let Some(entry_index) = pending.journal_entry {
                builder.remove_entry(state.snapshot.entries[entry_index].clone());
            }
        }
        let change_set = builder.build();
        self.store.apply(&change_set).await?;

        let remaining: Vec<PendingEntry> = state
            .pending
            .iter()
            .filter(|pending| !used.contains(&pending.id))
            .cloned()
            .collect();
        log::info!(
            target: "beanrec::engine",
            "ignored {} ({} pending remain)",
            candidates.pending_id,
            remaining.len()
        );

        state.session.record_ignore(remaining.len());
        self.refresh(&mut state).await?;

        Ok(AcceptResult {
            new_entries: change_set
                .new_entries
                .iter()
                .map(|spanned| spanned.entry.clone())
                .collect(),
            modified_files: vec![ignore_file],
        })
    }

    /// Advance to the next pending entry without touching the ledger
    pub async fn skip(&self) -> CoreResult<usize> {
        let mut state = self.state.write().await;
        if !state.loaded {
            return Err(CoreError::NotLoaded);
        }
        let len = state.pending.len();
        state.session.record_skip(len);
        Ok(state.session.pending_index())
    }

    /// Jump to a specific pending entry
    pub async fn select_pending(&self, index: usize) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let len = state.pending.len();
        state.session.set_index(index, len)
    }

    /// Explicit user-triggered retrain
    pub async fn retrain(&self) -> CoreResult<usize> {
        let mut state = self.state.write().await;
        if !state.loaded {
            return Err(CoreError::NotLoaded);
        }
        let count = self.train_classifier(&mut state);
        state.session.record_mutation();
        Ok(count)
    }

    pub async fn session(&self) -> Session {
        self.state.read().await.session.clone()
    }

    pub async fn pending(&self) -> Arc<Vec<PendingEntry>> {
        self.state.read().await.pending.clone()
    }

    pub async fn num_pending(&self) -> usize {
        self.state.read().await.pending.len()
    }

    /// Uncleared postings report
    pub async fn uncleared_postings(&self) -> Arc<Vec<UnclearedPosting>> {
        self.state.read().await.uncleared.clone()
    }

    /// Journal and source diagnostics, errors before warnings
    pub async fn journal_errors(&self) -> Arc<Vec<JournalError>> {
        self.state.read().await.errors.clone()
    }

    // ==================== Internal ====================

    fn identity_keys(&self) -> Vec<String> {
        self.config.identity_keys()
    }

    fn train_classifier(&self, state: &mut EngineState) -> usize {
        let ignore_file = self.config.output.ignore_file.as_str();
        let mut examples: Vec<Example> = Vec::new();
        for spanned in state.snapshot.entries.iter() {
            if spanned.file == ignore_file {
                continue;
            }
            if let Entry::Transaction(txn) = &spanned.entry {
                self.extractor
                    .extract_examples_from(txn, &self.sources, &mut examples);
            }
        }
        let mut classifier = DecisionTreeClassifier::new(self.config.classifier.max_depth);
        classifier.train(&examples);
        state.classifier = Arc::new(classifier);
        log::info!(
            target: "beanrec::engine",
            "trained classifier with {} examples",
            examples.len()
        );
        examples.len()
    }

    /// Rebuild snapshot, clearing index, pending pool, reports, and
    /// classifier from the store. All mutations funnel through here.
    async fn refresh(&self, state: &mut EngineState) -> CoreResult<()> {
        let snapshot = Arc::new(self.store.snapshot().await?);
        let identity_keys = self.identity_keys();
        let ignore_file = self.config.output.ignore_file.clone();
        let index = Arc::new(ClearingIndex::build(
            &snapshot,
            &self.sources,
            &identity_keys,
            Some(ignore_file.as_str()),
        ));

        let mut errors: Vec<JournalError> = snapshot.errors.clone();
        errors.extend(index.errors().iter().cloned());

        // Entries already written to the ignore store, hashed on their
        // rendered form; pending entries matching them are suppressed.
        state.ignored_entry_ids = snapshot
            .entries
            .iter()
            .filter(|spanned| spanned.file == ignore_file)
            .map(|spanned| short_hash(&render_entry(&spanned.entry)))
            .collect();

        let account_re = match &self.config.account_pattern {
            Some(pattern) => Some(Regex::new(pattern).map_err(|_| {
                CoreError::ConfigError(beanrec_config::ConfigError::InvalidPattern {
                    field: "account_pattern".to_string(),
                    pattern: pattern.clone(),
                })
            })?),
            None => None,
        };

        let mut balance_keys: HashSet<(NaiveDate, String, String)> = HashSet::new();
        let mut price_keys: HashSet<(NaiveDate, String, Amount)> = HashSet::new();
        for spanned in snapshot.entries.iter() {
            match &spanned.entry {
                Entry::Balance(balance) => {
                    balance_keys.insert((
                        balance.date,
                        balance.account.clone(),
                        balance.amount.currency.clone(),
                    ));
                }
                Entry::Price(price) => {
                    price_keys.insert((price.date, price.currency.clone(), price.amount.clone()));
                }
                _ => {}
            }
        }

        let mut pool: Vec<PendingEntry> = Vec::new();
        let mut directive_pendings: Vec<PendingEntry> = Vec::new();
        for source in self.sources.iter() {
            let output = match source.pending() {
                Ok(output) => output,
                Err(error) => {
                    errors.push(JournalError::error(error.to_string()));
                    continue;
                }
            };
            errors.extend(output.messages);

            let mut directives: Vec<Entry> = Vec::new();
            for balance in output.balances {
                let key = (
                    balance.date,
                    balance.account.clone(),
                    balance.amount.currency.clone(),
                );
                if balance_keys.insert(key) {
                    directives.push(Entry::Balance(balance));
                }
            }
            for price in output.prices {
                let key = (price.date, price.currency.clone(), price.amount.clone());
                if price_keys.insert(key) {
                    directives.push(Entry::Price(price));
                }
            }

            for pending in output.pending {
                if !self.include_pending(&pending, account_re.as_ref()) {
                    continue;
                }
                if self.is_suppressed(&pending, &state.ignored_entry_ids) {
                    continue;
                }
                if already_imported(&pending, &index, source.as_ref()) {
                    log::debug!(
                        target: "beanrec::engine",
                        "pending {} already present in ledger",
                        pending.id
                    );
                    continue;
                }
                pool.push(pending);
            }

            if !directives.is_empty() {
                directives.sort_by_key(|entry| entry.date());
                directive_pendings.push(make_pending_entry(source.name(), directives));
            }
        }
        pool.sort_by_key(|pending| pending.date);
        pool.extend(directive_pendings);

        // Ledger transactions that still carry unknown legs re-enter the
        // pool so the user can finish classifying them.
        let mut journal_pendings: Vec<PendingEntry> = Vec::new();
        for (entry_index, txn) in snapshot.transactions() {
            if snapshot.entries[entry_index].file == ignore_file {
                continue;
            }
            if !txn.has_unknown_postings() {
                continue;
            }
            let mut pending = make_pending_entry(
                JOURNAL_SOURCE,
                vec![snapshot.entries[entry_index].entry.clone()],
            );
            if self.is_suppressed(&pending, &state.ignored_entry_ids) {
                continue;
            }
            pending.journal_entry = Some(entry_index);
            journal_pendings.push(pending);
        }
        journal_pendings.sort_by_key(|pending| pending.date);
        pool.extend(journal_pendings);

        errors.sort_by_key(|error| error.severity);

        state.snapshot = snapshot;
        state.uncleared = Arc::new(index.uncleared_report(&state.snapshot, &self.sources));
        state.index = index;
        state.pending = Arc::new(pool);
        state.errors = Arc::new(errors);
        self.train_classifier(state);

        let len = state.pending.len();
        if state.session.pending_index() >= len && len > 0 {
            state.session.set_index(len - 1, len)?;
        }
        log::info!(
            target: "beanrec::engine",
            "loaded {} entries, {} pending, {} uncleared",
            state.snapshot.entries.len(),
            state.pending.len(),
            state.uncleared.len()
        );
        Ok(())
    }

    /// Account-pattern filter: a pending entry qualifies when any known
    /// account of any of its transactions matches; non-transaction
    /// entries are filtered on their account.
    fn include_pending(&self, pending: &PendingEntry, account_re: Option<&Regex>) -> bool {
        let account_re = match account_re {
            Some(re) => re,
            None => return true,
        };
        pending.entries.iter().any(|entry| match entry {
            Entry::Transaction(txn) => txn.postings.iter().any(|posting| {
                !is_unknown_account(&posting.account) && account_re.is_match(&posting.account)
            }),
            Entry::Balance(balance) => account_re.is_match(&balance.account),
            Entry::Open(open) => account_re.is_match(&open.account),
            Entry::Close(close) => account_re.is_match(&close.account),
            Entry::Price(_) => true,
        })
    }

    /// Whether the pending entry is recorded in the ignore store
    fn is_suppressed(&self, pending: &PendingEntry, ignored: &HashSet<String>) -> bool {
        if ignored.is_empty() {
            return false;
        }
        if ignored.contains(&pending.id) {
            return true;
        }
        pending
            .entries
            .iter()
            .all(|entry| ignored.contains(&short_hash(&render_entry(entry))))
    }
}

/// The source claims this entry is new; trust the clearing index instead.
/// An entry is already imported when it has at least one cleared posting
/// and every cleared posting's identity is present in the ledger.
fn already_imported(pending: &PendingEntry, index: &ClearingIndex, source: &dyn Source) -> bool {
    let txn = match single_transaction(pending) {
        Some(txn) => txn,
        None => return false,
    };
    let mut any_cleared = false;
    for posting in &txn.postings {
        if !source.is_cleared(posting) {
            continue;
        }
        any_cleared = true;
        let present = source.identity_keys().iter().any(|key| {
            posting
                .meta
                .get(key)
                .map(|value| index.has_identity(key, value))
                .unwrap_or(false)
        });
        if !present {
            return false;
        }
    }
    any_cleared
}
