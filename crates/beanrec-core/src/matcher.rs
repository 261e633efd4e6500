//! Merge-hypothesis search
//!
//! Given one pending entry, searches the clearing index and the pool of
//! other pending entries for postings that could represent the same
//! transaction leg, and unions compatible matches into ranked merge
//! hypotheses. The standalone (no-match) hypothesis is always produced
//! and always ranks last.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use rust_decimal::Decimal;

use beanrec_config::MatchingConfig;
use beanrec_model::{is_unknown_account, render_entry, Entry, Posting, Transaction};

use crate::clearing::ClearingIndex;
use crate::ledger::LedgerSnapshot;
use crate::source::{is_posting_cleared, PendingEntry, SourceRef};

/// One way of resolving a pending entry: merged with zero or more existing
/// or other-pending transactions.
#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub merged: Transaction,
    /// Snapshot entry indexes of merged existing transactions, ascending
    pub used_existing: Vec<usize>,
    /// Pool indexes of merged other pending entries, ascending
    pub used_pending: Vec<usize>,
    /// Total paired postings across all merges
    pub matched_postings: usize,
    /// Summed absolute date distance across all pairs, in days
    pub date_distance: i64,
}

impl Hypothesis {
    pub fn is_standalone(&self) -> bool {
        self.used_existing.is_empty() && self.used_pending.is_empty()
    }
}

#[derive(Debug, Clone)]
struct SearchState {
    txn: Transaction,
    used_existing: Vec<usize>,
    used_pending: Vec<usize>,
    matched_postings: usize,
    date_distance: i64,
    /// Header fields already taken from an existing ledger transaction
    from_existing: bool,
}

enum Target<'a> {
    Existing(usize, &'a Transaction),
    Pending(usize, &'a Transaction),
}

struct MergeOutcome {
    txn: Transaction,
    pairs: usize,
    distance: i64,
}

/// Pending-entry matcher over one generation snapshot
pub struct Matcher<'a> {
    config: &'a MatchingConfig,
    snapshot: &'a LedgerSnapshot,
    index: &'a ClearingIndex,
    sources: &'a [SourceRef],
    pool: &'a [PendingEntry],
}

impl<'a> Matcher<'a> {
    pub fn new(
        config: &'a MatchingConfig,
        snapshot: &'a LedgerSnapshot,
        index: &'a ClearingIndex,
        sources: &'a [SourceRef],
        pool: &'a [PendingEntry],
    ) -> Self {
        Self {
            config,
            snapshot,
            index,
            sources,
            pool,
        }
    }

    /// Ranked merge hypotheses for the pending entry at `pool_index`.
    ///
    /// Ranking: paired-posting count descending, total date distance
    /// ascending; remaining ties keep discovery order, which follows the
    /// pending pool's insertion order.
    pub fn hypotheses(&self, pool_index: usize) -> Vec<Hypothesis> {
        let pending = &self.pool[pool_index];
        let txn = match single_transaction(pending) {
            Some(txn) => txn.clone(),
            None => return vec![self.standalone(pending)],
        };

        let mut results: Vec<Hypothesis> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<SearchState> = VecDeque::new();
        // A re-imported journal transaction counts as its own existing
        // entry: candidates replace it in place instead of inserting.
        queue.push_back(SearchState {
            txn: txn.clone(),
            used_existing: pending.journal_entry.into_iter().collect(),
            used_pending: Vec::new(),
            matched_postings: 0,
            date_distance: 0,
            from_existing: pending.journal_entry.is_some(),
        });

        let mut expansions = 0usize;
        'search: while let Some(state) = queue.pop_front() {
            if state.used_existing.len() + state.used_pending.len() + 1
                >= self.config.max_merged_entries
            {
                continue;
            }
            for target in self.find_targets(&state, pool_index) {
                expansions += 1;
                if expansions > self.config.max_expansions {
                    log::warn!(
                        target: "beanrec::matcher",
                        "hypothesis search for {} truncated after {} expansions",
                        pending.id,
                        self.config.max_expansions
                    );
                    break 'search;
                }
                let (outcomes, next_state_base) = match target {
                    Target::Existing(entry_index, other) => {
                        let outcomes = self.merge(&state.txn, other, !state.from_existing);
                        let mut next = state.clone();
                        next.used_existing.push(entry_index);
                        next.used_existing.sort_unstable();
                        next.from_existing = true;
                        (outcomes, next)
                    }
                    Target::Pending(pool_idx, other) => {
                        let outcomes = self.merge(&state.txn, other, false);
                        let mut next = state.clone();
                        next.used_pending.push(pool_idx);
                        next.used_pending.sort_unstable();
                        (outcomes, next)
                    }
                };
                for outcome in outcomes {
                    let mut next = next_state_base.clone();
                    next.matched_postings += outcome.pairs;
                    next.date_distance += outcome.distance;
                    next.txn = outcome.txn;
                    let key = format!(
                        "{:?}|{:?}|{}",
                        next.used_existing,
                        next.used_pending,
                        render_entry(&Entry::Transaction(next.txn.clone()))
                    );
                    if seen.insert(key) {
                        results.push(Hypothesis {
                            merged: next.txn.clone(),
                            used_existing: next.used_existing.clone(),
                            used_pending: next.used_pending.clone(),
                            matched_postings: next.matched_postings,
                            date_distance: next.date_distance,
                        });
                        queue.push_back(next);
                    }
                }
            }
        }

        // Stable sort keeps discovery order between exact ties.
        results.sort_by(|a, b| {
            b.matched_postings
                .cmp(&a.matched_postings)
                .then(a.date_distance.cmp(&b.date_distance))
        });
        results.push(self.standalone(pending));
        results
    }

    fn standalone(&self, pending: &PendingEntry) -> Hypothesis {
        let merged = single_transaction(pending)
            .cloned()
            .unwrap_or_else(|| Transaction {
                date: pending.date,
                ..Default::default()
            });
        Hypothesis {
            merged,
            used_existing: pending.journal_entry.into_iter().collect(),
            used_pending: Vec::new(),
            matched_postings: 0,
            date_distance: 0,
        }
    }

    /// Merge targets compatible with at least one posting of the state's
    /// transaction: existing ledger transactions first (by file position),
    /// then other pending entries (by pool insertion order).
    fn find_targets(&self, state: &SearchState, pool_index: usize) -> Vec<Target<'a>> {
        let mut existing: BTreeSet<usize> = BTreeSet::new();
        for posting in &state.txn.postings {
            let weight = match posting.weight() {
                Some(weight) => weight,
                None => continue,
            };
            let date = state.txn.posting_date(posting);
            let cleared = is_posting_cleared(self.sources, posting);
            for candidate in self.index.find_weight_matches(
                &weight,
                date,
                self.config.window_days,
                self.config.amount_tolerance,
                posting.cost.is_some(),
            ) {
                if cleared && candidate.cleared {
                    continue;
                }
                if !accounts_mergeable(&posting.account, &candidate.account) {
                    continue;
                }
                existing.insert(candidate.key.entry_index);
            }
        }

        let mut targets: Vec<Target> = existing
            .into_iter()
            .filter(|entry_index| !state.used_existing.contains(entry_index))
            .filter_map(|entry_index| {
                self.snapshot.entries[entry_index]
                    .entry
                    .as_transaction()
                    .map(|txn| Target::Existing(entry_index, txn))
            })
            .collect();

        for (pool_idx, other) in self.pool.iter().enumerate() {
            if pool_idx == pool_index || state.used_pending.contains(&pool_idx) {
                continue;
            }
            // Journal re-imports are reachable as existing entries already.
            if other.journal_entry.is_some() {
                continue;
            }
            let other_txn = match single_transaction(other) {
                Some(txn) => txn,
                None => continue,
            };
            let compatible = state.txn.postings.iter().any(|pa| {
                other_txn
                    .postings
                    .iter()
                    .any(|pb| self.pairable(&state.txn, pa, other_txn, pb))
            });
            if compatible {
                targets.push(Target::Pending(pool_idx, other_txn));
            }
        }

        targets
    }

    /// Whether two postings could represent the same transaction leg
    fn pairable(&self, a: &Transaction, pa: &Posting, b: &Transaction, pb: &Posting) -> bool {
        let (wa, wb) = match (pa.weight(), pb.weight()) {
            (Some(wa), Some(wb)) => (wa, wb),
            _ => return false,
        };
        if wa.currency != wb.currency {
            return false;
        }
        let has_cost = pa.cost.is_some() || pb.cost.is_some();
        let equal = if has_cost {
            (wa.number - wb.number).abs() <= self.config.amount_tolerance
        } else {
            wa.number == wb.number
        };
        if !equal {
            return false;
        }
        if !accounts_mergeable(&pa.account, &pb.account) {
            return false;
        }
        if is_posting_cleared(self.sources, pa) && is_posting_cleared(self.sources, pb) {
            return false;
        }
        let days = (a.posting_date(pa) - b.posting_date(pb)).num_days().abs();
        days <= self.config.window_days
    }

    /// All balanced ways of merging `b` into `a`.
    ///
    /// Distinct disjoint posting pairs are enumerated by backtracking; a
    /// pairing is kept when the summed pair weights close to zero per
    /// currency within the balance epsilon. Unpaired postings of both
    /// sides are carried into the merged transaction.
    fn merge(&self, a: &Transaction, b: &Transaction, take_b_header: bool) -> Vec<MergeOutcome> {
        if a.postings.len() * b.postings.len() > 64 {
            log::warn!(
                target: "beanrec::matcher",
                "skipping merge with oversized posting product ({}x{})",
                a.postings.len(),
                b.postings.len()
            );
            return Vec::new();
        }

        let mut outcomes = Vec::new();
        let mut assignment: Vec<Option<usize>> = vec![None; a.postings.len()];
        let mut used_b: Vec<bool> = vec![false; b.postings.len()];
        self.enumerate_pairings(
            a,
            b,
            0,
            &mut assignment,
            &mut used_b,
            take_b_header,
            &mut outcomes,
        );
        outcomes
    }

    #[allow(clippy::too_many_arguments)]
    fn enumerate_pairings(
        &self,
        a: &Transaction,
        b: &Transaction,
        index: usize,
        assignment: &mut Vec<Option<usize>>,
        used_b: &mut Vec<bool>,
        take_b_header: bool,
        outcomes: &mut Vec<MergeOutcome>,
    ) {
        if index == assignment.len() {
            if let Some(outcome) = self.finish_pairing(a, b, assignment, take_b_header) {
                outcomes.push(outcome);
            }
            return;
        }
        for j in 0..b.postings.len() {
            if used_b[j] || !self.pairable(a, &a.postings[index], b, &b.postings[j]) {
                continue;
            }
            assignment[index] = Some(j);
            used_b[j] = true;
            self.enumerate_pairings(a, b, index + 1, assignment, used_b, take_b_header, outcomes);
            used_b[j] = false;
            assignment[index] = None;
        }
        // Leave this posting unpaired.
        self.enumerate_pairings(a, b, index + 1, assignment, used_b, take_b_header, outcomes);
    }

    fn finish_pairing(
        &self,
        a: &Transaction,
        b: &Transaction,
        assignment: &[Option<usize>],
        take_b_header: bool,
    ) -> Option<MergeOutcome> {
        let pairs = assignment.iter().flatten().count();
        if pairs == 0 {
            return None;
        }

        // The combined set of matches must balance: each pair stands for a
        // single real leg, so the pair weights must close to zero.
        let mut residuals: HashMap<String, Decimal> = HashMap::new();
        for (i, slot) in assignment.iter().enumerate() {
            if slot.is_some() {
                if let Some(weight) = a.postings[i].weight() {
                    *residuals.entry(weight.currency.clone()).or_default() += weight.number;
                }
            }
        }
        if residuals
            .values()
            .any(|residual| residual.abs() > self.config.balance_epsilon)
        {
            return None;
        }

        let mut distance = 0i64;
        let mut postings: Vec<Posting> = Vec::with_capacity(a.postings.len() + b.postings.len());
        for (i, slot) in assignment.iter().enumerate() {
            let pa = &a.postings[i];
            match slot {
                Some(j) => {
                    let pb = &b.postings[*j];
                    distance += (a.posting_date(pa) - b.posting_date(pb)).num_days().abs();
                    postings.push(merge_postings(pa, pb, take_b_header));
                }
                None => postings.push(pa.clone()),
            }
        }
        for (j, pb) in b.postings.iter().enumerate() {
            if !assignment.contains(&Some(j)) {
                postings.push(pb.clone());
            }
        }

        let header = if take_b_header { b } else { a };
        let mut merged = Transaction {
            date: header.date,
            flag: header.flag.clone(),
            payee: header.payee.clone(),
            narration: header.narration.clone(),
            tags: header.tags.clone(),
            links: header.links.clone(),
            postings,
            meta: header.meta.clone(),
        };
        merged
            .meta
            .merge_missing(if take_b_header { &a.meta } else { &b.meta });

        Some(MergeOutcome {
            txn: merged,
            pairs,
            distance,
        })
    }
}

/// Merge a pair of postings representing the same leg.
///
/// The base side supplies the account and units; the other side's
/// metadata (identity keys, posting date override) is added to it.
fn merge_postings(pa: &Posting, pb: &Posting, b_is_existing: bool) -> Posting {
    let a_unknown = is_unknown_account(&pa.account);
    let b_unknown = is_unknown_account(&pb.account);
    let base_is_b = if a_unknown != b_unknown {
        a_unknown
    } else {
        b_is_existing
    };
    let (base, other) = if base_is_b { (pb, pa) } else { (pa, pb) };
    let mut merged = base.clone();
    merged.meta.merge_missing(&other.meta);
    merged
}

/// Whether two accounts could name the same leg
fn accounts_mergeable(a: &str, b: &str) -> bool {
    a == b || is_unknown_account(a) || is_unknown_account(b)
}

/// The transaction of a single-transaction pending entry
pub fn single_transaction(pending: &PendingEntry) -> Option<&Transaction> {
    match pending.entries.as_slice() {
        [Entry::Transaction(txn)] => Some(txn),
        _ => None,
    }
}
