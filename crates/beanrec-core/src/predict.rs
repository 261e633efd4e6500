//! Account prediction for unknown posting legs
//!
//! Training examples come from ledger history: transactions with exactly
//! two non-ignored postings, one to an account claimed by a configured
//! source, labeled with the other, concrete, account. The classifier is a
//! deterministic decision tree over boolean token features, swappable
//! behind the `Classifier` strategy trait. Inference never fails; callers
//! fall back to the unknown-account sentinel when there is no prediction.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use beanrec_config::ClassifierConfig;
use beanrec_model::{
    is_unknown_account, Amount, Meta, Posting, Transaction, CLEARED_BEFORE_KEY, CLEARED_KEY,
    DATE_KEY, FIXME_ACCOUNT, TRANSACTION_DATE_KEY,
};
use beanrec_utils::{normalize_words, word_spans};

/// Text metadata usable as classification features: every text-valued key
/// except the well-known reconciliation keys
fn meta_key_values(meta: &Meta) -> Vec<(String, String)> {
    const RESERVED: [&str; 4] = [DATE_KEY, TRANSACTION_DATE_KEY, CLEARED_KEY, CLEARED_BEFORE_KEY];
    meta.iter()
        .filter(|(key, _)| !RESERVED.contains(key))
        .filter_map(|(key, value)| value.as_str().map(|s| (key.to_string(), s.to_string())))
        .collect()
}

use crate::error::CoreError;
use crate::ledger::LedgerSnapshot;
use crate::source::{source_for, SourceRef};

/// Features describing one posting leg to classify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionInput {
    /// Source account on the other side ("" for direct metadata features)
    pub source_account: String,
    pub amount: Option<Amount>,
    pub date: NaiveDate,
    /// Raw description key-value pairs from source metadata
    pub key_values: Vec<(String, String)>,
}

/// Boolean feature tokens for an input, sorted and deduplicated
pub fn features(input: &PredictionInput) -> Vec<String> {
    let mut tokens: BTreeSet<String> = BTreeSet::new();
    if !input.source_account.is_empty() {
        tokens.insert(format!("account:{}", input.source_account));
    }
    if let Some(amount) = &input.amount {
        tokens.insert(format!("currency:{}", amount.currency));
        let sign = if amount.number.is_sign_negative() {
            '-'
        } else {
            '+'
        };
        tokens.insert(format!("sign:{}", sign));
    }
    for (key, value) in &input.key_values {
        tokens.insert(key.clone());
        for span in word_spans(&normalize_words(value)) {
            tokens.insert(format!("{}:{}", key, span));
        }
    }
    tokens.into_iter().collect()
}

/// One labeled training example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub features: Vec<String>,
    pub label: String,
}

/// Swappable classification strategy
pub trait Classifier: Send + Sync {
    /// Fit the model to the examples; an empty set clears the model
    fn train(&mut self, examples: &[Example]);

    /// Highest-scoring account for the features, or `None` when untrained
    fn predict(&self, features: &[String]) -> Option<String>;
}

// ==================== Decision tree ====================

#[derive(Debug, Clone)]
enum Node {
    Leaf(String),
    Split {
        feature: String,
        present: Box<Node>,
        absent: Box<Node>,
    },
}

/// Deterministic ID3-style decision tree over boolean features.
///
/// Splits maximize information gain; ties among features and among leaf
/// labels break lexicographically so identical training sets always
/// produce identical trees.
#[derive(Debug, Default)]
pub struct DecisionTreeClassifier {
    max_depth: usize,
    root: Option<Node>,
}

impl DecisionTreeClassifier {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
            root: None,
        }
    }

    fn majority_label(examples: &[(HashSet<&str>, &str)]) -> String {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for (_, label) in examples {
            *counts.entry(*label).or_default() += 1;
        }
        let mut best = ("", 0usize);
        for (label, count) in counts {
            if count > best.1 {
                best = (label, count);
            }
        }
        best.0.to_string()
    }

    fn entropy(counts: &BTreeMap<&str, usize>) -> f64 {
        let total: usize = counts.values().sum();
        if total == 0 {
            return 0.0;
        }
        let mut entropy = 0.0;
        for &count in counts.values() {
            if count == 0 {
                continue;
            }
            let p = count as f64 / total as f64;
            entropy -= p * p.log2();
        }
        entropy
    }

    fn build(examples: Vec<(HashSet<&str>, &str)>, depth: usize) -> Node {
        let distinct: BTreeSet<&str> = examples.iter().map(|(_, label)| *label).collect();
        if distinct.len() <= 1 || depth == 0 {
            return Node::Leaf(Self::majority_label(&examples));
        }

        let total = examples.len() as f64;
        let mut parent_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for (_, label) in &examples {
            *parent_counts.entry(*label).or_default() += 1;
        }
        let parent_entropy = Self::entropy(&parent_counts);

        let mut candidates: BTreeSet<&str> = BTreeSet::new();
        for (feature_set, _) in &examples {
            candidates.extend(feature_set.iter().copied());
        }

        let mut best: Option<(String, f64)> = None;
        for feature in candidates {
            let mut present: BTreeMap<&str, usize> = BTreeMap::new();
            let mut absent: BTreeMap<&str, usize> = BTreeMap::new();
            for (feature_set, label) in &examples {
                if feature_set.contains(feature) {
                    *present.entry(*label).or_default() += 1;
                } else {
                    *absent.entry(*label).or_default() += 1;
                }
            }
            let n_present: usize = present.values().sum();
            let n_absent: usize = absent.values().sum();
            if n_present == 0 || n_absent == 0 {
                continue;
            }
            let weighted = (n_present as f64 * Self::entropy(&present)
                + n_absent as f64 * Self::entropy(&absent))
                / total;
            let gain = parent_entropy - weighted;
            // Strict improvement keeps the lexicographically first feature
            // among exact ties.
            if gain > best.as_ref().map(|(_, g)| *g).unwrap_or(f64::MIN) + 1e-12 {
                best = Some((feature.to_string(), gain));
            }
        }

        let (feature, gain) = match best {
            Some(best) => best,
            None => return Node::Leaf(Self::majority_label(&examples)),
        };
        if gain <= 0.0 {
            return Node::Leaf(Self::majority_label(&examples));
        }

        let (present, absent): (Vec<_>, Vec<_>) = examples
            .into_iter()
            .partition(|(feature_set, _)| feature_set.contains(feature.as_str()));
        Node::Split {
            present: Box::new(Self::build(present, depth - 1)),
            absent: Box::new(Self::build(absent, depth - 1)),
            feature,
        }
    }
}

impl Classifier for DecisionTreeClassifier {
    fn train(&mut self, examples: &[Example]) {
        if examples.is_empty() {
            self.root = None;
            return;
        }
        let prepared: Vec<(HashSet<&str>, &str)> = examples
            .iter()
            .map(|example| {
                (
                    example.features.iter().map(String::as_str).collect(),
                    example.label.as_str(),
                )
            })
            .collect();
        self.root = Some(Self::build(prepared, self.max_depth));
        log::debug!(
            target: "beanrec::predict",
            "trained decision tree on {} examples",
            examples.len()
        );
    }

    fn predict(&self, features: &[String]) -> Option<String> {
        let feature_set: HashSet<&str> = features.iter().map(String::as_str).collect();
        let mut node = self.root.as_ref()?;
        loop {
            match node {
                Node::Leaf(label) => return Some(label.clone()),
                Node::Split {
                    feature,
                    present,
                    absent,
                } => {
                    node = if feature_set.contains(feature.as_str()) {
                        present
                    } else {
                        absent
                    };
                }
            }
        }
    }
}

// ==================== Feature extraction ====================

/// Extracts training examples and per-group prediction inputs from
/// ledger transactions
pub struct FeatureExtractor {
    ignore_re: Regex,
}

impl FeatureExtractor {
    pub fn new(config: &ClassifierConfig) -> Result<Self, CoreError> {
        let ignore_re = Regex::new(&config.ignore_account_pattern).map_err(|_| {
            CoreError::ConfigError(beanrec_config::ConfigError::InvalidPattern {
                field: "classifier.ignore_account_pattern".to_string(),
                pattern: config.ignore_account_pattern.clone(),
            })
        })?;
        Ok(Self { ignore_re })
    }

    fn is_ignored(&self, account: &str) -> bool {
        self.ignore_re.is_match(account)
    }

    fn non_ignored_postings<'t>(&self, txn: &'t Transaction) -> Vec<&'t Posting> {
        txn.postings
            .iter()
            .filter(|posting| !self.is_ignored(&posting.account))
            .collect()
    }

    /// Labeled examples from every suitably-shaped ledger transaction
    pub fn extract_examples(
        &self,
        snapshot: &LedgerSnapshot,
        sources: &[SourceRef],
    ) -> Vec<Example> {
        let mut examples = Vec::new();
        for (_, txn) in snapshot.transactions() {
            self.extract_examples_from(txn, sources, &mut examples);
        }
        examples
    }

    /// Labeled examples from one transaction
    pub fn extract_examples_from(
        &self,
        txn: &Transaction,
        sources: &[SourceRef],
        examples: &mut Vec<Example>,
    ) {
        // Two postings are required to relate a source account to a
        // target account.
        let non_ignored = self.non_ignored_postings(txn);
        if non_ignored.len() != 2 {
            return;
        }
        for (i, source_posting) in non_ignored.iter().enumerate() {
            let target = non_ignored[1 - i];
            if is_unknown_account(&target.account) || is_unknown_account(&source_posting.account) {
                continue;
            }
            if source_for(sources, &source_posting.account).is_none() {
                continue;
            }
            let key_values = meta_key_values(&source_posting.meta);
            if key_values.is_empty() {
                continue;
            }
            let input = PredictionInput {
                source_account: source_posting.account.clone(),
                amount: source_posting.amount.clone(),
                date: txn.posting_date(source_posting),
                key_values,
            };
            examples.push(Example {
                features: features(&input),
                label: target.account.clone(),
            });
        }
    }

    /// Prediction inputs per unknown-account group, aligned with
    /// `unknown_account_group_numbers`
    pub fn group_prediction_inputs(
        &self,
        txn: &Transaction,
        sources: &[SourceRef],
    ) -> Vec<Option<PredictionInput>> {
        let group_numbers = unknown_account_group_numbers(txn);
        let group_count = group_numbers.iter().copied().max().map_or(0, |m| m + 1);
        let mut group_postings: Vec<Vec<&Posting>> = vec![Vec::new(); group_count];
        let unknown: Vec<&Posting> = txn
            .postings
            .iter()
            .filter(|posting| is_unknown_account(&posting.account))
            .collect();
        for (posting, group) in unknown.iter().zip(&group_numbers) {
            group_postings[*group].push(*posting);
        }

        let mut inputs: Vec<Option<PredictionInput>> = group_postings
            .iter()
            .map(|postings| self.direct_group_input(txn, postings))
            .collect();

        // A single anonymous group with no metadata of its own falls back
        // to the sibling source posting's features.
        if group_numbers == [0] && inputs == [None] {
            inputs[0] = self.indirect_input(txn, sources);
        }
        inputs
    }

    fn direct_group_input(
        &self,
        txn: &Transaction,
        postings: &[&Posting],
    ) -> Option<PredictionInput> {
        let mut key_values: Vec<(String, String)> = Vec::new();
        for posting in postings {
            key_values.extend(meta_key_values(&posting.meta));
        }
        if key_values.is_empty() {
            return None;
        }
        Some(PredictionInput {
            source_account: String::new(),
            amount: postings.last().and_then(|posting| posting.amount.clone()),
            date: txn.date,
            key_values,
        })
    }

    fn indirect_input(
        &self,
        txn: &Transaction,
        sources: &[SourceRef],
    ) -> Option<PredictionInput> {
        let non_ignored = self.non_ignored_postings(txn);
        if non_ignored.len() != 2 {
            return None;
        }
        let source_posting = if is_unknown_account(&non_ignored[1].account) {
            non_ignored[0]
        } else {
            non_ignored[1]
        };
        source_for(sources, &source_posting.account)?;
        let key_values = meta_key_values(&source_posting.meta);
        if key_values.is_empty() {
            return None;
        }
        Some(PredictionInput {
            source_account: source_posting.account.clone(),
            amount: source_posting.amount.clone(),
            date: txn.posting_date(source_posting),
            key_values,
        })
    }
}

/// Group numbers for the unknown postings of a transaction, in posting
/// order. Bare sentinel postings each form their own group; named
/// sub-accounts of the sentinel share a group per name.
pub fn unknown_account_group_numbers(txn: &Transaction) -> Vec<usize> {
    let mut num_groups = 0usize;
    let mut existing: HashMap<&str, usize> = HashMap::new();
    let mut group_numbers = Vec::new();
    for posting in &txn.postings {
        if !is_unknown_account(&posting.account) {
            continue;
        }
        let group = if posting.account == FIXME_ACCOUNT {
            num_groups
        } else {
            *existing.entry(posting.account.as_str()).or_insert(num_groups)
        };
        if group == num_groups {
            num_groups += 1;
        }
        group_numbers.push(group);
    }
    group_numbers
}
