//! Textual change sets against the ledger
//!
//! A `ChangeSet` is the ordered list of per-file line regions realizing a
//! candidate: replaced regions for merged existing transactions, insertion
//! regions for new entries and synthesized opens. Applying all regions in
//! order yields exactly the serialization of the new entries spliced in
//! place; re-deriving the diff from the result is a no-op.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use beanrec_model::{render_entry_lines, Entry, LineRange, SpannedEntry};
use beanrec_utils::{diff_lines, DiffOp};

use crate::error::CoreError;
use crate::ledger::LedgerSnapshot;

/// Line-level change operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// Line kept as-is
    Context,
    /// Line removed
    Delete,
    /// Line added
    Insert,
}

/// Changes to one contiguous region of a file.
///
/// `line_range` addresses the pre-change text; the change list encodes the
/// full region content (context and inserted lines, in order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionChange {
    pub line_range: LineRange,
    pub changes: Vec<(ChangeOp, String)>,
}

impl RegionChange {
    /// Number of lines the region covers before the change
    pub fn old_len(&self) -> usize {
        self.changes
            .iter()
            .filter(|(op, _)| *op != ChangeOp::Insert)
            .count()
    }

    /// Number of lines the region covers after the change
    pub fn new_len(&self) -> usize {
        self.changes
            .iter()
            .filter(|(op, _)| *op != ChangeOp::Delete)
            .count()
    }
}

/// All regions changed within one file, ascending by line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub file: String,
    pub regions: Vec<RegionChange>,
}

/// Minimal edit realizing one candidate.
///
/// `new_entries` carry their post-apply spans; `old_entries` are the
/// replaced or removed ledger entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub files: Vec<FileChange>,
    pub old_entries: Vec<SpannedEntry>,
    pub new_entries: Vec<SpannedEntry>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.iter().all(|f| f.regions.is_empty())
    }

    /// Unified-diff-style rendering for display
    pub fn textual_diff(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            out.push_str(&file.file);
            out.push('\n');
            for region in &file.regions {
                for (op, line) in &region.changes {
                    let indicator = match op {
                        ChangeOp::Context => ' ',
                        ChangeOp::Delete => '-',
                        ChangeOp::Insert => '+',
                    };
                    out.push(indicator);
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        out
    }
}

// ==================== Builder ====================

#[derive(Debug, Clone)]
enum StagedOp {
    Add { entry: Entry },
    Remove { old: SpannedEntry },
    Change { old: SpannedEntry, new: Entry },
}

impl StagedOp {
    /// Anchor line in pre-change coordinates
    fn anchor(&self, snapshot: &LedgerSnapshot, file: &str) -> usize {
        match self {
            StagedOp::Add { entry } => snapshot.insertion_line(file, entry.date()),
            StagedOp::Remove { old } => old.span.start,
            StagedOp::Change { old, .. } => old.span.start,
        }
    }
}

/// Accumulates staged entry edits and turns them into a `ChangeSet`
pub struct ChangeSetBuilder<'a> {
    snapshot: &'a LedgerSnapshot,
    ops: BTreeMap<String, Vec<StagedOp>>,
}

impl<'a> ChangeSetBuilder<'a> {
    pub fn new(snapshot: &'a LedgerSnapshot) -> Self {
        Self {
            snapshot,
            ops: BTreeMap::new(),
        }
    }

    /// Stage a new entry for insertion at its chronological position
    pub fn add_entry(&mut self, file: &str, entry: Entry) {
        self.ops
            .entry(file.to_string())
            .or_default()
            .push(StagedOp::Add { entry });
    }

    /// Stage removal of an existing entry
    pub fn remove_entry(&mut self, old: SpannedEntry) {
        self.ops
            .entry(old.file.clone())
            .or_default()
            .push(StagedOp::Remove { old });
    }

    /// Stage replacement of an existing entry in place
    pub fn change_entry(&mut self, old: SpannedEntry, new: Entry) {
        self.ops
            .entry(old.file.clone())
            .or_default()
            .push(StagedOp::Change { old, new });
    }

    /// Entries staged for addition or replacement
    pub fn staged_new_entries(&self) -> Vec<&Entry> {
        self.ops
            .values()
            .flatten()
            .filter_map(|op| match op {
                StagedOp::Add { entry } => Some(entry),
                StagedOp::Change { new, .. } => Some(new),
                StagedOp::Remove { .. } => None,
            })
            .collect()
    }

    pub fn build(self) -> ChangeSet {
        let empty: Vec<String> = Vec::new();
        let mut change_set = ChangeSet::default();

        for (file, ops) in self.ops {
            let lines = self.snapshot.file_lines(&file).unwrap_or(&empty);

            // Stable order by anchor; insertions anchored at an existing
            // entry's start line must precede the region replacing it, so
            // the applied line arithmetic places them before the entry.
            let mut ordered: Vec<(usize, usize, StagedOp)> = ops
                .into_iter()
                .enumerate()
                .map(|(seq, op)| (op.anchor(self.snapshot, &file), seq, op))
                .collect();
            ordered.sort_by_key(|(anchor, seq, op)| {
                (*anchor, !matches!(op, StagedOp::Add { .. }), *seq)
            });

            let mut regions: Vec<RegionChange> = Vec::new();
            let mut delta: i64 = 0;
            let mut i = 0;
            while i < ordered.len() {
                let (anchor, _, op) = &ordered[i];
                let anchor = *anchor;
                match op {
                    StagedOp::Remove { old } => {
                        // Take the preceding blank separator with the entry.
                        let mut start = anchor;
                        while start > 0 && lines[start - 1].trim().is_empty() {
                            start -= 1;
                        }
                        let end = old.span.end.min(lines.len());
                        let changes: Vec<(ChangeOp, String)> = lines[start..end]
                            .iter()
                            .map(|line| (ChangeOp::Delete, line.clone()))
                            .collect();
                        delta -= (end - start) as i64;
                        regions.push(RegionChange {
                            line_range: LineRange::new(start, end),
                            changes,
                        });
                        change_set.old_entries.push(old.clone());
                        i += 1;
                    }
                    StagedOp::Change { old, new } => {
                        let end = old.span.end.min(lines.len());
                        let old_lines = &lines[old.span.start..end];
                        let new_lines = render_entry_lines(new);
                        let changes: Vec<(ChangeOp, String)> =
                            diff_lines(old_lines, &new_lines)
                                .into_iter()
                                .map(|(op, line)| (convert_diff_op(op), line))
                                .collect();
                        let new_start = (old.span.start as i64 + delta) as usize;
                        change_set.new_entries.push(SpannedEntry {
                            entry: new.clone(),
                            file: file.clone(),
                            span: LineRange::new(new_start, new_start + new_lines.len()),
                        });
                        change_set.old_entries.push(old.clone());
                        delta += new_lines.len() as i64 - (end - old.span.start) as i64;
                        regions.push(RegionChange {
                            line_range: LineRange::new(old.span.start, end),
                            changes,
                        });
                        i += 1;
                    }
                    StagedOp::Add { .. } => {
                        // Group consecutive additions at the same anchor into
                        // one insertion region.
                        let mut group: Vec<&Entry> = Vec::new();
                        while i < ordered.len() && ordered[i].0 == anchor {
                            if let (_, _, StagedOp::Add { entry }) = &ordered[i] {
                                group.push(entry);
                                i += 1;
                            } else {
                                break;
                            }
                        }
                        let mut inserted: Vec<String> = Vec::new();
                        if anchor > 0 && !lines[anchor - 1].trim().is_empty() {
                            inserted.push(String::new());
                        }
                        for (pos, entry) in group.iter().enumerate() {
                            let entry_lines = render_entry_lines(entry);
                            let start =
                                (anchor as i64 + delta) as usize + inserted.len();
                            change_set.new_entries.push(SpannedEntry {
                                entry: (*entry).clone(),
                                file: file.clone(),
                                span: LineRange::new(start, start + entry_lines.len()),
                            });
                            inserted.extend(entry_lines);
                            if pos + 1 < group.len() {
                                inserted.push(String::new());
                            }
                        }
                        if anchor < lines.len() && !lines[anchor].trim().is_empty() {
                            inserted.push(String::new());
                        }
                        delta += inserted.len() as i64;
                        regions.push(RegionChange {
                            line_range: LineRange::new(anchor, anchor),
                            changes: inserted
                                .into_iter()
                                .map(|line| (ChangeOp::Insert, line))
                                .collect(),
                        });
                    }
                }
            }

            if !regions.is_empty() {
                change_set.files.push(FileChange { file, regions });
            }
        }

        change_set
    }
}

fn convert_diff_op(op: DiffOp) -> ChangeOp {
    match op {
        DiffOp::Keep => ChangeOp::Context,
        DiffOp::Delete => ChangeOp::Delete,
        DiffOp::Insert => ChangeOp::Insert,
    }
}

// ==================== Application ====================

/// Apply a change set to snapshot text and entries in place.
///
/// Context and delete lines are verified against the current text; a
/// mismatch means the ledger changed underneath the change set and yields
/// `StoreConflict`.
pub fn apply_to_snapshot(
    snapshot: &mut LedgerSnapshot,
    changes: &ChangeSet,
) -> Result<(), CoreError> {
    // Verify and splice text regions, file by file.
    for file_change in &changes.files {
        let lines = snapshot.files.entry(file_change.file.clone()).or_default();
        let mut delta: i64 = 0;
        for region in &file_change.regions {
            let start = (region.line_range.start as i64 + delta) as usize;
            let mut cursor = start;
            let mut new_region: Vec<String> = Vec::with_capacity(region.new_len());
            for (op, text) in &region.changes {
                match op {
                    ChangeOp::Context | ChangeOp::Delete => {
                        if lines.get(cursor).map(|l| l.as_str()) != Some(text.as_str()) {
                            return Err(CoreError::StoreConflict {
                                file: file_change.file.clone(),
                                line: cursor,
                            });
                        }
                        if *op == ChangeOp::Context {
                            new_region.push(text.clone());
                        }
                        cursor += 1;
                    }
                    ChangeOp::Insert => new_region.push(text.clone()),
                }
            }
            let old_len = cursor - start;
            lines.splice(start..cursor, new_region);
            delta += region.new_len() as i64 - old_len as i64;
        }
    }

    // Drop replaced/removed entries.
    snapshot.entries.retain(|existing| {
        !changes
            .old_entries
            .iter()
            .any(|old| old.file == existing.file && old.span.start == existing.span.start)
    });

    // Shift spans of untouched entries past changed regions.
    for file_change in &changes.files {
        for existing in snapshot.entries.iter_mut() {
            if existing.file != file_change.file {
                continue;
            }
            let shift: i64 = file_change
                .regions
                .iter()
                .filter(|region| region.line_range.start <= existing.span.start)
                .map(|region| region.new_len() as i64 - region.old_len() as i64)
                .sum();
            if shift != 0 {
                existing.span = LineRange::new(
                    (existing.span.start as i64 + shift) as usize,
                    (existing.span.end as i64 + shift) as usize,
                );
            }
        }
    }

    // Insert the new entries at their precomputed spans.
    snapshot.entries.extend(changes.new_entries.iter().cloned());
    snapshot
        .entries
        .sort_by(|a, b| (&a.file, a.span.start).cmp(&(&b.file, b.span.start)));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use beanrec_model::{Amount, Open, Posting, Transaction};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn amount(s: &str, cur: &str) -> Amount {
        Amount::new(s.parse::<Decimal>().unwrap(), cur)
    }

    fn txn(d: NaiveDate, narration: &str, account: &str, number: &str) -> Entry {
        let mut t = Transaction {
            date: d,
            narration: Some(narration.to_string()),
            ..Default::default()
        };
        t.postings
            .push(Posting::new(account, Some(amount(number, "USD"))));
        t.postings.push(Posting::new("Expenses:Misc", None));
        Entry::Transaction(t)
    }

    fn snapshot_with(entries: Vec<Entry>) -> LedgerSnapshot {
        MemoryLedger::from_entries("main.bean", entries).into_snapshot()
    }

    #[test]
    fn insert_into_empty_file() {
        let snapshot = snapshot_with(vec![]);
        let mut builder = ChangeSetBuilder::new(&snapshot);
        builder.add_entry("main.bean", txn(date(2016, 8, 10), "coffee", "Assets:Cash", "-2.45"));
        let changes = builder.build();

        assert_eq!(changes.files.len(), 1);
        assert_eq!(changes.new_entries.len(), 1);
        assert_eq!(changes.new_entries[0].span.start, 0);

        let mut snapshot = snapshot;
        apply_to_snapshot(&mut snapshot, &changes).unwrap();
        let lines = snapshot.file_lines("main.bean").unwrap();
        assert_eq!(lines[0], "2016-08-10 * \"coffee\"");
        assert_eq!(snapshot.entries.len(), 1);
    }

    #[test]
    fn insert_is_chronological() {
        let snapshot = snapshot_with(vec![
            txn(date(2016, 8, 1), "first", "Assets:Cash", "-1.00"),
            txn(date(2016, 8, 20), "last", "Assets:Cash", "-3.00"),
        ]);
        let mut builder = ChangeSetBuilder::new(&snapshot);
        builder.add_entry(
            "main.bean",
            txn(date(2016, 8, 10), "middle", "Assets:Cash", "-2.00"),
        );
        let changes = builder.build();

        let mut snapshot = snapshot;
        apply_to_snapshot(&mut snapshot, &changes).unwrap();
        let narrations: Vec<&str> = snapshot
            .entries
            .iter()
            .filter_map(|e| e.entry.as_transaction())
            .filter_map(|t| t.narration.as_deref())
            .collect();
        assert_eq!(narrations, vec!["first", "middle", "last"]);

        // Every entry span must address exactly its rendered lines.
        for spanned in &snapshot.entries {
            let lines = snapshot.file_lines("main.bean").unwrap();
            assert_eq!(
                lines[spanned.span.start..spanned.span.end].to_vec(),
                render_entry_lines(&spanned.entry)
            );
        }
    }

    #[test]
    fn change_entry_produces_minimal_diff() {
        let snapshot = snapshot_with(vec![txn(date(2016, 8, 9), "coffee", "Assets:Cash", "-2.45")]);
        let old = snapshot.entries[0].clone();
        let mut new_txn = old.entry.as_transaction().unwrap().clone();
        new_txn.postings[0]
            .meta
            .insert("source_desc", beanrec_model::MetaValue::Text("STARBUCKS".into()));

        let mut builder = ChangeSetBuilder::new(&snapshot);
        builder.change_entry(old, Entry::Transaction(new_txn));
        let changes = builder.build();

        let region = &changes.files[0].regions[0];
        let inserts = region
            .changes
            .iter()
            .filter(|(op, _)| *op == ChangeOp::Insert)
            .count();
        let deletes = region
            .changes
            .iter()
            .filter(|(op, _)| *op == ChangeOp::Delete)
            .count();
        assert_eq!(inserts, 1, "only the metadata line is added");
        assert_eq!(deletes, 0);

        let mut snapshot = snapshot;
        apply_to_snapshot(&mut snapshot, &changes).unwrap();
        let lines = snapshot.file_lines("main.bean").unwrap();
        assert!(lines.iter().any(|l| l.contains("source_desc")));
    }

    #[test]
    fn reapplied_diff_is_noop() {
        let snapshot = snapshot_with(vec![txn(date(2016, 8, 1), "first", "Assets:Cash", "-1.00")]);
        let mut builder = ChangeSetBuilder::new(&snapshot);
        builder.add_entry(
            "main.bean",
            txn(date(2016, 8, 10), "second", "Assets:Cash", "-2.00"),
        );
        let changes = builder.build();

        let mut applied = snapshot.clone();
        apply_to_snapshot(&mut applied, &changes).unwrap();

        // Re-deriving the diff of each new entry against the applied text
        // yields pure context.
        for new_entry in &changes.new_entries {
            let lines = applied.file_lines(&new_entry.file).unwrap();
            let diff = diff_lines(
                &lines[new_entry.span.start..new_entry.span.end],
                &render_entry_lines(&new_entry.entry),
            );
            assert!(beanrec_utils::diff_is_noop(&diff));
        }
    }

    #[test]
    fn conflicting_text_is_rejected() {
        let snapshot = snapshot_with(vec![txn(date(2016, 8, 9), "coffee", "Assets:Cash", "-2.45")]);
        let old = snapshot.entries[0].clone();
        let mut builder = ChangeSetBuilder::new(&snapshot);
        builder.remove_entry(old);
        let changes = builder.build();

        let mut tampered = snapshot.clone();
        tampered.files.get_mut("main.bean").unwrap()[0] = "tampered".to_string();
        let err = apply_to_snapshot(&mut tampered, &changes).unwrap_err();
        assert!(matches!(err, CoreError::StoreConflict { .. }));
    }

    #[test]
    fn open_directive_inserts_before_transaction() {
        let snapshot = snapshot_with(vec![txn(date(2016, 8, 10), "coffee", "Assets:Cash", "-2.45")]);
        let mut builder = ChangeSetBuilder::new(&snapshot);
        builder.add_entry(
            "main.bean",
            Entry::Open(Open {
                date: date(2016, 8, 10),
                account: "Expenses:Coffee".to_string(),
                currencies: vec!["USD".to_string()],
                meta: Default::default(),
            }),
        );
        let changes = builder.build();

        let mut snapshot = snapshot;
        apply_to_snapshot(&mut snapshot, &changes).unwrap();
        // Same date sorts after the existing entry; both remain addressable.
        for spanned in &snapshot.entries {
            let lines = snapshot.file_lines("main.bean").unwrap();
            assert_eq!(
                lines[spanned.span.start..spanned.span.end].to_vec(),
                render_entry_lines(&spanned.entry)
            );
        }
    }
}
