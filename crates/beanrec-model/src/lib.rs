//! Ledger entry model
//!
//! In-memory representation of ledger entries (transactions, postings,
//! opens, balances, prices), their typed ordered metadata, and the printer
//! that renders them to canonical ledger text. Journal parsing is handled
//! by an external collaborator; this crate only consumes parsed entries.

pub mod entry;
pub mod error;
pub mod printer;
pub mod types;

pub use entry::{
    Balance, Close, Entry, LineRange, Open, Posting, PriceEntry, SpannedEntry, Transaction,
};
pub use error::ModelError;
pub use printer::{render_entries, render_entry, render_entry_lines, render_posting_line};
pub use types::{
    account_ancestors, account_type, parent_account, AccountType, Amount, Cost, Meta, MetaValue,
    Price, CLEARED_BEFORE_KEY, CLEARED_KEY, DATE_KEY, TRANSACTION_DATE_KEY,
};

/// Sentinel account name marking an unknown posting leg
pub const FIXME_ACCOUNT: &str = "Expenses:FIXME";

/// Prefix of unknown sub-accounts that name a merge group
pub const FIXME_ACCOUNT_PREFIX: &str = "Expenses:FIXME:";

/// Whether an account name is the unknown sentinel or underneath it
pub fn is_unknown_account(account: &str) -> bool {
    account == FIXME_ACCOUNT || account.starts_with(FIXME_ACCOUNT_PREFIX)
}

// ==================== Utility Functions ====================

/// Generate a short hash (16 hex characters) from content
pub fn short_hash(content: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
