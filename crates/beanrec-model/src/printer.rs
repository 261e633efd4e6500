//! Rendering of entries to canonical ledger text
//!
//! The reconciler renders entries when formatting pending entries for
//! display and when constructing textual change sets; the output layout
//! (two-space posting indent, four-space posting metadata indent) is the
//! layout the change-set differ assumes.

use crate::entry::{Balance, Close, Entry, Open, Posting, PriceEntry, Transaction};
use crate::types::{Meta, Price};

const DEFAULT_FLAG: &str = "*";

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn push_meta_lines(out: &mut Vec<String>, meta: &Meta, indent: usize) {
    for (key, value) in meta.iter() {
        out.push(format!("{}{}: {}", " ".repeat(indent), key, value));
    }
}

/// Single posting line, without its metadata
pub fn render_posting_line(posting: &Posting) -> String {
    let mut line = String::from("  ");
    if let Some(flag) = &posting.flag {
        line.push_str(flag);
        line.push(' ');
    }
    line.push_str(&posting.account);
    if let Some(amount) = &posting.amount {
        line.push_str("  ");
        line.push_str(&amount.to_string());
    }
    if let Some(cost) = &posting.cost {
        line.push_str(" {");
        line.push_str(&format!("{} {}", cost.number, cost.currency));
        if let Some(date) = cost.date {
            line.push_str(&format!(", {}", date.format("%Y-%m-%d")));
        }
        if let Some(label) = &cost.label {
            line.push_str(&format!(", {}", quote(label)));
        }
        line.push('}');
    }
    match &posting.price {
        Some(Price::Unit(amount)) => line.push_str(&format!(" @ {}", amount)),
        Some(Price::Total(amount)) => line.push_str(&format!(" @@ {}", amount)),
        None => {}
    }
    line
}

fn render_transaction(txn: &Transaction) -> Vec<String> {
    let mut header = format!(
        "{} {}",
        txn.date.format("%Y-%m-%d"),
        txn.flag.as_deref().unwrap_or(DEFAULT_FLAG)
    );
    if let Some(payee) = &txn.payee {
        header.push(' ');
        header.push_str(&quote(payee));
    }
    header.push(' ');
    header.push_str(&quote(txn.narration.as_deref().unwrap_or("")));
    for tag in &txn.tags {
        header.push_str(&format!(" #{}", tag));
    }
    for link in &txn.links {
        header.push_str(&format!(" ^{}", link));
    }

    let mut lines = vec![header];
    push_meta_lines(&mut lines, &txn.meta, 2);
    for posting in &txn.postings {
        lines.push(render_posting_line(posting));
        push_meta_lines(&mut lines, &posting.meta, 4);
    }
    lines
}

fn render_open(open: &Open) -> Vec<String> {
    let mut header = format!("{} open {}", open.date.format("%Y-%m-%d"), open.account);
    if !open.currencies.is_empty() {
        header.push(' ');
        header.push_str(&open.currencies.join(","));
    }
    let mut lines = vec![header];
    push_meta_lines(&mut lines, &open.meta, 2);
    lines
}

fn render_close(close: &Close) -> Vec<String> {
    vec![format!(
        "{} close {}",
        close.date.format("%Y-%m-%d"),
        close.account
    )]
}

fn render_balance(balance: &Balance) -> Vec<String> {
    vec![format!(
        "{} balance {}  {}",
        balance.date.format("%Y-%m-%d"),
        balance.account,
        balance.amount
    )]
}

fn render_price(price: &PriceEntry) -> Vec<String> {
    vec![format!(
        "{} price {}  {}",
        price.date.format("%Y-%m-%d"),
        price.currency,
        price.amount
    )]
}

/// Render an entry as a list of lines
pub fn render_entry_lines(entry: &Entry) -> Vec<String> {
    match entry {
        Entry::Transaction(txn) => render_transaction(txn),
        Entry::Open(open) => render_open(open),
        Entry::Close(close) => render_close(close),
        Entry::Balance(balance) => render_balance(balance),
        Entry::Price(price) => render_price(price),
    }
}

/// Render an entry as a single string without a trailing newline
pub fn render_entry(entry: &Entry) -> String {
    render_entry_lines(entry).join("\n")
}

/// Render a sequence of entries separated by blank lines
pub fn render_entries(entries: &[Entry]) -> String {
    entries
        .iter()
        .map(render_entry)
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Amount, Cost, MetaValue, DATE_KEY};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn amount(s: &str, cur: &str) -> Amount {
        Amount::new(s.parse::<Decimal>().unwrap(), cur)
    }

    #[test]
    fn renders_transaction_with_posting_metadata() {
        let mut txn = Transaction {
            date: date(2016, 8, 10),
            narration: Some("STARBUCKS".to_string()),
            ..Default::default()
        };
        let mut p1 = Posting::new("Liabilities:Credit-Card", Some(amount("-2.45", "USD")));
        p1.meta.insert(DATE_KEY, MetaValue::Date(date(2016, 8, 10)));
        p1.meta
            .insert("source_desc", MetaValue::Text("STARBUCKS".into()));
        txn.postings.push(p1);
        txn.postings
            .push(Posting::new("Expenses:FIXME", Some(amount("2.45", "USD"))));

        let text = render_entry(&Entry::Transaction(txn));
        assert_eq!(
            text,
            "2016-08-10 * \"STARBUCKS\"\n\
             \x20 Liabilities:Credit-Card  -2.45 USD\n\
             \x20   date: 2016-08-10\n\
             \x20   source_desc: \"STARBUCKS\"\n\
             \x20 Expenses:FIXME  2.45 USD"
        );
    }

    #[test]
    fn renders_payee_and_tags() {
        let txn = Transaction {
            date: date(2016, 1, 2),
            payee: Some("Acme".to_string()),
            narration: Some("supplies".to_string()),
            tags: vec!["office".to_string()],
            ..Default::default()
        };
        let text = render_entry(&Entry::Transaction(txn));
        assert_eq!(text, "2016-01-02 * \"Acme\" \"supplies\" #office");
    }

    #[test]
    fn renders_elided_plug_posting() {
        let p = Posting::new("Expenses:FIXME", None);
        assert_eq!(render_posting_line(&p), "  Expenses:FIXME");
    }

    #[test]
    fn renders_cost_basis() {
        let mut p = Posting::new("Assets:Brokerage", Some(amount("3", "HOOL")));
        p.cost = Some(Cost {
            number: "500.00".parse().unwrap(),
            currency: "USD".to_string(),
            date: Some(date(2016, 3, 1)),
            label: None,
        });
        assert_eq!(
            render_posting_line(&p),
            "  Assets:Brokerage  3 HOOL {500.00 USD, 2016-03-01}"
        );
    }

    #[test]
    fn renders_open_with_metadata() {
        let mut open = Open {
            date: date(2015, 1, 1),
            account: "Assets:Checking".to_string(),
            currencies: vec!["USD".to_string()],
            meta: Meta::new(),
        };
        open.meta.insert(
            crate::types::CLEARED_BEFORE_KEY,
            MetaValue::Date(date(2015, 6, 1)),
        );
        assert_eq!(
            render_entry(&Entry::Open(open)),
            "2015-01-01 open Assets:Checking USD\n  cleared_before: 2015-06-01"
        );
    }

    #[test]
    fn renders_balance_and_price() {
        let b = Entry::Balance(Balance {
            date: date(2016, 8, 1),
            account: "Assets:Checking".to_string(),
            amount: amount("1200.00", "USD"),
        });
        assert_eq!(render_entry(&b), "2016-08-01 balance Assets:Checking  1200.00 USD");
        let p = Entry::Price(PriceEntry {
            date: date(2016, 8, 1),
            currency: "HOOL".to_string(),
            amount: amount("510.00", "USD"),
        });
        assert_eq!(render_entry(&p), "2016-08-01 price HOOL  510.00 USD");
    }
}
