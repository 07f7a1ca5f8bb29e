//! Named counters issuing formatted identifiers (`SO0001`, `INV/2025/0042`).
//!
//! Counters live in the `ir_sequence` table. Issuing a number is one
//! `UPDATE ... RETURNING` statement, so concurrent writers never receive the
//! same value and no lock is taken in the process.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use openerp_sql::{Row, SQLStore, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::OrmError;

pub const SEQUENCE_TABLE: &str = "ir_sequence";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS ir_sequence (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code VARCHAR NOT NULL UNIQUE,
    name VARCHAR NOT NULL,
    prefix VARCHAR NOT NULL DEFAULT '',
    suffix VARCHAR NOT NULL DEFAULT '',
    padding INTEGER NOT NULL DEFAULT 4,
    next_value INTEGER NOT NULL DEFAULT 1,
    increment INTEGER NOT NULL DEFAULT 1,
    use_date_range BOOLEAN NOT NULL DEFAULT 0,
    active BOOLEAN NOT NULL DEFAULT 1
)";

const NEXT: &str = "UPDATE ir_sequence SET next_value = next_value + increment \
    WHERE code = ?1 AND active \
    RETURNING next_value - increment AS issued, prefix, suffix, padding, use_date_range";

/// A named counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCounter {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default = "default_padding")]
    pub padding: u32,
    #[serde(default = "default_one")]
    pub next_value: i64,
    #[serde(default = "default_one")]
    pub increment: i64,
    /// Expand date tokens in prefix and suffix.
    #[serde(default)]
    pub use_date_range: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_padding() -> u32 {
    4
}

fn default_one() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

impl SequenceCounter {
    pub fn new(code: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            prefix: String::new(),
            suffix: String::new(),
            padding: default_padding(),
            next_value: 1,
            increment: 1,
            use_date_range: false,
            active: true,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.suffix = suffix.to_string();
        self
    }

    pub fn with_padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_increment(mut self, increment: i64) -> Self {
        self.increment = increment;
        self
    }

    pub fn starting_at(mut self, value: i64) -> Self {
        self.next_value = value;
        self
    }

    pub fn dated(mut self) -> Self {
        self.use_date_range = true;
        self
    }

    fn from_row(row: &Row) -> Result<Self, OrmError> {
        let text = |column: &str| {
            row.get_str(column)
                .map(str::to_string)
                .ok_or_else(|| OrmError::Internal(format!("ir_sequence.{column} missing")))
        };
        let int = |column: &str| {
            row.get_i64(column)
                .ok_or_else(|| OrmError::Internal(format!("ir_sequence.{column} missing")))
        };
        Ok(Self {
            code: text("code")?,
            name: text("name")?,
            prefix: text("prefix")?,
            suffix: text("suffix")?,
            padding: u32::try_from(int("padding")?).unwrap_or(0),
            next_value: int("next_value")?,
            increment: int("increment")?,
            use_date_range: row.get_bool("use_date_range").unwrap_or(false),
            active: row.get_bool("active").unwrap_or(false),
        })
    }

    /// The code this counter would issue for `value`.
    pub fn format(&self, value: i64, as_of: NaiveDate) -> String {
        format_code(
            &self.prefix,
            &self.suffix,
            self.padding,
            value,
            self.use_date_range,
            as_of,
        )
    }
}

/// Issues and previews sequence codes.
#[derive(Clone)]
pub struct SequenceGenerator {
    store: Arc<dyn SQLStore>,
}

impl SequenceGenerator {
    pub fn new(store: Arc<dyn SQLStore>) -> Self {
        Self { store }
    }

    /// Create the counter table if missing.
    pub async fn ensure_table(&self) -> Result<(), OrmError> {
        self.store.exec(CREATE_TABLE, &[]).await?;
        Ok(())
    }

    /// Insert `counter` unless a counter with the same code exists.
    /// Returns whether it was inserted.
    pub async fn create(&self, counter: &SequenceCounter) -> Result<bool, OrmError> {
        if counter.increment == 0 {
            return Err(OrmError::validation(format!(
                "sequence '{}': increment must not be zero",
                counter.code
            )));
        }
        let inserted = self
            .store
            .exec(
                "INSERT INTO ir_sequence \
                 (code, name, prefix, suffix, padding, next_value, increment, use_date_range, active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT (code) DO NOTHING",
                &[
                    Value::from(counter.code.as_str()),
                    Value::from(counter.name.as_str()),
                    Value::from(counter.prefix.as_str()),
                    Value::from(counter.suffix.as_str()),
                    Value::Integer(i64::from(counter.padding)),
                    Value::Integer(counter.next_value),
                    Value::Integer(counter.increment),
                    Value::from(counter.use_date_range),
                    Value::from(counter.active),
                ],
            )
            .await?;
        if inserted > 0 {
            info!("sequence '{}' created", counter.code);
        }
        Ok(inserted > 0)
    }

    /// Look up a counter, active or not.
    pub async fn get(&self, code: &str) -> Result<Option<SequenceCounter>, OrmError> {
        let rows = self
            .store
            .query(
                "SELECT code, name, prefix, suffix, padding, next_value, increment, \
                 use_date_range, active FROM ir_sequence WHERE code = ?1",
                &[Value::from(code)],
            )
            .await?;
        rows.first().map(SequenceCounter::from_row).transpose()
    }

    /// Issue the next code of an active counter.
    ///
    /// Date tokens expand against `as_of`, or today (UTC) when absent.
    pub async fn next(&self, code: &str, as_of: Option<NaiveDate>) -> Result<String, OrmError> {
        let rows = self.store.query(NEXT, &[Value::from(code)]).await?;
        let row = rows
            .first()
            .ok_or_else(|| OrmError::SequenceNotFound(code.to_string()))?;
        let issued = row
            .get_i64("issued")
            .ok_or_else(|| OrmError::Internal("sequence update returned no value".into()))?;
        let formatted = format_code(
            row.get_str("prefix").unwrap_or_default(),
            row.get_str("suffix").unwrap_or_default(),
            row.get_i64("padding")
                .and_then(|p| u32::try_from(p).ok())
                .unwrap_or(0),
            issued,
            row.get_bool("use_date_range").unwrap_or(false),
            as_of.unwrap_or_else(today),
        );
        debug!("sequence '{code}' issued {formatted}");
        Ok(formatted)
    }

    /// The code `next` would issue, without consuming it.
    pub async fn preview(
        &self,
        code: &str,
        as_of: Option<NaiveDate>,
    ) -> Result<Option<String>, OrmError> {
        Ok(self
            .get(code)
            .await?
            .filter(|counter| counter.active)
            .map(|counter| counter.format(counter.next_value, as_of.unwrap_or_else(today))))
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Render `prefix + zero-padded value + suffix`.
///
/// With `use_date_range`, `%(year)`/`%y`, `%(month)`/`%m` and `%(day)`/`%d`
/// in prefix and suffix become the 4-digit year and the 2-digit month and
/// day of `as_of`. Tokens match case-insensitively.
pub fn format_code(
    prefix: &str,
    suffix: &str,
    padding: u32,
    value: i64,
    use_date_range: bool,
    as_of: NaiveDate,
) -> String {
    let (prefix, suffix) = if use_date_range {
        (interpolate(prefix, as_of), interpolate(suffix, as_of))
    } else {
        (prefix.to_string(), suffix.to_string())
    };
    let width = padding as usize;
    format!("{prefix}{value:0width$}{suffix}")
}

const TOKENS: [(&str, DatePart); 6] = [
    ("%(year)", DatePart::Year),
    ("%(month)", DatePart::Month),
    ("%(day)", DatePart::Day),
    ("%y", DatePart::Year),
    ("%m", DatePart::Month),
    ("%d", DatePart::Day),
];

#[derive(Clone, Copy)]
enum DatePart {
    Year,
    Month,
    Day,
}

fn interpolate(template: &str, date: NaiveDate) -> String {
    let mut out = String::with_capacity(template.len() + 4);
    let mut rest = template;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let token = TOKENS.iter().find(|(token, _)| {
            rest.get(..token.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(token))
        });
        match token {
            Some((token, part)) => {
                match part {
                    DatePart::Year => out.push_str(&format!("{:04}", date.year())),
                    DatePart::Month => out.push_str(&format!("{:02}", date.month())),
                    DatePart::Day => out.push_str(&format!("{:02}", date.day())),
                }
                rest = &rest[token.len()..];
            }
            None => {
                out.push('%');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
