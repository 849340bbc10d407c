//! Immutable in-memory relation audited against.
//!
//! Tables are built once from raw cells (whitespace-normalised, column
//! kinds inferred or declared) and then shared as `Arc<Table>`; nothing
//! mutates a table after construction.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;

/// A typed table cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
    Text(String),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view; numeric-looking text (`"1,200"`, `"$40"`, `"12%"`) counts.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => parse_number(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Text(s) => parse_date(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Text(s) => parse_bool(s),
            _ => None,
        }
    }

    /// Lowercased, trimmed, whitespace-collapsed rendering.
    pub fn normalized_text(&self) -> String {
        normalize_whitespace(&self.to_string()).to_lowercase()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str(""),
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

/// Parse a number, tolerating thousands separators, currency symbols and `%`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£' | '¥' | '%' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    if !cleaned
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
    {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

static NUMBER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"-?[$€£¥]?\d[\d,]*(?:\.\d+)?%?").ok());

/// Number embedded in free text (`"about $1,200 in total"` gives 1200).
///
/// When several appear the last one wins, since answers tend to end with
/// the result: `"100 / 3 = 33.33"` gives 33.33.
pub fn extract_number(text: &str) -> Option<f64> {
    if let Some(n) = parse_number(text) {
        return Some(n);
    }
    last_number_match(text).and_then(parse_number)
}

/// Decimal places of the number [`extract_number`] reads from `text`.
pub fn decimal_places(text: &str) -> usize {
    let digits = match parse_number(text) {
        Some(_) => text.trim(),
        None => last_number_match(text).unwrap_or(""),
    };
    digits
        .split_once('.')
        .map(|(_, frac)| frac.chars().take_while(char::is_ascii_digit).count())
        .unwrap_or(0)
}

fn last_number_match(text: &str) -> Option<&str> {
    let re = NUMBER_RE.as_ref()?;
    re.find_iter(text).last().map(|m| m.as_str())
}

/// Parse an ISO `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Collapse embedded newlines and runs of whitespace into single spaces.
pub fn normalize_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Text,
    Date,
    Categorical,
    Boolean,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnKind::Numeric => "numeric",
            ColumnKind::Text => "text",
            ColumnKind::Date => "date",
            ColumnKind::Categorical => "categorical",
            ColumnKind::Boolean => "boolean",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TableError {
    #[error("table has no columns")]
    EmptyHeader,

    #[error("duplicate column name: {0}")]
    DuplicateColumn(String),

    #[error("row {row} has {found} cells, expected {expected}")]
    Ragged {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("value {value:?} in column {column} is not {kind}")]
    KindMismatch {
        column: String,
        value: String,
        kind: ColumnKind,
    },
}

/// Columns, kinds and leading rows; what a synthesized program may assume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub name: String,
    pub columns: Vec<Column>,
    pub sample_rows: Vec<Vec<Value>>,
}

const SNAPSHOT_ROWS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Build a table from raw string cells, inferring column kinds.
    pub fn from_raw(
        name: impl Into<String>,
        header: Vec<String>,
        rows: Vec<Vec<String>>,
    ) -> Result<Self, TableError> {
        if header.is_empty() {
            return Err(TableError::EmptyHeader);
        }
        let header: Vec<String> = header.iter().map(|h| normalize_whitespace(h)).collect();
        let mut seen = HashSet::new();
        for name in &header {
            if !seen.insert(name.to_lowercase()) {
                return Err(TableError::DuplicateColumn(name.clone()));
            }
        }

        let mut cells = Vec::with_capacity(rows.len());
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != header.len() {
                return Err(TableError::Ragged {
                    row: i,
                    expected: header.len(),
                    found: row.len(),
                });
            }
            cells.push(row.iter().map(|c| normalize_whitespace(c)).collect::<Vec<_>>());
        }

        let mut columns = Vec::with_capacity(header.len());
        for (idx, name) in header.into_iter().enumerate() {
            let kind = infer_kind(cells.iter().map(|row| row[idx].as_str()));
            columns.push(Column { name, kind });
        }

        let mut typed = Vec::with_capacity(cells.len());
        for row in &cells {
            let mut out = Vec::with_capacity(row.len());
            for (cell, column) in row.iter().zip(&columns) {
                out.push(convert_cell(cell, column)?);
            }
            typed.push(out);
        }

        Ok(Self {
            name: name.into(),
            columns,
            rows: typed,
        })
    }

    /// Override inferred kinds, re-typing the affected columns.
    pub fn with_kinds(mut self, kinds: &BTreeMap<String, ColumnKind>) -> Result<Self, TableError> {
        for (name, kind) in kinds {
            let idx = self
                .column_index(name)
                .ok_or_else(|| TableError::UnknownColumn(name.clone()))?;
            self.columns[idx].kind = *kind;
            let column = self.columns[idx].clone();
            for row in &mut self.rows {
                let raw = row[idx].to_string();
                row[idx] = convert_cell(&raw, &column)?;
            }
        }
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Case-insensitive, whitespace-normalised column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let wanted = normalize_whitespace(name).to_lowercase();
        self.columns
            .iter()
            .position(|c| c.name.to_lowercase() == wanted)
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    pub fn schema_snapshot(&self) -> SchemaSnapshot {
        SchemaSnapshot {
            name: self.name.clone(),
            columns: self.columns.clone(),
            sample_rows: self.rows.iter().take(SNAPSHOT_ROWS).cloned().collect(),
        }
    }

    /// Digest of the schema snapshot; stable across row additions past
    /// the snapshot window.
    pub fn schema_digest(&self) -> ContentDigest {
        let snapshot = self.schema_snapshot();
        let mut parts: Vec<String> = vec![snapshot.name];
        for column in &snapshot.columns {
            parts.push(format!("{}:{}", column.name, column.kind));
        }
        for row in &snapshot.sample_rows {
            parts.push(
                row.iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("\u{1f}"),
            );
        }
        let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_bytes()).collect();
        ContentDigest::from_parts(&refs)
    }

    /// Markdown rendering for prompts, optionally truncated to `limit` rows.
    pub fn render_markdown(&self, limit: Option<usize>) -> String {
        let mut out = String::new();
        out.push_str("| ");
        out.push_str(
            &self
                .columns
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(" | "),
        );
        out.push_str(" |\n|");
        for _ in &self.columns {
            out.push_str("---|");
        }
        out.push('\n');
        let shown = limit.unwrap_or(self.rows.len()).min(self.rows.len());
        for row in &self.rows[..shown] {
            out.push_str("| ");
            out.push_str(
                &row.iter()
                    .map(|v| v.to_string().replace('|', "\\|"))
                    .collect::<Vec<_>>()
                    .join(" | "),
            );
            out.push_str(" |\n");
        }
        if shown < self.rows.len() {
            out.push_str(&format!("... ({} more rows)\n", self.rows.len() - shown));
        }
        out
    }
}

fn infer_kind<'a>(cells: impl Iterator<Item = &'a str> + Clone) -> ColumnKind {
    let mut non_empty = cells.filter(|c| !c.is_empty()).peekable();
    if non_empty.peek().is_none() {
        return ColumnKind::Text;
    }
    if non_empty.clone().all(|c| parse_number(c).is_some()) {
        ColumnKind::Numeric
    } else if non_empty.clone().all(|c| parse_date(c).is_some()) {
        ColumnKind::Date
    } else if non_empty.all(|c| parse_bool(c).is_some()) {
        ColumnKind::Boolean
    } else {
        ColumnKind::Text
    }
}

fn convert_cell(raw: &str, column: &Column) -> Result<Value, TableError> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    let converted = match column.kind {
        ColumnKind::Numeric => parse_number(raw).map(Value::Number),
        ColumnKind::Date => parse_date(raw).map(Value::Date),
        ColumnKind::Boolean => parse_bool(raw).map(Value::Bool),
        ColumnKind::Text | ColumnKind::Categorical => Some(Value::Text(raw.to_string())),
    };
    converted.ok_or_else(|| TableError::KindMismatch {
        column: column.name.clone(),
        value: raw.to_string(),
        kind: column.kind,
    })
}

/// Table as it arrives in a dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    #[serde(default)]
    pub name: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Declared kinds overriding inference.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kinds: BTreeMap<String, ColumnKind>,
}

impl RawTable {
    pub fn into_table(self) -> Result<Table, TableError> {
        let rows = self
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(json_cell).collect())
            .collect();
        let table = Table::from_raw(self.name, self.header, rows)?;
        if self.kinds.is_empty() {
            Ok(table)
        } else {
            table.with_kinds(&self.kinds)
        }
    }
}

fn json_cell(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}
