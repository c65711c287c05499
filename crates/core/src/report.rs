//! Per-target outcomes and their exports.
//!
//! The delimited form quotes every field and doubles embedded quotes, so file
//! names with commas, quotes or newlines survive a round trip.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const CSV_HEADER: &str = "fileName,path,size,status,message,blobUrl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Ok,
    Error,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub file_name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub status: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_url: Option<String>,
}

impl TransferResult {
    pub fn is_ok(&self) -> bool {
        self.status == TransferStatus::Ok
    }
}

/// Append-only record of outcomes. Entries are never edited once pushed.
#[derive(Debug, Clone, Default)]
pub struct ResultLog {
    results: Vec<TransferResult>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: TransferResult) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn records(&self) -> &[TransferResult] {
        &self.results
    }

    pub fn into_records(self) -> Vec<TransferResult> {
        self.results
    }

    /// `(succeeded, failed)`, recomputed from the records.
    pub fn counts(&self) -> (u64, u64) {
        let ok = self.results.iter().filter(|r| r.is_ok()).count() as u64;
        (ok, self.results.len() as u64 - ok)
    }
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

pub fn to_csv(results: &[TransferResult]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for r in results {
        let size = r.size.map(|s| s.to_string()).unwrap_or_default();
        let fields = [
            r.file_name.as_str(),
            r.path.as_str(),
            size.as_str(),
            r.status.as_str(),
            r.message.as_deref().unwrap_or(""),
            r.blob_url.as_deref().unwrap_or(""),
        ];
        let line: Vec<String> = fields.iter().map(|f| quote(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn split_records(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(Error::report("csv ends inside a quoted field"));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Reads back a report written by [`to_csv`].
pub fn parse_csv(text: &str) -> Result<Vec<TransferResult>> {
    let mut records = split_records(text)?.into_iter();
    let header = records.next().unwrap_or_default().join(",");
    if header != CSV_HEADER {
        return Err(Error::report(format!("unexpected header: {header}")));
    }

    let mut out = Vec::new();
    for (line, fields) in records.enumerate() {
        let [file_name, path, size, status, message, blob_url]: [String; 6] =
            fields.try_into().map_err(|f: Vec<String>| {
                Error::report(format!("row {} has {} fields, expected 6", line + 1, f.len()))
            })?;
        let size = match size.as_str() {
            "" => None,
            s => Some(s.parse::<u64>().map_err(|e| {
                Error::report(format!("row {}: bad size {s:?}: {e}", line + 1))
            })?),
        };
        let status = match status.as_str() {
            "ok" => TransferStatus::Ok,
            "error" => TransferStatus::Error,
            other => {
                return Err(Error::report(format!(
                    "row {}: bad status {other:?}",
                    line + 1
                )));
            }
        };
        out.push(TransferResult {
            file_name,
            path,
            size,
            status,
            message: non_empty(message),
            blob_url: non_empty(blob_url),
        });
    }
    Ok(out)
}

pub fn write_csv(path: &Path, results: &[TransferResult]) -> Result<()> {
    std::fs::write(path, to_csv(results))?;
    Ok(())
}

pub fn write_json(path: &Path, results: &[TransferResult]) -> Result<()> {
    let text = serde_json::to_string_pretty(results)
        .map_err(|e| Error::report(format!("json encode failed: {e}")))?;
    std::fs::write(path, text)?;
    Ok(())
}
