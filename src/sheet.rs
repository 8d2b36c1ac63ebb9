//! Recipient sheets for ad hoc sends
//!
//! Reads a CSV/TSV or spreadsheet with a header row and picks out the
//! phone, name, message and token columns.

use crate::error::{Error, Result};
use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;
use tracing::warn;

const PHONE_COLUMNS: &[&str] = &["phone", "נייד", "טלפון"];
const NAME_COLUMNS: &[&str] = &["name", "שם"];
const MESSAGE_COLUMNS: &[&str] = &["personal_message", "message", "הודעה"];
const TOKEN_COLUMNS: &[&str] = &["unique_token", "token"];

/// Explicit column names; unset roles use the built-in candidates
#[derive(Debug, Clone, Default)]
pub struct ColumnHints {
    pub phone: Option<String>,
    pub name: Option<String>,
    pub message: Option<String>,
    pub token: Option<String>,
}

/// One row of a recipient sheet
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    /// 1-based sheet row, header included
    pub row: usize,
    pub phone: String,
    pub name: String,
    pub message: Option<String>,
    pub token: Option<String>,
}

/// Load recipients from `path`; `sheet` is a name or 0-based index for workbooks
pub fn load_recipients(path: &Path, sheet: Option<&str>, hints: &ColumnHints) -> Result<Vec<Recipient>> {
    if !path.exists() {
        return Err(Error::Sheet(format!("file not found: {}", path.display())));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let (headers, rows) = match ext.as_str() {
        "csv" => read_delimited(path, b',')?,
        "tsv" => read_delimited(path, b'\t')?,
        "xlsx" | "xls" | "xlsm" | "xlsb" | "ods" => read_workbook(path, sheet)?,
        other => {
            return Err(Error::Sheet(format!(
                "unsupported file type {:?} (expected csv, tsv, xlsx, xls or ods)",
                other
            )))
        }
    };

    recipients_from_table(&headers, rows, hints)
}

fn read_delimited(path: &Path, delimiter: u8) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok((headers, rows))
}

fn read_workbook(path: &Path, sheet: Option<&str>) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| Error::Sheet(format!("cannot open {}: {}", path.display(), e)))?;

    let names = workbook.sheet_names();
    let name = match sheet {
        None => names.first().cloned(),
        Some(wanted) if names.iter().any(|n| n == wanted) => Some(wanted.to_string()),
        Some(wanted) => wanted.parse::<usize>().ok().and_then(|idx| names.get(idx).cloned()),
    }
    .ok_or_else(|| {
        Error::Sheet(format!(
            "sheet {:?} not found; available: {}",
            sheet.unwrap_or("0"),
            names.join(", ")
        ))
    })?;

    let range = workbook
        .worksheet_range(&name)
        .map_err(|e| Error::Sheet(format!("cannot read sheet {}: {}", name, e)))?;

    let mut rows = range.rows().map(|row| row.iter().map(cell_text).collect::<Vec<_>>());
    let headers = rows
        .next()
        .ok_or_else(|| Error::Sheet(format!("sheet {} is empty", name)))?
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();
    Ok((headers, rows.collect()))
}

/// Whole-number floats lose their `.0` so phone cells stay digits
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

fn resolve_column(headers: &[String], hint: Option<&str>, candidates: &[&str]) -> Result<Option<usize>> {
    if let Some(hint) = hint {
        return headers
            .iter()
            .position(|h| h == hint.trim())
            .map(Some)
            .ok_or_else(|| {
                Error::Sheet(format!("column {:?} not found; available: {}", hint, headers.join(", ")))
            });
    }
    Ok(candidates
        .iter()
        .find_map(|c| headers.iter().position(|h| h == c)))
}

fn recipients_from_table(headers: &[String], rows: Vec<Vec<String>>, hints: &ColumnHints) -> Result<Vec<Recipient>> {
    let phone_col = resolve_column(headers, hints.phone.as_deref(), PHONE_COLUMNS)?.ok_or_else(|| {
        Error::Sheet(format!(
            "no phone column (tried {}); pass --phone-col",
            PHONE_COLUMNS.join(", ")
        ))
    })?;
    let name_col = resolve_column(headers, hints.name.as_deref(), NAME_COLUMNS)?;
    let message_col = resolve_column(headers, hints.message.as_deref(), MESSAGE_COLUMNS)?;
    let token_col = resolve_column(headers, hints.token.as_deref(), TOKEN_COLUMNS)?;

    let cell = |row: &[String], col: Option<usize>| -> Option<String> {
        col.and_then(|c| row.get(c))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let mut recipients = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        let row = row.as_slice();
        let row_number = idx + 2;
        let Some(phone) = cell(row, Some(phone_col)) else {
            if row.iter().any(|v| !v.trim().is_empty()) {
                warn!("row {} has no phone number, skipping", row_number);
            }
            continue;
        };
        recipients.push(Recipient {
            row: row_number,
            phone,
            name: cell(row, name_col).unwrap_or_default(),
            message: cell(row, message_col),
            token: cell(row, token_col),
        });
    }
    Ok(recipients)
}
