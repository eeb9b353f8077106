//! Parsing for the CSV reports emitted by the transfer scripts.

use std::collections::BTreeMap;

use crate::transport::TransportError;

/// One CSV row keyed by header name.
pub(crate) type Row = BTreeMap<String, String>;

/// Parses `ConvertTo-Csv` output into rows keyed by the header line.
pub(crate) fn parse_csv(text: &str) -> Result<Vec<Row>, TransportError> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));

    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let header = split_record(header_line)?;

    lines
        .map(|line| {
            let fields = split_record(line)?;
            if fields.len() != header.len() {
                return Err(malformed(format!(
                    "expected {} columns, found {} in `{line}`",
                    header.len(),
                    fields.len()
                )));
            }
            Ok(header.iter().cloned().zip(fields).collect())
        })
        .collect()
}

/// Reads a required column from `row`.
pub(crate) fn column<'a>(row: &'a Row, name: &str) -> Result<&'a str, TransportError> {
    row.get(name)
        .map(String::as_str)
        .ok_or_else(|| malformed(format!("missing column `{name}`")))
}

/// Reads a PowerShell boolean column (`True` / `False`).
pub(crate) fn flag(row: &Row, name: &str) -> Result<bool, TransportError> {
    let value = column(row, name)?;
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(malformed(format!("column `{name}` is not a boolean: {other}"))),
    }
}

fn split_record(line: &str) -> Result<Vec<String>, TransportError> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match (ch, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => quoted = false,
            ('"', false) if field.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            (other, _) => field.push(other),
        }
    }
    if quoted {
        return Err(malformed(format!("unterminated quote in `{line}`")));
    }
    fields.push(field);
    Ok(fields)
}

fn malformed(message: String) -> TransportError {
    TransportError::Transfer {
        message: format!("malformed transfer report: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_powershell_csv() {
        let text = "\"src_digest\",\"dst\",\"chk_exists\",\"chk_dirty\",\"verifies\"\r\n\
\"ab12\",\"C:\\a, b\\\"\"quoted\"\".txt\",\"True\",\"False\",\"True\"\r\n";

        let rows = parse_csv(text).unwrap_or_else(|err| panic!("parse: {err}"));

        let [row] = rows.as_slice() else {
            panic!("expected one row, got {}", rows.len());
        };
        assert_eq!(column(row, "src_digest").ok(), Some("ab12"));
        assert_eq!(column(row, "dst").ok(), Some("C:\\a, b\\\"quoted\".txt"));
        assert_eq!(flag(row, "chk_exists").ok(), Some(true));
        assert_eq!(flag(row, "chk_dirty").ok(), Some(false));
    }

    #[test]
    fn skips_type_lines_and_blank_output() {
        assert_eq!(parse_csv("").ok().map(|rows| rows.len()), Some(0));
        let rows = parse_csv("#TYPE System.Management.Automation.PSCustomObject\n\"a\"\n\"1\"\n")
            .unwrap_or_else(|err| panic!("parse: {err}"));
        let row = rows.first().unwrap_or_else(|| panic!("row missing"));
        assert_eq!(column(row, "a").ok(), Some("1"));
    }

    #[test]
    fn column_count_mismatch_is_rejected() {
        let err = parse_csv("\"a\",\"b\"\n\"1\"\n").expect_err("mismatch");
        assert!(err.to_string().contains("expected 2 columns"));
    }
}
