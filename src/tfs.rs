//! Table file system (TFS) codec, the tabular text format written by the
//! MAD family of optics codes.
//!
//! A TFS file holds `@` header lines, a `*` line of column names, a `$` line
//! of column types and whitespace-separated data rows. Only the three types
//! the turn-by-turn tables use are supported: `%s` (quoted text), `%le`
//! (floating point) and `%d` (integer).

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use super::error::TfsError;

/// One header value.
#[derive(Debug, Clone, PartialEq)]
pub enum TfsValue {
    Text(String),
    Number(f64),
    Integer(i64),
}

/// One typed column.
#[derive(Debug, Clone, PartialEq)]
pub enum TfsData {
    Text(Vec<String>),
    Number(Vec<f64>),
    Integer(Vec<i64>),
}

impl TfsData {
    fn len(&self) -> usize {
        match self {
            TfsData::Text(v) => v.len(),
            TfsData::Number(v) => v.len(),
            TfsData::Integer(v) => v.len(),
        }
    }

    fn type_tag(&self) -> &'static str {
        match self {
            TfsData::Text(_) => "%s",
            TfsData::Number(_) => "%le",
            TfsData::Integer(_) => "%d",
        }
    }
}

/// An in-memory TFS table: ordered headers and ordered, named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TfsTable {
    pub headers: Vec<(String, TfsValue)>,
    pub columns: Vec<(String, TfsData)>,
}

impl TfsTable {
    pub fn header(&self, name: &str) -> Option<&TfsValue> {
        self.headers
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }

    pub fn column(&self, name: &str) -> Option<&TfsData> {
        self.columns
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map(|(_, data)| data.len()).unwrap_or(0)
    }
}

/// Read a TFS file into memory.
pub fn read_tfs_file(path: &Path) -> Result<TfsTable, TfsError> {
    let reader = BufReader::new(File::open(path)?);
    let mut headers = Vec::new();
    let mut names: Option<Vec<String>> = None;
    let mut columns: Option<Vec<(String, TfsData)>> = None;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('@') {
            headers.push(parse_header(rest.trim())?);
        } else if let Some(rest) = trimmed.strip_prefix('*') {
            names = Some(tokenize(rest).into_iter().collect());
        } else if let Some(rest) = trimmed.strip_prefix('$') {
            let types = tokenize(rest);
            let names = names
                .take()
                .ok_or_else(|| TfsError::MalformedLine(line.clone()))?;
            if names.len() != types.len() {
                return Err(TfsError::RowLengthMismatch {
                    expected: names.len(),
                    found: types.len(),
                });
            }
            columns = Some(
                names
                    .into_iter()
                    .zip(types)
                    .map(|(name, tag)| {
                        let data = match tag.as_str() {
                            "%s" => TfsData::Text(Vec::new()),
                            "%le" | "%f" | "%lf" => TfsData::Number(Vec::new()),
                            "%d" | "%hd" | "%ld" => TfsData::Integer(Vec::new()),
                            _ => return Err(TfsError::BadValue(tag)),
                        };
                        Ok((name, data))
                    })
                    .collect::<Result<Vec<_>, TfsError>>()?,
            );
        } else {
            let columns = columns
                .as_mut()
                .ok_or_else(|| TfsError::MalformedLine(line.clone()))?;
            let tokens = tokenize(trimmed);
            if tokens.len() != columns.len() {
                return Err(TfsError::RowLengthMismatch {
                    expected: columns.len(),
                    found: tokens.len(),
                });
            }
            for ((_, data), token) in columns.iter_mut().zip(tokens) {
                match data {
                    TfsData::Text(v) => v.push(token),
                    TfsData::Number(v) => v.push(
                        token
                            .parse::<f64>()
                            .map_err(|_| TfsError::BadValue(token.clone()))?,
                    ),
                    TfsData::Integer(v) => v.push(
                        token
                            .parse::<i64>()
                            .map_err(|_| TfsError::BadValue(token.clone()))?,
                    ),
                }
            }
        }
    }
    Ok(TfsTable {
        headers,
        columns: columns.unwrap_or_default(),
    })
}

/// Write a TFS table.
pub fn write_tfs_file(path: &Path, table: &TfsTable) -> Result<(), TfsError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for (name, value) in &table.headers {
        match value {
            TfsValue::Text(v) => writeln!(writer, "@ {name} %s \"{v}\"")?,
            TfsValue::Number(v) => writeln!(writer, "@ {name} %le {v}")?,
            TfsValue::Integer(v) => writeln!(writer, "@ {name} %d {v}")?,
        }
    }
    let names = table
        .columns
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let types = table
        .columns
        .iter()
        .map(|(_, data)| data.type_tag())
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(writer, "* {names}")?;
    writeln!(writer, "$ {types}")?;
    for row in 0..table.n_rows() {
        let mut fields = Vec::with_capacity(table.columns.len());
        for (_, data) in &table.columns {
            fields.push(match data {
                TfsData::Text(v) => format!("\"{}\"", v[row]),
                TfsData::Number(v) => format!("{}", v[row]),
                TfsData::Integer(v) => format!("{}", v[row]),
            });
        }
        writeln!(writer, "{}", fields.join(" "))?;
    }
    writer.flush()?;
    Ok(())
}

/// Parse one `@ NAME %type value` header (the `@` already stripped).
fn parse_header(rest: &str) -> Result<(String, TfsValue), TfsError> {
    let tokens = tokenize(rest);
    if tokens.len() < 3 {
        return Err(TfsError::MalformedLine(rest.to_string()));
    }
    let name = tokens[0].clone();
    let value = match tokens[1].as_str() {
        "%s" => TfsValue::Text(tokens[2..].join(" ")),
        "%le" | "%f" | "%lf" => TfsValue::Number(
            tokens[2]
                .parse::<f64>()
                .map_err(|_| TfsError::BadValue(tokens[2].clone()))?,
        ),
        "%d" | "%hd" | "%ld" => TfsValue::Integer(
            tokens[2]
                .parse::<i64>()
                .map_err(|_| TfsError::BadValue(tokens[2].clone()))?,
        ),
        other => return Err(TfsError::BadValue(other.to_string())),
    };
    Ok((name, value))
}

/// Split a line into whitespace-separated tokens, treating a double-quoted
/// span as one token with the quotes removed.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                if !in_quotes {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
