use std::borrow::Cow;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chardetng::EncodingDetector;
use chrono::Local;
use csv::{ReaderBuilder, WriterBuilder};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::pipeline::OutputRecord;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
pub const LATITUDE_COLUMN: &str = "latitude";
pub const LONGITUDE_COLUMN: &str = "longitude";

/// One input row: its ordinal position and the text of the address column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressRecord {
    pub index: usize,
    pub raw_address: String,
}

/// Decoded input table with its address column located.
#[derive(Debug, Clone)]
pub struct AddressTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    address_column: usize,
}

impl AddressTable {
    pub fn from_csv_bytes(bytes: &[u8], aliases: &[String]) -> AppResult<Self> {
        let text = decode_input(bytes)?;

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|header| header.to_string())
            .collect();
        let address_column = detect_address_column(&headers, aliases).ok_or_else(|| {
            AppError::Parse(format!(
                "no address column found; expected one of: {}",
                aliases.join(", ")
            ))
        })?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.len() > headers.len() {
                let line = record
                    .position()
                    .map(|position| position.line())
                    .unwrap_or(rows.len() as u64 + 2);
                return Err(AppError::Parse(format!(
                    "line {line} has {} fields but the header has {}",
                    record.len(),
                    headers.len()
                )));
            }
            let mut row: Vec<String> = record.iter().map(|cell| cell.to_string()).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }

        Ok(Self {
            headers,
            rows,
            address_column,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn address_header(&self) -> &str {
        &self.headers[self.address_column]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn records(&self) -> Vec<AddressRecord> {
        self.rows
            .iter()
            .enumerate()
            .map(|(index, row)| AddressRecord {
                index,
                raw_address: row[self.address_column].trim().to_string(),
            })
            .collect()
    }

    /// Appends latitude/longitude columns. `outputs` must be in the order
    /// `records()` produced them.
    pub fn annotate(&self, outputs: &[OutputRecord]) -> AppResult<GeocodedTable> {
        if outputs.len() != self.rows.len() {
            return Err(AppError::Parse(format!(
                "expected {} geocoded rows, got {}",
                self.rows.len(),
                outputs.len()
            )));
        }

        let mut headers = self.headers.clone();
        headers.push(LATITUDE_COLUMN.to_string());
        headers.push(LONGITUDE_COLUMN.to_string());

        let mut rows = Vec::with_capacity(self.rows.len());
        for (position, (row, output)) in self.rows.iter().zip(outputs).enumerate() {
            if output.record.index != position {
                return Err(AppError::Parse(format!(
                    "geocoded row {} arrived at position {position}",
                    output.record.index
                )));
            }
            let mut annotated = row.clone();
            annotated.push(format_coordinate(output.latitude));
            annotated.push(format_coordinate(output.longitude));
            rows.push(annotated);
        }

        Ok(GeocodedTable { headers, rows })
    }
}

/// Input table plus the two coordinate columns, ready for export.
#[derive(Debug, Clone)]
pub struct GeocodedTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl GeocodedTable {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// BOM-prefixed UTF-8 CSV, so spreadsheet tools pick the right encoding.
    pub fn to_csv_bytes(&self) -> AppResult<Vec<u8>> {
        let mut buffer = UTF8_BOM.to_vec();
        self.write_rows(&mut buffer)?;
        Ok(buffer)
    }

    /// Writes via a temporary file in the destination directory, then renames.
    pub fn write_csv(&self, path: &Path) -> AppResult<PathBuf> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let staged = NamedTempFile::new_in(&parent)?;
        let mut writer = BufWriter::new(staged);
        writer.write_all(UTF8_BOM)?;
        self.write_rows(&mut writer)?;
        let staged = writer
            .into_inner()
            .map_err(|err| AppError::Persistence(format!("failed to flush output: {}", err.error())))?;
        staged.persist(path).map_err(|err| {
            AppError::Persistence(format!("{}: {}", path.display(), err.error))
        })?;
        Ok(path.to_path_buf())
    }

    fn write_rows<W: Write>(&self, sink: W) -> AppResult<()> {
        let mut writer = WriterBuilder::new().flexible(true).from_writer(sink);
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// UTF-8 (with or without BOM) is taken as is; anything else goes through
/// charset detection.
fn decode_input(bytes: &[u8]) -> AppResult<Cow<'_, str>> {
    if let Some(rest) = bytes.strip_prefix(UTF8_BOM) {
        return std::str::from_utf8(rest)
            .map(Cow::Borrowed)
            .map_err(|err| AppError::Parse(format!("input is not valid UTF-8: {err}")));
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(Cow::Borrowed(text));
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(AppError::Parse(format!(
            "input could not be decoded as {}",
            encoding.name()
        )));
    }
    debug!(encoding = encoding.name(), "decoded non-UTF-8 input");
    Ok(text)
}

pub fn detect_address_column(headers: &[String], aliases: &[String]) -> Option<usize> {
    aliases.iter().find_map(|alias| {
        let alias = alias.trim();
        headers
            .iter()
            .position(|header| header.trim().eq_ignore_ascii_case(alias))
    })
}

pub fn default_output_name() -> String {
    format!(
        "geocoded_results_{}.csv",
        Local::now().format("%Y%m%d_%H%M%S")
    )
}

fn format_coordinate(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
