//! Session configuration.
//!
//! Every struct here is plain data with a [`Default`] impl and serde support, so callers can
//! build options in code or deserialize them from a config file (missing fields fall back to
//! the defaults).

use serde::{Deserialize, Serialize};

use crate::error::DataIoError;

/// Maximum allowed *inflated* bytes for a single ZIP entry in a package.
pub const MAX_PACKAGE_PART_BYTES: u64 = 256 * 1024 * 1024; // 256 MiB

/// Maximum allowed *inflated* bytes across all ZIP entries in a package.
pub const MAX_PACKAGE_TOTAL_BYTES: u64 = 512 * 1024 * 1024; // 512 MiB

/// Excel rejects (and some versions corrupt) workbooks whose sheet names exceed this length.
pub const MAX_SHEET_NAME_LEN: usize = 30;

/// Width applied to `<col>` entries created by the writer.
pub const DEFAULT_COLUMN_WIDTH: f64 = 9.7109375;

/// Size limits enforced when a package is inflated into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageLimits {
    /// Maximum allowed uncompressed bytes for any single part.
    pub max_part_bytes: u64,
    /// Maximum allowed uncompressed bytes across the whole package.
    pub max_total_bytes: u64,
}

impl Default for PackageLimits {
    fn default() -> Self {
        Self {
            max_part_bytes: MAX_PACKAGE_PART_BYTES,
            max_total_bytes: MAX_PACKAGE_TOTAL_BYTES,
        }
    }
}

/// Number format codes registered as the per-kind defaults of a writer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatDefaults {
    pub date: String,
    pub number: String,
    pub decimal: String,
    pub percent: String,
    pub currency: String,
}

impl Default for FormatDefaults {
    fn default() -> Self {
        Self {
            date: "m/d/yyyy".to_string(),
            number: "0".to_string(),
            decimal: "0.00".to_string(),
            percent: "0%".to_string(),
            currency: r##""$"#,##0.00;("$"#,##0.00)"##.to_string(),
        }
    }
}

/// Where and how [`crate::ExcelParser`] reads rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    pub sheet_name: String,
    /// 1-based header row. `0` means the sheet has no header row; fields are then keyed by
    /// column letter.
    pub header_row: u32,
    /// First 1-based row that holds data.
    pub data_row_start: u32,
    /// Last 1-based data row (inclusive). Ignored when lower than `data_row_start`.
    pub data_row_end: Option<u32>,
    /// First column letter to read (inclusive).
    pub start_column: Option<String>,
    /// Last column letter to read (inclusive).
    pub end_column: Option<String>,
    /// Strip characters outside `[A-Za-z0-9_]` from header names.
    pub remove_invalid_chars: bool,
    pub limits: PackageLimits,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            sheet_name: String::new(),
            header_row: 1,
            data_row_start: 2,
            data_row_end: None,
            start_column: None,
            end_column: None,
            remove_invalid_chars: true,
            limits: PackageLimits::default(),
        }
    }
}

impl ParseOptions {
    pub fn new(sheet_name: impl Into<String>) -> Self {
        Self {
            sheet_name: sheet_name.into(),
            ..Self::default()
        }
    }

    pub fn with_rows(mut self, header_row: u32, data_row_start: u32) -> Self {
        self.header_row = header_row;
        self.data_row_start = data_row_start;
        self
    }

    pub fn with_data_row_end(mut self, data_row_end: u32) -> Self {
        self.data_row_end = Some(data_row_end);
        self
    }

    pub fn with_columns(
        mut self,
        start_column: Option<&str>,
        end_column: Option<&str>,
    ) -> Self {
        self.start_column = start_column.map(str::to_string);
        self.end_column = end_column.map(str::to_string);
        self
    }
}

/// Behaviour of an [`crate::ExcelWriter`] session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    /// 1-based header row. `0` writes no header row.
    pub header_row: u32,
    /// First 1-based data row; must be greater than `header_row`.
    pub data_row: u32,
    /// Build headers from the first row's field names instead of reading them from the sheet.
    /// Defaults to `header_row < 1` when unset.
    pub generate_headers_from_row_shape: Option<bool>,
    /// Create a sheet that is not present in the workbook. Defaults to `true` for a new
    /// workbook and `false` for a template when unset.
    pub create_sheet_if_not_found: Option<bool>,
    /// Remove rows at or after the first written row before writing.
    pub clear_sheet_data_before_write: bool,
    pub default_column_width: f64,
    pub formats: FormatDefaults,
    pub limits: PackageLimits,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            header_row: 1,
            data_row: 2,
            generate_headers_from_row_shape: None,
            create_sheet_if_not_found: None,
            clear_sheet_data_before_write: true,
            default_column_width: DEFAULT_COLUMN_WIDTH,
            formats: FormatDefaults::default(),
            limits: PackageLimits::default(),
        }
    }
}

impl WriterOptions {
    pub fn with_rows(mut self, header_row: u32, data_row: u32) -> Self {
        self.header_row = header_row;
        self.data_row = data_row;
        self
    }

    pub fn with_create_sheet_if_not_found(mut self, create: bool) -> Self {
        self.create_sheet_if_not_found = Some(create);
        self
    }

    pub fn with_generate_headers_from_row_shape(mut self, generate: bool) -> Self {
        self.generate_headers_from_row_shape = Some(generate);
        self
    }

    pub fn with_clear_sheet_data_before_write(mut self, clear: bool) -> Self {
        self.clear_sheet_data_before_write = clear;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), DataIoError> {
        if self.data_row <= self.header_row {
            return Err(DataIoError::InvalidRowLayout {
                header_row: self.header_row,
                data_row: self.data_row,
            });
        }
        Ok(())
    }

    pub(crate) fn generate_headers(&self) -> bool {
        self.generate_headers_from_row_shape
            .unwrap_or(self.header_row < 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_options_reject_data_row_at_or_above_header() {
        let err = WriterOptions::default().with_rows(3, 3).validate().unwrap_err();
        assert!(matches!(
            err,
            DataIoError::InvalidRowLayout {
                header_row: 3,
                data_row: 3
            }
        ));
        assert!(WriterOptions::default().with_rows(0, 1).validate().is_ok());
    }

    #[test]
    fn headerless_writer_generates_headers_by_default() {
        assert!(WriterOptions::default().with_rows(0, 1).generate_headers());
        assert!(!WriterOptions::default().generate_headers());
        assert!(WriterOptions::default()
            .with_generate_headers_from_row_shape(true)
            .generate_headers());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: ParseOptions =
            serde_json::from_str(r#"{"sheet_name":"Employees","end_column":"H"}"#).unwrap();
        assert_eq!(opts.sheet_name, "Employees");
        assert_eq!(opts.header_row, 1);
        assert_eq!(opts.data_row_start, 2);
        assert_eq!(opts.end_column.as_deref(), Some("H"));
        assert!(opts.remove_invalid_chars);

        let writer: WriterOptions = serde_json::from_str(r#"{"data_row":5}"#).unwrap();
        assert_eq!(writer.header_row, 1);
        assert_eq!(writer.data_row, 5);
        assert_eq!(writer.formats.number, "0");
    }

    #[test]
    fn currency_default_quotes_the_symbol_in_both_sections() {
        let formats = FormatDefaults::default();
        assert_eq!(formats.currency, "\"$\"#,##0.00;(\"$\"#,##0.00)");
    }
}
