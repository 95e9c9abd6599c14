//! XLSX row exchange.
//!
//! The crate moves tabular records in and out of Office Open XML workbooks:
//!
//! - [`ExcelParser`]: streams the rows of one worksheet as [`ParsedRow`]s, keyed by the
//!   header row text (or by column letter when the sheet has no header row).
//! - [`ExcelWriter`]: writes [`RowSource`] rows into a new workbook or a copy of a template,
//!   matching fields to columns through [`ColumnMapping`]s and registering number formats in
//!   the workbook style sheet as needed.
//! - [`list_sheet_names`]: sheet enumeration in workbook order.
//!
//! Both directions sit on [`XlsxPackage`], an in-memory Open Packaging Convention (OPC) ZIP
//! (part name -> bytes) that preserves every part it does not understand.

pub mod column;
mod error;
pub mod mapping;
mod minimal;
pub mod openxml;
pub mod options;
mod package;
mod parser;
pub mod shared_strings;
pub mod sheet_metadata;
pub mod styles;
pub mod value;
pub mod worksheet;
mod writer;

pub use column::{column_letter, column_number, Header, HeaderMap};
pub use error::DataIoError;
pub use mapping::{CellKind, ColumnMapping};
pub use options::{FormatDefaults, PackageLimits, ParseOptions, WriterOptions};
pub use package::{list_sheet_names, WorksheetPartInfo, XlsxPackage};
pub use parser::{is_date_format, ExcelParser, ParsedRow, ParsedRows};
pub use sheet_metadata::{SheetVisibility, WorkbookSheetInfo};
pub use styles::StyleCache;
pub use value::{CellValue, Record, RowSource};
pub use writer::{ExcelWriter, DATE_SENTINEL_PREFIX, IGNORED_ERROR_LAST_ROW};
