use thiserror::Error;

/// Errors produced while reading or writing spreadsheet packages.
#[derive(Debug, Error)]
pub enum DataIoError {
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("xml error: {0}")]
    RoXml(#[from] roxmltree::Error),
    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("utf-8 error: {0}")]
    Utf8Str(#[from] std::str::Utf8Error),
    #[error("xml attribute error: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("missing required attribute: {0}")]
    MissingAttr(&'static str),
    #[error("missing xlsx part: {0}")]
    MissingPart(String),
    #[error("invalid xlsx: {0}")]
    Invalid(String),
    #[error("invalid sheetId value")]
    InvalidSheetId,
    #[error(
        "xlsx package part is too large to load safely: {part} is {size} bytes (max {max} bytes)"
    )]
    PartTooLarge { part: String, size: u64, max: u64 },
    #[error("xlsx package is too large to load safely: {total} bytes uncompressed (max {max})")]
    PackageTooLarge { total: u64, max: u64 },
    #[error("a source path is required")]
    EmptySourcePath,
    #[error("a sheet name is required")]
    EmptySheetName,
    #[error("sheet name '{0}' is too long; excel sheet names have to be 30 characters or less")]
    SheetNameTooLong(String),
    #[error("the data row ({data_row}) must be greater than the header row ({header_row})")]
    InvalidRowLayout { header_row: u32, data_row: u32 },
    #[error("invalid column name '{0}'; expected 1 to 3 letters")]
    InvalidColumnName(String),
    #[error("worksheet named '{0}' not found in the workbook")]
    SheetNotFound(String),
    #[error("the header row ({0}) does not contain any cells")]
    HeaderRowEmpty(u32),
    #[error("column '{0}' found multiple times in the excel file")]
    DuplicateColumnName(String),
    #[error("the workbook has no sheets; write at least one sheet before closing")]
    NoSheets,
    #[error("the writer is closed")]
    WriterClosed,
    #[error("the writer must be closed prior to reading its output")]
    WriterNotClosed,
}
