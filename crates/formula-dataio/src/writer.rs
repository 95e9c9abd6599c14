//! Column-mapped row writer.
//!
//! An [`ExcelWriter`] session owns an in-memory package (a blank workbook or a template copy),
//! the parsed worksheets it has touched and the [`StyleCache`]. Nothing reaches the package
//! bytes until [`ExcelWriter::close`].

use std::collections::hash_map::Entry;
use std::collections::{btree_map, BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use log::{debug, warn};

use crate::column::{column_letter, column_number, Header, HeaderMap};
use crate::error::DataIoError;
use crate::mapping::{CellKind, ColumnMapping};
use crate::options::WriterOptions;
use crate::package::XlsxPackage;
use crate::shared_strings::SharedStrings;
use crate::styles::{StyleCache, StylesPart};
use crate::value::{format_number, to_oa_date, CellValue, RowSource};
use crate::worksheet::{whole_column_sqref, Worksheet};

/// Last row covered by the `numberStoredAsText` annotation of a quoted column.
pub const IGNORED_ERROR_LAST_ROW: u32 = 65_535;

/// Written in place of a date value that cannot be parsed.
pub const DATE_SENTINEL_PREFIX: &str = "#VALUE! : ";

const NUMBER_STORED_AS_TEXT: &str = "numberStoredAsText";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataType {
    Number,
    String,
}

impl DataType {
    fn natural(value: &CellValue) -> Self {
        match value {
            CellValue::Integer(_) | CellValue::Date(_) => DataType::Number,
            CellValue::Float(v) if v.is_finite() => DataType::Number,
            CellValue::Empty | CellValue::Float(_) | CellValue::Text(_) | CellValue::Bool(_) => {
                DataType::String
            }
        }
    }

    /// Type of one value in a column resolved to `column`. Text is only numeric in a numeric
    /// column, and only when it reads as a finite number.
    fn for_value(value: &CellValue, kind: CellKind, column: DataType) -> Self {
        if kind == CellKind::Quoted {
            return DataType::String;
        }
        match value {
            CellValue::Text(text) if column == DataType::Number => {
                if text.trim().parse::<f64>().is_ok_and(f64::is_finite) {
                    DataType::Number
                } else {
                    DataType::String
                }
            }
            other => DataType::natural(other),
        }
    }

    fn as_attr(self) -> &'static str {
        match self {
            DataType::Number => "n",
            DataType::String => "str",
        }
    }
}

/// Style and numeric-ness chosen for a column on its first value of a write. Each cell still
/// gets its own type from [`DataType::for_value`].
#[derive(Debug, Clone, Copy)]
struct ColumnStyle {
    style: u32,
    data_type: DataType,
}

/// One Header Map entry with the mapping that feeds it, resolved once per write.
struct ColumnPlan<'m> {
    col: u32,
    header: Header,
    mapping: Option<&'m ColumnMapping>,
}

/// A writer session over one workbook.
#[derive(Debug)]
pub struct ExcelWriter {
    package: XlsxPackage,
    options: WriterOptions,
    create_sheet: bool,
    styles_part: String,
    styles: StyleCache,
    worksheets: BTreeMap<String, Worksheet>,
    last_rows_written: HashMap<String, u32>,
    output: Option<Vec<u8>>,
}

impl ExcelWriter {
    /// Start a new workbook with no sheets. Missing sheets are created unless the options say
    /// otherwise.
    pub fn new(options: WriterOptions) -> Result<Self, DataIoError> {
        options.validate()?;
        Self::with_package(XlsxPackage::new_blank(), options, true)
    }

    /// Start from a copy of the workbook at `path`. The file itself is never modified.
    pub fn from_template(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self, DataIoError> {
        options.validate()?;
        let package = XlsxPackage::open(path, options.limits)?;
        Self::with_package(package, options, false)
    }

    pub fn from_template_bytes(bytes: &[u8], options: WriterOptions) -> Result<Self, DataIoError> {
        options.validate()?;
        let package = XlsxPackage::from_bytes_limited(bytes, options.limits)?;
        Self::with_package(package, options, false)
    }

    fn with_package(
        mut package: XlsxPackage,
        options: WriterOptions,
        create_by_default: bool,
    ) -> Result<Self, DataIoError> {
        let styles_part = package.ensure_styles_part()?;
        let styles = match package.part(&styles_part) {
            Some(bytes) => StylesPart::parse(bytes)?,
            None => return Err(DataIoError::MissingPart(styles_part)),
        };
        let styles = StyleCache::load(styles, &options.formats);
        Ok(Self {
            package,
            create_sheet: options.create_sheet_if_not_found.unwrap_or(create_by_default),
            options,
            styles_part,
            styles,
            worksheets: BTreeMap::new(),
            last_rows_written: HashMap::new(),
            output: None,
        })
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    pub fn styles(&self) -> &StyleCache {
        &self.styles
    }

    pub fn is_closed(&self) -> bool {
        self.output.is_some()
    }

    /// Write `rows` to `sheet_name` and return how many rows were written.
    ///
    /// Each row is matched to the sheet's Header Map: a mapping bound to the column letter
    /// wins, then a mapping matching the header text, then a same-named field of the row.
    /// Columns with no value are skipped. With `append`, writing resumes after the rows
    /// written earlier in this session (or after the sheet's existing data).
    pub fn write_sheet<R, I>(
        &mut self,
        sheet_name: &str,
        rows: I,
        mappings: &[ColumnMapping],
        append: bool,
    ) -> Result<usize, DataIoError>
    where
        R: RowSource,
        I: IntoIterator<Item = R>,
    {
        if self.is_closed() {
            return Err(DataIoError::WriterClosed);
        }
        let sheet_name = sheet_name.trim();
        if sheet_name.is_empty() {
            return Err(DataIoError::EmptySheetName);
        }

        let header_row = self.options.header_row;
        let data_row = self.options.data_row;
        let width = self.options.default_column_width;

        self.package.remove_calc_chain()?;

        let (sheet, created) = match self.package.find_sheet(sheet_name)? {
            Some(sheet) => (sheet, false),
            None if self.create_sheet => (self.package.add_worksheet(sheet_name)?, true),
            None => return Err(DataIoError::SheetNotFound(sheet_name.to_string())),
        };
        let shared = self.package.shared_strings()?;
        let ws = match self.worksheets.entry(sheet.worksheet_part.clone()) {
            btree_map::Entry::Occupied(e) => e.into_mut(),
            btree_map::Entry::Vacant(e) => {
                let xml = self
                    .package
                    .part(&sheet.worksheet_part)
                    .ok_or_else(|| DataIoError::MissingPart(sheet.worksheet_part.clone()))?;
                e.insert(Worksheet::parse(xml)?)
            }
        };

        ws.ensure_cols(width);

        let session_key = sheet.name.to_lowercase();
        let start_row = match (append, self.last_rows_written.get(&session_key)) {
            (true, Some(last)) => *last,
            (true, None) => ws
                .rows()
                .iter()
                .map(|r| r.index())
                .filter(|index| *index >= data_row)
                .max()
                .map_or(data_row, |last| last + 1),
            (false, _) => data_row,
        };

        if self.options.clear_sheet_data_before_write {
            let removed = ws.remove_rows_from(start_row);
            if removed > 0 {
                debug!("cleared {removed} rows from '{}' at row {start_row}", sheet.name);
            }
        }

        let mut rows = rows.into_iter().peekable();
        let shape = rows.peek().map(|r| r.field_names()).unwrap_or_default();

        let mut headers = if header_row >= 1 && !created {
            read_headers(ws, &shared, header_row)?
        } else if self.options.generate_headers() {
            HeaderMap::from_names(shape.iter().cloned())
        } else {
            HeaderMap::new()
        };
        if headers.is_empty() && mappings.is_empty() {
            headers = HeaderMap::from_names(shape.iter().cloned());
        }

        if header_row >= 1 {
            write_headers(ws, &mut headers, mappings, header_row, created)?;
        } else {
            bind_mapped_columns(&mut headers, mappings);
        }
        debug!("'{}' headers: {:?}", sheet.name, headers.to_pairs());

        for mapping in mappings {
            let kind = mapping.cell_kind();
            if kind == CellKind::Quoted || (kind != CellKind::General && mapping.format_code().is_some()) {
                self.styles.register_format(kind, mapping.format_code(), false);
            }
        }

        let plan = plan_columns(&headers, mappings);
        let mut column_styles: HashMap<u32, ColumnStyle> = HashMap::new();
        let mut row_index = start_row;
        let mut written = 0usize;
        for item in rows {
            ws.ensure_row(row_index);
            for column in &plan {
                let value = match column.mapping {
                    Some(mapping) => mapping.value_for(&item),
                    None if !column.header.bound => item.get(&column.header.name),
                    None => None,
                };
                let Some(value) = value.filter(|v| !v.is_empty()) else {
                    continue;
                };

                let (declared, code) = column
                    .mapping
                    .map_or((CellKind::General, None), |m| (m.cell_kind(), m.format_code()));
                let kind = if declared == CellKind::General {
                    value.inferred_kind()
                } else {
                    declared
                };

                let resolved = match column_styles.entry(column.col) {
                    Entry::Occupied(e) => *e.get(),
                    Entry::Vacant(e) => *e.insert(determine_column_style(
                        ws,
                        &mut self.styles,
                        column.col,
                        kind,
                        code,
                        DataType::natural(&value),
                        width,
                    )),
                };
                let row = ws.ensure_row(row_index);

                let (data_type, text) =
                    if matches!(value, CellValue::Date(_)) || kind == CellKind::Date {
                        match value.as_date() {
                            Some(date) => (DataType::Number, format_number(to_oa_date(date))),
                            None => {
                                let text = value.to_text();
                                warn!(
                                    "'{}'!{}{row_index}: '{text}' is not a date",
                                    sheet.name,
                                    column_letter(column.col)
                                );
                                (DataType::String, format!("{DATE_SENTINEL_PREFIX}{text}"))
                            }
                        }
                    } else {
                        match DataType::for_value(&value, kind, resolved.data_type) {
                            DataType::Number => (DataType::Number, value.to_text().trim().to_string()),
                            DataType::String => (DataType::String, value.to_text()),
                        }
                    };

                let is_new = row.cell(column.col).is_none();
                let cell = row.upsert_cell(column.col);
                cell.set_value(Some(data_type.as_attr()), text);
                if is_new && resolved.style != 0 {
                    cell.style = Some(resolved.style);
                }
            }
            row_index += 1;
            written += 1;
        }

        self.last_rows_written.insert(session_key, row_index);
        debug!(
            "wrote {written} rows to '{}' (rows {start_row}..{row_index})",
            sheet.name
        );
        Ok(written)
    }

    /// Serialize every touched worksheet and the style sheet, then build the package bytes.
    /// Calling it again is a no-op. A workbook without any sheet cannot be closed.
    pub fn close(&mut self) -> Result<(), DataIoError> {
        if self.output.is_some() {
            return Ok(());
        }
        if self.package.workbook_sheets()?.is_empty() {
            return Err(DataIoError::NoSheets);
        }
        for (part, ws) in &self.worksheets {
            self.package.set_part(part.clone(), ws.to_xml()?);
        }
        self.package
            .set_part(self.styles_part.clone(), self.styles.to_xml()?);
        let bytes = self.package.write_to_bytes()?;
        debug!(
            "closed writer: {} worksheets, {} bytes",
            self.worksheets.len(),
            bytes.len()
        );
        self.output = Some(bytes);
        Ok(())
    }

    /// The finished package. Only available after [`ExcelWriter::close`].
    pub fn spreadsheet_bytes(&self) -> Result<&[u8], DataIoError> {
        self.output.as_deref().ok_or(DataIoError::WriterNotClosed)
    }

    /// Close the session and write the package to `path`, creating parent directories.
    pub fn write_to_path(&mut self, path: impl AsRef<Path>) -> Result<(), DataIoError> {
        self.close()?;
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.spreadsheet_bytes()?)?;
        Ok(())
    }

    pub fn write_to<W: Write>(&mut self, mut w: W) -> Result<(), DataIoError> {
        self.close()?;
        w.write_all(self.spreadsheet_bytes()?)?;
        Ok(())
    }

    pub fn into_bytes(mut self) -> Result<Vec<u8>, DataIoError> {
        self.close()?;
        self.output.take().ok_or(DataIoError::WriterNotClosed)
    }
}

/// Header Map of an existing sheet. A missing header row is created empty; a header row
/// without cells is an error.
fn read_headers(
    ws: &mut Worksheet,
    shared: &SharedStrings,
    header_row: u32,
) -> Result<HeaderMap, DataIoError> {
    let mut headers = HeaderMap::new();
    let Some(row) = ws.row(header_row) else {
        ws.ensure_row(header_row);
        return Ok(headers);
    };
    if row.cells().is_empty() {
        return Err(DataIoError::HeaderRowEmpty(header_row));
    }
    for cell in row.cells() {
        let text = match cell.text(shared) {
            Ok(text) => text.unwrap_or_default(),
            Err(err) => {
                warn!(
                    "header cell {}{header_row}: {err}",
                    column_letter(cell.col())
                );
                String::new()
            }
        };
        headers.insert(cell.col(), text);
    }
    headers.fixup();
    Ok(headers)
}

fn mapped_column(mapping: &ColumnMapping) -> Option<u32> {
    if mapping.is_valid_column_name() {
        mapping.column_name().and_then(column_number)
    } else {
        None
    }
}

fn bind_mapped_columns(headers: &mut HeaderMap, mappings: &[ColumnMapping]) {
    for mapping in mappings {
        if let Some(col) = mapped_column(mapping) {
            headers.bind(col, mapping.header_name().unwrap_or_default());
        }
    }
}

/// Add or update header cells and bind column-letter mappings in the Header Map.
fn write_headers(
    ws: &mut Worksheet,
    headers: &mut HeaderMap,
    mappings: &[ColumnMapping],
    header_row: u32,
    created: bool,
) -> Result<(), DataIoError> {
    let row = ws.ensure_row(header_row);
    if created {
        for (col, header) in headers.iter() {
            row.upsert_cell(col)
                .set_value(Some(DataType::String.as_attr()), header.name.clone());
        }
    }

    let mut new_cell_style: Option<u32> = None;
    for mapping in mappings {
        let Some(col) = mapped_column(mapping) else {
            continue;
        };
        headers.bind(col, mapping.header_name().unwrap_or_default());
        let Some(text) = mapping.header_name() else {
            continue;
        };

        if row.cell(col).is_none() {
            let style = if created {
                0
            } else {
                *new_cell_style.get_or_insert_with(|| {
                    row.style()
                        .filter(|s| *s > 0)
                        .or_else(|| row.last_cell_style().filter(|s| *s > 0))
                        .unwrap_or(0)
                })
            };
            let cell = row.upsert_cell(col);
            cell.set_value(Some(DataType::String.as_attr()), text);
            if style > 0 {
                cell.style = Some(style);
            }
        } else if mapping.update_header() {
            row.upsert_cell(col)
                .set_value(Some(DataType::String.as_attr()), text);
        }
    }
    Ok(())
}

/// Pair every header with its mapping: column-letter mappings first, then header-name
/// mappings on columns no letter mapping has claimed.
fn plan_columns<'m>(headers: &HeaderMap, mappings: &'m [ColumnMapping]) -> Vec<ColumnPlan<'m>> {
    headers
        .iter()
        .map(|(col, header)| {
            let letter = column_letter(col);
            let by_column = mappings
                .iter()
                .find(|m| m.column_name().is_some() && m.is_match(&letter, &header.name));
            let mapping = by_column.or_else(|| {
                if header.bound {
                    None
                } else {
                    mappings
                        .iter()
                        .find(|m| m.column_name().is_none() && m.is_match(&letter, &header.name))
                }
            });
            ColumnPlan {
                col,
                header: header.clone(),
                mapping,
            }
        })
        .collect()
}

/// First-value style resolution for a column: the `<col>` style when present, otherwise a
/// style derived from `kind`, recorded on the column so empty cells pick it up too.
fn determine_column_style(
    ws: &mut Worksheet,
    styles: &mut StyleCache,
    col: u32,
    kind: CellKind,
    code: Option<&str>,
    natural: DataType,
    width: f64,
) -> ColumnStyle {
    let mut data_type = if kind == CellKind::Quoted {
        DataType::String
    } else {
        natural
    };
    if let Some(style) = ws.col_style(col).filter(|s| *s > 0) {
        return ColumnStyle { style, data_type };
    }

    let style = match kind {
        CellKind::Quoted => {
            ws.add_ignored_error(
                &whole_column_sqref(col, IGNORED_ERROR_LAST_ROW),
                NUMBER_STORED_AS_TEXT,
            );
            styles.register_format(CellKind::Quoted, code, false)
        }
        numeric if numeric.is_numeric() => {
            data_type = DataType::Number;
            styles.register_format(numeric, code, false)
        }
        _ => 0,
    };
    if style > 0 {
        ws.set_col_style(col, style, width);
    }
    ColumnStyle { style, data_type }
}
