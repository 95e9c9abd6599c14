//! Streaming worksheet reader that turns rows into named fields.
//!
//! The worksheet part is never materialized as a tree: [`ExcelParser::rows`] pulls one `<row>`
//! at a time out of a quick-xml reader, so memory stays flat regardless of sheet size.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use log::{debug, trace};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::column::{column_letter, column_number, split_cell_reference, HeaderMap};
use crate::error::DataIoError;
use crate::options::ParseOptions;
use crate::package::XlsxPackage;
use crate::shared_strings::{read_string_item, read_text, SharedStrings};
use crate::styles::StylesPart;
use crate::value::{format_date, from_oa_date, parse_date, CellValue, RowSource};

/// Built-in number formats 14 through 22 are the date/time formats.
const BUILTIN_DATE_FORMATS: std::ops::RangeInclusive<u32> = 14..=22;

fn date_token() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)[dhmsy]").expect("valid regex"))
}

/// Returns `true` when a number format renders its value as a date or time.
///
/// Custom codes containing `[` are rejected so color and locale qualifiers such as `[Red]`
/// do not look like date tokens.
pub fn is_date_format(num_fmt_id: u32, code: Option<&str>) -> bool {
    if BUILTIN_DATE_FORMATS.contains(&num_fmt_id) {
        return true;
    }
    match code {
        Some(code) => !code.contains('[') && date_token().is_match(code),
        None => false,
    }
}

/// Which cell formats (by `cellXfs` index) display dates.
#[derive(Debug, Clone, Default)]
struct DateStyles {
    flags: Vec<bool>,
}

impl DateStyles {
    fn from_styles(styles: &StylesPart) -> Self {
        let flags = styles
            .cell_xfs()
            .iter()
            .map(|xf| is_date_format(xf.num_fmt_id, styles.num_fmt_code(xf.num_fmt_id)))
            .collect();
        Self { flags }
    }

    fn is_date(&self, style: u32) -> bool {
        self.flags.get(style as usize).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ColumnRange {
    start: Option<u32>,
    end: Option<u32>,
}

impl ColumnRange {
    fn from_options(options: &ParseOptions) -> Result<Self, DataIoError> {
        fn bound(column: Option<&str>) -> Result<Option<u32>, DataIoError> {
            match column.map(str::trim).filter(|c| !c.is_empty()) {
                None => Ok(None),
                Some(c) => column_number(c)
                    .map(Some)
                    .ok_or_else(|| DataIoError::InvalidColumnName(c.to_string())),
            }
        }
        Ok(Self {
            start: bound(options.start_column.as_deref())?,
            end: bound(options.end_column.as_deref())?,
        })
    }

    fn contains(&self, col: u32) -> bool {
        self.start.map_or(true, |s| col >= s) && self.end.map_or(true, |e| col <= e)
    }
}

#[derive(Debug, Default)]
struct RawCell {
    col: u32,
    style: Option<u32>,
    data_type: Option<String>,
    value: Option<String>,
    inline_text: Option<String>,
}

impl RawCell {
    fn has_content(&self) -> bool {
        [&self.value, &self.inline_text]
            .into_iter()
            .flatten()
            .any(|v| !v.trim().is_empty())
    }
}

#[derive(Debug)]
struct RawRow {
    index: u32,
    cells: Vec<RawCell>,
}

/// Forward-only `<row>` reader over a worksheet part.
struct RowStream<'a> {
    reader: Reader<&'a [u8]>,
    buf: Vec<u8>,
    last_row: u32,
    done: bool,
}

impl<'a> RowStream<'a> {
    fn new(xml: &'a [u8]) -> Self {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);
        Self {
            reader,
            buf: Vec::new(),
            last_row: 0,
            done: false,
        }
    }

    fn next_row(&mut self) -> Result<Option<RawRow>, DataIoError> {
        if self.done {
            return Ok(None);
        }
        loop {
            self.buf.clear();
            let (start, has_children) = match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) if e.local_name().as_ref() == b"row" => (e.into_owned(), true),
                Event::Empty(e) if e.local_name().as_ref() == b"row" => (e.into_owned(), false),
                Event::End(e) if e.local_name().as_ref() == b"sheetData" => {
                    self.done = true;
                    return Ok(None);
                }
                Event::Eof => {
                    self.done = true;
                    return Ok(None);
                }
                _ => continue,
            };

            let mut index = self.last_row + 1;
            for attr in start.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"r" {
                    if let Ok(r) = attr.unescape_value()?.trim().parse::<u32>() {
                        index = r;
                    }
                }
            }
            self.last_row = index;

            let cells = if has_children {
                self.read_cells()?
            } else {
                Vec::new()
            };
            return Ok(Some(RawRow { index, cells }));
        }
    }

    fn read_cells(&mut self) -> Result<Vec<RawCell>, DataIoError> {
        let mut buf = Vec::new();
        let mut cells: Vec<RawCell> = Vec::new();
        loop {
            match self.reader.read_event_into(&mut buf)? {
                Event::Start(e) if e.local_name().as_ref() == b"c" => {
                    let mut cell = start_cell(&e, cells.last().map(|c| c.col))?;
                    read_cell_content(&mut self.reader, &mut cell)?;
                    cells.push(cell);
                }
                Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                    let cell = start_cell(&e, cells.last().map(|c| c.col))?;
                    cells.push(cell);
                }
                Event::Start(e) => {
                    self.reader.read_to_end_into(e.name(), &mut Vec::new())?;
                }
                Event::End(e) if e.local_name().as_ref() == b"row" => break,
                Event::Eof => {
                    return Err(DataIoError::Invalid("unexpected eof in <row>".to_string()))
                }
                _ => {}
            }
            buf.clear();
        }
        Ok(cells)
    }
}

fn start_cell(e: &BytesStart<'_>, previous: Option<u32>) -> Result<RawCell, DataIoError> {
    let mut cell = RawCell {
        col: previous.map_or(1, |p| p + 1),
        ..RawCell::default()
    };
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?;
        match attr.key.as_ref() {
            b"r" => {
                let (col, _) = split_cell_reference(&value).ok_or_else(|| {
                    DataIoError::Invalid(format!("bad cell reference '{value}'"))
                })?;
                cell.col = col;
            }
            b"s" => cell.style = value.trim().parse().ok(),
            b"t" => cell.data_type = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok(cell)
}

fn read_cell_content(reader: &mut Reader<&[u8]>, cell: &mut RawCell) -> Result<(), DataIoError> {
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"v" => cell.value = Some(read_text(reader, e.name().as_ref())?),
                b"is" => cell.inline_text = Some(read_string_item(reader, b"is")?),
                _ => {
                    reader.read_to_end_into(e.name(), &mut Vec::new())?;
                }
            },
            Event::End(e) if e.local_name().as_ref() == b"c" => break,
            Event::Eof => return Err(DataIoError::Invalid("unexpected eof in <c>".to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// Everything needed to turn raw cells into text for one worksheet.
struct SheetContext<'a> {
    xml: &'a [u8],
    shared: SharedStrings,
    dates: DateStyles,
    range: ColumnRange,
}

impl SheetContext<'_> {
    fn cell_text(&self, cell: &RawCell) -> Result<String, DataIoError> {
        match cell.data_type.as_deref() {
            Some("s") => {
                return match cell.value.as_deref() {
                    Some(raw) if !raw.trim().is_empty() => Ok(self.shared.resolve(raw)?.to_string()),
                    _ => Ok(String::new()),
                }
            }
            Some("inlineStr") => {
                return Ok(cell
                    .inline_text
                    .clone()
                    .or_else(|| cell.value.clone())
                    .unwrap_or_default())
            }
            _ => {}
        }

        let Some(raw) = cell.value.as_deref().filter(|v| !v.trim().is_empty()) else {
            return Ok(String::new());
        };
        if cell.data_type.as_deref() == Some("d") {
            return Ok(parse_date(raw).map_or_else(|| raw.to_string(), format_date));
        }
        if cell.style.is_some_and(|s| self.dates.is_date(s)) {
            if let Some(date) = raw.trim().parse::<f64>().ok().and_then(from_oa_date) {
                return Ok(format_date(date));
            }
        }
        Ok(raw.to_string())
    }

    /// Clipped `column -> text` for one row.
    fn row_values(&self, row: &RawRow) -> Result<BTreeMap<u32, String>, DataIoError> {
        let mut values = BTreeMap::new();
        for cell in row.cells.iter().filter(|c| self.range.contains(c.col)) {
            values.insert(cell.col, self.cell_text(cell)?);
        }
        Ok(values)
    }

    fn header_map(&self, row: &RawRow, remove_invalid_chars: bool) -> Result<HeaderMap, DataIoError> {
        let mut headers = HeaderMap::new();
        for (col, text) in self.row_values(row)? {
            headers.insert(col, text);
        }
        if remove_invalid_chars {
            headers.fixup();
        }
        Ok(headers)
    }
}

/// A data row: the worksheet row index plus `header -> text` fields in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRow {
    row_id: u32,
    fields: Vec<(String, String)>,
}

impl ParsedRow {
    /// 1-based index of the worksheet row this came from.
    pub fn row_id(&self) -> u32 {
        self.row_id
    }

    /// Field value by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<(String, String)> {
        self.fields
    }
}

impl RowSource for ParsedRow {
    fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|(name, _)| name.clone()).collect()
    }

    fn get(&self, name: &str) -> Option<CellValue> {
        ParsedRow::get(self, name).map(CellValue::from)
    }
}

impl Serialize for ParsedRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry("RowId", &self.row_id)?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Pair the header map with one row's values.
///
/// A value whose header name is already taken is stored as `{column}_{header}`; a missing
/// value for an already-taken name is a duplicate column.
fn assemble_row(
    row_id: u32,
    headers: &HeaderMap,
    values: &BTreeMap<u32, String>,
) -> Result<ParsedRow, DataIoError> {
    let mut fields: Vec<(String, String)> = Vec::with_capacity(headers.len());
    for (col, header) in headers.iter() {
        let taken = fields
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case(&header.name));
        match values.get(&col) {
            Some(value) if taken => fields.push((
                format!("{}_{}", column_letter(col), header.name),
                value.clone(),
            )),
            Some(value) => fields.push((header.name.clone(), value.clone())),
            None if taken => return Err(DataIoError::DuplicateColumnName(header.name.clone())),
            None => fields.push((header.name.clone(), String::new())),
        }
    }
    Ok(ParsedRow { row_id, fields })
}

/// Reads header and data rows out of one worksheet of an `.xlsx` package.
#[derive(Debug, Clone)]
pub struct ExcelParser {
    package: XlsxPackage,
    options: ParseOptions,
}

impl ExcelParser {
    pub fn open(path: impl AsRef<Path>, options: ParseOptions) -> Result<Self, DataIoError> {
        let package = XlsxPackage::open(path, options.limits)?;
        Ok(Self::from_package(package, options))
    }

    pub fn from_bytes(bytes: &[u8], options: ParseOptions) -> Result<Self, DataIoError> {
        let package = XlsxPackage::from_bytes_limited(bytes, options.limits)?;
        Ok(Self::from_package(package, options))
    }

    pub fn from_package(package: XlsxPackage, options: ParseOptions) -> Self {
        Self { package, options }
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    pub fn package(&self) -> &XlsxPackage {
        &self.package
    }

    pub fn sheet_names(&self, include_hidden: bool) -> Result<Vec<String>, DataIoError> {
        self.package.sheet_names(include_hidden)
    }

    /// `None` when the configured sheet does not exist.
    fn context(&self) -> Result<Option<SheetContext<'_>>, DataIoError> {
        let Some(sheet) = self.package.find_sheet(&self.options.sheet_name)? else {
            debug!("sheet '{}' not found; nothing to parse", self.options.sheet_name);
            return Ok(None);
        };
        let xml = self
            .package
            .part(&sheet.worksheet_part)
            .ok_or_else(|| DataIoError::MissingPart(sheet.worksheet_part.clone()))?;

        let styles_part = self.package.styles_part_name()?;
        let dates = match self.package.part(&styles_part) {
            Some(bytes) => DateStyles::from_styles(&StylesPart::parse(bytes)?),
            None => DateStyles::default(),
        };

        Ok(Some(SheetContext {
            xml,
            shared: self.package.shared_strings()?,
            dates,
            range: ColumnRange::from_options(&self.options)?,
        }))
    }

    /// The header row as `column -> header text`, clipped to the configured columns.
    ///
    /// With `remove_invalid_chars`, characters outside `[A-Za-z0-9_]` are stripped and blank
    /// headers are replaced by their column letter. A missing sheet or header row yields an
    /// empty map.
    pub fn headers(&self, remove_invalid_chars: bool) -> Result<HeaderMap, DataIoError> {
        let header_row = self.options.header_row;
        let Some(ctx) = self.context()? else {
            return Ok(HeaderMap::new());
        };
        if header_row < 1 {
            return Ok(HeaderMap::new());
        }

        let mut stream = RowStream::new(ctx.xml);
        while let Some(row) = stream.next_row()? {
            if row.index > header_row {
                break;
            }
            if row.index == header_row {
                return ctx.header_map(&row, remove_invalid_chars);
            }
        }
        Ok(HeaderMap::new())
    }

    /// Whether any row at or after `data_row_start` holds a non-blank cell value.
    ///
    /// Stops at the first hit.
    pub fn has_data_rows(&self) -> Result<bool, DataIoError> {
        let Some(ctx) = self.context()? else {
            return Ok(false);
        };
        let mut stream = RowStream::new(ctx.xml);
        while let Some(row) = stream.next_row()? {
            if row.index >= self.options.data_row_start && row.cells.iter().any(RawCell::has_content)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Lazily parse the data rows.
    ///
    /// The iterator is single-pass; call `rows` again to restart. Setup failures (a corrupt
    /// worksheet reference, bad column bounds) surface as the first item.
    pub fn rows(&self) -> ParsedRows<'_> {
        match self.context() {
            Ok(Some(ctx)) => ParsedRows {
                state: Some(RowsState {
                    stream: RowStream::new(ctx.xml),
                    ctx,
                    options: &self.options,
                    headers: HeaderMap::new(),
                }),
                error: None,
            },
            Ok(None) => ParsedRows {
                state: None,
                error: None,
            },
            Err(err) => ParsedRows {
                state: None,
                error: Some(err),
            },
        }
    }
}

struct RowsState<'a> {
    stream: RowStream<'a>,
    ctx: SheetContext<'a>,
    options: &'a ParseOptions,
    headers: HeaderMap,
}

impl RowsState<'_> {
    fn next_row(&mut self) -> Result<Option<ParsedRow>, DataIoError> {
        let header_row = self.options.header_row;
        let start = self.options.data_row_start;
        loop {
            let Some(row) = self.stream.next_row()? else {
                return Ok(None);
            };
            let index = row.index;

            if index != header_row && index < start {
                continue;
            }
            if let Some(end) = self.options.data_row_end {
                if end >= start && index > end {
                    return Ok(None);
                }
            }

            if index < start {
                self.headers = self
                    .ctx
                    .header_map(&row, self.options.remove_invalid_chars)?;
                debug!("header row {index}: {} columns", self.headers.len());
                continue;
            }

            let mut values = self.ctx.row_values(&row)?;
            for value in values.values_mut() {
                let trimmed = value.trim();
                if trimmed.len() != value.len() {
                    *value = trimmed.to_string();
                }
            }
            if values.values().all(|v| v.is_empty()) {
                trace!("row {index}: blank, skipped");
                continue;
            }

            trace!("row {index}: {} values", values.len());
            if header_row < 1 {
                let fields = values
                    .into_iter()
                    .map(|(col, value)| (column_letter(col), value))
                    .collect();
                return Ok(Some(ParsedRow {
                    row_id: index,
                    fields,
                }));
            }
            return assemble_row(index, &self.headers, &values).map(Some);
        }
    }
}

/// Iterator returned by [`ExcelParser::rows`].
pub struct ParsedRows<'a> {
    state: Option<RowsState<'a>>,
    error: Option<DataIoError>,
}

impl Iterator for ParsedRows<'_> {
    type Item = Result<ParsedRow, DataIoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.error.take() {
            return Some(Err(err));
        }
        let state = self.state.as_mut()?;
        match state.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.state = None;
                None
            }
            Err(err) => {
                self.state = None;
                Some(Err(err))
            }
        }
    }
}
