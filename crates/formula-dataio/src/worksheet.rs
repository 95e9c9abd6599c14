//! Mutable worksheet tree used by the writer.
//!
//! `<cols>`, `<sheetData>`, `<dimension>` and `<ignoredErrors>` are modelled; every other child
//! of `<worksheet>` is captured as raw XML and written back in its original position. Rows stay
//! sorted by index and cells by column, so inserts never break the ordering Excel requires.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::column::{cell_reference, column_letter, split_cell_reference};
use crate::error::DataIoError;
use crate::shared_strings::{read_string_item, read_text, SharedStrings};

/// Child order of `CT_Worksheet`.
const WORKSHEET_ORDER: &[&str] = &[
    "sheetPr",
    "dimension",
    "sheetViews",
    "sheetFormatPr",
    "cols",
    "sheetData",
    "sheetCalcPr",
    "sheetProtection",
    "protectedRanges",
    "scenarios",
    "autoFilter",
    "sortState",
    "dataConsolidate",
    "customSheetViews",
    "mergeCells",
    "phoneticPr",
    "conditionalFormatting",
    "dataValidations",
    "hyperlinks",
    "printOptions",
    "pageMargins",
    "pageSetup",
    "headerFooter",
    "rowBreaks",
    "colBreaks",
    "customProperties",
    "cellWatches",
    "ignoredErrors",
    "smartTags",
    "drawing",
    "legacyDrawing",
    "legacyDrawingHF",
    "drawingHF",
    "picture",
    "oleObjects",
    "controls",
    "webPublishItems",
    "tableParts",
    "extLst",
];

fn schema_position(name: &str) -> Option<usize> {
    WORKSHEET_ORDER.iter().position(|n| *n == name)
}

type Attrs = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq)]
enum Section {
    Raw { name: String, xml: Vec<u8> },
    Dimension,
    Cols,
    SheetData,
    IgnoredErrors,
}

impl Section {
    fn name(&self) -> &str {
        match self {
            Section::Raw { name, .. } => name,
            Section::Dimension => "dimension",
            Section::Cols => "cols",
            Section::SheetData => "sheetData",
            Section::IgnoredErrors => "ignoredErrors",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Col {
    pub min: u32,
    pub max: u32,
    pub width: Option<String>,
    pub style: Option<u32>,
    attrs: Attrs,
}

impl Col {
    fn new(min: u32, max: u32, width: f64, style: Option<u32>) -> Self {
        Self {
            min,
            max,
            width: Some(width.to_string()),
            style,
            attrs: Vec::new(),
        }
    }

    fn contains(&self, col: u32) -> bool {
        self.min <= col && col <= self.max
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IgnoredError {
    pub sqref: String,
    attrs: Attrs,
}

impl IgnoredError {
    pub fn flag(&self, name: &str) -> bool {
        self.attrs
            .iter()
            .any(|(k, v)| k == name && matches!(v.as_str(), "1" | "true"))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cell {
    col: u32,
    pub style: Option<u32>,
    data_type: Option<String>,
    value: Option<String>,
    inline_text: Option<String>,
    formula: Option<Vec<u8>>,
    extra: Vec<u8>,
    attrs: Attrs,
}

impl Cell {
    fn new(col: u32) -> Self {
        Self {
            col,
            ..Self::default()
        }
    }

    pub fn col(&self) -> u32 {
        self.col
    }

    pub fn data_type(&self) -> Option<&str> {
        self.data_type.as_deref()
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn has_formula(&self) -> bool {
        self.formula.is_some()
    }

    /// Replace the content of the cell. Formulas and inline strings are dropped; the style is
    /// kept.
    pub fn set_value(&mut self, data_type: Option<&str>, value: impl Into<String>) {
        self.data_type = data_type.map(str::to_string);
        self.value = Some(value.into());
        self.inline_text = None;
        self.formula = None;
    }

    /// The displayed text: shared strings and inline strings are resolved, anything else is
    /// the raw value.
    pub fn text(&self, shared: &SharedStrings) -> Result<Option<String>, DataIoError> {
        match self.data_type.as_deref() {
            Some("s") => match self.value.as_deref() {
                Some(raw) => Ok(Some(shared.resolve(raw)?.to_string())),
                None => Ok(None),
            },
            Some("inlineStr") => Ok(self.inline_text.clone().or_else(|| self.value.clone())),
            _ => Ok(self.value.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    index: u32,
    attrs: Attrs,
    cells: Vec<Cell>,
}

impl Row {
    fn new(index: u32) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Row-level style (`s`), when one is set.
    pub fn style(&self) -> Option<u32> {
        self.attrs
            .iter()
            .find(|(k, _)| k == "s")
            .and_then(|(_, v)| v.parse().ok())
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, col: u32) -> Option<&Cell> {
        self.cells
            .binary_search_by_key(&col, |c| c.col)
            .ok()
            .map(|idx| &self.cells[idx])
    }

    /// The cell at `col`, inserted in column order when absent.
    pub fn upsert_cell(&mut self, col: u32) -> &mut Cell {
        let idx = match self.cells.binary_search_by_key(&col, |c| c.col) {
            Ok(idx) => idx,
            Err(idx) => {
                self.cells.insert(idx, Cell::new(col));
                idx
            }
        };
        &mut self.cells[idx]
    }

    /// Style of the right-most styled cell.
    pub fn last_cell_style(&self) -> Option<u32> {
        self.cells.iter().rev().find_map(|c| c.style)
    }
}

/// A parsed worksheet part.
#[derive(Debug, Clone, PartialEq)]
pub struct Worksheet {
    root: Vec<u8>,
    sections: Vec<Section>,
    dimension: Attrs,
    cols: Vec<Col>,
    sheet_data_attrs: Attrs,
    rows: Vec<Row>,
    ignored_errors: Vec<IgnoredError>,
    ignored_errors_extra: Vec<u8>,
}

impl Worksheet {
    pub fn parse(xml: &[u8]) -> Result<Self, DataIoError> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);
        let mut buf = Vec::new();

        let mut sheet = Worksheet {
            root: Vec::new(),
            sections: Vec::new(),
            dimension: Vec::new(),
            cols: Vec::new(),
            sheet_data_attrs: Vec::new(),
            rows: Vec::new(),
            ignored_errors: Vec::new(),
            ignored_errors_extra: Vec::new(),
        };

        // Root element.
        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => {
                    sheet.root = e.to_vec();
                    break;
                }
                Event::Empty(e) => {
                    sheet.root = e.to_vec();
                    sheet.sections.push(Section::SheetData);
                    return Ok(sheet);
                }
                Event::Eof => {
                    return Err(DataIoError::Invalid(
                        "worksheet part has no root element".to_string(),
                    ))
                }
                _ => {}
            }
            buf.clear();
        }
        buf.clear();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"cols" => {
                        sheet.cols = parse_cols(&mut reader)?;
                        sheet.sections.push(Section::Cols);
                    }
                    b"sheetData" => {
                        sheet.sheet_data_attrs = read_attrs(&e, &[])?;
                        sheet.rows = parse_sheet_data(&mut reader)?;
                        sheet.sections.push(Section::SheetData);
                    }
                    b"ignoredErrors" => {
                        let (errors, extra) = parse_ignored_errors(&mut reader)?;
                        sheet.ignored_errors = errors;
                        sheet.ignored_errors_extra = extra;
                        sheet.sections.push(Section::IgnoredErrors);
                    }
                    b"dimension" => {
                        sheet.dimension = read_attrs(&e, &[])?;
                        reader.read_to_end_into(e.name(), &mut Vec::new())?;
                        sheet.sections.push(Section::Dimension);
                    }
                    other => {
                        let name = String::from_utf8_lossy(other).into_owned();
                        let xml = capture_subtree(&mut reader, &e)?;
                        sheet.sections.push(Section::Raw { name, xml });
                    }
                },
                Event::Empty(e) => match e.local_name().as_ref() {
                    b"cols" => sheet.sections.push(Section::Cols),
                    b"sheetData" => {
                        sheet.sheet_data_attrs = read_attrs(&e, &[])?;
                        sheet.sections.push(Section::SheetData);
                    }
                    b"ignoredErrors" => sheet.sections.push(Section::IgnoredErrors),
                    b"dimension" => {
                        sheet.dimension = read_attrs(&e, &[])?;
                        sheet.sections.push(Section::Dimension);
                    }
                    other => {
                        let name = String::from_utf8_lossy(other).into_owned();
                        let mut writer = Writer::new(Vec::new());
                        writer.write_event(Event::Empty(e.to_owned()))?;
                        sheet.sections.push(Section::Raw {
                            name,
                            xml: writer.into_inner(),
                        });
                    }
                },
                Event::End(_) | Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !sheet.sections.iter().any(|s| *s == Section::SheetData) {
            sheet.insert_section(Section::SheetData);
        }
        Ok(sheet)
    }

    fn prefix(&self) -> String {
        let name_end = self
            .root
            .iter()
            .position(|b| b.is_ascii_whitespace() || *b == b'/')
            .unwrap_or(self.root.len());
        let name = &self.root[..name_end];
        name.iter()
            .rposition(|b| *b == b':')
            .map(|idx| String::from_utf8_lossy(&name[..idx]).into_owned())
            .unwrap_or_default()
    }

    fn root_name(&self) -> String {
        let end = self
            .root
            .iter()
            .position(|b| b.is_ascii_whitespace() || *b == b'/')
            .unwrap_or(self.root.len());
        String::from_utf8_lossy(&self.root[..end]).into_owned()
    }

    fn insert_section(&mut self, section: Section) {
        let Some(order) = schema_position(section.name()) else {
            self.sections.push(section);
            return;
        };
        let at = self
            .sections
            .iter()
            .position(|s| schema_position(s.name()).is_some_and(|o| o > order))
            .unwrap_or(self.sections.len());
        self.sections.insert(at, section);
    }

    fn has_section(&self, section: &Section) -> bool {
        self.sections.iter().any(|s| s == section)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, index: u32) -> Option<&Row> {
        self.rows
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|idx| &self.rows[idx])
    }

    pub fn last_row_index(&self) -> Option<u32> {
        self.rows.last().map(|r| r.index)
    }

    /// The row at `index`, inserted before the first row with a greater index when absent.
    pub fn ensure_row(&mut self, index: u32) -> &mut Row {
        let idx = match self.rows.binary_search_by_key(&index, |r| r.index) {
            Ok(idx) => idx,
            Err(idx) => {
                self.rows.insert(idx, Row::new(index));
                idx
            }
        };
        &mut self.rows[idx]
    }

    /// Remove every row whose index is `index` or greater. Returns how many were removed.
    pub fn remove_rows_from(&mut self, index: u32) -> usize {
        let keep = self.rows.partition_point(|r| r.index < index);
        let removed = self.rows.len() - keep;
        self.rows.truncate(keep);
        removed
    }

    pub fn cols(&self) -> &[Col] {
        &self.cols
    }

    /// Make sure a `<cols>` block exists, seeding it with a single default-width column.
    pub fn ensure_cols(&mut self, width: f64) {
        if !self.has_section(&Section::Cols) {
            self.insert_section(Section::Cols);
        }
        if self.cols.is_empty() {
            self.cols.push(Col::new(1, 1, width, None));
        }
    }

    pub fn col_style(&self, col: u32) -> Option<u32> {
        self.cols
            .iter()
            .find(|c| c.contains(col))
            .and_then(|c| c.style)
    }

    /// Record `style` for column `col`.
    ///
    /// A column past the last `<col>` is appended, with a default-width filler covering any
    /// gap. A column inside a wider `<col>` range splits that range so neighbours keep their
    /// own style.
    pub fn set_col_style(&mut self, col: u32, style: u32, width: f64) {
        if !self.has_section(&Section::Cols) {
            self.insert_section(Section::Cols);
        }
        if let Some(idx) = self.cols.iter().position(|c| c.contains(col)) {
            let existing = self.cols.remove(idx);
            let mut pieces = Vec::with_capacity(3);
            if existing.min < col {
                pieces.push(Col {
                    max: col - 1,
                    ..existing.clone()
                });
            }
            pieces.push(Col {
                min: col,
                max: col,
                style: Some(style),
                ..existing.clone()
            });
            if existing.max > col {
                pieces.push(Col {
                    min: col + 1,
                    ..existing
                });
            }
            for (offset, piece) in pieces.into_iter().enumerate() {
                self.cols.insert(idx + offset, piece);
            }
            return;
        }

        let last_max = self.cols.iter().map(|c| c.max).max().unwrap_or(0);
        if col > last_max {
            if last_max + 1 < col {
                self.cols.push(Col::new(last_max + 1, col - 1, width, None));
            }
            self.cols.push(Col::new(col, col, width, Some(style)));
        } else {
            let at = self.cols.partition_point(|c| c.max < col);
            self.cols.insert(at, Col::new(col, col, width, Some(style)));
        }
    }

    pub fn ignored_errors(&self) -> &[IgnoredError] {
        &self.ignored_errors
    }

    /// Flag `sqref` with the ignored-error attribute `flag` (e.g. `numberStoredAsText`).
    pub fn add_ignored_error(&mut self, sqref: &str, flag: &str) {
        if !self.has_section(&Section::IgnoredErrors) {
            self.insert_section(Section::IgnoredErrors);
        }
        if let Some(existing) = self
            .ignored_errors
            .iter_mut()
            .find(|e| e.sqref.eq_ignore_ascii_case(sqref))
        {
            match existing.attrs.iter_mut().find(|(k, _)| k == flag) {
                Some((_, v)) => *v = "1".to_string(),
                None => existing.attrs.push((flag.to_string(), "1".to_string())),
            }
            return;
        }
        self.ignored_errors.push(IgnoredError {
            sqref: sqref.to_string(),
            attrs: vec![(flag.to_string(), "1".to_string())],
        });
    }

    /// Used range as an A1 reference, or `None` when the sheet holds no cells.
    fn used_range(&self) -> Option<String> {
        let first_row = self.rows.iter().find(|r| !r.cells.is_empty())?.index;
        let last_row = self.rows.iter().rev().find(|r| !r.cells.is_empty())?.index;
        let min_col = self.rows.iter().filter_map(|r| r.cells.first()).map(|c| c.col).min()?;
        let max_col = self.rows.iter().filter_map(|r| r.cells.last()).map(|c| c.col).max()?;
        let start = cell_reference(min_col, first_row);
        let end = cell_reference(max_col, last_row);
        Some(if start == end {
            start
        } else {
            format!("{start}:{end}")
        })
    }

    pub fn to_xml(&self) -> Result<Vec<u8>, DataIoError> {
        let prefix = self.prefix();
        let q = |local: &str| -> String {
            if prefix.is_empty() {
                local.to_string()
            } else {
                format!("{prefix}:{local}")
            }
        };

        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
        writer.get_mut().push(b'\n');
        let root = String::from_utf8_lossy(&self.root).into_owned();
        writer.write_event(Event::Start(BytesStart::from_content(
            root.as_str(),
            self.root_name().len(),
        )))?;

        for section in &self.sections {
            match section {
                Section::Raw { xml, .. } => writer.get_mut().extend_from_slice(xml),
                Section::Dimension => {
                    let mut el = BytesStart::new(q("dimension"));
                    match self.used_range() {
                        Some(range) => {
                            el.push_attribute(("ref", range.as_str()));
                            for (k, v) in self.dimension.iter().filter(|(k, _)| k != "ref") {
                                el.push_attribute((k.as_str(), v.as_str()));
                            }
                        }
                        None => {
                            for (k, v) in &self.dimension {
                                el.push_attribute((k.as_str(), v.as_str()));
                            }
                        }
                    }
                    writer.write_event(Event::Empty(el))?;
                }
                Section::Cols => self.write_cols(&mut writer, &q)?,
                Section::SheetData => self.write_sheet_data(&mut writer, &q)?,
                Section::IgnoredErrors => self.write_ignored_errors(&mut writer, &q)?,
            }
        }

        writer.write_event(Event::End(BytesEnd::new(self.root_name())))?;
        Ok(writer.into_inner())
    }

    fn write_cols(
        &self,
        writer: &mut Writer<Vec<u8>>,
        q: &dyn Fn(&str) -> String,
    ) -> Result<(), DataIoError> {
        if self.cols.is_empty() {
            return Ok(());
        }
        let tag = q("cols");
        writer.write_event(Event::Start(BytesStart::new(tag.as_str())))?;
        for col in &self.cols {
            let mut el = BytesStart::new(q("col"));
            el.push_attribute(("min", col.min.to_string().as_str()));
            el.push_attribute(("max", col.max.to_string().as_str()));
            if let Some(width) = &col.width {
                el.push_attribute(("width", width.as_str()));
            }
            if let Some(style) = col.style {
                el.push_attribute(("style", style.to_string().as_str()));
            }
            for (k, v) in &col.attrs {
                el.push_attribute((k.as_str(), v.as_str()));
            }
            writer.write_event(Event::Empty(el))?;
        }
        writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
        Ok(())
    }

    fn write_sheet_data(
        &self,
        writer: &mut Writer<Vec<u8>>,
        q: &dyn Fn(&str) -> String,
    ) -> Result<(), DataIoError> {
        let tag = q("sheetData");
        let mut start = BytesStart::new(tag.as_str());
        for (k, v) in &self.sheet_data_attrs {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        if self.rows.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }
        writer.write_event(Event::Start(start))?;

        let row_tag = q("row");
        let cell_tag = q("c");
        let v_tag = q("v");
        let is_tag = q("is");
        let t_tag = q("t");
        for row in &self.rows {
            let mut row_el = BytesStart::new(row_tag.as_str());
            row_el.push_attribute(("r", row.index.to_string().as_str()));
            for (k, v) in &row.attrs {
                row_el.push_attribute((k.as_str(), v.as_str()));
            }
            if row.cells.is_empty() {
                writer.write_event(Event::Empty(row_el))?;
                continue;
            }
            writer.write_event(Event::Start(row_el))?;

            for cell in &row.cells {
                let mut c = BytesStart::new(cell_tag.as_str());
                c.push_attribute(("r", cell_reference(cell.col, row.index).as_str()));
                if let Some(style) = cell.style {
                    c.push_attribute(("s", style.to_string().as_str()));
                }
                if let Some(t) = &cell.data_type {
                    c.push_attribute(("t", t.as_str()));
                }
                for (k, v) in &cell.attrs {
                    c.push_attribute((k.as_str(), v.as_str()));
                }

                let has_children = cell.formula.is_some()
                    || cell.value.is_some()
                    || cell.inline_text.is_some()
                    || !cell.extra.is_empty();
                if !has_children {
                    writer.write_event(Event::Empty(c))?;
                    continue;
                }
                writer.write_event(Event::Start(c))?;
                if let Some(formula) = &cell.formula {
                    writer.get_mut().extend_from_slice(formula);
                }
                if let Some(text) = &cell.inline_text {
                    writer.write_event(Event::Start(BytesStart::new(is_tag.as_str())))?;
                    let mut t = BytesStart::new(t_tag.as_str());
                    t.push_attribute(("xml:space", "preserve"));
                    writer.write_event(Event::Start(t))?;
                    writer.write_event(Event::Text(BytesText::new(text)))?;
                    writer.write_event(Event::End(BytesEnd::new(t_tag.as_str())))?;
                    writer.write_event(Event::End(BytesEnd::new(is_tag.as_str())))?;
                } else if let Some(value) = &cell.value {
                    writer.write_event(Event::Start(BytesStart::new(v_tag.as_str())))?;
                    writer.write_event(Event::Text(BytesText::new(value)))?;
                    writer.write_event(Event::End(BytesEnd::new(v_tag.as_str())))?;
                }
                writer.get_mut().extend_from_slice(&cell.extra);
                writer.write_event(Event::End(BytesEnd::new(cell_tag.as_str())))?;
            }

            writer.write_event(Event::End(BytesEnd::new(row_tag.as_str())))?;
        }

        writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
        Ok(())
    }

    fn write_ignored_errors(
        &self,
        writer: &mut Writer<Vec<u8>>,
        q: &dyn Fn(&str) -> String,
    ) -> Result<(), DataIoError> {
        if self.ignored_errors.is_empty() && self.ignored_errors_extra.is_empty() {
            return Ok(());
        }
        let tag = q("ignoredErrors");
        writer.write_event(Event::Start(BytesStart::new(tag.as_str())))?;
        for error in &self.ignored_errors {
            let mut el = BytesStart::new(q("ignoredError"));
            el.push_attribute(("sqref", error.sqref.as_str()));
            for (k, v) in &error.attrs {
                el.push_attribute((k.as_str(), v.as_str()));
            }
            writer.write_event(Event::Empty(el))?;
        }
        writer
            .get_mut()
            .extend_from_slice(&self.ignored_errors_extra);
        writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
        Ok(())
    }
}

fn read_attrs(e: &BytesStart<'_>, skip: &[&[u8]]) -> Result<Attrs, DataIoError> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr?;
        if skip.contains(&attr.key.as_ref()) {
            continue;
        }
        out.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            attr.unescape_value()?.into_owned(),
        ));
    }
    Ok(out)
}

/// Re-serialize the element opened by `start` (already consumed) through its end tag.
fn capture_subtree(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> Result<Vec<u8>, DataIoError> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Start(start.to_owned()))?;
    let mut buf = Vec::new();
    let mut depth = 1usize;
    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Start(_) => depth += 1,
            Event::End(_) => depth -= 1,
            Event::Eof => {
                return Err(DataIoError::Invalid(format!(
                    "unexpected eof in <{}>",
                    String::from_utf8_lossy(start.name().as_ref())
                )))
            }
            _ => {}
        }
        writer.write_event(event.into_owned())?;
        if depth == 0 {
            break;
        }
        buf.clear();
    }
    Ok(writer.into_inner())
}

fn parse_cols(reader: &mut Reader<&[u8]>) -> Result<Vec<Col>, DataIoError> {
    let mut buf = Vec::new();
    let mut cols = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"col" => {
                let mut col = Col {
                    min: 0,
                    max: 0,
                    width: None,
                    style: None,
                    attrs: Vec::new(),
                };
                for (k, v) in read_attrs(&e, &[])? {
                    match k.as_str() {
                        "min" => col.min = v.trim().parse().unwrap_or(0),
                        "max" => col.max = v.trim().parse().unwrap_or(0),
                        "width" => col.width = Some(v),
                        "style" => col.style = v.trim().parse().ok(),
                        _ => col.attrs.push((k, v)),
                    }
                }
                if col.max < col.min {
                    col.max = col.min;
                }
                if col.min > 0 {
                    cols.push(col);
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"cols" => break,
            Event::Eof => return Err(DataIoError::Invalid("unexpected eof in <cols>".to_string())),
            _ => {}
        }
        buf.clear();
    }
    cols.sort_by_key(|c| c.min);
    Ok(cols)
}

/// `<ignoredError>` entries plus any other children, kept as raw XML.
fn parse_ignored_errors(
    reader: &mut Reader<&[u8]>,
) -> Result<(Vec<IgnoredError>, Vec<u8>), DataIoError> {
    let mut buf = Vec::new();
    let mut errors = Vec::new();
    let mut extra = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Empty(e) if e.local_name().as_ref() == b"ignoredError" => {
                errors.push(read_ignored_error(&e)?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"ignoredError" => {
                errors.push(read_ignored_error(&e)?);
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
            }
            Event::Start(e) => {
                let e = e.into_owned();
                extra.extend_from_slice(&capture_subtree(reader, &e)?);
            }
            Event::Empty(e) => {
                let mut writer = Writer::new(Vec::new());
                writer.write_event(Event::Empty(e.into_owned()))?;
                extra.extend_from_slice(&writer.into_inner());
            }
            Event::End(e) if e.local_name().as_ref() == b"ignoredErrors" => break,
            Event::Eof => {
                return Err(DataIoError::Invalid(
                    "unexpected eof in <ignoredErrors>".to_string(),
                ))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok((errors, extra))
}

fn read_ignored_error(e: &BytesStart<'_>) -> Result<IgnoredError, DataIoError> {
    let mut sqref = None;
    let mut attrs = Vec::new();
    for (k, v) in read_attrs(e, &[])? {
        if k == "sqref" {
            sqref = Some(v);
        } else {
            attrs.push((k, v));
        }
    }
    Ok(IgnoredError {
        sqref: sqref.ok_or(DataIoError::MissingAttr("sqref"))?,
        attrs,
    })
}

fn parse_sheet_data(reader: &mut Reader<&[u8]>) -> Result<Vec<Row>, DataIoError> {
    let mut buf = Vec::new();
    let mut rows: Vec<Row> = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"row" => {
                let mut row = start_row(&e, rows.last().map(|r| r.index))?;
                row.cells = parse_row_cells(reader, row.index)?;
                push_row(&mut rows, row);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"row" => {
                let row = start_row(&e, rows.last().map(|r| r.index))?;
                push_row(&mut rows, row);
            }
            Event::Start(e) => {
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
            }
            Event::End(e) if e.local_name().as_ref() == b"sheetData" => break,
            Event::Eof => {
                return Err(DataIoError::Invalid(
                    "unexpected eof in <sheetData>".to_string(),
                ))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

/// Keep rows sorted even when a producer wrote them out of order.
fn push_row(rows: &mut Vec<Row>, row: Row) {
    match rows.binary_search_by_key(&row.index, |r| r.index) {
        Ok(idx) => rows[idx].cells.extend(row.cells),
        Err(idx) => rows.insert(idx, row),
    }
}

fn start_row(e: &BytesStart<'_>, previous: Option<u32>) -> Result<Row, DataIoError> {
    let mut row = Row::new(previous.map_or(1, |p| p + 1));
    for (k, v) in read_attrs(e, &[b"spans".as_slice()])? {
        if k == "r" {
            if let Ok(index) = v.trim().parse::<u32>() {
                row.index = index;
            }
        } else {
            row.attrs.push((k, v));
        }
    }
    Ok(row)
}

fn parse_row_cells(reader: &mut Reader<&[u8]>, row_index: u32) -> Result<Vec<Cell>, DataIoError> {
    let mut buf = Vec::new();
    let mut cells: Vec<Cell> = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"c" => {
                let mut cell = start_cell(&e, cells.last().map(|c| c.col), row_index)?;
                parse_cell_children(reader, &mut cell)?;
                insert_cell(&mut cells, cell);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                let cell = start_cell(&e, cells.last().map(|c| c.col), row_index)?;
                insert_cell(&mut cells, cell);
            }
            Event::Start(e) => {
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
            }
            Event::End(e) if e.local_name().as_ref() == b"row" => break,
            Event::Eof => return Err(DataIoError::Invalid("unexpected eof in <row>".to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells)
}

fn insert_cell(cells: &mut Vec<Cell>, cell: Cell) {
    match cells.binary_search_by_key(&cell.col, |c| c.col) {
        Ok(idx) => cells[idx] = cell,
        Err(idx) => cells.insert(idx, cell),
    }
}

fn start_cell(e: &BytesStart<'_>, previous: Option<u32>, row_index: u32) -> Result<Cell, DataIoError> {
    let mut cell = Cell::new(previous.map_or(1, |p| p + 1));
    for (k, v) in read_attrs(e, &[])? {
        match k.as_str() {
            "r" => {
                if let Some((col, _row)) = split_cell_reference(&v) {
                    cell.col = col;
                } else {
                    return Err(DataIoError::Invalid(format!(
                        "bad cell reference '{v}' in row {row_index}"
                    )));
                }
            }
            "s" => cell.style = v.trim().parse().ok(),
            "t" => cell.data_type = Some(v),
            _ => cell.attrs.push((k, v)),
        }
    }
    Ok(cell)
}

fn parse_cell_children(reader: &mut Reader<&[u8]>, cell: &mut Cell) -> Result<(), DataIoError> {
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"v" => cell.value = Some(read_text(reader, e.name().as_ref())?),
                b"is" => cell.inline_text = Some(read_string_item(reader, b"is")?),
                b"f" => cell.formula = Some(capture_subtree(reader, &e)?),
                _ => {
                    let xml = capture_subtree(reader, &e)?;
                    cell.extra.extend_from_slice(&xml);
                }
            },
            Event::Empty(e) => {
                let mut writer = Writer::new(Vec::new());
                writer.write_event(Event::Empty(e.to_owned()))?;
                match e.local_name().as_ref() {
                    b"f" => cell.formula = Some(writer.into_inner()),
                    b"v" => cell.value = Some(String::new()),
                    _ => cell.extra.extend_from_slice(&writer.into_inner()),
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"c" => break,
            Event::Eof => return Err(DataIoError::Invalid("unexpected eof in <c>".to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// `C` -> `C1:C65535`
pub fn whole_column_sqref(col: u32, last_row: u32) -> String {
    let letter = column_letter(col);
    format!("{letter}1:{letter}{last_row}")
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    const SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><dimension ref="A1:C3"/><sheetViews><sheetView workbookViewId="0"/></sheetViews><sheetData><row r="1" spans="1:3"><c r="A1" t="s"><v>0</v></c><c r="C1" t="inlineStr"><is><t>Total</t></is></c></row><row r="3"><c r="B3" s="2"><f>SUM(A1:A2)</f><v>4</v></c></row></sheetData><pageMargins left="0.7" right="0.7" top="0.75" bottom="0.75" header="0.3" footer="0.3"/><drawing r:id="rId1"/></worksheet>"#;

    fn sheet() -> Worksheet {
        Worksheet::parse(SHEET.as_bytes()).unwrap()
    }

    #[test]
    fn parses_rows_cells_and_preserved_children() {
        let ws = sheet();
        assert_eq!(ws.rows().len(), 2);
        let row = ws.row(1).unwrap();
        assert_eq!(row.cells().len(), 2);
        assert_eq!(row.cell(3).unwrap().data_type(), Some("inlineStr"));
        let b3 = ws.row(3).unwrap().cell(2).unwrap();
        assert!(b3.has_formula());
        assert_eq!(b3.style, Some(2));
        assert_eq!(b3.value(), Some("4"));

        let out = String::from_utf8(ws.to_xml().unwrap()).unwrap();
        assert!(out.contains(r#"<sheetViews><sheetView workbookViewId="0"/></sheetViews>"#));
        assert!(out.contains(r#"<c r="B3" s="2"><f>SUM(A1:A2)</f><v>4</v></c>"#));
        assert!(out.contains(r#"<drawing r:id="rId1"/>"#));
        assert!(!out.contains("spans"));
    }

    #[test]
    fn rows_and_cells_are_inserted_in_order() {
        let mut ws = sheet();
        ws.ensure_row(2).upsert_cell(4).set_value(Some("str"), "d");
        ws.ensure_row(10).upsert_cell(2).set_value(None, "1");
        ws.ensure_row(2).upsert_cell(1).set_value(Some("str"), "a");

        let indexes: Vec<u32> = ws.rows().iter().map(Row::index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 10]);
        let cols: Vec<u32> = ws.row(2).unwrap().cells().iter().map(Cell::col).collect();
        assert_eq!(cols, vec![1, 4]);

        let reparsed = Worksheet::parse(&ws.to_xml().unwrap()).unwrap();
        assert_eq!(reparsed.rows(), ws.rows());
    }

    #[test]
    fn updating_a_cell_keeps_style_and_drops_formula() {
        let mut ws = sheet();
        let cell = ws.ensure_row(3).upsert_cell(2);
        cell.set_value(None, "7");
        assert_eq!(cell.style, Some(2));
        assert!(!cell.has_formula());
        assert_eq!(cell.value(), Some("7"));
    }

    #[test]
    fn resolves_shared_and_inline_text() {
        let ws = sheet();
        let sst = crate::shared_strings::parse_shared_strings(br#"<sst><si><t>Name</t></si></sst>"#)
            .unwrap();
        let row = ws.row(1).unwrap();
        assert_eq!(row.cell(1).unwrap().text(&sst).unwrap().as_deref(), Some("Name"));
        assert_eq!(row.cell(3).unwrap().text(&sst).unwrap().as_deref(), Some("Total"));
    }

    #[test]
    fn removes_trailing_rows() {
        let mut ws = sheet();
        assert_eq!(ws.remove_rows_from(2), 1);
        assert_eq!(ws.last_row_index(), Some(1));
        assert_eq!(ws.remove_rows_from(5), 0);
    }

    #[test]
    fn cols_are_created_before_sheet_data() {
        let mut ws = sheet();
        ws.ensure_cols(9.7109375);
        let out = String::from_utf8(ws.to_xml().unwrap()).unwrap();
        let cols_at = out.find("<cols>").unwrap();
        assert!(out.find("<sheetViews>").unwrap() < cols_at);
        assert!(cols_at < out.find("<sheetData>").unwrap());
        assert!(out.contains(r#"<col min="1" max="1" width="9.7109375"/>"#));
    }

    #[test]
    fn column_styles_stretch_and_split() {
        let mut ws = sheet();
        ws.ensure_cols(9.7109375);
        ws.set_col_style(4, 7, 9.7109375);
        let spans: Vec<(u32, u32, Option<u32>)> =
            ws.cols().iter().map(|c| (c.min, c.max, c.style)).collect();
        assert_eq!(spans, vec![(1, 1, None), (2, 3, None), (4, 4, Some(7))]);

        ws.set_col_style(2, 5, 9.7109375);
        let spans: Vec<(u32, u32, Option<u32>)> =
            ws.cols().iter().map(|c| (c.min, c.max, c.style)).collect();
        assert_eq!(
            spans,
            vec![(1, 1, None), (2, 2, Some(5)), (3, 3, None), (4, 4, Some(7))]
        );
        assert_eq!(ws.col_style(2), Some(5));
        assert_eq!(ws.col_style(3), None);
    }

    #[test]
    fn ignored_errors_are_deduplicated_and_placed_before_drawing() {
        let mut ws = sheet();
        let sqref = whole_column_sqref(3, 65_535);
        assert_eq!(sqref, "C1:C65535");
        ws.add_ignored_error(&sqref, "numberStoredAsText");
        ws.add_ignored_error("c1:c65535", "numberStoredAsText");
        assert_eq!(ws.ignored_errors().len(), 1);
        assert!(ws.ignored_errors()[0].flag("numberStoredAsText"));

        let out = String::from_utf8(ws.to_xml().unwrap()).unwrap();
        let at = out
            .find(r#"<ignoredErrors><ignoredError sqref="C1:C65535" numberStoredAsText="1"/></ignoredErrors>"#)
            .unwrap();
        assert!(out.find("<pageMargins").unwrap() < at);
        assert!(at < out.find("<drawing").unwrap());
    }

    #[test]
    fn existing_ignored_errors_survive_a_round_trip() {
        let xml = r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData/><ignoredErrors><ignoredError sqref="A1:A9" numberStoredAsText="1" evalError="1"/><extLst><ext uri="{X}"/></extLst></ignoredErrors></worksheet>"#;
        let mut ws = Worksheet::parse(xml.as_bytes()).unwrap();
        assert_eq!(ws.ignored_errors().len(), 1);
        assert_eq!(ws.ignored_errors()[0].sqref, "A1:A9");
        assert!(ws.ignored_errors()[0].flag("evalError"));

        ws.add_ignored_error("B1:B65535", "numberStoredAsText");
        let out = String::from_utf8(ws.to_xml().unwrap()).unwrap();
        assert!(out.contains(
            r#"<ignoredErrors><ignoredError sqref="A1:A9" numberStoredAsText="1" evalError="1"/><ignoredError sqref="B1:B65535" numberStoredAsText="1"/><extLst><ext uri="{X}"/></extLst></ignoredErrors>"#
        ));

        let reparsed = Worksheet::parse(out.as_bytes()).unwrap();
        let sqrefs: Vec<&str> = reparsed
            .ignored_errors()
            .iter()
            .map(|e| e.sqref.as_str())
            .collect();
        assert_eq!(sqrefs, vec!["A1:A9", "B1:B65535"]);
    }

    #[test]
    fn ignored_errors_without_sqref_are_rejected() {
        let xml = r#"<worksheet><sheetData/><ignoredErrors><ignoredError numberStoredAsText="1"/></ignoredErrors></worksheet>"#;
        assert!(matches!(
            Worksheet::parse(xml.as_bytes()),
            Err(DataIoError::MissingAttr("sqref"))
        ));
    }

    #[test]
    fn dimension_tracks_the_used_range() {
        let mut ws = sheet();
        ws.ensure_row(12).upsert_cell(5).set_value(None, "1");
        let out = String::from_utf8(ws.to_xml().unwrap()).unwrap();
        assert!(out.contains(r#"<dimension ref="A1:E12"/>"#));
    }

    #[test]
    fn empty_sheets_get_sheet_data() {
        let ws = Worksheet::parse(
            br#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"></worksheet>"#,
        )
        .unwrap();
        let out = String::from_utf8(ws.to_xml().unwrap()).unwrap();
        assert!(out.ends_with("<sheetData/></worksheet>"));
    }
}
