use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::error::DataIoError;
use crate::openxml::{
    self, CONTENT_TYPES_PART, CONTENT_TYPE_STYLES, CONTENT_TYPE_WORKSHEET, REL_TYPE_SHARED_STRINGS,
    REL_TYPE_STYLES,
    REL_TYPE_WORKSHEET, WORKBOOK_PART, WORKBOOK_RELS_PART,
};
use crate::options::{PackageLimits, MAX_SHEET_NAME_LEN};
use crate::shared_strings::{parse_shared_strings, SharedStrings};
use crate::sheet_metadata::{
    self, parse_workbook_sheets, SheetVisibility, WorkbookSheetInfo,
};

const CALC_CHAIN_PART: &str = "xl/calcChain.xml";

/// A workbook sheet together with the worksheet part that holds its cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorksheetPartInfo {
    pub name: String,
    pub sheet_id: u32,
    pub rel_id: String,
    pub visibility: SheetVisibility,
    /// ZIP entry name for the worksheet XML (e.g. `xl/worksheets/sheet1.xml`).
    pub worksheet_part: String,
}

/// In-memory representation of an XLSX package as a map of part name -> bytes.
///
/// Parts are inflated once on open and written back in name order by [`XlsxPackage::write_to`].
/// Every mutation lands directly in the part map, so a sheet added through
/// [`XlsxPackage::add_worksheet`] is immediately visible to later lookups.
#[derive(Debug, Clone)]
pub struct XlsxPackage {
    parts: BTreeMap<String, Vec<u8>>,
}

impl XlsxPackage {
    /// A workbook with an empty sheet list and default styles.
    pub fn new_blank() -> Self {
        Self {
            parts: crate::minimal::blank_workbook_parts(),
        }
    }

    pub fn open(path: impl AsRef<Path>, limits: PackageLimits) -> Result<Self, DataIoError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(DataIoError::EmptySourcePath);
        }
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file), limits)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DataIoError> {
        Self::from_bytes_limited(bytes, PackageLimits::default())
    }

    pub fn from_bytes_limited(bytes: &[u8], limits: PackageLimits) -> Result<Self, DataIoError> {
        Self::from_reader(Cursor::new(bytes), limits)
    }

    pub fn from_reader<R: Read + Seek>(
        mut reader: R,
        limits: PackageLimits,
    ) -> Result<Self, DataIoError> {
        reader.seek(SeekFrom::Start(0))?;
        let mut zip = zip::ZipArchive::new(reader)?;

        let mut parts = BTreeMap::new();
        let mut budget = InflateBudget::new(limits.max_total_bytes);
        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            if !file.is_file() {
                continue;
            }
            let name = file.name().to_string();
            let declared = file.size();
            let buf = read_limited(
                &mut file,
                &name,
                declared,
                limits.max_part_bytes,
                &mut budget,
            )?;
            parts.insert(name, buf);
        }

        if !parts.contains_key(WORKBOOK_PART) {
            return Err(DataIoError::MissingPart(WORKBOOK_PART.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        if let Some(bytes) = self.parts.get(name) {
            return Some(bytes.as_slice());
        }
        match name.strip_prefix('/') {
            Some(stripped) => self.parts.get(stripped).map(Vec::as_slice),
            None => self.parts.get(&format!("/{name}")).map(Vec::as_slice),
        }
    }

    pub fn set_part(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.parts.insert(name.into(), bytes);
    }

    pub fn remove_part(&mut self, name: &str) -> Option<Vec<u8>> {
        self.parts.remove(name)
    }

    fn required_part(&self, name: &str) -> Result<&[u8], DataIoError> {
        self.part(name)
            .ok_or_else(|| DataIoError::MissingPart(name.to_string()))
    }

    pub fn write_to_bytes(&self) -> Result<Vec<u8>, DataIoError> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), DataIoError> {
        let cursor = Cursor::new(Vec::new());
        let mut zip = zip::ZipWriter::new(cursor);
        let options = zip::write::FileOptions::<()>::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for (name, bytes) in &self.parts {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(bytes)?;
        }

        let cursor = zip.finish()?;
        w.write_all(&cursor.into_inner())?;
        Ok(())
    }

    /// The `<sheet>` entries of `xl/workbook.xml`, in workbook order.
    pub fn workbook_sheets(&self) -> Result<Vec<WorkbookSheetInfo>, DataIoError> {
        parse_workbook_sheets(self.required_part(WORKBOOK_PART)?)
    }

    pub fn sheet_names(&self, include_hidden: bool) -> Result<Vec<String>, DataIoError> {
        Ok(sheet_metadata::sheet_names(
            &self.workbook_sheets()?,
            include_hidden,
        ))
    }

    /// Return the ordered workbook sheets with their resolved worksheet part paths.
    pub fn worksheet_parts(&self) -> Result<Vec<WorksheetPartInfo>, DataIoError> {
        let sheets = self.workbook_sheets()?;
        let relationships = openxml::parse_relationships(self.required_part(WORKBOOK_RELS_PART)?)?;
        let rel_by_id: HashMap<&str, &openxml::Relationship> = relationships
            .iter()
            .map(|rel| (rel.id.as_str(), rel))
            .collect();

        let mut out = Vec::with_capacity(sheets.len());
        for sheet in sheets {
            let rel = rel_by_id.get(sheet.rel_id.as_str()).ok_or_else(|| {
                DataIoError::Invalid(format!("missing relationship for {}", sheet.rel_id))
            })?;
            let worksheet_part = openxml::resolve_target(WORKBOOK_PART, &rel.target);
            out.push(WorksheetPartInfo {
                name: sheet.name,
                sheet_id: sheet.sheet_id,
                rel_id: sheet.rel_id,
                visibility: sheet.visibility,
                worksheet_part,
            });
        }
        Ok(out)
    }

    /// Look a sheet up by name, ignoring case.
    pub fn find_sheet(&self, name: &str) -> Result<Option<WorksheetPartInfo>, DataIoError> {
        let name = name.trim();
        Ok(self
            .worksheet_parts()?
            .into_iter()
            .find(|sheet| sheet.name.eq_ignore_ascii_case(name)))
    }

    fn workbook_part_by_rel_type(&self, type_uri: &str) -> Result<Option<String>, DataIoError> {
        let Some(rels) = self.part(WORKBOOK_RELS_PART) else {
            return Ok(None);
        };
        Ok(openxml::parse_relationships(rels)?
            .into_iter()
            .find(|rel| rel.type_uri == type_uri && !rel.is_external())
            .map(|rel| openxml::resolve_target(WORKBOOK_PART, &rel.target)))
    }

    pub fn styles_part_name(&self) -> Result<String, DataIoError> {
        Ok(self
            .workbook_part_by_rel_type(REL_TYPE_STYLES)?
            .unwrap_or_else(|| "xl/styles.xml".to_string()))
    }

    /// Make sure the workbook has a style sheet, adding the default one when it is missing.
    /// Returns the styles part name.
    pub fn ensure_styles_part(&mut self) -> Result<String, DataIoError> {
        if let Some(existing) = self.workbook_part_by_rel_type(REL_TYPE_STYLES)? {
            if self.part(&existing).is_some() {
                return Ok(existing);
            }
            self.set_part(existing.clone(), crate::minimal::styles_xml().as_bytes().to_vec());
            return Ok(existing);
        }

        let part_name = "xl/styles.xml".to_string();
        let (rels, rel_id) = openxml::add_relationship(
            self.required_part(WORKBOOK_RELS_PART)?,
            REL_TYPE_STYLES,
            "styles.xml",
        )?;
        self.set_part(WORKBOOK_RELS_PART, rels);
        if let Some(ct) = self.part(CONTENT_TYPES_PART) {
            let ct = openxml::ensure_content_type_override(
                ct,
                &format!("/{part_name}"),
                CONTENT_TYPE_STYLES,
            )?;
            self.set_part(CONTENT_TYPES_PART, ct);
        }
        if self.part(&part_name).is_none() {
            self.set_part(part_name.clone(), crate::minimal::styles_xml().as_bytes().to_vec());
        }
        debug!("added default style sheet {part_name} ({rel_id})");
        Ok(part_name)
    }

    /// The shared-string table, or an empty one when the package has none.
    pub fn shared_strings(&self) -> Result<SharedStrings, DataIoError> {
        let part = self
            .workbook_part_by_rel_type(REL_TYPE_SHARED_STRINGS)?
            .unwrap_or_else(|| "xl/sharedStrings.xml".to_string());
        match self.part(&part) {
            Some(bytes) => parse_shared_strings(bytes),
            None => Ok(SharedStrings::default()),
        }
    }

    /// Register a new, empty worksheet named `name`.
    ///
    /// The part, its workbook relationship, its content-type override and the `<sheet>` entry
    /// are all written before returning.
    pub fn add_worksheet(&mut self, name: &str) -> Result<WorksheetPartInfo, DataIoError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DataIoError::EmptySheetName);
        }
        if name.chars().count() > MAX_SHEET_NAME_LEN {
            return Err(DataIoError::SheetNameTooLong(name.to_string()));
        }

        let sheets = self.workbook_sheets()?;
        let mut n = sheets.len() + 1;
        let part_name = loop {
            let candidate = format!("xl/worksheets/sheet{n}.xml");
            if self.part(&candidate).is_none() {
                break candidate;
            }
            n += 1;
        };

        let (rels, rel_id) = openxml::add_relationship(
            self.required_part(WORKBOOK_RELS_PART)?,
            REL_TYPE_WORKSHEET,
            &format!("worksheets/sheet{n}.xml"),
        )?;
        self.set_part(WORKBOOK_RELS_PART, rels);

        if let Some(ct) = self.part(CONTENT_TYPES_PART) {
            let ct = openxml::ensure_content_type_override(
                ct,
                &format!("/{part_name}"),
                CONTENT_TYPE_WORKSHEET,
            )?;
            self.set_part(CONTENT_TYPES_PART, ct);
        }

        let info = WorkbookSheetInfo {
            name: name.to_string(),
            sheet_id: sheet_metadata::next_sheet_id(&sheets),
            rel_id,
            visibility: SheetVisibility::Visible,
        };
        let workbook =
            sheet_metadata::append_workbook_sheet(self.required_part(WORKBOOK_PART)?, &info)?;
        self.set_part(WORKBOOK_PART, workbook);
        self.set_part(
            part_name.clone(),
            crate::minimal::worksheet_xml().as_bytes().to_vec(),
        );

        debug!(
            "added worksheet '{}' as {part_name} (sheetId {}, {})",
            info.name, info.sheet_id, info.rel_id
        );
        Ok(WorksheetPartInfo {
            name: info.name,
            sheet_id: info.sheet_id,
            rel_id: info.rel_id,
            visibility: info.visibility,
            worksheet_part: part_name,
        })
    }

    /// Drop `xl/calcChain.xml` and every reference to it. Returns whether the part existed.
    ///
    /// Cells rewritten by the writer may no longer hold the formulas the chain lists, and Excel
    /// reports a corrupt workbook when the chain is stale.
    pub fn remove_calc_chain(&mut self) -> Result<bool, DataIoError> {
        let removed = self.remove_part(CALC_CHAIN_PART).is_some();
        if let Some(rels) = self.part(WORKBOOK_RELS_PART) {
            let rels = openxml::workbook_rels_remove_calc_chain(rels)?;
            self.set_part(WORKBOOK_RELS_PART, rels);
        }
        if let Some(ct) = self.part(CONTENT_TYPES_PART) {
            let ct = openxml::content_types_remove_calc_chain(ct)?;
            self.set_part(CONTENT_TYPES_PART, ct);
        }
        if removed {
            debug!("removed {CALC_CHAIN_PART}");
        }
        Ok(removed)
    }
}

/// List the sheet names of the workbook at `path` without reading any cell data.
pub fn list_sheet_names(
    path: impl AsRef<Path>,
    include_hidden: bool,
) -> Result<Vec<String>, DataIoError> {
    XlsxPackage::open(path, PackageLimits::default())?.sheet_names(include_hidden)
}

struct InflateBudget {
    max_total_bytes: u64,
    used_bytes: u64,
}

impl InflateBudget {
    fn new(max_total_bytes: u64) -> Self {
        Self {
            max_total_bytes,
            used_bytes: 0,
        }
    }

    fn consume(&mut self, bytes: u64) -> Result<(), DataIoError> {
        self.used_bytes = self.used_bytes.saturating_add(bytes);
        if self.used_bytes > self.max_total_bytes {
            return Err(DataIoError::PackageTooLarge {
                total: self.used_bytes,
                max: self.max_total_bytes,
            });
        }
        Ok(())
    }
}

/// Read a ZIP entry with a per-part cap, charging the shared budget.
///
/// Declared sizes are checked first, but reads are also capped at `max + 1` bytes so forged
/// metadata cannot force an unbounded allocation.
fn read_limited<R: Read>(
    file: &mut R,
    part: &str,
    declared: u64,
    max_part_bytes: u64,
    budget: &mut InflateBudget,
) -> Result<Vec<u8>, DataIoError> {
    if declared > max_part_bytes {
        return Err(DataIoError::PartTooLarge {
            part: part.to_string(),
            size: declared,
            max: max_part_bytes,
        });
    }

    let mut buf = Vec::new();
    file.take(max_part_bytes.saturating_add(1))
        .read_to_end(&mut buf)?;
    let observed = buf.len() as u64;
    if observed > max_part_bytes {
        return Err(DataIoError::PartTooLarge {
            part: part.to_string(),
            size: observed,
            max: max_part_bytes,
        });
    }
    budget.consume(observed)?;
    Ok(buf)
}
