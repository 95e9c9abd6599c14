//! The workbook sheet registry (`<sheets>` in `xl/workbook.xml`).

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use serde::Serialize;

use crate::error::DataIoError;
use crate::openxml::local_name;

pub const OFFICE_RELATIONSHIPS_NS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

/// Elements that follow `<sheets>` in `CT_Workbook`.
const AFTER_SHEETS: &[&[u8]] = &[
    b"functionGroups",
    b"externalReferences",
    b"definedNames",
    b"calcPr",
    b"oleSize",
    b"customWorkbookViews",
    b"pivotCaches",
    b"smartTagPr",
    b"smartTagTypes",
    b"webPublishing",
    b"fileRecoveryPr",
    b"webPublishObjects",
    b"extLst",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SheetVisibility {
    #[default]
    Visible,
    Hidden,
    VeryHidden,
}

impl SheetVisibility {
    pub fn is_visible(self) -> bool {
        self == SheetVisibility::Visible
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkbookSheetInfo {
    pub name: String,
    pub sheet_id: u32,
    pub rel_id: String,
    pub visibility: SheetVisibility,
}

pub fn parse_workbook_sheets(workbook_xml: &[u8]) -> Result<Vec<WorkbookSheetInfo>, DataIoError> {
    let mut reader = Reader::from_reader(workbook_xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut sheets = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Empty(e) | Event::Start(e) => {
                if e.local_name().as_ref() == b"sheet" {
                    sheets.push(parse_sheet_element(&e)?);
                }
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(sheets)
}

fn parse_sheet_element(e: &BytesStart<'_>) -> Result<WorkbookSheetInfo, DataIoError> {
    let mut name: Option<String> = None;
    let mut sheet_id: Option<u32> = None;
    let mut rel_id: Option<String> = None;
    let mut visibility = SheetVisibility::Visible;

    for attr in e.attributes() {
        let attr = attr?;
        let key = attr.key.as_ref();
        match key {
            b"name" => name = Some(attr.unescape_value()?.to_string()),
            b"sheetId" => {
                let v = attr.unescape_value()?;
                sheet_id = Some(
                    v.trim()
                        .parse::<u32>()
                        .map_err(|_| DataIoError::InvalidSheetId)?,
                );
            }
            b"state" => {
                let v = attr.unescape_value()?;
                visibility = match v.as_ref() {
                    "hidden" => SheetVisibility::Hidden,
                    "veryHidden" => SheetVisibility::VeryHidden,
                    _ => SheetVisibility::Visible,
                };
            }
            _ if local_name(key) == b"id" => rel_id = Some(attr.unescape_value()?.to_string()),
            _ => {}
        }
    }

    Ok(WorkbookSheetInfo {
        name: name.ok_or(DataIoError::MissingAttr("name"))?,
        sheet_id: sheet_id.ok_or(DataIoError::MissingAttr("sheetId"))?,
        rel_id: rel_id.ok_or(DataIoError::MissingAttr("r:id"))?,
        visibility,
    })
}

/// Names of the registered sheets in workbook order, optionally skipping hidden ones.
pub fn sheet_names(sheets: &[WorkbookSheetInfo], include_hidden: bool) -> Vec<String> {
    sheets
        .iter()
        .filter(|s| include_hidden || s.visibility.is_visible())
        .map(|s| s.name.clone())
        .collect()
}

/// Sheet id for a new registry entry: one past the current maximum, never below 1.
pub fn next_sheet_id(sheets: &[WorkbookSheetInfo]) -> u32 {
    sheets.iter().map(|s| s.sheet_id).max().unwrap_or(0) + 1
}

/// Append a `<sheet>` entry to the registry, creating `<sheets>` when the workbook has none.
pub fn append_workbook_sheet(
    workbook_xml: &[u8],
    sheet: &WorkbookSheetInfo,
) -> Result<Vec<u8>, DataIoError> {
    let rel_prefix = relationships_prefix(workbook_xml)?;

    let mut reader = Reader::from_reader(workbook_xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(workbook_xml.len() + 128));
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut inserted = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) if e.local_name().as_ref() == b"sheets" => {
                depth += 1;
                writer.write_event(Event::Start(e.to_owned()))?;
            }
            Event::End(ref e) if !inserted && e.local_name().as_ref() == b"sheets" => {
                depth = depth.saturating_sub(1);
                let tag = sheet_tag(e.name().as_ref());
                writer.write_event(Event::Empty(build_sheet_element(
                    &tag,
                    rel_prefix.as_deref(),
                    sheet,
                )))?;
                writer.write_event(Event::End(e.to_owned()))?;
                inserted = true;
            }
            Event::Empty(ref e) if !inserted && e.local_name().as_ref() == b"sheets" => {
                let sheets_tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                writer.write_event(Event::Start(e.to_owned()))?;
                writer.write_event(Event::Empty(build_sheet_element(
                    &sheet_tag(e.name().as_ref()),
                    rel_prefix.as_deref(),
                    sheet,
                )))?;
                writer.write_event(Event::End(BytesEnd::new(sheets_tag)))?;
                inserted = true;
            }
            Event::Start(ref e) | Event::Empty(ref e)
                if !inserted
                    && depth == 1
                    && AFTER_SHEETS.contains(&e.local_name().as_ref()) =>
            {
                write_new_sheets(&mut writer, e.name().as_ref(), rel_prefix.as_deref(), sheet)?;
                inserted = true;
                if matches!(event, Event::Start(_)) {
                    depth += 1;
                }
                writer.write_event(event.into_owned())?;
            }
            Event::Start(ref e) => {
                depth += 1;
                writer.write_event(Event::Start(e.to_owned()))?;
            }
            Event::End(ref e) => {
                if !inserted && depth == 1 && e.local_name().as_ref() == b"workbook" {
                    write_new_sheets(&mut writer, e.name().as_ref(), rel_prefix.as_deref(), sheet)?;
                    inserted = true;
                }
                depth = depth.saturating_sub(1);
                writer.write_event(Event::End(e.to_owned()))?;
            }
            ev => writer.write_event(ev.into_owned())?,
        }
        buf.clear();
    }

    if !inserted {
        return Err(DataIoError::Invalid(
            "workbook.xml has no <workbook> element".to_string(),
        ));
    }
    Ok(writer.into_inner())
}

fn write_new_sheets(
    writer: &mut Writer<Vec<u8>>,
    sibling: &[u8],
    rel_prefix: Option<&str>,
    sheet: &WorkbookSheetInfo,
) -> Result<(), DataIoError> {
    let tag = prefixed(sibling, "sheets");
    writer.write_event(Event::Start(BytesStart::new(tag.as_str())))?;
    writer.write_event(Event::Empty(build_sheet_element(
        &prefixed(sibling, "sheet"),
        rel_prefix,
        sheet,
    )))?;
    writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
    Ok(())
}

/// `x:sheets` -> `x:sheet`.
fn sheet_tag(sheets_name: &[u8]) -> String {
    prefixed(sheets_name, "sheet")
}

fn prefixed(sibling: &[u8], local: &str) -> String {
    match sibling.iter().rposition(|b| *b == b':') {
        Some(idx) => format!("{}:{local}", String::from_utf8_lossy(&sibling[..idx])),
        None => local.to_string(),
    }
}

fn build_sheet_element(
    tag: &str,
    rel_prefix: Option<&str>,
    sheet: &WorkbookSheetInfo,
) -> BytesStart<'static> {
    let mut elem = BytesStart::new(tag.to_string());
    elem.push_attribute(("name", sheet.name.as_str()));
    elem.push_attribute(("sheetId", sheet.sheet_id.to_string().as_str()));
    match sheet.visibility {
        SheetVisibility::Visible => {}
        SheetVisibility::Hidden => elem.push_attribute(("state", "hidden")),
        SheetVisibility::VeryHidden => elem.push_attribute(("state", "veryHidden")),
    }
    match rel_prefix {
        Some(prefix) => {
            let key = format!("{prefix}:id");
            elem.push_attribute((key.as_str(), sheet.rel_id.as_str()));
        }
        None => {
            elem.push_attribute(("xmlns:r", OFFICE_RELATIONSHIPS_NS));
            elem.push_attribute(("r:id", sheet.rel_id.as_str()));
        }
    }
    elem
}

/// The prefix the workbook root binds to the office relationships namespace, if any.
fn relationships_prefix(workbook_xml: &[u8]) -> Result<Option<String>, DataIoError> {
    let mut reader = Reader::from_reader(workbook_xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => return Ok(None),
            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == b"workbook" => {
                for attr in e.attributes().with_checks(false) {
                    let attr = attr?;
                    let Some(prefix) = attr.key.as_ref().strip_prefix(b"xmlns:") else {
                        continue;
                    };
                    if attr.value.as_ref() == OFFICE_RELATIONSHIPS_NS.as_bytes() {
                        return Ok(Some(String::from_utf8_lossy(prefix).into_owned()));
                    }
                }
                return Ok(None);
            }
            _ => {}
        }
        buf.clear();
    }
}
