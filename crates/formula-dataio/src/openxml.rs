//! Package plumbing shared by the reader and the writer: relationships, content types and
//! calcChain removal.

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::DataIoError;

pub const REL_TYPE_WORKSHEET: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
pub const REL_TYPE_STYLES: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles";
pub const REL_TYPE_SHARED_STRINGS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings";
pub const REL_TYPE_CALC_CHAIN: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/calcChain";

pub const CONTENT_TYPE_WORKSHEET: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml";

pub const CONTENT_TYPE_STYLES: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml";
pub const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
pub const WORKBOOK_PART: &str = "xl/workbook.xml";
pub const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub type_uri: String,
    pub target: String,
    pub target_mode: Option<String>,
}

impl Relationship {
    pub fn is_external(&self) -> bool {
        self.target_mode
            .as_deref()
            .is_some_and(|mode| mode.trim().eq_ignore_ascii_case("External"))
    }
}

/// Resolve a relationship target against the part that owns the relationship.
///
/// Absolute targets are rooted at the package; relative ones are joined to the source folder.
/// URI fragments are dropped and `.`/`..` segments are normalized.
pub fn resolve_target(base_part: &str, target: &str) -> String {
    let target = target.split_once('#').map(|(base, _)| base).unwrap_or(target);
    if target.is_empty() {
        return base_part.strip_prefix('/').unwrap_or(base_part).to_string();
    }

    let (target, is_absolute) = match target.strip_prefix('/') {
        Some(target) => (target, true),
        None => (target, false),
    };
    let base_dir = if is_absolute {
        ""
    } else {
        base_part.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    };

    let mut components: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            _ => components.push(segment),
        }
    }
    components.join("/")
}

pub fn parse_relationships(xml: &[u8]) -> Result<Vec<Relationship>, DataIoError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut relationships = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) | Event::Empty(start) => {
                if local_name(start.name().as_ref()).eq_ignore_ascii_case(b"Relationship") {
                    let mut id = None;
                    let mut target = None;
                    let mut type_uri = None;
                    let mut target_mode = None;
                    for attr in start.attributes() {
                        let attr = attr?;
                        let key = local_name(attr.key.as_ref());
                        let value = attr.unescape_value()?.into_owned();
                        if key.eq_ignore_ascii_case(b"Id") {
                            id = Some(value);
                        } else if key.eq_ignore_ascii_case(b"Target") {
                            target = Some(value);
                        } else if key.eq_ignore_ascii_case(b"Type") {
                            type_uri = Some(value);
                        } else if key.eq_ignore_ascii_case(b"TargetMode") {
                            target_mode = Some(value);
                        }
                    }
                    if let (Some(id), Some(target), Some(type_uri)) = (id, target, type_uri) {
                        relationships.push(Relationship {
                            id,
                            type_uri,
                            target,
                            target_mode,
                        });
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(relationships)
}

pub fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|b| *b == b':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

/// Next free `rId{n}` number for a set of relationship ids.
pub fn next_relationship_id<'a>(ids: impl Iterator<Item = &'a str>) -> u32 {
    ids.filter_map(|id| id.strip_prefix("rId"))
        .filter_map(|n| n.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1
}

/// Append a relationship to a `.rels` document and return the new id.
pub fn add_relationship(
    rels_xml: &[u8],
    type_uri: &str,
    target: &str,
) -> Result<(Vec<u8>, String), DataIoError> {
    let existing = parse_relationships(rels_xml)?;
    let id = format!(
        "rId{}",
        next_relationship_id(existing.iter().map(|rel| rel.id.as_str()))
    );

    let mut xml = std::str::from_utf8(rels_xml)?.to_string();
    let rel = format!(
        r#"<Relationship Id="{id}" Type="{}" Target="{}"/>"#,
        escape_attr(type_uri),
        escape_attr(target)
    );
    match xml.rfind("</Relationships>") {
        Some(idx) => xml.insert_str(idx, &rel),
        None => {
            return Err(DataIoError::Invalid(
                "relationships part has no closing </Relationships>".to_string(),
            ))
        }
    }
    Ok((xml.into_bytes(), id))
}

/// Add an `<Override>` for `part_name` (with a leading `/`) unless one is already present.
pub fn ensure_content_type_override(
    content_types_xml: &[u8],
    part_name: &str,
    content_type: &str,
) -> Result<Vec<u8>, DataIoError> {
    let mut xml = std::str::from_utf8(content_types_xml)?.to_string();
    if xml.contains(&format!(r#"PartName="{part_name}""#)) {
        return Ok(xml.into_bytes());
    }
    if let Some(idx) = xml.rfind("</Types>") {
        let insert =
            format!(r#"<Override PartName="{part_name}" ContentType="{content_type}"/>"#);
        xml.insert_str(idx, &insert);
    }
    Ok(xml.into_bytes())
}

/// Drop the calcChain relationship from `xl/_rels/workbook.xml.rels`.
pub fn workbook_rels_remove_calc_chain(rels_xml: &[u8]) -> Result<Vec<u8>, DataIoError> {
    remove_elements(rels_xml, b"Relationship", relationship_is_calc_chain)
}

/// Drop the calcChain `<Override>` from `[Content_Types].xml`.
pub fn content_types_remove_calc_chain(ct_xml: &[u8]) -> Result<Vec<u8>, DataIoError> {
    remove_elements(ct_xml, b"Override", override_is_calc_chain)
}

fn remove_elements(
    xml: &[u8],
    tag: &[u8],
    mut should_remove: impl FnMut(&BytesStart<'_>) -> Result<bool, DataIoError>,
) -> Result<Vec<u8>, DataIoError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));

    let mut buf = Vec::new();
    let mut skipping = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) if local_name(e.name().as_ref()) == tag => {
                if should_remove(e)? {
                    skipping = true;
                } else {
                    writer.write_event(Event::Start(e.to_owned()))?;
                }
            }
            Event::Empty(ref e) if local_name(e.name().as_ref()) == tag => {
                if !should_remove(e)? {
                    writer.write_event(Event::Empty(e.to_owned()))?;
                }
            }
            Event::End(ref e) if skipping && local_name(e.name().as_ref()) == tag => {
                skipping = false;
            }
            ev if skipping => drop(ev),
            ev => writer.write_event(ev.into_owned())?,
        }
        buf.clear();
    }

    Ok(writer.into_inner())
}

fn relationship_is_calc_chain(e: &BytesStart<'_>) -> Result<bool, DataIoError> {
    let mut rel_type = None;
    let mut target = None;
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?.into_owned();
        match attr.key.as_ref() {
            b"Type" => rel_type = Some(value),
            b"Target" => target = Some(value),
            _ => {}
        }
    }
    if rel_type.as_deref() == Some(REL_TYPE_CALC_CHAIN) {
        return Ok(true);
    }
    Ok(target.as_deref().is_some_and(|t| t.ends_with("calcChain.xml")))
}

fn override_is_calc_chain(e: &BytesStart<'_>) -> Result<bool, DataIoError> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"PartName" {
            let value = attr.unescape_value()?;
            return Ok(value.as_ref().ends_with("calcChain.xml"));
        }
    }
    Ok(false)
}

pub(crate) fn escape_attr(value: &str) -> std::borrow::Cow<'_, str> {
    quick_xml::escape::escape(value)
}
