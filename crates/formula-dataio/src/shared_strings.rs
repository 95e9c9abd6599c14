//! `xl/sharedStrings.xml` reader.
//!
//! Only the visible text of each `<si>` is kept: rich-text runs are concatenated and phonetic
//! (`<rPh>`) runs are dropped.

use std::borrow::Cow;

use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::Reader;

use crate::error::DataIoError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedStrings {
    items: Vec<String>,
}

impl SharedStrings {
    pub fn get(&self, index: usize) -> Option<&str> {
        self.items.get(index).map(String::as_str)
    }

    /// Resolve the raw `<v>` of an `s` cell.
    pub fn resolve(&self, raw: &str) -> Result<&str, DataIoError> {
        let index = raw
            .trim()
            .parse::<usize>()
            .map_err(|_| DataIoError::Invalid(format!("bad shared string index '{raw}'")))?;
        self.get(index).ok_or_else(|| {
            DataIoError::Invalid(format!(
                "shared string index {index} out of range ({} entries)",
                self.items.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub fn parse_shared_strings(xml: &[u8]) -> Result<SharedStrings, DataIoError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut buf = Vec::new();
    let mut items = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"si" => {
                items.push(read_string_item(&mut reader, b"si")?);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"si" => items.push(String::new()),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(SharedStrings { items })
}

/// Visible text of a string item (`<si>` or an inline `<is>`), consuming up to its end tag.
pub(crate) fn read_string_item(
    reader: &mut Reader<&[u8]>,
    end: &[u8],
) -> Result<String, DataIoError> {
    let mut buf = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => {
                text.push_str(&read_text(reader, e.name().as_ref())?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"r" => {
                text.push_str(&parse_r(reader)?);
            }
            Event::Start(e) => {
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
            }
            Event::End(e) if e.local_name().as_ref() == end => break,
            Event::Eof => {
                return Err(DataIoError::Invalid(
                    "unexpected eof in string item".to_string(),
                ))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(text)
}

fn parse_r(reader: &mut Reader<&[u8]>) -> Result<String, DataIoError> {
    let mut buf = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => {
                text.push_str(&read_text(reader, e.name().as_ref())?);
            }
            Event::Start(e) => {
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
            }
            Event::End(e) if e.local_name().as_ref() == b"r" => break,
            Event::Eof => return Err(DataIoError::Invalid("unexpected eof in <r>".to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(text)
}

/// Collect text and CDATA up to the end tag `end`.
pub(crate) fn read_text(reader: &mut Reader<&[u8]>, end: &[u8]) -> Result<String, DataIoError> {
    let mut buf = Vec::new();
    let mut text = String::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Text(e) => {
                let t: Cow<'_, str> = e.unescape()?;
                text.push_str(&t);
            }
            Event::CData(e) => text.push_str(std::str::from_utf8(e.as_ref())?),
            Event::End(e) if e.name() == QName(end) => break,
            Event::Eof => return Err(DataIoError::Invalid("unexpected eof in text".to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(text)
}
