//! `xl/styles.xml` number formats and cell formats, plus the per-session Style/Format Cache.
//!
//! Only `<numFmts>` and `<cellXfs>` are modelled. Everything else in the style sheet (fonts,
//! fills, borders, named styles, dxfs, extensions) is copied through untouched when the part
//! is rewritten.

use std::collections::HashMap;

use log::debug;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use roxmltree::Document;

use crate::error::DataIoError;
use crate::mapping::CellKind;
use crate::options::FormatDefaults;

/// Ids `1..=164` are reserved for built-in number formats.
pub const FIRST_CUSTOM_NUM_FMT_ID: u32 = 165;

/// Elements that follow `<cellXfs>` in `CT_Stylesheet`.
const AFTER_CELL_XFS: &[&[u8]] = &[
    b"cellStyles",
    b"dxfs",
    b"tableStyles",
    b"colors",
    b"extLst",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumFmt {
    pub id: u32,
    pub code: String,
}

/// The parts of an `<xf>` the cache compares on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellXf {
    pub num_fmt_id: u32,
    pub font_id: u32,
    pub fill_id: u32,
    pub border_id: u32,
    pub quote_prefix: bool,
}

impl CellXf {
    fn plain(num_fmt_id: u32, quote_prefix: bool) -> Self {
        Self {
            num_fmt_id,
            quote_prefix,
            ..Self::default()
        }
    }

    fn is_plain(&self) -> bool {
        self.font_id == 0 && self.fill_id == 0 && self.border_id == 0
    }
}

/// Parsed `xl/styles.xml`.
#[derive(Debug, Clone)]
pub struct StylesPart {
    raw: Vec<u8>,
    num_fmts: Vec<NumFmt>,
    cell_xfs: Vec<CellXf>,
    /// Number of `<xf>` children already present in `<cellXfs>`.
    existing_xfs: usize,
    has_num_fmts: bool,
    has_cell_xfs: bool,
}

impl StylesPart {
    pub fn parse(xml: &[u8]) -> Result<Self, DataIoError> {
        let text = String::from_utf8(xml.to_vec())?;
        let doc = Document::parse(text.trim_start_matches('\u{feff}'))?;

        let mut num_fmts = Vec::new();
        let mut has_num_fmts = false;
        if let Some(block) = doc
            .root_element()
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "numFmts")
        {
            has_num_fmts = true;
            for node in block
                .children()
                .filter(|n| n.is_element() && n.tag_name().name() == "numFmt")
            {
                let id = node
                    .attribute("numFmtId")
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .ok_or(DataIoError::MissingAttr("numFmtId"))?;
                num_fmts.push(NumFmt {
                    id,
                    code: node.attribute("formatCode").unwrap_or_default().to_string(),
                });
            }
        }

        let mut cell_xfs = Vec::new();
        let mut has_cell_xfs = false;
        if let Some(block) = doc
            .root_element()
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "cellXfs")
        {
            has_cell_xfs = true;
            for node in block
                .children()
                .filter(|n| n.is_element() && n.tag_name().name() == "xf")
            {
                let num = |name: &str| {
                    node.attribute(name)
                        .and_then(|v| v.trim().parse::<u32>().ok())
                        .unwrap_or(0)
                };
                cell_xfs.push(CellXf {
                    num_fmt_id: num("numFmtId"),
                    font_id: num("fontId"),
                    fill_id: num("fillId"),
                    border_id: num("borderId"),
                    quote_prefix: matches!(node.attribute("quotePrefix"), Some("1" | "true")),
                });
            }
        }
        let existing_xfs = cell_xfs.len();
        if cell_xfs.is_empty() {
            // Index 0 is the workbook default and must exist.
            cell_xfs.push(CellXf::default());
        }

        Ok(Self {
            raw: xml.to_vec(),
            num_fmts,
            cell_xfs,
            existing_xfs,
            has_num_fmts,
            has_cell_xfs,
        })
    }

    pub fn num_fmts(&self) -> &[NumFmt] {
        &self.num_fmts
    }

    pub fn cell_xfs(&self) -> &[CellXf] {
        &self.cell_xfs
    }

    pub fn num_fmt_code(&self, id: u32) -> Option<&str> {
        self.num_fmts
            .iter()
            .find(|f| f.id == id)
            .map(|f| f.code.as_str())
    }

    fn find_num_fmt(&self, code: &str) -> Option<u32> {
        self.num_fmts.iter().find(|f| f.code == code).map(|f| f.id)
    }

    fn find_xf(&self, wanted: CellXf) -> Option<u32> {
        self.cell_xfs
            .iter()
            .position(|xf| xf.is_plain() && *xf == wanted)
            .map(|idx| idx as u32)
    }

    fn push_xf(&mut self, xf: CellXf) -> u32 {
        self.cell_xfs.push(xf);
        (self.cell_xfs.len() - 1) as u32
    }

    /// Serialize the style sheet with regenerated `<numFmts>`, appended `<xf>` entries and
    /// corrected `count` attributes.
    pub fn to_xml(&self) -> Result<Vec<u8>, DataIoError> {
        let mut reader = Reader::from_reader(self.raw.as_slice());
        reader.config_mut().trim_text(false);
        let mut writer = Writer::new(Vec::with_capacity(self.raw.len() + 512));
        let mut buf = Vec::new();

        let mut depth = 0usize;
        let mut prefix = String::new();
        let mut skipping_num_fmts = false;
        let mut in_cell_xfs = false;
        let mut cell_xfs_written = self.has_cell_xfs;

        loop {
            let event = reader.read_event_into(&mut buf)?;
            if skipping_num_fmts {
                if let Event::End(ref e) = event {
                    if e.local_name().as_ref() == b"numFmts" {
                        skipping_num_fmts = false;
                    }
                }
                buf.clear();
                continue;
            }
            match event {
                Event::Eof => break,
                Event::Start(ref e) if depth == 0 => {
                    prefix = name_prefix(e.name().as_ref());
                    depth += 1;
                    writer.write_event(Event::Start(e.to_owned()))?;
                    if !self.has_num_fmts {
                        self.write_num_fmts(&mut writer, &prefix)?;
                    }
                }
                Event::Start(ref e) if depth == 1 && e.local_name().as_ref() == b"numFmts" => {
                    self.write_num_fmts(&mut writer, &prefix)?;
                    skipping_num_fmts = true;
                }
                Event::Empty(ref e) if depth == 1 && e.local_name().as_ref() == b"numFmts" => {
                    self.write_num_fmts(&mut writer, &prefix)?;
                }
                Event::Start(ref e) if depth == 1 && e.local_name().as_ref() == b"cellXfs" => {
                    depth += 1;
                    in_cell_xfs = true;
                    writer.write_event(Event::Start(with_count(e, self.cell_xfs.len())?))?;
                }
                Event::Empty(ref e) if depth == 1 && e.local_name().as_ref() == b"cellXfs" => {
                    writer.write_event(Event::Start(with_count(e, self.cell_xfs.len())?))?;
                    self.write_xfs(&mut writer, &prefix, 0)?;
                    writer.write_event(Event::End(BytesEnd::new(qualified(&prefix, "cellXfs"))))?;
                }
                Event::End(ref e) if in_cell_xfs && depth == 2 => {
                    self.write_xfs(&mut writer, &prefix, self.existing_xfs)?;
                    in_cell_xfs = false;
                    depth -= 1;
                    writer.write_event(Event::End(e.to_owned()))?;
                }
                Event::Start(ref e)
                    if depth == 1
                        && !cell_xfs_written
                        && AFTER_CELL_XFS.contains(&e.local_name().as_ref()) =>
                {
                    self.write_cell_xfs_block(&mut writer, &prefix)?;
                    cell_xfs_written = true;
                    depth += 1;
                    writer.write_event(Event::Start(e.to_owned()))?;
                }
                Event::Empty(ref e)
                    if depth == 1
                        && !cell_xfs_written
                        && AFTER_CELL_XFS.contains(&e.local_name().as_ref()) =>
                {
                    self.write_cell_xfs_block(&mut writer, &prefix)?;
                    cell_xfs_written = true;
                    writer.write_event(Event::Empty(e.to_owned()))?;
                }
                Event::Start(ref e) => {
                    depth += 1;
                    writer.write_event(Event::Start(e.to_owned()))?;
                }
                Event::End(ref e) => {
                    if depth == 1 && !cell_xfs_written {
                        self.write_cell_xfs_block(&mut writer, &prefix)?;
                        cell_xfs_written = true;
                    }
                    depth = depth.saturating_sub(1);
                    writer.write_event(Event::End(e.to_owned()))?;
                }
                ev => writer.write_event(ev.into_owned())?,
            }
            buf.clear();
        }

        Ok(writer.into_inner())
    }

    fn write_num_fmts(&self, writer: &mut Writer<Vec<u8>>, prefix: &str) -> Result<(), DataIoError> {
        if self.num_fmts.is_empty() {
            return Ok(());
        }
        let tag = qualified(prefix, "numFmts");
        let mut start = BytesStart::new(tag.as_str());
        start.push_attribute(("count", self.num_fmts.len().to_string().as_str()));
        writer.write_event(Event::Start(start))?;
        let fmt_tag = qualified(prefix, "numFmt");
        for fmt in &self.num_fmts {
            let mut el = BytesStart::new(fmt_tag.as_str());
            el.push_attribute(("numFmtId", fmt.id.to_string().as_str()));
            el.push_attribute(("formatCode", fmt.code.as_str()));
            writer.write_event(Event::Empty(el))?;
        }
        writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
        Ok(())
    }

    fn write_cell_xfs_block(
        &self,
        writer: &mut Writer<Vec<u8>>,
        prefix: &str,
    ) -> Result<(), DataIoError> {
        let tag = qualified(prefix, "cellXfs");
        let mut start = BytesStart::new(tag.as_str());
        start.push_attribute(("count", self.cell_xfs.len().to_string().as_str()));
        writer.write_event(Event::Start(start))?;
        self.write_xfs(writer, prefix, 0)?;
        writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
        Ok(())
    }

    fn write_xfs(
        &self,
        writer: &mut Writer<Vec<u8>>,
        prefix: &str,
        from: usize,
    ) -> Result<(), DataIoError> {
        let tag = qualified(prefix, "xf");
        for xf in self.cell_xfs.iter().skip(from) {
            let mut el = BytesStart::new(tag.as_str());
            el.push_attribute(("numFmtId", xf.num_fmt_id.to_string().as_str()));
            el.push_attribute(("fontId", xf.font_id.to_string().as_str()));
            el.push_attribute(("fillId", xf.fill_id.to_string().as_str()));
            el.push_attribute(("borderId", xf.border_id.to_string().as_str()));
            el.push_attribute(("xfId", "0"));
            if xf.quote_prefix {
                el.push_attribute(("quotePrefix", "1"));
            }
            if xf.num_fmt_id >= 1 {
                el.push_attribute(("applyNumberFormat", "1"));
            }
            writer.write_event(Event::Empty(el))?;
        }
        Ok(())
    }
}

fn name_prefix(name: &[u8]) -> String {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| String::from_utf8_lossy(&name[..idx]).into_owned())
        .unwrap_or_default()
}

fn qualified(prefix: &str, local: &str) -> String {
    if prefix.is_empty() {
        local.to_string()
    } else {
        format!("{prefix}:{local}")
    }
}

/// Copy `e` with its `count` attribute replaced.
fn with_count(e: &BytesStart<'_>, count: usize) -> Result<BytesStart<'static>, DataIoError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() != b"count" {
            out.push_attribute(attr);
        }
    }
    out.push_attribute(("count", count.to_string().as_str()));
    Ok(out.into_owned())
}

/// Deduplicates `(CellKind, format code)` pairs into number-format and cell-format entries.
///
/// Owned by one writer session. Entries registered through the cache are written back into
/// the style sheet by [`StyleCache::to_xml`].
#[derive(Debug, Clone)]
pub struct StyleCache {
    styles: StylesPart,
    entries: HashMap<(CellKind, Option<String>), u32>,
    defaults: HashMap<CellKind, u32>,
    next_num_fmt_id: u32,
}

impl StyleCache {
    /// Wrap a parsed style sheet and register the default format of every numeric kind.
    pub fn load(styles: StylesPart, formats: &FormatDefaults) -> Self {
        let next_num_fmt_id = styles
            .num_fmts
            .iter()
            .map(|f| f.id + 1)
            .max()
            .unwrap_or(0)
            .max(FIRST_CUSTOM_NUM_FMT_ID);
        let mut cache = Self {
            styles,
            entries: HashMap::new(),
            defaults: HashMap::new(),
            next_num_fmt_id,
        };
        for (kind, code) in [
            (CellKind::Date, &formats.date),
            (CellKind::Number, &formats.number),
            (CellKind::Decimal, &formats.decimal),
            (CellKind::Percent, &formats.percent),
            (CellKind::Currency, &formats.currency),
        ] {
            cache.register_format(kind, Some(code), true);
        }
        cache
    }

    /// Return the cell-format index for `(kind, code)`, allocating table entries on first use.
    ///
    /// A request without a code resolves to the default entry for `kind`. `General` without a
    /// code needs no style and returns 0.
    pub fn register_format(&mut self, kind: CellKind, code: Option<&str>, is_default: bool) -> u32 {
        let code = normalize_code(code);
        let key = (kind, code.clone());
        if let Some(index) = self.entries.get(&key) {
            return *index;
        }
        if code.is_none() {
            if let Some(index) = self.defaults.get(&kind) {
                return *index;
            }
            if kind != CellKind::Quoted {
                return 0;
            }
        }

        let xf = if kind == CellKind::Quoted {
            CellXf::plain(0, true)
        } else {
            let code = code.as_deref().unwrap_or("General");
            CellXf::plain(self.num_fmt_id_for(code), false)
        };
        let index = match self.styles.find_xf(xf) {
            Some(index) => index,
            None => {
                let index = self.styles.push_xf(xf);
                debug!(
                    "allocated cell format {index} (numFmtId {}, {kind:?})",
                    xf.num_fmt_id
                );
                index
            }
        };

        self.entries.insert(key, index);
        if is_default || (kind == CellKind::Quoted && code.is_none()) {
            self.defaults.insert(kind, index);
        }
        index
    }

    /// Lookup without allocation: exact entry, then the default for `kind`, then 0.
    pub fn style_index(&self, kind: CellKind, code: Option<&str>) -> u32 {
        self.entries
            .get(&(kind, normalize_code(code)))
            .or_else(|| self.defaults.get(&kind))
            .copied()
            .unwrap_or(0)
    }

    fn num_fmt_id_for(&mut self, code: &str) -> u32 {
        if code.eq_ignore_ascii_case("General") {
            return 0;
        }
        if let Some(id) = self.styles.find_num_fmt(code) {
            return id;
        }
        let id = self.next_num_fmt_id;
        self.next_num_fmt_id += 1;
        self.styles.num_fmts.push(NumFmt {
            id,
            code: code.to_string(),
        });
        debug!("allocated number format {id} ({code})");
        id
    }

    pub fn styles(&self) -> &StylesPart {
        &self.styles
    }

    pub fn to_xml(&self) -> Result<Vec<u8>, DataIoError> {
        self.styles.to_xml()
    }
}

fn normalize_code(code: Option<&str>) -> Option<String> {
    code.map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    const BLANK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font/></fonts><fills count="1"><fill/></fills><borders count="1"><border/></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/></cellXfs><cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles></styleSheet>"#;

    fn cache(xml: &str) -> StyleCache {
        StyleCache::load(
            StylesPart::parse(xml.as_bytes()).unwrap(),
            &FormatDefaults::default(),
        )
    }

    fn reparse(cache: &StyleCache) -> StylesPart {
        StylesPart::parse(&cache.to_xml().unwrap()).unwrap()
    }

    #[test]
    fn defaults_are_registered_from_165() {
        let cache = cache(BLANK);
        let styles = cache.styles();
        assert_eq!(
            styles
                .num_fmts()
                .iter()
                .map(|f| (f.id, f.code.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (165, "m/d/yyyy"),
                (166, "0"),
                (167, "0.00"),
                (168, "0%"),
                (169, r##""$"#,##0.00;("$"#,##0.00)"##),
            ]
        );
        assert_eq!(cache.style_index(CellKind::Date, None), 1);
        assert_eq!(cache.style_index(CellKind::Currency, None), 5);
        assert_eq!(cache.style_index(CellKind::General, None), 0);
    }

    #[test]
    fn repeated_registration_is_a_cache_hit() {
        let mut cache = cache(BLANK);
        let first = cache.register_format(CellKind::Decimal, Some("#,##0.000"), false);
        for _ in 0..50 {
            assert_eq!(
                cache.register_format(CellKind::Decimal, Some("#,##0.000"), false),
                first
            );
        }
        let styles = reparse(&cache);
        assert_eq!(
            styles
                .num_fmts()
                .iter()
                .filter(|f| f.code == "#,##0.000")
                .count(),
            1
        );
        assert_eq!(styles.cell_xfs().len(), 7);
    }

    #[test]
    fn missing_code_falls_back_to_kind_default() {
        let mut cache = cache(BLANK);
        let date = cache.style_index(CellKind::Date, None);
        assert_eq!(cache.register_format(CellKind::Date, None, false), date);
        assert_eq!(cache.register_format(CellKind::General, None, false), 0);
        assert_eq!(cache.style_index(CellKind::Date, Some("yyyy-mm-dd")), date);
    }

    #[test]
    fn quoted_cells_get_a_quote_prefix_xf() {
        let mut cache = cache(BLANK);
        let quoted = cache.register_format(CellKind::Quoted, None, false);
        assert_eq!(cache.register_format(CellKind::Quoted, None, false), quoted);
        let xf = reparse(&cache).cell_xfs()[quoted as usize];
        assert_eq!(xf.num_fmt_id, 0);
        assert!(xf.quote_prefix);

        let xml = String::from_utf8(cache.to_xml().unwrap()).unwrap();
        assert!(xml.contains(r#"<xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0" quotePrefix="1"/>"#));
        assert!(xml.contains(r#"<xf numFmtId="165" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/>"#));
    }

    #[test]
    fn rewrite_fixes_counts_and_keeps_other_blocks() {
        let cache = cache(BLANK);
        let xml = String::from_utf8(cache.to_xml().unwrap()).unwrap();
        assert!(xml.contains(r#"<numFmts count="5">"#));
        assert!(xml.contains(r#"<cellXfs count="6">"#));
        assert!(xml.contains(r#"<cellStyle name="Normal" xfId="0" builtinId="0"/>"#));
        let numfmts_at = xml.find("<numFmts").unwrap();
        assert!(numfmts_at < xml.find("<fonts").unwrap());
    }

    #[test]
    fn existing_templates_are_reused_not_grown() {
        let template = r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><numFmts count="2"><numFmt numFmtId="170" formatCode="m/d/yyyy"/><numFmt numFmtId="171" formatCode="0.0000"/></numFmts><fonts count="2"><font/><font><b/></font></fonts><cellXfs count="3"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="170" fontId="1" fillId="0" borderId="0" xfId="0"/><xf numFmtId="170" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/></cellXfs></styleSheet>"#;
        let mut cache = cache(template);
        // The bold xf is skipped; the plain one is reused.
        assert_eq!(cache.style_index(CellKind::Date, None), 2);
        assert_eq!(cache.register_format(CellKind::Decimal, Some("0.0000"), false), 7);
        let styles = reparse(&cache);
        assert_eq!(styles.num_fmts()[0], NumFmt { id: 170, code: "m/d/yyyy".to_string() });
        // Fresh ids continue after the template's highest id.
        assert_eq!(styles.num_fmt_code(172), Some("0"));
        assert_eq!(styles.cell_xfs().len(), 8);
    }

    #[test]
    fn missing_blocks_are_inserted_in_schema_order() {
        let xml = r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font/></fonts><cellStyles count="0"/></styleSheet>"#;
        let cache = cache(xml);
        let out = String::from_utf8(cache.to_xml().unwrap()).unwrap();
        let cell_xfs_at = out.find("<cellXfs").unwrap();
        assert!(out.find("<fonts").unwrap() < cell_xfs_at);
        assert!(cell_xfs_at < out.find("<cellStyles").unwrap());
        let styles = StylesPart::parse(out.as_bytes()).unwrap();
        assert_eq!(styles.cell_xfs().len(), 6);
        assert_eq!(styles.cell_xfs()[0], CellXf::default());
    }
}
