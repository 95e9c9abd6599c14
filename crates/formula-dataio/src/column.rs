//! Column letters, cell references and header maps.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

fn column_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z]{1,3}$").expect("valid regex"))
}

fn invalid_header_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_]+").expect("valid regex"))
}

/// Returns `true` for 1-3 ASCII letters (`A`, `az`, `XFD`).
pub fn is_valid_column_name(name: &str) -> bool {
    column_name_pattern().is_match(name)
}

/// Decode column letters into a 1-based column number (`A` = 1, `AA` = 27).
///
/// Non-letter characters are ignored so full references (`"C7"`) decode to their column.
/// Returns `None` when no letters are present or the value overflows.
pub fn column_number(name: &str) -> Option<u32> {
    let mut sum: u32 = 0;
    let mut seen = false;
    for b in name.bytes().filter(u8::is_ascii_alphabetic) {
        seen = true;
        let digit = u32::from(b.to_ascii_uppercase() - b'A' + 1);
        sum = sum.checked_mul(26)?.checked_add(digit)?;
    }
    seen.then_some(sum)
}

/// Encode a 1-based column number as letters (`1` = `A`, `28` = `AB`). `0` encodes as "".
pub fn column_letter(mut number: u32) -> String {
    let mut out = Vec::new();
    while number > 0 {
        let modulo = (number - 1) % 26;
        out.push(b'A' + modulo as u8);
        number = (number - modulo - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Split an A1 reference into `(column, row)`; absolute markers (`$`) are accepted.
pub fn split_cell_reference(reference: &str) -> Option<(u32, u32)> {
    let trimmed = reference.trim();
    let digits_at = trimmed.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = trimmed.split_at(digits_at);
    let col = column_number(letters)?;
    let row = digits.parse::<u32>().ok()?;
    (row > 0).then_some((col, row))
}

/// Build an A1 reference from 1-based coordinates.
pub fn cell_reference(col: u32, row: u32) -> String {
    format!("{}{row}", column_letter(col))
}

/// Remove characters that cannot appear in an identifier (`"L1. Name"` -> `"L1Name"`).
pub fn fixup_header(header: &str) -> String {
    invalid_header_chars().replace_all(header, "").into_owned()
}

/// A header cell as seen by the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    /// Claimed by a column-letter mapping; only that mapping may produce values here.
    pub bound: bool,
}

/// Column -> header text, ordered by column number.
///
/// Keys are column numbers so lookups by letter are case-insensitive and iteration always
/// follows sheet order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: BTreeMap<u32, Header>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequential headers starting at column `A`.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = Self::new();
        for (idx, name) in names.into_iter().enumerate() {
            map.insert(idx as u32 + 1, name.into());
        }
        map
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, col: u32, name: impl Into<String>) {
        self.entries.insert(
            col,
            Header {
                name: name.into(),
                bound: false,
            },
        );
    }

    /// Claim `col` for a column-letter mapping, adding it when absent.
    pub fn bind(&mut self, col: u32, name: impl Into<String>) {
        let name = name.into();
        self.entries
            .entry(col)
            .and_modify(|h| h.bound = true)
            .or_insert(Header { name, bound: true });
    }

    pub fn get(&self, col: u32) -> Option<&Header> {
        self.entries.get(&col)
    }

    /// Header text by column letter (case-insensitive).
    pub fn name(&self, column: &str) -> Option<&str> {
        let col = column_number(column)?;
        self.entries.get(&col).map(|h| h.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Header)> {
        self.entries.iter().map(|(col, header)| (*col, header))
    }

    /// `(column letter, header text)` pairs in column order.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.iter()
            .map(|(col, h)| (column_letter(col), h.name.clone()))
            .collect()
    }

    /// Apply [`fixup_header`] to every entry; blank or emptied headers take the column letter.
    pub fn fixup(&mut self) {
        for (col, header) in self.entries.iter_mut() {
            let cleaned = if header.name.trim().is_empty() {
                String::new()
            } else {
                fixup_header(&header.name)
            };
            header.name = if cleaned.is_empty() {
                column_letter(*col)
            } else {
                cleaned
            };
        }
    }
}
