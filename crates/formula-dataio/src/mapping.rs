//! Column-mapping descriptors: how one output column is produced from a source row.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::column::{fixup_header, is_valid_column_name};
use crate::error::DataIoError;
use crate::value::{CellValue, RowSource};

/// Semantic cell type, used to pick a number format and the stored data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CellKind {
    #[default]
    General,
    Date,
    Number,
    Decimal,
    Percent,
    Currency,
    /// Text that looks numeric but must stay text (padded identifiers and the like).
    Quoted,
}

impl CellKind {
    /// Kinds whose values are stored as numbers.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            CellKind::Date
                | CellKind::Number
                | CellKind::Decimal
                | CellKind::Percent
                | CellKind::Currency
        )
    }
}

type ValueFn = dyn Fn(&dyn RowSource) -> Option<CellValue> + Send + Sync;

/// Describes how one output column is produced.
///
/// A mapping is bound either to an explicit column letter or to a header name. When a column
/// letter is set it is the only matching criterion.
pub struct ColumnMapping {
    column_name: Option<String>,
    header_name: Option<String>,
    clean_header_name: Option<String>,
    value: Box<ValueFn>,
    cell_kind: CellKind,
    format_code: Option<String>,
    update_header: bool,
}

impl ColumnMapping {
    /// A mapping bound to `column` (1-3 letters). The header text is used when the writer has
    /// to create the header cell.
    pub fn new<F>(column: &str, header: &str, value: F) -> Result<Self, DataIoError>
    where
        F: Fn(&dyn RowSource) -> Option<CellValue> + Send + Sync + 'static,
    {
        let column = column.trim();
        if !column.is_empty() && !is_valid_column_name(column) {
            return Err(DataIoError::InvalidColumnName(column.to_string()));
        }
        let mut mapping = Self::for_header(header, value);
        mapping.column_name = (!column.is_empty()).then(|| column.to_ascii_uppercase());
        Ok(mapping)
    }

    /// A mapping matched against existing header text.
    pub fn for_header<F>(header: &str, value: F) -> Self
    where
        F: Fn(&dyn RowSource) -> Option<CellValue> + Send + Sync + 'static,
    {
        let header = header.trim();
        let (header_name, clean_header_name) = if header.is_empty() {
            (None, None)
        } else {
            (Some(header.to_string()), Some(fixup_header(header)))
        };
        Self {
            column_name: None,
            header_name,
            clean_header_name,
            value: Box::new(value),
            cell_kind: CellKind::General,
            format_code: None,
            update_header: false,
        }
    }

    /// A column-bound mapping that copies the source field `field`.
    pub fn field(column: &str, header: &str, field: &str) -> Result<Self, DataIoError> {
        let field = field.to_string();
        Self::new(column, header, move |row| row.get(&field))
    }

    pub fn with_kind(mut self, kind: CellKind) -> Self {
        self.cell_kind = kind;
        self
    }

    pub fn with_format_code(mut self, code: impl Into<String>) -> Self {
        let code = code.into();
        self.format_code = (!code.trim().is_empty()).then_some(code);
        self
    }

    pub fn with_update_header(mut self, update: bool) -> Self {
        self.update_header = update;
        self
    }

    pub fn column_name(&self) -> Option<&str> {
        self.column_name.as_deref()
    }

    pub fn header_name(&self) -> Option<&str> {
        self.header_name.as_deref()
    }

    pub fn clean_header_name(&self) -> Option<&str> {
        self.clean_header_name.as_deref()
    }

    pub fn cell_kind(&self) -> CellKind {
        self.cell_kind
    }

    pub fn format_code(&self) -> Option<&str> {
        self.format_code.as_deref()
    }

    pub fn update_header(&self) -> bool {
        self.update_header
    }

    pub fn is_valid_column_name(&self) -> bool {
        self.column_name.as_deref().is_some_and(is_valid_column_name)
    }

    /// Does this mapping produce the column at `column` titled `header`?
    pub fn is_match(&self, column: &str, header: &str) -> bool {
        if let Some(own) = self.column_name.as_deref() {
            return own.eq_ignore_ascii_case(column.trim());
        }
        let header = header.trim();
        if header.is_empty() {
            return false;
        }
        self.header_name
            .as_deref()
            .is_some_and(|h| h.eq_ignore_ascii_case(header))
            || self
                .clean_header_name
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case(header))
    }

    pub fn value_for(&self, row: &dyn RowSource) -> Option<CellValue> {
        (self.value)(row)
    }
}

impl fmt::Debug for ColumnMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnMapping")
            .field("column_name", &self.column_name)
            .field("header_name", &self.header_name)
            .field("cell_kind", &self.cell_kind)
            .field("format_code", &self.format_code)
            .field("update_header", &self.update_header)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::value::Record;

    #[test]
    fn rejects_invalid_column_letters() {
        let err = ColumnMapping::field("A1", "Id", "id").unwrap_err();
        assert!(matches!(err, DataIoError::InvalidColumnName(ref c) if c == "A1"));
        assert!(ColumnMapping::field("ABCD", "Id", "id").is_err());

        let blank = ColumnMapping::field("", "Id", "id").unwrap();
        assert_eq!(blank.column_name(), None);
        assert!(!blank.is_valid_column_name());

        let lower = ColumnMapping::field("ab", "Id", "id").unwrap();
        assert_eq!(lower.column_name(), Some("AB"));
        assert!(lower.is_valid_column_name());
    }

    #[test]
    fn column_letter_is_the_only_criterion_when_set() {
        let mapping = ColumnMapping::field("C", "Name", "name").unwrap();
        assert!(mapping.is_match("c", "Anything"));
        assert!(!mapping.is_match("B", "Name"));
    }

    #[test]
    fn header_mappings_match_raw_or_clean_text() {
        let mapping = ColumnMapping::for_header("Hire Date", |row| row.get("hired"));
        assert_eq!(mapping.clean_header_name(), Some("HireDate"));
        assert!(mapping.is_match("D", "hire date"));
        assert!(mapping.is_match("D", "HIREDATE"));
        assert!(!mapping.is_match("D", "Hire"));
        assert!(!mapping.is_match("D", ""));
    }

    #[test]
    fn extracts_values_through_the_row_abstraction() {
        let row = Record::new().with("Id", 12).with("Name", "Ada");
        let mapping = ColumnMapping::field("A", "Id", "id")
            .unwrap()
            .with_kind(CellKind::Number)
            .with_format_code("000");
        assert_eq!(mapping.value_for(&row), Some(CellValue::Integer(12)));
        assert_eq!(mapping.cell_kind(), CellKind::Number);
        assert_eq!(mapping.format_code(), Some("000"));

        let computed = ColumnMapping::for_header("Greeting", |row| {
            row.get("name")
                .map(|name| CellValue::Text(format!("Hello {}", name.to_text())))
        });
        assert_eq!(
            computed.value_for(&row),
            Some(CellValue::Text("Hello Ada".to_string()))
        );
    }

    #[test]
    fn blank_format_codes_are_ignored() {
        let mapping = ColumnMapping::for_header("X", |_| None).with_format_code("  ");
        assert_eq!(mapping.format_code(), None);
    }
}
