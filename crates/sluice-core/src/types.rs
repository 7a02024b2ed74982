//! Column and cell data model shared between sources and the destination.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Date format used when encoding and parsing date cells.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// The datatypes understood by the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Date,
    Float,
    Long,
    String,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Bool => "bool",
            ColumnType::Date => "date",
            ColumnType::Float => "float",
            ColumnType::Long => "long",
            ColumnType::String => "string",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A column of a migrated table.
///
/// `size` is only meaningful for `string` columns, where it carries the
/// maximum character length reported by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType, size: Option<usize>) -> Self {
        Self {
            name: name.into(),
            ty,
            size,
        }
    }
}

/// Build the destination-facing datatype for a column, e.g. `string(32)`.
pub fn build_datatype(column: &Column) -> String {
    match (column.ty, column.size) {
        (ColumnType::String, Some(size)) => format!("string({})", size),
        (ty, _) => ty.as_str().to_string(),
    }
}

/// A single value within a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Long(i64),
    Float(f64),
    Date(NaiveDate),
    Text(String),
}

/// A row of values as retrieved from a source.
pub type Row = Vec<Cell>;

/// Parse a textual value into a cell of the given type.
///
/// Empty input parses as `Null` for every type, matching the empty-field
/// convention of the delimited encoding.
pub fn parse_cell(ty: ColumnType, value: &str) -> Result<Cell, Error> {
    if value.is_empty() {
        return Ok(Cell::Null);
    }

    let parse_err = || Error::Parse {
        ty,
        value: value.to_string(),
    };

    match ty {
        ColumnType::Bool => match value.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(Cell::Bool(true)),
            "false" | "f" | "0" => Ok(Cell::Bool(false)),
            _ => Err(parse_err()),
        },
        ColumnType::Date => NaiveDate::parse_from_str(value, DATE_FORMAT)
            .map(Cell::Date)
            .map_err(|_| parse_err()),
        ColumnType::Float => value.parse().map(Cell::Float).map_err(|_| parse_err()),
        ColumnType::Long => value.parse().map(Cell::Long).map_err(|_| parse_err()),
        ColumnType::String => Ok(Cell::Text(value.to_string())),
    }
}

/// The delimiters used when encoding rows into their text form.
///
/// A format is fixed for the lifetime of a message; stages read it from the
/// message rather than from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFormat {
    pub field_terminator: String,
    pub line_terminator: String,
    pub field_wrapper: String,
}

impl RowFormat {
    pub const DEFAULT_FIELD_TERMINATOR: &'static str = "|";
    pub const DEFAULT_LINE_TERMINATOR: &'static str = "\n";
    pub const DEFAULT_FIELD_WRAPPER: &'static str = "\"";

    pub fn new(
        field_terminator: impl Into<String>,
        line_terminator: impl Into<String>,
        field_wrapper: impl Into<String>,
    ) -> Self {
        Self {
            field_terminator: field_terminator.into(),
            line_terminator: line_terminator.into(),
            field_wrapper: field_wrapper.into(),
        }
    }
}

impl Default for RowFormat {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_FIELD_TERMINATOR,
            Self::DEFAULT_LINE_TERMINATOR,
            Self::DEFAULT_FIELD_WRAPPER,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_datatype_sized_string() {
        let column = Column::new("name", ColumnType::String, Some(32));
        assert_eq!(build_datatype(&column), "string(32)");
    }

    #[test]
    fn build_datatype_unsized_string() {
        let column = Column::new("name", ColumnType::String, None);
        assert_eq!(build_datatype(&column), "string");
    }

    #[test]
    fn build_datatype_scalar_types() {
        assert_eq!(
            build_datatype(&Column::new("a", ColumnType::Long, None)),
            "long"
        );
        assert_eq!(
            build_datatype(&Column::new("b", ColumnType::Float, None)),
            "float"
        );
        assert_eq!(
            build_datatype(&Column::new("c", ColumnType::Date, None)),
            "date"
        );
        assert_eq!(
            build_datatype(&Column::new("d", ColumnType::Bool, None)),
            "bool"
        );
    }

    #[test]
    fn parse_cell_round_trips_long() {
        let cell = parse_cell(ColumnType::Long, "42").unwrap();
        assert_eq!(cell, Cell::Long(42));
    }

    #[test]
    fn parse_cell_round_trips_float() {
        let cell = parse_cell(ColumnType::Float, "1.5").unwrap();
        assert_eq!(cell, Cell::Float(1.5));
    }

    #[test]
    fn parse_cell_round_trips_date() {
        let cell = parse_cell(ColumnType::Date, "2017-03-01").unwrap();
        assert_eq!(
            cell,
            Cell::Date(NaiveDate::from_ymd_opt(2017, 3, 1).unwrap())
        );
    }

    #[test]
    fn parse_cell_bool_variants() {
        assert_eq!(parse_cell(ColumnType::Bool, "true").unwrap(), Cell::Bool(true));
        assert_eq!(parse_cell(ColumnType::Bool, "F").unwrap(), Cell::Bool(false));
        assert_eq!(parse_cell(ColumnType::Bool, "1").unwrap(), Cell::Bool(true));
    }

    #[test]
    fn parse_cell_empty_is_null() {
        assert_eq!(parse_cell(ColumnType::Long, "").unwrap(), Cell::Null);
        assert_eq!(parse_cell(ColumnType::String, "").unwrap(), Cell::Null);
    }

    #[test]
    fn parse_cell_rejects_garbage() {
        assert!(parse_cell(ColumnType::Long, "abc").is_err());
        assert!(parse_cell(ColumnType::Date, "01/02/2017").is_err());
        assert!(parse_cell(ColumnType::Bool, "maybe").is_err());
    }

    #[test]
    fn row_format_defaults() {
        let format = RowFormat::default();
        assert_eq!(format.field_terminator, "|");
        assert_eq!(format.line_terminator, "\n");
        assert_eq!(format.field_wrapper, "\"");
    }
}
