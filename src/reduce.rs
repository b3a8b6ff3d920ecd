//! Flatten a `RunResult` into a rectangular table.
//!
//! Rows follow the result's iteration order, one per id, failures included.
//! Columns are the union of feature names over every non-failure unit.
//! Any cell a unit did not produce holds `Cell::Missing`, never zero.

use indexmap::IndexSet;
use serde::{Serialize, Serializer};
use std::fmt;

use crate::config::ColumnOrder;
use crate::constants::table::{
    ID_COLUMN, MISSING_MARKER, STATUS_COLUMN, STATUS_FAILED, STATUS_OK,
};
use crate::data::{FeatureValue, RunResult};
use crate::types::{FeatureName, MeterId};

/// One table cell.
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Value(FeatureValue),
    /// The unit produced no value for this column, or the unit failed.
    Missing,
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn value(&self) -> Option<&FeatureValue> {
        match self {
            Self::Value(value) => Some(value),
            Self::Missing => None,
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(value) => value.serialize(serializer),
            Self::Missing => serializer.serialize_none(),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.write_str(&escape(&value.to_string())),
            Self::Missing => f.write_str(MISSING_MARKER),
        }
    }
}

/// One row: an id, whether its unit failed, and one cell per column.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableRow {
    pub id: MeterId,
    pub failed: bool,
    pub cells: Vec<Cell>,
}

/// Rows are unit ids, columns are feature names.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResultTable {
    columns: Vec<FeatureName>,
    rows: Vec<TableRow>,
}

impl ResultTable {
    pub fn columns(&self) -> &[FeatureName] {
        &self.columns
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|name| name == column)
    }

    pub fn row(&self, id: &str) -> Option<&TableRow> {
        self.rows.iter().find(|row| row.id == id)
    }

    /// Cell for `(id, column)`; `None` when either is not in the table.
    pub fn cell(&self, id: &str, column: &str) -> Option<&Cell> {
        let index = self.column_index(column)?;
        self.row(id).and_then(|row| row.cells.get(index))
    }
}

/// Tab-separated text: `id`, the feature columns, then `status`.
impl fmt::Display for ResultTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(ID_COLUMN)?;
        for column in &self.columns {
            write!(f, "\t{}", escape(column))?;
        }
        writeln!(f, "\t{STATUS_COLUMN}")?;
        for row in &self.rows {
            f.write_str(&escape(&row.id))?;
            for cell in &row.cells {
                write!(f, "\t{cell}")?;
            }
            let status = if row.failed { STATUS_FAILED } else { STATUS_OK };
            writeln!(f, "\t{status}")?;
        }
        Ok(())
    }
}

/// A present value that reads like the missing marker gets a leading
/// backslash so the two stay distinguishable.
fn escape(raw: &str) -> String {
    if raw == MISSING_MARKER {
        return format!("\\{raw}");
    }
    raw.replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\n', "\\n")
}

/// Reduce with first-seen column order.
pub fn to_table(result: &RunResult) -> ResultTable {
    to_table_with(result, ColumnOrder::FirstSeen)
}

/// Reduce with an explicit column order.
///
/// `FirstSeen` orders columns by the first unit (in iteration order) that
/// emitted each name; `Lexical` sorts them by byte order. Both are stable for
/// identical input.
pub fn to_table_with(result: &RunResult, order: ColumnOrder) -> ResultTable {
    let mut seen: IndexSet<&str> = IndexSet::new();
    for (_, unit) in result.iter() {
        if let Some(features) = unit.features() {
            seen.extend(features.keys().map(String::as_str));
        }
    }
    let mut columns: Vec<FeatureName> = seen.into_iter().map(str::to_string).collect();
    if order == ColumnOrder::Lexical {
        columns.sort();
    }

    let rows = result
        .iter()
        .map(|(id, unit)| {
            let cells = match unit.features() {
                Some(features) => columns
                    .iter()
                    .map(|column| {
                        features
                            .get(column)
                            .cloned()
                            .map_or(Cell::Missing, Cell::Value)
                    })
                    .collect(),
                None => vec![Cell::Missing; columns.len()],
            };
            TableRow {
                id: id.clone(),
                failed: unit.is_failure(),
                cells,
            }
        })
        .collect();

    ResultTable { columns, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FailureKind, FeatureMap, UnitFailure, UnitResult};

    fn features(pairs: &[(&str, FeatureValue)]) -> UnitResult {
        UnitResult::Features(
            pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect::<FeatureMap>(),
        )
    }

    fn failed() -> UnitResult {
        UnitResult::Failure(UnitFailure {
            kind: FailureKind::DataFetch,
            feature: None,
            message: "unknown id".to_string(),
        })
    }

    fn sample() -> RunResult {
        let mut result = RunResult::new();
        result.insert(
            "001",
            features(&[
                ("zeta", FeatureValue::Number(1.5)),
                ("alpha", FeatureValue::Integer(2)),
            ]),
        );
        result.insert("X", failed());
        result.insert(
            "002",
            features(&[
                ("beta", FeatureValue::from("low")),
                ("zeta", FeatureValue::Number(0.0)),
            ]),
        );
        result
    }

    #[test]
    fn columns_are_union_in_first_seen_order() {
        let table = to_table(&sample());
        assert_eq!(table.columns().to_vec(), vec!["zeta", "alpha", "beta"]);
    }

    #[test]
    fn lexical_order_sorts_columns() {
        let table = to_table_with(&sample(), ColumnOrder::Lexical);
        assert_eq!(table.columns().to_vec(), vec!["alpha", "beta", "zeta"]);
    }

    #[test]
    fn failure_row_is_all_missing() {
        let table = to_table(&sample());
        let row = table.row("X").unwrap();
        assert!(row.failed);
        assert_eq!(row.cells.len(), 3);
        assert!(row.cells.iter().all(Cell::is_missing));
    }

    #[test]
    fn absent_feature_is_missing_not_zero() {
        let table = to_table(&sample());
        assert!(table.cell("002", "alpha").unwrap().is_missing());
        assert_eq!(
            table.cell("002", "zeta").unwrap().value(),
            Some(&FeatureValue::Number(0.0))
        );
        assert!(table.cell("002", "nope").is_none());
    }

    #[test]
    fn failure_keys_never_become_columns() {
        let mut result = RunResult::new();
        result.insert("001", failed());
        let table = to_table(&result);
        assert!(table.columns().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn display_renders_tab_separated_text() {
        let text = to_table(&sample()).to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "id\tzeta\talpha\tbeta\tstatus");
        assert_eq!(lines[1], "001\t1.5\t2\tNA\tok");
        assert_eq!(lines[2], "X\tNA\tNA\tNA\tfailed");
        assert_eq!(lines[3], "002\t0\tNA\tlow\tok");
    }

    #[test]
    fn display_escapes_separators_in_text() {
        let mut result = RunResult::new();
        result.insert("001", features(&[("note", FeatureValue::from("a\tb\nc"))]));
        let text = to_table(&result).to_string();
        assert!(text.contains("a\\tb\\nc"));
    }

    #[test]
    fn text_matching_missing_marker_is_escaped() {
        let mut result = RunResult::new();
        result.insert("001", features(&[("grade", FeatureValue::from("NA"))]));
        result.insert("002", features(&[("other", FeatureValue::Integer(1))]));
        let text = to_table(&result).to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "001\t\\NA\tNA\tok");
        assert_eq!(lines[2], "002\tNA\t1\tok");
    }

    #[test]
    fn serializes_missing_as_null() {
        let json = serde_json::to_value(to_table(&sample())).unwrap();
        assert_eq!(json["columns"][2], "beta");
        assert_eq!(json["rows"][1]["id"], "X");
        assert!(json["rows"][1]["cells"][0].is_null());
        assert_eq!(json["rows"][0]["cells"][0], 1.5);
    }

    #[test]
    fn empty_result_gives_empty_table() {
        let table = to_table(&RunResult::new());
        assert!(table.is_empty());
        assert_eq!(table.to_string(), "id\tstatus\n");
    }
}
