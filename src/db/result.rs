//! Query results

use std::rc::Rc;

/// Rows returned by a query, text format. Nulls are `None`.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    columns: Vec<String>,
    rows: Vec<Vec<Option<Rc<str>>>>,
}

impl Rows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<Rc<str>>>>) -> Self {
        Self { columns, rows }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn name_at(&self, col: usize) -> Option<&str> {
        self.columns.get(col).map(String::as_str)
    }

    pub fn value_at(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// Column lookup by name, single pass over the description.
    pub fn get(&self, row: usize, name: &str) -> Option<&str> {
        let col = self.columns.iter().position(|c| c == name)?;
        self.value_at(row, col)
    }

    /// Shared handle to a value, for fan-out into events without copying.
    pub fn shared_value(&self, row: usize, col: usize) -> Option<Rc<str>> {
        self.rows.get(row)?.get(col)?.clone()
    }
}

/// Terminal outcome of one database command.
#[derive(Debug, Clone)]
pub enum DbResult {
    /// Backend or pipeline error; the message is the backend's.
    Error(String),
    /// Command completed without a result set.
    Empty,
    /// Exactly one row.
    SingleRow(Rows),
    /// Zero or several rows.
    ManyRows(Rows),
}

impl DbResult {
    pub fn from_rows(rows: Rows) -> Self {
        if rows.num_rows() == 1 {
            Self::SingleRow(rows)
        } else {
            Self::ManyRows(rows)
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn rows(&self) -> Option<&Rows> {
        match self {
            Self::SingleRow(rows) | Self::ManyRows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{DbResult, Rows};
    use std::rc::Rc;

    fn sample() -> Rows {
        Rows::new(
            vec!["id".into(), "name".into()],
            vec![
                vec![Some(Rc::from("1")), Some(Rc::from("ada"))],
                vec![Some(Rc::from("2")), None],
            ],
        )
    }

    #[test]
    fn row_and_column_access_by_index_and_name() {
        let rows = sample();
        assert_eq!(2, rows.num_rows());
        assert_eq!(Some("ada"), rows.get(0, "name"));
        assert_eq!(Some("2"), rows.value_at(1, 0));
        assert_eq!(None, rows.get(1, "name"));
        assert_eq!(None, rows.get(0, "missing"));
    }

    #[test]
    fn single_row_results_are_distinguished() {
        let one = Rows::new(vec!["x".into()], vec![vec![Some(Rc::from("v"))]]);
        assert!(matches!(DbResult::from_rows(one), DbResult::SingleRow(_)));
        assert!(matches!(DbResult::from_rows(sample()), DbResult::ManyRows(_)));
    }
}
