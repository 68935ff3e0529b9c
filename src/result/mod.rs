/// Rows returned by one statement, in text form.
///
/// Values are `None` for SQL NULL. `affected` carries the command-complete
/// count for DML and utility statements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub affected: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        let affected = rows.len() as u64;
        Self {
            columns,
            rows,
            affected,
        }
    }

    pub fn command(affected: u64) -> Self {
        Self {
            affected,
            ..Self::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First column of the first row.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first().and_then(|r| r.first()).and_then(|v| v.as_deref())
    }

    /// All non-null values of one column, in row order.
    pub fn column_values(&self, index: usize) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|r| r.get(index).cloned().flatten())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_value_and_columns() {
        let result = QueryResult::new(
            vec!["a".into(), "b".into()],
            vec![
                vec![Some("1".into()), None],
                vec![Some("2".into()), Some("x".into())],
            ],
        );
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.first_value(), Some("1"));
        assert_eq!(result.column_values(0), vec!["1", "2"]);
        assert_eq!(result.column_values(1), vec!["x"]);
        assert!(QueryResult::command(3).is_empty());
        assert_eq!(QueryResult::command(3).affected, 3);
    }
}
