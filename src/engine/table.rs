use super::command::{CompareOp, Condition, Operand};
use super::transaction::{Snapshot, TransactionManager, Xid};
use crate::core::{CoordError, Result};

pub type Row = Vec<Option<String>>;

#[derive(Debug, Clone)]
pub struct MvccRow {
    pub row: Row,
    pub xmin: Xid,         // Transaction ID that created this row
    pub xmax: Option<Xid>, // Transaction ID that deleted/updated this row
}

/// Heap of row versions for one relation.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    columns: Vec<String>,
    rows: Vec<MvccRow>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, column: &str) -> Result<usize> {
        column_index(&self.columns, column)
    }

    pub fn insert(&mut self, row: Row, snapshot: &Snapshot) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(CoordError::ExecutionError(format!(
                "INSERT has {} expressions but table \"{}\" has {} columns",
                row.len(),
                self.name,
                self.columns.len()
            )));
        }
        self.rows.push(MvccRow {
            row,
            xmin: snapshot.tx_id,
            xmax: None,
        });
        Ok(())
    }

    pub fn scan(&self, snapshot: &Snapshot) -> Vec<Row> {
        self.rows
            .iter()
            .filter(|r| is_visible(r, snapshot))
            .map(|r| r.row.clone())
            .collect()
    }

    /// Replace every visible row matching `filter`. Returns the number of rows
    /// changed. Without `assignments` the rows are deleted.
    pub fn modify(
        &mut self,
        filter: &[Condition],
        assignments: Option<&[(usize, Option<String>)]>,
        snapshot: &Snapshot,
        tm: &TransactionManager,
    ) -> Result<u64> {
        let mut targets = Vec::new();
        for (id, version) in self.rows.iter().enumerate() {
            if is_visible(version, snapshot) && matches_filter(&self.columns, &version.row, filter, 0)? {
                if let Some(xmax) = version.xmax {
                    // Someone else already replaced this version.
                    if xmax != snapshot.tx_id && !tm.is_aborted(xmax) {
                        return Err(CoordError::ExecutionError(
                            "could not serialize access due to concurrent update".into(),
                        ));
                    }
                }
                targets.push(id);
            }
        }

        for id in &targets {
            self.rows[*id].xmax = Some(snapshot.tx_id);
            if let Some(assignments) = assignments {
                let mut row = self.rows[*id].row.clone();
                for (idx, value) in assignments {
                    row[*idx] = value.clone();
                }
                self.rows.push(MvccRow {
                    row,
                    xmin: snapshot.tx_id,
                    xmax: None,
                });
            }
        }
        Ok(targets.len() as u64)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

fn is_visible(row: &MvccRow, snapshot: &Snapshot) -> bool {
    if row.xmin == snapshot.tx_id {
        return row.xmax != Some(snapshot.tx_id);
    }

    if !snapshot.is_committed(row.xmin) {
        return false;
    }

    if let Some(xmax) = row.xmax {
        if xmax == snapshot.tx_id || snapshot.is_committed(xmax) {
            return false;
        }
    }

    true
}

pub fn column_index(columns: &[String], column: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c == column)
        .ok_or_else(|| CoordError::ExecutionError(format!("column \"{}\" does not exist", column)))
}

/// Evaluate a conjunction of simple comparisons against one row.
pub fn matches_filter(columns: &[String], row: &Row, filter: &[Condition], backend_pid: i32) -> Result<bool> {
    for condition in filter {
        let idx = column_index(columns, &condition.column)?;
        let value = row[idx].as_deref();
        let operand = match &condition.operand {
            Operand::Literal(v) => v.clone(),
            Operand::BackendPid => Some(backend_pid.to_string()),
        };
        let (Some(value), Some(operand)) = (value, operand.as_deref()) else {
            // Comparisons with NULL are never true.
            return Ok(false);
        };
        let ok = match condition.op {
            CompareOp::Eq => values_equal(value, operand),
            CompareOp::NotEq => !values_equal(value, operand),
            CompareOp::Like => super::command::like_to_regex(operand)?.is_match(value),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn values_equal(a: &str, b: &str) -> bool {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

/// Order rows by one column, numerically when both sides parse as numbers.
pub fn compare_values(a: &Option<String>, b: &Option<String>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.cmp(b),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::command::parse;
    use crate::engine::command::Command;

    fn filter(sql: &str) -> Vec<Condition> {
        match parse(sql).unwrap() {
            Command::Delete { filter, .. } => filter,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_insert_visible_to_later_snapshots_only() {
        let mut tm = TransactionManager::new();
        let mut table = Table::new("public.t", vec!["a".into()]);

        let writer = tm.begin();
        let early_reader = tm.begin();
        let early = tm.snapshot(early_reader);
        table.insert(vec![Some("1".into())], &tm.snapshot(writer)).unwrap();
        assert_eq!(table.scan(&tm.snapshot(writer)).len(), 1);
        tm.commit(writer);

        assert!(table.scan(&early).is_empty());
        let late = tm.begin();
        assert_eq!(table.scan(&tm.snapshot(late)).len(), 1);
    }

    #[test]
    fn test_update_creates_new_version() {
        let mut tm = TransactionManager::new();
        let mut table = Table::new("public.t", vec!["a".into()]);
        let setup = tm.begin();
        table.insert(vec![Some("1".into())], &tm.snapshot(setup)).unwrap();
        tm.commit(setup);

        let reader = tm.begin();
        let old_view = tm.snapshot(reader);

        let writer = tm.begin();
        let snap = tm.snapshot(writer);
        let changed = table
            .modify(&filter("DELETE FROM t WHERE a = 1"), Some(&[(0, Some("99".into()))]), &snap, &tm)
            .unwrap();
        assert_eq!(changed, 1);
        tm.commit(writer);

        assert_eq!(table.scan(&old_view), vec![vec![Some("1".to_string())]]);
        let now = tm.begin();
        assert_eq!(table.scan(&tm.snapshot(now)), vec![vec![Some("99".to_string())]]);
        assert_eq!(table.row_count(), 2);
    }

    #[test]
    fn test_concurrent_update_conflict() {
        let mut tm = TransactionManager::new();
        let mut table = Table::new("public.t", vec!["a".into()]);
        let setup = tm.begin();
        table.insert(vec![Some("1".into())], &tm.snapshot(setup)).unwrap();
        tm.commit(setup);

        let first = tm.begin();
        let second = tm.begin();
        let s1 = tm.snapshot(first);
        let s2 = tm.snapshot(second);
        table.modify(&[], None, &s1, &tm).unwrap();
        assert!(table.modify(&[], None, &s2, &tm).is_err());
    }

    #[test]
    fn test_filter_null_never_matches() {
        let columns = vec!["a".to_string()];
        let f = filter("DELETE FROM t WHERE a = 1");
        assert!(!matches_filter(&columns, &vec![None], &f, 0).unwrap());
        assert!(matches_filter(&columns, &vec![Some("1.0".into())], &f, 0).unwrap());
        assert!(matches_filter(&columns, &vec![Some("1".into())], &filter("DELETE FROM t WHERE b = 1"), 0).is_err());
    }
}
