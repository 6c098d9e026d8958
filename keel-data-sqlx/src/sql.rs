//! Translation of document queries to SQLite SQL.
//!
//! Every field access becomes `json_extract(body, ?)` with the JSON path
//! bound as a parameter, so field names never end up in the statement text.
//! They are still validated first.
//!
//! ```ignore
//! let (sql, params) = build_select("users", &query)?;
//! // SELECT id, version, body FROM keel_documents WHERE kind = ?
//! //   AND COALESCE((json_extract(body, ?) = ?), 0) ORDER BY seq LIMIT -1 OFFSET 0
//! ```

use keel_data::query::{CompareOp, Condition, Direction, DocumentQuery, Expr, SortKey};
use keel_data::DataError;
use serde_json::Value;

pub(crate) const TABLE: &str = "keel_documents";
pub(crate) const REFERENCES_TABLE: &str = "keel_references";

/// A bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Map a JSON value onto what `json_extract` returns for it.
    pub(crate) fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            composite => SqlValue::Text(composite.to_string()),
        }
    }
}

/// Bind a slice of [`SqlValue`]s onto any sqlx query type.
macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                $crate::sql::SqlValue::Null => query.bind(None::<String>),
                $crate::sql::SqlValue::Integer(v) => query.bind(*v),
                $crate::sql::SqlValue::Real(v) => query.bind(*v),
                $crate::sql::SqlValue::Text(v) => query.bind(v.clone()),
            };
        }
        query
    }};
}
pub(crate) use bind_params;

pub(crate) fn json_path(field: &str) -> String {
    format!("$.{field}")
}

struct Builder {
    sql: String,
    params: Vec<SqlValue>,
}

impl Builder {
    fn new(head: &str, kind: &str) -> Self {
        Self {
            sql: format!("{head} FROM {TABLE} WHERE kind = ?"),
            params: vec![SqlValue::Text(kind.to_string())],
        }
    }

    fn field(&mut self, field: &str) {
        self.sql.push_str("json_extract(body, ?)");
        self.params.push(SqlValue::Text(json_path(field)));
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Condition(cond) => self.condition(cond),
            Expr::And(left, right) => self.binary(left, "AND", right),
            Expr::Or(left, right) => self.binary(left, "OR", right),
            Expr::Not(inner) => {
                self.sql.push_str("NOT (");
                self.expr(inner);
                self.sql.push(')');
            }
        }
    }

    fn binary(&mut self, left: &Expr, op: &str, right: &Expr) {
        self.sql.push('(');
        self.expr(left);
        self.sql.push_str(&format!(" {op} "));
        self.expr(right);
        self.sql.push(')');
    }

    // Comparisons against NULL are false, never unknown, so that NOT stays
    // two-valued like the in-memory evaluator.
    fn condition(&mut self, cond: &Condition) {
        match cond {
            Condition::Compare { field, op, value } => {
                self.sql.push_str("COALESCE((");
                self.field(field);
                self.sql.push_str(&format!(" {} ?), 0)", op_sql(*op)));
                self.params.push(SqlValue::from_json(value));
            }
            Condition::In { field, values } => {
                if values.is_empty() {
                    self.sql.push('0');
                    return;
                }
                self.sql.push_str("COALESCE((");
                self.field(field);
                let placeholders = vec!["?"; values.len()].join(", ");
                self.sql.push_str(&format!(" IN ({placeholders})), 0)"));
                self.params.extend(values.iter().map(SqlValue::from_json));
            }
            Condition::IsNull(field) => {
                self.field(field);
                self.sql.push_str(" IS NULL");
            }
            Condition::IsNotNull(field) => {
                self.field(field);
                self.sql.push_str(" IS NOT NULL");
            }
        }
    }

    fn filter(&mut self, filter: Option<&Expr>) {
        if let Some(expr) = filter {
            self.sql.push_str(" AND ");
            self.expr(expr);
        }
    }

    fn order(&mut self, keys: &[SortKey]) {
        self.sql.push_str(" ORDER BY ");
        for key in keys {
            self.field(&key.field);
            match key.direction {
                Direction::Ascending => self.sql.push_str(" ASC, "),
                Direction::Descending => self.sql.push_str(" DESC, "),
            }
        }
        // insertion order breaks ties
        self.sql.push_str("seq");
    }
}

fn op_sql(op: CompareOp) -> &'static str {
    match op {
        CompareOp::NotEq => "<>",
        other => other.as_sql(),
    }
}

/// Build the `SELECT id, version, body` statement for `query`.
pub(crate) fn build_select(
    kind: &str,
    query: &DocumentQuery,
) -> Result<(String, Vec<SqlValue>), DataError> {
    query.validate_identifiers()?;
    let mut builder = Builder::new("SELECT id, version, body", kind);
    builder.filter(query.filter.as_ref());
    builder.order(&query.order);
    // SQLite integers are signed 64-bit
    match query.limit {
        Some(limit) => builder
            .sql
            .push_str(&format!(" LIMIT {}", limit.min(i64::MAX as u64))),
        None => builder.sql.push_str(" LIMIT -1"),
    }
    if let Some(offset) = query.offset {
        builder
            .sql
            .push_str(&format!(" OFFSET {}", offset.min(i64::MAX as u64)));
    }
    Ok((builder.sql, builder.params))
}

/// Build the `SELECT COUNT(*)` statement for `filter`.
pub(crate) fn build_count(
    kind: &str,
    filter: Option<&Expr>,
) -> Result<(String, Vec<SqlValue>), DataError> {
    DocumentQuery::new()
        .filter(filter.cloned())
        .validate_identifiers()?;
    let mut builder = Builder::new("SELECT COUNT(*)", kind);
    builder.filter(filter);
    Ok((builder.sql, builder.params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_data::query::SortKey;
    use serde_json::json;

    fn eq(field: &str, value: Value) -> Expr {
        Expr::Condition(Condition::Compare {
            field: field.to_string(),
            op: CompareOp::Eq,
            value,
        })
    }

    #[test]
    fn test_select_binds_paths_and_values() {
        let query = DocumentQuery::new()
            .filter(Some(eq("name", json!("bob")).and(eq("active", json!(true)))))
            .order(vec![SortKey::descending("age")])
            .offset(4)
            .limit(2);
        let (sql, params) = build_select("users", &query).unwrap();
        assert_eq!(
            sql,
            "SELECT id, version, body FROM keel_documents WHERE kind = ? AND \
             (COALESCE((json_extract(body, ?) = ?), 0) AND COALESCE((json_extract(body, ?) = ?), 0)) \
             ORDER BY json_extract(body, ?) DESC, seq LIMIT 2 OFFSET 4"
        );
        assert_eq!(
            params,
            vec![
                SqlValue::Text("users".into()),
                SqlValue::Text("$.name".into()),
                SqlValue::Text("bob".into()),
                SqlValue::Text("$.active".into()),
                SqlValue::Integer(1),
                SqlValue::Text("$.age".into()),
            ]
        );
    }

    #[test]
    fn test_huge_offset_is_clamped_to_sqlite_integers() {
        let query = DocumentQuery::new().offset(u64::MAX).limit(u64::MAX);
        let (sql, _) = build_select("users", &query).unwrap();
        assert!(sql.ends_with(&format!("LIMIT {0} OFFSET {0}", i64::MAX)));
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let expr = Expr::Condition(Condition::In {
            field: "id".into(),
            values: vec![],
        });
        let (sql, params) = build_count("users", Some(&expr)).unwrap();
        assert_eq!(sql, "SELECT COUNT(*) FROM keel_documents WHERE kind = ? AND 0");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_invalid_identifier_is_rejected() {
        let query = DocumentQuery::new().filter(Some(eq("name') --", json!(1))));
        assert!(matches!(
            build_select("users", &query),
            Err(DataError::InvalidArgument(_))
        ));
    }
}
