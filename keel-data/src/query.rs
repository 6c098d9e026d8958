//! Filter trees, ordering keys and the backend-neutral document query.
//!
//! A filter is a tagged tree (`Condition | And | Or | Not`) rather than a
//! closure, so that every backend can walk it and translate it to its own
//! query language. The same tree evaluates in memory against a JSON
//! document, and its `Display` form is stable enough to key a cache on.
//!
//! ```ignore
//! const NAME: Field<User> = Field::new("name");
//! const AGE: Field<User> = Field::new("age");
//!
//! let filter = NAME.like("a%").and(AGE.gt(30));
//! assert_eq!(filter.to_string(), r#"(name LIKE "a%" AND age > 30)"#);
//! ```

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;

use crate::entity::{to_body, Entity};
use crate::error::DataError;

/// A persisted document body.
pub type Body = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    /// SQL `LIKE`: `%` matches any run, `_` a single character, ASCII
    /// case-insensitive.
    Like,
}

impl CompareOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    IsNull(String),
    IsNotNull(String),
}

impl Condition {
    pub fn field(&self) -> &str {
        match self {
            Condition::Compare { field, .. }
            | Condition::In { field, .. }
            | Condition::IsNull(field)
            | Condition::IsNotNull(field) => field,
        }
    }

    fn evaluate(&self, body: &Body) -> bool {
        match self {
            Condition::Compare { field, op, value } => {
                let actual = lookup(body, field);
                if actual.is_null() || value.is_null() {
                    return false;
                }
                match op {
                    CompareOp::Eq => values_equal(actual, value),
                    CompareOp::NotEq => !values_equal(actual, value),
                    CompareOp::Gt => compare_values(actual, value) == Some(Ordering::Greater),
                    CompareOp::Ge => matches!(
                        compare_values(actual, value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    CompareOp::Lt => compare_values(actual, value) == Some(Ordering::Less),
                    CompareOp::Le => matches!(
                        compare_values(actual, value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    CompareOp::Like => match (actual, value) {
                        (Value::String(s), Value::String(p)) => like(s, p),
                        _ => false,
                    },
                }
            }
            Condition::In { field, values } => {
                let actual = lookup(body, field);
                !actual.is_null() && values.iter().any(|v| values_equal(actual, v))
            }
            Condition::IsNull(field) => lookup(body, field).is_null(),
            Condition::IsNotNull(field) => !lookup(body, field).is_null(),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { field, op, value } => {
                write!(f, "{field} {} {value}", op.as_sql())
            }
            Condition::In { field, values } => {
                let list: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{field} IN ({})", list.join(", "))
            }
            Condition::IsNull(field) => write!(f, "{field} IS NULL"),
            Condition::IsNotNull(field) => write!(f, "{field} IS NOT NULL"),
        }
    }
}

/// Type-erased filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Condition(Condition),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    /// Evaluate the tree against a document body.
    pub fn evaluate(&self, body: &Body) -> bool {
        match self {
            Expr::Condition(cond) => cond.evaluate(body),
            Expr::And(left, right) => left.evaluate(body) & right.evaluate(body),
            Expr::Or(left, right) => left.evaluate(body) | right.evaluate(body),
            Expr::Not(inner) => !inner.evaluate(body),
        }
    }

    /// Every field name referenced by the tree, in depth-first order.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Condition(cond) => out.push(cond.field()),
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
            Expr::Not(inner) => inner.collect_fields(out),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Condition(cond) => write!(f, "{cond}"),
            Expr::And(left, right) => write!(f, "({left} AND {right})"),
            Expr::Or(left, right) => write!(f, "({left} OR {right})"),
            Expr::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

impl From<Condition> for Expr {
    fn from(cond: Condition) -> Self {
        Expr::Condition(cond)
    }
}

/// A filter over entities of type `T`.
pub struct Filter<T> {
    expr: Expr,
    _marker: PhantomData<fn(&T)>,
}

impl<T> Filter<T> {
    pub fn from_expr(expr: Expr) -> Self {
        Self {
            expr,
            _marker: PhantomData,
        }
    }

    pub fn and(self, other: impl Into<Filter<T>>) -> Self {
        Self::from_expr(self.expr.and(other.into().expr))
    }

    pub fn or(self, other: impl Into<Filter<T>>) -> Self {
        Self::from_expr(self.expr.or(other.into().expr))
    }

    pub fn not(self) -> Self {
        Self::from_expr(Expr::Not(Box::new(self.expr)))
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn into_expr(self) -> Expr {
        self.expr
    }
}

impl<T: Entity> Filter<T> {
    /// Evaluate the filter against an entity's persisted representation.
    pub fn matches(&self, entity: &T) -> Result<bool, DataError> {
        Ok(self.expr.evaluate(&to_body(entity)?))
    }
}

impl<T> Clone for Filter<T> {
    fn clone(&self) -> Self {
        Self::from_expr(self.expr.clone())
    }
}

impl<T> fmt::Debug for Filter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.expr).finish()
    }
}

impl<T> fmt::Display for Filter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}

/// Typed handle to a scalar field of `T`. Builds conditions and ordering
/// keys checked against the entity type at compile time.
///
/// Dotted names (`address.city`) reach into nested objects.
pub struct Field<T> {
    name: &'static str,
    _marker: PhantomData<fn(&T)>,
}

impl<T> Field<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn compare(&self, op: CompareOp, value: Value) -> Filter<T> {
        Filter::from_expr(Expr::Condition(Condition::Compare {
            field: self.name.to_string(),
            op,
            value,
        }))
    }

    pub fn eq(&self, value: impl Into<Value>) -> Filter<T> {
        self.compare(CompareOp::Eq, value.into())
    }

    pub fn ne(&self, value: impl Into<Value>) -> Filter<T> {
        self.compare(CompareOp::NotEq, value.into())
    }

    pub fn gt(&self, value: impl Into<Value>) -> Filter<T> {
        self.compare(CompareOp::Gt, value.into())
    }

    pub fn ge(&self, value: impl Into<Value>) -> Filter<T> {
        self.compare(CompareOp::Ge, value.into())
    }

    pub fn lt(&self, value: impl Into<Value>) -> Filter<T> {
        self.compare(CompareOp::Lt, value.into())
    }

    pub fn le(&self, value: impl Into<Value>) -> Filter<T> {
        self.compare(CompareOp::Le, value.into())
    }

    pub fn like(&self, pattern: &str) -> Filter<T> {
        self.compare(CompareOp::Like, Value::String(pattern.to_string()))
    }

    pub fn is_in<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Filter<T> {
        Filter::from_expr(Expr::Condition(Condition::In {
            field: self.name.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }))
    }

    pub fn is_null(&self) -> Filter<T> {
        Filter::from_expr(Expr::Condition(Condition::IsNull(self.name.to_string())))
    }

    pub fn is_not_null(&self) -> Filter<T> {
        Filter::from_expr(Expr::Condition(Condition::IsNotNull(self.name.to_string())))
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Field").field(&self.name).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn ascending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Ascending,
        }
    }

    pub fn descending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Descending,
        }
    }

    /// Compare two bodies on this key.
    pub fn compare(&self, a: &Body, b: &Body) -> Ordering {
        let ord = sort_values(lookup(a, &self.field), lookup(b, &self.field));
        match self.direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Ascending => write!(f, "{} ASC", self.field),
            Direction::Descending => write!(f, "{} DESC", self.field),
        }
    }
}

/// A backend-neutral query over one document kind.
///
/// Without ordering keys, backends return documents in insertion order.
#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    pub filter: Option<Expr>,
    pub order: Vec<SortKey>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl DocumentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Option<Expr>) -> Self {
        self.filter = filter;
        self
    }

    pub fn order(mut self, order: Vec<SortKey>) -> Self {
        self.order = order;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check every referenced field name against a conservative identifier
    /// pattern. Backends that interpolate field names must call this first.
    pub fn validate_identifiers(&self) -> Result<(), DataError> {
        let filter_fields = self.filter.iter().flat_map(|f| f.fields());
        let order_fields = self.order.iter().map(|k| k.field.as_str());
        for field in filter_fields.chain(order_fields) {
            if !is_valid_identifier(field) {
                return Err(DataError::InvalidArgument(format!(
                    "Invalid field identifier: {field}"
                )));
            }
        }
        Ok(())
    }
}

static NULL: Value = Value::Null;

/// Resolve a possibly dotted field name inside a body. Missing → `Null`.
pub fn lookup<'a>(body: &'a Body, field: &str) -> &'a Value {
    let mut parts = field.split('.');
    let first = parts.next().unwrap_or(field);
    let mut current = match body.get(first) {
        Some(v) => v,
        None => return &NULL,
    };
    for part in parts {
        current = match current.get(part) {
            Some(v) => v,
            None => return &NULL,
        };
    }
    current
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) | Value::Object(_) => 4,
    }
}

/// Total order used for sorting: nulls first, then booleans, numbers,
/// strings, and composite values.
pub fn sort_values(a: &Value, b: &Value) -> Ordering {
    match type_rank(a).cmp(&type_rank(b)) {
        Ordering::Equal => {
            compare_values(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string()))
        }
        other => other,
    }
}

/// Case-insensitive SQL `LIKE`. Greedy with a single backtrack point: on a
/// mismatch only the most recent `%` is retried one character further, so
/// matching stays `O(text * pattern)` in the worst case.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().map(|c| c.to_ascii_lowercase()).collect();
    let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();

    let (mut t, mut p) = (0, 0);
    // (pattern index after the last `%`, text index it is currently matched up to)
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                p += 1;
                star = Some((p, t));
            }
            Some(&c) if c == '_' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((after, matched)) => {
                    p = after;
                    t = matched + 1;
                    star = Some((after, t));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '%')
}

/// `true` when `ident` is a dot-separated list of `[A-Za-z_][A-Za-z0-9_]*`
/// segments.
pub fn is_valid_identifier(ident: &str) -> bool {
    !ident.is_empty() && ident.split('.').all(is_valid_segment)
}

fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Person;

    const NAME: Field<Person> = Field::new("name");
    const AGE: Field<Person> = Field::new("age");
    const CITY: Field<Person> = Field::new("address.city");

    fn body(v: Value) -> Body {
        match v {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_display_is_stable() {
        let f = NAME.eq("bob").and(AGE.gt(30)).or(AGE.is_null());
        assert_eq!(f.to_string(), r#"((name = "bob" AND age > 30) OR age IS NULL)"#);
    }

    #[test]
    fn test_in_and_not_display() {
        let f = NAME.is_in(["a", "b"]).not();
        assert_eq!(f.to_string(), r#"NOT (name IN ("a", "b"))"#);
    }

    #[test]
    fn test_evaluate_comparisons() {
        let doc = body(json!({"name": "Alice", "age": 31}));
        assert!(NAME.eq("Alice").expr().evaluate(&doc));
        assert!(AGE.ge(31).expr().evaluate(&doc));
        assert!(AGE.gt(30.5).expr().evaluate(&doc));
        assert!(!AGE.lt(31).expr().evaluate(&doc));
        assert!(AGE.ne(30).expr().evaluate(&doc));
        assert!(!AGE.eq("31").expr().evaluate(&doc));
    }

    #[test]
    fn test_null_semantics() {
        let doc = body(json!({"name": null}));
        assert!(NAME.is_null().expr().evaluate(&doc));
        assert!(AGE.is_null().expr().evaluate(&doc));
        assert!(!NAME.eq("x").expr().evaluate(&doc));
        assert!(!NAME.ne("x").expr().evaluate(&doc));
    }

    #[test]
    fn test_like_patterns() {
        assert!(like("Alice", "a%"));
        assert!(like("Alice", "%LIC%"));
        assert!(like("Bob", "B_b"));
        assert!(!like("Bob", "B_"));
        assert!(like("", "%"));
    }

    #[test]
    fn test_like_retries_only_the_last_wildcard() {
        assert!(like("abcabd", "%ab_"));
        assert!(like("mississippi", "m%iss%ppi"));
        assert!(like("aXbXc", "a%b%c%%"));
        assert!(!like("aXbXc", "a%c%b"));
        assert!(!like("ab", "a%b_"));

        // with nested backtracking this takes seconds
        let text = "a".repeat(40);
        let started = std::time::Instant::now();
        assert!(!like(&text, "%a%a%a%a%a%a%a%a%b"));
        assert!(like(&text, "%a%a%a%a%a%a%a%a%a"));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_dotted_lookup() {
        let doc = body(json!({"address": {"city": "Lyon"}}));
        assert!(CITY.eq("Lyon").expr().evaluate(&doc));
        assert!(!CITY.eq("Paris").expr().evaluate(&doc));
    }

    #[test]
    fn test_sort_values_orders_nulls_first() {
        let mut values = vec![json!("b"), json!(2), json!(null), json!("a"), json!(1)];
        values.sort_by(sort_values);
        assert_eq!(values, vec![json!(null), json!(1), json!(2), json!("a"), json!("b")]);
    }

    #[test]
    fn test_validate_identifiers() {
        let ok = DocumentQuery::new()
            .filter(Some(CITY.eq("Lyon").into_expr()))
            .order(vec![SortKey::ascending("name")]);
        assert!(ok.validate_identifiers().is_ok());

        let bad = DocumentQuery::new().order(vec![SortKey::ascending("name'); drop")]);
        assert!(matches!(
            bad.validate_identifiers(),
            Err(DataError::InvalidArgument(_))
        ));
    }
}
