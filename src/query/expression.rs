//! Query expressions: `$`-prefixed filter operators with a type guard and an
//! in-memory evaluator, grouped into a closed [`Validator`].

use crate::error::{ConfigError, QueryError};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

pub type TypeGuard = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
/// Called as `evaluator(expected, actual)`.
pub type Evaluator = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Caller-supplied filter. `None` marks a field as unset: it is dropped, not matched.
pub type FilterInput = BTreeMap<String, Option<Value>>;

/// A filter operator: key, type guard and evaluator.
#[derive(Clone)]
pub struct QueryExpression {
    key: String,
    guard: TypeGuard,
    evaluator: Evaluator,
}

impl fmt::Debug for QueryExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExpression").field("key", &self.key).finish()
    }
}

impl QueryExpression {
    pub fn new<G, E>(key: impl Into<String>, guard: G, evaluator: E) -> Result<Self, ConfigError>
    where
        G: Fn(&Value) -> bool + Send + Sync + 'static,
        E: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        let key = key.into();
        if key.len() < 2 || !key.starts_with('$') {
            return Err(ConfigError::InvalidExpression(key));
        }
        Ok(QueryExpression {
            key,
            guard: Arc::new(guard),
            evaluator: Arc::new(evaluator),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn accepts(&self, value: &Value) -> bool {
        (self.guard)(value)
    }

    pub fn evaluate(&self, expected: &Value, actual: &Value) -> bool {
        (self.evaluator)(expected, actual)
    }
}

/// Shorthand for [`QueryExpression::new`].
pub fn exp<G, E>(key: &str, guard: G, evaluator: E) -> Result<QueryExpression, ConfigError>
where
    G: Fn(&Value) -> bool + Send + Sync + 'static,
    E: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
{
    QueryExpression::new(key, guard, evaluator)
}

/// Canonical filter: `{field: {$op: value}}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, BTreeMap<String, Value>>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Add `field $op value`, replacing an existing predicate with the same operator.
    pub fn with(mut self, field: &str, operator: &str, value: Value) -> Self {
        self.0
            .entry(field.to_string())
            .or_default()
            .insert(operator.to_string(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&BTreeMap<String, Value>> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, Value>)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (field, ops) in &self.0 {
            let ops: Map<String, Value> = ops.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            out.insert(field.clone(), Value::Object(ops));
        }
        Value::Object(out)
    }
}

fn filter_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("static regex")
    })
}

/// Closed set of expressions. Always contains `$eq`.
#[derive(Clone, Debug)]
pub struct Validator {
    expressions: BTreeMap<String, QueryExpression>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::default_set()
    }
}

impl Validator {
    pub fn new(expressions: impl IntoIterator<Item = QueryExpression>) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for e in expressions {
            if map.contains_key(&e.key) {
                return Err(ConfigError::DuplicateExpression(e.key));
            }
            map.insert(e.key.clone(), e);
        }
        if !map.contains_key("$eq") {
            return Err(ConfigError::MissingEqExpression);
        }
        Ok(Validator { expressions: map })
    }

    /// `$eq $ne $gt $gte $lt $lte $isnull $notnull $in $notin $between $like`.
    pub fn default_set() -> Self {
        let expressions = default_expressions()
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        Validator { expressions }
    }

    pub fn operators(&self) -> impl Iterator<Item = &str> {
        self.expressions.keys().map(String::as_str)
    }

    pub fn expression(&self, key: &str) -> Option<&QueryExpression> {
        self.expressions.get(key)
    }

    /// Convert loose input into canonical form.
    pub fn convert(&self, input: &FilterInput) -> Result<Filter, QueryError> {
        let mut out = BTreeMap::new();
        for (field, value) in input {
            if field.starts_with('$') {
                return Err(QueryError::ReservedKey(field.clone()));
            }
            if !filter_key_re().is_match(field) {
                return Err(QueryError::InvalidFilter {
                    field: field.clone(),
                    reason: "not a field name".into(),
                });
            }
            let Some(value) = value else { continue };
            let ops = self.convert_value(field, value)?;
            out.insert(field.clone(), ops);
        }
        Ok(Filter(out))
    }

    fn convert_value(&self, field: &str, value: &Value) -> Result<BTreeMap<String, Value>, QueryError> {
        match value {
            Value::Null => Err(QueryError::InvalidFilter {
                field: field.to_string(),
                reason: "null is not a valid filter value".into(),
            }),
            Value::Object(ops) => {
                if ops.is_empty() {
                    return Err(QueryError::InvalidFilter {
                        field: field.to_string(),
                        reason: "empty operator object".into(),
                    });
                }
                let mut out = BTreeMap::new();
                for (op, v) in ops {
                    let expr = self.expressions.get(op).ok_or_else(|| QueryError::InvalidOperator {
                        field: field.to_string(),
                        operator: op.clone(),
                        reason: "is not supported".into(),
                    })?;
                    if !expr.accepts(v) {
                        return Err(QueryError::InvalidOperator {
                            field: field.to_string(),
                            operator: op.clone(),
                            reason: format!("rejects value {}", v),
                        });
                    }
                    out.insert(op.clone(), v.clone());
                }
                Ok(out)
            }
            bare => {
                let eq = self.expressions.get("$eq").ok_or_else(|| QueryError::InvalidOperator {
                    field: field.to_string(),
                    operator: "$eq".into(),
                    reason: "is not supported".into(),
                })?;
                if !eq.accepts(bare) {
                    return Err(QueryError::InvalidOperator {
                        field: field.to_string(),
                        operator: "$eq".into(),
                        reason: format!("rejects value {}", bare),
                    });
                }
                Ok(BTreeMap::from([("$eq".to_string(), bare.clone())]))
            }
        }
    }

    /// Convert a JSON object or a JSON-encoded object string.
    pub fn convert_json(&self, where_: &Value) -> Result<Filter, QueryError> {
        let input = filter_input_from_json(where_)?;
        self.convert(&input)
    }

    /// Whether `subject` satisfies every predicate of `input`.
    pub fn validate(&self, input: &FilterInput, subject: &Value) -> Result<bool, QueryError> {
        let filter = self.convert(input)?;
        Ok(self.matches(&filter, subject))
    }

    /// Evaluate an already converted filter against `subject`.
    pub fn matches(&self, filter: &Filter, subject: &Value) -> bool {
        filter.iter().all(|(field, ops)| {
            let actual = lookup(subject, field);
            ops.iter().all(|(op, expected)| {
                self.expressions
                    .get(op)
                    .map(|e| e.evaluate(expected, actual))
                    .unwrap_or(false)
            })
        })
    }
}

/// Turn a `where` document (object or JSON string) into filter input.
pub fn filter_input_from_json(where_: &Value) -> Result<FilterInput, QueryError> {
    let parsed;
    let obj = match where_ {
        Value::Object(m) => m,
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s).map_err(|e| QueryError::InvalidWhere(e.to_string()))?;
            match &parsed {
                Value::Object(m) => m,
                other => return Err(QueryError::InvalidWhere(format!("got {}", other))),
            }
        }
        other => return Err(QueryError::InvalidWhere(format!("got {}", other))),
    };
    Ok(obj.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect())
}

static NULL: Value = Value::Null;

fn lookup<'a>(subject: &'a Value, path: &str) -> &'a Value {
    path.split('.')
        .try_fold(subject, |cur, part| cur.get(part))
        .unwrap_or(&NULL)
}

fn is_primitive(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn is_comparable(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Number(_))
}

fn is_flag(v: &Value) -> bool {
    match v {
        Value::Bool(_) => true,
        Value::Number(n) => matches!(n.as_i64(), Some(0) | Some(1)),
        _ => false,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Bool(x), Value::Number(n)) | (Value::Number(n), Value::Bool(x)) => {
            n.as_i64() == Some(i64::from(*x))
        }
        _ => a == b,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// `*` and `%` match any run, `_` one character.
pub(crate) fn like_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' | '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

fn default_expressions() -> Vec<QueryExpression> {
    fn make<G, E>(key: &str, guard: G, eval: E) -> QueryExpression
    where
        G: Fn(&Value) -> bool + Send + Sync + 'static,
        E: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        QueryExpression {
            key: key.to_string(),
            guard: Arc::new(guard),
            evaluator: Arc::new(eval),
        }
    }

    vec![
        make("$eq", is_primitive, |e, a| loose_eq(a, e)),
        make("$ne", is_primitive, |e, a| !loose_eq(a, e)),
        make("$gt", is_comparable, |e, a| compare(a, e) == Some(Ordering::Greater)),
        make("$gte", is_comparable, |e, a| {
            matches!(compare(a, e), Some(Ordering::Greater | Ordering::Equal))
        }),
        make("$lt", is_comparable, |e, a| compare(a, e) == Some(Ordering::Less)),
        make("$lte", is_comparable, |e, a| {
            matches!(compare(a, e), Some(Ordering::Less | Ordering::Equal))
        }),
        make("$isnull", is_flag, |e, a| truthy(e) == a.is_null()),
        make("$notnull", is_flag, |e, a| truthy(e) != a.is_null()),
        make(
            "$in",
            |v| matches!(v, Value::Array(items) if items.iter().all(is_primitive)),
            |e, a| e.as_array().map(|items| items.iter().any(|i| loose_eq(a, i))).unwrap_or(false),
        ),
        make(
            "$notin",
            |v| matches!(v, Value::Array(items) if items.iter().all(is_primitive)),
            |e, a| e.as_array().map(|items| !items.iter().any(|i| loose_eq(a, i))).unwrap_or(false),
        ),
        make(
            "$between",
            |v| matches!(v, Value::Array(items) if items.len() == 2 && items.iter().all(is_comparable)),
            |e, a| match e.as_array().map(Vec::as_slice) {
                Some([lo, hi]) => {
                    matches!(compare(a, lo), Some(Ordering::Greater | Ordering::Equal))
                        && matches!(compare(a, hi), Some(Ordering::Less | Ordering::Equal))
                }
                _ => false,
            },
        ),
        make(
            "$like",
            |v| v.is_string(),
            |e, a| match (e.as_str(), a.as_str()) {
                (Some(pattern), Some(s)) => like_to_regex(pattern).map(|re| re.is_match(s)).unwrap_or(false),
                _ => false,
            },
        ),
    ]
}
