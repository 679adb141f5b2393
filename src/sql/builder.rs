//! Builds parameterized SELECT, COUNT, INSERT, UPDATE, DELETE for an entity.
//!
//! Identifiers come from declared entities only and are quoted by the
//! connection; values always travel as parameters.

use crate::connection::{Connection, Statement};
use crate::error::{DataError, QueryError};
use crate::model::{Entity, Field, FieldKind, RelationDirection, RelationPath};
use crate::query::{Filter, SortDir};
use serde_json::{Map, Value};

/// Alias of the queried table when relations are joined into it.
pub const MAIN_ALIAS: &str = "main";

#[derive(Clone, Debug, Default)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    pub fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: Value) -> usize {
        self.params.push(v);
        self.params.len()
    }

    pub fn into_statement(self) -> Statement {
        Statement::with_parameters(self.sql, self.params)
    }
}

/// A to-one relation LEFT JOINed under its relation name.
#[derive(Clone, Debug)]
pub struct Join<'a> {
    pub path: RelationPath,
    pub entity: &'a Entity,
}

/// The table a statement reads from, plus joined relations.
#[derive(Clone, Debug)]
pub struct Scope<'a> {
    pub entity: &'a Entity,
    pub joins: Vec<Join<'a>>,
}

impl<'a> Scope<'a> {
    pub fn new(entity: &'a Entity) -> Self {
        Scope {
            entity,
            joins: Vec::new(),
        }
    }

    /// Only to-one relations can be joined without multiplying rows.
    pub fn join(mut self, path: RelationPath, entity: &'a Entity) -> Result<Self, QueryError> {
        if path.direction != RelationDirection::ToOne {
            return Err(QueryError::NotJoinable(path.name));
        }
        if !self.joins.iter().any(|j| j.path.name == path.name) {
            self.joins.push(Join { path, entity });
        }
        Ok(self)
    }

    fn qualified(&self) -> bool {
        !self.joins.is_empty()
    }

    fn column(&self, conn: &dyn Connection, name: &str) -> String {
        if self.qualified() {
            format!("{}.{}", conn.quote(MAIN_ALIAS), conn.quote(name))
        } else {
            conn.quote(name)
        }
    }

    fn from_clause(&self, conn: &dyn Connection) -> String {
        let mut from = conn.quote(self.entity.name());
        if self.qualified() {
            from.push_str(&format!(" AS {}", conn.quote(MAIN_ALIAS)));
        }
        for j in &self.joins {
            let alias = conn.quote(&j.path.name);
            from.push_str(&format!(
                " LEFT JOIN {} AS {} ON {}.{} = {}",
                conn.quote(j.entity.name()),
                alias,
                alias,
                conn.quote(&j.path.their_key),
                self.column(conn, &j.path.our_key)
            ));
        }
        from
    }

    /// Resolve `field` or `relation.field` to a column expression and its field.
    pub fn resolve(&self, conn: &dyn Connection, key: &str) -> Result<(String, &'a Field), QueryError> {
        match key.split_once('.') {
            None => {
                let field = stored_field(self.entity, key)?;
                Ok((self.column(conn, key), field))
            }
            Some((relation, name)) => {
                let join = self
                    .joins
                    .iter()
                    .find(|j| j.path.name == relation)
                    .ok_or_else(|| QueryError::UnknownRelation {
                        entity: self.entity.name().to_string(),
                        relation: relation.to_string(),
                    })?;
                let field = stored_field(join.entity, name)?;
                Ok((format!("{}.{}", conn.quote(relation), conn.quote(name)), field))
            }
        }
    }
}

fn stored_field<'a>(entity: &'a Entity, name: &str) -> Result<&'a Field, QueryError> {
    entity
        .field(name)
        .filter(|f| f.is_stored())
        .ok_or_else(|| QueryError::UnknownField {
            entity: entity.name().to_string(),
            field: name.to_string(),
        })
}

fn bind_value(conn: &dyn Connection, q: &mut QueryBuf, field: &Field, v: &Value) -> Result<String, DataError> {
    let encoded = conn.to_driver_value(field, v.clone())?;
    let n = q.push_param(encoded);
    Ok(conn.placeholder(n, Some(field)))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn condition(
    conn: &dyn Connection,
    q: &mut QueryBuf,
    col: &str,
    field: &Field,
    op: &str,
    v: &Value,
) -> Result<String, DataError> {
    let cmp = |q: &mut QueryBuf, sym: &str| -> Result<String, DataError> {
        Ok(format!("{} {} {}", col, sym, bind_value(conn, q, field, v)?))
    };
    match op {
        "$eq" => cmp(q, "="),
        // NULL is unequal to every value
        "$ne" => Ok(format!("({} OR {} IS NULL)", cmp(q, "<>")?, col)),
        "$gt" => cmp(q, ">"),
        "$gte" => cmp(q, ">="),
        "$lt" => cmp(q, "<"),
        "$lte" => cmp(q, "<="),
        "$isnull" | "$notnull" => {
            let is_null = truthy(v) == (op == "$isnull");
            Ok(format!("{} IS {}NULL", col, if is_null { "" } else { "NOT " }))
        }
        "$in" | "$notin" => {
            let items = v.as_array().map(Vec::as_slice).unwrap_or_default();
            if items.is_empty() {
                return Ok(if op == "$in" { "1 = 0" } else { "1 = 1" }.to_string());
            }
            let phs = items
                .iter()
                .map(|item| bind_value(conn, q, field, item))
                .collect::<Result<Vec<_>, _>>()?;
            let kw = if op == "$in" { "IN" } else { "NOT IN" };
            Ok(format!("{} {} ({})", col, kw, phs.join(", ")))
        }
        "$between" => match v.as_array().map(Vec::as_slice) {
            Some([lo, hi]) => Ok(format!(
                "{} BETWEEN {} AND {}",
                col,
                bind_value(conn, q, field, lo)?,
                bind_value(conn, q, field, hi)?
            )),
            _ => Err(QueryError::InvalidOperator {
                field: field.name.clone(),
                operator: op.to_string(),
                reason: "expects two bounds".into(),
            }
            .into()),
        },
        "$like" => {
            let pattern = v.as_str().unwrap_or_default().replace('*', "%");
            let n = q.push_param(Value::String(pattern));
            let target = if matches!(field.kind, FieldKind::Text { .. }) {
                col.to_string()
            } else {
                format!("CAST({} AS text)", col)
            };
            Ok(format!("{} LIKE {}", target, conn.placeholder(n, None)))
        }
        other => Err(QueryError::UnsupportedOperator(other.to_string()).into()),
    }
}

/// ` WHERE a AND b …`, or empty for an empty filter. All predicates are ANDed.
fn where_clause(conn: &dyn Connection, scope: &Scope<'_>, filter: &Filter, q: &mut QueryBuf) -> Result<String, DataError> {
    let mut parts = Vec::new();
    for (key, ops) in filter.iter() {
        let (col, field) = scope.resolve(conn, key)?;
        for (op, v) in ops {
            parts.push(condition(conn, q, &col, field, op, v)?);
        }
    }
    Ok(if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    })
}

/// Main columns by name, then every stored column of each join as `"relation.column"`.
fn select_list(conn: &dyn Connection, scope: &Scope<'_>, columns: &[String]) -> String {
    let mut parts: Vec<String> = columns
        .iter()
        .map(|c| {
            if scope.qualified() {
                format!("{} AS {}", scope.column(conn, c), conn.quote(c))
            } else {
                conn.quote(c)
            }
        })
        .collect();
    for j in &scope.joins {
        for f in j.entity.visible_fields().filter(|f| f.is_stored()) {
            parts.push(format!(
                "{}.{} AS {}",
                conn.quote(&j.path.name),
                conn.quote(&f.name),
                conn.quote(&format!("{}.{}", j.path.name, f.name))
            ));
        }
    }
    parts.join(", ")
}

fn returning_list(conn: &dyn Connection, entity: &Entity) -> String {
    entity
        .stored_fields()
        .map(|f| conn.quote(&f.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// SELECT with filter, ORDER BY, LIMIT and OFFSET. `order` must name a resolvable column.
pub fn select(
    conn: &dyn Connection,
    scope: &Scope<'_>,
    columns: &[String],
    filter: &Filter,
    order: Option<(&str, SortDir)>,
    limit: Option<u32>,
    offset: u32,
) -> Result<QueryBuf, DataError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(conn, scope, filter, &mut q)?;
    let order_sql = match order {
        Some((key, dir)) => format!(" ORDER BY {} {}", scope.resolve(conn, key)?.0, dir.as_sql()),
        None => String::new(),
    };
    let limit_sql = match limit {
        Some(n) => format!(" LIMIT {} OFFSET {}", n, offset),
        None => String::new(),
    };
    q.sql = format!(
        "SELECT {} FROM {}{}{}{}",
        select_list(conn, scope, columns),
        scope.from_clause(conn),
        where_sql,
        order_sql,
        limit_sql
    );
    Ok(q)
}

/// `SELECT COUNT(*) AS "count"` over the same FROM/WHERE as [`select`].
pub fn count(conn: &dyn Connection, scope: &Scope<'_>, filter: &Filter) -> Result<QueryBuf, DataError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(conn, scope, filter, &mut q)?;
    q.sql = format!(
        "SELECT COUNT(*) AS {} FROM {}{}",
        conn.quote("count"),
        scope.from_clause(conn),
        where_sql
    );
    Ok(q)
}

/// SELECT … WHERE key IN (…) [AND filter]. Used for batch-fetching related rows.
pub fn select_by_column_in(
    conn: &dyn Connection,
    entity: &Entity,
    columns: &[String],
    column_name: &str,
    values: &[Value],
    filter: &Filter,
    order: Option<(&str, SortDir)>,
) -> Result<QueryBuf, DataError> {
    let merged = filter.clone().with(column_name, "$in", Value::Array(values.to_vec()));
    select(conn, &Scope::new(entity), columns, &merged, order, None, 0)
}

/// INSERT … RETURNING every stored column. An empty row inserts defaults.
pub fn insert(conn: &dyn Connection, entity: &Entity, row: &Map<String, Value>) -> Result<QueryBuf, DataError> {
    let mut q = QueryBuf::new();
    let table = conn.quote(entity.name());
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for f in entity.stored_fields() {
        let Some(v) = row.get(&f.name) else { continue };
        placeholders.push(bind_value(conn, &mut q, f, v)?);
        cols.push(conn.quote(&f.name));
    }
    let returning = returning_list(conn, entity);
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table, returning)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table,
            cols.join(", "),
            placeholders.join(", "),
            returning
        )
    };
    Ok(q)
}

/// UPDATE rows matching `filter`: SET only the columns present in `set`.
/// With nothing to set it degrades to a SELECT of the matching rows.
pub fn update(
    conn: &dyn Connection,
    entity: &Entity,
    set: &Map<String, Value>,
    filter: &Filter,
) -> Result<QueryBuf, DataError> {
    let mut q = QueryBuf::new();
    let table = conn.quote(entity.name());
    let mut sets = Vec::new();
    for f in entity.stored_fields().filter(|f| !f.is_primary()) {
        let Some(v) = set.get(&f.name) else { continue };
        let rhs = bind_value(conn, &mut q, f, v)?;
        sets.push(format!("{} = {}", conn.quote(&f.name), rhs));
    }
    let where_sql = where_clause(conn, &Scope::new(entity), filter, &mut q)?;
    let returning = returning_list(conn, entity);
    q.sql = if sets.is_empty() {
        format!("SELECT {} FROM {}{}", returning, table, where_sql)
    } else {
        format!(
            "UPDATE {} SET {}{} RETURNING {}",
            table,
            sets.join(", "),
            where_sql,
            returning
        )
    };
    Ok(q)
}

/// DELETE rows matching `filter`, returning them.
pub fn delete(conn: &dyn Connection, entity: &Entity, filter: &Filter) -> Result<QueryBuf, DataError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(conn, &Scope::new(entity), filter, &mut q)?;
    q.sql = format!(
        "DELETE FROM {}{} RETURNING {}",
        conn.quote(entity.name()),
        where_sql,
        returning_list(conn, entity)
    );
    Ok(q)
}
