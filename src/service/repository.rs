//! Repository: read access to one entity, with joins and nested `with` loading.

use crate::connection::{Connection, Row, Statement};
use crate::error::{ConfigError, DataError, QueryError};
use crate::model::{Entity, EntityManager, RelationDirection, RelationPath};
use crate::query::{Filter, FilterInput, RepoQuery, SortDir};
use crate::sql::{self, QueryBuf, Scope};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RepositoryMeta {
    pub entity: String,
    pub sql: String,
    pub parameters: Vec<Value>,
    pub limit: u32,
    pub offset: u32,
    /// Rows in `data`.
    pub count: usize,
    /// Rows matching the filter, ignoring pagination. Only when the connection allows extra scans.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RepositoryResponse {
    pub data: Vec<Value>,
    pub meta: RepositoryMeta,
}

/// Rows of one level plus the key columns added only to stitch relations together.
struct Fetched {
    rows: Vec<Map<String, Value>>,
    query: QueryBuf,
    extra: Vec<String>,
}

impl Fetched {
    fn strip(&self, mut row: Map<String, Value>) -> Value {
        for k in &self.extra {
            row.remove(k);
        }
        Value::Object(row)
    }
}

fn key_of(v: &Value) -> String {
    v.to_string()
}

fn distinct<'v>(values: impl Iterator<Item = &'v Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .filter(|v| !v.is_null())
        .filter(|v| seen.insert(key_of(v)))
        .cloned()
        .collect()
}

fn page(rows: Vec<Value>, query: &RepoQuery) -> Value {
    Value::Array(
        rows.into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect(),
    )
}

/// Read access to one entity. Obtained from [`EntityManager::repository`].
pub struct Repository<'m> {
    manager: &'m EntityManager,
    entity: &'m Entity,
}

impl<'m> Repository<'m> {
    pub(crate) fn new(manager: &'m EntityManager, entity: &'m Entity) -> Self {
        Repository { manager, entity }
    }

    pub fn entity(&self) -> &Entity {
        self.entity
    }

    fn conn(&self) -> &'m dyn Connection {
        self.manager.connection().as_ref()
    }

    fn related(&self, name: &str) -> Result<&'m Entity, DataError> {
        self.manager
            .entity(name)
            .ok_or_else(|| ConfigError::UnknownEntity(name.to_string()).into())
    }

    fn path(&self, entity: &Entity, name: &str) -> Result<RelationPath, QueryError> {
        self.manager
            .relation(entity.name(), name)
            .ok_or_else(|| QueryError::UnknownRelation {
                entity: entity.name().to_string(),
                relation: name.to_string(),
            })
    }

    fn scope(&self, entity: &'m Entity, joins: &[String]) -> Result<Scope<'m>, DataError> {
        let mut scope = Scope::new(entity);
        for name in joins {
            let path = self.path(entity, name)?;
            let related = self.related(&path.related)?;
            scope = scope.join(path, related)?;
        }
        Ok(scope)
    }

    /// Requested columns, or the visible ones. Explicitly selected hidden fields are returned.
    fn columns(entity: &Entity, select: &[String]) -> Result<Vec<String>, QueryError> {
        if select.is_empty() {
            return Ok(entity.visible_fields().map(|f| f.name.clone()).collect());
        }
        select
            .iter()
            .map(|name| match entity.field(name) {
                Some(f) if f.is_stored() => Ok(name.clone()),
                _ => Err(QueryError::UnknownField {
                    entity: entity.name().to_string(),
                    field: name.clone(),
                }),
            })
            .collect()
    }

    /// Sort by the requested column when it resolves, else by primary key ascending.
    fn order(&self, scope: &Scope<'_>, entity: &Entity, query: &RepoQuery) -> (String, SortDir) {
        if query.explicit_sort && scope.resolve(self.conn(), &query.sort.by).is_ok() {
            (query.sort.by.clone(), query.sort.dir)
        } else {
            (entity.primary().name.clone(), SortDir::Asc)
        }
    }

    fn decode(&self, scope: &Scope<'_>, row: Row) -> Map<String, Value> {
        let conn = self.conn();
        let mut out = Map::new();
        let mut joined: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
        for (col, v) in row {
            match col.split_once('.') {
                None => {
                    let v = match scope.entity.field(&col) {
                        Some(f) => conn.from_driver_value(f, v),
                        None => v,
                    };
                    out.insert(col, v);
                }
                Some((relation, name)) => {
                    let Some(j) = scope.joins.iter().find(|j| j.path.name == relation) else {
                        continue;
                    };
                    let v = match j.entity.field(name) {
                        Some(f) => conn.from_driver_value(f, v),
                        None => v,
                    };
                    joined.entry(relation.to_string()).or_default().insert(name.to_string(), v);
                }
            }
        }
        for j in &scope.joins {
            let obj = joined.remove(&j.path.name).unwrap_or_default();
            // a LEFT JOIN miss yields all-null columns
            let value = if obj.values().any(|v| !v.is_null()) {
                Value::Object(obj)
            } else {
                Value::Null
            };
            out.insert(j.path.name.clone(), value);
        }
        out
    }

    /// Load one level of rows. With `key_in`, rows are restricted to `key IN values`
    /// and pagination is left to the caller (it is applied per parent).
    fn fetch<'a>(
        &'a self,
        entity: &'m Entity,
        query: &'a RepoQuery,
        key_in: Option<(&'a str, Vec<Value>)>,
    ) -> BoxFuture<'a, Result<Fetched, DataError>> {
        Box::pin(async move {
            let conn = self.conn();
            let mut filter = self.manager.validator().convert(&query.where_)?;
            let scope = self.scope(entity, &query.join)?;

            let mut paths = Vec::with_capacity(query.with.len());
            for (name, nested) in &query.with {
                paths.push((self.path(entity, name)?, nested));
            }

            let mut columns = Self::columns(entity, &query.select)?;
            let mut needed: Vec<&str> = vec![entity.primary().name.as_str()];
            if let Some((key, _)) = &key_in {
                needed.push(*key);
            }
            needed.extend(paths.iter().map(|(p, _)| p.our_key.as_str()));
            let mut extra = Vec::new();
            for n in needed {
                if !columns.iter().any(|c| c == n) {
                    columns.push(n.to_string());
                    extra.push(n.to_string());
                }
            }

            let (order_by, dir) = self.order(&scope, entity, query);
            let q = match key_in {
                None => sql::select(
                    conn,
                    &scope,
                    &columns,
                    &filter,
                    Some((order_by.as_str(), dir)),
                    Some(query.limit),
                    query.offset,
                )?,
                Some((key, values)) => {
                    filter = filter.with(key, "$in", Value::Array(values));
                    sql::select(conn, &scope, &columns, &filter, Some((order_by.as_str(), dir)), None, 0)?
                }
            };
            let rows = conn
                .query(&Statement::with_parameters(q.sql.clone(), q.params.clone()))
                .await?;
            let mut rows: Vec<Map<String, Value>> = rows.into_iter().map(|r| self.decode(&scope, r)).collect();

            for (path, nested) in paths {
                self.attach(&mut rows, &path, nested).await?;
            }
            Ok(Fetched { rows, query: q, extra })
        })
    }

    /// Fill `rows[path.name]` with related data loaded by one IN query
    /// (two for many-to-many).
    async fn attach(
        &self,
        rows: &mut [Map<String, Value>],
        path: &RelationPath,
        nested: &RepoQuery,
    ) -> Result<(), DataError> {
        let conn = self.conn();
        let related = self.related(&path.related)?;
        let keys = distinct(rows.iter().filter_map(|r| r.get(&path.our_key)));

        let empty = match path.direction {
            RelationDirection::ToOne => Value::Null,
            _ => json!([]),
        };
        if keys.is_empty() {
            for row in rows.iter_mut() {
                row.insert(path.name.clone(), empty.clone());
            }
            return Ok(());
        }

        match (&path.direction, &path.junction) {
            (RelationDirection::ManyToMany, Some(j)) => {
                let junction = self.related(&j.entity)?;
                let q = sql::select_by_column_in(
                    conn,
                    junction,
                    &[j.our_key.clone(), j.their_key.clone()],
                    &j.our_key,
                    &keys,
                    &Filter::new(),
                    None,
                )?;
                let pairs = conn.query(&q.into_statement()).await?;
                let mut links: HashMap<String, HashSet<String>> = HashMap::new();
                for p in &pairs {
                    if let (Some(ours), Some(theirs)) = (p.get(&j.our_key), p.get(&j.their_key)) {
                        links.entry(key_of(ours)).or_default().insert(key_of(theirs));
                    }
                }
                let their_keys = distinct(pairs.iter().filter_map(|p| p.get(&j.their_key)));
                let fetched = self.fetch(related, nested, Some((path.their_key.as_str(), their_keys))).await?;
                for row in rows.iter_mut() {
                    let members = row.get(&path.our_key).and_then(|k| links.get(&key_of(k)));
                    let list: Vec<Value> = match members {
                        Some(members) => fetched
                            .rows
                            .iter()
                            .filter(|r| r.get(&path.their_key).is_some_and(|k| members.contains(&key_of(k))))
                            .map(|r| fetched.strip(r.clone()))
                            .collect(),
                        None => Vec::new(),
                    };
                    row.insert(path.name.clone(), page(list, nested));
                }
            }
            (RelationDirection::ToOne, _) => {
                let fetched = self.fetch(related, nested, Some((path.their_key.as_str(), keys))).await?;
                let by_key: HashMap<String, &Map<String, Value>> = fetched
                    .rows
                    .iter()
                    .filter_map(|r| r.get(&path.their_key).map(|k| (key_of(k), r)))
                    .collect();
                for row in rows.iter_mut() {
                    let found = row
                        .get(&path.our_key)
                        .and_then(|k| by_key.get(&key_of(k)))
                        .map(|r| fetched.strip((*r).clone()))
                        .unwrap_or(Value::Null);
                    row.insert(path.name.clone(), found);
                }
            }
            _ => {
                let fetched = self.fetch(related, nested, Some((path.their_key.as_str(), keys))).await?;
                let mut groups: HashMap<String, Vec<Value>> = HashMap::new();
                for r in &fetched.rows {
                    if let Some(k) = r.get(&path.their_key) {
                        groups.entry(key_of(k)).or_default().push(fetched.strip(r.clone()));
                    }
                }
                for row in rows.iter_mut() {
                    let list = row
                        .get(&path.our_key)
                        .and_then(|k| groups.remove(&key_of(k)))
                        .unwrap_or_default();
                    row.insert(path.name.clone(), page(list, nested));
                }
            }
        }
        Ok(())
    }

    /// Query rows. The response carries the main statement and, when the
    /// connection allows extra scans, the unpaginated total.
    pub async fn find_many(&self, query: &RepoQuery) -> Result<RepositoryResponse, DataError> {
        let fetched = self.fetch(self.entity, query, None).await?;
        let total = if self.conn().capabilities().softscans {
            Some(self.count_scoped(&query.where_, &query.join).await?)
        } else {
            None
        };
        let data: Vec<Value> = fetched.rows.iter().map(|r| fetched.strip(r.clone())).collect();
        tracing::debug!(entity = %self.entity.name(), rows = data.len(), "find_many");
        Ok(RepositoryResponse {
            meta: RepositoryMeta {
                entity: self.entity.name().to_string(),
                sql: fetched.query.sql,
                parameters: fetched.query.params,
                limit: query.limit,
                offset: query.offset,
                count: data.len(),
                total,
            },
            data,
        })
    }

    /// Parse a JSON query document with the manager's options, then [`find_many`](Self::find_many).
    pub async fn find_json(&self, doc: &Value) -> Result<RepositoryResponse, DataError> {
        let query = RepoQuery::from_json(doc, self.manager.options())?;
        self.find_many(&query).await
    }

    /// Row with primary key `id`. `query` may still select, join and nest.
    pub async fn find_id(&self, id: impl Into<Value>, query: &RepoQuery) -> Result<Option<Value>, DataError> {
        let id: Value = id.into();
        let mut query = query.clone();
        query.where_ = FilterInput::from([(self.entity.primary().name.clone(), Some(json!({ "$eq": id })))]);
        query.offset = 0;
        query.limit = 1;
        Ok(self.find_many(&query).await?.data.into_iter().next())
    }

    /// First row matching `where_` in the query's sort order.
    pub async fn find_one(&self, where_: &FilterInput, query: &RepoQuery) -> Result<Option<Value>, DataError> {
        let mut query = query.clone();
        query.where_ = where_.clone();
        query.limit = 1;
        Ok(self.find_many(&query).await?.data.into_iter().next())
    }

    pub async fn count(&self, where_: &FilterInput) -> Result<u64, DataError> {
        self.count_scoped(where_, &[]).await
    }

    pub async fn exists(&self, where_: &FilterInput) -> Result<bool, DataError> {
        Ok(self.count(where_).await? > 0)
    }

    async fn count_scoped(&self, where_: &FilterInput, joins: &[String]) -> Result<u64, DataError> {
        let filter = self.manager.validator().convert(where_)?;
        let scope = self.scope(self.entity, joins)?;
        let q = sql::count(self.conn(), &scope, &filter)?;
        let rows = self.conn().query(&q.into_statement()).await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }
}
