//! Mutator: validated writes for one entity.

use crate::connection::{Connection, Row, Statement};
use crate::error::DataError;
use crate::id::IdOutcome;
use crate::model::{Entity, EntityManager, PrimaryFormat};
use crate::query::{Filter, FilterInput};
use crate::service::validation::RowValidator;
use crate::sql::{self, QueryBuf};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct MutatorMeta {
    pub entity: String,
    pub sql: String,
    pub parameters: Vec<Value>,
}

/// `data` is the affected row for single-row calls and an array for `*_where` calls.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct MutatorResponse {
    pub data: Value,
    pub meta: MutatorMeta,
}

/// Result of one row of [`Mutator::insert_many`].
#[derive(Debug)]
pub struct RowOutcome {
    pub index: usize,
    pub result: Result<MutatorResponse, DataError>,
}

impl RowOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl Serialize for RowOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("RowOutcome", 3)?;
        s.serialize_field("index", &self.index)?;
        match &self.result {
            Ok(resp) => {
                s.serialize_field("success", &true)?;
                s.serialize_field("data", &resp.data)?;
            }
            Err(e) => {
                s.serialize_field("success", &false)?;
                s.serialize_field(
                    "error",
                    &serde_json::json!({"code": e.code(), "message": e.to_string()}),
                )?;
            }
        }
        s.end()
    }
}

/// Write access to one entity. Obtained from [`EntityManager::mutator`].
pub struct Mutator<'m> {
    manager: &'m EntityManager,
    entity: &'m Entity,
}

impl<'m> Mutator<'m> {
    pub(crate) fn new(manager: &'m EntityManager, entity: &'m Entity) -> Self {
        Mutator { manager, entity }
    }

    pub fn entity(&self) -> &Entity {
        self.entity
    }

    fn conn(&self) -> &'m dyn Connection {
        self.manager.connection().as_ref()
    }

    /// Reject non-objects, unknown fields and fields callers may not write.
    fn writable(&self, data: Value) -> Result<Map<String, Value>, DataError> {
        let Value::Object(row) = data else {
            return Err(DataError::Validation(format!(
                "{} expects an object, got {}",
                self.entity.name(),
                data
            )));
        };
        for key in row.keys() {
            match self.entity.field(key) {
                None => {
                    return Err(DataError::Validation(format!(
                        "{} has no field '{}'",
                        self.entity.name(),
                        key
                    )))
                }
                Some(f) if !f.fillable || !f.is_stored() => {
                    return Err(DataError::Validation(format!("{} is not fillable", key)))
                }
                Some(_) => {}
            }
        }
        Ok(row)
    }

    /// Fill defaults, validate, then assign the primary key.
    async fn prepare_insert(&self, data: Value) -> Result<Map<String, Value>, DataError> {
        let mut row = self.writable(data)?;
        for f in self.entity.fillable_fields() {
            if let (false, Some(default)) = (row.contains_key(&f.name), &f.default_value) {
                row.insert(f.name.clone(), default.clone());
            }
        }
        RowValidator::validate(self.entity, &row)?;

        let pk = self.entity.primary().name.clone();
        match self.entity.primary_format() {
            (PrimaryFormat::Integer, _) => {}
            (PrimaryFormat::Uuid, _) => {
                row.insert(pk, Value::String(uuid::Uuid::new_v4().to_string()));
            }
            (PrimaryFormat::Custom, key) => {
                let key = key.unwrap_or_default();
                let snapshot = Value::Object(row.clone());
                match self
                    .manager
                    .registry()
                    .execute(key, self.entity.name(), Some(&snapshot))
                    .await
                {
                    IdOutcome::Generated(v) => {
                        row.insert(pk, v);
                    }
                    IdOutcome::Failed(message) => {
                        return Err(DataError::IdGeneration {
                            entity: self.entity.name().to_string(),
                            message,
                        })
                    }
                }
            }
        }
        Ok(row)
    }

    /// Decode driver values and drop hidden fields.
    fn output(&self, row: Row) -> Value {
        let conn = self.conn();
        let mut out = Map::new();
        for (k, v) in row {
            match self.entity.field(&k) {
                Some(f) if f.hidden => {}
                Some(f) => {
                    out.insert(k, conn.from_driver_value(f, v));
                }
                None => {
                    out.insert(k, v);
                }
            }
        }
        Value::Object(out)
    }

    async fn run(&self, q: QueryBuf) -> Result<(Vec<Value>, MutatorMeta), DataError> {
        let rows = self
            .conn()
            .query(&Statement::with_parameters(q.sql.clone(), q.params.clone()))
            .await?;
        let data = rows.into_iter().map(|r| self.output(r)).collect();
        Ok((
            data,
            MutatorMeta {
                entity: self.entity.name().to_string(),
                sql: q.sql,
                parameters: q.params,
            },
        ))
    }

    fn by_id(&self, id: Value) -> Filter {
        Filter::new().with(&self.entity.primary().name, "$eq", id)
    }

    fn single(&self, id: &Value, (data, meta): (Vec<Value>, MutatorMeta)) -> Result<MutatorResponse, DataError> {
        let data = data
            .into_iter()
            .next()
            .ok_or_else(|| DataError::NotFound(format!("{} {}", self.entity.name(), id)))?;
        Ok(MutatorResponse { data, meta })
    }

    pub async fn insert_one(&self, data: Value) -> Result<MutatorResponse, DataError> {
        let row = self.prepare_insert(data).await?;
        let q = sql::insert(self.conn(), self.entity, &row)?;
        let (data, meta) = self.run(q).await?;
        tracing::debug!(entity = %self.entity.name(), "inserted row");
        Ok(MutatorResponse {
            data: data.into_iter().next().unwrap_or(Value::Null),
            meta,
        })
    }

    /// Insert rows one by one. A failing row does not stop the others; each
    /// outcome carries the index of its input row.
    pub async fn insert_many(&self, rows: Vec<Value>) -> Vec<RowOutcome> {
        let mut out = Vec::with_capacity(rows.len());
        for (index, data) in rows.into_iter().enumerate() {
            let result = self.insert_one(data).await;
            if let Err(e) = &result {
                tracing::warn!(entity = %self.entity.name(), index, error = %e, "row insert failed");
            }
            out.push(RowOutcome { index, result });
        }
        out
    }

    /// Update the row with primary key `id`. Fails with `NotFound` when no row matches.
    pub async fn update_one(&self, id: impl Into<Value>, data: Value) -> Result<MutatorResponse, DataError> {
        let id = id.into();
        let row = self.writable(data)?;
        RowValidator::validate_partial(self.entity, &row)?;
        let q = sql::update(self.conn(), self.entity, &row, &self.by_id(id.clone()))?;
        self.single(&id, self.run(q).await?)
    }

    pub async fn delete_one(&self, id: impl Into<Value>) -> Result<MutatorResponse, DataError> {
        let id = id.into();
        let q = sql::delete(self.conn(), self.entity, &self.by_id(id.clone()))?;
        self.single(&id, self.run(q).await?)
    }

    /// Update every row matching `where_`. An empty filter is refused.
    pub async fn update_where(&self, where_: &FilterInput, data: Value) -> Result<MutatorResponse, DataError> {
        let filter = self.filter(where_)?;
        let row = self.writable(data)?;
        RowValidator::validate_partial(self.entity, &row)?;
        let q = sql::update(self.conn(), self.entity, &row, &filter)?;
        let (data, meta) = self.run(q).await?;
        tracing::debug!(entity = %self.entity.name(), rows = data.len(), "update_where");
        Ok(MutatorResponse {
            data: Value::Array(data),
            meta,
        })
    }

    /// Delete every row matching `where_`. An empty filter is refused.
    pub async fn delete_where(&self, where_: &FilterInput) -> Result<MutatorResponse, DataError> {
        let filter = self.filter(where_)?;
        let q = sql::delete(self.conn(), self.entity, &filter)?;
        let (data, meta) = self.run(q).await?;
        tracing::debug!(entity = %self.entity.name(), rows = data.len(), "delete_where");
        Ok(MutatorResponse {
            data: Value::Array(data),
            meta,
        })
    }

    fn filter(&self, where_: &FilterInput) -> Result<Filter, DataError> {
        let filter = self.manager.validator().convert(where_)?;
        if filter.is_empty() {
            return Err(DataError::Validation(format!(
                "refusing to change every {} row without a filter",
                self.entity.name()
            )));
        }
        Ok(filter)
    }
}
