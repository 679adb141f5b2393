//! Entity: a named, ordered set of unique fields plus entity-level config.

use crate::error::ConfigError;
use crate::id::{IdHandler, IdHandlerRegistry};
use crate::model::field::{Field, FieldKind, PrimaryFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};

/// Name used for a synthesized primary field.
pub const DEFAULT_PRIMARY: &str = "id";

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// True for names usable as unquoted table/column identifiers.
pub fn is_identifier(s: &str) -> bool {
    identifier_re().is_match(s)
}

pub(crate) fn check_identifier(s: &str) -> Result<(), ConfigError> {
    if is_identifier(s) {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(s.to_string()))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Format of the synthesized primary field when none is declared.
    #[serde(default)]
    pub primary_format: PrimaryFormat,
    /// Handler key for custom primary format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_handler: Option<String>,
}

/// Deserializing goes through [`Entity::new`], so documents get the same checks
/// as declarations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EntityDocument")]
pub struct Entity {
    name: String,
    fields: Vec<Field>,
    config: EntityConfig,
    /// Position of the primary field in `fields`.
    #[serde(skip)]
    primary: usize,
}

/// Wire shape of an entity before validation.
#[derive(Deserialize)]
struct EntityDocument {
    name: String,
    #[serde(default)]
    fields: Vec<Field>,
    #[serde(default)]
    config: EntityConfig,
}

impl TryFrom<EntityDocument> for Entity {
    type Error = ConfigError;

    fn try_from(doc: EntityDocument) -> Result<Self, Self::Error> {
        Entity::new(doc.name, doc.fields, doc.config)
    }
}

impl Entity {
    /// Build an entity. Identical duplicate fields collapse; conflicting ones fail.
    /// A primary field is synthesized from `config` when none is declared.
    pub fn new(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = Field>,
        config: EntityConfig,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        check_identifier(&name)?;

        let mut entity = Entity {
            name,
            fields: Vec::new(),
            config,
            primary: 0,
        };
        for f in fields {
            entity.add_field(f)?;
        }

        if entity.fields.iter().all(|f| !f.is_primary()) {
            let primary = match (entity.config.primary_format, &entity.config.id_handler) {
                (PrimaryFormat::Custom, Some(key)) => Field::primary_custom(DEFAULT_PRIMARY, key.clone()),
                (PrimaryFormat::Custom, None) => {
                    return Err(ConfigError::Document(format!(
                        "entity '{}' uses a custom primary format without an id handler",
                        entity.name
                    )))
                }
                (format, _) => Field::primary(DEFAULT_PRIMARY, format),
            };
            if entity.field(DEFAULT_PRIMARY).is_some() {
                return Err(ConfigError::ConflictingField {
                    entity: entity.name.clone(),
                    field: DEFAULT_PRIMARY.to_string(),
                });
            }
            entity.fields.insert(0, primary);
        }
        entity.primary = entity.fields.iter().position(Field::is_primary).unwrap_or(0);

        if let FieldKind::Primary {
            format: PrimaryFormat::Custom,
            handler: None,
        } = &entity.primary().kind
        {
            return Err(ConfigError::Document(format!(
                "entity '{}': custom primary field needs a handler key",
                entity.name
            )));
        }
        Ok(entity)
    }

    pub fn builder(name: impl Into<String>) -> EntityBuilder {
        EntityBuilder {
            name: name.into(),
            fields: Vec::new(),
            config: EntityConfig::default(),
            custom: None,
        }
    }

    /// Rebuild from a document produced by [`to_json`](Self::to_json).
    pub fn from_json(doc: &Value) -> Result<Self, ConfigError> {
        let raw: EntityDocument =
            serde_json::from_value(doc.clone()).map_err(|e| ConfigError::Document(e.to_string()))?;
        Entity::try_from(raw)
    }

    /// Schema-describable document: name, ordered fields and config.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub(crate) fn add_field(&mut self, field: Field) -> Result<(), ConfigError> {
        check_identifier(&field.name)?;
        if let Some(existing) = self.fields.iter().find(|f| f.name == field.name) {
            if *existing == field {
                return Ok(());
            }
            return Err(ConfigError::ConflictingField {
                entity: self.name.clone(),
                field: field.name,
            });
        }
        if field.is_primary() {
            if let Some(p) = self.fields.iter().find(|f| f.is_primary()) {
                return Err(ConfigError::MultiplePrimary {
                    entity: self.name.clone(),
                    first: p.name.clone(),
                    second: field.name,
                });
            }
        }
        self.fields.push(field);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        self.config.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn config(&self) -> &EntityConfig {
        &self.config
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary(&self) -> &Field {
        &self.fields[self.primary]
    }

    /// Primary format and, for custom keys, the handler key.
    pub fn primary_format(&self) -> (PrimaryFormat, Option<&str>) {
        match &self.primary().kind {
            FieldKind::Primary { format, handler } => (*format, handler.as_deref()),
            _ => (PrimaryFormat::Integer, None),
        }
    }

    /// Fields backed by a column.
    pub fn stored_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_stored())
    }

    pub fn fillable_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.fillable && f.is_stored())
    }

    /// Stored fields returned when a query does not select explicitly.
    pub fn visible_fields(&self) -> impl Iterator<Item = &Field> {
        self.stored_fields().filter(|f| !f.hidden)
    }

    /// Toggle a field's visibility. The only mutation allowed after construction.
    pub fn set_field_hidden(&mut self, field: &str, hidden: bool) -> Result<(), ConfigError> {
        let name = self.name.clone();
        let f = self
            .fields
            .iter_mut()
            .find(|f| f.name == field)
            .ok_or(ConfigError::UnknownField {
                entity: name,
                field: field.to_string(),
            })?;
        f.hidden = hidden;
        Ok(())
    }
}

/// Builder for [`Entity`]. Supplying a custom id handler makes `build` register
/// it under `entity_<name>` in the given registry.
pub struct EntityBuilder {
    name: String,
    fields: Vec<Field>,
    config: EntityConfig,
    custom: Option<(IdHandlerRegistry, Arc<dyn IdHandler>, Option<Value>)>,
}

impl EntityBuilder {
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.config.display_name = Some(name.into());
        self
    }

    pub fn primary_format(mut self, format: PrimaryFormat) -> Self {
        self.config.primary_format = format;
        self
    }

    /// Use an already registered handler for primary keys.
    pub fn id_handler(mut self, key: impl Into<String>) -> Self {
        self.config.primary_format = PrimaryFormat::Custom;
        self.config.id_handler = Some(key.into());
        self
    }

    /// Bind a handler to this entity; registered as `entity_<name>` on build.
    pub fn custom_id_handler(
        mut self,
        registry: &IdHandlerRegistry,
        handler: Arc<dyn IdHandler>,
        config: Option<Value>,
    ) -> Self {
        self.custom = Some((registry.clone(), handler, config));
        self
    }

    /// The handler is registered only once the entity itself is valid.
    pub fn build(mut self) -> Result<Entity, ConfigError> {
        check_identifier(&self.name)?;
        let custom = self.custom.take();
        let key = format!("entity_{}", self.name);
        if custom.is_some() {
            self.config.primary_format = PrimaryFormat::Custom;
            self.config.id_handler = Some(key.clone());
        }
        let entity = Entity::new(self.name, self.fields, self.config)?;
        if let Some((registry, handler, config)) = custom {
            registry.register_with_config(&key, handler, config.as_ref())?;
        }
        Ok(entity)
    }
}
