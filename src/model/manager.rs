//! EntityManager: entities, relations and indices bound to one connection.

use crate::connection::Connection;
use crate::error::ConfigError;
use crate::id::IdHandlerRegistry;
use crate::model::entity::{check_identifier, Entity, EntityConfig};
use crate::model::field::Field;
use crate::model::index::EntityIndex;
use crate::model::relation::{Relation, RelationKind, RelationPath};
use crate::query::{RepositoryOptions, Validator};
use crate::schema::SchemaSynchronizer;
use crate::service::{Mutator, Repository};
use std::sync::Arc;

/// Registration is single-threaded setup; once built the manager is shared
/// read-only by repositories, mutators and the synchronizer.
pub struct EntityManager {
    connection: Arc<dyn Connection>,
    registry: IdHandlerRegistry,
    validator: Validator,
    options: RepositoryOptions,
    /// Entities as declared by callers, used to detect conflicting re-registration.
    declared: Vec<Entity>,
    /// Entities with relation fields applied, in registration order.
    entities: Vec<Entity>,
    relations: Vec<Relation>,
    indices: Vec<EntityIndex>,
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("connection", &self.connection.name())
            .field("entities", &self.entities.iter().map(Entity::name).collect::<Vec<_>>())
            .field("relations", &self.relations.len())
            .field("indices", &self.indices.len())
            .finish()
    }
}

impl EntityManager {
    pub fn new(connection: Arc<dyn Connection>, registry: IdHandlerRegistry) -> Self {
        EntityManager {
            connection,
            registry,
            validator: Validator::default_set(),
            options: RepositoryOptions::default(),
            declared: Vec::new(),
            entities: Vec::new(),
            relations: Vec::new(),
            indices: Vec::new(),
        }
    }

    /// Replace the filter validator used by repositories and mutators.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_options(mut self, options: RepositoryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn registry(&self) -> &IdHandlerRegistry {
        &self.registry
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    /// Register an entity. Re-adding an identical declaration is a no-op.
    pub fn add_entity(&mut self, entity: Entity) -> Result<(), ConfigError> {
        if let Some(existing) = self.declared.iter().find(|e| e.name() == entity.name()) {
            if *existing == entity {
                return Ok(());
            }
            return Err(ConfigError::ConflictingEntity(entity.name().to_string()));
        }
        tracing::debug!(entity = %entity.name(), fields = entity.fields().len(), "entity registered");
        self.declared.push(entity.clone());
        self.entities.push(entity);
        Ok(())
    }

    pub fn add_entities(&mut self, entities: impl IntoIterator<Item = Entity>) -> Result<(), ConfigError> {
        entities.into_iter().try_for_each(|e| self.add_entity(e))
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name() == name)
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    fn entity_mut(&mut self, name: &str) -> Result<&mut Entity, ConfigError> {
        self.entities
            .iter_mut()
            .find(|e| e.name() == name)
            .ok_or_else(|| ConfigError::UnknownEntity(name.to_string()))
    }

    fn require(&self, name: &str) -> Result<&Entity, ConfigError> {
        self.entity(name).ok_or_else(|| ConfigError::UnknownEntity(name.to_string()))
    }

    pub fn set_field_hidden(&mut self, entity: &str, field: &str, hidden: bool) -> Result<(), ConfigError> {
        self.entity_mut(entity)?.set_field_hidden(field, hidden)
    }

    /// Declare a relation. Many-to-one adds the foreign key field to the source;
    /// many-to-many registers the junction entity. Identical re-declaration is a no-op.
    pub fn add_relation(&mut self, relation: Relation) -> Result<(), ConfigError> {
        if self.relations.contains(&relation) {
            return Ok(());
        }
        let source_pk = self.require(&relation.source)?.primary().clone();
        let target_pk = self.require(&relation.target)?.primary().clone();
        check_identifier(&relation.source_name)?;
        check_identifier(&relation.target_name)?;

        let (from_source, from_target) = relation.paths(&source_pk.name, &target_pk.name);
        for (entity, path) in [(&relation.source, &from_source), (&relation.target, &from_target)] {
            if self.relation(entity, &path.name).is_some() {
                return Err(ConfigError::Relation(format!(
                    "entity '{}' already has a relation named '{}'",
                    entity, path.name
                )));
            }
        }

        match relation.kind {
            RelationKind::ManyToOne => {
                check_identifier(&relation.foreign_key)?;
                let fk = foreign_key(&relation.foreign_key, &relation.target, &target_pk, &relation);
                self.entity_mut(&relation.source)?.add_field(fk)?;
            }
            RelationKind::ManyToMany => {
                if relation.source == relation.target {
                    return Err(ConfigError::Relation(format!(
                        "many-to-many on '{}' needs two distinct entities",
                        relation.source
                    )));
                }
                let junction = Entity::new(
                    relation.junction_name(),
                    [
                        foreign_key(&relation.junction_source_key(), &relation.source, &source_pk, &relation),
                        foreign_key(&relation.junction_target_key(), &relation.target, &target_pk, &relation),
                    ],
                    EntityConfig::default(),
                )?;
                self.add_entity(junction)?;
            }
        }
        tracing::debug!(
            source = %relation.source,
            target = %relation.target,
            kind = ?relation.kind,
            "relation registered"
        );
        self.relations.push(relation);
        Ok(())
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Every relation as seen from `entity`.
    pub fn relations_of(&self, entity: &str) -> Vec<RelationPath> {
        let mut out = Vec::new();
        for r in &self.relations {
            let (Some(source), Some(target)) = (self.entity(&r.source), self.entity(&r.target)) else {
                continue;
            };
            let (from_source, from_target) = r.paths(&source.primary().name, &target.primary().name);
            if r.source == entity {
                out.push(from_source);
            }
            if r.target == entity {
                out.push(from_target);
            }
        }
        out
    }

    /// The relation `entity` reaches under `name` in `with` / `join`.
    pub fn relation(&self, entity: &str, name: &str) -> Option<RelationPath> {
        self.relations_of(entity).into_iter().find(|p| p.name == name)
    }

    /// Declare an index. Fields must be stored fields of the entity.
    pub fn add_index(&mut self, index: EntityIndex) -> Result<(), ConfigError> {
        check_identifier(&index.name)?;
        let entity = self.require(&index.entity)?;
        if index.fields.is_empty() {
            return Err(ConfigError::Index(format!("index '{}' has no fields", index.name)));
        }
        for f in &index.fields {
            if !entity.field(f).is_some_and(Field::is_stored) {
                return Err(ConfigError::UnknownField {
                    entity: index.entity.clone(),
                    field: f.clone(),
                });
            }
        }
        if let Some(existing) = self.indices.iter().find(|i| i.name == index.name) {
            if *existing == index {
                return Ok(());
            }
            return Err(ConfigError::Index(format!(
                "index '{}' already declared with a different definition",
                index.name
            )));
        }
        self.indices.push(index);
        Ok(())
    }

    pub fn indices(&self) -> &[EntityIndex] {
        &self.indices
    }

    pub fn indices_of<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a EntityIndex> + 'a {
        self.indices.iter().filter(move |i| i.entity == entity)
    }

    /// Read access to one entity.
    pub fn repository(&self, entity: &str) -> Result<Repository<'_>, ConfigError> {
        Ok(Repository::new(self, self.require(entity)?))
    }

    /// Write access to one entity.
    pub fn mutator(&self, entity: &str) -> Result<Mutator<'_>, ConfigError> {
        Ok(Mutator::new(self, self.require(entity)?))
    }

    pub fn synchronizer(&self) -> SchemaSynchronizer<'_> {
        SchemaSynchronizer::new(self)
    }
}

fn foreign_key(name: &str, target: &str, target_pk: &Field, relation: &Relation) -> Field {
    Field::relation(name, target, target_pk.key_format().unwrap_or_default())
        .target_key(target_pk.name.clone())
        .on_delete(relation.on_delete)
        .on_update(relation.on_update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SqliteConnection;
    use crate::model::{FieldKind, PrimaryFormat, ReferentialAction, RelationDirection};

    async fn manager() -> EntityManager {
        let conn = SqliteConnection::memory().await.unwrap();
        let mut m = EntityManager::new(Arc::new(conn), IdHandlerRegistry::new());
        m.add_entity(Entity::new("users", [Field::text("username")], EntityConfig::default()).unwrap())
            .unwrap();
        m.add_entity(
            Entity::builder("posts")
                .field(Field::text("title"))
                .primary_format(PrimaryFormat::Uuid)
                .build()
                .unwrap(),
        )
        .unwrap();
        m
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let mut m = manager().await;
        let users = Entity::new("users", [Field::text("username")], EntityConfig::default()).unwrap();
        m.add_entity(users).unwrap();
        assert_eq!(m.entities().len(), 2);
        let other = Entity::new("users", [Field::text("email")], EntityConfig::default()).unwrap();
        assert_eq!(
            m.add_entity(other).unwrap_err(),
            ConfigError::ConflictingEntity("users".into())
        );
    }

    #[tokio::test]
    async fn many_to_one_adds_foreign_key() {
        let mut m = manager().await;
        let rel = Relation::many_to_one("posts", "users").names("author", "posts");
        m.add_relation(rel.clone()).unwrap();
        m.add_relation(rel).unwrap();
        let fk = m.entity("posts").unwrap().field("users_id").unwrap();
        match &fk.kind {
            FieldKind::Relation {
                target,
                target_key,
                target_format,
                on_delete,
                ..
            } => {
                assert_eq!(target, "users");
                assert_eq!(target_key, "id");
                assert_eq!(*target_format, PrimaryFormat::Integer);
                assert_eq!(*on_delete, ReferentialAction::SetNull);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(m.relation("posts", "author").unwrap().direction, RelationDirection::ToOne);
        assert_eq!(m.relation("users", "posts").unwrap().direction, RelationDirection::ToMany);
        // re-adding the declared entity is still a no-op after the fk was applied
        m.add_entity(
            Entity::builder("posts")
                .field(Field::text("title"))
                .primary_format(PrimaryFormat::Uuid)
                .build()
                .unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn many_to_many_registers_junction() {
        let mut m = manager().await;
        m.add_relation(Relation::many_to_many("posts", "users")).unwrap();
        let junction = m.entity("posts_users").unwrap();
        assert_eq!(junction.field("posts_id").unwrap().key_format(), Some(PrimaryFormat::Uuid));
        assert_eq!(junction.field("users_id").unwrap().key_format(), Some(PrimaryFormat::Integer));
    }

    #[tokio::test]
    async fn relation_names_are_unique_per_entity() {
        let mut m = manager().await;
        m.add_relation(Relation::many_to_one("posts", "users")).unwrap();
        let err = m
            .add_relation(Relation::many_to_one("posts", "users").foreign_key("editor_id"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Relation(_)));
    }

    #[tokio::test]
    async fn unknown_entities_fail() {
        let mut m = manager().await;
        assert_eq!(
            m.add_relation(Relation::many_to_one("posts", "tags")).unwrap_err(),
            ConfigError::UnknownEntity("tags".into())
        );
        assert!(m.repository("tags").is_err());
    }

    #[tokio::test]
    async fn indices_validate_fields() {
        let mut m = manager().await;
        m.add_index(EntityIndex::new("users", ["username"]).unique()).unwrap();
        m.add_index(EntityIndex::new("users", ["username"]).unique()).unwrap();
        assert_eq!(m.indices().len(), 1);
        assert!(m.add_index(EntityIndex::new("users", ["username"])).is_err());
        assert!(m.add_index(EntityIndex::new("users", ["nope"])).is_err());
    }
}
