//! Relations between entities and the paths queries follow to load them.

use crate::model::field::ReferentialAction;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Source holds a foreign key to target.
    ManyToOne,
    /// A junction entity holds foreign keys to both sides.
    ManyToMany,
}

/// Declared association. One-to-many is declared from the "one" side and
/// stored as the inverse many-to-one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub kind: RelationKind,
    pub source: String,
    pub target: String,
    /// Name the source uses to reach the target in `with` / `join`.
    pub source_name: String,
    /// Name the target uses to reach the source.
    pub target_name: String,
    /// Foreign key field on the source (many-to-one only).
    pub foreign_key: String,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl Relation {
    fn new(kind: RelationKind, source: &str, target: &str) -> Self {
        Relation {
            kind,
            source: source.to_string(),
            target: target.to_string(),
            source_name: target.to_string(),
            target_name: source.to_string(),
            foreign_key: format!("{}_id", target),
            on_delete: ReferentialAction::SetNull,
            on_update: ReferentialAction::NoAction,
        }
    }

    /// `source` rows point at one `target` row each (e.g. posts → users).
    pub fn many_to_one(source: &str, target: &str) -> Self {
        Self::new(RelationKind::ManyToOne, source, target)
    }

    /// `one` has many `many` rows; the foreign key lives on `many`.
    pub fn one_to_many(one: &str, many: &str) -> Self {
        Self::many_to_one(many, one)
    }

    pub fn many_to_many(source: &str, target: &str) -> Self {
        Self::new(RelationKind::ManyToMany, source, target)
    }

    pub fn foreign_key(mut self, name: impl Into<String>) -> Self {
        self.foreign_key = name.into();
        self
    }

    /// Override the names each side uses for the other.
    pub fn names(mut self, source_name: impl Into<String>, target_name: impl Into<String>) -> Self {
        self.source_name = source_name.into();
        self.target_name = target_name.into();
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }

    /// Junction entity name for many-to-many relations.
    pub fn junction_name(&self) -> String {
        format!("{}_{}", self.source, self.target)
    }

    pub fn junction_source_key(&self) -> String {
        format!("{}_id", self.source)
    }

    pub fn junction_target_key(&self) -> String {
        format!("{}_id", self.target)
    }

    /// Paths seen from the source and target sides.
    pub(crate) fn paths(&self, source_pk: &str, target_pk: &str) -> (RelationPath, RelationPath) {
        match self.kind {
            RelationKind::ManyToOne => (
                RelationPath {
                    name: self.source_name.clone(),
                    direction: RelationDirection::ToOne,
                    related: self.target.clone(),
                    our_key: self.foreign_key.clone(),
                    their_key: target_pk.to_string(),
                    junction: None,
                },
                RelationPath {
                    name: self.target_name.clone(),
                    direction: RelationDirection::ToMany,
                    related: self.source.clone(),
                    our_key: target_pk.to_string(),
                    their_key: self.foreign_key.clone(),
                    junction: None,
                },
            ),
            RelationKind::ManyToMany => (
                RelationPath {
                    name: self.source_name.clone(),
                    direction: RelationDirection::ManyToMany,
                    related: self.target.clone(),
                    our_key: source_pk.to_string(),
                    their_key: target_pk.to_string(),
                    junction: Some(Junction {
                        entity: self.junction_name(),
                        our_key: self.junction_source_key(),
                        their_key: self.junction_target_key(),
                    }),
                },
                RelationPath {
                    name: self.target_name.clone(),
                    direction: RelationDirection::ManyToMany,
                    related: self.source.clone(),
                    our_key: target_pk.to_string(),
                    their_key: source_pk.to_string(),
                    junction: Some(Junction {
                        entity: self.junction_name(),
                        our_key: self.junction_target_key(),
                        their_key: self.junction_source_key(),
                    }),
                },
            ),
        }
    }
}

/// Shape of the related data: one object, or a list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationDirection {
    /// We hold the foreign key to them.
    ToOne,
    /// They hold a foreign key to us.
    ToMany,
    /// Linked through a junction entity.
    ManyToMany,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Junction {
    pub entity: String,
    /// Junction column referencing our key.
    pub our_key: String,
    /// Junction column referencing their key.
    pub their_key: String,
}

/// A relation seen from one entity: how to load `related` rows for it.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationPath {
    pub name: String,
    pub direction: RelationDirection,
    pub related: String,
    /// Our column used in the lookup.
    pub our_key: String,
    /// Their column matched against `our_key` values (through the junction when present).
    pub their_key: String,
    pub junction: Option<Junction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_to_many_is_inverse_many_to_one() {
        assert_eq!(
            Relation::one_to_many("users", "posts"),
            Relation::many_to_one("posts", "users")
        );
    }

    #[test]
    fn many_to_one_paths() {
        let r = Relation::many_to_one("posts", "users");
        let (from_posts, from_users) = r.paths("id", "id");
        assert_eq!(from_posts.name, "users");
        assert_eq!(from_posts.direction, RelationDirection::ToOne);
        assert_eq!(from_posts.our_key, "users_id");
        assert_eq!(from_users.name, "posts");
        assert_eq!(from_users.direction, RelationDirection::ToMany);
        assert_eq!(from_users.their_key, "users_id");
    }

    #[test]
    fn many_to_many_uses_junction() {
        let r = Relation::many_to_many("posts", "tags");
        assert_eq!(r.junction_name(), "posts_tags");
        let (from_posts, from_tags) = r.paths("id", "id");
        let j = from_posts.junction.unwrap();
        assert_eq!(j.our_key, "posts_id");
        assert_eq!(j.their_key, "tags_id");
        assert_eq!(from_tags.junction.unwrap().our_key, "tags_id");
    }
}
