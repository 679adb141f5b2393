//! Declared indices over entity fields.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityIndex {
    pub name: String,
    pub entity: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl EntityIndex {
    /// Index named `idx_<entity>_<field>_<field>…`.
    pub fn new<I, S>(entity: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        EntityIndex {
            name: format!("idx_{}_{}", entity, fields.join("_")),
            entity: entity.to_string(),
            fields,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name_joins_fields() {
        let idx = EntityIndex::new("users", ["username", "email"]).unique();
        assert_eq!(idx.name, "idx_users_username_email");
        assert!(idx.unique);
    }
}
