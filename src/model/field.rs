//! Field declarations: typed columns with validation and default rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How primary key values are produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryFormat {
    /// Database auto-increment integer.
    #[default]
    Integer,
    /// Random v4 uuid generated by the mutator.
    Uuid,
    /// Value produced by a registered id handler.
    Custom,
}

impl PrimaryFormat {
    /// Integer keys are numbers on the wire; uuid and custom keys are strings.
    pub fn is_integer(self) -> bool {
        matches!(self, PrimaryFormat::Integer)
    }
}

/// Foreign key action for ON DELETE / ON UPDATE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn as_sql(self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

fn default_target_key() -> String {
    "id".to_string()
}

fn default_on_delete() -> ReferentialAction {
    ReferentialAction::SetNull
}

fn default_on_update() -> ReferentialAction {
    ReferentialAction::NoAction
}

/// Closed set of field types with their type-specific constraints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldKind {
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_length: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<f64>,
    },
    Boolean,
    Date,
    Datetime,
    Json,
    Blob,
    Primary {
        #[serde(default)]
        format: PrimaryFormat,
        /// Registry key; set when `format` is custom.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handler: Option<String>,
    },
    /// Foreign key column created by a declared relation.
    Relation {
        target: String,
        /// Primary key column of `target`.
        #[serde(default = "default_target_key")]
        target_key: String,
        #[serde(default)]
        target_format: PrimaryFormat,
        #[serde(default = "default_on_delete")]
        on_delete: ReferentialAction,
        #[serde(default = "default_on_update")]
        on_update: ReferentialAction,
    },
    /// Never stored; carried for documents and UIs only.
    Virtual,
}

fn default_true() -> bool {
    true
}

/// A typed column declaration. Encoding to driver values happens in the connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "default_true")]
    pub fillable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Field {
            name: name.into(),
            kind,
            required: false,
            default_value: None,
            hidden: false,
            fillable: true,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Text {
                max_length: None,
                min_length: None,
                pattern: None,
            },
        )
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Number {
                minimum: None,
                maximum: None,
            },
        )
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Date)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Datetime)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Json)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Blob)
    }

    pub fn virtual_field(name: impl Into<String>) -> Self {
        let mut f = Self::new(name, FieldKind::Virtual);
        f.fillable = false;
        f
    }

    /// Primary key field. Primary keys are never fillable by callers.
    pub fn primary(name: impl Into<String>, format: PrimaryFormat) -> Self {
        let mut f = Self::new(
            name,
            FieldKind::Primary {
                format,
                handler: None,
            },
        );
        f.fillable = false;
        f
    }

    /// Primary key whose values come from the id handler registered under `handler`.
    pub fn primary_custom(name: impl Into<String>, handler: impl Into<String>) -> Self {
        let mut f = Self::primary(name, PrimaryFormat::Custom);
        f.kind = FieldKind::Primary {
            format: PrimaryFormat::Custom,
            handler: Some(handler.into()),
        };
        f
    }

    /// Foreign key column pointing at `target`'s primary key.
    pub fn relation(name: impl Into<String>, target: impl Into<String>, target_format: PrimaryFormat) -> Self {
        Self::new(
            name,
            FieldKind::Relation {
                target: target.into(),
                target_key: default_target_key(),
                target_format,
                on_delete: default_on_delete(),
                on_update: default_on_update(),
            },
        )
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn not_fillable(mut self) -> Self {
        self.fillable = false;
        self
    }

    /// Ignored for non-text fields.
    pub fn max_length(mut self, n: u32) -> Self {
        if let FieldKind::Text { max_length, .. } = &mut self.kind {
            *max_length = Some(n);
        }
        self
    }

    /// Ignored for non-text fields.
    pub fn min_length(mut self, n: u32) -> Self {
        if let FieldKind::Text { min_length, .. } = &mut self.kind {
            *min_length = Some(n);
        }
        self
    }

    /// Ignored for non-text fields.
    pub fn pattern(mut self, re: impl Into<String>) -> Self {
        if let FieldKind::Text { pattern, .. } = &mut self.kind {
            *pattern = Some(re.into());
        }
        self
    }

    /// Ignored for non-number fields.
    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        if let FieldKind::Number { minimum, maximum } = &mut self.kind {
            *minimum = min;
            *maximum = max;
        }
        self
    }

    /// Ignored for non-relation fields.
    pub fn target_key(mut self, key: impl Into<String>) -> Self {
        if let FieldKind::Relation { target_key, .. } = &mut self.kind {
            *target_key = key.into();
        }
        self
    }

    /// Ignored for non-relation fields.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        if let FieldKind::Relation { on_delete, .. } = &mut self.kind {
            *on_delete = action;
        }
        self
    }

    /// Ignored for non-relation fields.
    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        if let FieldKind::Relation { on_update, .. } = &mut self.kind {
            *on_update = action;
        }
        self
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.kind, FieldKind::Primary { .. })
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, FieldKind::Virtual)
    }

    /// Whether a column exists for this field.
    pub fn is_stored(&self) -> bool {
        !self.is_virtual()
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            FieldKind::Text { .. } => "text",
            FieldKind::Number { .. } => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::Datetime => "datetime",
            FieldKind::Json => "json",
            FieldKind::Blob => "blob",
            FieldKind::Primary { .. } => "primary",
            FieldKind::Relation { .. } => "relation",
            FieldKind::Virtual => "virtual",
        }
    }

    /// Key format of values stored in this field, for primary and relation fields.
    pub fn key_format(&self) -> Option<PrimaryFormat> {
        match &self.kind {
            FieldKind::Primary { format, .. } => Some(*format),
            FieldKind::Relation { target_format, .. } => Some(*target_format),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_sets_text_constraints() {
        let f = Field::text("email").max_length(3).required();
        assert!(f.required);
        assert_eq!(
            f.kind,
            FieldKind::Text {
                max_length: Some(3),
                min_length: None,
                pattern: None
            }
        );
    }

    #[test]
    fn constraint_setters_ignore_other_kinds() {
        let f = Field::boolean("active").max_length(3);
        assert_eq!(f.kind, FieldKind::Boolean);
    }

    #[test]
    fn document_uses_type_tag() {
        let f = Field::text("username").required().default_value("nobody");
        let doc = serde_json::to_value(&f).unwrap();
        assert_eq!(
            doc,
            json!({
                "name": "username",
                "type": "text",
                "required": true,
                "default_value": "nobody",
                "hidden": false,
                "fillable": true
            })
        );
        let back: Field = serde_json::from_value(doc).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn relation_defaults_are_non_destructive() {
        let f: Field = serde_json::from_value(json!({
            "name": "users_id",
            "type": "relation",
            "target": "users"
        }))
        .unwrap();
        match f.kind {
            FieldKind::Relation {
                on_delete,
                on_update,
                target_format,
                ..
            } => {
                assert_eq!(on_delete, ReferentialAction::SetNull);
                assert_eq!(on_update, ReferentialAction::NoAction);
                assert_eq!(target_format, PrimaryFormat::Integer);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(f.fillable);
    }

    #[test]
    fn primary_is_not_fillable() {
        assert!(!Field::primary("id", PrimaryFormat::Uuid).fillable);
        assert_eq!(
            Field::primary_custom("id", "seq").key_format(),
            Some(PrimaryFormat::Custom)
        );
    }
}
