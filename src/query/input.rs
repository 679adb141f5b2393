//! Wire-level query document and its parsed form.
//!
//! `{ limit?, offset?, sort?, where?, select?, join?, with? }` where `sort` is
//! `"field"`, `"-field"` or `{by, dir}`, `where` is an object or a JSON string,
//! `select`/`join` are comma-joined strings or arrays and `with` is a string,
//! an array or an object of nested queries.

use crate::error::QueryError;
use crate::query::expression::{filter_input_from_json, FilterInput};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const DEFAULT_LIMIT: u32 = 10;
pub const MAX_LIMIT: u32 = 1000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub by: String,
    #[serde(default)]
    pub dir: SortDir,
}

impl Default for Sort {
    fn default() -> Self {
        Sort {
            by: "id".into(),
            dir: SortDir::Asc,
        }
    }
}

fn sort_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(-)?([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)$").expect("static regex")
    })
}

impl Sort {
    /// `"field"` → ascending, `"-field"` → descending, anything else → default.
    pub fn parse(s: &str) -> Sort {
        match sort_re().captures(s.trim()) {
            Some(caps) => Sort {
                by: caps[2].to_string(),
                dir: if caps.get(1).is_some() {
                    SortDir::Desc
                } else {
                    SortDir::Asc
                },
            },
            None => Sort::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortInput {
    Str(String),
    Spec(Sort),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListInput {
    Str(String),
    List(Vec<String>),
}

impl ListInput {
    pub fn to_vec(&self) -> Vec<String> {
        let items: Vec<&str> = match self {
            ListInput::Str(s) => s.split(',').collect(),
            ListInput::List(v) => v.iter().map(String::as_str).collect(),
        };
        items
            .into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WithInput {
    Str(String),
    List(Vec<String>),
    Nested(BTreeMap<String, RepoQueryInput>),
}

/// Query document as received from callers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoQueryInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortInput>,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<ListInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<ListInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<WithInput>,
}

/// Limits applied when parsing queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepositoryOptions {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        RepositoryOptions {
            default_limit: DEFAULT_LIMIT,
            max_limit: MAX_LIMIT,
        }
    }
}

/// Parsed query with defaults applied. `where_` is still unconverted input;
/// the repository converts it with its validator.
#[derive(Clone, Debug, PartialEq)]
pub struct RepoQuery {
    pub limit: u32,
    pub offset: u32,
    pub sort: Sort,
    pub where_: FilterInput,
    pub select: Vec<String>,
    pub join: Vec<String>,
    pub with: BTreeMap<String, RepoQuery>,
    /// False when the caller left `sort` out; the repository then sorts by primary key.
    pub explicit_sort: bool,
}

impl Default for RepoQuery {
    fn default() -> Self {
        Self::with_options(&RepositoryOptions::default())
    }
}

impl RepoQuery {
    pub fn with_options(options: &RepositoryOptions) -> Self {
        RepoQuery {
            limit: options.default_limit,
            offset: 0,
            sort: Sort::default(),
            where_: FilterInput::new(),
            select: Vec::new(),
            join: Vec::new(),
            with: BTreeMap::new(),
            explicit_sort: false,
        }
    }

    /// Apply defaults and shape checks to a wire document.
    pub fn parse(input: &RepoQueryInput, options: &RepositoryOptions) -> Result<Self, QueryError> {
        let mut q = Self::with_options(options);
        if let Some(limit) = input.limit {
            q.limit = limit.min(options.max_limit);
        }
        q.offset = input.offset.unwrap_or(0);
        if let Some(sort) = &input.sort {
            q.sort = match sort {
                SortInput::Str(s) => Sort::parse(s),
                SortInput::Spec(spec) => Sort::parse(&spec.by).by_dir(spec.dir),
            };
            q.explicit_sort = true;
        }
        if let Some(w) = &input.where_ {
            q.where_ = filter_input_from_json(w)?;
        }
        if let Some(s) = &input.select {
            q.select = s.to_vec();
        }
        if let Some(j) = &input.join {
            q.join = j.to_vec();
        }
        if let Some(with) = &input.with {
            q.with = match with {
                WithInput::Str(s) => nested_defaults(ListInput::Str(s.clone()).to_vec(), options),
                WithInput::List(v) => nested_defaults(ListInput::List(v.clone()).to_vec(), options),
                WithInput::Nested(map) => map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), RepoQuery::parse(v, options)?)))
                    .collect::<Result<_, QueryError>>()?,
            };
        }
        Ok(q)
    }

    /// Parse a JSON query document.
    pub fn from_json(doc: &Value, options: &RepositoryOptions) -> Result<Self, QueryError> {
        let input = query_input_from_json(doc)?;
        Self::parse(&input, options)
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn sort(mut self, sort: &str) -> Self {
        self.sort = Sort::parse(sort);
        self.explicit_sort = true;
        self
    }

    pub fn filter(mut self, field: &str, value: Value) -> Self {
        self.where_.insert(field.to_string(), Some(value));
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn join(mut self, relation: &str) -> Self {
        self.join.push(relation.to_string());
        self
    }

    pub fn with_relation(mut self, relation: &str, nested: RepoQuery) -> Self {
        self.with.insert(relation.to_string(), nested);
        self
    }
}

impl Sort {
    fn by_dir(mut self, dir: SortDir) -> Self {
        self.dir = dir;
        self
    }
}

fn nested_defaults(names: Vec<String>, options: &RepositoryOptions) -> BTreeMap<String, RepoQuery> {
    names
        .into_iter()
        .map(|n| (n, RepoQuery::with_options(options)))
        .collect()
}

/// Deserialize a query document, naming the key that failed.
fn query_input_from_json(doc: &Value) -> Result<RepoQueryInput, QueryError> {
    let Value::Object(map) = doc else {
        return Err(QueryError::InvalidQuery {
            field: "query".into(),
            reason: format!("expected an object, got {}", doc),
        });
    };
    for (key, value) in map {
        let single = Value::Object(serde_json::Map::from_iter([(key.clone(), value.clone())]));
        if let Err(e) = serde_json::from_value::<RepoQueryInput>(single) {
            return Err(QueryError::InvalidQuery {
                field: key.clone(),
                reason: e.to_string(),
            });
        }
    }
    serde_json::from_value(doc.clone()).map_err(|e| QueryError::InvalidQuery {
        field: "query".into(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sort_strings_decode() {
        assert_eq!(
            Sort::parse("-field"),
            Sort {
                by: "field".into(),
                dir: SortDir::Desc
            }
        );
        assert_eq!(
            Sort::parse("field"),
            Sort {
                by: "field".into(),
                dir: SortDir::Asc
            }
        );
        assert_eq!(Sort::parse("--bad field"), Sort::default());
        assert_eq!(Sort::parse(""), Sort::default());
        assert_eq!(serde_json::to_value(Sort::default()).unwrap(), json!({"by": "id", "dir": "asc"}));
    }

    #[test]
    fn defaults_apply() {
        let q = RepoQuery::parse(&RepoQueryInput::default(), &RepositoryOptions::default()).unwrap();
        assert_eq!(q.limit, 10);
        assert_eq!(q.offset, 0);
        assert_eq!(q.sort, Sort::default());
        assert!(!q.explicit_sort);
    }

    #[test]
    fn parses_full_document() {
        let q = RepoQuery::from_json(
            &json!({
                "limit": 5000,
                "offset": 20,
                "sort": {"by": "username", "dir": "desc"},
                "where": "{\"username\": {\"$like\": \"a*\"}}",
                "select": "id, username",
                "join": ["author"],
                "with": {"posts": {"limit": 3, "sort": "-id", "with": "comments"}}
            }),
            &RepositoryOptions::default(),
        )
        .unwrap();
        assert_eq!(q.limit, MAX_LIMIT);
        assert_eq!(q.offset, 20);
        assert_eq!(q.sort.dir, SortDir::Desc);
        assert_eq!(q.select, vec!["id", "username"]);
        assert_eq!(q.join, vec!["author"]);
        assert!(q.where_.contains_key("username"));
        let posts = &q.with["posts"];
        assert_eq!(posts.limit, 3);
        assert_eq!(posts.sort.by, "id");
        assert!(posts.with.contains_key("comments"));
    }

    #[test]
    fn with_accepts_list_and_string() {
        let opts = RepositoryOptions::default();
        let a = RepoQuery::from_json(&json!({"with": "posts,comments"}), &opts).unwrap();
        let b = RepoQuery::from_json(&json!({"with": ["posts", "comments"]}), &opts).unwrap();
        assert_eq!(a.with, b.with);
        assert_eq!(a.with.len(), 2);
    }

    #[test]
    fn bad_where_fails() {
        let opts = RepositoryOptions::default();
        assert!(RepoQuery::from_json(&json!({"where": "{oops"}), &opts).is_err());
        assert!(RepoQuery::from_json(&json!({"where": 3}), &opts).is_err());
    }

    #[test]
    fn invalid_query_names_field() {
        let opts = RepositoryOptions::default();
        let err = RepoQuery::from_json(&json!({"limit": -1}), &opts).unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery { ref field, .. } if field == "limit"));
        let err = RepoQuery::from_json(&json!({"sort": 5}), &opts).unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery { ref field, .. } if field == "sort"));
        let err = RepoQuery::from_json(&json!([1]), &opts).unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery { ref field, .. } if field == "query"));
    }
}
