//! Query language for document filtering
//!
//! A query is a conjunction of per-field filters plus zero or more free-text
//! (`$text`) filters. The JSON form accepted by [`Query::parse`] is either a
//! flat object of `field: valueSpec` pairs (implicit AND) or
//! `{ "$and": [ { field: valueSpec }, ... ] }`; both forms may carry
//! `$text: { "$search": "words" }` entries.
//!
//! A `valueSpec` is a literal (exact match, with array fields matching when
//! any element, recursively, equals the literal), `{ "$in": [literal|null] }`
//! (`null` in the list means absent-or-null), or `{ "$regex": "pattern" }`.
//!
//! Rather than inspecting object shape at match time, queries are normalized
//! once into a small tagged AST and evaluated from there.

use crate::document::{index_key, is_absent, Document, ID_FIELD};
use crate::error::DocshardError;
use regex::Regex;
use serde_json::Value;

/// Delimiters used to split free-text search strings into tokens.
///
/// Shared by `$text` query evaluation and the offline index builder so both
/// sides of a search agree on token boundaries. `.` is deliberately not a
/// delimiter; dotted tokens keep their dots and the builder strips a single
/// leading one.
pub const TOKEN_DELIMITERS: &[char] = &[
    ' ', '\t', '\n', '\r', ',', ';', ':', '/', '\\', '(', ')', '[', ']', '{', '}', '"', '\'', '-',
    '_',
];

/// Split a search string into lowercased, trimmed tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(TOKEN_DELIMITERS)
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Apply the index builder's token rules: strip one leading `.`, then keep
/// the token only if its length is within bounds and it contains at least
/// one word character.
pub fn normalize_index_token(token: &str, min_len: usize, max_len: usize) -> Option<String> {
    let token = token.strip_prefix('.').unwrap_or(token);
    if token.len() < min_len || token.len() > max_len {
        return None;
    }
    if !token.chars().any(|c| c.is_alphanumeric()) {
        return None;
    }
    Some(token.to_string())
}

/// How one field is constrained
#[derive(Debug, Clone)]
pub enum ValueSpec {
    /// Exact match; array fields match when any element equals the literal
    Eq(Value),
    /// Match any of the literals; `null` in the list means absent-or-null
    In(Vec<Value>),
    /// Regex tested against the field's string form
    Pattern(Regex),
}

/// One per-field filter
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub spec: ValueSpec,
}

/// A normalized query: AND of field filters, plus `$text` token lists.
///
/// Multiple `$text` filters are OR-ed with each other; within one filter
/// every token must match.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub text: Vec<Vec<String>>,
}

impl Query {
    /// The empty query, matching every live document
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add an exact-match filter
    pub fn eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            spec: ValueSpec::Eq(value),
        });
        self
    }

    /// Add an `$in` filter
    pub fn any_of(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            spec: ValueSpec::In(values),
        });
        self
    }

    /// Add a regex filter
    pub fn pattern(
        mut self,
        field: impl Into<String>,
        pattern: &str,
    ) -> Result<Self, DocshardError> {
        let regex = Regex::new(pattern)
            .map_err(|e| DocshardError::invalid_query(format!("bad $regex: {e}")))?;
        self.filters.push(Filter {
            field: field.into(),
            spec: ValueSpec::Pattern(regex),
        });
        Ok(self)
    }

    /// Add a `$text` filter from a raw search string
    pub fn text(mut self, search: &str) -> Self {
        let tokens = tokenize(search);
        if !tokens.is_empty() {
            self.text.push(tokens);
        }
        self
    }

    /// Normalize a JSON query object into the AST
    pub fn parse(value: &Value) -> Result<Self, DocshardError> {
        let object = value
            .as_object()
            .ok_or_else(|| DocshardError::invalid_query("query must be a JSON object"))?;

        let mut query = Query::empty();
        for (field, spec) in object {
            if field == "$and" {
                let clauses = spec.as_array().ok_or_else(|| {
                    DocshardError::invalid_query("$and must hold an array of clauses")
                })?;
                for clause in clauses {
                    let clause = clause.as_object().ok_or_else(|| {
                        DocshardError::invalid_query("$and clauses must be objects")
                    })?;
                    for (field, spec) in clause {
                        query.push_entry(field, spec)?;
                    }
                }
            } else {
                query.push_entry(field, spec)?;
            }
        }
        Ok(query)
    }

    fn push_entry(&mut self, field: &str, spec: &Value) -> Result<(), DocshardError> {
        if field == "$text" {
            let search = spec
                .get("$search")
                .and_then(Value::as_str)
                .ok_or_else(|| DocshardError::invalid_query("$text requires a $search string"))?;
            let tokens = tokenize(search);
            if !tokens.is_empty() {
                self.text.push(tokens);
            }
            return Ok(());
        }

        let spec = match spec {
            Value::Object(o) if o.contains_key("$in") => {
                let values = o
                    .get("$in")
                    .and_then(Value::as_array)
                    .ok_or_else(|| DocshardError::invalid_query("$in must hold an array"))?;
                ValueSpec::In(values.clone())
            }
            Value::Object(o) if o.contains_key("$regex") => {
                let pattern = o
                    .get("$regex")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DocshardError::invalid_query("$regex must be a string"))?;
                let regex = Regex::new(pattern)
                    .map_err(|e| DocshardError::invalid_query(format!("bad $regex: {e}")))?;
                ValueSpec::Pattern(regex)
            }
            other => ValueSpec::Eq(other.clone()),
        };
        self.filters.push(Filter {
            field: field.to_string(),
            spec,
        });
        Ok(())
    }

    /// True when the query has no filters at all
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.text.is_empty()
    }

    /// The id of a query that is exactly `{_id: scalar}`, the one query
    /// shape answered strictly from the id index.
    pub fn single_id(&self) -> Option<&Value> {
        if self.filters.len() != 1 || !self.text.is_empty() {
            return None;
        }
        let filter = &self.filters[0];
        if filter.field != ID_FIELD {
            return None;
        }
        match &filter.spec {
            ValueSpec::Eq(v) if index_key(v).is_some() => Some(v),
            _ => None,
        }
    }

    /// All literal values constraining `field`, when the constraint is an
    /// `Eq` or `$in` (used for shard fan-out restriction).
    pub fn literal_values_for(&self, field: &str) -> Option<Vec<&Value>> {
        for filter in &self.filters {
            if filter.field != field {
                continue;
            }
            match &filter.spec {
                ValueSpec::Eq(v) => return Some(vec![v]),
                ValueSpec::In(vs) => return Some(vs.iter().collect()),
                ValueSpec::Pattern(_) => return None,
            }
        }
        None
    }

    /// Deterministic string form, used as the result-cache key
    pub fn cache_key(&self) -> String {
        use std::fmt::Write;
        let mut key = String::new();
        for filter in &self.filters {
            match &filter.spec {
                ValueSpec::Eq(v) => {
                    let _ = write!(key, "{}={};", filter.field, v);
                }
                ValueSpec::In(vs) => {
                    let _ = write!(key, "{}$in[", filter.field);
                    for v in vs {
                        let _ = write!(key, "{v},");
                    }
                    key.push_str("];");
                }
                ValueSpec::Pattern(re) => {
                    let _ = write!(key, "{}~{};", filter.field, re.as_str());
                }
            }
        }
        for tokens in &self.text {
            let _ = write!(key, "$text[{}];", tokens.join(" "));
        }
        key
    }

    /// Exhaustively match one document against the whole query.
    ///
    /// `$text` filters are satisfied when every token of at least one filter
    /// appears (case-insensitively) in the string form of some field; this
    /// checks every field, which is slightly broader than the indexed path's
    /// fixed searchable field set.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| filter_matches(f, doc)) && self.text_matches(doc)
    }

    /// Match one document against a subset of the filters (the ones an
    /// index lookup could not resolve), plus the `$text` filters when
    /// `include_text` is set.
    pub fn matches_residual(&self, doc: &Document, residual: &[usize], include_text: bool) -> bool {
        residual
            .iter()
            .all(|&i| filter_matches(&self.filters[i], doc))
            && (!include_text || self.text_matches(doc))
    }

    fn text_matches(&self, doc: &Document) -> bool {
        if self.text.is_empty() {
            return true;
        }
        self.text.iter().any(|tokens| {
            tokens
                .iter()
                .all(|token| doc.values().any(|v| value_contains_token(v, token)))
        })
    }
}

/// Match a single filter against a document field
pub fn filter_matches(filter: &Filter, doc: &Document) -> bool {
    let actual = doc.get(&filter.field);
    match &filter.spec {
        ValueSpec::Eq(expected) => literal_matches(actual, expected),
        ValueSpec::In(expected) => expected.iter().any(|e| literal_matches(actual, e)),
        ValueSpec::Pattern(regex) => pattern_matches(actual, regex),
    }
}

/// Literal equality with array-element and absent-or-null semantics:
/// a `null` literal matches a missing or null field, and an array field
/// matches when any element (recursively through nested arrays) matches.
fn literal_matches(actual: Option<&Value>, expected: &Value) -> bool {
    if expected.is_null() {
        return is_absent(actual);
    }
    match actual {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => items.iter().any(|item| literal_matches(Some(item), expected)),
        Some(value) => value == expected,
    }
}

fn pattern_matches(actual: Option<&Value>, regex: &Regex) -> bool {
    match actual {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| pattern_matches(Some(item), regex)),
        Some(Value::String(s)) => regex.is_match(s),
        Some(Value::Number(n)) => regex.is_match(&n.to_string()),
        Some(Value::Bool(b)) => regex.is_match(&b.to_string()),
        Some(Value::Object(_)) => false,
    }
}

/// Case-insensitive substring test of a token against a field's string form
fn value_contains_token(value: &Value, token: &str) -> bool {
    let text = match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    text.contains(token)
}
