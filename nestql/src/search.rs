use crate::config::Settings;
use crate::error::{NestqlError, Result};
use crate::projection::{self, ProjectionTree};
use crate::schema::{FieldSchema, Model};
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl TryFrom<i8> for SortOrder {
    type Error = String;

    fn try_from(value: i8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(SortOrder::Asc),
            -1 => Ok(SortOrder::Desc),
            other => Err(format!("sort order must be 1 or -1, got {other}")),
        }
    }
}

impl From<SortOrder> for i8 {
    fn from(order: SortOrder) -> i8 {
        match order {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        }
    }
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Free-text search over a set of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextQuery {
    pub on: Vec<String>,
    pub text: String,
}

/// A filter value. On the wire an array is a set of accepted values and
/// anything else is compared for equality; [`FilterValue::for_field`] gives
/// date fields their range semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum FilterValue {
    Equals(Value),
    OneOf(Vec<Value>),
    DateRange(DateTime<Utc>, DateTime<Utc>),
    Since(DateTime<Utc>),
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => FilterValue::OneOf(items),
            other => FilterValue::Equals(other),
        }
    }
}

impl FilterValue {
    /// Classify against the filtered field. On a date field an array of
    /// exactly two dates is an inclusive range and a bare date is a lower
    /// bound; every other field keeps equality and membership.
    pub fn for_field(self, schema: &FieldSchema) -> FilterValue {
        if !matches!(schema, FieldSchema::Date(_)) {
            return match self {
                FilterValue::DateRange(..) | FilterValue::Since(..) => match Value::from(self) {
                    Value::Array(items) => FilterValue::OneOf(items),
                    other => FilterValue::Equals(other),
                },
                other => other,
            };
        }
        match self {
            FilterValue::Equals(Value::String(s)) => match parse_date(&s) {
                Some(date) => FilterValue::Since(date),
                None => FilterValue::Equals(Value::String(s)),
            },
            FilterValue::OneOf(items) => {
                let range = match items.as_slice() {
                    [Value::String(a), Value::String(b)] => parse_date(a).zip(parse_date(b)),
                    _ => None,
                };
                match range {
                    Some((start, end)) => FilterValue::DateRange(start, end),
                    None => FilterValue::OneOf(items),
                }
            }
            other => other,
        }
    }
}

impl From<FilterValue> for Value {
    fn from(filter: FilterValue) -> Value {
        match filter {
            FilterValue::Equals(value) => value,
            FilterValue::OneOf(values) => Value::Array(values),
            FilterValue::DateRange(start, end) => {
                Value::Array(vec![format_date(&start).into(), format_date(&end).into()])
            }
            FilterValue::Since(date) => format_date(&date).into(),
        }
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Canonical text form of a date: RFC 3339, millisecond precision, `Z`.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Split search text into lowercase tokens on whitespace and punctuation.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

/// Search parameters as received from the caller (camelCase on the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub resource: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub filters: IndexMap<String, FilterValue>,
    #[serde(default)]
    pub query: Option<TextQuery>,
    #[serde(default)]
    pub sort_by: Vec<String>,
    #[serde(default)]
    pub sort_order: Vec<SortOrder>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub max_depth: Option<usize>,
}

impl SearchRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        SearchRequest {
            resource: resource.into(),
            ..Default::default()
        }
    }
}

/// A request checked against the model, shared by both query builders.
#[derive(Debug, Clone)]
pub struct ResolvedSearch {
    pub resource: String,
    /// Fields returned to the caller.
    pub projection: ProjectionTree,
    /// Fields touched by filters, the text query and the sort.
    pub filter_tree: ProjectionTree,
    pub filters: Vec<(String, FilterValue)>,
    /// Fields searched and lowercase tokens; `None` when the text has no
    /// tokens.
    pub query: Option<(Vec<String>, Vec<String>)>,
    pub sort: Vec<(String, SortOrder)>,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl ResolvedSearch {
    pub fn resolve(model: &Model, request: &SearchRequest) -> Result<Self> {
        let max_depth = request
            .max_depth
            .unwrap_or(model.settings.default_max_depth);
        let projection = projection::resolve(
            model,
            &request.resource,
            &request.fields,
            max_depth,
            false,
        )?;
        let sort = sort_pairs(&model.settings, &request.sort_by, &request.sort_order)?;

        let query = request.query.as_ref().and_then(|q| {
            let tokens = tokenize(&q.text);
            (!tokens.is_empty() && !q.on.is_empty()).then(|| (q.on.clone(), tokens))
        });

        let mut filter_paths: Vec<String> = request.filters.keys().cloned().collect();
        if let Some((on, _)) = &query {
            filter_paths.extend(on.iter().cloned());
        }
        filter_paths.extend(sort.iter().map(|(field, _)| field.clone()));

        let filter_tree = if filter_paths.is_empty() {
            ProjectionTree::new()
        } else {
            projection::resolve(model, &request.resource, &filter_paths, max_depth, true)?
        };

        let filters = request
            .filters
            .iter()
            .map(|(path, filter)| {
                let schema = projection::field_at(model, &request.resource, path)?;
                Ok((path.clone(), filter.clone().for_field(schema)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ResolvedSearch {
            resource: request.resource.clone(),
            projection,
            filter_tree,
            filters,
            query,
            sort,
            offset: request.offset,
            limit: request.limit,
        })
    }

    /// Projection and filter trees merged: everything a query must join.
    pub fn joined_tree(&self) -> ProjectionTree {
        let mut tree = self.projection.clone();
        projection::merge(&mut tree, &self.filter_tree);
        tree
    }
}

/// Pair sort fields with their orders. Empty input falls back to the
/// configured default ordering.
pub fn sort_pairs(
    settings: &Settings,
    sort_by: &[String],
    sort_order: &[SortOrder],
) -> Result<Vec<(String, SortOrder)>> {
    let (by, order) = if sort_by.is_empty() && sort_order.is_empty() {
        (
            settings.default_sort_by.as_slice(),
            settings.default_sort_order.as_slice(),
        )
    } else {
        (sort_by, sort_order)
    };
    if by.len() != order.len() {
        return Err(NestqlError::InvalidSorting(format!(
            "{} sort fields but {} sort orders",
            by.len(),
            order.len()
        )));
    }
    Ok(by.iter().cloned().zip(order.iter().copied()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_model_str;
    use serde_json::json;

    fn dated_model() -> Model {
        parse_model_str(
            r#"
resources:
  posts:
    fields:
      code: { type: string, index: true }
      published: { type: date, index: true }
"#,
        )
        .unwrap()
    }

    fn resolved_filter(path: &str, value: Value) -> FilterValue {
        let mut request = SearchRequest::new("posts");
        request
            .filters
            .insert(path.into(), serde_json::from_value(value).unwrap());
        let resolved = ResolvedSearch::resolve(&dated_model(), &request).unwrap();
        resolved.filters[0].1.clone()
    }

    #[test]
    fn test_filter_value_classification() {
        let range = resolved_filter("published", json!(["2024-01-01T00:00:00Z", "2024-02-01T00:00:00Z"]));
        assert!(matches!(range, FilterValue::DateRange(_, _)));

        let set: FilterValue = serde_json::from_value(json!(["a", "b", "c"])).unwrap();
        assert_eq!(set, FilterValue::OneOf(vec![json!("a"), json!("b"), json!("c")]));

        let FilterValue::Since(date) = resolved_filter("published", json!("2024-01-01T10:00:00+02:00")) else {
            panic!("expected a lower bound");
        };
        assert_eq!(format_date(&date), "2024-01-01T08:00:00.000Z");

        let plain: FilterValue = serde_json::from_value(json!("draft")).unwrap();
        assert_eq!(plain, FilterValue::Equals(json!("draft")));
    }

    #[test]
    fn test_date_looking_values_on_other_fields_stay_equalities() {
        assert_eq!(
            resolved_filter("code", json!("2024-06-01T00:00:00Z")),
            FilterValue::Equals(json!("2024-06-01T00:00:00Z"))
        );
        assert_eq!(
            resolved_filter("code", json!(["2024-01-01T00:00:00Z", "2024-02-01T00:00:00Z"])),
            FilterValue::OneOf(vec![json!("2024-01-01T00:00:00Z"), json!("2024-02-01T00:00:00Z")])
        );
        assert_eq!(
            resolved_filter("published", json!("soon")),
            FilterValue::Equals(json!("soon"))
        );
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Hello, wORLD!  rust-lang"), vec!["hello", "world", "rust", "lang"]);
        assert!(tokenize(" ,.; ").is_empty());
    }

    #[test]
    fn test_request_wire_format() {
        let request: SearchRequest = serde_json::from_value(json!({
            "resource": "posts",
            "fields": ["title"],
            "filters": { "status": ["draft", "published"] },
            "query": { "on": ["title"], "text": "rust" },
            "sortBy": ["title"],
            "sortOrder": [-1],
            "offset": 10,
            "limit": 5,
            "maxDepth": 2
        }))
        .unwrap();
        assert_eq!(request.sort_order, vec![SortOrder::Desc]);
        assert_eq!(request.max_depth, Some(2));
        assert_eq!(request.limit, Some(5));

        let bad: std::result::Result<SearchRequest, _> =
            serde_json::from_value(json!({ "resource": "posts", "sortOrder": [2] }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_sort_pairs() {
        let settings = Settings::default();
        assert_eq!(
            sort_pairs(&settings, &[], &[]).unwrap(),
            vec![("_id".to_string(), SortOrder::Asc)]
        );
        let err = sort_pairs(&settings, &["title".to_string()], &[]).unwrap_err();
        assert!(matches!(err, NestqlError::InvalidSorting(_)));
    }

    #[test]
    fn test_resolved_search_trees() {
        let model = parse_model_str(
            r#"
resources:
  users:
    fields:
      name: { type: string, index: true }
  posts:
    fields:
      title: { type: string, index: true }
      body: { type: string }
      author: { type: id, relation: users, index: true }
"#,
        )
        .unwrap();
        let mut request = SearchRequest::new("posts");
        request.fields = vec!["title".into()];
        request
            .filters
            .insert("author.name".into(), FilterValue::Equals(json!("ada")));
        request.query = Some(TextQuery {
            on: vec!["title".into()],
            text: "  ".into(),
        });

        let resolved = ResolvedSearch::resolve(&model, &request).unwrap();
        assert!(resolved.query.is_none());
        assert!(resolved.projection.contains_key("title"));
        assert!(!resolved.projection.contains_key("author"));
        assert!(resolved.filter_tree["author"].subtree().unwrap().contains_key("name"));
        assert!(resolved.joined_tree().contains_key("author"));

        request.filters.insert("body".into(), FilterValue::Equals(json!("x")));
        let err = ResolvedSearch::resolve(&model, &request).unwrap_err();
        assert!(matches!(err, NestqlError::UnindexedField { .. }));
    }
}
