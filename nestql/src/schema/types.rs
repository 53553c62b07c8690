use crate::config::Settings;
use crate::error::{NestqlError, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Name of the primary key present on every resource.
pub const PRIMARY_KEY: &str = "_id";
/// Soft-deletion marker, present when `enable_deletion` is off.
pub const IS_DELETED: &str = "_isDeleted";
pub const CREATED_AT: &str = "_createdAt";
pub const UPDATED_AT: &str = "_updatedAt";
pub const CREATED_BY: &str = "_createdBy";
pub const UPDATED_BY: &str = "_updatedBy";

/// Ordered field map used by objects and resources.
pub type Fields = IndexMap<String, FieldSchema>;

/// A single node of the recursive field schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldSchema {
    Null(NullField),
    Boolean(BooleanField),
    Integer(IntegerField),
    Float(FloatField),
    String(StringField),
    Date(DateField),
    Binary(BinaryField),
    Id(IdField),
    Object(ObjectField),
    Array(ArrayField),
    DynamicObject(DynamicObjectField),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NullField {
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BooleanField {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub index: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegerField {
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<i64>>,
    #[serde(default)]
    pub minimum: Option<i64>,
    #[serde(default)]
    pub maximum: Option<i64>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloatField {
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<f64>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StringField {
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateField {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinaryField {
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdField {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectField {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub fields: Fields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayField {
    #[serde(default)]
    pub required: bool,
    pub fields: Box<FieldSchema>,
}

/// An object whose keys are not known in advance. Keys are matched against
/// the patterns in declaration order and the first match wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicObjectField {
    #[serde(default)]
    pub required: bool,
    #[serde(default, with = "pattern_fields")]
    pub fields: Vec<(Pattern, FieldSchema)>,
}

impl DynamicObjectField {
    /// Find the first pattern matching `key`, with its position.
    pub fn matching(&self, key: &str) -> Option<(usize, &FieldSchema)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, (pattern, _))| pattern.is_match(key))
            .map(|(i, (_, schema))| (i, schema))
    }
}

/// Compiled key pattern of a dynamic object.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Pattern(Regex::new(pattern)?))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, key: &str) -> bool {
        self.0.is_match(key)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

mod pattern_fields {
    use super::{FieldSchema, Pattern};
    use indexmap::IndexMap;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        fields: &[(Pattern, FieldSchema)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(fields.len()))?;
        for (pattern, schema) in fields {
            map.serialize_entry(pattern.as_str(), schema)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(Pattern, FieldSchema)>, D::Error> {
        let raw = IndexMap::<String, FieldSchema>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(pattern, schema)| {
                Pattern::new(&pattern)
                    .map(|p| (p, schema))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

impl FieldSchema {
    pub fn is_required(&self) -> bool {
        match self {
            FieldSchema::Null(f) => f.required,
            FieldSchema::Boolean(f) => f.required,
            FieldSchema::Integer(f) => f.required,
            FieldSchema::Float(f) => f.required,
            FieldSchema::String(f) => f.required,
            FieldSchema::Date(f) => f.required,
            FieldSchema::Binary(f) => f.required,
            FieldSchema::Id(f) => f.required,
            FieldSchema::Object(f) => f.required,
            FieldSchema::Array(f) => f.required,
            FieldSchema::DynamicObject(f) => f.required,
        }
    }

    pub fn is_unique(&self) -> bool {
        match self {
            FieldSchema::Integer(f) => f.unique,
            FieldSchema::Float(f) => f.unique,
            FieldSchema::String(f) => f.unique,
            FieldSchema::Date(f) => f.unique,
            FieldSchema::Id(f) => f.unique,
            _ => false,
        }
    }

    /// True when the field may be used in filters and sorts.
    pub fn is_indexed(&self) -> bool {
        match self {
            FieldSchema::Boolean(f) => f.index,
            FieldSchema::Integer(f) => f.unique || f.index,
            FieldSchema::Float(f) => f.unique || f.index,
            FieldSchema::String(f) => f.unique || f.index,
            FieldSchema::Date(f) => f.unique || f.index,
            FieldSchema::Id(f) => f.unique || f.index,
            _ => false,
        }
    }

    /// Target resource of an `id` field, if it is a relation.
    pub fn relation(&self) -> Option<&str> {
        match self {
            FieldSchema::Id(f) => f.relation.as_deref(),
            _ => None,
        }
    }

    /// Objects, arrays and dynamic objects are containers; everything else
    /// holds a single value.
    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            FieldSchema::Object(_) | FieldSchema::Array(_) | FieldSchema::DynamicObject(_)
        )
    }

    /// Strip every array layer and return the innermost element schema.
    pub fn innermost(&self) -> &FieldSchema {
        let mut current = self;
        while let FieldSchema::Array(array) = current {
            current = &array.fields;
        }
        current
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldSchema::Null(_) => "null",
            FieldSchema::Boolean(_) => "boolean",
            FieldSchema::Integer(_) => "integer",
            FieldSchema::Float(_) => "float",
            FieldSchema::String(_) => "string",
            FieldSchema::Date(_) => "date",
            FieldSchema::Binary(_) => "binary",
            FieldSchema::Id(_) => "id",
            FieldSchema::Object(_) => "object",
            FieldSchema::Array(_) => "array",
            FieldSchema::DynamicObject(_) => "dynamic_object",
        }
    }
}

/// Definition of one resource (collection / table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchema {
    #[serde(default = "default_true")]
    pub enable_deletion: bool,
    #[serde(default)]
    pub enable_timestamps: bool,
    #[serde(default)]
    pub enable_authors: bool,
    #[serde(default)]
    pub fields: Fields,
}

fn default_true() -> bool {
    true
}

impl ResourceSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    /// Resources without hard deletion flag rows with `_isDeleted` instead.
    pub fn soft_deletes(&self) -> bool {
        !self.enable_deletion
    }
}

/// Top-level model file: engine settings plus every resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub resources: IndexMap<String, ResourceSchema>,
}

/// A loaded, validated model. Immutable once built.
#[derive(Debug, Clone)]
pub struct Model {
    pub settings: Settings,
    resources: IndexMap<String, ResourceSchema>,
}

impl Model {
    pub(crate) fn new(settings: Settings, resources: IndexMap<String, ResourceSchema>) -> Self {
        Model {
            settings,
            resources,
        }
    }

    pub fn resource(&self, name: &str) -> Result<&ResourceSchema> {
        self.resources
            .get(name)
            .ok_or_else(|| NestqlError::UnknownResource(name.to_string()))
    }

    pub fn resources(&self) -> impl Iterator<Item = (&String, &ResourceSchema)> {
        self.resources.iter()
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(|k| k.as_str())
    }
}
