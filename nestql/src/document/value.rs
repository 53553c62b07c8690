use crate::schema::FieldSchema;
use crate::search::{format_date, parse_date};
use bson::oid::ObjectId;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Number, Value};

/// Convert a payload value to BSON, guided by its field schema: ids that
/// are valid ObjectIds become ObjectIds, dates become BSON dates and byte
/// arrays become binary.
pub fn to_bson(schema: &FieldSchema, value: &Value) -> Bson {
    match (schema, value) {
        (_, Value::Null) => Bson::Null,
        (FieldSchema::Id(_), Value::String(s)) => match ObjectId::parse_str(s) {
            Ok(oid) => Bson::ObjectId(oid),
            Err(_) => Bson::String(s.clone()),
        },
        (FieldSchema::Date(_), Value::String(s)) => match parse_date(s) {
            Some(date) => Bson::DateTime(date_to_bson(&date)),
            None => Bson::String(s.clone()),
        },
        (FieldSchema::Binary(_), Value::Array(items)) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: items
                .iter()
                .filter_map(|b| b.as_u64().map(|b| b as u8))
                .collect(),
        }),
        (FieldSchema::Object(object), Value::Object(map)) => {
            let mut doc = Document::new();
            for (key, item) in map {
                let converted = match object.fields.get(key) {
                    Some(field) => to_bson(field, item),
                    None => plain(item),
                };
                doc.insert(key.clone(), converted);
            }
            Bson::Document(doc)
        }
        (FieldSchema::DynamicObject(dynamic), Value::Object(map)) => {
            let mut doc = Document::new();
            for (key, item) in map {
                let converted = match dynamic.matching(key) {
                    Some((_, field)) => to_bson(field, item),
                    None => plain(item),
                };
                doc.insert(key.clone(), converted);
            }
            Bson::Document(doc)
        }
        (FieldSchema::Array(array), Value::Array(items)) => {
            Bson::Array(items.iter().map(|item| to_bson(&array.fields, item)).collect())
        }
        (_, other) => plain(other),
    }
}

/// Schema-less conversion.
pub fn plain(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Bson::Int64(i),
            None => Bson::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(plain).collect()),
        Value::Object(map) => Bson::Document(
            map.iter()
                .map(|(key, item)| (key.clone(), plain(item)))
                .collect(),
        ),
    }
}

/// Convert a stored document back to portable JSON: ObjectIds become hex
/// strings, dates RFC 3339 strings and binary a byte array.
pub fn from_bson(bson: &Bson) -> Value {
    match bson {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Bson::String(s) | Bson::Symbol(s) => Value::String(s.clone()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(date) => match date_from_bson(date) {
            Some(date) => Value::String(format_date(&date)),
            None => Value::Null,
        },
        Bson::Binary(binary) => Value::Array(binary.bytes.iter().map(|b| Value::from(*b)).collect()),
        Bson::Array(items) => Value::Array(items.iter().map(from_bson).collect()),
        Bson::Document(doc) => Value::Object(document_to_json(doc)),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::RegularExpression(regex) => Value::String(regex.pattern.clone()),
        other => Value::String(other.to_string()),
    }
}

pub fn document_to_json(doc: &Document) -> Map<String, Value> {
    doc.iter()
        .map(|(key, value)| (key.clone(), from_bson(value)))
        .collect()
}

pub fn date_to_bson(date: &DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(date.timestamp_millis())
}

fn date_from_bson(date: &bson::DateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(date.timestamp_millis()).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(yaml: &str) -> FieldSchema {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_ids_become_object_ids_when_valid() {
        let id = field("{ type: id, relation: users }");
        let hex = "65f1c0a2b3d4e5f601234567";
        assert!(matches!(to_bson(&id, &json!(hex)), Bson::ObjectId(_)));
        assert_eq!(to_bson(&id, &json!("user-1")), Bson::String("user-1".into()));
    }

    #[test]
    fn test_nested_payload_conversion() {
        let schema = field(
            r#"
type: object
fields:
  at: { type: date }
  raw: { type: binary }
  list:
    type: array
    fields: { type: date }
"#,
        );
        let converted = to_bson(
            &schema,
            &json!({ "at": "2024-01-02T03:04:05Z", "raw": [1, 2], "list": ["2024-01-01T00:00:00Z"] }),
        );
        let Bson::Document(doc) = converted else {
            panic!("expected a document");
        };
        assert!(matches!(doc.get("at"), Some(Bson::DateTime(_))));
        assert!(matches!(doc.get("raw"), Some(Bson::Binary(_))));
        assert!(matches!(doc.get_array("list").unwrap()[0], Bson::DateTime(_)));
    }

    #[test]
    fn test_results_become_portable_json() {
        let oid = ObjectId::parse_str("65f1c0a2b3d4e5f601234567").unwrap();
        let date = parse_date("2024-01-02T03:04:05.678Z").unwrap();
        let doc = bson::doc! {
            "_id": oid,
            "at": date_to_bson(&date),
            "raw": Binary { subtype: BinarySubtype::Generic, bytes: vec![7, 8] },
            "n": 3_i32,
        };
        assert_eq!(
            Value::Object(document_to_json(&doc)),
            json!({
                "_id": "65f1c0a2b3d4e5f601234567",
                "at": "2024-01-02T03:04:05.678Z",
                "raw": [7, 8],
                "n": 3
            })
        );
    }
}
