//! Raw CRM record to [`Record`] mapping.
//!
//! Normalization is pure: the same raw record and field definitions always
//! produce the same [`Record`], so a replayed page rewrites identical rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use crmsync_core::{
    FieldDefinition, FieldType, FieldValue, NormalizationError, RawRecord, Record, RelationValue,
    DISPLAY_SUFFIX, RELATION_IDS_SUFFIX,
};
use serde_json::Value as JsonValue;

/// Integers below this are treated as epoch seconds rather than millis.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

pub struct RecordNormalizer {
    object_api_name: String,
    fields: Vec<FieldDefinition>,
}

/// Best-effort id of a raw record, for error reporting.
pub fn raw_id(raw: &RawRecord) -> Option<String> {
    ["_id", "id"]
        .iter()
        .find_map(|key| raw.get(*key).and_then(JsonValue::as_str))
        .map(str::to_string)
}

impl RecordNormalizer {
    pub fn new(object_api_name: impl Into<String>, fields: Vec<FieldDefinition>) -> Self {
        Self {
            object_api_name: object_api_name.into(),
            fields,
        }
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<Record, NormalizationError> {
        let id = match raw.get("_id").or_else(|| raw.get("id")) {
            Some(JsonValue::String(id)) if !id.trim().is_empty() => id.clone(),
            Some(_) => return Err(NormalizationError::new("_id", "record id must be a non-empty string")),
            None => return Err(NormalizationError::new("_id", "record has no id")),
        };

        let mut record = Record {
            id,
            object_api_name: self.object_api_name.clone(),
            fields: Default::default(),
        };
        for field in &self.fields {
            let value = if field.is_relation {
                normalize_relation(field, raw)?
            } else {
                let raw_value = raw.get(&field.api_name).unwrap_or(&JsonValue::Null);
                normalize_scalar(field, raw_value)?
            };
            record.fields.insert(field.api_name.clone(), value);
        }
        Ok(record)
    }
}

fn normalize_scalar(field: &FieldDefinition, value: &JsonValue) -> Result<FieldValue, NormalizationError> {
    if value.is_null() {
        return Ok(FieldValue::Null);
    }
    let fail = |reason: String| NormalizationError::new(field.api_name.clone(), reason);

    match field.field_type {
        FieldType::Text
        | FieldType::LongText
        | FieldType::SingleSelect
        | FieldType::Url
        | FieldType::Email
        | FieldType::Phone
        | FieldType::LockRule
        | FieldType::Lookup => match value {
            JsonValue::String(s) => Ok(FieldValue::Text(s.clone())),
            JsonValue::Number(n) => Ok(FieldValue::Text(n.to_string())),
            JsonValue::Bool(b) => Ok(FieldValue::Text(b.to_string())),
            other => Err(fail(format!("expected a scalar, got {}", json_kind(other)))),
        },
        FieldType::Number | FieldType::Currency | FieldType::Percent => {
            let number = match value {
                JsonValue::Number(n) => n.as_f64(),
                JsonValue::String(s) if s.trim().is_empty() => return Ok(FieldValue::Null),
                JsonValue::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match number {
                Some(n) if n.is_finite() => Ok(FieldValue::Number(n)),
                _ => Err(fail(format!("`{value}` is not a number"))),
            }
        }
        FieldType::Date | FieldType::DateTime => match value {
            JsonValue::String(s) if s.trim().is_empty() => Ok(FieldValue::Null),
            _ => parse_timestamp(value)
                .map(FieldValue::Timestamp)
                .ok_or_else(|| fail(format!("`{value}` is not a recognizable date"))),
        },
        FieldType::Boolean => {
            let parsed = match value {
                JsonValue::Bool(b) => Some(*b),
                JsonValue::Number(n) => match n.as_i64() {
                    Some(0) => Some(false),
                    Some(1) => Some(true),
                    _ => None,
                },
                JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Some(true),
                    "false" | "0" => Some(false),
                    _ => None,
                },
                _ => None,
            };
            parsed
                .map(FieldValue::Boolean)
                .ok_or_else(|| fail(format!("`{value}` is not a boolean")))
        }
        FieldType::MultiSelect => match value {
            JsonValue::String(s) => Ok(FieldValue::List(vec![s.clone()])),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| match item {
                    JsonValue::String(s) => Ok(s.clone()),
                    JsonValue::Number(n) => Ok(n.to_string()),
                    JsonValue::Bool(b) => Ok(b.to_string()),
                    other => Err(fail(format!("option must be a scalar, got {}", json_kind(other)))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::List),
            other => Err(fail(format!("expected a list of options, got {}", json_kind(other)))),
        },
        FieldType::Unknown => Ok(FieldValue::Json(value.clone())),
    }
}

fn normalize_relation(field: &FieldDefinition, raw: &RawRecord) -> Result<FieldValue, NormalizationError> {
    let fail = |reason: &str| NormalizationError::new(field.api_name.clone(), reason);
    let mut relation = RelationValue::default();
    let mut ids = Vec::new();

    match raw.get(&field.api_name).unwrap_or(&JsonValue::Null) {
        JsonValue::Null => {}
        JsonValue::String(id) => ids.push(id.clone()),
        JsonValue::Array(items) => ids.extend(id_list(items).ok_or_else(|| fail("relation ids must be strings"))?),
        JsonValue::Object(map) => {
            match map.get("ids").unwrap_or(&JsonValue::Null) {
                JsonValue::Null => {}
                JsonValue::Array(items) => {
                    ids.extend(id_list(items).ok_or_else(|| fail("relation ids must be strings"))?)
                }
                _ => return Err(fail("relation `ids` must be an array")),
            }
            relation.display_text = match map.get("display").or_else(|| map.get("name")) {
                None | Some(JsonValue::Null) => None,
                Some(JsonValue::String(s)) => Some(s.clone()),
                Some(_) => return Err(fail("relation display must be a string")),
            };
        }
        _ => return Err(fail("relation must be an id, a list of ids or an object")),
    }

    match raw.get(&format!("{}{}", field.api_name, RELATION_IDS_SUFFIX)) {
        None | Some(JsonValue::Null) => {}
        Some(JsonValue::Array(items)) => {
            ids.extend(id_list(items).ok_or_else(|| fail("relation ids must be strings"))?)
        }
        Some(_) => return Err(fail("relation id list must be an array")),
    }
    if relation.display_text.is_none() {
        relation.display_text = match raw.get(&format!("{}{}", field.api_name, DISPLAY_SUFFIX)) {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) => Some(s.clone()),
            Some(_) => return Err(fail("relation display must be a string")),
        };
    }

    for id in ids {
        if !id.is_empty() && !relation.related_ids.contains(&id) {
            relation.related_ids.push(id);
        }
    }
    Ok(FieldValue::Relation(relation))
}

fn id_list(items: &[JsonValue]) -> Option<Vec<String>> {
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn epoch_to_millis(value: i64) -> i64 {
    if value.abs() < SECONDS_CUTOFF {
        value * 1000
    } else {
        value
    }
}

/// Epoch millis from integer millis/seconds, numeric strings, RFC 3339,
/// `YYYY-MM-DD HH:MM:SS` (UTC) or `YYYY-MM-DD` (UTC midnight).
pub fn parse_timestamp(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .map(epoch_to_millis),
        JsonValue::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                return Some(epoch_to_millis(n));
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc).timestamp_millis());
            }
            for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(naive.and_utc().timestamp_millis());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    fn site_fields() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("name", "Name", FieldType::Text),
            FieldDefinition::new("supplier", "Supplier", FieldType::Lookup),
            FieldDefinition::new("capacity", "Capacity", FieldType::Percent),
            FieldDefinition::new("inspected_at", "Inspected", FieldType::DateTime),
            FieldDefinition::new("tags", "Tags", FieldType::MultiSelect),
            FieldDefinition::new("active", "Active", FieldType::Boolean),
            FieldDefinition::new("geo", "Geo", FieldType::Unknown),
        ]
    }

    fn normalizer() -> RecordNormalizer {
        RecordNormalizer::new("site_record__c", site_fields())
    }

    #[test]
    fn absent_fields_become_explicit_nulls() {
        let record = normalizer().normalize(&raw(json!({"_id": "s1"}))).unwrap();
        assert_eq!(record.fields.len(), 7);
        assert_eq!(record.field("name"), Some(&FieldValue::Null));
        assert_eq!(
            record.field("supplier"),
            Some(&FieldValue::Relation(RelationValue::default()))
        );
    }

    #[test]
    fn id_falls_back_to_plain_id_and_must_be_a_string() {
        let record = normalizer().normalize(&raw(json!({"id": "s2"}))).unwrap();
        assert_eq!(record.id, "s2");
        let err = normalizer().normalize(&raw(json!({"_id": 42}))).unwrap_err();
        assert_eq!(err.field, "_id");
        assert!(normalizer().normalize(&raw(json!({"name": "x"}))).is_err());
    }

    #[test]
    fn relation_shapes_are_unified_and_deduplicated() {
        let n = normalizer();
        let from_object = n
            .normalize(&raw(json!({"_id": "a", "supplier": {"ids": ["x", "y", "x"], "name": "X, Y"}})))
            .unwrap();
        let from_array = n
            .normalize(&raw(json!({"_id": "a", "supplier": ["x", "y"], "supplier__r": "X, Y"})))
            .unwrap();
        let from_siblings = n
            .normalize(&raw(json!({"_id": "a", "supplier__relation_ids": ["x", "y"], "supplier__r": "X, Y"})))
            .unwrap();
        assert_eq!(from_object, from_array);
        assert_eq!(from_array, from_siblings);

        let single = n.normalize(&raw(json!({"_id": "b", "supplier": "x"}))).unwrap();
        assert_eq!(
            single.field("supplier"),
            Some(&FieldValue::Relation(RelationValue {
                display_text: None,
                related_ids: vec!["x".into()],
            }))
        );
    }

    #[test]
    fn malformed_relation_is_a_field_error() {
        let err = normalizer()
            .normalize(&raw(json!({"_id": "a", "supplier": {"ids": "x"}})))
            .unwrap_err();
        assert_eq!(err.field, "supplier");
        let err = normalizer()
            .normalize(&raw(json!({"_id": "a", "supplier": [1, 2]})))
            .unwrap_err();
        assert_eq!(err.field, "supplier");
    }

    #[test]
    fn dates_accept_every_supported_shape() {
        let expected = 1_740_000_000_000i64;
        assert_eq!(parse_timestamp(&json!(expected)), Some(expected));
        assert_eq!(parse_timestamp(&json!(1_740_000_000i64)), Some(expected));
        assert_eq!(parse_timestamp(&json!("1740000000000")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2025-02-19T21:20:00Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2025-02-19 21:20:00")), Some(expected));
        assert_eq!(
            parse_timestamp(&json!("2025-02-19")),
            Some(expected - (21 * 3600 + 20 * 60) * 1000)
        );
        assert_eq!(parse_timestamp(&json!("next tuesday")), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
    }

    #[test]
    fn scalars_are_coerced() {
        let record = normalizer()
            .normalize(&raw(json!({
                "_id": "a",
                "capacity": "72.5",
                "tags": "east",
                "active": "0",
                "geo": {"lat": 1.5},
                "inspected_at": ""
            })))
            .unwrap();
        assert_eq!(record.field("capacity"), Some(&FieldValue::Number(72.5)));
        assert_eq!(record.field("tags"), Some(&FieldValue::List(vec!["east".into()])));
        assert_eq!(record.field("active"), Some(&FieldValue::Boolean(false)));
        assert_eq!(record.field("geo"), Some(&FieldValue::Json(json!({"lat": 1.5}))));
        assert_eq!(record.field("inspected_at"), Some(&FieldValue::Null));

        let err = normalizer()
            .normalize(&raw(json!({"_id": "a", "capacity": "lots"})))
            .unwrap_err();
        assert_eq!(err.field, "capacity");
        let err = normalizer()
            .normalize(&raw(json!({"_id": "a", "active": "maybe"})))
            .unwrap_err();
        assert_eq!(err.field, "active");
    }

    #[test]
    fn normalization_is_deterministic() {
        let input = raw(json!({"_id": "a", "supplier": ["b", "a"], "tags": ["x", 2, true]}));
        let first = normalizer().normalize(&input).unwrap();
        let second = normalizer().normalize(&input).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(
            first.field("tags"),
            Some(&FieldValue::List(vec!["x".into(), "2".into(), "true".into()]))
        );
    }
}
