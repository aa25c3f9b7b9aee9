//! Records, collections and the fields every backend agrees on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use super::error::StoreError;

/// Identifier of a record, unique within its collection.
pub type RecordId = i64;

/// Field used as the default ordering/index key.
pub const DATE_FIELD: &str = "date";

/// The fixed set of collections declared by the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
  Journal,
  Tasks,
  Habits,
  Metrics,
  Mood,
  Goals,
  Resources,
  Files,
  Nutrition,
  FocusSessions,
}

impl Collection {
  pub const ALL: [Collection; 10] = [
    Collection::Journal,
    Collection::Tasks,
    Collection::Habits,
    Collection::Metrics,
    Collection::Mood,
    Collection::Goals,
    Collection::Resources,
    Collection::Files,
    Collection::Nutrition,
    Collection::FocusSessions,
  ];

  /// Stable name used for tables, storage keys and the CLI.
  pub fn name(self) -> &'static str {
    match self {
      Self::Journal => "journal",
      Self::Tasks => "tasks",
      Self::Habits => "habits",
      Self::Metrics => "metrics",
      Self::Mood => "mood",
      Self::Goals => "goals",
      Self::Resources => "resources",
      Self::Files => "files",
      Self::Nutrition => "nutrition",
      Self::FocusSessions => "focusSessions",
    }
  }
}

impl Display for Collection {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Collection {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|c| c.name() == s)
      .ok_or_else(|| StoreError::InvalidArgument(format!("unknown collection `{s}`")))
  }
}

/// One persisted item: an optional id plus arbitrary named fields.
///
/// Serialized flat, so `{"id": 3, "title": "x"}` round-trips through
/// `id = Some(3)` and `fields = {"title": "x"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
  #[serde(default)]
  pub id: Option<RecordId>,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Record {
  /// Build a record from a JSON object. Non-object values are rejected.
  pub fn from_value(value: Value) -> Result<Self, StoreError> {
    if !value.is_object() {
      return Err(StoreError::InvalidArgument(
        "a record must be a JSON object".to_string(),
      ));
    }
    Ok(serde_json::from_value(value)?)
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.fields.get(field)
  }

  pub fn date(&self) -> Option<&Value> {
    self.fields.get(DATE_FIELD).filter(|v| !v.is_null())
  }

  /// Fill in `date` with `now_ms` when it is absent or null.
  pub fn ensure_date(&mut self, now_ms: i64) {
    if self.date().is_none() {
      self.fields.insert(DATE_FIELD.to_string(), Value::from(now_ms));
    }
  }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_collection_names_round_trip() {
    for collection in Collection::ALL {
      assert_eq!(collection.name().parse::<Collection>().unwrap(), collection);
    }
    assert_eq!(
      serde_json::to_value(Collection::FocusSessions).unwrap(),
      json!("focusSessions")
    );
  }

  #[test]
  fn test_unknown_collection_is_invalid_argument() {
    let err = "calendar".parse::<Collection>().unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
  }

  #[test]
  fn test_record_serializes_flat() {
    let record = Record::from_value(json!({ "id": 7, "title": "run", "done": false })).unwrap();
    assert_eq!(record.id, Some(7));
    assert_eq!(record.get("title"), Some(&json!("run")));
    assert!(!record.fields.contains_key("id"));

    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value, json!({ "id": 7, "title": "run", "done": false }));
  }

  #[test]
  fn test_null_id_parses_as_none() {
    let record = Record::from_value(json!({ "id": null, "text": "hello" })).unwrap();
    assert_eq!(record.id, None);
  }

  #[test]
  fn test_from_value_rejects_non_objects() {
    assert!(matches!(
      Record::from_value(json!([1, 2])),
      Err(StoreError::InvalidArgument(_))
    ));
  }

  #[test]
  fn test_ensure_date_only_fills_missing() {
    let mut missing = Record::default();
    missing.ensure_date(42);
    assert_eq!(missing.date(), Some(&json!(42)));

    let mut null_date = Record::from_value(json!({ "date": null })).unwrap();
    null_date.ensure_date(42);
    assert_eq!(null_date.date(), Some(&json!(42)));

    let mut present = Record::from_value(json!({ "date": "2024-03-01" })).unwrap();
    present.ensure_date(42);
    assert_eq!(present.date(), Some(&json!("2024-03-01")));
  }
}
