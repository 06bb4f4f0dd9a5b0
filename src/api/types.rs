use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::date_util::parse_timestamp;

/// A reference to another tracker object (status, user, queue, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Reference {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub display: Option<String>,
}

impl Reference {
    /// Best label for humans: display name, then key, then id.
    pub fn label(&self) -> Option<&str> {
        self.display
            .as_deref()
            .or(self.key.as_deref())
            .or(self.id.as_deref())
    }

    /// Machine code: key, then id.
    pub fn code(&self) -> Option<&str> {
        self.key.as_deref().or(self.id.as_deref())
    }
}

/// An issue as returned by search and `GET /v2/issues/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIssue {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<Reference>,
    #[serde(default)]
    pub created_by: Option<Reference>,
    #[serde(default)]
    pub assignee: Option<Reference>,
    #[serde(default)]
    pub queue: Option<Reference>,
    #[serde(default, rename = "type")]
    pub issue_type: Option<Reference>,
    #[serde(default)]
    pub priority: Option<Reference>,
    #[serde(default)]
    pub components: Vec<Reference>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One change-log record. Only `fields` entries touching `status` matter
/// for history reconstruction.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogEntry {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "type")]
    pub entry_type: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldChange>,
}

impl ChangelogEntry {
    /// The status transition recorded by this entry, if any.
    pub fn status_change(&self) -> Option<&FieldChange> {
        self.fields.iter().find(|f| f.field.id == STATUS_FIELD)
    }
}

pub const STATUS_FIELD: &str = "status";

#[derive(Debug, Clone, Deserialize)]
pub struct FieldChange {
    pub field: FieldRef,
    #[serde(default, deserialize_with = "reference_or_none")]
    pub from: Option<Reference>,
    #[serde(default, deserialize_with = "reference_or_none")]
    pub to: Option<Reference>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldRef {
    pub id: String,
    #[serde(default)]
    pub display: Option<String>,
}

/// Request body for both search endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
}

impl SearchQuery {
    /// Search using the tracker query language.
    pub fn text(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Default::default()
        }
    }

    /// Search using a structured filter object.
    pub fn filter(filter: serde_json::Value) -> Self {
        Self {
            filter: Some(filter),
            ..Default::default()
        }
    }

    /// Interpret user input: a JSON object becomes a filter, anything
    /// else is passed through as query-language text.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.starts_with('{') {
            if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(trimmed) {
                return Self::filter(value);
            }
        }
        Self::text(trimmed)
    }
}

// Status values arrive as objects; other fields carry arrays, strings or
// numbers in `from`/`to`, which are of no interest here.
fn reference_or_none<'de, D>(deserializer: D) -> Result<Option<Reference>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(v @ serde_json::Value::Object(_)) => serde_json::from_value(v).ok(),
        _ => None,
    })
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.as_deref().and_then(parse_timestamp))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
