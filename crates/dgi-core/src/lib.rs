//! Core domain model and record normalization for the data.gov.in metadata mirror.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "dgi-core";

/// Canonical identifiers are always exactly this many characters.
pub const INDEX_NAME_LEN: usize = 36;

/// Source recorded when the remote record carries none.
pub const DEFAULT_SOURCE: &str = "data.gov.in";

/// Source excluded from every listing request.
pub const EXCLUDED_SOURCE: &str = "visualize.data.gov.in";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    Created,
    Updated,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Created => "created",
            SortField::Updated => "updated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// One catalog resource as mirrored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub index_name: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "org")]
    pub organizations: BTreeSet<String>,
    #[serde(rename = "org_type")]
    pub organization_type: String,
    pub source: String,
    #[serde(rename = "sector")]
    pub sectors: BTreeSet<String>,
    #[serde(rename = "field")]
    pub field_ids: BTreeSet<String>,
    #[serde(rename = "created")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "updated")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ResourceMetadata {
    /// Normalize one raw listing record.
    ///
    /// Returns `None` (after logging) when the record has no usable
    /// `index_name`; every other defect degrades to an empty or missing value.
    pub fn from_raw(raw: &JsonValue) -> Option<Self> {
        let Some(index_name) = valid_index_name(raw) else {
            warn!(
                index_name = %raw.get("index_name").unwrap_or(&JsonValue::Null),
                "invalid index_name, skipping record"
            );
            return None;
        };

        Some(Self {
            index_name: index_name.to_string(),
            title: clean_text(json_str(raw, "title").unwrap_or_default()),
            description: clean_text(json_str(raw, "desc").unwrap_or_default()),
            organizations: clean_text_set(raw.get("org")),
            organization_type: clean_text(json_str(raw, "org_type").unwrap_or_default())
                .to_lowercase(),
            source: normalize_source(json_str(raw, "source")),
            sectors: clean_text_set(raw.get("sector")),
            field_ids: field_id_set(raw.get("field")),
            created_at: parse_timestamp(raw.get("created")),
            updated_at: parse_timestamp(raw.get("updated")),
        })
    }

    /// Render back into the listing endpoint's raw shape.
    pub fn to_raw(&self) -> JsonValue {
        serde_json::json!({
            "index_name": self.index_name,
            "title": self.title,
            "desc": self.description,
            "org": self.organizations,
            "org_type": self.organization_type,
            "source": self.source,
            "sector": self.sectors,
            "field": self
                .field_ids
                .iter()
                .map(|id| serde_json::json!({ "id": id }))
                .collect::<Vec<_>>(),
            "created": self.created_at.map(|t| t.timestamp_millis()),
            "updated": self.updated_at.map(|t| t.timestamp_millis()),
        })
    }

    pub fn field_value(&self, field: ResourceField) -> JsonValue {
        match field {
            ResourceField::IndexName => JsonValue::from(self.index_name.clone()),
            ResourceField::Title => JsonValue::from(self.title.clone()),
            ResourceField::Description => JsonValue::from(self.description.clone()),
            ResourceField::Organizations => string_set_value(&self.organizations),
            ResourceField::OrganizationType => JsonValue::from(self.organization_type.clone()),
            ResourceField::Source => JsonValue::from(self.source.clone()),
            ResourceField::Sectors => string_set_value(&self.sectors),
            ResourceField::FieldIds => string_set_value(&self.field_ids),
            ResourceField::CreatedAt => timestamp_value(self.created_at),
            ResourceField::UpdatedAt => timestamp_value(self.updated_at),
        }
    }

    /// Keep only the requested fields; an empty selection keeps all of them.
    pub fn project(&self, fields: &[ResourceField]) -> JsonMap<String, JsonValue> {
        let fields = if fields.is_empty() {
            ResourceField::ALL
        } else {
            fields
        };
        fields
            .iter()
            .map(|field| (field.as_str().to_string(), self.field_value(*field)))
            .collect()
    }
}

/// Normalize a page of raw records, dropping the ones without a valid identity.
pub fn normalize_records(raw: &[JsonValue]) -> Vec<ResourceMetadata> {
    raw.iter().filter_map(ResourceMetadata::from_raw).collect()
}

/// Stored columns, addressable by their external names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceField {
    IndexName,
    Title,
    Description,
    Organizations,
    OrganizationType,
    Source,
    Sectors,
    FieldIds,
    CreatedAt,
    UpdatedAt,
}

impl ResourceField {
    pub const ALL: &'static [ResourceField] = &[
        ResourceField::IndexName,
        ResourceField::Title,
        ResourceField::Description,
        ResourceField::Organizations,
        ResourceField::OrganizationType,
        ResourceField::Source,
        ResourceField::Sectors,
        ResourceField::FieldIds,
        ResourceField::CreatedAt,
        ResourceField::UpdatedAt,
    ];

    /// External name, identical to the row store column name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceField::IndexName => "index_name",
            ResourceField::Title => "title",
            ResourceField::Description => "description",
            ResourceField::Organizations => "org",
            ResourceField::OrganizationType => "org_type",
            ResourceField::Source => "source",
            ResourceField::Sectors => "sector",
            ResourceField::FieldIds => "field",
            ResourceField::CreatedAt => "created",
            ResourceField::UpdatedAt => "updated",
        }
    }

    /// Parse a comma separated projection such as `"title,org"`.
    pub fn parse_list(input: &str) -> Result<Vec<ResourceField>, ParseFieldError> {
        input
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<ResourceField>)
            .collect()
    }
}

impl fmt::Display for ResourceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceField {
    type Err = ParseFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "desc" => Ok(ResourceField::Description),
            other => ResourceField::ALL
                .iter()
                .copied()
                .find(|f| f.as_str() == other)
                .ok_or_else(|| ParseFieldError(other.to_string())),
        }
    }
}

/// Attributes with a distinct-value listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Organizations,
    OrganizationTypes,
    Sectors,
    Sources,
}

impl Attribute {
    pub const ALL: &'static [Attribute] = &[
        Attribute::Sectors,
        Attribute::Sources,
        Attribute::OrganizationTypes,
        Attribute::Organizations,
    ];

    pub fn field(&self) -> ResourceField {
        match self {
            Attribute::Organizations => ResourceField::Organizations,
            Attribute::OrganizationTypes => ResourceField::OrganizationType,
            Attribute::Sectors => ResourceField::Sectors,
            Attribute::Sources => ResourceField::Source,
        }
    }

    /// Set-valued attributes are flattened across rows before de-duplication.
    pub fn is_set_valued(&self) -> bool {
        matches!(self, Attribute::Organizations | Attribute::Sectors)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::Organizations => "orgs",
            Attribute::OrganizationTypes => "org_types",
            Attribute::Sectors => "sectors",
            Attribute::Sources => "sources",
        }
    }
}

impl FromStr for Attribute {
    type Err = ParseFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orgs" | "org" | "organizations" => Ok(Attribute::Organizations),
            "org_types" | "org_type" | "organization_types" => Ok(Attribute::OrganizationTypes),
            "sectors" | "sector" => Ok(Attribute::Sectors),
            "sources" | "source" => Ok(Attribute::Sources),
            other => Err(ParseFieldError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown field `{0}`")]
pub struct ParseFieldError(pub String);

/// Collapse runs of whitespace to one space and trim the ends.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Interpret a raw timestamp as epoch seconds, then as epoch milliseconds.
///
/// Anything else, including an absent value, becomes `None` with a warning.
pub fn parse_timestamp(value: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    let parsed = value.and_then(timestamp_integer).and_then(|n| {
        DateTime::from_timestamp(n, 0)
            .filter(within_calendar)
            .or_else(|| DateTime::from_timestamp_millis(n).filter(within_calendar))
    });
    if parsed.is_none() {
        warn!(value = %value.unwrap_or(&JsonValue::Null), "invalid timestamp");
    }
    parsed
}

fn timestamp_integer(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn within_calendar(t: &DateTime<Utc>) -> bool {
    (1..=9999).contains(&t.year())
}

fn valid_index_name(raw: &JsonValue) -> Option<&str> {
    json_str(raw, "index_name").filter(|s| s.chars().count() == INDEX_NAME_LEN)
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str()
}

fn normalize_source(raw: Option<&str>) -> String {
    let source = clean_text(raw.unwrap_or_default()).to_lowercase();
    if source.is_empty() {
        DEFAULT_SOURCE.to_string()
    } else {
        source
    }
}

fn clean_text_set(value: Option<&JsonValue>) -> BTreeSet<String> {
    value
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(clean_text)
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn field_id_set(value: Option<&JsonValue>) -> BTreeSet<String> {
    value
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("id").and_then(JsonValue::as_str))
                .filter(|id| !id.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn string_set_value(set: &BTreeSet<String>) -> JsonValue {
    JsonValue::Array(set.iter().cloned().map(JsonValue::from).collect())
}

fn timestamp_value(t: Option<DateTime<Utc>>) -> JsonValue {
    t.map(|t| JsonValue::from(t.to_rfc3339()))
        .unwrap_or(JsonValue::Null)
}
