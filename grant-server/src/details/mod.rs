//! Rich authorization request details.
//!
//! An authorization detail is a JSON object discriminated by its `type`
//! field. `mcp` and `fs` details have a known shape; any other type is kept
//! as a [`GenericDetail`] with its unknown fields preserved.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod flatten;

pub const MCP_TYPE: &str = "mcp";
pub const FS_TYPE: &str = "fs";

/// Top-level spelling of one fs permission, as in `permissions_read: true`
const PERMISSION_FIELD_PREFIX: &str = "permissions_";

/// Access to the tools of one MCP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    /// Tool name to decision. `None` means requested but not yet decided.
    #[serde(default, deserialize_with = "deserialize_tool_claims")]
    pub tools: BTreeMap<String, Option<bool>>,
}

impl McpDetail {
    pub fn is_tool_authorized(&self, tool: &str) -> bool {
        matches!(self.tools.get(tool), Some(Some(true)))
    }
}

/// Access to filesystem roots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub roots: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_permission_claims")]
    pub permissions: BTreeMap<String, bool>,
}

/// Any detail type without a dedicated shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericDetail {
    #[serde(rename = "type")]
    pub detail_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDetail {
    Mcp(McpDetail),
    Fs(FsDetail),
    Generic(GenericDetail),
}

/// Identity of a detail within a grant: at most one detail per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchKey {
    pub detail_type: String,
    pub key: String,
}

impl AuthorizationDetail {
    pub fn detail_type(&self) -> &str {
        match self {
            Self::Mcp(_) => MCP_TYPE,
            Self::Fs(_) => FS_TYPE,
            Self::Generic(detail) => &detail.detail_type,
        }
    }

    pub fn identifier(&self) -> Option<&str> {
        match self {
            Self::Mcp(detail) => detail.identifier.as_deref(),
            Self::Fs(detail) => detail.identifier.as_deref(),
            Self::Generic(detail) => detail.identifier.as_deref(),
        }
    }

    pub fn as_mcp(&self) -> Option<&McpDetail> {
        match self {
            Self::Mcp(detail) => Some(detail),
            _ => None,
        }
    }
}

/// `(type, identifier)` when an identifier is set, `(mcp, server)` for mcp
/// details without one, otherwise `(type, "")`.
pub fn match_key(detail: &AuthorizationDetail) -> MatchKey {
    let key = match (detail.identifier(), detail) {
        (Some(identifier), _) => identifier.to_string(),
        (None, AuthorizationDetail::Mcp(mcp)) => mcp.server.clone(),
        (None, _) => String::new(),
    };
    MatchKey {
        detail_type: detail.detail_type().to_string(),
        key,
    }
}

/// Replace the detail sharing `incoming`'s match key, or append it.
///
/// Replacement is of the whole object; fields of the old detail are not
/// carried over.
pub fn merge_into(
    existing: &[AuthorizationDetail],
    incoming: AuthorizationDetail,
) -> Vec<AuthorizationDetail> {
    let key = match_key(&incoming);
    let mut merged = existing.to_vec();
    match merged.iter_mut().find(|detail| match_key(detail) == key) {
        Some(slot) => *slot = incoming,
        None => merged.push(incoming),
    }
    merged
}

/// Fold a batch of details into `existing` one at a time
pub fn merge_all(
    existing: &[AuthorizationDetail],
    incoming: impl IntoIterator<Item = AuthorizationDetail>,
) -> Vec<AuthorizationDetail> {
    incoming
        .into_iter()
        .fold(existing.to_vec(), |acc, detail| merge_into(&acc, detail))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetailError {
    #[error("authorization_details is not valid JSON: {0}")]
    Json(String),
    #[error("authorization_details must be a JSON array")]
    NotAnArray,
    #[error("authorization_details[{index}]: {message}")]
    Invalid { index: usize, message: String },
}

/// Parse the `authorization_details` request parameter
pub fn parse_details(raw: &str) -> Result<Vec<AuthorizationDetail>, DetailError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DetailError::Json(e.to_string()))?;
    parse_details_value(value)
}

/// Parse an already decoded `authorization_details` value
pub fn parse_details_value(value: Value) -> Result<Vec<AuthorizationDetail>, DetailError> {
    let Value::Array(items) = value else {
        return Err(DetailError::NotAnArray);
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value(item).map_err(|e| DetailError::Invalid {
                index,
                message: e.to_string(),
            })
        })
        .collect()
}

#[derive(Serialize)]
struct Tagged<'a, T> {
    #[serde(rename = "type")]
    detail_type: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

impl Serialize for AuthorizationDetail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Mcp(detail) => Tagged {
                detail_type: MCP_TYPE,
                body: detail,
            }
            .serialize(serializer),
            Self::Fs(detail) => Tagged {
                detail_type: FS_TYPE,
                body: detail,
            }
            .serialize(serializer),
            Self::Generic(detail) => detail.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for AuthorizationDetail {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut value = Value::deserialize(deserializer)?;
        let Some(object) = value.as_object_mut() else {
            return Err(de::Error::custom("authorization detail must be an object"));
        };
        let detail_type = match object.get("type") {
            Some(Value::String(detail_type)) if !detail_type.is_empty() => detail_type.clone(),
            Some(_) => return Err(de::Error::custom("`type` must be a non-empty string")),
            None => return Err(de::Error::missing_field("type")),
        };
        match detail_type.as_str() {
            MCP_TYPE => {
                object.remove("type");
                serde_json::from_value(value)
                    .map(Self::Mcp)
                    .map_err(de::Error::custom)
            }
            FS_TYPE => {
                object.remove("type");
                fold_permission_fields(object);
                serde_json::from_value(value)
                    .map(Self::Fs)
                    .map_err(de::Error::custom)
            }
            _ => serde_json::from_value(value)
                .map(Self::Generic)
                .map_err(de::Error::custom),
        }
    }
}

/// Move `permissions_<name>` fields into the `permissions` map. Entries
/// already in the map win.
fn fold_permission_fields(object: &mut Map<String, Value>) {
    let flat: Vec<String> = object
        .keys()
        .filter(|key| key.starts_with(PERMISSION_FIELD_PREFIX))
        .cloned()
        .collect();
    if flat.is_empty() {
        return;
    }
    let mut permissions = match object.remove("permissions") {
        Some(Value::Object(permissions)) => permissions,
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            object.insert("permissions".to_string(), other);
            return;
        }
    };
    for key in flat {
        let Some(value) = object.remove(&key) else {
            continue;
        };
        let name = &key[PERMISSION_FIELD_PREFIX.len()..];
        if !name.is_empty() {
            permissions.entry(name.to_string()).or_insert(value);
        }
    }
    object.insert("permissions".to_string(), Value::Object(permissions));
}

/// Accepted spellings of a single claim value
#[derive(Deserialize)]
#[serde(untagged)]
enum RawClaim {
    Flag(bool),
    Essential {
        #[serde(default)]
        essential: Option<bool>,
    },
}

impl RawClaim {
    fn decision(self) -> Option<bool> {
        match self {
            Self::Flag(flag) => Some(flag),
            Self::Essential { essential } => essential,
        }
    }
}

fn deserialize_tool_claims<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, Option<bool>>, D::Error> {
    let raw: Option<BTreeMap<String, Option<RawClaim>>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(name, claim)| (name, claim.and_then(RawClaim::decision)))
        .collect())
}

fn deserialize_permission_claims<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, bool>, D::Error> {
    let raw: Option<BTreeMap<String, Option<RawClaim>>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(name, claim)| {
            let granted = claim.and_then(RawClaim::decision).unwrap_or(false);
            (name, granted)
        })
        .collect())
}
