//! Projection of authorization details into attribute/value rows

use super::AuthorizationDetail;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// One queryable fact derived from a grant's authorization details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Permission {
    pub grant_id: String,
    /// `<grant_id>:<identifier>`, or `<grant_id>:<type>-<index>` for details without one
    pub resource_identifier: String,
    pub attribute: String,
    pub value: String,
}

const TRUE: &str = "true";

/// List fields of generic details that become rows, with the attribute
/// each element is emitted under, in emission order
const LIST_FIELDS: [(&str, &str); 5] = [
    ("databases", "database"),
    ("schemas", "schema"),
    ("tables", "table"),
    ("urls", "url"),
    ("protocols", "protocol"),
];

fn row_value(value: &Value) -> String {
    match value {
        Value::String(value) => value.clone(),
        other => other.to_string(),
    }
}

/// Rows for every detail, in detail order. Tools and permissions are
/// emitted in name order and generic list fields in a fixed order, so
/// equal inputs give identical output.
pub fn flatten(grant_id: &str, details: &[AuthorizationDetail]) -> Vec<Permission> {
    let mut rows = Vec::new();
    for (index, detail) in details.iter().enumerate() {
        let resource_identifier = match detail.identifier() {
            Some(identifier) => format!("{grant_id}:{identifier}"),
            None => format!("{grant_id}:{}-{index}", detail.detail_type()),
        };
        let mut push = |attribute: String, value: &str| {
            rows.push(Permission {
                grant_id: grant_id.to_string(),
                resource_identifier: resource_identifier.clone(),
                attribute,
                value: value.to_string(),
            });
        };

        push("type".to_string(), detail.detail_type());
        match detail {
            AuthorizationDetail::Mcp(mcp) => {
                for (tool, _) in mcp.tools.iter().filter(|(_, v)| **v == Some(true)) {
                    push(format!("tool:{tool}"), TRUE);
                }
                push("location".to_string(), &mcp.server);
                if let Some(transport) = &mcp.transport {
                    push("transport".to_string(), transport);
                }
            }
            AuthorizationDetail::Fs(fs) => {
                for (permission, _) in fs.permissions.iter().filter(|(_, granted)| **granted) {
                    push(format!("permission:{permission}"), TRUE);
                }
                for root in &fs.roots {
                    push("root".to_string(), root);
                }
            }
            AuthorizationDetail::Generic(generic) => {
                for action in &generic.actions {
                    push(format!("action:{action}"), TRUE);
                }
                for location in &generic.locations {
                    push("location".to_string(), location);
                }
                for (field, attribute) in LIST_FIELDS {
                    let Some(Value::Array(items)) = generic.extra.get(field) else {
                        continue;
                    };
                    for item in items {
                        push(attribute.to_string(), &row_value(item));
                    }
                }
            }
        }
    }
    rows
}

/// Rows whose attribute equals `attribute` or is namespaced under it,
/// so `tool` selects every `tool:<name>` row.
pub fn filter_by_attribute<'a>(
    rows: &'a [Permission],
    attribute: &'a str,
) -> impl Iterator<Item = &'a Permission> + 'a {
    rows.iter().filter(move |row| {
        row.attribute == attribute
            || row
                .attribute
                .strip_prefix(attribute)
                .is_some_and(|rest| rest.starts_with(':'))
    })
}

pub fn has_permission(rows: &[Permission], attribute: &str, value: &str) -> bool {
    rows.iter()
        .any(|row| row.attribute == attribute && row.value == value)
}
