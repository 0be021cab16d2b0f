//! Self-addressing identifiers (SAIDs).
//!
//! A SAID is the digest of a document's canonical form computed while the
//! document's own identifier field holds [`PLACEHOLDER`]. The digest is then
//! written back into that field.

use crate::{Error, Result, signing};
use serde_json::Value;

/// Stand-in value for SAID fields while digesting.
pub const PLACEHOLDER: &str = "############################################";

/// Identifier field used by schema documents.
pub const SCHEMA_ID_FIELD: &str = "$id";

/// Compute the SAID of a JSON object, treating `fields` as self-referential.
pub fn compute(value: &Value, fields: &[&str]) -> Result<String> {
    let mut working = value.clone();
    let object = working
        .as_object_mut()
        .ok_or_else(|| Error::InvalidEvent("SAID requires a JSON object".into()))?;

    for field in fields {
        object.insert((*field).to_string(), Value::String(PLACEHOLDER.to_string()));
    }

    let canonical = signing::canonicalize_value(&working);
    Ok(signing::digest(canonical.as_bytes()).to_string())
}

/// Compute the SAID and write it into every field in `fields`.
pub fn saidify(mut value: Value, fields: &[&str]) -> Result<(String, Value)> {
    let said = compute(&value, fields)?;
    if let Some(object) = value.as_object_mut() {
        for field in fields {
            object.insert((*field).to_string(), Value::String(said.clone()));
        }
    }
    Ok((said, value))
}

/// Check that `field` holds the SAID of `value`.
pub fn verify(value: &Value, field: &str, aliases: &[&str]) -> Result<()> {
    let expected = value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidEvent(format!("missing SAID field {field}")))?;

    let mut fields = vec![field];
    fields.extend_from_slice(aliases);
    let computed = compute(value, &fields)?;

    if computed != expected {
        return Err(Error::SaidMismatch {
            expected: expected.to_string(),
            computed,
        });
    }
    Ok(())
}

/// SAID a schema document.
///
/// Every `$id` at any depth is cleared before digesting, so a schema's
/// identifier depends only on its content and not on stale identifiers it
/// carried. Nested blocks that declare an `$id` receive their own digest,
/// computed the same way over their subtree. Returns the top-level SAID and
/// the updated schema.
pub fn saidify_schema(mut schema: Value) -> Result<(String, Value)> {
    let object = schema
        .as_object_mut()
        .ok_or_else(|| Error::SchemaMismatch("schema must be a JSON object".into()))?;
    object.insert(SCHEMA_ID_FIELD.to_string(), Value::String(String::new()));

    assign_nested_ids(&mut schema);
    let said = schema_digest(&schema);

    if let Some(object) = schema.as_object_mut() {
        object.insert(SCHEMA_ID_FIELD.to_string(), Value::String(said.clone()));
    }
    Ok((said, schema))
}

/// Check a schema document's `$id` against its content.
pub fn verify_schema(schema: &Value) -> Result<String> {
    let declared = schema
        .get(SCHEMA_ID_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::SchemaMismatch("schema has no $id".into()))?;

    let computed = schema_digest(schema);
    if computed != declared {
        return Err(Error::SaidMismatch {
            expected: declared.to_string(),
            computed,
        });
    }
    Ok(computed)
}

fn schema_digest(value: &Value) -> String {
    let mut cleared = value.clone();
    clear_ids(&mut cleared);
    let canonical = signing::canonicalize_value(&cleared);
    signing::digest(canonical.as_bytes()).to_string()
}

fn clear_ids(value: &mut Value) {
    match value {
        Value::Object(object) => {
            if object.contains_key(SCHEMA_ID_FIELD) {
                object.insert(SCHEMA_ID_FIELD.to_string(), Value::String(PLACEHOLDER.into()));
            }
            for (key, child) in object.iter_mut() {
                if key != SCHEMA_ID_FIELD {
                    clear_ids(child);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(clear_ids),
        _ => {}
    }
}

fn assign_nested_ids(value: &mut Value) {
    match value {
        Value::Object(object) => {
            for (key, child) in object.iter_mut() {
                if key == SCHEMA_ID_FIELD {
                    continue;
                }
                assign_nested_ids(child);
                set_own_id(child);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                assign_nested_ids(item);
                set_own_id(item);
            }
        }
        _ => {}
    }
}

fn set_own_id(value: &mut Value) {
    let needs_id = matches!(value, Value::Object(object) if object.contains_key(SCHEMA_ID_FIELD));
    if needs_id {
        let said = schema_digest(value);
        if let Some(object) = value.as_object_mut() {
            object.insert(SCHEMA_ID_FIELD.to_string(), Value::String(said));
        }
    }
}
