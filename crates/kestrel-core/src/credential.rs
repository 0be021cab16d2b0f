//! Self-attested credentials (ACDC layout) and their schemas.

use crate::{Error, Result, said};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Version string carried by every credential.
pub const ACDC_VERSION: &str = "ACDC10JSON";

/// Attribute keys filled in by the issuer, never by the caller.
pub const RESERVED_ATTRIBUTES: [&str; 3] = ["d", "i", "dt"];

/// A credential schema, decoded from its JSON document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Schema {
    #[serde(rename = "$id")]
    pub said: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "properties")]
    properties: SchemaProperties,
    #[serde(skip)]
    document: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct SchemaProperties {
    #[serde(rename = "a")]
    attributes: AttributeBlock,
}

/// The attribute section is either inline or a compact/expanded `oneOf`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum AttributeBlock {
    OneOf {
        #[serde(rename = "oneOf")]
        one_of: Vec<Value>,
    },
    Inline(AttributeSection),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct AttributeSection {
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    required: Vec<String>,
}

impl Schema {
    /// Decode a schema document and check its SAID.
    pub fn from_document(document: Value) -> Result<Self> {
        let computed = said::verify_schema(&document).map_err(|e| match e {
            Error::SaidMismatch { expected, computed } => Error::SchemaMismatch(format!(
                "schema $id {expected} does not match content digest {computed}"
            )),
            other => other,
        })?;

        let mut schema: Schema = serde_json::from_value(document.clone())
            .map_err(|e| Error::SchemaMismatch(format!("unexpected schema shape: {e}")))?;
        debug_assert_eq!(schema.said, computed);
        schema.document = document;
        Ok(schema)
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    fn section(&self) -> Result<AttributeSection> {
        match &self.properties.attributes {
            AttributeBlock::Inline(section) => Ok(section.clone()),
            AttributeBlock::OneOf { one_of } => one_of
                .iter()
                .find(|v| v.get("properties").is_some())
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()
                .map_err(|e| Error::SchemaMismatch(format!("unexpected attribute block: {e}")))?
                .ok_or_else(|| Error::SchemaMismatch("schema has no expanded attribute block".into())),
        }
    }

    /// Attributes the caller must supply (issuer-filled keys excluded).
    pub fn required_attributes(&self) -> Result<Vec<String>> {
        Ok(self
            .section()?
            .required
            .into_iter()
            .filter(|k| !RESERVED_ATTRIBUTES.contains(&k.as_str()))
            .collect())
    }

    /// Check field presence of `attributes` against the schema.
    pub fn validate(&self, attributes: &Map<String, Value>) -> Result<()> {
        let missing: Vec<String> = self
            .required_attributes()?
            .into_iter()
            .filter(|k| !attributes.contains_key(k))
            .collect();

        if !missing.is_empty() {
            return Err(Error::SchemaMismatch(format!(
                "missing required attributes for schema {}: {}",
                self.said,
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

/// The attribute block of a credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialAttributes {
    #[serde(rename = "d")]
    pub said: String,
    /// Issuee prefix.
    #[serde(rename = "i")]
    pub issuee: String,
    /// Issuance timestamp (RFC 3339).
    #[serde(rename = "dt")]
    pub issued_at: String,
    /// Domain payload, e.g. invoice fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "v")]
    pub version: String,
    #[serde(rename = "d")]
    pub said: String,
    /// Issuer prefix.
    #[serde(rename = "i")]
    pub issuer: String,
    /// Registry the credential is issued into.
    #[serde(rename = "ri")]
    pub registry: String,
    /// Schema SAID.
    #[serde(rename = "s")]
    pub schema: String,
    #[serde(rename = "a")]
    pub attributes: CredentialAttributes,
}

impl Credential {
    /// Build a self-attested credential.
    ///
    /// Rejects `issuer != issuee`, reserved keys in `fields`, and attribute
    /// sets that do not satisfy `schema`.
    pub fn self_attested(
        issuer: &str,
        issuee: &str,
        registry: &str,
        schema: &Schema,
        fields: Map<String, Value>,
        issued_at: DateTime<Utc>,
    ) -> Result<Self> {
        if issuer != issuee {
            return Err(Error::IssueeMismatch {
                issuer: issuer.to_string(),
                issuee: issuee.to_string(),
            });
        }
        if let Some(key) = RESERVED_ATTRIBUTES.iter().find(|k| fields.contains_key(**k)) {
            return Err(Error::SchemaMismatch(format!(
                "attribute {key:?} is set by the issuer"
            )));
        }
        schema.validate(&fields)?;

        let attributes = CredentialAttributes {
            said: String::new(),
            issuee: issuee.to_string(),
            issued_at: issued_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            fields,
        };
        let (_, attributes) = said::saidify(serde_json::to_value(attributes)?, &["d"])?;

        let credential = Self {
            version: ACDC_VERSION.to_string(),
            said: String::new(),
            issuer: issuer.to_string(),
            registry: registry.to_string(),
            schema: schema.said.clone(),
            attributes: serde_json::from_value(attributes)?,
        };
        let (_, value) = said::saidify(serde_json::to_value(credential)?, &["d"])?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn is_self_attested(&self) -> bool {
        self.issuer == self.attributes.issuee
    }

    /// Check both the credential SAID and the attribute block SAID.
    pub fn verify_said(&self) -> Result<()> {
        let value = serde_json::to_value(self)?;
        said::verify(&value["a"], "d", &[])?;
        said::verify(&value, "d", &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        let document = json!({
            "$id": "",
            "title": "Invoice",
            "properties": {
                "a": {
                    "oneOf": [
                        { "type": "string" },
                        {
                            "$id": "",
                            "properties": {
                                "d": { "type": "string" },
                                "i": { "type": "string" },
                                "dt": { "type": "string" },
                                "invoiceNumber": { "type": "string" },
                                "amount": { "type": "number" },
                                "currency": { "type": "string" }
                            },
                            "required": ["d", "i", "dt", "invoiceNumber", "amount", "currency"]
                        }
                    ]
                }
            }
        });
        let (_, document) = said::saidify_schema(document).unwrap();
        Schema::from_document(document).unwrap()
    }

    fn invoice() -> Map<String, Value> {
        json!({"invoiceNumber": "INV-1", "amount": 500, "currency": "USD"})
            .as_object()
            .cloned()
            .unwrap()
    }

    const ISSUER: &str = "IzOcBhH8xzsZ-zz3T6GTyWOxbXaCbnnLkadzcUVzyTiA";

    #[test]
    fn test_required_attributes_skip_reserved() {
        assert_eq!(
            schema().required_attributes().unwrap(),
            vec!["invoiceNumber", "amount", "currency"]
        );
    }

    #[test]
    fn test_self_attested_issuer_equals_issuee() {
        let credential =
            Credential::self_attested(ISSUER, ISSUER, "Ireg", &schema(), invoice(), Utc::now())
                .unwrap();

        assert!(credential.is_self_attested());
        assert_eq!(credential.attributes.fields["amount"], json!(500));
        credential.verify_said().unwrap();
    }

    #[test]
    fn test_mismatched_issuee_rejected() {
        let result = Credential::self_attested(
            ISSUER,
            "IOtherXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX",
            "Ireg",
            &schema(),
            invoice(),
            Utc::now(),
        );
        assert!(matches!(result, Err(Error::IssueeMismatch { .. })));
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut fields = invoice();
        fields.remove("currency");
        let result =
            Credential::self_attested(ISSUER, ISSUER, "Ireg", &schema(), fields, Utc::now());
        match result {
            Err(Error::SchemaMismatch(msg)) => assert!(msg.contains("currency")),
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_attributes_fail_said() {
        let mut credential =
            Credential::self_attested(ISSUER, ISSUER, "Ireg", &schema(), invoice(), Utc::now())
                .unwrap();
        credential.attributes.fields.insert("amount".into(), json!(5000));
        assert!(credential.verify_said().is_err());
    }

    #[test]
    fn test_schema_with_wrong_id_rejected() {
        let mut document = schema().document().clone();
        document["title"] = json!("Changed");
        assert!(matches!(
            Schema::from_document(document),
            Err(Error::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_schema_without_attribute_block_rejected() {
        let (_, document) = said::saidify_schema(json!({"title": "Empty", "properties": {}})).unwrap();
        assert!(matches!(
            Schema::from_document(document),
            Err(Error::SchemaMismatch(_))
        ));
    }
}
