//! Table catalog and payload validation.
//!
//! The catalog names every table the engine watches, how its entities are
//! identified, what its entities are called in listener event names, and the
//! shape a mutation payload must have before it is sent.

use crate::{error::Result, EntityId, Error, Mutation, MutationAction, TableName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field types supported in table definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Epoch milliseconds or an RFC 3339 string
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Definition of one watched table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    /// Table name as known to the remote service
    pub name: TableName,
    /// Singular entity name used in listener event names (`new_<entity>`)
    pub entity_name: String,
    /// Field holding the entity id
    pub id_field: String,
    /// Field holding the entity's own change time, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_field: Option<String>,
    /// Field definitions for mutation payloads
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl TableSpec {
    /// A table identified by `id`, with no field definitions.
    pub fn new(name: impl Into<TableName>, entity_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_name: entity_name.into(),
            id_field: "id".to_string(),
            timestamp_field: None,
            fields: Vec::new(),
        }
    }

    /// Builder-style method to set the id field.
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    /// Builder-style method to set the entity timestamp field.
    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    /// Builder-style method to set field definitions.
    pub fn with_fields(mut self, fields: Vec<FieldDef>) -> Self {
        self.fields = fields;
        self
    }

    /// Extract the entity id. Strings and integers are accepted.
    pub fn entity_id(&self, entity: &serde_json::Value) -> Result<EntityId> {
        match entity.get(&self.id_field) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(serde_json::Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
            _ => Err(Error::MissingEntityId {
                table: self.name.clone(),
                field: self.id_field.clone(),
            }),
        }
    }

    /// Raw value of the entity timestamp field, if the table has one.
    pub fn entity_timestamp<'a>(
        &self,
        entity: &'a serde_json::Value,
    ) -> Option<&'a serde_json::Value> {
        self.timestamp_field
            .as_ref()
            .and_then(|field| entity.get(field))
            .filter(|v| !v.is_null())
    }

    /// Validate a full payload against the field definitions.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Validate only the fields present in a partial payload.
    pub fn validate_partial(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            if let Some(value) = obj.get(&field.name) {
                field.validate(Some(value))?;
            }
        }

        Ok(())
    }
}

/// All tables known to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    tables: BTreeMap<TableName, TableSpec>,
}

impl Catalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The tables of the operations dashboard.
    pub fn dashboard() -> Self {
        Catalog::new()
            .with_table(
                TableSpec::new("sales", "sale")
                    .with_timestamp_field("created_at")
                    .with_fields(vec![
                        FieldDef::required("total", FieldType::Float),
                        FieldDef::optional("status", FieldType::String),
                        FieldDef::optional("payment_method", FieldType::String),
                        FieldDef::optional("items", FieldType::Json),
                        FieldDef::optional("created_at", FieldType::Timestamp),
                    ]),
            )
            .with_table(
                TableSpec::new("cash_movements", "cash_movement")
                    .with_timestamp_field("occurred_at")
                    .with_fields(vec![
                        FieldDef::required("kind", FieldType::String),
                        FieldDef::required("amount", FieldType::Float),
                        FieldDef::optional("sale_id", FieldType::String),
                        FieldDef::optional("payment_method", FieldType::String),
                        FieldDef::optional("description", FieldType::String),
                        FieldDef::optional("occurred_at", FieldType::Timestamp),
                    ]),
            )
            .with_table(
                TableSpec::new("stock", "stock")
                    .with_timestamp_field("updated_at")
                    .with_fields(vec![
                        FieldDef::required("product_id", FieldType::String),
                        FieldDef::required("quantity", FieldType::Float),
                        FieldDef::optional("unit", FieldType::String),
                        FieldDef::optional("updated_at", FieldType::Timestamp),
                    ]),
            )
            .with_table(
                TableSpec::new("products", "product")
                    .with_timestamp_field("updated_at")
                    .with_fields(vec![
                        FieldDef::required("name", FieldType::String),
                        FieldDef::optional("price", FieldType::Float),
                        FieldDef::optional("updated_at", FieldType::Timestamp),
                    ]),
            )
            .with_table(
                TableSpec::new("recipes", "recipe")
                    .with_timestamp_field("updated_at")
                    .with_fields(vec![
                        FieldDef::required("name", FieldType::String),
                        FieldDef::optional("yield_quantity", FieldType::Float),
                        FieldDef::optional("ingredients", FieldType::Json),
                        FieldDef::optional("updated_at", FieldType::Timestamp),
                    ]),
            )
            .with_table(
                TableSpec::new("shifts", "shift")
                    .with_timestamp_field("updated_at")
                    .with_fields(vec![
                        FieldDef::required("employee", FieldType::String),
                        FieldDef::required("starts_at", FieldType::Timestamp),
                        FieldDef::optional("ends_at", FieldType::Timestamp),
                        FieldDef::optional("updated_at", FieldType::Timestamp),
                    ]),
            )
    }

    /// Add a table to the catalog.
    pub fn add_table(&mut self, table: TableSpec) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSpec) -> Self {
        self.add_table(table);
        self
    }

    /// Get a table definition by name.
    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.get(name)
    }

    /// Get a table definition or fail with [`Error::UnknownTable`].
    pub fn require(&self, name: &str) -> Result<&TableSpec> {
        self.get(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// Check whether a table is known.
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Iterate table definitions in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.values()
    }

    /// Names in `names` that are not in the catalog.
    pub fn unknown_tables(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|n| !self.tables.contains_key(n.as_str()))
            .cloned()
            .collect()
    }

    /// Validate a mutation before it is sent or queued.
    pub fn validate_mutation(&self, mutation: &Mutation) -> Result<()> {
        let table = self.require(&mutation.table)?;

        match mutation.action {
            MutationAction::Insert => table.validate_payload(&mutation.payload),
            MutationAction::Upsert => {
                table.entity_id(&mutation.payload)?;
                table.validate_payload(&mutation.payload)
            }
            MutationAction::Update => {
                table.entity_id(&mutation.payload)?;
                table.validate_partial(&mutation.payload)
            }
            MutationAction::Delete => table.entity_id(&mutation.payload).map(|_| ()),
        }
    }
}
