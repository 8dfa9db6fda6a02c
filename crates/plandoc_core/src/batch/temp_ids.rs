//! Placeholder (`$name`) resolution for batch operations.

use crate::error::{FieldError, Result, StoreError};
use crate::types::{EntityType, NewLink, TEMP_ID_PREFIX};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// True for strings that name a placeholder.
pub fn is_temp_id(value: &str) -> bool {
    value.starts_with(TEMP_ID_PREFIX)
}

/// Maps placeholders to the real ids assigned during a batch.
#[derive(Debug, Default, Clone)]
pub struct TempIdResolver {
    map: BTreeMap<String, String>,
}

impl TempIdResolver {
    /// Empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `temp_id` to `real_id`.
    pub fn register(&mut self, temp_id: &str, real_id: &str) -> Result<()> {
        self.check_unbound(temp_id)?;
        self.map.insert(temp_id.to_string(), real_id.to_string());
        Ok(())
    }

    /// Fails unless `temp_id` is a well-formed placeholder not yet bound.
    /// Checked before the operation that binds it runs.
    pub fn check_unbound(&self, temp_id: &str) -> Result<()> {
        if !is_temp_id(temp_id) {
            return Err(StoreError::invalid(
                "tempId",
                format!("'{}' must start with '{}'", temp_id, TEMP_ID_PREFIX),
            ));
        }
        if self.map.contains_key(temp_id) {
            return Err(StoreError::invalid(
                "tempId",
                format!("'{}' is already bound in this batch", temp_id),
            ));
        }
        Ok(())
    }

    /// Resolves a single id; non-placeholders pass through.
    pub fn resolve(&self, field: &str, value: &str) -> Result<String> {
        self.lookup(field, value).map_err(|e| StoreError::Validation { errors: vec![e] })
    }

    fn lookup(&self, field: &str, value: &str) -> std::result::Result<String, FieldError> {
        if !is_temp_id(value) {
            return Ok(value.to_string());
        }
        self.map
            .get(value)
            .cloned()
            .ok_or_else(|| FieldError::new(field, format!("unresolved placeholder '{}'", value)))
    }

    /// Rewrites the id-bearing fields of `entity_type` in `fields`, including
    /// strings inside arrays. Every unresolved placeholder is reported.
    pub fn resolve_fields(&self, entity_type: EntityType, fields: &mut Map<String, Value>) -> Result<()> {
        let mut errors = Vec::new();
        for name in entity_type.id_fields() {
            match fields.get_mut(*name) {
                Some(Value::String(s)) => match self.lookup(name, s) {
                    Ok(real) => *s = real,
                    Err(e) => errors.push(e),
                },
                Some(Value::Array(items)) => {
                    for item in items.iter_mut() {
                        if let Value::String(s) = item {
                            match self.lookup(name, s) {
                                Ok(real) => *s = real,
                                Err(e) => errors.push(e),
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Validation { errors })
        }
    }

    /// Rewrites `sourceId` and `targetId`.
    pub fn resolve_link(&self, link: &mut NewLink) -> Result<()> {
        let mut errors = Vec::new();
        match self.lookup("sourceId", &link.source_id) {
            Ok(real) => link.source_id = real,
            Err(e) => errors.push(e),
        }
        match self.lookup("targetId", &link.target_id) {
            Ok(real) => link.target_id = real,
            Err(e) => errors.push(e),
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Validation { errors })
        }
    }

    /// The bindings made so far.
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.map
    }
}
