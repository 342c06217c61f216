use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::{Result, StorageError};
use crate::sync::{read, write};
use crate::types::{EnumTypeId, EnumValueId, PropertyValue};

#[derive(Debug, Default)]
struct Names {
    ids: HashMap<String, u64>,
    names: BTreeMap<u64, String>,
}

/// Maps label, property and edge-type names to the ids stored on elements.
/// Ids are never reused.
#[derive(Debug, Default)]
pub struct NameIdMapper {
    names: RwLock<Names>,
}

impl NameIdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id for `name`, allocating one on first use.
    pub fn name_to_id(&self, name: &str) -> Result<u64> {
        if let Some(id) = read(&self.names)?.ids.get(name) {
            return Ok(*id);
        }
        let mut names = write(&self.names)?;
        // Another writer may have won the race.
        if let Some(id) = names.ids.get(name) {
            return Ok(*id);
        }
        let id = names.names.keys().next_back().map_or(0, |last| last + 1);
        names.ids.insert(name.to_string(), id);
        names.names.insert(id, name.to_string());
        Ok(id)
    }

    pub fn id_to_name(&self, id: u64) -> Result<Option<String>> {
        Ok(read(&self.names)?.names.get(&id).cloned())
    }

    /// Every mapping, in id order.
    pub fn entries(&self) -> Result<Vec<(u64, String)>> {
        Ok(read(&self.names)?
            .names
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect())
    }

    pub(crate) fn insert_recovered(&self, id: u64, name: String) -> Result<()> {
        let mut names = write(&self.names)?;
        if names.names.contains_key(&id) || names.ids.contains_key(&name) {
            return Err(StorageError::Catalog(format!("duplicate mapping {} -> {}", id, name)));
        }
        names.ids.insert(name.clone(), id);
        names.names.insert(id, name);
        Ok(())
    }
}

/// One registered enum: its name and its ordered value names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumType {
    pub name: String,
    pub values: Vec<String>,
}

/// Registered enum types. An enum's id is its registration position.
#[derive(Debug, Default)]
pub struct EnumStore {
    types: RwLock<Vec<EnumType>>,
}

impl EnumStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, values: Vec<String>) -> Result<EnumTypeId> {
        let mut types = write(&self.types)?;
        if types.iter().any(|t| t.name == name) {
            return Err(StorageError::Catalog(format!("enum {} already exists", name)));
        }
        let mut seen = std::collections::BTreeSet::new();
        if values.is_empty() || !values.iter().all(|v| seen.insert(v)) {
            return Err(StorageError::Catalog(format!(
                "enum {} needs distinct, non-empty values",
                name
            )));
        }
        types.push(EnumType {
            name: name.to_string(),
            values,
        });
        Ok(EnumTypeId(types.len() as u64 - 1))
    }

    /// `Enum::Value` as a property value, if both names are registered.
    pub fn to_enum(&self, type_name: &str, value_name: &str) -> Result<Option<PropertyValue>> {
        let types = read(&self.types)?;
        Ok(types
            .iter()
            .enumerate()
            .find(|(_, t)| t.name == type_name)
            .and_then(|(type_id, t)| {
                t.values.iter().position(|v| v == value_name).map(|value_id| {
                    PropertyValue::Enum(EnumTypeId(type_id as u64), EnumValueId(value_id as u64))
                })
            }))
    }

    pub fn entries(&self) -> Result<Vec<EnumType>> {
        Ok(read(&self.types)?.clone())
    }

    pub(crate) fn restore(&self, entries: Vec<EnumType>) -> Result<()> {
        *write(&self.types)? = entries;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_ids_are_stable() {
        let mapper = NameIdMapper::new();
        let person = mapper.name_to_id("Person").unwrap();
        let age = mapper.name_to_id("age").unwrap();
        assert_ne!(person, age);
        assert_eq!(mapper.name_to_id("Person").unwrap(), person);
        assert_eq!(mapper.id_to_name(age).unwrap().as_deref(), Some("age"));
        assert!(mapper.insert_recovered(person, "Other".to_string()).is_err());
    }

    #[test]
    fn test_enum_lookup() {
        let enums = EnumStore::new();
        let status = enums
            .register("Status", vec!["Active".to_string(), "Retired".to_string()])
            .unwrap();
        assert_eq!(
            enums.to_enum("Status", "Retired").unwrap(),
            Some(PropertyValue::Enum(status, EnumValueId(1)))
        );
        assert_eq!(enums.to_enum("Status", "Gone").unwrap(), None);
        assert!(enums.register("Status", vec!["X".to_string()]).is_err());
    }
}
