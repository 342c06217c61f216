use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::{EdgeTypeId, Gid, PropertyId};
use super::property_value::PropertyValue;

/// The state of an edge at one point of its version chain.
/// Type and endpoints never change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeData {
    pub edge_type: EdgeTypeId,
    pub from: Gid, // The vertex where the edge starts.
    pub to: Gid,   // The vertex where the edge ends.
    pub properties: BTreeMap<PropertyId, PropertyValue>,
    pub deleted: bool,
}

impl EdgeData {
    pub fn new(edge_type: EdgeTypeId, from: Gid, to: Gid) -> Self {
        Self {
            edge_type,
            from,
            to,
            properties: BTreeMap::new(),
            deleted: false,
        }
    }

    pub fn property(&self, property: PropertyId) -> PropertyValue {
        self.properties.get(&property).cloned().unwrap_or_default()
    }
}
