use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::ids::{LabelId, PropertyId};
use super::property_value::PropertyValue;

/// The state of a vertex at one point of its version chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexData {
    pub labels: BTreeSet<LabelId>,
    pub properties: BTreeMap<PropertyId, PropertyValue>,
    pub deleted: bool,
}

impl VertexData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_label(&self, label: LabelId) -> bool {
        self.labels.contains(&label)
    }

    /// Returns the property value, `Null` when absent.
    pub fn property(&self, property: PropertyId) -> PropertyValue {
        self.properties.get(&property).cloned().unwrap_or_default()
    }

    /// The values this vertex contributes to the `(label, properties)` index.
    ///
    /// A vertex is indexed when it is live, carries the label and has at
    /// least one of the properties; missing ones are indexed as `Null`.
    pub fn index_values(&self, label: LabelId, properties: &[PropertyId]) -> Option<Vec<PropertyValue>> {
        if self.deleted || !self.has_label(label) {
            return None;
        }
        let values: Vec<PropertyValue> = properties.iter().map(|p| self.property(*p)).collect();
        if values.iter().all(PropertyValue::is_null) {
            return None;
        }
        Some(values)
    }
}
