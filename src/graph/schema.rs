//! Schema statistics: how many live vertices carry each label, which
//! property types appear under each label, and how many live edges have
//! each type. Kept current at commit and rebuilt while a snapshot loads.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::types::{EdgeData, EdgeTypeId, LabelId, PropertyId, PropertyType, VertexData};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaInfo {
    pub labels: BTreeMap<LabelId, u64>,
    /// Live vertices with the label holding a value of the type under the property.
    pub property_types: BTreeMap<(LabelId, PropertyId, PropertyType), u64>,
    pub edge_types: BTreeMap<EdgeTypeId, u64>,
}

fn adjust<K: Ord>(counts: &mut BTreeMap<K, u64>, key: K, add: bool) {
    if add {
        *counts.entry(key).or_insert(0) += 1;
        return;
    }
    if let Entry::Occupied(mut slot) = counts.entry(key) {
        if *slot.get() <= 1 {
            slot.remove();
        } else {
            *slot.get_mut() -= 1;
        }
    }
}

impl SchemaInfo {
    pub fn add_vertex(&mut self, vertex: &VertexData) {
        self.apply_vertex(vertex, true);
    }

    pub fn add_edge(&mut self, edge: &EdgeData) {
        self.apply_edge(edge, true);
    }

    /// Replaces `before` with `after`; deleted states count as absent.
    pub fn update_vertex(&mut self, before: &VertexData, after: &VertexData) {
        if before == after {
            return;
        }
        self.apply_vertex(before, false);
        self.apply_vertex(after, true);
    }

    pub fn update_edge(&mut self, before: &EdgeData, after: &EdgeData) {
        if before == after {
            return;
        }
        self.apply_edge(before, false);
        self.apply_edge(after, true);
    }

    pub fn label_count(&self, label: LabelId) -> u64 {
        self.labels.get(&label).copied().unwrap_or(0)
    }

    pub fn edge_type_count(&self, edge_type: EdgeTypeId) -> u64 {
        self.edge_types.get(&edge_type).copied().unwrap_or(0)
    }

    fn apply_vertex(&mut self, vertex: &VertexData, add: bool) {
        if vertex.deleted {
            return;
        }
        for label in &vertex.labels {
            adjust(&mut self.labels, *label, add);
            for (property, value) in &vertex.properties {
                if let Some(property_type) = value.property_type() {
                    adjust(&mut self.property_types, (*label, *property, property_type), add);
                }
            }
        }
    }

    fn apply_edge(&mut self, edge: &EdgeData, add: bool) {
        if !edge.deleted {
            adjust(&mut self.edge_types, edge.edge_type, add);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Gid, PropertyValue};

    fn person(age: PropertyValue) -> VertexData {
        let mut vertex = VertexData::new();
        vertex.labels.insert(LabelId(1));
        vertex.properties.insert(PropertyId(2), age);
        vertex
    }

    #[test]
    fn test_updates_move_counts_between_types() {
        let mut schema = SchemaInfo::default();
        schema.add_vertex(&person(PropertyValue::Int(30)));
        schema.add_vertex(&person(PropertyValue::Int(31)));
        schema.update_vertex(&person(PropertyValue::Int(31)), &person(PropertyValue::from("old")));

        assert_eq!(schema.label_count(LabelId(1)), 2);
        assert_eq!(schema.property_types.get(&(LabelId(1), PropertyId(2), PropertyType::Int)), Some(&1));
        assert_eq!(
            schema.property_types.get(&(LabelId(1), PropertyId(2), PropertyType::String)),
            Some(&1)
        );

        let mut gone = person(PropertyValue::Int(30));
        gone.deleted = true;
        schema.update_vertex(&person(PropertyValue::Int(30)), &gone);
        assert_eq!(schema.label_count(LabelId(1)), 1);
        assert!(!schema
            .property_types
            .contains_key(&(LabelId(1), PropertyId(2), PropertyType::Int)));
    }

    #[test]
    fn test_edge_counts_ignore_deleted_edges() {
        let mut schema = SchemaInfo::default();
        let edge = EdgeData::new(EdgeTypeId(3), Gid(0), Gid(1));
        let mut deleted = edge.clone();
        deleted.deleted = true;

        schema.update_edge(&deleted, &edge);
        assert_eq!(schema.edge_type_count(EdgeTypeId(3)), 1);
        schema.update_edge(&edge, &deleted);
        assert_eq!(schema.edge_type_count(EdgeTypeId(3)), 0);
        assert!(schema.edge_types.is_empty());
    }
}
