use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use crate::error::{ConstraintDefinitionError, ConstraintKind, ConstraintViolation, Result};
use crate::sync::{read, write};
use crate::types::{Gid, LabelId, PropertyId, PropertyType, PropertyValue, VertexData};

/// Every registered constraint, in a form the snapshot writer can walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintsInfo {
    pub existence: Vec<(LabelId, PropertyId)>,
    pub unique: Vec<(LabelId, Vec<PropertyId>)>,
    pub types: Vec<(LabelId, PropertyId, PropertyType)>,
}

#[derive(Debug, Default)]
struct ConstraintSet {
    existence: BTreeSet<(LabelId, PropertyId)>,
    unique: BTreeSet<(LabelId, Vec<PropertyId>)>,
    types: BTreeMap<(LabelId, PropertyId), PropertyType>,
}

/// Existence, uniqueness and type constraints on labelled vertices.
///
/// Creating a constraint checks the vertices the caller passes in; commits
/// are checked by the storage through the `validate_*` methods.
#[derive(Debug, Default)]
pub struct Constraints {
    set: RwLock<ConstraintSet>,
}

fn existence_violation(set: &ConstraintSet, vertex: &VertexData) -> Option<ConstraintViolation> {
    set.existence
        .iter()
        .find(|(label, property)| vertex.has_label(*label) && !vertex.properties.contains_key(property))
        .map(|(label, property)| ConstraintViolation {
            kind: ConstraintKind::Existence,
            label: *label,
            properties: vec![*property],
        })
}

fn type_violation(set: &ConstraintSet, vertex: &VertexData) -> Option<ConstraintViolation> {
    set.types
        .iter()
        .find(|((label, property), expected)| {
            vertex.has_label(*label)
                && vertex
                    .properties
                    .get(property)
                    .and_then(PropertyValue::property_type)
                    .is_some_and(|found| found != **expected)
        })
        .map(|((label, property), _)| ConstraintViolation {
            kind: ConstraintKind::Type,
            label: *label,
            properties: vec![*property],
        })
}

/// The values a vertex holds for a unique constraint; `None` unless it has
/// the label and every property.
fn unique_values(vertex: &VertexData, label: LabelId, properties: &[PropertyId]) -> Option<Vec<PropertyValue>> {
    if vertex.deleted || !vertex.has_label(label) {
        return None;
    }
    properties
        .iter()
        .map(|p| vertex.properties.get(p).cloned())
        .collect()
}

impl Constraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_existence(&self, label: LabelId, property: PropertyId, vertices: &[(Gid, VertexData)]) -> Result<()> {
        let mut set = write(&self.set)?;
        if set.existence.contains(&(label, property)) {
            return Err(ConstraintDefinitionError::Definition.into());
        }
        let candidate = ConstraintSet {
            existence: BTreeSet::from([(label, property)]),
            ..ConstraintSet::default()
        };
        if let Some(violation) = vertices.iter().find_map(|(_, v)| existence_violation(&candidate, v)) {
            return Err(ConstraintDefinitionError::Violation(violation).into());
        }
        set.existence.insert((label, property));
        Ok(())
    }

    pub fn drop_existence(&self, label: LabelId, property: PropertyId) -> Result<()> {
        if !write(&self.set)?.existence.remove(&(label, property)) {
            return Err(ConstraintDefinitionError::Definition.into());
        }
        Ok(())
    }

    pub fn create_unique(&self, label: LabelId, properties: Vec<PropertyId>, vertices: &[(Gid, VertexData)]) -> Result<()> {
        let distinct: BTreeSet<_> = properties.iter().collect();
        if properties.is_empty() || distinct.len() != properties.len() {
            return Err(ConstraintDefinitionError::Definition.into());
        }
        let mut set = write(&self.set)?;
        if set.unique.contains(&(label, properties.clone())) {
            return Err(ConstraintDefinitionError::Definition.into());
        }
        let mut seen = BTreeSet::new();
        for (_, vertex) in vertices {
            if let Some(values) = unique_values(vertex, label, &properties) {
                if !seen.insert(values) {
                    return Err(ConstraintDefinitionError::Violation(ConstraintViolation {
                        kind: ConstraintKind::Unique,
                        label,
                        properties,
                    })
                    .into());
                }
            }
        }
        set.unique.insert((label, properties));
        Ok(())
    }

    pub fn drop_unique(&self, label: LabelId, properties: Vec<PropertyId>) -> Result<()> {
        if !write(&self.set)?.unique.remove(&(label, properties)) {
            return Err(ConstraintDefinitionError::Definition.into());
        }
        Ok(())
    }

    pub fn create_type(
        &self,
        label: LabelId,
        property: PropertyId,
        property_type: PropertyType,
        vertices: &[(Gid, VertexData)],
    ) -> Result<()> {
        let mut set = write(&self.set)?;
        if set.types.contains_key(&(label, property)) {
            return Err(ConstraintDefinitionError::Definition.into());
        }
        let candidate = ConstraintSet {
            types: BTreeMap::from([((label, property), property_type)]),
            ..ConstraintSet::default()
        };
        if let Some(violation) = vertices.iter().find_map(|(_, v)| type_violation(&candidate, v)) {
            return Err(ConstraintDefinitionError::Violation(violation).into());
        }
        set.types.insert((label, property), property_type);
        Ok(())
    }

    pub fn drop_type(&self, label: LabelId, property: PropertyId) -> Result<()> {
        if write(&self.set)?.types.remove(&(label, property)).is_none() {
            return Err(ConstraintDefinitionError::Definition.into());
        }
        Ok(())
    }

    /// Existence and type checks on one vertex's final state.
    pub fn validate_vertex(&self, vertex: &VertexData) -> Result<Option<ConstraintViolation>> {
        if vertex.deleted {
            return Ok(None);
        }
        let set = read(&self.set)?;
        Ok(existence_violation(&set, vertex).or_else(|| type_violation(&set, vertex)))
    }

    pub fn has_unique(&self) -> Result<bool> {
        Ok(!read(&self.set)?.unique.is_empty())
    }

    /// Whether `vertex` collides with any other vertex in `others` on a
    /// unique constraint.
    pub fn validate_unique(
        &self,
        gid: Gid,
        vertex: &VertexData,
        others: &[(Gid, VertexData)],
    ) -> Result<Option<ConstraintViolation>> {
        let set = read(&self.set)?;
        for (label, properties) in &set.unique {
            let Some(values) = unique_values(vertex, *label, properties) else {
                continue;
            };
            let collides = others.iter().any(|(other_gid, other)| {
                *other_gid != gid && unique_values(other, *label, properties).as_ref() == Some(&values)
            });
            if collides {
                return Ok(Some(ConstraintViolation {
                    kind: ConstraintKind::Unique,
                    label: *label,
                    properties: properties.clone(),
                }));
            }
        }
        Ok(None)
    }

    pub fn info(&self) -> Result<ConstraintsInfo> {
        let set = read(&self.set)?;
        Ok(ConstraintsInfo {
            existence: set.existence.iter().copied().collect(),
            unique: set.unique.iter().cloned().collect(),
            types: set.types.iter().map(|((l, p), t)| (*l, *p, *t)).collect(),
        })
    }

    /// Installs recovered constraints without re-checking them.
    pub(crate) fn restore(&self, info: ConstraintsInfo) -> Result<()> {
        let mut set = write(&self.set)?;
        set.existence.extend(info.existence);
        set.unique.extend(info.unique);
        set.types
            .extend(info.types.into_iter().map(|(l, p, t)| ((l, p), t)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    fn vertex(label: u64, props: &[(u64, PropertyValue)]) -> VertexData {
        let mut v = VertexData::new();
        v.labels.insert(LabelId(label));
        for (p, value) in props {
            v.properties.insert(PropertyId(*p), value.clone());
        }
        v
    }

    #[test]
    fn test_existence_constraint_checks_existing_vertices() {
        let constraints = Constraints::new();
        let vertices = vec![(Gid(0), vertex(1, &[]))];
        let err = constraints
            .create_existence(LabelId(1), PropertyId(2), &vertices)
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::ConstraintDefinition(ConstraintDefinitionError::Violation(_))
        ));

        constraints.create_existence(LabelId(1), PropertyId(2), &[]).unwrap();
        let violation = constraints.validate_vertex(&vertex(1, &[])).unwrap().unwrap();
        assert_eq!(violation.kind, ConstraintKind::Existence);
        assert!(constraints
            .validate_vertex(&vertex(1, &[(2, PropertyValue::Int(1))]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_duplicate_definitions_are_rejected() {
        let constraints = Constraints::new();
        constraints.create_type(LabelId(1), PropertyId(2), PropertyType::Int, &[]).unwrap();
        assert!(matches!(
            constraints.create_type(LabelId(1), PropertyId(2), PropertyType::Int, &[]),
            Err(StorageError::ConstraintDefinition(ConstraintDefinitionError::Definition))
        ));
        assert!(matches!(
            constraints.drop_existence(LabelId(1), PropertyId(2)),
            Err(StorageError::ConstraintDefinition(ConstraintDefinitionError::Definition))
        ));
        let info = constraints.info().unwrap();
        assert_eq!(info.types, vec![(LabelId(1), PropertyId(2), PropertyType::Int)]);
    }

    #[test]
    fn test_unique_constraint_detects_collisions() {
        let constraints = Constraints::new();
        constraints.create_unique(LabelId(1), vec![PropertyId(2)], &[]).unwrap();
        let a = vertex(1, &[(2, PropertyValue::from("x"))]);
        let others = vec![(Gid(1), a.clone()), (Gid(2), vertex(1, &[(2, PropertyValue::from("y"))]))];

        assert!(constraints.validate_unique(Gid(1), &a, &others).unwrap().is_none());
        let violation = constraints.validate_unique(Gid(3), &a, &others).unwrap().unwrap();
        assert_eq!(violation.kind, ConstraintKind::Unique);
    }
}
