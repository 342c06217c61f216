use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use super::ids::{EnumTypeId, EnumValueId};

/// A property value stored on a vertex or an edge.
///
/// Values have a total order so they can be used as index keys: values of
/// different kinds are ordered by kind, and integers compare numerically
/// against doubles (`Int(1) == Double(1.0)`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PropertyValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
    Enum(EnumTypeId, EnumValueId),
}

/// The kind of a property value, used by type constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    Bool,
    Int,
    Float,
    String,
    List,
    Map,
    Enum,
}

impl PropertyType {
    pub(crate) fn to_u64(self) -> u64 {
        match self {
            PropertyType::Bool => 0,
            PropertyType::Int => 1,
            PropertyType::Float => 2,
            PropertyType::String => 3,
            PropertyType::List => 4,
            PropertyType::Map => 5,
            PropertyType::Enum => 6,
        }
    }

    pub(crate) fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            0 => PropertyType::Bool,
            1 => PropertyType::Int,
            2 => PropertyType::Float,
            3 => PropertyType::String,
            4 => PropertyType::List,
            5 => PropertyType::Map,
            6 => PropertyType::Enum,
            _ => return None,
        })
    }
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// The type of a non-null value.
    pub fn property_type(&self) -> Option<PropertyType> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::Bool(_) => Some(PropertyType::Bool),
            PropertyValue::Int(_) => Some(PropertyType::Int),
            PropertyValue::Double(_) => Some(PropertyType::Float),
            PropertyValue::String(_) => Some(PropertyType::String),
            PropertyValue::List(_) => Some(PropertyType::List),
            PropertyValue::Map(_) => Some(PropertyType::Map),
            PropertyValue::Enum(..) => Some(PropertyType::Enum),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            PropertyValue::Null => 0,
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) | PropertyValue::Double(_) => 2,
            PropertyValue::String(_) => 3,
            PropertyValue::List(_) => 4,
            PropertyValue::Map(_) => 5,
            PropertyValue::Enum(..) => 6,
        }
    }
}

impl Ord for PropertyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use PropertyValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Int(a), Double(b)) => (*a as f64).total_cmp(b),
            (Double(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (String(a), String(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),
            (Map(a), Map(b)) => a.cmp(b),
            (Enum(ta, va), Enum(tb, vb)) => (ta, va).cmp(&(tb, vb)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for PropertyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PropertyValue {}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

/// Lets callers build property values straight from JSON documents.
impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropertyValue::Null,
            serde_json::Value::Bool(b) => PropertyValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Int(i),
                None => PropertyValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => PropertyValue::String(s),
            serde_json::Value::Array(items) => {
                PropertyValue::List(items.into_iter().map(PropertyValue::from).collect())
            }
            serde_json::Value::Object(fields) => PropertyValue::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, PropertyValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Lower/upper bounds on one property of a (possibly composite) index.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyValueRange {
    pub lower: Bound<PropertyValue>,
    pub upper: Bound<PropertyValue>,
}

impl PropertyValueRange {
    pub fn new(lower: Bound<PropertyValue>, upper: Bound<PropertyValue>) -> Self {
        Self { lower, upper }
    }

    /// Matches every value, useful for unconstrained positions of a composite index.
    pub fn unbounded() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn contains(&self, value: &PropertyValue) -> bool {
        let above = match &self.lower {
            Bound::Included(low) => value >= low,
            Bound::Excluded(low) => value > low,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(high) => value <= high,
            Bound::Excluded(high) => value < high,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// True once `value` lies past the upper bound.
    pub fn is_past_upper(&self, value: &PropertyValue) -> bool {
        match &self.upper {
            Bound::Included(high) => value > high,
            Bound::Excluded(high) => value >= high,
            Bound::Unbounded => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_numbers_compare_across_kinds() {
        assert_eq!(PropertyValue::Int(1), PropertyValue::Double(1.0));
        assert!(PropertyValue::Int(1) < PropertyValue::Double(1.5));
        assert!(PropertyValue::Double(-3.5) < PropertyValue::Int(0));
    }

    #[test]
    fn test_kinds_are_ordered_by_rank() {
        let ordered = vec![
            PropertyValue::Null,
            PropertyValue::Bool(true),
            PropertyValue::Int(i64::MAX),
            PropertyValue::String(String::new()),
            PropertyValue::List(vec![]),
            PropertyValue::Map(BTreeMap::new()),
        ];
        let mut shuffled = ordered.clone();
        shuffled.reverse();
        shuffled.sort();
        assert_eq!(shuffled, ordered);
    }

    #[test]
    fn test_from_json() {
        let value = PropertyValue::from(json!({"name": "Alice", "age": 30, "tags": ["a", 1.5]}));
        let PropertyValue::Map(fields) = value else {
            panic!("expected a map");
        };
        assert_eq!(fields["name"], PropertyValue::from("Alice"));
        assert_eq!(fields["age"], PropertyValue::Int(30));
        assert_eq!(
            fields["tags"],
            PropertyValue::List(vec![PropertyValue::from("a"), PropertyValue::Double(1.5)])
        );
    }

    #[test]
    fn test_range_contains() {
        let range = PropertyValueRange::new(
            Bound::Included(PropertyValue::Int(10)),
            Bound::Excluded(PropertyValue::Int(20)),
        );
        assert!(range.contains(&PropertyValue::Int(10)));
        assert!(range.contains(&PropertyValue::Double(19.5)));
        assert!(!range.contains(&PropertyValue::Int(20)));
        assert!(range.is_past_upper(&PropertyValue::Int(20)));
        assert!(!range.is_past_upper(&PropertyValue::Int(5)));
    }

    proptest! {
        #[test]
        fn prop_int_order_matches_i64(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(PropertyValue::Int(a).cmp(&PropertyValue::Int(b)), a.cmp(&b));
        }

        #[test]
        fn prop_order_is_antisymmetric(a in -1000i64..1000, b in -1000.0f64..1000.0) {
            let x = PropertyValue::Int(a);
            let y = PropertyValue::Double(b);
            prop_assert_eq!(x.cmp(&y), y.cmp(&x).reverse());
        }
    }
}
