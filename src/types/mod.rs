pub mod edge;
pub mod ids;
pub mod property_value;
pub mod vertex;

pub use edge::EdgeData;
pub use ids::{
    EdgeTypeId, EnumTypeId, EnumValueId, Gid, LabelId, PropertyId, Timestamp, TransactionId,
    TRANSACTION_INITIAL_ID,
};
pub use property_value::{PropertyType, PropertyValue, PropertyValueRange};
pub use vertex::VertexData;
