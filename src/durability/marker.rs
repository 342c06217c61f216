/// One-byte tags written in front of every section and every typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Marker {
    TypeNull = 0x10,
    TypeBool = 0x11,
    TypeInt = 0x12,
    TypeDouble = 0x13,
    TypeString = 0x14,
    TypeList = 0x15,
    TypeMap = 0x16,
    TypeEnum = 0x17,

    SectionEdge = 0x20,
    SectionVertex = 0x21,
    SectionIndices = 0x22,
    SectionEdgeIndices = 0x23,
    SectionConstraints = 0x24,
    SectionMapper = 0x25,
    SectionEnums = 0x26,
    SectionEpochHistory = 0x27,
    SectionMetadata = 0x28,
    SectionEdgeBatches = 0x29,
    SectionVertexBatches = 0x2a,
    SectionOffsets = 0x2b,
}

impl Marker {
    const ALL: [Marker; 20] = [
        Marker::TypeNull,
        Marker::TypeBool,
        Marker::TypeInt,
        Marker::TypeDouble,
        Marker::TypeString,
        Marker::TypeList,
        Marker::TypeMap,
        Marker::TypeEnum,
        Marker::SectionEdge,
        Marker::SectionVertex,
        Marker::SectionIndices,
        Marker::SectionEdgeIndices,
        Marker::SectionConstraints,
        Marker::SectionMapper,
        Marker::SectionEnums,
        Marker::SectionEpochHistory,
        Marker::SectionMetadata,
        Marker::SectionEdgeBatches,
        Marker::SectionVertexBatches,
        Marker::SectionOffsets,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Marker> {
        Self::ALL.into_iter().find(|m| m.as_byte() == byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_round_trip_through_bytes() {
        for marker in Marker::ALL {
            assert_eq!(Marker::from_byte(marker.as_byte()), Some(marker));
        }
        assert_eq!(Marker::from_byte(0x00), None);
    }
}
