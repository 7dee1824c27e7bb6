//! CA DBR type tags.
//!
//! Values travel as opaque payloads through this crate; the engine only needs
//! to know whether a type tag is valid and how many bytes an element of it
//! occupies, so that requests can be checked before they reach the wire.
//!
//! There are seven basic value types, each available in five categories of
//! attached metadata (`DBR_<category>_<type>` with tag `category * 7 + type`),
//! plus four special tags from 35 to 38.

use std::fmt;

/// Highest valid type tag (`DBR_CLASS_NAME`)
pub const LAST_BUFFER_TYPE: u16 = 38;

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl TryFrom<u16> for DbrBasicType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::String),
            1 => Ok(Self::Int),
            2 => Ok(Self::Float),
            3 => Ok(Self::Enum),
            4 => Ok(Self::Char),
            5 => Ok(Self::Long),
            6 => Ok(Self::Double),
            _ => Err(()),
        }
    }
}

impl DbrBasicType {
    /// Bytes occupied by one element of this type
    pub fn element_size(&self) -> usize {
        match self {
            Self::String => 40,
            Self::Int | Self::Enum => 2,
            Self::Float | Self::Long => 4,
            Self::Char => 1,
            Self::Double => 8,
        }
    }
}

/// Mapping of DBR categories, and the special single-purpose tags
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
    PutAckT = 35,
    PutAckS = 36,
    StsAckString = 37,
    ClassName = 38,
}

/// Represent and translate from ID every possible combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl TryFrom<u16> for DbrType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let special = |basic_type, category| Ok(DbrType { basic_type, category });
        match value {
            0..35 => Ok(DbrType {
                basic_type: (value % 7).try_into()?,
                category: match value / 7 {
                    0 => DbrCategory::Basic,
                    1 => DbrCategory::Status,
                    2 => DbrCategory::Time,
                    3 => DbrCategory::Graphics,
                    _ => DbrCategory::Control,
                },
            }),
            35 => special(DbrBasicType::Int, DbrCategory::PutAckT),
            36 => special(DbrBasicType::Int, DbrCategory::PutAckS),
            37 => special(DbrBasicType::String, DbrCategory::StsAckString),
            38 => special(DbrBasicType::String, DbrCategory::ClassName),
            _ => Err(()),
        }
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        match value.category {
            DbrCategory::PutAckT
            | DbrCategory::PutAckS
            | DbrCategory::StsAckString
            | DbrCategory::ClassName => value.category as u16,
            category => category as u16 * 7 + value.basic_type as u16,
        }
    }
}

impl DbrType {
    /// Bytes of metadata (including alignment padding) ahead of the values
    pub fn metadata_size(&self) -> usize {
        use DbrBasicType::*;
        match (self.category, self.basic_type) {
            (DbrCategory::Basic, _) => 0,
            (DbrCategory::Status, Char) => 5,
            (DbrCategory::Status, Double) => 8,
            (DbrCategory::Status, _) => 4,
            (DbrCategory::Time, Int | Enum) => 14,
            (DbrCategory::Time, Char) => 15,
            (DbrCategory::Time, Double) => 16,
            (DbrCategory::Time, _) => 12,
            (DbrCategory::Graphics, String) => 4,
            (DbrCategory::Graphics, Int) => 24,
            (DbrCategory::Graphics, Float) => 40,
            (DbrCategory::Graphics, Enum) => 420,
            (DbrCategory::Graphics, Char) => 19,
            (DbrCategory::Graphics, Long) => 36,
            (DbrCategory::Graphics, Double) => 64,
            (DbrCategory::Control, String) => 4,
            (DbrCategory::Control, Int) => 28,
            (DbrCategory::Control, Float) => 48,
            (DbrCategory::Control, Enum) => 420,
            (DbrCategory::Control, Char) => 21,
            (DbrCategory::Control, Long) => 44,
            (DbrCategory::Control, Double) => 80,
            (DbrCategory::StsAckString, _) => 8,
            (DbrCategory::PutAckT | DbrCategory::PutAckS | DbrCategory::ClassName, _) => 0,
        }
    }

    /// Size of a payload holding `count` elements of this type
    pub fn payload_size(&self, count: u32) -> usize {
        self.metadata_size() + self.basic_type.element_size() * count.max(1) as usize
    }

    /// Largest element count whose padded payload fits in `max_bytes`
    pub fn max_element_count(&self, max_bytes: usize) -> u32 {
        let available = (max_bytes & !7).saturating_sub(self.metadata_size());
        (available / self.basic_type.element_size()).min(u32::MAX as usize) as u32
    }
}

impl fmt::Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let basic = match self.basic_type {
            DbrBasicType::String => "STRING",
            DbrBasicType::Int => "SHORT",
            DbrBasicType::Float => "FLOAT",
            DbrBasicType::Enum => "ENUM",
            DbrBasicType::Char => "CHAR",
            DbrBasicType::Long => "LONG",
            DbrBasicType::Double => "DOUBLE",
        };
        match self.category {
            DbrCategory::Basic => write!(f, "DBR_{basic}"),
            DbrCategory::Status => write!(f, "DBR_STS_{basic}"),
            DbrCategory::Time => write!(f, "DBR_TIME_{basic}"),
            DbrCategory::Graphics => write!(f, "DBR_GR_{basic}"),
            DbrCategory::Control => write!(f, "DBR_CTRL_{basic}"),
            DbrCategory::PutAckT => f.write_str("DBR_PUT_ACKT"),
            DbrCategory::PutAckS => f.write_str("DBR_PUT_ACKS"),
            DbrCategory::StsAckString => f.write_str("DBR_STSACK_STRING"),
            DbrCategory::ClassName => f.write_str("DBR_CLASS_NAME"),
        }
    }
}
