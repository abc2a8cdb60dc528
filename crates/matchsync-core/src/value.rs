//! Value kinds carried by synced variables
//!
//! Variables are generic over a small closed set of kinds. On the wire and in
//! the store every value is a [`VarValue`]; typed handles convert through
//! [`SyncValue`].

use std::fmt;

/// Value kind tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum VarKind {
    Bool = 0x00,
    Int = 0x01,
    Float = 0x02,
    String = 0x03,
    /// Structured JSON payload
    Object = 0x04,
}

impl VarKind {
    /// Parse from wire byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(VarKind::Bool),
            0x01 => Some(VarKind::Int),
            0x02 => Some(VarKind::Float),
            0x03 => Some(VarKind::String),
            0x04 => Some(VarKind::Object),
            _ => None,
        }
    }

    /// Convert to wire byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Default value for this kind
    pub fn default_value(self) -> VarValue {
        match self {
            VarKind::Bool => VarValue::Bool(false),
            VarKind::Int => VarValue::Int(0),
            VarKind::Float => VarValue::Float(0.0),
            VarKind::String => VarValue::String(String::new()),
            VarKind::Object => VarValue::Object(serde_json::Value::Null),
        }
    }
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarKind::Bool => "bool",
            VarKind::Int => "int",
            VarKind::Float => "float",
            VarKind::String => "string",
            VarKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// Tagged value union
#[derive(Clone, Debug, PartialEq)]
pub enum VarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Object(serde_json::Value),
}

impl VarValue {
    #[inline]
    pub fn kind(&self) -> VarKind {
        match self {
            VarValue::Bool(_) => VarKind::Bool,
            VarValue::Int(_) => VarKind::Int,
            VarValue::Float(_) => VarKind::Float,
            VarValue::String(_) => VarKind::String,
            VarValue::Object(_) => VarKind::Object,
        }
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Bool(v) => write!(f, "{}", v),
            VarValue::Int(v) => write!(f, "{}", v),
            VarValue::Float(v) => write!(f, "{}", v),
            VarValue::String(v) => write!(f, "{:?}", v),
            VarValue::Object(v) => write!(f, "{}", v),
        }
    }
}

/// Rust types that can back a synced variable
pub trait SyncValue: Clone + Default + Send + Sync + 'static {
    const KIND: VarKind;

    fn into_value(self) -> VarValue;

    /// Returns `None` when the value is of another kind
    fn from_value(value: &VarValue) -> Option<Self>;
}

impl SyncValue for bool {
    const KIND: VarKind = VarKind::Bool;

    fn into_value(self) -> VarValue {
        VarValue::Bool(self)
    }

    fn from_value(value: &VarValue) -> Option<Self> {
        match value {
            VarValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl SyncValue for i64 {
    const KIND: VarKind = VarKind::Int;

    fn into_value(self) -> VarValue {
        VarValue::Int(self)
    }

    fn from_value(value: &VarValue) -> Option<Self> {
        match value {
            VarValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl SyncValue for f64 {
    const KIND: VarKind = VarKind::Float;

    fn into_value(self) -> VarValue {
        VarValue::Float(self)
    }

    fn from_value(value: &VarValue) -> Option<Self> {
        match value {
            VarValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl SyncValue for String {
    const KIND: VarKind = VarKind::String;

    fn into_value(self) -> VarValue {
        VarValue::String(self)
    }

    fn from_value(value: &VarValue) -> Option<Self> {
        match value {
            VarValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl SyncValue for serde_json::Value {
    const KIND: VarKind = VarKind::Object;

    fn into_value(self) -> VarValue {
        VarValue::Object(self)
    }

    fn from_value(value: &VarValue) -> Option<Self> {
        match value {
            VarValue::Object(v) => Some(v.clone()),
            _ => None,
        }
    }
}
