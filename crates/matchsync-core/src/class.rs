//! Variable classes and validation status
//!
//! MatchSync distinguishes three variable classes by who may write them:
//! - Shared: any peer
//! - User: only the peer whose user id scopes the entry
//! - Presence: only the peer currently assigned the slot by the rotator

use std::fmt;

use crate::VarKind;

/// Variable class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum VarClass {
    Shared = 0x00,
    User = 0x01,
    Presence = 0x02,
}

impl VarClass {
    /// Parse from wire byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(VarClass::Shared),
            0x01 => Some(VarClass::User),
            0x02 => Some(VarClass::Presence),
            _ => None,
        }
    }

    /// Convert to wire byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Entries of this class are scoped by a user id
    #[inline]
    pub fn is_user_scoped(self) -> bool {
        !matches!(self, VarClass::Shared)
    }
}

impl fmt::Display for VarClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarClass::Shared => "shared",
            VarClass::User => "user",
            VarClass::Presence => "presence",
        };
        f.write_str(name)
    }
}

/// Per-entry validation state
///
/// `None` (never set) -> `Pending` on local write -> `Validated` on host
/// acknowledgement. A write while `Validated` goes back to `Pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ValidationStatus {
    #[default]
    None = 0x00,
    Pending = 0x01,
    Validated = 0x02,
}

impl ValidationStatus {
    /// Parse from wire byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(ValidationStatus::None),
            0x01 => Some(ValidationStatus::Pending),
            0x02 => Some(ValidationStatus::Validated),
            _ => None,
        }
    }

    /// Convert to wire byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// A guest may treat the value as caught up
    #[inline]
    pub fn is_settled(self) -> bool {
        !matches!(self, ValidationStatus::Pending)
    }
}

/// Variable identity: unique per (class, kind, key)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId {
    pub class: VarClass,
    pub kind: VarKind,
    pub key: String,
}

impl VarId {
    pub fn new(class: VarClass, kind: VarKind, key: impl Into<String>) -> Self {
        VarId {
            class,
            kind,
            key: key.into(),
        }
    }

    #[inline]
    pub fn shared(kind: VarKind, key: impl Into<String>) -> Self {
        VarId::new(VarClass::Shared, kind, key)
    }

    #[inline]
    pub fn user(kind: VarKind, key: impl Into<String>) -> Self {
        VarId::new(VarClass::User, kind, key)
    }

    #[inline]
    pub fn presence(kind: VarKind, key: impl Into<String>) -> Self {
        VarId::new(VarClass::Presence, kind, key)
    }
}

impl fmt::Debug for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Var({}:{}:{})", self.class, self.kind, self.key)
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.class, self.kind, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_settled() {
        assert!(ValidationStatus::None.is_settled());
        assert!(!ValidationStatus::Pending.is_settled());
        assert!(ValidationStatus::Validated.is_settled());
    }

    #[test]
    fn test_var_id_distinguishes_kind() {
        let a = VarId::shared(VarKind::Bool, "ready");
        let b = VarId::shared(VarKind::Int, "ready");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "shared:bool:ready");
    }

    #[test]
    fn test_class_bytes() {
        assert_eq!(VarClass::from_byte(VarClass::Presence.to_byte()), Some(VarClass::Presence));
        assert_eq!(VarClass::from_byte(9), None);
        assert!(VarClass::User.is_user_scoped());
        assert!(!VarClass::Shared.is_user_scoped());
    }
}
