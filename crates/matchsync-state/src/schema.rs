//! Schema comparison for the handshake

use std::collections::BTreeSet;

use matchsync_core::{SyncError, VarId};
use matchsync_wire::SchemaEntry;

/// Differences between the host schema and a guest schema
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Declared on the host, absent on the guest
    pub missing: Vec<VarId>,
    /// Declared on the guest, absent on the host
    pub unexpected: Vec<VarId>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }

    pub fn into_error(self) -> SyncError {
        SyncError::SchemaMismatch {
            missing: self.missing,
            unexpected: self.unexpected,
        }
    }
}

/// Compare schemas by id, kind and slot count
///
/// A presence collection declared with different slot counts shows up in
/// both lists.
pub fn compare_schemas(host: &[SchemaEntry], guest: &[SchemaEntry]) -> SchemaDiff {
    let host: BTreeSet<&SchemaEntry> = host.iter().collect();
    let guest: BTreeSet<&SchemaEntry> = guest.iter().collect();

    SchemaDiff {
        missing: host.difference(&guest).map(|e| e.id.clone()).collect(),
        unexpected: guest.difference(&host).map(|e| e.id.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchsync_core::VarKind;

    fn shared(key: &str) -> SchemaEntry {
        SchemaEntry::new(VarId::shared(VarKind::Int, key))
    }

    #[test]
    fn test_identical_schemas() {
        let a = vec![shared("A"), shared("B")];
        let b = vec![shared("B"), shared("A")];
        assert!(compare_schemas(&a, &b).is_empty());
    }

    #[test]
    fn test_missing_and_unexpected() {
        let host = vec![shared("A"), shared("B")];
        let guest = vec![shared("A"), shared("C")];
        let diff = compare_schemas(&host, &guest);
        assert_eq!(diff.missing, vec![VarId::shared(VarKind::Int, "B")]);
        assert_eq!(diff.unexpected, vec![VarId::shared(VarKind::Int, "C")]);
    }

    #[test]
    fn test_kind_and_slot_mismatch() {
        let host = vec![
            SchemaEntry::new(VarId::shared(VarKind::Bool, "flag")),
            SchemaEntry::with_slots(VarId::presence(VarKind::Float, "pos"), 4),
        ];
        let guest = vec![
            SchemaEntry::new(VarId::shared(VarKind::Int, "flag")),
            SchemaEntry::with_slots(VarId::presence(VarKind::Float, "pos"), 2),
        ];
        let diff = compare_schemas(&host, &guest);
        assert_eq!(diff.missing.len(), 2);
        assert_eq!(diff.unexpected.len(), 2);
        assert!(matches!(diff.into_error(), SyncError::SchemaMismatch { .. }));
    }
}
