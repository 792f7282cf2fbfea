//! Stored types for lease persistence.
//!
//! Serialized to redb via bincode.

use serde::{Deserialize, Serialize};

/// One row of the lease table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLease {
    pub name: String,
    /// Worker identity of the owner
    pub holder: String,
    /// Unique per acquisition; two acquisitions by the same worker differ
    pub token: u128,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub renewals: u32,
}

impl StoredLease {
    /// A lease is valid only while `now < expiry`
    #[must_use]
    pub const fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let lease = StoredLease {
            name: "store:n/a".into(),
            holder: "w1".into(),
            token: 7,
            created_at_ms: 1_000,
            expires_at_ms: 2_000,
            renewals: 0,
        };
        assert!(lease.is_valid_at(1_999));
        assert!(!lease.is_valid_at(2_000));

        let bytes = bincode::serialize(&lease).unwrap();
        let back: StoredLease = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, lease);
    }
}
