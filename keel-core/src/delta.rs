//! Write intent submitted to a transaction branch

use crate::{Identity, KeelResult, Tuple, ValidationError};
use serde::{Deserialize, Serialize};

/// Classification of a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaKind {
    Insert,
    Update,
    Delete,
}

/// One unit of write intent.
///
/// `original` is the value the writer read (absent for an insert), `updated`
/// the value it wants visible. For a delete `updated` is the original value
/// and `deleted` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    identity: Identity,
    original: Option<Tuple>,
    updated: Tuple,
    deleted: bool,
}

impl Delta {
    pub fn insert(tuple: Tuple) -> Self {
        Self {
            identity: tuple.identity(),
            original: None,
            updated: tuple,
            deleted: false,
        }
    }

    /// Update `original` to `updated`; both must carry the same identity.
    pub fn update(original: Tuple, updated: Tuple) -> KeelResult<Self> {
        let identity = original.identity();
        if updated.identity() != identity {
            return Err(ValidationError::IdentityMismatch {
                expected: identity,
                got: updated.identity(),
            }
            .into());
        }
        Ok(Self {
            identity,
            original: Some(original),
            updated,
            deleted: false,
        })
    }

    pub fn delete(original: Tuple) -> Self {
        Self {
            identity: original.identity(),
            updated: original.clone(),
            original: Some(original),
            deleted: true,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn original(&self) -> Option<&Tuple> {
        self.original.as_ref()
    }

    pub fn updated(&self) -> &Tuple {
        &self.updated
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn kind(&self) -> DeltaKind {
        if self.deleted {
            DeltaKind::Delete
        } else if self.original.is_none() {
            DeltaKind::Insert
        } else {
            DeltaKind::Update
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeelError;

    #[test]
    fn test_delta_kinds() {
        let id = Identity::new();
        let before = Tuple::new(id).with("email", "a@x.com");
        let after = Tuple::new(id).with("email", "b@x.com");

        assert_eq!(Delta::insert(before.clone()).kind(), DeltaKind::Insert);
        assert_eq!(
            Delta::update(before.clone(), after).unwrap().kind(),
            DeltaKind::Update
        );
        let delete = Delta::delete(before.clone());
        assert_eq!(delete.kind(), DeltaKind::Delete);
        assert_eq!(delete.updated(), &before);
    }

    #[test]
    fn test_update_rejects_identity_mismatch() {
        let before = Tuple::new(Identity::new());
        let after = Tuple::new(Identity::new());
        let result = Delta::update(before, after);
        assert!(matches!(
            result,
            Err(KeelError::Validation(ValidationError::IdentityMismatch { .. }))
        ));
    }
}
