use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Transient,
    /// Persistent but not yet written to the backend.
    PersistentNew,
    PersistentClean,
    PersistentDirty,
    /// Persistent with no field values materialized.
    Hollow,
    Detached,
    PersistentDeleted,
    /// Made persistent and deleted before ever reaching the backend.
    PersistentNewDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    MakePersistent,
    ReadField,
    WriteField,
    Flush,
    Commit { retain_values: bool },
    Rollback,
    Delete,
    Detach,
    Attach,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::PersistentNew => "persistent-new",
            Self::PersistentClean => "persistent-clean",
            Self::PersistentDirty => "persistent-dirty",
            Self::Hollow => "hollow",
            Self::Detached => "detached",
            Self::PersistentDeleted => "persistent-deleted",
            Self::PersistentNewDeleted => "persistent-new-deleted",
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            Self::PersistentNew
                | Self::PersistentClean
                | Self::PersistentDirty
                | Self::Hollow
                | Self::PersistentDeleted
                | Self::PersistentNewDeleted
        )
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::PersistentNew | Self::PersistentNewDeleted)
    }

    pub fn is_dirty(&self) -> bool {
        matches!(
            self,
            Self::PersistentNew
                | Self::PersistentDirty
                | Self::PersistentDeleted
                | Self::PersistentNewDeleted
        )
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::PersistentDeleted | Self::PersistentNewDeleted)
    }

    /// Has pending work for the next flush.
    pub fn is_waiting_for_flush(&self) -> bool {
        matches!(
            self,
            Self::PersistentNew | Self::PersistentDirty | Self::PersistentDeleted
        )
    }

    pub fn transition(self, event: LifecycleEvent) -> Result<LifecycleState, CoreError> {
        use LifecycleEvent as E;
        use LifecycleState as S;

        let next = match (self, event) {
            (S::Transient, E::MakePersistent) => S::PersistentNew,
            (
                S::PersistentNew | S::PersistentClean | S::PersistentDirty | S::Hollow,
                E::MakePersistent,
            ) => self,

            (S::Hollow, E::ReadField) => S::PersistentClean,
            (
                S::Transient | S::PersistentNew | S::PersistentClean | S::PersistentDirty,
                E::ReadField,
            ) => self,

            (S::PersistentClean | S::Hollow, E::WriteField) => S::PersistentDirty,
            (S::Transient | S::PersistentNew | S::PersistentDirty, E::WriteField) => self,

            (S::PersistentNew | S::PersistentDirty, E::Flush) => S::PersistentClean,
            (
                S::Transient
                | S::PersistentClean
                | S::Hollow
                | S::PersistentDeleted
                | S::PersistentNewDeleted,
                E::Flush,
            ) => self,

            (
                S::PersistentNew | S::PersistentClean | S::PersistentDirty,
                E::Commit { retain_values },
            ) => {
                if retain_values {
                    S::PersistentClean
                } else {
                    S::Hollow
                }
            }
            (S::Hollow | S::Transient, E::Commit { .. }) => self,
            (S::PersistentDeleted | S::PersistentNewDeleted, E::Commit { .. }) => S::Transient,

            (S::PersistentNew | S::PersistentNewDeleted, E::Rollback) => S::Transient,
            (
                S::PersistentClean | S::PersistentDirty | S::PersistentDeleted | S::Hollow,
                E::Rollback,
            ) => S::Hollow,
            (S::Transient, E::Rollback) => self,

            (S::PersistentNew, E::Delete) => S::PersistentNewDeleted,
            (
                S::PersistentClean | S::PersistentDirty | S::Hollow,
                E::Delete,
            ) => S::PersistentDeleted,
            (S::PersistentDeleted | S::PersistentNewDeleted, E::Delete) => self,

            (
                S::PersistentNew | S::PersistentClean | S::PersistentDirty | S::Hollow,
                E::Detach,
            ) => S::Detached,

            (S::Detached, E::Attach) => S::PersistentClean,

            _ => return Err(CoreError::IllegalTransition { from: self, event }),
        };
        Ok(next)
    }
}
