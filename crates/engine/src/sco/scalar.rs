use tracing::debug;

use objstate_core::{ContainerPolicy, FieldData, FieldOwner, Value};

use super::{ScoHost, bound, changed, check_nullable};
use crate::error::EngineError;

/// A single value that is mutated in place, such as a date or a blob.
#[derive(Debug)]
pub struct ScalarWrapper {
    owner: Option<FieldOwner>,
    policy: ContainerPolicy,
    value: Value,
}

impl ScalarWrapper {
    pub fn new(owner: FieldOwner, policy: ContainerPolicy, initial: Option<Value>) -> Self {
        let value = initial.unwrap_or(Value::Null);
        debug!(
            object = %owner.object,
            field = owner.field,
            null = value.is_null(),
            "scalar wrapper initialised"
        );
        Self {
            owner: Some(owner),
            policy,
            value,
        }
    }

    pub fn owner(&self) -> Option<FieldOwner> {
        self.owner
    }

    pub fn unset_owner(&mut self) {
        self.owner = None;
    }

    pub fn get(&self) -> &Value {
        &self.value
    }

    /// Replace the value, returning the previous one.
    pub fn set(&mut self, host: &mut dyn ScoHost, value: Value) -> Result<Value, EngineError> {
        let owner = bound(self.owner)?;
        check_nullable(self.policy.allow_nulls, &value)?;
        if value == self.value {
            return Ok(value);
        }
        let previous = std::mem::replace(&mut self.value, value);
        changed(host, owner);
        Ok(previous)
    }

    pub fn detach_copy(&self) -> FieldData {
        FieldData::Scalar(self.value.clone())
    }

    pub fn attach_copy(
        &mut self,
        host: &mut dyn ScoHost,
        detached: &Value,
    ) -> Result<bool, EngineError> {
        if *detached == self.value {
            return Ok(false);
        }
        self.set(host, detached.clone())?;
        Ok(true)
    }
}
