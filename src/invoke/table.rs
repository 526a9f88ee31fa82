//! Canned lookup-table implementation of the dynamic invocation facade.
//!
//! A [`TableObject`] is a bag of member → value entries standing in for a
//! framework object; [`TableInvoker`] dispatches invocations against it.
//! Member lookups with a single string argument (header reads) first try the
//! composite key `"member:arg"` so tests can serve different values per
//! argument. Every invocation is recorded on the target object, which is how
//! header-injection tests observe builder chains.
//!
//! Implements: REQ-INV-001/T-001 (Testability)

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{Binding, DynamicInvoker, InvokeError, ObjectHandle, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Table Object
// ─────────────────────────────────────────────────────────────────────────────

/// A canned framework object: named members with fixed values.
pub struct TableObject {
    members: Mutex<HashMap<String, Value>>,
    recorded: Mutex<Vec<(String, Vec<String>)>>,
}

impl TableObject {
    /// Creates an empty object.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: Mutex::new(HashMap::new()),
            recorded: Mutex::new(Vec::new()),
        })
    }

    /// Sets (or replaces) a member value.
    pub fn set(&self, member: &str, value: Value) {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(member.to_string(), value);
    }

    /// Reads a member value.
    #[must_use]
    pub fn get(&self, member: &str) -> Option<Value> {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(member)
            .cloned()
    }

    /// This object as an opaque [`ObjectHandle`].
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> ObjectHandle {
        self.clone()
    }

    /// All invocations dispatched against this object, as
    /// `(member, stringified args)` pairs in call order.
    #[must_use]
    pub fn recorded_calls(&self) -> Vec<(String, Vec<String>)> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, member: &str, args: &[Value]) {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((
                member.to_string(),
                args.iter().map(Value::display).collect(),
            ));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Table Invoker
// ─────────────────────────────────────────────────────────────────────────────

/// [`DynamicInvoker`] over [`TableObject`] targets.
///
/// Resolution always succeeds (the table is late-bound); invocation fails
/// when the target is not a table object or the member is absent.
pub struct TableInvoker;

impl TableInvoker {
    /// Creates a table invoker.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for TableInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicInvoker for TableInvoker {
    fn resolve(&self, member: &str, param_types: &[&str]) -> Result<Binding, InvokeError> {
        Ok(Binding::new(member, param_types))
    }

    fn invoke(
        &self,
        binding: &Binding,
        target: &ObjectHandle,
        args: &[Value],
    ) -> Result<Value, InvokeError> {
        let object =
            target
                .downcast_ref::<TableObject>()
                .ok_or_else(|| InvokeError::Failed {
                    member: binding.member().to_string(),
                    reason: "target is not a table object".to_string(),
                })?;

        object.record(binding.member(), args);

        // Argument-keyed lookup first: "header:traceparent" wins over "header".
        if let Some(Value::Str(arg)) = args.first() {
            let keyed = format!("{}:{arg}", binding.member());
            if let Some(value) = object.get(&keyed) {
                return Ok(value);
            }
        }

        object
            .get(binding.member())
            .ok_or_else(|| InvokeError::Failed {
                member: binding.member().to_string(),
                reason: "member not present on target".to_string(),
            })
    }
}
