//! Dynamic invocation facade: read members of framework objects the crate has
//! no compile-time knowledge of.
//!
//! Adapters resolve [`Binding`]s once at construction and invoke them per
//! call. Every invocation is fallible and every caller in this crate degrades
//! gracefully — a failed read produces a logged default, never a fault in the
//! instrumented application.
//!
//! The concrete dispatch mechanism lives behind [`DynamicInvoker`]; a canned
//! lookup-table implementation ships in [`table`] so the facade stays out of
//! the engine's test surface.
//!
//! # Traceability
//! - Implements: REQ-INV-001 (Dynamic Invocation Facade)

pub mod table;

pub use table::{TableInvoker, TableObject};

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque handle to a framework object.
///
/// Identity (the allocation address) is the only property the engine relies
/// on; see `CallKey::from_handle`.
pub type ObjectHandle = Arc<dyn Any + Send + Sync>;

/// Value returned by a dynamic invocation.
///
/// Deliberately small: the engine only ever reads strings, numbers, header
/// maps, parameter multimaps, and further object handles for builder-style
/// chains.
#[derive(Clone)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// String.
    Str(String),
    /// List of strings.
    StrList(Vec<String>),
    /// Single-valued map (headers).
    Map(HashMap<String, String>),
    /// Multi-valued map (query parameters).
    MultiMap(HashMap<String, Vec<String>>),
    /// Another framework object.
    Object(ObjectHandle),
}

impl Value {
    /// Short type label for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::StrList(_) => "string list",
            Value::Map(_) => "map",
            Value::MultiMap(_) => "multimap",
            Value::Object(_) => "object",
        }
    }

    /// Lossy string rendering for call recording and logs.
    pub fn display(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Str(s) => s.clone(),
            Value::StrList(l) => format!("[{}]", l.join(",")),
            Value::Map(m) => format!("{{{} entries}}", m.len()),
            Value::MultiMap(m) => format!("{{{} entries}}", m.len()),
            Value::Object(_) => "<object>".to_string(),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Object(_) => write!(f, "Object(<handle>)"),
            other => write!(f, "{}({})", other.type_name(), other.display()),
        }
    }
}

/// A resolved member descriptor, immutable after construction and safely
/// shared read-only across threads.
#[derive(Debug, Clone)]
pub struct Binding {
    member: String,
    param_types: Vec<String>,
}

impl Binding {
    /// Creates a binding for the named member.
    #[must_use]
    pub fn new(member: &str, param_types: &[&str]) -> Self {
        Self {
            member: member.to_string(),
            param_types: param_types.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// The bound member name.
    #[must_use]
    pub fn member(&self) -> &str {
        &self.member
    }

    /// Declared parameter types, informational only.
    #[must_use]
    pub fn param_types(&self) -> &[String] {
        &self.param_types
    }
}

/// Errors produced by the facade.
///
/// Implements: REQ-INV-001 §3
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The member could not be bound at resolution time.
    #[error("member '{member}' could not be resolved")]
    Unresolved {
        /// The member name that failed to resolve.
        member: String,
    },

    /// The invocation itself failed.
    #[error("invoking '{member}' failed: {reason}")]
    Failed {
        /// The member that was invoked.
        member: String,
        /// Failure detail from the dispatch layer.
        reason: String,
    },

    /// The invocation returned a value of an unexpected type.
    #[error("member '{member}' returned {got}, wanted {wanted}")]
    TypeMismatch {
        /// The member that was invoked.
        member: String,
        /// Type label of the returned value.
        got: &'static str,
        /// Expected type label.
        wanted: &'static str,
    },
}

/// The dynamic dispatch capability adapters plug in.
pub trait DynamicInvoker: Send + Sync {
    /// Binds a member name once; done at adapter construction.
    fn resolve(&self, member: &str, param_types: &[&str]) -> Result<Binding, InvokeError>;

    /// Invokes a previously-resolved binding against a target object.
    fn invoke(
        &self,
        binding: &Binding,
        target: &ObjectHandle,
        args: &[Value],
    ) -> Result<Value, InvokeError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Degrading accessors
// ─────────────────────────────────────────────────────────────────────────────

/// Invoke a binding expecting a string, falling back to `default` on any
/// failure. The failure is logged and swallowed; instrumentation must never
/// break the instrumented call.
pub fn string_or(
    invoker: &dyn DynamicInvoker,
    binding: &Binding,
    target: &ObjectHandle,
    args: &[Value],
    default: &str,
) -> String {
    match invoker.invoke(binding, target, args) {
        Ok(Value::Str(s)) => s,
        Ok(other) => {
            warn!(
                member = binding.member(),
                got = other.type_name(),
                %default,
                "member returned unexpected type, using default"
            );
            default.to_string()
        }
        Err(error) => {
            warn!(member = binding.member(), %error, %default, "member read failed, using default");
            default.to_string()
        }
    }
}

/// Invoke a binding expecting an integer, falling back to `default`.
pub fn int_or(
    invoker: &dyn DynamicInvoker,
    binding: &Binding,
    target: &ObjectHandle,
    args: &[Value],
    default: i64,
) -> i64 {
    match invoker.invoke(binding, target, args) {
        Ok(Value::Int(i)) => i,
        Ok(other) => {
            warn!(
                member = binding.member(),
                got = other.type_name(),
                default,
                "member returned unexpected type, using default"
            );
            default
        }
        Err(error) => {
            warn!(member = binding.member(), %error, default, "member read failed, using default");
            default
        }
    }
}

/// Invoke a binding expecting a string, `None` on failure or non-string.
/// Logged at debug: absent optional members are routine.
pub fn opt_string(
    invoker: &dyn DynamicInvoker,
    binding: &Binding,
    target: &ObjectHandle,
    args: &[Value],
) -> Option<String> {
    match invoker.invoke(binding, target, args) {
        Ok(Value::Str(s)) => Some(s),
        Ok(Value::Null) => None,
        Ok(other) => {
            debug!(
                member = binding.member(),
                got = other.type_name(),
                "member returned unexpected type, treating as absent"
            );
            None
        }
        Err(error) => {
            debug!(member = binding.member(), %error, "member read failed, treating as absent");
            None
        }
    }
}

/// Invoke a binding expecting another object handle, `None` on failure.
pub fn object_of(
    invoker: &dyn DynamicInvoker,
    binding: &Binding,
    target: &ObjectHandle,
    args: &[Value],
) -> Option<ObjectHandle> {
    match invoker.invoke(binding, target, args) {
        Ok(Value::Object(handle)) => Some(handle),
        Ok(other) => {
            debug!(
                member = binding.member(),
                got = other.type_name(),
                "member returned unexpected type, treating as absent"
            );
            None
        }
        Err(error) => {
            debug!(member = binding.member(), %error, "member read failed, treating as absent");
            None
        }
    }
}

/// Invoke a binding expecting a header map, empty on failure.
pub fn map_or_empty(
    invoker: &dyn DynamicInvoker,
    binding: &Binding,
    target: &ObjectHandle,
) -> HashMap<String, String> {
    match invoker.invoke(binding, target, &[]) {
        Ok(Value::Map(map)) => map,
        Ok(other) => {
            debug!(
                member = binding.member(),
                got = other.type_name(),
                "member returned unexpected type, using empty map"
            );
            HashMap::new()
        }
        Err(error) => {
            debug!(member = binding.member(), %error, "member read failed, using empty map");
            HashMap::new()
        }
    }
}

/// Invoke a binding expecting a parameter multimap, empty on failure.
pub fn multimap_or_empty(
    invoker: &dyn DynamicInvoker,
    binding: &Binding,
    target: &ObjectHandle,
) -> HashMap<String, Vec<String>> {
    match invoker.invoke(binding, target, &[]) {
        Ok(Value::MultiMap(map)) => map,
        Ok(other) => {
            debug!(
                member = binding.member(),
                got = other.type_name(),
                "member returned unexpected type, using empty map"
            );
            HashMap::new()
        }
        Err(error) => {
            debug!(member = binding.member(), %error, "member read failed, using empty map");
            HashMap::new()
        }
    }
}
