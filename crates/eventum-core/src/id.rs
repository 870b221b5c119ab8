//! Identifier newtypes shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique opaque identifier of a processor.
///
/// Assigned at construction; either caller-supplied or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessorId(String);

impl ProcessorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh unique id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProcessorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Name of a dispatcher queue.
///
/// Drawn from the set of names appearing in the engine's thread
/// assignment. Two values are reserved: the empty string (the default
/// dispatcher) and `"subscriptions"` (pinned for the pub/sub
/// collaborator). Ordered so that multi-dispatcher lock acquisition has
/// a single deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DispatcherName(String);

/// The reserved name of the pub/sub dispatcher
pub const SUBSCRIPTIONS_DISPATCHER: &str = "subscriptions";

impl DispatcherName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The default dispatcher (the empty name)
    pub fn default_dispatcher() -> Self {
        Self(String::new())
    }

    /// The reserved pub/sub dispatcher
    pub fn subscriptions() -> Self {
        Self(SUBSCRIPTIONS_DISPATCHER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_subscriptions(&self) -> bool {
        self.0 == SUBSCRIPTIONS_DISPATCHER
    }
}

impl fmt::Display for DispatcherName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<default>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<&str> for DispatcherName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DispatcherName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ProcessorId::generate();
        let b = ProcessorId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_reserved_dispatcher_names() {
        assert!(DispatcherName::default_dispatcher().is_default());
        assert!(DispatcherName::subscriptions().is_subscriptions());
        assert!(!DispatcherName::new("io").is_default());
    }

    #[test]
    fn test_dispatcher_name_ordering_is_lexicographic() {
        let mut names = vec![
            DispatcherName::new("io"),
            DispatcherName::subscriptions(),
            DispatcherName::default_dispatcher(),
        ];
        names.sort();
        assert_eq!(names[0], DispatcherName::default_dispatcher());
        assert_eq!(names[1], DispatcherName::new("io"));
        assert_eq!(names[2], DispatcherName::subscriptions());
    }

    #[test]
    fn test_default_dispatcher_display() {
        assert_eq!(DispatcherName::default_dispatcher().to_string(), "<default>");
        assert_eq!(DispatcherName::new("io").to_string(), "io");
    }
}
