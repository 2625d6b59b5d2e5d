//! Per-instance identifiers.

use std::fmt;
use uuid::Uuid;

/// The two client roles: a long-lived streaming session or a stateless
/// request-only instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstanceRole {
    Socket,
    Rest,
}

impl InstanceRole {
    pub const fn prefix(self) -> &'static str {
        match self {
            InstanceRole::Socket => "socket",
            InstanceRole::Rest => "rest",
        }
    }
}

/// A sortable, time-ordered instance identifier such as
/// `socket_018f6b2e-6c7a-7c3e-bb3a-6f1d2a9c4e10`.
///
/// Generated once at construction and stable for the instance's whole
/// lifetime, including across `reset()`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn generate(role: InstanceRole) -> Self {
        Self(format!("{}_{}", role.prefix(), Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
