//! Authentication user types.

use serde::Serialize;

/// Role granted to the fixed identity used when authentication is disabled.
pub const ADMIN_ROLE: &str = "admin";

/// Location pattern that grants access to every configured storage location.
pub const ALL_LOCATIONS: &str = "*";

/// The caller of a request, as established by the token resolver.
///
/// Constructed fresh for every request and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
    pub roles: Vec<String>,
    /// Storage locations this caller may browse
    pub allowed_locations: Vec<String>,
}

impl Identity {
    /// Identity used for every request when authentication is delegated to a proxy.
    pub fn privileged() -> Self {
        Self {
            id: ADMIN_ROLE.to_string(),
            username: ADMIN_ROLE.to_string(),
            roles: vec![ADMIN_ROLE.to_string()],
            allowed_locations: vec![ALL_LOCATIONS.to_string()],
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
