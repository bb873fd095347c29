//! Caller identity as resolved by the upstream authentication layer.

use serde::{Deserialize, Serialize};

use crate::db::Role;
use crate::errors::CoreError;

/// Who is calling, passed into every mutating service operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self { user_id: user_id.into(), role }
    }

    /// Identity used by sweeps and gateway callbacks.
    pub fn system() -> Self {
        Self::new("system", Role::System)
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Admin | Role::System)
    }

    pub fn require_role(&self, role: Role) -> Result<(), CoreError> {
        if self.role != role && !self.is_privileged() {
            return Err(CoreError::Forbidden(format!(
                "{} {} cannot act as {}",
                self.role, self.user_id, role
            )));
        }
        Ok(())
    }

    pub fn require_admin(&self) -> Result<(), CoreError> {
        if !self.is_privileged() {
            return Err(CoreError::Forbidden(format!("{} {} is not an admin", self.role, self.user_id)));
        }
        Ok(())
    }

    /// The actor must own the resource or be an admin.
    pub fn require_owner(&self, owner_id: &str, what: &str) -> Result<(), CoreError> {
        if self.user_id != owner_id && !self.is_privileged() {
            return Err(CoreError::Forbidden(format!("{} does not own {}", self.user_id, what)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_and_roles() {
        let student = Actor::new("s1", Role::Student);
        assert!(student.require_owner("s1", "request r1").is_ok());
        assert!(student.require_owner("s2", "request r1").is_err());
        assert!(student.require_role(Role::Tutor).is_err());
        assert!(student.require_admin().is_err());

        let admin = Actor::new("a1", Role::Admin);
        assert!(admin.require_owner("s2", "request r1").is_ok());
        assert!(admin.require_role(Role::Tutor).is_ok());
        assert!(Actor::system().require_admin().is_ok());
    }
}
