//! Operator identity passed into every engine action.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Cashier,
    Admin,
    Owner,
}

impl Role {
    /// Admins and owners skip the shift gate but only observe the order screen.
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::Admin | Role::Owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub operator_id: String,
    pub operator_name: String,
    pub role: Role,
}

impl Session {
    pub fn new(operator_id: impl Into<String>, operator_name: impl Into<String>, role: Role) -> Self {
        Self {
            operator_id: operator_id.into(),
            operator_name: operator_name.into(),
            role,
        }
    }

    pub fn cashier(operator_id: impl Into<String>, operator_name: impl Into<String>) -> Self {
        Self::new(operator_id, operator_name, Role::Cashier)
    }
}
