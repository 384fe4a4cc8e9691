//! Access Control
//!
//! Every mutating or viewing operation on cluster state carries an
//! [`AccessContext`] and is checked against the [`ObjectProtection`] of the
//! object it touches.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Access Types
// =============================================================================

/// Capability levels, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessType {
    View,
    Use,
    Change,
    Control,
}

impl AccessType {
    /// Whether holding `self` satisfies a requirement of `required`
    #[inline]
    pub fn has_access(self, required: AccessType) -> bool {
        self >= required
    }
}

impl std::fmt::Display for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessType::View => write!(f, "VIEW"),
            AccessType::Use => write!(f, "USE"),
            AccessType::Change => write!(f, "CHANGE"),
            AccessType::Control => write!(f, "CONTROL"),
        }
    }
}

// =============================================================================
// Access Context
// =============================================================================

/// Identity and role a request executes under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    identity: String,
    role: String,
    system: bool,
}

impl AccessContext {
    /// The controller's own privileged context; passes every check
    pub fn system() -> Self {
        Self {
            identity: "SYSTEM".to_string(),
            role: "SYSTEM".to_string(),
            system: true,
        }
    }

    /// Context of an ordinary (peer or API) identity
    pub fn new(identity: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            role: role.into(),
            system: false,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn is_system(&self) -> bool {
        self.system
    }
}

// =============================================================================
// Object Protection
// =============================================================================

/// Access control list attached to a protected object
///
/// The creator role is granted `CONTROL`; further roles are added explicitly.
#[derive(Debug)]
pub struct ObjectProtection {
    object_path: String,
    owner_role: String,
    acl: RwLock<BTreeMap<String, AccessType>>,
}

impl ObjectProtection {
    /// Create a protection for `object_path` owned by the creating context
    pub fn new(creator: &AccessContext, object_path: impl Into<String>) -> Self {
        let mut acl = BTreeMap::new();
        acl.insert(creator.role().to_string(), AccessType::Control);
        Self {
            object_path: object_path.into(),
            owner_role: creator.role().to_string(),
            acl: RwLock::new(acl),
        }
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn owner_role(&self) -> &str {
        &self.owner_role
    }

    /// Fail with [`Error::AccessDenied`] unless `ctx` holds `required`
    pub fn require_access(&self, ctx: &AccessContext, required: AccessType) -> Result<()> {
        if ctx.is_system() {
            return Ok(());
        }
        let granted = self.acl.read().get(ctx.role()).copied();
        match granted {
            Some(access) if access.has_access(required) => Ok(()),
            _ => Err(Error::AccessDenied {
                identity: ctx.identity().to_string(),
                object: self.object_path.clone(),
                required,
            }),
        }
    }

    /// Access granted to `ctx`, if any
    pub fn query_access(&self, ctx: &AccessContext) -> Option<AccessType> {
        if ctx.is_system() {
            return Some(AccessType::Control);
        }
        self.acl.read().get(ctx.role()).copied()
    }

    /// Grant `access` to `role`; requires `CONTROL`
    pub fn add_acl_entry(&self, ctx: &AccessContext, role: &str, access: AccessType) -> Result<()> {
        self.require_access(ctx, AccessType::Control)?;
        self.acl.write().insert(role.to_string(), access);
        Ok(())
    }

    /// Revoke any access of `role`; requires `CONTROL`
    pub fn remove_acl_entry(&self, ctx: &AccessContext, role: &str) -> Result<()> {
        self.require_access(ctx, AccessType::Control)?;
        self.acl.write().remove(role);
        Ok(())
    }
}
