//! Per-request context: the authenticated principal (if any) and the internal
//! flags that distinguish privileged internal callers (replication, auth
//! lookups) from authenticated end users. Kept as a dedicated struct rather
//! than string-keyed context values, per the design notes.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    Basic,
    Bearer,
}

/// An authenticated caller: the looked-up auth-user (Basic) or auth-token
/// (Bearer) record, with its secret field already cleared.
#[derive(Debug, Clone)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub subject: Value,
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    principal: Option<Principal>,
    internal_replication: bool,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        RequestContext::default()
    }

    pub fn with_principal(principal: Principal) -> Self {
        RequestContext {
            principal: Some(principal),
            internal_replication: false,
        }
    }

    /// Internal principal used by the Replication Driver: bypasses client
    /// authorization entirely (see 4.K) but is never reported as an
    /// authenticated end user.
    pub fn internal_replication() -> Self {
        RequestContext {
            principal: None,
            internal_replication: true,
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn is_internal_replication(&self) -> bool {
        self.internal_replication
    }
}
