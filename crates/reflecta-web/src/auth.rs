//! Resolves `Authorization: Basic`/`Bearer` headers against whichever
//! registered types opted into that role via `TypeConfig::auth_basic`/
//! `auth_bearer` (§6's "Auth" paragraph). Scans the relevant bucket by
//! username/token path rather than going through a type's own `MayRead`,
//! since a credential lookup has to happen before a principal exists to
//! check against.

use reflecta_core::registry::{AuthBasicBinding, AuthBearerBinding};
use reflecta_core::{path, Error, Principal, PrincipalKind};
use reflecta_store::RecordStore;
use serde_json::Value;
use std::sync::{Arc, RwLock};

pub const BASIC_REALM: &str = "reflecta";

/// Shared across every mounted type's [`crate::handlers::TypeState`] so a
/// later `mount()` call can register a binding any earlier-mounted type's
/// requests will see. Mutated only while the builder is assembling the
/// router, before `axum::serve` starts driving requests against it.
pub struct AuthRegistry {
    store: Arc<dyn RecordStore>,
    basic: RwLock<Option<(String, AuthBasicBinding)>>,
    bearer: RwLock<Option<(String, AuthBearerBinding)>>,
}

impl AuthRegistry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        AuthRegistry {
            store,
            basic: RwLock::new(None),
            bearer: RwLock::new(None),
        }
    }

    pub fn set_basic(&self, bucket: String, binding: AuthBasicBinding) {
        *self.basic.write().expect("auth registry lock poisoned") = Some((bucket, binding));
    }

    pub fn set_bearer(&self, bucket: String, binding: AuthBearerBinding) {
        *self.bearer.write().expect("auth registry lock poisoned") = Some((bucket, binding));
    }

    /// `Ok(None)` means no registered type accepts Basic auth or no record
    /// matched; either way the caller treats it as "credentials rejected".
    pub async fn verify_basic(&self, username: &str, password: &str) -> Result<Option<Principal>, Error> {
        let Some((bucket, binding)) = self.basic.read().expect("auth registry lock poisoned").clone() else {
            return Ok(None);
        };
        let items = self.store.list(&bucket).await.map_err(Error::from)?;
        for item in items {
            let Some(candidate) = path::get(&item, &binding.username_path).and_then(Value::as_str) else {
                continue;
            };
            if candidate != username {
                continue;
            }
            let Some(hash) = path::get(&item, &binding.password_path).and_then(Value::as_str) else {
                return Ok(None);
            };
            return if bcrypt::verify(password, hash).unwrap_or(false) {
                let mut subject = item.clone();
                path::set(&mut subject, &binding.password_path, Value::Null);
                Ok(Some(Principal {
                    kind: PrincipalKind::Basic,
                    subject,
                }))
            } else {
                Ok(None)
            };
        }
        Ok(None)
    }

    pub async fn verify_bearer(&self, token: &str) -> Result<Option<Principal>, Error> {
        let Some((bucket, binding)) = self.bearer.read().expect("auth registry lock poisoned").clone() else {
            return Ok(None);
        };
        let items = self.store.list(&bucket).await.map_err(Error::from)?;
        for item in items {
            let Some(candidate) = path::get(&item, &binding.token_path).and_then(Value::as_str) else {
                continue;
            };
            if candidate == token {
                let mut subject = item.clone();
                path::set(&mut subject, &binding.token_path, Value::Null);
                return Ok(Some(Principal {
                    kind: PrincipalKind::Bearer,
                    subject,
                }));
            }
        }
        Ok(None)
    }

    pub fn has_basic(&self) -> bool {
        self.basic.read().expect("auth registry lock poisoned").is_some()
    }

    pub fn has_bearer(&self) -> bool {
        self.bearer.read().expect("auth registry lock poisoned").is_some()
    }
}
