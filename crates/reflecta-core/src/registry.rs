//! Type Registry: per-type configuration (factory-equivalent reflection info,
//! capability checks, list hook, auth field bindings) plus the per-id Lock
//! Table.
//!
//! Registration is explicit rather than reflection-discovered (see the design
//! notes in SPEC_FULL.md): a `TypeConfig<T>` is built with a chainable
//! builder, and capability checks left unset make the type "unsafe" exactly
//! as an unimplemented interface would in the source system.

use crate::context::RequestContext;
use crate::error::Error;
use crate::filter::ListOpts;
use crate::json;
use crate::lock::LockTable;
use crate::metadata::Record;
use serde_json::Value;
use std::sync::Arc;

type MayReadFn<T> = Box<dyn Fn(&T, &RequestContext) -> Result<(), Error> + Send + Sync>;
// `candidate` is `None` exactly on delete (no new value); `prev` is `None`
// exactly on create (no previous value). See 4.D.
type MayWriteFn<T> =
    Box<dyn Fn(&RequestContext, Option<&mut T>, Option<&T>) -> Result<(), Error> + Send + Sync>;
type ListHookFn = Box<dyn Fn(&RequestContext, &mut ListOpts) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AuthBasicBinding {
    pub username_path: String,
    pub password_path: String,
}

#[derive(Debug, Clone)]
pub struct AuthBearerBinding {
    pub token_path: String,
}

/// Per-type configuration, analogous to the source's `config[T]`. Lives for
/// the process lifetime once registered; the registry that holds many of
/// these is built once at startup and never mutated after serving begins.
pub struct TypeConfig<T: Record> {
    pub api_name: String,
    pub locks: Arc<LockTable>,
    may_read: Option<MayReadFn<T>>,
    may_write: Option<MayWriteFn<T>>,
    list_hook: Option<ListHookFn>,
    pub auth_basic: Option<AuthBasicBinding>,
    pub auth_bearer: Option<AuthBearerBinding>,
}

impl<T: Record> TypeConfig<T> {
    pub fn new(api_name: impl Into<String>) -> Self {
        TypeConfig {
            api_name: api_name.into(),
            locks: Arc::new(LockTable::new()),
            may_read: None,
            may_write: None,
            list_hook: None,
            auth_basic: None,
            auth_bearer: None,
        }
    }

    pub fn may_read<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &RequestContext) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.may_read = Some(Box::new(f));
        self
    }

    pub fn may_write<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext, Option<&mut T>, Option<&T>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.may_write = Some(Box::new(f));
        self
    }

    pub fn list_hook<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext, &mut ListOpts) + Send + Sync + 'static,
    {
        self.list_hook = Some(Box::new(f));
        self
    }

    pub fn auth_basic(mut self, username_path: impl Into<String>, password_path: impl Into<String>) -> Self {
        self.auth_basic = Some(AuthBasicBinding {
            username_path: username_path.into(),
            password_path: password_path.into(),
        });
        self
    }

    pub fn auth_bearer(mut self, token_path: impl Into<String>) -> Self {
        self.auth_bearer = Some(AuthBearerBinding {
            token_path: token_path.into(),
        });
        self
    }

    /// A type is "safe" only once both capability checks are wired up.
    pub fn is_safe(&self) -> bool {
        self.may_read.is_some() && self.may_write.is_some()
    }

    /// Panics if the type is unsafe, matching the source's `CheckSafe`
    /// contract: unsafe types are still served, but an operator must opt in
    /// to acknowledging that before relying on it in production.
    pub fn check_safe(&self) {
        assert!(
            self.is_safe(),
            "type '{}' is registered without both MayRead and MayWrite capability checks",
            self.api_name
        );
    }

    pub fn run_list_hook(&self, ctx: &RequestContext, opts: &mut ListOpts) {
        if let Some(hook) = &self.list_hook {
            hook(ctx, opts);
        }
    }

    /// `true` if `value` is visible to `ctx`. Operates on a JSON-round-tripped
    /// clone so nothing the check does can touch stored state.
    pub fn check_read(&self, ctx: &RequestContext, value: &Value) -> Result<bool, Error> {
        let Some(may_read) = &self.may_read else {
            return Ok(true);
        };
        let clone: T = json::from_value(value.clone())?;
        Ok(may_read(&clone, ctx).is_ok())
    }

    /// Runs the write check. `candidate` is the post-merge value not yet
    /// written to the store, or `None` on delete; `prev` is the clone of the
    /// stored previous value, or `None` on create. Mutations the check makes
    /// to the candidate are written back since it's what gets stored next.
    pub fn check_write(
        &self,
        ctx: &RequestContext,
        candidate: Option<&mut Value>,
        prev: Option<&Value>,
    ) -> Result<(), Error> {
        let Some(may_write) = &self.may_write else {
            return Ok(());
        };
        let prev_typed: Option<T> = prev.map(|p| json::from_value(p.clone())).transpose()?;
        match candidate {
            Some(candidate_value) => {
                let mut typed: T = json::from_value(candidate_value.clone())?;
                may_write(ctx, Some(&mut typed), prev_typed.as_ref())?;
                *candidate_value = json::to_value(&typed)?;
            }
            None => {
                may_write(ctx, None, prev_typed.as_ref())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use facet::Facet;
    use serde_json::json;

    #[derive(Facet, Clone, Debug)]
    struct Widget {
        id: String,
        generation: u64,
        etag: String,
        text: String,
    }

    impl Record for Widget {
        fn metadata(&self) -> Metadata {
            Metadata { id: self.id.clone(), generation: self.generation, etag: self.etag.clone() }
        }
        fn set_metadata(&mut self, m: Metadata) {
            self.id = m.id;
            self.generation = m.generation;
            self.etag = m.etag;
        }
    }

    #[test]
    fn unset_checks_are_unsafe_but_permissive() {
        let cfg: TypeConfig<Widget> = TypeConfig::new("widget");
        assert!(!cfg.is_safe());
        let v = json!({"id": "1", "generation": 1, "etag": "e", "text": "foo"});
        assert!(cfg.check_read(&RequestContext::anonymous(), &v).unwrap());
    }

    #[test]
    #[should_panic]
    fn check_safe_panics_when_unsafe() {
        let cfg: TypeConfig<Widget> = TypeConfig::new("widget");
        cfg.check_safe();
    }

    #[test]
    fn may_read_false_filters_object() {
        let cfg: TypeConfig<Widget> = TypeConfig::new("widget")
            .may_read(|w, _ctx| {
                if w.text == "secret" {
                    Err(Error::forbidden("nope"))
                } else {
                    Ok(())
                }
            })
            .may_write(|_ctx, _candidate, _prev| Ok(()));
        assert!(cfg.is_safe());

        let visible = json!({"id": "1", "generation": 1, "etag": "e", "text": "foo"});
        let hidden = json!({"id": "2", "generation": 1, "etag": "e", "text": "secret"});
        assert!(cfg.check_read(&RequestContext::anonymous(), &visible).unwrap());
        assert!(!cfg.check_read(&RequestContext::anonymous(), &hidden).unwrap());
    }

    #[test]
    fn may_write_can_mutate_candidate() {
        let cfg: TypeConfig<Widget> = TypeConfig::new("widget").may_write(|_ctx, w, _prev| {
            if let Some(w) = w {
                w.text = format!("stamped:{}", w.text);
            }
            Ok(())
        });
        let mut candidate = json!({"id": "1", "generation": 1, "etag": "e", "text": "foo"});
        cfg.check_write(&RequestContext::anonymous(), Some(&mut candidate), None).unwrap();
        assert_eq!(candidate["text"], "stamped:foo");
    }

    #[test]
    fn may_write_sees_none_candidate_on_delete() {
        let cfg: TypeConfig<Widget> = TypeConfig::new("widget").may_write(|_ctx, candidate, prev| {
            assert!(candidate.is_none());
            assert!(prev.is_some());
            Ok(())
        });
        let prev = json!({"id": "1", "generation": 1, "etag": "e", "text": "foo"});
        cfg.check_write(&RequestContext::anonymous(), None, Some(&prev)).unwrap();
    }
}
