//! Thread-local registry of named backend instances.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use super::Backend;
use crate::error::GraphError;

#[derive(Default)]
struct Registry {
    entries: BTreeMap<String, Rc<dyn Any>>,
    default: Option<String>,
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
}

/// Register `backend` under `key`, replacing any previous entry.
///
/// The first registered backend becomes the default.
pub fn register_backend<B: Backend>(key: &str, backend: Rc<B>) {
    REGISTRY.with(|r| {
        let mut r = r.borrow_mut();
        r.entries.insert(key.to_string(), backend as Rc<dyn Any>);
        if r.default.is_none() {
            r.default = Some(key.to_string());
        }
    });
}

/// Look up the backend registered under `key`.
///
/// # Errors
///
/// `UnknownBackend` if nothing is registered under `key` or the entry is of
/// another backend type.
pub fn lookup_backend<B: Backend>(key: &str) -> Result<Rc<B>, GraphError> {
    REGISTRY.with(|r| {
        r.borrow()
            .entries
            .get(key)
            .cloned()
            .and_then(|any| any.downcast::<B>().ok())
            .ok_or_else(|| GraphError::UnknownBackend {
                key: key.to_string(),
            })
    })
}

/// Select the backend returned by [`default_backend`].
pub fn set_default_backend(key: &str) -> Result<(), GraphError> {
    REGISTRY.with(|r| {
        let mut r = r.borrow_mut();
        if !r.entries.contains_key(key) {
            return Err(GraphError::UnknownBackend {
                key: key.to_string(),
            });
        }
        r.default = Some(key.to_string());
        Ok(())
    })
}

/// The default backend, if one of type `B` is registered.
pub fn default_backend<B: Backend>() -> Result<Rc<B>, GraphError> {
    let key = REGISTRY.with(|r| r.borrow().default.clone());
    match key {
        Some(key) => lookup_backend(&key),
        None => Err(GraphError::UnknownBackend {
            key: "<default>".to_string(),
        }),
    }
}

/// Registered keys in sorted order.
pub fn registered_backends() -> Vec<String> {
    REGISTRY.with(|r| r.borrow().entries.keys().cloned().collect())
}
