//! Named instrument registry.
//!
//! There is no process-wide default registry. The process entry point owns a
//! [`Registry`] and passes it to every get-or-register call, so two stores can
//! publish into isolated namespaces and tests never share state.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{RegistryError, Result};

type Entry = Arc<dyn Any + Send + Sync>;

/// Registry of named, shared instruments.
#[derive(Default)]
pub struct Registry {
    instruments: RwLock<HashMap<String, Entry>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the instrument bound to `name`, or builds one with `factory`
    /// and binds it.
    ///
    /// The factory runs at most once per name, under the registry's write
    /// lock. It must not call back into this registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TypeMismatch`] if `name` is bound to another
    /// type, or whatever error `factory` returns.
    pub fn get_or_register<T, F>(&self, name: &str, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        if let Some(existing) = self.instruments.read().get(name) {
            return downcast(name, existing);
        }

        let mut instruments = self.instruments.write();
        // Another caller may have registered between the two locks.
        if let Some(existing) = instruments.get(name) {
            return downcast(name, existing);
        }

        let instrument = Arc::new(factory()?);
        instruments.insert(name.to_string(), Arc::clone(&instrument) as Entry);
        Ok(instrument)
    }

    /// Returns the instrument bound to `name` if it exists and is a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.instruments
            .read()
            .get(name)
            .and_then(|entry| Arc::clone(entry).downcast::<T>().ok())
    }

    /// Reports whether any instrument is bound to `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.instruments.read().contains_key(name)
    }

    /// Returns the number of registered instruments.
    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    /// Reports whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("instruments", &self.len())
            .finish()
    }
}

fn downcast<T: Any + Send + Sync>(name: &str, entry: &Entry) -> Result<Arc<T>> {
    Arc::clone(entry).downcast::<T>().map_err(|_| {
        RegistryError::TypeMismatch {
            name: name.to_string(),
            expected: type_name::<T>(),
        }
        .into()
    })
}
