//! The registration singleton: builds the extension module exactly once.
//!
//! `ModuleRegistry` is meant to live in a `static`. The first successful
//! `ensure_registered` builds the module (version constant, container type,
//! factory function) and publishes it; every later call returns the same
//! handle without locking. A failed attempt releases everything it built,
//! newest first, and leaves the registry empty so the next call can retry.

use crate::error::{HostError, RegistrationStep, RegistryError};
use crate::host::{Registrar, TypeSpec};
use crate::protocol::{FACTORY, METHODS};
use std::sync::{Mutex, OnceLock};

/// Names and constants attached to the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: &'static str,
    pub version_attr: &'static str,
    pub version: &'static str,
    /// Attribute under which the container type is published.
    pub type_attr: &'static str,
    /// Fully qualified type name reported by the host.
    pub type_name: &'static str,
    pub type_doc: &'static str,
}

impl ModuleSpec {
    pub const fn hostmap() -> Self {
        Self {
            name: "hostmap",
            version_attr: "__version__",
            version: env!("CARGO_PKG_VERSION"),
            type_attr: "HostMap",
            type_name: "hostmap.HostMap",
            type_doc: "A native mapping type that implements the same interface as the host's dict.",
        }
    }
}

impl Default for ModuleSpec {
    fn default() -> Self {
        Self::hostmap()
    }
}

pub struct ModuleRegistry<R: Registrar> {
    spec: ModuleSpec,
    // Held only across check-construct-publish.
    lock: Mutex<()>,
    module: OnceLock<R::Module>,
}

impl<R: Registrar> ModuleRegistry<R> {
    pub const fn new(spec: ModuleSpec) -> Self {
        Self {
            spec,
            lock: Mutex::new(()),
            module: OnceLock::new(),
        }
    }

    pub fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    /// The published module, if registration has succeeded.
    pub fn get(&self) -> Option<&R::Module> {
        self.module.get()
    }

    /// Return the module, building and publishing it on first use.
    pub fn ensure_registered(&self, registrar: &R) -> Result<&R::Module, RegistryError> {
        if let Some(module) = self.module.get() {
            return Ok(module);
        }

        // A panic elsewhere while holding the lock cannot leave a
        // half-published module behind, so a poisoned lock is still usable.
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(module) = self.module.get() {
            tracing::debug!(module = self.spec.name, "module registered by a concurrent caller");
            return Ok(module);
        }

        match self.construct(registrar) {
            Ok(module) => {
                tracing::debug!(module = self.spec.name, "module registered");
                // Only ever initialized here, under `lock`.
                Ok(self.module.get_or_init(move || module))
            }
            Err(e) => {
                tracing::warn!(
                    module = self.spec.name,
                    step = %e.step(),
                    error = %e,
                    "module registration failed and was rolled back"
                );
                Err(e)
            }
        }
    }

    fn construct(&self, registrar: &R) -> Result<R::Module, RegistryError> {
        let spec = &self.spec;
        let failed = |step: RegistrationStep| {
            move |source: HostError| RegistryError::ConstructionFailed {
                module: spec.name.to_string(),
                step,
                source,
            }
        };

        let module = Pending::new(
            registrar,
            registrar
                .create_module(spec.name, &[FACTORY])
                .map_err(failed(RegistrationStep::CreateModule))?,
            R::release_module,
        );
        registrar
            .add_string_constant(module.get(), spec.version_attr, spec.version)
            .map_err(failed(RegistrationStep::AddVersion))?;

        let type_spec = TypeSpec {
            name: spec.type_name,
            doc: spec.type_doc,
            methods: METHODS,
        };
        let ty = Pending::new(
            registrar,
            registrar
                .create_type(&type_spec)
                .map_err(failed(RegistrationStep::CreateType))?,
            R::release_type,
        );
        registrar
            .add_type(module.get(), spec.type_attr, ty.get())
            .map_err(failed(RegistrationStep::AddType))?;

        // The module holds its own reference to the type from here on.
        drop(ty);
        Ok(module.commit())
    }
}

/// An object built during the current attempt; released on drop unless
/// committed. Locals drop newest first, which is the unwind order.
struct Pending<'r, R, T> {
    registrar: &'r R,
    item: Option<T>,
    release: fn(&R, T),
}

impl<'r, R, T> Pending<'r, R, T> {
    fn new(registrar: &'r R, item: T, release: fn(&R, T)) -> Self {
        Self {
            registrar,
            item: Some(item),
            release,
        }
    }

    fn get(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pending item used after commit"),
        }
    }

    fn commit(mut self) -> T {
        match self.item.take() {
            Some(item) => item,
            None => unreachable!("pending item committed twice"),
        }
    }
}

impl<'r, R, T> Drop for Pending<'r, R, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            (self.release)(self.registrar, item);
        }
    }
}
