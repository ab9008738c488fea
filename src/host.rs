//! The narrow interface consumed from the host runtime.
//!
//! A host object handle (`HostObject`) is a plain, uncounted reference to a
//! host-managed object, much like a raw pointer: cloning the handle does not
//! touch the host's reference count. Counted ownership is expressed with
//! [`Owned`](crate::owned::Owned), which calls `acquire`/`release`.

use crate::error::HostError;
use crate::host_map::HostMap;
use crate::owned::Owned;

/// An opaque, reference-counted object owned by the host runtime.
///
/// Implementations must uphold the usual counting contract: every
/// `acquire` is matched by exactly one `release`, and the object is freed
/// when its count reaches zero. Hash and equality are the host's own
/// definitions; `host_eq(a, b)` must imply `host_hash(a) == host_hash(b)`.
pub trait HostObject: Clone {
    /// Increment the host reference count.
    fn acquire(&self);

    /// Decrement the host reference count, freeing the object at zero.
    fn release(&self);

    fn host_hash(&self) -> u64;

    fn host_eq(&self, other: &Self) -> bool;

    /// Identity comparison (same underlying object).
    fn is(&self, other: &Self) -> bool;
}

/// Object construction services the protocol layer needs from the host.
///
/// Every method returns a *new* owning reference. Methods that take
/// `Owned` arguments consume (steal) those references, even on failure.
pub trait Host {
    type Object: HostObject;

    /// The host's None singleton, with one reference acquired for the caller.
    fn none(&self) -> Owned<Self::Object>;

    /// Build a 2-tuple. The tuple acquires its own references to both items.
    fn pair(
        &self,
        first: &Self::Object,
        second: &Self::Object,
    ) -> Result<Owned<Self::Object>, HostError>;

    /// Build a list from already-owned items, stealing each reference.
    fn list(&self, items: Vec<Owned<Self::Object>>) -> Result<Owned<Self::Object>, HostError>;

    /// Read a non-negative integer argument.
    fn to_usize(&self, obj: &Self::Object) -> Option<usize>;

    /// Box a container into a new host object of the registered map type.
    fn wrap(&self, map: HostMap<Self::Object>) -> Result<Owned<Self::Object>, HostError>;
}

/// A method exposed to the host: name, arity and docstring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDef {
    pub name: &'static str,
    pub params: &'static [&'static str],
    pub required: usize,
    pub doc: &'static str,
}

/// Description of the container type handed to the host's type factory.
#[derive(Debug, Clone, Copy)]
pub struct TypeSpec<'a> {
    pub name: &'a str,
    pub doc: &'a str,
    pub methods: &'a [MethodDef],
}

/// The host's module and type registration facility.
///
/// Handles returned by `create_module` and `create_type` carry one owning
/// reference each, which must be given back through the matching
/// `release_*` call. `add_type` does not steal: the module takes its own
/// reference to the type object.
pub trait Registrar {
    type Module: Clone + Send + Sync;
    type TypeObject;

    fn create_module(
        &self,
        name: &str,
        functions: &[MethodDef],
    ) -> Result<Self::Module, HostError>;

    fn add_string_constant(
        &self,
        module: &Self::Module,
        name: &str,
        value: &str,
    ) -> Result<(), HostError>;

    fn create_type(&self, spec: &TypeSpec<'_>) -> Result<Self::TypeObject, HostError>;

    fn add_type(
        &self,
        module: &Self::Module,
        name: &str,
        ty: &Self::TypeObject,
    ) -> Result<(), HostError>;

    fn release_type(&self, ty: Self::TypeObject);

    fn release_module(&self, module: Self::Module);
}
