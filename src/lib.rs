//! hostmap: a native mapping type for a reference-counted host runtime,
//! with exact ownership bookkeeping at the boundary.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: store host objects in a Rust hash table without ever losing,
//!   duplicating or double-releasing a host reference, on success and
//!   failure paths alike.
//! - Layers:
//!   - `Owned<O>`: one owning host reference; releases on drop, can be
//!     moved out with `into_raw`. All reference traffic goes through it.
//!   - `EntryTable<O, S>`: structural map (slotmap storage plus a hashbrown
//!     index) whose entries own their key and value references; stable
//!     handles; fallible reservation; debug-only reentrancy guard around
//!     host hash/equality callbacks.
//!   - `HostMap<O, S>`: the container operations (get, set, delete, pop,
//!     popitem, clear, copy, ...), each with a fixed transfer contract.
//!   - `protocol`: binds host calls (positional and keyword arguments) to
//!     `HostMap` operations and publishes the method table.
//!   - `ModuleRegistry<R>`: builds the extension module once, under a lock,
//!     with full rollback on partial failure.
//!
//! Ownership rules
//! - The map holds exactly one reference per stored key and one per stored
//!   value, and no others.
//! - Arguments are borrowed; the map acquires its own references
//!   (duplicate-on-insert). `HostMap::insert` is the transfer variant for
//!   callers that want to hand over references they already own.
//! - Results are returned as `Owned`, so the caller holds exactly one
//!   reference per returned object.
//! - References are acquired only after the table has room for them, and
//!   released only after the table is consistent again. A failed call
//!   leaves every count as it was.
//!
//! Concurrency
//! - A map is confined to the host's calling context (`!Send`/`!Sync`); the
//!   host serializes calls into an instance.
//! - `ModuleRegistry` is the only shared state; it uses a lock-free fast
//!   path once published and a mutex for the first construction.
//!
//! Testing
//! - `tracked` provides counting doubles for the host and the registrar
//!   that panic on use-after-free and over-release.

pub mod entry_table;
pub mod error;
pub mod host;
pub mod host_map;
pub mod owned;
pub mod protocol;
mod reentrancy;
pub mod registry;
pub mod tracked;

// Public surface
pub use error::{ExceptionKind, HostError, MapError, ProtocolError, RegistrationStep, RegistryError};
pub use host::{Host, HostObject, MethodDef, Registrar, TypeSpec};
pub use host_map::{HostMap, Rejected};
pub use owned::Owned;
pub use protocol::{new_map, CallArgs, MappingProtocol, Reply, FACTORY, METHODS};
pub use registry::{ModuleRegistry, ModuleSpec};
