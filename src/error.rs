//! Error taxonomy shared by the container, the protocol adapter and the
//! registration singleton.

use core::fmt;
use thiserror::Error;

/// Failures reported by `HostMap` operations.
///
/// `KeyNotFound` and `EmptyContainer` are ordinary control-flow signals for
/// the caller. `ResourceExhausted` means the table could not grow; the map
/// and every reference count are left exactly as they were before the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("key not found")]
    KeyNotFound,
    #[error("popitem(): map is empty")]
    EmptyContainer,
    #[error("unable to reserve room for {additional} more entries")]
    ResourceExhausted { additional: usize },
}

/// An error raised by the host runtime itself (allocation of a host object,
/// attaching an attribute, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("host error: {message}")]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The step of module construction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationStep {
    CreateModule,
    AddVersion,
    CreateType,
    AddType,
}

impl fmt::Display for RegistrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationStep::CreateModule => "create module",
            RegistrationStep::AddVersion => "add version constant",
            RegistrationStep::CreateType => "create container type",
            RegistrationStep::AddType => "add container type",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("failed to {step} while registering module `{module}`")]
    ConstructionFailed {
        module: String,
        step: RegistrationStep,
        #[source]
        source: HostError,
    },
}

/// Errors surfaced by the host-facing dispatch layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("{method}() takes from {min} to {max} arguments ({given} given)")]
    Arity {
        method: &'static str,
        min: usize,
        max: usize,
        given: usize,
    },
    #[error("{method}() got an unexpected keyword argument '{keyword}'")]
    UnexpectedKeyword { method: &'static str, keyword: String },
    #[error("{method}() got multiple values for argument '{name}'")]
    DuplicateArgument {
        method: &'static str,
        name: &'static str,
    },
    #[error("{method}() argument '{name}' must be {expected}")]
    BadArgument {
        method: &'static str,
        name: &'static str,
        expected: &'static str,
    },
    #[error("map has no method '{name}'")]
    UnknownMethod { name: String },
}

/// Host exception class a failure should be raised as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    KeyError,
    TypeError,
    AttributeError,
    MemoryError,
    RuntimeError,
}

impl MapError {
    pub fn exception_kind(&self) -> ExceptionKind {
        match self {
            MapError::KeyNotFound | MapError::EmptyContainer => ExceptionKind::KeyError,
            MapError::ResourceExhausted { .. } => ExceptionKind::MemoryError,
        }
    }
}

impl ProtocolError {
    pub fn exception_kind(&self) -> ExceptionKind {
        match self {
            ProtocolError::Map(e) => e.exception_kind(),
            ProtocolError::Host(_) => ExceptionKind::RuntimeError,
            ProtocolError::Arity { .. }
            | ProtocolError::UnexpectedKeyword { .. }
            | ProtocolError::DuplicateArgument { .. }
            | ProtocolError::BadArgument { .. } => ExceptionKind::TypeError,
            ProtocolError::UnknownMethod { .. } => ExceptionKind::AttributeError,
        }
    }
}

impl RegistryError {
    pub fn step(&self) -> RegistrationStep {
        match self {
            RegistryError::ConstructionFailed { step, .. } => *step,
        }
    }
}
