//! Host-facing mapping protocol.
//!
//! The container operations in `host_map` know nothing about how the host
//! calls them. This module is the only place that does: it publishes the
//! method table, binds positional and keyword arguments against it, and
//! routes each call to the matching `HostMap` operation, turning results
//! into host objects.

use crate::error::{MapError, ProtocolError};
use crate::host::{Host, HostObject, MethodDef};
use crate::host_map::HostMap;
use crate::owned::Owned;

/// Arguments of one host call, borrowed from the host's argument tuple and
/// keyword dict.
#[derive(Debug)]
pub struct CallArgs<'a, O> {
    pub positional: &'a [O],
    pub keywords: &'a [(&'a str, O)],
}

impl<'a, O> CallArgs<'a, O> {
    pub fn new(positional: &'a [O], keywords: &'a [(&'a str, O)]) -> Self {
        Self {
            positional,
            keywords,
        }
    }

    pub fn positional(positional: &'a [O]) -> Self {
        Self::new(positional, &[])
    }

    pub fn empty() -> Self {
        Self::new(&[], &[])
    }

    fn given(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }
}

/// Result of a protocol call. Length and membership slots return native
/// values; everything else is a host object owned by the caller.
#[derive(Debug)]
pub enum Reply<O: HostObject> {
    Object(Owned<O>),
    Len(usize),
    Bool(bool),
}

impl<O: HostObject> Reply<O> {
    pub fn into_object(self) -> Option<Owned<O>> {
        match self {
            Reply::Object(o) => Some(o),
            Reply::Len(_) | Reply::Bool(_) => None,
        }
    }
}

const fn method(
    name: &'static str,
    params: &'static [&'static str],
    required: usize,
    doc: &'static str,
) -> MethodDef {
    MethodDef {
        name,
        params,
        required,
        doc,
    }
}

/// Methods bound on the container type.
pub const METHODS: &[MethodDef] = &[
    method("__getitem__", &["key"], 1, "x.__getitem__(y) <==> x[y]"),
    method("__setitem__", &["key", "value"], 2, "Set self[key] to value."),
    method("__delitem__", &["key"], 1, "Delete self[key]."),
    method("__contains__", &["key"], 1, "True if the map has the specified key."),
    method("__len__", &[], 0, "Return len(self)."),
    method("clear", &[], 0, "Remove all items."),
    method("copy", &[], 0, "A shallow copy of the map."),
    method(
        "get",
        &["key", "default"],
        1,
        "Return the value for key if key is in the map, else default.",
    ),
    method(
        "pop",
        &["key", "default"],
        1,
        "Remove key and return its value; default if absent, else KeyError.",
    ),
    method(
        "popitem",
        &[],
        0,
        "Remove and return some (key, value) pair; KeyError if empty.",
    ),
    method(
        "setdefault",
        &["key", "default"],
        1,
        "Insert key with a value of default if key is not in the map.",
    ),
    method("keys", &[], 0, "A list of the map's keys."),
    method("values", &[], 0, "A list of the map's values."),
    method("items", &[], 0, "A list of the map's (key, value) pairs."),
];

/// Module-level factory returning a new, empty map.
pub const FACTORY: MethodDef = method(
    "map",
    &["capacity"],
    0,
    "map(capacity=0) -> a new, empty native map",
);

pub fn find_method(name: &str) -> Option<&'static MethodDef> {
    METHODS.iter().find(|m| m.name == name)
}

/// Match call arguments to `def.params`, positionally then by keyword.
pub fn bind<'a, O>(
    def: &MethodDef,
    args: &CallArgs<'a, O>,
) -> Result<Vec<Option<&'a O>>, ProtocolError> {
    let arity = || ProtocolError::Arity {
        method: def.name,
        min: def.required,
        max: def.params.len(),
        given: args.given(),
    };
    if args.positional.len() > def.params.len() {
        return Err(arity());
    }
    let mut slots: Vec<Option<&'a O>> = vec![None; def.params.len()];
    for (slot, arg) in slots.iter_mut().zip(args.positional) {
        *slot = Some(arg);
    }
    for (keyword, arg) in args.keywords {
        let idx = def
            .params
            .iter()
            .position(|p| p == keyword)
            .ok_or_else(|| ProtocolError::UnexpectedKeyword {
                method: def.name,
                keyword: keyword.to_string(),
            })?;
        if slots[idx].is_some() {
            return Err(ProtocolError::DuplicateArgument {
                method: def.name,
                name: def.params[idx],
            });
        }
        slots[idx] = Some(arg);
    }
    if slots[..def.required].iter().any(Option::is_none) {
        return Err(arity());
    }
    Ok(slots)
}

/// The host's view of a mapping type: one entry point per protocol slot,
/// plus name-based dispatch over `METHODS`.
pub trait MappingProtocol<H: Host> {
    fn get_item(&self, key: &H::Object) -> Result<Owned<H::Object>, ProtocolError>;

    fn set_item(&mut self, key: &H::Object, value: &H::Object) -> Result<(), ProtocolError>;

    fn del_item(&mut self, key: &H::Object) -> Result<(), ProtocolError>;

    fn contains(&self, key: &H::Object) -> bool;

    fn length(&self) -> usize;

    /// Call the method `name` with host arguments.
    fn call(
        &mut self,
        host: &H,
        name: &str,
        args: CallArgs<'_, H::Object>,
    ) -> Result<Reply<H::Object>, ProtocolError>;
}

impl<H: Host> MappingProtocol<H> for HostMap<H::Object> {
    fn get_item(&self, key: &H::Object) -> Result<Owned<H::Object>, ProtocolError> {
        Ok(self.get(key)?)
    }

    fn set_item(&mut self, key: &H::Object, value: &H::Object) -> Result<(), ProtocolError> {
        Ok(self.set(key, value)?)
    }

    fn del_item(&mut self, key: &H::Object) -> Result<(), ProtocolError> {
        Ok(self.delete(key)?)
    }

    fn contains(&self, key: &H::Object) -> bool {
        self.contains_key(key)
    }

    fn length(&self) -> usize {
        self.len()
    }

    fn call(
        &mut self,
        host: &H,
        name: &str,
        args: CallArgs<'_, H::Object>,
    ) -> Result<Reply<H::Object>, ProtocolError> {
        let def = find_method(name).ok_or_else(|| ProtocolError::UnknownMethod {
            name: name.to_string(),
        })?;
        let bound = bind(def, &args)?;
        let arg = |i: usize| bound.get(i).copied().flatten();
        // `bind` has checked every required slot.
        let required = |i: usize| {
            arg(i).ok_or(ProtocolError::Arity {
                method: def.name,
                min: def.required,
                max: def.params.len(),
                given: args.given(),
            })
        };
        tracing::trace!(method = def.name, entries = self.len(), "dispatch");

        let reply = match def.name {
            "__getitem__" => Reply::Object(self.get(required(0)?)?),
            "__setitem__" => {
                self.set(required(0)?, required(1)?)?;
                Reply::Object(host.none())
            }
            "__delitem__" => {
                self.delete(required(0)?)?;
                Reply::Object(host.none())
            }
            "__contains__" => Reply::Bool(self.contains_key(required(0)?)),
            "__len__" => Reply::Len(self.len()),
            "clear" => {
                self.clear();
                Reply::Object(host.none())
            }
            "copy" => Reply::Object(host.wrap(self.copy()?)?),
            "get" => {
                let key = required(0)?;
                // None is only acquired when it is the answer.
                Reply::Object(match arg(1) {
                    Some(default) => self.get_or(key, default),
                    None => self.get(key).unwrap_or_else(|_| host.none()),
                })
            }
            "pop" => Reply::Object(self.pop(required(0)?, arg(1))?),
            "popitem" => {
                // Pack the tuple first so a failed allocation leaves the
                // entry in place; then the map's references go with it.
                let (key, value) = self.peek_item().ok_or(MapError::EmptyContainer)?;
                let pair = host.pair(key, value)?;
                drop(self.pop_item()?);
                Reply::Object(pair)
            }
            "setdefault" => {
                let key = required(0)?;
                Reply::Object(match arg(1) {
                    Some(default) => self.set_default(key, default)?,
                    None if self.contains_key(key) => self.get(key)?,
                    None => {
                        let none = host.none();
                        self.set_default(key, none.get())?
                    }
                })
            }
            "keys" => Reply::Object(host.list(self.keys())?),
            "values" => Reply::Object(host.list(self.values())?),
            "items" => {
                let pairs = self
                    .iter()
                    .map(|(k, v)| host.pair(k, v))
                    .collect::<Result<Vec<_>, _>>()?;
                Reply::Object(host.list(pairs)?)
            }
            other => {
                return Err(ProtocolError::UnknownMethod {
                    name: other.to_string(),
                })
            }
        };
        Ok(reply)
    }
}

/// The module-level factory: `map(capacity=0)`.
pub fn new_map<H: Host>(
    host: &H,
    args: CallArgs<'_, H::Object>,
) -> Result<Owned<H::Object>, ProtocolError> {
    let bound = bind(&FACTORY, &args)?;
    let capacity = match bound.first().copied().flatten() {
        Some(obj) => host.to_usize(obj).ok_or(ProtocolError::BadArgument {
            method: FACTORY.name,
            name: "capacity",
            expected: "a non-negative integer",
        })?,
        None => 0,
    };
    let mut map = HostMap::new();
    map.try_reserve(capacity)?;
    Ok(host.wrap(map)?)
}
