//! Counting host doubles.
//!
//! `TrackedHost` hands out `Obj` handles whose reference counts are kept by
//! the double and every `acquire`/`release` is tallied, per object and
//! globally. Acquiring a freed object or releasing one past zero panics, so
//! a use-after-free or double release in the map shows up as a test
//! failure instead of silent corruption. Freed containers (tuples, lists,
//! wrapped maps) release what they hold, as a real host would.
//!
//! `TrackedRegistrar` does the same for module and type objects and can be
//! told to fail at any registration step.

use crate::error::{HostError, RegistrationStep};
use crate::host::{Host, HostObject, MethodDef, Registrar, TypeSpec};
use crate::host_map::HostMap;
use crate::owned::Owned;
use std::cell::{Cell, RefCell, RefMut};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Ledger {
    acquires: Cell<usize>,
    releases: Cell<usize>,
    next_id: Cell<u64>,
}

pub enum Payload {
    None,
    Int(i64),
    Str(String),
    Pair(Obj, Obj),
    List(Vec<Obj>),
    Map(RefCell<Option<HostMap<Obj>>>),
}

struct ObjInner {
    id: u64,
    hash: u64,
    payload: Payload,
    refcount: Cell<isize>,
    acquires: Cell<usize>,
    releases: Cell<usize>,
    freed: Cell<bool>,
    ledger: Rc<Ledger>,
}

/// Uncounted handle to a tracked object.
#[derive(Clone)]
pub struct Obj(Rc<ObjInner>);

impl Obj {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Current host reference count (the creator holds the first one).
    pub fn refcount(&self) -> isize {
        self.0.refcount.get()
    }

    pub fn acquires(&self) -> usize {
        self.0.acquires.get()
    }

    pub fn releases(&self) -> usize {
        self.0.releases.get()
    }

    pub fn is_freed(&self) -> bool {
        self.0.freed.get()
    }

    pub fn payload(&self) -> &Payload {
        &self.0.payload
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.0.payload {
            Payload::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0.payload {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.0.payload, Payload::None)
    }

    pub fn pair_items(&self) -> Option<(Obj, Obj)> {
        match &self.0.payload {
            Payload::Pair(a, b) => Some((a.clone(), b.clone())),
            _ => None,
        }
    }

    pub fn list_items(&self) -> Option<Vec<Obj>> {
        match &self.0.payload {
            Payload::List(items) => Some(items.clone()),
            _ => None,
        }
    }

    /// Borrow the container boxed inside a wrapped-map object.
    pub fn as_map(&self) -> Option<RefMut<'_, HostMap<Obj>>> {
        match &self.0.payload {
            Payload::Map(cell) => RefMut::filter_map(cell.borrow_mut(), |m| m.as_mut()).ok(),
            _ => None,
        }
    }

    fn free(&self) {
        self.0.freed.set(true);
        match &self.0.payload {
            Payload::Pair(a, b) => {
                a.release();
                b.release();
            }
            Payload::List(items) => items.iter().for_each(HostObject::release),
            Payload::Map(cell) => {
                let map = cell.borrow_mut().take();
                drop(map);
            }
            Payload::None | Payload::Int(_) | Payload::Str(_) => {}
        }
    }
}

impl HostObject for Obj {
    fn acquire(&self) {
        assert!(!self.is_freed(), "acquire of freed object #{}", self.0.id);
        self.0.refcount.set(self.0.refcount.get() + 1);
        self.0.acquires.set(self.0.acquires.get() + 1);
        let ledger = &self.0.ledger;
        ledger.acquires.set(ledger.acquires.get() + 1);
    }

    fn release(&self) {
        assert!(!self.is_freed(), "release of freed object #{}", self.0.id);
        let n = self.0.refcount.get() - 1;
        self.0.refcount.set(n);
        self.0.releases.set(self.0.releases.get() + 1);
        let ledger = &self.0.ledger;
        ledger.releases.set(ledger.releases.get() + 1);
        if n == 0 {
            self.free();
        }
    }

    fn host_hash(&self) -> u64 {
        self.0.hash
    }

    fn host_eq(&self, other: &Self) -> bool {
        match (&self.0.payload, &other.0.payload) {
            (Payload::None, Payload::None) => true,
            (Payload::Int(a), Payload::Int(b)) => a == b,
            (Payload::Str(a), Payload::Str(b)) => a == b,
            _ => self.is(other),
        }
    }

    fn is(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Obj");
        d.field("id", &self.0.id);
        match &self.0.payload {
            Payload::None => d.field("value", &"None"),
            Payload::Int(i) => d.field("value", i),
            Payload::Str(s) => d.field("value", s),
            Payload::Pair(..) => d.field("value", &"<pair>"),
            Payload::List(items) => d.field("len", &items.len()),
            Payload::Map(_) => d.field("value", &"<map>"),
        };
        d.field("refcount", &self.0.refcount.get()).finish()
    }
}

/// Single-threaded counting host.
pub struct TrackedHost {
    ledger: Rc<Ledger>,
    none: Obj,
    fail_allocations: Cell<bool>,
}

impl Default for TrackedHost {
    fn default() -> Self {
        Self::new()
    }
}

fn std_hash<T: Hash + ?Sized>(t: &T) -> u64 {
    let mut h = DefaultHasher::new();
    t.hash(&mut h);
    h.finish()
}

impl TrackedHost {
    pub fn new() -> Self {
        let ledger = Rc::new(Ledger::default());
        let none = Self::make(&ledger, 0, Payload::None);
        Self {
            ledger,
            none,
            fail_allocations: Cell::new(false),
        }
    }

    fn make(ledger: &Rc<Ledger>, hash: u64, payload: Payload) -> Obj {
        let id = ledger.next_id.get();
        ledger.next_id.set(id + 1);
        Obj(Rc::new(ObjInner {
            id,
            hash,
            payload,
            refcount: Cell::new(1),
            acquires: Cell::new(0),
            releases: Cell::new(0),
            freed: Cell::new(false),
            ledger: ledger.clone(),
        }))
    }

    fn alloc(&self, hash: u64, payload: Payload) -> Result<Obj, HostError> {
        if self.fail_allocations.get() {
            return Err(HostError::new("allocation refused"));
        }
        Ok(Self::make(&self.ledger, hash, payload))
    }

    /// A fresh integer object; the caller holds its single reference.
    pub fn int(&self, i: i64) -> Obj {
        Self::make(&self.ledger, std_hash(&i), Payload::Int(i))
    }

    pub fn str(&self, s: &str) -> Obj {
        Self::make(&self.ledger, std_hash(s), Payload::Str(s.to_string()))
    }

    /// A string object with a forced host hash, for collision tests.
    pub fn colliding(&self, s: &str, hash: u64) -> Obj {
        Self::make(&self.ledger, hash, Payload::Str(s.to_string()))
    }

    pub fn none_obj(&self) -> Obj {
        self.none.clone()
    }

    /// Make every subsequent host allocation fail until reset.
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.set(fail);
    }

    pub fn total_acquires(&self) -> usize {
        self.ledger.acquires.get()
    }

    pub fn total_releases(&self) -> usize {
        self.ledger.releases.get()
    }

    /// Acquires minus releases across every object of this host.
    pub fn outstanding(&self) -> isize {
        self.total_acquires() as isize - self.total_releases() as isize
    }
}

impl Host for TrackedHost {
    type Object = Obj;

    fn none(&self) -> Owned<Obj> {
        Owned::acquire(&self.none)
    }

    fn pair(&self, first: &Obj, second: &Obj) -> Result<Owned<Obj>, HostError> {
        let obj = self.alloc(
            std_hash(&(first.host_hash(), second.host_hash())),
            Payload::Pair(first.clone(), second.clone()),
        )?;
        first.acquire();
        second.acquire();
        Ok(Owned::adopt(obj))
    }

    fn list(&self, items: Vec<Owned<Obj>>) -> Result<Owned<Obj>, HostError> {
        if self.fail_allocations.get() {
            // Stolen even on failure: dropping `items` releases them.
            return Err(HostError::new("allocation refused"));
        }
        let hash = self.ledger.next_id.get();
        let raw: Vec<Obj> = items.into_iter().map(Owned::into_raw).collect();
        Ok(Owned::adopt(Self::make(&self.ledger, hash, Payload::List(raw))))
    }

    fn to_usize(&self, obj: &Obj) -> Option<usize> {
        obj.as_int().and_then(|i| usize::try_from(i).ok())
    }

    fn wrap(&self, map: HostMap<Obj>) -> Result<Owned<Obj>, HostError> {
        let hash = self.ledger.next_id.get();
        let obj = self.alloc(hash, Payload::Map(RefCell::new(Some(map))))?;
        Ok(Owned::adopt(obj))
    }
}

/// Module handle produced by `TrackedRegistrar`.
#[derive(Clone, Debug)]
pub struct TrackedModule(Arc<ModuleRecord>);

#[derive(Debug)]
pub struct ModuleRecord {
    pub id: usize,
    pub name: String,
    pub functions: Vec<&'static str>,
    refcount: AtomicIsize,
    constants: Mutex<Vec<(String, String)>>,
    types: Mutex<Vec<(String, TrackedType)>>,
}

impl TrackedModule {
    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn functions(&self) -> &[&'static str] {
        &self.0.functions
    }

    pub fn refcount(&self) -> isize {
        self.0.refcount.load(Ordering::SeqCst)
    }

    pub fn constant(&self, name: &str) -> Option<String> {
        let constants = self.0.constants.lock().unwrap_or_else(|p| p.into_inner());
        constants
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    pub fn type_named(&self, name: &str) -> Option<TrackedType> {
        let types = self.0.types.lock().unwrap_or_else(|p| p.into_inner());
        types.iter().find(|(n, _)| n == name).map(|(_, t)| t.clone())
    }
}

/// Type object produced by `TrackedRegistrar`.
#[derive(Clone, Debug)]
pub struct TrackedType(Arc<TypeRecord>);

#[derive(Debug)]
pub struct TypeRecord {
    pub name: String,
    pub doc: String,
    pub methods: Vec<&'static str>,
    refcount: AtomicIsize,
}

impl TrackedType {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn doc(&self) -> &str {
        &self.0.doc
    }

    pub fn methods(&self) -> &[&'static str] {
        &self.0.methods
    }

    pub fn refcount(&self) -> isize {
        self.0.refcount.load(Ordering::SeqCst)
    }
}

/// Thread-safe registration double with step-level failure injection.
#[derive(Default)]
pub struct TrackedRegistrar {
    fail_at: Mutex<Option<RegistrationStep>>,
    create_delay: Mutex<Option<Duration>>,
    modules_created: AtomicUsize,
    types_created: AtomicUsize,
    live_modules: AtomicIsize,
    live_types: AtomicIsize,
}

impl TrackedRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_at(&self, step: Option<RegistrationStep>) {
        *self.fail_at.lock().unwrap_or_else(|p| p.into_inner()) = step;
    }

    /// Sleep inside `create_module`, to widen races between first callers.
    pub fn delay_creation(&self, delay: Duration) {
        *self.create_delay.lock().unwrap_or_else(|p| p.into_inner()) = Some(delay);
    }

    pub fn modules_created(&self) -> usize {
        self.modules_created.load(Ordering::SeqCst)
    }

    pub fn types_created(&self) -> usize {
        self.types_created.load(Ordering::SeqCst)
    }

    /// Module objects not yet freed.
    pub fn live_modules(&self) -> isize {
        self.live_modules.load(Ordering::SeqCst)
    }

    /// Type objects not yet freed.
    pub fn live_types(&self) -> isize {
        self.live_types.load(Ordering::SeqCst)
    }

    fn check(&self, step: RegistrationStep) -> Result<(), HostError> {
        let fail = *self.fail_at.lock().unwrap_or_else(|p| p.into_inner());
        if fail == Some(step) {
            return Err(HostError::new(format!("injected failure at {step}")));
        }
        Ok(())
    }

    fn decref_type(&self, ty: &TrackedType) {
        let n = ty.0.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(n >= 0, "type `{}` released past zero", ty.name());
        if n == 0 {
            self.live_types.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Registrar for TrackedRegistrar {
    type Module = TrackedModule;
    type TypeObject = TrackedType;

    fn create_module(
        &self,
        name: &str,
        functions: &[MethodDef],
    ) -> Result<TrackedModule, HostError> {
        let delay = *self.create_delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(d) = delay {
            std::thread::sleep(d);
        }
        self.check(RegistrationStep::CreateModule)?;
        let id = self.modules_created.fetch_add(1, Ordering::SeqCst);
        self.live_modules.fetch_add(1, Ordering::SeqCst);
        Ok(TrackedModule(Arc::new(ModuleRecord {
            id,
            name: name.to_string(),
            functions: functions.iter().map(|f| f.name).collect(),
            refcount: AtomicIsize::new(1),
            constants: Mutex::new(Vec::new()),
            types: Mutex::new(Vec::new()),
        })))
    }

    fn add_string_constant(
        &self,
        module: &TrackedModule,
        name: &str,
        value: &str,
    ) -> Result<(), HostError> {
        self.check(RegistrationStep::AddVersion)?;
        let mut constants = module.0.constants.lock().unwrap_or_else(|p| p.into_inner());
        constants.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn create_type(&self, spec: &TypeSpec<'_>) -> Result<TrackedType, HostError> {
        self.check(RegistrationStep::CreateType)?;
        self.types_created.fetch_add(1, Ordering::SeqCst);
        self.live_types.fetch_add(1, Ordering::SeqCst);
        Ok(TrackedType(Arc::new(TypeRecord {
            name: spec.name.to_string(),
            doc: spec.doc.to_string(),
            methods: spec.methods.iter().map(|m| m.name).collect(),
            refcount: AtomicIsize::new(1),
        })))
    }

    fn add_type(
        &self,
        module: &TrackedModule,
        name: &str,
        ty: &TrackedType,
    ) -> Result<(), HostError> {
        self.check(RegistrationStep::AddType)?;
        ty.0.refcount.fetch_add(1, Ordering::SeqCst);
        let mut types = module.0.types.lock().unwrap_or_else(|p| p.into_inner());
        types.push((name.to_string(), ty.clone()));
        Ok(())
    }

    fn release_type(&self, ty: TrackedType) {
        self.decref_type(&ty);
    }

    fn release_module(&self, module: TrackedModule) {
        let n = module.0.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(n >= 0, "module `{}` released past zero", module.name());
        if n == 0 {
            self.live_modules.fetch_sub(1, Ordering::SeqCst);
            let types = std::mem::take(
                &mut *module.0.types.lock().unwrap_or_else(|p| p.into_inner()),
            );
            for (_, ty) in types {
                self.decref_type(&ty);
            }
        }
    }
}
