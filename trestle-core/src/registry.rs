//! Hierarchical, type-indexed service registry.
//!
//! A [`Registry`] is an immutable stack of layers. Each layer holds an
//! ordered list of entries and an optional parent. Lookups walk the
//! current layer from the most recently added entry backwards, then fall
//! back to the parent, so child entries shadow parent entries without
//! removing them.
//!
//! An entry is visible under its concrete type and under any capability
//! it declared at registration time with [`RegistryEntry::expose`]:
//!
//! ```
//! use std::sync::Arc;
//! use trestle_core::registry::{Registry, RegistryEntry};
//!
//! trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! struct English;
//!
//! impl Greeter for English {
//!     fn greet(&self) -> String {
//!         "hello".to_string()
//!     }
//! }
//!
//! let registry = Registry::builder()
//!     .add_entry(RegistryEntry::of(English).expose(|e: Arc<English>| e as Arc<dyn Greeter>))
//!     .build();
//!
//! let greeter = registry.get::<dyn Greeter>().unwrap();
//! assert_eq!(greeter.greet(), "hello");
//! assert!(registry.maybe_get::<English>().is_some());
//! ```

use crate::Error;
use crate::logging::{debug, trace, warn};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Erased = Arc<dyn Any + Send + Sync>;
type Caster = Box<dyn Fn(Erased) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// A type under which an entry can be looked up.
struct View {
    type_id: TypeId,
    type_name: &'static str,
    cast: Caster,
}

impl View {
    fn new<T, U>(cast: impl Fn(Arc<T>) -> Arc<U> + Send + Sync + 'static) -> Self
    where
        T: Send + Sync + 'static,
        U: ?Sized + Send + Sync + 'static,
    {
        Self {
            type_id: TypeId::of::<U>(),
            type_name: type_name::<U>(),
            cast: Box::new(move |erased: Erased| {
                erased
                    .downcast::<T>()
                    .ok()
                    .map(|typed| Box::new(cast(typed)) as Box<dyn Any + Send + Sync>)
            }),
        }
    }
}

enum Supplier {
    Eager(Erased),
    Lazy {
        cell: OnceCell<Erased>,
        factory: Box<dyn Fn() -> Erased + Send + Sync>,
    },
}

/// A single registry entry: a value (or a factory for one) plus the set of
/// types it can be retrieved as.
pub struct RegistryEntry {
    type_name: &'static str,
    value_type: TypeId,
    views: Vec<View>,
    supplier: Supplier,
}

impl RegistryEntry {
    /// Eager entry holding `value`.
    pub fn of<T: Send + Sync + 'static>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Eager entry sharing an existing `Arc`.
    pub fn from_arc<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self::with_supplier::<T>(Supplier::Eager(value))
    }

    /// Lazy entry. `factory` runs at most once, on the first lookup that
    /// matches this entry, and the result is shared by every later lookup.
    pub fn lazy<T, F>(factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_supplier::<T>(Supplier::Lazy {
            cell: OnceCell::new(),
            factory: Box::new(move || Arc::new(factory()) as Erased),
        })
    }

    /// Entry for an already type-erased value, e.g. `Arc<dyn Renderer>`.
    /// It is retrievable as `U`.
    pub fn shared<U: ?Sized + Send + Sync + 'static>(value: Arc<U>) -> Self {
        Self {
            type_name: type_name::<U>(),
            value_type: TypeId::of::<Arc<U>>(),
            views: vec![View::new::<Arc<U>, U>(|outer| (*outer).clone())],
            supplier: Supplier::Eager(Arc::new(value)),
        }
    }

    fn with_supplier<T: Send + Sync + 'static>(supplier: Supplier) -> Self {
        Self {
            type_name: type_name::<T>(),
            value_type: TypeId::of::<T>(),
            views: vec![View::new::<T, T>(|value| value)],
            supplier,
        }
    }

    /// Declare an additional type this entry satisfies.
    ///
    /// `cast` is usually an unsizing coercion such as
    /// `|v: Arc<Impl>| v as Arc<dyn Trait>`.
    pub fn expose<T, U>(mut self, cast: impl Fn(Arc<T>) -> Arc<U> + Send + Sync + 'static) -> Self
    where
        T: Send + Sync + 'static,
        U: ?Sized + Send + Sync + 'static,
    {
        if TypeId::of::<T>() != self.value_type {
            warn!(
                entry = self.type_name,
                requested = type_name::<T>(),
                "Ignoring capability declared for a different value type"
            );
            return self;
        }
        self.views.push(View::new::<T, U>(cast));
        self
    }

    /// Name of the value type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Names of every type this entry can be retrieved as.
    pub fn capabilities(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.views.iter().map(|view| view.type_name)
    }

    fn provides(&self, type_id: TypeId) -> bool {
        self.views.iter().any(|view| view.type_id == type_id)
    }

    fn value(&self) -> Erased {
        match &self.supplier {
            Supplier::Eager(value) => value.clone(),
            Supplier::Lazy { cell, factory } => cell
                .get_or_init(|| {
                    debug!(entry = self.type_name, "Initializing lazy registry entry");
                    factory()
                })
                .clone(),
        }
    }

    fn resolve<U: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<U>> {
        let type_id = TypeId::of::<U>();
        let view = self.views.iter().find(|view| view.type_id == type_id)?;
        let cast = (view.cast)(self.value())?;
        cast.downcast::<Arc<U>>().ok().map(|value| *value)
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lazy = matches!(self.supplier, Supplier::Lazy { .. });
        f.debug_struct("RegistryEntry")
            .field("type", &self.type_name)
            .field("capabilities", &self.capabilities().collect::<Vec<_>>())
            .field("lazy", &lazy)
            .finish()
    }
}

struct Layer {
    entries: Vec<Arc<RegistryEntry>>,
    parent: Option<Registry>,
    // Matching entry indices per requested type, most recent first.
    matches: RwLock<HashMap<TypeId, Arc<[usize]>>>,
}

impl Layer {
    fn matching(&self, type_id: TypeId) -> Arc<[usize]> {
        if let Some(hit) = self.matches.read().get(&type_id) {
            return hit.clone();
        }

        let found: Arc<[usize]> = (0..self.entries.len())
            .rev()
            .filter(|&index| self.entries[index].provides(type_id))
            .collect();

        self.matches.write().entry(type_id).or_insert(found).clone()
    }
}

/// Immutable hierarchical registry. Cloning is cheap.
#[derive(Clone)]
pub struct Registry {
    layer: Arc<Layer>,
}

impl Registry {
    fn from_entries(entries: Vec<Arc<RegistryEntry>>, parent: Option<Registry>) -> Self {
        Self {
            layer: Arc::new(Layer {
                entries,
                parent,
                matches: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// A registry with no entries.
    pub fn empty() -> Self {
        Self::from_entries(Vec::new(), None)
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// A registry holding exactly one eager entry.
    pub fn single<T: Send + Sync + 'static>(value: T) -> Self {
        Self::builder().add(value).build()
    }

    /// A registry holding exactly one pre-built entry.
    pub fn of_entry(entry: RegistryEntry) -> Self {
        Self::builder().add_entry(entry).build()
    }

    fn layers(&self) -> impl Iterator<Item = &Layer> {
        std::iter::successors(Some(&*self.layer), |layer| {
            layer.parent.as_ref().map(|parent| &*parent.layer)
        })
    }

    /// True if no layer holds any entry.
    pub fn is_empty(&self) -> bool {
        self.layers().all(|layer| layer.entries.is_empty())
    }

    /// Total number of entries across all layers.
    pub fn len(&self) -> usize {
        self.layers().map(|layer| layer.entries.len()).sum()
    }

    /// The most recently added entry retrievable as `T`.
    pub fn maybe_get<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let found = self.first::<T, _>(Some);
        trace!(
            requested = type_name::<T>(),
            found = found.is_some(),
            "Registry lookup"
        );
        found
    }

    /// Like [`Registry::maybe_get`], but absence is an error naming the type.
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, Error> {
        self.maybe_get::<T>().ok_or_else(|| {
            debug!(requested = type_name::<T>(), "Type not found in registry");
            Error::NotInRegistry(type_name::<T>())
        })
    }

    /// Every entry retrievable as `T`.
    ///
    /// Ordered most recently added first within a layer, and child layers
    /// before their parents. This is the order [`Registry::maybe_get`] and
    /// [`Registry::first`] search in.
    pub fn get_all<T: ?Sized + Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        let type_id = TypeId::of::<T>();
        let mut all = Vec::new();
        for layer in self.layers() {
            for &index in layer.matching(type_id).iter() {
                if let Some(value) = layer.entries[index].resolve::<T>() {
                    all.push(value);
                }
            }
        }
        all
    }

    /// Apply `f` to each entry retrievable as `T` until it returns `Some`.
    pub fn first<T, R>(&self, mut f: impl FnMut(Arc<T>) -> Option<R>) -> Option<R>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        for layer in self.layers() {
            for &index in layer.matching(type_id).iter() {
                if let Some(result) = layer.entries[index].resolve::<T>().and_then(&mut f) {
                    return Some(result);
                }
            }
        }
        None
    }

    /// Layer `child` over this registry.
    ///
    /// Entries of `child` shadow entries of `self`; both remain visible to
    /// [`Registry::get_all`]. Lazy entries are shared, not copied, so a
    /// factory still runs at most once.
    pub fn join(&self, child: &Registry) -> Registry {
        if child.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return child.clone();
        }

        let mut pending: Vec<&Layer> = child
            .layers()
            .filter(|layer| !layer.entries.is_empty())
            .collect();

        let mut joined = self.clone();
        while let Some(layer) = pending.pop() {
            joined = Registry::from_entries(layer.entries.clone(), Some(joined));
        }
        joined
    }

    /// Shorthand for joining a single value onto this registry.
    pub fn with<T: Send + Sync + 'static>(&self, value: T) -> Registry {
        self.join(&Registry::single(value))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layers: Vec<Vec<&'static str>> = self
            .layers()
            .map(|layer| layer.entries.iter().map(|entry| entry.type_name).collect())
            .collect();
        f.debug_struct("Registry").field("layers", &layers).finish()
    }
}

/// Builder for a single registry layer. Later additions take precedence.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<Arc<RegistryEntry>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.add_entry(RegistryEntry::of(value))
    }

    pub fn add_arc<T: Send + Sync + 'static>(self, value: Arc<T>) -> Self {
        self.add_entry(RegistryEntry::from_arc(value))
    }

    /// Add a value retrievable as the (possibly unsized) type `U`.
    pub fn add_shared<U: ?Sized + Send + Sync + 'static>(self, value: Arc<U>) -> Self {
        self.add_entry(RegistryEntry::shared(value))
    }

    pub fn add_lazy<T, F>(self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.add_entry(RegistryEntry::lazy(factory))
    }

    pub fn add_entry(mut self, entry: RegistryEntry) -> Self {
        trace!(entry = entry.type_name, "Adding registry entry");
        self.entries.push(Arc::new(entry));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(self) -> Registry {
        debug!(entry_count = self.entries.len(), "Registry built");
        Registry::from_entries(self.entries, None)
    }

    /// Build this layer as a child of `parent`.
    pub fn build_on(self, parent: &Registry) -> Registry {
        if self.entries.is_empty() {
            return parent.clone();
        }
        Registry::from_entries(self.entries, Some(parent.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Service(&'static str);

    impl Named for Service {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn named(name: &'static str) -> RegistryEntry {
        RegistryEntry::of(Service(name)).expose(|s: Arc<Service>| s as Arc<dyn Named>)
    }

    #[test]
    fn test_most_recent_entry_wins() {
        let registry = Registry::builder().add(1u32).add(2u32).build();
        assert_eq!(*registry.get::<u32>().unwrap(), 2);
        assert_eq!(
            registry.get_all::<u32>().iter().map(|v| **v).collect::<Vec<_>>(),
            vec![2, 1]
        );
    }

    #[test]
    fn test_child_shadows_parent() {
        let parent = Registry::builder().add_entry(named("parent")).add(7u8).build();
        let child = parent.join(&Registry::of_entry(named("child")));

        assert_eq!(child.get::<dyn Named>().unwrap().name(), "child");
        assert_eq!(*child.get::<u8>().unwrap(), 7);

        let names: Vec<String> = child
            .get_all::<dyn Named>()
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(names, vec!["child", "parent"]);

        // The parent itself is unchanged.
        assert_eq!(parent.get::<dyn Named>().unwrap().name(), "parent");
    }

    #[test]
    fn test_capability_and_concrete_lookup() {
        let registry = Registry::of_entry(named("svc"));
        assert!(registry.maybe_get::<Service>().is_some());
        assert!(registry.maybe_get::<dyn Named>().is_some());
        assert!(registry.maybe_get::<String>().is_none());
    }

    #[test]
    fn test_expose_for_wrong_type_is_ignored() {
        let entry = RegistryEntry::of(5u16).expose(|s: Arc<Service>| s as Arc<dyn Named>);
        let registry = Registry::of_entry(entry);
        assert!(registry.maybe_get::<dyn Named>().is_none());
        assert_eq!(*registry.get::<u16>().unwrap(), 5);
    }

    #[test]
    fn test_shared_entry() {
        let value: Arc<dyn Named> = Arc::new(Service("shared"));
        let registry = Registry::builder().add_shared(value).build();
        assert_eq!(registry.get::<dyn Named>().unwrap().name(), "shared");
    }

    #[test]
    fn test_get_names_missing_type() {
        let err = Registry::empty().get::<String>().unwrap_err();
        match err {
            Error::NotInRegistry(name) => assert!(name.contains("String")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_first_short_circuits() {
        let registry = Registry::builder()
            .add_entry(named("a"))
            .add_entry(named("b"))
            .add_entry(named("c"))
            .build();

        let mut visited = Vec::new();
        let found = registry.first::<dyn Named, _>(|n| {
            visited.push(n.name().to_string());
            (n.name() == "b").then(|| n.name().to_uppercase())
        });

        assert_eq!(found.as_deref(), Some("B"));
        assert_eq!(visited, vec!["c", "b"]);
    }

    #[test]
    fn test_join_keeps_lazy_memoization() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let base = Registry::builder()
            .add_lazy(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                String::from("lazy")
            })
            .build();

        let a = base.join(&Registry::single(1u8));
        let b = Registry::single(2u8).join(&base);

        let first = a.get::<String>().unwrap();
        let second = b.get::<String>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_single_init_under_contention() {
        const THREADS: usize = 8;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = Registry::builder()
            .add_lazy(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                vec![1u8, 2, 3]
            })
            .build();

        let barrier = Barrier::new(THREADS);
        let results: Vec<Arc<Vec<u8>>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        registry.get::<Vec<u8>>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[test]
    fn test_empty_join_shortcuts() {
        let registry = Registry::single(3i64);
        assert_eq!(registry.join(&Registry::empty()).len(), 1);
        assert_eq!(Registry::empty().join(&registry).len(), 1);
        assert!(Registry::empty().is_empty());
    }

    #[test]
    fn test_nested_child_join_order() {
        let grandparent = Registry::single(1u32);
        let parent = Registry::builder().add(2u32).build_on(&grandparent);
        let child = Registry::builder().add(3u32).build_on(&parent);
        let joined = Registry::single(0u32).join(&child);

        assert_eq!(
            joined.get_all::<u32>().iter().map(|v| **v).collect::<Vec<_>>(),
            vec![3, 2, 1, 0]
        );
    }
}
