//! Name to flag bindings with an explicit dynamic capability per entry.

use crate::core::{DynamicValue, FlagValue};
use crate::error::{FlagError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Object-safe view of a flag, independent of its value type.
pub trait Flag: Send + Sync {
    /// The flag name.
    fn name(&self) -> &str;

    /// Human readable description.
    fn usage(&self) -> &str;

    /// Parse and store a raw string.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation error; the previous value is kept.
    fn set_str(&self, raw: &str) -> Result<()>;

    /// The current value in raw string form.
    fn value_string(&self) -> String;

    /// The declared default in raw string form.
    fn default_string(&self) -> String;
}

impl<T: FlagValue> Flag for DynamicValue<T> {
    fn name(&self) -> &str {
        DynamicValue::name(self)
    }

    fn usage(&self) -> &str {
        DynamicValue::usage(self)
    }

    fn set_str(&self, raw: &str) -> Result<()> {
        self.set(raw)
    }

    fn value_string(&self) -> String {
        DynamicValue::value_string(self)
    }

    fn default_string(&self) -> String {
        DynamicValue::default_string(self)
    }
}

/// Point-in-time description of one registered flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagInfo {
    /// Flag name
    pub name: String,
    /// Usage text
    pub usage: String,
    /// Current value, rendered
    pub value: String,
    /// Declared default, rendered
    pub default: String,
    /// Whether the flag may change after startup
    pub dynamic: bool,
    /// Whether the flag was explicitly set through the registry
    pub changed: bool,
}

/// The registry interface consumed by the synchronization machinery.
///
/// Writes go through `set_by_name` rather than straight to the box so the
/// registry can keep its "explicitly changed" bookkeeping.
pub trait FlagSet: Send + Sync {
    /// Describe the flag called `name`, if registered.
    fn lookup(&self, name: &str) -> Option<FlagInfo>;

    /// Whether `name` is registered and marked dynamic.
    fn is_dynamic(&self, name: &str) -> bool;

    /// Parse and store `raw` into the flag called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::UnknownFlag`] or the flag's parse/validation error.
    fn set_by_name(&self, name: &str, raw: &str) -> Result<()>;

    /// Visit every flag in name order.
    fn visit_all(&self, visitor: &mut dyn FnMut(&FlagInfo));
}

struct Entry {
    flag: Arc<dyn Flag>,
    dynamic: bool,
    changed: AtomicBool,
}

impl Entry {
    fn info(&self) -> FlagInfo {
        FlagInfo {
            name: self.flag.name().to_string(),
            usage: self.flag.usage().to_string(),
            value: self.flag.value_string(),
            default: self.flag.default_string(),
            dynamic: self.dynamic,
            changed: self.changed.load(Ordering::Acquire),
        }
    }
}

/// Registry of static and dynamic flags.
///
/// Registration normally happens once at startup; lookups and sets clone
/// the entry out of the map so validators and notifiers never run under
/// the registry lock.
///
/// # Examples
///
/// ```rust
/// use hotswap_flags::core::{FlagRegistry, FlagSet};
///
/// let registry = FlagRegistry::new();
/// let limit = registry.dynamic("rate_limit", 100u32, "Requests per second").unwrap();
/// let _region = registry.static_flag("region", String::from("eu-west-1"), "Home region").unwrap();
///
/// registry.set_by_name("rate_limit", "250").unwrap();
/// assert_eq!(*limit.get(), 250);
/// assert!(registry.is_dynamic("rate_limit"));
/// assert!(!registry.is_dynamic("region"));
/// ```
#[derive(Default)]
pub struct FlagRegistry {
    entries: RwLock<BTreeMap<String, Arc<Entry>>>,
}

impl FlagRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, flag: Arc<dyn Flag>, dynamic: bool) -> Result<()> {
        let name = flag.name().to_string();
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(FlagError::DuplicateFlag(name));
        }
        entries.insert(
            name,
            Arc::new(Entry {
                flag,
                dynamic,
                changed: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    /// Register a flag that may change while the process runs.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::DuplicateFlag`] if the name is taken.
    pub fn register_dynamic(&self, flag: Arc<dyn Flag>) -> Result<()> {
        self.register(flag, true)
    }

    /// Register a flag that is only meant to be set at startup.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::DuplicateFlag`] if the name is taken.
    pub fn register_static(&self, flag: Arc<dyn Flag>) -> Result<()> {
        self.register(flag, false)
    }

    /// Register an already configured box and hand back a shared handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::DuplicateFlag`] if the name is taken.
    pub fn add<T: FlagValue>(&self, value: DynamicValue<T>, dynamic: bool) -> Result<Arc<DynamicValue<T>>> {
        let value = Arc::new(value);
        self.register(Arc::clone(&value) as Arc<dyn Flag>, dynamic)?;
        Ok(value)
    }

    /// Declare a dynamic flag with a default value.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::DuplicateFlag`] if the name is taken.
    pub fn dynamic<T: FlagValue>(
        &self,
        name: &str,
        default: T,
        usage: &str,
    ) -> Result<Arc<DynamicValue<T>>> {
        self.add(DynamicValue::new(name, default).with_usage(usage), true)
    }

    /// Declare a static flag with a default value.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::DuplicateFlag`] if the name is taken.
    pub fn static_flag<T: FlagValue>(
        &self,
        name: &str,
        default: T,
        usage: &str,
    ) -> Result<Arc<DynamicValue<T>>> {
        self.add(DynamicValue::new(name, default).with_usage(usage), false)
    }

    fn entry(&self, name: &str) -> Option<Arc<Entry>> {
        self.entries.read().get(name).cloned()
    }

    /// Apply a runtime change, refusing flags that are not dynamic.
    ///
    /// This is the entry point for programmatic setters (admin endpoints and
    /// the like). Unlike the background watcher, it reports static flags as
    /// an error instead of skipping them.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::UnknownFlag`], [`FlagError::NotDynamic`] or the
    /// flag's parse/validation error.
    pub fn set_dynamic(&self, name: &str, raw: &str) -> Result<()> {
        let entry = self
            .entry(name)
            .ok_or_else(|| FlagError::UnknownFlag(name.to_string()))?;
        if !entry.dynamic {
            return Err(FlagError::NotDynamic(name.to_string()));
        }
        entry.flag.set_str(raw)?;
        entry.changed.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether the flag was explicitly set through this registry.
    pub fn is_changed(&self, name: &str) -> bool {
        self.entry(name)
            .map(|e| e.changed.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Consistent listing of every flag, taken under a single read lock.
    pub fn snapshot(&self) -> Vec<FlagInfo> {
        let entries = self.entries.read();
        entries.values().map(|e| e.info()).collect()
    }

    /// Registered flag names in order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of registered flags.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no flags are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl FlagSet for FlagRegistry {
    fn lookup(&self, name: &str) -> Option<FlagInfo> {
        self.entry(name).map(|e| e.info())
    }

    fn is_dynamic(&self, name: &str) -> bool {
        self.entry(name).map(|e| e.dynamic).unwrap_or(false)
    }

    fn set_by_name(&self, name: &str, raw: &str) -> Result<()> {
        let entry = self
            .entry(name)
            .ok_or_else(|| FlagError::UnknownFlag(name.to_string()))?;
        entry.flag.set_str(raw)?;
        entry.changed.store(true, Ordering::Release);
        Ok(())
    }

    fn visit_all(&self, visitor: &mut dyn FnMut(&FlagInfo)) {
        for info in self.snapshot() {
            visitor(&info);
        }
    }
}
