//! The dynamic value box providing lock-free reads and validated atomic swaps.

use crate::core::FlagValue;
use crate::error::{FlagError, Result, ValidationError};
use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::Arc;

/// Type alias for validator functions.
type Validator<T> = Arc<dyn Fn(&T) -> std::result::Result<(), ValidationError> + Send + Sync>;

/// Type alias for change notifiers, called with `(old, new)`.
type Notifier<T> = Arc<dyn Fn(Arc<T>, Arc<T>) + Send + Sync>;

/// Type alias for mutators applied before validation.
type Mutator<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// How a notifier is invoked after a successful swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyMode {
    /// Run the notifier on a detached task; `set` never waits for it.
    #[default]
    Async,
    /// Run the notifier on the caller before `set` returns.
    Sync,
}

fn trim_input(raw: &str) -> String {
    raw.trim().to_string()
}

/// A typed configuration value that can change while the process runs.
///
/// Reads go through `arc-swap` and never block. Writes decode a raw string,
/// run the optional mutator and validator, and only then replace the whole
/// value in one atomic store. A rejected write leaves the previous value in
/// place, so concurrent readers never observe a torn or invalid state.
///
/// # Examples
///
/// ```rust
/// use hotswap_flags::core::DynamicValue;
/// use hotswap_flags::error::ValidationError;
///
/// let workers = DynamicValue::new("workers", 4u32).with_validator(|n: &u32| {
///     if *n == 0 {
///         return Err(ValidationError::custom("must be positive"));
///     }
///     Ok(())
/// });
///
/// workers.set("8").unwrap();
/// assert_eq!(*workers.get(), 8);
///
/// assert!(workers.set("0").is_err());
/// assert_eq!(*workers.get(), 8);
/// ```
pub struct DynamicValue<T> {
    name: String,
    usage: String,
    default: Option<Arc<T>>,
    /// Empty only for a box that was never initialized
    current: ArcSwapOption<T>,
    validator: Option<Validator<T>>,
    notifier: Option<Notifier<T>>,
    notify_mode: NotifyMode,
    normalizer: fn(&str) -> String,
    mutator: Option<Mutator<T>>,
}

impl<T: FlagValue> DynamicValue<T> {
    /// Create a box holding `default`.
    ///
    /// The default is stored as-is; validators added afterwards only apply
    /// to later writes.
    pub fn new(name: impl Into<String>, default: T) -> Self {
        let default = Arc::new(default);
        Self {
            name: name.into(),
            usage: String::new(),
            default: Some(Arc::clone(&default)),
            current: ArcSwapOption::new(Some(default)),
            validator: None,
            notifier: None,
            notify_mode: NotifyMode::Async,
            normalizer: trim_input,
            mutator: None,
        }
    }

    /// Create a box that holds no value yet.
    ///
    /// Reads fall back to `T::default()` until the first successful `set`.
    /// Registries use this to render help text before construction finishes.
    pub fn unset(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            usage: String::new(),
            default: None,
            current: ArcSwapOption::empty(),
            validator: None,
            notifier: None,
            notify_mode: NotifyMode::Async,
            normalizer: trim_input,
            mutator: None,
        }
    }

    /// Attach a usage string shown alongside the flag.
    pub fn with_usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    /// Add a validator that must pass before any new value is stored.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<(), ValidationError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Register the change notifier, called with `(old, new)` after each swap.
    ///
    /// Replaces any previously registered notifier. Runs asynchronously
    /// unless [`NotifyMode::Sync`] is selected.
    pub fn with_notifier<F>(mut self, notifier: F) -> Self
    where
        F: Fn(Arc<T>, Arc<T>) + Send + Sync + 'static,
    {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// Register a notifier that runs before `set` returns.
    pub fn with_sync_notifier<F>(self, notifier: F) -> Self
    where
        F: Fn(Arc<T>, Arc<T>) + Send + Sync + 'static,
    {
        self.with_notifier(notifier).with_notify_mode(NotifyMode::Sync)
    }

    /// Choose how the notifier is invoked.
    pub fn with_notify_mode(mut self, mode: NotifyMode) -> Self {
        self.notify_mode = mode;
        self
    }

    /// Replace the input normalizer (trims whitespace by default).
    pub fn with_normalizer(mut self, normalizer: fn(&str) -> String) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Add a mutator applied to every decoded value before validation.
    pub fn with_mutator<F>(mut self, mutator: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.mutator = Some(Arc::new(mutator));
        self
    }

    /// The flag name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The usage string.
    pub fn usage(&self) -> &str {
        &self.usage
    }

    /// Whether a value has ever been stored.
    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    /// Get a reference-counted handle to the current value.
    ///
    /// This is lock-free and never blocks. A box created with
    /// [`DynamicValue::unset`] reports `T::default()` until its first write.
    pub fn get(&self) -> Arc<T> {
        self.current
            .load_full()
            .unwrap_or_else(|| Arc::new(T::default()))
    }

    /// Parse `raw` and store it if it passes validation.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::Parse`] for malformed input and
    /// [`FlagError::Validation`] when the validator rejects the value. In
    /// both cases the current value is left untouched.
    pub fn set(&self, raw: &str) -> Result<()> {
        let normalized = (self.normalizer)(raw);
        let value = T::parse_flag(&normalized).map_err(|reason| FlagError::parse(&self.name, reason))?;
        self.set_value(value)
    }

    /// Store an already typed value, running the mutator, validator and notifier.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::Validation`] when the validator rejects the value.
    pub fn set_value(&self, value: T) -> Result<()> {
        let value = match &self.mutator {
            Some(mutator) => mutator(value),
            None => value,
        };

        if let Some(validator) = &self.validator {
            validator(&value).map_err(|source| FlagError::Validation {
                flag: self.name.clone(),
                source,
            })?;
        }

        let new = Arc::new(value);
        let old = self.current.swap(Some(Arc::clone(&new)));
        let old = old.unwrap_or_else(|| Arc::new(T::default()));

        if let Some(notifier) = &self.notifier {
            self.dispatch(Arc::clone(notifier), old, new);
        }

        Ok(())
    }

    fn dispatch(&self, notifier: Notifier<T>, old: Arc<T>, new: Arc<T>) {
        match self.notify_mode {
            NotifyMode::Sync => notifier(old, new),
            NotifyMode::Async => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { notifier(old, new) });
                }
                Err(_) => {
                    std::thread::spawn(move || notifier(old, new));
                }
            },
        }
    }

    /// Render the current value in its raw string form.
    pub fn value_string(&self) -> String {
        self.get().render_flag()
    }

    /// Render the declared default, or an empty string for an unset box.
    pub fn default_string(&self) -> String {
        self.default
            .as_ref()
            .map(|d| d.render_flag())
            .unwrap_or_default()
    }
}

impl<T: FlagValue> fmt::Display for DynamicValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value_string())
    }
}

impl<T: FlagValue> fmt::Debug for DynamicValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicValue")
            .field("name", &self.name)
            .field("value", &self.value_string())
            .field("notify_mode", &self.notify_mode)
            .finish()
    }
}
