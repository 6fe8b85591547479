//! Trait-based validation for flag values.

use crate::core::{DynamicValue, FlagValue};
use crate::error::ValidationError;

/// Trait for values that know how to validate themselves.
///
/// Implement this on structured flag types and attach it with
/// [`DynamicValue::with_validate`] instead of writing a closure.
///
/// # Examples
///
/// ```rust
/// use hotswap_flags::core::{DynamicValue, Json, Validate};
/// use hotswap_flags::error::ValidationError;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Clone, Serialize, Deserialize)]
/// struct Pool {
///     min: u32,
///     max: u32,
/// }
///
/// impl Validate for Pool {
///     fn validate(&self) -> Result<(), ValidationError> {
///         if self.min > self.max {
///             return Err(ValidationError::invalid_field("min", "must not exceed max"));
///         }
///         Ok(())
///     }
/// }
///
/// let pool = DynamicValue::new("pool", Json(Pool { min: 1, max: 4 })).with_validate();
/// assert!(pool.set(r#"{"min": 9, "max": 2}"#).is_err());
/// assert_eq!(pool.get().max, 4);
/// ```
pub trait Validate {
    /// Validate the value.
    ///
    /// # Errors
    ///
    /// Should return a `ValidationError` describing what validation failed.
    fn validate(&self) -> Result<(), ValidationError>;
}

#[cfg(feature = "json")]
impl<T: Validate> Validate for crate::core::Json<T> {
    fn validate(&self) -> Result<(), ValidationError> {
        self.0.validate()
    }
}

impl<T: FlagValue + Validate> DynamicValue<T> {
    /// Use the value's own [`Validate`] implementation as the validator.
    pub fn with_validate(self) -> Self {
        self.with_validator(|value: &T| value.validate())
    }
}
