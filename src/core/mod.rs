//! Core flag types: typed value boxes and the registry that owns them.

mod dynamic;
mod registry;
mod validation;
mod value;

pub use dynamic::{DynamicValue, NotifyMode};
pub use registry::{Flag, FlagInfo, FlagRegistry, FlagSet};
pub use validation::Validate;
#[cfg(feature = "json")]
pub use value::Json;
pub use value::FlagValue;
