//! Field transformation
//!
//! - [`engine`] - TransformationEngine and compiled mapping rules
//! - [`expr`] - restricted expression language for formulas and predicates
//! - [`format`] - target field formatting and fixed-width padding
//! - [`lookup`] - concurrent lookup cache

mod engine;
mod error;
pub mod expr;
pub mod format;
mod lookup;

pub use engine::{CompiledMapping, CompiledRule, ConditionalArm, Predicate, TransformationEngine};
pub use error::TransformationError;
pub use expr::{ExprError, Expression, Value};
pub use format::{FormatError, format_value, pad_fixed};
pub use lookup::{CacheStats, LookupCache};
