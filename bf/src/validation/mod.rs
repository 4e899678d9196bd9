//! Record validation
//!
//! - [`checks`] - pure field-level checks
//! - [`rules`] - rule compilation and result types
//! - [`context`] - per-execution state for record-level rules
//! - [`engine`] - ValidationEngine

pub mod checks;
mod context;
mod engine;
mod rules;

pub use context::{BusinessRule, BusinessRuleRegistry, ReferenceCache, ValidationContext};
pub use engine::ValidationEngine;
pub use rules::{FieldValidationResult, RuleKind, ValidationRule, compile_rules};
