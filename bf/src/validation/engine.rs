//! ValidationEngine

use std::sync::Arc;

use tracing::{debug, warn};

use super::context::ValidationContext;
use super::rules::{Check, FieldValidationResult, ValidationRule};
use crate::domain::Record;

const SKIPPED_BLANK: &str = "skipped: blank value";

fn blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

/// Runs compiled rules against records
///
/// Rules run strictly in the given order and never see each other's results.
/// Every rule yields exactly one result per applicable field (one result per
/// rule for multi-field record-level rules), pass or fail.
#[derive(Clone)]
pub struct ValidationEngine {
    context: Arc<ValidationContext>,
}

impl ValidationEngine {
    pub fn new(context: Arc<ValidationContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<ValidationContext> {
        &self.context
    }

    /// Validate one record
    pub async fn validate(&self, record: &Record, rules: &[ValidationRule]) -> Vec<FieldValidationResult> {
        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            self.apply(rule, record, &mut results).await;
        }
        debug!(line = record.line, results = results.len(), "ValidationEngine::validate: done");
        results
    }

    async fn apply(&self, rule: &ValidationRule, record: &Record, out: &mut Vec<FieldValidationResult>) {
        match &rule.check {
            Check::Required => {
                for field in &rule.fields {
                    let value = record.get(field);
                    out.push(if blank(value) {
                        FieldValidationResult::fail(rule, field, value, format!("{} is required", field))
                    } else {
                        FieldValidationResult::pass(rule, field, value, "present")
                    });
                }
            }
            Check::ReferentialIntegrity { table, column } => {
                for field in &rule.fields {
                    let value = record.get(field);
                    let Some(v) = value.filter(|v| !v.trim().is_empty()) else {
                        out.push(FieldValidationResult::pass(rule, field, value, SKIPPED_BLANK));
                        continue;
                    };
                    let result = match self.context.references().contains(table, column, v.trim()).await {
                        Ok(true) => FieldValidationResult::pass(rule, field, value, "reference exists"),
                        Ok(false) => FieldValidationResult::fail(
                            rule,
                            field,
                            value,
                            format!("'{}' not found in {}.{}", v, table, column),
                        ),
                        Err(e) => {
                            warn!(rule = %rule.name, error = %e, "Reference lookup failed");
                            FieldValidationResult::fail(rule, field, value, format!("reference lookup failed: {}", e))
                        }
                    };
                    out.push(result);
                }
            }
            Check::Uniqueness => {
                let label = rule.joined_fields();
                let values: Vec<String> = rule
                    .fields
                    .iter()
                    .map(|field| record.get(field).unwrap_or_default().to_string())
                    .collect();
                let display = values.join(",");
                if values.iter().all(|v| v.trim().is_empty()) {
                    out.push(FieldValidationResult::pass(rule, &label, Some(&display), SKIPPED_BLANK));
                } else if self.context.first_occurrence(rule.id, values) {
                    out.push(FieldValidationResult::pass(rule, &label, Some(&display), "unique"));
                } else {
                    out.push(FieldValidationResult::fail(
                        rule,
                        &label,
                        Some(&display),
                        format!("duplicate value '{}' for {}", display, label),
                    ));
                }
            }
            Check::CustomQuery { query, params } => {
                let label = rule.joined_fields();
                let bindings: Vec<String> = params
                    .iter()
                    .map(|field| record.get(field).unwrap_or_default().to_string())
                    .collect();
                let display = bindings.join(",");
                let result = match self.context.queries().evaluate(query, &bindings).await {
                    Ok(true) => FieldValidationResult::pass(rule, &label, Some(&display), "query satisfied"),
                    Ok(false) => FieldValidationResult::fail(rule, &label, Some(&display), "query not satisfied"),
                    Err(e) => {
                        warn!(rule = %rule.name, error = %e, "Custom query failed");
                        FieldValidationResult::fail(rule, &label, Some(&display), format!("query failed: {}", e))
                    }
                };
                out.push(result);
            }
            Check::BusinessRule(predicate) => {
                let label = rule.joined_fields();
                let result = match predicate.check(record).await {
                    Ok(true) => FieldValidationResult::pass(rule, &label, None, "rule satisfied"),
                    Ok(false) => {
                        FieldValidationResult::fail(rule, &label, None, format!("business rule {} failed", rule.name))
                    }
                    Err(e) => FieldValidationResult::fail(rule, &label, None, format!("business rule error: {}", e)),
                };
                out.push(result);
            }
            Check::Field(check) => {
                for field in &rule.fields {
                    let value = record.get(field);
                    let result = match value.filter(|v| !v.trim().is_empty()) {
                        None => FieldValidationResult::pass(rule, field, value, SKIPPED_BLANK),
                        Some(v) => match check.check(v) {
                            Ok(()) => FieldValidationResult::pass(rule, field, value, "ok"),
                            Err(message) => FieldValidationResult::fail(rule, field, value, message),
                        },
                    };
                    out.push(result);
                }
            }
        }
    }
}
