//! Validation rule compilation and result types

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::checks;
use super::context::{BusinessRule, BusinessRuleRegistry};
use crate::domain::{ConfigurationError, Severity, ValidationKind, ValidationRuleConfig, ValidationStage, ValueType};
use crate::transform::TransformationError;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("valid placeholder regex"));

/// Kind of rule that produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
    Required,
    Length,
    DataType,
    Pattern,
    Email,
    Phone,
    Ssn,
    Numeric,
    DateFormat,
    Range,
    ReferentialIntegrity,
    Uniqueness,
    AccountNumberFormat,
    CustomQuery,
    BusinessRule,
    /// A failed field transformation
    Transformation,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Length => "length",
            Self::DataType => "data-type",
            Self::Pattern => "pattern",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Ssn => "ssn",
            Self::Numeric => "numeric",
            Self::DateFormat => "date-format",
            Self::Range => "range",
            Self::ReferentialIntegrity => "referential-integrity",
            Self::Uniqueness => "uniqueness",
            Self::AccountNumberFormat => "account-number-format",
            Self::CustomQuery => "custom-query",
            Self::BusinessRule => "business-rule",
            Self::Transformation => "transformation",
        }
    }

    /// Record-level rules produce one result per rule, not per field
    pub fn is_multi_field(&self) -> bool {
        matches!(self, Self::Uniqueness | Self::CustomQuery | Self::BusinessRule)
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one rule for one field of one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValidationResult {
    /// Field name (comma-joined for multi-field rules)
    pub field: String,
    /// Rule display name
    pub rule: String,
    pub kind: RuleKind,
    pub passed: bool,
    pub severity: Severity,
    pub message: String,
    /// Raw value that was checked
    pub value: Option<String>,
}

impl FieldValidationResult {
    pub fn pass(rule: &ValidationRule, field: &str, value: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            rule: rule.name.clone(),
            kind: rule.kind,
            passed: true,
            severity: rule.severity,
            message: message.into(),
            value: value.map(str::to_string),
        }
    }

    pub fn fail(rule: &ValidationRule, field: &str, value: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            rule: rule.name.clone(),
            kind: rule.kind,
            passed: false,
            severity: rule.severity,
            message: rule.message.clone().unwrap_or_else(|| message.into()),
            value: value.map(str::to_string),
        }
    }

    /// Error-severity failure for a field that could not be transformed
    pub fn from_transformation(error: &TransformationError) -> Self {
        Self {
            field: error.target().to_string(),
            rule: error.kind().to_string(),
            kind: RuleKind::Transformation,
            passed: false,
            severity: Severity::Error,
            message: error.to_string(),
            value: None,
        }
    }

    pub fn is_error(&self) -> bool {
        !self.passed && self.severity == Severity::Error
    }

    pub fn is_warning(&self) -> bool {
        !self.passed && self.severity == Severity::Warning
    }
}

/// Parsed form of a rule's check
#[derive(Clone)]
pub(crate) enum Check {
    Required,
    /// Checked one field value at a time, blanks skipped
    Field(FieldCheck),
    ReferentialIntegrity { table: String, column: String },
    Uniqueness,
    CustomQuery { query: String, params: Vec<String> },
    BusinessRule(Arc<dyn BusinessRule>),
}

/// Checks that look at a single non-blank value
#[derive(Clone)]
pub(crate) enum FieldCheck {
    Length { min: Option<usize>, max: Option<usize> },
    DataType { value_type: ValueType, format: Option<String> },
    Pattern(Regex),
    Email,
    Phone,
    Ssn,
    Numeric { precision: Option<u32>, scale: Option<u32>, allow_negative: bool },
    DateFormat(String),
    Range { min: Option<Decimal>, max: Option<Decimal> },
    AccountNumber { min_length: usize, max_length: usize, luhn: bool },
}

impl FieldCheck {
    pub(crate) fn check(&self, value: &str) -> Result<(), String> {
        match self {
            Self::Length { min, max } => checks::length(value, *min, *max),
            Self::DataType { value_type, format } => checks::data_type(value, *value_type, format.as_deref()),
            Self::Pattern(regex) => checks::pattern(value, regex),
            Self::Email => checks::email(value),
            Self::Phone => checks::phone(value),
            Self::Ssn => checks::ssn(value),
            Self::Numeric {
                precision,
                scale,
                allow_negative,
            } => checks::numeric(value, *precision, *scale, *allow_negative),
            Self::DateFormat(format) => checks::date_format(value, format),
            Self::Range { min, max } => checks::range(value, *min, *max),
            Self::AccountNumber {
                min_length,
                max_length,
                luhn,
            } => checks::account_number(value, *min_length, *max_length, *luhn),
        }
    }
}

/// A compiled validation rule
#[derive(Clone)]
pub struct ValidationRule {
    /// Position in the configured list, used to scope uniqueness sets
    pub id: usize,
    pub name: String,
    pub kind: RuleKind,
    pub fields: Vec<String>,
    pub severity: Severity,
    pub order: u32,
    pub stage: ValidationStage,
    pub message: Option<String>,
    pub(crate) check: Check,
}

impl std::fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationRule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("fields", &self.fields)
            .field("severity", &self.severity)
            .field("order", &self.order)
            .field("stage", &self.stage)
            .finish()
    }
}

impl ValidationRule {
    /// Compile one configured rule
    pub fn compile(
        id: usize,
        config: &ValidationRuleConfig,
        registry: &BusinessRuleRegistry,
    ) -> Result<Self, ConfigurationError> {
        let kind = kind_of(&config.rule);
        let name = config.name.clone().unwrap_or_else(|| kind.as_str().to_string());
        debug!(%name, %kind, fields = ?config.fields, "ValidationRule::compile: called");

        let fields_required = !matches!(kind, RuleKind::CustomQuery | RuleKind::BusinessRule);
        if fields_required && config.fields.is_empty() {
            return Err(ConfigurationError::MissingFields(name));
        }

        let bad_date_format = |format: &str| {
            ConfigurationError::Invalid(format!("rule {}: invalid date format {}", name, format))
        };

        let check = match &config.rule {
            ValidationKind::Required => Check::Required,
            ValidationKind::Length { min, max } => Check::Field(FieldCheck::Length { min: *min, max: *max }),
            ValidationKind::DataType { value_type, format } => {
                if let Some(format) = format.as_deref().filter(|f| !checks::is_valid_date_format(f)) {
                    return Err(bad_date_format(format));
                }
                Check::Field(FieldCheck::DataType {
                    value_type: *value_type,
                    format: format.clone(),
                })
            }
            ValidationKind::Pattern { pattern } => {
                let anchored = format!("^(?:{})$", pattern);
                Check::Field(FieldCheck::Pattern(Regex::new(&anchored).map_err(|e| {
                    ConfigurationError::InvalidPattern {
                        rule: name.clone(),
                        message: e.to_string(),
                    }
                })?))
            }
            ValidationKind::Email => Check::Field(FieldCheck::Email),
            ValidationKind::Phone => Check::Field(FieldCheck::Phone),
            ValidationKind::Ssn => Check::Field(FieldCheck::Ssn),
            ValidationKind::Numeric {
                precision,
                scale,
                allow_negative,
            } => Check::Field(FieldCheck::Numeric {
                precision: *precision,
                scale: *scale,
                allow_negative: *allow_negative,
            }),
            ValidationKind::DateFormat { format } => {
                if !checks::is_valid_date_format(format) {
                    return Err(bad_date_format(format));
                }
                Check::Field(FieldCheck::DateFormat(format.clone()))
            }
            ValidationKind::Range { min, max } => Check::Field(FieldCheck::Range { min: *min, max: *max }),
            ValidationKind::ReferentialIntegrity { table, column } => Check::ReferentialIntegrity {
                table: table.clone(),
                column: column.clone(),
            },
            ValidationKind::Uniqueness => Check::Uniqueness,
            ValidationKind::AccountNumberFormat {
                min_length,
                max_length,
                luhn,
            } => Check::Field(FieldCheck::AccountNumber {
                min_length: *min_length,
                max_length: *max_length,
                luhn: *luhn,
            }),
            ValidationKind::CustomQuery { query, params } => {
                validate_placeholders(&name, query, params)?;
                Check::CustomQuery {
                    query: query.clone(),
                    params: params.clone(),
                }
            }
            ValidationKind::BusinessRule { rule } => Check::BusinessRule(
                registry
                    .get(rule)
                    .ok_or_else(|| ConfigurationError::UnknownBusinessRule(rule.clone()))?,
            ),
        };

        Ok(Self {
            id,
            name,
            kind,
            fields: config.fields.clone(),
            severity: config.severity,
            order: config.order,
            stage: config.stage,
            message: config.message.clone(),
            check,
        })
    }

    /// Field label for multi-field results
    pub fn joined_fields(&self) -> String {
        self.fields.join(",")
    }
}

fn kind_of(kind: &ValidationKind) -> RuleKind {
    match kind {
        ValidationKind::Required => RuleKind::Required,
        ValidationKind::Length { .. } => RuleKind::Length,
        ValidationKind::DataType { .. } => RuleKind::DataType,
        ValidationKind::Pattern { .. } => RuleKind::Pattern,
        ValidationKind::Email => RuleKind::Email,
        ValidationKind::Phone => RuleKind::Phone,
        ValidationKind::Ssn => RuleKind::Ssn,
        ValidationKind::Numeric { .. } => RuleKind::Numeric,
        ValidationKind::DateFormat { .. } => RuleKind::DateFormat,
        ValidationKind::Range { .. } => RuleKind::Range,
        ValidationKind::ReferentialIntegrity { .. } => RuleKind::ReferentialIntegrity,
        ValidationKind::Uniqueness => RuleKind::Uniqueness,
        ValidationKind::AccountNumberFormat { .. } => RuleKind::AccountNumberFormat,
        ValidationKind::CustomQuery { .. } => RuleKind::CustomQuery,
        ValidationKind::BusinessRule { .. } => RuleKind::BusinessRule,
    }
}

/// Placeholders must be exactly `$1..$n` for `n` params
fn validate_placeholders(rule: &str, query: &str, params: &[String]) -> Result<(), ConfigurationError> {
    let found: BTreeSet<usize> = PLACEHOLDER
        .captures_iter(query)
        .filter_map(|caps| caps[1].parse().ok())
        .collect();
    let expected: BTreeSet<usize> = (1..=params.len()).collect();
    if found != expected {
        return Err(ConfigurationError::InvalidQuery {
            rule: rule.to_string(),
            message: format!(
                "placeholders {:?} do not match {} parameter(s)",
                found.iter().collect::<Vec<_>>(),
                params.len()
            ),
        });
    }
    Ok(())
}

/// Compile and order rules; equal `order` keeps declaration order
pub fn compile_rules(
    configs: &[ValidationRuleConfig],
    registry: &BusinessRuleRegistry,
) -> Result<Vec<ValidationRule>, ConfigurationError> {
    let mut rules = configs
        .iter()
        .enumerate()
        .map(|(id, config)| ValidationRule::compile(id, config, registry))
        .collect::<Result<Vec<_>, _>>()?;
    rules.sort_by_key(|rule| rule.order);
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> ValidationRuleConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_compile_sorts_stably() {
        let configs = vec![
            config("{ name: b, fields: [x], order: 2, rule: { kind: required } }"),
            config("{ name: a, fields: [x], order: 1, rule: { kind: email } }"),
            config("{ name: c, fields: [x], order: 2, rule: { kind: phone } }"),
        ];
        let rules = compile_rules(&configs, &BusinessRuleRegistry::default()).unwrap();
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_default_name_is_kind() {
        let rule = ValidationRule::compile(
            0,
            &config("{ fields: [x], rule: { kind: account-number-format } }"),
            &BusinessRuleRegistry::default(),
        )
        .unwrap();
        assert_eq!(rule.name, "account-number-format");
    }

    #[test]
    fn test_pattern_is_anchored() {
        let rule = ValidationRule::compile(
            0,
            &config(r#"{ fields: [code], rule: { kind: pattern, pattern: "[A-Z]{3}" } }"#),
            &BusinessRuleRegistry::default(),
        )
        .unwrap();
        let Check::Field(check) = &rule.check else {
            panic!("pattern is a field check");
        };
        assert_eq!(check.check("ABC"), Ok(()));
        assert!(check.check("XABCX").is_err());
    }

    #[test]
    fn test_value_checks_compile_to_field_checks() {
        let registry = BusinessRuleRegistry::default();
        for rule in [
            "{ kind: length, max: 3 }",
            "{ kind: data-type, type: integer }",
            "{ kind: email }",
            "{ kind: phone }",
            "{ kind: ssn }",
            "{ kind: numeric }",
            "{ kind: date-format, format: \"%Y-%m-%d\" }",
            "{ kind: range, min: 1 }",
            "{ kind: account-number-format }",
        ] {
            let compiled = ValidationRule::compile(0, &config(&format!("{{ fields: [x], rule: {} }}", rule)), &registry)
                .unwrap();
            let Check::Field(check) = &compiled.check else {
                panic!("{} is not a field check", rule);
            };
            assert!(check.check("not-a-valid-anything").is_err(), "{}", rule);
        }

        for rule in [
            "{ kind: required }",
            "{ kind: uniqueness }",
            "{ kind: referential-integrity, table: DEPARTMENTS, column: DEPT_ID }",
        ] {
            let compiled = ValidationRule::compile(0, &config(&format!("{{ fields: [x], rule: {} }}", rule)), &registry)
                .unwrap();
            assert!(!matches!(compiled.check, Check::Field(_)), "{}", rule);
        }
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = ValidationRule::compile(
            0,
            &config(r#"{ fields: [code], rule: { kind: pattern, pattern: "([A-Z" } }"#),
            &BusinessRuleRegistry::default(),
        );
        assert!(matches!(result, Err(ConfigurationError::InvalidPattern { .. })));
    }

    #[test]
    fn test_missing_fields_rejected() {
        let result = ValidationRule::compile(0, &config("{ rule: { kind: required } }"), &BusinessRuleRegistry::default());
        assert!(matches!(result, Err(ConfigurationError::MissingFields(_))));
    }

    #[test]
    fn test_unknown_business_rule() {
        let result = ValidationRule::compile(
            0,
            &config("{ rule: { kind: business-rule, rule: hire-date-after-birth } }"),
            &BusinessRuleRegistry::default(),
        );
        assert!(matches!(result, Err(ConfigurationError::UnknownBusinessRule(name)) if name == "hire-date-after-birth"));
    }

    #[test]
    fn test_custom_query_placeholders() {
        let ok = config("{ fields: [acct], rule: { kind: custom-query, query: 'open $1 $2', params: [acct, branch] } }");
        assert!(ValidationRule::compile(0, &ok, &BusinessRuleRegistry::default()).is_ok());

        let missing = config("{ fields: [acct], rule: { kind: custom-query, query: 'open $1', params: [acct, branch] } }");
        assert!(matches!(
            ValidationRule::compile(0, &missing, &BusinessRuleRegistry::default()),
            Err(ConfigurationError::InvalidQuery { .. })
        ));

        let gap = config("{ fields: [acct], rule: { kind: custom-query, query: 'open $1 $3', params: [a, b] } }");
        assert!(ValidationRule::compile(0, &gap, &BusinessRuleRegistry::default()).is_err());
    }

    #[test]
    fn test_message_override() {
        let rule = ValidationRule::compile(
            0,
            &config("{ fields: [x], message: 'Bad phone', rule: { kind: phone } }"),
            &BusinessRuleRegistry::default(),
        )
        .unwrap();
        let result = FieldValidationResult::fail(&rule, "x", Some("1"), "default message");
        assert_eq!(result.message, "Bad phone");
        assert!(result.is_error());
    }
}
