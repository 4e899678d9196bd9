//! JobConfiguration domain types
//!
//! A job configuration is resolved by a `ConfigurationProvider` and stays
//! immutable for the lifetime of one execution. It names the source layout,
//! the target table, the ordered field mappings and validation rules, the
//! threshold policy and the loader template.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::ConfigurationError;
use crate::retry::RetrySettings;

fn default_true() -> bool {
    true
}

/// Complete description of one load job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobConfiguration {
    /// Stable job identifier (also the config file stem)
    pub job_id: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Input file layout
    #[serde(default)]
    pub source: SourceSpec,

    /// Target table and output record format
    pub target: TargetSpec,

    /// Ordered field mappings, one per target field
    pub mappings: Vec<FieldMapping>,

    /// Ordered validation rules
    #[serde(default)]
    pub validations: Vec<ValidationRuleConfig>,

    #[serde(default)]
    pub threshold: ThresholdPolicy,

    #[serde(default)]
    pub loader: LoaderTemplateRef,

    #[serde(default)]
    pub reconciliation: ReconciliationPolicy,
}

impl JobConfiguration {
    /// Parse a job configuration from YAML text
    pub fn from_yaml(text: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_yaml::from_str(text)?;
        debug!(job_id = %config.job_id, mappings = config.mappings.len(), "JobConfiguration::from_yaml: parsed");
        Ok(config)
    }

    /// Load a job configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Resolve the output position of every mapping
    ///
    /// Positions are either all implicit (assigned 1..n in declaration
    /// order) or all explicit and unique. Returns `(mapping index, position)`
    /// sorted by position.
    pub fn resolve_positions(&self) -> Result<Vec<(usize, u32)>, ConfigurationError> {
        debug!(job_id = %self.job_id, "JobConfiguration::resolve_positions: called");
        let mut seen_targets = HashSet::new();
        for mapping in &self.mappings {
            if mapping.target.trim().is_empty() {
                return Err(ConfigurationError::Invalid("mapping with empty target name".to_string()));
            }
            if !seen_targets.insert(mapping.target.as_str()) {
                return Err(ConfigurationError::DuplicateTarget(mapping.target.clone()));
            }
        }

        let explicit = self.mappings.iter().filter(|m| m.position.is_some()).count();
        if explicit == 0 {
            return Ok((0..self.mappings.len()).map(|i| (i, i as u32 + 1)).collect());
        }
        if explicit != self.mappings.len() {
            return Err(ConfigurationError::MixedPositions);
        }

        let mut by_position: HashMap<u32, &str> = HashMap::new();
        let mut positions = Vec::with_capacity(self.mappings.len());
        for (index, mapping) in self.mappings.iter().enumerate() {
            let position = mapping.position.unwrap_or_default();
            if position == 0 {
                return Err(ConfigurationError::InvalidPosition {
                    target: mapping.target.clone(),
                    reason: "positions start at 1".to_string(),
                });
            }
            if let Some(other) = by_position.insert(position, &mapping.target) {
                return Err(ConfigurationError::InvalidPosition {
                    target: mapping.target.clone(),
                    reason: format!("position {} already used by {}", position, other),
                });
            }
            positions.push((index, position));
        }
        positions.sort_by_key(|(_, position)| *position);
        Ok(positions)
    }
}

/// Input file layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SourceSpec {
    /// Field delimiter
    pub delimiter: char,

    /// Quote character
    pub quote: char,

    /// Whether the first line holds column names
    pub has_header: bool,

    /// Column names when the file has no header
    pub columns: Vec<String>,

    /// Trim whitespace around values
    pub trim: bool,

    /// Glob used to discover input files in the input directory
    pub file_pattern: String,
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            has_header: true,
            columns: Vec::new(),
            trim: true,
            file_pattern: "*".to_string(),
        }
    }
}

/// Target table description
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetSpec {
    /// Target table name
    pub table: String,

    #[serde(default)]
    pub load_mode: LoadMode,

    /// Layout of the data file handed to the loader
    #[serde(default)]
    pub record_format: RecordFormat,

    /// Field delimiter for delimited output
    #[serde(default = "default_target_delimiter")]
    pub delimiter: char,
}

fn default_target_delimiter() -> char {
    '|'
}

/// How the loader treats existing rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadMode {
    #[default]
    Append,
    Insert,
    Replace,
    Truncate,
}

impl LoadMode {
    /// Keyword used in control files
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Append => "APPEND",
            Self::Insert => "INSERT",
            Self::Replace => "REPLACE",
            Self::Truncate => "TRUNCATE",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_uppercase().as_str() {
            "APPEND" => Some(Self::Append),
            "INSERT" => Some(Self::Insert),
            "REPLACE" => Some(Self::Replace),
            "TRUNCATE" => Some(Self::Truncate),
            _ => None,
        }
    }
}

/// Layout of the loader data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordFormat {
    #[default]
    Delimited,
    FixedWidth,
}

/// One target field and the rule that produces it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FieldMapping {
    /// Target field name
    pub target: String,

    /// Explicit 1-based output position
    #[serde(default)]
    pub position: Option<u32>,

    #[serde(default)]
    pub format: FieldFormat,

    /// Value used when the source is absent or nothing matched
    #[serde(default)]
    pub default: Option<String>,

    pub rule: FieldMappingRule,
}

/// Transformation rule for one target field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum FieldMappingRule {
    /// Copy a source field
    Source { source_field: String },

    /// Literal value
    Constant { value: String },

    /// Join several source fields
    Composite {
        source_fields: Vec<String>,
        #[serde(default)]
        delimiter: String,
    },

    /// First matching predicate wins
    Conditional {
        branches: Vec<ConditionalBranch>,
        #[serde(default)]
        else_value: Option<String>,
    },

    /// Key/value lookup through the lookup provider
    Lookup {
        source_field: String,
        lookup_table: String,
        #[serde(default = "default_true")]
        cacheable: bool,
    },

    /// Restricted formula over record fields
    Expression { formula: String },
}

impl FieldMappingRule {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Source { .. } => "source",
            Self::Constant { .. } => "constant",
            Self::Composite { .. } => "composite",
            Self::Conditional { .. } => "conditional",
            Self::Lookup { .. } => "lookup",
            Self::Expression { .. } => "expression",
        }
    }
}

/// One `when -> then` arm of a conditional rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalBranch {
    /// Predicate in the expression language
    pub when: String,

    /// Value produced when the predicate holds
    pub then: String,
}

/// Declared format of a target field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FieldFormat {
    #[serde(rename = "type")]
    pub data_type: DataType,

    /// Maximum rendered width
    pub length: Option<u32>,

    /// Decimal places for decimal fields
    pub scale: u32,

    /// Drop the decimal point (`123.45` -> `12345`)
    pub implied_decimal: bool,

    pub sign: SignConvention,

    /// Parse format for date inputs (chrono strftime)
    pub input_format: Option<String>,

    /// Render format for dates (chrono strftime)
    pub output_format: Option<String>,
}

impl Default for FieldFormat {
    fn default() -> Self {
        Self {
            data_type: DataType::Char,
            length: None,
            scale: 0,
            implied_decimal: false,
            sign: SignConvention::Leading,
            input_format: None,
            output_format: None,
        }
    }
}

impl FieldFormat {
    pub const DEFAULT_DATE_FORMAT: &'static str = "%Y-%m-%d";

    /// Declared length or the type's default width
    pub fn effective_length(&self) -> u32 {
        self.length.unwrap_or(match self.data_type {
            DataType::Char => 255,
            DataType::Integer => 19,
            DataType::Decimal => 38,
            DataType::Date => 10,
        })
    }

    pub fn input_date_format(&self) -> &str {
        self.input_format.as_deref().unwrap_or(Self::DEFAULT_DATE_FORMAT)
    }

    pub fn output_date_format(&self) -> &str {
        self.output_format
            .as_deref()
            .or(self.input_format.as_deref())
            .unwrap_or(Self::DEFAULT_DATE_FORMAT)
    }
}

/// Target field data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    #[default]
    Char,
    Integer,
    Decimal,
    Date,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Decimal)
    }
}

/// Where the sign of a negative number goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignConvention {
    /// `-123`
    #[default]
    Leading,
    /// `123-`
    Trailing,
    /// Unsigned field; negative values are rejected
    None,
}

/// Validation severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// Whether a rule reads source or transformed fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStage {
    #[default]
    Pre,
    Post,
}

/// One configured validation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ValidationRuleConfig {
    /// Display name (defaults to the kind)
    #[serde(default)]
    pub name: Option<String>,

    /// Fields the rule applies to
    #[serde(default)]
    pub fields: Vec<String>,

    #[serde(default)]
    pub severity: Severity,

    /// Execution order; ties keep declaration order
    #[serde(default)]
    pub order: u32,

    #[serde(default)]
    pub stage: ValidationStage,

    /// Failure message override
    #[serde(default)]
    pub message: Option<String>,

    pub rule: ValidationKind,
}

/// The fifteen validation kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum ValidationKind {
    Required,
    Length {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    DataType {
        #[serde(rename = "type")]
        value_type: ValueType,
        #[serde(default)]
        format: Option<String>,
    },
    Pattern {
        pattern: String,
    },
    Email,
    Phone,
    Ssn,
    Numeric {
        #[serde(default)]
        precision: Option<u32>,
        #[serde(default)]
        scale: Option<u32>,
        #[serde(default = "default_true")]
        allow_negative: bool,
    },
    DateFormat {
        format: String,
    },
    Range {
        #[serde(default)]
        min: Option<Decimal>,
        #[serde(default)]
        max: Option<Decimal>,
    },
    ReferentialIntegrity {
        table: String,
        column: String,
    },
    Uniqueness,
    AccountNumberFormat {
        #[serde(default = "default_account_min")]
        min_length: usize,
        #[serde(default = "default_account_max")]
        max_length: usize,
        #[serde(default)]
        luhn: bool,
    },
    CustomQuery {
        /// Parameterized predicate (`$1`, `$2`, ... placeholders)
        query: String,
        /// Fields bound to the placeholders, in order
        #[serde(default)]
        params: Vec<String>,
    },
    BusinessRule {
        rule: String,
    },
}

fn default_account_min() -> usize {
    6
}

fn default_account_max() -> usize {
    17
}

/// Value types checked by the data-type rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueType {
    Integer,
    Decimal,
    Boolean,
    Date,
    Alpha,
    Alphanumeric,
}

/// Error-threshold policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ThresholdPolicy {
    /// Breach when errors reach this count
    pub max_errors: Option<u64>,

    /// Breach when warnings reach this count
    pub max_warnings: Option<u64>,

    /// Breach when errors / records processed exceeds this ratio
    pub max_error_rate: Option<f64>,

    pub action: BreachAction,

    /// Retry schedule for `retry-with-delay`
    pub retry: RetrySettings,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            max_errors: None,
            max_warnings: None,
            max_error_rate: None,
            action: BreachAction::Stop,
            retry: RetrySettings::default(),
        }
    }
}

/// Action taken when a threshold is crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreachAction {
    Continue,
    #[default]
    Stop,
    AlertOnly,
    RetryWithDelay,
}

/// Named loader template plus loader options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoaderTemplateRef {
    pub template: String,
    pub options: LoaderOptions,
}

impl Default for LoaderTemplateRef {
    fn default() -> Self {
        Self {
            template: "sqlldr".to_string(),
            options: LoaderOptions::default(),
        }
    }
}

/// Loader tuning options rendered into the control file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoaderOptions {
    /// Parallel degree
    pub parallel: u32,

    pub direct_path: bool,

    /// Rows per bind array
    pub bind_array_size: u32,

    /// Loader-side reject limit
    pub max_errors: u64,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            parallel: 1,
            direct_path: false,
            bind_array_size: 5000,
            max_errors: 50,
        }
    }
}

/// Tolerance when reconciling expected and loaded counts
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReconciliationPolicy {
    /// Absolute tolerance in records
    pub tolerance_records: u64,

    /// Relative tolerance as a fraction of expected records
    pub tolerance_ratio: f64,
}

impl ReconciliationPolicy {
    /// Allowed difference for the given expected count
    pub fn allowed_difference(&self, expected: u64) -> u64 {
        let ratio = (expected as f64 * self.tolerance_ratio.max(0.0)).ceil() as u64;
        self.tolerance_records.max(ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
job-id: employees
source:
  delimiter: ","
  has-header: true
target:
  table: EMPLOYEES
  record-format: fixed-width
mappings:
  - target: full_name
    format: { type: char, length: 40 }
    rule: { kind: composite, source-fields: [first, last], delimiter: " " }
  - target: emp_status
    format: { type: char, length: 8 }
    rule:
      kind: conditional
      branches:
        - { when: 'status == "A"', then: ACTIVE }
      else-value: INACTIVE
  - target: salary
    format: { type: decimal, length: 10, scale: 2, implied-decimal: true }
    rule: { kind: expression, formula: "base * 1.1" }
validations:
  - fields: [first]
    rule: { kind: required }
  - fields: [salary]
    severity: warning
    order: 2
    stage: post
    rule: { kind: range, min: 0, max: 1000000 }
threshold:
  max-error-rate: 0.05
  action: retry-with-delay
  retry: { max-retries: 2 }
"#;

    #[test]
    fn test_parse_sample() {
        let config = JobConfiguration::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.job_id, "employees");
        assert_eq!(config.target.record_format, RecordFormat::FixedWidth);
        assert_eq!(config.target.delimiter, '|');
        assert_eq!(config.mappings.len(), 3);
        assert_eq!(
            config.mappings[0].rule,
            FieldMappingRule::Composite {
                source_fields: vec!["first".to_string(), "last".to_string()],
                delimiter: " ".to_string(),
            }
        );
        assert_eq!(config.mappings[2].format.data_type, DataType::Decimal);
        assert!(config.mappings[2].format.implied_decimal);
        assert_eq!(config.validations[1].severity, Severity::Warning);
        assert_eq!(config.validations[1].stage, ValidationStage::Post);
        assert_eq!(
            config.validations[1].rule,
            ValidationKind::Range {
                min: Some(Decimal::ZERO),
                max: Some(Decimal::from(1_000_000)),
            }
        );
        assert_eq!(config.threshold.action, BreachAction::RetryWithDelay);
        assert_eq!(config.threshold.retry.max_retries, 2);
        assert_eq!(config.loader.template, "sqlldr");
    }

    #[test]
    fn test_implicit_positions() {
        let config = JobConfiguration::from_yaml(SAMPLE).unwrap();
        let positions = config.resolve_positions().unwrap();
        assert_eq!(positions, vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_explicit_positions_sorted() {
        let mut config = JobConfiguration::from_yaml(SAMPLE).unwrap();
        config.mappings[0].position = Some(3);
        config.mappings[1].position = Some(1);
        config.mappings[2].position = Some(7);
        let positions = config.resolve_positions().unwrap();
        assert_eq!(positions, vec![(1, 1), (0, 3), (2, 7)]);
    }

    #[test]
    fn test_duplicate_positions_rejected() {
        let mut config = JobConfiguration::from_yaml(SAMPLE).unwrap();
        config.mappings[0].position = Some(1);
        config.mappings[1].position = Some(1);
        config.mappings[2].position = Some(2);
        assert!(matches!(
            config.resolve_positions(),
            Err(ConfigurationError::InvalidPosition { .. })
        ));
    }

    #[test]
    fn test_mixed_positions_rejected() {
        let mut config = JobConfiguration::from_yaml(SAMPLE).unwrap();
        config.mappings[0].position = Some(1);
        assert!(matches!(config.resolve_positions(), Err(ConfigurationError::MixedPositions)));
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let mut config = JobConfiguration::from_yaml(SAMPLE).unwrap();
        config.mappings[1].target = "full_name".to_string();
        assert!(matches!(
            config.resolve_positions(),
            Err(ConfigurationError::DuplicateTarget(name)) if name == "full_name"
        ));
    }

    #[test]
    fn test_effective_length_defaults() {
        let format = FieldFormat::default();
        assert_eq!(format.effective_length(), 255);
        let date = FieldFormat {
            data_type: DataType::Date,
            ..Default::default()
        };
        assert_eq!(date.effective_length(), 10);
        assert_eq!(date.output_date_format(), "%Y-%m-%d");
    }

    #[test]
    fn test_allowed_difference() {
        let policy = ReconciliationPolicy {
            tolerance_records: 2,
            tolerance_ratio: 0.01,
        };
        assert_eq!(policy.allowed_difference(100), 2);
        assert_eq!(policy.allowed_difference(1000), 10);
        assert_eq!(ReconciliationPolicy::default().allowed_difference(1000), 0);
    }

    #[test]
    fn test_load_mode_keywords() {
        assert_eq!(LoadMode::Truncate.keyword(), "TRUNCATE");
        assert_eq!(LoadMode::from_keyword("append"), Some(LoadMode::Append));
        assert_eq!(LoadMode::from_keyword("merge"), None);
    }
}
