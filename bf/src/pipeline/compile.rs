//! Job compilation
//!
//! Turns a `JobConfiguration` into the immutable, pre-parsed form the
//! orchestrator runs: position-ordered mappings and rules split by stage.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::domain::{ConfigurationError, DataType, JobConfiguration, RecordFormat, ValidationStage};
use crate::loader::ControlRenderer;
use crate::loader::control::mask_round_trips;
use crate::transform::CompiledMapping;
use crate::validation::{BusinessRuleRegistry, ValidationRule, checks, compile_rules};

/// Largest scale a decimal value can carry
const MAX_SCALE: u32 = 28;

/// Column names the loader control file can carry
static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Table names, optionally schema-qualified
static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$#]*(\.[A-Za-z_][A-Za-z0-9_$#]*)?$").expect("valid table regex")
});

/// A job configuration with every mapping and rule compiled
#[derive(Debug, Clone)]
pub struct CompiledJob {
    pub config: Arc<JobConfiguration>,
    /// Mappings sorted by output position
    pub mappings: Vec<CompiledMapping>,
    /// Rules over source fields
    pub pre_rules: Vec<ValidationRule>,
    /// Rules over transformed fields
    pub post_rules: Vec<ValidationRule>,
}

impl CompiledJob {
    pub fn job_id(&self) -> &str {
        &self.config.job_id
    }

    /// Fail unless the job's loader template can be resolved
    pub fn check_template(&self, renderer: &ControlRenderer) -> Result<(), ConfigurationError> {
        let name = &self.config.loader.template;
        if renderer.has_template(name) {
            Ok(())
        } else {
            Err(ConfigurationError::Template(format!("unknown loader template: {}", name)))
        }
    }
}

impl JobConfiguration {
    /// Validate and compile the configuration
    ///
    /// Every error here is a `ConfigurationError`: the job never starts.
    pub fn compile(&self, registry: &BusinessRuleRegistry) -> Result<CompiledJob, ConfigurationError> {
        debug!(job_id = %self.job_id, "JobConfiguration::compile: called");
        if self.job_id.trim().is_empty() {
            return Err(ConfigurationError::Invalid("job-id must not be empty".to_string()));
        }
        if self.target.table.trim().is_empty() {
            return Err(ConfigurationError::Invalid("target table must not be empty".to_string()));
        }
        if !TABLE_RE.is_match(&self.target.table) {
            return Err(ConfigurationError::Invalid(format!(
                "target table '{}' is not a valid table name",
                self.target.table
            )));
        }
        if self.mappings.is_empty() {
            return Err(ConfigurationError::Invalid("job has no field mappings".to_string()));
        }
        for (name, c) in [
            ("source delimiter", self.source.delimiter),
            ("source quote", self.source.quote),
            ("target delimiter", self.target.delimiter),
        ] {
            if !c.is_ascii() {
                return Err(ConfigurationError::Invalid(format!("{} must be a single-byte character", name)));
            }
        }
        if let Some(rate) = self.threshold.max_error_rate
            && !(0.0..=1.0).contains(&rate)
        {
            return Err(ConfigurationError::Invalid(format!("max-error-rate {} is not within 0..1", rate)));
        }
        if self.reconciliation.tolerance_ratio < 0.0 {
            return Err(ConfigurationError::Invalid("tolerance-ratio must not be negative".to_string()));
        }

        let fixed = self.target.record_format == RecordFormat::FixedWidth;
        let mut mappings = Vec::with_capacity(self.mappings.len());
        for (index, position) in self.resolve_positions()? {
            let mapping = &self.mappings[index];
            let format = &mapping.format;
            if !IDENTIFIER_RE.is_match(&mapping.target) {
                return Err(ConfigurationError::InvalidFormat {
                    target: mapping.target.clone(),
                    message: "target is not a loader column name".to_string(),
                });
            }
            if fixed && format.length.is_none() {
                return Err(ConfigurationError::MissingLength(mapping.target.clone()));
            }
            if format.length == Some(0) {
                return Err(ConfigurationError::InvalidFormat {
                    target: mapping.target.clone(),
                    message: "length must be positive".to_string(),
                });
            }
            if format.data_type == DataType::Decimal && format.scale > MAX_SCALE {
                return Err(ConfigurationError::InvalidFormat {
                    target: mapping.target.clone(),
                    message: format!("scale {} exceeds {}", format.scale, MAX_SCALE),
                });
            }
            for date_format in [format.input_format.as_deref(), format.output_format.as_deref()]
                .into_iter()
                .flatten()
            {
                if !checks::is_valid_date_format(date_format) {
                    return Err(ConfigurationError::InvalidFormat {
                        target: mapping.target.clone(),
                        message: format!("invalid date format {}", date_format),
                    });
                }
            }
            if format.data_type == DataType::Date && !mask_round_trips(format.output_date_format()) {
                return Err(ConfigurationError::InvalidFormat {
                    target: mapping.target.clone(),
                    message: format!("date format {} has no unambiguous loader mask", format.output_date_format()),
                });
            }
            mappings.push(CompiledMapping::compile(mapping, position)?);
        }

        let (pre_rules, post_rules): (Vec<_>, Vec<_>) = compile_rules(&self.validations, registry)?
            .into_iter()
            .partition(|rule| rule.stage == ValidationStage::Pre);

        debug!(
            job_id = %self.job_id,
            mappings = mappings.len(),
            pre = pre_rules.len(),
            post = post_rules.len(),
            "JobConfiguration::compile: done"
        );
        Ok(CompiledJob {
            config: Arc::new(self.clone()),
            mappings,
            pre_rules,
            post_rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"
job-id: employees
source:
  columns: [first, last, status]
  has-header: false
target:
  table: EMPLOYEES
mappings:
  - target: emp_status
    position: 2
    rule: { kind: constant, value: A }
  - target: full_name
    position: 1
    rule: { kind: composite, source-fields: [first, last], delimiter: " " }
validations:
  - fields: [first]
    rule: { kind: required }
  - fields: [full_name]
    stage: post
    rule: { kind: length, max: 40 }
"#;

    fn job(yaml: &str) -> JobConfiguration {
        JobConfiguration::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_compile_orders_and_splits() {
        let compiled = job(JOB).compile(&BusinessRuleRegistry::default()).unwrap();
        let targets: Vec<_> = compiled.mappings.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(targets, vec!["full_name", "emp_status"]);
        assert_eq!(compiled.pre_rules.len(), 1);
        assert_eq!(compiled.post_rules.len(), 1);
        assert_eq!(compiled.post_rules[0].fields, vec!["full_name".to_string()]);
        assert_eq!(compiled.job_id(), "employees");
    }

    #[test]
    fn test_fixed_width_requires_length() {
        let yaml = JOB.replace("  table: EMPLOYEES", "  table: EMPLOYEES\n  record-format: fixed-width");
        let err = job(&yaml).compile(&BusinessRuleRegistry::default()).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingLength(ref t) if t == "emp_status" || t == "full_name"));
    }

    #[test]
    fn test_invalid_date_format() {
        let yaml = JOB.replace(
            "    position: 2\n",
            "    position: 2\n    format: { type: date, output-format: \"%Q\" }\n",
        );
        let err = job(&yaml).compile(&BusinessRuleRegistry::default()).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidFormat { .. }));
    }

    #[test]
    fn test_target_must_be_loader_column() {
        for target in ["emp-status", "full name", "1st", "status;"] {
            let yaml = JOB.replace("target: emp_status", &format!("target: \"{}\"", target));
            let err = job(&yaml).compile(&BusinessRuleRegistry::default()).unwrap_err();
            assert!(
                matches!(err, ConfigurationError::InvalidFormat { target: ref t, .. } if t == target),
                "{}: {:?}",
                target,
                err
            );
        }
    }

    #[test]
    fn test_table_name() {
        let yaml = JOB.replace("table: EMPLOYEES", "table: HR.EMPLOYEES");
        assert!(job(&yaml).compile(&BusinessRuleRegistry::default()).is_ok());

        for table in ["\"HR EMPLOYEES\"", "EMP-LOYEES", "HR.", "A.B.C"] {
            let yaml = JOB.replace("table: EMPLOYEES", &format!("table: {}", table));
            let err = job(&yaml).compile(&BusinessRuleRegistry::default()).unwrap_err();
            assert!(matches!(err, ConfigurationError::Invalid(_)), "{}", table);
        }
    }

    #[test]
    fn test_compiled_job_round_trips_control_file() {
        use crate::domain::CorrelationId;
        use crate::loader::{ArtifactPaths, ControlSpecification};

        let compiled = job(JOB).compile(&BusinessRuleRegistry::default()).unwrap();
        let id = CorrelationId::from("employees-0001");
        let spec = ControlSpecification::build(
            &compiled.config,
            &compiled.mappings,
            &id,
            ArtifactPaths::in_dir(std::path::Path::new("/tmp/bf"), &id),
        );
        let text = ControlRenderer::embedded_only().render("sqlldr", &spec).unwrap();
        let parsed = ControlSpecification::parse(&text).unwrap();
        let names: Vec<_> = parsed.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["full_name", "emp_status"]);
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_ambiguous_date_mask() {
        let yaml = JOB.replace(
            "    position: 2\n",
            "    position: 2\n    format: { type: date, output-format: \"%d%j\" }\n",
        );
        let err = job(&yaml).compile(&BusinessRuleRegistry::default()).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidFormat { ref message, .. } if message.contains("%d%j")));

        let yaml = JOB.replace(
            "    position: 2\n",
            "    position: 2\n    format: { type: date, output-format: \"%d-%j\" }\n",
        );
        assert!(job(&yaml).compile(&BusinessRuleRegistry::default()).is_ok());
    }

    #[test]
    fn test_unknown_business_rule() {
        let yaml = format!("{}  - rule: {{ kind: business-rule, rule: hire-after-birth }}\n", JOB);
        let err = job(&yaml).compile(&BusinessRuleRegistry::default()).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownBusinessRule(_)));
    }

    #[test]
    fn test_rate_out_of_range() {
        let yaml = format!("{}threshold:\n  max-error-rate: 1.5\n", JOB);
        assert!(job(&yaml).compile(&BusinessRuleRegistry::default()).is_err());
    }

    #[test]
    fn test_check_template() {
        let compiled = job(JOB).compile(&BusinessRuleRegistry::default()).unwrap();
        let renderer = ControlRenderer::embedded_only();
        assert!(compiled.check_template(&renderer).is_ok());

        let yaml = format!("{}loader:\n  template: missing\n", JOB);
        let compiled = job(&yaml).compile(&BusinessRuleRegistry::default()).unwrap();
        assert!(matches!(
            compiled.check_template(&renderer),
            Err(ConfigurationError::Template(_))
        ));
    }
}
