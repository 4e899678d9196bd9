//! TransformationEngine
//!
//! Evaluates compiled field-mapping rules against source records. Every rule
//! resolves to exactly one value or a typed [`TransformationError`]; the only
//! side effect is populating the lookup cache.

use std::fmt::Debug;
use std::sync::Arc;

use tracing::debug;

use super::error::TransformationError;
use super::expr::{ExprError, Expression, Value};
use super::format::{FormatError, format_value};
use super::lookup::LookupCache;
use crate::domain::{ConfigurationError, FieldFormat, FieldMapping, FieldMappingRule, Record};
use crate::providers::LookupProvider;

/// A boolean test over a source record
pub trait Predicate: Send + Sync + Debug {
    fn test(&self, record: &Record) -> Result<bool, ExprError>;
}

impl Predicate for Expression {
    fn test(&self, record: &Record) -> Result<bool, ExprError> {
        Expression::test(self, record)
    }
}

/// One `when -> then` arm with its parsed predicate
#[derive(Debug, Clone)]
pub struct ConditionalArm {
    pub predicate: Arc<dyn Predicate>,
    pub value: String,
}

/// Field-mapping rule with predicates and formulas parsed
#[derive(Debug, Clone)]
pub enum CompiledRule {
    Source {
        field: String,
    },
    Constant {
        value: String,
    },
    Composite {
        fields: Vec<String>,
        delimiter: String,
    },
    Conditional {
        arms: Vec<ConditionalArm>,
        else_value: Option<String>,
    },
    Lookup {
        field: String,
        table: String,
        cacheable: bool,
    },
    Expression {
        expression: Expression,
    },
}

/// A field mapping ready for evaluation
#[derive(Debug, Clone)]
pub struct CompiledMapping {
    pub target: String,
    pub position: u32,
    pub format: FieldFormat,
    pub default: Option<String>,
    pub rule: CompiledRule,
}

impl CompiledMapping {
    /// Parse the mapping's predicates and formula
    pub fn compile(mapping: &FieldMapping, position: u32) -> Result<Self, ConfigurationError> {
        debug!(target = %mapping.target, position, kind = mapping.rule.kind_name(), "CompiledMapping::compile: called");
        let parse = |source: &str| {
            Expression::parse(source).map_err(|e| ConfigurationError::Expression {
                target: mapping.target.clone(),
                message: format!("{} in '{}'", e, source),
            })
        };

        let rule = match &mapping.rule {
            FieldMappingRule::Source { source_field } => CompiledRule::Source {
                field: source_field.clone(),
            },
            FieldMappingRule::Constant { value } => CompiledRule::Constant { value: value.clone() },
            FieldMappingRule::Composite {
                source_fields,
                delimiter,
            } => {
                if source_fields.is_empty() {
                    return Err(ConfigurationError::MissingFields(mapping.target.clone()));
                }
                CompiledRule::Composite {
                    fields: source_fields.clone(),
                    delimiter: delimiter.clone(),
                }
            }
            FieldMappingRule::Conditional { branches, else_value } => {
                let arms = branches
                    .iter()
                    .map(|branch| {
                        Ok(ConditionalArm {
                            predicate: Arc::new(parse(&branch.when)?) as Arc<dyn Predicate>,
                            value: branch.then.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigurationError>>()?;
                CompiledRule::Conditional {
                    arms,
                    else_value: else_value.clone(),
                }
            }
            FieldMappingRule::Lookup {
                source_field,
                lookup_table,
                cacheable,
            } => CompiledRule::Lookup {
                field: source_field.clone(),
                table: lookup_table.clone(),
                cacheable: *cacheable,
            },
            FieldMappingRule::Expression { formula } => CompiledRule::Expression {
                expression: parse(formula)?,
            },
        };

        Ok(Self {
            target: mapping.target.clone(),
            position,
            format: mapping.format.clone(),
            default: mapping.default.clone(),
            rule,
        })
    }

    fn default_or(&self, err: TransformationError) -> Result<String, TransformationError> {
        self.default.clone().ok_or(err)
    }
}

/// Evaluates field mappings for one execution
#[derive(Clone)]
pub struct TransformationEngine {
    lookups: Arc<dyn LookupProvider>,
    cache: Arc<LookupCache>,
}

impl TransformationEngine {
    pub fn new(lookups: Arc<dyn LookupProvider>, cache: Arc<LookupCache>) -> Self {
        Self { lookups, cache }
    }

    pub fn cache(&self) -> &Arc<LookupCache> {
        &self.cache
    }

    /// Resolve the rule and format the value for its target field
    pub async fn evaluate(&self, mapping: &CompiledMapping, record: &Record) -> Result<String, TransformationError> {
        let raw = self.resolve(mapping, record).await?;
        format_value(&raw, &mapping.format).map_err(|e| match e {
            FormatError::TooLong { actual, max } => TransformationError::ValueTooLong {
                target: mapping.target.clone(),
                actual,
                max,
            },
            other => TransformationError::Format {
                target: mapping.target.clone(),
                message: other.to_string(),
            },
        })
    }

    /// Resolve the rule to its unformatted value
    pub async fn resolve(&self, mapping: &CompiledMapping, record: &Record) -> Result<String, TransformationError> {
        let target = &mapping.target;
        match &mapping.rule {
            CompiledRule::Source { field } => match record.get(field) {
                Some(value) => Ok(value.to_string()),
                None => mapping.default_or(TransformationError::MissingSourceField {
                    target: target.clone(),
                    field: field.clone(),
                }),
            },
            CompiledRule::Constant { value } => Ok(value.clone()),
            CompiledRule::Composite { fields, delimiter } => Ok(fields
                .iter()
                .map(|field| record.get(field).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(delimiter)),
            CompiledRule::Conditional { arms, else_value } => {
                for arm in arms {
                    let matched = arm.predicate.test(record).map_err(|e| TransformationError::Expression {
                        target: target.clone(),
                        message: e.to_string(),
                    })?;
                    if matched {
                        return Ok(arm.value.clone());
                    }
                }
                match else_value {
                    Some(value) => Ok(value.clone()),
                    None => mapping.default_or(TransformationError::NoMatchingCondition { target: target.clone() }),
                }
            }
            CompiledRule::Lookup { field, table, cacheable } => {
                let Some(key) = record.get(field) else {
                    return mapping.default_or(TransformationError::MissingSourceField {
                        target: target.clone(),
                        field: field.clone(),
                    });
                };
                let found = self.lookup(table, key, *cacheable).await.map_err(|message| {
                    TransformationError::LookupFailure {
                        target: target.clone(),
                        table: table.clone(),
                        message,
                    }
                })?;
                match found {
                    Some(value) => Ok(value),
                    None => mapping.default_or(TransformationError::LookupNotFound {
                        target: target.clone(),
                        table: table.clone(),
                        key: key.to_string(),
                    }),
                }
            }
            CompiledRule::Expression { expression } => {
                let value = expression.evaluate(record).map_err(|e| TransformationError::Expression {
                    target: target.clone(),
                    message: e.to_string(),
                })?;
                match value {
                    Value::Null => mapping.default_or(TransformationError::Expression {
                        target: target.clone(),
                        message: "evaluated to null".to_string(),
                    }),
                    other => Ok(other.render()),
                }
            }
        }
    }

    async fn lookup(&self, table: &str, key: &str, cacheable: bool) -> Result<Option<String>, String> {
        if cacheable {
            if let Some(cached) = self.cache.get(table, key) {
                return Ok(cached);
            }
        }
        debug!(%table, %key, "TransformationEngine::lookup: provider call");
        let value = self.lookups.query(table, key).await.map_err(|e| e.to_string())?;
        if cacheable {
            self.cache.insert(table, key, value.clone());
        }
        Ok(value)
    }

    /// Apply every mapping to a source record
    ///
    /// Returns the target record plus one error per failed field. Failed
    /// fields are left out of the target record.
    pub async fn transform(
        &self,
        mappings: &[CompiledMapping],
        record: &Record,
    ) -> (Record, Vec<TransformationError>) {
        let mut output = Record::new(record.line);
        let mut errors = Vec::new();
        for mapping in mappings {
            match self.evaluate(mapping, record).await {
                Ok(value) => output.insert(mapping.target.clone(), value),
                Err(e) => errors.push(e),
            }
        }
        (output, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConditionalBranch, DataType};
    use crate::providers::{ProviderError, ReferenceData, StaticReferenceData};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> TransformationEngine {
        let mut data = ReferenceData::default();
        data.lookups.insert(
            "departments".to_string(),
            HashMap::from([("10".to_string(), "Sales".to_string())]),
        );
        TransformationEngine::new(Arc::new(StaticReferenceData::new(data)), Arc::new(LookupCache::default()))
    }

    fn mapping(target: &str, rule: FieldMappingRule) -> CompiledMapping {
        let mapping = FieldMapping {
            target: target.to_string(),
            position: None,
            format: FieldFormat::default(),
            default: None,
            rule,
        };
        CompiledMapping::compile(&mapping, 1).unwrap()
    }

    fn employee() -> Record {
        Record::from_pairs(1, [("first", "Jane"), ("last", "Doe"), ("status", "A"), ("dept", "10")])
    }

    #[derive(Debug)]
    struct CountingPredicate {
        result: bool,
        calls: AtomicUsize,
    }

    impl CountingPredicate {
        fn new(result: bool) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Predicate for CountingPredicate {
        fn test(&self, _record: &Record) -> Result<bool, ExprError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result)
        }
    }

    #[tokio::test]
    async fn test_conditional_first_match_wins() {
        let first = CountingPredicate::new(false);
        let second = CountingPredicate::new(true);
        let third = CountingPredicate::new(true);
        let compiled = CompiledMapping {
            target: "tier".to_string(),
            position: 1,
            format: FieldFormat::default(),
            default: None,
            rule: CompiledRule::Conditional {
                arms: vec![
                    ConditionalArm {
                        predicate: first.clone(),
                        value: "one".to_string(),
                    },
                    ConditionalArm {
                        predicate: second.clone(),
                        value: "two".to_string(),
                    },
                    ConditionalArm {
                        predicate: third.clone(),
                        value: "three".to_string(),
                    },
                ],
                else_value: None,
            },
        };

        let value = engine().evaluate(&compiled, &employee()).await.unwrap();
        assert_eq!(value, "two");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_conditional_no_match() {
        let rule = FieldMappingRule::Conditional {
            branches: vec![ConditionalBranch {
                when: "status == 'X'".to_string(),
                then: "EXPIRED".to_string(),
            }],
            else_value: None,
        };
        let err = engine().evaluate(&mapping("emp_status", rule), &employee()).await.unwrap_err();
        assert!(matches!(err, TransformationError::NoMatchingCondition { .. }));
    }

    #[tokio::test]
    async fn test_employee_scenario() {
        let mappings = vec![
            mapping(
                "full_name",
                FieldMappingRule::Composite {
                    source_fields: vec!["first".to_string(), "last".to_string()],
                    delimiter: " ".to_string(),
                },
            ),
            mapping(
                "emp_status",
                FieldMappingRule::Conditional {
                    branches: vec![ConditionalBranch {
                        when: "status == \"A\"".to_string(),
                        then: "ACTIVE".to_string(),
                    }],
                    else_value: Some("INACTIVE".to_string()),
                },
            ),
        ];
        let (out, errors) = engine().transform(&mappings, &employee()).await;
        assert!(errors.is_empty());
        assert_eq!(out.get("full_name"), Some("Jane Doe"));
        assert_eq!(out.get("emp_status"), Some("ACTIVE"));
    }

    #[tokio::test]
    async fn test_source_missing_uses_default() {
        let mut compiled = mapping(
            "middle",
            FieldMappingRule::Source {
                source_field: "middle".to_string(),
            },
        );
        let err = engine().evaluate(&compiled, &employee()).await.unwrap_err();
        assert!(matches!(err, TransformationError::MissingSourceField { .. }));

        compiled.default = Some("N/A".to_string());
        assert_eq!(engine().evaluate(&compiled, &employee()).await.unwrap(), "N/A");
    }

    #[tokio::test]
    async fn test_constant_empty_allowed() {
        let compiled = mapping("filler", FieldMappingRule::Constant { value: String::new() });
        assert_eq!(engine().evaluate(&compiled, &Record::new(1)).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_lookup_caches_hits_and_misses() {
        let engine = engine();
        let compiled = mapping(
            "dept_name",
            FieldMappingRule::Lookup {
                source_field: "dept".to_string(),
                lookup_table: "departments".to_string(),
                cacheable: true,
            },
        );
        assert_eq!(engine.evaluate(&compiled, &employee()).await.unwrap(), "Sales");
        assert_eq!(engine.evaluate(&compiled, &employee()).await.unwrap(), "Sales");
        let stats = engine.cache().stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        let unknown = Record::from_pairs(2, [("dept", "99")]);
        let err = engine.evaluate(&compiled, &unknown).await.unwrap_err();
        assert!(matches!(err, TransformationError::LookupNotFound { .. }));
        assert_eq!(engine.cache().get("departments", "99"), Some(None));
    }

    #[derive(Debug)]
    struct BrokenProvider;

    #[async_trait]
    impl LookupProvider for BrokenProvider {
        async fn query(&self, _table: &str, _key: &str) -> Result<Option<String>, ProviderError> {
            Err(ProviderError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_lookup_failure_propagates() {
        let engine = TransformationEngine::new(Arc::new(BrokenProvider), Arc::new(LookupCache::default()));
        let compiled = mapping(
            "dept_name",
            FieldMappingRule::Lookup {
                source_field: "dept".to_string(),
                lookup_table: "departments".to_string(),
                cacheable: true,
            },
        );
        let err = engine.evaluate(&compiled, &employee()).await.unwrap_err();
        assert!(matches!(err, TransformationError::LookupFailure { .. }));
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_expression_formatted_to_target() {
        let mut compiled = mapping(
            "salary",
            FieldMappingRule::Expression {
                formula: "base * 1.1".to_string(),
            },
        );
        compiled.format = FieldFormat {
            data_type: DataType::Decimal,
            length: Some(10),
            scale: 2,
            implied_decimal: true,
            ..Default::default()
        };
        let record = Record::from_pairs(1, [("base", "1234.5")]);
        assert_eq!(engine().evaluate(&compiled, &record).await.unwrap(), "135795");
    }

    #[tokio::test]
    async fn test_value_too_long() {
        let mut compiled = mapping(
            "code",
            FieldMappingRule::Source {
                source_field: "first".to_string(),
            },
        );
        compiled.format.length = Some(2);
        let err = engine().evaluate(&compiled, &employee()).await.unwrap_err();
        assert_eq!(
            err,
            TransformationError::ValueTooLong {
                target: "code".to_string(),
                actual: 4,
                max: 2
            }
        );
    }

    #[test]
    fn test_compile_rejects_bad_predicate() {
        let mapping = FieldMapping {
            target: "x".to_string(),
            position: None,
            format: FieldFormat::default(),
            default: None,
            rule: FieldMappingRule::Conditional {
                branches: vec![ConditionalBranch {
                    when: "status ==".to_string(),
                    then: "A".to_string(),
                }],
                else_value: None,
            },
        };
        assert!(matches!(
            CompiledMapping::compile(&mapping, 1),
            Err(ConfigurationError::Expression { .. })
        ));
    }

    proptest! {
        #[test]
        fn composite_is_join_of_present_values(
            values in proptest::collection::vec(proptest::option::of("[a-z]{0,6}"), 1..6),
            delimiter in "[ ,|-]{0,2}",
        ) {
            let fields: Vec<String> = (0..values.len()).map(|i| format!("f{}", i)).collect();
            let mut record = Record::new(1);
            for (field, value) in fields.iter().zip(&values) {
                if let Some(v) = value {
                    record.insert(field.clone(), v.clone());
                }
            }
            let compiled = mapping("out", FieldMappingRule::Composite {
                source_fields: fields.clone(),
                delimiter: delimiter.clone(),
            });
            let expected = values.iter().map(|v| v.clone().unwrap_or_default()).collect::<Vec<_>>().join(&delimiter);

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let actual = runtime.block_on(engine().resolve(&compiled, &record)).unwrap();
            prop_assert_eq!(actual, expected);
        }
    }
}
