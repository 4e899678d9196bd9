//! Control specification
//!
//! A control specification describes the loader data file (field order,
//! positions, lengths, types) plus loader options and artifact paths. It is
//! rendered through a Handlebars template and can be parsed back from the
//! rendered file.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use handlebars::Handlebars;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::LoaderError;
use super::embedded;
use crate::domain::{CorrelationId, DataType, FieldFormat, JobConfiguration, LoadMode, LoaderOptions, RecordFormat};
use crate::transform::CompiledMapping;

/// Files produced for one loader run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub control_file: PathBuf,
    pub data_file: PathBuf,
    pub log_file: PathBuf,
    pub bad_file: PathBuf,
    pub discard_file: PathBuf,
}

impl ArtifactPaths {
    /// Artifact names derived from the correlation id
    pub fn in_dir(dir: &Path, correlation_id: &CorrelationId) -> Self {
        let stem = correlation_id.as_str();
        Self {
            control_file: dir.join(format!("{}.ctl", stem)),
            data_file: dir.join(format!("{}.dat", stem)),
            log_file: dir.join(format!("{}.log", stem)),
            bad_file: dir.join(format!("{}.bad", stem)),
            discard_file: dir.join(format!("{}.dsc", stem)),
        }
    }

    pub fn all(&self) -> [&Path; 5] {
        [
            &self.control_file,
            &self.data_file,
            &self.log_file,
            &self.bad_file,
            &self.discard_file,
        ]
    }
}

/// One field in the loader data file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    pub name: String,
    /// 1-based output position
    pub position: u32,
    /// 1-based start column (fixed-width records only)
    pub start: Option<u32>,
    pub length: u32,
    pub data_type: DataType,
    /// chrono format for date fields
    pub format: Option<String>,
}

impl FieldLayout {
    pub fn end(&self) -> Option<u32> {
        self.start.map(|start| start + self.length.saturating_sub(1))
    }

    fn type_clause(&self) -> String {
        match self.data_type {
            DataType::Char => format!("CHAR({})", self.length),
            DataType::Integer => format!("INTEGER EXTERNAL({})", self.length),
            DataType::Decimal => format!("DECIMAL EXTERNAL({})", self.length),
            DataType::Date => format!(
                "DATE({}) \"{}\"",
                self.length,
                oracle_mask(self.format.as_deref().unwrap_or(FieldFormat::DEFAULT_DATE_FORMAT))
            ),
        }
    }

    fn clause(&self) -> String {
        match (self.start, self.end()) {
            (Some(start), Some(end)) => format!("{} POSITION({}:{}) {}", self.name, start, end, self.type_clause()),
            _ => format!("{} {}", self.name, self.type_clause()),
        }
    }
}

/// Everything the loader needs to know about one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSpecification {
    pub correlation_id: String,
    pub table: String,
    pub load_mode: LoadMode,
    /// Field terminator; `None` for fixed-width records
    pub delimiter: Option<char>,
    pub fields: Vec<FieldLayout>,
    pub options: LoaderOptions,
    pub paths: ArtifactPaths,
}

impl ControlSpecification {
    /// Build the specification for a job from its compiled mappings
    pub fn build(
        job: &JobConfiguration,
        mappings: &[CompiledMapping],
        correlation_id: &CorrelationId,
        paths: ArtifactPaths,
    ) -> Self {
        debug!(job_id = %job.job_id, %correlation_id, "ControlSpecification::build: called");
        let fixed = job.target.record_format == RecordFormat::FixedWidth;

        let mut ordered: Vec<&CompiledMapping> = mappings.iter().collect();
        ordered.sort_by_key(|m| m.position);

        let mut next_start = 1u32;
        let fields = ordered
            .into_iter()
            .map(|mapping| {
                let length = mapping.format.effective_length();
                let start = fixed.then_some(next_start);
                next_start += length;
                FieldLayout {
                    name: mapping.target.clone(),
                    position: mapping.position,
                    start,
                    length,
                    data_type: mapping.format.data_type,
                    format: (mapping.format.data_type == DataType::Date)
                        .then(|| mapping.format.output_date_format().to_string()),
                }
            })
            .collect();

        Self {
            correlation_id: correlation_id.to_string(),
            table: job.target.table.clone(),
            load_mode: job.target.load_mode,
            delimiter: (!fixed).then_some(job.target.delimiter),
            fields,
            options: job.loader.options.clone(),
            paths,
        }
    }

    pub fn record_format(&self) -> RecordFormat {
        match self.delimiter {
            Some(_) => RecordFormat::Delimited,
            None => RecordFormat::FixedWidth,
        }
    }

    /// Width of one fixed-width record
    pub fn record_width(&self) -> u32 {
        self.fields.iter().map(|f| f.length).sum()
    }

    /// Parse a rendered control file
    pub fn parse(text: &str) -> Result<Self, LoaderError> {
        debug!(len = text.len(), "ControlSpecification::parse: called");
        let mut correlation_id = None;
        let mut control_file = None;
        let mut log_file = None;
        let mut parallel = None;
        let mut options = None;
        let mut data_file = None;
        let mut bad_file = None;
        let mut discard_file = None;
        let mut load_mode = None;
        let mut table = None;
        let mut delimiter = None;
        let mut fields = Vec::new();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(caps) = HEADER_RE.captures(line) {
                let value = caps[2].to_string();
                match &caps[1] {
                    "correlation-id" => correlation_id = Some(value),
                    "control-file" => control_file = Some(PathBuf::from(value)),
                    "log-file" => log_file = Some(PathBuf::from(value)),
                    "parallel-degree" => parallel = value.parse::<u32>().ok(),
                    _ => {}
                }
            } else if let Some(caps) = OPTIONS_RE.captures(line) {
                options = Some((&caps[1] == "TRUE", parse_number(&caps[2])?, parse_number(&caps[3])?));
            } else if let Some(caps) = FILE_RE.captures(line) {
                let path = PathBuf::from(&caps[2]);
                match &caps[1] {
                    "INFILE" => data_file = Some(path),
                    "BADFILE" => bad_file = Some(path),
                    _ => discard_file = Some(path),
                }
            } else if let Some(caps) = TABLE_RE.captures(line) {
                table = Some(caps[1].to_string());
            } else if let Some(caps) = TERMINATOR_RE.captures(line) {
                delimiter = caps[1].chars().next();
            } else if let Some(caps) = FIELD_RE.captures(line) {
                fields.push(parse_field(&caps)?);
            } else if let Some(mode) = LoadMode::from_keyword(line) {
                load_mode = Some(mode);
            }
        }

        let missing = |what: &str| LoaderError::Parse(format!("missing {}", what));
        let (direct_path, bind_array_size, max_errors) = options.ok_or_else(|| missing("OPTIONS"))?;
        let spec = Self {
            correlation_id: correlation_id.ok_or_else(|| missing("correlation-id"))?,
            table: table.ok_or_else(|| missing("INTO TABLE"))?,
            load_mode: load_mode.ok_or_else(|| missing("load mode"))?,
            delimiter,
            fields,
            options: LoaderOptions {
                parallel: parallel.unwrap_or(1),
                direct_path,
                bind_array_size: bind_array_size as u32,
                max_errors,
            },
            paths: ArtifactPaths {
                control_file: control_file.ok_or_else(|| missing("control-file"))?,
                data_file: data_file.ok_or_else(|| missing("INFILE"))?,
                log_file: log_file.ok_or_else(|| missing("log-file"))?,
                bad_file: bad_file.ok_or_else(|| missing("BADFILE"))?,
                discard_file: discard_file.ok_or_else(|| missing("DISCARDFILE"))?,
            },
        };
        debug!(fields = spec.fields.len(), "ControlSpecification::parse: done");
        Ok(spec)
    }
}

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^--\s*([a-z-]+):\s*(.*?)\s*$").expect("valid header regex"));
static OPTIONS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^OPTIONS\s*\(DIRECT=(TRUE|FALSE),\s*PARALLEL=(?:TRUE|FALSE),\s*ROWS=(\d+),\s*ERRORS=(\d+)\)")
        .expect("valid options regex")
});
static FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(INFILE|BADFILE|DISCARDFILE)\s+'([^']*)'").expect("valid file regex"));
static TABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^INTO TABLE\s+(\S+)").expect("valid table regex"));
static TERMINATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^FIELDS TERMINATED BY '(.)'").expect("valid terminator regex"));
static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(\w+)\s+(?:POSITION\((\d+):(\d+)\)\s+)?(CHAR|INTEGER EXTERNAL|DECIMAL EXTERNAL|DATE)\((\d+)\)(?:\s+"([^"]*)")?,?\s*--\s*position\s+(\d+)$"#,
    )
    .expect("valid field regex")
});

fn parse_number(text: &str) -> Result<u64, LoaderError> {
    text.parse()
        .map_err(|_| LoaderError::Parse(format!("invalid number '{}'", text)))
}

fn parse_field(caps: &regex::Captures<'_>) -> Result<FieldLayout, LoaderError> {
    let data_type = match &caps[4] {
        "CHAR" => DataType::Char,
        "INTEGER EXTERNAL" => DataType::Integer,
        "DECIMAL EXTERNAL" => DataType::Decimal,
        _ => DataType::Date,
    };
    let length = parse_number(&caps[5])? as u32;
    let start = caps.get(2).map(|m| parse_number(m.as_str())).transpose()?.map(|s| s as u32);
    if let (Some(start), Some(end)) = (start, caps.get(3)) {
        let end = parse_number(end.as_str())? as u32;
        if end + 1 != start + length {
            return Err(LoaderError::Parse(format!(
                "field {} spans {}:{} but has length {}",
                &caps[1], start, end, length
            )));
        }
    }
    Ok(FieldLayout {
        name: caps[1].to_string(),
        position: parse_number(&caps[7])? as u32,
        start,
        length,
        data_type,
        format: caps.get(6).map(|m| chrono_format(m.as_str())),
    })
}

const MASK_TOKENS: &[(&str, &str)] = &[
    ("%Y", "YYYY"),
    ("%H", "HH24"),
    ("%j", "DDD"),
    ("%b", "MON"),
    ("%m", "MM"),
    ("%d", "DD"),
    ("%M", "MI"),
    ("%S", "SS"),
    ("%y", "YY"),
];

/// Convert a chrono format into an Oracle date mask
pub fn oracle_mask(format: &str) -> String {
    let mut out = String::with_capacity(format.len() + 4);
    let mut rest = format;
    'outer: while !rest.is_empty() {
        for (chrono, oracle) in MASK_TOKENS {
            if let Some(tail) = rest.strip_prefix(chrono) {
                out.push_str(oracle);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// Convert an Oracle date mask back into a chrono format
pub fn chrono_format(mask: &str) -> String {
    let mut out = String::with_capacity(mask.len());
    let mut rest = mask;
    'outer: while !rest.is_empty() {
        // longest tokens first so DDD wins over DD
        for (chrono, oracle) in MASK_TOKENS {
            if let Some(tail) = rest.strip_prefix(oracle) {
                out.push_str(chrono);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// True when a chrono format survives the trip through an Oracle mask
///
/// Adjacent tokens can merge into a different mask (`%d%j` renders as
/// `DDDDD`, which reads back as `%j%d`).
pub fn mask_round_trips(format: &str) -> bool {
    chrono_format(&oracle_mask(format)) == format
}

#[derive(Serialize)]
struct RenderContext<'a> {
    correlation_id: &'a str,
    control_file: String,
    log_file: String,
    parallel: u32,
    direct: &'static str,
    parallel_flag: &'static str,
    bind_array_size: u32,
    max_errors: u64,
    data_file: String,
    bad_file: String,
    discard_file: String,
    load_mode: &'static str,
    table: &'a str,
    field_terminator: String,
    fields: Vec<FieldContext>,
}

#[derive(Serialize)]
struct FieldContext {
    clause: String,
    separator: &'static str,
    position: u32,
}

fn flag(value: bool) -> &'static str {
    if value { "TRUE" } else { "FALSE" }
}

impl<'a> RenderContext<'a> {
    fn new(spec: &'a ControlSpecification) -> Self {
        let count = spec.fields.len();
        Self {
            correlation_id: &spec.correlation_id,
            control_file: spec.paths.control_file.display().to_string(),
            log_file: spec.paths.log_file.display().to_string(),
            parallel: spec.options.parallel,
            direct: flag(spec.options.direct_path),
            parallel_flag: flag(spec.options.parallel > 1),
            bind_array_size: spec.options.bind_array_size,
            max_errors: spec.options.max_errors,
            data_file: spec.paths.data_file.display().to_string(),
            bad_file: spec.paths.bad_file.display().to_string(),
            discard_file: spec.paths.discard_file.display().to_string(),
            load_mode: spec.load_mode.keyword(),
            table: &spec.table,
            field_terminator: match spec.delimiter {
                Some(d) => format!("FIELDS TERMINATED BY '{}' OPTIONALLY ENCLOSED BY '\"'", d),
                None => "-- fixed-width records".to_string(),
            },
            fields: spec
                .fields
                .iter()
                .enumerate()
                .map(|(i, field)| FieldContext {
                    clause: field.clause(),
                    separator: if i + 1 < count { "," } else { "" },
                    position: field.position,
                })
                .collect(),
        }
    }
}

/// Loads and renders control templates
///
/// Templates are looked up as `<template-dir>/<name>.ctl.hbs` first, then
/// among the embedded defaults.
pub struct ControlRenderer {
    hbs: Handlebars<'static>,
    template_dir: Option<PathBuf>,
}

impl ControlRenderer {
    pub fn new(template_dir: Option<PathBuf>) -> Self {
        let template_dir = template_dir.filter(|dir| dir.is_dir());
        debug!(?template_dir, "ControlRenderer::new: called");
        let mut hbs = Handlebars::new();
        hbs.set_strict_mode(true);
        hbs.register_escape_fn(handlebars::no_escape);
        Self { hbs, template_dir }
    }

    /// Renderer that only uses embedded templates
    pub fn embedded_only() -> Self {
        Self::new(None)
    }

    fn user_template(&self, name: &str) -> Option<PathBuf> {
        if name.contains(['/', '\\']) || name.contains("..") {
            return None;
        }
        self.template_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.ctl.hbs", name)))
            .filter(|path| path.is_file())
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.user_template(name).is_some() || embedded::get_embedded(name).is_some()
    }

    fn load_template(&self, name: &str) -> Result<String, LoaderError> {
        debug!(%name, "ControlRenderer::load_template: called");
        if let Some(path) = self.user_template(name) {
            debug!(?path, "ControlRenderer::load_template: found user template");
            return std::fs::read_to_string(&path)
                .map_err(|e| LoaderError::Template(format!("failed to read {}: {}", path.display(), e)));
        }
        embedded::get_embedded(name)
            .map(str::to_string)
            .ok_or_else(|| LoaderError::Template(format!("template not found: {}", name)))
    }

    /// Render a specification through the named template
    pub fn render(&self, name: &str, spec: &ControlSpecification) -> Result<String, LoaderError> {
        debug!(%name, correlation_id = %spec.correlation_id, "ControlRenderer::render: called");
        let template = self.load_template(name)?;
        self.hbs
            .render_template(&template, &RenderContext::new(spec))
            .map_err(|e| LoaderError::Template(format!("failed to render {}: {}", name, e)))
    }

    /// Render and write the control file to its artifact path
    pub async fn write(&self, name: &str, spec: &ControlSpecification) -> Result<PathBuf, LoaderError> {
        let text = self.render(name, spec)?;
        let path = spec.paths.control_file.clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, text).await?;
        info!(path = %path.display(), fields = spec.fields.len(), "Wrote control file");
        Ok(path)
    }
}
