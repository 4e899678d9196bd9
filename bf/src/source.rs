//! Input and output files
//!
//! Reads delimited input into [`Record`]s, writes the loader data file and
//! the rejects file, and discovers input files in a directory.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::{QuoteStyle, ReaderBuilder, Trim, WriterBuilder};
use glob::Pattern;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::domain::{Record, RecordFormat, SourceSpec, TargetSpec};
use crate::transform::{CompiledMapping, pad_fixed};

/// Input/output file errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{0} has no header and the job names no columns")]
    MissingColumns(PathBuf),

    #[error("Delimiter and quote must be single-byte characters, got '{0}'")]
    InvalidDelimiter(char),

    #[error("Invalid file pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
}

fn byte(c: char) -> Result<u8, SourceError> {
    u8::try_from(c).map_err(|_| SourceError::InvalidDelimiter(c))
}

/// Records read from one or more input files
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub records: Vec<Record>,
    /// Column names in first-seen order across all files
    pub columns: Vec<String>,
    /// Input files with the number of records each contributed, in order
    pub files: Vec<(String, usize)>,
}

impl SourceBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Input file the record at `index` came from
    pub fn origin(&self, index: usize) -> Option<&str> {
        let mut end = 0;
        for (file, count) in &self.files {
            end += count;
            if index < end {
                return Some(file);
            }
        }
        None
    }

    fn extend(&mut self, path: &Path, columns: Vec<String>, records: Vec<Record>) {
        for column in columns {
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }
        self.files.push((path.display().to_string(), records.len()));
        self.records.extend(records);
    }
}

/// Read one delimited input file
pub fn read_records(path: &Path, spec: &SourceSpec) -> Result<Vec<Record>, SourceError> {
    read_file(path, spec).map(|(_, records)| records)
}

fn read_file(path: &Path, spec: &SourceSpec) -> Result<(Vec<String>, Vec<Record>), SourceError> {
    debug!(path = %path.display(), "read_file: called");
    let csv_err = |source: csv::Error| SourceError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = ReaderBuilder::new()
        .delimiter(byte(spec.delimiter)?)
        .quote(byte(spec.quote)?)
        .has_headers(spec.has_header)
        .flexible(true)
        .trim(if spec.trim { Trim::All } else { Trim::None })
        .from_path(path)
        .map_err(csv_err)?;

    let columns: Vec<String> = if !spec.columns.is_empty() {
        spec.columns.clone()
    } else if spec.has_header {
        reader.headers().map_err(csv_err)?.iter().map(str::to_string).collect()
    } else {
        return Err(SourceError::MissingColumns(path.to_path_buf()));
    };

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        let mut record = Record::new(line);
        for (name, value) in columns.iter().zip(row.iter()) {
            record.insert(name.clone(), value);
        }
        records.push(record);
    }
    info!(path = %path.display(), records = records.len(), "Read input file");
    Ok((columns, records))
}

/// Read all input files in order
pub fn read_batch(paths: &[PathBuf], spec: &SourceSpec) -> Result<SourceBatch, SourceError> {
    let mut batch = SourceBatch::default();
    for path in paths {
        let (columns, records) = read_file(path, spec)?;
        batch.extend(path, columns, records);
    }
    Ok(batch)
}

/// Write transformed records as the loader data file
///
/// Delimited output quotes values only when needed. Fixed-width output pads
/// each field to its length. Returns the number of records written.
pub fn write_data_file(
    path: &Path,
    records: &[Record],
    mappings: &[CompiledMapping],
    target: &TargetSpec,
) -> Result<u64, SourceError> {
    debug!(path = %path.display(), records = records.len(), "write_data_file: called");
    let io_err = |source: std::io::Error| SourceError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut ordered: Vec<&CompiledMapping> = mappings.iter().collect();
    ordered.sort_by_key(|m| m.position);

    match target.record_format {
        RecordFormat::Delimited => {
            let csv_err = |source: csv::Error| SourceError::Csv {
                path: path.to_path_buf(),
                source,
            };
            let mut writer = WriterBuilder::new()
                .delimiter(byte(target.delimiter)?)
                .quote_style(QuoteStyle::Necessary)
                .has_headers(false)
                .from_path(path)
                .map_err(csv_err)?;
            for record in records {
                writer
                    .write_record(ordered.iter().map(|m| record.get(&m.target).unwrap_or_default()))
                    .map_err(csv_err)?;
            }
            writer.flush().map_err(io_err)?;
        }
        RecordFormat::FixedWidth => {
            let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
            for record in records {
                let line: String = ordered
                    .iter()
                    .map(|m| pad_fixed(record.get(&m.target).unwrap_or_default(), &m.format))
                    .collect();
                writeln!(writer, "{}", line).map_err(io_err)?;
            }
            writer.flush().map_err(io_err)?;
        }
    }
    info!(path = %path.display(), records = records.len(), "Wrote loader data file");
    Ok(records.len() as u64)
}

/// A source record that will not be loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub file: String,
    pub source: Record,
    pub reasons: Vec<String>,
}

/// Write rejected records with their reasons
///
/// Columns: `file`, `line`, `reasons` (joined with `; `), then the source
/// columns in the given order.
pub fn write_rejects(path: &Path, rejects: &[RejectedRecord], columns: &[String]) -> Result<u64, SourceError> {
    debug!(path = %path.display(), rejects = rejects.len(), "write_rejects: called");
    let io_err = |source: std::io::Error| SourceError::Io {
        path: path.to_path_buf(),
        source,
    };
    let csv_err = |source: csv::Error| SourceError::Csv {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut writer = WriterBuilder::new().from_path(path).map_err(csv_err)?;
    let header = ["file", "line", "reasons"]
        .into_iter()
        .map(str::to_string)
        .chain(columns.iter().cloned());
    writer.write_record(header).map_err(csv_err)?;
    for reject in rejects {
        let row = [
            reject.file.clone(),
            reject.source.line.to_string(),
            reject.reasons.join("; "),
        ]
        .into_iter()
        .chain(columns.iter().map(|c| reject.source.get(c).unwrap_or_default().to_string()));
        writer.write_record(row).map_err(csv_err)?;
    }
    writer.flush().map_err(io_err)?;
    info!(path = %path.display(), rejects = rejects.len(), "Wrote rejects file");
    Ok(rejects.len() as u64)
}

/// Find input files under `dir` whose names match `pattern`, sorted
pub fn discover_inputs(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, SourceError> {
    debug!(dir = %dir.display(), %pattern, "discover_inputs: called");
    let matcher = Pattern::new(pattern).map_err(|e| SourceError::Pattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| matcher.matches(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    debug!(count = files.len(), "discover_inputs: done");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataType, FieldFormat, FieldMapping, FieldMappingRule, LoadMode};
    use tempfile::TempDir;

    fn mapping(target: &str, position: u32, format: FieldFormat) -> CompiledMapping {
        let config = FieldMapping {
            target: target.to_string(),
            position: Some(position),
            format,
            default: None,
            rule: FieldMappingRule::Source {
                source_field: target.to_string(),
            },
        };
        CompiledMapping::compile(&config, position).unwrap()
    }

    fn target(record_format: RecordFormat) -> TargetSpec {
        TargetSpec {
            table: "T".to_string(),
            load_mode: LoadMode::Append,
            record_format,
            delimiter: '|',
        }
    }

    #[test]
    fn test_read_with_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.csv");
        std::fs::write(&path, "first,last,status\nJane , Doe,A\n\"Smith, Jr\",John,I\n").unwrap();
        let records = read_records(&path, &SourceSpec::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("first"), Some("Jane"));
        assert_eq!(records[0].line, 2);
        assert_eq!(records[1].get("first"), Some("Smith, Jr"));
    }

    #[test]
    fn test_read_without_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, "1;a\n2;b;extra\n3\n").unwrap();
        let spec = SourceSpec {
            delimiter: ';',
            has_header: false,
            columns: vec!["id".to_string(), "code".to_string()],
            ..Default::default()
        };
        let records = read_records(&path, &spec).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].get("code"), Some("b"));
        assert_eq!(records[2].get("code"), None);

        let no_columns = SourceSpec {
            has_header: false,
            ..Default::default()
        };
        assert!(matches!(read_records(&path, &no_columns), Err(SourceError::MissingColumns(_))));
    }

    #[test]
    fn test_batch_origins() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::write(&a, "x\n1\n2\n").unwrap();
        std::fs::write(&b, "x,y\n3,4\n").unwrap();
        let batch = read_batch(&[a.clone(), b.clone()], &SourceSpec::default()).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.columns, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(batch.origin(1), Some(a.display().to_string().as_str()));
        assert_eq!(batch.origin(2), Some(b.display().to_string().as_str()));
        assert_eq!(batch.origin(3), None);
    }

    #[test]
    fn test_write_delimited() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/data.dat");
        let mappings = vec![
            mapping("name", 2, FieldFormat::default()),
            mapping("id", 1, FieldFormat::default()),
        ];
        let records = vec![
            Record::from_pairs(1, [("id", "1"), ("name", "Jane")]),
            Record::from_pairs(2, [("id", "2"), ("name", "a|b")]),
        ];
        let written = write_data_file(&path, &records, &mappings, &target(RecordFormat::Delimited)).unwrap();
        assert_eq!(written, 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1|Jane\n2|\"a|b\"\n");
    }

    #[test]
    fn test_write_fixed_width() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.dat");
        let amount = FieldFormat {
            data_type: DataType::Integer,
            length: Some(5),
            ..Default::default()
        };
        let name = FieldFormat {
            length: Some(4),
            ..Default::default()
        };
        let mappings = vec![mapping("name", 1, name), mapping("amount", 2, amount)];
        let records = vec![Record::from_pairs(1, [("name", "Al"), ("amount", "42")])];
        write_data_file(&path, &records, &mappings, &target(RecordFormat::FixedWidth)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Al  00042\n");
    }

    #[test]
    fn test_write_rejects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.rejected.csv");
        let rejects = vec![RejectedRecord {
            file: "in.csv".to_string(),
            source: Record::from_pairs(7, [("first", "")]),
            reasons: vec!["required: first is required".to_string(), "length".to_string()],
        }];
        write_rejects(&path, &rejects, &["first".to_string()]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "file,line,reasons,first\nin.csv,7,required: first is required; length,\n"
        );
    }

    #[test]
    fn test_discover_inputs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        for name in ["b.csv", "a.csv", "notes.txt", "nested/c.csv"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let files = discover_inputs(dir.path(), "*.csv").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["a.csv", "b.csv", "nested/c.csv"]);
        assert!(matches!(discover_inputs(dir.path(), "[").unwrap_err(), SourceError::Pattern { .. }));
    }
}
