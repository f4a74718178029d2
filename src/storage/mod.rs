//! Row-oriented data writer.
//!
//! A [`DataWriter`] is configured with an output path, a [`Schema`], an identifier, free-text
//! comments, an [`OutputKind`] and an overwrite flag. All checks run in [`DataWriter::new`]
//! before a file is touched. [`DataWriter::open`] creates the file and returns a
//! [`WriterSession`], which persists each accepted row immediately and closes the file when
//! dropped.
//!
//! # Output kinds
//!
//! | Kind | Extension | Schema | Layout |
//! |------|-----------|--------|--------|
//! | [`OutputKind::Text`] | `.csv` | [`Schema::Names`] | `# Identifier:`, `# Comments:`, `# Columns:` header, then one fully quoted line per row |
//! | [`OutputKind::Binary`] | `.arrow` | [`Schema::Typed`] | Arrow IPC stream, identifier and comments in the schema metadata, one flushed batch per row |
//!
//! # Example
//!
//! ```no_run
//! use bias_scan::storage::{DataWriter, OutputKind, RowData, Schema, WriterConfig};
//!
//! let schema = Schema::names(["timestamp", "bias", "current"]);
//! let writer = DataWriter::new(
//!     WriterConfig::new("iv_run", schema, OutputKind::Text).identifier("IV_curve"),
//! )?;
//! let mut session = writer.open()?;
//! session.write_row(RowData::positional([1.0, 0.0, 1e-6]))?;
//! session.write_row(RowData::named([("bias", 1.0), ("current", 2e-6), ("timestamp", 2.0)]))?;
//! session.close()?;
//! # Ok::<(), bias_scan::error::ScanError>(())
//! ```

#[cfg(feature = "storage_arrow")]
mod ipc;
#[cfg(feature = "storage_csv")]
mod text;

use crate::error::{ScanError, ScanResult};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Physical encoding of the output file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Comma-separated text with a comment header
    Text,
    /// Arrow IPC stream
    Binary,
}

impl OutputKind {
    /// File extension without the dot
    pub fn extension(self) -> &'static str {
        match self {
            OutputKind::Text => "csv",
            OutputKind::Binary => "arrow",
        }
    }

    /// Whether the backend for this kind was compiled in
    pub fn is_enabled(self) -> bool {
        match self {
            OutputKind::Text => cfg!(feature = "storage_csv"),
            OutputKind::Binary => cfg!(feature = "storage_arrow"),
        }
    }

    /// Cargo feature providing this kind
    pub fn feature(self) -> &'static str {
        match self {
            OutputKind::Text => "storage_csv",
            OutputKind::Binary => "storage_arrow",
        }
    }

    /// Every kind, enabled or not
    pub fn all() -> [OutputKind; 2] {
        [OutputKind::Text, OutputKind::Binary]
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Text => write!(f, "csv"),
            OutputKind::Binary => write!(f, "arrow"),
        }
    }
}

impl FromStr for OutputKind {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" | "text" => Ok(OutputKind::Text),
            "arrow" | "ipc" | "binary" => Ok(OutputKind::Binary),
            other => Err(ScanError::config(format!(
                "Invalid output format '{other}'. Must be one of: csv, arrow"
            ))),
        }
    }
}

/// Fixed-width value type of a binary column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit float
    Float64,
    /// 32-bit float
    Float32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit signed integer
    Int32,
    /// 64-bit unsigned integer
    UInt64,
}

impl ColumnType {
    /// Whether `value` can be stored without changing its meaning.
    ///
    /// Floats accept anything (f32 rejects finite values outside its range). Integer
    /// columns accept only integral values within range.
    pub fn accepts(self, value: f64) -> bool {
        let integral = value.is_finite() && value.fract() == 0.0;
        match self {
            ColumnType::Float64 => true,
            ColumnType::Float32 => !value.is_finite() || value.abs() <= f64::from(f32::MAX),
            ColumnType::Int64 => integral && value >= i64::MIN as f64 && value < i64::MAX as f64,
            ColumnType::Int32 => {
                integral && value >= f64::from(i32::MIN) && value <= f64::from(i32::MAX)
            }
            ColumnType::UInt64 => integral && value >= 0.0 && value < u64::MAX as f64,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Float64 => "float64",
            ColumnType::Float32 => "float32",
            ColumnType::Int64 => "int64",
            ColumnType::Int32 => "int32",
            ColumnType::UInt64 => "uint64",
        };
        f.write_str(name)
    }
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Value type
    pub dtype: ColumnType,
}

impl Column {
    /// Create a column
    pub fn new(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Column layout of an output file
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// Ordered column names (text output)
    Names(Vec<String>),
    /// Ordered typed columns (binary output)
    Typed(Vec<Column>),
}

impl Schema {
    /// Plain name list
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Schema::Names(names.into_iter().map(Into::into).collect())
    }

    /// Typed columns
    pub fn typed(columns: impl IntoIterator<Item = Column>) -> Self {
        Schema::Typed(columns.into_iter().collect())
    }

    /// Schema suitable for `kind` with every column stored as `Float64`
    pub fn float_columns<I, S>(names: I, kind: OutputKind) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = Self::names(names);
        match (kind, names) {
            (OutputKind::Binary, Schema::Names(names)) => Schema::Typed(
                names
                    .into_iter()
                    .map(|n| Column::new(n, ColumnType::Float64))
                    .collect(),
            ),
            (_, schema) => schema,
        }
    }

    /// Column names in order
    pub fn column_names(&self) -> Vec<&str> {
        match self {
            Schema::Names(names) => names.iter().map(String::as_str).collect(),
            Schema::Typed(columns) => columns.iter().map(|c| c.name.as_str()).collect(),
        }
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        match self {
            Schema::Names(names) => names.len(),
            Schema::Typed(columns) => columns.len(),
        }
    }

    /// Whether the schema has no columns
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dtype(&self, index: usize) -> Option<ColumnType> {
        match self {
            Schema::Names(_) => None,
            Schema::Typed(columns) => columns.get(index).map(|c| c.dtype),
        }
    }

    fn check(&self, kind: OutputKind) -> ScanResult<()> {
        let mismatch = |reason: &str| ScanError::SchemaKindMismatch {
            kind: kind.to_string(),
            reason: reason.to_string(),
        };
        match (kind, self) {
            (OutputKind::Text, Schema::Typed(_)) => {
                return Err(mismatch("text output requires a plain list of column names"))
            }
            (OutputKind::Binary, Schema::Names(_)) => {
                return Err(mismatch("binary output requires typed columns"))
            }
            _ => {}
        }

        if self.is_empty() {
            return Err(mismatch("schema has no columns"));
        }

        let mut seen = HashSet::new();
        for name in self.column_names() {
            if name.trim().is_empty() {
                return Err(mismatch("column names must be non-empty"));
            }
            if !seen.insert(name) {
                return Err(mismatch(&format!("duplicate column '{name}'")));
            }
        }
        Ok(())
    }
}

/// Values of one row
///
/// Either every value in schema order, or every value keyed by column name. Mixing the two
/// is not representable.
#[derive(Debug, Clone, PartialEq)]
pub enum RowData {
    /// Values in schema column order
    Positional(Vec<f64>),
    /// Values keyed by column name, any order
    Named(Vec<(String, f64)>),
}

impl RowData {
    /// Values in schema order
    pub fn positional(values: impl IntoIterator<Item = f64>) -> Self {
        RowData::Positional(values.into_iter().collect())
    }

    /// Values keyed by column name
    pub fn named<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        RowData::Named(items.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Order the values by `schema`, rejecting rows that do not fit.
    fn resolve(self, schema: &Schema) -> ScanResult<Vec<f64>> {
        let expected = schema.len();
        let values = match self {
            RowData::Positional(values) => {
                if values.len() != expected {
                    return Err(ScanError::RowLength {
                        expected,
                        got: values.len(),
                    });
                }
                values
            }
            RowData::Named(items) => {
                if items.len() != expected {
                    return Err(ScanError::RowLength {
                        expected,
                        got: items.len(),
                    });
                }
                schema
                    .column_names()
                    .into_iter()
                    .map(|column| {
                        items
                            .iter()
                            .find(|(k, _)| k == column)
                            .map(|(_, v)| *v)
                            .ok_or_else(|| ScanError::MissingColumn {
                                column: column.to_string(),
                            })
                    })
                    .collect::<ScanResult<Vec<f64>>>()?
            }
        };

        for (index, value) in values.iter().enumerate() {
            if let Some(dtype) = schema.dtype(index) {
                if !dtype.accepts(*value) {
                    return Err(ScanError::ColumnValue {
                        column: schema.column_names()[index].to_string(),
                        dtype: dtype.to_string(),
                        value: *value,
                    });
                }
            }
        }
        Ok(values)
    }
}

impl From<Vec<f64>> for RowData {
    fn from(values: Vec<f64>) -> Self {
        RowData::Positional(values)
    }
}

/// Construction parameters of a [`DataWriter`]
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Output path; the extension is normalised to the output kind
    pub path: PathBuf,
    /// Column layout
    pub schema: Schema,
    /// Label of the data set (text header line, Arrow metadata)
    pub identifier: String,
    /// Free-text comments
    pub comments: Vec<String>,
    /// Physical encoding
    pub kind: OutputKind,
    /// Whether an existing file may be replaced
    pub overwrite: bool,
}

impl WriterConfig {
    /// Config with identifier `"measurement"`, no comments and overwrite disabled
    pub fn new(path: impl Into<PathBuf>, schema: Schema, kind: OutputKind) -> Self {
        Self {
            path: path.into(),
            schema,
            identifier: "measurement".to_string(),
            comments: Vec::new(),
            kind,
            overwrite: false,
        }
    }

    /// Set the identifier
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Replace the comments
    pub fn comments<I, S>(mut self, comments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.comments = comments.into_iter().map(Into::into).collect();
        self
    }

    /// Allow replacing an existing file
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Give `path` the extension of `kind`.
///
/// A missing extension, or the extension of the other kind, is replaced. Any other
/// extension is kept and the kind's extension appended (`run.2024` -> `run.2024.csv`).
pub fn normalize_extension(path: &Path, kind: OutputKind) -> PathBuf {
    let wanted = kind.extension();
    let current = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);

    match current.as_deref() {
        Some(ext) if ext == wanted => path.to_path_buf(),
        None => path.with_extension(wanted),
        Some(ext) if OutputKind::all().iter().any(|k| k.extension() == ext) => {
            path.with_extension(wanted)
        }
        Some(_) => {
            let mut name = path.as_os_str().to_os_string();
            name.push(".");
            name.push(wanted);
            PathBuf::from(name)
        }
    }
}

/// Destination of accepted rows
trait RowSink: Send {
    /// Persist one row durably
    fn append(&mut self, values: &[f64]) -> ScanResult<()>;

    /// Flush and close the file
    fn finish(&mut self) -> ScanResult<()>;
}

/// Validated writer, ready to create its output file
#[derive(Debug)]
pub struct DataWriter {
    config: WriterConfig,
}

impl DataWriter {
    /// Validate `config` without touching the file system beyond an existence check.
    pub fn new(mut config: WriterConfig) -> ScanResult<Self> {
        if !config.kind.is_enabled() {
            return Err(ScanError::FeatureNotEnabled(config.kind.feature().to_string()));
        }

        config.path = normalize_extension(&config.path, config.kind);

        if config.identifier.trim().is_empty() {
            return Err(ScanError::EmptyIdentifier);
        }
        if config.identifier.contains(['\n', '\r']) {
            return Err(ScanError::config("Identifier must be a single line"));
        }
        if let Some(bad) = config.comments.iter().find(|c| c.contains(['\n', '\r'])) {
            return Err(ScanError::config(format!(
                "Comments must be single-line strings, got {bad:?}"
            )));
        }

        config.schema.check(config.kind)?;

        if config.path.exists() && !config.overwrite {
            return Err(ScanError::FileExists { path: config.path });
        }

        Ok(Self { config })
    }

    /// Normalised output path
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Column layout
    pub fn schema(&self) -> &Schema {
        &self.config.schema
    }

    /// Output kind
    pub fn kind(&self) -> OutputKind {
        self.config.kind
    }

    /// Comments written to the file
    pub fn comments(&self) -> &[String] {
        &self.config.comments
    }

    /// Create the output file and write its header.
    pub fn open(self) -> ScanResult<WriterSession> {
        let config = self.config;
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let sink: Box<dyn RowSink> = match (config.kind, &config.schema) {
            #[cfg(feature = "storage_csv")]
            (OutputKind::Text, schema) => Box::new(text::TextSink::create(
                &config.path,
                &config.identifier,
                &config.comments,
                &schema.column_names(),
            )?),
            #[cfg(feature = "storage_arrow")]
            (OutputKind::Binary, Schema::Typed(columns)) => Box::new(ipc::IpcSink::create(
                &config.path,
                &config.identifier,
                &config.comments,
                columns,
            )?),
            (kind, _) => return Err(ScanError::FeatureNotEnabled(kind.feature().to_string())),
        };

        info!(path = %config.path.display(), kind = %config.kind, "Data file opened");
        Ok(WriterSession {
            path: config.path,
            schema: config.schema,
            sink: Some(sink),
            rows: 0,
        })
    }
}

/// Open output file accepting rows
///
/// Closed by [`WriterSession::close`], or on drop with errors logged.
pub struct WriterSession {
    path: PathBuf,
    schema: Schema,
    sink: Option<Box<dyn RowSink>>,
    rows: usize,
}

impl WriterSession {
    /// Validate and persist one row.
    ///
    /// A rejected row leaves the file untouched.
    pub fn write_row(&mut self, row: impl Into<RowData>) -> ScanResult<()> {
        let values = row.into().resolve(&self.schema)?;
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| ScanError::config("Data writer is closed"))?;
        sink.append(&values)?;
        self.rows += 1;
        Ok(())
    }

    /// Rows persisted so far
    pub fn rows_written(&self) -> usize {
        self.rows
    }

    /// Output path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column layout
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Flush and close the file.
    pub fn close(mut self) -> ScanResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> ScanResult<()> {
        match self.sink.take() {
            Some(mut sink) => {
                sink.finish()?;
                debug!(path = %self.path.display(), rows = self.rows, "Data file closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for WriterSession {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(path = %self.path.display(), error = %e, "Failed to close data file");
        }
    }
}
