//! Source locations and the preprocessor error type.
//!
//! Lexing and parsing fail fast: the first fault aborts with a location.
//! Preprocessing errors carry a kind from the taxonomy below, the location of
//! the offending node, an optional suggestion, and an optional underlying
//! cause.

use std::path::{Path, PathBuf};
use std::rc::Rc;

/// An error location within a file, as a byte offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub offset: usize,
}

impl Span {
    pub fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub fn is_valid(&self) -> bool {
        self.offset != usize::MAX
    }
}

impl Default for Span {
    fn default() -> Self {
        Span { offset: usize::MAX }
    }
}

/// Returns a span. This is implemented for tokens and nodes.
pub trait Spanned {
    fn span(&self) -> Span;
    fn source_file(&self) -> Option<&SourceFile>;
    fn to_source_location(&self) -> SourceLocation {
        SourceLocation { source_file: self.source_file().cloned(), span: self.span() }
    }
}

pub struct SourceFileInner {
    path: PathBuf,

    /// Complete source code of the path, used to map from offset to line number
    source: Option<String>,

    /// The offset of each linebreak
    line_offsets: once_cell::unsync::OnceCell<Vec<usize>>,
}

impl std::fmt::Debug for SourceFileInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.path)
    }
}

impl Default for SourceFileInner {
    fn default() -> Self {
        Self { path: PathBuf::new(), source: None, line_offsets: Default::default() }
    }
}

impl SourceFileInner {
    pub fn new(path: PathBuf, source: String) -> Self {
        Self { path, source: Some(source), line_offsets: Default::default() }
    }

    /// Create a SourceFile that has just a path, but no contents
    pub fn from_path_only(path: PathBuf) -> SourceFile {
        Rc::new(Self { path, ..Default::default() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Returns a tuple with the line and column number, both starting at 1
    pub fn line_column(&self, offset: usize) -> (usize, usize) {
        let line_offsets = self.line_offsets();
        line_offsets.binary_search(&offset).map_or_else(
            |line| {
                if line == 0 {
                    (1, offset + 1)
                } else {
                    let line_begin = *line_offsets.get(line - 1).unwrap_or(&0);
                    (line + 1, offset - line_begin + 1)
                }
            },
            |line| (line + 2, 1),
        )
    }

    fn line_offsets(&self) -> &[usize] {
        self.line_offsets.get_or_init(|| {
            self.source
                .as_ref()
                .map(|s| {
                    s.bytes()
                        .enumerate()
                        // The offset one past the '\n' is the first char of the new line
                        .filter_map(|(i, c)| (c == b'\n').then(|| i + 1))
                        .collect()
                })
                .unwrap_or_default()
        })
    }
}

pub type SourceFile = Rc<SourceFileInner>;

#[derive(Debug, Clone, Default)]
pub struct SourceLocation {
    pub source_file: Option<SourceFile>,
    pub span: Span,
}

impl SourceLocation {
    /// Line/column pair for diagnostics, or (0, 0) when the span is unknown
    pub fn line_column(&self) -> (usize, usize) {
        if !self.span.is_valid() {
            return (0, 0);
        }
        match &self.source_file {
            Some(sf) => sf.line_column(self.span.offset),
            None => (0, 0),
        }
    }
}

impl Spanned for SourceLocation {
    fn span(&self) -> Span {
        self.span.clone()
    }

    fn source_file(&self) -> Option<&SourceFile> {
        self.source_file.as_ref()
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(sf) = &self.source_file {
            let (line, col) = self.line_column();
            write!(f, "{}:{line}:{col}", sf.path().display())
        } else {
            write!(f, "<unknown>")
        }
    }
}

/// The kinds of faults the lexer, parser and preprocessor can report.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    // Lexical
    #[error("Unterminated string literal")]
    UnterminatedString,
    #[error("Unterminated free-text block")]
    UnterminatedFreeText,
    #[error("Unexpected character '{0}'")]
    UnexpectedCharacter(char),

    // Syntactic
    #[error("Syntax error: {0}")]
    SyntaxError(String),
    #[error("<inject> is not allowed in this position")]
    MisplacedInject,

    // Tags
    #[error("Tag '{0}' is not defined")]
    UndefinedTag(String),
    #[error("Tag '{0}' is already defined")]
    DuplicateTagDefinition(String),
    #[error("Invalid tag definition '{key}': {reason}")]
    InvalidTagDefinition { key: String, reason: String },
    #[error("Invalid use of tag '{key}': {reason}")]
    InvalidTagInstance { key: String, reason: String },
    #[error("Tag '{0}' does not accept children")]
    TagInstanceWithChildren(String),
    #[error("Tag definition '{0}' must not contain expression properties")]
    TagDefinitionWithExpression(String),
    #[error("A block composing multiple tags must not declare its own properties")]
    TagCompositionWithProperties,
    #[error("A block composing multiple tags must not declare its own children")]
    TagCompositionWithChildren,
    #[error("A block cannot mix tag definitions and tag instances")]
    MixedTagTypes,
    #[error("A block cannot carry more than one tag definition")]
    MultipleTagDefinitions,
    #[error("Tag definition '{0}' not found")]
    TagDefinitionNotFound(String),
    #[error("Circular tag dependency: {0}")]
    CircularTagDependency(String),
    #[error("Module property '{property}' of tag '{tag}' conflicts with an existing property")]
    ModulePropertyConflict { tag: String, property: String },

    // Data sources
    #[error("Data source '{0}' is not registered")]
    UndefinedDataSource(String),
    #[error("Failed to fetch data source '{source_name}': {message}")]
    FetchError { source_name: String, message: String },
    #[error("Circular data source dependency: {0}")]
    CircularDataSourceDependency(String),
    #[error("Data source '{0}' was never executed")]
    DataSourceNotExecuted(String),

    // Expressions
    #[error("Variable '{0}' is not defined")]
    UndefinedVariable(String),
    #[error("Cannot access property '{0}' of null")]
    NullPropertyAccess(String),
    #[error("Cannot convert '{0}' to a number")]
    InvalidNumberConversion(String),
    #[error("Unresolved '$' reference")]
    UnresolvedReference,
    #[error("Unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("Expected a property name after '.'")]
    ExpectedPropertyName,

    // References
    #[error("No sibling block named '{0}'")]
    BlockNotFound(String),
    #[error("Block has no parent")]
    NoParentBlock,
    #[error("Block has no property '{0}'")]
    PropertyNotFound(String),
    #[error("Index access on a value that is not an array")]
    InvalidIndexAccess,
    #[error("Reference does not resolve to a value")]
    IncompleteReference,
    #[error("Invalid reference: {0}")]
    InvalidReference(String),
    #[error("Block is not in the reference registry")]
    BlockNotInRegistry,

    // Templates
    #[error("'{0}' is not an array and cannot be iterated")]
    InvalidForeachCollection(String),
    #[error("<while> exceeded the maximum of {0} iterations")]
    MaxIterationsExceeded(usize),

    // Macros
    #[error("Macro error: {0}")]
    MacroError(String),

    // Project / multi-file
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("File '{path}' is {size} bytes, exceeding the limit of {limit}")]
    FileTooLarge { path: String, size: u64, limit: u64 },
    #[error("Aggregate loaded content exceeds the cache limit of {0} bytes")]
    CacheExceeded(u64),
    #[error("File '{0}' does not have the .ox extension")]
    InvalidExtension(String),
    #[error("Path '{0}' contains an illegal character")]
    InvalidPathCharacter(String),
    #[error("Path '{0}' resolves outside the project base directory")]
    PathEscapesBase(String),
    #[error("Circular dependency: {0}")]
    CircularImport(String),
    #[error("Import depth exceeds the maximum of {0}")]
    ImportDepthExceeded(usize),
    #[error("Invalid import alias '{0}'")]
    InvalidAlias(String),
    #[error("'{0}' is a reserved word and cannot be used as an import alias")]
    ReservedAlias(String),
    #[error("I/O error on '{path}': {message}")]
    Io { path: String, message: String },
}

/// An error produced while lexing, parsing or preprocessing OX source.
#[derive(Debug)]
pub struct CompilerError {
    pub kind: ErrorKind,
    pub location: SourceLocation,
    pub suggestion: Option<String>,
    pub cause: Option<Box<CompilerError>>,
}

impl CompilerError {
    pub fn new(kind: ErrorKind, location: SourceLocation) -> Self {
        Self { kind, location, suggestion: None, cause: None }
    }

    pub fn without_location(kind: ErrorKind) -> Self {
        Self::new(kind, SourceLocation::default())
    }

    pub fn at(kind: ErrorKind, node: &dyn Spanned) -> Self {
        Self::new(kind, node.to_source_location())
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_cause(mut self, cause: CompilerError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Line/column pair of the error, or (0, 0) if unknown
    pub fn line_column(&self) -> (usize, usize) {
        self.location.line_column()
    }
}

impl std::fmt::Display for CompilerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.location.source_file.is_some() {
            write!(f, "{}: {}", self.location, self.kind)?;
        } else {
            write!(f, "{}", self.kind)?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({suggestion})")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, "\n  caused by: {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompilerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

pub type Result<T> = std::result::Result<T, CompilerError>;
