/*!
 Multi-file loading: `<import>` merges another file's tag definitions into
 the shared registry, `<inject>` splices another file's independently
 preprocessed blocks into the tree.

 A single stack of `(path, kind)` entries guards both directives:
 re-entering a path anywhere on the stack is a circular dependency, and the
 stack is bounded to keep deep-but-acyclic chains in check. Loaded files are
 parsed once and cached by canonical path.
*/

use crate::diagnostics::{CompilerError, ErrorKind, Result, SourceLocation};
use crate::object_tree::{
    clone_block, clone_nodes, create_key, Document, ImportNode, Node, TagKind,
};
use crate::pathutils;
use crate::tagregister::TagRegister;
use crate::transaction::Transaction;
use crate::{Preprocessor, PreprocessorConfiguration};
use futures::future::LocalBoxFuture;
use itertools::Itertools;
use serde::Deserialize;
use smol_str::SmolStr;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DependencyKind {
    Import,
    Inject,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Import => write!(f, "import"),
            DependencyKind::Inject => write!(f, "inject"),
        }
    }
}

/// Storage for the cache of all loaded documents.
#[derive(Default)]
struct LoadedDocuments {
    /// canonical file name → parsed raw AST
    docs: HashMap<PathBuf, Rc<Document>>,
    /// files whose own imports were already routed into the registry
    imports_processed: HashSet<PathBuf>,
    /// the processing stack; doubles as the cycle detector
    currently_loading: Vec<(PathBuf, DependencyKind)>,
    /// aggregate size of all loaded content
    total_loaded: u64,
}

/// A package inside a module directory is a mini-project: its
/// `ox.config.json` names the directory its OX sources live in.
#[derive(Deserialize, Default)]
struct PackageConfig {
    source: Option<String>,
}

const RESERVED_ALIASES: &[&str] = &[
    "set", "if", "elseif", "else", "foreach", "while", "on-data", "on-error", "import",
    "inject", "this", "parent", "error", "true", "false", "null", "in", "as",
];

const MAX_ALIAS_LENGTH: usize = 50;

pub struct DocumentLoader {
    config: PreprocessorConfiguration,
    documents: RefCell<LoadedDocuments>,
}

impl DocumentLoader {
    pub fn new(config: PreprocessorConfiguration) -> Self {
        Self { config, documents: Default::default() }
    }

    /// Read a file through the configured fallback or the filesystem,
    /// enforcing the per-file and aggregate size caps.
    pub(crate) async fn read_file(&self, path: &Path) -> Result<String> {
        let io_error = |e: std::io::Error| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CompilerError::without_location(ErrorKind::FileNotFound(
                    path.display().to_string(),
                ))
            } else {
                CompilerError::without_location(ErrorKind::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        let contents = if let Some(fallback) = &self.config.open_file_fallback {
            match fallback(path.to_string_lossy().into_owned()).await {
                Some(result) => result.map_err(io_error)?,
                None => std::fs::read_to_string(path).map_err(io_error)?,
            }
        } else {
            std::fs::read_to_string(path).map_err(io_error)?
        };

        let size = contents.len() as u64;
        if size > self.config.max_file_size {
            return Err(CompilerError::without_location(ErrorKind::FileTooLarge {
                path: path.display().to_string(),
                size,
                limit: self.config.max_file_size,
            }));
        }
        {
            let mut documents = self.documents.borrow_mut();
            documents.total_loaded += size;
            if documents.total_loaded > self.config.max_cache_size {
                return Err(CompilerError::without_location(ErrorKind::CacheExceeded(
                    self.config.max_cache_size,
                )));
            }
        }
        Ok(contents)
    }

    /// Resolve an import/inject spec to a canonical path inside the project
    /// base directory.
    pub(crate) fn resolve_spec(
        &self,
        spec: &str,
        referencing: Option<&Path>,
        location: &SourceLocation,
    ) -> Result<PathBuf> {
        if pathutils::has_illegal_characters(spec) {
            return Err(CompilerError::new(
                ErrorKind::InvalidPathCharacter(spec.to_string()),
                location.clone(),
            ));
        }

        let candidate = if pathutils::is_relative_spec(spec) {
            let base = referencing
                .and_then(Path::parent)
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.config.base_dir.clone());
            base.join(spec)
        } else {
            self.resolve_package(spec, location)?
        };

        if !pathutils::has_ox_extension(&candidate) {
            return Err(CompilerError::new(
                ErrorKind::InvalidExtension(spec.to_string()),
                location.clone(),
            ));
        }

        // Symlinks are resolved here; the real path must stay inside baseDir
        let canonical = dunce::canonicalize(&candidate).map_err(|_| {
            CompilerError::new(ErrorKind::FileNotFound(spec.to_string()), location.clone())
        })?;
        let base = dunce::canonicalize(&self.config.base_dir)
            .unwrap_or_else(|_| self.config.base_dir.clone());
        if !canonical.starts_with(&base) {
            return Err(CompilerError::new(
                ErrorKind::PathEscapesBase(spec.to_string()),
                location.clone(),
            ));
        }
        Ok(canonical)
    }

    /// `@scope/pkg/file.ox`, `pkg/file.ox` or bare `pkg` resolved through
    /// the module directories.
    fn resolve_package(&self, spec: &str, location: &SourceLocation) -> Result<PathBuf> {
        let mut segments = spec.split('/');
        let mut package = segments.next().unwrap_or_default().to_string();
        if package.starts_with('@') {
            match segments.next() {
                Some(second) => package = format!("{package}/{second}"),
                None => {
                    return Err(CompilerError::new(
                        ErrorKind::FileNotFound(spec.to_string()),
                        location.clone(),
                    ));
                }
            }
        }
        let rest: PathBuf = segments.collect();
        let rest = if rest.as_os_str().is_empty() {
            PathBuf::from(&self.config.package_defaults.ox_main)
        } else {
            rest
        };

        for module_dir in &self.config.module_directories {
            let package_dir = module_dir.join(&package);
            if !package_dir.is_dir() {
                continue;
            }
            let source_dir = self.package_source_dir(&package_dir, location)?;
            let candidate = source_dir.join(&rest);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(CompilerError::new(ErrorKind::FileNotFound(spec.to_string()), location.clone()))
    }

    /// The package's source directory, from its `ox.config.json` or the
    /// defaults. The source directory must not escape the package.
    fn package_source_dir(&self, package_dir: &Path, location: &SourceLocation) -> Result<PathBuf> {
        let config_path = package_dir.join(&self.config.package_defaults.config_file);
        let package_config: PackageConfig = if config_path.is_file() {
            let text = std::fs::read_to_string(&config_path).map_err(|e| {
                CompilerError::new(
                    ErrorKind::Io {
                        path: config_path.display().to_string(),
                        message: e.to_string(),
                    },
                    location.clone(),
                )
            })?;
            serde_json::from_str(&text).map_err(|e| {
                CompilerError::new(
                    ErrorKind::Io {
                        path: config_path.display().to_string(),
                        message: format!("invalid package config: {e}"),
                    },
                    location.clone(),
                )
            })?
        } else {
            PackageConfig::default()
        };

        let source = package_config
            .source
            .unwrap_or_else(|| self.config.package_defaults.ox_directory.clone());
        let source_dir = package_dir.join(source);
        let canonical = dunce::canonicalize(&source_dir).unwrap_or(source_dir);
        let package_canonical =
            dunce::canonicalize(package_dir).unwrap_or_else(|_| package_dir.to_path_buf());
        if !canonical.starts_with(&package_canonical) {
            return Err(CompilerError::new(
                ErrorKind::PathEscapesBase(canonical.display().to_string()),
                location.clone(),
            ));
        }
        Ok(canonical)
    }

    fn push_stack(
        &self,
        path: &Path,
        kind: DependencyKind,
        location: &SourceLocation,
    ) -> Result<()> {
        let mut documents = self.documents.borrow_mut();
        if documents.currently_loading.iter().any(|(p, _)| p == path) {
            let chain = documents
                .currently_loading
                .iter()
                .map(|(p, _)| p.display().to_string())
                .chain(std::iter::once(path.display().to_string()))
                .join(" → ");
            return Err(CompilerError::new(ErrorKind::CircularImport(chain), location.clone()));
        }
        if documents.currently_loading.len() >= self.config.max_import_depth {
            return Err(CompilerError::new(
                ErrorKind::ImportDepthExceeded(self.config.max_import_depth),
                location.clone(),
            ));
        }
        documents.currently_loading.push((path.to_path_buf(), kind));
        Ok(())
    }

    fn pop_stack(&self, path: &Path) {
        let mut documents = self.documents.borrow_mut();
        let popped = documents.currently_loading.pop();
        debug_assert!(popped.is_some_and(|(p, _)| p == path));
    }

    /// Parse a file once, cached by canonical path.
    async fn load_parsed(&self, path: &Path) -> Result<Rc<Document>> {
        if let Some(doc) = self.documents.borrow().docs.get(path) {
            return Ok(doc.clone());
        }
        let source = self.read_file(path).await?;
        let doc = Rc::new(crate::parser::parse(source, Some(path))?);
        self.documents.borrow_mut().docs.insert(path.to_path_buf(), doc.clone());
        Ok(doc)
    }

    /// Resolve every top-level `<import>` of `document`: load the file,
    /// route its `@tag` definitions into the shared registry, and drop the
    /// import node from the tree.
    pub(crate) async fn resolve_imports(
        &self,
        document: &mut Document,
        referencing: Option<&Path>,
        register: &Rc<RefCell<TagRegister>>,
    ) -> Result<()> {
        let imports: Vec<ImportNode> = document.imports().cloned().collect();
        document.nodes.retain(|n| !matches!(n, Node::Import(_)));
        for import in imports {
            self.load_import(&import, referencing, register).await?;
        }
        Ok(())
    }

    fn load_import<'b>(
        &'b self,
        import: &'b ImportNode,
        referencing: Option<&'b Path>,
        register: &'b Rc<RefCell<TagRegister>>,
    ) -> LocalBoxFuture<'b, Result<()>> {
        Box::pin(async move {
            if let Some(alias) = &import.alias {
                validate_alias(alias, &import.location)?;
            }

            let path = self.resolve_spec(&import.path, referencing, &import.location)?;
            self.push_stack(&path, DependencyKind::Import, &import.location)?;
            let result = self.import_loaded(import, &path, register).await;
            self.pop_stack(&path);
            result
        })
    }

    async fn import_loaded(
        &self,
        import: &ImportNode,
        path: &Path,
        register: &Rc<RefCell<TagRegister>>,
    ) -> Result<()> {
        let doc = self.load_parsed(path).await?;

        // The imported file's own imports contribute definitions once
        let first_visit = self.documents.borrow_mut().imports_processed.insert(path.to_path_buf());
        if first_visit {
            for nested in doc.imports().cloned().collect::<Vec<_>>() {
                self.load_import(&nested, Some(path), register).await?;
            }
        }

        for block in doc.blocks() {
            let definition_tag = {
                let b = block.borrow();
                b.tags.iter().find(|t| t.kind == TagKind::Definition).cloned()
            };
            let Some(tag) = definition_tag else { continue };

            let registered = clone_block(block);
            registered.borrow_mut().tags.clear();
            let key = match &import.alias {
                Some(alias) => create_key(
                    &format!("{alias}.{}", tag.name),
                    tag.argument.as_deref(),
                ),
                None => tag.key(),
            };
            register.borrow_mut().register_imported(key, registered);
        }
        Ok(())
    }

    /// Replace every `<inject>` among `nodes` (recursively, block children
    /// included) with the injected file's preprocessed blocks, keeping the
    /// ordering with the surrounding siblings.
    pub(crate) fn resolve_injects<'b>(
        &'b self,
        preprocessor: &'b Preprocessor,
        nodes: &'b mut Vec<Node>,
        referencing: Option<PathBuf>,
        transaction: &'b Transaction,
    ) -> LocalBoxFuture<'b, Result<()>> {
        Box::pin(async move {
            let mut result = Vec::with_capacity(nodes.len());
            for node in nodes.drain(..) {
                match node {
                    Node::Inject(inject) => {
                        let path = self.resolve_spec(
                            &inject.path,
                            referencing.as_deref(),
                            &inject.location,
                        )?;
                        self.push_stack(&path, DependencyKind::Inject, &inject.location)?;
                        let injected = self.inject_loaded(preprocessor, &path, transaction).await;
                        self.pop_stack(&path);
                        result.extend(injected?);
                    }
                    Node::Block(block) => {
                        let mut children = std::mem::take(&mut block.borrow_mut().children);
                        self.resolve_injects(
                            preprocessor,
                            &mut children,
                            referencing.clone(),
                            transaction,
                        )
                        .await?;
                        block.borrow_mut().children = children;
                        result.push(Node::Block(block));
                    }
                    mut other => {
                        for body in template_bodies_mut(&mut other) {
                            self.resolve_injects(
                                preprocessor,
                                body,
                                referencing.clone(),
                                transaction,
                            )
                            .await?;
                        }
                        result.push(other);
                    }
                }
            }
            *nodes = result;
            Ok(())
        })
    }

    /// Load, parse and independently preprocess the injected file in a
    /// clone of the current transaction; return its blocks for splicing.
    async fn inject_loaded(
        &self,
        preprocessor: &Preprocessor,
        path: &Path,
        transaction: &Transaction,
    ) -> Result<Vec<Node>> {
        let parsed = self.load_parsed(path).await?;
        let mut document = Document { nodes: clone_nodes(&parsed.nodes) };
        let injected_txn = transaction.clone_transaction();
        preprocessor
            .preprocess_parsed(&mut document, Some(path.to_path_buf()), &injected_txn)
            .await?;
        Ok(document.nodes)
    }
}

fn template_bodies_mut(node: &mut Node) -> Vec<&mut Vec<Node>> {
    match node {
        Node::If(n) => {
            let mut out = vec![&mut n.then_body];
            for (_, body) in n.elseifs.iter_mut() {
                out.push(body);
            }
            out.push(&mut n.else_body);
            out
        }
        Node::Foreach(n) => vec![&mut n.body],
        Node::While(n) => vec![&mut n.body],
        Node::OnData(n) => vec![&mut n.on_success, &mut n.on_error],
        _ => vec![],
    }
}

fn validate_alias(alias: &SmolStr, location: &SourceLocation) -> Result<()> {
    if alias.is_empty()
        || alias.len() > MAX_ALIAS_LENGTH
        || !alias.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
        || !alias.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CompilerError::new(
            ErrorKind::InvalidAlias(alias.to_string()),
            location.clone(),
        ));
    }
    if RESERVED_ALIASES.contains(&alias.as_str()) {
        return Err(CompilerError::new(
            ErrorKind::ReservedAlias(alias.to_string()),
            location.clone(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_tree::{Literal, Value};

    #[test]
    fn dependency_loading() {
        let fixture_dir: PathBuf =
            [env!("CARGO_MANIFEST_DIR"), "tests", "docloader"].iter().collect();
        let preprocessor = crate::Preprocessor::new(
            crate::PreprocessorConfiguration::with_base_dir(&fixture_dir),
        );
        let transaction = Transaction::new();
        let doc = spin_on::spin_on(
            preprocessor.preprocess_file(&fixture_dir.join("dependency_main.ox"), &transaction),
        )
        .unwrap();

        let blocks: Vec<_> = doc.blocks().cloned().collect();
        let ids: Vec<_> = blocks
            .iter()
            .map(|b| b.borrow().id.as_deref().unwrap().to_string())
            .collect();
        assert_eq!(ids, ["Confirm", "Badge", "Footer"]);

        // Plain import: definition property inherited, instance override kept
        let confirm = blocks[0].borrow();
        assert_eq!(
            confirm.properties.get("width"),
            Some(&Value::Literal(Literal::Number(80.0)))
        );
        assert_eq!(
            confirm.properties.get("label"),
            Some(&Value::Literal(Literal::String("go".into())))
        );

        // Aliased import reachable through the namespaced key
        assert_eq!(
            blocks[1].borrow().properties.get("pad"),
            Some(&Value::Literal(Literal::Number(4.0)))
        );

        // Injected file was preprocessed independently
        assert_eq!(
            blocks[2].borrow().properties.get("height"),
            Some(&Value::Literal(Literal::Number(20.0)))
        );
        assert!(transaction.variable("h").is_none());
    }

    #[test]
    fn alias_validation() {
        let loc = SourceLocation::default();
        assert!(validate_alias(&"ui".into(), &loc).is_ok());
        assert!(validate_alias(&"ui_widgets-2".into(), &loc).is_ok());
        assert!(matches!(
            validate_alias(&"2ui".into(), &loc).unwrap_err().kind,
            ErrorKind::InvalidAlias(_)
        ));
        assert!(matches!(
            validate_alias(&"a".repeat(51).as_str().into(), &loc).unwrap_err().kind,
            ErrorKind::InvalidAlias(_)
        ));
        assert!(matches!(
            validate_alias(&"foreach".into(), &loc).unwrap_err().kind,
            ErrorKind::ReservedAlias(_)
        ));
    }
}
