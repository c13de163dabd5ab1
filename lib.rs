/*!
# oxdef-compiler

Parser and preprocessor for the OX definition language.

OX source text goes in; a pure data tree comes out. All control flow
(`<set>`, `<if>`, `<foreach>`, `<while>`, `<on-data>`), expressions,
`$`-references, tag reuse and multi-file composition are resolved at
preprocessing time, so downstream consumers only ever see literal values.

```no_run
use oxdef_compiler::{Preprocessor, PreprocessorConfiguration};
use oxdef_compiler::transaction::Transaction;

let preprocessor = Preprocessor::new(PreprocessorConfiguration::new());
let transaction = Transaction::new();
let document = spin_on::spin_on(preprocessor.preprocess_source(
    "<set w = 200> [Box (width: (w + 40))]".into(),
    None,
    &transaction,
));
```
*/
#![deny(unsafe_code)]

use core::future::Future;
use core::pin::Pin;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub mod diagnostics;
pub mod docloader;
pub mod expression_tree;
pub mod lexer;
pub mod macros;
pub mod object_tree;
pub mod parser;
pub mod pathutils;
pub mod tagregister;
pub mod transaction;
pub mod walker;

mod passes;

use diagnostics::Result;
use futures::future::LocalBoxFuture;
use macros::MacroSystem;
use object_tree::Document;
use tagregister::TagRegister;
use transaction::Transaction;

/// Defaults for resolving a package found in a module directory.
#[derive(Clone, Debug)]
pub struct PackageDefaults {
    /// Directory inside the package where OX files live
    pub ox_directory: String,
    /// The file a bare package import resolves to
    pub ox_main: String,
    /// Name of the per-package configuration file
    pub config_file: String,
}

impl Default for PackageDefaults {
    fn default() -> Self {
        Self {
            ox_directory: "ox".into(),
            ox_main: "index.ox".into(),
            config_file: "ox.config.json".into(),
        }
    }
}

/// Configures the preprocessor. All fields can be overridden per
/// invocation; the constructor fills in the documented defaults.
#[derive(Clone)]
pub struct PreprocessorConfiguration {
    /// Resolution root: every import/inject must resolve inside it
    pub base_dir: PathBuf,
    /// Where package imports are looked up, in order
    pub module_directories: Vec<PathBuf>,
    pub package_defaults: PackageDefaults,

    /// Callback to read files, tried before the filesystem. The future
    /// resolves to `None` to fall through to the default reader.
    pub open_file_fallback: Option<
        Rc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<std::io::Result<String>>>>>>,
    >,

    /// Per-file size cap in bytes (default 10 MiB)
    pub max_file_size: u64,
    /// Aggregate loaded-content cap in bytes (default 100 MiB)
    pub max_cache_size: u64,
    /// Import/inject nesting cap (default 50)
    pub max_import_depth: usize,
    /// `<while>` iteration cap (default 10 000)
    pub max_while_iterations: usize,
}

impl PreprocessorConfiguration {
    pub fn new() -> Self {
        let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let module_directories = vec![base_dir.join("node_modules")];
        Self {
            base_dir,
            module_directories,
            package_defaults: PackageDefaults::default(),
            open_file_fallback: None,
            max_file_size: 10 * 1024 * 1024,
            max_cache_size: 100 * 1024 * 1024,
            max_import_depth: 50,
            max_while_iterations: 10_000,
        }
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let module_directories = vec![base_dir.join("node_modules")];
        Self { base_dir, module_directories, ..Self::new() }
    }
}

impl Default for PreprocessorConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

/// One preprocessor instance: the shared tag registry, the macro hooks, and
/// the file cache. Reusable across invocations; within one invocation all
/// state is single-owner and mutated only by the running pipeline.
pub struct Preprocessor {
    pub config: PreprocessorConfiguration,
    pub registry: Rc<RefCell<TagRegister>>,
    pub macros: MacroSystem,
    loader: docloader::DocumentLoader,
}

impl Preprocessor {
    pub fn new(config: PreprocessorConfiguration) -> Self {
        let loader = docloader::DocumentLoader::new(config.clone());
        Self {
            config,
            registry: Rc::new(RefCell::new(TagRegister::new())),
            macros: MacroSystem::new(),
            loader,
        }
    }

    /// Parse and preprocess a source string. `path` names the file for
    /// diagnostics and relative import resolution.
    pub async fn preprocess_source(
        &self,
        source: String,
        path: Option<&Path>,
        transaction: &Transaction,
    ) -> Result<Document> {
        let mut document = parser::parse(source, path)?;
        self.preprocess_parsed(&mut document, path.map(Path::to_path_buf), transaction)
            .await?;
        Ok(document)
    }

    /// Read, parse and preprocess a file, honoring the loader's size caps.
    pub async fn preprocess_file(
        &self,
        path: &Path,
        transaction: &Transaction,
    ) -> Result<Document> {
        let path = pathutils::clean_path(path);
        let source = self.loader.read_file(&path).await?;
        let mut document = parser::parse(source, Some(&path))?;
        self.preprocess_parsed(&mut document, Some(path), transaction).await?;
        Ok(document)
    }

    /// The pipeline on an already-parsed document: `on_parse` hook, import
    /// and inject resolution, then the preprocessing passes. Boxed because
    /// `<inject>` re-enters it for the injected file.
    pub(crate) fn preprocess_parsed<'b>(
        &'b self,
        document: &'b mut Document,
        path: Option<PathBuf>,
        transaction: &'b Transaction,
    ) -> LocalBoxFuture<'b, Result<()>> {
        Box::pin(async move {
            if self.macros.run_on_parse(document)? {
                return Ok(());
            }

            self.loader
                .resolve_imports(document, path.as_deref(), &self.registry)
                .await?;

            let mut nodes = std::mem::take(&mut document.nodes);
            let injected =
                self.loader.resolve_injects(self, &mut nodes, path.clone(), transaction).await;
            document.nodes = nodes;
            injected?;

            passes::run_passes(
                document,
                transaction,
                &self.registry,
                &self.macros,
                self.config.max_while_iterations,
            )
            .await
        })
    }
}
