/*!
 The transaction: the mutable context of one preprocessing run.

 It holds the variables templates read and write, the host-supplied
 expression functions, the registered data sources, and the caches of
 data-source results and failures.
*/

use crate::diagnostics::{CompilerError, ErrorKind, Result, SourceLocation};
use crate::expression_tree::EvalValue;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use smol_str::SmolStr;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type HostFunction = Rc<dyn Fn(&[EvalValue]) -> std::result::Result<EvalValue, String>>;

/// A registered data source: an async callable producing a value or an
/// error message.
pub type DataSourceCallable =
    Rc<dyn Fn() -> LocalBoxFuture<'static, std::result::Result<EvalValue, String>>>;

#[derive(Clone, Debug)]
pub struct TransactionConfig {
    pub timeout: Duration,
    pub strict: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(5000), strict: false }
    }
}

/// A cached data-source failure: what `<on-error>` sees as `$error`.
#[derive(Clone, Debug)]
pub struct FetchFailure {
    pub message: String,
    pub source: SmolStr,
    pub timestamp: SystemTime,
}

impl FetchFailure {
    pub fn code(&self) -> &'static str {
        "FETCH_ERROR"
    }

    pub fn to_eval_value(&self) -> EvalValue {
        let mut object = indexmap::IndexMap::new();
        object.insert("message".to_string(), EvalValue::String(self.message.clone()));
        object.insert("code".to_string(), EvalValue::String(self.code().into()));
        object.insert("source".to_string(), EvalValue::String(self.source.to_string()));
        object.insert(
            "timestamp".to_string(),
            EvalValue::Number(
                self.timestamp.duration_since(UNIX_EPOCH).map_or(0.0, |d| d.as_secs_f64()),
            ),
        );
        EvalValue::Object(object)
    }

    pub fn to_error(&self) -> CompilerError {
        CompilerError::new(
            ErrorKind::FetchError { source_name: self.source.to_string(), message: self.message.clone() },
            SourceLocation::default(),
        )
    }
}

#[derive(Default)]
pub struct Transaction {
    variables: RefCell<HashMap<SmolStr, EvalValue>>,
    functions: RefCell<HashMap<SmolStr, HostFunction>>,
    data_sources: RefCell<HashMap<SmolStr, DataSourceCallable>>,
    results: RefCell<HashMap<SmolStr, EvalValue>>,
    errors: RefCell<HashMap<SmolStr, FetchFailure>>,
    pub config: TransactionConfig,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TransactionConfig) -> Self {
        Self { config, ..Default::default() }
    }

    pub fn set_variable(&self, name: impl Into<SmolStr>, value: EvalValue) {
        self.variables.borrow_mut().insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<EvalValue> {
        self.variables.borrow().get(name).cloned()
    }

    pub fn remove_variable(&self, name: &str) {
        self.variables.borrow_mut().remove(name);
    }

    pub fn variable_names(&self) -> Vec<SmolStr> {
        self.variables.borrow().keys().cloned().collect()
    }

    /// Snapshot the current bindings of `names` so a scoped construct can
    /// restore them on exit.
    pub fn save_bindings(&self, names: &[SmolStr]) -> Vec<(SmolStr, Option<EvalValue>)> {
        names.iter().map(|n| (n.clone(), self.variable(n))).collect()
    }

    /// Restore bindings saved by [`Self::save_bindings`]; a name that was
    /// unbound before is unbound again.
    pub fn restore_bindings(&self, saved: Vec<(SmolStr, Option<EvalValue>)>) {
        for (name, value) in saved {
            match value {
                Some(v) => self.set_variable(name, v),
                None => self.remove_variable(&name),
            }
        }
    }

    pub fn register_function(
        &self,
        name: impl Into<SmolStr>,
        f: impl Fn(&[EvalValue]) -> std::result::Result<EvalValue, String> + 'static,
    ) {
        self.functions.borrow_mut().insert(name.into(), Rc::new(f));
    }

    pub fn function(&self, name: &str) -> Option<HostFunction> {
        self.functions.borrow().get(name).cloned()
    }

    pub fn register_data_source<F, Fut>(&self, name: impl Into<SmolStr>, f: F)
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = std::result::Result<EvalValue, String>> + 'static,
    {
        self.data_sources
            .borrow_mut()
            .insert(name.into(), Rc::new(move || f().boxed_local()));
    }

    /// The wrapper form: the callable is produced from the transaction
    /// itself, immediately at registration time.
    pub fn register_data_source_with(
        &self,
        name: impl Into<SmolStr>,
        wrapper: impl FnOnce(&Transaction) -> DataSourceCallable,
    ) {
        let callable = wrapper(self);
        self.data_sources.borrow_mut().insert(name.into(), callable);
    }

    pub fn has_data_source(&self, name: &str) -> bool {
        self.data_sources.borrow().contains_key(name)
    }

    /// Fetch one data source, racing it against the transaction timeout.
    /// Results and failures are cached; a second fetch never re-runs the
    /// callable.
    pub async fn fetch(&self, name: &str) -> Result<EvalValue> {
        if let Some(cached) = self.results.borrow().get(name) {
            return Ok(cached.clone());
        }
        if let Some(failure) = self.errors.borrow().get(name) {
            return Err(failure.to_error());
        }
        let source = self.data_sources.borrow().get(name).cloned().ok_or_else(|| {
            CompilerError::without_location(ErrorKind::UndefinedDataSource(name.to_string()))
        })?;

        // The timeout future owns the timer; it is dropped (and the timer
        // with it) on every path out of here.
        let outcome = tokio::time::timeout(self.config.timeout, source()).await;

        match outcome {
            Ok(Ok(value)) => {
                self.results.borrow_mut().insert(name.into(), value.clone());
                Ok(value)
            }
            Ok(Err(message)) => {
                let failure =
                    FetchFailure { message, source: name.into(), timestamp: SystemTime::now() };
                self.errors.borrow_mut().insert(name.into(), failure.clone());
                Err(failure.to_error())
            }
            Err(_elapsed) => {
                let failure = FetchFailure {
                    message: format!(
                        "data source '{name}' timed out after {}ms",
                        self.config.timeout.as_millis()
                    ),
                    source: name.into(),
                    timestamp: SystemTime::now(),
                };
                self.errors.borrow_mut().insert(name.into(), failure.clone());
                Err(failure.to_error())
            }
        }
    }

    /// Fetch all named sources in parallel with a settle-all policy:
    /// partial failures are captured per source and never abort the batch.
    pub async fn fetch_many(&self, names: &[SmolStr]) -> Vec<(SmolStr, Result<EvalValue>)> {
        futures::future::join_all(
            names.iter().map(|name| async move { (name.clone(), self.fetch(name).await) }),
        )
        .await
    }

    pub fn is_successful(&self, name: &str) -> bool {
        self.results.borrow().contains_key(name)
    }

    pub fn get_data(&self, name: &str) -> Option<EvalValue> {
        self.results.borrow().get(name).cloned()
    }

    pub fn get_error(&self, name: &str) -> Option<FetchFailure> {
        self.errors.borrow().get(name).cloned()
    }

    pub fn was_executed(&self, name: &str) -> bool {
        self.is_successful(name) || self.get_error(name).is_some()
    }

    /// An independent transaction with the same callables and copies of the
    /// variables and both caches.
    pub fn clone_transaction(&self) -> Transaction {
        Transaction {
            variables: RefCell::new(self.variables.borrow().clone()),
            functions: RefCell::new(self.functions.borrow().clone()),
            data_sources: RefCell::new(self.data_sources.borrow().clone()),
            results: RefCell::new(self.results.borrow().clone()),
            errors: RefCell::new(self.errors.borrow().clone()),
            config: self.config.clone(),
        }
    }
}
