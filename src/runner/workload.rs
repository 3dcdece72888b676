//! Method registries.
//!
//! A [`Workload`] is one kind of run: a named set of work methods plus the
//! run-wide hooks (error handler, deferral options). Calls arrive by method
//! name and are dispatched through the registry; names that were never
//! registered fail closed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::context::JobContext;
use crate::codec::Value;
use crate::error::{Error, Result};
use crate::model::DeferralOptions;

/// A unit of work callable by name.
#[async_trait]
pub trait WorkMethod: Send + Sync {
    async fn call(&self, cx: &JobContext, args: Vec<Value>) -> anyhow::Result<Value>;
}

/// Adapts a synchronous closure that needs no job context.
pub struct FnMethod<F>(pub F);

#[async_trait]
impl<F> WorkMethod for FnMethod<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync,
{
    async fn call(&self, _cx: &JobContext, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(args)
    }
}

/// Converts a work failure into the value recorded in its place.
pub type ErrorHandler = Arc<dyn Fn(&anyhow::Error) -> Value + Send + Sync>;

pub struct Workload {
    kind: String,
    methods: HashMap<String, Arc<dyn WorkMethod>>,
    error_handler: Option<ErrorHandler>,
    deferral_options: DeferralOptions,
    record_return_values: bool,
}

impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        methods.sort_unstable();
        f.debug_struct("Workload")
            .field("kind", &self.kind)
            .field("methods", &methods)
            .field("error_handler", &self.error_handler.is_some())
            .field("deferral_options", &self.deferral_options)
            .finish()
    }
}

impl Workload {
    pub fn builder(kind: impl Into<String>) -> WorkloadBuilder {
        WorkloadBuilder {
            kind: kind.into(),
            methods: Vec::new(),
            error_handler: None,
            deferral_options: DeferralOptions::default(),
            record_return_values: false,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Result<Arc<dyn WorkMethod>> {
        self.methods
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownMethod(format!("{}::{name}", self.kind)))
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn error_handler(&self) -> Option<&ErrorHandler> {
        self.error_handler.as_ref()
    }

    /// Options used by `deferred_result` when none are given.
    pub fn deferral_options(&self) -> &DeferralOptions {
        &self.deferral_options
    }

    /// Default for runners of this kind.
    pub fn record_return_values(&self) -> bool {
        self.record_return_values
    }
}

pub struct WorkloadBuilder {
    kind: String,
    methods: Vec<(String, Arc<dyn WorkMethod>)>,
    error_handler: Option<ErrorHandler>,
    deferral_options: DeferralOptions,
    record_return_values: bool,
}

impl WorkloadBuilder {
    pub fn method(mut self, name: impl Into<String>, method: impl WorkMethod + 'static) -> Self {
        self.methods.push((name.into(), Arc::new(method)));
        self
    }

    /// Register a synchronous closure as a method.
    pub fn function<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.method(name, FnMethod(f))
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&anyhow::Error) -> Value + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn deferral_options(mut self, options: DeferralOptions) -> Self {
        self.deferral_options = options;
        self
    }

    pub fn record_return_values(mut self, record: bool) -> Self {
        self.record_return_values = record;
        self
    }

    /// Validate names and build the registry.
    pub fn build(self) -> Result<Workload> {
        if self.kind.trim().is_empty() {
            return Err(Error::Registration("workload kind is empty".to_string()));
        }
        let mut methods = HashMap::with_capacity(self.methods.len());
        for (name, method) in self.methods {
            if name.trim().is_empty() {
                return Err(Error::Registration(format!("{}: empty method name", self.kind)));
            }
            if methods.insert(name.clone(), method).is_some() {
                return Err(Error::Registration(format!(
                    "{}: method {name} registered twice",
                    self.kind
                )));
            }
        }
        Ok(Workload {
            kind: self.kind,
            methods,
            error_handler: self.error_handler,
            deferral_options: self.deferral_options,
            record_return_values: self.record_return_values,
        })
    }
}

/// Workloads indexed by kind.
#[derive(Debug, Default)]
pub struct WorkloadRegistry {
    workloads: HashMap<String, Arc<Workload>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, workload: Workload) -> Result<Arc<Workload>> {
        if self.workloads.contains_key(workload.kind()) {
            return Err(Error::Registration(format!(
                "workload {} registered twice",
                workload.kind()
            )));
        }
        let workload = Arc::new(workload);
        self.workloads
            .insert(workload.kind().to_string(), Arc::clone(&workload));
        Ok(workload)
    }

    pub fn get(&self, kind: &str) -> Result<Arc<Workload>> {
        self.workloads
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownRunner(kind.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: Vec<Value>) -> anyhow::Result<Value> {
        Ok(Value::Nil)
    }

    #[test]
    fn rejects_empty_and_duplicate_names() {
        let empty = Workload::builder("w").function("", noop).build();
        assert!(matches!(empty, Err(Error::Registration(_))));

        let dup = Workload::builder("w")
            .function("a", noop)
            .function("a", noop)
            .build();
        assert!(matches!(dup, Err(Error::Registration(msg)) if msg.contains("twice")));

        assert!(matches!(Workload::builder(" ").build(), Err(Error::Registration(_))));
    }

    #[test]
    fn unknown_names_fail_closed() {
        let mut registry = WorkloadRegistry::new();
        let workload = registry
            .register(Workload::builder("w").function("a", noop).build().unwrap())
            .unwrap();

        assert!(workload.method("a").is_ok());
        assert!(matches!(workload.method("b"), Err(Error::UnknownMethod(_))));
        assert!(matches!(registry.get("other"), Err(Error::UnknownRunner(_))));

        let again = Workload::builder("w").build().unwrap();
        assert!(matches!(registry.register(again), Err(Error::Registration(_))));
    }
}
