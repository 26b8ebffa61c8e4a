//! The facade (component H, spec §6.2): the only entry point most callers
//! need. Holds a parsed flow plus repositories and variables, and exposes
//! `run`/`stream` over the scheduler after validating with the static
//! checker.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::Stream;
use serde_json::Value;
use tracing::error;

use crate::blob::{BlobRepository, InMemoryBlobRepository};
use crate::cache::{CacheRepository, InMemoryCacheRepository};
use crate::checker::{self, CheckError};
use crate::error::{Error, Result};
use crate::flow::{ActionConfig, Executable};
use crate::registry::ActionRegistry;
use crate::scheduler::Scheduler;

/// An engine instance: an immutable parsed flow and repository set, paired
/// with a mutable-by-replacement variable bag. `set_vars` returns a new
/// `FlowForge` sharing the same scheduler (and therefore the same task
/// table, subscriber maps and repositories) rather than mutating in place,
/// mirroring the source's "setVars returns a new engine" contract.
#[derive(Clone)]
pub struct FlowForge {
    config: Arc<ActionConfig>,
    scheduler: Scheduler,
    variables: HashMap<String, Value>,
}

impl FlowForge {
    /// Builds a scheduler from a registry and default in-process repos, then
    /// parses `text`. See [`FlowForgeBuilder`] for swapping in persistent
    /// cache/blob backends.
    pub fn from_text(text: &str, registry: Arc<ActionRegistry>) -> Result<Self> {
        FlowForgeBuilder::new(registry).build_from_text(text)
    }

    pub fn from_file(path: impl AsRef<Path>, registry: Arc<ActionRegistry>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        FlowForgeBuilder::new(registry)
            .project_root(project_root_of(path.as_ref()))
            .build_from_text(&text)
    }

    /// Returns a new engine with `vars` merged over the current variable
    /// set, sharing this engine's scheduler and repositories.
    pub fn set_vars(&self, vars: HashMap<String, Value>) -> Self {
        let mut variables = self.variables.clone();
        variables.extend(vars);
        Self { config: self.config.clone(), scheduler: self.scheduler.clone(), variables }
    }

    fn check(&self, target: &str) -> std::result::Result<(), Vec<CheckError>> {
        let variables: HashSet<String> = self.variables.keys().cloned().collect();
        let errors = checker::check(&self.config, &variables, target);
        if errors.is_empty() {
            Ok(())
        } else {
            for e in &errors {
                error!(target, "static check failed: {e}");
            }
            Err(errors)
        }
    }

    fn resolved_target(&self, target: Option<&str>) -> Result<String> {
        match target {
            Some(t) => Ok(t.to_string()),
            None => self
                .config
                .resolved_default_output()
                .ok_or_else(|| Error::UnknownVariable("default_output".to_string())),
        }
    }

    /// Validates consistency, executes the root of `target` (or the default
    /// output), and renders the requested field path out of its result.
    pub async fn run(&self, target: Option<&str>) -> Result<Value> {
        let target = self.resolved_target(target)?;
        self.check(&target).map_err(|mut errors| match errors.remove(0) {
            CheckError::UnknownVariable(id) => Error::UnknownVariable(id),
            CheckError::UnknownDependency(id) => Error::UnknownDependency(id),
        })?;

        let root = target.split('.').next().unwrap_or(&target).to_string();
        let rest: Vec<&str> = target.split('.').skip(1).collect();

        let value = self.run_root(&root).await?;
        index_path(&value, &rest)
    }

    async fn run_root(&self, root: &str) -> Result<Value> {
        match self.config.flow.get(root) {
            Some(Executable::Action(_)) => self
                .scheduler
                .run_action(root, self.variables.clone())
                .await
                .ok_or_else(|| Error::ActionException { action_id: root.to_string(), message: "no output produced".to_string() }),
            Some(Executable::Loop(_)) => {
                let results = self
                    .scheduler
                    .run_loop(root, self.variables.clone())
                    .await
                    .ok_or_else(|| Error::ActionException { action_id: root.to_string(), message: "loop produced no results".to_string() })?;
                let rendered: Vec<Value> = results
                    .into_iter()
                    .map(|map| serde_json::to_value(map).unwrap_or(Value::Null))
                    .collect();
                Ok(Value::Array(rendered))
            }
            None => Err(Error::UnknownVariable(root.to_string())),
        }
    }

    /// Same as [`FlowForge::run`] but yields every partial render of the
    /// target as it streams, rather than only the final value.
    pub fn stream(&self, target: Option<&str>) -> Pin<Box<dyn Stream<Item = Value> + Send>> {
        let this = self.clone();
        let target = target.map(str::to_string);
        Box::pin(async_stream::stream! {
            let target = match this.resolved_target(target.as_deref()) {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "failed to resolve stream target");
                    return;
                }
            };
            if let Err(errors) = this.check(&target) {
                for e in errors {
                    error!("static check failed: {e}");
                }
                return;
            }
            let root = target.split('.').next().unwrap_or(&target).to_string();
            let rest: Vec<String> = target.split('.').skip(1).map(str::to_string).collect();

            match this.config.flow.get(&root) {
                Some(Executable::Action(_)) => {
                    let mut s = this.scheduler.stream_action(root, this.variables.clone(), true, this.config.flow.clone(), String::new());
                    use futures::StreamExt;
                    while let Some(value) = s.next().await {
                        match index_path(&value, &rest.iter().map(String::as_str).collect::<Vec<_>>()) {
                            Ok(v) => yield v,
                            Err(e) => error!(error = %e, "failed to index streamed output"),
                        }
                    }
                }
                Some(Executable::Loop(_)) => {
                    match this.run_root(&root).await {
                        Ok(value) => {
                            match index_path(&value, &rest.iter().map(String::as_str).collect::<Vec<_>>()) {
                                Ok(v) => yield v,
                                Err(e) => error!(error = %e, "failed to index loop output"),
                            }
                        }
                        Err(e) => error!(error = %e, "loop execution failed"),
                    }
                }
                None => error!(root, "unknown target root"),
            }
        })
    }

    /// Cancels every in-flight producer, giving each the same 3-second
    /// grace period an orphaned subscriber would get.
    pub async fn close(&self) {
        self.scheduler.close().await;
    }
}

fn index_path(value: &Value, rest: &[&str]) -> Result<Value> {
    let mut current = value.clone();
    for segment in rest {
        current = match &current {
            Value::Object(map) => map
                .get(*segment)
                .cloned()
                .ok_or_else(|| Error::UnknownVariable(segment.to_string()))?,
            Value::Array(items) => {
                let idx: usize = segment
                    .parse()
                    .map_err(|_| Error::UnknownVariable(segment.to_string()))?;
                items
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| Error::UnknownVariable(segment.to_string()))?
            }
            _ => return Err(Error::UnknownVariable(segment.to_string())),
        };
    }
    Ok(current)
}

fn project_root_of(path: &Path) -> Option<PathBuf> {
    path.parent().map(Path::to_path_buf)
}

/// Builds a [`FlowForge`], letting callers substitute the cache/blob
/// backends and project root before parsing the flow document.
pub struct FlowForgeBuilder {
    registry: Arc<ActionRegistry>,
    cache_repo: Arc<dyn CacheRepository>,
    blob_repo: Arc<dyn BlobRepository>,
    use_cache: bool,
    project_root: Option<PathBuf>,
}

impl FlowForgeBuilder {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            cache_repo: Arc::new(InMemoryCacheRepository::new()),
            blob_repo: Arc::new(InMemoryBlobRepository::new()),
            use_cache: true,
            project_root: None,
        }
    }

    pub fn cache_repo(mut self, repo: Arc<dyn CacheRepository>) -> Self {
        self.cache_repo = repo;
        self
    }

    pub fn blob_repo(mut self, repo: Arc<dyn BlobRepository>) -> Self {
        self.blob_repo = repo;
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn project_root(mut self, root: Option<PathBuf>) -> Self {
        self.project_root = root;
        self
    }

    pub fn build_from_text(self, text: &str) -> Result<FlowForge> {
        let config = Arc::new(ActionConfig::from_yaml(text)?);
        let scheduler = Scheduler::new(
            self.registry,
            self.cache_repo,
            self.blob_repo,
            config.clone(),
            self.use_cache,
            self.project_root,
        );
        Ok(FlowForge { config, scheduler, variables: HashMap::new() })
    }
}
