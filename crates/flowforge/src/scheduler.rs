//! The scheduler (component F, the heart of the engine): lazy execution,
//! dependency fan-in, streaming fan-out, pub/sub per task, caching, loops,
//! cancellation and timeouts. Grounded directly on
//! `asyncflows.services.action_service.ActionService` — the method names
//! below (minus the `stream_`/`run_` prefix redundancy Rust's `Stream`
//! return type already signals) map 1:1 onto that class's methods.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::action::InvocationContext;
use crate::blob::{contains_expired_blobs, BlobRepository};
use crate::cache::CacheRepository;
use crate::config::RedisConfig;
use crate::error::{Error, Result};
use crate::flow::{ActionConfig, ActionInvocation, Executable, ExecutableId, FlowConfig};
use crate::registry::ActionRegistry;
use crate::value::{Dependency, Expression, RenderContext};

const GRACE_PERIOD: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
enum Broadcast {
    Output(Value),
    Sentinel,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Broadcast>,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<String, JoinHandle<()>>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    new_listeners: HashMap<String, HashSet<u64>>,
}

struct Inner {
    registry: Arc<ActionRegistry>,
    cache_repo: Arc<dyn CacheRepository>,
    blob_repo: Arc<dyn BlobRepository>,
    config: Arc<ActionConfig>,
    use_cache: bool,
    project_root: Option<PathBuf>,
    state: Mutex<SchedulerState>,
    next_subscriber_id: AtomicU64,
}

/// The engine's pub/sub, lazy-streaming task runner. Cheaply `Clone`-able;
/// every clone shares the same task table, subscriber maps and repositories.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<ActionRegistry>,
        cache_repo: Arc<dyn CacheRepository>,
        blob_repo: Arc<dyn BlobRepository>,
        config: Arc<ActionConfig>,
        use_cache: bool,
        project_root: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                cache_repo,
                blob_repo,
                config,
                use_cache,
                project_root,
                state: Mutex::new(SchedulerState::default()),
                next_subscriber_id: AtomicU64::new(0),
            }),
        }
    }

    /// Number of producer tasks still in flight; used by the cancellation
    /// quiescence property (spec §8 property 9).
    pub fn active_task_count(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Releases nothing by itself (repositories and temp directories are
    /// owned by the facade) but cancels every in-flight producer, giving
    /// each the same 3-second grace period an orphaned subscriber would.
    pub async fn close(&self) {
        let task_ids: Vec<String> = self.inner.state.lock().tasks.keys().cloned().collect();
        for task_id in task_ids {
            self.finish_producer(&task_id).await;
        }
    }

    fn latest_mtime(&self) -> i64 {
        let Some(root) = &self.inner.project_root else {
            return 0;
        };
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter_map(|m| m.modified().ok())
            .filter_map(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .max()
            .unwrap_or(0)
    }

    fn default_output_map(&self, flow: &FlowConfig) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for (id, executable) in flow {
            if let Executable::Action(invocation) = executable {
                if let Ok(action) = self.inner.registry.get(&invocation.action) {
                    if let Some(field) = action.default_output_field() {
                        map.insert(id.clone(), field.to_string());
                    }
                }
            }
        }
        map
    }

    fn render_context(&self, flow: &FlowConfig, variables: HashMap<String, Value>) -> RenderContext {
        RenderContext { variables, default_outputs: self.default_output_map(flow) }
    }

    // ---- subscriber bookkeeping ----

    fn subscribe(&self, task_id: &str) -> (u64, mpsc::UnboundedReceiver<Broadcast>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock();
        state.subscribers.entry(task_id.to_string()).or_default().push(Subscriber { id, tx });
        state.new_listeners.entry(task_id.to_string()).or_default().insert(id);
        (id, rx)
    }

    fn remove_subscriber(&self, task_id: &str, subscriber_id: u64) {
        let mut state = self.inner.state.lock();
        if let Some(subs) = state.subscribers.get_mut(task_id) {
            subs.retain(|s| s.id != subscriber_id);
        }
        if let Some(listeners) = state.new_listeners.get_mut(task_id) {
            listeners.remove(&subscriber_id);
        }
    }

    fn broadcast(&self, task_id: &str, outputs: Broadcast) {
        let state = self.inner.state.lock();
        if let Some(subs) = state.subscribers.get(task_id) {
            for sub in subs {
                let _ = sub.tx.send(outputs.clone());
            }
        }
    }

    fn broadcast_to_new_listeners(&self, task_id: &str, outputs: Value) {
        let state = self.inner.state.lock();
        let Some(listener_ids) = state.new_listeners.get(task_id) else { return };
        let Some(subs) = state.subscribers.get(task_id) else { return };
        for sub in subs {
            if listener_ids.contains(&sub.id) {
                let _ = sub.tx.send(Broadcast::Output(outputs.clone()));
            }
        }
    }

    /// Waits up to 3 seconds for a producer to finish on its own, then
    /// cancels it. Safe to call more than once: a producer that already
    /// removed itself from the task table is a no-op.
    async fn finish_producer(&self, task_id: &str) {
        let handle = self.inner.state.lock().tasks.remove(task_id);
        if let Some(mut handle) = handle {
            tokio::select! {
                _ = &mut handle => {}
                _ = tokio::time::sleep(GRACE_PERIOD) => {
                    warn!(task_id, "producer did not finish within grace period, cancelling");
                    handle.abort();
                }
            }
        }
    }

    // ---- producer protocol (§4.4) ----

    #[instrument(skip(self, variables, flow))]
    async fn run_and_broadcast_action(
        &self,
        action_id: &str,
        task_id: &str,
        variables: HashMap<String, Value>,
        flow: FlowConfig,
        task_prefix: String,
    ) {
        let Some(Executable::Action(action_config)) = flow.get(action_id).cloned() else {
            error!(action_id, "not an action");
            return;
        };
        let Ok(action) = self.inner.registry.get(&action_config.action) else {
            error!(action = action_config.action, "unknown action type");
            return;
        };
        let descriptor = action.descriptor();

        let hardcoded_cache_key = match self
            .resolve_cache_key(&action_config, &variables, &flow, &task_prefix)
            .await
        {
            Ok(key) => key,
            Err(_) => {
                error!("failed to create cache key");
                return;
            }
        };

        if let Some(key) = &hardcoded_cache_key {
            if let Some(outputs) = self.check_cache(&action_config.action, descriptor.cache, descriptor.version, key).await {
                self.broadcast(task_id, Broadcast::Output(outputs));
                return;
            }
        }

        let mut last_inputs: Option<Value> = None;
        let mut last_output: Option<Value> = None;
        let mut last_cache_enabled = true;
        let mut cache_hit = false;
        let mut last_cache_key: Option<String> = None;

        let mut inputs_stream = self.stream_input_dependencies(&action_config, variables.clone(), flow.clone(), task_prefix.clone());
        while let Some(event) = inputs_stream.next().await {
            let InputEvent::Value(inputs) = event else {
                debug!("input dependency stream stalled, aborting producer");
                return;
            };
            cache_hit = false;

            let cache_key = match &hardcoded_cache_key {
                Some(k) => k.clone(),
                None => stable_key(&inputs),
            };
            if let Some(outputs) = self.check_cache(&action_config.action, descriptor.cache, descriptor.version, &cache_key).await {
                cache_hit = true;
                last_cache_key = Some(cache_key);
                last_output = Some(outputs.clone());
                self.broadcast(task_id, Broadcast::Output(outputs));
                last_inputs = Some(inputs);
                continue;
            }
            last_cache_key = Some(cache_key);

            let ctx = self.build_invocation_context(&variables, &flow, false).await;
            match action.invoke(inputs.clone(), ctx).await {
                Ok(results) => {
                    for (outputs, cache_enabled) in results {
                        last_output = Some(outputs.clone());
                        last_cache_enabled = cache_enabled;
                        self.broadcast(task_id, Broadcast::Output(outputs));
                    }
                }
                Err(Error::InputValidation { action_id, source }) => {
                    warn!(action_id, %source, "invalid inputs, skipping iteration");
                }
                Err(e) => {
                    error!(error = %e, "action exception");
                    self.broadcast(task_id, Broadcast::Output(Value::Null));
                }
            }
            last_inputs = Some(inputs);
        }

        if let Some(inputs) = last_inputs.clone() {
            if action.wants_final_invocation() {
                info!("running action with final invocation flag");
                let ctx = self.build_invocation_context(&variables, &flow, true).await;
                match action.invoke(inputs, ctx).await {
                    Ok(results) => {
                        for (outputs, cache_enabled) in results {
                            last_output = Some(outputs.clone());
                            last_cache_enabled = cache_enabled;
                            self.broadcast(task_id, Broadcast::Output(outputs));
                        }
                    }
                    Err(e) => error!(error = %e, "final invocation exception"),
                }
            }
        }

        if self.inner.use_cache
            && !cache_hit
            && descriptor.cache
            && last_cache_enabled
        {
            if let (Some(outputs), Some(key)) = (&last_output, &last_cache_key) {
                let bytes = match serde_json::to_vec(outputs) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize outputs for caching");
                        return;
                    }
                };
                if let Err(e) = self
                    .inner
                    .cache_repo
                    .store(&action_config.action, key, bytes, descriptor.version, self.latest_mtime(), None)
                    .await
                {
                    warn!(error = %e, "cache store error");
                }
            }
        }

        if let Some(outputs) = last_output {
            self.broadcast_to_new_listeners(task_id, outputs);
        }
    }

    async fn build_invocation_context(
        &self,
        variables: &HashMap<String, Value>,
        flow: &FlowConfig,
        finished: bool,
    ) -> InvocationContext {
        let default_model_ctx = self.render_context(flow, variables.clone());
        let mut rendered_model = serde_json::Map::new();
        for (key, expr) in &self.inner.config.default_model {
            if let Ok(value) = expr.render(&default_model_ctx).await {
                rendered_model.insert(key.clone(), value);
            }
        }
        InvocationContext {
            default_model: Some(Value::Object(rendered_model)),
            blob_repo: Some(self.inner.blob_repo.clone()),
            redis_url: RedisConfig::from_env().url(),
            finished,
        }
    }

    async fn check_cache(&self, action_name: &str, cache_enabled: bool, version: Option<i64>, key: &str) -> Option<Value> {
        if !self.inner.use_cache || !cache_enabled {
            return None;
        }
        let bytes = match self
            .inner
            .cache_repo
            .retrieve(action_name, key, version, self.latest_mtime())
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cache retrieve error");
                None
            }
        }?;
        let outputs: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "cache hit but outputs invalid");
                return None;
            }
        };
        if contains_expired_blobs(&self.inner.blob_repo, &outputs).await {
            info!("cache hit but blobs expired");
            return None;
        }
        info!("cache hit");
        Some(outputs)
    }

    async fn resolve_cache_key(
        &self,
        action_config: &ActionInvocation,
        variables: &HashMap<String, Value>,
        flow: &FlowConfig,
        task_prefix: &str,
    ) -> Result<Option<String>> {
        let Some(cache_key_expr) = &action_config.cache_key else {
            return Ok(None);
        };
        let dependencies = cache_key_expr.dependencies()?;
        if dependencies.is_empty() {
            let ctx = self.render_context(flow, variables.clone());
            let rendered = cache_key_expr.render(&ctx).await?;
            return Ok(Some(to_key_string(&rendered)));
        }

        // The open question of "what if the stream emits multiple values" is
        // resolved the way the source resolves it: the last rendered value wins.
        let mut resolved = None;
        let mut deps_stream = self.stream_dependencies(dependencies, variables.clone(), flow.clone(), task_prefix.to_string());
        while let Some(event) = deps_stream.next().await {
            let MergeEvent::Partial(dep_outputs) = event else {
                return Err(Error::MergeStall { task_id: format!("{task_prefix}cache_key") });
            };
            let mut merged = dep_outputs;
            merged.extend(variables.clone());
            let ctx = self.render_context(flow, merged);
            let rendered = cache_key_expr.render(&ctx).await?;
            resolved = Some(to_key_string(&rendered));
        }
        Ok(resolved)
    }

    // ---- §4.3 streaming action protocol ----

    #[instrument(skip(self, variables, flow))]
    pub fn stream_action(
        &self,
        action_id: String,
        variables: HashMap<String, Value>,
        partial: bool,
        flow: FlowConfig,
        task_prefix: String,
    ) -> Pin<Box<dyn Stream<Item = Value> + Send>> {
        let scheduler = self.clone();
        let task_id = format!("{task_prefix}{action_id}");

        Box::pin(stream! {
            let (subscriber_id, mut rx) = scheduler.subscribe(&task_id);

            let owns_producer = {
                let mut state = scheduler.inner.state.lock();
                if state.tasks.contains_key(&task_id) {
                    false
                } else {
                    let scheduler2 = scheduler.clone();
                    let action_id2 = action_id.clone();
                    let task_id2 = task_id.clone();
                    let variables2 = variables.clone();
                    let flow2 = flow.clone();
                    let task_prefix2 = task_prefix.clone();
                    let handle = tokio::spawn(async move {
                        scheduler2.run_and_broadcast_action(&action_id2, &task_id2, variables2, flow2, task_prefix2).await;
                        debug!(task_id = %task_id2, "broadcasting end of stream");
                        scheduler2.broadcast(&task_id2, Broadcast::Sentinel);
                        scheduler2.inner.state.lock().tasks.remove(&task_id2);
                    });
                    state.tasks.insert(task_id.clone(), handle);
                    true
                }
            };

            let timeout = Duration::from_secs_f64(scheduler.inner.config.action_timeout.max(0.0));
            let mut last_outputs: Option<Value> = None;
            loop {
                match tokio::time::timeout(timeout, rx.recv()).await {
                    Err(_) => {
                        error!(task_id = %task_id, "timed out waiting for action output");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Broadcast::Sentinel)) => {
                        if last_outputs.is_none() {
                            error!(task_id = %task_id, "action task ended without yielding outputs");
                        }
                        break;
                    }
                    Ok(Some(Broadcast::Output(value))) => {
                        last_outputs = Some(value.clone());
                        if partial {
                            yield value;
                        }
                    }
                }
            }
            if !partial {
                if let Some(value) = last_outputs {
                    yield value;
                }
            }

            scheduler.remove_subscriber(&task_id, subscriber_id);
            if owns_producer {
                scheduler.finish_producer(&task_id).await;
            }
        })
    }

    pub async fn run_action(&self, action_id: &str, variables: HashMap<String, Value>) -> Option<Value> {
        let mut stream = self.stream_action(action_id.to_string(), variables, false, self.inner.config.flow.clone(), String::new());
        let mut last = None;
        while let Some(v) = stream.next().await {
            last = Some(v);
        }
        last
    }

    // ---- §4.4 loop protocol ----

    #[instrument(skip(self, variables, flow))]
    pub async fn stream_loop(
        &self,
        loop_id: &str,
        variables: HashMap<String, Value>,
        partial: bool,
        flow: FlowConfig,
        task_prefix: String,
    ) -> Option<Vec<HashMap<ExecutableId, Value>>> {
        if partial {
            warn!(loop_id, "streaming outputs from a loop is not yet supported, running to completion");
        }

        let Some(Executable::Loop(loop_def)) = flow.get(loop_id).cloned() else {
            error!(loop_id, "not a loop");
            return None;
        };

        let dependencies = loop_def.iterable.dependencies().ok()?;
        let mut dep_outputs = HashMap::new();
        let mut deps_stream = self.stream_dependencies(dependencies, variables.clone(), flow.clone(), task_prefix.clone());
        let mut stalled = true;
        while let Some(event) = deps_stream.next().await {
            match event {
                MergeEvent::Partial(map) => {
                    dep_outputs = map;
                    stalled = false;
                }
                MergeEvent::Stall => {
                    stalled = true;
                }
            }
        }
        if stalled && dep_outputs.is_empty() {
            return None;
        }

        let mut context = dep_outputs;
        context.extend(variables.clone());
        let render_ctx = self.render_context(&flow, context);
        let looped_value = loop_def.iterable.render(&render_ctx).await.ok()?;
        let Value::Array(items) = looped_value else {
            error!(loop_id, "looped variable is not iterable");
            return None;
        };

        let mut merged_flow = flow.clone();
        merged_flow.extend(loop_def.flow.clone());
        let inner_ids: HashSet<ExecutableId> = loop_def.flow.keys().cloned().collect();
        let dependency_set: HashSet<Dependency> = inner_ids.iter().map(|id| (id.clone(), true)).collect();

        let mut handles = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            let mut loop_variables = variables.clone();
            loop_variables.insert(loop_def.for_var.clone(), item);
            let new_task_prefix = format!("{task_prefix}{loop_id}[{i}].");
            let scheduler = self.clone();
            let merged_flow = merged_flow.clone();
            let dependency_set = dependency_set.clone();
            handles.push(tokio::spawn(async move {
                let mut stream = scheduler.stream_executable_tasks(dependency_set, loop_variables, merged_flow, new_task_prefix);
                let mut last = None;
                while let Some(event) = stream.next().await {
                    match event {
                        MergeEvent::Partial(map) => last = Some(map),
                        MergeEvent::Stall => return None,
                    }
                }
                last
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Some(map)) => results.push(map),
                _ => {
                    error!(loop_id, "loop stream ended with sentinel");
                    return None;
                }
            }
        }
        Some(results)
    }

    pub async fn run_loop(&self, loop_id: &str, variables: HashMap<String, Value>) -> Option<Vec<HashMap<ExecutableId, Value>>> {
        self.stream_loop(loop_id, variables, false, self.inner.config.flow.clone(), String::new()).await
    }

    // ---- §4.4 dependency fan-in ----

    pub fn stream_input_dependencies(
        &self,
        action_config: &ActionInvocation,
        variables: HashMap<String, Value>,
        flow: FlowConfig,
        task_prefix: String,
    ) -> Pin<Box<dyn Stream<Item = InputEvent> + Send>> {
        let scheduler = self.clone();
        let input_spec = action_config.inputs.clone();
        let dependencies: HashSet<Dependency> = input_spec
            .values()
            .filter_map(|e| e.dependencies().ok())
            .flatten()
            .collect();

        Box::pin(stream! {
            if dependencies.is_empty() {
                let ctx = scheduler.render_context(&flow, variables.clone());
                match render_fields(&input_spec, &ctx).await {
                    Ok(value) => yield InputEvent::Value(value),
                    Err(e) => warn!(error = %e, "invalid inputs"),
                }
                return;
            }

            let mut deps_stream = scheduler.stream_dependencies(dependencies.clone(), variables.clone(), flow.clone(), task_prefix.clone());
            while let Some(event) = deps_stream.next().await {
                match event {
                    MergeEvent::Stall => {
                        yield InputEvent::Sentinel;
                        return;
                    }
                    MergeEvent::Partial(dep_outputs) => {
                        let mut merged = dep_outputs;
                        merged.extend(variables.clone());
                        let ctx = scheduler.render_context(&flow, merged);
                        match render_fields(&input_spec, &ctx).await {
                            Ok(value) => yield InputEvent::Value(value),
                            Err(e) => warn!(error = %e, "invalid inputs"),
                        }
                    }
                }
            }
        })
    }

    pub fn stream_dependencies(
        &self,
        dependencies: HashSet<Dependency>,
        variables: HashMap<String, Value>,
        flow: FlowConfig,
        task_prefix: String,
    ) -> Pin<Box<dyn Stream<Item = MergeEvent> + Send>> {
        let mut variables = variables;
        let executable_dependencies: HashSet<Dependency> =
            dependencies.iter().filter(|(id, _)| flow.contains_key(id)).cloned().collect();
        let extra_ids: HashSet<String> = dependencies
            .iter()
            .filter(|d| !executable_dependencies.contains(*d) && !variables.contains_key(&d.0))
            .map(|(id, _)| id.clone())
            .collect();
        if !extra_ids.is_empty() {
            error!(?extra_ids, "unknown dependencies, replacing with null");
            for id in extra_ids {
                variables.insert(id, Value::Null);
            }
        }
        self.stream_executable_tasks(executable_dependencies, variables, flow, task_prefix)
    }

    pub fn stream_executable_tasks(
        &self,
        dependencies: HashSet<Dependency>,
        variables: HashMap<String, Value>,
        flow: FlowConfig,
        task_prefix: String,
    ) -> Pin<Box<dyn Stream<Item = MergeEvent> + Send>> {
        let scheduler = self.clone();

        Box::pin(stream! {
            if dependencies.is_empty() {
                yield MergeEvent::Partial(HashMap::new());
                return;
            }

            let mut ids_partial: HashMap<String, bool> = HashMap::new();
            for (id, stream_flag) in &dependencies {
                let entry = ids_partial.entry(id.clone()).or_insert(true);
                if !stream_flag {
                    *entry = false;
                }
            }
            let ids: Vec<String> = ids_partial.keys().cloned().collect();

            let (tx, mut rx) = mpsc::unbounded_channel::<(String, Option<Value>)>();
            let mut handles = Vec::new();
            for id in &ids {
                let partial = ids_partial[id];
                let scheduler = scheduler.clone();
                let flow = flow.clone();
                let variables = variables.clone();
                let task_prefix = task_prefix.clone();
                let id = id.clone();
                let tx = tx.clone();
                handles.push(tokio::spawn(async move {
                    let executable = flow.get(&id).cloned();
                    let mut emitted = false;
                    match executable {
                        Some(Executable::Action(_)) => {
                            let mut s = scheduler.stream_action(id.clone(), variables, partial, flow, task_prefix);
                            while let Some(value) = s.next().await {
                                emitted = true;
                                let _ = tx.send((id.clone(), Some(value)));
                            }
                        }
                        Some(Executable::Loop(_)) => {
                            if let Some(results) = scheduler.stream_loop(&id, variables, partial, flow, task_prefix).await {
                                emitted = true;
                                let value = serde_json::to_value(results).unwrap_or(Value::Null);
                                let _ = tx.send((id.clone(), Some(value)));
                            }
                        }
                        None => {}
                    }
                    if !emitted {
                        let _ = tx.send((id, None));
                    }
                }));
            }
            drop(tx);

            let mut current: HashMap<String, Value> = HashMap::new();
            let total = ids.len();
            while let Some((id, value)) = rx.recv().await {
                current.insert(id, value.unwrap_or(Value::Null));
                if current.len() == total {
                    yield MergeEvent::Partial(current.clone());
                }
            }
            for handle in handles {
                let _ = handle.await;
            }
            if current.len() != total {
                error!(missing = total - current.len(), "not all dependency tasks completed");
                yield MergeEvent::Stall;
            }
        })
    }
}

#[derive(Debug, Clone)]
pub enum InputEvent {
    Value(Value),
    Sentinel,
}

#[derive(Debug, Clone)]
pub enum MergeEvent {
    Partial(HashMap<ExecutableId, Value>),
    Stall,
}

async fn render_fields(fields: &HashMap<String, Expression>, ctx: &RenderContext) -> Result<Value> {
    let mut map = serde_json::Map::new();
    for (name, expr) in fields {
        map.insert(name.clone(), expr.render(ctx).await?);
    }
    Ok(Value::Object(map))
}

fn to_key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A stable serialisation of an inputs record used as a soft cache key when
/// no explicit `cache_key` expression was supplied.
fn stable_key(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
