//! The Action Contract (spec §3.3) and the type/schema layer (component B).
//!
//! Concrete actions implement the generic, non-object-safe [`Action`] trait;
//! the scheduler only ever holds an `Arc<dyn DynAction>`, obtained for free
//! through the blanket [`DynAction`] impl below. This mirrors the teacher's
//! pattern of wrapping a generic, ergonomic trait behind a type-erased one
//! for storage in a registry.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::blob::BlobRepository;
use crate::error::{Error, Result};

/// Whether an action returns one record or streams zero-or-more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionShape {
    SingleShot,
    Streaming,
}

/// A reflection-light descriptor of an action type, replacing the teacher's
/// metaclass-populated registry entry with an explicit, inert struct.
#[derive(Debug, Clone)]
pub struct ActionDescriptor {
    pub name: &'static str,
    pub cache: bool,
    pub version: Option<i64>,
    pub shape: ExecutionShape,
}

/// Values injected into an input record at invocation time, outside of the
/// declared expression fields. Populated by the scheduler, consumed by the
/// mix-in setter methods on [`ActionInputs`].
#[derive(Clone, Default)]
pub struct InvocationContext {
    pub default_model: Option<Value>,
    pub blob_repo: Option<Arc<dyn BlobRepository>>,
    pub redis_url: Option<String>,
    pub finished: bool,
}

/// Marker + mix-in trait for an action's declared input record. Default
/// methods are all no-ops; an input struct opts into a mix-in by overriding
/// both the `wants_*` flag and the matching setter, the Rust analogue of the
/// Python input mix-in base classes in `asyncflows.models.io`.
pub trait ActionInputs: DeserializeOwned + Send + Sync + 'static {
    fn wants_default_model() -> bool {
        false
    }
    fn set_default_model(&mut self, _model: Value) {}

    fn wants_blob_repo() -> bool {
        false
    }
    fn set_blob_repo(&mut self, _repo: Arc<dyn BlobRepository>) {}

    fn wants_redis_url() -> bool {
        false
    }
    fn set_redis_url(&mut self, _url: Option<String>) {}

    fn wants_final_invocation() -> bool {
        false
    }
    fn set_finished(&mut self, _finished: bool) {}
}

/// Mix-in trait for an action's declared output record.
pub trait ActionOutputs: Serialize + Send + Sync + 'static {
    /// Cache-control output mix-in: false suppresses writing this particular
    /// result to the cache repository even though the action type caches.
    fn cache_enabled(&self) -> bool {
        true
    }

    /// Default-output output mix-in: the dotted field rendered when a target
    /// path stops at this record's id.
    fn default_output_field() -> Option<&'static str> {
        None
    }
}

/// The generic Action Contract. `run` is used for single-shot actions,
/// `run_streaming` for streaming ones; `shape()` tells the scheduler which to call.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    type Inputs: ActionInputs;
    type Outputs: ActionOutputs;

    fn name() -> &'static str
    where
        Self: Sized;

    fn cache() -> bool
    where
        Self: Sized,
    {
        true
    }

    fn version() -> Option<i64>
    where
        Self: Sized,
    {
        None
    }

    fn shape() -> ExecutionShape
    where
        Self: Sized,
    {
        ExecutionShape::SingleShot
    }

    async fn run(&self, inputs: Self::Inputs) -> Result<Self::Outputs> {
        let _ = inputs;
        unreachable!("single-shot actions must override run()")
    }

    fn run_streaming(
        &self,
        inputs: Self::Inputs,
    ) -> Pin<Box<dyn Stream<Item = Result<Self::Outputs>> + Send + '_>> {
        let _ = inputs;
        unreachable!("streaming actions must override run_streaming()")
    }
}

/// Type-erased form of [`Action`], the only interface the scheduler uses.
#[async_trait]
pub trait DynAction: Send + Sync {
    fn descriptor(&self) -> ActionDescriptor;

    /// Invokes the action against an untyped input document, returning every
    /// output it produces (one for single-shot, zero-or-more for streaming)
    /// as JSON, paired with whether each output wants to be cached.
    async fn invoke(
        &self,
        inputs: Value,
        ctx: InvocationContext,
    ) -> Result<Vec<(Value, bool)>>;

    fn default_output_field(&self) -> Option<&'static str>;

    /// Whether this action's declared input record opts into the
    /// final-invocation mix-in (re-invoked once after its input stream ends).
    fn wants_final_invocation(&self) -> bool;
}

struct ActionWrapper<A>(A);

#[async_trait]
impl<A: Action> DynAction for ActionWrapper<A> {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor {
            name: A::name(),
            cache: A::cache(),
            version: A::version(),
            shape: A::shape(),
        }
    }

    async fn invoke(&self, inputs: Value, ctx: InvocationContext) -> Result<Vec<(Value, bool)>> {
        let mut typed: A::Inputs = serde_json::from_value(inputs).map_err(|source| {
            Error::InputValidation { action_id: A::name().to_string(), source }
        })?;

        if A::Inputs::wants_default_model() {
            if let Some(model) = ctx.default_model.clone() {
                typed.set_default_model(model);
            }
        }
        if A::Inputs::wants_blob_repo() {
            if let Some(repo) = ctx.blob_repo.clone() {
                typed.set_blob_repo(repo);
            }
        }
        if A::Inputs::wants_redis_url() {
            typed.set_redis_url(ctx.redis_url.clone());
        }
        if A::Inputs::wants_final_invocation() {
            typed.set_finished(ctx.finished);
        }

        match A::shape() {
            ExecutionShape::SingleShot => {
                let outputs = self.0.run(typed).await?;
                let cache_enabled = outputs.cache_enabled();
                Ok(vec![(serde_json::to_value(outputs)?, cache_enabled)])
            }
            ExecutionShape::Streaming => {
                let mut results = Vec::new();
                let mut produced = self.0.run_streaming(typed);
                while let Some(item) = produced.next().await {
                    let outputs = item?;
                    let cache_enabled = outputs.cache_enabled();
                    results.push((serde_json::to_value(outputs)?, cache_enabled));
                }
                Ok(results)
            }
        }
    }

    fn default_output_field(&self) -> Option<&'static str> {
        A::Outputs::default_output_field()
    }

    fn wants_final_invocation(&self) -> bool {
        A::Inputs::wants_final_invocation()
    }
}

/// Wraps a concrete [`Action`] for storage in the [`crate::registry::ActionRegistry`].
pub fn boxed<A: Action>(action: A) -> Arc<dyn DynAction> {
    Arc::new(ActionWrapper(action))
}

/// A one-shot stream helper for actions that only ever emit a single value,
/// used by streaming actions defined in terms of a `Vec` of outputs.
pub fn stream_of<O: ActionOutputs>(
    items: Vec<Result<O>>,
) -> Pin<Box<dyn Stream<Item = Result<O>> + Send + 'static>>
where
    O: 'static,
{
    Box::pin(stream::iter(items))
}

/// A blank input/output record for actions that take/produce nothing.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Empty {}

impl ActionInputs for Empty {}
impl ActionOutputs for Empty {}

pub(crate) type InputSpec = HashMap<String, crate::value::Expression>;
