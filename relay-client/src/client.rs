//! Request/response reconciliation over a fire-and-forget substrate.
//!
//! `query` is a synchronous dryrun: exactly one reply is expected. `mutate`
//! submits a signed message and then, in an independently retried phase,
//! tries to observe its result. A write whose result cannot be observed was
//! still accepted, so that case is a partial success (`MutateOutcome::Submitted`)
//! rather than an error.

use std::sync::Arc;

use chrono::Utc;
use relay_types::{Payload, PendingWrite, ProcessResult, RequestData, TagMap, STATUS_OK};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheReader;
use crate::codec;
use crate::config::{ClientConfig, ConfigHandle};
use crate::error::{CallContext, RelayError};
use crate::http::HttpSubstrate;
use crate::poller::ConvergencePoller;
use crate::retry::{RetryError, DEFAULT_MAX_ATTEMPTS};
use crate::selector::{self, SelectError};
use crate::substrate::{
    OutgoingMessage, SharedSigner, SharedSubstrate, SpawnMessage, SubstrateError,
};

/// One call against a process.
#[derive(Debug, Clone)]
pub struct RemoteCallRequest {
    pub process_id: String,
    /// Injected as the `Action` tag; wins over a caller-supplied one.
    pub action: Option<String>,
    pub tags: TagMap,
    pub data: Option<RequestData>,
    /// Attempts per phase, at least one.
    pub retries: u32,
    pub signer: Option<SharedSigner>,
    /// Read identity; falls back to the configured identity.
    pub owner: Option<String>,
    pub cancel: CancellationToken,
}

impl RemoteCallRequest {
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            action: None,
            tags: TagMap::new(),
            data: None,
            retries: DEFAULT_MAX_ATTEMPTS,
            signer: None,
            owner: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name, value);
        self
    }

    pub fn tags(mut self, tags: TagMap) -> Self {
        self.tags = tags;
        self
    }

    pub fn data(mut self, data: impl Into<RequestData>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn signer(mut self, signer: SharedSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn cancel_on(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Tags as they go on the wire, `Action` included.
    pub fn wire_tags(&self) -> TagMap {
        codec::with_action(&self.tags, self.action.as_deref())
    }
}

/// A request to create a process.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Falls back to the configured scheduler.
    pub scheduler: Option<String>,
    /// Falls back to the configured module.
    pub module: Option<String>,
    pub tags: TagMap,
    pub data: Option<RequestData>,
    pub retries: Option<u32>,
    pub signer: Option<SharedSigner>,
    pub cancel: CancellationToken,
}

/// Decoded reply to a call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallResponse {
    /// Message id for writes; `None` for reads.
    pub id: Option<String>,
    pub tags: TagMap,
    pub data: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutateOutcome {
    /// Result observed and accepted.
    Completed(CallResponse),
    /// Write accepted, result not observed. Re-query to learn the effect.
    Submitted(PendingWrite),
}

impl MutateOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Completed(response) => response.id.as_deref().unwrap_or_default(),
            Self::Submitted(pending) => &pending.message_id,
        }
    }

    pub fn response(&self) -> Option<&CallResponse> {
        match self {
            Self::Completed(response) => Some(response),
            Self::Submitted(_) => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

#[derive(Clone)]
pub struct RelayClient {
    config: ConfigHandle,
    substrate: SharedSubstrate,
    cache: CacheReader,
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl RelayClient {
    pub fn new(config: ConfigHandle, substrate: SharedSubstrate, cache: CacheReader) -> Self {
        Self {
            config,
            substrate,
            cache,
        }
    }

    /// HTTP substrate and cache reader over `config`.
    pub fn over_http(config: ClientConfig) -> Result<Self, SubstrateError> {
        Ok(Self::new(
            ConfigHandle::new(config),
            Arc::new(HttpSubstrate::new()?),
            CacheReader::new()?,
        ))
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn cache(&self) -> &CacheReader {
        &self.cache
    }

    /// Read-only evaluation. Exactly one result message is expected.
    pub async fn query(&self, request: RemoteCallRequest) -> Result<CallResponse, RelayError> {
        let config = self.config.snapshot();
        let tags = request.wire_tags();
        let mut context = new_context(&request.process_id, &tags)
            .with_request(request.data.as_ref(), request.retries);
        check_tags(&tags, &context)?;

        let message = OutgoingMessage {
            process_id: request.process_id.clone(),
            tags: codec::encode(&tags),
            data: request.data.clone(),
        };
        let owner = request
            .owner
            .clone()
            .unwrap_or_else(|| config.identity.clone());
        debug!(
            call_id = %context.call_id,
            process_id = %request.process_id,
            action = ?context.action,
            owner = %owner,
            "evaluating query"
        );

        let substrate = &self.substrate;
        let (config_ref, message_ref, owner_ref) = (&*config, &message, owner.as_str());
        let result = config
            .retry_policy(request.retries)
            .execute("query.evaluate", &request.cancel, move |_| {
                substrate.evaluate(config_ref, message_ref, owner_ref)
            })
            .await
            .map_err(|err| match err {
                RetryError::Exhausted { attempts, last } => RelayError::EvaluateFailed {
                    attempts,
                    source: last,
                    context: Box::new(context.clone()),
                },
                RetryError::Cancelled { .. } => RelayError::Cancelled {
                    context: Some(Box::new(context.clone())),
                },
            })?;

        context.raw_response = serde_json::to_value(&result).ok();
        if let Some(error) = result.error_text() {
            return Err(RelayError::RemoteExecution {
                error,
                context: Box::new(context),
            });
        }

        let reply = selector::select_single(&result.messages)
            .map_err(|err| select_error(err, &context))?;
        let decoded = codec::decode_message(reply);
        check_status(&decoded.tags, &context)?;

        Ok(CallResponse {
            id: None,
            tags: decoded.tags,
            data: decoded.data,
        })
    }

    /// Signed write: submit, then best-effort await of the result.
    pub async fn mutate(&self, request: RemoteCallRequest) -> Result<MutateOutcome, RelayError> {
        let config = self.config.snapshot();
        let tags = request.wire_tags();
        let mut context = new_context(&request.process_id, &tags)
            .with_request(request.data.as_ref(), request.retries);

        let Some(signer) = request.signer.clone().or_else(|| config.signer.clone()) else {
            return Err(RelayError::NoSigner {
                context: Box::new(context),
            });
        };
        check_tags(&tags, &context)?;

        let message = OutgoingMessage {
            process_id: request.process_id.clone(),
            tags: codec::encode(&tags),
            data: request.data.clone(),
        };
        let policy = config.retry_policy(request.retries);
        info!(
            call_id = %context.call_id,
            process_id = %request.process_id,
            action = ?context.action,
            "submitting mutation"
        );

        let substrate = &self.substrate;
        let (config_ref, message_ref, signer_ref) = (&*config, &message, &*signer);
        let message_id = policy
            .execute("mutate.submit", &request.cancel, move |_| {
                substrate.submit(config_ref, message_ref, signer_ref)
            })
            .await
            .map_err(|err| match err {
                RetryError::Exhausted { attempts, last } => RelayError::SubmitFailed {
                    attempts,
                    source: last,
                    context: Box::new(context.clone()),
                },
                RetryError::Cancelled { .. } => RelayError::Cancelled {
                    context: Some(Box::new(context.clone())),
                },
            })?;

        context.message_id = Some(message_id.clone());
        let pending = PendingWrite {
            message_id,
            process_id: request.process_id.clone(),
            submitted_at: Utc::now(),
        };
        debug!(
            call_id = %context.call_id,
            message_id = %pending.message_id,
            "mutation accepted; awaiting result"
        );

        let fetch_cancel = request.cancel.child_token();
        self.await_result(&config, pending, request.retries, &fetch_cancel, context)
            .await
    }

    /// Retry result retrieval for a write that previously came back as
    /// [`MutateOutcome::Submitted`].
    pub async fn reconcile(
        &self,
        pending: &PendingWrite,
        retries: u32,
        cancel: &CancellationToken,
    ) -> Result<MutateOutcome, RelayError> {
        let config = self.config.snapshot();
        let mut context =
            new_context(&pending.process_id, &TagMap::new()).with_request(None, retries);
        context.message_id = Some(pending.message_id.clone());
        self.await_result(&config, pending.clone(), retries, cancel, context)
            .await
    }

    async fn await_result(
        &self,
        config: &ClientConfig,
        pending: PendingWrite,
        retries: u32,
        cancel: &CancellationToken,
        mut context: CallContext,
    ) -> Result<MutateOutcome, RelayError> {
        let substrate = &self.substrate;
        let (process_id, message_id) = (pending.process_id.as_str(), pending.message_id.as_str());
        let fetched = config
            .retry_policy(retries)
            .execute("mutate.fetch_result", cancel, move |_| {
                substrate.fetch_result(config, process_id, message_id)
            })
            .await;

        let result = match fetched {
            Ok(result) => result,
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(
                    call_id = %context.call_id,
                    process_id = %pending.process_id,
                    message_id = %pending.message_id,
                    attempts,
                    error = %last,
                    "mutation submitted but result not observed"
                );
                return Ok(MutateOutcome::Submitted(pending));
            }
            Err(RetryError::Cancelled { .. }) => {
                return Err(RelayError::Cancelled {
                    context: Some(Box::new(context)),
                });
            }
        };

        context.raw_response = serde_json::to_value(&result).ok();
        let response = reconcile_result(&result, &context)?;
        Ok(MutateOutcome::Completed(CallResponse {
            id: Some(pending.message_id),
            ..response
        }))
    }

    /// Create a process. Requires a signer, a scheduler and a module.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<String, RelayError> {
        let config = self.config.snapshot();
        let retries = request.retries.unwrap_or(config.retry_attempts);
        let scheduler = request.scheduler.clone().or_else(|| config.scheduler.clone());
        let module = request.module.clone().or_else(|| config.module.clone());
        let context = new_context("", &request.tags)
            .with_request(request.data.as_ref(), retries)
            .with_spawn_target(scheduler.as_deref(), module.as_deref());

        let Some(signer) = request.signer.clone().or_else(|| config.signer.clone()) else {
            return Err(RelayError::NoSigner {
                context: Box::new(context),
            });
        };
        check_tags(&request.tags, &context)?;

        let (Some(scheduler), Some(module)) = (scheduler, module) else {
            return Err(RelayError::InvalidRequest {
                reason: "spawn needs a scheduler and a module".to_string(),
                context: Box::new(context),
            });
        };

        let spawn = SpawnMessage {
            scheduler,
            module,
            tags: codec::encode(&request.tags),
            data: request.data.clone(),
        };
        let substrate = &self.substrate;
        let (config_ref, spawn_ref, signer_ref) = (&*config, &spawn, &*signer);
        let process_id = config
            .retry_policy(retries)
            .execute("spawn", &request.cancel, move |_| {
                substrate.spawn_process(config_ref, spawn_ref, signer_ref)
            })
            .await
            .map_err(|err| match err {
                RetryError::Exhausted { attempts, last } => RelayError::SpawnFailed {
                    attempts,
                    source: last,
                    context: Box::new(context.clone()),
                },
                RetryError::Cancelled { .. } => RelayError::Cancelled {
                    context: Some(Box::new(context.clone())),
                },
            })?;

        info!(process_id = %process_id, module = %spawn.module, "process spawned");
        Ok(process_id)
    }

    /// Convergence poller whose probe retries use the configured backoff.
    pub fn poller<T, P>(&self, label: impl Into<String>, predicate: P) -> ConvergencePoller<T>
    where
        T: Serialize + Send + 'static,
        P: Fn(&[Option<T>]) -> bool + Send + Sync + 'static,
    {
        ConvergencePoller::new(label, predicate).retry_from_config(&self.config.snapshot())
    }

    /// Read a cached snapshot with the current configuration.
    pub async fn read_cache(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, RelayError> {
        let config = self.config.snapshot();
        self.cache.fetch(&config, path, cancel).await
    }
}

fn new_context(process_id: &str, tags: &TagMap) -> CallContext {
    CallContext::new(ulid::Ulid::new().to_string(), process_id, tags)
}

fn check_tags(tags: &TagMap, context: &CallContext) -> Result<(), RelayError> {
    match codec::first_invalid_name(tags) {
        Some(name) => Err(RelayError::InvalidRequest {
            reason: format!("tag name '{name}' is not an ASCII identifier"),
            context: Box::new(context.clone()),
        }),
        None => Ok(()),
    }
}

/// A `Status` other than `"200"` is a domain failure even though the call
/// itself went through. Results without a `Status` tag pass.
fn check_status(tags: &TagMap, context: &CallContext) -> Result<(), RelayError> {
    match tags.status() {
        Some(code) if code != STATUS_OK => Err(RelayError::RemoteStatus {
            code: code.to_string(),
            body: tags.payload().unwrap_or_default().to_string(),
            context: Box::new(context.clone()),
        }),
        _ => Ok(()),
    }
}

fn select_error(err: SelectError, context: &CallContext) -> RelayError {
    let context = Box::new(context.clone());
    match err {
        SelectError::NoMessages => RelayError::NoMessagesReturned { context },
        SelectError::Ambiguous(count) => RelayError::AmbiguousReadResult { count, context },
    }
}

/// Write-path interpretation of a fetched result.
fn reconcile_result(result: &ProcessResult, context: &CallContext) -> Result<CallResponse, RelayError> {
    if let Some(error) = result.error_text() {
        return Err(RelayError::RemoteExecution {
            error,
            context: Box::new(context.clone()),
        });
    }

    let reply = selector::select_response(&result.messages)
        .map_err(|err| select_error(err, context))?;
    let decoded = codec::decode_message(reply);
    check_status(&decoded.tags, context)?;

    Ok(CallResponse {
        id: None,
        tags: decoded.tags,
        data: decoded.data,
    })
}
