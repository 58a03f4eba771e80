//! Relay Client - request/response over fire-and-forget processes
//!
//! This crate turns asynchronous, tag-addressed message passing into
//! request/response calls: read-only queries, signed mutations with
//! best-effort result retrieval, cached snapshot reads, and convergence
//! polling across independently replicated views.

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod poller;
pub mod retry;
pub mod selector;
pub mod substrate;

pub use cache::CacheReader;
pub use client::{CallResponse, MutateOutcome, RelayClient, RemoteCallRequest, SpawnRequest};
pub use config::{ClientConfig, ConfigHandle};
pub use error::{CallContext, RelayError};
pub use http::HttpSubstrate;
pub use poller::{Convergence, ConvergencePoller, PollPhase, PollProgress, PollSchedule, Probe};
pub use retry::{RetryError, RetryPolicy};
pub use substrate::{
    OutgoingMessage, SharedSigner, SharedSubstrate, Signer, SpawnMessage, Substrate,
    SubstrateError,
};

pub use relay_types::{Payload, PendingWrite, ProcessResult, RequestData, ResultMessage, Tag, TagMap};
