//! Seam to the remote compute substrate.
//!
//! The client only needs four primitives; everything else about how processes
//! execute stays on the far side of this trait.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use relay_types::{ProcessResult, RequestData, Tag};

use crate::config::ClientConfig;

pub type SharedSubstrate = Arc<dyn Substrate>;
pub type SharedSigner = Arc<dyn Signer>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubstrateError {
    #[error("transport error ({0}): {1}")]
    Transport(String, String),
    #[error("unexpected status {code} from {endpoint}: {body}")]
    Status {
        endpoint: String,
        code: u16,
        body: String,
    },
    #[error("response decode failed ({0}): {1}")]
    Decode(String, String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Signing credential for writes.
#[async_trait]
pub trait Signer: Send + Sync + fmt::Debug {
    /// Owner address the signature proves.
    fn address(&self) -> String;

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SubstrateError>;
}

/// A message addressed to an existing process.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub process_id: String,
    pub tags: Vec<Tag>,
    pub data: Option<RequestData>,
}

/// A request to create a new process.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnMessage {
    pub scheduler: String,
    pub module: String,
    pub tags: Vec<Tag>,
    pub data: Option<RequestData>,
}

#[async_trait]
pub trait Substrate: Send + Sync {
    /// Durably submit a signed message; returns the message id.
    async fn submit(
        &self,
        config: &ClientConfig,
        message: &OutgoingMessage,
        signer: &dyn Signer,
    ) -> Result<String, SubstrateError>;

    /// Result of a previously submitted message.
    async fn fetch_result(
        &self,
        config: &ClientConfig,
        process_id: &str,
        message_id: &str,
    ) -> Result<ProcessResult, SubstrateError>;

    /// Side-effect-free evaluation (dryrun) on behalf of `owner`.
    async fn evaluate(
        &self,
        config: &ClientConfig,
        message: &OutgoingMessage,
        owner: &str,
    ) -> Result<ProcessResult, SubstrateError>;

    /// Create a process; returns its id.
    async fn spawn_process(
        &self,
        config: &ClientConfig,
        spawn: &SpawnMessage,
        signer: &dyn Signer,
    ) -> Result<String, SubstrateError>;
}
