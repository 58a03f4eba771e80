//! HTTP gateway implementation of [`Substrate`].
//!
//! Endpoints (relative to the configured base URLs):
//! - `POST {submit_url}/` signed envelope -> `{"id": ...}` (messages and spawns)
//! - `GET {compute_url}/result/{message_id}?process-id=...` -> result
//! - `POST {compute_url}/dry-run?process-id=...` -> result

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use relay_types::{ProcessResult, RequestData, Tag};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ClientConfig;
use crate::substrate::{OutgoingMessage, Signer, SpawnMessage, Substrate, SubstrateError};

const USER_AGENT: &str = concat!("relay-client/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpSubstrate {
    http: reqwest::Client,
}

/// Envelope fields covered by the signature.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    owner: String,
    tags: &'a [Tag],
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_encoding: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct SignedEnvelope<'a> {
    #[serde(flatten)]
    envelope: Envelope<'a>,
    signature: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DryRunBody<'a> {
    id: String,
    target: &'a str,
    owner: &'a str,
    tags: &'a [Tag],
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdReply {
    id: String,
}

impl HttpSubstrate {
    pub fn new() -> Result<Self, SubstrateError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SubstrateError::Transport("http_client".to_string(), e.to_string()))?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn post_signed(
        &self,
        config: &ClientConfig,
        envelope: Envelope<'_>,
        signer: &dyn Signer,
    ) -> Result<String, SubstrateError> {
        let url = join_url(&config.submit_url, "");
        let unsigned = serde_json::to_vec(&envelope)
            .map_err(|e| SubstrateError::Signing(format!("envelope encode: {e}")))?;
        let signature = BASE64.encode(signer.sign(&unsigned).await?);

        let response = self
            .http
            .post(&url)
            .timeout(config.http_timeout)
            .json(&SignedEnvelope {
                envelope,
                signature,
            })
            .send()
            .await
            .map_err(|e| SubstrateError::Transport(url.clone(), e.to_string()))?;

        let reply: IdReply = read_json(&url, response).await?;
        Ok(reply.id)
    }
}

#[async_trait]
impl Substrate for HttpSubstrate {
    async fn submit(
        &self,
        config: &ClientConfig,
        message: &OutgoingMessage,
        signer: &dyn Signer,
    ) -> Result<String, SubstrateError> {
        let (data, data_encoding) = encode_data(message.data.as_ref());
        let envelope = Envelope {
            target: Some(&message.process_id),
            owner: signer.address(),
            tags: &message.tags,
            data,
            data_encoding,
        };
        let id = self.post_signed(config, envelope, signer).await?;
        debug!(process_id = %message.process_id, message_id = %id, "message accepted");
        Ok(id)
    }

    async fn fetch_result(
        &self,
        config: &ClientConfig,
        process_id: &str,
        message_id: &str,
    ) -> Result<ProcessResult, SubstrateError> {
        let url = join_url(&config.compute_url, &format!("result/{message_id}"));
        let response = self
            .http
            .get(&url)
            .timeout(config.http_timeout)
            .query(&[("process-id", process_id)])
            .send()
            .await
            .map_err(|e| SubstrateError::Transport(url.clone(), e.to_string()))?;
        read_json(&url, response).await
    }

    async fn evaluate(
        &self,
        config: &ClientConfig,
        message: &OutgoingMessage,
        owner: &str,
    ) -> Result<ProcessResult, SubstrateError> {
        let url = join_url(&config.compute_url, "dry-run");
        let body = DryRunBody {
            id: ulid::Ulid::new().to_string(),
            target: &message.process_id,
            owner,
            tags: &message.tags,
            data: message.data.as_ref().map(dry_run_data),
        };
        let response = self
            .http
            .post(&url)
            .timeout(config.http_timeout)
            .query(&[("process-id", message.process_id.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| SubstrateError::Transport(url.clone(), e.to_string()))?;
        read_json(&url, response).await
    }

    async fn spawn_process(
        &self,
        config: &ClientConfig,
        spawn: &SpawnMessage,
        signer: &dyn Signer,
    ) -> Result<String, SubstrateError> {
        let mut tags = vec![
            Tag::new("Type", "Process"),
            Tag::new("Module", &spawn.module),
            Tag::new("Scheduler", &spawn.scheduler),
        ];
        tags.extend(spawn.tags.iter().cloned());

        let (data, data_encoding) = encode_data(spawn.data.as_ref());
        let envelope = Envelope {
            target: None,
            owner: signer.address(),
            tags: &tags,
            data,
            data_encoding,
        };
        let id = self.post_signed(config, envelope, signer).await?;
        debug!(process_id = %id, module = %spawn.module, "process spawned");
        Ok(id)
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        format!("{base}/")
    } else {
        format!("{base}/{path}")
    }
}

/// Non-2xx is a `Status` error carrying the body; anything unparsable is `Decode`.
pub(crate) async fn read_json<T: DeserializeOwned>(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<T, SubstrateError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| SubstrateError::Transport(endpoint.to_string(), e.to_string()))?;

    if !status.is_success() {
        return Err(SubstrateError::Status {
            endpoint: endpoint.to_string(),
            code: status.as_u16(),
            body,
        });
    }

    serde_json::from_str(&body).map_err(|e| SubstrateError::Decode(endpoint.to_string(), e.to_string()))
}

fn encode_data(data: Option<&RequestData>) -> (Option<String>, Option<&'static str>) {
    match data {
        None => (None, None),
        Some(RequestData::Text(text)) => (Some(text.clone()), None),
        Some(RequestData::Binary(bytes)) => (Some(BASE64.encode(bytes)), Some("base64")),
    }
}

fn dry_run_data(data: &RequestData) -> String {
    match data {
        RequestData::Text(text) => text.clone(),
        RequestData::Binary(bytes) => BASE64.encode(bytes),
    }
}
