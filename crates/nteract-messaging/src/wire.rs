use crate::message::{Channel, JupyterMessage};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

pub const DELIMITER: &[u8] = b"<IDS|MSG>";
pub const DEFAULT_SIGNATURE_SCHEME: &str = "hmac-sha256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unsupported signature scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("multipart message has no <IDS|MSG> delimiter")]
    MissingDelimiter,
    #[error("multipart message truncated: expected at least {expected} frames after delimiter, got {found}")]
    Truncated { expected: usize, found: usize },
    #[error("message signature mismatch")]
    BadSignature,
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// HMAC signer for the multipart wire format. An empty key disables signing,
/// matching kernels launched without authentication.
#[derive(Clone)]
pub struct MessageSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for MessageSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSigner")
            .field("enabled", &!self.key.is_empty())
            .finish()
    }
}

impl MessageSigner {
    pub fn new(key: &str, scheme: &str) -> Result<Self, WireError> {
        if !key.is_empty() && scheme != DEFAULT_SIGNATURE_SCHEME {
            return Err(WireError::UnsupportedScheme(scheme.to_string()));
        }
        Ok(Self {
            key: key.as_bytes().to_vec(),
        })
    }

    pub fn unsigned() -> Self {
        Self { key: Vec::new() }
    }

    pub fn is_enabled(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn sign(&self, parts: &[&[u8]]) -> Result<String, WireError> {
        if self.key.is_empty() {
            return Ok(String::new());
        }
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|err| WireError::InvalidKey(err.to_string()))?;
        for part in parts {
            mac.update(part);
        }
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> Result<(), WireError> {
        if self.key.is_empty() {
            return Ok(());
        }
        let provided = hex::decode(signature).map_err(|_| WireError::BadSignature)?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|err| WireError::InvalidKey(err.to_string()))?;
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&provided)
            .map_err(|_| WireError::BadSignature)
    }
}

/// Encodes a message into ZMQ frames: delimiter, signature, header,
/// parent_header, metadata, content, then raw buffers.
pub fn encode_zmq_frames(
    message: &JupyterMessage,
    signer: &MessageSigner,
) -> Result<Vec<Bytes>, WireError> {
    let header = to_json_bytes(&message.header)?;
    let parent = match &message.parent_header {
        Some(parent) => to_json_bytes(parent)?,
        None => b"{}".to_vec(),
    };
    let metadata = to_json_bytes(&message.metadata)?;
    let content = to_json_bytes(&message.content)?;
    let signature = signer.sign(&[
        header.as_slice(),
        parent.as_slice(),
        metadata.as_slice(),
        content.as_slice(),
    ])?;

    let mut frames = Vec::with_capacity(6 + message.buffers.len());
    frames.push(Bytes::from_static(DELIMITER));
    frames.push(Bytes::from(signature.into_bytes()));
    frames.push(Bytes::from(header));
    frames.push(Bytes::from(parent));
    frames.push(Bytes::from(metadata));
    frames.push(Bytes::from(content));
    frames.extend(message.buffers.iter().cloned());
    Ok(frames)
}

/// Decodes ZMQ frames received on `channel`. Routing identities before the
/// delimiter are discarded.
pub fn decode_zmq_frames(
    frames: &[Bytes],
    channel: Channel,
    signer: &MessageSigner,
) -> Result<JupyterMessage, WireError> {
    let delimiter_idx = frames
        .iter()
        .position(|frame| frame.as_ref() == DELIMITER)
        .ok_or(WireError::MissingDelimiter)?;
    let body = &frames[delimiter_idx + 1..];
    if body.len() < 5 {
        return Err(WireError::Truncated {
            expected: 5,
            found: body.len(),
        });
    }
    let (signature, header, parent, metadata, content) =
        (&body[0], &body[1], &body[2], &body[3], &body[4]);
    signer.verify(
        signature,
        &[header.as_ref(), parent.as_ref(), metadata.as_ref(), content.as_ref()],
    )?;

    let envelope = serde_json::json!({
        "header": from_json_bytes::<Value>(header)?,
        "parent_header": from_json_bytes::<Value>(parent)?,
        "metadata": from_json_bytes::<Value>(metadata)?,
        "content": from_json_bytes::<Value>(content)?,
    });
    let mut message: JupyterMessage =
        serde_json::from_value(envelope).map_err(|err| WireError::Decode(err.to_string()))?;
    message.buffers = body[5..].to_vec();
    message.channel = Some(channel);
    Ok(message)
}

#[derive(Debug, Serialize, Deserialize)]
struct WsEnvelope {
    channel: Channel,
    header: Value,
    #[serde(default)]
    parent_header: Value,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    content: Value,
}

/// Encodes a message as a JSON text frame for a Jupyter server websocket.
pub fn encode_ws_frame(message: &JupyterMessage) -> Result<String, WireError> {
    let mut value =
        serde_json::to_value(message).map_err(|err| WireError::Encode(err.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "channel".to_string(),
            Value::String(message.target_channel().as_str().to_string()),
        );
    }
    serde_json::to_string(&value).map_err(|err| WireError::Encode(err.to_string()))
}

/// Decodes a JSON text frame from a Jupyter server websocket.
pub fn decode_ws_frame(text: &str) -> Result<JupyterMessage, WireError> {
    let envelope: WsEnvelope =
        serde_json::from_str(text).map_err(|err| WireError::Decode(err.to_string()))?;
    let channel = envelope.channel;
    let value = serde_json::json!({
        "header": envelope.header,
        "parent_header": envelope.parent_header,
        "metadata": envelope.metadata,
        "content": envelope.content,
    });
    let mut message: JupyterMessage =
        serde_json::from_value(value).map_err(|err| WireError::Decode(err.to_string()))?;
    message.channel = Some(channel);
    Ok(message)
}

fn to_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(value).map_err(|err| WireError::Encode(err.to_string()))
}

fn from_json_bytes<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(bytes).map_err(|err| WireError::Decode(err.to_string()))
}
