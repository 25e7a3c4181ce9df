use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const PROTOCOL_VERSION: &str = "5.3";
pub const DEFAULT_USERNAME: &str = "nteract";

/// The four logical sub-channels of a kernel session. The heartbeat socket is
/// not a message channel and is handled by the transport directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
    Control,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Shell,
        Channel::Iopub,
        Channel::Stdin,
        Channel::Control,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Iopub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
        }
    }

    /// Default outbound channel for a request when the message does not pin one.
    pub fn for_message_type(msg_type: &str) -> Self {
        match msg_type {
            "input_reply" => Channel::Stdin,
            "interrupt_request" | "debug_request" => Channel::Control,
            _ => Channel::Shell,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "shell" => Ok(Channel::Shell),
            "iopub" => Ok(Channel::Iopub),
            "stdin" => Ok(Channel::Stdin),
            "control" => Ok(Channel::Control),
            other => Err(format!("Unknown channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(deserialize_with = "deserialize_date")]
    pub date: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Header {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            session: String::new(),
            username: DEFAULT_USERNAME.to_string(),
            date: Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A kernel protocol envelope. `parent_header` is the causal link back to the
/// request that provoked this message; on the wire an absent parent is `{}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JupyterMessage {
    pub header: Header,
    #[serde(
        default,
        serialize_with = "serialize_parent",
        deserialize_with = "deserialize_parent"
    )]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content: Value,
    #[serde(skip)]
    pub buffers: Vec<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

impl JupyterMessage {
    pub fn new(msg_type: impl Into<String>, content: Value) -> Self {
        Self {
            header: Header::new(msg_type),
            parent_header: None,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
            channel: None,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header
            .as_ref()
            .map(|parent| parent.msg_id.as_str())
    }

    pub fn is_child_of(&self, parent: &JupyterMessage) -> bool {
        self.parent_msg_id() == Some(parent.msg_id())
    }

    /// Channel this message travels on: the pinned one, else the default for its type.
    pub fn target_channel(&self) -> Channel {
        self.channel
            .unwrap_or_else(|| Channel::for_message_type(self.msg_type()))
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_parent(mut self, parent: &JupyterMessage) -> Self {
        self.parent_header = Some(parent.header.clone());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }

    /// Stamps the session id unless the caller already chose one.
    pub fn with_session(mut self, session: &str) -> Self {
        if self.header.session.is_empty() {
            self.header.session = session.to_string();
        }
        self
    }

    /// Builds a reply-shaped message whose parent is `self`.
    pub fn reply(&self, msg_type: impl Into<String>, content: Value) -> Self {
        let mut reply = JupyterMessage::new(msg_type, content).with_parent(self);
        reply.header.session = self.header.session.clone();
        reply
    }
}

/// Creates a request stamped with a fresh message id and the current time.
pub fn create_message(msg_type: &str, content: Option<Value>) -> JupyterMessage {
    JupyterMessage::new(msg_type, content.unwrap_or_else(|| json!({})))
}

pub fn kernel_info_request() -> JupyterMessage {
    create_message("kernel_info_request", None)
}

pub fn shutdown_request(restart: bool) -> JupyterMessage {
    create_message("shutdown_request", Some(json!({ "restart": restart })))
        .with_channel(Channel::Shell)
}

pub fn interrupt_request() -> JupyterMessage {
    create_message("interrupt_request", None).with_channel(Channel::Control)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    pub silent: bool,
    pub store_history: bool,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: false,
            store_history: true,
            allow_stdin: false,
            stop_on_error: false,
        }
    }
}

pub fn execute_request(code: &str, options: &ExecuteOptions) -> JupyterMessage {
    create_message(
        "execute_request",
        Some(json!({
            "code": code,
            "silent": options.silent,
            "store_history": options.store_history,
            "user_expressions": {},
            "allow_stdin": options.allow_stdin,
            "stop_on_error": options.stop_on_error,
        })),
    )
}

pub fn comm_open(comm_id: &str, target_name: &str, data: Value) -> JupyterMessage {
    create_message(
        "comm_open",
        Some(json!({
            "comm_id": comm_id,
            "target_name": target_name,
            "data": data,
        })),
    )
}

pub fn comm_msg(comm_id: &str, data: Value) -> JupyterMessage {
    create_message(
        "comm_msg",
        Some(json!({
            "comm_id": comm_id,
            "data": data,
        })),
    )
}

pub fn input_reply(value: &str) -> JupyterMessage {
    create_message("input_reply", Some(json!({ "value": value }))).with_channel(Channel::Stdin)
}

/// Predicate matching messages whose parent header points at `parent`.
pub fn child_of(parent: &JupyterMessage) -> impl Fn(&JupyterMessage) -> bool + Send + Sync + 'static {
    let parent_id = parent.msg_id().to_string();
    move |candidate: &JupyterMessage| candidate.parent_msg_id() == Some(parent_id.as_str())
}

/// Predicate matching messages whose type is one of `types`.
pub fn of_message_type<I, S>(types: I) -> impl Fn(&JupyterMessage) -> bool + Send + Sync + 'static
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let wanted: HashSet<String> = types.into_iter().map(Into::into).collect();
    move |candidate: &JupyterMessage| wanted.contains(candidate.msg_type())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Starting => "starting",
            ExecutionState::Idle => "idle",
            ExecutionState::Busy => "busy",
            ExecutionState::Restarting => "restarting",
            ExecutionState::Dead => "dead",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state carried by an iopub `status` message.
pub fn execution_state(message: &JupyterMessage) -> Option<ExecutionState> {
    if message.msg_type() != "status" {
        return None;
    }
    message
        .content
        .get("execution_state")
        .cloned()
        .and_then(|state| serde_json::from_value(state).ok())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub file_extension: Option<String>,
    #[serde(default)]
    pub pygments_lexer: Option<String>,
    #[serde(default)]
    pub codemirror_mode: Option<Value>,
    #[serde(default)]
    pub nbconvert_exporter: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Pulls `content.language_info` out of a `kernel_info_reply`.
pub fn language_info(reply: &JupyterMessage) -> Result<LanguageInfo, String> {
    let raw = reply
        .content
        .get("language_info")
        .cloned()
        .ok_or_else(|| "kernel_info_reply has no language_info".to_string())?;
    serde_json::from_value(raw).map_err(|err| format!("invalid language_info: {err}"))
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Kernels disagree on date formatting; older ones omit the offset entirely.
fn deserialize_date<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|err| serde::de::Error::custom(format!("invalid header date '{raw}': {err}")))
}

fn serialize_parent<S>(parent: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => Map::<String, Value>::new().serialize(serializer),
    }
}

fn deserialize_parent<'de, D>(deserializer: D) -> Result<Option<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::Object(ref map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
