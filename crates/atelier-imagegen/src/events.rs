use std::{net::TcpStream, time::Duration};

use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::mpsc;
use tungstenite::{Message as WsMessage, WebSocket, stream::MaybeTlsStream};
use url::Url;

use crate::{
    error::{ImageGenError, Result},
    types::{ImageReference, NodeOutput},
};

/// How long a blocking read waits before checking whether anyone still listens
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Backend messages relevant to prompt execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServerMessage {
    Progress {
        prompt_id: Option<String>,
        node: Option<String>,
        value: u64,
        max: u64,
    },
    /// `node: None` means the prompt finished executing
    Executing {
        prompt_id: Option<String>,
        node: Option<String>,
    },
    Executed {
        prompt_id: Option<String>,
        node: String,
        images: Vec<ImageReference>,
    },
    ExecutionSuccess {
        prompt_id: Option<String>,
    },
    ExecutionError {
        prompt_id: Option<String>,
        message: String,
    },
    ExecutionInterrupted {
        prompt_id: Option<String>,
    },
    /// Status updates, cache notices and anything newer than this client
    Other(String),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct ProgressData {
    value: u64,
    max: u64,
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    prompt_id: Option<String>,
}

#[derive(Deserialize)]
struct ExecutingData {
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    prompt_id: Option<String>,
}

#[derive(Deserialize)]
struct ExecutedData {
    node: String,
    #[serde(default)]
    output: Option<NodeOutput>,
    #[serde(default)]
    prompt_id: Option<String>,
}

#[derive(Deserialize)]
struct PromptScoped {
    #[serde(default)]
    prompt_id: Option<String>,
}

#[derive(Deserialize)]
struct ExecutionErrorData {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default)]
    node_type: Option<String>,
    #[serde(default)]
    exception_message: Option<String>,
}

impl ServerMessage {
    pub(crate) fn parse(text: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(text)
            .map_err(|e| ImageGenError::InvalidResponse(format!("malformed backend event: {e}")))?;

        let message = match raw.kind.as_str() {
            "progress" => {
                let data: ProgressData = data_of(&raw)?;
                Self::Progress {
                    prompt_id: data.prompt_id,
                    node: data.node,
                    value: data.value,
                    max: data.max,
                }
            }
            "executing" => {
                let data: ExecutingData = data_of(&raw)?;
                Self::Executing {
                    prompt_id: data.prompt_id,
                    node: data.node,
                }
            }
            "executed" => {
                let data: ExecutedData = data_of(&raw)?;
                Self::Executed {
                    prompt_id: data.prompt_id,
                    node: data.node,
                    images: data.output.unwrap_or_default().images,
                }
            }
            "execution_success" => Self::ExecutionSuccess {
                prompt_id: data_of::<PromptScoped>(&raw)?.prompt_id,
            },
            "execution_error" => {
                let data: ExecutionErrorData = data_of(&raw)?;
                Self::ExecutionError {
                    prompt_id: data.prompt_id,
                    message: describe_error(data.node_id, data.node_type, data.exception_message),
                }
            }
            "execution_interrupted" => Self::ExecutionInterrupted {
                prompt_id: data_of::<PromptScoped>(&raw)?.prompt_id,
            },
            _ => Self::Other(raw.kind),
        };

        Ok(message)
    }
}

fn data_of<T: DeserializeOwned>(raw: &RawMessage) -> Result<T> {
    T::deserialize(&raw.data)
        .map_err(|e| ImageGenError::InvalidResponse(format!("malformed '{}' event: {e}", raw.kind)))
}

fn describe_error(node_id: Option<String>, node_type: Option<String>, message: Option<String>) -> String {
    let message = message.unwrap_or_else(|| "unknown error".to_owned());

    match (node_type, node_id) {
        (Some(node_type), Some(node_id)) => format!("{node_type} (node {node_id}): {message}"),
        (None, Some(node_id)) => format!("node {node_id}: {message}"),
        _ => message,
    }
}

/// Stream of parsed backend messages fed by a reader thread
///
/// A transport failure is delivered once as an `Err` item, after which
/// the stream ends.
#[derive(Debug)]
pub(crate) struct EventStream {
    receiver: mpsc::UnboundedReceiver<Result<ServerMessage>>,
}

impl EventStream {
    pub(crate) async fn next(&mut self) -> Option<Result<ServerMessage>> {
        self.receiver.recv().await
    }

    #[cfg(test)]
    pub(crate) fn from_receiver(receiver: mpsc::UnboundedReceiver<Result<ServerMessage>>) -> Self {
        Self { receiver }
    }
}

/// Connect to the backend websocket and start forwarding its messages
///
/// The handshake completes before this returns, so a prompt submitted
/// afterwards cannot race ahead of the subscription.
pub(crate) async fn subscribe(url: Url) -> Result<EventStream> {
    let (mut socket, _) = tokio::task::spawn_blocking(move || tungstenite::connect(url.as_str()))
        .await
        .map_err(|e| ImageGenError::ConnectionError(format!("websocket connect task failed: {e}")))?
        .map_err(|e| ImageGenError::ConnectionError(format!("failed to connect to event stream: {e}")))?;

    set_read_timeout(&mut socket, Some(READ_POLL_INTERVAL));

    let (sender, receiver) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name("comfyui-events".to_owned())
        .spawn(move || forward_messages(socket, &sender))
        .map_err(|e| ImageGenError::ConnectionError(format!("failed to spawn event reader: {e}")))?;

    Ok(EventStream { receiver })
}

fn forward_messages(
    mut socket: WebSocket<MaybeTlsStream<TcpStream>>,
    sender: &mpsc::UnboundedSender<Result<ServerMessage>>,
) {
    while !sender.is_closed() {
        let message = match socket.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(err) => {
                sender
                    .send(Err(ImageGenError::ConnectionError(format!("event stream failed: {err}"))))
                    .ok();
                return;
            }
        };

        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => {
                sender
                    .send(Err(ImageGenError::ConnectionError(
                        "event stream closed by backend".to_owned(),
                    )))
                    .ok();
                return;
            }
            // binary frames carry live previews
            _ => continue,
        };

        match ServerMessage::parse(&text) {
            Ok(parsed) => {
                if sender.send(Ok(parsed)).is_err() {
                    break;
                }
            }
            Err(e) => tracing::debug!(error = %e, "ignoring backend event"),
        }
    }

    socket.close(None).ok();
    socket.flush().ok();
}

fn set_read_timeout(socket: &mut WebSocket<MaybeTlsStream<TcpStream>>, timeout: Option<Duration>) {
    let result = match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(timeout),
        MaybeTlsStream::Rustls(stream) => stream.get_mut().set_read_timeout(timeout),
        _ => Ok(()),
    };

    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to set event stream read timeout");
    }
}
