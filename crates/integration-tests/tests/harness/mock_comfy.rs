//! Mock `ComfyUI` backend for integration tests
//!
//! Serves the HTTP endpoints the tool uses and replays a scripted event
//! sequence over the websocket once a prompt is queued

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::{Json, Router, routing};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Name of the image every successful script produces
pub const OUTPUT_FILENAME: &str = "atelier_00001_.png";

/// Infotext embedded in the served image
pub const PARAMETERS: &str = "a red fox in snow\nNegative prompt: blurry\nSteps: 6, Sampler: euler, CFG scale: 1, Seed: 42, Size: 32x24";

/// Event sequence replayed after a prompt is queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Progress, output images, then the finished signal
    Success,
    /// Finished without an `executed` event; images only in history
    HistoryOnly,
    /// Progress, then an execution error
    Failure,
    /// Finished with no images anywhere
    EmptyOutput,
    /// Success followed by more terminal events
    DuplicateTerminal,
    /// Events for another prompt interleaved before a success
    ForeignPrompts,
    /// Progress, then the socket closes before any terminal event
    Disconnect,
}

#[derive(Debug, Clone)]
enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Mock backend with a fixed script and output image
pub struct MockComfy {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockComfyState>,
}

struct MockComfyState {
    script: Script,
    /// `None` makes `/system_stats` fail
    os: Option<String>,
    image: Vec<u8>,
    events: broadcast::Sender<Frame>,
    prompt_count: AtomicU32,
    view_count: AtomicU32,
    history_count: AtomicU32,
    submitted: Mutex<Vec<Value>>,
}

impl MockComfy {
    /// Start a posix backend running `script`
    pub async fn start(script: Script) -> anyhow::Result<Self> {
        Self::start_inner(script, Some("posix")).await
    }

    /// Start a backend that reports itself as Windows
    pub async fn start_windows(script: Script) -> anyhow::Result<Self> {
        Self::start_inner(script, Some("nt")).await
    }

    /// Start a backend whose `/system_stats` answers 500
    pub async fn start_without_stats(script: Script) -> anyhow::Result<Self> {
        Self::start_inner(script, None).await
    }

    async fn start_inner(script: Script, os: Option<&str>) -> anyhow::Result<Self> {
        let (events, _) = broadcast::channel(64);

        let state = Arc::new(MockComfyState {
            script,
            os: os.map(ToOwned::to_owned),
            image: sample_png(32, 24),
            events,
            prompt_count: AtomicU32::new(0),
            view_count: AtomicU32::new(0),
            history_count: AtomicU32::new(0),
            submitted: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/ws", routing::get(handle_ws))
            .route("/prompt", routing::post(handle_prompt))
            .route("/history/{prompt_id}", routing::get(handle_history))
            .route("/view", routing::get(handle_view))
            .route("/system_stats", routing::get(handle_system_stats))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self { addr, shutdown, state })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The PNG served from `/view`, 32x24 with a `parameters` chunk
    pub fn image(&self) -> &[u8] {
        &self.state.image
    }

    pub fn prompt_count(&self) -> u32 {
        self.state.prompt_count.load(Ordering::Relaxed)
    }

    pub fn view_count(&self) -> u32 {
        self.state.view_count.load(Ordering::Relaxed)
    }

    pub fn history_count(&self) -> u32 {
        self.state.history_count.load(Ordering::Relaxed)
    }

    /// Graphs received on `/prompt`, in order
    pub fn submitted(&self) -> Vec<Value> {
        self.state.submitted.lock().unwrap().clone()
    }
}

impl Drop for MockComfy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let pixel = if (x / 4 + y / 4) % 2 == 0 { [230, 90, 30] } else { [250, 250, 250] };
            data.extend_from_slice(&pixel);
        }
    }

    let mut out = Vec::new();
    let mut encoder = png::Encoder::new(&mut out, width, height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    encoder
        .add_text_chunk("parameters".to_owned(), PARAMETERS.to_owned())
        .expect("add parameters chunk");
    let mut writer = encoder.write_header().expect("write png header");
    writer.write_image_data(&data).expect("write png data");
    writer.finish().expect("finish png");
    out
}

// -- Websocket --

async fn handle_ws(State(state): State<Arc<MockComfyState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    // Subscribe before the upgrade completes so nothing queued later is missed
    let events = state.events.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, events))
}

async fn forward_events(mut socket: WebSocket, mut events: broadcast::Receiver<Frame>) {
    let status = json!({ "type": "status", "data": { "status": { "exec_info": { "queue_remaining": 0 } }, "sid": "mock" } });
    if socket.send(Message::Text(status.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = events.recv() => {
                let message = match frame {
                    Ok(Frame::Text(text)) => Message::Text(text.into()),
                    Ok(Frame::Binary(bytes)) => Message::Binary(bytes.into()),
                    Ok(Frame::Close) => {
                        socket.send(Message::Close(None)).await.ok();
                        break;
                    }
                    Err(_) => break,
                };
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                if matches!(incoming, None | Some(Err(_)) | Some(Ok(Message::Close(_)))) {
                    break;
                }
            }
        }
    }
}

// -- HTTP --

#[derive(Debug, Deserialize)]
struct QueueRequest {
    prompt: Value,
    client_id: String,
}

async fn handle_prompt(State(state): State<Arc<MockComfyState>>, Json(request): Json<QueueRequest>) -> impl IntoResponse {
    let number = state.prompt_count.fetch_add(1, Ordering::Relaxed);
    let prompt_id = format!("prompt-{number}-{}", request.client_id);

    state.submitted.lock().unwrap().push(request.prompt);

    let frames = script_frames(state.script, &prompt_id);
    let events = state.events.clone();
    tokio::spawn(async move {
        for frame in frames {
            // no receivers just means the client went away
            events.send(frame).ok();
        }
    });

    Json(json!({ "prompt_id": prompt_id, "number": number, "node_errors": {} }))
}

async fn handle_history(
    State(state): State<Arc<MockComfyState>>,
    Path(prompt_id): Path<String>,
) -> impl IntoResponse {
    state.history_count.fetch_add(1, Ordering::Relaxed);

    let outputs = if state.script == Script::EmptyOutput {
        json!({})
    } else {
        json!({ "9": { "images": [output_image()] } })
    };

    Json(json!({ prompt_id: { "outputs": outputs, "status": { "completed": true } } }))
}

#[derive(Debug, Deserialize)]
struct ViewQuery {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default)]
    folder_type: String,
}

async fn handle_view(State(state): State<Arc<MockComfyState>>, Query(query): Query<ViewQuery>) -> impl IntoResponse {
    state.view_count.fetch_add(1, Ordering::Relaxed);

    if query.filename != OUTPUT_FILENAME || !query.subfolder.is_empty() || query.folder_type != "output" {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }

    ([(header::CONTENT_TYPE, "image/png")], state.image.clone()).into_response()
}

async fn handle_system_stats(State(state): State<Arc<MockComfyState>>) -> impl IntoResponse {
    let Some(os) = &state.os else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "stats unavailable").into_response();
    };

    Json(json!({
        "system": { "os": os, "python_version": "3.11.9", "comfyui_version": "0.3.40" },
        "devices": []
    }))
    .into_response()
}

// -- Scripts --

fn output_image() -> Value {
    json!({ "filename": OUTPUT_FILENAME, "subfolder": "", "type": "output" })
}

fn event(kind: &str, data: Value) -> Frame {
    Frame::Text(json!({ "type": kind, "data": data }).to_string())
}

fn progress_frames(prompt_id: &str) -> Vec<Frame> {
    let mut frames = vec![
        event("execution_start", json!({ "prompt_id": prompt_id })),
        event("executing", json!({ "node": "4", "prompt_id": prompt_id })),
        event("executing", json!({ "node": "3", "prompt_id": prompt_id })),
    ];
    for step in 1..=3 {
        frames.push(event(
            "progress",
            json!({ "value": step, "max": 3, "node": "3", "prompt_id": prompt_id }),
        ));
        frames.push(Frame::Binary(vec![0, 0, 0, 1, 0xFF, 0xD8]));
    }
    frames
}

fn finished_frames(prompt_id: &str) -> Vec<Frame> {
    vec![
        event("executing", json!({ "node": "9", "prompt_id": prompt_id })),
        event(
            "executed",
            json!({ "node": "9", "display_node": "9", "output": { "images": [output_image()] }, "prompt_id": prompt_id }),
        ),
        event("execution_success", json!({ "prompt_id": prompt_id })),
        event("executing", json!({ "node": null, "prompt_id": prompt_id })),
    ]
}

fn script_frames(script: Script, prompt_id: &str) -> Vec<Frame> {
    match script {
        Script::Success => [progress_frames(prompt_id), finished_frames(prompt_id)].concat(),
        Script::HistoryOnly => vec![
            event("execution_start", json!({ "prompt_id": prompt_id })),
            event(
                "execution_cached",
                json!({ "nodes": ["3", "4", "5", "6", "7", "8", "9"], "prompt_id": prompt_id }),
            ),
            event("executing", json!({ "node": null, "prompt_id": prompt_id })),
        ],
        Script::Failure => [
            progress_frames(prompt_id),
            vec![event(
                "execution_error",
                json!({
                    "prompt_id": prompt_id,
                    "node_id": "3",
                    "node_type": "KSampler",
                    "exception_message": "CUDA out of memory",
                    "exception_type": "torch.OutOfMemoryError",
                    "traceback": []
                }),
            )],
        ]
        .concat(),
        Script::EmptyOutput => vec![
            event("execution_start", json!({ "prompt_id": prompt_id })),
            event("executing", json!({ "node": null, "prompt_id": prompt_id })),
        ],
        Script::DuplicateTerminal => [
            finished_frames(prompt_id),
            finished_frames(prompt_id),
            vec![event(
                "execution_error",
                json!({ "prompt_id": prompt_id, "node_id": "9", "node_type": "SaveImage", "exception_message": "late" }),
            )],
        ]
        .concat(),
        Script::Disconnect => [progress_frames(prompt_id), vec![Frame::Close]].concat(),
        Script::ForeignPrompts => [
            vec![
                event(
                    "execution_error",
                    json!({ "prompt_id": "someone-else", "node_id": "3", "exception_message": "not ours" }),
                ),
                event("executing", json!({ "node": null, "prompt_id": "someone-else" })),
            ],
            progress_frames(prompt_id),
            finished_frames(prompt_id),
        ]
        .concat(),
    }
}
