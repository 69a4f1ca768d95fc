//! Axum server: request/response operations over HTTP, engine events over
//! WebSocket.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use prodline_model::{
    ApiResponse, Connection, ConnectionRequest, EntityRef, Machine, PositionRequest, Queue,
    SimulationState, Snapshot, SnapshotRequest, StreamMessage,
};
use prodline_sync::{
    Effect, LocalBackend, LocalEngine, Normalizer, SceneGraph, SceneObject, SimulationApi,
    StateStore, StreamEvent,
};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::VisConfig;
use crate::error::Result;

/// Shared application state.
pub struct AppState {
    backend: LocalBackend,
    scene: RwLock<SceneGraph>,
}

impl AppState {
    pub fn backend(&self) -> &LocalBackend {
        &self.backend
    }

    pub fn engine(&self) -> &LocalEngine {
        self.backend.engine()
    }

    /// Bring the scene up to date with the store and return it in paint order.
    pub async fn scene_objects(&self) -> Vec<SceneObject> {
        let mut scene = self.scene.write().await;
        let report = scene.reconcile(&self.backend.store().current());
        debug!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            "scene reconciled"
        );
        scene.expire_flashes(Instant::now());
        scene.objects().into_iter().cloned().collect()
    }
}

type Shared = Arc<AppState>;

/// Visualization server hosting one local simulation.
pub struct VisServer {
    state: Shared,
}

impl VisServer {
    /// Build the store, engine and backend. Must be called inside a Tokio
    /// runtime; machine flashes are fed to the scene by a background task.
    pub fn new(config: &VisConfig) -> Result<Self> {
        let store = StateStore::default();
        let (effects_tx, effects) = mpsc::unbounded_channel();
        let normalizer = Normalizer::new(store.clone(), effects_tx);
        let engine = LocalEngine::new(normalizer, config.sync.clone())?;
        let state = Arc::new(AppState {
            backend: LocalBackend::new(store, engine),
            scene: RwLock::new(SceneGraph::new(config.sync.flash_duration)),
        });
        tokio::spawn(feed_scene(Arc::downgrade(&state), effects));
        Ok(Self { state })
    }

    pub fn state(&self) -> &Shared {
        &self.state
    }

    /// Build the router for the server.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/api/state", get(get_state))
            .route("/api/scene", get(get_scene))
            // Lifecycle
            .route("/api/start", post(start))
            .route("/api/stop", post(stop))
            .route("/api/restart", post(restart))
            .route("/api/new", post(new_simulation))
            // Editing
            .route("/api/queues", post(create_queue))
            .route("/api/queues/{id}", delete(delete_queue))
            .route("/api/queues/{id}/position", patch(move_queue))
            .route("/api/machines", post(create_machine))
            .route("/api/machines/{id}", delete(delete_machine))
            .route("/api/machines/{id}/position", patch(move_machine))
            .route("/api/connections", post(create_connection))
            .route("/api/connections/{id}", delete(delete_connection))
            // Snapshots and replay
            .route("/api/snapshots", get(list_snapshots).post(create_snapshot))
            .route("/api/snapshots/{id}/replay", post(replay_snapshot))
            .route("/api/live", post(return_to_live))
            // Push stream
            .route("/ws", get(ws_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Run the server on the given address.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "prodline vis server listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Apply engine flashes to the scene as they happen.
async fn feed_scene(state: Weak<AppState>, mut effects: mpsc::UnboundedReceiver<Effect>) {
    while let Some(effect) = effects.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        if let Effect::Flash(machine_id) = effect {
            let mut scene = state.scene.write().await;
            scene.reconcile(&state.backend.store().current());
            scene.flash(&machine_id, Instant::now());
        }
    }
}

/// Liveness check.
async fn health() -> &'static str {
    "OK"
}

/// GET /api/state: the canonical diagram.
async fn get_state(State(state): State<Shared>) -> Json<ApiResponse<SimulationState>> {
    Json(state.backend.get_state().await)
}

/// GET /api/scene: the reconciled drawing objects in paint order.
async fn get_scene(State(state): State<Shared>) -> Json<ApiResponse<Vec<SceneObject>>> {
    Json(ApiResponse::ok(state.scene_objects().await))
}

// --- Lifecycle ---

/// POST /api/start
async fn start(State(state): State<Shared>) -> Json<ApiResponse<()>> {
    Json(state.backend.start().await)
}

/// POST /api/stop: halts ticks and cancels pending completions.
async fn stop(State(state): State<Shared>) -> Json<ApiResponse<()>> {
    Json(state.backend.stop().await)
}

/// POST /api/restart: zero every count and start again.
async fn restart(State(state): State<Shared>) -> Json<ApiResponse<SimulationState>> {
    Json(state.backend.restart().await)
}

/// POST /api/new: stop and discard the diagram.
async fn new_simulation(State(state): State<Shared>) -> Json<ApiResponse<SimulationState>> {
    Json(state.backend.new_simulation().await)
}

// --- Editing ---

/// POST /api/queues
async fn create_queue(
    State(state): State<Shared>,
    Json(req): Json<PositionRequest>,
) -> Json<ApiResponse<Queue>> {
    Json(state.backend.create_queue(req.x, req.y).await)
}

/// POST /api/machines: the machine gets a random processing time.
async fn create_machine(
    State(state): State<Shared>,
    Json(req): Json<PositionRequest>,
) -> Json<ApiResponse<Machine>> {
    Json(state.backend.create_machine(req.x, req.y).await)
}

/// POST /api/connections
async fn create_connection(
    State(state): State<Shared>,
    Json(req): Json<ConnectionRequest>,
) -> Json<ApiResponse<Connection>> {
    Json(state.backend.create_connection(req).await)
}

/// DELETE /api/queues/{id}, along with its connections.
async fn delete_queue(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Json<ApiResponse<()>> {
    Json(state.backend.delete_element(&EntityRef::queue(id)).await)
}

/// DELETE /api/machines/{id}, along with its connections.
async fn delete_machine(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Json<ApiResponse<()>> {
    Json(state.backend.delete_element(&EntityRef::machine(id)).await)
}

/// DELETE /api/connections/{id}
async fn delete_connection(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Json<ApiResponse<()>> {
    Json(state.backend.delete_connection(&id).await)
}

/// PATCH /api/queues/{id}/position
async fn move_queue(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(req): Json<PositionRequest>,
) -> Json<ApiResponse<()>> {
    let entity = EntityRef::queue(id);
    Json(state.backend.update_position(&entity, req.x, req.y).await)
}

/// PATCH /api/machines/{id}/position
async fn move_machine(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(req): Json<PositionRequest>,
) -> Json<ApiResponse<()>> {
    let entity = EntityRef::machine(id);
    Json(state.backend.update_position(&entity, req.x, req.y).await)
}

// --- Snapshots ---

/// GET /api/snapshots
async fn list_snapshots(State(state): State<Shared>) -> Json<ApiResponse<Vec<Snapshot>>> {
    Json(state.backend.list_snapshots().await)
}

/// POST /api/snapshots: capture the current diagram under an optional label.
async fn create_snapshot(
    State(state): State<Shared>,
    Json(req): Json<SnapshotRequest>,
) -> Json<ApiResponse<Snapshot>> {
    Json(state.backend.create_snapshot(req.label).await)
}

/// POST /api/snapshots/{id}/replay: stop and install the snapshot's state.
async fn replay_snapshot(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Json<ApiResponse<SimulationState>> {
    Json(state.backend.replay_snapshot(&id).await)
}

/// POST /api/live: leave replay and restore the diagram saved when it began.
async fn return_to_live(State(state): State<Shared>) -> Json<ApiResponse<SimulationState>> {
    Json(state.backend.return_to_live().await)
}

// --- Push stream ---

/// GET /ws: upgrade to the push stream.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Shared>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// The current state as a STATE_UPDATE frame.
fn state_message(state: &AppState) -> StreamMessage {
    let current = state.backend.store().current();
    StreamEvent::StateUpdate(SimulationState::clone(&current)).to_message()
}

/// One push client: the full state first, then every engine event.
async fn handle_socket(mut socket: WebSocket, state: Shared) {
    info!("push client connected");

    // Subscribe before reading the state so nothing falls in between
    let mut events = state.engine().subscribe_events();
    if let Err(e) = send_message(&mut socket, &state_message(&state)).await {
        warn!(error = %e, "failed to send initial state");
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    info!("push client disconnected");
                    break;
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = socket.send(Message::Pong(data)).await {
                        warn!(error = %e, "failed to send pong");
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "websocket error");
                    break;
                }
            },
            event = events.recv() => {
                let msg = match event {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push client lagged; resending state");
                        state_message(&state)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(e) = send_message(&mut socket, &msg).await {
                    warn!(error = %e, "failed to push event");
                    break;
                }
            }
        }
    }
}

async fn send_message(socket: &mut WebSocket, msg: &StreamMessage) -> std::result::Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    socket.send(Message::Text(json.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use prodline_sync::SyncConfig;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn server() -> VisServer {
        let config = VisConfig {
            sync: SyncConfig::default()
                .with_seed(5)
                .with_arrival_probability(0.0),
            ..VisConfig::default()
        };
        VisServer::new(&config).unwrap()
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Value {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Q0 -> M1 -> Q1
    async fn line(app: &Router) {
        call(app, "POST", "/api/queues", Some(json!({"x": 100.0, "y": 100.0}))).await;
        call(app, "POST", "/api/queues", Some(json!({"x": 500.0, "y": 100.0}))).await;
        call(app, "POST", "/api/machines", Some(json!({"x": 300.0, "y": 100.0}))).await;
        for (source, source_type, target, target_type) in
            [("Q0", "queue", "M1", "machine"), ("M1", "machine", "Q1", "queue")]
        {
            let resp = call(
                app,
                "POST",
                "/api/connections",
                Some(json!({
                    "sourceId": source,
                    "sourceType": source_type,
                    "targetId": target,
                    "targetType": target_type,
                })),
            )
            .await;
            assert_eq!(resp["success"], true);
        }
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = server().router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn placement_assigns_ids() {
        let app = server().router();
        let q = call(&app, "POST", "/api/queues", Some(json!({"x": 1.0, "y": 2.0}))).await;
        let m = call(&app, "POST", "/api/machines", Some(json!({"x": 3.0, "y": 4.0}))).await;
        assert_eq!(q["data"]["id"], "Q0");
        assert_eq!(q["data"]["productCount"], 0);
        assert_eq!(m["data"]["id"], "M1");
        assert_eq!(m["data"]["state"], "idle");

        let state = call(&app, "GET", "/api/state", None).await;
        assert_eq!(state["success"], true);
        assert_eq!(state["data"]["queues"].as_array().unwrap().len(), 1);
        assert_eq!(state["data"]["isRunning"], false);
    }

    #[tokio::test]
    async fn self_connection_is_refused() {
        let app = server().router();
        call(&app, "POST", "/api/machines", Some(json!({"x": 0.0, "y": 0.0}))).await;
        let resp = call(
            &app,
            "POST",
            "/api/connections",
            Some(json!({
                "sourceId": "M1", "sourceType": "machine",
                "targetId": "M1", "targetType": "machine",
            })),
        )
        .await;
        assert_eq!(resp["success"], false);
        assert!(resp["error"].is_string());
        assert!(resp.get("data").is_none());
    }

    #[tokio::test]
    async fn deleting_queue_prunes_connections() {
        let app = server().router();
        line(&app).await;
        let resp = call(&app, "DELETE", "/api/queues/Q0", None).await;
        assert_eq!(resp["success"], true);

        let state = call(&app, "GET", "/api/state", None).await;
        let connections = state["data"]["connections"].as_array().unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0]["id"], "C2");

        let resp = call(&app, "DELETE", "/api/connections/C2", None).await;
        assert_eq!(resp["success"], true);
        let resp = call(&app, "DELETE", "/api/connections/C2", None).await;
        assert_eq!(resp["success"], false);
    }

    #[tokio::test]
    async fn position_update() {
        let app = server().router();
        line(&app).await;
        let resp = call(
            &app,
            "PATCH",
            "/api/machines/M1/position",
            Some(json!({"x": 320.0, "y": 180.0})),
        )
        .await;
        assert_eq!(resp["success"], true);
        let state = call(&app, "GET", "/api/state", None).await;
        assert_eq!(state["data"]["machines"][0]["x"], 320.0);

        let resp = call(
            &app,
            "PATCH",
            "/api/queues/Q7/position",
            Some(json!({"x": 0.0, "y": 0.0})),
        )
        .await;
        assert_eq!(resp["success"], false);
    }

    #[tokio::test]
    async fn scene_projection_keeps_handles() {
        let app = server().router();
        line(&app).await;

        let first = call(&app, "GET", "/api/scene", None).await;
        let objects = first["data"].as_array().unwrap();
        assert_eq!(objects.len(), 5);
        // Edges paint first
        assert_eq!(objects[0]["shape"], "edge");
        assert_eq!(objects[1]["shape"], "edge");
        assert!(objects[0]["curve"].is_object());

        let queue = objects
            .iter()
            .find(|o| o["key"]["id"] == "Q0")
            .unwrap();
        assert_eq!(queue["detail"], "Products: 0");

        let second = call(&app, "GET", "/api/scene", None).await;
        let handles = |v: &Value| -> Vec<Value> {
            v["data"]
                .as_array()
                .unwrap()
                .iter()
                .map(|o| o["handle"].clone())
                .collect()
        };
        assert_eq!(handles(&first), handles(&second));
    }

    #[tokio::test]
    async fn snapshot_replay_and_return() {
        let app = server().router();
        call(&app, "POST", "/api/queues", Some(json!({"x": 0.0, "y": 0.0}))).await;
        let snap = call(&app, "POST", "/api/snapshots", Some(json!({}))).await;
        assert_eq!(snap["data"]["id"], "SNAP1");
        assert_eq!(snap["data"]["label"], "Snapshot 1");

        call(&app, "POST", "/api/queues", Some(json!({"x": 200.0, "y": 0.0}))).await;
        let replayed = call(&app, "POST", "/api/snapshots/SNAP1/replay", None).await;
        assert_eq!(replayed["data"]["queues"].as_array().unwrap().len(), 1);

        let list = call(&app, "GET", "/api/snapshots", None).await;
        assert_eq!(list["data"].as_array().unwrap().len(), 1);

        let live = call(&app, "POST", "/api/live", None).await;
        assert_eq!(live["data"]["queues"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lifecycle_toggles_running() {
        let app = server().router();
        call(&app, "POST", "/api/start", None).await;
        let state = call(&app, "GET", "/api/state", None).await;
        assert_eq!(state["data"]["isRunning"], true);

        call(&app, "POST", "/api/stop", None).await;
        let state = call(&app, "GET", "/api/state", None).await;
        assert_eq!(state["data"]["isRunning"], false);

        let fresh = call(&app, "POST", "/api/new", None).await;
        assert_eq!(fresh["data"]["queues"].as_array().unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_cycle_flashes_in_scene() {
        let server = server();
        let app = server.router();
        line(&app).await;
        server.state().backend().store().patch(|s| {
            if let Some(m) = s.machine_mut("M1") {
                m.processing_time = 1000;
            }
            if let Some(q) = s.queue_mut("Q0") {
                q.set_count(1);
            }
        });

        server.state().engine().tick();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let scene = call(&app, "GET", "/api/scene", None).await;
        let m1 = scene["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["key"]["id"] == "M1")
            .cloned()
            .unwrap();
        assert_eq!(m1["fill"], prodline_sync::scene::HIGHLIGHT_COLOR);
        let q1 = scene["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["key"]["id"] == "Q1")
            .cloned()
            .unwrap();
        assert_eq!(q1["detail"], "Products: 1");
    }
}
