//! End-to-end session scenarios: gestures in, scene out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prodline_model::{
    ApiResponse, Connection, ConnectionRequest, EntityRef, Machine, Queue, SimulationState,
    Snapshot,
};
use prodline_sync::scene::{HIGHLIGHT_COLOR, MACHINE_COLOR};
use prodline_sync::{
    PlacementMode, SceneKey, Session, SimulationApi, StreamEvent, SyncConfig, TransportSignal,
    PALETTE, RECONNECT_PENDING,
};
use tokio::sync::mpsc;

fn config() -> SyncConfig {
    SyncConfig::default()
        .with_seed(3)
        .with_arrival_probability(0.0)
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn fill(session: &Session, key: &SceneKey) -> String {
    session
        .scene()
        .get(key)
        .and_then(|o| o.node())
        .map(|n| n.fill.clone())
        .unwrap_or_default()
}

fn detail(session: &Session, key: &SceneKey) -> String {
    session
        .scene()
        .get(key)
        .and_then(|o| o.node())
        .map(|n| n.detail.clone())
        .unwrap_or_default()
}

/// Q0 at (100,100), M1 at (300,100), Q1 at (500,100), wired Q0 -> M1 -> Q1.
async fn build_line(session: &mut Session) {
    session.set_mode(PlacementMode::Queue);
    session.pointer_down(100.0, 100.0).await;
    session.pointer_down(500.0, 100.0).await;
    session.set_mode(PlacementMode::Machine);
    session.pointer_down(300.0, 100.0).await;
    session.pump().await;

    session.set_mode(PlacementMode::Connect);
    session.pointer_down(100.0, 100.0).await;
    session.pointer_down(300.0, 100.0).await;
    session.pointer_down(300.0, 100.0).await;
    session.pointer_down(500.0, 100.0).await;
    session.set_mode(PlacementMode::Connect);
    session.pump().await;
}

#[tokio::test(start_paused = true)]
async fn gestures_build_a_wired_line() {
    let mut session = Session::local(config()).unwrap();
    build_line(&mut session).await;

    let state = session.state();
    let ids: Vec<_> = state.queues.iter().map(|q| q.id.as_str()).collect();
    assert_eq!(ids, vec!["Q0", "Q1"]);
    assert_eq!(state.machines[0].id, "M1");
    assert_eq!(state.connections.len(), 2);
    assert_eq!(state.output_connection("M1").map(|c| c.target_id.as_str()), Some("Q1"));

    assert_eq!(session.scene().len(), 5);
    assert_eq!(session.controller().mode(), PlacementMode::None);
}

#[tokio::test(start_paused = true)]
async fn machine_cycle_shows_up_in_the_scene() {
    let mut session = Session::local(config()).unwrap();
    build_line(&mut session).await;
    session.store().patch(|s| {
        if let Some(m) = s.machine_mut("M1") {
            m.processing_time = 1000;
        }
        if let Some(q) = s.queue_mut("Q0") {
            q.set_count(3);
        }
    });
    session.pump().await;

    let engine = session.engine().cloned().unwrap();
    engine.tick();
    session.pump().await;

    let m1 = SceneKey::machine("M1");
    assert!(PALETTE.contains(&fill(&session, &m1).as_str()));
    assert_eq!(detail(&session, &SceneKey::queue("Q0")), "Products: 2");

    tokio::time::sleep(Duration::from_millis(1000)).await;
    settle().await;
    session.pump().await;
    assert_eq!(fill(&session, &m1), HIGHLIGHT_COLOR);
    assert_eq!(detail(&session, &SceneKey::queue("Q1")), "Products: 1");
    assert!(session.state().machine("M1").unwrap().is_idle());

    tokio::time::sleep(Duration::from_millis(500)).await;
    session.pump().await;
    assert_eq!(fill(&session, &m1), MACHINE_COLOR);
}

#[tokio::test(start_paused = true)]
async fn self_connection_gesture_creates_nothing() {
    let mut session = Session::local(config()).unwrap();
    session.set_mode(PlacementMode::Queue);
    session.pointer_down(100.0, 100.0).await;
    session.pump().await;

    session.set_mode(PlacementMode::Connect);
    session.pointer_down(100.0, 100.0).await;
    session.pointer_down(110.0, 90.0).await;
    session.pump().await;

    assert!(session.state().connections.is_empty());
    assert!(session.controller().connect_source().is_none());
}

#[tokio::test(start_paused = true)]
async fn drag_moves_only_when_released() {
    let mut session = Session::local(config()).unwrap();
    build_line(&mut session).await;
    let revision = session.store().revision();

    assert!(session.begin_drag(300.0, 100.0));
    session.drag_to(310.0, 150.0);
    session.drag_to(320.0, 180.0);
    assert_eq!(session.store().revision(), revision);
    let center = session
        .scene()
        .get(&SceneKey::machine("M1"))
        .and_then(|o| o.node())
        .map(|n| (n.center.x, n.center.y));
    assert_eq!(center, Some((320.0, 180.0)));

    session.end_drag().await;
    session.pump().await;
    let m1 = session.state().machine("M1").cloned().unwrap();
    assert_eq!((m1.x, m1.y), (320.0, 180.0));
    assert_eq!(session.store().revision(), revision + 1);
    assert!(!session.scene().has_preview());
}

#[tokio::test(start_paused = true)]
async fn delete_selected_removes_entity_and_edges() {
    let mut session = Session::local(config()).unwrap();
    build_line(&mut session).await;

    session.pointer_down(300.0, 100.0).await;
    session.delete_selected().await;
    let report = session.pump().await;

    assert!(session.state().machines.is_empty());
    assert!(session.state().connections.is_empty());
    assert_eq!(report.removed.len(), 3);
    assert!(session.controller().selection().is_none());
}

#[tokio::test(start_paused = true)]
async fn replay_and_return_to_live() {
    let mut session = Session::local(config()).unwrap();
    build_line(&mut session).await;
    let snap = session.create_snapshot(None).await.unwrap();
    assert_eq!(session.snapshots().len(), 1);

    session.set_mode(PlacementMode::Queue);
    session.pointer_down(700.0, 300.0).await;
    session.pump().await;
    assert_eq!(session.state().queues.len(), 3);

    session.replay(&snap.id).await;
    session.pump().await;
    assert!(session.ui_status().replaying);
    assert_eq!(session.state().queues.len(), 2);
    assert!(session.scene().get(&SceneKey::queue("Q2")).is_none());

    session.return_to_live().await;
    session.pump().await;
    assert!(!session.ui_status().replaying);
    assert_eq!(session.state().queues.len(), 3);
}

/// Backend that refuses everything, as a dead remote would.
/// Remote backend that refuses everything except, optionally, moves.
#[derive(Default)]
struct Stub {
    accept_moves: bool,
}

#[async_trait]
impl SimulationApi for Stub {
    async fn get_state(&self) -> ApiResponse<SimulationState> {
        ApiResponse::err("backend down")
    }
    async fn create_queue(&self, _x: f64, _y: f64) -> ApiResponse<Queue> {
        ApiResponse::err("backend down")
    }
    async fn create_machine(&self, _x: f64, _y: f64) -> ApiResponse<Machine> {
        ApiResponse::err("backend down")
    }
    async fn create_connection(&self, _r: ConnectionRequest) -> ApiResponse<Connection> {
        ApiResponse::err("backend down")
    }
    async fn delete_element(&self, _e: &EntityRef) -> ApiResponse<()> {
        ApiResponse::err("backend down")
    }
    async fn delete_connection(&self, _id: &str) -> ApiResponse<()> {
        ApiResponse::err("backend down")
    }
    async fn update_position(&self, _e: &EntityRef, _x: f64, _y: f64) -> ApiResponse<()> {
        if self.accept_moves {
            ApiResponse::ok_empty()
        } else {
            ApiResponse::err("backend down")
        }
    }
    async fn start(&self) -> ApiResponse<()> {
        ApiResponse::err("backend down")
    }
    async fn stop(&self) -> ApiResponse<()> {
        ApiResponse::err("backend down")
    }
    async fn restart(&self) -> ApiResponse<SimulationState> {
        ApiResponse::err("backend down")
    }
    async fn new_simulation(&self) -> ApiResponse<SimulationState> {
        ApiResponse::err("backend down")
    }
    async fn list_snapshots(&self) -> ApiResponse<Vec<Snapshot>> {
        ApiResponse::err("backend down")
    }
    async fn create_snapshot(&self, _label: Option<String>) -> ApiResponse<Snapshot> {
        ApiResponse::err("backend down")
    }
    async fn replay_snapshot(&self, _id: &str) -> ApiResponse<SimulationState> {
        ApiResponse::err("backend down")
    }
    async fn return_to_live(&self) -> ApiResponse<SimulationState> {
        ApiResponse::err("backend down")
    }
}

fn remote_state() -> SimulationState {
    let mut state = SimulationState::default();
    state.queues.push(Queue::new("Q0", 100.0, 100.0));
    state.machines.push(Machine::new("M1", 300.0, 100.0, 2000));
    state
}

fn frame(event: StreamEvent) -> TransportSignal {
    TransportSignal::Message(serde_json::to_string(&event.to_message()).unwrap())
}

#[tokio::test]
async fn unknown_remote_event_changes_nothing() {
    let mut session = Session::remote(Arc::new(Stub::default()), &config());
    let (tx, rx) = mpsc::channel(8);
    session.connect(rx);

    tx.send(TransportSignal::Opened).await.unwrap();
    tx.send(frame(StreamEvent::StateUpdate(remote_state()))).await.unwrap();
    settle().await;
    session.pump().await;
    let revision = session.store().revision();
    let handles: Vec<_> = session.scene().objects().iter().map(|o| o.handle).collect();

    tx.send(TransportSignal::Message(r#"{"type":"FOO","data":{"x":1}}"#.into()))
        .await
        .unwrap();
    settle().await;
    let report = session.pump().await;

    assert!(report.is_empty());
    assert_eq!(session.store().revision(), revision);
    let after: Vec<_> = session.scene().objects().iter().map(|o| o.handle).collect();
    assert_eq!(after, handles);
    assert!(session.ui_status().connected);
}

#[tokio::test]
async fn remote_connectivity_is_reflected() {
    let mut session = Session::remote(Arc::new(Stub::default()), &config());
    let (tx, rx) = mpsc::channel(8);
    session.connect(rx);
    assert!(!session.ui_status().connected);

    tx.send(TransportSignal::Opened).await.unwrap();
    settle().await;
    session.pump().await;
    assert!(session.ui_status().connected);

    tx.send(TransportSignal::Error("socket reset".into())).await.unwrap();
    settle().await;
    session.pump().await;
    let status = session.ui_status();
    assert!(!status.connected);
    assert_eq!(status.error.as_deref(), Some(RECONNECT_PENDING));

    session.close();
    session.pump().await;
    assert!(!session.ui_status().connected);
}

#[tokio::test]
async fn refused_request_surfaces_as_status_error() {
    let mut session = Session::remote(Arc::new(Stub::default()), &config());
    session.set_mode(PlacementMode::Queue);
    session.pointer_down(50.0, 50.0).await;

    assert_eq!(session.ui_status().error.as_deref(), Some("backend down"));
    assert!(session.state().queues.is_empty());
}

#[tokio::test]
async fn remote_flash_pulses_machine() {
    let mut session = Session::remote(Arc::new(Stub::default()), &config());
    let (tx, rx) = mpsc::channel(8);
    session.connect(rx);
    tx.send(frame(StreamEvent::StateUpdate(remote_state()))).await.unwrap();
    tx.send(TransportSignal::Message(
        r#"{"type":"MACHINE_FLASH","data":"M1"}"#.into(),
    ))
    .await
    .unwrap();
    settle().await;
    session.pump().await;

    assert!(session.scene().is_flashing("M1"));
    assert_eq!(fill(&session, &SceneKey::machine("M1")), HIGHLIGHT_COLOR);
}

#[tokio::test]
async fn queue_event_for_removed_queue_is_dropped() {
    let mut session = Session::remote(Arc::new(Stub::default()), &config());
    let (tx, rx) = mpsc::channel(8);
    session.connect(rx);
    tx.send(frame(StreamEvent::StateUpdate(remote_state()))).await.unwrap();
    settle().await;
    session.pump().await;
    let revision = session.store().revision();

    tx.send(TransportSignal::Message(
        r#"{"type":"QUEUE_EVENT","data":{"eventType":"PRODUCT_ADDED","queueId":"Q9","newQueueSize":4}}"#
            .into(),
    ))
    .await
    .unwrap();
    tx.send(TransportSignal::Message(
        r#"{"type":"QUEUE_EVENT","data":{"eventType":"PRODUCT_ADDED","queueId":"Q0","newQueueSize":4}}"#
            .into(),
    ))
    .await
    .unwrap();
    settle().await;
    session.pump().await;

    assert_eq!(session.store().revision(), revision + 1);
    assert_eq!(detail(&session, &SceneKey::queue("Q0")), "Products: 4");
}

fn m1_center(session: &Session) -> Option<(f64, f64)> {
    session
        .scene()
        .get(&SceneKey::machine("M1"))
        .and_then(|o| o.node())
        .map(|n| (n.center.x, n.center.y))
}

#[tokio::test]
async fn accepted_remote_drag_holds_until_echo() {
    let mut session = Session::remote(Arc::new(Stub { accept_moves: true }), &config());
    let (tx, rx) = mpsc::channel(8);
    session.connect(rx);
    tx.send(frame(StreamEvent::StateUpdate(remote_state()))).await.unwrap();
    settle().await;
    session.pump().await;

    assert!(session.begin_drag(300.0, 100.0));
    session.drag_to(320.0, 180.0);
    session.end_drag().await;
    assert_eq!(m1_center(&session), Some((320.0, 180.0)));
    assert!(session.ui_status().error.is_none());

    // Unrelated change before the echo: the machine stays where it was dropped
    let mut q0 = Queue::new("Q0", 100.0, 100.0);
    q0.set_count(2);
    tx.send(frame(StreamEvent::QueueUpdate(q0))).await.unwrap();
    settle().await;
    session.pump().await;
    assert_eq!(m1_center(&session), Some((320.0, 180.0)));

    let mut moved = remote_state();
    moved.machines[0].x = 320.0;
    moved.machines[0].y = 180.0;
    tx.send(frame(StreamEvent::StateUpdate(moved))).await.unwrap();
    settle().await;
    session.pump().await;
    assert_eq!(m1_center(&session), Some((320.0, 180.0)));
    assert!(!session.scene().has_preview());
}

#[tokio::test]
async fn refused_remote_drag_snaps_back() {
    let mut session = Session::remote(Arc::new(Stub::default()), &config());
    let (tx, rx) = mpsc::channel(8);
    session.connect(rx);
    tx.send(frame(StreamEvent::StateUpdate(remote_state()))).await.unwrap();
    settle().await;
    session.pump().await;

    assert!(session.begin_drag(300.0, 100.0));
    session.drag_to(320.0, 180.0);
    session.end_drag().await;

    assert_eq!(session.ui_status().error.as_deref(), Some("backend down"));
    assert!(!session.scene().has_preview());
    assert_eq!(m1_center(&session), Some((300.0, 100.0)));
}
