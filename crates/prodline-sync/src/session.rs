//! One diagram session: a state source, the scene, and the user's gestures.
//!
//! A session is fed either by a [`RemoteStream`] (remote backend) or by a
//! [`LocalEngine`] behind a [`LocalBackend`]; never both. Either way, state
//! changes arrive through the store and are reconciled into the scene one at
//! a time, and intents go out through [`SimulationApi`].

use std::sync::Arc;

use prodline_model::{ApiResponse, ConnectionRequest, EntityRef, SimulationState, Snapshot};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::SimulationApi;
use crate::backend::LocalBackend;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::{Effect, Normalizer, StreamEvent};
use crate::interaction::{Intent, InteractionController, PlacementMode};
use crate::scene::{ReconcileReport, SceneGraph};
use crate::simulation::LocalEngine;
use crate::store::{StateChange, StateStore};
use crate::stream::{Connectivity, RemoteStream, TransportSignal};

/// What the chrome around the diagram shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiStatus {
    pub connected: bool,
    pub error: Option<String>,
    pub replaying: bool,
}

enum Source {
    Remote(RemoteStream),
    Local(LocalEngine),
}

pub struct Session {
    store: StateStore,
    normalizer: Normalizer,
    api: Arc<dyn SimulationApi>,
    source: Source,
    scene: SceneGraph,
    controller: InteractionController,
    changes: mpsc::UnboundedReceiver<StateChange>,
    effects: mpsc::UnboundedReceiver<Effect>,
    status: watch::Sender<UiStatus>,
    link: Option<watch::Receiver<Connectivity>>,
    seen_link: Connectivity,
    snapshots: Vec<Snapshot>,
}

impl Session {
    /// A session driven by the in-process engine.
    pub fn local(config: SyncConfig) -> Result<Self> {
        let store = StateStore::default();
        let (effects_tx, effects) = mpsc::unbounded_channel();
        let normalizer = Normalizer::new(store.clone(), effects_tx);
        let engine = LocalEngine::new(normalizer.clone(), config.clone())?;
        let api = Arc::new(LocalBackend::new(store.clone(), engine.clone()));
        let changes = store.subscribe();
        let (status, _) = watch::channel(UiStatus {
            connected: true,
            ..UiStatus::default()
        });
        Ok(Self {
            store,
            normalizer,
            api,
            source: Source::Local(engine),
            scene: SceneGraph::new(config.flash_duration),
            controller: InteractionController::new(),
            changes,
            effects,
            status,
            link: None,
            seen_link: Connectivity::default(),
            snapshots: Vec::new(),
        })
    }

    /// A session fed by a remote backend's push stream.
    pub fn remote(api: Arc<dyn SimulationApi>, config: &SyncConfig) -> Self {
        let store = StateStore::default();
        let (effects_tx, effects) = mpsc::unbounded_channel();
        let normalizer = Normalizer::new(store.clone(), effects_tx);
        let stream = RemoteStream::new(normalizer.clone());
        let link = Some(stream.status());
        let changes = store.subscribe();
        let (status, _) = watch::channel(UiStatus::default());
        Self {
            store,
            normalizer,
            api,
            source: Source::Remote(stream),
            scene: SceneGraph::new(config.flash_duration),
            controller: InteractionController::new(),
            changes,
            effects,
            status,
            link,
            seen_link: Connectivity::default(),
            snapshots: Vec::new(),
        }
    }

    /// Attach a transport session. Ignored for local sessions.
    pub fn connect(&self, signals: mpsc::Receiver<TransportSignal>) {
        match &self.source {
            Source::Remote(stream) => stream.subscribe(signals),
            Source::Local(_) => debug!("local session has no push stream"),
        }
    }

    /// Drop the push subscription or stop the engine.
    pub fn close(&self) {
        match &self.source {
            Source::Remote(stream) => stream.close(),
            Source::Local(engine) => {
                engine.stop();
            }
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn state(&self) -> Arc<SimulationState> {
        self.store.current()
    }

    pub fn scene(&self) -> &SceneGraph {
        &self.scene
    }

    pub fn controller(&self) -> &InteractionController {
        &self.controller
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn status(&self) -> watch::Receiver<UiStatus> {
        self.status.subscribe()
    }

    pub fn ui_status(&self) -> UiStatus {
        self.status.borrow().clone()
    }

    /// The local engine, for local sessions.
    pub fn engine(&self) -> Option<&LocalEngine> {
        match &self.source {
            Source::Local(engine) => Some(engine),
            Source::Remote(_) => None,
        }
    }

    /// Handle everything that is ready now: state changes, effects, expired
    /// flashes and connectivity. Returns what the scene did.
    pub async fn pump(&mut self) -> ReconcileReport {
        let mut total = ReconcileReport::default();
        while let Ok(change) = self.changes.try_recv() {
            let report = self.scene.reconcile(&change.state);
            total.added.extend(report.added);
            total.updated.extend(report.updated);
            total.removed.extend(report.removed);
        }

        let mut refresh = false;
        let now = Instant::now();
        while let Ok(effect) = self.effects.try_recv() {
            match effect {
                Effect::Flash(machine_id) => {
                    self.scene.flash(&machine_id, now);
                }
                Effect::RefreshSnapshots => refresh = true,
            }
        }
        self.scene.expire_flashes(now);

        if let Some(rx) = &self.link {
            let link = rx.borrow().clone();
            if link != self.seen_link {
                self.status.send_modify(|s| {
                    s.connected = link.connected;
                    s.error = link.error.clone();
                });
                self.seen_link = link;
            }
        }

        if refresh {
            self.refresh_snapshots().await;
        }
        total
    }

    /// Wait until a state change, effect, flash deadline or connectivity change
    /// is due, then pump.
    pub async fn wait(&mut self) -> ReconcileReport {
        let deadline = self.scene.next_flash_deadline();
        let flash_due = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        let link = self.link.as_mut();
        let link_changed = async move {
            if let Some(rx) = link {
                if rx.changed().await.is_ok() {
                    return;
                }
            }
            std::future::pending::<()>().await
        };
        let mut first = ReconcileReport::default();
        tokio::select! {
            Some(change) = self.changes.recv() => {
                first = self.scene.reconcile(&change.state);
            }
            Some(effect) = self.effects.recv() => match effect {
                Effect::Flash(machine_id) => {
                    self.scene.flash(&machine_id, Instant::now());
                }
                Effect::RefreshSnapshots => self.refresh_snapshots().await,
            },
            _ = flash_due => {}
            _ = link_changed => {}
            else => {}
        }
        let mut rest = self.pump().await;
        first.added.append(&mut rest.added);
        first.updated.append(&mut rest.updated);
        first.removed.append(&mut rest.removed);
        first
    }

    fn settle<T>(&self, response: ApiResponse<T>) -> Option<T> {
        match response.into_result() {
            Ok(data) => {
                self.status.send_if_modified(|s| s.error.take().is_some());
                data
            }
            Err(message) => {
                warn!(%message, "request failed");
                self.status.send_modify(|s| s.error = Some(message));
                None
            }
        }
    }

    fn settle_ok(&self, response: ApiResponse<()>) -> bool {
        let ok = response.success;
        self.settle(response);
        ok
    }

    /// Install a state returned by a request. Local backends already did.
    fn adopt(&self, state: Option<SimulationState>) {
        if let (Source::Remote(_), Some(state)) = (&self.source, state) {
            self.normalizer.apply(StreamEvent::StateUpdate(state));
        }
    }

    /// Send an intent to the backend.
    pub async fn dispatch(&mut self, intent: Intent) {
        debug!(?intent, "dispatching");
        match intent {
            Intent::PlaceQueue { x, y } => {
                let response = self.api.create_queue(x, y).await;
                self.settle(response);
            }
            Intent::PlaceMachine { x, y } => {
                let response = self.api.create_machine(x, y).await;
                self.settle(response);
            }
            Intent::Select(_) => {}
            Intent::Connect { source, target } => {
                let request = ConnectionRequest {
                    source_id: source.id,
                    source_type: source.kind,
                    target_id: target.id,
                    target_type: target.kind,
                };
                let response = self.api.create_connection(request).await;
                self.settle(response);
            }
            Intent::Move { entity, x, y } => {
                let response = self.api.update_position(&entity, x, y).await;
                // On success the preview holds until the new position arrives.
                if !self.settle_ok(response) {
                    self.scene.clear_preview();
                }
                let state = self.store.current();
                self.scene.reconcile(&state);
            }
            Intent::Delete(entity) => {
                let response = self.api.delete_element(&entity).await;
                if self.settle_ok(response) {
                    self.controller.clear_selection();
                }
            }
        }
    }

    pub fn set_mode(&mut self, mode: PlacementMode) -> PlacementMode {
        self.controller.set_mode(mode)
    }

    /// Pointer pressed on the canvas.
    pub async fn pointer_down(&mut self, x: f64, y: f64) {
        let hit = self.scene.hit_test(x, y);
        if let Some(intent) = self.controller.pointer_down(x, y, hit) {
            self.dispatch(intent).await;
        }
    }

    /// Start dragging whatever is under the pointer. Returns false on empty canvas.
    pub fn begin_drag(&mut self, x: f64, y: f64) -> bool {
        match self.scene.hit_test(x, y) {
            Some(entity) => {
                self.controller.begin_drag(entity);
                true
            }
            None => false,
        }
    }

    pub fn drag_to(&mut self, x: f64, y: f64) {
        if let Some((entity, x, y)) = self.controller.drag_to(x, y) {
            self.scene.set_preview(&entity, x, y);
        }
    }

    pub async fn end_drag(&mut self) {
        match self.controller.end_drag() {
            Some(intent) => self.dispatch(intent).await,
            None => self.scene.clear_preview(),
        }
    }

    pub async fn delete_selected(&mut self) {
        if let Some(intent) = self.controller.delete_selected() {
            self.dispatch(intent).await;
        }
    }

    pub async fn delete_connection(&mut self, id: &str) {
        let response = self.api.delete_connection(id).await;
        self.settle(response);
    }

    pub async fn start(&mut self) {
        let response = self.api.start().await;
        self.settle(response);
    }

    pub async fn stop(&mut self) {
        let response = self.api.stop().await;
        self.settle(response);
    }

    pub async fn restart(&mut self) {
        let response = self.api.restart().await;
        let state = self.settle(response);
        self.adopt(state);
    }

    pub async fn new_simulation(&mut self) {
        let response = self.api.new_simulation().await;
        if let Some(state) = self.settle(response) {
            self.controller.reset();
            self.snapshots.clear();
            self.status.send_modify(|s| s.replaying = false);
            self.adopt(Some(state));
        }
    }

    pub async fn refresh_snapshots(&mut self) {
        let response = self.api.list_snapshots().await;
        if let Some(list) = self.settle(response) {
            self.snapshots = list;
        }
    }

    pub async fn create_snapshot(&mut self, label: Option<String>) -> Option<Snapshot> {
        let response = self.api.create_snapshot(label).await;
        let snapshot = self.settle(response)?;
        self.refresh_snapshots().await;
        Some(snapshot)
    }

    pub async fn replay(&mut self, id: &str) {
        let response = self.api.replay_snapshot(id).await;
        if let Some(state) = self.settle(response) {
            self.status.send_modify(|s| s.replaying = true);
            self.adopt(Some(state));
        }
    }

    pub async fn return_to_live(&mut self) {
        let response = self.api.return_to_live().await;
        if let Some(state) = self.settle(response) {
            self.status.send_modify(|s| s.replaying = false);
            self.adopt(Some(state));
        }
    }

    /// Select an entity programmatically, as a click on it would.
    pub async fn select(&mut self, entity: Option<EntityRef>) {
        if let Some(intent) = self.controller.select(entity) {
            self.dispatch(intent).await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
