//! Pointer gestures to intents.
//!
//! The controller holds only UI-local state (placement mode, selection, the
//! pending connection source and an in-progress drag). It never touches the
//! store; everything it decides comes out as an [`Intent`].

use prodline_model::EntityRef;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What a click on empty canvas does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementMode {
    #[default]
    None,
    Queue,
    Machine,
    Connect,
}

/// A user decision, ready to be sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    PlaceQueue { x: f64, y: f64 },
    PlaceMachine { x: f64, y: f64 },
    /// Selection changed; local only
    Select(Option<EntityRef>),
    Connect { source: EntityRef, target: EntityRef },
    Move { entity: EntityRef, x: f64, y: f64 },
    Delete(EntityRef),
}

#[derive(Debug, Clone)]
struct Drag {
    entity: EntityRef,
    at: Option<(f64, f64)>,
}

#[derive(Debug, Default)]
pub struct InteractionController {
    mode: PlacementMode,
    selection: Option<EntityRef>,
    connect_source: Option<EntityRef>,
    drag: Option<Drag>,
}

impl InteractionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> PlacementMode {
        self.mode
    }

    pub fn selection(&self) -> Option<&EntityRef> {
        self.selection.as_ref()
    }

    /// First endpoint of a connection being drawn.
    pub fn connect_source(&self) -> Option<&EntityRef> {
        self.connect_source.as_ref()
    }

    /// Switch placement mode. Choosing the active mode again turns it off.
    /// Any switch clears the selection and the pending connection source.
    pub fn set_mode(&mut self, mode: PlacementMode) -> PlacementMode {
        self.mode = if self.mode == mode {
            PlacementMode::None
        } else {
            mode
        };
        self.selection = None;
        self.connect_source = None;
        self.mode
    }

    /// Back to the initial state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
    }

    /// Pointer pressed: `hit` is whatever shape lies under it.
    pub fn pointer_down(&mut self, x: f64, y: f64, hit: Option<EntityRef>) -> Option<Intent> {
        match hit {
            Some(entity) => self.select(Some(entity)),
            None => self.canvas_click(x, y),
        }
    }

    /// Click on empty canvas.
    pub fn canvas_click(&mut self, x: f64, y: f64) -> Option<Intent> {
        match self.mode {
            PlacementMode::Queue => Some(Intent::PlaceQueue { x, y }),
            PlacementMode::Machine => Some(Intent::PlaceMachine { x, y }),
            PlacementMode::None | PlacementMode::Connect => None,
        }
    }

    /// Selection from the scene.
    ///
    /// In connect mode this feeds the two-click connection instead of changing
    /// the selection. Otherwise it selects, and selecting an entity cancels any
    /// placement mode.
    pub fn select(&mut self, entity: Option<EntityRef>) -> Option<Intent> {
        if self.mode == PlacementMode::Connect {
            let target = entity?;
            let Some(source) = self.connect_source.take() else {
                debug!(source = %target, "connection source chosen");
                self.connect_source = Some(target);
                return None;
            };
            if source.id == target.id {
                debug!(%source, "self-connection refused");
                return None;
            }
            return Some(Intent::Connect { source, target });
        }

        if entity.is_some() {
            self.mode = PlacementMode::None;
        }
        self.selection = entity.clone();
        Some(Intent::Select(entity))
    }

    /// Delete whatever is selected.
    pub fn delete_selected(&self) -> Option<Intent> {
        self.selection.clone().map(Intent::Delete)
    }

    /// Start dragging a primary shape.
    pub fn begin_drag(&mut self, entity: EntityRef) {
        self.drag = Some(Drag { entity, at: None });
    }

    /// Pointer moved during a drag. Returns the preview to show; nothing is
    /// sent to the backend until [`end_drag`](Self::end_drag).
    pub fn drag_to(&mut self, x: f64, y: f64) -> Option<(EntityRef, f64, f64)> {
        let drag = self.drag.as_mut()?;
        drag.at = Some((x, y));
        Some((drag.entity.clone(), x, y))
    }

    /// Finish the drag. A drag that never moved produces nothing.
    pub fn end_drag(&mut self) -> Option<Intent> {
        let drag = self.drag.take()?;
        let (x, y) = drag.at?;
        Some(Intent::Move {
            entity: drag.entity,
            x,
            y,
        })
    }

    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }
}
