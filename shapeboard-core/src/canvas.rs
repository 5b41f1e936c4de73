//! Mutation API: user intents translated into store operations.
//!
//! `Canvas` is the context object threaded through the UI. It owns the
//! store (single source of truth) and keeps a [`ShapeView`] current by
//! subscribing to store changes.
//!
//! Updates are written as delete + insert at the shape's current index.
//! Two replicas that update the same shape before syncing both delete the
//! original and insert their own copy; after the merge the projection keeps
//! only one of them (lost update).

use uuid::Uuid;
use yrs::Subscription;

use crate::shape::{Shape, ShapeKind};
use crate::store::{ShapeStore, StoreError};
use crate::view::ShapeView;

/// Region new shapes are dropped into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnArea {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for SpawnArea {
    fn default() -> Self {
        Self {
            x: 50.0,
            y: 50.0,
            width: 400.0,
            height: 300.0,
        }
    }
}

impl SpawnArea {
    /// Random point inside the area.
    fn sample(&self) -> (f64, f64) {
        // v4 UUIDs carry 122 random bits; the top and bottom 32 are untouched
        // by the version/variant fields.
        let bits = Uuid::new_v4().as_u128();
        let fx = (bits as u32) as f64 / u32::MAX as f64;
        let fy = ((bits >> 96) as u32) as f64 / u32::MAX as f64;
        (self.x + fx * self.width, self.y + fy * self.height)
    }
}

pub struct Canvas {
    store: ShapeStore,
    view: ShapeView,
    spawn: SpawnArea,
    _subscription: Subscription,
}

impl Canvas {
    pub fn new(store: ShapeStore) -> Result<Self, StoreError> {
        Self::with_spawn_area(store, SpawnArea::default())
    }

    pub fn with_spawn_area(store: ShapeStore, spawn: SpawnArea) -> Result<Self, StoreError> {
        let view = ShapeView::new();
        let publisher = view.clone();
        let subscription = store.observe(move |shapes| publisher.publish(shapes))?;
        // Published after subscribing so no change can fall between the two.
        view.publish(store.to_array());

        Ok(Self {
            store,
            view,
            spawn,
            _subscription: subscription,
        })
    }

    /// Append a new shape of `kind` at a random spot in the spawn area.
    pub fn create_shape(&self, kind: ShapeKind) -> Result<Shape, StoreError> {
        let (x, y) = self.spawn.sample();
        let shape = Shape::new(Uuid::new_v4().to_string(), kind, x, y);
        self.store.push(std::slice::from_ref(&shape))?;
        log::debug!("Created {kind} {} at ({x:.1}, {y:.1})", shape.id);
        Ok(shape)
    }

    /// Move shape `id`. Returns `Ok(false)` if it is not in the document.
    pub fn move_shape(&self, id: &str, x: f64, y: f64) -> Result<bool, StoreError> {
        self.update_shape(id, |shape| Some(shape.with_position(x, y)))
    }

    /// Replace the text of shape `id`.
    ///
    /// Returns `Ok(false)` if the shape is missing or its kind has no text.
    pub fn edit_content(&self, id: &str, content: &str) -> Result<bool, StoreError> {
        self.update_shape(id, |shape| shape.with_content(content))
    }

    fn update_shape<F>(&self, id: &str, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&Shape) -> Option<Shape>,
    {
        let updated = self.store.update_by_id(id, f)?;
        if !updated {
            log::debug!("Shape {id} not updated (missing or no text)");
        }
        Ok(updated)
    }

    /// Current projection.
    pub fn shapes(&self) -> Vec<Shape> {
        self.view.shapes().as_ref().clone()
    }

    pub fn view(&self) -> &ShapeView {
        &self.view
    }

    pub fn store(&self) -> &ShapeStore {
        &self.store
    }
}

impl std::fmt::Debug for Canvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canvas")
            .field("store", &self.store)
            .field("spawn", &self.spawn)
            .finish_non_exhaustive()
    }
}
