//! View Projection: the read-only shape list handed to the render layer.
//!
//! The projection is recomputed from scratch on every store notification
//! and republished as a complete replacement. Cost is O(shape count) per
//! notification, which is fine for canvas-sized documents.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use crate::shape::Shape;

/// Project the raw store sequence into the list the renderer draws.
///
/// Concurrent delete+insert updates of the same shape can leave two records
/// with one id in the merged sequence. Only the first occurrence is kept;
/// sequence order is identical on every replica, so every replica keeps the
/// same record.
pub fn project(raw: impl IntoIterator<Item = Shape>) -> Vec<Shape> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|shape| seen.insert(shape.id.clone()))
        .collect()
}

/// Immutable snapshot for rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewSnapshot {
    pub shapes: Arc<Vec<Shape>>,
    /// Bumped on every republish.
    pub version: u64,
}

type Listener = Box<dyn Fn(&ViewSnapshot) + Send + Sync>;

/// Latest projection plus the listeners that want every new one.
#[derive(Clone, Default)]
pub struct ShapeView {
    snapshot: Arc<RwLock<ViewSnapshot>>,
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl ShapeView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot (cheap clone of an `Arc`).
    pub fn snapshot(&self) -> ViewSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn shapes(&self) -> Arc<Vec<Shape>> {
        self.snapshot().shapes
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Register a listener for every republished snapshot.
    ///
    /// Listeners run inside the store transaction that caused the change
    /// and must not mutate the canvas.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&ViewSnapshot) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }

    /// Recompute from the raw sequence and notify listeners.
    pub fn publish(&self, raw: Vec<Shape>) {
        let next = {
            let mut current = self
                .snapshot
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            current.shapes = Arc::new(project(raw));
            current.version += 1;
            current.clone()
        };
        log::trace!(
            "View republished: {} shapes (v{})",
            next.shapes.len(),
            next.version
        );

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(&next);
        }
    }
}

impl std::fmt::Debug for ShapeView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeView")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ShapeKind;
    use std::sync::Mutex;

    #[test]
    fn test_project_keeps_first_duplicate() {
        let first = Shape::new("a", ShapeKind::Circle, 1.0, 1.0);
        let second = Shape::new("a", ShapeKind::Circle, 9.0, 9.0);
        let other = Shape::new("b", ShapeKind::Square, 0.0, 0.0);

        let projected = project(vec![first.clone(), other.clone(), second]);
        assert_eq!(projected, vec![first, other]);
    }

    #[test]
    fn test_publish_replaces_snapshot_and_notifies() {
        let view = ShapeView::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        view.subscribe(move |snap| sink.lock().unwrap().push((snap.version, snap.shapes.len())));

        view.publish(vec![Shape::new("a", ShapeKind::Square, 0.0, 0.0)]);
        view.publish(vec![
            Shape::new("a", ShapeKind::Square, 0.0, 0.0),
            Shape::new("b", ShapeKind::Text, 0.0, 0.0),
        ]);

        assert_eq!(view.version(), 2);
        assert_eq!(view.shapes().len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 1), (2, 2)]);
    }
}
