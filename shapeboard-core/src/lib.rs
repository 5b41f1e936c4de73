//! # shapeboard-core — replicated shape document
//!
//! Client-resident half of the shapeboard sync engine:
//!
//! ```text
//!  user intent ──► Canvas (mutation API) ──► ShapeStore (Yrs array) ──► encoded updates ──► transport
//!                                                   │        ▲
//!                                    observe()      │        └── apply_update() ◄── remote updates
//!                                                   ▼
//!                                          ShapeView (projection) ──► render layer
//! ```
//!
//! ## Modules
//!
//! - [`shape`] — `Shape` records and `ShapeKind`
//! - [`store`] — `ShapeStore`, the CRDT-backed ordered sequence
//! - [`view`] — pure projection and the published `ViewSnapshot`
//! - [`canvas`] — `Canvas`: create / move / edit intents

pub mod canvas;
pub mod shape;
pub mod store;
pub mod view;

pub use canvas::{Canvas, SpawnArea};
pub use shape::{Shape, ShapeKind, UnknownShapeKind};
pub use store::{ShapeStore, StoreError, SHAPES_ARRAY};
pub use view::{project, ShapeView, ViewSnapshot};

/// Keeps an observer registered until dropped.
pub use yrs::Subscription;
