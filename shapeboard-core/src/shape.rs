//! Shape records stored in the shared document.
//!
//! A shape is an immutable value inside the replicated sequence: every
//! mutation produces a new record that replaces the old one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of canvas element. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Square,
    Circle,
    Sticky,
    Text,
}

impl ShapeKind {
    pub const ALL: [ShapeKind; 4] = [
        ShapeKind::Square,
        ShapeKind::Circle,
        ShapeKind::Sticky,
        ShapeKind::Text,
    ];

    /// Whether shapes of this kind carry editable text.
    pub fn has_content(self) -> bool {
        matches!(self, ShapeKind::Sticky | ShapeKind::Text)
    }

    /// Content a freshly created shape starts with.
    pub fn default_content(self) -> Option<&'static str> {
        match self {
            ShapeKind::Sticky => Some("New note"),
            ShapeKind::Text => Some("Text"),
            ShapeKind::Square | ShapeKind::Circle => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShapeKind::Square => "square",
            ShapeKind::Circle => "circle",
            ShapeKind::Sticky => "sticky",
            ShapeKind::Text => "text",
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown shape kind: {0}")]
pub struct UnknownShapeKind(pub String);

impl FromStr for ShapeKind {
    type Err = UnknownShapeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShapeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownShapeKind(s.to_string()))
    }
}

/// One canvas element.
///
/// Serialized as `{"id", "type", "x", "y", "content"?}`; `content` is
/// omitted for kinds without text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Shape {
    /// Create a shape with the kind's default content.
    pub fn new(id: impl Into<String>, kind: ShapeKind, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            x,
            y,
            content: kind.default_content().map(str::to_string),
        }
    }

    /// Copy of this record at a new position.
    pub fn with_position(&self, x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            ..self.clone()
        }
    }

    /// Copy of this record with new text, or `None` if the kind has no text.
    pub fn with_content(&self, content: impl Into<String>) -> Option<Self> {
        if !self.kind.has_content() {
            return None;
        }
        Some(Self {
            content: Some(content.into()),
            ..self.clone()
        })
    }

    /// Force `content` to agree with `kind`.
    ///
    /// Records written by a misbehaving peer are repaired the same way on
    /// every replica, so the fix-up does not break convergence.
    pub fn normalized(mut self) -> Self {
        match (self.kind.has_content(), self.content.is_some()) {
            (true, false) => self.content = self.kind.default_content().map(str::to_string),
            (false, true) => self.content = None,
            _ => {}
        }
        self
    }
}
