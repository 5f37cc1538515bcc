//! Action and raw-event data model
//!
//! Raw events arrive from the platform hook in the shape described by the
//! event-source contract; the normalizer turns them into `Action` records,
//! which are the unit every downstream component works with.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Semantic action kinds emitted by the normalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    ScrollStart,
    ScrollEnd,
    Keypress,
    DragStart,
    DragEnd,
    MouseoverStart,
    MouseoverEnd,
    Input,
}

impl ActionType {
    /// Boundary actions mark the edges of a continuous gesture and get a
    /// single "during" screenshot; discrete actions get before/after pairs.
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            ActionType::ScrollStart
                | ActionType::ScrollEnd
                | ActionType::DragStart
                | ActionType::DragEnd
                | ActionType::MouseoverStart
                | ActionType::MouseoverEnd
        )
    }
}

/// Screen coordinates in raw device pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub x: f64,
    pub y: f64,
}

impl Coords {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance, in raw device pixels (no DPI normalization)
    pub fn distance_to(&self, other: &Coords) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Other(u8),
}

/// Active modifier keys on a raw event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    pub control: bool,
    pub shift: bool,
    pub alt: bool,
    pub meta: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerMeta {
    pub button: MouseButton,
    pub click_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMeta {
    pub key: String,
    pub code: String,
    pub modifiers: Modifiers,
    pub key_codes: Vec<u16>,
}

/// A normalized semantic input event.
///
/// Created by the normalizer when a gesture is recognized; the capture
/// coordinator later attaches screenshot references in place. Never deleted
/// during a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub action_id: Uuid,
    pub session_id: Uuid,
    #[serde(rename = "type")]
    pub kind: ActionType,

    /// Wall-clock time in unix milliseconds
    pub happened_at: u64,

    /// Milliseconds since session start, non-decreasing in emission order
    pub relative_time_ms: u64,

    /// Position in the recorded media timeline, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_timestamp_ms: Option<u64>,

    pub coords: Coords,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer_meta: Option<PointerMeta>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_meta: Option<KeyMeta>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_value: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_screenshot_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_screenshot_ref: Option<String>,
}

impl Action {
    pub fn new(
        session_id: Uuid,
        kind: ActionType,
        happened_at: u64,
        relative_time_ms: u64,
        coords: Coords,
    ) -> Self {
        Self {
            action_id: Uuid::new_v4(),
            session_id,
            kind,
            happened_at,
            relative_time_ms,
            stream_timestamp_ms: None,
            coords,
            pointer_meta: None,
            key_meta: None,
            input_value: None,
            screenshot_ref: None,
            before_screenshot_ref: None,
            after_screenshot_ref: None,
        }
    }
}

/// Raw event kinds delivered by the platform hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawEventKind {
    ButtonDown,
    ButtonUp,
    Drag,
    Wheel,
    Move,
    KeyDown,
    InputCommit,
}

/// A raw, unnormalized input event.
///
/// Every field besides `kind` is optional; missing coordinates default to
/// `(0, 0)` when the normalizer reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInputEvent {
    #[serde(rename = "type")]
    pub kind: RawEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button: Option<MouseButton>,
    #[serde(default)]
    pub modifiers: Modifiers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl RawInputEvent {
    fn bare(kind: RawEventKind) -> Self {
        Self {
            kind,
            x: None,
            y: None,
            key_code: None,
            button: None,
            modifiers: Modifiers::default(),
            value: None,
        }
    }

    pub fn button_down(x: f64, y: f64, button: MouseButton) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            button: Some(button),
            ..Self::bare(RawEventKind::ButtonDown)
        }
    }

    pub fn button_up(x: f64, y: f64, button: MouseButton) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            button: Some(button),
            ..Self::bare(RawEventKind::ButtonUp)
        }
    }

    pub fn drag(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::bare(RawEventKind::Drag)
        }
    }

    pub fn wheel(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::bare(RawEventKind::Wheel)
        }
    }

    pub fn mouse_move(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::bare(RawEventKind::Move)
        }
    }

    pub fn key_down(key_code: u16, modifiers: Modifiers) -> Self {
        Self {
            key_code: Some(key_code),
            modifiers,
            ..Self::bare(RawEventKind::KeyDown)
        }
    }

    pub fn input_commit(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::bare(RawEventKind::InputCommit)
        }
    }

    /// Coordinates with the contract's `(0, 0)` default for absent fields
    pub fn coords(&self) -> Coords {
        Coords::new(self.x.unwrap_or(0.0), self.y.unwrap_or(0.0))
    }
}

/// Resolve a raw key code into a human-readable key and a layout code.
///
/// Covers the common keys; anything else falls through to a stable
/// `Key{code}` form so the record is still self-describing.
pub fn resolve_key(key_code: u16) -> (String, String) {
    let named = match key_code {
        8 => Some(("Backspace", "Backspace")),
        9 => Some(("Tab", "Tab")),
        13 => Some(("Enter", "Enter")),
        16 => Some(("Shift", "ShiftLeft")),
        17 => Some(("Control", "ControlLeft")),
        18 => Some(("Alt", "AltLeft")),
        27 => Some(("Escape", "Escape")),
        32 => Some((" ", "Space")),
        37 => Some(("ArrowLeft", "ArrowLeft")),
        38 => Some(("ArrowUp", "ArrowUp")),
        39 => Some(("ArrowRight", "ArrowRight")),
        40 => Some(("ArrowDown", "ArrowDown")),
        46 => Some(("Delete", "Delete")),
        91 => Some(("Meta", "MetaLeft")),
        _ => None,
    };
    if let Some((key, code)) = named {
        return (key.to_string(), code.to_string());
    }
    match key_code {
        48..=57 => {
            let digit = (key_code - 48) as u8;
            (
                ((b'0' + digit) as char).to_string(),
                format!("Digit{}", digit),
            )
        }
        65..=90 => {
            let letter = (key_code as u8) as char;
            (
                letter.to_ascii_lowercase().to_string(),
                format!("Key{}", letter),
            )
        }
        112..=123 => {
            let f = key_code - 111;
            (format!("F{}", f), format!("F{}", f))
        }
        _ => (format!("Key{}", key_code), format!("Key{}", key_code)),
    }
}
