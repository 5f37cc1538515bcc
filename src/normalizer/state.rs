//! Gesture recognition state machine
//!
//! Pure, single-owner state: the async driver in `normalizer::mod` serializes
//! every raw event and timer firing into this struct, so nothing here needs
//! locking. Timer scheduling is returned to the caller as `TimerRequest`s
//! rather than performed here, which keeps the machine deterministic under
//! test.

use crate::action::{
    resolve_key, Action, ActionType, Coords, KeyMeta, MouseButton, PointerMeta, RawEventKind,
    RawInputEvent,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tunable gesture thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizerConfig {
    /// Max interval between button-downs that still counts as a multi-click
    pub multi_click_interval_ms: u64,
    /// Max distance between button-downs that still counts as a multi-click
    pub multi_click_radius_px: f64,
    /// Idle window after the last wheel event before a scroll ends
    pub scroll_idle_ms: u64,
    /// Idle window after the last move event before a hover ends
    pub hover_idle_ms: u64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            multi_click_interval_ms: 500,
            multi_click_radius_px: 10.0,
            scroll_idle_ms: 150,
            hover_idle_ms: 350,
        }
    }
}

/// Timestamps for one machine step
#[derive(Debug, Clone, Copy)]
pub struct EventTime {
    /// Wall-clock unix milliseconds
    pub wall_ms: u64,
    /// Milliseconds since session start
    pub rel_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Scroll,
    Hover,
}

/// A debounce timer the driver must (re)schedule, cancelling any previously
/// pending timer of the same kind.
#[derive(Debug, Clone, Copy)]
pub struct TimerRequest {
    pub kind: TimerKind,
    pub generation: u64,
    pub delay_ms: u64,
}

/// Output of one machine step
#[derive(Debug, Default)]
pub struct StepOutput {
    pub actions: Vec<Action>,
    pub timers: Vec<TimerRequest>,
}

struct LastClick {
    button: MouseButton,
    rel_ms: u64,
    coords: Coords,
    count: u32,
}

/// The per-session gesture state machine
pub struct NormalizerState {
    config: NormalizerConfig,
    session_id: Uuid,

    last_click: Option<LastClick>,
    left_button_down: bool,
    button_down_coords: Coords,

    drag_active: bool,
    drag_origin: Coords,

    scroll_active: bool,
    scroll_generation: u64,
    last_wheel_coords: Coords,
    last_wheel_time: EventTime,

    hover_active: bool,
    hover_generation: u64,
    last_hover_coords: Coords,
    last_hover_time: EventTime,
}

impl NormalizerState {
    pub fn new(session_id: Uuid, config: NormalizerConfig) -> Self {
        Self {
            config,
            session_id,
            last_click: None,
            left_button_down: false,
            button_down_coords: Coords::default(),
            drag_active: false,
            drag_origin: Coords::default(),
            scroll_active: false,
            scroll_generation: 0,
            last_wheel_coords: Coords::default(),
            last_wheel_time: EventTime { wall_ms: 0, rel_ms: 0 },
            hover_active: false,
            hover_generation: 0,
            last_hover_coords: Coords::default(),
            last_hover_time: EventTime { wall_ms: 0, rel_ms: 0 },
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn action(&self, kind: ActionType, t: EventTime, coords: Coords) -> Action {
        Action::new(self.session_id, kind, t.wall_ms, t.rel_ms, coords)
    }

    /// Feed one raw event into the machine
    pub fn on_event(&mut self, ev: &RawInputEvent, t: EventTime) -> StepOutput {
        let mut out = StepOutput::default();
        match ev.kind {
            RawEventKind::ButtonDown => self.on_button_down(ev, t, &mut out),
            RawEventKind::ButtonUp => self.on_button_up(ev, t, &mut out),
            RawEventKind::Drag => self.on_drag(ev, t, &mut out),
            RawEventKind::Wheel => self.on_wheel(ev, t, &mut out),
            RawEventKind::Move => self.on_move(ev, t, &mut out),
            RawEventKind::KeyDown => self.on_key_down(ev, t, &mut out),
            RawEventKind::InputCommit => self.on_input_commit(ev, t, &mut out),
        }
        out
    }

    /// A debounce timer fired. Stale generations (the timer was superseded or
    /// the gesture already closed) produce nothing.
    pub fn on_timer(&mut self, kind: TimerKind, generation: u64) -> Vec<Action> {
        match kind {
            TimerKind::Scroll => {
                if !self.scroll_active || generation != self.scroll_generation {
                    return Vec::new();
                }
                self.scroll_active = false;
                // The scroll ended when the idle window elapsed after the
                // last wheel event, not when the timer callback ran.
                let end = EventTime {
                    wall_ms: self.last_wheel_time.wall_ms + self.config.scroll_idle_ms,
                    rel_ms: self.last_wheel_time.rel_ms + self.config.scroll_idle_ms,
                };
                vec![self.action(ActionType::ScrollEnd, end, self.last_wheel_coords)]
            }
            TimerKind::Hover => {
                if !self.hover_active || generation != self.hover_generation {
                    return Vec::new();
                }
                self.hover_active = false;
                let end = EventTime {
                    wall_ms: self.last_hover_time.wall_ms + self.config.hover_idle_ms,
                    rel_ms: self.last_hover_time.rel_ms + self.config.hover_idle_ms,
                };
                vec![self.action(ActionType::MouseoverEnd, end, self.last_hover_coords)]
            }
        }
    }

    /// Close any open scroll/hover session, stamped at the closing instant.
    /// Used on normalizer stop and pause so every `_start` has an `_end`.
    pub fn force_close(&mut self, t: EventTime) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.scroll_active {
            self.scroll_active = false;
            self.scroll_generation += 1;
            actions.push(self.action(ActionType::ScrollEnd, t, self.last_wheel_coords));
        }
        if self.hover_active {
            self.hover_active = false;
            self.hover_generation += 1;
            actions.push(self.action(ActionType::MouseoverEnd, t, self.last_hover_coords));
        }
        actions
    }

    fn on_button_down(&mut self, ev: &RawInputEvent, t: EventTime, out: &mut StepOutput) {
        let coords = ev.coords();
        let button = ev.button.unwrap_or(MouseButton::Left);

        let count = match &self.last_click {
            Some(last)
                if last.button == button
                    && t.rel_ms.saturating_sub(last.rel_ms) < self.config.multi_click_interval_ms
                    && coords.distance_to(&last.coords) < self.config.multi_click_radius_px =>
            {
                last.count + 1
            }
            _ => 1,
        };
        self.last_click = Some(LastClick {
            button,
            rel_ms: t.rel_ms,
            coords,
            count,
        });

        if button == MouseButton::Left {
            self.left_button_down = true;
            self.button_down_coords = coords;
        }

        let mut action = self.action(ActionType::Click, t, coords);
        action.pointer_meta = Some(PointerMeta {
            button,
            click_count: count,
        });
        out.actions.push(action);
    }

    fn on_button_up(&mut self, ev: &RawInputEvent, t: EventTime, out: &mut StepOutput) {
        if ev.button.unwrap_or(MouseButton::Left) != MouseButton::Left {
            return;
        }
        if self.drag_active {
            self.drag_active = false;
            out.actions
                .push(self.action(ActionType::DragEnd, t, ev.coords()));
        }
        self.left_button_down = false;
    }

    fn on_drag(&mut self, _ev: &RawInputEvent, t: EventTime, out: &mut StepOutput) {
        if !self.left_button_down || self.drag_active {
            return;
        }
        // An open hover must close before the drag opens; the two gestures
        // never overlap in the action stream.
        if self.hover_active {
            self.hover_active = false;
            self.hover_generation += 1;
            out.actions
                .push(self.action(ActionType::MouseoverEnd, t, self.last_hover_coords));
        }
        self.drag_active = true;
        self.drag_origin = self.button_down_coords;
        out.actions
            .push(self.action(ActionType::DragStart, t, self.drag_origin));
    }

    fn on_wheel(&mut self, ev: &RawInputEvent, t: EventTime, out: &mut StepOutput) {
        let coords = ev.coords();
        if !self.scroll_active {
            self.scroll_active = true;
            out.actions
                .push(self.action(ActionType::ScrollStart, t, coords));
        }
        self.last_wheel_coords = coords;
        self.last_wheel_time = t;
        self.scroll_generation += 1;
        out.timers.push(TimerRequest {
            kind: TimerKind::Scroll,
            generation: self.scroll_generation,
            delay_ms: self.config.scroll_idle_ms,
        });
    }

    fn on_move(&mut self, ev: &RawInputEvent, t: EventTime, out: &mut StepOutput) {
        // Hover tracking is suppressed while dragging or holding the left
        // button; a pending idle timer still closes an already-open hover.
        if self.drag_active || self.left_button_down {
            return;
        }
        let coords = ev.coords();
        if !self.hover_active {
            self.hover_active = true;
            out.actions
                .push(self.action(ActionType::MouseoverStart, t, coords));
        }
        self.last_hover_coords = coords;
        self.last_hover_time = t;
        self.hover_generation += 1;
        out.timers.push(TimerRequest {
            kind: TimerKind::Hover,
            generation: self.hover_generation,
            delay_ms: self.config.hover_idle_ms,
        });
    }

    fn on_key_down(&mut self, ev: &RawInputEvent, t: EventTime, out: &mut StepOutput) {
        let key_code = ev.key_code.unwrap_or(0);
        let (key, code) = resolve_key(key_code);
        // Keyboard events carry no pointer position
        let mut action = self.action(ActionType::Keypress, t, Coords::new(0.0, 0.0));
        action.key_meta = Some(KeyMeta {
            key,
            code,
            modifiers: ev.modifiers,
            key_codes: vec![key_code],
        });
        out.actions.push(action);
    }

    fn on_input_commit(&mut self, ev: &RawInputEvent, t: EventTime, out: &mut StepOutput) {
        let mut action = self.action(ActionType::Input, t, ev.coords());
        action.input_value = ev.value.clone();
        out.actions.push(action);
    }
}
