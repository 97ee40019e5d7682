//! Events consumed by the controller's dispatch loop.
//!
//! Each variant carries only the data its handler needs: blink events know
//! which phase to show, the countdown blink knows how many half-blinks are
//! left.  [`Event::payload`] flattens that back to a `u32` for tracing.

use serde::Serialize;
use std::fmt;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Discriminant of an [`Event`], used for cancellation and replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Null,
    Blink,
    Button,
    Gate,
    LightTooLong,
    LightFinalOff,
    BlinkExternal,
    Halt,
    WriteStats,
    DisplayTimeLeft,
    DisplayTimeLeftBlink,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Blink => "Blink",
            Self::Button => "Button",
            Self::Gate => "Gate",
            Self::LightTooLong => "LightTooLong",
            Self::LightFinalOff => "LightFinalOff",
            Self::BlinkExternal => "BlinkExternal",
            Self::Halt => "Halt",
            Self::WriteStats => "WriteStats",
            Self::DisplayTimeLeft => "DisplayTimeLeft",
            Self::DisplayTimeLeftBlink => "DisplayTimeLeftBlink",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Event {
    #[default]
    Null,
    /// Heartbeat on the internal LED.
    Blink { lit: bool },
    /// Debounced re-check of the push-button input.
    Button,
    /// Debounced re-check of the gate input.
    Gate,
    LightTooLong,
    LightFinalOff,
    /// Warning blink on the external LED while the light is almost off.
    BlinkExternal { lit: bool },
    Halt,
    WriteStats,
    DisplayTimeLeft,
    /// Countdown pattern step; odd `remaining` means "LED on" for this step.
    DisplayTimeLeftBlink { remaining: u32 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Null => EventKind::Null,
            Self::Blink { .. } => EventKind::Blink,
            Self::Button => EventKind::Button,
            Self::Gate => EventKind::Gate,
            Self::LightTooLong => EventKind::LightTooLong,
            Self::LightFinalOff => EventKind::LightFinalOff,
            Self::BlinkExternal { .. } => EventKind::BlinkExternal,
            Self::Halt => EventKind::Halt,
            Self::WriteStats => EventKind::WriteStats,
            Self::DisplayTimeLeft => EventKind::DisplayTimeLeft,
            Self::DisplayTimeLeftBlink { .. } => EventKind::DisplayTimeLeftBlink,
        }
    }

    /// Compact numeric form of the per-kind data (0 for kinds without any).
    pub fn payload(&self) -> u32 {
        match *self {
            Self::Blink { lit } | Self::BlinkExternal { lit } => u32::from(lit),
            Self::DisplayTimeLeftBlink { remaining } => remaining,
            _ => 0,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload() {
            0 => write!(f, "{}", self.kind()),
            p => write!(f, "{}({p})", self.kind()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_event_is_null() {
        assert_eq!(Event::default(), Event::Null);
        assert_eq!(Event::default().kind(), EventKind::Null);
    }

    #[test]
    fn blink_payload_is_phase_flag() {
        assert_eq!(Event::Blink { lit: true }.payload(), 1);
        assert_eq!(Event::Blink { lit: false }.payload(), 0);
        assert_eq!(Event::BlinkExternal { lit: true }.payload(), 1);
    }

    #[test]
    fn countdown_payload_is_remaining_steps() {
        let e = Event::DisplayTimeLeftBlink { remaining: 6 };
        assert_eq!(e.kind(), EventKind::DisplayTimeLeftBlink);
        assert_eq!(e.payload(), 6);
    }

    #[test]
    fn kind_ignores_payload() {
        assert_eq!(
            Event::Blink { lit: true }.kind(),
            Event::Blink { lit: false }.kind()
        );
    }

    #[test]
    fn display_includes_payload_when_present() {
        assert_eq!(Event::Halt.to_string(), "Halt");
        assert_eq!(
            Event::DisplayTimeLeftBlink { remaining: 3 }.to_string(),
            "DisplayTimeLeftBlink(3)"
        );
    }
}
