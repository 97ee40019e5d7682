//! Garage light controller: a single-threaded state machine driven by the
//! timed [`EventQueue`].
//!
//! Interrupt callbacks only plan debounced `Button`/`Gate` checks; every pin
//! access and every state change happens on the dispatch thread.
//!
//! ## Light modes
//!
//! ```text
//!        tap / gate press                 light_too_long
//!  Off ─────────────────────▶ On ───────────────────────▶ AlmostOff
//!   ▲  ◀──────── tap ──────── │  ◀── tap / long hold ──────   │
//!   │                                                         │
//!   └──────────────────── final_off_timeout ──────────────────┘
//! ```
//!
//! The relay is energised whenever the mode is not `Off`; AlmostOff is a
//! warning phase with the external LED blinking.

use anyhow::{Context, Result};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::board::{Board, Direction, PinRole};
use crate::config::{PinMap, Timings};
use crate::event::{Event, EventKind};
use crate::host::Host;
use crate::journal::Journal;
use crate::queue::EventQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightMode {
    Off,
    On,
    AlmostOff,
}

pub struct Controller<B: Board> {
    queue: Arc<EventQueue>,
    board: B,
    journal: Box<dyn Journal>,
    host: Box<dyn Host>,
    timings: Timings,
    pins: PinMap,

    light_mode: LightMode,
    light_on_time: Instant,
    button_pressed: bool,
    gate_pressed: bool,
    button_press_time: Instant,
    gate_press_time: Instant,
    /// The gate press itself switched the light on; its release does nothing.
    gate_press_instant_action: bool,
}

impl<B: Board> Controller<B> {
    pub fn new(
        timings: Timings,
        pins: PinMap,
        board: B,
        journal: Box<dyn Journal>,
        host: Box<dyn Host>,
    ) -> Self {
        let now = Instant::now();
        Self {
            queue: Arc::new(EventQueue::new()),
            board,
            journal,
            host,
            timings,
            pins,
            light_mode: LightMode::Off,
            light_on_time: now,
            button_pressed: false,
            gate_pressed: false,
            button_press_time: now,
            gate_press_time: now,
            gate_press_instant_action: false,
        }
    }

    /// Handle to the controller's queue, for producers and observers.
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn light_mode(&self) -> LightMode {
        self.light_mode
    }

    /// Configure pins, hook the input interrupts and seed the queue.
    pub fn init(&mut self) -> Result<()> {
        self.log("Starting garaged...");

        for role in PinRole::OUTPUTS {
            self.board
                .configure_pin(role, Direction::Output)
                .with_context(|| format!("failed to configure {role:?}"))?;
        }
        for role in PinRole::INPUTS {
            self.board
                .configure_pin(role, Direction::Input)
                .with_context(|| format!("failed to configure {role:?}"))?;
            self.board
                .set_pull(role, self.pins.input_pull)
                .with_context(|| format!("failed to set pull on {role:?}"))?;
        }
        for role in PinRole::OUTPUTS {
            self.drive(role, false);
        }

        for (role, check) in [(PinRole::Button, Event::Button), (PinRole::Gate, Event::Gate)] {
            let queue = Arc::clone(&self.queue);
            let delay = self.timings.react_delay;
            self.board
                .register_edge_interrupt(
                    role,
                    self.pins.input_edge,
                    Box::new(move || queue.plan(check, delay, true)),
                )
                .with_context(|| format!("failed to register {role:?} interrupt"))?;
        }

        self.queue.plan_now(Event::Blink { lit: true });
        self.queue.plan_now(Event::Button);
        self.queue.plan_now(Event::Gate);
        self.queue.plan_now(Event::WriteStats);

        info!(
            relay = self.pins.relay,
            button = self.pins.button,
            gate = self.pins.gate,
            "controller initialised"
        );
        Ok(())
    }

    /// Initialise, then dispatch events until `Halt`.
    pub fn run(&mut self) -> Result<()> {
        self.init()?;
        loop {
            let event = self.queue.wait();
            if self.handle(event).is_break() {
                info!("dispatch loop finished");
                return Ok(());
            }
        }
    }

    /// Dispatch one event.  `Break` means the loop must stop.
    pub fn handle(&mut self, event: Event) -> ControlFlow<()> {
        trace!(%event, "dispatch");
        match event {
            Event::Null => {}
            Event::Blink { lit } => {
                self.drive(PinRole::InternalLed, lit);
                let next = if lit {
                    self.timings.blink_on
                } else {
                    self.timings.blink_off
                };
                self.queue.plan(Event::Blink { lit: !lit }, next, false);
            }
            Event::Button => self.on_button(),
            Event::Gate => self.on_gate(),
            Event::LightTooLong => {
                self.log("Light almost off");
                self.set_light_mode(LightMode::AlmostOff);
            }
            Event::LightFinalOff => {
                self.log("Light timed out");
                self.set_light_mode(LightMode::Off);
            }
            Event::BlinkExternal { lit } => {
                self.drive(PinRole::ExternalLed, lit);
                self.queue.plan(
                    Event::BlinkExternal { lit: !lit },
                    self.timings.almost_off_blink,
                    false,
                );
            }
            Event::Halt => {
                self.halt();
                return ControlFlow::Break(());
            }
            Event::WriteStats => {
                match self.host.system_info() {
                    Some(snapshot) => self.log(snapshot.report()),
                    None => self.log("Unable to retrieve system info"),
                }
                self.queue
                    .plan(Event::WriteStats, self.timings.write_stats, false);
            }
            Event::DisplayTimeLeft => {
                let ticks =
                    elapsed_ticks(self.light_on_time.elapsed(), self.timings.display_period);
                self.drive(PinRole::ExternalLed, true);
                self.queue.plan(
                    Event::DisplayTimeLeftBlink {
                        remaining: ticks.saturating_mul(2),
                    },
                    self.timings.display_blink_on,
                    false,
                );
            }
            Event::DisplayTimeLeftBlink { remaining: 0 } => {
                self.drive(PinRole::ExternalLed, false);
                self.queue
                    .plan(Event::DisplayTimeLeft, self.timings.display_time_left, false);
            }
            Event::DisplayTimeLeftBlink { remaining } => {
                let lit = remaining & 1 == 1;
                self.drive(PinRole::ExternalLed, lit);
                let next = if lit {
                    self.timings.display_blink_on
                } else {
                    self.timings.display_blink_off
                };
                self.queue.plan(
                    Event::DisplayTimeLeftBlink {
                        remaining: remaining - 1,
                    },
                    next,
                    false,
                );
            }
        }
        ControlFlow::Continue(())
    }

    // -----------------------------------------------------------------------
    // Light mode
    // -----------------------------------------------------------------------

    /// Switch the light to `mode`, driving the relay and (re)arming the
    /// mode's timers.  No-op when already in `mode`.
    pub fn set_light_mode(&mut self, mode: LightMode) {
        if mode == self.light_mode {
            return;
        }
        self.drive(PinRole::ExternalLed, false);

        if self.light_mode == LightMode::AlmostOff {
            self.queue.delete_events(EventKind::BlinkExternal);
            self.queue.delete_events(EventKind::LightFinalOff);
        }

        if self.light_mode == LightMode::Off || mode == LightMode::Off {
            let on = mode != LightMode::Off;
            self.log(format!("Control Light: {}", if on { "On" } else { "Off" }));
            self.drive(PinRole::Relay, on);
        }

        debug!(from = ?self.light_mode, to = ?mode, "light mode");
        self.light_mode = mode;

        if mode == LightMode::On {
            self.light_on_time = Instant::now();
            self.queue
                .plan(Event::LightTooLong, self.timings.light_too_long, true);
            self.queue
                .plan(Event::DisplayTimeLeft, self.timings.display_time_left, true);
            return;
        }

        self.queue.delete_events(EventKind::LightTooLong);
        self.queue.delete_events(EventKind::DisplayTimeLeft);
        self.queue.delete_events(EventKind::DisplayTimeLeftBlink);

        if mode == LightMode::AlmostOff {
            self.queue
                .plan(Event::LightFinalOff, self.timings.final_off_timeout, true);
            self.queue.plan(
                Event::BlinkExternal { lit: true },
                self.timings.almost_off_blink,
                true,
            );
        }
    }

    /// Cycle AlmostOff→On, flashing the relay so the restart is visible.
    fn restart_light(&mut self) {
        self.log("Light timer restarted");
        self.drive(PinRole::Relay, false);
        self.set_light_mode(LightMode::AlmostOff);
        self.set_light_mode(LightMode::On);
        self.drive(PinRole::Relay, true);
    }

    /// Release of a press that lasted `held`: long holds restart the light
    /// timer, taps toggle the light.
    fn released_after(&mut self, held: Duration) {
        if held > self.timings.continue_hold {
            if self.light_mode != LightMode::Off {
                self.restart_light();
            }
        } else if self.light_mode != LightMode::On {
            self.set_light_mode(LightMode::On);
        } else {
            self.set_light_mode(LightMode::Off);
        }
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    fn on_button(&mut self) {
        let pressed = self.input_pressed(PinRole::Button);
        if pressed == self.button_pressed {
            return;
        }
        self.button_pressed = pressed;

        if pressed {
            self.log("Button pressed");
            self.button_press_time = Instant::now();
            self.queue.plan(Event::Halt, self.timings.halt_hold, true);
        } else {
            self.log("Button released");
            self.queue.delete_events(EventKind::Halt);
            self.released_after(self.button_press_time.elapsed());
        }
    }

    fn on_gate(&mut self) {
        let pressed = self.input_pressed(PinRole::Gate);
        if pressed == self.gate_pressed {
            return;
        }
        self.gate_pressed = pressed;

        if pressed {
            self.log("Gate button pressed");
            self.gate_press_time = Instant::now();
            self.gate_press_instant_action = self.light_mode == LightMode::Off;
            if self.gate_press_instant_action {
                self.set_light_mode(LightMode::On);
            }
        } else {
            self.log("Gate button released");
            if !self.gate_press_instant_action {
                self.released_after(self.gate_press_time.elapsed());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Halt
    // -----------------------------------------------------------------------

    fn halt(&mut self) {
        self.log("Initiating reboot");
        if !self.queue.is_empty() {
            info!(pending = self.queue.len(), "abandoning queued events");
            for entry in self.queue.snapshot() {
                debug!(kind = %entry.kind, seq = entry.sequence, "abandoned");
            }
        }
        self.drive(PinRole::Relay, false);
        self.drive(PinRole::ExternalLed, true);
        self.drive(PinRole::InternalLed, true);
        match self.host.reboot() {
            Ok(code) => self.log(format!("Reboot returned {code}. Goodbye.")),
            Err(e) => self.log(format!("Reboot failed: {e:#}. Goodbye.")),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn input_pressed(&mut self, role: PinRole) -> bool {
        self.board.read_pin(role) != role.active_low(&self.pins)
    }

    /// Set an output to its logical state, applying polarity.
    fn drive(&mut self, role: PinRole, on: bool) {
        let high = on != role.active_low(&self.pins);
        self.board.write_pin(role, high);
    }

    fn log(&mut self, message: impl AsRef<str>) {
        self.journal.record(message.as_ref());
    }
}

/// Whole `period`s in `elapsed`, saturating at `u32::MAX`.
fn elapsed_ticks(elapsed: Duration, period: Duration) -> u32 {
    elapsed
        .as_nanos()
        .checked_div(period.as_nanos())
        .map_or(0, |t| u32::try_from(t).unwrap_or(u32::MAX))
}

// ===========================================================================
// Tests
// ===========================================================================
