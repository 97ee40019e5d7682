//! Pin I/O for the five fixed roles. The `gpio` feature gates the real rppal
//! driver; without it the daemon runs on [`MockBoard`], which is also what
//! the tests drive.
//!
//! Levels are raw electrical levels (`true` = high).  Polarity is applied by
//! the controller from [`PinMap`], except for the idle level an output is
//! given when it is first configured.

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;

use crate::config::PinMap;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};

#[cfg(any(test, not(feature = "gpio")))]
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ---------------------------------------------------------------------------
// Interface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinRole {
    Relay,
    InternalLed,
    ExternalLed,
    Button,
    Gate,
}

impl PinRole {
    pub const OUTPUTS: [PinRole; 3] = [PinRole::Relay, PinRole::InternalLed, PinRole::ExternalLed];
    pub const INPUTS: [PinRole; 2] = [PinRole::Button, PinRole::Gate];

    pub fn is_output(self) -> bool {
        Self::OUTPUTS.contains(&self)
    }

    /// BCM number of this role in `map`.
    pub fn bcm(self, map: &PinMap) -> u8 {
        match self {
            PinRole::Relay => map.relay,
            PinRole::InternalLed => map.internal_led,
            PinRole::ExternalLed => map.external_led,
            PinRole::Button => map.button,
            PinRole::Gate => map.gate,
        }
    }

    /// Whether the role's "active" state is a low level.
    pub fn active_low(self, map: &PinMap) -> bool {
        match self {
            PinRole::Relay => map.relay_active_low,
            PinRole::Button => map.button_active_low,
            PinRole::Gate => map.gate_active_low,
            PinRole::InternalLed | PinRole::ExternalLed => false,
        }
    }

    /// Raw level of the inactive state: what an output is set to the moment
    /// it is acquired, and what a released input reads.
    pub fn idle_level(self, map: &PinMap) -> bool {
        self.active_low(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
    #[default]
    Off,
    Up,
    Down,
}

/// Input transitions that fire an edge interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
    #[default]
    Both,
}

impl Edge {
    #[cfg(test)]
    fn matches(self, from_high: bool, to_high: bool) -> bool {
        match self {
            Edge::Rising => !from_high && to_high,
            Edge::Falling => from_high && !to_high,
            Edge::Both => from_high != to_high,
        }
    }
}

/// Edge interrupt handler.  Runs on a driver-owned thread; it must only plan
/// a queue event.
pub type EdgeCallback = Box<dyn FnMut() + Send + 'static>;

/// Hardware seam consumed by the controller.
///
/// Reading an output or writing an input is a wiring bug and panics.
pub trait Board {
    /// Configure `pin`.  Outputs start at their idle level.
    fn configure_pin(&mut self, pin: PinRole, direction: Direction) -> Result<()>;
    fn set_pull(&mut self, pin: PinRole, pull: Pull) -> Result<()>;
    fn read_pin(&mut self, pin: PinRole) -> bool;
    fn write_pin(&mut self, pin: PinRole, high: bool);
    /// Call `callback` whenever input `pin` makes a transition matching `edge`.
    fn register_edge_interrupt(
        &mut self,
        pin: PinRole,
        edge: Edge,
        callback: EdgeCallback,
    ) -> Result<()>;
}

fn check_direction(pin: PinRole, direction: Direction) {
    assert_eq!(
        pin.is_output(),
        direction == Direction::Output,
        "{pin:?} cannot be configured as {direction:?}"
    );
}

// ---------------------------------------------------------------------------
// Real GPIO board (requires rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RpiBoard {
    gpio: Gpio,
    map: PinMap,
    outputs: HashMap<PinRole, OutputPin>,
    inputs: HashMap<PinRole, InputPin>,
}

#[cfg(feature = "gpio")]
impl RpiBoard {
    pub fn new(map: PinMap) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open GPIO (garaged must be run as root)")?;
        Ok(Self {
            gpio,
            map,
            outputs: HashMap::new(),
            inputs: HashMap::new(),
        })
    }

    fn acquire(&self, pin: PinRole) -> Result<rppal::gpio::Pin> {
        let bcm = pin.bcm(&self.map);
        self.gpio
            .get(bcm)
            .with_context(|| format!("failed to acquire gpio {bcm} for {pin:?}"))
    }
}

#[cfg(feature = "gpio")]
impl Board for RpiBoard {
    fn configure_pin(&mut self, pin: PinRole, direction: Direction) -> Result<()> {
        check_direction(pin, direction);
        let raw = self.acquire(pin)?;
        match direction {
            Direction::Output => {
                // Fail-safe: an active-low relay must not energise on acquire.
                let out = if pin.idle_level(&self.map) {
                    raw.into_output_high()
                } else {
                    raw.into_output_low()
                };
                self.outputs.insert(pin, out);
            }
            Direction::Input => {
                self.inputs.insert(pin, raw.into_input());
            }
        }
        Ok(())
    }

    fn set_pull(&mut self, pin: PinRole, pull: Pull) -> Result<()> {
        assert!(!pin.is_output(), "set_pull({pin:?}): not an input");
        // Release the current handle before re-acquiring with the new bias.
        self.inputs.remove(&pin);
        let raw = self.acquire(pin)?;
        let input = match pull {
            Pull::Off => raw.into_input(),
            Pull::Up => raw.into_input_pullup(),
            Pull::Down => raw.into_input_pulldown(),
        };
        self.inputs.insert(pin, input);
        Ok(())
    }

    fn read_pin(&mut self, pin: PinRole) -> bool {
        match self.inputs.get(&pin) {
            Some(input) => input.is_high(),
            None => panic!("read_pin({pin:?}): pin is not configured as input"),
        }
    }

    fn write_pin(&mut self, pin: PinRole, high: bool) {
        match self.outputs.get_mut(&pin) {
            Some(out) if high => out.set_high(),
            Some(out) => out.set_low(),
            None => panic!("write_pin({pin:?}): pin is not configured as output"),
        }
    }

    fn register_edge_interrupt(
        &mut self,
        pin: PinRole,
        edge: Edge,
        mut callback: EdgeCallback,
    ) -> Result<()> {
        let trigger = match edge {
            Edge::Rising => Trigger::RisingEdge,
            Edge::Falling => Trigger::FallingEdge,
            Edge::Both => Trigger::Both,
        };
        let Some(input) = self.inputs.get_mut(&pin) else {
            panic!("register_edge_interrupt({pin:?}): pin is not configured as input");
        };
        input
            .set_async_interrupt(trigger, move |_level| callback())
            .with_context(|| format!("failed to register interrupt for {pin:?}"))
    }
}

// ---------------------------------------------------------------------------
// Mock board (no hardware, logs pin traffic)
// ---------------------------------------------------------------------------

#[cfg(any(test, not(feature = "gpio")))]
#[derive(Default)]
struct MockPins {
    directions: HashMap<PinRole, Direction>,
    pulls: HashMap<PinRole, Pull>,
    levels: HashMap<PinRole, bool>,
    writes: Vec<(PinRole, bool)>,
    interrupts: HashMap<PinRole, Vec<(Edge, EdgeCallback)>>,
}

/// In-memory board.  Clones share state, so a test keeps one handle while
/// the controller owns another.
#[cfg(any(test, not(feature = "gpio")))]
#[derive(Clone)]
pub struct MockBoard {
    map: PinMap,
    pins: Arc<Mutex<MockPins>>,
}

#[cfg(any(test, not(feature = "gpio")))]
impl MockBoard {
    /// Inputs start released according to the polarity in `map`.
    pub fn new(map: PinMap) -> Self {
        let mut pins = MockPins::default();
        for role in PinRole::INPUTS {
            pins.levels.insert(role, role.idle_level(&map));
        }
        tracing::info!("[mock-gpio] board initialised (no hardware)");
        Self {
            map,
            pins: Arc::new(Mutex::new(pins)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockPins> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Test handles: drive inputs and inspect output traffic.
#[cfg(test)]
impl MockBoard {
    /// Drive an input to a raw level, firing matching edge callbacks.
    pub fn set_level(&self, pin: PinRole, high: bool) {
        assert!(!pin.is_output(), "set_level({pin:?}): not an input");
        let (was, mut registered) = {
            let mut pins = self.lock();
            let was = pins.levels.insert(pin, high).unwrap_or(false);
            if was == high {
                return;
            }
            (was, pins.interrupts.remove(&pin).unwrap_or_default())
        };

        // Callbacks run without the mock lock held, like a real ISR thread.
        for (edge, callback) in registered.iter_mut() {
            if edge.matches(was, high) {
                callback();
            }
        }

        let mut pins = self.lock();
        let slot = pins.interrupts.entry(pin).or_default();
        registered.append(slot);
        *slot = registered;
    }

    /// Press or release an input, honouring its polarity.
    pub fn set_pressed(&self, pin: PinRole, pressed: bool) {
        self.set_level(pin, pressed != pin.active_low(&self.map));
    }

    /// Current raw level of any pin (`false` if never driven).
    pub fn level(&self, pin: PinRole) -> bool {
        self.lock().levels.get(&pin).copied().unwrap_or(false)
    }

    /// Every output write so far, in order.
    pub fn writes(&self) -> Vec<(PinRole, bool)> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, pin: PinRole) -> Vec<bool> {
        self.lock()
            .writes
            .iter()
            .filter(|(p, _)| *p == pin)
            .map(|&(_, level)| level)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn direction(&self, pin: PinRole) -> Option<Direction> {
        self.lock().directions.get(&pin).copied()
    }

    pub fn pull(&self, pin: PinRole) -> Option<Pull> {
        self.lock().pulls.get(&pin).copied()
    }

    pub fn interrupt_count(&self, pin: PinRole) -> usize {
        self.lock().interrupts.get(&pin).map_or(0, Vec::len)
    }
}

#[cfg(any(test, not(feature = "gpio")))]
impl Board for MockBoard {
    fn configure_pin(&mut self, pin: PinRole, direction: Direction) -> Result<()> {
        check_direction(pin, direction);
        let bcm = pin.bcm(&self.map);
        tracing::debug!("[mock-gpio] {pin:?} (gpio {bcm}) configured as {direction:?}");
        let mut pins = self.lock();
        pins.directions.insert(pin, direction);
        if direction == Direction::Output {
            pins.levels.insert(pin, pin.idle_level(&self.map));
        }
        Ok(())
    }

    fn set_pull(&mut self, pin: PinRole, pull: Pull) -> Result<()> {
        assert!(!pin.is_output(), "set_pull({pin:?}): not an input");
        self.lock().pulls.insert(pin, pull);
        Ok(())
    }

    fn read_pin(&mut self, pin: PinRole) -> bool {
        let pins = self.lock();
        assert_eq!(
            pins.directions.get(&pin),
            Some(&Direction::Input),
            "read_pin({pin:?}): pin is not configured as input"
        );
        pins.levels.get(&pin).copied().unwrap_or(false)
    }

    fn write_pin(&mut self, pin: PinRole, high: bool) {
        let mut pins = self.lock();
        assert_eq!(
            pins.directions.get(&pin),
            Some(&Direction::Output),
            "write_pin({pin:?}): pin is not configured as output"
        );
        pins.levels.insert(pin, high);
        pins.writes.push((pin, high));
        tracing::trace!("[mock-gpio] {pin:?} set {}", if high { "HIGH" } else { "LOW" });
    }

    fn register_edge_interrupt(
        &mut self,
        pin: PinRole,
        edge: Edge,
        callback: EdgeCallback,
    ) -> Result<()> {
        assert!(!pin.is_output(), "register_edge_interrupt({pin:?}): not an input");
        self.lock()
            .interrupts
            .entry(pin)
            .or_default()
            .push((edge, callback));
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn configured_with(map: PinMap) -> MockBoard {
        let mut board = MockBoard::new(map);
        for role in PinRole::OUTPUTS {
            board.configure_pin(role, Direction::Output).unwrap();
        }
        for role in PinRole::INPUTS {
            board.configure_pin(role, Direction::Input).unwrap();
        }
        board
    }

    fn configured() -> MockBoard {
        configured_with(PinMap::default())
    }

    fn counter(board: &mut MockBoard, pin: PinRole, edge: Edge) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        board
            .register_edge_interrupt(
                pin,
                edge,
                Box::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        hits
    }

    // -- Roles --------------------------------------------------------------

    #[test]
    fn roles_map_to_configured_bcm_pins() {
        let map = PinMap::default();
        assert_eq!(PinRole::Relay.bcm(&map), 25);
        assert_eq!(PinRole::Button.bcm(&map), 0);
        assert!(PinRole::Relay.is_output());
        assert!(!PinRole::Gate.is_output());
    }

    #[test]
    fn idle_level_follows_polarity() {
        let mut map = PinMap::default();
        assert!(!PinRole::Relay.idle_level(&map));
        map.relay_active_low = true;
        assert!(PinRole::Relay.idle_level(&map));
        assert!(!PinRole::ExternalLed.idle_level(&map));
        assert!(PinRole::Button.idle_level(&map));
    }

    // -- MockBoard ----------------------------------------------------------

    #[test]
    fn inputs_start_released() {
        let mut board = configured();
        // Active-low inputs idle high.
        assert!(board.read_pin(PinRole::Button));
        assert!(board.read_pin(PinRole::Gate));
    }

    #[test]
    fn outputs_start_at_idle_level() {
        let board = configured();
        assert!(!board.level(PinRole::Relay));

        let mut map = PinMap::default();
        map.relay_active_low = true;
        let board = configured_with(map);
        assert!(board.level(PinRole::Relay), "active-low relay must idle high");
        assert!(!board.level(PinRole::InternalLed));
        assert!(board.writes().is_empty());
    }

    #[test]
    fn writes_are_recorded_in_order() {
        let mut board = configured();
        board.write_pin(PinRole::Relay, true);
        board.write_pin(PinRole::ExternalLed, true);
        board.write_pin(PinRole::Relay, false);
        assert_eq!(
            board.writes(),
            vec![
                (PinRole::Relay, true),
                (PinRole::ExternalLed, true),
                (PinRole::Relay, false)
            ]
        );
        assert_eq!(board.writes_to(PinRole::Relay), vec![true, false]);
        assert!(!board.level(PinRole::Relay));
    }

    #[test]
    fn pull_is_recorded() {
        let mut board = configured();
        board.set_pull(PinRole::Gate, Pull::Up).unwrap();
        assert_eq!(board.pull(PinRole::Gate), Some(Pull::Up));
    }

    #[test]
    fn set_pressed_honours_polarity_and_fires_both_edges() {
        let mut board = configured();
        let hits = counter(&mut board, PinRole::Button, Edge::Both);

        board.set_pressed(PinRole::Button, true);
        assert!(!board.read_pin(PinRole::Button));
        board.set_pressed(PinRole::Button, false);
        assert!(board.read_pin(PinRole::Button));

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(board.interrupt_count(PinRole::Button), 1);
    }

    #[test]
    fn unchanged_level_fires_nothing() {
        let mut board = configured();
        let hits = counter(&mut board, PinRole::Gate, Edge::Both);
        board.set_pressed(PinRole::Gate, false);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rising_edge_only_fires_on_low_to_high() {
        let mut board = configured();
        let hits = counter(&mut board, PinRole::Gate, Edge::Rising);
        board.set_level(PinRole::Gate, false);
        board.set_level(PinRole::Gate, true);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "not configured as output")]
    fn writing_an_input_panics() {
        let mut board = configured();
        board.write_pin(PinRole::Button, true);
    }

    #[test]
    #[should_panic(expected = "cannot be configured as")]
    fn configuring_relay_as_input_panics() {
        let mut board = MockBoard::new(PinMap::default());
        let _ = board.configure_pin(PinRole::Relay, Direction::Input);
    }
}
