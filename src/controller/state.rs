use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of controller ports on one adapter.
pub const PORTS_PER_ADAPTER: u8 = 4;

// Stick axes report 0..=255 with the rest position at 128
const STICK_CENTER: f32 = 128.0;
const STICK_RANGE: f32 = 127.0;
const TRIGGER_RANGE: f32 = 255.0;

/// Largest usable stick deadzone.
pub const MAX_STICK_DEADZONE: f32 = 0.99;

/// Clamps a deadzone into `[0, MAX_STICK_DEADZONE]`; NaN becomes 0.
pub fn clamp_deadzone(deadzone: f32) -> f32 {
    if deadzone.is_nan() {
        0.0
    } else {
        deadzone.clamp(0.0, MAX_STICK_DEADZONE)
    }
}

/// Identity of one connected controller slot.
///
/// Built once from the adapter's USB address and the port number when the
/// driver reports a plug, and stable until the matching unplug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerIdentity {
    pub adapter: u8,
    pub port: u8,
}

impl ControllerIdentity {
    pub fn new(adapter: u8, port: u8) -> Self {
        Self { adapter, port }
    }

    /// Integer form of the identity (`adapter * 4 + port`).
    ///
    /// Adapter addresses are 8-bit USB addresses, so this never overflows.
    pub fn virtual_id(&self) -> u32 {
        self.adapter as u32 * PORTS_PER_ADAPTER as u32 + self.port as u32
    }
}

impl fmt::Display for ControllerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.adapter, self.port)
    }
}

/// Digital button mask in the adapter's bit layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Buttons(u16);

impl Buttons {
    pub const A: Buttons = Buttons(1 << 0);
    pub const B: Buttons = Buttons(1 << 1);
    pub const X: Buttons = Buttons(1 << 2);
    pub const Y: Buttons = Buttons(1 << 3);
    pub const DPAD_LEFT: Buttons = Buttons(1 << 4);
    pub const DPAD_RIGHT: Buttons = Buttons(1 << 5);
    pub const DPAD_DOWN: Buttons = Buttons(1 << 6);
    pub const DPAD_UP: Buttons = Buttons(1 << 7);
    pub const START: Buttons = Buttons(1 << 8);
    pub const Z: Buttons = Buttons(1 << 9);
    pub const R: Buttons = Buttons(1 << 10);
    pub const L: Buttons = Buttons(1 << 11);

    /// All bits the adapter defines.
    pub const ALL: Buttons = Buttons(0x0FFF);

    pub const fn empty() -> Self {
        Buttons(0)
    }

    /// Builds a mask, dropping bits the adapter does not define.
    pub const fn from_bits(bits: u16) -> Self {
        Buttons(bits & Self::ALL.0)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: Buttons) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Buttons {
    type Output = Buttons;

    fn bitor(self, rhs: Buttons) -> Buttons {
        Buttons(self.0 | rhs.0)
    }
}

// Snapshot of one controller, normalized for application code
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub plugged_in: bool,
    pub buttons: Buttons,

    // Main and C stick, -1.0..=1.0
    pub stick_x: f32,
    pub stick_y: f32,
    pub c_stick_x: f32,
    pub c_stick_y: f32,

    // Analog shoulder triggers, 0.0..=1.0
    pub analog_l: f32,
    pub analog_r: f32,
}

/// Controller input as a driver reports it, before normalization.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawControllerState {
    pub buttons: u16,
    pub stick_x: u8,
    pub stick_y: u8,
    pub c_stick_x: u8,
    pub c_stick_y: u8,
    pub trigger_l: u8,
    pub trigger_r: u8,
}

impl RawControllerState {
    /// Raw state of a controller at rest: sticks centered, nothing pressed.
    pub fn neutral() -> Self {
        Self {
            buttons: 0,
            stick_x: 128,
            stick_y: 128,
            c_stick_x: 128,
            c_stick_y: 128,
            trigger_l: 0,
            trigger_r: 0,
        }
    }

    /// Scales integer axes into the float ranges of [`ControllerState`].
    ///
    /// `deadzone` is applied per stick axis as a fraction of full travel;
    /// 0.0 passes values through unchanged.
    pub fn normalize(&self, deadzone: f32) -> ControllerState {
        ControllerState {
            plugged_in: true,
            buttons: Buttons::from_bits(self.buttons),
            stick_x: normalize_stick(self.stick_x, deadzone),
            stick_y: normalize_stick(self.stick_y, deadzone),
            c_stick_x: normalize_stick(self.c_stick_x, deadzone),
            c_stick_y: normalize_stick(self.c_stick_y, deadzone),
            analog_l: normalize_trigger(self.trigger_l),
            analog_r: normalize_trigger(self.trigger_r),
        }
    }
}

fn normalize_stick(value: u8, deadzone: f32) -> f32 {
    let scaled = ((value as f32 - STICK_CENTER) / STICK_RANGE).clamp(-1.0, 1.0);
    apply_deadzone(scaled, deadzone)
}

fn normalize_trigger(value: u8) -> f32 {
    value as f32 / TRIGGER_RANGE
}

// Rescales the value to the range outside the deadzone
fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    let deadzone = clamp_deadzone(deadzone);
    if deadzone == 0.0 {
        return value;
    }
    if value.abs() < deadzone {
        0.0
    } else {
        let sign = if value < 0.0 { -1.0 } else { 1.0 };
        sign * (value.abs() - deadzone) / (1.0 - deadzone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_id_packs_adapter_and_port() {
        assert_eq!(ControllerIdentity::new(0, 0).virtual_id(), 0);
        assert_eq!(ControllerIdentity::new(3, 2).virtual_id(), 14);
        assert_eq!(ControllerIdentity::new(255, 3).virtual_id(), 1023);
    }

    #[test]
    fn identities_order_by_adapter_then_port() {
        let mut ids = vec![
            ControllerIdentity::new(2, 0),
            ControllerIdentity::new(1, 3),
            ControllerIdentity::new(1, 1),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ControllerIdentity::new(1, 1),
                ControllerIdentity::new(1, 3),
                ControllerIdentity::new(2, 0),
            ]
        );
        assert_eq!(ControllerIdentity::new(7, 2).to_string(), "7:2");
    }

    #[test]
    fn buttons_drop_undefined_bits() {
        let buttons = Buttons::from_bits(0xF001);
        assert_eq!(buttons, Buttons::A);
        assert!(buttons.contains(Buttons::A));
        assert!(!buttons.contains(Buttons::A | Buttons::START));
        assert!(Buttons::empty().is_empty());
    }

    #[test]
    fn neutral_input_normalizes_to_rest() {
        let state = RawControllerState::neutral().normalize(0.0);
        assert!(state.plugged_in);
        assert!(state.buttons.is_empty());
        assert_eq!(state.stick_x, 0.0);
        assert_eq!(state.c_stick_y, 0.0);
        assert_eq!(state.analog_l, 0.0);
    }

    #[test]
    fn axes_stay_inside_documented_ranges() {
        let raw = RawControllerState {
            buttons: Buttons::START.bits(),
            stick_x: 0,
            stick_y: 255,
            c_stick_x: 1,
            c_stick_y: 254,
            trigger_l: 255,
            trigger_r: 51,
        };
        let state = raw.normalize(0.0);

        assert_eq!(state.stick_x, -1.0);
        assert_eq!(state.stick_y, 1.0);
        assert_eq!(state.c_stick_x, -1.0);
        assert!((state.c_stick_y - 126.0 / 127.0).abs() < f32::EPSILON);
        assert_eq!(state.analog_l, 1.0);
        assert!((state.analog_r - 0.2).abs() < 1e-6);
        assert_eq!(state.buttons, Buttons::START);
    }

    #[test]
    fn deadzone_zeroes_small_deflection() {
        let raw = RawControllerState {
            stick_x: 131,
            stick_y: 255,
            ..RawControllerState::neutral()
        };
        let state = raw.normalize(0.1);
        assert_eq!(state.stick_x, 0.0);
        assert_eq!(state.stick_y, 1.0);
    }

    #[test]
    fn out_of_range_deadzone_keeps_axes_finite() {
        let raw = RawControllerState {
            stick_x: 255,
            stick_y: 0,
            c_stick_x: 200,
            ..RawControllerState::neutral()
        };

        for deadzone in [1.0, 5.0, -0.5, f32::NAN, f32::INFINITY] {
            let state = raw.normalize(deadzone);
            for axis in [state.stick_x, state.stick_y, state.c_stick_x, state.c_stick_y] {
                assert!(axis.is_finite(), "deadzone {} gave {}", deadzone, axis);
                assert!((-1.0..=1.0).contains(&axis));
            }
        }
        assert_eq!(raw.normalize(1.0).stick_x, 1.0);
        assert_eq!(raw.normalize(f32::NAN).stick_y, -1.0);
    }

    #[test]
    fn clamp_deadzone_bounds() {
        assert_eq!(clamp_deadzone(f32::NAN), 0.0);
        assert_eq!(clamp_deadzone(-1.0), 0.0);
        assert_eq!(clamp_deadzone(0.25), 0.25);
        assert_eq!(clamp_deadzone(1.0), MAX_STICK_DEADZONE);
    }
}
