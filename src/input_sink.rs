//! `InputSink`: the pluggable collaborator that turns decoded input events
//! into actual device actions (uinput, a virtual HID bus, or whatever the
//! deployment's emulation layer wants). The interpreter never talks to a
//! device driver directly — it only calls this trait, mirroring the
//! teacher's `ServerInputManager` → `DolphinInputAdapter` split.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    Side,
    Extra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerType {
    Xbox,
    PlayStation,
    Nintendo,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControllerCapabilities: u32 {
        const ANALOG_TRIGGERS = 0x01;
        const RUMBLE          = 0x02;
        const TRIGGER_RUMBLE  = 0x04;
        const TOUCHPAD        = 0x08;
        const ACCELEROMETER   = 0x10;
        const GYRO            = 0x20;
        const BATTERY         = 0x40;
        const RGB_LED         = 0x80;
    }
}

/// A virtual input device handle, opaque to callers.
pub type DeviceHandle = u64;

/// Everything the interpreter can ask a device backend to do. All methods
/// are expected to return promptly (no blocking I/O on the calling
/// thread) — per the interpreter's non-blocking invariant.
pub trait InputSink: Send + Sync {
    fn mouse_move_rel(&self, session_id: u64, dx: i16, dy: i16);
    fn mouse_move_abs(&self, session_id: u64, x: i16, y: i16, width: i16, height: i16);
    fn mouse_button(&self, session_id: u64, button: MouseButton, pressed: bool);
    fn mouse_scroll(&self, session_id: u64, amount: i16);
    fn mouse_hscroll(&self, session_id: u64, amount: i16);
    fn key(&self, session_id: u64, moonlight_keycode: u16, pressed: bool);
    fn paste_utf(&self, session_id: u64, text: &str);

    fn controller_arrival(
        &self,
        session_id: u64,
        index: u8,
        controller_type: ControllerType,
        capabilities: ControllerCapabilities,
    ) -> DeviceHandle;
    fn controller_removal(&self, session_id: u64, index: u8);
    #[allow(clippy::too_many_arguments)]
    fn controller_multi(
        &self,
        session_id: u64,
        index: u8,
        button_flags: u32,
        left_stick: (i16, i16),
        right_stick: (i16, i16),
        left_trigger: u8,
        right_trigger: u8,
    );
    fn controller_touch(&self, session_id: u64, index: u8, finger_id: u32, x: f32, y: f32, pressure: f32);
    fn controller_motion(&self, session_id: u64, index: u8, motion_type: u8, x: f32, y: f32, z: f32);
    fn controller_battery(&self, session_id: u64, index: u8, state: u8, percentage: u8);

    fn touch(&self, session_id: u64, finger_id: u32, x: f32, y: f32, pressure: f32);
    fn pen(&self, session_id: u64, x: f32, y: f32, pressure: f32, tilt: i8, rotation: u16);
}

/// Reference implementation: logs every event rather than driving real
/// devices. Suitable as a default when no platform-specific sink is
/// configured, and for exercising the interpreter in tests.
#[derive(Default)]
pub struct LoggingInputSink;

impl InputSink for LoggingInputSink {
    fn mouse_move_rel(&self, session_id: u64, dx: i16, dy: i16) {
        debug!(session_id, dx, dy, "mouse move rel");
    }
    fn mouse_move_abs(&self, session_id: u64, x: i16, y: i16, width: i16, height: i16) {
        debug!(session_id, x, y, width, height, "mouse move abs");
    }
    fn mouse_button(&self, session_id: u64, button: MouseButton, pressed: bool) {
        debug!(session_id, ?button, pressed, "mouse button");
    }
    fn mouse_scroll(&self, session_id: u64, amount: i16) {
        debug!(session_id, amount, "mouse scroll");
    }
    fn mouse_hscroll(&self, session_id: u64, amount: i16) {
        debug!(session_id, amount, "mouse hscroll");
    }
    fn key(&self, session_id: u64, moonlight_keycode: u16, pressed: bool) {
        debug!(session_id, moonlight_keycode, pressed, "key");
    }
    fn paste_utf(&self, session_id: u64, text: &str) {
        debug!(session_id, text, "paste utf");
    }
    fn controller_arrival(
        &self,
        session_id: u64,
        index: u8,
        controller_type: ControllerType,
        capabilities: ControllerCapabilities,
    ) -> DeviceHandle {
        debug!(session_id, index, ?controller_type, ?capabilities, "controller arrival");
        (session_id << 8) | index as u64
    }
    fn controller_removal(&self, session_id: u64, index: u8) {
        debug!(session_id, index, "controller removal");
    }
    fn controller_multi(
        &self,
        session_id: u64,
        index: u8,
        button_flags: u32,
        left_stick: (i16, i16),
        right_stick: (i16, i16),
        left_trigger: u8,
        right_trigger: u8,
    ) {
        debug!(
            session_id,
            index, button_flags, ?left_stick, ?right_stick, left_trigger, right_trigger,
            "controller multi"
        );
    }
    fn controller_touch(&self, session_id: u64, index: u8, finger_id: u32, x: f32, y: f32, pressure: f32) {
        debug!(session_id, index, finger_id, x, y, pressure, "controller touch");
    }
    fn controller_motion(&self, session_id: u64, index: u8, motion_type: u8, x: f32, y: f32, z: f32) {
        debug!(session_id, index, motion_type, x, y, z, "controller motion");
    }
    fn controller_battery(&self, session_id: u64, index: u8, state: u8, percentage: u8) {
        debug!(session_id, index, state, percentage, "controller battery");
    }
    fn touch(&self, session_id: u64, finger_id: u32, x: f32, y: f32, pressure: f32) {
        debug!(session_id, finger_id, x, y, pressure, "touch");
    }
    fn pen(&self, session_id: u64, x: f32, y: f32, pressure: f32, tilt: i8, rotation: u16) {
        debug!(session_id, x, y, pressure, tilt, rotation, "pen");
    }
}
