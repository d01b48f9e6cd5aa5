//! Decodes `INPUT_DATA` control-channel payloads into calls on an
//! [`InputSink`]. One [`InputInterpreter`] is shared across all sessions;
//! per-controller state (which joypad indices exist, whether a touch/pen
//! device has been created yet) is tracked per session.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::error::{HostError, ProtocolError};
use crate::input_sink::{ControllerCapabilities, ControllerType, InputSink, MouseButton};
use crate::session::{SessionEvent, SharedEventBus};

const MOUSE_MOVE_REL: u32 = 0x07;
const MOUSE_MOVE_ABS: u32 = 0x05;
const MOUSE_BUTTON_PRESS: u32 = 0x08;
const MOUSE_BUTTON_RELEASE: u32 = 0x09;
const MOUSE_SCROLL: u32 = 0x0A;
const MOUSE_HSCROLL: u32 = 0x5500_0001;
const KEY_PRESS: u32 = 0x03;
const KEY_RELEASE: u32 = 0x04;
const UTF8_TEXT: u32 = 0x17;
const CONTROLLER_ARRIVAL: u32 = 0x5500_0004;
const CONTROLLER_MULTI: u32 = 0x0C;
const CONTROLLER_TOUCH: u32 = 0x5500_0005;
const CONTROLLER_MOTION: u32 = 0x5500_0006;
const CONTROLLER_BATTERY: u32 = 0x5500_0007;
const TOUCH: u32 = 0x5500_0002;
const PEN: u32 = 0x5500_0003;

/// Per-session bookkeeping: which joypad indices have been created, and
/// whether a shared touch/pen virtual device already exists.
#[derive(Default)]
struct SessionInputState {
    controllers: std::collections::HashSet<u8>,
    touch_created: bool,
    pen_created: bool,
}

pub struct InputInterpreter {
    sink: Arc<dyn InputSink>,
    bus: SharedEventBus,
    sessions: DashMap<u64, SessionInputState>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], HostError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or(HostError::ProtocolGrammar(ProtocolError::MalformedControlPacket {
                field: "input_data",
            }))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, HostError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, HostError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16_be(&mut self) -> Result<i16, HostError> {
        Ok(self.u16_be()? as i16)
    }

    fn u32_be(&mut self) -> Result<u32, HostError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32_le(&mut self) -> Result<u32, HostError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32_be(&mut self) -> Result<f32, HostError> {
        Ok(f32::from_bits(self.u32_be()?))
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

impl InputInterpreter {
    pub fn new(sink: Arc<dyn InputSink>, bus: SharedEventBus) -> Self {
        Self {
            sink,
            bus,
            sessions: DashMap::new(),
        }
    }

    pub fn drop_session(&self, session_id: u64) {
        self.sessions.remove(&session_id);
    }

    /// Decode and dispatch one `INPUT_DATA` payload. Never blocks, and
    /// never returns an error for an unknown subtype (logged and dropped
    /// instead, per the interpreter's invariant).
    pub fn dispatch(&self, session_id: u64, payload: &[u8]) -> Result<(), HostError> {
        let mut cur = Cursor::new(payload);
        let tag = cur.u32_le()?;

        match tag {
            MOUSE_MOVE_REL => {
                let dx = cur.i16_be()?;
                let dy = cur.i16_be()?;
                self.sink.mouse_move_rel(session_id, dx, dy);
            }
            MOUSE_MOVE_ABS => {
                let x = cur.i16_be()?;
                let y = cur.i16_be()?;
                let width = cur.i16_be()?;
                let height = cur.i16_be()?;
                self.sink.mouse_move_abs(session_id, x, y, width, height);
            }
            MOUSE_BUTTON_PRESS | MOUSE_BUTTON_RELEASE => {
                let button = cur.u8()?;
                let Some(button) = mouse_button_from_index(button) else {
                    warn!(session_id, button, "unknown mouse button index");
                    return Ok(());
                };
                self.sink.mouse_button(session_id, button, tag == MOUSE_BUTTON_PRESS);
            }
            MOUSE_SCROLL => {
                let amount = cur.i16_be()?;
                self.sink.mouse_scroll(session_id, amount);
            }
            MOUSE_HSCROLL => {
                let amount = cur.i16_be()?;
                self.sink.mouse_hscroll(session_id, amount);
            }
            KEY_PRESS | KEY_RELEASE => {
                let keycode = cur.u16_be()? & 0x7fff;
                self.sink.key(session_id, keycode, tag == KEY_PRESS);
            }
            UTF8_TEXT => {
                let text = std::str::from_utf8(cur.rest()).map_err(|_| {
                    HostError::ProtocolGrammar(ProtocolError::MalformedControlPacket { field: "utf8_text" })
                })?;
                self.sink.paste_utf(session_id, text);
            }
            CONTROLLER_ARRIVAL => {
                let index = cur.u8()?;
                let controller_type = controller_type_from_tag(cur.u8()?);
                let capabilities = ControllerCapabilities::from_bits_truncate(cur.u16_be()? as u32);

                let occupied = self.with_session(session_id, |s| s.controllers.contains(&index));
                if occupied {
                    debug!(session_id, index, "controller arrival replacing occupied index");
                    self.sink.controller_removal(session_id, index);
                }

                self.sink.controller_arrival(session_id, index, controller_type, capabilities);
                self.with_session(session_id, |s| {
                    s.controllers.insert(index);
                });
                self.bus.publish(SessionEvent::DeviceHotplug { session_id, joypad_index: index });
            }
            CONTROLLER_MULTI => {
                let index = cur.u8()?;
                let button_flags = cur.u32_be()?;
                let left_x = cur.i16_be()?;
                let left_y = -cur.i16_be()?;
                let right_x = cur.i16_be()?;
                let right_y = -cur.i16_be()?;
                let left_trigger = cur.u8()?;
                let right_trigger = cur.u8()?;

                let known = self.with_session(session_id, |s| s.controllers.contains(&index));
                if !known {
                    debug!(session_id, index, "legacy CONTROLLER_MULTI without ARRIVAL, synthesising joypad");
                    self.sink.controller_arrival(
                        session_id,
                        index,
                        ControllerType::Xbox,
                        ControllerCapabilities::ANALOG_TRIGGERS | ControllerCapabilities::RUMBLE,
                    );
                    self.with_session(session_id, |s| {
                        s.controllers.insert(index);
                    });
                }

                self.sink.controller_multi(
                    session_id,
                    index,
                    button_flags,
                    (left_x, left_y),
                    (right_x, right_y),
                    left_trigger,
                    right_trigger,
                );
            }
            CONTROLLER_TOUCH => {
                let index = cur.u8()?;
                let finger_id = cur.u32_be()?;
                let x = cur.f32_be()?;
                let y = cur.f32_be()?;
                let pressure = cur.f32_be()?;
                self.sink.controller_touch(session_id, index, finger_id, x, y, pressure);
            }
            CONTROLLER_MOTION => {
                let index = cur.u8()?;
                let motion_type = cur.u8()?;
                let x = cur.f32_be()?;
                let y = cur.f32_be()?;
                let z = cur.f32_be()?;
                self.sink.controller_motion(session_id, index, motion_type, x, y, z);
            }
            CONTROLLER_BATTERY => {
                let index = cur.u8()?;
                let state = cur.u8()?;
                let percentage = cur.u8()?;
                self.sink.controller_battery(session_id, index, state, percentage);
            }
            TOUCH => {
                let finger_id = cur.u32_be()?;
                let x = cur.f32_be()?;
                let y = cur.f32_be()?;
                let pressure = cur.f32_be()?;
                self.with_session(session_id, |s| s.touch_created = true);
                self.sink.touch(session_id, finger_id, x, y, pressure);
            }
            PEN => {
                let x = cur.f32_be()?;
                let y = cur.f32_be()?;
                let pressure = cur.f32_be()?;
                let tilt = cur.u8()? as i8;
                let rotation = cur.u16_be()?;
                self.with_session(session_id, |s| s.pen_created = true);
                self.sink.pen(session_id, x, y, pressure, tilt, rotation);
            }
            other => {
                trace!(session_id, tag = other, "unknown INPUT_DATA subtype, dropped");
            }
        }

        Ok(())
    }

    fn with_session<R>(&self, session_id: u64, f: impl FnOnce(&mut SessionInputState) -> R) -> R {
        let mut entry = self.sessions.entry(session_id).or_default();
        f(&mut entry)
    }
}

fn mouse_button_from_index(index: u8) -> Option<MouseButton> {
    match index {
        1 => Some(MouseButton::Left),
        2 => Some(MouseButton::Middle),
        3 => Some(MouseButton::Right),
        4 => Some(MouseButton::Side),
        5 => Some(MouseButton::Extra),
        _ => None,
    }
}

fn controller_type_from_tag(tag: u8) -> ControllerType {
    match tag {
        1 => ControllerType::PlayStation,
        2 => ControllerType::Nintendo,
        _ => ControllerType::Xbox,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_sink::LoggingInputSink;
    use crate::session::EventBus;

    fn interpreter() -> InputInterpreter {
        InputInterpreter::new(Arc::new(LoggingInputSink), Arc::new(EventBus::new()))
    }

    fn payload(tag: u32, rest: &[u8]) -> Vec<u8> {
        let mut out = tag.to_le_bytes().to_vec();
        out.extend_from_slice(rest);
        out
    }

    #[test]
    fn mouse_move_rel_decodes_big_endian_deltas() {
        let i = interpreter();
        let p = payload(MOUSE_MOVE_REL, &[0x00, 0x05, 0xFF, 0xFB]);
        assert!(i.dispatch(1, &p).is_ok());
    }

    #[test]
    fn unknown_subtype_is_dropped_not_errored() {
        let i = interpreter();
        let p = payload(0xDEADBEEF, &[1, 2, 3]);
        assert!(i.dispatch(1, &p).is_ok());
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let i = interpreter();
        let p = payload(MOUSE_MOVE_REL, &[0x00]);
        assert!(i.dispatch(1, &p).is_err());
    }

    #[test]
    fn controller_multi_synthesises_joypad_without_arrival() {
        let i = interpreter();
        let mut rest = Vec::new();
        rest.push(0u8); // index
        rest.extend_from_slice(&0u32.to_be_bytes()); // button flags
        rest.extend_from_slice(&0i16.to_be_bytes()); // left x
        rest.extend_from_slice(&0i16.to_be_bytes()); // left y
        rest.extend_from_slice(&0i16.to_be_bytes()); // right x
        rest.extend_from_slice(&0i16.to_be_bytes()); // right y
        rest.push(0u8); // left trigger
        rest.push(0u8); // right trigger
        let p = payload(CONTROLLER_MULTI, &rest);
        assert!(i.dispatch(7, &p).is_ok());
        assert!(i.with_session(7, |s| s.controllers.contains(&0)));
    }

    #[tokio::test]
    async fn controller_arrival_publishes_device_hotplug() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe();
        let i = InputInterpreter::new(Arc::new(LoggingInputSink), bus);
        let mut rest = Vec::new();
        rest.push(2u8); // index
        rest.push(0u8); // controller type
        rest.extend_from_slice(&0u16.to_be_bytes()); // capabilities
        let p = payload(CONTROLLER_ARRIVAL, &rest);
        assert!(i.dispatch(9, &p).is_ok());

        let event = sub.recv().await.expect("DeviceHotplug should have been published");
        match event {
            SessionEvent::DeviceHotplug { session_id, joypad_index } => {
                assert_eq!(session_id, 9);
                assert_eq!(joypad_index, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn key_press_masks_off_high_bit() {
        let i = interpreter();
        let p = payload(KEY_PRESS, &0x8041u16.to_be_bytes());
        assert!(i.dispatch(1, &p).is_ok());
    }

    #[test]
    fn utf8_text_round_trips() {
        let i = interpreter();
        let p = payload(UTF8_TEXT, "hi".as_bytes());
        assert!(i.dispatch(1, &p).is_ok());
    }

    #[test]
    fn drop_session_clears_controller_state() {
        let i = interpreter();
        i.with_session(3, |s| {
            s.controllers.insert(0);
        });
        i.drop_session(3);
        assert!(!i.sessions.contains_key(&3));
    }
}
