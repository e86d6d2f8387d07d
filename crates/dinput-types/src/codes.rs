//! Linux input event codes used by the engine.
//!
//! Values are bit-exact with `linux/input-event-codes.h`. Only the codes the
//! engine inspects are listed; everything else travels as an opaque `u16`.

// Event types
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;
pub const EV_MSC: u16 = 0x04;
pub const EV_SW: u16 = 0x05;
pub const EV_LED: u16 = 0x11;
pub const EV_REP: u16 = 0x14;
pub const EV_FF: u16 = 0x15;

// Synchronization
pub const SYN_REPORT: u16 = 0x00;
pub const SYN_DROPPED: u16 = 0x03;

// Key values
pub const KEY_UP_STATE: i32 = 0;
pub const KEY_DOWN_STATE: i32 = 1;
pub const KEY_REPEAT_STATE: i32 = 2;

// Keys and buttons
pub const KEY_LEFTCTRL: u16 = 29;
pub const KEY_A: u16 = 30;
pub const KEY_LEFTSHIFT: u16 = 42;
pub const KEY_LEFTALT: u16 = 56;
pub const KEY_DELETE: u16 = 111;
pub const KEY_MAX: u16 = 0x2ff;
pub const BTN_MISC: u16 = 0x100;
pub const BTN_MOUSE: u16 = 0x110;
pub const BTN_LEFT: u16 = 0x110;
pub const BTN_RIGHT: u16 = 0x111;
pub const BTN_MIDDLE: u16 = 0x112;
pub const BTN_TOOL_FINGER: u16 = 0x145;
pub const BTN_TOUCH: u16 = 0x14a;

// Relative axes
pub const REL_X: u16 = 0x00;
pub const REL_Y: u16 = 0x01;
pub const REL_WHEEL: u16 = 0x08;

// Absolute axes
pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_PRESSURE: u16 = 0x18;
pub const ABS_MT_SLOT: u16 = 0x2f;
pub const ABS_MT_POSITION_X: u16 = 0x35;
pub const ABS_MT_POSITION_Y: u16 = 0x36;
pub const ABS_MT_TRACKING_ID: u16 = 0x39;

// Auto-repeat
pub const REP_DELAY: u16 = 0x00;
pub const REP_PERIOD: u16 = 0x01;

// Bus types
pub const BUS_USB: u16 = 0x03;
pub const BUS_VIRTUAL: u16 = 0x06;

/// Whether `code` is one of the absolute position axes (X/Y, MT X/Y).
pub fn is_position_axis(code: u16) -> bool {
    matches!(
        code,
        ABS_X | ABS_Y | ABS_MT_POSITION_X | ABS_MT_POSITION_Y
    )
}
