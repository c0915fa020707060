//! PS/2 keyboard, scancode set 1.

pub const DATA_PORT: u16 = 0x60;

/// Break codes have bit 7 set.
const RELEASE: u8 = 0x80;

/// US layout make codes 0x00..=0x39; 0 means no printable key.
static SET1: [u8; 0x3A] = [
    0, 0, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
];

/// ASCII for a key press; `None` for releases and non-printing keys.
pub fn translate(scancode: u8) -> Option<u8> {
    if scancode & RELEASE != 0 {
        return None;
    }
    SET1.get(scancode as usize).copied().filter(|&c| c != 0)
}
