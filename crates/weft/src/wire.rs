//! Fixed little-endian message prologue.
//!
//! Every framed message starts with a 16-byte prologue followed by the name
//! field; the remainder of the frame is the opaque body:
//!
//! - 4-byte LE total frame length (prologue + name + body)
//! - 4-byte LE header length (prologue + name)
//! - 4-byte LE serial
//! - 4-byte LE reply serial (0 = not a reply)
//!
//! The reply serial lives at a fixed offset so retargeting an already encoded
//! header never reallocates.

pub const PROLOGUE_LEN: usize = 16;

pub const OFFSET_TOTAL_LEN: usize = 0;
pub const OFFSET_HEADER_LEN: usize = 4;
pub const OFFSET_SERIAL: usize = 8;
pub const OFFSET_REPLY_SERIAL: usize = 12;

pub fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

pub fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn get_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

pub fn put_i32(buf: &mut [u8], at: usize, value: i32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}
