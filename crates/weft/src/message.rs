use std::{
    cell::{Cell, Ref, RefCell},
    rc::Rc,
};

use weft_utils::{alloc, bug, bug_assert};

use crate::{
    error::Result,
    wire::{
        self, OFFSET_HEADER_LEN, OFFSET_REPLY_SERIAL, OFFSET_SERIAL, OFFSET_TOTAL_LEN, PROLOGUE_LEN,
    },
};

/// A framed message: header bytes and body bytes, independently sized.
///
/// `Message` is a cheap refcounted handle; cloning it is the refcount
/// increment, dropping it the decrement. Once [`lock`](Message::lock) has been
/// called (entry into any outbound queue) the bytes and the serial are frozen
/// and mutators become programming errors.
#[derive(Clone, Debug)]
pub struct Message {
    inner: Rc<Inner>,
}

#[derive(Debug)]
struct Inner {
    header: RefCell<Vec<u8>>,
    body: RefCell<Vec<u8>>,
    locked: Cell<bool>,
    counters: RefCell<Vec<ChargedCounter>>,
}

#[derive(Debug)]
struct ChargedCounter {
    counter: SizeCounter,
    amount: usize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for charged in self.counters.borrow_mut().drain(..) {
            charged.counter.credit(charged.amount);
        }
    }
}

impl Message {
    /// A fresh unlocked message with the given name and an empty body.
    pub fn new(name: &str) -> Result<Self> {
        Self::build(name, &[], 0)
    }

    /// A fresh unlocked message with the given name and body bytes.
    pub fn with_body(name: &str, body: &[u8]) -> Result<Self> {
        Self::build(name, body, 0)
    }

    /// An error message carrying `name` in the header and the human-readable
    /// `text` as body. Not yet targeted at any request.
    pub fn error(name: &str, text: &str) -> Result<Self> {
        Self::build(name, text.as_bytes(), 0)
    }

    /// An error reply targeted at `in_reply_to` by serial.
    pub fn error_reply(in_reply_to: &Self, name: &str, text: &str) -> Result<Self> {
        Self::build(name, text.as_bytes(), in_reply_to.serial())
    }

    fn build(name: &str, body: &[u8], reply_serial: i32) -> Result<Self> {
        alloc::claim()?;

        let header_len = PROLOGUE_LEN + name.len();
        let total_len = header_len + body.len();

        let mut header = Vec::new();
        alloc::reserve_vec(&mut header, header_len)?;
        header.resize(PROLOGUE_LEN, 0);
        header.extend_from_slice(name.as_bytes());
        wire::put_u32(&mut header, OFFSET_TOTAL_LEN, total_len as u32);
        wire::put_u32(&mut header, OFFSET_HEADER_LEN, header_len as u32);
        wire::put_i32(&mut header, OFFSET_REPLY_SERIAL, reply_serial);

        let mut owned_body = Vec::new();
        alloc::reserve_vec(&mut owned_body, body.len())?;
        owned_body.extend_from_slice(body);

        Ok(Self::from_parts(header, owned_body, false))
    }

    /// Builds a message straight from framed bytes. Used by the loader; the
    /// result is already locked.
    pub fn from_wire(header: &[u8], body: &[u8]) -> Result<Self> {
        alloc::claim()?;

        let mut owned_header = Vec::new();
        alloc::reserve_vec(&mut owned_header, header.len())?;
        owned_header.extend_from_slice(header);

        let mut owned_body = Vec::new();
        alloc::reserve_vec(&mut owned_body, body.len())?;
        owned_body.extend_from_slice(body);

        Ok(Self::from_parts(owned_header, owned_body, true))
    }

    fn from_parts(header: Vec<u8>, body: Vec<u8>, locked: bool) -> Self {
        Self {
            inner: Rc::new(Inner {
                header: RefCell::new(header),
                body: RefCell::new(body),
                locked: Cell::new(locked),
                counters: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Freezes the message. Idempotent.
    pub fn lock(&self) {
        self.inner.locked.set(true);
    }

    pub fn is_locked(&self) -> bool {
        self.inner.locked.get()
    }

    /// Header and body bytes as they go on the wire. Only valid once locked.
    pub fn network_data(&self) -> (Ref<'_, [u8]>, Ref<'_, [u8]>) {
        bug_assert!(self.is_locked(), "network data read from an unlocked message");
        (
            Ref::map(self.inner.header.borrow(), Vec::as_slice),
            Ref::map(self.inner.body.borrow(), Vec::as_slice),
        )
    }

    pub fn serial(&self) -> i32 {
        self.read_prologue_i32(OFFSET_SERIAL)
    }

    /// Stamps the serial. Mutating a locked message is a programming error.
    pub fn set_serial(&self, serial: i32) {
        self.write_prologue_i32(OFFSET_SERIAL, serial);
    }

    pub fn reply_serial(&self) -> i32 {
        self.read_prologue_i32(OFFSET_REPLY_SERIAL)
    }

    /// Retargets the reply. The field sits at a fixed prologue offset, so this
    /// never reallocates.
    pub fn set_reply_serial(&self, serial: i32) {
        self.write_prologue_i32(OFFSET_REPLY_SERIAL, serial);
    }

    /// The name field of the header; empty for stub-framed messages.
    pub fn name(&self) -> Ref<'_, str> {
        Ref::map(self.inner.header.borrow(), |header| {
            if header.len() <= PROLOGUE_LEN {
                return "";
            }
            std::str::from_utf8(&header[PROLOGUE_LEN..]).unwrap_or("")
        })
    }

    /// Total number of bytes this message occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.inner.header.borrow().len() + self.inner.body.borrow().len()
    }

    /// Charges `counter` by the wire size of this message; the charge is
    /// credited back when the last handle drops.
    pub fn add_size_counter(&self, counter: SizeCounter) -> Result<()> {
        let amount = self.wire_len();
        let mut counters = self.inner.counters.borrow_mut();
        alloc::reserve_vec(&mut counters, 1)?;
        counter.charge(amount);
        counters.push(ChargedCounter { counter, amount });
        Ok(())
    }

    /// Number of live handles to this message.
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// True when both handles refer to the same message.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn read_prologue_i32(&self, offset: usize) -> i32 {
        let header = self.inner.header.borrow();
        if header.len() < PROLOGUE_LEN {
            return 0;
        }
        wire::get_i32(&header, offset)
    }

    fn write_prologue_i32(&self, offset: usize, value: i32) {
        bug_assert!(!self.is_locked(), "field written on a locked message");
        let mut header = self.inner.header.borrow_mut();
        if header.len() < PROLOGUE_LEN {
            bug!("field written on a message without a prologue");
            return;
        }
        wire::put_i32(&mut header, offset, value);
    }
}

/// Monotonic serial source. Serials are nonzero; the counter wraps back to 1.
#[derive(Debug)]
pub struct SerialCounter {
    value: i32,
}

impl SerialCounter {
    pub fn new() -> Self {
        Self { value: 1 }
    }

    pub fn next(&mut self) -> i32 {
        let serial = self.value;
        self.value = self.value.checked_add(1).unwrap_or(1);
        serial
    }
}

impl Default for SerialCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared byte counter for outbound accounting, charged while a message is
/// alive.
#[derive(Clone, Debug, Default)]
pub struct SizeCounter {
    bytes: Rc<Cell<usize>>,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> usize {
        self.bytes.get()
    }

    fn charge(&self, amount: usize) {
        self.bytes.set(self.bytes.get() + amount);
    }

    fn credit(&self, amount: usize) {
        let current = self.bytes.get();
        bug_assert!(current >= amount, "size counter credited below zero");
        self.bytes.set(current.saturating_sub(amount));
    }
}
