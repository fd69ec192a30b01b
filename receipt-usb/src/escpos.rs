//! ESC/POS command builder
//!
//! Provides a fluent API for building ESC/POS print data.

use std::ops::Deref;

use encoding_rs::Encoding;
use tracing::{debug, warn};

/// ESC @ - Initialize printer
const INIT: [u8; 2] = [0x1B, 0x40];

/// Text alignment (ESC a n)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
    Right,
}

/// Underline mode (ESC - n)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Underline {
    Off,
    Single,
    Double,
}

/// Paper cut mode (GS V m)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cut {
    Full,
    Partial,
}

/// Finished ESC/POS byte stream
///
/// Always starts with ESC @.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuffer {
    bytes: Vec<u8>,
}

impl CommandBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Deref for CommandBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for CommandBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// ESC/POS command builder
///
/// Each call appends one command and hands the builder back, so jobs read
/// as a chain. [`build`](Self::build) consumes the builder.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    buf: Vec<u8>,
    encoding: &'static Encoding,
}

impl CommandBuilder {
    /// Builder that writes text as UTF-8
    pub fn new() -> Self {
        Self::with_encoding(encoding_rs::UTF_8)
    }

    /// Builder that encodes text with the given encoding (e.g. `encoding_rs::GBK`)
    pub fn with_encoding(encoding: &'static Encoding) -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            encoding,
        }
    }

    /// Builder for a WHATWG encoding label; `None` if the label is unknown
    pub fn for_label(label: &str) -> Option<Self> {
        Encoding::for_label(label.as_bytes()).map(Self::with_encoding)
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    // === Printer Control ===

    /// Initialize printer (ESC @)
    pub fn init(mut self) -> Self {
        self.buf.extend_from_slice(&INIT);
        self
    }

    // === Text Style ===

    pub fn align(mut self, align: Align) -> Self {
        let n = match align {
            Align::Left => 0x00,
            Align::Center => 0x01,
            Align::Right => 0x02,
        };
        self.buf.extend_from_slice(&[0x1B, 0x61, n]);
        self
    }

    /// Character size multiplier (GS ! n), 1..=8 each way.
    ///
    /// Values outside the range are clamped.
    pub fn size(mut self, width: u8, height: u8) -> Self {
        let w = width.clamp(1, 8);
        let h = height.clamp(1, 8);
        if (w, h) != (width, height) {
            debug!(width, height, "size clamped to 1..=8");
        }
        self.buf.extend_from_slice(&[0x1D, 0x21, ((w - 1) << 4) | (h - 1)]);
        self
    }

    pub fn bold(mut self, on: bool) -> Self {
        self.buf.extend_from_slice(&[0x1B, 0x45, u8::from(on)]);
        self
    }

    pub fn underline(mut self, mode: Underline) -> Self {
        let n = match mode {
            Underline::Off => 0x00,
            Underline::Single => 0x01,
            Underline::Double => 0x02,
        };
        self.buf.extend_from_slice(&[0x1B, 0x2D, n]);
        self
    }

    // === Text Output ===

    /// Write text in the builder's encoding
    pub fn text(mut self, s: &str) -> Self {
        let (bytes, _, had_errors) = self.encoding.encode(s);
        if had_errors {
            warn!(encoding = self.encoding.name(), "unmappable characters replaced");
        }
        self.buf.extend_from_slice(&bytes);
        self
    }

    /// Write text followed by newline
    pub fn line(self, s: &str) -> Self {
        self.text(s).feed(1)
    }

    /// Line feeds
    pub fn feed(mut self, lines: u8) -> Self {
        self.buf.extend(std::iter::repeat_n(0x0A, lines as usize));
        self
    }

    // === Paper Control ===

    pub fn cut(mut self, mode: Cut) -> Self {
        let m = match mode {
            Cut::Full => 0x00,
            Cut::Partial => 0x01,
        };
        self.buf.extend_from_slice(&[0x1D, 0x56, m]);
        self
    }

    // === Cash Drawer ===

    /// Open cash drawer (pin 2)
    pub fn open_drawer(mut self) -> Self {
        // ESC p m t1 t2 - 25 × 2 ms on, 250 × 2 ms off
        self.buf.extend_from_slice(&[0x1B, 0x70, 0x00, 25, 250]);
        self
    }

    // === Raw Commands ===

    /// Write raw bytes directly
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    // === Build ===

    /// Finish the stream, prepending ESC @ if the chain did not start with it
    pub fn build(self) -> CommandBuffer {
        let bytes = if self.buf.starts_with(&INIT) {
            self.buf
        } else {
            let mut bytes = Vec::with_capacity(self.buf.len() + INIT.len());
            bytes.extend_from_slice(&INIT);
            bytes.extend_from_slice(&self.buf);
            bytes
        };
        CommandBuffer { bytes }
    }
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}
