// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Buffered character and byte I/O ports.
//!
//! A port is file-backed (a buffered stream over a file descriptor),
//! memory-backed (reads from or writes into an in-memory byte buffer),
//! or custom (a callback cookie supplied by the embedder). The layer
//! offers character reads with one-character pushback, character and
//! string writes, flushing, and end-of-file detection. Line tracking
//! increments on linefeed reads when the port is a source port.
//!
//! Reads and writes on non-blocking descriptors surface
//! [`PortError::WouldBlock`]; the VM turns that into an fd-wait
//! scheduler transition instead of spinning.

#[cfg(test)]
mod port_test;

use core::fmt;

use bitflags::bitflags;

/// Size of the fill buffer for descriptor-backed ports.
const FD_BUFFER_SIZE: usize = 4096;

bitflags! {
    /// Port mode and state bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PortFlags: u16 {
        /// The port is open.
        const OPEN = 1 << 0;
        /// Reading is permitted.
        const INPUT = 1 << 1;
        /// Writing is permitted.
        const OUTPUT = 1 << 2;
        /// Byte-oriented; character decoding is not applied.
        const BINARY = 1 << 3;
        /// Symbols read through this port fold case.
        const FOLD_CASE = 1 << 4;
        /// Reader source port: track line numbers.
        const SOURCE = 1 << 5;
        /// The port is parked in the scheduler's wait set.
        const BLOCKED = 1 << 6;
        /// Close the underlying descriptor when finalized.
        const OWNED = 1 << 7;
    }
}

/// Embedder-defined port callbacks.
pub trait PortCookie {
    /// Read into `buf`, returning the byte count (0 at end of input).
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the underlying medium.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write all of `buf`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the underlying medium.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;

    /// Flush buffered output.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the underlying medium.
    fn flush(&mut self) -> std::io::Result<()>;

    /// Release underlying resources.
    fn close(&mut self);
}

enum Backend {
    /// File descriptor with a fill buffer.
    Fd {
        fd: i32,
        buf: Box<[u8; FD_BUFFER_SIZE]>,
        buf_pos: usize,
        buf_len: usize,
        at_eof: bool,
    },
    /// In-memory input.
    Bytes { data: Vec<u8>, pos: usize },
    /// In-memory output.
    Sink { data: Vec<u8> },
    /// Embedder callbacks plus a one-shot fill buffer.
    Custom {
        cookie: Box<dyn PortCookie>,
        buf: Vec<u8>,
        buf_pos: usize,
        at_eof: bool,
    },
    /// Closed; all operations fail.
    Closed,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fd { fd, .. } => write!(f, "Fd({fd})"),
            Self::Bytes { data, pos } => write!(f, "Bytes({pos}/{})", data.len()),
            Self::Sink { data } => write!(f, "Sink({})", data.len()),
            Self::Custom { .. } => write!(f, "Custom"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Errors surfaced by port operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// The port has been closed.
    Closed,
    /// Read on an output port or write on an input port.
    WrongDirection,
    /// The descriptor would block; park on it and retry.
    WouldBlock {
        /// Descriptor to wait on.
        fd: i32,
        /// Waiting for writability rather than readability.
        write: bool,
    },
    /// An operating-system error.
    Io {
        /// The `errno` value.
        errno: i32,
    },
    /// The byte stream is not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "port is closed"),
            Self::WrongDirection => write!(f, "operation not permitted in this direction"),
            Self::WouldBlock { fd, .. } => write!(f, "descriptor {fd} would block"),
            Self::Io { errno } => write!(f, "I/O error (errno {errno})"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 in input"),
        }
    }
}

/// A buffered port.
#[derive(Debug)]
pub struct PortData {
    /// Port name for diagnostics (file path or a descriptive label).
    pub name: String,
    /// Current line, 1-based; advances on linefeed for source ports.
    pub line: u32,
    /// Mode and state bits.
    pub flags: PortFlags,
    backend: Backend,
    pushback: Option<char>,
}

impl PortData {
    /// Create a port over an existing file descriptor.
    #[must_use]
    pub fn from_fd(name: &str, fd: i32, flags: PortFlags) -> Self {
        Self {
            name: name.to_string(),
            line: 1,
            flags: flags | PortFlags::OPEN,
            backend: Backend::Fd {
                fd,
                buf: Box::new([0; FD_BUFFER_SIZE]),
                buf_pos: 0,
                buf_len: 0,
                at_eof: false,
            },
            pushback: None,
        }
    }

    /// Create an input port reading from an in-memory string.
    #[must_use]
    pub fn string_input(name: &str, contents: &str) -> Self {
        Self {
            name: name.to_string(),
            line: 1,
            flags: PortFlags::OPEN | PortFlags::INPUT | PortFlags::SOURCE,
            backend: Backend::Bytes {
                data: contents.as_bytes().to_vec(),
                pos: 0,
            },
            pushback: None,
        }
    }

    /// Create an input port reading from raw bytes.
    #[must_use]
    pub fn bytes_input(name: &str, contents: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            line: 1,
            flags: PortFlags::OPEN | PortFlags::INPUT | PortFlags::BINARY,
            backend: Backend::Bytes {
                data: contents,
                pos: 0,
            },
            pushback: None,
        }
    }

    /// Create an output port accumulating into memory.
    #[must_use]
    pub fn string_output(name: &str) -> Self {
        Self {
            name: name.to_string(),
            line: 1,
            flags: PortFlags::OPEN | PortFlags::OUTPUT,
            backend: Backend::Sink { data: Vec::new() },
            pushback: None,
        }
    }

    /// Create a port over embedder callbacks.
    #[must_use]
    pub fn custom(name: &str, cookie: Box<dyn PortCookie>, flags: PortFlags) -> Self {
        Self {
            name: name.to_string(),
            line: 1,
            flags: flags | PortFlags::OPEN,
            backend: Backend::Custom {
                cookie,
                buf: Vec::new(),
                buf_pos: 0,
                at_eof: false,
            },
            pushback: None,
        }
    }

    /// Whether the port is open.
    #[inline]
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.flags.contains(PortFlags::OPEN)
    }

    /// Whether the port permits reads.
    #[inline]
    #[must_use]
    pub const fn is_input(&self) -> bool {
        self.flags.contains(PortFlags::INPUT)
    }

    /// Whether the port permits writes.
    #[inline]
    #[must_use]
    pub const fn is_output(&self) -> bool {
        self.flags.contains(PortFlags::OUTPUT)
    }

    /// Whether reads through this port fold symbol case.
    #[inline]
    #[must_use]
    pub const fn fold_case(&self) -> bool {
        self.flags.contains(PortFlags::FOLD_CASE)
    }

    /// Close the port, releasing the backing resource.
    pub fn close(&mut self) {
        match &mut self.backend {
            Backend::Fd { fd, .. } => {
                if self.flags.contains(PortFlags::OWNED) {
                    // SAFETY: fd was handed to this port together with
                    // ownership; double close is prevented by the
                    // Closed transition below.
                    unsafe {
                        libc::close(*fd);
                    }
                }
            }
            Backend::Custom { cookie, .. } => cookie.close(),
            _ => {}
        }
        self.backend = Backend::Closed;
        self.flags.remove(PortFlags::OPEN);
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Fails when closed, on direction mismatch, when the descriptor
    /// would block, or on an OS error. `Ok(None)` is end of input.
    pub fn read_byte(&mut self) -> Result<Option<u8>, PortError> {
        if !self.is_open() {
            return Err(PortError::Closed);
        }
        if !self.is_input() {
            return Err(PortError::WrongDirection);
        }
        match &mut self.backend {
            Backend::Bytes { data, pos } => {
                if *pos >= data.len() {
                    Ok(None)
                } else {
                    let b = data[*pos];
                    *pos += 1;
                    Ok(Some(b))
                }
            }
            Backend::Fd {
                fd,
                buf,
                buf_pos,
                buf_len,
                at_eof,
            } => {
                if *buf_pos >= *buf_len {
                    if *at_eof {
                        return Ok(None);
                    }
                    // SAFETY: buf is a valid writable region of
                    // FD_BUFFER_SIZE bytes owned by this port.
                    let n = unsafe {
                        libc::read(*fd, buf.as_mut_ptr().cast(), FD_BUFFER_SIZE)
                    };
                    if n < 0 {
                        let errno = std::io::Error::last_os_error()
                            .raw_os_error()
                            .unwrap_or(0);
                        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                            return Err(PortError::WouldBlock {
                                fd: *fd,
                                write: false,
                            });
                        }
                        return Err(PortError::Io { errno });
                    }
                    if n == 0 {
                        *at_eof = true;
                        return Ok(None);
                    }
                    *buf_pos = 0;
                    *buf_len = n as usize;
                }
                let b = buf[*buf_pos];
                *buf_pos += 1;
                Ok(Some(b))
            }
            Backend::Custom {
                cookie,
                buf,
                buf_pos,
                at_eof,
            } => {
                if *buf_pos >= buf.len() {
                    if *at_eof {
                        return Ok(None);
                    }
                    let mut chunk = [0u8; 256];
                    match cookie.read(&mut chunk) {
                        Ok(0) => {
                            *at_eof = true;
                            return Ok(None);
                        }
                        Ok(n) => {
                            buf.clear();
                            buf.extend_from_slice(&chunk[..n]);
                            *buf_pos = 0;
                        }
                        Err(e) => {
                            return Err(PortError::Io {
                                errno: e.raw_os_error().unwrap_or(0),
                            });
                        }
                    }
                }
                let b = buf[*buf_pos];
                *buf_pos += 1;
                Ok(Some(b))
            }
            Backend::Sink { .. } => Err(PortError::WrongDirection),
            Backend::Closed => Err(PortError::Closed),
        }
    }

    /// Read one character, decoding UTF-8 incrementally.
    ///
    /// # Errors
    ///
    /// Same conditions as [`PortData::read_byte`], plus
    /// [`PortError::InvalidUtf8`]. `Ok(None)` is end of input.
    pub fn read_char(&mut self) -> Result<Option<char>, PortError> {
        if let Some(c) = self.pushback.take() {
            if c == '\n' && self.flags.contains(PortFlags::SOURCE) {
                self.line += 1;
            }
            return Ok(Some(c));
        }
        let Some(first) = self.read_byte()? else {
            return Ok(None);
        };
        let len = utf8_len(first).ok_or(PortError::InvalidUtf8)?;
        let mut encoded = [first, 0, 0, 0];
        for slot in encoded.iter_mut().take(len).skip(1) {
            *slot = self.read_byte()?.ok_or(PortError::InvalidUtf8)?;
        }
        let c = core::str::from_utf8(&encoded[..len])
            .map_err(|_| PortError::InvalidUtf8)?
            .chars()
            .next()
            .ok_or(PortError::InvalidUtf8)?;
        if c == '\n' && self.flags.contains(PortFlags::SOURCE) {
            self.line += 1;
        }
        Ok(Some(c))
    }

    /// Look at the next character without consuming it.
    ///
    /// # Errors
    ///
    /// Same conditions as [`PortData::read_char`].
    pub fn peek_char(&mut self) -> Result<Option<char>, PortError> {
        if let Some(c) = self.pushback {
            return Ok(Some(c));
        }
        // Peeking must not advance the line counter twice.
        let line = self.line;
        let c = self.read_char()?;
        self.line = line;
        if let Some(c) = c {
            self.pushback = Some(c);
        }
        Ok(c)
    }

    /// Push one character back onto the input.
    ///
    /// Only one character of pushback is supported; pushing while a
    /// character is already pending replaces it.
    pub fn push_char(&mut self, c: char) {
        debug_assert!(self.pushback.is_none(), "double pushback");
        if c == '\n' && self.flags.contains(PortFlags::SOURCE) {
            self.line = self.line.saturating_sub(1);
        }
        self.pushback = Some(c);
    }

    /// Whether the port is exhausted.
    #[must_use]
    pub fn at_eof(&self) -> bool {
        if self.pushback.is_some() {
            return false;
        }
        match &self.backend {
            Backend::Bytes { data, pos } => *pos >= data.len(),
            Backend::Fd {
                at_eof,
                buf_pos,
                buf_len,
                ..
            } => *at_eof && buf_pos >= buf_len,
            Backend::Custom {
                at_eof,
                buf,
                buf_pos,
                ..
            } => *at_eof && *buf_pos >= buf.len(),
            Backend::Sink { .. } | Backend::Closed => true,
        }
    }

    /// Write raw bytes.
    ///
    /// # Errors
    ///
    /// Fails when closed, on direction mismatch, when the descriptor
    /// would block, or on an OS error.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        if !self.is_open() {
            return Err(PortError::Closed);
        }
        if !self.is_output() {
            return Err(PortError::WrongDirection);
        }
        match &mut self.backend {
            Backend::Sink { data } => {
                data.extend_from_slice(bytes);
                Ok(())
            }
            Backend::Fd { fd, .. } => {
                let mut written = 0;
                while written < bytes.len() {
                    let remaining = &bytes[written..];
                    // SAFETY: remaining points into the caller's live
                    // slice for its full length.
                    let n = unsafe {
                        libc::write(*fd, remaining.as_ptr().cast(), remaining.len())
                    };
                    if n < 0 {
                        let errno = std::io::Error::last_os_error()
                            .raw_os_error()
                            .unwrap_or(0);
                        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                            return Err(PortError::WouldBlock {
                                fd: *fd,
                                write: true,
                            });
                        }
                        return Err(PortError::Io { errno });
                    }
                    written += n as usize;
                }
                Ok(())
            }
            Backend::Custom { cookie, .. } => {
                let mut written = 0;
                while written < bytes.len() {
                    match cookie.write(&bytes[written..]) {
                        Ok(0) => return Err(PortError::Io { errno: 0 }),
                        Ok(n) => written += n,
                        Err(e) => {
                            return Err(PortError::Io {
                                errno: e.raw_os_error().unwrap_or(0),
                            });
                        }
                    }
                }
                Ok(())
            }
            Backend::Bytes { .. } => Err(PortError::WrongDirection),
            Backend::Closed => Err(PortError::Closed),
        }
    }

    /// Write one character.
    ///
    /// # Errors
    ///
    /// Same conditions as [`PortData::write_bytes`].
    pub fn write_char(&mut self, c: char) -> Result<(), PortError> {
        let mut encoded = [0u8; 4];
        self.write_bytes(c.encode_utf8(&mut encoded).as_bytes())
    }

    /// Write a string.
    ///
    /// # Errors
    ///
    /// Same conditions as [`PortData::write_bytes`].
    pub fn write_str(&mut self, s: &str) -> Result<(), PortError> {
        self.write_bytes(s.as_bytes())
    }

    /// Flush buffered output.
    ///
    /// # Errors
    ///
    /// Fails when the cookie's flush fails.
    pub fn flush(&mut self) -> Result<(), PortError> {
        match &mut self.backend {
            Backend::Custom { cookie, .. } => cookie.flush().map_err(|e| PortError::Io {
                errno: e.raw_os_error().unwrap_or(0),
            }),
            _ => Ok(()),
        }
    }

    /// The accumulated output of a string output port.
    #[must_use]
    pub fn output(&self) -> Option<&[u8]> {
        match &self.backend {
            Backend::Sink { data } => Some(data),
            _ => None,
        }
    }

    /// The descriptor behind this port, for scheduler registration.
    #[must_use]
    pub const fn fd(&self) -> Option<i32> {
        match &self.backend {
            Backend::Fd { fd, .. } => Some(*fd),
            _ => None,
        }
    }
}

/// Encoded length of a UTF-8 sequence starting with `first`, or `None`
/// for a continuation or invalid byte.
const fn utf8_len(first: u8) -> Option<usize> {
    match first {
        0x00..=0x7f => Some(1),
        0xc0..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf7 => Some(4),
        _ => None,
    }
}
