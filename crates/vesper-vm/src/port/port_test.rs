// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the buffered port layer.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;

#[test]
fn string_input_reads_chars_and_tracks_lines() {
    let mut port = PortData::string_input("test", "abc\ndef");
    assert_eq!(port.line, 1);

    for expected in ['a', 'b', 'c'] {
        assert_eq!(port.read_char().unwrap(), Some(expected));
        assert_eq!(port.line, 1);
    }
    assert_eq!(port.read_char().unwrap(), Some('\n'));
    assert_eq!(port.line, 2);
    for expected in ['d', 'e', 'f'] {
        assert_eq!(port.read_char().unwrap(), Some(expected));
    }
    assert_eq!(port.read_char().unwrap(), None);
    assert!(port.at_eof());
}

#[test]
fn peek_does_not_consume_or_double_count_lines() {
    let mut port = PortData::string_input("test", "\nx");
    assert_eq!(port.peek_char().unwrap(), Some('\n'));
    assert_eq!(port.line, 1);
    assert_eq!(port.read_char().unwrap(), Some('\n'));
    assert_eq!(port.line, 2);
    assert_eq!(port.peek_char().unwrap(), Some('x'));
    assert_eq!(port.read_char().unwrap(), Some('x'));
    assert_eq!(port.read_char().unwrap(), None);
}

#[test]
fn pushback_is_one_char() {
    let mut port = PortData::string_input("test", "ab");
    assert_eq!(port.read_char().unwrap(), Some('a'));
    port.push_char('a');
    assert!(!port.at_eof());
    assert_eq!(port.read_char().unwrap(), Some('a'));
    assert_eq!(port.read_char().unwrap(), Some('b'));
}

#[test]
fn utf8_decoding_across_byte_lengths() {
    let mut port = PortData::string_input("test", "aé€\u{1F600}");
    assert_eq!(port.read_char().unwrap(), Some('a'));
    assert_eq!(port.read_char().unwrap(), Some('é'));
    assert_eq!(port.read_char().unwrap(), Some('€'));
    assert_eq!(port.read_char().unwrap(), Some('\u{1F600}'));
    assert_eq!(port.read_char().unwrap(), None);
}

#[test]
fn string_output_accumulates() {
    let mut port = PortData::string_output("out");
    port.write_char('h').unwrap();
    port.write_str("ello").unwrap();
    port.write_bytes(b"!").unwrap();
    assert_eq!(port.output().unwrap(), b"hello!");
}

#[test]
fn direction_is_enforced() {
    let mut input = PortData::string_input("in", "x");
    assert_eq!(input.write_str("no"), Err(PortError::WrongDirection));

    let mut output = PortData::string_output("out");
    assert_eq!(output.read_char(), Err(PortError::WrongDirection));
}

#[test]
fn closed_port_rejects_operations() {
    let mut port = PortData::string_input("in", "x");
    port.close();
    assert!(!port.is_open());
    assert_eq!(port.read_char(), Err(PortError::Closed));
}

#[test]
fn binary_bytes_port() {
    let mut port = PortData::bytes_input("bin", vec![0, 255, 128]);
    assert_eq!(port.read_byte().unwrap(), Some(0));
    assert_eq!(port.read_byte().unwrap(), Some(255));
    assert_eq!(port.read_byte().unwrap(), Some(128));
    assert_eq!(port.read_byte().unwrap(), None);
}

#[test]
fn fd_port_reads_from_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "hi").unwrap();
    let path = file.path().to_str().unwrap().to_string();
    let cpath = std::ffi::CString::new(path).unwrap();
    // SAFETY: cpath is a valid NUL-terminated string.
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
    assert!(fd >= 0);

    let mut port = PortData::from_fd("tempfile", fd, PortFlags::INPUT | PortFlags::OWNED);
    assert_eq!(port.read_char().unwrap(), Some('h'));
    assert_eq!(port.read_char().unwrap(), Some('i'));
    assert_eq!(port.read_char().unwrap(), None);
    port.close();
}

struct CountingCookie {
    reads: usize,
}

impl PortCookie for CountingCookie {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.reads > 0 {
            return Ok(0);
        }
        self.reads += 1;
        buf[..3].copy_from_slice(b"abc");
        Ok(3)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

#[test]
fn custom_cookie_port() {
    let cookie = Box::new(CountingCookie { reads: 0 });
    let mut port = PortData::custom("cookie", cookie, PortFlags::INPUT);
    assert_eq!(port.read_char().unwrap(), Some('a'));
    assert_eq!(port.read_char().unwrap(), Some('b'));
    assert_eq!(port.read_char().unwrap(), Some('c'));
    assert_eq!(port.read_char().unwrap(), None);
}
