// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Reader for Vesper source text.
//!
//! Converts a character stream into runtime values: recursive descent
//! with one-character lookahead over a port. Datum labels (`#N=`,
//! `#N#`) are resolved by a final fix-up pass that patches
//! `ReaderLabel` placeholders, so forward references and cycles work.

#[cfg(test)]
mod lexer_test;
#[cfg(test)]
mod parser_test;

mod lexer;
mod parser;

pub use lexer::{Lexer, ReadError, Token};
pub use parser::{Parser, read, read_str};
