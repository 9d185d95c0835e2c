// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the lexer.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::lexer::{Lexer, ReadError, Token};
use crate::heap::HeapConfig;
use crate::port::PortData;
use crate::realm::Realm;

fn setup() -> Realm {
    Realm::new(HeapConfig {
        chunk_slots: 1024,
        initial_chunks: 1,
        max_slots: 1 << 18,
    })
}

/// Tokenize an entire string.
fn tokenize(input: &str) -> Result<Vec<Token>, ReadError> {
    let mut realm = setup();
    let ctx = realm.root_ctx();
    let port = realm
        .make_port(ctx, PortData::string_input("test", input))
        .unwrap();
    let mut lexer = Lexer::new(port);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token(&mut realm)?;
        if token == Token::Eof {
            return Ok(tokens);
        }
        tokens.push(token);
    }
}

#[test]
fn punctuation() {
    assert_eq!(
        tokenize("()").unwrap(),
        vec![Token::LParen, Token::RParen]
    );
    assert_eq!(
        tokenize("#( #u8(").unwrap(),
        vec![Token::VecOpen, Token::ByteVecOpen]
    );
}

#[test]
fn quote_family() {
    assert_eq!(
        tokenize("' ` , ,@ #' #` #, #,@").unwrap(),
        vec![
            Token::Quote,
            Token::Quasiquote,
            Token::Unquote,
            Token::UnquoteSplicing,
            Token::Syntax,
            Token::Quasisyntax,
            Token::Unsyntax,
            Token::UnsyntaxSplicing,
        ]
    );
}

#[test]
fn booleans() {
    assert_eq!(
        tokenize("#t #f #true #false").unwrap(),
        vec![
            Token::Bool(true),
            Token::Bool(false),
            Token::Bool(true),
            Token::Bool(false),
        ]
    );
}

#[test]
fn integers_and_radix_prefixes() {
    assert_eq!(tokenize("42").unwrap(), vec![Token::Fixnum(42)]);
    assert_eq!(tokenize("-17").unwrap(), vec![Token::Fixnum(-17)]);
    assert_eq!(tokenize("#x10").unwrap(), vec![Token::Fixnum(16)]);
    assert_eq!(tokenize("#b101").unwrap(), vec![Token::Fixnum(5)]);
    assert_eq!(tokenize("#o17").unwrap(), vec![Token::Fixnum(15)]);
    assert_eq!(tokenize("#d99").unwrap(), vec![Token::Fixnum(99)]);
    assert_eq!(tokenize("#x-ff").unwrap(), vec![Token::Fixnum(-255)]);
}

#[test]
fn exactness_prefixes() {
    assert_eq!(tokenize("#e42").unwrap(), vec![Token::Fixnum(42)]);
    assert_eq!(tokenize("#i42").unwrap(), vec![Token::Flonum(42.0)]);
    assert_eq!(tokenize("#e1.0").unwrap(), vec![Token::Fixnum(1)]);
    assert_eq!(tokenize("#e#x10").unwrap(), vec![Token::Fixnum(16)]);
}

#[test]
fn decimals_and_rationals() {
    assert_eq!(tokenize("3.5").unwrap(), vec![Token::Flonum(3.5)]);
    assert_eq!(tokenize("1e3").unwrap(), vec![Token::Flonum(1000.0)]);
    assert_eq!(tokenize("6/3").unwrap(), vec![Token::Fixnum(2)]);
    assert_eq!(tokenize("1/2").unwrap(), vec![Token::Flonum(0.5)]);
    assert_eq!(tokenize("+inf.0").unwrap(), vec![Token::Flonum(f64::INFINITY)]);
}

#[test]
fn complex_literals_are_unsupported() {
    assert!(matches!(
        tokenize("1+2i"),
        Err(ReadError::UnsupportedNumber(_))
    ));
}

#[test]
fn characters() {
    assert_eq!(tokenize("#\\a").unwrap(), vec![Token::Char('a')]);
    assert_eq!(tokenize("#\\space").unwrap(), vec![Token::Char(' ')]);
    assert_eq!(tokenize("#\\newline").unwrap(), vec![Token::Char('\n')]);
    assert_eq!(tokenize("#\\tab").unwrap(), vec![Token::Char('\t')]);
    assert_eq!(tokenize("#\\x41").unwrap(), vec![Token::Char('A')]);
    assert_eq!(tokenize("#\\(").unwrap(), vec![Token::Char('(')]);
    assert!(matches!(
        tokenize("#\\bogus"),
        Err(ReadError::BadCharName(_))
    ));
}

#[test]
fn strings_with_escapes() {
    assert_eq!(
        tokenize("\"a\\nb\"").unwrap(),
        vec![Token::String("a\nb".to_string())]
    );
    assert_eq!(
        tokenize("\"\\x41;\"").unwrap(),
        vec![Token::String("A".to_string())]
    );
    assert_eq!(
        tokenize("\"a\\\n   b\"").unwrap(),
        vec![Token::String("ab".to_string())]
    );
    assert!(matches!(
        tokenize("\"open"),
        Err(ReadError::UnexpectedEof)
    ));
}

#[test]
fn symbols() {
    assert_eq!(
        tokenize("foo set! <=?").unwrap(),
        vec![
            Token::Symbol("foo".to_string()),
            Token::Symbol("set!".to_string()),
            Token::Symbol("<=?".to_string()),
        ]
    );
    assert_eq!(
        tokenize("+ - ...").unwrap(),
        vec![
            Token::Symbol("+".to_string()),
            Token::Symbol("-".to_string()),
            Token::Symbol("...".to_string()),
        ]
    );
    assert_eq!(
        tokenize("|two words|").unwrap(),
        vec![Token::Symbol("two words".to_string())]
    );
}

#[test]
fn comments_are_atmosphere() {
    assert_eq!(
        tokenize("1 ; comment\n2").unwrap(),
        vec![Token::Fixnum(1), Token::Fixnum(2)]
    );
    assert_eq!(
        tokenize("1 #| nested #| inner |# outer |# 2").unwrap(),
        vec![Token::Fixnum(1), Token::Fixnum(2)]
    );
    assert_eq!(
        tokenize("#;").unwrap(),
        vec![Token::DatumComment]
    );
}

#[test]
fn datum_labels() {
    assert_eq!(
        tokenize("#1= #1# #42=").unwrap(),
        vec![Token::LabelDef(1), Token::LabelRef(1), Token::LabelDef(42)]
    );
}

#[test]
fn fold_case_directive() {
    let mut realm = setup();
    let ctx = realm.root_ctx();
    let port = realm
        .make_port(ctx, PortData::string_input("test", "ABC #!fold-case DEF #!no-fold-case GHI"))
        .unwrap();
    let mut lexer = Lexer::new(port);
    assert_eq!(
        lexer.next_token(&mut realm).unwrap(),
        Token::Symbol("ABC".to_string())
    );
    assert_eq!(
        lexer.next_token(&mut realm).unwrap(),
        Token::Symbol("def".to_string())
    );
    assert_eq!(
        lexer.next_token(&mut realm).unwrap(),
        Token::Symbol("GHI".to_string())
    );
}

#[test]
fn dot_token() {
    assert_eq!(
        tokenize("(a . b)").unwrap(),
        vec![
            Token::LParen,
            Token::Symbol("a".to_string()),
            Token::Dot,
            Token::Symbol("b".to_string()),
            Token::RParen,
        ]
    );
}
