//! Token definitions for the shading language.

use logos::Logos;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexicalError {
    #[error("invalid int literal: {0}")]
    InvalidIntLiteral(#[from] std::num::ParseIntError),
    #[error("invalid float literal: {0}")]
    InvalidFloatLiteral(#[from] std::num::ParseFloatError),
}

fn parse_int<'i>(lex: &mut logos::Lexer<'i, Token<'i>>, radix: u32) -> Result<i64, LexicalError> {
    let slice = lex.slice();
    let digits = if radix == 16 { &slice[2..] } else { slice };
    let digits = digits.replace('_', "");
    Ok(i64::from_str_radix(&digits, radix)?)
}

fn parse_float<'i>(lex: &mut logos::Lexer<'i, Token<'i>>) -> Result<f32, LexicalError> {
    let digits = lex.slice().replace('_', "");
    Ok(f32::from_str(&digits)?)
}

#[derive(Logos, Clone, Debug, PartialEq)]
pub enum Token<'input> {
    //------------------- Identifiers -------------------
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident(&'input str),

    //------------------- Keywords -------------------
    #[token("shader")]
    Shader,
    #[token("struct")]
    Struct,
    #[token("in")]
    In,
    #[token("out")]
    Out,
    #[token("make_closure")]
    MakeClosure,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,

    //------------------- Type keywords -------------------
    #[token("void")]
    Void,
    #[token("int")]
    Int,
    #[token("float")]
    Float,
    #[token("double")]
    Double,
    #[token("bool")]
    Bool,
    #[token("float3")]
    Float3,
    #[token("float4")]
    Float4,
    #[token("matrix")]
    Matrix,
    #[token("closure")]
    Closure,

    //------------------- Literals -------------------
    #[token("true", |_| true)]
    #[token("false", |_| false)]
    BoolLiteral(bool),

    #[regex(r"[0-9][0-9_]*", |lex| parse_int(lex, 10))]
    #[regex(r"0[xX][0-9A-Fa-f][0-9A-Fa-f_]*", |lex| parse_int(lex, 16))]
    IntLiteral(i64),

    #[regex(r"[0-9][0-9_]*[.]", parse_float)]
    #[regex(r"[0-9][0-9_]*(?:[eE][+-]?[0-9]+)", parse_float)]
    #[regex(r"[0-9][0-9_]*[.][0-9][0-9_]*(?:[eE][+-]?[0-9]+)?", parse_float)]
    FloatLiteral(f32),

    //------------------- Comments -------------------
    #[regex("//.*", logos::skip)]
    SingleLineComment,
    #[regex(r"/\*([^*]|\*[^/])+\*/", logos::skip)]
    BlockComment,

    //------------------- Operators -------------------
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token("+")]
    Plus,
    #[token("-")]
    Dash,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("!")]
    Bang,
    #[token("<")]
    LAngle,
    #[token(">")]
    RAngle,
    #[token("<=")]
    LEqual,
    #[token(">=")]
    REqual,
    #[token("==")]
    DEqual,
    #[token("!=")]
    BangEqual,
    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token("=")]
    Equal,

    //------------------- Whitespace -------------------
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Whitespace,

    //------------------- Other -------------------
    #[error]
    Error,
}

impl<'input> Token<'input> {
    /// Extract a string from the token if it represents an identifier.
    pub(crate) fn as_str(&self) -> &'input str {
        match self {
            Token::Ident(s) => s,
            _ => panic!("cannot convert {:?} into a string", self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        Token::lexer(source).collect()
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            lex("shader entry inner"),
            vec![Token::Shader, Token::Ident("entry"), Token::Ident("inner")]
        );
        // keywords embedded in identifiers stay identifiers
        assert_eq!(lex("inlet outer"), vec![Token::Ident("inlet"), Token::Ident("outer")]);
    }

    #[test]
    fn literals() {
        assert_eq!(
            lex("42 0x10 3.5 1e3 true"),
            vec![
                Token::IntLiteral(42),
                Token::IntLiteral(16),
                Token::FloatLiteral(3.5),
                Token::FloatLiteral(1000.0),
                Token::BoolLiteral(true),
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            lex("a // trailing\n/* block */ b"),
            vec![Token::Ident("a"), Token::Ident("b")]
        );
    }

    #[test]
    fn compound_operators() {
        assert_eq!(
            lex("<= >= == != && || ="),
            vec![
                Token::LEqual,
                Token::REqual,
                Token::DEqual,
                Token::BangEqual,
                Token::And,
                Token::Or,
                Token::Equal,
            ]
        );
    }
}
