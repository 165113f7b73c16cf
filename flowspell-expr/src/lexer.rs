// ABOUTME: Tokenizer for the transform expression sub-language

use crate::{ExprError, ExprResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Question,
    Colon,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Arrow,
}

pub fn tokenize(src: &str) -> ExprResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '0'..='9' => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                // A '.' is part of the number only when followed by a digit,
                // so `3.toFixed` style member access still lexes.
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let value = text
                        .parse::<f64>()
                        .map_err(|e| ExprError::Parse(format!("bad number '{text}': {e}")))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|e| ExprError::Parse(format!("bad number '{text}': {e}")))?;
                    tokens.push(Token::Int(value));
                }
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut text = String::new();
                let mut closed = false;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch == '\\' && i + 1 < chars.len() {
                        let next = chars[i + 1];
                        text.push(match next {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => other,
                        });
                        i += 2;
                    } else if ch == quote {
                        closed = true;
                        i += 1;
                        break;
                    } else {
                        text.push(ch);
                        i += 1;
                    }
                }
                if !closed {
                    return Err(ExprError::Parse("unterminated string literal".into()));
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "undefined" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    if chars.get(i + 2) == Some(&'=') {
                        tokens.push(Token::StrictEq);
                        i += 3;
                    } else {
                        tokens.push(Token::EqEq);
                        i += 2;
                    }
                } else if chars.get(i + 1) == Some(&'>') {
                    tokens.push(Token::Arrow);
                    i += 2;
                } else {
                    return Err(ExprError::Parse("unexpected '='".into()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    if chars.get(i + 2) == Some(&'=') {
                        tokens.push(Token::StrictNotEq);
                        i += 3;
                    } else {
                        tokens.push(Token::NotEq);
                        i += 2;
                    }
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(ExprError::Parse("unexpected '&'".into()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(ExprError::Parse("unexpected '|'".into()));
                }
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            other => {
                return Err(ExprError::Parse(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}
