// ABOUTME: Transform expression sub-language: lexer, parser, evaluator
// ABOUTME: Plus the {{ ... }} template expander used for step definitions

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod template;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use eval::{evaluate, truthy, Evaluator};
pub use parser::parse;
pub use template::{expand_string, expand_value, render};

use thiserror::Error;

/// Errors raised while parsing or evaluating an expression. The engine maps
/// these onto its own taxonomy depending on the context (condition, computed
/// field, items expression).
#[derive(Debug, Clone, Error)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("evaluation error: {0}")]
    Eval(String),
}

pub type ExprResult<T> = std::result::Result<T, ExprError>;
