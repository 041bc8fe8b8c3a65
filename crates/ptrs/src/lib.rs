#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked or intended")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts follow the language's C-style numerics")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior follows the language's C-style numerics")]

mod ast;
mod call;
mod error;
mod exprs;
mod ffi;
mod heap;
mod intern;
mod ops;
mod parse;
mod prepare;
mod run;
mod scope;
mod statements;
mod structs;
mod value;

pub use crate::{
    error::{ErrorKind, Exception},
    run::{raise_signal, Engine, Value},
};
