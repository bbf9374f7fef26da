#![doc = include_str!("../README.md")]

mod error;
mod value;

pub mod ccsds;
pub mod cmd;
pub mod evr;
pub mod expr;
pub mod field;
pub mod packet;
pub mod schema;
pub mod table;
pub mod types;

pub use error::{Error, Result};
pub use value::Value;
