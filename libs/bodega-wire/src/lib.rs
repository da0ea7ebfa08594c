//! Schema-less codec for the seat service's binary protocol. The upstream
//! publishes no schema, so decoding works from wire tags alone and field
//! numbers are part of each caller's contract.

pub mod decode;
pub mod encode;
mod varint;

pub use decode::{Message, Value};
