//! Encoding and decoding of MongoDB wire protocol messages.

pub mod header;
pub mod legacy;
pub mod message;
mod util;

pub use self::{
    header::{MessageHeader, OpCode},
    message::{Message, MessageFlags, MessageSection},
};
