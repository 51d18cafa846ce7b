//! RESP2/RESP3 wire codec: the [`Value`] sum type, the incremental
//! [`Decoder`], and the chunking [`Encoder`].

pub mod decoder;
pub mod encoder;
pub mod value;

pub use decoder::Decoder;
pub use encoder::{ArgValue, Argument, Encoder, TextEncoding};
pub use value::{Attributes, Value, ValueData};
