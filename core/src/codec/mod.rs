pub mod line;
pub mod stream;

pub use line::{decode_line, try_decode_line, DecodeError};
pub use stream::{decode_stream, encode_message, StreamDecoder};
