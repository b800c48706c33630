pub mod frame;

pub use frame::{
    encode_array, encode_bulk, encode_error, encode_integer, encode_null, encode_simple, parse,
    read_bulk_bytes, read_line, ProtocolError,
};
