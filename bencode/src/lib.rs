mod decode;
pub use decode::{decode, decode_value, Context, Dict, Error, FromValue, Result, Value, ValueData};

mod encode;
pub use encode::{encode, encode_fn, encode_fn_with, encode_with, Encode, Encoder, EncoderConfig};
