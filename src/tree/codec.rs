use crate::types::{RecordId, Result, TesseraError, RECORD_ID_LEN};

/// Trait implemented by key types that can be stored in a persistent tree.
pub trait KeyCodec: Sized + Clone + 'static {
    /// Name recorded in the tree metadata so reopening with another key type fails.
    const CODEC_ID: &'static str;

    /// Encode `key` into `out`.
    fn encode_key(key: &Self, out: &mut Vec<u8>);

    /// Decode a key from its encoded representation.
    fn decode_key(bytes: &[u8]) -> Result<Self>;
}

/// Trait implemented by value types that can be stored in a persistent tree.
pub trait ValCodec: Sized + Clone + 'static {
    /// Name recorded in the tree metadata so reopening with another value type fails.
    const CODEC_ID: &'static str;

    /// Encode `value` into `out`.
    fn encode_val(value: &Self, out: &mut Vec<u8>);

    /// Decode a value from `src`.
    fn decode_val(src: &[u8]) -> Result<Self>;
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        TesseraError::Serialization(format!("{what} needs {N} bytes, got {}", bytes.len()))
    })
}

macro_rules! int_codec {
    ($ty:ty, $id:literal) => {
        impl KeyCodec for $ty {
            const CODEC_ID: &'static str = $id;

            fn encode_key(key: &Self, out: &mut Vec<u8>) {
                out.extend_from_slice(&key.to_be_bytes());
            }

            fn decode_key(bytes: &[u8]) -> Result<Self> {
                Ok(<$ty>::from_be_bytes(fixed(bytes, $id)?))
            }
        }

        impl ValCodec for $ty {
            const CODEC_ID: &'static str = $id;

            fn encode_val(value: &Self, out: &mut Vec<u8>) {
                out.extend_from_slice(&value.to_be_bytes());
            }

            fn decode_val(src: &[u8]) -> Result<Self> {
                Ok(<$ty>::from_be_bytes(fixed(src, $id)?))
            }
        }
    };
}

int_codec!(u64, "u64");
int_codec!(i64, "i64");
int_codec!(u32, "u32");
int_codec!(i32, "i32");

impl KeyCodec for String {
    const CODEC_ID: &'static str = "string";

    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(key.as_bytes());
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|err| TesseraError::Serialization(format!("string key: {err}")))
    }
}

impl ValCodec for String {
    const CODEC_ID: &'static str = "string";

    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value.as_bytes());
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        String::from_utf8(src.to_vec())
            .map_err(|err| TesseraError::Serialization(format!("string value: {err}")))
    }
}

impl KeyCodec for Vec<u8> {
    const CODEC_ID: &'static str = "bytes";

    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl ValCodec for Vec<u8> {
    const CODEC_ID: &'static str = "bytes";

    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        Ok(src.to_vec())
    }
}

impl KeyCodec for RecordId {
    const CODEC_ID: &'static str = "rid";

    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        key.encode(out);
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        RecordId::decode(bytes)
    }
}

impl ValCodec for RecordId {
    const CODEC_ID: &'static str = "rid";

    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        value.encode(out);
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        if src.len() != RECORD_ID_LEN {
            return Err(TesseraError::Serialization(format!(
                "record id value needs {RECORD_ID_LEN} bytes, got {}",
                src.len()
            )));
        }
        RecordId::decode(src)
    }
}

/// Placeholder value for set-like trees.
impl ValCodec for () {
    const CODEC_ID: &'static str = "unit";

    fn encode_val(_value: &Self, _out: &mut Vec<u8>) {}

    fn decode_val(src: &[u8]) -> Result<Self> {
        if !src.is_empty() {
            return Err(TesseraError::Serialization(
                "unit value must be empty".to_string(),
            ));
        }
        Ok(())
    }
}
