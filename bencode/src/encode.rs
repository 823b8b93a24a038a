#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Emit dictionary entries in lexicographic key order regardless of
    /// insertion order. Required for a stable info-hash.
    pub sort_dict: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self { sort_dict: true }
    }
}

#[derive(Debug)]
pub struct Encoder<'a> {
    config: &'a EncoderConfig,
    buf: &'a mut Vec<u8>,
}

pub struct ListEncoder<'e, 'a> {
    encoder: &'e mut Encoder<'a>,
}

impl<'e, 'a> Drop for ListEncoder<'e, 'a> {
    fn drop(&mut self) {
        self.encoder.buf.push(b'e');
    }
}

impl<'e, 'a> ListEncoder<'e, 'a> {
    pub fn push<T: Encode>(&mut self, value: T) {
        value.encode(self.encoder);
    }

    pub fn push_with_encoder(&mut self, f: impl FnOnce(&mut Encoder)) {
        f(self.encoder);
    }
}

pub struct DictEncoder<'e, 'a> {
    encoder: &'e mut Encoder<'a>,
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl<'e, 'a> Drop for DictEncoder<'e, 'a> {
    fn drop(&mut self) {
        self.pairs.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for pair in &self.pairs {
            self.encoder.bytes(&pair.0);
            self.encoder.buf.extend_from_slice(&pair.1);
        }
        self.encoder.buf.push(b'e');
    }
}

impl<'e, 'a> DictEncoder<'e, 'a> {
    pub fn push<T: Encode>(&mut self, key: impl AsRef<[u8]>, value: T) {
        if self.encoder.config.sort_dict {
            let key = key.as_ref().to_vec();
            let value = encode_with(self.encoder.config, value);
            self.pairs.push((key, value));
        } else {
            self.encoder.bytes(key.as_ref());
            value.encode(self.encoder);
        }
    }

    pub fn push_with_encoder(&mut self, key: impl AsRef<[u8]>, f: impl FnOnce(&mut Encoder)) {
        if self.encoder.config.sort_dict {
            let key = key.as_ref().to_vec();
            let mut buf = Vec::new();
            {
                let mut encoder = Encoder {
                    config: self.encoder.config,
                    buf: &mut buf,
                };
                f(&mut encoder);
            }
            self.pairs.push((key, buf));
        } else {
            self.encoder.bytes(key.as_ref());
            f(self.encoder);
        }
    }
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut Vec<u8>, config: &'a EncoderConfig) -> Self {
        Self { buf, config }
    }

    pub fn integer(&mut self, value: i64) {
        self.buf.push(b'i');
        self.buf.extend_from_slice(value.to_string().as_bytes());
        self.buf.push(b'e');
    }

    /// Byte string. Native strings go through here as their UTF-8 bytes.
    pub fn bytes(&mut self, value: &[u8]) {
        self.buf
            .extend_from_slice(value.len().to_string().as_bytes());
        self.buf.push(b':');
        self.buf.extend_from_slice(value);
    }

    pub fn list<'e>(&'e mut self) -> ListEncoder<'e, 'a> {
        self.buf.push(b'l');
        ListEncoder { encoder: self }
    }

    pub fn dict<'e>(&'e mut self) -> DictEncoder<'e, 'a> {
        self.buf.push(b'd');
        DictEncoder {
            encoder: self,
            pairs: Default::default(),
        }
    }
}

pub trait Encode {
    fn encode(&self, encoder: &mut Encoder);
}

pub fn encode_with<T: Encode>(config: &EncoderConfig, value: T) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = Encoder {
            config,
            buf: &mut buf,
        };
        value.encode(&mut encoder);
    }
    buf
}

pub fn encode<T: Encode>(value: T) -> Vec<u8> {
    encode_with(&EncoderConfig::default(), value)
}

/// Encode a value built imperatively against the encoder. The usual way
/// to produce one-off dictionaries such as tracker responses.
pub fn encode_fn_with(config: &EncoderConfig, f: impl FnOnce(&mut Encoder)) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = Encoder {
            config,
            buf: &mut buf,
        };
        f(&mut encoder);
    }
    buf
}

pub fn encode_fn(f: impl FnOnce(&mut Encoder)) -> Vec<u8> {
    encode_fn_with(&EncoderConfig::default(), f)
}

macro_rules! impl_encode_for_integer {
    ($t:ty) => {
        impl Encode for $t {
            fn encode(&self, encoder: &mut Encoder) {
                encoder.integer(*self as i64);
            }
        }
    };
}
impl_encode_for_integer!(i8);
impl_encode_for_integer!(i16);
impl_encode_for_integer!(i32);
impl_encode_for_integer!(i64);
impl_encode_for_integer!(u8);
impl_encode_for_integer!(u16);
impl_encode_for_integer!(u32);

impl Encode for u64 {
    fn encode(&self, encoder: &mut Encoder) {
        // preserve values above i64::MAX textually
        encoder.buf.push(b'i');
        encoder.buf.extend_from_slice(self.to_string().as_bytes());
        encoder.buf.push(b'e');
    }
}

impl Encode for &str {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.bytes(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.bytes(self.as_bytes());
    }
}

impl<T: Encode> Encode for &T {
    fn encode(&self, encoder: &mut Encoder) {
        (*self).encode(encoder);
    }
}

impl<T: Encode> Encode for &[T] {
    fn encode(&self, encoder: &mut Encoder) {
        let mut list = encoder.list();
        for value in *self {
            list.push(value);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, encoder: &mut Encoder) {
        let mut list = encoder.list();
        for value in self {
            list.push(value);
        }
    }
}

impl<K: AsRef<[u8]>, V: Encode> Encode for std::collections::BTreeMap<K, V> {
    fn encode(&self, encoder: &mut Encoder) {
        let mut dict = encoder.dict();
        for (key, value) in self {
            dict.push(key, value);
        }
    }
}

impl<K: AsRef<[u8]>, V: Encode> Encode for std::collections::HashMap<K, V> {
    fn encode(&self, encoder: &mut Encoder) {
        let mut dict = encoder.dict();
        for (key, value) in self {
            dict.push(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers() {
        assert_eq!(encode(0i64), b"i0e");
        assert_eq!(encode(42i64), b"i42e");
        assert_eq!(encode(-42i64), b"i-42e");
        assert_eq!(encode(i64::MAX), b"i9223372036854775807e");
        assert_eq!(encode(u64::MAX), b"i18446744073709551615e");
    }

    #[test]
    fn strings() {
        assert_eq!(encode(""), b"0:");
        assert_eq!(encode("spam"), b"4:spam");
        assert_eq!(encode("hello:world"), b"11:hello:world");
    }

    #[test]
    fn raw_byte_strings() {
        let buf = encode_fn(|e| e.bytes(&[0u8, 1, 0xff]));
        assert_eq!(buf, [b'3', b':', 0, 1, 0xff]);
    }

    #[test]
    fn lists() {
        assert_eq!(encode(Vec::<i64>::new()), b"le");
        assert_eq!(encode(vec![1i64, 2, 3]), b"li1ei2ei3ee");
        assert_eq!(encode(vec!["spam", "eggs"]), b"l4:spam4:eggse");
    }

    #[test]
    fn dicts_sort_keys() {
        let buf = encode_fn(|e| {
            let mut dict = e.dict();
            dict.push(b"z", 1i64);
            dict.push(b"a", 2i64);
            dict.push(b"m", 3i64);
        });
        assert_eq!(buf, b"d1:ai2e1:mi3e1:zi1ee");
    }

    #[test]
    fn dicts_unsorted_preserve_order() {
        let config = EncoderConfig { sort_dict: false };
        let buf = encode_fn_with(&config, |e| {
            let mut dict = e.dict();
            dict.push(b"z", 1i64);
            dict.push(b"a", 2i64);
        });
        assert_eq!(buf, b"d1:zi1e1:ai2ee");
    }

    #[test]
    fn nested_structures() {
        let buf = encode_fn(|e| {
            let mut dict = e.dict();
            dict.push_with_encoder(b"list", |e| {
                let mut list = e.list();
                list.push(1i64);
                list.push_with_encoder(|e| {
                    let mut inner = e.list();
                    inner.push(2i64);
                    inner.push(3i64);
                });
            });
            dict.push_with_encoder(b"dict", |e| {
                let mut inner = e.dict();
                inner.push(b"x", "y");
            });
        });
        assert_eq!(buf, b"d4:dictd1:x1:ye4:listli1eli2ei3eeee");
    }

    #[test]
    fn custom_encode_implementation() {
        struct Swarm {
            complete: u32,
            incomplete: u32,
        }

        impl Encode for Swarm {
            fn encode(&self, encoder: &mut Encoder) {
                let mut dict = encoder.dict();
                dict.push(b"complete", self.complete);
                dict.push(b"incomplete", self.incomplete);
            }
        }

        let swarm = Swarm {
            complete: 3,
            incomplete: 7,
        };
        assert_eq!(encode(swarm), b"d8:completei3e10:incompletei7ee");
    }

    #[test]
    fn round_trip_through_decoder() {
        let buf = encode_fn(|e| {
            let mut dict = e.dict();
            dict.push(b"interval", 900u32);
            dict.push(b"name", "swarm");
            dict.push(b"sizes", vec![1i64, 2, 3]);
        });
        let value = crate::decode_value(&buf).unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.require::<u32>(b"interval").unwrap(), 900);
        assert_eq!(dict.require::<String>(b"name").unwrap(), "swarm");
        assert_eq!(dict.require::<Vec<i64>>(b"sizes").unwrap(), vec![1, 2, 3]);
    }
}
