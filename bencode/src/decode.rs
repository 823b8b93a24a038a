pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    MissingKey,
    Invalid,
    UnexpectedEof,
    Eof,
    Other,
}

pub struct Error {
    kind: ErrorKind,
    context: Vec<String>,
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Error");
        s.field("kind", &self.kind);
        if !self.context.is_empty() {
            s.field("context", &self.context);
        }
        s.finish()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ErrorKind::MissingKey => f.write_str("missing dictionary key")?,
            ErrorKind::Invalid => f.write_str("invalid bencode")?,
            ErrorKind::UnexpectedEof => f.write_str("unexpected end of input")?,
            ErrorKind::Eof => f.write_str("end of input")?,
            ErrorKind::Other => f.write_str("bencode error")?,
        }
        for line in self.context.iter().rev() {
            write!(f, ": {}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl Error {
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: Vec::new(),
        }
    }

    fn missing_key(key: &[u8]) -> Self {
        let mut err = Self::new(ErrorKind::MissingKey);
        err.push_context(format!("key '{}'", KeyDisplay(key)));
        err
    }

    pub fn message(msg: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Other);
        err.push_context(msg.into());
        err
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, ErrorKind::Eof | ErrorKind::UnexpectedEof)
    }

    fn push_context(&mut self, msg: String) {
        self.context.push(msg);
    }
}

pub trait Context<T> {
    fn context(self, context: &str) -> Result<T>;
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> Context<T> for Result<T> {
    fn context(mut self, context: &str) -> Result<T> {
        if let Err(ref mut error) = self {
            error.push_context(context.to_string());
        }
        self
    }

    fn with_context<F: FnOnce() -> String>(mut self, f: F) -> Result<T> {
        if let Err(ref mut error) = self {
            error.push_context(f());
        }
        self
    }
}

struct KeyDisplay<'a>(&'a [u8]);

impl<'a> std::fmt::Display for KeyDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(self.0) {
            Ok(str) => f.write_str(str),
            _ => write!(f, "{:02x?}", self.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenData<'a> {
    Integer(i64),
    ByteString(&'a [u8]),
    ListBegin,
    DictBegin,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token<'a> {
    offset: usize,
    length: usize,
    data: TokenData<'a>,
}

#[derive(Debug, Clone)]
struct Tokenizer<'a> {
    data: &'a [u8],
    offset: usize,
    ahead: Option<Token<'a>>,
}

impl<'a> Tokenizer<'a> {
    fn new(data: &'a [u8]) -> Tokenizer<'a> {
        Tokenizer {
            data,
            offset: 0,
            ahead: None,
        }
    }

    fn next(&mut self) -> Result<Token<'a>> {
        if let Some(token) = self.ahead.take() {
            return Ok(token);
        }

        match self.peek_one()? {
            b'i' => self.take_integer(),
            b'0'..=b'9' => self.take_string(),
            b'l' => Ok(self.take_marker(TokenData::ListBegin)),
            b'd' => Ok(self.take_marker(TokenData::DictBegin)),
            b'e' => Ok(self.take_marker(TokenData::End)),
            _ => Err(Error::new(ErrorKind::Invalid)),
        }
    }

    fn peek(&mut self) -> Result<Token<'a>> {
        if let Some(token) = self.ahead.clone() {
            Ok(token)
        } else {
            let token = self.next()?;
            self.ahead = Some(token.clone());
            Ok(token)
        }
    }

    fn take_marker(&mut self, data: TokenData<'a>) -> Token<'a> {
        let token = Token {
            offset: self.offset,
            length: 1,
            data,
        };
        self.offset += 1;
        token
    }

    fn take_integer(&mut self) -> Result<Token<'a>> {
        let offset = self.offset;
        self.expect_one(b'i')?;
        let body = self.take_while(|c| c != b'e');
        self.expect_one(b'e')?;
        let value = parse_strict_integer(body)?;
        let length = self.offset - offset;
        Ok(Token {
            offset,
            length,
            data: TokenData::Integer(value),
        })
    }

    fn take_string(&mut self) -> Result<Token<'a>> {
        let offset = self.offset;
        let digits = self.take_while(|c| c.is_ascii_digit());
        self.expect_one(b':')?;
        let string_len = parse_length_prefix(digits)?;
        let string = self.take_n(string_len)?;
        let length = self.offset - offset;
        Ok(Token {
            offset,
            length,
            data: TokenData::ByteString(string),
        })
    }

    fn peek_one(&self) -> Result<u8> {
        self.data
            .get(self.offset)
            .copied()
            .ok_or(Error::new(ErrorKind::Eof))
    }

    fn take_one(&mut self) -> Result<u8> {
        let v = self.data.get(self.offset).copied();
        self.offset += 1;
        v.ok_or(Error::new(ErrorKind::Eof))
    }

    fn take_n(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.offset.saturating_add(n) > self.data.len() {
            Err(Error::new(ErrorKind::UnexpectedEof))
        } else {
            let v = &self.data[self.offset..self.offset + n];
            self.offset += n;
            Ok(v)
        }
    }

    fn take_while<F>(&mut self, f: F) -> &'a [u8]
    where
        F: Fn(u8) -> bool,
    {
        let start = self.offset;
        while let Some(&c) = self.data.get(self.offset) {
            if !f(c) {
                break;
            }
            self.offset += 1;
        }
        &self.data[start..self.offset]
    }

    fn expect_one(&mut self, v: u8) -> Result<()> {
        match self.take_one() {
            Ok(c) if c == v => Ok(()),
            Ok(_) => Err(Error::new(ErrorKind::Invalid)),
            Err(e) if e.kind == ErrorKind::Eof => Err(Error::new(ErrorKind::UnexpectedEof)),
            Err(e) => Err(e),
        }
    }
}

// Integer bodies must match `-?(0|[1-9][0-9]*)`. "i-0e", "i03e" and an
// empty body are all rejected, otherwise two distinct encodings could
// decode to the same value.
fn parse_strict_integer(body: &[u8]) -> Result<i64> {
    let digits = match body.split_first() {
        Some((b'-', rest)) => rest,
        _ => body,
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::new(ErrorKind::Invalid));
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(Error::new(ErrorKind::Invalid));
    }
    if body[0] == b'-' && digits == b"0" {
        return Err(Error::new(ErrorKind::Invalid));
    }
    let str = std::str::from_utf8(body).expect("digits are ascii");
    str.parse::<i64>().map_err(|_| Error::new(ErrorKind::Invalid))
}

fn parse_length_prefix(digits: &[u8]) -> Result<usize> {
    if digits.is_empty() {
        return Err(Error::new(ErrorKind::Invalid));
    }
    let str = std::str::from_utf8(digits).expect("digits are ascii");
    str.parse::<usize>().map_err(|_| Error::new(ErrorKind::Invalid))
}

pub enum ValueData<'a> {
    Integer(i64),
    Bytes(&'a [u8]),
    List(Vec<Value<'a>>),
    Dict(Dict<'a>),
}

impl<'a> std::fmt::Debug for ValueData<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(arg0) => f.debug_tuple("Integer").field(arg0).finish(),
            Self::Bytes(arg0) => match std::str::from_utf8(arg0) {
                Ok(str) => f.write_str(str),
                _ => write!(f, "<{} bytes>", arg0.len()),
            },
            Self::List(arg0) => f.debug_tuple("List").field(arg0).finish(),
            Self::Dict(arg0) => f.debug_tuple("Dict").field(arg0).finish(),
        }
    }
}

/// A decoded bencode value.
///
/// `bytes` is the exact input slice this value was decoded from. Callers
/// that need a stable digest of a subtree (the metainfo `info`
/// dictionary) hash `bytes` instead of re-encoding.
pub struct Value<'a> {
    pub offset: usize,
    pub length: usize,
    pub bytes: &'a [u8],
    pub data: ValueData<'a>,
}

impl<'a> std::fmt::Debug for Value<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <ValueData<'a> as std::fmt::Debug>::fmt(&self.data, f)
    }
}

impl<'a> Value<'a> {
    pub fn as_integer(&self) -> Result<i64> {
        match &self.data {
            ValueData::Integer(v) => Ok(*v),
            _ => Err(Error::message("expected integer")),
        }
    }

    pub fn as_bytes(&self) -> Result<&'a [u8]> {
        match &self.data {
            ValueData::Bytes(v) => Ok(v),
            _ => Err(Error::message("expected byte string")),
        }
    }

    pub fn as_str(&self) -> Result<&'a str> {
        match &self.data {
            ValueData::Bytes(v) => {
                std::str::from_utf8(v).map_err(|_| Error::message("byte string is not utf-8"))
            }
            _ => Err(Error::message("expected utf-8 byte string")),
        }
    }

    pub fn as_list(&self) -> Result<&[Value<'a>]> {
        match &self.data {
            ValueData::List(v) => Ok(v.as_slice()),
            _ => Err(Error::message("expected list")),
        }
    }

    pub fn as_dict(&self) -> Result<&Dict<'a>> {
        match &self.data {
            ValueData::Dict(dict) => Ok(dict),
            _ => Err(Error::message("expected dictionary")),
        }
    }
}

struct DictEntry<'a> {
    key: &'a [u8],
    value: Value<'a>,
}

/// Dictionary entries in input order. Keys stay raw bytes: scrape
/// replies key their `files` dictionary by 20-byte info-hashes that are
/// not valid UTF-8.
pub struct Dict<'a> {
    entries: Vec<DictEntry<'a>>,
}

impl<'a> std::fmt::Debug for Dict<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut m = f.debug_map();
        for entry in &self.entries {
            if let Ok(str) = std::str::from_utf8(entry.key) {
                m.key(&str);
            } else {
                m.key(&entry.key);
            }
            m.value(&entry.value);
        }
        m.finish()
    }
}

impl<'a> Dict<'a> {
    pub fn find<T: FromValue>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.find_value(key) {
            Some(value) => Some(
                T::from_value(value)
                    .with_context(|| format!("decoding value of key '{}'", KeyDisplay(key))),
            )
            .transpose(),
            None => Ok(None),
        }
    }

    pub fn require<T: FromValue>(&self, key: &[u8]) -> Result<T> {
        let value = self.require_value(key)?;
        T::from_value(value)
            .with_context(|| format!("decoding value of key '{}'", KeyDisplay(key)))
    }

    pub fn find_value(&self, key: &[u8]) -> Option<&Value<'a>> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.value)
    }

    pub fn require_value(&self, key: &[u8]) -> Result<&Value<'a>> {
        self.find_value(key).ok_or_else(|| Error::missing_key(key))
    }

    /// Entries in input order with their raw byte keys.
    pub fn iter<'s>(&'s self) -> impl Iterator<Item = (&'a [u8], &'s Value<'a>)> + 's {
        self.entries.iter().map(|entry| (entry.key, &entry.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn decode<T: FromValue>(buf: &[u8]) -> Result<T> {
    let value = decode_value(buf)?;
    T::from_value(&value)
}

pub fn decode_value(buf: &[u8]) -> Result<Value> {
    fn decode_ext<'a>(buf: &'a [u8], tokenizer: &mut Tokenizer<'a>) -> Result<Value<'a>> {
        let token = match tokenizer.next() {
            Ok(token) => token,
            Err(e) if e.kind == ErrorKind::Eof => return Err(Error::new(ErrorKind::UnexpectedEof)),
            Err(e) => return Err(e),
        };

        match token.data {
            TokenData::Integer(v) => Ok(Value {
                offset: token.offset,
                length: token.length,
                bytes: &buf[token.offset..token.offset + token.length],
                data: ValueData::Integer(v),
            }),
            TokenData::ByteString(v) => Ok(Value {
                offset: token.offset,
                length: token.length,
                bytes: &buf[token.offset..token.offset + token.length],
                data: ValueData::Bytes(v),
            }),
            TokenData::ListBegin => {
                let offset = token.offset;
                let mut values = Vec::new();
                loop {
                    let peek = tokenizer.peek()?;
                    if peek.data == TokenData::End {
                        let end_token = tokenizer.next()?;
                        let length = end_token.offset - offset + end_token.length;
                        return Ok(Value {
                            offset,
                            length,
                            bytes: &buf[offset..offset + length],
                            data: ValueData::List(values),
                        });
                    }
                    values.push(decode_ext(buf, tokenizer)?);
                }
            }
            TokenData::DictBegin => {
                let offset = token.offset;
                let mut entries: Vec<DictEntry> = Vec::new();
                loop {
                    let peek = tokenizer.peek()?;
                    if peek.data == TokenData::End {
                        let end_token = tokenizer.next()?;
                        let length = end_token.offset - offset + end_token.length;
                        return Ok(Value {
                            offset,
                            length,
                            bytes: &buf[offset..offset + length],
                            data: ValueData::Dict(Dict { entries }),
                        });
                    }

                    let key = match decode_ext(buf, tokenizer)?.data {
                        ValueData::Bytes(v) => v,
                        _ => return Err(Error::message("dictionary key must be a byte string")),
                    };
                    let value = decode_ext(buf, tokenizer)?;
                    entries.push(DictEntry { key, value });
                }
            }
            TokenData::End => Err(Error::message("unexpected end marker")),
        }
    }

    let mut tokenizer = Tokenizer::new(buf);
    decode_ext(buf, &mut tokenizer)
}

pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

macro_rules! impl_from_value_integer {
    ($t:ty) => {
        impl FromValue for $t {
            fn from_value(value: &Value) -> Result<Self> {
                value
                    .as_integer()?
                    .try_into()
                    .map_err(|_| Error::message("integer out of range"))
            }
        }
    };
}

impl_from_value_integer!(i8);
impl_from_value_integer!(i16);
impl_from_value_integer!(i32);
impl_from_value_integer!(i64);
impl_from_value_integer!(u8);
impl_from_value_integer!(u16);
impl_from_value_integer!(u32);
impl_from_value_integer!(u64);

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.as_str()?.to_owned())
    }
}

impl<T> FromValue for Vec<T>
where
    T: FromValue,
{
    fn from_value(value: &Value) -> Result<Self> {
        let list = value.as_list()?;
        let mut values = Vec::with_capacity(list.len());
        for v in list {
            values.push(T::from_value(v)?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_integer() {
        assert_eq!(decode_value(b"i42e").unwrap().as_integer().unwrap(), 42);
        assert_eq!(decode_value(b"i-123e").unwrap().as_integer().unwrap(), -123);
        assert_eq!(decode_value(b"i0e").unwrap().as_integer().unwrap(), 0);

        assert!(decode_value(b"ie").is_err());
        assert!(decode_value(b"i123").is_err());
        assert!(decode_value(b"iabce").is_err());
    }

    #[test]
    fn decode_integer_rejects_redundant_forms() {
        assert!(decode_value(b"i-0e").is_err());
        assert!(decode_value(b"i03e").is_err());
        assert!(decode_value(b"i007e").is_err());
        assert!(decode_value(b"i-e").is_err());
        assert!(decode_value(b"i+5e").is_err());
    }

    #[test]
    fn decode_string() {
        assert_eq!(decode_value(b"4:rust").unwrap().as_str().unwrap(), "rust");
        assert_eq!(decode_value(b"0:").unwrap().as_str().unwrap(), "");

        assert!(decode_value(b"4:r").is_err());
        assert!(decode_value(b"-1:abc").is_err());
        assert!(decode_value(b"+4:rust").is_err());
    }

    #[test]
    fn decode_list() {
        let value = decode_value(b"li42e4:ruste").unwrap();
        let list = value.as_list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].as_integer().unwrap(), 42);
        assert_eq!(list[1].as_str().unwrap(), "rust");

        assert!(decode_value(b"le").unwrap().as_list().unwrap().is_empty());
        assert!(decode_value(b"li42e").is_err());
    }

    #[test]
    fn decode_dict() {
        let value = decode_value(b"d3:keyi42e5:value3:abce").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.require::<i64>(b"key").unwrap(), 42);
        assert_eq!(dict.find::<String>(b"value").unwrap().unwrap(), "abc");
        assert!(dict.find::<String>(b"absent").unwrap().is_none());

        assert_eq!(decode_value(b"de").unwrap().as_dict().unwrap().len(), 0);
        assert!(decode_value(b"d3:keyi42e").is_err());
        assert!(decode_value(b"di1e3:abce").is_err());
    }

    #[test]
    fn dict_preserves_binary_keys() {
        // scrape-style dictionary keyed by raw non-utf8 bytes
        let mut input = Vec::new();
        input.extend_from_slice(b"d3:");
        input.extend_from_slice(&[0xff, 0xfe, 0x01]);
        input.extend_from_slice(b"i7ee");
        let value = decode_value(&input).unwrap();
        let dict = value.as_dict().unwrap();
        let (key, entry) = dict.iter().next().unwrap();
        assert_eq!(key, &[0xff, 0xfe, 0x01]);
        assert_eq!(entry.as_integer().unwrap(), 7);
    }

    #[test]
    fn value_bytes_cover_exact_input_span() {
        let input = b"d4:infod3:fooi1eee";
        let value = decode_value(input).unwrap();
        let info = value.as_dict().unwrap().require_value(b"info").unwrap();
        assert_eq!(info.bytes, b"d3:fooi1ee");
    }

    #[test]
    fn truncation_is_unexpected_eof() {
        for input in [&b"i42"[..], b"4:r", b"d3:key", b"lli1e"] {
            let err = decode_value(input).unwrap_err();
            assert!(err.is_eof(), "{input:?} should report eof, got {err:?}");
        }
    }

    #[test]
    fn from_value_conversions() {
        let value = decode_value(b"i300e").unwrap();
        assert!(u8::from_value(&value).is_err());
        assert_eq!(u16::from_value(&value).unwrap(), 300);

        let value = decode_value(b"l3:foo3:bar3:baze").unwrap();
        let strings: Vec<String> = FromValue::from_value(&value).unwrap();
        assert_eq!(strings, vec!["foo", "bar", "baz"]);
    }
}
