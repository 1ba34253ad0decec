use std::collections::BTreeMap;
use std::ops::Range;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes a single complete bencode value from a byte slice.
///
/// The input must contain exactly one value with no trailing data.
///
/// # Examples
///
/// ```
/// use urtorrent::bencode::decode;
///
/// assert_eq!(decode(b"i42e").unwrap().as_integer(), Some(42));
/// assert_eq!(decode(b"4:spam").unwrap().as_str(), Some("spam"));
/// ```
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut cur = Cursor::new(data);
    let value = cur.value(0)?;
    cur.expect_end()?;
    Ok(value)
}

/// Decodes a top-level dictionary and reports the byte range each value
/// occupies in `data`.
///
/// The range covers the complete encoded value, so for a nested dictionary
/// it spans from its opening `d` through its closing `e`. This is how the
/// metainfo parser hashes the exact `info` bytes rather than a
/// re-serialization.
pub fn decode_top_spans(data: &[u8]) -> Result<BTreeMap<Bytes, Range<usize>>, BencodeError> {
    let mut cur = Cursor::new(data);

    if cur.peek()? != b'd' {
        return Err(BencodeError::NotADictionary);
    }
    cur.pos += 1;

    let mut spans = BTreeMap::new();
    while cur.peek()? != b'e' {
        let key = match cur.value(1)? {
            Value::Bytes(b) => b,
            _ => return Err(BencodeError::NotADictionary),
        };
        let start = cur.pos;
        cur.value(1)?;
        spans.insert(key, start..cur.pos);
    }
    cur.pos += 1;
    cur.expect_end()?;

    Ok(spans)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn expect_end(&self) -> Result<(), BencodeError> {
        if self.pos != self.data.len() {
            return Err(BencodeError::TrailingData);
        }
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes(),
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let digits = self.take_until(b'e')?;

        let text = std::str::from_utf8(digits)
            .map_err(|_| BencodeError::InvalidInteger("not ascii".into()))?;

        if text.is_empty() {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }
        if text.starts_with("-0") || (text.starts_with('0') && text.len() > 1) {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }

        let value: i64 = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(text.into()))?;

        self.pos += 1;
        Ok(Value::Integer(value))
    }

    fn bytes(&mut self) -> Result<Value, BencodeError> {
        let digits = self.take_until(b':')?;
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength)?;
        self.pos += 1;

        if self.pos + len > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(Value::Bytes(bytes))
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();

        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut entries = BTreeMap::new();

        while self.peek()? != b'e' {
            let key = match self.value(depth + 1)? {
                Value::Bytes(b) => b,
                _ => return Err(BencodeError::UnexpectedByte(self.data[self.pos - 1])),
            };
            let value = self.value(depth + 1)?;
            entries.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(entries))
    }

    /// Advances past the bytes before `stop`, leaving the cursor on `stop`.
    fn take_until(&mut self, stop: u8) -> Result<&'a [u8], BencodeError> {
        let start = self.pos;
        while self.peek()? != stop {
            self.pos += 1;
        }
        let data = self.data;
        Ok(&data[start..self.pos])
    }
}
