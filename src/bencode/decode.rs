use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

/// Nesting limit; prevents stack exhaustion on crafted input.
const MAX_DEPTH: usize = 64;

/// Decodes exactly one bencode value from `data`.
///
/// Trailing bytes after the value are an error, as is any syntactic
/// deviation: an empty or leading-zero integer, a negative string length,
/// a dictionary key that is not a byte string, or nesting deeper than 64
/// levels.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut parser = Parser { data, pos: 0 };
    let value = parser.value(0)?;

    if parser.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            c => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.bump();

        let start = self.pos;
        while self.peek()? != b'e' {
            self.bump();
        }

        let digits = &self.data[start..self.pos];
        self.bump();

        if digits.is_empty() || digits == b"-" {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }

        // i0e is the only integer allowed to start with a zero digit.
        let unsigned = if digits[0] == b'-' { &digits[1..] } else { digits };
        if unsigned.len() > 1 && unsigned[0] == b'0' {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }
        if digits == b"-0" {
            return Err(BencodeError::InvalidInteger("negative zero".into()));
        }

        let text = std::str::from_utf8(digits)
            .map_err(|_| BencodeError::InvalidInteger("non-ascii".into()))?;
        let value: i64 = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(text.into()))?;

        Ok(Value::Integer(value))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::InvalidStringLength);
            }
            self.bump();
        }

        let len_digits = &self.data[start..self.pos];
        self.bump();

        if len_digits.is_empty() || (len_digits.len() > 1 && len_digits[0] == b'0') {
            return Err(BencodeError::InvalidStringLength);
        }

        let len: usize = std::str::from_utf8(len_digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump();
        let mut items = Vec::new();

        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.bump();

        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump();
        let mut entries = BTreeMap::new();

        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::UnexpectedChar(self.peek()? as char));
            }
            let key = self.byte_string()?;
            let value = self.value(depth + 1)?;
            entries.insert(key, value);
        }
        self.bump();

        Ok(Value::Dict(entries))
    }
}
