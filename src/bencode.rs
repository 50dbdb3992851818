//! A minimal, non-allocating-where-possible bencode scanner.
//!
//! The bulk of metainfo parsing goes through serde, but two things serde
//! can't give us: the raw byte span of the `info` dictionary (the info hash
//! is defined over the original bytes, not a re-encoding), and the v2 `file
//! tree`, whose keys are arbitrary path components. This scanner covers
//! both. Parse failures are values, never unwinding (`BencodeError`).

use std::ops::Range;

use crate::error::BencodeError;

/// How deep dictionaries and lists may nest. The v2 file tree nests one
/// level per path component, so this bounds path depth as well.
const MAX_DEPTH: usize = 100;

/// A parsed bencode value borrowing from the input buffer.
#[derive(Debug, PartialEq)]
pub(crate) enum Value<'a> {
    Int(i64),
    Bytes(&'a [u8]),
    List(Vec<Value<'a>>),
    Dict(Dict<'a>),
}

/// A bencoded dictionary. Keys keep their input order (the format wants
/// them sorted, but we don't reject unsorted input) and the raw byte span
/// of the whole dictionary is retained for hashing.
#[derive(Debug, PartialEq)]
pub(crate) struct Dict<'a> {
    pub entries: Vec<(&'a [u8], Value<'a>)>,
    /// The span of the dictionary in the input, including the `d`...`e`
    /// delimiters.
    pub span: Range<usize>,
}

impl<'a> Dict<'a> {
    pub fn get(&self, key: &[u8]) -> Option<&Value<'a>> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

impl<'a> Value<'a> {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict<'a>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Decodes a complete bencoded buffer. Trailing bytes are an error.
pub(crate) fn decode(buf: &[u8]) -> Result<Value, BencodeError> {
    let mut scanner = Scanner { buf, pos: 0 };
    let value = scanner.value(0)?;
    if scanner.pos != buf.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

/// Returns the raw byte span of the `info` dictionary in a .torrent buffer,
/// or `None` if the top level value has no `info` key.
pub(crate) fn info_span(buf: &[u8]) -> Result<Option<Range<usize>>, BencodeError> {
    let root = decode(buf)?;
    let root = match root {
        Value::Dict(d) => d,
        _ => return Ok(None),
    };
    Ok(root.get(b"info").and_then(|v| match v {
        Value::Dict(d) => Some(d.span.clone()),
        _ => None,
    }))
}

struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value<'a>, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::DepthExceeded(self.pos));
        }
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            _ => Err(BencodeError::UnexpectedToken(self.pos)),
        }
    }

    fn int(&mut self) -> Result<Value<'a>, BencodeError> {
        debug_assert_eq!(self.peek(), Ok(b'i'));
        self.pos += 1;
        let negative = if self.peek()? == b'-' {
            self.pos += 1;
            true
        } else {
            false
        };
        let mut n: i64 = 0;
        let mut digits = 0;
        loop {
            match self.peek()? {
                c @ b'0'..=b'9' => {
                    n = n
                        .checked_mul(10)
                        .and_then(|n| n.checked_add((c - b'0') as i64))
                        .ok_or(BencodeError::Overflow(self.pos))?;
                    digits += 1;
                    self.pos += 1;
                }
                b'e' => break,
                _ => return Err(BencodeError::ExpectedDigit(self.pos)),
            }
        }
        if digits == 0 {
            return Err(BencodeError::ExpectedDigit(self.pos));
        }
        // consume the 'e'
        self.pos += 1;
        Ok(Value::Int(if negative { -n } else { n }))
    }

    fn bytes(&mut self) -> Result<&'a [u8], BencodeError> {
        let mut len: usize = 0;
        let mut digits = 0;
        loop {
            match self.peek()? {
                c @ b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|n| n.checked_add((c - b'0') as usize))
                        .ok_or(BencodeError::Overflow(self.pos))?;
                    digits += 1;
                    self.pos += 1;
                }
                b':' => break,
                _ => return Err(BencodeError::ExpectedDigit(self.pos)),
            }
        }
        if digits == 0 {
            return Err(BencodeError::ExpectedDigit(self.pos));
        }
        if self.peek()? != b':' {
            return Err(BencodeError::ExpectedColon(self.pos));
        }
        self.pos += 1;
        let end = self
            .pos
            .checked_add(len)
            .ok_or(BencodeError::Overflow(self.pos))?;
        if end > self.buf.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value<'a>, BencodeError> {
        debug_assert_eq!(self.peek(), Ok(b'l'));
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value<'a>, BencodeError> {
        debug_assert_eq!(self.peek(), Ok(b'd'));
        let start = self.pos;
        self.pos += 1;
        let mut entries = Vec::new();
        while self.peek()? != b'e' {
            let key = self.bytes()?;
            let value = self.value(depth + 1)?;
            entries.push((key, value));
        }
        self.pos += 1;
        Ok(Value::Dict(Dict {
            entries,
            span: start..self.pos,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-3e").unwrap(), Value::Int(-3));
        assert_eq!(decode(b"4:spam").unwrap(), Value::Bytes(b"spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(b""));
    }

    #[test]
    fn test_decode_compound() {
        let v = decode(b"l4:spami7ee").unwrap();
        let items = v.as_list().unwrap();
        assert_eq!(items[0].as_bytes(), Some(&b"spam"[..]));
        assert_eq!(items[1].as_int(), Some(7));

        let v = decode(b"d3:cow3:moo4:spami3ee").unwrap();
        let d = v.as_dict().unwrap();
        assert_eq!(d.get(b"cow").unwrap().as_bytes(), Some(&b"moo"[..]));
        assert_eq!(d.get(b"spam").unwrap().as_int(), Some(3));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(b"i42"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"ie"), Err(BencodeError::ExpectedDigit(1)));
        assert_eq!(decode(b"4spam"), Err(BencodeError::ExpectedDigit(1)));
        assert_eq!(decode(b"5:spam"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"i42ei0e"), Err(BencodeError::TrailingBytes));
        assert!(matches!(
            decode(b"i99999999999999999999e"),
            Err(BencodeError::Overflow(_))
        ));
        // a torrent of deeply nested lists must not blow the stack
        let mut evil = vec![b'l'; 10_000];
        evil.extend(vec![b'e'; 10_000]);
        assert!(matches!(
            decode(&evil),
            Err(BencodeError::DepthExceeded(_))
        ));
    }

    #[test]
    fn test_info_span() {
        let buf = b"d8:announce3:url4:infod4:name4:test6:lengthi10eee";
        let span = info_span(buf).unwrap().unwrap();
        assert_eq!(&buf[span.clone()], &b"d4:name4:test6:lengthi10ee"[..]);
        // decoding the span alone yields the same dictionary
        assert!(decode(&buf[span]).is_ok());
    }
}
