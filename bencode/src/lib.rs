use std::collections::BTreeMap;
use std::ops::Range;
use std::str::{from_utf8, FromStr, Utf8Error};

use thiserror::Error;

use crate::BencodeError::{
    InvalidDictionary, InvalidFormat, InvalidInteger, InvalidList, InvalidString, InvalidType,
    MissingInfo, UnexpectedEof,
};

pub type BencodeInt = i64;
pub type BencodeString = Vec<u8>;
pub type BencodeList = Vec<Value>;
pub type BencodeDict = BTreeMap<BencodeString, Value>;
pub type Result<T> = std::result::Result<T, BencodeError>;

/// Dictionary key whose raw value bytes are tracked during decoding.
pub const INFO_KEY: &[u8] = b"info";

#[derive(Debug, PartialEq)]
pub enum Value {
    Int(BencodeInt),
    String(BencodeString),
    List(BencodeList),
    Dict(BencodeDict),
}

static INTEGER_NAME: &str = "Integer";
static STRING_NAME: &str = "String";
static LIST_NAME: &str = "List";
static DICTIONARY_NAME: &str = "Dictionary";

impl Value {
    pub fn name(&self) -> &'static str {
        match self {
            Value::Int(_) => INTEGER_NAME,
            Value::String(_) => STRING_NAME,
            Value::List(_) => LIST_NAME,
            Value::Dict(_) => DICTIONARY_NAME,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum BencodeError {
    #[error("Invalid format {0}")]
    InvalidFormat(String),
    #[error("Unexpected end of input")]
    UnexpectedEof,
    #[error("Invalid integer")]
    InvalidInteger,
    #[error("Invalid string")]
    InvalidString,
    #[error("Invalid list")]
    InvalidList,
    #[error("Invalid dictionary")]
    InvalidDictionary,
    #[error("Invalid UTF-8 sequence: {0}")]
    InvalidUtf8(#[from] Utf8Error),
    #[error("Invalid type found {0} expected {1}")]
    InvalidType(&'static str, &'static str),
    #[error("No 'info' dictionary was decoded")]
    MissingInfo,
}

impl TryFrom<Value> for BencodeInt {
    type Error = BencodeError;
    fn try_from(value: Value) -> Result<Self> {
        if let Value::Int(int) = value {
            return Ok(int);
        }
        Err(InvalidType(value.name(), INTEGER_NAME))
    }
}

impl TryFrom<Value> for BencodeString {
    type Error = BencodeError;
    fn try_from(value: Value) -> Result<Self> {
        if let Value::String(string) = value {
            return Ok(string);
        }
        Err(InvalidType(value.name(), STRING_NAME))
    }
}

impl TryFrom<Value> for BencodeList {
    type Error = BencodeError;
    fn try_from(value: Value) -> Result<Self> {
        if let Value::List(list) = value {
            return Ok(list);
        }
        Err(InvalidType(value.name(), LIST_NAME))
    }
}

impl TryFrom<Value> for BencodeDict {
    type Error = BencodeError;
    fn try_from(value: Value) -> Result<Self> {
        if let Value::Dict(dict) = value {
            return Ok(dict);
        }
        Err(InvalidType(value.name(), DICTIONARY_NAME))
    }
}

impl TryFrom<Value> for String {
    type Error = BencodeError;
    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        Ok(String::from_utf8(BencodeString::try_from(value)?).map_err(|e| e.utf8_error())?)
    }
}

impl From<BencodeString> for Value {
    fn from(value: BencodeString) -> Self {
        Value::String(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value.into_bytes())
    }
}

impl From<BencodeInt> for Value {
    fn from(value: BencodeInt) -> Self {
        Value::Int(value)
    }
}

pub fn from_slice(data: &[u8]) -> Result<Value> {
    let mut decoder = BencodeDecoder::new(data);
    decoder.parse()
}

/// A decoded value together with the raw buffer it came from, so the
/// verbatim bytes of the `info` value stay addressable after decoding.
/// Re-encoding the decoded tree is not byte-stable (key order, integer
/// formatting), hence hashing must go through [`Document::info_slice`].
pub struct Document<'a> {
    data: &'a [u8],
    value: Value,
    info_range: Option<Range<usize>>,
}

impl<'a> Document<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut decoder = BencodeDecoder::new(data);
        let value = decoder.parse()?;
        Ok(Self {
            data,
            value,
            info_range: decoder.info_range,
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Raw bytes of the last decoded `info` value, exactly as they appeared
    /// in the input buffer.
    pub fn info_slice(&self) -> Result<&'a [u8]> {
        let range = self.info_range.clone().ok_or(MissingInfo)?;
        Ok(&self.data[range])
    }
}

struct BencodeDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    info_range: Option<Range<usize>>,
}

impl<'a> BencodeDecoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            info_range: None,
        }
    }

    fn parse_str(&mut self) -> Result<BencodeString> {
        let mut digits = 0;
        loop {
            match self.data.get(self.pos + digits) {
                Some(b':') => break,
                Some(b'0'..=b'9') => digits += 1,
                Some(_) => return Err(InvalidString),
                None => return Err(UnexpectedEof),
            }
        }
        let len = usize::from_str(from_utf8(&self.data[self.pos..self.pos + digits])?)
            .map_err(|e| InvalidFormat(format!("{e}")))?;
        let start_of_string = self.pos + digits + 1;
        let vec_data = self
            .data
            .get(start_of_string..start_of_string + len)
            .ok_or(UnexpectedEof)?
            .to_vec();
        self.pos = start_of_string + len;
        Ok(vec_data)
    }

    fn parse_int(&mut self) -> Result<BencodeInt> {
        let start = self.pos + 1;
        let mut end = start;
        loop {
            match self.data.get(end) {
                Some(b'e') => break,
                Some(b'0'..=b'9') => end += 1,
                Some(b'-') if end == start => end += 1,
                Some(_) => return Err(InvalidInteger),
                None => return Err(UnexpectedEof),
            }
        }
        let ans = i64::from_str(from_utf8(&self.data[start..end])?)
            .map_err(|e| InvalidFormat(format!("{e}")))?;
        self.pos = end + 1;
        Ok(ans)
    }

    fn parse_list(&mut self) -> Result<BencodeList> {
        self.pos += 1;
        let mut ans: BencodeList = Vec::new();
        while *self.data.get(self.pos).ok_or(InvalidList)? != b'e' {
            ans.push(self.parse()?);
        }
        self.pos += 1;
        Ok(ans)
    }

    fn parse_dict(&mut self) -> Result<BencodeDict> {
        self.pos += 1;
        let mut ans: BencodeDict = BTreeMap::new();
        while *self.data.get(self.pos).ok_or(InvalidDictionary)? != b'e' {
            let key = match self.parse()? {
                Value::String(key) => key,
                _ => return Err(InvalidDictionary),
            };
            let value_start = self.pos;
            let value = self.parse()?;
            if key == INFO_KEY {
                self.info_range = Some(value_start..self.pos);
            }
            ans.insert(key, value);
        }
        self.pos += 1;
        Ok(ans)
    }

    fn parse(&mut self) -> Result<Value> {
        match self.data.get(self.pos).ok_or(UnexpectedEof)? {
            b'i' => self.parse_int().map(Value::Int),
            b'l' => self.parse_list().map(Value::List),
            b'd' => self.parse_dict().map(Value::Dict),
            b'0'..=b'9' => self.parse_str().map(Value::String),
            char => Err(InvalidFormat(format!("unexpected char, code: {char}"))),
        }
    }

    #[cfg(test)]
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

pub fn into_vec(value: &Value) -> Vec<u8> {
    let mut res = Vec::new();
    let mut encoder = BencodeEncoder::new(&mut res);
    encoder.encode(value);
    res
}

pub struct BencodeEncoder<'a> {
    data: &'a mut Vec<u8>,
}

impl<'a> BencodeEncoder<'a> {
    pub fn new(data: &'a mut Vec<u8>) -> Self {
        Self { data }
    }

    pub fn encode(&mut self, value: &Value) {
        match value {
            Value::Int(int) => self.encode_int(int.to_owned()),
            Value::String(str) => self.encode_bytes(str.as_slice()),
            Value::List(list) => self.encode_list(list),
            Value::Dict(dict) => self.encode_dict(dict),
        }
    }

    pub fn encode_int(&mut self, int: BencodeInt) {
        self.data.push(b'i');
        self.data.extend_from_slice(int.to_string().as_bytes());
        self.data.push(b'e');
    }

    pub fn encode_bytes(&mut self, bytes: &[u8]) {
        self.data
            .extend_from_slice(bytes.len().to_string().as_bytes());
        self.data.push(b':');
        self.data.extend_from_slice(bytes);
    }

    pub fn encode_list(&mut self, list: &BencodeList) {
        self.data.push(b'l');
        for item in list {
            self.encode(item)
        }
        self.data.push(b'e');
    }

    pub fn encode_dict(&mut self, dict: &BencodeDict) {
        self.data.push(b'd');
        for (key, value) in dict {
            self.encode_bytes(key);
            self.encode(value);
        }
        self.data.push(b'e');
    }
}
