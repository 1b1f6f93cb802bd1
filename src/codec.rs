//! Self-describing binary encoding of document values.
//!
//! Every value is a one-byte tag followed by its payload. Integers are
//! little-endian, strings are length-prefixed UTF-8. A record in the storage
//! file is decodable knowing only its start offset.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use serde_json::Value;

use crate::errors::CodecError;
use crate::{Document, YarDbError};

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_DOUBLE: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_ARRAY: u8 = 0x05;
const TAG_OBJECT: u8 = 0x06;

pub(crate) fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

pub(crate) fn read_string<R: Read>(r: &mut R) -> Result<String, YarDbError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| CodecError("invalid UTF-8 in encoded string".into()).into())
}

pub(crate) fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push(TAG_INT);
                out.extend_from_slice(&i.to_le_bytes());
            } else if let Some(u) = n.as_u64().and_then(|u| i64::try_from(u).ok()) {
                out.push(TAG_INT);
                out.extend_from_slice(&u.to_le_bytes());
            } else {
                let f = n.as_f64().unwrap_or(f64::MAX);
                out.push(TAG_DOUBLE);
                out.extend_from_slice(&f.to_le_bytes());
            }
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            write_string(out, s);
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_value(out, item);
            }
        }
        Value::Object(map) => {
            out.push(TAG_OBJECT);
            out.extend_from_slice(&(map.len() as u32).to_le_bytes());
            for (key, item) in map {
                write_string(out, key);
                encode_value(out, item);
            }
        }
    }
}

pub(crate) fn decode_value<R: Read>(r: &mut R) -> Result<Value, YarDbError> {
    let tag = r.read_u8()?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => Ok(Value::Bool(r.read_u8()? != 0)),
        TAG_INT => Ok(Value::from(r.read_i64::<LittleEndian>()?)),
        TAG_DOUBLE => {
            let f = r.read_f64::<LittleEndian>()?;
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| CodecError(format!("non-finite double {f}")).into())
        }
        TAG_STRING => Ok(Value::String(read_string(r)?)),
        TAG_ARRAY => {
            let len = r.read_u32::<LittleEndian>()? as usize;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(decode_value(r)?);
            }
            Ok(Value::Array(items))
        }
        TAG_OBJECT => {
            let len = r.read_u32::<LittleEndian>()? as usize;
            let mut map = Document::new();
            for _ in 0..len {
                let key = read_string(r)?;
                map.insert(key, decode_value(r)?);
            }
            Ok(Value::Object(map))
        }
        other => Err(CodecError(format!("unknown value tag {other:#04x}")).into()),
    }
}

pub(crate) fn encode_document(out: &mut Vec<u8>, doc: &Document) {
    out.push(TAG_OBJECT);
    out.extend_from_slice(&(doc.len() as u32).to_le_bytes());
    for (key, item) in doc {
        write_string(out, key);
        encode_value(out, item);
    }
}

pub(crate) fn decode_document<R: Read>(r: &mut R) -> Result<Document, YarDbError> {
    match decode_value(r)? {
        Value::Object(map) => Ok(map),
        other => Err(CodecError(format!("expected object, decoded {other}")).into()),
    }
}
