use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::marker::Marker;
use crate::error::RecoveryError;
use crate::types::{EnumTypeId, EnumValueId, PropertyValue};

// Nested lists/maps deeper than this are treated as corruption.
const MAX_VALUE_DEPTH: usize = 64;

/// Writes markers, typed values and raw words to a snapshot file,
/// tracking the byte offset of everything it writes.
pub struct Encoder {
    writer: BufWriter<File>,
    position: u64,
}

impl Encoder {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            position: 0,
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn write_raw_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn write_raw_u64(&mut self, value: u64) -> io::Result<()> {
        self.write_raw_bytes(&value.to_le_bytes())
    }

    pub fn write_marker(&mut self, marker: Marker) -> io::Result<()> {
        self.write_raw_bytes(&[marker.as_byte()])
    }

    pub fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.write_marker(Marker::TypeBool)?;
        self.write_raw_bytes(&[u8::from(value)])
    }

    pub fn write_uint(&mut self, value: u64) -> io::Result<()> {
        self.write_marker(Marker::TypeInt)?;
        self.write_raw_u64(value)
    }

    pub fn write_double(&mut self, value: f64) -> io::Result<()> {
        self.write_marker(Marker::TypeDouble)?;
        self.write_raw_u64(value.to_bits())
    }

    pub fn write_string(&mut self, value: &str) -> io::Result<()> {
        self.write_marker(Marker::TypeString)?;
        self.write_raw_u64(value.len() as u64)?;
        self.write_raw_bytes(value.as_bytes())
    }

    pub fn write_property_value(&mut self, value: &PropertyValue) -> io::Result<()> {
        match value {
            PropertyValue::Null => self.write_marker(Marker::TypeNull),
            PropertyValue::Bool(b) => self.write_bool(*b),
            PropertyValue::Int(i) => self.write_uint(*i as u64),
            PropertyValue::Double(d) => self.write_double(*d),
            PropertyValue::String(s) => self.write_string(s),
            PropertyValue::List(items) => {
                self.write_marker(Marker::TypeList)?;
                self.write_raw_u64(items.len() as u64)?;
                items.iter().try_for_each(|item| self.write_property_value(item))
            }
            PropertyValue::Map(entries) => {
                self.write_marker(Marker::TypeMap)?;
                self.write_raw_u64(entries.len() as u64)?;
                for (key, item) in entries {
                    self.write_string(key)?;
                    self.write_property_value(item)?;
                }
                Ok(())
            }
            PropertyValue::Enum(type_id, value_id) => {
                self.write_marker(Marker::TypeEnum)?;
                self.write_raw_u64(type_id.0)?;
                self.write_raw_u64(value_id.0)
            }
        }
    }

    /// Flushes buffered bytes and syncs the file to disk.
    pub fn finalize(mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

/// Reads back what [`Encoder`] wrote. Every failure carries the offset it
/// happened at.
pub struct Decoder {
    reader: BufReader<File>,
    position: u64,
    len: u64,
}

impl Decoder {
    pub fn open(path: &Path) -> Result<Self, RecoveryError> {
        let file = File::open(path).map_err(|source| RecoveryError::Io { offset: 0, source })?;
        let len = file
            .metadata()
            .map_err(|source| RecoveryError::Io { offset: 0, source })?
            .len();
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
            len,
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn seek(&mut self, offset: u64) -> Result<(), RecoveryError> {
        if offset > self.len {
            return Err(RecoveryError::Truncated { offset });
        }
        self.reader
            .seek(SeekFrom::Start(offset))
            .map_err(|source| RecoveryError::Io { offset, source })?;
        self.position = offset;
        Ok(())
    }

    pub fn read_raw_bytes(&mut self, n: u64) -> Result<Vec<u8>, RecoveryError> {
        if self.position.saturating_add(n) > self.len {
            return Err(RecoveryError::Truncated { offset: self.position });
        }
        let mut buf = vec![0u8; n as usize];
        self.reader.read_exact(&mut buf).map_err(|source| match source.kind() {
            io::ErrorKind::UnexpectedEof => RecoveryError::Truncated { offset: self.position },
            _ => RecoveryError::Io {
                offset: self.position,
                source,
            },
        })?;
        self.position += n;
        Ok(buf)
    }

    pub fn read_raw_u64(&mut self) -> Result<u64, RecoveryError> {
        let bytes = self.read_raw_bytes(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }

    pub fn read_marker(&mut self) -> Result<u8, RecoveryError> {
        Ok(self.read_raw_bytes(1)?[0])
    }

    pub fn expect_marker(&mut self, expected: Marker) -> Result<(), RecoveryError> {
        let offset = self.position;
        let found = self.read_marker()?;
        if found != expected.as_byte() {
            return Err(RecoveryError::UnexpectedMarker { offset, expected, found });
        }
        Ok(())
    }

    pub fn read_bool(&mut self) -> Result<bool, RecoveryError> {
        self.expect_marker(Marker::TypeBool)?;
        self.read_bool_payload()
    }

    fn read_bool_payload(&mut self) -> Result<bool, RecoveryError> {
        let offset = self.position;
        match self.read_raw_bytes(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RecoveryError::InvalidData {
                offset,
                reason: format!("invalid bool byte {:#04x}", other),
            }),
        }
    }

    pub fn read_uint(&mut self) -> Result<u64, RecoveryError> {
        self.expect_marker(Marker::TypeInt)?;
        self.read_raw_u64()
    }

    pub fn read_double(&mut self) -> Result<f64, RecoveryError> {
        self.expect_marker(Marker::TypeDouble)?;
        Ok(f64::from_bits(self.read_raw_u64()?))
    }

    pub fn read_string(&mut self) -> Result<String, RecoveryError> {
        self.expect_marker(Marker::TypeString)?;
        self.read_string_payload()
    }

    fn read_string_payload(&mut self) -> Result<String, RecoveryError> {
        let len = self.read_raw_u64()?;
        let offset = self.position;
        let bytes = self.read_raw_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| RecoveryError::InvalidData {
            offset,
            reason: format!("string is not UTF-8: {}", e),
        })
    }

    /// Reads a count and rejects counts that could not possibly fit in the
    /// rest of the file (every element takes at least one byte).
    pub fn read_count(&mut self) -> Result<u64, RecoveryError> {
        let offset = self.position;
        let count = self.read_uint()?;
        if count > self.len.saturating_sub(self.position) {
            return Err(RecoveryError::InvalidData {
                offset,
                reason: format!("count {} exceeds the remaining file size", count),
            });
        }
        Ok(count)
    }

    pub fn read_property_value(&mut self) -> Result<PropertyValue, RecoveryError> {
        self.read_property_value_at_depth(0)
    }

    fn read_property_value_at_depth(&mut self, depth: usize) -> Result<PropertyValue, RecoveryError> {
        let offset = self.position;
        if depth > MAX_VALUE_DEPTH {
            return Err(RecoveryError::InvalidData {
                offset,
                reason: "property value nested too deeply".to_string(),
            });
        }
        let byte = self.read_marker()?;
        let value = match Marker::from_byte(byte) {
            Some(Marker::TypeNull) => PropertyValue::Null,
            Some(Marker::TypeBool) => PropertyValue::Bool(self.read_bool_payload()?),
            Some(Marker::TypeInt) => PropertyValue::Int(self.read_raw_u64()? as i64),
            Some(Marker::TypeDouble) => PropertyValue::Double(f64::from_bits(self.read_raw_u64()?)),
            Some(Marker::TypeString) => PropertyValue::String(self.read_string_payload()?),
            Some(Marker::TypeList) => {
                let len = self.read_raw_u64()?;
                let mut items = Vec::new();
                for _ in 0..len {
                    items.push(self.read_property_value_at_depth(depth + 1)?);
                }
                PropertyValue::List(items)
            }
            Some(Marker::TypeMap) => {
                let len = self.read_raw_u64()?;
                let mut entries = BTreeMap::new();
                for _ in 0..len {
                    let key = self.read_string()?;
                    entries.insert(key, self.read_property_value_at_depth(depth + 1)?);
                }
                PropertyValue::Map(entries)
            }
            Some(Marker::TypeEnum) => {
                let type_id = EnumTypeId(self.read_raw_u64()?);
                PropertyValue::Enum(type_id, EnumValueId(self.read_raw_u64()?))
            }
            _ => {
                return Err(RecoveryError::InvalidData {
                    offset,
                    reason: format!("{:#04x} is not a property value marker", byte),
                });
            }
        };
        Ok(value)
    }
}
