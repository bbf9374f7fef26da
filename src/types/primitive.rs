use crate::{Error, Result, Value};

use super::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first.
    Msb,
    /// Least significant byte first.
    Lsb,
    /// Single byte and string types.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Signed,
    Unsigned,
    Float,
    Str,
}

/// Fixed width numeric or string type such as `MSB_U16`, `LSB_F32`, or `S16`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveType {
    name: String,
    order: ByteOrder,
    kind: PrimitiveKind,
    nbits: usize,
}

impl PrimitiveType {
    /// Every fixed-name primitive. `S<n>` string types are created on demand.
    pub const NAMES: [&'static str; 18] = [
        "I8", "U8", "LSB_I16", "MSB_I16", "LSB_U16", "MSB_U16", "LSB_I32", "MSB_I32", "LSB_U32",
        "MSB_U32", "LSB_I64", "MSB_I64", "LSB_U64", "MSB_U64", "LSB_F32", "MSB_F32", "LSB_D64",
        "MSB_D64",
    ];

    /// Parse a primitive type name, returning `None` for anything that is not one.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let (order, rest) = if let Some(rest) = name.strip_prefix("MSB_") {
            (ByteOrder::Msb, rest)
        } else if let Some(rest) = name.strip_prefix("LSB_") {
            (ByteOrder::Lsb, rest)
        } else {
            (ByteOrder::None, name)
        };

        let (kind, nbits) = match (order, rest) {
            (ByteOrder::None, "I8") => (PrimitiveKind::Signed, 8),
            (ByteOrder::None, "U8") => (PrimitiveKind::Unsigned, 8),
            (ByteOrder::None, s) if s.starts_with('S') => {
                let n: usize = s[1..].parse().ok()?;
                if n == 0 {
                    return None;
                }
                (PrimitiveKind::Str, n * 8)
            }
            (ByteOrder::None, _) => return None,
            (_, "I16") => (PrimitiveKind::Signed, 16),
            (_, "U16") => (PrimitiveKind::Unsigned, 16),
            (_, "I32") => (PrimitiveKind::Signed, 32),
            (_, "U32") => (PrimitiveKind::Unsigned, 32),
            (_, "I64") => (PrimitiveKind::Signed, 64),
            (_, "U64") => (PrimitiveKind::Unsigned, 64),
            (_, "F32") => (PrimitiveKind::Float, 32),
            (_, "D64") => (PrimitiveKind::Float, 64),
            _ => return None,
        };

        Some(Self {
            name: name.to_string(),
            order,
            kind,
            nbits,
        })
    }

    #[must_use]
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    #[must_use]
    pub fn kind(&self) -> PrimitiveKind {
        self.kind
    }

    #[must_use]
    pub fn is_float(&self) -> bool {
        self.kind == PrimitiveKind::Float
    }

    #[must_use]
    pub fn is_string(&self) -> bool {
        self.kind == PrimitiveKind::Str
    }

    #[must_use]
    pub fn is_integer(&self) -> bool {
        matches!(self.kind, PrimitiveKind::Signed | PrimitiveKind::Unsigned)
    }

    /// Inclusive integer bounds, `None` for float and string types.
    #[must_use]
    pub fn int_range(&self) -> Option<(i128, i128)> {
        match self.kind {
            PrimitiveKind::Signed => {
                let max = (1i128 << (self.nbits - 1)) - 1;
                Some((-max - 1, max))
            }
            PrimitiveKind::Unsigned => Some((0, (1i128 << self.nbits) - 1)),
            _ => None,
        }
    }

    /// Numeric bounds as floats. Float types use the representable range of their width.
    #[must_use]
    pub fn range(&self) -> Option<(f64, f64)> {
        match self.kind {
            PrimitiveKind::Float if self.nbits == 32 => {
                Some((f64::from(f32::MIN), f64::from(f32::MAX)))
            }
            PrimitiveKind::Float => Some((f64::MIN, f64::MAX)),
            PrimitiveKind::Str => None,
            _ => self.int_range().map(|(lo, hi)| (lo as f64, hi as f64)),
        }
    }

    fn mismatch(&self, expected: &str, value: &Value) -> Error {
        Error::TypeMismatch {
            type_name: self.name.clone(),
            expected: expected.to_string(),
            got: value.kind().to_string(),
        }
    }

    fn pack_u64(&self, raw: u64) -> Vec<u8> {
        let nbytes = self.nbytes();
        match self.order {
            ByteOrder::Lsb => raw.to_le_bytes()[..nbytes].to_vec(),
            _ => raw.to_be_bytes()[8 - nbytes..].to_vec(),
        }
    }

    fn unpack_u64(&self, bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        match self.order {
            ByteOrder::Lsb => {
                buf[..bytes.len()].copy_from_slice(bytes);
                u64::from_le_bytes(buf)
            }
            _ => {
                buf[8 - bytes.len()..].copy_from_slice(bytes);
                u64::from_be_bytes(buf)
            }
        }
    }
}

impl DataType for PrimitiveType {
    fn name(&self) -> &str {
        &self.name
    }

    fn nbytes(&self) -> usize {
        self.nbits / 8
    }

    fn nbits(&self) -> usize {
        self.nbits
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match self.kind {
            PrimitiveKind::Str => {
                let s = value.as_str().ok_or_else(|| self.mismatch("string", value))?;
                let mut buf = s.as_bytes().to_vec();
                buf.resize(self.nbytes(), 0);
                Ok(buf)
            }
            PrimitiveKind::Float => {
                let v = value.as_f64().ok_or_else(|| self.mismatch("number", value))?;
                Ok(match (self.nbits, self.order) {
                    (32, ByteOrder::Lsb) => (v as f32).to_le_bytes().to_vec(),
                    (32, _) => (v as f32).to_be_bytes().to_vec(),
                    (_, ByteOrder::Lsb) => v.to_le_bytes().to_vec(),
                    _ => v.to_be_bytes().to_vec(),
                })
            }
            PrimitiveKind::Signed | PrimitiveKind::Unsigned => {
                let v = value.as_i128().ok_or_else(|| self.mismatch("integer", value))?;
                let (lo, hi) = self.int_range().unwrap_or((i128::MIN, i128::MAX));
                if v < lo || v > hi {
                    return Err(Error::OutOfRange(format!(
                        "Value '{v}' out of range [{lo}, {hi}]."
                    )));
                }
                // low 64 bits carry the two's complement encoding
                Ok(self.pack_u64(v as u64))
            }
        }
    }

    fn decode(&self, bytes: &[u8], _raw: bool) -> Result<Value> {
        let nbytes = self.nbytes();
        if bytes.len() < nbytes {
            return Err(Error::NotEnoughData {
                actual: bytes.len(),
                minimum: nbytes,
            });
        }
        let bytes = &bytes[..nbytes];

        Ok(match self.kind {
            PrimitiveKind::Str => {
                let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
                Value::Str(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            PrimitiveKind::Float if self.nbits == 32 => {
                let arr = [bytes[0], bytes[1], bytes[2], bytes[3]];
                let v = match self.order {
                    ByteOrder::Lsb => f32::from_le_bytes(arr),
                    _ => f32::from_be_bytes(arr),
                };
                Value::Float(f64::from(v))
            }
            PrimitiveKind::Float => {
                let raw = self.unpack_u64(bytes);
                Value::Float(f64::from_bits(raw))
            }
            PrimitiveKind::Unsigned => Value::Int(i128::from(self.unpack_u64(bytes))),
            PrimitiveKind::Signed => {
                let shift = 64 - self.nbits;
                let v = ((self.unpack_u64(bytes) << shift) as i64) >> shift;
                Value::Int(i128::from(v))
            }
        })
    }

    fn validate(&self, value: &Value, messages: &mut Vec<String>, prefix: Option<&str>) -> bool {
        let mut log = |msg: String| {
            let msg = match prefix {
                Some(prefix) => {
                    let mut words = msg.splitn(2, ' ');
                    let first = words.next().unwrap_or_default().to_lowercase();
                    let rest = words.next().unwrap_or_default();
                    format!("{prefix} {first} {rest}")
                }
                None => msg,
            };
            messages.push(msg);
        };

        if self.is_string() {
            if value.as_str().is_none() {
                log(format!("Value '{value}' is not a string."));
                return false;
            }
            return true;
        }

        match value {
            Value::Str(s) => {
                log(format!("String '{s}' cannot be represented as a number."));
                false
            }
            Value::Float(f) if !self.is_float() => {
                log(format!("Float '{f}' cannot be represented as an integer."));
                false
            }
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
                let out_of_range = match self.int_range() {
                    Some((lo, hi)) => value.as_i128().is_some_and(|v| v < lo || v > hi),
                    None => {
                        let (lo, hi) = self.range().unwrap_or((f64::MIN, f64::MAX));
                        value.as_f64().is_some_and(|v| v < lo || v > hi)
                    }
                };
                if out_of_range {
                    let (lo, hi) = match self.int_range() {
                        Some((lo, hi)) => (lo.to_string(), hi.to_string()),
                        None => {
                            let (lo, hi) = self.range().unwrap_or((f64::MIN, f64::MAX));
                            (format!("{lo:e}"), format!("{hi:e}"))
                        }
                    };
                    log(format!("Value '{value}' out of range [{lo}, {hi}]."));
                    return false;
                }
                true
            }
            other => {
                log(format!("Value '{other}' is not a primitive type."));
                false
            }
        }
    }

    fn as_primitive(&self) -> Option<&PrimitiveType> {
        Some(self)
    }
}
