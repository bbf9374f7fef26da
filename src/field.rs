//! Field and argument definitions.
//!
//! A [FieldDefinition] describes where a value lives in a byte buffer, how its bits are
//! masked, and how its raw number maps to a symbolic name. Command arguments and table
//! columns use the same definition.
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::ops::Range;
use std::sync::Arc;

use typed_builder::TypedBuilder;

use crate::expr::{DnToEu, Expression};
use crate::types::DataType;
use crate::{Error, Result, Value};

/// Largest byte position a field may occupy.
pub const MAX_BYTE_POS: usize = 65_535;

/// Position of a field within its buffer, as written in a schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ByteSpec {
    /// Starts immediately after the previous field.
    #[default]
    Unset,
    /// Starts at the given byte and spans the type's width.
    Single(usize),
    /// Inclusive start and end bytes.
    Range(usize, usize),
    /// Starts at the same byte as the previous field, written `@prev` in schemas.
    Prev,
}

impl Display for ByteSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByteSpec::Unset => Ok(()),
            ByteSpec::Single(b) => write!(f, "{b}"),
            ByteSpec::Range(a, b) => write!(f, "[{a}, {b}]"),
            ByteSpec::Prev => write!(f, "@prev"),
        }
    }
}

/// One-to-one mapping between numeric codes and symbolic names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enumeration {
    names: BTreeMap<i128, String>,
    codes: HashMap<String, i128>,
}

impl Enumeration {
    /// # Errors
    /// [Error::Schema] if a code or a name appears more than once.
    pub fn new<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (i128, S)>,
        S: Into<String>,
    {
        let mut names = BTreeMap::default();
        let mut codes = HashMap::default();
        for (code, name) in pairs {
            let name = name.into();
            if names.contains_key(&code) {
                return Err(Error::Schema(format!("duplicate enumeration code {code}")));
            }
            if codes.contains_key(&name) {
                return Err(Error::Schema(format!("duplicate enumeration name {name}")));
            }
            codes.insert(name.clone(), code);
            names.insert(code, name);
        }
        Ok(Self { names, codes })
    }

    #[must_use]
    pub fn name(&self, code: i128) -> Option<&str> {
        self.names.get(&code).map(String::as_str)
    }

    #[must_use]
    pub fn code(&self, name: &str) -> Option<i128> {
        self.codes.get(name).copied()
    }

    /// Pairs in ascending code order.
    pub fn iter(&self) -> impl Iterator<Item = (i128, &str)> {
        self.names.iter().map(|(c, n)| (*c, n.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Definition of a single packet field, command argument, or table column.
///
/// # Example
/// ```
/// use gds::field::{ByteSpec, FieldDefinition};
/// use gds::types::TypeRegistry;
/// use gds::Value;
///
/// let registry = TypeRegistry::default();
/// let apid = FieldDefinition::builder()
///     .name("apid")
///     .dtype(registry.get("MSB_U16").unwrap())
///     .bytes(ByteSpec::Range(0, 1))
///     .mask(0x07ff)
///     .build();
///
/// assert_eq!(apid.decode(&[0x08, 0x2a], false, None).unwrap(), Value::Int(42));
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct FieldDefinition {
    #[builder(setter(into))]
    pub(crate) name: String,
    pub(crate) dtype: Arc<dyn DataType>,
    #[builder(default)]
    pub(crate) bytes: ByteSpec,
    #[builder(default, setter(strip_option))]
    pub(crate) mask: Option<u64>,
    #[builder(default, setter(strip_option))]
    pub(crate) enumeration: Option<Enumeration>,
    /// Inclusive bounds checked by [FieldDefinition::validate].
    #[builder(default, setter(strip_option))]
    pub(crate) range: Option<(f64, f64)>,
    #[builder(default, setter(strip_option))]
    pub(crate) dntoeu: Option<DnToEu>,
    #[builder(default, setter(strip_option))]
    pub(crate) expr: Option<Expression>,
    #[builder(default, setter(strip_option))]
    pub(crate) when: Option<Expression>,
    /// Constant value written on every encode. Fixed arguments are never supplied by callers.
    #[builder(default, setter(strip_option, into))]
    pub(crate) value: Option<Value>,
    #[builder(default, setter(strip_option, into))]
    pub(crate) units: Option<String>,
    #[builder(default, setter(strip_option, into))]
    pub(crate) desc: Option<String>,
}

impl FieldDefinition {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dtype(&self) -> &Arc<dyn DataType> {
        &self.dtype
    }

    #[must_use]
    pub fn bytes(&self) -> ByteSpec {
        self.bytes
    }

    #[must_use]
    pub fn mask(&self) -> Option<u64> {
        self.mask
    }

    /// Left shift implied by the mask's lowest set bit.
    #[must_use]
    pub fn shift(&self) -> u32 {
        self.mask.map_or(0, u64::trailing_zeros)
    }

    #[must_use]
    pub fn enumeration(&self) -> Option<&Enumeration> {
        self.enumeration.as_ref()
    }

    #[must_use]
    pub fn range(&self) -> Option<(f64, f64)> {
        self.range
    }

    #[must_use]
    pub fn dntoeu(&self) -> Option<&DnToEu> {
        self.dntoeu.as_ref()
    }

    #[must_use]
    pub fn expr(&self) -> Option<&Expression> {
        self.expr.as_ref()
    }

    #[must_use]
    pub fn when(&self) -> Option<&Expression> {
        self.when.as_ref()
    }

    #[must_use]
    pub fn fixed(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.value.is_some()
    }

    #[must_use]
    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    #[must_use]
    pub fn desc(&self) -> Option<&str> {
        self.desc.as_deref()
    }

    /// True when reads yield a derived value rather than the decoded bits.
    #[must_use]
    pub fn is_derived(&self) -> bool {
        self.dntoeu.is_some() || self.expr.is_some()
    }

    /// Number of bytes spanned by the field.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.slice(0).len()
    }

    /// Check the definition for problems that would otherwise surface on every encode.
    ///
    /// # Errors
    /// [Error::Schema] describing the first problem found.
    pub fn check(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Schema(format!("field {}: {msg}", self.name)));

        let end = self.slice(0).end;
        if end > MAX_BYTE_POS + 1 {
            return fail(format!("bytes {} end past byte {MAX_BYTE_POS}", self.bytes));
        }

        if let ByteSpec::Range(a, b) = self.bytes {
            if a > b {
                return fail(format!("byte range [{a}, {b}] is reversed"));
            }
            if b - a + 1 < self.dtype.nbytes() {
                return fail(format!(
                    "byte range [{a}, {b}] is narrower than {}",
                    self.dtype.name()
                ));
            }
        }
        if let Some(mask) = self.mask {
            let Some(prim) = self.dtype.as_primitive().filter(|p| p.is_integer()) else {
                return fail(format!("mask requires an integer type, not {}", self.dtype.name()));
            };
            let nbits = prim.nbits();
            if mask == 0 || (nbits < 64 && mask >> nbits != 0) {
                return fail(format!("mask {mask:#x} does not fit {}", prim.name()));
            }
        }
        if let Some((lo, hi)) = self.range {
            if lo > hi {
                return fail(format!("range [{lo}, {hi}] is reversed"));
            }
        }
        if let Some(value) = &self.value {
            self.encode(value)?;
        }
        Ok(())
    }

    /// Byte range of the field, translated by `offset`.
    #[must_use]
    pub fn slice(&self, offset: usize) -> Range<usize> {
        let width = self.dtype.nbytes();
        let (start, stop) = match self.bytes {
            ByteSpec::Unset | ByteSpec::Prev => (offset, offset.saturating_add(width)),
            ByteSpec::Single(b) => {
                let start = b.saturating_add(offset);
                (start, start.saturating_add(width))
            }
            ByteSpec::Range(a, b) => (
                a.saturating_add(offset),
                b.saturating_add(1).saturating_add(offset),
            ),
        };
        start..stop
    }

    /// Decode this field out of a full buffer.
    ///
    /// `index` selects one element of an array field. Masks, shifts, and, unless `raw`,
    /// enumeration names are applied to the decoded value.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if the buffer does not cover the field, or any error from the
    /// underlying type.
    pub fn decode(&self, bytes: &[u8], raw: bool, index: Option<usize>) -> Result<Value> {
        self.decode_at(bytes, 0, raw, index)
    }

    /// Like [decode](Self::decode) but with the field relocated by `offset` bytes.
    ///
    /// # Errors
    /// See [decode](Self::decode).
    pub fn decode_at(
        &self,
        bytes: &[u8],
        offset: usize,
        raw: bool,
        index: Option<usize>,
    ) -> Result<Value> {
        let range = self.slice(offset);
        let Some(data) = bytes.get(range.clone()) else {
            return Err(Error::NotEnoughData {
                actual: bytes.len(),
                minimum: range.end,
            });
        };
        self.decode_slice(data, raw, index)
    }

    /// Decode from bytes that begin at this field's first byte.
    ///
    /// # Errors
    /// See [decode](Self::decode).
    pub fn decode_slice(&self, data: &[u8], raw: bool, index: Option<usize>) -> Result<Value> {
        let mut value = match (self.dtype.as_array(), index) {
            (Some(array), Some(i)) => array.decode_elem(data, i, raw)?,
            _ => self.dtype.decode(data, raw)?,
        };

        if let (Some(mask), Value::Int(v)) = (self.mask, &value) {
            value = Value::Int((v & i128::from(mask)) >> self.shift());
        }

        if !raw {
            if let (Some(e), Value::Int(code)) = (&self.enumeration, &value) {
                if let Some(name) = e.name(*code) {
                    value = Value::Str(name.to_string());
                }
            }
        }
        Ok(value)
    }

    /// Encode `value`, substituting enumeration names and applying the mask shift. The
    /// result is the type's encoding and is not yet masked.
    ///
    /// # Errors
    /// Any error from the underlying type. Masked fields require an integer value.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let substituted;
        let mut value = value;
        if let (Some(e), Value::Str(name)) = (&self.enumeration, value) {
            if let Some(code) = e.code(name) {
                substituted = Value::Int(code);
                value = &substituted;
            }
        }

        if self.mask.is_some() {
            let v = value.as_i128().ok_or_else(|| Error::TypeMismatch {
                type_name: self.dtype.name().to_string(),
                expected: "integer".to_string(),
                got: value.kind().to_string(),
            })?;
            return self.dtype.encode(&Value::Int(v << self.shift()));
        }
        self.dtype.encode(value)
    }

    /// Mask expressed as bytes in the type's encoding, `None` for unmasked fields.
    ///
    /// # Errors
    /// Only if the mask does not fit the type, which [check](Self::check) rejects.
    pub fn mask_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.mask
            .map(|m| self.dtype.encode(&Value::Int(i128::from(m))))
            .transpose()
    }

    /// Encode `value` and merge it into `buf` at this field's bytes (relocated by `offset`)
    /// without disturbing bits outside the mask.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `buf` does not cover the field, or any encode error.
    pub fn write(&self, buf: &mut [u8], offset: usize, value: &Value) -> Result<()> {
        let range = self.slice(offset);
        if range.end > buf.len() {
            return Err(Error::NotEnoughData {
                actual: buf.len(),
                minimum: range.end,
            });
        }
        let encoded = self.encode(value)?;
        let mask = self.mask_bytes()?;
        for (i, (dst, src)) in buf[range].iter_mut().zip(&encoded).enumerate() {
            let m = mask.as_ref().map_or(0xff, |m| m[i]);
            *dst = (*dst & !m) | (src & m);
        }
        Ok(())
    }

    /// Check `value`, appending a message for each failure.
    ///
    /// Enumerated fields accept a known name or a known code. The underlying type's own
    /// checks apply to the numeric value, as does the explicit range.
    pub fn validate(&self, value: &Value, messages: &mut Vec<String>) -> bool {
        let mut valid = true;
        let mut primitive = value.clone();

        if let Some(e) = &self.enumeration {
            let code = match value {
                Value::Str(name) => e.code(name),
                other => other.as_i128().filter(|c| e.name(*c).is_some()),
            };
            match code {
                Some(code) => primitive = Value::Int(code),
                None => {
                    valid = false;
                    messages.push(format!(
                        "{} value '{value}' not in allowed enumerated values.",
                        self.name
                    ));
                }
            }
        }

        if valid && !self.dtype.validate(&primitive, messages, Some(&self.name)) {
            valid = false;
        }

        if let (Some((lo, hi)), Some(v)) = (self.range, primitive.as_f64()) {
            if v < lo || v > hi {
                valid = false;
                messages.push(format!(
                    "{} value '{primitive}' out of range [{lo}, {hi}].",
                    self.name
                ));
            }
        }
        valid
    }
}

/// Assign concrete byte ranges to every field in one left-to-right pass.
///
/// Explicit specs are kept. `Prev` starts at the previous field's start, `Unset` at the
/// previous field's end, and both are rewritten to explicit ranges so a second pass is a
/// no-op. Returns the exclusive end of the last field.
pub fn resolve_layout(fields: &mut [FieldDefinition], start: usize) -> usize {
    let mut pos = start..start;
    for fd in fields.iter_mut() {
        let resolved = match fd.bytes {
            ByteSpec::Prev => Some(fd.slice(pos.start)),
            ByteSpec::Unset => Some(fd.slice(pos.end)),
            _ => None,
        };
        if let Some(r) = resolved {
            fd.bytes = ByteSpec::Range(r.start, r.end.saturating_sub(1));
        }
        pos = fd.slice(0);
    }
    pos.end
}
