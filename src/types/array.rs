use std::ops::Range;
use std::sync::Arc;

use crate::{Error, Result, Value};

use super::DataType;

/// Fixed count of elements of a single type, e.g., `MSB_U16[32]`.
#[derive(Debug, Clone)]
pub struct ArrayType {
    name: String,
    elem: Arc<dyn DataType>,
    nelems: usize,
}

impl ArrayType {
    pub fn new(elem: Arc<dyn DataType>, nelems: usize) -> Self {
        Self {
            name: format!("{}[{nelems}]", elem.name()),
            elem,
            nelems,
        }
    }

    /// Split `BASE[N]` into the base type name and element count. Returns `None` if `name`
    /// does not use array syntax.
    ///
    /// # Errors
    /// [Error::InvalidArraySpec] if the brackets do not hold an integer greater than zero.
    pub fn parse(name: &str) -> Result<Option<(&str, usize)>> {
        let Some(start) = name.find('[') else {
            return Ok(None);
        };
        let Some(stop) = name[start..].find(']').map(|i| i + start) else {
            return Err(Error::InvalidArraySpec(format!("unterminated brackets in {name}")));
        };
        if stop + 1 != name.len() || start == 0 {
            return Err(Error::InvalidArraySpec(name.to_string()));
        }
        match name[start + 1..stop].trim().parse::<i64>() {
            Ok(n) if n > 0 => Ok(Some((&name[..start], n as usize))),
            _ => Err(Error::InvalidArraySpec(format!(
                "{name} must have an integer greater than zero in square brackets"
            ))),
        }
    }

    #[must_use]
    pub fn nelems(&self) -> usize {
        self.nelems
    }

    #[must_use]
    pub fn elem(&self) -> &Arc<dyn DataType> {
        &self.elem
    }

    /// True for arrays of single byte integers, which table text may hold as literal bytes.
    #[must_use]
    pub fn is_bytes(&self) -> bool {
        self.elem
            .as_primitive()
            .is_some_and(|p| p.is_integer() && p.nbytes() == 1)
    }

    /// Decode the element at `index` from bytes holding the entire array.
    ///
    /// # Errors
    /// [Error::OutOfRange] if `index` is not less than the element count,
    /// [Error::NotEnoughData] if `bytes` does not reach the element.
    pub fn decode_elem(&self, bytes: &[u8], index: usize, raw: bool) -> Result<Value> {
        if index >= self.nelems {
            return Err(Error::OutOfRange(format!(
                "index {index} out of range for {}",
                self.name
            )));
        }
        let width = self.elem.nbytes();
        let start = index * width;
        let stop = start + width;
        if stop > bytes.len() {
            return Err(Error::NotEnoughData {
                actual: bytes.len(),
                minimum: stop,
            });
        }
        self.elem.decode(&bytes[start..stop], raw)
    }

    /// Decode a contiguous run of elements.
    ///
    /// # Errors
    /// See [decode_elem](Self::decode_elem).
    pub fn decode_range(&self, bytes: &[u8], range: Range<usize>, raw: bool) -> Result<Value> {
        range
            .map(|i| self.decode_elem(bytes, i, raw))
            .collect::<Result<Vec<_>>>()
            .map(Value::List)
    }
}

impl DataType for ArrayType {
    fn name(&self) -> &str {
        &self.name
    }

    fn nbytes(&self) -> usize {
        self.nelems * self.elem.nbytes()
    }

    fn nbits(&self) -> usize {
        self.nelems * self.elem.nbits()
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let Value::List(items) = value else {
            return Err(Error::TypeMismatch {
                type_name: self.name.clone(),
                expected: format!("list of {} values", self.nelems),
                got: value.kind().to_string(),
            });
        };
        if items.len() != self.nelems {
            return Err(Error::TypeMismatch {
                type_name: self.name.clone(),
                expected: format!("list of {} values", self.nelems),
                got: format!("list of {} values", items.len()),
            });
        }
        let mut buf = Vec::with_capacity(self.nbytes());
        for item in items {
            buf.extend(self.elem.encode(item)?);
        }
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8], raw: bool) -> Result<Value> {
        self.decode_range(bytes, 0..self.nelems, raw)
    }

    fn validate(&self, value: &Value, messages: &mut Vec<String>, prefix: Option<&str>) -> bool {
        match value {
            Value::List(items) if items.len() == self.nelems => items
                .iter()
                .fold(true, |ok, v| self.elem.validate(v, messages, prefix) && ok),
            _ => {
                let name = prefix.unwrap_or("Value");
                messages.push(format!(
                    "{name} '{value}' is not a list of {} values.",
                    self.nelems
                ));
                false
            }
        }
    }

    fn as_array(&self) -> Option<&ArrayType> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveType;

    fn u16_array(n: usize) -> ArrayType {
        ArrayType::new(Arc::new(PrimitiveType::parse("MSB_U16").unwrap()), n)
    }

    #[test]
    fn parse() {
        assert_eq!(ArrayType::parse("MSB_U16[32]").unwrap(), Some(("MSB_U16", 32)));
        assert_eq!(ArrayType::parse("MSB_U16").unwrap(), None);
        assert!(ArrayType::parse("MSB_U16[32").is_err());
        assert!(ArrayType::parse("MSB_U16[0]").is_err());
    }

    #[test]
    fn decode_elements() {
        let arr = u16_array(3);
        let bytes = [0, 1, 0, 2, 0, 3];
        assert_eq!(arr.decode_elem(&bytes, 1, false).unwrap(), Value::Int(2));
        assert_eq!(
            arr.decode_range(&bytes, 1..3, false).unwrap(),
            Value::List(vec![Value::Int(2), Value::Int(3)])
        );
        assert!(matches!(
            arr.decode_elem(&bytes, 3, false),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn encode_requires_all_elements() {
        let arr = u16_array(2);
        let ok = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(arr.encode(&ok).unwrap(), vec![0, 1, 0, 2]);
        assert!(arr.encode(&Value::List(vec![Value::Int(1)])).is_err());
    }
}
