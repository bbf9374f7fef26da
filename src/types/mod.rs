//! Primitive, array, and complex data types.
//!
//! Types are looked up by name through a [TypeRegistry]:
//!
//! ```
//! use gds::types::TypeRegistry;
//! use gds::Value;
//!
//! let registry = TypeRegistry::default();
//! let u16 = registry.get("MSB_U16").unwrap();
//! assert_eq!(u16.encode(&Value::Int(0x1234)).unwrap(), vec![0x12, 0x34]);
//!
//! let arr = registry.get("U8[4]").unwrap();
//! assert_eq!(arr.nbytes(), 4);
//! ```
mod array;
mod complex;
mod primitive;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use tracing::debug;

use crate::{Error, Result, Value};

pub use array::ArrayType;
pub use complex::{CmdType, DictionaryBinding, EvrType, TimeKind, TimeType, GPS_EPOCH_UNIX};
pub use primitive::{ByteOrder, PrimitiveKind, PrimitiveType};

/// Behavior shared by every type that can appear in a field or column definition.
///
/// Custom types implement this trait and are added with [TypeRegistry::register].
pub trait DataType: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Number of bytes occupied by an encoded value.
    fn nbytes(&self) -> usize;

    fn nbits(&self) -> usize {
        self.nbytes() * 8
    }

    /// Encode `value` into exactly [nbytes](DataType::nbytes) bytes.
    ///
    /// # Errors
    /// [Error::TypeMismatch] if the value is of the wrong kind, [Error::OutOfRange] if it
    /// cannot be represented.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode a value from the start of `bytes`. `raw` only matters for types that resolve
    /// their decoded number into something else.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `bytes` is shorter than the type.
    fn decode(&self, bytes: &[u8], raw: bool) -> Result<Value>;

    /// Check `value` against this type, appending one message per problem. `prefix`, when
    /// given, replaces the leading word of each message.
    fn validate(&self, _value: &Value, _messages: &mut Vec<String>, _prefix: Option<&str>) -> bool {
        true
    }

    fn as_primitive(&self) -> Option<&PrimitiveType> {
        None
    }

    fn as_array(&self) -> Option<&ArrayType> {
        None
    }

    fn as_time(&self) -> Option<&TimeType> {
        None
    }
}

/// Named collection of types.
///
/// Lookup order is primitive names, then complex names (`CMD16`, `EVR16`, `TIME*`), then
/// registered custom types, and finally the `BASE[N]` array syntax.
#[derive(Debug)]
pub struct TypeRegistry {
    primitives: HashMap<String, Arc<PrimitiveType>>,
    complex: HashMap<String, Arc<dyn DataType>>,
    custom: HashMap<String, Arc<dyn DataType>>,
    cmd: Arc<CmdType>,
    evr: Arc<EvrType>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let primitives = PrimitiveType::NAMES
            .iter()
            .filter_map(|name| PrimitiveType::parse(name))
            .map(|t| (t.name().to_string(), Arc::new(t)))
            .collect();

        let cmd = Arc::new(CmdType::default());
        let evr = Arc::new(EvrType::default());
        let mut complex: HashMap<String, Arc<dyn DataType>> = HashMap::default();
        complex.insert(cmd.name().to_string(), cmd.clone());
        complex.insert(evr.name().to_string(), evr.clone());
        for kind in [TimeKind::Time8, TimeKind::Time32, TimeKind::Time40, TimeKind::Time64] {
            let t = TimeType::new(kind);
            complex.insert(t.name().to_string(), Arc::new(t));
        }

        Self {
            primitives,
            complex,
            custom: HashMap::default(),
            cmd,
            evr,
        }
    }
}

impl TypeRegistry {
    /// Add a user supplied type. Built-in names cannot be replaced.
    ///
    /// # Errors
    /// [Error::Schema] if the name collides with a built-in type.
    pub fn register(&mut self, dtype: Arc<dyn DataType>) -> Result<()> {
        let name = dtype.name().to_string();
        if self.primitives.contains_key(&name) || self.complex.contains_key(&name) {
            return Err(Error::Schema(format!(
                "cannot replace built-in type {name}"
            )));
        }
        debug!(name = %name, "registered custom type");
        self.custom.insert(name, dtype);
        Ok(())
    }

    /// Look up a primitive type by name, including on-demand `S<n>` string types.
    #[must_use]
    pub fn primitive(&self, name: &str) -> Option<Arc<PrimitiveType>> {
        if let Some(t) = self.primitives.get(name) {
            return Some(t.clone());
        }
        PrimitiveType::parse(name).map(Arc::new)
    }

    /// Resolve `name` to a type.
    ///
    /// # Errors
    /// [Error::InvalidArraySpec] if `name` uses array syntax with a bad element count or
    /// element type, [Error::UnknownType] if nothing matches.
    pub fn get(&self, name: &str) -> Result<Arc<dyn DataType>> {
        let name = name.trim();
        if let Some(t) = self.primitive(name) {
            return Ok(t);
        }
        if let Some(t) = self.complex.get(name) {
            return Ok(t.clone());
        }
        if let Some(t) = self.custom.get(name) {
            return Ok(t.clone());
        }
        if let Some((base, nelems)) = ArrayType::parse(name)? {
            let elem = self.get(base).map_err(|_| {
                Error::InvalidArraySpec(format!("unknown element type in {name}"))
            })?;
            if elem.as_array().is_some() {
                return Err(Error::InvalidArraySpec(format!(
                    "nested arrays are not supported: {name}"
                )));
            }
            return Ok(Arc::new(ArrayType::new(elem, nelems)));
        }
        Err(Error::UnknownType(name.to_string()))
    }

    /// The shared `CMD16` type, used to bind its command dictionary.
    #[must_use]
    pub fn cmd_type(&self) -> &Arc<CmdType> {
        &self.cmd
    }

    /// The shared `EVR16` type, used to bind its EVR dictionary.
    #[must_use]
    pub fn evr_type(&self) -> &Arc<EvrType> {
        &self.evr
    }
}
