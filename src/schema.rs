//! JSON schema input.
//!
//! A schema file holds any mix of packets, commands, EVRs, and tables:
//!
//! ```json
//! {
//!   "packets": [
//!     {
//!       "name": "HS",
//!       "apid": 42,
//!       "fields": [
//!         {"name": "volt", "type": "MSB_U16", "bytes": [0, 1], "dntoeu": {"equation": "raw.volt / 10.0", "units": "V"}},
//!         {"name": "mode", "type": "U8", "enum": {"0": "SAFE", "1": "SCIENCE"}}
//!       ]
//!     }
//!   ],
//!   "commands": [
//!     {"name": "NOOP", "opcode": 1, "arguments": []}
//!   ]
//! }
//! ```
//!
//! Types are resolved through a [TypeRegistry] when the schema is built, so custom types
//! must be registered first.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::ccsds::CcsdsDefinition;
use crate::cmd::{CommandDefinition, CommandDictionary};
use crate::evr::{EvrDefinition, EvrDictionary};
use crate::expr::{DnToEu, Expression, FunctionTable, PacketFunction};
use crate::field::{ByteSpec, Enumeration, FieldDefinition, MAX_BYTE_POS};
use crate::packet::{Apid, PacketDefinition, PacketDictionary};
use crate::table::{TableDefinition, TableDictionary};
use crate::types::TypeRegistry;
use crate::{Error, Result, Value};

/// Byte position as written in a schema: `3`, `[0, 1]`, or `"@prev"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BytesSchema {
    Single(usize),
    Range([usize; 2]),
    Directive(String),
}

impl TryFrom<&BytesSchema> for ByteSpec {
    type Error = Error;

    fn try_from(value: &BytesSchema) -> Result<Self> {
        match value {
            BytesSchema::Single(b) | BytesSchema::Range([_, b]) if *b > MAX_BYTE_POS => Err(
                Error::Schema(format!("byte position {b} is past {MAX_BYTE_POS}")),
            ),
            BytesSchema::Single(b) => Ok(ByteSpec::Single(*b)),
            BytesSchema::Range([a, b]) => Ok(ByteSpec::Range(*a, *b)),
            BytesSchema::Directive(d) if d == "@prev" => Ok(ByteSpec::Prev),
            BytesSchema::Directive(d) => Err(Error::Schema(format!("invalid bytes value '{d}'"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnToEuSchema {
    pub equation: String,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
}

/// A packet field, command argument, or table column.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: String,
    #[serde(default)]
    pub bytes: Option<BytesSchema>,
    #[serde(default)]
    pub mask: Option<u64>,
    /// Code to name. JSON object keys are the decimal codes.
    #[serde(default, rename = "enum")]
    pub enumeration: Option<BTreeMap<i64, String>>,
    #[serde(default)]
    pub range: Option<[f64; 2]>,
    #[serde(default)]
    pub dntoeu: Option<DnToEuSchema>,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    /// Fixed value for command arguments.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
}

pub type ColumnSchema = FieldSchema;

impl FieldSchema {
    /// # Errors
    /// [Error::UnknownType] or [Error::InvalidArraySpec] for the type name, [Error::Schema]
    /// for a bad byte position or enumeration, [Error::Expression] for expressions that do
    /// not compile.
    pub fn build(&self, registry: &TypeRegistry) -> Result<FieldDefinition> {
        let compile = |src: &Option<String>| src.as_deref().map(Expression::compile).transpose();
        let dntoeu = match &self.dntoeu {
            Some(d) => {
                let mut conv = DnToEu::new(&d.equation)?;
                if let Some(units) = &d.units {
                    conv = conv.with_units(units);
                }
                if let Some(when) = &d.when {
                    conv = conv.with_when(when)?;
                }
                Some(conv)
            }
            None => None,
        };

        Ok(FieldDefinition {
            name: self.name.clone(),
            dtype: registry.get(&self.dtype)?,
            bytes: self
                .bytes
                .as_ref()
                .map(ByteSpec::try_from)
                .transpose()?
                .unwrap_or_default(),
            mask: self.mask,
            enumeration: self
                .enumeration
                .as_ref()
                .map(|e| Enumeration::new(e.iter().map(|(c, n)| (i128::from(*c), n.clone()))))
                .transpose()?,
            range: self.range.map(|[lo, hi]| (lo, hi)),
            dntoeu,
            expr: compile(&self.expr)?,
            when: compile(&self.when)?,
            value: self.value.as_ref().map(Value::try_from).transpose()?,
            units: self.units.clone(),
            desc: self.desc.clone(),
        })
    }
}

fn build_fields(fields: &[FieldSchema], registry: &TypeRegistry) -> Result<Vec<FieldDefinition>> {
    fields.iter().map(|f| f.build(registry)).collect()
}

/// A packet function body: one expression, or `[condition, expression]` branches.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FunctionSchema {
    Expr(String),
    Branches(Vec<(String, String)>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacketSchema {
    pub name: String,
    #[serde(default)]
    pub apid: Option<Apid>,
    #[serde(default)]
    pub desc: Option<String>,
    pub fields: Vec<FieldSchema>,
    /// Names of fields whose last value is remembered across packets.
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub constants: BTreeMap<String, serde_json::Value>,
    /// Keyed by signature, e.g. `"scale(dn)"`.
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionSchema>,
    /// Make the math function set available to expressions.
    #[serde(default)]
    pub math: bool,
    #[serde(default)]
    pub ccsds: Option<CcsdsDefinition>,
}

impl PacketSchema {
    /// # Errors
    /// Any error building the fields, constants, or functions, or from
    /// [PacketDefinition::new].
    pub fn build(&self, registry: &TypeRegistry) -> Result<PacketDefinition> {
        let mut defn = PacketDefinition::new(&self.name, build_fields(&self.fields, registry)?)?;
        if let Some(apid) = self.apid {
            defn = defn.with_apid(apid);
        }
        if let Some(desc) = &self.desc {
            defn = defn.with_desc(desc);
        }
        if let Some(ccsds) = self.ccsds {
            defn = defn.with_ccsds(ccsds);
        }
        if !self.history.is_empty() {
            defn = defn.with_history(&self.history)?;
        }
        if self.math {
            defn = defn.with_function_table(FunctionTable::default().with_math());
        }

        let constants = self
            .constants
            .iter()
            .map(|(k, v)| Ok((k.clone(), Value::try_from(v)?)))
            .collect::<Result<Vec<(String, Value)>>>()?;
        let functions = self
            .functions
            .iter()
            .map(|(sig, body)| match body {
                FunctionSchema::Expr(e) => PacketFunction::new(sig, e),
                FunctionSchema::Branches(b) => PacketFunction::with_branches(sig, b.iter().cloned()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(defn.with_constants(constants).with_functions(functions))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSchema {
    pub name: String,
    pub opcode: u16,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub arguments: Vec<FieldSchema>,
    #[serde(default)]
    pub ccsds: Option<CcsdsDefinition>,
}

impl CommandSchema {
    /// # Errors
    /// Any error building the arguments or from [CommandDefinition::new].
    pub fn build(&self, registry: &TypeRegistry) -> Result<CommandDefinition> {
        let mut defn = CommandDefinition::new(
            &self.name,
            self.opcode,
            build_fields(&self.arguments, registry)?,
        )?;
        if let Some(subsystem) = &self.subsystem {
            defn = defn.with_subsystem(subsystem);
        }
        if let Some(title) = &self.title {
            defn = defn.with_title(title);
        }
        if let Some(desc) = &self.desc {
            defn = defn.with_desc(desc);
        }
        if let Some(ccsds) = self.ccsds {
            defn = defn.with_ccsds(ccsds);
        }
        Ok(defn)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvrSchema {
    pub name: String,
    pub code: u16,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl EvrSchema {
    #[must_use]
    pub fn build(&self) -> EvrDefinition {
        let defn = EvrDefinition::new(&self.name, self.code, &self.message);
        match &self.desc {
            Some(desc) => defn.with_desc(desc),
            None => defn,
        }
    }
}

fn default_delimiter() -> String {
    ",".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub desc: Option<String>,
    /// Upper bound on the encoded length.
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub header: Vec<ColumnSchema>,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// # Errors
    /// Any error building the columns or from [TableDefinition::new].
    pub fn build(&self, registry: &TypeRegistry) -> Result<TableDefinition> {
        let mut defn = TableDefinition::new(
            &self.name,
            build_fields(&self.header, registry)?,
            build_fields(&self.columns, registry)?,
        )?
        .with_delimiter(&self.delimiter);
        if let Some(desc) = &self.desc {
            defn = defn.with_desc(desc);
        }
        if let Some(size) = self.size {
            defn = defn.with_size(size);
        }
        Ok(defn)
    }
}

/// Top level schema document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub packets: Vec<PacketSchema>,
    #[serde(default)]
    pub commands: Vec<CommandSchema>,
    #[serde(default)]
    pub evrs: Vec<EvrSchema>,
    #[serde(default)]
    pub tables: Vec<TableSchema>,
}

/// Everything built from one [Schema].
#[derive(Debug, Default)]
pub struct Dictionaries {
    pub packets: PacketDictionary,
    pub commands: Arc<CommandDictionary>,
    pub evrs: Arc<EvrDictionary>,
    pub tables: TableDictionary,
}

impl Schema {
    /// # Errors
    /// [Error::Json] if `json` is not a valid schema document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// # Errors
    /// [Error::Io] if the file cannot be read, [Error::Json] if it is not a valid schema.
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let schema: Self = serde_json::from_reader(reader)?;
        debug!(path = %path.as_ref().display(), "loaded schema");
        Ok(schema)
    }

    /// Build every definition. The command and EVR dictionaries are bound to the registry's
    /// `CMD16` and `EVR16` types unless those are already bound.
    ///
    /// # Errors
    /// The first error building any definition, or a duplicate name or code.
    pub fn build(&self, registry: &TypeRegistry) -> Result<Dictionaries> {
        let mut evrs = EvrDictionary::default();
        for evr in &self.evrs {
            evrs.add(evr.build())?;
        }
        let mut commands = CommandDictionary::default();
        for cmd in &self.commands {
            commands.add(cmd.build(registry)?)?;
        }
        let mut packets = PacketDictionary::default();
        for pkt in &self.packets {
            packets.add(pkt.build(registry)?)?;
        }
        let mut tables = TableDictionary::default();
        for table in &self.tables {
            tables.add(table.build(registry)?)?;
        }

        let commands = Arc::new(commands);
        let evrs = Arc::new(evrs);
        if !registry.cmd_type().dictionary().is_bound() {
            registry.cmd_type().bind(commands.clone())?;
        }
        if !registry.evr_type().dictionary().is_bound() {
            registry.evr_type().bind(evrs.clone())?;
        }
        debug!(
            packets = packets.len(),
            commands = commands.len(),
            evrs = evrs.len(),
            tables = tables.len(),
            "built dictionaries"
        );
        Ok(Dictionaries {
            packets,
            commands,
            evrs,
            tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"{
      "packets": [
        {
          "name": "HS",
          "apid": 42,
          "history": ["mode"],
          "constants": {"OFFSET": 10},
          "functions": {
            "clip(x)": [["x > 100", "100"], ["x <= 100", "x"]]
          },
          "fields": [
            {"name": "volt", "type": "MSB_U16", "bytes": [0, 1],
             "dntoeu": {"equation": "clip(raw.volt) + OFFSET", "units": "V"}},
            {"name": "mode", "type": "U8", "mask": 240, "enum": {"0": "SAFE", "1": "SCIENCE"}},
            {"name": "flag", "type": "U8", "bytes": "@prev", "mask": 15}
          ]
        }
      ],
      "commands": [
        {"name": "SET_MODE", "opcode": 258, "arguments": [
          {"name": "mode", "type": "U8", "enum": {"0": "SAFE", "1": "SCIENCE"}},
          {"name": "spare", "type": "U8", "value": 0}
        ]}
      ],
      "evrs": [{"name": "BOOT", "code": 1, "message": "booted %u times"}],
      "tables": [
        {"name": "limits", "size": 64, "columns": [
          {"name": "lo", "type": "MSB_I16"}, {"name": "hi", "type": "MSB_I16"}
        ]}
      ]
    }"#;

    #[test]
    fn builds_every_section() {
        let registry = TypeRegistry::default();
        let dicts = Schema::from_json(SCHEMA).unwrap().build(&registry).unwrap();

        let hs = dicts.packets.get_apid(42).unwrap();
        assert_eq!(hs.nbytes(), 3);
        assert_eq!(hs.field("flag").unwrap().bytes(), ByteSpec::Range(2, 2));

        let pkt = dicts.packets.create("HS", &[0x00, 0xC8, 0x1F]).unwrap();
        assert_eq!(pkt.get("volt").unwrap(), Some(Value::Int(110)));
        assert_eq!(pkt.get("mode").unwrap(), Some(Value::from("SCIENCE")));
        assert_eq!(pkt.get("flag").unwrap(), Some(Value::Int(15)));

        let cmd = dicts.commands.create("SET_MODE", vec![Value::from("SCIENCE")]).unwrap();
        assert_eq!(cmd.encode(0).unwrap(), [0x01, 0x02, 0x02, 0x01, 0x00]);

        assert_eq!(dicts.evrs.get_code(1).unwrap().name(), "BOOT");
        assert_eq!(dicts.tables.get("limits").unwrap().size(), Some(64));
        assert!(registry.cmd_type().dictionary().is_bound());
    }

    #[test]
    fn bad_bytes_directive() {
        let json = r#"{"packets": [{"name": "P", "fields": [
            {"name": "a", "type": "U8", "bytes": "@next"}
        ]}]}"#;
        let err = Schema::from_json(json)
            .unwrap()
            .build(&TypeRegistry::default())
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)), "{err}");
    }

    #[test]
    fn huge_byte_position() {
        let json = r#"{"packets": [{"name": "P", "fields": [
            {"name": "a", "type": "U8", "bytes": [0, 18446744073709551615]}
        ]}]}"#;
        let err = Schema::from_json(json)
            .unwrap()
            .build(&TypeRegistry::default())
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)), "{err}");
    }

    #[test]
    fn unknown_type() {
        let json = r#"{"packets": [{"name": "P", "fields": [{"name": "a", "type": "U7"}]}]}"#;
        let err = Schema::from_json(json)
            .unwrap()
            .build(&TypeRegistry::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownType(_)));
    }

    #[test]
    fn duplicate_enum_names() {
        let json = r#"{"tables": [{"name": "T", "columns": [
            {"name": "c", "type": "U8", "enum": {"0": "A", "1": "A"}}
        ]}]}"#;
        let err = Schema::from_json(json)
            .unwrap()
            .build(&TypeRegistry::default())
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn invalid_json() {
        assert!(matches!(Schema::from_json("{"), Err(Error::Json(_))));
    }
}
