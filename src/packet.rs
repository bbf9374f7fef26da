//! Telemetry packet definitions and instances.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use rayon::prelude::*;
use tracing::{debug, trace, warn};

use crate::ccsds::CcsdsDefinition;
use crate::expr::{FunctionTable, PacketFunction, Symbols, MAX_DEPTH};
use crate::field::{resolve_layout, FieldDefinition};
use crate::types::ByteOrder;
use crate::{Error, Result, Value};

pub type Apid = u16;

/// Names with special meaning inside expressions that fields may not use.
pub const RESERVED_NAMES: [&str; 2] = ["raw", "history"];

/// Index of a field within its definition, resolved once by [PacketDefinition::key].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldKey(usize);

/// Last observed values of selected fields, shared by every packet of one definition.
///
/// Updates from one packet are applied under a single write lock, so readers see either
/// all or none of a packet's values.
#[derive(Debug, Default)]
pub struct FieldHistory {
    names: Vec<String>,
    values: RwLock<HashMap<String, Value>>,
}

impl FieldHistory {
    /// Every tracked field starts at `0`.
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let values = names
            .iter()
            .map(|n| (n.clone(), Value::Int(0)))
            .collect();
        Self {
            names,
            values: RwLock::new(values),
        }
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Copy of every tracked value.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn update(&self, snapshot: Vec<(String, Value)>) {
        if snapshot.is_empty() {
            return;
        }
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        for (name, value) in snapshot {
            trace!(field = %name, value = %value, "history update");
            values.insert(name, value);
        }
    }
}

/// Source of field values for [PacketDefinition::validate].
pub trait FieldValues {
    /// Value of `name`, `Ok(None)` when the field does not apply.
    ///
    /// # Errors
    /// If the value cannot be produced.
    fn field_value(&self, name: &str) -> Result<Option<Value>>;
}

impl FieldValues for HashMap<String, Value> {
    fn field_value(&self, name: &str) -> Result<Option<Value>> {
        self.get(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| Error::UnknownField {
                definition: "values".to_string(),
                field: name.to_string(),
            })
    }
}

/// Layout and semantics of one telemetry packet.
#[derive(Debug)]
pub struct PacketDefinition {
    name: String,
    apid: Option<Apid>,
    desc: Option<String>,
    fields: Vec<FieldDefinition>,
    fieldmap: HashMap<String, usize>,
    nbytes: usize,
    history: Arc<FieldHistory>,
    constants: HashMap<String, Value>,
    functions: HashMap<String, PacketFunction>,
    function_table: Option<FunctionTable>,
    ccsds: Option<CcsdsDefinition>,
}

impl PacketDefinition {
    /// Resolve the layout of `fields` and check each of them.
    ///
    /// # Errors
    /// [Error::Schema] for duplicate or reserved field names and for any field that fails
    /// [FieldDefinition::check].
    pub fn new(name: impl Into<String>, mut fields: Vec<FieldDefinition>) -> Result<Self> {
        let name = name.into();
        resolve_layout(&mut fields, 0);

        let mut fieldmap = HashMap::with_capacity(fields.len());
        for (idx, fd) in fields.iter().enumerate() {
            if RESERVED_NAMES.contains(&fd.name()) {
                return Err(Error::Schema(format!(
                    "packet {name}: field name '{}' is reserved",
                    fd.name()
                )));
            }
            fd.check()?;
            if fieldmap.insert(fd.name().to_string(), idx).is_some() {
                return Err(Error::Schema(format!(
                    "packet {name}: duplicate field '{}'",
                    fd.name()
                )));
            }
        }
        warn_overlaps(&name, &fields);

        let nbytes = fields.iter().map(|f| f.slice(0).end).max().unwrap_or(0);
        debug!(packet = %name, nfields = fields.len(), nbytes, "packet definition loaded");

        Ok(Self {
            name,
            apid: None,
            desc: None,
            fields,
            fieldmap,
            nbytes,
            history: Arc::new(FieldHistory::default()),
            constants: HashMap::default(),
            functions: HashMap::default(),
            function_table: None,
            ccsds: None,
        })
    }

    #[must_use]
    pub fn with_apid(mut self, apid: Apid) -> Self {
        self.apid = Some(apid);
        self
    }

    #[must_use]
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    /// Track the last observed value of the named fields.
    ///
    /// # Errors
    /// [Error::UnknownField] if a name is not a field of this packet.
    pub fn with_history<I, S>(mut self, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        for n in &names {
            self.key(n)?;
        }
        self.history = Arc::new(FieldHistory::new(names));
        Ok(self)
    }

    #[must_use]
    pub fn with_constants<I, S, V>(mut self, constants: I) -> Self
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<Value>,
    {
        self.constants
            .extend(constants.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn with_functions<I>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = PacketFunction>,
    {
        self.functions
            .extend(functions.into_iter().map(|f| (f.name().to_string(), f)));
        self
    }

    /// Replace the native functions available to this packet's expressions.
    #[must_use]
    pub fn with_function_table(mut self, table: FunctionTable) -> Self {
        self.function_table = Some(table);
        self
    }

    #[must_use]
    pub fn with_ccsds(mut self, ccsds: CcsdsDefinition) -> Self {
        self.ccsds = Some(ccsds);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Explicit APID, or the APID of the attached CCSDS block.
    #[must_use]
    pub fn apid(&self) -> Option<Apid> {
        self.apid.or_else(|| self.ccsds.map(|c| c.apid))
    }

    #[must_use]
    pub fn desc(&self) -> Option<&str> {
        self.desc.as_deref()
    }

    #[must_use]
    pub fn ccsds(&self) -> Option<&CcsdsDefinition> {
        self.ccsds.as_ref()
    }

    /// One past the highest byte of any field.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fieldmap.get(name).map(|i| &self.fields[*i])
    }

    #[must_use]
    pub fn history(&self) -> &Arc<FieldHistory> {
        &self.history
    }

    #[must_use]
    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&PacketFunction> {
        self.functions.get(name)
    }

    #[must_use]
    pub fn function_table(&self) -> &FunctionTable {
        self.function_table
            .as_ref()
            .unwrap_or_else(|| FunctionTable::core())
    }

    /// Resolve a field name once for repeated access.
    ///
    /// # Errors
    /// [Error::UnknownField] if there is no such field.
    pub fn key(&self, name: &str) -> Result<FieldKey> {
        self.fieldmap
            .get(name)
            .copied()
            .map(FieldKey)
            .ok_or_else(|| Error::UnknownField {
                definition: self.name.clone(),
                field: name.to_string(),
            })
    }

    /// Validate every field, appending one message per problem. Fields whose value cannot
    /// be read are reported and checking continues with the next field.
    pub fn validate(&self, values: &impl FieldValues, messages: &mut Vec<String>) -> bool {
        let mut valid = true;
        for fd in &self.fields {
            match values.field_value(fd.name()) {
                Ok(Some(value)) => {
                    if !fd.validate(&value, messages) {
                        valid = false;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    valid = false;
                    messages.push(format!(
                        "Telemetry field mismatch for packet '{}'.  Unable to retrieve value for {} in Packet: {err}",
                        self.name,
                        fd.name()
                    ));
                }
            }
        }
        valid
    }

    /// Write one row per field in quoted CSV, preceded by a header row.
    ///
    /// # Errors
    /// Any I/O error from `writer`.
    pub fn write_csv<W: Write>(&self, writer: &mut W) -> Result<()> {
        const HEADER: [&str; 8] = [
            "Name",
            "First Byte",
            "Last Byte",
            "Bit Mask",
            "Endian",
            "Type",
            "Description",
            "Values",
        ];
        write_csv_row(writer, &HEADER.map(String::from))?;
        for fd in &self.fields {
            let slice = fd.slice(0);
            let endian = match fd.dtype().as_primitive().map(|p| p.order()) {
                Some(ByteOrder::Msb) => "MSB",
                Some(ByteOrder::Lsb) => "LSB",
                _ => "",
            };
            let enums = fd
                .enumeration()
                .map(|e| {
                    e.iter()
                        .map(|(code, name)| format!("{code}: {name}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            write_csv_row(
                writer,
                &[
                    fd.name().to_string(),
                    slice.start.to_string(),
                    slice.end.to_string(),
                    fd.mask().map(|m| format!("{m:#x}")).unwrap_or_default(),
                    endian.to_string(),
                    fd.dtype().name().to_string(),
                    fd.desc().unwrap_or_default().replace('\n', " "),
                    enums,
                ],
            )?;
        }
        Ok(())
    }
}

fn write_csv_row<W: Write>(writer: &mut W, cells: &[String]) -> Result<()> {
    let row: Vec<String> = cells
        .iter()
        .map(|c| format!("\"{}\"", c.replace('"', "\"\"")))
        .collect();
    writeln!(writer, "{}", row.join(","))?;
    Ok(())
}

// Overlapping fields are expected only when masks split a byte or guards select
// between alternatives.
fn warn_overlaps(packet: &str, fields: &[FieldDefinition]) {
    let plain: Vec<&FieldDefinition> = fields
        .iter()
        .filter(|f| f.mask().is_none() && f.when().is_none())
        .collect();
    for (i, a) in plain.iter().enumerate() {
        let ra = a.slice(0);
        for b in &plain[i + 1..] {
            let rb = b.slice(0);
            if ra.start < rb.end && rb.start < ra.end {
                warn!(
                    packet,
                    first = a.name(),
                    second = b.name(),
                    "fields overlap without masks"
                );
            }
        }
    }
}

/// A telemetry packet: a definition and a buffer of exactly `nbytes` bytes.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use gds::field::{ByteSpec, FieldDefinition};
/// use gds::packet::{Packet, PacketDefinition};
/// use gds::types::TypeRegistry;
/// use gds::Value;
///
/// let registry = TypeRegistry::default();
/// let volts = FieldDefinition::builder()
///     .name("volts")
///     .dtype(registry.get("MSB_U16").unwrap())
///     .build();
/// let defn = Arc::new(PacketDefinition::new("POWER", vec![volts]).unwrap());
///
/// let mut pkt = Packet::new(defn);
/// pkt.set("volts", &Value::Int(28)).unwrap();
/// assert_eq!(pkt.data(), &[0, 28]);
/// assert_eq!(pkt.get("volts").unwrap(), Some(Value::Int(28)));
/// ```
#[derive(Debug, Clone)]
pub struct Packet {
    defn: Arc<PacketDefinition>,
    data: Vec<u8>,
}

impl Packet {
    /// Zero filled packet. The field history is not updated.
    #[must_use]
    pub fn new(defn: Arc<PacketDefinition>) -> Self {
        let data = vec![0u8; defn.nbytes()];
        Self { defn, data }
    }

    /// Decode a packet from received bytes, ignoring anything past `nbytes`, and record
    /// its history fields.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `bytes` is shorter than the definition.
    pub fn from_bytes(defn: Arc<PacketDefinition>, bytes: &[u8]) -> Result<Self> {
        let nbytes = defn.nbytes();
        if bytes.len() < nbytes {
            return Err(Error::NotEnoughData {
                actual: bytes.len(),
                minimum: nbytes,
            });
        }
        let pkt = Self {
            defn,
            data: bytes[..nbytes].to_vec(),
        };
        pkt.record_history();
        Ok(pkt)
    }

    fn record_history(&self) {
        let history = self.defn.history();
        let snapshot: Vec<(String, Value)> = history
            .names()
            .iter()
            .filter_map(|name| match self.get(name) {
                Ok(Some(v)) => Some((name.clone(), v)),
                Ok(None) => None,
                Err(err) => {
                    debug!(packet = %self.defn.name(), field = %name, %err, "history field unreadable");
                    None
                }
            })
            .collect();
        history.update(snapshot);
    }

    #[must_use]
    pub fn definition(&self) -> &Arc<PacketDefinition> {
        &self.defn
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// Value of a field. `None` when its guard is false or its derived value is `None`.
    /// Array fields without an index are materialized as a [Value::List]; see
    /// [get_list](Self::get_list) for lazy access.
    ///
    /// # Errors
    /// [Error::UnknownField] for names not in the definition, or any decode or expression
    /// error.
    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        let key = self.defn.key(name)?;
        self.get_by_key(key)
    }

    /// # Errors
    /// See [get](Self::get).
    pub fn get_by_key(&self, key: FieldKey) -> Result<Option<Value>> {
        self.read(key.0, false, None, 0)
    }

    /// One element of an array field.
    ///
    /// # Errors
    /// See [get](Self::get). [Error::OutOfRange] if `index` is past the end.
    pub fn get_index(&self, name: &str, index: usize) -> Result<Option<Value>> {
        let key = self.defn.key(name)?;
        self.read(key.0, false, Some(index), 0)
    }

    /// Lazy view over an array field.
    ///
    /// # Errors
    /// [Error::UnknownField] for unknown names, [Error::TypeMismatch] if the field is not
    /// an array.
    pub fn get_list(&self, name: &str) -> Result<FieldList<'_>> {
        self.field_list(name, false)
    }

    fn field_list(&self, name: &str, raw: bool) -> Result<FieldList<'_>> {
        let key = self.defn.key(name)?;
        let fd = &self.defn.fields[key.0];
        let Some(array) = fd.dtype().as_array() else {
            return Err(Error::TypeMismatch {
                type_name: fd.dtype().name().to_string(),
                expected: "array".to_string(),
                got: "scalar".to_string(),
            });
        };
        Ok(FieldList {
            packet: self,
            idx: key.0,
            raw,
            len: array.nelems(),
        })
    }

    /// View that decodes fields without enumeration names or derived values.
    #[must_use]
    pub fn raw(&self) -> RawPacket<'_> {
        RawPacket(self)
    }

    #[must_use]
    pub fn history(&self) -> &FieldHistory {
        self.defn.history()
    }

    /// Encode `value` into a field without disturbing bits outside its mask.
    ///
    /// # Errors
    /// [Error::UnknownField] for unknown names, or any encode error.
    pub fn set(&mut self, name: &str, value: &Value) -> Result<()> {
        let key = self.defn.key(name)?;
        self.set_by_key(key, value)
    }

    /// # Errors
    /// See [set](Self::set).
    pub fn set_by_key(&mut self, key: FieldKey, value: &Value) -> Result<()> {
        let fd = &self.defn.fields[key.0];
        fd.write(&mut self.data, 0, value)
    }

    pub fn validate(&self, messages: &mut Vec<String>) -> bool {
        self.defn.validate(self, messages)
    }

    /// Every field by name. Fields that do not apply are `null`.
    ///
    /// # Errors
    /// Any error reading a field.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let mut obj = serde_json::Map::new();
        for fd in self.defn.fields() {
            let value = match self.get(fd.name())? {
                Some(v) => serde_json::to_value(v)?,
                None => serde_json::Value::Null,
            };
            obj.insert(fd.name().to_string(), value);
        }
        Ok(serde_json::Value::Object(obj))
    }

    fn read(
        &self,
        idx: usize,
        raw: bool,
        index: Option<usize>,
        depth: usize,
    ) -> Result<Option<Value>> {
        if depth > MAX_DEPTH {
            return Err(Error::Expression(format!(
                "derived fields of {} nest deeper than {MAX_DEPTH} levels",
                self.defn.name()
            )));
        }
        let fd = &self.defn.fields[idx];
        let ctx = PacketContext {
            packet: self,
            depth: depth + 1,
        };
        if let Some(when) = fd.when() {
            if !when.test(&ctx)? {
                return Ok(None);
            }
        }
        if !raw {
            if let Some(conv) = fd.dntoeu() {
                return conv.eval(&ctx);
            }
            if let Some(expr) = fd.expr() {
                return expr.eval(&ctx);
            }
        }
        fd.decode(&self.data, raw, index).map(Some)
    }
}

impl FieldValues for Packet {
    // Derived fields are checked against their type, so they contribute their raw value.
    fn field_value(&self, name: &str) -> Result<Option<Value>> {
        let key = self.defn.key(name)?;
        let raw = self.defn.fields[key.0].is_derived();
        self.read(key.0, raw, None, 0)
    }
}

/// Raw view of a packet, the `raw.<field>` of expressions.
#[derive(Debug, Clone, Copy)]
pub struct RawPacket<'a>(&'a Packet);

impl RawPacket<'_> {
    /// # Errors
    /// See [Packet::get].
    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        let key = self.0.defn.key(name)?;
        self.0.read(key.0, true, None, 0)
    }

    /// # Errors
    /// See [Packet::get_index].
    pub fn get_index(&self, name: &str, index: usize) -> Result<Option<Value>> {
        let key = self.0.defn.key(name)?;
        self.0.read(key.0, true, Some(index), 0)
    }

    /// # Errors
    /// See [Packet::get_list].
    pub fn get_list(&self, name: &str) -> Result<FieldList<'_>> {
        self.0.field_list(name, true)
    }
}

/// Array field accessed one element at a time.
#[derive(Debug, Clone, Copy)]
pub struct FieldList<'a> {
    packet: &'a Packet,
    idx: usize,
    raw: bool,
    len: usize,
}

impl<'a> FieldList<'a> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Errors
    /// [Error::OutOfRange] if `index >= len()`, or any decode error.
    pub fn get(&self, index: usize) -> Result<Option<Value>> {
        self.packet.read(self.idx, self.raw, Some(index), 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Option<Value>>> + 'a {
        let this = *self;
        (0..self.len).map(move |i| this.get(i))
    }
}

struct PacketContext<'a> {
    packet: &'a Packet,
    depth: usize,
}

impl PacketContext<'_> {
    fn field(&self, name: &str, raw: bool) -> Option<Result<Option<Value>>> {
        let defn = self.packet.definition();
        defn.fieldmap
            .get(name)
            .map(|idx| self.packet.read(*idx, raw, None, self.depth))
    }

    fn unknown(&self, name: &str) -> Error {
        Error::UnknownField {
            definition: self.packet.definition().name().to_string(),
            field: name.to_string(),
        }
    }
}

impl Symbols for PacketContext<'_> {
    fn lookup(&self, name: &str) -> Result<Option<Value>> {
        if let Some(result) = self.field(name, false) {
            return result;
        }
        match self.packet.definition().constant(name) {
            Some(v) => Ok(Some(v.clone())),
            None => Err(self.unknown(name)),
        }
    }

    fn lookup_raw(&self, name: &str) -> Result<Option<Value>> {
        self.field(name, true)
            .unwrap_or_else(|| Err(self.unknown(name)))
    }

    fn lookup_history(&self, name: &str) -> Result<Option<Value>> {
        let history = self.packet.history();
        if !history.contains(name) {
            return Err(Error::Expression(format!(
                "{} has no history field '{name}'",
                self.packet.definition().name()
            )));
        }
        Ok(history.get(name))
    }

    fn call(&self, name: &str, args: &[Option<Value>]) -> Option<Result<Option<Value>>> {
        if self.depth > MAX_DEPTH {
            return Some(Err(Error::Expression(format!(
                "call to {name} nests deeper than {MAX_DEPTH} levels"
            ))));
        }
        let inner = PacketContext {
            packet: self.packet,
            depth: self.depth + 1,
        };
        self.packet
            .definition()
            .function(name)
            .map(|f| f.invoke(args, &inner))
    }

    fn functions(&self) -> &FunctionTable {
        self.packet.definition().function_table()
    }
}

/// Decode many packets of one definition in parallel. Results are in input order.
///
/// History updates from concurrently decoded packets are each applied atomically but in
/// no particular order.
pub fn decode_all<'a, I>(defn: &Arc<PacketDefinition>, chunks: I) -> Vec<Result<Packet>>
where
    I: IntoParallelIterator<Item = &'a [u8]>,
{
    chunks
        .into_par_iter()
        .map(|bytes| Packet::from_bytes(defn.clone(), bytes))
        .collect()
}

/// Packet definitions by name and APID.
#[derive(Debug, Default)]
pub struct PacketDictionary {
    defns: Vec<Arc<PacketDefinition>>,
    names: HashMap<String, usize>,
    apids: HashMap<Apid, usize>,
}

impl PacketDictionary {
    /// # Errors
    /// [Error::Schema] for a duplicate packet name.
    pub fn add(&mut self, defn: PacketDefinition) -> Result<Arc<PacketDefinition>> {
        if self.names.contains_key(defn.name()) {
            return Err(Error::Schema(format!(
                "Duplicate packet name '{}'",
                defn.name()
            )));
        }
        let defn = Arc::new(defn);
        let idx = self.defns.len();
        self.names.insert(defn.name().to_string(), idx);
        if let Some(apid) = defn.apid() {
            self.apids.entry(apid).or_insert(idx);
        }
        self.defns.push(defn.clone());
        Ok(defn)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<PacketDefinition>> {
        self.names.get(name).map(|i| &self.defns[*i])
    }

    /// First definition added with `apid`.
    #[must_use]
    pub fn get_apid(&self, apid: Apid) -> Option<&Arc<PacketDefinition>> {
        self.apids.get(&apid).map(|i| &self.defns[*i])
    }

    /// Decode `bytes` as the named packet.
    ///
    /// # Errors
    /// [Error::UnknownSymbol] for an unknown name, or any [Packet::from_bytes] error.
    pub fn create(&self, name: &str, bytes: &[u8]) -> Result<Packet> {
        let defn = self
            .get(name)
            .ok_or_else(|| Error::UnknownSymbol(format!("Unrecognized packet: {name}")))?;
        Packet::from_bytes(defn.clone(), bytes)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PacketDefinition>> {
        self.defns.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.defns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defns.is_empty()
    }

    /// Write `<packet>.csv` into `dir` for every packet.
    ///
    /// # Errors
    /// Any I/O error.
    pub fn write_csv(&self, dir: &Path) -> Result<()> {
        for defn in &self.defns {
            let path = dir.join(format!("{}.csv", defn.name()));
            let mut writer = BufWriter::new(File::create(&path)?);
            defn.write_csv(&mut writer)?;
            writer.flush()?;
            debug!(packet = %defn.name(), path = %path.display(), "wrote dictionary csv");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{DnToEu, Expression};
    use crate::field::{ByteSpec, Enumeration};
    use crate::types::TypeRegistry;

    fn field(name: &str, dtype: &str) -> FieldDefinition {
        FieldDefinition::builder()
            .name(name)
            .dtype(TypeRegistry::default().get(dtype).unwrap())
            .build()
    }

    fn power() -> Arc<PacketDefinition> {
        let registry = TypeRegistry::default();
        let fields = vec![
            FieldDefinition::builder()
                .name("mode")
                .dtype(registry.get("U8").unwrap())
                .enumeration(Enumeration::new([(0, "SAFE"), (1, "NOMINAL")]).unwrap())
                .build(),
            field("volts", "MSB_U16"),
            FieldDefinition::builder()
                .name("volts_eu")
                .dtype(registry.get("MSB_U16").unwrap())
                .bytes(ByteSpec::Range(1, 2))
                .dntoeu(DnToEu::new("raw.volts * 0.5").unwrap().with_units("V"))
                .build(),
            FieldDefinition::builder()
                .name("heater")
                .dtype(registry.get("U8").unwrap())
                .when(Expression::compile("mode == 'NOMINAL'").unwrap())
                .build(),
            field("samples", "U8[3]"),
        ];
        Arc::new(
            PacketDefinition::new("POWER", fields)
                .unwrap()
                .with_apid(42)
                .with_history(["volts"])
                .unwrap(),
        )
    }

    #[test]
    fn layout() {
        let defn = power();
        assert_eq!(defn.nbytes(), 7);
        assert_eq!(defn.field("heater").unwrap().slice(0), 3..4);
        assert_eq!(defn.field("samples").unwrap().slice(0), 4..7);
    }

    #[test]
    fn get_and_set() {
        let mut pkt = Packet::new(power());
        pkt.set("mode", &Value::from("NOMINAL")).unwrap();
        pkt.set("volts", &Value::Int(24)).unwrap();
        pkt.set("heater", &Value::Int(9)).unwrap();
        pkt.set("samples", &Value::List(vec![1u8.into(), 2u8.into(), 3u8.into()]))
            .unwrap();
        assert_eq!(pkt.data(), &[1, 0, 24, 9, 1, 2, 3]);

        assert_eq!(pkt.get("mode").unwrap(), Some(Value::from("NOMINAL")));
        assert_eq!(pkt.raw().get("mode").unwrap(), Some(Value::Int(1)));
        assert_eq!(pkt.get("volts_eu").unwrap(), Some(Value::Float(12.0)));
        assert_eq!(pkt.raw().get("volts_eu").unwrap(), Some(Value::Int(24)));
        assert_eq!(pkt.get("heater").unwrap(), Some(Value::Int(9)));
        assert_eq!(pkt.get_index("samples", 2).unwrap(), Some(Value::Int(3)));

        let list = pkt.get_list("samples").unwrap();
        assert_eq!(list.len(), 3);
        let all: Vec<_> = list.iter().map(|v| v.unwrap().unwrap()).collect();
        assert_eq!(all, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert!(pkt.get_list("volts").is_err());
    }

    #[test]
    fn guard_hides_field() {
        let mut pkt = Packet::new(power());
        pkt.set("heater", &Value::Int(9)).unwrap();
        assert_eq!(pkt.get("heater").unwrap(), None);
    }

    #[test]
    fn unknown_field() {
        let mut pkt = Packet::new(power());
        assert!(matches!(pkt.get("nope"), Err(Error::UnknownField { .. })));
        assert!(pkt.set("raw", &Value::Int(1)).is_err());
    }

    #[test]
    fn history_updates_on_decode() {
        let defn = power();
        assert_eq!(defn.history().get("volts"), Some(Value::Int(0)));
        Packet::from_bytes(defn.clone(), &[0, 0, 7, 0, 0, 0, 0]).unwrap();
        assert_eq!(defn.history().get("volts"), Some(Value::Int(7)));
        Packet::new(defn.clone());
        assert_eq!(defn.history().get("volts"), Some(Value::Int(7)));
    }

    #[test]
    fn from_bytes_length() {
        let defn = power();
        assert!(matches!(
            Packet::from_bytes(defn.clone(), &[0; 6]),
            Err(Error::NotEnoughData {
                actual: 6,
                minimum: 7
            })
        ));
        let pkt = Packet::from_bytes(defn, &[0; 10]).unwrap();
        assert_eq!(pkt.nbytes(), 7);
    }

    #[test]
    fn reserved_and_duplicate_names() {
        assert!(PacketDefinition::new("P", vec![field("raw", "U8")]).is_err());
        assert!(PacketDefinition::new("P", vec![field("a", "U8"), field("a", "U8")]).is_err());
    }

    #[test]
    fn constants_and_functions() {
        let registry = TypeRegistry::default();
        let fields = vec![
            field("dn", "U8"),
            FieldDefinition::builder()
                .name("eu")
                .dtype(registry.get("U8").unwrap())
                .bytes(ByteSpec::Prev)
                .expr(Expression::compile("scale(dn) + OFFSET").unwrap())
                .build(),
        ];
        let defn = PacketDefinition::new("P", fields)
            .unwrap()
            .with_constants([("OFFSET", 100)])
            .with_functions([PacketFunction::new("scale(x)", "x * 2").unwrap()]);
        let pkt = Packet::from_bytes(Arc::new(defn), &[5]).unwrap();
        assert_eq!(pkt.get("eu").unwrap(), Some(Value::Int(110)));
    }

    #[test]
    fn self_reference_is_an_error() {
        let fields = vec![FieldDefinition::builder()
            .name("loop")
            .dtype(TypeRegistry::default().get("U8").unwrap())
            .expr(Expression::compile("loop + 1").unwrap())
            .build()];
        let pkt = Packet::new(Arc::new(PacketDefinition::new("P", fields).unwrap()));
        assert!(matches!(pkt.get("loop"), Err(Error::Expression(_))));
    }

    #[test]
    fn validate_reports_every_field() {
        let registry = TypeRegistry::default();
        let fields = ["a", "b", "c"]
            .iter()
            .map(|n| {
                FieldDefinition::builder()
                    .name(*n)
                    .dtype(registry.get("U8").unwrap())
                    .range((0.0, 5.0))
                    .build()
            })
            .collect();
        let defn = PacketDefinition::new("P", fields).unwrap();

        let mut messages = Vec::new();
        assert!(!defn.validate(&HashMap::<String, Value>::new(), &mut messages));
        assert_eq!(messages.len(), 3);

        let pkt = Packet::from_bytes(Arc::new(defn), &[1, 9, 9]).unwrap();
        let mut messages = Vec::new();
        assert!(!pkt.validate(&mut messages));
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn to_json() {
        let pkt = Packet::from_bytes(power(), &[1, 0, 4, 0, 0, 0, 0]).unwrap();
        let json = pkt.to_json().unwrap();
        assert_eq!(json["mode"], "NOMINAL");
        assert_eq!(json["volts_eu"], 2.0);
        assert_eq!(json["samples"], serde_json::json!([0, 0, 0]));
    }

    #[test]
    fn parallel_decode() {
        let defn = power();
        let chunks: Vec<Vec<u8>> = (0..8u8).map(|i| vec![0, 0, i, 0, 0, 0, 0]).collect();
        let slices: Vec<&[u8]> = chunks.iter().map(Vec::as_slice).collect();
        let pkts = decode_all(&defn, slices);
        assert_eq!(pkts.len(), 8);
        for (i, pkt) in pkts.into_iter().enumerate() {
            assert_eq!(pkt.unwrap().get("volts").unwrap(), Some(Value::from(i)));
        }
    }

    #[test]
    fn csv_rows() {
        let mut out = Vec::new();
        power().write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("\"Name\",\"First Byte\""));
        assert_eq!(
            lines.next().unwrap(),
            "\"mode\",\"0\",\"1\",\"\",\"\",\"U8\",\"\",\"0: SAFE"
        );
        assert_eq!(lines.next().unwrap(), "1: NOMINAL\"");
        assert_eq!(
            lines.next().unwrap(),
            "\"volts\",\"1\",\"3\",\"\",\"MSB\",\"MSB_U16\",\"\",\"\""
        );
    }

    #[test]
    fn dictionary() {
        let mut dict = PacketDictionary::default();
        dict.add(PacketDefinition::new("A", vec![field("x", "U8")]).unwrap().with_apid(5))
            .unwrap();
        assert!(dict
            .add(PacketDefinition::new("A", vec![field("x", "U8")]).unwrap())
            .is_err());
        assert_eq!(dict.get_apid(5).unwrap().name(), "A");
        assert_eq!(dict.create("A", &[3]).unwrap().get("x").unwrap(), Some(Value::Int(3)));
    }
}
