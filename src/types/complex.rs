use std::fmt::Debug;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::cmd::CommandDictionary;
use crate::evr::EvrDictionary;
use crate::{Error, Result, Value};

use super::DataType;

/// Seconds between the Unix epoch and the GPS epoch, 1980-01-06T00:00:00Z.
pub const GPS_EPOCH_UNIX: i64 = 315_964_800;

const NANOS_PER_SEC: u64 = 1_000_000_000;

type Resolver<D> = Box<dyn Fn() -> Option<Arc<D>> + Send + Sync>;

/// Reference to an external dictionary that is either bound explicitly or resolved on first
/// use. Resolution happens at most once, even with concurrent first access.
pub struct DictionaryBinding<D> {
    kind: &'static str,
    cell: OnceLock<Arc<D>>,
    resolver: Mutex<Option<Resolver<D>>>,
}

impl<D> Debug for DictionaryBinding<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictionaryBinding")
            .field("kind", &self.kind)
            .field("bound", &self.cell.get().is_some())
            .finish()
    }
}

impl<D> DictionaryBinding<D> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            cell: OnceLock::new(),
            resolver: Mutex::new(None),
        }
    }

    /// Bind `dict`.
    ///
    /// # Errors
    /// [Error::Schema] if a dictionary is already bound.
    pub fn bind(&self, dict: Arc<D>) -> Result<()> {
        self.cell
            .set(dict)
            .map_err(|_| Error::Schema(format!("{} dictionary already bound", self.kind)))?;
        debug!(kind = self.kind, "bound dictionary");
        Ok(())
    }

    /// Set the function used to resolve the dictionary the first time it is needed.
    pub fn set_resolver<F>(&self, resolver: F)
    where
        F: Fn() -> Option<Arc<D>> + Send + Sync + 'static,
    {
        let mut guard = self.resolver.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Box::new(resolver));
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The bound dictionary, resolving it if necessary.
    ///
    /// # Errors
    /// [Error::UnboundDictionary] if nothing is bound and the resolver is missing or yields
    /// nothing.
    pub fn get(&self) -> Result<&Arc<D>> {
        if let Some(dict) = self.cell.get() {
            return Ok(dict);
        }
        let guard = self.resolver.lock().unwrap_or_else(PoisonError::into_inner);
        // another thread may have resolved while we waited on the lock
        if let Some(dict) = self.cell.get() {
            return Ok(dict);
        }
        if let Some(dict) = guard.as_ref().and_then(|resolve| resolve()) {
            debug!(kind = self.kind, "resolved dictionary");
            let _ = self.cell.set(dict);
        }
        self.cell.get().ok_or(Error::UnboundDictionary(self.kind))
    }
}

/// Big-endian 16-bit code shared by `CMD16` and `EVR16`.
fn code_of(bytes: &[u8]) -> Result<u16> {
    match bytes {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(Error::NotEnoughData {
            actual: bytes.len(),
            minimum: 2,
        }),
    }
}

/// `CMD16`: a 16-bit opcode resolved against a command dictionary.
///
/// Unknown opcodes are an error when decoding, since command identity matters.
#[derive(Debug)]
pub struct CmdType {
    dict: DictionaryBinding<CommandDictionary>,
}

impl Default for CmdType {
    fn default() -> Self {
        Self {
            dict: DictionaryBinding::new("command"),
        }
    }
}

impl CmdType {
    #[must_use]
    pub fn dictionary(&self) -> &DictionaryBinding<CommandDictionary> {
        &self.dict
    }

    /// Bind the command dictionary. Shorthand for `dictionary().bind(..)`.
    ///
    /// # Errors
    /// See [DictionaryBinding::bind].
    pub fn bind(&self, dict: Arc<CommandDictionary>) -> Result<()> {
        self.dict.bind(dict)
    }
}

impl DataType for CmdType {
    fn name(&self) -> &str {
        "CMD16"
    }

    fn nbytes(&self) -> usize {
        2
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let opcode = match value {
            Value::Command(defn) => defn.opcode(),
            Value::Str(name) => self
                .dict
                .get()?
                .get(name)
                .map(|d| d.opcode())
                .ok_or_else(|| Error::UnknownSymbol(format!("Unrecognized command: {name}")))?,
            Value::Int(code) => {
                let code = u16::try_from(*code)
                    .map_err(|_| Error::OutOfRange(format!("opcode {code} exceeds 16 bits")))?;
                if self.dict.get()?.get_opcode(code).is_none() {
                    return Err(Error::UnknownSymbol(format!(
                        "Unrecognized command opcode: {code}"
                    )));
                }
                code
            }
            other => {
                return Err(Error::TypeMismatch {
                    type_name: "CMD16".to_string(),
                    expected: "command name".to_string(),
                    got: other.kind().to_string(),
                })
            }
        };
        Ok(opcode.to_be_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8], raw: bool) -> Result<Value> {
        let opcode = code_of(bytes)?;
        if raw {
            return Ok(Value::from(opcode));
        }
        match self.dict.get()?.get_opcode(opcode) {
            Some(defn) => Ok(Value::Command(defn.clone())),
            None => Err(Error::UnknownSymbol(format!(
                "Unrecognized command opcode: {opcode}"
            ))),
        }
    }
}

/// `EVR16`: a 16-bit event code resolved against an EVR dictionary.
///
/// Unknown codes decode to the raw code with a warning.
#[derive(Debug)]
pub struct EvrType {
    dict: DictionaryBinding<EvrDictionary>,
}

impl Default for EvrType {
    fn default() -> Self {
        Self {
            dict: DictionaryBinding::new("evr"),
        }
    }
}

impl EvrType {
    #[must_use]
    pub fn dictionary(&self) -> &DictionaryBinding<EvrDictionary> {
        &self.dict
    }

    /// Bind the EVR dictionary.
    ///
    /// # Errors
    /// See [DictionaryBinding::bind].
    pub fn bind(&self, dict: Arc<EvrDictionary>) -> Result<()> {
        self.dict.bind(dict)
    }
}

impl DataType for EvrType {
    fn name(&self) -> &str {
        "EVR16"
    }

    fn nbytes(&self) -> usize {
        2
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let code = match value {
            Value::Evr(defn) => defn.code(),
            Value::Str(name) => match self.dict.get()?.get(name) {
                Some(defn) => defn.code(),
                None => {
                    error!(name = %name, "EVR name not in dictionary");
                    return Err(Error::UnknownSymbol(format!("Unrecognized EVR: {name}")));
                }
            },
            Value::Int(code) => u16::try_from(*code)
                .map_err(|_| Error::OutOfRange(format!("EVR code {code} exceeds 16 bits")))?,
            other => {
                return Err(Error::TypeMismatch {
                    type_name: "EVR16".to_string(),
                    expected: "EVR name".to_string(),
                    got: other.kind().to_string(),
                })
            }
        };
        Ok(code.to_be_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8], raw: bool) -> Result<Value> {
        let code = code_of(bytes)?;
        if raw {
            return Ok(Value::from(code));
        }
        match self.dict.get()?.get_code(code) {
            Some(defn) => Ok(Value::Evr(defn.clone())),
            None => {
                warn!(code, "unrecognized EVR code");
                Ok(Value::from(code))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    /// 1 byte of 1/256 second fine time.
    Time8,
    /// 4 bytes of GPS seconds.
    Time32,
    /// 4 bytes of GPS seconds followed by 1 byte of 1/256 second fine time.
    Time40,
    /// 4 bytes of GPS seconds followed by 4 bytes of nanoseconds.
    Time64,
}

/// GPS epoch based time codes. Leap seconds are not applied.
#[derive(Debug, Clone)]
pub struct TimeType {
    kind: TimeKind,
}

impl TimeType {
    #[must_use]
    pub fn new(kind: TimeKind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> TimeKind {
        self.kind
    }

    fn mismatch(&self, expected: &str, value: &Value) -> Error {
        Error::TypeMismatch {
            type_name: self.name().to_string(),
            expected: expected.to_string(),
            got: value.kind().to_string(),
        }
    }

    fn gps_seconds(&self, t: &DateTime<Utc>) -> Result<u32> {
        let secs = t.timestamp() - GPS_EPOCH_UNIX;
        u32::try_from(secs)
            .map_err(|_| Error::OutOfRange(format!("{t} is not representable as {}", self.name())))
    }

    fn time_value(&self, value: &Value) -> Result<DateTime<Utc>> {
        value
            .as_time()
            .copied()
            .ok_or_else(|| self.mismatch("time", value))
    }

    /// Fine byte for a fraction of a second, truncating to 1/256 second.
    fn fine_from_nanos(nanos: u32) -> u8 {
        // nanos < 1e9 so the result is < 256
        (u64::from(nanos) * 256 / NANOS_PER_SEC) as u8
    }

    fn nanos_from_fine(fine: u8) -> u32 {
        (u64::from(fine) * NANOS_PER_SEC / 256) as u32
    }
}

fn from_gps(secs: u32, nanos: u32) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(GPS_EPOCH_UNIX + i64::from(secs), nanos)
        .ok_or_else(|| Error::OutOfRange(format!("invalid GPS time {secs}s {nanos}ns")))
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl DataType for TimeType {
    fn name(&self) -> &str {
        match self.kind {
            TimeKind::Time8 => "TIME8",
            TimeKind::Time32 => "TIME32",
            TimeKind::Time40 => "TIME40",
            TimeKind::Time64 => "TIME64",
        }
    }

    fn nbytes(&self) -> usize {
        match self.kind {
            TimeKind::Time8 => 1,
            TimeKind::Time32 => 4,
            TimeKind::Time40 => 5,
            TimeKind::Time64 => 8,
        }
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match self.kind {
            TimeKind::Time8 => {
                let fine = match value {
                    Value::Time(t) => Self::fine_from_nanos(t.timestamp_subsec_nanos()),
                    v if v.is_numeric() => {
                        let frac = v.as_f64().unwrap_or_default();
                        if !(0.0..1.0).contains(&frac) {
                            return Err(Error::OutOfRange(format!(
                                "TIME8 fraction {frac} not in [0, 1)"
                            )));
                        }
                        (frac * 256.0) as u8
                    }
                    other => return Err(self.mismatch("time or fraction of a second", other)),
                };
                Ok(vec![fine])
            }
            TimeKind::Time32 => {
                let t = self.time_value(value)?;
                Ok(self.gps_seconds(&t)?.to_be_bytes().to_vec())
            }
            TimeKind::Time40 => {
                let t = self.time_value(value)?;
                let mut buf = self.gps_seconds(&t)?.to_be_bytes().to_vec();
                buf.push(Self::fine_from_nanos(t.timestamp_subsec_nanos()));
                Ok(buf)
            }
            TimeKind::Time64 => {
                let t = self.time_value(value)?;
                let mut buf = self.gps_seconds(&t)?.to_be_bytes().to_vec();
                // leap second representations carry nanos >= 1e9
                let nanos = t.timestamp_subsec_nanos().min(999_999_999);
                buf.extend(nanos.to_be_bytes());
                Ok(buf)
            }
        }
    }

    fn decode(&self, bytes: &[u8], raw: bool) -> Result<Value> {
        let nbytes = self.nbytes();
        if bytes.len() < nbytes {
            return Err(Error::NotEnoughData {
                actual: bytes.len(),
                minimum: nbytes,
            });
        }
        match self.kind {
            TimeKind::Time8 => {
                if raw {
                    Ok(Value::from(bytes[0]))
                } else {
                    Ok(Value::Float(f64::from(bytes[0]) / 256.0))
                }
            }
            TimeKind::Time32 => {
                let secs = be_u32(bytes);
                if raw {
                    Ok(Value::from(secs))
                } else {
                    Ok(Value::Time(from_gps(secs, 0)?))
                }
            }
            TimeKind::Time40 => {
                let secs = be_u32(bytes);
                let fine = bytes[4];
                if raw {
                    Ok(Value::Float(f64::from(secs) + f64::from(fine) / 256.0))
                } else {
                    Ok(Value::Time(from_gps(secs, Self::nanos_from_fine(fine))?))
                }
            }
            TimeKind::Time64 => {
                let secs = be_u32(bytes);
                let nanos = be_u32(&bytes[4..]);
                if u64::from(nanos) >= NANOS_PER_SEC {
                    return Err(Error::OutOfRange(format!(
                        "TIME64 nanoseconds {nanos} exceed one second"
                    )));
                }
                if raw {
                    Ok(Value::Float(f64::from(secs) + f64::from(nanos) / 1e9))
                } else {
                    Ok(Value::Time(from_gps(secs, nanos)?))
                }
            }
        }
    }

    fn validate(&self, value: &Value, messages: &mut Vec<String>, prefix: Option<&str>) -> bool {
        let ok = match self.kind {
            TimeKind::Time8 => value.is_numeric() || value.as_time().is_some(),
            _ => value.as_time().is_some(),
        };
        if !ok {
            let prefix = prefix.unwrap_or("Value");
            messages.push(format!("{prefix} '{value}' is not a valid {}.", self.name()));
        }
        ok
    }

    fn as_time(&self) -> Option<&TimeType> {
        Some(self)
    }
}
