//! Commands and command dictionaries.
//!
//! An encoded command is a big-endian 16-bit opcode, one byte giving the size of the
//! argument block, and the argument block itself, zero padded to a fixed size.
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use tracing::{debug, error};

use crate::ccsds::CcsdsDefinition;
use crate::field::{resolve_layout, FieldDefinition};
use crate::{Error, Result, Value};

/// Maximum command length in 16-bit words, including one word of header overhead.
pub const MAX_CMD_WORDS: usize = 54;

/// Bytes before the argument block: opcode and argument size.
pub const ARGS_OFFSET: usize = 3;

/// Command arguments are described exactly like packet fields. Arguments with a fixed
/// value are baked into every encoding and never supplied by callers.
pub type ArgumentDefinition = FieldDefinition;

/// Largest argument block that can be sent without staging, in bytes.
#[must_use]
pub const fn max_cmd_size() -> usize {
    (MAX_CMD_WORDS - 1) * 2
}

#[derive(Debug)]
pub struct CommandDefinition {
    name: String,
    opcode: u16,
    subsystem: Option<String>,
    title: Option<String>,
    desc: Option<String>,
    ccsds: Option<CcsdsDefinition>,
    argdefns: Vec<ArgumentDefinition>,
    argsize: usize,
}

impl CommandDefinition {
    /// Resolve argument byte positions, relative to the start of the argument block.
    ///
    /// # Errors
    /// [Error::Schema] for duplicate argument names or any argument that fails
    /// [FieldDefinition::check].
    pub fn new(
        name: impl Into<String>,
        opcode: u16,
        mut argdefns: Vec<ArgumentDefinition>,
    ) -> Result<Self> {
        let name = name.into();
        resolve_layout(&mut argdefns, 0);
        for (i, arg) in argdefns.iter().enumerate() {
            arg.check()?;
            if argdefns[..i].iter().any(|a| a.name() == arg.name()) {
                return Err(Error::Schema(format!(
                    "command {name}: duplicate argument '{}'",
                    arg.name()
                )));
            }
        }
        let argsize = argdefns.iter().map(|a| a.slice(0).end).max().unwrap_or(0);
        Ok(Self {
            name,
            opcode,
            subsystem: None,
            title: None,
            desc: None,
            ccsds: None,
            argdefns,
            argsize,
        })
    }

    #[must_use]
    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = Some(subsystem.into());
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
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

    #[must_use]
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    #[must_use]
    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    #[must_use]
    pub fn desc(&self) -> Option<&str> {
        self.desc.as_deref()
    }

    #[must_use]
    pub fn ccsds(&self) -> Option<&CcsdsDefinition> {
        self.ccsds.as_ref()
    }

    /// Every argument definition, fixed ones included.
    #[must_use]
    pub fn argdefns(&self) -> &[ArgumentDefinition] {
        &self.argdefns
    }

    /// Arguments supplied by callers, in order.
    pub fn args(&self) -> impl Iterator<Item = &ArgumentDefinition> {
        self.argdefns.iter().filter(|a| !a.is_fixed())
    }

    #[must_use]
    pub fn nargs(&self) -> usize {
        self.args().count()
    }

    /// Size of the argument block in bytes.
    #[must_use]
    pub fn argsize(&self) -> usize {
        self.argsize
    }

    /// Unpadded encoded size.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        ARGS_OFFSET + self.argsize
    }

    /// True if the argument block is too large to send without staging.
    #[must_use]
    pub fn staging_required(&self) -> bool {
        let required = self.argsize > max_cmd_size();
        if required {
            debug!(
                command = %self.name,
                argsize = self.argsize,
                max = max_cmd_size(),
                "command larger than maximum; staging required"
            );
        }
        required
    }

    /// Check arity, names, and every supplied value, appending one message per problem.
    pub fn validate(&self, cmd: &Command, messages: &mut Vec<String>) -> bool {
        let mut valid = true;
        let supplied = cmd.args.iter().filter(|a| a.is_some()).count();
        let nargs = self.nargs();
        if supplied != nargs {
            valid = false;
            messages.push(format!(
                "Expected {nargs} arguments, but received {supplied}."
            ));
        }

        for (i, defn) in self.args().enumerate() {
            match cmd.args.get(i).and_then(Option::as_ref) {
                None => {
                    valid = false;
                    messages.push(format!("Argument \"{}\" is missing.", defn.name()));
                }
                Some(value) => {
                    if !defn.validate(value, messages) {
                        valid = false;
                    }
                }
            }
        }

        for name in &cmd.unrecognized {
            valid = false;
            messages.push(format!("Argument \"{name}\" is unrecognized."));
        }
        valid
    }
}

/// A command instance: a definition and values for its non-fixed arguments.
#[derive(Debug, Clone)]
pub struct Command {
    defn: Arc<CommandDefinition>,
    args: Vec<Option<Value>>,
    unrecognized: Vec<String>,
}

impl Command {
    /// Command with positional argument values.
    #[must_use]
    pub fn new(defn: Arc<CommandDefinition>, args: Vec<Value>) -> Self {
        Self {
            defn,
            args: args.into_iter().map(Some).collect(),
            unrecognized: Vec::new(),
        }
    }

    /// Command with named argument values. Names that match no argument are kept and
    /// reported by [validate](Self::validate).
    #[must_use]
    pub fn with_kwargs<I, S>(defn: Arc<CommandDefinition>, kwargs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let mut named: HashMap<String, Value> = kwargs
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect();
        let args = defn.args().map(|a| named.remove(a.name())).collect();
        let mut unrecognized: Vec<String> = named.into_keys().collect();
        unrecognized.sort();
        Self {
            defn,
            args,
            unrecognized,
        }
    }

    #[must_use]
    pub fn definition(&self) -> &Arc<CommandDefinition> {
        &self.defn
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.defn.name()
    }

    #[must_use]
    pub fn opcode(&self) -> u16 {
        self.defn.opcode()
    }

    /// Supplied argument values in order. `None` marks a missing argument.
    #[must_use]
    pub fn args(&self) -> &[Option<Value>] {
        &self.args
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.defn
            .args()
            .position(|a| a.name() == name)
            .ok_or_else(|| Error::UnknownField {
                definition: self.defn.name().to_string(),
                field: name.to_string(),
            })
    }

    /// Value of a non-fixed argument, or the constant of a fixed one.
    ///
    /// # Errors
    /// [Error::UnknownField] if the command has no such argument.
    pub fn get(&self, name: &str) -> Result<Option<&Value>> {
        if let Some(fixed) = self
            .defn
            .argdefns()
            .iter()
            .find(|a| a.name() == name)
            .and_then(FieldDefinition::fixed)
        {
            return Ok(Some(fixed));
        }
        let i = self.position(name)?;
        Ok(self.args.get(i).and_then(Option::as_ref))
    }

    /// # Errors
    /// [Error::UnknownField] if the command has no such non-fixed argument.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let i = self.position(name)?;
        if self.args.len() <= i {
            self.args.resize(i + 1, None);
        }
        self.args[i] = Some(value);
        Ok(())
    }

    /// Encode to at least `pad` bytes. See [max_cmd_size] for the customary pad.
    ///
    /// # Errors
    /// [Error::MissingArgument] if an argument has no value, or any encode error.
    pub fn encode(&self, pad: usize) -> Result<Vec<u8>> {
        let argsize = self.defn.argsize();
        let size_byte = u8::try_from(argsize).map_err(|_| {
            Error::OutOfRange(format!(
                "{} argument block of {argsize} bytes does not fit the size byte",
                self.defn.name()
            ))
        })?;
        let mut encoded = vec![0u8; (ARGS_OFFSET + argsize).max(pad)];
        encoded[..2].copy_from_slice(&self.defn.opcode().to_be_bytes());
        encoded[2] = size_byte;

        let mut index = 0;
        for defn in self.defn.argdefns() {
            let value = match defn.fixed() {
                Some(v) => v,
                None => {
                    let v = self
                        .args
                        .get(index)
                        .and_then(Option::as_ref)
                        .ok_or_else(|| Error::MissingArgument(defn.name().to_string()))?;
                    index += 1;
                    v
                }
            };
            defn.write(&mut encoded, ARGS_OFFSET, value)?;
        }
        Ok(encoded)
    }

    pub fn validate(&self, messages: &mut Vec<String>) -> bool {
        self.defn.validate(self, messages)
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.defn.name())?;
        for arg in &self.args {
            match arg {
                Some(v) => write!(f, " {v}")?,
                None => write!(f, " None")?,
            }
        }
        Ok(())
    }
}

/// Parse a text token as an integer, then a float, then a string.
pub(crate) fn parse_token(token: &str) -> Value {
    let (digits, radix) = match token.get(..2) {
        Some("0x" | "0X") => (&token[2..], 16),
        Some("0b" | "0B") => (&token[2..], 2),
        _ => (token, 10),
    };
    if let Ok(i) = i128::from_str_radix(digits, radix) {
        return Value::Int(i);
    }
    if let Ok(f) = token.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Str(token.to_string())
}

/// Command definitions by name and opcode.
#[derive(Debug, Default)]
pub struct CommandDictionary {
    names: HashMap<String, Arc<CommandDefinition>>,
    opcodes: HashMap<u16, Arc<CommandDefinition>>,
}

impl CommandDictionary {
    /// # Errors
    /// [Error::Schema] if the name or opcode is already present.
    pub fn add(&mut self, defn: CommandDefinition) -> Result<Arc<CommandDefinition>> {
        if self.names.contains_key(defn.name()) || self.opcodes.contains_key(&defn.opcode()) {
            let msg = format!(
                "Duplicate command name/opcode {} ({:#06x})",
                defn.name(),
                defn.opcode()
            );
            error!("{msg}");
            return Err(Error::Schema(msg));
        }
        let defn = Arc::new(defn);
        self.names.insert(defn.name().to_string(), defn.clone());
        self.opcodes.insert(defn.opcode(), defn.clone());
        Ok(defn)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<CommandDefinition>> {
        self.names.get(name)
    }

    #[must_use]
    pub fn get_opcode(&self, opcode: u16) -> Option<&Arc<CommandDefinition>> {
        self.opcodes.get(&opcode)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CommandDefinition>> {
        self.names.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn lookup(&self, name: &str) -> Result<Arc<CommandDefinition>> {
        self.get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownSymbol(format!("Unrecognized command: {name}")))
    }

    /// # Errors
    /// [Error::UnknownSymbol] if there is no command named `name`.
    pub fn create(&self, name: &str, args: Vec<Value>) -> Result<Command> {
        Ok(Command::new(self.lookup(name)?, args))
    }

    /// # Errors
    /// [Error::UnknownSymbol] if there is no command named `name`.
    pub fn create_with_kwargs<I, S>(&self, name: &str, kwargs: I) -> Result<Command>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Ok(Command::with_kwargs(self.lookup(name)?, kwargs))
    }

    /// Create a command from text such as `"CORE_SET_MODE 1 2.5 SAFE"`.
    ///
    /// # Errors
    /// [Error::UnknownSymbol] if the text is empty or names no known command.
    pub fn create_from_str(&self, text: &str) -> Result<Command> {
        let mut tokens = text.split_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| Error::UnknownSymbol("empty command".to_string()))?;
        self.create(name, tokens.map(parse_token).collect())
    }

    /// Decode an encoded command. Fixed arguments are skipped.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `bytes` is shorter than the command, or
    /// [Error::UnknownSymbol] for an unknown opcode.
    pub fn decode(&self, bytes: &[u8]) -> Result<Command> {
        if bytes.len() < ARGS_OFFSET {
            return Err(Error::NotEnoughData {
                actual: bytes.len(),
                minimum: ARGS_OFFSET,
            });
        }
        let opcode = u16::from_be_bytes([bytes[0], bytes[1]]);
        let defn = self
            .get_opcode(opcode)
            .cloned()
            .ok_or_else(|| Error::UnknownSymbol(format!("Unrecognized command opcode: {opcode}")))?;

        let args = defn
            .args()
            .map(|a| a.decode_at(bytes, ARGS_OFFSET, false, None))
            .collect::<Result<Vec<_>>>()?;
        Ok(Command::new(defn, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{ByteSpec, Enumeration};
    use crate::types::TypeRegistry;

    fn arg(name: &str, dtype: &str) -> ArgumentDefinition {
        ArgumentDefinition::builder()
            .name(name)
            .dtype(TypeRegistry::default().get(dtype).unwrap())
            .build()
    }

    fn dictionary() -> CommandDictionary {
        let registry = TypeRegistry::default();
        let mut dict = CommandDictionary::default();
        dict.add(
            CommandDefinition::new(
                "SET_MODE",
                0x0102,
                vec![
                    ArgumentDefinition::builder()
                        .name("mode")
                        .dtype(registry.get("U8").unwrap())
                        .enumeration(Enumeration::new([(0, "SAFE"), (1, "SCIENCE")]).unwrap())
                        .build(),
                    ArgumentDefinition::builder()
                        .name("spare")
                        .dtype(registry.get("U8").unwrap())
                        .value(0xAAu8)
                        .build(),
                    ArgumentDefinition::builder()
                        .name("duration")
                        .dtype(registry.get("MSB_U16").unwrap())
                        .range((1.0, 600.0))
                        .build(),
                ],
            )
            .unwrap(),
        )
        .unwrap();
        dict.add(CommandDefinition::new("NOOP", 0x0001, vec![]).unwrap())
            .unwrap();
        dict
    }

    #[test]
    fn encode() {
        let dict = dictionary();
        let cmd = dict.create_from_str("SET_MODE SCIENCE 300").unwrap();
        let encoded = cmd.encode(max_cmd_size()).unwrap();
        assert_eq!(encoded.len(), 106);
        assert_eq!(&encoded[..7], &[0x01, 0x02, 4, 1, 0xAA, 0x01, 0x2C]);
        assert!(encoded[7..].iter().all(|b| *b == 0));

        let short = cmd.encode(0).unwrap();
        assert_eq!(short.len(), cmd.definition().nbytes());
    }

    #[test]
    fn decode() {
        let dict = dictionary();
        let cmd = dict.decode(&[0x01, 0x02, 4, 0, 0xAA, 0x00, 0x10]).unwrap();
        assert_eq!(cmd.name(), "SET_MODE");
        assert_eq!(cmd.args(), &[Some(Value::from("SAFE")), Some(Value::Int(16))]);
        assert_eq!(cmd.get("spare").unwrap(), Some(&Value::Int(0xAA)));

        assert!(matches!(
            dict.decode(&[0xff, 0xff, 0]),
            Err(Error::UnknownSymbol(_))
        ));
        assert!(matches!(
            dict.decode(&[0x01, 0x02, 4, 0]),
            Err(Error::NotEnoughData { .. })
        ));
    }

    #[test]
    fn validate() {
        let dict = dictionary();
        let cmd = dict.create("SET_MODE", vec![Value::from("SCIENCE"), Value::Int(300)]).unwrap();
        let mut messages = Vec::new();
        assert!(cmd.validate(&mut messages));
        assert!(messages.is_empty());

        let cmd = dict.create("SET_MODE", vec![Value::from("OFF")]).unwrap();
        let mut messages = Vec::new();
        assert!(!cmd.validate(&mut messages));
        assert_eq!(
            messages,
            vec![
                "Expected 2 arguments, but received 1.".to_string(),
                "mode value 'OFF' not in allowed enumerated values.".to_string(),
                "Argument \"duration\" is missing.".to_string(),
            ]
        );

        let cmd = dict
            .create_with_kwargs(
                "SET_MODE",
                [("mode", Value::Int(0)), ("duration", Value::Int(0)), ("bogus", Value::Int(1))],
            )
            .unwrap();
        let mut messages = Vec::new();
        assert!(!cmd.validate(&mut messages));
        assert_eq!(
            messages,
            vec![
                "duration value '0' out of range [1, 600].".to_string(),
                "Argument \"bogus\" is unrecognized.".to_string(),
            ]
        );
    }

    #[test]
    fn missing_argument_on_encode() {
        let dict = dictionary();
        let cmd = dict.create("SET_MODE", vec![Value::Int(1)]).unwrap();
        assert!(matches!(cmd.encode(0), Err(Error::MissingArgument(name)) if name == "duration"));
    }

    #[test]
    fn duplicates_rejected() {
        let mut dict = dictionary();
        assert!(dict.add(CommandDefinition::new("NOOP", 0x9999, vec![]).unwrap()).is_err());
        assert!(dict.add(CommandDefinition::new("OTHER", 0x0001, vec![]).unwrap()).is_err());
        assert!(dict.create("NOPE", vec![]).is_err());
    }

    #[test]
    fn staging() {
        let big = CommandDefinition::new(
            "BIG",
            1,
            vec![ArgumentDefinition::builder()
                .name("blob")
                .dtype(TypeRegistry::default().get("U8[120]").unwrap())
                .build()],
        )
        .unwrap();
        assert!(big.staging_required());
        let small = CommandDefinition::new("SMALL", 2, vec![arg("a", "U8")]).unwrap();
        assert!(!small.staging_required());
    }

    #[test]
    fn explicit_arg_bytes() {
        let defn = CommandDefinition::new(
            "GAP",
            3,
            vec![
                ArgumentDefinition::builder()
                    .name("late")
                    .dtype(TypeRegistry::default().get("U8").unwrap())
                    .bytes(ByteSpec::Single(4))
                    .build(),
            ],
        )
        .unwrap();
        assert_eq!(defn.argsize(), 5);
        let cmd = Command::new(Arc::new(defn), vec![Value::Int(7)]);
        assert_eq!(cmd.encode(0).unwrap(), vec![0, 3, 5, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn tokens() {
        assert_eq!(parse_token("12"), Value::Int(12));
        assert_eq!(parse_token("0x1f"), Value::Int(31));
        assert_eq!(parse_token("-2.5"), Value::Float(-2.5));
        assert_eq!(parse_token("SAFE"), Value::from("SAFE"));
    }
}
