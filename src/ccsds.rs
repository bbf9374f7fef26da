//! CCSDS space packet primary header.
//!
//! The header is an ordinary [PacketDefinition] whose fields are bit fields packed into six
//! bytes:
//!
//! ```text
//! | version:3 | type:1 | shflag:1 | apid:11 | seqflags:2 | seqcount:14 | length:16 |
//! ```
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::field::{ByteSpec, Enumeration, FieldDefinition};
use crate::packet::{Apid, Packet, PacketDefinition};
use crate::types::TypeRegistry;
use crate::{Result, Value};

/// Primary header length in bytes.
pub const HEADER_LEN: usize = 6;

/// Sequence flag for a packet that is not part of a segmented group.
pub const SEQ_UNSEGMENTED: u8 = 3;

fn build_header_definition() -> Result<PacketDefinition> {
    let registry = TypeRegistry::default();
    let u8_type = registry.get("U8")?;
    let u16_type = registry.get("MSB_U16")?;
    let masked = |name: &str, bytes: ByteSpec, wide: bool, mask: u64| {
        FieldDefinition::builder()
            .name(name)
            .dtype(if wide { u16_type.clone() } else { u8_type.clone() })
            .bytes(bytes)
            .mask(mask)
            .build()
    };

    let seqflags = FieldDefinition::builder()
        .name("seqflags")
        .dtype(u8_type.clone())
        .bytes(ByteSpec::Single(2))
        .mask(0xC0)
        .enumeration(Enumeration::new([
            (0, "Continuation Segment"),
            (1, "First Segment"),
            (2, "Last Segment"),
            (3, "Unsegmented"),
        ])?)
        .build();
    let length = FieldDefinition::builder()
        .name("length")
        .dtype(u16_type.clone())
        .bytes(ByteSpec::Range(4, 5))
        .build();

    PacketDefinition::new(
        "CCSDS_Header",
        vec![
            masked("version", ByteSpec::Single(0), false, 0xE0),
            masked("type", ByteSpec::Single(0), false, 0x10),
            masked("shflag", ByteSpec::Single(0), false, 0x08),
            masked("apid", ByteSpec::Range(0, 1), true, 0x07FF),
            seqflags,
            masked("seqcount", ByteSpec::Range(2, 3), true, 0x3FFF),
            length,
        ],
    )
}

/// Shared primary header definition.
///
/// # Errors
/// Only if the built-in definition fails to build.
pub fn header_definition() -> Result<Arc<PacketDefinition>> {
    static DEFINITION: OnceLock<Arc<PacketDefinition>> = OnceLock::new();
    if let Some(defn) = DEFINITION.get() {
        return Ok(defn.clone());
    }
    let defn = Arc::new(build_header_definition()?);
    Ok(DEFINITION.get_or_init(|| defn).clone())
}

/// A primary header as a [Packet]. New headers are unsegmented.
///
/// # Example
/// ```
/// use gds::ccsds::CcsdsHeader;
/// use gds::Value;
///
/// let header = CcsdsHeader::from_bytes(&[0x18, 0x2a, 0xc4, 0xd2, 0x16, 0x2e]).unwrap();
/// assert_eq!(header.get("apid").unwrap(), Some(Value::Int(42)));
/// assert_eq!(header.get("seqflags").unwrap(), Some(Value::from("Unsegmented")));
/// ```
#[derive(Debug, Clone)]
pub struct CcsdsHeader(Packet);

impl CcsdsHeader {
    /// # Errors
    /// Only if the built-in definition fails to build.
    pub fn new() -> Result<Self> {
        let mut pkt = Packet::new(header_definition()?);
        pkt.set("seqflags", &Value::from(SEQ_UNSEGMENTED))?;
        Ok(Self(pkt))
    }

    /// # Errors
    /// [crate::Error::NotEnoughData] if fewer than [HEADER_LEN] bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Packet::from_bytes(header_definition()?, bytes).map(Self)
    }

    #[must_use]
    pub fn into_packet(self) -> Packet {
        self.0
    }
}

impl Deref for CcsdsHeader {
    type Target = Packet;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for CcsdsHeader {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

fn default_seqflags() -> u8 {
    SEQ_UNSEGMENTED
}

/// Expected primary header values for one kind of packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcsdsDefinition {
    #[serde(default)]
    pub version: u8,
    #[serde(default, rename = "type")]
    pub packet_type: u8,
    /// Whether a secondary header follows.
    #[serde(default)]
    pub secondary: bool,
    #[serde(default)]
    pub apid: Apid,
    #[serde(default = "default_seqflags")]
    pub seqflags: u8,
    #[serde(default)]
    pub length: u16,
}

impl Default for CcsdsDefinition {
    fn default() -> Self {
        Self {
            version: 0,
            packet_type: 0,
            secondary: false,
            apid: 0,
            seqflags: SEQ_UNSEGMENTED,
            length: 0,
        }
    }
}

impl CcsdsDefinition {
    #[must_use]
    pub fn shflag(&self) -> u8 {
        u8::from(self.secondary)
    }

    /// Header populated with these values and a zero sequence count.
    ///
    /// # Errors
    /// [crate::Error::OutOfRange] if a value does not fit its bit field.
    pub fn header(&self) -> Result<CcsdsHeader> {
        let mut header = CcsdsHeader::new()?;
        header.set("version", &Value::from(self.version))?;
        header.set("type", &Value::from(self.packet_type))?;
        header.set("shflag", &Value::from(self.shflag()))?;
        header.set("apid", &Value::from(self.apid))?;
        header.set("seqflags", &Value::from(self.seqflags))?;
        header.set("length", &Value::from(self.length))?;
        Ok(header)
    }

    /// True if `header` has the expected version, type, secondary header flag, and APID.
    ///
    /// # Errors
    /// Any error reading the header fields.
    pub fn matches(&self, header: &Packet) -> Result<bool> {
        let expected = [
            ("version", i128::from(self.version)),
            ("type", i128::from(self.packet_type)),
            ("shflag", i128::from(self.shflag())),
            ("apid", i128::from(self.apid)),
        ];
        let raw = header.raw();
        for (name, want) in expected {
            if raw.get(name)?.and_then(|v| v.as_i128()) != Some(want) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
