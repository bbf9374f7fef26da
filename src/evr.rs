//! Event records (EVRs) and EVR dictionaries.
use std::collections::HashMap;
use std::sync::Arc;

use tracing::error;

use crate::{Error, Result};

/// A single event record: a code and a printf-style message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvrDefinition {
    name: String,
    code: u16,
    desc: Option<String>,
    message: String,
}

impl EvrDefinition {
    pub fn new(name: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code,
            desc: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn code(&self) -> u16 {
        self.code
    }

    #[must_use]
    pub fn desc(&self) -> Option<&str> {
        self.desc.as_deref()
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Expand the message's format directives with values taken in order from `data`.
    ///
    /// `%s` reads a NUL terminated string, `%c` one byte, the integer conversions
    /// (`%d %i %u %x %X %o`) a 4-byte big-endian word, and the float conversions
    /// (`%f %e %g`) a 4-byte big-endian single precision float. Flags, width, and
    /// precision behave as in C. A message without directives is returned unchanged.
    ///
    /// ```
    /// use gds::evr::EvrDefinition;
    ///
    /// let evr = EvrDefinition::new("EVR_1", 1, "%c %s %u");
    /// let data = [0x21, 0x46, 0x6f, 0x6f, 0x00, 0xff, 0x11, 0x33, 0x44];
    /// assert_eq!(evr.format_message(&data).unwrap(), "! Foo 4279317316");
    /// ```
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `data` runs out before every directive is satisfied.
    pub fn format_message(&self, data: &[u8]) -> Result<String> {
        let mut out = String::with_capacity(self.message.len());
        let mut cursor = 0;
        let mut rest = self.message.as_str();

        while let Some(pct) = rest.find('%') {
            out.push_str(&rest[..pct]);
            rest = &rest[pct + 1..];
            if let Some(after) = rest.strip_prefix('%') {
                out.push('%');
                rest = after;
                continue;
            }
            match Directive::parse(rest) {
                Some((directive, consumed)) => {
                    out.push_str(&directive.render(data, &mut cursor)?);
                    rest = &rest[consumed..];
                }
                None => out.push('%'),
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct Directive {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
    width: usize,
    precision: Option<usize>,
    conversion: char,
}

impl Directive {
    /// Parse the text after a `%`, returning the directive and the bytes consumed.
    fn parse(text: &str) -> Option<(Self, usize)> {
        let bytes = text.as_bytes();
        let mut i = 0;
        let digits = |i: &mut usize| {
            let start = *i;
            while *i < bytes.len() && bytes[*i].is_ascii_digit() {
                *i += 1;
            }
            text[start..*i].parse::<usize>().ok()
        };

        // positional `N$` prefixes are accepted and ignored
        let save = i;
        if digits(&mut i).is_some() && bytes.get(i) == Some(&b'$') {
            i += 1;
        } else {
            i = save;
        }

        let mut d = Directive::default();
        while let Some(flag) = bytes.get(i) {
            match flag {
                b'-' => d.left = true,
                b'+' => d.plus = true,
                b' ' => d.space = true,
                b'0' => d.zero = true,
                b'#' => d.alt = true,
                _ => break,
            }
            i += 1;
        }
        d.width = digits(&mut i).unwrap_or(0);
        if bytes.get(i) == Some(&b'.') {
            i += 1;
            d.precision = Some(digits(&mut i).unwrap_or(0));
        }
        while matches!(bytes.get(i), Some(b'h' | b'l' | b'L')) {
            i += 1;
        }
        match bytes.get(i) {
            Some(c @ (b's' | b'c' | b'd' | b'i' | b'u' | b'x' | b'X' | b'o' | b'f' | b'F'
            | b'e' | b'E' | b'g' | b'G')) => {
                d.conversion = char::from(*c);
                Some((d, i + 1))
            }
            _ => None,
        }
    }

    fn take<'a>(data: &'a [u8], cursor: &mut usize, n: usize) -> Result<&'a [u8]> {
        let end = *cursor + n;
        let chunk = data.get(*cursor..end).ok_or(Error::NotEnoughData {
            actual: data.len(),
            minimum: end,
        })?;
        *cursor = end;
        Ok(chunk)
    }

    fn word(data: &[u8], cursor: &mut usize) -> Result<[u8; 4]> {
        let chunk = Self::take(data, cursor, 4)?;
        Ok([chunk[0], chunk[1], chunk[2], chunk[3]])
    }

    fn render(&self, data: &[u8], cursor: &mut usize) -> Result<String> {
        let (sign, body) = match self.conversion {
            's' => {
                let tail = data.get(*cursor..).unwrap_or_default();
                let Some(nul) = tail.iter().position(|b| *b == 0) else {
                    return Err(Error::NotEnoughData {
                        actual: data.len(),
                        minimum: data.len() + 1,
                    });
                };
                let mut s = String::from_utf8_lossy(&tail[..nul]).into_owned();
                *cursor += nul + 1;
                if let Some(p) = self.precision {
                    s = s.chars().take(p).collect();
                }
                return Ok(self.pad(String::new(), s, false));
            }
            'c' => {
                let b = Self::take(data, cursor, 1)?[0];
                return Ok(self.pad(String::new(), char::from(b).to_string(), false));
            }
            'd' | 'i' => {
                let v = i32::from_be_bytes(Self::word(data, cursor)?);
                let body = self.min_digits(v.unsigned_abs().to_string());
                (self.sign(v < 0), body)
            }
            'u' => {
                let v = u32::from_be_bytes(Self::word(data, cursor)?);
                (String::new(), self.min_digits(v.to_string()))
            }
            'x' | 'X' | 'o' => {
                let v = u32::from_be_bytes(Self::word(data, cursor)?);
                let digits = match self.conversion {
                    'x' => format!("{v:x}"),
                    'X' => format!("{v:X}"),
                    _ => format!("{v:o}"),
                };
                let prefix = match (self.alt && v != 0, self.conversion) {
                    (true, 'x') => "0x",
                    (true, 'X') => "0X",
                    (true, _) => "0",
                    _ => "",
                };
                (prefix.to_string(), self.min_digits(digits))
            }
            _ => {
                let v = f64::from(f32::from_be_bytes(Self::word(data, cursor)?));
                let precision = self.precision.unwrap_or(6);
                let upper = self.conversion.is_ascii_uppercase();
                let body = match self.conversion.to_ascii_lowercase() {
                    'f' => format_fixed(v.abs(), precision),
                    'e' => format_exp(v.abs(), precision, upper),
                    _ => format_general(v.abs(), precision, upper, self.alt),
                };
                let body = if upper { body.to_uppercase() } else { body };
                (self.sign(v.is_sign_negative() && !v.is_nan()), body)
            }
        };
        Ok(self.pad(sign, body, true))
    }

    fn sign(&self, negative: bool) -> String {
        match (negative, self.plus, self.space) {
            (true, _, _) => "-",
            (false, true, _) => "+",
            (false, false, true) => " ",
            _ => "",
        }
        .to_string()
    }

    fn min_digits(&self, digits: String) -> String {
        match self.precision {
            Some(p) if digits.len() < p => format!("{}{digits}", "0".repeat(p - digits.len())),
            _ => digits,
        }
    }

    fn pad(&self, prefix: String, body: String, numeric: bool) -> String {
        let len = prefix.chars().count() + body.chars().count();
        if len >= self.width {
            return prefix + &body;
        }
        let fill = self.width - len;
        if self.left {
            format!("{prefix}{body}{}", " ".repeat(fill))
        } else if self.zero && numeric {
            format!("{prefix}{}{body}", "0".repeat(fill))
        } else {
            format!("{}{prefix}{body}", " ".repeat(fill))
        }
    }
}

fn non_finite(v: f64) -> Option<String> {
    if v.is_nan() {
        Some("nan".to_string())
    } else if v.is_infinite() {
        Some("inf".to_string())
    } else {
        None
    }
}

fn format_fixed(v: f64, precision: usize) -> String {
    non_finite(v).unwrap_or_else(|| format!("{v:.precision$}"))
}

// C style exponent: at least two digits and always signed, e.g. `1.5e+00`.
fn format_exp(v: f64, precision: usize, upper: bool) -> String {
    if let Some(s) = non_finite(v) {
        return s;
    }
    let s = format!("{v:.precision$e}");
    let (mantissa, exp) = s.split_once('e').unwrap_or((s.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let e = if upper { 'E' } else { 'e' };
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}{e}{sign}{:02}", exp.abs())
}

fn strip_fraction_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

fn format_general(v: f64, precision: usize, upper: bool, alt: bool) -> String {
    if let Some(s) = non_finite(v) {
        return s;
    }
    let p = precision.max(1);
    if v == 0.0 {
        return if alt {
            format!("{:.*}", p - 1, 0.0)
        } else {
            "0".to_string()
        };
    }
    let rounded = format!("{v:.*e}", p - 1);
    let exp: i32 = rounded
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);
    let p = i32::try_from(p).unwrap_or(i32::MAX);
    if (-4..p).contains(&exp) {
        let decimals = usize::try_from(p - 1 - exp).unwrap_or(0);
        let s = format!("{v:.decimals$}");
        if alt {
            s
        } else {
            strip_fraction_zeros(&s)
        }
    } else {
        let s = format_exp(v, usize::try_from(p - 1).unwrap_or(0), upper);
        if alt {
            return s;
        }
        match s.split_once(if upper { 'E' } else { 'e' }) {
            Some((m, e)) => format!("{}{}{e}", strip_fraction_zeros(m), if upper { 'E' } else { 'e' }),
            None => s,
        }
    }
}

/// EVR definitions by name and code.
#[derive(Debug, Default)]
pub struct EvrDictionary {
    names: HashMap<String, Arc<EvrDefinition>>,
    codes: HashMap<u16, Arc<EvrDefinition>>,
}

impl EvrDictionary {
    /// # Errors
    /// [Error::Schema] if the name or code is already present.
    pub fn add(&mut self, defn: EvrDefinition) -> Result<Arc<EvrDefinition>> {
        if self.names.contains_key(defn.name()) || self.codes.contains_key(&defn.code()) {
            let msg = format!("Duplicate EVR name/code {} ({})", defn.name(), defn.code());
            error!("{msg}");
            return Err(Error::Schema(msg));
        }
        let defn = Arc::new(defn);
        self.names.insert(defn.name().to_string(), defn.clone());
        self.codes.insert(defn.code(), defn.clone());
        Ok(defn)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<EvrDefinition>> {
        self.names.get(name)
    }

    #[must_use]
    pub fn get_code(&self, code: u16) -> Option<&Arc<EvrDefinition>> {
        self.codes.get(&code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EvrDefinition>> {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn fmt(message: &str, data: &[u8]) -> Result<String> {
        EvrDefinition::new("EVR", 1, message).format_message(data)
    }

    #[test_case("No directives", &[], "No directives")]
    #[test_case("%d%%", &[0xff, 0xff, 0xff, 0xfe], "-2%")]
    #[test_case("%u", &[0xff, 0xff, 0xff, 0xfe], "4294967294")]
    #[test_case("0x%04X", &[0, 0, 0xab, 0xcd], "0xABCD")]
    #[test_case("%#x", &[0, 0, 0, 0xff], "0xff")]
    #[test_case("[%5d|%-5d]", &[0, 0, 0, 7, 0, 0, 0, 8], "[    7|8    ]")]
    #[test_case("%05i", &[0xff, 0xff, 0xff, 0xf9], "-0007")]
    #[test_case("%s and %s", b"ab\0cd\0", "ab and cd")]
    #[test_case("%.1s", b"xyz\0", "x")]
    fn integers_and_strings(message: &str, data: &[u8], expected: &str) {
        assert_eq!(fmt(message, data).unwrap(), expected);
    }

    #[test_case("%f", 1.5, "1.500000")]
    #[test_case("%.2f", -0.25, "-0.25")]
    #[test_case("%e", 1.5, "1.500000e+00")]
    #[test_case("%E", 0.00025, "2.500000E-04")]
    #[test_case("%g", 0.0001, "0.0001")]
    #[test_case("%g", 100000.0, "100000")]
    #[test_case("%g", 1000000.0, "1e+06")]
    #[test_case("%g", 2.5, "2.5")]
    fn floats(message: &str, value: f32, expected: &str) {
        assert_eq!(fmt(message, &value.to_be_bytes()).unwrap(), expected);
    }

    #[test]
    fn short_data() {
        assert!(matches!(
            fmt("%d", &[0, 1]),
            Err(Error::NotEnoughData { actual: 2, minimum: 4 })
        ));
        assert!(matches!(
            fmt("%s", b"no terminator"),
            Err(Error::NotEnoughData { .. })
        ));
    }

    #[test]
    fn unknown_directive_is_literal() {
        assert_eq!(fmt("100%q", &[]).unwrap(), "100%q");
    }

    #[test]
    fn dictionary() {
        let mut dict = EvrDictionary::default();
        dict.add(EvrDefinition::new("BOOT", 1, "booted")).unwrap();
        assert!(dict.add(EvrDefinition::new("BOOT", 2, "again")).is_err());
        assert!(dict.add(EvrDefinition::new("OTHER", 1, "same code")).is_err());
        assert_eq!(dict.get_code(1).unwrap().name(), "BOOT");
        assert_eq!(dict.get("BOOT").unwrap().code(), 1);
        assert_eq!(dict.len(), 1);
    }
}
