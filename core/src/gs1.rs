//! GS1 marking-code grammar.
//!
//! A marking code is a sequence of GS1 application identifiers (AIs), each
//! followed by its value. Two spellings are accepted:
//!
//! - **Bracketed** (human readable): `(01)04600000000000(21)ABC123(91)EE07(92)dGVzdA==`
//! - **Raw** (as emitted by a scanner): optional symbology identifier (`]d2`, `]C1`,
//!   `]Q3`), AIs written without brackets, variable-length values terminated by
//!   the FNC1 separator (ASCII 29, `GS`) unless they are last.
//!
//! | AI     | Field               | Length        |
//! |--------|---------------------|---------------|
//! | `01`   | GTIN                | 14 digits     |
//! | `21`   | serial              | 1..=20        |
//! | `91`   | verification key id | 1..=4         |
//! | `92`   | verification code   | 1..=88        |
//! | `93`   | crypto tail         | 1..=4         |
//! | `17`   | expiry (`YYMMDD`)   | 6 digits      |
//! | `10`   | batch               | 1..=20        |
//! | `8005` | unit price          | 6 digits      |
//!
//! `01` and `21` are mandatory; their pair identifies the unit.
//!
//! # Example
//!
//! ```
//! use marksign_core::gs1::MarkingCode;
//!
//! let code = MarkingCode::parse("(01)04600000000000(21)ABC123").unwrap();
//! assert_eq!(code.gtin(), "04600000000000");
//! assert_eq!(code.serial(), "ABC123");
//!
//! let raw = MarkingCode::parse("]d2010460000000000021ABC123").unwrap();
//! assert_eq!(raw, code);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// FNC1 group separator used in raw scanner output.
pub const GROUP_SEPARATOR: char = '\u{1d}';

const SYMBOLOGY_PREFIXES: [&str; 3] = ["]d2", "]C1", "]Q3"];

/// Errors produced while parsing a marking code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeParseError {
    /// Input was empty after trimming.
    #[error("Marking code is empty")]
    Empty,

    /// Text at the given byte offset does not start with a known AI.
    #[error("Unknown application identifier at offset {offset}: {found}")]
    UnknownIdentifier {
        /// Byte offset into the input.
        offset: usize,
        /// Up to four characters found there.
        found: String,
    },

    /// Bracketed form with an unbalanced or misplaced bracket.
    #[error("Malformed bracketed code: {0}")]
    Malformed(String),

    /// A value violated its AI's length or charset rule.
    #[error("Invalid value for AI ({ai}): {reason}")]
    InvalidValue {
        /// The AI whose value is invalid.
        ai: &'static str,
        /// What rule was broken.
        reason: String,
    },

    /// The same AI appeared twice.
    #[error("Application identifier ({0}) appears more than once")]
    Duplicate(&'static str),

    /// A mandatory AI is absent.
    #[error("Mandatory application identifier ({0}) is missing")]
    Missing(&'static str),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Length {
    Fixed(usize),
    Variable(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Ai {
    Gtin,
    Serial,
    VerificationKey,
    VerificationCode,
    CryptoTail,
    Expiry,
    Batch,
    Price,
}

impl Ai {
    // Longest identifiers first so `8005` is never read as a shorter AI.
    const KNOWN: [Self; 8] = [
        Self::Price,
        Self::Gtin,
        Self::Serial,
        Self::VerificationKey,
        Self::VerificationCode,
        Self::CryptoTail,
        Self::Expiry,
        Self::Batch,
    ];

    const fn code(self) -> &'static str {
        match self {
            Self::Gtin => "01",
            Self::Serial => "21",
            Self::VerificationKey => "91",
            Self::VerificationCode => "92",
            Self::CryptoTail => "93",
            Self::Expiry => "17",
            Self::Batch => "10",
            Self::Price => "8005",
        }
    }

    const fn length(self) -> Length {
        match self {
            Self::Gtin => Length::Fixed(14),
            Self::Expiry | Self::Price => Length::Fixed(6),
            Self::Serial | Self::Batch => Length::Variable(20),
            Self::VerificationKey | Self::CryptoTail => Length::Variable(4),
            Self::VerificationCode => Length::Variable(88),
        }
    }

    const fn numeric(self) -> bool {
        matches!(self, Self::Gtin | Self::Expiry | Self::Price)
    }

    fn from_code(code: &str) -> Option<Self> {
        Self::KNOWN.into_iter().find(|ai| ai.code() == code)
    }

    fn at_start_of(input: &str) -> Option<Self> {
        Self::KNOWN.into_iter().find(|ai| input.starts_with(ai.code()))
    }
}

/// A parsed marking code with named fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkingCode {
    gtin: String,
    serial: String,
    verification_key: Option<String>,
    verification_code: Option<String>,
    crypto_tail: Option<String>,
    expiry: Option<String>,
    batch: Option<String>,
    price: Option<String>,
}

impl MarkingCode {
    /// Parse a marking code in bracketed or raw form.
    ///
    /// # Errors
    ///
    /// Returns [`CodeParseError`] describing the first grammar violation found.
    pub fn parse(input: &str) -> Result<Self, CodeParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(CodeParseError::Empty);
        }

        let segments = if trimmed.starts_with('(') {
            bracketed_segments(trimmed)?
        } else {
            raw_segments(trimmed)?
        };

        let mut builder = Fields::default();
        for (ai, value) in segments {
            validate_value(ai, &value)?;
            builder.set(ai, value)?;
        }
        builder.finish()
    }

    /// 14-digit GTIN (AI 01).
    #[must_use]
    pub fn gtin(&self) -> &str {
        &self.gtin
    }

    /// Serial number (AI 21).
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Verification key id (AI 91).
    #[must_use]
    pub fn verification_key(&self) -> Option<&str> {
        self.verification_key.as_deref()
    }

    /// Verification code (AI 92).
    #[must_use]
    pub fn verification_code(&self) -> Option<&str> {
        self.verification_code.as_deref()
    }

    /// Short crypto tail (AI 93).
    #[must_use]
    pub fn crypto_tail(&self) -> Option<&str> {
        self.crypto_tail.as_deref()
    }

    /// Expiry date as `YYMMDD` (AI 17).
    #[must_use]
    pub fn expiry(&self) -> Option<&str> {
        self.expiry.as_deref()
    }

    /// Batch number (AI 10).
    #[must_use]
    pub fn batch(&self) -> Option<&str> {
        self.batch.as_deref()
    }

    /// Unit price (AI 8005).
    #[must_use]
    pub fn price(&self) -> Option<&str> {
        self.price.as_deref()
    }

    /// Identity part of the code: `(01)GTIN(21)SERIAL`.
    #[must_use]
    pub fn short(&self) -> String {
        format!("(01){}(21){}", self.gtin, self.serial)
    }

    /// Raw rendition with FNC1 separators after variable-length values.
    #[must_use]
    pub fn to_raw(&self) -> String {
        let fields = self.fields();
        let mut out = String::new();
        for (index, (ai, value)) in fields.iter().enumerate() {
            out.push_str(ai.code());
            out.push_str(value);
            let last = index + 1 == fields.len();
            if matches!(ai.length(), Length::Variable(_)) && !last {
                out.push(GROUP_SEPARATOR);
            }
        }
        out
    }

    fn fields(&self) -> Vec<(Ai, &str)> {
        let optional = [
            (Ai::VerificationKey, self.verification_key.as_deref()),
            (Ai::VerificationCode, self.verification_code.as_deref()),
            (Ai::CryptoTail, self.crypto_tail.as_deref()),
            (Ai::Expiry, self.expiry.as_deref()),
            (Ai::Batch, self.batch.as_deref()),
            (Ai::Price, self.price.as_deref()),
        ];

        let mut fields = vec![(Ai::Gtin, self.gtin.as_str()), (Ai::Serial, self.serial.as_str())];
        fields.extend(
            optional
                .into_iter()
                .filter_map(|(ai, value)| value.map(|v| (ai, v))),
        );
        fields
    }
}

impl fmt::Display for MarkingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (ai, value) in self.fields() {
            write!(f, "({}){value}", ai.code())?;
        }
        Ok(())
    }
}

impl std::str::FromStr for MarkingCode {
    type Err = CodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Default)]
struct Fields {
    gtin: Option<String>,
    serial: Option<String>,
    verification_key: Option<String>,
    verification_code: Option<String>,
    crypto_tail: Option<String>,
    expiry: Option<String>,
    batch: Option<String>,
    price: Option<String>,
}

impl Fields {
    fn set(&mut self, ai: Ai, value: String) -> Result<(), CodeParseError> {
        let slot = match ai {
            Ai::Gtin => &mut self.gtin,
            Ai::Serial => &mut self.serial,
            Ai::VerificationKey => &mut self.verification_key,
            Ai::VerificationCode => &mut self.verification_code,
            Ai::CryptoTail => &mut self.crypto_tail,
            Ai::Expiry => &mut self.expiry,
            Ai::Batch => &mut self.batch,
            Ai::Price => &mut self.price,
        };
        if slot.is_some() {
            return Err(CodeParseError::Duplicate(ai.code()));
        }
        *slot = Some(value);
        Ok(())
    }

    fn finish(self) -> Result<MarkingCode, CodeParseError> {
        Ok(MarkingCode {
            gtin: self.gtin.ok_or(CodeParseError::Missing(Ai::Gtin.code()))?,
            serial: self.serial.ok_or(CodeParseError::Missing(Ai::Serial.code()))?,
            verification_key: self.verification_key,
            verification_code: self.verification_code,
            crypto_tail: self.crypto_tail,
            expiry: self.expiry,
            batch: self.batch,
            price: self.price,
        })
    }
}

fn validate_value(ai: Ai, value: &str) -> Result<(), CodeParseError> {
    let invalid = |reason: String| CodeParseError::InvalidValue {
        ai: ai.code(),
        reason,
    };

    let len = value.chars().count();
    match ai.length() {
        Length::Fixed(n) if len != n => {
            return Err(invalid(format!("expected {n} characters, got {len}")));
        },
        Length::Variable(max) if len == 0 || len > max => {
            return Err(invalid(format!("expected 1..={max} characters, got {len}")));
        },
        _ => {},
    }

    if ai.numeric() && !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid("expected digits only".to_string()));
    }
    if !value.chars().all(|c| c.is_ascii_graphic()) {
        return Err(invalid("contains whitespace or non-ASCII characters".to_string()));
    }
    Ok(())
}

fn bracketed_segments(input: &str) -> Result<Vec<(Ai, String)>, CodeParseError> {
    let mut segments = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let Some(after_open) = rest.strip_prefix('(') else {
            return Err(CodeParseError::Malformed(format!("expected '(' at: {rest}")));
        };
        let Some(close) = after_open.find(')') else {
            return Err(CodeParseError::Malformed("unclosed '('".to_string()));
        };
        let code = &after_open[..close];
        let ai = Ai::from_code(code).ok_or_else(|| CodeParseError::UnknownIdentifier {
            offset: input.len() - rest.len() + 1,
            found: code.to_string(),
        })?;

        // A value may itself contain brackets, so it only ends where a known
        // bracketed AI begins.
        let value_area = &after_open[close + 1..];
        let end = next_bracketed_ai(value_area).unwrap_or(value_area.len());
        segments.push((ai, value_area[..end].to_string()));
        rest = &value_area[end..];
    }

    Ok(segments)
}

fn next_bracketed_ai(area: &str) -> Option<usize> {
    area.match_indices('(').map(|(i, _)| i).find(|&i| {
        let candidate = &area[i + 1..];
        Ai::KNOWN.into_iter().any(|ai| {
            candidate
                .strip_prefix(ai.code())
                .is_some_and(|tail| tail.starts_with(')'))
        })
    })
}

fn raw_segments(input: &str) -> Result<Vec<(Ai, String)>, CodeParseError> {
    let mut rest = SYMBOLOGY_PREFIXES
        .iter()
        .find_map(|prefix| input.strip_prefix(prefix))
        .unwrap_or(input);
    rest = rest.trim_start_matches(GROUP_SEPARATOR);

    let mut segments = Vec::new();
    while !rest.is_empty() {
        let ai = Ai::at_start_of(rest).ok_or_else(|| CodeParseError::UnknownIdentifier {
            offset: input.len() - rest.len(),
            found: rest.chars().take(4).collect(),
        })?;
        let body = &rest[ai.code().len()..];

        let (value, remainder) = match ai.length() {
            Length::Fixed(n) => {
                let split = body
                    .char_indices()
                    .nth(n)
                    .map_or(body.len(), |(i, _)| i);
                (&body[..split], &body[split..])
            },
            Length::Variable(_) => match body.find(GROUP_SEPARATOR) {
                Some(i) => (&body[..i], &body[i..]),
                None => (body, ""),
            },
        };

        segments.push((ai, value.to_string()));
        rest = remainder.trim_start_matches(GROUP_SEPARATOR);
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: &str = "(01)04600000000000(21)ABC123";

    #[test]
    fn parses_bracketed_identity() {
        let code = MarkingCode::parse(SHORT).unwrap_or_else(|e| unreachable!("{e}"));
        assert_eq!(code.gtin(), "04600000000000");
        assert_eq!(code.serial(), "ABC123");
        assert_eq!(code.short(), SHORT);
        assert_eq!(code.to_string(), SHORT);
    }

    #[test]
    fn parses_full_bracketed_code() {
        let code = MarkingCode::parse("(01)04600000000000(21)ABC123(91)EE07(92)dGVzdA==(93)ab12")
            .unwrap_or_else(|e| unreachable!("{e}"));
        assert_eq!(code.verification_key(), Some("EE07"));
        assert_eq!(code.verification_code(), Some("dGVzdA=="));
        assert_eq!(code.crypto_tail(), Some("ab12"));
    }

    #[test]
    fn bracketed_value_may_contain_brackets() {
        let code = MarkingCode::parse("(01)04600000000000(21)A(B)C(93)zz")
            .unwrap_or_else(|e| unreachable!("{e}"));
        assert_eq!(code.serial(), "A(B)C");
        assert_eq!(code.crypto_tail(), Some("zz"));
    }

    #[test]
    fn parses_raw_scanner_output() {
        let raw = "]d2010460000000000021ABC123\u{1d}91EE07\u{1d}92dGVzdA==";
        let code = MarkingCode::parse(raw).unwrap_or_else(|e| unreachable!("{e}"));
        assert_eq!(code.gtin(), "04600000000000");
        assert_eq!(code.serial(), "ABC123");
        assert_eq!(code.verification_key(), Some("EE07"));
        assert_eq!(code.verification_code(), Some("dGVzdA=="));
    }

    #[test]
    fn raw_and_bracketed_forms_agree() {
        let bracketed = MarkingCode::parse("(01)04600000000000(21)XYZ(17)260101(10)B1")
            .unwrap_or_else(|e| unreachable!("{e}"));
        let raw = MarkingCode::parse(&bracketed.to_raw()).unwrap_or_else(|e| unreachable!("{e}"));
        assert_eq!(bracketed, raw);
    }

    #[test]
    fn price_is_not_mistaken_for_shorter_ai() {
        let code = MarkingCode::parse("010460000000000021SN\u{1d}8005000150")
            .unwrap_or_else(|e| unreachable!("{e}"));
        assert_eq!(code.price(), Some("000150"));
    }

    #[test]
    fn missing_serial_is_rejected() {
        assert_eq!(
            MarkingCode::parse("(01)04600000000000"),
            Err(CodeParseError::Missing("21"))
        );
    }

    #[test]
    fn short_gtin_is_rejected() {
        let err = MarkingCode::parse("(01)123(21)A").err();
        assert!(matches!(err, Some(CodeParseError::InvalidValue { ai: "01", .. })));
    }

    #[test]
    fn non_numeric_gtin_is_rejected() {
        let err = MarkingCode::parse("(01)0460000000000X(21)A").err();
        assert!(matches!(err, Some(CodeParseError::InvalidValue { ai: "01", .. })));
    }

    #[test]
    fn overlong_serial_is_rejected() {
        let input = format!("(01)04600000000000(21){}", "S".repeat(21));
        let err = MarkingCode::parse(&input).err();
        assert!(matches!(err, Some(CodeParseError::InvalidValue { ai: "21", .. })));
    }

    #[test]
    fn unknown_ai_is_rejected() {
        let err = MarkingCode::parse("(99)x(01)04600000000000(21)A").err();
        assert!(matches!(err, Some(CodeParseError::UnknownIdentifier { offset: 1, .. })));

        let err = MarkingCode::parse("990460").err();
        assert!(matches!(err, Some(CodeParseError::UnknownIdentifier { offset: 0, .. })));
    }

    #[test]
    fn duplicate_ai_is_rejected() {
        assert_eq!(
            MarkingCode::parse("(01)04600000000000(21)A(21)B"),
            Err(CodeParseError::Duplicate("21"))
        );
    }

    #[test]
    fn empty_and_malformed_inputs() {
        assert_eq!(MarkingCode::parse("   "), Err(CodeParseError::Empty));
        assert!(matches!(
            MarkingCode::parse("(01"),
            Err(CodeParseError::Malformed(_))
        ));
    }
}
