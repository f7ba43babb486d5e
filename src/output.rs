//! Status word sent to the control hardware.
//!
//! One canonical [`StatusWord`] is kept by the [`OutputStatusEncoder`]; the
//! packed byte and the colon-delimited line are both pure projections of it.
//!
//! Packed byte:
//!
//! ```text
//! bit 0    camera operational
//! bit 1    system error
//! bit 2    box detected
//! bits 3-4 type code (00 none, 01 10x20, 10 20x20, 11 30x50)
//! bits 5-7 reserved, always zero
//! ```
//!
//! Line: `<camera>:<error>:<detected>:<t0>:<t1>:<t2>\n`, where t0..t2 are the
//! LSB..MSB of a 3-bit one-hot type code (001 10x20, 010 20x20, 100 30x50).
//! The receiver drives pins D2..D7 from the six fields in order.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::classifier::BoxType;
use crate::config::OutputConfig;
use crate::error::ProtocolError;

const CAMERA_BIT: u8 = 0b0000_0001;
const ERROR_BIT: u8 = 0b0000_0010;
const DETECTED_BIT: u8 = 0b0000_0100;
const TYPE_SHIFT: u8 = 3;
const TYPE_MASK: u8 = 0b0001_1000;
const RESERVED_MASK: u8 = 0b1110_0000;

/// Marker the receiver firmware understands as "unknown type".
const LINE_UNKNOWN_BITS: u8 = 0b111;

/// Receiver pins, in line-field order.
pub const RECEIVER_PINS: [&str; 6] = ["D2", "D3", "D4", "D5", "D6", "D7"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TypeCode {
    #[default]
    None = 0b00,
    TenByTwenty = 0b01,
    TwentyByTwenty = 0b10,
    ThirtyByFifty = 0b11,
}

impl TypeCode {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => TypeCode::TenByTwenty,
            0b10 => TypeCode::TwentyByTwenty,
            0b11 => TypeCode::ThirtyByFifty,
            _ => TypeCode::None,
        }
    }

    /// 3-bit one-hot code used by the line protocol.
    pub fn line_bits(self) -> u8 {
        match self {
            TypeCode::None => 0b000,
            TypeCode::TenByTwenty => 0b001,
            TypeCode::TwentyByTwenty => 0b010,
            TypeCode::ThirtyByFifty => 0b100,
        }
    }

    pub fn from_line_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0b000 | LINE_UNKNOWN_BITS => Ok(TypeCode::None),
            0b001 => Ok(TypeCode::TenByTwenty),
            0b010 => Ok(TypeCode::TwentyByTwenty),
            0b100 => Ok(TypeCode::ThirtyByFifty),
            other => Err(ProtocolError::InvalidTypeBits(other)),
        }
    }

    pub fn label(self) -> &'static str {
        self.box_type().label()
    }

    pub fn box_type(self) -> BoxType {
        match self {
            TypeCode::None => BoxType::None,
            TypeCode::TenByTwenty => BoxType::TenByTwenty,
            TypeCode::TwentyByTwenty => BoxType::TwentyByTwenty,
            TypeCode::ThirtyByFifty => BoxType::ThirtyByFifty,
        }
    }
}

impl From<BoxType> for TypeCode {
    /// `Unknown` has no wire code of its own and collapses to `None`.
    fn from(box_type: BoxType) -> Self {
        match box_type {
            BoxType::TenByTwenty => TypeCode::TenByTwenty,
            BoxType::TwentyByTwenty => TypeCode::TwentyByTwenty,
            BoxType::ThirtyByFifty => TypeCode::ThirtyByFifty,
            BoxType::None | BoxType::Unknown => TypeCode::None,
        }
    }
}

/// Logical status fields shared by both wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusWord {
    pub camera_operational: bool,
    pub error: bool,
    pub detected: bool,
    pub type_code: TypeCode,
}

impl StatusWord {
    pub fn new(camera_operational: bool, error: bool, detected: bool, box_type: BoxType) -> Self {
        Self {
            camera_operational,
            error,
            detected,
            type_code: TypeCode::from(box_type),
        }
    }

    /// Camera on, no error, nothing detected.
    pub fn ready() -> Self {
        Self::new(true, false, false, BoxType::None)
    }

    /// Camera off, error raised, nothing detected.
    ///
    /// On the line this is `0:1:0:0:0:0`: the type fields stay zero. Older
    /// receiver firmware expected the `111` unknown marker here
    /// (`0:1:0:1:1:1`); [`StatusWord::parse_line`] still reads that as the
    /// same word, but the encoder never writes it.
    pub fn failure() -> Self {
        Self::new(false, true, false, BoxType::Unknown)
    }

    pub fn pack(&self) -> u8 {
        let mut byte = 0u8;
        if self.camera_operational {
            byte |= CAMERA_BIT;
        }
        if self.error {
            byte |= ERROR_BIT;
        }
        if self.detected {
            byte |= DETECTED_BIT;
        }
        byte | (self.type_code.bits() << TYPE_SHIFT)
    }

    pub fn unpack(byte: u8) -> Result<Self, ProtocolError> {
        if byte & RESERVED_MASK != 0 {
            return Err(ProtocolError::ReservedBits(byte));
        }
        Ok(Self {
            camera_operational: byte & CAMERA_BIT != 0,
            error: byte & ERROR_BIT != 0,
            detected: byte & DETECTED_BIT != 0,
            type_code: TypeCode::from_bits((byte & TYPE_MASK) >> TYPE_SHIFT),
        })
    }

    /// Six line fields in wire order: camera, error, detected, t0, t1, t2.
    pub fn line_fields(&self) -> [u8; 6] {
        let bits = self.type_code.line_bits();
        [
            u8::from(self.camera_operational),
            u8::from(self.error),
            u8::from(self.detected),
            bits & 1,
            (bits >> 1) & 1,
            (bits >> 2) & 1,
        ]
    }

    pub fn to_line(&self) -> String {
        let fields = self.line_fields();
        format!(
            "{}:{}:{}:{}:{}:{}\n",
            fields[0], fields[1], fields[2], fields[3], fields[4], fields[5]
        )
    }

    /// Decodes a line the way the receiver does: six integer fields, each
    /// clamped to 0/1.
    pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(':').collect();
        if parts.len() != 6 {
            return Err(ProtocolError::FieldCount(parts.len()));
        }

        let mut fields = [0u8; 6];
        for (index, part) in parts.iter().enumerate() {
            let value: i64 = part.trim().parse().map_err(|_| ProtocolError::InvalidField {
                index,
                value: part.to_string(),
            })?;
            fields[index] = u8::from(value > 0);
        }

        let type_bits = fields[3] | (fields[4] << 1) | (fields[5] << 2);
        Ok(Self {
            camera_operational: fields[0] == 1,
            error: fields[1] == 1,
            detected: fields[2] == 1,
            type_code: TypeCode::from_line_bits(type_bits)?,
        })
    }

    /// Pin name and level for each receiver output.
    pub fn pin_states(&self) -> [(&'static str, bool); 6] {
        let fields = self.line_fields();
        let mut pins = [("", false); 6];
        for (i, pin) in RECEIVER_PINS.iter().enumerate() {
            pins[i] = (*pin, fields[i] == 1);
        }
        pins
    }

    pub fn summary(&self) -> String {
        let byte = self.pack();
        format!(
            "Bin: {:08b} | Dec: {} | Camera: {} | Error: {} | Detection: {} | Type: {}",
            byte,
            byte,
            u8::from(self.camera_operational),
            u8::from(self.error),
            u8::from(self.detected),
            self.type_code.label()
        )
    }
}

/// Fixed sequence used to exercise the receiver wiring: idle, error, then
/// each catalog type in turn.
pub fn test_pattern() -> [(&'static str, StatusWord); 5] {
    [
        ("operational, nothing detected", StatusWord::ready()),
        ("system error", StatusWord::new(true, true, false, BoxType::Unknown)),
        ("10x20 detected", StatusWord::new(true, false, true, BoxType::TenByTwenty)),
        ("20x20 detected", StatusWord::new(true, false, true, BoxType::TwentyByTwenty)),
        ("30x50 detected", StatusWord::new(true, false, true, BoxType::ThirtyByFifty)),
    ]
}

/// One emission, already projected into both wire forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusFrame {
    pub word: StatusWord,
    pub packed: u8,
    pub line: String,
}

impl From<StatusWord> for StatusFrame {
    fn from(word: StatusWord) -> Self {
        Self {
            word,
            packed: word.pack(),
            line: word.to_line(),
        }
    }
}

/// Canonical status record with its emission bookkeeping.
#[derive(Debug, Clone)]
pub struct OutputStatus {
    pub word: StatusWord,
    pub last_update_time: Instant,
    pub history: VecDeque<u8>,
}

pub struct OutputStatusEncoder {
    status: OutputStatus,
    history_capacity: usize,
    operational_timeout: Duration,
}

impl OutputStatusEncoder {
    pub fn new(config: &OutputConfig, now: Instant) -> Self {
        Self {
            status: OutputStatus {
                word: StatusWord::default(),
                last_update_time: now,
                history: VecDeque::with_capacity(config.history_capacity),
            },
            history_capacity: config.history_capacity,
            operational_timeout: config.operational_timeout(),
        }
    }

    /// The single entry point: replaces the record, refreshes the liveness
    /// clock and records the packed byte.
    pub fn emit(
        &mut self,
        camera_operational: bool,
        error: bool,
        detected: bool,
        box_type: BoxType,
        now: Instant,
    ) -> StatusFrame {
        self.emit_word(StatusWord::new(camera_operational, error, detected, box_type), now)
    }

    pub fn emit_word(&mut self, word: StatusWord, now: Instant) -> StatusFrame {
        self.status.word = word;
        self.status.last_update_time = now;

        let frame = StatusFrame::from(word);
        self.status.history.push_back(frame.packed);
        while self.status.history.len() > self.history_capacity {
            self.status.history.pop_front();
        }

        debug!("Status emitted: {}", word.summary());
        frame
    }

    /// False once `operational_timeout` has passed without an emission. Each
    /// emission resets the clock, so this only observes the driving loop.
    pub fn is_operational(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.status.last_update_time) <= self.operational_timeout
    }

    pub fn status(&self) -> &OutputStatus {
        &self.status
    }

    pub fn word(&self) -> StatusWord {
        self.status.word
    }

    pub fn history(&self) -> &VecDeque<u8> {
        &self.status.history
    }
}
