//! Gate notification decoder
//!
//! Turns a raw notification payload into a typed [`GateEvent`]. The wire
//! format is vendor specific and not finalized, so marker classification is a
//! table of ordered byte ranges rather than hard-coded checks. The table can
//! be replaced from configuration once the real protocol is known.
//!
//! Payload layout:
//! - byte 0: event-type marker
//! - byte 1: originating lane (optional, defaults to the selected lane)

use crate::domain::types::{EventKind, GateEvent, Lane};
use serde::Deserialize;
use std::ops::RangeInclusive;

/// One classification rule: markers in `min..=max` map to `kind`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClassRule {
    pub min: u8,
    pub max: u8,
    pub kind: EventKind,
}

impl ClassRule {
    pub const fn new(min: u8, max: u8, kind: EventKind) -> Self {
        Self { min, max, kind }
    }

    #[inline]
    fn range(&self) -> RangeInclusive<u8> {
        self.min..=self.max
    }
}

/// Ordered marker → kind table. The first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationTable {
    rules: Vec<ClassRule>,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        Self {
            rules: vec![
                ClassRule::new(0x01, 0x10, EventKind::Start),
                ClassRule::new(0x02, 0x02, EventKind::End),
                ClassRule::new(0x80, 0xFF, EventKind::End),
            ],
        }
    }
}

impl ClassificationTable {
    /// Build a table from rules, rejecting inverted ranges
    pub fn from_rules(rules: Vec<ClassRule>) -> anyhow::Result<Self> {
        if let Some(bad) = rules.iter().find(|r| r.min > r.max) {
            anyhow::bail!(
                "decoder rule has min 0x{:02X} greater than max 0x{:02X}",
                bad.min,
                bad.max
            );
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[ClassRule] {
        &self.rules
    }

    /// Classify a marker byte
    #[inline]
    pub fn classify(&self, marker: u8) -> EventKind {
        self.rules
            .iter()
            .find(|rule| rule.range().contains(&marker))
            .map_or(EventKind::Unknown, |rule| rule.kind)
    }
}

/// Why a payload decoded the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Marker matched a rule and the lane is the selected one
    Classified(GateEvent),
    /// Marker matched no rule
    UnknownMarker { marker: u8, lane: Lane },
    /// Event came from a lane other than the selected one
    ForeignLane { kind: EventKind, lane: Lane },
    /// Zero-length payload
    Empty,
}

impl DecodeOutcome {
    /// Collapse to the event the engine acts on. Filtered outcomes are `Unknown`.
    pub fn event(&self, selected_lane: Lane) -> GateEvent {
        match *self {
            DecodeOutcome::Classified(event) => event,
            DecodeOutcome::UnknownMarker { lane, .. } | DecodeOutcome::ForeignLane { lane, .. } => {
                GateEvent::new(EventKind::Unknown, lane)
            }
            DecodeOutcome::Empty => GateEvent::new(EventKind::Unknown, selected_lane),
        }
    }
}

/// Pure payload decoder
#[derive(Debug, Clone, Default)]
pub struct EventDecoder {
    table: ClassificationTable,
}

impl EventDecoder {
    pub fn new(table: ClassificationTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ClassificationTable {
        &self.table
    }

    /// Decode a payload into the event the caller may act on
    pub fn decode(&self, payload: &[u8], selected_lane: Lane) -> GateEvent {
        self.decode_detailed(payload, selected_lane).event(selected_lane)
    }

    /// Decode and keep the reason for filtered payloads
    pub fn decode_detailed(&self, payload: &[u8], selected_lane: Lane) -> DecodeOutcome {
        let Some(&marker) = payload.first() else {
            return DecodeOutcome::Empty;
        };
        let lane = payload.get(1).map_or(selected_lane, |&b| Lane(b));
        let kind = self.table.classify(marker);

        if lane != selected_lane {
            return DecodeOutcome::ForeignLane { kind, lane };
        }
        match kind {
            EventKind::Unknown => DecodeOutcome::UnknownMarker { marker, lane },
            kind => DecodeOutcome::Classified(GateEvent::new(kind, lane)),
        }
    }
}
