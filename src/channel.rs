use anyhow::{anyhow, Result};

/// Event class carried by a channel identifier. The discriminants of the
/// plain MIDI variants are the status-byte high nibbles, so they can be used
/// directly when (de)serialising command sections. `Rpn`/`Nrpn` are virtual
/// channels fed by the EPN reassembly machine and never appear as raw status
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    Rpn = 0x01,
    Nrpn = 0x02,
    NoteOff = 0x80,
    Note = 0x90,
    Pressure = 0xA0,
    Cc = 0xB0,
    Program = 0xC0,
    Aftertouch = 0xD0,
    Pitchbend = 0xE0,
}

impl EventType {
    /// Map a MIDI status high nibble to an event type.
    pub fn from_status(status: u8) -> Option<Self> {
        match status & 0xF0 {
            0x80 => Some(EventType::NoteOff),
            0x90 => Some(EventType::Note),
            0xA0 => Some(EventType::Pressure),
            0xB0 => Some(EventType::Cc),
            0xC0 => Some(EventType::Program),
            0xD0 => Some(EventType::Aftertouch),
            0xE0 => Some(EventType::Pitchbend),
            _ => None,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(EventType::Rpn),
            0x02 => Some(EventType::Nrpn),
            other => Self::from_status(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventType::Note => "note",
            EventType::NoteOff => "note_off",
            EventType::Cc => "cc",
            EventType::Pressure => "pressure",
            EventType::Aftertouch => "aftertouch",
            EventType::Pitchbend => "pitch",
            EventType::Program => "program",
            EventType::Rpn => "rpn",
            EventType::Nrpn => "nrpn",
        }
    }

    /// Whether the wire form carries a single data byte (no control byte).
    pub fn single_byte(self) -> bool {
        matches!(self, EventType::Aftertouch | EventType::Program)
    }
}

/// Packed channel identifier: `{type:8, channel:8, control:16, reserved:32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct ChannelIdent {
    pub kind: EventType,
    pub channel: u8,
    pub control: u16,
    reserved: u32,
}

// The identifier must pack exactly into the 64-bit label.
const _: () = assert!(std::mem::size_of::<ChannelIdent>() == 8);

impl ChannelIdent {
    pub fn new(kind: EventType, channel: u8, control: u16) -> Self {
        Self {
            kind,
            channel,
            control,
            reserved: 0,
        }
    }

    /// The 64-bit map-key view of the identifier.
    pub fn label(self) -> u64 {
        (self.kind as u64) << 56 | (self.channel as u64) << 48 | (self.control as u64) << 32
    }

    pub fn from_label(label: u64) -> Option<Self> {
        let kind = EventType::from_raw((label >> 56) as u8)?;
        Some(Self::new(
            kind,
            (label >> 48) as u8,
            (label >> 32) as u16,
        ))
    }
}

impl std::fmt::Display for ChannelIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.kind.single_byte() || self.kind == EventType::Pitchbend {
            write!(f, "ch{}.{}", self.channel, self.kind.name())
        } else {
            write!(f, "ch{}.{}{}", self.channel, self.kind.name(), self.control)
        }
    }
}

/// Parse a channel specification of the form `ch<N>.<type><M>` (the long
/// prefix `channel<N>` is also accepted, `M` defaults to 0).
pub fn parse_spec(spec: &str) -> Result<ChannelIdent> {
    let rest = spec
        .strip_prefix("channel")
        .or_else(|| spec.strip_prefix("ch"))
        .ok_or_else(|| anyhow!("invalid channel specification {}", spec))?;

    let dot = rest
        .find('.')
        .ok_or_else(|| anyhow!("channel specification {} does not conform to ch<X>.<control><Y>", spec))?;
    let channel: u8 = rest[..dot]
        .parse()
        .map_err(|_| anyhow!("invalid channel number in spec {}", spec))?;
    if channel > 15 {
        return Err(anyhow!("channel out of range in channel spec {}", spec));
    }

    let control_spec = &rest[dot + 1..];
    // note_off and nrpn have to be matched before their prefixes
    let keywords = [
        ("note_off", EventType::NoteOff),
        ("note", EventType::Note),
        ("nrpn", EventType::Nrpn),
        ("rpn", EventType::Rpn),
        ("cc", EventType::Cc),
        ("pressure", EventType::Pressure),
        ("pitch", EventType::Pitchbend),
        ("aftertouch", EventType::Aftertouch),
        ("program", EventType::Program),
    ];

    for (keyword, kind) in keywords {
        if let Some(num) = control_spec.strip_prefix(keyword) {
            let control = if num.is_empty() {
                0
            } else {
                num.parse()
                    .map_err(|_| anyhow!("invalid control number in spec {}", spec))?
            };
            return Ok(ChannelIdent::new(kind, channel, control));
        }
    }

    Err(anyhow!("unknown control type in spec {}", spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parsing() {
        let ident = parse_spec("ch1.cc7").unwrap();
        assert_eq!(ident, ChannelIdent::new(EventType::Cc, 1, 7));

        let ident = parse_spec("channel15.note_off64").unwrap();
        assert_eq!(ident, ChannelIdent::new(EventType::NoteOff, 15, 64));

        let ident = parse_spec("ch2.nrpn300").unwrap();
        assert_eq!(ident, ChannelIdent::new(EventType::Nrpn, 2, 300));

        let ident = parse_spec("ch0.pitch").unwrap();
        assert_eq!(ident.kind, EventType::Pitchbend);
        assert_eq!(ident.control, 0);
    }

    #[test]
    fn spec_rejects_garbage() {
        assert!(parse_spec("cc7").is_err());
        assert!(parse_spec("ch16.cc7").is_err());
        assert!(parse_spec("ch1.bogus").is_err());
        assert!(parse_spec("ch1cc7").is_err());
    }

    #[test]
    fn label_round_trip() {
        let ident = ChannelIdent::new(EventType::Rpn, 9, 0x0102);
        assert_eq!(ChannelIdent::from_label(ident.label()), Some(ident));
        assert_eq!(ident.label() & 0xFFFF_FFFF, 0);
    }

    #[test]
    fn display_matches_spec_form() {
        assert_eq!(parse_spec("ch3.cc7").unwrap().to_string(), "ch3.cc7");
        assert_eq!(parse_spec("ch0.pitch").unwrap().to_string(), "ch0.pitch");
    }
}
