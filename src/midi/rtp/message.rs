//! RTP-MIDI frame codec (RFC 6295 payload format): the 12-byte RTP header
//! and the MIDI command section. The recovery journal is not implemented;
//! the journal flag is never set on send and journal data is not parsed.

use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};
use log::{debug, warn};

use crate::channel::{ChannelIdent, EventType};

/// Fixed transmit/receive buffer size, comfortably one ethernet MTU.
pub const PACKET_BUFFER: usize = 1500;
/// RTP v2, no padding, no extension, no CSRCs.
pub const HEADER_MAGIC: u8 = 0x80;
/// Dynamic payload type carrying MIDI.
pub const PAYLOAD_TYPE: u8 = 0x61;

pub const RTP_HEADER_LEN: usize = 12;
const COMMAND_HEADER_LEN: usize = 2;

/// The RTP fixed header fields this backend actually varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn push(&self, buf: &mut BytesMut) {
        buf.put_u8(HEADER_MAGIC);
        buf.put_u8(if self.marker { 0x80 } else { 0 } | PAYLOAD_TYPE);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Parse and validate the header magic. Frames that are not RTP-MIDI
    /// (wrong version bits or payload type) are rejected here.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < RTP_HEADER_LEN {
            return Err(anyhow!("short RTP frame: {} bytes", frame.len()));
        }
        if frame[0] != HEADER_MAGIC || frame[1] & 0x7F != PAYLOAD_TYPE {
            return Err(anyhow!("frame with invalid RTP header magic"));
        }
        Ok(Self {
            marker: frame[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([frame[2], frame[3]]),
            timestamp: u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
            ssrc: u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]),
        })
    }
}

/// A MIDI event decoded from an inbound command section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedEvent {
    pub ident: ChannelIdent,
    pub value: f64,
    pub raw: u16,
}

fn push_midi(buf: &mut BytesMut, kind: EventType, channel: u8, control: u8, value: u16) -> bool {
    let len = if kind.single_byte() { 3 } else { 4 };
    if buf.len() + len > PACKET_BUFFER {
        return false;
    }

    buf.put_u8(0); // delta-time
    buf.put_u8(kind as u8 | channel);
    match kind {
        EventType::Pitchbend => {
            buf.put_u8((value & 0x7F) as u8);
            buf.put_u8(((value >> 7) & 0x7F) as u8);
        }
        EventType::Aftertouch | EventType::Program => {
            buf.put_u8((value & 0x7F) as u8);
        }
        _ => {
            buf.put_u8(control);
            buf.put_u8((value & 0x7F) as u8);
        }
    }
    true
}

/// Serialise one outbound batch into a single datagram. Events that would
/// overflow the transmit buffer are dropped and the batch is truncated; the
/// prefix that fit is still usable.
pub fn encode_frame(
    header: &RtpHeader,
    updates: &[(ChannelIdent, f64)],
    epn_tx_short: bool,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(PACKET_BUFFER);
    header.push(&mut buf);
    // extended-length command header, first event in the list has a dtime
    buf.put_slice(&[0xA0, 0x00]);

    for (ident, value) in updates {
        let fit = match ident.kind {
            EventType::Rpn | EventType::Nrpn => {
                // parameter number, value, and unless short transmission is
                // requested, the parameter null closing the sequence
                let (param_hi, param_lo) = if ident.kind == EventType::Rpn {
                    (101, 100)
                } else {
                    (99, 98)
                };
                let value = (value * 16383.0) as u16;
                let mut fit = push_midi(
                    &mut buf,
                    EventType::Cc,
                    ident.channel,
                    param_hi,
                    (ident.control >> 7) & 0x7F,
                );
                fit = fit
                    && push_midi(
                        &mut buf,
                        EventType::Cc,
                        ident.channel,
                        param_lo,
                        ident.control & 0x7F,
                    );
                fit = fit && push_midi(&mut buf, EventType::Cc, ident.channel, 6, (value >> 7) & 0x7F);
                fit = fit && push_midi(&mut buf, EventType::Cc, ident.channel, 38, value & 0x7F);
                if !epn_tx_short {
                    fit = fit && push_midi(&mut buf, EventType::Cc, ident.channel, 101, 127);
                    fit = fit && push_midi(&mut buf, EventType::Cc, ident.channel, 100, 127);
                }
                fit
            }
            EventType::Pitchbend => push_midi(
                &mut buf,
                ident.kind,
                ident.channel,
                ident.control as u8,
                (value * 16383.0) as u16,
            ),
            _ => push_midi(
                &mut buf,
                ident.kind,
                ident.channel,
                ident.control as u8,
                (value * 127.0) as u16,
            ),
        };

        if !fit {
            warn!("Transmit buffer size exceeded, truncating batch");
            break;
        }
    }

    let length = buf.len() - RTP_HEADER_LEN - COMMAND_HEADER_LEN;
    buf[RTP_HEADER_LEN] = 0xA0 | ((length >> 8) & 0x0F) as u8;
    buf[RTP_HEADER_LEN + 1] = (length & 0xFF) as u8;
    buf
}

/// Parse an inbound command section (the frame after the RTP header).
///
/// Honors running status and the two abbreviations RFC 6295 permits: the
/// first delta-time may be absent and the last event may be truncated. With
/// `fold_note_off` set, note-off events are rewritten to note events with
/// value 0 before they surface.
pub fn parse_command_section(section: &[u8], fold_note_off: bool) -> Result<Vec<DecodedEvent>> {
    if section.is_empty() {
        return Err(anyhow!("no command section in frame"));
    }

    let flags = section[0];
    let mut length = (flags & 0x0F) as usize;
    let mut offset = 1;
    if flags & 0x80 != 0 {
        if section.len() < 2 {
            return Err(anyhow!("short command section, missing extended header"));
        }
        length = length << 8 | section[1] as usize;
        offset = 2;
    }

    let command_bytes = offset + length;
    if command_bytes > section.len() {
        return Err(anyhow!(
            "short command section, indicated {}, had {}",
            command_bytes,
            section.len()
        ));
    }

    let mut decode_time = flags & 0x20 != 0;
    let mut midi_status = 0u8;
    let mut events = Vec::new();

    while offset < command_bytes {
        // decode (and ignore) the delta-time
        if decode_time {
            while offset < command_bytes && section[offset] & 0x80 != 0 {
                offset += 1;
            }
            offset += 1;
        }
        if offset >= command_bytes {
            break;
        }

        if section[offset] & 0x80 != 0 {
            midi_status = section[offset];
            offset += 1;
        }
        if offset >= command_bytes {
            break;
        }

        decode_time = true;

        let Some(mut kind) = EventType::from_status(midi_status) else {
            debug!("Skipping event without a running status byte");
            offset += 1;
            continue;
        };
        let channel = midi_status & 0x0F;

        let (control, mut raw) = if kind.single_byte() {
            let value = section[offset] as u16;
            offset += 1;
            (0u16, value)
        } else {
            offset += 1;
            if offset >= command_bytes {
                break;
            }
            let pair = if kind == EventType::Pitchbend {
                (0u16, (section[offset] as u16) << 7 | section[offset - 1] as u16)
            } else {
                (section[offset - 1] as u16, section[offset] as u16)
            };
            offset += 1;
            pair
        };

        // fix up note-off events unless the instance wants them verbatim
        if fold_note_off && kind == EventType::NoteOff {
            kind = EventType::Note;
            raw = 0;
        }

        let range = if kind == EventType::Pitchbend { 16383.0 } else { 127.0 };
        events.push(DecodedEvent {
            ident: ChannelIdent::new(kind, channel, control),
            value: raw as f64 / range,
            raw,
        });
    }

    Ok(events)
}
