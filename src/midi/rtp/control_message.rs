//! AppleMIDI session command frames. All commands share the `0xFFFF` magic
//! prefix and a two-letter command code; invite/accept/reject/leave carry the
//! protocol version, a correlation token and the sender's SSRC followed by an
//! optional NUL-terminated session name. Clock sync and receiver feedback use
//! their own fixed layouts and are not version checked.

use anyhow::{anyhow, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PROTOCOL_VERSION: u32 = 2;

/// Session control commands with a shared frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SessionCommand {
    Invite = 0x494E,  // "IN"
    Accept = 0x4F4B,  // "OK"
    Reject = 0x4E4F,  // "NO"
    Leave = 0x4259,   // "BY"
}

const COMMAND_SYNC: u16 = 0x434B; // "CK"
const COMMAND_FEEDBACK: u16 = 0x5253; // "RS"

/// Invite/accept/reject/leave frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    pub command: SessionCommand,
    pub token: u32,
    pub ssrc: u32,
    /// Parsed session name; `None` when the inbound name was missing,
    /// unterminated or unprintable.
    pub name: Option<String>,
}

impl CommandFrame {
    pub const HEADER_LEN: usize = 16;

    pub fn new(command: SessionCommand, token: u32, ssrc: u32, name: &str) -> Self {
        Self {
            command,
            token,
            ssrc,
            name: Some(name.to_string()),
        }
    }

    pub fn serialize(&self) -> Bytes {
        let name = self.name.as_deref().unwrap_or("");
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + name.len() + 1);
        buf.put_u16(0xFFFF);
        buf.put_u16(self.command as u16);
        buf.put_u32(PROTOCOL_VERSION);
        buf.put_u32(self.token);
        buf.put_u32(self.ssrc);
        buf.put_slice(name.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }

    fn parse(command: SessionCommand, frame: &[u8]) -> Result<Self> {
        if frame.len() < Self::HEADER_LEN {
            return Err(anyhow!("short AppleMIDI command frame: {} bytes", frame.len()));
        }
        let mut reader = &frame[4..Self::HEADER_LEN];
        let version = reader.get_u32();
        if version != PROTOCOL_VERSION {
            return Err(anyhow!("invalid AppleMIDI command version {}", version));
        }
        let token = reader.get_u32();
        let ssrc = reader.get_u32();

        // the session name must be printable and NUL-terminated within the
        // frame, anything else is treated as unnamed
        let tail = &frame[Self::HEADER_LEN..];
        let name = match tail.iter().position(|&b| b == 0) {
            Some(end) if tail[..end].iter().all(|b| (0x20..0x7F).contains(b)) => {
                Some(String::from_utf8_lossy(&tail[..end]).into_owned())
            }
            _ => None,
        };

        Ok(Self {
            command,
            token,
            ssrc,
            name,
        })
    }
}

/// Clock synchronisation frame (`CK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncFrame {
    pub ssrc: u32,
    pub count: u8,
    pub timestamps: [u64; 3],
}

impl SyncFrame {
    pub const LEN: usize = 36;

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u16(0xFFFF);
        buf.put_u16(COMMAND_SYNC);
        buf.put_u32(self.ssrc);
        buf.put_u8(self.count);
        buf.put_slice(&[0; 3]);
        for ts in self.timestamps {
            buf.put_u64(ts);
        }
        buf.freeze()
    }

    fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < Self::LEN {
            return Err(anyhow!("short AppleMIDI sync frame: {} bytes", frame.len()));
        }
        let mut reader = &frame[4..Self::LEN];
        let ssrc = reader.get_u32();
        let count = reader.get_u8();
        reader.advance(3);
        let timestamps = [reader.get_u64(), reader.get_u64(), reader.get_u64()];
        Ok(Self {
            ssrc,
            count,
            timestamps,
        })
    }
}

/// Receiver feedback frame (`RS`), a recovery-journal hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackFrame {
    pub ssrc: u32,
    pub sequence: u16,
}

impl FeedbackFrame {
    pub const LEN: usize = 12;

    fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < Self::LEN {
            return Err(anyhow!("short AppleMIDI feedback frame: {} bytes", frame.len()));
        }
        let mut reader = &frame[4..Self::LEN];
        Ok(Self {
            ssrc: reader.get_u32(),
            sequence: reader.get_u16(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppleMidiMessage {
    Session(CommandFrame),
    Sync(SyncFrame),
    Feedback(FeedbackFrame),
}

impl AppleMidiMessage {
    /// Whether a frame is AppleMIDI session traffic at all.
    pub fn matches(frame: &[u8]) -> bool {
        frame.len() >= 4 && frame[0] == 0xFF && frame[1] == 0xFF
    }

    pub fn parse(frame: &[u8]) -> Result<Self> {
        if !Self::matches(frame) {
            return Err(anyhow!("not an AppleMIDI frame"));
        }
        let command = u16::from_be_bytes([frame[2], frame[3]]);
        match command {
            0x494E => Ok(Self::Session(CommandFrame::parse(SessionCommand::Invite, frame)?)),
            0x4F4B => Ok(Self::Session(CommandFrame::parse(SessionCommand::Accept, frame)?)),
            0x4E4F => Ok(Self::Session(CommandFrame::parse(SessionCommand::Reject, frame)?)),
            0x4259 => Ok(Self::Session(CommandFrame::parse(SessionCommand::Leave, frame)?)),
            COMMAND_SYNC => Ok(Self::Sync(SyncFrame::parse(frame)?)),
            COMMAND_FEEDBACK => Ok(Self::Feedback(FeedbackFrame::parse(frame)?)),
            other => Err(anyhow!("unknown AppleMIDI session command {:04X}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_frame_parse() {
        let mut frame = vec![
            0xFF, 0xFF, 0x49, 0x4E, 0x00, 0x00, 0x00, 0x02, 0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x00,
            0x00, 0x00,
        ];
        frame.extend_from_slice(b"foo\0");

        match AppleMidiMessage::parse(&frame).unwrap() {
            AppleMidiMessage::Session(cmd) => {
                assert_eq!(cmd.command, SessionCommand::Invite);
                assert_eq!(cmd.token, 0xCAFEBABE);
                assert_eq!(cmd.ssrc, 0);
                assert_eq!(cmd.name.as_deref(), Some("foo"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn accept_frame_bytes() {
        let accept = CommandFrame::new(SessionCommand::Accept, 0xCAFEBABE, 0xDEADBEEF, "a");
        let bytes = accept.serialize();
        assert_eq!(
            &bytes[..],
            &[
                0xFF, 0xFF, 0x4F, 0x4B, 0x00, 0x00, 0x00, 0x02, 0xCA, 0xFE, 0xBA, 0xBE, 0xDE,
                0xAD, 0xBE, 0xEF, b'a', 0x00,
            ]
        );
    }

    #[test]
    fn unterminated_name_is_unnamed() {
        let mut frame = vec![
            0xFF, 0xFF, 0x49, 0x4E, 0x00, 0x00, 0x00, 0x02, 0, 0, 0, 1, 0, 0, 0, 2,
        ];
        frame.extend_from_slice(b"foo");
        match AppleMidiMessage::parse(&frame).unwrap() {
            AppleMidiMessage::Session(cmd) => assert_eq!(cmd.name, None),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn unprintable_name_is_unnamed() {
        let mut frame = vec![
            0xFF, 0xFF, 0x49, 0x4E, 0x00, 0x00, 0x00, 0x02, 0, 0, 0, 1, 0, 0, 0, 2,
        ];
        frame.extend_from_slice(&[0x01, b'x', 0x00]);
        match AppleMidiMessage::parse(&frame).unwrap() {
            AppleMidiMessage::Session(cmd) => assert_eq!(cmd.name, None),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn bad_version_rejected() {
        let frame = [
            0xFF, 0xFF, 0x49, 0x4E, 0x00, 0x00, 0x00, 0x03, 0, 0, 0, 1, 0, 0, 0, 2, 0,
        ];
        assert!(AppleMidiMessage::parse(&frame).is_err());
    }

    #[test]
    fn sync_round_trip() {
        let sync = SyncFrame {
            ssrc: 0x11223344,
            count: 1,
            timestamps: [10, 20, 0],
        };
        let bytes = sync.serialize();
        assert_eq!(bytes.len(), SyncFrame::LEN);
        match AppleMidiMessage::parse(&bytes).unwrap() {
            AppleMidiMessage::Sync(parsed) => assert_eq!(parsed, sync),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn sync_skips_version_check() {
        // a sync frame whose ssrc field happens to not look like version 2
        let sync = SyncFrame {
            ssrc: 0xFFFFFFFF,
            count: 0,
            timestamps: [0; 3],
        };
        assert!(AppleMidiMessage::parse(&sync.serialize()).is_ok());
    }

    #[test]
    fn feedback_parse() {
        let frame = [
            0xFF, 0xFF, 0x52, 0x53, 0x11, 0x22, 0x33, 0x44, 0x00, 0x2A, 0x00, 0x00,
        ];
        match AppleMidiMessage::parse(&frame).unwrap() {
            AppleMidiMessage::Feedback(feedback) => {
                assert_eq!(feedback.ssrc, 0x11223344);
                assert_eq!(feedback.sequence, 42);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
