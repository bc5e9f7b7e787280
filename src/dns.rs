//! Minimal DNS wire codec for the mDNS service: length-prefixed label names
//! with compression pointers (RFC 1035 section 4.1.4), the fixed message
//! header and the fixed part of a resource record.

use anyhow::{anyhow, Result};
use bytes::{Buf, BufMut, BytesMut};

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const CLASS_IN: u16 = 1;

/// Fixed 12-byte DNS message header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub questions: u16,
    pub answers: u16,
    pub authorities: u16,
    pub additionals: u16,
}

impl DnsHeader {
    pub const SIZE: usize = 12;

    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < Self::SIZE {
            return Err(anyhow!("short DNS header: {} bytes", frame.len()));
        }
        let mut reader = &frame[..Self::SIZE];
        Ok(Self {
            id: reader.get_u16(),
            flags: reader.get_u16(),
            questions: reader.get_u16(),
            answers: reader.get_u16(),
            authorities: reader.get_u16(),
            additionals: reader.get_u16(),
        })
    }

    pub fn push(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.questions);
        buf.put_u16(self.answers);
        buf.put_u16(self.authorities);
        buf.put_u16(self.additionals);
    }
}

/// Decode the name starting at `start`, following compression pointers.
///
/// Returns the dotted name (every label carries a trailing dot, so a full
/// name reads `sess._apple-midi._udp.local.`) and the number of wire bytes
/// the first segment occupies — label data up to and including either the
/// root byte or the first pointer — so the caller can advance its cursor.
pub fn decode_name(packet: &[u8], start: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut wire = 0usize;
    let mut pos = start;
    let mut jumped = false;
    let mut hops = 0usize;

    loop {
        let label = *packet
            .get(pos)
            .ok_or_else(|| anyhow!("DNS name runs past packet end"))?;

        if label & 0xC0 == 0xC0 {
            let low = *packet
                .get(pos + 1)
                .ok_or_else(|| anyhow!("DNS pointer out of bounds"))?;
            if !jumped {
                wire += 2;
                jumped = true;
            }

            let target = ((label & 0x3F) as usize) << 8 | low as usize;
            if target >= packet.len() {
                return Err(anyhow!("DNS pointer target out of bounds"));
            }

            // a valid pointer chain can never have more hops than the packet
            // has bytes, anything beyond that is a cycle
            hops += 1;
            if hops > packet.len() {
                return Err(anyhow!("DNS pointer loop"));
            }
            pos = target;
        } else if label == 0 {
            if !jumped {
                wire += 1;
            }
            return Ok((name, wire));
        } else {
            let len = (label & 0x3F) as usize;
            let data = packet
                .get(pos + 1..pos + 1 + len)
                .ok_or_else(|| anyhow!("DNS label runs past packet end"))?;
            name.push_str(&String::from_utf8_lossy(data));
            name.push('.');
            if !jumped {
                wire += 1 + len;
            }
            pos += 1 + len;
        }
    }
}

/// Borrow the first length-prefixed label of the name at `offset`, following
/// at most one leading compression pointer (enough for answer owner names,
/// which either start inline or point at a previous occurrence).
pub fn first_label(packet: &[u8], offset: usize) -> Result<&[u8]> {
    let mut pos = offset;
    let lead = *packet
        .get(pos)
        .ok_or_else(|| anyhow!("DNS name offset out of bounds"))?;
    if lead & 0xC0 == 0xC0 {
        let low = *packet
            .get(pos + 1)
            .ok_or_else(|| anyhow!("DNS pointer out of bounds"))?;
        pos = ((lead & 0x3F) as usize) << 8 | low as usize;
    }

    let len = *packet
        .get(pos)
        .ok_or_else(|| anyhow!("DNS label offset out of bounds"))? as usize
        & 0x3F;
    packet
        .get(pos + 1..pos + 1 + len)
        .ok_or_else(|| anyhow!("DNS label runs past packet end"))
}

/// Append `name` as length-prefixed labels plus the root byte. Never emits
/// compression pointers.
pub fn encode_name(name: &str, out: &mut BytesMut) -> Result<()> {
    for token in name.split('.').filter(|token| !token.is_empty()) {
        if token.len() > 63 {
            return Err(anyhow!("DNS label {} exceeds 63 bytes", token));
        }
        out.put_u8(token.len() as u8);
        out.put_slice(token.as_bytes());
    }
    out.put_u8(0);
    Ok(())
}

/// Append a two-byte compression pointer to `offset`.
pub fn push_pointer(buf: &mut BytesMut, offset: usize) {
    buf.put_u8(0xC0 | (offset >> 8) as u8);
    buf.put_u8(offset as u8);
}

/// Append an optional owner name (omit it when the caller already placed a
/// compressed pointer) followed by the 10-byte fixed RR header. Returns the
/// buffer position of RDLENGTH so it can be patched once RDATA is written.
pub fn push_rr(
    buf: &mut BytesMut,
    name: Option<&str>,
    rtype: u16,
    class: u16,
    ttl: u32,
    rdlength: u16,
) -> Result<usize> {
    if let Some(name) = name {
        encode_name(name, buf)?;
    }
    buf.put_u16(rtype);
    buf.put_u16(class);
    buf.put_u32(ttl);
    let at = buf.len();
    buf.put_u16(rdlength);
    Ok(at)
}

pub fn patch_rdlength(buf: &mut BytesMut, at: usize, rdlength: u16) {
    buf[at..at + 2].copy_from_slice(&rdlength.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        let mut buf = BytesMut::new();
        encode_name("sess._apple-midi._udp.local.", &mut buf).unwrap();
        let (name, wire) = decode_name(&buf, 0).unwrap();
        assert_eq!(name, "sess._apple-midi._udp.local.");
        assert_eq!(wire, buf.len());
    }

    #[test]
    fn root_name() {
        let mut buf = BytesMut::new();
        encode_name("", &mut buf).unwrap();
        assert_eq!(&buf[..], &[0]);
        assert_eq!(decode_name(&buf, 0).unwrap(), (String::new(), 1));
    }

    #[test]
    fn oversized_label_rejected() {
        let mut buf = BytesMut::new();
        let label = "a".repeat(64);
        assert!(encode_name(&label, &mut buf).is_err());
    }

    #[test]
    fn compressed_name_wire_length_stops_at_pointer() {
        // "host.local." at 0, then "peer." + pointer to it at offset 12
        let mut packet = BytesMut::new();
        encode_name("host.local.", &mut packet).unwrap();
        assert_eq!(packet.len(), 12);
        packet.put_u8(4);
        packet.put_slice(b"peer");
        push_pointer(&mut packet, 0);

        let (name, wire) = decode_name(&packet, 12).unwrap();
        assert_eq!(name, "peer.host.local.");
        // 1 + 4 label bytes plus the two pointer bytes
        assert_eq!(wire, 7);
    }

    #[test]
    fn pointer_loop_rejected() {
        // two pointers referencing each other
        let packet = [0xC0, 0x02, 0xC0, 0x00];
        assert!(decode_name(&packet, 0).is_err());
    }

    #[test]
    fn pointer_target_out_of_bounds_rejected() {
        let packet = [0xC0, 0x7F];
        assert!(decode_name(&packet, 0).is_err());
    }

    #[test]
    fn truncated_label_rejected() {
        let packet = [5, b'a', b'b'];
        assert!(decode_name(&packet, 0).is_err());
    }

    #[test]
    fn unterminated_name_rejected() {
        let packet = [4, b'h', b'o', b's', b't'];
        assert!(decode_name(&packet, 0).is_err());
    }

    #[test]
    fn first_label_follows_one_pointer() {
        let mut packet = BytesMut::new();
        encode_name("sess._apple-midi._udp.local.", &mut packet).unwrap();
        let mut at_pointer = packet.clone();
        push_pointer(&mut at_pointer, 0);

        let direct = first_label(&packet, 0).unwrap();
        assert_eq!(direct, b"sess");
        let via_pointer = first_label(&at_pointer, packet.len()).unwrap();
        assert_eq!(via_pointer, b"sess");
    }

    #[test]
    fn rr_header_layout() {
        let mut buf = BytesMut::new();
        let at = push_rr(&mut buf, Some("a.b."), TYPE_SRV, CLASS_IN, 120, 0).unwrap();
        // 1+1 + 1+1 + root = 5 name bytes, then the fixed header
        assert_eq!(buf.len(), 5 + 10);
        patch_rdlength(&mut buf, at, 0x1234);
        assert_eq!(&buf[5..], &[0, 33, 0, 1, 0, 0, 0, 120, 0x12, 0x34]);
    }

    #[test]
    fn header_round_trip() {
        let header = DnsHeader {
            id: 0,
            flags: 0x8400,
            questions: 0,
            answers: 4,
            authorities: 0,
            additionals: 1,
        };
        let mut buf = BytesMut::new();
        header.push(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0x84, 0, 0, 0, 0, 4, 0, 0, 0, 1]);
        assert_eq!(DnsHeader::parse(&buf).unwrap(), header);
    }
}
