//! mDNS/DNS-SD service discovery for AppleMIDI sessions: announce and detach
//! packet builders, the response parser feeding the peer-invite machinery,
//! and the paired IPv4/IPv6 multicast sockets. The two families are kept on
//! separate sockets so source addresses never arrive v4-mapped.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use anyhow::{anyhow, Context, Result};
use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::dns::{
    decode_name, encode_name, first_label, patch_rdlength, push_pointer, push_rr, DnsHeader,
    CLASS_IN, TYPE_A, TYPE_AAAA, TYPE_PTR, TYPE_SRV, TYPE_TXT,
};
use crate::midi::rtp::message::PACKET_BUFFER;

pub const MDNS_DOMAIN: &str = "_apple-midi._udp.local.";
pub const DNSSD_DOMAIN: &str = "_services._dns-sd._udp.local.";
pub const MDNS_PORT: u16 = 5353;

const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xFB);

/// A remote session seen in an SRV announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub session: String,
    pub control_port: u16,
}

/// Build the unsolicited response announcing one session: SRV + empty TXT +
/// the two DNS-SD PTRs, plus one A/AAAA additional per local address.
pub fn build_announce(
    mdns_name: &str,
    session: &str,
    control_port: u16,
    addresses: &[IpAddr],
) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(PACKET_BUFFER);
    DnsHeader {
        id: 0,
        flags: 0x8400,
        questions: 0,
        answers: 4,
        authorities: 0,
        additionals: addresses.len() as u16,
    }
    .push(&mut buf);

    // answer 1: the session SRV
    let fqdn = format!("{}.{}", session, MDNS_DOMAIN);
    let rdlength = push_rr(&mut buf, Some(&fqdn), TYPE_SRV, CLASS_IN, 120, 0)?;
    let rdata = buf.len();
    buf.put_u16(0); // priority
    buf.put_u16(0); // weight
    buf.put_u16(control_port);
    // rfc2782 says not to compress the target, rfc6762 18.14 says to; the
    // uncompressed form is universally accepted
    let target = format!("{}.local.", mdns_name);
    encode_name(&target, &mut buf)?;
    let rdata_len = (buf.len() - rdata) as u16;
    patch_rdlength(&mut buf, rdlength, rdata_len);

    // answer 2: empty TXT on the same owner, AppleMIDI peers ask for it
    push_pointer(&mut buf, DnsHeader::SIZE);
    push_rr(&mut buf, None, TYPE_TXT, CLASS_IN, 4500, 1)?;
    buf.put_u8(0);

    // answer 3: service-type enumeration PTR
    let type_offset = DnsHeader::SIZE + buf[DnsHeader::SIZE] as usize + 1;
    push_rr(&mut buf, Some(DNSSD_DOMAIN), TYPE_PTR, CLASS_IN, 4500, 2)?;
    push_pointer(&mut buf, type_offset);

    // answer 4: the service PTR back at the session FQDN
    push_pointer(&mut buf, type_offset);
    push_rr(&mut buf, None, TYPE_PTR, CLASS_IN, 4500, 2)?;
    push_pointer(&mut buf, DnsHeader::SIZE);

    // additionals: host address records, compressed after the first
    let mut host_offset = 0;
    for (index, address) in addresses.iter().enumerate() {
        if index == 0 {
            host_offset = buf.len();
            encode_name(&target, &mut buf)?;
        } else {
            push_pointer(&mut buf, host_offset);
        }
        match address {
            IpAddr::V4(v4) => {
                push_rr(&mut buf, None, TYPE_A, CLASS_IN, 120, 4)?;
                buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                push_rr(&mut buf, None, TYPE_AAAA, CLASS_IN, 120, 16)?;
                buf.put_slice(&v6.octets());
            }
        }
    }

    Ok(buf)
}

/// Build the goodbye response: a single TTL-0 PTR for the session.
pub fn build_detach(session: &str) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(256);
    DnsHeader {
        id: 0,
        flags: 0x8400,
        questions: 0,
        answers: 1,
        authorities: 0,
        additionals: 0,
    }
    .push(&mut buf);

    let rdlength = push_rr(&mut buf, Some(MDNS_DOMAIN), TYPE_PTR, CLASS_IN, 0, 0)?;
    let rdata = buf.len();
    // a DNS name caps the instance label at 255 bytes
    let label = &session.as_bytes()[..session.len().min(255)];
    buf.put_u8(label.len() as u8);
    buf.put_slice(label);
    push_pointer(&mut buf, DnsHeader::SIZE);
    let rdata_len = (buf.len() - rdata) as u16;
    patch_rdlength(&mut buf, rdlength, rdata_len);

    Ok(buf)
}

/// Scan a received mDNS message for `_apple-midi._udp` SRV answers. Answers
/// whose SRV target is our own host name are loopback and end the scan.
pub fn parse_frame(frame: &[u8], mdns_name: &str) -> Result<Vec<DiscoveredPeer>> {
    let header = DnsHeader::parse(frame)?;
    let mut offset = DnsHeader::SIZE;
    let mut peers = Vec::new();

    for _ in 0..header.questions {
        let (_, wire) = decode_name(frame, offset)?;
        offset += wire + 4;
    }

    let loopback = format!("{}.", mdns_name);
    for _ in 0..header.answers {
        let (name, wire) = decode_name(frame, offset)?;
        // the first label of the owner name is the session name
        let session = first_label(frame, offset)?;
        offset += wire;

        let rr = frame
            .get(offset..offset + 10)
            .ok_or_else(|| anyhow!("resource record runs past packet end"))?;
        let rtype = u16::from_be_bytes([rr[0], rr[1]]);
        let rdlength = u16::from_be_bytes([rr[8], rr[9]]) as usize;
        offset += 10;

        if rtype == TYPE_SRV && name.len() > MDNS_DOMAIN.len() && name.ends_with(MDNS_DOMAIN) {
            let srv = frame
                .get(offset..offset + 6)
                .ok_or_else(|| anyhow!("SRV record runs past packet end"))?;
            let port = u16::from_be_bytes([srv[4], srv[5]]);
            let (target, _) = decode_name(frame, offset + 6)?;

            if target.starts_with(&loopback) {
                // our own announcement reflected back
                return Ok(peers);
            }

            let session = String::from_utf8_lossy(session).into_owned();
            debug!("Detected possible peer {} on {} port {}", session, target, port);
            peers.push(DiscoveredPeer {
                session,
                control_port: port,
            });
        }

        offset += rdlength;
    }

    Ok(peers)
}

fn interface_index(name: &str) -> u32 {
    match std::ffi::CString::new(name) {
        Ok(cstr) => unsafe { libc::if_nametoindex(cstr.as_ptr()) },
        Err(_) => 0,
    }
}

/// The discovery half of the backend: local announce addresses plus the two
/// multicast sockets. Either socket may be missing; at least one is present.
pub struct MdnsService {
    pub mdns_name: String,
    pub addresses: Vec<IpAddr>,
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
}

impl MdnsService {
    /// Gather announce addresses and open the multicast sockets. Partial
    /// failure (one family unavailable, a group join refused) degrades with
    /// a warning; only losing both sockets is an error.
    pub fn start(mdns_name: &str, interface: Option<&str>) -> Result<Self> {
        let addresses = gather_addresses(interface)?;
        let iface_v4 = interface
            .and_then(|_| {
                addresses.iter().find_map(|address| match address {
                    IpAddr::V4(v4) => Some(*v4),
                    _ => None,
                })
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let iface_v6 = interface.map(interface_index).unwrap_or(0);

        let v4 = match open_multicast_v4(iface_v4) {
            Ok(socket) => Some(socket),
            Err(error) => {
                warn!("Failed to create IPv4 mDNS socket, discovery may be impaired: {}", error);
                None
            }
        };
        let v6 = match open_multicast_v6(iface_v6) {
            Ok(socket) => Some(socket),
            Err(error) => {
                warn!("Failed to create IPv6 mDNS socket, discovery may be impaired: {}", error);
                None
            }
        };
        if v4.is_none() && v6.is_none() {
            return Err(anyhow!("failed to create requested mDNS descriptors"));
        }

        Ok(Self {
            mdns_name: mdns_name.to_string(),
            addresses,
            v4,
            v6,
        })
    }

    pub fn descriptors(&self) -> Vec<RawFd> {
        self.v4
            .iter()
            .chain(self.v6.iter())
            .map(|socket| socket.as_raw_fd())
            .collect()
    }

    pub fn owns(&self, fd: RawFd) -> bool {
        self.descriptors().contains(&fd)
    }

    /// Broadcast one frame to both multicast groups; errors are non-fatal.
    pub fn broadcast(&self, frame: &[u8]) {
        if let Some(socket) = &self.v4 {
            let dest = SocketAddr::from((MDNS_GROUP_V4, MDNS_PORT));
            if socket.send_to(frame, dest).is_err() {
                warn!("Failed to transmit mDNS frame on IPv4");
            }
        }
        if let Some(socket) = &self.v6 {
            let dest = SocketAddr::from((MDNS_GROUP_V6, MDNS_PORT));
            if socket.send_to(frame, dest).is_err() {
                warn!("Failed to transmit mDNS frame on IPv6");
            }
        }
    }

    pub fn announce(&self, session: &str, control_port: u16) -> Result<()> {
        let frame = build_announce(&self.mdns_name, session, control_port, &self.addresses)?;
        self.broadcast(&frame);
        Ok(())
    }

    pub fn detach(&self, session: &str) -> Result<()> {
        let frame = build_detach(session)?;
        self.broadcast(&frame);
        Ok(())
    }

    /// Drain one readable mDNS descriptor, returning every discovered remote
    /// session along with the packet source it was announced from.
    pub fn drain(&self, fd: RawFd) -> Vec<(DiscoveredPeer, SocketAddr)> {
        let socket = match (&self.v4, &self.v6) {
            (Some(socket), _) if socket.as_raw_fd() == fd => socket,
            (_, Some(socket)) if socket.as_raw_fd() == fd => socket,
            _ => return Vec::new(),
        };

        let mut discovered = Vec::new();
        let mut buf = [0u8; PACKET_BUFFER];
        loop {
            let (bytes, source) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!("Error reading from mDNS descriptor: {}", error);
                    break;
                }
            };

            match parse_frame(&buf[..bytes], &self.mdns_name) {
                Ok(peers) => {
                    for peer in peers {
                        discovered.push((peer, source));
                    }
                }
                Err(error) => info!("Dropping mDNS frame from {}: {}", source, error),
            }
        }
        discovered
    }
}

fn gather_addresses(interface: Option<&str>) -> Result<Vec<IpAddr>> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .context("failed to get adapter address information")?;

    let mut addresses = Vec::new();
    for (name, address) in interfaces {
        if address.is_loopback() {
            continue;
        }
        if let Some(wanted) = interface {
            if name != wanted {
                continue;
            }
        }
        info!("mDNS announce address {}: {} (from {})", addresses.len(), address, name);
        addresses.push(address);
    }

    if addresses.is_empty() {
        return Err(anyhow!("failed to gather local IP addresses for mDNS announce"));
    }
    Ok(addresses)
}

fn open_multicast_v4(interface: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    if let Err(error) = socket.join_multicast_v4(&MDNS_GROUP_V4, &interface) {
        warn!("Failed to join IPv4 multicast group for mDNS, discovery may be impaired: {}", error);
    }
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn open_multicast_v6(interface: u32) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    if let Err(error) = socket.join_multicast_v6(&MDNS_GROUP_V6, interface) {
        warn!("Failed to join IPv6 multicast group for mDNS, discovery may be impaired: {}", error);
    }
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
