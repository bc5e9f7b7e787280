//! Per-instance session state: the data/control socket pair, the peer
//! registry, EPN reassembly buffers and the AppleMIDI session state machine.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::channel::{ChannelIdent, EventType};
use crate::epn::EpnState;
use crate::event_bus::Event;
use crate::midi::rtp::control_message::{
    AppleMidiMessage, CommandFrame, SessionCommand, SyncFrame,
};
use crate::midi::rtp::message::{
    encode_frame, parse_command_section, RtpHeader, PACKET_BUFFER, RTP_HEADER_LEN,
};

/// Learned AppleMIDI peers silent for this long are disconnected by the
/// service loop so discovery can re-establish them.
pub const PEER_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Unconfigured,
    Direct,
    Apple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Data,
    Control,
}

/// Registry entry. `dest` always stores the peer's data-port address; the
/// control port is derived as `dest.port() - 1` where needed.
#[derive(Debug, Clone)]
pub struct Peer {
    pub active: bool,
    pub learned: bool,
    pub connected: bool,
    pub invite_ref: Option<usize>,
    pub dest: SocketAddr,
    pub last_heard: u64,
}

pub struct Instance {
    pub id: usize,
    pub name: String,
    pub mode: Mode,
    pub ssrc: u32,
    pub sequence: u16,
    pub data: Option<UdpSocket>,
    pub control: Option<UdpSocket>,
    /// Announced port: the control port in apple mode, the data port in
    /// direct mode.
    pub control_port: u16,
    pub accept: Option<String>,
    pub learn_peers: bool,
    pub epn_tx_short: bool,
    pub note_off: bool,
    /// Session-name patterns this instance wants to invite (apple mode).
    pub invites: Vec<String>,
    pub peers: Vec<Peer>,
    pub epn: [EpnState; 16],
    pub last_announce: u64,
}

impl Instance {
    pub fn new(id: usize, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            mode: Mode::Unconfigured,
            ssrc: 0,
            sequence: 0,
            data: None,
            control: None,
            control_port: 0,
            accept: None,
            learn_peers: false,
            epn_tx_short: false,
            note_off: false,
            invites: Vec::new(),
            peers: Vec::new(),
            epn: [EpnState::default(); 16],
            last_announce: 0,
        }
    }

    /// Bind the data socket, and in apple mode the control socket on the
    /// port below it.
    pub fn bind(&mut self, host: &str, port: u16) -> Result<()> {
        let bind_addr = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("could not resolve bind host {} for instance {}", host, self.name))?
            .next()
            .ok_or_else(|| anyhow!("could not resolve bind host {} for instance {}", host, self.name))?;

        let data = UdpSocket::bind(bind_addr)
            .with_context(|| format!("failed to bind data socket for instance {}", self.name))?;
        data.set_nonblocking(true)?;
        let data_port = data.local_addr()?.port();

        if self.mode == Mode::Apple {
            self.control_port = data_port - 1;
            let mut control_addr = bind_addr;
            control_addr.set_port(self.control_port);
            let control = UdpSocket::bind(control_addr).with_context(|| {
                format!(
                    "failed to bind control port {} for instance {}",
                    self.control_port, self.name
                )
            })?;
            control.set_nonblocking(true)?;
            self.control = Some(control);
            info!(
                "Apple mode instance {} listening on ports {} (control) and {} (data)",
                self.name, self.control_port, data_port
            );
        } else {
            self.control_port = data_port;
            info!("Direct mode instance {} listening on port {}", self.name, data_port);
        }

        self.data = Some(data);
        Ok(())
    }

    pub fn data_port(&self) -> u16 {
        self.data
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Add or refresh a registry entry. Peers are keyed by their exact
    /// destination address; re-adding refreshes `connected` but never
    /// `learned`. Returns the peer's slot.
    pub fn push_peer(
        &mut self,
        dest: SocketAddr,
        learned: bool,
        connected: bool,
        invite_ref: Option<usize>,
        now: u64,
    ) -> usize {
        let mut free = None;
        for (index, peer) in self.peers.iter_mut().enumerate() {
            if peer.active && peer.dest == dest {
                peer.connected = connected;
                peer.last_heard = now;
                return index;
            }
            if !peer.active && free.is_none() {
                free = Some(index);
            }
        }

        let entry = Peer {
            active: true,
            learned,
            connected,
            invite_ref,
            dest,
            last_heard: now,
        };
        match free {
            Some(index) => {
                self.peers[index] = entry;
                index
            }
            None => {
                self.peers.push(entry);
                debug!("Extending peer registry of {} to {} entries", self.name, self.peers.len());
                self.peers.len() - 1
            }
        }
    }

    fn socket(&self, kind: SocketKind) -> Option<&UdpSocket> {
        match kind {
            SocketKind::Data => self.data.as_ref(),
            SocketKind::Control => self.control.as_ref(),
        }
    }

    /// Send a session command; a fresh random token is generated when the
    /// caller has none to echo.
    pub fn apple_command(
        &self,
        dest: SocketAddr,
        kind: SocketKind,
        command: SessionCommand,
        token: Option<u32>,
    ) -> Result<()> {
        let socket = self
            .socket(kind)
            .ok_or_else(|| anyhow!("instance {} has no socket for session command", self.name))?;
        let token = token.unwrap_or_else(rand::random);
        let frame = CommandFrame::new(command, token, self.ssrc, &self.name);
        socket
            .send_to(&frame.serialize(), dest)
            .with_context(|| format!("failed to transmit session command on {}", self.name))?;
        Ok(())
    }

    /// Send a session command to a registered peer; control-plane commands go
    /// to the port below the peer's data port.
    pub fn peer_apple_command(
        &self,
        peer: usize,
        kind: SocketKind,
        command: SessionCommand,
        token: Option<u32>,
    ) -> Result<()> {
        let mut dest = self.peers[peer].dest;
        if kind == SocketKind::Control {
            dest.set_port(dest.port() - 1);
        }
        self.apple_command(dest, kind, command, token)
    }

    /// Drain the data socket.
    pub fn handle_data(&mut self, now: u64, detect: bool, events: &Sender<Event>) {
        let mut buf = [0u8; PACKET_BUFFER];
        loop {
            let (bytes, source) = {
                let Some(socket) = self.data.as_ref() else {
                    return;
                };
                match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(error) if error.kind() == ErrorKind::WouldBlock => return,
                    Err(error) => {
                        warn!("Failed to receive for instance {}: {}", self.name, error);
                        return;
                    }
                }
            };
            self.data_frame(&buf[..bytes], source, now, detect, events);
        }
    }

    /// Drain the control socket.
    pub fn handle_control(&mut self, now: u64, events: &Sender<Event>) {
        let mut buf = [0u8; PACKET_BUFFER];
        loop {
            let (bytes, source) = {
                let Some(socket) = self.control.as_ref() else {
                    return;
                };
                match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(error) if error.kind() == ErrorKind::WouldBlock => return,
                    Err(error) => {
                        warn!("Failed to receive on control socket for instance {}: {}", self.name, error);
                        return;
                    }
                }
            };

            let frame = &buf[..bytes];
            if self.mode == Mode::Apple && AppleMidiMessage::matches(frame) {
                self.handle_applemidi(SocketKind::Control, frame, source, now, events);
            } else {
                info!("Unknown session protocol frame received on instance {}", self.name);
            }
        }
    }

    pub fn data_frame(
        &mut self,
        frame: &[u8],
        source: SocketAddr,
        now: u64,
        detect: bool,
        events: &Sender<Event>,
    ) {
        if self.mode == Mode::Apple && AppleMidiMessage::matches(frame) {
            self.handle_applemidi(SocketKind::Data, frame, source, now, events);
            return;
        }

        let header = match RtpHeader::parse(frame) {
            Ok(header) => header,
            Err(error) => {
                info!("Skipping frame on instance {}: {}", self.name, error);
                return;
            }
        };
        debug!(
            "Inbound sequence {} from SSRC {:08x} on {}",
            header.sequence, header.ssrc, self.name
        );

        let decoded = match parse_command_section(&frame[RTP_HEADER_LEN..], !self.note_off) {
            Ok(decoded) => decoded,
            Err(error) => {
                info!("Dropping malformed command section on {}: {}", self.name, error);
                return;
            }
        };

        for event in &decoded {
            // forward EPN CCs to the reassembly machine
            if event.ident.kind == EventType::Cc
                && ((98..=101).contains(&event.ident.control)
                    || event.ident.control == 6
                    || event.ident.control == 38)
            {
                let channel = event.ident.channel;
                if let Some(epn) = self.epn[channel as usize]
                    .handle(event.ident.control as u8, event.raw as u8)
                {
                    let kind = if epn.nrpn { EventType::Nrpn } else { EventType::Rpn };
                    let ident = ChannelIdent::new(kind, channel, epn.control);
                    let value = epn.value as f64 / 16383.0;
                    if detect {
                        info!("Incoming EPN data on channel {}.{}, value {}", self.name, ident, value);
                    }
                    let _ = events.send(Event::ChannelUpdate {
                        instance: self.id,
                        ident,
                        value,
                    });
                }
            }

            if detect {
                info!(
                    "Incoming data on channel {}.{}, value {}",
                    self.name, event.ident, event.value
                );
            }
            let _ = events.send(Event::ChannelUpdate {
                instance: self.id,
                ident: event.ident,
                value: event.value,
            });
        }

        // refresh liveness for known peers, learn unknown ones if requested
        let mut known = false;
        for peer in &mut self.peers {
            if peer.active && peer.dest == source {
                peer.last_heard = now;
                known = true;
            }
        }
        if !known && self.learn_peers {
            info!("Learned new peer {} on {}", source, self.name);
            self.push_peer(source, true, true, None, now);
            let _ = events.send(Event::PeerConnected {
                instance: self.id,
                peer: source,
            });
        }
    }

    fn handle_applemidi(
        &mut self,
        kind: SocketKind,
        frame: &[u8],
        source: SocketAddr,
        now: u64,
        events: &Sender<Event>,
    ) {
        let message = match AppleMidiMessage::parse(frame) {
            Ok(message) => message,
            Err(error) => {
                info!("Dropping AppleMIDI frame on instance {}: {}", self.name, error);
                return;
            }
        };

        match message {
            AppleMidiMessage::Session(command) => {
                self.handle_session_command(kind, command, source, now, events)
            }
            AppleMidiMessage::Sync(sync) => self.handle_sync(kind, sync, source, now),
            AppleMidiMessage::Feedback(feedback) => {
                info!(
                    "Feedback on instance {} (peer sequence {})",
                    self.name, feedback.sequence
                );
            }
        }
    }

    fn handle_session_command(
        &mut self,
        kind: SocketKind,
        command: CommandFrame,
        source: SocketAddr,
        now: u64,
        events: &Sender<Event>,
    ) {
        match command.command {
            SessionCommand::Invite => {
                let session = command.name.as_deref();
                let accepted = match self.accept.as_deref() {
                    Some("*") => true,
                    Some(pattern) => session == Some(pattern),
                    None => false,
                };

                if accepted {
                    info!(
                        "Instance {} accepting invitation to session {}{}",
                        self.name,
                        session.unwrap_or("UNNAMED"),
                        if kind == SocketKind::Control { " (control)" } else { "" }
                    );
                    if let Err(error) =
                        self.apple_command(source, kind, SessionCommand::Accept, Some(command.token))
                    {
                        warn!("{}", error);
                    }
                    if kind == SocketKind::Data {
                        self.push_peer(source, true, true, None, now);
                        let _ = events.send(Event::PeerConnected {
                            instance: self.id,
                            peer: source,
                        });
                    }
                } else {
                    info!(
                        "Instance {} rejecting invitation to session {}",
                        self.name,
                        session.unwrap_or("UNNAMED")
                    );
                    if let Err(error) =
                        self.apple_command(source, kind, SessionCommand::Reject, Some(command.token))
                    {
                        warn!("{}", error);
                    }
                }
            }
            SessionCommand::Accept => {
                if kind == SocketKind::Data {
                    info!("Instance {} negotiated new peer {}", self.name, source);
                    self.push_peer(source, true, true, None, now);
                    let _ = events.send(Event::PeerConnected {
                        instance: self.id,
                        peer: source,
                    });
                } else {
                    // accepted on the control port, now invite the data port
                    info!("Instance {} peer accepted on control port, inviting data port", self.name);
                    let mut dest = source;
                    dest.set_port(dest.port() + 1);
                    if let Err(error) =
                        self.apple_command(dest, SocketKind::Data, SessionCommand::Invite, None)
                    {
                        warn!("{}", error);
                    }
                }
            }
            SessionCommand::Reject => {
                // the periodic service will retry the invitation
                info!("Invitation rejected on instance {}", self.name);
            }
            SessionCommand::Leave => {
                // leave arrives on the control port but refers to the peer's
                // data port
                let mut dest = source;
                dest.set_port(dest.port() + 1);
                for peer in &mut self.peers {
                    if peer.active && peer.dest == dest {
                        info!("Instance {} removed peer {}", self.name, dest);
                        // learned peers are dropped, configured peers are
                        // only disconnected so they can be re-invited
                        if peer.learned {
                            peer.active = false;
                        } else {
                            peer.connected = false;
                        }
                        let _ = events.send(Event::PeerLost {
                            instance: self.id,
                            peer: dest,
                        });
                    }
                }
            }
        }
    }

    fn handle_sync(&mut self, kind: SocketKind, mut sync: SyncFrame, source: SocketAddr, now: u64) {
        debug!("Incoming sync on instance {} ({})", self.name, sync.count);
        match sync.count {
            0 => {
                // we are the participant
                sync.count = 1;
                sync.timestamps[1] = now * 10;
            }
            1 => {
                // we initiated
                sync.count = 2;
                sync.timestamps[2] = now * 10;
            }
            _ => return,
        }
        sync.ssrc = self.ssrc;

        if let Some(socket) = self.socket(kind) {
            if socket.send_to(&sync.serialize(), source).is_err() {
                warn!("Failed to output sync frame on {}", self.name);
            }
        }
    }

    /// Serialise one outbound batch and fan it out to every connected peer.
    pub fn send_updates(&mut self, now: u64, updates: &[(ChannelIdent, f64)]) -> Result<()> {
        let header = RtpHeader {
            // some receivers interpret the marker bit oddly, session mode is
            // the empirically compatible choice
            marker: self.mode == Mode::Direct,
            sequence: self.sequence,
            timestamp: (now * 10) as u32,
            ssrc: self.ssrc,
        };
        self.sequence = self.sequence.wrapping_add(1);

        let frame = encode_frame(&header, updates, self.epn_tx_short);
        let socket = self
            .data
            .as_ref()
            .ok_or_else(|| anyhow!("instance {} is not bound", self.name))?;
        for peer in &self.peers {
            if peer.active && peer.connected {
                if let Err(error) = socket.send_to(&frame, peer.dest) {
                    warn!("Failed to transmit to peer {}: {}", peer.dest, error);
                }
            }
        }
        Ok(())
    }

    /// Initiate a clock-sync exchange with a registered peer, on the control
    /// socket.
    pub fn send_sync(&self, peer: usize, now: u64) {
        let sync = SyncFrame {
            ssrc: self.ssrc,
            count: 0,
            timestamps: [now * 10, 0, 0],
        };
        let mut dest = self.peers[peer].dest;
        dest.set_port(dest.port() - 1);

        if let Some(socket) = self.control.as_ref() {
            if socket.send_to(&sync.serialize(), dest).is_err() {
                warn!("Failed to output sync frame on {}", self.name);
            }
        }
    }

    /// Disconnect learned peers that have gone silent.
    pub fn expire_peers(&mut self, now: u64, events: &Sender<Event>) {
        if self.mode != Mode::Apple {
            return;
        }
        for peer in &mut self.peers {
            if peer.active
                && peer.connected
                && peer.learned
                && now.saturating_sub(peer.last_heard) > PEER_TIMEOUT_MS
            {
                info!("Instance {} expiring silent peer {}", self.name, peer.dest);
                peer.connected = false;
                let _ = events.send(Event::PeerLost {
                    instance: self.id,
                    peer: peer.dest,
                });
            }
        }
    }

    /// Release the sockets and forget all peers.
    pub fn shutdown(&mut self) {
        self.data = None;
        self.control = None;
        self.peers.clear();
        self.accept = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.5:{}", port).parse().unwrap()
    }

    fn apple_instance() -> Instance {
        let mut inst = Instance::new(0, "a");
        inst.mode = Mode::Apple;
        inst.ssrc = 0xDEADBEEF;
        inst
    }

    // the control port is the one below the kernel-chosen data port, which
    // may be taken; retry until a free pair turns up
    fn bind_apple(inst: &mut Instance) {
        for _ in 0..16 {
            if inst.bind("127.0.0.1", 0).is_ok() {
                return;
            }
        }
        panic!("could not bind a consecutive port pair");
    }

    #[test]
    fn peer_dedup_refreshes_connected() {
        let mut inst = apple_instance();
        inst.push_peer(addr(40000), true, false, None, 0);
        assert_eq!(inst.peers.len(), 1);

        inst.push_peer(addr(40000), false, true, None, 5);
        assert_eq!(inst.peers.len(), 1);
        assert!(inst.peers[0].connected);
        // learned never changes on refresh
        assert!(inst.peers[0].learned);
        assert_eq!(inst.peers[0].last_heard, 5);

        inst.push_peer(addr(40002), true, true, None, 5);
        assert_eq!(inst.peers.len(), 2);
    }

    #[test]
    fn free_slots_are_reused() {
        let mut inst = apple_instance();
        inst.push_peer(addr(40000), true, true, None, 0);
        inst.push_peer(addr(40002), true, true, None, 0);
        inst.peers[0].active = false;
        let slot = inst.push_peer(addr(40004), true, true, None, 0);
        assert_eq!(slot, 0);
        assert_eq!(inst.peers.len(), 2);
    }

    #[test]
    fn invite_on_data_socket_accepts_and_registers() {
        let bus = EventBus::new();
        let mut inst = apple_instance();
        inst.accept = Some("*".to_string());
        bind_apple(&mut inst);

        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        remote
            .set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let mut invite = vec![
            0xFF, 0xFF, 0x49, 0x4E, 0x00, 0x00, 0x00, 0x02, 0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x00,
            0x00, 0x00,
        ];
        invite.extend_from_slice(b"foo\0");
        inst.data_frame(&invite, remote_addr, 0, false, &bus.sender);

        let mut buf = [0u8; 64];
        let (bytes, from) = remote.recv_from(&mut buf).unwrap();
        assert_eq!(from.port(), inst.data_port());
        assert_eq!(
            &buf[..bytes],
            &[
                0xFF, 0xFF, 0x4F, 0x4B, 0x00, 0x00, 0x00, 0x02, 0xCA, 0xFE, 0xBA, 0xBE, 0xDE,
                0xAD, 0xBE, 0xEF, b'a', 0x00,
            ]
        );

        assert_eq!(inst.peers.len(), 1);
        assert!(inst.peers[0].learned);
        assert!(inst.peers[0].connected);
        assert_eq!(inst.peers[0].dest, remote_addr);
        assert_eq!(
            bus.receiver.try_recv().unwrap(),
            Event::PeerConnected {
                instance: 0,
                peer: remote_addr
            }
        );
    }

    #[test]
    fn invite_with_mismatched_pattern_is_rejected() {
        let bus = EventBus::new();
        let mut inst = apple_instance();
        inst.accept = Some("studio".to_string());
        bind_apple(&mut inst);

        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        remote
            .set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let mut invite = vec![
            0xFF, 0xFF, 0x49, 0x4E, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
            0x00, 0x00,
        ];
        invite.extend_from_slice(b"foo\0");
        inst.data_frame(&invite, remote_addr, 0, false, &bus.sender);

        let mut buf = [0u8; 64];
        let (bytes, _) = remote.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[2..4], b"NO");
        assert_eq!(&buf[8..12], &[0, 0, 0, 1]);
        assert_eq!(bytes, 18);
        assert!(inst.peers.is_empty());
    }

    #[test]
    fn sync_responder_fills_second_timestamp() {
        let bus = EventBus::new();
        let mut inst = apple_instance();
        bind_apple(&mut inst);

        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        remote
            .set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let sync = SyncFrame {
            ssrc: 0x01020304,
            count: 0,
            timestamps: [77, 0, 0],
        };
        inst.data_frame(&sync.serialize(), remote_addr, 42, false, &bus.sender);

        let mut buf = [0u8; 64];
        let (bytes, _) = remote.recv_from(&mut buf).unwrap();
        match AppleMidiMessage::parse(&buf[..bytes]).unwrap() {
            AppleMidiMessage::Sync(reply) => {
                assert_eq!(reply.count, 1);
                assert_eq!(reply.ssrc, 0xDEADBEEF);
                assert_eq!(reply.timestamps[0], 77);
                assert_eq!(reply.timestamps[1], 420);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn final_sync_is_ignored() {
        let bus = EventBus::new();
        let mut inst = apple_instance();
        bind_apple(&mut inst);

        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        remote
            .set_read_timeout(Some(std::time::Duration::from_millis(100)))
            .unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let sync = SyncFrame {
            ssrc: 1,
            count: 2,
            timestamps: [1, 2, 3],
        };
        inst.data_frame(&sync.serialize(), remote_addr, 0, false, &bus.sender);

        let mut buf = [0u8; 64];
        assert!(remote.recv_from(&mut buf).is_err());
    }

    #[test]
    fn leave_disconnects_configured_and_drops_learned() {
        let bus = EventBus::new();
        let mut inst = apple_instance();
        bind_apple(&mut inst);

        let configured = addr(40002);
        let learned = addr(50002);
        inst.push_peer(configured, false, true, None, 0);
        inst.push_peer(learned, true, true, None, 0);

        // leave frames arrive from the control port, one below the data port
        let leave = CommandFrame::new(SessionCommand::Leave, 1, 2, "x").serialize();
        let mut control_source = configured;
        control_source.set_port(configured.port() - 1);
        inst.handle_applemidi(SocketKind::Control, &leave, control_source, 0, &bus.sender);
        let mut control_source = learned;
        control_source.set_port(learned.port() - 1);
        inst.handle_applemidi(SocketKind::Control, &leave, control_source, 0, &bus.sender);

        assert!(inst.peers[0].active);
        assert!(!inst.peers[0].connected);
        assert!(!inst.peers[1].active);
    }

    #[test]
    fn learned_peer_expires_after_silence() {
        let bus = EventBus::new();
        let mut inst = apple_instance();
        inst.push_peer(addr(40002), true, true, None, 1_000);
        inst.push_peer(addr(50002), false, true, None, 1_000);

        inst.expire_peers(PEER_TIMEOUT_MS + 2_000, &bus.sender);
        assert!(!inst.peers[0].connected);
        assert!(inst.peers[0].active);
        // configured peers are left to the re-invite cadence
        assert!(inst.peers[1].connected);
    }

    #[test]
    fn learn_peers_registers_traffic_sources() {
        let bus = EventBus::new();
        let mut inst = Instance::new(3, "direct");
        inst.mode = Mode::Direct;
        inst.learn_peers = true;

        // minimal RTP-MIDI frame: header plus an empty command section
        let frame = [
            0x80, 0xE1, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 1, 0x00,
        ];
        inst.data_frame(&frame, addr(6000), 10, false, &bus.sender);
        assert_eq!(inst.peers.len(), 1);
        assert!(inst.peers[0].learned);
        assert!(inst.peers[0].connected);

        // the same source does not grow the registry
        inst.data_frame(&frame, addr(6000), 11, false, &bus.sender);
        assert_eq!(inst.peers.len(), 1);
        assert_eq!(inst.peers[0].last_heard, 11);
    }

    #[test]
    fn sequence_numbers_increase_per_datagram() {
        let local = UdpSocket::bind("127.0.0.1:0").unwrap();
        local
            .set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();

        let mut inst = Instance::new(0, "direct");
        inst.mode = Mode::Direct;
        inst.ssrc = 0x11223344;
        inst.bind("127.0.0.1", 0).unwrap();
        inst.push_peer(local.local_addr().unwrap(), false, true, None, 0);

        let updates = [(ChannelIdent::new(EventType::Cc, 1, 7), 0.5)];
        let mut buf = [0u8; PACKET_BUFFER];
        for expected in 0u16..4 {
            inst.send_updates(1, &updates).unwrap();
            let (bytes, _) = local.recv_from(&mut buf).unwrap();
            let header = RtpHeader::parse(&buf[..bytes]).unwrap();
            assert_eq!(header.sequence, expected);
            assert!(header.marker);
            assert_eq!(header.ssrc, 0x11223344);
        }
    }

    #[test]
    fn unconnected_peers_receive_nothing() {
        let local = UdpSocket::bind("127.0.0.1:0").unwrap();
        local
            .set_read_timeout(Some(std::time::Duration::from_millis(100)))
            .unwrap();

        let mut inst = Instance::new(0, "direct");
        inst.mode = Mode::Direct;
        inst.bind("127.0.0.1", 0).unwrap();
        inst.push_peer(local.local_addr().unwrap(), false, false, None, 0);

        inst.send_updates(1, &[(ChannelIdent::new(EventType::Cc, 0, 0), 1.0)])
            .unwrap();
        let mut buf = [0u8; 64];
        assert!(local.recv_from(&mut buf).is_err());
    }
}
