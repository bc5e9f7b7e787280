//! The owning backend: global configuration, the instance table, the mDNS
//! service handle and the periodic service work. Every host-facing operation
//! is a method here; nothing lives in process-global state.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::channel::{parse_spec, ChannelIdent};
use crate::discovery::MdnsService;
use crate::event_bus::Event;
use crate::midi::rtp::session::{Instance, Mode, SocketKind};
use crate::midi::rtp::control_message::SessionCommand;

/// Cadence of the service tick: clock sync, re-invites, announce checks.
pub const SERVICE_INTERVAL_MS: u64 = 1_000;
/// How often each session re-announces itself over mDNS.
pub const ANNOUNCE_INTERVAL_MS: u64 = 90_000;

pub struct RtpMidiBackend {
    instances: Vec<Instance>,
    mdns_name: Option<String>,
    mdns_interface: Option<String>,
    detect: bool,
    mdns: Option<MdnsService>,
    last_service: u64,
    epoch: Instant,
    events: Sender<Event>,
}

impl RtpMidiBackend {
    pub fn new(events: Sender<Event>) -> Self {
        Self {
            instances: Vec::new(),
            mdns_name: None,
            mdns_interface: None,
            detect: false,
            mdns: None,
            last_service: 0,
            epoch: Instant::now(),
            events,
        }
    }

    /// Milliseconds of monotonic backend time.
    pub fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Apply a global configuration option.
    pub fn configure(&mut self, option: &str, value: &str) -> Result<()> {
        match option {
            "mdns-name" => {
                if self.mdns_name.is_some() {
                    return Err(anyhow!("duplicate mdns-name assignment"));
                }
                self.mdns_name = Some(value.to_string());
                Ok(())
            }
            "mdns-interface" => {
                if self.mdns_interface.is_some() {
                    return Err(anyhow!("duplicate mdns-interface assignment"));
                }
                self.mdns_interface = Some(value.to_string());
                Ok(())
            }
            "detect" => {
                self.detect = value == "on";
                Ok(())
            }
            other => Err(anyhow!("unknown backend configuration option {}", other)),
        }
    }

    /// Create a new instance, returning its handle.
    pub fn create_instance(&mut self, name: &str) -> usize {
        let id = self.instances.len();
        self.instances.push(Instance::new(id, name));
        id
    }

    fn instance_mut(&mut self, instance: usize) -> Result<&mut Instance> {
        self.instances
            .get_mut(instance)
            .ok_or_else(|| anyhow!("unknown instance {}", instance))
    }

    /// Apply a per-instance configuration option.
    pub fn configure_instance(&mut self, instance: usize, option: &str, value: &str) -> Result<()> {
        let now = self.now();
        let inst = self.instance_mut(instance)?;

        match option {
            "mode" => match value {
                "direct" => {
                    inst.mode = Mode::Direct;
                    Ok(())
                }
                "apple" => {
                    inst.mode = Mode::Apple;
                    Ok(())
                }
                other => Err(anyhow!("unknown instance mode {} for instance {}", other, inst.name)),
            },
            "ssrc" => {
                let ssrc = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
                    u32::from_str_radix(hex, 16)
                } else {
                    value.parse()
                }
                .with_context(|| format!("invalid ssrc {} for instance {}", value, inst.name))?;
                if ssrc == 0 {
                    info!("Random SSRC will be generated for instance {}", inst.name);
                }
                inst.ssrc = ssrc;
                Ok(())
            }
            "bind" => {
                if inst.mode == Mode::Unconfigured {
                    return Err(anyhow!(
                        "please specify mode for instance {} before setting bind host",
                        inst.name
                    ));
                }
                let (host, port) = parse_hostspec(value);
                inst.bind(host, port.unwrap_or(0))
            }
            "learn" => {
                if inst.mode != Mode::Direct {
                    return Err(anyhow!("'learn' option is only valid for direct mode instances"));
                }
                inst.learn_peers = value == "true";
                Ok(())
            }
            "peer" => {
                if inst.mode == Mode::Unconfigured {
                    return Err(anyhow!(
                        "please specify mode for instance {} before configuring peers",
                        inst.name
                    ));
                }
                let (host, port) = parse_hostspec(value);
                let port = port
                    .ok_or_else(|| anyhow!("invalid peer {} configured on instance {}", value, inst.name))?;
                let mut dest: SocketAddr = resolve_peer(host, port)
                    .with_context(|| format!("failed to resolve peer {} on instance {}", value, inst.name))?;
                // apple peers are specified by their control port, the
                // registry stores the data port
                if inst.mode == Mode::Apple {
                    dest.set_port(dest.port() + 1);
                }
                inst.push_peer(dest, false, false, None, now);
                Ok(())
            }
            "invite" => {
                if inst.mode != Mode::Apple {
                    return Err(anyhow!("'invite' option is only valid for apple mode instances"));
                }
                if !inst.invites.iter().any(|pattern| pattern == value) {
                    inst.invites.push(value.to_string());
                }
                Ok(())
            }
            "join" => {
                if inst.mode != Mode::Apple {
                    return Err(anyhow!("'join' option is only valid for apple mode instances"));
                }
                inst.accept = Some(value.to_string());
                Ok(())
            }
            "epn-tx" => {
                inst.epn_tx_short = value == "short";
                Ok(())
            }
            "note-off" => {
                inst.note_off = value == "true";
                Ok(())
            }
            other => Err(anyhow!(
                "unknown instance configuration option {} on instance {}",
                other,
                inst.name
            )),
        }
    }

    /// Resolve a channel specification to its 64-bit identifier.
    pub fn channel(&self, _instance: usize, spec: &str) -> Result<u64> {
        Ok(parse_spec(spec)?.label())
    }

    /// Serialise one batch of channel updates into a datagram and send it to
    /// every connected peer of the instance.
    pub fn set(&mut self, instance: usize, updates: &[(u64, f64)]) -> Result<()> {
        let now = self.now();
        let inst = self.instance_mut(instance)?;

        let mut decoded = Vec::with_capacity(updates.len());
        for &(label, value) in updates {
            let ident = ChannelIdent::from_label(label)
                .ok_or_else(|| anyhow!("invalid channel identifier {:#018x}", label))?;
            decoded.push((ident, value));
        }
        inst.send_updates(now, &decoded)
    }

    /// Milliseconds until the next service tick is due.
    pub fn interval(&self) -> u64 {
        SERVICE_INTERVAL_MS.saturating_sub(self.now().saturating_sub(self.last_service))
    }

    /// Data-socket ports of all instances, in instance order. Zero for
    /// unbound instances.
    pub fn data_ports(&self) -> Vec<u16> {
        self.instances.iter().map(|inst| inst.data_port()).collect()
    }

    /// All descriptors the host should poll for the backend.
    pub fn descriptors(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self
            .mdns
            .as_ref()
            .map(|mdns| mdns.descriptors())
            .unwrap_or_default();
        for inst in &self.instances {
            if let Some(socket) = &inst.data {
                fds.push(socket.as_raw_fd());
            }
            if let Some(socket) = &inst.control {
                fds.push(socket.as_raw_fd());
            }
        }
        fds
    }

    /// Bring up all instances and, if any run in apple mode, discovery.
    pub fn start(&mut self) -> Result<()> {
        let mut mdns_requested = false;

        for inst in &mut self.instances {
            if inst.mode == Mode::Unconfigured {
                return Err(anyhow!("instance {} is missing a mode configuration", inst.name));
            }

            if inst.ssrc == 0 {
                inst.ssrc = loop {
                    let ssrc: u32 = rand::random();
                    if ssrc != 0 {
                        break ssrc;
                    }
                };
            }

            if inst.data.is_none() {
                inst.bind("::", 0)
                    .or_else(|_| inst.bind("0.0.0.0", 0))
                    .with_context(|| format!("failed to bind default sockets for instance {}", inst.name))?;
            }

            // configured peers on direct instances are always addressable,
            // apple peers go through session negotiation first
            match inst.mode {
                Mode::Direct => {
                    for peer in &mut inst.peers {
                        peer.connected = true;
                    }
                }
                Mode::Apple => mdns_requested = true,
                Mode::Unconfigured => unreachable!(),
            }
        }

        if mdns_requested {
            match self.mdns_name.as_deref() {
                Some(name) => match MdnsService::start(name, self.mdns_interface.as_deref()) {
                    Ok(mdns) => self.mdns = Some(mdns),
                    Err(error) => warn!(
                        "Failed to set up mDNS discovery, instances may not show up on remote hosts \
                         and may not find remote peers: {}",
                        error
                    ),
                },
                None => warn!("No mDNS name set, disabling AppleMIDI discovery"),
            }
        }

        info!("Registered {} descriptors", self.descriptors().len());
        Ok(())
    }

    /// Send the mDNS goodbyes and release all sockets.
    pub fn shutdown(&mut self) {
        for inst in &mut self.instances {
            if let Some(mdns) = &self.mdns {
                if inst.mode == Mode::Apple {
                    if let Err(error) = mdns.detach(&inst.name) {
                        warn!("Failed to send detach for instance {}: {}", inst.name, error);
                    }
                }
            }
            inst.shutdown();
        }
        self.mdns = None;
        info!("Backend shut down");
    }

    /// Process readable descriptors. The service tick runs first so announce
    /// and sync traffic is not starved by inbound data.
    pub fn process(&mut self, ready: &[RawFd]) {
        let now = self.now();
        if now.saturating_sub(self.last_service) >= SERVICE_INTERVAL_MS {
            self.service(now);
            self.last_service = now;
        }

        for &fd in ready {
            if self.mdns.as_ref().is_some_and(|mdns| mdns.owns(fd)) {
                let discovered = match self.mdns.as_ref() {
                    Some(mdns) => mdns.drain(fd),
                    None => Vec::new(),
                };
                for (peer, source) in discovered {
                    self.apple_peermatch(&peer.session, source, peer.control_port);
                }
                continue;
            }

            let now = self.now();
            let mut matched = false;
            for index in 0..self.instances.len() {
                let inst = &self.instances[index];
                let is_data = inst.data.as_ref().is_some_and(|socket| socket.as_raw_fd() == fd);
                let is_control = inst
                    .control
                    .as_ref()
                    .is_some_and(|socket| socket.as_raw_fd() == fd);
                if is_data {
                    let events = self.events.clone();
                    let detect = self.detect;
                    self.instances[index].handle_data(now, detect, &events);
                } else if is_control {
                    let events = self.events.clone();
                    self.instances[index].handle_control(now, &events);
                }
                if is_data || is_control {
                    matched = true;
                    break;
                }
            }
            if !matched {
                warn!("Signaled for unknown descriptor {}", fd);
            }
        }
    }

    /// Periodic service work: mDNS announce, peer expiry, clock sync to
    /// connected peers, re-invites to configured peers.
    fn service(&mut self, now: u64) {
        for inst in &mut self.instances {
            if inst.mode != Mode::Apple {
                continue;
            }

            if let Some(mdns) = &self.mdns {
                if inst.last_announce == 0
                    || now.saturating_sub(inst.last_announce) > ANNOUNCE_INTERVAL_MS
                {
                    if let Err(error) = mdns.announce(&inst.name, inst.control_port) {
                        warn!("Failed to announce instance {}: {}", inst.name, error);
                    }
                    inst.last_announce = now;
                }
            }

            inst.expire_peers(now, &self.events);

            for peer in 0..inst.peers.len() {
                if inst.peers[peer].active && inst.peers[peer].connected {
                    debug!("Instance {} initializing sync on peer {}", inst.name, peer);
                    inst.send_sync(peer, now);
                } else if inst.peers[peer].active
                    && !inst.peers[peer].learned
                    && (now / 1000) % 10 == 0
                {
                    // periodically retry configured but unconnected peers
                    debug!("Instance {} inviting configured peer {}", inst.name, peer);
                    if let Err(error) =
                        inst.peer_apple_command(peer, SocketKind::Control, SessionCommand::Invite, None)
                    {
                        warn!("{}", error);
                    }
                }
            }
        }
    }

    /// React to a discovered remote session: invite it on every instance
    /// whose invite list names it, converting wildcard patterns to explicit
    /// ones on first sight so subsequent matching is stable.
    pub fn apple_peermatch(&mut self, session: &str, source: SocketAddr, control_port: u16) {
        let now = self.now();
        let mut dest = source;
        dest.set_port(control_port + 1);

        // a literal match suppresses wildcard handling; the second pass picks
        // up invitations the wildcard conversion just made explicit
        for _ in 0..2 {
            let mut matched = false;
            for inst in &mut self.instances {
                for pattern in 0..inst.invites.len() {
                    if inst.invites[pattern] != session {
                        continue;
                    }
                    matched = true;
                    debug!("Peer {} explicitly invited on instance {}", session, inst.name);

                    let existing = inst.peers.iter().position(|peer| {
                        peer.active && peer.learned && peer.invite_ref == Some(pattern)
                    });
                    let peer = match existing {
                        Some(peer) => {
                            // already connected, or announced on a different
                            // address family: leave the entry alone
                            if inst.peers[peer].connected
                                || inst.peers[peer].dest.is_ipv4() != dest.is_ipv4()
                            {
                                continue;
                            }
                            inst.peers[peer].dest = dest;
                            peer
                        }
                        None => inst.push_peer(dest, true, false, Some(pattern), now),
                    };

                    info!("Inviting peer {} to instance {}", session, inst.name);
                    if let Err(error) =
                        inst.peer_apple_command(peer, SocketKind::Control, SessionCommand::Invite, None)
                    {
                        warn!("{}", error);
                    }
                }
            }
            if matched {
                return;
            }

            // no literal invitation names this session: convert wildcards
            let mut converted = false;
            for inst in &mut self.instances {
                if inst.invites.iter().any(|pattern| pattern == "*")
                    && !inst.invites.iter().any(|pattern| pattern == session)
                {
                    debug!(
                        "Peer {} implicitly invited on instance {}, converting to explicit invitation",
                        session, inst.name
                    );
                    inst.invites.push(session.to_string());
                    converted = true;
                }
            }
            if !converted {
                return;
            }
        }
    }
}

fn parse_hostspec(value: &str) -> (&str, Option<u16>) {
    if let Some((host, port)) = value.rsplit_once(':') {
        if !host.is_empty() {
            if let Ok(port) = port.parse() {
                return (host, Some(port));
            }
        }
    }
    (value, None)
}

fn resolve_peer(host: &str, port: u16) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("no addresses for {}", host))
}
