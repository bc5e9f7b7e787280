//! MIDI-over-network bridge: RTP-MIDI (RFC 6295) and AppleMIDI session
//! transport over UDP, with mDNS/DNS-SD peer discovery.

pub mod backend;
pub mod channel;
pub mod discovery;
pub mod dns;
pub mod epn;
pub mod event_bus;
pub mod midi;

use anyhow::Result;
use crossbeam_channel::Sender;
use serde::Deserialize;

pub use backend::{RtpMidiBackend, ANNOUNCE_INTERVAL_MS, SERVICE_INTERVAL_MS};
pub use channel::{parse_spec, ChannelIdent, EventType};
pub use event_bus::{Event, EventBus};

/// Typed view of the backend configuration; maps one-to-one onto the
/// string-keyed `configure`/`configure_instance` options.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    pub mdns_name: Option<String>,
    pub mdns_interface: Option<String>,
    #[serde(default)]
    pub detect: bool,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InstanceConfig {
    pub name: String,
    /// `direct` or `apple`.
    pub mode: String,
    pub ssrc: Option<String>,
    pub bind: Option<String>,
    #[serde(default)]
    pub peers: Vec<String>,
    pub learn: Option<bool>,
    #[serde(default)]
    pub invite: Vec<String>,
    pub join: Option<String>,
    pub epn_tx: Option<String>,
    pub note_off: Option<bool>,
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Construct and configure a backend from this description.
    pub fn build(&self, events: Sender<Event>) -> Result<RtpMidiBackend> {
        let mut backend = RtpMidiBackend::new(events);

        if let Some(name) = &self.mdns_name {
            backend.configure("mdns-name", name)?;
        }
        if let Some(interface) = &self.mdns_interface {
            backend.configure("mdns-interface", interface)?;
        }
        if self.detect {
            backend.configure("detect", "on")?;
        }

        for instance in &self.instances {
            let id = backend.create_instance(&instance.name);
            backend.configure_instance(id, "mode", &instance.mode)?;
            if let Some(ssrc) = &instance.ssrc {
                backend.configure_instance(id, "ssrc", ssrc)?;
            }
            if let Some(learn) = instance.learn {
                backend.configure_instance(id, "learn", if learn { "true" } else { "false" })?;
            }
            if let Some(join) = &instance.join {
                backend.configure_instance(id, "join", join)?;
            }
            if let Some(epn_tx) = &instance.epn_tx {
                backend.configure_instance(id, "epn-tx", epn_tx)?;
            }
            if let Some(note_off) = instance.note_off {
                backend.configure_instance(id, "note-off", if note_off { "true" } else { "false" })?;
            }
            if let Some(bind) = &instance.bind {
                backend.configure_instance(id, "bind", bind)?;
            }
            for peer in &instance.peers {
                backend.configure_instance(id, "peer", peer)?;
            }
            for invite in &instance.invite {
                backend.configure_instance(id, "invite", invite)?;
            }
        }

        Ok(backend)
    }
}
