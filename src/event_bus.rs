use std::net::SocketAddr;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::channel::ChannelIdent;

/// Events surfaced to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A decoded inbound MIDI event on one of the instance's channels.
    ChannelUpdate {
        instance: usize,
        ident: ChannelIdent,
        value: f64,
    },
    /// An AppleMIDI peer completed session negotiation (or was learned from
    /// direct-mode traffic) and will now receive outbound data.
    PeerConnected {
        instance: usize,
        peer: SocketAddr,
    },
    /// A peer left the session or was expired by the service loop.
    PeerLost {
        instance: usize,
        peer: SocketAddr,
    },
}

pub struct EventBus {
    pub sender: Sender<Event>,
    pub receiver: Receiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
