//! Reassembly of RPN/NRPN control-change fragments (CC 98/99/100/101/6/38)
//! into complete 14-bit extended-parameter events, per MIDI channel.

const EPN_NRPN: u8 = 0x01;
const EPN_PARAMETER_HI: u8 = 0x02;
const EPN_PARAMETER_LO: u8 = 0x04;
const EPN_VALUE_HI: u8 = 0x08;

/// A completed extended-parameter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpnEvent {
    pub nrpn: bool,
    pub control: u16,
    pub value: u16,
}

/// Per-channel reassembly state. Partial sequences persist until completed or
/// invalidated by a family switch; there is no timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct EpnState {
    status: u8,
    control: u16,
    value: u16,
}

impl EpnState {
    /// Feed one control change into the machine. Returns a completed event
    /// when CC 38 finishes a fully addressed parameter update.
    pub fn handle(&mut self, control: u8, value: u8) -> Option<EpnEvent> {
        let control = control as u16;
        let value = value as u16;

        // switching between nrpn and rpn clears all valid bits
        if ((self.status & EPN_NRPN) != 0 && (control == 101 || control == 100))
            || ((self.status & EPN_NRPN) == 0 && (control == 99 || control == 98))
        {
            self.status &= !(EPN_NRPN | EPN_PARAMETER_LO | EPN_PARAMETER_HI);
        }

        // setting an address always invalidates the value valid bits
        if (98..=101).contains(&control) {
            self.status &= !EPN_VALUE_HI;
        }

        // parameter hi
        if control == 101 || control == 99 {
            self.control &= 0x7F;
            self.control |= value << 7;
            self.status |= EPN_PARAMETER_HI | if control == 99 { EPN_NRPN } else { 0 };
            if control == 101 && value == 127 {
                self.status &= !EPN_PARAMETER_HI;
            }
        }

        // parameter lo
        if control == 100 || control == 98 {
            self.control &= !0x7F;
            self.control |= value & 0x7F;
            self.status |= EPN_PARAMETER_LO | if control == 98 { EPN_NRPN } else { 0 };
            if control == 100 && value == 127 {
                self.status &= !EPN_PARAMETER_LO;
            }
        }

        // value hi, only accepted once the parameter is fully addressed
        if control == 6
            && (self.status & (EPN_PARAMETER_HI | EPN_PARAMETER_LO))
                == (EPN_PARAMETER_HI | EPN_PARAMETER_LO)
        {
            self.value = value << 7;
            self.status |= EPN_VALUE_HI;
        }

        // value lo, flush the assembled event
        if control == 38 && (self.status & EPN_VALUE_HI) != 0 {
            self.value &= !0x7F;
            self.value |= value & 0x7F;
            self.status &= !EPN_VALUE_HI;

            return Some(EpnEvent {
                nrpn: (self.status & EPN_NRPN) != 0,
                control: self.control,
                value: self.value,
            });
        }

        None
    }
}
