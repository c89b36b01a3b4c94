use advmac::MacAddr6;
use compact_str::CompactString;
use dhcproto::v6::{DhcpOption, Message, RelayMessage, IAAddr, IAPrefix, IANA, IAPD};
use tracing::debug;

/// Helpers for interacting with dhcproto::v6::Message
pub trait MessageExtV6 {
    fn client_id(&self) -> Option<&[u8]>;
    fn server_id(&self) -> Option<&[u8]>;
    fn rapid_commit(&self) -> bool;
    fn elapsed_time(&self) -> Option<u16>;
    /// Every IA_NA option in the message, in wire order.
    fn ia_nas(&self) -> Vec<&IANA>;
    /// Every IA_PD option in the message, in wire order.
    fn ia_pds(&self) -> Vec<&IAPD>;
}

/// Helpers for interacting with dhcproto::v6::RelayMessage
pub trait RelayMessageExtV6 {
    fn hw_addr(&self) -> Option<MacAddr6>;
    fn interface_id(&self) -> Option<CompactString>;
}

impl MessageExtV6 for Message {
    /// Bytes of the client DUID
    fn client_id(&self) -> Option<&[u8]> {
        self.opts().iter().find_map(|opt| match opt {
            DhcpOption::ClientId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    fn server_id(&self) -> Option<&[u8]> {
        self.opts().iter().find_map(|opt| match opt {
            DhcpOption::ServerId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    fn rapid_commit(&self) -> bool {
        self.opts()
            .iter()
            .any(|opt| matches!(opt, DhcpOption::RapidCommit))
    }

    fn elapsed_time(&self) -> Option<u16> {
        self.opts().iter().find_map(|opt| match opt {
            DhcpOption::ElapsedTime(t) => Some(*t),
            _ => None,
        })
    }

    fn ia_nas(&self) -> Vec<&IANA> {
        self.opts()
            .iter()
            .filter_map(|opt| match opt {
                DhcpOption::IANA(iana) => Some(iana),
                _ => None,
            })
            .collect()
    }

    fn ia_pds(&self) -> Vec<&IAPD> {
        self.opts()
            .iter()
            .filter_map(|opt| match opt {
                DhcpOption::IAPD(iapd) => Some(iapd),
                _ => None,
            })
            .collect()
    }
}

impl RelayMessageExtV6 for RelayMessage {
    /// Link layer address of the client per the Client Link-Layer Address
    /// option (RFC 6939). Used for logging only.
    fn hw_addr(&self) -> Option<MacAddr6> {
        self.opts().iter().find_map(|opt| match opt {
            DhcpOption::ClientLinklayerAddress(ll) if ll.address.len() == 6 => {
                let mut bytes = [0u8; 6];
                bytes.copy_from_slice(&ll.address[0..6]);
                Some(MacAddr6::new(bytes))
            }
            DhcpOption::ClientLinklayerAddress(ll) => {
                debug!("relay ClientLinkLayerAddress wasn't 6 bytes: {:?}", ll);
                None
            }
            _ => None,
        })
    }

    fn interface_id(&self) -> Option<CompactString> {
        self.opts().iter().find_map(|opt| match opt {
            DhcpOption::InterfaceId(id) => CompactString::from_utf8(id).ok(),
            _ => None,
        })
    }
}

/// Address hints the client packed inside an IA_NA.
pub fn ia_addr_hints(iana: &IANA) -> Vec<&IAAddr> {
    iana.opts
        .iter()
        .filter_map(|opt| match opt {
            DhcpOption::IAAddr(addr) => Some(addr),
            _ => None,
        })
        .collect()
}

/// Prefix hints the client packed inside an IA_PD.
pub fn ia_prefix_hints(iapd: &IAPD) -> Vec<&IAPrefix> {
    iapd.opts
        .iter()
        .filter_map(|opt| match opt {
            DhcpOption::IAPrefix(prefix) => Some(prefix),
            _ => None,
        })
        .collect()
}
