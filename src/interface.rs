//! A single layer-2/IPv4 interface: the owner of an ARP cache, a listener
//! list, and the driver handle frames are sent through.

use log::{info, warn};

use crate::arp::{ArpCache, ArpConfig};
use crate::error::{Result, StackError};
use crate::platform::L2Driver;
use crate::types::{Ipv4Addr, MacAddr};

/// What a per-interface listener (IP receive hook, §4.4) returns.
pub enum ListenerVerdict {
    /// Let IP continue normal dispatch.
    Continue,
    /// The listener consumed the packet; stop processing it.
    Consumed,
}

/// A per-interface IP-receive listener. Boxed so `Interface` can hold a
/// heterogeneous list (DHCP clients, packet capture, etc.) without a
/// generic parameter leaking into every call site.
pub trait IpListener {
    fn on_receive(&mut self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> ListenerVerdict;
}

/// Static (non-ARP-cache) configuration for one interface, supplied at
/// registration time.
#[derive(Clone, Copy, Debug)]
pub struct InterfaceConfig {
    pub mac: MacAddr,
    pub ip4: Option<Ipv4Addr>,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub mtu: u16,
}

impl InterfaceConfig {
    pub fn unconfigured(mac: MacAddr, mtu: u16) -> Self {
        InterfaceConfig {
            mac,
            ip4: None,
            netmask: Ipv4Addr::ZERO,
            gateway: None,
            mtu,
        }
    }
}

/// An identifier for a registered interface inside a [`crate::Stack`],
/// stable for the interface's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct InterfaceId(pub(crate) u32);

pub struct Interface {
    pub id: InterfaceId,
    pub mac: MacAddr,
    pub ip4: Option<Ipv4Addr>,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub mtu: u16,
    pub arp: ArpCache,
    listeners: Vec<Box<dyn IpListener>>,
    /// Bumped whenever this interface is used to route a packet, for the
    /// routing table's MRU tie-break (§4.4).
    pub(crate) last_used: u64,
    driver: Box<dyn L2Driver>,
}

impl Interface {
    pub fn new(
        id: InterfaceId,
        config: InterfaceConfig,
        arp_config: ArpConfig,
        driver: Box<dyn L2Driver>,
    ) -> Self {
        info!(
            "interface {}: registered mac={} ip={:?} mtu={}",
            id.0, config.mac, config.ip4, config.mtu
        );
        Interface {
            id,
            mac: config.mac,
            ip4: config.ip4,
            netmask: config.netmask,
            gateway: config.gateway,
            mtu: config.mtu,
            arp: ArpCache::new(arp_config),
            listeners: Vec::new(),
            last_used: 0,
            driver,
        }
    }

    /// Sends a complete Ethernet frame out this interface's driver.
    pub(crate) fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.driver.send_frame(frame)
    }

    pub fn link_state(&self) -> crate::platform::LinkState {
        self.driver.link_state()
    }

    pub fn add_listener(&mut self, listener: Box<dyn IpListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn run_listeners(
        &mut self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        payload: &[u8],
    ) -> ListenerVerdict {
        for listener in self.listeners.iter_mut() {
            if let ListenerVerdict::Consumed = listener.on_receive(src, dst, protocol, payload) {
                return ListenerVerdict::Consumed;
            }
        }
        ListenerVerdict::Continue
    }

    /// Reconfigures the interface's address, resetting the ARP cache per
    /// §4.2 ("any subnet mismatch is an immediate reset").
    pub fn reconfigure(&mut self, ip4: Option<Ipv4Addr>, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) {
        warn!(
            "interface {}: reconfiguring {:?}/{:?} -> {:?}/{:?}, resetting ARP cache",
            self.id.0, self.ip4, self.netmask, ip4, netmask
        );
        self.ip4 = ip4;
        self.netmask = netmask;
        self.gateway = gateway;
        self.arp.reset_all();
    }

    pub fn is_local_unicast(&self, addr: Ipv4Addr) -> bool {
        self.ip4 == Some(addr)
    }

    pub fn is_in_subnet(&self, addr: Ipv4Addr) -> bool {
        match self.ip4 {
            Some(ip4) => addr.is_in_subnet(ip4, self.netmask),
            None => false,
        }
    }

    pub fn is_broadcast(&self, addr: Ipv4Addr) -> bool {
        addr.is_broadcast(self.netmask)
    }

    pub fn require_ip4(&self) -> Result<Ipv4Addr> {
        self.ip4.ok_or(StackError::NoIpRoute)
    }

    /// Patches the sender MAC/IP fields `ArpCache::build_request` leaves
    /// zeroed (the cache doesn't know its own interface's address) and
    /// wraps the result in an Ethernet frame ready to send.
    pub(crate) fn finish_arp_request(&self, out: &crate::arp::OutgoingArp) -> Vec<u8> {
        let mut payload = out.payload;
        payload[8..14].copy_from_slice(self.mac.as_bytes());
        if let Some(ip) = self.ip4 {
            payload[14..18].copy_from_slice(ip.as_bytes());
        }
        crate::ethernet::build_frame(out.dst, self.mac, crate::ethernet::ETHERTYPE_ARP, &payload)
    }
}
