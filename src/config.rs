//! Construction-time knobs for a [`crate::Stack`] (§3.1, §6). Every
//! bound/capacity named by the individual module configs (`ArpConfig`,
//! `PmtuConfig`, `ReassemblyConfig`, ...) is collected here so a caller
//! configures one struct instead of threading five through `Stack::new`.

use crate::arp::ArpConfig;
use crate::ipv4::pmtu::PmtuConfig;
use crate::ipv4::reassembly::ReassemblyConfig;
use crate::udp::EphemeralRange;

/// Which 4-tuple index structure the TCP PCB table uses (§4.5). The
/// choice is fixed for the life of a `Stack` — there is no benefit to
/// switching at runtime, and a fixed choice keeps `Stack` itself
/// non-generic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcbIndexKind {
    /// `BTreeMap`-backed, O(log N) lookups. The right default once
    /// `num_tcp_pcbs` grows past a couple dozen.
    Tree,
    /// MRU-ordered linear scan. Allocation-light and faster than the
    /// tree for the small PCB counts typical of embedded deployments.
    Linear,
}

impl Default for PcbIndexKind {
    fn default() -> Self {
        PcbIndexKind::Linear
    }
}

/// Aggregate configuration for a [`crate::Stack`] (§3.1). Construct with
/// [`StackConfig::default`] and override fields, or use the `with_*`
/// builders for a fluent style.
#[derive(Clone, Debug)]
pub struct StackConfig {
    pub arp: ArpConfig,
    pub pmtu: PmtuConfig,
    pub reassembly: ReassemblyConfig,
    pub udp_ephemeral: EphemeralRange,
    pub tcp_ephemeral: EphemeralRange,

    /// Maximum number of simultaneous TCP PCBs (`NumTcpPcbs`).
    pub num_tcp_pcbs: usize,
    /// Which index structure backs the PCB table.
    pub pcb_index: PcbIndexKind,
    /// Per-connection send-buffer capacity in bytes.
    pub tcp_send_buffer: usize,
    /// Per-connection receive-buffer capacity in bytes, also advertised
    /// as the initial receive window.
    pub tcp_recv_buffer: usize,
    /// Maximum pending (not yet `accept`ed) connections per listener.
    pub tcp_listen_backlog: usize,
    /// Maximum default-MSS used before any PMTU estimate narrows it.
    pub tcp_default_mss: u16,
    /// Advertised `WindowScale` option (§4.7), 0 disables scaling.
    pub tcp_window_scale: u8,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            arp: ArpConfig::default(),
            pmtu: PmtuConfig::default(),
            reassembly: ReassemblyConfig::default(),
            udp_ephemeral: EphemeralRange::default(),
            tcp_ephemeral: EphemeralRange::default(),
            num_tcp_pcbs: 16,
            pcb_index: PcbIndexKind::default(),
            tcp_send_buffer: 16 * 1024,
            tcp_recv_buffer: 16 * 1024,
            tcp_listen_backlog: 4,
            tcp_default_mss: crate::tcp::DEFAULT_MSS,
            tcp_window_scale: 0,
        }
    }
}

impl StackConfig {
    pub fn with_num_tcp_pcbs(mut self, n: usize) -> Self {
        self.num_tcp_pcbs = n;
        self
    }

    pub fn with_pcb_index(mut self, kind: PcbIndexKind) -> Self {
        self.pcb_index = kind;
        self
    }

    pub fn with_tcp_buffers(mut self, send: usize, recv: usize) -> Self {
        self.tcp_send_buffer = send;
        self.tcp_recv_buffer = recv;
        self
    }

    pub fn with_tcp_listen_backlog(mut self, backlog: usize) -> Self {
        self.tcp_listen_backlog = backlog;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_picks_linear_pcb_index() {
        assert_eq!(StackConfig::default().pcb_index, PcbIndexKind::Linear);
    }

    #[test]
    fn builders_override_defaults() {
        let cfg = StackConfig::default()
            .with_num_tcp_pcbs(32)
            .with_pcb_index(PcbIndexKind::Tree)
            .with_tcp_buffers(4096, 8192);
        assert_eq!(cfg.num_tcp_pcbs, 32);
        assert_eq!(cfg.pcb_index, PcbIndexKind::Tree);
        assert_eq!(cfg.tcp_send_buffer, 4096);
        assert_eq!(cfg.tcp_recv_buffer, 8192);
    }
}
