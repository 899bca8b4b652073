//! The single error enumeration shared by every layer of the stack.

use thiserror::Error;

/// Errors that can cross a public API boundary.
///
/// Inbound processing never returns these — bad inbound packets are silent
/// drops logged at `trace` level (see [`crate::error::DropReason`]). This
/// enum is for outbound calls (`Stack::send_udp`, `Connection::start`, ARP
/// resolution, ...) and for the `connectionAborted`-style callbacks fired
/// by TCP.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// No interface matches the destination address.
    #[error("no IP route to destination")]
    NoIpRoute,

    /// The ARP cache has no usable entry and the destination cannot be
    /// resolved to the broadcast MAC.
    #[error("no hardware (ARP) route to destination")]
    NoHardwareRoute,

    /// ARP resolution has started; the caller may register a retry waiter.
    #[error("ARP query in progress")]
    ArpQueryInProgress,

    /// `DontFragment` was set but the payload does not fit the path MTU.
    #[error("fragmentation needed but not permitted")]
    FragNeeded,

    /// Destination is a broadcast address and `AllowBroadcast` was not set.
    #[error("broadcast destination rejected")]
    BcastRejected,

    /// Source address is not the outgoing interface's address and
    /// `AllowNonLocalSrc` was not set.
    #[error("non-local source address rejected")]
    NonlocalSrc,

    /// The outbound buffer lacks the reserved bytes for a lower-layer header.
    #[error("no header space reserved in outbound buffer")]
    NoHeaderSpace,

    /// The PMTU cache has no free entry for a new destination.
    #[error("no PMTU cache entry available")]
    NoMtuEntryAvailable,

    /// UDP could not allocate an ephemeral source port.
    #[error("no ephemeral port available")]
    NoPortAvailable,

    /// The requested UDP/TCP 4-tuple (or port, for a listener) is already bound.
    #[error("address already in use")]
    AddrInUse,

    /// Inbound checksum mismatch. Only constructed in test/diagnostic paths;
    /// production receive code never returns this to a caller.
    #[error("checksum mismatch")]
    BadChecksum,

    /// Inbound packet failed structural validation. Only constructed in
    /// test/diagnostic paths.
    #[error("malformed packet")]
    MalformedPacket,

    /// The connection was aborted by the peer (RST) or by a protocol error.
    #[error("connection aborted")]
    ConnectionAborted,

    /// The connection was reset locally (e.g. `reset(true)` on unconsumed data).
    #[error("connection reset")]
    ConnectionReset,

    /// The TCP PCB pool is exhausted; no PCB is available for this attempt.
    #[error("no PCB available")]
    NoPcbAvailable,
}

/// Reasons an inbound packet was silently dropped.
///
/// These never leave the crate as [`StackError`]s — §7 of the design is
/// explicit that inbound errors are silent drops. They exist purely so that
/// [`crate::stack::Stack::diagnostics`] and `log::trace!` call sites have
/// something structured to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TooShort,
    BadVersion,
    BadChecksum,
    TtlExceeded,
    NoRoute,
    ReassemblyTableFull,
    ReassemblyTimedOut,
    UnknownProtocol,
    NotAcceptable,
    NoMatchingPcbOrListener,
    ListenerBacklogFull,
}

pub type Result<T> = core::result::Result<T, StackError>;
