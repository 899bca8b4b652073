//! A thin demo host for the stack: bridges a Linux TAP device to a
//! [`tapstack::Stack`] and services it with a plain poll loop.
//!
//! ```text
//! sudo tapstackd --tap tap0 --ip 10.0.0.1 --netmask 255.255.255.0
//! ```
//!
//! This binary is intentionally small — it owns nothing but the event
//! loop and CLI parsing. All protocol behavior lives in the library.

use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use tapstack::config::StackConfig;
use tapstack::interface::InterfaceConfig;
use tapstack::platform::tap::TapDevice;
use tapstack::platform::{Clock, MonotonicClock};
use tapstack::types::{FourTuple, Ipv4Addr, MacAddr};
use tapstack::udp::{UdpHandler, Verdict};
use tapstack::Stack;

/// Bridges a TAP device to a userspace IPv4/TCP/UDP stack.
#[derive(Parser)]
#[command(name = "tapstackd", version, about)]
struct Args {
    /// TAP device name, created if it does not already exist.
    #[arg(long, default_value = "tap0")]
    tap: String,

    /// Locally administered MAC address for the stack side.
    #[arg(long, default_value = "02:00:00:00:00:01", value_parser = parse_mac)]
    mac: MacAddr,

    /// IPv4 address to assign to the interface.
    #[arg(long, value_parser = parse_ip)]
    ip: Ipv4Addr,

    /// Subnet mask.
    #[arg(long, default_value = "255.255.255.0", value_parser = parse_ip)]
    netmask: Ipv4Addr,

    /// Default gateway, if any.
    #[arg(long, value_parser = parse_ip)]
    gateway: Option<Ipv4Addr>,

    /// Interface MTU.
    #[arg(long, default_value_t = 1500)]
    mtu: u16,

    /// UDP port to run a smoke-test echo logger on.
    #[arg(long)]
    echo_port: Option<u16>,
}

fn parse_ip(s: &str) -> Result<Ipv4Addr, String> {
    Ipv4Addr::parse(s).ok_or_else(|| format!("not a dotted-quad IPv4 address: {s}"))
}

fn parse_mac(s: &str) -> Result<MacAddr, String> {
    let mut bytes = [0u8; 6];
    let mut parts = s.split(':');
    for b in bytes.iter_mut() {
        let part = parts.next().ok_or_else(|| format!("not a MAC address: {s}"))?;
        *b = u8::from_str_radix(part, 16).map_err(|_| format!("not a MAC address: {s}"))?;
    }
    if parts.next().is_some() {
        return Err(format!("not a MAC address: {s}"));
    }
    Ok(MacAddr(bytes))
}

struct EchoLogger {
    port: u16,
}

impl UdpHandler for EchoLogger {
    fn on_datagram(&mut self, tuple: FourTuple, data: &[u8]) -> Verdict {
        info!("udp: {} bytes from {} on port {}", data.len(), tuple.remote_addr, self.port);
        Verdict::AcceptStop
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let write_handle = match TapDevice::open(&args.tap) {
        Ok(t) => t,
        Err(e) => {
            error!("failed to open TAP device {}: {e}", args.tap);
            std::process::exit(1);
        }
    };
    if let Err(e) = write_handle.set_nonblocking() {
        warn!("could not set {} non-blocking, reads may stall: {e}", args.tap);
    }
    let mut read_handle = match write_handle.try_clone() {
        Ok(h) => h,
        Err(e) => {
            error!("failed to duplicate TAP fd: {e}");
            std::process::exit(1);
        }
    };

    info!("tapstackd: {} up, mac={} ip={} netmask={} mtu={}", args.tap, args.mac, args.ip, args.netmask, args.mtu);

    let clock = MonotonicClock::new();
    let mut stack = Stack::new(StackConfig::default(), clock.clone());
    let iface = stack.add_interface(
        InterfaceConfig {
            mac: args.mac,
            ip4: Some(args.ip),
            netmask: args.netmask,
            gateway: args.gateway,
            mtu: args.mtu,
        },
        Box::new(write_handle),
    );

    if let Some(port) = args.echo_port {
        if let Err(e) = stack.udp_bind(port, Box::new(EchoLogger { port })) {
            warn!("could not bind echo port {port}: {e}");
        } else {
            info!("udp smoke-test logger listening on port {port}");
        }
    }

    let mut buf = vec![0u8; args.mtu as usize + 18];
    let mut last_poll = clock.now_ms();
    loop {
        match read_handle.recv_frame(&mut buf) {
            Ok(Some(n)) => stack.receive_frame(iface, &buf[..n]),
            Ok(None) => std::thread::sleep(Duration::from_millis(5)),
            Err(e) => {
                error!("tap read error: {e}");
                break;
            }
        }
        let now = clock.now_ms();
        if now.saturating_sub(last_poll) >= 50 {
            stack.poll();
            last_poll = now;
        }
    }
}
