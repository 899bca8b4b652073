//! Inbound segment processing (§4.6): PCB lookup/creation, the SYN_SENT
//! special case, the RFC 793 §3.9 acceptability test, and RST/SYN/ACK/
//! data/FIN handling for every other state.

use log::{debug, trace, warn};

use crate::error::StackError;
use crate::ipv4::pmtu::MtuRef;
use crate::tcp::connect::{build_outgoing, build_outgoing_syn, invoke_handler, OutgoingSegment, TcpEngine};
use crate::tcp::output;
use crate::tcp::pcb::{Pcb, PcbId, PcbOwner};
use crate::tcp::{congestion, Flags, Segment, State, DELAYED_ACK_SEGMENTS, TIME_WAIT_MS};
use crate::types::{FourTuple, Ipv4Addr};

const MAX_OOO_SEGMENTS: usize = 8;

/// Feeds one validated, checksummed-ok segment into the engine. Returns
/// whatever needs to go out on the wire in response.
pub fn receive(engine: &mut TcpEngine, now_ms: u64, src: Ipv4Addr, dst: Ipv4Addr, seg: &Segment<'_>) -> Vec<OutgoingSegment> {
    let tuple = FourTuple::new(dst, seg.dst_port, src, seg.src_port);

    let Some(id) = engine.pcbs.lookup(tuple) else {
        return handle_no_match(engine, tuple, seg, now_ms);
    };

    let state = match engine.pcbs.get(id) {
        Some(pcb) => pcb.state,
        None => return Vec::new(),
    };

    if state == State::SynSent {
        return handle_syn_sent(engine, id, tuple, seg);
    }

    handle_established(engine, id, tuple, seg, now_ms)
}

/// No PCB owns this 4-tuple: either it's a SYN for a listener (passive
/// open) or it gets an RST.
fn handle_no_match(engine: &mut TcpEngine, tuple: FourTuple, seg: &Segment<'_>, now_ms: u64) -> Vec<OutgoingSegment> {
    if seg.flags.contains(Flags::RST) {
        return Vec::new();
    }

    if seg.flags.contains(Flags::SYN) && !seg.flags.contains(Flags::ACK) {
        if let Some(out) = try_passive_open(engine, tuple, seg, now_ms) {
            return vec![out];
        }
        trace!("tcp: SYN for {} dropped (no listener or listener full)", tuple);
        return Vec::new();
    }

    vec![build_outgoing(tuple, seg.ack, seg.seq.wrapping_add(1), Flags::RST | Flags::ACK, 0, &[])]
}

fn try_passive_open(engine: &mut TcpEngine, tuple: FourTuple, seg: &Segment<'_>, now_ms: u64) -> Option<OutgoingSegment> {
    let listener_idx = engine.listeners.iter().position(|l| l.port == tuple.local_port)?;
    if engine.listeners[listener_idx].pending.len() >= engine.listeners[listener_idx].max_pcbs {
        debug!("tcp: listener on port {} at backlog capacity", tuple.local_port);
        return None;
    }

    let iss = engine.pcbs.next_iss(now_ms);
    let mss = seg.options.mss.unwrap_or(crate::tcp::DEFAULT_MSS).min(engine.config.default_mss);
    let window_scale = if seg.options.window_scale.is_some() { engine.config.window_scale } else { 0 };

    let mut pcb = Pcb::new(
        tuple,
        iss,
        MtuRef(0),
        engine.config.recv_capacity as u32,
        engine.config.send_capacity,
        engine.config.recv_capacity,
    );
    pcb.state = State::SynRcvd;
    pcb.irs = seg.seq;
    pcb.rcv_nxt = seg.seq.wrapping_add(1);
    pcb.snd_mss = mss;
    pcb.window_scale_recv = seg.options.window_scale.unwrap_or(0);
    pcb.window_scale_send = window_scale;
    pcb.snd_wnd = seg.window as u32;

    let recv_wnd = pcb.rcv_wnd as u16;
    let rcv_nxt = pcb.rcv_nxt;
    let id = engine.pcbs.allocate(tuple, pcb)?;
    engine.pcbs.mark_referenced(id);
    if let Some(pcb) = engine.pcbs.get_mut(id) {
        pcb.owner = Some(PcbOwner::Listener(engine.listeners[listener_idx].id.0));
    }
    engine.listeners[listener_idx].pending.push(id);

    debug!("tcp: {} passive open, SYN_RCVD", tuple);
    Some(build_outgoing_syn(tuple, iss, rcv_nxt, Flags::SYN | Flags::ACK, recv_wnd, mss, window_scale))
}

/// §4.6 step 3: SYN_SENT only accepts a matching SYN|ACK, a bare SYN
/// (simultaneous open), or resets.
fn handle_syn_sent(engine: &mut TcpEngine, id: PcbId, tuple: FourTuple, seg: &Segment<'_>) -> Vec<OutgoingSegment> {
    {
        let Some(pcb) = engine.pcbs.get(id) else { return Vec::new() };
        if seg.flags.contains(Flags::ACK) {
            let ack_acceptable = seq_gt(seg.ack, pcb.iss) && seq_le(seg.ack, pcb.snd_nxt);
            if !ack_acceptable {
                return if seg.flags.contains(Flags::RST) {
                    Vec::new()
                } else {
                    vec![build_outgoing(tuple, seg.ack, 0, Flags::RST, 0, &[])]
                };
            }
            if seg.flags.contains(Flags::RST) {
                warn!("tcp: {} reset in SYN_SENT", tuple);
                abort(engine, id, Some(StackError::ConnectionReset));
                return Vec::new();
            }
        }
    }

    if !seg.flags.contains(Flags::SYN) {
        return Vec::new();
    }

    let established_ack = {
        let pcb = engine.pcbs.get_mut(id).unwrap();
        pcb.irs = seg.seq;
        pcb.rcv_nxt = seg.seq.wrapping_add(1);
        pcb.snd_wnd = seg.window as u32;
        pcb.snd_wl1 = seg.seq;
        pcb.snd_wl2 = seg.ack;
        if let Some(mss) = seg.options.mss {
            pcb.snd_mss = mss;
        }
        pcb.window_scale_recv = seg.options.window_scale.unwrap_or(0);

        if seg.flags.contains(Flags::ACK) {
            pcb.snd_una = seg.ack;
            pcb.state = State::Established;
            pcb.cwnd = congestion::initial_cwnd(pcb.snd_mss);
            Some(build_outgoing(tuple, pcb.snd_nxt, pcb.rcv_nxt, Flags::ACK, pcb.rcv_wnd as u16, &[]))
        } else {
            // Simultaneous open: both sides sent a bare SYN.
            pcb.state = State::SynRcvd;
            None
        }
    };

    if let Some(ack) = established_ack {
        debug!("tcp: {} SYN_SENT -> ESTABLISHED", tuple);
        invoke_handler(engine, id, |h, conn| h.connection_established(conn));
        return vec![ack];
    }

    debug!("tcp: {} simultaneous open, SYN_SENT -> SYN_RCVD", tuple);
    let pcb = engine.pcbs.get(id).unwrap();
    vec![build_outgoing_syn(tuple, pcb.iss, pcb.rcv_nxt, Flags::SYN | Flags::ACK, pcb.rcv_wnd as u16, pcb.snd_mss, 0)]
}

/// §4.6 steps 4-9, for every state other than SYN_SENT.
fn handle_established(engine: &mut TcpEngine, id: PcbId, tuple: FourTuple, seg: &Segment<'_>, now_ms: u64) -> Vec<OutgoingSegment> {
    let mut out = Vec::new();

    if !is_acceptable(engine, id, seg) {
        if !seg.flags.contains(Flags::RST) {
            if let Some(pcb) = engine.pcbs.get(id) {
                out.push(build_outgoing(tuple, pcb.snd_nxt, pcb.rcv_nxt, Flags::ACK, pcb.rcv_wnd as u16, &[]));
            }
        }
        return out;
    }

    if seg.flags.contains(Flags::RST) {
        let Some(pcb) = engine.pcbs.get(id) else { return out };
        if seg.seq == pcb.rcv_nxt {
            warn!("tcp: {} reset by peer", tuple);
            abort(engine, id, Some(StackError::ConnectionReset));
        } else {
            trace!("tcp: {} out-of-window RST, sending challenge ACK", tuple);
            out.push(build_outgoing(tuple, pcb.snd_nxt, pcb.rcv_nxt, Flags::ACK, pcb.rcv_wnd as u16, &[]));
        }
        return out;
    }

    if seg.flags.contains(Flags::SYN) {
        warn!("tcp: {} unexpected SYN within window, resetting", tuple);
        if let Some(pcb) = engine.pcbs.get(id) {
            out.push(build_outgoing(tuple, pcb.snd_nxt, 0, Flags::RST, 0, &[]));
        }
        abort(engine, id, Some(StackError::ConnectionReset));
        return out;
    }

    if seg.flags.contains(Flags::ACK) {
        process_ack(engine, id, tuple, seg, now_ms, &mut out);
    }

    if engine.pcbs.get(id).is_none() {
        return out; // process_ack may have torn the PCB down (LAST_ACK -> CLOSED)
    }

    if !seg.payload.is_empty() {
        process_data(engine, id, tuple, seg, now_ms, &mut out);
    }

    if seg.flags.contains(Flags::FIN) {
        process_fin(engine, id, tuple, now_ms, &mut out);
    }

    out
}

/// RFC 793 §3.9 acceptability test.
fn is_acceptable(engine: &TcpEngine, id: PcbId, seg: &Segment<'_>) -> bool {
    let Some(pcb) = engine.pcbs.get(id) else { return false };
    let seg_len = seg.payload.len() as u32 + if seg.flags.contains(Flags::FIN) { 1 } else { 0 };
    if pcb.rcv_wnd == 0 {
        return seg_len == 0 && seg.seq == pcb.rcv_nxt;
    }
    if seg_len == 0 {
        return in_window(seg.seq, pcb.rcv_nxt, pcb.rcv_wnd);
    }
    in_window(seg.seq, pcb.rcv_nxt, pcb.rcv_wnd) || in_window(seg.seq.wrapping_add(seg_len - 1), pcb.rcv_nxt, pcb.rcv_wnd)
}

fn in_window(seq: u32, rcv_nxt: u32, rcv_wnd: u32) -> bool {
    let offset = seq.wrapping_sub(rcv_nxt);
    offset < rcv_wnd
}

enum AckOutcome {
    AcksUnsent,
    NewDataAcked { consumed: usize, fin_just_acked: bool },
    DuplicateAck { force_retransmit: bool },
    Other,
}

fn process_ack(engine: &mut TcpEngine, id: PcbId, tuple: FourTuple, seg: &Segment<'_>, now_ms: u64, out: &mut Vec<OutgoingSegment>) {
    let outcome = {
        let Some(pcb) = engine.pcbs.get_mut(id) else { return };

        if pcb.state == State::SynRcvd {
            if seq_gt(seg.ack, pcb.snd_una) && seq_le(seg.ack, pcb.snd_nxt) {
                pcb.snd_una = seg.ack;
                pcb.state = State::Established;
                pcb.cwnd = congestion::initial_cwnd(pcb.snd_mss);
                debug!("tcp: {} SYN_RCVD -> ESTABLISHED", tuple);
            }
            AckOutcome::Other
        } else if seq_gt(seg.ack, pcb.snd_nxt) {
            AckOutcome::AcksUnsent
        } else if seq_gt(seg.ack, pcb.snd_una) {
            let acked = seg.ack.wrapping_sub(pcb.snd_una);
            let was_fin_sent = pcb.fin_sent;
            let fin_seq = pcb.snd_nxt;
            pcb.snd_una = seg.ack;
            let consumed = (acked as usize).min(pcb.send_buf.len());
            pcb.send_buf.consume(consumed);
            pcb.retransmit_deadline = None;
            congestion::on_new_ack(pcb, acked);
            let fin_just_acked = was_fin_sent && !pcb.fin_acked && seg.ack == fin_seq;
            if fin_just_acked {
                pcb.fin_acked = true;
            }
            complete_rtt_probe(pcb, seg.ack, now_ms);
            update_send_window(pcb, seg);
            AckOutcome::NewDataAcked { consumed, fin_just_acked }
        } else if seg.ack == pcb.snd_una && seg.payload.is_empty() && !seg.flags.contains(Flags::FIN) {
            let force_retransmit = congestion::on_duplicate_ack(pcb);
            update_send_window(pcb, seg);
            AckOutcome::DuplicateAck { force_retransmit }
        } else {
            update_send_window(pcb, seg);
            AckOutcome::Other
        }
    };

    match outcome {
        AckOutcome::AcksUnsent => {
            if let Some(pcb) = engine.pcbs.get(id) {
                out.push(build_outgoing(tuple, pcb.snd_nxt, pcb.rcv_nxt, Flags::ACK, pcb.rcv_wnd as u16, &[]));
            }
        }
        AckOutcome::NewDataAcked { consumed, fin_just_acked } => {
            if consumed > 0 {
                invoke_handler(engine, id, move |h, conn| h.data_sent(conn, consumed));
            }
            // A partial ACK during fast recovery (§4.8): `on_new_ack` left
            // `in_fast_recovery` set rather than exiting it, so retransmit
            // the next unacked segment right away instead of waiting out a
            // full RTO.
            if engine.pcbs.get(id).is_some_and(|pcb| pcb.in_fast_recovery) {
                if let Some(seg) = output::retransmit(engine, id, now_ms) {
                    out.push(seg);
                }
            }
            if fin_just_acked {
                advance_after_fin_acked(engine, id, tuple, now_ms);
            }
        }
        AckOutcome::DuplicateAck { force_retransmit } => {
            if force_retransmit {
                debug!("tcp: {} fast retransmit triggered", tuple);
                if let Some(pcb) = engine.pcbs.get_mut(id) {
                    pcb.retransmit_deadline = Some(now_ms);
                }
            }
        }
        AckOutcome::Other => {}
    }
}

/// Completes a Karn's-algorithm RTT probe (§4.8) if this ack covers the
/// segment it was armed on. A probe surviving untouched to here is by
/// construction unambiguous: `retransmit` clears it the moment the probed
/// segment is resent, so any ack that still confirms it timed exactly one
/// transmission.
fn complete_rtt_probe(pcb: &mut Pcb, ack: u32, now_ms: u64) {
    let Some(probe_seq) = pcb.rtt_probe_seq else { return };
    if !congestion::seq_ge(ack, probe_seq) {
        return;
    }
    if let Some(started_ms) = pcb.rtt_probe_started_ms {
        let sample_ms = now_ms.saturating_sub(started_ms).min(u32::MAX as u64) as u32;
        congestion::sample_rtt(pcb, sample_ms);
    }
    pcb.rtt_probe_seq = None;
    pcb.rtt_probe_started_ms = None;
}

/// RFC 793's window-update rule: accept a new `snd.wnd` only from a
/// segment newer than the one that set it last.
fn update_send_window(pcb: &mut Pcb, seg: &Segment<'_>) {
    if seq_gt(seg.seq, pcb.snd_wl1) || (seg.seq == pcb.snd_wl1 && seq_le(pcb.snd_wl2, seg.ack)) {
        pcb.snd_wnd = seg.window as u32;
        pcb.snd_wl1 = seg.seq;
        pcb.snd_wl2 = seg.ack;
    }
}

fn advance_after_fin_acked(engine: &mut TcpEngine, id: PcbId, tuple: FourTuple, now_ms: u64) {
    let Some(pcb) = engine.pcbs.get_mut(id) else { return };
    match pcb.state {
        State::FinWait1 => {
            pcb.state = State::FinWait2;
            debug!("tcp: {} FIN_WAIT_1 -> FIN_WAIT_2", tuple);
        }
        State::Closing => {
            pcb.state = State::TimeWait;
            pcb.time_wait_deadline = Some(now_ms + TIME_WAIT_MS);
            debug!("tcp: {} CLOSING -> TIME_WAIT", tuple);
        }
        State::LastAck => {
            debug!("tcp: {} LAST_ACK -> CLOSED", tuple);
            finish_close(engine, id, None);
        }
        _ => {}
    }
}

fn process_data(engine: &mut TcpEngine, id: PcbId, tuple: FourTuple, seg: &Segment<'_>, now_ms: u64, out: &mut Vec<OutgoingSegment>) {
    let delivered = {
        let Some(pcb) = engine.pcbs.get_mut(id) else { return };
        if !matches!(pcb.state, State::Established | State::FinWait1 | State::FinWait2) {
            return; // peer has no business sending data once we're past CLOSE_WAIT-adjacent states
        }

        let mut delivered = 0usize;
        if seg.seq == pcb.rcv_nxt {
            let n = seg.payload.len().min(pcb.recv_buf.free_space());
            pcb.recv_buf.write(&seg.payload[..n]);
            pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(n as u32);
            delivered = n;

            // Drain any out-of-order runs that now connect.
            loop {
                let Some(pos) = pcb.ooo.iter().position(|(seq, _)| *seq == pcb.rcv_nxt) else { break };
                let (_, bytes) = pcb.ooo.remove(pos);
                let n = bytes.len().min(pcb.recv_buf.free_space());
                pcb.recv_buf.write(&bytes[..n]);
                pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(n as u32);
                delivered += n;
                if n < bytes.len() {
                    break; // receive buffer is full; stop draining
                }
            }
        } else {
            let offset = seg.seq.wrapping_sub(pcb.rcv_nxt);
            if offset < pcb.rcv_wnd && pcb.ooo.len() < MAX_OOO_SEGMENTS {
                trace!("tcp: {} buffering out-of-sequence segment at {}", tuple, seg.seq);
                pcb.ooo.push((seg.seq, seg.payload.to_vec()));
            }
        }
        pcb.rcv_wnd = pcb.recv_buf.free_space() as u32;
        delivered
    };

    if delivered > 0 {
        invoke_handler(engine, id, move |h, conn| h.data_received(conn, delivered));
    }

    let Some(pcb) = engine.pcbs.get_mut(id) else { return };
    pcb.delayed_ack_segments += 1;
    if pcb.delayed_ack_segments >= DELAYED_ACK_SEGMENTS {
        pcb.delayed_ack_segments = 0;
        pcb.delayed_ack_deadline = None;
        out.push(build_outgoing(tuple, pcb.snd_nxt, pcb.rcv_nxt, Flags::ACK, pcb.rcv_wnd as u16, &[]));
    } else if pcb.delayed_ack_deadline.is_none() {
        pcb.delayed_ack_deadline = Some(now_ms + crate::tcp::DELAYED_ACK_MS);
    }
}

fn process_fin(engine: &mut TcpEngine, id: PcbId, tuple: FourTuple, now_ms: u64, out: &mut Vec<OutgoingSegment>) {
    let ack = {
        let Some(pcb) = engine.pcbs.get_mut(id) else { return };
        if !matches!(
            pcb.state,
            State::Established | State::FinWait1 | State::FinWait2 | State::SynRcvd
        ) {
            return; // already processed (or peer FIN retransmitted into CLOSE_WAIT/LAST_ACK)
        }

        pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(1);
        let next_state = match pcb.state {
            State::Established | State::SynRcvd => State::CloseWait,
            State::FinWait1 if pcb.fin_acked => State::TimeWait,
            State::FinWait1 => State::Closing,
            State::FinWait2 => State::TimeWait,
            other => other,
        };
        pcb.state = next_state;
        if next_state == State::TimeWait {
            pcb.time_wait_deadline = Some(now_ms + TIME_WAIT_MS);
        }
        debug!("tcp: {} received FIN, -> {:?}", tuple, next_state);
        build_outgoing(tuple, pcb.snd_nxt, pcb.rcv_nxt, Flags::ACK, pcb.rcv_wnd as u16, &[])
    };

    out.push(ack);
    invoke_handler(engine, id, |h, conn| h.data_received(conn, 0));
}

/// Tears a PCB down outside of the graceful close sequence: fires
/// `connection_aborted` and returns the slot to the unreferenced list.
pub(crate) fn abort(engine: &mut TcpEngine, id: PcbId, cause: Option<StackError>) {
    invoke_handler(engine, id, move |h, conn| h.connection_aborted(conn, cause));
    if let Some(pcb) = engine.pcbs.get_mut(id) {
        pcb.state = State::Closed;
    }
    engine.pcbs.release(id);
}

/// A graceful close finished (LAST_ACK's final ACK arrived, or TIME_WAIT
/// expired): no error, just `connection_aborted(None)` per §4.7's note
/// that abort transitions notify before release — a plain close is
/// modeled the same way so application code has one teardown callback.
pub(crate) fn finish_close(engine: &mut TcpEngine, id: PcbId, cause: Option<StackError>) {
    invoke_handler(engine, id, move |h, conn| h.connection_aborted(conn, cause));
    if let Some(pcb) = engine.pcbs.get_mut(id) {
        pcb.state = State::Closed;
    }
    engine.pcbs.release(id);
}

fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

fn seq_le(a: u32, b: u32) -> bool {
    !seq_gt(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::connect::{TcpEngineConfig, TcpHandler};
    use crate::tcp::pcb::IndexImpl;
    use rand_chacha::rand_core::SeedableRng;

    struct Recorder(Vec<String>);
    impl TcpHandler for Recorder {
        fn connection_established(&mut self, _conn: crate::tcp::connect::ConnId) {
            self.0.push("established".into());
        }
        fn data_received(&mut self, _conn: crate::tcp::connect::ConnId, len: usize) {
            self.0.push(format!("data_received({})", len));
        }
    }

    fn engine() -> TcpEngine {
        TcpEngine::new(
            4,
            IndexImpl::default(),
            rand_chacha::ChaCha12Rng::seed_from_u64(1),
            TcpEngineConfig {
                send_capacity: 4096,
                recv_capacity: 4096,
                default_mss: 1460,
                window_scale: 0,
                listen_backlog: 4,
            },
        )
    }

    #[test]
    fn three_way_handshake_completes_passive_open() {
        let mut eng = engine();
        eng.listen(80, 2).unwrap();
        let local = Ipv4Addr::new(10, 0, 0, 1);
        let remote = Ipv4Addr::new(10, 0, 0, 2);

        let syn = Segment {
            src_port: 4000,
            dst_port: 80,
            seq: 100,
            ack: 0,
            flags: Flags::SYN,
            window: 65535,
            options: Default::default(),
            payload: &[],
        };
        let out = receive(&mut eng, 0, remote, local, &syn);
        assert_eq!(out.len(), 1);
        let synack = crate::tcp::parse(&out[0].bytes).unwrap();
        assert!(synack.flags.contains(Flags::SYN | Flags::ACK));
        assert_eq!(synack.ack, 101);

        let tuple = FourTuple::new(local, 80, remote, 4000);
        let id = eng.pcbs.lookup(tuple).unwrap();
        let iss = eng.pcbs.get(id).unwrap().iss;

        let handler = Box::new(Recorder(Vec::new()));
        let ack = Segment {
            src_port: 4000,
            dst_port: 80,
            seq: 101,
            ack: iss.wrapping_add(1),
            flags: Flags::ACK,
            window: 65535,
            options: Default::default(),
            payload: &[],
        };
        let out = receive(&mut eng, 1, remote, local, &ack);
        assert!(out.is_empty());
        assert_eq!(eng.pcbs.get(id).unwrap().state, State::Established);

        let listener_id = eng.listeners[0].id();
        let conn = eng.accept(listener_id, handler).unwrap();
        assert_eq!(conn.id, id);
    }

    #[test]
    fn listener_at_capacity_drops_third_syn() {
        let mut eng = engine();
        eng.listen(80, 2).unwrap();
        let local = Ipv4Addr::new(10, 0, 0, 1);
        let remote = Ipv4Addr::new(10, 0, 0, 2);
        for i in 0..3u16 {
            let syn = Segment {
                src_port: 4000 + i,
                dst_port: 80,
                seq: 100,
                ack: 0,
                flags: Flags::SYN,
                window: 65535,
                options: Default::default(),
                payload: &[],
            };
            let out = receive(&mut eng, 0, remote, local, &syn);
            if i < 2 {
                assert_eq!(out.len(), 1, "syn {} should be accepted", i);
            } else {
                assert!(out.is_empty(), "third syn should be dropped");
            }
        }
    }

    #[test]
    fn an_ack_covering_the_probed_segment_feeds_the_rtt_estimator() {
        let mut eng = engine();
        let tuple = FourTuple::new(Ipv4Addr::new(10, 0, 0, 1), 1000, Ipv4Addr::new(10, 0, 0, 2), 80);
        let mut pcb = Pcb::new(tuple, 5000, MtuRef(0), 65535, 4096, 4096);
        pcb.state = State::Established;
        pcb.snd_mss = 1460;
        pcb.snd_wnd = 65535;
        pcb.snd_nxt = 5002;
        pcb.snd_una = 5000;
        pcb.rtt_probe_seq = Some(5002);
        pcb.rtt_probe_started_ms = Some(100);
        let id = eng.pcbs.allocate(tuple, pcb).unwrap();
        eng.pcbs.mark_referenced(id);

        let ack = Segment {
            src_port: 1000,
            dst_port: 80,
            seq: 1,
            ack: 5002,
            flags: Flags::ACK,
            window: 65535,
            options: Default::default(),
            payload: &[],
        };
        let mut out = Vec::new();
        process_ack(&mut eng, id, tuple, &ack, 140, &mut out);

        let pcb = eng.pcbs.get(id).unwrap();
        assert_eq!(pcb.rtt_probe_seq, None);
        assert_eq!(pcb.rtt_probe_started_ms, None);
        assert_eq!(pcb.srtt_ms, Some(40));
    }

    #[test]
    fn a_partial_ack_during_fast_recovery_retransmits_without_leaving_recovery() {
        let mut eng = engine();
        let tuple = FourTuple::new(Ipv4Addr::new(10, 0, 0, 1), 1000, Ipv4Addr::new(10, 0, 0, 2), 80);
        let mut pcb = Pcb::new(tuple, 5000, MtuRef(0), 65535, 8192, 8192);
        pcb.state = State::Established;
        pcb.snd_mss = 1460;
        pcb.snd_wnd = 65535;
        pcb.send_buf.write(&vec![0u8; 3000]);
        pcb.snd_una = 5000;
        pcb.snd_nxt = 8000; // 3000 bytes in flight
        pcb.in_fast_recovery = true;
        pcb.recover = 9000; // high-water mark not yet reached by this ack
        pcb.ssthresh = 4000;
        pcb.cwnd = 8000;
        let id = eng.pcbs.allocate(tuple, pcb).unwrap();
        eng.pcbs.mark_referenced(id);

        // Acks only the first 1000 of the 3000 in-flight bytes: a partial ack.
        let ack = Segment {
            src_port: 1000,
            dst_port: 80,
            seq: 1,
            ack: 6000,
            flags: Flags::ACK,
            window: 65535,
            options: Default::default(),
            payload: &[],
        };
        let mut out = Vec::new();
        process_ack(&mut eng, id, tuple, &ack, 0, &mut out);

        let pcb = eng.pcbs.get(id).unwrap();
        assert!(pcb.in_fast_recovery, "a partial ack stays in recovery until snd_una reaches `recover`");
        assert_eq!(pcb.snd_una, 6000);

        assert_eq!(out.len(), 1, "a partial ack must trigger an immediate retransmit, not wait for an RTO");
        let resent = crate::tcp::parse(&out[0].bytes).unwrap();
        assert_eq!(resent.seq, 6000, "retransmit resends from the new snd_una, not from snd_nxt");
    }

    #[test]
    fn no_match_gets_reset() {
        let mut eng = engine();
        let local = Ipv4Addr::new(10, 0, 0, 1);
        let remote = Ipv4Addr::new(10, 0, 0, 2);
        let ack_only = Segment {
            src_port: 4000,
            dst_port: 80,
            seq: 1,
            ack: 1,
            flags: Flags::ACK,
            window: 1024,
            options: Default::default(),
            payload: &[],
        };
        let out = receive(&mut eng, 0, remote, local, &ack_only);
        assert_eq!(out.len(), 1);
        let reset = crate::tcp::parse(&out[0].bytes).unwrap();
        assert!(reset.flags.contains(Flags::RST));
    }
}
