//! Outbound segmentation, Nagle, zero-window probing, and retransmission
//! (§4.8, §4.9).

use log::{debug, trace};

use crate::tcp::congestion;
use crate::tcp::connect::{build_outgoing, OutgoingSegment, TcpEngine};
use crate::tcp::pcb::{Pcb, PcbId};
use crate::tcp::{Flags, State};

/// Walks every live PCB once, building whatever new data/FIN segments are
/// due to go out this pass. Segmentation respects cwnd, the receiver's
/// window, and a simple Nagle rule: don't trickle out sub-MSS segments
/// while earlier data is still unacked, unless there's nothing left to
/// coalesce with (the buffer is fully drained, or the application closed
/// the send side).
pub fn send_pending(engine: &mut TcpEngine, now_ms: u64) -> Vec<OutgoingSegment> {
    let ids: Vec<PcbId> = engine.pcbs.iter_ids().collect();
    let mut out = Vec::new();
    for id in ids {
        if let Some(seg) = build_segment_for(engine, id, now_ms) {
            out.push(seg);
        }
    }
    out
}

fn build_segment_for(engine: &mut TcpEngine, id: PcbId, now_ms: u64) -> Option<OutgoingSegment> {
    let pcb = engine.pcbs.get_mut(id)?;
    if !matches!(pcb.state, State::Established | State::CloseWait) {
        return None;
    }

    let in_flight = pcb.in_flight() as usize;
    let total_readable = pcb.send_buf.len();
    let unsent = total_readable.saturating_sub(in_flight);
    let window = (pcb.effective_window() as usize).saturating_sub(in_flight);
    let nagle_clear = in_flight == 0 || unsent >= pcb.snd_mss as usize || pcb.send_closed || pcb.push_requested;

    if unsent > 0 && nagle_clear && window > 0 {
        let len = unsent.min(window).min(pcb.snd_mss as usize);
        if len > 0 {
            let chain = pcb.send_buf.readable_chain(total_readable).sub_from_to(in_flight, len);
            let payload = chain.to_vec();
            let tuple = pcb.tuple;
            let seq = pcb.snd_nxt;
            let ack = pcb.rcv_nxt;
            let rwnd = pcb.rcv_wnd as u16;
            pcb.snd_nxt = pcb.snd_nxt.wrapping_add(len as u32);
            // A push flushes everything currently queued in one segment
            // (bounded by MSS/window like any other send), so the request
            // is satisfied once this segment covers the whole backlog.
            if len >= unsent {
                pcb.push_requested = false;
            }
            arm_rtt_probe(pcb, seq.wrapping_add(len as u32), now_ms);
            arm_retransmit_timer(pcb, now_ms);
            trace!("tcp: {} sending {} bytes at seq {}", tuple, len, seq);
            return Some(build_outgoing(tuple, seq, ack, Flags::ACK | Flags::PSH, rwnd, &payload));
        }
    }

    if pcb.send_closed && !pcb.fin_sent && unsent == 0 && in_flight == 0 {
        return Some(send_fin(pcb, now_ms));
    }

    None
}

fn send_fin(pcb: &mut Pcb, now_ms: u64) -> OutgoingSegment {
    let seq = pcb.snd_nxt;
    pcb.snd_nxt = pcb.snd_nxt.wrapping_add(1);
    pcb.fin_sent = true;
    pcb.state = match pcb.state {
        State::Established => State::FinWait1,
        State::CloseWait => State::LastAck,
        other => other,
    };
    arm_retransmit_timer(pcb, now_ms);
    debug!("tcp: {} sending FIN, -> {:?}", pcb.tuple, pcb.state);
    build_outgoing(pcb.tuple, seq, pcb.rcv_nxt, Flags::FIN | Flags::ACK, pcb.rcv_wnd as u16, &[])
}

fn arm_retransmit_timer(pcb: &mut Pcb, now_ms: u64) {
    if pcb.retransmit_deadline.is_none() {
        pcb.retransmit_deadline = Some(now_ms + congestion::current_rto_ms(pcb));
    }
}

/// Karn's algorithm (RFC 6298 §3): time at most one unambiguous segment at
/// a time, and never a retransmitted one. `probe_ack` is the `snd_nxt`
/// this segment advances to, i.e. the ack value that would confirm it.
fn arm_rtt_probe(pcb: &mut Pcb, probe_ack: u32, now_ms: u64) {
    if pcb.rtt_probe_seq.is_none() {
        pcb.rtt_probe_seq = Some(probe_ack);
        pcb.rtt_probe_started_ms = Some(now_ms);
    }
}

/// Re-sends the oldest unacked segment after an RTO or a fast-retransmit
/// trigger (§4.8): the whole in-flight window collapses back to one
/// segment, resent from `snd_una` rather than `snd_nxt`.
pub(crate) fn retransmit(engine: &mut TcpEngine, id: PcbId, now_ms: u64) -> Option<OutgoingSegment> {
    let pcb = engine.pcbs.get_mut(id)?;
    // Karn's algorithm: a retransmit makes any outstanding RTT probe
    // ambiguous (we can no longer tell which transmission an ack answers).
    pcb.rtt_probe_seq = None;
    pcb.rtt_probe_started_ms = None;
    let in_flight = pcb.in_flight() as usize;
    if in_flight == 0 {
        return if pcb.fin_sent && !pcb.fin_acked {
            let tuple = pcb.tuple;
            let ack = pcb.rcv_nxt;
            let rwnd = pcb.rcv_wnd as u16;
            let seq = pcb.snd_una;
            pcb.retransmit_deadline = Some(now_ms + congestion::current_rto_ms(pcb));
            Some(build_outgoing(tuple, seq, ack, Flags::FIN | Flags::ACK, rwnd, &[]))
        } else {
            None
        };
    }

    let len = in_flight.min(pcb.snd_mss as usize).min(pcb.send_buf.len());
    let tuple = pcb.tuple;
    let seq = pcb.snd_una;
    let ack = pcb.rcv_nxt;
    let rwnd = pcb.rcv_wnd as u16;
    let chain = pcb.send_buf.readable_chain(len);
    let payload = chain.to_vec();
    pcb.retransmit_deadline = Some(now_ms + congestion::current_rto_ms(pcb));
    debug!("tcp: {} retransmitting {} bytes from seq {}", tuple, len, seq);
    Some(build_outgoing(tuple, seq, ack, Flags::ACK | Flags::PSH, rwnd, &payload))
}

/// Sends a 1-byte probe into a zero window (§4.9 persist timer), to learn
/// when the receiver's window opens back up without waiting for a
/// spontaneous window-update ACK.
pub(crate) fn zero_window_probe(engine: &mut TcpEngine, id: PcbId) -> Option<OutgoingSegment> {
    let pcb = engine.pcbs.get_mut(id)?;
    if pcb.snd_wnd != 0 {
        return None;
    }
    let in_flight = pcb.in_flight() as usize;
    let total_readable = pcb.send_buf.len();
    if total_readable <= in_flight {
        return None;
    }
    let tuple = pcb.tuple;
    let seq = pcb.snd_nxt;
    let ack = pcb.rcv_nxt;
    let rwnd = pcb.rcv_wnd as u16;
    let chain = pcb.send_buf.readable_chain(total_readable).sub_from_to(in_flight, 1);
    let payload = chain.to_vec();
    debug!("tcp: {} zero-window probe at seq {}", tuple, seq);
    Some(build_outgoing(tuple, seq, ack, Flags::ACK, rwnd, &payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::pmtu::MtuRef;
    use crate::tcp::connect::TcpEngineConfig;
    use crate::tcp::pcb::IndexImpl;
    use crate::types::{FourTuple, Ipv4Addr};
    use rand_chacha::rand_core::SeedableRng;

    fn engine_with_one_established() -> (TcpEngine, PcbId, FourTuple) {
        let mut eng = TcpEngine::new(
            4,
            IndexImpl::default(),
            rand_chacha::ChaCha12Rng::seed_from_u64(7),
            TcpEngineConfig {
                send_capacity: 4096,
                recv_capacity: 4096,
                default_mss: 1460,
                window_scale: 0,
                listen_backlog: 4,
            },
        );
        let tuple = FourTuple::new(Ipv4Addr::new(10, 0, 0, 1), 1000, Ipv4Addr::new(10, 0, 0, 2), 80);
        let mut pcb = Pcb::new(tuple, 5000, MtuRef(0), 65535, 4096, 4096);
        pcb.state = State::Established;
        pcb.snd_mss = 1460;
        pcb.snd_wnd = 65535;
        pcb.cwnd = congestion::initial_cwnd(1460);
        pcb.snd_nxt = 5000;
        pcb.snd_una = 5000;
        let id = eng.pcbs.allocate(tuple, pcb).unwrap();
        eng.pcbs.mark_referenced(id);
        (eng, id, tuple)
    }

    #[test]
    fn small_write_flushes_immediately_with_no_data_outstanding() {
        let (mut eng, id, _tuple) = engine_with_one_established();
        eng.pcbs.get_mut(id).unwrap().send_buf.write(b"hi");
        let out = send_pending(&mut eng, 0);
        assert_eq!(out.len(), 1);
        let seg = crate::tcp::parse(&out[0].bytes).unwrap();
        assert_eq!(seg.payload, b"hi");
        assert_eq!(eng.pcbs.get(id).unwrap().snd_nxt, 5002);
    }

    #[test]
    fn second_small_write_withheld_by_nagle_until_first_is_acked() {
        let (mut eng, id, _tuple) = engine_with_one_established();
        eng.pcbs.get_mut(id).unwrap().send_buf.write(b"hi");
        let first = send_pending(&mut eng, 0);
        assert_eq!(first.len(), 1);

        eng.pcbs.get_mut(id).unwrap().send_buf.write(b"!");
        let second = send_pending(&mut eng, 0);
        assert!(second.is_empty(), "nagle should withhold a sub-MSS segment while earlier data is unacked");
    }

    #[test]
    fn send_push_overrides_nagle_for_a_withheld_segment() {
        let (mut eng, id, tuple) = engine_with_one_established();
        eng.pcbs.get_mut(id).unwrap().send_buf.write(b"hi");
        let first = send_pending(&mut eng, 0);
        assert_eq!(first.len(), 1);

        eng.pcbs.get_mut(id).unwrap().send_buf.write(b"!");
        assert!(send_pending(&mut eng, 0).is_empty(), "withheld without a push request");

        eng.send_push(crate::tcp::connect::ConnId { id, generation: eng.pcbs.generation_of(id).unwrap() });
        let pushed = send_pending(&mut eng, 0);
        assert_eq!(pushed.len(), 1, "push should flush the withheld byte immediately");
        let seg = crate::tcp::parse(&pushed[0].bytes).unwrap();
        assert_eq!(seg.payload, b"!");
        assert!(!eng.pcbs.get(id).unwrap().push_requested, "push is satisfied once the backlog is fully flushed");
        let _ = tuple;
    }

    #[test]
    fn sending_new_data_arms_an_rtt_probe_on_the_first_unacked_byte() {
        let (mut eng, id, _tuple) = engine_with_one_established();
        eng.pcbs.get_mut(id).unwrap().send_buf.write(b"hi");
        let out = send_pending(&mut eng, 10);
        assert_eq!(out.len(), 1);
        let pcb = eng.pcbs.get(id).unwrap();
        assert_eq!(pcb.rtt_probe_seq, Some(5002));
        assert_eq!(pcb.rtt_probe_started_ms, Some(10));
    }

    #[test]
    fn a_second_write_while_a_probe_is_outstanding_does_not_rearm_it() {
        let (mut eng, id, _tuple) = engine_with_one_established();
        eng.pcbs.get_mut(id).unwrap().send_buf.write(b"hi");
        send_pending(&mut eng, 10);
        eng.pcbs.get_mut(id).unwrap().snd_wnd = 65535;
        eng.pcbs.get_mut(id).unwrap().cwnd = 65535;
        eng.pcbs.get_mut(id).unwrap().send_buf.write(&[b'!'; 2000]);
        send_pending(&mut eng, 20);
        let pcb = eng.pcbs.get(id).unwrap();
        assert_eq!(pcb.rtt_probe_started_ms, Some(10), "probe armed by the first send should not be replaced");
    }

    #[test]
    fn retransmitting_the_probed_segment_clears_it() {
        let (mut eng, id, _tuple) = engine_with_one_established();
        eng.pcbs.get_mut(id).unwrap().send_buf.write(b"hi");
        send_pending(&mut eng, 10);
        assert!(eng.pcbs.get(id).unwrap().rtt_probe_seq.is_some());
        retransmit(&mut eng, id, 1_010);
        assert_eq!(eng.pcbs.get(id).unwrap().rtt_probe_seq, None);
        assert_eq!(eng.pcbs.get(id).unwrap().rtt_probe_started_ms, None);
    }

    #[test]
    fn close_sending_emits_fin_once_buffer_drains() {
        let (mut eng, id, _tuple) = engine_with_one_established();
        eng.close_sending(crate::tcp::connect::ConnId {
            id,
            generation: eng.pcbs.generation_of(id).unwrap(),
        });
        let out = send_pending(&mut eng, 0);
        assert_eq!(out.len(), 1);
        let seg = crate::tcp::parse(&out[0].bytes).unwrap();
        assert!(seg.flags.contains(Flags::FIN));
        assert_eq!(eng.pcbs.get(id).unwrap().state, State::FinWait1);
    }
}
