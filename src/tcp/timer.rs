//! Per-PCB timer bookkeeping driven by the event loop (§4.9).
//!
//! [`crate::Stack::poll`] calls [`run`] once per tick with the current
//! time; everything here is expiry checks against absolute `now_ms`
//! deadlines already armed by `input`/`output`, plus the one timer
//! (the retransmit deadline) that must stay armed for as long as there is
//! unacked data in flight — a new-ACK can clear it (`input::process_ack`)
//! without anything else getting a chance to rearm it before the next
//! tick otherwise.

use log::debug;

use crate::tcp::connect::{build_outgoing, OutgoingSegment, TcpEngine};
use crate::tcp::pcb::PcbId;
use crate::tcp::{congestion, input, output, Flags, State};

/// Drives every live PCB's timers forward by one tick. Returns whatever
/// retransmissions, probes, or delayed ACKs fell due.
pub fn run(engine: &mut TcpEngine, now_ms: u64) -> Vec<OutgoingSegment> {
    let ids: Vec<PcbId> = engine.pcbs.iter_ids().collect();
    let mut out = Vec::new();
    for id in ids {
        run_one(engine, id, now_ms, &mut out);
    }
    out
}

fn run_one(engine: &mut TcpEngine, id: PcbId, now_ms: u64, out: &mut Vec<OutgoingSegment>) {
    if rearm_retransmit_if_needed(engine, id, now_ms) {
        // fall through: the PCB may already be past its (just-armed) deadline
        // on a very slow tick, so still check it below.
    }

    let retransmit_due = engine.pcbs.get(id).map(|pcb| pcb.retransmit_deadline.is_some_and(|d| now_ms >= d)).unwrap_or(false);
    if retransmit_due {
        fire_retransmit(engine, id, now_ms, out);
    }

    let delayed_ack_due = engine.pcbs.get(id).map(|pcb| pcb.delayed_ack_deadline.is_some_and(|d| now_ms >= d)).unwrap_or(false);
    if delayed_ack_due {
        fire_delayed_ack(engine, id, out);
    }

    let persist_due = engine.pcbs.get(id).map(|pcb| pcb.snd_wnd == 0 && pcb.persist_deadline.is_some_and(|d| now_ms >= d)).unwrap_or(false);
    if persist_due {
        fire_persist(engine, id, now_ms, out);
    }

    let time_wait_done = engine.pcbs.get(id).map(|pcb| pcb.time_wait_deadline.is_some_and(|d| now_ms >= d)).unwrap_or(false);
    if time_wait_done {
        debug!("tcp: {} TIME_WAIT expired", engine.pcbs.get(id).unwrap().tuple);
        input::finish_close(engine, id, None);
    }
}

/// Keeps the invariant "unacked data in flight implies an armed retransmit
/// deadline" even across a partial ACK that only clears, but doesn't
/// replace, the timer (`input::process_ack`'s `NewDataAcked` path).
fn rearm_retransmit_if_needed(engine: &mut TcpEngine, id: PcbId, now_ms: u64) -> bool {
    let Some(pcb) = engine.pcbs.get_mut(id) else { return false };
    if pcb.retransmit_deadline.is_none() && (pcb.in_flight() > 0 || (pcb.fin_sent && !pcb.fin_acked)) {
        pcb.retransmit_deadline = Some(now_ms + congestion::current_rto_ms(pcb));
        return true;
    }
    false
}

fn fire_retransmit(engine: &mut TcpEngine, id: PcbId, now_ms: u64, out: &mut Vec<OutgoingSegment>) {
    let Some(pcb) = engine.pcbs.get_mut(id) else { return };
    if matches!(pcb.state, State::TimeWait | State::Closed) {
        pcb.retransmit_deadline = None;
        return;
    }
    congestion::on_rto(pcb);
    debug!("tcp: {} retransmit timer fired (backoff={})", pcb.tuple, pcb.rto_backoff);
    if let Some(seg) = output::retransmit(engine, id, now_ms) {
        out.push(seg);
    }
}

fn fire_delayed_ack(engine: &mut TcpEngine, id: PcbId, out: &mut Vec<OutgoingSegment>) {
    let Some(pcb) = engine.pcbs.get_mut(id) else { return };
    pcb.delayed_ack_deadline = None;
    pcb.delayed_ack_segments = 0;
    let tuple = pcb.tuple;
    let seq = pcb.snd_nxt;
    let ack = pcb.rcv_nxt;
    let rwnd = pcb.rcv_wnd as u16;
    out.push(build_outgoing(tuple, seq, ack, Flags::ACK, rwnd, &[]));
}

fn fire_persist(engine: &mut TcpEngine, id: PcbId, now_ms: u64, out: &mut Vec<OutgoingSegment>) {
    if let Some(seg) = output::zero_window_probe(engine, id) {
        out.push(seg);
    }
    if let Some(pcb) = engine.pcbs.get_mut(id) {
        pcb.rto_backoff = pcb.rto_backoff.saturating_add(1).min(6);
        pcb.persist_deadline = Some(now_ms + (congestion::current_rto_ms(pcb)));
    }
}
