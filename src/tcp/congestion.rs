//! Congestion control and loss recovery (§4.8): slow start, congestion
//! avoidance, fast retransmit/recovery, RTO backoff, RTT estimation.

use log::debug;

use crate::tcp::pcb::Pcb;

/// Initial cwnd per RFC 5681 as restated in §4.8:
/// `min(4*MSS, max(2*MSS, 4380))`.
pub fn initial_cwnd(mss: u16) -> u32 {
    let mss = mss as u32;
    (4 * mss).min((2 * mss).max(4380))
}

/// Called when new data is acked (snd.una advanced). `acked` is the
/// number of newly-acknowledged bytes.
pub fn on_new_ack(pcb: &mut Pcb, acked: u32) {
    if pcb.in_fast_recovery {
        if seq_ge(pcb.snd_una, pcb.recover) {
            // Full recovery: snd.una has crossed the high-water mark.
            pcb.in_fast_recovery = false;
            pcb.dup_acks = 0;
            pcb.cwnd = pcb.ssthresh.max(pcb.snd_mss as u32);
            debug!("tcp: {} exits fast recovery", pcb.tuple);
        } else {
            // Partial ACK: stays in recovery. The caller (`process_ack` in
            // `tcp/input.rs`) sees `in_fast_recovery` still set afterward
            // and retransmits the next unacked segment immediately.
            return;
        }
    }

    pcb.dup_acks = 0;
    let mss = pcb.snd_mss as u32;
    if pcb.cwnd < pcb.ssthresh {
        pcb.cwnd += acked.min(mss);
    } else {
        pcb.cwnd_acked += acked;
        if pcb.cwnd_acked >= pcb.cwnd {
            pcb.cwnd_acked -= pcb.cwnd;
            pcb.cwnd += mss;
        }
    }
}

/// Called on each duplicate ACK. Returns `true` the moment fast retransmit
/// should fire (the third duplicate).
pub fn on_duplicate_ack(pcb: &mut Pcb) -> bool {
    if pcb.in_fast_recovery {
        pcb.cwnd += pcb.snd_mss as u32;
        return false;
    }
    pcb.dup_acks += 1;
    if pcb.dup_acks == 3 {
        enter_fast_recovery(pcb);
        true
    } else {
        false
    }
}

fn enter_fast_recovery(pcb: &mut Pcb) {
    let mss = pcb.snd_mss as u32;
    let in_flight = pcb.in_flight();
    pcb.ssthresh = (in_flight / 2).max(2 * mss);
    pcb.cwnd = pcb.ssthresh + 3 * mss;
    pcb.recover = pcb.snd_nxt;
    pcb.in_fast_recovery = true;
    debug!(
        "tcp: {} fast retransmit, ssthresh={} cwnd={}",
        pcb.tuple, pcb.ssthresh, pcb.cwnd
    );
}

/// Called on RTO expiry (§4.8): reset to slow start, double the backoff.
pub fn on_rto(pcb: &mut Pcb) {
    let mss = pcb.snd_mss as u32;
    let in_flight = pcb.in_flight();
    pcb.ssthresh = (in_flight / 2).max(2 * mss);
    pcb.cwnd = mss;
    pcb.cwnd_acked = 0;
    pcb.recover = pcb.snd_nxt;
    pcb.in_fast_recovery = false;
    pcb.dup_acks = 0;
    pcb.rto_backoff = (pcb.rto_backoff + 1).min(6); // cap backoff at 64x
    debug!("tcp: {} RTO fired, backoff={}", pcb.tuple, pcb.rto_backoff);
}

pub fn current_rto_ms(pcb: &Pcb) -> u64 {
    (pcb.rto_ms as u64) << pcb.rto_backoff.min(6)
}

pub const MAX_RTO_MS: u64 = 60_000;

/// Folds one RTT sample (milliseconds) into the Jacobson/Karels estimator.
pub fn sample_rtt(pcb: &mut Pcb, sample_ms: u32) {
    match pcb.srtt_ms {
        None => {
            pcb.srtt_ms = Some(sample_ms);
            pcb.rttvar_ms = sample_ms / 2;
        }
        Some(srtt) => {
            let err = sample_ms as i64 - srtt as i64;
            let new_srtt = (srtt as i64 + err / 8).max(0) as u32;
            let new_var = (pcb.rttvar_ms as i64 + (err.abs() - pcb.rttvar_ms as i64) / 4).max(0) as u32;
            pcb.srtt_ms = Some(new_srtt);
            pcb.rttvar_ms = new_var;
        }
    }
    let srtt = pcb.srtt_ms.unwrap_or(sample_ms) as u64;
    pcb.rto_ms = (1_000u64.max(srtt + 4 * pcb.rttvar_ms as u64)).min(MAX_RTO_MS) as u32;
    pcb.rto_backoff = 0;
}

pub(crate) fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::pmtu::MtuRef;
    use crate::types::{FourTuple, Ipv4Addr};

    fn test_pcb() -> Pcb {
        let tuple = FourTuple::new(Ipv4Addr::new(10, 0, 0, 1), 1000, Ipv4Addr::new(10, 0, 0, 2), 80);
        let mut pcb = Pcb::new(tuple, 1000, MtuRef(0), 65535, 65535, 65535);
        pcb.snd_mss = 1460;
        pcb.cwnd = initial_cwnd(1460);
        pcb.ssthresh = u32::MAX >> 2;
        pcb.snd_nxt = 1000u32.wrapping_add(3000);
        pcb
    }

    #[test]
    fn third_duplicate_ack_triggers_fast_retransmit() {
        let mut pcb = test_pcb();
        assert!(!on_duplicate_ack(&mut pcb));
        assert!(!on_duplicate_ack(&mut pcb));
        assert!(on_duplicate_ack(&mut pcb));
        assert!(pcb.in_fast_recovery);
        assert_eq!(pcb.cwnd, pcb.ssthresh + 3 * 1460);
    }

    #[test]
    fn rto_resets_to_one_segment_and_backs_off() {
        let mut pcb = test_pcb();
        on_rto(&mut pcb);
        assert_eq!(pcb.cwnd, 1460);
        assert_eq!(pcb.rto_backoff, 1);
        assert_eq!(current_rto_ms(&pcb), 2_000);
    }

    #[test]
    fn slow_start_increases_cwnd_by_full_segment() {
        let mut pcb = test_pcb();
        pcb.cwnd = 1460;
        pcb.ssthresh = 100_000;
        pcb.snd_una = pcb.iss;
        on_new_ack(&mut pcb, 1460);
        assert_eq!(pcb.cwnd, 2920);
    }
}
