//! An in-process medium connecting two or more stacks by copying frames
//! between queues — no root, no TAP device, safe to run under `cargo
//! test` (§4.12). Each [`SimMedium`] handle is one end of a shared
//! broadcast segment; every other handle on the same segment receives a
//! copy of whatever is sent, the way a hub (not a switch) would.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::Result;
use crate::platform::{L2Driver, LinkState};

struct Segment {
    /// One inbound queue per attached handle, indexed by handle id.
    queues: Vec<RefCell<VecDeque<Vec<u8>>>>,
}

/// One interface's connection to a [`Segment`]. Cloning a `SimMedium`
/// does not attach a new handle — use [`SimMedium::new_segment`] /
/// [`SimMedium::attach`] to wire up additional interfaces.
pub struct SimMedium {
    segment: Rc<Segment>,
    self_id: usize,
    link_up: bool,
}

impl SimMedium {
    /// Creates a two-party segment (the common point-to-point case) and
    /// returns each side's handle.
    pub fn new_pair() -> (SimMedium, SimMedium) {
        let segment = Rc::new(Segment {
            queues: vec![RefCell::new(VecDeque::new()), RefCell::new(VecDeque::new())],
        });
        (
            SimMedium { segment: segment.clone(), self_id: 0, link_up: true },
            SimMedium { segment, self_id: 1, link_up: true },
        )
    }

    /// Creates an empty `n`-party segment; every handle sees every other
    /// handle's frames (broadcast medium), matching real Ethernet.
    pub fn new_segment(n: usize) -> Vec<SimMedium> {
        let segment = Rc::new(Segment {
            queues: (0..n).map(|_| RefCell::new(VecDeque::new())).collect(),
        });
        (0..n)
            .map(|id| SimMedium { segment: segment.clone(), self_id: id, link_up: true })
            .collect()
    }

    /// Pops the next frame addressed to this handle, if any. The driving
    /// event loop calls this each tick and feeds anything returned to
    /// `Stack::receive_frame`.
    pub fn poll_receive(&mut self) -> Option<Vec<u8>> {
        self.segment.queues[self.self_id].borrow_mut().pop_front()
    }

    pub fn set_link_up(&mut self, up: bool) {
        self.link_up = up;
    }
}

impl L2Driver for SimMedium {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        for (id, queue) in self.segment.queues.iter().enumerate() {
            if id != self.self_id {
                queue.borrow_mut().push_back(frame.to_vec());
            }
        }
        Ok(())
    }

    fn link_state(&self) -> LinkState {
        if self.link_up { LinkState::Up } else { LinkState::Down }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_delivers_frame_to_the_other_side() {
        let (mut a, mut b) = SimMedium::new_pair();
        a.send_frame(b"hello").unwrap();
        assert_eq!(b.poll_receive(), Some(b"hello".to_vec()));
        assert_eq!(a.poll_receive(), None);
    }

    #[test]
    fn segment_broadcasts_to_every_other_handle() {
        let mut handles = SimMedium::new_segment(3);
        handles[0].send_frame(b"x").unwrap();
        assert_eq!(handles[1].poll_receive(), Some(b"x".to_vec()));
        assert_eq!(handles[2].poll_receive(), Some(b"x".to_vec()));
        assert_eq!(handles[0].poll_receive(), None);
    }
}
