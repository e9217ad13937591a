//! Buffering and sequencing support for multicast item streams.
//!
//! A non-private item stream on a multicast-capable channel receives the
//! same logical stream twice: solicited traffic unicast to us, and the
//! shared broadcast stream. Both carry sequence numbers; this queue holds
//! messages that cannot be forwarded yet and answers the ordering questions
//! the stream engine asks while reconciling the two.

use std::collections::VecDeque;

use crate::rdm::messages::Msg;

/// Sequence numbers wrap; 0 is reserved for stream reset. Comparison is
/// done on the wrapped distance so ordering survives the wrap.
pub fn seq_compare(a: u32, b: u32) -> i32 {
  a.wrapping_sub(b) as i32
}

pub fn next_seq(n: u32) -> u32 {
  if n == u32::MAX {
    1
  } else {
    n + 1
  }
}

pub fn prev_seq(n: u32) -> u32 {
  if n == 1 {
    u32::MAX
  } else {
    n - 1
  }
}

/// A message parked in the reorder queue.
#[derive(Debug, Clone)]
pub struct BufferedMsg {
  pub msg: Msg,
  pub seq_num: u32,
  pub ft_group_id: Option<u8>,
  pub is_unicast: bool,
}

/// Per-stream FIFO of buffered messages, kept in arrival order.
#[derive(Debug, Default)]
pub struct ReorderQueue {
  queue: VecDeque<BufferedMsg>,
}

impl ReorderQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  pub fn len(&self) -> usize {
    self.queue.len()
  }

  pub fn push(&mut self, msg: BufferedMsg) {
    self.queue.push_back(msg);
  }

  pub fn pop(&mut self) -> Option<BufferedMsg> {
    self.queue.pop_front()
  }

  /// Pops the front message if its sequence number is at or before `seq`.
  pub fn pop_until(&mut self, seq: u32) -> Option<BufferedMsg> {
    if seq_compare(self.queue.front()?.seq_num, seq) <= 0 {
      self.queue.pop_front()
    } else {
      None
    }
  }

  /// Drops every buffered message with sequence number at or before `seq`.
  pub fn discard_until(&mut self, seq: u32) {
    self.queue.retain(|m| seq_compare(m.seq_num, seq) > 0);
  }

  pub fn discard_all(&mut self) {
    self.queue.clear();
  }

  pub fn has_unicast_msgs(&self) -> bool {
    self.queue.iter().any(|m| m.is_unicast)
  }

  /// Last buffered broadcast sequence number, if any.
  pub fn last_broadcast_seq(&self) -> Option<u32> {
    self
      .queue
      .iter()
      .filter(|m| !m.is_unicast)
      .next_back()
      .map(|m| m.seq_num)
  }

  /// Once the first unicast message anchors the sequence at `start`, clean
  /// stale buffered broadcast traffic and inspect what remains. Returns the
  /// last in-queue broadcast sequence number and whether the buffered run
  /// leaves a gap after `start`; None when nothing sequenced remains.
  pub fn anchor_broadcast_sequence(&mut self, start: u32) -> Option<(u32, bool)> {
    self.discard_until(start);

    let mut expected = next_seq(start);
    let mut has_gap = false;
    let mut last = None;
    for m in self.queue.iter().filter(|m| !m.is_unicast) {
      if seq_compare(m.seq_num, expected) != 0 {
        has_gap = true;
      }
      expected = next_seq(m.seq_num);
      last = Some(m.seq_num);
    }
    last.map(|l| (l, has_gap))
  }
}

#[cfg(test)]
mod tests {
  use test_case::test_case;

  use crate::rdm::{
    messages::{StatusMsg, UpdateMsg},
    DomainType, Payload, State,
  };

  use super::*;

  fn bc(seq: u32) -> BufferedMsg {
    BufferedMsg {
      msg: Msg::Update(UpdateMsg {
        stream_id: 0,
        domain: DomainType::MarketPrice,
        msg_key: None,
        payload: Payload::None,
      }),
      seq_num: seq,
      ft_group_id: None,
      is_unicast: false,
    }
  }

  fn uc(seq: u32) -> BufferedMsg {
    BufferedMsg {
      msg: Msg::Status(StatusMsg::new(3, DomainType::MarketPrice, State::open_ok())),
      seq_num: seq,
      ft_group_id: None,
      is_unicast: true,
    }
  }

  #[test_case(5, 4, 1; "simple greater")]
  #[test_case(4, 5, -1; "simple less")]
  #[test_case(1, u32::MAX, 2; "wraparound greater")]
  fn seq_compare_sign(a: u32, b: u32, sign: i32) {
    assert_eq!(seq_compare(a, b).signum(), sign.signum());
  }

  #[test]
  fn next_and_prev_skip_zero() {
    assert_eq!(next_seq(5), 6);
    assert_eq!(next_seq(u32::MAX), 1);
    assert_eq!(prev_seq(6), 5);
    assert_eq!(prev_seq(1), u32::MAX);
  }

  #[test]
  fn pop_until_respects_bound() {
    let mut q = ReorderQueue::new();
    q.push(bc(2));
    q.push(bc(3));
    q.push(bc(5));
    assert_eq!(q.pop_until(3).unwrap().seq_num, 2);
    assert_eq!(q.pop_until(3).unwrap().seq_num, 3);
    assert!(q.pop_until(3).is_none());
    assert_eq!(q.len(), 1);
  }

  #[test]
  fn anchor_detects_gap() {
    let mut q = ReorderQueue::new();
    q.push(bc(1));
    q.push(bc(2));
    q.push(bc(4));
    // Anchor at 2: 1 and 2 are stale, 4 leaves a gap after 2.
    let (last, gap) = q.anchor_broadcast_sequence(2).unwrap();
    assert_eq!(last, 4);
    assert!(gap);
    assert_eq!(q.len(), 1);
  }

  #[test]
  fn anchor_contiguous_run_has_no_gap() {
    let mut q = ReorderQueue::new();
    q.push(bc(3));
    q.push(bc(4));
    let (last, gap) = q.anchor_broadcast_sequence(2).unwrap();
    assert_eq!(last, 4);
    assert!(!gap);

    let mut empty = ReorderQueue::new();
    assert!(empty.anchor_broadcast_sequence(2).is_none());
  }

  #[test]
  fn unicast_presence_tracking() {
    let mut q = ReorderQueue::new();
    q.push(bc(7));
    assert!(!q.has_unicast_msgs());
    q.push(uc(8));
    assert!(q.has_unicast_msgs());
    assert_eq!(q.last_broadcast_seq(), Some(7));
  }
}
