//! Item-group and fault-tolerance-group membership tables.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_assertions::const_assert;

use crate::watchlist::config::Ticks;

/// FT group ids are single bytes.
pub const FT_GROUP_COUNT: usize = 256;
const_assert!(FT_GROUP_COUNT - 1 == u8::MAX as usize);

/// Item groups of one service: a server-assigned opaque id shared by a set
/// of open streams, used for bulk state changes.
#[derive(Debug, Default)]
pub struct ItemGroups {
  by_id: HashMap<Bytes, Vec<i32>>,
}

impl ItemGroups {
  /// Moves a stream into a group, removing it from its previous group.
  pub fn add_stream(&mut self, group_id: &Bytes, stream_id: i32, previous: Option<&Bytes>) {
    if previous == Some(group_id) {
      return;
    }
    if let Some(old) = previous {
      self.remove_stream(old, stream_id);
    }
    self.by_id.entry(group_id.clone()).or_default().push(stream_id);
  }

  pub fn remove_stream(&mut self, group_id: &Bytes, stream_id: i32) {
    if let Some(streams) = self.by_id.get_mut(group_id) {
      streams.retain(|s| *s != stream_id);
      if streams.is_empty() {
        self.by_id.remove(group_id);
      }
    }
  }

  /// Renames a group, re-homing its members. If the target group already
  /// exists the memberships are merged.
  pub fn merge(&mut self, from: &Bytes, to: &Bytes) -> Vec<i32> {
    if from == to {
      return Vec::new();
    }
    let moved = self.by_id.remove(from).unwrap_or_default();
    if !moved.is_empty() {
      self.by_id.entry(to.clone()).or_default().extend(moved.iter().copied());
    }
    moved
  }

  pub fn streams(&self, group_id: &Bytes) -> &[i32] {
    self.by_id.get(group_id).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn contains(&self, group_id: &Bytes) -> bool {
    self.by_id.contains_key(group_id)
  }

  pub fn remove_empty(&mut self, group_id: &Bytes) {
    if self.by_id.get(group_id).is_some_and(Vec::is_empty) {
      self.by_id.remove(group_id);
    }
  }

  pub fn is_empty(&self) -> bool {
    self.by_id.is_empty()
  }
}

#[derive(Debug)]
struct FtGroup {
  streams: Vec<i32>,
  expire_time: Ticks,
}

/// Fault-tolerance groups: byte-keyed sets of streams bound to one liveness
/// ping. The timer queue stays ordered by deadline because every refresh
/// uses the same relative timeout and moves the group to the tail.
#[derive(Debug)]
pub struct FtGroups {
  table: HashMap<u8, FtGroup>,
  timer_queue: VecDeque<u8>,
}

impl FtGroups {
  pub fn new() -> Self {
    Self {
      table: HashMap::new(),
      timer_queue: VecDeque::new(),
    }
  }

  /// Adds a stream to a group, creating the group with a fresh deadline if
  /// it did not exist.
  pub fn add_stream(&mut self, ft_group_id: u8, stream_id: i32, now: Ticks, ping_timeout: Ticks) {
    let group = self.table.entry(ft_group_id).or_insert_with(|| {
      trace!("creating FT group {ft_group_id}");
      self.timer_queue.push_back(ft_group_id);
      FtGroup {
        streams: Vec::new(),
        expire_time: now + ping_timeout,
      }
    });
    if !group.streams.contains(&stream_id) {
      group.streams.push(stream_id);
    }
  }

  /// Removes a stream; an emptied group is destroyed.
  pub fn remove_stream(&mut self, ft_group_id: u8, stream_id: i32) {
    if let Some(group) = self.table.get_mut(&ft_group_id) {
      group.streams.retain(|s| *s != stream_id);
      if group.streams.is_empty() {
        self.remove_group(ft_group_id);
      }
    }
  }

  pub fn remove_group(&mut self, ft_group_id: u8) {
    self.table.remove(&ft_group_id);
    self.timer_queue.retain(|id| *id != ft_group_id);
  }

  /// Refreshes the liveness deadline of a group. Returns the new deadline,
  /// or None if the group has no member streams.
  pub fn process_ping(&mut self, ft_group_id: u8, now: Ticks, ping_timeout: Ticks) -> Option<Ticks> {
    let group = self.table.get_mut(&ft_group_id)?;
    group.expire_time = now + ping_timeout;
    self.timer_queue.retain(|id| *id != ft_group_id);
    self.timer_queue.push_back(ft_group_id);
    Some(now + ping_timeout)
  }

  pub fn next_timeout(&self) -> Option<Ticks> {
    self
      .timer_queue
      .front()
      .and_then(|id| self.table.get(id))
      .map(|g| g.expire_time)
  }

  /// Front group of the timer queue if its deadline has passed.
  pub fn peek_expired(&self, now: Ticks) -> Option<(u8, Vec<i32>)> {
    let id = *self.timer_queue.front()?;
    let group = self.table.get(&id)?;
    (group.expire_time <= now).then(|| (id, group.streams.clone()))
  }

  pub fn streams(&self, ft_group_id: u8) -> &[i32] {
    self
      .table
      .get(&ft_group_id)
      .map(|g| g.streams.as_slice())
      .unwrap_or(&[])
  }

  pub fn is_empty(&self) -> bool {
    self.table.is_empty()
  }

  pub fn clear(&mut self) {
    self.table.clear();
    self.timer_queue.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn item_group_merge_rehomes_members() {
    let mut groups = ItemGroups::default();
    let g1 = Bytes::from_static(b"\x00\x01");
    let g2 = Bytes::from_static(b"\x00\x02");
    groups.add_stream(&g1, 3, None);
    groups.add_stream(&g1, 4, None);
    groups.add_stream(&g2, 5, None);

    let moved = groups.merge(&g1, &g2);
    assert_eq!(moved, vec![3, 4]);
    assert!(!groups.contains(&g1));
    assert_eq!(groups.streams(&g2), &[5, 3, 4]);
  }

  #[test]
  fn item_group_move_between_groups() {
    let mut groups = ItemGroups::default();
    let g1 = Bytes::from_static(b"a");
    let g2 = Bytes::from_static(b"b");
    groups.add_stream(&g1, 3, None);
    groups.add_stream(&g2, 3, Some(&g1));
    assert!(!groups.contains(&g1)); // emptied group destroyed
    assert_eq!(groups.streams(&g2), &[3]);
  }

  #[test]
  fn ft_ping_moves_group_to_tail() {
    let mut groups = FtGroups::new();
    groups.add_stream(7, 3, 0, 100);
    groups.add_stream(9, 4, 10, 100);
    assert_eq!(groups.next_timeout(), Some(100));

    groups.process_ping(7, 50, 100);
    assert_eq!(groups.next_timeout(), Some(110)); // group 9 is now first

    assert!(groups.peek_expired(100).is_none());
    let (id, streams) = groups.peek_expired(110).unwrap();
    assert_eq!(id, 9);
    assert_eq!(streams, vec![4]);
  }

  #[test]
  fn ft_group_emptied_is_destroyed() {
    let mut groups = FtGroups::new();
    groups.add_stream(1, 3, 0, 100);
    groups.remove_stream(1, 3);
    assert!(groups.is_empty());
    assert_eq!(groups.next_timeout(), None);
  }
}
