//! Table of outstanding posts awaiting acknowledgement.

use std::collections::{HashMap, VecDeque};

use crate::{
  rdm::types::DomainType,
  watchlist::config::Ticks,
};

/// Identity of an outstanding post on one upstream stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PostKey {
  pub stream_id: i32,
  pub post_id: u32,
  pub seq_num: Option<u32>,
}

/// Who issued the post: an item request, or the login request (off-stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOwner {
  Item(i32),
  Login,
}

#[derive(Debug, Clone)]
pub struct PostRecord {
  pub key: PostKey,
  pub owner: PostOwner,
  pub domain: DomainType,
  pub expire_time: Ticks,
}

/// Post records keyed for ack matching and linked in a deadline-ordered
/// queue. All posts share one timeout, so append order is deadline order.
#[derive(Debug)]
pub struct PostTable {
  records: HashMap<PostKey, PostRecord>,
  timeout_queue: VecDeque<PostKey>,
  max_records: usize,
}

impl PostTable {
  pub fn new(max_records: usize) -> Self {
    Self {
      records: HashMap::new(),
      timeout_queue: VecDeque::new(),
      max_records,
    }
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn is_full(&self) -> bool {
    self.records.len() >= self.max_records
  }

  /// Registers an outstanding post. Fails on duplicate key; the caller is
  /// expected to have checked `is_full` first.
  pub fn add(&mut self, record: PostRecord) -> bool {
    if self.records.contains_key(&record.key) {
      return false;
    }
    self.timeout_queue.push_back(record.key);
    self.records.insert(record.key, record);
    true
  }

  /// Matches an incoming acknowledgement and removes its record.
  pub fn match_ack(&mut self, stream_id: i32, ack_id: u32, seq_num: Option<u32>) -> Option<PostRecord> {
    let key = PostKey {
      stream_id,
      post_id: ack_id,
      seq_num,
    };
    let record = self.records.remove(&key)?;
    self.timeout_queue.retain(|k| *k != key);
    Some(record)
  }

  /// Earliest outstanding deadline, if any.
  pub fn next_timeout(&self) -> Option<Ticks> {
    self
      .timeout_queue
      .front()
      .and_then(|k| self.records.get(k))
      .map(|r| r.expire_time)
  }

  /// Pops the front record if it has expired at `now`.
  pub fn pop_expired(&mut self, now: Ticks) -> Option<PostRecord> {
    let front = *self.timeout_queue.front()?;
    let expired = self
      .records
      .get(&front)
      .is_some_and(|r| r.expire_time <= now);
    if !expired {
      return None;
    }
    self.timeout_queue.pop_front();
    self.records.remove(&front)
  }

  /// Drops every record owned by the given request.
  pub fn remove_owner(&mut self, owner: PostOwner) {
    self.records.retain(|_, r| r.owner != owner);
    let records = &self.records;
    self.timeout_queue.retain(|k| records.contains_key(k));
  }

  pub fn clear(&mut self) {
    self.records.clear();
    self.timeout_queue.clear();
  }
}
