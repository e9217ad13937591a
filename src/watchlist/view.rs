//! Aggregation of per-request views into a single stream-level view.
//!
//! The overall view changes only when necessary: adding a view stages it,
//! merging folds staged views into the element counts, and only a commit
//! (after the updated view was successfully sent upstream) permanently drops
//! zero-count elements. Keeping zero-count elements between merges prevents
//! churn when a view is added and removed again before the upstream refresh
//! completes.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::rdm::{messages::ViewDefinition, types::ViewType};

/// Handle of one component view within an aggregate.
pub type ViewHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
  New,
  Merged,
  Committed,
}

#[derive(Debug, Clone)]
struct Component {
  handle: ViewHandle,
  elems: ViewElems,
  stage: Stage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ViewElems {
  Fields(Vec<i16>),
  Names(Vec<String>),
}

/// Normalizes a requested view: duplicates removed, field id 0 stripped,
/// field lists sorted ascending.
pub fn normalize_view(view: &ViewDefinition) -> ViewDefinition {
  match view {
    ViewDefinition::FieldIdList(fields) => {
      let mut fields: Vec<i16> = fields.iter().copied().filter(|f| *f != 0).collect();
      fields.sort_unstable();
      fields.dedup();
      ViewDefinition::FieldIdList(fields)
    }
    ViewDefinition::ElementNameList(names) => {
      let mut names = names.clone();
      names.sort_unstable();
      names.dedup();
      ViewDefinition::ElementNameList(names)
    }
  }
}

#[derive(Debug, Clone)]
struct Entry<T> {
  elem: T,
  count: u32,
  committed: bool,
}

/// The aggregate view of one item stream.
#[derive(Debug, Clone)]
pub struct AggregateView {
  view_type: ViewType,
  fields: Vec<Entry<i16>>,
  names: Vec<Entry<String>>,
  components: Vec<Component>,
  next_handle: ViewHandle,
}

impl AggregateView {
  pub fn new(view_type: ViewType) -> Self {
    Self {
      view_type,
      fields: Vec::new(),
      names: Vec::new(),
      components: Vec::new(),
      next_handle: 0,
    }
  }

  pub fn view_type(&self) -> ViewType {
    self.view_type
  }

  fn elems_of(view: &ViewDefinition) -> ViewElems {
    match normalize_view(view) {
      ViewDefinition::FieldIdList(fields) => ViewElems::Fields(fields),
      ViewDefinition::ElementNameList(names) => ViewElems::Names(names),
    }
  }

  /// Stages a view for the next merge. The overall view is unchanged.
  pub fn add(&mut self, view: &ViewDefinition) -> ViewHandle {
    let handle = self.next_handle;
    self.next_handle += 1;
    self.components.push(Component {
      handle,
      elems: Self::elems_of(view),
      stage: Stage::New,
    });
    handle
  }

  /// Removes a previously added view.
  pub fn remove(&mut self, handle: ViewHandle) {
    let Some(pos) = self.components.iter().position(|c| c.handle == handle) else {
      warn!("removing unknown view component {handle}");
      return;
    };
    let component = self.components.remove(pos);
    match component.stage {
      Stage::New => (), // never counted
      Stage::Merged | Stage::Committed => {
        match &component.elems {
          ViewElems::Fields(fields) => {
            for f in fields {
              decrement(&mut self.fields, f);
            }
            // Uncommitted elements that hit zero can go at once; committed
            // ones wait for the next commit.
            self.fields.retain(|e| e.count > 0 || e.committed);
          }
          ViewElems::Names(names) => {
            for n in names {
              decrement(&mut self.names, n);
            }
            self.names.retain(|e| e.count > 0 || e.committed);
          }
        }
      }
    }
  }

  /// Folds staged views into the overall view. Returns true iff the overall
  /// view changed: an element appeared, a zero-count element revived, or
  /// zero-count elements exist (a removal shrank the view).
  pub fn merge(&mut self) -> bool {
    let mut updated = self.fields.iter().any(|e| e.count == 0)
      || self.names.iter().any(|e| e.count == 0);
    for component in &mut self.components {
      if component.stage != Stage::New {
        continue;
      }
      match &component.elems {
        ViewElems::Fields(fields) => {
          for f in fields {
            updated |= increment(&mut self.fields, f.clone());
          }
          self.fields.sort_unstable_by_key(|e| e.elem);
        }
        ViewElems::Names(names) => {
          for n in names {
            updated |= increment(&mut self.names, n.clone());
          }
        }
      }
      component.stage = Stage::Merged;
    }
    updated
  }

  /// Reverts the last merge; use when sending the updated view failed.
  pub fn unmerge(&mut self) {
    for component in &mut self.components {
      if component.stage != Stage::Merged {
        continue;
      }
      match &component.elems {
        ViewElems::Fields(fields) => {
          for f in fields {
            decrement(&mut self.fields, f);
          }
          self.fields.retain(|e| e.count > 0 || e.committed);
        }
        ViewElems::Names(names) => {
          for n in names {
            decrement(&mut self.names, n);
          }
          self.names.retain(|e| e.count > 0 || e.committed);
        }
      }
      component.stage = Stage::New;
    }
  }

  /// Call after the updated view was successfully sent: merged views become
  /// committed and zero-count elements are finally purged.
  pub fn commit(&mut self) {
    for component in &mut self.components {
      if component.stage == Stage::Merged {
        component.stage = Stage::Committed;
      }
    }
    self.fields.retain(|e| e.count > 0);
    self.names.retain(|e| e.count > 0);
    for e in &mut self.fields {
      e.committed = true;
    }
    for e in &mut self.names {
      e.committed = true;
    }
  }

  /// True iff every element of the candidate is committed with nonzero count.
  pub fn contains(&self, view: &ViewDefinition) -> bool {
    match Self::elems_of(view) {
      ViewElems::Fields(fields) => fields.iter().all(|f| {
        self
          .fields
          .iter()
          .any(|e| e.elem == *f && e.count > 0 && e.committed)
      }),
      ViewElems::Names(names) => names.iter().all(|n| {
        self
          .names
          .iter()
          .any(|e| e.elem == *n && e.count > 0 && e.committed)
      }),
    }
  }

  /// Current overall view, zero-count elements skipped. This is what gets
  /// encoded into the upstream request.
  pub fn snapshot(&self) -> ViewDefinition {
    match self.view_type {
      ViewType::FieldIdList => ViewDefinition::FieldIdList(
        self
          .fields
          .iter()
          .filter(|e| e.count > 0)
          .map(|e| e.elem)
          .collect(),
      ),
      ViewType::ElementNameList => ViewDefinition::ElementNameList(
        self
          .names
          .iter()
          .filter(|e| e.count > 0)
          .map(|e| e.elem.clone())
          .collect(),
      ),
    }
  }
}

fn increment<T: PartialEq>(entries: &mut Vec<Entry<T>>, elem: T) -> bool {
  if let Some(entry) = entries.iter_mut().find(|e| e.elem == elem) {
    entry.count += 1;
    entry.count == 1 // revived a zero-count element
  } else {
    entries.push(Entry {
      elem,
      count: 1,
      committed: false,
    });
    true
  }
}

fn decrement<T: PartialEq>(entries: &mut [Entry<T>], elem: &T) {
  if let Some(entry) = entries.iter_mut().find(|e| e.elem == *elem) {
    entry.count = entry.count.saturating_sub(1);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fields(ids: &[i16]) -> ViewDefinition {
    ViewDefinition::FieldIdList(ids.to_vec())
  }

  fn snapshot_fields(agg: &AggregateView) -> Vec<i16> {
    match agg.snapshot() {
      ViewDefinition::FieldIdList(f) => f,
      other => panic!("expected field list, got {other:?}"),
    }
  }

  #[test]
  fn normalize_sorts_dedups_and_strips_zero() {
    let v = normalize_view(&fields(&[25, 0, 22, 25, 22]));
    assert_eq!(v, fields(&[22, 25]));
  }

  #[test]
  fn merge_reports_change_only_when_elements_appear() {
    let mut agg = AggregateView::new(ViewType::FieldIdList);
    agg.add(&fields(&[22, 25]));
    assert!(agg.merge());
    agg.commit();

    // A second view inside the committed set changes nothing.
    agg.add(&fields(&[22]));
    assert!(!agg.merge());
    assert_eq!(snapshot_fields(&agg), vec![22, 25]);

    // A view with a new element does.
    agg.add(&fields(&[31]));
    assert!(agg.merge());
    assert_eq!(snapshot_fields(&agg), vec![22, 25, 31]);
  }

  #[test]
  fn remove_before_commit_keeps_committed_zero_counts() {
    let mut agg = AggregateView::new(ViewType::FieldIdList);
    let h1 = agg.add(&fields(&[22, 25]));
    agg.add(&fields(&[22, 31]));
    assert!(agg.merge());
    agg.commit();

    // 25 is only held by the first view; removing it leaves the committed
    // zero-count element in place until the next commit.
    agg.remove(h1);
    assert_eq!(snapshot_fields(&agg), vec![22, 31]);
    assert!(!agg.contains(&fields(&[25])));

    agg.commit();
    assert_eq!(snapshot_fields(&agg), vec![22, 31]);
  }

  #[test]
  fn remove_of_uncommitted_drops_elements_immediately() {
    let mut agg = AggregateView::new(ViewType::FieldIdList);
    let h = agg.add(&fields(&[40, 41]));
    agg.merge();
    agg.remove(h);
    assert_eq!(snapshot_fields(&agg), Vec::<i16>::new());
  }

  #[test]
  fn unmerge_reverts_failed_send() {
    let mut agg = AggregateView::new(ViewType::FieldIdList);
    agg.add(&fields(&[22]));
    agg.merge();
    agg.commit();

    let h = agg.add(&fields(&[25]));
    assert!(agg.merge());
    agg.unmerge();
    assert_eq!(snapshot_fields(&agg), vec![22]);

    // Still staged; a later merge brings it back.
    assert!(agg.merge());
    assert_eq!(snapshot_fields(&agg), vec![22, 25]);
    let _ = h;
  }

  #[test]
  fn contains_requires_commit() {
    let mut agg = AggregateView::new(ViewType::FieldIdList);
    agg.add(&fields(&[22, 25]));
    agg.merge();
    assert!(!agg.contains(&fields(&[22])));
    agg.commit();
    assert!(agg.contains(&fields(&[22])));
    assert!(agg.contains(&fields(&[22, 25])));
    assert!(!agg.contains(&fields(&[22, 31])));
  }
}
