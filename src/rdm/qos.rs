use num_derive::{FromPrimitive, ToPrimitive};

/// Timeliness half of a QoS. Lower numeric value is better.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive, Default,
)]
#[repr(u8)]
pub enum QosTimeliness {
  #[default]
  Unspecified = 0,
  Realtime = 1,
  DelayedUnknown = 2,
  Delayed = 3,
}

/// Rate half of a QoS. Lower numeric value is better.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive, Default,
)]
#[repr(u8)]
pub enum QosRate {
  #[default]
  Unspecified = 0,
  TickByTick = 1,
  JustInTimeConflated = 2,
  TimeConflated = 3,
}

/// Delivery quality of a stream: (timeliness, rate).
///
/// Services advertise an ordered list of these; requests carry either a
/// single QoS or a `[qos, worst_qos]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Qos {
  pub timeliness: QosTimeliness,
  pub rate: QosRate,
}

impl Qos {
  pub const fn new(timeliness: QosTimeliness, rate: QosRate) -> Self {
    Self {
      timeliness,
      rate,
    }
  }

  pub fn realtime_tick_by_tick() -> Self {
    Self::new(QosTimeliness::Realtime, QosRate::TickByTick)
  }

  pub fn is_specified(&self) -> bool {
    self.timeliness != QosTimeliness::Unspecified && self.rate != QosRate::Unspecified
  }

  /// Strict quality ordering: timeliness dominates, rate breaks ties.
  /// "Better or equal" in range checks means not worse in this ordering.
  fn rank(&self) -> (u8, u8) {
    (self.timeliness as u8, self.rate as u8)
  }

  pub fn is_better_or_equal(&self, other: &Qos) -> bool {
    self.rank() <= other.rank()
  }

  /// Whether `self` falls within the inclusive range `[best, worst]`.
  pub fn is_in_range(&self, best: &Qos, worst: &Qos) -> bool {
    best.is_better_or_equal(self) && self.is_better_or_equal(worst)
  }
}

/// Finds the QoS a service should serve a request with.
///
/// With a range, the best in-range QoS offered wins. With a single QoS, only
/// an exact match qualifies. With no QoS on the request, the first offered
/// QoS is used (the service lists its QoS best-first).
pub fn match_qos<'a>(
  qos: Option<&Qos>,
  worst_qos: Option<&Qos>,
  offered: &'a [Qos],
) -> Option<&'a Qos> {
  match (qos, worst_qos) {
    (Some(best), Some(worst)) => offered
      .iter()
      .filter(|o| o.is_in_range(best, worst))
      .min_by_key(|o| o.rank()),
    (Some(single), None) => offered.iter().find(|o| *o == single),
    (None, _) => offered.first(),
  }
}

#[cfg(test)]
mod tests {
  use test_case::test_case;

  use super::*;

  fn q(t: QosTimeliness, r: QosRate) -> Qos {
    Qos::new(t, r)
  }

  #[test]
  fn exact_match_only_without_range() {
    let offered = [
      q(QosTimeliness::Realtime, QosRate::TickByTick),
      q(QosTimeliness::Delayed, QosRate::TimeConflated),
    ];
    let want = q(QosTimeliness::Realtime, QosRate::TickByTick);
    assert_eq!(match_qos(Some(&want), None, &offered), Some(&offered[0]));

    let miss = q(QosTimeliness::Realtime, QosRate::JustInTimeConflated);
    assert_eq!(match_qos(Some(&miss), None, &offered), None);
  }

  #[test_case(QosTimeliness::Realtime, QosRate::TickByTick, true; "best end of range")]
  #[test_case(QosTimeliness::Delayed, QosRate::TimeConflated, true; "worst end of range")]
  #[test_case(QosTimeliness::Delayed, QosRate::Unspecified, false; "outside range")]
  fn range_membership(t: QosTimeliness, r: QosRate, inside: bool) {
    let best = q(QosTimeliness::Realtime, QosRate::TickByTick);
    let worst = q(QosTimeliness::Delayed, QosRate::TimeConflated);
    assert_eq!(q(t, r).is_in_range(&best, &worst), inside);
  }

  #[test]
  fn range_picks_best_offered() {
    let offered = [
      q(QosTimeliness::Delayed, QosRate::TimeConflated),
      q(QosTimeliness::Realtime, QosRate::JustInTimeConflated),
    ];
    let best = q(QosTimeliness::Realtime, QosRate::TickByTick);
    let worst = q(QosTimeliness::Delayed, QosRate::TimeConflated);
    assert_eq!(
      match_qos(Some(&best), Some(&worst), &offered),
      Some(&offered[1])
    );
  }

  #[test]
  fn no_request_qos_takes_first_offered() {
    let offered = [
      q(QosTimeliness::DelayedUnknown, QosRate::TimeConflated),
      q(QosTimeliness::Realtime, QosRate::TickByTick),
    ];
    assert_eq!(match_qos(None, None, &offered), Some(&offered[0]));
    assert_eq!(match_qos(None, None, &[]), None);
  }
}
