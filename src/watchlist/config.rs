/// Time values are engine ticks; hosts commonly use milliseconds.
pub type Ticks = i64;

/// Sentinel for "no deadline armed".
pub const TIME_UNSET: Ticks = i64::MAX;

/// Engine configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct WatchlistConfig {
  /// Initial capacity hint for request/stream tables.
  pub item_count_hint: usize,
  /// Honor service-advertised OpenWindow limits.
  pub obey_open_window: bool,
  /// Deadline for a response to an outstanding request, in ticks.
  pub request_timeout: Ticks,
  /// Upper bound on simultaneously outstanding posts.
  pub max_outstanding_posts: usize,
  /// Deadline for a post acknowledgement, in ticks.
  pub post_ack_timeout: Ticks,
  /// Host scheduler granularity; informational, the engine treats all
  /// supplied times as already being in ticks.
  pub ticks_per_msec: u32,
  /// Recover recoverable closures transparently instead of surfacing them.
  pub single_open: bool,
  /// Pass suspect data through instead of escalating to recovery.
  pub allow_suspect_data: bool,
  /// Detect broadcast sequence gaps and recover affected streams.
  pub gap_recovery: bool,
  /// How long a detected gap may persist before recovery, in ticks.
  pub gap_timeout: Ticks,
  pub support_optimized_pause_resume: bool,
  pub support_view_requests: bool,
}

impl Default for WatchlistConfig {
  fn default() -> Self {
    Self {
      item_count_hint: 128,
      obey_open_window: true,
      request_timeout: 15_000,
      max_outstanding_posts: 100_000,
      post_ack_timeout: 15_000,
      ticks_per_msec: 1,
      single_open: true,
      allow_suspect_data: true,
      gap_recovery: true,
      gap_timeout: 5_000,
      support_optimized_pause_resume: false,
      support_view_requests: false,
    }
  }
}
