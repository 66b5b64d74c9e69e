/// Position of an event within its stream. Assigned by the store at append
/// time, starting at 1 and dense per stream.
pub type EventNumber = u64;

/// Optimistic-concurrency version of an aggregate instance, unique per
/// `(_aggregate_id, _aggregate_version)` within a stream.
pub type Version = u64;
