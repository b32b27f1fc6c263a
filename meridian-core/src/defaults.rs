//! Default durations and sizes, overridable via `MeridianConfig`.
//!
//! Kept as named constants (rather than inlined) because several are under
//! an explicit resolved Open Question (see `DESIGN.md`) and several are
//! parametrized per-fixture in `original_source`'s test suite, meaning a
//! deployment may legitimately need to override them.

use std::time::Duration;

/// Grace period after `started_at` before a still-unhealthy `provisioning`
/// instance is moved to `terminating` (spec §4.2).
pub const SHIM_GRACE: Duration = Duration::from_secs(10 * 60);

/// Grace period an `idle` instance gets after a failed healthcheck before
/// its `termination_deadline` forces a `terminating` transition (spec §4.2).
pub const IDLE_UNHEALTHY_GRACE: Duration = Duration::from_secs(20 * 60);

/// Minimum wait between `ComputeBackend::terminate_instance` retries (spec
/// §4.2, `test_terminate_not_retries_if_too_early`).
pub const TERMINATE_RETRY_MIN_WAIT: Duration = Duration::from_secs(60);

/// Hard deadline from the first `terminating` attempt, after which the
/// instance is forced to `terminated` regardless of backend response (spec
/// §4.2, §8 invariant 5).
pub const TERMINATE_HARD_DEADLINE: Duration = Duration::from_secs(16 * 60);

/// Retry window for a Job that failed with `interrupted_by_no_capacity`
/// (spec §4.4, §9 resolved open question: 3 minutes, matching
/// `original_source`'s sampled `test_process_runs.py` fixtures).
pub const NO_CAPACITY_RETRY_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Offer cache TTL per `(backend, requirements-hash)` key (spec §4.6).
pub const OFFER_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default top-K offers returned by the offer engine (spec §4.6).
pub const OFFER_TOP_K: usize = 50;

/// Default outbound call deadline (spec §5).
pub const CALL_DEADLINE: Duration = Duration::from_secs(30);

/// Outbound deadline for instance-create calls specifically (spec §5).
pub const INSTANCE_CREATE_DEADLINE: Duration = Duration::from_secs(2 * 60);

/// Shutdown grace period for in-flight handlers (spec §5, §4.1).
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Backend 429 backoff base delay (spec §5).
pub const BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Backend 429 backoff cap (spec §5).
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Lease TTL multiplier applied to a task's polling interval (spec §4.1).
pub const LEASE_TTL_MULTIPLIER: u32 = 2;

/// Default per-fleet idle duration before `destroy_after_idle` fires, absent
/// an explicit `termination_idle_time` on the fleet/profile.
pub const DEFAULT_TERMINATION_IDLE_TIME: Duration = Duration::from_secs(5 * 60);
