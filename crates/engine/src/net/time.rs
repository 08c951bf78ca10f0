//! Monotonic time used by the reactor and state machine.
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic;
use std::time::{SystemTime, UNIX_EPOCH};

/// A point in local time.
///
/// Never goes backwards, even if the system clock does.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default)]
pub struct LocalTime {
    millis: u128,
}

impl LocalTime {
    /// The current local time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now());
        let millis = now.millis as u64;
        let last = LAST.load(atomic::Ordering::SeqCst);

        if millis < last {
            Self::from_millis(last as u128)
        } else {
            LAST.store(millis, atomic::Ordering::SeqCst);
            now
        }
    }

    /// Construct from whole seconds since Epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs as u128 * 1000,
        }
    }

    /// Construct from milliseconds since Epoch.
    pub const fn from_millis(millis: u128) -> Self {
        Self { millis }
    }

    /// Whole seconds since Epoch.
    pub const fn as_secs(&self) -> u64 {
        (self.millis / 1000) as u64
    }

    /// Milliseconds since Epoch.
    pub const fn as_millis(&self) -> u128 {
        self.millis
    }

    /// Absolute difference between two times.
    pub fn diff(&self, other: LocalTime) -> LocalDuration {
        if self > &other {
            *self - other
        } else {
            other - *self
        }
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        Self {
            millis: system
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        }
    }
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

/// A span of local time.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u128);

impl LocalDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs as u128 * 1000)
    }

    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    pub const fn from_millis(millis: u128) -> Self {
        Self(millis)
    }

    pub const fn as_secs(&self) -> u64 {
        (self.0 / 1000) as u64
    }

    pub const fn as_millis(&self) -> u128 {
        self.0
    }

    /// Clamp into `[min, max]`.
    pub fn clamp(self, min: Self, max: Self) -> Self {
        if self < min {
            min
        } else if self > max {
            max
        } else {
            self
        }
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.as_millis() < 1000 {
            write!(f, "{} ms", self.as_millis())
        } else {
            write!(f, "{} s", self.as_secs())
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> LocalDuration {
        LocalDuration(self.0 * other as u128)
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0 as u64)
    }
}

/// Pending reactor wake-up deadlines.
///
/// The state machine asks for wake-ups with `Io::SetTimer` and
/// re-derives what is due from its own clock when woken, so deadlines
/// carry no payload here; this is just an ordered set of times.
pub struct TimeoutManager {
    deadlines: BinaryHeap<Reverse<LocalTime>>,
    threshold: LocalDuration,
}

impl TimeoutManager {
    /// Create a new timeout manager.
    ///
    /// A deadline within `threshold` of an already scheduled one is
    /// coalesced into it; one poll wake-up serves both.
    pub fn new(threshold: LocalDuration) -> Self {
        Self {
            deadlines: BinaryHeap::new(),
            threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Schedule a wake-up. Returns `false` when an existing deadline
    /// already covers it.
    pub fn register(&mut self, time: LocalTime) -> bool {
        if self
            .deadlines
            .iter()
            .any(|Reverse(t)| t.diff(time) < self.threshold)
        {
            return false;
        }

        self.deadlines.push(Reverse(time));
        true
    }

    /// Time left until the earliest deadline, or `None` when idle.
    pub fn next(&self, now: LocalTime) -> Option<LocalDuration> {
        self.deadlines.peek().map(|Reverse(t)| {
            if *t >= now {
                *t - now
            } else {
                LocalDuration::from_secs(0)
            }
        })
    }

    /// Drop every deadline reached by `now`; returns how many fired.
    pub fn expire(&mut self, now: LocalTime) -> usize {
        let mut fired = 0;

        while let Some(Reverse(deadline)) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            self.deadlines.pop();
            fired += 1;
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_deadline_drives_the_wait() {
        let mut mgr = TimeoutManager::new(LocalDuration::from_millis(0));
        let base = LocalTime::from_secs(100);

        mgr.register(base + LocalDuration::from_secs(2));
        mgr.register(base + LocalDuration::from_secs(1));
        mgr.register(base + LocalDuration::from_secs(3));

        assert_eq!(mgr.next(base), Some(LocalDuration::from_secs(1)));
        assert_eq!(mgr.expire(base + LocalDuration::from_secs(2)), 2);
        assert_eq!(mgr.len(), 1);
        assert_eq!(
            mgr.next(base + LocalDuration::from_secs(2)),
            Some(LocalDuration::from_secs(1))
        );
    }

    #[test]
    fn close_deadlines_coalesce() {
        let mut mgr = TimeoutManager::new(LocalDuration::from_secs(1));
        let base = LocalTime::from_secs(0);

        assert!(mgr.register(base + LocalDuration::from_secs(10)));
        assert!(!mgr.register(base + LocalDuration::from_millis(10_500)));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn overdue_deadline_waits_zero() {
        let mut mgr = TimeoutManager::new(LocalDuration::from_millis(0));

        mgr.register(LocalTime::from_secs(1));
        assert_eq!(
            mgr.next(LocalTime::from_secs(5)),
            Some(LocalDuration::from_secs(0))
        );
        assert_eq!(mgr.expire(LocalTime::from_secs(5)), 1);
        assert!(mgr.is_empty());
    }
}
