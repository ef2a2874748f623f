/// Torii timestamp.
///
/// Internally i64 microseconds from unix epoch. Wall-clock time drives
/// every expiry decision in the controller (silence reaping, pending
/// admission deadlines, backup rule firing), so the arithmetic here is
/// checked rather than panicking.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Construct a new timestamp of "now".
    pub fn now() -> Self {
        std::time::SystemTime::now().into()
    }

    /// Construct a timestamp from i64 microseconds since unix epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Get the i64 microseconds since unix epoch.
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// The duration elapsed between `earlier` and this timestamp, or
    /// `None` if `earlier` is actually later.
    pub fn since(&self, earlier: Timestamp) -> Option<std::time::Duration> {
        if self.0 < earlier.0 {
            None
        } else {
            Some(std::time::Duration::from_micros((self.0 - earlier.0) as u64))
        }
    }

    /// The wall-clock time elapsed since this timestamp, zero if this
    /// timestamp is in the future.
    pub fn elapsed(&self) -> std::time::Duration {
        Timestamp::now().since(*self).unwrap_or_default()
    }

    /// This timestamp moved backward by a duration, saturating at the
    /// unix epoch.
    pub fn saturating_sub(&self, d: std::time::Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(d.as_micros() as i64).max(0))
    }
}

impl std::ops::Add<std::time::Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: std::time::Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_micros() as i64))
    }
}

impl std::ops::AddAssign<std::time::Duration> for Timestamp {
    fn add_assign(&mut self, rhs: std::time::Duration) {
        *self = *self + rhs;
    }
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(t: std::time::SystemTime) -> Self {
        Self(
            t.duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_micros() as i64)
                .unwrap_or(0),
        )
    }
}

impl From<Timestamp> for std::time::SystemTime {
    fn from(t: Timestamp) -> Self {
        std::time::SystemTime::UNIX_EPOCH
            + std::time::Duration::from_micros(t.0.max(0) as u64)
    }
}
