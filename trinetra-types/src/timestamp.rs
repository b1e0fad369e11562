use serde::{Deserialize, Serialize};

/// Wall-clock time as fractional seconds since the UNIX epoch.
///
/// All cross-service timestamps on the wire use this representation. The
/// inner value is finite by construction (`from_f64` panics in debug builds
/// on NaN; the wire decoders reject NaN at the serde layer via `f64`
/// finiteness checks downstream).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    pub fn from_f64(secs: f64) -> Self {
        debug_assert!(secs.is_finite());
        Timestamp(secs)
    }

    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Timestamp(now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) * 1e-6)
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// Seconds elapsed from `earlier` to `self`. Negative when `self`
    /// precedes `earlier`.
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        self.0 - earlier.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{:.6}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_is_transparent_f64() {
        let ts = Timestamp::from_f64(1708790400.123);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1708790400.123");
        let back: Timestamp = serde_json::from_str("1708790400.123").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn seconds_since_signed() {
        let a = Timestamp::from_f64(1500.0);
        let b = Timestamp::from_f64(1510.0);
        assert_eq!(b.seconds_since(a), 10.0);
        assert_eq!(a.seconds_since(b), -10.0);
    }
}
