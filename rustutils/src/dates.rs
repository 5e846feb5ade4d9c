/// Time representations used across the summarizer.
///
/// There are two notions of time here.  `Timestamp` is a UTC wall-clock time used for metadata
/// (creation time of a summary and so on).  `Timeval` is the archive clock: whole seconds plus a
/// microsecond fraction, exactly as recorded by the collector.  Sample timestamps must be compared
/// as `Timeval`, never as floating point, since two distinct records can be within float rounding
/// of each other.
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub type Timestamp = DateTime<Utc>;

pub fn now() -> Timestamp {
    Utc::now()
}

pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Seconds since the epoch as a float, the representation the summary document uses.

pub fn timestamp_to_secs(t: Timestamp) -> f64 {
    t.timestamp() as f64 + (t.timestamp_subsec_micros() as f64) / 1_000_000.0
}

const USEC_PER_SEC: i64 = 1_000_000;

/// Archive time.  The fraction is always normalized to 0..USEC_PER_SEC.

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

impl Timeval {
    pub fn new(sec: i64, usec: i64) -> Timeval {
        Timeval {
            sec: sec + usec.div_euclid(USEC_PER_SEC),
            usec: usec.rem_euclid(USEC_PER_SEC),
        }
    }

    pub fn from_secs(sec: i64) -> Timeval {
        Timeval { sec, usec: 0 }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + (self.usec as f64) / (USEC_PER_SEC as f64)
    }

    /// Parse "SEC" or "SEC.FRACTION", where the fraction has at most six digits.  Parsing is
    /// done on the digits, not via f64, so that no precision is lost.

    pub fn parse(s: &str) -> Result<Timeval> {
        let (secs, frac) = match s.find('.') {
            Some(p) => (&s[0..p], &s[p + 1..]),
            None => (s, ""),
        };
        let sec = match i64::from_str(secs) {
            Ok(n) => n,
            Err(_) => bail!("Bad seconds in time value '{s}'"),
        };
        if frac.len() > 6 || !frac.bytes().all(|c| c.is_ascii_digit()) {
            bail!("Bad fraction in time value '{s}'")
        }
        let mut usec = 0i64;
        for c in frac.bytes().chain(std::iter::repeat(b'0')).take(6) {
            usec = usec * 10 + (c - b'0') as i64;
        }
        if secs.starts_with('-') && usec > 0 {
            bail!("Negative time values with a fraction are not supported: '{s}'")
        }
        Ok(Timeval { sec, usec })
    }
}

impl Ord for Timeval {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sec.cmp(&other.sec).then(self.usec.cmp(&other.usec))
    }
}

impl PartialOrd for Timeval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timeval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

#[test]
fn test_timeval_parse() {
    assert!(Timeval::parse("1600000000").unwrap() == Timeval::new(1600000000, 0));
    assert!(Timeval::parse("1600000000.5").unwrap() == Timeval::new(1600000000, 500000));
    assert!(Timeval::parse("12.000001").unwrap() == Timeval::new(12, 1));
    assert!(Timeval::parse("12.0000001").is_err());
    assert!(Timeval::parse("12.x").is_err());
    assert!(Timeval::parse("").is_err());
    assert!(Timeval::parse("-3").unwrap() == Timeval::new(-3, 0));
    // "-0" is zero as an integer, but the fraction would still lose its sign.
    assert!(Timeval::parse("-0.5").is_err());
    assert!(Timeval::parse("-2.25").is_err());
    assert!(format!("{}", Timeval::new(3, 42)) == "3.000042");
}

#[test]
fn test_timeval_order() {
    // Same second, different fraction: these must not compare equal.
    let a = Timeval::new(100, 1);
    let b = Timeval::new(100, 2);
    assert!(a < b);
    assert!(a != b);
    assert!(Timeval::new(99, 999999) < Timeval::new(100, 0));
    assert!(Timeval::new(1, 1_500_000) == Timeval::new(2, 500_000));
}

#[test]
fn test_timestamps() {
    let t = parse_timestamp("2023-10-13T12:00:00Z").unwrap();
    assert!(t > parse_timestamp("1970-01-01T00:00:00Z").unwrap());
    assert!(timestamp_to_secs(t) == 1697198400.0);
}
