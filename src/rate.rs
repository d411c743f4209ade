use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

/// One reading of the interface octet counters.
///
/// The internal API names the time column `timestamp`, PostgREST's
/// `interface_metrics` view names it `inserted_at`; both decode here.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Sample {
    #[serde(alias = "inserted_at", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub octets_in: Option<i64>,
    #[serde(default)]
    pub octets_out: Option<i64>,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, octets_in: i64, octets_out: i64) -> Self {
        Self {
            timestamp,
            octets_in: Some(octets_in),
            octets_out: Some(octets_out),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePoint {
    /// Epoch milliseconds of the later sample of the pair.
    pub timestamp_ms: i64,
    pub bits_per_sec: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateSeries {
    pub inbound: Vec<RatePoint>,
    pub outbound: Vec<RatePoint>,
}

impl RateSeries {
    pub fn len(&self) -> usize {
        self.inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty()
    }

    pub fn peak(&self) -> u64 {
        self.inbound
            .iter()
            .chain(self.outbound.iter())
            .map(|p| p.bits_per_sec)
            .max()
            .unwrap_or(0)
    }
}

/// Bits per second between two readings of a cumulative octet counter.
///
/// A missing reading or a counter that went backwards yields 0.
pub fn counter_rate(prev: Option<i64>, cur: Option<i64>, dt_secs: i64) -> u64 {
    let (Some(prev), Some(cur)) = (prev, cur) else {
        return 0;
    };
    let delta = cur as i128 - prev as i128;
    let rate = (8 * delta).div_euclid(dt_secs.max(1) as i128);
    if rate <= 0 {
        0
    } else {
        u64::try_from(rate).unwrap_or(u64::MAX)
    }
}

/// Converts ordered counter samples into N-1 inbound/outbound rate points.
pub fn rates(samples: &[Sample]) -> RateSeries {
    let mut series = RateSeries {
        inbound: Vec::with_capacity(samples.len().saturating_sub(1)),
        outbound: Vec::with_capacity(samples.len().saturating_sub(1)),
    };

    for pair in samples.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let dt = (cur.timestamp.timestamp() - prev.timestamp.timestamp()).max(1);
        let timestamp_ms = cur.timestamp.timestamp_millis();

        series.inbound.push(RatePoint {
            timestamp_ms,
            bits_per_sec: counter_rate(prev.octets_in, cur.octets_in, dt),
        });
        series.outbound.push(RatePoint {
            timestamp_ms,
            bits_per_sec: counter_rate(prev.octets_out, cur.octets_out, dt),
        });
    }

    series
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // PostgREST renders `timestamp without time zone` columns without an offset.
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_timestamp(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {s:?}")))
}
