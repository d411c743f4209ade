use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;
use serde_json::Value;

use crate::cache::Cached;
use crate::constants::{SANKEY_LINK_CAP, SANKEY_PASS_THROUGH};
use crate::rate::{rates, RateSeries, Sample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrSide {
    Src,
    Dst,
}

impl AddrSide {
    pub fn column(self) -> &'static str {
        match self {
            AddrSide::Src => "srcaddr",
            AddrSide::Dst => "dstaddr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDirection {
    Input,
    Output,
}

impl FlowDirection {
    pub fn column(self) -> &'static str {
        match self {
            FlowDirection::Input => "input",
            FlowDirection::Output => "output",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measure {
    Bytes,
    Packets,
}

impl Measure {
    pub fn column(self) -> &'static str {
        match self {
            Measure::Bytes => "total_octets",
            Measure::Packets => "total_packets",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChartKind {
    /// Interface counters from PostgREST `interface_metrics`.
    Timeseries,
    /// Interface counters from the internal `/api/v1/metrics` endpoint.
    TimeseriesApi,
    Pie {
        addr: AddrSide,
        direction: FlowDirection,
        measure: Measure,
    },
    /// Source to destination conversations seen on one side of the interface.
    Sankey { direction: FlowDirection },
}

/// Everything a chart query is parameterized by.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    pub postgrest_url: String,
    pub api_url: String,
    pub exporter: String,
    pub interface: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Extra row filters, forwarded only where a chart accepts them.
    pub filters: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub url: String,
    pub params: Vec<(String, String)>,
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn rest_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn pair(k: impl Into<String>, v: impl Into<String>) -> (String, String) {
    (k.into(), v.into())
}

impl ChartKind {
    pub fn title(&self, q: &QueryParams) -> String {
        match self {
            ChartKind::Timeseries | ChartKind::TimeseriesApi => format!(
                " Traffic rate (bits/s) exporter {} ifIndex {} ",
                q.exporter, q.interface
            ),
            ChartKind::Pie {
                addr,
                direction,
                measure,
            } => format!(
                " {:?} {:?} distribution ({}) ",
                direction,
                addr,
                match measure {
                    Measure::Bytes => "bytes",
                    Measure::Packets => "pkts",
                }
            ),
            ChartKind::Sankey { direction } => format!(" Top Conversations ({direction:?}) "),
        }
    }

    pub fn query(&self, q: &QueryParams) -> Query {
        match self {
            ChartKind::Timeseries => Query {
                url: join_url(&q.postgrest_url, "interface_metrics"),
                params: vec![
                    pair("exporter", format!("eq.{}", q.exporter)),
                    pair("snmp_index", format!("eq.{}", q.interface)),
                    pair("inserted_at", format!("gt.{}", rest_time(q.start))),
                    pair("inserted_at", format!("lt.{}", rest_time(q.end))),
                    pair("order", "inserted_at.asc"),
                ],
            },
            ChartKind::TimeseriesApi => Query {
                url: join_url(
                    &q.api_url,
                    &format!("api/v1/metrics/{}/{}", q.exporter, q.interface),
                ),
                params: vec![
                    pair("start", q.start.timestamp().to_string()),
                    pair("end", q.end.timestamp().to_string()),
                ],
            },
            ChartKind::Pie {
                addr,
                direction,
                measure,
            } => Query {
                url: join_url(&q.postgrest_url, "flows_agg_5min"),
                params: vec![
                    pair("select", format!("{},{}.sum()", addr.column(), measure.column())),
                    pair("exporter", format!("eq.{}", q.exporter)),
                    pair(direction.column(), format!("eq.{}", q.interface)),
                    pair("bucket_5min", format!("gt.{}", rest_time(q.start))),
                    pair("bucket_5min", format!("lt.{}", rest_time(q.end))),
                ],
            },
            ChartKind::Sankey { direction } => {
                let mut params = vec![
                    pair("select", "srcaddr,dstaddr,total_octets.sum()"),
                    pair("exporter", format!("eq.{}", q.exporter)),
                    pair(direction.column(), format!("eq.{}", q.interface)),
                    pair("bucket_5min", format!("gt.{}", rest_time(q.start))),
                    pair("bucket_5min", format!("lt.{}", rest_time(q.end))),
                ];
                params.extend(
                    q.filters
                        .iter()
                        .filter(|(k, _)| SANKEY_PASS_THROUGH.contains(&k.as_str()))
                        .cloned(),
                );
                Query {
                    url: join_url(&q.postgrest_url, "flows_agg_5min"),
                    params,
                }
            }
        }
    }

    /// Turns backend rows into the series this chart draws.
    pub fn transform(&self, rows: Vec<Value>) -> ChartData {
        match self {
            ChartKind::Timeseries | ChartKind::TimeseriesApi => {
                let samples: Vec<Sample> = rows
                    .into_iter()
                    .filter_map(|row| match serde_json::from_value(row) {
                        Ok(sample) => Some(sample),
                        Err(e) => {
                            warn!("Skipping malformed metrics row: {e}");
                            None
                        }
                    })
                    .collect();
                ChartData::Rates(rates(&samples))
            }
            ChartKind::Pie { addr, .. } => ChartData::Slices(pie_slices(&rows, addr.column())),
            ChartKind::Sankey { .. } => ChartData::Links(sankey_links(&rows)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub from: String,
    pub to: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChartData {
    Rates(RateSeries),
    Slices(Vec<Slice>),
    Links(Vec<Link>),
}

// Aggregates come back as JSON numbers or, for numeric columns, strings.
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn label(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Null) | None => "n/a".to_string(),
        Some(Value::String(_)) => "n/a".to_string(),
        Some(other) => other.to_string(),
    }
}

fn by_weight_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Name/value slices, largest first.
pub fn pie_slices(rows: &[Value], name_key: &str) -> Vec<Slice> {
    let mut slices: Vec<Slice> = rows
        .iter()
        .map(|row| Slice {
            name: label(row.get(name_key)),
            value: row.get("sum").and_then(number).unwrap_or(0.0),
        })
        .collect();
    slices.sort_by(|a, b| by_weight_desc(a.value, b.value));
    slices
}

/// Source→destination weights summed per pair, heaviest first, capped.
pub fn sankey_links(rows: &[Value]) -> Vec<Link> {
    let mut pairs: HashMap<(String, String), f64> = HashMap::new();
    for row in rows {
        let from = label(row.get("srcaddr"));
        let to = label(row.get("dstaddr"));
        let weight = ["sum", "total_octets", "total_octets_sum"]
            .iter()
            .filter_map(|k| row.get(*k).and_then(number))
            .find(|w| *w != 0.0)
            .unwrap_or(0.0);
        *pairs.entry((from, to)).or_insert(0.0) += weight;
    }

    let mut links: Vec<Link> = pairs
        .into_iter()
        .map(|((from, to), weight)| Link { from, to, weight })
        .collect();
    links.sort_by(|a, b| {
        by_weight_desc(a.weight, b.weight)
            .then_with(|| a.from.cmp(&b.from))
            .then_with(|| a.to.cmp(&b.to))
    });
    links.truncate(SANKEY_LINK_CAP);
    links
}

/// One chart on the dashboard: what it shows plus its latest data.
#[derive(Debug, Clone)]
pub struct Chart {
    pub kind: ChartKind,
    pub title: String,
    pub data: Option<ChartData>,
    pub from_cache: bool,
    pub error: Option<String>,
    generation: u64,
}

impl Chart {
    pub fn new(kind: ChartKind, title: String) -> Self {
        Self {
            kind,
            title,
            data: None,
            from_cache: false,
            error: None,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stamps a new request; any reply to an earlier one becomes stale.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Applies a reply unless a newer request has been issued since.
    pub fn apply(&mut self, generation: u64, result: Result<Cached<ChartData>, String>) -> bool {
        if generation != self.generation {
            return false;
        }
        match result {
            Ok(cached) => {
                self.data = Some(cached.data);
                self.from_cache = cached.from_cache;
                self.error = None;
            }
            Err(e) => self.error = Some(e),
        }
        true
    }
}
