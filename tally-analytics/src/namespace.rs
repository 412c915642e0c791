//! Naming scheme of all keys used by the analytics engine.
//!
//! The recorder, the compactor and the query assembler address the same data exclusively through
//! [`KeyNamespace`]. Keys have the following shapes, where `{p}` is the configured prefix:
//!
//! | Key                                   | Type    | Contents                            |
//! |---------------------------------------|---------|-------------------------------------|
//! | `{p}:{res}:{op}:day:uv:{date}`        | sketch  | unique visitors of a day            |
//! | `{p}:{res}:{op}:day:member:{date}`    | sketch  | unique authenticated users of a day |
//! | `{p}:{res}:{op}:day:pv`               | hash    | date to exact page views            |
//! | `{p}:{res}:{op}:day:uv`               | hash    | date to finalized visitor count     |
//! | `{p}:{res}:{op}:day:member`           | hash    | date to finalized member count      |
//! | `{p}:{res}:{op}:total:pv`             | counter | all-time page views                 |
//! | `{p}:{res}:{op}:realtime`             | hash    | epoch minute to page views          |
//! | `{p}:{res}:{op}:weekly:{date}`        | sketch  | merged visitors of the prior week   |
//! | `{p}:day:rank:{op}:{date}`            | zset    | resource to folded realtime views   |
//! | `{p}:dedup:{res}:{op}:{date}:{ip}`    | string  | first-access marker                 |
//!
//! Resources are integers, so the literal segments `day` and `dedup` never collide with a
//! resource segment.

use std::fmt;
use std::net::IpAddr;

use chrono::NaiveDate;

use crate::{AnalyticsError, Operation, ResourceId};

/// Format of dates in keys and hash fields.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Formats a day bucket as it appears in keys and hash fields.
pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parses a day bucket from a key segment or hash field.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

/// The two cardinality sketches kept per day.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Granularity {
    /// All visitors, authenticated or not.
    Visitors,
    /// Authenticated users only.
    Members,
}

impl Granularity {
    /// All granularities in the order the compactor processes them.
    pub const ALL: [Self; 2] = [Self::Visitors, Self::Members];

    /// Returns the key segment of this granularity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visitors => "uv",
            Self::Members => "member",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "uv" => Some(Self::Visitors),
            "member" => Some(Self::Members),
            _ => None,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys written for every event of a day.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DayKeys {
    /// Sketch of all visitors.
    pub visitors: String,
    /// Sketch of authenticated users.
    pub members: String,
    /// Hash of exact page views, keyed by date.
    pub views: String,
}

/// Components of a parsed day sketch key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SketchKey {
    /// The measured resource.
    pub resource: ResourceId,
    /// The measured operation.
    pub operation: Operation,
    /// Which of the day sketches this is.
    pub granularity: Granularity,
    /// The day bucket.
    pub date: NaiveDate,
}

/// Escapes glob metacharacters so that `literal` only matches itself in a scan pattern.
fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Maps resources, operations and time buckets to store keys.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    /// Creates a namespace with all keys starting with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Returns the key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns all keys updated when recording an event on `date`.
    pub fn day_keys(&self, resource: ResourceId, operation: Operation, date: NaiveDate) -> DayKeys {
        DayKeys {
            visitors: self.sketch(resource, operation, Granularity::Visitors, date),
            members: self.sketch(resource, operation, Granularity::Members, date),
            views: self.views(resource, operation),
        }
    }

    /// Returns the raw day sketch of the given granularity.
    pub fn sketch(
        &self,
        resource: ResourceId,
        operation: Operation,
        granularity: Granularity,
        date: NaiveDate,
    ) -> String {
        let date = date.format(DATE_FORMAT);
        format!("{}:{resource}:{operation}:day:{granularity}:{date}", self.prefix)
    }

    /// Returns the durable hash holding finalized counts of the given granularity.
    pub fn snapshot(
        &self,
        resource: ResourceId,
        operation: Operation,
        granularity: Granularity,
    ) -> String {
        format!("{}:{resource}:{operation}:day:{granularity}", self.prefix)
    }

    /// Returns the hash of exact page views per date.
    pub fn views(&self, resource: ResourceId, operation: Operation) -> String {
        format!("{}:{resource}:{operation}:day:pv", self.prefix)
    }

    /// Returns the all-time page view counter.
    pub fn total(&self, resource: ResourceId, operation: Operation) -> String {
        format!("{}:{resource}:{operation}:total:pv", self.prefix)
    }

    /// Returns the hash of page views per epoch minute.
    pub fn realtime(&self, resource: ResourceId, operation: Operation) -> String {
        format!("{}:{resource}:{operation}:realtime", self.prefix)
    }

    /// Returns the cached weekly sketch for the week ending before `date`.
    pub fn weekly(&self, resource: ResourceId, operation: Operation, date: NaiveDate) -> String {
        let date = date.format(DATE_FORMAT);
        format!("{}:{resource}:{operation}:weekly:{date}", self.prefix)
    }

    /// Returns the sorted set ranking resources by folded realtime views of a day.
    pub fn rank(&self, operation: Operation, date: NaiveDate) -> String {
        let date = date.format(DATE_FORMAT);
        format!("{}:day:rank:{operation}:{date}", self.prefix)
    }

    /// Returns the first-access marker of a client on a day.
    pub fn dedup(
        &self,
        resource: ResourceId,
        operation: Operation,
        date: NaiveDate,
        ip: IpAddr,
    ) -> String {
        let date = date.format(DATE_FORMAT);
        format!("{}:dedup:{resource}:{operation}:{date}:{ip}", self.prefix)
    }

    /// Returns the scan pattern matching all raw day sketches of a granularity.
    pub fn sketch_pattern(&self, granularity: Granularity) -> String {
        format!("{}:*:day:{granularity}:*", escape_glob(&self.prefix))
    }

    /// Returns the scan pattern matching all realtime hashes.
    pub fn realtime_pattern(&self) -> String {
        format!("{}:*:realtime", escape_glob(&self.prefix))
    }

    /// Parses a key produced by [`sketch`](Self::sketch).
    pub fn parse_sketch(&self, key: &str) -> Result<SketchKey, AnalyticsError> {
        let invalid = || AnalyticsError::InvalidKeyShape {
            key: key.to_owned(),
        };

        let rest = self.strip_prefix(key).ok_or_else(invalid)?;
        let mut segments = rest.split(':');

        let (Some(resource), Some(operation), Some("day"), Some(granularity), Some(date), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(invalid());
        };

        Ok(SketchKey {
            resource: resource.parse().map_err(|_| invalid())?,
            operation: operation.parse().map_err(|_| invalid())?,
            granularity: Granularity::parse(granularity).ok_or_else(invalid)?,
            date: parse_date(date).ok_or_else(invalid)?,
        })
    }

    /// Parses a key produced by [`realtime`](Self::realtime).
    pub fn parse_realtime(&self, key: &str) -> Result<(ResourceId, Operation), AnalyticsError> {
        let invalid = || AnalyticsError::InvalidKeyShape {
            key: key.to_owned(),
        };

        let rest = self.strip_prefix(key).ok_or_else(invalid)?;
        let mut segments = rest.split(':');

        let (Some(resource), Some(operation), Some("realtime"), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(invalid());
        };

        let resource = resource.parse().map_err(|_| invalid())?;
        let operation = operation.parse().map_err(|_| invalid())?;
        Ok((resource, operation))
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?.strip_prefix(':')
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new("analytics")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn test_key_shapes() {
        let ns = KeyNamespace::default();
        let resource = ResourceId(42);
        let op = Operation::Download;

        assert_eq!(
            ns.day_keys(resource, op, date(9)),
            DayKeys {
                visitors: "analytics:42:download:day:uv:2024-03-09".to_owned(),
                members: "analytics:42:download:day:member:2024-03-09".to_owned(),
                views: "analytics:42:download:day:pv".to_owned(),
            }
        );

        assert_eq!(
            ns.snapshot(resource, op, Granularity::Visitors),
            "analytics:42:download:day:uv"
        );
        assert_eq!(
            ns.snapshot(resource, op, Granularity::Members),
            "analytics:42:download:day:member"
        );
        assert_eq!(ns.total(resource, op), "analytics:42:download:total:pv");
        assert_eq!(ns.realtime(resource, op), "analytics:42:download:realtime");
        assert_eq!(
            ns.weekly(resource, op, date(9)),
            "analytics:42:download:weekly:2024-03-09"
        );
        assert_eq!(
            ns.rank(Operation::PageView, date(9)),
            "analytics:day:rank:page_view:2024-03-09"
        );
        assert_eq!(
            ns.dedup(resource, op, date(9), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            "analytics:dedup:42:download:2024-03-09:10.0.0.1"
        );
    }

    #[test]
    fn test_custom_prefix() {
        let ns = KeyNamespace::new("staging:analytics");
        let key = ns.sketch(ResourceId(1), Operation::Update, Granularity::Members, date(1));
        assert_eq!(key, "staging:analytics:1:update:day:member:2024-03-01");
        assert_eq!(ns.parse_sketch(&key).unwrap().resource, ResourceId(1));
        assert_eq!(
            ns.sketch_pattern(Granularity::Visitors),
            "staging:analytics:*:day:uv:*"
        );
    }

    #[test]
    fn test_patterns_escape_prefix() {
        let ns = KeyNamespace::new("tenant[1]*");
        assert_eq!(ns.realtime_pattern(), r"tenant\[1\]\*:*:realtime");
        assert_eq!(
            ns.sketch_pattern(Granularity::Members),
            r"tenant\[1\]\*:*:day:member:*"
        );
    }

    #[test]
    fn test_keys_are_distinct() {
        let ns = KeyNamespace::default();
        let mut keys = HashSet::new();

        for resource in [ResourceId(1), ResourceId(12), ResourceId(-1)] {
            for op in Operation::ALL {
                for day in [1, 2] {
                    for granularity in Granularity::ALL {
                        assert!(keys.insert(ns.sketch(resource, op, granularity, date(day))));
                    }
                    assert!(keys.insert(ns.weekly(resource, op, date(day))));
                }
                for granularity in Granularity::ALL {
                    assert!(keys.insert(ns.snapshot(resource, op, granularity)));
                }
                assert!(keys.insert(ns.views(resource, op)));
                assert!(keys.insert(ns.total(resource, op)));
                assert!(keys.insert(ns.realtime(resource, op)));
            }
        }

        for op in Operation::ALL {
            for day in [1, 2] {
                assert!(keys.insert(ns.rank(op, date(day))));
            }
        }
    }

    #[test]
    fn test_parse_sketch_roundtrip() {
        let ns = KeyNamespace::default();

        for op in Operation::ALL {
            for granularity in Granularity::ALL {
                let key = ns.sketch(ResourceId(42), op, granularity, date(9));
                assert_eq!(
                    ns.parse_sketch(&key).unwrap(),
                    SketchKey {
                        resource: ResourceId(42),
                        operation: op,
                        granularity,
                        date: date(9),
                    }
                );
            }
        }
    }

    #[test]
    fn test_parse_realtime_roundtrip() {
        let ns = KeyNamespace::default();

        for op in Operation::ALL {
            let key = ns.realtime(ResourceId(-3), op);
            assert_eq!(ns.parse_realtime(&key).unwrap(), (ResourceId(-3), op));
        }
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        let ns = KeyNamespace::default();

        let invalid = [
            "analytics:42:download:day:uv",
            "analytics:42:download:day:pv:2024-03-09",
            "analytics:42:install:day:uv:2024-03-09",
            "analytics:x:download:day:uv:2024-03-09",
            "analytics:42:download:day:uv:2024-13-09",
            "analytics:42:download:day:uv:2024-03-09:extra",
            "other:42:download:day:uv:2024-03-09",
            "analytics42:download:day:uv:2024-03-09",
        ];

        for key in invalid {
            assert!(
                matches!(ns.parse_sketch(key), Err(AnalyticsError::InvalidKeyShape { .. })),
                "{key} should be rejected"
            );
        }

        assert!(ns.parse_realtime("analytics:42:download:realtime:1").is_err());
        assert!(ns.parse_realtime("analytics:day:rank:realtime").is_err());
    }

    #[test]
    fn test_dedup_key_ipv6() {
        let ns = KeyNamespace::default();
        let key = ns.dedup(
            ResourceId(42),
            Operation::Update,
            date(9),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        );
        assert_eq!(key, "analytics:dedup:42:update:2024-03-09:::1");
    }

    #[test]
    fn test_date_field() {
        assert_eq!(format_date(date(9)), "2024-03-09");
        assert_eq!(parse_date("2024-03-09"), Some(date(9)));
        assert_eq!(parse_date("1710000000"), None);
    }
}
