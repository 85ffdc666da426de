/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Pass/fail thresholds declared by a k6 script.
//!
//! Only the `http_req_failed` and `http_req_duration` blocks are read. Each string entry in
//! those arrays is matched against `stat<value` or `stat<=value`; anything else (tagged
//! sub-metrics, `>` comparisons, other metrics) is ignored.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::OnceLock};
use tracing::debug;

pub const DEFAULT_ERROR_RATE: f64 = 0.01;
pub const DEFAULT_LATENCY_P95_MS: f64 = 500.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "metric", content = "stat", rename_all = "snake_case")]
pub enum ThresholdMetric {
    /// Fraction of failed requests, 0.0..=1.0
    ErrorRate,
    /// Request duration statistic in milliseconds, keyed the way k6 names it (`avg`, `p(95)`).
    Latency(String),
}
impl ThresholdMetric {
    pub fn name(&self) -> String {
        match self {
            ThresholdMetric::ErrorRate => "error_rate".to_string(),
            ThresholdMetric::Latency(stat) => {
                let stat = stat
                    .strip_prefix("p(")
                    .and_then(|s| s.strip_suffix(')'))
                    .map(|n| format!("p{n}"))
                    .unwrap_or_else(|| stat.clone());
                format!("latency_{stat}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: ThresholdMetric,
    pub ceiling: f64,
    /// `<=` instead of `<`
    #[serde(default)]
    pub inclusive: bool,
}
impl Threshold {
    pub fn strict(metric: ThresholdMetric, ceiling: f64) -> Self {
        Self {
            metric,
            ceiling,
            inclusive: false,
        }
    }

    /// An unknown observation never passes.
    pub fn passes(&self, observed: Option<f64>) -> bool {
        match observed {
            Some(v) if self.inclusive => v <= self.ceiling,
            Some(v) => v < self.ceiling,
            None => false,
        }
    }
}
impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.inclusive { "<=" } else { "<" };
        write!(f, "{} {} {}", self.metric.name(), op, self.ceiling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    Script,
    Defaults,
}

/// Thresholds keyed by name. Built once per workload script and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    thresholds: BTreeMap<String, Threshold>,
    source: ThresholdSource,
}
impl ThresholdSet {
    pub fn defaults() -> Self {
        Self::from_thresholds(
            vec![
                Threshold::strict(ThresholdMetric::ErrorRate, DEFAULT_ERROR_RATE),
                Threshold::strict(
                    ThresholdMetric::Latency("p(95)".to_string()),
                    DEFAULT_LATENCY_P95_MS,
                ),
            ],
            ThresholdSource::Defaults,
        )
    }

    fn from_thresholds(thresholds: Vec<Threshold>, source: ThresholdSource) -> Self {
        let thresholds = thresholds
            .into_iter()
            .map(|t| (t.metric.name(), t))
            .collect();
        Self { thresholds, source }
    }

    pub fn source(&self) -> ThresholdSource {
        self.source
    }

    pub fn get(&self, name: &str) -> Option<&Threshold> {
        self.thresholds.get(name)
    }

    /// Thresholds ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Threshold)> {
        self.thresholds.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }
}

struct Patterns {
    failed_block: Regex,
    duration_block: Regex,
    quoted: Regex,
    expression: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                failed_block: Regex::new(r#"["'`]?http_req_failed["'`]?\s*:\s*\[([^\]]*)\]"#)
                    .ok()?,
                duration_block: Regex::new(r#"["'`]?http_req_duration["'`]?\s*:\s*\[([^\]]*)\]"#)
                    .ok()?,
                quoted: Regex::new(r#"['"`]([^'"`]*)['"`]"#).ok()?,
                expression: Regex::new(
                    r"^\s*(rate|avg|med|min|max|p\(\s*\d+(?:\.\d+)?\s*\))\s*(<=|<)\s*(\d*\.?\d+)\s*$",
                )
                .ok()?,
            })
        })
        .as_ref()
}

/// Reads the thresholds declared in a k6 script. Never fails: when nothing is recognised the
/// defaults (`error_rate < 0.01`, `latency_p95 < 500`) are returned.
pub fn extract(script: &str) -> ThresholdSet {
    let Some(p) = patterns() else {
        return ThresholdSet::defaults();
    };

    let mut found = Vec::new();
    for (block, is_duration) in [(&p.failed_block, false), (&p.duration_block, true)] {
        for caps in block.captures_iter(script) {
            let Some(body) = caps.get(1) else { continue };

            for quoted in p.quoted.captures_iter(body.as_str()) {
                let Some(expr) = quoted.get(1) else { continue };
                if let Some(threshold) = parse_expression(&p.expression, expr.as_str(), is_duration)
                {
                    found.push(threshold);
                }
            }
        }
    }

    if found.is_empty() {
        debug!("no thresholds recognised, using defaults");
        return ThresholdSet::defaults();
    }
    ThresholdSet::from_thresholds(found, ThresholdSource::Script)
}

fn parse_expression(re: &Regex, expr: &str, is_duration: bool) -> Option<Threshold> {
    let caps = re.captures(expr)?;
    let stat = caps.get(1)?.as_str().replace(char::is_whitespace, "");
    let inclusive = caps.get(2)?.as_str() == "<=";
    let ceiling = caps.get(3)?.as_str().parse::<f64>().ok()?;

    let metric = match (is_duration, stat.as_str()) {
        (false, "rate") => ThresholdMetric::ErrorRate,
        (true, "rate") | (false, _) => return None,
        (true, _) => ThresholdMetric::Latency(stat),
    };
    Some(Threshold {
        metric,
        ceiling,
        inclusive,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_rate_only() {
        let set = extract("export const options = { thresholds: { http_req_failed: ['rate<0.01'] } };");

        assert_eq!(set.len(), 1);
        assert_eq!(set.source(), ThresholdSource::Script);
        let t = set.get("error_rate").unwrap();
        assert_eq!(t.ceiling, 0.01);
        assert!(!t.inclusive);
    }

    #[test]
    fn no_thresholds_fall_back_to_defaults() {
        let set = extract("import http from 'k6/http';\nexport default function () {}");

        assert_eq!(set, ThresholdSet::defaults());
        assert_eq!(set.get("error_rate").map(|t| t.ceiling), Some(0.01));
        assert_eq!(set.get("latency_p95").map(|t| t.ceiling), Some(500.0));
    }

    #[test]
    fn duration_statistics_and_quote_styles() {
        let script = r#"
            export const options = {
              vus: 50,
              thresholds: {
                "http_req_duration": ["avg<400", `p(95)<=600`, 'p(99.9) < 1500', 'max>10'],
                'http_req_failed': [{ threshold: 'rate<=0.05', abortOnFail: true }],
              },
            };
        "#;
        let set = extract(script);

        assert_eq!(set.len(), 4);
        assert_eq!(set.get("latency_avg").map(|t| t.ceiling), Some(400.0));
        let p95 = set.get("latency_p95").unwrap();
        assert!(p95.inclusive);
        assert_eq!(p95.metric, ThresholdMetric::Latency("p(95)".to_string()));
        assert_eq!(set.get("latency_p99.9").map(|t| t.ceiling), Some(1500.0));
        assert!(set.get("error_rate").unwrap().inclusive);
    }

    #[test]
    fn tagged_sub_metrics_are_ignored() {
        let set = extract("thresholds: { 'http_req_duration{type:static}': ['p(95)<100'] }");
        assert_eq!(set.source(), ThresholdSource::Defaults);
    }

    #[test]
    fn comparison_honours_inclusiveness() {
        let strict = Threshold::strict(ThresholdMetric::ErrorRate, 0.01);
        let inclusive = Threshold {
            inclusive: true,
            ..strict.clone()
        };

        assert!(!strict.passes(Some(0.01)));
        assert!(inclusive.passes(Some(0.01)));
        assert!(strict.passes(Some(0.0)));
        assert!(!inclusive.passes(None));
    }
}
