use std::{fmt, str::FromStr};

use snafu::Snafu;

use super::Dimensions;

/// Error returned when parsing an unknown metric type code.
#[derive(Debug, Snafu)]
#[snafu(display("Unknown metric type code '{}'.", code))]
pub struct MetricTypeError {
    code: String,
}

/// Metric type, as requested by the submitter.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricType {
    /// Last value wins (`g`).
    Gauge,

    /// Summed, then emitted as a per-second rate (`c`).
    Counter,

    /// Distribution summarized into statistics and percentiles (`h`, and `ms` for timers).
    Histogram,

    /// Count of unique values (`s`).
    Set,

    /// Per-second rate computed from successive samples of a monotonic value (`_dd-r` or `rate`).
    Rate,
}

impl MetricType {
    /// Returns the canonical type code.
    pub const fn type_code(&self) -> &'static str {
        match self {
            Self::Gauge => "g",
            Self::Counter => "c",
            Self::Histogram => "h",
            Self::Set => "s",
            Self::Rate => "rate",
        }
    }
}

impl FromStr for MetricType {
    type Err = MetricTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "g" => Ok(Self::Gauge),
            "c" => Ok(Self::Counter),
            "h" | "ms" => Ok(Self::Histogram),
            "s" => Ok(Self::Set),
            "_dd-r" | "rate" => Ok(Self::Rate),
            other => Err(MetricTypeError { code: other.to_string() }),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_code())
    }
}

/// A single value submitted for aggregation.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    /// Metric name.
    pub name: String,

    /// Value.
    pub value: f64,

    /// How the value is aggregated.
    pub metric_type: MetricType,

    /// Dimensions.
    pub dimensions: Dimensions,

    /// Tenant the value is submitted on behalf of.
    pub delegated_tenant: Option<String>,

    /// Host the value describes.
    pub hostname: Option<String>,

    /// Device the value describes, such as a disk or network interface.
    pub device_name: Option<String>,

    /// Unix timestamp, in seconds. The aggregator's current time is used when unset.
    pub timestamp: Option<u64>,

    /// Fraction of events that were actually sampled, in `(0, 1]`.
    pub sample_rate: f64,
}

impl MetricSample {
    /// Creates a sample with no dimensions, no timestamp, and a sample rate of 1.
    pub fn new<N: Into<String>>(name: N, value: f64, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            value,
            metric_type,
            dimensions: Dimensions::new(),
            delegated_tenant: None,
            hostname: None,
            device_name: None,
            timestamp: None,
            sample_rate: 1.0,
        }
    }

    /// Creates a gauge sample.
    pub fn gauge<N: Into<String>>(name: N, value: f64) -> Self {
        Self::new(name, value, MetricType::Gauge)
    }

    /// Creates a counter sample.
    pub fn counter<N: Into<String>>(name: N, value: f64) -> Self {
        Self::new(name, value, MetricType::Counter)
    }

    /// Creates a histogram sample.
    pub fn histogram<N: Into<String>>(name: N, value: f64) -> Self {
        Self::new(name, value, MetricType::Histogram)
    }

    /// Creates a set sample.
    pub fn set<N: Into<String>>(name: N, value: f64) -> Self {
        Self::new(name, value, MetricType::Set)
    }

    /// Creates a rate sample.
    pub fn rate<N: Into<String>>(name: N, value: f64) -> Self {
        Self::new(name, value, MetricType::Rate)
    }

    /// Sets the dimensions.
    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Adds a single dimension.
    pub fn with_dimension<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    /// Sets the delegated tenant.
    pub fn with_delegated_tenant<T: Into<String>>(mut self, tenant: T) -> Self {
        self.delegated_tenant = Some(tenant.into());
        self
    }

    /// Sets the hostname.
    pub fn with_hostname<H: Into<String>>(mut self, hostname: H) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets the device name.
    pub fn with_device_name<D: Into<String>>(mut self, device_name: D) -> Self {
        self.device_name = Some(device_name.into());
        self
    }

    /// Sets the timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the sample rate.
    ///
    /// Rates outside of `(0, 1]` are treated as 1.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Returns the multiplier that scales this sample up to the number of events it represents.
    pub fn sample_weight(&self) -> f64 {
        if self.sample_rate > 0.0 && self.sample_rate <= 1.0 {
            1.0 / self.sample_rate
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_type_codes() {
        let cases = [
            ("g", MetricType::Gauge),
            ("c", MetricType::Counter),
            ("h", MetricType::Histogram),
            ("ms", MetricType::Histogram),
            ("s", MetricType::Set),
            ("_dd-r", MetricType::Rate),
            ("rate", MetricType::Rate),
        ];
        for (code, expected) in cases {
            assert_eq!(code.parse::<MetricType>().unwrap(), expected, "code {}", code);
        }

        let err = "d".parse::<MetricType>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown metric type code 'd'.");
    }

    #[test]
    fn sample_weight_ignores_invalid_rates() {
        assert_eq!(MetricSample::counter("x", 1.0).with_sample_rate(0.25).sample_weight(), 4.0);
        assert_eq!(MetricSample::counter("x", 1.0).with_sample_rate(0.0).sample_weight(), 1.0);
        assert_eq!(MetricSample::counter("x", 1.0).with_sample_rate(3.0).sample_weight(), 1.0);
    }
}
