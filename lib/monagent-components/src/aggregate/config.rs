use serde::Deserialize;

/// A statistic computed from a histogram's samples at flush time.
#[derive(Clone, Debug, PartialEq)]
pub enum HistogramStatistic {
    /// Number of events, as a per-second rate.
    Count,

    /// Sum of all samples.
    Sum,

    /// Smallest sample.
    Minimum,

    /// Largest sample.
    Maximum,

    /// Arithmetic mean of all samples.
    Average,

    /// Sample at index `round(n/2 - 1)` of the sorted samples.
    Median,

    /// Sample at index `round(q*n - 1)` of the sorted samples.
    Percentile {
        /// Quantile, between 0.0 and 1.0.
        q: f64,

        /// Name suffix, such as `95percentile`.
        suffix: String,
    },
}

impl HistogramStatistic {
    /// Returns the suffix appended to the metric name, after a `.`, for this statistic.
    pub fn suffix(&self) -> &str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Minimum => "min",
            Self::Maximum => "max",
            Self::Average => "avg",
            Self::Median => "median",
            Self::Percentile { suffix, .. } => suffix,
        }
    }

    /// Computes this statistic.
    ///
    /// `sorted` must be non-empty and sorted ascending. `count` is the sample-rate-weighted event count.
    pub fn compute(&self, sorted: &[f64], count: f64, interval_secs: f64) -> f64 {
        let n = sorted.len();
        match self {
            Self::Count => count / interval_secs,
            Self::Sum => sorted.iter().sum(),
            Self::Minimum => sorted[0],
            Self::Maximum => sorted[n - 1],
            Self::Average => sorted.iter().sum::<f64>() / n as f64,
            Self::Median => sorted[rank_index(n as f64 / 2.0 - 1.0, n)],
            Self::Percentile { q, .. } => sorted[rank_index(q * n as f64 - 1.0, n)],
        }
    }
}

/// Rounds `position` half away from zero and clamps it to a valid index for `n` elements.
fn rank_index(position: f64, n: usize) -> usize {
    let rounded = position.round();
    if rounded <= 0.0 {
        0
    } else {
        (rounded as usize).min(n - 1)
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RawHistogramConfiguration {
    /// Statistics to emit for each histogram: any of `min`, `max`, `median`, `avg`, `count`, and `sum`.
    histogram_aggregates: Vec<String>,

    /// Percentiles to emit for each histogram, as quantiles between 0.0 and 1.0.
    ///
    /// The name suffix truncates the quantile to a whole percent: 0.95 is emitted as `<name>.95percentile`.
    histogram_percentiles: Vec<f64>,
}

impl Default for RawHistogramConfiguration {
    fn default() -> Self {
        Self {
            histogram_aggregates: vec!["max".into(), "median".into(), "avg".into(), "count".into()],
            histogram_percentiles: vec![0.95],
        }
    }
}

/// Which statistics histograms emit on flush.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(try_from = "RawHistogramConfiguration")]
pub struct HistogramConfiguration {
    statistics: Vec<HistogramStatistic>,
}

impl HistogramConfiguration {
    /// Creates a configuration emitting exactly `statistics`, in order.
    pub fn from_statistics(statistics: &[HistogramStatistic]) -> Self {
        Self {
            statistics: statistics.to_vec(),
        }
    }

    /// Returns the statistics to emit, in order.
    pub fn statistics(&self) -> &[HistogramStatistic] {
        &self.statistics
    }
}

impl Default for HistogramConfiguration {
    fn default() -> Self {
        Self {
            statistics: vec![
                HistogramStatistic::Maximum,
                HistogramStatistic::Median,
                HistogramStatistic::Average,
                HistogramStatistic::Count,
                HistogramStatistic::Percentile {
                    q: 0.95,
                    suffix: "95percentile".into(),
                },
            ],
        }
    }
}

impl TryFrom<RawHistogramConfiguration> for HistogramConfiguration {
    type Error = String;

    fn try_from(raw: RawHistogramConfiguration) -> Result<Self, Self::Error> {
        let mut statistics = Vec::new();

        for aggregate in raw.histogram_aggregates {
            let statistic = match aggregate.as_str() {
                "count" => HistogramStatistic::Count,
                "sum" => HistogramStatistic::Sum,
                "min" => HistogramStatistic::Minimum,
                "max" => HistogramStatistic::Maximum,
                "avg" => HistogramStatistic::Average,
                "median" => HistogramStatistic::Median,
                _ => return Err(format!("Unknown histogram aggregate: {}", aggregate)),
            };
            statistics.push(statistic);
        }

        for quantile in raw.histogram_percentiles {
            if !(0.0..=1.0).contains(&quantile) {
                return Err(format!("Percentile out of range: {}", quantile));
            }

            // Multiplying straight to an integer percent can land one below, e.g. 0.29 -> 28, so go through
            // thousandths first.
            let suffix = format!("{}percentile", (quantile * 1000.0) as u32 / 10);
            statistics.push(HistogramStatistic::Percentile { q: quantile, suffix });
        }

        Ok(Self { statistics })
    }
}
