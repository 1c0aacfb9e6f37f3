//! Internal telemetry.
//!
//! Components describe their own health through the `metrics` crate. Nothing here installs a recorder: the embedding
//! process decides where, or whether, these values are exported.
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram, Label, SharedString};

/// Something usable as a telemetry label.
///
/// Accepts `"key:value"` strings and `("key", value)` tuples.
pub trait MetricTag {
    /// Converts `self` into a label.
    fn into_label(self) -> Label;
}

impl MetricTag for &'static str {
    fn into_label(self) -> Label {
        match self.split_once(':') {
            Some((key, value)) => Label::from_static_parts(key, value),
            None => Label::from_static_parts(self, ""),
        }
    }
}

impl<T> MetricTag for (&'static str, T)
where
    T: Into<SharedString>,
{
    fn into_label(self) -> Label {
        Label::new(SharedString::const_str(self.0), self.1.into())
    }
}

/// Registers telemetry handles that all carry the same base labels.
#[derive(Clone, Default)]
pub struct MetricsBuilder {
    default_tags: Vec<Label>,
}

impl MetricsBuilder {
    /// Creates a builder whose handles are labelled `component:<name>`.
    pub fn for_component(name: &'static str) -> Self {
        Self::default().add_default_tag(("component", name))
    }

    /// Adds a label to every handle registered from now on.
    pub fn add_default_tag<T: MetricTag>(mut self, tag: T) -> Self {
        self.default_tags.push(tag.into_label());
        self
    }

    fn tags_with<I, T>(&self, additional_tags: I) -> Vec<Label>
    where
        I: IntoIterator<Item = T>,
        T: MetricTag,
    {
        let mut tags = self.default_tags.clone();
        tags.extend(additional_tags.into_iter().map(MetricTag::into_label));
        tags
    }

    /// Registers a counter.
    pub fn register_counter(&self, metric_name: &'static str) -> Counter {
        counter!(metric_name, self.default_tags.clone())
    }

    /// Registers a counter with labels beyond the defaults.
    pub fn register_counter_with_tags<I, T>(&self, metric_name: &'static str, additional_tags: I) -> Counter
    where
        I: IntoIterator<Item = T>,
        T: MetricTag,
    {
        counter!(metric_name, self.tags_with(additional_tags))
    }

    /// Registers a gauge.
    pub fn register_gauge(&self, metric_name: &'static str) -> Gauge {
        gauge!(metric_name, self.default_tags.clone())
    }

    /// Registers a histogram.
    pub fn register_histogram(&self, metric_name: &'static str) -> Histogram {
        histogram!(metric_name, self.default_tags.clone())
    }
}
