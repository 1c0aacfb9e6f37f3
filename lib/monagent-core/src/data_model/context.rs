use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use super::{Dimensions, MetricSample};

/// The identity samples are aggregated under.
///
/// A context is derived from the metric name, its dimensions, the delegated tenant, and the originating host and
/// device. Two samples with equal values for all five land in the same aggregation state.
///
/// Contexts are cheap to clone, and their hash is computed once, at creation.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    name: String,
    dimensions: Dimensions,
    delegated_tenant: Option<String>,
    hostname: Option<String>,
    device_name: Option<String>,
    emitted_dimensions: Dimensions,
    hash: u64,
}

impl Context {
    /// Creates a context from its parts.
    pub fn new(
        name: String, dimensions: Dimensions, delegated_tenant: Option<String>, hostname: Option<String>,
        device_name: Option<String>,
    ) -> Self {
        let hash = hash_context(&name, &dimensions, &delegated_tenant, &hostname, &device_name);

        let mut emitted_dimensions = dimensions.clone();
        if let Some(hostname) = &hostname {
            emitted_dimensions.insert("hostname".to_string(), hostname.clone());
        }
        if let Some(device_name) = &device_name {
            emitted_dimensions.insert("device".to_string(), device_name.clone());
        }

        Self {
            inner: Arc::new(ContextInner {
                name,
                dimensions,
                delegated_tenant,
                hostname,
                device_name,
                emitted_dimensions,
                hash,
            }),
        }
    }

    /// Creates the context a sample aggregates under.
    pub fn from_sample(sample: &MetricSample) -> Self {
        Self::new(
            sample.name.clone(),
            sample.dimensions.clone(),
            sample.delegated_tenant.clone(),
            sample.hostname.clone(),
            sample.device_name.clone(),
        )
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the dimensions the sample was submitted with.
    pub fn dimensions(&self) -> &Dimensions {
        &self.inner.dimensions
    }

    /// Returns the delegated tenant.
    pub fn delegated_tenant(&self) -> Option<&str> {
        self.inner.delegated_tenant.as_deref()
    }

    /// Returns the originating hostname.
    pub fn hostname(&self) -> Option<&str> {
        self.inner.hostname.as_deref()
    }

    /// Returns the originating device name.
    pub fn device_name(&self) -> Option<&str> {
        self.inner.device_name.as_deref()
    }

    /// Returns the dimensions measurements for this context are emitted with.
    ///
    /// These are the submitted dimensions plus `hostname` and `device`, when set.
    pub fn emitted_dimensions(&self) -> &Dimensions {
        &self.inner.emitted_dimensions
    }
}

// Dimensions are already sorted, so hashing them in order is stable regardless of submission order.
fn hash_context(
    name: &str, dimensions: &Dimensions, delegated_tenant: &Option<String>, hostname: &Option<String>,
    device_name: &Option<String>,
) -> u64 {
    let mut hasher = ahash::AHasher::default();
    name.hash(&mut hasher);
    for (key, value) in dimensions {
        key.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    delegated_tenant.hash(&mut hasher);
    hostname.hash(&mut hasher);
    device_name.hash(&mut hasher);
    hasher.finish()
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }

        self.inner.hash == other.inner.hash
            && self.inner.name == other.inner.name
            && self.inner.dimensions == other.inner.dimensions
            && self.inner.delegated_tenant == other.inner.delegated_tenant
            && self.inner.hostname == other.inner.hostname
            && self.inner.device_name == other.inner.device_name
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.inner.hash);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.name)
            .field("dimensions", &self.inner.dimensions)
            .field("delegated_tenant", &self.inner.delegated_tenant)
            .field("hostname", &self.inner.hostname)
            .field("device_name", &self.inner.device_name)
            .finish()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.name)?;
        if !self.inner.emitted_dimensions.is_empty() {
            write!(f, "{{")?;
            for (i, (key, value)) in self.inner.emitted_dimensions.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}={}", key, value)?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}
