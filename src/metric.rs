//! Performance metrics and the registry that validates their identifiers.

use crate::measure::MeasureError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Wall-clock seconds between the start and stop of a measuring window.
pub const WALL_CLOCK_TIME: &str = "wall_clock_time";

/// Samples one quantity across a single measuring window.
pub trait MetricProbe: Send {
    /// Called when the window opens.
    fn start(&mut self);

    /// Called when the window closes; returns the sample for that window.
    fn stop(&mut self) -> f64;
}

/// Probe behind [`WALL_CLOCK_TIME`].
#[derive(Debug, Default)]
pub struct WallClockProbe {
    started: Option<Instant>,
}

impl MetricProbe for WallClockProbe {
    fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    fn stop(&mut self) -> f64 {
        self.started
            .take()
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or_default()
    }
}

type ProbeFactory = Arc<dyn Fn() -> Box<dyn MetricProbe> + Send + Sync>;

/// A registered metric: identifier, unit and how to build a probe.
#[derive(Clone)]
pub struct MetricDescriptor {
    id: String,
    unit: String,
    isolated: bool,
    factory: ProbeFactory,
}

impl MetricDescriptor {
    pub fn new<F>(id: impl Into<String>, unit: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn MetricProbe> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            unit: unit.into(),
            isolated: false,
            factory: Arc::new(factory),
        }
    }

    /// Mark a metric whose probe disturbs other metrics. Isolated metrics are
    /// sampled on their own set of block iterations.
    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    pub(crate) fn probe(&self) -> Box<dyn MetricProbe> {
        (self.factory)()
    }
}

impl fmt::Debug for MetricDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDescriptor")
            .field("id", &self.id)
            .field("unit", &self.unit)
            .field("isolated", &self.isolated)
            .finish_non_exhaustive()
    }
}

/// Known metric identifiers.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    metrics: BTreeMap<String, MetricDescriptor>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(MetricDescriptor::new(WALL_CLOCK_TIME, "s", || {
            Box::new(WallClockProbe::default())
        }));
        registry
    }
}

impl MetricRegistry {
    /// Registry with the built-in metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with no metrics at all.
    pub fn empty() -> Self {
        Self {
            metrics: BTreeMap::new(),
        }
    }

    /// Add or replace a metric. Returns the replaced descriptor, if any.
    pub fn register(&mut self, descriptor: MetricDescriptor) -> Option<MetricDescriptor> {
        self.metrics.insert(descriptor.id.clone(), descriptor)
    }

    pub fn get(&self, id: &str) -> Option<&MetricDescriptor> {
        self.metrics.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.metrics.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    /// Look up every identifier, keeping request order and dropping repeats.
    /// The first unknown identifier fails the whole lookup.
    pub fn resolve(&self, ids: &[&str]) -> Result<Vec<MetricDescriptor>, MeasureError> {
        let mut resolved: Vec<MetricDescriptor> = Vec::with_capacity(ids.len());
        for id in ids {
            let descriptor = self
                .get(id)
                .ok_or_else(|| MeasureError::UnknownMetric(id.to_string()))?;
            if !resolved.iter().any(|d| d.id == descriptor.id) {
                resolved.push(descriptor.clone());
            }
        }
        Ok(resolved)
    }
}

/// Split metrics into groups that can share block iterations.
///
/// All non-isolated metrics share the first group; every isolated metric
/// gets a group of its own.
pub fn group_metrics(metrics: &[MetricDescriptor]) -> Vec<Vec<MetricDescriptor>> {
    let shared: Vec<_> = metrics.iter().filter(|m| !m.isolated).cloned().collect();
    let mut groups = Vec::new();
    if !shared.is_empty() {
        groups.push(shared);
    }
    groups.extend(metrics.iter().filter(|m| m.isolated).map(|m| vec![m.clone()]));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantProbe(f64);

    impl MetricProbe for ConstantProbe {
        fn start(&mut self) {}
        fn stop(&mut self) -> f64 {
            self.0
        }
    }

    fn constant(id: &str, value: f64) -> MetricDescriptor {
        MetricDescriptor::new(id, "units", move || Box::new(ConstantProbe(value)))
    }

    #[test]
    fn should_contain_wall_clock_by_default() {
        let registry = MetricRegistry::new();
        assert!(registry.contains(WALL_CLOCK_TIME));
        assert_eq!(registry.get(WALL_CLOCK_TIME).unwrap().unit(), "s");
    }

    #[test]
    fn should_fail_resolve_when_metric_unknown() {
        let registry = MetricRegistry::new();
        let err = registry.resolve(&[WALL_CLOCK_TIME, "bogus"]).unwrap_err();
        assert_eq!(err, MeasureError::UnknownMetric("bogus".to_string()));
    }

    #[test]
    fn should_dedupe_when_resolving() {
        let registry = MetricRegistry::new();
        let resolved = registry
            .resolve(&[WALL_CLOCK_TIME, WALL_CLOCK_TIME])
            .unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn should_group_isolated_metrics_separately() {
        let metrics = vec![
            constant("a", 1.0),
            constant("b", 2.0).isolated(true),
            constant("c", 3.0),
            constant("d", 4.0).isolated(true),
        ];
        let groups = group_metrics(&metrics);
        let ids: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|m| m.id()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a", "c"], vec!["b"], vec!["d"]]);
    }

    #[test]
    fn should_measure_elapsed_wall_clock() {
        let mut probe = WallClockProbe::default();
        probe.start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let elapsed = probe.stop();
        assert!(elapsed >= 0.005);
        assert_eq!(probe.stop(), 0.0);
    }

    #[test]
    fn should_replace_metric_when_registered_twice() {
        let mut registry = MetricRegistry::empty();
        assert!(registry.register(constant("x", 1.0)).is_none());
        assert!(registry.register(constant("x", 2.0)).is_some());
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["x"]);
    }
}
