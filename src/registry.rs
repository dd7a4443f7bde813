//! Process-wide store of measures, views, and the reporting period.
//!
//! Single writer (the dispatcher thread), many readers. Measures are never
//! destroyed once created; views may be removed by name.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Declared type of a measure's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureKind {
    Int,
    Float,
    Unknown,
}

impl MeasureKind {
    pub fn from_wire(tag: u8) -> Self {
        match tag {
            1 => MeasureKind::Int,
            2 => MeasureKind::Float,
            _ => MeasureKind::Unknown,
        }
    }
}

/// A named measure: the thing views aggregate and records submit against.
#[derive(Debug, Clone)]
pub struct Measure {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: MeasureKind,
}

/// How a view aggregates the measurements bound to it.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    None,
    Count,
    Sum,
    Distribution { boundaries: Vec<f64> },
    LastValue,
}

impl Aggregation {
    pub fn from_wire(tag: u64, boundaries: Vec<f64>) -> Option<Self> {
        match tag {
            0 => Some(Aggregation::None),
            1 => Some(Aggregation::Count),
            2 => Some(Aggregation::Sum),
            3 => Some(Aggregation::Distribution { boundaries }),
            4 => Some(Aggregation::LastValue),
            _ => None,
        }
    }
}

/// A named view: a reporting lens over one measure, tagged by a set of keys.
#[derive(Debug, Clone)]
pub struct View {
    pub name: String,
    pub description: String,
    pub tag_keys: Vec<String>,
    pub measure_name: String,
    pub aggregation: Aggregation,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown measure '{0}' referenced by view")]
    UnknownMeasure(String),
}

#[derive(Default)]
struct RegistryState {
    measures: HashMap<String, Measure>,
    views: HashMap<String, View>,
    reporting_period: Option<Duration>,
}

/// The shared measures/views/reporting-period store.
///
/// Cloning a `Registry` is cheap and shares the same underlying lock, in the
/// style of the daemon's connection-per-thread handles that all need a
/// reference to the one process-wide registry.
#[derive(Clone, Default)]
pub struct Registry {
    inner: std::sync::Arc<RwLock<RegistryState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a measure if its name is not already registered. First
    /// definition wins: a second `MeasureCreate` for the same name is a
    /// silent no-op, since many workers independently declare the same
    /// metric.
    pub fn create_measure(&self, measure: Measure) {
        let mut state = self.inner.write();
        state.measures.entry(measure.name.clone()).or_insert(measure);
    }

    pub fn measure(&self, name: &str) -> Option<Measure> {
        self.inner.read().measures.get(name).cloned()
    }

    /// Register a batch of views atomically: if any view references an
    /// unknown measure, none of the batch is registered.
    pub fn register_views(&self, views: Vec<View>) -> Result<(), RegistryError> {
        let mut state = self.inner.write();
        for view in &views {
            if !state.measures.contains_key(&view.measure_name) {
                return Err(RegistryError::UnknownMeasure(view.measure_name.clone()));
            }
        }
        for view in views {
            state.views.insert(view.name.clone(), view);
        }
        Ok(())
    }

    pub fn unregister_views(&self, names: &[String]) {
        let mut state = self.inner.write();
        for name in names {
            state.views.remove(name);
        }
    }

    pub fn view(&self, name: &str) -> Option<View> {
        self.inner.read().views.get(name).cloned()
    }

    pub fn set_reporting_period(&self, period: Duration) {
        self.inner.write().reporting_period = Some(period);
    }

    pub fn reporting_period(&self) -> Option<Duration> {
        self.inner.read().reporting_period
    }

    pub fn measure_count(&self) -> usize {
        self.inner.read().measures.len()
    }

    pub fn view_count(&self) -> usize {
        self.inner.read().views.len()
    }
}
