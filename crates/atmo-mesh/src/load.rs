//! Local load estimation from device metrics.
//!
//! The number produced here is what a node advertises as `load` for its own
//! capabilities; peers turn it into a cost score when routing.

const CPU_WEIGHT: f64 = 0.4;
const MEMORY_WEIGHT: f64 = 0.3;
const BATTERY_WEIGHT: f64 = 0.3;

/// Device metrics supplied by the platform layer.
pub trait PlatformMetrics: Send + Sync {
    /// Battery charge 0..=100, `None` when there is no battery.
    fn battery_percent(&self) -> Option<f64>;

    /// Running on battery (not plugged in).
    fn is_on_battery(&self) -> bool;

    /// CPU utilisation 0..=1.
    fn cpu_load(&self) -> f64;

    fn available_memory_mb(&self) -> u64;

    /// 0 when unknown.
    fn total_memory_mb(&self) -> u64 {
        0
    }
}

/// Fixed metrics, for tests and hosts without a metrics source.
#[derive(Debug, Clone)]
pub struct StaticMetrics {
    pub battery: Option<f64>,
    pub on_battery: bool,
    pub cpu: f64,
    pub available_memory_mb: u64,
    pub total_memory_mb: u64,
}

impl Default for StaticMetrics {
    fn default() -> Self {
        Self {
            battery: None,
            on_battery: false,
            cpu: 0.0,
            available_memory_mb: 0,
            total_memory_mb: 0,
        }
    }
}

impl PlatformMetrics for StaticMetrics {
    fn battery_percent(&self) -> Option<f64> {
        self.battery
    }

    fn is_on_battery(&self) -> bool {
        self.on_battery
    }

    fn cpu_load(&self) -> f64 {
        self.cpu
    }

    fn available_memory_mb(&self) -> u64 {
        self.available_memory_mb
    }

    fn total_memory_mb(&self) -> u64 {
        self.total_memory_mb
    }
}

/// How much running on battery should discourage work, 0..=1.
pub fn battery_pressure(metrics: &dyn PlatformMetrics) -> f64 {
    if !metrics.is_on_battery() {
        return 0.1;
    }
    match metrics.battery_percent() {
        Some(p) if p <= 10.0 => 1.0,
        Some(p) if p <= 20.0 => 0.8,
        Some(p) => (1.0 - (p / 100.0) * 0.8).clamp(0.0, 1.0),
        None => 0.5,
    }
}

/// Fraction of memory in use, 0.5 when the total is unknown.
pub fn memory_pressure(metrics: &dyn PlatformMetrics) -> f64 {
    let total = metrics.total_memory_mb();
    if total == 0 {
        return 0.5;
    }
    let available = metrics.available_memory_mb().min(total);
    1.0 - available as f64 / total as f64
}

/// Combined load in 0..=1.
pub fn estimate_load(metrics: &dyn PlatformMetrics) -> f64 {
    let cpu = metrics.cpu_load();
    let cpu = if cpu.is_finite() { cpu.clamp(0.0, 1.0) } else { 1.0 };
    let load = CPU_WEIGHT * cpu
        + MEMORY_WEIGHT * memory_pressure(metrics)
        + BATTERY_WEIGHT * battery_pressure(metrics);
    load.clamp(0.0, 1.0)
}
