//! Ring-buffered temperature history.
//!
//! `status_update` notifications record the latest (temperature, target)
//! per sensor; a 1 s sampler appends that snapshot into fixed-capacity ring
//! buffers covering the last 20 minutes. Both buffers of a sensor always
//! have equal length.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Samples kept per sensor: 20 minutes at one sample per second.
pub const TEMPERATURE_STORE_SIZE: usize = 20 * 60;
/// Sampler period.
pub const TEMPERATURE_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct SensorHistory {
    temperatures: VecDeque<f64>,
    targets: VecDeque<f64>,
}

impl SensorHistory {
    fn push(&mut self, temperature: f64, target: f64) {
        if self.temperatures.len() == TEMPERATURE_STORE_SIZE {
            self.temperatures.pop_front();
            self.targets.pop_front();
        }
        self.temperatures.push_back(temperature);
        self.targets.push_back(target);
    }
}

#[derive(Default)]
struct Inner {
    /// Latest (temperature, target) per sensor, fed by `status_update`.
    last_temps: HashMap<String, (f64, f64)>,
    store: HashMap<String, SensorHistory>,
}

pub struct TemperatureStore {
    inner: Mutex<Inner>,
    sampler_running: AtomicBool,
}

impl TemperatureStore {
    pub fn new() -> Self {
        TemperatureStore {
            inner: Mutex::new(Inner::default()),
            sampler_running: AtomicBool::new(false),
        }
    }

    /// Rebuild the store for a new sensor list, keeping history for sensors
    /// that are still present.
    pub fn set_sensors(&self, sensors: &[String]) {
        let mut inner = self.inner.lock().expect("temperature store lock");
        let mut new_store = HashMap::with_capacity(sensors.len());
        for sensor in sensors {
            let history = inner.store.remove(sensor).unwrap_or_default();
            new_store.insert(sensor.clone(), history);
        }
        inner.store = new_store;
        inner
            .last_temps
            .retain(|sensor, _| sensors.iter().any(|s| s == sensor));
    }

    /// Record the latest values for tracked sensors from a `status_update`
    /// payload. Temperatures are rounded to two decimals.
    pub fn record_status(&self, data: &serde_json::Value) {
        let Some(objects) = data.as_object() else {
            return;
        };
        let mut inner = self.inner.lock().expect("temperature store lock");
        let tracked: Vec<String> = inner
            .store
            .keys()
            .filter(|sensor| objects.contains_key(*sensor))
            .cloned()
            .collect();
        for sensor in tracked {
            let status = &objects[&sensor];
            let temperature = status
                .get("temperature")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0);
            let target = status
                .get("target")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0);
            inner
                .last_temps
                .insert(sensor, ((temperature * 100.0).round() / 100.0, target));
        }
    }

    /// Append one sample per sensor from the latest snapshot.
    pub fn sample(&self) {
        let mut inner = self.inner.lock().expect("temperature store lock");
        let snapshot: Vec<(String, (f64, f64))> = inner
            .last_temps
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (sensor, (temperature, target)) in snapshot {
            if let Some(history) = inner.store.get_mut(&sensor) {
                history.push(temperature, target);
            }
        }
    }

    /// Materialize the ring buffers for `GET /server/temperature_store`.
    pub fn dump(&self) -> serde_json::Value {
        let inner = self.inner.lock().expect("temperature store lock");
        let mut out = serde_json::Map::new();
        for (sensor, history) in &inner.store {
            out.insert(
                sensor.clone(),
                serde_json::json!({
                    "temperatures": history.temperatures.iter().copied().collect::<Vec<f64>>(),
                    "targets": history.targets.iter().copied().collect::<Vec<f64>>(),
                }),
            );
        }
        serde_json::Value::Object(out)
    }

    /// Flag the sampler as running; returns the previous value so the
    /// caller spawns at most one sampler task.
    pub fn mark_sampler_running(&self) -> bool {
        self.sampler_running.swap(true, Ordering::Relaxed)
    }
}
