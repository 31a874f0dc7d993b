//! ==============================================================================
//! source.rs - simulated sensor sources
//! ==============================================================================
//!
//! purpose:
//!     turns a SensorDefinition into a stream of readings. every tick the
//!     value follows
//!
//! ```text
//!         value = clamp(base + seasonal(tick) + daily(tick) + noise, min, max)
//!
//!     optionally blended with the previous value (inertia) so rooms warm
//!     up and cool down gradually instead of jumping around.
//! ```
//!
//! relationships:
//!     - driven by: scheduler.rs (one task per source)
//!     - reads: domain.rs (SensorDefinition, Reading)
//!
//! determinism:
//!     a source owns its rng. `with_seed` makes it reproducible; `new` seeds
//!     from the os. generate() has no io and no side effects beyond the
//!     source's own state (previous value, energy meter).
//!
//! ==============================================================================

use std::f64::consts::PI;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::domain::{Reading, SensorDefinition, SensorType};
use crate::error::{Error, Result};

/// one scheduled generation cycle
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// 0 for the first reading of a source
    pub index: u64,
    /// wall-clock time the tick fired
    pub at: DateTime<Utc>,
}

impl Tick {
    pub fn new(index: u64, at: DateTime<Utc>) -> Self {
        Self { index, at }
    }

    fn hour_of_day(&self) -> f64 {
        self.at.hour() as f64 + self.at.minute() as f64 / 60.0
    }
}

/// per-kind behaviour layered on top of the shared value model
#[derive(Debug, Clone)]
enum Profile {
    /// temperature and humidity: just the value
    Ambient,
    /// energy meters also integrate power into consumption and cost
    Metered(EnergyMeter),
}

/// a simulated sensor
#[derive(Debug)]
pub struct SensorSource {
    definition: SensorDefinition,
    interval: Duration,
    rng: StdRng,
    previous: Option<f64>,
    profile: Profile,
}

impl SensorSource {
    /// production constructor, seeded from the os
    pub fn new(definition: SensorDefinition, interval: Duration) -> Self {
        Self::with_rng(definition, interval, StdRng::from_entropy())
    }

    /// reproducible source for tests and `--seed`
    pub fn with_seed(definition: SensorDefinition, interval: Duration, seed: u64) -> Self {
        Self::with_rng(definition, interval, StdRng::seed_from_u64(seed))
    }

    fn with_rng(definition: SensorDefinition, interval: Duration, rng: StdRng) -> Self {
        let profile = match definition.sensor_type {
            SensorType::Energy => Profile::Metered(EnergyMeter::default()),
            SensorType::Temperature | SensorType::Humidity => Profile::Ambient,
        };
        Self {
            definition,
            interval,
            rng,
            previous: None,
            profile,
        }
    }

    pub fn definition(&self) -> &SensorDefinition {
        &self.definition
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// value emitted on the last successful tick
    pub fn previous_value(&self) -> Option<f64> {
        self.previous
    }

    /// produce the reading for `tick`
    ///
    /// fails when the configuration or the arithmetic yields something
    /// that cannot be emitted (non-finite value, inverted bounds). state is
    /// left untouched on failure so the next tick starts from the last
    /// good value.
    pub fn generate(&mut self, tick: Tick) -> Result<Reading> {
        let def = &self.definition;

        if !(def.min <= def.max) {
            return Err(self.generation_error(format!("bounds inverted: min {} > max {}", def.min, def.max)));
        }

        let target = match self.profile {
            Profile::Ambient => def.base + seasonal_component(def, &tick) + daily_component(def, &tick),
            Profile::Metered(_) => {
                def.base + seasonal_load(def, &tick) + daily_component(def, &tick) + usage_peaks(def, &tick)
            }
        };
        let inertia = def.inertia.clamp(0.0, 0.99);
        let smoothed = match self.previous {
            Some(prev) => prev + (target - prev) * (1.0 - inertia),
            None => target,
        };

        let noise = if def.noise > 0.0 {
            self.rng.gen_range(-def.noise..=def.noise)
        } else {
            0.0
        };

        let raw = smoothed + noise;
        if !raw.is_finite() {
            return Err(self.generation_error(format!("non-finite value {raw}")));
        }

        // rounding can nudge a value past a bound, so clamp last
        let value = ((raw * 100.0).round() / 100.0).clamp(def.min, def.max);

        let metadata = match &mut self.profile {
            Profile::Ambient => None,
            Profile::Metered(meter) => Some(meter.record(value, &tick, self.interval)),
        };

        self.previous = Some(value);

        Ok(Reading {
            sensor_id: self.definition.sensor_id.clone(),
            room_id: self.definition.room_id.clone(),
            sensor_type: self.definition.sensor_type,
            value,
            unit: self.definition.sensor_type.unit().to_string(),
            timestamp: tick.at,
            metadata,
        })
    }

    fn generation_error(&self, reason: String) -> Error {
        Error::Generation {
            sensor_id: self.definition.sensor_id.clone(),
            reason,
        }
    }
}

/// yearly sine, zero at the spring equinox and peaking near day 172
fn seasonal_component(def: &SensorDefinition, tick: &Tick) -> f64 {
    if def.seasonal_amplitude == 0.0 {
        return 0.0;
    }
    let day = tick.at.ordinal() as f64;
    def.seasonal_amplitude * ((day - 81.0) * 2.0 * PI / 365.0).sin()
}

/// extra load in both summer and winter; zero at the equinoxes
fn seasonal_load(def: &SensorDefinition, tick: &Tick) -> f64 {
    if def.seasonal_amplitude == 0.0 {
        return 0.0;
    }
    let day = tick.at.ordinal() as f64;
    def.seasonal_amplitude * ((day - 81.0) * 2.0 * PI / 365.0).sin().abs()
}

/// morning and evening usage bumps, gaussian in hour of day
fn usage_peaks(def: &SensorDefinition, tick: &Tick) -> f64 {
    let hour = tick.hour_of_day();
    let width = def.peak_width_hours.max(0.1);
    let bump = |amplitude: f64, peak: f64| {
        if amplitude == 0.0 {
            return 0.0;
        }
        // distance on the 24h circle so a 23:00 peak still reaches 01:00
        let d = (hour - peak).rem_euclid(24.0);
        let d = d.min(24.0 - d);
        amplitude * (-(d * d) / (2.0 * width * width)).exp()
    };
    bump(def.morning_amplitude, def.morning_peak_hour) + bump(def.evening_amplitude, def.evening_peak_hour)
}

/// 24h cosine peaking at `daily_peak_hour`
fn daily_component(def: &SensorDefinition, tick: &Tick) -> f64 {
    if def.daily_amplitude == 0.0 {
        return 0.0;
    }
    let hour = tick.hour_of_day();
    def.daily_amplitude * ((hour - def.daily_peak_hour) * 2.0 * PI / 24.0).cos()
}

// ==============================================================================
// energy meter - consumption and cost accumulated per day
// ==============================================================================

/// price band for a kWh at a given hour
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tariff {
    /// 18:00 - 21:59
    Peak,
    /// 23:00 - 06:59
    OffPeak,
    Standard,
}

impl Tariff {
    pub fn at_hour(hour: u32) -> Self {
        match hour {
            18..=21 => Tariff::Peak,
            23 | 0..=6 => Tariff::OffPeak,
            _ => Tariff::Standard,
        }
    }

    /// price per kWh
    pub fn rate(&self) -> f64 {
        match self {
            Tariff::Peak => 0.28,
            Tariff::OffPeak => 0.12,
            Tariff::Standard => 0.18,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tariff::Peak => "peak",
            Tariff::OffPeak => "off_peak",
            Tariff::Standard => "standard",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EnergyMeter {
    day: Option<NaiveDate>,
    last_at: Option<DateTime<Utc>>,
    daily_kwh: f64,
    cost_today: f64,
    peak_power_w: f64,
}

impl EnergyMeter {
    /// integrate `power_w` over the time since the previous tick
    fn record(&mut self, power_w: f64, tick: &Tick, interval: Duration) -> serde_json::Value {
        let today = tick.at.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.daily_kwh = 0.0;
            self.cost_today = 0.0;
            self.peak_power_w = 0.0;
        }

        let hours = match self.last_at {
            Some(last) if tick.at > last => (tick.at - last).num_milliseconds() as f64 / 3_600_000.0,
            Some(_) => 0.0,
            None => interval.as_secs_f64() / 3600.0,
        };
        self.last_at = Some(tick.at);

        let tariff = Tariff::at_hour(tick.at.hour());
        let kwh = power_w / 1000.0 * hours;
        self.daily_kwh += kwh;
        self.cost_today += kwh * tariff.rate();
        self.peak_power_w = self.peak_power_w.max(power_w);

        json!({
            "power_kw": round_to(power_w / 1000.0, 3),
            "daily_consumption_kwh": round_to(self.daily_kwh, 4),
            "cost_today": round_to(self.cost_today, 2),
            "peak_power_w": round_to(self.peak_power_w, 2),
            "tariff": tariff.as_str(),
            "rate_per_kwh": tariff.rate(),
        })
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
