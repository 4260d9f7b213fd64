//! Distance filtering, zone classification and indicators
//!
//! Converts noisy time-of-flight pulses into a flicker-free proximity
//! zone and a matching indicator pattern:
//! - raw reads are median-filtered (echo noise produces occasional large
//!   outliers; the median ignores them)
//! - zone transitions carry a hysteresis margin so a reading sitting on
//!   a boundary cannot toggle the zone every iteration
//! - prolonged stillness forces all indicators off
//!
//! The buzzer cadence is derived from the phase of the monotonic clock
//! rather than inline sleeps, so driving it never blocks the loop.

use crate::domain::Zone;
use crate::io::hal::{OutputPin, PulseInput};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const TRIGGER_SETTLE: Duration = Duration::from_micros(2);
const TRIGGER_PULSE: Duration = Duration::from_micros(10);
const ECHO_TIMEOUT: Duration = Duration::from_millis(30);
/// Round-trip microseconds per centimeter at room temperature.
const US_PER_CM: f64 = 58.0;
const MIN_CM: f64 = 2.0;
const MAX_CM: f64 = 400.0;

const SAMPLE_ATTEMPTS: usize = 8;
const SAMPLES_WANTED: usize = 5;
const SAMPLE_PAUSE: Duration = Duration::from_millis(10);
/// Reading reported before the first good sample ever arrives.
const DEFAULT_CM: f64 = 20.0;

/// A filtered reading must move by at least this much to count as activity.
const SIGNIFICANT_DELTA_CM: f64 = 0.5;
const INACTIVITY_WINDOW: Duration = Duration::from_millis(3000);

const NEAR_BEEP: Duration = Duration::from_millis(120);
const MID_BEEP: Duration = Duration::from_millis(250);

/// Ultrasonic range sensor on a trigger output and an echo pulse input.
pub struct RangeSensor<T: OutputPin, E: PulseInput> {
    trigger: T,
    echo: E,
}

impl<T: OutputPin, E: PulseInput> RangeSensor<T, E> {
    pub fn new(trigger: T, echo: E) -> Self {
        Self { trigger, echo }
    }

    /// One raw measurement in centimeters. `None` when no echo returned
    /// within the timeout or the reading is outside the valid range;
    /// out-of-range readings are discarded, never clamped.
    pub async fn read_raw(&mut self) -> Option<f64> {
        self.trigger.set(false);
        tokio::time::sleep(TRIGGER_SETTLE).await;
        self.trigger.set(true);
        tokio::time::sleep(TRIGGER_PULSE).await;
        self.trigger.set(false);

        let pulse = self.echo.measure_pulse(true, ECHO_TIMEOUT)?;
        let cm = pulse.as_micros() as f64 / US_PER_CM;
        if (MIN_CM..=MAX_CM).contains(&cm) {
            Some(cm)
        } else {
            debug!(cm, "range_out_of_bounds");
            None
        }
    }
}

/// Median of a non-empty sample set; even counts average the middle two.
pub fn median(samples: &mut [f64]) -> f64 {
    samples.sort_by(|a, b| a.total_cmp(b));
    let mid = samples.len() / 2;
    if samples.len() % 2 == 1 {
        samples[mid]
    } else {
        (samples[mid - 1] + samples[mid]) / 2.0
    }
}

/// Three-zone classifier with hysteresis.
///
/// Leaving a boundary zone requires crossing the adjusted threshold:
/// NEAR is left only at `d >= t_near + h`, FAR only at `d <= t_far - h`.
/// From MID, `d <= t_near` enters NEAR and `d > t_far` enters FAR.
pub struct ZoneClassifier {
    t_near: f64,
    t_far: f64,
    h: f64,
    zone: Zone,
}

impl ZoneClassifier {
    pub fn new(t_near: f64, t_far: f64, h: f64) -> Self {
        Self { t_near, t_far, h, zone: Zone::Far }
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    /// Feed one filtered distance; returns the (possibly unchanged) zone.
    pub fn update(&mut self, d: f64) -> Zone {
        let next = match self.zone {
            Zone::Near if d >= self.t_near + self.h => {
                if d > self.t_far {
                    Zone::Far
                } else {
                    Zone::Mid
                }
            }
            Zone::Far if d <= self.t_far - self.h => {
                if d <= self.t_near {
                    Zone::Near
                } else {
                    Zone::Mid
                }
            }
            Zone::Mid if d <= self.t_near => Zone::Near,
            Zone::Mid if d > self.t_far => Zone::Far,
            current => current,
        };
        self.zone = next;
        next
    }
}

/// One LED per zone plus the buzzer. LEDs are mutually exclusive.
pub struct Indicators<L: OutputPin> {
    led_near: L,
    led_mid: L,
    led_far: L,
    buzzer: L,
}

impl<L: OutputPin> Indicators<L> {
    pub fn new(led_near: L, led_mid: L, led_far: L, buzzer: L) -> Self {
        Self { led_near, led_mid, led_far, buzzer }
    }

    pub fn all_off(&mut self) {
        self.led_near.set(false);
        self.led_mid.set(false);
        self.led_far.set(false);
        self.buzzer.set(false);
    }

    /// Render the current zone. The buzzer square wave is computed from
    /// `phase` (time since monitor start): fastest cadence nearest,
    /// silent in FAR.
    pub fn apply(&mut self, zone: Zone, phase: Duration) {
        self.led_near.set(zone == Zone::Near);
        self.led_mid.set(zone == Zone::Mid);
        self.led_far.set(zone == Zone::Far);
        let buzz = match zone {
            Zone::Near => beep_phase_on(phase, NEAR_BEEP),
            Zone::Mid => beep_phase_on(phase, MID_BEEP),
            Zone::Far => false,
        };
        self.buzzer.set(buzz);
    }
}

fn beep_phase_on(phase: Duration, cadence: Duration) -> bool {
    (phase.as_millis() / cadence.as_millis()) % 2 == 0
}

/// Owns sensor, classifier and indicators; polled once per loop iteration.
pub struct ProximityMonitor<T: OutputPin, E: PulseInput, L: OutputPin> {
    sensor: RangeSensor<T, E>,
    classifier: ZoneClassifier,
    indicators: Indicators<L>,
    enabled: bool,
    last_good: Option<f64>,
    last_reading: f64,
    last_change: Instant,
    started: Instant,
}

impl<T: OutputPin, E: PulseInput, L: OutputPin> ProximityMonitor<T, E, L> {
    pub fn new(
        sensor: RangeSensor<T, E>,
        classifier: ZoneClassifier,
        indicators: Indicators<L>,
    ) -> Self {
        let now = Instant::now();
        Self {
            sensor,
            classifier,
            indicators,
            enabled: true,
            last_good: None,
            last_reading: DEFAULT_CM,
            last_change: now,
            started: now,
        }
    }

    pub fn zone(&self) -> Zone {
        self.classifier.zone()
    }

    /// Remote enable/disable. Disabling forces indicators off immediately.
    pub fn set_enabled(&mut self, on: bool) {
        if self.enabled == on {
            return;
        }
        self.enabled = on;
        info!(enabled = on, "proximity_enabled");
        if !on {
            self.indicators.all_off();
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Median-filtered distance: up to [`SAMPLE_ATTEMPTS`] raw reads,
    /// stopping once [`SAMPLES_WANTED`] are valid. With zero valid samples
    /// the last good value is reported, or [`DEFAULT_CM`] before any.
    pub async fn measure(&mut self) -> f64 {
        let mut samples: Vec<f64> = Vec::with_capacity(SAMPLES_WANTED);
        for attempt in 0..SAMPLE_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(SAMPLE_PAUSE).await;
            }
            if let Some(cm) = self.sensor.read_raw().await {
                samples.push(cm);
                if samples.len() >= SAMPLES_WANTED {
                    break;
                }
            }
        }
        if samples.is_empty() {
            return self.last_good.unwrap_or(DEFAULT_CM);
        }
        let filtered = median(&mut samples);
        self.last_good = Some(filtered);
        filtered
    }

    /// One classification pass: measure, update zone, render indicators.
    pub async fn poll(&mut self) {
        if !self.enabled {
            return;
        }
        let d = self.measure().await;
        let previous = self.classifier.zone();
        let zone = self.classifier.update(d);
        if zone != previous {
            info!(distance_cm = d, zone = zone.as_str(), "zone_changed");
        }
        if (d - self.last_reading).abs() > SIGNIFICANT_DELTA_CM {
            self.last_change = Instant::now();
        }
        self.last_reading = d;
        if self.last_change.elapsed() > INACTIVITY_WINDOW {
            self.indicators.all_off();
        } else {
            self.indicators.apply(zone, self.started.elapsed());
        }
    }
}
