use groundlink::serial::MemoryPortHandle;
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::time::Duration;

const GRAVITY: f64 = 9.81;
const LAUNCH_LATITUDE: f64 = 52.2549;
const LAUNCH_LONGITUDE: f64 = 20.9004;

/// Configuration for the synthetic modem feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
    pub seed: u64,
    /// Time between simulated frame pairs.
    pub interval_ms: u64,
    /// Stops the feed after this many seconds; `None` runs until shutdown.
    pub duration_s: Option<u64>,
    pub launch_velocity: f64,
    pub noise: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            seed: 0,
            interval_ms: 1000,
            duration_s: Some(120),
            launch_velocity: 150.0,
            noise: 0.5,
        }
    }
}

/// One point on the simulated flight.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightSample {
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
    pub vertical_velocity: f64,
    pub altitude: f64,
    pub battery_level: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub status: i64,
}

/// Ballistic ascent and descent with noisy attitude, rendered as modem output.
pub struct FlightProfile {
    rng: StdRng,
    step: f64,
    tick: u64,
    launch_velocity: f64,
    noise: f64,
}

impl FlightProfile {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            step: config.interval_ms.max(1) as f64 / 1000.0,
            tick: 0,
            launch_velocity: config.launch_velocity,
            noise: if config.noise.is_finite() {
                config.noise.abs()
            } else {
                0.0
            },
        }
    }

    pub fn sample(&mut self) -> FlightSample {
        let t = self.tick as f64 * self.step;
        self.tick += 1;

        let flight_time = 2.0 * self.launch_velocity / GRAVITY;
        let airborne = t < flight_time;
        let (altitude, vertical_velocity) = if airborne {
            (
                self.launch_velocity * t - 0.5 * GRAVITY * t * t,
                self.launch_velocity - GRAVITY * t,
            )
        } else {
            (0.0, 0.0)
        };
        let status = match (airborne, vertical_velocity >= 0.0) {
            (true, true) => 1,
            (true, false) => 2,
            (false, _) => 3,
        };

        let drift = altitude / 1_000_000.0;
        FlightSample {
            pitch: 85.0 - 170.0 * (t / flight_time).min(1.0) + self.jitter(),
            roll: 15.0 * (2.0 * PI * t / 8.0).sin() + self.jitter(),
            yaw: (t * 12.0) % 360.0,
            vertical_velocity: vertical_velocity + self.jitter(),
            altitude: altitude.max(0.0),
            battery_level: (8.4 - t * 0.002).max(6.0),
            latitude: LAUNCH_LATITUDE + drift + self.jitter() * 1e-5,
            longitude: LAUNCH_LONGITUDE + drift + self.jitter() * 1e-5,
            status,
        }
    }

    /// Modem lines for the next sample: a diagnostic line ahead of each RX frame.
    pub fn next_lines(&mut self) -> Vec<String> {
        let sample = self.sample();
        let telemetry = telemetry_payload(&sample);
        let auxiliary = auxiliary_payload(&sample);
        let mut lines = Vec::with_capacity(4);
        for payload in [telemetry, auxiliary] {
            let rssi = self.rng.gen_range(-110..-60);
            let snr = self.rng.gen_range(-5..12);
            lines.push(transmission_line(payload.len(), rssi, snr));
            lines.push(rx_line(&payload));
        }
        lines
    }

    fn jitter(&mut self) -> f64 {
        if self.noise == 0.0 {
            0.0
        } else {
            self.rng.gen_range(-self.noise..self.noise)
        }
    }
}

pub fn telemetry_payload(sample: &FlightSample) -> String {
    format!(
        "A{:.2};{:.2};{:.2};{:.2};{:.2};{:.2}",
        sample.pitch,
        sample.roll,
        sample.yaw,
        sample.vertical_velocity,
        sample.altitude,
        sample.battery_level
    )
}

pub fn auxiliary_payload(sample: &FlightSample) -> String {
    format!(
        "B{:.6};{:.6};{}",
        sample.latitude, sample.longitude, sample.status
    )
}

pub fn rx_line(payload: &str) -> String {
    format!("+TEST: RX \"{}\"", hex::encode_upper(payload))
}

pub fn transmission_line(len: usize, rssi: i32, snr: i32) -> String {
    format!("+TEST: LEN:{}, RSSI:{}, SNR:{}", len, rssi, snr)
}

/// Number of samples that fit in the configured duration, at least one.
pub fn sample_limit(config: &SimulationConfig) -> Option<u64> {
    config
        .duration_s
        .map(|secs| (secs.saturating_mul(1000) / config.interval_ms.max(1)).max(1))
}

/// Pushes simulated modem output into the in-memory port until the configured
/// duration has elapsed.
pub async fn feed(port: MemoryPortHandle, config: SimulationConfig) {
    let mut profile = FlightProfile::new(&config);
    let period = Duration::from_millis(config.interval_ms.max(1));
    let limit = sample_limit(&config);
    let mut ticker = tokio::time::interval(period);
    info!("Simulated modem feed started (seed {})", config.seed);

    let mut emitted: u64 = 0;
    while limit.map_or(true, |limit| emitted < limit) {
        ticker.tick().await;
        for line in profile.next_lines() {
            debug!("sim -> {}", line);
            port.push_line(&line);
        }
        emitted += 1;
    }
    info!("Simulated modem feed finished after {} samples", emitted);
}
