//! Per-aircraft state engine.
//!
//! SBS-1 spreads aircraft state over several transmission types: callsign in
//! MSG,1, position and altitude in MSG,3, velocity in MSG,4, squawk in MSG,6.
//! The [`FlightObserver`] fuses those partial messages into one
//! [`Observation`] per ICAO address, flags unpublished changes for the
//! dispatcher and evicts aircraft not heard from for a while.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use crate::sbs::{SbsMessage, TransmissionType, parse_sbs_line};

/// Sweep interval and eviction horizon in seconds
pub const OBSERVATION_CLEAN_INTERVAL: i64 = 30;

/// Fused state of one observed aircraft.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub icao24: String,
    pub callsign: Option<String>,
    pub squawk: Option<String>,
    pub flight_id: Option<String>,
    pub altitude: Option<i32>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub ground_speed: Option<f64>,
    pub track: Option<f64>,
    /// Defaults to 0; many aircraft never report a vertical rate
    pub vertical_rate: i32,
    /// Wallclock of the last position report
    pub lat_lon_time: DateTime<Utc>,
    /// Wallclock of the last altitude report
    pub altitude_time: DateTime<Utc>,
    /// Wallclock of the last message of any kind
    pub logged_date: DateTime<Utc>,
    /// True while the observation carries changes not yet dispatched
    pub updated: bool,
}

impl Observation {
    /// Create a fresh observation from its first message. A new aircraft
    /// always counts as updated, whatever the first message carried.
    pub fn new(msg: &SbsMessage, now: DateTime<Utc>) -> Self {
        let mut obs = Self {
            icao24: msg.icao24.clone(),
            callsign: None,
            squawk: None,
            flight_id: None,
            altitude: None,
            lat: None,
            lon: None,
            ground_speed: None,
            track: None,
            vertical_rate: 0,
            lat_lon_time: now,
            altitude_time: now,
            logged_date: now,
            updated: false,
        };
        obs.apply(msg, now);
        obs.updated = true;
        obs
    }

    /// Merge a partial message. Only non-null fields overwrite; a field the
    /// message does not carry never clears existing state. Any material
    /// change sets the dirty flag; only [`Observation::reset_updated`]
    /// clears it.
    pub fn apply(&mut self, msg: &SbsMessage, now: DateTime<Utc>) {
        self.logged_date = now;

        if let Some(callsign) = msg.callsign.as_deref() {
            let callsign = callsign.trim();
            if !callsign.is_empty() && self.callsign.as_deref() != Some(callsign) {
                self.callsign = Some(callsign.to_string());
                self.updated = true;
            }
        }
        if let Some(squawk) = msg.squawk.as_deref() {
            if self.squawk.as_deref() != Some(squawk) {
                self.squawk = Some(squawk.to_string());
                self.updated = true;
            }
        }
        if let Some(flight_id) = msg.flight_id.as_deref() {
            if self.flight_id.as_deref() != Some(flight_id) {
                self.flight_id = Some(flight_id.to_string());
                self.updated = true;
            }
        }
        if let Some(altitude) = msg.altitude {
            if self.altitude != Some(altitude) {
                self.altitude = Some(altitude);
                self.updated = true;
            }
            self.altitude_time = now;
        }
        if let Some(ground_speed) = msg.ground_speed {
            if self.ground_speed != Some(ground_speed) {
                self.ground_speed = Some(ground_speed);
                self.updated = true;
            }
        }
        if let Some(track) = msg.track {
            if self.track != Some(track) {
                self.track = Some(track);
                self.updated = true;
            }
        }
        if let Some(lat) = msg.lat {
            if self.lat != Some(lat) {
                self.lat = Some(lat);
                self.updated = true;
            }
            self.lat_lon_time = now;
        }
        if let Some(lon) = msg.lon {
            if self.lon != Some(lon) {
                self.lon = Some(lon);
                self.updated = true;
            }
            self.lat_lon_time = now;
        }
        if let Some(vertical_rate) = msg.vertical_rate {
            if self.vertical_rate != vertical_rate {
                self.vertical_rate = vertical_rate;
                self.updated = true;
            }
        }
    }

    /// An observation is presentable once it has enough state to form a
    /// complete position report: altitude, position, callsign and velocity.
    pub fn is_presentable(&self) -> bool {
        self.altitude.is_some()
            && self.lat.is_some()
            && self.lon.is_some()
            && self.callsign.is_some()
            && self.ground_speed.is_some()
            && self.track.is_some()
    }

    pub fn reset_updated(&mut self) {
        self.updated = false;
    }

    /// Concrete view of a presentable observation, `None` otherwise.
    /// `now` becomes the report timestamp.
    pub fn presentable_view(&self, now: DateTime<Utc>) -> Option<AircraftView> {
        Some(AircraftView {
            icao24: self.icao24.clone(),
            callsign: self.callsign.clone()?,
            squawk: self.squawk.clone(),
            time: now.timestamp_micros() as f64 / 1_000_000.0,
            lat: self.lat?,
            lon: self.lon?,
            altitude: self.altitude?,
            speed: round1(self.ground_speed?),
            vspeed: self.vertical_rate,
            heading: round1(self.track?),
        })
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Flat aircraft record, serialized as the GeoJSON Feature properties and
/// shown on the status page.
#[derive(Debug, Clone, Serialize)]
pub struct AircraftView {
    pub icao24: String,
    pub callsign: String,
    pub squawk: Option<String>,
    pub time: f64,
    pub lat: f64,
    pub lon: f64,
    pub altitude: i32,
    pub speed: f64,
    pub vspeed: i32,
    pub heading: f64,
}

/// Rates derived at each sweep over the last window
#[derive(Debug)]
struct RateWindow {
    next_clean: DateTime<Utc>,
    message_rate: f64,
    observation_rate: f64,
}

/// Statistics snapshot for the status page
#[derive(Debug, Clone)]
pub struct ObserverStats {
    /// Currently observed aircraft
    pub aircraft: usize,
    /// Messages per second over the last window
    pub message_rate: f64,
    /// Presentable updates per second over the last window
    pub observation_rate: f64,
    /// Transmission type distribution in percent, most common first
    pub distribution: Vec<(&'static str, f64)>,
}

/// The process-wide aircraft table plus ingest counters.
pub struct FlightObserver {
    observations: DashMap<String, Observation>,
    messages: AtomicU64,
    presentable_messages: AtomicU64,
    by_type: [AtomicU64; 8],
    rates: Mutex<RateWindow>,
}

impl FlightObserver {
    pub fn new() -> Self {
        Self {
            observations: DashMap::new(),
            messages: AtomicU64::new(0),
            presentable_messages: AtomicU64::new(0),
            by_type: std::array::from_fn(|_| AtomicU64::new(0)),
            rates: Mutex::new(RateWindow {
                next_clean: Utc::now() + Duration::seconds(OBSERVATION_CLEAN_INTERVAL),
                message_rate: 0.0,
                observation_rate: 0.0,
            }),
        }
    }

    /// Feed one raw upstream line. Counts the line, runs the sweep when due,
    /// and merges the parsed message. Malformed lines are dropped silently.
    pub fn ingest_line(&self, line: &str, now: DateTime<Utc>) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.sweep_if_due(now);

        let msg = match parse_sbs_line(line) {
            Ok(msg) => msg,
            Err(e) => {
                trace!(error = %e, line, "dropping unparseable line");
                metrics::counter!("sbs.parse_errors_total").increment(1);
                return;
            }
        };
        self.ingest(msg, now);
    }

    /// Merge one parsed message into the table.
    pub fn ingest(&self, msg: SbsMessage, now: DateTime<Utc>) {
        metrics::counter!("sbs.messages_total").increment(1);
        self.record_type(msg.transmission_type);

        let presentable = match self.observations.entry(msg.icao24.clone()) {
            Entry::Occupied(mut entry) => {
                let obs = entry.get_mut();
                obs.apply(&msg, now);
                obs.is_presentable()
            }
            Entry::Vacant(entry) => {
                debug!(icao24 = %msg.icao24, "appeared");
                entry.insert(Observation::new(&msg, now)).is_presentable()
            }
        };

        if presentable {
            self.presentable_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_type(&self, transmission_type: TransmissionType) {
        self.by_type[transmission_type as usize - 1].fetch_add(1, Ordering::Relaxed);
    }

    fn sweep_if_due(&self, now: DateTime<Utc>) {
        let due = {
            let window = self.rates.lock().unwrap();
            now > window.next_clean
        };
        if due {
            self.sweep(now);
        }
    }

    /// Evict aircraft not heard from within the clean interval and derive
    /// the per-window rates. Counters restart from zero.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let horizon = Duration::seconds(OBSERVATION_CLEAN_INTERVAL);
        self.observations.retain(|icao24, obs| {
            let keep = obs.logged_date + horizon >= now;
            if !keep {
                debug!(%icao24, "disappeared");
            }
            keep
        });

        let messages = self.messages.swap(0, Ordering::Relaxed);
        let presentable = self.presentable_messages.swap(0, Ordering::Relaxed);

        let mut window = self.rates.lock().unwrap();
        window.message_rate = messages as f64 / OBSERVATION_CLEAN_INTERVAL as f64;
        window.observation_rate = presentable as f64 / OBSERVATION_CLEAN_INTERVAL as f64;
        window.next_clean = now + horizon;

        metrics::gauge!("observer.aircraft").set(self.observations.len() as f64);
        metrics::gauge!("observer.message_rate").set(window.message_rate);
    }

    /// Invoke `f` for every presentable observation carrying unpublished
    /// changes, then clear its dirty flag. The dispatcher drives this once
    /// per tick.
    pub fn take_updated<F>(&self, mut f: F)
    where
        F: FnMut(&Observation),
    {
        for mut entry in self.observations.iter_mut() {
            let obs = entry.value_mut();
            if obs.updated && obs.is_presentable() {
                f(obs);
                obs.reset_updated();
            }
        }
    }

    /// Clone of the current table contents
    pub fn snapshot(&self) -> Vec<Observation> {
        self.observations
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn stats(&self) -> ObserverStats {
        let (message_rate, observation_rate) = {
            let window = self.rates.lock().unwrap();
            (window.message_rate, window.observation_rate)
        };

        let counts: Vec<u64> = self
            .by_type
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        let mut distribution: Vec<(&'static str, f64)> = Vec::new();
        if total > 0 {
            for (i, count) in counts.iter().enumerate() {
                if *count == 0 {
                    continue;
                }
                // by_type is indexed by transmission type - 1
                let name = match TransmissionType::from_u8(i as u8 + 1) {
                    Some(t) => t.name(),
                    None => continue,
                };
                let pct = round1(*count as f64 * 100.0 / total as f64);
                distribution.push((name, pct));
            }
            distribution.sort_by(|a, b| b.1.total_cmp(&a.1));
        }

        ObserverStats {
            aircraft: self.observations.len(),
            message_rate,
            observation_rate,
            distribution,
        }
    }
}

impl Default for FlightObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(icao24: &str) -> SbsMessage {
        SbsMessage {
            transmission_type: TransmissionType::EsAirbornePos,
            icao24: icao24.to_string(),
            flight_id: None,
            callsign: None,
            altitude: None,
            ground_speed: None,
            track: None,
            lat: None,
            lon: None,
            vertical_rate: None,
            squawk: None,
        }
    }

    #[test]
    fn test_first_message_counts_as_update() {
        let now = Utc::now();
        let obs = Observation::new(&msg("ABC123"), now);
        assert!(obs.updated);
        assert!(!obs.is_presentable());
        assert_eq!(obs.vertical_rate, 0);
    }

    #[test]
    fn test_merge_keeps_last_non_null_value() {
        let now = Utc::now();
        let mut first = msg("ABC123");
        first.callsign = Some("TEST".to_string());
        first.altitude = Some(10000);
        let mut obs = Observation::new(&first, now);

        let mut second = msg("ABC123");
        second.altitude = Some(11000);
        obs.apply(&second, now);
        assert_eq!(obs.altitude, Some(11000));

        // a message without the field must not clear it
        obs.apply(&msg("ABC123"), now);
        assert_eq!(obs.altitude, Some(11000));
        assert_eq!(obs.callsign.as_deref(), Some("TEST"));
    }

    #[test]
    fn test_dirty_flag_is_sticky() {
        let now = Utc::now();
        let mut first = msg("ABC123");
        first.altitude = Some(10000);
        let mut obs = Observation::new(&first, now);
        obs.reset_updated();

        // identical report: nothing material changed
        obs.apply(&first, now);
        assert!(!obs.updated);

        let mut change = msg("ABC123");
        change.altitude = Some(10500);
        obs.apply(&change, now);
        assert!(obs.updated);

        // a no-op report must not erase a pending flag
        obs.apply(&change, now);
        assert!(obs.updated);
    }

    #[test]
    fn test_timestamps_refresh_without_dirtying() {
        let t0 = Utc::now();
        let mut first = msg("ABC123");
        first.altitude = Some(10000);
        let mut obs = Observation::new(&first, t0);
        obs.reset_updated();

        let t1 = t0 + Duration::seconds(5);
        obs.apply(&first, t1);
        assert!(!obs.updated);
        assert_eq!(obs.logged_date, t1);
        assert_eq!(obs.altitude_time, t1);
    }

    #[test]
    fn test_becomes_presentable_after_merging_types() {
        let observer = FlightObserver::new();
        let now = Utc::now();

        observer.ingest_line(
            "MSG,1,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,TEST,,,,,,,,,,,",
            now,
        );
        observer.ingest_line(
            "MSG,3,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,10000,,,46.5,15.0,,,0,0,0,0",
            now,
        );
        assert!(!observer.snapshot()[0].is_presentable());

        observer.ingest_line(
            "MSG,4,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,,420,90,,,0,,0,0,0,0",
            now,
        );

        let snapshot = observer.snapshot();
        assert_eq!(snapshot.len(), 1);
        let obs = &snapshot[0];
        assert!(obs.is_presentable());
        assert!(obs.updated);
        assert_eq!(obs.callsign.as_deref(), Some("TEST"));
        assert_eq!(obs.altitude, Some(10000));
        assert_eq!(obs.ground_speed, Some(420.0));
        assert_eq!(obs.track, Some(90.0));

        let view = obs.presentable_view(now).unwrap();
        assert_eq!(view.icao24, "ABC123");
        assert_eq!(view.lat, 46.5);
        assert_eq!(view.lon, 15.0);
        assert_eq!(view.speed, 420.0);
        assert_eq!(view.heading, 90.0);
    }

    #[test]
    fn test_malformed_lines_are_dropped() {
        let observer = FlightObserver::new();
        let now = Utc::now();
        observer.ingest_line("garbage", now);
        observer.ingest_line("MSG,9,,,AB1234", now);
        assert!(observer.is_empty());
    }

    #[test]
    fn test_sweep_evicts_stale_aircraft() {
        let observer = FlightObserver::new();
        let t0 = Utc::now();
        observer.ingest_line(
            "MSG,3,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,10000,,,46.5,15.0,,,0,0,0,0",
            t0,
        );
        assert_eq!(observer.len(), 1);

        // still within the horizon
        observer.sweep(t0 + Duration::seconds(OBSERVATION_CLEAN_INTERVAL));
        assert_eq!(observer.len(), 1);

        observer.sweep(t0 + Duration::seconds(OBSERVATION_CLEAN_INTERVAL + 1));
        assert!(observer.is_empty());
    }

    #[test]
    fn test_sweep_derives_rates() {
        let observer = FlightObserver::new();
        let t0 = Utc::now();

        // one aircraft whose messages, once assembled, count 60 presentable updates
        observer.ingest_line(
            "MSG,1,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,TEST,,,,,,,,,,,",
            t0,
        );
        observer.ingest_line(
            "MSG,3,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,10000,,,46.5,15.0,,,0,0,0,0",
            t0,
        );
        observer.ingest_line(
            "MSG,4,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,,420,90,,,0,,0,0,0,0",
            t0,
        );
        for i in 0..59 {
            let line = format!(
                "MSG,3,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,{},,,46.5,15.0,,,0,0,0,0",
                10000 + i
            );
            observer.ingest_line(&line, t0);
        }

        // plus 2938 identification-only messages that never present
        for i in 0..2938 {
            let line = format!(
                "MSG,1,1,1,OTHER{:04},1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,,,,,,,,,,,",
                i % 500
            );
            observer.ingest_line(&line, t0);
        }

        observer.sweep(t0 + Duration::seconds(OBSERVATION_CLEAN_INTERVAL + 1));

        let stats = observer.stats();
        assert_eq!(stats.aircraft, 0);
        assert!((stats.message_rate - 100.0).abs() < f64::EPSILON);
        assert!((stats.observation_rate - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_take_updated_clears_dirty_flags() {
        let observer = FlightObserver::new();
        let now = Utc::now();
        observer.ingest_line(
            "MSG,1,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,TEST,,,,,,,,,,,",
            now,
        );
        observer.ingest_line(
            "MSG,3,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,10000,,,46.5,15.0,,,0,0,0,0",
            now,
        );
        observer.ingest_line(
            "MSG,4,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,,420,90,,,0,,0,0,0,0",
            now,
        );

        let mut seen = 0;
        observer.take_updated(|obs| {
            assert_eq!(obs.icao24, "ABC123");
            seen += 1;
        });
        assert_eq!(seen, 1);
        assert!(observer.snapshot().iter().all(|obs| !obs.updated));

        // nothing new: the next pass visits nothing
        observer.take_updated(|_| seen += 1);
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_distribution_percentages() {
        let observer = FlightObserver::new();
        let now = Utc::now();
        for _ in 0..3 {
            observer.ingest_line(
                "MSG,3,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,10000,,,46.5,15.0,,,0,0,0,0",
                now,
            );
        }
        observer.ingest_line(
            "MSG,1,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,TEST,,,,,,,,,,,",
            now,
        );

        let stats = observer.stats();
        assert_eq!(stats.distribution[0], ("ES_AIRBORNE_POS", 75.0));
        assert_eq!(stats.distribution[1], ("ES_IDENT_AND_CATEGORY", 25.0));
    }
}
