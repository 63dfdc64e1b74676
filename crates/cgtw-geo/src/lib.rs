//! Great-circle distance and the per-device GPS anti-teleport filter.

use chrono::{DateTime, Utc};

/// Mean Earth radius in meters, used by [`haversine_m`].
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two (lat, lon) pairs, in meters.
///
/// Pure function, no failure modes.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let r_lat1 = lat1.to_radians();
    let r_lat2 = lat2.to_radians();
    let d_lat = r_lat2 - r_lat1;
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + r_lat1.cos() * r_lat2.cos() * (d_lon / 2.0).sin().powi(2);

    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct GpsFilterConfig {
    pub sats_min: i32,
    pub fix_min: i32,
    pub deadband_m: f64,
    pub max_jump_m: f64,
    pub max_speed_kmh: f64,
    pub confirm_points: usize,
    pub confirm_radius_m: f64,
}

impl Default for GpsFilterConfig {
    fn default() -> Self {
        Self {
            sats_min: 4,
            fix_min: 1,
            deadband_m: 30.0,
            max_jump_m: 500.0,
            max_speed_kmh: 120.0,
            confirm_points: 3,
            confirm_radius_m: 50.0,
        }
    }
}

// ---------------------------------------------------------------------------
// GpsPoint / GpsVerdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct GpsPoint {
    pub lat: f64,
    pub lon: f64,
    pub satellites: Option<i32>,
    pub fix_status: Option<i32>,
    pub gps_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpsVerdict {
    pub accepted: bool,
    pub reject_reason: Option<String>,
}

impl GpsVerdict {
    fn accept() -> Self {
        GpsVerdict {
            accepted: true,
            reject_reason: None,
        }
    }

    fn reject(reason: &str) -> Self {
        GpsVerdict {
            accepted: false,
            reject_reason: Some(reason.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// GpsFilter
// ---------------------------------------------------------------------------

/// Per-device anti-teleport filter. One instance per router serial number;
/// callers keep a map of `router_sn -> GpsFilter` (see `cgtw-dispatch`).
pub struct GpsFilter {
    cfg: GpsFilterConfig,
    last_accepted: Option<GpsPoint>,
    confirm_buffer: Vec<GpsPoint>,
}

impl GpsFilter {
    pub fn new(cfg: GpsFilterConfig) -> Self {
        Self {
            cfg,
            last_accepted: None,
            confirm_buffer: Vec::new(),
        }
    }

    /// The last point this filter accepted, if any.
    pub fn last_accepted(&self) -> Option<GpsPoint> {
        self.last_accepted
    }

    /// Warm-start from a stored filtered-latest row at boot.
    pub fn set_initial(&mut self, pt: GpsPoint) {
        self.last_accepted = Some(pt);
    }

    /// Decide whether `pt` is accepted as real movement or rejected as noise.
    pub fn check(&mut self, pt: GpsPoint) -> GpsVerdict {
        let cfg = &self.cfg;

        // 1) Quality gate.
        if let Some(sats) = pt.satellites {
            if sats < cfg.sats_min {
                self.confirm_buffer.clear();
                return GpsVerdict::reject("low_sats");
            }
        }
        if let Some(fix) = pt.fix_status {
            if fix < cfg.fix_min {
                self.confirm_buffer.clear();
                return GpsVerdict::reject("bad_fix");
            }
        }

        let Some(last) = self.last_accepted else {
            self.accept(pt);
            return GpsVerdict::accept();
        };

        let dist = haversine_m(last.lat, last.lon, pt.lat, pt.lon);

        // 2) Deadband.
        if dist < cfg.deadband_m {
            self.confirm_buffer.clear();
            return GpsVerdict::accept();
        }

        // 3) Jump gate.
        let mut dt_sec = (pt.received_at - last.received_at).num_milliseconds() as f64 / 1000.0;
        if dt_sec <= 0.0 {
            dt_sec = 1.0;
        }

        if dist > cfg.max_jump_m {
            return self.try_confirm(pt, "jump_distance");
        }

        let speed_kmh = (dist / dt_sec) * 3.6;
        if speed_kmh > cfg.max_speed_kmh {
            return self.try_confirm(pt, "jump_speed");
        }

        self.accept(pt);
        GpsVerdict::accept()
    }

    fn accept(&mut self, pt: GpsPoint) {
        self.last_accepted = Some(pt);
        self.confirm_buffer.clear();
    }

    fn try_confirm(&mut self, pt: GpsPoint, reason: &str) -> GpsVerdict {
        let cfg = &self.cfg;

        if let Some(reference) = self.confirm_buffer.first().copied() {
            let d_to_ref = haversine_m(reference.lat, reference.lon, pt.lat, pt.lon);
            if d_to_ref > cfg.confirm_radius_m {
                self.confirm_buffer = vec![pt];
                return GpsVerdict::reject(reason);
            }
            self.confirm_buffer.push(pt);
        } else {
            self.confirm_buffer.push(pt);
        }

        if self.confirm_buffer.len() >= cfg.confirm_points {
            tracing::info!(
                points = self.confirm_buffer.len(),
                radius_m = cfg.confirm_radius_m,
                "gps confirm move"
            );
            self.accept(pt);
            return GpsVerdict::accept();
        }

        GpsVerdict::reject(reason)
    }
}
