//! Per-router and per-panel liveness watchdog.
//!
//! The ingest loop touches [`LivenessMap`] synchronously as messages arrive
//! (see `cgtw-ingest`), so a lagging storage layer never makes a live device
//! look offline. The watchdog only reads it, on a timer, and emits
//! online/stale/offline transition events.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;

use cgtw_config::EventsPolicyCfg;

type PanelKey = (String, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Online,
    Stale,
    Offline,
}

impl LivenessState {
    fn as_str(self) -> &'static str {
        match self {
            LivenessState::Online => "online",
            LivenessState::Stale => "stale",
            LivenessState::Offline => "offline",
        }
    }
}

/// Shared between the ingest loop (writer) and the watchdog (reader).
/// Entries are never removed; once a router or panel has been seen it stays
/// in the map for the life of the process.
pub struct LivenessMap {
    router_last_seen: DashMap<String, DateTime<Utc>>,
    panel_last_seen: DashMap<PanelKey, DateTime<Utc>>,
    router_state: DashMap<String, LivenessState>,
    panel_state: DashMap<PanelKey, LivenessState>,
}

impl LivenessMap {
    pub fn new() -> Self {
        Self {
            router_last_seen: DashMap::new(),
            panel_last_seen: DashMap::new(),
            router_state: DashMap::new(),
            panel_state: DashMap::new(),
        }
    }

    /// Touch on a telemetry-topic message.
    pub fn touch_router(&self, router_sn: &str) {
        self.router_last_seen.insert(router_sn.to_string(), Utc::now());
    }

    /// Touch on a decoded-topic message. Refreshes both the router and the
    /// panel, matching `_touch_last_seen`'s decoded branch in the source.
    pub fn touch_panel(&self, router_sn: &str, panel_id: i32) {
        self.touch_router(router_sn);
        self.panel_last_seen
            .insert((router_sn.to_string(), panel_id), Utc::now());
    }
}

impl Default for LivenessMap {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(age_sec: f64, stale_sec: i64, offline_sec: i64) -> LivenessState {
    if age_sec >= offline_sec as f64 {
        LivenessState::Offline
    } else if age_sec >= stale_sec as f64 {
        LivenessState::Stale
    } else {
        LivenessState::Online
    }
}

/// `None` when the transition (e.g. `* -> stale`) is not itself eventful.
fn transition_event_type(prefix: &str, prev: LivenessState, new: LivenessState) -> Option<String> {
    use LivenessState::*;
    match new {
        Offline => Some(format!("{prefix}_offline")),
        Online if matches!(prev, Offline | Stale) => Some(format!("{prefix}_online")),
        _ => None,
    }
}

/// One watchdog sweep: classify every known router and panel, emit events
/// for state transitions, and update the previous-state maps in place.
pub async fn run_once(pool: &PgPool, liveness: &LivenessMap, cfg: &EventsPolicyCfg) -> anyhow::Result<()> {
    let now = Utc::now();

    let routers: Vec<(String, DateTime<Utc>)> = liveness
        .router_last_seen
        .iter()
        .map(|e| (e.key().clone(), *e.value()))
        .collect();

    for (router_sn, ts) in routers {
        let age = (now - ts).num_milliseconds() as f64 / 1000.0;
        let prev = liveness
            .router_state
            .get(&router_sn)
            .map(|v| *v)
            .unwrap_or(LivenessState::Online);
        let new_state = classify(age, cfg.router_stale_sec, cfg.router_offline_sec);

        if new_state != prev {
            if let Some(event_type) = transition_event_type("router", prev, new_state) {
                tracing::info!(router_sn, from = prev.as_str(), to = new_state.as_str(), "router liveness transition");
                cgtw_db::insert_event(
                    pool,
                    &cgtw_db::NewEvent {
                        router_sn: router_sn.clone(),
                        equip_type: None,
                        panel_id: None,
                        event_type,
                        description: Some(format!("{} → {}", prev.as_str(), new_state.as_str())),
                        payload: None,
                    },
                )
                .await?;
            }
            liveness.router_state.insert(router_sn, new_state);
        }
    }

    let panels: Vec<(PanelKey, DateTime<Utc>)> = liveness
        .panel_last_seen
        .iter()
        .map(|e| (e.key().clone(), *e.value()))
        .collect();

    for ((router_sn, panel_id), ts) in panels {
        let age = (now - ts).num_milliseconds() as f64 / 1000.0;
        let key = (router_sn.clone(), panel_id);
        let prev = liveness
            .panel_state
            .get(&key)
            .map(|v| *v)
            .unwrap_or(LivenessState::Online);
        let new_state = classify(age, cfg.panel_stale_sec, cfg.panel_offline_sec);

        if new_state != prev {
            if let Some(event_type) = transition_event_type("panel", prev, new_state) {
                tracing::info!(
                    router_sn,
                    panel_id,
                    from = prev.as_str(),
                    to = new_state.as_str(),
                    "panel liveness transition"
                );
                cgtw_db::insert_event(
                    pool,
                    &cgtw_db::NewEvent {
                        router_sn: router_sn.clone(),
                        equip_type: Some(cgtw_schemas::EQUIP_TYPE_PCC.to_string()),
                        panel_id: Some(panel_id),
                        event_type,
                        description: Some(format!(
                            "panel_id={panel_id} {} → {}",
                            prev.as_str(),
                            new_state.as_str()
                        )),
                        payload: None,
                    },
                )
                .await?;
            }
            liveness.panel_state.insert(key, new_state);
        }
    }

    Ok(())
}

/// Runs forever, sleeping `check_interval_sec` between sweeps. Errors are
/// logged and the loop continues at the next interval; cancellation is left
/// to the caller (abort the task on shutdown).
pub async fn watchdog_loop(pool: PgPool, liveness: std::sync::Arc<LivenessMap>, cfg: EventsPolicyCfg) {
    let interval = Duration::from_secs(cfg.check_interval_sec.max(1));
    tracing::info!(interval_sec = cfg.check_interval_sec, "watchdog started");

    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = run_once(&pool, &liveness, &cfg).await {
            tracing::error!(error = %e, "watchdog check error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_thresholds() {
        assert_eq!(classify(0.0, 120, 300), LivenessState::Online);
        assert_eq!(classify(120.0, 120, 300), LivenessState::Stale);
        assert_eq!(classify(300.0, 120, 300), LivenessState::Offline);
        assert_eq!(classify(299.9, 120, 300), LivenessState::Stale);
    }

    #[test]
    fn only_offline_and_recovery_online_are_eventful() {
        use LivenessState::*;
        assert_eq!(transition_event_type("router", Online, Stale), None);
        assert_eq!(transition_event_type("router", Stale, Offline), Some("router_offline".to_string()));
        assert_eq!(transition_event_type("router", Online, Offline), Some("router_offline".to_string()));
        assert_eq!(transition_event_type("router", Offline, Online), Some("router_online".to_string()));
        assert_eq!(transition_event_type("router", Stale, Online), Some("router_online".to_string()));
        assert_eq!(transition_event_type("router", Stale, Stale), None);
    }

    #[test]
    fn touch_panel_also_refreshes_router() {
        let lm = LivenessMap::new();
        lm.touch_panel("R1", 7);
        assert!(lm.router_last_seen.contains_key("R1"));
        assert!(lm.panel_last_seen.contains_key(&("R1".to_string(), 7)));
    }
}
