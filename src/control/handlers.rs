//! Command handlers and the state they share with the supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use serde_json::{Value, json};
use tokio::sync::Notify;

use super::protocol::{ErrorCode, Reply, Request};
use super::server::{CommandServer, Publisher};
use crate::audio::StreamStats;
use crate::audio::dac_capability;
use crate::filter::PhaseType;

/// Control-plane state. Written by handlers, read by the supervisor and STATS.
pub struct ControlState {
    phase: AtomicU8,
    reloads: AtomicU64,
    soft_resets: AtomicU64,
    started: Instant,
    pub stats: Arc<StreamStats>,
    pub reload: Notify,
    pub shutdown: Notify,
}

impl ControlState {
    pub fn new(phase: PhaseType, stats: Arc<StreamStats>) -> Self {
        Self {
            phase: AtomicU8::new(phase_to_u8(phase)),
            reloads: AtomicU64::new(0),
            soft_resets: AtomicU64::new(0),
            started: Instant::now(),
            stats,
            reload: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    pub fn phase(&self) -> PhaseType {
        match self.phase.load(Ordering::Acquire) {
            1 => PhaseType::Linear,
            _ => PhaseType::Minimum,
        }
    }

    fn set_phase(&self, phase: PhaseType) {
        self.phase.store(phase_to_u8(phase), Ordering::Release);
    }
}

fn phase_to_u8(phase: PhaseType) -> u8 {
    match phase {
        PhaseType::Minimum => 0,
        PhaseType::Linear => 1,
    }
}

fn phase_reply(phase: PhaseType) -> Reply {
    Reply::ok(json!({ "phase_type": phase.as_str() }))
}

fn stats_reply(state: &ControlState) -> Reply {
    let mut data = serde_json::to_value(state.stats.snapshot()).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut data {
        map.insert(
            "uptime_ms".into(),
            json!(state.started.elapsed().as_millis() as u64),
        );
        map.insert("phase_type".into(), json!(state.phase().as_str()));
        map.insert("reloads".into(), json!(state.reloads.load(Ordering::Relaxed)));
        map.insert(
            "soft_resets".into(),
            json!(state.soft_resets.load(Ordering::Relaxed)),
        );
    }
    Reply::ok(data)
}

fn set_phase(state: &ControlState, publisher: &Publisher, request: &Request) -> Reply {
    let Some(value) = request.param("phase").or_else(|| request.param("phase_type")) else {
        return Reply::error(ErrorCode::InvalidParams, "phase is required");
    };
    let Some(text) = value.as_str() else {
        return Reply::error(ErrorCode::InvalidParams, "phase must be a string");
    };
    match text.parse::<PhaseType>() {
        Ok(phase) => {
            state.set_phase(phase);
            log::info!("Phase type set to {}", phase);
            publisher.publish("phase_changed", json!({ "phase_type": phase.as_str() }));
            phase_reply(phase)
        }
        Err(e) => Reply::error(ErrorCode::InvalidParams, e),
    }
}

fn list_devices() -> Reply {
    let (playback, capture) = dac_capability::list_devices();
    Reply::ok(json!({ "playback": playback, "capture": capture }))
}

/// Registers every command on `server`.
pub fn register_handlers(server: &mut CommandServer, state: Arc<ControlState>, publisher: Publisher) {
    server.register("PING", |_| Reply::ok(json!({ "pong": true })));

    let s = state.clone();
    server.register("STATS", move |_| stats_reply(&s));

    let (s, p) = (state.clone(), publisher.clone());
    server.register("RELOAD", move |_| {
        s.reloads.fetch_add(1, Ordering::Relaxed);
        s.reload.notify_one();
        p.publish("reload_requested", json!({ "phase_type": s.phase().as_str() }));
        Reply::ok(json!({ "reloaded": true }))
    });

    let s = state.clone();
    server.register("SOFT_RESET", move |_| {
        s.soft_resets.fetch_add(1, Ordering::Relaxed);
        s.stats.request_reset();
        Reply::ok(json!({ "reset": true }))
    });

    let s = state.clone();
    server.register("PHASE_TYPE_GET", move |_| phase_reply(s.phase()));

    let (s, p) = (state.clone(), publisher.clone());
    server.register("PHASE_TYPE_SET", move |request| set_phase(&s, &p, request));

    server.register("LIST_ALSA_DEVICES", |_| list_devices());
    server.register("list_alsa_devices", |_| list_devices());

    let (s, p) = (state, publisher);
    server.register("SHUTDOWN", move |_| {
        log::info!("Shutdown requested over control socket");
        s.shutdown.notify_one();
        p.publish("shutdown", Value::Null);
        Reply::ok(json!({ "shutdown": true }))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn setup() -> (CommandServer, Arc<ControlState>) {
        let state = Arc::new(ControlState::new(
            PhaseType::Minimum,
            Arc::new(StreamStats::default()),
        ));
        let mut server = CommandServer::new();
        register_handlers(&mut server, state.clone(), Publisher::disabled());
        (server, state)
    }

    fn call(server: &CommandServer, payload: &str) -> Value {
        serde_json::from_str(&server.handle_message(payload)).unwrap()
    }

    #[test]
    fn phase_set_then_get() {
        let (server, state) = setup();
        let reply = call(&server, r#"{"cmd":"PHASE_TYPE_SET","params":{"phase":"linear"}}"#);
        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["data"]["phase_type"], "linear");

        let reply = call(&server, r#"{"cmd":"PHASE_TYPE_GET"}"#);
        assert_eq!(reply["data"]["phase_type"], "linear");
        assert_eq!(state.phase(), PhaseType::Linear);
    }

    #[test]
    fn invalid_phase_keeps_previous_value() {
        let (server, state) = setup();
        call(&server, r#"{"cmd":"PHASE_TYPE_SET","phase_type":"linear"}"#);

        for payload in [
            r#"{"cmd":"PHASE_TYPE_SET","params":{"phase":"mixed"}}"#,
            r#"{"cmd":"PHASE_TYPE_SET","params":{"phase":3}}"#,
            r#"{"cmd":"PHASE_TYPE_SET"}"#,
        ] {
            let reply = call(&server, payload);
            assert_eq!(reply["status"], "error");
            assert_eq!(reply["error_code"], "INVALID_PARAMS");
        }
        assert_eq!(state.phase(), PhaseType::Linear);

        let reply = call(&server, r#"{"cmd":"PHASE_TYPE_SET","params":{"phase":"minimum"}}"#);
        assert_eq!(reply["data"]["phase_type"], "min");
    }

    #[test]
    fn stats_and_counters() {
        let (server, state) = setup();
        state.stats.begin_run(44_100, 705_600, 16, Some("cpu"));

        assert_eq!(call(&server, "RELOAD")["data"]["reloaded"], true);
        assert_eq!(call(&server, r#"{"cmd":"SOFT_RESET"}"#)["data"]["reset"], true);
        assert!(state.stats.take_reset_request());

        let data = &call(&server, r#"{"cmd":"STATS"}"#)["data"];
        assert_eq!(data["reloads"], 1);
        assert_eq!(data["soft_resets"], 1);
        assert_eq!(data["phase_type"], "min");
        assert_eq!(data["output_rate"], 705_600);
        assert_eq!(data["upsample_factor"], 16);
        assert_eq!(data["backend"], "cpu");
        assert!(data["uptime_ms"].is_u64());
    }

    #[test]
    fn ping_and_unknown() {
        let (server, _) = setup();
        assert_eq!(call(&server, r#"{"cmd":"PING"}"#)["data"]["pong"], true);
        let reply = call(&server, r#"{"cmd":"REBOOT"}"#);
        assert_eq!(reply["error_code"], "UNKNOWN_CMD");
    }

    #[test]
    fn device_listing_has_both_directions() {
        let (server, _) = setup();
        for cmd in ["LIST_ALSA_DEVICES", "list_alsa_devices"] {
            let reply = call(&server, cmd);
            assert_eq!(reply["status"], "ok");
            assert!(reply["data"]["playback"].is_array());
            assert!(reply["data"]["capture"].is_array());
        }
    }

    #[tokio::test]
    async fn shutdown_and_reload_wake_the_supervisor() {
        let (server, state) = setup();
        call(&server, "SHUTDOWN");
        call(&server, "RELOAD");
        // permits are stored until someone waits
        let woke = AtomicBool::new(false);
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            state.shutdown.notified().await;
            state.reload.notified().await;
            woke.store(true, Ordering::Relaxed);
        })
        .await
        .unwrap();
        assert!(woke.load(Ordering::Relaxed));
    }
}
