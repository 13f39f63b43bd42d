// Lorekeep Runtime — Automation Engine
//
// Subscribes to the event bus, runs a one-minute cron tick, and drives the
// execution pipeline for every qualifying automation. All in-memory state
// (rate windows, minute keys, backoff attempts) is owned here, seeded empty
// on start and cleared on stop — no statics.
//
// Module layout:
//   cron       — five-field matching, minute keys, catch-up search
//   rate_limit — triple sliding-window limiter
//   template   — prompt placeholder rendering
//   actions    — notification / create_gtask / draft_gmail dispatch
//   pipeline   — execute_automation + dedupe key derivation

pub mod actions;
pub mod cron;
pub mod pipeline;
pub mod rate_limit;
pub mod template;

pub use pipeline::generate_dedupe_key;

use crate::atoms::constants::{
    AUTOMATION_LLM_PERMITS, CATCH_UP_LOOKBACK_DAYS, RETENTION_INTERVAL_HOURS,
};
use crate::atoms::error::EngineResult;
use crate::atoms::traits::{MailPort, TaskListPort, UiSink};
use crate::engine::events::EventBus;
use crate::engine::providers::AnyProvider;
use crate::engine::store::Store;
use crate::engine::types::*;
use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use rate_limit::RateLimiter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Resolve the provider + model for a domain, honoring its overrides.
pub type ProviderResolver = Arc<dyn Fn(&Domain) -> Option<(AnyProvider, String)> + Send + Sync>;

pub struct AutomationEngine {
    pub(crate) store: Arc<Store>,
    pub(crate) ui: Arc<dyn UiSink>,
    pub(crate) resolver: ProviderResolver,
    pub(crate) mail: Option<Arc<dyn MailPort>>,
    pub(crate) tasks: Option<Arc<dyn TaskListPort>>,
    /// Global gate on automation LLM calls (3 permits). Chat and missions
    /// do not go through this.
    pub(crate) llm_semaphore: Arc<tokio::sync::Semaphore>,
    pub(crate) rate_limiter: RateLimiter,
    /// In-memory exponential-backoff attempt counter per automation.
    pub(crate) backoff_attempts: Mutex<HashMap<String, usize>>,
    /// Most recent minute key each schedule automation fired at.
    last_minute_key: Mutex<HashMap<String, String>>,
    stop: Arc<AtomicBool>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl AutomationEngine {
    pub fn new(
        store: Arc<Store>,
        ui: Arc<dyn UiSink>,
        resolver: ProviderResolver,
        mail: Option<Arc<dyn MailPort>>,
        tasks: Option<Arc<dyn TaskListPort>>,
    ) -> Arc<Self> {
        Arc::new(AutomationEngine {
            store,
            ui,
            resolver,
            mail,
            tasks,
            llm_semaphore: Arc::new(tokio::sync::Semaphore::new(AUTOMATION_LLM_PERMITS)),
            rate_limiter: RateLimiter::new(),
            backoff_attempts: Mutex::new(HashMap::new()),
            last_minute_key: Mutex::new(HashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        })
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Run startup jobs, subscribe to the bus, and spawn the tick and
    /// retention loops.
    pub async fn start(self: &Arc<Self>, bus: &EventBus) -> EngineResult<()> {
        self.stop.store(false, Ordering::Relaxed);

        // Startup jobs, in order and idempotent.
        self.store.recover_crashed_runs()?;
        self.store.cleanup_old_runs()?;
        self.run_catch_up().await?;

        // Event subscription: handlers are synchronous on the bus, so the
        // actual execution is spawned.
        let engine = self.clone();
        bus.subscribe(move |event| {
            let engine = engine.clone();
            let event = event.clone();
            tokio::spawn(async move {
                engine.dispatch_event(&event).await;
            });
        });

        // Cron tick: sleep 60s but evaluate against the wall clock each
        // iteration — a wakeup delayed by OS sleep still sees real time.
        let engine = self.clone();
        let tick = tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                if engine.stop.load(Ordering::Relaxed) {
                    break;
                }
                engine.cron_tick(Utc::now()).await;
            }
        });

        // Retention repeats every 24h.
        let engine = self.clone();
        let retention = tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(
                    RETENTION_INTERVAL_HOURS as u64 * 3600,
                ))
                .await;
                if engine.stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = engine.store.cleanup_old_runs() {
                    warn!("[automation] Retention cleanup failed: {}", e);
                }
            }
        });

        let mut handles = self.handles.lock();
        handles.push(tick);
        handles.push(retention);
        info!("[automation] Engine started");
        Ok(())
    }

    /// Stop loops and drop all in-memory counters.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        self.rate_limiter.clear();
        self.backoff_attempts.lock().clear();
        self.last_minute_key.lock().clear();
        info!("[automation] Engine stopped");
    }

    // ── Cron tick ──────────────────────────────────────────────────────

    pub async fn cron_tick(self: &Arc<Self>, now: chrono::DateTime<Utc>) {
        let automations = match self.store.list_schedule_automations() {
            Ok(list) => list,
            Err(e) => {
                warn!("[automation] Tick failed to list automations: {}", e);
                return;
            }
        };
        let key = cron::minute_key(now);

        for automation in automations {
            let Some(expr) = automation.trigger_cron.as_deref() else { continue };

            // Double-fire guard: one dispatch per automation per minute.
            if self.last_minute_key.lock().get(&automation.id) == Some(&key) {
                continue;
            }
            if !cron::matches_cron(expr, now) {
                continue;
            }
            self.last_minute_key.lock().insert(automation.id.clone(), key.clone());

            let engine = self.clone();
            let minute = key.clone();
            tokio::spawn(async move {
                if let Err(e) = engine
                    .execute_automation(&automation, TriggerKind::Schedule, None, None, &minute, None)
                    .await
                {
                    warn!("[automation] Scheduled run of '{}' errored: {}", automation.name, e);
                }
            });
        }
    }

    // ── Event dispatch ─────────────────────────────────────────────────

    /// Fire event automations matching the bus event. An event with no
    /// domain id is a wildcard (pre-classification intake).
    pub async fn dispatch_event(self: &Arc<Self>, event: &BusEvent) {
        let automations = match self.store.list_event_automations(event.kind) {
            Ok(list) => list,
            Err(e) => {
                warn!("[automation] Event dispatch failed to list automations: {}", e);
                return;
            }
        };

        let key = cron::minute_key(Utc::now());
        for automation in automations {
            if let Some(domain_id) = &event.domain_id {
                if !domain_id.is_empty() && *domain_id != automation.domain_id {
                    continue;
                }
            }
            if let Err(e) = self
                .execute_automation(
                    &automation,
                    TriggerKind::Event,
                    Some(event.kind),
                    Some(event.data.clone()),
                    &key,
                    None,
                )
                .await
            {
                warn!("[automation] Event run of '{}' errored: {}", automation.name, e);
            }
        }
    }

    // ── Catch-up ───────────────────────────────────────────────────────

    /// For schedule automations with catch_up_enabled: if the most recent
    /// cron match (searching back up to 7 days) is newer than the last run,
    /// fire once for that missed match.
    pub async fn run_catch_up(self: &Arc<Self>) -> EngineResult<()> {
        let now = Utc::now();
        let automations = self.store.list_schedule_automations()?;
        for automation in automations {
            if !automation.catch_up_enabled {
                continue;
            }
            let Some(expr) = automation.trigger_cron.as_deref() else { continue };
            let Some(last_match) = cron::last_cron_match(expr, now, CATCH_UP_LOOKBACK_DAYS) else {
                continue;
            };
            let missed = match &automation.last_run_at {
                None => true,
                Some(last_run) => chrono::DateTime::parse_from_rfc3339(last_run)
                    .map(|t| t.with_timezone(&Utc) < last_match)
                    .unwrap_or(true),
            };
            if !missed {
                continue;
            }

            info!(
                "[automation] Catch-up firing '{}' for missed match {}",
                automation.name,
                last_match.to_rfc3339()
            );
            // Key the run to the missed minute so a racing tick in the same
            // minute collides on the dedupe key instead of double-firing.
            let minute = cron::minute_key(last_match);
            self.last_minute_key.lock().insert(automation.id.clone(), cron::minute_key(now));
            if let Err(e) = self
                .execute_automation(&automation, TriggerKind::Schedule, None, None, &minute, None)
                .await
            {
                warn!("[automation] Catch-up run of '{}' errored: {}", automation.name, e);
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::atoms::traits::ProviderError;
    use crate::engine::automation::actions::test_support::RecordingSink;
    use crate::engine::store::AutomationSpec;
    use serde_json::json;

    fn store_with_automation(trigger: TriggerKind, cron: Option<&str>) -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.create_domain("d1", "Research", "/kb").unwrap();
        store
            .create_automation(
                "a1",
                &AutomationSpec {
                    domain_id: "d1".into(),
                    name: "digest".into(),
                    prompt_template: "Summarize {{domain_name}} on {{current_date}}".into(),
                    trigger_kind: trigger,
                    trigger_cron: cron.map(|s| s.to_string()),
                    trigger_event: None,
                    action_kind: ActionKind::Notification,
                    action_config: json!({}),
                    store_payloads: false,
                    catch_up_enabled: false,
                    deadline_window_days: None,
                },
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn successful_run_resets_streak() {
        let store = store_with_automation(TriggerKind::Manual, None);
        store.increment_failure_streak("a1").unwrap();
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::ok(&["summary text"]),
            Arc::new(RecordingSink::default()),
        );
        let automation = store.get_automation("a1").unwrap().unwrap();
        let run_id = engine
            .execute_automation(&automation, TriggerKind::Manual, None, None, "m", Some("req-1"))
            .await
            .unwrap()
            .unwrap();
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.response_hash.is_some());
        assert!(run.duration_ms.is_some());
        let automation = store.get_automation("a1").unwrap().unwrap();
        assert_eq!(automation.failure_streak, 0);
        assert_eq!(automation.run_count, 1);
    }

    #[tokio::test]
    async fn disabled_automation_skips_with_code() {
        let store = store_with_automation(TriggerKind::Manual, None);
        store.set_automation_enabled("a1", false).unwrap();
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::ok(&[]),
            Arc::new(RecordingSink::default()),
        );
        let automation = store.get_automation("a1").unwrap().unwrap();
        let run_id = engine
            .execute_automation(&automation, TriggerKind::Manual, None, None, "m", Some("r1"))
            .await
            .unwrap()
            .unwrap();
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Skipped);
        assert_eq!(run.error_code, Some(RunErrorCode::AutomationDisabled));
    }

    #[tokio::test]
    async fn rate_limited_second_fire_gets_cooldown() {
        let store = store_with_automation(TriggerKind::Manual, None);
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::ok(&["one", "two"]),
            Arc::new(RecordingSink::default()),
        );
        let automation = store.get_automation("a1").unwrap().unwrap();
        engine
            .execute_automation(&automation, TriggerKind::Manual, None, None, "m", Some("r1"))
            .await
            .unwrap();
        let run2 = engine
            .execute_automation(&automation, TriggerKind::Manual, None, None, "m", Some("r2"))
            .await
            .unwrap()
            .unwrap();
        let run = store.get_run(&run2).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Skipped);
        assert_eq!(run.error_code, Some(RunErrorCode::RateLimited));

        // Cooldown landed about five minutes out.
        let automation = store.get_automation("a1").unwrap().unwrap();
        let until = chrono::DateTime::parse_from_rfc3339(automation.cooldown_until.as_deref().unwrap())
            .unwrap()
            .with_timezone(&Utc);
        let delta = (until - Utc::now()).num_seconds();
        assert!((290..=310).contains(&delta), "cooldown delta was {delta}s");
    }

    #[tokio::test]
    async fn five_llm_failures_disable_and_notify() {
        let store = store_with_automation(TriggerKind::Manual, None);
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::failing(ProviderError::Api { status: 500, message: "boom".into() }),
            sink.clone(),
        );
        for i in 0..5 {
            // Clear the cooldown the backoff policy sets, so each failure
            // reaches the LLM instead of skipping on the guard.
            store.set_automation_cooldown("a1", None).unwrap();
            let automation = store.get_automation("a1").unwrap().unwrap();
            engine
                .execute_automation(
                    &automation,
                    TriggerKind::Manual,
                    None,
                    None,
                    &format!("m{}", i / 2),
                    Some(&format!("r{i}")),
                )
                .await
                .unwrap();
            // Stay under the per-automation rate window.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            engine.rate_limiter.clear();
        }
        let automation = store.get_automation("a1").unwrap().unwrap();
        assert!(!automation.enabled);
        assert_eq!(automation.failure_streak, 5);
        let events = sink.events.lock();
        let disabled_note = events.iter().any(|e| match e {
            UiEvent::Notification { body, .. } => body.contains("disabled due to 5 consecutive failures"),
            _ => false,
        });
        assert!(disabled_note, "expected a disable notification, got {events:?}");
    }

    #[tokio::test]
    async fn backoff_cooldown_escalates() {
        let store = store_with_automation(TriggerKind::Manual, None);
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::failing(ProviderError::Transport("down".into())),
            Arc::new(RecordingSink::default()),
        );
        for (i, expected_min) in [(0usize, 55i64), (1, 290), (2, 880)] {
            store.set_automation_cooldown("a1", None).unwrap();
            engine.rate_limiter.clear();
            let automation = store.get_automation("a1").unwrap().unwrap();
            engine
                .execute_automation(&automation, TriggerKind::Manual, None, None, "m", Some(&format!("r{i}")))
                .await
                .unwrap();
            let automation = store.get_automation("a1").unwrap().unwrap();
            let until =
                chrono::DateTime::parse_from_rfc3339(automation.cooldown_until.as_deref().unwrap())
                    .unwrap()
                    .with_timezone(&Utc);
            let delta = (until - Utc::now()).num_seconds();
            assert!(delta >= expected_min, "attempt {i}: cooldown {delta}s");
        }
    }

    #[tokio::test]
    async fn semaphore_returns_to_full_on_every_exit_path() {
        let store = store_with_automation(TriggerKind::Manual, None);
        // Success path.
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::ok(&["fine"]),
            Arc::new(RecordingSink::default()),
        );
        let automation = store.get_automation("a1").unwrap().unwrap();
        engine
            .execute_automation(&automation, TriggerKind::Manual, None, None, "m", Some("r1"))
            .await
            .unwrap();
        assert_eq!(engine.llm_semaphore.available_permits(), 3);

        // Failure path.
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::failing(ProviderError::Transport("down".into())),
            Arc::new(RecordingSink::default()),
        );
        let automation = store.get_automation("a1").unwrap().unwrap();
        engine
            .execute_automation(&automation, TriggerKind::Manual, None, None, "m", Some("r2"))
            .await
            .unwrap();
        assert_eq!(engine.llm_semaphore.available_permits(), 3);
    }

    #[tokio::test]
    async fn template_error_fails_with_code() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.create_domain("d1", "Research", "/kb").unwrap();
        store
            .create_automation(
                "a1",
                &AutomationSpec {
                    domain_id: "d1".into(),
                    name: "bad".into(),
                    prompt_template: "{{unknown_var}}".into(),
                    trigger_kind: TriggerKind::Manual,
                    trigger_cron: None,
                    trigger_event: None,
                    action_kind: ActionKind::Notification,
                    action_config: json!({}),
                    store_payloads: false,
                    catch_up_enabled: false,
                    deadline_window_days: None,
                },
            )
            .unwrap();
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::ok(&[]),
            Arc::new(RecordingSink::default()),
        );
        let automation = store.get_automation("a1").unwrap().unwrap();
        let run_id = engine
            .execute_automation(&automation, TriggerKind::Manual, None, None, "m", Some("r1"))
            .await
            .unwrap()
            .unwrap();
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_code, Some(RunErrorCode::TemplateRenderError));
    }

    #[tokio::test]
    async fn event_dispatch_respects_domain_and_wildcard() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.create_domain("d1", "Research", "/kb").unwrap();
        store.create_domain("d2", "Ops", "/kb2").unwrap();
        for (id, domain) in [("a1", "d1"), ("a2", "d2")] {
            store
                .create_automation(
                    id,
                    &AutomationSpec {
                        domain_id: domain.into(),
                        name: format!("on-intake-{id}"),
                        prompt_template: "{{event_type}}".into(),
                        trigger_kind: TriggerKind::Event,
                        trigger_cron: None,
                        trigger_event: Some(BusEventKind::IntakeCreated),
                        action_kind: ActionKind::Notification,
                        action_config: json!({}),
                        store_payloads: false,
                        catch_up_enabled: false,
                        deadline_window_days: None,
                    },
                )
                .unwrap();
        }
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::ok(&["x", "y", "z"]),
            Arc::new(RecordingSink::default()),
        );

        // Domain-scoped event: only d1's automation fires.
        engine
            .dispatch_event(&BusEvent {
                kind: BusEventKind::IntakeCreated,
                domain_id: Some("d1".into()),
                data: json!({"n": 1}),
            })
            .await;
        assert_eq!(store.list_runs("a1", 10).unwrap().len(), 1);
        assert_eq!(store.list_runs("a2", 10).unwrap().len(), 0);

        // Wildcard event (no domain): both fire.
        engine.rate_limiter.clear();
        engine
            .dispatch_event(&BusEvent {
                kind: BusEventKind::IntakeCreated,
                domain_id: None,
                data: json!({"n": 2}),
            })
            .await;
        assert_eq!(store.list_runs("a1", 10).unwrap().len(), 2);
        assert_eq!(store.list_runs("a2", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cron_tick_fires_once_per_minute_key() {
        let store = store_with_automation(TriggerKind::Schedule, Some("0 9 * * *"));
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::ok(&["morning"]),
            Arc::new(RecordingSink::default()),
        );
        let at_nine = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 6, 15, 9, 0, 10).unwrap();
        engine.cron_tick(at_nine).await;
        engine.cron_tick(at_nine + chrono::Duration::seconds(30)).await;
        // Let the spawned executions settle.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let runs = store.list_runs("a1", 10).unwrap();
        assert_eq!(runs.len(), 1, "minute-key guard must stop the second tick");
    }

    #[tokio::test]
    async fn catch_up_fires_once_for_missed_match() {
        let store = store_with_automation(TriggerKind::Schedule, Some("0 9 * * *"));
        store
            .conn
            .lock()
            .execute(
                "UPDATE automations SET catch_up_enabled = 1,
                     last_run_at = datetime('now', '-1 day', '-1 hour')
                 WHERE id = 'a1'",
                [],
            )
            .unwrap();
        let engine = engine_with_provider(
            store.clone(),
            ScriptedProvider::ok(&["caught up"]),
            Arc::new(RecordingSink::default()),
        );
        engine.run_catch_up().await.unwrap();
        let runs = store.list_runs("a1", 10).unwrap();
        // Exactly one dispatch — unless the suite happens to run in the
        // 09:00 minute itself, there is no cron match to collide with.
        assert_eq!(runs.len(), 1);
        // A second catch-up pass is a no-op: last_run_at is now newer.
        engine.rate_limiter.clear();
        engine.run_catch_up().await.unwrap();
        assert_eq!(store.list_runs("a1", 10).unwrap().len(), 1);
    }
}
