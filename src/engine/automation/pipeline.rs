// Lorekeep Runtime — Automation Execution Pipeline
//
// One run, end to end: guards → dedupe insert → prompt render → semaphore →
// LLM → action → finalize. Every terminal path writes a run row with one of
// the fixed error codes; duplicate inserts bump the parent's counter and
// exit silently.

use super::actions::{run_action, ActionPorts};
use super::template::{render_prompt, TemplateContext};
use super::AutomationEngine;
use crate::atoms::constants::{
    AUTOMATION_LLM_TIMEOUT_SECS, BACKOFF_COOLDOWN_SECS, FAILURE_STREAK_DISABLE_AT,
    RATE_LIMIT_COOLDOWN_SECS,
};
use crate::atoms::error::EngineResult;
use crate::engine::mission::hashing::sha256_hex;
use crate::engine::types::*;
use chrono::{Duration, Utc};
use log::{info, warn};
use serde_json::Value;
use std::time::Duration as StdDuration;

/// Stable, collision-resistant dedupe key. A pure function of its inputs:
/// the same trigger always derives the same key, so racing dispatchers
/// collide on the run table's unique constraint instead of double-firing.
pub fn generate_dedupe_key(
    automation_id: &str,
    trigger_kind: TriggerKind,
    minute_key: &str,
    trigger_event: Option<BusEventKind>,
    trigger_data: Option<&Value>,
    request_id: Option<&str>,
) -> String {
    match trigger_kind {
        TriggerKind::Schedule => format!("{automation_id}|schedule|{minute_key}"),
        TriggerKind::Event => {
            let event = trigger_event.map(|e| e.as_str()).unwrap_or("unknown");
            let data_hash = trigger_data
                .map(|d| {
                    let canonical = crate::engine::mission::hashing::canonical_json(d);
                    sha256_hex(canonical.as_bytes())[..16].to_string()
                })
                .unwrap_or_else(|| "none".into());
            format!("{automation_id}|event|{event}|{data_hash}")
        }
        TriggerKind::Manual => {
            let suffix = request_id.unwrap_or(minute_key);
            format!("{automation_id}|manual|{suffix}")
        }
    }
}

impl AutomationEngine {
    /// Run the full pipeline for one trigger firing.
    /// Returns the run id, or None when the dedupe key lost the race.
    pub async fn execute_automation(
        &self,
        automation: &Automation,
        trigger_kind: TriggerKind,
        trigger_event: Option<BusEventKind>,
        trigger_data: Option<Value>,
        minute_key: &str,
        request_id: Option<&str>,
    ) -> EngineResult<Option<String>> {
        let dedupe_key = generate_dedupe_key(
            &automation.id,
            trigger_kind,
            minute_key,
            trigger_event,
            trigger_data.as_ref(),
            request_id,
        );
        let now = Utc::now();
        let stored_data = if automation.store_payloads { trigger_data.as_ref() } else { None };

        // ── 1. Guards, in order ────────────────────────────────────────
        let guard_code = if !automation.enabled {
            Some(RunErrorCode::AutomationDisabled)
        } else if automation
            .cooldown_until
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc) > now)
            .unwrap_or(false)
        {
            Some(RunErrorCode::CooldownActive)
        } else if !self
            .rate_limiter
            .check(&automation.id, &automation.domain_id, now)
            .is_granted()
        {
            Some(RunErrorCode::RateLimited)
        } else {
            None
        };

        if let Some(code) = guard_code {
            let run_id = uuid::Uuid::new_v4().to_string();
            match self.store.try_insert_run(
                &run_id,
                &automation.id,
                &automation.domain_id,
                trigger_kind,
                trigger_event,
                stored_data,
                &dedupe_key,
            ) {
                Ok(()) => {}
                Err(e) if e.is_duplicate() => {
                    self.store.record_duplicate_skip(&automation.id)?;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
            self.store.finalize_run(
                &run_id,
                RunStatus::Skipped,
                Some(code),
                Some(code.as_str()),
                None,
                None,
                None,
            )?;
            if code == RunErrorCode::RateLimited {
                let until = (now + Duration::seconds(RATE_LIMIT_COOLDOWN_SECS)).to_rfc3339();
                self.store.set_automation_cooldown(&automation.id, Some(&until))?;
            }
            info!(
                "[automation] '{}' skipped: {} (run {})",
                automation.name,
                code.as_str(),
                run_id
            );
            return Ok(Some(run_id));
        }

        // ── 2. Dedupe key + run insert ─────────────────────────────────
        let run_id = uuid::Uuid::new_v4().to_string();
        match self.store.try_insert_run(
            &run_id,
            &automation.id,
            &automation.domain_id,
            trigger_kind,
            trigger_event,
            stored_data,
            &dedupe_key,
        ) {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => {
                self.store.record_duplicate_skip(&automation.id)?;
                info!("[automation] '{}' duplicate for key {} — skipping", automation.name, dedupe_key);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        // ── 3. Prompt render ───────────────────────────────────────────
        let domain = self.store.get_domain(&automation.domain_id)?;
        let domain_name = domain.as_ref().map(|d| d.name.as_str()).unwrap_or("");
        let prompt = match render_prompt(
            &automation.prompt_template,
            &TemplateContext {
                domain_name,
                event_type: trigger_event,
                event_data: trigger_data.as_ref(),
                now,
            },
        ) {
            Ok(p) => p,
            Err(e) => {
                self.fail_run(automation, &run_id, RunErrorCode::TemplateRenderError, &e.to_string())
                    .await?;
                return Ok(Some(run_id));
            }
        };
        self.store.set_run_prompt_hash(&run_id, &sha256_hex(prompt.as_bytes()))?;

        // ── 4–5. Concurrency gate + LLM call ───────────────────────────
        let response = {
            let Some(domain) = &domain else {
                self.fail_run(automation, &run_id, RunErrorCode::ProviderNotConfigured, "domain missing")
                    .await?;
                return Ok(Some(run_id));
            };
            let Some((provider, model)) = (self.resolver)(domain) else {
                self.fail_run(
                    automation,
                    &run_id,
                    RunErrorCode::ProviderNotConfigured,
                    "no provider configured for domain",
                )
                .await?;
                return Ok(Some(run_id));
            };

            // The permit is held only for the LLM call and released on every
            // exit path when `_permit` unwinds.
            let _permit = self
                .llm_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| "llm semaphore closed")?;
            self.store.mark_run_running(&run_id)?;

            let llm = tokio::time::timeout(
                StdDuration::from_secs(AUTOMATION_LLM_TIMEOUT_SECS),
                provider.chat_complete(&[ChatMessage::user(prompt.clone())], None, &model),
            )
            .await;

            match llm {
                Err(_) => {
                    self.fail_run(automation, &run_id, RunErrorCode::Timeout, "LLM call timed out")
                        .await?;
                    return Ok(Some(run_id));
                }
                Ok(Err(e)) => {
                    self.fail_run(automation, &run_id, RunErrorCode::LlmError, &e.to_string())
                        .await?;
                    return Ok(Some(run_id));
                }
                Ok(Ok(text)) => text,
            }
        };

        let response_hash = sha256_hex(response.as_bytes());

        // ── 6. Action ──────────────────────────────────────────────────
        let ports = ActionPorts {
            ui: self.ui.clone(),
            mail: self.mail.clone(),
            tasks: self.tasks.clone(),
        };
        match run_action(&ports, automation, &response).await {
            Ok(outcome) => {
                // ── 7. Finalize success ────────────────────────────────
                self.store.finalize_run(
                    &run_id,
                    RunStatus::Success,
                    None,
                    None,
                    Some(&response_hash),
                    Some(&outcome.result),
                    outcome.external_id.as_deref(),
                )?;
                self.store.reset_failure_streak(&automation.id)?;
                self.store.record_automation_run(&automation.id, &now.to_rfc3339())?;
                self.backoff_attempts.lock().remove(&automation.id);
                info!("[automation] '{}' succeeded (run {})", automation.name, run_id);
            }
            Err((code, message)) => {
                self.store.finalize_run(
                    &run_id,
                    RunStatus::Failed,
                    Some(code),
                    Some(&message),
                    Some(&response_hash),
                    None,
                    None,
                )?;
                self.store.record_automation_run(&automation.id, &now.to_rfc3339())?;
                self.apply_failure_policy(automation, code, &message).await?;
            }
        }

        Ok(Some(run_id))
    }

    /// Finalize a run as failed and apply the streak/backoff policy.
    async fn fail_run(
        &self,
        automation: &Automation,
        run_id: &str,
        code: RunErrorCode,
        message: &str,
    ) -> EngineResult<()> {
        self.store.finalize_run(
            run_id,
            RunStatus::Failed,
            Some(code),
            Some(message),
            None,
            None,
            None,
        )?;
        self.store
            .record_automation_run(&automation.id, &Utc::now().to_rfc3339())?;
        self.apply_failure_policy(automation, code, message).await
    }

    /// Streak policy: non-exempt codes increment the streak and disable at
    /// the threshold; llm_error/timeout additionally escalate the backoff
    /// cooldown ladder.
    async fn apply_failure_policy(
        &self,
        automation: &Automation,
        code: RunErrorCode,
        message: &str,
    ) -> EngineResult<()> {
        warn!(
            "[automation] '{}' failed: {} — {}",
            automation.name,
            code.as_str(),
            message
        );

        if !code.is_streak_exempt() {
            let streak = self.store.increment_failure_streak(&automation.id)?;
            if streak >= FAILURE_STREAK_DISABLE_AT as i64 {
                self.store.set_automation_enabled(&automation.id, false)?;
                self.ui.emit(UiEvent::Notification {
                    title: automation.name.clone(),
                    body: format!(
                        "Automation '{}' disabled due to {} consecutive failures. Last error: {}",
                        automation.name, streak, message
                    ),
                });
                warn!(
                    "[automation] '{}' disabled after {} consecutive failures",
                    automation.name, streak
                );
            }
        }

        if code.is_backoff_code() {
            let attempt = {
                let mut attempts = self.backoff_attempts.lock();
                let entry = attempts.entry(automation.id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            let idx = (attempt - 1).min(BACKOFF_COOLDOWN_SECS.len() - 1);
            let until = (Utc::now() + Duration::seconds(BACKOFF_COOLDOWN_SECS[idx])).to_rfc3339();
            self.store.set_automation_cooldown(&automation.id, Some(&until))?;
            info!(
                "[automation] '{}' backoff cooldown {}s (attempt {})",
                automation.name, BACKOFF_COOLDOWN_SECS[idx], attempt
            );
        }

        Ok(())
    }
}
