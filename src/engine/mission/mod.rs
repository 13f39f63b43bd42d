// Lorekeep Runtime — Mission Runner
//
// Ten steps: validate → permissions → context → prompt → LLM → parse →
// persist → gate → actions → finalize. Side effects never run without an
// approved gate; cancellation is cooperative and checked at every await
// point, including per streamed chunk. Hashes (definition, prompt) are
// SHA-256 over canonical JSON for reproducibility.
//
// Module layout:
//   hashing — canonical JSON + SHA-256
//   parsers — fenced-block output parsers + registry

pub mod hashing;
pub mod parsers;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{MailPort, StreamEvent, TaskListPort, UiSink};
use crate::engine::automation::ProviderResolver;
use crate::engine::events::EventBus;
use crate::engine::runtime::CancelToken;
use crate::engine::store::Store;
use crate::engine::types::*;
use hashing::{hash_value, sha256_hex};
use log::{info, warn};
use parking_lot::Mutex;
use parsers::{ParsedBlock, ParserRegistry};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-domain digest text is head-bounded to this many chars.
const DIGEST_HEAD_CHARS: usize = 4_000;

pub struct MissionRunner {
    store: Arc<Store>,
    ui: Arc<dyn UiSink>,
    bus: EventBus,
    parsers: Arc<ParserRegistry>,
    resolver: ProviderResolver,
    mail: Option<Arc<dyn MailPort>>,
    tasks: Option<Arc<dyn TaskListPort>>,
    create_deadlines: bool,
    /// Cancel tokens by caller request id. Last-writer-wins: registering a
    /// new token for a request id cancels the previous one.
    cancel_tokens: Mutex<HashMap<String, CancelToken>>,
}

impl MissionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        ui: Arc<dyn UiSink>,
        bus: EventBus,
        parsers: Arc<ParserRegistry>,
        resolver: ProviderResolver,
        mail: Option<Arc<dyn MailPort>>,
        tasks: Option<Arc<dyn TaskListPort>>,
        create_deadlines: bool,
    ) -> Arc<Self> {
        Arc::new(MissionRunner {
            store,
            ui,
            bus,
            parsers,
            resolver,
            mail,
            tasks,
            create_deadlines,
            cancel_tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Cancel the run registered under a caller request id.
    pub fn cancel_request(&self, request_id: &str) {
        if let Some(token) = self.cancel_tokens.lock().get(request_id) {
            token.cancel();
            info!("[mission] Cancel requested for request {}", request_id);
        }
    }

    fn progress(&self, run_id: &str, event: &str, detail: &str) {
        self.ui.emit(UiEvent::MissionProgress {
            run_id: run_id.to_string(),
            event: event.to_string(),
            detail: detail.to_string(),
        });
    }

    // ── Steps 1–10 ─────────────────────────────────────────────────────

    /// Start a mission run against a domain. Returns the run id.
    pub async fn start(
        self: &Arc<Self>,
        mission_id: &str,
        domain_id: &str,
        request_id: Option<&str>,
        inputs: Value,
    ) -> EngineResult<String> {
        // ── Step 1: validate ───────────────────────────────────────────
        let mission = self
            .store
            .get_mission(mission_id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown mission {mission_id}")))?;
        if !mission.enabled {
            return Err(EngineError::Validation(format!("mission '{}' is disabled", mission.name)));
        }
        let merged_inputs = merge_with_defaults(&mission.param_schema, &inputs);

        // ── Step 2: permissions ────────────────────────────────────────
        if !mission.domain_ids.iter().any(|d| d == domain_id) {
            return Err(EngineError::Validation(format!(
                "mission '{}' is not enabled for domain {domain_id}",
                mission.name
            )));
        }
        let domain = self
            .store
            .get_domain(domain_id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown domain {domain_id}")))?;

        let Some((provider, model)) = (self.resolver)(&domain) else {
            return Err(EngineError::Config("no provider configured for domain".into()));
        };

        // Create the run with its definition hash, then go running.
        let run_id = uuid::Uuid::new_v4().to_string();
        self.store.create_mission_run(
            &run_id,
            mission_id,
            domain_id,
            request_id,
            &merged_inputs,
            &hash_value(&mission.definition),
            Some(&model),
            Some(provider.name()),
        )?;

        // Last-writer-wins cancellation scope per request id.
        let cancel = CancelToken::new();
        if let Some(req) = request_id {
            let mut tokens = self.cancel_tokens.lock();
            if let Some(previous) = tokens.insert(req.to_string(), cancel.clone()) {
                previous.cancel();
            }
        }

        self.store.update_mission_run_status(&run_id, MissionRunStatus::Running, None)?;
        self.progress(&run_id, "started", &mission.name);

        let result = self
            .run_steps(&mission, &domain, &run_id, &merged_inputs, provider, &model, &cancel)
            .await;

        if let Some(req) = request_id {
            self.cancel_tokens.lock().remove(req);
        }

        match result {
            Ok(()) => Ok(run_id),
            Err(EngineError::Cancelled) => {
                self.store
                    .update_mission_run_status(&run_id, MissionRunStatus::Cancelled, None)?;
                self.progress(&run_id, "cancelled", "");
                Ok(run_id)
            }
            Err(e) => {
                // Any uncaught error transitions to failed.
                self.store.update_mission_run_status(
                    &run_id,
                    MissionRunStatus::Failed,
                    Some(&e.to_string()),
                )?;
                warn!("[mission] Run {} failed: {}", run_id, e);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        self: &Arc<Self>,
        mission: &Mission,
        domain: &Domain,
        run_id: &str,
        inputs: &Value,
        provider: crate::engine::providers::AnyProvider,
        model: &str,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        // ── Step 3: context assembly ───────────────────────────────────
        cancel.bail_if_cancelled()?;
        let digests = self.load_digests(&domain.id)?;
        let overdue = match &self.tasks {
            Some(tasks) => tasks.count_overdue().await.unwrap_or(0),
            None => 0,
        };
        let health = format!(
            "Domain: {}\nKB files: {}\nOverdue external tasks: {}",
            domain.name,
            self.store.list_kb_files(&domain.id)?.len(),
            overdue
        );
        let snapshot = ContextSnapshot {
            digest_hashes: digests.iter().map(|d| sha256_hex(d.as_bytes())).collect(),
            health_hash: Some(sha256_hex(health.as_bytes())),
            digest_chars: digests.iter().map(|d| d.len() as i64).sum(),
            health_chars: health.len() as i64,
            overdue_external_tasks: overdue,
        };

        // ── Step 4: prompt ─────────────────────────────────────────────
        cancel.bail_if_cancelled()?;
        let prompt = build_prompt(mission, &health, &digests, inputs);
        let prompt_hash = sha256_hex(prompt.as_bytes());
        self.store.set_mission_run_context(run_id, &prompt_hash, &snapshot)?;

        // ── Step 5: LLM (streaming, cancel checked per chunk) ──────────
        cancel.bail_if_cancelled()?;
        let mut stream = provider
            .chat(&[ChatMessage::user(prompt)], None, model)
            .await
            .map_err(|e| EngineError::provider(provider.name(), e.to_string()))?;
        let mut response = String::new();
        loop {
            cancel.bail_if_cancelled()?;
            match stream.next().await {
                Some(Ok(StreamEvent::Text(chunk))) => {
                    response.push_str(&chunk);
                    self.progress(run_id, "llm_chunk", &chunk);
                }
                Some(Ok(StreamEvent::Done { .. })) | None => break,
                Some(Err(e)) => {
                    return Err(EngineError::provider(provider.name(), e.to_string()));
                }
            }
        }

        // ── Step 6: parse (raw always attached first) ──────────────────
        cancel.bail_if_cancelled()?;
        let blocks = self.parsers.parse_output(&response);

        // ── Step 7: persist outputs ────────────────────────────────────
        self.store
            .append_mission_output(run_id, "raw", &json!({ "text": response }))?;
        for block in &blocks {
            self.store
                .append_mission_output(run_id, block.kind(), &block.to_content())?;
        }
        info!("[mission] Run {} persisted {} output(s)", run_id, blocks.len() + 1);

        // ── Step 8: gate evaluation ────────────────────────────────────
        cancel.bail_if_cancelled()?;
        let deadline_blocks: Vec<&ParsedBlock> = blocks
            .iter()
            .filter(|b| matches!(b, ParsedBlock::Deadline { .. }))
            .collect();
        let draft_recipient = mission.definition["draft_email"]["to"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let mut queued: Vec<String> = Vec::new();
        if self.create_deadlines && !deadline_blocks.is_empty() {
            for (ordinal, block) in deadline_blocks.iter().enumerate() {
                let ParsedBlock::Deadline { title, due } = block else { unreachable!() };
                self.store.create_mission_action(
                    run_id,
                    "create_deadline",
                    &json!({ "title": title, "due": due, "ordinal": ordinal }),
                )?;
                queued.push(format!("deadline '{title}' ({due})"));
            }
        }
        if let Some(to) = &draft_recipient {
            let subject = mission.definition["draft_email"]["subject"]
                .as_str()
                .unwrap_or(&mission.name)
                .to_string();
            self.store.create_mission_action(
                run_id,
                "draft_email",
                &json!({ "to": to, "subject": subject, "body": response }),
            )?;
            queued.push(format!("email draft to {to}"));
        }

        if queued.is_empty() {
            // ── Step 10: finalize (no gate, actions skipped) ───────────
            self.finalize(run_id)?;
            return Ok(());
        }

        let message = format!(
            "Mission '{}' queued {} side effect(s): {}. Approve to execute.",
            mission.name,
            queued.len(),
            queued.join("; ")
        );
        self.store.create_mission_gate(run_id, "approve-side-effects", &message)?;
        self.store.update_mission_run_status(run_id, MissionRunStatus::Gated, None)?;
        self.progress(run_id, "gated", &message);
        Ok(())
    }

    // ── Step 9: resume after gate decision ─────────────────────────────

    /// Apply the operator's decision. Approved executes every pending
    /// action in insertion order; rejected skips them all. Either way the
    /// run finalizes success — individual action failures are recorded,
    /// not fatal.
    pub async fn decide_gate(&self, run_id: &str, approved: bool) -> EngineResult<()> {
        let run = self
            .store
            .get_mission_run(run_id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown run {run_id}")))?;
        if run.status != MissionRunStatus::Gated {
            return Err(EngineError::Validation(format!(
                "run {run_id} is not gated (status {})",
                run.status.as_str()
            )));
        }
        let gate = self
            .store
            .get_pending_gate(run_id)?
            .ok_or_else(|| EngineError::Integrity(format!("gated run {run_id} has no pending gate")))?;

        self.store.decide_mission_gate(
            &gate.id,
            if approved { GateStatus::Approved } else { GateStatus::Rejected },
        )?;
        self.store.update_mission_run_status(run_id, MissionRunStatus::Running, None)?;

        let actions = self.store.list_pending_actions(run_id)?;
        if !approved {
            for action in &actions {
                self.store.resolve_mission_action(
                    &action.id,
                    MissionActionStatus::Skipped,
                    None,
                    None,
                )?;
            }
            info!("[mission] Run {} gate rejected — {} action(s) skipped", run_id, actions.len());
        } else {
            for action in &actions {
                match self.execute_action(action).await {
                    Ok(result) => {
                        self.store.resolve_mission_action(
                            &action.id,
                            MissionActionStatus::Success,
                            Some(&result),
                            None,
                        )?;
                    }
                    Err(e) => {
                        warn!("[mission] Action {} failed: {}", action.action_type, e);
                        self.store.resolve_mission_action(
                            &action.id,
                            MissionActionStatus::Failed,
                            None,
                            Some(&e),
                        )?;
                    }
                }
            }
        }

        self.finalize(run_id)?;
        Ok(())
    }

    async fn execute_action(&self, action: &MissionRunAction) -> Result<Value, String> {
        match action.action_type.as_str() {
            "create_deadline" => {
                let tasks = self.tasks.as_ref().ok_or("task list not connected")?;
                let title = action.payload["title"].as_str().unwrap_or("(untitled)");
                let due = action.payload["due"].as_str().unwrap_or("");
                let task_id = tasks.create_task(title, &format!("Due: {due}")).await?;
                Ok(json!({ "task_id": task_id }))
            }
            "draft_email" => {
                let mail = self.mail.as_ref().ok_or("mail not connected")?;
                let to = action.payload["to"].as_str().ok_or("missing recipient")?;
                let subject = action.payload["subject"].as_str().unwrap_or("");
                let body = action.payload["body"].as_str().unwrap_or("");
                let draft_id = mail.create_draft(to, subject, body).await?;
                Ok(json!({ "draft_id": draft_id }))
            }
            other => Err(format!("unknown action type '{other}'")),
        }
    }

    fn finalize(&self, run_id: &str) -> EngineResult<()> {
        self.store
            .update_mission_run_status(run_id, MissionRunStatus::Success, None)?;
        self.progress(run_id, "run_complete", "");
        self.ui.emit(UiEvent::MissionComplete {
            run_id: run_id.to_string(),
            status: MissionRunStatus::Success.as_str().to_string(),
        });
        if let Ok(Some(run)) = self.store.get_mission_run(run_id) {
            self.bus.emit(BusEvent {
                kind: BusEventKind::MissionCompleted,
                domain_id: Some(run.domain_id),
                data: json!({ "run_id": run_id, "mission_id": run.mission_id }),
            });
        }
        Ok(())
    }

    /// Head-bounded digest documents for the domain.
    fn load_digests(&self, domain_id: &str) -> EngineResult<Vec<String>> {
        let mut digests = Vec::new();
        for file in self.store.list_kb_files(domain_id)? {
            if !file.relative_path.ends_with("DIGEST.md") {
                continue;
            }
            let mut text = String::new();
            for chunk in self.store.list_chunks_for_file(&file.id)? {
                if text.len() + chunk.content.len() > DIGEST_HEAD_CHARS {
                    let room = DIGEST_HEAD_CHARS.saturating_sub(text.len());
                    text.push_str(crate::engine::types::truncate_utf8(&chunk.content, room));
                    break;
                }
                text.push_str(&chunk.content);
                text.push('\n');
            }
            if !text.is_empty() {
                digests.push(text);
            }
        }
        Ok(digests)
    }
}

/// Overlay caller inputs onto the parameter defaults.
fn merge_with_defaults(param_schema: &Value, inputs: &Value) -> Value {
    let mut merged = param_schema.as_object().cloned().unwrap_or_default();
    if let Some(overrides) = inputs.as_object() {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

fn build_prompt(mission: &Mission, health: &str, digests: &[String], inputs: &Value) -> String {
    let mut prompt = format!(
        "Mission: {}\nDate: {}\n\n## Portfolio health\n{}\n",
        mission.name,
        chrono::Utc::now().format("%Y-%m-%d"),
        health
    );
    for (i, digest) in digests.iter().enumerate() {
        prompt.push_str(&format!("\n## Digest {}\n{}\n", i + 1, digest));
    }
    prompt.push_str(&format!("\n## Parameters\n{}\n", hashing::canonical_json(inputs)));
    if let Some(instructions) = mission.definition["instructions"].as_str() {
        prompt.push_str(&format!("\n## Instructions\n{instructions}\n"));
    }
    prompt
}
