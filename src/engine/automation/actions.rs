// Lorekeep Runtime — Automation Actions
//
// Dispatch on the automation's action kind once the LLM response is in
// hand. Notifications go to the UI sink and never fail; external actions
// require their port to be connected and report the fixed error codes.

use crate::atoms::traits::{MailPort, TaskListPort, UiSink};
use crate::engine::types::{ActionKind, Automation, RunErrorCode, UiEvent};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct ActionPorts {
    pub ui: Arc<dyn UiSink>,
    pub mail: Option<Arc<dyn MailPort>>,
    pub tasks: Option<Arc<dyn TaskListPort>>,
}

#[derive(Debug)]
pub struct ActionOutcome {
    pub result: Value,
    pub external_id: Option<String>,
}

/// Execute the automation's action with the LLM response text.
pub async fn run_action(
    ports: &ActionPorts,
    automation: &Automation,
    response: &str,
) -> Result<ActionOutcome, (RunErrorCode, String)> {
    match automation.action_kind {
        ActionKind::Notification => {
            ports.ui.emit(UiEvent::Notification {
                title: automation.name.clone(),
                body: response.to_string(),
            });
            Ok(ActionOutcome { result: json!({ "delivered": true }), external_id: None })
        }

        ActionKind::CreateGtask => {
            let Some(tasks) = &ports.tasks else {
                return Err((
                    RunErrorCode::GtasksNotConnected,
                    "task list client not connected".into(),
                ));
            };
            // First line is the title, the remainder the notes.
            let mut lines = response.splitn(2, '\n');
            let title = lines.next().unwrap_or("").trim();
            let notes = lines.next().unwrap_or("").trim();
            let title = if title.is_empty() { &automation.name } else { title };
            match tasks.create_task(title, notes).await {
                Ok(task_id) => Ok(ActionOutcome {
                    result: json!({ "title": title }),
                    external_id: Some(task_id),
                }),
                Err(e) => Err((RunErrorCode::ActionExecutionError, e)),
            }
        }

        ActionKind::DraftGmail => {
            let Some(mail) = &ports.mail else {
                return Err((
                    RunErrorCode::MissingOauthScope,
                    "mail client not connected".into(),
                ));
            };
            if !mail.has_compose_scope() {
                return Err((
                    RunErrorCode::MissingOauthScope,
                    "connected account lacks compose scope".into(),
                ));
            }
            let Some(to) = automation.action_config["to"].as_str().filter(|s| !s.is_empty())
            else {
                return Err((
                    RunErrorCode::InvalidActionConfig,
                    "draft_gmail requires a 'to' recipient in action_config".into(),
                ));
            };
            let subject = automation.action_config["subject"]
                .as_str()
                .unwrap_or(&automation.name);
            match mail.create_draft(to, subject, response).await {
                Ok(draft_id) => Ok(ActionOutcome {
                    result: json!({ "to": to, "subject": subject }),
                    external_id: Some(draft_id),
                }),
                Err(e) => Err((RunErrorCode::ActionExecutionError, e)),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// UI sink that records everything it is told.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<UiEvent>>,
    }

    impl UiSink for RecordingSink {
        fn emit(&self, event: UiEvent) {
            self.events.lock().push(event);
        }
    }

    pub struct FakeMail {
        pub compose_scope: bool,
        pub drafts: Mutex<Vec<(String, String, String)>>,
    }

    impl FakeMail {
        pub fn new(compose_scope: bool) -> Self {
            FakeMail { compose_scope, drafts: Mutex::new(vec![]) }
        }
    }

    #[async_trait]
    impl MailPort for FakeMail {
        fn has_compose_scope(&self) -> bool {
            self.compose_scope
        }

        async fn search(&self, _query: &str, _max: usize) -> Result<Value, String> {
            Ok(json!({ "messages": [] }))
        }

        async fn read(&self, _id: &str) -> Result<Value, String> {
            Err("not found".into())
        }

        async fn create_draft(&self, to: &str, subject: &str, body: &str) -> Result<String, String> {
            self.drafts.lock().push((to.into(), subject.into(), body.into()));
            Ok(format!("draft-{}", self.drafts.lock().len()))
        }
    }

    pub struct FakeTasks {
        pub created: Mutex<Vec<(String, String)>>,
    }

    impl FakeTasks {
        pub fn new() -> Self {
            FakeTasks { created: Mutex::new(vec![]) }
        }
    }

    #[async_trait]
    impl TaskListPort for FakeTasks {
        async fn create_task(&self, title: &str, notes: &str) -> Result<String, String> {
            self.created.lock().push((title.into(), notes.into()));
            Ok(format!("task-{}", self.created.lock().len()))
        }

        async fn count_overdue(&self) -> Result<i64, String> {
            Ok(0)
        }
    }
}
