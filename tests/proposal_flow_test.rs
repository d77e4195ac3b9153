//! 提案生命周期与后台编排集成测试

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Days, Local, NaiveDate};
    use dayloom::config::AppConfig;
    use dayloom::core::AgentError;
    use dayloom::llm::{ScriptedLlmClient, ScriptedReply, Submission};
    use dayloom::memory::DayBook;
    use dayloom::proposal::{ApprovalStatus, ProposalError, ProposalHost, ProposalStatus};
    use dayloom::react::prompts::REJECTION_FOLLOWUP;
    use dayloom::tools::{TaskDraft, ToolStatus};
    use dayloom::Assistant;
    use serde_json::{json, Value};

    fn tomorrow() -> NaiveDate {
        Local::now().date_naive().succ_opt().unwrap()
    }

    async fn setup() -> (Assistant<DayBook>, ScriptedLlmClient) {
        let cfg = AppConfig::default();
        let client = ScriptedLlmClient::default();
        let book = Arc::new(DayBook::new(
            Duration::from_secs(cfg.proposal.min_interval_secs),
            Local::now().date_naive(),
        ));
        let assistant = Assistant::new(&cfg, Arc::new(client.clone()), book);
        assistant.navigate(tomorrow()).await.unwrap();
        (assistant, client)
    }

    fn plan(titles: &[&str]) -> Value {
        let tasks: Vec<Value> = titles.iter().map(|t| json!({ "title": t })).collect();
        json!({
            "timeline": titles.join(", "),
            "rationale": "Keeps the afternoon free",
            "tasks": tasks
        })
    }

    fn draft(title: &str) -> TaskDraft {
        TaskDraft {
            title: title.to_string(),
            date: None,
            start_time: None,
            duration_minutes: None,
            notes: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_replaces_day_with_fresh_tasks() {
        let (assistant, client) = setup().await;
        let old = assistant.host().add_task(&draft("Old errand")).await.unwrap();

        client.push_replies(vec![
            ScriptedReply::empty().tool_call("propose_schedule", plan(&["Gym", "Write report"])),
            ScriptedReply::text("Proposal ready, take a look."),
        ]);
        let out = assistant.run_orchestration(tomorrow()).await.unwrap();
        assert!(out.proposal_executed);
        assert!(!out.rescue_attempted);

        let record = assistant.accept_schedule_proposal(tomorrow()).await.unwrap();
        assert!(record.active);
        assert_eq!(record.proposal.status, ProposalStatus::Accepted);

        let tasks = assistant.host().tasks_on(tomorrow()).await;
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.id != old.id));
        assert!(assistant.pending_schedule_proposal(tomorrow()).await.is_none());
        assert_eq!(
            assistant.host().approval_status(tomorrow()).await,
            ApprovalStatus::Active
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_after_accept_marks_stale() {
        let (assistant, client) = setup().await;
        client.push_replies(vec![
            ScriptedReply::empty().tool_call("propose_schedule", plan(&["Gym"])),
            ScriptedReply::text("Proposal ready, take a look."),
        ]);
        assistant.run_orchestration(tomorrow()).await.unwrap();
        assistant.accept_schedule_proposal(tomorrow()).await.unwrap();

        client.push_replies(vec![
            ScriptedReply::empty().tool_call("add_tasks", json!({"tasks": [{"title": "Dentist"}]})),
            ScriptedReply::text("Added the dentist appointment."),
        ]);
        assistant.send_message("add dentist", None).await.unwrap();

        assert_eq!(
            assistant.host().approval_status(tomorrow()).await,
            ApprovalStatus::Stale
        );
        let record = assistant.host().approval(tomorrow()).await.unwrap();
        assert!(!record.active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_proposal_within_interval_is_rejected() {
        let (assistant, client) = setup().await;
        client.push_replies(vec![
            ScriptedReply::empty()
                .tool_call("propose_schedule", plan(&["Gym"]))
                .tool_call("propose_schedule", plan(&["Swim"])),
            ScriptedReply::text("Proposal ready, take a look."),
        ]);
        let out = assistant.run_orchestration(tomorrow()).await.unwrap();
        assert_eq!(out.tool_results[0].status, ToolStatus::Ok);
        assert_eq!(out.tool_results[1].status, ToolStatus::Rejected);
        let pending = assistant.pending_schedule_proposal(tomorrow()).await.unwrap();
        assert_eq!(pending.tasks[0].title, "Gym");
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_proposal_dismisses_previous() {
        let (assistant, client) = setup().await;
        client.push_replies(vec![
            ScriptedReply::empty().tool_call("propose_schedule", plan(&["Gym"])),
            ScriptedReply::text("Proposal ready, take a look."),
        ]);
        assistant.run_orchestration(tomorrow()).await.unwrap();
        let first = assistant.pending_schedule_proposal(tomorrow()).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        client.push_replies(vec![
            ScriptedReply::empty().tool_call("propose_schedule", plan(&["Swim"])),
            ScriptedReply::text("Here is a fresh proposal."),
        ]);
        assistant.run_orchestration(tomorrow()).await.unwrap();

        let second = assistant.pending_schedule_proposal(tomorrow()).await.unwrap();
        assert_ne!(first.id, second.id);
        let history = assistant.host().schedule_history().await;
        let old = history.iter().find(|p| p.id == first.id).unwrap();
        assert_eq!(old.status, ProposalStatus::Dismissed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_runs_followup_turn() {
        let (assistant, client) = setup().await;
        client.push_replies(vec![
            ScriptedReply::empty().tool_call("propose_schedule", plan(&["Gym"])),
            ScriptedReply::text("Proposal ready, take a look."),
            ScriptedReply::text("What would you like to change?"),
        ]);
        assistant.run_orchestration(tomorrow()).await.unwrap();
        let out = assistant.reject_schedule_proposal(tomorrow()).await.unwrap();
        assert_eq!(out.text, "What would you like to change?");
        assert!(assistant.pending_schedule_proposal(tomorrow()).await.is_none());

        let subs = client.submissions();
        match subs.last() {
            Some(Submission::User { text, .. }) => assert!(text.starts_with(REJECTION_FOLLOWUP)),
            other => panic!("unexpected submission: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_without_proposal_fails() {
        let (assistant, _client) = setup().await;
        let err = assistant.accept_schedule_proposal(tomorrow()).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Proposal(ProposalError::NoPendingProposal { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_person_becomes_contact_proposal() {
        let (assistant, client) = setup().await;
        client.push_replies(vec![
            ScriptedReply::empty().tool_call(
                "upsert_person",
                json!({"name": "Ana", "relation": "friend", "contact_every_days": 14}),
            ),
            ScriptedReply::text("I'll suggest adding Ana to your ledger."),
        ]);
        assistant.send_message("I met Ana today", None).await.unwrap();

        let pending = assistant.pending_contacts(tomorrow()).await;
        assert_eq!(pending.len(), 1);
        assert!(assistant.host().people().await.is_empty());

        let accepted = assistant.accept_all_contacts(tomorrow()).await.unwrap();
        assert_eq!(accepted.len(), 1);
        let people = assistant.host().people().await;
        assert_eq!(people[0].name, "Ana");
        assert!(assistant.pending_contacts(tomorrow()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_mutation_triggers_background_orchestration() {
        let (assistant, client) = setup().await;
        let mut triggers = assistant.background_triggers().await.unwrap();
        client.push_replies(vec![
            ScriptedReply::empty().tool_call("add_tasks", json!({"tasks": [{"title": "Gym"}]})),
            ScriptedReply::text("Added gym to tomorrow."),
        ]);
        assistant.send_message("add gym", None).await.unwrap();
        assert!(assistant.pending_background_job().await.is_some());

        let fired = tokio::time::timeout(Duration::from_secs(60), triggers.recv())
            .await
            .unwrap();
        assert_eq!(fired, Some(tomorrow()));
        assert!(assistant.pending_background_job().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_cancels_background_orchestration() {
        let (assistant, client) = setup().await;
        let mut triggers = assistant.background_triggers().await.unwrap();
        client.push_replies(vec![
            ScriptedReply::empty().tool_call("add_tasks", json!({"tasks": [{"title": "Gym"}]})),
            ScriptedReply::text("Added gym to tomorrow."),
        ]);
        assistant.send_message("add gym", None).await.unwrap();

        assistant.navigate(Local::now().date_naive()).await.unwrap();
        assert!(assistant.pending_background_job().await.is_none());
        let fired = tokio::time::timeout(Duration::from_secs(60), triggers.recv()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_turn_schedules_nothing() {
        let (assistant, client) = setup().await;
        client.push_replies(vec![
            ScriptedReply::empty().tool_call("get_tasks", json!({ "date": tomorrow().to_string() })),
            ScriptedReply::text("Nothing planned yet."),
        ]);
        assistant.send_message("what's tomorrow?", None).await.unwrap();
        assert!(assistant.pending_background_job().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_during_mutating_turn_schedules_nothing() {
        let (assistant, client) = setup().await;
        let mut triggers = assistant.background_triggers().await.unwrap();
        let later = tomorrow().checked_add_days(Days::new(2)).unwrap();
        client.push_replies(vec![
            ScriptedReply::empty().tool_call("add_tasks", json!({"tasks": [{"title": "Gym"}]})),
            ScriptedReply::text("Adding").then_stall(Duration::from_secs(120)),
        ]);

        let (out, nav) = tokio::join!(assistant.send_message("add gym", None), async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            assistant.navigate(later).await
        });
        nav.unwrap();
        let out = out.unwrap();
        assert_eq!(out.interrupted.as_deref(), Some("Cancelled"));
        assert!(out.touched_tasks());

        assert_eq!(assistant.host().tasks_on(tomorrow()).await.len(), 1);
        assert!(assistant.host().tasks_on(later).await.is_empty());
        assert_eq!(assistant.viewed_date().await, later);
        assert!(assistant.pending_background_job().await.is_none());
        let fired = tokio::time::timeout(Duration::from_secs(60), triggers.recv()).await;
        assert!(fired.is_err());
    }
}
