//! DayBook：调用方状态的内存参考实现（任务、关系台账、笔记、提案、审批记录）
//!
//! 实现 ToolHost 与 ProposalHost。业务校验（日期格式、不能把任务挪到过去、同名不猜测）都在这里，
//! 拒绝信息以 ToolOutcome::Rejected 回传给模型。

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProposalSection;
use crate::memory::ledger::{Ledger, Person};
use crate::memory::long_term::NoteStore;
use crate::memory::tasks::{disambiguation, normalize_time, parse_date, Task, TaskBook, TitleMatch};
use crate::proposal::{
    ApprovalRecord, ApprovalStatus, ContactProposal, ContactQueue, ProposalError, ProposalHost,
    ScheduleBoard, ScheduleProposal,
};
use crate::tools::*;

/// 记忆摘要中放入的最近笔记条数
const DIGEST_NOTES: usize = 10;

struct BookState {
    tasks: TaskBook,
    ledger: Ledger,
    notes: NoteStore,
    schedules: ScheduleBoard,
    contacts: ContactQueue,
    viewed: NaiveDate,
    today: NaiveDate,
}

impl BookState {
    /// 任务改动后：相关日期的审批记录失效
    fn touched(&mut self, dates: impl IntoIterator<Item = NaiveDate>) {
        for date in dates.into_iter().collect::<BTreeSet<_>>() {
            self.schedules.mark_day_mutated(date);
        }
    }

    fn date_or_viewed(&self, date: Option<&str>) -> Result<NaiveDate, String> {
        match date {
            Some(d) => parse_date(d),
            None => Ok(self.viewed),
        }
    }

    /// 通过 id 或精确标题定位任务；同名多条时返回澄清提示
    fn resolve(
        &self,
        id: Option<&str>,
        title: Option<&str>,
        date: Option<&str>,
    ) -> Result<String, String> {
        if let Some(id) = id {
            return match self.tasks.get(id) {
                Some(t) => Ok(t.id.clone()),
                None => Err(format!("Task not found: {id}")),
            };
        }
        let Some(title) = title else {
            return Err("Either id or title is required".to_string());
        };
        let scope = self.date_or_viewed(date)?;
        match self.tasks.find_by_title(title, Some(scope)) {
            TitleMatch::One(id) => Ok(id),
            TitleMatch::None => Err(format!("No task titled '{title}' on {scope}")),
            TitleMatch::Ambiguous(matches) => Err(disambiguation(title, &matches)),
        }
    }
}

pub struct DayBook {
    state: Mutex<BookState>,
}

impl DayBook {
    pub fn new(min_interval: Duration, today: NaiveDate) -> Self {
        Self {
            state: Mutex::new(BookState {
                tasks: TaskBook::new(),
                ledger: Ledger::new(),
                notes: NoteStore::default(),
                schedules: ScheduleBoard::new(min_interval),
                contacts: ContactQueue::new(),
                viewed: today,
                today,
            }),
        }
    }

    pub fn from_config(cfg: &ProposalSection) -> Self {
        Self::new(
            Duration::from_secs(cfg.min_interval_secs),
            Local::now().date_naive(),
        )
    }

    pub async fn set_today(&self, today: NaiveDate) {
        self.state.lock().await.today = today;
    }

    pub async fn viewed_date(&self) -> NaiveDate {
        self.state.lock().await.viewed
    }

    /// 直接新增任务（UI 操作，与工具调用同样会使审批记录失效）
    pub async fn add_task(&self, draft: &TaskDraft) -> Result<Task, String> {
        let mut st = self.state.lock().await;
        let viewed = st.viewed;
        let task = st.tasks.add(viewed, draft)?;
        st.touched([task.date]);
        Ok(task)
    }

    pub async fn tasks_on(&self, date: NaiveDate) -> Vec<Task> {
        self.state.lock().await.tasks.on(date).into_iter().cloned().collect()
    }

    pub async fn people(&self) -> Vec<Person> {
        self.state.lock().await.ledger.search(None).into_iter().cloned().collect()
    }

    pub async fn approval(&self, date: NaiveDate) -> Option<ApprovalRecord> {
        self.state.lock().await.schedules.approval(date).cloned()
    }

    pub async fn schedule_history(&self) -> Vec<ScheduleProposal> {
        self.state.lock().await.schedules.history().to_vec()
    }

    pub async fn notes(&self) -> String {
        self.state.lock().await.notes.digest(usize::MAX)
    }
}

#[async_trait]
impl ToolHost for DayBook {
    async fn get_ledger(&self, args: GetLedgerArgs) -> anyhow::Result<ToolOutcome> {
        let st = self.state.lock().await;
        let today = st.today;
        let people: Vec<_> = st
            .ledger
            .search(args.query.as_deref())
            .into_iter()
            .map(|p| -> Result<serde_json::Value, serde_json::Error> {
                let mut v = serde_json::to_value(p)?;
                v["days_until_due"] = json!(p.days_until_due(today));
                Ok(v)
            })
            .collect::<Result<_, serde_json::Error>>()?;
        Ok(ToolOutcome::ok(json!({ "people": people })))
    }

    async fn get_tasks(&self, args: GetTasksArgs) -> anyhow::Result<ToolOutcome> {
        let st = self.state.lock().await;
        let date = match parse_date(&args.date) {
            Ok(d) => d,
            Err(e) => return Ok(ToolOutcome::reject(e)),
        };
        let tasks = st.tasks.on(date);
        Ok(ToolOutcome::ok(json!({
            "date": date,
            "tasks": serde_json::to_value(tasks)?,
            "approval": st.schedules.approval_status(date).as_str(),
        })))
    }

    async fn propose_schedule(&self, args: ProposeScheduleArgs) -> anyhow::Result<ToolOutcome> {
        let mut st = self.state.lock().await;
        let date = match st.date_or_viewed(args.date.as_deref()) {
            Ok(d) => d,
            Err(e) => return Ok(ToolOutcome::reject(e)),
        };
        if date < st.today {
            return Ok(ToolOutcome::reject(format!(
                "Cannot propose a schedule for {date}, it is in the past"
            )));
        }
        for draft in &args.tasks {
            if let Err(e) = st.tasks.build(date, draft) {
                return Ok(ToolOutcome::reject(e));
            }
        }
        match st
            .schedules
            .create(date, args.timeline, args.rationale, args.tasks, Instant::now())
        {
            Ok(p) => Ok(ToolOutcome::ok(json!({
                "proposal_id": p.id,
                "date": date,
                "status": "awaiting_user_approval",
                "task_count": p.tasks.len(),
            }))),
            Err(e) => Ok(ToolOutcome::reject(e.to_string())),
        }
    }

    async fn upsert_person(&self, args: UpsertPersonArgs) -> anyhow::Result<ToolOutcome> {
        let mut st = self.state.lock().await;
        if args.name.trim().is_empty() {
            return Ok(ToolOutcome::reject("Person name must not be empty"));
        }
        if st.ledger.contains(&args.name) {
            return Ok(match st.ledger.upsert(&args) {
                Ok(p) => ToolOutcome::ok(json!({ "updated": serde_json::to_value(p)? })),
                Err(e) => ToolOutcome::reject(e),
            });
        }
        if let Some(d) = &args.last_contacted {
            if let Err(e) = parse_date(d) {
                return Ok(ToolOutcome::reject(e));
            }
        }
        // 新人需要用户确认后才写入台账
        let viewed = st.viewed;
        let proposal = st.contacts.enqueue(viewed, args);
        info!(name = %proposal.person.name, "contact proposal queued");
        Ok(ToolOutcome::ok(json!({
            "queued_for_approval": proposal.person.name,
            "proposal_id": proposal.id,
        })))
    }

    async fn add_tasks(&self, args: AddTasksArgs) -> anyhow::Result<ToolOutcome> {
        let mut st = self.state.lock().await;
        if args.tasks.is_empty() {
            return Ok(ToolOutcome::reject("No tasks given"));
        }
        let viewed = st.viewed;
        // 先全部校验，再写入
        for draft in &args.tasks {
            if let Err(e) = st.tasks.build(viewed, draft) {
                return Ok(ToolOutcome::reject(e));
            }
        }
        let mut added = Vec::with_capacity(args.tasks.len());
        for draft in &args.tasks {
            match st.tasks.add(viewed, draft) {
                Ok(t) => added.push(t),
                Err(e) => return Ok(ToolOutcome::reject(e)),
            }
        }
        st.touched(added.iter().map(|t| t.date));
        debug!(count = added.len(), "tasks added");
        Ok(ToolOutcome::ok(json!({ "added": serde_json::to_value(&added)? })))
    }

    async fn delete_tasks(&self, args: DeleteTasksArgs) -> anyhow::Result<ToolOutcome> {
        let mut st = self.state.lock().await;
        let scope = match st.date_or_viewed(args.date.as_deref()) {
            Ok(d) => d,
            Err(e) => return Ok(ToolOutcome::reject(e)),
        };
        let mut ids: Vec<String> = Vec::new();
        let mut not_found: Vec<String> = Vec::new();
        for id in &args.ids {
            match st.tasks.get(id) {
                Some(t) => ids.push(t.id.clone()),
                None => not_found.push(id.clone()),
            }
        }
        for title in &args.titles {
            match st.tasks.find_by_title(title, Some(scope)) {
                TitleMatch::One(id) => ids.push(id),
                TitleMatch::None => not_found.push(title.clone()),
                TitleMatch::Ambiguous(matches) => {
                    return Ok(ToolOutcome::reject(disambiguation(title, &matches)));
                }
            }
        }
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        if ids.is_empty() {
            return Ok(ToolOutcome::reject(format!(
                "No matching tasks found: {}",
                not_found.join(", ")
            )));
        }
        let deleted: Vec<Task> = ids.iter().filter_map(|id| st.tasks.remove(id)).collect();
        st.touched(deleted.iter().map(|t| t.date));
        Ok(ToolOutcome::ok(json!({
            "deleted": serde_json::to_value(&deleted)?,
            "not_found": not_found,
        })))
    }

    async fn move_tasks(&self, args: MoveTasksArgs) -> anyhow::Result<ToolOutcome> {
        let mut st = self.state.lock().await;
        let mut plan = Vec::with_capacity(args.moves.len());
        for mv in &args.moves {
            let id = match st.resolve(mv.id.as_deref(), mv.title.as_deref(), mv.from_date.as_deref()) {
                Ok(id) => id,
                Err(e) => return Ok(ToolOutcome::reject(e)),
            };
            let to = match parse_date(&mv.to_date) {
                Ok(d) => d,
                Err(e) => return Ok(ToolOutcome::reject(e)),
            };
            if to < st.today {
                return Ok(ToolOutcome::reject(format!(
                    "Cannot move a task to {to}, it is in the past"
                )));
            }
            let time = match mv.start_time.as_deref().map(normalize_time).transpose() {
                Ok(t) => t,
                Err(e) => return Ok(ToolOutcome::reject(e)),
            };
            plan.push((id, to, time));
        }
        let mut touched = Vec::new();
        let mut moved = Vec::new();
        for (id, to, time) in plan {
            if let Some(task) = st.tasks.get_mut(&id) {
                touched.push(task.date);
                task.date = to;
                if time.is_some() {
                    task.start_time = time;
                }
                touched.push(to);
                moved.push(task.clone());
            }
        }
        st.touched(touched);
        Ok(ToolOutcome::ok(json!({ "moved": serde_json::to_value(&moved)? })))
    }

    async fn update_task(&self, args: UpdateTaskArgs) -> anyhow::Result<ToolOutcome> {
        let mut st = self.state.lock().await;
        let id = match st.resolve(args.id.as_deref(), args.title.as_deref(), args.date.as_deref()) {
            Ok(id) => id,
            Err(e) => return Ok(ToolOutcome::reject(e)),
        };
        let time = match args.start_time.as_deref().map(normalize_time).transpose() {
            Ok(t) => t,
            Err(e) => return Ok(ToolOutcome::reject(e)),
        };
        if let Some(t) = &args.new_title {
            if t.trim().is_empty() {
                return Ok(ToolOutcome::reject("Task title must not be empty"));
            }
        }
        let Some(task) = st.tasks.get_mut(&id) else {
            return Ok(ToolOutcome::reject(format!("Task not found: {id}")));
        };
        if let Some(t) = &args.new_title {
            task.title = t.trim().to_string();
        }
        if time.is_some() {
            task.start_time = time;
        }
        if args.duration_minutes.is_some() {
            task.duration_minutes = args.duration_minutes;
        }
        if args.notes.is_some() {
            task.notes = args.notes.clone();
        }
        if let Some(done) = args.done {
            task.done = done;
        }
        let updated = task.clone();
        st.touched([updated.date]);
        Ok(ToolOutcome::ok(json!({ "updated": serde_json::to_value(&updated)? })))
    }

    async fn save_memory(&self, args: SaveMemoryArgs) -> anyhow::Result<ToolOutcome> {
        let mut st = self.state.lock().await;
        if args.note.trim().is_empty() {
            return Ok(ToolOutcome::reject("Note must not be empty"));
        }
        let saved = st.notes.add(&args.note);
        Ok(ToolOutcome::ok(json!({ "saved": saved, "duplicate": !saved })))
    }
}

#[async_trait]
impl ProposalHost for DayBook {
    async fn pending_schedule(&self, date: NaiveDate) -> Option<ScheduleProposal> {
        self.state.lock().await.schedules.pending(date).cloned()
    }

    async fn accept_schedule(&self, date: NaiveDate) -> Result<ApprovalRecord, ProposalError> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        st.schedules.accept(date, &mut st.tasks)
    }

    async fn reject_schedule(&self, date: NaiveDate) -> Result<ScheduleProposal, ProposalError> {
        self.state.lock().await.schedules.reject(date)
    }

    async fn approval_status(&self, date: NaiveDate) -> ApprovalStatus {
        self.state.lock().await.schedules.approval_status(date)
    }

    async fn pending_contacts(&self, date: NaiveDate) -> Vec<ContactProposal> {
        self.state.lock().await.contacts.pending(date)
    }

    async fn accept_contact(
        &self,
        date: NaiveDate,
        id: Uuid,
    ) -> Result<ContactProposal, ProposalError> {
        let mut st = self.state.lock().await;
        let proposal = st.contacts.take(date, id)?;
        if let Err(reason) = st.ledger.upsert(&proposal.person).map(|_| ()) {
            warn!(name = %proposal.person.name, %reason, "contact proposal could not be applied; kept pending");
            st.contacts.restore(vec![proposal]);
            return Err(ProposalError::Apply { reason });
        }
        info!(name = %proposal.person.name, "contact proposal accepted");
        Ok(proposal)
    }

    async fn accept_all_contacts(&self, date: NaiveDate) -> Vec<ContactProposal> {
        let mut st = self.state.lock().await;
        let taken = st.contacts.take_all(date);
        let mut accepted = Vec::with_capacity(taken.len());
        let mut failed = Vec::new();
        for proposal in taken {
            match st.ledger.upsert(&proposal.person).map(|_| ()) {
                Ok(()) => accepted.push(proposal),
                Err(reason) => {
                    warn!(name = %proposal.person.name, %reason, "contact proposal could not be applied; kept pending");
                    failed.push(proposal);
                }
            }
        }
        info!(count = accepted.len(), kept = failed.len(), "contact proposals accepted");
        st.contacts.restore(failed);
        accepted
    }

    async fn reject_contact(
        &self,
        date: NaiveDate,
        id: Uuid,
    ) -> Result<ContactProposal, ProposalError> {
        let proposal = self.state.lock().await.contacts.take(date, id)?;
        info!(name = %proposal.person.name, "contact proposal rejected");
        Ok(proposal)
    }

    async fn set_viewed_date(&self, date: NaiveDate) {
        self.state.lock().await.viewed = date;
    }

    async fn memory_digest(&self) -> Option<String> {
        let st = self.state.lock().await;
        (!st.notes.is_empty()).then(|| st.notes.digest(DIGEST_NOTES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    fn book() -> DayBook {
        DayBook::new(Duration::from_secs(5), day(19))
    }

    fn draft(title: &str) -> TaskDraft {
        TaskDraft {
            title: title.into(),
            date: None,
            start_time: None,
            duration_minutes: None,
            notes: None,
        }
    }

    fn success(outcome: ToolOutcome) -> Value {
        match outcome {
            ToolOutcome::Success(v) => v,
            ToolOutcome::Rejected(msg) => panic!("rejected: {msg}"),
        }
    }

    fn rejection(outcome: ToolOutcome) -> String {
        match outcome {
            ToolOutcome::Rejected(msg) => msg,
            ToolOutcome::Success(v) => panic!("unexpected success: {v}"),
        }
    }

    #[tokio::test]
    async fn test_add_tasks_is_all_or_nothing() {
        let b = book();
        let mut bad = draft("Gym");
        bad.start_time = Some("noon".into());
        let out = b
            .add_tasks(AddTasksArgs {
                tasks: vec![draft("Read"), bad],
            })
            .await
            .unwrap();
        assert!(rejection(out).contains("Invalid time"));
        assert!(b.tasks_on(day(19)).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_ambiguous_title_asks() {
        let b = book();
        b.add_task(&draft("Call mom")).await.unwrap();
        b.add_task(&draft("Call mom")).await.unwrap();
        let out = b
            .delete_tasks(DeleteTasksArgs {
                titles: vec!["Call mom".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(rejection(out).contains("Ask the user"));
        assert_eq!(b.tasks_on(day(19)).await.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_by_id_and_title() {
        let b = book();
        let a = b.add_task(&draft("A")).await.unwrap();
        b.add_task(&draft("B")).await.unwrap();
        let out = success(
            b.delete_tasks(DeleteTasksArgs {
                ids: vec![a.id.clone()],
                titles: vec!["b".into(), "missing".into()],
                date: None,
            })
            .await
            .unwrap(),
        );
        assert_eq!(out["deleted"].as_array().unwrap().len(), 2);
        assert_eq!(out["not_found"], json!(["missing"]));
        assert!(b.tasks_on(day(19)).await.is_empty());
    }

    #[tokio::test]
    async fn test_move_into_past_is_rejected() {
        let b = book();
        let t = b.add_task(&draft("Gym")).await.unwrap();
        let out = b
            .move_tasks(MoveTasksArgs {
                moves: vec![TaskMove {
                    id: Some(t.id.clone()),
                    title: None,
                    from_date: None,
                    to_date: "2026-10-18".into(),
                    start_time: None,
                }],
            })
            .await
            .unwrap();
        assert!(rejection(out).contains("past"));

        let out = success(
            b.move_tasks(MoveTasksArgs {
                moves: vec![TaskMove {
                    id: None,
                    title: Some("gym".into()),
                    from_date: None,
                    to_date: "2026-10-21".into(),
                    start_time: Some("18:30".into()),
                }],
            })
            .await
            .unwrap(),
        );
        assert_eq!(out["moved"][0]["start_time"], "18:30");
        assert_eq!(b.tasks_on(day(21)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_new_person_goes_to_contact_queue() {
        let b = book();
        let out = success(
            b.upsert_person(UpsertPersonArgs {
                name: "Alice".into(),
                relation: Some("friend".into()),
                notes: None,
                last_contacted: None,
                contact_every_days: None,
            })
            .await
            .unwrap(),
        );
        assert_eq!(out["queued_for_approval"], "Alice");
        assert!(b.people().await.is_empty());

        let pending = b.pending_contacts(day(19)).await;
        assert_eq!(pending.len(), 1);
        b.accept_contact(day(19), pending[0].id).await.unwrap();
        assert_eq!(b.people().await.len(), 1);
        assert!(b.pending_contacts(day(19)).await.is_empty());

        // 已在台账中的人直接更新
        let out = success(
            b.upsert_person(UpsertPersonArgs {
                name: "alice".into(),
                relation: None,
                notes: Some("likes tea".into()),
                last_contacted: None,
                contact_every_days: None,
            })
            .await
            .unwrap(),
        );
        assert_eq!(out["updated"]["notes"], "likes tea");
    }

    #[tokio::test]
    async fn test_propose_for_past_day_is_rejected() {
        let b = book();
        let out = b
            .propose_schedule(ProposeScheduleArgs {
                date: Some("2026-10-18".into()),
                timeline: "x".into(),
                rationale: "y".into(),
                tasks: vec![],
            })
            .await
            .unwrap();
        assert!(rejection(out).contains("past"));
    }

    #[tokio::test]
    async fn test_save_memory_feeds_digest() {
        let b = book();
        assert_eq!(b.memory_digest().await, None);
        success(
            b.save_memory(SaveMemoryArgs {
                note: "Prefers morning workouts".into(),
            })
            .await
            .unwrap(),
        );
        assert_eq!(
            b.memory_digest().await.as_deref(),
            Some("- Prefers morning workouts")
        );
    }

    fn person(name: &str, last_contacted: Option<&str>) -> UpsertPersonArgs {
        UpsertPersonArgs {
            name: name.into(),
            relation: None,
            notes: None,
            last_contacted: last_contacted.map(String::from),
            contact_every_days: None,
        }
    }

    #[tokio::test]
    async fn test_failed_contact_acceptance_stays_pending() {
        let b = book();
        {
            let mut st = b.state.lock().await;
            st.contacts.enqueue(day(19), person("Ana", None));
            st.contacts.enqueue(day(19), person("Ben", Some("someday")));
        }
        let accepted = b.accept_all_contacts(day(19)).await;
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].person.name, "Ana");

        let pending = b.pending_contacts(day(19)).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].person.name, "Ben");

        let err = b.accept_contact(day(19), pending[0].id).await.unwrap_err();
        assert!(matches!(err, ProposalError::Apply { .. }));
        assert_eq!(b.pending_contacts(day(19)).await.len(), 1);
        assert_eq!(b.people().await.len(), 1);
    }
}
