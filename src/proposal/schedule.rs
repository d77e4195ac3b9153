//! 整日日程提案：创建（去抖 + 取代旧提案）、接受（原子替换当天任务）、拒绝、审批记录失效

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::proposal::ProposalError;
use crate::tools::TaskDraft;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    /// 被同一天更新的提案取代（保留在历史中）
    Dismissed,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleProposal {
    pub id: Uuid,
    pub date: NaiveDate,
    pub timeline: String,
    pub rationale: String,
    pub tasks: Vec<TaskDraft>,
    pub created_at: DateTime<Utc>,
    pub status: ProposalStatus,
}

/// 审批记录：接受提案时生成；之后当天任务被改动则 active 变为 false（不删除）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub date: NaiveDate,
    pub proposal: ScheduleProposal,
    pub approved_at: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    None,
    Active,
    Stale,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::None => "none",
            ApprovalStatus::Active => "approved",
            ApprovalStatus::Stale => "approved, since modified",
        }
    }
}

/// 接受提案时对任务列表的操作；失败时用快照回滚
pub trait TaskStore {
    type Snapshot;

    fn snapshot(&self) -> Self::Snapshot;
    fn restore(&mut self, snapshot: Self::Snapshot);
    /// 删除某天全部任务，返回删除数量
    fn remove_day(&mut self, date: NaiveDate) -> usize;
    /// 以新生成的唯一 id 插入，返回 id
    fn insert_fresh(&mut self, date: NaiveDate, draft: &TaskDraft) -> Result<String, String>;
}

/// 每天至多一个待审提案
#[derive(Debug)]
pub struct ScheduleBoard {
    min_interval: Duration,
    live: HashMap<NaiveDate, ScheduleProposal>,
    history: Vec<ScheduleProposal>,
    last_created: HashMap<NaiveDate, Instant>,
    approvals: HashMap<NaiveDate, ApprovalRecord>,
}

impl ScheduleBoard {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            live: HashMap::new(),
            history: Vec::new(),
            last_created: HashMap::new(),
            approvals: HashMap::new(),
        }
    }

    /// 创建提案。距同一天上次创建不足 min_interval 时返回 StillProcessing；
    /// 已有待审提案时将其标记为 Dismissed 并移入历史。
    pub fn create(
        &mut self,
        date: NaiveDate,
        timeline: String,
        rationale: String,
        tasks: Vec<TaskDraft>,
        now: Instant,
    ) -> Result<&ScheduleProposal, ProposalError> {
        if let Some(last) = self.last_created.get(&date) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.min_interval {
                let wait_ms = (self.min_interval - elapsed).as_millis() as u64;
                info!(%date, wait_ms, "schedule proposal rejected: still processing");
                return Err(ProposalError::StillProcessing { wait_ms });
            }
        }
        if let Some(mut prior) = self.live.remove(&date) {
            prior.status = ProposalStatus::Dismissed;
            info!(%date, id = %prior.id, "prior schedule proposal dismissed");
            self.history.push(prior);
        }
        let proposal = ScheduleProposal {
            id: Uuid::new_v4(),
            date,
            timeline,
            rationale,
            tasks,
            created_at: Utc::now(),
            status: ProposalStatus::Pending,
        };
        info!(%date, id = %proposal.id, tasks = proposal.tasks.len(), "schedule proposal created");
        self.last_created.insert(date, now);
        Ok(self.live.entry(date).or_insert(proposal))
    }

    pub fn pending(&self, date: NaiveDate) -> Option<&ScheduleProposal> {
        self.live.get(&date)
    }

    pub fn has_pending(&self, date: NaiveDate) -> bool {
        self.live.contains_key(&date)
    }

    /// 已被取代或接受的提案
    pub fn history(&self) -> &[ScheduleProposal] {
        &self.history
    }

    /// 接受：全有或全无。先快照，删除当天任务，逐个插入；任何一步失败即回滚，提案保持待审。
    pub fn accept<S: TaskStore>(
        &mut self,
        date: NaiveDate,
        store: &mut S,
    ) -> Result<ApprovalRecord, ProposalError> {
        let proposal = self
            .live
            .get(&date)
            .cloned()
            .ok_or(ProposalError::NoPendingProposal { date })?;

        let snapshot = store.snapshot();
        let removed = store.remove_day(date);
        for draft in &proposal.tasks {
            if let Err(reason) = store.insert_fresh(date, draft) {
                store.restore(snapshot);
                warn!(%date, %reason, "schedule acceptance rolled back");
                return Err(ProposalError::Apply { reason });
            }
        }

        self.live.remove(&date);
        let mut accepted = proposal;
        accepted.status = ProposalStatus::Accepted;
        self.history.push(accepted.clone());
        let record = ApprovalRecord {
            date,
            proposal: accepted,
            approved_at: Utc::now(),
            active: true,
        };
        info!(%date, removed, inserted = record.proposal.tasks.len(), "schedule proposal accepted");
        self.approvals.insert(date, record.clone());
        Ok(record)
    }

    /// 拒绝：丢弃提案，不留审批记录
    pub fn reject(&mut self, date: NaiveDate) -> Result<ScheduleProposal, ProposalError> {
        let mut proposal = self
            .live
            .remove(&date)
            .ok_or(ProposalError::NoPendingProposal { date })?;
        proposal.status = ProposalStatus::Rejected;
        info!(%date, id = %proposal.id, "schedule proposal rejected");
        Ok(proposal)
    }

    /// 某天任务被改动：活跃的审批记录失效。返回是否发生了翻转。
    pub fn mark_day_mutated(&mut self, date: NaiveDate) -> bool {
        match self.approvals.get_mut(&date) {
            Some(record) if record.active => {
                record.active = false;
                info!(%date, "approval record is now stale");
                true
            }
            _ => false,
        }
    }

    pub fn approval(&self, date: NaiveDate) -> Option<&ApprovalRecord> {
        self.approvals.get(&date)
    }

    pub fn approval_status(&self, date: NaiveDate) -> ApprovalStatus {
        match self.approvals.get(&date) {
            None => ApprovalStatus::None,
            Some(r) if r.active => ApprovalStatus::Active,
            Some(_) => ApprovalStatus::Stale,
        }
    }
}
