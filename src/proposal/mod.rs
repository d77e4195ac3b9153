//! 提案生命周期：整日日程提案与联系人提案
//!
//! 提案状态归调用方所有；Assistant 通过 ProposalHost 操作它。

pub mod contact;
pub mod schedule;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

pub use contact::{ContactProposal, ContactQueue};
pub use schedule::{
    ApprovalRecord, ApprovalStatus, ProposalStatus, ScheduleBoard, ScheduleProposal, TaskStore,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProposalError {
    #[error("Still processing the previous proposal, try again in {wait_ms} ms")]
    StillProcessing { wait_ms: u64 },

    #[error("No pending schedule proposal for {date}")]
    NoPendingProposal { date: NaiveDate },

    #[error("Proposal not found: {0}")]
    NotFound(String),

    /// 替换当天任务失败，已回滚，可重试
    #[error("Could not apply proposal (nothing was changed): {reason}")]
    Apply { reason: String },
}

/// 调用方的提案与上下文状态
#[async_trait]
pub trait ProposalHost: Send + Sync {
    async fn pending_schedule(&self, date: NaiveDate) -> Option<ScheduleProposal>;
    async fn accept_schedule(&self, date: NaiveDate) -> Result<ApprovalRecord, ProposalError>;
    async fn reject_schedule(&self, date: NaiveDate) -> Result<ScheduleProposal, ProposalError>;
    async fn approval_status(&self, date: NaiveDate) -> ApprovalStatus;

    async fn pending_contacts(&self, date: NaiveDate) -> Vec<ContactProposal>;
    async fn accept_contact(
        &self,
        date: NaiveDate,
        id: Uuid,
    ) -> Result<ContactProposal, ProposalError>;
    async fn accept_all_contacts(&self, date: NaiveDate) -> Vec<ContactProposal>;
    async fn reject_contact(
        &self,
        date: NaiveDate,
        id: Uuid,
    ) -> Result<ContactProposal, ProposalError>;

    /// 工具的默认日期跟随用户正在查看的日期
    async fn set_viewed_date(&self, _date: NaiveDate) {}

    /// 放进上下文块的长期记忆摘要
    async fn memory_digest(&self) -> Option<String> {
        None
    }
}
