//! 联系人提案：每天一个有序队列，逐个或批量消费

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::proposal::ProposalError;
use crate::tools::UpsertPersonArgs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactProposal {
    pub id: Uuid,
    pub date: NaiveDate,
    pub person: UpsertPersonArgs,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ContactQueue {
    queues: HashMap<NaiveDate, VecDeque<ContactProposal>>,
}

impl ContactQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队；同一天已有同名（忽略大小写）待审提案时原位替换
    pub fn enqueue(&mut self, date: NaiveDate, person: UpsertPersonArgs) -> &ContactProposal {
        let queue = self.queues.entry(date).or_default();
        let pos = queue
            .iter()
            .position(|p| p.person.name.eq_ignore_ascii_case(&person.name));
        let proposal = ContactProposal {
            id: Uuid::new_v4(),
            date,
            person,
            created_at: Utc::now(),
        };
        match pos {
            Some(i) => {
                queue[i] = proposal;
                &queue[i]
            }
            None => {
                queue.push_back(proposal);
                &queue[queue.len() - 1]
            }
        }
    }

    pub fn pending(&self, date: NaiveDate) -> Vec<ContactProposal> {
        self.queues
            .get(&date)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_pending(&self, date: NaiveDate) -> bool {
        self.queues.get(&date).is_some_and(|q| !q.is_empty())
    }

    /// 取出一个（接受或拒绝都先从队列移除）
    pub fn take(&mut self, date: NaiveDate, id: Uuid) -> Result<ContactProposal, ProposalError> {
        let queue = self
            .queues
            .get_mut(&date)
            .ok_or_else(|| ProposalError::NotFound(id.to_string()))?;
        let pos = queue
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| ProposalError::NotFound(id.to_string()))?;
        queue
            .remove(pos)
            .ok_or_else(|| ProposalError::NotFound(id.to_string()))
    }

    /// 放回各自日期的队首，保持给定顺序（接受失败时用）
    pub fn restore(&mut self, proposals: Vec<ContactProposal>) {
        for p in proposals.into_iter().rev() {
            self.queues.entry(p.date).or_default().push_front(p);
        }
    }

    /// 按入队顺序取出当天全部
    pub fn take_all(&mut self, date: NaiveDate) -> Vec<ContactProposal> {
        self.queues
            .remove(&date)
            .map(Vec::from)
            .unwrap_or_default()
    }
}
