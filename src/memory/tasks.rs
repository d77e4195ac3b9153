//! 任务列表（调用方状态的参考实现）

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::proposal::TaskStore;
use crate::tools::TaskDraft;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub date: NaiveDate,
    /// HH:MM
    pub start_time: Option<String>,
    pub duration_minutes: Option<u32>,
    pub notes: Option<String>,
    pub done: bool,
}

/// 按标题查找的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TitleMatch {
    None,
    One(String),
    /// 多个完全同名：不猜测，交给用户
    Ambiguous(Vec<Task>),
}

/// 解析日期（YYYY-MM-DD），错误信息面向模型
pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| format!("Invalid date '{s}', expected YYYY-MM-DD"))
}

/// 规范化时间为 HH:MM
pub fn normalize_time(s: &str) -> Result<String, String> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map(|t| t.format("%H:%M").to_string())
        .map_err(|_| format!("Invalid time '{s}', expected HH:MM"))
}

/// 同名任务的澄清提示
pub fn disambiguation(title: &str, matches: &[Task]) -> String {
    let listed = matches
        .iter()
        .map(|t| {
            format!(
                "{} on {}{} (id {})",
                t.title,
                t.date,
                t.start_time
                    .as_deref()
                    .map(|s| format!(" at {s}"))
                    .unwrap_or_default(),
                t.id
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "Several tasks are titled '{title}': {listed}. Ask the user which one they mean, then retry with its id."
    )
}

#[derive(Debug, Clone, Default)]
pub struct TaskBook {
    tasks: Vec<Task>,
}

impl TaskBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> String {
        let taken: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        loop {
            let id = Uuid::new_v4().to_string();
            if !taken.contains(id.as_str()) {
                return id;
            }
        }
    }

    /// 校验并新增；date 为草稿未给日期时的默认值
    pub fn add(&mut self, default_date: NaiveDate, draft: &TaskDraft) -> Result<Task, String> {
        let task = self.build(default_date, draft)?;
        self.tasks.push(task.clone());
        Ok(task)
    }

    /// 校验草稿并生成任务（不写入）
    pub fn build(&self, default_date: NaiveDate, draft: &TaskDraft) -> Result<Task, String> {
        let title = draft.title.trim();
        if title.is_empty() {
            return Err("Task title must not be empty".to_string());
        }
        let date = match &draft.date {
            Some(d) => parse_date(d)?,
            None => default_date,
        };
        let start_time = draft.start_time.as_deref().map(normalize_time).transpose()?;
        Ok(Task {
            id: self.fresh_id(),
            title: title.to_string(),
            date,
            start_time,
            duration_minutes: draft.duration_minutes,
            notes: draft.notes.clone(),
            done: false,
        })
    }

    /// 某天任务，按开始时间排序（无时间的排在最后）
    pub fn on(&self, date: NaiveDate) -> Vec<&Task> {
        let mut out: Vec<&Task> = self.tasks.iter().filter(|t| t.date == date).collect();
        out.sort_by(|a, b| match (&a.start_time, &b.start_time) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        out
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| t.id == id)?;
        Some(self.tasks.remove(pos))
    }

    /// 按精确标题（忽略首尾空白与大小写）查找，可限定日期
    pub fn find_by_title(&self, title: &str, date: Option<NaiveDate>) -> TitleMatch {
        let wanted = title.trim().to_lowercase();
        let matches: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| date.map_or(true, |d| t.date == d))
            .filter(|t| t.title.to_lowercase() == wanted)
            .cloned()
            .collect();
        match matches.len() {
            0 => TitleMatch::None,
            1 => TitleMatch::One(matches[0].id.clone()),
            _ => TitleMatch::Ambiguous(matches),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn ids(&self) -> HashSet<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }
}

impl TaskStore for TaskBook {
    type Snapshot = Vec<Task>;

    fn snapshot(&self) -> Vec<Task> {
        self.tasks.clone()
    }

    fn restore(&mut self, snapshot: Vec<Task>) {
        self.tasks = snapshot;
    }

    fn remove_day(&mut self, date: NaiveDate) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.date != date);
        before - self.tasks.len()
    }

    fn insert_fresh(&mut self, date: NaiveDate, draft: &TaskDraft) -> Result<String, String> {
        // 提案中的任务一律落在提案日期上
        let mut draft = draft.clone();
        draft.date = None;
        self.add(date, &draft).map(|t| t.id)
    }
}
