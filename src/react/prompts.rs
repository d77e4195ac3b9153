//! 提示词：基础策略、各时间模式策略、每轮提醒、补救与编排请求
//!
//! 可由 config/prompts/*.txt 覆盖，找不到文件时使用内置文本。

use chrono::{DateTime, Local};

use crate::core::TemporalMode;

const BASE_POLICY: &str = "You are a day-planning assistant. You manage the user's tasks, a relationship \
ledger of people they care about, and long-term notes, by calling the provided tools.\n\
Rules:\n\
- Use tools for every change; never claim a change you did not make through a tool.\n\
- Make targeted edits with add_tasks, move_tasks, update_task and delete_tasks.\n\
- propose_schedule rewrites the whole day and is only honoured when the user asked for a full \
rebuild; the user must approve the proposal before it takes effect.\n\
- If a tool returns an error or a rejection, explain it to the user and adapt; do not retry blindly.\n\
- When several tasks share a title, ask which one the user means.\n\
- Keep answers short and concrete.";

const RETROSPECTIVE_POLICY: &str = "MODE: RETROSPECTIVE. The viewed day is in the past. Help the user \
record what actually happened, reflect, and log interactions with people. Do not plan new work for \
this day; suggest moving unfinished items to today or later instead.";

const REALTIME_POLICY: &str = "MODE: REAL-TIME. The viewed day is today. Respect the current time: \
do not schedule anything earlier than now, keep the rest of the day realistic, and adjust quickly \
when plans change.";

const PROSPECTIVE_POLICY: &str = "MODE: PROSPECTIVE. The viewed day is in the future. Help the user \
plan: balance load, leave buffers, and consider people in the ledger who are due for contact.";

const RETROSPECTIVE_REMINDER: &str = "Reminder: past day, record and reflect, do not plan.";
const REALTIME_REMINDER: &str = "Reminder: today, nothing before the current time.";
const PROSPECTIVE_REMINDER: &str = "Reminder: future day, plan ahead.";

/// 编排类 Turn 未调用 propose_schedule 时的强制补救提示
pub const RESCUE_PROMPT: &str = "You have not called propose_schedule yet. This request is a full \
schedule rebuild: you MUST call propose_schedule now with the complete timeline, a short rationale \
and every task for the day. Do not answer in plain text.";

/// 后台编排 / 用户请求重建整天时发送的请求
pub const ORCHESTRATION_REQUEST: &str = "Rebuild the whole schedule for the viewed day. Read the \
current tasks and the relationship ledger first, then call propose_schedule with the full plan.";

/// 用户拒绝提案后的跟进请求
pub const REJECTION_FOLLOWUP: &str = "I rejected the schedule proposal. Ask me briefly what I would \
like to change. Do not propose a new schedule until I answer.";

/// 提示词集合
#[derive(Debug, Clone)]
pub struct Prompts {
    pub base: String,
    pub retrospective: String,
    pub realtime: String,
    pub prospective: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            base: BASE_POLICY.to_string(),
            retrospective: RETROSPECTIVE_POLICY.to_string(),
            realtime: REALTIME_POLICY.to_string(),
            prospective: PROSPECTIVE_POLICY.to_string(),
        }
    }
}

fn read_prompt(file: &str) -> Option<String> {
    [format!("config/prompts/{file}"), format!("../config/prompts/{file}")]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Prompts {
    /// 从 config/prompts 读取覆盖，缺失的保持内置文本
    pub fn load() -> Self {
        let d = Self::default();
        Self {
            base: read_prompt("system.txt").unwrap_or(d.base),
            retrospective: read_prompt("retrospective.txt").unwrap_or(d.retrospective),
            realtime: read_prompt("realtime.txt").unwrap_or(d.realtime),
            prospective: read_prompt("prospective.txt").unwrap_or(d.prospective),
        }
    }

    pub fn mode_policy(&self, mode: TemporalMode) -> &str {
        match mode {
            TemporalMode::Retrospective => &self.retrospective,
            TemporalMode::RealTime => &self.realtime,
            TemporalMode::Prospective => &self.prospective,
        }
    }
}

pub fn mode_reminder(mode: TemporalMode) -> &'static str {
    match mode {
        TemporalMode::Retrospective => RETROSPECTIVE_REMINDER,
        TemporalMode::RealTime => REALTIME_REMINDER,
        TemporalMode::Prospective => PROSPECTIVE_REMINDER,
    }
}

/// 每轮附在用户输入后的页脚：当前时间 + 模式提醒
pub fn turn_footer(now: DateTime<Local>, mode: TemporalMode) -> String {
    format!(
        "\n\n[Current time: {}] {}",
        now.format("%Y-%m-%d %H:%M (%a)"),
        mode_reminder(mode)
    )
}
