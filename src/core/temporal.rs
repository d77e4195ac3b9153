//! 时间模式分类：回顾 / 实时 / 前瞻
//!
//! 仅比较日历日期（忽略时分秒）：目标日早于今天为 Retrospective，晚于今天为 Prospective，同日为 RealTime。
//! 每种模式对应一段在会话开始时追加的行为策略，以及每轮附带的简短提醒。

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

/// 时间模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalMode {
    /// 回看过去的一天：记录与复盘，不做前瞻性规划
    Retrospective,
    /// 今天：实时调整
    RealTime,
    /// 未来的一天：规划
    Prospective,
}

impl TemporalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemporalMode::Retrospective => "retrospective",
            TemporalMode::RealTime => "real-time",
            TemporalMode::Prospective => "prospective",
        }
    }

    /// 宽松解析上下文块中的模式字样
    pub fn parse_loose(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "retrospective" | "past" | "review" => Some(TemporalMode::Retrospective),
            "real-time" | "realtime" | "real_time" | "today" | "live" => Some(TemporalMode::RealTime),
            "prospective" | "future" | "planning" => Some(TemporalMode::Prospective),
            _ => None,
        }
    }
}

impl std::fmt::Display for TemporalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 按日历日期分类
pub fn classify(target: NaiveDate, today: NaiveDate) -> TemporalMode {
    match target.cmp(&today) {
        Ordering::Less => TemporalMode::Retrospective,
        Ordering::Equal => TemporalMode::RealTime,
        Ordering::Greater => TemporalMode::Prospective,
    }
}

/// 按各自所在时区的本地日期分类（跨夏令时切换时仍只看日历日）
pub fn classify_instants<A: TimeZone, B: TimeZone>(target: &DateTime<A>, now: &DateTime<B>) -> TemporalMode {
    classify(target.date_naive(), now.date_naive())
}
