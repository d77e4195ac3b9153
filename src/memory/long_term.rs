//! 长期笔记：用户偏好与生活信息，跨会话保存
//!
//! save_memory 工具写入；会话开始时取最近若干条组成记忆摘要放进上下文块。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 一条笔记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
    pub saved_at: DateTime<Utc>,
}

/// 笔记存储（内存，超出上限丢弃最旧的）
#[derive(Debug, Clone)]
pub struct NoteStore {
    notes: Vec<Note>,
    max_entries: usize,
}

impl NoteStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            notes: Vec::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// 写入；空文本与完全重复的笔记会被忽略，返回是否写入
    pub fn add(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || self.notes.iter().any(|n| n.text == text) {
            return false;
        }
        self.notes.push(Note {
            text: text.to_string(),
            saved_at: Utc::now(),
        });
        let n = self.notes.len();
        if n > self.max_entries {
            self.notes.drain(0..n - self.max_entries);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// 最近 k 条组成的摘要（每行一条）
    pub fn digest(&self, k: usize) -> String {
        let start = self.notes.len().saturating_sub(k);
        self.notes[start..]
            .iter()
            .map(|n| format!("- {}", n.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for NoteStore {
    fn default() -> Self {
        Self::new(500)
    }
}
