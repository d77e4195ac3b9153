//! 兜底确认：模型执行了变更却几乎没说话时，按变更类别生成确定性的确认文案
//!
//! 只读工具不计入；若只执行了只读工具，保持沉默，交给超时 / 错误处理去解释。

use serde_json::Value;

use crate::tools::MutationKind;

/// 本 Turn 内成功执行的变更（按首次出现顺序）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationTally {
    entries: Vec<(MutationKind, usize)>,
}

impl MutationTally {
    pub fn record(&mut self, kind: MutationKind, count: usize) {
        match self.entries.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, n)) => *n += count,
            None => self.entries.push((kind, count)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kinds(&self) -> Vec<MutationKind> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }

    pub fn count(&self, kind: MutationKind) -> usize {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    /// 是否改动了任务列表
    pub fn touched_tasks(&self) -> bool {
        self.entries.iter().any(|(k, _)| k.touches_tasks())
    }
}

fn items(n: usize) -> String {
    if n == 1 {
        "1 item".to_string()
    } else {
        format!("{n} items")
    }
}

fn people(n: usize) -> String {
    if n == 1 {
        "1 person".to_string()
    } else {
        format!("{n} people")
    }
}

fn phrase(kind: MutationKind, n: usize) -> String {
    match kind {
        MutationKind::TasksAdded => format!("Added {} to your schedule.", items(n)),
        MutationKind::TasksDeleted => format!("Removed {}.", items(n)),
        MutationKind::TasksMoved => format!("Rescheduled {}.", items(n)),
        MutationKind::TaskUpdated => format!("Updated {}.", items(n)),
        MutationKind::LedgerUpdated => "Updated your relationship ledger.".to_string(),
        MutationKind::ContactProposed => {
            format!("Suggested adding {} to your ledger, waiting for your approval.", people(n))
        }
        MutationKind::MemorySaved => "Noted that for later.".to_string(),
        MutationKind::ScheduleProposed => {
            "I've prepared a schedule proposal for your review.".to_string()
        }
    }
}

/// 按宿主的成功载荷确定实际生效的变更
///
/// added / deleted / moved 数组按实际条数计（未找到的不算）；新人只是排队待审；
/// 重复笔记不算写入。宿主未报告条数时按 1 计。没有任何生效时返回 None。
pub fn applied_mutation(kind: MutationKind, payload: &Value) -> Option<(MutationKind, usize)> {
    let listed = |key: &str| payload.get(key).and_then(Value::as_array).map_or(1, Vec::len);
    let (kind, n) = match kind {
        MutationKind::TasksAdded => (kind, listed("added")),
        MutationKind::TasksDeleted => (kind, listed("deleted")),
        MutationKind::TasksMoved => (kind, listed("moved")),
        MutationKind::LedgerUpdated if payload.get("queued_for_approval").is_some() => {
            (MutationKind::ContactProposed, 1)
        }
        MutationKind::MemorySaved if payload.get("saved") == Some(&Value::Bool(false)) => {
            return None;
        }
        other => (other, 1),
    };
    (n > 0).then_some((kind, n))
}

/// 回复是否过短
pub fn answer_too_short(answer: &str, min_chars: usize) -> bool {
    answer.trim().chars().count() < min_chars
}

/// 生成兜底确认；无变更时返回 None
pub fn synthesize_ack(tally: &MutationTally) -> Option<String> {
    if tally.is_empty() {
        return None;
    }
    let parts: Vec<String> = tally.entries.iter().map(|(k, n)| phrase(*k, *n)).collect();
    Some(parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_tally_stays_silent() {
        assert_eq!(synthesize_ack(&MutationTally::default()), None);
    }

    #[test]
    fn test_names_each_category_in_order() {
        let mut t = MutationTally::default();
        t.record(MutationKind::TasksMoved, 1);
        t.record(MutationKind::TasksAdded, 2);
        t.record(MutationKind::TasksAdded, 1);
        let ack = synthesize_ack(&t).unwrap();
        assert_eq!(ack, "Rescheduled 1 item. Added 3 items to your schedule.");
        assert!(t.touched_tasks());
    }

    #[test]
    fn test_proposal_ack() {
        let mut t = MutationTally::default();
        t.record(MutationKind::ScheduleProposed, 1);
        assert!(synthesize_ack(&t).unwrap().contains("proposal"));
        assert!(!t.touched_tasks());
    }

    #[test]
    fn test_applied_counts_come_from_payload() {
        let deleted = json!({"deleted": [{"id": "t1"}], "not_found": ["Nope", "Also nope"]});
        assert_eq!(
            applied_mutation(MutationKind::TasksDeleted, &deleted),
            Some((MutationKind::TasksDeleted, 1))
        );
        assert_eq!(
            applied_mutation(MutationKind::TasksMoved, &json!({"moved": []})),
            None
        );
        assert_eq!(
            applied_mutation(MutationKind::TaskUpdated, &json!({"updated": {}})),
            Some((MutationKind::TaskUpdated, 1))
        );
    }

    #[test]
    fn test_queued_person_is_not_a_ledger_write() {
        let queued = json!({"queued_for_approval": "Ana", "proposal_id": "x"});
        let (kind, n) = applied_mutation(MutationKind::LedgerUpdated, &queued).unwrap();
        assert_eq!(kind, MutationKind::ContactProposed);
        let mut t = MutationTally::default();
        t.record(kind, n);
        let ack = synthesize_ack(&t).unwrap();
        assert!(ack.contains("waiting for your approval"));
        assert!(!ack.contains("Updated your relationship ledger"));
    }

    #[test]
    fn test_duplicate_note_is_not_counted() {
        let dup = json!({"saved": false, "duplicate": true});
        assert_eq!(applied_mutation(MutationKind::MemorySaved, &dup), None);
    }

    #[test]
    fn test_answer_too_short_counts_chars_not_bytes() {
        assert!(answer_too_short("", 10));
        assert!(answer_too_short("  ok  ", 10));
        assert!(answer_too_short("好的，已添加", 10));
        assert!(!answer_too_short("Added your gym session.", 10));
    }
}
