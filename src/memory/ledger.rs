//! 关系台账

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::memory::tasks::parse_date;
use crate::tools::UpsertPersonArgs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    pub relation: Option<String>,
    pub notes: Option<String>,
    pub last_contacted: Option<NaiveDate>,
    pub contact_every_days: Option<u32>,
}

impl Person {
    /// 距下次应联系还有几天（负数表示已逾期）
    pub fn days_until_due(&self, today: NaiveDate) -> Option<i64> {
        let last = self.last_contacted?;
        let every = self.contact_every_days? as i64;
        Some(every - (today - last).num_days())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    people: Vec<Person>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn find(&self, name: &str) -> Option<&Person> {
        let name = name.trim();
        self.people.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// 新建或合并：只覆盖提供了的字段
    pub fn upsert(&mut self, args: &UpsertPersonArgs) -> Result<&Person, String> {
        let name = args.name.trim();
        if name.is_empty() {
            return Err("Person name must not be empty".to_string());
        }
        let last_contacted = args.last_contacted.as_deref().map(parse_date).transpose()?;
        let idx = match self
            .people
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
        {
            Some(i) => i,
            None => {
                self.people.push(Person {
                    name: name.to_string(),
                    relation: None,
                    notes: None,
                    last_contacted: None,
                    contact_every_days: None,
                });
                self.people.len() - 1
            }
        };
        let person = &mut self.people[idx];
        if let Some(r) = &args.relation {
            person.relation = Some(r.clone());
        }
        if let Some(n) = &args.notes {
            person.notes = Some(n.clone());
        }
        if last_contacted.is_some() {
            person.last_contacted = last_contacted;
        }
        if args.contact_every_days.is_some() {
            person.contact_every_days = args.contact_every_days;
        }
        Ok(&self.people[idx])
    }

    /// 姓名子串过滤（忽略大小写）
    pub fn search(&self, query: Option<&str>) -> Vec<&Person> {
        match query.map(|q| q.trim().to_lowercase()) {
            Some(q) if !q.is_empty() => self
                .people
                .iter()
                .filter(|p| p.name.to_lowercase().contains(&q))
                .collect(),
            _ => self.people.iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(name: &str) -> UpsertPersonArgs {
        UpsertPersonArgs {
            name: name.into(),
            relation: None,
            notes: None,
            last_contacted: None,
            contact_every_days: None,
        }
    }

    #[test]
    fn test_upsert_merges_fields() {
        let mut ledger = Ledger::new();
        let mut a = args("Alice");
        a.relation = Some("friend".into());
        ledger.upsert(&a).unwrap();

        let mut b = args("alice");
        b.last_contacted = Some("2026-10-01".into());
        b.contact_every_days = Some(14);
        let p = ledger.upsert(&b).unwrap().clone();
        assert_eq!(ledger.len(), 1);
        assert_eq!(p.relation.as_deref(), Some("friend"));
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(p.days_until_due(today), Some(-4));
    }

    #[test]
    fn test_upsert_rejects_bad_date() {
        let mut ledger = Ledger::new();
        let mut a = args("Bob");
        a.last_contacted = Some("last week".into());
        assert!(ledger.upsert(&a).is_err());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_search() {
        let mut ledger = Ledger::new();
        ledger.upsert(&args("Alice")).unwrap();
        ledger.upsert(&args("Bob")).unwrap();
        assert_eq!(ledger.search(Some("AL")).len(), 1);
        assert_eq!(ledger.search(None).len(), 2);
        assert_eq!(ledger.search(Some(" ")).len(), 2);
    }
}
