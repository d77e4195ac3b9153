//! 调用方状态的参考实现：任务、关系台账、长期笔记，以及组合它们的 DayBook

pub mod daybook;
pub mod ledger;
pub mod long_term;
pub mod tasks;
pub mod tokenizer;

pub use daybook::DayBook;
pub use ledger::{Ledger, Person};
pub use long_term::{Note, NoteStore};
pub use tasks::{Task, TaskBook, TitleMatch};
pub use tokenizer::estimate_tokens;
