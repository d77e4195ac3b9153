//! Dayloom - 对话式日程助手
//!
//! 入口：初始化日志、加载配置、创建 OpenAI 兼容客户端与内存 DayBook，运行终端 REPL。
//! 命令：/date YYYY-MM-DD、/plan、/accept、/reject、/tasks、/contacts、/accept-contacts、/quit；其余输入作为消息发送。

use std::sync::Arc;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use dayloom::agent::Assistant;
use dayloom::config::load_config;
use dayloom::llm::OpenAiClient;
use dayloom::memory::DayBook;
use dayloom::observability;
use dayloom::react::TurnEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let llm = OpenAiClient::from_config(&cfg.llm).context("LLM client is not configured")?;
    let book = Arc::new(DayBook::from_config(&cfg.proposal));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let assistant = Assistant::new(&cfg, Arc::new(llm), book.clone()).with_events(event_tx);
    let mut triggers = assistant
        .background_triggers()
        .await
        .context("background trigger channel already taken")?;

    // 工具调用过程打印到 stderr
    tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            match ev {
                TurnEvent::ToolCall { tool, round, .. } => eprintln!("  [round {round}] {tool}"),
                TurnEvent::ToolResult { tool, status, .. } => eprintln!("  -> {tool}: {status:?}"),
                TurnEvent::Interrupted { reason, .. } => eprintln!("  (interrupted: {reason})"),
                _ => {}
            }
        }
    });

    let mut date = Local::now().date_naive();
    assistant
        .navigate(date)
        .await
        .context("Failed to start session")?;
    println!("Dayloom ready for {date}. Type /quit to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(bg_date) = triggers.recv() => {
                println!("[background] rebuilding the schedule for {bg_date}...");
                report(assistant.run_orchestration(bg_date).await.map(|o| o.text));
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line.split_once(' ').map_or((line, ""), |(c, a)| (c, a.trim())) {
                    ("/quit", _) => break,
                    ("/date", arg) => match NaiveDate::parse_from_str(arg, "%Y-%m-%d") {
                        Ok(d) => {
                            date = d;
                            report(assistant.navigate(d).await.map(|_| format!("Now viewing {d}")));
                        }
                        Err(_) => println!("usage: /date YYYY-MM-DD"),
                    },
                    ("/plan", _) => report(assistant.run_orchestration(date).await.map(|o| o.text)),
                    ("/accept", _) => report(
                        assistant
                            .accept_schedule_proposal(date)
                            .await
                            .map(|r| format!("Applied {} tasks for {}", r.proposal.tasks.len(), r.date)),
                    ),
                    ("/reject", _) => report(assistant.reject_schedule_proposal(date).await.map(|o| o.text)),
                    ("/tasks", _) => {
                        for t in book.tasks_on(date).await {
                            let mark = if t.done { "x" } else { " " };
                            println!("[{mark}] {} {}", t.start_time.as_deref().unwrap_or("--:--"), t.title);
                        }
                        if let Some(p) = assistant.pending_schedule_proposal(date).await {
                            println!("Pending proposal:\n{}\n({})", p.timeline, p.rationale);
                        }
                    }
                    ("/contacts", _) => {
                        for p in assistant.pending_contacts(date).await {
                            println!("{} {}", p.id, p.person.name);
                        }
                    }
                    ("/accept-contacts", _) => report(
                        assistant
                            .accept_all_contacts(date)
                            .await
                            .map(|v| format!("Added {} people", v.len())),
                    ),
                    _ => report(assistant.send_message(line, None).await.map(|o| o.text)),
                }
            }
        }
    }
    Ok(())
}

fn report(result: Result<String, dayloom::core::AgentError>) {
    match result {
        Ok(text) if text.is_empty() => {}
        Ok(text) => println!("{text}"),
        Err(e) => {
            tracing::error!(error = %e, "operation failed");
            println!("Something went wrong, nothing was changed. ({e})");
        }
    }
}
