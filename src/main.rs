//! mmagent CLI
//!
//! 用法：`mmagent [--config <path>] <task>...`，未给任务时从标准输入读取一行。
//! 运行中按 Ctrl+C 取消；过程事件逐行打印到 stdout，日志走 stderr。

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mmagent::config::{load_config, AppConfig};
use mmagent::observability::{self, LogBuffer};
use mmagent::react::AgentEvent;
use mmagent::{create_agent_components, AgentController};
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(name = "mmagent", version, about = "Multimodal desktop agent: plan, act, reflect")]
struct Cli {
    /// 额外的 TOML 配置文件（覆盖 config/default.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 任务描述
    task: Vec<String>,
}

fn read_task_from_stdin() -> anyhow::Result<String> {
    print!("Task> ");
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read task from stdin")?;
    Ok(line.trim().to_string())
}

fn print_event(ev: &AgentEvent) {
    match ev {
        AgentEvent::StatusChanged { status } => println!("[status] {}", status),
        AgentEvent::PlanReady { cycle, steps } => println!("[plan] cycle {} with {} steps", cycle, steps),
        AgentEvent::ActionStarted { step, action } => println!("[step {}] {} ...", step + 1, action),
        AgentEvent::ActionFinished {
            step,
            action,
            status,
            message,
        } => println!("[step {}] {} -> {}: {}", step + 1, action, status.as_str(), message),
        AgentEvent::ParseFailure { failures, error, .. } => {
            println!("[parse] failure #{}: {}", failures, error)
        }
        AgentEvent::Reflection { success, thought, .. } => {
            println!("[reflect] {} {}", if *success { "ok" } else { "retry" }, thought)
        }
        AgentEvent::FeedbackConsumed { text } => println!("[feedback] {}", text),
        AgentEvent::SubtaskStarted { depth, description } => {
            println!("[subtask {}] {}", depth, description)
        }
        AgentEvent::SubtaskFinished { depth, success, .. } => {
            println!("[subtask {}] {}", depth, if *success { "done" } else { "failed" })
        }
        AgentEvent::Terminated { status, reason } => match reason {
            Some(r) => println!("[done] {} ({:?})", status, r),
            None => println!("[done] {}", status),
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init(None);

    let cfg = match load_config(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        }
    };

    let task = if cli.task.is_empty() {
        read_task_from_stdin()?
    } else {
        cli.task.join(" ")
    };
    if task.is_empty() {
        anyhow::bail!("No task given");
    }

    let components = create_agent_components(&cfg).context("Failed to create agent")?;
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AgentEvent>();
    let controller = AgentController::new(components)
        .with_event_tx(event_tx)
        .with_log_buffer(LogBuffer::new(cfg.app.log_buffer_lines));

    let printer = tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            let last = matches!(ev, AgentEvent::Terminated { .. });
            print_event(&ev);
            if last {
                break;
            }
        }
    });

    let previous_run = controller.status().run_id;
    let mut snapshots = controller.subscribe();
    controller.submit(task)?;

    tokio::select! {
        _ = snapshots.wait_for(|s| s.status.is_terminal() && s.run_id != previous_run) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Cancelling...");
            if !controller.cancel().await {
                println!("Run did not stop in time and was force-aborted");
            }
        }
    }
    let status = controller.wait().await;
    let _ = tokio::time::timeout(std::time::Duration::from_millis(500), printer).await;

    let state = controller.status();
    println!("Final status: {}", status);
    if let Some(reason) = state.termination {
        println!("Termination: {:?}", reason);
    }
    if let Some(feedback) = state.last_action_feedback {
        println!("Last feedback: {}", feedback.message);
    }
    Ok(())
}
