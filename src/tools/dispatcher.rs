//! 动作分派器
//!
//! dispatch(record) 把一条动作记录映射到白名单内的某个副作用操作，调用对应协作者，返回统一的 Outcome。
//! - 动作名先解析为 ActionKind，不在白名单内直接返回 failure，不触碰任何协作者
//! - 白名单内的动作先追加到 history，再执行
//! - 协作者 panic 被捕获并转为 failure Outcome，不会逃逸到编排循环
//! - 每次调用输出一条 JSON 审计日志（event = action_audit）

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::state::{preview, ActionRecord, AgentState, AgentStatus, Outcome};
use crate::tools::actions::{allowed_names, ActionKind};
use crate::tools::desktop::{HeadlessDesktop, InputDevice, ScreenCapture, WindowManager};
use crate::tools::filesystem::FileStore;
use crate::tools::media::MediaLocator;
use crate::tools::search::{GoogleCseSearch, WebSearch};
use crate::tools::shell::Shell;

/// 执行 shell 命令后附带的进程名数量上限
const MAX_PROCESS_NAMES: usize = 50;
const DEFAULT_SEARCH_RESULTS: usize = 3;
const DEFAULT_TYPE_INTERVAL: f64 = 0.05;

fn str_param(record: &Map<String, Value>, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn f64_param(record: &Map<String, Value>, key: &str) -> Option<f64> {
    match record.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn i64_param(record: &Map<String, Value>, key: &str) -> Option<i64> {
    f64_param(record, key).map(|v| v as i64)
}

fn bool_param(record: &Map<String, Value>, key: &str) -> bool {
    match record.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        _ => false,
    }
}

fn missing(action: ActionKind, param: &str) -> Outcome {
    Outcome::failure(format!("{} action missing '{}' parameter.", action, param))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 动作分派器：持有全部外部协作者
pub struct ActionDispatcher {
    files: Arc<dyn FileStore>,
    shell: Arc<dyn Shell>,
    screen: Arc<dyn ScreenCapture>,
    input: Arc<dyn InputDevice>,
    windows: Arc<dyn WindowManager>,
    search: Arc<dyn WebSearch>,
    media: MediaLocator,
}

impl ActionDispatcher {
    /// 最小配置：文件 + Shell，桌面协作者为 HeadlessDesktop，搜索未配置凭据
    pub fn new(files: Arc<dyn FileStore>, shell: Arc<dyn Shell>) -> Self {
        Self {
            files,
            shell,
            screen: Arc::new(HeadlessDesktop),
            input: Arc::new(HeadlessDesktop),
            windows: Arc::new(HeadlessDesktop),
            search: Arc::new(GoogleCseSearch::new(None, None, 10, 1000)),
            media: MediaLocator::from_home(),
        }
    }

    pub fn with_screen(mut self, screen: Arc<dyn ScreenCapture>) -> Self {
        self.screen = screen;
        self
    }

    pub fn with_input(mut self, input: Arc<dyn InputDevice>) -> Self {
        self.input = input;
        self
    }

    pub fn with_windows(mut self, windows: Arc<dyn WindowManager>) -> Self {
        self.windows = windows;
        self
    }

    pub fn with_search(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.search = search;
        self
    }

    pub fn with_media(mut self, media: MediaLocator) -> Self {
        self.media = media;
        self
    }

    /// 截图协作者（编排循环每步观察时使用）
    pub fn screen(&self) -> &Arc<dyn ScreenCapture> {
        &self.screen
    }

    /// 执行一条动作记录；cancel 被触发时会提前结束 wait
    pub async fn dispatch(
        &self,
        record: &Map<String, Value>,
        state: &mut AgentState,
        cancel: &CancellationToken,
    ) -> Outcome {
        let start = Instant::now();
        let raw_name = record
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let outcome = match raw_name.parse::<ActionKind>() {
            Err(rejected) => {
                tracing::warn!(action = %rejected.0, "Disallowed action requested");
                Outcome::failure(format!(
                    "Action '{}' is not allowed. Allowed actions: {:?}",
                    rejected.0,
                    allowed_names()
                ))
            }
            Ok(kind) => {
                state.history.push(ActionRecord::new(record.clone()));
                let result = AssertUnwindSafe(self.execute(kind, record, state, cancel))
                    .catch_unwind()
                    .await;
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        tracing::error!(action = %kind, error = %msg, "Action panicked");
                        Outcome::failure(format!("Exception during action execution: {}", msg))
                    }
                };
                if let Some(last) = state.history.last_mut() {
                    last.status = Some(outcome.status);
                }
                outcome
            }
        };

        let audit = serde_json::json!({
            "event": "action_audit",
            "action": raw_name,
            "status": outcome.status.as_str(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview(&Value::Object(record.clone()).to_string(), 200),
        });
        tracing::info!(audit = %audit.to_string(), "action");
        outcome
    }

    async fn execute(
        &self,
        kind: ActionKind,
        record: &Map<String, Value>,
        state: &mut AgentState,
        cancel: &CancellationToken,
    ) -> Outcome {
        tracing::info!(action = %kind, "Executing action");
        match kind {
            ActionKind::ReadFile => self.read_file(record, state),
            ActionKind::WriteFile => self.write_file(record),
            ActionKind::ExecuteShellCommand => self.shell_command(record, state).await,
            ActionKind::FocusWindow => self.focus_window(record),
            ActionKind::ListDirectory => self.list_directory(record, state),
            ActionKind::CaptureScreen => self.capture_screen(record, state),
            ActionKind::MoveMouse => {
                let x = i64_param(record, "x").unwrap_or(0);
                let y = i64_param(record, "y").unwrap_or(0);
                match self.input.move_mouse(x, y) {
                    Ok(()) => Outcome::success("Action executed successfully.")
                        .with_detail("coordinates", serde_json::json!([x, y])),
                    Err(e) => Outcome::failure(format!("Mouse move failed: {}", e)),
                }
            }
            ActionKind::Wait => wait(record, cancel).await,
            ActionKind::TaskComplete => {
                state.status = AgentStatus::Completed;
                Outcome::success("Task marked as complete.")
            }
            ActionKind::TypeText => {
                let Some(text) = str_param(record, "text") else {
                    return missing(kind, "text");
                };
                let interval = f64_param(record, "interval").unwrap_or(DEFAULT_TYPE_INTERVAL);
                match self.input.type_text(&text, interval) {
                    Ok(()) => Outcome::success("Action executed successfully.")
                        .with_detail("text_typed_preview", preview(&text, 50))
                        .with_detail("open_windows", self.windows.list_open()),
                    Err(e) => Outcome::failure(format!("Typing failed: {}", e)),
                }
            }
            ActionKind::PressKey => {
                let Some(key) = str_param(record, "key") else {
                    return missing(kind, "key");
                };
                match self.input.press_key(&key) {
                    Ok(()) => Outcome::success("Action executed successfully.").with_detail("key", key),
                    Err(e) => Outcome::failure(format!("Key press failed: {}", e)),
                }
            }
            ActionKind::Hotkey => {
                let Some(keys) = str_param(record, "keys") else {
                    return missing(kind, "keys");
                };
                let parts: Vec<String> = keys
                    .split('+')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect();
                match self.input.hotkey(&parts) {
                    Ok(()) => Outcome::success("Action executed successfully.").with_detail("keys", parts),
                    Err(e) => Outcome::failure(format!("Hotkey failed: {}", e)),
                }
            }
            ActionKind::Click => {
                let position = match (i64_param(record, "x"), i64_param(record, "y")) {
                    (Some(x), Some(y)) if x >= 0 && y >= 0 => Some((x, y)),
                    _ => None,
                };
                let button = str_param(record, "button").unwrap_or_else(|| "left".to_string());
                let coordinates = position.map_or(Value::Null, |(x, y)| serde_json::json!([x, y]));
                match self.input.click(position, &button) {
                    Ok(()) => Outcome::success("Action executed successfully.")
                        .with_detail("coordinates", coordinates)
                        .with_detail("button", button),
                    Err(e) => Outcome::failure(format!("Click failed: {}", e)),
                }
            }
            ActionKind::AskUser => {
                let Some(question) = str_param(record, "question") else {
                    return missing(kind, "question");
                };
                state.pending_user_question = Some(question.clone());
                Outcome::pending(format!("User input requested: {}", question))
            }
            ActionKind::WebSearch => {
                let Some(query) = str_param(record, "query").filter(|q| !q.trim().is_empty()) else {
                    return Outcome::failure(
                        "web_search action missing 'query' parameter or tool not available.",
                    );
                };
                let num_results = i64_param(record, "num_results")
                    .filter(|n| *n > 0)
                    .map_or(DEFAULT_SEARCH_RESULTS, |n| n as usize);
                let result = self.search.query(&query, num_results).await;
                state.last_retrieved_knowledge = Some(result.clone());
                Outcome::success(format!("Web search completed for query: {}", query))
                    .with_detail("query", query)
                    .with_detail("num_results", num_results)
                    .with_detail("result", preview(&result, 500))
            }
        }
    }

    fn read_file(&self, record: &Map<String, Value>, state: &mut AgentState) -> Outcome {
        let Some(file) = str_param(record, "file") else {
            return missing(ActionKind::ReadFile, "file");
        };
        match self.files.read(&file).filter(|c| !c.is_empty()) {
            Some(content) => {
                let content_preview = preview(&content, 200);
                state.last_read_content = Some(content);
                Outcome::success("Action executed successfully.")
                    .with_detail("filename", file)
                    .with_detail("content_preview", content_preview)
            }
            None => Outcome::failure(format!("File read failed or file is empty for {}.", file)),
        }
    }

    fn write_file(&self, record: &Map<String, Value>) -> Outcome {
        let Some(file) = str_param(record, "file") else {
            return missing(ActionKind::WriteFile, "file");
        };
        let content = str_param(record, "content").unwrap_or_default();
        if self.files.write(&file, &content) {
            Outcome::success("Action executed successfully.")
                .with_detail("filename", file)
                .with_detail("content_written_preview", preview(&content, 100))
        } else {
            Outcome::failure(format!("Failed to write to {}.", file))
        }
    }

    fn list_directory(&self, record: &Map<String, Value>, state: &mut AgentState) -> Outcome {
        let path = str_param(record, "path").unwrap_or_else(|| ".".to_string());
        match self.files.list(&path) {
            Some(contents) => {
                state.last_directory_list = Some(contents.clone());
                Outcome::success("Action executed successfully.")
                    .with_detail("path", path)
                    .with_detail("contents", contents)
            }
            None => Outcome::failure("Directory listing failed."),
        }
    }

    fn capture_screen(&self, record: &Map<String, Value>, state: &mut AgentState) -> Outcome {
        let file = str_param(record, "file");
        match self.screen.capture(file.as_deref().map(Path::new)) {
            Some(bytes) => {
                state.last_screenshot_bytes = Some(bytes);
                Outcome::success("Action executed successfully.")
                    .with_detail("filename", file.map_or(Value::Null, Value::String))
            }
            None => Outcome::failure("Screen capture failed."),
        }
    }

    fn focus_window(&self, record: &Map<String, Value>) -> Outcome {
        let Some(title) = str_param(record, "title_substring") else {
            return missing(ActionKind::FocusWindow, "title_substring");
        };
        let focused = self.windows.focus(&title);
        let outcome = if focused {
            Outcome::success(format!("Focused window with title containing '{}'.", title))
        } else {
            Outcome::failure(format!(
                "Could not find or focus window with title containing '{}'.",
                title
            ))
        };
        outcome
            .with_detail("title_substring", title)
            .with_detail("focused", focused)
            .with_detail("open_windows", self.windows.list_open())
    }

    async fn shell_command(&self, record: &Map<String, Value>, state: &AgentState) -> Outcome {
        let Some(mut command) = str_param(record, "command").filter(|c| !c.trim().is_empty()) else {
            return missing(ActionKind::ExecuteShellCommand, "command");
        };
        let background = bool_param(record, "background");
        let cwd = str_param(record, "cwd");

        let mut matched_file = None;
        if let Some(m) = self.media.rewrite(&state.current_task, cwd.as_deref()) {
            tracing::info!(original = %command, rewritten = %m.command, "Rewrote media command");
            command = m.command;
            matched_file = Some(m.matched_file.display().to_string());
        }

        let out = self.shell.execute(&command, background).await;
        let processes: Vec<String> = self
            .windows
            .list_processes()
            .into_iter()
            .take(MAX_PROCESS_NAMES)
            .collect();
        let mut outcome = if out.code == 0 {
            if background {
                Outcome::success(format!("Command '{}' started in background.", command))
            } else {
                Outcome::success(format!("Command '{}' executed successfully.", command))
            }
        } else {
            Outcome::failure(format!("Command '{}' failed (Exit Code: {}).", command, out.code))
        };
        outcome = outcome
            .with_detail("command", command)
            .with_detail("background", background)
            .with_detail("return_code", out.code)
            .with_detail("stdout", out.stdout.trim())
            .with_detail("stderr", out.stderr.trim())
            .with_detail("open_windows", self.windows.list_open())
            .with_detail("processes", processes);
        if let Some(file) = matched_file {
            outcome = outcome.with_detail("matched_file", file);
        }
        outcome
    }
}

async fn wait(record: &Map<String, Value>, cancel: &CancellationToken) -> Outcome {
    let secs = f64_param(record, "duration")
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(1.0);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => {
            Outcome::success(format!("Waited for {} seconds.", secs)).with_detail("duration", secs)
        }
        _ = cancel.cancelled() => {
            tracing::info!(duration = secs, "Wait interrupted by cancellation");
            Outcome::failure("Wait interrupted by cancellation.").with_detail("duration", secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::state::OutcomeStatus;
    use crate::tools::shell::ShellOutput;

    #[derive(Default)]
    struct SpyFiles {
        calls: AtomicUsize,
        writes: Mutex<Vec<(String, String)>>,
    }

    impl FileStore for SpyFiles {
        fn read(&self, path: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (path == "notes.txt").then(|| "hello notes".to_string())
        }
        fn write(&self, path: &str, content: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut w) = self.writes.lock() {
                w.push((path.to_string(), content.to_string()));
            }
            true
        }
        fn list(&self, _path: &str) -> Option<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(vec!["a.txt".to_string(), "src/".to_string()])
        }
    }

    #[derive(Default)]
    struct SpyShell {
        calls: AtomicUsize,
        code: i32,
    }

    #[async_trait]
    impl Shell for SpyShell {
        async fn execute(&self, command: &str, background: bool) -> ShellOutput {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ShellOutput {
                code: self.code,
                stdout: format!(" ran {} bg={} \n", command, background),
                stderr: String::new(),
            }
        }
    }

    struct PanickingSearch;

    #[async_trait]
    impl WebSearch for PanickingSearch {
        async fn query(&self, _text: &str, _num_results: usize) -> String {
            panic!("search backend exploded");
        }
    }

    fn record(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn dispatcher(files: Arc<SpyFiles>, shell: Arc<SpyShell>) -> ActionDispatcher {
        ActionDispatcher::new(files, shell).with_media(MediaLocator::default())
    }

    #[tokio::test]
    async fn test_disallowed_action_touches_nothing() {
        let files = Arc::new(SpyFiles::default());
        let shell = Arc::new(SpyShell::default());
        let d = dispatcher(files.clone(), shell.clone());
        let mut state = AgentState::default();
        let token = CancellationToken::new();

        for name in ["delete_everything", "decompose_subtask", ""] {
            let out = d
                .dispatch(&record(json!({"action": name, "file": "x", "command": "ls"})), &mut state, &token)
                .await;
            assert_eq!(out.status, OutcomeStatus::Failure);
            assert!(out.message.contains("is not allowed"));
            assert!(out.details.is_empty());
        }
        assert_eq!(files.calls.load(Ordering::SeqCst), 0);
        assert_eq!(shell.calls.load(Ordering::SeqCst), 0);
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn test_file_actions_cache_observations() {
        let files = Arc::new(SpyFiles::default());
        let d = dispatcher(files.clone(), Arc::new(SpyShell::default()));
        let mut state = AgentState::default();
        let token = CancellationToken::new();

        let read = d
            .dispatch(&record(json!({"action": "READ_FILE", "file": "notes.txt"})), &mut state, &token)
            .await;
        assert!(read.is_success());
        assert_eq!(state.last_read_content.as_deref(), Some("hello notes"));

        let missing = d
            .dispatch(&record(json!({"action": "read_file", "file": "nope.txt"})), &mut state, &token)
            .await;
        assert_eq!(missing.message, "File read failed or file is empty for nope.txt.");

        let listed = d
            .dispatch(&record(json!({"action": "list_directory"})), &mut state, &token)
            .await;
        assert_eq!(listed.details["path"], ".");
        assert_eq!(state.last_directory_list.as_ref().map(Vec::len), Some(2));

        let wrote = d
            .dispatch(
                &record(json!({"action": "write_file", "file": "a.txt", "content": "x"})),
                &mut state,
                &token,
            )
            .await;
        assert!(wrote.is_success());
        assert_eq!(files.writes.lock().unwrap().as_slice(), &[("a.txt".to_string(), "x".to_string())]);

        assert_eq!(state.history.len(), 4);
        assert_eq!(state.history[1].status, Some(OutcomeStatus::Failure));
    }

    #[tokio::test]
    async fn test_shell_outcome_reports_exit_code() {
        let shell = Arc::new(SpyShell {
            code: 2,
            ..Default::default()
        });
        let d = dispatcher(Arc::new(SpyFiles::default()), shell);
        let mut state = AgentState::default();
        let token = CancellationToken::new();

        let out = d
            .dispatch(&record(json!({"action": "execute_shell_command", "command": "false"})), &mut state, &token)
            .await;
        assert_eq!(out.message, "Command 'false' failed (Exit Code: 2).");
        assert_eq!(out.details["return_code"], 2);
        assert_eq!(out.details["stdout"], "ran false bg=false");

        let no_cmd = d
            .dispatch(&record(json!({"action": "execute_shell_command"})), &mut state, &token)
            .await;
        assert_eq!(no_cmd.message, "execute_shell_command action missing 'command' parameter.");
    }

    #[tokio::test]
    async fn test_background_command_reports_started() {
        let d = dispatcher(Arc::new(SpyFiles::default()), Arc::new(SpyShell::default()));
        let mut state = AgentState::default();
        let out = d
            .dispatch(
                &record(json!({"action": "execute_shell_command", "command": "gedit", "background": true})),
                &mut state,
                &CancellationToken::new(),
            )
            .await;
        assert!(out.is_success());
        assert_eq!(out.message, "Command 'gedit' started in background.");
        assert_eq!(out.details["background"], true);
    }

    #[tokio::test]
    async fn test_task_complete_and_ask_user() {
        let d = dispatcher(Arc::new(SpyFiles::default()), Arc::new(SpyShell::default()));
        let mut state = AgentState::default();
        let token = CancellationToken::new();

        let asked = d
            .dispatch(&record(json!({"action": "ask_user", "question": "Which file?"})), &mut state, &token)
            .await;
        assert_eq!(asked.status, OutcomeStatus::PendingUserInput);
        assert_eq!(state.pending_user_question.as_deref(), Some("Which file?"));

        let done = d
            .dispatch(&record(json!({"action": "task_complete"})), &mut state, &token)
            .await;
        assert_eq!(done.message, "Task marked as complete.");
        assert_eq!(state.status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_parses_duration_and_honors_cancel() {
        let d = dispatcher(Arc::new(SpyFiles::default()), Arc::new(SpyShell::default()));
        let mut state = AgentState::default();

        let token = CancellationToken::new();
        let out = d
            .dispatch(&record(json!({"action": "wait", "duration": "0.01"})), &mut state, &token)
            .await;
        assert_eq!(out.message, "Waited for 0.01 seconds.");

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let start = Instant::now();
        let out = d
            .dispatch(&record(json!({"action": "wait", "duration": 30})), &mut state, &cancelled)
            .await;
        assert_eq!(out.status, OutcomeStatus::Failure);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_headless_input_fails_and_panics_are_contained() {
        let d = dispatcher(Arc::new(SpyFiles::default()), Arc::new(SpyShell::default()))
            .with_search(Arc::new(PanickingSearch));
        let mut state = AgentState::default();
        let token = CancellationToken::new();

        let click = d
            .dispatch(&record(json!({"action": "click", "x": 10, "y": 20})), &mut state, &token)
            .await;
        assert_eq!(click.status, OutcomeStatus::Failure);

        let search = d
            .dispatch(&record(json!({"action": "web_search", "query": "rust"})), &mut state, &token)
            .await;
        assert_eq!(search.status, OutcomeStatus::Failure);
        assert!(search.message.starts_with("Exception during action execution:"));
        assert!(search.message.contains("search backend exploded"));
    }
}
