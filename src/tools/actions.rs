//! 允许执行的动作集合（封闭枚举）
//!
//! 动作名经 FromStr 解析为 ActionKind，解析失败即不在白名单内；dispatcher 对 ActionKind 做穷尽匹配，
//! 新增动作必须同时补上分派分支，否则编译不过。

use std::fmt;
use std::str::FromStr;

/// 动作种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    ReadFile,
    WriteFile,
    ExecuteShellCommand,
    FocusWindow,
    ListDirectory,
    CaptureScreen,
    MoveMouse,
    Wait,
    TaskComplete,
    TypeText,
    PressKey,
    Hotkey,
    Click,
    AskUser,
    WebSearch,
}

impl ActionKind {
    pub const ALL: [ActionKind; 15] = [
        ActionKind::ReadFile,
        ActionKind::WriteFile,
        ActionKind::ExecuteShellCommand,
        ActionKind::FocusWindow,
        ActionKind::ListDirectory,
        ActionKind::CaptureScreen,
        ActionKind::MoveMouse,
        ActionKind::Wait,
        ActionKind::TaskComplete,
        ActionKind::TypeText,
        ActionKind::PressKey,
        ActionKind::Hotkey,
        ActionKind::Click,
        ActionKind::AskUser,
        ActionKind::WebSearch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::ExecuteShellCommand => "execute_shell_command",
            Self::FocusWindow => "focus_window",
            Self::ListDirectory => "list_directory",
            Self::CaptureScreen => "capture_screen",
            Self::MoveMouse => "move_mouse",
            Self::Wait => "wait",
            Self::TaskComplete => "task_complete",
            Self::TypeText => "type_text",
            Self::PressKey => "press_key",
            Self::Hotkey => "hotkey",
            Self::Click => "click",
            Self::AskUser => "ask_user",
            Self::WebSearch => "web_search",
        }
    }

    /// 给 LLM 的用法说明（签名 + 示例）
    pub fn usage(self) -> &'static str {
        match self {
            Self::ReadFile => {
                "read_file(file: str): read a text file.\n  Example: {\"action\": \"read_file\", \"file\": \"README.md\"}"
            }
            Self::WriteFile => {
                "write_file(file: str, content: str): write content to a file.\n  Example: {\"action\": \"write_file\", \"file\": \"out.txt\", \"content\": \"Hello!\"}"
            }
            Self::ExecuteShellCommand => {
                "execute_shell_command(command: str, background: bool = false): run a shell command; set background=true to launch GUI apps.\n  Example: {\"action\": \"execute_shell_command\", \"command\": \"ls -la\"}"
            }
            Self::FocusWindow => {
                "focus_window(title_substring: str): bring a window whose title contains the text to the front.\n  Example: {\"action\": \"focus_window\", \"title_substring\": \"Notepad\"}"
            }
            Self::ListDirectory => {
                "list_directory(path: str = \".\"): list a directory.\n  Example: {\"action\": \"list_directory\", \"path\": \".\"}"
            }
            Self::CaptureScreen => {
                "capture_screen(file: str): capture the screen for visual context.\n  Example: {\"action\": \"capture_screen\", \"file\": \"screen.png\"}"
            }
            Self::MoveMouse => {
                "move_mouse(x: int, y: int): move the pointer to absolute coordinates.\n  Example: {\"action\": \"move_mouse\", \"x\": 100, \"y\": 200}"
            }
            Self::Wait => {
                "wait(duration: number): pause for the given number of seconds.\n  Example: {\"action\": \"wait\", \"duration\": 3}"
            }
            Self::TaskComplete => {
                "task_complete: the overall task is finished.\n  Example: {\"action\": \"task_complete\"}"
            }
            Self::TypeText => {
                "type_text(text: str, interval: float = 0.05): type text into the focused window.\n  Example: {\"action\": \"type_text\", \"text\": \"Hello world!\"}"
            }
            Self::PressKey => {
                "press_key(key: str): press one key.\n  Example: {\"action\": \"press_key\", \"key\": \"enter\"}"
            }
            Self::Hotkey => {
                "hotkey(keys: str): press a key combination joined by '+'.\n  Example: {\"action\": \"hotkey\", \"keys\": \"ctrl+c\"}"
            }
            Self::Click => {
                "click(x: int = -1, y: int = -1, button: str = \"left\"): click at a position, or where the pointer is.\n  Example: {\"action\": \"click\", \"x\": 100, \"y\": 200, \"button\": \"left\"}"
            }
            Self::AskUser => {
                "ask_user(question: str): ask the user; the answer arrives later as feedback.\n  Example: {\"action\": \"ask_user\", \"question\": \"Which file?\"}"
            }
            Self::WebSearch => {
                "web_search(query: str, num_results: int = 3): search the web and summarize the top result.\n  Example: {\"action\": \"web_search\", \"query\": \"rust tokio tutorial\"}"
            }
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 动作名不在白名单内
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisallowedAction(pub String);

impl FromStr for ActionKind {
    type Err = DisallowedAction;

    /// 大小写与首尾空白不敏感
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        ActionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == name)
            .ok_or(DisallowedAction(name))
    }
}

/// 白名单（排序后），用于错误信息
pub fn allowed_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = ActionKind::ALL.iter().map(|k| k.as_str()).collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_every_name() {
        for kind in ActionKind::ALL {
            assert_eq!(kind.as_str().parse::<ActionKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_parse_normalizes_case_and_whitespace() {
        assert_eq!(" Read_File ".parse::<ActionKind>(), Ok(ActionKind::ReadFile));
    }

    #[test]
    fn test_unlisted_actions_are_rejected() {
        assert_eq!(
            "rm_rf".parse::<ActionKind>(),
            Err(DisallowedAction("rm_rf".to_string()))
        );
        assert!("decompose_subtask".parse::<ActionKind>().is_err());
        assert!("".parse::<ActionKind>().is_err());
        assert_eq!(allowed_names().len(), 15);
    }
}
