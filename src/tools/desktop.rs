//! 桌面协作者：截图、鼠标键盘输入、窗口管理
//!
//! 具体的桌面自动化由宿主环境提供；本 crate 自带 HeadlessDesktop（无显示环境）：
//! 截图返回 None，输入操作返回错误，窗口列表为空；进程列表总是可用。

use std::path::Path;

use sysinfo::{ProcessRefreshKind, RefreshKind, System};

/// 截图协作者
pub trait ScreenCapture: Send + Sync {
    /// 截取整个屏幕，返回 PNG 字节；path 给定时同时写入该文件
    fn capture(&self, path: Option<&Path>) -> Option<Vec<u8>>;
}

/// 鼠标 / 键盘协作者
pub trait InputDevice: Send + Sync {
    fn move_mouse(&self, x: i64, y: i64) -> Result<(), String>;
    /// position 为 None 时在当前位置点击
    fn click(&self, position: Option<(i64, i64)>, button: &str) -> Result<(), String>;
    fn type_text(&self, text: &str, interval_secs: f64) -> Result<(), String>;
    fn press_key(&self, key: &str) -> Result<(), String>;
    fn hotkey(&self, keys: &[String]) -> Result<(), String>;
}

/// 窗口管理协作者
pub trait WindowManager: Send + Sync {
    /// 聚焦标题包含该子串的窗口
    fn focus(&self, title_substring: &str) -> bool;
    fn list_open(&self) -> Vec<String>;
    fn list_processes(&self) -> Vec<String>;
}

const HEADLESS: &str = "not available in headless mode";

/// 无显示环境下的桌面实现
#[derive(Debug, Default, Clone)]
pub struct HeadlessDesktop;

impl ScreenCapture for HeadlessDesktop {
    fn capture(&self, _path: Option<&Path>) -> Option<Vec<u8>> {
        tracing::debug!("screen capture {}", HEADLESS);
        None
    }
}

impl InputDevice for HeadlessDesktop {
    fn move_mouse(&self, _x: i64, _y: i64) -> Result<(), String> {
        Err(format!("move_mouse {}", HEADLESS))
    }

    fn click(&self, _position: Option<(i64, i64)>, _button: &str) -> Result<(), String> {
        Err(format!("click {}", HEADLESS))
    }

    fn type_text(&self, _text: &str, _interval_secs: f64) -> Result<(), String> {
        Err(format!("type_text {}", HEADLESS))
    }

    fn press_key(&self, _key: &str) -> Result<(), String> {
        Err(format!("press_key {}", HEADLESS))
    }

    fn hotkey(&self, _keys: &[String]) -> Result<(), String> {
        Err(format!("hotkey {}", HEADLESS))
    }
}

impl WindowManager for HeadlessDesktop {
    fn focus(&self, title_substring: &str) -> bool {
        tracing::warn!(title = %title_substring, "Window focusing {}", HEADLESS);
        false
    }

    fn list_open(&self) -> Vec<String> {
        Vec::new()
    }

    fn list_processes(&self) -> Vec<String> {
        running_process_names()
    }
}

/// 当前运行的进程名（去重排序），跨平台经 sysinfo 读取
pub fn running_process_names() -> Vec<String> {
    let sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    let mut names: Vec<String> = sys
        .processes()
        .values()
        .map(|p| p.name().trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_reports_unavailable() {
        let desktop = HeadlessDesktop;
        assert!(desktop.capture(None).is_none());
        assert!(desktop.move_mouse(1, 2).unwrap_err().contains("headless"));
        assert!(!desktop.focus("Notepad"));
        assert!(desktop.list_open().is_empty());
    }

    #[test]
    fn test_process_list_is_sorted_and_unique() {
        let names = HeadlessDesktop.list_processes();
        assert!(!names.is_empty());
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names, sorted);
    }
}
