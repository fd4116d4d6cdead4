//! 本机桌面：xcap 截图与窗口列表，enigo 模拟鼠标键盘
//!
//! 需要 `desktop` feature 与可用的图形会话。Enigo 每次操作新建，不跨线程持有。

use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use image::{ImageFormat, RgbaImage};
use xcap::{Monitor, Window};

use crate::tools::desktop::{running_process_names, InputDevice, ScreenCapture, WindowManager};

#[derive(Debug, Default, Clone)]
pub struct NativeDesktop;

impl NativeDesktop {
    pub fn new() -> Self {
        Self
    }

    fn enigo() -> Result<Enigo, String> {
        Enigo::new(&Settings::default()).map_err(|e| format!("input device unavailable: {:?}", e))
    }
}

fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| e.to_string())?;
    Ok(buf)
}

fn coord(v: i64) -> Result<i32, String> {
    i32::try_from(v).map_err(|_| format!("coordinate {} out of range", v))
}

fn map_button(button: &str) -> Result<Button, String> {
    match button.to_lowercase().as_str() {
        "left" | "" => Ok(Button::Left),
        "right" => Ok(Button::Right),
        "middle" => Ok(Button::Middle),
        other => Err(format!("Unsupported mouse button: {}", other)),
    }
}

fn map_key(key: &str) -> Result<Key, String> {
    let lower = key.to_lowercase();
    let mapped = match lower.as_str() {
        "enter" | "return" => Key::Return,
        "tab" => Key::Tab,
        "escape" | "esc" => Key::Escape,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "space" => Key::Space,
        "ctrl" | "control" => Key::Control,
        "shift" => Key::Shift,
        "alt" | "option" => Key::Alt,
        "win" | "meta" | "command" | "cmd" | "super" => Key::Meta,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" => Key::PageUp,
        "pagedown" => Key::PageDown,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        _ => {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Key::Unicode(c),
                _ => return Err(format!("Unsupported key: {}", key)),
            }
        }
    };
    Ok(mapped)
}

impl ScreenCapture for NativeDesktop {
    fn capture(&self, path: Option<&Path>) -> Option<Vec<u8>> {
        let monitors = match Monitor::all() {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "Failed to enumerate monitors");
                return None;
            }
        };
        let monitor = monitors
            .iter()
            .find(|m| m.is_primary())
            .or_else(|| monitors.first())?;
        let captured = monitor
            .capture_image()
            .map_err(|e| e.to_string())
            .and_then(|img| encode_png(&img));
        let bytes = match captured {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "Screen capture failed");
                return None;
            }
        };
        if let Some(path) = path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(path, &bytes) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to save screenshot");
            }
        }
        Some(bytes)
    }
}

impl InputDevice for NativeDesktop {
    fn move_mouse(&self, x: i64, y: i64) -> Result<(), String> {
        Self::enigo()?
            .move_mouse(coord(x)?, coord(y)?, Coordinate::Abs)
            .map_err(|e| format!("move_mouse failed: {:?}", e))
    }

    fn click(&self, position: Option<(i64, i64)>, button: &str) -> Result<(), String> {
        let button = map_button(button)?;
        let mut enigo = Self::enigo()?;
        if let Some((x, y)) = position {
            enigo
                .move_mouse(coord(x)?, coord(y)?, Coordinate::Abs)
                .map_err(|e| format!("move_mouse failed: {:?}", e))?;
        }
        enigo
            .button(button, Direction::Click)
            .map_err(|e| format!("click failed: {:?}", e))
    }

    fn type_text(&self, text: &str, interval_secs: f64) -> Result<(), String> {
        let mut enigo = Self::enigo()?;
        if interval_secs <= 0.0 {
            return enigo.text(text).map_err(|e| format!("type_text failed: {:?}", e));
        }
        let interval = Duration::from_secs_f64(interval_secs);
        for c in text.chars() {
            enigo
                .key(Key::Unicode(c), Direction::Click)
                .map_err(|e| format!("type_text failed: {:?}", e))?;
            std::thread::sleep(interval);
        }
        Ok(())
    }

    fn press_key(&self, key: &str) -> Result<(), String> {
        let key = map_key(key)?;
        Self::enigo()?
            .key(key, Direction::Click)
            .map_err(|e| format!("press_key failed: {:?}", e))
    }

    fn hotkey(&self, keys: &[String]) -> Result<(), String> {
        let mapped = keys
            .iter()
            .map(|k| map_key(k))
            .collect::<Result<Vec<_>, _>>()?;
        let mut enigo = Self::enigo()?;
        for key in &mapped {
            enigo
                .key(*key, Direction::Press)
                .map_err(|e| format!("hotkey failed: {:?}", e))?;
        }
        for key in mapped.iter().rev() {
            enigo
                .key(*key, Direction::Release)
                .map_err(|e| format!("hotkey failed: {:?}", e))?;
        }
        Ok(())
    }
}

impl WindowManager for NativeDesktop {
    fn focus(&self, title_substring: &str) -> bool {
        let needle = title_substring.to_lowercase();
        let Some(title) = self
            .list_open()
            .into_iter()
            .find(|t| t.to_lowercase().contains(&needle))
        else {
            tracing::warn!(title = %title_substring, "No open window matches");
            return false;
        };
        activate_window(&title)
    }

    fn list_open(&self) -> Vec<String> {
        match Window::all() {
            Ok(windows) => windows
                .iter()
                .filter(|w| !w.is_minimized())
                .map(|w| w.title().trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list windows");
                Vec::new()
            }
        }
    }

    fn list_processes(&self) -> Vec<String> {
        running_process_names()
    }
}

/// 交给平台工具把窗口提到前台
fn activate_window(title: &str) -> bool {
    let mut cmd = if cfg!(target_os = "windows") {
        let script = format!(
            "if ((New-Object -ComObject WScript.Shell).AppActivate('{}')) {{ exit 0 }} else {{ exit 1 }}",
            title.replace('\'', "''")
        );
        let mut c = std::process::Command::new("powershell");
        c.arg("-NoProfile").arg("-Command").arg(script);
        c
    } else if cfg!(target_os = "macos") {
        let script = format!(
            "tell application \"System Events\" to set frontmost of (first process whose name of windows contains \"{}\") to true",
            title.replace('"', "\\\"")
        );
        let mut c = std::process::Command::new("osascript");
        c.arg("-e").arg(script);
        c
    } else {
        let mut c = std::process::Command::new("wmctrl");
        c.arg("-a").arg(title);
        c
    };
    match cmd.output() {
        Ok(out) if out.status.success() => {
            tracing::info!(title = %title, "Window focused");
            true
        }
        Ok(out) => {
            tracing::warn!(
                title = %title,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "Window focus failed"
            );
            false
        }
        Err(e) => {
            tracing::warn!(title = %title, error = %e, "Window focus tool unavailable");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::traits::image_mime;

    #[test]
    fn test_key_names_map_to_enigo_keys() {
        assert_eq!(map_key("Enter").unwrap(), Key::Return);
        assert_eq!(map_key("ctrl").unwrap(), Key::Control);
        assert_eq!(map_key("win").unwrap(), Key::Meta);
        assert_eq!(map_key("f5").unwrap(), Key::F5);
        assert_eq!(map_key("a").unwrap(), Key::Unicode('a'));
        assert!(map_key("hyper").is_err());
        assert!(map_key("").is_err());
    }

    #[test]
    fn test_buttons_and_coordinates() {
        assert_eq!(map_button("Right").unwrap(), Button::Right);
        assert!(map_button("fourth").is_err());
        assert_eq!(coord(-5).unwrap(), -5);
        assert!(coord(i64::MAX).is_err());
    }

    #[test]
    fn test_captured_image_is_encoded_as_png() {
        let img = RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]));
        let bytes = encode_png(&img).unwrap();
        assert_eq!(image_mime(&bytes), Some("image/png"));
    }
}
