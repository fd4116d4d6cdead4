//! 媒体播放启发式
//!
//! 当任务提到 play / video 时，用任务里的关键词在视频目录下递归查找视频文件，
//! 命中则把 shell 命令改写为用系统默认程序打开该文件。

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use walkdir::WalkDir;

pub const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".avi", ".mov", ".mkv", ".wmv", ".flv"];
/// 过短的关键词（a、to 等）几乎匹配所有文件名，不参与查找
const MIN_KEYWORD_CHARS: usize = 3;

fn keyword_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\w-]+").ok()).as_ref()
}

/// 改写结果：新命令 + 命中的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMatch {
    pub command: String,
    pub matched_file: PathBuf,
}

/// 视频文件定位器
#[derive(Debug, Clone, Default)]
pub struct MediaLocator {
    videos_dir: Option<PathBuf>,
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), home_dir()) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches(['/', '\\'])),
        _ => PathBuf::from(path),
    }
}

/// 平台默认打开方式
pub fn open_command(path: &Path) -> String {
    let p = path.display();
    if cfg!(target_os = "windows") {
        format!("start \"\" \"{}\"", p)
    } else if cfg!(target_os = "macos") {
        format!("open \"{}\"", p)
    } else {
        format!("xdg-open \"{}\"", p)
    }
}

impl MediaLocator {
    /// 固定视频目录（测试或配置使用）
    pub fn new(videos_dir: impl Into<PathBuf>) -> Self {
        Self {
            videos_dir: Some(videos_dir.into()),
        }
    }

    /// 使用用户主目录下的 Videos（存在时）
    pub fn from_home() -> Self {
        Self {
            videos_dir: home_dir().map(|h| h.join("Videos")).filter(|p| p.is_dir()),
        }
    }

    /// 任务是否与媒体播放有关
    pub fn applies_to(task: &str) -> bool {
        let lower = task.to_lowercase();
        lower.contains("play") || lower.contains("video")
    }

    fn search_dir(&self, cwd: Option<&str>) -> Option<PathBuf> {
        if let Some(ref dir) = self.videos_dir {
            return Some(dir.clone());
        }
        cwd.map(expand_tilde).or_else(home_dir)
    }

    /// 递归查找文件名包含关键词（忽略大小写）的视频文件，按路径排序
    pub fn find_videos(dir: &Path, keyword: &str) -> Vec<PathBuf> {
        let keyword = keyword.to_lowercase();
        let mut found: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_lowercase();
                name.contains(&keyword) && VIDEO_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
            })
            .map(|e| e.into_path())
            .collect();
        found.sort();
        found
    }

    /// 按任务关键词顺序查找，第一个有命中的关键词决定结果
    pub fn rewrite(&self, task: &str, cwd: Option<&str>) -> Option<MediaMatch> {
        if !Self::applies_to(task) {
            return None;
        }
        let dir = self.search_dir(cwd)?;
        let re = keyword_re()?;
        for keyword in re.find_iter(task).map(|m| m.as_str()) {
            if keyword.chars().count() < MIN_KEYWORD_CHARS {
                continue;
            }
            if let Some(first) = Self::find_videos(&dir, keyword).into_iter().next() {
                tracing::info!(keyword = %keyword, file = %first.display(), "Matched video file for task");
                return Some(MediaMatch {
                    command: open_command(&first),
                    matched_file: first,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrites_when_keyword_matches_video() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("trips")).unwrap();
        std::fs::write(dir.path().join("trips/Holiday-2023.MP4"), b"").unwrap();
        std::fs::write(dir.path().join("holiday.txt"), b"").unwrap();

        let locator = MediaLocator::new(dir.path());
        let m = locator.rewrite("play my holiday video", None).unwrap();
        assert!(m.matched_file.ends_with("trips/Holiday-2023.MP4"));
        assert!(m.command.contains("Holiday-2023.MP4"));
    }

    #[test]
    fn test_no_rewrite_for_unrelated_task() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.mp4"), b"").unwrap();
        let locator = MediaLocator::new(dir.path());
        assert!(locator.rewrite("write notes to a file", None).is_none());
        assert!(locator.rewrite("play something else", None).is_none());
    }
}
