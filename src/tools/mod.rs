//! 工具层：动作白名单、分派器与外部协作者（文件、Shell、桌面、搜索、媒体）

pub mod actions;
pub mod desktop;
pub mod dispatcher;
pub mod filesystem;
pub mod media;
#[cfg(feature = "desktop")]
pub mod native_desktop;
pub mod search;
pub mod shell;

pub use actions::{allowed_names, ActionKind, DisallowedAction};
pub use desktop::{
    running_process_names, HeadlessDesktop, InputDevice, ScreenCapture, WindowManager,
};
pub use dispatcher::ActionDispatcher;
pub use filesystem::{FileStore, LocalFileStore, SafeFs};
pub use media::{MediaLocator, MediaMatch};
#[cfg(feature = "desktop")]
pub use native_desktop::NativeDesktop;
pub use search::{GoogleCseSearch, WebSearch};
pub use shell::{Shell, ShellOutput, SystemShell};
