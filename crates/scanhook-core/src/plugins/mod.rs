//! 内置插件
//!
//! - `shadow`：检查 `/etc/shadow` 中的 MD5 密码哈希；
//! - `zip`：展开 ZIP 成员并递归扫描；
//! - `autoruns`：记录注册表 Run 键中的自启动项；
//! - `sample_export`：把可执行文件样本导出到本地目录。
use std::path::PathBuf;

use crate::pipeline::Plugin;

mod autoruns;
mod sample_export;
mod shadow;
mod zipfile;

pub use autoruns::AutorunsPlugin;
pub use sample_export::SampleExportPlugin;
pub use shadow::ShadowPlugin;
pub use zipfile::ZipPlugin;

/// 默认插件集；给出导出目录时附带样本导出
pub fn builtin_plugins(export_dir: Option<PathBuf>) -> Vec<Box<dyn Plugin>> {
    let mut plugins: Vec<Box<dyn Plugin>> = vec![Box::new(ShadowPlugin), Box::new(ZipPlugin), Box::new(AutorunsPlugin)];
    if let Some(dir) = export_dir {
        plugins.push(Box::new(SampleExportPlugin::new(dir)));
    }
    plugins
}
