use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// 共享目录权限
pub const MODE_DIR_SHARED: u32 = 0o750;
/// 私密材料目录权限
pub const MODE_DIR_SECRET: u32 = 0o700;
pub const MODE_600: u32 = 0o600;
pub const MODE_400: u32 = 0o400;

/// 确保目录存在，新建目录使用指定权限
pub fn make_sure_dir(dir: &Path, mode: u32) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(mode).create(dir)
}

/// 确保文件所在目录存在
pub fn make_sure_parent(path: &Path, mode: u32) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => make_sure_dir(parent, mode),
        None => Ok(()),
    }
}

pub fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// 覆盖写入文件并设置权限。只读的已有文件会先放开写权限
pub fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    if path.exists() {
        set_mode(path, MODE_600)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(MODE_600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    set_mode(path, mode)
}

pub fn file_mode(path: &Path) -> std::io::Result<u32> {
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}
