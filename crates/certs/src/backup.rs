//! 证书与密钥文件的 `.backup` 副本

use std::fs;
use std::path::{Path, PathBuf};

use edgefleet_core::fs::{file_mode, write_with_mode, MODE_400};
use tracing::{info, warn};

use crate::error::{CertError, CertResult};

pub const BACKUP_SUFFIX: &str = ".backup";

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// 将文件复制为同目录下的 `<path>.backup`，副本权限为 0400
pub fn backup_file(path: &Path) -> CertResult<()> {
    let data = fs::read(path)?;
    write_with_mode(&backup_path(path), &data, MODE_400)?;
    Ok(())
}

pub fn backup_files(paths: &[&Path]) -> CertResult<()> {
    paths.iter().try_for_each(|path| backup_file(path))
}

/// 用备份覆盖原文件，原文件存在时保留其权限，否则使用 0400
pub fn restore_file(path: &Path) -> CertResult<()> {
    let backup = backup_path(path);
    let data = fs::read(&backup).map_err(|e| {
        CertError::Backup(format!("读取备份文件 {} 失败: {e}", backup.display()))
    })?;
    let mode = file_mode(path).unwrap_or(MODE_400);
    write_with_mode(path, &data, mode)?;
    info!("已从备份恢复文件: {}", path.display());
    Ok(())
}

/// 加载成功时刷新备份；失败时从备份恢复文件并重试一次
///
/// 缺少备份的文件保持原样，一个文件都没能恢复时直接返回首次加载的错误。
pub fn load_with_backup<T, F>(paths: &[&Path], load: F) -> CertResult<T>
where
    F: Fn() -> CertResult<T>,
{
    match load() {
        Ok(value) => {
            for path in paths {
                if let Err(e) = backup_file(path) {
                    warn!("备份文件 {} 失败: {}", path.display(), e);
                }
            }
            Ok(value)
        }
        Err(load_err) => {
            warn!("加载失败: {}，尝试从备份恢复", load_err);
            let mut restored = 0;
            for path in paths {
                match restore_file(path) {
                    Ok(()) => restored += 1,
                    Err(e) => warn!("恢复文件 {} 失败: {}", path.display(), e),
                }
            }
            if restored == 0 {
                return Err(load_err);
            }
            load()
        }
    }
}
