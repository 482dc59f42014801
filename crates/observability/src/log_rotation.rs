//! 滚动日志文件
//!
//! 日志文件写满容量上限后备份为 `<名称>-<时间戳><扩展名>[.gz]` 并新建日志文件，
//! 后台线程按保留天数与保留个数清理旧备份。

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Write};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use edgefleet_core::config::LogFileConfig;
use edgefleet_core::fs::{make_sure_dir, set_mode, MODE_400, MODE_600, MODE_DIR_SHARED};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, error, warn};

const MEGABYTE: u64 = 1024 * 1024;
pub const DEFAULT_CAPACITY_MB: u64 = 20;
/// 容量配置需小于该值（MB）
pub const MAX_CAPACITY_MB: u64 = 400;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";
const GZIP_EXT: &str = ".gz";
const ONE_DAY_SECONDS: i64 = 86_400;
const MIN_SAVE_VOLUME: u32 = 1;
const MAX_SAVE_VOLUME: u32 = 30;
const MIN_SAVE_TIME_DAYS: u32 = 7;
const MAX_SAVE_TIME_DAYS: u32 = 700;

/// 滚动日志配置
#[derive(Debug, Clone, PartialEq)]
pub struct RollingFileConfig {
    pub file_name: PathBuf,
    /// 为空时备份与日志文件位于同一目录
    pub backup_dir: Option<PathBuf>,
    pub capacity_mb: u64,
    pub save_time_days: u32,
    pub save_volume: u32,
    pub local_time: bool,
    pub compress: bool,
    pub disable_on_user_switch: bool,
}

impl RollingFileConfig {
    pub fn new(file_name: impl Into<PathBuf>) -> Self {
        Self {
            file_name: file_name.into(),
            backup_dir: None,
            capacity_mb: DEFAULT_CAPACITY_MB,
            save_time_days: MIN_SAVE_TIME_DAYS,
            save_volume: MAX_SAVE_VOLUME,
            local_time: false,
            compress: false,
            disable_on_user_switch: false,
        }
    }

    /// 单个日志文件的字节上限，容量不在 (0, 400) MB 内时取默认值
    pub fn max_size(&self) -> u64 {
        if self.capacity_mb > 0 && self.capacity_mb < MAX_CAPACITY_MB {
            self.capacity_mb * MEGABYTE
        } else {
            DEFAULT_CAPACITY_MB * MEGABYTE
        }
    }

    /// 未配置文件名时写入临时目录
    pub fn file_path(&self) -> PathBuf {
        if !self.file_name.as_os_str().is_empty() {
            return self.file_name.clone();
        }
        let program = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "edgefleet".to_string());
        std::env::temp_dir().join(format!("{program}-edgefleet.log"))
    }

    fn dir(&self) -> PathBuf {
        match self.file_path().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn backup_dir_path(&self) -> PathBuf {
        match &self.backup_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => self.dir(),
        }
    }

    /// 备份文件名的前缀（含连字符）与扩展名（压缩时带 `.gz`）
    fn prefix_and_ext(&self) -> (String, String) {
        let name = self
            .file_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (stem, ext) = match name.rfind('.') {
            Some(idx) => (&name[..idx], &name[idx..]),
            None => (name.as_str(), ""),
        };
        let mut ext = ext.to_string();
        if self.compress {
            ext.push_str(GZIP_EXT);
        }
        (format!("{stem}-"), ext)
    }

    fn format_timestamp(&self, at: DateTime<Utc>) -> String {
        if self.local_time {
            at.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string()
        } else {
            at.format(TIMESTAMP_FORMAT).to_string()
        }
    }

    fn parse_timestamp(&self, text: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).ok()?;
        if self.local_time {
            Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
        } else {
            Some(Utc.from_utc_datetime(&naive))
        }
    }

    fn backup_uses_rename(&self) -> bool {
        self.backup_dir.as_ref().map_or(true, |d| d.as_os_str().is_empty()) && !self.compress
    }
}

impl From<&LogFileConfig> for RollingFileConfig {
    fn from(config: &LogFileConfig) -> Self {
        Self {
            file_name: PathBuf::from(&config.file_name),
            backup_dir: (!config.backup_dir.is_empty()).then(|| PathBuf::from(&config.backup_dir)),
            capacity_mb: config.capacity_mb,
            save_time_days: config.save_time_days,
            save_volume: config.save_volume,
            local_time: config.local_time,
            compress: config.compress,
            disable_on_user_switch: config.disable_on_user_switch,
        }
    }
}

/// 已备份的日志文件
#[derive(Debug, Clone, PartialEq)]
pub struct BackupFile {
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    file: Option<File>,
    size: u64,
}

/// 按大小滚动的日志文件，所有操作在同一把锁内串行执行
#[derive(Debug)]
pub struct RollingFile {
    config: RollingFileConfig,
    state: Mutex<State>,
    remover: OnceLock<SyncSender<()>>,
}

impl RollingFile {
    pub fn new(config: RollingFileConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            remover: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &RollingFileConfig {
        &self.config
    }

    pub fn path(&self) -> PathBuf {
        self.config.file_path()
    }

    /// 立即滚动：关闭当前文件、备份并新建，然后触发旧备份清理
    pub fn roll(&self) -> io::Result<()> {
        let mut state = self.lock();
        self.roll_locked(&mut state)
    }

    pub fn close(&self) -> io::Result<()> {
        let mut state = self.lock();
        close_locked(&mut state)
    }

    /// 将已写入内容持久化到磁盘
    pub fn flush(&self) -> io::Result<()> {
        let state = self.lock();
        match &state.file {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }

    /// 当前备份列表，按时间从新到旧排列
    pub fn backups(&self) -> io::Result<Vec<BackupFile>> {
        list_backups(&self.config)
    }

    /// 同步执行一次旧备份清理，返回被删除的文件
    pub fn remove_outdated(&self) -> io::Result<Vec<PathBuf>> {
        self.ensure_user_unchanged()?;
        prune_backups(&self.config, Utc::now())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_data(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        let len = data.len() as u64;
        let max = self.config.max_size();
        if len > max {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("写入长度 {len} 超过日志文件上限 {max}"),
            ));
        }

        if state.file.is_none() {
            self.open_or_create(&mut state, len)?;
        }
        state.size = match &state.file {
            Some(file) => file.metadata()?.len(),
            None => 0,
        };
        if len + state.size > max {
            self.roll_locked(&mut state)?;
        }

        let file = state
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("日志文件未打开"))?;
        file.write_all(data)?;
        state.size += len;
        Ok(data.len())
    }

    fn open_or_create(&self, state: &mut State, len: u64) -> io::Result<()> {
        self.ensure_user_unchanged()?;
        self.notify_remover();

        let path = self.path();
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return self.create(state),
            Err(e) => {
                return Err(io::Error::new(e.kind(), format!("获取日志文件信息失败: {e}")));
            }
        };
        if len + metadata.len() >= self.config.max_size() {
            return self.roll_locked(state);
        }

        match OpenOptions::new().append(true).open(&path) {
            Ok(file) => {
                state.file = Some(file);
                state.size = metadata.len();
                Ok(())
            }
            Err(_) => self.create(state),
        }
    }

    fn roll_locked(&self, state: &mut State) -> io::Result<()> {
        self.ensure_user_unchanged()?;
        close_locked(state)?;
        self.make_sure_backup_space()?;
        self.create(state)?;
        self.notify_remover();
        Ok(())
    }

    /// 备份已有日志文件并新建，新文件沿用旧文件权限
    fn create(&self, state: &mut State) -> io::Result<()> {
        let path = self.path();
        make_sure_dir(&self.config.dir(), MODE_DIR_SHARED)
            .map_err(|e| io::Error::new(e.kind(), format!("创建日志目录失败: {e}")))?;

        let mut mode = MODE_600;
        if let Ok(metadata) = fs::metadata(&path) {
            mode = metadata.permissions().mode() & 0o777;
            let backup = self.next_backup_path();
            self.backup_file(&path, &backup)
                .map_err(|e| io::Error::new(e.kind(), format!("备份日志文件失败: {e}")))?;
            set_mode(&backup, MODE_400)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(mode)
            .open(&path)?;
        state.file = Some(file);
        state.size = 0;
        Ok(())
    }

    /// 同一毫秒内多次滚动时顺延时间戳，避免覆盖已有备份
    fn next_backup_path(&self) -> PathBuf {
        let dir = self.config.backup_dir_path();
        let (prefix, ext) = self.config.prefix_and_ext();
        let mut at = Utc::now();
        loop {
            let candidate = dir.join(format!("{prefix}{}{ext}", self.config.format_timestamp(at)));
            if !candidate.exists() {
                return candidate;
            }
            at += chrono::Duration::milliseconds(1);
        }
    }

    fn backup_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        if self.config.backup_uses_rename() {
            return fs::rename(src, dst);
        }
        make_sure_dir(&self.config.backup_dir_path(), MODE_DIR_SHARED)?;
        self.copy_file(src, dst)?;
        fs::remove_file(src)
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let mut reader = BufReader::new(File::open(src)?);
        let target = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(MODE_600)
            .open(dst)?;

        let copied = if self.config.compress {
            let mut encoder = GzEncoder::new(target, Compression::default());
            io::copy(&mut reader, &mut encoder)
                .and_then(|_| encoder.finish())
                .and_then(|file| file.sync_all())
        } else {
            let mut target = target;
            io::copy(&mut reader, &mut target).and_then(|_| target.sync_all())
        };

        if let Err(e) = copied {
            if let Err(clean) = fs::remove_file(dst) {
                warn!("清理未完成的日志备份失败 {}: {}", dst.display(), clean);
            }
            return Err(e);
        }
        Ok(())
    }

    /// 备份前按从旧到新删除备份，直到可用空间足以容纳当前日志文件
    fn make_sure_backup_space(&self) -> io::Result<()> {
        let needed = match fs::metadata(self.path()) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let dir = self.config.backup_dir_path();
        make_sure_dir(&dir, MODE_DIR_SHARED)?;

        for backup in list_backups(&self.config)?.iter().rev() {
            if disk_free(&dir)? >= needed {
                return Ok(());
            }
            match fs::remove_file(&backup.path) {
                Ok(()) => warn!("磁盘空间不足，删除日志备份: {}", backup.path.display()),
                Err(e) => warn!("删除日志备份失败 {}: {}", backup.path.display(), e),
            }
        }

        if disk_free(&dir)? >= needed {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "日志备份目录 {} 磁盘空间不足",
                dir.display()
            )))
        }
    }

    fn ensure_user_unchanged(&self) -> io::Result<()> {
        if self.config.disable_on_user_switch && user_switched() {
            return Err(io::Error::new(
                ErrorKind::PermissionDenied,
                "检测到用户切换，日志轮转已禁用",
            ));
        }
        Ok(())
    }

    /// 首次调用时启动清理线程，之后仅投递信号，已有待处理信号时直接丢弃
    fn notify_remover(&self) {
        let sender = self
            .remover
            .get_or_init(|| spawn_remover(self.config.clone()));
        if let Err(TrySendError::Disconnected(())) = sender.try_send(()) {
            warn!("日志清理线程已退出");
        }
    }
}

impl Write for &RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        RollingFile::flush(self)
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        RollingFile::flush(self)
    }
}

fn close_locked(state: &mut State) -> io::Result<()> {
    let Some(file) = state.file.take() else {
        return Ok(());
    };
    file.sync_all()
}

fn spawn_remover(config: RollingFileConfig) -> SyncSender<()> {
    let (tx, rx) = mpsc::sync_channel::<()>(1);
    let spawned = thread::Builder::new()
        .name("log-remover".to_string())
        .spawn(move || {
            for () in rx {
                if let Err(e) = prune_backups(&config, Utc::now()) {
                    error!("清理过期日志备份失败: {}", e);
                }
            }
            debug!("日志清理线程退出");
        });
    if let Err(e) = spawned {
        error!("启动日志清理线程失败: {}", e);
    }
    tx
}

fn check_retention(save_volume: u32, save_time_days: u32) -> io::Result<()> {
    if save_volume != 0 && !(MIN_SAVE_VOLUME..=MAX_SAVE_VOLUME).contains(&save_volume) {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("备份保留个数无效: {save_volume}"),
        ));
    }
    if save_time_days != 0 && !(MIN_SAVE_TIME_DAYS..=MAX_SAVE_TIME_DAYS).contains(&save_time_days) {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("备份保留天数无效: {save_time_days}"),
        ));
    }
    Ok(())
}

/// 先删除超过保留天数的备份，再只保留最新的若干个
fn prune_backups(config: &RollingFileConfig, now: DateTime<Utc>) -> io::Result<Vec<PathBuf>> {
    if config.save_volume == 0 && config.save_time_days == 0 {
        return Ok(Vec::new());
    }
    check_retention(config.save_volume, config.save_time_days)?;

    let mut backups = list_backups(config)?;
    let mut removals = Vec::new();
    if config.save_time_days > 0 {
        let deadline = now.timestamp() - i64::from(config.save_time_days) * ONE_DAY_SECONDS;
        let (expired, kept): (Vec<_>, Vec<_>) = backups
            .into_iter()
            .partition(|b| b.timestamp.timestamp() <= deadline);
        removals.extend(expired);
        backups = kept;
    }
    let keep = config.save_volume as usize;
    if keep > 0 && backups.len() > keep {
        removals.extend(backups.split_off(keep));
    }

    let mut first_error = None;
    let mut removed = Vec::with_capacity(removals.len());
    for backup in removals {
        match fs::remove_file(&backup.path) {
            Ok(()) => {
                debug!("删除旧日志备份: {}", backup.path.display());
                removed.push(backup.path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!("删除旧日志备份失败 {}: {}", backup.path.display(), e);
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(removed),
    }
}

fn list_backups(config: &RollingFileConfig) -> io::Result<Vec<BackupFile>> {
    let dir = config.backup_dir_path();
    let (prefix, ext) = config.prefix_and_ext();
    // 压缩开关可能改过，压缩与未压缩的备份都要识别
    let plain = if config.compress {
        ext.strip_suffix(GZIP_EXT).unwrap_or(&ext)
    } else {
        ext.as_str()
    };
    let entries = fs::read_dir(&dir).map_err(|e| {
        io::Error::new(e.kind(), format!("读取日志备份目录失败 {}: {e}", dir.display()))
    })?;

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let timestamp = name
            .strip_prefix(prefix.as_str())
            .map(|rest| rest.strip_suffix(GZIP_EXT).unwrap_or(rest))
            .and_then(|rest| rest.strip_suffix(plain))
            .and_then(|ts| config.parse_timestamp(ts));
        if let Some(timestamp) = timestamp {
            backups.push(BackupFile {
                path: entry.path(),
                timestamp,
            });
        }
    }
    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(backups)
}

fn disk_free(path: &Path) -> io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    let mut stat = MaybeUninit::<libc::statvfs>::zeroed();
    // SAFETY: c_path 以 NUL 结尾，stat 指向足够大小的内存
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs 调用成功后结构体已被填充
    let stat = unsafe { stat.assume_init() };
    (stat.f_bavail as u64)
        .checked_mul(stat.f_frsize as u64)
        .ok_or_else(|| io::Error::other("磁盘可用空间计算溢出"))
}

/// 实际用户与有效用户（或组）不一致
pub fn user_switched() -> bool {
    // SAFETY: 这些调用总是成功且无副作用
    unsafe { libc::getuid() != libc::geteuid() || libc::getgid() != libc::getegid() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgefleet_core::fs::file_mode;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> RollingFileConfig {
        let mut config = RollingFileConfig::new(dir.path().join("logs").join("app.log"));
        config.save_time_days = 0;
        config.save_volume = 0;
        config
    }

    #[test]
    fn test_max_size_falls_back_to_default() {
        let mut config = RollingFileConfig::new("app.log");
        config.capacity_mb = 0;
        assert_eq!(config.max_size(), 20 * MEGABYTE);
        config.capacity_mb = 400;
        assert_eq!(config.max_size(), 20 * MEGABYTE);
        config.capacity_mb = 399;
        assert_eq!(config.max_size(), 399 * MEGABYTE);
    }

    #[test]
    fn test_backup_name_prefix_and_extension() {
        let mut config = RollingFileConfig::new("/var/log/edge/app.log");
        assert_eq!(config.prefix_and_ext(), ("app-".to_string(), ".log".to_string()));
        config.compress = true;
        assert_eq!(config.prefix_and_ext(), ("app-".to_string(), ".log.gz".to_string()));

        let config = RollingFileConfig::new("/var/log/edge/app");
        assert_eq!(config.prefix_and_ext(), ("app-".to_string(), String::new()));
        let parsed = config.parse_timestamp("2024-03-05T10-20-30.123");
        assert_eq!(
            parsed.map(|t| t.timestamp_millis()),
            Some(
                Utc.with_ymd_and_hms(2024, 3, 5, 10, 20, 30)
                    .unwrap()
                    .timestamp_millis()
                    + 123
            )
        );
        assert!(config.parse_timestamp("not-a-time").is_none());
    }

    #[test]
    fn test_oversized_write_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.capacity_mb = 1;
        let sink = RollingFile::new(config);

        let data = vec![b'x'; MEGABYTE as usize + 1];
        let err = (&sink).write(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(!sink.path().exists());
    }

    #[test]
    fn test_rotation_keeps_newest_backups() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.capacity_mb = 1;
        config.save_volume = 2;
        let sink = RollingFile::new(config);

        let chunk = vec![b'a'; 600 * 1024];
        for _ in 0..4 {
            (&sink).write_all(&chunk).unwrap();
        }
        sink.remove_outdated().unwrap();

        let backups = sink.backups().unwrap();
        assert_eq!(backups.len(), 2);
        assert!(backups[0].timestamp >= backups[1].timestamp);
        for backup in &backups {
            assert_eq!(file_mode(&backup.path).unwrap(), MODE_400);
            assert_eq!(fs::metadata(&backup.path).unwrap().len(), chunk.len() as u64);
        }
        assert_eq!(file_mode(&sink.path()).unwrap(), MODE_600);
        assert_eq!(fs::metadata(sink.path()).unwrap().len(), chunk.len() as u64);
        assert_eq!(file_mode(&sink.config().dir()).unwrap(), MODE_DIR_SHARED);
    }

    #[test]
    fn test_compressed_backup_in_separate_dir() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.backup_dir = Some(dir.path().join("archive"));
        config.compress = true;
        let mut sink = RollingFile::new(config);

        sink.write_all(b"first line\n").unwrap();
        sink.roll().unwrap();
        sink.write_all(b"second line\n").unwrap();
        sink.flush().unwrap();

        let backups = sink.backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].path.starts_with(dir.path().join("archive")));
        assert!(backups[0].path.to_string_lossy().ends_with(".log.gz"));

        let mut decoded = String::new();
        GzDecoder::new(File::open(&backups[0].path).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "first line\n");
        assert_eq!(fs::read_to_string(sink.path()).unwrap(), "second line\n");
    }

    #[test]
    fn test_backups_list_compressed_and_plain_forms() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.save_volume = 1;
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("app-2024-01-01T00-00-00.000.log"), b"old").unwrap();
        fs::write(logs.join("app-2024-01-02T00-00-00.000.log.gz"), b"new").unwrap();
        fs::write(logs.join("app-2024-01-03T00-00-00.000.txt"), b"other").unwrap();

        for compress in [false, true] {
            let mut config = config.clone();
            config.compress = compress;
            let backups = RollingFile::new(config).backups().unwrap();
            assert_eq!(backups.len(), 2, "compress = {compress}");
            assert!(backups[0].path.to_string_lossy().ends_with(".log.gz"));
        }

        let sink = RollingFile::new(config);
        sink.remove_outdated().unwrap();
        let backups = sink.backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].path.to_string_lossy().ends_with(".log.gz"));
        assert!(logs.join("app-2024-01-03T00-00-00.000.txt").exists());
    }

    #[test]
    fn test_reopen_appends_after_close() {
        let dir = TempDir::new().unwrap();
        let sink = RollingFile::new(config_in(&dir));

        (&sink).write_all(b"one\n").unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
        (&sink).write_all(b"two\n").unwrap();

        assert_eq!(fs::read_to_string(sink.path()).unwrap(), "one\ntwo\n");
        assert!(sink.backups().unwrap().is_empty());
    }

    #[test]
    fn test_age_pruning_before_volume() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.save_time_days = 7;
        config.save_volume = 2;
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();

        let now = Utc::now();
        let ages_days = [1, 2, 3, 10, 30];
        for days in ages_days {
            let at = now - chrono::Duration::days(days);
            let name = format!("app-{}.log", config.format_timestamp(at));
            fs::write(logs.join(name), b"old").unwrap();
        }
        fs::write(logs.join("unrelated.txt"), b"keep").unwrap();

        let removed = prune_backups(&config, now).unwrap();
        assert_eq!(removed.len(), 3);

        let left = list_backups(&config).unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|b| now - b.timestamp < chrono::Duration::days(3)));
        assert!(logs.join("unrelated.txt").exists());
    }

    #[test]
    fn test_retention_out_of_range_aborts_prune() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.save_volume = 31;
        fs::create_dir_all(dir.path().join("logs")).unwrap();
        let err = prune_backups(&config, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        config.save_volume = 0;
        config.save_time_days = 3;
        assert!(prune_backups(&config, Utc::now()).is_err());

        config.save_time_days = 0;
        assert!(prune_backups(&config, Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_user_switch_guard_allows_same_user() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.disable_on_user_switch = true;
        let sink = RollingFile::new(config);

        assert!(!user_switched());
        (&sink).write_all(b"ok\n").unwrap();
        sink.roll().unwrap();
        assert_eq!(sink.backups().unwrap().len(), 1);
    }

    #[test]
    fn test_from_log_file_config() {
        let file = LogFileConfig {
            file_name: "/tmp/edge/app.log".to_string(),
            backup_dir: String::new(),
            capacity_mb: 5,
            ..Default::default()
        };
        let config = RollingFileConfig::from(&file);
        assert!(config.backup_dir.is_none());
        assert_eq!(config.max_size(), 5 * MEGABYTE);
        assert_eq!(config.backup_dir_path(), PathBuf::from("/tmp/edge"));
    }
}
