//! 本地状态文件
//!
//! 把已完成键集合持久化为 JSON 文件，在网络后端都不可达时作为最后的兜底，
//! 同时用于启动时预热内存集合
//!
//! ## 文件格式
//!
//! ```json
//! { "completed": ["crawl_status:novel_list:list_page:1", "..."] }
//! ```
//!
//! 列表按字典序排列；写入时先写 `<path>.tmp` 再原子重命名

use std::collections::{BTreeSet, HashSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::StatusKey;

#[derive(Serialize)]
struct StateFile<'a> {
    completed: &'a BTreeSet<String>,
}

/// 本地已完成键存储
///
/// 内部锁同时保护内存集合与文件读写；`add` / `extend` 只修改内存，
/// 需要调用 `save` 才会落盘
pub struct LocalStateStore {
    path: PathBuf,
    completed: Mutex<BTreeSet<String>>,
}

impl std::fmt::Debug for LocalStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStateStore")
            .field("path", &self.path)
            .field("completed_count", &self.len())
            .finish()
    }
}

impl LocalStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            completed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 从磁盘加载已完成键
    ///
    /// 文件不存在、JSON 损坏或 `completed` 不是数组时重置为空集合，从不返回错误
    pub fn load(&self) {
        let mut completed = self.completed.lock();

        if !self.path.exists() {
            completed.clear();
            return;
        }

        *completed = match read_completed(&self.path) {
            Ok(items) => items,
            Err(e) => {
                warn!("本地状态文件不可用，重置为空: {:?}, 错误: {}", self.path, e);
                BTreeSet::new()
            }
        };

        info!(
            "已加载本地状态文件: {:?} ({} 个已完成键)",
            self.path,
            completed.len()
        );
    }

    /// 原子写入当前集合
    ///
    /// IO 错误直接返回给调用方
    pub fn save(&self) -> io::Result<()> {
        let completed = self.completed.lock();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = temp_path_for(&self.path);
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &StateFile { completed: &completed })
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)?;

        debug!(
            "已保存本地状态文件: {:?} ({} 个已完成键)",
            self.path,
            completed.len()
        );
        Ok(())
    }

    pub fn add(&self, key: &StatusKey) {
        self.completed.lock().insert(key.cache_key());
    }

    pub fn extend<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a StatusKey>,
    {
        let mut completed = self.completed.lock();
        completed.extend(keys.into_iter().map(StatusKey::cache_key));
    }

    pub fn is_completed(&self, key: &StatusKey) -> bool {
        self.completed.lock().contains(&key.cache_key())
    }

    /// 当前集合的副本（无法解析为状态键的条目被忽略）
    pub fn snapshot(&self) -> HashSet<StatusKey> {
        self.completed
            .lock()
            .iter()
            .filter_map(|raw| StatusKey::from_cache_key(raw))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.completed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空内存集合并删除状态文件（维护操作）
    ///
    /// 返回文件是否存在并被删除
    pub fn clear(&self) -> io::Result<bool> {
        let mut completed = self.completed.lock();
        completed.clear();

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(".tmp");
    PathBuf::from(raw)
}

fn read_completed(path: &Path) -> io::Result<BTreeSet<String>> {
    let content = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let items = match value.get("completed") {
        Some(serde_json::Value::Array(items)) => items,
        _ => return Ok(BTreeSet::new()),
    };

    Ok(items
        .iter()
        .map(|item| match item {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn setup_temp_dir() -> TempDir {
        TempDir::new().expect("Failed to create temp dir")
    }

    fn key(id: &str) -> StatusKey {
        StatusKey::new("novel_detail", "detail_page", id)
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = setup_temp_dir();
        let store = LocalStateStore::new(temp_dir.path().join("state/progress.json"));
        store.add(&key("1"));

        store.load();
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = setup_temp_dir();
        let path = temp_dir.path().join("state/progress.json");

        let store = LocalStateStore::new(&path);
        store.add(&key("100818"));
        store.extend(&[key("2"), key("1")]);
        store.save().unwrap();

        // 不残留临时文件
        assert!(!temp_path_for(&path).exists());

        let content = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        let listed: Vec<&str> = value["completed"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(
            listed,
            vec![
                "crawl_status:novel_detail:detail_page:1",
                "crawl_status:novel_detail:detail_page:100818",
                "crawl_status:novel_detail:detail_page:2",
            ]
        );

        let reloaded = LocalStateStore::new(&path);
        reloaded.load();
        assert!(reloaded.is_completed(&key("100818")));
        assert_eq!(reloaded.snapshot(), store.snapshot());
    }

    #[test]
    fn test_load_corrupted_file() {
        let temp_dir = setup_temp_dir();
        let path = temp_dir.path().join("progress.json");

        fs::write(&path, "{ not json").unwrap();
        let store = LocalStateStore::new(&path);
        store.load();
        assert!(store.is_empty());

        // completed 字段不是数组
        fs::write(&path, r#"{"completed": "crawl_status:a:b:c"}"#).unwrap();
        store.load();
        assert!(store.is_empty());

        // 顶层不是对象
        fs::write(&path, r#"["crawl_status:a:b:c"]"#).unwrap();
        store.load();
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_error_is_visible() {
        let temp_dir = setup_temp_dir();
        // 父路径是一个普通文件，无法创建目录
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();

        let store = LocalStateStore::new(blocker.join("progress.json"));
        store.add(&key("1"));
        assert!(store.save().is_err());
    }

    #[test]
    fn test_clear_removes_file() {
        let temp_dir = setup_temp_dir();
        let path = temp_dir.path().join("progress.json");
        let store = LocalStateStore::new(&path);
        store.add(&key("1"));
        store.save().unwrap();

        assert!(store.clear().unwrap());
        assert!(!path.exists());
        assert!(store.is_empty());
        assert!(!store.clear().unwrap());
    }

    proptest! {
        #[test]
        fn prop_save_load_preserves_set(ids in proptest::collection::hash_set("[0-9]{1,9}", 0..40)) {
            let temp_dir = setup_temp_dir();
            let path = temp_dir.path().join("progress.json");

            let store = LocalStateStore::new(&path);
            let keys: Vec<StatusKey> = ids.iter().map(|id| key(id)).collect();
            store.extend(&keys);
            store.save().unwrap();

            let reloaded = LocalStateStore::new(&path);
            reloaded.load();
            let expected: HashSet<StatusKey> = keys.into_iter().collect();
            prop_assert_eq!(reloaded.snapshot(), expected);
        }
    }
}
