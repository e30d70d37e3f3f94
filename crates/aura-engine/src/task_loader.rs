//! Task loading
//!
//! Task files live under `<plan>/tasks/**/*.yaml`; each file maps task keys
//! to task definitions. A task's id within the plan is
//! `<relative_path_without_ext>/<task_key>`. Parsed files are cached with a
//! short TTL so repeated loads during a run chain stay cheap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aura_core::TaskDefinition;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, warn};

const CACHE_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    loaded_at: Instant,
    tasks: HashMap<String, Arc<TaskDefinition>>,
}

/// Per-plan task file loader
pub struct TaskLoader {
    plan_name: String,
    tasks_dir: PathBuf,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl TaskLoader {
    pub fn new(plan_name: impl Into<String>, plan_path: &Path) -> Self {
        Self {
            plan_name: plan_name.into(),
            tasks_dir: plan_path.join("tasks"),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drop all cached files (used when task files change on disk).
    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }

    /// Load one task by its id within the plan (`path/key`).
    pub fn get_task(&self, task_in_plan: &str) -> Option<Arc<TaskDefinition>> {
        let (file_part, task_key) = match task_in_plan.rsplit_once('/') {
            Some((path, key)) => (path.to_string(), key.to_string()),
            None => (task_in_plan.to_string(), task_in_plan.to_string()),
        };
        let file_path = self.tasks_dir.join(format!("{file_part}.yaml"));

        let tasks = self.load_file(&file_path);
        let found = tasks.get(&task_key).cloned();
        if found.is_none() {
            warn!(
                plan = %self.plan_name,
                task = task_in_plan,
                file = %file_path.display(),
                "task definition not found"
            );
        }
        found
    }

    /// Every task definition of the plan, keyed by in-plan id.
    pub fn get_all(&self) -> HashMap<String, Arc<TaskDefinition>> {
        let mut out = HashMap::new();
        let mut files = Vec::new();
        collect_yaml_files(&self.tasks_dir, &mut files);
        for file in files {
            let relative = file
                .strip_prefix(&self.tasks_dir)
                .unwrap_or(&file)
                .with_extension("");
            let relative = relative.to_string_lossy().replace('\\', "/");
            for (key, def) in self.load_file(&file) {
                out.insert(format!("{relative}/{key}"), def);
            }
        }
        out
    }

    fn load_file(&self, path: &Path) -> HashMap<String, Arc<TaskDefinition>> {
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(path) {
                if entry.loaded_at.elapsed() < CACHE_TTL {
                    return entry.tasks.clone();
                }
            }
        }

        let tasks = parse_task_file(path);
        self.cache.lock().insert(
            path.to_path_buf(),
            CacheEntry {
                loaded_at: Instant::now(),
                tasks: tasks.clone(),
            },
        );
        tasks
    }
}

fn parse_task_file(path: &Path) -> HashMap<String, Arc<TaskDefinition>> {
    let mut out = HashMap::new();
    if !path.is_file() {
        return out;
    }
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            error!(file = %path.display(), %err, "failed to read task file");
            return out;
        }
    };
    let raw: HashMap<String, Value> = match serde_yaml::from_str(&text) {
        Ok(raw) => raw,
        Err(err) => {
            error!(file = %path.display(), %err, "failed to parse task file");
            return out;
        }
    };

    for (key, value) in raw {
        // Only mappings that declare steps are task definitions
        if value.get("steps").is_none() {
            continue;
        }
        match serde_json::from_value::<TaskDefinition>(value) {
            Ok(def) => match def.validate() {
                Ok(()) => {
                    out.insert(key, Arc::new(def));
                }
                Err(err) => {
                    error!(file = %path.display(), task = %key, %err, "task failed validation, skipped");
                }
            },
            Err(err) => {
                error!(file = %path.display(), task = %key, %err, "invalid task definition, skipped");
            }
        }
    }
    out
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_yaml_files(&path, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, TaskLoader) {
        let dir = tempfile::tempdir().unwrap();
        let tasks = dir.path().join("tasks");
        std::fs::create_dir_all(tasks.join("quests")).unwrap();
        std::fs::write(
            tasks.join("quests/daily.yaml"),
            r#"
main:
  steps:
    - action: log
      params:
        message: hi
helper:
  steps: []
not_a_task: 42
"#,
        )
        .unwrap();
        std::fs::write(
            tasks.join("top.yaml"),
            "entry:\n  steps:\n    - action: log\n",
        )
        .unwrap();
        let loader = TaskLoader::new("myplan", dir.path());
        (dir, loader)
    }

    #[test]
    fn test_get_task_by_path_and_key() {
        let (_dir, loader) = fixture();
        assert!(loader.get_task("quests/daily/main").is_some());
        assert!(loader.get_task("quests/daily/helper").is_some());
        assert!(loader.get_task("quests/daily/missing").is_none());
        assert!(loader.get_task("top/entry").is_some());
    }

    #[test]
    fn test_non_task_entries_are_skipped() {
        let (_dir, loader) = fixture();
        let all = loader.get_all();
        assert_eq!(all.len(), 3);
        assert!(all.contains_key("quests/daily/main"));
        assert!(all.contains_key("quests/daily/helper"));
        assert!(all.contains_key("top/entry"));
    }

    #[test]
    fn test_cache_serves_after_file_removal() {
        let (dir, loader) = fixture();
        assert!(loader.get_task("top/entry").is_some());
        std::fs::remove_file(dir.path().join("tasks/top.yaml")).unwrap();
        // Still cached
        assert!(loader.get_task("top/entry").is_some());
        loader.invalidate();
        assert!(loader.get_task("top/entry").is_none());
    }

    #[test]
    fn test_invalid_yaml_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = dir.path().join("tasks");
        std::fs::create_dir_all(&tasks).unwrap();
        std::fs::write(tasks.join("bad.yaml"), "{{{{not yaml").unwrap();
        let loader = TaskLoader::new("p", dir.path());
        assert!(loader.get_task("bad/anything").is_none());
    }
}
