use std::fs;
use tempfile::TempDir;

use storage::{FileInfo, StorageError, Visitor, WalkControl};

/// 创建测试用的临时目录结构
pub fn create_test_structure() -> TempDir {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();

    fs::create_dir_all(root.join("dir1/subdir1")).unwrap();
    fs::create_dir_all(root.join("dir2")).unwrap();
    fs::create_dir_all(root.join("empty_dir")).unwrap();

    fs::write(root.join("file1.txt"), b"content1").unwrap();
    fs::write(root.join("dir1/file3.txt"), b"content3").unwrap();
    fs::write(root.join("dir1/subdir1/file4.txt"), b"content4").unwrap();
    fs::write(root.join("dir2/file5.txt"), b"content5").unwrap();
    fs::write(root.join("binary.dat"), vec![0u8; 1024]).unwrap();

    temp_dir
}

/// One visit as seen by [`Collector`].
#[derive(Debug)]
pub struct Visit {
    pub path: String,
    pub info: Option<FileInfo>,
    pub error: Option<String>,
}

/// Records every visit and answers with a fixed control, except for paths
/// ending in `skip_suffix`, which get `SkipDir`.
pub struct Collector {
    pub visits: Vec<Visit>,
    pub skip_suffix: Option<String>,
    pub stop_after: Option<usize>,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            visits: Vec::new(),
            skip_suffix: None,
            stop_after: None,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.visits
            .iter()
            .filter_map(|v| v.info.as_ref().map(|i| i.name.clone()))
            .collect()
    }

    pub fn errors(&self) -> Vec<&Visit> {
        self.visits.iter().filter(|v| v.error.is_some()).collect()
    }
}

#[async_trait::async_trait]
impl Visitor for Collector {
    async fn visit(
        &mut self, path: &str, info: Option<&FileInfo>, err: Option<&StorageError>,
    ) -> WalkControl {
        self.visits.push(Visit {
            path: path.to_string(),
            info: info.cloned(),
            error: err.map(|e| e.to_string()),
        });

        if let Some(limit) = self.stop_after {
            if self.visits.len() >= limit {
                return WalkControl::Stop;
            }
        }
        match &self.skip_suffix {
            Some(suffix) if path.ends_with(suffix.as_str()) => WalkControl::SkipDir,
            _ => WalkControl::Continue,
        }
    }
}
