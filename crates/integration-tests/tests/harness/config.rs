//! Programmatic tool setup for integration tests

use std::path::{Path, PathBuf};
use std::sync::Arc;

use atelier_config::Config;
use atelier_imagegen::{
    ComfyUiTool, ComfyUiToolBuilder, ExecutionObserver, LocalImageStorage, OutputPaths,
};
use tempfile::TempDir;

/// Builder for a tool pointed at a mock backend with a scratch client root
pub struct ToolBuilder {
    config: Config,
    root: TempDir,
    uploader: bool,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl ToolBuilder {
    pub fn new(base_url: &str) -> Self {
        let mut config = Config::default();
        config.comfyui.url = Some(base_url.to_owned());

        Self {
            config,
            root: tempfile::tempdir().expect("create temp dir"),
            uploader: false,
            observer: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: &str) -> Self {
        self.config.comfyui.checkpoint = checkpoint.to_owned();
        self
    }

    /// Store persisted-mode uploads on local disk
    pub fn with_local_storage(mut self) -> Self {
        self.uploader = true;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> TestTool {
        let client = self.root.path().join("client");
        let paths = OutputPaths::new(client.join("public").join("images"), client.clone());

        let mut builder = ComfyUiToolBuilder::new(&self.config).with_paths(paths.clone());
        if self.uploader {
            builder = builder.with_uploader(Arc::new(LocalImageStorage::new(paths)));
        }
        if let Some(observer) = self.observer {
            builder = builder.with_observer(observer);
        }

        TestTool {
            tool: builder.build().expect("build tool"),
            client,
            _root: self.root,
        }
    }
}

/// Tool plus the scratch directory it writes into
pub struct TestTool {
    pub tool: ComfyUiTool,
    client: PathBuf,
    _root: TempDir,
}

impl TestTool {
    /// Client root that public URLs resolve against
    pub fn client_root(&self) -> &Path {
        &self.client
    }

    /// Local file behind a public `/images/...` URL
    pub fn resolve(&self, public_url: &str) -> PathBuf {
        let relative = public_url.trim_start_matches('/');
        self.client.join("public").join(relative)
    }

    /// Every file under the image output root
    pub fn stored_files(&self) -> Vec<PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    out.push(path);
                }
            }
        }

        let mut files = Vec::new();
        walk(&self.client.join("public").join("images"), &mut files);
        files
    }
}
