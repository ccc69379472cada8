//! Built environments and how several of them compose into one launch.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use vessel_types::{EnvironmentKey, VesselError};

/// A built environment, owned by the cache and shared by every bridge that
/// runs on top of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub key: EnvironmentKey,
    pub kind: String,
    /// Directory holding the environment on disk, if it has one.
    pub root: Option<PathBuf>,
    /// Directories prepended to `PATH` for processes launched inside.
    pub bin_dirs: Vec<PathBuf>,
    /// Import roots of this environment's interpreter (`site-packages`).
    pub library_dirs: Vec<PathBuf>,
    /// Variables that must agree with every other layer.
    pub env: BTreeMap<String, String>,
    /// Variables that describe the active layer, such as `VIRTUAL_ENV`.
    /// The topmost layer that sets one wins.
    pub layer_env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl RuntimeHandle {
    pub fn new(key: EnvironmentKey, kind: impl Into<String>) -> Self {
        Self {
            key,
            kind: kind.into(),
            root: None,
            bin_dirs: Vec::new(),
            library_dirs: Vec::new(),
            env: BTreeMap::new(),
            layer_env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dirs.push(dir.into());
        self
    }

    pub fn with_library_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.library_dirs.extend(dirs);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_layer_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.layer_env.insert(key.into(), value.into());
        self
    }
}

const PYTHONPATH: &str = "PYTHONPATH";

/// Everything needed to start a worker on top of composed environments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Search order: the last composed environment comes first.
    pub bin_dirs: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Compose handles in definition order. Later handles are layered on top.
    ///
    /// The topmost handle with library dirs owns the interpreter. Library
    /// dirs of the layers below it go on `PYTHONPATH`, nearest layer first.
    pub fn compose(handles: &[Arc<RuntimeHandle>]) -> Result<Self, VesselError> {
        let mut spec = LaunchSpec::default();
        for handle in handles.iter().rev() {
            spec.bin_dirs.extend(handle.bin_dirs.iter().cloned());
        }
        for handle in handles {
            for (key, value) in &handle.env {
                match spec.env.get(key) {
                    Some(existing) if existing != value => {
                        return Err(VesselError::config(
                            key.clone(),
                            format!(
                                "environment variable '{key}' is set to conflicting values ('{existing}' and '{value}')"
                            ),
                        ));
                    }
                    _ => {
                        spec.env.insert(key.clone(), value.clone());
                    }
                }
            }
            if let Some(dir) = &handle.working_dir {
                match &spec.working_dir {
                    Some(existing) if existing != dir => {
                        return Err(VesselError::config(
                            "working_dir",
                            format!(
                                "conflicting working directories ({} and {})",
                                existing.display(),
                                dir.display()
                            ),
                        ));
                    }
                    _ => spec.working_dir = Some(dir.clone()),
                }
            }
        }
        for handle in handles {
            spec.env.extend(
                handle
                    .layer_env
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone())),
            );
        }

        let inherited: Vec<PathBuf> = handles
            .iter()
            .rev()
            .filter(|handle| !handle.library_dirs.is_empty())
            .skip(1)
            .flat_map(|handle| handle.library_dirs.iter().cloned())
            .collect();
        if !inherited.is_empty() {
            let mut dirs = inherited;
            if let Some(existing) = spec.env.get(PYTHONPATH) {
                dirs.extend(std::env::split_paths(existing));
            }
            let joined = std::env::join_paths(dirs).map_err(|e| {
                VesselError::config(PYTHONPATH, format!("cannot build {PYTHONPATH}: {e}"))
            })?;
            spec.env
                .insert(PYTHONPATH.to_string(), joined.to_string_lossy().into_owned());
        }
        Ok(spec)
    }

    /// `PATH` with this spec's bin dirs in front of `inherited`.
    pub fn search_path(&self, inherited: Option<&std::ffi::OsStr>) -> Option<std::ffi::OsString> {
        if self.bin_dirs.is_empty() {
            return inherited.map(|p| p.to_os_string());
        }
        let mut dirs = self.bin_dirs.clone();
        if let Some(path) = inherited {
            dirs.extend(std::env::split_paths(path));
        }
        std::env::join_paths(dirs).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> EnvironmentKey {
        EnvironmentKey([n; 32])
    }

    #[test]
    fn test_later_bin_dirs_searched_first() {
        let base = Arc::new(RuntimeHandle::new(key(1), "virtualenv").with_bin_dir("/envs/a/bin"));
        let top = Arc::new(RuntimeHandle::new(key(2), "conda").with_bin_dir("/envs/b/bin"));
        let spec = LaunchSpec::compose(&[base, top]).unwrap();
        assert_eq!(
            spec.bin_dirs,
            vec![PathBuf::from("/envs/b/bin"), PathBuf::from("/envs/a/bin")]
        );
    }

    #[test]
    fn test_env_merges_and_conflicts() {
        let a = Arc::new(RuntimeHandle::new(key(1), "local").with_env("A", "1"));
        let b = Arc::new(RuntimeHandle::new(key(2), "local").with_env("B", "2").with_env("A", "1"));
        let spec = LaunchSpec::compose(&[a.clone(), b]).unwrap();
        assert_eq!(spec.env.len(), 2);

        let c = Arc::new(RuntimeHandle::new(key(3), "local").with_env("A", "other"));
        let err = LaunchSpec::compose(&[a, c]).unwrap_err();
        assert!(matches!(err, VesselError::Config { ref key, .. } if key == "A"));
    }

    fn venv(n: u8, root: &str) -> Arc<RuntimeHandle> {
        Arc::new(
            RuntimeHandle::new(key(n), "virtualenv")
                .with_root(root)
                .with_bin_dir(format!("{root}/bin"))
                .with_library_dirs([PathBuf::from(format!("{root}/lib/python3.12/site-packages"))])
                .with_layer_env("VIRTUAL_ENV", root),
        )
    }

    #[test]
    fn test_layered_virtualenvs_compose() {
        let base = venv(1, "/c/virtualenv/aaa");
        let extra = venv(2, "/c/virtualenv/bbb");
        let spec = LaunchSpec::compose(&[base, extra]).unwrap();

        assert_eq!(spec.env["VIRTUAL_ENV"], "/c/virtualenv/bbb");
        assert_eq!(
            spec.env["PYTHONPATH"],
            "/c/virtualenv/aaa/lib/python3.12/site-packages"
        );
        assert_eq!(spec.bin_dirs[0], PathBuf::from("/c/virtualenv/bbb/bin"));
    }

    #[test]
    fn test_single_layer_sets_no_pythonpath() {
        let spec = LaunchSpec::compose(&[venv(1, "/c/virtualenv/aaa")]).unwrap();
        assert!(!spec.env.contains_key("PYTHONPATH"));
    }

    #[test]
    fn test_local_on_top_keeps_interpreter_and_pythonpath() {
        let base = venv(1, "/c/virtualenv/aaa");
        let extra = venv(2, "/c/virtualenv/bbb");
        let local = Arc::new(
            RuntimeHandle::new(key(3), "local").with_env("PYTHONPATH", "/src"),
        );
        let spec = LaunchSpec::compose(&[base, extra, local]).unwrap();
        assert_eq!(
            spec.env["PYTHONPATH"],
            "/c/virtualenv/aaa/lib/python3.12/site-packages:/src"
        );
        assert_eq!(spec.env["VIRTUAL_ENV"], "/c/virtualenv/bbb");
    }

    #[test]
    fn test_search_path_prepends() {
        let spec = LaunchSpec {
            bin_dirs: vec![PathBuf::from("/envs/a/bin")],
            ..Default::default()
        };
        let path = spec.search_path(Some(std::ffi::OsStr::new("/usr/bin"))).unwrap();
        assert_eq!(path, std::ffi::OsString::from("/envs/a/bin:/usr/bin"));
    }
}
