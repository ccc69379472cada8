//! The `virtualenv` kind: `python -m venv` plus `pip install`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use vessel_types::VesselError;

use super::schema::{list_param, string_param};
use super::{
    BuildLogs, BuildRequest, BuilderSchema, EnvironmentBuilder, ParamSchema, ParamType,
    build_fingerprint, mark_ready, ready_fingerprint, remove_partial, run_logged, site_packages,
};
use crate::handle::RuntimeHandle;

pub struct VirtualenvBuilder;

pub(crate) fn bin_dir(root: &Path) -> PathBuf {
    root.join("bin")
}

#[async_trait]
impl EnvironmentBuilder for VirtualenvBuilder {
    fn kind(&self) -> &str {
        "virtualenv"
    }

    fn schema(&self) -> BuilderSchema {
        BuilderSchema::new("virtualenv", "A Python virtual environment built with pip")
            .param(ParamSchema::optional(
                "requirements",
                ParamType::List,
                "Requirement specifiers passed to pip install",
            ))
            .param(ParamSchema::optional(
                "constraints_file",
                ParamType::String,
                "Path to a pip constraints file",
            ))
            .param(ParamSchema::optional(
                "python_version",
                ParamType::String,
                "Interpreter version, e.g. 3.12 (runs pythonX.Y)",
            ))
            .param(ParamSchema::optional(
                "extra_index_urls",
                ParamType::List,
                "Additional package index URLs",
            ))
    }

    async fn build(&self, request: BuildRequest, logs: &BuildLogs) -> Result<RuntimeHandle, VesselError> {
        let settings = &request.settings;
        let config = &request.configuration;
        let root = settings
            .cache_dir
            .join("virtualenv")
            .join(request.key.to_hex());
        let python = string_param(config, "python_version")
            .map(|v| format!("python{v}"))
            .unwrap_or_else(|| settings.python_exe.clone());
        let fingerprint = build_fingerprint(&request.key, settings, &python);

        match ready_fingerprint(&root).await {
            Some(found) if found == fingerprint => {
                logs.trace(format!("Using existing virtualenv at {}", root.display()))
                    .await;
                return Ok(handle(&request, &root).await);
            }
            Some(_) => {
                logs.trace(format!(
                    "Rebuilding virtualenv at {}: interpreter or agent settings changed",
                    root.display()
                ))
                .await;
            }
            None => {}
        }
        remove_partial(&root).await;
        if let Some(parent) = root.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| logs.failure(format!("failed to create {}: {}", parent.display(), e)))?;
        }

        logs.trace(format!("Creating virtualenv at {} with {}", root.display(), python))
            .await;

        let mut venv = Command::new(&python);
        venv.arg("-m").arg("venv").arg(&root);
        if let Err(err) = run_logged(venv, logs, "venv").await {
            remove_partial(&root).await;
            return Err(err);
        }

        let mut requirements = list_param(config, "requirements");
        if !settings.inherit_from_local {
            requirements.extend(settings.agent_requirements.iter().cloned());
        }
        if !requirements.is_empty() {
            let mut pip = Command::new(bin_dir(&root).join("python"));
            pip.args(["-m", "pip", "install", "--disable-pip-version-check"]);
            if let Some(constraints) = string_param(config, "constraints_file") {
                pip.arg("--constraint").arg(constraints);
            }
            for url in list_param(config, "extra_index_urls") {
                pip.arg("--extra-index-url").arg(url);
            }
            pip.args(&requirements);
            logs.trace(format!("Installing {}", requirements.join(" "))).await;
            if let Err(err) = run_logged(pip, logs, "pip").await {
                remove_partial(&root).await;
                return Err(err);
            }
        }

        mark_ready(&root, &fingerprint, logs).await?;
        logs.trace("Virtualenv ready").await;
        Ok(handle(&request, &root).await)
    }
}

async fn handle(request: &BuildRequest, root: &Path) -> RuntimeHandle {
    RuntimeHandle::new(request.key, "virtualenv")
        .with_root(root)
        .with_bin_dir(bin_dir(root))
        .with_library_dirs(site_packages(root).await)
        .with_layer_env("VIRTUAL_ENV", root.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vessel_types::{Configuration, EnvironmentKey};

    use crate::builders::READY_MARKER;
    use crate::config::Settings;
    use crate::multiplex::LogSink;

    fn request(cache: &Path, settings: Settings) -> BuildRequest {
        BuildRequest {
            key: EnvironmentKey([7; 32]),
            configuration: Configuration::new(),
            settings: Arc::new(settings.with_cache_dir(cache)),
        }
    }

    async fn marked_root(request: &BuildRequest, fingerprint: &str) -> PathBuf {
        let root = request
            .settings
            .cache_dir
            .join("virtualenv")
            .join(request.key.to_hex());
        tokio::fs::create_dir_all(root.join("lib/python3.12/site-packages"))
            .await
            .unwrap();
        tokio::fs::write(root.join(READY_MARKER), fingerprint)
            .await
            .unwrap();
        root
    }

    #[tokio::test]
    async fn test_ready_environment_reused() {
        let cache = std::env::temp_dir().join(format!("vessel-venv-reuse-{}", std::process::id()));
        let settings = Settings::default()
            .with_inherit_from_local(true)
            .with_python_exe("/nonexistent/python");
        let request = request(&cache, settings);
        let fingerprint = build_fingerprint(&request.key, &request.settings, "/nonexistent/python");
        let root = marked_root(&request, &fingerprint).await;

        let logs = BuildLogs::new(LogSink::discard());
        let handle = VirtualenvBuilder.build(request, &logs).await.unwrap();
        assert_eq!(handle.layer_env["VIRTUAL_ENV"], root.to_string_lossy());
        assert_eq!(
            handle.library_dirs,
            vec![root.join("lib/python3.12/site-packages")]
        );
        assert!(handle.env.is_empty());
        let _ = std::fs::remove_dir_all(&cache);
    }

    #[tokio::test]
    async fn test_changed_agent_settings_force_rebuild() {
        let cache = std::env::temp_dir().join(format!("vessel-venv-stale-{}", std::process::id()));
        let built_with = Settings::default()
            .with_inherit_from_local(true)
            .with_python_exe("/nonexistent/python");
        let now = Settings::default()
            .with_inherit_from_local(false)
            .with_agent_requirements(vec!["codec-lib==9.9".into()])
            .with_python_exe("/nonexistent/python");
        let stale = build_fingerprint(&EnvironmentKey([7; 32]), &built_with, "/nonexistent/python");
        let request = request(&cache, now);
        let root = marked_root(&request, &stale).await;

        let logs = BuildLogs::new(LogSink::discard());
        let err = VirtualenvBuilder.build(request, &logs).await.unwrap_err();
        assert!(matches!(err, VesselError::Build { .. }));
        assert!(
            err.build_logs()
                .iter()
                .any(|e| e.message.starts_with("Rebuilding virtualenv"))
        );
        assert!(!root.join(READY_MARKER).exists());
        let _ = std::fs::remove_dir_all(&cache);
    }

    #[test]
    fn test_schema_params() {
        let schema = VirtualenvBuilder.schema();
        let names: Vec<&str> = schema.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["requirements", "constraints_file", "python_version", "extra_index_urls"]
        );
        assert!(schema.params.iter().all(|p| !p.required));
    }

    #[test]
    fn test_requirements_must_be_strings() {
        let mut cfg = Configuration::new();
        cfg.insert("requirements".into(), 5i64.into());
        let err = VirtualenvBuilder.validate(&cfg).unwrap_err();
        assert!(matches!(err, VesselError::Config { ref key, .. } if key == "requirements"));
    }
}
