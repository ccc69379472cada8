//! The `conda` kind: `conda create --prefix`.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use vessel_types::VesselError;

use super::schema::{list_param, string_param};
use super::virtualenv::bin_dir;
use super::{
    BuildLogs, BuildRequest, BuilderSchema, EnvironmentBuilder, ParamSchema, ParamType,
    build_fingerprint, mark_ready, ready_fingerprint, remove_partial, run_logged, site_packages,
};
use crate::handle::RuntimeHandle;

pub struct CondaBuilder;

#[async_trait]
impl EnvironmentBuilder for CondaBuilder {
    fn kind(&self) -> &str {
        "conda"
    }

    fn schema(&self) -> BuilderSchema {
        BuilderSchema::new("conda", "A conda environment created under the cache directory")
            .param(ParamSchema::optional("packages", ParamType::List, "Conda package specs"))
            .param(ParamSchema::optional("channels", ParamType::List, "Channels to search"))
            .param(ParamSchema::optional(
                "python_version",
                ParamType::String,
                "Python version to pin",
            ))
    }

    async fn build(&self, request: BuildRequest, logs: &BuildLogs) -> Result<RuntimeHandle, VesselError> {
        let settings = &request.settings;
        let config = &request.configuration;
        let root = settings.cache_dir.join("conda").join(request.key.to_hex());
        let fingerprint = build_fingerprint(&request.key, settings, &settings.conda_exe);

        match ready_fingerprint(&root).await {
            Some(found) if found == fingerprint => {
                logs.trace(format!("Using existing conda environment at {}", root.display()))
                    .await;
                return Ok(handle(&request, &root).await);
            }
            Some(_) => {
                logs.trace(format!(
                    "Rebuilding conda environment at {}: agent settings changed",
                    root.display()
                ))
                .await;
            }
            None => {}
        }
        remove_partial(&root).await;

        let mut create = Command::new(&settings.conda_exe);
        create.args(["create", "--yes", "--quiet", "--prefix"]).arg(&root);
        for channel in list_param(config, "channels") {
            create.arg("--channel").arg(channel);
        }
        if let Some(version) = string_param(config, "python_version") {
            create.arg(format!("python={version}"));
        }
        create.args(list_param(config, "packages"));
        logs.trace(format!("Creating conda environment at {}", root.display()))
            .await;
        if let Err(err) = run_logged(create, logs, "conda").await {
            remove_partial(&root).await;
            return Err(err);
        }

        if !settings.inherit_from_local && !settings.agent_requirements.is_empty() {
            let mut pip = Command::new(bin_dir(&root).join("python"));
            pip.args(["-m", "pip", "install", "--disable-pip-version-check"]);
            pip.args(&settings.agent_requirements);
            if let Err(err) = run_logged(pip, logs, "pip").await {
                remove_partial(&root).await;
                return Err(err);
            }
        }

        mark_ready(&root, &fingerprint, logs).await?;
        Ok(handle(&request, &root).await)
    }
}

async fn handle(request: &BuildRequest, root: &Path) -> RuntimeHandle {
    RuntimeHandle::new(request.key, "conda")
        .with_root(root)
        .with_bin_dir(bin_dir(root))
        .with_library_dirs(site_packages(root).await)
        .with_layer_env("CONDA_PREFIX", root.to_string_lossy())
}
