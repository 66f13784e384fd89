use crate::{admission::Admission, events::LogSink};
use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use signet_policy_controller_core::{
    ConcreteSignatureEvaluator, EngineConfig, FileKeySource, SignerPolicy,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::info;

#[derive(Debug, Parser)]
#[clap(name = "policy", about = "An admission-time signature verification controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "signet=info,warn",
        env = "SIGNET_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Path to the controller configuration document.
    #[clap(
        long,
        default_value = "/etc/signet/config.yaml",
        env = "SIGNET_POLICY_CONTROLLER_CONFIG"
    )]
    config: PathBuf,

    /// Upper bound on a single request's evaluation, in milliseconds.
    #[clap(long, default_value = "5000")]
    evaluation_timeout_ms: u64,
}

/// The on-disk configuration document: engine settings plus the signer
/// policy. Reload is a process restart; the loaded state is immutable.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    pub engine: EngineConfig,
    pub policy: SignerPolicy,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            config,
            evaluation_timeout_ms,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let ControllerConfig { engine, policy } = load_config(&config).await?;
        info!(
            path = %config.display(),
            signers = policy.signers.len(),
            keys = engine.key_configs.len(),
            "Loaded controller configuration",
        );
        let engine = Arc::new(engine);
        let policy = Arc::new(policy);
        let timeout = Duration::from_millis(evaluation_timeout_ms);

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin)
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let evaluator = Arc::new(ConcreteSignatureEvaluator::new(
            engine.clone(),
            Arc::new(FileKeySource),
        ));
        let audit = Arc::new(LogSink);

        let runtime = runtime.spawn_server(move || {
            Admission::new(engine, policy, evaluator, audit, timeout)
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn load_config(path: &Path) -> Result<ControllerConfig> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_slice(&bytes)
        .with_context(|| format!("failed to parse {}", path.display()))
}
