mod config;
mod telemetry;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Parser;
use github_app_secret::{AppSecret, GithubAppTokenProvider, KubeSecretStore};
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::{Cli, Settings};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.log_level);

    let settings = match cli.validate(config::namespace_from_env()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "validation failed");
            return ExitCode::FAILURE;
        }
    };

    match run(&settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(
                error = %e,
                secret = %settings.key,
                "failed to generate token and create secret"
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: &Settings) -> Result<()> {
    let started = Instant::now();
    let client = tokio::time::timeout(settings.timeout, kube::Client::try_default())
        .await
        .map_err(|_| {
            anyhow!(
                "timed out after {:?} configuring kubernetes client",
                settings.timeout
            )
        })?
        .map_err(|e| anyhow!("failed to configure kubernetes client: {e}"))?;

    let app = AppSecret::new(GithubAppTokenProvider::new(), KubeSecretStore::new(client));
    let outcome = app
        .generate_and_store(
            &settings.request,
            &settings.key,
            settings.kind,
            &settings.fields,
            remaining(settings.timeout, started),
        )
        .await?;

    info!(
        namespace = %settings.key.namespace,
        name = %settings.key.name,
        %outcome,
        "token generated and Secret created/updated"
    );
    Ok(())
}

/// Share of `timeout` left since `started`; zero once it has run out.
fn remaining(timeout: Duration, started: Instant) -> Duration {
    timeout.saturating_sub(started.elapsed())
}
