use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the JSON subscriber. `RUST_LOG` wins over the `-v` verbosity.
pub fn init(verbosity: u8) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbosity)))
        .with(fmt::layer().json())
        .init();
}

fn default_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::new(directives(verbosity))
}

fn directives(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // The binary's own crate root, whatever the bin target is named.
    format!(
        "github_app_secret={level},github_app_secret_cli={level},\
         {bin}={level},kube=warn,octocrab=warn",
        bin = module_path!().split("::").next().unwrap_or("github_app_secret_cli"),
    )
}
