//! nga-mirror service binary.

use clap::Parser;
use nga_mirror::{Config, Mirror, ProgramDownloader, SmileMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Self-hosted mirror service for NGA forum threads
#[derive(Debug, Parser)]
#[command(name = "nga-mirror", version, about)]
struct Options {
    /// Listen port
    #[arg(short, long, default_value_t = 5842)]
    port: u16,

    /// Full path of the ngapost2md binary
    #[arg(short = 'm', long, default_value = "ngapost2md/ngapost2md")]
    program: PathBuf,

    /// Access token; unset leaves the API public
    #[arg(short, long, env = "TOKEN")]
    token: Option<String>,

    /// Smiley mode: local caches images, web redirects to the forum
    #[arg(short, long, default_value = "local")]
    smile: String,

    /// Cloud-storage config directory; unset disables transfers
    #[arg(short = 'n', long)]
    pan: Option<PathBuf>,

    /// Topic root override (defaults to the downloader's directory)
    #[arg(long, env = "TOPIC_ROOT")]
    topic_root: Option<PathBuf>,

    /// Log groups to enable (topic, nga, pan, http, all), repeatable
    #[arg(short, long, env = "LOG", value_delimiter = ',')]
    log: Vec<String>,
}

fn init_tracing(groups: &[String]) {
    let filter = if groups.is_empty() || groups.iter().any(|g| g == "all") {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        // Map the coarse log groups onto module targets.
        let mut directives = vec!["warn".to_string()];
        for group in groups {
            match group.as_str() {
                "topic" => directives.push("nga_mirror::mirror=info".into()),
                "nga" => {
                    directives.push("nga_mirror::downloader=info".into());
                    directives.push("nga_mirror::users=info".into());
                }
                "pan" => directives.push("nga_mirror::transfer=info".into()),
                "http" => directives.push("tower_http=info".into()),
                "simple" => directives.push("nga_mirror=info".into()),
                other => eprintln!("unknown log group: {other}"),
            }
        }
        EnvFilter::new(directives.join(","))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let opts = Options::parse();
    init_tracing(&opts.log);

    let smile = match opts.smile.as_str() {
        "web" => SmileMode::Web,
        _ => SmileMode::Local,
    };

    let program_path = std::env::current_dir()
        .map(|wd| wd.join(&opts.program))
        .unwrap_or_else(|_| opts.program.clone());

    let program = match ProgramDownloader::new(&program_path) {
        Ok(program) => program,
        Err(e) => {
            tracing::error!(error = %e, "downloader binary unavailable");
            std::process::exit(1);
        }
    };
    match program.version().await {
        Ok(version) => tracing::info!(%version, "downloader ready"),
        Err(e) => tracing::warn!(error = %e, "downloader version probe failed"),
    }

    // Placeholder cookies abort startup: every download would fail anyway.
    let net = match program.bootstrap().await {
        Ok(net) => net,
        Err(e) => {
            tracing::error!(error = %e, "downloader config rejected");
            std::process::exit(1);
        }
    };

    let topic_root = opts
        .topic_root
        .clone()
        .unwrap_or_else(|| program.program_dir().to_path_buf());

    let mut config = Config::default();
    config.server.port = opts.port;
    config.server.token = opts.token.clone().filter(|t| !t.is_empty());
    config.smile = smile;
    config.pan = opts.pan.clone();
    config.downloader.program = program_path;
    config.downloader.topic_root = Some(topic_root);

    if config.server.token.is_some() {
        tracing::info!("access token configured");
    }

    let mirror = match Mirror::new(config.clone(), net, Arc::new(program)).await {
        Ok(mirror) => mirror,
        Err(e) => {
            tracing::error!(error = %e, "mirror init failed");
            std::process::exit(1);
        }
    };
    mirror.start();

    // Provider login is slow and optional; attach in the background.
    if let Some(pan_dir) = config.pan.clone() {
        let mirror_for_pans = mirror.clone();
        tokio::spawn(async move {
            if let Err(e) = mirror_for_pans.attach_pans(&pan_dir).await {
                tracing::error!(error = %e, "pan init failed");
            }
        });
    }

    let api_mirror = mirror.clone();
    tokio::spawn(async move {
        if let Err(e) = nga_mirror::api::start_api_server(api_mirror).await {
            tracing::error!(error = %e, "API server failed");
        }
    });

    nga_mirror::run_with_shutdown(mirror).await;
}
