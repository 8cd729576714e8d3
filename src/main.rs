use clap::Parser;
use log::{error, info};
use thiserror::Error;
use releaser::cli::Cli;
use releaser::config;
use releaser::pipeline::{self, Releaser};

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::file::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::runtime::Error),

    #[error(transparent)]
    Pipeline(#[from] pipeline::Error),
}

/// Read configuration file from disk and merge it with the
/// `default.toml` [built-in config](../default.toml).
///
/// Without `--config`, a `releaser.toml` in the kubevirtci tree is used when present.
fn read_config(args: &Cli) -> Result<config::file::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "releaser.toml";

    let config_path = format!("{}/{}", args.kubevirtci_path, DEFAULT_CONFIG_FILE);

    let config_file = match &args.config {
        None => std::fs::metadata(&config_path)
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
            .then_some(config_path),
        Some(c) => Some(c.clone()),
    };

    Ok(match config_file {
        Some(config_file) => config::file::File::default_with_user_config_file(&config_file)?,
        None => config::file::File::default(),
    })
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code)
        }
    };

    match run(args).await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {err}");
            std::process::exit(1)
        }
    }
}

async fn run(args: Cli) -> Result<(), Error> {
    let cfg_file = read_config(&args)?;
    let options = config::Options::new(&args, &cfg_file)?;

    info!("kubevirtci releaser {}", env!("CARGO_PKG_VERSION"));

    let releaser = Releaser::new(options)?;
    let summary = releaser.run().await?;

    for job in &summary.jobs {
        info!("{}: job {}/{} {}", job.provider, job.namespace, job.name, job.state);
    }
    for (provider, digest) in &summary.digests {
        info!("{provider}: {digest}");
    }
    info!("Release {} published at {}", summary.tag, summary.release_url);
    Ok(())
}
