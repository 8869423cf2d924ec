use analytics_validator::{setup_logging, Cli, CliRunner, Config};
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("starting analytics-validator v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let cli_runner = CliRunner::new(config, &args).await?;

    let result = cli_runner.run(args.command).await;

    if let Err(err) = &result {
        error!("command failed: {err}");
        std::process::exit(1);
    }

    result
}

async fn load_config(args: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&config_content)?
    } else {
        Config::default()
    };

    if let Some(pool_size) = args.pool_size {
        config.browser_pool_size = pool_size;
    }

    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }

    info!("configuration loaded: browser_pool_size={}", config.browser_pool_size);
    Ok(config)
}
