mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use libdualcache::BridgeConfig;
use libdualcache::demo::{self, SCENARIOS};
use log::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    match &cli.command {
        Commands::Demo { scenario } => {
            let names: Vec<&str> = match scenario {
                Some(name) => vec![name.as_str()],
                None => SCENARIOS.to_vec(),
            };
            let mut failed = 0;
            for name in names {
                match demo::run(name, config.clone()).await {
                    Ok(()) => println!("{name}: OK"),
                    Err(e) => {
                        error!("scenario {name} failed: {e:?}");
                        println!("{name}: FAILED ({e})");
                        failed += 1;
                    }
                }
            }
            anyhow::ensure!(failed == 0, "{failed} scenario(s) failed");
            info!("all scenarios passed");
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
