use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use luagate::config::{self, HttpConfig, ModulesConfig, PoolConfig};
use luagate::plugin::{HostHttp, InstancePool, ScriptLoader, ScriptManager};

#[derive(Parser)]
#[command(name = "luagate", version, about = "Evaluate Lua proxy-check bundles")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run `checkproxy` from a single bundle directory
    Check {
        bundle: PathBuf,
        #[arg(required = true)]
        domains: Vec<String>,
    },
    /// Run `checkproxy` from every enabled bundle in a config file
    Run {
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
        #[arg(required = true)]
        domains: Vec<String>,
    },
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn verdict(proxy: bool) -> &'static str {
    if proxy {
        "proxy"
    } else {
        "direct"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Check { bundle, domains } => {
            init_tracing("warn");
            let http = Arc::new(HostHttp::new(&HttpConfig::default()));
            let loader = ScriptLoader::new(http, ModulesConfig::default());
            let pool_config = PoolConfig {
                max_instances: 1,
                prewarm: 1,
                borrow_timeout_ms: 0,
            };

            let results = tokio::task::spawn_blocking(move || -> Result<Vec<(String, bool)>> {
                let pool = InstancePool::open(&bundle, loader, pool_config)
                    .with_context(|| format!("cannot open bundle {}", bundle.display()))?;
                let results = domains
                    .into_iter()
                    .map(|d| {
                        let proxy = pool.check_proxy(&d);
                        (d, proxy)
                    })
                    .collect();
                pool.shutdown();
                Ok(results)
            })
            .await??;

            for (domain, proxy) in results {
                println!("{}\t{}", domain, verdict(proxy));
            }
        }
        Command::Run { config: path, domains } => {
            let cfg = config::load_config(&path)?;
            init_tracing(&cfg.log.level);
            info!(path = path, bundles = cfg.bundles.len(), "config loaded");

            let manager = ScriptManager::from_config(&cfg);
            let errors = manager.load_from_configs(&cfg.bundles).await;
            if !errors.is_empty() {
                anyhow::bail!("failed to load bundles:\n  {}", errors.join("\n  "));
            }

            for meta in manager.list_bundles().await {
                for domain in &domains {
                    let proxy = manager.check_proxy(&meta.name, domain).await;
                    println!("{}\t{}\t{}", meta.name, domain, verdict(proxy));
                }
            }
            manager.shutdown().await;
        }
    }

    Ok(())
}
