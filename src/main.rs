use anyhow::Result;
use clap::{Parser, Subcommand};
use comfycarry::cloudflare::CloudflareApi;
use comfycarry::config::Config;
use comfycarry::gateway;
use comfycarry::reconciler::{Reconciler, generate_subdomain};
use comfycarry::store::{StateStore, keys};
use comfycarry::services;
use comfycarry::supervisor::LocalSupervisor;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// comfycarry — expose a self-hosted GPU workload through a managed tunnel.
#[derive(Parser, Debug)]
#[command(name = "comfycarry")]
#[command(version = "0.1.0")]
#[command(about = "Tunnel management for self-hosted GPU workloads.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control gateway (dashboard backend)
    Serve,

    /// Provision a custom tunnel against your own domain
    Provision {
        /// Provider API token with Tunnel + DNS edit scopes
        #[arg(long)]
        api_token: String,

        /// Domain the tunnel hostnames live under
        #[arg(long)]
        domain: String,

        /// Subdomain prefix (generated when omitted)
        #[arg(long)]
        subdomain: Option<String>,
    },

    /// Remove the custom tunnel and its DNS records
    Teardown,

    /// Print the provider-side tunnel status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();
    let config = Config::load_or_init()?;

    match cli.command {
        Commands::Serve => gateway::run_gateway(config).await,

        Commands::Provision {
            api_token,
            domain,
            subdomain,
        } => {
            let store = StateStore::open(config.state_path.clone())?;
            let subdomain = subdomain
                .filter(|s| !s.is_empty())
                .or_else(|| store.get_str(keys::CF_SUBDOMAIN))
                .unwrap_or_else(generate_subdomain);
            let reconciler = Reconciler::new(
                CloudflareApi::new(config.api_base.clone(), api_token.clone()),
                domain.clone(),
                subdomain.clone(),
            );
            let provisioned = reconciler.ensure(&services::specs(&store)).await?;

            store.set(keys::CF_API_TOKEN, &api_token)?;
            store.set(keys::CF_DOMAIN, &domain)?;
            store.set(keys::CF_SUBDOMAIN, &subdomain)?;
            store.set(keys::TUNNEL_MODE, "custom")?;

            println!("tunnel {} provisioned", provisioned.tunnel_id);
            for (name, url) in &provisioned.urls {
                println!("  {name}: {url}");
            }
            Ok(())
        }

        Commands::Teardown => {
            let store = StateStore::open(config.state_path.clone())?;
            let reconciler = reconciler_from_store(&config, &store)?;
            let supervisor = LocalSupervisor::new();
            reconciler.teardown(&supervisor).await?;
            store.remove(keys::CF_API_TOKEN)?;
            store.remove(keys::CF_DOMAIN)?;
            store.remove(keys::CF_SUBDOMAIN)?;
            store.remove(keys::TUNNEL_MODE)?;
            println!("tunnel removed");
            Ok(())
        }

        Commands::Status => {
            let store = StateStore::open(config.state_path.clone())?;
            let reconciler = reconciler_from_store(&config, &store)?;
            let status = reconciler.tunnel_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn reconciler_from_store(config: &Config, store: &StateStore) -> Result<Reconciler> {
    let api_token = store
        .get_str(keys::CF_API_TOKEN)
        .ok_or_else(|| anyhow::anyhow!("no custom tunnel configured — run provision first"))?;
    let domain = store
        .get_str(keys::CF_DOMAIN)
        .ok_or_else(|| anyhow::anyhow!("no domain stored — run provision first"))?;
    let subdomain = store
        .get_str(keys::CF_SUBDOMAIN)
        .ok_or_else(|| anyhow::anyhow!("no subdomain stored — run provision first"))?;
    Ok(Reconciler::new(
        CloudflareApi::new(config.api_base.clone(), api_token),
        domain,
        subdomain,
    ))
}
