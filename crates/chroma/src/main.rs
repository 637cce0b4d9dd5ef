mod cli;
mod server;

use std::sync::Arc;

use bitcoin::Network;
use clap::Parser;
use eyre::{eyre, WrapErr};

use chroma_core::cache::OutputStore;
use chroma_core::crowdsale::PriceSchedule;
use chroma_core::provider::{ApiProvider, ChainProvider, CoreRpcProvider};
use chroma_core::{Config, Controller, Mode};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();

    let provider = build_provider(&args)?;

    // Verify the connection and pin the network before doing anything
    // else; a client configured for one chain must never build
    // transactions against another.
    let chain_info = provider
        .get_blockchain_info()
        .await
        .map_err(|err| eyre!("{err}"))
        .wrap_err("while attempting to connect to the ledger provider")?;
    let network = map_chain_to_network(&chain_info.chain)?;

    tracing::info!(
        chain = %chain_info.chain,
        blocks = chain_info.blocks,
        provider = %args.provider,
        "connected"
    );

    let store = Arc::new(
        OutputStore::open(&args.cache)
            .map_err(|err| eyre!("{err}"))
            .wrap_err_with(|| format!("open output cache at {}", args.cache.display()))?,
    );

    let config = Config {
        network,
        dust_limit: args.dust_limit,
        default_fee: args.default_fee,
        asset_version_byte: args.asset_version_byte,
        min_confirmations: args.min_confirmations,
        max_confirmations: args.max_confirmations,
    };
    let controller = Controller::new(provider, store, config);

    match args.command {
        cli::Command::Getbalance { address } => {
            let address = address
                .map(|a| controller.parse_address(&a))
                .transpose()?;
            print_json(&controller.get_balance(address.as_ref()).await?)
        }
        cli::Command::Listunspent { address } => {
            let address = address
                .map(|a| controller.parse_address(&a))
                .transpose()?;
            print_json(&controller.list_unspent(address.as_ref()).await?)
        }
        cli::Command::Sendbitcoin {
            from,
            amount,
            to,
            fee,
            mode,
        } => {
            let from = controller.parse_address(&from)?;
            let to = controller.parse_address(&to)?;
            let mode: Mode = mode.parse()?;
            print_json(&controller.send_bitcoin(&from, amount, &to, fee, mode).await?)
        }
        cli::Command::Sendasset {
            from,
            asset_id,
            quantity,
            to,
            fee,
            mode,
        } => {
            let from = controller.parse_address(&from)?;
            let to = controller.parse_address(&to)?;
            let asset_id = controller.parse_asset_id(&asset_id)?;
            let mode: Mode = mode.parse()?;
            print_json(
                &controller
                    .send_asset(&from, &asset_id, quantity, &to, fee, mode)
                    .await?,
            )
        }
        cli::Command::Issueasset {
            from,
            quantity,
            to,
            metadata,
            fee,
            mode,
        } => {
            let from = controller.parse_address(&from)?;
            let to = to.map(|a| controller.parse_address(&a)).transpose()?;
            let mode: Mode = mode.parse()?;
            print_json(
                &controller
                    .issue_asset(&from, quantity, to.as_ref(), metadata.into_bytes(), fee, mode)
                    .await?,
            )
        }
        cli::Command::Distribute {
            sale_id,
            address,
            forward,
            price,
            reserve,
            metadata,
            fee,
            mode,
        } => {
            let address = controller.parse_address(&address)?;
            let forward = controller.parse_address(&forward)?;
            let schedule = PriceSchedule::parse(&price)?;
            let mode: Mode = mode.parse()?;
            print_json(
                &controller
                    .distribute(
                        &sale_id,
                        &address,
                        &forward,
                        &schedule,
                        reserve,
                        metadata.into_bytes(),
                        fee,
                        mode,
                    )
                    .await?,
            )
        }
        cli::Command::Serve { bind, port } => {
            let bind_addr = format!("{bind}:{port}");
            if bind == "0.0.0.0" {
                tracing::warn!("server is bound to 0.0.0.0 — it is accessible from the network");
            }

            let router = server::build_router(server::AppState { controller });
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .wrap_err("bind TCP listener")?;

            tracing::info!("listening on {bind_addr}");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .wrap_err("run HTTP server")?;
            Ok(())
        }
    }
}

fn build_provider(args: &cli::Cli) -> eyre::Result<Arc<dyn ChainProvider>> {
    let bitcoind = || -> eyre::Result<Arc<CoreRpcProvider>> {
        Ok(Arc::new(
            CoreRpcProvider::new(
                &args.rpc_url,
                args.rpc_user.as_deref(),
                args.rpc_pass.as_deref(),
                args.rpc_cookie_file.as_deref(),
                args.rpc_rate_limit,
                args.rpc_batch_size,
            )
            .map_err(|err| eyre!("{err}"))
            .wrap_err("configure Bitcoin Core RPC provider")?,
        ))
    };

    let api = |fallback: Option<Arc<dyn ChainProvider>>| -> eyre::Result<Arc<dyn ChainProvider>> {
        let api_url = args
            .api_url
            .as_deref()
            .ok_or_else(|| eyre!("--api-url is required for the `{}` provider", args.provider))?;
        Ok(Arc::new(
            ApiProvider::new(api_url, &args.network, args.api_rate_limit, fallback)
                .map_err(|err| eyre!("{err}"))
                .wrap_err("configure REST API provider")?,
        ))
    };

    match args.provider.as_str() {
        "bitcoind" => Ok(bitcoind()?),
        "api" => api(None),
        "api+bitcoind" => api(Some(bitcoind()?)),
        other => Err(eyre!(
            "unknown provider `{other}`; expected bitcoind, api, or api+bitcoind"
        )),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> eyre::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).wrap_err("render JSON output")?
    );
    Ok(())
}

fn map_chain_to_network(chain: &str) -> eyre::Result<Network> {
    match chain {
        "main" => Ok(Network::Bitcoin),
        "test" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        _ => Err(eyre!("unrecognized chain name `{chain}` from the provider")),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install the shutdown handler");
    }
}
