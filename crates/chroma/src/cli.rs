use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Chroma — Open Assets colored-coin client (issuance, transfers,
/// crowdsale distribution) over Bitcoin Core or a REST explorer API.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Ledger provider: `bitcoind`, `api`, or `api+bitcoind`
    /// (API reads with node signing/broadcast).
    #[arg(long, default_value = "bitcoind", env = "CHROMA_PROVIDER")]
    pub provider: String,

    /// Bitcoin Core RPC URL.
    #[arg(long, default_value = "http://127.0.0.1:8332", env = "CHROMA_RPC_URL")]
    pub rpc_url: String,

    /// RPC username (optional; cookie file is used when unset).
    #[arg(long, env = "CHROMA_RPC_USER")]
    pub rpc_user: Option<String>,

    /// RPC password.
    #[arg(long, env = "CHROMA_RPC_PASS")]
    pub rpc_pass: Option<String>,

    /// Path to Bitcoin Core's RPC cookie file.
    #[arg(long, env = "CHROMA_RPC_COOKIE")]
    pub rpc_cookie_file: Option<PathBuf>,

    /// Maximum RPC requests per second (unset: unlimited).
    #[arg(long)]
    pub rpc_rate_limit: Option<u32>,

    /// Maximum JSON-RPC calls per batch request.
    #[arg(long, default_value = "50")]
    pub rpc_batch_size: usize,

    /// REST API root for the `api` providers,
    /// e.g. `https://api.example.com/v2/bitcoin`.
    #[arg(long, env = "CHROMA_API_URL")]
    pub api_url: Option<String>,

    /// Maximum API requests per second (unset: unlimited).
    #[arg(long)]
    pub api_rate_limit: Option<u32>,

    /// Chain name when no node can report one (`main`, `test`,
    /// `signet`, `regtest`).
    #[arg(long, default_value = "main", env = "CHROMA_NETWORK")]
    pub network: String,

    /// Output cache directory.
    #[arg(long, default_value = ".chroma-cache", env = "CHROMA_CACHE")]
    pub cache: PathBuf,

    /// Minimum value of a non-marker output, in satoshis.
    #[arg(long, default_value = "600")]
    pub dust_limit: u64,

    /// Fee applied when a command does not specify one, in satoshis.
    #[arg(long, default_value = "10000")]
    pub default_fee: u64,

    /// Base58check version byte for asset ids.
    #[arg(long, default_value = "23")]
    pub asset_version_byte: u8,

    /// Minimum confirmations for spendable outputs.
    #[arg(long, default_value = "1")]
    pub min_confirmations: u32,

    /// Maximum confirmations for spendable outputs.
    #[arg(long, default_value = "9999999")]
    pub max_confirmations: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
#[command(rename_all = "lowercase")]
pub enum Command {
    /// Native and asset balances, grouped by address.
    Getbalance {
        /// Address to query (default: the node wallet).
        address: Option<String>,
    },

    /// Unspent outputs with their colored form.
    Listunspent {
        /// Address to query (default: the node wallet).
        address: Option<String>,
    },

    /// Send bitcoin without touching colored outputs.
    Sendbitcoin {
        from: String,
        /// Amount in satoshis.
        amount: u64,
        to: String,
        #[arg(long)]
        fee: Option<u64>,
        /// `unsigned`, `signed`, or `broadcast`.
        #[arg(long, default_value = "broadcast")]
        mode: String,
    },

    /// Send asset units.
    Sendasset {
        from: String,
        /// Base58check asset id.
        asset_id: String,
        quantity: u64,
        to: String,
        #[arg(long)]
        fee: Option<u64>,
        #[arg(long, default_value = "broadcast")]
        mode: String,
    },

    /// Issue new asset units from an address.
    Issueasset {
        from: String,
        quantity: u64,
        /// Recipient of the issued units (default: the issuing address).
        #[arg(long)]
        to: Option<String>,
        /// Marker metadata, stored as UTF-8 bytes.
        #[arg(long, default_value = "")]
        metadata: String,
        #[arg(long)]
        fee: Option<u64>,
        #[arg(long, default_value = "broadcast")]
        mode: String,
    },

    /// Run one crowdsale pass over payments to a sale address.
    Distribute {
        /// Identifier of the persistent sale record.
        sale_id: String,
        /// The sale address receiving payments.
        address: String,
        /// Where collected funds are forwarded; must not be the sale
        /// address.
        #[arg(long)]
        forward: String,
        /// Price schedule: `5000` or `0:5000,100000:6000`
        /// (threshold:price pairs in satoshis).
        #[arg(long)]
        price: String,
        /// Cap on total units issued across the sale.
        #[arg(long)]
        reserve: Option<u64>,
        /// Marker metadata, stored as UTF-8 bytes.
        #[arg(long, default_value = "")]
        metadata: String,
        #[arg(long)]
        fee: Option<u64>,
        /// `preview`, `unsigned`, `signed`, or `broadcast`.
        #[arg(long, default_value = "preview")]
        mode: String,
    },

    /// Run the JSON/RPC server.
    Serve {
        /// Address to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Port to listen on.
        #[arg(long, default_value = "3080")]
        port: u16,
    },
}
