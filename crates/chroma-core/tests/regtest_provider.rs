use std::env;
use std::sync::{Arc, Once};

use bitcoin::Network;

use chroma_core::cache::OutputStore;
use chroma_core::operations::{Config, Controller, Mode, ProcessedTransaction};
use chroma_core::provider::{ChainProvider, CoreRpcProvider};

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chroma_core=debug")),
            )
            .with_target(true)
            .try_init();
    });
}

fn provider_from_env() -> CoreRpcProvider {
    let rpc_url = env::var("CHROMA_TEST_RPC_URL").expect("CHROMA_TEST_RPC_URL must be set");
    let rpc_user = env::var("CHROMA_TEST_RPC_USER").expect("CHROMA_TEST_RPC_USER must be set");
    let rpc_pass = env::var("CHROMA_TEST_RPC_PASS").expect("CHROMA_TEST_RPC_PASS must be set");
    CoreRpcProvider::new(&rpc_url, Some(&rpc_user), Some(&rpc_pass), None, None, 10)
        .expect("rpc provider must construct")
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires local regtest bitcoind with a funded wallet"]
async fn regtest_issue_and_transfer_lifecycle() {
    init_tracing();

    let issue_address =
        env::var("CHROMA_TEST_ADDRESS").expect("CHROMA_TEST_ADDRESS must be set (funded address)");

    let provider = Arc::new(provider_from_env());
    let info = provider
        .get_blockchain_info()
        .await
        .expect("regtest get_blockchain_info must succeed");
    assert_eq!(info.chain, "regtest");
    assert!(
        info.blocks >= 101,
        "regtest must have mined coinbase maturity before running"
    );

    let cache_dir = tempfile::tempdir().expect("temp cache dir must be creatable");
    let store = Arc::new(OutputStore::open(cache_dir.path()).expect("cache must open"));
    let controller = Controller::new(provider, store, Config::new(Network::Regtest));

    let from = controller
        .parse_address(&issue_address)
        .expect("funded address must parse for regtest");

    eprintln!("[itest] issuing 1000 units from {issue_address}");
    let issued = controller
        .issue_asset(&from, 1_000, None, b"itest".to_vec(), None, Mode::Broadcast)
        .await
        .expect("issuance must broadcast on a funded regtest wallet");
    let ProcessedTransaction::Broadcast { txid } = issued else {
        panic!("broadcast mode must return a txid");
    };
    eprintln!("[itest] issuance broadcast as {txid}");

    // The issuance lands in the mempool; zero-conf outputs are excluded
    // by the default min-confirmations, so balances reflect it only
    // after the harness mines a block. Until then the unspent listing
    // against the address must still succeed.
    let unspents = controller
        .list_unspent(Some(&from))
        .await
        .expect("listunspent must succeed against regtest");
    eprintln!("[itest] {} unspents visible", unspents.len());

    let balances = controller
        .get_balance(Some(&from))
        .await
        .expect("getbalance must succeed against regtest");
    eprintln!("[itest] {} balance entries", balances.len());
    eprintln!("[itest] integration test completed");
}
