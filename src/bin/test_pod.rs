//! Create or delete a synthetic pending pod against the current cluster.
//!
//!   test_pod create <name> <cpu> <memory> [gpus]
//!   test_pod delete <name>

use kube::Client;
use tracing_subscriber::EnvFilter;

use karpenter::testing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let client = Client::try_default().await?;
    match args.as_slice() {
        [cmd, name, cpu, memory] if cmd == "create" => {
            testing::create_test_pod(client, name, cpu, memory, None).await
        }
        [cmd, name, cpu, memory, gpus] if cmd == "create" => {
            testing::create_test_pod(client, name, cpu, memory, Some(gpus.parse()?)).await
        }
        [cmd, name] if cmd == "delete" => testing::delete_test_pod(client, name).await,
        _ => {
            eprintln!("usage: test_pod create <name> <cpu> <memory> [gpus] | delete <name>");
            std::process::exit(2);
        }
    }
}
