//! `minibroker-ssh`: terminates the ingress endpoint agents tunnel in
//! through and the SSH listener external clients connect to, bridging the
//! two via the device [`Registry`].

use clap::Parser;
use minibroker_core::ingress::IngressServer;
use minibroker_core::registry::Registry;
use minibroker_core::BrokerSshServer;

/// Runs the minibroker reverse-tunnel broker.
#[derive(Debug, Parser)]
#[command(name = "minibroker-ssh", version, about)]
struct Args {
    /// Address the agent tunnel ingress listens on.
    #[arg(long, env = "MINIBROKER_INGRESS_ADDR", default_value = "0.0.0.0:8080")]
    ingress_addr: String,

    /// Address the external-facing SSH listener binds on.
    #[arg(long, env = "MINIBROKER_SSH_ADDR", default_value = "0.0.0.0:2222")]
    ssh_addr: String,

    /// Emit logs as JSON lines instead of plain text.
    #[arg(long, env = "MINIBROKER_JSON_LOGS")]
    json_logs: bool,
}

fn init_logging(json: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if json {
        builder.format(|buf, record| {
            use std::io::Write;
            let line = serde_json::json!({
                "level": record.level().to_string(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{line}")
        });
    }
    builder.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let registry = Registry::new();

    // The original runs its HTTP ingress and SSH listener as two
    // concurrently-spawned goroutines racing on a shared error channel;
    // `try_join!` over both `start()` calls reproduces that shape: either
    // one failing to bind tears the whole process down with a non-zero
    // exit, and a clean shutdown only happens if neither ever returns.
    let ingress = IngressServer::start(&args.ingress_addr, registry.clone());
    let ssh = BrokerSshServer::start(&args.ssh_addr, registry);
    let (_ingress, _ssh) = tokio::try_join!(ingress, ssh)?;

    // Both servers run their accept loops on detached tasks and these
    // handles only exist to keep them alive; park forever rather than
    // returning and dropping (and thereby aborting) either one.
    std::future::pending::<()>().await;
    Ok(())
}
