//! `minibroker-agent`: dials a broker's ingress endpoint and keeps a
//! reverse tunnel open, bridging SSH sessions the broker routes back down
//! it to a local interactive shell (or local-forwarded TCP connection).

use clap::Parser;
use minibroker_core::agent::{AgentClient, AgentClientConfig, AgentInfo};
use minibroker_core::error::BrokerError;

/// Connects this device to a minibroker broker and serves bridged SSH
/// sessions over the resulting tunnel.
#[derive(Debug, Parser)]
#[command(name = "minibroker-agent", version, about)]
struct Args {
    /// Broker base URL to dial, e.g. `ws://broker.example.com:8080`.
    #[arg(long, env = "MINIMAL_SERVER")]
    server: String,

    /// This device's identifier. Sent as `X-Device-ID` on tunnel dial and
    /// used by the broker to route incoming sessions. A bare id is
    /// implicitly namespaced `default:<id>`; `namespace:id` is accepted
    /// verbatim.
    #[arg(long = "id", env = "MINIMAL_DEVICE_ID")]
    device_id: String,

    /// Path to this agent's OpenSSH-format private key, used as its SSH
    /// server host key. Omit to generate a fresh ephemeral RSA-2048
    /// keypair every start.
    #[arg(long = "key", env = "MINIMAL_PRIVATE_KEY")]
    private_key: Option<String>,

    /// If set, the agent's SSH server accepts only this password (any
    /// username); password auth is otherwise accept-any, and public-key
    /// auth always accepts any key regardless of this setting.
    #[arg(long = "single-pass", env = "MINIMAL_SINGLE_USER_PASSWORD")]
    single_user_password: Option<String>,

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

/// `clap`'s `required` only checks that `--server`/`--id` (or their env
/// vars) were supplied, not that they're non-blank -- `MINIMAL_SERVER=`
/// still satisfies it. Catch that case explicitly so a genuinely missing
/// value is reported as [`BrokerError::MissingParameter`] rather than
/// surfacing later as an obscure dial failure.
fn require_nonempty(name: &'static str, value: &str) -> Result<(), BrokerError> {
    if value.trim().is_empty() {
        Err(BrokerError::MissingParameter(name.to_string()))
    } else {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    require_nonempty("server", &args.server)?;
    require_nonempty("id", &args.device_id)?;

    let config = AgentClientConfig {
        server: args.server,
        device_id: args.device_id,
        private_key_path: args.private_key,
        single_user_password: args.single_user_password,
    };

    let info = AgentInfo::current();
    log::info!(
        "minibroker-agent starting, device id {}, host {} ({})",
        config.device_id,
        info.name,
        info.id
    );
    AgentClient::new(config).run_forever().await;
}
