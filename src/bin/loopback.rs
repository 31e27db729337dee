//! HAPI Loopback Binary
//!
//! Runs a server endpoint and a plugin endpoint against one in-process
//! broker and exercises the handshake, a query, a table upload and a
//! server-initiated fetch.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossbeam::channel;
use tracing_subscriber::{fmt, EnvFilter};

use hapi::config::{default_queue_address, DEFAULT_BROKER_URL};
use hapi::protocol::{MonitoringServerInfo, Record};
use hapi::transport::Broker;
use hapi::{
    on_outcome, ArmPluginGate, CommandCode, CommandOutcome, CommandRequest, Config, EntityKind,
    EntityStore, HapiError, InMemoryBroker, ItemData, ItemTable, ItemValue, MemoryEntityStore,
    PluginInterface, ResponseCode, Role,
};

/// HAPI loopback demo
#[derive(Parser, Debug)]
#[command(name = "hapi-loopback")]
#[command(about = "Exercise a server/plugin pair over an in-process broker")]
#[command(version)]
struct Args {
    /// Broker URL
    #[arg(short, long, default_value = DEFAULT_BROKER_URL)]
    broker_url: String,

    /// Queue address (defaults to hap-pipe-<server id>)
    #[arg(long = "hapi-queue-addr")]
    hapi_queue_addr: Option<String>,

    /// Monitoring server id
    #[arg(short, long, default_value = "1")]
    server_id: u32,

    /// Seconds to wait for each step
    #[arg(short, long, default_value = "5")]
    timeout: u64,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hapi=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("HAPI loopback v{}", hapi::VERSION);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Loopback failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> hapi::Result<()> {
    let queue = args
        .hapi_queue_addr
        .clone()
        .unwrap_or_else(|| default_queue_address(args.server_id));
    let wait = Duration::from_secs(args.timeout);
    tracing::info!("Broker {} / queue {}", args.broker_url, queue);

    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(&args.broker_url));
    let config = |role| {
        Config::builder()
            .broker_url(&args.broker_url)
            .queue_address(&queue)
            .role(role)
            .receive_poll_ms(50)
            .reconnect_interval_ms(500)
            .build()
    };

    let store = Arc::new(MemoryEntityStore::new(MonitoringServerInfo {
        server_id: args.server_id,
        host_name: "zbx1".to_string(),
        ip_address: "127.0.0.1".to_string(),
        nickname: "loopback".to_string(),
        port: 10051,
        polling_interval_sec: 30,
        retry_interval_sec: 10,
        ..Default::default()
    }));
    let server = PluginInterface::new(config(Role::Server), Arc::clone(&broker))?;
    let gate = ArmPluginGate::new(server, Arc::clone(&store) as Arc<dyn EntityStore>)?;

    let plugin = PluginInterface::new(config(Role::Plugin), broker)?;
    plugin.register_command_handler(CommandCode::ReqFetchItems, |request: &CommandRequest<'_>| {
        let mut items = ItemTable::new();
        items.push(vec![
            ItemData::new(1, ItemValue::UInt64(1001)),
            ItemData::new(2, ItemValue::Double(0.25)),
        ]);
        request.reply_table(ResponseCode::Items, &items)
    });

    gate.start()?;
    plugin.start()?;
    let result = exchange(&gate, &plugin, wait);

    plugin.exit_sync();
    gate.exit_sync();
    result?;

    let hosts = store.fetch(EntityKind::Hosts)?;
    tracing::info!("Server stored {} host rows", hosts.len());
    Ok(())
}

fn exchange(gate: &ArmPluginGate, plugin: &PluginInterface, wait: Duration) -> hapi::Result<()> {
    if !plugin.wait_initiated(wait) {
        return Err(HapiError::HandshakeTimeout(wait.as_millis() as u64));
    }

    let (tx, rx) = channel::bounded(1);
    plugin.send(
        CommandCode::GetMonitoringServerInfo,
        &[],
        Some(on_outcome(move |outcome: CommandOutcome| {
            let _ = tx.send(outcome.into_body());
        })),
    )?;
    let body = recv(&rx, wait)??;
    let info = MonitoringServerInfo::decode(&body)?;
    tracing::info!("Monitoring server {} at {}", info.host_name, info.ip_address);

    let mut hosts = ItemTable::new();
    hosts.push(vec![
        ItemData::new(10, ItemValue::UInt64(10084)),
        ItemData::new(11, ItemValue::String("web01".to_string())),
    ]);
    hosts.push(vec![
        ItemData::new(10, ItemValue::UInt64(10085)),
        ItemData::new(11, ItemValue::String("db01".to_string())),
    ]);
    let (tx, rx) = channel::bounded(1);
    plugin.send_table(
        CommandCode::SendHosts,
        &hosts,
        Some(on_outcome(move |outcome: CommandOutcome| {
            let _ = tx.send(outcome.code());
        })),
    )?;
    tracing::info!("SendHosts acknowledged with {:?}", recv(&rx, wait)?);

    let (tx, rx) = channel::bounded(1);
    gate.request_fetch_items(move |items| {
        let _ = tx.send(items);
    })?;
    let items = recv(&rx, wait)??;
    tracing::info!("Plugin returned {} item rows", items.len());
    Ok(())
}

fn recv<T>(rx: &channel::Receiver<T>, wait: Duration) -> hapi::Result<T> {
    rx.recv_timeout(wait)
        .map_err(|e| HapiError::Transport(format!("no reply: {}", e)))
}
