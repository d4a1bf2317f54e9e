mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use humantime::FormattedDuration;
use tracing::info;

use blescout_discovery::Radio;
use blescout_discovery::controller::{ScanState, SweepConfig};
use blescout_discovery::local::LocalRadio;
use blescout_discovery::replay::ReplayRadio;
use blescout_domain::clock::{Clock, SystemClock, Truncate};
use blescout_domain::decoder::decode;
use blescout_domain::device::Device;
use blescout_domain::filter::{FilterCriteria, SortKey, View};
use blescout_sinks::forwarder::GatewayState;
use blescout_sinks::gateway::{DEFAULT_INTERVAL_SECONDS, DEFAULT_MQTT_PORT, GatewayConfig};

use session::Session;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// scan with this machine's Bluetooth adapter
    Local,
    /// play back sightings recorded as JSON lines
    Replay,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Sort {
    Insertion,
    Rssi,
    Name,
    FirstSeen,
    LastSeen,
}

impl From<Sort> for SortKey {
    fn from(sort: Sort) -> SortKey {
        match sort {
            Sort::Insertion => SortKey::Insertion,
            Sort::Rssi => SortKey::Rssi,
            Sort::Name => SortKey::Name,
            Sort::FirstSeen => SortKey::FirstSeen,
            Sort::LastSeen => SortKey::LastSeen,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// scan mode: local or replay
    #[arg(short, long, value_enum, default_value_t = Mode::Local)]
    mode: Mode,

    /// JSON lines file to play back in replay mode
    #[arg(long, required_if_eq("mode", "replay"))]
    replay: Option<PathBuf>,

    /// pause between replayed sightings, in milliseconds
    #[arg(long, default_value_t = 100)]
    replay_pace_ms: u64,

    /// only devices at or above this RSSI (dBm)
    #[arg(long, allow_hyphen_values = true)]
    min_rssi: Option<i16>,

    /// name substring, case-insensitive
    #[arg(long)]
    name: Option<String>,

    /// address substring, case-insensitive
    #[arg(long)]
    address: Option<String>,

    /// only devices advertising a name
    #[arg(long)]
    named_only: bool,

    /// comma separated service UUIDs (or fragments), any of which must match
    #[arg(long)]
    services: Option<String>,

    /// hex company ID, e.g. 0x004C
    #[arg(long)]
    company_id: Option<String>,

    /// raw advertisement byte pattern, hex pairs with xx wildcards
    #[arg(long)]
    pattern: Option<String>,

    #[arg(long, value_enum, default_value_t = Sort::Insertion)]
    sort: Sort,

    /// print decoded advertising data under each device
    #[arg(long)]
    decode: bool,

    /// address to keep regardless of age; repeatable
    #[arg(long)]
    favorite: Vec<String>,

    /// seconds between table refreshes
    #[arg(long, default_value_t = 2)]
    refresh_secs: u64,

    /// forward devices by POSTing JSON to this URL
    #[arg(long, conflicts_with = "mqtt_broker")]
    http: Option<String>,

    /// forward devices to this MQTT broker
    #[arg(long)]
    mqtt_broker: Option<String>,

    #[arg(long, default_value_t = DEFAULT_MQTT_PORT)]
    mqtt_port: u16,

    #[arg(long, default_value = "blescout/devices")]
    mqtt_topic: String,

    #[arg(long)]
    mqtt_tls: bool,

    #[arg(long, env = "BLESCOUT_GATEWAY_USER")]
    gateway_user: Option<String>,

    #[arg(long, env = "BLESCOUT_GATEWAY_PASSWORD", hide_env_values = true)]
    gateway_password: Option<String>,

    /// seconds between gateway publishes
    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECONDS)]
    interval: u64,
}

impl Args {
    fn view(&self) -> View {
        View::new(
            FilterCriteria {
                rssi_floor: self.min_rssi,
                name: self.name.clone(),
                address: self.address.clone(),
                named_only: self.named_only,
                service_uuids: self.services.clone(),
                company_id: self.company_id.clone(),
                raw_pattern: self.pattern.clone(),
            },
            self.sort.into(),
        )
    }

    fn gateway(&self) -> Option<GatewayConfig> {
        let config = if let Some(endpoint) = &self.http {
            GatewayConfig::http(endpoint)
        } else if let Some(broker) = &self.mqtt_broker {
            GatewayConfig::mqtt(broker, self.mqtt_port, &self.mqtt_topic, self.mqtt_tls)
        } else {
            return None;
        };
        Some(
            config
                .with_credentials(self.gateway_user.clone(), self.gateway_password.clone())
                .with_interval_seconds(self.interval),
        )
    }

    async fn radio(&self, clock: Arc<dyn Clock>) -> Result<Arc<dyn Radio>> {
        match self.mode {
            Mode::Local => {
                let radio = LocalRadio::new(clock)
                    .await
                    .context("opening Bluetooth adapter")?;
                Ok(Arc::new(radio))
            }
            Mode::Replay => {
                let Some(path) = &self.replay else {
                    bail!("--replay <file> is required in replay mode");
                };
                Ok(Arc::new(ReplayRadio::new(
                    path,
                    Duration::from_millis(self.replay_pace_ms),
                    clock,
                )))
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let radio = args.radio(Arc::clone(&clock)).await?;
    let gateway = args.gateway();
    let session = Session::start(
        radio,
        Arc::clone(&clock),
        args.view(),
        SweepConfig::default(),
        gateway.as_ref(),
    )
    .await?;

    let result = run(&session, &args, clock.as_ref()).await;
    session.shutdown().await?;
    result
}

async fn run(session: &Session, args: &Args, clock: &dyn Clock) -> Result<()> {
    let start = clock.now();
    let mut refresh = tokio::time::interval(Duration::from_secs(args.refresh_secs.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("listening for ctrl-c")?;
                info!("interrupted, shutting down");
                return Ok(());
            }
            _ = refresh.tick() => {}
        }

        session.mark_favorites(&args.favorite);
        print_scan_results(session, clock.now(), start, args.decode);

        let status = session.scan_status();
        if status.state == ScanState::Idle {
            match status.last_error {
                Some(err) => bail!("scan ended: {err}"),
                None => {
                    info!("scan ended");
                    return Ok(());
                }
            }
        }
    }
}

fn print_scan_results(session: &Session, now: DateTime<Utc>, start: DateTime<Utc>, decoded: bool) {
    println!(
        "\n=== Scan Results at {} (Runtime: {}) ===",
        now,
        age(now - start)
    );
    println!("Gateway: {}", gateway_summary(&session.gateway_state()));

    let (named, anonymous): (Vec<Device>, Vec<Device>) = session
        .table()
        .into_iter()
        .partition(|d| d.display_name().is_some());

    if !named.is_empty() {
        println!("\nNamed Devices:");
        print_table("Name", &named, now, decoded, |d| {
            d.display_name().unwrap_or_default().to_string()
        });
    }
    if !anonymous.is_empty() {
        println!("\nAnonymous Devices:");
        print_table("Address", &anonymous, now, decoded, |d| d.address.clone());
    }

    println!(
        "\nShown: {} (Named: {}, Anonymous: {}) of {} tracked",
        named.len() + anonymous.len(),
        named.len(),
        anonymous.len(),
        session.reader().len()
    );
}

fn print_table<F>(label: &str, devices: &[Device], now: DateTime<Utc>, decoded: bool, title: F)
where
    F: Fn(&Device) -> String,
{
    println!("{:<32} {:>6} {:>4} {:>8}", label, "Age", "RSSI", "Tracked");
    println!("{}", "-".repeat(54));
    for device in devices {
        let marker = if device.favorite { "*" } else { "" };
        println!(
            "{:<32} {:>6} {:>4} {:>8}",
            format!("{marker}{}", title(device)),
            age(now - device.last_seen),
            device.rssi,
            age(now - device.first_seen)
        );
        if decoded {
            for line in decode(&device.advertising).lines {
                println!("    {line}");
            }
        }
    }
}

fn age(elapsed: chrono::Duration) -> FormattedDuration {
    humantime::format_duration(elapsed.truncate_to_seconds().to_std().unwrap_or_default())
}

fn gateway_summary(state: &GatewayState) -> String {
    match state {
        GatewayState::Disabled => "off".to_string(),
        GatewayState::AwaitingConnection => "connecting".to_string(),
        GatewayState::Connected {
            last_publish,
            next_publish_in,
        } => format!("last publish {last_publish}, next in {next_publish_in}s"),
        GatewayState::Error(message) => format!("error: {message}"),
    }
}
