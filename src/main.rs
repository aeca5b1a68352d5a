use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use parkwatch::{
    dispatch::{ActionDispatcher, KakaoSearch, SearchOptions},
    indicator::{indicator_manager, Led, LightAction},
    message_handler::{message_handler, MessageHandler},
    mqtt_handler::{MqttProcessor, MqttProcessorOptions},
    tracking::TrackingState,
    watchdog::{watchdog_runner, WatchdogConfig},
    PublishableMessage,
};
use rumqttc::v5::AsyncClient;
use tokio::{signal, sync::mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// parkwatch command line arguments
#[derive(Parser, Debug)]
#[command(version)]
struct ParkwatchArgs {
    /// The MQTT broker, host:port
    #[arg(
        short = 'u',
        long,
        default_value = "localhost:1883",
        env = "PARKWATCH_MQTT_URL"
    )]
    mqtt_url: String,

    /// The MQTT client id, generated if not given
    #[arg(long, env = "PARKWATCH_CLIENT_ID")]
    client_id: Option<String>,

    /// The telemetry topic to subscribe to
    #[arg(
        short = 't',
        long,
        default_value = "vehicle/telemetry",
        env = "PARKWATCH_TOPIC"
    )]
    topic: String,

    /// CA certificate of the broker, enables TLS
    #[arg(long, env = "PARKWATCH_CA_PATH")]
    ca_path: Option<String>,

    /// Client certificate for mutual TLS
    #[arg(long, env = "PARKWATCH_CERT_PATH")]
    cert_path: Option<String>,

    /// Client private key for mutual TLS
    #[arg(long, env = "PARKWATCH_KEY_PATH")]
    key_path: Option<String>,

    /// Publish the places found when the vehicle parks to this topic
    #[arg(short = 'r', long, env = "PARKWATCH_RESULT_TOPIC")]
    result_topic: Option<String>,

    /// Seconds of silence while abnormal before the park timer starts
    #[arg(long, default_value_t = 20, env = "PARKWATCH_SILENCE_SECS")]
    silence_secs: u64,

    /// Seconds the park timer runs before the vehicle is judged parked
    #[arg(long, default_value_t = 300, env = "PARKWATCH_TIMER_SECS")]
    timer_secs: u64,

    /// Milliseconds between watchdog polls
    #[arg(long, default_value_t = 1000, env = "PARKWATCH_POLL_MS")]
    poll_ms: u64,

    /// MQ readings above this blink the gas light
    #[arg(long, default_value_t = 800.0, env = "PARKWATCH_GAS_THRESHOLD")]
    gas_threshold: f64,

    /// sysfs directory of the gas LED, ex. /sys/class/leds/gas
    #[arg(long, env = "PARKWATCH_GAS_LED")]
    gas_led: Option<PathBuf>,

    /// sysfs directory of the route LED
    #[arg(long, env = "PARKWATCH_ROUTE_LED")]
    route_led: Option<PathBuf>,

    /// The keyword search endpoint
    #[arg(
        long,
        default_value = "https://dapi.kakao.com/v2/local/search/keyword.json",
        env = "PARKWATCH_SEARCH_URL"
    )]
    search_url: String,

    /// REST API key of the keyword search
    #[arg(short = 'k', long, env = "PARKWATCH_SEARCH_KEY")]
    search_key: String,

    /// Keyword to search for around the parked location
    #[arg(long, default_value = "술집", env = "PARKWATCH_SEARCH_QUERY")]
    search_query: String,

    /// Search radius in metres
    #[arg(long, default_value_t = 1000, env = "PARKWATCH_SEARCH_RADIUS")]
    search_radius: u32,

    /// Maximum places returned by a search
    #[arg(long, default_value_t = 10, env = "PARKWATCH_SEARCH_SIZE")]
    search_size: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = ParkwatchArgs::parse();

    println!("Initializing parkwatch...");
    println!("Initializing fmt subscriber");
    // construct a subscriber that prints formatted traces to stdout
    // if RUST_LOG is not set, defaults to loglevel INFO
    let subscriber = tracing_subscriber::fmt()
        .with_thread_ids(true)
        .with_ansi(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber)?;

    let watchdog_config = WatchdogConfig {
        silence_threshold: Duration::from_secs(cli.silence_secs),
        timer_duration: Duration::from_secs(cli.timer_secs),
        poll_period: Duration::from_millis(cli.poll_ms.max(1)),
    };

    // channel to pass the mqtt data
    let (mqtt_sender_tx, mqtt_sender_rx) = mpsc::channel::<PublishableMessage>(100);
    let (payload_tx, payload_rx) = mpsc::channel::<Vec<u8>>(1000);
    let (gas_light_tx, gas_light_rx) = mpsc::channel::<LightAction>(4);
    let (route_light_tx, route_light_rx) = mpsc::channel::<LightAction>(4);

    let task_tracker = TaskTracker::new();
    let token = CancellationToken::new();
    let state = TrackingState::new();

    let search = KakaoSearch::new(SearchOptions {
        url: cli.search_url,
        api_key: cli.search_key,
        query: cli.search_query,
        size: cli.search_size,
        timeout: Duration::from_secs(10),
    })?;
    let mut dispatcher = ActionDispatcher::new(search, cli.search_radius);
    if let Some(result_topic) = cli.result_topic {
        dispatcher = dispatcher.with_publisher(result_topic, mqtt_sender_tx.clone());
    }
    drop(mqtt_sender_tx);

    info!("Running MQTT processor");
    let (recv, opts) = MqttProcessor::new(
        token.clone(),
        mqtt_sender_rx,
        payload_tx,
        MqttProcessorOptions {
            mqtt_path: cli.mqtt_url,
            client_id: cli.client_id,
            topic: cli.topic,
            ca_path: cli.ca_path,
            cert_path: cli.cert_path,
            key_path: cli.key_path,
        },
    )?;
    let (client, eventloop) = AsyncClient::new(opts, 100);
    let client_sharable: Arc<AsyncClient> = Arc::new(client);
    task_tracker.spawn(recv.process_mqtt(client_sharable.clone(), eventloop));

    // TASK SPAWNING

    info!("Running indicator lights");
    task_tracker.spawn(indicator_manager(
        token.clone(),
        gas_light_rx,
        Led::new("gas", cli.gas_led),
    ));
    task_tracker.spawn(indicator_manager(
        token.clone(),
        route_light_rx,
        Led::new("route", cli.route_led),
    ));

    info!("Running message handler");
    task_tracker.spawn(message_handler(
        token.clone(),
        payload_rx,
        MessageHandler::new(state.clone(), cli.gas_threshold)
            .with_lights(gas_light_tx, route_light_tx),
    ));

    info!("Running watchdog");
    task_tracker.spawn(watchdog_runner(
        token.clone(),
        state.clone(),
        Arc::new(dispatcher).into_callback(),
        watchdog_config,
    ));

    task_tracker.close();

    info!("Initialization complete, ready...");
    info!("Use Ctrl+C or SIGINT to exit cleanly!");

    // listen for ctrl_c, then cancel, close, and await for all tasks in the tracker.
    signal::ctrl_c().await?;
    info!("Received exit signal, shutting down!");
    token.cancel();
    task_tracker.wait().await;
    Ok(())
}
