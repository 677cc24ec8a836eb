//! Outreach Express — outbound campaign dispatch and delivery tracking
//! over a WhatsApp-style channel provider.
//!
//! Main entry point that wires the stores, engines, worker pool, and
//! HTTP surface together.

use clap::Parser;
use outreach_api::{ApiServer, AppState};
use outreach_audience::AudienceResolver;
use outreach_channel::{ChannelClient, ChannelClientConfig, LoopbackTransport, SendGate};
use outreach_core::clock::system_clock;
use outreach_core::config::AppConfig;
use outreach_core::event_bus::noop_sink;
use outreach_core::store::Store;
use outreach_dispatch::{
    CampaignEngine, DeliveryTracker, Dispatcher, RetryPolicy, TaskPolicies, TaskQueue, WorkerPool,
};
use outreach_sequence::SequenceRunner;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "outreach-express")]
#[command(about = "Outbound campaign dispatch and delivery tracking engine")]
#[command(version)]
struct Cli {
    /// HTTP port (overrides config)
    #[arg(long, env = "OUTREACH__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Worker pool size (overrides config)
    #[arg(long, env = "OUTREACH__QUEUE__WORKERS")]
    workers: Option<usize>,

    /// Channel session used for scheduled campaigns (overrides config)
    #[arg(long, env = "OUTREACH__CHANNEL__DEFAULT_SESSION")]
    session: Option<String>,

    /// Skip the scheduled-campaign poller (API-only mode)
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outreach=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Outreach Express starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(workers) = cli.workers {
        config.queue.workers = workers;
    }
    if let Some(session) = cli.session {
        config.channel.default_session = session;
    }

    info!(
        http_port = config.api.http_port,
        workers = config.queue.workers,
        channel_base_url = %config.channel.base_url,
        default_session = %config.channel.default_session,
        messages_per_minute = config.rate_limits.messages_per_minute,
        "Configuration loaded"
    );

    let clock = system_clock();
    let store = Arc::new(Store::new(clock.clone()));
    let event_sink = noop_sink();

    // Channel path: shared rate gate, transport, retrying client.
    let gate = Arc::new(SendGate::new(
        clock.clone(),
        config.rate_limits.messages_per_minute,
        config.rate_limits.messages_per_hour,
    ));
    // The provider HTTP transport plugs in here; loopback logs sends for
    // development installs.
    let transport = Arc::new(LoopbackTransport);
    let client = Arc::new(ChannelClient::new(
        transport,
        gate,
        ChannelClientConfig::from_app(&config),
    ));

    // Engines
    let resolver = Arc::new(AudienceResolver::new(store.clone()));
    let tracker = Arc::new(
        DeliveryTracker::new(store.clone(), clock.clone()).with_event_sink(event_sink.clone()),
    );
    let (queue, receiver) = TaskQueue::new();
    let engine = Arc::new(
        CampaignEngine::new(
            store.clone(),
            resolver.clone(),
            client.clone(),
            tracker.clone(),
            queue.clone(),
            clock.clone(),
            Duration::from_secs(config.rate_limits.message_delay_secs),
        )
        .with_event_sink(event_sink.clone()),
    );
    let runner = Arc::new(
        SequenceRunner::new(
            store.clone(),
            client.clone(),
            tracker.clone(),
            queue.clone(),
            clock.clone(),
        )
        .with_event_sink(event_sink.clone()),
    );

    // Worker pool
    let dispatcher = Arc::new(Dispatcher::new(engine.clone()).with_sequence_handler(runner.clone()));
    let policies = TaskPolicies::uniform(RetryPolicy::from_config(&config.queue));
    let _pool = WorkerPool::start(
        config.queue.workers,
        receiver,
        queue.clone(),
        dispatcher,
        policies,
    );

    // Scheduled-campaign poller
    if !cli.api_only {
        let engine_for_poller = engine.clone();
        let session = config.channel.default_session.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                for campaign in engine_for_poller.due_campaigns() {
                    info!(campaign_id = %campaign.id, "Starting scheduled campaign");
                    if let Err(e) = engine_for_poller.start(&campaign.id, &session) {
                        error!(campaign_id = %campaign.id, error = %e, "Failed to start scheduled campaign");
                    }
                }
            }
        });
    } else {
        info!("Running in API-only mode (no scheduled-campaign poller)");
    }

    // HTTP surface
    let state = AppState {
        store,
        engine,
        resolver,
        runner,
        tracker,
        event_sink,
        default_session: config.channel.default_session.clone(),
        start_time: Instant::now(),
    };
    let api_server = ApiServer::new(config, state);

    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    api_server.start_http().await
}
