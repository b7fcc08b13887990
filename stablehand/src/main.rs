use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use furlong::{Broker, Consumer, Provider, RoutingPublisher, resolve_provider};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use stablehand::config::{Args, Command, Config};
use stablehand::lifecycle::{DomainWork, RequestProcessor};
use stablehand::processors::{
    BreedingProcessor, FeedingProcessor, RacingProcessor, RandomNameGenerator, TrainingProcessor,
};
use stablehand::reaper::StuckRequestReaper;
use stablehand::replay::{ReplayAllOptions, ReplayController, ReplayOutcome};
use stablehand::store::PostgresStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stablehand=info,furlong=info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args)?;
    if args.validate {
        println!("configuration OK");
        return Ok(());
    }

    let provider = resolve_provider(&config.message_bus.routing, &config.connection_strings)?;
    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow!("no database configured"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to the database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    let store = Arc::new(PostgresStore::new(pool));

    match args.command {
        Some(Command::Replay {
            service,
            request_id,
        }) => {
            let controller = replay_controller(provider, &config, store)?;
            match controller.replay(service, request_id).await? {
                ReplayOutcome::Published => {
                    println!("republished {service} request {request_id}")
                }
                ReplayOutcome::NotFound => println!("{service} request {request_id} not found"),
            }
            Ok(())
        }
        Some(Command::ReplayAll {
            service,
            max_parallel,
            include_stuck,
        }) => {
            let controller = replay_controller(provider, &config, store)?;
            let options = ReplayAllOptions {
                max_parallel,
                include_stuck_after: include_stuck
                    .then(|| Duration::from_secs(config.worker.stuck_after_secs)),
            };
            let published = controller.replay_all_non_complete(service, options).await?;
            println!("republished {published} {service} request(s)");
            Ok(())
        }
        None => run_workers(provider, config, store).await,
    }
}

async fn run_workers(
    provider: Provider,
    config: Config,
    store: Arc<PostgresStore>,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let mut watchers = Vec::new();

    watchers.push(
        start_domain(
            BreedingProcessor::new(store.clone(), Arc::new(RandomNameGenerator)),
            provider,
            &config,
            store.clone(),
            shutdown.clone(),
        )
        .await?,
    );
    watchers.push(
        start_domain(
            FeedingProcessor::new(store.clone()),
            provider,
            &config,
            store.clone(),
            shutdown.clone(),
        )
        .await?,
    );
    watchers.push(
        start_domain(
            TrainingProcessor::new(store.clone()),
            provider,
            &config,
            store.clone(),
            shutdown.clone(),
        )
        .await?,
    );
    watchers.push(
        start_domain(
            RacingProcessor::new(store.clone()),
            provider,
            &config,
            store.clone(),
            shutdown.clone(),
        )
        .await?,
    );

    let reaper = StuckRequestReaper::new(
        store.clone(),
        Duration::from_secs(config.worker.stuck_after_secs),
        Duration::from_secs(config.worker.reaper_interval_secs),
        shutdown.clone(),
    );
    tokio::spawn(reaper.run());

    tracing::info!("workers running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    shutdown.cancel();
    for watcher in watchers {
        let _ = watcher.await;
    }
    Ok(())
}

/// Wire one domain: broker, routing publisher, lifecycle processor, consumer.
/// Returns a watcher task that stops the consumer on shutdown.
async fn start_domain<W>(
    work: W,
    provider: Provider,
    config: &Config,
    store: Arc<PostgresStore>,
    shutdown: CancellationToken,
) -> anyhow::Result<JoinHandle<()>>
where
    W: DomainWork + 'static,
{
    let consumer_config = config.consumer_for(W::SERVICE);
    let broker = build_broker(provider, config, &consumer_config)?;
    let publisher = Arc::new(RoutingPublisher::new(
        broker.clone(),
        config.message_bus.routing.clone(),
    ));
    let processor = Arc::new(RequestProcessor::new(work, store, publisher));
    let consumer = Consumer::new(broker, processor, consumer_config, shutdown.clone());
    consumer.start().await?;
    tracing::info!(service = %W::SERVICE, "consumer started");

    Ok(tokio::spawn(async move {
        shutdown.cancelled().await;
        consumer.stop().await;
    }))
}

fn replay_controller(
    provider: Provider,
    config: &Config,
    store: Arc<PostgresStore>,
) -> anyhow::Result<ReplayController<PostgresStore>> {
    let broker = build_publisher_broker(provider, config)?;
    let publisher = Arc::new(RoutingPublisher::new(
        broker,
        config.message_bus.routing.clone(),
    ));
    Ok(ReplayController::new(store, publisher))
}

fn build_broker(
    provider: Provider,
    config: &Config,
    consumer: &furlong::ConsumerConfig,
) -> anyhow::Result<Arc<dyn Broker>> {
    match provider {
        Provider::Rabbit => build_rabbit(config, Some(consumer)),
        Provider::ServiceBus => build_servicebus(config, Some(consumer)),
    }
}

fn build_publisher_broker(
    provider: Provider,
    config: &Config,
) -> anyhow::Result<Arc<dyn Broker>> {
    match provider {
        Provider::Rabbit => build_rabbit(config, None),
        Provider::ServiceBus => build_servicebus(config, None),
    }
}

#[cfg(feature = "rabbit")]
fn build_rabbit(
    config: &Config,
    consumer: Option<&furlong::ConsumerConfig>,
) -> anyhow::Result<Arc<dyn Broker>> {
    use furlong::{RabbitBroker, RabbitOptions};

    let uri = config
        .connection_strings
        .messaging
        .clone()
        .ok_or_else(|| anyhow!("`connection_strings.messaging` is required for rabbit"))?;
    let options = match consumer {
        Some(consumer) => {
            let mut options = RabbitOptions::from_consumer(&config.worker.exchange, consumer);
            options.dead_letter_exchange = config.worker.dead_letter_exchange.clone();
            options
        }
        None => RabbitOptions::publisher(&config.worker.exchange),
    };
    Ok(Arc::new(RabbitBroker::new(uri, options)))
}

#[cfg(not(feature = "rabbit"))]
fn build_rabbit(
    _config: &Config,
    _consumer: Option<&furlong::ConsumerConfig>,
) -> anyhow::Result<Arc<dyn Broker>> {
    Err(anyhow!("this binary was built without the `rabbit` feature"))
}

#[cfg(feature = "servicebus")]
fn build_servicebus(
    config: &Config,
    consumer: Option<&furlong::ConsumerConfig>,
) -> anyhow::Result<Arc<dyn Broker>> {
    use furlong::{ServiceBusBroker, ServiceBusOptions};

    let connection_string = config
        .connection_strings
        .servicebus
        .clone()
        .ok_or_else(|| anyhow!("`connection_strings.servicebus` is required for servicebus"))?;
    let options = match consumer {
        Some(consumer) => ServiceBusOptions::from_consumer(consumer),
        None => ServiceBusOptions::new(
            config
                .message_bus
                .routing
                .default_destination
                .clone()
                .unwrap_or_else(|| config.worker.exchange.clone()),
        ),
    };
    Ok(Arc::new(ServiceBusBroker::new(connection_string, options)))
}

#[cfg(not(feature = "servicebus"))]
fn build_servicebus(
    _config: &Config,
    _consumer: Option<&furlong::ConsumerConfig>,
) -> anyhow::Result<Arc<dyn Broker>> {
    Err(anyhow!(
        "this binary was built without the `servicebus` feature"
    ))
}
