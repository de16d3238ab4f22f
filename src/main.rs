use anyhow::Context;
use clap::Parser;
use ratewatch::adapters::{PostgresStore, RedisCache, RedisTriggerStream, SettlementClient};
use ratewatch::cli::{print_item, print_transfers, Cli, Commands, OutputMode};
use ratewatch::config::AppConfig;
use ratewatch::coordination::{install_signal_handlers, GracefulShutdown, ShutdownConfig};
use ratewatch::domain::NewTransfer;
use ratewatch::engine::{ExecutionProcessor, PendingSweeper, TriggerConsumer};
use ratewatch::services::TransferService;
use std::sync::Arc;
use tracing::{error, info, warn};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mode = OutputMode::from_json_flag(cli.json);

    let config = AppConfig::load_from(&cli.config).context("failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config error: {e}");
        }
        anyhow::bail!("invalid configuration ({} errors)", errors.len());
    }

    match cli.command {
        Commands::Worker { no_sweeper } => {
            init_logging(&config.logging);
            run_worker(config, !no_sweeper).await?;
        }
        Commands::Migrate => {
            init_logging(&config.logging);
            let store = connect_store(&config).await?;
            store.migrate().await?;
            store.close().await;
        }
        Commands::Create {
            user,
            from,
            to,
            from_network,
            to_network,
            amount,
            target_rate,
            direction,
            expires_in,
            idempotency_key,
        } => {
            init_logging_simple();
            let (service, store) = transfer_service(&config).await?;
            let transfer = service
                .create_order(NewTransfer {
                    user_id: user,
                    from_currency: from,
                    to_currency: to,
                    from_network,
                    to_network,
                    amount,
                    target_rate,
                    direction,
                    expires_at: chrono::Utc::now() + chrono::Duration::minutes(expires_in),
                    idempotency_key: idempotency_key
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                })
                .await?;
            print_item(&transfer, mode)?;
            store.close().await;
        }
        Commands::List { user, page } => {
            init_logging_simple();
            let (service, store) = transfer_service(&config).await?;
            let transfers = service.list_orders(user, page).await?;
            print_transfers(&transfers, mode)?;
            store.close().await;
        }
        Commands::Show { user, order_id } => {
            init_logging_simple();
            let (service, store) = transfer_service(&config).await?;
            let transfer = service.get_order(user, order_id).await?;
            print_item(&transfer, mode)?;
            store.close().await;
        }
        Commands::Cancel { user, order_id } => {
            init_logging_simple();
            let (service, store) = transfer_service(&config).await?;
            let transfer = service.cancel_order(user, order_id).await?;
            print_item(&transfer, mode)?;
            store.close().await;
        }
        Commands::Evaluate { order_id } => {
            init_logging(&config.logging);
            let store = Arc::new(connect_store(&config).await?);
            let cache = connect_cache(&config).await?;
            let processor = build_processor(&config, store.clone(), cache)?;
            let evaluation = processor.evaluate(order_id).await;
            println!("{}: {}", evaluation.order_id, evaluation.outcome);
            store.close().await;
        }
    }

    Ok(())
}

async fn connect_store(config: &AppConfig) -> anyhow::Result<PostgresStore> {
    PostgresStore::new(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")
}

async fn transfer_service(config: &AppConfig) -> anyhow::Result<(TransferService, Arc<PostgresStore>)> {
    let store = Arc::new(connect_store(config).await?);
    let stream = RedisTriggerStream::connect(&config.redis.url, &config.trigger)
        .await
        .context("failed to connect to the trigger stream")?;
    let service = TransferService::new(store.clone(), Arc::new(stream), &config.engine);
    Ok((service, store))
}

async fn connect_cache(config: &AppConfig) -> anyhow::Result<Arc<RedisCache>> {
    let cache = RedisCache::connect(&config.redis.url)
        .await
        .context("failed to connect to Redis")?;
    Ok(Arc::new(cache))
}

fn build_processor(
    config: &AppConfig,
    store: Arc<PostgresStore>,
    cache: Arc<RedisCache>,
) -> anyhow::Result<ExecutionProcessor> {
    let settlement = SettlementClient::new(&config.settlement)?;

    Ok(ExecutionProcessor::new(
        store.clone(),
        store,
        cache,
        Arc::new(settlement),
        config.engine.clone(),
    ))
}

async fn run_worker(config: AppConfig, with_sweeper: bool) -> anyhow::Result<()> {
    info!(
        stream = %config.trigger.stream,
        consumer = %config.trigger.consumer,
        concurrency = config.trigger.concurrency,
        "Starting ratewatch worker"
    );

    let store = Arc::new(connect_store(&config).await?);
    let stream = Arc::new(
        RedisTriggerStream::connect(&config.redis.url, &config.trigger)
            .await
            .context("failed to connect to the trigger stream")?,
    );
    let cache = connect_cache(&config).await?;
    let processor = Arc::new(build_processor(&config, store.clone(), cache.clone())?);

    let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig::default()));
    install_signal_handlers(shutdown.clone());

    let consumer = TriggerConsumer::new(stream.clone(), processor, &config.trigger);
    let consumer_token = shutdown.token();
    let consumer_task = tokio::spawn(async move { consumer.run(consumer_token).await });

    let sweeper_task = with_sweeper.then(|| {
        let sweeper = PendingSweeper::new(store.clone(), stream.clone(), cache, &config.engine);
        let token = shutdown.token();
        tokio::spawn(async move { sweeper.run(token).await })
    });

    let mut token = shutdown.token();
    let signal = token.wait_for_shutdown().await;
    info!("Worker shutting down ({})", signal);

    let drain = async {
        match consumer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Trigger consumer failed: {}", e),
            Err(e) => error!("Trigger consumer task panicked: {}", e),
        }
        if let Some(task) = sweeper_task {
            if let Err(e) = task.await {
                error!("Sweeper task panicked: {}", e);
            }
        }
    };
    let close = store.close();

    if let Err(e) = shutdown.execute(drain, close).await {
        warn!("Shutdown finished with: {}", e);
    }
    Ok(())
}
