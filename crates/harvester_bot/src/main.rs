mod commands;
mod config;
mod listener;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use engine_logging::{engine_error, engine_info, engine_warn};
use harvester_engine::{
    ChromiumBackend, DeliveryEngine, Harvester, RateLimiter, ReqwestFetcher, RenderingFallback,
    RetryingHarvester, Scheduler, SiteExtractor, SqliteStore, Store, TelegramClient, Transport,
};
use tokio_util::sync::CancellationToken;

use crate::commands::CommandHandler;
use crate::listener::Listener;

/// Upper bound on each shutdown step that waits for in-flight work.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load().context("loading configuration")?;
    engine_logging::initialize(&config.logging);
    engine_info!(
        "harvester bot starting version={} db={}",
        env!("CARGO_PKG_VERSION"),
        config.store.db_path.display()
    );

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.store.db_path)
            .await
            .with_context(|| format!("opening store at {}", config.store.db_path.display()))?,
    );

    let telegram = Arc::new(
        TelegramClient::new(&config.telegram_settings()).context("building Telegram client")?,
    );
    match telegram.get_me().await {
        Ok(me) => engine_info!(
            "authorized as @{} id={}",
            me.username.as_deref().unwrap_or("?"),
            me.id
        ),
        Err(err) => engine_warn!("could not verify bot identity error={}", err),
    }
    let transport: Arc<dyn Transport> = telegram.clone();

    let fetcher = Arc::new(ReqwestFetcher::new(config.fetch_settings()).context("building fetcher")?);
    let renderer = Arc::new(RenderingFallback::new(
        Arc::new(ChromiumBackend::new(config.chromium_settings())),
        config.render_settings(),
    ));
    let extractor = Arc::new(SiteExtractor::new(config.crawler.base_url.clone()));
    let harvester: Arc<dyn Harvester> = Arc::new(RetryingHarvester::new(
        fetcher,
        renderer,
        extractor,
        RateLimiter::new(config.crawler.rate_limit).context("crawler rate limit")?,
        config.harvest_settings(),
    ));

    let delivery = Arc::new(DeliveryEngine::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        RateLimiter::new(config.delivery.send_rate).context("delivery send rate")?,
        config.delivery_settings(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&harvester),
        Arc::clone(&store),
        delivery,
        config.scheduler_settings(),
    ));

    // Cancels everything still running; the listener has its own token so it
    // can stop before in-flight reports are cut short.
    let shutdown = CancellationToken::new();
    let listener_stop = CancellationToken::new();

    if config.crawler.enabled {
        scheduler.start(&shutdown);
    } else {
        engine_info!("scheduled harvesting disabled");
    }

    let handler = Arc::new(CommandHandler::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&scheduler),
        shutdown.clone(),
    ));
    let listener = Listener::new(telegram, handler, config.listener_settings());
    let listener_task = tokio::spawn(listener.run(listener_stop.clone()));

    wait_for_signal().await;
    engine_info!("shutdown requested");

    {
        let stopping = scheduler.stop();
        tokio::pin!(stopping);
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut stopping)
            .await
            .is_err()
        {
            engine_warn!("scheduler did not stop in time, cancelling the running cycle");
            shutdown.cancel();
            stopping.await;
        }
    }

    listener_stop.cancel();
    let mut reports = match listener_task.await {
        Ok(reports) => reports,
        Err(err) => {
            engine_error!("listener task ended abnormally error={}", err);
            tokio::task::JoinSet::new()
        }
    };

    if !reports.is_empty() {
        engine_info!("waiting for {} crawl report(s)", reports.len());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while reports.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            engine_warn!("crawl reports still pending, cancelling them");
            shutdown.cancel();
            reports.shutdown().await;
        }
    }

    shutdown.cancel();
    harvester.close().await;
    drop(scheduler);
    drop(store);
    engine_info!("harvester bot stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            engine_warn!("SIGTERM handler unavailable error={}", err);
            if let Err(err) = tokio::signal::ctrl_c().await {
                engine_error!("ctrl-c handler failed error={}", err);
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                engine_error!("ctrl-c handler failed error={}", err);
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        engine_error!("ctrl-c handler failed error={}", err);
    }
}
