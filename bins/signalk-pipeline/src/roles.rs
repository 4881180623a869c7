//! Role wiring: read one config, open its buses and run the stage until
//! its input ends or shutdown is requested.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use signalk_bus::{run_filter, FilterConfig, Publisher, Subscriber};
use signalk_connectors::{ConnectorConfig, RawEmitter};
use signalk_core::config::load;
use signalk_core::RateLimitFilter;
use signalk_mapper::{run_mapper, ExpressionStage, MapperConfig};
use signalk_server::{run_server, ServerConfig};
use signalk_store::replay::load_mapped;
use signalk_store::{
    group_deltas, replay, run_retention, run_store_writer, MqttBridge, StoreConfig,
    TransferConfig,
};

const RETENTION_CHECK: Duration = Duration::from_secs(3600);

/// Time given to stream writers to flush the end-of-stream marker.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Run `stage` until it completes or `shutdown` resolves. On shutdown the
/// publishers are closed so downstream stages see end of stream, and
/// `None` is returned.
pub async fn until_shutdown<T>(
    stage: impl Future<Output = T>,
    shutdown: impl Future<Output = ()>,
    publishers: &[&Publisher],
) -> Option<T> {
    tokio::select! {
        out = stage => Some(out),
        _ = shutdown => {
            info!(publishers = publishers.len(), "shutdown requested");
            for publisher in publishers {
                publisher.close();
            }
            if !publishers.is_empty() {
                tokio::time::sleep(CLOSE_GRACE).await;
            }
            None
        }
    }
}

pub async fn connector(path: &Path, shutdown: impl Future<Output = ()>) -> Result<()> {
    let config: ConnectorConfig = load(path).context("loading connector config")?;
    let publisher = config
        .bus
        .publisher()
        .await
        .context("binding raw publisher")?;
    let connector: Arc<dyn signalk_connectors::Connector> =
        Arc::from(signalk_connectors::build(&config).context("building connector")?);
    let emitter = RawEmitter::new(&config.name, &config.protocol, publisher.clone());
    info!(connector = %config.name, protocol = %config.protocol, url = %config.url, "connector starting");

    let writer = if config.write_back.is_empty() {
        None
    } else {
        let subscriber = Subscriber::connect_with(
            &config.write_back,
            config.bus.queue_capacity,
            Duration::from_millis(config.bus.reconnect_ms),
        )
        .context("dialing write-back publishers")?;
        let connector = connector.clone();
        Some(tokio::spawn(async move { connector.subscribe(subscriber).await }))
    };

    let result = until_shutdown(connector.publish(emitter.clone()), shutdown, &[&publisher])
        .await
        .unwrap_or(Ok(()));
    publisher.close();
    if let Some(writer) = writer {
        writer.abort();
    }
    info!(
        connector = %config.name,
        emitted = emitter.emitted(),
        rejected = emitter.rejected(),
        "connector stopped"
    );
    result.context("connector failed")
}

pub async fn mapper(path: &Path, shutdown: impl Future<Output = ()>) -> Result<()> {
    let config: MapperConfig = load(path).context("loading mapper config")?;
    let mapper = signalk_mapper::build(&config).context("building mapper")?;
    let stage = ExpressionStage::new(config.label(), &config.context, &config.expressions);
    let input = config.bus.subscriber().context("dialing raw publishers")?;
    let output = config
        .bus
        .publisher()
        .await
        .context("binding mapped publisher")?;
    info!(mapper = config.label(), protocol = %config.protocol, context = %config.context, "mapper starting");

    let Some(stats) =
        until_shutdown(run_mapper(input, output.clone(), mapper, stage), shutdown, &[&output]).await
    else {
        return Ok(());
    };
    info!(
        received = stats.received,
        published = stats.published,
        failed = stats.failed,
        "mapper stopped"
    );
    Ok(())
}

pub async fn filter(path: &Path, shutdown: impl Future<Output = ()>) -> Result<()> {
    let config: FilterConfig = load(path).context("loading filter config")?;
    let input = config.bus.subscriber().context("dialing mapped publishers")?;
    let output = config
        .bus
        .publisher()
        .await
        .context("binding filtered publisher")?;
    info!(
        default_interval = config.limits.default_interval,
        overrides = config.limits.rate_limits.len(),
        "filter starting"
    );
    until_shutdown(
        run_filter(input, output.clone(), RateLimitFilter::new(config.limits)),
        shutdown,
        &[&output],
    )
    .await;
    Ok(())
}

pub async fn store(path: &Path, shutdown: impl Future<Output = ()>) -> Result<()> {
    let config: StoreConfig = load(path).context("loading store config")?;
    let store = signalk_store::open(&config.database).context("opening database")?;
    let raw = config
        .raw
        .as_ref()
        .map(|bus| bus.subscriber())
        .transpose()
        .context("dialing raw publishers")?;
    let mapped = config
        .mapped
        .as_ref()
        .map(|bus| bus.subscriber())
        .transpose()
        .context("dialing mapped publishers")?;

    let retention = config.database.retention_hours.map(|hours| {
        tokio::spawn(run_retention(
            store.clone(),
            Duration::from_secs(hours * 3600),
            RETENTION_CHECK,
        ))
    });
    info!(
        database = config.database.path.as_deref().unwrap_or("<memory>"),
        workers = config.database.workers,
        "store writer starting"
    );

    until_shutdown(
        run_store_writer(raw, mapped, store, &config.database),
        shutdown,
        &[],
    )
    .await;
    if let Some(retention) = retention {
        retention.abort();
    }
    Ok(())
}

pub async fn server(path: &Path, shutdown: impl Future<Output = ()>) -> Result<()> {
    let config: ServerConfig = load(path).context("loading server config")?;
    let Some(result) = until_shutdown(run_server(config), shutdown, &[]).await else {
        return Ok(());
    };
    let stats = result.context("server failed")?;
    info!(
        clients = stats.registered,
        broadcasts = stats.broadcasts,
        evicted = stats.evicted,
        "server stopped"
    );
    Ok(())
}

/// Wait until something is attached, so a replay is not published into
/// the void.
async fn await_subscriber(publisher: &Publisher, name: &str) {
    if publisher.subscriber_count() > 0 {
        return;
    }
    info!(publisher = name, "waiting for a subscriber before replaying");
    while publisher.subscriber_count() == 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub async fn transfer(path: &Path, shutdown: impl Future<Output = ()>) -> Result<()> {
    tokio::pin!(shutdown);
    let config: TransferConfig = load(path).context("loading transfer config")?;
    let store = signalk_store::open(&config.database).context("opening database")?;
    let range = config.range();

    let raw_out = match &config.raw {
        Some(bus) => Some(bus.publisher().await.context("binding raw publisher")?),
        None => None,
    };
    let mapped_out = match &config.mapped {
        Some(bus) => Some(bus.publisher().await.context("binding mapped publisher")?),
        None => None,
    };

    let publishers: Vec<&Publisher> = raw_out.iter().chain(mapped_out.iter()).collect();
    if !publishers.is_empty() {
        let bus_replay = async {
            if let Some(p) = &raw_out {
                await_subscriber(p, "raw").await;
            }
            if let Some(p) = &mapped_out {
                await_subscriber(p, "mapped").await;
            }
            replay(store.clone(), range, raw_out.as_ref(), mapped_out.as_ref()).await
        };
        let Some(result) = until_shutdown(bus_replay, shutdown.as_mut(), &publishers).await else {
            return Ok(());
        };
        let stats = result.context("replaying store")?;
        info!(raw = stats.raw, mapped = stats.mapped, "bus replay done");
    }
    for publisher in &publishers {
        publisher.close();
    }

    let Some(mqtt) = &config.mqtt else {
        return Ok(());
    };
    let bridge = MqttBridge::connect(mqtt);
    match &config.live {
        Some(live) => {
            let input = live.subscriber().context("dialing live publishers")?;
            info!(broker = %mqtt.host, "bridging live mapped traffic to mqtt");
            until_shutdown(bridge.run_live(input), shutdown.as_mut(), &[]).await;
        }
        None => {
            let deltas = group_deltas(load_mapped(store, range).await.context("reading mapped rows")?);
            let stats = bridge.publish_all(&deltas).await;
            if stats.failed > 0 {
                warn!(failed = stats.failed, "some deltas were not handed to the mqtt client");
            }
            info!(published = stats.published, "mqtt replay done");
        }
    }
    bridge.shutdown().await;
    Ok(())
}
