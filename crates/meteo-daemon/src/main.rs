//! Process entry point: wires the connector group (C6) together from
//! the push receivers (C8), the virtual-station computation cycle (C9),
//! and the VantagePro2 direct-dial scheduler (C7), then runs until a
//! shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use meteo_config::AppConfig;
use meteo_core::{Connector, ConnectorGroup};
use meteo_db::{DbClient, DbJobsFacade, ObservationStore};
use meteo_jobs::JobPublisher;
use meteo_receive::{HttpReceiver, MqttReceiver, UdpReceiver};
use meteo_schedule::{PeriodicDownloadScheduler, Vp2Downloader};
use meteo_virtual::VirtualComputationDownloader;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    meteo_obs::init("meteo-daemon");

    let config = AppConfig::load().context("failed to load configuration")?;
    info!("configuration loaded");

    let database_url = config.database_url().context("no database configured")?;
    let db_client = DbClient::new(&database_url).await.context("failed to connect to database")?;
    db_client.ping().await.context("database ping failed")?;
    info!("connected to database");

    let store = ObservationStore::new(db_client.clone());
    let jobs_facade = Arc::new(DbJobsFacade::new(db_client.clone()));
    let publisher = Some(JobPublisher::new(jobs_facade));

    let group = Arc::new(ConnectorGroup::new());

    let http_bind = config.http_bind().parse().context("invalid http bind address")?;
    let http_receiver: Arc<dyn Connector> = Arc::new(HttpReceiver::new(http_bind, store.clone(), publisher.clone()));
    group.add(&http_receiver);

    let udp_bind = config.udp_bind().parse().context("invalid udp bind address")?;
    let udp_receiver: Arc<dyn Connector> = Arc::new(UdpReceiver::new(udp_bind, store.clone(), publisher.clone(), config.strict_hmac()));
    group.add(&udp_receiver);

    let mqtt_receiver = config.mqtt_broker_url().map(|broker_url| {
        let mqtt_cfg = config.receivers.as_ref().and_then(|r| r.mqtt.as_ref());
        let client_id = mqtt_cfg.and_then(|m| m.client_id.clone()).unwrap_or_else(|| "meteo-daemon".to_string());
        let username = mqtt_cfg.and_then(|m| m.username.clone());
        let password = mqtt_cfg.and_then(|m| m.password.clone());
        let receiver: Arc<dyn Connector> =
            Arc::new(MqttReceiver::new(broker_url, client_id, username, password, store.clone(), publisher.clone()));
        receiver
    });
    if let Some(mqtt_receiver) = &mqtt_receiver {
        group.add(mqtt_receiver);
    }

    let virtual_downloader = PeriodicDownloadScheduler::new(VirtualComputationDownloader::new(store.clone(), publisher.clone()));
    let virtual_downloader: Arc<dyn Connector> = Arc::new(virtual_downloader);
    group.add(&virtual_downloader);

    let vp2_downloader = PeriodicDownloadScheduler::new(Vp2Downloader::new(store.clone(), publisher.clone()));
    let vp2_downloader: Arc<dyn Connector> = Arc::new(vp2_downloader);
    group.add(&vp2_downloader);

    group.start().await.context("failed to start connector group")?;
    info!("meteo-daemon running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    if let Err(err) = group.stop().await {
        error!(%err, "error while stopping connector group");
    }

    info!("meteo-daemon stopped");
    Ok(())
}
