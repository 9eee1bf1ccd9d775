//! MQTT push receiver (C8): subscribes to every registered station's
//! topic and decodes liveobjects-shaped JSON payloads published there.
//!
//! The station for an inbound message is resolved from the topic it
//! arrived on, not from a `streamId` field inside the payload: one topic
//! registry drives every sensor family uniformly, the same way the
//! liveobjects HTTP decode endpoint resolves a station from a lookup
//! table rather than parsing per-sensor quirks out of the payload
//! itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use meteo_core::{Connector, ConnectorStatus, ShortStatus, StationId};
use meteo_db::ObservationStore;
use meteo_decoders::dispatch::{select_decoder, LiveobjectsEnvelope};
use meteo_jobs::{JobPublisher, JobsFacade};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, instrument, warn};

pub struct MqttReceiver<F> {
    broker_url: String,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    store: ObservationStore,
    publisher: Option<Arc<JobPublisher<F>>>,
    stations_by_topic: RwLock<HashMap<String, StationId>>,
    status: Arc<ConnectorStatus>,
    cancel: Arc<Notify>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<F: JobsFacade + 'static> MqttReceiver<F> {
    pub fn new(
        broker_url: String,
        client_id: String,
        username: Option<String>,
        password: Option<String>,
        store: ObservationStore,
        publisher: Option<Arc<JobPublisher<F>>>,
    ) -> Self {
        MqttReceiver {
            broker_url,
            client_id,
            username,
            password,
            store,
            publisher,
            stations_by_topic: RwLock::new(HashMap::new()),
            status: Arc::new(ConnectorStatus::new()),
            cancel: Arc::new(Notify::new()),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    async fn reload_topics(&self) -> anyhow::Result<HashMap<String, StationId>> {
        let rows = self.store.get_all_mqtt_stations().await?;
        let map: HashMap<String, StationId> = rows.into_iter().map(|r| (r.topic, r.station)).collect();
        *self.stations_by_topic.write().await = map.clone();
        Ok(map)
    }

    fn mqtt_options(&self) -> anyhow::Result<MqttOptions> {
        let (host, port) = self
            .broker_url
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("mqtt broker url must be host:port"))?;
        let port: u16 = port.parse()?;
        let mut opts = MqttOptions::new(self.client_id.clone(), host, port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        Ok(opts)
    }
}

async fn handle_publish<F: JobsFacade + 'static>(
    topic: &str,
    payload: &[u8],
    store: &ObservationStore,
    publisher: Option<&Arc<JobPublisher<F>>>,
    stations_by_topic: &RwLock<HashMap<String, StationId>>,
) {
    let station = {
        let stations = stations_by_topic.read().await;
        match stations.get(topic) {
            Some(s) => *s,
            None => {
                debug!(%topic, "dropping mqtt message on unregistered topic");
                return;
            }
        }
    };

    let body: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(err) => {
            warn!(%topic, %err, "dropping unparseable mqtt payload");
            return;
        }
    };

    let envelope = match LiveobjectsEnvelope::from_json(&body) {
        Ok(e) => e,
        Err(err) => {
            warn!(%topic, %err, "dropping mqtt payload with an unrecognized envelope");
            return;
        }
    };

    let Some(mut decoder) = select_decoder(&envelope.sensor, envelope.port) else {
        warn!(%topic, sensor = %envelope.sensor, "no decoder registered for mqtt sensor");
        return;
    };

    decoder.ingest(station, &envelope.payload, envelope.timestamp, store.client()).await;
    if !decoder.valid_after_parse() {
        warn!(%topic, %station, "mqtt payload failed to decode");
        return;
    }

    let observation = decoder.to_observation(station);
    if let Err(err) = store.insert_point(&observation).await {
        warn!(%topic, %err, "failed to store mqtt observation");
        return;
    }
    decoder.cache_after_insert(station, store.client()).await;

    if let Some(publisher) = publisher {
        let now = Utc::now();
        publisher.notify(station, now, now).await;
    }
}

#[async_trait::async_trait]
impl<F: JobsFacade + 'static> Connector for MqttReceiver<F> {
    #[instrument(skip(self))]
    async fn start(&self) -> anyhow::Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        let topics = self.reload_topics().await?;
        let opts = self.mqtt_options()?;
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        for topic in topics.keys() {
            client.subscribe(topic, QoS::AtLeastOnce).await?;
        }

        let store = self.store.clone();
        let publisher = self.publisher.clone();
        let cancel = Arc::clone(&self.cancel);
        let status = Arc::clone(&self.status);
        let stations_by_topic: Arc<RwLock<HashMap<String, StationId>>> = Arc::new(RwLock::new(topics));

        status.update(|s| s.active_since = Some(Utc::now()));
        status.set_short_status(ShortStatus::Ok);

        *handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.notified() => break,
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                handle_publish(&publish.topic, &publish.payload, &store, publisher.as_ref(), &stations_by_topic).await;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!(%err, "mqtt event loop error, retrying");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
        }));

        info!(broker = %self.broker_url, "mqtt push receiver started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> anyhow::Result<()> {
        self.status.set_short_status(ShortStatus::Stopped);
        self.cancel.notify_waiters();
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.take() {
            let _ = h.await;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reload(&self) -> anyhow::Result<()> {
        self.reload_topics().await?;
        Ok(())
    }

    async fn status(&self) -> String {
        self.status.describe("mqtt-push-receiver")
    }
}
