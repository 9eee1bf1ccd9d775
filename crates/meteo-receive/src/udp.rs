//! NB-IoT UDP push receiver (C8): a Dragino THPL-NBIoT uplink is a raw
//! binary datagram whose *hex-encoded ASCII text* carries three parts
//! back to back: a packed-BCD IMEI header, the sensor payload, and a
//! trailing HMAC-SHA256 authenticator.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use meteo_core::{Connector, ConnectorStatus, ShortStatus, StationId};
use meteo_db::ObservationStore;
use meteo_jobs::{JobPublisher, JobsFacade};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

/// Minimum datagram size: 8 bytes of IMEI header + 32 bytes of trailing
/// HMAC. Anything shorter cannot carry a valid uplink and is dropped
/// without a response.
const MIN_DATAGRAM_LEN: usize = 16;

/// Hex characters making up the IMEI header: 1 header nibble skipped,
/// then 15 BCD-digit nibbles forming the IMEI string itself.
const IMEI_HEADER_HEX_LEN: usize = 16;

/// Hex characters making up the trailing HMAC-SHA256 digest (32 bytes,
/// full digest, not truncated).
const HMAC_HEX_LEN: usize = 64;

#[derive(Clone)]
struct NbiotStation {
    station: StationId,
    hmac_key: Vec<u8>,
}

pub struct UdpReceiver<F> {
    bind: SocketAddr,
    store: ObservationStore,
    publisher: Option<Arc<JobPublisher<F>>>,
    strict_hmac: bool,
    stations_by_imei: RwLock<HashMap<String, NbiotStation>>,
    status: Arc<ConnectorStatus>,
    cancel: Arc<Notify>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<F: JobsFacade + 'static> UdpReceiver<F> {
    pub fn new(bind: SocketAddr, store: ObservationStore, publisher: Option<Arc<JobPublisher<F>>>, strict_hmac: bool) -> Self {
        UdpReceiver {
            bind,
            store,
            publisher,
            strict_hmac,
            stations_by_imei: RwLock::new(HashMap::new()),
            status: Arc::new(ConnectorStatus::new()),
            cancel: Arc::new(Notify::new()),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    async fn reload_stations(&self) -> anyhow::Result<()> {
        let rows = self.store.get_all_nbiot_stations().await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let key = match hex::decode(&row.hmac_key_hex) {
                Ok(k) => k,
                Err(err) => {
                    warn!(imei = %row.imei, %err, "skipping nbiot station with malformed hmac key");
                    continue;
                }
            };
            map.insert(row.imei, NbiotStation { station: row.station, hmac_key: key });
        }
        *self.stations_by_imei.write().await = map;
        Ok(())
    }
}

/// Parses the wire layout of a single datagram and authenticates it.
/// `hex_body` is the lowercase-hex-encoded text of the raw datagram.
pub fn verify_and_split(hex_body: &str, hmac_key: &[u8]) -> Option<(String, String, bool)> {
    if hex_body.len() < IMEI_HEADER_HEX_LEN + HMAC_HEX_LEN {
        return None;
    }

    // Skip the one leading header nibble, then take 15 BCD-digit nibbles.
    let imei = hex_body.get(1..IMEI_HEADER_HEX_LEN)?.to_string();

    let message_len = hex_body.len() - HMAC_HEX_LEN;
    let message = hex_body.get(..message_len)?;
    let received_hmac_hex = hex_body.get(message_len..)?;
    let payload_hex = hex_body.get(IMEI_HEADER_HEX_LEN..message_len)?.to_string();

    let mut mac = HmacSha256::new_from_slice(hmac_key).ok()?;
    mac.update(message.as_bytes());
    let expected = mac.finalize().into_bytes();
    let expected_hex = hex::encode(expected);

    let matches = expected_hex.as_bytes().ct_eq(received_hmac_hex.as_bytes()).unwrap_u8() == 1;

    Some((imei, payload_hex, matches))
}

#[instrument(skip(store, publisher, stations_by_imei, socket, strict_hmac))]
async fn handle_datagram<F: JobsFacade + 'static>(
    datagram: &[u8],
    from: SocketAddr,
    socket: &UdpSocket,
    store: &ObservationStore,
    publisher: Option<&Arc<JobPublisher<F>>>,
    stations_by_imei: &RwLock<HashMap<String, NbiotStation>>,
    strict_hmac: bool,
) {
    if datagram.len() < MIN_DATAGRAM_LEN {
        debug!(len = datagram.len(), "dropping undersized nbiot datagram");
        return;
    }

    let hex_body = hex::encode(datagram);

    let Some(imei) = hex_body.get(1..IMEI_HEADER_HEX_LEN).map(str::to_string) else {
        debug!("dropping nbiot datagram too short to carry an imei header");
        return;
    };

    let station = {
        let stations = stations_by_imei.read().await;
        match stations.get(&imei) {
            Some(s) => s.clone(),
            None => {
                warn!(%imei, "dropping nbiot datagram from unregistered imei");
                return;
            }
        }
    };

    let Some((_, payload_hex, hmac_ok)) = verify_and_split(&hex_body, &station.hmac_key) else {
        debug!(%imei, "dropping malformed nbiot datagram");
        return;
    };

    if !hmac_ok {
        if strict_hmac {
            warn!(%imei, station = %station.station, "rejecting nbiot uplink with invalid hmac");
            return;
        }
        warn!(%imei, station = %station.station, "nbiot uplink hmac mismatch, processing anyway (strict_hmac disabled)");
    }

    let now = Utc::now();
    let mut decoder = meteo_decoders::decoder::Decoder::DraginoThpllora(meteo_decoders::dragino::DraginoThpllora::new());
    decoder.ingest(station.station, &payload_hex, now, store.client()).await;

    if decoder.valid_after_parse() {
        let observation = decoder.to_observation(station.station);
        if let Err(err) = store.insert_point(&observation).await {
            warn!(%imei, %err, "failed to store nbiot observation");
        } else {
            decoder.cache_after_insert(station.station, store.client()).await;
            if let Some(publisher) = publisher {
                publisher.notify(station.station, now, now).await;
            }
        }
    } else {
        warn!(%imei, "nbiot payload failed to decode");
    }

    match store.get_pending_configuration(station.station).await {
        Ok(Some(config)) => {
            if let Some(payload_hex) = config.configuration.as_str() {
                if let Ok(bytes) = hex::decode(payload_hex) {
                    if let Err(err) = socket.send_to(&bytes, from).await {
                        warn!(%imei, %err, "failed to send queued downlink");
                    } else if let Err(err) = store.mark_configuration_delivered(config.id).await {
                        warn!(%imei, %err, "failed to mark downlink as delivered");
                    }
                }
            }
        }
        Ok(None) => {}
        Err(err) => warn!(%imei, %err, "failed to look up pending downlink"),
    }
}

#[async_trait::async_trait]
impl<F: JobsFacade + 'static> Connector for UdpReceiver<F> {
    #[instrument(skip(self))]
    async fn start(&self) -> anyhow::Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        self.reload_stations().await?;

        let socket = Arc::new(UdpSocket::bind(self.bind).await?);
        let store = self.store.clone();
        let publisher = self.publisher.clone();
        let strict_hmac = self.strict_hmac;
        let cancel = Arc::clone(&self.cancel);
        let status = Arc::clone(&self.status);
        let stations_by_imei: Arc<RwLock<HashMap<String, NbiotStation>>> = {
            let snapshot = self.stations_by_imei.read().await.clone();
            Arc::new(RwLock::new(snapshot))
        };

        status.update(|s| s.active_since = Some(Utc::now()));
        status.set_short_status(ShortStatus::Ok);

        *handle = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = cancel.notified() => break,
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, from)) => {
                                handle_datagram(&buf[..len], from, &socket, &store, publisher.as_ref(), &stations_by_imei, strict_hmac).await;
                            }
                            Err(err) => warn!(%err, "nbiot udp socket read failed"),
                        }
                    }
                }
            }
        }));

        info!(bind = %self.bind, "nbiot udp push receiver started");
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
        self.reload_stations().await?;
        Ok(())
    }

    async fn status(&self) -> String {
        self.status.describe("nbiot-udp-push-receiver")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hmac_hex(message: &str, key: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(key).unwrap();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn round_trips_imei_payload_and_hmac() {
        let key = b"test-key";
        let imei = "123456789012345";
        let payload_hex = "aabbccdd";
        let message = format!("0{imei}{payload_hex}");
        let digest = hmac_hex(&message, key);
        let hex_body = format!("{message}{digest}");

        let (parsed_imei, parsed_payload, ok) = verify_and_split(&hex_body, key).unwrap();
        assert_eq!(parsed_imei, imei);
        assert_eq!(parsed_payload, payload_hex);
        assert!(ok);
    }

    #[test]
    fn detects_hmac_mismatch() {
        let key = b"test-key";
        let imei = "123456789012345";
        let payload_hex = "aabbccdd";
        let message = format!("0{imei}{payload_hex}");
        let mut digest = hmac_hex(&message, key);
        digest.replace_range(0..1, if digest.starts_with('a') { "b" } else { "a" });
        let hex_body = format!("{message}{digest}");

        let (_, _, ok) = verify_and_split(&hex_body, key).unwrap();
        assert!(!ok);
    }

    #[test]
    fn rejects_datagram_too_short_for_header_and_hmac() {
        assert!(verify_and_split("aabbcc", b"key").is_none());
    }
}
