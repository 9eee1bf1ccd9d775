//! HTTP push receiver (C8): Davis VP2 and Monitor-II edge modems poll
//! this surface over TCP port 5887; a decode-only endpoint serves
//! liveobjects envelopes for operators/tests without writing anything.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use meteo_core::{Connector, ConnectorStatus, ShortStatus, StationId};
use meteo_db::ObservationStore;
use meteo_decoders::davis::{DavisVp2ArchiveRecord, MonitorIiArchiveEntry, RainCollectorSize, MONITOR_II_ARCHIVE_RECORD_LEN, VP2_ARCHIVE_RECORD_LEN};
use meteo_decoders::dispatch::{select_decoder, LiveobjectsEnvelope};
use meteo_jobs::{JobPublisher, JobsFacade};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};
use tracing::{info, instrument, warn};

const AUTH_HEADER: &str = "x-authenticated-user";

pub struct AppState<F> {
    store: ObservationStore,
    publisher: Option<Arc<JobPublisher<F>>>,
    liveobjects_stations: RwLock<HashMap<String, StationId>>,
}

impl<F: JobsFacade + 'static> AppState<F> {
    async fn reload_liveobjects_stations(&self) -> meteo_db::DbResult<()> {
        let rows = self.store.get_all_liveobjects_stations().await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(row.stream_id, row.station);
        }
        *self.liveobjects_stations.write().await = map;
        Ok(())
    }
}

pub fn build_router<F: JobsFacade + 'static>(state: Arc<AppState<F>>) -> Router {
    Router::new()
        .route("/imports/vp2/:uuid/last_archive", get(vp2_last_archive))
        .route("/imports/vp2/:uuid/archive_page", post(vp2_archive_page))
        .route("/imports/vp2/:uuid/configuration/:id", get(vp2_configuration))
        .route("/imports/monitorII/:uuid/last_archive", get(monitorii_last_archive))
        .route("/imports/monitorII/:uuid/archive_page", post(monitorii_archive_page))
        .route("/imports/decode/liveobjects", post(decode_liveobjects))
        .with_state(state)
}

fn parse_station(uuid: &str) -> Result<StationId, StatusCode> {
    uuid.parse().map_err(|_| StatusCode::NOT_FOUND)
}

async fn check_access<F: JobsFacade + 'static>(
    state: &AppState<F>,
    station: StationId,
    headers: &HeaderMap,
) -> Result<(), StatusCode> {
    let user = headers
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let authorized = state
        .store
        .get_station_authorized_user(station)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match authorized {
        Some(expected) if expected == user => Ok(()),
        _ => Err(StatusCode::FORBIDDEN),
    }
}

async fn vp2_last_archive<F: JobsFacade + 'static>(
    State(state): State<Arc<AppState<F>>>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let station = parse_station(&uuid)?;
    check_access(&state, station, &headers).await?;

    let metadata = state.store.get_station_metadata(station).await.map_err(|_| StatusCode::NOT_FOUND)?;
    let pending = state.store.get_pending_configuration(station).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut response_headers = HeaderMap::new();
    if let Some(config) = pending {
        if let Ok(value) = config.id.to_string().parse() {
            response_headers.insert("Meteodata-Config", value);
        }
    }

    Ok((StatusCode::OK, response_headers, metadata.last_archive.timestamp().to_string()))
}

async fn vp2_archive_page<F: JobsFacade + 'static>(
    State(state): State<Arc<AppState<F>>>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let station = parse_station(&uuid)?;
    check_access(&state, station, &headers).await?;

    if body.is_empty() || body.len() % VP2_ARCHIVE_RECORD_LEN != 0 {
        return Err(StatusCode::NOT_ACCEPTABLE);
    }

    let metadata = state.store.get_station_metadata(station).await.map_err(|_| StatusCode::NOT_FOUND)?;
    let local_tz: chrono_tz::Tz = metadata.timezone.parse().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    // Rain-collector resolution is not part of station metadata yet;
    // every currently onboarded VP2 station uses the metric gauge.
    let rain_collector = RainCollectorSize::Metric0_2mm;

    let now = Utc::now();
    let mut observations = Vec::new();
    let mut oldest = now;
    let mut newest = metadata.last_archive;

    for chunk in body.chunks(VP2_ARCHIVE_RECORD_LEN) {
        let record = match DavisVp2ArchiveRecord::parse(chunk, &local_tz, rain_collector) {
            Ok(r) => r,
            Err(err) => {
                warn!(%station, %err, "dropping unparseable vp2 archive record");
                continue;
            }
        };
        if !record.looks_valid(now) {
            continue;
        }
        if record.timestamp < oldest {
            oldest = record.timestamp;
        }
        if record.timestamp > newest {
            newest = record.timestamp;
        }
        observations.push(record.to_observation(station));
    }

    if observations.is_empty() {
        return Ok(StatusCode::NO_CONTENT);
    }

    state.store.insert_points_batch(&observations).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state.store.update_last_archive_time(station, newest).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if let Some(publisher) = &state.publisher {
        publisher.notify(station, oldest, newest).await;
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn vp2_configuration<F: JobsFacade + 'static>(
    State(state): State<Arc<AppState<F>>>,
    Path((uuid, id)): Path<(String, i64)>,
    headers: HeaderMap,
) -> Result<String, StatusCode> {
    let station = parse_station(&uuid)?;
    check_access(&state, station, &headers).await?;

    let config = state
        .store
        .get_configuration_by_id(station, id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(config.configuration.as_str().unwrap_or_default().to_string())
}

async fn monitorii_last_archive<F: JobsFacade + 'static>(
    State(state): State<Arc<AppState<F>>>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
) -> Result<String, StatusCode> {
    let station = parse_station(&uuid)?;
    check_access(&state, station, &headers).await?;
    let metadata = state.store.get_station_metadata(station).await.map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(metadata.last_archive.timestamp().to_string())
}

async fn monitorii_archive_page<F: JobsFacade + 'static>(
    State(state): State<Arc<AppState<F>>>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let station = parse_station(&uuid)?;
    check_access(&state, station, &headers).await?;

    if body.is_empty() || body.len() % MONITOR_II_ARCHIVE_RECORD_LEN != 0 {
        return Err(StatusCode::NOT_ACCEPTABLE);
    }

    let metadata = state.store.get_station_metadata(station).await.map_err(|_| StatusCode::NOT_FOUND)?;
    let now = Utc::now();
    let mut observations = Vec::new();
    let mut oldest = now;
    let mut newest = metadata.last_archive;
    let mut watermark = metadata.last_archive;

    for chunk in body.chunks(MONITOR_II_ARCHIVE_RECORD_LEN) {
        let record = match MonitorIiArchiveEntry::parse(chunk) {
            Ok(r) => r,
            Err(err) => {
                warn!(%station, %err, "dropping unparseable monitor II archive record");
                continue;
            }
        };
        if !record.looks_valid(now, Some(watermark)) {
            continue;
        }
        if record.timestamp > watermark {
            watermark = record.timestamp;
        }
        if record.timestamp < oldest {
            oldest = record.timestamp;
        }
        if record.timestamp > newest {
            newest = record.timestamp;
        }
        observations.push(record.to_observation(station));
    }

    if observations.is_empty() {
        return Ok(StatusCode::NO_CONTENT);
    }

    state.store.insert_points_batch(&observations).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state.store.update_last_archive_time(station, newest).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if let Some(publisher) = &state.publisher {
        publisher.notify(station, oldest, newest).await;
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Decodes a liveobjects envelope and returns the resulting observation
/// as JSON. This path never writes to the observation store; it exists
/// to let operators and the liveobjects platform itself verify a
/// decoder's output for a given sensor.
async fn decode_liveobjects<F: JobsFacade + 'static>(
    State(state): State<Arc<AppState<F>>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, StatusCode> {
    let stream_id = body.get("streamId").and_then(Value::as_str).ok_or(StatusCode::BAD_REQUEST)?;

    let station = {
        let stations = state.liveobjects_stations.read().await;
        *stations.get(stream_id).ok_or(StatusCode::FORBIDDEN)?
    };

    let envelope = LiveobjectsEnvelope::from_json(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let mut decoder = select_decoder(&envelope.sensor, envelope.port).ok_or(StatusCode::BAD_REQUEST)?;
    decoder.ingest(station, &envelope.payload, envelope.timestamp, state.store.client()).await;

    if !decoder.valid_after_parse() {
        return Err(StatusCode::BAD_REQUEST);
    }

    Ok((StatusCode::OK, Json(decoder.describe())))
}

/// Owns the HTTP listener lifecycle so it can sit in a
/// [`meteo_core::ConnectorGroup`] next to the pull schedulers and the
/// other push receivers.
pub struct HttpReceiver<F> {
    bind: SocketAddr,
    state: Arc<AppState<F>>,
    status: Arc<ConnectorStatus>,
    cancel: Arc<Notify>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<F: JobsFacade + 'static> HttpReceiver<F> {
    pub fn new(bind: SocketAddr, store: ObservationStore, publisher: Option<Arc<JobPublisher<F>>>) -> Self {
        HttpReceiver {
            bind,
            state: Arc::new(AppState {
                store,
                publisher,
                liveobjects_stations: RwLock::new(HashMap::new()),
            }),
            status: Arc::new(ConnectorStatus::new()),
            cancel: Arc::new(Notify::new()),
            handle: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl<F: JobsFacade + 'static> Connector for HttpReceiver<F> {
    #[instrument(skip(self))]
    async fn start(&self) -> anyhow::Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        self.state.reload_liveobjects_stations().await?;

        let listener = TcpListener::bind(self.bind).await?;
        let router = build_router(Arc::clone(&self.state));
        let cancel = Arc::clone(&self.cancel);
        let status = Arc::clone(&self.status);

        status.update(|s| s.active_since = Some(chrono::Utc::now()));
        status.set_short_status(ShortStatus::Ok);

        *handle = Some(tokio::spawn(async move {
            let shutdown = async move { cancel.notified().await };
            if let Err(err) = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(shutdown).await {
                warn!(%err, "http receiver exited with an error");
            }
        }));

        info!(bind = %self.bind, "http push receiver started");
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
        self.state.reload_liveobjects_stations().await?;
        Ok(())
    }

    async fn status(&self) -> String {
        self.status.describe("http-push-receiver")
    }
}
