//! ==============================================================================
//! server.rs - REST api and websocket transport
//! ==============================================================================
//!
//! purpose:
//!     the dashboard-facing edge of the pipeline.
//!
//! routes:
//!     GET /health                      liveness, uptime, registry size
//!     GET /api/readings/latest         latest readings, optional room/type filter
//!     GET /api/rooms/:room_id          every latest reading for one room
//!     GET /api/aggregate/:sensor_type  count/sum/mean/min/max across rooms
//!     GET /api/status                  scheduler, writer and broker counters
//!     GET /ws                          live readings over websocket
//!
//! relationships:
//!     - reads: registry.rs (synchronous latest queries)
//!     - uses: broker.rs (one subscription per websocket subscribe message)
//!     - reads: scheduler.rs, batch.rs (status counters)
//!
//! websocket protocol (json text frames):
//!     client -> server: subscribe, unsubscribe, ping, get_status
//!     server -> client: connection_confirmed, subscription_confirmed,
//!                       unsubscription_confirmed, sensor_data, pong,
//!                       status, error
//!
//! ==============================================================================

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::BatchWriter;
use crate::broker::{Deliver, Filter, SubscriptionBroker, SubscriptionId};
use crate::domain::{Reading, SensorType};
use crate::error::{Error, Result};
use crate::registry::{Latest, ReadingRegistry};
use crate::scheduler::IngestionScheduler;

// ==============================================================================
// shared state
// ==============================================================================
// handlers only read from the registry and the counters. the broker is the
// one structure the websocket side mutates (subscribe/unsubscribe).

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ReadingRegistry>,
    pub broker: Arc<SubscriptionBroker>,
    pub writer: Arc<BatchWriter>,
    pub scheduler: Arc<IngestionScheduler>,
    /// outbound frames buffered per websocket client
    pub client_queue: usize,
    clients: Arc<AtomicUsize>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        registry: Arc<ReadingRegistry>,
        broker: Arc<SubscriptionBroker>,
        writer: Arc<BatchWriter>,
        scheduler: Arc<IngestionScheduler>,
        client_queue: usize,
    ) -> Self {
        Self {
            registry,
            broker,
            writer,
            scheduler,
            client_queue: client_queue.max(1),
            clients: Arc::new(AtomicUsize::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/readings/latest", get(latest_handler))
        .route("/api/rooms/:room_id", get(room_handler))
        .route("/api/aggregate/:sensor_type", get(aggregate_handler))
        .route("/api/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// serve until `shutdown` resolves
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "dashboard api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ==============================================================================
// rest handlers
// ==============================================================================

fn no_data(detail: serde_json::Value) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "status": "no_data", "query": detail }))).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "status": "error", "message": message }))).into_response()
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "readings": state.registry.len(),
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct LatestParams {
    room_id: Option<String>,
    sensor_type: Option<String>,
}

async fn latest_handler(State(state): State<AppState>, Query(params): Query<LatestParams>) -> Response {
    let sensor_type = match params.sensor_type.as_deref().map(str::parse::<SensorType>).transpose() {
        Ok(kind) => kind,
        Err(err) => return bad_request(err.to_string()),
    };

    match state.registry.get_latest(params.room_id.as_deref(), sensor_type) {
        Latest::Single(Some(reading)) => Json(reading).into_response(),
        Latest::Single(None) => no_data(json!({ "room_id": params.room_id, "sensor_type": sensor_type })),
        Latest::Many(readings) => Json(json!({
            "status": if readings.is_empty() { "no_data" } else { "ok" },
            "count": readings.len(),
            "readings": readings,
        }))
        .into_response(),
    }
}

async fn room_handler(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
    let summary = state.registry.room_summary(&room_id);
    if summary.is_empty() {
        return no_data(json!({ "room_id": room_id }));
    }
    Json(json!({ "room_id": room_id, "readings": summary })).into_response()
}

async fn aggregate_handler(State(state): State<AppState>, Path(sensor_type): Path<String>) -> Response {
    let kind = match sensor_type.parse::<SensorType>() {
        Ok(kind) => kind,
        Err(err) => return bad_request(err.to_string()),
    };
    match state.registry.aggregate(kind) {
        Some(aggregate) => Json(aggregate).into_response(),
        None => no_data(json!({ "sensor_type": kind })),
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "scheduler": state.scheduler.stats(),
        "writer": state.writer.stats(),
        "broker": state.broker.stats(),
        "subscriptions": state.broker.subscriptions(),
        "connected_clients": state.connected_clients(),
    }))
}

// ==============================================================================
// websocket protocol
// ==============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        room_id: Option<String>,
        sensor_type: Option<SensorType>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    Ping,
    GetStatus,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    ConnectionConfirmed {
        client_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    SubscriptionConfirmed {
        subscription_id: SubscriptionId,
        filter: Filter,
    },
    UnsubscriptionConfirmed {
        subscription_id: SubscriptionId,
        removed: bool,
    },
    SensorData {
        data: Reading,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Status {
        client_id: Uuid,
        subscriptions: Vec<SubscriptionId>,
        connected_clients: usize,
        readings: usize,
    },
    Error {
        message: String,
    },
}

/// broker-side handle for one websocket client
struct ClientDelivery {
    outbound: mpsc::Sender<ServerMessage>,
}

#[async_trait]
impl Deliver for ClientDelivery {
    async fn deliver(&self, reading: Arc<Reading>) -> Result<()> {
        self.outbound
            .send(ServerMessage::SensorData {
                data: Reading::clone(&reading),
            })
            .await
            .map_err(|_| Error::Delivery("websocket client gone".into()))
    }
}

/// subscriptions owned by one connection
struct Session {
    client_id: Uuid,
    outbound: mpsc::Sender<ServerMessage>,
    subscriptions: HashSet<SubscriptionId>,
}

impl Session {
    fn new(outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            outbound,
            subscriptions: HashSet::new(),
        }
    }

    /// apply one client frame and return the reply
    fn handle(&mut self, state: &AppState, text: &str) -> ServerMessage {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                return ServerMessage::Error {
                    message: format!("invalid message: {err}"),
                }
            }
        };

        match message {
            ClientMessage::Subscribe { room_id, sensor_type } => {
                let filter = Filter { room_id, sensor_type };
                let delivery = ClientDelivery {
                    outbound: self.outbound.clone(),
                };
                let subscription_id = state.broker.subscribe(filter.clone(), delivery);
                self.subscriptions.insert(subscription_id);
                debug!(client = %self.client_id, %subscription_id, "client subscribed");
                ServerMessage::SubscriptionConfirmed { subscription_id, filter }
            }
            ClientMessage::Unsubscribe { subscription_id } => {
                let removed = self.subscriptions.remove(&subscription_id) && state.broker.unsubscribe(subscription_id);
                ServerMessage::UnsubscriptionConfirmed {
                    subscription_id,
                    removed,
                }
            }
            ClientMessage::Ping => ServerMessage::Pong { timestamp: Utc::now() },
            ClientMessage::GetStatus => {
                let mut subscriptions: Vec<_> = self.subscriptions.iter().copied().collect();
                subscriptions.sort();
                ServerMessage::Status {
                    client_id: self.client_id,
                    subscriptions,
                    connected_clients: state.connected_clients(),
                    readings: state.registry.len(),
                }
            }
        }
    }

    /// drop every subscription this connection made
    fn close(&mut self, broker: &SubscriptionBroker) {
        for id in self.subscriptions.drain() {
            broker.unsubscribe(id);
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerMessage>(state.client_queue);
    let mut session = Session::new(outbound.clone());
    state.clients.fetch_add(1, Ordering::Relaxed);
    info!(client = %session.client_id, "websocket client connected");

    // single writer per socket keeps frames in order
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode websocket frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let _ = outbound
        .send(ServerMessage::ConnectionConfirmed {
            client_id: session.client_id,
            timestamp: Utc::now(),
        })
        .await;

    while let Some(Ok(frame)) = receiver.next().await {
        let reply = match frame {
            Message::Text(text) => session.handle(&state, &text),
            Message::Close(_) => break,
            _ => continue,
        };
        if outbound.send(reply).await.is_err() {
            break;
        }
    }

    session.close(&state.broker);
    state.clients.fetch_sub(1, Ordering::Relaxed);
    writer.abort();
    info!(client = %session.client_id, "websocket client disconnected");
}
