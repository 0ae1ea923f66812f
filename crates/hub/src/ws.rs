//! WebSocket transport for the subscription registry.
//!
//! Each socket gets one registry connection.  A writer task drains the
//! connection's queue into the socket; the reader loop applies
//! subscribe/unsubscribe requests.  Closing the socket drops the connection,
//! which removes it from every channel.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, error, warn};

use crate::registry::{Channel, Connection, Event, Subscription};
use crate::sensor::Reading;
use crate::web::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channel: Channel },
    Unsubscribe { channel: Channel },
    UnsubscribeAll,
}

pub async fn upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| session(socket, app))
}

async fn session(socket: WebSocket, app: AppState) {
    let (conn, mut rx) = app.registry.connect();
    let id = conn.id();
    let (mut sink, mut stream) = socket.split();
    debug!(conn = id, "ws: session opened");

    let writer = tokio::spawn(async move {
        let mut sent = HashMap::new();
        while let Some(event) = rx.recv().await {
            let event = drop_stale(&mut sent, event);
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    error!(conn = id, "ws: failed to encode event: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut subs: HashMap<Channel, Subscription> = HashMap::new();
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_client_message(&app, &conn, &mut subs, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = id, "ws: read error: {e}");
                break;
            }
        }
    }

    debug!(conn = id, channels = conn.channels().len(), "ws: client went away");
    // Dropping the connection closes its queue, which ends the writer.
    drop(subs);
    drop(conn);
    let _ = writer.await;
    debug!(conn = id, "ws: session closed");
}

/// Apply one client request to `conn` and queue the replies.
pub async fn handle_client_message(
    app: &AppState,
    conn: &Connection,
    subs: &mut HashMap<Channel, Subscription>,
    text: &str,
) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(conn = conn.id(), "ws: bad client message: {e}");
            conn.send(Event::Error {
                message: format!("bad request: {e}"),
            });
            return;
        }
    };

    match msg {
        ClientMessage::Subscribe { channel } => {
            if !subs.contains_key(&channel) {
                subs.insert(channel.clone(), conn.subscribe(channel.clone()));
            }
            conn.send(Event::Subscribed {
                channel: channel.clone(),
            });

            // Membership is in place before the snapshot is read, so nothing
            // is missed.  A batch queued ahead of the snapshot can be newer
            // than it; the writer strips those stale readings.
            match app.db.latest_readings().await {
                Ok(latest) => {
                    if let Some(readings) = snapshot_for(&channel, latest) {
                        conn.send(Event::Snapshot { channel, readings });
                    }
                }
                Err(e) => {
                    error!(conn = conn.id(), "ws: snapshot failed: {e:#}");
                    conn.send(Event::Error {
                        message: "snapshot unavailable".into(),
                    });
                }
            }
        }
        ClientMessage::Unsubscribe { channel } => match subs.remove(&channel) {
            Some(sub) => {
                sub.unsubscribe();
                conn.send(Event::Unsubscribed { channel });
            }
            None => {
                conn.send(Event::Error {
                    message: format!("not subscribed to {channel}"),
                });
            }
        },
        ClientMessage::UnsubscribeAll => {
            conn.unsubscribe_all();
            for (channel, _) in subs.drain() {
                conn.send(Event::Unsubscribed { channel });
            }
        }
    }
}

fn note_sent(sent: &mut HashMap<String, i64>, r: &Reading) {
    let ts = sent.entry(r.sensor_id.clone()).or_insert(r.ts);
    *ts = (*ts).max(r.ts);
}

/// Track the newest timestamp written per sensor and strip snapshot
/// readings that are older than one already sent.
fn drop_stale(sent: &mut HashMap<String, i64>, event: Event) -> Event {
    match event {
        Event::SensorData { ref readings, .. } => {
            for r in readings {
                note_sent(sent, r);
            }
            event
        }
        Event::SensorUpdate { ref reading } => {
            note_sent(sent, reading);
            event
        }
        Event::Snapshot { channel, readings } => {
            let readings: Vec<Reading> = readings
                .into_iter()
                .filter(|r| sent.get(&r.sensor_id).map_or(true, |&ts| r.ts > ts))
                .collect();
            for r in &readings {
                note_sent(sent, r);
            }
            Event::Snapshot { channel, readings }
        }
        other => other,
    }
}

/// The part of the current state a new subscriber to `channel` should see.
/// `None` for channels that carry no readings.
pub fn snapshot_for(channel: &Channel, latest: Vec<Reading>) -> Option<Vec<Reading>> {
    match channel {
        Channel::AllSensorData => Some(latest),
        Channel::Zone(zone_id) => Some(latest.into_iter().filter(|r| &r.zone_id == zone_id).collect()),
        Channel::Sensor(sensor_id) => Some(
            latest
                .into_iter()
                .filter(|r| &r.sensor_id == sensor_id)
                .collect(),
        ),
        Channel::Alerts => None,
    }
}
