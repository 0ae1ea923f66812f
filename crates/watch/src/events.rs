//! Wire types for the hub's WebSocket, as far as the watcher needs them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub value: f64,
    pub unit: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Alert {
    pub alert_id: i64,
    pub message: String,
    pub severity: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SensorData { channel: String, readings: Vec<Reading> },
    SensorUpdate { reading: Reading },
    Alert(Alert),
    Snapshot { channel: String, readings: Vec<Reading> },
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Error { message: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage<'a> {
    Subscribe { channel: &'a str },
}

fn non_normal(readings: &[Reading]) -> usize {
    readings.iter().filter(|r| r.status != "normal").count()
}

/// One log line per event.
pub fn describe(event: &ServerEvent) -> String {
    match event {
        ServerEvent::SensorData { channel, readings } => format!(
            "{channel}: {} reading(s), {} out of band",
            readings.len(),
            non_normal(readings)
        ),
        ServerEvent::SensorUpdate { reading: r } => {
            format!("{} = {} {} ({})", r.sensor_id, r.value, r.unit, r.status)
        }
        ServerEvent::Alert(a) => format!("ALERT #{} [{}] {}", a.alert_id, a.severity, a.message),
        ServerEvent::Snapshot { channel, readings } => {
            format!("{channel}: snapshot of {} sensor(s)", readings.len())
        }
        ServerEvent::Subscribed { channel } => format!("subscribed to {channel}"),
        ServerEvent::Unsubscribed { channel } => format!("unsubscribed from {channel}"),
        ServerEvent::Error { message } => format!("hub error: {message}"),
        ServerEvent::Unknown => "unrecognised event".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_batch_and_counts_out_of_band() {
        let json = r#"{"type":"sensor_data","channel":"all_sensor_data","readings":[
            {"sensor_id":"a","zone_id":"z","value":21.5,"unit":"°C","status":"normal","timestamp":1},
            {"sensor_id":"b","zone_id":"z","value":38.0,"unit":"°C","status":"critical","timestamp":1}]}"#;
        let ev: ServerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(describe(&ev), "all_sensor_data: 2 reading(s), 1 out of band");
    }

    #[test]
    fn parses_alert_ignoring_extra_fields() {
        let json = r#"{"type":"alert","alert_id":7,"sensor_id":"a","sensor_name":"A",
            "message":"A critical: 38 °C (above 35 °C)","severity":"critical",
            "value":38.0,"unit":"°C","timestamp":5}"#;
        let ev: ServerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(describe(&ev), "ALERT #7 [critical] A critical: 38 °C (above 35 °C)");
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let ev: ServerEvent = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(ev, ServerEvent::Unknown));
    }

    #[test]
    fn subscribe_request_wire_format() {
        let json = serde_json::to_string(&ClientMessage::Subscribe { channel: "zone:rack-a" }).unwrap();
        assert_eq!(json, r#"{"action":"subscribe","channel":"zone:rack-a"}"#);
    }
}
