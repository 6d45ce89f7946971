use std::fmt::Write as _;
use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use hostlink_frame::{Message, Value};
use serde::Serialize;
use serde_json::json;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Where a printed message came from.
#[derive(Clone, Copy, Debug)]
pub enum Origin<'a> {
    Response,
    Notification { topic: &'a str },
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
    peer_id: &'a str,
    fields: serde_json::Value,
    timestamp: String,
}

pub fn print_message(message: &Message, origin: Origin<'_>, peer_id: &str, format: OutputFormat) {
    let (kind, topic) = match origin {
        Origin::Response => ("response", None),
        Origin::Notification { topic } => ("notification", Some(topic)),
    };

    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                kind,
                topic,
                peer_id,
                fields: message_to_json(message),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["TAG", "TYPE", "VALUE"]);
            for field in message.iter() {
                table.add_row(vec![
                    field.tag.to_string(),
                    field.value.type_name().to_string(),
                    value_preview(&field.value),
                ]);
            }
            match topic {
                Some(topic) => println!("{kind} on '{topic}' from {peer_id}"),
                None => println!("{kind} from {peer_id}"),
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let mut line = format!("{kind} peer={peer_id}");
            if let Some(topic) = topic {
                let _ = write!(line, " topic={topic}");
            }
            for field in message.iter() {
                let _ = write!(line, " {}={}", field.tag, value_preview(&field.value));
            }
            println!("{line}");
        }
        OutputFormat::Raw => {
            for field in message.iter() {
                match &field.value {
                    Value::Bytes(bytes) => print_raw(bytes),
                    Value::String(text) => print_raw(text.as_bytes()),
                    other => print_raw(value_preview(other).as_bytes()),
                }
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// `[{"tag": 1, "type": "string", "value": "pong"}, ...]`; bytes become hex.
pub fn message_to_json(message: &Message) -> serde_json::Value {
    serde_json::Value::Array(
        message
            .iter()
            .map(|field| {
                json!({
                    "tag": field.tag,
                    "type": field.value.type_name(),
                    "value": value_to_json(&field.value),
                })
            })
            .collect(),
    )
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int32(v) => json!(v),
        Value::Int64(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::String(v) => json!(v),
        Value::Bytes(v) => json!(to_hex(v)),
        Value::Message(m) => message_to_json(m),
    }
}

fn value_preview(value: &Value) -> String {
    match value {
        Value::Int32(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::String(v) => v.clone(),
        Value::Bytes(v) => format!("<{} bytes: {}>", v.len(), to_hex(v)),
        Value::Message(m) => format!("<message, {} fields>", m.len()),
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lists_fields_in_order() {
        let msg = Message::new()
            .with(1, "pong")
            .with(2, 7i32)
            .with(3, vec![0xde_u8, 0xad])
            .with(4, Message::new().with(1, 1.5f64));
        let json = message_to_json(&msg);
        assert_eq!(
            json,
            json!([
                {"tag": 1, "type": "string", "value": "pong"},
                {"tag": 2, "type": "int32", "value": 7},
                {"tag": 3, "type": "bytes", "value": "dead"},
                {"tag": 4, "type": "message", "value": [
                    {"tag": 1, "type": "double", "value": 1.5}
                ]},
            ])
        );
    }

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(to_hex(&[0x00, 0x0f, 0xab]), "000fab");
        assert_eq!(to_hex(&[]), "");
    }
}
