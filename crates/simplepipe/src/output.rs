use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

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

#[derive(Serialize)]
struct MessageOutput<'a> {
    schema_id: &'a str,
    channel: &'a str,
    connection: u64,
    size: usize,
    payload: String,
    timestamp: String,
}

/// Print one received message. The stdout lock is held for the whole record,
/// so connections printing concurrently never interleave.
pub fn print_message(channel: &str, connection: u64, message: &[u8], format: OutputFormat) {
    let mut out = std::io::stdout().lock();
    match format {
        OutputFormat::Json => {
            let record = MessageOutput {
                schema_id: "https://schemas.3leaps.dev/simplepipe/cli/v1/message-received.schema.json",
                channel,
                connection,
                size: message.len(),
                payload: payload_preview(message),
                timestamp: now_unix_seconds(),
            };
            let line = serde_json::to_string(&record).unwrap_or_else(|_| "{}".to_string());
            let _ = writeln!(out, "{line}");
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "CONNECTION", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    channel.to_string(),
                    connection.to_string(),
                    message.len().to_string(),
                    payload_preview(message),
                ]);
            let _ = writeln!(out, "{table}");
        }
        OutputFormat::Pretty => {
            let _ = writeln!(
                out,
                "channel={} connection={} size={} payload={}",
                channel,
                connection,
                message.len(),
                payload_preview(message)
            );
        }
        OutputFormat::Raw => {
            let _ = out.write_all(message);
        }
    }
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
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
    fn preview_shows_text_and_summarizes_binary() {
        assert_eq!(payload_preview(b"hello"), "hello");
        assert_eq!(payload_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
    }

    #[test]
    fn json_record_carries_schema_and_size() {
        let record = MessageOutput {
            schema_id: "schema",
            channel: "pipeA",
            connection: 3,
            size: 5,
            payload: "hello".to_string(),
            timestamp: "0".to_string(),
        };
        let value: serde_json::Value =
            serde_json::to_value(&record).expect("record should serialize");
        assert_eq!(value["channel"], "pipeA");
        assert_eq!(value["connection"], 3);
        assert_eq!(value["size"], 5);
    }
}
