//! Command execution.

use crate::Commands;
use colored::Colorize;
use protochannel_client::Client;
use protochannel_server::demo::{Note, Ping, Pong, Upload, UploadReceipt};
use std::time::Instant;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping { count, text } => {
            let mut lines = Vec::new();
            for seq in 1..=count.max(1) {
                let started = Instant::now();
                let pong: Pong = client
                    .request(&Ping {
                        seq,
                        text: text.clone(),
                    })
                    .await?;
                let elapsed = started.elapsed();
                let mut line = format!(
                    "{} seq={} protocol={} time={:.2}ms",
                    "PONG".green(),
                    pong.seq,
                    pong.protocol,
                    elapsed.as_secs_f64() * 1000.0
                );
                if !pong.text.is_empty() {
                    line.push_str(&format!(" text={}", pong.text.cyan()));
                }
                lines.push(line);
            }
            Ok(lines.join("\n"))
        }

        Commands::Note { text } => {
            client.one_way(&Note { text })?;
            Ok("Note sent".green().to_string())
        }

        Commands::Upload {
            file,
            name,
            content_type,
        } => {
            let mut source = tokio::fs::File::open(&file).await?;
            let length = source.metadata().await?.len();
            let name = name.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.display().to_string())
            });

            let started = Instant::now();
            let stream_id = client
                .send_stream(&mut source, length, &name, &content_type)
                .await?;
            let receipt: UploadReceipt = client
                .request(&Upload {
                    stream_id: stream_id as u32,
                })
                .await?;
            Ok(format_receipt(&receipt, started.elapsed().as_secs_f64()))
        }

        Commands::Info => {
            let (min, max) = client.connection().offered();
            Ok(format!(
                "{} {}\n{} {}..={}",
                "Protocol:".bold(),
                client.protocol().to_string().cyan(),
                "Offered:".bold(),
                min,
                max
            ))
        }
    }
}

fn format_receipt(receipt: &UploadReceipt, seconds: f64) -> String {
    format!(
        "{} {} ({}, {} bytes, checksum {:#010x}) in {:.2}s",
        "Uploaded".green(),
        receipt.name.cyan(),
        receipt.content_type,
        receipt.size,
        receipt.checksum,
        seconds
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_receipt() {
        colored::control::set_override(false);
        let receipt = UploadReceipt {
            name: "a.txt".into(),
            content_type: "text/plain".into(),
            size: 3,
            checksum: 0x12,
            notes: 0,
        };
        assert_eq!(
            format_receipt(&receipt, 0.5),
            "Uploaded a.txt (text/plain, 3 bytes, checksum 0x00000012) in 0.50s"
        );
    }
}
