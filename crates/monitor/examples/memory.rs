use std::time::Duration;

use shardline_decoder_json::{JsonDecoder, StreamMessage};
use shardline_monitor::{Monitor, MonitorConfig};
use shardline_subjects::SubjectId;
use shardline_transport_memory::MemoryTransport;
use tracing::info;

/// Plays the remote endpoint: greets every subject of every opened stream
/// once a second until the client hangs up.
async fn serve(transport: MemoryTransport) {
    while let Ok(stream) = transport.accept().await {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if stream.is_closed() {
                    break;
                }

                let mut sent = stream.send("\r\n").is_ok();
                for subject in stream.group().iter() {
                    let line = format!(r#"{{"for_user":{subject},"message":{{"text":"hello"}}}}"#);
                    sent &= stream.send_line(&line).is_ok();
                }
                if !sent {
                    break;
                }
            }
        });
    }
}

#[tokio::main]
async fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    )
    .unwrap();

    let transport = MemoryTransport::default();
    tokio::spawn(serve(transport.clone()));

    let (decoder, mut messages) = JsonDecoder::new(256);
    tokio::spawn(async move {
        while let Some((connection, message)) = messages.recv().await {
            if let StreamMessage::Message { for_user, text, .. } = message {
                info!(%connection, %for_user, "{}", text);
            }
        }
    });

    let config = MonitorConfig {
        capacity_per_connection: 3,
        grace_interval: Duration::from_secs(2),
        drain_interval: Duration::from_secs(1),
        ..MonitorConfig::default()
    };
    let monitor = Monitor::new(config, transport, decoder, (1..=7).map(SubjectId::new)).unwrap();
    monitor.start().unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    info!("Dropping subjects 5 to 7");
    monitor.update((1..=4).map(SubjectId::new));

    tokio::time::sleep(Duration::from_secs(6)).await;
    info!(
        "Status: {}",
        serde_json::to_string_pretty(&monitor.status()).unwrap()
    );

    monitor.stop().await.unwrap();
}
