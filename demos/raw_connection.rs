use std::env;

use anyhow::{bail, Result};
use proxycore::frame::request::Options;
use proxycore::frame::response::Response;
use proxycore::frame::Frame;
use proxycore::network::{Connection, ConnectionConfig, Endpoint, FrameReceiver};
use proxycore::ProtocolVersion;
use tracing::info;

// Asks a node which options it supports, without any handshake.
// RUST_LOG=trace cargo run --example raw_connection -- 127.0.0.1:9042
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let address = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9042".to_string());
    let endpoint = Endpoint::parse(&address)?;

    let (receiver, mut frames) = FrameReceiver::new();
    let connection =
        Connection::connect(&endpoint, None, Box::new(receiver), &ConnectionConfig::default())
            .await?;
    info!("Connected to {}", connection.peer_address());

    connection.write(Frame::from_request(ProtocolVersion::V4, 0, &Options)?)?;

    let Some(frame) = frames.next().await else {
        bail!("connection closed: {:?}", connection.err());
    };
    match Response::from_raw(frame.opcode, &frame.body)? {
        Response::Supported(supported) => {
            let mut options: Vec<_> = supported.options.into_iter().collect();
            options.sort();
            for (key, values) in options {
                println!("{key}: {}", values.join(", "));
            }
        }
        other => bail!("unexpected response: {other:?}"),
    }

    connection.close();
    connection.is_closed().await;
    info!("Closed, error: {:?}", connection.err());
    Ok(())
}
