//! Ping-pong over two Helix terminals on localhost
//!
//! Run with `cargo run --example ping_pong`.

use helix::{
    Agreement, Incoming, Message, NegotiatedConnection, TerminalConfig, TerminalDriver, now_mics,
};

const PING: u32 = 1;
const ROUNDS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Helix Ping-Pong Example");
    println!("=======================\n");

    let server = TerminalDriver::bind("127.0.0.1:0".parse()?, TerminalConfig::default()).await?;
    let client = TerminalDriver::bind("127.0.0.1:0".parse()?, TerminalConfig::default()).await?;

    // Both sides hold the result of the same handshake
    let negotiated = NegotiatedConnection::from_material(b"ping-pong", Agreement::default());
    let now = now_mics();
    server
        .terminal()
        .prepare_server_connection(&negotiated, client.local_addr(), 0, now)?;
    let connection = client
        .terminal()
        .prepare_client_connection(&negotiated, server.local_addr(), 0, now)?;

    let mut incoming = server
        .terminal()
        .take_incoming()
        .ok_or("incoming queue already taken")?;
    let echo = tokio::spawn(async move {
        while let Some(item) = incoming.recv().await {
            if let Incoming::Message(request) = item {
                let reply = Message::new(
                    request.message.data_kind(),
                    request.message.data_id(),
                    &b"pong"[..],
                );
                if let Err(error) = request.respond(&reply).await {
                    eprintln!("respond failed: {error}");
                }
            }
        }
    });

    for round in 0..ROUNDS {
        let reply = connection
            .send_and_receive(&Message::new(PING, round, &b"ping"[..]))
            .await?;
        println!(
            "round {round}: {:?} (rtt {:?})",
            String::from_utf8_lossy(reply.payload()),
            connection.smoothed_rtt()
        );
    }

    println!("\ndelivery ratio: {:.3}", connection.delivery_ratio());
    println!("client metrics: {:?}", client.terminal().metrics());

    connection.close();
    echo.abort();
    client.shutdown();
    server.shutdown();

    Ok(())
}
