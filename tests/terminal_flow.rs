//! End-to-end transmissions between two terminals over an in-memory wire.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::{Pair, init_tracing, payload};
use helix::{
    Agreement, ClientConnection, ConnectionState, Incoming, MAX_GENE_LENGTH, Message,
    NegotiatedConnection, NetError, TerminalConfig, now_mics,
};
use tokio::sync::mpsc::UnboundedReceiver;

const LENGTHS: [usize; 7] = [0, 1, 1372, 1373, MAX_GENE_LENGTH, MAX_GENE_LENGTH + 1, 1_000_000];

fn streaming() -> Agreement {
    Agreement {
        max_stream_length: 4 * 1024 * 1024,
        ..Agreement::default()
    }
}

async fn next_message(incoming: &mut UnboundedReceiver<Incoming>) -> helix::IncomingMessage {
    match tokio::time::timeout(Duration::from_secs(10), incoming.recv()).await {
        Ok(Some(Incoming::Message(message))) => message,
        other => panic!("expected a message, got {other:?}"),
    }
}

async fn next_stream(incoming: &mut UnboundedReceiver<Incoming>) -> helix::IncomingStream {
    match tokio::time::timeout(Duration::from_secs(10), incoming.recv()).await {
        Ok(Some(Incoming::Stream(stream))) => stream,
        other => panic!("expected a stream, got {other:?}"),
    }
}

#[tokio::test]
async fn blocks_arrive_byte_exact() {
    init_tracing();
    let mut pair = Pair::new();
    pair.start();
    let (client, _server) = pair.connect(Agreement::default());
    let mut incoming = pair.server_incoming();

    for (index, length) in LENGTHS.into_iter().enumerate() {
        let data = payload(length);
        let id = u64::try_from(index).unwrap();
        client
            .send_block(&Message::new(9, id, data.clone()))
            .await
            .unwrap();

        let received = next_message(&mut incoming).await;
        assert_eq!(received.message.data_kind(), 9);
        assert_eq!(received.message.data_id(), id);
        assert_eq!(received.message.payload().as_ref(), data.as_slice(), "length {length}");
    }

    let metrics = pair.client.metrics();
    assert!(metrics.packets_sent > 0);
    assert_eq!(metrics.transmissions_completed, LENGTHS.len() as u64);
}

#[tokio::test]
async fn requests_get_responses() {
    init_tracing();
    let mut pair = Pair::new();
    pair.start();
    let (client, _server) = pair.connect(Agreement::default());
    let mut incoming = pair.server_incoming();

    tokio::spawn(async move {
        while let Some(Incoming::Message(request)) = incoming.recv().await {
            tokio::spawn(async move {
                let mut reply = request.message.payload().to_vec();
                reply.reverse();
                let response = Message::new(request.message.data_kind() + 1, 0, reply);
                request.respond(&response).await.unwrap();
            });
        }
    });

    for length in [3, 5_000, 100_000] {
        let request = payload(length);
        let response = client
            .send_and_receive(&Message::new(1, 0, request.clone()))
            .await
            .unwrap();
        let mut expected = request;
        expected.reverse();
        assert_eq!(response.data_kind(), 2);
        assert_eq!(response.payload().as_ref(), expected.as_slice());
    }
}

#[tokio::test]
async fn streams_arrive_byte_exact() {
    init_tracing();
    let mut pair = Pair::new();
    pair.start();
    let (client, _server) = pair.connect(streaming());
    let mut incoming = pair.server_incoming();

    for length in LENGTHS {
        let data = payload(length);
        let max_length = i64::try_from(length.max(1)).unwrap();
        let mut stream = client.send_stream(4, 2, max_length).unwrap();
        let sender = tokio::spawn(async move {
            for chunk in data.chunks(10_000) {
                stream.send(chunk).await?;
            }
            stream.complete().await
        });

        let mut received = next_stream(&mut incoming).await;
        assert_eq!(received.stream.data_kind(), 4);
        let bytes = received.stream.receive_to_end().await.unwrap();
        sender.await.unwrap().unwrap();
        assert_eq!(bytes.as_ref(), payload(length).as_slice(), "length {length}");
    }
}

#[tokio::test]
async fn slow_reader_throttles_the_stream() {
    init_tracing();
    let mut pair = Pair::new();
    pair.start();
    let agreement = Agreement {
        max_stream_length: 1 << 20,
        stream_buffer_size: u32::try_from(MAX_GENE_LENGTH * 4).unwrap(),
        ..Agreement::default()
    };
    let (client, _server) = pair.connect(agreement);
    let mut incoming = pair.server_incoming();

    let data = payload(60_000);
    let mut stream = client.send_stream(1, 1, 60_000).unwrap();
    let sent = data.clone();
    let sender = tokio::spawn(async move {
        stream.send(&sent).await?;
        stream.complete().await
    });

    let mut received = next_stream(&mut incoming).await;
    let mut bytes = Vec::new();
    while let Some(chunk) = received.stream.receive().await.unwrap() {
        bytes.extend_from_slice(&chunk);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    sender.await.unwrap().unwrap();
    assert_eq!(bytes, data);
}

#[tokio::test]
async fn canceled_stream_surfaces_to_the_reader() {
    init_tracing();
    let mut pair = Pair::new();
    pair.start();
    let (client, _server) = pair.connect(streaming());
    let mut incoming = pair.server_incoming();

    let mut stream = client.send_stream(1, 1, 10_000).unwrap();
    stream.send(b"partial").await.unwrap();
    stream.cancel().await.unwrap();

    let mut received = next_stream(&mut incoming).await;
    assert_eq!(
        received.stream.receive().await.unwrap().unwrap().as_ref(),
        b"partial"
    );
    assert_eq!(received.stream.receive().await, Err(NetError::Canceled));
}

#[tokio::test]
async fn stream_over_declared_length_is_refused() {
    let pair = Pair::new();
    let (client, _server) = pair.connect(streaming());

    let mut stream = client.send_stream(1, 1, 4).unwrap();
    assert_eq!(stream.send(b"hello").await, Err(NetError::StreamLengthLimit));
    assert_eq!(
        client.send_stream(1, 1, 5 * 1024 * 1024).unwrap_err(),
        NetError::StreamLengthLimit
    );
    let (plain, _) = Pair::new().connect(Agreement::default());
    assert_eq!(plain.send_stream(1, 1, 1).unwrap_err(), NetError::StreamLengthLimit);
}

#[tokio::test]
async fn block_size_follows_the_agreement() {
    init_tracing();
    let data = payload(2_000_000);

    let mut pair = Pair::new();
    pair.start();
    let (client, _server) = pair.connect(Agreement {
        max_block_size: 4 * 1024 * 1024,
        ..Agreement::default()
    });
    let mut incoming = pair.server_incoming();
    client
        .send_block(&Message::new(1, 1, data.clone()))
        .await
        .unwrap();
    assert_eq!(next_message(&mut incoming).await.message.payload().as_ref(), data.as_slice());

    let small = Pair::new();
    let (client, _server) = small.connect(Agreement {
        max_block_size: 1024 * 1024,
        ..Agreement::default()
    });
    assert_eq!(
        client.send_block(&Message::new(1, 1, data)).await,
        Err(NetError::BlockSizeLimit)
    );
}

#[tokio::test]
async fn concurrent_transmissions_are_capped() {
    let pair = Pair::new();
    let (client, _server) = pair.connect(Agreement {
        max_transmissions: 1,
        ..Agreement::default()
    });
    let client = client.with_timeout(Duration::from_millis(200));

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.send_block(&Message::new(1, 1, vec![1u8; 10])).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        client.send_block(&Message::new(1, 2, vec![2u8; 10])).await,
        Err(NetError::NoTransmission)
    );
    assert_eq!(first.await.unwrap(), Err(NetError::Timeout));
}

#[tokio::test]
async fn busy_connection_switches_to_cubic() {
    init_tracing();
    let mut pair = Pair::new();
    pair.start();
    let (client, _server) = pair.connect(Agreement::default());
    let mut incoming = pair.server_incoming();
    assert!(!client.has_congestion_control());

    let sends: Vec<_> = (0..8u64)
        .map(|id| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_block(&Message::new(1, id, payload(50_000)))
                    .await
            })
        })
        .collect();
    for send in sends {
        send.await.unwrap().unwrap();
    }
    assert!(client.has_congestion_control());

    let mut ids = Vec::new();
    for _ in 0..8 {
        let received = next_message(&mut incoming).await;
        assert_eq!(received.message.payload().as_ref(), payload(50_000).as_slice());
        ids.push(received.message.data_id());
    }
    ids.sort_unstable();
    assert_eq!(ids, (0..8).collect::<Vec<_>>());
}

#[tokio::test]
async fn lost_datagrams_are_resent() {
    init_tracing();
    let mut pair = Pair::new();
    pair.wire.set_drop_every(13);
    pair.start();
    let (client, _server) = pair.connect(Agreement::default());
    let mut incoming = pair.server_incoming();

    let data = payload(300_000);
    client
        .send_block(&Message::new(1, 1, data.clone()))
        .await
        .unwrap();
    assert_eq!(next_message(&mut incoming).await.message.payload().as_ref(), data.as_slice());
    assert!(client.delivery_stats().resends() > 0);
    assert!(client.delivery_ratio() < 1.0);
}

#[tokio::test]
async fn closing_fails_pending_requests() {
    init_tracing();
    let mut pair = Pair::new();
    pair.start();
    let (client, server) = pair.connect(Agreement::default());
    let mut incoming = pair.server_incoming();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.send_and_receive(&Message::new(1, 1, &b"hi"[..])).await })
    };
    next_message(&mut incoming).await;
    server.close();

    assert_eq!(pending.await.unwrap(), Err(NetError::Closed));
    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(
        client.send_block(&Message::new(1, 2, &b"late"[..])).await,
        Err(NetError::Closed)
    );
}

#[tokio::test]
async fn bidirectional_link_carries_server_traffic() {
    init_tracing();
    let mut pair = Pair::new();
    pair.start();
    let (client, server) = pair.connect(Agreement {
        enable_bidirectional_connection: true,
        ..Agreement::default()
    });
    let mut client_incoming = pair.client_incoming();

    let listener = client.prepare_bidirectional().unwrap();
    let reverse = server.prepare_bidirectional().unwrap();
    assert_eq!(listener.connection_id(), client.connection_id());
    assert_eq!(reverse.connection_id(), server.connection_id());

    reverse
        .send_block(&Message::new(3, 3, &b"push"[..]))
        .await
        .unwrap();
    let received = next_message(&mut client_incoming).await;
    assert_eq!(received.message.payload().as_ref(), b"push");
    assert_eq!(received.connection.connection_id(), client.connection_id());

    client.close();
    assert_eq!(listener.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn bidirectional_requires_the_agreement() {
    let pair = Pair::new();
    let (client, server) = pair.connect(Agreement::default());
    assert_eq!(client.prepare_bidirectional().unwrap_err(), NetError::InvalidEndpoint);
    assert_eq!(server.prepare_bidirectional().unwrap_err(), NetError::InvalidEndpoint);
}

#[test]
fn idle_connection_closes_then_disposes() {
    let pair = Pair::new();
    let agreement = Agreement {
        min_connection_retention_mics: 1_000_000,
        ..Agreement::default()
    };
    let negotiated = NegotiatedConnection::from_material(b"lifecycle", agreement);
    let client = pair
        .client
        .prepare_client_connection(&negotiated, pair.server_addr, 0, 0)
        .unwrap();
    let disposal = TerminalConfig::default().connection_disposal_delay_mics;

    assert_eq!(pair.client.clean(1_000_000), 0);
    assert_eq!(client.state(), ConnectionState::Open);

    assert_eq!(pair.client.clean(1_000_001), 0);
    assert_eq!(client.state(), ConnectionState::Closed);

    assert_eq!(pair.client.clean(1_000_001 + disposal), 0);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(pair.client.client_count(), 1);

    assert_eq!(pair.client.clean(1_000_002 + disposal), 1);
    assert_eq!(client.state(), ConnectionState::Disposed);
    assert_eq!(pair.client.client_count(), 0);
}

#[test]
fn agreement_beyond_the_terminal_limit_is_refused() {
    let pair = Pair::new();
    let negotiated = NegotiatedConnection::from_material(
        b"too wide",
        Agreement {
            max_transmissions: 1_000_000,
            ..Agreement::default()
        },
    );
    assert_eq!(
        pair.client
            .prepare_client_connection(&negotiated, pair.server_addr, 0, 0)
            .unwrap_err(),
        NetError::InvalidData
    );
    assert_eq!(
        pair.client
            .prepare_client_connection(
                &NegotiatedConnection::from_material(b"relayed", Agreement::default()),
                pair.server_addr,
                2,
                0,
            )
            .unwrap_err(),
        NetError::InvalidRelay
    );
}

#[test]
fn closed_and_malformed_traffic_is_ignored() {
    let pair = Pair::new();
    let (client, _server) = pair.connect(Agreement::default());
    let found = pair.client.find_client_connection(pair.server_addr).unwrap();
    assert_eq!(found.connection_id(), client.connection_id());

    client.close();
    let stray = "10.9.9.9:1".parse().unwrap();
    let before = pair.server.metrics().datagrams_dropped;
    pair.server.process_receive(stray, &[0u8; 64], 0);
    pair.server.process_receive(stray, &[0u8; 4], 0);
    assert_eq!(pair.server.metrics().datagrams_dropped, before + 2);
    assert!(pair.client.find_client_connection(pair.server_addr).is_none());
}

/// Send `message` without the pump and return the first datagram it put on the wire.
async fn first_datagram(pair: &Pair, client: &ClientConnection, message: Message) -> Vec<u8> {
    let sender = client.clone();
    tokio::spawn(async move { sender.send_block(&message).await });
    for _ in 0..100 {
        tokio::task::yield_now().await;
        pair.client.process_send(now_mics());
        if let Some((_, to, packet)) = pair.wire.take().into_iter().next() {
            assert_eq!(to, pair.server_addr);
            return packet;
        }
    }
    panic!("nothing was sent");
}

#[tokio::test]
async fn datagrams_from_the_wrong_endpoint_are_dropped() {
    let pair = Pair::new();
    let (client, _server) = pair.connect(Agreement::default());
    let mut incoming = pair.server_incoming();
    let packet = first_datagram(&pair, &client, Message::new(5, 6, &b"hello"[..])).await;

    let spoofed: SocketAddr = "10.0.0.9:4000".parse().unwrap();
    let before = pair.server.metrics();
    pair.server.process_receive(spoofed, &packet, now_mics());
    let after = pair.server.metrics();
    assert_eq!(after.datagrams_dropped, before.datagrams_dropped + 1);
    assert_eq!(after.packets_received, before.packets_received);
    assert_eq!(pair.server.pending_acks(), 0);
    assert!(incoming.try_recv().is_err());

    pair.server.process_receive(pair.client_addr, &packet, now_mics());
    let accepted = pair.server.metrics();
    assert_eq!(accepted.packets_received, before.packets_received + 1);
    assert_eq!(accepted.datagrams_dropped, after.datagrams_dropped);
    assert_eq!(pair.server.pending_acks(), 1);
    let received = next_message(&mut incoming).await;
    assert_eq!(received.message.payload().as_ref(), b"hello");
}

#[tokio::test]
async fn widened_agreement_reaches_the_peer() {
    init_tracing();
    let mut pair = Pair::new();
    pair.start();
    let narrow = Agreement {
        max_block_size: 64 * 1024,
        ..Agreement::default()
    };
    let (client, server) = pair.connect(narrow);
    let mut incoming = pair.server_incoming();

    let data = payload(200_000);
    assert_eq!(
        client.send_block(&Message::new(2, 1, data.clone())).await,
        Err(NetError::BlockSizeLimit)
    );

    let wide = Agreement {
        max_block_size: 256 * 1024,
        ..narrow
    };
    client.update_agreement(&wide).await.unwrap();
    assert_eq!(client.agreement().max_block_size, 256 * 1024);
    assert_eq!(server.agreement().max_block_size, 256 * 1024);

    client
        .send_block(&Message::new(2, 2, data.clone()))
        .await
        .unwrap();
    assert_eq!(next_message(&mut incoming).await.message.payload().as_ref(), data.as_slice());
}

#[tokio::test]
async fn agreement_beyond_the_peer_limit_is_rejected() {
    let mut server_config = TerminalConfig::default();
    server_config.agreement_limit.max_block_size = 1024 * 1024;
    let mut pair = Pair::with_configs(TerminalConfig::default(), server_config);
    pair.start();
    let narrow = Agreement {
        max_block_size: 64 * 1024,
        ..Agreement::default()
    };
    let (client, server) = pair.connect(narrow);

    let too_wide = Agreement {
        max_block_size: 2 * 1024 * 1024,
        ..narrow
    };
    assert_eq!(client.update_agreement(&too_wide).await, Err(NetError::InvalidData));
    assert_eq!(client.agreement(), narrow);
    assert_eq!(server.agreement(), narrow);

    client.close();
    let wider = Agreement {
        max_transmissions: 32,
        ..narrow
    };
    assert_eq!(client.update_agreement(&wider).await, Err(NetError::Closed));
}
