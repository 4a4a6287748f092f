//! Control socket protocol: Hello on connect, commands in, state out.

mod common;

use std::time::Duration;

use common::{station, TestDaemon};
use dial_daemon::socket;
use dial_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let len = u32::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();

    let mut frame = header.to_vec();
    frame.extend_from_slice(&body);
    Message::decode(&frame).unwrap().0
}

#[tokio::test]
async fn client_gets_hello_then_state_updates() {
    let daemon = TestDaemon::start(
        vec![station("a", 92.4, "unsupported://nowhere/a".to_string())],
        |_| {},
    )
    .await;

    let listener = socket::bind("127.0.0.1", 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = socket::start_server(
        listener,
        daemon.state.clone(),
        daemon.event_tx.clone(),
        daemon.broadcast_tx.clone(),
    );

    let mut client = TcpStream::connect(addr).await.unwrap();
    match read_message(&mut client).await {
        Message::Broadcast(Broadcast::Hello {
            protocol_version,
            state,
        }) => {
            assert_eq!(protocol_version, PROTOCOL_VERSION);
            assert_eq!(state.country, "US");
            assert_eq!(state.visible.len(), 1);
        }
        other => panic!("expected Hello, got {:?}", other),
    }

    let cmd = Message::Command(Command::Volume { value: 0.25 })
        .encode()
        .unwrap();
    client.write_all(&cmd).await.unwrap();

    let volume = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Message::Broadcast(Broadcast::State { data }) = read_message(&mut client).await
            {
                break data.volume;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(volume, 0.25);

    daemon.shutdown().await;
}
