use std::time::Duration;

use epicars_cac::{
    ClientBuilder,
    client::{EngineConfig, Notification},
    messages::{
        Access, AccessRights, AsBytes, ClientName, CreateChannel,
        CreateChannelResponse, ErrorCondition, HostName, RawMessage, ReadNotify, ReadNotifyResponse,
        SearchResponse, Version, parse_search_packet,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::fmt::TestWriter;

/// Pull whole frames off a stream, one at a time
struct FrameReader {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl FrameReader {
    async fn next(&mut self) -> RawMessage {
        loop {
            if let Ok((rest, frame)) = RawMessage::parse(&self.buffer) {
                let used = self.buffer.len() - rest.len();
                self.buffer.drain(..used);
                return frame;
            }
            let mut chunk = [0u8; 4096];
            let n = time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .expect("client went quiet")
                .unwrap();
            assert_ne!(n, 0, "client closed the circuit");
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}

async fn next_notification(stream: &mut UnboundedReceiverStream<Notification>) -> Notification {
    time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no notification arrived")
        .expect("notification stream ended")
}

#[tokio::test]
async fn read_over_a_real_circuit() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();

    let search = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_port = listener.local_addr().unwrap().port();
    info!(
        "Fake server on {} / {}",
        search.local_addr().unwrap(),
        tcp_port
    );

    let mut client = ClientBuilder::new()
        .config(EngineConfig {
            search_destinations: vec![search.local_addr().unwrap()],
            client_name: "tester".to_owned(),
            host_name: "testhost".to_owned(),
            repeater_port: 1,
            ..Default::default()
        })
        .start()
        .await
        .unwrap();
    let mut notifications = client.notifications().unwrap();
    let channel = client.create_channel("LOOP:VALUE", 0).unwrap();

    // Answer the search, pointing at our listener
    let mut buffer = vec![0u8; 0xFFFF];
    let (size, source) = time::timeout(Duration::from_secs(5), search.recv_from(&mut buffer))
        .await
        .expect("no search arrived")
        .unwrap();
    let searches = parse_search_packet(&buffer[..size]).unwrap();
    assert_eq!(searches[0].channel_name, "LOOP:VALUE");
    let reply = SearchResponse {
        port_number: tcp_port,
        search_id: searches[0].search_id,
        server_ip: None,
        protocol_version: Some(13),
    };
    search.send_to(&reply.as_bytes(), source).await.unwrap();

    let (stream, _) = time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client never connected")
        .unwrap();
    let mut server = FrameReader {
        stream,
        buffer: Vec::new(),
    };

    // Circuit handshake then the claim, in order
    let version = Version::try_from(server.next().await).unwrap();
    assert_eq!(version.protocol_version, 13);
    assert_eq!(ClientName::try_from(server.next().await).unwrap().name, "tester");
    assert_eq!(HostName::try_from(server.next().await).unwrap().name, "testhost");
    let frame = server.next().await;
    let create = CreateChannel::try_from(frame).unwrap();
    assert_eq!(create.channel_name, "LOOP:VALUE");

    let mut claim = AccessRights {
        client_id: create.client_id,
        access_rights: Access::ReadWrite,
    }
    .as_bytes();
    claim.extend(
        CreateChannelResponse {
            data_type: 6,
            data_count: 1,
            client_id: create.client_id,
            server_id: 77,
        }
        .as_bytes(),
    );
    server.send(&claim).await;

    // Access rights arrive first, then the connection
    let connected = loop {
        match next_notification(&mut notifications).await {
            Notification::AccessRightsChanged { .. } => continue,
            other => break other,
        }
    };
    assert!(matches!(
        connected,
        Notification::ConnectionChanged { channel: c, connected: true } if c == channel
    ));
    let info = client.channel_info(channel).unwrap();
    assert_eq!(info.native_type, 6);
    assert_eq!(info.native_count, 1);

    let io = client.read(channel, 6, 1).unwrap();
    client.flush();
    let request = ReadNotify::try_from(server.next().await).unwrap();
    assert_eq!(request.server_id, 77);
    assert_eq!(request.data_count, 1);
    server
        .send(
            &ReadNotifyResponse {
                data_type: 6,
                data_count: 1,
                status_code: ErrorCondition::Normal.status(),
                client_ioid: request.client_ioid,
                data: 42.5f64.to_be_bytes().to_vec(),
            }
            .as_bytes(),
        )
        .await;

    match next_notification(&mut notifications).await {
        Notification::ReadCompleted {
            io: completed,
            data,
            ..
        } => {
            assert_eq!(completed, io);
            assert_eq!(f64::from_be_bytes(data[..8].try_into().unwrap()), 42.5);
        }
        other => panic!("Expected a read completion, got {other:?}"),
    }

    // The server going away disconnects the channel
    drop(server);
    match next_notification(&mut notifications).await {
        Notification::ConnectionChanged {
            channel: c,
            connected: false,
        } => assert_eq!(c, channel),
        other => panic!("Expected a disconnect, got {other:?}"),
    }

    client.shutdown().await;
}
