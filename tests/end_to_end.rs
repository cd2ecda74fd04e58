//! End-to-end tunnel over loopback
//!
//! A relay answers DNS on a loopback UDP port; a client forwards TCP through
//! it to an echo server.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use dnstcp::{Client, ClientConfig, Relay, RelayConfig, TunnelError};

const ZONE: &str = "tunnel.example.com";
const KEY: &str = "s3cret";

async fn start_relay() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let relay = Relay::new(&RelayConfig {
        listen: addr,
        domain: ZONE.to_string(),
        key: Some(KEY.to_string()),
        conn_timeout: Duration::from_secs(1),
        ..Default::default()
    });
    tokio::spawn(relay.run(socket));
    addr
}

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn client_config(relay: SocketAddr, key: &str) -> ClientConfig {
    ClientConfig {
        dns_server: Some(relay),
        domain: ZONE.to_string(),
        key: Some(key.to_string()),
        conn_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Connect once the forwarded port is up
async fn connect_retry(port: u16) -> TcpStream {
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => return stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
}

async fn echo_through(stream: &mut TcpStream, message: &[u8]) -> Vec<u8> {
    stream.write_all(message).await.unwrap();
    let mut buf = vec![0u8; message.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn test_local_forwarding() {
    let relay = start_relay().await;
    let echo = echo_server().await;
    let lport = free_port();

    let mut config = client_config(relay, KEY);
    config
        .set_forward(&format!("{}:127.0.0.1:{}", lport, echo), true)
        .unwrap();
    config.validate().unwrap();
    let client = Client::new(config).await.unwrap();
    tokio::spawn(client.run());

    tokio::time::timeout(Duration::from_secs(20), async {
        let mut stream = connect_retry(lport).await;
        assert_eq!(echo_through(&mut stream, b"hello through dns").await, b"hello through dns");

        // larger than one fragment in each direction
        let big: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(echo_through(&mut stream, &big).await, big);
    })
    .await
    .expect("echo through the tunnel");
}

#[tokio::test]
async fn test_two_local_connections() {
    let relay = start_relay().await;
    let echo = echo_server().await;
    let lport = free_port();

    let mut config = client_config(relay, KEY);
    config
        .set_forward(&format!("{}:127.0.0.1:{}", lport, echo), true)
        .unwrap();
    let client = Client::new(config).await.unwrap();
    tokio::spawn(client.run());

    tokio::time::timeout(Duration::from_secs(20), async {
        let mut first = connect_retry(lport).await;
        assert_eq!(echo_through(&mut first, b"first").await, b"first");

        let mut second = connect_retry(lport).await;
        assert_eq!(echo_through(&mut second, b"second").await, b"second");
        assert_eq!(echo_through(&mut first, b"again").await, b"again");
    })
    .await
    .expect("both sessions echo");
}

#[tokio::test]
async fn test_wrong_key() {
    let relay = start_relay().await;
    let mut config = client_config(relay, "not the key");
    config.set_forward("2222:127.0.0.1:22", true).unwrap();

    let mut client = Client::new(config).await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(10), client.create_session())
        .await
        .unwrap()
        .unwrap_err();

    println!("login refused: {}", err);
    assert!(matches!(err, TunnelError::Remote(ref msg) if msg == "Authentication failed"));
    assert!(client.sessions().is_empty());
}

#[tokio::test]
async fn test_resource_refused() {
    let relay = start_relay().await;
    let mut config = client_config(relay, KEY);
    config
        .set_forward(&format!("2222:127.0.0.1:{}", free_port()), true)
        .unwrap();

    let mut client = Client::new(config).await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(10), async {
        let id = client.create_session().await.unwrap();
        client.connect_resource(id).await.unwrap_err()
    })
    .await
    .unwrap();

    assert!(matches!(err, TunnelError::Remote(ref msg) if msg == "Connection refused"));
}

#[tokio::test]
async fn test_remote_forwarding() {
    let relay = start_relay().await;
    let echo = echo_server().await;
    let rport = free_port();

    // the relay binds rport, peers there reach the local echo server
    let mut config = client_config(relay, KEY);
    config
        .set_forward(&format!("{}:127.0.0.1:{}", rport, echo), false)
        .unwrap();
    config.validate().unwrap();
    let client = Client::new(config).await.unwrap();
    tokio::spawn(client.run());

    tokio::time::timeout(Duration::from_secs(20), async {
        let mut stream = connect_retry(rport).await;
        assert_eq!(echo_through(&mut stream, b"reverse").await, b"reverse");
    })
    .await
    .expect("echo through the reverse tunnel");
}
