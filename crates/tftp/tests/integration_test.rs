//! Integration tests for the TFTP server
//!
//! These tests start the actual server on loopback and talk to it with
//! real UDP datagrams.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tempfile::{TempDir, tempdir};
use tftp::{
    EndpointConfig, Packet, RawOption, Server, ServerConfig, TftpError, TftpErrorCode, TftpOpcode, build_ack,
    build_data, build_error,
};
use tokio::fs;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    server: Server,
    addr: SocketAddr,
    dir: TempDir,
}

impl TestServer {
    async fn start(customize: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        let dir = tempdir().unwrap();
        let config =
            ServerConfig::new(dir.path()).with_endpoint(EndpointConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));

        let mut server = Server::configure(customize(config)).unwrap();
        server.start().unwrap();
        let addr = server.local_addrs()[0];

        Self { server, addr, dir }
    }

    async fn put(&self, name: &str, contents: &[u8]) {
        fs::write(self.dir.path().join(name), contents).await.unwrap();
    }

    async fn get(&self, name: &str) -> Vec<u8> {
        fs::read(self.dir.path().join(name)).await.unwrap()
    }
}

struct Client {
    socket: UdpSocket,
}

impl Client {
    async fn new() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    async fn send(&self, packet: &[u8], to: SocketAddr) {
        self.socket.send_to(packet, to).await.unwrap();
    }

    async fn recv_raw(&self) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; 70000];
        let (n, src) = timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("no reply from server")
            .unwrap();
        buf.truncate(n);
        (buf, src)
    }

    async fn recv(&self) -> (Packet, SocketAddr) {
        let (buf, src) = self.recv_raw().await;
        (Packet::parse(&buf).unwrap(), src)
    }

    async fn expect_error(&self, code: TftpErrorCode) {
        match self.recv().await.0 {
            Packet::Error { code: got, message } => assert_eq!(got, code.as_u16(), "message: {}", message),
            other => panic!("expected ERROR {}, got {:?}", code, other),
        }
    }

    /// ACK every DATA block until the short one and return the payload
    async fn download(&self, mut tid: Option<SocketAddr>, block_size: usize) -> Vec<u8> {
        let mut contents = Vec::new();
        let mut expected = 1u16;

        loop {
            let (packet, src) = self.recv().await;
            let server = *tid.get_or_insert(src);
            assert_eq!(src, server, "transfer id changed mid-transfer");

            match packet {
                Packet::Data { block, data } => {
                    assert_eq!(block, expected);
                    assert!(data.len() <= block_size);
                    contents.extend_from_slice(&data);
                    self.send(&build_ack(block), server).await;
                    if data.len() < block_size {
                        return contents;
                    }
                    expected += 1;
                }
                other => panic!("expected DATA {}, got {:?}", expected, other),
            }
        }
    }

    /// Send `contents` as DATA blocks, waiting for each ACK
    async fn upload(&self, server: SocketAddr, contents: &[u8], block_size: usize) {
        let mut chunks: Vec<&[u8]> = contents.chunks(block_size).collect();
        if contents.len() % block_size == 0 {
            chunks.push(&[]);
        }

        for (i, chunk) in chunks.into_iter().enumerate() {
            let block = i as u16 + 1;
            self.send(&build_data(block, chunk), server).await;
            let (packet, src) = self.recv().await;
            assert_eq!(src, server);
            assert_eq!(packet, Packet::Ack(block));
        }
    }
}

fn request(opcode: TftpOpcode, filename: &str, mode: &str, options: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = opcode.as_u16().to_be_bytes().to_vec();
    for field in [filename, mode].into_iter().chain(options.iter().flat_map(|(k, v)| [*k, *v])) {
        buf.extend_from_slice(field.as_bytes());
        buf.push(0);
    }
    buf
}

fn rrq(filename: &str, mode: &str, options: &[(&str, &str)]) -> Vec<u8> {
    request(TftpOpcode::ReadRequest, filename, mode, options)
}

fn wrq(filename: &str, mode: &str, options: &[(&str, &str)]) -> Vec<u8> {
    request(TftpOpcode::WriteRequest, filename, mode, options)
}

fn oack(pairs: &[(&str, &str)]) -> Packet {
    Packet::OptionAck(
        pairs
            .iter()
            .map(|(name, value)| RawOption {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect(),
    )
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn test_read_octet() {
    let server = TestServer::start(|c| c).await;
    let contents = pattern(1300);
    server.put("boot.img", &contents).await;

    let client = Client::new().await;
    client.send(&rrq("boot.img", "octet", &[]), server.addr).await;

    let received = client.download(None, 512).await;
    assert_eq!(received, contents);

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_read_mode_is_case_insensitive() {
    let server = TestServer::start(|c| c).await;
    server.put("a.txt", b"abc").await;

    let client = Client::new().await;
    client.send(&rrq("a.txt", "OcTeT", &[]), server.addr).await;
    assert_eq!(client.download(None, 512).await, b"abc");

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_transfer_uses_new_port() {
    let server = TestServer::start(|c| c).await;
    server.put("a.bin", b"x").await;

    let client = Client::new().await;
    client.send(&rrq("a.bin", "octet", &[]), server.addr).await;

    let (packet, src) = client.recv().await;
    assert_ne!(src, server.addr);
    assert_eq!(src.ip(), server.addr.ip());
    assert_eq!(packet, Packet::Data { block: 1, data: b"x".to_vec() });
    client.send(&build_ack(1), src).await;

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_read_exact_multiple_sends_empty_final_block() {
    let server = TestServer::start(|c| c).await;
    let contents = pattern(1024);
    server.put("exact.bin", &contents).await;

    let client = Client::new().await;
    client.send(&rrq("exact.bin", "octet", &[]), server.addr).await;

    let mut blocks = Vec::new();
    loop {
        let (packet, src) = client.recv().await;
        let Packet::Data { block, data } = packet else {
            panic!("expected DATA, got {:?}", packet);
        };
        client.send(&build_ack(block), src).await;
        blocks.push((block, data.len()));
        if data.len() < 512 {
            break;
        }
    }

    assert_eq!(blocks, vec![(1, 512), (2, 512), (3, 0)]);
    server.server.shutdown().await;
}

#[tokio::test]
async fn test_read_empty_file() {
    let server = TestServer::start(|c| c).await;
    server.put("empty", b"").await;

    let client = Client::new().await;
    client.send(&rrq("empty", "octet", &[]), server.addr).await;
    assert!(client.download(None, 512).await.is_empty());

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_read_with_clamped_block_size() {
    let server = TestServer::start(|c| c.with_block_size(1400).with_timeout(5)).await;
    let contents = pattern(2500);
    server.put("test.txt", &contents).await;

    let client = Client::new().await;
    client
        .send(
            &rrq("test.txt", "octet", &[("blksize", "2048"), ("timeout", "5"), ("tsize", "0")]),
            server.addr,
        )
        .await;

    let (packet, tid) = client.recv().await;
    assert_eq!(packet, oack(&[("blksize", "1400"), ("timeout", "5"), ("tsize", "2500")]));
    client.send(&build_ack(0), tid).await;

    let (packet, _) = client.recv().await;
    assert_eq!(packet, Packet::Data { block: 1, data: contents[..1400].to_vec() });
    client.send(&build_ack(1), tid).await;

    let (packet, _) = client.recv().await;
    assert_eq!(packet, Packet::Data { block: 2, data: contents[1400..].to_vec() });
    client.send(&build_ack(2), tid).await;

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_read_block_size_below_ceiling_is_kept() {
    let server = TestServer::start(|c| c.with_block_size(1400)).await;
    let contents = pattern(2500);
    server.put("test.txt", &contents).await;

    let client = Client::new().await;
    client.send(&rrq("test.txt", "octet", &[("blksize", "1024")]), server.addr).await;

    let (packet, tid) = client.recv().await;
    assert_eq!(packet, oack(&[("blksize", "1024")]));
    client.send(&build_ack(0), tid).await;

    assert_eq!(client.download(Some(tid), 1024).await, contents);
    server.server.shutdown().await;
}

#[tokio::test]
async fn test_unacceptable_timeout_is_dropped_from_oack() {
    let server = TestServer::start(|c| c.with_timeout(3)).await;
    server.put("f", b"data").await;

    for timeout_value in ["0", "256", "10", "soon"] {
        let client = Client::new().await;
        client
            .send(&rrq("f", "octet", &[("timeout", timeout_value), ("blksize", "512")]), server.addr)
            .await;

        let (packet, tid) = client.recv().await;
        assert_eq!(packet, oack(&[("blksize", "512")]), "timeout {}", timeout_value);
        client.send(&build_ack(0), tid).await;
        assert_eq!(client.download(Some(tid), 512).await, b"data");
    }

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_only_unknown_options_skips_oack() {
    let server = TestServer::start(|c| c).await;
    server.put("f", b"data").await;

    let client = Client::new().await;
    client.send(&rrq("f", "octet", &[("windowsize", "8")]), server.addr).await;

    let (packet, tid) = client.recv().await;
    assert_eq!(packet, Packet::Data { block: 1, data: b"data".to_vec() });
    client.send(&build_ack(1), tid).await;

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_read_netascii() {
    let server = TestServer::start(|c| c).await;
    server.put("notes.txt", b"line one\nline two\rend\n").await;

    let client = Client::new().await;
    client.send(&rrq("notes.txt", "netascii", &[("tsize", "0")]), server.addr).await;

    let (packet, tid) = client.recv().await;
    assert_eq!(packet, oack(&[("tsize", "25")]));
    client.send(&build_ack(0), tid).await;

    let received = client.download(Some(tid), 512).await;
    assert_eq!(received, b"line one\r\nline two\r\0end\r\n");
    assert_eq!(received.len(), 25);

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_write_octet() {
    let server = TestServer::start(|c| c).await;
    let contents = pattern(1100);

    let client = Client::new().await;
    client.send(&wrq("upload.bin", "octet", &[]), server.addr).await;

    let (packet, tid) = client.recv().await;
    assert_eq!(packet, Packet::Ack(0));
    assert_ne!(tid, server.addr);

    client.upload(tid, &contents, 512).await;
    assert_eq!(server.get("upload.bin").await, contents);

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_write_exact_multiple() {
    let server = TestServer::start(|c| c).await;
    let contents = pattern(1024);

    let client = Client::new().await;
    client.send(&wrq("upload.bin", "octet", &[]), server.addr).await;
    let (_, tid) = client.recv().await;

    client.upload(tid, &contents, 512).await;
    assert_eq!(server.get("upload.bin").await, contents);

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_write_netascii_with_options() {
    let server = TestServer::start(|c| c).await;
    let wire = b"first\r\nsecond\r\0third\r\n";

    let client = Client::new().await;
    client
        .send(
            &wrq("notes.txt", "netascii", &[("blksize", "8"), ("tsize", "22")]),
            server.addr,
        )
        .await;

    let (packet, tid) = client.recv().await;
    assert_eq!(packet, oack(&[("blksize", "8"), ("tsize", "22")]));

    client.upload(tid, wire, 8).await;
    assert_eq!(server.get("notes.txt").await, b"first\nsecond\rthird\n");

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_write_existing_file_fails() {
    let server = TestServer::start(|c| c).await;
    server.put("taken", b"original").await;

    let client = Client::new().await;
    client.send(&wrq("taken", "octet", &[]), server.addr).await;
    client.expect_error(TftpErrorCode::FileAlreadyExists).await;

    assert_eq!(server.get("taken").await, b"original");
    server.server.shutdown().await;
}

#[tokio::test]
async fn test_write_abort_removes_partial_file() {
    let server = TestServer::start(|c| c).await;

    let client = Client::new().await;
    client.send(&wrq("partial.bin", "octet", &[]), server.addr).await;
    let (_, tid) = client.recv().await;

    client.send(&build_data(1, &pattern(512)), tid).await;
    assert_eq!(client.recv().await.0, Packet::Ack(1));
    client
        .send(&build_error(&TftpError::not_defined("user cancelled")), tid)
        .await;

    let path = server.dir.path().join("partial.bin");
    for _ in 0..50 {
        if !path.exists() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(!path.exists());

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_write_wrong_block_is_illegal() {
    let server = TestServer::start(|c| c).await;

    let client = Client::new().await;
    client.send(&wrq("skip.bin", "octet", &[]), server.addr).await;
    let (_, tid) = client.recv().await;

    client.send(&build_data(3, b"out of order"), tid).await;
    client.expect_error(TftpErrorCode::IllegalOperation).await;

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_write_repeated_block_is_illegal() {
    let server = TestServer::start(|c| c).await;

    let client = Client::new().await;
    client.send(&wrq("up.bin", "octet", &[]), server.addr).await;
    let (_, tid) = client.recv().await;

    let block = build_data(1, &pattern(512));
    client.send(&block, tid).await;
    assert_eq!(client.recv().await.0, Packet::Ack(1));
    client.send(&block, tid).await;
    client.expect_error(TftpErrorCode::IllegalOperation).await;

    server.server.shutdown().await;
    assert!(!server.dir.path().join("up.bin").exists());
}

#[tokio::test]
async fn test_write_existing_file_is_checked_before_size() {
    let server = TestServer::start(|c| c).await;
    server.put("taken", b"original").await;

    let client = Client::new().await;
    client
        .send(&wrq("taken", "octet", &[("blksize", "8"), ("tsize", "1000000")]), server.addr)
        .await;
    client.expect_error(TftpErrorCode::FileAlreadyExists).await;

    assert_eq!(server.get("taken").await, b"original");
    server.server.shutdown().await;
}

#[tokio::test]
async fn test_error_to_listener_is_not_answered() {
    let server = TestServer::start(|c| c).await;

    let client = Client::new().await;
    client
        .send(&build_error(&TftpError::not_defined("stray")), server.addr)
        .await;
    let mut buf = [0u8; 600];
    let reply = timeout(Duration::from_millis(300), client.socket.recv_from(&mut buf)).await;
    assert!(!matches!(reply, Ok(Ok(_))), "ERROR datagram was answered");
    assert_eq!(server.server.active_sessions(), 0);

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_bad_mode_is_illegal() {
    let server = TestServer::start(|c| c).await;
    server.put("f", b"x").await;

    for mode in ["mail", "binary", ""] {
        let client = Client::new().await;
        client.send(&rrq("f", mode, &[]), server.addr).await;
        client.expect_error(TftpErrorCode::IllegalOperation).await;
    }

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_non_request_opcode_is_illegal() {
    let server = TestServer::start(|c| c).await;

    let client = Client::new().await;
    client.send(&build_ack(1), server.addr).await;
    client.expect_error(TftpErrorCode::IllegalOperation).await;

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_block_size_is_option_error() {
    let server = TestServer::start(|c| c).await;
    server.put("f", b"x").await;

    for value in ["7", "65465", "big"] {
        let client = Client::new().await;
        client.send(&rrq("f", "octet", &[("blksize", value)]), server.addr).await;
        client.expect_error(TftpErrorCode::OptionNegotiationFailed).await;
    }

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_option_is_option_error() {
    let server = TestServer::start(|c| c).await;
    server.put("f", b"x").await;

    let client = Client::new().await;
    client
        .send(&rrq("f", "octet", &[("tsize", "0"), ("TSIZE", "0")]), server.addr)
        .await;
    client.expect_error(TftpErrorCode::OptionNegotiationFailed).await;

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_missing_file() {
    let server = TestServer::start(|c| c).await;

    let client = Client::new().await;
    client.send(&rrq("nope.bin", "octet", &[]), server.addr).await;
    client.expect_error(TftpErrorCode::FileNotFound).await;

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_paths_outside_root_are_refused() {
    let server = TestServer::start(|c| c).await;

    for name in ["../secret", "/etc/passwd", "a/../../b"] {
        let client = Client::new().await;
        client.send(&rrq(name, "octet", &[]), server.addr).await;
        client.expect_error(TftpErrorCode::AccessViolation).await;

        let client = Client::new().await;
        client.send(&wrq(name, "octet", &[]), server.addr).await;
        client.expect_error(TftpErrorCode::AccessViolation).await;
    }

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_file_too_large_for_block_size() {
    let server = TestServer::start(|c| c).await;
    server.put("large.bin", &vec![0u8; 65534 * 8]).await;

    let client = Client::new().await;
    client.send(&rrq("large.bin", "octet", &[("blksize", "8")]), server.addr).await;
    client.expect_error(TftpErrorCode::AccessViolation).await;

    let client = Client::new().await;
    client
        .send(&wrq("huge.bin", "octet", &[("tsize", "1000000"), ("blksize", "8")]), server.addr)
        .await;
    client.expect_error(TftpErrorCode::AccessViolation).await;
    assert!(!server.dir.path().join("huge.bin").exists());

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_lost_ack_retransmits_identical_data() {
    let server = TestServer::start(|c| c.with_timeout(1)).await;
    let contents = pattern(700);
    server.put("f", &contents).await;

    let client = Client::new().await;
    client.send(&rrq("f", "octet", &[]), server.addr).await;

    let (first, tid) = client.recv_raw().await;
    let (again, src) = client.recv_raw().await;
    assert_eq!(src, tid);
    assert_eq!(first, again);
    assert_eq!(first, build_data(1, &contents[..512]));

    client.send(&build_ack(1), tid).await;
    let (packet, _) = client.recv().await;
    assert_eq!(packet, Packet::Data { block: 2, data: contents[512..].to_vec() });
    client.send(&build_ack(2), tid).await;

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_write_resends_ack_on_timeout() {
    let server = TestServer::start(|c| c.with_timeout(1)).await;

    let client = Client::new().await;
    client.send(&wrq("slow.bin", "octet", &[]), server.addr).await;

    let (first, tid) = client.recv().await;
    let (again, _) = client.recv().await;
    assert_eq!(first, Packet::Ack(0));
    assert_eq!(again, Packet::Ack(0));

    client.upload(tid, b"finally", 512).await;
    assert_eq!(server.get("slow.bin").await, b"finally");

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_sessions() {
    let server = TestServer::start(|c| c).await;
    let first = pattern(3000);
    let second: Vec<u8> = pattern(2000).into_iter().rev().collect();
    server.put("one", &first).await;
    server.put("two", &second).await;

    let (a, b) = (Client::new().await, Client::new().await);
    a.send(&rrq("one", "octet", &[]), server.addr).await;
    b.send(&rrq("two", "octet", &[]), server.addr).await;

    let (got_a, got_b) = tokio::join!(a.download(None, 512), b.download(None, 512));
    assert_eq!(got_a, first);
    assert_eq!(got_b, second);

    server.server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_running_sessions() {
    let server = TestServer::start(|c| c).await;
    let contents = pattern(2000);
    server.put("f", &contents).await;
    let listen = server.addr;

    let client = Client::new().await;
    client.send(&rrq("f", "octet", &[]), listen).await;
    let (packet, tid) = client.recv().await;
    let Packet::Data { block: 1, data } = packet else {
        panic!("expected DATA 1, got {:?}", packet);
    };

    let shutdown = tokio::spawn(server.server.shutdown());
    sleep(Duration::from_millis(200)).await;
    assert!(!shutdown.is_finished(), "shutdown must wait for the running transfer");

    // the listener is gone, so a new request goes unanswered
    let late = Client::new().await;
    late.send(&rrq("f", "octet", &[]), listen).await;
    let mut buf = [0u8; 600];
    let reply = timeout(Duration::from_millis(300), late.socket.recv_from(&mut buf)).await;
    assert!(!matches!(reply, Ok(Ok(_))), "listener answered after shutdown");

    let mut received = data;
    let mut block = 1u16;
    loop {
        client.send(&build_ack(block), tid).await;
        if received.len() == contents.len() && received.len() % 512 != 0 {
            break;
        }
        let (packet, _) = client.recv().await;
        let Packet::Data { block: n, data } = packet else {
            panic!("expected DATA, got {:?}", packet);
        };
        block += 1;
        assert_eq!(n, block);
        received.extend_from_slice(&data);
    }
    assert_eq!(received, contents);

    timeout(WAIT, shutdown).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_ipv4_and_ipv6_share_a_port() {
    let port = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f"), b"dual stack").await.unwrap();

    let config = ServerConfig::new(dir.path())
        .with_endpoint(EndpointConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        .with_endpoint("::1".parse::<IpAddr>().map(|ip| EndpointConfig::new(ip, port)).unwrap());

    let mut server = match Server::configure(config) {
        Ok(server) => server,
        Err(e) => {
            // no IPv6 loopback in this environment
            eprintln!("skipping: {:#}", e);
            return;
        }
    };
    server.start().unwrap();

    let v6 = match UdpSocket::bind("[::1]:0").await {
        Ok(socket) => Client { socket },
        Err(_) => return,
    };
    v6.send(&rrq("f", "octet", &[]), SocketAddr::new("::1".parse().unwrap(), port)).await;
    assert_eq!(v6.download(None, 512).await, b"dual stack");

    let v4 = Client::new().await;
    v4.send(&rrq("f", "octet", &[]), SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)).await;
    assert_eq!(v4.download(None, 512).await, b"dual stack");

    server.shutdown().await;
}
