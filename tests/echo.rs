//! End-to-end client/server exchanges over real loopback sockets.

mod common;

use common::{client_ctx, generate_certs, server_ctx};
use futures::task::LocalSpawnExt;
use std::io::{Read, Write};
use std::sync::Arc;
use tlscomm::{Driver, TlsListener, TlsStream};

#[test]
fn tls13_echo_round_trip() {
    let fixture = generate_certs(&["localhost"]);
    let server = server_ctx(&fixture);
    let client = client_ctx(&fixture);

    let mut driver = Driver::new().unwrap();
    let reactor = driver.reactor();
    let spawner = driver.spawner();

    let mut listener = TlsListener::bind(&reactor, server, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = spawner
        .spawn_local_with_handle(async move {
            let (mut stream, _peer) = listener.accept().await.unwrap();
            stream.handshake().await.unwrap();
            assert_eq!(stream.protocol_version(), Some("TLSv1.3"));
            assert!(stream.is_handshake_completed());

            let mut buf = [0u8; 64];
            let n = stream.recv(&mut buf).await.unwrap();
            assert_eq!(n, 18);
            assert_eq!(&buf[..n], b"Hello, SSL Server!");

            let sent = stream.send(&buf[..n]).await.unwrap();
            assert_eq!(sent, 18);

            // The client closes first; observe it, then close our side.
            let n = stream.recv(&mut buf).await.unwrap();
            assert_eq!(n, 0);
            stream.shutdown().await.unwrap();
            stream.close().unwrap();
        })
        .unwrap();

    let reactor_for_client = driver.reactor();
    driver.block_on(async move {
        let mut stream = TlsStream::new(&reactor_for_client, client);
        stream.set_hostname("localhost").unwrap();
        stream.connect(addr).await.unwrap();
        stream.handshake().await.unwrap();

        assert_eq!(stream.protocol_version(), Some("TLSv1.3"));
        assert!(stream.cipher().is_some());
        assert!(stream.peer_certificate().is_some());
        assert!(stream.verify_result().is_none());

        let sent = stream.send(b"Hello, SSL Server!").await.unwrap();
        assert_eq!(sent, 18);

        let mut buf = [0u8; 64];
        let n = stream.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello, SSL Server!");

        stream.shutdown().await.unwrap();
        stream.close().unwrap();
        server_task.await;
    });
}

#[test]
fn megabyte_payload_in_one_send() {
    const PAYLOAD_LEN: usize = 1_048_576;

    let fixture = generate_certs(&["localhost"]);
    let server = server_ctx(&fixture);
    let client = client_ctx(&fixture);

    let mut driver = Driver::new().unwrap();
    let reactor = driver.reactor();
    let spawner = driver.spawner();

    let mut listener = TlsListener::bind(&reactor, server, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = spawner
        .spawn_local_with_handle(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.handshake().await.unwrap();

            let mut collected = 0usize;
            let mut buf = vec![0u8; 64 * 1024];
            while collected < PAYLOAD_LEN {
                let n = stream.recv(&mut buf).await.unwrap();
                assert!(n > 0, "stream ended {collected} bytes in");
                assert!(buf[..n].iter().all(|&b| b == 0x78));
                collected += n;
            }
            assert_eq!(collected, PAYLOAD_LEN);

            // Acknowledge so the client can tear down cleanly.
            stream.send(b"ok").await.unwrap();
            let n = stream.recv(&mut buf).await.unwrap();
            assert_eq!(n, 0);
            stream.shutdown().await.unwrap();
            stream.close().unwrap();
        })
        .unwrap();

    let reactor_for_client = driver.reactor();
    driver.block_on(async move {
        let mut stream = TlsStream::new(&reactor_for_client, client);
        stream.connect(addr).await.unwrap();
        stream.handshake().await.unwrap();

        let payload = vec![0x78u8; PAYLOAD_LEN];
        let sent = stream.send(&payload).await.unwrap();
        assert_eq!(sent, PAYLOAD_LEN);

        let mut buf = [0u8; 16];
        let n = stream.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");

        stream.shutdown().await.unwrap();
        stream.close().unwrap();
        server_task.await;
    });
}

#[test]
fn sni_hostname_reaches_the_server() {
    let fixture = generate_certs(&["localhost", "example.test"]);
    let server = server_ctx(&fixture);
    let client = client_ctx(&fixture);

    let mut driver = Driver::new().unwrap();
    let reactor = driver.reactor();
    let spawner = driver.spawner();

    let mut listener = TlsListener::bind(&reactor, server, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = futures::channel::oneshot::channel::<Option<String>>();
    let server_task = spawner
        .spawn_local_with_handle(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.handshake().await.unwrap();
            tx.send(stream.server_name().map(str::to_string)).unwrap();
            let mut buf = [0u8; 16];
            let _ = stream.recv(&mut buf).await;
            stream.shutdown().await.unwrap();
            stream.close().unwrap();
        })
        .unwrap();

    let reactor_for_client = driver.reactor();
    driver.block_on(async move {
        let mut stream = TlsStream::new(&reactor_for_client, client);
        stream.set_hostname("example.test").unwrap();
        stream.connect(addr).await.unwrap();
        stream.handshake().await.unwrap();

        let observed = rx.await.unwrap();
        assert_eq!(observed.as_deref(), Some("example.test"));

        stream.shutdown().await.unwrap();
        stream.close().unwrap();
        server_task.await;
    });
}

#[test]
fn alpn_negotiation_end_to_end() {
    let fixture = generate_certs(&["localhost"]);

    let mut server = tlscomm::TlsContext::new(tlscomm::TlsMethod::TlsServer);
    server
        .load_certificate(fixture.cert_file.path(), tlscomm::FileFormat::Pem)
        .unwrap();
    server
        .load_private_key(fixture.key_file.path(), tlscomm::FileFormat::Pem)
        .unwrap();
    server
        .set_alpn_protocols([b"h2".as_slice(), b"http/1.1".as_slice()])
        .unwrap();
    let server = Arc::new(server);

    let mut client = tlscomm::TlsContext::new(tlscomm::TlsMethod::TlsClient);
    client
        .load_ca_certificate(fixture.cert_file.path())
        .unwrap();
    client.set_alpn_protocols([b"http/1.1".as_slice()]).unwrap();
    let client = Arc::new(client);

    let mut driver = Driver::new().unwrap();
    let reactor = driver.reactor();
    let spawner = driver.spawner();

    let mut listener = TlsListener::bind(&reactor, server, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = spawner
        .spawn_local_with_handle(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.handshake().await.unwrap();
            assert_eq!(stream.alpn_protocol(), b"http/1.1".to_vec());
            let mut buf = [0u8; 16];
            let _ = stream.recv(&mut buf).await;
            stream.shutdown().await.unwrap();
            stream.close().unwrap();
        })
        .unwrap();

    let reactor_for_client = driver.reactor();
    driver.block_on(async move {
        let mut stream = TlsStream::new(&reactor_for_client, client);
        stream.connect(addr).await.unwrap();
        stream.handshake().await.unwrap();
        assert_eq!(stream.alpn_protocol(), b"http/1.1".to_vec());
        stream.shutdown().await.unwrap();
        stream.close().unwrap();
        server_task.await;
    });
}

// A raw client that slices its first flight into two TCP segments with a
// short gap. The server's recv sub-task must pick up both segments across
// two readiness edges without losing bytes.
#[test]
fn partial_client_hello_across_two_segments() {
    let fixture = generate_certs(&["localhost"]);
    let server = server_ctx(&fixture);

    let ca_pem = std::fs::read(fixture.cert_file.path()).unwrap();

    let mut driver = Driver::new().unwrap();
    let reactor = driver.reactor();

    let mut listener = TlsListener::bind(&reactor, server, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let client_thread = std::thread::spawn(move || {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let mut conn = rustls::ClientConnection::new(
            Arc::new(config),
            "localhost".try_into().unwrap(),
        )
        .unwrap();

        let mut sock = std::net::TcpStream::connect(addr).unwrap();
        sock.set_nodelay(true).unwrap();

        // Capture the first flight and send it in two halves.
        let mut hello = Vec::new();
        while conn.wants_write() {
            conn.write_tls(&mut hello).unwrap();
        }
        let mid = hello.len() / 2;
        sock.write_all(&hello[..mid]).unwrap();
        sock.flush().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        sock.write_all(&hello[mid..]).unwrap();
        sock.flush().unwrap();

        while conn.is_handshaking() {
            conn.complete_io(&mut sock).unwrap();
        }

        conn.writer().write_all(b"ping").unwrap();
        while conn.wants_write() {
            conn.write_tls(&mut sock).unwrap();
        }

        let mut echoed = Vec::new();
        while echoed.len() < 4 {
            if conn.read_tls(&mut sock).unwrap() == 0 {
                panic!("server closed before echoing");
            }
            conn.process_new_packets().unwrap();
            let mut chunk = [0u8; 16];
            match conn.reader().read(&mut chunk) {
                Ok(n) => echoed.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("client read failed: {e}"),
            }
        }
        assert_eq!(&echoed, b"ping");

        conn.send_close_notify();
        while conn.wants_write() {
            conn.write_tls(&mut sock).unwrap();
        }
    });

    driver.block_on(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.handshake().await.unwrap();
        assert!(stream.is_handshake_completed());

        let mut buf = [0u8; 16];
        let n = stream.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        stream.send(&buf[..n]).await.unwrap();

        let n = stream.recv(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        stream.shutdown().await.unwrap();
        stream.close().unwrap();
    });

    client_thread.join().unwrap();
}
