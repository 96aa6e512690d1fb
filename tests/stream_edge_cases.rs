//! Boundary behaviors of the stream awaitables.

mod common;

use common::{client_ctx, generate_certs, server_ctx};
use futures::task::LocalSpawnExt;
use std::time::Duration;
use tlscomm::{Driver, ErrorKind, TlsListener, TlsStream};

#[test]
fn zero_length_send_and_recv_resolve_immediately() {
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
            let mut buf = [0u8; 16];
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

        // A zero-length send resolves without touching the socket.
        let n = stream.send(b"").await.unwrap();
        assert_eq!(n, 0);

        // A recv into an empty buffer resolves immediately as well.
        let mut empty: [u8; 0] = [];
        let n = stream.recv(&mut empty).await.unwrap();
        assert_eq!(n, 0);

        stream.shutdown().await.unwrap();
        stream.close().unwrap();
        server_task.await;
    });
}

#[test]
fn peer_close_yields_empty_payload_twice() {
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

            let mut buf = [0u8; 16];
            let n = stream.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"bye");

            // Close our direction; the client observes end-of-stream.
            stream.shutdown().await.unwrap();
            stream.close().unwrap();
        })
        .unwrap();

    let reactor_for_client = driver.reactor();
    driver.block_on(async move {
        let mut stream = TlsStream::new(&reactor_for_client, client);
        stream.connect(addr).await.unwrap();
        stream.handshake().await.unwrap();
        stream.send(b"bye").await.unwrap();

        let mut buf = [0u8; 16];
        let n = stream.recv(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        // End-of-stream is sticky.
        let n = stream.recv(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        stream.shutdown().await.unwrap();
        stream.close().unwrap();
        server_task.await;
    });
}

// The accepting side vanishes without speaking TLS: the handshake must fail
// as a handshake error, not report a clean peer close.
#[test]
fn abort_during_handshake_is_a_handshake_failure() {
    let fixture = generate_certs(&["localhost"]);
    let client = client_ctx(&fixture);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let abort_thread = std::thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        drop(socket);
    });

    let mut driver = Driver::new().unwrap();
    let reactor = driver.reactor();
    driver.block_on(async move {
        let mut stream = TlsStream::new(&reactor, client);
        stream.connect(addr).await.unwrap();
        let err = stream.handshake().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeFailed);
        assert_ne!(err.kind(), ErrorKind::PeerClosed);
        stream.close().unwrap();
    });

    abort_thread.join().unwrap();
}

#[test]
fn handshake_times_out_against_a_silent_peer() {
    let fixture = generate_certs(&["localhost"]);
    let client = client_ctx(&fixture);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let silent_thread = std::thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_millis(500));
        drop(socket);
    });

    let mut driver = Driver::new().unwrap();
    let reactor = driver.reactor();
    driver.block_on(async move {
        let mut stream = TlsStream::new(&reactor, client);
        stream.connect(addr).await.unwrap();
        let err = stream
            .handshake_timed(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
        stream.close().unwrap();
    });

    silent_thread.join().unwrap();
}

#[test]
fn hostname_mismatch_fails_verification() {
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
            // The client aborts once it sees a certificate for the wrong
            // name; the handshake must not complete.
            let _ = stream.handshake().await;
            stream.close().unwrap();
        })
        .unwrap();

    let reactor_for_client = driver.reactor();
    driver.block_on(async move {
        let mut stream = TlsStream::new(&reactor_for_client, client);
        // The certificate only covers "localhost".
        stream.set_hostname("wrong.test").unwrap();
        stream.connect(addr).await.unwrap();
        let err = stream.handshake().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeFailed);
        assert!(stream.verify_result().is_some());
        stream.close().unwrap();
        server_task.await;
    });
}

#[test]
fn connect_to_a_dead_port_fails() {
    let fixture = generate_certs(&["localhost"]);
    let client = client_ctx(&fixture);

    // Bind and drop to find a port nothing listens on.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let mut driver = Driver::new().unwrap();
    let reactor = driver.reactor();
    driver.block_on(async move {
        let mut stream = TlsStream::new(&reactor, client);
        let result = stream.connect(addr).await;
        assert!(result.is_err());
        assert!(!stream.is_handshake_completed());
        stream.close().unwrap();
    });
}

// The destructor must not release the socket: after the client drops its
// stream without close(), the server sees neither data nor end-of-stream.
#[test]
fn dropping_a_stream_does_not_close_the_socket() {
    let fixture = generate_certs(&["localhost"]);
    let server = server_ctx(&fixture);
    let client = client_ctx(&fixture);

    let mut driver = Driver::new().unwrap();
    let reactor = driver.reactor();
    let spawner = driver.spawner();

    let mut listener = TlsListener::bind(&reactor, server, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let reactor_for_server = driver.reactor();
    let server_task = spawner
        .spawn_local_with_handle(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.handshake().await.unwrap();

            // The connection must still be open: no bytes and no EOF, so a
            // bounded recv runs out the clock.
            let mut buf = [0u8; 16];
            let err = tlscomm::timeout(
                &reactor_for_server,
                Duration::from_millis(200),
                stream.recv(&mut buf),
            )
            .await
            .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Timeout);

            stream.close().unwrap();
        })
        .unwrap();

    let reactor_for_client = driver.reactor();
    driver.block_on(async move {
        let mut stream = TlsStream::new(&reactor_for_client, client);
        stream.connect(addr).await.unwrap();
        stream.handshake().await.unwrap();
        drop(stream);
        server_task.await;
    });
}

#[test]
fn session_handle_resumes_across_connections() {
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
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                stream.handshake().await.unwrap();
                let mut buf = [0u8; 16];
                let n = stream.recv(&mut buf).await.unwrap();
                assert_eq!(n, 0);
                stream.shutdown().await.unwrap();
                stream.close().unwrap();
            }
        })
        .unwrap();

    let reactor_for_client = driver.reactor();
    driver.block_on(async move {
        let mut first = TlsStream::new(&reactor_for_client, client.clone());
        first.connect(addr).await.unwrap();
        first.handshake().await.unwrap();
        assert!(!first.is_session_reused());
        // The close handshake drains the server's session tickets, after
        // which the handle is available.
        first.shutdown().await.unwrap();
        let session = first.get_session().expect("session cached after close");
        assert_eq!(session.server_name(), "localhost");
        first.close().unwrap();

        let mut second = TlsStream::new(&reactor_for_client, client);
        assert!(second.set_session(&session));
        second.connect(addr).await.unwrap();
        second.handshake().await.unwrap();
        assert!(second.is_session_reused());
        second.shutdown().await.unwrap();
        second.close().unwrap();
        server_task.await;
    });
}
