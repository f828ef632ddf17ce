use std::io::{self, Cursor, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use portmux_protocol::{HandshakeRole, PolicyRejection, StreamOptions, StreamPrologue};
use portmux_transport::{HandshakeError, MultiStream, TlsContext, Transport, UsageError};

/// Transport double with scripted input, captured output, and call counters.
#[derive(Debug, Default)]
struct MockTransport {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
    reads: usize,
    writes: usize,
    shutdown_calls: usize,
    cancel_calls: usize,
}

impl MockTransport {
    fn with_input(bytes: &[u8]) -> Self {
        Self {
            input: Cursor::new(bytes.to_vec()),
            ..Self::default()
        }
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads += 1;
        self.input.read(buf)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes += 1;
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn shutdown(&mut self, _how: Shutdown) -> io::Result<()> {
        self.shutdown_calls += 1;
        Ok(())
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.cancel_calls += 1;
        Ok(())
    }
}

fn server_stream(input: &[u8], options: StreamOptions) -> MultiStream<MockTransport> {
    MultiStream::new(MockTransport::with_input(input), options, TlsContext::none())
}

#[test]
fn permissive_server_accepts_plain_http_without_detection() {
    let mut stream = server_stream(b"GET / HTTP/1.1\r\n", StreamOptions::permissive());
    stream.handshake(HandshakeRole::Server).expect("plain handshake");

    assert!(stream.is_ready());
    assert!(!stream.is_tls());
    // The permissive matrix goes straight to plaintext; nothing was sniffed.
    assert_eq!(stream.detected_prologue(), None);

    let mut first = [0u8; 6];
    assert_eq!(stream.read(&mut first).expect("first read"), 6);
    assert_eq!(&first, b"GET / ");

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("remaining bytes");
    assert_eq!(rest, b"HTTP/1.1\r\n");
}

#[test]
fn detecting_server_replays_the_sniffed_window_before_the_transport() {
    let options = StreamOptions::permissive().enable_server_tls(true);
    let mut stream = server_stream(b"GET / HTTP/1.1\r\n", options);
    stream.handshake(HandshakeRole::Server).expect("detected plain");

    assert_eq!(stream.detected_prologue(), Some(StreamPrologue::Plaintext));

    // The replay window is served first, without touching the transport.
    let reads_after_detect = stream.transport().expect("transport").reads;
    let mut first = [0u8; 6];
    assert_eq!(stream.read(&mut first).expect("replayed read"), 5);
    assert_eq!(&first[..5], b"GET /");
    assert_eq!(stream.transport().expect("transport").reads, reads_after_detect);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("remaining bytes");
    assert_eq!(rest, b" HTTP/1.1\r\n");
}

#[test]
fn tls_client_hello_reaches_the_engine_not_the_application() {
    // A complete handshake record carrying junk: the TLS engine must be
    // constructed, fed the sniffed bytes, and be the one to refuse them.
    let mut input = vec![0x16, 0x03, 0x01, 0x00, 0x20];
    input.extend_from_slice(&[0xff; 32]);

    let options = StreamOptions::permissive().enable_server_tls(true);
    let context = TlsContext::server(test_server_config());
    let mut stream = MultiStream::new(MockTransport::with_input(&input), options, context);

    let err = stream
        .handshake(HandshakeRole::Server)
        .expect_err("junk hello");
    assert!(matches!(err, HandshakeError::Tls(_)), "got {err:?}");
    assert_eq!(stream.detected_prologue(), Some(StreamPrologue::Tls));
    assert!(stream.is_failed());
}

#[test]
fn plain_peer_is_rejected_when_tls_is_required_and_the_transport_survives() {
    let options = StreamOptions::permissive()
        .enable_server_tls(true)
        .require_server_tls(true);
    let mut stream = server_stream(b"GET / HTTP/1.1\r\n", options);

    let err = stream
        .handshake(HandshakeRole::Server)
        .expect_err("policy refusal");
    assert!(matches!(
        err,
        HandshakeError::PolicyRejected(PolicyRejection::PlaintextDisallowed)
    ));
    assert!(stream.is_failed());

    // The adapter never closes the transport on a failed handshake, and the
    // bytes detection consumed ride along: the recovered stream still
    // carries the peer's bytes exactly as sent.
    let mut recovered = stream.into_stream().expect("transport recovered");
    assert_eq!(recovered.get_ref().shutdown_calls, 0);
    assert_eq!(recovered.replay_len(), 5);

    let mut bytes = Vec::new();
    recovered.read_to_end(&mut bytes).expect("drain");
    assert_eq!(bytes, b"GET / HTTP/1.1\r\n");
}

#[test]
fn proxy_preamble_is_detected_and_refused() {
    for options in [
        StreamOptions::permissive().enable_server_tls(true),
        StreamOptions::permissive().require_server_proxy(true),
        StreamOptions::permissive()
            .require_server_tls(true)
            .require_server_proxy(true),
    ] {
        let mut stream = server_stream(b"PROXY TCP4 1.2.3.4 5.6.7.8 11111 443\r\n", options);
        let err = stream
            .handshake(HandshakeRole::Server)
            .expect_err("proxy refusal");
        assert!(matches!(
            err,
            HandshakeError::PolicyRejected(PolicyRejection::ProxyUnsupported)
        ));
        assert_eq!(stream.detected_prologue(), Some(StreamPrologue::ProxyV1));
    }
}

#[test]
fn plain_client_handshake_performs_no_transport_io() {
    let mut stream = MultiStream::new(
        MockTransport::default(),
        StreamOptions::permissive(),
        TlsContext::none(),
    );
    stream.handshake(HandshakeRole::Client).expect("plain client");

    let transport = stream.transport().expect("transport");
    assert_eq!(transport.reads, 0);
    assert_eq!(transport.writes, 0);
}

#[test]
fn tls_client_starts_writing_immediately_without_peeking() {
    let options = StreamOptions::permissive().use_client_tls(true);
    let context = TlsContext::client(test_client_config(), test_server_name());
    let mut stream = MultiStream::new(MockTransport::default(), options, context);

    // The scripted transport has no input, so the handshake dies waiting for
    // the server flight; what matters is what happened first.
    let err = stream
        .handshake(HandshakeRole::Client)
        .expect_err("no server to answer");
    assert!(matches!(err, HandshakeError::Transport(_)));

    let recovered = stream.into_stream().expect("transport recovered");
    let transport = recovered.get_ref();
    assert!(transport.writes > 0, "ClientHello was never sent");
    assert_eq!(
        transport.output.first(),
        Some(&0x16),
        "first transport bytes are a TLS handshake record"
    );
}

#[test]
fn buffered_plain_handshake_rejects_a_preload() {
    let mut stream = server_stream(b"", StreamOptions::permissive());
    let err = stream
        .handshake_buffered(HandshakeRole::Server, &[0x01])
        .expect_err("preload on the plain path");
    assert_eq!(err.usage(), Some(UsageError::PreloadNotEmpty));
}

#[test]
fn buffered_detect_handshake_classifies_the_preload_without_reading() {
    let options = StreamOptions::permissive().enable_server_tls(true);
    let mut stream = server_stream(b" HTTP/1.1\r\n", options);
    stream
        .handshake_buffered(HandshakeRole::Server, b"GET /")
        .expect("preloaded plain");

    assert_eq!(stream.detected_prologue(), Some(StreamPrologue::Plaintext));
    assert_eq!(stream.transport().expect("transport").reads, 0);

    let mut all = Vec::new();
    stream.read_to_end(&mut all).expect("replay then transport");
    assert_eq!(all, b"GET / HTTP/1.1\r\n");
}

#[test]
fn buffered_detect_handshake_rejects_an_oversized_preload() {
    let options = StreamOptions::permissive().enable_server_tls(true);
    let mut stream = server_stream(b"", options);
    let err = stream
        .handshake_buffered(HandshakeRole::Server, b"GET / ")
        .expect_err("six bytes exceed the window");
    assert_eq!(err.usage(), Some(UsageError::PreloadTooLarge));
}

#[test]
fn operations_before_handshake_report_not_connected() {
    let mut stream = server_stream(b"", StreamOptions::permissive());

    let mut buf = [0u8; 4];
    let err = stream.read(&mut buf).expect_err("read before handshake");
    assert_eq!(err.kind(), io::ErrorKind::NotConnected);

    let err = stream.write(b"x").expect_err("write before handshake");
    assert_eq!(err.kind(), io::ErrorKind::NotConnected);

    let err = stream.shutdown().expect_err("shutdown before handshake");
    assert_eq!(err.usage(), Some(UsageError::NotHandshaken));
}

#[test]
fn a_stream_performs_at_most_one_handshake() {
    let mut stream = server_stream(b"GET / HTTP/1.1\r\n", StreamOptions::permissive());
    stream.handshake(HandshakeRole::Server).expect("first handshake");

    let err = stream
        .handshake(HandshakeRole::Server)
        .expect_err("second handshake");
    assert_eq!(err.usage(), Some(UsageError::AlreadyHandshaken));

    // Failure is just as final.
    let options = StreamOptions::permissive().require_server_tls(true);
    let mut failed = server_stream(b"GET / HTTP/1.1\r\n", options);
    let _ = failed.handshake(HandshakeRole::Server).expect_err("refused");
    let err = failed.handshake(HandshakeRole::Server).expect_err("retry");
    assert_eq!(err.usage(), Some(UsageError::HandshakeFailed));
}

#[test]
fn shutdown_is_idempotent_and_touches_the_transport_once() {
    let mut stream = server_stream(b"", StreamOptions::permissive());
    stream.handshake(HandshakeRole::Server).expect("plain handshake");

    stream.shutdown().expect("first shutdown");
    assert!(stream.is_shut_down());
    assert_eq!(stream.transport().expect("transport").shutdown_calls, 1);

    stream.shutdown().expect("second shutdown is a no-op");
    assert_eq!(stream.transport().expect("transport").shutdown_calls, 1);
}

#[test]
fn the_active_stream_variant_is_fixed_once_the_handshake_resolves() {
    let options = StreamOptions::permissive().enable_server_tls(true);
    let mut stream = server_stream(b"GET / HTTP/1.1\r\n", options);
    stream.handshake(HandshakeRole::Server).expect("detected plain");

    assert!(stream.is_ready());
    assert!(!stream.is_tls());

    let mut sink = Vec::new();
    stream.read_to_end(&mut sink).expect("drain");
    stream.shutdown().expect("shutdown");

    // Reads and teardown never flip the selected variant.
    assert!(stream.is_ready());
    assert!(!stream.is_tls());
}

#[test]
fn cancel_marks_the_stream_and_reaches_the_transport() {
    let mut stream = server_stream(b"", StreamOptions::permissive());
    stream.cancel().expect("cancel");
    assert_eq!(stream.transport().expect("transport").cancel_calls, 1);
}

#[test]
fn close_drops_the_transport_in_any_state() {
    let mut stream = server_stream(b"", StreamOptions::permissive());
    stream.close();
    assert!(stream.transport().is_none());
    assert!(stream.into_stream().is_none());

    let options = StreamOptions::permissive().require_server_tls(true);
    let mut failed = server_stream(b"GET / HTTP/1.1\r\n", options);
    let _ = failed.handshake(HandshakeRole::Server).expect_err("refused");
    failed.close();
    assert!(failed.transport().is_none());
}

proptest! {
    /// Detection must be invisible: whatever the peer sent arrives through
    /// the adapter exactly, with the sniffed window replayed in front of the
    /// transport's remaining bytes.
    #[test]
    fn detected_plain_path_delivers_peer_bytes_exactly(
        prefix in prop::collection::vec(32u8..127, 5),
        tail in prop::collection::vec(any::<u8>(), 0..64)
    ) {
        prop_assume!(prefix.as_slice() != b"PROXY");

        let mut payload = prefix.clone();
        payload.extend_from_slice(&tail);

        let options = StreamOptions::permissive().enable_server_tls(true);
        let mut stream = server_stream(&payload, options);
        stream.handshake(HandshakeRole::Server).expect("detected plain");

        let mut delivered = Vec::new();
        stream.read_to_end(&mut delivered).expect("drain");
        prop_assert_eq!(delivered, payload);
    }
}

// -- real TLS over loopback ---------------------------------------------------

fn test_certificate() -> (
    rustls::pki_types::CertificateDer<'static>,
    rustls::pki_types::PrivateKeyDer<'static>,
) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate self-signed certificate");
    let cert = certified.cert.der().clone();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()),
    );
    (cert, key)
}

fn test_server_config() -> Arc<rustls::ServerConfig> {
    let (cert, key) = test_certificate();
    Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .expect("server config"),
    )
}

fn test_tls_pair() -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
    let (cert, key) = test_certificate();
    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .expect("server config");

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).expect("trust anchor");
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (Arc::new(server), Arc::new(client))
}

fn test_client_config() -> Arc<rustls::ClientConfig> {
    test_tls_pair().1
}

fn test_server_name() -> rustls::pki_types::ServerName<'static> {
    rustls::pki_types::ServerName::try_from("localhost").expect("valid DNS name")
}

#[test]
fn detected_tls_end_to_end_over_loopback() {
    let (server_config, client_config) = test_tls_pair();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let client = thread::spawn(move || {
        let socket = TcpStream::connect(addr).expect("connect");
        let options = StreamOptions::permissive().use_client_tls(true);
        let context = TlsContext::client(client_config, test_server_name());
        let mut stream = MultiStream::new(socket, options, context);

        stream.handshake(HandshakeRole::Client).expect("client handshake");
        assert!(stream.is_tls());

        stream.write_all(b"hello").expect("request");
        stream.flush().expect("flush");

        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).expect("reply");
        assert_eq!(&reply, b"world");

        stream.shutdown().expect("client shutdown");
    });

    let (socket, _peer) = listener.accept().expect("accept");
    let options = StreamOptions::permissive().enable_server_tls(true);
    let mut stream = MultiStream::new(socket, options, TlsContext::server(server_config));

    stream.handshake(HandshakeRole::Server).expect("server handshake");
    assert!(stream.is_tls());
    assert_eq!(stream.detected_prologue(), Some(StreamPrologue::Tls));

    let mut request = [0u8; 5];
    stream.read_exact(&mut request).expect("request");
    assert_eq!(&request, b"hello");

    stream.write_all(b"world").expect("reply");
    stream.flush().expect("flush");

    stream.shutdown().expect("server shutdown");
    stream.shutdown().expect("second shutdown is a no-op");

    client.join().expect("client thread");
}

#[test]
fn plain_and_tls_clients_share_one_listener_configuration() {
    let (server_config, client_config) = test_tls_pair();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let options = StreamOptions::permissive().enable_server_tls(true);
    let context = TlsContext::server(server_config);

    let client = thread::spawn(move || {
        // First connection: cleartext.
        let socket = TcpStream::connect(addr).expect("connect plain");
        let mut plain = MultiStream::new(socket, StreamOptions::permissive(), TlsContext::none());
        plain.handshake(HandshakeRole::Client).expect("plain client");
        plain.write_all(b"PING /1.0\r\n").expect("plain request");
        plain.flush().expect("flush");
        drop(plain);

        // Second connection: TLS.
        let socket = TcpStream::connect(addr).expect("connect tls");
        let tls_options = StreamOptions::permissive().use_client_tls(true);
        let tls_context = TlsContext::client(client_config, test_server_name());
        let mut tls = MultiStream::new(socket, tls_options, tls_context);
        tls.handshake(HandshakeRole::Client).expect("tls client");
        tls.write_all(b"PING /1.0\r\n").expect("tls request");
        tls.flush().expect("flush");
        tls.shutdown().expect("tls client shutdown");
    });

    let mut dispositions = Vec::new();
    for _ in 0..2 {
        let (socket, _peer) = listener.accept().expect("accept");
        let mut stream = MultiStream::new(socket, options, context.clone());
        stream.handshake(HandshakeRole::Server).expect("server handshake");

        let mut request = [0u8; 11];
        stream.read_exact(&mut request).expect("request");
        assert_eq!(&request, b"PING /1.0\r\n");

        dispositions.push(stream.detected_prologue());
    }

    assert_eq!(
        dispositions,
        vec![Some(StreamPrologue::Plaintext), Some(StreamPrologue::Tls)]
    );

    client.join().expect("client thread");
}
