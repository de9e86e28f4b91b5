//! TCP, TLS, and WebSocket transport for peer connections.
//!
//! Every transport exposes the same capability set: send a byte chunk,
//! receive the next inbound chunk, close. Raw streams hand the assembler
//! whatever the socket yields; WebSocket transports yield one chunk per
//! binary frame.

use crate::peer_url::{PeerUrl, Scheme};
use crate::SessionError;
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::warn;

/// Unified raw stream, plain TCP or TLS-wrapped.
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS stream accepted by a listener
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// TLS stream established by a dialer
    #[cfg(feature = "tls")]
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Peer address of the underlying socket.
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// An established peer connection, before it is split for the worker.
pub enum Connection {
    /// Framed byte stream (TCP or TLS)
    Stream(IoStream),
    /// Dialed WebSocket
    WsClient(WebSocketStream<MaybeTlsStream<TcpStream>>),
    /// Accepted WebSocket
    WsServer(WebSocketStream<IoStream>),
}

impl Connection {
    /// Write one chunk and flush it.
    pub async fn send(&mut self, bytes: Bytes) -> Result<(), SessionError> {
        match self {
            Connection::Stream(io) => {
                io.write_all(&bytes).await?;
                io.flush().await?;
                Ok(())
            }
            Connection::WsClient(ws) => Ok(ws.send(Message::Binary(bytes.to_vec())).await?),
            Connection::WsServer(ws) => Ok(ws.send(Message::Binary(bytes.to_vec())).await?),
        }
    }

    /// Receive the next inbound chunk; `None` is a clean close.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, SessionError> {
        match self {
            Connection::Stream(io) => recv_stream(io).await,
            Connection::WsClient(ws) => recv_ws_stream(ws).await,
            Connection::WsServer(ws) => recv_ws_stream(ws).await,
        }
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        match self {
            Connection::Stream(io) => {
                let (r, w) = tokio::io::split(io);
                (ConnectionReader::Stream(r), ConnectionWriter::Stream(w))
            }
            Connection::WsClient(ws) => {
                let (sink, stream) = ws.split();
                (
                    ConnectionReader::WsClient(stream),
                    ConnectionWriter::WsClient(sink),
                )
            }
            Connection::WsServer(ws) => {
                let (sink, stream) = ws.split();
                (
                    ConnectionReader::WsServer(stream),
                    ConnectionWriter::WsServer(sink),
                )
            }
        }
    }
}

/// Read half of a split [`Connection`].
pub enum ConnectionReader {
    /// Framed byte stream
    Stream(ReadHalf<IoStream>),
    /// Dialed WebSocket
    WsClient(SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>),
    /// Accepted WebSocket
    WsServer(SplitStream<WebSocketStream<IoStream>>),
}

impl ConnectionReader {
    /// Receive the next inbound chunk; `None` is a clean close.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, SessionError> {
        match self {
            ConnectionReader::Stream(io) => recv_stream(io).await,
            ConnectionReader::WsClient(ws) => recv_ws_stream(ws).await,
            ConnectionReader::WsServer(ws) => recv_ws_stream(ws).await,
        }
    }
}

/// Write half of a split [`Connection`].
pub enum ConnectionWriter {
    /// Framed byte stream
    Stream(WriteHalf<IoStream>),
    /// Dialed WebSocket
    WsClient(SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>),
    /// Accepted WebSocket
    WsServer(SplitSink<WebSocketStream<IoStream>, Message>),
}

impl ConnectionWriter {
    /// Write one chunk and flush it.
    pub async fn send(&mut self, bytes: Bytes) -> Result<(), SessionError> {
        match self {
            ConnectionWriter::Stream(io) => {
                io.write_all(&bytes).await?;
                io.flush().await?;
                Ok(())
            }
            ConnectionWriter::WsClient(ws) => Ok(ws.send(Message::Binary(bytes.to_vec())).await?),
            ConnectionWriter::WsServer(ws) => Ok(ws.send(Message::Binary(bytes.to_vec())).await?),
        }
    }

    /// Shut the connection down cleanly.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        match self {
            ConnectionWriter::Stream(io) => Ok(io.shutdown().await?),
            ConnectionWriter::WsClient(ws) => Ok(ws.close().await?),
            ConnectionWriter::WsServer(ws) => Ok(ws.close().await?),
        }
    }
}

async fn recv_stream<R: AsyncRead + Unpin>(io: &mut R) -> Result<Option<Bytes>, SessionError> {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let n = io.read_buf(&mut buf).await?;
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(buf.freeze()))
    }
}

async fn recv_ws_stream<S>(ws: &mut S) -> Result<Option<Bytes>, SessionError>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(payload))) => return Ok(Some(payload.into())),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Text(_))) => {
                warn!("ignoring text frame on binary websocket");
                continue;
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Bind a TCP listener for any scheme.
pub async fn listen_tcp(addr: &str) -> Result<TcpListener, SessionError> {
    Ok(TcpListener::bind(addr).await?)
}

/// Dial a peer by URL, performing the scheme's transport handshake.
pub async fn connect(
    url: &PeerUrl,
    #[cfg_attr(not(feature = "tls"), allow(unused_variables))] tls: Option<&TlsClientConfig>,
) -> Result<Connection, SessionError> {
    match url.scheme {
        Scheme::Rnp => {
            let tcp = TcpStream::connect(url.authority()).await?;
            Ok(Connection::Stream(IoStream::Plain(tcp)))
        }
        Scheme::Rnps => {
            #[cfg(feature = "tls")]
            {
                let tls = tls.ok_or(SessionError::TlsUnavailable)?;
                let tcp = TcpStream::connect(url.authority()).await?;
                let stream = tls::connect_tls(tls, tcp, &url.host).await?;
                Ok(Connection::Stream(stream))
            }
            #[cfg(not(feature = "tls"))]
            Err(SessionError::TlsUnavailable)
        }
        Scheme::Ws => {
            let (ws, _) = tokio_tungstenite::connect_async(url.websocket_url()).await?;
            Ok(Connection::WsClient(ws))
        }
        Scheme::Wss => {
            #[cfg(feature = "tls")]
            {
                let tls = tls.ok_or(SessionError::TlsUnavailable)?;
                let connector =
                    tokio_tungstenite::Connector::Rustls(tls.client_config.clone());
                let (ws, _) = tokio_tungstenite::connect_async_tls_with_config(
                    url.websocket_url(),
                    None,
                    false,
                    Some(connector),
                )
                .await?;
                Ok(Connection::WsClient(ws))
            }
            #[cfg(not(feature = "tls"))]
            Err(SessionError::TlsUnavailable)
        }
    }
}

/// Complete an accepted TCP socket into a [`Connection`] for its scheme.
///
/// Returns the peer's DER certificate when the scheme is TLS-wrapped.
pub async fn accept(
    scheme: Scheme,
    tcp: TcpStream,
    #[cfg_attr(not(feature = "tls"), allow(unused_variables))] tls: Option<&TlsServer>,
) -> Result<(Connection, Option<Vec<u8>>), SessionError> {
    match scheme {
        Scheme::Rnp => Ok((Connection::Stream(IoStream::Plain(tcp)), None)),
        Scheme::Ws => {
            let ws = tokio_tungstenite::accept_async(IoStream::Plain(tcp)).await?;
            Ok((Connection::WsServer(ws), None))
        }
        Scheme::Rnps => {
            #[cfg(feature = "tls")]
            {
                let tls = tls.ok_or(SessionError::TlsUnavailable)?;
                let (stream, cert) = tls::accept_tls(tls, tcp).await?;
                Ok((Connection::Stream(stream), cert))
            }
            #[cfg(not(feature = "tls"))]
            Err(SessionError::TlsUnavailable)
        }
        Scheme::Wss => {
            #[cfg(feature = "tls")]
            {
                let tls = tls.ok_or(SessionError::TlsUnavailable)?;
                let (stream, cert) = tls::accept_tls(tls, tcp).await?;
                let ws = tokio_tungstenite::accept_async(stream).await?;
                Ok((Connection::WsServer(ws), cert))
            }
            #[cfg(not(feature = "tls"))]
            Err(SessionError::TlsUnavailable)
        }
    }
}

/// TLS client configuration for dialed connections.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsClientConfig {
    /// Rustls client configuration
    pub client_config: std::sync::Arc<rustls::ClientConfig>,
}

/// TLS client configuration for dialed connections.
#[cfg(not(feature = "tls"))]
#[derive(Clone)]
pub struct TlsClientConfig;

/// TLS listener-side acceptor.
#[cfg(feature = "tls")]
pub struct TlsServer {
    acceptor: tokio_rustls::TlsAcceptor,
}

/// TLS listener-side acceptor.
#[cfg(not(feature = "tls"))]
pub struct TlsServer;

#[cfg(feature = "tls")]
/// TLS configuration and certificate identity helpers.
pub mod tls {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::sync::Arc;
    use tokio_rustls::TlsAcceptor;
    use tracing::debug;

    fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, SessionError> {
        let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_bytes()).collect();
        let certs = certs.map_err(|e| SessionError::Tls(format!("bad certificate PEM: {}", e)))?;
        if certs.is_empty() {
            return Err(SessionError::Tls("no certificates in PEM".to_string()));
        }
        Ok(certs)
    }

    fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, SessionError> {
        let keys: Result<Vec<_>, _> =
            rustls_pemfile::pkcs8_private_keys(&mut pem.as_bytes()).collect();
        let mut keys = keys.map_err(|e| SessionError::Tls(format!("bad key PEM: {}", e)))?;
        if keys.is_empty() {
            return Err(SessionError::Tls("no private key in PEM".to_string()));
        }
        Ok(PrivateKeyDer::from(keys.remove(0)))
    }

    fn root_store(ca_pem: &str) -> Result<RootCertStore, SessionError> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(ca_pem)? {
            roots
                .add(cert)
                .map_err(|e| SessionError::Tls(format!("bad CA certificate: {}", e)))?;
        }
        Ok(roots)
    }

    /// Build a listener configuration. When `ca_pem` is present, peers must
    /// present a certificate signed by it (mutual TLS).
    pub fn make_server_config(
        cert_pem: &str,
        key_pem: &str,
        ca_pem: Option<&str>,
    ) -> Result<ServerConfig, SessionError> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = parse_certs(cert_pem)?;
        let key = parse_key(key_pem)?;

        let builder = ServerConfig::builder();
        let config = match ca_pem {
            Some(ca_pem) => {
                let verifier =
                    rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store(ca_pem)?))
                        .build()
                        .map_err(|e| {
                            SessionError::Tls(format!("client verifier setup failed: {}", e))
                        })?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key),
        }
        .map_err(|e| SessionError::Tls(format!("server certificate rejected: {}", e)))?;

        Ok(config)
    }

    /// Build a dialer configuration trusting `ca_pem`, optionally presenting
    /// a client certificate.
    pub fn make_client_config(
        ca_pem: &str,
        client_cert: Option<(&str, &str)>,
    ) -> Result<ClientConfig, SessionError> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let builder = ClientConfig::builder().with_root_certificates(root_store(ca_pem)?);
        let config = match client_cert {
            Some((cert_pem, key_pem)) => builder
                .with_client_auth_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)
                .map_err(|e| SessionError::Tls(format!("client certificate rejected: {}", e)))?,
            None => builder.with_no_client_auth(),
        };

        Ok(config)
    }

    /// Wrap a server configuration into an acceptor.
    pub fn tls_acceptor(config: ServerConfig) -> TlsServer {
        TlsServer {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Accept a TLS connection, returning the stream and the peer's leaf
    /// certificate if one was presented.
    pub async fn accept_tls(
        server: &TlsServer,
        tcp: TcpStream,
    ) -> Result<(IoStream, Option<Vec<u8>>), SessionError> {
        let stream = server
            .acceptor
            .accept(tcp)
            .await
            .map_err(|e| SessionError::Tls(format!("TLS accept failed: {}", e)))?;

        let peer_cert = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());

        Ok((IoStream::Tls(stream), peer_cert))
    }

    /// Dial-side TLS handshake over an established TCP stream.
    pub async fn connect_tls(
        tls: &TlsClientConfig,
        tcp: TcpStream,
        sni: &str,
    ) -> Result<IoStream, SessionError> {
        let connector = tokio_rustls::TlsConnector::from(tls.client_config.clone());
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| SessionError::Tls(format!("invalid server name {:?}", sni)))?;

        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| SessionError::Tls(format!("TLS connect failed: {}", e)))?;

        debug!(sni, "TLS connection established");
        Ok(IoStream::TlsClient(stream))
    }

    /// Node identity from a certificate: the subject common name.
    pub fn extract_common_name(cert_der: &[u8]) -> Result<String, SessionError> {
        let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
            .map_err(|e| SessionError::Tls(format!("unparseable certificate: {:?}", e)))?;

        cert.subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(|cn| cn.to_string())
            .ok_or_else(|| SessionError::Tls("certificate has no common name".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_connect_and_chunk_roundtrip() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (mut conn, cert) = accept(Scheme::Rnp, tcp, None).await.unwrap();
            assert!(cert.is_none());
            conn.recv().await.unwrap().unwrap()
        });

        let url = PeerUrl::parse_peer(&format!("rnp://{}", addr)).unwrap();
        let mut conn = connect(&url, None).await.unwrap();
        conn.send(Bytes::from_static(b"ping over tcp")).await.unwrap();

        assert_eq!(&server.await.unwrap()[..], b"ping over tcp");
    }

    #[tokio::test]
    async fn test_websocket_binary_roundtrip() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (mut conn, _) = accept(Scheme::Ws, tcp, None).await.unwrap();
            let chunk = conn.recv().await.unwrap().unwrap();
            conn.send(chunk.clone()).await.unwrap();
            chunk
        });

        let url = PeerUrl::parse_peer(&format!("ws://{}", addr)).unwrap();
        let mut conn = connect(&url, None).await.unwrap();
        conn.send(Bytes::from_static(b"ws frame")).await.unwrap();
        let echoed = conn.recv().await.unwrap().unwrap();

        assert_eq!(&echoed[..], b"ws frame");
        assert_eq!(&server.await.unwrap()[..], b"ws frame");
    }

    #[tokio::test]
    async fn test_split_halves_work_independently() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (conn, _) = accept(Scheme::Rnp, tcp, None).await.unwrap();
            let (mut reader, mut writer) = conn.split();
            let chunk = reader.recv().await.unwrap().unwrap();
            writer.send(chunk).await.unwrap();
        });

        let url = PeerUrl::parse_peer(&format!("rnp://{}", addr)).unwrap();
        let (mut reader, mut writer) = connect(&url, None).await.unwrap().split();
        writer.send(Bytes::from_static(b"split")).await.unwrap();
        assert_eq!(&reader.recv().await.unwrap().unwrap()[..], b"split");
        server.await.unwrap();
    }
}
