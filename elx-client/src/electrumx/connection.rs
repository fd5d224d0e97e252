//! Transport establishment and line-delimited frame I/O.
//!
//! ElectrumX speaks newline-delimited JSON over TCP, optionally wrapped
//! in TLS, optionally dialed through a SOCKS5 proxy (typically Tor). This
//! module produces a byte stream for any of those combinations and splits
//! it into a [`FrameReader`] owned by the read loop and a [`FrameWriter`]
//! shared by everything that sends.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, trace};

use super::error::{ElectrumError, ElectrumResult};

/// Any full-duplex byte stream a connection can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Type-erased transport (TCP, SOCKS, TLS over either, or an in-memory
/// pipe in tests).
pub type BoxedStream = Box<dyn ByteStream>;

/// Initial read buffer size. Large enough to hold a response to
/// `blockchain.block.headers` for a full 2016-header chunk without
/// repeated reallocation.
const READ_BUFFER_SIZE: usize = 2016 * 80 * 4;

/// Split "host:port" (or "[v6addr]:port") into its parts.
pub fn split_host_port(addr: &str) -> ElectrumResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ElectrumError::ConnectionFailed(format!("missing port in {}", addr)))?;
    let port = port
        .parse()
        .map_err(|_| ElectrumError::ConnectionFailed(format!("invalid port in {}", addr)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ElectrumError::ConnectionFailed(format!(
            "missing host in {}",
            addr
        )));
    }
    Ok((host.to_string(), port))
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Establish the raw transport to `addr`.
///
/// Dials directly or through the SOCKS5 proxy at `proxy`, then performs
/// a client TLS handshake if `tls` is set. Deadlines are the caller's
/// business.
pub async fn dial(
    addr: &str,
    proxy: Option<&str>,
    tls: Option<Arc<rustls::ClientConfig>>,
) -> ElectrumResult<BoxedStream> {
    let (host, port) = split_host_port(addr)?;

    let tcp = match proxy {
        Some(proxy) => {
            debug!(addr, proxy, "Dialing through SOCKS proxy");
            Socks5Stream::connect(proxy, (host.as_str(), port))
                .await?
                .into_inner()
        }
        None => {
            debug!(addr, "Dialing");
            TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| ElectrumError::ConnectionFailed(format!("{}: {}", addr, e)))?
        }
    };
    // Requests are small and latency sensitive
    tcp.set_nodelay(true)?;

    let Some(config) = tls else {
        return Ok(Box::new(tcp));
    };

    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| ElectrumError::Tls(format!("invalid server name {}: {}", host, e)))?;
    let stream = TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .map_err(|e| ElectrumError::Tls(format!("handshake with {} failed: {}", addr, e)))?;
    debug!(addr, "TLS handshake complete");

    Ok(Box::new(stream))
}

/// Split a stream into its frame reader and writer.
pub fn split(stream: BoxedStream) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    (
        FrameReader {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, read_half),
            line_buf: Vec::with_capacity(4096),
        },
        FrameWriter {
            writer: BufWriter::new(write_half),
        },
    )
}

/// Reading side: yields one frame per line.
pub struct FrameReader {
    /// Buffered reader for incoming frames
    reader: BufReader<ReadHalf<BoxedStream>>,

    /// Line buffer reused across reads
    line_buf: Vec<u8>,
}

impl FrameReader {
    /// Read the next non-empty line, without its terminator.
    ///
    /// Returns `None` on clean connection close (EOF). Frame length is
    /// unbounded. Not cancel safe: a canceled read may lose a partial
    /// frame, so only cancel it when the connection is going away.
    pub async fn read_frame(&mut self) -> ElectrumResult<Option<Vec<u8>>> {
        loop {
            self.line_buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.line_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }
        }
    }

    /// Like [`read_frame`](Self::read_frame), but fail if the line is
    /// longer than `limit` bytes. Used before the server has proven it
    /// speaks the protocol.
    pub async fn read_frame_limited(&mut self, limit: u64) -> ElectrumResult<Option<Vec<u8>>> {
        loop {
            self.line_buf.clear();
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.line_buf)
                .await?;
            if n == 0 {
                return Ok(None);
            }
            if n as u64 >= limit && self.line_buf.last() != Some(&b'\n') {
                return Err(ElectrumError::Codec(format!(
                    "frame exceeds {} bytes",
                    limit
                )));
            }
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }
        }
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let line = self.line_buf.trim_ascii();
        if line.is_empty() {
            return None;
        }
        trace!(rx = %String::from_utf8_lossy(line), "Received frame");
        Some(line.to_vec())
    }
}

/// Writing side: writes pre-encoded, newline-terminated frames.
pub struct FrameWriter {
    /// Buffered writer for outgoing frames
    writer: BufWriter<WriteHalf<BoxedStream>>,
}

impl FrameWriter {
    /// Write and flush one frame.
    pub async fn write_frame(&mut self, frame: &[u8]) -> ElectrumResult<()> {
        trace!(
            tx = %String::from_utf8_lossy(frame.strip_suffix(b"\n").unwrap_or(frame)),
            "Sending frame"
        );
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flush and close the write side of the transport.
    pub async fn shutdown(&mut self) -> ElectrumResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Scripted server for tests.
///
/// Holds the far end of an in-memory pipe. The client side goes to
/// [`ServerConn::from_stream`](super::ServerConn::from_stream); the test
/// reads the requests the client wrote and answers them, in any order.
#[cfg(test)]
pub(crate) struct FakeServer {
    reader: BufReader<ReadHalf<tokio::io::DuplexStream>>,
    writer: WriteHalf<tokio::io::DuplexStream>,
}

#[cfg(test)]
impl FakeServer {
    /// Create a linked (client stream, server) pair.
    pub fn pair() -> (tokio::io::DuplexStream, Self) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (read_half, write_half) = tokio::io::split(server);
        (
            client,
            Self {
                reader: BufReader::new(read_half),
                writer: write_half,
            },
        )
    }

    /// Receive the next request the client wrote.
    pub async fn recv(&mut self) -> serde_json::Value {
        self.try_recv().await.expect("client closed connection")
    }

    /// Receive the next request, or `None` once the client closed.
    pub async fn try_recv(&mut self) -> Option<serde_json::Value> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.expect("read failed");
        if n == 0 {
            return None;
        }
        Some(serde_json::from_str(&line).expect("client sent invalid JSON"))
    }

    /// Send a raw line (newline appended).
    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Send a JSON message.
    pub async fn send(&mut self, msg: serde_json::Value) {
        self.send_raw(&msg.to_string()).await;
    }

    /// Answer request `id` with a result.
    pub async fn reply(&mut self, id: &serde_json::Value, result: serde_json::Value) {
        self.send(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    /// Answer the version handshake, checking it is the first request.
    pub async fn accept_version(&mut self, proto: &str) {
        let req = self.recv().await;
        assert_eq!(req["method"], "server.version");
        self.reply(&req["id"], serde_json::json!(["ElectrumX 1.16.0", proto]))
            .await;
    }
}
