//! Local TCP listeners bridged to a pod port over a websocket.
//!
//! The pod-level wire format gives each forwarded port a channel pair:
//! even channels carry data both ways, odd channels carry server-side
//! errors. The first frame on each channel announces the port and is
//! skipped; an odd-channel frame afterwards ends the connection with the
//! server's message.
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::{api::{ApiObject, Pod}, Error, Result};

// Data flows through channel 0 for the single forwarded port.
const DATA_CHANNEL: u8 = 0;
const READ_CHUNK: usize = 1024 * 1024;
const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Forward a local TCP port to a port on a pod.
///
/// The target is a pod, or any resource that selects ready pods (a service,
/// a deployment); in that case a pod is picked at random per websocket and
/// reselected when a connection fails.
///
/// Use [`PortForward::start`]/[`PortForward::stop`] for a background bridge,
/// or [`PortForward::run_forever`] to serve inline until cancelled.
pub struct PortForward {
    forwarder: Arc<Forwarder>,
    addresses: Vec<String>,
    local_port: u16,
    bound_port: Option<u16>,
    task: Option<BridgeTask>,
}

struct BridgeTask {
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

struct Forwarder {
    target: ApiObject,
    remote_port: u16,
    connections: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PortForward {
    /// Forward `remote_port` on `target`, listening on `127.0.0.1` and a
    /// random free local port.
    pub fn new(target: ApiObject, remote_port: u16) -> PortForward {
        PortForward {
            forwarder: Arc::new(Forwarder {
                target,
                remote_port,
                connections: std::sync::Mutex::new(vec![]),
            }),
            addresses: vec!["127.0.0.1".to_string()],
            local_port: 0,
            bound_port: None,
            task: None,
        }
    }

    /// Listen on a fixed local port instead of picking one at random.
    pub fn local_port(mut self, port: u16) -> PortForward {
        self.local_port = port;
        self
    }

    /// Listen on the given bind addresses instead of `127.0.0.1` only.
    pub fn addresses<I, T>(mut self, addresses: I) -> PortForward
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// The local port once the listeners are bound.
    pub fn bound_port(&self) -> Option<u16> {
        self.bound_port
    }

    async fn bind(&mut self) -> Result<Vec<TcpListener>> {
        let port = if self.local_port == 0 {
            find_available_port(&self.addresses)?
        } else {
            self.local_port
        };
        let mut listeners = vec![];
        for address in &self.addresses {
            let listener = TcpListener::bind((address.as_str(), port))
                .await
                .map_err(|e| {
                    Error::ConnectionClosed(format!("failed to bind {}:{}: {}", address, port, e))
                })?;
            listeners.push(listener);
        }
        self.bound_port = Some(port);
        Ok(listeners)
    }

    /// Bind the listeners and serve in a background task; returns the local
    /// port.
    pub async fn start(&mut self) -> Result<u16> {
        if let Some(port) = self.bound_port {
            if self.task.is_some() {
                return Ok(port);
            }
        }
        let listeners = self.bind().await?;
        let port = self.bound_port.expect("bind sets the port");
        let (shutdown, shutdown_rx) = tokio::sync::oneshot::channel();
        let forwarder = self.forwarder.clone();
        let handle = tokio::spawn(async move {
            serve(forwarder, listeners, shutdown_rx).await;
        });
        self.task = Some(BridgeTask { shutdown, handle });
        Ok(port)
    }

    /// Stop the background task, close the listeners, and drain active
    /// connections.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.shutdown.send(());
            let _ = task.handle.await;
        }
        let drained: Vec<_> = {
            let mut connections = self
                .forwarder
                .connections
                .lock()
                .expect("connections lock poisoned");
            connections.drain(..).collect()
        };
        for conn in drained {
            let _ = conn.await;
        }
        self.bound_port = None;
    }

    /// Bind the listeners and serve until this future is dropped.
    pub async fn run_forever(&mut self) -> Result<()> {
        let listeners = self.bind().await?;
        let (_shutdown, shutdown_rx) = tokio::sync::oneshot::channel();
        serve(self.forwarder.clone(), listeners, shutdown_rx).await;
        Ok(())
    }
}

async fn serve(
    forwarder: Arc<Forwarder>,
    listeners: Vec<TcpListener>,
    shutdown: tokio::sync::oneshot::Receiver<()>,
) {
    let mut accept_loops = vec![];
    for listener in listeners {
        let forwarder = forwarder.clone();
        accept_loops.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::trace!("port-forward accepted connection from {}", peer);
                        let conn_forwarder = forwarder.clone();
                        let conn = tokio::spawn(async move {
                            conn_forwarder.handle_connection(stream).await;
                        });
                        forwarder
                            .connections
                            .lock()
                            .expect("connections lock poisoned")
                            .push(conn);
                    }
                    Err(e) => {
                        tracing::warn!("port-forward accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }));
    }
    let _ = shutdown.await;
    for accept in &accept_loops {
        accept.abort();
    }
}

impl Forwarder {
    async fn handle_connection(self: Arc<Forwarder>, tcp: TcpStream) {
        let result = self.bridge(tcp).await;
        if let Err(e) = result {
            tracing::debug!("port-forward connection ended: {}", e);
        }
    }

    /// Pump one accepted TCP connection over its own websocket.
    async fn bridge(&self, tcp: TcpStream) -> Result<()> {
        let socket = self.connect_websocket().await?;
        let (mut sink, mut stream) = socket.split();
        let (mut tcp_read, mut tcp_write) = tcp.into_split();

        let tcp_to_ws = async {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = tcp_read
                    .read(&mut buf)
                    .await
                    .map_err(|e| Error::ConnectionClosed(format!("tcp read failed: {}", e)))?;
                if n == 0 {
                    return Err(Error::ConnectionClosed("tcp socket closed".into()));
                }
                let mut frame = Vec::with_capacity(n + 1);
                frame.push(DATA_CHANNEL);
                frame.extend_from_slice(&buf[..n]);
                sink.send(Message::Binary(frame))
                    .await
                    .map_err(|e| Error::ConnectionClosed(format!("websocket closed: {}", e)))?;
            }
        };

        let ws_to_tcp = async {
            // The first frame on each channel announces the forwarded port.
            let mut seen_channels: Vec<u8> = vec![];
            loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(frame))) => {
                        if frame.is_empty() {
                            continue;
                        }
                        let channel = frame[0];
                        if !seen_channels.contains(&channel) {
                            seen_channels.push(channel);
                            continue;
                        }
                        if channel % 2 == 1 {
                            return Err(Error::ConnectionClosed(
                                String::from_utf8_lossy(&frame[1..]).into_owned(),
                            ));
                        }
                        tcp_write.write_all(&frame[1..]).await.map_err(|e| {
                            Error::ConnectionClosed(format!("tcp write failed: {}", e))
                        })?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(Error::ConnectionClosed("websocket closed".into()))
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(Error::ConnectionClosed(format!(
                            "websocket receive failed: {}",
                            e
                        )))
                    }
                }
            }
        };

        // Either direction failing tears the pair down.
        tokio::select! {
            r = tcp_to_ws => r,
            r = ws_to_tcp => r,
        }
    }

    /// Open the portforward websocket, reselecting the pod on failure.
    async fn connect_websocket(
        &self,
    ) -> Result<tokio_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>> {
        let mut attempts: u32 = 0;
        loop {
            let pod = self.select_pod().await?;
            let req = pod.class().portforward_request(
                pod.namespace().as_deref(),
                &pod.name()?,
                &self.remote_port.to_string(),
            )?;
            match pod.client()?.connect(req).await {
                Ok((socket, _protocol)) => return Ok(socket),
                Err(e) => {
                    attempts += 1;
                    if attempts > MAX_CONNECT_ATTEMPTS {
                        return Err(Error::ConnectionClosed(format!(
                            "unable to connect to pod: {}",
                            e
                        )));
                    }
                    tracing::debug!("port-forward connect failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempts))).await;
                }
            }
        }
    }

    /// The target pod itself, or a uniformly random ready pod behind the
    /// target's selector.
    async fn select_pod(&self) -> Result<Pod> {
        let class = self.target.class();
        if class.kind == "Pod" && class.group.is_empty() {
            return Ok(Pod(self.target.clone()));
        }
        let pods = self.target.ready_pods().await?;
        if pods.is_empty() {
            return Err(Error::NotFound("no ready pods found".into()));
        }
        let ix = rand::thread_rng().gen_range(0..pods.len());
        Ok(pods[ix].clone())
    }
}

/// Scan `[10000, 60000)` at random until every bind address reports the port
/// free via a connect probe.
fn find_available_port(addresses: &[String]) -> Result<u16> {
    let mut rng = rand::thread_rng();
    loop {
        let port: u16 = rng.gen_range(10000..60000);
        if !addresses.iter().any(|a| port_in_use(a, port)) {
            return Ok(port);
        }
    }
}

fn port_in_use(host: &str, port: u16) -> bool {
    let addr = match (host, port).to_socket_addrs().ok().and_then(|mut a| a.next()) {
        Some(addr) => addr,
        None => return false,
    };
    std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(100)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probed_ports_avoid_active_listeners() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        assert!(port_in_use("127.0.0.1", taken));

        let addresses = vec!["127.0.0.1".to_string()];
        let free = find_available_port(&addresses).unwrap();
        assert_ne!(free, taken);
        assert!((10000..60000).contains(&free));
    }

    #[test]
    fn data_frames_are_prefixed_with_the_data_channel() {
        let payload = b"GET / HTTP/1.1\r\n";
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(DATA_CHANNEL);
        frame.extend_from_slice(payload);
        assert_eq!(frame[0], 0x00);
        assert_eq!(&frame[1..], payload);
    }
}
