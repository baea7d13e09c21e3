//! One outbound BGP session per configured neighbor.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::message::{self, MessageType};
use super::route::Path;
use super::server::{PeerStatus, SessionState};
use super::{Error, Result};

const IDLE_HOLD: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const OPEN_TIMEOUT: Duration = Duration::from_secs(15);

pub(super) struct Session {
    pub local: std::net::Ipv4Addr,
    pub peer: std::net::Ipv4Addr,
    pub port: u16,
    pub local_as: u32,
    pub peer_as: u32,
    pub router_id: std::net::Ipv4Addr,
    pub rib: Arc<Mutex<HashMap<String, Path>>>,
    pub status: Arc<Mutex<PeerStatus>>,
    pub rx: mpsc::UnboundedReceiver<Path>,
}

impl Session {
    pub(super) async fn run(mut self, stop: CancellationToken) {
        loop {
            match self.establish(&stop).await {
                Ok(Some((stream, hold_time))) => {
                    if let Err(err) = self.serve(stream, hold_time, &stop).await {
                        debug!(peer = %self.peer, "session lost: {err}");
                    }
                    self.set_advertised(0);
                }
                Ok(None) => return,
                Err(err) => {
                    trace!(peer = %self.peer, "session attempt failed: {err}");
                }
            }
            if stop.is_cancelled() {
                return;
            }

            self.set_state(SessionState::Idle);
            tokio::select! {
                () = stop.cancelled() => return,
                () = sleep(IDLE_HOLD) => {}
            }
        }
    }

    /// Walk the FSM up to Established. `Ok(None)` means we were stopped.
    async fn establish(&mut self, stop: &CancellationToken) -> Result<Option<(TcpStream, u16)>> {
        self.set_state(SessionState::Connect);
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::new(IpAddr::V4(self.local), 0))?;
        let connect = timeout(
            CONNECT_TIMEOUT,
            socket.connect(SocketAddr::new(IpAddr::V4(self.peer), self.port)),
        );
        let mut stream = tokio::select! {
            () = stop.cancelled() => return Ok(None),
            connected = connect => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    self.set_state(SessionState::Active);
                    return Err(err.into());
                }
                Err(_) => {
                    self.set_state(SessionState::Active);
                    return Err(Error::Protocol("connect timed out".to_owned()));
                }
            }
        };

        stream
            .write_all(&message::open(self.local_as, self.router_id))
            .await?;
        self.set_state(SessionState::OpenSent);

        let open = match timeout(OPEN_TIMEOUT, read_message(&mut stream)).await {
            Ok(Ok((MessageType::Open, body))) => message::parse_open(&body)?,
            Ok(Ok((kind, _))) => {
                return Err(Error::Protocol(format!("expected OPEN, got {kind:?}")));
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(Error::Protocol("OPEN timed out".to_owned())),
        };
        if open.peer_as != self.peer_as {
            return Err(Error::Protocol(format!(
                "peer AS mismatch: expected {}, got {}",
                self.peer_as, open.peer_as
            )));
        }
        self.set_state(SessionState::OpenConfirm);
        stream.write_all(&message::keepalive()).await?;

        loop {
            match timeout(OPEN_TIMEOUT, read_message(&mut stream)).await {
                Ok(Ok((MessageType::Keepalive, _))) => break,
                Ok(Ok((MessageType::Notification, _))) => {
                    return Err(Error::Protocol("peer refused session".to_owned()));
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(Error::Protocol("KEEPALIVE timed out".to_owned())),
            }
        }
        self.set_state(SessionState::Established);
        debug!(peer = %self.peer, "session established");

        let mut hold_time = message::HOLD_TIME.min(open.hold_time);
        if hold_time < 3 {
            hold_time = message::HOLD_TIME;
        }
        Ok(Some((stream, hold_time)))
    }

    async fn serve(
        &mut self,
        stream: TcpStream,
        hold_time: u16,
        stop: &CancellationToken,
    ) -> Result<()> {
        // Anything queued before establishment is superseded by the RIB
        // snapshot we are about to send.
        while self.rx.try_recv().is_ok() {}
        let initial: Vec<Path> = self.rib.lock().values().cloned().collect();

        let (read_half, mut write_half) = stream.into_split();
        let (event_tx, mut events) = mpsc::channel::<Result<MessageType>>(8);
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                let event = read_message(&mut read_half).await.map(|(kind, _)| kind);
                let failed = event.is_err();
                if event_tx.send(event).await.is_err() || failed {
                    return;
                }
            }
        });

        let result = self
            .exchange(&mut write_half, &mut events, initial, hold_time, stop)
            .await;
        reader.abort();
        result
    }

    async fn exchange(
        &mut self,
        stream: &mut (impl AsyncWriteExt + Unpin),
        events: &mut mpsc::Receiver<Result<MessageType>>,
        initial: Vec<Path>,
        hold_time: u16,
        stop: &CancellationToken,
    ) -> Result<()> {
        let mut announced: HashSet<String> = HashSet::new();
        for path in initial {
            stream
                .write_all(&message::update(&path, self.local_as, self.peer_as))
                .await?;
            announced.insert(path.key());
        }
        self.set_advertised(announced.len() as u64);

        let hold = Duration::from_secs(u64::from(hold_time));
        let mut keepalives = interval(hold / 3);
        let mut hold_deadline = Instant::now() + hold;

        loop {
            tokio::select! {
                () = stop.cancelled() => {
                    let _ = stream
                        .write_all(&message::notification(message::CEASE, 0))
                        .await;
                    return Ok(());
                }
                _ = keepalives.tick() => {
                    stream.write_all(&message::keepalive()).await?;
                }
                path = self.rx.recv() => {
                    let Some(path) = path else { return Ok(()) };
                    stream
                        .write_all(&message::update(&path, self.local_as, self.peer_as))
                        .await?;
                    if path.withdraw {
                        announced.remove(&path.key());
                    } else {
                        announced.insert(path.key());
                    }
                    self.set_advertised(announced.len() as u64);
                }
                event = events.recv() => {
                    match event {
                        Some(Ok(MessageType::Keepalive | MessageType::Update)) => {
                            hold_deadline = Instant::now() + hold;
                        }
                        Some(Ok(MessageType::Notification)) => {
                            return Err(Error::Protocol("peer sent NOTIFICATION".to_owned()));
                        }
                        Some(Ok(MessageType::Open)) => {
                            return Err(Error::Protocol("unexpected OPEN".to_owned()));
                        }
                        Some(Err(err)) => return Err(err),
                        None => return Err(Error::Protocol("connection closed".to_owned())),
                    }
                }
                () = sleep_until(hold_deadline) => {
                    return Err(Error::Protocol("hold timer expired".to_owned()));
                }
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        let mut status = self.status.lock();
        if status.state != state {
            trace!(peer = %self.peer, "session state: {state}");
            status.state = state;
        }
    }

    fn set_advertised(&self, advertised: u64) {
        self.status.lock().advertised = advertised;
    }
}

async fn read_message<R>(stream: &mut R) -> Result<(MessageType, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0_u8; message::HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (kind, body_len) = message::parse_header(&header)?;
    let mut body = vec![0_u8; body_len];
    if body_len > 0 {
        stream.read_exact(&mut body).await?;
    }
    Ok((kind, body))
}
