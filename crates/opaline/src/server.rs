//! Server side: the supervisor on the well-known port and the per-session
//! sender loop.
//!
//! Each file request gets its own task and its own UDP socket on a private
//! port. The session multiplexes socket readability against the
//! retransmission timer; after one readability event every immediately
//! available ACK is drained before the next wait.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::time::{Instant, sleep_until};

use crate::congestion::CongestionController;
use crate::error::{Result, TransportError};
use crate::rtt::{Backoff, RTT_MAXNREXMT, RttEstimator};
use crate::segment::{SEGMENT_PAYLOAD, Segment};
use crate::send_window::SendWindow;

/// Interval between window probes while the peer advertises a zero window.
pub const PERSIST_TIMER: Duration = Duration::from_millis(3000);

/// Counters accumulated over one transfer session.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub session_id: u32,
    pub segments_sent: u64,
    pub timeout_retransmits: u32,
    pub fast_retransmits: u32,
    pub window_probes: u32,
    pub max_cwnd: u16,
    pub final_ack: u32,
}

/// Supervisor owning the well-known port.
pub struct FileServer {
    socket: Arc<UdpSocket>,
    max_winsize: u16,
    /// Live requests keyed by client address plus filename. A repeated
    /// request while an entry is live is dropped.
    active: Arc<DashMap<(SocketAddr, String), u32>>,
    completed: Arc<Mutex<Vec<SessionStats>>>,
    next_session: AtomicU32,
}

impl FileServer {
    pub async fn bind(addr: SocketAddr, max_winsize: u16) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("file server listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            max_winsize,
            active: Arc::new(DashMap::new()),
            completed: Arc::new(Mutex::new(Vec::new())),
            next_session: AtomicU32::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Stats of sessions that ran to completion, in finish order.
    pub fn completed_sessions(&self) -> Vec<SessionStats> {
        self.completed.lock().unwrap().clone()
    }

    /// Accepts file requests forever, one spawned session per request.
    pub async fn run(&self) -> Result<()> {
        let mut buf = [0u8; SEGMENT_PAYLOAD];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            let request = match Segment::decode(&buf[..len]) {
                Ok(segment) => segment,
                Err(e) => {
                    warn!("undecodable datagram from {peer}: {e}");
                    continue;
                }
            };
            if !request.flags.fln {
                info!("datagram from {peer} carries no filename request");
                continue;
            }
            let filename = match std::str::from_utf8(request.payload()) {
                Ok(name) => name.to_string(),
                Err(_) => {
                    warn!("filename from {peer} is not valid UTF-8");
                    continue;
                }
            };

            let key = (peer, filename.clone());
            if let Some(existing) = self.active.get(&key) {
                info!(
                    "duplicate request for \"{filename}\" from {peer} already handled by session #{}",
                    *existing
                );
                continue;
            }
            let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
            self.active.insert(key.clone(), id);
            info!("session #{id}: file request \"{filename}\" from {peer}");

            let socket = Arc::clone(&self.socket);
            let active = Arc::clone(&self.active);
            let completed = Arc::clone(&self.completed);
            let max_winsize = self.max_winsize;
            tokio::spawn(async move {
                match serve_request(socket, peer, &filename, max_winsize, id).await {
                    Ok(stats) => {
                        info!("session #{id}: finished sending \"{filename}\"");
                        completed.lock().unwrap().push(stats);
                    }
                    Err(e) => error!("session #{id}: {e}"),
                }
                active.remove(&key);
            });
        }
    }
}

async fn serve_request(
    listener: Arc<UdpSocket>,
    peer: SocketAddr,
    filename: &str,
    max_winsize: u16,
    id: u32,
) -> Result<SessionStats> {
    // Private per-session socket on the same local address.
    let local_ip = listener.local_addr()?.ip();
    let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
    socket.connect(peer).await?;
    info!("session #{id}: private socket {}", socket.local_addr()?);

    let session = ServerSession {
        socket,
        listener,
        peer,
        id,
        max_winsize,
        rtt: RttEstimator::new(),
        cc: CongestionController::new(0, max_winsize),
        window: SendWindow::new(),
        stats: SessionStats {
            session_id: id,
            ..SessionStats::default()
        },
    };
    session.run(filename).await
}

struct ServerSession {
    socket: UdpSocket,
    listener: Arc<UdpSocket>,
    peer: SocketAddr,
    id: u32,
    max_winsize: u16,
    rtt: RttEstimator,
    cc: CongestionController,
    window: SendWindow,
    stats: SessionStats,
}

impl ServerSession {
    async fn run(mut self, filename: &str) -> Result<SessionStats> {
        let rwnd = self.send_port().await?;
        let file = File::open(filename)?;
        self.send_file(file, rwnd).await?;
        Ok(self.stats)
    }

    /// Announces the private port through the well-known socket, with RTO
    /// retransmission through both sockets, until the client acknowledges.
    /// Returns the client's advertised receive window.
    async fn send_port(&mut self) -> Result<u16> {
        info!(
            "session #{}: waiting for port acknowledgment from {}",
            self.id, self.peer
        );
        self.rtt.newpack();

        let port = self.socket.local_addr()?.port();
        let mut port_seg = Segment::default();
        port_seg.ack = 1;
        port_seg.flags.pot = true;
        port_seg.set_payload(port.to_string().as_bytes())?;

        let mut buf = [0u8; SEGMENT_PAYLOAD];
        let mut resends = 0u32;
        loop {
            if resends > RTT_MAXNREXMT {
                error!("session #{}: giving up on port handshake", self.id);
                return Err(TransportError::RetransmitLimit(resends));
            }
            // Karn applies here too: only the first transmission is timed.
            port_seg.ts = if resends == 0 { self.rtt.ts() } else { 0 };
            let bytes = port_seg.encode()?;
            self.listener.send_to(&bytes, self.peer).await?;
            if resends > 0 {
                self.send_raw(&bytes).await?;
                info!(
                    "session #{}: resend port number {port} (attempt #{resends})",
                    self.id
                );
            }
            resends += 1;

            let deadline = Instant::now() + self.rtt.start();
            loop {
                tokio::select! {
                    received = self.socket.recv(&mut buf) => {
                        let len = match received {
                            Ok(len) => len,
                            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                            Err(e) => return Err(e.into()),
                        };
                        let reply = match Segment::decode(&buf[..len]) {
                            Ok(segment) => segment,
                            Err(e) => {
                                warn!("session #{}: undecodable handshake reply: {e}", self.id);
                                continue;
                            }
                        };
                        if reply.ts > 0 {
                            let sample = self.rtt.ts().saturating_sub(reply.ts);
                            self.rtt.stop(sample);
                        }
                        if reply.ack == 1 && reply.flags.pot {
                            info!(
                                "session #{}: port acknowledged, private connection established",
                                self.id
                            );
                            return Ok(reply.wnd);
                        }
                        warn!(
                            "session #{}: expected port acknowledgment, got seq={} ack={}",
                            self.id, reply.seq, reply.ack
                        );
                        break;
                    }
                    _ = sleep_until(deadline) => {
                        if self.rtt.timeout() == Backoff::GiveUp {
                            error!("session #{}: terminate for port datagram timeout", self.id);
                            return Err(TransportError::RetransmitLimit(self.rtt.nrexmt()));
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Streams the file under `min(cwnd, awnd)` pacing with a timer armed
    /// for the oldest segment of each batch.
    async fn send_file(&mut self, file: File, rwnd: u16) -> Result<()> {
        let mut reader = BufReader::new(file);
        self.window.refill(self.max_winsize as usize, &mut reader)?;
        self.cc = CongestionController::new(rwnd, self.max_winsize);

        while let Some(head_seq) = self.window.head_seq() {
            let mut budget = self.cc.window();
            if budget == 0 {
                budget = self.probe_window(&mut reader).await?;
                if self.window.is_empty() {
                    break;
                }
            }
            if budget > 0 {
                self.rtt.newpack();
            }

            let mut deadline: Option<Instant> = None;
            let mut first_sent = 0u32;
            let mut last_sent = 0u32;
            while let Some(mut segment) = self.window.next_to_send(budget) {
                segment.ts = self.rtt.ts();
                let bytes = segment.encode()?;
                self.send_raw(&bytes).await?;
                self.stats.segments_sent += 1;
                if deadline.is_none() {
                    // Timer covers the oldest segment of the batch.
                    deadline = Some(Instant::now() + self.rtt.start());
                    first_sent = segment.seq;
                }
                last_sent = segment.seq;
            }
            if last_sent > 0 {
                debug!(
                    "session #{}: send datagrams #{first_sent}..#{last_sent}",
                    self.id
                );
            }
            let mut deadline = deadline.unwrap_or_else(|| Instant::now() + self.rtt.start());

            loop {
                tokio::select! {
                    ready = self.socket.readable() => {
                        ready?;
                        let max_ack = self.drain_acks(&mut reader).await?;
                        if max_ack > head_seq {
                            break;
                        }
                    }
                    _ = sleep_until(deadline) => {
                        match self.rtt.timeout() {
                            Backoff::GiveUp => {
                                error!(
                                    "session #{}: terminate for file datagram timeout",
                                    self.id
                                );
                                return Err(TransportError::RetransmitLimit(self.rtt.nrexmt()));
                            }
                            Backoff::Retry(attempt) => {
                                self.cc.on_timeout();
                                self.stats.timeout_retransmits += 1;
                                if let Some(head) = self.window.head() {
                                    let mut head = head.clone();
                                    // Karn: retransmissions carry no
                                    // timestamp, so their ACKs yield no
                                    // RTT sample.
                                    head.ts = 0;
                                    let bytes = head.encode()?;
                                    self.send_raw(&bytes).await?;
                                    info!(
                                        "session #{}: resend datagram #{} (timeout #{attempt})",
                                        self.id, head.seq
                                    );
                                }
                                deadline = Instant::now() + self.rtt.start();
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Consumes every immediately available ACK, updating RTT, congestion
    /// state and the sender window, then refills from the file. Returns the
    /// highest cumulative ACK seen.
    async fn drain_acks<R: Read>(&mut self, reader: &mut R) -> Result<u32> {
        let mut buf = [0u8; SEGMENT_PAYLOAD];
        let mut max_ack = 0u32;
        let mut freed = 0usize;
        loop {
            let len = match self.socket.try_recv(&mut buf) {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                Err(e) => return Err(e.into()),
            };
            let ack_seg = match Segment::decode(&buf[..len]) {
                Ok(segment) => segment,
                Err(e) => {
                    warn!("session #{}: undecodable ack: {e}", self.id);
                    continue;
                }
            };
            max_ack = max_ack.max(ack_seg.ack);
            debug!(
                "session #{}: received ack #{} awnd={}{}",
                self.id,
                ack_seg.ack,
                ack_seg.wnd,
                if ack_seg.flags.wnd {
                    " (window update)"
                } else {
                    ""
                }
            );
            if ack_seg.ts > 0 {
                let sample = self.rtt.ts().saturating_sub(ack_seg.ts);
                self.rtt.stop(sample);
            }
            let outcome = self.cc.on_ack(ack_seg.ack, ack_seg.wnd, ack_seg.flags.wnd);
            self.stats.max_cwnd = self.stats.max_cwnd.max(self.cc.cwnd());
            if outcome.fast_retransmit {
                if let Some(head) = self.window.head() {
                    let mut head = head.clone();
                    // Karn: no timestamp on the retransmitted copy.
                    head.ts = 0;
                    let bytes = head.encode()?;
                    self.send_raw(&bytes).await?;
                    self.stats.fast_retransmits += 1;
                    info!(
                        "session #{}: resend datagram #{} (fast retransmit)",
                        self.id, head.seq
                    );
                }
            }
            self.stats.final_ack = self.stats.final_ack.max(ack_seg.ack);
            freed += self.window.advance(ack_seg.ack);
        }
        if freed > 0 {
            self.window.refill(freed, reader)?;
        }
        Ok(max_ack)
    }

    /// Persist mode: the advertised window is zero, so only probes go out,
    /// one every `PERSIST_TIMER`, until an ACK reopens the window. Probes
    /// carry no timestamp and never feed the RTT estimator.
    async fn probe_window<R: Read>(&mut self, reader: &mut R) -> Result<u16> {
        loop {
            let mut probe = Segment::default();
            probe.flags.pob = true;
            let bytes = probe.encode()?;
            self.send_raw(&bytes).await?;
            self.stats.window_probes += 1;
            info!("session #{}: send window probe", self.id);

            let deadline = Instant::now() + PERSIST_TIMER;
            loop {
                tokio::select! {
                    ready = self.socket.readable() => {
                        ready?;
                        self.drain_acks(reader).await?;
                        if self.window.is_empty() {
                            return Ok(0);
                        }
                        if self.cc.window() > 0 {
                            return Ok(self.cc.window());
                        }
                    }
                    _ = sleep_until(deadline) => break,
                }
            }
        }
    }

    async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        match self.socket.send(bytes).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!("session #{}: peer socket not yet open", self.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
