//! Client side: handshake, the network worker, and the print task.
//!
//! Two concurrent contexts share state through per-object mutexes: the
//! network worker owns ACK production and the receive buffer, the printer
//! drains the FIFO at an exponentially distributed rate. A 500 ms tick
//! forces delivery so a lone buffered segment still gets acknowledged. No
//! lock is ever held across socket I/O.

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::error::{Result, TransportError};
use crate::fifo::{FIFO_SIZE, SegmentFifo};
use crate::loss::{LossSimulator, PrintPacer};
use crate::recv_buffer::{RecvBuffer, WriteOutcome};
use crate::rtt::{Backoff, RTT_MAXNREXMT, RttEstimator};
use crate::segment::{SEGMENT_PAYLOAD, Segment};

/// Delivery tick: even a single in-order segment is flushed and
/// acknowledged this often.
pub const DELAYED_ACK: Duration = Duration::from_millis(500);
/// Receiver quiescence after EOF; late retransmissions are still ACKed.
pub const FIN_TIMEWAIT: Duration = Duration::from_secs(30);

/// Everything the environment supplies to a client session.
#[derive(Debug, Clone)]
pub struct ClientParams {
    pub server: SocketAddr,
    pub filename: String,
    /// Receive window, in datagrams.
    pub rcv_win: u16,
    /// Seed for the loss model and the print pacer.
    pub seed: u64,
    /// Per-datagram drop probability, applied on both directions.
    pub loss_probability: f64,
    /// Mean inter-print interval in microseconds.
    pub mean_print_micros: u32,
    pub fifo_capacity: usize,
    pub fin_timewait: Duration,
}

impl ClientParams {
    pub fn new(server: SocketAddr, filename: impl Into<String>) -> Self {
        Self {
            server,
            filename: filename.into(),
            rcv_win: 8,
            seed: 0,
            loss_probability: 0.0,
            mean_print_micros: 1000,
            fifo_capacity: FIFO_SIZE,
            fin_timewait: FIN_TIMEWAIT,
        }
    }
}

/// Counters accumulated over one client run.
#[derive(Debug, Default, Clone)]
pub struct ClientStats {
    pub delivered: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    /// Datagrams discarded by the loss model, either direction.
    pub dropped: u64,
    pub window_full: u64,
    pub probes_answered: u64,
    pub final_ack: u32,
    /// Private port the session migrated to.
    pub private_port: u16,
}

pub struct FileClient {
    socket: UdpSocket,
    params: ClientParams,
    buf: Arc<Mutex<RecvBuffer>>,
    fifo: Arc<Mutex<SegmentFifo>>,
    loss: LossSimulator,
    /// Client-side outgoing seq counter: 0 for the filename request, 1 for
    /// the port acknowledgment, then one per ACK.
    seq: u32,
    /// Window size in the most recent ACK, for window-update detection.
    last_advertised: u16,
    stats: ClientStats,
}

impl FileClient {
    pub async fn connect(params: ClientParams) -> Result<Self> {
        let unspecified: IpAddr = if params.server.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
        socket.connect(params.server).await?;
        info!(
            "client socket {} connected to {}",
            socket.local_addr()?,
            params.server
        );

        let buf = RecvBuffer::new(params.rcv_win);
        let fifo = SegmentFifo::new(params.fifo_capacity);
        let loss = LossSimulator::new(params.loss_probability, params.seed);
        let last_advertised = params.rcv_win;
        Ok(Self {
            socket,
            params,
            buf: Arc::new(Mutex::new(buf)),
            fifo: Arc::new(Mutex::new(fifo)),
            loss,
            seq: 0,
            last_advertised,
            stats: ClientStats::default(),
        })
    }

    /// Runs the whole session: handshake, receive loop, FIN-timewait. File
    /// bytes go to `sink` in order, exactly once.
    pub async fn run<W>(mut self, sink: W) -> Result<ClientStats>
    where
        W: Write + Send + 'static,
    {
        let first = self.handshake().await?;
        let mut fin_deadline: Option<Instant> = if first.flags.eof {
            info!("eof in first segment, entering fin-timewait");
            Some(Instant::now() + self.params.fin_timewait)
        } else {
            None
        };
        self.buf.lock().unwrap().write(&first);

        let pacer = PrintPacer::new(
            self.params.mean_print_micros,
            self.params.seed.wrapping_add(1),
        );
        let printer = spawn_printer(Arc::clone(&self.fifo), pacer, sink);

        let mut tick = tokio::time::interval_at(Instant::now() + DELAYED_ACK, DELAYED_ACK);
        let mut buf = [0u8; SEGMENT_PAYLOAD];
        loop {
            let fin_at =
                fin_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
            tokio::select! {
                received = self.socket.recv(&mut buf) => {
                    let len = match received {
                        Ok(len) => len,
                        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if self.loss.should_drop() {
                        self.stats.dropped += 1;
                        debug!("simulated loss of received datagram");
                        continue;
                    }
                    let segment = match Segment::decode(&buf[..len]) {
                        Ok(segment) => segment,
                        Err(e) => {
                            warn!("undecodable datagram: {e}");
                            continue;
                        }
                    };
                    if segment.flags.eof && fin_deadline.is_none() {
                        info!("eof received, entering fin-timewait");
                        fin_deadline = Some(Instant::now() + self.params.fin_timewait);
                    }
                    self.on_segment(segment).await?;
                }
                _ = tick.tick() => {
                    if let Some((ack, ts)) = self.pump(true) {
                        self.send_ack(ack, ts, false).await?;
                    } else {
                        // The in-order run may be stuck behind a full
                        // hand-off queue; acknowledge it anyway.
                        let pending = self.buf.lock().unwrap().in_order_ack();
                        if let Some((ack, ts)) = pending {
                            self.send_ack(ack, ts, false).await?;
                        }
                    }
                }
                _ = sleep_until(fin_at), if fin_deadline.is_some() => {
                    info!("fin-timewait expired, session over");
                    break;
                }
            }
        }

        let _ = self.pump(true);
        self.fifo.lock().unwrap().close();
        match printer.await {
            Ok(result) => result?,
            Err(e) => return Err(TransportError::Io(io::Error::other(e))),
        }
        Ok(self.stats)
    }

    /// One received datagram, after the loss model let it through.
    async fn on_segment(&mut self, segment: Segment) -> Result<()> {
        if segment.flags.pob {
            debug!("window probe received");
            self.stats.probes_answered += 1;
            let next_seq = self.buf.lock().unwrap().next_seq();
            self.send_ack(next_seq, segment.ts, true).await?;
            return Ok(());
        }

        let outcome = self.buf.lock().unwrap().write(&segment);
        match outcome {
            WriteOutcome::WindowFull => {
                debug!("datagram #{} rejected, window full", segment.seq);
                self.stats.window_full += 1;
                let next_seq = self.buf.lock().unwrap().next_seq();
                self.send_ack(next_seq, 0, true).await?;
            }
            WriteOutcome::Duplicate | WriteOutcome::OutOfRange => {
                debug!("datagram #{} absorbed ({outcome:?})", segment.seq);
                self.stats.duplicates += 1;
                let next_seq = self.buf.lock().unwrap().next_seq();
                self.send_ack(next_seq, 0, false).await?;
            }
            WriteOutcome::OutOfOrder { ack } => {
                debug!("datagram #{} out of order, first missing is #{ack}", segment.seq);
                self.stats.out_of_order += 1;
                self.send_ack(ack, 0, false).await?;
            }
            WriteOutcome::InOrder => {
                debug!("datagram #{} in order", segment.seq);
                if let Some((ack, ts)) = self.pump(false) {
                    self.send_ack(ack, ts, false).await?;
                }
            }
        }
        Ok(())
    }

    /// Moves the deliverable in-order run from the receive buffer into the
    /// FIFO. Returns the cumulative ACK to send when the whole run got
    /// through. Delivery stops at a full FIFO so no segment is ever lost
    /// between the buffer and the printer.
    fn pump(&mut self, force_first: bool) -> Option<(u32, u32)> {
        let mut force = force_first;
        let mut last: Option<(u32, u32)> = None;
        let mut delivered_all = false;
        loop {
            if self.fifo.lock().unwrap().is_full() {
                break;
            }
            let popped = self.buf.lock().unwrap().read(force);
            match popped {
                Some((segment, remaining)) => {
                    let meta = (segment.seq, segment.ts);
                    self.stats.delivered += 1;
                    if self.fifo.lock().unwrap().write(segment).is_err() {
                        // Only the printer pops concurrently, so a write
                        // after the capacity check cannot be rejected.
                        warn!("hand-off queue rejected datagram #{}", meta.0);
                    }
                    last = Some(meta);
                    if remaining == 0 {
                        delivered_all = true;
                        break;
                    }
                    force = remaining == 1;
                }
                None => break,
            }
        }
        if delivered_all {
            last.map(|(seq, ts)| (seq + 1, ts))
        } else {
            None
        }
    }

    /// Sends one ACK segment carrying the current free window. Reopening a
    /// previously closed window is flagged as a window update.
    async fn send_ack(&mut self, ack: u32, ts: u32, mut window_update: bool) -> Result<()> {
        let win = {
            let mut buf = self.buf.lock().unwrap();
            buf.note_acked(ack);
            buf.win()
        };
        if self.last_advertised == 0 && win > 0 {
            window_update = true;
        }
        self.last_advertised = win;
        self.stats.final_ack = self.stats.final_ack.max(ack);

        let mut segment = Segment::default();
        segment.seq = self.seq;
        self.seq += 1;
        segment.ack = ack;
        segment.ts = ts;
        segment.wnd = win;
        segment.flags.wnd = window_update;

        if self.loss.should_drop() {
            self.stats.dropped += 1;
            debug!("simulated loss of ack #{ack}");
            return Ok(());
        }
        debug!(
            "send ack #{ack} seq={} win={win}{}",
            segment.seq,
            if window_update { " (window update)" } else { "" }
        );
        self.send_raw(&segment.encode()?).await
    }

    /// Handshake: filename request to the well-known port, migration to the
    /// private port, acknowledgment carrying the receive window. Returns
    /// the first file segment, which seeds the receive buffer.
    async fn handshake(&mut self) -> Result<Segment> {
        let new_port = self.request_file().await?;
        let private = SocketAddr::new(self.params.server.ip(), new_port);
        self.socket.connect(private).await?;
        self.stats.private_port = new_port;
        info!("reconnected to server at {private}");
        self.confirm_port().await
    }

    /// Sends `fln` with the filename until the server answers with a
    /// private port number, under RTO retransmission.
    async fn request_file(&mut self) -> Result<u16> {
        let mut request = Segment::default();
        request.flags.fln = true;
        request.set_payload(self.params.filename.as_bytes())?;
        self.seq = 1;

        let mut rtt = RttEstimator::new();
        rtt.newpack();
        let mut buf = [0u8; SEGMENT_PAYLOAD];
        let mut resends = 0u32;
        loop {
            if resends > RTT_MAXNREXMT {
                error!("giving up on the filename request");
                return Err(TransportError::RetransmitLimit(resends));
            }
            if self.loss.should_drop() {
                self.stats.dropped += 1;
                debug!("simulated loss of filename request");
            } else {
                self.send_raw(&request.encode()?).await?;
            }
            resends += 1;

            let deadline = Instant::now() + rtt.start();
            loop {
                tokio::select! {
                    received = self.socket.recv(&mut buf) => {
                        let len = match received {
                            Ok(len) => len,
                            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                            Err(e) => return Err(e.into()),
                        };
                        if self.loss.should_drop() {
                            self.stats.dropped += 1;
                            debug!("simulated loss of handshake reply");
                            continue;
                        }
                        let reply = match Segment::decode(&buf[..len]) {
                            Ok(segment) => segment,
                            Err(e) => {
                                warn!("undecodable handshake reply: {e}");
                                continue;
                            }
                        };
                        if !reply.flags.pot {
                            warn!("handshake reply carries no port number");
                            break;
                        }
                        match std::str::from_utf8(reply.payload())
                            .ok()
                            .and_then(|text| text.parse::<u16>().ok())
                        {
                            Some(port) if port > 0 => {
                                info!("received private port {port} from server");
                                return Ok(port);
                            }
                            _ => {
                                warn!("port reply does not parse as a port number");
                                break;
                            }
                        }
                    }
                    _ = sleep_until(deadline) => {
                        match rtt.timeout() {
                            Backoff::GiveUp => {
                                error!("terminate for filename request timeout");
                                return Err(TransportError::RetransmitLimit(rtt.nrexmt()));
                            }
                            Backoff::Retry(attempt) => {
                                info!("resend filename request (timeout #{attempt})");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Acknowledges the private port and waits for the first file segment.
    /// The server keeps retransmitting the port message until this ACK
    /// lands, so port replies seen here just trigger another ACK.
    async fn confirm_port(&mut self) -> Result<Segment> {
        let mut port_ack = Segment::default();
        port_ack.seq = self.seq;
        self.seq += 1;
        port_ack.ack = 1;
        port_ack.flags.pot = true;
        port_ack.wnd = self.params.rcv_win;

        let mut rtt = RttEstimator::new();
        rtt.newpack();
        let mut buf = [0u8; SEGMENT_PAYLOAD];
        let mut resends = 0u32;
        loop {
            if resends > RTT_MAXNREXMT {
                error!("giving up on the port acknowledgment");
                return Err(TransportError::HandshakeFailed(
                    "no file data after port acknowledgment".into(),
                ));
            }
            if self.loss.should_drop() {
                self.stats.dropped += 1;
                debug!("simulated loss of port acknowledgment");
            } else {
                self.send_raw(&port_ack.encode()?).await?;
            }
            resends += 1;

            let deadline = Instant::now() + rtt.start();
            loop {
                tokio::select! {
                    received = self.socket.recv(&mut buf) => {
                        let len = match received {
                            Ok(len) => len,
                            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                            Err(e) => return Err(e.into()),
                        };
                        if self.loss.should_drop() {
                            self.stats.dropped += 1;
                            debug!("simulated loss of first data segment");
                            continue;
                        }
                        let segment = match Segment::decode(&buf[..len]) {
                            Ok(segment) => segment,
                            Err(e) => {
                                warn!("undecodable segment: {e}");
                                continue;
                            }
                        };
                        if segment.flags.pot {
                            // Our acknowledgment was lost; answer the
                            // retransmitted port message again.
                            break;
                        }
                        return Ok(segment);
                    }
                    _ = sleep_until(deadline) => {
                        match rtt.timeout() {
                            Backoff::GiveUp => {
                                error!("terminate for port acknowledgment timeout");
                                return Err(TransportError::RetransmitLimit(rtt.nrexmt()));
                            }
                            Backoff::Retry(attempt) => {
                                info!("resend port acknowledgment (timeout #{attempt})");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        match self.socket.send(bytes).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!("server socket not yet open");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Print task: drains the FIFO to the sink, sleeping an exponentially
/// distributed interval whenever the queue is empty. Terminates at the EOF
/// segment or when the FIFO is closed and drained.
fn spawn_printer<W>(
    fifo: Arc<Mutex<SegmentFifo>>,
    mut pacer: PrintPacer,
    mut sink: W,
) -> JoinHandle<io::Result<()>>
where
    W: Write + Send + 'static,
{
    tokio::spawn(async move {
        debug!("print task started");
        loop {
            let popped = fifo.lock().unwrap().read();
            match popped {
                Some(segment) => {
                    if segment.len > 0 {
                        sink.write_all(segment.payload())?;
                    }
                    if segment.flags.eof {
                        sink.flush()?;
                        info!("file data finished");
                        break;
                    }
                }
                None => {
                    if fifo.lock().unwrap().is_closed() {
                        sink.flush()?;
                        break;
                    }
                    tokio::time::sleep(pacer.next_delay()).await;
                }
            }
        }
        debug!("print task exited");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::MAX_DATA;
    use crate::server::{FileServer, SessionStats};
    use std::path::PathBuf;

    /// Write-through sink the test can read back after the client is done.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_file(name: &str, bytes: usize) -> (PathBuf, Vec<u8>) {
        let content: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
        let path = std::env::temp_dir().join(format!("opaline-{name}-{}", std::process::id()));
        std::fs::write(&path, &content).unwrap();
        (path, content)
    }

    async fn start_server(max_winsize: u16) -> (Arc<FileServer>, SocketAddr) {
        let server = Arc::new(
            FileServer::bind("127.0.0.1:0".parse().unwrap(), max_winsize)
                .await
                .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let runner = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        (server, addr)
    }

    async fn wait_for_session(server: &FileServer) -> SessionStats {
        for _ in 0..200 {
            if let Some(stats) = server.completed_sessions().into_iter().next() {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("server session did not complete");
    }

    fn handshake_segment(filename: &str) -> Segment {
        let mut segment = Segment::default();
        segment.flags.fln = true;
        segment.set_payload(filename.as_bytes()).unwrap();
        segment
    }

    async fn recv_segment(socket: &UdpSocket) -> Segment {
        let mut buf = [0u8; SEGMENT_PAYLOAD];
        let len = tokio::time::timeout(Duration::from_secs(10), socket.recv(&mut buf))
            .await
            .expect("timed out waiting for a segment")
            .unwrap();
        Segment::decode(&buf[..len]).unwrap()
    }

    /// Drives the handshake by hand and returns a socket connected to the
    /// session's private port.
    async fn scripted_handshake(
        server_addr: SocketAddr,
        filename: &str,
        rcv_win: u16,
    ) -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server_addr).await.unwrap();
        socket
            .send(&handshake_segment(filename).encode().unwrap())
            .await
            .unwrap();

        let reply = recv_segment(&socket).await;
        assert!(reply.flags.pot);
        let port: u16 = std::str::from_utf8(reply.payload())
            .unwrap()
            .parse()
            .unwrap();
        socket
            .connect(SocketAddr::new(server_addr.ip(), port))
            .await
            .unwrap();

        let mut port_ack = Segment::default();
        port_ack.seq = 1;
        port_ack.ack = 1;
        port_ack.flags.pot = true;
        port_ack.wnd = rcv_win;
        socket.send(&port_ack.encode().unwrap()).await.unwrap();
        socket
    }

    fn ack_segment(seq: u32, ack: u32, ts: u32, wnd: u16) -> Segment {
        Segment {
            seq,
            ack,
            ts,
            wnd,
            ..Segment::default()
        }
    }

    #[tokio::test]
    async fn transfers_a_small_file_in_order() {
        let (path, content) = test_file("happy", MAX_DATA * 9 + 100);
        let (server, addr) = start_server(8).await;

        let mut params = ClientParams::new(addr, path.to_str().unwrap());
        params.rcv_win = 8;
        params.mean_print_micros = 500;
        params.fin_timewait = Duration::from_secs(2);
        let client = FileClient::connect(params).await.unwrap();

        let sink = SharedSink::default();
        let stats = client.run(sink.clone()).await.unwrap();

        assert_eq!(sink.contents(), content);
        assert_eq!(stats.final_ack, 11);
        assert_eq!(stats.dropped, 0);
        assert_ne!(stats.private_port, 0);
        assert_ne!(stats.private_port, addr.port());

        let session = wait_for_session(&server).await;
        assert_eq!(session.segments_sent, 10);
        assert_eq!(session.timeout_retransmits, 0);
        assert_eq!(session.fast_retransmits, 0);
        assert_eq!(session.final_ack, 11);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_under_deterministic_loss() {
        let (path, content) = test_file("lossy", MAX_DATA * 49 + 200);
        let (server, addr) = start_server(8).await;

        let mut params = ClientParams::new(addr, path.to_str().unwrap());
        params.rcv_win = 8;
        params.seed = 42;
        params.loss_probability = 0.25;
        params.mean_print_micros = 200;
        // Virtual time: generous quiescence so a worst-case RTO backoff on
        // the tail segments still lands inside the window.
        params.fin_timewait = Duration::from_secs(240);
        let client = FileClient::connect(params).await.unwrap();

        let sink = SharedSink::default();
        let stats = client.run(sink.clone()).await.unwrap();

        assert_eq!(sink.contents(), content);
        assert!(stats.dropped > 0);

        let session = wait_for_session(&server).await;
        assert!(session.timeout_retransmits + session.fast_retransmits > 0);
        assert!(session.max_cwnd >= 2);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_stall_drives_window_probes() {
        let (path, content) = test_file("stall", MAX_DATA * 19 + 50);
        let (server, addr) = start_server(8).await;

        let mut params = ClientParams::new(addr, path.to_str().unwrap());
        params.rcv_win = 4;
        // One-slot hand-off queue plus a very slow printer: the receive
        // window must close and the sender must probe its way through.
        params.fifo_capacity = 1;
        params.mean_print_micros = 5_000_000;
        params.fin_timewait = Duration::from_secs(300);
        let client = FileClient::connect(params).await.unwrap();

        let sink = SharedSink::default();
        let stats = client.run(sink.clone()).await.unwrap();

        assert_eq!(sink.contents(), content);
        assert_eq!(stats.dropped, 0);

        let session = wait_for_session(&server).await;
        assert!(session.window_probes >= 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn three_duplicate_acks_trigger_fast_retransmit() {
        let (path, _content) = test_file("fastrtx", MAX_DATA * 13 + 100);
        let (_server, addr) = start_server(16).await;
        let socket = scripted_handshake(addr, path.to_str().unwrap(), 16).await;

        // Play receiver: ack everything up to #7, pretend #8 was lost and
        // answer every later segment with a duplicate ACK naming 8.
        let dropped_seq = 8u32;
        let mut ack_seq = 2u32;
        let mut dups_sent = 0;
        let mut first_copy_seen = false;
        let mut dup_burst_started = None;

        let retransmit_latency = loop {
            let segment = recv_segment(&socket).await;
            if segment.seq == dropped_seq {
                if first_copy_seen {
                    break dup_burst_started
                        .map(|started: std::time::Instant| started.elapsed());
                }
                first_copy_seen = true;
                continue;
            }
            let ack = if segment.seq < dropped_seq {
                ack_segment(ack_seq, segment.seq + 1, segment.ts, 16)
            } else {
                dups_sent += 1;
                if dup_burst_started.is_none() {
                    dup_burst_started = Some(std::time::Instant::now());
                }
                ack_segment(ack_seq, dropped_seq, 0, 16)
            };
            ack_seq += 1;
            socket.send(&ack.encode().unwrap()).await.unwrap();
        };

        assert!(dups_sent >= 3, "only {dups_sent} duplicate acks went out");
        // A fast retransmit arrives well before the 1000 ms RTO floor.
        assert!(retransmit_latency.unwrap() < Duration::from_millis(900));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_backoff_until_give_up() {
        let (path, _content) = test_file("backoff", MAX_DATA * 2 + 10);
        let (server, addr) = start_server(8).await;
        // Advertise a one-datagram window and then never acknowledge:
        // segment #1 must be retransmitted with doubling RTOs until the
        // sender gives up.
        let socket = scripted_handshake(addr, path.to_str().unwrap(), 1).await;

        let mut arrivals = Vec::new();
        loop {
            let mut buf = [0u8; SEGMENT_PAYLOAD];
            match tokio::time::timeout(Duration::from_secs(150), socket.recv(&mut buf)).await {
                Ok(received) => {
                    let segment = Segment::decode(&buf[..received.unwrap()]).unwrap();
                    assert_eq!(segment.seq, 1);
                    arrivals.push(Instant::now());
                }
                Err(_) => break,
            }
        }

        // Original transmission plus RTT_MAXNREXMT retransmissions.
        assert_eq!(arrivals.len() as u32, 1 + RTT_MAXNREXMT);
        let deltas: Vec<Duration> = arrivals.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in deltas.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        // Doubling sequence from the initial 3000 ms, clipped at the
        // 60-second ceiling.
        assert!(deltas.first().unwrap() >= &Duration::from_millis(2900));
        assert!(deltas.first().unwrap() <= &Duration::from_millis(3200));
        assert!(deltas.last().unwrap() <= &Duration::from_millis(60_500));
        assert!(deltas.last().unwrap() >= &Duration::from_millis(59_500));

        // The session ended in an error, not a completed transfer.
        assert!(server.completed_sessions().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_requests_share_one_session() {
        let (path, _content) = test_file("dedup", MAX_DATA + 5);
        let (_server, addr) = start_server(8).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(addr).await.unwrap();
        let request = handshake_segment(path.to_str().unwrap()).encode().unwrap();
        socket.send(&request).await.unwrap();
        socket.send(&request).await.unwrap();

        // Collect the port replies the (single) session keeps
        // retransmitting; a second session would advertise another port.
        let mut ports = Vec::new();
        for _ in 0..3 {
            let mut buf = [0u8; SEGMENT_PAYLOAD];
            match tokio::time::timeout(Duration::from_secs(15), socket.recv(&mut buf)).await {
                Ok(received) => {
                    let segment = Segment::decode(&buf[..received.unwrap()]).unwrap();
                    assert!(segment.flags.pot);
                    ports.push(std::str::from_utf8(segment.payload()).unwrap().to_string());
                }
                Err(_) => break,
            }
        }
        assert!(ports.len() >= 2, "expected retransmitted port replies");
        assert!(ports.windows(2).all(|pair| pair[0] == pair[1]));

        let _ = std::fs::remove_file(&path);
    }
}
