//! SOL transport: one UDP socket per BMC session.
//!
//! # Architecture
//!
//! ```text
//! connect() ── 6-step bring-up ──► three pumps
//!
//!   read pump ──► internal queue ──► drainer ──► output channel (supervisor)
//!        │ 100ms recv deadline, ACKs, inactivity clock
//!   write pump ◄── input channel (SendCommand / SendBreak)
//!        │ splits chunks at max_outbound − 4, seq 1..=255 (never 0)
//!   keepalive pump: GetDeviceID every inactivity/3 (≥ 10 s)
//! ```
//!
//! The pumps share the socket and a small `TxState` mutex (session sequence,
//! SOL sequence, keys). Cancellation is a `CancellationToken` all three
//! observe before their next suspension; `close()` additionally sends the
//! DeactivatePayload / CloseSession courtesy pair under a 5 s budget.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    ACTIVATE_TIMEOUT, CLOSE_BUDGET, DEACTIVATE_TIMEOUT, DIAL_TIMEOUT, HANDSHAKE_STEP_TIMEOUT,
    MIN_KEEPALIVE_INTERVAL, READ_DEADLINE, READ_QUEUE_CAPACITY, WRITE_TIMEOUT,
};
use crate::ipmi::codec::{self, payload};
use crate::ipmi::commands::{self, PRIV_ADMIN};
use crate::ipmi::crypto::{self, AuthAlg};
use crate::ipmi::SolError;

/// SOL payload instance activated on every BMC.
const SOL_INSTANCE: u8 = 1;

/// Depth of the outbound byte-stream channel towards the supervisor.
const OUTPUT_CHANNEL_DEPTH: usize = 256;

/// Everything needed to bring up one SOL session.
#[derive(Debug, Clone)]
pub struct SolConfig {
    /// Logical server name, for logging only.
    pub server: String,
    /// BMC IPv4 address or hostname.
    pub host: String,
    /// RMCP+ port, 623 unless the BMC is remapped.
    pub port: u16,
    /// IPMI user.
    pub username: String,
    /// IPMI password (also the RAKP key-generating key).
    pub password: String,
    /// Declare the session dead after this long without any BMC datagram.
    /// Zero disables the inactivity check.
    pub inactivity_timeout: Duration,
}

/// Mutable per-session transmit state shared by the pumps.
struct TxState {
    bmc_session_id: u32,
    /// RMCP+ session sequence, incremented per outbound packet.
    seq: u32,
    /// IPMI requester sequence (6 bits).
    rq_seq: u8,
    /// Next outbound SOL data sequence; 0 is reserved for ACK-only packets.
    sol_seq: u8,
    /// Last outbound sequence the BMC acknowledged.
    acked_seq: u8,
    integrity: bool,
    confidentiality: bool,
    k1: [u8; 20],
    k2: [u8; 20],
    /// Negotiated maximum outbound SOL payload (sub-header included).
    max_outbound: usize,
}

impl TxState {
    fn next_rq_seq(&mut self) -> u8 {
        self.rq_seq = (self.rq_seq + 1) & 0x3F;
        self.rq_seq
    }

    fn next_sol_seq(&mut self) -> u8 {
        let seq = self.sol_seq;
        self.sol_seq = if seq == 255 { 1 } else { seq + 1 };
        seq
    }

    /// Wrap a payload in the session frame: encrypt under K2 when
    /// confidentiality was negotiated, sign under K1 when integrity was.
    fn seal(&mut self, payload_type: u8, body: &[u8]) -> Vec<u8> {
        self.seq = self.seq.wrapping_add(1);
        let sealed;
        let (payload_type, body) = if self.confidentiality {
            sealed = crypto::encrypt_aes_cbc(&self.k2, body);
            (payload_type | payload::ENCRYPTED_BIT, sealed.as_slice())
        } else {
            (payload_type, body)
        };
        if self.integrity {
            codec::build_v2_packet_signed(payload_type, self.bmc_session_id, self.seq, body, &self.k1)
        } else {
            codec::build_v2_packet(payload_type, self.bmc_session_id, self.seq, body)
        }
    }
}

/// State observable from outside the pumps.
struct Shared {
    started: Instant,
    last_recv_ms: AtomicU64,
    closed: AtomicBool,
    error: Mutex<Option<SolError>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_recv_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_recv_ms.store(now, Ordering::Relaxed);
    }

    fn last_recv_age(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_recv_ms.load(Ordering::Relaxed)))
    }

    /// First error wins; later ones are usually knock-on effects.
    fn record_error(&self, err: SolError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

enum WriteRequest {
    Data(Vec<u8>, oneshot::Sender<Result<(), SolError>>),
    Break(oneshot::Sender<Result<(), SolError>>),
}

/// An activated SOL session.
pub struct SolTransport {
    server: String,
    socket: Arc<UdpSocket>,
    tx_state: Arc<Mutex<TxState>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    input_tx: mpsc::Sender<WriteRequest>,
    output_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl SolTransport {
    /// Dial the BMC and run the full bring-up. On success the three pumps
    /// are running and [`SolTransport::take_output`] yields console bytes.
    pub async fn connect(cfg: &SolConfig) -> Result<Self, SolError> {
        let socket = timeout(DIAL_TIMEOUT, async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect((cfg.host.as_str(), cfg.port)).await?;
            Ok::<_, std::io::Error>(socket)
        })
        .await
        .map_err(|_| timeout_error("dial"))??;

        debug!("[{}] dialed {}:{}", cfg.server, cfg.host, cfg.port);

        // Step 2: GetChannelAuthCaps over IPMI 1.5. Contents are advisory;
        // what matters is that a v2.0-capable BMC answered at all.
        let caps_req = codec::build_v15_packet(0, 0, &commands::get_channel_auth_caps(0));
        exchange(&socket, &caps_req, HANDSHAKE_STEP_TIMEOUT, |raw| {
            let body = codec::parse_v15_packet(raw).ok()?;
            Some(commands::check_auth_caps_response(body))
        })
        .await?;

        // Step 3: open session. Random non-zero console-side session id.
        let console_id = {
            let mut rng = rand::rng();
            loop {
                let id = rng.next_u32();
                if id != 0 {
                    break id;
                }
            }
        };
        let open_req = codec::build_v2_packet(
            payload::OPEN_SESSION_REQUEST,
            0,
            0,
            &commands::open_session_request(console_id),
        );
        let open = exchange(&socket, &open_req, HANDSHAKE_STEP_TIMEOUT, |raw| {
            let (hdr, body) = codec::parse_v2_packet(raw).ok()?;
            (hdr.payload_type == payload::OPEN_SESSION_RESPONSE)
                .then(|| commands::parse_open_session_response(body))
        })
        .await?;
        if AuthAlg::from_wire(open.auth_alg)? != AuthAlg::HmacSha1 {
            return Err(SolError::UnsupportedAlgorithm(open.auth_alg));
        }

        // Step 4: RAKP 1/2 — exchange randoms, derive the session keys.
        let mut rm = [0u8; 16];
        rand::rng().fill_bytes(&mut rm);
        let rakp1_req = codec::build_v2_packet(
            payload::RAKP1,
            0,
            0,
            &commands::rakp1(open.bmc_session_id, &rm, PRIV_ADMIN, &cfg.username),
        );
        let rakp2 = exchange(&socket, &rakp1_req, HANDSHAKE_STEP_TIMEOUT, |raw| {
            let (hdr, body) = codec::parse_v2_packet(raw).ok()?;
            (hdr.payload_type == payload::RAKP2).then(|| commands::parse_rakp2(body))
        })
        .await?;

        let kg = crypto::pad_password(&cfg.password);
        let sik = crypto::derive_sik(&kg, &rm, &rakp2.rc, PRIV_ADMIN, &cfg.username);
        let k1 = crypto::derive_k(&sik, 0x01);
        let k2 = crypto::derive_k(&sik, 0x02);

        // Step 5: RAKP 3/4.
        let code = crypto::rakp3_auth_code(&kg, &rakp2.rc, console_id, PRIV_ADMIN, &cfg.username);
        let rakp3_req = codec::build_v2_packet(
            payload::RAKP3,
            0,
            0,
            &commands::rakp3(open.bmc_session_id, &code),
        );
        exchange(&socket, &rakp3_req, HANDSHAKE_STEP_TIMEOUT, |raw| {
            let (hdr, body) = codec::parse_v2_packet(raw).ok()?;
            (hdr.payload_type == payload::RAKP4).then(|| commands::parse_rakp4(body))
        })
        .await?;

        let mut tx = TxState {
            bmc_session_id: open.bmc_session_id,
            seq: 0,
            rq_seq: 0,
            sol_seq: 1,
            acked_seq: 0,
            integrity: open.integrity_alg != 0,
            confidentiality: open.confidentiality_alg != 0,
            k1,
            k2,
            max_outbound: commands::DEFAULT_MAX_OUTBOUND,
        };

        // Step 6: some BMCs refuse SOL activation below Administrator even
        // when the session was opened at it.
        let rq = tx.next_rq_seq();
        let resp = session_call(
            &socket,
            &mut tx,
            commands::set_session_privilege(rq),
            commands::cmd::SET_SESSION_PRIVILEGE,
            HANDSHAKE_STEP_TIMEOUT,
        )
        .await?;
        if resp.completion != 0 {
            return Err(SolError::HandshakeRejected {
                step: "set privilege",
                status: resp.completion,
            });
        }

        // Step 7: clear stale payload state from a previous dirty shutdown.
        // The response is ignored by design.
        let rq = tx.next_rq_seq();
        let _ = session_call(
            &socket,
            &mut tx,
            commands::deactivate_sol(rq, SOL_INSTANCE),
            commands::cmd::DEACTIVATE_PAYLOAD,
            DEACTIVATE_TIMEOUT,
        )
        .await;

        // Step 8: activate, with the 0x80 retry ladder.
        let resp = activate_with_retry(&cfg.server, &socket, &mut tx).await?;
        tx.max_outbound = commands::max_outbound_from_activate(&resp);
        debug!(
            "[{}] SOL active, max outbound payload {} bytes",
            cfg.server, tx.max_outbound
        );

        let socket = Arc::new(socket);
        let shared = Arc::new(Shared::new());
        shared.touch();
        let tx_state = Arc::new(Mutex::new(tx));
        let cancel = CancellationToken::new();

        let (queue_tx, queue_rx) = mpsc::channel::<Vec<u8>>(READ_QUEUE_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_DEPTH);
        let (input_tx, input_rx) = mpsc::channel::<WriteRequest>(64);

        tokio::spawn(read_pump(
            cfg.server.clone(),
            Arc::clone(&socket),
            Arc::clone(&tx_state),
            Arc::clone(&shared),
            cancel.clone(),
            queue_tx,
            cfg.inactivity_timeout,
        ));
        tokio::spawn(drain_pump(queue_rx, output_tx));
        tokio::spawn(write_pump(
            Arc::clone(&socket),
            Arc::clone(&tx_state),
            cancel.clone(),
            input_rx,
        ));
        let keepalive = keepalive_interval(cfg.inactivity_timeout);
        tokio::spawn(keepalive_pump(
            cfg.server.clone(),
            Arc::clone(&socket),
            Arc::clone(&tx_state),
            cancel.clone(),
            keepalive,
        ));

        Ok(Self {
            server: cfg.server.clone(),
            socket,
            tx_state,
            shared,
            cancel,
            input_tx,
            output_rx: Some(output_rx),
        })
    }

    /// Take the received-bytes stream. Yields `None` once the session dies;
    /// [`SolTransport::take_error`] then explains why.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.take()
    }

    /// Send console input. Chunks larger than the negotiated payload size
    /// are split across SOL packets by the write pump.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), SolError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.input_tx
            .send(WriteRequest::Data(data, done_tx))
            .await
            .map_err(|_| SolError::WriteWhileClosed)?;
        done_rx.await.map_err(|_| SolError::WriteWhileClosed)?
    }

    /// Send a serial break.
    pub async fn send_break(&self) -> Result<(), SolError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.input_tx
            .send(WriteRequest::Break(done_tx))
            .await
            .map_err(|_| SolError::WriteWhileClosed)?;
        done_rx.await.map_err(|_| SolError::WriteWhileClosed)?
    }

    /// Time since the last datagram of any kind from the BMC.
    pub fn last_recv_age(&self) -> Duration {
        self.shared.last_recv_age()
    }

    /// The terminal error recorded by a pump, if any.
    pub fn take_error(&self) -> Option<SolError> {
        self.shared.error.lock().unwrap().take()
    }

    /// True once a pump died or `close()` ran.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// Stop the pumps, then best-effort deactivate the payload and close
    /// the BMC session. Never blocks past [`CLOSE_BUDGET`].
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            return;
        }
        self.cancel.cancel();

        let courtesy = async {
            let (deactivate, close) = {
                let mut tx = self.tx_state.lock().unwrap();
                let rq = tx.next_rq_seq();
                let deactivate = tx.seal(payload::IPMI, &commands::deactivate_sol(rq, SOL_INSTANCE));
                let rq = tx.next_rq_seq();
                let close_msg = commands::close_session(rq, tx.bmc_session_id);
                let close = tx.seal(payload::IPMI, &close_msg);
                (deactivate, close)
            };
            let _ = self.socket.send(&deactivate).await;
            // Give the BMC a beat to tear the payload down before the
            // session underneath it goes away.
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = self.socket.send(&close).await;
        };
        if timeout(CLOSE_BUDGET, courtesy).await.is_err() {
            warn!("[{}] close courtesy messages timed out", self.server);
        }
        debug!("[{}] transport closed", self.server);
    }
}

fn timeout_error(what: &str) -> SolError {
    SolError::Socket(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("BMC did not answer ({what})"),
    ))
}

/// Keepalive cadence: a third of the inactivity window, clamped.
fn keepalive_interval(inactivity: Duration) -> Duration {
    if inactivity.is_zero() {
        return MIN_KEEPALIVE_INTERVAL;
    }
    (inactivity / 3).max(MIN_KEEPALIVE_INTERVAL)
}

/// Send `request` and wait for a datagram `parse` accepts. Datagrams the
/// closure rejects (stray keepalive answers, duplicates) are skipped until
/// the budget runs out.
async fn exchange<T>(
    socket: &UdpSocket,
    request: &[u8],
    budget: Duration,
    mut parse: impl FnMut(&[u8]) -> Option<Result<T, SolError>>,
) -> Result<T, SolError> {
    timeout(WRITE_TIMEOUT, socket.send(request))
        .await
        .map_err(|_| timeout_error("send"))??;

    let deadline = Instant::now() + budget;
    let mut buf = vec![0u8; 4096];
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| timeout_error("response"))?;
        match timeout(remaining, socket.recv(&mut buf)).await {
            Err(_) => return Err(timeout_error("response")),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(n)) => {
                if let Some(result) = parse(&buf[..n]) {
                    return result;
                }
                trace!("skipping unexpected datagram ({n} bytes) during handshake");
            }
        }
    }
}

/// Send an in-session IPMI request and wait for the matching response.
async fn session_call(
    socket: &UdpSocket,
    tx: &mut TxState,
    message: Vec<u8>,
    expected_cmd: u8,
    budget: Duration,
) -> Result<codec::IpmiResponse, SolError> {
    let packet = tx.seal(payload::IPMI, &message);
    let k2 = tx.k2;
    let confidential = tx.confidentiality;
    exchange(socket, &packet, budget, move |raw| {
        let (hdr, body) = codec::parse_v2_packet(raw).ok()?;
        if hdr.payload_type != payload::IPMI {
            return None;
        }
        let opened;
        let body: &[u8] = if hdr.encrypted && confidential {
            opened = crypto::decrypt_aes_cbc(&k2, body).ok()?;
            &opened
        } else {
            body
        };
        let resp = codec::parse_ipmi_response(body).ok()?;
        (resp.cmd == expected_cmd).then_some(Ok(resp))
    })
    .await
}

/// ActivatePayload with the 0x80 ladder: deactivate + 1 s + retry, then a
/// SOL channel disable/enable cycle and one final attempt.
async fn activate_with_retry(
    server: &str,
    socket: &UdpSocket,
    tx: &mut TxState,
) -> Result<codec::IpmiResponse, SolError> {
    let attempt = |tx: &mut TxState| {
        let rq = tx.next_rq_seq();
        commands::activate_sol(rq, SOL_INSTANCE)
    };

    let msg = attempt(tx);
    let resp = session_call(socket, tx, msg, commands::cmd::ACTIVATE_PAYLOAD, ACTIVATE_TIMEOUT).await?;
    match resp.completion {
        0x00 => return Ok(resp),
        commands::CC_PAYLOAD_ALREADY_ACTIVE => {
            debug!("[{server}] SOL payload already active, clearing and retrying");
        }
        cc => return Err(SolError::ActivationFailed(cc)),
    }

    let rq = tx.next_rq_seq();
    let msg = commands::deactivate_sol(rq, SOL_INSTANCE);
    let _ = session_call(socket, tx, msg, commands::cmd::DEACTIVATE_PAYLOAD, DEACTIVATE_TIMEOUT).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let msg = attempt(tx);
    let resp = session_call(socket, tx, msg, commands::cmd::ACTIVATE_PAYLOAD, ACTIVATE_TIMEOUT).await?;
    match resp.completion {
        0x00 => return Ok(resp),
        commands::CC_PAYLOAD_ALREADY_ACTIVE => {
            warn!("[{server}] SOL payload stuck active, cycling SOL channel config");
        }
        cc => return Err(SolError::ActivationFailed(cc)),
    }

    for enable in [false, true] {
        let rq = tx.next_rq_seq();
        let msg = commands::set_sol_enable(rq, enable);
        let _ = session_call(socket, tx, msg, commands::cmd::SET_SOL_CONFIG, HANDSHAKE_STEP_TIMEOUT).await;
    }

    let msg = attempt(tx);
    let resp = session_call(socket, tx, msg, commands::cmd::ACTIVATE_PAYLOAD, ACTIVATE_TIMEOUT).await?;
    match resp.completion {
        0x00 => Ok(resp),
        commands::CC_PAYLOAD_ALREADY_ACTIVE => Err(SolError::ActivationBusy),
        cc => Err(SolError::ActivationFailed(cc)),
    }
}

// ============================================================================
// Pumps
// ============================================================================

async fn read_pump(
    server: String,
    socket: Arc<UdpSocket>,
    tx_state: Arc<Mutex<TxState>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    queue_tx: mpsc::Sender<Vec<u8>>,
    inactivity: Duration,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match timeout(READ_DEADLINE, socket.recv(&mut buf)).await {
            Err(_) => {
                if !inactivity.is_zero() && shared.last_recv_age() > inactivity {
                    warn!(
                        "[{server}] no BMC traffic for {:?}, giving up",
                        shared.last_recv_age()
                    );
                    shared.record_error(SolError::InactivityTimeout);
                    cancel.cancel();
                    break;
                }
            }
            Ok(Err(e)) => {
                if cancel.is_cancelled() {
                    break;
                }
                shared.record_error(SolError::Socket(e));
                cancel.cancel();
                break;
            }
            Ok(Ok(n)) => {
                // Any well-formed-or-not datagram proves the BMC is alive.
                shared.touch();
                handle_datagram(&server, &socket, &tx_state, &queue_tx, &buf[..n]);
            }
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
}

/// Dispatch one received datagram. Only SOL payloads matter; keepalive
/// responses and anything unparseable are dropped after the liveness touch.
fn handle_datagram(
    server: &str,
    socket: &UdpSocket,
    tx_state: &Mutex<TxState>,
    queue_tx: &mpsc::Sender<Vec<u8>>,
    raw: &[u8],
) {
    let Ok((header, body)) = codec::parse_v2_packet(raw) else {
        trace!("[{server}] dropping unparseable datagram ({} bytes)", raw.len());
        return;
    };
    if header.payload_type != payload::SOL {
        return;
    }

    let opened;
    let body: &[u8] = if header.encrypted {
        let k2 = tx_state.lock().unwrap().k2;
        match crypto::decrypt_aes_cbc(&k2, body) {
            Ok(plain) => {
                opened = plain;
                &opened
            }
            Err(e) => {
                debug!("[{server}] SOL payload failed to decrypt: {e}");
                return;
            }
        }
    } else {
        body
    };

    let Ok(sol) = codec::parse_sol_payload(body) else {
        return;
    };

    let nack = sol.op & codec::SOL_STATUS_NACK != 0;
    if !nack && sol.ack_seq != 0 {
        let mut tx = tx_state.lock().unwrap();
        tx.acked_seq = sol.ack_seq;
        trace!("[{server}] BMC acked SOL packet {}", tx.acked_seq);
    }

    if !sol.data.is_empty() {
        if queue_tx.try_send(sol.data.to_vec()).is_err() {
            warn!("[{server}] read queue full, dropping {} bytes", sol.data.len());
        }
        send_ack(socket, tx_state, sol.pkt_seq);
    } else if sol.pkt_seq != 0 {
        send_ack(socket, tx_state, sol.pkt_seq);
    }
}

/// ACK a BMC data packet. `try_send` keeps the read pump non-blocking; a
/// dropped ACK only costs a retransmit.
fn send_ack(socket: &UdpSocket, tx_state: &Mutex<TxState>, ack_seq: u8) {
    let packet = {
        let mut tx = tx_state.lock().unwrap();
        tx.seal(payload::SOL, &codec::build_sol_ack(ack_seq))
    };
    let _ = socket.try_send(&packet);
}

/// Decouple the read pump from slow consumers: the bounded queue absorbs
/// boot-time bursts, this task drains it into the supervisor's channel.
async fn drain_pump(mut queue_rx: mpsc::Receiver<Vec<u8>>, output_tx: mpsc::Sender<Vec<u8>>) {
    while let Some(chunk) = queue_rx.recv().await {
        if output_tx.send(chunk).await.is_err() {
            break;
        }
    }
}

async fn write_pump(
    socket: Arc<UdpSocket>,
    tx_state: Arc<Mutex<TxState>>,
    cancel: CancellationToken,
    mut input_rx: mpsc::Receiver<WriteRequest>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            request = input_rx.recv() => {
                let Some(request) = request else { break };
                match request {
                    WriteRequest::Data(data, done) => {
                        let result = send_data(&socket, &tx_state, &data).await;
                        let _ = done.send(result);
                    }
                    WriteRequest::Break(done) => {
                        let packet = {
                            let mut tx = tx_state.lock().unwrap();
                            let seq = tx.next_sol_seq();
                            let body = codec::build_sol_payload(seq, 0, 0, codec::SOL_OP_BREAK, &[]);
                            tx.seal(payload::SOL, &body)
                        };
                        let result = send_packet(&socket, &packet).await;
                        let _ = done.send(result);
                    }
                }
            }
        }
    }
    // Anything still queued observes the shutdown.
    while let Ok(request) = input_rx.try_recv() {
        match request {
            WriteRequest::Data(_, done) | WriteRequest::Break(done) => {
                let _ = done.send(Err(SolError::WriteWhileClosed));
            }
        }
    }
}

/// Split `data` across SOL packets of the negotiated size, sequence
/// numbers wrapping 255 → 1 and never taking 0.
async fn send_data(
    socket: &UdpSocket,
    tx_state: &Mutex<TxState>,
    data: &[u8],
) -> Result<(), SolError> {
    let mut offset = 0;
    while offset < data.len() {
        let packet = {
            let mut tx = tx_state.lock().unwrap();
            let chunk = tx.max_outbound.saturating_sub(4).max(1);
            let end = (offset + chunk).min(data.len());
            let seq = tx.next_sol_seq();
            let body = codec::build_sol_payload(seq, 0, 0, 0, &data[offset..end]);
            offset = end;
            tx.seal(payload::SOL, &body)
        };
        send_packet(socket, &packet).await?;
    }
    Ok(())
}

async fn send_packet(socket: &UdpSocket, packet: &[u8]) -> Result<(), SolError> {
    match timeout(WRITE_TIMEOUT, socket.send(packet)).await {
        Err(_) => Err(timeout_error("write")),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(_)) => Ok(()),
    }
}

/// Fire GetDeviceID on a cadence. The reply is uninteresting — it flows
/// through the read pump's liveness touch like any other datagram; the
/// request exists so a dead BMC-side session gets noticed and dropped.
async fn keepalive_pump(
    server: String,
    socket: Arc<UdpSocket>,
    tx_state: Arc<Mutex<TxState>>,
    cancel: CancellationToken,
    every: Duration,
) {
    let start = tokio::time::Instant::now() + every;
    let mut ticker = tokio::time::interval_at(start, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let packet = {
                    let mut tx = tx_state.lock().unwrap();
                    let rq = tx.next_rq_seq();
                    let msg = commands::get_device_id(rq);
                    tx.seal(payload::IPMI, &msg)
                };
                if let Err(e) = socket.try_send(&packet) {
                    debug!("[{server}] keepalive send failed: {e}");
                }
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
