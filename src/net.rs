// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Tokio TCP backend for the protocol stack.
//!
//! One driver task owns the [`Stack`] and serves it from a single
//! select loop: accepted and connected sockets feed length-framed
//! datagrams in through channels, timers are driven from the stack's
//! own deadlines, and the application talks to the driver through a
//! command channel. This keeps the protocol core strictly
//! single-threaded while socket reads and writes run on their own
//! tasks.

use crate::{
    config::{keys, Config},
    error::{Error, Result},
    event::Event,
    stack::Stack,
    transport::{Effect as IoEffect, SocketId},
    types::Order,
};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, oneshot},
    task,
    time::sleep_until,
};

const MAX_FRAME_LEN: usize = 1 << 20;

/// Strip the scheme from a `tcp://host:port` listen or peer address.
fn socket_addr_of(addr: &str) -> Result<String> {
    let rest = addr
        .split_once("://")
        .map(|(scheme, rest)| match scheme {
            "tcp" | "ssl" => Ok(rest),
            other => Err(Error::InvalidConfig(format!(
                "unsupported address scheme: {}",
                other
            ))),
        })
        .transpose()?
        .unwrap_or(addr);
    Ok(rest.to_string())
}

#[derive(Debug)]
enum Command {
    Connect {
        bootstrap: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    Send {
        payload: Bytes,
        order: Order,
        resp: oneshot::Sender<Result<()>>,
    },
    SetParam {
        key: String,
        value: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Status {
        resp: oneshot::Sender<BTreeMap<String, String>>,
    },
    Close {
        force: bool,
        resp: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug)]
enum SocketEvent {
    Frame(SocketId, Bytes),
    Closed(SocketId),
    ConnectResult(SocketId, std::io::Result<TcpStream>),
}

/// Handle to a running group communication node.
#[derive(Debug)]
pub struct Node {
    commands: mpsc::Sender<Command>,
    events: mpsc::Receiver<Event>,
}

impl Node {
    /// Bind the listen socket and spawn the driver task.
    pub async fn start(config: Config, state_dir: impl Into<PathBuf>) -> Result<Self> {
        let listen_addr = socket_addr_of(
            config
                .get(keys::GMCAST_LISTEN_ADDR)
                .ok_or_else(|| Error::InvalidConfig("missing listen address".to_string()))?,
        )?;
        let listener = TcpListener::bind(&listen_addr).await?;
        info!("listening on {}", listener.local_addr()?);

        let stack = Stack::new(&config, state_dir, Instant::now())?;
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(1024);

        let _ = task::spawn(async move {
            let (socket_tx, socket_rx) = mpsc::channel(1024);
            let driver = Driver {
                stack,
                listener,
                writers: BTreeMap::new(),
                socket_events_tx: socket_tx,
                event_tx,
                pending_connect: None,
                wait_prim_deadline: None,
                announce_deadline: None,
                linger_deadline: None,
            };
            driver.run(command_rx, socket_rx).await;
        });

        Ok(Node {
            commands: command_tx,
            events: event_rx,
        })
    }

    /// Join the group. With `bootstrap` the node founds a new primary
    /// component; otherwise it connects to the configured peers and,
    /// with `pc.wait_prim`, waits until a primary view is reached.
    pub async fn connect(&self, bootstrap: bool) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { bootstrap, resp })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Send a payload under the given ordering.
    pub async fn send(&self, payload: Bytes, order: Order) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                payload,
                order,
                resp,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Receive the next view or message event.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Apply a runtime configuration change.
    pub async fn set_param(&self, key: &str, value: &str) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::SetParam {
                key: key.to_string(),
                value: value.to_string(),
                resp,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Operator status snapshot.
    pub async fn status(&self) -> Result<BTreeMap<String, String>> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { resp })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Leave the group. Without `force` the leave lingers until it has
    /// propagated.
    pub async fn close(&self, force: bool) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Close { force, resp })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

struct Driver {
    stack: Stack,
    listener: TcpListener,
    writers: BTreeMap<SocketId, mpsc::Sender<Bytes>>,
    socket_events_tx: mpsc::Sender<SocketEvent>,
    event_tx: mpsc::Sender<Event>,
    pending_connect: Option<oneshot::Sender<Result<()>>>,
    wait_prim_deadline: Option<Instant>,
    announce_deadline: Option<Instant>,
    linger_deadline: Option<Instant>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut socket_rx: mpsc::Receiver<SocketEvent>,
    ) {
        let mut pending_close: VecDeque<oneshot::Sender<Result<()>>> = VecDeque::new();

        loop {
            let now = Instant::now();
            let next_timer = match self.stack.handle_timers(now) {
                Ok(deadline) => deadline,
                Err(err) => {
                    self.fail(err).await;
                    return;
                }
            };
            if let Err(err) = self.pump(now).await {
                self.fail(err).await;
                return;
            }
            if let Some(deadline) = self.linger_deadline {
                if deadline <= now || self.stack.evs_state() == crate::evs::EvsState::Closed {
                    let _ = self.stack.finish_close(now);
                    for resp in pending_close.drain(..) {
                        let _ = resp.send(Ok(()));
                    }
                    return;
                }
            }
            let wake_at = [
                Some(next_timer),
                self.announce_deadline,
                self.wait_prim_deadline,
                self.linger_deadline,
            ]
            .iter()
            .flatten()
            .min()
            .copied()
            .unwrap_or(now + Duration::from_secs(1));

            enum Wake {
                Accepted(std::io::Result<(TcpStream, SocketAddr)>),
                Socket(Option<SocketEvent>),
                Command(Option<Command>),
                Timer,
            }
            let wake = tokio::select! {
                accepted = self.listener.accept() => Wake::Accepted(accepted),
                event = socket_rx.recv() => Wake::Socket(event),
                command = commands.recv() => Wake::Command(command),
                _ = sleep_until(wake_at.into()) => Wake::Timer,
            };
            match wake {
                Wake::Accepted(Ok((socket, addr))) => {
                    if let Err(err) = self.handle_accepted(socket, addr).await {
                        warn!("failed to accept connection: {}", err);
                    }
                }
                Wake::Accepted(Err(err)) => warn!("accept failed: {}", err),
                Wake::Socket(Some(event)) => {
                    if let Err(err) = self.handle_socket_event(event).await {
                        self.fail(err).await;
                        return;
                    }
                }
                Wake::Socket(None) => return,
                Wake::Command(None) => return,
                Wake::Command(Some(Command::Close { force, resp })) => {
                    let now = Instant::now();
                    if force {
                        let _ = self.stack.close(true, now);
                        let _ = resp.send(Ok(()));
                        return;
                    }
                    if let Err(err) = self.stack.close(false, now) {
                        let _ = resp.send(Err(err));
                        return;
                    }
                    self.linger_deadline = Some(now + self.stack.linger());
                    pending_close.push_back(resp);
                }
                Wake::Command(Some(command)) => {
                    if let Err(err) = self.handle_command(command).await {
                        self.fail(err).await;
                        return;
                    }
                }
                Wake::Timer => self.check_deadlines(Instant::now()),
            }
        }
    }

    // Announce and wait-prim progress checks.
    fn check_deadlines(&mut self, now: Instant) {
        if let Some(deadline) = self.announce_deadline {
            if self.stack.known_size() > 1 || deadline <= now {
                self.announce_deadline = None;
                if let Err(err) = self.stack.join_group(now) {
                    error!("failed to join group: {}", err);
                }
                if !self.stack.wait_prim() {
                    if let Some(resp) = self.pending_connect.take() {
                        let _ = resp.send(Ok(()));
                    }
                    self.wait_prim_deadline = None;
                }
            } else if let Err(err) = self.stack.announce(now) {
                error!("announce failed: {}", err);
            }
        }
        if let Some(deadline) = self.wait_prim_deadline {
            if self.stack.is_prim() {
                self.wait_prim_deadline = None;
                if let Some(resp) = self.pending_connect.take() {
                    let _ = resp.send(Ok(()));
                }
            } else if deadline <= now {
                self.wait_prim_deadline = None;
                if let Some(resp) = self.pending_connect.take() {
                    let _ = resp.send(Err(Error::Timeout));
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        let now = Instant::now();
        match command {
            Command::Connect { bootstrap, resp } => {
                if let Err(err) = self.stack.connect(bootstrap, now) {
                    let _ = resp.send(Err(err));
                    return Ok(());
                }
                if bootstrap {
                    // Founders form the first view immediately.
                    match self.stack.join_group(now) {
                        Ok(()) => {
                            let _ = resp.send(Ok(()));
                        }
                        Err(err) => {
                            let _ = resp.send(Err(err));
                        }
                    }
                } else {
                    // Announce for a bounded period, then join; with
                    // wait_prim the reply is deferred until a primary
                    // view forms.
                    self.pending_connect = Some(resp);
                    self.announce_deadline = Some(now + self.stack.announce_timeout());
                    if self.stack.wait_prim() {
                        self.wait_prim_deadline = Some(now + self.stack.wait_prim_timeout());
                    }
                }
                self.pump(now).await
            }
            Command::Send {
                payload,
                order,
                resp,
            } => {
                let result = self.stack.send(payload, order, now);
                let _ = resp.send(result);
                self.pump(now).await
            }
            Command::SetParam { key, value, resp } => {
                let result = self.stack.set_param(&key, &value, now);
                let _ = resp.send(result);
                self.pump(now).await
            }
            Command::Status { resp } => {
                let _ = resp.send(self.stack.status());
                Ok(())
            }
            Command::Close { .. } => unreachable!("close handled in run loop"),
        }
    }

    async fn handle_accepted(&mut self, socket: TcpStream, addr: SocketAddr) -> Result<()> {
        trace!("accepted connection from {}", addr);
        let now = Instant::now();
        if let Some(id) = self.stack.accept(now)? {
            self.attach(id, socket);
        }
        self.pump(now).await
    }

    async fn handle_socket_event(&mut self, event: SocketEvent) -> Result<()> {
        let now = Instant::now();
        match event {
            SocketEvent::Frame(id, bytes) => self.stack.handle_datagram(id, bytes, now)?,
            SocketEvent::Closed(id) => {
                let _ = self.writers.remove(&id);
                self.stack.handle_socket_failed(id, now)?;
            }
            SocketEvent::ConnectResult(id, Ok(socket)) => {
                self.attach(id, socket);
                self.stack.handle_connected(id, now)?;
            }
            SocketEvent::ConnectResult(id, Err(err)) => {
                debug!("connect failed: {}", err);
                self.stack.handle_socket_failed(id, now)?;
            }
        }
        self.pump(now).await?;
        // The connect reply may become ready on any traffic.
        self.check_deadlines(now);
        Ok(())
    }

    // Spawn reader and writer tasks for an established socket.
    fn attach(&mut self, id: SocketId, socket: TcpStream) {
        let (read_half, write_half) = socket.into_split();
        let (write_tx, write_rx) = mpsc::channel(1024);
        let _ = self.writers.insert(id, write_tx);
        let events = self.socket_events_tx.clone();
        let _ = task::spawn(read_frames(id, read_half, events));
        let _ = task::spawn(write_frames(id, write_half, write_rx));
    }

    // Apply the stack's I/O requests and forward application events.
    async fn pump(&mut self, now: Instant) -> Result<()> {
        for effect in self.stack.drain_io() {
            match effect {
                IoEffect::Connect { id, addr } => {
                    let events = self.socket_events_tx.clone();
                    let addr = socket_addr_of(&addr)?;
                    let _ = task::spawn(async move {
                        let result = TcpStream::connect(&addr).await;
                        let _ = events.send(SocketEvent::ConnectResult(id, result)).await;
                    });
                }
                IoEffect::Send { id, bytes } => {
                    if let Some(writer) = self.writers.get(&id) {
                        if writer.try_send(bytes).is_err() {
                            debug!("write queue full or closed for socket {}", id);
                        }
                    }
                }
                IoEffect::Close { id } => {
                    let _ = self.writers.remove(&id);
                }
                IoEffect::Deliver { .. } | IoEffect::RemoveStateFile => {
                    // Consumed inside the stack.
                }
            }
        }
        while let Some(event) = self.stack.poll_event() {
            if self.event_tx.send(event).await.is_err() {
                return Err(Error::Closed);
            }
        }
        let _ = now;
        Ok(())
    }

    async fn fail(&mut self, err: Error) {
        error!("node failed: {}", err);
        if let Some(resp) = self.pending_connect.take() {
            let _ = resp.send(Err(err));
        }
    }
}

async fn read_frames(id: SocketId, mut read_half: OwnedReadHalf, events: mpsc::Sender<SocketEvent>) {
    loop {
        let mut len_buf = [0u8; 4];
        match read_half.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(_) => break,
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            warn!("oversized frame ({} bytes) on socket {}", len, id);
            break;
        }
        let mut frame = BytesMut::with_capacity(len);
        frame.resize(len, 0);
        if read_half.read_exact(&mut frame).await.is_err() {
            break;
        }
        if events
            .send(SocketEvent::Frame(id, frame.freeze()))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = events.send(SocketEvent::Closed(id)).await;
}

async fn write_frames(
    id: SocketId,
    mut write_half: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Bytes>,
) {
    while let Some(frame) = frames.recv().await {
        let len = (frame.len() as u32).to_be_bytes();
        if write_half.write_all(&len).await.is_err() || write_half.write_all(&frame).await.is_err()
        {
            debug!("write failed on socket {}", id);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_scheme_parsing() {
        assert_eq!(
            socket_addr_of("tcp://127.0.0.1:4567").unwrap(),
            "127.0.0.1:4567"
        );
        assert_eq!(socket_addr_of("127.0.0.1:4567").unwrap(), "127.0.0.1:4567");
        assert!(socket_addr_of("udp://127.0.0.1:4567").is_err());
    }
}
