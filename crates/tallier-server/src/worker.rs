/// Worker task: one shared-port UDP receiver plus its control channel.
///
/// Flush requests ride the same select loop as datagram receives, so a
/// command is only ever handled between datagrams and the bundle swap
/// needs no lock.

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info};

use tallier_protocol::MAX_DATAGRAM_SIZE;

use crate::bundle::AccumulationBundle;
use crate::listener::ListenerState;

/// Master → worker.
#[derive(Debug)]
pub enum Command {
    Flush,
    Shutdown,
}

/// Worker → master.
#[derive(Debug)]
pub enum Reply {
    Bundle(AccumulationBundle),
    MessageCount(u64),
}

pub struct Worker {
    id: usize,
    socket: UdpSocket,
    listener: ListenerState,
    commands: mpsc::Receiver<Command>,
    replies: mpsc::Sender<Reply>,
}

impl Worker {
    pub fn new(
        id: usize,
        socket: UdpSocket,
        commands: mpsc::Receiver<Command>,
        replies: mpsc::Sender<Reply>,
    ) -> Self {
        Self {
            id,
            socket,
            listener: ListenerState::new(id),
            commands,
            replies,
        }
    }

    /// Receive loop. Runs until a Shutdown command arrives or the master
    /// side of the channel goes away.
    pub async fn run(mut self) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        info!(worker = self.id, "worker listening");

        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Flush) => {
                        let bundle = self.listener.flush();
                        if self.replies.send(Reply::Bundle(bundle)).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        let count = self.listener.message_count();
                        let _ = self.replies.send(Reply::MessageCount(count)).await;
                        break;
                    }
                },

                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok((len, _addr)) => self.listener.handle_datagram(&buf[..len]),
                    Err(e) => {
                        // Transient socket errors never stop the loop.
                        error!(worker = self.id, "receive error: {}", e);
                    }
                },
            }
        }

        info!(worker = self.id, "worker stopped");
    }
}
