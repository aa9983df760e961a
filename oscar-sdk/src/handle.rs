//! The consumer-facing handle and the session task's run loop.
//!
//! The session runs in a spawned task; consumers hold a cloneable
//! [`SessionHandle`] that sends commands over a channel and read decoded
//! [`Event`]s from the receiver returned by [`Session::new`]. This keeps the
//! engine single-owner: all cross-thread use is message passing, never
//! shared state.

use std::net::SocketAddrV4;

use anyhow::Result;
use oscar_proto::caps::Capability;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::conn::{ConnId, ConnType};
use crate::modules::icbm::{self, MessageOptions, RendezvousOffer};
use crate::modules::{buddy, chatnav, service};
use crate::rendezvous;
use crate::session::{Readiness, Session};

/// Commands the consumer can send to the engine.
#[derive(Debug)]
pub enum Command {
    /// Open a control connection of the given type to `dest` (host:port).
    Connect { conn_type: ConnType, dest: String },
    SendMessage {
        to: String,
        body: Vec<u8>,
        opts: MessageOptions,
    },
    InitiateRendezvous {
        to: String,
        offer: RendezvousOffer,
    },
    AcceptRendezvous {
        to: String,
        cookie: [u8; 8],
        cap: Capability,
    },
    DenyRendezvous {
        to: String,
        cookie: [u8; 8],
        reason: u16,
    },
    CancelRendezvous {
        to: String,
        cookie: [u8; 8],
        reason: u16,
    },
    RequestIcbmParams,
    RequestChatNavRights,
    SetIdle {
        idle_secs: u32,
    },
    AddBuddies(Vec<String>),
    RemoveBuddies(Vec<String>),
    OpenDirectIm {
        peer: String,
        addr: SocketAddrV4,
        cookie: [u8; 8],
    },
    SendDirectMessage {
        conn: ConnId,
        body: Vec<u8>,
        encoding: u16,
    },
    Typing {
        conn: ConnId,
        typing: bool,
    },
    CloseConnection {
        conn: ConnId,
    },
    Logoff,
}

/// A handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn connect(&self, conn_type: ConnType, dest: &str) -> Result<()> {
        self.send(Command::Connect {
            conn_type,
            dest: dest.to_string(),
        })
        .await
    }

    pub async fn send_message(&self, to: &str, body: &str) -> Result<()> {
        self.send(Command::SendMessage {
            to: to.to_string(),
            body: body.as_bytes().to_vec(),
            opts: MessageOptions::default(),
        })
        .await
    }

    pub async fn send_message_with(&self, to: &str, body: &[u8], opts: MessageOptions) -> Result<()> {
        self.send(Command::SendMessage {
            to: to.to_string(),
            body: body.to_vec(),
            opts,
        })
        .await
    }

    pub async fn initiate_rendezvous(&self, to: &str, offer: RendezvousOffer) -> Result<()> {
        self.send(Command::InitiateRendezvous {
            to: to.to_string(),
            offer,
        })
        .await
    }

    pub async fn accept_rendezvous(&self, to: &str, cookie: [u8; 8], cap: Capability) -> Result<()> {
        self.send(Command::AcceptRendezvous {
            to: to.to_string(),
            cookie,
            cap,
        })
        .await
    }

    pub async fn deny_rendezvous(&self, to: &str, cookie: [u8; 8], reason: u16) -> Result<()> {
        self.send(Command::DenyRendezvous {
            to: to.to_string(),
            cookie,
            reason,
        })
        .await
    }

    pub async fn add_buddies(&self, names: &[&str]) -> Result<()> {
        self.send(Command::AddBuddies(
            names.iter().map(|s| s.to_string()).collect(),
        ))
        .await
    }

    pub async fn remove_buddies(&self, names: &[&str]) -> Result<()> {
        self.send(Command::RemoveBuddies(
            names.iter().map(|s| s.to_string()).collect(),
        ))
        .await
    }

    pub async fn set_idle(&self, idle_secs: u32) -> Result<()> {
        self.send(Command::SetIdle { idle_secs }).await
    }

    pub async fn logoff(&self) -> Result<()> {
        self.send(Command::Logoff).await
    }

    pub async fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx.send(command).await?;
        Ok(())
    }
}

/// Spawn the session's run loop. The caller keeps the event receiver from
/// [`Session::new`]; the returned handle feeds it commands.
pub fn spawn(session: Session) -> (SessionHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let handle = SessionHandle { cmd_tx };
    let task = tokio::spawn(run(session, cmd_rx));
    (handle, task)
}

enum Step {
    Command(Option<Command>),
    Ready(Readiness),
}

/// The caller's event loop, as the engine expects it to be driven:
/// multiplex readiness, pump the dispatcher, flush the outgoing queue.
async fn run(mut sess: Session, mut cmds: mpsc::Receiver<Command>) {
    let keepalive = sess.config().keepalive_interval;
    loop {
        let step = tokio::select! {
            cmd = cmds.recv() => Step::Command(cmd),
            readiness = sess.wait(keepalive) => Step::Ready(readiness),
        };
        match step {
            Step::Command(None) | Step::Command(Some(Command::Logoff)) => {
                sess.logoff();
                return;
            }
            Step::Command(Some(cmd)) => {
                if let Err(e) = apply(&mut sess, cmd) {
                    warn!(error = %e, "command failed");
                }
            }
            Step::Ready(Readiness::FramesQueued) => sess.dispatch_incoming(),
            Step::Ready(Readiness::DeadConnection(_)) => sess.reap_connections(),
            Step::Ready(Readiness::OutgoingPending) => {}
            Step::Ready(Readiness::TimedOut) => sess.send_keepalive(),
        }
        sess.flush().await;
        if sess.outgoing_len() > 0 {
            // Whatever is left is being held back (forced latency, a connect
            // still in flight); yield instead of spinning on readiness.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

fn apply(sess: &mut Session, cmd: Command) -> Result<()> {
    match cmd {
        Command::Connect { conn_type, dest } => {
            let id = sess.alloc_connection(conn_type);
            sess.connect(id, &dest);
        }
        Command::SendMessage { to, body, opts } => {
            icbm::send_message(sess, &to, &body, &opts)?;
        }
        Command::InitiateRendezvous { to, offer } => {
            icbm::initiate_rendezvous(sess, &to, &offer)?;
        }
        Command::AcceptRendezvous { to, cookie, cap } => {
            icbm::accept_rendezvous(sess, &to, cookie, cap)?;
        }
        Command::DenyRendezvous { to, cookie, reason } => {
            icbm::deny_rendezvous(sess, &to, cookie, reason)?;
        }
        Command::CancelRendezvous { to, cookie, reason } => {
            icbm::cancel_rendezvous(sess, &to, cookie, reason)?;
        }
        Command::RequestIcbmParams => icbm::request_params(sess)?,
        Command::RequestChatNavRights => chatnav::request_rights(sess)?,
        Command::SetIdle { idle_secs } => {
            let conn = sess
                .find_by_type(ConnType::Bos)
                .ok_or_else(|| anyhow::anyhow!("no service connection"))?;
            service::set_idle(sess, conn, idle_secs);
        }
        Command::AddBuddies(names) => {
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            buddy::add_buddies(sess, &refs)?;
        }
        Command::RemoveBuddies(names) => {
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            buddy::remove_buddies(sess, &refs)?;
        }
        Command::OpenDirectIm { peer, addr, cookie } => {
            rendezvous::open_direct_im(sess, &peer, addr, cookie);
        }
        Command::SendDirectMessage {
            conn,
            body,
            encoding,
        } => rendezvous::send_direct_message(sess, conn, &body, encoding),
        Command::Typing { conn, typing } => rendezvous::send_typing(sess, conn, typing),
        Command::CloseConnection { conn } => sess.close_connection(conn, "requested"),
        Command::Logoff => unreachable!("handled by the run loop"),
    }
    Ok(())
}
