//! Central server task.
//!
//! Single-writer for the connection registry and the room map, fed by a
//! command channel from the connection actors, the heartbeat sweeper and
//! the room consumers (dead-session reports). Hot-path operations are not
//! handled here; they are pushed onto the owning room's ordering queue and
//! drained by that room's consumer task.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{channel, Sender};
use uuid::Uuid;

use collab_system::{
    ClientCommand, ClientEnvelope, CommandId, CommandOutcome, EventSink, Identity,
    IdentityResolver, OperationKind, PermissionTable, QueueFull, Rejection, RoomEvent, RoomId,
    SessionId,
};

use crate::config::ServerConfig;
use crate::connection::{CloseIntent, ConnectionEvent};
use crate::connection_tx_storage::{ConnectionTx, ConnectionTxStorage, SendOutcome};
use crate::dispatch::Dispatcher;
use crate::registry::{ConnectionRegistry, SessionRecord};
use crate::rooms::{RoomAction, RoomDeps, RoomManager, RoomOp};

pub type ServerTx = Sender<ConnectionCommand>;

#[derive(Debug)]
pub enum ConnectionCommand {
    /// New duplex connection; the token is resolved to an identity before
    /// anything else is accepted.
    Connect { token: String, tx: ConnectionTx },
    /// Explicit close, protocol error teardown, heartbeat timeout or a
    /// dead-outbox report. Cleanup runs at most once per session.
    Disconnect { session_id: SessionId },
    Envelope {
        from: SessionId,
        envelope: ClientEnvelope,
    },
    SweepTick,
}

struct Server {
    config: ServerConfig,
    registry: ConnectionRegistry,
    rooms: RoomManager,
    connections: ConnectionTxStorage,
    dispatcher: Dispatcher,
    resolver: Arc<dyn IdentityResolver>,
    deps: Arc<RoomDeps>,
}

impl Server {
    fn new(
        config: ServerConfig,
        resolver: Arc<dyn IdentityResolver>,
        sink: Arc<dyn EventSink>,
        permissions: Arc<PermissionTable>,
        server_tx: ServerTx,
    ) -> Self {
        let connections = ConnectionTxStorage::new();
        let dispatcher = Dispatcher::new(connections.clone());
        let deps = Arc::new(RoomDeps {
            permissions,
            dispatcher: dispatcher.clone(),
            sink,
            server_tx,
            lock_ttl: config.lock_ttl,
        });
        Self {
            rooms: RoomManager::new(config.queue_capacity),
            registry: ConnectionRegistry::new(),
            connections,
            dispatcher,
            resolver,
            deps,
            config,
        }
    }

    fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Connect { token, tx } => self.handle_connect(token, tx),
            ConnectionCommand::Disconnect { session_id } => {
                self.handle_disconnect(session_id, None)
            }
            ConnectionCommand::Envelope { from, envelope } => self.handle_envelope(from, envelope),
            ConnectionCommand::SweepTick => self.handle_sweep(),
        }
    }

    fn handle_connect(&mut self, token: String, tx: ConnectionTx) {
        let identity = match self.resolver.resolve(&token) {
            Ok(identity) => identity,
            Err(_) => {
                log::info!("rejecting unauthenticated connection");
                let _ = tx.try_send(ConnectionEvent::Close {
                    reason: CloseIntent::Unauthenticated,
                });
                return;
            }
        };

        let session_id = Uuid::new_v4();
        let record = SessionRecord::new(session_id, identity, Instant::now());
        if let Err(err) = self.registry.register(record) {
            log::warn!("registration failed: {}", err);
            let _ = tx.try_send(ConnectionEvent::Close {
                reason: CloseIntent::Protocol,
            });
            return;
        }
        self.connections.insert(session_id, tx);
        if self
            .connections
            .try_send(&session_id, ConnectionEvent::Registered { session_id })
            != SendOutcome::Sent
        {
            self.handle_disconnect(session_id, None);
            return;
        }
        log::info!(
            "session {} connected (user {}, space {})",
            session_id,
            identity.user_id,
            identity.space_id
        );
    }

    fn handle_envelope(&mut self, from: SessionId, envelope: ClientEnvelope) {
        let (identity, room_id) = match self.registry.get(&from) {
            Some(record) => (record.identity, record.room_id),
            None => {
                log::debug!("envelope from unknown session {}", from);
                return;
            }
        };
        let command_id = envelope.command_id;

        match envelope.command {
            ClientCommand::Heartbeat => {
                let _ = self.registry.touch_heartbeat(&from, Instant::now());
                self.reply(from, command_id, CommandOutcome::HeartbeatAck);
            }
            ClientCommand::JoinRoom { room_id: target } => {
                self.handle_join(from, command_id, identity, room_id, target)
            }
            ClientCommand::LeaveRoom { room_id: target } => {
                self.handle_leave(from, command_id, room_id, target)
            }
            ClientCommand::EditOp {
                room_id: target,
                kind,
                payload,
            } => self.submit(from, command_id, identity, room_id, target, RoomAction::Edit {
                kind,
                payload,
            }),
            ClientCommand::AcquireLock { room_id: target } => {
                self.submit(from, command_id, identity, room_id, target, RoomAction::AcquireLock)
            }
            ClientCommand::ReleaseLock { room_id: target } => {
                self.submit(from, command_id, identity, room_id, target, RoomAction::ReleaseLock)
            }
            ClientCommand::ExtendLock { room_id: target } => {
                self.submit(from, command_id, identity, room_id, target, RoomAction::ExtendLock)
            }
        }
    }

    fn handle_join(
        &mut self,
        from: SessionId,
        command_id: CommandId,
        identity: Identity,
        current_room: Option<RoomId>,
        target: RoomId,
    ) {
        if current_room.is_some() {
            self.deny(from, command_id, "already in a room");
            return;
        }
        if !self
            .deps
            .permissions
            .resolve(identity.role, identity.space_type, OperationKind::Join)
        {
            self.deny(from, command_id, "no capability for this space");
            return;
        }

        let now = Instant::now();
        let (snapshot, others) = self.rooms.join(target, from, now, &self.deps);
        self.registry.set_room(&from, Some(target));
        log::info!("session {} joined room {}", from, target);
        self.reply(
            from,
            command_id,
            CommandOutcome::RoomJoined {
                snapshot: snapshot.clone(),
            },
        );
        let dead = self
            .dispatcher
            .broadcast(&others, &RoomEvent::RoomStateChanged { snapshot }, None);
        self.cleanup_dead(dead);
    }

    fn handle_leave(
        &mut self,
        from: SessionId,
        command_id: CommandId,
        current_room: Option<RoomId>,
        target: RoomId,
    ) {
        if current_room != Some(target) {
            self.deny(from, command_id, "not a member of that room");
            return;
        }
        let departed = self.rooms.leave(target, from, Instant::now());
        self.registry.set_room(&from, None);
        log::info!("session {} left room {}", from, target);
        self.reply(from, command_id, CommandOutcome::RoomLeft);
        if let Some((snapshot, remaining)) = departed {
            let dead = self
                .dispatcher
                .broadcast(&remaining, &RoomEvent::RoomStateChanged { snapshot }, None);
            self.cleanup_dead(dead);
        }
    }

    fn submit(
        &mut self,
        from: SessionId,
        command_id: CommandId,
        identity: Identity,
        current_room: Option<RoomId>,
        target: RoomId,
        action: RoomAction,
    ) {
        if current_room != Some(target) {
            self.deny(from, command_id, "not a member of that room");
            return;
        }
        let Some(handle) = self.rooms.handle(target) else {
            self.deny(from, command_id, "room is gone");
            return;
        };
        let op = RoomOp {
            command_id,
            session_id: from,
            identity,
            action,
        };
        if let Err(QueueFull(_)) = handle.submit(op) {
            log::warn!("room {} queue full, pushing back on {}", target, from);
            self.reply(
                from,
                command_id,
                CommandOutcome::Rejected {
                    rejection: Rejection::QueueFull,
                },
            );
        }
    }

    /// The full disconnect path: lock release and membership removal happen
    /// inside the room's own mutex, then the session is dropped from the
    /// registry and the outbox map. Safe to call more than once; only the
    /// first call finds the record.
    fn handle_disconnect(&mut self, session_id: SessionId, close: Option<CloseIntent>) {
        let room_id = match self.registry.get(&session_id) {
            Some(record) => record.room_id,
            None => return,
        };
        if let Some(room_id) = room_id {
            if let Some((snapshot, remaining)) = self.rooms.leave(room_id, session_id, Instant::now())
            {
                let dead = self
                    .dispatcher
                    .broadcast(&remaining, &RoomEvent::RoomStateChanged { snapshot }, None);
                self.cleanup_dead(dead);
            }
        }
        self.registry.unregister(&session_id);
        if let Some(reason) = close {
            let _ = self
                .connections
                .try_send(&session_id, ConnectionEvent::Close { reason });
        }
        self.connections.remove(&session_id);
        log::info!("session {} closed", session_id);
    }

    fn handle_sweep(&mut self) {
        let now = Instant::now();
        let stale = self
            .registry
            .sweep_expired(now, self.config.heartbeat_timeout);
        for session_id in stale {
            log::warn!("session {} heartbeat timeout", session_id);
            self.handle_disconnect(session_id, Some(CloseIntent::HeartbeatTimeout));
        }
    }

    fn reply(&mut self, to: SessionId, command_id: CommandId, result: CommandOutcome) {
        if self.dispatcher.reply(to, command_id, result) == SendOutcome::Dropped {
            self.handle_disconnect(to, None);
        }
    }

    fn deny(&mut self, to: SessionId, command_id: CommandId, reason: &str) {
        self.reply(
            to,
            command_id,
            CommandOutcome::Denied {
                reason: reason.into(),
            },
        );
    }

    fn cleanup_dead(&mut self, dead: Vec<SessionId>) {
        for session_id in dead {
            self.handle_disconnect(session_id, None);
        }
    }
}

/// Spawns the server task and the heartbeat sweeper; returns the command
/// channel the connection layer feeds.
pub fn spawn_server(
    config: ServerConfig,
    resolver: Arc<dyn IdentityResolver>,
    sink: Arc<dyn EventSink>,
    permissions: Arc<PermissionTable>,
) -> ServerTx {
    let (srv_tx, mut srv_rx) = channel::<ConnectionCommand>(64);

    let sweep_tx = srv_tx.clone();
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if sweep_tx.send(ConnectionCommand::SweepTick).await.is_err() {
                break;
            }
        }
    });

    let loop_tx = srv_tx.clone();
    tokio::spawn(async move {
        let mut server = Server::new(config, resolver, sink, permissions, loop_tx);
        while let Some(command) = srv_rx.recv().await {
            server.handle_command(command);
        }
    });

    srv_tx
}
