//! Room runtime: one handle and one consumer task per active room.
//!
//! The server task owns the room map and performs join/leave; hot-path
//! operations (edits and lock requests) are pushed onto the room's ordering
//! queue by connection handling and drained here by the room's single
//! consumer. The consumer applies the permission and lock checks, stamps
//! the sequence number at dequeue time and fans the event out — so dequeue
//! order is the room's authoritative order, including for lock ties.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use collab_system::room::{LockExtend, LockGrant, LockRelease, RoomState};
use collab_system::{
    epoch_ms, CommandId, CommandOutcome, EditEvent, EventSink, Identity, OperationKind,
    OrderingQueue, PermissionTable, QueueFull, Rejection, RoomEvent, RoomId, RoomSnapshot,
    SessionId,
};

use crate::connection_tx_storage::SendOutcome;
use crate::dispatch::Dispatcher;
use crate::server::{ConnectionCommand, ServerTx};

/// An operation waiting for its turn in the room's authoritative order.
/// Carries the producer's identity as resolved at enqueue time.
#[derive(Debug)]
pub struct RoomOp {
    pub command_id: CommandId,
    pub session_id: SessionId,
    pub identity: Identity,
    pub action: RoomAction,
}

#[derive(Debug)]
pub enum RoomAction {
    Edit { kind: OperationKind, payload: Vec<u8> },
    AcquireLock,
    ReleaseLock,
    ExtendLock,
}

/// Everything the room consumers need besides the room itself.
pub struct RoomDeps {
    pub permissions: Arc<PermissionTable>,
    pub dispatcher: Dispatcher,
    pub sink: Arc<dyn EventSink>,
    pub server_tx: ServerTx,
    pub lock_ttl: Duration,
}

pub struct RoomHandle {
    room_id: RoomId,
    state: Mutex<RoomState>,
    queue: OrderingQueue<RoomOp>,
    notify: Notify,
    closed: AtomicBool,
}

impl RoomHandle {
    pub fn new(room_id: RoomId, queue_capacity: usize) -> Self {
        Self {
            room_id,
            state: Mutex::new(RoomState::new(room_id)),
            queue: OrderingQueue::with_capacity(queue_capacity),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Producer side: enqueue and wake the consumer. Fails fast when the
    /// ring is full so backpressure reaches the offending client.
    pub fn submit(&self, op: RoomOp) -> Result<(), QueueFull<RoomOp>> {
        self.queue.push(op)?;
        self.notify.notify_one();
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owned by the server task. Rooms are created lazily on first join and
/// reclaimed immediately when the last member leaves.
pub struct RoomManager {
    rooms: HashMap<RoomId, Arc<RoomHandle>>,
    queue_capacity: usize,
}

impl RoomManager {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            queue_capacity,
        }
    }

    pub fn handle(&self, room_id: RoomId) -> Option<Arc<RoomHandle>> {
        self.rooms.get(&room_id).cloned()
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Adds the session, creating the room (and its consumer task) on first
    /// join. Returns the snapshot for the new member and the members to
    /// notify.
    pub fn join(
        &mut self,
        room_id: RoomId,
        session_id: SessionId,
        now: Instant,
        deps: &Arc<RoomDeps>,
    ) -> (RoomSnapshot, Vec<SessionId>) {
        let handle = match self.rooms.get(&room_id) {
            Some(handle) => Arc::clone(handle),
            None => {
                let handle = Arc::new(RoomHandle::new(room_id, self.queue_capacity));
                tokio::spawn(run_consumer(Arc::clone(&handle), Arc::clone(deps)));
                self.rooms.insert(room_id, Arc::clone(&handle));
                log::info!("room {} created", room_id);
                handle
            }
        };

        let mut state = handle.state();
        state.join(session_id);
        let snapshot = state.snapshot(now);
        let others = state
            .members()
            .into_iter()
            .filter(|&member| member != session_id)
            .collect();
        (snapshot, others)
    }

    /// Removes the session; the room mutex makes lock release and
    /// membership removal one observable step. Returns the post-leave
    /// snapshot and remaining members, or `None` when the session was not a
    /// member. Empty rooms are torn down before this returns.
    pub fn leave(
        &mut self,
        room_id: RoomId,
        session_id: SessionId,
        now: Instant,
    ) -> Option<(RoomSnapshot, Vec<SessionId>)> {
        let handle = self.rooms.get(&room_id).cloned()?;
        let (was_member, emptied, snapshot, remaining) = {
            let mut state = handle.state();
            let was_member = state.leave(session_id);
            (
                was_member,
                state.is_empty(),
                state.snapshot(now),
                state.members(),
            )
        };
        if !was_member {
            return None;
        }
        if emptied {
            self.rooms.remove(&room_id);
            handle.close();
            log::info!("room {} reclaimed", room_id);
        }
        Some((snapshot, remaining))
    }
}

/// Single consumer per room: drains the ring in FIFO order until the room
/// is closed and the queue runs dry. Never awaits I/O.
pub async fn run_consumer(handle: Arc<RoomHandle>, deps: Arc<RoomDeps>) {
    log::debug!("room {} consumer started", handle.room_id);
    loop {
        while let Some(op) = handle.queue.pop() {
            process(&handle, &deps, op);
        }
        if handle.closed.load(Ordering::Acquire) && handle.queue.is_empty() {
            break;
        }
        handle.notify.notified().await;
    }
    log::debug!("room {} consumer stopped", handle.room_id);
}

fn process(handle: &RoomHandle, deps: &RoomDeps, op: RoomOp) {
    let now = Instant::now();
    match op.action {
        RoomAction::Edit { kind, payload } => {
            if !deps
                .permissions
                .resolve(op.identity.role, op.identity.space_type, kind)
            {
                reply(deps, op.session_id, op.command_id, rejected(Rejection::PermissionDenied));
                return;
            }
            let (event, members) = {
                let mut state = handle.state();
                if !state.is_member(op.session_id) {
                    // Left (or was dropped) between enqueue and dequeue.
                    log::debug!(
                        "discarding edit from departed session {} in room {}",
                        op.session_id,
                        handle.room_id
                    );
                    return;
                }
                if let Err(holder) = state.check_edit_lock(op.session_id, now) {
                    drop(state);
                    reply(
                        deps,
                        op.session_id,
                        op.command_id,
                        rejected(Rejection::LockHeldByOther { holder }),
                    );
                    return;
                }
                let event = EditEvent {
                    sequence: state.assign_sequence(),
                    room_id: handle.room_id,
                    session_id: op.session_id,
                    kind,
                    payload,
                    produced_at_ms: epoch_ms(),
                };
                (event, state.members())
            };
            // Everyone gets the event; the originator's copy is its ack.
            let dead = deps
                .dispatcher
                .broadcast(&members, &RoomEvent::from_edit(&event), None);
            deps.sink.record(&event);
            report_dead(deps, dead);
        }
        RoomAction::AcquireLock => {
            if !deps.permissions.resolve(
                op.identity.role,
                op.identity.space_type,
                OperationKind::AcquireLock,
            ) {
                reply(deps, op.session_id, op.command_id, rejected(Rejection::PermissionDenied));
                return;
            }
            let (outcome, broadcast) = {
                let mut state = handle.state();
                match state.acquire_lock(op.session_id, deps.lock_ttl, now) {
                    LockGrant::Granted { expires_at } => (
                        CommandOutcome::LockGranted {
                            expires_in_ms: expires_at.saturating_duration_since(now).as_millis()
                                as u64,
                        },
                        Some((state.snapshot(now), state.members())),
                    ),
                    LockGrant::Denied { holder } => {
                        (CommandOutcome::LockDenied { holder }, None)
                    }
                }
            };
            reply(deps, op.session_id, op.command_id, outcome);
            notify_lock_change(deps, op.session_id, broadcast);
        }
        RoomAction::ReleaseLock => {
            if !deps.permissions.resolve(
                op.identity.role,
                op.identity.space_type,
                OperationKind::ReleaseLock,
            ) {
                reply(deps, op.session_id, op.command_id, rejected(Rejection::PermissionDenied));
                return;
            }
            let (outcome, broadcast) = {
                let mut state = handle.state();
                match state.release_lock(op.session_id) {
                    LockRelease::Released => (
                        CommandOutcome::LockReleased,
                        Some((state.snapshot(now), state.members())),
                    ),
                    LockRelease::NotHolder => (CommandOutcome::NotHolder, None),
                }
            };
            reply(deps, op.session_id, op.command_id, outcome);
            notify_lock_change(deps, op.session_id, broadcast);
        }
        RoomAction::ExtendLock => {
            if !deps.permissions.resolve(
                op.identity.role,
                op.identity.space_type,
                OperationKind::ExtendLock,
            ) {
                reply(deps, op.session_id, op.command_id, rejected(Rejection::PermissionDenied));
                return;
            }
            let outcome = {
                let mut state = handle.state();
                match state.extend_lock(op.session_id, deps.lock_ttl, now) {
                    LockExtend::Extended { expires_at } => CommandOutcome::LockExtended {
                        expires_in_ms: expires_at.saturating_duration_since(now).as_millis() as u64,
                    },
                    LockExtend::NotHolder => CommandOutcome::NotHolder,
                }
            };
            reply(deps, op.session_id, op.command_id, outcome);
        }
    }
}

fn rejected(rejection: Rejection) -> CommandOutcome {
    CommandOutcome::Rejected { rejection }
}

fn reply(deps: &RoomDeps, to: SessionId, command_id: CommandId, result: CommandOutcome) {
    if deps.dispatcher.reply(to, command_id, result) == SendOutcome::Dropped {
        report_dead(deps, vec![to]);
    }
}

fn notify_lock_change(
    deps: &RoomDeps,
    originator: SessionId,
    broadcast: Option<(RoomSnapshot, Vec<SessionId>)>,
) {
    if let Some((snapshot, members)) = broadcast {
        let dead = deps.dispatcher.broadcast(
            &members,
            &RoomEvent::RoomStateChanged { snapshot },
            Some(originator),
        );
        report_dead(deps, dead);
    }
}

fn report_dead(deps: &RoomDeps, dead: Vec<SessionId>) {
    for session_id in dead {
        // Route through the server task so teardown stays single-writer.
        let _ = deps
            .server_tx
            .try_send(ConnectionCommand::Disconnect { session_id });
    }
}
