//! WebSocket handler: connection lifecycle and frame routing.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use beamdrop_shared::{ClientFrame, FrameError, RelayError};

use crate::config::ServerConfig;
use crate::identity::{self, ClientIdentity};
use crate::registry::{now_millis, Device, DeviceRegistry};
use crate::rooms::{self, RoomRegistry};
use crate::store::Store;
use crate::transfer::{
    ChunkIngest, IngestOutcome, TransferTable, MAX_CONCURRENT_TRANSFERS, MAX_MEMORY,
};

/// Advertised chunk size for desktop-class clients.
pub const DEFAULT_CHUNK_SIZE: usize = 20 * 1024 * 1024;
/// Mobile Safari sessions are fragile; keep frames small.
pub const MOBILE_CHUNK_SIZE: usize = 1024 * 1024;
pub const MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

const WELCOME_DEBOUNCE_MS: u64 = 100;
const DUPLICATE_CLOSE_GRACE_MS: u64 = 1000;
const OUTBOUND_QUEUE: usize = 64;

const HEARTBEAT_PERIOD_SECS: u64 = 15;
const HEARTBEAT_PERIOD_IOS_SECS: u64 = 10;
/// A ping goes out only when the channel has been quiet this long.
const HEARTBEAT_IDLE_SECS: u64 = 30;
/// Emergency cleanup also sheds channels idle this long.
const EMERGENCY_IDLE_SECS: u64 = 30;

fn unix_secs() -> u64 {
    now_millis() / 1000
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

/// A live channel bound to a device.
pub struct ConnectionHandle {
    pub tx: mpsc::Sender<Message>,
    /// Serial deciding ownership in the duplicate-connection race.
    pub epoch: u64,
    pub addr: IpAddr,
    pub connected_at: Instant,
    /// Unix seconds of the last inbound frame.
    pub last_activity: Arc<AtomicU64>,
    pub mobile_safari: bool,
}

/// Server state shared across connections
pub struct ServerState {
    pub config: ServerConfig,
    pub devices: Arc<DeviceRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub transfers: TransferTable,
    /// Map of device id → live channel
    pub connections: DashMap<String, ConnectionHandle>,
    pub store: Store,
    pub started_at: Instant,
    /// Current total connection count (for enforcing max_connections)
    connection_count: AtomicUsize,
    /// Per-IP connection counts (for enforcing max_connections_per_ip)
    ip_connections: DashMap<IpAddr, AtomicUsize>,
    conn_serial: AtomicU64,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        devices: Arc<DeviceRegistry>,
        rooms: Arc<RoomRegistry>,
        store: Store,
    ) -> Self {
        ServerState {
            config,
            devices,
            rooms,
            transfers: TransferTable::default(),
            connections: DashMap::new(),
            store,
            started_at: Instant::now(),
            connection_count: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
            conn_serial: AtomicU64::new(0),
        }
    }

    /// Try to acquire a connection slot. Returns false if limits are exceeded.
    fn try_acquire_connection(&self, ip: IpAddr) -> bool {
        let max_global = self.config.max_connections;
        let max_per_ip = self.config.max_connections_per_ip;

        if max_global > 0 && self.connection_count.load(Ordering::Relaxed) >= max_global {
            return false;
        }
        if max_per_ip > 0 {
            let entry = self
                .ip_connections
                .entry(ip)
                .or_insert_with(|| AtomicUsize::new(0));
            if entry.value().load(Ordering::Relaxed) >= max_per_ip {
                return false;
            }
            entry.value().fetch_add(1, Ordering::Relaxed);
        }
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release a connection slot.
    fn release_connection(&self, ip: IpAddr) {
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        if let Some(entry) = self.ip_connections.get(&ip) {
            let prev = entry.value().fetch_sub(1, Ordering::Relaxed);
            if prev <= 1 {
                drop(entry);
                self.ip_connections.remove(&ip);
            }
        }
    }

    pub fn connection_total(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Deliver one frame to a device's channel, if it has one.
    pub async fn send_to(&self, device_id: &str, payload: &Value) -> bool {
        let tx = match self.connections.get(device_id) {
            Some(entry) => entry.tx.clone(),
            None => return false,
        };
        tx.send(Message::Text(payload.to_string())).await.is_ok()
    }

    /// Recompute a room's presence list and fan it out to every member
    /// channel. Registry locks are released before the first send.
    pub async fn broadcast_device_list(&self, room_id: &str) {
        let Some((members, payload)) = rooms::device_list_payload(&self.rooms, &self.devices, room_id)
        else {
            return;
        };
        for member in members {
            if !self.send_to(&member, &payload).await && self.connections.contains_key(&member) {
                debug!(device_id = %member, room_id, "presence delivery failed");
            }
        }
    }

    /// Send a frame to every member of a room, optionally skipping one.
    pub async fn broadcast_to_room(&self, room_id: &str, payload: &Value, except: Option<&str>) {
        for member in self.rooms.member_ids(room_id) {
            if except == Some(member.as_str()) {
                continue;
            }
            self.send_to(&member, payload).await;
        }
    }

    /// Close channels whose last inbound activity is older than the limit.
    /// Returns how many close frames went out.
    pub async fn close_idle_channels(&self, idle_limit_secs: u64, reason: RelayError) -> usize {
        let now = unix_secs();
        let idle: Vec<mpsc::Sender<Message>> = self
            .connections
            .iter()
            .filter(|e| now.saturating_sub(e.last_activity.load(Ordering::Relaxed)) > idle_limit_secs)
            .map(|e| e.tx.clone())
            .collect();
        let count = idle.len();
        for tx in idle {
            let _ = tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.to_string().into(),
                })))
                .await;
        }
        count
    }

    /// Broadcast shutdown closes to every channel (process exit path).
    pub async fn close_all_channels(&self) {
        let all: Vec<mpsc::Sender<Message>> =
            self.connections.iter().map(|e| e.tx.clone()).collect();
        for tx in all {
            let _ = tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "ServerShutdown".into(),
                })))
                .await;
        }
    }
}

// ---------------------------------------------------------------------------
// Upgrade handler
// ---------------------------------------------------------------------------

/// Handle WebSocket upgrade — admission control happens before accepting.
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ip = addr.ip();

    if state.transfers.governor.memory_in_flight() > MAX_MEMORY {
        warn!("connection rejected for {}: memory governor over limit", ip);
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if !state.try_acquire_connection(ip) {
        warn!("connection rejected for {}: limit exceeded", ip);
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let user_agent = header_str(&headers, "user-agent");
    let accept_language = header_str(&headers, "accept-language");
    let identity = identity::derive(&user_agent, Some(ip), &accept_language);

    // Frame limit follows the advertised chunk size, with headroom for
    // base64 expansion and the JSON envelope.
    let frame_limit = if identity.mobile_safari {
        MOBILE_CHUNK_SIZE * 2
    } else {
        DEFAULT_CHUNK_SIZE * 2
    };

    ws.max_message_size(frame_limit)
        .max_frame_size(frame_limit)
        .on_upgrade(move |socket| handle_socket(socket, state, addr, identity, user_agent))
        .into_response()
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

/// Per-connection context handed to frame handlers.
struct ConnCtx {
    device_id: String,
    tx: mpsc::Sender<Message>,
    mobile_safari: bool,
}

impl ConnCtx {
    async fn reply(&self, payload: &Value) {
        let _ = self.tx.send(Message::Text(payload.to_string())).await;
    }

    async fn reply_error(&self, err: RelayError, transfer_id: Option<&str>) {
        let mut payload = json!({
            "type": err.frame_type(),
            "message": err.to_string(),
        });
        if let Some(id) = transfer_id {
            payload["transferId"] = json!(id);
        }
        self.reply(&payload).await;
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<ServerState>,
    addr: SocketAddr,
    identity: ClientIdentity,
    user_agent: String,
) {
    let ip = addr.ip();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    let epoch = state.conn_serial.fetch_add(1, Ordering::Relaxed) + 1;
    let last_activity = Arc::new(AtomicU64::new(unix_secs()));

    let device = state.devices.upsert_on_connect(&identity, &user_agent, epoch);
    state.store.mark_dirty();
    info!(device_id = %device.id, %addr, "device connected");

    // A stale room binding (room expired while the device was offline)
    // would violate the membership invariant; drop it now.
    if let Some(ref room_id) = device.room_id {
        let member = state
            .rooms
            .get(room_id)
            .map(|r| r.members.iter().any(|m| m == &device.id))
            .unwrap_or(false);
        if !member {
            state.devices.set_room(&device.id, None);
        }
    }

    let handle = ConnectionHandle {
        tx: tx.clone(),
        epoch,
        addr: ip,
        connected_at: Instant::now(),
        last_activity: last_activity.clone(),
        mobile_safari: identity.mobile_safari,
    };

    // Newer connection wins: tell the old channel it is being replaced,
    // close it after a short grace, and tell the new one it is
    // authoritative. Presence stays single-entry because both channels
    // share the device id.
    if let Some(old) = state.connections.insert(device.id.clone(), handle) {
        info!(device_id = %device.id, "duplicate connection, newer channel takes over");
        let old_tx = old.tx.clone();
        let notice = json!({
            "type": "duplicate_connection",
            "keepThisConnection": false,
            "message": RelayError::DuplicateConnection.to_string(),
        });
        tokio::spawn(async move {
            let _ = old_tx.send(Message::Text(notice.to_string())).await;
            tokio::time::sleep(Duration::from_millis(DUPLICATE_CLOSE_GRACE_MS)).await;
            let _ = old_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: RelayError::DuplicateConnection.to_string().into(),
                })))
                .await;
        });
        let _ = tx
            .send(Message::Text(
                json!({
                    "type": "duplicate_connection",
                    "keepThisConnection": true,
                })
                .to_string(),
            ))
            .await;
    }

    // Forward outbound frames and run the heartbeat from one task so the
    // channel write side has a single owner.
    let hb_period = if identity.mobile_safari {
        HEARTBEAT_PERIOD_IOS_SECS
    } else {
        HEARTBEAT_PERIOD_SECS
    };
    let hb_activity = last_activity.clone();
    let forward_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(hb_period));
        ticker.tick().await; // skip first immediate tick
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => {
                            let closing = matches!(msg, Message::Close(_));
                            if ws_sender.send(msg).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    let idle = unix_secs()
                        .saturating_sub(hb_activity.load(Ordering::Relaxed));
                    if idle >= HEARTBEAT_IDLE_SECS {
                        let ping = json!({ "type": "ping", "timestamp": now_millis() });
                        if ws_sender.send(Message::Text(ping.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    let ctx = ConnCtx {
        device_id: device.id.clone(),
        tx: tx.clone(),
        mobile_safari: identity.mobile_safari,
    };

    // Mobile Safari gets its welcome immediately; everyone else after a
    // short debounce so a fast `client_identify` can fold into it.
    if !identity.mobile_safari {
        tokio::time::sleep(Duration::from_millis(WELCOME_DEBOUNCE_MS)).await;
    }
    send_welcome(&state, &ctx).await;

    // A reconnect into an existing room flips the device back to online in
    // everyone's list.
    if let Some(room_id) = state.devices.get(&device.id).and_then(|d| d.room_id) {
        state.broadcast_device_list(&room_id).await;
    }

    // Main receive loop
    while let Some(Ok(message)) = ws_receiver.next().await {
        last_activity.store(unix_secs(), Ordering::Relaxed);
        match message {
            Message::Text(text) => match ClientFrame::parse(&text) {
                Ok(frame) => {
                    if let Err(e) = handle_frame(&state, &ctx, frame).await {
                        error!(device_id = %ctx.device_id, error = %e, "frame handler failed");
                        ctx.reply(&json!({
                            "type": "error",
                            "message": "InternalError",
                        }))
                        .await;
                    }
                }
                Err(FrameError::UnknownType(t)) => {
                    debug!(device_id = %ctx.device_id, frame_type = %t, "unknown frame type");
                    ctx.reply_error(RelayError::UnknownMessageType, None).await;
                }
                Err(FrameError::Malformed(e)) => {
                    debug!(device_id = %ctx.device_id, error = %e, "malformed frame");
                    ctx.reply_error(RelayError::MalformedFrame, None).await;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => { /* activity already refreshed */ }
            Message::Binary(_) => { /* protocol is text-only */ }
        }
    }

    teardown(&state, &device.id, epoch).await;
    state.release_connection(ip);
    forward_task.abort();
    info!(device_id = %device.id, %addr, "device disconnected");
}

/// Close bookkeeping: only the connection that still owns the device
/// binding marks it offline and fans out presence; a superseded channel
/// leaves the rebound device alone.
async fn teardown(state: &Arc<ServerState>, device_id: &str, epoch: u64) {
    let owned = state
        .connections
        .remove_if(device_id, |_, h| h.epoch == epoch)
        .is_some();
    if !owned {
        return;
    }

    if state.devices.mark_offline(device_id, Some(epoch)) {
        state.store.mark_dirty();
    }

    // Transfers this device was part of cannot finish; tell the peers.
    for notice in state.transfers.fail_for_device(device_id) {
        state
            .send_to(
                &notice.notify_device_id,
                &json!({
                    "type": "transferError",
                    "transferId": notice.transfer_id,
                    "message": notice.error.to_string(),
                }),
            )
            .await;
    }

    if let Some(room_id) = state.devices.get(device_id).and_then(|d| d.room_id) {
        let payload = json!({
            "type": "deviceLeft",
            "roomId": room_id,
            "deviceId": device_id,
            "deviceCount": state.rooms.member_count(&room_id),
        });
        state.broadcast_to_room(&room_id, &payload, Some(device_id)).await;
        state.broadcast_device_list(&room_id).await;
    }
}

async fn send_welcome(state: &Arc<ServerState>, ctx: &ConnCtx) {
    let Some(device) = state.devices.get(&ctx.device_id) else {
        return;
    };
    let chunk_size = if ctx.mobile_safari {
        MOBILE_CHUNK_SIZE
    } else {
        DEFAULT_CHUNK_SIZE
    };
    ctx.reply(&json!({
        "type": "welcome",
        "deviceId": device.id,
        "deviceName": device.display_name(),
        "roomId": device.room_id,
        "capabilities": {
            "chunkSize": chunk_size,
            "maxFileSize": MAX_FILE_SIZE,
            "maxConcurrentTransfers": MAX_CONCURRENT_TRANSFERS,
        },
    }))
    .await;
}

// ---------------------------------------------------------------------------
// Frame dispatch
// ---------------------------------------------------------------------------

async fn handle_frame(
    state: &Arc<ServerState>,
    ctx: &ConnCtx,
    frame: ClientFrame,
) -> anyhow::Result<()> {
    match frame {
        ClientFrame::ClientIdentify { user_agent, language, .. } => {
            handle_client_identify(state, ctx, user_agent, language).await
        }
        ClientFrame::DeviceInfo {
            name,
            custom_name,
            device_type,
            connection_strength,
        } => {
            let updated = state.devices.apply_info(
                &ctx.device_id,
                name.as_deref(),
                custom_name.as_deref(),
                device_type,
                connection_strength,
            );
            if let Some(device) = updated {
                state.store.mark_dirty();
                if let Some(room_id) = device.room_id {
                    state.broadcast_device_list(&room_id).await;
                }
            }
            Ok(())
        }
        ClientFrame::UpdateDeviceName { name } => {
            if let Some(device) = state.devices.rename(&ctx.device_id, name.trim()) {
                state.store.mark_dirty();
                ctx.reply(&json!({
                    "type": "deviceNameUpdated",
                    "deviceId": device.id,
                    "name": device.display_name(),
                    "hasCustomName": true,
                }))
                .await;
                if let Some(room_id) = device.room_id {
                    state.broadcast_device_list(&room_id).await;
                }
            }
            Ok(())
        }
        ClientFrame::CreateRoom { name } => handle_create_room(state, ctx, &name).await,
        ClientFrame::JoinRoom { room_id, name } => {
            handle_join_room(state, ctx, room_id.as_deref(), name.as_deref()).await
        }
        ClientFrame::LeaveRoom {} => {
            if let Some(out) = leave_current_room(state, &ctx.device_id).await {
                ctx.reply(&json!({ "type": "roomLeft", "roomId": out.room_id })).await;
            }
            Ok(())
        }
        ClientFrame::FileTransfer {
            transfer_id,
            target_device_id,
            files,
        } => handle_file_transfer(state, ctx, transfer_id, &target_device_id, files).await,
        ClientFrame::TransferAccepted { transfer_id } => {
            match state.transfers.accept(&transfer_id) {
                Some(sender) => {
                    state
                        .send_to(&sender, &json!({
                            "type": "transferAccepted",
                            "transferId": transfer_id,
                        }))
                        .await;
                }
                None => debug!(%transfer_id, "accept for unknown transfer dropped"),
            }
            Ok(())
        }
        ClientFrame::TransferRejected { transfer_id, reason } => {
            if let Some(sender) = state.transfers.reject(&transfer_id) {
                state
                    .send_to(&sender, &json!({
                        "type": "transferRejected",
                        "transferId": transfer_id,
                        "reason": reason,
                    }))
                    .await;
            }
            Ok(())
        }
        ClientFrame::FileChunk {
            transfer_id,
            chunk_index,
            total_chunks,
            chunk_data,
            file_size,
        } => {
            let outcome = state.transfers.ingest_chunk(
                &transfer_id,
                &ctx.device_id,
                chunk_index,
                total_chunks,
                &chunk_data,
                file_size,
            );
            handle_ingest_outcome(state, &transfer_id, outcome).await;
            Ok(())
        }
        ClientFrame::FileComplete { transfer_id } => {
            state.transfers.complete_signal(&transfer_id);
            Ok(())
        }
        ClientFrame::FileProgress {
            transfer_id,
            progress,
            received_chunks,
            total_chunks,
        } => {
            if let Some(sender) = state.transfers.sender_of(&transfer_id) {
                state
                    .send_to(&sender, &json!({
                        "type": "transferProgress",
                        "transferId": transfer_id,
                        "progress": progress,
                        "receivedChunks": received_chunks,
                        "totalChunks": total_chunks,
                    }))
                    .await;
            }
            Ok(())
        }
        ClientFrame::RequestMissingChunks {
            transfer_id,
            missing_chunks,
            ..
        } => {
            if let Some((receiver, total, chunks)) =
                state.transfers.missing_chunks(&transfer_id, &missing_chunks)
            {
                for (index, data) in chunks {
                    state
                        .send_to(&receiver, &json!({
                            "type": "fileChunk",
                            "transferId": transfer_id,
                            "chunkIndex": index,
                            "totalChunks": total,
                            "chunkData": data,
                        }))
                        .await;
                }
            }
            Ok(())
        }
        ClientFrame::RequestFileDownload { transfer_id } => {
            match state.transfers.download(&transfer_id) {
                Some((file_name, file_mime, data)) => {
                    ctx.reply(&json!({
                        "type": "sendFileData",
                        "transferId": transfer_id,
                        "fileName": file_name,
                        "fileType": file_mime,
                        "fileData": data,
                    }))
                    .await;
                }
                None => {
                    ctx.reply(&json!({
                        "type": "downloadError",
                        "transferId": transfer_id,
                        "message": RelayError::AssemblyFailed.to_string(),
                    }))
                    .await;
                }
            }
            Ok(())
        }
        ClientFrame::TogglePinDevice { target_device_id } => {
            if state
                .devices
                .toggle_pin(&target_device_id, &ctx.device_id)
                .is_some()
            {
                state.store.mark_dirty();
                if let Some(room_id) =
                    state.devices.get(&ctx.device_id).and_then(|d| d.room_id)
                {
                    state.broadcast_device_list(&room_id).await;
                }
            }
            Ok(())
        }
        ClientFrame::FileCancel { transfer_id, .. } => {
            state.transfers.cancel(&transfer_id);
            Ok(())
        }
        ClientFrame::Ping { timestamp } => {
            ctx.reply(&json!({ "type": "pong", "timestamp": timestamp })).await;
            Ok(())
        }
        // Heartbeat reply; the receive loop already refreshed activity.
        ClientFrame::Pong { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

async fn handle_client_identify(
    state: &Arc<ServerState>,
    ctx: &ConnCtx,
    user_agent: Option<String>,
    language: Option<String>,
) -> anyhow::Result<()> {
    if let Some(ua) = user_agent {
        let fresh = identity::derive(&ua, None, language.as_deref().unwrap_or(""));
        state.devices.correct_client_facts(&ctx.device_id, &fresh, &ua);
        state.store.mark_dirty();
    }
    send_welcome(state, ctx).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

async fn handle_create_room(
    state: &Arc<ServerState>,
    ctx: &ConnCtx,
    name: &str,
) -> anyhow::Result<()> {
    let room = match state.rooms.create(name, &ctx.device_id) {
        Ok(room) => room,
        Err(e) => {
            ctx.reply_error(e, None).await;
            return Ok(());
        }
    };
    // Creating a room implies leaving the previous one.
    leave_current_room(state, &ctx.device_id).await;
    state.devices.set_room(&ctx.device_id, Some(room.id.clone()));
    state.store.mark_dirty();
    info!(device_id = %ctx.device_id, room = %room.name, "room created");

    ctx.reply(&json!({
        "type": "roomCreated",
        "roomId": room.id,
        "roomName": room.name,
        "deviceCount": room.members.len(),
    }))
    .await;
    state.broadcast_device_list(&room.id).await;
    Ok(())
}

async fn handle_join_room(
    state: &Arc<ServerState>,
    ctx: &ConnCtx,
    room_id: Option<&str>,
    name: Option<&str>,
) -> anyhow::Result<()> {
    let previous = state.devices.get(&ctx.device_id).and_then(|d| d.room_id);

    let room = match state.rooms.join(room_id, name, &ctx.device_id) {
        Ok(room) => room,
        Err(e) => {
            ctx.reply_error(e, None).await;
            return Ok(());
        }
    };
    // Moving rooms leaves the old one; re-joining the current room is a
    // no-op for membership.
    if previous.as_deref() != Some(room.id.as_str()) {
        leave_current_room(state, &ctx.device_id).await;
    }
    state.devices.set_room(&ctx.device_id, Some(room.id.clone()));
    state.store.mark_dirty();
    info!(device_id = %ctx.device_id, room = %room.name, members = room.members.len(), "room joined");

    // Per-channel ordering: the join ack precedes the first deviceList
    // that includes the new member.
    ctx.reply(&json!({
        "type": "roomJoined",
        "roomId": room.id,
        "roomName": room.name,
        "deviceCount": room.members.len(),
    }))
    .await;

    if let Some(device) = state.devices.get(&ctx.device_id) {
        let joined = json!({
            "type": "deviceJoined",
            "roomId": room.id,
            "device": device_projection(&device),
            "deviceCount": room.members.len(),
        });
        state.broadcast_to_room(&room.id, &joined, Some(&ctx.device_id)).await;
    }
    state.broadcast_device_list(&room.id).await;
    Ok(())
}

fn device_projection(d: &Device) -> Value {
    json!({
        "id": d.id,
        "name": d.display_name(),
        "originalName": d.name,
        "type": d.kind.as_str(),
        "platform": d.platform,
        "browser": d.browser,
        "pinned": d.pinned,
        "online": d.online,
        "lastSeen": d.last_seen,
        "connectionStrength": d.connection_strength.as_str(),
        "hasCustomName": d.custom_name.is_some(),
    })
}

/// Leave whatever room the device is in, with full fan-out to the room it
/// left. Returns the outcome when a membership actually changed.
pub async fn leave_current_room(
    state: &Arc<ServerState>,
    device_id: &str,
) -> Option<crate::rooms::LeaveOutcome> {
    let room_id = state.devices.get(device_id)?.room_id?;
    let out = state.rooms.leave(&room_id, device_id)?;
    state.devices.set_room(device_id, None);
    state.store.mark_dirty();

    if !out.deleted {
        let payload = json!({
            "type": "deviceLeft",
            "roomId": out.room_id,
            "deviceId": device_id,
            "deviceCount": out.remaining.len(),
        });
        for member in &out.remaining {
            state.send_to(member, &payload).await;
        }
        state.broadcast_device_list(&out.room_id).await;
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

async fn handle_file_transfer(
    state: &Arc<ServerState>,
    ctx: &ConnCtx,
    transfer_id: Option<String>,
    target_device_id: &str,
    files: Vec<beamdrop_shared::FileMeta>,
) -> anyhow::Result<()> {
    let proposed_id = transfer_id.clone();
    let proposed = proposed_id.as_deref();

    let Some(sender) = state.devices.get(&ctx.device_id) else {
        return Ok(());
    };
    let Some(target) = state.devices.get(target_device_id) else {
        ctx.reply_error(RelayError::TargetNotFound, proposed).await;
        return Ok(());
    };
    if sender.room_id.is_none() || sender.room_id != target.room_id {
        ctx.reply_error(RelayError::CrossRoomTransfer, proposed).await;
        return Ok(());
    }
    if !target.online || !state.connections.contains_key(target_device_id) {
        ctx.reply_error(RelayError::TargetOffline, proposed).await;
        return Ok(());
    }

    let offer = match state
        .transfers
        .offer(&ctx.device_id, target_device_id, transfer_id, files)
    {
        Ok(offer) => offer,
        Err(e) => {
            ctx.reply_error(e, proposed).await;
            return Ok(());
        }
    };
    info!(
        transfer_id = %offer.transfer_id,
        from = %offer.from_device_id,
        to = %offer.target_device_id,
        size = offer.total_size,
        "transfer offered"
    );

    state
        .send_to(target_device_id, &json!({
            "type": "incomingFile",
            "transferId": offer.transfer_id,
            "fromDeviceId": offer.from_device_id,
            "fromName": sender.display_name(),
            "files": offer.files,
            "totalSize": offer.total_size,
            "timestamp": offer.timestamp,
        }))
        .await;

    ctx.reply(&json!({
        "type": "transferStarted",
        "transferId": offer.transfer_id,
        "targetDeviceId": offer.target_device_id,
    }))
    .await;
    Ok(())
}

/// Fan out whatever one chunk produced: progress, completion, violations,
/// and any governor evictions it triggered.
async fn handle_ingest_outcome(state: &Arc<ServerState>, transfer_id: &str, outcome: IngestOutcome) {
    match outcome.result {
        ChunkIngest::Unknown | ChunkIngest::IgnoredIndex => {}
        ChunkIngest::Violation { sender } => {
            state
                .send_to(&sender, &json!({
                    "type": "transferError",
                    "transferId": transfer_id,
                    "message": RelayError::AssemblyFailed.to_string(),
                }))
                .await;
        }
        ChunkIngest::Progress {
            sender,
            received,
            total,
            percent,
        } => {
            state
                .send_to(&sender, &json!({
                    "type": "uploadProgress",
                    "transferId": transfer_id,
                    "receivedChunks": received,
                    "totalChunks": total,
                    "percent": percent,
                }))
                .await;
        }
        ChunkIngest::Complete {
            sender,
            receiver,
            file_name,
            file_mime,
            total_chunks,
            data_base64,
        } => {
            info!(transfer_id, from = %sender, to = %receiver, "transfer complete");
            state
                .send_to(&sender, &json!({
                    "type": "uploadProgress",
                    "transferId": transfer_id,
                    "receivedChunks": total_chunks,
                    "totalChunks": total_chunks,
                    "percent": 100,
                }))
                .await;
            state
                .send_to(&receiver, &json!({
                    "type": "fileComplete",
                    "transferId": transfer_id,
                    "fileName": file_name,
                    "fileType": file_mime,
                    "fileData": data_base64,
                }))
                .await;
            state
                .send_to(&sender, &json!({
                    "type": "transferComplete",
                    "transferId": transfer_id,
                }))
                .await;
        }
    }

    for evicted in outcome.evicted {
        state
            .send_to(&evicted.notify_device_id, &json!({
                "type": "transferError",
                "transferId": evicted.transfer_id,
                "message": evicted.error.to_string(),
            }))
            .await;
    }
    if outcome.emergency {
        let closed = state
            .close_idle_channels(EMERGENCY_IDLE_SECS, RelayError::Inactivity)
            .await;
        warn!(closed, "memory governor over limit, shed idle channels");
    }
}
