//! 仪器连接管理器
//!
//! 每台仪器一条长连接通道, 支持三种方式:
//! - Listen: 本端作TCP服务端, 等待仪器拨入 (可同时多个对端)
//! - Connect: 本端作TCP客户端, 主动连接仪器
//! - Serial: 串口
//!
//! 所有通道事件通过单一mpsc队列汇出, 由上层服务统一消费;
//! 通道之间互不影响, 单通道故障不会波及其他仪器。
//! 连接断开后不做自动重连, 由人工通过连接开关恢复。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use lis_core::{ConnectionConfig, ConnectionStatus, LisError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::MllpCodec;
use crate::message::Hl7Message;
use crate::parser::Hl7Parser;

/// 连接通道事件
#[derive(Debug, Clone)]
pub enum AnalyzerEvent {
    /// 收到一帧完整报文
    FrameReceived { analyzer_id: Uuid, frame: String },
    /// 通道状态变化
    StatusChanged {
        analyzer_id: Uuid,
        status: ConnectionStatus,
        detail: String,
    },
    /// 通道级错误
    Error {
        analyzer_id: Uuid,
        operation: String,
        message: String,
    },
}

type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<Hl7Message>>>>;
type SharedOutbound = Arc<RwLock<Option<mpsc::UnboundedSender<String>>>>;

/// 单条通道的运行时句柄
struct ChannelHandle {
    status: Arc<RwLock<ConnectionStatus>>,
    tasks: Vec<JoinHandle<()>>,
    peer_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    outbound: SharedOutbound,
    pending_acks: PendingAcks,
    local_addr: Option<SocketAddr>,
}

/// 仪器连接管理器
pub struct ConnectionManager {
    channels: Arc<RwLock<HashMap<Uuid, ChannelHandle>>>,
    events: mpsc::UnboundedSender<AnalyzerEvent>,
}

impl ConnectionManager {
    /// 创建管理器, 返回事件接收端供上层消费
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AnalyzerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                channels: Arc::new(RwLock::new(HashMap::new())),
                events: tx,
            },
            rx,
        )
    }

    /// 打开仪器通道并启动读循环
    pub async fn start(&self, analyzer_id: Uuid, config: &ConnectionConfig) -> Result<()> {
        if self.channels.read().await.contains_key(&analyzer_id) {
            return Err(LisError::Connection(format!(
                "channel already active for analyzer {}",
                analyzer_id
            )));
        }

        let handle = match config {
            ConnectionConfig::Listen { bind, port } => {
                self.start_listener(analyzer_id, bind, *port).await?
            }
            ConnectionConfig::Connect { host, port } => {
                self.start_client(analyzer_id, host, *port).await?
            }
            ConnectionConfig::Serial { path, baud_rate } => {
                self.start_serial(analyzer_id, path, *baud_rate).await?
            }
        };

        self.channels.write().await.insert(analyzer_id, handle);
        Ok(())
    }

    /// 关闭仪器通道
    ///
    /// 读循环被终止, 缓冲中未收全的半帧直接丢弃; 已匹配入库的结果不回滚。
    pub async fn stop(&self, analyzer_id: Uuid) -> Result<()> {
        let handle = self
            .channels
            .write()
            .await
            .remove(&analyzer_id)
            .ok_or_else(|| {
                LisError::NotFound(format!("no active channel for analyzer {}", analyzer_id))
            })?;

        for task in &handle.tasks {
            task.abort();
        }
        for task in handle.peer_tasks.lock().await.iter() {
            task.abort();
        }

        info!("channel stopped for analyzer {}", analyzer_id);
        self.emit_status(analyzer_id, ConnectionStatus::Disconnected, "channel stopped");
        Ok(())
    }

    /// 关闭全部通道 (进程退出时调用)
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.channels.read().await.keys().copied().collect();
        for id in ids {
            let _ = self.stop(id).await;
        }
    }

    /// 查询通道状态
    pub async fn status(&self, analyzer_id: Uuid) -> ConnectionStatus {
        match self.channels.read().await.get(&analyzer_id) {
            Some(handle) => *handle.status.read().await,
            None => ConnectionStatus::Disconnected,
        }
    }

    /// Listen模式下实际绑定的本地地址
    pub async fn local_addr(&self, analyzer_id: Uuid) -> Option<SocketAddr> {
        self.channels
            .read()
            .await
            .get(&analyzer_id)
            .and_then(|h| h.local_addr)
    }

    /// 发送一帧报文并等待ACK
    ///
    /// 按消息控制ID关联应答; 超时未见ACK视为发送失败。
    pub async fn send_frame(
        &self,
        analyzer_id: Uuid,
        message: String,
        timeout: Duration,
    ) -> Result<Hl7Message> {
        let (outbound, pending) = {
            let channels = self.channels.read().await;
            let handle = channels.get(&analyzer_id).ok_or_else(|| {
                LisError::NotFound(format!("no active channel for analyzer {}", analyzer_id))
            })?;
            (handle.outbound.clone(), handle.pending_acks.clone())
        };

        let sender = outbound.read().await.clone().ok_or_else(|| {
            LisError::Connection(format!(
                "analyzer {} has no writable connection",
                analyzer_id
            ))
        })?;

        let parser = Hl7Parser::new();
        let control_id = parser.parse(&message)?.message_control_id;
        if control_id.is_empty() {
            return Err(LisError::Protocol(
                "outgoing message has no control id (MSH-10)".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(control_id.clone(), tx);

        if sender.send(message).is_err() {
            pending.lock().await.remove(&control_id);
            return Err(LisError::Connection("connection is closed".to_string()));
        }
        debug!("sent message {} to analyzer {}", control_id, analyzer_id);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => {
                pending.lock().await.remove(&control_id);
                Err(LisError::Connection(
                    "connection closed before ACK arrived".to_string(),
                ))
            }
            Err(_) => {
                pending.lock().await.remove(&control_id);
                Err(LisError::Connection(format!(
                    "no ACK for message {} within {:?}",
                    control_id, timeout
                )))
            }
        }
    }

    // ---------- 通道启动 ----------

    async fn start_listener(
        &self,
        analyzer_id: Uuid,
        bind: &str,
        port: u16,
    ) -> Result<ChannelHandle> {
        let listener = TcpListener::bind((bind, port)).await.map_err(|e| {
            LisError::Connection(format!("failed to bind {}:{}: {}", bind, port, e))
        })?;
        let local_addr = listener.local_addr().ok();

        let status = Arc::new(RwLock::new(ConnectionStatus::Listening));
        let outbound: SharedOutbound = Arc::new(RwLock::new(None));
        let pending_acks: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let peer_tasks = Arc::new(Mutex::new(Vec::new()));
        let active_peers = Arc::new(AtomicUsize::new(0));

        info!(
            "analyzer {} listening on {}",
            analyzer_id,
            local_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| format!("{}:{}", bind, port))
        );
        self.emit_status(
            analyzer_id,
            ConnectionStatus::Listening,
            &format!("listening on {}:{}", bind, port),
        );

        let events = self.events.clone();
        let status_accept = status.clone();
        let outbound_accept = outbound.clone();
        let pending_accept = pending_acks.clone();
        let peer_tasks_accept = peer_tasks.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!("analyzer {} peer connected from {}", analyzer_id, peer);
                        *status_accept.write().await = ConnectionStatus::Connected;
                        let _ = events.send(AnalyzerEvent::StatusChanged {
                            analyzer_id,
                            status: ConnectionStatus::Connected,
                            detail: format!("peer connected: {}", peer),
                        });

                        let (tx, rx) = mpsc::unbounded_channel();
                        *outbound_accept.write().await = Some(tx);
                        active_peers.fetch_add(1, Ordering::SeqCst);

                        let events_peer = events.clone();
                        let status_peer = status_accept.clone();
                        let pending_peer = pending_accept.clone();
                        let active_peer = active_peers.clone();
                        let task = tokio::spawn(async move {
                            run_channel(analyzer_id, stream, events_peer.clone(), rx, pending_peer, true)
                                .await;
                            // 最后一个对端断开后退回监听状态
                            if active_peer.fetch_sub(1, Ordering::SeqCst) == 1 {
                                *status_peer.write().await = ConnectionStatus::Listening;
                                let _ = events_peer.send(AnalyzerEvent::StatusChanged {
                                    analyzer_id,
                                    status: ConnectionStatus::Listening,
                                    detail: "peer disconnected".to_string(),
                                });
                            }
                        });
                        peer_tasks_accept.lock().await.push(task);
                    }
                    Err(e) => {
                        error!("analyzer {} accept failed: {}", analyzer_id, e);
                        let _ = events.send(AnalyzerEvent::Error {
                            analyzer_id,
                            operation: "accept".to_string(),
                            message: e.to_string(),
                        });
                        *status_accept.write().await = ConnectionStatus::Error;
                        break;
                    }
                }
            }
        });

        Ok(ChannelHandle {
            status,
            tasks: vec![accept_task],
            peer_tasks,
            outbound,
            pending_acks,
            local_addr,
        })
    }

    async fn start_client(
        &self,
        analyzer_id: Uuid,
        host: &str,
        port: u16,
    ) -> Result<ChannelHandle> {
        let stream = tokio::time::timeout(
            Duration::from_secs(5),
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| LisError::Connection(format!("connect to {}:{} timed out", host, port)))?
        .map_err(|e| LisError::Connection(format!("connect to {}:{} failed: {}", host, port, e)))?;

        info!("analyzer {} connected to {}:{}", analyzer_id, host, port);
        self.emit_status(
            analyzer_id,
            ConnectionStatus::Connected,
            &format!("connected to {}:{}", host, port),
        );

        Ok(self.spawn_stream_channel(analyzer_id, stream, false))
    }

    async fn start_serial(
        &self,
        analyzer_id: Uuid,
        path: &str,
        baud_rate: u32,
    ) -> Result<ChannelHandle> {
        let port = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|e| {
                LisError::Connection(format!("failed to open serial port {}: {}", path, e))
            })?;

        info!(
            "analyzer {} serial port {} opened at {} baud",
            analyzer_id, path, baud_rate
        );
        self.emit_status(
            analyzer_id,
            ConnectionStatus::Connected,
            &format!("serial port {} open", path),
        );

        // 串口仪器通常也要求逐帧ACK
        Ok(self.spawn_stream_channel(analyzer_id, port, true))
    }

    /// 为Connect/Serial通道启动读写任务
    fn spawn_stream_channel<T>(&self, analyzer_id: Uuid, io: T, reply_ack: bool) -> ChannelHandle
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let status = Arc::new(RwLock::new(ConnectionStatus::Connected));
        let pending_acks: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound: SharedOutbound = Arc::new(RwLock::new(Some(tx)));

        let events = self.events.clone();
        let status_task = status.clone();
        let pending_task = pending_acks.clone();
        let task = tokio::spawn(async move {
            run_channel(analyzer_id, io, events.clone(), rx, pending_task, reply_ack).await;
            let mut status = status_task.write().await;
            if *status != ConnectionStatus::Error {
                *status = ConnectionStatus::Disconnected;
            }
            let _ = events.send(AnalyzerEvent::StatusChanged {
                analyzer_id,
                status: *status,
                detail: "connection closed".to_string(),
            });
        });

        ChannelHandle {
            status,
            tasks: vec![task],
            peer_tasks: Arc::new(Mutex::new(Vec::new())),
            outbound,
            pending_acks,
            local_addr: None,
        }
    }

    fn emit_status(&self, analyzer_id: Uuid, status: ConnectionStatus, detail: &str) {
        let _ = self.events.send(AnalyzerEvent::StatusChanged {
            analyzer_id,
            status,
            detail: detail.to_string(),
        });
    }
}

/// 单连接读写循环
///
/// 入站帧逐帧上报; ACK按MSA-2(回落MSH-10)与挂起请求关联;
/// 出站帧由mpsc队列供给, 写失败即终止循环。
async fn run_channel<T>(
    analyzer_id: Uuid,
    io: T,
    events: mpsc::UnboundedSender<AnalyzerEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    pending_acks: PendingAcks,
    reply_ack: bool,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let parser = Hl7Parser::new();
    let mut framed = Framed::new(io, MllpCodec);

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if let Err(e) = framed.send(text).await {
                            error!("analyzer {} write failed: {}", analyzer_id, e);
                            let _ = events.send(AnalyzerEvent::Error {
                                analyzer_id,
                                operation: "send".to_string(),
                                message: e.to_string(),
                            });
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(frame)) => {
                        let parsed = parser.parse(&frame);

                        // ACK帧只用于关联挂起请求, 不进入结果流水线
                        if let Ok(message) = &parsed {
                            if message.message_type == "ACK" {
                                let key = message
                                    .segment("MSA")
                                    .and_then(|s| s.field(2))
                                    .unwrap_or(&message.message_control_id)
                                    .to_string();
                                match pending_acks.lock().await.remove(&key) {
                                    Some(tx) => {
                                        let _ = tx.send(message.clone());
                                    }
                                    None => {
                                        debug!(
                                            "analyzer {} unsolicited ACK for {}",
                                            analyzer_id, key
                                        );
                                    }
                                }
                                continue;
                            }
                        }

                        let _ = events.send(AnalyzerEvent::FrameReceived {
                            analyzer_id,
                            frame: frame.clone(),
                        });

                        if reply_ack {
                            let ack = match &parsed {
                                Ok(message) => parser.build_ack(message, "AA", None),
                                Err(e) => {
                                    warn!("analyzer {} sending NAK: {}", analyzer_id, e);
                                    format!(
                                        "MSH|^~\\&|||||{}||ACK||P|2.5\rMSA|AR||{}\r",
                                        Utc::now().format("%Y%m%d%H%M%S"),
                                        e
                                    )
                                }
                            };
                            if let Err(e) = framed.send(ack).await {
                                warn!("analyzer {} failed to send ACK: {}", analyzer_id, e);
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("analyzer {} read failed: {}", analyzer_id, e);
                        let _ = events.send(AnalyzerEvent::Error {
                            analyzer_id,
                            operation: "read".to_string(),
                            message: e.to_string(),
                        });
                        break;
                    }
                    None => {
                        debug!("analyzer {} peer closed connection", analyzer_id);
                        break;
                    }
                }
            }
        }
    }
}
