//! Hub：TCP 接入层
//!
//! 每个连接一个阻塞 OS 线程：按行读取请求 → 解析 → 经桥提交给调度器 → 带超时阻塞等待 → 写回一行响应。
//! 连接线程从不读取会话状态；解析错误返回结构化错误且不关闭连接。

use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerSection;
use crate::gateway::bridge::{placeholder, Bridge, PendingRequest, WorkItem};
use crate::gateway::message::{parse_request, Request, RequestError, Response};
use crate::gateway::runtime::ServerStats;

/// 空闲检测与停机检查的轮询粒度
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 监听地址
    pub bind_addr: String,
    /// 最大并发连接数
    pub max_connections: usize,
    /// 连接空闲超时
    pub idle_timeout: Duration,
    /// 等待调度器结果的超时
    pub result_timeout: Duration,
}

impl HubConfig {
    pub fn from_config(server: &ServerSection) -> Self {
        Self {
            bind_addr: server.bind_addr(),
            max_connections: server.max_connections,
            idle_timeout: Duration::from_secs(server.idle_timeout_secs),
            result_timeout: Duration::from_secs(server.result_timeout_secs),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_config(&ServerSection::default())
    }
}

/// 连接结束原因（写入日志）
#[derive(Debug)]
enum Disconnect {
    ClientClosed,
    Idle,
    Shutdown,
    Io(io::Error),
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disconnect::ClientClosed => write!(f, "client closed"),
            Disconnect::Idle => write!(f, "idle timeout"),
            Disconnect::Shutdown => write!(f, "server shutdown"),
            Disconnect::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

/// 连接计数守卫：线程退出时归还名额
struct ClientGuard(Arc<ServerStats>);

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.client_disconnected();
    }
}

pub struct Hub {
    config: HubConfig,
    listener: TcpListener,
    bridge: Bridge,
    stats: Arc<ServerStats>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn bind(
        config: HubConfig,
        bridge: Bridge,
        stats: Arc<ServerStats>,
        shutdown: CancellationToken,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)?;
        // 非阻塞 accept，以便轮询停机信号
        listener.set_nonblocking(true)?;
        Ok(Self {
            config,
            listener,
            bridge,
            stats,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 阻塞运行 accept 循环，直到停机信号
    pub fn serve(self) {
        match self.local_addr() {
            Ok(addr) => info!("Gateway listening on tcp://{}", addr),
            Err(e) => warn!(error = %e, "Gateway listening on unknown address"),
        }

        while !self.shutdown.is_cancelled() {
            match self.listener.accept() {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(POLL_INTERVAL / 4),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "Accept error");
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
        info!("Gateway accept loop stopped");
    }

    /// 在独立线程上运行 serve
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("emcee-accept".to_string())
            .spawn(move || self.serve())
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let active = self.stats.client_connected();
        let guard = ClientGuard(Arc::clone(&self.stats));

        if active > self.config.max_connections {
            warn!(peer = %addr, active, "Connection rejected: too many clients");
            let mut stream = stream;
            let response = Response::error("Server is at capacity, try again later", "too_many_connections");
            let _ = writeln!(stream, "{}", response.to_line());
            return;
        }

        let client_id = format!("tcp_{}_{}", addr, uuid::Uuid::new_v4().simple());
        info!(client_id = %client_id, active, "Client connected");
        let bridge = self.bridge.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("emcee-conn-{}", addr))
            .spawn(move || {
                let _guard = guard;
                let reason = handle_connection(stream, &bridge, &config, &shutdown);
                match &reason {
                    Disconnect::Io(_) => warn!(client_id = %client_id, reason = %reason, "Client disconnected"),
                    _ => info!(client_id = %client_id, reason = %reason, "Client disconnected"),
                }
            });
        if let Err(e) = spawned {
            error!(peer = %addr, error = %e, "Failed to spawn connection thread");
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    bridge: &Bridge,
    config: &HubConfig,
    shutdown: &CancellationToken,
) -> Disconnect {
    // 监听套接字是非阻塞的，部分平台上会被 accept 出的套接字继承
    if let Err(e) = stream.set_nonblocking(false) {
        return Disconnect::Io(e);
    }
    if let Err(e) = stream.set_read_timeout(Some(POLL_INTERVAL.min(config.idle_timeout))) {
        return Disconnect::Io(e);
    }
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => return Disconnect::Io(e),
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut last_activity = Instant::now();

    loop {
        if shutdown.is_cancelled() {
            return Disconnect::Shutdown;
        }
        let before = buf.len();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return Disconnect::ClientClosed,
            Ok(_) => {
                // EOF 之前没有换行的最后一段也按一行处理
                if let Some(response) = process_line(&buf, bridge, config.result_timeout) {
                    let mut line = response.to_line();
                    line.push('\n');
                    if let Err(e) = writer.write_all(line.as_bytes()).and_then(|_| writer.flush()) {
                        return Disconnect::Io(e);
                    }
                }
                buf.clear();
                last_activity = Instant::now();
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                // 已读到的半行留在 buf 中，下一轮继续拼接；读到新字节也算活动
                if buf.len() > before {
                    last_activity = Instant::now();
                }
                if last_activity.elapsed() >= config.idle_timeout {
                    return Disconnect::Idle;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Disconnect::Io(e),
        }
    }
}

/// 处理一行原始请求；空行不回应
fn process_line(raw: &[u8], bridge: &Bridge, result_timeout: Duration) -> Option<Response> {
    let line = match std::str::from_utf8(raw) {
        Ok(s) => s.trim(),
        Err(_) => {
            warn!("Rejected request with invalid character encoding");
            return Some(Response::from_request_error(&RequestError::InvalidEncoding));
        }
    };
    if line.is_empty() {
        return None;
    }

    let request = match parse_request(line) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Rejected malformed request");
            return Some(Response::from_request_error(&e));
        }
    };

    let (slot, waiter) = placeholder();
    let (kind, item) = match request {
        Request::Chat(chat) => {
            info!(conversation_id = %chat.conversation_id, "Received chat request");
            (
                "chat",
                WorkItem::Chat(PendingRequest {
                    conversation_id: chat.conversation_id,
                    message: chat.message,
                    username: chat.username,
                    slot,
                }),
            )
        }
        Request::System(command) => {
            info!(command = ?command, "Received system command");
            ("system", WorkItem::System { command, slot })
        }
    };

    // 提交失败时占位已以错误兑现，wait 立即返回
    if bridge.submit(item).is_err() {
        debug!(kind, "Submission failed, returning error response");
    }
    let response = waiter.wait(result_timeout);
    info!(
        kind,
        status = if response.is_success() { "success" } else { "error" },
        code = response.code.as_deref().unwrap_or(""),
        "Request completed"
    );
    Some(response)
}
