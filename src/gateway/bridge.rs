//! 连接线程与调度器之间的桥
//!
//! 连接线程是阻塞的 OS 线程；所有编排逻辑跑在唯一的调度器线程（current_thread tokio runtime）上，
//! 由一个消费者严格串行地处理工作队列。提交方拿到一个只能兑现一次的结果占位，阻塞等待（带超时）。
//! 提交失败（队列满 / 调度器未运行）时占位立即以错误兑现，提交方不会永远阻塞。

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, warn};

use crate::core::GatewayError;
use crate::gateway::message::{Response, SystemCommand};

/// 结果占位的写端；resolve 消耗自身，因此只能兑现一次
#[derive(Debug)]
pub struct ResultSlot {
    tx: std_mpsc::SyncSender<Response>,
}

impl ResultSlot {
    pub fn resolve(self, response: Response) {
        // 等待方已超时离开时发送失败，结果丢弃即可
        if self.tx.send(response).is_err() {
            warn!("Result resolved after the requester stopped waiting");
        }
    }

    pub fn fail(self, e: &GatewayError) {
        self.resolve(Response::from_gateway_error(e));
    }
}

/// 结果占位的读端
#[derive(Debug)]
pub struct ResultWaiter {
    rx: std_mpsc::Receiver<Response>,
}

impl ResultWaiter {
    /// 阻塞等待；超时或写端被丢弃都返回错误响应
    pub fn wait(self, timeout: Duration) -> Response {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => r,
            Err(std_mpsc::RecvTimeoutError::Timeout) => Response::from_gateway_error(&GatewayError::Bridge(format!(
                "no result within {}s",
                timeout.as_secs()
            ))),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Response::from_gateway_error(&GatewayError::Bridge(
                "request dropped by scheduler".to_string(),
            )),
        }
    }
}

pub fn placeholder() -> (ResultSlot, ResultWaiter) {
    let (tx, rx) = std_mpsc::sync_channel(1);
    (ResultSlot { tx }, ResultWaiter { rx })
}

/// 一次聊天请求及其结果占位
#[derive(Debug)]
pub struct PendingRequest {
    pub conversation_id: String,
    pub message: String,
    pub username: String,
    pub slot: ResultSlot,
}

/// 队列中的工作单元
#[derive(Debug)]
pub enum WorkItem {
    Chat(PendingRequest),
    System { command: SystemCommand, slot: ResultSlot },
}

impl WorkItem {
    pub fn into_slot(self) -> ResultSlot {
        match self {
            WorkItem::Chat(p) => p.slot,
            WorkItem::System { slot, .. } => slot,
        }
    }
}

/// 提交端（可跨线程克隆）
#[derive(Debug, Clone)]
pub struct Bridge {
    tx: mpsc::Sender<WorkItem>,
}

impl Bridge {
    /// 创建桥与调度器端的接收队列
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// 非阻塞提交；失败时该项的占位立即以错误兑现
    pub fn submit(&self, item: WorkItem) -> Result<(), GatewayError> {
        let (item, e) = match self.tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(item)) => (item, GatewayError::Bridge("scheduler queue is full".to_string())),
            Err(TrySendError::Closed(item)) => (item, GatewayError::Bridge("scheduler is not running".to_string())),
        };
        error!(error = %e, "Failed to submit work item");
        item.into_slot().fail(&e);
        Err(e)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
