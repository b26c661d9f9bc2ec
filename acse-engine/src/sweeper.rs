//! Background Sweep Runner
//!
//! 后台清扫任务，负责：
//! - 补完已集齐证明但未落盘结果的验证请求，并使超期请求过期
//! - 恢复过期的转账占用标记，并使超期结算过期（已注资的退还托管资金）
//! - 清理空闲的实体锁

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::consensus::ConsensusEngine;
use crate::registry::AttestorRegistry;
use crate::settlement::SettlementEngine;

/// 后台清扫器
pub struct SweepRunner {
    consensus: Arc<ConsensusEngine>,
    settlements: SettlementEngine,
    registry: Arc<AttestorRegistry>,
    interval: Duration,
}

impl SweepRunner {
    pub fn new(
        consensus: Arc<ConsensusEngine>,
        settlements: SettlementEngine,
        registry: Arc<AttestorRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            consensus,
            settlements,
            registry,
            interval,
        }
    }

    /// 启动清扫循环
    pub fn start(self) -> SweepHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let running = Arc::new(RwLock::new(true));
        let running_clone = running.clone();

        tokio::spawn(async move {
            let mut timer = interval(self.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs(), "Sweep runner started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Sweep runner received shutdown signal");
                        break;
                    }
                    _ = timer.tick() => {
                        if *running_clone.read().await {
                            self.sweep_once().await;
                        }
                    }
                }
            }

            info!("Sweep runner stopped");
        });

        SweepHandle {
            shutdown_tx,
            running,
        }
    }

    /// 执行一轮全部清扫。失败只记录日志，下一个周期重试。
    pub async fn sweep_once(&self) {
        if let Err(e) = self.consensus.sweep_expired().await {
            error!(error = %e, "Error sweeping verification requests");
        }
        if let Err(e) = self.settlements.sweep_expired().await {
            error!(error = %e, "Error sweeping settlements");
        }
        let pruned =
            self.consensus.prune_locks() + self.settlements.prune_locks() + self.registry.prune_locks();
        debug!(count = pruned, "Idle locks pruned");
    }
}

/// 运行中清扫循环的句柄
pub struct SweepHandle {
    shutdown_tx: mpsc::Sender<()>,
    running: Arc<RwLock<bool>>,
}

impl SweepHandle {
    /// 停止循环
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// 暂停，直到恢复前跳过所有周期
    pub async fn pause(&self) {
        *self.running.write().await = false;
    }

    pub async fn resume(&self) {
        *self.running.write().await = true;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
