use crate::{config::Config, services::SessionGate};

/// 应用程序的共享状态
pub struct AppState {
    /// 应用配置
    pub config: Config,

    /// 会话入口，持有当前的书签会话
    pub gate: SessionGate,
}

impl AppState {
    pub fn new(config: Config, gate: SessionGate) -> Self {
        Self { config, gate }
    }
}
