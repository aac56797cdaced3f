//! ViralGen - 弹性网页自动化引擎
//!
//! 模块划分：
//! - **api**: HTTP 接口（feature "server"，axum）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务编排、异常检测、错误恢复、代理池、会话存储
//! - **driver**: 页面驱动抽象与实现（Headless Chrome / HTTP / 脚本化）
//! - **observability**: 日志初始化
//! - **tasks**: 任务规格与三个具体流程（趋势、生成、发布）

#[cfg(feature = "server")]
pub mod api;
pub mod config;
pub mod core;
pub mod driver;
pub mod observability;
pub mod tasks;

pub use crate::core::{AutomationBuilder, TaskError, TaskOrchestrator, TaskResult};
