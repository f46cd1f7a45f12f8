//! LIS服务器主程序

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use lis_core::Result;
use lis_protocol::ConnectionManager;
use lis_store::{MemoryStore, PgStore};
use lis_web::WebServer;
use lis_workflow::{LabConfig, LabService, LabStores, LoggingNotifier, ResultNotifier, WebhookNotifier};
use tracing::{error, info, warn};

use crate::config::{LisConfig, StorageBackend};

/// LIS服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "lis-server")]
#[command(about = "LIS (Laboratory Information System) 检验仪器接入服务器")]
struct Args {
    /// Web服务端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    info!("启动LIS服务器...");

    let mut config = LisConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("LIS服务器配置:");
    info!("  监听地址: {}:{}", config.server.host, config.server.port);
    info!("  存储后端: {:?}", config.database.backend);
    info!("  差值核查阈值: {}%", config.lab.delta_threshold_percent);

    // 仓储
    let stores = match config.database.backend {
        StorageBackend::Memory => {
            warn!("使用内存存储, 进程退出后数据不保留");
            LabStores::from_memory(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Postgres => {
            let url = config
                .database
                .url
                .as_deref()
                .ok_or_else(|| lis_core::LisError::Config("database.url is required".to_string()))?;
            let store = Arc::new(
                PgStore::connect(url, config.database.max_connections).await?,
            );
            store.create_tables().await?;
            LabStores {
                orders: store.clone(),
                raw_results: store.clone(),
                alerts: store.clone(),
                qc: store.clone(),
                analyzers: store.clone(),
                worklists: store,
            }
        }
    };

    // 通知器
    let notifier: Arc<dyn ResultNotifier> = match &config.notifier.result_ready_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LoggingNotifier),
    };

    // 连接管理器与检验服务
    let (manager, events) = ConnectionManager::new();
    let manager = Arc::new(manager);
    let service = Arc::new(LabService::new(
        stores,
        manager.clone(),
        notifier,
        LabConfig {
            boundary_policy: config.lab.boundary_policy,
            delta_threshold_percent: config.lab.delta_threshold_percent,
        },
    ));

    // 事件泵: 消费所有仪器通道的帧与状态事件
    tokio::spawn(service.clone().run_event_pump(events));

    // 已登记且激活的仪器自动开启通道
    match service.list_analyzers(false).await {
        Ok(analyzers) => {
            for analyzer in analyzers {
                match service.toggle_connection(analyzer.id, true).await {
                    Ok(status) => {
                        info!("仪器 {} 通道已开启: {:?}", analyzer.code, status)
                    }
                    Err(e) => warn!("仪器 {} 通道开启失败: {}", analyzer.code, e),
                }
            }
        }
        Err(e) => warn!("读取仪器列表失败: {}", e),
    }

    // Web服务
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| lis_core::LisError::Config(format!("invalid listen address: {}", e)))?;
    let server = WebServer::new(addr, service.clone());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Web服务器异常退出: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到退出信号, 正在关闭...");
        }
    }

    service.shutdown().await;
    info!("LIS服务器已退出");
    Ok(())
}
