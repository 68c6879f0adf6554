use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use scheduler_api::{create_app, ApiState};
use scheduler_core::{
    config::AppConfig,
    traits::{MessageBroker, RegistryClient, TaskStore, TimeProvider, WorkerStore},
    SystemTimeProvider,
};
use scheduler_dispatcher::{DispatcherService, RecoveryService, TaskScheduler, WorkerRegistry};
use scheduler_infrastructure::{create_broker, DatabaseManager};
use scheduler_worker::{HandlerRegistry, WorkerService};
use tokio::{net::TcpListener, sync::broadcast, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行Dispatcher
    Dispatcher,
    /// 仅运行Worker
    Worker,
    /// 仅运行API服务器
    Api,
    /// 运行所有组件
    All,
}

impl AppMode {
    fn runs_dispatcher(self, config: &AppConfig) -> bool {
        match self {
            AppMode::Dispatcher => true,
            AppMode::All => config.dispatcher.enabled,
            _ => false,
        }
    }

    fn runs_worker(self, config: &AppConfig) -> bool {
        match self {
            AppMode::Worker => true,
            AppMode::All => config.worker.enabled,
            _ => false,
        }
    }

    fn runs_api(self, config: &AppConfig) -> bool {
        match self {
            AppMode::Api => true,
            AppMode::All => config.api.enabled,
            _ => false,
        }
    }
}

/// 组件共享的存储、消息队列和时钟
pub struct Components {
    pub task_store: Arc<dyn TaskStore>,
    pub worker_store: Arc<dyn WorkerStore>,
    pub broker: Arc<dyn MessageBroker>,
    pub clock: Arc<dyn TimeProvider>,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    database: Option<DatabaseManager>,
    task_store: Arc<dyn TaskStore>,
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn TimeProvider>,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<TaskScheduler>,
    worker_handlers: Mutex<Option<HandlerRegistry>>,
}

impl Application {
    /// 按配置连接数据库和消息队列并创建应用实例
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        info!("连接数据库: {}", mask_credentials(&config.database.url));
        let database = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        database.migrate().await.context("运行数据库迁移失败")?;

        info!("连接消息队列: {}", mask_credentials(&config.broker.url));
        let broker = create_broker(&config.broker)
            .await
            .context("连接消息队列失败")?;

        let components = Components {
            task_store: database.task_store(),
            worker_store: database.worker_store(),
            broker,
            clock: Arc::new(SystemTimeProvider),
        };

        let mut app = Self::with_components(config, mode, components);
        app.database = Some(database);
        Ok(app)
    }

    /// 使用外部提供的组件创建应用实例
    pub fn with_components(config: AppConfig, mode: AppMode, components: Components) -> Self {
        let Components {
            task_store,
            worker_store,
            broker,
            clock,
        } = components;

        let registry = Arc::new(WorkerRegistry::new(
            worker_store,
            clock.clone(),
            config.registry.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            task_store.clone(),
            broker.clone(),
            registry.clone(),
            config.broker.clone(),
            config.dispatcher.clone(),
            clock.clone(),
        ));

        Self {
            config,
            mode,
            database: None,
            task_store,
            broker,
            clock,
            registry,
            scheduler,
            worker_handlers: Mutex::new(None),
        }
    }

    /// 替换Worker的任务处理器，未设置时按配置的执行服务地址创建
    pub fn with_worker_handlers(self, handlers: HandlerRegistry) -> Self {
        Self {
            worker_handlers: Mutex::new(Some(handlers)),
            ..self
        }
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn task_store(&self) -> Arc<dyn TaskStore> {
        self.task_store.clone()
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        self.registry.clone()
    }

    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        self.scheduler.clone()
    }

    /// 运行应用程序直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        let running = self.start().await?;

        let _ = shutdown_rx.recv().await;
        info!("应用程序收到关闭信号");

        running.stop().await;
        if let Some(database) = &self.database {
            database.close().await;
        }

        info!("所有组件已停止");
        Ok(())
    }

    /// 按运行模式启动各组件
    ///
    /// 任意组件启动失败时，已启动的组件会被停止后再返回错误。
    pub async fn start(&self) -> Result<RunningComponents> {
        let mut running = RunningComponents {
            api: None,
            dispatcher: None,
            worker: None,
            broker: self.broker.clone(),
        };

        if let Err(e) = self.start_components(&mut running).await {
            running.stop().await;
            return Err(e);
        }

        Ok(running)
    }

    async fn start_components(&self, running: &mut RunningComponents) -> Result<()> {
        if self.mode.runs_worker(&self.config) {
            running.worker = Some(self.start_worker().await?);
        }

        if self.mode.runs_dispatcher(&self.config) {
            running.dispatcher = Some(self.start_dispatcher().await?);
        }

        if self.mode.runs_api(&self.config) {
            running.api = Some(self.start_api().await?);
        }

        Ok(())
    }

    async fn start_dispatcher(&self) -> Result<DispatcherService> {
        info!("启动Dispatcher服务");

        let recovery = Arc::new(RecoveryService::new(
            self.task_store.clone(),
            self.registry.clone(),
            self.scheduler.clone(),
            self.config.dispatcher.clone(),
            self.clock.clone(),
        ));
        let dispatcher = DispatcherService::new(
            self.scheduler.clone(),
            recovery,
            self.registry.clone(),
            self.config.dispatcher.clone(),
        );
        dispatcher.start().await.context("启动Dispatcher失败")?;
        Ok(dispatcher)
    }

    async fn start_worker(&self) -> Result<WorkerService> {
        let registry: Arc<dyn RegistryClient> = self.registry.clone();
        let mut builder = WorkerService::builder(
            self.config.worker.clone(),
            self.config.broker.clone(),
            self.task_store.clone(),
            self.broker.clone(),
            registry,
        )
        .clock(self.clock.clone());
        if let Some(handlers) = self.worker_handlers.lock().await.clone() {
            builder = builder.handlers(handlers);
        }

        let worker = builder.build().context("创建Worker失败")?;
        info!("启动Worker服务: {}", worker.worker_id());
        worker.start().await.context("启动Worker失败")?;
        Ok(worker)
    }

    async fn start_api(&self) -> Result<ApiServer> {
        let state = ApiState {
            scheduler: self.scheduler.clone(),
            registry: self.registry.clone(),
            task_store: self.task_store.clone(),
            clock: self.clock.clone(),
        };
        let app = create_app(state);

        let listener = TcpListener::bind(&self.config.api.bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
        let local_addr = listener.local_addr().context("读取监听地址失败")?;
        info!("API服务器启动在 http://{}", local_addr);

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!("API服务器运行失败: {}", e);
            }
        });

        Ok(ApiServer {
            local_addr,
            token,
            handle,
        })
    }
}

struct ApiServer {
    local_addr: SocketAddr,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 已启动的组件集合
pub struct RunningComponents {
    api: Option<ApiServer>,
    dispatcher: Option<DispatcherService>,
    worker: Option<WorkerService>,
    broker: Arc<dyn MessageBroker>,
}

impl RunningComponents {
    /// API服务器实际监听的地址
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api.as_ref().map(|api| api.local_addr)
    }

    pub fn worker(&self) -> Option<&WorkerService> {
        self.worker.as_ref()
    }

    pub fn dispatcher(&self) -> Option<&DispatcherService> {
        self.dispatcher.as_ref()
    }

    /// 依次停止API、Dispatcher、Worker
    ///
    /// Worker停止时会关闭消息队列连接，必须最后停止。
    pub async fn stop(self) {
        if let Some(api) = self.api {
            api.token.cancel();
            if let Err(e) = api.handle.await {
                warn!("API服务器退出异常: {}", e);
            }
            info!("API服务器已停止");
        }

        if let Some(dispatcher) = self.dispatcher {
            if let Err(e) = dispatcher.stop().await {
                error!("停止Dispatcher失败: {}", e);
            }
        }

        match self.worker {
            Some(worker) => {
                if let Err(e) = worker.stop().await {
                    error!("停止Worker失败: {}", e);
                }
            }
            None => {
                if let Err(e) = self.broker.close().await {
                    warn!("关闭消息队列连接失败: {}", e);
                }
            }
        }
    }
}

/// 屏蔽连接URL中的密码
pub fn mask_credentials(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|pos| pos + 3) else {
        return url.to_string();
    };
    let Some(at_pos) = url[scheme_end..].find('@').map(|pos| pos + scheme_end) else {
        return url.to_string();
    };

    match url[scheme_end..at_pos].find(':') {
        Some(colon) => {
            let mut masked = url.to_string();
            masked.replace_range(scheme_end + colon + 1..at_pos, "***");
            masked
        }
        None => url.to_string(),
    }
}
