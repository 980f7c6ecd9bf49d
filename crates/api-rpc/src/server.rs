//! JSON-RPC Server
//!
//! Serves the job API as JSON-RPC 2.0 over HTTP on localhost.

use crate::handler::RpcHandler;
use crate::types::{AddJobRequest, FindJobsRequest, JobIdRequest, RemoveJobRequest};
use eventjobs_core::application::JobManager;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::RpcModule;
use std::sync::Arc;
use tracing::info;

const DEFAULT_RPC_HOST: &str = "127.0.0.1";
pub const DEFAULT_RPC_PORT: u16 = 9527;

/// RPC Server Configuration
pub struct RpcServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RPC_HOST.to_string(),
            port: DEFAULT_RPC_PORT,
        }
    }
}

/// RPC Server
pub struct RpcServer {
    config: RpcServerConfig,
    handler: Arc<RpcHandler>,
}

/// Register a method whose params deserialize into `$req`
macro_rules! register {
    ($module:expr, $handler:expr, $name:literal, $req:ty, $method:ident) => {{
        let handler = $handler.clone();
        $module
            .register_async_method($name, move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: $req = params.parse()?;
                    handler.$method(req).await
                }
            })
            .map_err(|e| e.to_string())?;
    }};
    ($module:expr, $handler:expr, $name:literal, $method:ident) => {{
        let handler = $handler.clone();
        $module
            .register_async_method($name, move |_, _, _| {
                let handler = handler.clone();
                async move { handler.$method().await }
            })
            .map_err(|e| e.to_string())?;
    }};
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, manager: Arc<JobManager>) -> Self {
        Self {
            config,
            handler: Arc::new(RpcHandler::new(manager)),
        }
    }

    /// Methods served by this server
    pub fn module(&self) -> Result<RpcModule<()>, String> {
        let mut module = RpcModule::new(());

        register!(module, self.handler, "jobs.add.v1", AddJobRequest, add_job);
        register!(module, self.handler, "jobs.get.v1", JobIdRequest, get_job);
        register!(module, self.handler, "jobs.find.v1", FindJobsRequest, find_jobs);
        register!(module, self.handler, "jobs.remove.v1", RemoveJobRequest, remove_job);
        register!(module, self.handler, "jobs.stop.v1", JobIdRequest, stop_job);
        register!(module, self.handler, "jobs.retry.v1", JobIdRequest, retry_job);

        // Admin APIs
        register!(module, self.handler, "admin.stats.v1", stats);
        register!(module, self.handler, "admin.queues.v1", queues);
        register!(module, self.handler, "admin.topology.v1", topology);

        Ok(module)
    }

    /// Start the JSON-RPC server
    ///
    /// Security: binds to the configured host only (localhost by default)
    pub async fn start(self) -> Result<ServerHandle, String> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!(
            host = %self.config.host,
            port = %self.config.port,
            "Starting JSON-RPC server"
        );

        let server = Server::builder()
            .build(&addr)
            .await
            .map_err(|e| format!("Failed to build server on {}: {}", addr, e))?;

        let module = self.module()?;
        info!(methods = module.method_names().count(), "JSON-RPC server started successfully");
        Ok(server.start(module))
    }
}
