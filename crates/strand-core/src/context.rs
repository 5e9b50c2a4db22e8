use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, AppConfig, ContainerConfig};
use crate::error::{Result, StrandError};
use crate::traits::*;
use crate::types::InvokeFrom;

/// External collaborators available to node strategies.
#[derive(Clone, Default)]
pub struct Services {
    pub llm: Option<Arc<dyn LlmClient>>,
    pub tools: Option<Arc<dyn ToolInvoker>>,
    pub code: Option<Arc<dyn CodeExecutor>>,
    pub http: Option<Arc<dyn HttpRequester>>,
    pub retriever: Option<Arc<dyn KnowledgeRetriever>>,
    pub guard: Option<Arc<dyn InputGuard>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_code(mut self, code: Arc<dyn CodeExecutor>) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpRequester>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_guard(mut self, guard: Arc<dyn InputGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn llm(&self) -> Result<&Arc<dyn LlmClient>> {
        self.llm
            .as_ref()
            .ok_or_else(|| StrandError::NotConfigured("llm client".into()))
    }

    pub fn tools(&self) -> Result<&Arc<dyn ToolInvoker>> {
        self.tools
            .as_ref()
            .ok_or_else(|| StrandError::NotConfigured("tool invoker".into()))
    }

    pub fn code(&self) -> Result<&Arc<dyn CodeExecutor>> {
        self.code
            .as_ref()
            .ok_or_else(|| StrandError::NotConfigured("code executor".into()))
    }

    pub fn http(&self) -> Result<&Arc<dyn HttpRequester>> {
        self.http
            .as_ref()
            .ok_or_else(|| StrandError::NotConfigured("http requester".into()))
    }

    pub fn retriever(&self) -> Result<&Arc<dyn KnowledgeRetriever>> {
        self.retriever
            .as_ref()
            .ok_or_else(|| StrandError::NotConfigured("knowledge retriever".into()))
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("llm", &self.llm.is_some())
            .field("tools", &self.tools.is_some())
            .field("code", &self.code.is_some())
            .field("http", &self.http.is_some())
            .field("retriever", &self.retriever.is_some())
            .field("guard", &self.guard.is_some())
            .finish()
    }
}

/// Explicit per-run context threaded through every strategy call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tenant_id: String,
    pub app_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub invoke_from: InvokeFrom,
    /// Nesting depth; 0 for the top-level run, +1 per container level.
    pub call_depth: usize,
    pub max_call_depth: usize,
    pub containers: ContainerConfig,
    pub agent: AgentConfig,
    pub services: Services,
    /// Cancelled when the run is stopped. Strategies check it between chunks.
    pub cancel: CancellationToken,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::from_config(&AppConfig::default(), Services::default())
    }
}

impl ExecutionContext {
    pub fn from_config(config: &AppConfig, services: Services) -> Self {
        Self {
            tenant_id: String::new(),
            app_id: String::new(),
            workflow_id: String::new(),
            user_id: String::new(),
            invoke_from: InvokeFrom::default(),
            call_depth: 0,
            max_call_depth: config.engine.max_call_depth,
            containers: config.containers.clone(),
            agent: config.agent.clone(),
            services,
            cancel: CancellationToken::new(),
        }
    }

    /// Context for a nested container run. Shares cancellation with the parent.
    pub fn nested(&self) -> Result<Self> {
        if self.call_depth + 1 > self.max_call_depth {
            return Err(StrandError::InvalidGraph(format!(
                "max call depth {} exceeded",
                self.max_call_depth
            )));
        }
        let mut child = self.clone();
        child.call_depth += 1;
        child.cancel = self.cancel.child_token();
        Ok(child)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
