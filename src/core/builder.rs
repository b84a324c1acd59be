//! ResearchService 构建器：按配置装配 LLM、检索、存储与各阶段 Agent
//!
//! CLI 与测试共用同一套装配逻辑；任何一个组件都可以替换为注入的实现。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::{Planner, PlannerSettings, Searcher, Writer};
use crate::config::AppConfig;
use crate::core::lifecycle::ResearchService;
use crate::core::orchestrator::Orchestrator;
use crate::core::recovery::RecoveryEngine;
use crate::core::state::PhaseSnapshot;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::search::{create_search_from_config, SearchProvider};
use crate::store::{create_session_store, SessionStore};

pub struct ResearchServiceBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    search: Option<Arc<dyn SearchProvider>>,
    store: Option<Arc<dyn SessionStore>>,
    event_tx: Option<mpsc::UnboundedSender<PhaseSnapshot>>,
    shutdown: Option<CancellationToken>,
}

impl ResearchServiceBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            search: None,
            store: None,
            event_tx: None,
            shutdown: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 每次阶段转换后的快照推送到该通道
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PhaseSnapshot>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// 构建 Orchestrator（未注入的组件按配置创建）
    pub fn build_orchestrator(
        &self,
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn SearchProvider>,
        store: Arc<dyn SessionStore>,
    ) -> Orchestrator {
        let research = &self.config.research;
        let per_source = self.config.search.max_chars_per_source;

        let planner = Planner::new(
            llm.clone(),
            search.clone(),
            PlannerSettings::from_config(research, per_source),
        );
        let searcher = Searcher::new(
            search,
            research.queries_per_section,
            research.max_evidence_chars,
            per_source,
        );
        let orchestrator = Orchestrator::new(
            planner,
            searcher,
            Writer::new(llm),
            store,
            RecoveryEngine::new(research.max_write_retries),
            research.queries_per_section,
        );
        match &self.event_tx {
            Some(tx) => orchestrator.with_events(tx.clone()),
            None => orchestrator,
        }
    }

    pub async fn build(self) -> ResearchService {
        let llm = match &self.llm {
            Some(llm) => llm.clone(),
            None => create_llm_from_config(&self.config),
        };
        let search = match &self.search {
            Some(search) => search.clone(),
            None => create_search_from_config(&self.config.search),
        };
        let store = match &self.store {
            Some(store) => store.clone(),
            None => create_session_store(&self.config.store).await,
        };

        let orchestrator = self.build_orchestrator(llm, search, store.clone());
        let service = ResearchService::new(store, orchestrator, &self.config);
        match self.shutdown {
            Some(token) => service.with_shutdown(token),
            None => service,
        }
    }
}
