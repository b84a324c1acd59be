//! 研究流水线集成测试（Mock LLM + Mock 检索，无需网络）

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use deep_research::config::AppConfig;
    use deep_research::core::{
        Checkpoint, Phase, PhaseResult, PhaseSnapshot, ResearchState, Section, SessionStatus,
        StatePatch,
    };
    use deep_research::llm::{LlmClient, Message, MockLlmClient, ScriptedLlmClient};
    use deep_research::report::render_markdown;
    use deep_research::search::{MockSearchProvider, SearchProvider};
    use deep_research::store::{FileSessionStore, MemorySessionStore, SessionStore};
    use deep_research::{ResearchError, ResearchRequest, ResearchService, ResearchServiceBuilder};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn is_draft_prompt(messages: &[Message]) -> bool {
        messages.iter().any(|m| m.content.contains("\"SectionDraft\""))
    }

    fn is_plan_prompt(messages: &[Message]) -> bool {
        messages
            .iter()
            .any(|m| m.content.contains("\"SectionPlan\"") || m.content.contains("\"QueryPlan\""))
    }

    async fn service(
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn SearchProvider>,
        store: Arc<dyn SessionStore>,
        events: Option<mpsc::UnboundedSender<PhaseSnapshot>>,
    ) -> ResearchService {
        let builder = ResearchServiceBuilder::new(AppConfig::default())
            .with_llm(llm)
            .with_search(search)
            .with_store(store);
        match events {
            Some(tx) => builder.with_events(tx).build().await,
            None => builder.build().await,
        }
    }

    async fn run(
        svc: &ResearchService,
        request: ResearchRequest,
    ) -> deep_research::core::Session {
        let handle = svc.submit(request).await.unwrap();
        let id = handle.session_id.clone();
        handle.wait().await;
        svc.store().get_session(&id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_linear_algebra_two_sections_completes() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let svc = service(
            Arc::new(MockLlmClient),
            Arc::new(MockSearchProvider::canned()),
            store,
            None,
        )
        .await;

        let session = run(&svc, ResearchRequest::new("Linear Algebra", 2, "student-1")).await;
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.current_phase, Phase::Completed);
        assert!(session.error.is_none());
        assert_eq!(session.state.completed_count(), 2);

        let planned: Vec<&str> = session
            .state
            .planned_sections
            .iter()
            .map(|s| s.title.as_str())
            .collect();
        let completed: Vec<&str> = session
            .state
            .completed_sections
            .iter()
            .map(|s| s.title.as_str())
            .collect();
        assert_eq!(planned, completed);

        for section in &session.state.completed_sections {
            assert_eq!(section.subsection_titles.len(), 6);
            let content = section.content.as_ref().unwrap();
            assert_eq!(content.subsections.len(), 6);
            assert!(content.overview.contains("\\frac{1}{2}"));
        }

        for key in ["planning", "researching#1", "writing#1", "researching#2", "writing#2", "completed"] {
            assert!(session.phase_results.contains_key(key), "missing audit key {key}");
        }
    }

    #[tokio::test]
    async fn test_snapshots_never_exceed_target() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let svc = service(
            Arc::new(MockLlmClient),
            Arc::new(MockSearchProvider::canned()),
            store,
            Some(tx),
        )
        .await;

        let session = run(&svc, ResearchRequest::new("Probability", 3, "u1")).await;
        assert_eq!(session.status, SessionStatus::Completed);
        drop(svc);

        let mut last = 0;
        let mut count = 0;
        while let Ok(snapshot) = rx.try_recv() {
            let done = snapshot.state.completed_count();
            assert!(done >= last, "completed count went backwards");
            assert!(done <= snapshot.state.target_section_count);
            assert_eq!(snapshot.session_id, session.id);
            last = done;
            count += 1;
        }
        assert_eq!(last, 3);
        assert!(count >= 7);
    }

    #[tokio::test]
    async fn test_all_searches_failing_ends_in_error() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let svc = service(
            Arc::new(MockLlmClient),
            Arc::new(MockSearchProvider::failing("provider offline")),
            store,
            None,
        )
        .await;

        let session = run(&svc, ResearchRequest::new("Topology", 2, "u1")).await;
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.error.unwrap().contains("Search exhausted"));
        assert_eq!(session.state.completed_count(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_drafts_exhaust_write_retries() {
        let drafts = Arc::new(AtomicUsize::new(0));
        let counter = drafts.clone();
        let llm = ScriptedLlmClient::new(move |_, messages| {
            if is_draft_prompt(messages) {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("I'm sorry, here is the section in prose instead of JSON.".to_string())
            } else {
                MockLlmClient.respond(messages)
            }
        });
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let svc = service(
            Arc::new(llm),
            Arc::new(MockSearchProvider::canned()),
            store,
            None,
        )
        .await;

        let session = run(&svc, ResearchRequest::new("Graph Theory", 1, "u1")).await;
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.error.unwrap().contains("Write failed"));
        // 首次撰写 + 2 次重试，每次 2 个尝试
        assert_eq!(drafts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_resume_with_active_section_never_replans() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let request = ResearchRequest::new("Linear Algebra", 2, "u1");
        let session = store.create_session(&request).await.unwrap();

        let titles = |i: usize| (1..=3).map(|j| format!("Part {i}.{j}")).collect::<Vec<_>>();
        let sections = vec![
            Section::new("Vectors", "Vector spaces", titles(1)),
            Section::new("Matrices", "Linear maps", titles(2)),
        ];
        let state = ResearchState::new("Linear Algebra", 2)
            .apply(StatePatch::Planned {
                sections: sections.clone(),
                queries: Vec::new(),
            })
            .unwrap()
            .apply(StatePatch::Activated {
                section: sections[0].clone(),
                queries: vec!["vector spaces basics".to_string()],
            })
            .unwrap();
        store
            .apply_phase_result(
                &session.id,
                PhaseResult::new(Phase::Planning, 0, "seeded plan"),
                &Checkpoint {
                    phase: Phase::Researching,
                    state,
                },
            )
            .await
            .unwrap();

        let plan_calls = Arc::new(AtomicUsize::new(0));
        let counter = plan_calls.clone();
        let llm = ScriptedLlmClient::new(move |_, messages| {
            if is_plan_prompt(messages) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            MockLlmClient.respond(messages)
        });
        let search = Arc::new(MockSearchProvider::canned());
        let svc = service(Arc::new(llm), search.clone(), store.clone(), None).await;

        let handle = svc.resume(&session.id).await.unwrap();
        handle.wait().await;

        let done = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(plan_calls.load(Ordering::SeqCst), 0);
        assert_eq!(search.queries()[0], "vector spaces basics");
        assert_eq!(done.state.completed_sections[0].title, "Vectors");
        assert_eq!(done.state.completed_sections[1].title, "Matrices");
        assert_eq!(done.phase_results["planning"].summary, "seeded plan");
    }

    #[tokio::test]
    async fn test_resume_with_consumed_queries_goes_straight_to_writer() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let session = store
            .create_session(&ResearchRequest::new("Linear Algebra", 1, "u1"))
            .await
            .unwrap();

        let section = Section::new(
            "Eigenvalues",
            "Spectral theory",
            vec!["Characteristic polynomial".to_string(), "Diagonalization".to_string()],
        );
        let state = ResearchState::new("Linear Algebra", 1)
            .apply(StatePatch::Planned {
                sections: vec![section.clone()],
                queries: Vec::new(),
            })
            .unwrap()
            .apply(StatePatch::Activated {
                section,
                queries: vec!["eigenvalues".to_string()],
            })
            .unwrap()
            .apply(StatePatch::Researched {
                evidence: "Evidence gathered before the restart".to_string(),
            })
            .unwrap();
        assert_eq!(state.resume_phase(), Phase::Writing);
        store
            .apply_phase_result(
                &session.id,
                PhaseResult::new(Phase::Researching, 1, "seeded evidence"),
                &Checkpoint {
                    phase: Phase::Writing,
                    state,
                },
            )
            .await
            .unwrap();

        let plan_calls = Arc::new(AtomicUsize::new(0));
        let saw_evidence = Arc::new(AtomicUsize::new(0));
        let (plans, evidence) = (plan_calls.clone(), saw_evidence.clone());
        let llm = ScriptedLlmClient::new(move |_, messages| {
            if is_plan_prompt(messages) {
                plans.fetch_add(1, Ordering::SeqCst);
            }
            if is_draft_prompt(messages)
                && messages
                    .iter()
                    .any(|m| m.content.contains("Evidence gathered before the restart"))
            {
                evidence.fetch_add(1, Ordering::SeqCst);
            }
            MockLlmClient.respond(messages)
        });
        let search = Arc::new(MockSearchProvider::canned());
        let svc = service(Arc::new(llm), search.clone(), store.clone(), None).await;

        svc.resume(&session.id).await.unwrap().wait().await;

        let done = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(search.call_count(), 0);
        assert_eq!(plan_calls.load(Ordering::SeqCst), 0);
        assert_eq!(saw_evidence.load(Ordering::SeqCst), 1);
        assert_eq!(done.phase_results["researching#1"].summary, "seeded evidence");
        assert!(done.phase_results.contains_key("writing#1"));
        assert!(!done.phase_results.contains_key("planning"));
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_requests() {
        let store = Arc::new(MemorySessionStore::new());
        let svc = service(
            Arc::new(MockLlmClient),
            Arc::new(MockSearchProvider::canned()),
            store.clone(),
            None,
        )
        .await;

        for request in [
            ResearchRequest::new("", 2, "u1"),
            ResearchRequest::new("Topology", 0, "u1"),
            ResearchRequest::new("Topology", 99, "u1"),
            ResearchRequest::new("Topology", 2, " "),
        ] {
            let err = svc.submit(request).await.unwrap_err();
            assert!(matches!(err, ResearchError::Validation(_)));
        }
        assert!(store.list_sessions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_session_resumes_from_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions");

        let first: Arc<dyn SessionStore> = Arc::new(FileSessionStore::open(&path).await.unwrap());
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let svc = ResearchServiceBuilder::new(AppConfig::default())
            .with_llm(Arc::new(MockLlmClient))
            .with_search(Arc::new(MockSearchProvider::canned()))
            .with_store(first)
            .with_shutdown(shutdown)
            .build()
            .await;
        let interrupted = run(&svc, ResearchRequest::new("Calculus", 1, "u1")).await;
        assert_eq!(interrupted.status, SessionStatus::Running);

        // 模拟进程重启：重新打开同一目录
        let reopened: Arc<dyn SessionStore> = Arc::new(FileSessionStore::open(&path).await.unwrap());
        let svc = service(
            Arc::new(MockLlmClient),
            Arc::new(MockSearchProvider::canned()),
            reopened.clone(),
            None,
        )
        .await;
        let handles = svc.resume_incomplete().await.unwrap();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.wait().await;
        }

        let session = reopened.get_session(&interrupted.id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        let markdown = render_markdown(&session.state);
        assert!(markdown.contains("# Calculus"));
        assert!(markdown.contains("\\frac{a}{b}"));
    }
}
