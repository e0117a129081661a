use crate::agents::events::{ReviewEvent, ReviewEventBus};
use crate::agents::executor::AgentTaskExecutor;
use crate::agents::registry::AgentRegistry;
use crate::agents::synthesis::SynthesisStage;
use crate::config::SessionPaths;
use crate::error::ReviewError;
use crate::llm::interfaces::{LLMConfig, LLMInterface, Model};
use crate::llm::providers::ProviderKind;
use crate::llm::tokens::estimate_tokens;
use crate::reports::{OutputSink, ReportFormatter};
use crate::types::{AgentDescriptor, AgentReport, ReportCollection, ReviewRequest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

/// Picks the model a review runs with.
#[cfg_attr(test, mockall::automock)]
pub trait ModelResolver: Send + Sync {
    fn resolve<'a>(&self, selector: Option<&'a str>) -> Result<Model, ReviewError>;
}

/// Explicit selector, then the configured default, then the provider's
/// own default when the provider is usable.
pub struct ConfiguredModelResolver {
    config: LLMConfig,
}

impl ConfiguredModelResolver {
    pub fn new(config: LLMConfig) -> Self {
        Self { config }
    }
}

impl ModelResolver for ConfiguredModelResolver {
    fn resolve<'a>(&self, selector: Option<&'a str>) -> Result<Model, ReviewError> {
        if let Some(selector) = selector.map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(Model::from_selector(selector));
        }
        if let Some(model) = self.config.default_model.as_deref().filter(|s| !s.trim().is_empty()) {
            return Ok(Model::from_selector(model));
        }

        let kind: ProviderKind = self
            .config
            .provider
            .parse()
            .map_err(|e| ReviewError::NoModelAvailable(format!("{}", e)))?;
        kind.resolve_api_key(&self.config)
            .map_err(|e| ReviewError::NoModelAvailable(format!("{}", e)))?;
        Ok(kind.default_model())
    }
}

/// Where agent reports are written before synthesis.
struct ReportArchive {
    dir: PathBuf,
    formatter: Arc<dyn ReportFormatter>,
}

/// Result of a successful review.
#[derive(Debug)]
pub struct ReviewOutcome {
    pub model: Model,
    pub reports: ReportCollection,
    /// The well-known pointer the synthesized conversation was promoted to.
    pub session_path: PathBuf,
    pub saved_reports: Option<PathBuf>,
}

/// Fans a review out to the selected agents, joins their reports in
/// request order, then hands them to synthesis.
pub struct ReviewOrchestrator {
    registry: Arc<AgentRegistry>,
    resolver: Arc<dyn ModelResolver>,
    executor: AgentTaskExecutor,
    synthesis: SynthesisStage,
    events: Arc<ReviewEventBus>,
    archive: Option<ReportArchive>,
    max_diff_tokens: usize,
}

impl ReviewOrchestrator {
    pub fn new(
        llm: Arc<dyn LLMInterface>,
        registry: AgentRegistry,
        resolver: Arc<dyn ModelResolver>,
        paths: SessionPaths,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            resolver,
            executor: AgentTaskExecutor::new(Arc::clone(&llm)),
            synthesis: SynthesisStage::new(llm, paths),
            events: Arc::new(ReviewEventBus::new()),
            archive: None,
            max_diff_tokens: 100_000,
        }
    }

    pub fn with_executor(mut self, executor: AgentTaskExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_synthesis(mut self, synthesis: SynthesisStage) -> Self {
        self.synthesis = synthesis;
        self
    }

    pub fn with_events(mut self, events: Arc<ReviewEventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_max_diff_tokens(mut self, limit: usize) -> Self {
        self.max_diff_tokens = limit;
        self
    }

    /// Write the joined agent reports to `dir` before synthesis starts.
    pub fn save_reports(mut self, dir: impl Into<PathBuf>, formatter: Arc<dyn ReportFormatter>) -> Self {
        self.archive = Some(ReportArchive {
            dir: dir.into(),
            formatter,
        });
        self
    }

    pub fn events(&self) -> Arc<ReviewEventBus> {
        Arc::clone(&self.events)
    }

    /// Main review workflow
    ///
    /// Model and agent selection are validated before any agent starts. Any
    /// agent failure fails the whole review and synthesis never runs.
    #[instrument(skip(self, request, sink), fields(agents = request.selected_agent_ids.len()))]
    pub async fn run_review(
        &self,
        request: &ReviewRequest,
        sink: Arc<dyn OutputSink>,
    ) -> Result<ReviewOutcome, ReviewError> {
        if request.diff_text.trim().is_empty() {
            return Err(ReviewError::EmptyDiff);
        }

        let model = self.resolver.resolve(request.model_selector.as_deref())?;
        let agents = self.registry.resolve_selection(&request.selected_agent_ids)?;

        let diff_tokens = estimate_tokens(&request.diff_text);
        if diff_tokens > self.max_diff_tokens {
            warn!(
                "Diff is roughly {} tokens (limit {}); agents may truncate or fail",
                diff_tokens, self.max_diff_tokens
            );
        }

        let ids: Vec<String> = agents.iter().map(|a| a.id.clone()).collect();
        info!("Starting review with agents [{}] on {}", ids.join(", "), model);
        self.events
            .publish(ReviewEvent::ReviewStarted {
                agents: ids.clone(),
                model: model.to_string(),
            })
            .await;

        let review_start = Instant::now();
        let reports = self.run_agents(&agents, request, &model).await?;
        info!(
            "All {} agents finished in {:.2}s",
            reports.len(),
            review_start.elapsed().as_secs_f64()
        );

        let saved_reports = match &self.archive {
            Some(archive) => Some(self.write_reports(archive, &reports).await?),
            None => None,
        };

        self.events
            .publish(ReviewEvent::SynthesisStarted { reports: reports.len() })
            .await;
        let session_path = self
            .synthesis
            .synthesize(&request.diff_text, &reports, &model, &request.working_dir, sink)
            .await?;
        self.events
            .publish(ReviewEvent::SessionPromoted {
                path: session_path.clone(),
            })
            .await;

        Ok(ReviewOutcome {
            model,
            reports,
            session_path,
            saved_reports,
        })
    }

    /// Run every agent concurrently and join into request order.
    ///
    /// Results land in a slot indexed by request position. The first
    /// failure returns immediately; siblings already running are detached
    /// and their results dropped.
    async fn run_agents(
        &self,
        agents: &[AgentDescriptor],
        request: &ReviewRequest,
        model: &Model,
    ) -> Result<ReportCollection, ReviewError> {
        let request = Arc::new(request.clone());
        let mut join_set = JoinSet::new();

        for (index, descriptor) in agents.iter().cloned().enumerate() {
            let executor = self.executor.clone();
            let request = Arc::clone(&request);
            let model = model.clone();
            let events = Arc::clone(&self.events);

            join_set.spawn(async move {
                events
                    .publish(ReviewEvent::AgentStarted {
                        agent_id: descriptor.id.clone(),
                    })
                    .await;
                let started = Instant::now();
                let result = executor.run(&descriptor, &request, &model).await;
                (index, descriptor.id, started.elapsed(), result)
            });
        }

        let mut slots: Vec<Option<AgentReport>> = (0..agents.len()).map(|_| None).collect();

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, agent_id, elapsed, Ok(report))) => {
                    info!("Agent {} completed in {:.2}s", agent_id, elapsed.as_secs_f64());
                    self.events
                        .publish(ReviewEvent::AgentCompleted {
                            agent_id,
                            elapsed_ms: elapsed.as_millis() as u64,
                            chars: report.text.len(),
                        })
                        .await;
                    slots[index] = Some(report);
                }
                Ok((_, agent_id, _, Err(e))) => {
                    error!("Agent {} failed: {}", agent_id, e);
                    self.events
                        .publish(ReviewEvent::AgentFailed {
                            agent_id,
                            error: e.to_string(),
                        })
                        .await;
                    join_set.detach_all();
                    return Err(e);
                }
                Err(e) => {
                    error!("Agent task join error: {}", e);
                    join_set.detach_all();
                    return Err(ReviewError::TaskAborted(e.to_string()));
                }
            }
        }

        let ids: Vec<String> = agents.iter().map(|a| a.id.clone()).collect();
        ReportCollection::assemble(&ids, slots)
    }

    async fn write_reports(
        &self,
        archive: &ReportArchive,
        reports: &ReportCollection,
    ) -> Result<PathBuf, ReviewError> {
        let path = archive
            .dir
            .join(format!("agent-reports.{}", archive.formatter.extension()));
        let content = archive
            .formatter
            .format(reports)
            .map_err(|e| ReviewError::session(&path, std::io::Error::other(e.to_string())))?;

        tokio::fs::create_dir_all(&archive.dir)
            .await
            .map_err(|e| ReviewError::session(&archive.dir, e))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ReviewError::session(&path, e))?;

        info!("Saved agent reports to {:?}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::prompts::AgentPrompts;
    use crate::llm::session_log::SessionLog;
    use crate::llm::testing::{Script, ScriptedLLM};
    use crate::reports::{MarkdownFormatter, MemorySink};
    use crate::agents::continuation::{ContinuationHandler, ContinueOptions};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    const SYNTH: &str = "SYNTH-OUT";

    fn registry() -> AgentRegistry {
        AgentRegistry::from_descriptors(vec![
            AgentDescriptor::new("bug", "Bug", "", "BUG"),
            AgentDescriptor::new("quality", "Quality", "", "QUALITY"),
            AgentDescriptor::new("tests", "Tests", "", "TESTS"),
        ])
        .unwrap()
    }

    fn fixed_model() -> Arc<dyn ModelResolver> {
        let mut resolver = MockModelResolver::new();
        resolver.expect_resolve().returning(|_| Ok(Model::GPT4o));
        Arc::new(resolver)
    }

    fn orchestrator(llm: Arc<ScriptedLLM>, dir: &TempDir) -> ReviewOrchestrator {
        ReviewOrchestrator::new(llm, registry(), fixed_model(), SessionPaths::under(dir.path()))
    }

    fn scripted(delays: [u64; 3]) -> ScriptedLLM {
        ScriptedLLM::new()
            .script("BUG", Script::fragments(["bug report"]).after(Duration::from_millis(delays[0])))
            .script("QUALITY", Script::fragments(["quality report"]).after(Duration::from_millis(delays[1])))
            .script("TESTS", Script::fragments(["tests report"]).after(Duration::from_millis(delays[2])))
            .script(AgentPrompts::synthesis(), Script::fragments([SYNTH]))
    }

    fn request(dir: &TempDir, agents: &[&str]) -> ReviewRequest {
        ReviewRequest::new("-let a = 1;\n+let a = 2;\n", dir.path()).with_agents(agents.iter().copied())
    }

    #[tokio::test]
    async fn test_collection_order_ignores_completion_order() {
        let permutations = [
            [5, 25, 45],
            [5, 45, 25],
            [25, 5, 45],
            [25, 45, 5],
            [45, 5, 25],
            [45, 25, 5],
        ];

        for delays in permutations {
            let dir = TempDir::new().unwrap();
            let llm = Arc::new(scripted(delays));
            let outcome = orchestrator(llm.clone(), &dir)
                .run_review(&request(&dir, &["tests", "bug", "quality"]), Arc::new(MemorySink::new()))
                .await
                .unwrap();

            assert_eq!(outcome.reports.ids(), vec!["tests", "bug", "quality"], "delays {:?}", delays);
            assert_eq!(outcome.reports.get("bug").unwrap().text, "bug report");
        }
    }

    #[tokio::test]
    async fn test_slow_bug_agent_still_reported_first() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(scripted([60, 5, 5]));
        let outcome = orchestrator(llm.clone(), &dir)
            .run_review(&request(&dir, &["bug", "quality"]), Arc::new(MemorySink::new()))
            .await
            .unwrap();

        assert_eq!(outcome.reports.ids(), vec!["bug", "quality"]);

        let synthesis = llm.calls_for(AgentPrompts::synthesis());
        assert_eq!(synthesis.len(), 1);
        let prompt = synthesis[0].prompt();
        let bug_at = prompt.find("## Report: bug").unwrap();
        let quality_at = prompt.find("## Report: quality").unwrap();
        assert!(bug_at < quality_at);
        assert!(llm.calls_for("TESTS").is_empty());
    }

    #[tokio::test]
    async fn test_synthesis_waits_for_every_agent() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(scripted([30, 10, 50]));
        orchestrator(llm.clone(), &dir)
            .run_review(&request(&dir, &["bug", "quality", "tests"]), Arc::new(MemorySink::new()))
            .await
            .unwrap();

        let synthesis_start = llm.calls_for(AgentPrompts::synthesis())[0].started;
        let last_agent_finish = llm
            .calls()
            .iter()
            .filter(|c| c.system != AgentPrompts::synthesis())
            .map(|c| c.finished)
            .max()
            .unwrap();
        assert!(synthesis_start >= last_agent_finish);
    }

    #[tokio::test]
    async fn test_agents_run_concurrently() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(scripted([80, 80, 80]));
        let started = Instant::now();
        orchestrator(llm.clone(), &dir)
            .run_review(&request(&dir, &["bug", "quality", "tests"]), Arc::new(MemorySink::new()))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(220));
    }

    #[tokio::test]
    async fn test_agent_failure_skips_synthesis_and_promotion() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(
            scripted([40, 5, 5]).script("QUALITY", Script::failing("model overloaded")),
        );
        let paths = SessionPaths::under(dir.path());

        let err = orchestrator(llm.clone(), &dir)
            .run_review(&request(&dir, &["bug", "quality"]), Arc::new(MemorySink::new()))
            .await
            .unwrap_err();

        match err {
            ReviewError::ModelInvocationFailed { source } => {
                assert!(source.to_string().contains("model overloaded"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(llm.calls_for(AgentPrompts::synthesis()).is_empty());
        assert!(!paths.last_session.exists());
    }

    #[tokio::test]
    async fn test_unknown_agent_rejected_before_any_call() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(scripted([0, 0, 0]));

        let err = orchestrator(llm.clone(), &dir)
            .run_review(&request(&dir, &["bug", "style"]), Arc::new(MemorySink::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, ReviewError::UnknownAgent { ref id, .. } if id == "style"));
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_model_aborts_before_fan_out() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(scripted([0, 0, 0]));
        let mut resolver = MockModelResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|_| Err(ReviewError::NoModelAvailable("no API key".to_string())));

        let err = ReviewOrchestrator::new(llm.clone(), registry(), Arc::new(resolver), SessionPaths::under(dir.path()))
            .run_review(&request(&dir, &["bug"]), Arc::new(MemorySink::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, ReviewError::NoModelAvailable(_)));
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_diff_rejected() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(scripted([0, 0, 0]));
        let err = orchestrator(llm.clone(), &dir)
            .run_review(&ReviewRequest::new("  \n", dir.path()), Arc::new(MemorySink::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, ReviewError::EmptyDiff));
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_synthesis_fragments_reach_sink_unmixed() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(
            scripted([5, 5, 5]).script(
                AgentPrompts::synthesis(),
                Script::fragments(["The ", "cat ", "sat."]).after(Duration::from_millis(15)),
            ),
        );
        let sink = Arc::new(MemorySink::new());

        orchestrator(llm, &dir)
            .run_review(&request(&dir, &["bug", "quality", "tests"]), sink.clone())
            .await
            .unwrap();

        assert_eq!(sink.contents(), "The cat sat.");
    }

    #[tokio::test]
    async fn test_events_follow_completion_order() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(scripted([50, 5, 25]));
        let orchestrator = orchestrator(llm, &dir);

        orchestrator
            .run_review(&request(&dir, &["bug", "quality", "tests"]), Arc::new(MemorySink::new()))
            .await
            .unwrap();

        let history = orchestrator.events().history().await;
        let completed: Vec<String> = history
            .iter()
            .filter_map(|e| match e {
                ReviewEvent::AgentCompleted { agent_id, .. } => Some(agent_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec!["quality", "tests", "bug"]);
        assert!(matches!(history.first(), Some(ReviewEvent::ReviewStarted { .. })));
        assert!(matches!(history.last(), Some(ReviewEvent::SessionPromoted { .. })));
    }

    #[tokio::test]
    async fn test_reports_saved_before_synthesis() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let llm = Arc::new(scripted([5, 5, 5]).script(AgentPrompts::synthesis(), Script::failing("down")));

        let result = orchestrator(llm, &dir)
            .save_reports(&out, Arc::new(MarkdownFormatter))
            .run_review(&request(&dir, &["quality", "bug"]), Arc::new(MemorySink::new()))
            .await;

        assert!(result.is_err());
        let saved = std::fs::read_to_string(out.join("agent-reports.md")).unwrap();
        assert!(saved.find("## quality").unwrap() < saved.find("## bug").unwrap());
    }

    #[tokio::test]
    async fn test_continuation_after_review_appends_one_turn_each() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(scripted([5, 5, 5]));
        let sink = Arc::new(MemorySink::new());
        let paths = SessionPaths::under(dir.path());

        let handler = ContinuationHandler::new(llm.clone(), &paths.last_session);
        let before = handler
            .continue_session("too early", ContinueOptions::default(), sink.clone())
            .await;
        assert!(matches!(before, Err(ReviewError::NoPreviousSession { .. })));

        let outcome = orchestrator(llm.clone(), &dir)
            .run_review(&request(&dir, &["bug"]), sink.clone())
            .await
            .unwrap();
        assert_eq!(outcome.session_path, paths.last_session);

        assert_ok!(handler.continue_session("first follow-up", ContinueOptions::default(), sink.clone()).await);
        let (_, _, after_one) = SessionLog::load(&paths.last_session).await.unwrap();
        assert_eq!(after_one.len(), 2);

        assert_ok!(handler.continue_session("second follow-up", ContinueOptions::default(), sink.clone()).await);
        let (_, _, after_two) = SessionLog::load(&paths.last_session).await.unwrap();
        assert_eq!(after_two.len(), 3);
        assert_eq!(after_two[1].prompt, "first follow-up");
        assert_eq!(after_two[2].prompt, "second follow-up");
    }

    #[test]
    fn test_configured_resolver_precedence() {
        let explicit = ConfiguredModelResolver::new(LLMConfig {
            default_model: Some("gpt-4.1".to_string()),
            ..LLMConfig::default()
        });
        assert_eq!(explicit.resolve(Some("sonnet")).unwrap(), Model::ClaudeSonnet);
        assert_eq!(explicit.resolve(None).unwrap(), Model::GPT41);

        let local = ConfiguredModelResolver::new(LLMConfig {
            provider: "ollama".to_string(),
            ..LLMConfig::default()
        });
        assert_eq!(local.resolve(Some("  ")).unwrap(), Model::QwenCoder);

        let broken = ConfiguredModelResolver::new(LLMConfig {
            provider: "bard".to_string(),
            ..LLMConfig::default()
        });
        assert!(matches!(broken.resolve(None), Err(ReviewError::NoModelAvailable(_))));
    }
}
