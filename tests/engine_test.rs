#[cfg(test)]
mod engine_tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::{Map, Value, json};
    use tokio::sync::Mutex;

    use rusplan::{
        engine::{Approval, ExecutionEngine, ExecutionEvent, ExecutionOutcome, ExecutionState},
        error::{Error, PlanError, ToolError},
        execution::{
            AuditOutcome, ExecutionContext, MemoryAuditSink, OverallStatus, RollbackStatus, StepStatus,
        },
        planning::{RiskLevel, TaskPlan, TaskStep},
        shared::EngineConfig,
        tools::{ParamSpec, ParamType, ParameterSchema, Tool, ToolCategory, ToolHandler, ToolOutput, ToolRegistry},
    };

    type Journal = Arc<Mutex<Vec<(String, Map<String, Value>)>>>;

    #[derive(Clone)]
    enum Behavior {
        Succeed(Value),
        Fail,
        Sleep(Duration, Value),
    }

    /// Stand-in for a domain service; every call lands in the shared journal.
    struct Stub {
        name: &'static str,
        behavior: Behavior,
        journal: Journal,
    }

    #[async_trait]
    impl ToolHandler for Stub {
        async fn apply(
            &self,
            parameters: &Map<String, Value>,
            _context: &ExecutionContext,
        ) -> Result<ToolOutput, ToolError> {
            self.journal
                .lock()
                .await
                .push((self.name.to_string(), parameters.clone()));
            match &self.behavior {
                Behavior::Succeed(data) => Ok(ToolOutput::success(data.clone())),
                Behavior::Fail => Err(ToolError::execution(format!("{} unavailable", self.name))),
                Behavior::Sleep(delay, data) => {
                    tokio::time::sleep(*delay).await;
                    Ok(ToolOutput::success(data.clone()))
                }
            }
        }
    }

    struct Fixture {
        engine: ExecutionEngine,
        audit: Arc<MemoryAuditSink>,
        journal: Journal,
    }

    impl Fixture {
        fn new(enroll: Behavior, config: EngineConfig) -> Self {
            let journal: Journal = Arc::default();
            let stub = |name: &'static str, behavior: Behavior| {
                Arc::new(Stub {
                    name,
                    behavior,
                    journal: journal.clone(),
                })
            };

            let mut registry = ToolRegistry::new();
            let tools = [
                Tool::new(
                    "create_course",
                    stub("create_course", Behavior::Succeed(json!({"course_id": "c-1"}))),
                )
                .with_domain("course")
                .with_category(ToolCategory::Write)
                .with_permission("course:write")
                .with_schema(ParameterSchema::new().param("title", ParamSpec::required(ParamType::String)))
                .with_compensator("delete_course"),
                Tool::new("enroll_students", stub("enroll_students", enroll))
                    .with_domain("course")
                    .with_permission("enrollment:write")
                    .with_schema(
                        ParameterSchema::new()
                            .param("course_id", ParamSpec::required(ParamType::String))
                            .param("students", ParamSpec::optional(ParamType::Array)),
                    ),
                Tool::new(
                    "delete_course",
                    stub("delete_course", Behavior::Succeed(json!({"deleted": true}))),
                )
                .with_domain("course")
                .with_category(ToolCategory::Delete)
                .with_permission("course:write"),
                Tool::new(
                    "notify_students",
                    stub("notify_students", Behavior::Succeed(json!({"sent": true}))),
                )
                .with_domain("user")
                .with_permission("notify:send"),
                Tool::new(
                    "import_materials",
                    stub(
                        "import_materials",
                        Behavior::Sleep(Duration::from_millis(200), json!({"imported": 10})),
                    ),
                )
                .with_domain("content"),
            ];
            for tool in tools {
                registry.register(tool).unwrap();
            }

            let audit = Arc::new(MemoryAuditSink::new());
            let engine = ExecutionEngine::new(Arc::new(registry), audit.clone(), config);
            Self { engine, audit, journal }
        }

        async fn calls(&self, tool: &str) -> Vec<Map<String, Value>> {
            self.journal
                .lock()
                .await
                .iter()
                .filter(|(name, _)| name == tool)
                .map(|(_, params)| params.clone())
                .collect()
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            ..Default::default()
        }
    }

    fn instructor() -> ExecutionContext {
        ExecutionContext::new("instructor-1").with_permissions(["course:write", "enrollment:write", "notify:send"])
    }

    fn course_plan(id: &str) -> TaskPlan {
        TaskPlan::new(
            id,
            vec![
                TaskStep::new("s1", "create_course").with_param("title", json!("Rust 101")),
                TaskStep::new("s2", "enroll_students")
                    .with_param("course_id", json!("${s1.course_id}"))
                    .with_param("students", json!(["ada", "lin"]))
                    .depends_on(["s1"]),
            ],
        )
    }

    fn completed(outcome: ExecutionOutcome) -> rusplan::ExecutionResult {
        match outcome {
            ExecutionOutcome::Completed(result) => result,
            ExecutionOutcome::AwaitingConfirmation(p) => panic!("plan {} unexpectedly parked", p.plan_id),
        }
    }

    #[tokio::test]
    async fn test_course_then_enrollment_succeeds() {
        let fixture = Fixture::new(Behavior::Succeed(json!({"enrolled": 2})), fast_config());
        let mut events = fixture.engine.subscribe();

        let result = completed(fixture.engine.submit(&course_plan("p1"), &instructor()).await.unwrap());

        assert_eq!(result.overall_status, OverallStatus::Succeeded);
        assert_eq!(result.state, ExecutionState::Succeeded);
        assert!(result.rollback_result.is_none());
        assert!(result.steps.iter().all(|s| s.attempts == 1));

        // The reference resolved to the id produced by s1.
        let enroll = fixture.calls("enroll_students").await;
        assert_eq!(enroll.len(), 1);
        assert_eq!(enroll[0]["course_id"], "c-1");
        assert_eq!(fixture.audit.len().await, 2);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(
            kinds,
            vec![
                "step:started",
                "step:completed",
                "step:started",
                "step:completed",
                "plan:completed"
            ]
        );
        assert_eq!(fixture.engine.state("p1").await, Some(ExecutionState::Succeeded));
    }

    #[tokio::test]
    async fn test_critical_failure_rolls_back_created_course() {
        let fixture = Fixture::new(Behavior::Fail, fast_config());
        let mut plan = course_plan("p2");
        plan.steps[1].is_critical = true;
        plan.steps
            .push(TaskStep::new("s3", "notify_students").depends_on(["s2"]));

        let result = completed(fixture.engine.submit(&plan, &instructor()).await.unwrap());

        assert_eq!(result.overall_status, OverallStatus::RolledBack);
        assert_eq!(result.state, ExecutionState::RolledBack);
        assert_eq!(result.step("s2").unwrap().attempts, 3);
        assert_eq!(result.step("s3").unwrap().status, StepStatus::Skipped);
        assert_eq!(result.step("s3").unwrap().attempts, 0);

        let deletes = fixture.calls("delete_course").await;
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0]["course_id"], "c-1");
        assert_eq!(deletes[0]["compensates"], "s1");
        assert!(fixture.calls("notify_students").await.is_empty());

        let rollback = result.rollback_result.unwrap();
        assert!(rollback.is_complete());
        assert_eq!(rollback.entries[0].status, RollbackStatus::Compensated);

        // One create, three enroll attempts, one delete.
        assert_eq!(fixture.audit.len().await, 5);
    }

    #[tokio::test]
    async fn test_critical_failure_without_rollback_is_failed() {
        let config = EngineConfig {
            rollback_on_critical_failure: false,
            ..fast_config()
        };
        let fixture = Fixture::new(Behavior::Fail, config);
        let mut plan = course_plan("p");
        plan.steps[1].is_critical = true;

        let result = completed(fixture.engine.submit(&plan, &instructor()).await.unwrap());
        assert_eq!(result.overall_status, OverallStatus::Failed);
        assert!(result.rollback_result.is_none());
        assert!(fixture.calls("delete_course").await.is_empty());
    }

    #[tokio::test]
    async fn test_cyclic_plan_touches_nothing() {
        let fixture = Fixture::new(Behavior::Succeed(json!({})), fast_config());
        let plan = TaskPlan::new(
            "p3",
            vec![
                TaskStep::new("s1", "create_course")
                    .with_param("title", json!("x"))
                    .depends_on(["s2"]),
                TaskStep::new("s2", "notify_students").depends_on(["s1"]),
            ],
        );

        let err = fixture.engine.submit(&plan, &instructor()).await.unwrap_err();
        let cycle = match err {
            Error::Plan(PlanError::CyclicDependency { cycle }) => cycle,
            other => panic!("expected a cycle, got {other}"),
        };
        assert_eq!(cycle.first(), cycle.last());

        assert!(fixture.audit.is_empty().await);
        assert!(fixture.journal.lock().await.is_empty());
        assert_eq!(fixture.engine.state("p3").await, Some(ExecutionState::ValidationFailed));
    }

    #[tokio::test]
    async fn test_non_critical_failure_is_partial() {
        let fixture = Fixture::new(Behavior::Fail, fast_config());
        let mut plan = course_plan("p");
        plan.steps
            .push(TaskStep::new("s3", "notify_students").depends_on(["s2"]));
        plan.steps
            .push(TaskStep::new("s4", "notify_students").depends_on(["s1"]));

        let result = completed(fixture.engine.submit(&plan, &instructor()).await.unwrap());

        assert_eq!(result.overall_status, OverallStatus::Succeeded);
        assert_eq!(result.state, ExecutionState::PartiallyFailed);
        assert!(result.has_partial_failures());
        assert_eq!(result.step("s2").unwrap().status, StepStatus::Failed);
        assert_eq!(result.step("s3").unwrap().status, StepStatus::Skipped);
        assert_eq!(result.step("s4").unwrap().status, StepStatus::Succeeded);
        assert!(result.rollback_result.is_none());
    }

    #[tokio::test]
    async fn test_critical_step_blocked_by_non_critical_failure_rolls_back() {
        let fixture = Fixture::new(Behavior::Fail, fast_config());
        let mut plan = course_plan("p");
        plan.steps
            .push(TaskStep::new("s3", "notify_students").depends_on(["s2"]).critical());

        let result = completed(fixture.engine.submit(&plan, &instructor()).await.unwrap());

        assert_eq!(result.overall_status, OverallStatus::RolledBack);
        assert_eq!(result.state, ExecutionState::RolledBack);
        assert_eq!(result.step("s2").unwrap().status, StepStatus::Failed);
        assert_eq!(result.step("s3").unwrap().status, StepStatus::Skipped);
        assert!(fixture.calls("notify_students").await.is_empty());

        let deletes = fixture.calls("delete_course").await;
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0]["compensates"], "s1");
        assert!(result.rollback_result.unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_forget_drops_only_finished_plans() {
        let fixture = Fixture::new(Behavior::Succeed(json!({})), fast_config());
        completed(fixture.engine.submit(&course_plan("done"), &instructor()).await.unwrap());
        fixture
            .engine
            .submit(&course_plan("parked").with_risk(RiskLevel::High), &instructor())
            .await
            .unwrap();

        assert!(!fixture.engine.forget("parked").await);
        assert!(fixture.engine.state("parked").await.is_some());

        assert!(fixture.engine.forget("done").await);
        assert_eq!(fixture.engine.state("done").await, None);
        assert!(!fixture.engine.forget("done").await);
    }

    #[tokio::test]
    async fn test_retries_never_exceed_three() {
        let config = EngineConfig {
            max_attempts: 10,
            ..fast_config()
        };
        let fixture = Fixture::new(Behavior::Fail, config);

        let result = completed(fixture.engine.submit(&course_plan("p"), &instructor()).await.unwrap());
        assert_eq!(result.step("s2").unwrap().attempts, 3);
        assert_eq!(fixture.calls("enroll_students").await.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_permission_is_audited_as_denied() {
        let fixture = Fixture::new(Behavior::Succeed(json!({})), fast_config());
        let context = ExecutionContext::new("assistant").with_permissions(["course:write"]);

        let result = completed(fixture.engine.submit(&course_plan("p"), &context).await.unwrap());

        let s2 = result.step("s2").unwrap();
        assert_eq!(s2.attempts, 1);
        assert!(matches!(s2.error, Some(ToolError::Permission { .. })));
        assert!(fixture.calls("enroll_students").await.is_empty());

        let denied = fixture.audit.for_tool("enroll_students").await;
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].outcome, AuditOutcome::Denied);
        assert_eq!(denied[0].actor_id, "assistant");
    }

    #[tokio::test]
    async fn test_high_risk_plan_waits_for_approval() {
        let fixture = Fixture::new(Behavior::Succeed(json!({})), fast_config());
        let plan = course_plan("p4").with_risk(RiskLevel::High);

        let outcome = fixture.engine.submit(&plan, &instructor()).await.unwrap();
        let pending = outcome.pending().cloned().unwrap();
        assert!(fixture.journal.lock().await.is_empty());
        assert_eq!(
            fixture.engine.state("p4").await,
            Some(ExecutionState::AwaitingConfirmation)
        );

        // A resubmission cannot overtake the parked plan.
        assert!(matches!(
            fixture.engine.submit(&plan, &instructor()).await,
            Err(Error::PlanInProgress(_))
        ));

        let forged = Approval::new(uuid::Uuid::new_v4(), "principal");
        assert!(matches!(
            fixture.engine.approve("p4", forged, &instructor()).await,
            Err(Error::InvalidApprovalToken(_))
        ));

        let result = fixture
            .engine
            .approve("p4", Approval::for_pending(&pending, "principal"), &instructor())
            .await
            .unwrap();
        assert_eq!(result.overall_status, OverallStatus::Succeeded);
        assert_eq!(fixture.calls("create_course").await.len(), 1);

        // Tokens are single use.
        assert!(matches!(
            fixture
                .engine
                .approve("p4", Approval::for_pending(&pending, "principal"), &instructor())
                .await,
            Err(Error::PlanNotPending(_))
        ));
    }

    #[tokio::test]
    async fn test_low_risk_plan_runs_without_confirmation() {
        let fixture = Fixture::new(Behavior::Succeed(json!({})), fast_config());
        let outcome = fixture.engine.submit(&course_plan("p"), &instructor()).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_destructive_step_needs_confirmation_and_can_be_rejected() {
        let fixture = Fixture::new(Behavior::Succeed(json!({})), fast_config());
        let mut events = fixture.engine.subscribe();
        let plan = TaskPlan::new(
            "p5",
            vec![TaskStep::new("s1", "delete_course").with_param("course_id", json!("c-9"))],
        );

        let outcome = fixture.engine.submit(&plan, &instructor()).await.unwrap();
        let pending = outcome.pending().unwrap();
        assert_eq!(pending.impact_summary.destructive_steps[0].step_id, "s1");

        fixture.engine.reject("p5", "wrong course").await.unwrap();
        assert_eq!(fixture.engine.state("p5").await, Some(ExecutionState::Aborted));
        assert!(fixture.journal.lock().await.is_empty());

        let kinds: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec!["plan:awaiting_confirmation", "plan:rejected"]);

        assert!(matches!(
            fixture.engine.reject("p5", "again").await,
            Err(Error::PlanNotPending(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_confirmation_is_aborted() {
        let config = EngineConfig {
            confirmation_timeout_secs: Some(0),
            ..fast_config()
        };
        let fixture = Fixture::new(Behavior::Succeed(json!({})), config);
        let plan = course_plan("p6").with_risk(RiskLevel::High);

        let outcome = fixture.engine.submit(&plan, &instructor()).await.unwrap();
        let pending = outcome.pending().cloned().unwrap();

        let err = fixture
            .engine
            .approve("p6", Approval::for_pending(&pending, "principal"), &instructor())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfirmationExpired(_)));
        assert_eq!(fixture.engine.state("p6").await, Some(ExecutionState::Aborted));
        assert!(fixture.journal.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_expire_pending_sweeps_stale_plans() {
        let config = EngineConfig {
            confirmation_timeout_secs: Some(0),
            ..fast_config()
        };
        let fixture = Fixture::new(Behavior::Succeed(json!({})), config);
        fixture
            .engine
            .submit(&course_plan("stale").with_risk(RiskLevel::High), &instructor())
            .await
            .unwrap();

        assert_eq!(fixture.engine.expire_pending().await, vec!["stale".to_string()]);
        assert!(fixture.engine.pending_confirmation("stale").await.is_none());
        assert_eq!(fixture.engine.state("stale").await, Some(ExecutionState::Aborted));
    }

    #[tokio::test]
    async fn test_cancel_skips_remaining_steps() {
        let fixture = Fixture::new(Behavior::Succeed(json!({})), fast_config());
        let plan = TaskPlan::new(
            "p7",
            vec![
                TaskStep::new("s1", "import_materials"),
                TaskStep::new("s2", "notify_students").depends_on(["s1"]),
            ],
        );
        let context = instructor();

        let (outcome, cancelled) = tokio::join!(fixture.engine.submit(&plan, &context), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fixture.engine.cancel("p7").await
        });

        assert!(cancelled);
        let result = completed(outcome.unwrap());
        assert_eq!(result.overall_status, OverallStatus::Cancelled);
        assert_eq!(result.state, ExecutionState::Cancelled);
        assert_eq!(result.step("s2").unwrap().status, StepStatus::Skipped);
        assert!(result.rollback_result.is_none());
        assert!(fixture.calls("notify_students").await.is_empty());

        assert!(!fixture.engine.cancel("p7").await);
        assert!(!fixture.engine.cancel("unknown").await);
    }

    #[tokio::test]
    async fn test_results_follow_completion_order_within_a_batch() {
        let fixture = Fixture::new(Behavior::Succeed(json!({})), fast_config());
        let plan = TaskPlan::new(
            "p8",
            vec![
                // Alphabetically first, but finishes last.
                TaskStep::new("a_import", "import_materials"),
                TaskStep::new("b_notify", "notify_students"),
            ],
        );

        let result = completed(fixture.engine.submit(&plan, &instructor()).await.unwrap());
        let order: Vec<&str> = result.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(order, vec!["b_notify", "a_import"]);
    }

    /// Counts how many calls overlap.
    #[derive(Default)]
    struct Overlap {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ToolHandler for Overlap {
        async fn apply(
            &self,
            _parameters: &Map<String, Value>,
            _context: &ExecutionContext,
        ) -> Result<ToolOutput, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ToolOutput::success(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_batch_concurrency_is_bounded() {
        for (limit, expected_peak) in [(1, 1), (2, 2)] {
            let handler = Arc::new(Overlap::default());
            let mut registry = ToolRegistry::new();
            registry.register(Tool::new("sync_roster", handler.clone())).unwrap();
            let config = EngineConfig {
                max_concurrent_steps: limit,
                ..fast_config()
            };
            let engine = ExecutionEngine::new(Arc::new(registry), Arc::new(MemoryAuditSink::new()), config);

            let steps = (1..=4)
                .map(|i| TaskStep::new(format!("s{i}"), "sync_roster"))
                .collect();
            let result = completed(
                engine
                    .submit(&TaskPlan::new("p", steps), &ExecutionContext::new("t"))
                    .await
                    .unwrap(),
            );

            assert_eq!(result.steps.len(), 4);
            assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
            assert_eq!(handler.peak.load(Ordering::SeqCst), expected_peak);
        }
    }

    #[tokio::test]
    async fn test_plan_submitted_as_json() {
        let fixture = Fixture::new(Behavior::Succeed(json!({"enrolled": 1})), fast_config());
        let plan = TaskPlan::from_json(
            r#"{
                "planId": "from-chat",
                "riskLevel": "low",
                "steps": [
                    {"id": "s1", "toolName": "create_course", "parameters": {"title": "Biology"}},
                    {"id": "s2", "tool": "enroll_students", "dependsOn": ["s1"], "isCritical": true,
                     "parameters": {"course_id": "${s1.course_id}"}}
                ]
            }"#,
        )
        .unwrap();

        let result = completed(fixture.engine.submit(&plan, &instructor()).await.unwrap());
        assert_eq!(result.plan_id, "from-chat");
        assert_eq!(result.overall_status, OverallStatus::Succeeded);

        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["overallStatus"], "succeeded");
        assert_eq!(wire["steps"][1]["parameters"]["course_id"], "c-1");
    }

    #[tokio::test]
    async fn test_step_failed_event_carries_error() {
        let fixture = Fixture::new(Behavior::Fail, fast_config());
        let mut events = fixture.engine.subscribe();
        completed(fixture.engine.submit(&course_plan("p"), &instructor()).await.unwrap());

        let failed = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
            ExecutionEvent::StepFailed { step_id, attempts, error, .. } => Some((step_id, attempts, error)),
            _ => None,
        });
        let (step_id, attempts, error) = failed.unwrap();
        assert_eq!(step_id, "s2");
        assert_eq!(attempts, 3);
        assert!(error.is_retryable());
    }
}
