use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use rusplan::{
    DomainAgent, EngineConfig, Error, ExecutionContext, ExecutionEngine, Intent, Planner, RiskLevel, TaskPlan,
    TaskStep, Tool, ToolHandler, ToolOutput, ToolRegistry,
    engine::{Approval, ExecutionOutcome},
    error::ToolError,
    execution::TracingAuditSink,
    tools::{ParamSpec, ParamType, ParameterSchema, ToolCategory},
};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{Level, info, warn};

/// In-memory course catalogue standing in for the real course service.
#[derive(Default)]
struct CourseService {
    courses: Mutex<HashMap<String, Value>>,
    next_id: AtomicU32,
}

struct CreateCourse(Arc<CourseService>);
struct DeleteCourse(Arc<CourseService>);
struct EnrollStudents(Arc<CourseService>);

#[async_trait]
impl ToolHandler for CreateCourse {
    async fn apply(
        &self,
        parameters: &Map<String, Value>,
        _context: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let id = format!("c-{}", self.0.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let title = parameters.get("title").cloned().unwrap_or(Value::Null);
        let course = json!({"title": title, "students": []});
        self.0.courses.lock().await.insert(id.clone(), course);
        Ok(ToolOutput::success(json!({"course_id": id})))
    }
}

#[async_trait]
impl ToolHandler for DeleteCourse {
    async fn apply(
        &self,
        parameters: &Map<String, Value>,
        _context: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let id = parameters
            .get("course_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match self.0.courses.lock().await.remove(id) {
            Some(_) => Ok(ToolOutput::success(json!({"deleted": id}))),
            None => Ok(ToolOutput::failure(format!("course {id} not found"))),
        }
    }
}

#[async_trait]
impl ToolHandler for EnrollStudents {
    async fn apply(
        &self,
        parameters: &Map<String, Value>,
        _context: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let id = parameters
            .get("course_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let students = parameters.get("students").cloned().unwrap_or(json!([]));
        if students.as_array().is_some_and(|s| s.len() > 30) {
            return Err(ToolError::execution("class is full"));
        }

        let mut courses = self.0.courses.lock().await;
        let Some(course) = courses.get_mut(id) else {
            return Ok(ToolOutput::failure(format!("course {id} not found")));
        };
        course["students"] = students.clone();
        Ok(ToolOutput::success(json!({"course_id": id, "enrolled": students})))
    }
}

/// Maps a handful of goals onto fixed plan shapes.
struct RulePlanner;

#[async_trait]
impl Planner for RulePlanner {
    async fn plan(&self, intent: &Intent, tools: &[Arc<Tool>]) -> rusplan::Result<TaskPlan> {
        let available = |name: &str| tools.iter().any(|t| t.name == name);
        let param = |name: &str| intent.parameters.get(name).cloned().unwrap_or(Value::Null);

        match intent.goal.as_str() {
            "open_course" if available("create_course") && available("enroll_students") => Ok(TaskPlan::new(
                format!("open-{}", uuid::Uuid::new_v4().simple()),
                vec![
                    TaskStep::new("create", "create_course").with_param("title", param("title")),
                    TaskStep::new("enroll", "enroll_students")
                        .with_param("course_id", json!("${create.course_id}"))
                        .with_param("students", param("students"))
                        .depends_on(["create"])
                        .critical(),
                ],
            )
            .with_risk(RiskLevel::Medium)
            .with_description(format!("Open course {}", param("title")))),
            "close_course" if available("delete_course") => Ok(TaskPlan::new(
                format!("close-{}", uuid::Uuid::new_v4().simple()),
                vec![TaskStep::new("delete", "delete_course").with_param("course_id", param("course_id"))],
            )),
            goal => Err(Error::Planner(format!("no plan for goal `{goal}`"))),
        }
    }
}

fn registry(service: Arc<CourseService>) -> rusplan::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(
        Tool::new("create_course", Arc::new(CreateCourse(service.clone())))
            .with_description("Create an empty course")
            .with_domain("course")
            .with_category(ToolCategory::Write)
            .with_permission("course:write")
            .with_schema(ParameterSchema::new().param("title", ParamSpec::required(ParamType::String)))
            .with_compensator("delete_course"),
    )?;
    registry.register(
        Tool::new("delete_course", Arc::new(DeleteCourse(service.clone())))
            .with_description("Delete a course and its enrollments")
            .with_domain("course")
            .with_category(ToolCategory::Delete)
            .with_permission("course:write")
            .exclusive_on("course_id"),
    )?;
    registry.register(
        Tool::new("enroll_students", Arc::new(EnrollStudents(service)))
            .with_description("Enroll a list of students")
            .with_domain("course")
            .with_permission("enrollment:write")
            .with_schema(
                ParameterSchema::new()
                    .param("course_id", ParamSpec::required(ParamType::String))
                    .param("students", ParamSpec::required(ParamType::Array)),
            )
            .exclusive_on("course_id"),
    )?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let service = Arc::new(CourseService::default());
    let registry = Arc::new(registry(service.clone())?);
    let config = EngineConfig {
        base_backoff_ms: 50,
        ..Default::default()
    };
    let engine = Arc::new(ExecutionEngine::new(registry.clone(), Arc::new(TracingAuditSink), config));

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("event: {}", serde_json::to_string(&event).unwrap_or_default());
        }
    });

    let agent = DomainAgent::new("course-agent", "course", engine, registry, Arc::new(RulePlanner));
    let instructor = ExecutionContext::new("instructor-42").with_permissions(["course:write", "enrollment:write"]);

    // Medium risk, two steps: parked until someone approves.
    let intent = Intent::new("open_course")
        .with_param("title", json!("Intro to Rust"))
        .with_param("students", json!(["ada", "grace", "linus"]));
    if let ExecutionOutcome::AwaitingConfirmation(pending) = agent.handle(&intent, &instructor).await? {
        info!("needs approval: {}", serde_json::to_string_pretty(&pending.impact_summary)?);
        let result = agent
            .approve(&pending.plan_id, Approval::for_pending(&pending, "principal-1"), &instructor)
            .await?;
        info!("open_course finished: {:?} ({})", result.overall_status, result.state);
    }

    // An oversized class fails enrollment three times; the new course is deleted again.
    let crowd: Vec<String> = (1..=40).map(|i| format!("student-{i}")).collect();
    let intent = Intent::new("open_course")
        .with_param("title", json!("Overbooked"))
        .with_param("students", json!(crowd));
    if let ExecutionOutcome::AwaitingConfirmation(pending) = agent.handle(&intent, &instructor).await? {
        let result = agent
            .approve(&pending.plan_id, Approval::for_pending(&pending, "principal-1"), &instructor)
            .await?;
        if let Some(rollback) = &result.rollback_result {
            warn!(
                "rolled back {} step(s), complete: {}",
                rollback.compensated().count(),
                rollback.is_complete()
            );
        }
    }

    // Destructive work always asks first; this one gets turned down.
    let intent = Intent::new("close_course").with_param("course_id", json!("c-1"));
    if let ExecutionOutcome::AwaitingConfirmation(pending) = agent.handle(&intent, &instructor).await? {
        agent.reject(&pending.plan_id, "semester still running").await?;
    }

    info!("courses left: {}", service.courses.lock().await.len());
    Ok(())
}
