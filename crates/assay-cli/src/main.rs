use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use assay_core::cancellation::CancellationToken;
use assay_core::config::AssayConfig;
use assay_core::dispatch::{DispatchRequest, Dispatcher};
use assay_core::export::export_experiment;
use assay_core::graph;
use assay_core::models::{
    CoreError, CoreErrorKind, Experiment, ExperimentFilter, ExperimentId, ExperimentStatus,
    NewExperiment, RecordedEvent, TaskList,
};
use assay_core::monitor::{Monitor, MonitorSnapshot};
use assay_core::persistence::RegistryStore;
use assay_core::pipeline::{PipelineCatalog, PipelineResult, PipelineRunner};
use assay_core::skills::{Skill, SkillSet};
use assay_core::sqlite::SqliteStore;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Parser)]
#[command(name = "assay", version, about = "Experiment registry, skill dispatcher and pipeline runner")]
struct Cli {
    /// Emit JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the registry database, config file and pipelines directory.
    Init,
    /// Register an experiment by its data location.
    Register {
        location: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Metadata as key=value; values that parse as JSON are stored as JSON.
        #[arg(long = "meta")]
        metadata: Vec<String>,
        /// Record the experiment as discovered rather than registered.
        #[arg(long)]
        discovered: bool,
    },
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    Show {
        experiment: String,
    },
    /// Run one skill against an experiment.
    Run {
        experiment: String,
        skill: String,
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(last = true)]
        args: Vec<String>,
    },
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    Tasks {
        experiment: String,
    },
    Events {
        experiment: String,
        #[arg(long, default_value_t = 0)]
        after: u64,
    },
    /// Force a task to skipped.
    Skip {
        experiment: String,
        task: String,
        #[arg(long, default_value = "skipped by operator")]
        reason: String,
    },
    Monitor {
        experiment: String,
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
        /// Print one snapshot and exit.
        #[arg(long)]
        once: bool,
    },
    /// Mark an experiment archived; later analysis no longer changes its status.
    Archive {
        experiment: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Override an experiment's status.
    SetStatus {
        experiment: String,
        status: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Write a JSON document per experiment.
    Export {
        experiment: Option<String>,
        #[arg(long, default_value = "exports")]
        out: PathBuf,
    },
    Skills,
}

#[derive(Subcommand)]
enum PipelineCommands {
    Run { experiment: String, pipeline: String },
    Resume {
        experiment: String,
        #[arg(long)]
        skip_failed: bool,
    },
    List,
}

struct App {
    config: AssayConfig,
    store: Arc<dyn RegistryStore>,
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    assay_core::logging::init_logging();
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => code,
        Err(error) => {
            tracing::debug!(kind = ?error.kind, message = %error.message, "command failed");
            eprintln!("error: {}", describe(&error));
            ExitCode::from(error_exit_code(&error))
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode, CoreError> {
    let config = AssayConfig::load()?;
    let store = SqliteStore::new(config.database_path())
        .with_retry_attempts(config.store_retry_attempts);
    store.migrate_to_latest()?;
    let app = App {
        config,
        store: Arc::new(store),
        json: cli.json,
    };

    match cli.command {
        Commands::Init => app.init(),
        Commands::Register {
            location,
            name,
            id,
            tags,
            metadata,
            discovered,
        } => app.register(location, name, id, tags, metadata, discovered),
        Commands::List { status, tag, name } => app.list(status, tag, name),
        Commands::Show { experiment } => app.show(&experiment),
        Commands::Run {
            experiment,
            skill,
            task,
            timeout_secs,
            args,
        } => app.run(&experiment, skill, task, timeout_secs, args).await,
        Commands::Pipeline { command } => match command {
            PipelineCommands::Run {
                experiment,
                pipeline,
            } => app.pipeline_run(&experiment, &pipeline).await,
            PipelineCommands::Resume {
                experiment,
                skip_failed,
            } => app.pipeline_resume(&experiment, skip_failed).await,
            PipelineCommands::List => app.pipeline_list(),
        },
        Commands::Tasks { experiment } => app.tasks(&experiment),
        Commands::Events { experiment, after } => app.events(&experiment, after),
        Commands::Skip {
            experiment,
            task,
            reason,
        } => app.skip(&experiment, &task, &reason),
        Commands::Monitor {
            experiment,
            interval_secs,
            once,
        } => app.monitor(&experiment, interval_secs, once).await,
        Commands::Archive { experiment, reason } => {
            app.set_status(&experiment, ExperimentStatus::Archived, reason.as_deref())
        }
        Commands::SetStatus {
            experiment,
            status,
            reason,
        } => app.set_status(&experiment, parse_status(&status)?, reason.as_deref()),
        Commands::Export { experiment, out } => app.export(experiment.as_deref(), out),
        Commands::Skills => app.skills(),
    }
}

impl App {
    fn init(&self) -> Result<ExitCode, CoreError> {
        let written = self.config.write_if_missing()?;
        let pipelines_dir = self.config.pipelines_dir();
        std::fs::create_dir_all(&pipelines_dir).map_err(|error| {
            CoreError::new(
                CoreErrorKind::ConfigError,
                format!("failed to create '{}': {error}", pipelines_dir.display()),
            )
        })?;
        self.print(
            json!({
                "database": self.config.database_path(),
                "config": self.config.config_path(),
                "config_written": written,
                "pipelines_dir": pipelines_dir,
            }),
            || {
                format!(
                    "registry ready at {}\nconfig: {}{}\npipelines: {}",
                    self.config.database_path().display(),
                    self.config.config_path().display(),
                    if written { " (created)" } else { "" },
                    pipelines_dir.display()
                )
            },
        );
        Ok(ExitCode::SUCCESS)
    }

    fn register(
        &self,
        location: String,
        name: Option<String>,
        id: Option<String>,
        tags: Vec<String>,
        metadata: Vec<String>,
        discovered: bool,
    ) -> Result<ExitCode, CoreError> {
        let name = name.unwrap_or_else(|| default_name(&location));
        let mut request = NewExperiment::new(name, location).discovered(discovered);
        if let Some(id) = id {
            request = request.id(ExperimentId::new(id));
        }
        for tag in tags {
            request = request.tag(tag);
        }
        for entry in metadata {
            let (key, raw) = entry.split_once('=').ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::ValidationError,
                    format!("metadata '{entry}' must be key=value"),
                )
            })?;
            let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::from(raw));
            request = request.metadata(key, value);
        }

        let id = self.store.create(request)?;
        self.print(json!({ "id": id }), || id.to_string());
        Ok(ExitCode::SUCCESS)
    }

    fn list(
        &self,
        status: Option<String>,
        tag: Option<String>,
        name: Option<String>,
    ) -> Result<ExitCode, CoreError> {
        let status = status.as_deref().map(parse_status).transpose()?;
        let filter = ExperimentFilter {
            status,
            tag,
            name_contains: name,
        };
        let experiments = self.store.list(&filter)?;

        if self.json {
            let rows: Vec<Value> = experiments.iter().map(summary_json).collect();
            println!("{}", Value::Array(rows));
        } else {
            for experiment in &experiments {
                println!(
                    "{:<18} {:<12} {:<24} {}",
                    experiment.id,
                    experiment.status.as_str(),
                    experiment.name,
                    experiment.location
                );
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    fn show(&self, experiment: &str) -> Result<ExitCode, CoreError> {
        let experiment = self.resolve(experiment)?;
        let tasks = self.store.task_list(&experiment.id)?;
        if self.json {
            println!(
                "{}",
                json!({ "experiment": experiment, "tasks": tasks })
            );
            return Ok(ExitCode::SUCCESS);
        }

        println!("{} ({})", experiment.name, experiment.id);
        println!("  location: {}", experiment.location);
        println!("  status:   {}", experiment.status.as_str());
        println!("  created:  {}", format_ms(experiment.created_at_ms));
        if !experiment.tags.is_empty() {
            let tags: Vec<_> = experiment.tags.iter().map(String::as_str).collect();
            println!("  tags:     {}", tags.join(", "));
        }
        for (key, value) in &experiment.metadata {
            println!("  {key}: {value}");
        }
        print_tasks(&tasks);
        println!("  events:   {}", experiment.events.len());
        Ok(ExitCode::SUCCESS)
    }

    async fn run(
        &self,
        experiment: &str,
        skill: String,
        task: Option<String>,
        timeout_secs: Option<u64>,
        args: Vec<String>,
    ) -> Result<ExitCode, CoreError> {
        let experiment = self.resolve(experiment)?;
        let dispatcher = Dispatcher::from_config(self.store.clone(), &self.config)?;
        let mut request = DispatchRequest::new(experiment.id.clone(), skill).args(args);
        if let Some(task) = task {
            request = request.task(task);
        }
        if let Some(timeout_secs) = timeout_secs {
            request = request.timeout(Duration::from_secs(timeout_secs));
        }

        let cancel = cancel_on_ctrl_c();
        let report = dispatcher.dispatch(request, &cancel).await?;
        if self.json {
            println!("{}", json!(report.event));
        } else {
            println!(
                "{} {} on {}: {}",
                report.event.outcome.map_or("unknown", outcome_label),
                report.task,
                experiment.id,
                report.event.message.as_deref().unwrap_or("")
            );
            for output in &report.event.outputs {
                println!("  {} {}", output.checksum, output.path);
            }
        }

        Ok(match &report.failure {
            None => ExitCode::SUCCESS,
            Some(failure) => {
                eprintln!("error: {}", describe(failure));
                ExitCode::from(failure_exit_code(Some(failure), report.exit_code()))
            }
        })
    }

    async fn pipeline_run(&self, experiment: &str, pipeline: &str) -> Result<ExitCode, CoreError> {
        let experiment = self.resolve(experiment)?;
        let runner = self.runner()?;
        let cancel = cancel_on_ctrl_c();
        let result = runner.run(&experiment.id, pipeline, &cancel).await?;
        Ok(self.report_pipeline(&result))
    }

    async fn pipeline_resume(
        &self,
        experiment: &str,
        skip_failed: bool,
    ) -> Result<ExitCode, CoreError> {
        let experiment = self.resolve(experiment)?;
        let runner = self.runner()?;
        let cancel = cancel_on_ctrl_c();
        let result = runner.resume(&experiment.id, skip_failed, &cancel).await?;
        Ok(self.report_pipeline(&result))
    }

    fn pipeline_list(&self) -> Result<ExitCode, CoreError> {
        let catalog = PipelineCatalog::from_config(&self.config)?;
        if self.json {
            let rows: Vec<Value> = catalog.iter().map(|definition| json!(definition)).collect();
            println!("{}", Value::Array(rows));
        } else {
            for definition in catalog.iter() {
                let steps: Vec<_> = definition.steps.iter().map(|step| step.name.as_str()).collect();
                println!("{:<20} {}", definition.name, steps.join(" -> "));
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    fn tasks(&self, experiment: &str) -> Result<ExitCode, CoreError> {
        let experiment = self.resolve(experiment)?;
        let dispatcher = Dispatcher::from_config(self.store.clone(), &self.config)?;
        let tasks = dispatcher.graph().load_task_list(&experiment.id)?;
        let next = graph::next_runnable(&tasks).map(|task| task.name.clone());
        let blocked: Vec<Value> = graph::blocked(&tasks)
            .iter()
            .map(|entry| json!({ "task": entry.task.name, "blocked_by": entry.blocked_by }))
            .collect();

        if self.json {
            println!(
                "{}",
                json!({ "tasks": tasks, "next_runnable": next, "blocked": blocked })
            );
        } else {
            print_tasks(&tasks);
            if let Some(next) = next {
                println!("  next runnable: {next}");
            }
            for entry in graph::blocked(&tasks) {
                println!("  blocked: {} (by {})", entry.task.name, entry.blocked_by);
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    fn events(&self, experiment: &str, after: u64) -> Result<ExitCode, CoreError> {
        let experiment = self.resolve(experiment)?;
        let events = self.store.events_after(&experiment.id, after)?;
        if self.json {
            println!("{}", json!(events));
        } else {
            for event in &events {
                print_event(event);
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    fn skip(&self, experiment: &str, task: &str, reason: &str) -> Result<ExitCode, CoreError> {
        let experiment = self.resolve(experiment)?;
        let dispatcher = Dispatcher::from_config(self.store.clone(), &self.config)?;
        dispatcher.graph().mark_skipped(&experiment.id, task, reason)?;
        self.print(json!({ "task": task, "status": "skipped" }), || {
            format!("{task} skipped")
        });
        Ok(ExitCode::SUCCESS)
    }

    fn set_status(
        &self,
        experiment: &str,
        status: ExperimentStatus,
        reason: Option<&str>,
    ) -> Result<ExitCode, CoreError> {
        let experiment = self.resolve(experiment)?;
        self.store.set_status(&experiment.id, status, reason)?;
        self.print(
            json!({ "id": experiment.id, "status": status.as_str() }),
            || format!("{} {}", experiment.id, status.as_str()),
        );
        Ok(ExitCode::SUCCESS)
    }

    async fn monitor(
        &self,
        experiment: &str,
        interval_secs: u64,
        once: bool,
    ) -> Result<ExitCode, CoreError> {
        let experiment = self.resolve(experiment)?;
        let monitor = Monitor::new(self.store.clone());
        let json_output = self.json;
        let render = move |snapshot: &MonitorSnapshot| {
            if json_output {
                println!("{}", json!(snapshot));
            } else {
                print_snapshot(snapshot);
            }
        };

        if once {
            render(&monitor.snapshot(&experiment.id)?);
            return Ok(ExitCode::SUCCESS);
        }

        let cancel = cancel_on_ctrl_c();
        monitor
            .watch(
                &experiment.id,
                Duration::from_secs(interval_secs.max(1)),
                &cancel,
                |snapshot| {
                    render(snapshot);
                    true
                },
            )
            .await?;
        Ok(ExitCode::SUCCESS)
    }

    fn export(&self, experiment: Option<&str>, out: PathBuf) -> Result<ExitCode, CoreError> {
        let ids: Vec<ExperimentId> = match experiment {
            Some(experiment) => vec![self.resolve(experiment)?.id],
            None => self
                .store
                .list(&ExperimentFilter::default())?
                .into_iter()
                .map(|experiment| experiment.id)
                .collect(),
        };

        let mut written = Vec::new();
        for id in &ids {
            written.push(export_experiment(self.store.as_ref(), id, &out)?);
        }
        self.print(json!({ "written": written }), || {
            written
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join("\n")
        });
        Ok(ExitCode::SUCCESS)
    }

    fn skills(&self) -> Result<ExitCode, CoreError> {
        let skills = SkillSet::from_config(&self.config)?;
        if self.json {
            let rows: Vec<Value> = skills
                .iter()
                .map(|skill| {
                    let descriptor = skill.descriptor();
                    json!({
                        "name": descriptor.name,
                        "description": descriptor.description,
                        "stage": descriptor.stage,
                        "executable": skill.executable(),
                        "timeout_secs": skill.timeout().as_secs(),
                        "flags": descriptor.value_flags,
                        "switches": descriptor.switch_flags,
                        "outputs": descriptor.output_flags,
                    })
                })
                .collect();
            println!("{}", Value::Array(rows));
        } else {
            for skill in skills.iter() {
                let descriptor = skill.descriptor();
                println!(
                    "{:<10} {:<12} {:<8}s {} ({})",
                    descriptor.name,
                    descriptor.stage,
                    skill.timeout().as_secs(),
                    skill.executable().display(),
                    descriptor.description
                );
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    fn runner(&self) -> Result<PipelineRunner, CoreError> {
        let dispatcher = Dispatcher::from_config(self.store.clone(), &self.config)?;
        let catalog = PipelineCatalog::from_config(&self.config)?;
        Ok(PipelineRunner::new(Arc::new(dispatcher), catalog))
    }

    /// Accepts an experiment id, or a location registered earlier.
    fn resolve(&self, reference: &str) -> Result<Experiment, CoreError> {
        match self.store.get(&ExperimentId::new(reference)) {
            Err(error) if error.kind == CoreErrorKind::NotFound => {
                let by_location = ExperimentId::for_location(reference);
                self.store.get(&by_location).map_err(|_| error)
            }
            other => other,
        }
    }

    fn report_pipeline(&self, result: &PipelineResult) -> ExitCode {
        if self.json {
            println!(
                "{}",
                json!({
                    "experiment": result.experiment,
                    "pipeline": result.pipeline,
                    "state": result.state.as_str(),
                    "failed_step": result.failed_step,
                    "exit_code": result.exit_code,
                    "stderr_tail": result.stderr_tail,
                    "error": result.error.as_ref().map(|error| error.message.clone()),
                    "steps": result.steps.iter().map(|step| json!({
                        "step": step.step,
                        "skill": step.skill,
                        "status": step.status.as_str(),
                        "exit_code": step.exit_code,
                    })).collect::<Vec<_>>(),
                })
            );
        } else {
            for step in &result.steps {
                println!(
                    "{:<16} {:<10} {}",
                    step.step,
                    step.status.as_str(),
                    step.message.as_deref().unwrap_or("")
                );
            }
            println!("pipeline '{}' {}", result.pipeline, result.state.as_str());
            if let Some(failed) = &result.failed_step {
                eprintln!(
                    "failed step: {failed} (exit code {})",
                    result
                        .exit_code
                        .map_or_else(|| "none".to_string(), |code| code.to_string())
                );
                if let Some(tail) = &result.stderr_tail {
                    eprintln!("{tail}");
                }
            }
        }

        if result.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(failure_exit_code(result.error.as_ref(), result.exit_code))
        }
    }

    fn print(&self, value: Value, text: impl FnOnce() -> String) {
        if self.json {
            println!("{value}");
        } else {
            println!("{}", text());
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling");
            handle.cancel();
        }
    });
    token
}

fn summary_json(experiment: &Experiment) -> Value {
    json!({
        "id": experiment.id,
        "name": experiment.name,
        "location": experiment.location,
        "status": experiment.status.as_str(),
        "tags": experiment.tags,
    })
}

fn print_tasks(tasks: &TaskList) {
    if tasks.is_empty() {
        println!("  tasks:    none");
        return;
    }
    println!("  tasks:");
    for task in &tasks.tasks {
        let dependencies: Vec<_> = task.dependencies.iter().map(String::as_str).collect();
        println!(
            "    {:<16} {:<12} attempts={} {}{}",
            task.name,
            task.status.as_str(),
            task.attempts,
            if dependencies.is_empty() {
                String::new()
            } else {
                format!("after {} ", dependencies.join(","))
            },
            task.error.as_deref().unwrap_or("")
        );
    }
}

fn print_event(recorded: &RecordedEvent) {
    let event = &recorded.event;
    println!(
        "{:>5} {} {:<16} {:<10} {}",
        recorded.seq,
        format_ms(event.timestamp_ms),
        event.event_type.as_str(),
        event.skill.as_deref().unwrap_or("-"),
        event.message.as_deref().unwrap_or("")
    );
}

fn print_snapshot(snapshot: &MonitorSnapshot) {
    println!(
        "[{}] {} ({}) status={} events={}",
        format_ms(assay_core::models::now_ms()),
        snapshot.name,
        snapshot.experiment,
        snapshot.status.as_str(),
        snapshot.last_seq
    );
    if let Some(run) = &snapshot.pipeline {
        println!(
            "  pipeline {} {} step {}/{}",
            run.pipeline,
            run.state.as_str(),
            run.next_step.min(run.steps.len()),
            run.steps.len()
        );
    }
    print_tasks(&snapshot.tasks);
    for event in &snapshot.recent_events {
        print_event(event);
    }
}

fn format_ms(timestamp_ms: u64) -> String {
    let nanos = i128::from(timestamp_ms) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|time| time.format(&Rfc3339).ok())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn outcome_label(outcome: assay_core::models::EventOutcome) -> &'static str {
    use assay_core::models::EventOutcome;
    match outcome {
        EventOutcome::Succeeded => "succeeded",
        EventOutcome::Failed => "failed",
        EventOutcome::TimedOut => "timed_out",
        EventOutcome::Cancelled => "cancelled",
        EventOutcome::ProvenanceFailed => "provenance_failed",
    }
}

fn default_name(location: &str) -> String {
    std::path::Path::new(location.trim_end_matches('/'))
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| location.to_string())
}

fn describe(error: &CoreError) -> String {
    let mut context = Vec::new();
    if let Some(experiment) = &error.experiment {
        context.push(format!("experiment={experiment}"));
    }
    if let Some(skill) = &error.skill {
        context.push(format!("skill={skill}"));
    }
    if let Some(task) = &error.task {
        context.push(format!("task={task}"));
    }
    if context.is_empty() {
        format!("{:?}: {}", error.kind, error.message)
    } else {
        format!("{:?} [{}]: {}", error.kind, context.join(" "), error.message)
    }
}

fn error_exit_code(error: &CoreError) -> u8 {
    match error.kind {
        CoreErrorKind::Timeout => 124,
        CoreErrorKind::Cancelled => 130,
        CoreErrorKind::ValidationError
        | CoreErrorKind::InvalidTransition
        | CoreErrorKind::ConfigError => 2,
        _ => 1,
    }
}

fn parse_status(raw: &str) -> Result<ExperimentStatus, CoreError> {
    raw.parse::<ExperimentStatus>().map_err(|_| {
        CoreError::new(
            CoreErrorKind::ValidationError,
            format!("unknown experiment status '{raw}'"),
        )
    })
}

/// Exit code for a dispatch or pipeline that ran but did not succeed.
/// Interruptions and timeouts keep their conventional codes; otherwise the
/// skill's own nonzero exit code is passed through.
fn failure_exit_code(failure: Option<&CoreError>, exit_code: Option<i32>) -> u8 {
    if let Some(error) = failure
        && matches!(error.kind, CoreErrorKind::Cancelled | CoreErrorKind::Timeout)
    {
        return error_exit_code(error);
    }
    match exit_code.and_then(|code| u8::try_from(code).ok()) {
        Some(0) | None => 1,
        Some(code) => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_work_exits_like_an_interrupt() {
        let cancelled = CoreError::new(CoreErrorKind::Cancelled, "skill 'qc' was cancelled");
        assert_eq!(failure_exit_code(Some(&cancelled), None), 130);
        // A skill killed mid-run may still report its own status.
        assert_eq!(failure_exit_code(Some(&cancelled), Some(143)), 130);
        assert_eq!(error_exit_code(&cancelled), 130);
    }

    #[test]
    fn skill_exit_codes_pass_through_failures() {
        let failed = CoreError::new(CoreErrorKind::ExecutionFailure, "exit code 3");
        assert_eq!(failure_exit_code(Some(&failed), Some(3)), 3);
        assert_eq!(failure_exit_code(Some(&failed), Some(0)), 1);
        assert_eq!(failure_exit_code(Some(&failed), Some(-9)), 1);
        assert_eq!(failure_exit_code(None, None), 1);

        let timed_out = CoreError::new(CoreErrorKind::Timeout, "exceeded 30s");
        assert_eq!(failure_exit_code(Some(&timed_out), None), 124);
    }

    #[test]
    fn status_changes_parse_from_the_command_line() {
        let cli = Cli::try_parse_from(["assay", "archive", "exp-1", "--reason", "retired"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Archive { ref experiment, reason: Some(ref reason) }
                if experiment == "exp-1" && reason == "retired"
        ));

        let cli = Cli::try_parse_from(["assay", "set-status", "exp-1", "qc_complete"]).unwrap();
        let Commands::SetStatus { status, .. } = cli.command else {
            panic!("expected set-status");
        };
        assert_eq!(parse_status(&status).unwrap(), ExperimentStatus::QcComplete);
        assert_eq!(
            parse_status("finished").unwrap_err().kind,
            CoreErrorKind::ValidationError
        );
    }
}
