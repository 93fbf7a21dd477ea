//! followup CLI: operator interface to the follow-up engine.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use followup_engine::audit::AuditSink;
use followup_engine::config::Config;
use followup_engine::config::secrets::ExposeSecret;
use followup_engine::db::{Db, FollowUpFilter};
use followup_engine::engine::{EscalationScanner, QueueWorker, Schedule, Supervisor};
use followup_engine::lifecycle::Lifecycle;
use followup_engine::mailer;
use followup_engine::model::*;
use followup_engine::tasks::{EventData, EventType, TaskGenerator, TaskService};
use followup_engine::telemetry::{TelemetryConfig, init_telemetry};
use std::sync::Arc;
use tracing::warn;

#[derive(Parser)]
#[command(name = "followup", about = "Follow-up lifecycle and notification delivery")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scanners, the queue worker and the task sweep until Ctrl-C
    Serve,
    /// Follow-up operations
    Followup {
        #[command(subcommand)]
        action: FollowupAction,
    },
    /// Run one escalation scan now
    Escalate,
    /// Run one reminder scan now
    Reminders,
    /// Delivery queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Derived task operations
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Add or update a user directory entry
    User {
        id: UserId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// member | manager
        #[arg(long, default_value = "member")]
        role: Role,
    },
}

#[derive(Subcommand)]
enum FollowupAction {
    /// Record an outbound communication to follow up on
    Create {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        client: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        doc_type: Option<String>,
        /// Originating document or application reference
        #[arg(long)]
        origin: Option<String>,
        /// When the communication went out (RFC 3339). Defaults to now.
        #[arg(long)]
        sent_at: Option<DateTime<Utc>>,
    },
    /// Move to the next attempt
    Snooze {
        id: FollowUpId,
        #[arg(long)]
        user: UserId,
    },
    /// Close a follow-up
    Complete {
        id: FollowUpId,
        #[arg(long)]
        user: UserId,
        /// client_responded | signed | paid | cancelled | other
        #[arg(long, default_value = "client_responded")]
        reason: CompletionReason,
    },
    /// Give up on an overdue third attempt
    NoResponse {
        id: FollowUpId,
        #[arg(long)]
        user: UserId,
    },
    /// Close and start over at attempt 1
    Resend {
        id: FollowUpId,
        #[arg(long)]
        user: UserId,
    },
    /// Counts for one user
    Stats {
        #[arg(long)]
        user: UserId,
    },
    /// List follow-ups
    List {
        #[arg(long)]
        user: Option<UserId>,
        #[arg(long)]
        status: Option<FollowUpStatus>,
        /// Only pending follow-ups past due
        #[arg(long)]
        overdue: bool,
        /// Substring of the client name
        #[arg(long)]
        client: Option<String>,
        /// Escalated to this manager
        #[arg(long)]
        manager: Option<UserId>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a follow-up and its history
    Show {
        id: FollowUpId,
        #[arg(long)]
        user: UserId,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Run one delivery cycle now
    Process {
        #[arg(long)]
        batch: Option<i64>,
    },
    /// Suppress a pending notification
    Cancel { notification_id: String },
    /// Row counts per status
    Stats,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Apply a business event: auto-complete and generate tasks
    Event {
        event: EventType,
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        client: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        doc_type: Option<String>,
        #[arg(long)]
        application: Option<String>,
        #[arg(long)]
        urgency: Option<String>,
        #[arg(long)]
        attempt: Option<u8>,
        #[arg(long)]
        sent_at: Option<DateTime<Utc>>,
    },
    /// List a user's tasks
    List {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Move a task to a new status
    Move {
        id: TaskId,
        #[arg(long)]
        user: UserId,
        /// in_progress | completed | dismissed
        to: TaskStatus,
    },
    /// Expire tasks overdue beyond the grace window
    Expire,
}

/// Shared handles for one CLI invocation.
struct App {
    config: Config,
    db: Arc<Db>,
    audit: Arc<dyn AuditSink>,
    tasks: Arc<TaskService>,
}

impl App {
    async fn connect(config: Config) -> anyhow::Result<Self> {
        let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
        db.migrate().await?;
        let audit: Arc<dyn AuditSink> = db.clone();
        let tasks = Arc::new(TaskService::new(
            Arc::clone(&db),
            TaskGenerator::new(config.tasks.no_response_min_elapsed),
        ));
        Ok(Self {
            config,
            db,
            audit,
            tasks,
        })
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::new(
            Arc::clone(&self.db),
            self.config.timing_profile,
            Arc::clone(&self.audit),
        )
        .with_tasks(Arc::clone(&self.tasks))
        .with_deadline(self.config.operation_timeout)
    }

    fn scanner(&self) -> EscalationScanner {
        EscalationScanner::new(
            Arc::clone(&self.db),
            self.config.timing_profile,
            Arc::clone(&self.audit),
        )
        .with_tasks(Arc::clone(&self.tasks))
        .with_max_attempts(self.config.queue.max_attempts)
    }

    fn worker(&self) -> anyhow::Result<QueueWorker> {
        let mailer = mailer::from_config(&self.config.mail)?;
        if mailer.is_none() {
            warn!("MAIL_API_KEY is not set; queue worker will not send");
        }
        Ok(QueueWorker::new(
            Arc::clone(&self.db),
            mailer,
            self.config.queue.clone(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::new(
        config.otel_endpoint.clone(),
        config.log_level.clone(),
    ))?;
    let app = App::connect(config).await?;

    match cli.command {
        Command::Serve => cmd_serve(&app).await,
        Command::Followup { action } => cmd_followup(&app, action).await,
        Command::Escalate => {
            let report = app.scanner().scan_and_escalate(Utc::now()).await?;
            println!(
                "examined {}, escalated {}, closed {}, skipped {}, failed {}",
                report.examined, report.notified, report.closed, report.skipped, report.failed
            );
            Ok(())
        }
        Command::Reminders => {
            let report = app.scanner().scan_due_reminders(Utc::now()).await?;
            println!(
                "examined {}, reminded {}, skipped {}, failed {}",
                report.examined, report.notified, report.skipped, report.failed
            );
            Ok(())
        }
        Command::Queue { action } => cmd_queue(&app, action).await,
        Command::Tasks { action } => cmd_tasks(&app, action).await,
        Command::User {
            id,
            name,
            email,
            role,
        } => {
            app.db
                .upsert_user(&User {
                    id,
                    name,
                    email,
                    role,
                })
                .await?;
            println!("Saved user {id} ({role})");
            Ok(())
        }
    }
}

async fn cmd_serve(app: &App) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(
        Arc::new(app.scanner()),
        Arc::new(app.worker()?),
        Arc::clone(&app.tasks),
        Schedule::from_config(&app.config),
    );
    let running = supervisor.start();

    tokio::signal::ctrl_c().await?;
    running.shutdown().await;
    Ok(())
}

async fn cmd_followup(app: &App, action: FollowupAction) -> anyhow::Result<()> {
    let lifecycle = app.lifecycle();
    match action {
        FollowupAction::Create {
            user,
            subject,
            client,
            email,
            doc_type,
            origin,
            sent_at,
        } => {
            let mut new = NewFollowUp::new(user, subject, client);
            if let Some(email) = email {
                new = new.client_email(email);
            }
            if let Some(doc_type) = doc_type {
                new = new.document_type(doc_type);
            }
            if let Some(origin) = origin {
                new = new.origin_ref(origin);
            }
            if let Some(at) = sent_at {
                new = new.sent_at(at);
            }
            let followup = lifecycle.create(new).await?;
            println!("Created: {} (due {})", followup.id, followup.due_at);
        }
        FollowupAction::Snooze { id, user } => {
            let followup = lifecycle.snooze(id, user).await?;
            println!(
                "Snoozed: {} attempt {} (due {})",
                followup.id, followup.attempt, followup.due_at
            );
        }
        FollowupAction::Complete { id, user, reason } => {
            let followup = lifecycle.complete(id, user, reason).await?;
            println!("Completed: {} ({reason})", followup.id);
        }
        FollowupAction::NoResponse { id, user } => {
            let followup = lifecycle.mark_no_response(id, user).await?;
            println!("No response: {}", followup.id);
        }
        FollowupAction::Resend { id, user } => {
            let fresh = lifecycle.resend(id, user).await?;
            println!("Resent: {id} -> {} (due {})", fresh.id, fresh.due_at);
        }
        FollowupAction::Stats { user } => {
            let stats = lifecycle.stats(user).await?;
            println!("Pending:      {}", stats.pending);
            println!("Overdue:      {}", stats.overdue);
            println!("Due today:    {}", stats.due_today);
            println!("Completed:    {}", stats.completed);
            println!("No response:  {}", stats.no_response);
        }
        FollowupAction::List {
            user,
            status,
            overdue,
            client,
            manager,
            limit,
        } => {
            let mut filter = FollowUpFilter {
                user_id: user,
                ..FollowUpFilter::default()
            }
            .limit(limit);
            if let Some(status) = status {
                filter = filter.status(status);
            }
            if overdue {
                filter = filter.overdue_at(Utc::now());
            }
            if let Some(client) = client {
                filter = filter.client_name(client);
            }
            if let Some(manager) = manager {
                filter = filter.manager(manager);
            }
            print_followups(&lifecycle.list(&filter).await?);
        }
        FollowupAction::Show { id, user } => {
            let followup = lifecycle.get(id, user).await?;
            let history = lifecycle.history(id, user).await?;
            print_followup(&followup);
            println!("---");
            for entry in &history {
                println!(
                    "{}  {:<18}  {:>11} -> {:<11}  {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.action,
                    entry.previous_status.map(|s| s.to_string()).unwrap_or("-".to_string()),
                    entry.new_status.map(|s| s.to_string()).unwrap_or("-".to_string()),
                    entry.note.as_deref().unwrap_or(""),
                );
            }
        }
    }
    Ok(())
}

async fn cmd_queue(app: &App, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::Process { batch } => {
            let worker = app.worker()?;
            let report = worker
                .process_once(batch.unwrap_or(app.config.queue.batch_size))
                .await?;
            match report.skipped {
                Some(reason) => println!("Skipped: {reason:?}"),
                None => println!(
                    "claimed {}, sent {}, retried {}, failed {}, lost {}",
                    report.claimed, report.sent, report.retried, report.failed, report.lost
                ),
            }
        }
        QueueAction::Cancel { notification_id } => {
            if app.db.cancel_notification(&notification_id).await? {
                println!("Cancelled: {notification_id}");
            } else {
                let current = app.db.get_notification(&notification_id).await?;
                println!("Not cancelled: {notification_id} is {}", current.status);
            }
        }
        QueueAction::Stats => {
            for (status, count) in app.db.queue_counts().await? {
                println!("{status:<11} {count}");
            }
        }
    }
    Ok(())
}

async fn cmd_tasks(app: &App, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::Event {
            event,
            user,
            client,
            subject,
            doc_type,
            application,
            urgency,
            attempt,
            sent_at,
        } => {
            let data = EventData {
                client_name: client,
                subject,
                document_type: doc_type,
                application_id: application,
                urgency,
                attempt,
                sent_at,
                followup_id: None,
            };
            let outcome = app.tasks.apply_event(user, event, &data, Utc::now()).await?;
            println!("Completed {} task(s)", outcome.completed);
            if let Some(task) = outcome.created {
                println!("Created: {} \"{}\" ({}, due {})", task.id, task.title, task.priority, task.due_at);
            }
        }
        TaskAction::List { user, status } => {
            let tasks = app.tasks.list(user, status).await?;
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }
            println!(
                "{:<8}  {:<11}  {:<7}  {:<16}  TITLE",
                "ID", "STATUS", "PRI", "DUE"
            );
            println!("{}", "-".repeat(90));
            for task in &tasks {
                println!(
                    "{:<8}  {:<11}  {:<7}  {:<16}  {}",
                    &task.id.to_string()[..8],
                    task.status,
                    task.priority,
                    task.due_at.format("%Y-%m-%d %H:%M"),
                    task.title
                );
            }
            println!("\n{} task(s)", tasks.len());
        }
        TaskAction::Move { id, user, to } => {
            let task = app.tasks.transition(id, user, to).await?;
            println!("Task {} is now {}", task.id, task.status);
        }
        TaskAction::Expire => {
            let expired = app
                .tasks
                .expire_overdue(Utc::now(), app.config.tasks.expiry_grace)
                .await?;
            println!("Expired {expired} task(s)");
        }
    }
    Ok(())
}

fn print_followups(items: &[FollowUp]) {
    if items.is_empty() {
        println!("No follow-ups found.");
        return;
    }
    println!(
        "{:<8}  {:<11}  {:<3}  {:<16}  {:<24}  SUBJECT",
        "ID", "STATUS", "ATT", "DUE", "CLIENT"
    );
    println!("{}", "-".repeat(100));
    for f in items {
        let client: String = f.client_name.chars().take(24).collect();
        println!(
            "{:<8}  {:<11}  {:<3}  {:<16}  {:<24}  {}",
            &f.id.to_string()[..8],
            f.status,
            f.attempt,
            f.due_at.format("%Y-%m-%d %H:%M"),
            client,
            f.subject
        );
    }
    println!("\n{} follow-up(s)", items.len());
}

fn print_followup(f: &FollowUp) {
    println!("ID:          {}", f.id);
    println!("User:        {}", f.user_id);
    println!("Subject:     {}", f.subject);
    println!("Client:      {}", f.client_name);
    println!("Email:       {}", f.client_email.as_deref().unwrap_or("-"));
    println!("Document:    {}", f.document_type.as_deref().unwrap_or("-"));
    println!("Origin:      {}", f.origin_ref.as_deref().unwrap_or("-"));
    println!("Status:      {}", f.status);
    println!("Attempt:     {} of 3", f.attempt);
    println!("Sent:        {}", f.sent_at);
    println!("Due:         {}", f.due_at);
    if let Some(reason) = f.completed_reason {
        println!("Completed:   {} ({reason})", f.completed_at.map(|t| t.to_string()).unwrap_or_default());
    }
    if f.escalated {
        println!(
            "Escalated:   {} to {}",
            f.escalated_at.map(|t| t.to_string()).unwrap_or_default(),
            f.manager_id.map(|m| m.to_string()).unwrap_or("-".to_string())
        );
    }
    if let Some(from) = f.resent_from {
        println!("Resent from: {from}");
    }
}
