use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::info;

use crate::config::Config;
use crate::database::Database;
use crate::error::QuickTodoError;
use crate::notifications::ConsoleNotificationSink;
use crate::reminder_service::ReminderService;
use crate::scheduler::{ReconcileMode, ScheduledAlarm};
use crate::tasks::{DueChange, NewTask, Task, TaskScope, TaskStore, TaskUpdate};
use crate::utils::Utils;

#[derive(Parser)]
#[command(
    name = "quicktodo",
    version,
    about = "QuickTodo: a to-do list with due-date reminders"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the reminder service (default if no command specified)
    Serve,

    /// Add a task
    Add {
        title: String,

        /// Free-form note
        #[arg(long = "note", short = 'n', default_value = "")]
        note: String,

        /// Due date as local "YYYY-MM-DD HH:MM"
        #[arg(long = "due", short = 'd')]
        due: Option<String>,
    },

    /// Change a task's title, note or due date
    Edit {
        id: i64,

        #[arg(long = "title", short = 't')]
        title: Option<String>,

        #[arg(long = "note", short = 'n')]
        note: Option<String>,

        /// New due date as local "YYYY-MM-DD HH:MM" (conflicts with "clear-due")
        #[arg(long = "due", short = 'd', conflicts_with = "clear_due")]
        due: Option<String>,

        /// Remove the due date
        #[arg(long = "clear-due", default_value_t = false)]
        clear_due: bool,
    },

    /// Mark a task completed
    Done { id: i64 },

    /// Mark a completed task open again
    Reopen { id: i64 },

    /// Delete a task
    Delete { id: i64 },

    /// List tasks, open and dated first
    List {
        /// Print JSON instead of a table
        #[arg(long = "json", default_value_t = false)]
        json: bool,

        /// Restrict to a task reference such as "quicktodo://todos/7"
        #[arg(long = "uri")]
        uri: Option<String>,
    },

    /// Delete all completed tasks
    Purge,

    /// Show the alarms the reminder service keeps for each task
    Alarms,
}

impl Cli {
    pub fn handle_command_line(project_dirs: &ProjectDirs) -> Result<(), QuickTodoError> {
        let args = Cli::parse();
        let config = Config::get();
        let db_dir = config.database_dir(project_dirs);

        // Default to Serve if no command specified
        match args.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::serve(Database::open(&db_dir)?, config),
            command => {
                let store = TaskStore::new(Database::open(&db_dir)?);
                Self::run_task_command(&store, command, config)
            }
        }
    }

    fn serve(db: Database, config: &Config) -> Result<(), QuickTodoError> {
        info!("Starting reminder service on {}", db.db_path().display());

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| QuickTodoError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let service = ReminderService::new(
                db,
                config.notifications,
                Duration::from_secs(config.scheduler.poll_interval_secs()),
                Arc::new(ConsoleNotificationSink),
            )?;
            service.spawn_console_input();
            service.run(shutdown_signal()).await
        })
    }

    fn run_task_command(
        store: &TaskStore,
        command: Command,
        config: &Config,
    ) -> Result<(), QuickTodoError> {
        match command {
            Command::Serve => {
                return Err(QuickTodoError::Error("serve is not a task command".to_string()))
            }
            Command::Add { title, note, due } => {
                let due_at = due.as_deref().map(Utils::parse_local_due).transpose()?;
                let task = store.create(NewTask { title, note, due_at })?;
                println!("Added task {}", task.id);
            }
            Command::Edit {
                id,
                title,
                note,
                due,
                clear_due,
            } => {
                let due = match (due, clear_due) {
                    (Some(due), _) => Some(DueChange::Set(Utils::parse_local_due(&due)?)),
                    (None, true) => Some(DueChange::Clear),
                    (None, false) => None,
                };
                let task = store.update(
                    id,
                    TaskUpdate {
                        title,
                        note,
                        due,
                        completed: None,
                    },
                )?;
                println!("Updated task {}", task.id);
            }
            Command::Done { id } => {
                store.set_completed(id, true)?;
                println!("Completed task {}", id);
            }
            Command::Reopen { id } => {
                store.set_completed(id, false)?;
                println!("Reopened task {}", id);
            }
            Command::Delete { id } => {
                if !store.delete(id)? {
                    return Err(QuickTodoError::NotFound(id));
                }
                println!("Deleted task {}", id);
            }
            Command::List { json, uri } => {
                let scope = match uri {
                    Some(uri) => TaskScope::from_uri(&uri)?,
                    None => TaskScope::All,
                };
                let tasks = store.query(scope)?;
                if json {
                    let out = serde_json::to_string_pretty(&tasks)
                        .map_err(|e| QuickTodoError::Error(e.to_string()))?;
                    println!("{}", out);
                } else {
                    print_tasks(&tasks);
                }
            }
            Command::Purge => {
                let count = store.purge_completed()?;
                println!("Purged {} completed task(s)", count);
            }
            Command::Alarms => {
                let remind_before = config.notifications.remind_before_millis();
                let now = Utils::now_millis();
                store.for_each_task(|task| {
                    let plan = ScheduledAlarm::plan(task, ReconcileMode::Rearm, remind_before, now);
                    for alarm in plan {
                        if alarm.kind.is_timer() {
                            println!(
                                "{:<16} {}  {}",
                                alarm.key().to_string(),
                                Utils::format_local_millis(alarm.fire_at),
                                task.title
                            );
                        }
                    }
                    Ok(())
                })?;
            }
        }
        Ok(())
    }
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks");
        return;
    }

    println!("{:>5}  {:<4}  {:<16}  Title", "Id", "Done", "Due");
    for task in tasks {
        let due = if task.has_due_date {
            Utils::format_local_millis(task.due_at)
        } else {
            "-".to_string()
        };
        println!(
            "{:>5}  {:<4}  {:<16}  {}",
            task.id,
            if task.completed { "x" } else { "" },
            due,
            task.title
        );
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            log::info!("Received SIGTERM");
        },
    }
    println!("\n🛑 Shutdown signal received - stopping reminder service...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_store;
    use clap::Parser;

    #[test]
    fn test_cli_parsing_no_command_defaults_to_serve() {
        let result = Cli::try_parse_from(["quicktodo"]);
        assert!(result.is_ok(), "Should accept no command");

        let cli = result.unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or(Command::Serve), Command::Serve));
    }

    #[test]
    fn test_cli_parsing_add_with_due() {
        let cli = Cli::try_parse_from([
            "quicktodo",
            "add",
            "Buy milk",
            "--due",
            "2031-01-02 08:00",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Add { title, note, due }) => {
                assert_eq!(title, "Buy milk");
                assert_eq!(note, "");
                assert_eq!(due.as_deref(), Some("2031-01-02 08:00"));
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_cli_parsing_edit_due_conflicts_with_clear() {
        let result = Cli::try_parse_from([
            "quicktodo",
            "edit",
            "3",
            "--due",
            "2031-01-02 08:00",
            "--clear-due",
        ]);
        assert!(result.is_err(), "Should reject --due with --clear-due");

        let cli = Cli::try_parse_from(["quicktodo", "edit", "3", "--clear-due"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Edit { id: 3, clear_due: true, .. })));
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        let result = Cli::try_parse_from(["quicktodo", "nonexistent-command"]);
        assert!(result.is_err(), "Should reject unknown commands");

        let result = Cli::try_parse_from(["quicktodo", "done", "not-a-number"]);
        assert!(result.is_err(), "Should reject non-numeric ids");
    }

    #[test]
    fn test_task_commands_mutate_store() {
        let (_dir, store) = temp_store();
        let config = Config::default_config();

        Cli::run_task_command(
            &store,
            Command::Add {
                title: "Write report".into(),
                note: String::new(),
                due: Some("2031-01-02 08:00".into()),
            },
            &config,
        )
        .unwrap();
        let task = store.query(TaskScope::All).unwrap().remove(0);
        assert!(task.has_due_date);

        Cli::run_task_command(
            &store,
            Command::Edit {
                id: task.id,
                title: None,
                note: None,
                due: None,
                clear_due: true,
            },
            &config,
        )
        .unwrap();
        assert!(!store.get(task.id).unwrap().unwrap().has_due_date);

        Cli::run_task_command(&store, Command::Done { id: task.id }, &config).unwrap();
        assert!(store.get(task.id).unwrap().unwrap().completed);

        let list_one = Command::List {
            json: true,
            uri: Some(format!("quicktodo://todos/{}", task.id)),
        };
        Cli::run_task_command(&store, list_one, &config).unwrap();
        let list_foreign = Command::List {
            json: false,
            uri: Some("http://elsewhere".into()),
        };
        let err = Cli::run_task_command(&store, list_foreign, &config).unwrap_err();
        assert!(matches!(err, QuickTodoError::Error(_)));

        Cli::run_task_command(&store, Command::Delete { id: task.id }, &config).unwrap();
        let err =
            Cli::run_task_command(&store, Command::Delete { id: task.id }, &config).unwrap_err();
        assert!(matches!(err, QuickTodoError::NotFound(_)));
    }

    #[test]
    fn test_purge_removes_completed_only() {
        let (_dir, store) = temp_store();
        let create = |title: &str| {
            store
                .create(NewTask {
                    title: title.to_string(),
                    ..Default::default()
                })
                .unwrap()
        };
        let open = create("open");
        let done = create("done");
        store.set_completed(done.id, true).unwrap();

        Cli::run_task_command(&store, Command::Purge, &Config::default_config()).unwrap();
        assert!(store.get(open.id).unwrap().is_some());
        assert!(store.get(done.id).unwrap().is_none());
    }

    #[test]
    fn test_bad_due_date_is_rejected() {
        let (_dir, store) = temp_store();
        let result = Cli::run_task_command(
            &store,
            Command::Add {
                title: "Bad".into(),
                note: String::new(),
                due: Some("next tuesday".into()),
            },
            &Config::default_config(),
        );
        assert!(result.is_err());
        assert!(store.query(TaskScope::All).unwrap().is_empty());
    }
}
