//! Interactive console
//!
//! Any line not starting with `:` is run on every host. `:name args...` runs
//! a console command; names may be shortened to any unique prefix, and a
//! name that is not a command but resolves to a host shows that host's
//! latest job (`:web1` is `:show web1`).

use crossterm::style::Stylize;
use shoal_core::{HostSpec, Result, ShoalError};
use shoal_orchestrator::{Fleet, InteractiveBridge, JobDispatcher, JobRecord, JoinOutcome};
use shoal_ssh::SshTransport;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tracing::debug;

use crate::format::{error_prefix, format_columns, host_label, render_job, status_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Add,
    Clear,
    Help,
    History,
    Join,
    Kill,
    List,
    Quit,
    Remove,
    Show,
    Status,
    Timeout,
}

#[derive(Debug)]
struct CommandSpec {
    kind: CommandKind,
    name: &'static str,
    usage: &'static str,
    help: &'static str,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        kind: CommandKind::Add,
        name: "add",
        usage: ":add <host>...",
        help: "Add hosts to the host list and connect to them.",
    },
    CommandSpec {
        kind: CommandKind::Clear,
        name: "clear",
        usage: ":clear [<host>...]",
        help: "Forget job history for the given hosts, or for all hosts.",
    },
    CommandSpec {
        kind: CommandKind::Help,
        name: "help",
        usage: ":help [<command>...]",
        help: "Show help for all commands or the given ones.",
    },
    CommandSpec {
        kind: CommandKind::History,
        name: "history",
        usage: ":history <host>",
        help: "List every job run on a host.",
    },
    CommandSpec {
        kind: CommandKind::Join,
        name: "join",
        usage: ":join <host>",
        help: "Attach the terminal to a host's pending job. Ctrl-] ? lists escapes.",
    },
    CommandSpec {
        kind: CommandKind::Kill,
        name: "kill",
        usage: ":kill <host>...",
        help: "Stop waiting on a host's pending job and close its channel.",
    },
    CommandSpec {
        kind: CommandKind::List,
        name: "list",
        usage: ":list",
        help: "List hosts with their connection state.",
    },
    CommandSpec {
        kind: CommandKind::Quit,
        name: "quit",
        usage: ":quit",
        help: "Stop all jobs, disconnect and exit.",
    },
    CommandSpec {
        kind: CommandKind::Remove,
        name: "remove",
        usage: ":remove <host>...",
        help: "Disconnect hosts and drop them from the host list.",
    },
    CommandSpec {
        kind: CommandKind::Show,
        name: "show",
        usage: ":show <host> [<n>]",
        help: "Show the output of a host's latest job, or of job <n> (negative counts back).",
    },
    CommandSpec {
        kind: CommandKind::Status,
        name: "status",
        usage: ":status",
        help: "Show the exit status of each host's latest job.",
    },
    CommandSpec {
        kind: CommandKind::Timeout,
        name: "timeout",
        usage: ":timeout [<seconds>]",
        help: "Show or set how long to wait on each host before returning to the prompt.",
    },
];

/// Result of looking a command name up in the table
#[derive(Debug)]
enum Lookup {
    Found(&'static CommandSpec),
    Ambiguous(Vec<&'static CommandSpec>),
    Unknown,
}

fn lookup(name: &str) -> Lookup {
    if let Some(spec) = COMMANDS.iter().find(|c| c.name == name) {
        return Lookup::Found(spec);
    }

    let matches: Vec<&'static CommandSpec> =
        COMMANDS.iter().filter(|c| c.name.starts_with(name)).collect();
    match matches.len() {
        0 => Lookup::Unknown,
        1 => Lookup::Found(matches[0]),
        _ => Lookup::Ambiguous(matches),
    }
}

fn help_text(spec: &CommandSpec) -> String {
    format!("{}\n    {}", spec.usage, spec.help)
}

/// One line of console input
#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Empty,
    /// Run on every host
    Broadcast(&'a str),
    Command { name: &'a str, args: Vec<&'a str> },
}

fn parse_line(line: &str) -> Line<'_> {
    let line = line.trim();
    match line.strip_prefix(':') {
        Some(rest) => {
            let mut words = rest.split_whitespace();
            match words.next() {
                Some(name) => Line::Command {
                    name,
                    args: words.collect(),
                },
                None => Line::Empty,
            }
        }
        None if line.is_empty() => Line::Empty,
        None => Line::Broadcast(line),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Pick a job out of a host's history. `None` means the latest.
fn select_job(jobs: &[Arc<JobRecord>], index: Option<i64>) -> Option<Arc<JobRecord>> {
    let len = jobs.len() as i64;
    let position = match index {
        None => len - 1,
        Some(i) if i < 0 => len + i,
        Some(i) => i,
    };
    if (0..len).contains(&position) {
        jobs.get(position as usize).cloned()
    } else {
        None
    }
}

/// Interactive read-eval loop over a [`Fleet`]
pub struct Console<T> {
    fleet: Arc<Fleet<T>>,
    dispatcher: JobDispatcher<T>,
    bridge: InteractiveBridge<T>,
    prompt: String,
}

impl<T: SshTransport + 'static> Console<T> {
    pub fn new(fleet: Arc<Fleet<T>>, prompt: impl Into<String>) -> Self {
        Self {
            dispatcher: JobDispatcher::new(fleet.clone()),
            bridge: InteractiveBridge::new(fleet.clone()),
            fleet,
            prompt: prompt.into(),
        }
    }

    /// Read and run lines until `:quit` or end of input, then shut down
    pub async fn run(&self) -> Result<()> {
        let mut stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut line = String::new();

        loop {
            stdout.write_all(self.prompt.as_bytes()).await?;
            stdout.flush().await?;

            line.clear();
            if stdin.read_line(&mut line).await? == 0 {
                println!();
                break;
            }

            match self.execute(&line, &mut stdin).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(e) => eprintln!("{} Error issuing command: {}", error_prefix(), e),
            }
        }

        self.dispatcher.shutdown().await;
        Ok(())
    }

    async fn execute(&self, line: &str, stdin: &mut BufReader<Stdin>) -> Result<Flow> {
        match parse_line(line) {
            Line::Empty => Ok(Flow::Continue),
            Line::Broadcast(command) => {
                self.dispatcher.run_all(command).await;
                Ok(Flow::Continue)
            }
            Line::Command { name, args } => match lookup(name) {
                Lookup::Found(spec) => {
                    match self.command(spec.kind, &args, stdin).await {
                        Err(e) if e.is_usage() => {
                            println!("{}", help_text(spec));
                            Ok(Flow::Continue)
                        }
                        other => other,
                    }
                }
                Lookup::Ambiguous(candidates) => {
                    println!("Ambiguous command: {}", name);
                    for spec in candidates {
                        println!("{}", help_text(spec));
                    }
                    Ok(Flow::Continue)
                }
                Lookup::Unknown => match self.fleet.registry().resolve(name) {
                    Ok(_) => {
                        self.show(name, args.first().copied())?;
                        Ok(Flow::Continue)
                    }
                    Err(e) if e.is_resolution() => {
                        println!("Unknown command: {} (try :help)", name);
                        Ok(Flow::Continue)
                    }
                    Err(e) => Err(e),
                },
            },
        }
    }

    async fn command(
        &self,
        kind: CommandKind,
        args: &[&str],
        stdin: &mut BufReader<Stdin>,
    ) -> Result<Flow> {
        debug!("Console command {:?} {:?}", kind, args);

        match kind {
            CommandKind::Add => {
                require_args(args)?;
                for spec in args {
                    match self.fleet.add_host(spec).await {
                        Ok(host) => println!("Added {}", host),
                        Err(ShoalError::DuplicateHost(host)) => {
                            println!("{} already in host list", host)
                        }
                        Err(e) => report(e),
                    }
                }
            }
            CommandKind::Remove => {
                require_args(args)?;
                for reference in args {
                    match self.fleet.remove_host(reference).await {
                        Ok(host) => println!("Removed {}", host),
                        Err(e) => report(e),
                    }
                }
            }
            CommandKind::List => println!("{}", self.render_list().await),
            CommandKind::Status => println!("{}", self.render_status()),
            CommandKind::Show => match args {
                [reference] => self.show(reference, None)?,
                [reference, index] => self.show(reference, Some(*index))?,
                _ => return Err(ShoalError::Usage(":show <host> [<n>]".to_string())),
            },
            CommandKind::History => match args {
                [reference] => println!("{}", self.render_history(reference)?),
                _ => return Err(ShoalError::Usage(":history <host>".to_string())),
            },
            CommandKind::Join => match args {
                [reference] => self.join(reference, stdin).await?,
                _ => return Err(ShoalError::Usage(":join <host>".to_string())),
            },
            CommandKind::Kill => {
                require_args(args)?;
                for reference in args {
                    match self.dispatcher.kill(reference) {
                        Ok(host) => println!("Stop requested for {}", host),
                        Err(ShoalError::NoPendingJob(host)) => {
                            println!("{} has no pending jobs.", host)
                        }
                        Err(e) => report(e),
                    }
                }
            }
            CommandKind::Timeout => match args {
                [] => println!("Job timeout: {:?}", self.fleet.job_timeout()),
                [seconds] => {
                    let seconds: f64 = seconds
                        .parse()
                        .map_err(|_| ShoalError::Usage(format!("not a number: {}", seconds)))?;
                    let timeout = self.fleet.set_job_timeout(seconds);
                    println!("Job timeout: {:?}", timeout);
                }
                _ => return Err(ShoalError::Usage(":timeout [<seconds>]".to_string())),
            },
            CommandKind::Clear => {
                if args.is_empty() {
                    self.fleet.clear_all_history();
                    println!("Cleared job history for all hosts");
                }
                for reference in args {
                    match self.fleet.clear_history(reference) {
                        Ok(host) => println!("Cleared job history for {}", host),
                        Err(e) => report(e),
                    }
                }
            }
            CommandKind::Help => {
                if args.is_empty() {
                    for spec in COMMANDS {
                        println!("{}", help_text(spec));
                    }
                    println!("Any other line is run on every host.");
                }
                for name in args {
                    match lookup(name) {
                        Lookup::Found(spec) => println!("{}", help_text(spec)),
                        Lookup::Ambiguous(candidates) => {
                            for spec in candidates {
                                println!("{}", help_text(spec));
                            }
                        }
                        Lookup::Unknown => println!("No such command: {}", name),
                    }
                }
            }
            CommandKind::Quit => return Ok(Flow::Quit),
        }

        Ok(Flow::Continue)
    }

    fn show(&self, reference: &str, index: Option<&str>) -> Result<()> {
        let index = match index {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| ShoalError::Usage(format!("not a job number: {}", raw)))?,
            ),
            None => None,
        };

        let (host, jobs) = self.fleet.jobs(reference)?;
        if jobs.is_empty() {
            return Err(ShoalError::NoJobs(host.to_string()));
        }
        let record = select_job(&jobs, index)
            .ok_or_else(|| ShoalError::Usage(format!("{} has {} job(s)", host, jobs.len())))?;

        if record.is_pending() {
            println!(
                "Job on {} is still pending; use :join {} to attach",
                host,
                reference
            );
            return Ok(());
        }

        println!("{}", render_job(&host, &record));
        Ok(())
    }

    async fn join(&self, reference: &str, stdin: &mut BufReader<Stdin>) -> Result<()> {
        let record = self.bridge.pending_job(reference)?;
        println!(
            "Joining {} ({}). Press Ctrl-] . to detach, Ctrl-] ? for help.",
            record.host(),
            record.command()
        );

        let mut stdout = tokio::io::stdout();
        let outcome = self.bridge.join(reference, stdin, &mut stdout).await?;
        match outcome {
            JoinOutcome::Detached | JoinOutcome::LocalEof => {
                println!("\nDetached from {}; job still running", record.host())
            }
            JoinOutcome::Disconnected => println!("\nClosed channel to {}", record.host()),
            JoinOutcome::RemoteClosed => println!("\nConnection to {} closed", record.host()),
        }
        Ok(())
    }

    async fn render_list(&self) -> String {
        let rows: Vec<Vec<String>> = self
            .fleet
            .list()
            .await
            .into_iter()
            .map(|row| {
                vec![
                    row.index.to_string(),
                    row.host,
                    if row.connected { "yes" } else { "no" }.to_string(),
                    row.jobs.to_string(),
                    status_text(row.last_status),
                    row.last_error.unwrap_or_default(),
                ]
            })
            .collect();
        format_columns(
            &["#", "host", "connected", "jobs", "last status", "last error"],
            &rows,
        )
    }

    fn render_status(&self) -> String {
        let rows: Vec<Vec<String>> = self
            .fleet
            .status()
            .into_iter()
            .enumerate()
            .map(|(index, (host, status))| {
                vec![index.to_string(), host.to_string(), status_text(status)]
            })
            .collect();
        format_columns(&["#", "host", "status"], &rows)
    }

    fn render_history(&self, reference: &str) -> Result<String> {
        let (host, jobs) = self.fleet.jobs(reference)?;
        if jobs.is_empty() {
            return Err(ShoalError::NoJobs(host.to_string()));
        }
        let rows: Vec<Vec<String>> = jobs
            .iter()
            .enumerate()
            .map(|(index, record)| {
                vec![
                    index.to_string(),
                    record.started_at().format("%Y-%m-%d %H:%M:%S").to_string(),
                    status_text(Some(record.status())),
                    record.command().to_string(),
                ]
            })
            .collect();
        Ok(format!(
            "{}\n{}",
            host_label(&host.to_string()),
            format_columns(&["#", "started", "status", "command"], &rows)
        ))
    }
}

fn require_args(args: &[&str]) -> Result<()> {
    if args.is_empty() {
        return Err(ShoalError::Usage("missing argument".to_string()));
    }
    Ok(())
}

fn report(error: ShoalError) {
    eprintln!("{} {}", error_prefix(), error.to_string().red());
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::ShoalConfig;
    use shoal_ssh::{MockCommand, MockHost, MockTransport};

    fn console(hosts: &[&str], transport: MockTransport) -> Console<MockTransport> {
        let config = ShoalConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        };
        Console::new(Fleet::new(transport, &config), "test $ ")
    }

    #[test]
    fn test_lookup_by_prefix() {
        assert!(matches!(lookup("quit"), Lookup::Found(spec) if spec.kind == CommandKind::Quit));
        assert!(matches!(lookup("q"), Lookup::Found(spec) if spec.kind == CommandKind::Quit));
        assert!(matches!(lookup("hist"), Lookup::Found(spec) if spec.kind == CommandKind::History));
        assert!(matches!(lookup("ti"), Lookup::Found(spec) if spec.kind == CommandKind::Timeout));
        assert!(matches!(lookup("web1"), Lookup::Unknown));

        match lookup("s") {
            Lookup::Ambiguous(candidates) => {
                let names: Vec<&str> = candidates.iter().map(|c| c.name).collect();
                assert_eq!(names, vec!["show", "status"]);
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
        assert!(matches!(lookup("h"), Lookup::Ambiguous(_)));
    }

    #[test]
    fn test_command_names_are_unique() {
        for (i, spec) in COMMANDS.iter().enumerate() {
            assert!(COMMANDS[i + 1..].iter().all(|other| other.name != spec.name));
            assert!(spec.usage.starts_with(&format!(":{}", spec.name)));
        }
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("   "), Line::Empty);
        assert_eq!(parse_line(":"), Line::Empty);
        assert_eq!(parse_line("uptime -p\n"), Line::Broadcast("uptime -p"));
        assert_eq!(
            parse_line(":show  web1 -2"),
            Line::Command {
                name: "show",
                args: vec!["web1", "-2"]
            }
        );
    }

    #[test]
    fn test_select_job() {
        let records: Vec<Arc<JobRecord>> = (0..3)
            .map(|i| {
                let (channel, _end) = shoal_ssh::exec_pair();
                JobRecord::new(HostSpec::from("web1"), format!("job {}", i), channel.writer())
            })
            .collect();

        assert_eq!(select_job(&records, None).unwrap().command(), "job 2");
        assert_eq!(select_job(&records, Some(0)).unwrap().command(), "job 0");
        assert_eq!(select_job(&records, Some(-3)).unwrap().command(), "job 0");
        assert!(select_job(&records, Some(3)).is_none());
        assert!(select_job(&[], None).is_none());
    }

    #[tokio::test]
    async fn test_render_job_prefixes_lines() {
        let transport = MockTransport::new().with_host(
            "web1",
            MockHost::reachable()
                .with_command("ls", MockCommand::exits(0).with_output("a\r\nb\r\n")),
        );
        let console = console(&["web1"], transport);
        let record = console
            .dispatcher
            .run_one(&HostSpec::from("web1"), "ls")
            .await
            .unwrap();

        let rendered = render_job(&HostSpec::from("web1"), &record);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("$ ls"));
        assert!(lines[1].contains("web1") && lines[1].ends_with(" a"));
        assert!(lines[2].ends_with(" b"));
        assert!(lines[3].contains("exit code"));

        // Rendering leaves the output available for the next show
        assert_eq!(record.replay(), b"a\r\nb\r\n");
    }

    #[tokio::test]
    async fn test_render_status_and_list() {
        let transport = MockTransport::new()
            .with_host("web1", MockHost::reachable())
            .with_host("db9", MockHost::unreachable("No route to host"));
        let console = console(&["web1", "db9"], transport);
        console.fleet.connect_all().await;
        console.dispatcher.run_one(&HostSpec::from("web1"), "true").await.unwrap();

        let status = console.render_status();
        assert!(status.lines().nth(1).unwrap().ends_with("0"));
        assert!(status.lines().nth(2).unwrap().ends_with("(no jobs)"));

        let list = console.render_list().await;
        let db9 = list.lines().nth(2).unwrap();
        assert!(db9.contains("no"));
        assert!(db9.contains("No route to host"));
    }

    #[tokio::test]
    async fn test_history_requires_jobs() {
        let console = console(&["web1"], MockTransport::new());
        assert!(matches!(
            console.render_history("web1"),
            Err(ShoalError::NoJobs(_))
        ));
        assert!(matches!(
            console.show("web1", Some("x")),
            Err(ShoalError::Usage(_))
        ));
    }
}
