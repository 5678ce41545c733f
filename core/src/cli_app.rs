use crate::backend::{HttpBackend, SendReceipt};
use crate::config::Config;
use crate::message::{ConversationScope, Credential, Message, MessageKind, Participant};
use crate::message_store::DateGroup;
use crate::realtime::{ChannelState, WsConnector};
use crate::session::{ConversationSession, HistoryStatus, SessionEvent};
use anyhow::{anyhow, Context};
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

type Session = ConversationSession<HttpBackend, WsConnector>;

/// Flags that consume the following argument
const VALUE_FLAGS: &[&str] = &[
    "--api-url",
    "--ws-url",
    "--request-timeout-ms",
    "--connect-timeout-ms",
    "--event-capacity",
    "--token",
];

/// A line typed at the prompt
#[derive(Debug, PartialEq)]
enum Command<'a> {
    Quit,
    Help,
    Retry,
    Reconnect,
    Report(&'a str),
    Text(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Result<Self, String> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Command::Text(line));
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match name {
            "quit" | "q" | "exit" => Ok(Command::Quit),
            "help" | "h" => Ok(Command::Help),
            "retry" => Ok(Command::Retry),
            "reconnect" => Ok(Command::Reconnect),
            "report" if !arg.is_empty() => Ok(Command::Report(arg)),
            "report" => Err("Usage: /report <report_id>".to_string()),
            other => Err(format!("Unknown command: /{}", other)),
        }
    }
}

/// Terminal client for one conversation
pub async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("carechat")
        .to_string();

    let positional = positional_args(&args);
    if positional.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage(&bin);
        return Ok(());
    }

    let local: Participant = positional[0].parse()?;
    let remote: Participant = positional[1].parse()?;
    let config =
        Config::from_args(&args).map_err(|e| anyhow!("Configuration error: {}", e))?;
    let credential = token_from(&args)
        .map(Credential::new)
        .ok_or_else(|| anyhow!("No credential: pass --token <token> or set CARECHAT_TOKEN"))?;

    let backend = Arc::new(HttpBackend::new(&config, credential.clone())?);
    let session: Arc<Session> = Arc::new(ConversationSession::new(
        backend,
        WsConnector::from_config(&config),
        &config,
    ));

    let scope = ConversationScope::new(local.clone(), remote.clone());
    println!(
        "{} {} {} {}",
        "⚡ CareChat".bright_cyan().bold(),
        local.to_string().green(),
        "↔".dimmed(),
        remote.to_string().cyan()
    );

    // Subscribe first so nothing merged during the open goes unseen
    let mut events = session.subscribe();
    let outcome = session
        .open(scope, credential)
        .await
        .with_context(|| format!("could not open conversation with {}", remote))?;

    if let HistoryStatus::Failed(e) = &outcome.history {
        eprintln!(
            "{} History unavailable: {} {}",
            "⚠".yellow(),
            e,
            "(/retry to load it again)".dimmed()
        );
    }
    // Open-time events are covered by the snapshot printed below
    discard_backlog(&mut events);
    if session.message_count() == 0 {
        println!("{}", "No messages yet.".dimmed());
    } else {
        print_history(&session.group_by_date(), &local);
    }
    println!("{}", "Type a message, or /help for commands.".dimmed());

    let printer = tokio::spawn(print_events(events, local.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match Command::parse(&line) {
            Ok(Command::Quit) => break,
            Ok(Command::Help) => print_commands(),
            Ok(Command::Text(body)) => send_text(&session, body).await,
            Ok(Command::Report(id)) => show_report(&session, id).await,
            Ok(Command::Retry) if session.is_history_loaded() => {
                println!("{}", "History already loaded.".dimmed())
            }
            Ok(Command::Retry) => match session.retry_history().await {
                Ok(_) if session.message_count() == 0 => {
                    println!("{}", "No messages yet.".dimmed())
                }
                Ok(_) => print_history(&session.group_by_date(), &local),
                Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
            },
            Ok(Command::Reconnect) => match session.reconnect().await {
                Ok(()) => println!("{} Reconnected", "✓".green()),
                Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
            },
            Err(msg) => eprintln!("{}", msg.yellow()),
        }
    }

    session.close();
    let _ = printer.await;
    Ok(())
}

async fn send_text(session: &Session, body: &str) {
    match session.send_text(body).await {
        // Acknowledged messages are printed when merged
        Ok(SendReceipt::Acknowledged { .. }) => {}
        Ok(SendReceipt::Accepted { .. }) => println!("{}", "  (sent, waiting for delivery)".dimmed()),
        Err(e) => {
            eprintln!("{} Not sent: {}", "✗".red().bold(), e);
            if e.is_recoverable() {
                eprintln!("  {}", "Send it again to retry.".dimmed());
            }
        }
    }
}

async fn show_report(session: &Session, report_id: &str) {
    match session.report_metadata(report_id).await {
        Ok(meta) => {
            println!("{} {}", "📎".cyan(), meta.file_name.bright_white().bold());
            println!("  {} {}", "id:".dimmed(), meta.report_id);
            if let Some(content_type) = meta.content_type {
                println!("  {} {}", "type:".dimmed(), content_type);
            }
        }
        Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>, local: Participant) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::MessageMerged(message)) => print_message(&message, &local),
            Ok(SessionEvent::HistoryFailed { reason }) => {
                eprintln!("{} History unavailable: {}", "⚠".yellow(), reason)
            }
            Ok(SessionEvent::ChannelStateChanged(ChannelState::Reconnecting)) => {
                eprintln!("{}", "… reconnecting".yellow())
            }
            Ok(SessionEvent::ChannelStateChanged(ChannelState::Disconnected)) => eprintln!(
                "{} {}",
                "⚠ Disconnected.".yellow(),
                "(/reconnect to try again)".dimmed()
            ),
            Ok(SessionEvent::ChannelError { reason }) => {
                eprintln!("{} {}", "✗".red().bold(), reason)
            }
            Ok(SessionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                eprintln!("{}", format!("({} updates skipped)", n).dimmed())
            }
        }
    }
}

/// Drop buffered events; returns how many were skipped
fn discard_backlog(events: &mut broadcast::Receiver<SessionEvent>) -> usize {
    let mut skipped = 0;
    loop {
        match events.try_recv() {
            Ok(_) => skipped += 1,
            Err(broadcast::error::TryRecvError::Lagged(n)) => skipped += n as usize,
            Err(_) => return skipped,
        }
    }
}

fn print_history(groups: &[DateGroup], local: &Participant) {
    for group in groups {
        println!();
        println!(
            "{}",
            format!("── {} ──", group.date.format("%A %d %B %Y")).dimmed()
        );
        for message in &group.messages {
            print_message(message, local);
        }
    }
    println!();
}

fn print_message(message: &Message, local: &Participant) {
    let time = message.sent_at_time.format("%H:%M").to_string();
    let who = if message.sender_role == local.role {
        "you".green().bold()
    } else {
        message.sender_role.as_str().cyan().bold()
    };
    let body = match &message.kind {
        MessageKind::ReportReference { report_id, caption } => format!(
            "📎 report {}{}",
            report_id.bright_white(),
            caption
                .as_deref()
                .map(|c| format!(" - {}", c))
                .unwrap_or_default()
        ),
        MessageKind::StructuredNote {
            body,
            note_category,
        } => format!("[{}] {}", note_category.yellow(), body),
        _ => message.kind.display_text(),
    };
    println!("{} {} {}", time.dimmed(), who, body);
}

fn positional_args(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        if VALUE_FLAGS.contains(&arg) {
            i += 2;
            continue;
        }
        if !arg.starts_with('-') {
            out.push(arg);
        }
        i += 1;
    }
    out
}

fn token_from(args: &[String]) -> Option<String> {
    args.iter()
        .position(|a| a == "--token")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| std::env::var("CARECHAT_TOKEN").ok())
        .filter(|t| !t.is_empty())
}

fn print_usage(bin: &str) {
    println!("{}", "⚡ CareChat".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} <local-role:id> <remote-role:id> [options]", bin.cyan());
    println!();
    println!("{}", "Roles:".bright_white().bold());
    println!("  doctor, patient, laboratory, pharmacy");
    println!();
    println!("{}", "Options:".bright_white().bold());
    println!("  {} <token>            Bearer credential (or CARECHAT_TOKEN)", "--token".cyan());
    println!("  {} <url>            REST base URL (or CARECHAT_API_URL)", "--api-url".cyan());
    println!("  {} <url>             WebSocket URL (or CARECHAT_WS_URL)", "--ws-url".cyan());
    println!("  {} <ms>  REST timeout", "--request-timeout-ms".cyan());
    println!("  {} <ms>  Channel handshake timeout", "--connect-timeout-ms".cyan());
    println!("  {}                Reconnect automatically with backoff", "--reconnect".cyan());
    println!();
    print_commands();
}

fn print_commands() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}  Show report metadata", "/report <id>".cyan());
    println!("  {}        Reload history after a failure", "/retry".cyan());
    println!("  {}    Reopen a dropped channel", "/reconnect".cyan());
    println!("  {}         Leave the conversation", "/quit".cyan());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse("hello there"), Ok(Command::Text("hello there")));
        assert_eq!(Command::parse("/quit"), Ok(Command::Quit));
        assert_eq!(Command::parse("/report  r-17 "), Ok(Command::Report("r-17")));
        assert!(Command::parse("/report").is_err());
        assert!(Command::parse("/dance").is_err());
    }

    #[test]
    fn test_positional_args_skip_flag_values() {
        let a = args(&[
            "carechat",
            "--token",
            "secret",
            "doctor:1",
            "--reconnect",
            "patient:2",
            "--api-url",
            "http://x",
        ]);
        assert_eq!(positional_args(&a), vec!["doctor:1", "patient:2"]);
    }

    #[test]
    fn test_discard_backlog_leaves_receiver_live() {
        let (tx, mut rx) = broadcast::channel(16);
        tx.send(SessionEvent::ChannelStateChanged(ChannelState::Connected)).unwrap();
        tx.send(SessionEvent::HistoryLoaded { count: 0 }).unwrap();

        assert_eq!(discard_backlog(&mut rx), 2);
        assert_eq!(discard_backlog(&mut rx), 0);

        tx.send(SessionEvent::Closed).unwrap();
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Closed)));
    }

    #[test]
    fn test_token_flag() {
        let a = args(&["carechat", "doctor:1", "patient:2", "--token", "abc"]);
        assert_eq!(token_from(&a).as_deref(), Some("abc"));
    }
}
