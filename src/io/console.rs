//! Line-oriented console front end
//!
//! Reads commands from stdin and prints engine events to stdout. Logs go to
//! stderr so the two streams can be separated.

use crate::domain::types::{Distance, Lane};
use crate::io::peripheral::Peripheral;
use crate::io::sim::SimulatedPeripheral;
use crate::services::dispatcher::{Credentials, NotificationDispatcher};
use crate::services::engine::{EngineEvent, EngineHandle, EngineReport};
use crate::services::stats::StatisticsSnapshot;
use crate::services::supervisor::ConnectionSupervisor;
use std::fmt::Write;
use std::io::BufRead;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

pub const HELP: &str = "\
Commands:
  start | end | reset          manual timing control
  distance <20|40|metres>      set sprint distance
  lane <n>                     select lane
  auto on|off                  auto-reset on a new start
  notify on|off                enable push notifications
  credentials <user> <token>   set push credentials (credentials clear)
  test-notify                  send a test notification
  scan | connect <id|#n> | disconnect
  stats | clear                show or clear session statistics
  inject <hex>                 push a raw payload (simulated hub only)
  help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    End,
    Reset,
    Distance(String),
    Lane(u8),
    AutoReset(bool),
    Notify(bool),
    SetCredentials { user_key: String, api_token: String },
    ClearCredentials,
    TestNotify,
    Scan,
    /// Device id, or `#n` for the n-th device of the last scan
    Connect(String),
    Disconnect,
    Stats,
    ClearSession,
    Inject(Vec<u8>),
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}', type 'help'")]
    Unknown(String),

    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),

    #[error("invalid argument for '{command}': {reason}")]
    InvalidArgument { command: &'static str, reason: String },
}

fn on_off(command: &'static str, arg: Option<&str>) -> Result<bool, CommandError> {
    match arg {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        Some(other) => Err(CommandError::InvalidArgument {
            command,
            reason: format!("expected on|off, got '{other}'"),
        }),
        None => Err(CommandError::MissingArgument(command)),
    }
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();

    let command = match word.to_lowercase().as_str() {
        "start" => Command::Start,
        "end" | "stop" => Command::End,
        "reset" => Command::Reset,
        "distance" => Command::Distance(arg.ok_or(CommandError::MissingArgument("distance"))?.to_string()),
        "lane" => {
            let raw = arg.ok_or(CommandError::MissingArgument("lane"))?;
            let lane = raw.parse::<u8>().map_err(|e| CommandError::InvalidArgument {
                command: "lane",
                reason: e.to_string(),
            })?;
            Command::Lane(lane)
        }
        "auto" => Command::AutoReset(on_off("auto", arg)?),
        "notify" => Command::Notify(on_off("notify", arg)?),
        "credentials" => match (arg, words.next()) {
            (Some("clear"), None) => Command::ClearCredentials,
            (Some(user), Some(token)) => {
                Command::SetCredentials { user_key: user.to_string(), api_token: token.to_string() }
            }
            _ => return Err(CommandError::MissingArgument("credentials")),
        },
        "test-notify" => Command::TestNotify,
        "scan" => Command::Scan,
        "connect" => Command::Connect(arg.ok_or(CommandError::MissingArgument("connect"))?.to_string()),
        "disconnect" => Command::Disconnect,
        "stats" => Command::Stats,
        "clear" => Command::ClearSession,
        "inject" => {
            let hex_text: String = arg.into_iter().chain(words).collect();
            if hex_text.is_empty() {
                return Err(CommandError::MissingArgument("inject"));
            }
            let payload = hex::decode(&hex_text).map_err(|e| CommandError::InvalidArgument {
                command: "inject",
                reason: e.to_string(),
            })?;
            Command::Inject(payload)
        }
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Statistics block for the `stats` command and completed sprints
pub fn render_snapshot(snapshot: &StatisticsSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Session top speed: {:.1} km/h ({:.3} s)",
        snapshot.session_top_speed, snapshot.session_top_speed_time
    );
    let _ = writeln!(
        out,
        "All-time top speed: {:.1} km/h ({:.3} s)",
        snapshot.all_time_top_speed, snapshot.all_time_top_speed_time
    );
    match snapshot.session_best_time {
        Some(best) => {
            let _ = writeln!(out, "Session best time: {best:.3} s");
        }
        None => {
            let _ = writeln!(out, "Session best time: --");
        }
    }
    for (i, sprint) in snapshot.history.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {:>2}. {} {:.3} s {:.1} km/h ({} m)",
            i + 1,
            sprint.timestamp.format("%H:%M:%S"),
            sprint.elapsed_seconds,
            sprint.speed_kmh,
            sprint.distance_meters
        );
    }
    out.trim_end().to_string()
}

/// Turns the event stream into console lines
#[derive(Debug, Default)]
pub struct EventRenderer {
    last_whole_second: Option<u64>,
}

impl EventRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks are thinned to one line per elapsed second
    pub fn render(&mut self, event: &EngineEvent) -> Option<String> {
        match event {
            EngineEvent::Tick(elapsed) => {
                let whole = elapsed.as_secs();
                if whole == 0 || self.last_whole_second == Some(whole) {
                    return None;
                }
                self.last_whole_second = Some(whole);
                Some(format!("  ... {whole} s"))
            }
            EngineEvent::SessionStarted => {
                self.last_whole_second = None;
                Some("Timer started".to_string())
            }
            EngineEvent::SessionAborted => Some("Session aborted, no time recorded".to_string()),
            EngineEvent::SprintCompleted { record, outcome, .. } => {
                let mut line = format!(
                    "Sprint: {:.3} s, {:.1} km/h over {} m",
                    record.elapsed_seconds, record.speed_kmh, record.distance_meters
                );
                if outcome.session_record_broken {
                    line.push_str(" [New session top speed!]");
                }
                if outcome.lifetime_record_broken {
                    line.push_str(" [New all-time top speed!]");
                }
                Some(line)
            }
            EngineEvent::Ready => Some("Ready for next sprint".to_string()),
            EngineEvent::ConnectionStateChanged(state) => Some(format!("Connection: {}", state.as_str())),
            EngineEvent::Report(report) => Some(match report {
                EngineReport::Timing(e) => format!("Warning: {e}"),
                EngineReport::StartIgnored => "Start ignored, timer already running".to_string(),
                EngineReport::NotificationFailed => "Warning: notification failed".to_string(),
                EngineReport::NotificationDropped => "Warning: notification queue full".to_string(),
            }),
        }
    }
}

/// Print engine events until shutdown
pub async fn run_event_printer(
    mut events: broadcast::Receiver<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut renderer = EventRenderer::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = renderer.render(&event) {
                        println!("{line}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = %skipped, "console_events_lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Read stdin on a plain thread so a pending read never holds up runtime
/// shutdown. The channel closes on EOF.
pub fn spawn_stdin_reader(buffer: usize) -> mpsc::Receiver<String> {
    let (line_tx, line_rx) = mpsc::channel(buffer);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "console_read_failed");
                    break;
                }
            }
        }
    });
    line_rx
}

/// Everything the console can act on
pub struct Console<P: Peripheral> {
    pub engine: EngineHandle,
    pub supervisor: Arc<ConnectionSupervisor<P>>,
    pub dispatcher: Arc<NotificationDispatcher>,
    /// Present in simulated mode, enables `inject`
    pub sim: Option<Arc<SimulatedPeripheral>>,
}

impl<P: Peripheral> Console<P> {
    /// Process input lines until EOF or `quit`
    pub async fn run(self, mut lines: mpsc::Receiver<String>) {
        println!("{HELP}");
        while let Some(line) = lines.recv().await {
            match parse_command(&line) {
                Ok(Some(Command::Quit)) => break,
                Ok(Some(command)) => self.execute(command).await,
                Ok(None) => {}
                Err(e) => println!("{e}"),
            }
        }
        debug!("console_input_closed");
    }

    async fn execute(&self, command: Command) {
        debug!(command = ?command, "console_command");
        let result = match command {
            Command::Start => self.engine.start_manually().await,
            Command::End => self.engine.end_manually().await,
            Command::Reset => self.engine.reset().await,
            Command::Distance(raw) => self.engine.set_distance(Distance::from_input(&raw)).await,
            Command::Lane(lane) => self.engine.set_lane(Lane(lane)).await,
            Command::AutoReset(enabled) => self.engine.set_auto_reset(enabled).await,
            Command::ClearSession => self.engine.clear_session().await,
            Command::Notify(enabled) => {
                if !self.engine.set_notifications_enabled(enabled) {
                    println!("Warning: set credentials first, notifications will not be sent");
                }
                Ok(())
            }
            Command::SetCredentials { user_key, api_token } => {
                self.engine.set_credentials(Some(Credentials::new(user_key, api_token)));
                Ok(())
            }
            Command::ClearCredentials => {
                self.engine.set_credentials(None);
                Ok(())
            }
            Command::Stats => self.engine.snapshot().await.map(|s| println!("{}", render_snapshot(&s))),
            Command::TestNotify => {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    let sent = dispatcher.test_notification().await;
                    println!("Test notification {}", if sent { "sent" } else { "failed" });
                });
                Ok(())
            }
            Command::Scan => {
                let supervisor = self.supervisor.clone();
                tokio::spawn(async move {
                    match supervisor.scan().await {
                        Ok(devices) => {
                            for (i, device) in devices.iter().enumerate() {
                                println!("  #{} {} {}", i + 1, device.id, device.display_name());
                            }
                            if devices.is_empty() {
                                println!("No devices found");
                            }
                        }
                        Err(e) => println!("Scan failed: {e}"),
                    }
                });
                Ok(())
            }
            Command::Connect(target) => {
                let device_id = self.resolve_device(&target);
                let supervisor = self.supervisor.clone();
                tokio::spawn(async move {
                    if let Err(e) = supervisor.connect(&device_id).await {
                        println!("Connect failed: {e}");
                    }
                });
                Ok(())
            }
            Command::Disconnect => {
                let _ = self.supervisor.disconnect().await;
                Ok(())
            }
            Command::Inject(payload) => {
                match &self.sim {
                    Some(sim) if sim.inject(&payload) => {}
                    Some(_) => println!("Not subscribed, connect to the simulated hub first"),
                    None => println!("inject is only available with --simulate"),
                }
                Ok(())
            }
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Quit => Ok(()),
        };

        if let Err(e) = result {
            println!("Error: {e}");
        }
    }

    fn resolve_device(&self, target: &str) -> String {
        target
            .strip_prefix('#')
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| self.supervisor.candidates().get(i).map(|d| d.id.clone()))
            .unwrap_or_else(|| target.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::TimingError;
    use crate::domain::types::ConnectionState;
    use std::time::Duration;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("start"), Ok(Some(Command::Start)));
        assert_eq!(parse_command("  END "), Ok(Some(Command::End)));
        assert_eq!(parse_command(""), Ok(None));
        assert_eq!(parse_command("quit"), Ok(Some(Command::Quit)));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_command("distance 32.5"), Ok(Some(Command::Distance("32.5".into()))));
        assert_eq!(parse_command("lane 2"), Ok(Some(Command::Lane(2))));
        assert_eq!(parse_command("auto off"), Ok(Some(Command::AutoReset(false))));
        assert_eq!(parse_command("notify on"), Ok(Some(Command::Notify(true))));
        assert_eq!(parse_command("connect #2"), Ok(Some(Command::Connect("#2".into()))));
        assert_eq!(
            parse_command("credentials u123 t456"),
            Ok(Some(Command::SetCredentials { user_key: "u123".into(), api_token: "t456".into() }))
        );
        assert_eq!(parse_command("credentials clear"), Ok(Some(Command::ClearCredentials)));
    }

    #[test]
    fn test_parse_inject_hex() {
        assert_eq!(parse_command("inject 0501"), Ok(Some(Command::Inject(vec![0x05, 0x01]))));
        assert_eq!(parse_command("inject 81 01"), Ok(Some(Command::Inject(vec![0x81, 0x01]))));
        assert!(matches!(
            parse_command("inject zz"),
            Err(CommandError::InvalidArgument { command: "inject", .. })
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_command("launch"), Err(CommandError::Unknown("launch".into())));
        assert_eq!(parse_command("lane"), Err(CommandError::MissingArgument("lane")));
        assert!(parse_command("lane 300").is_err());
        assert!(parse_command("auto maybe").is_err());
        assert_eq!(parse_command("credentials onlyuser"), Err(CommandError::MissingArgument("credentials")));
    }

    #[test]
    fn test_render_ticks_once_per_second() {
        let mut renderer = EventRenderer::new();
        assert_eq!(renderer.render(&EngineEvent::Tick(Duration::from_millis(500))), None);
        assert_eq!(
            renderer.render(&EngineEvent::Tick(Duration::from_millis(1010))),
            Some("  ... 1 s".to_string())
        );
        assert_eq!(renderer.render(&EngineEvent::Tick(Duration::from_millis(1020))), None);
        assert!(renderer.render(&EngineEvent::Tick(Duration::from_millis(2000))).is_some());
    }

    #[test]
    fn test_render_reports() {
        let mut renderer = EventRenderer::new();
        let line = renderer
            .render(&EngineEvent::Report(EngineReport::Timing(TimingError::InvalidDistance("abc".into()))))
            .unwrap();
        assert!(line.contains("abc"));
        assert_eq!(
            renderer.render(&EngineEvent::ConnectionStateChanged(ConnectionState::Connected)),
            Some("Connection: connected".to_string())
        );
    }

    #[test]
    fn test_render_empty_snapshot() {
        let snapshot = StatisticsSnapshot {
            all_time_top_speed: 0.0,
            all_time_top_speed_time: 0.0,
            session_top_speed: 0.0,
            session_top_speed_time: 0.0,
            session_best_time: None,
            history: Vec::new(),
        };
        let text = render_snapshot(&snapshot);
        assert!(text.contains("Session best time: --"));
    }
}
