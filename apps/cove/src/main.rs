mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use cli::{Cli, Command, DemoArgs, InputLine, JoinArgs};
use cove_core::config::SessionConfig;
use cove_core::peer::{LoopbackNetwork, WebRtcFactory};
use cove_core::protocol::ParticipantRole;
use cove_core::session::{
    CallState, SessionContext, SessionEvent, SessionHandle, SessionOrchestrator,
};
use cove_core::signaling::{MemoryRelay, WebSocketConnector};
use cove_core::telemetry::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard =
        logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    match cli.command {
        Command::Join(args) => run_join(args).await,
        Command::Demo(args) => run_demo(args).await,
    }
}

async fn run_join(args: JoinArgs) -> Result<()> {
    let mut config = SessionConfig::from_env();
    config.signaling.relay_url = args.relay.trim_end_matches('/').to_string();
    let connector = Arc::new(WebSocketConnector::new(config.signaling.relay_url.clone()));

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (handle, task) = SessionOrchestrator::spawn(
        SessionContext::new(args.token, args.participant_id, args.role),
        config,
        connector,
        Arc::new(WebRtcFactory),
        events_tx,
    );
    println!(
        "joined as {}; type a message, or /call /accept /reject /cancel /hangup /delete <id> /status /quit",
        args.role
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Closed) | None => break,
                Some(event) => print_event(&event),
            },
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) => {
                        if !handle_line(&handle, &line).await {
                            handle.end().await;
                        }
                    }
                    None => {
                        stdin_open = false;
                        handle.end().await;
                    }
                }
            }
        }
    }

    handle.end().await;
    drop(handle);
    task.await.context("session task panicked")?;
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line(handle: &SessionHandle, line: &str) -> bool {
    let outcome: Result<()> = match InputLine::parse(line) {
        InputLine::Empty => return true,
        InputLine::Quit => return false,
        InputLine::Unknown(command) => Err(anyhow!("unknown command {command}")),
        InputLine::Text(text) => handle
            .send_text(text)
            .await
            .map(|message| println!("sent {}", message.message_id))
            .map_err(Into::into),
        InputLine::Delete(id) => handle.delete_message(id).await.map_err(Into::into),
        InputLine::Call => print_call(handle.request_call().await),
        InputLine::Accept => print_call(handle.accept_call().await),
        InputLine::Reject => print_call(handle.reject_call().await),
        InputLine::Cancel => print_call(handle.cancel_call().await),
        InputLine::Hangup => print_call(handle.end_call().await),
        InputLine::Status => handle.snapshot().await.map_err(Into::into).map(|snapshot| {
            println!(
                "signaling={:?} channel={:?} call={:?} peer_encryption={:?} messages={} unacked={}",
                snapshot.signaling,
                snapshot.link.map(|link| link.channel),
                snapshot.call,
                snapshot.peer_supports_encryption,
                snapshot.messages.len(),
                snapshot.awaiting_ack,
            )
        }),
    };
    if let Err(err) = outcome {
        eprintln!("error: {err}");
    }
    true
}

fn print_call(result: Result<CallState, cove_core::session::SessionError>) -> Result<()> {
    let state = result?;
    println!("call {state:?}");
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Signaling(state) => println!("relay {state:?}"),
        SessionEvent::Status(status) => println!(
            "session {:?}, {} of {} connected{}",
            status.status,
            status.connected_count(),
            status.participant_ids.len(),
            status
                .remaining_seconds
                .map(|secs| format!(", {secs}s left"))
                .unwrap_or_default()
        ),
        SessionEvent::Connection(state) => println!("peer {state:?}"),
        SessionEvent::Channel(state) => println!("channel {state:?}"),
        SessionEvent::LinkRecreated { generation } => {
            println!("peer link rebuilt (generation {generation})")
        }
        SessionEvent::PeerCapability {
            supports_encryption,
        } => println!("peer encryption: {supports_encryption}"),
        SessionEvent::MessageReceived(message) => println!(
            "[{}] {} ({}): {}",
            message.created_at.format("%H:%M:%S"),
            message.role,
            message.message_id,
            message.content
        ),
        SessionEvent::Delivered { message_id } => println!("delivered {message_id}"),
        SessionEvent::MessageDeleted { message_id } => println!("deleted {message_id}"),
        SessionEvent::CallState(state) => println!("call {state:?}"),
        SessionEvent::RemoteCall(action) => println!("peer call action {action:?}"),
        SessionEvent::IntegrityWarning { message_id } => {
            eprintln!("warning: discarded tampered message {message_id}")
        }
        SessionEvent::Error(err) => eprintln!("error: {err}"),
        SessionEvent::Closed => println!("session closed"),
    }
}

async fn run_demo(args: DemoArgs) -> Result<()> {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let token = uuid::Uuid::new_v4().to_string();
    relay.issue(&token);

    let mut host = DemoParty::join(&relay, &network, &token, "demo-host")?;
    let mut guest = DemoParty::join(&relay, &network, &token, "demo-guest")?;
    let deadline = Duration::from_secs(args.timeout_secs);

    let run = async {
        host.wait_for(|event| matches!(event, SessionEvent::PeerCapability { .. }))
            .await?;
        guest
            .wait_for(|event| matches!(event, SessionEvent::PeerCapability { .. }))
            .await?;

        let sent = host.handle.send_text(args.message.clone()).await?;
        let received = guest
            .wait_for(|event| matches!(event, SessionEvent::MessageReceived(_)))
            .await?;
        if let SessionEvent::MessageReceived(message) = received {
            println!("guest received: {}", message.content);
        }
        host.wait_for(|event| {
            matches!(event, SessionEvent::Delivered { message_id } if *message_id == sent.message_id)
        })
        .await?;
        println!("host saw delivery of {}", sent.message_id);

        if args.call {
            guest.handle.request_call().await?;
            host.wait_for(|event| matches!(event, SessionEvent::CallState(CallState::Incoming)))
                .await?;
            host.handle.accept_call().await?;
            guest
                .wait_for(|event| matches!(event, SessionEvent::CallState(CallState::Active)))
                .await?;
            println!("call active");
            host.handle.end_call().await?;
            guest
                .wait_for(|event| matches!(event, SessionEvent::CallState(CallState::Idle)))
                .await?;
            println!("call ended");
        }
        anyhow::Ok(())
    };
    let outcome = tokio::time::timeout(deadline, run)
        .await
        .map_err(|_| anyhow!("demo did not finish within {}s", args.timeout_secs))
        .and_then(|result| result);

    host.handle.end().await;
    guest.handle.end().await;
    outcome
}

struct DemoParty {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl DemoParty {
    fn join(
        relay: &MemoryRelay,
        network: &LoopbackNetwork,
        token: &str,
        participant_id: &str,
    ) -> Result<Self> {
        let role: ParticipantRole = relay
            .join(token, participant_id)
            .with_context(|| format!("{participant_id} could not join"))?;
        let (events_tx, events) = mpsc::unbounded_channel();
        let (handle, _task) = SessionOrchestrator::spawn(
            SessionContext::new(token, participant_id, role),
            SessionConfig::default(),
            Arc::new(relay.clone()),
            Arc::new(network.factory(role.as_str())),
            events_tx,
        );
        Ok(Self { handle, events })
    }

    async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&SessionEvent) -> bool,
    ) -> Result<SessionEvent> {
        while let Some(event) = self.events.recv().await {
            if let SessionEvent::Error(err) = &event {
                tracing::debug!(target = "cove::demo", error = %err, "session reported error");
            }
            if predicate(&event) {
                return Ok(event);
            }
            if event == SessionEvent::Closed {
                bail!("session closed early");
            }
        }
        bail!("session event stream ended")
    }
}
