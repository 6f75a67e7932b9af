use anyhow::Context;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use convai_rust::config::SessionConfig;
use convai_rust::engine::Conversation;
use convai_rust::events::{Mode, Role, SessionCallbacks, Status};

/// Terminal client for a realtime voice conversation with an agent.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Agent id to converse with.
    #[arg(short, long)]
    agent: Option<String>,

    /// Full (e.g. signed) session URL; overrides --agent.
    #[arg(short, long)]
    url: Option<String>,

    /// Start with the microphone muted.
    #[arg(long)]
    muted: bool,
}

struct TerminalCallbacks;

impl SessionCallbacks for TerminalCallbacks {
    fn on_connect(&self, conversation_id: &str) {
        println!("* connected: {conversation_id}");
    }

    fn on_disconnect(&self) {
        println!("* disconnected");
    }

    fn on_message(&self, text: &str, role: Role) {
        let who = match role {
            Role::Ai => "agent",
            Role::User => "you",
        };
        println!("[{who}] {text}");
    }

    fn on_error(&self, message: &str, detail: Option<&str>) {
        match detail {
            Some(detail) => error!("{message}: {detail}"),
            None => error!("{message}"),
        }
    }

    fn on_status_change(&self, status: Status) {
        info!("status: {status}");
    }

    fn on_mode_change(&self, mode: Mode) {
        info!("mode: {mode}");
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{:<5}] [{}] - {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let config = SessionConfig {
        agent_id: args.agent,
        url: args.url,
        ..SessionConfig::default()
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async {
        let conversation = Conversation::start(config, Arc::new(TerminalCallbacks))
            .await
            .context("failed to start session")?;

        if args.muted {
            conversation.stop_recording();
            println!("* microphone muted");
        }

        println!(
            "* talking to conversation {}; Ctrl-C to hang up",
            conversation.conversation_id()
        );

        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for Ctrl-C")?;
        println!("* hanging up");
        conversation.end_session().await;
        Ok(())
    })
}
