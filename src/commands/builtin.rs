//! Built-in chat commands.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::commands::dispatcher::{
    CommandContext, CommandHandler, CommandInfo, DispatcherBuilder,
};
use crate::pairing::{CodeIssuer, PairingService};
use crate::session::{ConnectionState, OutgoingMessage};

pub const PONG_REPLY: &str = "🏓 Pong!";
pub const CODE_ERROR_REPLY: &str = "Error fetching pairing code. Try again later.";

/// Dependencies shared by the built-in commands.
pub struct BuiltinDeps {
    pub bot_name: String,
    pub pairing: Arc<PairingService>,
    pub issuer: Arc<CodeIssuer>,
    pub clock: Arc<dyn Clock>,
    /// Process start, for `uptime` and `status`.
    pub started_at: DateTime<Utc>,
    pub session_state: watch::Receiver<ConnectionState>,
}

/// Register every built-in command, with `help` listing all of them.
pub fn register_builtins(builder: DispatcherBuilder, deps: BuiltinDeps) -> DispatcherBuilder {
    let prefix = builder.prefix().to_string();

    let builder = builder
        .register(StartCommand {
            bot_name: deps.bot_name,
            prefix: prefix.clone(),
        })
        .register(PingCommand)
        .register(UptimeCommand {
            clock: Arc::clone(&deps.clock),
            started_at: deps.started_at,
        })
        .register(CodeCommand {
            issuer: deps.issuer,
        })
        .register(PairCommand {
            pairing: Arc::clone(&deps.pairing),
            prefix: prefix.clone(),
        })
        .register(UnpairCommand {
            pairing: Arc::clone(&deps.pairing),
        })
        .register(StatusCommand {
            session_state: deps.session_state,
            pairing: deps.pairing,
            clock: deps.clock,
            started_at: deps.started_at,
        });

    let mut catalog = builder.catalog();
    catalog.insert(1, HelpCommand::descriptor());
    let text = format_help(&prefix, &catalog);
    builder.register(HelpCommand { text })
}

/// Format elapsed seconds as `{H}h {M}m {S}s`. Negative input reads as zero.
pub fn format_uptime(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours}h {minutes}m {seconds}s")
}

fn uptime_since(clock: &dyn Clock, started_at: DateTime<Utc>) -> String {
    format_uptime((clock.now() - started_at).num_seconds())
}

/// Render the command list shown by `help`.
pub fn format_help(prefix: &str, catalog: &[CommandInfo]) -> String {
    let mut lines = vec!["Available commands:".to_string()];
    for cmd in catalog {
        let name_and_args = if cmd.args.is_empty() {
            format!("{prefix}{}", cmd.name)
        } else {
            format!("{prefix}{} {}", cmd.name, cmd.args)
        };
        let lock = if cmd.gated { " 🔒" } else { "" };
        lines.push(format!("{name_and_args} - {}{lock}", cmd.description));
    }
    if catalog.iter().any(|cmd| cmd.gated) {
        lines.push(String::new());
        lines.push("🔒 requires a paired number".to_string());
    }
    lines.join("\n")
}

pub struct PingCommand;

#[async_trait]
impl CommandHandler for PingCommand {
    fn info(&self) -> CommandInfo {
        CommandInfo {
            name: "ping",
            description: "Check the bot is alive",
            args: "",
            gated: false,
        }
    }

    async fn handle(&self, _ctx: &CommandContext<'_>) -> OutgoingMessage {
        OutgoingMessage::text(PONG_REPLY)
    }
}

pub struct UptimeCommand {
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
}

#[async_trait]
impl CommandHandler for UptimeCommand {
    fn info(&self) -> CommandInfo {
        CommandInfo {
            name: "uptime",
            description: "How long the bot has been running",
            args: "",
            gated: false,
        }
    }

    async fn handle(&self, _ctx: &CommandContext<'_>) -> OutgoingMessage {
        OutgoingMessage::text(format!(
            "⏱️ Uptime: {}",
            uptime_since(self.clock.as_ref(), self.started_at)
        ))
    }
}

pub struct StartCommand {
    bot_name: String,
    prefix: String,
}

#[async_trait]
impl CommandHandler for StartCommand {
    fn info(&self) -> CommandInfo {
        CommandInfo {
            name: "start",
            description: "Welcome message",
            args: "",
            gated: false,
        }
    }

    async fn handle(&self, _ctx: &CommandContext<'_>) -> OutgoingMessage {
        let p = &self.prefix;
        OutgoingMessage::text(format!(
            "Hello! Welcome to {}.\nUse {p}code to get your pairing code.\nUse {p}help for commands.",
            self.bot_name
        ))
    }
}

pub struct HelpCommand {
    text: String,
}

impl HelpCommand {
    fn descriptor() -> CommandInfo {
        CommandInfo {
            name: "help",
            description: "Show commands",
            args: "",
            gated: false,
        }
    }
}

#[async_trait]
impl CommandHandler for HelpCommand {
    fn info(&self) -> CommandInfo {
        Self::descriptor()
    }

    async fn handle(&self, _ctx: &CommandContext<'_>) -> OutgoingMessage {
        OutgoingMessage::text(self.text.clone())
    }
}

/// Issues a pairing code to the sender, the in-band counterpart of `/code`.
pub struct CodeCommand {
    issuer: Arc<CodeIssuer>,
}

#[async_trait]
impl CommandHandler for CodeCommand {
    fn info(&self) -> CommandInfo {
        CommandInfo {
            name: "code",
            description: "Get a pairing code for this number",
            args: "",
            gated: false,
        }
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> OutgoingMessage {
        match self.issuer.issue(ctx.sender).await {
            Ok(code) => OutgoingMessage::text(format!(
                "Your pairing code is:\n{code}\nEnter this code in your website to link your device."
            )),
            Err(e) => {
                tracing::warn!(sender = %ctx.sender, error = %e, "Pairing code request failed");
                OutgoingMessage::text(CODE_ERROR_REPLY)
            }
        }
    }
}

pub struct PairCommand {
    pairing: Arc<PairingService>,
    prefix: String,
}

#[async_trait]
impl CommandHandler for PairCommand {
    fn info(&self) -> CommandInfo {
        CommandInfo {
            name: "pair",
            description: "Link this number with a pairing code",
            args: "<code>",
            gated: false,
        }
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> OutgoingMessage {
        let Some(code) = ctx.args.first() else {
            return OutgoingMessage::text(format!("Usage: {}pair <code>", self.prefix));
        };

        match self.pairing.confirm(code, ctx.sender).await {
            Ok(_) => OutgoingMessage::text(
                "✅ Paired! This number can now use restricted commands.",
            ),
            Err(e) => OutgoingMessage::text(format!("❌ Pairing failed: {e}")),
        }
    }
}

pub struct UnpairCommand {
    pairing: Arc<PairingService>,
}

#[async_trait]
impl CommandHandler for UnpairCommand {
    fn info(&self) -> CommandInfo {
        CommandInfo {
            name: "unpair",
            description: "Unlink this number",
            args: "",
            gated: true,
        }
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> OutgoingMessage {
        self.pairing.unpair(ctx.sender).await;
        OutgoingMessage::text("👋 This number is no longer paired.")
    }
}

pub struct StatusCommand {
    session_state: watch::Receiver<ConnectionState>,
    pairing: Arc<PairingService>,
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
}

#[async_trait]
impl CommandHandler for StatusCommand {
    fn info(&self) -> CommandInfo {
        CommandInfo {
            name: "status",
            description: "Session and pairing status",
            args: "",
            gated: true,
        }
    }

    async fn handle(&self, _ctx: &CommandContext<'_>) -> OutgoingMessage {
        let state = *self.session_state.borrow();
        let paired = self.pairing.paired_identities().await.len();
        let pending = self.pairing.store().live_count().await;
        OutgoingMessage::text(format!(
            "📡 Session: {state}\n👥 Paired numbers: {paired}\n🔑 Pending codes: {pending}\n⏱️ Uptime: {}",
            uptime_since(self.clock.as_ref(), self.started_at)
        ))
    }
}
