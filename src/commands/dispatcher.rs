//! Command dispatch for inbound chat text.
//!
//! Each inbound message is matched against the prefix and the command
//! table. Unknown commands are ignored without a reply. Gated commands run
//! only for paired senders; everyone else gets the denial reply.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::commands::parse::parse_command;
use crate::error::SendError;
use crate::pairing::{Identity, PairingService};
use crate::session::{InboundText, OutgoingMessage};

/// Where replies go. Implemented by the connection supervisor.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send_reply(&self, to: &Identity, message: &OutgoingMessage) -> Result<(), SendError>;
}

/// Descriptor for a registered command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandInfo {
    /// Command name (without prefix).
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Argument syntax hint, e.g. `<code>`.
    pub args: &'static str,
    /// Whether the sender must be paired.
    pub gated: bool,
}

/// Input handed to a command handler.
#[derive(Debug)]
pub struct CommandContext<'a> {
    pub sender: &'a Identity,
    pub args: &'a [String],
}

/// A chat command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn info(&self) -> CommandInfo;

    /// Produce the reply for this invocation.
    async fn handle(&self, ctx: &CommandContext<'_>) -> OutgoingMessage;
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not a command, or an unknown one.
    Ignored,
    /// Gated command from an unpaired sender; denial sent.
    Denied { command: String },
    /// Handler ran and its reply was sent.
    Replied { command: String },
}

/// Builds a [`CommandDispatcher`].
pub struct DispatcherBuilder {
    prefix: String,
    pairing: Arc<PairingService>,
    sink: Arc<dyn ReplySink>,
    handlers: Vec<Arc<dyn CommandHandler>>,
}

impl DispatcherBuilder {
    /// Add a command. A later registration with the same name replaces an earlier one.
    pub fn register(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Catalog of registered commands, in registration order.
    pub fn catalog(&self) -> Vec<CommandInfo> {
        let mut seen = HashMap::new();
        let mut catalog: Vec<CommandInfo> = Vec::new();
        for handler in &self.handlers {
            let info = handler.info();
            let existing = seen.get(info.name).copied();
            match existing {
                Some(index) => catalog[index] = info,
                None => {
                    seen.insert(info.name, catalog.len());
                    catalog.push(info);
                }
            }
        }
        catalog
    }

    pub fn build(self) -> CommandDispatcher {
        let handlers = self
            .handlers
            .into_iter()
            .map(|handler| (handler.info().name.to_string(), handler))
            .collect();
        CommandDispatcher {
            prefix: self.prefix,
            handlers,
            pairing: self.pairing,
            sink: self.sink,
        }
    }
}

/// Stateless matcher from inbound text to command handlers.
pub struct CommandDispatcher {
    prefix: String,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    pairing: Arc<PairingService>,
    sink: Arc<dyn ReplySink>,
}

impl CommandDispatcher {
    pub fn builder(
        prefix: impl Into<String>,
        pairing: Arc<PairingService>,
        sink: Arc<dyn ReplySink>,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            prefix: prefix.into(),
            pairing,
            sink,
            handlers: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Handle one inbound message.
    ///
    /// Send failures are returned to the caller and not retried.
    pub async fn dispatch(&self, inbound: &InboundText) -> Result<DispatchOutcome, SendError> {
        let Some(parsed) = parse_command(&inbound.text, &self.prefix) else {
            return Ok(DispatchOutcome::Ignored);
        };
        let Some(handler) = self.handlers.get(&parsed.name) else {
            tracing::trace!(command = %parsed.name, "Ignoring unknown command");
            return Ok(DispatchOutcome::Ignored);
        };

        if handler.info().gated && !self.pairing.is_paired(&inbound.from).await {
            tracing::info!(command = %parsed.name, from = %inbound.from, "Denied gated command");
            let denial = OutgoingMessage::text(pairing_required_reply(&self.prefix));
            self.sink.send_reply(&inbound.from, &denial).await?;
            return Ok(DispatchOutcome::Denied {
                command: parsed.name,
            });
        }

        tracing::debug!(command = %parsed.name, from = %inbound.from, "Running command");
        let ctx = CommandContext {
            sender: &inbound.from,
            args: &parsed.args,
        };
        let reply = handler.handle(&ctx).await;
        self.sink.send_reply(&inbound.from, &reply).await?;

        Ok(DispatchOutcome::Replied {
            command: parsed.name,
        })
    }

    /// Process inbound messages one at a time until the channel closes.
    pub async fn run(&self, mut inbound: mpsc::Receiver<InboundText>) {
        while let Some(message) = inbound.recv().await {
            if let Err(e) = self.dispatch(&message).await {
                tracing::warn!(from = %message.from, error = %e, "Failed to deliver reply");
            }
        }
        tracing::debug!("Inbound channel closed, dispatcher stopping");
    }
}

/// Reply sent when an unpaired sender uses a gated command.
pub fn pairing_required_reply(prefix: &str) -> String {
    format!(
        "🔒 This command is only available to paired numbers.\nSend {prefix}code to get a pairing code, then {prefix}pair <code>."
    )
}


#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::test_support::RecordingSink;
    use super::*;
    use crate::clock::ManualClock;
    use crate::pairing::CredentialStore;

    struct Echo {
        gated: bool,
    }

    #[async_trait]
    impl CommandHandler for Echo {
        fn info(&self) -> CommandInfo {
            CommandInfo {
                name: "echo",
                description: "Echo arguments",
                args: "[text]",
                gated: self.gated,
            }
        }

        async fn handle(&self, ctx: &CommandContext<'_>) -> OutgoingMessage {
            OutgoingMessage::text(ctx.args.join(" "))
        }
    }

    fn pairing() -> Arc<PairingService> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(CredentialStore::new(clock.clone(), Duration::minutes(10)));
        Arc::new(PairingService::new(store, clock))
    }

    fn inbound(text: &str) -> InboundText {
        InboundText {
            from: Identity::parse("15551234567").unwrap(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_runs_handler() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = CommandDispatcher::builder(".", pairing(), sink.clone())
            .register(Echo { gated: false })
            .build();

        let outcome = dispatcher.dispatch(&inbound(".ECHO hello world")).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Replied {
                command: "echo".to_string()
            }
        );
        assert_eq!(sink.texts(), vec!["hello world"]);
    }

    #[tokio::test]
    async fn test_non_command_and_unknown_are_silent() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = CommandDispatcher::builder(".", pairing(), sink.clone())
            .register(Echo { gated: false })
            .build();

        for text in ["hello", "echo hi", ".nope", "."] {
            assert_eq!(
                dispatcher.dispatch(&inbound(text)).await.unwrap(),
                DispatchOutcome::Ignored
            );
        }
        assert!(sink.texts().is_empty());
    }

    #[tokio::test]
    async fn test_gated_command_denied_until_paired() {
        let sink = Arc::new(RecordingSink::default());
        let pairing = pairing();
        let dispatcher = CommandDispatcher::builder(".", Arc::clone(&pairing), sink.clone())
            .register(Echo { gated: true })
            .build();

        let outcome = dispatcher.dispatch(&inbound(".echo secret")).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Denied {
                command: "echo".to_string()
            }
        );
        assert_eq!(sink.texts(), vec![pairing_required_reply(".")]);

        let sender = Identity::parse("15551234567").unwrap();
        let code = pairing.request_code(&sender).await.unwrap();
        pairing.confirm(&code, &sender).await.unwrap();

        dispatcher.dispatch(&inbound(".echo secret")).await.unwrap();
        assert_eq!(sink.texts().last().unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_send_failure_is_surfaced() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let dispatcher = CommandDispatcher::builder(".", pairing(), sink)
            .register(Echo { gated: false })
            .build();

        let err = dispatcher.dispatch(&inbound(".echo hi")).await.unwrap_err();
        assert_eq!(err, SendError::NotConnected);
    }

    #[tokio::test]
    async fn test_run_processes_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = CommandDispatcher::builder(".", pairing(), sink.clone())
            .register(Echo { gated: false })
            .build();

        let (tx, rx) = mpsc::channel(4);
        for text in [".echo one", "chatter", ".echo two", ".echo three"] {
            tx.send(inbound(text)).await.unwrap();
        }
        drop(tx);

        dispatcher.run(rx).await;
        assert_eq!(sink.texts(), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_catalog_replaces_duplicates_in_place() {
        let builder = CommandDispatcher::builder(".", pairing(), Arc::new(RecordingSink::default()))
            .register(Echo { gated: false })
            .register(Echo { gated: true });

        let catalog = builder.catalog();
        assert_eq!(catalog.len(), 1);
        assert!(catalog[0].gated);
    }
}
