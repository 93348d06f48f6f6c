//! Inbound command handling: payload → register write → response.

use crate::bus::{HandlerFuture, MessageBus, MessageHandler};
use crate::fieldbus::{FieldBusClient, RegisterLink};
use maison_common::Response;
use std::sync::Arc;
use tracing::{info, warn};

/// Why a command payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("'{0}' is not an integer")]
    NotInteger(String),
    #[error("{0} does not fit in a 16-bit register")]
    OutOfRange(i64),
}

/// Parse a command payload as a base-10 register value.
///
/// Surrounding whitespace and a leading `+` are accepted.
pub fn parse_command(payload: &[u8]) -> Result<u16, CommandError> {
    let text = std::str::from_utf8(payload).map_err(|_| CommandError::NotUtf8)?;
    let text = text.trim();
    let value: i64 = text
        .parse()
        .map_err(|_| CommandError::NotInteger(text.to_string()))?;
    u16::try_from(value).map_err(|_| CommandError::OutOfRange(value))
}

/// Turns each command message into one register write and one response.
pub struct CommandTranslator<L, B> {
    field_bus: Arc<FieldBusClient<L>>,
    bus: B,
    register: u16,
    response_topic: String,
}

impl<L: RegisterLink, B: MessageBus> CommandTranslator<L, B> {
    pub fn new(
        field_bus: Arc<FieldBusClient<L>>,
        bus: B,
        register: u16,
        response_topic: impl Into<String>,
    ) -> Self {
        Self {
            field_bus,
            bus,
            register,
            response_topic: response_topic.into(),
        }
    }

    /// Handle one command payload. Publishes exactly one response and
    /// returns it.
    pub async fn on_command(&self, payload: &[u8]) -> Response {
        let response = match parse_command(payload) {
            Ok(value) => {
                info!(value, "Command received");
                match self.field_bus.write_register(self.register, value).await {
                    Ok(()) => {
                        info!(register = self.register, value, "Command sent to device");
                        Response::Sent(value)
                    }
                    Err(e) => {
                        warn!(register = self.register, value, error = %e, "Failed to send command");
                        Response::SendFailed
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Invalid command");
                Response::Invalid
            }
        };

        if let Err(e) = self.bus.publish(&self.response_topic, response.to_string()) {
            warn!(topic = %self.response_topic, error = %e, "Failed to publish response");
        }

        response
    }
}

impl<L: RegisterLink, B: MessageBus> MessageHandler for CommandTranslator<L, B> {
    fn on_message<'a>(&'a self, _topic: &'a str, payload: &'a [u8]) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.on_command(payload).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLink, RecordingBus};
    use std::time::Duration;

    async fn translator(
        link: &MockLink,
        bus: &RecordingBus,
    ) -> CommandTranslator<MockLink, RecordingBus> {
        let field_bus = Arc::new(FieldBusClient::new(Duration::from_secs(3)));
        field_bus.attach(link.clone()).await;
        CommandTranslator::new(field_bus, bus.clone(), 0, "maison/reponse")
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command(b"1"), Ok(1));
        assert_eq!(parse_command(b" 42\n"), Ok(42));
        assert_eq!(parse_command(b"+7"), Ok(7));
        assert_eq!(parse_command(b"65535"), Ok(65535));
        assert_eq!(
            parse_command(b"abc"),
            Err(CommandError::NotInteger("abc".to_string()))
        );
        assert_eq!(
            parse_command(b"1.5"),
            Err(CommandError::NotInteger("1.5".to_string()))
        );
        assert_eq!(parse_command(b""), Err(CommandError::NotInteger(String::new())));
        assert_eq!(parse_command(b"-1"), Err(CommandError::OutOfRange(-1)));
        assert_eq!(parse_command(b"65536"), Err(CommandError::OutOfRange(65536)));
        assert_eq!(parse_command(&[0xff, 0xfe]), Err(CommandError::NotUtf8));
    }

    #[tokio::test]
    async fn test_valid_command_is_written() {
        let link = MockLink::new();
        let bus = RecordingBus::new();
        let translator = translator(&link, &bus).await;

        assert_eq!(translator.on_command(b"1").await, Response::Sent(1));
        assert_eq!(link.writes(), vec![(0, 1)]);
        assert_eq!(bus.published_on("maison/reponse"), vec!["Commande 1 envoyée"]);
    }

    #[tokio::test]
    async fn test_invalid_command_never_reaches_device() {
        let link = MockLink::new();
        let bus = RecordingBus::new();
        let translator = translator(&link, &bus).await;

        assert_eq!(translator.on_command(b"abc").await, Response::Invalid);
        assert_eq!(translator.on_command(b"70000").await, Response::Invalid);
        assert!(link.writes().is_empty());
        assert_eq!(link.transactions(), 0);
        assert_eq!(
            bus.published_on("maison/reponse"),
            vec!["Commande invalide", "Commande invalide"]
        );
    }

    #[tokio::test]
    async fn test_write_failure_reports_error() {
        let link = MockLink::new();
        link.fail_next_writes(1);
        let bus = RecordingBus::new();
        let translator = translator(&link, &bus).await;

        assert_eq!(translator.on_command(b"3").await, Response::SendFailed);
        assert_eq!(translator.on_command(b"3").await, Response::Sent(3));
        assert_eq!(
            bus.published_on("maison/reponse"),
            vec!["Erreur lors de l'envoi", "Commande 3 envoyée"]
        );
    }

    #[tokio::test]
    async fn test_unconnected_link_reports_error() {
        let bus = RecordingBus::new();
        let field_bus: Arc<FieldBusClient<MockLink>> =
            Arc::new(FieldBusClient::new(Duration::from_secs(3)));
        let translator = CommandTranslator::new(field_bus, bus.clone(), 0, "maison/reponse");

        assert_eq!(translator.on_command(b"5").await, Response::SendFailed);
        assert_eq!(bus.published_on("maison/reponse"), vec!["Erreur lors de l'envoi"]);
    }

    #[tokio::test]
    async fn test_rejected_publish_still_handles_command() {
        let link = MockLink::new();
        let bus = RecordingBus::new();
        bus.reject_publish(true);
        let translator = translator(&link, &bus).await;

        assert_eq!(translator.on_command(b"9").await, Response::Sent(9));
        assert_eq!(link.writes(), vec![(0, 9)]);
        assert!(bus.published().is_empty());
    }
}
