//! Topic names and payload vocabulary shared by the bridge.

use std::fmt;

/// Default topic on which commands for the field device arrive.
pub const COMMAND_TOPIC: &str = "maison/commande";

/// Default topic on which command outcomes are published.
pub const RESPONSE_TOPIC: &str = "maison/reponse";

/// Default topic on which periodic status samples are published.
pub const STATUS_TOPIC: &str = "maison/statut";

/// Divisor applied to the raw status register to get degrees Celsius.
pub const STATUS_DIVISOR: f64 = 10.0;

/// Outcome of one inbound command, rendered as the response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// The value was written to the command register.
    Sent(u16),
    /// The field-bus write failed or timed out.
    SendFailed,
    /// The payload was not a usable integer.
    Invalid,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Sent(value) => write!(f, "Commande {} envoyée", value),
            Response::SendFailed => f.write_str("Erreur lors de l'envoi"),
            Response::Invalid => f.write_str("Commande invalide"),
        }
    }
}

/// Convert a raw status register into an engineering value.
///
/// # Example
/// ```
/// use maison_common::topics::scale_status;
///
/// assert_eq!(scale_status(257), 25.7);
/// ```
pub fn scale_status(raw: u16) -> f64 {
    f64::from(raw) / STATUS_DIVISOR
}

/// Render a status sample with one decimal place.
///
/// # Example
/// ```
/// use maison_common::topics::status_payload;
///
/// assert_eq!(status_payload(25.7), "Température: 25.7°C");
/// assert_eq!(status_payload(20.0), "Température: 20.0°C");
/// ```
pub fn status_payload(celsius: f64) -> String {
    format!("Température: {:.1}°C", celsius)
}

/// Check that a topic can be used for a plain publish or subscribe.
///
/// Wildcards are rejected because every topic here names a single channel.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#']) && !topic.contains('\0')
}
